use std::any::{type_name, Any};
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use im::HashMap;

use crate::registry::Registry;

/// Type erased value as it travels between threads.
pub(crate) type Value = Arc<dyn Any + Send + Sync>;

static NEXT_SLOT: AtomicUsize = AtomicUsize::new(1);

/// The flow-local values of one thread.  `None` is null.
pub(crate) type Locals = HashMap<SlotId, Option<Value>>;

thread_local! {
    static LOCALS: RefCell<Locals> = RefCell::new(HashMap::new());
}

/// Returns the flow-local values of the current thread, in O(1).
pub(crate) fn locals() -> Locals {
    LOCALS.with(|locals| locals.borrow().clone())
}

/// Replaces the flow-local values of the current thread.
pub(crate) fn reset_locals(values: Locals) {
    LOCALS.with(|locals| *locals.borrow_mut() = values);
}

/// Identifies a propagated variable for the lifetime of the process.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(usize);

impl SlotId {
    pub(crate) fn next() -> SlotId {
        SlotId(NEXT_SLOT.fetch_add(1, Ordering::Relaxed))
    }
}

/// What a thread currently holds for a slot.
#[derive(Clone)]
pub(crate) enum Held {
    Absent,
    Null,
    Value(Value),
}

/// Type erased access to the per-thread value of a propagated variable.
pub(crate) trait Slot: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Reads the calling thread's value without initializing it.
    fn load(&self) -> Held;

    /// Installs a value (`None` being null) on the calling thread.
    fn store(&self, value: Option<Value>);

    /// Removes the calling thread's value.
    fn clear(&self);

    /// Address of the calling thread's storage for plain thread locals.
    ///
    /// Two thread locals are the same variable exactly when their storage
    /// on one thread is the same.
    fn storage(&self) -> Option<usize> {
        None
    }

    fn reset(&self, held: Held) {
        match held {
            Held::Absent => self.clear(),
            Held::Null => self.store(None),
            Held::Value(value) => self.store(Some(value)),
        }
    }
}

/// How a value is copied when it is captured for another thread.
pub enum CopyStrategy<T> {
    /// The captured value is the parent's value itself.
    ///
    /// Values are held behind an `Arc`, so interior mutations are visible
    /// on both sides while reassignments never are.
    Identity,
    /// The captured value is produced from the parent's value.
    ShadowCopy(fn(&T) -> T),
    /// The captured value is produced fresh, ignoring the parent's value.
    Reinitialize(fn() -> T),
}

impl<T> Clone for CopyStrategy<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for CopyStrategy<T> {}

impl<T> fmt::Debug for CopyStrategy<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            CopyStrategy::Identity => f.write_str("Identity"),
            CopyStrategy::ShadowCopy(_) => f.write_str("ShadowCopy(..)"),
            CopyStrategy::Reinitialize(_) => f.write_str("Reinitialize(..)"),
        }
    }
}

/// A copy strategy with the value type erased.
#[derive(Clone)]
pub(crate) enum Copier {
    Identity,
    Map(Arc<dyn Fn(&Value) -> Value + Send + Sync>),
}

impl Copier {
    pub(crate) fn of<T: Send + Sync + 'static>(strategy: CopyStrategy<T>) -> Copier {
        match strategy {
            CopyStrategy::Identity => Copier::Identity,
            CopyStrategy::ShadowCopy(copy) => Copier::Map(Arc::new(move |value: &Value| {
                match (**value).downcast_ref::<T>() {
                    Some(parent) => Arc::new(copy(parent)) as Value,
                    None => value.clone(),
                }
            })),
            CopyStrategy::Reinitialize(init) => {
                Copier::Map(Arc::new(move |_: &Value| Arc::new(init()) as Value))
            }
        }
    }

    pub(crate) fn copy(&self, value: &Value) -> Value {
        match *self {
            Copier::Identity => value.clone(),
            Copier::Map(ref copy) => copy(value),
        }
    }
}

/// Controls whether a null value takes part in propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NullPolicy {
    /// Setting null removes the value: it is not captured, and the next
    /// `get` on the same thread runs the initializer again.
    #[default]
    IgnoreNullOnCapture,
    /// Null is stored, captured and propagated like any other value.
    DisableIgnoreNull,
}

/// Declares a new flow-local variable.
///
/// The variable registers itself for propagation the first time it is
/// touched on any thread.  An optional expression provides the value that
/// `get` installs when the current thread holds none.
///
/// ```
/// # #[macro_use] extern crate flow_transmit;
/// flow_local!(static LOCALE: String = "en_US".to_string());
/// flow_local!(static REQUEST_ID: u64);
/// # fn main() {
/// assert_eq!(LOCALE.get_cloned().as_deref(), Some("en_US"));
/// assert_eq!(REQUEST_ID.get_cloned(), None);
/// # }
/// ```
#[macro_export]
macro_rules! flow_local {
    ($(#[$attr:meta])* $vis:vis static $name:ident : $t:ty = $init:expr) => {
        $(#[$attr])*
        $vis static $name: $crate::FlowLocal<$t> = $crate::FlowLocal::with_initializer({
            fn __init() -> $t {
                $init
            }
            __init
        });
    };
    ($(#[$attr:meta])* $vis:vis static $name:ident : $t:ty) => {
        $(#[$attr])*
        $vis static $name: $crate::FlowLocal<$t> = $crate::FlowLocal::new();
    };
}

/// A variable whose value is local to the current thread and carried along
/// with every task that captures it.
///
/// Use the `flow_local!` macro for the common case, or build one in a
/// `static` with the const builder methods when a custom copy strategy or
/// null policy is needed:
///
/// ```
/// # use flow_transmit::{CopyStrategy, FlowLocal, NullPolicy};
/// static BAGGAGE: FlowLocal<Vec<String>> = FlowLocal::new()
///     .copy_strategy(CopyStrategy::ShadowCopy(|parent: &Vec<String>| parent.clone()))
///     .null_policy(NullPolicy::DisableIgnoreNull);
/// ```
///
/// Flow locals must live in a `static`: the variable's identity is assigned
/// on first use and stored in the item itself.
pub struct FlowLocal<T> {
    id: AtomicUsize,
    init: Option<fn() -> T>,
    strategy: CopyStrategy<T>,
    null_policy: NullPolicy,
    registered: AtomicBool,
}

impl<T> FlowLocal<T> {
    /// Creates a flow local without an initializer.
    pub const fn new() -> FlowLocal<T> {
        FlowLocal {
            id: AtomicUsize::new(0),
            init: None,
            strategy: CopyStrategy::Identity,
            null_policy: NullPolicy::IgnoreNullOnCapture,
            registered: AtomicBool::new(false),
        }
    }

    /// Creates a flow local whose absent value is produced by `init`.
    pub const fn with_initializer(init: fn() -> T) -> FlowLocal<T> {
        FlowLocal {
            id: AtomicUsize::new(0),
            init: Some(init),
            strategy: CopyStrategy::Identity,
            null_policy: NullPolicy::IgnoreNullOnCapture,
            registered: AtomicBool::new(false),
        }
    }

    /// Sets how the value is copied on capture.
    pub const fn copy_strategy(self, strategy: CopyStrategy<T>) -> FlowLocal<T> {
        FlowLocal {
            id: AtomicUsize::new(0),
            init: self.init,
            strategy,
            null_policy: self.null_policy,
            registered: AtomicBool::new(false),
        }
    }

    /// Sets how null values are treated.
    pub const fn null_policy(self, null_policy: NullPolicy) -> FlowLocal<T> {
        FlowLocal {
            id: AtomicUsize::new(0),
            init: self.init,
            strategy: self.strategy,
            null_policy,
            registered: AtomicBool::new(false),
        }
    }
}

impl<T: Send + Sync + 'static> FlowLocal<T> {
    /// Returns the identity of this variable.
    pub fn id(&'static self) -> SlotId {
        let id = self.id.load(Ordering::Acquire);
        if id != 0 {
            return SlotId(id);
        }
        let fresh = SlotId::next();
        match self
            .id
            .compare_exchange(0, fresh.0, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => fresh,
            Err(existing) => SlotId(existing),
        }
    }

    fn ensure_registered(&'static self) {
        if !self.registered.load(Ordering::Acquire) {
            Registry::global().register_declared(
                self.id(),
                type_name::<T>(),
                Copier::of(self.strategy),
                self.null_policy,
            );
            self.registered.store(true, Ordering::Release);
        }
    }

    /// Returns the value of the current thread.
    ///
    /// If the thread holds no value the initializer runs and its result is
    /// stored first.  `None` means the thread holds null.
    pub fn get(&'static self) -> Option<Arc<T>> {
        self.ensure_registered();
        let id = self.id();
        let value = match LOCALS.with(|locals| locals.borrow().get(&id).cloned()) {
            Some(value) => value,
            None => {
                // the initializer may touch other flow locals, so it runs
                // without the map borrowed.
                let value = self.init.map(|init| Arc::new(init()) as Value);
                LOCALS.with(|locals| locals.borrow_mut().insert(id, value.clone()));
                value
            }
        };
        value.and_then(|value| value.downcast::<T>().ok())
    }

    /// Returns a clone of the current thread's value.
    pub fn get_cloned(&'static self) -> Option<T>
    where
        T: Clone,
    {
        self.get().map(|value| (*value).clone())
    }

    /// Checks if the current thread holds a value or null, without running
    /// the initializer.
    pub fn is_set(&'static self) -> bool {
        let id = self.id();
        LOCALS.with(|locals| locals.borrow().contains_key(&id))
    }

    /// Sets the value of the current thread.
    pub fn set(&'static self, value: T) {
        self.set_arc(Arc::new(value));
    }

    /// Sets the value of the current thread to an already shared value.
    pub fn set_arc(&'static self, value: Arc<T>) {
        self.ensure_registered();
        let id = self.id();
        LOCALS.with(|locals| locals.borrow_mut().insert(id, Some(value as Value)));
    }

    /// Sets the current thread's value to null.
    ///
    /// Under `NullPolicy::IgnoreNullOnCapture` this is the same as `remove`.
    pub fn set_null(&'static self) {
        if self.null_policy == NullPolicy::IgnoreNullOnCapture {
            return self.remove();
        }
        self.ensure_registered();
        let id = self.id();
        LOCALS.with(|locals| locals.borrow_mut().insert(id, None));
    }

    /// Removes the value of the current thread.
    pub fn remove(&'static self) {
        self.ensure_registered();
        let id = self.id();
        LOCALS.with(|locals| locals.borrow_mut().remove(&id));
    }
}

impl<T> Default for FlowLocal<T> {
    fn default() -> FlowLocal<T> {
        FlowLocal::new()
    }
}

impl<T> fmt::Debug for FlowLocal<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FlowLocal")
            .field("type", &type_name::<T>())
            .field("strategy", &self.strategy)
            .field("null_policy", &self.null_policy)
            .finish()
    }
}

/// The slot behind a `FlowLocal`, living in the per-thread map.
pub(crate) struct DeclaredSlot {
    pub(crate) id: SlotId,
    pub(crate) name: &'static str,
}

impl Slot for DeclaredSlot {
    fn name(&self) -> &'static str {
        self.name
    }

    fn load(&self) -> Held {
        LOCALS.with(|locals| match locals.borrow().get(&self.id) {
            None => Held::Absent,
            Some(None) => Held::Null,
            Some(Some(value)) => Held::Value(value.clone()),
        })
    }

    fn store(&self, value: Option<Value>) {
        LOCALS.with(|locals| locals.borrow_mut().insert(self.id, value));
    }

    fn clear(&self) {
        LOCALS.with(|locals| locals.borrow_mut().remove(&self.id));
    }
}
