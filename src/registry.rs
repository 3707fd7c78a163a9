use std::any::type_name;
use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;
use std::thread::LocalKey;

use im::HashMap;
use parking_lot::{RwLock, RwLockWriteGuard};
use tracing::debug;

use crate::data::{Copier, CopyStrategy, DeclaredSlot, Held, NullPolicy, Slot, SlotId, Value};

lazy_static! {
    static ref GLOBAL_REGISTRY: Registry = Registry::new();
}

/// Where a registered slot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    /// A `FlowLocal`, registered implicitly on first use.
    Declared,
    /// A plain `thread_local!` registered explicitly.
    ThreadLocal,
}

#[derive(Clone)]
pub(crate) struct Entry {
    pub(crate) slot: Arc<dyn Slot>,
    pub(crate) copier: Copier,
    pub(crate) null_policy: NullPolicy,
    pub(crate) origin: Origin,
}

/// The set of variables that take part in propagation.
///
/// There is one registry per process, reachable through
/// [`Registry::global`].  It starts out empty; flow locals add themselves
/// the first time they are used and plain thread locals are added and
/// removed explicitly.  There is no way to reset it as a whole.
///
/// The entries are kept in a persistent map.  Capturing clones the map
/// under the read lock, which is O(1), and then works on that clone, so a
/// capture racing with a registration sees the slot either fully
/// registered or not at all.
pub struct Registry {
    entries: RwLock<HashMap<SlotId, Entry>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Registry")
            .field("slots", &self.entries.read().len())
            .finish()
    }
}

impl Registry {
    pub(crate) fn new() -> Registry {
        Registry {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the process wide registry.
    pub fn global() -> &'static Registry {
        &GLOBAL_REGISTRY
    }

    /// Registers a plain thread local for propagation.
    ///
    /// Returns `true` if the variable was newly registered.  Registering a
    /// variable twice keeps the first copy strategy and returns `false`
    /// unless `force` is set, in which case the strategy is replaced and
    /// `true` is returned.
    ///
    /// Unlike flow locals, registered thread locals are not inherited by
    /// threads created through an inheriting thread factory.
    ///
    /// ## Example
    ///
    /// ```
    /// # use std::cell::RefCell;
    /// # use flow_transmit::{CopyStrategy, Registry, Snapshot};
    /// thread_local!(static USER: RefCell<Option<String>> = RefCell::new(None));
    ///
    /// let registry = Registry::global();
    /// assert!(registry.register_thread_local(&USER, CopyStrategy::Identity, false));
    /// assert!(!registry.register_thread_local(&USER, CopyStrategy::Identity, false));
    ///
    /// USER.with(|user| *user.borrow_mut() = Some("alice".into()));
    /// let snapshot = Snapshot::capture();
    /// std::thread::spawn(move || {
    ///     snapshot.run(|| {
    ///         assert_eq!(USER.with(|user| user.borrow().clone()).as_deref(), Some("alice"));
    ///     });
    /// }).join().unwrap();
    /// ```
    pub fn register_thread_local<T>(
        &self,
        key: &'static LocalKey<RefCell<Option<T>>>,
        strategy: CopyStrategy<T>,
        force: bool,
    ) -> bool
    where
        T: Clone + Send + Sync + 'static,
    {
        let slot = Arc::new(ThreadLocalSlot { key });
        let storage = slot.storage();
        let (id, replaced) = {
            let (mut entries, existing) = self.lock_for_thread_local(storage);
            if !force && existing.is_some() {
                return false;
            }
            let id = existing.unwrap_or_else(SlotId::next);
            let entry = Entry {
                slot,
                copier: Copier::of(strategy),
                null_policy: NullPolicy::IgnoreNullOnCapture,
                origin: Origin::ThreadLocal,
            };
            (id, entries.insert(id, entry).is_some())
        };
        debug!(slot = ?id, name = type_name::<T>(), replaced, "registered thread local");
        true
    }

    /// Removes a plain thread local from propagation.
    ///
    /// Returns `true` if it was registered.
    pub fn unregister_thread_local<T>(&self, key: &'static LocalKey<RefCell<Option<T>>>) -> bool
    where
        T: Clone + Send + Sync + 'static,
    {
        let storage = ThreadLocalSlot { key }.storage();
        let id = {
            let (mut entries, existing) = self.lock_for_thread_local(storage);
            match existing {
                Some(id) => {
                    entries.remove(&id);
                    id
                }
                None => return false,
            }
        };
        debug!(slot = ?id, "unregistered thread local");
        true
    }

    /// Returns the identity a plain thread local is registered under.
    pub fn thread_local_id<T>(&self, key: &'static LocalKey<RefCell<Option<T>>>) -> Option<SlotId>
    where
        T: Clone + Send + Sync + 'static,
    {
        let storage = ThreadLocalSlot { key }.storage();
        find_thread_local(&self.entries(), storage)
    }

    /// Takes the write lock together with the id `storage` is registered
    /// under.
    ///
    /// Reading a thread local's storage can run its initializer, which may
    /// touch the registry, so the lookup happens on a view taken without
    /// any lock held.  The lock is only kept if nothing was registered or
    /// unregistered in between.
    fn lock_for_thread_local(
        &self,
        storage: Option<usize>,
    ) -> (RwLockWriteGuard<'_, HashMap<SlotId, Entry>>, Option<SlotId>) {
        loop {
            let view = self.entries();
            let existing = find_thread_local(&view, storage);
            let entries = self.entries.write();
            if entries.ptr_eq(&view) {
                return (entries, existing);
            }
        }
    }

    /// Returns the identities of all registered slots.
    pub fn registered_slots(&self) -> Vec<SlotId> {
        self.entries.read().keys().copied().collect()
    }

    /// Checks if a slot is registered.
    pub fn is_registered(&self, id: SlotId) -> bool {
        self.entries.read().contains_key(&id)
    }

    /// Returns the number of registered slots.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub(crate) fn register_declared(
        &self,
        id: SlotId,
        name: &'static str,
        copier: Copier,
        null_policy: NullPolicy,
    ) -> bool {
        let mut entries = self.entries.write();
        if entries.contains_key(&id) {
            return false;
        }
        let entry = Entry {
            slot: Arc::new(DeclaredSlot { id, name }),
            copier,
            null_policy,
            origin: Origin::Declared,
        };
        entries.insert(id, entry);
        debug!(slot = ?id, name, "registered flow local");
        true
    }

    /// Returns a point in time view of all entries.
    pub(crate) fn entries(&self) -> HashMap<SlotId, Entry> {
        self.entries.read().clone()
    }
}

fn find_thread_local(entries: &HashMap<SlotId, Entry>, storage: Option<usize>) -> Option<SlotId> {
    entries
        .iter()
        .find(|&(_, entry)| entry.origin == Origin::ThreadLocal && entry.slot.storage() == storage)
        .map(|(id, _)| *id)
}

/// A registered `thread_local!` holding an optional value.
struct ThreadLocalSlot<T: 'static> {
    key: &'static LocalKey<RefCell<Option<T>>>,
}

impl<T: Clone + Send + Sync + 'static> Slot for ThreadLocalSlot<T> {
    fn name(&self) -> &'static str {
        type_name::<T>()
    }

    fn load(&self) -> Held {
        self.key.with(|cell| match *cell.borrow() {
            Some(ref value) => Held::Value(Arc::new(value.clone())),
            None => Held::Absent,
        })
    }

    fn store(&self, value: Option<Value>) {
        let value = value.and_then(|value| (*value).downcast_ref::<T>().cloned());
        self.key.with(|cell| *cell.borrow_mut() = value);
    }

    fn clear(&self) {
        self.key.with(|cell| *cell.borrow_mut() = None);
    }

    fn storage(&self) -> Option<usize> {
        Some(self.key.with(|cell| cell as *const RefCell<Option<T>> as usize))
    }
}
