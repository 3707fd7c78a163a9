use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;

use tracing::{trace, warn};

use crate::ctx::{capture, run_with_captured, Snapshot};
use crate::error::{Error, Result};

static NEXT_TASK: AtomicU64 = AtomicU64::new(1);

/// Attachment key under which an adapter marks the tasks it wrapped.
///
/// The value is a `bool`.  Tasks carrying it set to `true` are unwrapped
/// again when a scheduler hands them back.
pub const AUTO_WRAPPER: &str = "flow_transmit.is_auto_wrapper";

/// Identifies a task.
///
/// The id is assigned when the task is created and survives wrapping and
/// unwrapping, so schedulers can recognize a task whatever its wrapping.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Where a task is in its lifecycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// Not carrying a snapshot.
    Fresh,
    /// Carrying a snapshot and not run yet.
    Wrapped,
    /// Run at least once.  Periodic tasks stay here and keep replaying the
    /// same snapshot.
    Executed,
    /// Run once and the snapshot was released.  Running again fails.
    Released,
}

/// Options for `wrap_with`.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct WrapOptions {
    /// Drop the captured snapshot when the task runs for the first time.
    pub release_after_run: bool,
}

impl WrapOptions {
    pub fn new() -> WrapOptions {
        WrapOptions::default()
    }

    /// Sets whether the snapshot is released after the first run.
    pub fn release_after_run(mut self, yes: bool) -> WrapOptions {
        self.release_after_run = yes;
        self
    }
}

struct Carrier {
    captured: Option<Snapshot>,
    release_after_run: bool,
    executed: bool,
}

/// A unit of work that can be handed to another thread.
///
/// A plain task just runs its closure.  A wrapped task carries the snapshot
/// captured when it was wrapped, and every run replays that snapshot before
/// the closure and restores the worker's own state after it.
///
/// `R` is what the closure returns.  Executors take `Task<()>`; tasks with
/// a result go through `TransmitExecutor::submit` or are run directly.
///
/// A task also carries attachments: values stored under a string key that
/// travel with it through wrapping and unwrapping.
pub struct Task<R = ()> {
    id: TaskId,
    work: Box<dyn FnMut() -> R + Send + 'static>,
    carrier: Option<Carrier>,
    attachments: HashMap<String, Box<dyn Any + Send>>,
}

impl<R> fmt::Debug for Task<R> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("attachments", &self.attachments.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<R> Task<R> {
    /// Creates a plain task.
    ///
    /// The closure is `FnMut` so periodic schedules can run it repeatedly.
    pub fn new<F: FnMut() -> R + Send + 'static>(work: F) -> Task<R> {
        Task {
            id: TaskId(NEXT_TASK.fetch_add(1, Ordering::Relaxed)),
            work: Box::new(work),
            carrier: None,
            attachments: HashMap::new(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Checks if the task carries a snapshot.
    pub fn is_wrapped(&self) -> bool {
        self.carrier.is_some()
    }

    pub fn state(&self) -> TaskState {
        match self.carrier {
            None => TaskState::Fresh,
            Some(ref carrier) if carrier.captured.is_none() => TaskState::Released,
            Some(ref carrier) if carrier.executed => TaskState::Executed,
            Some(_) => TaskState::Wrapped,
        }
    }

    /// Returns the snapshot the task replays, if any.
    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.carrier
            .as_ref()
            .and_then(|carrier| carrier.captured.as_ref())
    }

    /// Attaches a value under `key`, replacing what was there.
    pub fn set_attachment<V: Any + Send>(&mut self, key: impl Into<String>, value: V) {
        self.attachments.insert(key.into(), Box::new(value));
    }

    /// Returns the value attached under `key` if it is a `V`.
    pub fn attachment<V: Any>(&self, key: &str) -> Option<&V> {
        self.attachments
            .get(key)
            .and_then(|value| value.downcast_ref::<V>())
    }

    /// Removes the value attached under `key`.
    ///
    /// Returns `true` if there was one.
    pub fn remove_attachment(&mut self, key: &str) -> bool {
        self.attachments.remove(key).is_some()
    }

    fn is_auto_wrapped(&self) -> bool {
        self.is_wrapped() && self.attachment::<bool>(AUTO_WRAPPER) == Some(&true)
    }

    /// Runs the task on the current thread and returns what the closure
    /// returned.
    ///
    /// For a wrapped task the captured snapshot is replayed around the
    /// closure and the thread's state is restored afterwards, also when the
    /// closure panics.  A value returned by the closure, errors included,
    /// is handed back only after the restore.  Fails with
    /// `Error::ReleasedReference` if the task released its snapshot in an
    /// earlier run.
    pub fn run(&mut self) -> Result<R> {
        let Task {
            id,
            ref mut work,
            ref mut carrier,
            ..
        } = *self;
        let carrier = match *carrier {
            None => return Ok((*work)()),
            Some(ref mut carrier) => carrier,
        };
        let captured = if carrier.release_after_run {
            carrier.captured.take()
        } else {
            carrier.captured.clone()
        };
        let captured = match captured {
            Some(captured) => captured,
            None => {
                warn!(task = %id, "ran a task after its snapshot was released");
                return Err(Error::ReleasedReference);
            }
        };
        carrier.executed = true;
        trace!(task = %id, slots = captured.len(), "running wrapped task");
        run_with_captured(&captured, || (*work)())
    }
}

impl<R: Send + 'static> Task<R> {
    /// Turns the task into one that sends the outcome of every run to
    /// `outcome`.  The returned task is plain; this one keeps its wrapping.
    pub(crate) fn reporting(mut self, outcome: mpsc::Sender<Result<R>>) -> Task<()> {
        let id = self.id;
        let mut reporting = Task::new(move || {
            // nobody waiting any more
            let _ = outcome.send(self.run());
        });
        reporting.id = id;
        reporting
    }
}

fn attach<R>(task: &mut Task<R>, captured: Snapshot, options: WrapOptions) {
    task.carrier = Some(Carrier {
        captured: Some(captured),
        release_after_run: options.release_after_run,
        executed: false,
    });
}

/// Wraps a task with the state of the current thread.
///
/// The snapshot is taken now, not when the task runs, so changes the caller
/// makes after handing the task off do not reach it.  Fails with
/// `Error::AlreadyWrapped` if the task is already wrapped.
pub fn wrap<R>(task: Task<R>) -> Result<Task<R>> {
    wrap_with(task, WrapOptions::default())
}

/// Wraps a task with the state of the current thread and explicit options.
pub fn wrap_with<R>(task: Task<R>, options: WrapOptions) -> Result<Task<R>> {
    wrap_captured(task, capture(), options)
}

fn wrap_captured<R>(mut task: Task<R>, captured: Snapshot, options: WrapOptions) -> Result<Task<R>> {
    if task.is_wrapped() {
        warn!(task = %task.id, "refusing to wrap a task twice");
        return Err(Error::AlreadyWrapped);
    }
    attach(&mut task, captured, options);
    Ok(task)
}

/// Strips the snapshot from a task.
///
/// A task that is not wrapped is returned unchanged.  Attachments stay,
/// except for the `AUTO_WRAPPER` marker.
pub fn unwrap<R>(mut task: Task<R>) -> Task<R> {
    task.carrier = None;
    task.remove_attachment(AUTO_WRAPPER);
    task
}

/// Wraps a sequence of tasks with one snapshot of the current thread.
///
/// Order is preserved and `None` entries pass through.
pub fn wrap_all<R, I>(tasks: I) -> Result<Vec<Option<Task<R>>>>
where
    I: IntoIterator<Item = Option<Task<R>>>,
{
    let captured = capture();
    tasks
        .into_iter()
        .map(|task| {
            task.map(|task| wrap_captured(task, captured.clone(), WrapOptions::default()))
                .transpose()
        })
        .collect()
}

/// Unwraps a sequence of tasks, preserving order and `None` entries.
pub fn unwrap_all<R, I>(tasks: I) -> Vec<Option<Task<R>>>
where
    I: IntoIterator<Item = Option<Task<R>>>,
{
    tasks.into_iter().map(|task| task.map(unwrap)).collect()
}

/// Wraps a task on behalf of an adapter, leaving wrapped tasks alone.
pub(crate) fn wrap_auto<R>(task: Task<R>) -> Task<R> {
    wrap_auto_captured(task, &capture())
}

pub(crate) fn wrap_auto_captured<R>(mut task: Task<R>, captured: &Snapshot) -> Task<R> {
    if !task.is_wrapped() {
        attach(&mut task, captured.clone(), WrapOptions::default());
        task.set_attachment(AUTO_WRAPPER, true);
    }
    task
}

/// Strips a snapshot only if an adapter attached it.
pub(crate) fn unwrap_auto<R>(task: Task<R>) -> Task<R> {
    if task.is_auto_wrapped() {
        unwrap(task)
    } else {
        task
    }
}

/// Turns a closure into one that runs with the current thread's state.
///
/// Meant for handoffs that are not tasks, such as `thread::spawn`:
///
/// ```
/// # #[macro_use] extern crate flow_transmit;
/// # use std::thread;
/// flow_local!(static USER: String);
/// # fn main() {
/// USER.set("alice".into());
/// let seen = thread::spawn(flow_transmit::transmit(|| USER.get_cloned()))
///     .join()
///     .unwrap();
/// assert_eq!(seen.as_deref(), Some("alice"));
/// # }
/// ```
pub fn transmit<F, R>(f: F) -> impl FnOnce() -> R + Send + 'static
where
    F: FnOnce() -> R + Send + 'static,
{
    let captured = capture();
    move || captured.run(f)
}
