use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::panic;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::{error, trace};

use crate::data::{self, Held, Locals, NullPolicy, Slot, SlotId, Value};
use crate::error::{Error, Result};
use crate::registry::{Entry, Origin, Registry};

static NEXT_REPLAY: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // tokens of the outstanding replays of this thread, innermost last
    static REPLAYS: RefCell<Vec<u64>> = RefCell::new(Vec::new());
}

#[derive(Clone)]
struct Captured {
    id: SlotId,
    origin: Origin,
    slot: Arc<dyn Slot>,
    value: Option<Value>,
}

/// A point in time capture of the propagated variables of one thread.
///
/// A snapshot holds a copy (made with each variable's copy strategy) of
/// every registered variable that held a value when it was taken.  It is
/// immutable and independent of anything the capturing thread does
/// afterwards.
///
/// Snapshots are cheap to clone and can be sent and shared between
/// threads.  This permits one capture to be replayed by many workers, for
/// instance by the successive runs of a periodic task.
#[derive(Clone, Default)]
pub struct Snapshot {
    inner: Arc<Vec<Captured>>,
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries(self.inner.iter().map(|captured| captured.slot.name()))
            .finish()
    }
}

impl Snapshot {
    /// Captures the propagated variables of the current thread.
    ///
    /// Variables without a value are skipped, and so are null values unless
    /// the variable opted into `NullPolicy::DisableIgnoreNull`.
    ///
    /// ## Example
    ///
    /// ```
    /// # #[macro_use] extern crate flow_transmit;
    /// # use flow_transmit::Snapshot;
    /// flow_local!(static TENANT: String);
    /// # fn main() {
    /// TENANT.set("acme".into());
    /// let snapshot = Snapshot::capture();
    /// TENANT.set("initech".into());
    /// snapshot.run(|| {
    ///     // the value as it was at capture time
    ///     assert_eq!(TENANT.get_cloned().as_deref(), Some("acme"));
    /// });
    /// assert_eq!(TENANT.get_cloned().as_deref(), Some("initech"));
    /// # }
    /// ```
    pub fn capture() -> Snapshot {
        capture_matching(|_| true)
    }

    /// Captures only the variables a new thread inherits from its creator.
    ///
    /// Plain thread locals are never inherited.
    pub(crate) fn capture_inheritable() -> Snapshot {
        capture_matching(|entry| entry.origin == Origin::Declared)
    }

    /// Returns the number of captured variables.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Checks if a variable was captured.
    pub fn contains(&self, id: SlotId) -> bool {
        self.inner.iter().any(|captured| captured.id == id)
    }

    /// Runs a function with this snapshot replayed on the current thread.
    ///
    /// The previous state of the thread is restored afterwards, also when
    /// the function panics.  The panic is then resumed.
    ///
    /// ## Panics
    ///
    /// Panics if the function leaves a replay of its own outstanding, which
    /// makes the restore mismatched.  Use `run_with_captured` to get that
    /// reported as an error instead.
    pub fn run<F: FnOnce() -> R, R>(&self, f: F) -> R {
        match run_with_captured(self, f) {
            Ok(rv) => rv,
            Err(err) => panic!("{}", err),
        }
    }
}

fn capture_matching<P: Fn(&Entry) -> bool>(include: P) -> Snapshot {
    let entries = Registry::global().entries();
    let mut captured = Vec::with_capacity(entries.len());
    for (id, entry) in entries.iter() {
        if !include(entry) {
            continue;
        }
        let value = match entry.slot.load() {
            Held::Absent => continue,
            Held::Null if entry.null_policy == NullPolicy::IgnoreNullOnCapture => continue,
            Held::Null => None,
            Held::Value(ref value) => Some(entry.copier.copy(value)),
        };
        captured.push(Captured {
            id: *id,
            origin: entry.origin,
            slot: entry.slot.clone(),
            value,
        });
    }
    trace!(registered = entries.len(), captured = captured.len(), "captured snapshot");
    Snapshot {
        inner: Arc::new(captured),
    }
}

struct Saved {
    slot: Arc<dyn Slot>,
    held: Held,
}

/// The state a thread held before a replay.
///
/// A backup is produced by `replay` or `clear` and hands the thread back
/// its own state once consumed by `restore`.  It cannot leave the thread
/// it was made on, and as `restore` takes it by value it is restored at
/// most once.
///
/// Replays nest: a backup should be restored while it is the innermost
/// outstanding replay of its thread.  Restoring an outer backup abandons
/// the replays nested in it, restores the state anyway and reports
/// `Error::MismatchedRestore`.  A backup that is dropped without being
/// restored restores itself.  If that restore is mismatched the drop
/// panics, unless the thread is already panicking.
#[must_use = "the previous state is restored when the backup is restored or dropped"]
pub struct Backup {
    token: u64,
    locals: Locals,
    saved: Vec<Saved>,
    armed: bool,
    // the Rc is to make it non send
    _not_send: PhantomData<Rc<()>>,
}

impl fmt::Debug for Backup {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Backup")
            .field("token", &self.token)
            .field("flow_locals", &self.locals.len())
            .field("thread_locals", &self.saved.len())
            .finish()
    }
}

impl Backup {
    fn restore_now(&mut self) -> Result<()> {
        self.armed = false;
        let abandoned = REPLAYS.with(|replays| {
            let mut replays = replays.borrow_mut();
            let position = replays.iter().rposition(|&token| token == self.token)?;
            let abandoned = replays.len() - position - 1;
            replays.truncate(position);
            Some(abandoned)
        });
        let abandoned = match abandoned {
            Some(abandoned) => abandoned,
            None => {
                error!(token = self.token, "restore of a replay that is no longer outstanding");
                return Err(Error::MismatchedRestore);
            }
        };

        for saved in self.saved.drain(..) {
            saved.slot.reset(saved.held);
        }
        data::reset_locals(mem::take(&mut self.locals));

        if abandoned > 0 {
            error!(token = self.token, abandoned, "restore abandoned nested replays");
            return Err(Error::MismatchedRestore);
        }
        trace!(token = self.token, "restored backup");
        Ok(())
    }
}

impl Drop for Backup {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = self.restore_now() {
            if thread::panicking() {
                error!("dropped backup while unwinding: {}", err);
            } else {
                panic!("{}", err);
            }
        }
    }
}

fn install(snapshot: Option<&Snapshot>) -> Backup {
    let entries = Registry::global().entries();
    let locals = data::locals();

    // flow locals are covered by the map above; only plain thread locals
    // need to be read one by one
    let mut saved: Vec<Saved> = entries
        .values()
        .filter(|entry| entry.origin == Origin::ThreadLocal)
        .map(|entry| Saved {
            slot: entry.slot.clone(),
            held: entry.slot.load(),
        })
        .collect();

    match snapshot {
        Some(snapshot) => {
            for captured in snapshot.inner.iter() {
                // unregistered since the capture, still needs restoring
                if captured.origin == Origin::ThreadLocal && !entries.contains_key(&captured.id) {
                    saved.push(Saved {
                        slot: captured.slot.clone(),
                        held: captured.slot.load(),
                    });
                }
                captured.slot.store(captured.value.clone());
            }
        }
        None => {
            for saved in &saved {
                saved.slot.clear();
            }
            data::reset_locals(Locals::new());
        }
    }

    let token = NEXT_REPLAY.fetch_add(1, Ordering::Relaxed);
    REPLAYS.with(|replays| replays.borrow_mut().push(token));
    trace!(
        token,
        installed = snapshot.map_or(0, Snapshot::len),
        thread_locals = saved.len(),
        "replayed snapshot"
    );
    Backup {
        token,
        locals,
        saved,
        armed: true,
        _not_send: PhantomData,
    }
}

/// Captures the propagated variables of the current thread.
///
/// Same as `Snapshot::capture`.
pub fn capture() -> Snapshot {
    Snapshot::capture()
}

/// Installs a snapshot on the current thread.
///
/// The state of every registered variable is backed up first.  Variables
/// the snapshot holds are then set to the captured values; all others keep
/// whatever the thread held.
///
/// Backing up the flow locals of a thread is O(1).  Registered plain
/// thread locals are read and cloned one by one, so each of them adds to
/// the cost of every replay.
pub fn replay(snapshot: &Snapshot) -> Backup {
    install(Some(snapshot))
}

/// Removes the value of every registered variable on the current thread.
///
/// This is the same as replaying a snapshot in which nothing was set.
pub fn clear() -> Backup {
    install(None)
}

/// Hands the current thread back the state recorded in a backup.
///
/// Variables that were absent before the replay are removed again.
///
/// This fails with `Error::MismatchedRestore` if the backup is not the
/// innermost outstanding replay of this thread.  If it is still
/// outstanding, the replays nested in it are abandoned and the state is
/// restored regardless, so a worker never keeps state leaked by a task.
/// Restoring an abandoned backup changes nothing.
pub fn restore(backup: Backup) -> Result<()> {
    let mut backup = backup;
    backup.restore_now()
}

fn bracket<F: FnOnce() -> R, R>(backup: Backup, f: F) -> Result<R> {
    let rv = panic::catch_unwind(panic::AssertUnwindSafe(f));
    let restored = restore(backup);
    match rv {
        Err(err) => panic::resume_unwind(err),
        Ok(rv) => restored.map(|()| rv),
    }
}

/// Runs a function with a snapshot replayed on the current thread.
///
/// The previous state is restored on every exit path.  A panic in `f`
/// is resumed after the restore.
///
/// ## Example
///
/// ```
/// # #[macro_use] extern crate flow_transmit;
/// # use std::thread;
/// # use flow_transmit::{capture, run_with_captured};
/// flow_local!(static TRACE_ID: u64);
/// # fn main() {
/// TRACE_ID.set(7);
/// let snapshot = capture();
/// thread::spawn(move || {
///     let seen = run_with_captured(&snapshot, || TRACE_ID.get_cloned()).unwrap();
///     assert_eq!(seen, Some(7));
///     assert_eq!(TRACE_ID.get_cloned(), None);
/// }).join().unwrap();
/// # }
/// ```
pub fn run_with_captured<F: FnOnce() -> R, R>(snapshot: &Snapshot, f: F) -> Result<R> {
    bracket(replay(snapshot), f)
}

/// Runs a function with all registered variables removed.
pub fn run_with_cleared<F: FnOnce() -> R, R>(f: F) -> Result<R> {
    bracket(clear(), f)
}
