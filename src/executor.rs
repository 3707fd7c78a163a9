use std::fmt;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::ctx::capture;
use crate::error::Result;
use crate::task::{unwrap_auto, wrap_auto, wrap_auto_captured, Task, TaskId};

/// Something that runs tasks on worker threads.
///
/// How tasks are queued and which thread runs them is up to the
/// implementation.  Implementations are expected to call `Task::run` and
/// deal with its error themselves.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Task);

    /// Submits many tasks at once, in order.
    fn execute_all(&self, tasks: Vec<Task>) {
        for task in tasks {
            self.execute(task);
        }
    }
}

/// An executor that can also delay and repeat tasks.
pub trait Scheduler: Executor {
    /// Runs a task once after a delay.
    fn schedule(&self, task: Task, delay: Duration) -> TaskId;

    /// Runs a task repeatedly, first after `initial_delay` and then every
    /// `period`.
    fn schedule_at_fixed_rate(&self, task: Task, initial_delay: Duration, period: Duration)
        -> TaskId;

    /// Removes a task that has not started yet and hands it back.
    fn cancel(&self, id: TaskId) -> Option<Task>;

    /// Returns the ids of the tasks still waiting to run.
    fn pending(&self) -> Vec<TaskId>;
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn execute(&self, task: Task) {
        (**self).execute(task)
    }

    fn execute_all(&self, tasks: Vec<Task>) {
        (**self).execute_all(tasks)
    }
}

impl<S: Scheduler + ?Sized> Scheduler for Arc<S> {
    fn schedule(&self, task: Task, delay: Duration) -> TaskId {
        (**self).schedule(task, delay)
    }

    fn schedule_at_fixed_rate(
        &self,
        task: Task,
        initial_delay: Duration,
        period: Duration,
    ) -> TaskId {
        (**self).schedule_at_fixed_rate(task, initial_delay, period)
    }

    fn cancel(&self, id: TaskId) -> Option<Task> {
        (**self).cancel(id)
    }

    fn pending(&self) -> Vec<TaskId> {
        (**self).pending()
    }
}

/// An executor that wraps every task submitted through it.
///
/// Each task carries the submitting thread's state as it was at
/// submission.  Tasks the caller already wrapped are passed on untouched,
/// and tasks handed back by `cancel` are unwrapped again if this adapter
/// wrapped them.
///
/// ## Example
///
/// ```
/// # #[macro_use] extern crate flow_transmit;
/// # use std::sync::mpsc;
/// # use std::thread;
/// # use flow_transmit::{adapt, Executor, Task};
/// struct SpawnPerTask;
///
/// impl Executor for SpawnPerTask {
///     fn execute(&self, mut task: Task) {
///         thread::spawn(move || task.run().unwrap());
///     }
/// }
///
/// flow_local!(static LOCALE: String);
/// # fn main() {
/// let executor = adapt(SpawnPerTask);
/// let (tx, rx) = mpsc::channel();
/// LOCALE.set("de_DE".into());
/// executor.execute(Task::new(move || tx.send(LOCALE.get_cloned()).unwrap()));
/// assert_eq!(rx.recv().unwrap().as_deref(), Some("de_DE"));
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct TransmitExecutor<E> {
    inner: E,
}

/// Adapts an executor so that every submitted task is wrapped.
pub fn adapt<E>(inner: E) -> TransmitExecutor<E> {
    TransmitExecutor { inner }
}

/// The outcome of a task handed to `TransmitExecutor::submit`.
pub struct Pending<R> {
    id: TaskId,
    outcome: mpsc::Receiver<Result<R>>,
}

impl<R> fmt::Debug for Pending<R> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Pending").field("id", &self.id).finish()
    }
}

impl<R> Pending<R> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Blocks until the task ran and returns its outcome.
    ///
    /// The outcome is whatever `Task::run` returned on the worker, so it is
    /// only delivered once the worker's state was restored.  `None` means
    /// the task was dropped without finishing, because its work panicked or
    /// the executor discarded it.
    pub fn wait(self) -> Option<Result<R>> {
        self.outcome.recv().ok()
    }

    /// Returns the outcome if the task already finished.
    pub fn try_wait(&self) -> Option<Result<R>> {
        self.outcome.try_recv().ok()
    }
}

impl<E> TransmitExecutor<E> {
    pub fn inner(&self) -> &E {
        &self.inner
    }

    /// Returns the adapted executor.
    pub fn into_inner(self) -> E {
        self.inner
    }
}

impl<E: Executor> TransmitExecutor<E> {
    /// Submits a task and hands back a handle to what it returns.
    ///
    /// The task is wrapped like any other submission.  The executor
    /// receives a plain task under the same id that runs it and reports the
    /// outcome.
    ///
    /// ```
    /// # #[macro_use] extern crate flow_transmit;
    /// # use std::thread;
    /// # use flow_transmit::{adapt, Executor, Task};
    /// struct SpawnPerTask;
    ///
    /// impl Executor for SpawnPerTask {
    ///     fn execute(&self, mut task: Task) {
    ///         thread::spawn(move || task.run().unwrap());
    ///     }
    /// }
    ///
    /// flow_local!(static QUOTA: u32);
    /// # fn main() {
    /// let executor = adapt(SpawnPerTask);
    /// QUOTA.set(3);
    /// let pending = executor.submit(Task::new(|| match QUOTA.get_cloned() {
    ///     Some(quota) if quota > 5 => Ok(quota),
    ///     _ => Err("quota too small"),
    /// }));
    /// assert_eq!(pending.wait(), Some(Ok(Err("quota too small"))));
    /// # }
    /// ```
    pub fn submit<R: Send + 'static>(&self, task: Task<R>) -> Pending<R> {
        let id = task.id();
        let (report, outcome) = mpsc::channel();
        trace!(task = %id, "submitting task with result");
        self.inner.execute(wrap_auto(task).reporting(report));
        Pending { id, outcome }
    }
}

impl<E: Executor> Executor for TransmitExecutor<E> {
    fn execute(&self, task: Task) {
        self.inner.execute(wrap_auto(task))
    }

    fn execute_all(&self, tasks: Vec<Task>) {
        let captured = capture();
        trace!(tasks = tasks.len(), "wrapping submitted tasks");
        let tasks = tasks
            .into_iter()
            .map(|task| wrap_auto_captured(task, &captured))
            .collect();
        self.inner.execute_all(tasks)
    }
}

impl<E: Scheduler> Scheduler for TransmitExecutor<E> {
    fn schedule(&self, task: Task, delay: Duration) -> TaskId {
        self.inner.schedule(wrap_auto(task), delay)
    }

    fn schedule_at_fixed_rate(
        &self,
        task: Task,
        initial_delay: Duration,
        period: Duration,
    ) -> TaskId {
        self.inner
            .schedule_at_fixed_rate(wrap_auto(task), initial_delay, period)
    }

    fn cancel(&self, id: TaskId) -> Option<Task> {
        self.inner.cancel(id).map(unwrap_auto)
    }

    fn pending(&self) -> Vec<TaskId> {
        self.inner.pending()
    }
}
