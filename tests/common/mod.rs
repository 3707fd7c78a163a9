#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Once};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flow_transmit::{Error, Executor, Scheduler, Task, TaskId, ThreadFactory};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("flow_transmit=trace"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Runs a closure once as a plain task.
pub fn once<F: FnOnce() + Send + 'static>(f: F) -> Task {
    let mut f = Some(f);
    Task::new(move || {
        if let Some(f) = f.take() {
            f();
        }
    })
}

enum Message {
    Run(Task),
    Sync(mpsc::Sender<()>),
}

/// A fixed set of long lived workers fed in round robin order.
pub struct RoundRobinPool {
    senders: Vec<Mutex<Option<mpsc::Sender<Message>>>>,
    handles: Vec<JoinHandle<()>>,
    next: AtomicUsize,
    failures: Arc<Mutex<Vec<Error>>>,
}

impl RoundRobinPool {
    /// Starts `size` workers, each running `init` with its index first.
    pub fn new<T, I>(factory: &T, size: usize, init: I) -> RoundRobinPool
    where
        T: ThreadFactory,
        I: Fn(usize) + Send + Sync + 'static,
    {
        let init = Arc::new(init);
        let failures = Arc::new(Mutex::new(Vec::new()));
        let mut senders = Vec::new();
        let mut handles = Vec::new();
        for index in 0..size {
            let (tx, rx) = mpsc::channel();
            let init = init.clone();
            let failures = failures.clone();
            let body = Box::new(move || {
                init(index);
                for message in rx {
                    match message {
                        Message::Run(mut task) => {
                            if let Err(err) = task.run() {
                                failures.lock().push(err);
                            }
                        }
                        Message::Sync(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            });
            let handle = factory
                .spawn(Some(format!("worker-{}", index)), body)
                .unwrap();
            senders.push(Mutex::new(Some(tx)));
            handles.push(handle);
        }
        RoundRobinPool {
            senders,
            handles,
            next: AtomicUsize::new(0),
            failures,
        }
    }

    pub fn size(&self) -> usize {
        self.senders.len()
    }

    fn send(&self, worker: usize, message: Message) {
        if let Some(ref tx) = *self.senders[worker].lock() {
            tx.send(message).unwrap();
        }
    }

    /// Queues a task on one specific worker.
    pub fn execute_on(&self, worker: usize, task: Task) {
        self.send(worker, Message::Run(task));
    }

    /// Runs a closure as a plain task on one worker and waits for it.
    pub fn inspect<R, F>(&self, worker: usize, f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.execute_on(worker, once(move || tx.send(f()).unwrap()));
        rx.recv().unwrap()
    }

    /// Waits until every worker has drained its queue.
    pub fn sync(&self) {
        let (tx, rx) = mpsc::channel();
        for worker in 0..self.size() {
            self.send(worker, Message::Sync(tx.clone()));
        }
        for _ in 0..self.size() {
            rx.recv().unwrap();
        }
    }

    pub fn failures(&self) -> Vec<Error> {
        self.failures.lock().clone()
    }
}

impl Executor for RoundRobinPool {
    fn execute(&self, task: Task) {
        let worker = self.next.fetch_add(1, Ordering::SeqCst) % self.size();
        self.execute_on(worker, task);
    }
}

impl Drop for RoundRobinPool {
    fn drop(&mut self) {
        for sender in &self.senders {
            sender.lock().take();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

struct Scheduled {
    task: Task,
    delay: Duration,
    period: Option<Duration>,
}

/// A scheduler whose timer is advanced by hand.
///
/// Every firing runs on a fresh thread, so a task never sees state left
/// behind by the submitting thread.
#[derive(Default)]
pub struct ManualScheduler {
    queue: Mutex<Vec<Scheduled>>,
}

impl ManualScheduler {
    pub fn new() -> ManualScheduler {
        ManualScheduler::default()
    }

    /// Runs every queued task once and requeues the periodic ones.
    pub fn fire_all(&self) -> Vec<Error> {
        let due: Vec<Scheduled> = self.queue.lock().drain(..).collect();
        let mut errors = Vec::new();
        for mut scheduled in due {
            let (fired, result) = thread::spawn(move || {
                let result = scheduled.task.run();
                (scheduled, result)
            })
            .join()
            .unwrap();
            scheduled = fired;
            if let Err(err) = result {
                errors.push(err);
            }
            if let Some(period) = scheduled.period {
                scheduled.delay = period;
                self.queue.lock().push(scheduled);
            }
        }
        errors
    }

    pub fn delay_of(&self, id: TaskId) -> Option<Duration> {
        self.queue
            .lock()
            .iter()
            .find(|scheduled| scheduled.task.id() == id)
            .map(|scheduled| scheduled.delay)
    }

    fn push(&self, task: Task, delay: Duration, period: Option<Duration>) -> TaskId {
        let id = task.id();
        self.queue.lock().push(Scheduled {
            task,
            delay,
            period,
        });
        id
    }
}

impl Executor for ManualScheduler {
    fn execute(&self, task: Task) {
        self.push(task, Duration::from_secs(0), None);
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, task: Task, delay: Duration) -> TaskId {
        self.push(task, delay, None)
    }

    fn schedule_at_fixed_rate(
        &self,
        task: Task,
        initial_delay: Duration,
        period: Duration,
    ) -> TaskId {
        self.push(task, initial_delay, Some(period))
    }

    fn cancel(&self, id: TaskId) -> Option<Task> {
        let mut queue = self.queue.lock();
        let index = queue.iter().position(|scheduled| scheduled.task.id() == id)?;
        Some(queue.remove(index).task)
    }

    fn pending(&self) -> Vec<TaskId> {
        self.queue
            .lock()
            .iter()
            .map(|scheduled| scheduled.task.id())
            .collect()
    }
}
