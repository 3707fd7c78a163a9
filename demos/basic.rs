#[macro_use]
extern crate flow_transmit;

use flow_transmit::{adapt, default_disable_inheritance_factory, Executor, Task, ThreadFactory};
use parking_lot::Mutex;
use std::env;
use std::sync::mpsc;

flow_local!(static LOCALE: String = env::var("LANG").unwrap_or_else(|_| "en_US".into()));

/// A single worker that runs tasks in the order they arrive.
struct Worker {
    queue: Mutex<mpsc::Sender<Task>>,
}

impl Worker {
    fn start<F: ThreadFactory>(factory: &F) -> Worker {
        let (queue, tasks) = mpsc::channel::<Task>();
        factory
            .spawn(
                Some("worker".into()),
                Box::new(move || {
                    LOCALE.set("ja_JP".into());
                    for mut task in tasks {
                        task.run().unwrap();
                    }
                }),
            )
            .unwrap();
        Worker {
            queue: Mutex::new(queue),
        }
    }
}

impl Executor for Worker {
    fn execute(&self, task: Task) {
        self.queue.lock().send(task).unwrap();
    }
}

fn main() {
    println!("the current locale is {}", LOCALE.get().unwrap());
    LOCALE.set("de_DE".into());
    println!("changing locale to {}", LOCALE.get().unwrap());

    let pool = adapt(Worker::start(&default_disable_inheritance_factory()));
    let (done, finished) = mpsc::channel();
    let report = done.clone();
    pool.execute(Task::new(move || {
        println!("the locale in the worker is {}", LOCALE.get().unwrap());
        LOCALE.set("fr_FR".into());
        println!("the new locale in the worker is {}", LOCALE.get().unwrap());
        report.send(()).unwrap();
    }));
    finished.recv().unwrap();

    pool.inner().execute(Task::new(move || {
        println!("the worker's own locale is again {}", LOCALE.get().unwrap());
        done.send(()).unwrap();
    }));
    finished.recv().unwrap();

    println!("the locale of the parent thread is again {}", LOCALE.get().unwrap());
}
