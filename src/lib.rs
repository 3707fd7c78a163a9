//! This crate carries thread-scoped ambient data (trace ids, locales,
//! security principals and the like) across thread pools, timers and
//! fork/join tasks.
//!
//! A worker in a pool is a long lived thread that runs many unrelated
//! tasks.  Whatever the submitting thread had set is not there when the
//! task runs, and whatever one task leaves behind must not leak into the
//! next.  This crate solves both with one protocol:
//!
//! *   `capture` takes a `Snapshot` of every propagated variable where the
//!     work is created.
//! *   `replay` installs the snapshot on the worker and returns a `Backup`
//!     of what the worker held before.
//! *   `restore` hands the worker its own state back once the work is done.
//!
//! The protocol is rarely used directly.  `wrap` attaches a snapshot to a
//! `Task` and runs it inside the bracket, and `adapt` does that
//! transparently for every task submitted to an `Executor` or `Scheduler`.
//!
//! Propagated variables are either `FlowLocal`s declared with the
//! `flow_local!` macro, which take part automatically, or plain
//! `thread_local!`s registered with `Registry::register_thread_local`.
//!
//! Propagation only happens where a snapshot is carried along: a thread
//! started directly with `std::thread::spawn` starts with nothing set.
//!
//! # Example Usage
//!
//! ```
//! #[macro_use]
//! extern crate flow_transmit;
//!
//! use flow_transmit::Task;
//! use std::env;
//! use std::thread;
//!
//! flow_local!(static LOCALE: String = env::var("LANG").unwrap_or_else(|_| "en_US".into()));
//!
//! fn main() {
//!     println!("the current locale is {}", LOCALE.get().unwrap());
//!     LOCALE.set("de_DE".into());
//!     println!("changing locale to {}", LOCALE.get().unwrap());
//!
//!     let mut task = flow_transmit::wrap(Task::new(|| {
//!         println!("the locale in the worker is {}", LOCALE.get().unwrap());
//!         LOCALE.set("fr_FR".into());
//!         println!("the new locale in the worker is {}", LOCALE.get().unwrap());
//!     })).unwrap();
//!     thread::spawn(move || task.run().unwrap()).join().unwrap();
//!
//!     println!("the locale of the parent thread is again {}", LOCALE.get().unwrap());
//! }
//! ```
//!
//! This example will give the following output assuming no default language was
//! set as environment variable (or the environment variable is `en_US`):
//!
//! ```plain
//! the current locale is en_US
//! changing locale to de_DE
//! the locale in the worker is de_DE
//! the new locale in the worker is fr_FR
//! the locale of the parent thread is again de_DE
//! ```
extern crate im;
#[macro_use]
extern crate lazy_static;

mod ctx;
mod data;
mod error;
mod executor;
mod factory;
mod fork;
mod future;
mod registry;
mod task;

pub use ctx::{capture, clear, replay, restore, run_with_captured, run_with_cleared, Backup, Snapshot};
pub use data::{CopyStrategy, FlowLocal, NullPolicy, SlotId};
pub use error::{Error, Result};
pub use executor::{adapt, Executor, Pending, Scheduler, TransmitExecutor};
pub use factory::{
    default_disable_inheritance_factory, disable_inheritance, Body, DisableInheritance,
    InheritingThreadFactory, ThreadFactory,
};
pub use fork::{join, RecursiveTask};
pub use future::{transmit_future, Transmitted};
pub use registry::Registry;
pub use task::{
    transmit, unwrap, unwrap_all, wrap, wrap_all, wrap_with, Task, TaskId, TaskState, WrapOptions,
    AUTO_WRAPPER,
};
