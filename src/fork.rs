use std::panic;
use std::thread;

use crate::ctx::{capture, Snapshot};

/// A computation that runs with the state of the thread that created it.
///
/// This is the unit fork/join schedulers split work into: the snapshot is
/// taken when the task is forked and replayed on whichever thread ends up
/// computing it.
#[derive(Debug)]
pub struct RecursiveTask<F> {
    captured: Snapshot,
    compute: F,
}

impl<F: FnOnce() -> R, R> RecursiveTask<F> {
    pub fn new(compute: F) -> RecursiveTask<F> {
        RecursiveTask {
            captured: capture(),
            compute,
        }
    }

    /// Runs the computation on the current thread.
    pub fn compute(self) -> R {
        self.captured.run(self.compute)
    }
}

/// Runs two closures in parallel and returns both results.
///
/// `b` is forked onto a scoped thread and sees the caller's state; `a`
/// runs on the calling thread.  If either side panics the panic is resumed
/// once both have finished.
///
/// ## Example
///
/// ```
/// # #[macro_use] extern crate flow_transmit;
/// # use flow_transmit::join;
/// flow_local!(static DEPTH: u32 = 0);
///
/// fn sum(values: &[u64]) -> u64 {
///     if values.len() <= 2 {
///         return values.iter().sum();
///     }
///     let depth = DEPTH.get_cloned().unwrap_or(0);
///     let (left, right) = values.split_at(values.len() / 2);
///     let (a, b) = join(
///         || { DEPTH.set(depth + 1); sum(left) },
///         || { assert_eq!(DEPTH.get_cloned(), Some(depth)); sum(right) },
///     );
///     a + b
/// }
/// # fn main() {
/// assert_eq!(sum(&[1, 2, 3, 4, 5, 6, 7, 8]), 36);
/// # }
/// ```
pub fn join<A, B, RA, RB>(a: A, b: B) -> (RA, RB)
where
    A: FnOnce() -> RA,
    B: FnOnce() -> RB + Send,
    RB: Send,
{
    let forked = RecursiveTask::new(b);
    thread::scope(|scope| {
        let handle = scope.spawn(move || forked.compute());
        let ra = a();
        match handle.join() {
            Ok(rb) => (ra, rb),
            Err(err) => panic::resume_unwind(err),
        }
    })
}
