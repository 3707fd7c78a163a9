use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use pin_project::pin_project;

use crate::ctx::{capture, Snapshot};

/// A future that polls its inner future with a captured snapshot replayed.
///
/// An async task may be resumed by a different worker on every poll.  The
/// snapshot is replayed around each poll and the worker's state restored
/// right after, so the future sees the state of the thread that created it
/// wherever it runs.
#[pin_project]
#[derive(Debug)]
pub struct Transmitted<F> {
    captured: Snapshot,
    #[pin]
    future: F,
}

impl<F> Transmitted<F> {
    /// Wraps a future with the current thread's state.
    pub fn new(future: F) -> Transmitted<F> {
        Transmitted::with_snapshot(capture(), future)
    }

    pub fn with_snapshot(captured: Snapshot, future: F) -> Transmitted<F> {
        Transmitted { captured, future }
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.captured
    }
}

impl<F: Future> Future for Transmitted<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        let this = self.project();
        let future = this.future;
        this.captured.run(move || future.poll(cx))
    }
}

/// Wraps a future with the current thread's state.
pub fn transmit_future<F: Future>(future: F) -> Transmitted<F> {
    Transmitted::new(future)
}
