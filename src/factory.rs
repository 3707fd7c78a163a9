use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::trace;

use crate::ctx::{run_with_cleared, Snapshot};

/// The body of a thread created through a factory.
pub type Body = Box<dyn FnOnce() + Send + 'static>;

/// Creates the worker threads of a pool.
///
/// Rust threads start with nothing set.  Pools that want their workers to
/// start with the state of the thread that created them use
/// `InheritingThreadFactory`; wrapping that in `DisableInheritance` turns
/// the inheritance off again so state only ever arrives through wrapped
/// tasks.  Which one a pool uses is part of its configuration.
pub trait ThreadFactory: Send + Sync {
    fn spawn(&self, name: Option<String>, body: Body) -> io::Result<JoinHandle<()>>;
}

impl<F: ThreadFactory + ?Sized> ThreadFactory for Arc<F> {
    fn spawn(&self, name: Option<String>, body: Body) -> io::Result<JoinHandle<()>> {
        (**self).spawn(name, body)
    }
}

/// Starts threads with the flow locals of the creating thread.
///
/// The new thread receives a snapshot of the creator's flow locals taken
/// when `spawn` is called, and keeps it for its whole life.  Registered
/// plain thread locals are not inherited.
#[derive(Debug, Clone, Copy, Default)]
pub struct InheritingThreadFactory;

impl ThreadFactory for InheritingThreadFactory {
    fn spawn(&self, name: Option<String>, body: Body) -> io::Result<JoinHandle<()>> {
        let inherited = Snapshot::capture_inheritable();
        trace!(name = ?name, inherited = inherited.len(), "spawning worker");
        let mut builder = thread::Builder::new();
        if let Some(name) = name {
            builder = builder.name(name);
        }
        builder.spawn(move || inherited.run(body))
    }
}

/// A thread factory that spawns with all propagated state cleared, so
/// nothing is inherited by the new thread.
#[derive(Debug, Clone, Default)]
pub struct DisableInheritance<F> {
    inner: F,
}

impl<F> DisableInheritance<F> {
    pub fn inner(&self) -> &F {
        &self.inner
    }

    /// Returns the wrapped factory.
    pub fn into_inner(self) -> F {
        self.inner
    }
}

impl<F: ThreadFactory> ThreadFactory for DisableInheritance<F> {
    fn spawn(&self, name: Option<String>, body: Body) -> io::Result<JoinHandle<()>> {
        run_with_cleared(|| self.inner.spawn(name, body))
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?
    }
}

/// Wraps a factory so that the threads it creates inherit nothing.
pub fn disable_inheritance<F: ThreadFactory>(factory: F) -> DisableInheritance<F> {
    DisableInheritance { inner: factory }
}

/// Returns the inheriting factory with inheritance disabled.
pub fn default_disable_inheritance_factory() -> DisableInheritance<InheritingThreadFactory> {
    disable_inheritance(InheritingThreadFactory)
}
