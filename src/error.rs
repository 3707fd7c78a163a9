use thiserror::Error;

/// Violations of the capture / replay / restore protocol.
///
/// Failures of the work itself are never reported through this type.  They
/// reach the caller unchanged once the worker's state has been restored.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    /// The task already carries a captured snapshot.
    ///
    /// Wrapping twice would replay and restore twice around the same
    /// execution and corrupt the chain of backups.
    #[error("task is already wrapped")]
    AlreadyWrapped,

    /// A task created with `release_after_run` was run a second time.
    #[error("captured snapshot was released after the first run")]
    ReleasedReference,

    /// A backup was restored while it was not the innermost replay of the
    /// current thread.
    #[error("restore does not match the innermost replay on this thread")]
    MismatchedRestore,
}

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
