//! Error types for Fusion.
//!
//! Every operation in this crate returns a code from one shared taxonomy.
//! Shared-memory failures are kept distinct from local ones: a caller that
//! sees [`Error::OutOfSharedMemory`] knows the pool is exhausted for every
//! fusionee, not just this process.

use thiserror::Error;

/// Result type alias using Fusion's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Fusion operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Local (process-private) allocation failed.
    #[error("out of local memory")]
    OutOfLocalMemory,

    /// The shared heap is exhausted.
    #[error("out of shared memory")]
    OutOfSharedMemory,

    /// A lock or resource is busy.
    #[error("resource busy")]
    Busy,

    /// The target object's reference count already reached zero.
    #[error("object is dead")]
    Dead,

    /// The target was destroyed.
    #[error("destroyed")]
    Destroyed,

    /// Capability or ownership check failed.
    #[error("access denied")]
    AccessDenied,

    /// ABI version mismatch between fusionees at join time.
    #[error("version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch {
        /// ABI version of the joining process.
        ours: u32,
        /// ABI version recorded in the world.
        theirs: u32,
    },

    /// A per-caller quota or payload bound was exceeded.
    #[error("limit exceeded")]
    LimitExceeded,

    /// A blocking operation timed out.
    #[error("timeout")]
    Timeout,

    /// A named item was not found.
    #[error("item not found: {0}")]
    ItemNotFound(String),

    /// A numeric id was not found.
    #[error("id not found: {0}")]
    IdNotFound(u32),

    /// Invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    /// World/session initialization failed.
    #[error("initialization failed: {0}")]
    Init(String),

    /// An invariant violation was detected at runtime.
    ///
    /// Continuing after one of these risks corrupting state that other
    /// fusionees rely on; see [`bug`](crate::error) for the trap behavior.
    #[error("internal bug: {0}")]
    Bug(&'static str),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

/// Report an invariant violation.
///
/// Logs the condition with the current process/thread identity and, when
/// `trap` is set (see `FusionConfig::trap_on_bug`), raises `SIGTRAP` in the
/// current process instead of returning: a corrupted shared structure is
/// visible to every other fusionee, so dying loudly here beats corrupting
/// their view further.
pub(crate) fn bug(what: &'static str, trap: bool) -> Error {
    tracing::error!(
        pid = rustix::process::getpid().as_raw_nonzero().get(),
        tid = rustix::thread::gettid().as_raw_nonzero().get(),
        "BUG: {what}"
    );

    if trap {
        let _ = rustix::process::kill_process(
            rustix::process::getpid(),
            rustix::process::Signal::TRAP,
        );
    }

    Error::Bug(what)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(Error::OutOfSharedMemory.to_string(), "out of shared memory");
        assert_eq!(Error::Busy.to_string(), "resource busy");
        assert_eq!(
            Error::VersionMismatch { ours: 3, theirs: 4 }.to_string(),
            "version mismatch: ours 3, theirs 4"
        );
    }

    #[test]
    fn test_bug_without_trap_returns() {
        let err = bug("test condition", false);
        assert!(matches!(err, Error::Bug("test condition")));
    }
}
