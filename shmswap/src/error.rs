//! Crate-wide error type.

use rustix::io::Errno;
use thiserror::Error;

use crate::slot::{Counter, Key, SlotIndex};

/// Result alias for channel operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced while publishing, attaching or destroying slots.
///
/// OS failures are never retried. They are returned as soon as they happen
/// and the application decides whether to carry on or exit.
#[derive(Debug, Error)]
pub enum Error {
    /// A System V call on a keyed semaphore set or segment failed.
    #[error("{op} failed for key {key}: {source}")]
    Sys {
        op: &'static str,
        key: Key,
        source: Errno,
    },
    /// A call on a named object (`ftok`, `shm_open`, `mmap`, ...) failed.
    #[error("{op} failed for `{path}`: {source}")]
    Posix {
        op: &'static str,
        path: String,
        source: Errno,
    },
    /// The name cannot be used for a shared memory object or key.
    #[error("invalid shared memory name `{name}`: {reason}")]
    InvalidName { name: String, reason: &'static str },
    /// An existing segment or object is smaller than requested.
    #[error("`{name}` holds {actual} bytes, {requested} requested")]
    SizeMismatch {
        name: String,
        requested: usize,
        actual: usize,
    },
    /// A counter value does not fit the semaphore range.
    #[error("value {value} out of range for {counter} of slot {slot}")]
    CounterOverflow {
        slot: SlotIndex,
        counter: Counter,
        value: u32,
    },
    /// The semaphores were removed while a caller was using them.
    #[error("semaphores of the channel were removed")]
    Removed,
    /// A polling wait observed its cancellation token.
    #[error("wait cancelled")]
    Cancelled,
    /// A polling wait ran past its deadline.
    #[error("wait timed out")]
    TimedOut,
    /// The consumer has not located a published slot yet.
    #[error("no published slot located yet")]
    NotLocated,
    /// The buffer handed to `free` is not the one tracked for its slot.
    #[error("buffer does not belong to slot {slot} of this allocator")]
    ForeignBuffer { slot: SlotIndex },
    /// The deferred destruction thread could not be started.
    #[error("failed to spawn deferred destruction thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl Error {
    pub(crate) fn sys(op: &'static str, key: Key, source: Errno) -> Self {
        Self::Sys { op, key, source }
    }

    /// Builds a [`Error::Sys`] from the calling thread's `errno`.
    pub(crate) fn last_sys(op: &'static str, key: Key) -> Self {
        Self::sys(op, key, last_errno())
    }

    pub(crate) fn posix(op: &'static str, path: &str, source: Errno) -> Self {
        Self::Posix {
            op,
            path: path.to_string(),
            source,
        }
    }

    /// The OS error code behind this error, if any.
    #[must_use]
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::Sys { source, .. } | Self::Posix { source, .. } => Some(*source),
            _ => None,
        }
    }

    /// Whether the kernel refused the call for lack of permission or support.
    ///
    /// Tests use this to skip on hosts where System V IPC or `/dev/shm` is
    /// unavailable.
    #[must_use]
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self.errno(),
            Some(Errno::ACCESS | Errno::PERM | Errno::NOSYS)
        )
    }
}

pub(crate) fn last_errno() -> Errno {
    Errno::from_raw_os_error(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
}
