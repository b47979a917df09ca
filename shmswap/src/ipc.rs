//! Operating system backends.
//!
//! - [`sysv`] - System V semaphore sets and segments, the classic pairing
//! - [`atomic`] - counters as atomics in a POSIX shared memory object
//! - [`shmem`] - POSIX shared memory objects and a segment store over them

pub mod atomic;
pub mod shmem;
#[cfg(target_os = "linux")]
pub mod sysv;
