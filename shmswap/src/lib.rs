//! Double-buffered shared memory slots for handing bulk data from one
//! producer process to any number of consumer processes on the same host.
//!
//! A [`Channel`] owns two slots. The producer fills a slot, publishes it,
//! and later retires it once the other slot carries newer data. Consumers
//! follow the published slot and map it for reading. A retired slot's
//! segment is destroyed in the background once the last consumer has
//! detached, so readers never see their memory vanish and segments are
//! never leaked.
//!
//! Producer and consumers coordinate only through two counters per slot,
//! `CONSEM` (attached consumers) and `PROSEM` (published by the producer),
//! kept in System V semaphores or in mapped atomics.
//!
//! ```no_run
//! use std::sync::Arc;
//! use shmswap::{Channel, ChannelConfig, ConsumerHandle, ProducerHandle, Role, WaitMode};
//!
//! // Producer process
//! let channel = Arc::new(Channel::sysv(ChannelConfig::default())?);
//! let producer = ProducerHandle::new(Arc::clone(&channel));
//! let mut frame = producer.publish(1024)?;
//! frame.fill(7);
//! let frame = producer.republish(Some(frame), 1024)?;
//! producer.retire(Some(frame))?;
//!
//! // Consumer process
//! let config = ChannelConfig::default().with_role(Role::Follower);
//! let mut consumer = ConsumerHandle::new(Arc::new(Channel::sysv(config)?));
//! let bytes = consumer.advance(&WaitMode::Block)?;
//! assert_eq!(bytes[0], 7);
//! # Ok::<(), shmswap::Error>(())
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod alloc;
pub mod channel;
pub mod consumer;
pub mod error;
pub mod ipc;
pub mod key;
pub mod mem;
pub mod producer;
pub mod segment;
pub mod sem;
pub mod slot;
mod trace;
pub mod wait;

pub use alloc::{Allocation, SlotAllocator};
pub use channel::{Channel, ChannelConfig, ChannelId, Role};
pub use consumer::ConsumerHandle;
pub use error::{Error, Result};
pub use key::{Fixed, Ftok, KeyNamer};
pub use producer::ProducerHandle;
pub use segment::{Mapping, SegmentStore};
pub use sem::{COUNTER_MAX, KeyedSemaphoreSet, SemaphoreBackend};
pub use slot::{Counter, Key, SlotIndex};
pub use trace::init_tracing;
pub use wait::{CancelToken, PollPolicy, WaitMode};

/// Locks `mutex`, ignoring poisoning.
///
/// Every critical section leaves its data consistent, so state written by a
/// thread that later panicked is still usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
