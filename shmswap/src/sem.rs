//! Per-slot counting semaphores shared between processes.
//!
//! Each slot owns two counters, `CONSEM` ([`Counter::Consumers`]) and
//! `PROSEM` ([`Counter::Producer`]). They are the only channel through
//! which producer and consumers coordinate; no in-process lock is shared.
//!
//! # Operations
//!
//! Every operation is expressed as a list of System V style ops handed to
//! [`SemaphoreBackend::semop`]:
//!
//! | Operation              | Ops          |
//! |------------------------|--------------|
//! | `increment`            | `[+1]`       |
//! | `decrement`            | `[-1]`       |
//! | `wait_equal(c, 0)`     | `[0]`        |
//! | `wait_equal(c, v)`     | `[-v, 0, +v]`|
//! | `wait_at_least(c, v)`  | `[-v, +v]`   |
//!
//! A negative op blocks until the counter can be lowered by that amount,
//! zero blocks until the counter is zero, a positive op adds. The System V
//! backend submits the list in one call; other backends apply the ops one at
//! a time (see [`Step`]). They apply a `-v` directly followed by `+v` as a
//! single wait for the counter to reach `v`, so `wait_at_least` never shows
//! a dip. The dip inside `wait_equal(c, v)` with `v > 0` stays visible to
//! other callers. The protocol only uses that form with `v == 0`.

use crate::error::{Error, Result};
use crate::slot::{Counter, Key, SlotIndex};
use crate::wait::PollPolicy;

/// Largest value a counter may hold (`SEMVMX` on Linux).
pub const COUNTER_MAX: u32 = 32767;

/// One step of an op list, for backends that cannot apply a whole list
/// atomically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Block until the counter can be lowered by the amount, then lower it.
    Lower(u32),
    /// Add the amount.
    Raise(u32),
    /// Block until the counter is zero.
    Zero,
    /// Block until the counter is at least the amount. Nothing changes.
    AtLeast(u32),
}

impl Step {
    /// Splits `ops` into steps, merging each `-v, +v` pair into
    /// [`Step::AtLeast`].
    #[must_use]
    pub fn plan(ops: &[i16]) -> Vec<Self> {
        let mut steps = Vec::with_capacity(ops.len());
        let mut rest = ops;
        while let Some((&op, tail)) = rest.split_first() {
            let amount = u32::from(op.unsigned_abs());
            rest = tail;
            let step = match op {
                0 => Self::Zero,
                _ if op > 0 => Self::Raise(amount),
                _ => match rest.split_first() {
                    Some((&next, tail)) if i32::from(next) == -i32::from(op) => {
                        rest = tail;
                        Self::AtLeast(amount)
                    }
                    _ => Self::Lower(amount),
                },
            };
            steps.push(step);
        }
        steps
    }
}

/// Storage for the four counters of a channel.
///
/// Implementations must make every change visible to all processes (or
/// threads) that opened the same keys.
pub trait SemaphoreBackend: Send + Sync {
    /// Current value, without blocking.
    fn get(&self, slot: SlotIndex, counter: Counter) -> Result<u32>;

    /// Forces the counter to `value`, waking any waiter.
    fn set(&self, slot: SlotIndex, counter: Counter, value: u32) -> Result<()>;

    /// Applies System V style ops to one counter; see the module docs.
    fn semop(&self, slot: SlotIndex, counter: Counter, ops: &[i16]) -> Result<()>;

    /// Removes the counters from the system. Blocked waiters fail.
    fn remove(&self) -> Result<()>;
}

/// The two counters of both slots, addressed by `(slot, counter)`.
#[derive(Debug)]
pub struct KeyedSemaphoreSet<B> {
    backend: B,
    keys: [Key; 2],
}

impl<B: SemaphoreBackend> KeyedSemaphoreSet<B> {
    #[must_use]
    pub const fn new(backend: B, keys: [Key; 2]) -> Self {
        Self { backend, keys }
    }

    /// Key naming `slot`'s semaphores and segment.
    #[must_use]
    pub const fn key(&self, slot: SlotIndex) -> Key {
        self.keys[slot.index()]
    }

    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Forces a counter to an absolute value.
    ///
    /// # Errors
    ///
    /// [`Error::CounterOverflow`] above [`COUNTER_MAX`], or a backend error.
    pub fn set(&self, slot: SlotIndex, counter: Counter, value: u32) -> Result<()> {
        check_range(slot, counter, value)?;
        self.backend.set(slot, counter, value)
    }

    /// Reads a counter without blocking.
    ///
    /// # Errors
    ///
    /// Backend error.
    pub fn get(&self, slot: SlotIndex, counter: Counter) -> Result<u32> {
        self.backend.get(slot, counter)
    }

    /// Adds one.
    ///
    /// # Errors
    ///
    /// Backend error.
    pub fn increment(&self, slot: SlotIndex, counter: Counter) -> Result<()> {
        self.backend.semop(slot, counter, &[1])
    }

    /// Subtracts one, blocking while the counter is zero.
    ///
    /// Callers only decrement counters they raised themselves; a decrement
    /// of a zero counter waits for someone else to raise it.
    ///
    /// # Errors
    ///
    /// Backend error.
    pub fn decrement(&self, slot: SlotIndex, counter: Counter) -> Result<()> {
        self.backend.semop(slot, counter, &[-1])
    }

    /// Blocks until the counter equals `value`.
    ///
    /// For nonzero `value` this runs the consume, wait-for-zero, restore
    /// sequence, which is not atomic outside the System V backend.
    ///
    /// # Errors
    ///
    /// [`Error::CounterOverflow`] if `value` exceeds [`COUNTER_MAX`], or a
    /// backend error.
    pub fn wait_equal(&self, slot: SlotIndex, counter: Counter, value: u32) -> Result<()> {
        if value == 0 {
            return self.backend.semop(slot, counter, &[0]);
        }
        let op = op_amount(slot, counter, value)?;
        self.backend.semop(slot, counter, &[-op, 0, op])
    }

    /// Blocks until the counter has reached at least `value`.
    ///
    /// Consumes `value` (blocking while the counter is lower) and restores
    /// it straight away.
    ///
    /// # Errors
    ///
    /// [`Error::CounterOverflow`] if `value` exceeds [`COUNTER_MAX`], or a
    /// backend error.
    pub fn wait_at_least(&self, slot: SlotIndex, counter: Counter, value: u32) -> Result<()> {
        if value == 0 {
            return Ok(());
        }
        let op = op_amount(slot, counter, value)?;
        self.backend.semop(slot, counter, &[-op, op])
    }

    /// Re-reads the counter under `policy` until `ready` accepts its value.
    ///
    /// # Errors
    ///
    /// Backend error, or the policy's cancellation/deadline error.
    pub fn poll(
        &self,
        slot: SlotIndex,
        counter: Counter,
        policy: &PollPolicy,
        ready: impl Fn(u32) -> bool,
    ) -> Result<u32> {
        policy.poll_until(|| {
            let value = self.backend.get(slot, counter)?;
            Ok(ready(value).then_some(value))
        })
    }

    /// Sets all four counters to zero.
    ///
    /// # Errors
    ///
    /// Backend error.
    pub fn reset(&self) -> Result<()> {
        for slot in SlotIndex::ALL {
            for counter in Counter::ALL {
                self.backend.set(slot, counter, 0)?;
            }
        }
        Ok(())
    }

    /// Removes the counters from the system.
    ///
    /// # Errors
    ///
    /// Backend error.
    pub fn remove(&self) -> Result<()> {
        self.backend.remove()
    }
}

fn check_range(slot: SlotIndex, counter: Counter, value: u32) -> Result<()> {
    if value > COUNTER_MAX {
        return Err(Error::CounterOverflow {
            slot,
            counter,
            value,
        });
    }
    Ok(())
}

fn op_amount(slot: SlotIndex, counter: Counter, value: u32) -> Result<i16> {
    check_range(slot, counter, value)?;
    i16::try_from(value).map_err(|_| Error::CounterOverflow {
        slot,
        counter,
        value,
    })
}
