//! Counters as atomics in a mapped POSIX shared memory object.
//!
//! The four counters of a channel live in one [`CounterBlock`]. Blocked
//! callers sleep on the counter's address with `futex(2)`; waits are
//! bounded so a removed block is noticed even without a wake-up. Off Linux
//! the wait degrades to a short sleep.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::ipc::shmem::{SharedMemorySafe, Shm};
use crate::sem::{SemaphoreBackend, Step};
use crate::slot::{Counter, Key, SlotIndex};

/// Upper bound on one sleep inside a blocking op.
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Layout of the shared object.
#[derive(Debug)]
#[repr(C)]
pub struct CounterBlock {
    counters: [[AtomicU32; 2]; 2],
    removed: AtomicU32,
}

// SAFETY: repr(C) atomics only; all zeroes means every counter at zero.
unsafe impl SharedMemorySafe for CounterBlock {}

impl CounterBlock {
    fn counter(&self, slot: SlotIndex, counter: Counter) -> &AtomicU32 {
        &self.counters[slot.index()][counter.index()]
    }

    fn check(&self) -> Result<()> {
        if self.removed.load(Ordering::Acquire) != 0 {
            return Err(Error::Removed);
        }
        Ok(())
    }
}

/// [`SemaphoreBackend`] over a [`CounterBlock`] shared by name.
///
/// Op lists are applied one op at a time.
pub struct MappedSemaphores {
    block: Shm<CounterBlock>,
}

impl MappedSemaphores {
    /// Opens the block named `name`, creating it zeroed if new.
    ///
    /// # Errors
    ///
    /// Invalid name, or `shm_open`/`ftruncate`/`mmap` failure.
    pub fn open(name: &str) -> Result<Self> {
        Ok(Self {
            block: Shm::open_or_create(name)?,
        })
    }

    /// Object name for the counters of the channel whose slot 0 key is `key`.
    #[must_use]
    pub fn object_name(prefix: &str, key: Key) -> String {
        format!("{prefix}-sem-{:08x}", key.raw() as u32)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.block.name()
    }

    fn lower(&self, atom: &AtomicU32, amount: u32) -> Result<()> {
        loop {
            self.block.check()?;
            let current = atom.load(Ordering::Acquire);
            if current < amount {
                futex::wait(atom, current, WAIT_SLICE);
                continue;
            }
            let lowered = current - amount;
            if atom
                .compare_exchange_weak(current, lowered, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    fn wait_at_least(&self, atom: &AtomicU32, amount: u32) -> Result<()> {
        loop {
            self.block.check()?;
            let current = atom.load(Ordering::Acquire);
            if current >= amount {
                return Ok(());
            }
            futex::wait(atom, current, WAIT_SLICE);
        }
    }

    fn wait_zero(&self, atom: &AtomicU32) -> Result<()> {
        loop {
            self.block.check()?;
            let current = atom.load(Ordering::Acquire);
            if current == 0 {
                return Ok(());
            }
            futex::wait(atom, current, WAIT_SLICE);
        }
    }
}

impl std::fmt::Debug for MappedSemaphores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedSemaphores")
            .field("name", &self.block.name())
            .finish()
    }
}

impl SemaphoreBackend for MappedSemaphores {
    fn get(&self, slot: SlotIndex, counter: Counter) -> Result<u32> {
        self.block.check()?;
        Ok(self.block.counter(slot, counter).load(Ordering::Acquire))
    }

    fn set(&self, slot: SlotIndex, counter: Counter, value: u32) -> Result<()> {
        self.block.check()?;
        let atom = self.block.counter(slot, counter);
        atom.store(value, Ordering::Release);
        futex::wake_all(atom);
        Ok(())
    }

    fn semop(&self, slot: SlotIndex, counter: Counter, ops: &[i16]) -> Result<()> {
        let atom = self.block.counter(slot, counter);
        for step in Step::plan(ops) {
            match step {
                Step::Zero => self.wait_zero(atom)?,
                Step::AtLeast(amount) => {
                    self.wait_at_least(atom, amount)?;
                    continue;
                }
                Step::Lower(amount) => self.lower(atom, amount)?,
                Step::Raise(amount) => {
                    self.block.check()?;
                    atom.fetch_add(amount, Ordering::AcqRel);
                }
            }
            futex::wake_all(atom);
        }
        Ok(())
    }

    /// Flags the block as removed, wakes every waiter and unlinks the name.
    fn remove(&self) -> Result<()> {
        self.block.removed.store(1, Ordering::Release);
        for slot in SlotIndex::ALL {
            for counter in Counter::ALL {
                futex::wake_all(self.block.counter(slot, counter));
            }
        }
        self.block.unlink()
    }
}

#[cfg(target_os = "linux")]
mod futex {
    use std::ptr::null;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// Sleeps while `atom` holds `expected`, at most `timeout`.
    ///
    /// Spurious returns are fine; callers re-check.
    pub(super) fn wait(atom: &AtomicU32, expected: u32, timeout: Duration) {
        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: libc::c_long::from(timeout.subsec_nanos() as i32),
        };
        // SAFETY: `atom` is a live, aligned u32; shared (non-private) futex
        // because other processes map the same word.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                atom.as_ptr(),
                libc::FUTEX_WAIT,
                expected,
                &raw const ts,
                null::<u32>(),
                0,
            );
        }
    }

    pub(super) fn wake_all(atom: &AtomicU32) {
        // SAFETY: as above; FUTEX_WAKE only reads the address.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                atom.as_ptr(),
                libc::FUTEX_WAKE,
                i32::MAX,
                null::<libc::timespec>(),
                null::<u32>(),
                0,
            );
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod futex {
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    pub(super) fn wait(_atom: &AtomicU32, _expected: u32, timeout: Duration) {
        std::thread::sleep(timeout.min(Duration::from_millis(1)));
    }

    pub(super) fn wake_all(_atom: &AtomicU32) {}
}
