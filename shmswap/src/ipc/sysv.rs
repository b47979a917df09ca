//! System V semaphore sets and shared memory segments.
//!
//! Each slot key names one semaphore set of two semaphores (`CONSEM` at
//! number 0, `PROSEM` at number 1) and one shared memory segment. Both are
//! created with mode `0666` so every user on the host can join.

use std::ptr::{NonNull, null, null_mut};

use libc::c_int;
use rustix::io::Errno;

use crate::error::{Error, Result, last_errno};
use crate::segment::{Mapping, SegmentStore};
use crate::sem::SemaphoreBackend;
use crate::slot::{Counter, Key, SlotIndex};

const MODE: c_int = 0o666;

/// Semaphore sets of both slots.
#[derive(Debug)]
pub struct SysvSemaphores {
    keys: [Key; 2],
    ids: [c_int; 2],
}

impl SysvSemaphores {
    /// Opens the sets for `keys`, creating missing ones.
    ///
    /// New sets start at zero on Linux. Opening does not reset existing
    /// values; that is left to the channel's main side.
    ///
    /// # Errors
    ///
    /// `semget` failure.
    pub fn open(keys: [Key; 2]) -> Result<Self> {
        let mut ids = [0; 2];
        for slot in SlotIndex::ALL {
            let key = keys[slot.index()];
            // SAFETY: plain syscall wrapper without pointer arguments.
            let id = unsafe { libc::semget(key.raw(), 2, MODE | libc::IPC_CREAT) };
            if id == -1 {
                return Err(Error::last_sys("semget", key));
            }
            ids[slot.index()] = id;
        }
        Ok(Self { keys, ids })
    }

    const fn id(&self, slot: SlotIndex) -> c_int {
        self.ids[slot.index()]
    }

    fn fail(&self, op: &'static str, slot: SlotIndex) -> Error {
        match last_errno() {
            Errno::IDRM => Error::Removed,
            errno => Error::sys(op, self.keys[slot.index()], errno),
        }
    }
}

impl SemaphoreBackend for SysvSemaphores {
    fn get(&self, slot: SlotIndex, counter: Counter) -> Result<u32> {
        // SAFETY: GETVAL takes no fourth argument.
        let value = unsafe { libc::semctl(self.id(slot), counter.index() as c_int, libc::GETVAL) };
        if value == -1 {
            return Err(self.fail("semctl(GETVAL)", slot));
        }
        Ok(value as u32)
    }

    fn set(&self, slot: SlotIndex, counter: Counter, value: u32) -> Result<()> {
        let value = c_int::try_from(value).map_err(|_| Error::CounterOverflow {
            slot,
            counter,
            value,
        })?;
        // SAFETY: SETVAL reads the `val` member of `union semun`, which is
        // passed as an int.
        let rc = unsafe {
            libc::semctl(self.id(slot), counter.index() as c_int, libc::SETVAL, value)
        };
        if rc == -1 {
            return Err(self.fail("semctl(SETVAL)", slot));
        }
        Ok(())
    }

    /// Submits all ops in one `semop` call, which the kernel applies
    /// all-or-none. Interrupted waits are restarted.
    fn semop(&self, slot: SlotIndex, counter: Counter, ops: &[i16]) -> Result<()> {
        let mut sops: Vec<libc::sembuf> = ops
            .iter()
            .map(|&op| libc::sembuf {
                sem_num: counter.index() as u16,
                sem_op: op,
                sem_flg: 0,
            })
            .collect();
        loop {
            // SAFETY: `sops` holds `sops.len()` initialised entries.
            let rc = unsafe { libc::semop(self.id(slot), sops.as_mut_ptr(), sops.len()) };
            if rc == 0 {
                return Ok(());
            }
            if last_errno() != Errno::INTR {
                return Err(self.fail("semop", slot));
            }
        }
    }

    fn remove(&self) -> Result<()> {
        let mut first_error = None;
        for slot in SlotIndex::ALL {
            // SAFETY: IPC_RMID takes no fourth argument.
            if unsafe { libc::semctl(self.id(slot), 0, libc::IPC_RMID) } == -1 {
                first_error.get_or_insert_with(|| self.fail("semctl(IPC_RMID)", slot));
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Slot segments as System V shared memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct SysvSegments;

/// A System V segment id.
#[derive(Debug)]
pub struct SysvSegment {
    key: Key,
    id: c_int,
}

impl SysvSegment {
    #[must_use]
    pub const fn key(&self) -> Key {
        self.key
    }

    /// Size of the segment in bytes.
    ///
    /// # Errors
    ///
    /// `shmctl(IPC_STAT)` failure.
    pub fn len(&self) -> Result<usize> {
        segment_size(self.key, self.id)
    }
}

fn segment_size(key: Key, id: c_int) -> Result<usize> {
    // SAFETY: shmid_ds is plain data; zero is a valid bit pattern.
    let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
    // SAFETY: `ds` is a valid out pointer for IPC_STAT.
    if unsafe { libc::shmctl(id, libc::IPC_STAT, &mut ds) } == -1 {
        return Err(Error::last_sys("shmctl(IPC_STAT)", key));
    }
    Ok(ds.shm_segsz as usize)
}

impl SegmentStore for SysvSegments {
    type Segment = SysvSegment;

    /// `shmget` with `IPC_CREAT`. Size zero only opens an existing segment.
    fn create_or_open(&self, key: Key, size: usize) -> Result<SysvSegment> {
        // SAFETY: plain syscall wrapper without pointer arguments.
        let id = unsafe { libc::shmget(key.raw(), size, MODE | libc::IPC_CREAT) };
        if id != -1 {
            return Ok(SysvSegment { key, id });
        }
        let errno = last_errno();
        if errno == Errno::INVAL
            && let Ok(actual) = existing_size(key)
            && actual < size
        {
            return Err(Error::SizeMismatch {
                name: key.to_string(),
                requested: size,
                actual,
            });
        }
        Err(Error::sys("shmget", key, errno))
    }

    fn map(&self, segment: &SysvSegment) -> Result<Mapping> {
        let len = segment.len()?;
        // SAFETY: let the kernel choose the address; no existing memory is
        // replaced.
        let ptr = unsafe { libc::shmat(segment.id, null(), 0) };
        if ptr as isize == -1 {
            return Err(Error::last_sys("shmat", segment.key));
        }
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::sys("shmat", segment.key, Errno::FAULT))?;
        // SAFETY: shmat mapped the whole segment, `len` bytes, until shmdt.
        Ok(unsafe { Mapping::from_raw(ptr, len, segment.key) })
    }

    fn unmap(&self, mapping: Mapping) -> Result<()> {
        // SAFETY: `mapping` came from shmat and is detached exactly once.
        if unsafe { libc::shmdt(mapping.as_ptr().cast()) } == -1 {
            return Err(Error::last_sys("shmdt", mapping.key()));
        }
        Ok(())
    }

    /// Marks the segment for removal. The kernel frees it once the last
    /// attachment is gone.
    fn destroy(&self, segment: SysvSegment) -> Result<()> {
        // SAFETY: IPC_RMID ignores the buffer argument.
        if unsafe { libc::shmctl(segment.id, libc::IPC_RMID, null_mut()) } == -1 {
            return Err(Error::last_sys("shmctl(IPC_RMID)", segment.key));
        }
        Ok(())
    }
}

fn existing_size(key: Key) -> Result<usize> {
    // SAFETY: plain syscall wrapper without pointer arguments.
    let id = unsafe { libc::shmget(key.raw(), 0, 0) };
    if id == -1 {
        return Err(Error::last_sys("shmget", key));
    }
    segment_size(key, id)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Keys unlikely to collide with other users of the host.
    fn test_keys(salt: i32) -> [Key; 2] {
        let base = 0x5357_0000 | ((std::process::id() as i32 & 0xff) << 8) | (salt << 1);
        [Key::new(base), Key::new(base + 1)]
    }

    fn skip(test: &str, err: &Error) -> bool {
        if err.is_unsupported() {
            eprintln!("Skipping {test}: {err}");
            return true;
        }
        false
    }

    #[test]
    fn test_semaphore_set_ops() -> Result<()> {
        let sems = match SysvSemaphores::open(test_keys(1)) {
            Ok(sems) => sems,
            Err(err) if skip("test_semaphore_set_ops", &err) => return Ok(()),
            Err(err) => return Err(err),
        };
        for slot in SlotIndex::ALL {
            for counter in Counter::ALL {
                sems.set(slot, counter, 0)?;
            }
        }

        sems.semop(SlotIndex::One, Counter::Producer, &[1])?;
        assert_eq!(sems.get(SlotIndex::One, Counter::Producer)?, 1);
        assert_eq!(sems.get(SlotIndex::One, Counter::Consumers)?, 0);
        assert_eq!(sems.get(SlotIndex::Zero, Counter::Producer)?, 0);

        // Consume and restore leaves the value unchanged.
        sems.semop(SlotIndex::One, Counter::Producer, &[-1, 0, 1])?;
        assert_eq!(sems.get(SlotIndex::One, Counter::Producer)?, 1);

        sems.set(SlotIndex::Zero, Counter::Consumers, 5)?;
        assert_eq!(sems.get(SlotIndex::Zero, Counter::Consumers)?, 5);

        sems.remove()?;
        assert!(sems.get(SlotIndex::Zero, Counter::Consumers).is_err());
        Ok(())
    }

    #[test]
    fn test_segment_lifecycle() -> Result<()> {
        let key = test_keys(2)[0];
        let store = SysvSegments;
        let segment = match store.create_or_open(key, 4096) {
            Ok(segment) => segment,
            Err(err) if skip("test_segment_lifecycle", &err) => return Ok(()),
            Err(err) => return Err(err),
        };
        assert!(segment.len()? >= 4096);

        let writer = store.map(&segment)?;
        let reader_segment = store.create_or_open(key, 0)?;
        let reader = store.map(&reader_segment)?;
        // SAFETY: both attachments cover the same live segment.
        unsafe {
            writer.as_ptr().write_bytes(0x5a, 16);
            assert!(reader.bytes()[..16].iter().all(|&b| b == 0x5a));
        }
        assert!(matches!(
            store.create_or_open(key, 1 << 20),
            Err(Error::SizeMismatch { .. })
        ));

        store.destroy(segment)?;
        // Marked for removal, still attached.
        // SAFETY: the attachment outlives IPC_RMID.
        assert_eq!(unsafe { reader.bytes()[0] }, 0x5a);
        store.unmap(writer)?;
        store.unmap(reader)?;
        Ok(())
    }
}
