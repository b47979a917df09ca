//! Process-local backend.
//!
//! [`MemSemaphores`] and [`MemSegments`] keep their state behind an `Arc`,
//! so clones share it. Threads holding clones behave like processes that
//! opened the same keys, which makes this backend the test double for the
//! cross-process protocol. [`MemSegments`] also records every call, so
//! tests can check when a segment was destroyed.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use rustix::io::Errno;

use crate::error::{Error, Result};
use crate::lock;
use crate::segment::{Mapping, SegmentStore};
use crate::sem::{SemaphoreBackend, Step};
use crate::slot::{Counter, Key, SlotIndex};

#[derive(Debug, Default)]
struct Counters {
    values: [[u32; 2]; 2],
    removed: bool,
}

impl Counters {
    fn value(&mut self, slot: SlotIndex, counter: Counter) -> &mut u32 {
        &mut self.values[slot.index()][counter.index()]
    }
}

#[derive(Debug, Default)]
struct SemState {
    counters: Mutex<Counters>,
    changed: Condvar,
}

/// Counters in process memory, guarded by a mutex and a condition variable.
///
/// Op lists are applied one op at a time.
#[derive(Debug, Clone, Default)]
pub struct MemSemaphores {
    state: Arc<SemState>,
}

impl MemSemaphores {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn wait_while<'a>(
        &'a self,
        mut guard: MutexGuard<'a, Counters>,
        slot: SlotIndex,
        counter: Counter,
        blocked: impl Fn(u32) -> bool,
    ) -> Result<MutexGuard<'a, Counters>> {
        loop {
            if guard.removed {
                return Err(Error::Removed);
            }
            if !blocked(*guard.value(slot, counter)) {
                return Ok(guard);
            }
            guard = self
                .state
                .changed
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl SemaphoreBackend for MemSemaphores {
    fn get(&self, slot: SlotIndex, counter: Counter) -> Result<u32> {
        let mut counters = lock(&self.state.counters);
        if counters.removed {
            return Err(Error::Removed);
        }
        Ok(*counters.value(slot, counter))
    }

    fn set(&self, slot: SlotIndex, counter: Counter, value: u32) -> Result<()> {
        let mut counters = lock(&self.state.counters);
        if counters.removed {
            return Err(Error::Removed);
        }
        *counters.value(slot, counter) = value;
        self.state.changed.notify_all();
        Ok(())
    }

    fn semop(&self, slot: SlotIndex, counter: Counter, ops: &[i16]) -> Result<()> {
        let mut guard = lock(&self.state.counters);
        for step in Step::plan(ops) {
            guard = match step {
                Step::Zero => self.wait_while(guard, slot, counter, |v| v != 0)?,
                Step::AtLeast(amount) => self.wait_while(guard, slot, counter, |v| v < amount)?,
                Step::Lower(amount) => {
                    let mut guard = self.wait_while(guard, slot, counter, |v| v < amount)?;
                    *guard.value(slot, counter) -= amount;
                    guard
                }
                Step::Raise(amount) => {
                    if guard.removed {
                        return Err(Error::Removed);
                    }
                    *guard.value(slot, counter) += amount;
                    guard
                }
            };
            self.state.changed.notify_all();
            // Release between ops so other threads can interleave, as
            // they could between separate semop calls.
            drop(guard);
            guard = lock(&self.state.counters);
        }
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        let mut counters = lock(&self.state.counters);
        counters.removed = true;
        counters.values = [[0; 2]; 2];
        self.state.changed.notify_all();
        Ok(())
    }
}

/// One call observed by [`MemSegments`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentEvent {
    Created { key: Key, size: usize },
    Opened { key: Key },
    Mapped { key: Key },
    Unmapped { key: Key },
    Destroyed { key: Key },
}

/// Heap block standing in for a segment's memory.
#[derive(Debug)]
struct Block {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the block owns its allocation; access goes through the table lock
// or through mappings whose users synchronise via the counters.
unsafe impl Send for Block {}

impl Block {
    fn zeroed(len: usize) -> Self {
        let raw = Box::into_raw(vec![0u8; len].into_boxed_slice());
        // SAFETY: Box::into_raw never returns null.
        let ptr = unsafe { NonNull::new_unchecked(raw.cast::<u8>()) };
        Self { ptr, len }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        let raw = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
        // SAFETY: produced by Box::into_raw in `zeroed` with the same length.
        drop(unsafe { Box::from_raw(raw) });
    }
}

#[derive(Debug)]
struct Entry {
    id: u64,
    block: Block,
    maps: usize,
}

#[derive(Debug, Default)]
struct Table {
    next_id: u64,
    live: HashMap<Key, Entry>,
    /// Destroyed entries, kept until the store is dropped so that
    /// outstanding mappings stay readable like a removed System V segment.
    removed: Vec<(Key, Entry)>,
    events: Vec<SegmentEvent>,
}

/// Handle to a [`MemSegments`] segment.
#[derive(Debug)]
pub struct MemSegment {
    key: Key,
    id: u64,
}

impl MemSegment {
    #[must_use]
    pub const fn key(&self) -> Key {
        self.key
    }
}

/// Segment store in process memory that records every call.
#[derive(Debug, Clone, Default)]
pub struct MemSegments {
    table: Arc<Mutex<Table>>,
}

impl MemSegments {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys of segments created and not yet destroyed.
    #[must_use]
    pub fn live(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = lock(&self.table).live.keys().copied().collect();
        keys.sort();
        keys
    }

    #[must_use]
    pub fn is_live(&self, key: Key) -> bool {
        lock(&self.table).live.contains_key(&key)
    }

    /// Whether a segment named `key` was destroyed at least once.
    #[must_use]
    pub fn was_destroyed(&self, key: Key) -> bool {
        self.destroy_count(key) > 0
    }

    /// Number of times a segment named `key` was destroyed.
    #[must_use]
    pub fn destroy_count(&self, key: Key) -> usize {
        lock(&self.table)
            .events
            .iter()
            .filter(|event| matches!(event, SegmentEvent::Destroyed { key: k } if *k == key))
            .count()
    }

    /// Current number of mappings of the live segment named `key`.
    #[must_use]
    pub fn map_count(&self, key: Key) -> usize {
        lock(&self.table).live.get(&key).map_or(0, |entry| entry.maps)
    }

    #[must_use]
    pub fn events(&self) -> Vec<SegmentEvent> {
        lock(&self.table).events.clone()
    }
}

impl SegmentStore for MemSegments {
    type Segment = MemSegment;

    fn create_or_open(&self, key: Key, size: usize) -> Result<MemSegment> {
        let mut table = lock(&self.table);
        if let Some(entry) = table.live.get(&key) {
            if entry.block.len < size {
                return Err(Error::SizeMismatch {
                    name: key.to_string(),
                    requested: size,
                    actual: entry.block.len,
                });
            }
            let id = entry.id;
            table.events.push(SegmentEvent::Opened { key });
            return Ok(MemSegment { key, id });
        }
        if size == 0 {
            return Err(Error::sys("shmget", key, Errno::INVAL));
        }
        let id = table.next_id;
        table.next_id += 1;
        table.live.insert(
            key,
            Entry {
                id,
                block: Block::zeroed(size),
                maps: 0,
            },
        );
        table.events.push(SegmentEvent::Created { key, size });
        Ok(MemSegment { key, id })
    }

    fn map(&self, segment: &MemSegment) -> Result<Mapping> {
        let mut table = lock(&self.table);
        let entry = match table.live.get_mut(&segment.key) {
            Some(entry) if entry.id == segment.id => entry,
            _ => return Err(Error::sys("shmat", segment.key, Errno::IDRM)),
        };
        entry.maps += 1;
        // SAFETY: the block stays allocated until the table is dropped,
        // which outlives every mapping handed out by this store.
        let mapping = unsafe { Mapping::from_raw(entry.block.ptr, entry.block.len, segment.key) };
        table.events.push(SegmentEvent::Mapped { key: segment.key });
        Ok(mapping)
    }

    fn unmap(&self, mapping: Mapping) -> Result<()> {
        let mut table = lock(&self.table);
        let key = mapping.key();
        let Table { live, removed, .. } = &mut *table;
        let entry = live
            .get_mut(&key)
            .filter(|entry| entry.block.ptr.as_ptr() == mapping.as_ptr())
            .or_else(|| {
                removed
                    .iter_mut()
                    .find(|(_, entry)| entry.block.ptr.as_ptr() == mapping.as_ptr())
                    .map(|(_, entry)| entry)
            });
        match entry {
            Some(entry) if entry.maps > 0 => entry.maps -= 1,
            _ => return Err(Error::sys("shmdt", key, Errno::INVAL)),
        }
        table.events.push(SegmentEvent::Unmapped { key });
        Ok(())
    }

    fn destroy(&self, segment: MemSegment) -> Result<()> {
        let mut table = lock(&self.table);
        match table.live.remove(&segment.key) {
            Some(entry) if entry.id == segment.id => {
                table.removed.push((segment.key, entry));
                table.events.push(SegmentEvent::Destroyed { key: segment.key });
                Ok(())
            }
            Some(other) => {
                table.live.insert(segment.key, other);
                Err(Error::sys("shmctl", segment.key, Errno::IDRM))
            }
            None => Err(Error::sys("shmctl", segment.key, Errno::INVAL)),
        }
    }
}
