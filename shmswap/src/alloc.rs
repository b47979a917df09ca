//! Producer-side slot allocation with deferred destruction.
//!
//! # Slot lifecycle
//!
//! Every slot has a gate, a try-lock that is taken by [`SlotAllocator::allocate`]
//! and released only once the slot's segment has been destroyed:
//!
//! ```text
//!  allocate            free                       CONSEM == 0
//!  ─────────> Published ─────> Retired (waiting) ─────────────> Free
//!  gate taken  PROSEM 0→1       PROSEM 1→0          unmap, destroy,
//!                               thread spawned      gate released
//! ```
//!
//! While a slot is published or waiting for its consumers, its gate stays
//! taken and `allocate` moves on to the other slot. With both gates taken
//! the allocation is served from the heap instead of blocking.

use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::{fmt, mem};

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::lock;
use crate::segment::{Mapping, SegmentStore};
use crate::sem::{KeyedSemaphoreSet, SemaphoreBackend};
use crate::slot::{Counter, SlotIndex};
use crate::trace::{debug, error, trace, warn};

/// A writable buffer returned by [`SlotAllocator::allocate`].
///
/// Borrowing the allocator keeps the slot mapped for as long as the buffer
/// is alive. Hand it back through [`SlotAllocator::free`]; a buffer dropped
/// without `free` stays published until the allocator shuts down.
#[derive(Debug)]
pub enum Allocation<'a> {
    /// Memory of a shared slot, visible to consumers.
    Slot(SlotBuffer<'a>),
    /// Process-local memory handed out while both slots were busy.
    HeapFallback(Box<[u8]>),
}

/// The producer's view of a published slot.
pub struct SlotBuffer<'a> {
    slot: SlotIndex,
    ptr: NonNull<u8>,
    len: usize,
    _allocator: std::marker::PhantomData<&'a ()>,
}

// SAFETY: the view points into shared memory owned by the allocator, which
// outlives it; it carries no thread-local state.
unsafe impl Send for SlotBuffer<'_> {}

impl SlotBuffer<'_> {
    #[must_use]
    pub const fn slot(&self) -> SlotIndex {
        self.slot
    }
}

impl fmt::Debug for SlotBuffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotBuffer")
            .field("slot", &self.slot)
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

impl Allocation<'_> {
    /// Slot backing this buffer, `None` for a heap fallback.
    #[must_use]
    pub const fn slot(&self) -> Option<SlotIndex> {
        match self {
            Self::Slot(buffer) => Some(buffer.slot),
            Self::HeapFallback(_) => None,
        }
    }

    #[must_use]
    pub const fn is_fallback(&self) -> bool {
        matches!(self, Self::HeapFallback(_))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Slot(buffer) => buffer.len,
            Self::HeapFallback(bytes) => bytes.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        match self {
            Self::Slot(buffer) => buffer.ptr.as_ptr(),
            Self::HeapFallback(bytes) => bytes.as_ptr(),
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match self {
            // SAFETY: the slot stays mapped for `len` bytes while the
            // allocator is borrowed; only the producer writes to it.
            Self::Slot(buffer) => unsafe {
                std::slice::from_raw_parts(buffer.ptr.as_ptr(), buffer.len)
            },
            Self::HeapFallback(bytes) => bytes,
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            // SAFETY: as above, and `&mut self` makes this the only view in
            // this process.
            Self::Slot(buffer) => unsafe {
                std::slice::from_raw_parts_mut(buffer.ptr.as_ptr(), buffer.len)
            },
            Self::HeapFallback(bytes) => bytes,
        }
    }
}

impl Deref for Allocation<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl DerefMut for Allocation<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

struct LiveSlot<G> {
    segment: G,
    mapping: Mapping,
    /// `free` has run and a destruction thread owns the slot.
    retired: bool,
}

struct SlotCell<G> {
    gate: AtomicBool,
    live: Mutex<Option<LiveSlot<G>>>,
}

impl<G> SlotCell<G> {
    const fn new() -> Self {
        Self {
            gate: AtomicBool::new(false),
            live: Mutex::new(None),
        }
    }

    fn try_acquire(&self) -> bool {
        self.gate
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn release(&self) {
        self.gate.store(false, Ordering::Release);
    }
}

/// State shared with the destruction threads.
struct Shared<S: SemaphoreBackend, M: SegmentStore> {
    channel: Arc<Channel<S, M>>,
    cells: [SlotCell<M::Segment>; 2],
}

impl<S: SemaphoreBackend, M: SegmentStore> Shared<S, M> {
    const fn cell(&self, slot: SlotIndex) -> &SlotCell<M::Segment> {
        &self.cells[slot.index()]
    }

    /// Blocks until no consumer is attached to `slot`, then unmaps and
    /// destroys its segment and frees the slot for reuse.
    ///
    /// If the wait itself fails the gate stays taken: the segment may still
    /// be in use, so the slot is never handed out again.
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    fn wait_and_destroy(&self, slot: SlotIndex) -> Result<()> {
        debug!(%slot, key = %self.channel.key(slot), "waiting for consumers to detach");
        if let Err(err) = self
            .channel
            .semaphores()
            .wait_equal(slot, Counter::Consumers, 0)
        {
            error!(%slot, %err, "wait for consumers failed, slot stays reserved");
            return Err(err);
        }

        let cell = self.cell(slot);
        let taken = lock(&cell.live).take();
        let result = match taken {
            Some(live) => {
                let store = self.channel.store();
                let unmapped = store.unmap(live.mapping);
                let destroyed = store.destroy(live.segment);
                unmapped.and(destroyed)
            }
            None => Ok(()),
        };
        cell.release();

        match &result {
            Ok(()) => {
                trace!(%slot, "slot destroyed");
            }
            Err(err) => {
                error!(%slot, %err, "slot destruction failed");
            }
        }
        result
    }
}

/// Hands out the two slots of a channel to the producer, alternating, and
/// destroys retired slots once their consumers are gone.
pub struct SlotAllocator<S: SemaphoreBackend + 'static, M: SegmentStore + 'static> {
    shared: Arc<Shared<S, M>>,
    /// Slot handed out by the last successful allocation.
    last: Mutex<Option<SlotIndex>>,
    pending: Mutex<Vec<JoinHandle<Result<()>>>>,
    /// Errors of destruction threads reaped by `free`.
    failures: Mutex<Vec<Error>>,
}

impl<S: SemaphoreBackend + 'static, M: SegmentStore + 'static> SlotAllocator<S, M> {
    #[must_use]
    pub fn new(channel: Arc<Channel<S, M>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                channel,
                cells: [SlotCell::new(), SlotCell::new()],
            }),
            last: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn channel(&self) -> &Arc<Channel<S, M>> {
        &self.shared.channel
    }

    /// Whether `slot` holds a segment, published or waiting for destruction.
    #[must_use]
    pub fn is_live(&self, slot: SlotIndex) -> bool {
        lock(&self.shared.cell(slot).live).is_some()
    }

    /// Creates and publishes a buffer of `size` bytes.
    ///
    /// Takes the slot not used by the previous allocation (slot 0 first),
    /// or the previous one again if it has been destroyed meanwhile. With
    /// both slots busy the buffer comes from the heap and nothing is
    /// published.
    ///
    /// # Errors
    ///
    /// Segment creation, mapping or counter failure. The slot is released
    /// again before returning.
    pub fn allocate(&self, size: usize) -> Result<Allocation<'_>> {
        let mut last = lock(&self.last);
        let order = match *last {
            None => SlotIndex::ALL,
            Some(prev) => [prev.other(), prev],
        };
        let Some(slot) = order
            .into_iter()
            .find(|&slot| self.shared.cell(slot).try_acquire())
        else {
            warn!(size, "both slots busy, falling back to heap memory");
            return Ok(Allocation::HeapFallback(vec![0; size].into_boxed_slice()));
        };

        let live = match self.open_slot(slot, size) {
            Ok(live) => live,
            Err(err) => {
                self.shared.cell(slot).release();
                return Err(err);
            }
        };
        let ptr = live.mapping.as_non_null();
        *lock(&self.shared.cell(slot).live) = Some(live);
        *last = Some(slot);
        debug!(%slot, size, "slot published");

        Ok(Allocation::Slot(SlotBuffer {
            slot,
            ptr,
            len: size,
            _allocator: std::marker::PhantomData,
        }))
    }

    /// Creates, maps and publishes the segment of `slot`, undoing the
    /// earlier steps if a later one fails.
    fn open_slot(&self, slot: SlotIndex, size: usize) -> Result<LiveSlot<M::Segment>> {
        let channel = &self.shared.channel;
        let store = channel.store();
        let segment = store.create_or_open(channel.key(slot), size)?;
        let mapping = match store.map(&segment) {
            Ok(mapping) => mapping,
            Err(err) => {
                let _ = store.destroy(segment);
                return Err(err);
            }
        };
        if let Err(err) = publish(channel.semaphores(), slot) {
            let _ = store.unmap(mapping);
            let _ = store.destroy(segment);
            return Err(err);
        }
        Ok(LiveSlot {
            segment,
            mapping,
            retired: false,
        })
    }

    /// Releases a buffer returned by [`SlotAllocator::allocate`].
    ///
    /// Heap buffers are simply dropped. A slot buffer is unpublished and a
    /// background thread destroys its segment once no consumer is attached;
    /// this call does not wait for that.
    ///
    /// # Errors
    ///
    /// [`Error::ForeignBuffer`] if the buffer is not the one tracked for its
    /// slot, a counter failure, or [`Error::Spawn`].
    pub fn free(&self, allocation: Allocation<'_>) -> Result<()> {
        let Allocation::Slot(buffer) = allocation else {
            trace!("heap fallback buffer released");
            return Ok(());
        };
        let tracked = lock(&self.shared.cell(buffer.slot).live)
            .as_ref()
            .is_some_and(|live| !live.retired && live.mapping.as_ptr() == buffer.ptr.as_ptr());
        if !tracked {
            return Err(Error::ForeignBuffer { slot: buffer.slot });
        }
        self.retire(buffer.slot)?;
        self.reap_finished();
        Ok(())
    }

    /// Unpublishes `slot` and starts its destruction thread.
    fn retire(&self, slot: SlotIndex) -> Result<()> {
        unpublish(self.shared.channel.semaphores(), slot)?;
        self.set_retired(slot, true);
        debug!(%slot, "slot retired");

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("shmswap-destroy-{slot}"))
            .spawn(move || shared.wait_and_destroy(slot));
        match spawned {
            Ok(handle) => {
                lock(&self.pending).push(handle);
                Ok(())
            }
            Err(err) => {
                self.set_retired(slot, false);
                Err(Error::Spawn(err))
            }
        }
    }

    fn set_retired(&self, slot: SlotIndex, retired: bool) {
        if let Some(live) = lock(&self.shared.cell(slot).live).as_mut() {
            live.retired = retired;
        }
    }

    /// Joins destruction threads that are already done, keeping their
    /// errors for [`SlotAllocator::join_pending`].
    fn reap_finished(&self) {
        let finished: Vec<_> = {
            let mut pending = lock(&self.pending);
            let (done, running): (Vec<_>, Vec<_>) = mem::take(&mut *pending)
                .into_iter()
                .partition(JoinHandle::is_finished);
            *pending = running;
            done
        };
        let mut failures = lock(&self.failures);
        for handle in finished {
            if let Err(err) = join(handle) {
                failures.push(err);
            }
        }
    }

    /// Waits for every outstanding destruction.
    ///
    /// # Errors
    ///
    /// The first error reported by a destruction thread since the last call.
    pub fn join_pending(&self) -> Result<()> {
        let handles = mem::take(&mut *lock(&self.pending));
        let mut failures = mem::take(&mut *lock(&self.failures));
        for handle in handles {
            if let Err(err) = join(handle) {
                failures.push(err);
            }
        }
        failures.into_iter().next().map_or(Ok(()), Err)
    }

    /// Retires every slot still published and waits until all slots are
    /// destroyed.
    ///
    /// Blocks while consumers stay attached.
    ///
    /// # Errors
    ///
    /// The first retire or destruction error.
    pub fn shutdown(self) -> Result<()> {
        let retired = self.retire_remaining();
        let joined = self.join_pending();
        retired.and(joined)
    }

    fn retire_remaining(&self) -> Result<()> {
        let mut first_error = None;
        for slot in SlotIndex::ALL {
            let published = lock(&self.shared.cell(slot).live)
                .as_ref()
                .is_some_and(|live| !live.retired);
            if published && let Err(err) = self.retire(slot) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl<S: SemaphoreBackend + 'static, M: SegmentStore + 'static> Drop for SlotAllocator<S, M> {
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    fn drop(&mut self) {
        if let Err(err) = self.retire_remaining() {
            error!(%err, "failed to retire slots on drop");
        }
        if let Err(err) = self.join_pending() {
            error!(%err, "slot destruction failed on drop");
        }
    }
}

impl<S: SemaphoreBackend + 'static, M: SegmentStore + 'static> fmt::Debug for SlotAllocator<S, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotAllocator")
            .field("channel", self.channel())
            .field("last", &*lock(&self.last))
            .field("pending", &lock(&self.pending).len())
            .finish_non_exhaustive()
    }
}

/// Raises `PROSEM` to one unless it is already nonzero.
fn publish<S: SemaphoreBackend>(sems: &KeyedSemaphoreSet<S>, slot: SlotIndex) -> Result<()> {
    if sems.get(slot, Counter::Producer)? == 0 {
        sems.increment(slot, Counter::Producer)?;
    }
    Ok(())
}

/// Lowers `PROSEM` unless it is already zero, so a repeated unpublish never
/// blocks.
fn unpublish<S: SemaphoreBackend>(sems: &KeyedSemaphoreSet<S>, slot: SlotIndex) -> Result<()> {
    if sems.get(slot, Counter::Producer)? > 0 {
        sems.decrement(slot, Counter::Producer)?;
    }
    Ok(())
}

fn join(handle: JoinHandle<Result<()>>) -> Result<()> {
    match handle.join() {
        Ok(result) => result,
        Err(payload) => std::panic::resume_unwind(payload),
    }
}
