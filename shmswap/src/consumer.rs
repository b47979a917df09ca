//! Consumer side of a channel.
//!
//! A consumer follows the producer from slot to slot:
//!
//! ```text
//! Unlocated ──find_active──> Current(s) ──update_key──> Current(!s) ──> ...
//! ```
//!
//! Every slot the handle maps is counted once in that slot's `CONSEM`, and
//! the producer destroys a retired slot only when its count is back at
//! zero. Detaching from the previous slot is what lets that happen.

use std::sync::Arc;

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::segment::{Mapping, SegmentStore};
use crate::sem::SemaphoreBackend;
use crate::slot::{Counter, SlotIndex};
use crate::trace::{debug, error, trace};
use crate::wait::{PollPolicy, WaitMode};

struct Attachment<G> {
    /// Kept open for as long as the mapping is in use.
    _segment: G,
    mapping: Mapping,
}

/// Tracks the producer's published slot and maps it for reading.
pub struct ConsumerHandle<S: SemaphoreBackend, M: SegmentStore> {
    channel: Arc<Channel<S, M>>,
    size: usize,
    current: Option<SlotIndex>,
    attached: [Option<Attachment<M::Segment>>; 2],
}

impl<S: SemaphoreBackend, M: SegmentStore> ConsumerHandle<S, M> {
    /// Creates an unlocated handle. Segments are opened with the channel's
    /// configured segment size.
    #[must_use]
    pub fn new(channel: Arc<Channel<S, M>>) -> Self {
        let size = channel.segment_size();
        Self {
            channel,
            size,
            current: None,
            attached: [None, None],
        }
    }

    #[must_use]
    pub const fn current_slot(&self) -> Option<SlotIndex> {
        self.current
    }

    #[must_use]
    pub const fn is_attached(&self, slot: SlotIndex) -> bool {
        self.attached[slot.index()].is_some()
    }

    /// First slot whose `PROSEM` is nonzero. Never blocks.
    ///
    /// # Errors
    ///
    /// Backend error.
    pub fn find_active(&self) -> Result<Option<SlotIndex>> {
        let sems = self.channel.semaphores();
        for slot in SlotIndex::ALL {
            if sems.get(slot, Counter::Producer)? > 0 {
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    /// Maps the current slot and returns its bytes.
    ///
    /// Mapping a slot raises its `CONSEM` once; calling again while mapped
    /// returns the same memory without touching the counter.
    ///
    /// # Errors
    ///
    /// [`Error::NotLocated`] before the first [`ConsumerHandle::update_key`],
    /// or a segment or counter failure.
    pub fn attach(&mut self) -> Result<&[u8]> {
        let slot = self.current.ok_or(Error::NotLocated)?;
        if self.attached[slot.index()].is_none() {
            let attachment = self.map(slot)?;
            self.attached[slot.index()] = Some(attachment);
        }
        self.view().ok_or(Error::NotLocated)
    }

    fn map(&self, slot: SlotIndex) -> Result<Attachment<M::Segment>> {
        let store = self.channel.store();
        let segment = store.create_or_open(self.channel.key(slot), self.size)?;
        let mapping = store.map(&segment)?;
        if let Err(err) = self
            .channel
            .semaphores()
            .increment(slot, Counter::Consumers)
        {
            let _ = store.unmap(mapping);
            return Err(err);
        }
        debug!(%slot, len = mapping.len(), "attached");
        Ok(Attachment {
            _segment: segment,
            mapping,
        })
    }

    /// Bytes of the current slot, if mapped.
    #[must_use]
    pub fn view(&self) -> Option<&[u8]> {
        let slot = self.current?;
        let attachment = self.attached[slot.index()].as_ref()?;
        // SAFETY: mapped until released by this handle; the producer only
        // writes a slot before publishing it.
        Some(unsafe { attachment.mapping.bytes() })
    }

    /// Unmaps the current slot (`current == true`) or the one before it, and
    /// lowers that slot's `CONSEM`. Does nothing if it is not mapped.
    ///
    /// # Errors
    ///
    /// Unmap or counter failure.
    pub fn detach(&mut self, current: bool) -> Result<()> {
        let Some(cur) = self.current else {
            return Ok(());
        };
        self.release(if current { cur } else { cur.other() })
    }

    fn release(&mut self, slot: SlotIndex) -> Result<()> {
        let Some(attachment) = self.attached[slot.index()].take() else {
            return Ok(());
        };
        let unmapped = self.channel.store().unmap(attachment.mapping);
        let lowered = self
            .channel
            .semaphores()
            .decrement(slot, Counter::Consumers);
        trace!(%slot, "detached");
        unmapped.and(lowered)
    }

    /// Unmaps both slots.
    ///
    /// # Errors
    ///
    /// The first unmap or counter failure; the other slot is still released.
    pub fn detach_all(&mut self) -> Result<()> {
        let zero = self.release(SlotIndex::Zero);
        let one = self.release(SlotIndex::One);
        zero.and(one)
    }

    /// Moves to the producer's next slot.
    ///
    /// The first call polls [`ConsumerHandle::find_active`] until the
    /// producer has published something. Later calls wait for the slot after
    /// the current one to be published, blocking in the counter primitive or
    /// polling as `mode` says. Only the current slot index changes; mapping
    /// is left to [`ConsumerHandle::attach`].
    ///
    /// A stale mapping of the slot being waited for is released first, since
    /// the producer cannot recreate that slot while it is counted.
    ///
    /// # Errors
    ///
    /// Backend error, or the polling policy's cancellation or deadline.
    pub fn update_key(&mut self, mode: &WaitMode) -> Result<SlotIndex> {
        let Some(cur) = self.current else {
            let spin = PollPolicy::spin();
            let policy = match mode {
                WaitMode::Block => &spin,
                WaitMode::Poll(policy) => policy,
            };
            let slot = policy.poll_until(|| self.find_active())?;
            debug!(%slot, "located published slot");
            self.current = Some(slot);
            return Ok(slot);
        };

        let next = cur.other();
        self.release(next)?;
        let sems = self.channel.semaphores();
        match mode {
            WaitMode::Block => sems.wait_at_least(next, Counter::Producer, 1)?,
            WaitMode::Poll(policy) => {
                sems.poll(next, Counter::Producer, policy, |value| value > 0)?;
            }
        }
        debug!(from = %cur, to = %next, "switched slot");
        self.current = Some(next);
        Ok(next)
    }

    /// Full handoff: [`update_key`](Self::update_key), then
    /// [`attach`](Self::attach), then release the previous slot.
    ///
    /// # Errors
    ///
    /// Any error of the three steps.
    pub fn advance(&mut self, mode: &WaitMode) -> Result<&[u8]> {
        self.update_key(mode)?;
        self.attach()?;
        self.detach(false)?;
        self.view().ok_or(Error::NotLocated)
    }
}

impl<S: SemaphoreBackend, M: SegmentStore> std::fmt::Debug for ConsumerHandle<S, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("channel", self.channel.id())
            .field("current", &self.current)
            .field("attached", &SlotIndex::ALL.map(|slot| self.is_attached(slot)))
            .finish()
    }
}

impl<S: SemaphoreBackend, M: SegmentStore> Drop for ConsumerHandle<S, M> {
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    fn drop(&mut self) {
        if let Err(err) = self.detach_all() {
            error!(%err, "failed to detach consumer on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::channel::{ChannelConfig, Role};
    use crate::mem::{MemSegments, MemSemaphores};
    use crate::slot::Key;
    use crate::wait::CancelToken;

    type MemChannel = Channel<MemSemaphores, MemSegments>;

    fn channel() -> Arc<MemChannel> {
        let channel = Channel::new(
            ChannelConfig::default().with_role(Role::Follower),
            [Key::new(40), Key::new(41)],
            MemSemaphores::new(),
            MemSegments::new(),
        )
        .unwrap();
        Arc::new(channel)
    }

    /// Stands in for the producer: creates and publishes `slot`.
    fn publish(channel: &MemChannel, slot: SlotIndex, fill: u8) {
        let store = channel.store();
        let segment = store.create_or_open(channel.key(slot), 8).unwrap();
        let mapping = store.map(&segment).unwrap();
        // SAFETY: freshly mapped 8 bytes.
        unsafe { mapping.as_ptr().write_bytes(fill, 8) };
        store.unmap(mapping).unwrap();
        channel
            .semaphores()
            .increment(slot, Counter::Producer)
            .unwrap();
    }

    fn consem(channel: &MemChannel, slot: SlotIndex) -> u32 {
        channel.consumer_count(slot).unwrap()
    }

    #[test]
    fn test_find_active_before_publish() {
        let channel = channel();
        let consumer = ConsumerHandle::new(Arc::clone(&channel));
        assert_eq!(consumer.find_active().unwrap(), None);
        publish(&channel, SlotIndex::One, 1);
        assert_eq!(consumer.find_active().unwrap(), Some(SlotIndex::One));
    }

    #[test]
    fn test_attach_requires_location() {
        let mut consumer = ConsumerHandle::new(channel());
        assert!(matches!(consumer.attach(), Err(Error::NotLocated)));
        assert!(consumer.view().is_none());
        consumer.detach(true).unwrap();
    }

    #[test]
    fn test_double_attach_counts_once() {
        let channel = channel();
        publish(&channel, SlotIndex::Zero, 7);
        let mut consumer = ConsumerHandle::new(Arc::clone(&channel));
        assert_eq!(consumer.update_key(&WaitMode::Block).unwrap(), SlotIndex::Zero);

        let first = consumer.attach().unwrap().as_ptr();
        let second = consumer.attach().unwrap().as_ptr();
        assert_eq!(first, second);
        assert_eq!(consem(&channel, SlotIndex::Zero), 1);
        assert_eq!(consumer.view().unwrap(), &[7; 8]);

        consumer.detach(true).unwrap();
        assert_eq!(consem(&channel, SlotIndex::Zero), 0);
        consumer.detach(true).unwrap();
        assert_eq!(consem(&channel, SlotIndex::Zero), 0);
    }

    #[test]
    fn test_advance_releases_previous_slot() {
        let channel = channel();
        publish(&channel, SlotIndex::Zero, 1);
        let mut consumer = ConsumerHandle::new(Arc::clone(&channel));
        assert_eq!(consumer.advance(&WaitMode::Block).unwrap(), &[1; 8]);

        publish(&channel, SlotIndex::One, 2);
        assert_eq!(consumer.advance(&WaitMode::Block).unwrap(), &[2; 8]);
        assert_eq!(consumer.current_slot(), Some(SlotIndex::One));
        assert!(!consumer.is_attached(SlotIndex::Zero));
        assert_eq!(consem(&channel, SlotIndex::Zero), 0);
        assert_eq!(consem(&channel, SlotIndex::One), 1);

        drop(consumer);
        assert_eq!(consem(&channel, SlotIndex::One), 0);
    }

    #[test]
    fn test_update_key_releases_stale_mapping() {
        let channel = channel();
        publish(&channel, SlotIndex::Zero, 1);
        publish(&channel, SlotIndex::One, 2);
        let mut consumer = ConsumerHandle::new(Arc::clone(&channel));
        consumer.update_key(&WaitMode::Block).unwrap();
        consumer.attach().unwrap();
        consumer.update_key(&WaitMode::Block).unwrap();
        consumer.attach().unwrap();
        assert!(consumer.is_attached(SlotIndex::Zero));
        assert!(consumer.is_attached(SlotIndex::One));

        // Waiting for slot 0 again drops the old slot 0 mapping.
        consumer.update_key(&WaitMode::Block).unwrap();
        assert_eq!(consem(&channel, SlotIndex::Zero), 0);
        assert_eq!(consem(&channel, SlotIndex::One), 1);
    }

    #[test]
    fn test_polling_wait_can_be_cancelled() {
        let channel = channel();
        publish(&channel, SlotIndex::Zero, 1);
        let mut consumer = ConsumerHandle::new(Arc::clone(&channel));
        consumer.advance(&WaitMode::Block).unwrap();

        let token = CancelToken::new();
        let mode = WaitMode::from(
            PollPolicy::every(Duration::from_millis(1)).with_cancel(token.clone()),
        );
        token.cancel();
        assert!(matches!(consumer.update_key(&mode), Err(Error::Cancelled)));
        assert_eq!(consumer.current_slot(), Some(SlotIndex::Zero));
    }

    #[test]
    fn test_first_location_honours_deadline() {
        let mut consumer = ConsumerHandle::new(channel());
        let mode = WaitMode::Poll(
            PollPolicy::every(Duration::from_millis(1)).with_deadline(Duration::from_millis(5)),
        );
        assert!(matches!(consumer.update_key(&mode), Err(Error::TimedOut)));
        assert_eq!(consumer.current_slot(), None);
    }
}
