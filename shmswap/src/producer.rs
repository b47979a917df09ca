//! Producer side of a channel.

use std::sync::Arc;

use crate::alloc::{Allocation, SlotAllocator};
use crate::channel::Channel;
use crate::error::Result;
use crate::segment::SegmentStore;
use crate::sem::SemaphoreBackend;

/// Publishes successive buffer versions on a channel.
///
/// Write a buffer completely before a consumer can be expected to read it:
/// `publish` makes the slot visible straight away, so readers that are
/// already waiting may see it while it is being filled.
#[derive(Debug)]
pub struct ProducerHandle<S: SemaphoreBackend + 'static, M: SegmentStore + 'static> {
    allocator: SlotAllocator<S, M>,
}

impl<S: SemaphoreBackend + 'static, M: SegmentStore + 'static> ProducerHandle<S, M> {
    #[must_use]
    pub fn new(channel: Arc<Channel<S, M>>) -> Self {
        Self {
            allocator: SlotAllocator::new(channel),
        }
    }

    #[must_use]
    pub const fn allocator(&self) -> &SlotAllocator<S, M> {
        &self.allocator
    }

    /// Allocates and publishes a buffer of `size` bytes.
    ///
    /// # Errors
    ///
    /// See [`SlotAllocator::allocate`].
    pub fn publish(&self, size: usize) -> Result<Allocation<'_>> {
        self.allocator.allocate(size)
    }

    /// Retires a published buffer. `None` does nothing.
    ///
    /// # Errors
    ///
    /// See [`SlotAllocator::free`].
    pub fn retire(&self, buffer: Option<Allocation<'_>>) -> Result<()> {
        match buffer {
            Some(buffer) => self.allocator.free(buffer),
            None => Ok(()),
        }
    }

    /// Publishes a new buffer of `size` bytes carrying the contents of
    /// `previous`, then retires `previous`.
    ///
    /// The overlapping prefix is copied; a larger new buffer keeps zeroes
    /// past the old length.
    ///
    /// # Errors
    ///
    /// Allocation or retire failure. If retiring fails the new buffer has
    /// already been published and stays so until shutdown.
    pub fn republish<'a>(
        &'a self,
        previous: Option<Allocation<'a>>,
        size: usize,
    ) -> Result<Allocation<'a>> {
        let mut next = self.publish(size)?;
        if let Some(previous) = previous {
            let len = previous.len().min(next.len());
            next[..len].copy_from_slice(&previous[..len]);
            self.retire(Some(previous))?;
        }
        Ok(next)
    }

    /// Waits for all retired buffers to be destroyed.
    ///
    /// # Errors
    ///
    /// See [`SlotAllocator::join_pending`].
    pub fn join_pending(&self) -> Result<()> {
        self.allocator.join_pending()
    }

    /// Retires what is still published and waits for every destruction.
    ///
    /// # Errors
    ///
    /// See [`SlotAllocator::shutdown`].
    pub fn shutdown(self) -> Result<()> {
        self.allocator.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;
    use crate::mem::{MemSegments, MemSemaphores};
    use crate::slot::{Key, SlotIndex};

    fn producer() -> (ProducerHandle<MemSemaphores, MemSegments>, MemSegments) {
        let store = MemSegments::new();
        let channel = Channel::new(
            ChannelConfig::default(),
            [Key::new(30), Key::new(31)],
            MemSemaphores::new(),
            store.clone(),
        )
        .unwrap();
        (ProducerHandle::new(Arc::new(channel)), store)
    }

    #[test]
    fn test_retire_none_is_noop() {
        let (producer, store) = producer();
        producer.retire(None).unwrap();
        assert!(store.events().is_empty());
    }

    #[test]
    fn test_republish_copies_forward() {
        let (producer, store) = producer();
        let mut first = producer.publish(4).unwrap();
        first.copy_from_slice(&[9, 8, 7, 6]);

        let second = producer.republish(Some(first), 6).unwrap();
        assert_eq!(second.slot(), Some(SlotIndex::One));
        assert_eq!(&*second, &[9, 8, 7, 6, 0, 0]);
        // Slot 0 is reusable once its destruction has run.
        producer.join_pending().unwrap();

        let third = producer.republish(Some(second), 2).unwrap();
        assert_eq!(third.slot(), Some(SlotIndex::Zero));
        assert_eq!(&*third, &[9, 8]);

        producer.retire(Some(third)).unwrap();
        producer.join_pending().unwrap();
        assert!(store.live().is_empty());
    }

    #[test]
    fn test_republish_without_previous() {
        let (producer, _store) = producer();
        let buffer = producer.republish(None, 3).unwrap();
        assert_eq!(&*buffer, &[0, 0, 0]);
        producer.retire(Some(buffer)).unwrap();
        producer.shutdown().unwrap();
    }
}
