//! Keyed shared memory segments.

use std::ptr::NonNull;

use crate::error::Result;
use crate::slot::Key;

/// A segment mapped into this process.
///
/// A `Mapping` is a raw view: it does not unmap on drop. It is handed back
/// to [`SegmentStore::unmap`] by whoever created it.
#[derive(Debug)]
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
    key: Key,
}

// SAFETY: the mapping points at shared memory, not thread-local data, and
// carries no aliasing guarantees of its own.
unsafe impl Send for Mapping {}
// SAFETY: see above; readers and writers synchronise through the counters.
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Wraps a mapped region.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `len` bytes that stay mapped until the mapping is
    /// passed to [`SegmentStore::unmap`].
    #[must_use]
    pub const unsafe fn from_raw(ptr: NonNull<u8>, len: usize, key: Key) -> Self {
        Self { ptr, len, key }
    }

    #[must_use]
    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[must_use]
    pub const fn as_non_null(&self) -> NonNull<u8> {
        self.ptr
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn key(&self) -> Key {
        self.key
    }

    /// The mapped bytes.
    ///
    /// # Safety
    ///
    /// The region must not be written concurrently while the slice is alive.
    /// Consumers rely on the producer writing a slot before publishing it.
    #[must_use]
    pub unsafe fn bytes(&self) -> &[u8] {
        // SAFETY: mapped for `len` bytes per the constructor contract.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

/// Creates, maps and destroys segments named by [`Key`].
///
/// Destroying a segment removes its name; memory already mapped stays
/// valid until unmapped, as with System V `IPC_RMID`.
pub trait SegmentStore: Send + Sync {
    /// Handle to an existing segment. Dropping it does not destroy the
    /// segment.
    type Segment: Send;

    /// Opens the segment named `key`, creating it with `size` bytes if it
    /// does not exist.
    ///
    /// A `size` of zero only opens: a missing segment is an error and
    /// nothing is created.
    fn create_or_open(&self, key: Key, size: usize) -> Result<Self::Segment>;

    /// Maps the whole segment into this process.
    fn map(&self, segment: &Self::Segment) -> Result<Mapping>;

    /// Unmaps a mapping returned by [`SegmentStore::map`].
    fn unmap(&self, mapping: Mapping) -> Result<()>;

    /// Removes the segment from the system.
    fn destroy(&self, segment: Self::Segment) -> Result<()>;
}
