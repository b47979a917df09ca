//! POSIX shared memory objects (`shm_open`, `mmap`).
//!
//! - [`ShmObject`] - an open named object, created empty and sized on first use
//! - [`Shm`] - a typed mapping of a whole object, unmapped on drop
//! - [`PosixSegments`] - a [`SegmentStore`] naming one object per key
//!
//! Objects outlive the processes that create them. They are removed only by
//! an explicit unlink.

use std::mem::size_of;
use std::ops::Deref;
use std::os::fd::OwnedFd;
use std::ptr::{NonNull, null_mut};
use std::sync::atomic::{AtomicU32, AtomicU64};

use rustix::fs::{Mode, fstat, ftruncate};
use rustix::io::Errno;
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::shm;

use crate::error::{Error, Result};
use crate::segment::{Mapping, SegmentStore};
use crate::slot::Key;

const POSIX_NAME_MAX: usize = 255;

/// Checks that `name` is a portable shared memory object name.
///
/// # Errors
///
/// [`Error::InvalidName`] naming the broken rule.
pub fn validate_shm_name(name: &str) -> Result<()> {
    let invalid = |reason| Error::InvalidName {
        name: name.to_string(),
        reason,
    };
    if !name.starts_with('/') {
        return Err(invalid("name must start with '/'"));
    }
    if name[1..].contains('/') {
        return Err(invalid("name must not contain additional '/' characters"));
    }
    if name.len() > POSIX_NAME_MAX {
        return Err(invalid("name length must be <= 255 bytes"));
    }
    Ok(())
}

/// `rw` for everyone, so processes of other users can join the channel.
fn open_mode() -> Mode {
    Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP | Mode::ROTH | Mode::WOTH
}

/// An open POSIX shared memory object.
#[derive(Debug)]
pub struct ShmObject {
    fd: OwnedFd,
    name: String,
    len: usize,
}

impl ShmObject {
    /// Opens `name`, creating it if needed.
    ///
    /// An empty object (freshly created, or left empty by a crashed creator)
    /// is grown to `size` bytes of zeroes. A non-empty object keeps its
    /// length, which may differ from `size`.
    ///
    /// # Errors
    ///
    /// Invalid name, or `shm_open`/`fstat`/`ftruncate` failure.
    pub fn open_or_create(name: &str, size: usize) -> Result<Self> {
        Self::open_with(name, shm::OFlags::CREATE | shm::OFlags::RDWR, size)
    }

    /// Opens an existing object at its current length.
    ///
    /// # Errors
    ///
    /// Invalid name, `ENOENT` if no object has that name, or `fstat` failure.
    pub fn open(name: &str) -> Result<Self> {
        Self::open_with(name, shm::OFlags::RDWR, 0)
    }

    fn open_with(name: &str, flags: shm::OFlags, size: usize) -> Result<Self> {
        validate_shm_name(name)?;
        let fd = shm::open(name, flags, open_mode())
            .map_err(|err| Error::posix("shm_open", name, err))?;
        let stat = fstat(&fd).map_err(|err| Error::posix("fstat", name, err))?;
        let mut len = usize::try_from(stat.st_size).unwrap_or(0);
        if len == 0 && size > 0 {
            ftruncate(&fd, size as u64).map_err(|err| Error::posix("ftruncate", name, err))?;
            len = size;
        }
        Ok(Self {
            fd,
            name: name.to_string(),
            len,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maps the whole object read-write and shared.
    ///
    /// # Errors
    ///
    /// `mmap` failure; mapping an empty object fails with `EINVAL`.
    pub fn map(&self) -> Result<NonNull<u8>> {
        if self.len == 0 {
            return Err(Error::posix("mmap", &self.name, Errno::INVAL));
        }
        // SAFETY: a fresh shared mapping of a descriptor we own; no existing
        // memory is replaced.
        let ptr = unsafe {
            mmap(
                null_mut(),
                self.len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &self.fd,
                0,
            )
        }
        .map_err(|err| Error::posix("mmap", &self.name, err))?;
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| Error::posix("mmap", &self.name, Errno::FAULT))
    }

    /// Removes the name. Existing mappings stay valid.
    ///
    /// # Errors
    ///
    /// `shm_unlink` failure.
    pub fn unlink(&self) -> Result<()> {
        unlink(&self.name)
    }
}

fn unlink(name: &str) -> Result<()> {
    shm::unlink(name).map_err(|err| Error::posix("shm_unlink", name, err))
}

/// Types that are valid when all their bytes are zero and can be shared
/// between processes through a mapping.
///
/// # Safety
///
/// Implementors must be `repr(C)` or primitive, contain no pointers, and be
/// valid when zero-filled (a new object is zero-filled by `ftruncate`).
pub unsafe trait SharedMemorySafe: Send + Sync {}

// SAFETY: plain atomics, valid at zero.
unsafe impl SharedMemorySafe for AtomicU32 {}
// SAFETY: plain atomics, valid at zero.
unsafe impl SharedMemorySafe for AtomicU64 {}
// SAFETY: arrays of zero-valid elements are zero-valid.
unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for [T; N] {}

/// A `T` living in a named shared memory object.
///
/// Every process opening the same name sees the same `T`. Dropping unmaps;
/// the object itself stays until [`Shm::unlink`].
pub struct Shm<T: SharedMemorySafe> {
    ptr: NonNull<T>,
    len: usize,
    name: String,
}

// SAFETY: `T: SharedMemorySafe` is Send + Sync and the mapping is shared.
unsafe impl<T: SharedMemorySafe> Send for Shm<T> {}
// SAFETY: as above.
unsafe impl<T: SharedMemorySafe> Sync for Shm<T> {}

impl<T: SharedMemorySafe> Shm<T> {
    /// Opens the object named `name`, creating a zeroed `T` if it is new.
    ///
    /// # Errors
    ///
    /// [`Error::SizeMismatch`] if an existing object is too small for `T`,
    /// or an open/map failure.
    pub fn open_or_create(name: &str) -> Result<Self> {
        let object = ShmObject::open_or_create(name, size_of::<T>())?;
        if object.len() < size_of::<T>() {
            return Err(Error::SizeMismatch {
                name: name.to_string(),
                requested: size_of::<T>(),
                actual: object.len(),
            });
        }
        let ptr = object.map()?;
        Ok(Self {
            ptr: ptr.cast::<T>(),
            len: object.len(),
            name: object.name,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Removes the object's name so later opens start from zero.
    ///
    /// # Errors
    ///
    /// `shm_unlink` failure.
    pub fn unlink(&self) -> Result<()> {
        unlink(&self.name)
    }
}

impl<T: SharedMemorySafe> Deref for Shm<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: mapped for at least size_of::<T>() bytes until drop, and
        // zero bytes are a valid T.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: SharedMemorySafe> Drop for Shm<T> {
    fn drop(&mut self) {
        // SAFETY: unmapping the region mapped in `open_or_create`.
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

/// Slot segments as POSIX shared memory objects named `{prefix}-{key}`.
#[derive(Debug, Clone)]
pub struct PosixSegments {
    prefix: String,
}

/// An open slot object.
#[derive(Debug)]
pub struct PosixSegment {
    key: Key,
    object: ShmObject,
}

impl PosixSegment {
    #[must_use]
    pub const fn key(&self) -> Key {
        self.key
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.object.name()
    }
}

impl PosixSegments {
    pub const DEFAULT_PREFIX: &'static str = "/shmswap";

    /// # Errors
    ///
    /// [`Error::InvalidName`] if names built from `prefix` are invalid.
    pub fn new(prefix: &str) -> Result<Self> {
        let store = Self {
            prefix: prefix.to_string(),
        };
        validate_shm_name(&store.segment_name(Key::new(0)))?;
        Ok(store)
    }

    #[must_use]
    pub fn segment_name(&self, key: Key) -> String {
        format!("{}-{:08x}", self.prefix, key.raw() as u32)
    }
}

impl SegmentStore for PosixSegments {
    type Segment = PosixSegment;

    fn create_or_open(&self, key: Key, size: usize) -> Result<PosixSegment> {
        let name = self.segment_name(key);
        let object = if size == 0 {
            ShmObject::open(&name)?
        } else {
            ShmObject::open_or_create(&name, size)?
        };
        if object.len() < size {
            return Err(Error::SizeMismatch {
                name,
                requested: size,
                actual: object.len(),
            });
        }
        Ok(PosixSegment { key, object })
    }

    fn map(&self, segment: &PosixSegment) -> Result<Mapping> {
        let ptr = segment.object.map()?;
        // SAFETY: `ptr` maps the object's full length until `unmap`.
        Ok(unsafe { Mapping::from_raw(ptr, segment.object.len(), segment.key) })
    }

    fn unmap(&self, mapping: Mapping) -> Result<()> {
        // SAFETY: `mapping` came from `map` and is unmapped exactly once.
        unsafe { munmap(mapping.as_ptr().cast(), mapping.len()) }
            .map_err(|err| Error::posix("munmap", &self.segment_name(mapping.key()), err))
    }

    fn destroy(&self, segment: PosixSegment) -> Result<()> {
        segment.object.unlink()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;

    fn skip(test: &str, err: &Error) -> bool {
        if err.is_unsupported() {
            eprintln!("Skipping {test}: {err}");
            return true;
        }
        false
    }

    #[test]
    fn test_shm_shared_between_openers() -> Result<()> {
        let name = "/shmswap-test-shared";
        let _ = shm::unlink(name);

        let first = match Shm::<[AtomicU64; 2]>::open_or_create(name) {
            Ok(shm) => shm,
            Err(err) if skip("test_shm_shared_between_openers", &err) => return Ok(()),
            Err(err) => return Err(err),
        };
        assert_eq!(first[0].load(Ordering::SeqCst), 0);
        first[1].store(100, Ordering::SeqCst);

        {
            let second = Shm::<[AtomicU64; 2]>::open_or_create(name)?;
            assert_eq!(second[1].load(Ordering::SeqCst), 100);
            second[0].store(7, Ordering::SeqCst);
        }

        assert_eq!(first[0].load(Ordering::SeqCst), 7);
        first.unlink()?;
        Ok(())
    }

    #[test]
    fn test_shm_too_small_for_type() -> Result<()> {
        let name = "/shmswap-test-size-mismatch";
        let _ = shm::unlink(name);

        let small = match Shm::<AtomicU32>::open_or_create(name) {
            Ok(shm) => shm,
            Err(err) if skip("test_shm_too_small_for_type", &err) => return Ok(()),
            Err(err) => return Err(err),
        };
        let result = Shm::<[AtomicU64; 3]>::open_or_create(name);
        small.unlink()?;
        match result {
            Err(Error::SizeMismatch {
                requested, actual, ..
            }) => {
                assert_eq!(requested, size_of::<[AtomicU64; 3]>());
                assert_eq!(actual, size_of::<AtomicU32>());
            }
            Err(err) => panic!("expected SizeMismatch, got: {err}"),
            Ok(_) => panic!("expected SizeMismatch, but open succeeded"),
        }
        Ok(())
    }

    #[test]
    fn test_posix_segments_lifecycle() -> Result<()> {
        let store = PosixSegments::new("/shmswap-test-seg")?;
        let key = Key::new(0x51);
        let _ = shm::unlink(store.segment_name(key).as_str());

        let segment = match store.create_or_open(key, 64) {
            Ok(segment) => segment,
            Err(err) if skip("test_posix_segments_lifecycle", &err) => return Ok(()),
            Err(err) => return Err(err),
        };
        assert_eq!(segment.name(), "/shmswap-test-seg-00000051");
        let writer = store.map(&segment)?;
        let reader_segment = store.create_or_open(key, 0)?;
        let reader = store.map(&reader_segment)?;
        assert_eq!(reader.len(), 64);
        // SAFETY: both views cover the same 64 live bytes.
        unsafe {
            writer.as_ptr().write_bytes(0xab, 64);
            assert!(reader.bytes().iter().all(|&b| b == 0xab));
        }
        assert!(matches!(
            store.create_or_open(key, 128),
            Err(Error::SizeMismatch { .. })
        ));

        store.destroy(segment)?;
        // Removal keeps existing views readable.
        // SAFETY: the mapping is still live.
        assert_eq!(unsafe { reader.bytes()[63] }, 0xab);
        store.unmap(writer)?;
        store.unmap(reader)?;
        Ok(())
    }

    #[test]
    fn test_validate_shm_name_valid() {
        assert!(validate_shm_name("/valid").is_ok());
        assert!(validate_shm_name("/valid-name").is_ok());
        assert!(validate_shm_name("/valid_name_123").is_ok());
    }

    #[test]
    fn test_validate_shm_name_no_leading_slash() {
        let result = validate_shm_name("no-slash");
        assert!(matches!(
            result,
            Err(Error::InvalidName { reason, .. }) if reason == "name must start with '/'"
        ));
    }

    #[test]
    fn test_validate_shm_name_extra_slashes() {
        for name in ["/foo/bar", "/foo/bar/baz"] {
            assert!(matches!(
                validate_shm_name(name),
                Err(Error::InvalidName { reason, .. })
                    if reason == "name must not contain additional '/' characters"
            ));
        }
    }

    #[test]
    fn test_validate_shm_name_length() {
        // 255 bytes including the leading slash is the limit.
        assert!(validate_shm_name(&format!("/{}", "a".repeat(254))).is_ok());
        assert!(matches!(
            validate_shm_name(&format!("/{}", "a".repeat(255))),
            Err(Error::InvalidName { reason, .. }) if reason == "name length must be <= 255 bytes"
        ));
    }

    #[test]
    fn test_invalid_prefix_rejected() {
        assert!(matches!(
            PosixSegments::new("no-slash"),
            Err(Error::InvalidName { .. })
        ));
    }
}
