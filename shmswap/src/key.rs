//! Key derivation for channel slots.
//!
//! Producer and consumers never exchange keys. Each side derives the same
//! key from the channel's `(name, rank)` pair and the slot index.

use std::ffi::CString;

use crate::channel::ChannelId;
use crate::error::{Error, Result, last_errno};
use crate::slot::{Key, SlotIndex};

/// Maps `(channel, slot)` to a key that is stable across processes.
pub trait KeyNamer {
    fn key(&self, channel: &ChannelId, slot: SlotIndex) -> Result<Key>;

    /// Keys of both slots.
    fn keys(&self, channel: &ChannelId) -> Result<[Key; 2]> {
        Ok([
            self.key(channel, SlotIndex::Zero)?,
            self.key(channel, SlotIndex::One)?,
        ])
    }
}

/// Derives keys with `ftok(3)`.
///
/// The channel name must be an existing path; the project id is
/// `2 * rank + 1 + slot`, so neighbouring ranks never share a key. `ftok`
/// keeps only the low 8 bits of the project id, so the arithmetic wraps.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ftok;

impl Ftok {
    #[must_use]
    pub const fn project_id(rank: i32, slot: SlotIndex) -> i32 {
        rank.wrapping_mul(2).wrapping_add(1).wrapping_add(slot.index() as i32)
    }
}

impl KeyNamer for Ftok {
    fn key(&self, channel: &ChannelId, slot: SlotIndex) -> Result<Key> {
        let path = CString::new(channel.name()).map_err(|_| Error::InvalidName {
            name: channel.name().to_string(),
            reason: "name must not contain NUL bytes",
        })?;
        let proj = Self::project_id(channel.rank(), slot);
        // SAFETY: `path` is a valid NUL-terminated string for the call.
        let key = unsafe { libc::ftok(path.as_ptr(), proj) };
        if key == -1 {
            return Err(Error::posix("ftok", channel.name(), last_errno()));
        }
        Ok(Key::new(key))
    }
}

/// Hands out `base + slot` (wrapping), ignoring the channel.
///
/// For tests and for deployments that assign keys out of band.
#[derive(Debug, Clone, Copy)]
pub struct Fixed(pub i32);

impl KeyNamer for Fixed {
    fn key(&self, _channel: &ChannelId, slot: SlotIndex) -> Result<Key> {
        Ok(Key::new(self.0.wrapping_add(slot.index() as i32)))
    }
}
