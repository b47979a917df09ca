//! Slot, counter and key identifiers shared by producer and consumer sides.

use std::fmt;

/// One of the two buffer slots of a channel.
///
/// The producer alternates between the slots; a consumer always reads the
/// slot the producer published last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum SlotIndex {
    Zero = 0,
    One = 1,
}

impl SlotIndex {
    /// Both slots, in scan order.
    pub const ALL: [Self; 2] = [Self::Zero, Self::One];

    /// Array index of this slot (0 or 1).
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// The other slot of the pair.
    #[inline]
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::Zero => Self::One,
            Self::One => Self::Zero,
        }
    }

    #[must_use]
    pub const fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::Zero),
            1 => Some(Self::One),
            _ => None,
        }
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index())
    }
}

/// The two counters kept per slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Counter {
    /// Number of consumer mappings attached to the slot (`CONSEM`).
    Consumers = 0,
    /// Nonzero while the producer publishes the slot (`PROSEM`).
    Producer = 1,
}

impl Counter {
    pub const ALL: [Self; 2] = [Self::Consumers, Self::Producer];

    /// Semaphore number inside the slot's semaphore set.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Consumers => f.write_str("CONSEM"),
            Self::Producer => f.write_str("PROSEM"),
        }
    }
}

/// Integer key naming a slot's semaphores and segment on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(i32);

impl Key {
    #[inline]
    #[must_use]
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0 as u32)
    }
}
