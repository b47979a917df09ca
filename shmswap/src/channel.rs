//! Channel identity and the objects shared by both sides of it.
//!
//! A [`Channel`] bundles the keyed counters and the segment store for one
//! `(name, rank)` pair. It is built once per process and passed by
//! reference to the producer and consumer handles.

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::key::KeyNamer;
use crate::segment::SegmentStore;
use crate::sem::{KeyedSemaphoreSet, SemaphoreBackend};
use crate::slot::{Counter, Key, SlotIndex};
use crate::trace::{error, info};

/// Identity shared by a producer and its consumers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId {
    name: String,
    rank: i32,
}

impl ChannelId {
    pub fn new(name: impl Into<String>, rank: i32) -> Self {
        Self {
            name: name.into(),
            rank,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn rank(&self) -> i32 {
        self.rank
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.rank)
    }
}

/// Which side owns the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// Resets the counters on open and removes them on drop. Usually the
    /// producer.
    #[default]
    Main,
    /// Uses counters owned by someone else.
    Follower,
}

/// Settings for opening a channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Key name. For `ftok` keys this must be an existing path.
    pub name: String,
    pub rank: i32,
    pub role: Role,
    /// Bytes a consumer asks for when opening a slot segment. Zero opens
    /// the producer's segment at whatever size it has.
    pub segment_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: "/tmp".to_string(),
            rank: 0,
            role: Role::Main,
            segment_size: 0,
        }
    }
}

impl ChannelConfig {
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub const fn with_rank(mut self, rank: i32) -> Self {
        self.rank = rank;
        self
    }

    #[must_use]
    pub const fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    #[must_use]
    pub const fn with_segment_size(mut self, size: usize) -> Self {
        self.segment_size = size;
        self
    }

    #[must_use]
    pub fn id(&self) -> ChannelId {
        ChannelId::new(self.name.clone(), self.rank)
    }
}

/// Counters and segments of one `(name, rank)` pair.
///
/// A [`Role::Main`] channel zeroes the counters when opened and removes
/// them when dropped. Segments are never removed here; that is the
/// producer's deferred destruction.
pub struct Channel<S: SemaphoreBackend, M: SegmentStore> {
    id: ChannelId,
    role: Role,
    segment_size: usize,
    sems: KeyedSemaphoreSet<S>,
    store: M,
}

impl<S: SemaphoreBackend, M: SegmentStore> Channel<S, M> {
    /// Builds a channel from already opened collaborators.
    ///
    /// # Errors
    ///
    /// Fails if a main channel cannot reset its counters.
    pub fn new(config: ChannelConfig, keys: [Key; 2], backend: S, store: M) -> Result<Self> {
        let channel = Self {
            id: config.id(),
            role: config.role,
            segment_size: config.segment_size,
            sems: KeyedSemaphoreSet::new(backend, keys),
            store,
        };
        if channel.role == Role::Main {
            channel.reset()?;
        }
        info!(channel = %channel.id, role = ?channel.role, "channel opened");
        Ok(channel)
    }

    /// Derives the slot keys with `namer`, then opens the backends for them.
    ///
    /// # Errors
    ///
    /// Key derivation, backend, or reset failure.
    pub fn with_namer(
        config: ChannelConfig,
        namer: &impl KeyNamer,
        open: impl FnOnce([Key; 2]) -> Result<(S, M)>,
    ) -> Result<Self> {
        let keys = namer.keys(&config.id())?;
        let (backend, store) = open(keys)?;
        Self::new(config, keys, backend, store)
    }

    #[must_use]
    pub const fn id(&self) -> &ChannelId {
        &self.id
    }

    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub const fn segment_size(&self) -> usize {
        self.segment_size
    }

    #[must_use]
    pub const fn key(&self, slot: SlotIndex) -> Key {
        self.sems.key(slot)
    }

    #[must_use]
    pub const fn semaphores(&self) -> &KeyedSemaphoreSet<S> {
        &self.sems
    }

    #[must_use]
    pub const fn store(&self) -> &M {
        &self.store
    }

    /// Current `CONSEM` of `slot`.
    ///
    /// # Errors
    ///
    /// Backend error.
    pub fn consumer_count(&self, slot: SlotIndex) -> Result<u32> {
        self.sems.get(slot, Counter::Consumers)
    }

    /// Whether the producer currently publishes `slot`.
    ///
    /// # Errors
    ///
    /// Backend error.
    pub fn is_published(&self, slot: SlotIndex) -> Result<bool> {
        Ok(self.sems.get(slot, Counter::Producer)? > 0)
    }

    /// Forces all four counters to zero.
    ///
    /// Recovers a channel left behind by a crashed participant. Anyone still
    /// attached loses track of its counts.
    ///
    /// # Errors
    ///
    /// Backend error.
    pub fn reset(&self) -> Result<()> {
        self.sems.reset()
    }

    /// Wraps the channel for sharing with a producer and consumers.
    #[must_use]
    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

impl<S: SemaphoreBackend, M: SegmentStore> fmt::Debug for Channel<S, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("keys", &[self.key(SlotIndex::Zero), self.key(SlotIndex::One)])
            .finish_non_exhaustive()
    }
}

impl<S: SemaphoreBackend, M: SegmentStore> Drop for Channel<S, M> {
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    fn drop(&mut self) {
        if self.role != Role::Main {
            return;
        }
        match self.sems.remove() {
            Ok(()) => {
                info!(channel = %self.id, "channel semaphores removed");
            }
            Err(err) => {
                error!(channel = %self.id, %err, "failed to remove channel semaphores");
            }
        }
    }
}

#[cfg(target_os = "linux")]
mod os {
    use super::{Channel, ChannelConfig};
    use crate::error::Result;
    use crate::ipc::atomic::MappedSemaphores;
    use crate::ipc::shmem::PosixSegments;
    use crate::ipc::sysv::{SysvSegments, SysvSemaphores};
    use crate::key::Ftok;

    impl Channel<SysvSemaphores, SysvSegments> {
        /// Opens a channel on System V semaphores and segments with `ftok`
        /// keys.
        ///
        /// # Errors
        ///
        /// `ftok`, `semget` or reset failure.
        pub fn sysv(config: ChannelConfig) -> Result<Self> {
            Self::with_namer(config, &Ftok, |keys| {
                Ok((SysvSemaphores::open(keys)?, SysvSegments))
            })
        }
    }

    impl Channel<MappedSemaphores, PosixSegments> {
        /// Opens a channel on POSIX shared memory: counters in a mapped
        /// object, segments as named objects. Keys come from `ftok`.
        ///
        /// # Errors
        ///
        /// `ftok`, `shm_open`, `mmap` or reset failure.
        pub fn posix(config: ChannelConfig) -> Result<Self> {
            Self::with_namer(config, &Ftok, |keys| {
                let prefix = PosixSegments::DEFAULT_PREFIX;
                let sems = MappedSemaphores::open(&MappedSemaphores::object_name(prefix, keys[0]))?;
                Ok((sems, PosixSegments::new(prefix)?))
            })
        }
    }
}
