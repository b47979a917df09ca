//! Round trips over the System V and POSIX backends.
//!
//! Both tests skip (and pass) on hosts that refuse System V IPC or
//! `/dev/shm`, as containers often do.
#![cfg(target_os = "linux")]

use std::fs::File;
use std::path::PathBuf;
use std::sync::{Arc, Once};

use shmswap::ipc::atomic::MappedSemaphores;
use shmswap::ipc::shmem::PosixSegments;
use shmswap::ipc::sysv::{SysvSegments, SysvSemaphores};
use shmswap::{
    Channel, ChannelConfig, ConsumerHandle, Error, Key, ProducerHandle, Result, Role,
    SegmentStore, SemaphoreBackend, SlotIndex, WaitMode,
};

static INIT_TRACING: Once = Once::new();

fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        shmswap::init_tracing();
    });
}

/// An existing file for `ftok`, removed on drop.
struct KeyFile(PathBuf);

impl KeyFile {
    fn new(tag: &str) -> Self {
        let path = std::env::temp_dir().join(format!("shmswap-{tag}-{}", std::process::id()));
        File::create(&path).expect("create key file");
        Self(path)
    }

    fn config(&self, role: Role) -> ChannelConfig {
        ChannelConfig::default()
            .with_name(self.0.to_string_lossy())
            .with_rank(3)
            .with_role(role)
    }
}

impl Drop for KeyFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

fn skip(test: &str, err: &Error) -> bool {
    if err.is_unsupported() {
        eprintln!("Skipping {test}: {err}");
        return true;
    }
    false
}

/// Publishes two frames and follows them with one consumer.
fn round_trip<S, M>(main: Arc<Channel<S, M>>, follower: Arc<Channel<S, M>>) -> Result<()>
where
    S: SemaphoreBackend + 'static,
    M: SegmentStore + 'static,
{
    let producer = ProducerHandle::new(main);
    let mut consumer = ConsumerHandle::new(Arc::clone(&follower));

    let mut first = producer.publish(1024)?;
    for (i, byte) in first.iter_mut().enumerate() {
        *byte = i as u8;
    }
    let bytes = consumer.advance(&WaitMode::Block)?;
    assert!(bytes.iter().enumerate().all(|(i, &b)| b == i as u8));
    assert_eq!(follower.consumer_count(SlotIndex::Zero)?, 1);

    let mut second = producer.publish(1024)?;
    second.fill(0x42);
    producer.retire(Some(first))?;
    let bytes = consumer.advance(&WaitMode::Block)?;
    assert_eq!(bytes[..4], [0x42; 4]);
    assert_eq!(follower.consumer_count(SlotIndex::Zero)?, 0);
    producer.join_pending()?;

    drop(consumer);
    producer.retire(Some(second))?;
    producer.shutdown()
}

/// Attaches to slot 0 only after the producer has destroyed it.
fn late_attach<S, M>(main: Arc<Channel<S, M>>, follower: Arc<Channel<S, M>>) -> Result<()>
where
    S: SemaphoreBackend + 'static,
    M: SegmentStore + 'static,
{
    let producer = ProducerHandle::new(main);
    let mut consumer = ConsumerHandle::new(Arc::clone(&follower));

    let first = producer.publish(64)?;
    assert_eq!(consumer.update_key(&WaitMode::Block)?, SlotIndex::Zero);
    let mut second = producer.publish(64)?;
    second.fill(5);
    producer.retire(Some(first))?;
    producer.join_pending()?;

    assert!(consumer.attach().is_err());
    assert_eq!(follower.consumer_count(SlotIndex::Zero)?, 0);
    assert_eq!(consumer.advance(&WaitMode::Block)?[0], 5);

    drop(consumer);
    producer.retire(Some(second))?;
    producer.shutdown()
}

fn open_main<T>(test: &str, opened: Result<T>) -> Result<Option<Arc<T>>> {
    match opened {
        Ok(channel) => Ok(Some(Arc::new(channel))),
        Err(err) if skip(test, &err) => Ok(None),
        Err(err) => Err(err),
    }
}

fn sysv_segment_exists(key: Key) -> bool {
    // SAFETY: plain syscall wrapper without pointer arguments.
    unsafe { libc::shmget(key.raw(), 0, 0) != -1 }
}

fn posix_object_exists(name: &str) -> bool {
    rustix::shm::open(name, rustix::shm::OFlags::RDWR, rustix::fs::Mode::empty()).is_ok()
}

#[test]
fn sysv_round_trip() -> Result<()> {
    init_test_tracing();
    let file = KeyFile::new("sysv");
    let Some(main) = open_main("sysv_round_trip", Channel::sysv(file.config(Role::Main)))? else {
        return Ok(());
    };
    let follower = Arc::new(Channel::<SysvSemaphores, SysvSegments>::sysv(
        file.config(Role::Follower),
    )?);
    let keys = [main.key(SlotIndex::Zero), main.key(SlotIndex::One)];
    assert_eq!(keys[0], follower.key(SlotIndex::Zero));

    round_trip(main, follower)?;

    for key in keys {
        assert!(!sysv_segment_exists(key), "segment {key} outlived the producer");
    }
    Ok(())
}

#[test]
fn sysv_late_attach_leaves_nothing_behind() -> Result<()> {
    init_test_tracing();
    let file = KeyFile::new("sysv-late");
    let opened = Channel::sysv(file.config(Role::Main));
    let Some(main) = open_main("sysv_late_attach_leaves_nothing_behind", opened)? else {
        return Ok(());
    };
    let follower = Arc::new(Channel::<SysvSemaphores, SysvSegments>::sysv(
        file.config(Role::Follower),
    )?);
    let keys = [main.key(SlotIndex::Zero), main.key(SlotIndex::One)];

    late_attach(main, follower)?;

    for key in keys {
        assert!(!sysv_segment_exists(key), "segment {key} outlived the producer");
    }
    Ok(())
}

#[test]
fn posix_round_trip() -> Result<()> {
    init_test_tracing();
    let file = KeyFile::new("posix");
    let Some(main) = open_main("posix_round_trip", Channel::posix(file.config(Role::Main)))? else {
        return Ok(());
    };
    let follower = Arc::new(Channel::<MappedSemaphores, PosixSegments>::posix(
        file.config(Role::Follower),
    )?);
    let names = SlotIndex::ALL.map(|slot| main.store().segment_name(main.key(slot)));

    round_trip(main, follower)?;

    for name in names {
        assert!(!posix_object_exists(&name), "object {name} outlived the producer");
    }
    Ok(())
}

#[test]
fn posix_late_attach_leaves_nothing_behind() -> Result<()> {
    init_test_tracing();
    let file = KeyFile::new("posix-late");
    let opened = Channel::posix(file.config(Role::Main));
    let Some(main) = open_main("posix_late_attach_leaves_nothing_behind", opened)? else {
        return Ok(());
    };
    let follower = Arc::new(Channel::<MappedSemaphores, PosixSegments>::posix(
        file.config(Role::Follower),
    )?);
    let names = SlotIndex::ALL.map(|slot| main.store().segment_name(main.key(slot)));

    late_attach(main, follower)?;

    for name in names {
        assert!(!posix_object_exists(&name), "object {name} outlived the producer");
    }
    Ok(())
}
