mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Barrier;
use std::time::Duration;

use aero_vkbridge::{
    BridgeError, ExportInfo, GuestHandle, GuestMemoryHandleTypes, ImportSource,
    KeyedMutexSyncInfo, MemoryImportInfo, SemaphoreCreateInfo, Status, SubmitInfo,
};
use common::{Process, World};

/// Exports keyed-mutex memory from `owner` and imports it into `other`.
fn share(owner: &Process, other: &Process, size: u64) -> (GuestHandle, GuestHandle) {
    let memory = owner.keyed_memory(size);
    let handle = owner
        .device
        .export_memory(memory, &ExportInfo::default())
        .unwrap();
    let imported = other
        .device
        .import_memory(&MemoryImportInfo {
            source: ImportSource::Handle(handle),
            handle_types: GuestMemoryHandleTypes::OPAQUE_WIN32,
            size,
        })
        .unwrap();
    (memory, imported)
}

#[test]
fn zero_timeout_acquire_fails_fast_while_held() {
    let world = World::new();
    let p1 = world.process();
    let p2 = world.process();
    let (mine, theirs) = share(&p1, &p2, 256);

    p1.device.acquire_keyed_mutex(mine, 0, Some(Duration::ZERO)).unwrap();
    p1.device.release_keyed_mutex(mine, 5).unwrap();
    p1.device.acquire_keyed_mutex(mine, 5, Some(Duration::ZERO)).unwrap();

    let err = p2
        .device
        .acquire_keyed_mutex(theirs, 5, Some(Duration::ZERO))
        .unwrap_err();
    assert_eq!(err, BridgeError::Timeout);
    assert_eq!(err.status(), Status::Timeout);
    assert!(!err.status().is_error());

    // P1 still holds it.
    assert_eq!(
        p1.device.acquire_keyed_mutex(mine, 5, Some(Duration::ZERO)),
        Err(BridgeError::KeyedMutexAlreadyAcquired)
    );
    assert_eq!(
        p2.device.release_keyed_mutex(theirs, 6),
        Err(BridgeError::KeyedMutexNotOwned)
    );

    p1.device.release_keyed_mutex(mine, 6).unwrap();
    p2.device
        .acquire_keyed_mutex(theirs, 6, Some(Duration::from_secs(5)))
        .unwrap();
}

#[test]
fn queued_release_unblocks_remote_acquire_only_after_the_gpu_signal() {
    let world = World::new();
    let p1 = world.process();
    let p2 = world.process();
    let (mine, theirs) = share(&p1, &p2, 256);
    let gate = p1
        .device
        .create_semaphore(&SemaphoreCreateInfo::fence(0))
        .unwrap();

    p1.device.acquire_keyed_mutex(mine, 0, None).unwrap();
    let km = KeyedMutexSyncInfo {
        release_syncs: &[mine],
        release_keys: &[7],
        ..KeyedMutexSyncInfo::default()
    };
    p1.device
        .queue_submit(
            p1.queue(),
            &[SubmitInfo {
                wait_semaphores: &[gate],
                wait_values: &[1],
                keyed_mutex: Some(&km),
                ..SubmitInfo::default()
            }],
        )
        .unwrap();

    let acquired = AtomicBool::new(false);
    std::thread::scope(|scope| {
        let waiter = scope.spawn(|| {
            let result = p2.device.acquire_keyed_mutex(theirs, 7, None);
            acquired.store(true, Ordering::SeqCst);
            result
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));

        p1.device.signal_semaphore(gate, 1).unwrap();
        waiter.join().unwrap().unwrap();
    });

    assert_eq!(
        p1.device.acquire_keyed_mutex(mine, 7, Some(Duration::ZERO)),
        Err(BridgeError::Timeout)
    );
}

#[test]
fn contexts_never_hold_the_mutex_at_the_same_time() {
    const ROUNDS: usize = 50;

    let world = World::new();
    let p1 = world.process();
    let p2 = world.process();
    let (mine, theirs) = share(&p1, &p2, 64);

    let barrier = Barrier::new(2);
    let inside = AtomicUsize::new(0);
    let entries = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for (process, memory) in [(&p1, mine), (&p2, theirs)] {
            let barrier = &barrier;
            let inside = &inside;
            let entries = &entries;
            scope.spawn(move || {
                barrier.wait();
                for _ in 0..ROUNDS {
                    process
                        .device
                        .acquire_keyed_mutex(memory, 0, Some(Duration::from_secs(10)))
                        .unwrap();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    entries.fetch_add(1, Ordering::SeqCst);
                    std::thread::yield_now();
                    inside.fetch_sub(1, Ordering::SeqCst);
                    process.device.release_keyed_mutex(memory, 0).unwrap();
                }
            });
        }
    });

    assert_eq!(entries.load(Ordering::SeqCst), 2 * ROUNDS);
}

#[test]
fn failed_batch_acquire_rolls_back_earlier_acquires() {
    let world = World::new();
    let p1 = world.process();
    let p2 = world.process();
    let free = p1.keyed_memory(64);
    let (contended, remote) = share(&p1, &p2, 64);

    p2.device.acquire_keyed_mutex(remote, 0, None).unwrap();

    let km = KeyedMutexSyncInfo {
        acquire_syncs: &[free, contended],
        acquire_keys: &[0, 0],
        acquire_timeouts_ms: &[0, 20],
        ..KeyedMutexSyncInfo::default()
    };
    let err = p1.device.queue_submit(
        p1.queue(),
        &[SubmitInfo {
            keyed_mutex: Some(&km),
            ..SubmitInfo::default()
        }],
    );
    assert_eq!(err, Err(BridgeError::Timeout));
    assert_eq!(p1.device.stats().keyed_mutex_rollbacks, 1);

    // `free` was handed back with its original key.
    p1.device
        .acquire_keyed_mutex(free, 0, Some(Duration::ZERO))
        .unwrap();
}

#[test]
fn batch_acquire_and_release_round_trip() {
    let world = World::new();
    let p1 = world.process();
    let p2 = world.process();
    let (mine, theirs) = share(&p1, &p2, 64);
    let queue = p1.queue();
    let cb = p1.device.allocate_command_buffer().unwrap();

    let km = KeyedMutexSyncInfo {
        acquire_syncs: &[mine],
        acquire_keys: &[0],
        acquire_timeouts_ms: &[aero_vkbridge::keyed_mutex::INFINITE_TIMEOUT_MS],
        release_syncs: &[mine],
        release_keys: &[2],
    };
    p1.device
        .queue_submit(
            queue,
            &[SubmitInfo {
                command_buffers: &[cb],
                keyed_mutex: Some(&km),
                ..SubmitInfo::default()
            }],
        )
        .unwrap();

    p2.device
        .acquire_keyed_mutex(theirs, 2, Some(Duration::from_secs(5)))
        .unwrap();
    p2.device.release_keyed_mutex(theirs, 0).unwrap();
    p1.device
        .acquire_keyed_mutex(mine, 0, Some(Duration::from_secs(5)))
        .unwrap();
}
