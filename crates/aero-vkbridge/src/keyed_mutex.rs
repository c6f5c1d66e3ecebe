//! Keyed-mutex emulation on top of a shared [`KeyedMutexState`] and a host timeline semaphore.
//!
//! The record decides ownership; the semaphore is where blocked acquirers sleep. Every release
//! advances the record's timeline and the semaphore follows it, either immediately (CPU release)
//! or through a signal appended to a later GPU submission (queued release).

use std::sync::Arc;
use std::time::{Duration, Instant};

use aero_sync_shared::{AcquirePoll, KeyedMutexPhase, RecordKind, ReleaseError, SharedSection};
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};
use crate::external::ExternalResourceBroker;
use crate::host::{
    HostDriver, HostHandle, HostHandleTypes, HostSemaphoreInfo, HostSemaphoreOp, WaitMode,
    WaitOutcome,
};
use crate::kernel::{Attachment, KernelObject};
use crate::object::ContextId;

/// Kernel-object attachment slot carrying the backing semaphore descriptor.
pub const SEMAPHORE_SLOT: usize = 0;
/// Kernel-object attachment slot carrying the shared record.
pub const SECTION_SLOT: usize = 1;

/// Guest acquire timeout meaning "wait forever".
pub const INFINITE_TIMEOUT_MS: u32 = u32::MAX;

/// Converts a guest millisecond timeout.
pub fn timeout_from_ms(ms: u32) -> Option<Duration> {
    (ms != INFINITE_TIMEOUT_MS).then(|| Duration::from_millis(u64::from(ms)))
}

/// A release queued on behalf of a submission that has not been handed to the host yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueuedRelease {
    /// Value a later submission must signal on [`KeyedMutex::semaphore`].
    pub value: u64,
    previous_key: u64,
}

#[derive(Debug)]
pub struct KeyedMutex {
    semaphore: HostHandle,
    section: SharedSection,
}

impl KeyedMutex {
    /// Creates a fresh keyed mutex (free, key 0) with an exportable backing semaphore.
    pub fn create(host: &dyn HostDriver, device: HostHandle) -> Result<Self> {
        let section = SharedSection::create(RecordKind::KeyedMutex)?;
        let semaphore = host.create_semaphore(
            device,
            &HostSemaphoreInfo {
                export: HostHandleTypes::OPAQUE_FD,
                ..HostSemaphoreInfo::timeline(0)
            },
        )?;
        Ok(Self { semaphore, section })
    }

    /// Recovers the keyed mutex attached to an imported memory object.
    ///
    /// Returns `Ok(None)` when the exporter did not attach one.
    pub fn import(
        host: &dyn HostDriver,
        device: HostHandle,
        broker: &ExternalResourceBroker,
        object: &KernelObject,
    ) -> Result<Option<Self>> {
        let Some(section) = object.associated_section(SECTION_SLOT) else {
            return Ok(None);
        };
        section.keyed_mutex()?;
        let descriptor = object
            .associated_descriptor(SEMAPHORE_SLOT)?
            .ok_or(BridgeError::InvalidExternalHandle("keyed mutex semaphore missing"))?;

        let semaphore = host.create_semaphore(device, &HostSemaphoreInfo::timeline(0))?;
        if let Err(err) =
            broker.import_semaphore_descriptor(&descriptor, semaphore, HostHandleTypes::OPAQUE_FD)
        {
            host.destroy_semaphore(device, semaphore);
            return Err(err);
        }
        Ok(Some(Self { semaphore, section }))
    }

    /// Attachments that let an importer recover this mutex.
    pub fn attachments(&self, broker: &ExternalResourceBroker) -> Result<Vec<(usize, Attachment)>> {
        let descriptor =
            broker.export_semaphore_descriptor(self.semaphore, HostHandleTypes::OPAQUE_FD)?;
        Ok(vec![
            (SEMAPHORE_SLOT, Attachment::Descriptor(descriptor)),
            (SECTION_SLOT, Attachment::Section(self.section.clone())),
        ])
    }

    pub fn semaphore(&self) -> HostHandle {
        self.semaphore
    }

    pub fn section(&self) -> &SharedSection {
        &self.section
    }

    pub fn phase(&self) -> Result<KeyedMutexPhase> {
        Ok(self.section.keyed_mutex()?.lock().phase())
    }

    /// Acquires with `key` for `context`, waiting up to `timeout` (`None` waits forever).
    pub fn acquire(
        &self,
        host: &dyn HostDriver,
        device: HostHandle,
        context: ContextId,
        key: u64,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let record = self.section.keyed_mutex()?;
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        loop {
            let poll = record.lock().poll_acquire(context.as_raw(), key, || {
                host.semaphore_counter_value(device, self.semaphore)
            })?;

            let value = match poll {
                AcquirePoll::Acquired => {
                    debug!(?context, key, semaphore = ?self.semaphore, "keyed mutex: acquired");
                    return Ok(());
                }
                AcquirePoll::AlreadyHeld => return Err(BridgeError::KeyedMutexAlreadyAcquired),
                AcquirePoll::WaitFor(value) => value,
            };

            let remaining = match deadline {
                None => None,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(BridgeError::Timeout);
                    }
                    Some(deadline - now)
                }
            };
            let outcome = host.wait_semaphores(
                device,
                &[HostSemaphoreOp::new(self.semaphore, value)],
                WaitMode::All,
                remaining,
            )?;
            if outcome == WaitOutcome::TimedOut {
                return Err(BridgeError::Timeout);
            }
        }
    }

    /// Releases with `key` and signals the backing semaphore now.
    ///
    /// If the signal fails the release is undone and `context` still holds the mutex.
    pub fn release(
        &self,
        host: &dyn HostDriver,
        device: HostHandle,
        context: ContextId,
        key: u64,
    ) -> Result<()> {
        let record = self.section.keyed_mutex()?;
        let mut guard = record.lock();
        let previous_key = guard.key();
        let value = guard
            .release(context.as_raw(), key, false)
            .map_err(not_owned)?
            .value();

        if let Err(err) = host.signal_semaphore(device, self.semaphore, value) {
            guard.undo_release(context.as_raw(), value, previous_key);
            warn!(?context, key, value, %err, "keyed mutex: release signal failed, still held");
            return Err(err.into());
        }
        debug!(?context, key, value, "keyed mutex: released");
        Ok(())
    }

    /// Releases with `key` once a later submission signals the returned value.
    ///
    /// The mutex stays acquired until then. [`KeyedMutex::cancel_queued`] takes the release back
    /// if the submission is never made.
    pub fn queue_release(&self, context: ContextId, key: u64) -> Result<QueuedRelease> {
        let record = self.section.keyed_mutex()?;
        let mut guard = record.lock();
        let previous_key = guard.key();
        let value = guard
            .release(context.as_raw(), key, true)
            .map_err(not_owned)?
            .value();
        debug!(?context, key, value, "keyed mutex: release queued");
        Ok(QueuedRelease {
            value,
            previous_key,
        })
    }

    /// Undoes a queued release whose submission never reached the host.
    pub fn cancel_queued(&self, context: ContextId, release: QueuedRelease) {
        let Ok(record) = self.section.keyed_mutex() else {
            return;
        };
        if !record
            .lock()
            .undo_release(context.as_raw(), release.value, release.previous_key)
        {
            warn!(?context, value = release.value, "keyed mutex: queued release already superseded");
        }
    }

    pub fn destroy(self, host: &dyn HostDriver, device: HostHandle) {
        host.destroy_semaphore(device, self.semaphore);
    }
}

fn not_owned(_: ReleaseError) -> BridgeError {
    BridgeError::KeyedMutexNotOwned
}

/// Releases every acquire in `acquired` in reverse order, restoring each key.
pub(crate) fn roll_back(
    host: &dyn HostDriver,
    device: HostHandle,
    context: ContextId,
    acquired: &[(Arc<KeyedMutex>, u64)],
) {
    for (mutex, key) in acquired.iter().rev() {
        if let Err(err) = mutex.release(host, device, context, *key) {
            warn!(?context, key, %err, "keyed mutex: rollback release failed");
        }
    }
}
