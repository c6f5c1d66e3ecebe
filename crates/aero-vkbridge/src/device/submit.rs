//! Submission rewriting.
//!
//! A guest submission is turned into a host one in three passes:
//!
//! 1. validate shapes and resolve every guest handle in the batch (no side effects),
//! 2. acquire every keyed mutex the batch names, all or nothing,
//! 3. under the fence runtime's lock, replace waits and signals on fence-compatible semaphores
//!    with stand-ins, then append queued keyed-mutex releases, and submit.
//!
//! A call that fails leaves every keyed mutex as it found it.
//!
//! Scratch arrays come from one [`ConversionContext`] per call.

use std::sync::Arc;

use aero_sync_shared::KeyedMutexPhase;
use tracing::{debug, warn};

use super::{Device, SemaphoreBacking};
use crate::conversion::ConversionContext;
use crate::error::{BridgeError, Result};
use crate::host::{HostHandle, HostSemaphoreOp, HostSubmitInfo};
use crate::keyed_mutex::{self, timeout_from_ms, KeyedMutex, QueuedRelease};
use crate::object::{GuestHandle, ObjectKind};

/// Keyed-mutex acquires and releases attached to one submission.
#[derive(Clone, Copy, Debug, Default)]
pub struct KeyedMutexSyncInfo<'a> {
    pub acquire_syncs: &'a [GuestHandle],
    pub acquire_keys: &'a [u64],
    /// Per-acquire timeout in milliseconds; `u32::MAX` waits forever.
    pub acquire_timeouts_ms: &'a [u32],
    pub release_syncs: &'a [GuestHandle],
    pub release_keys: &'a [u64],
}

/// Parallel-array submission record. `wait_values`/`signal_values` may be empty when every
/// semaphore involved is binary.
#[derive(Clone, Copy, Debug, Default)]
pub struct SubmitInfo<'a> {
    pub wait_semaphores: &'a [GuestHandle],
    pub wait_values: &'a [u64],
    pub command_buffers: &'a [GuestHandle],
    pub signal_semaphores: &'a [GuestHandle],
    pub signal_values: &'a [u64],
    pub keyed_mutex: Option<&'a KeyedMutexSyncInfo<'a>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SemaphoreSubmitInfo {
    pub semaphore: GuestHandle,
    pub value: u64,
}

/// Submission record with one `{semaphore, value}` entry per operation.
#[derive(Clone, Copy, Debug, Default)]
pub struct SubmitInfo2<'a> {
    pub waits: &'a [SemaphoreSubmitInfo],
    pub command_buffers: &'a [GuestHandle],
    pub signals: &'a [SemaphoreSubmitInfo],
    pub keyed_mutex: Option<&'a KeyedMutexSyncInfo<'a>>,
}

#[derive(Clone, Copy)]
enum SemaphoreList<'a> {
    Split {
        semaphores: &'a [GuestHandle],
        values: &'a [u64],
    },
    Paired(&'a [SemaphoreSubmitInfo]),
}

impl SemaphoreList<'_> {
    fn len(&self) -> usize {
        match self {
            Self::Split { semaphores, .. } => semaphores.len(),
            Self::Paired(ops) => ops.len(),
        }
    }

    fn get(&self, index: usize) -> (GuestHandle, u64) {
        match self {
            Self::Split { semaphores, values } => {
                (semaphores[index], values.get(index).copied().unwrap_or(0))
            }
            Self::Paired(ops) => (ops[index].semaphore, ops[index].value),
        }
    }

    fn check(&self, what: &'static str) -> Result<()> {
        match self {
            Self::Split { semaphores, values }
                if !values.is_empty() && values.len() != semaphores.len() =>
            {
                Err(BridgeError::InvalidParameter(what))
            }
            _ => Ok(()),
        }
    }
}

/// Both guest shapes, normalized.
#[derive(Clone, Copy)]
struct Record<'a> {
    waits: SemaphoreList<'a>,
    command_buffers: &'a [GuestHandle],
    signals: SemaphoreList<'a>,
    keyed_mutex: Option<&'a KeyedMutexSyncInfo<'a>>,
}

impl<'a> From<&SubmitInfo<'a>> for Record<'a> {
    fn from(info: &SubmitInfo<'a>) -> Self {
        Self {
            waits: SemaphoreList::Split {
                semaphores: info.wait_semaphores,
                values: info.wait_values,
            },
            command_buffers: info.command_buffers,
            signals: SemaphoreList::Split {
                semaphores: info.signal_semaphores,
                values: info.signal_values,
            },
            keyed_mutex: info.keyed_mutex,
        }
    }
}

impl<'a> From<&SubmitInfo2<'a>> for Record<'a> {
    fn from(info: &SubmitInfo2<'a>) -> Self {
        Self {
            waits: SemaphoreList::Paired(info.waits),
            command_buffers: info.command_buffers,
            signals: SemaphoreList::Paired(info.signals),
            keyed_mutex: info.keyed_mutex,
        }
    }
}

struct Acquire {
    mutex: Arc<KeyedMutex>,
    key: u64,
    timeout_ms: u32,
}

/// One record with every guest handle resolved.
struct ResolvedRecord {
    waits: Vec<(SemaphoreBacking, u64)>,
    command_buffers: Vec<HostHandle>,
    signals: Vec<(SemaphoreBacking, u64)>,
    releases: Vec<(Arc<KeyedMutex>, u64)>,
}

/// Everything one call needs, resolved before any side effect.
#[derive(Default)]
struct SubmitPlan {
    records: Vec<ResolvedRecord>,
    acquires: Vec<Acquire>,
}

impl Device {
    pub fn queue_submit(&self, queue: GuestHandle, submits: &[SubmitInfo<'_>]) -> Result<()> {
        let records: Vec<Record<'_>> = submits.iter().map(Record::from).collect();
        self.submit(queue, &records)
    }

    pub fn queue_submit2(&self, queue: GuestHandle, submits: &[SubmitInfo2<'_>]) -> Result<()> {
        let records: Vec<Record<'_>> = submits.iter().map(Record::from).collect();
        self.submit(queue, &records)
    }

    fn submit(&self, queue: GuestHandle, records: &[Record<'_>]) -> Result<()> {
        let host_queue = self.owned(queue, ObjectKind::Queue)?.host;
        let plan = self.plan(records)?;

        let acquired = self.acquire_all(&plan.acquires)?;

        let mut queued = Vec::new();
        let result = self
            .check_releases_owned(&plan)
            .and_then(|()| self.rewrite_and_submit(host_queue, &plan, &mut queued));
        if let Err(err) = &result {
            warn!(queue = ?queue, %err, "submit: failed, restoring keyed mutexes");
            let context = self.context();
            for (mutex, release) in queued.iter().rev() {
                mutex.cancel_queued(context, *release);
            }
            keyed_mutex::roll_back(self.host(), self.host_device, context, &acquired);
        }
        result
    }

    /// Checks array shapes and resolves every handle before anything is touched.
    fn plan(&self, records: &[Record<'_>]) -> Result<SubmitPlan> {
        let mut plan = SubmitPlan::default();
        let mut released: Vec<Arc<KeyedMutex>> = Vec::new();
        for record in records {
            record
                .waits
                .check("wait value count does not match wait semaphore count")?;
            record
                .signals
                .check("signal value count does not match signal semaphore count")?;

            let waits = (0..record.waits.len())
                .map(|index| {
                    let (semaphore, value) = record.waits.get(index);
                    Ok((self.semaphore(semaphore)?.backing(), value))
                })
                .collect::<Result<Vec<_>>>()?;
            let command_buffers = record
                .command_buffers
                .iter()
                .map(|&cb| Ok(self.owned(cb, ObjectKind::CommandBuffer)?.host))
                .collect::<Result<Vec<_>>>()?;
            let signals = (0..record.signals.len())
                .map(|index| {
                    let (semaphore, value) = record.signals.get(index);
                    Ok((self.semaphore(semaphore)?.backing(), value))
                })
                .collect::<Result<Vec<_>>>()?;

            let mut releases = Vec::new();
            if let Some(km) = record.keyed_mutex {
                if km.acquire_keys.len() != km.acquire_syncs.len()
                    || km.acquire_timeouts_ms.len() != km.acquire_syncs.len()
                {
                    return Err(BridgeError::InvalidParameter(
                        "keyed mutex acquire arrays differ in length",
                    ));
                }
                if km.release_keys.len() != km.release_syncs.len() {
                    return Err(BridgeError::InvalidParameter(
                        "keyed mutex release arrays differ in length",
                    ));
                }
                for (index, &memory) in km.acquire_syncs.iter().enumerate() {
                    plan.acquires.push(Acquire {
                        mutex: self.keyed_mutex(memory)?,
                        key: km.acquire_keys[index],
                        timeout_ms: km.acquire_timeouts_ms[index],
                    });
                }
                for (&memory, &key) in km.release_syncs.iter().zip(km.release_keys) {
                    let mutex = self.keyed_mutex(memory)?;
                    if released.iter().any(|other| Arc::ptr_eq(other, &mutex)) {
                        return Err(BridgeError::InvalidParameter(
                            "keyed mutex released twice in one call",
                        ));
                    }
                    released.push(Arc::clone(&mutex));
                    releases.push((mutex, key));
                }
            }
            plan.records.push(ResolvedRecord {
                waits,
                command_buffers,
                signals,
                releases,
            });
        }
        Ok(plan)
    }

    /// Acquires every keyed mutex in order; on failure releases the ones already taken.
    fn acquire_all(&self, acquires: &[Acquire]) -> Result<Vec<(Arc<KeyedMutex>, u64)>> {
        let context = self.context();
        let mut acquired: Vec<(Arc<KeyedMutex>, u64)> = Vec::with_capacity(acquires.len());
        for acquire in acquires {
            let result = acquire.mutex.acquire(
                self.host(),
                self.host_device,
                context,
                acquire.key,
                timeout_from_ms(acquire.timeout_ms),
            );
            if let Err(err) = result {
                if !acquired.is_empty() {
                    self.stats.inc_keyed_mutex_rollbacks();
                    warn!(
                        ?context,
                        rolled_back = acquired.len(),
                        %err,
                        "submit: keyed mutex acquire failed, rolling back"
                    );
                }
                keyed_mutex::roll_back(self.host(), self.host_device, context, &acquired);
                return Err(err);
            }
            acquired.push((Arc::clone(&acquire.mutex), acquire.key));
        }
        Ok(acquired)
    }

    /// Every mutex the call releases must be held by this context once its acquires are done.
    fn check_releases_owned(&self, plan: &SubmitPlan) -> Result<()> {
        let owner = self.context().as_raw();
        for (mutex, _) in plan.records.iter().flat_map(|record| &record.releases) {
            if mutex.phase()? != (KeyedMutexPhase::Acquired { owner }) {
                return Err(BridgeError::KeyedMutexNotOwned);
            }
        }
        Ok(())
    }

    fn rewrite_and_submit(
        &self,
        host_queue: HostHandle,
        plan: &SubmitPlan,
        queued: &mut Vec<(Arc<KeyedMutex>, QueuedRelease)>,
    ) -> Result<()> {
        let cx: ConversionContext =
            ConversionContext::with_block_bytes(self.instance.config.conversion_block_bytes);
        let context = self.context();
        let mut batch = self.runtime.batch();
        let mut staged = Vec::with_capacity(plan.records.len());

        for record in &plan.records {
            let waits = cx.alloc::<HostSemaphoreOp>(record.waits.len())?;
            for (slot, (backing, value)) in waits.iter_mut().zip(&record.waits) {
                *slot = match backing {
                    SemaphoreBacking::Host(host) => HostSemaphoreOp::new(*host, *value),
                    SemaphoreBacking::Fence(fence) => batch.wait(fence, *value)?,
                };
            }

            let command_buffers = cx.alloc_copy::<HostHandle>(&record.command_buffers)?;

            let signals =
                cx.alloc::<HostSemaphoreOp>(record.signals.len() + record.releases.len())?;
            for (slot, (backing, value)) in signals.iter_mut().zip(&record.signals) {
                *slot = match backing {
                    SemaphoreBacking::Host(host) => HostSemaphoreOp::new(*host, *value),
                    SemaphoreBacking::Fence(fence) => batch.signal(fence, *value)?,
                };
            }
            staged.push((waits, command_buffers, signals));
        }

        // Releases go last so nothing after them can reject the call before it is submitted.
        for (record, (_, _, signals)) in plan.records.iter().zip(staged.iter_mut()) {
            let extra = &mut signals[record.signals.len()..];
            for (slot, (mutex, key)) in extra.iter_mut().zip(&record.releases) {
                let release = mutex.queue_release(context, *key)?;
                queued.push((Arc::clone(mutex), release));
                *slot = HostSemaphoreOp::new(mutex.semaphore(), release.value);
            }
        }

        let infos: Vec<HostSubmitInfo<'_>> = staged
            .iter()
            .map(|(waits, command_buffers, signals)| HostSubmitInfo {
                waits,
                command_buffers,
                signals,
            })
            .collect();
        batch.finish(|| Ok(self.host().queue_submit(host_queue, &infos)?))?;
        debug!(
            queue = ?host_queue,
            records = plan.records.len(),
            scratch_bytes = cx.bytes_in_use(),
            "submit: submitted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::config::BridgeConfig;
    use crate::device::{MemoryAllocateInfo, SemaphoreCreateInfo};
    use crate::external::GuestMemoryHandleTypes;
    use crate::host::{HostError, SoftDriver};
    use crate::instance::Instance;
    use crate::kernel::Kernel;

    struct Fixture {
        driver: Arc<SoftDriver>,
        // Field order: the device must go before its instance.
        device: Device,
        _instance: Instance,
    }

    fn fixture() -> Fixture {
        let driver = Arc::new(SoftDriver::new());
        let instance =
            Instance::new(driver.clone(), Arc::new(Kernel::new()), BridgeConfig::default())
                .unwrap();
        let physical = instance.enumerate_physical_devices().unwrap()[0];
        let device = instance.create_device(physical).unwrap();
        Fixture {
            driver,
            device,
            _instance: instance,
        }
    }

    fn keyed_memory(device: &Device) -> GuestHandle {
        device
            .allocate_memory(&MemoryAllocateInfo {
                size: 64,
                export: GuestMemoryHandleTypes::OPAQUE_WIN32,
                keyed_mutex: true,
            })
            .unwrap()
    }

    #[test]
    fn command_buffers_are_unwrapped_in_order() {
        let fx = fixture();
        let queue = fx.device.get_queue(0).unwrap();
        let a = fx.device.allocate_command_buffer().unwrap();
        let b = fx.device.allocate_command_buffer().unwrap();

        fx.device
            .queue_submit(
                queue,
                &[SubmitInfo {
                    command_buffers: &[b, a],
                    ..SubmitInfo::default()
                }],
            )
            .unwrap();
        fx.device.queue_wait_idle(queue).unwrap();

        let host_queue = fx.device.owned(queue, ObjectKind::Queue).unwrap().host;
        let host_a = fx.device.owned(a, ObjectKind::CommandBuffer).unwrap().host;
        let host_b = fx.device.owned(b, ObjectKind::CommandBuffer).unwrap().host;
        assert_eq!(fx.driver.executed_command_buffers(host_queue), vec![host_b, host_a]);
    }

    #[test]
    fn mismatched_value_arrays_are_rejected_before_side_effects() {
        let fx = fixture();
        let queue = fx.device.get_queue(0).unwrap();
        let semaphore = fx
            .device
            .create_semaphore(&SemaphoreCreateInfo::timeline(0))
            .unwrap();
        let memory = keyed_memory(&fx.device);
        let km = KeyedMutexSyncInfo {
            acquire_syncs: &[memory],
            acquire_keys: &[0],
            acquire_timeouts_ms: &[0],
            ..KeyedMutexSyncInfo::default()
        };

        let err = fx.device.queue_submit(
            queue,
            &[SubmitInfo {
                signal_semaphores: &[semaphore, semaphore],
                signal_values: &[1],
                keyed_mutex: Some(&km),
                ..SubmitInfo::default()
            }],
        );
        assert!(matches!(err, Err(BridgeError::InvalidParameter(_))));
        let mutex = fx.device.keyed_mutex(memory).unwrap();
        assert_eq!(mutex.phase(), Ok(KeyedMutexPhase::Free { key: 0 }));
    }

    #[test]
    fn host_submit_failure_restores_keyed_mutexes() {
        let fx = fixture();
        let queue = fx.device.get_queue(0).unwrap();
        let held = keyed_memory(&fx.device);
        let handed_off = keyed_memory(&fx.device);
        let km = KeyedMutexSyncInfo {
            acquire_syncs: &[held, handed_off],
            acquire_keys: &[0, 0],
            acquire_timeouts_ms: &[0, 0],
            release_syncs: &[handed_off],
            release_keys: &[4],
        };

        fx.driver.fail_next_submit(HostError::DeviceLost);
        let err = fx.device.queue_submit(
            queue,
            &[SubmitInfo {
                keyed_mutex: Some(&km),
                ..SubmitInfo::default()
            }],
        );
        assert_eq!(err, Err(BridgeError::Host(HostError::DeviceLost)));

        // Both acquires were rolled back and the queued release never took effect.
        for memory in [held, handed_off] {
            let mutex = fx.device.keyed_mutex(memory).unwrap();
            assert_eq!(mutex.phase(), Ok(KeyedMutexPhase::Free { key: 0 }));
            fx.device
                .acquire_keyed_mutex(memory, 0, Some(Duration::ZERO))
                .unwrap();
        }
    }

    #[test]
    fn invalid_handle_in_a_later_record_leaves_keyed_mutexes_untouched() {
        let fx = fixture();
        let queue = fx.device.get_queue(0).unwrap();
        let memory = keyed_memory(&fx.device);
        let bogus = GuestHandle::from_raw(0xdead_0001);
        let km = KeyedMutexSyncInfo {
            acquire_syncs: &[memory],
            acquire_keys: &[0],
            acquire_timeouts_ms: &[0],
            release_syncs: &[memory],
            release_keys: &[7],
        };

        for second in [
            SubmitInfo {
                command_buffers: &[bogus],
                ..SubmitInfo::default()
            },
            SubmitInfo {
                signal_semaphores: &[bogus],
                signal_values: &[1],
                ..SubmitInfo::default()
            },
        ] {
            let err = fx.device.queue_submit(
                queue,
                &[
                    SubmitInfo {
                        keyed_mutex: Some(&km),
                        ..SubmitInfo::default()
                    },
                    second,
                ],
            );
            assert_eq!(err, Err(BridgeError::InvalidHandle(bogus)));

            let mutex = fx.device.keyed_mutex(memory).unwrap();
            assert_eq!(mutex.phase(), Ok(KeyedMutexPhase::Free { key: 0 }));
        }

        assert_eq!(
            fx.device.acquire_keyed_mutex(memory, 7, Some(Duration::ZERO)),
            Err(BridgeError::Timeout)
        );
        fx.device
            .acquire_keyed_mutex(memory, 0, Some(Duration::ZERO))
            .unwrap();
    }

    #[test]
    fn release_of_a_mutex_not_held_rejects_the_whole_call() {
        let fx = fixture();
        let queue = fx.device.get_queue(0).unwrap();
        let acquired = keyed_memory(&fx.device);
        let never_acquired = keyed_memory(&fx.device);
        let first = KeyedMutexSyncInfo {
            acquire_syncs: &[acquired],
            acquire_keys: &[0],
            acquire_timeouts_ms: &[0],
            release_syncs: &[acquired],
            release_keys: &[3],
        };
        let second = KeyedMutexSyncInfo {
            release_syncs: &[never_acquired],
            release_keys: &[3],
            ..KeyedMutexSyncInfo::default()
        };

        let err = fx.device.queue_submit2(
            queue,
            &[
                SubmitInfo2 {
                    keyed_mutex: Some(&first),
                    ..SubmitInfo2::default()
                },
                SubmitInfo2 {
                    keyed_mutex: Some(&second),
                    ..SubmitInfo2::default()
                },
            ],
        );
        assert_eq!(err, Err(BridgeError::KeyedMutexNotOwned));
        for memory in [acquired, never_acquired] {
            let mutex = fx.device.keyed_mutex(memory).unwrap();
            assert_eq!(mutex.phase(), Ok(KeyedMutexPhase::Free { key: 0 }));
        }
    }

    #[test]
    fn releasing_one_mutex_twice_in_a_call_is_rejected() {
        let fx = fixture();
        let queue = fx.device.get_queue(0).unwrap();
        let memory = keyed_memory(&fx.device);
        fx.device.acquire_keyed_mutex(memory, 0, None).unwrap();
        let km = KeyedMutexSyncInfo {
            release_syncs: &[memory],
            release_keys: &[1],
            ..KeyedMutexSyncInfo::default()
        };
        let record = SubmitInfo {
            keyed_mutex: Some(&km),
            ..SubmitInfo::default()
        };

        assert!(matches!(
            fx.device.queue_submit(queue, &[record, record]),
            Err(BridgeError::InvalidParameter(_))
        ));
        let context = fx.device.context();
        let mutex = fx.device.keyed_mutex(memory).unwrap();
        assert_eq!(
            mutex.phase(),
            Ok(KeyedMutexPhase::Acquired {
                owner: context.as_raw()
            })
        );
    }

    #[test]
    fn queued_release_is_signalled_by_the_submission() {
        let fx = fixture();
        let queue = fx.device.get_queue(0).unwrap();
        let memory = keyed_memory(&fx.device);
        let km = KeyedMutexSyncInfo {
            acquire_syncs: &[memory],
            acquire_keys: &[0],
            acquire_timeouts_ms: &[u32::MAX],
            release_syncs: &[memory],
            release_keys: &[1],
        };

        fx.device
            .queue_submit2(
                queue,
                &[SubmitInfo2 {
                    keyed_mutex: Some(&km),
                    ..SubmitInfo2::default()
                }],
            )
            .unwrap();
        fx.device.queue_wait_idle(queue).unwrap();

        fx.device
            .acquire_keyed_mutex(memory, 1, Some(Duration::from_secs(5)))
            .unwrap();
    }
}
