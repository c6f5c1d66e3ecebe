//! Fence-compatible timeline semaphores.
//!
//! The guest's fence semantics allow a counter to be signalled to a *lower* value, which the host
//! timeline primitive forbids. Each such semaphore is therefore split in two:
//!
//! - a [`SharedSyncBlock`](aero_sync_shared::SharedSyncBlock) in a shared section holding the
//!   guest-visible virtual counter and reset history,
//! - a real host timeline semaphore whose payload mirrors the block's monotonic physical counter.
//!
//! GPU work never waits on or signals the real semaphore with guest values. Instead every pending
//! operation gets a local stand-in timeline semaphore; the device's Signaller thread (see
//! [`signaller`]) watches the stand-ins, applies completed signals to the block and releases
//! waits whose target the virtual counter has reached.
//!
//! Lock order: runtime state, then a block's shared lock, then host driver internals.

mod signaller;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use aero_sync_shared::{RecordKind, SharedSection, SharedSyncBlock, WaitResolution};
use tracing::{debug, error, warn};

use crate::error::{BridgeError, Result};
use crate::host::{HostDriver, HostHandle, HostHandleTypes, HostSemaphoreInfo, HostSemaphoreOp};
use crate::stats::BridgeStats;
use crate::sync::{lock, wait};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct FenceId(u64);

/// A registered fence-compatible semaphore.
#[derive(Clone, Debug)]
pub(crate) struct FenceSemaphore {
    pub(crate) id: FenceId,
    pub(crate) real: HostHandle,
    pub(crate) section: SharedSection,
}

impl FenceSemaphore {
    pub(crate) fn block(&self) -> Result<&SharedSyncBlock> {
        Ok(self.section.sync_block()?)
    }
}

/// A local timeline semaphore lent to one pending operation.
///
/// `value` is the last target it was used with; its payload has reached that value whenever it
/// sits on the free list.
#[derive(Clone, Copy, Debug)]
struct StandIn {
    semaphore: HostHandle,
    value: u64,
}

#[derive(Debug)]
struct PendingOperation {
    id: u64,
    /// Stand-in with `value` set to this operation's target.
    stand_in: StandIn,
    virtual_value: u64,
    /// Physical value current when the wait was submitted (waits only).
    since_physical: u64,
    /// Report completion through `finished` (CPU-side signals).
    notify: bool,
}

struct FenceEntry {
    real: HostHandle,
    section: SharedSection,
    signals: Vec<PendingOperation>,
    waits: Vec<PendingOperation>,
    seen_physical: u64,
    /// Op id of the most recently submitted signal applied so far.
    applied_op: u64,
    /// Failure reported once, by the next query, host signal or host wait on the semaphore.
    error: Option<BridgeError>,
}

struct StandInPool {
    free: Vec<StandIn>,
}

impl StandInPool {
    fn take(
        &mut self,
        host: &dyn HostDriver,
        device: HostHandle,
        stats: &BridgeStats,
    ) -> Result<StandIn> {
        if let Some(stand_in) = self.free.pop() {
            return Ok(StandIn {
                semaphore: stand_in.semaphore,
                value: stand_in.value + 1,
            });
        }
        let semaphore = host.create_semaphore(device, &HostSemaphoreInfo::timeline(0))?;
        stats.inc_stand_ins_created();
        Ok(StandIn {
            semaphore,
            value: 1,
        })
    }

    fn recycle(&mut self, stand_in: StandIn, stats: &BridgeStats) {
        stats.inc_stand_ins_recycled();
        self.free.push(stand_in);
    }

    /// Signals a stand-in nobody will signal anymore so that GPU waits on it complete, then
    /// recycles it.
    fn release(
        &mut self,
        host: &dyn HostDriver,
        device: HostHandle,
        stand_in: StandIn,
        stats: &BridgeStats,
    ) {
        match host.semaphore_counter_value(device, stand_in.semaphore) {
            Ok(current) if current >= stand_in.value => {}
            _ => {
                if let Err(err) = host.signal_semaphore(device, stand_in.semaphore, stand_in.value) {
                    error!(
                        semaphore = ?stand_in.semaphore,
                        value = stand_in.value,
                        %err,
                        "fence: failed to signal stand-in"
                    );
                    // Never hand out a stand-in in an unknown state.
                    host.destroy_semaphore(device, stand_in.semaphore);
                    return;
                }
            }
        }
        self.recycle(stand_in, stats);
    }
}

struct SignallerState {
    control: Option<HostHandle>,
    control_value: u64,
    generation: u64,
    observed_generation: u64,
    stop: bool,
    entries: HashMap<FenceId, FenceEntry>,
    /// Pending signals of unregistered semaphores, kept until their stand-ins complete.
    orphans: Vec<PendingOperation>,
    pool: StandInPool,
    next_fence: u64,
    next_op: u64,
    finished: HashSet<u64>,
}

/// Per-device fence emulation runtime; owns the Signaller thread.
pub(crate) struct FenceRuntime {
    host: Arc<dyn HostDriver>,
    device: HostHandle,
    stats: Arc<BridgeStats>,
    liveness_timeout: Duration,
    state: Mutex<SignallerState>,
    /// Notified whenever the Signaller finishes incorporating state or completes an operation.
    progress: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl FenceRuntime {
    pub(crate) fn new(
        host: Arc<dyn HostDriver>,
        device: HostHandle,
        stats: Arc<BridgeStats>,
        liveness_timeout: Duration,
    ) -> Self {
        Self {
            host,
            device,
            stats,
            liveness_timeout,
            state: Mutex::new(SignallerState {
                control: None,
                control_value: 0,
                generation: 0,
                observed_generation: 0,
                stop: false,
                entries: HashMap::new(),
                orphans: Vec::new(),
                pool: StandInPool { free: Vec::new() },
                next_fence: 1,
                next_op: 1,
                finished: HashSet::new(),
            }),
            progress: Condvar::new(),
            thread: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, SignallerState> {
        lock(&self.state)
    }

    /// Creates a new fence-compatible semaphore with a fresh shared block.
    pub(crate) fn create_semaphore(
        self: &Arc<Self>,
        initial_value: u64,
        export: HostHandleTypes,
    ) -> Result<FenceSemaphore> {
        let section = SharedSection::create(RecordKind::SyncBlock)?;
        section.sync_block()?.lock().initialize(initial_value);

        let real = self.host.create_semaphore(
            self.device,
            &HostSemaphoreInfo {
                export,
                ..HostSemaphoreInfo::timeline(0)
            },
        )?;
        match self.register(real, section) {
            Ok(fence) => Ok(fence),
            Err(err) => {
                self.host.destroy_semaphore(self.device, real);
                Err(err)
            }
        }
    }

    /// Registers an imported real semaphore and its shared block.
    pub(crate) fn adopt(self: &Arc<Self>, real: HostHandle, section: SharedSection) -> Result<FenceSemaphore> {
        section.sync_block()?;
        self.register(real, section)
    }

    fn register(self: &Arc<Self>, real: HostHandle, section: SharedSection) -> Result<FenceSemaphore> {
        self.ensure_started()?;

        let mut state = self.state();
        if state.stop {
            return Err(BridgeError::ContextDestroyed);
        }
        let id = FenceId(state.next_fence);
        state.next_fence += 1;
        let seen_physical = section.sync_block()?.lock().physical_value();
        state.entries.insert(
            id,
            FenceEntry {
                real,
                section: section.clone(),
                signals: Vec::new(),
                waits: Vec::new(),
                seen_physical,
                applied_op: 0,
                error: None,
            },
        );
        if let Err(err) = self.handshake(state) {
            self.state().entries.remove(&id);
            return Err(err);
        }
        debug!(fence = id.0, semaphore = ?real, "fence: semaphore registered");
        Ok(FenceSemaphore { id, real, section })
    }

    /// Unregisters `fence` and destroys its real semaphore.
    ///
    /// Pending signals become orphans; pending waits are released.
    pub(crate) fn destroy_semaphore(&self, fence: &FenceSemaphore) {
        self.unregister(fence);
        self.host.destroy_semaphore(self.device, fence.real);
    }

    pub(crate) fn unregister(&self, fence: &FenceSemaphore) {
        let mut state = self.state();
        let Some(entry) = state.entries.remove(&fence.id) else {
            return;
        };

        let SignallerState { orphans, pool, .. } = &mut *state;
        orphans.extend(entry.signals);
        for op in entry.waits {
            pool.release(self.host.as_ref(), self.device, op.stand_in, &self.stats);
        }

        if state.stop {
            return;
        }
        if let Err(err) = self.handshake(state) {
            warn!(fence = fence.id.0, %err, "fence: unregister handshake failed");
        }
        debug!(fence = fence.id.0, "fence: semaphore unregistered");
    }

    /// Bumps the control semaphore and waits until the Signaller has picked up the new state.
    fn handshake(&self, mut state: MutexGuard<'_, SignallerState>) -> Result<()> {
        self.bump(&mut state)?;
        let target = state.generation;
        while state.observed_generation < target && !state.stop {
            state = wait(&self.progress, state);
        }
        Ok(())
    }

    fn bump(&self, state: &mut SignallerState) -> Result<()> {
        let control = state.control.ok_or(BridgeError::ContextDestroyed)?;
        state.generation += 1;
        state.control_value += 1;
        self.host
            .signal_semaphore(self.device, control, state.control_value)?;
        Ok(())
    }

    fn ensure_started(self: &Arc<Self>) -> Result<()> {
        let mut thread = lock(&self.thread);
        if thread.is_some() {
            return Ok(());
        }

        let control = self
            .host
            .create_semaphore(self.device, &HostSemaphoreInfo::timeline(0))?;
        {
            let mut state = self.state();
            if state.stop {
                drop(state);
                self.host.destroy_semaphore(self.device, control);
                return Err(BridgeError::ContextDestroyed);
            }
            state.control = Some(control);
        }

        let runtime = Arc::clone(self);
        match std::thread::Builder::new()
            .name("aero-vkbridge-signaller".to_string())
            .spawn(move || runtime.run())
        {
            Ok(handle) => {
                *thread = Some(handle);
                debug!(device = ?self.device, "fence: signaller started");
                Ok(())
            }
            Err(err) => {
                error!(%err, "fence: failed to spawn signaller");
                self.state().control = None;
                self.host.destroy_semaphore(self.device, control);
                Err(BridgeError::OutOfHostMemory)
            }
        }
    }

    fn entry_mut<'s>(
        state: &'s mut SignallerState,
        fence: &FenceSemaphore,
    ) -> Result<&'s mut FenceEntry> {
        state
            .entries
            .get_mut(&fence.id)
            .ok_or(BridgeError::InvalidParameter("semaphore is not registered"))
    }

    /// Reports a latched failure and clears it.
    fn take_latched(state: &mut SignallerState, fence: &FenceSemaphore) -> Result<()> {
        match Self::entry_mut(state, fence)?.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Clears a latched failure the caller has reported by other means.
    pub(crate) fn clear_latched(&self, fence: &FenceSemaphore) {
        if let Some(entry) = self.state().entries.get_mut(&fence.id) {
            entry.error = None;
        }
    }

    /// Guest-visible counter value.
    pub(crate) fn query(&self, fence: &FenceSemaphore) -> Result<u64> {
        Self::take_latched(&mut self.state(), fence)?;
        Ok(fence.block()?.lock().virtual_value())
    }

    /// Host-side (CPU) signal. Returns once the Signaller has applied it.
    pub(crate) fn signal_from_host(&self, fence: &FenceSemaphore, value: u64) -> Result<()> {
        let mut state = self.state();
        if state.stop {
            return Err(BridgeError::ContextDestroyed);
        }
        Self::take_latched(&mut state, fence)?;

        let id = state.next_op;
        state.next_op += 1;
        let SignallerState {
            entries, pool, ..
        } = &mut *state;
        let entry = entries
            .get_mut(&fence.id)
            .ok_or(BridgeError::InvalidParameter("semaphore is not registered"))?;
        let stand_in = pool.take(self.host.as_ref(), self.device, &self.stats)?;
        if let Err(err) = self
            .host
            .signal_semaphore(self.device, stand_in.semaphore, stand_in.value)
        {
            self.host.destroy_semaphore(self.device, stand_in.semaphore);
            return Err(err.into());
        }
        entry.signals.push(PendingOperation {
            id,
            stand_in,
            virtual_value: value,
            since_physical: 0,
            notify: true,
        });
        self.stats.inc_pending_signals();
        self.bump(&mut state)?;

        while !state.finished.remove(&id) {
            if state.stop {
                return Err(BridgeError::ContextDestroyed);
            }
            state = wait(&self.progress, state);
        }
        match Self::take_latched(&mut state, fence) {
            Err(BridgeError::InvalidParameter(_)) => Ok(()),
            result => result,
        }
    }

    /// Evaluates a wait for `target` that started when the physical counter was `since_physical`.
    ///
    /// A latched failure is returned but stays latched; see [`FenceRuntime::clear_latched`].
    pub(crate) fn resolve(
        &self,
        fence: &FenceSemaphore,
        target: u64,
        since_physical: u64,
    ) -> Result<WaitResolution> {
        if let Some(err) = &Self::entry_mut(&mut self.state(), fence)?.error {
            return Err(err.clone());
        }
        Ok(fence.block()?.lock().resolve_wait(target, since_physical))
    }

    pub(crate) fn physical(&self, fence: &FenceSemaphore) -> Result<u64> {
        Ok(fence.block()?.lock().physical_value())
    }

    /// Starts rewriting one submission. Holds the runtime lock until finished or dropped.
    pub(crate) fn batch(&self) -> FenceBatch<'_> {
        FenceBatch {
            runtime: self,
            state: self.state(),
            ops: Vec::new(),
            done: false,
        }
    }

    /// Stops the Signaller and releases every stand-in and the control semaphore.
    pub(crate) fn shutdown(&self) {
        {
            let mut state = self.state();
            if state.stop {
                return;
            }
            state.stop = true;
            if state.control.is_some() {
                if let Err(err) = self.bump(&mut state) {
                    warn!(%err, "fence: failed to wake signaller for shutdown");
                }
            }
            self.progress.notify_all();
        }

        if let Some(handle) = lock(&self.thread).take() {
            if handle.join().is_err() {
                error!(device = ?self.device, "fence: signaller panicked");
            }
        }

        let mut state = self.state();
        let SignallerState {
            entries,
            orphans,
            pool,
            control,
            ..
        } = &mut *state;
        // GPU work still blocked on stand-ins must be able to drain.
        let pending = entries
            .values_mut()
            .flat_map(|entry| entry.signals.drain(..).chain(entry.waits.drain(..)))
            .chain(orphans.drain(..))
            .collect::<Vec<_>>();
        for op in pending {
            pool.release(self.host.as_ref(), self.device, op.stand_in, &self.stats);
        }
        for stand_in in pool.free.drain(..) {
            self.host.destroy_semaphore(self.device, stand_in.semaphore);
        }
        if let Some(control) = control.take() {
            self.host.destroy_semaphore(self.device, control);
        }
        debug!(device = ?self.device, "fence: runtime shut down");
    }

    #[cfg(test)]
    fn pending_counts(&self, fence: &FenceSemaphore) -> (usize, usize) {
        let state = self.state();
        state
            .entries
            .get(&fence.id)
            .map(|entry| (entry.signals.len(), entry.waits.len()))
            .unwrap_or_default()
    }
}

/// Stand-in registrations made while rewriting one submission.
///
/// Dropping the batch without [`FenceBatch::finish`] succeeding abandons every operation it
/// registered: stand-ins are signalled and recycled and no signal is applied.
pub(crate) struct FenceBatch<'a> {
    runtime: &'a FenceRuntime,
    state: MutexGuard<'a, SignallerState>,
    ops: Vec<(FenceId, u64)>,
    done: bool,
}

impl FenceBatch<'_> {
    /// Rewrites a GPU wait for `value`.
    pub(crate) fn wait(&mut self, fence: &FenceSemaphore, value: u64) -> Result<HostSemaphoreOp> {
        let rt = self.runtime;
        let block = fence.block()?;

        let id = self.state.next_op;
        let SignallerState {
            entries, pool, ..
        } = &mut *self.state;
        let entry = entries
            .get_mut(&fence.id)
            .ok_or(BridgeError::InvalidParameter("semaphore is not registered"))?;

        let block = block.lock();
        let physical = block.physical_value();
        if block.virtual_value() >= value {
            rt.stats.inc_fast_path_waits();
            return Ok(HostSemaphoreOp::new(entry.real, physical));
        }

        let stand_in = pool.take(rt.host.as_ref(), rt.device, &rt.stats)?;
        entry.waits.push(PendingOperation {
            id,
            stand_in,
            virtual_value: value,
            since_physical: physical,
            notify: false,
        });
        drop(block);

        self.state.next_op += 1;
        self.ops.push((fence.id, id));
        rt.stats.inc_pending_waits();
        Ok(HostSemaphoreOp::new(stand_in.semaphore, stand_in.value))
    }

    /// Rewrites a GPU signal of `value`.
    pub(crate) fn signal(&mut self, fence: &FenceSemaphore, value: u64) -> Result<HostSemaphoreOp> {
        let rt = self.runtime;

        let id = self.state.next_op;
        let SignallerState {
            entries, pool, ..
        } = &mut *self.state;
        let entry = entries
            .get_mut(&fence.id)
            .ok_or(BridgeError::InvalidParameter("semaphore is not registered"))?;

        let stand_in = pool.take(rt.host.as_ref(), rt.device, &rt.stats)?;
        entry.signals.push(PendingOperation {
            id,
            stand_in,
            virtual_value: value,
            since_physical: 0,
            notify: false,
        });

        self.state.next_op += 1;
        self.ops.push((fence.id, id));
        rt.stats.inc_pending_signals();
        Ok(HostSemaphoreOp::new(stand_in.semaphore, stand_in.value))
    }

    /// Runs the host submission; on success the Signaller is woken to watch the new stand-ins,
    /// on failure they are abandoned.
    pub(crate) fn finish(mut self, submit: impl FnOnce() -> Result<()>) -> Result<()> {
        submit()?;
        self.done = true;
        if !self.ops.is_empty() {
            self.runtime.bump(&mut self.state)?;
        }
        Ok(())
    }
}

impl Drop for FenceBatch<'_> {
    fn drop(&mut self) {
        if self.done || self.ops.is_empty() {
            return;
        }
        let rt = self.runtime;
        let SignallerState {
            entries, pool, ..
        } = &mut *self.state;
        for (fence, id) in self.ops.drain(..) {
            let Some(entry) = entries.get_mut(&fence) else {
                continue;
            };
            for list in [&mut entry.signals, &mut entry.waits] {
                if let Some(index) = list.iter().position(|op| op.id == id) {
                    let op = list.remove(index);
                    pool.release(rt.host.as_ref(), rt.device, op.stand_in, &rt.stats);
                }
            }
        }
        debug!(device = ?rt.device, "fence: abandoned rewritten submission");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Instant;

    use crate::host::{HostSubmitInfo, SoftDriver, WaitMode, WaitOutcome};

    struct Fixture {
        driver: Arc<SoftDriver>,
        device: HostHandle,
        queue: HostHandle,
        runtime: Arc<FenceRuntime>,
        stats: Arc<BridgeStats>,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.runtime.shutdown();
        }
    }

    fn fixture() -> Fixture {
        let driver = Arc::new(SoftDriver::new());
        let instance = driver.create_instance().unwrap();
        let physical = driver.enumerate_physical_devices(instance).unwrap()[0];
        let device = driver.create_device(physical).unwrap();
        let queue = driver.get_queue(device, 0).unwrap();
        let stats = Arc::new(BridgeStats::new());
        let runtime = Arc::new(FenceRuntime::new(
            driver.clone(),
            device,
            Arc::clone(&stats),
            Duration::from_secs(5),
        ));
        Fixture {
            driver,
            device,
            queue,
            runtime,
            stats,
        }
    }

    fn submit(fx: &Fixture, waits: &[HostSemaphoreOp], signals: &[HostSemaphoreOp]) {
        fx.driver
            .queue_submit(
                fx.queue,
                &[HostSubmitInfo {
                    waits,
                    command_buffers: &[],
                    signals,
                }],
            )
            .unwrap();
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn host_signal_updates_virtual_and_physical_counters() {
        let fx = fixture();
        let fence = fx.runtime.create_semaphore(0, HostHandleTypes::empty()).unwrap();

        fx.runtime.signal_from_host(&fence, 7).unwrap();
        assert_eq!(fx.runtime.query(&fence), Ok(7));
        assert_eq!(fx.runtime.physical(&fence), Ok(1));
        assert_eq!(fx.driver.semaphore_counter_value(fx.device, fence.real), Ok(1));

        // Backwards signal is a recorded reset.
        fx.runtime.signal_from_host(&fence, 2).unwrap();
        assert_eq!(fx.runtime.query(&fence), Ok(2));
        assert_eq!(fx.stats.snapshot().resets_recorded, 1);
    }

    #[test]
    fn satisfied_wait_takes_the_fast_path() {
        let fx = fixture();
        let fence = fx.runtime.create_semaphore(5, HostHandleTypes::empty()).unwrap();

        let mut batch = fx.runtime.batch();
        let op = batch.wait(&fence, 3).unwrap();
        batch.finish(|| Ok(())).unwrap();

        assert_eq!(op, HostSemaphoreOp::new(fence.real, 0));
        let stats = fx.stats.snapshot();
        assert_eq!(stats.fast_path_waits, 1);
        assert_eq!(stats.pending_waits, 0);
        assert_eq!(fx.runtime.pending_counts(&fence), (0, 0));
    }

    #[test]
    fn gpu_signal_is_applied_by_signaller() {
        let fx = fixture();
        let fence = fx.runtime.create_semaphore(0, HostHandleTypes::empty()).unwrap();

        let mut batch = fx.runtime.batch();
        let signal_op = batch.signal(&fence, 4).unwrap();
        batch
            .finish(|| {
                submit(&fx, &[], &[signal_op]);
                Ok(())
            })
            .unwrap();

        wait_until(|| fx.runtime.query(&fence) == Ok(4));
        wait_until(|| fx.runtime.pending_counts(&fence) == (0, 0));
        assert_eq!(fx.runtime.physical(&fence), Ok(1));
    }

    #[test]
    fn gpu_wait_is_released_once_value_is_reached() {
        let fx = fixture();
        let fence = fx.runtime.create_semaphore(0, HostHandleTypes::empty()).unwrap();
        let done = fx
            .driver
            .create_semaphore(fx.device, &HostSemaphoreInfo::timeline(0))
            .unwrap();

        let mut batch = fx.runtime.batch();
        let wait_op = batch.wait(&fence, 4).unwrap();
        batch
            .finish(|| {
                submit(&fx, &[wait_op], &[HostSemaphoreOp::new(done, 1)]);
                Ok(())
            })
            .unwrap();
        assert_eq!(fx.runtime.pending_counts(&fence), (0, 1));

        fx.runtime.signal_from_host(&fence, 3).unwrap();
        let pending = fx.driver.wait_semaphores(
            fx.device,
            &[HostSemaphoreOp::new(done, 1)],
            WaitMode::All,
            Some(Duration::from_millis(20)),
        );
        assert_eq!(pending, Ok(WaitOutcome::TimedOut));

        fx.runtime.signal_from_host(&fence, 4).unwrap();
        let outcome = fx.driver.wait_semaphores(
            fx.device,
            &[HostSemaphoreOp::new(done, 1)],
            WaitMode::All,
            Some(Duration::from_secs(5)),
        );
        assert_eq!(outcome, Ok(WaitOutcome::Satisfied));
        wait_until(|| fx.runtime.pending_counts(&fence) == (0, 0));
    }

    #[test]
    fn failed_submission_abandons_stand_ins() {
        let fx = fixture();
        let fence = fx.runtime.create_semaphore(0, HostHandleTypes::empty()).unwrap();

        let mut batch = fx.runtime.batch();
        batch.signal(&fence, 9).unwrap();
        batch.wait(&fence, 20).unwrap();
        let err = batch.finish(|| Err(BridgeError::OutOfHostMemory));
        assert_eq!(err, Err(BridgeError::OutOfHostMemory));

        assert_eq!(fx.runtime.pending_counts(&fence), (0, 0));
        assert_eq!(fx.runtime.query(&fence), Ok(0));
        assert_eq!(fx.stats.snapshot().stand_ins_recycled, 2);
    }

    #[test]
    fn unresolvable_wait_is_latched() {
        let fx = fixture();
        let fence = fx.runtime.create_semaphore(0, HostHandleTypes::empty()).unwrap();
        let done = fx
            .driver
            .create_semaphore(fx.device, &HostSemaphoreInfo::timeline(0))
            .unwrap();

        let mut batch = fx.runtime.batch();
        let wait_op = batch.wait(&fence, 50).unwrap();
        batch
            .finish(|| {
                submit(&fx, &[wait_op], &[HostSemaphoreOp::new(done, 1)]);
                Ok(())
            })
            .unwrap();

        // Seventeen excursions to a value below 50 and back down evict the ring's oldest entry
        // while the wait is still pending.
        for round in 0..=aero_sync_shared::RESET_RING_CAPACITY as u64 {
            let section = fence.section.clone();
            let mut block = section.sync_block().unwrap().lock();
            block.apply_signal(10 + round);
            block.apply_signal(1);
        }
        // Let the Signaller look at the block again.
        let signalled = fx.runtime.signal_from_host(&fence, 1);

        let outcome = fx.driver.wait_semaphores(
            fx.device,
            &[HostSemaphoreOp::new(done, 1)],
            WaitMode::All,
            Some(Duration::from_secs(5)),
        );
        assert_eq!(outcome, Ok(WaitOutcome::Satisfied));
        assert_eq!(fx.stats.snapshot().unresolvable_waits, 1);

        // Reported exactly once, by whichever call sees it first.
        match signalled {
            Err(BridgeError::ResetBacklogOverflow { value: 50, .. }) => {}
            Ok(()) => assert!(matches!(
                fx.runtime.query(&fence),
                Err(BridgeError::ResetBacklogOverflow { value: 50, .. })
            )),
            other => panic!("unexpected signal result {other:?}"),
        }
        assert_eq!(fx.runtime.query(&fence), Ok(1));

        fx.runtime.signal_from_host(&fence, 100).unwrap();
        assert_eq!(fx.runtime.query(&fence), Ok(100));
    }

    #[test]
    fn later_signal_wins_over_an_earlier_one_completing_late() {
        let fx = fixture();
        let fence = fx.runtime.create_semaphore(0, HostHandleTypes::empty()).unwrap();

        // Two queues: the first submission signals 5, the second 8.
        let mut batch = fx.runtime.batch();
        let first = batch.signal(&fence, 5).unwrap();
        batch.finish(|| Ok(())).unwrap();
        let mut batch = fx.runtime.batch();
        let second = batch.signal(&fence, 8).unwrap();
        batch.finish(|| Ok(())).unwrap();

        fx.driver
            .signal_semaphore(fx.device, second.semaphore, second.value)
            .unwrap();
        wait_until(|| fx.runtime.query(&fence) == Ok(8));

        fx.driver
            .signal_semaphore(fx.device, first.semaphore, first.value)
            .unwrap();
        wait_until(|| fx.runtime.pending_counts(&fence) == (0, 0));

        assert_eq!(fx.runtime.query(&fence), Ok(8));
        assert_eq!(fx.runtime.physical(&fence), Ok(1));
        let stats = fx.stats.snapshot();
        assert_eq!(stats.signals_superseded, 1);
        assert_eq!(stats.resets_recorded, 0);
    }

    #[test]
    fn signals_completing_together_apply_in_submission_order() {
        let fx = fixture();
        let fence = fx.runtime.create_semaphore(0, HostHandleTypes::empty()).unwrap();

        let mut batch = fx.runtime.batch();
        let up = batch.signal(&fence, 9).unwrap();
        let down = batch.signal(&fence, 2).unwrap();
        batch
            .finish(|| {
                submit(&fx, &[], &[up, down]);
                Ok(())
            })
            .unwrap();

        wait_until(|| fx.runtime.pending_counts(&fence) == (0, 0));
        assert_eq!(fx.runtime.query(&fence), Ok(2));
        assert_eq!(fx.stats.snapshot().resets_recorded, 1);
        assert_eq!(fx.stats.snapshot().signals_superseded, 0);
    }

    #[test]
    fn unregister_releases_pending_waits() {
        let fx = fixture();
        let fence = fx.runtime.create_semaphore(0, HostHandleTypes::empty()).unwrap();

        let mut batch = fx.runtime.batch();
        let wait_op = batch.wait(&fence, 3).unwrap();
        batch.finish(|| Ok(())).unwrap();

        fx.runtime.destroy_semaphore(&fence);
        assert_eq!(
            fx.driver
                .semaphore_counter_value(fx.device, wait_op.semaphore)
                .unwrap(),
            wait_op.value
        );
        assert_eq!(
            fx.runtime.query(&fence),
            Err(BridgeError::InvalidParameter("semaphore is not registered"))
        );
    }
}
