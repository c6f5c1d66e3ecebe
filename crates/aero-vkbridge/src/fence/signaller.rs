//! The Signaller: one background thread per device resolving pending fence operations.
//!
//! Each iteration snapshots the runtime state under its lock, applies every signal whose
//! stand-in the GPU has completed, releases every wait the virtual counter now satisfies and then
//! blocks in a single host wait-any over
//!
//! - the control semaphore at its next value (registration, new work, shutdown),
//! - the stand-ins of pending signals and orphans,
//! - the real semaphore at its next physical value for every semaphore with pending waits, so
//!   signals applied by other processes are noticed.
//!
//! Completed signals are applied in submission order. One that completes after a later-submitted
//! signal on the same semaphore was applied is dropped, so racing queues cannot move the counter
//! back to a stale value.

use std::collections::HashSet;
use std::time::Duration;

use aero_sync_shared::WaitResolution;
use tracing::{debug, error, warn};

use super::{FenceEntry, FenceRuntime, PendingOperation, SignallerState, StandInPool};
use crate::error::BridgeError;
use crate::host::{HostDriver, HostHandle, HostSemaphoreOp, WaitMode, WaitOutcome};
use crate::stats::BridgeStats;

/// Pause after a failed host wait before trying again.
const ERROR_BACKOFF: Duration = Duration::from_millis(10);

impl FenceRuntime {
    pub(super) fn run(&self) {
        debug!(device = ?self.device, "signaller: running");
        loop {
            let waits = {
                let mut state = self.state();
                state.observed_generation = state.generation;
                if state.stop {
                    self.progress.notify_all();
                    break;
                }
                self.stats.inc_signaller_iterations();

                let Some(control) = state.control else {
                    break;
                };
                let control_target = state.control_value + 1;
                self.process(&mut state);
                self.progress.notify_all();
                wait_set(&state, HostSemaphoreOp::new(control, control_target))
            };

            match self.host.wait_semaphores(
                self.device,
                &waits,
                WaitMode::Any,
                Some(self.liveness_timeout),
            ) {
                Ok(WaitOutcome::Satisfied) => {}
                Ok(WaitOutcome::TimedOut) => {
                    if waits.len() > 1 {
                        self.stats.inc_signaller_timeouts();
                        warn!(
                            device = ?self.device,
                            pending = waits.len() - 1,
                            timeout_ms = self.liveness_timeout.as_millis() as u64,
                            "signaller: liveness timeout with pending operations"
                        );
                    }
                }
                Err(err) => {
                    error!(device = ?self.device, %err, "signaller: host wait failed");
                    std::thread::sleep(ERROR_BACKOFF);
                }
            }
        }
        debug!(device = ?self.device, "signaller: stopped");
    }

    fn process(&self, state: &mut SignallerState) {
        let host = self.host.as_ref();
        let SignallerState {
            entries,
            orphans,
            pool,
            finished,
            ..
        } = state;

        for entry in entries.values_mut() {
            process_entry(host, self.device, &self.stats, entry, pool, finished);
        }

        orphans.retain(|op| {
            if !stand_in_reached(host, self.device, op) {
                return true;
            }
            if op.notify {
                finished.insert(op.id);
            }
            pool.recycle(op.stand_in, &self.stats);
            false
        });
    }
}

fn stand_in_reached(host: &dyn HostDriver, device: HostHandle, op: &PendingOperation) -> bool {
    match host.semaphore_counter_value(device, op.stand_in.semaphore) {
        Ok(value) => value >= op.stand_in.value,
        Err(err) => {
            error!(semaphore = ?op.stand_in.semaphore, %err, "signaller: stand-in query failed");
            false
        }
    }
}

fn process_entry(
    host: &dyn HostDriver,
    device: HostHandle,
    stats: &BridgeStats,
    entry: &mut FenceEntry,
    pool: &mut StandInPool,
    finished: &mut HashSet<u64>,
) {
    let mut completed = Vec::new();
    let mut index = 0;
    while index < entry.signals.len() {
        if stand_in_reached(host, device, &entry.signals[index]) {
            completed.push(entry.signals.remove(index));
        } else {
            index += 1;
        }
    }
    if completed.is_empty() && entry.waits.is_empty() {
        return;
    }
    completed.sort_by_key(|op| op.id);

    let block = match entry.section.sync_block() {
        Ok(block) => block,
        Err(err) => {
            error!(semaphore = ?entry.real, %err, "signaller: shared block unusable");
            return;
        }
    };
    let mut block = block.lock();

    for op in completed {
        if op.id < entry.applied_op {
            // A signal submitted later already completed; applying this one would undo it.
            stats.inc_signals_superseded();
            debug!(
                semaphore = ?entry.real,
                value = op.virtual_value,
                "signaller: superseded signal dropped"
            );
            if op.notify {
                finished.insert(op.id);
            }
            pool.recycle(op.stand_in, stats);
            continue;
        }
        entry.applied_op = op.id;

        let applied = block.apply_signal(op.virtual_value);
        // Issued under the block lock so physical values reach the real semaphore in order.
        if let Err(err) = host.signal_semaphore(device, entry.real, applied.physical) {
            error!(
                semaphore = ?entry.real,
                physical = applied.physical,
                %err,
                "signaller: real semaphore signal failed"
            );
        }
        if let Some(reset) = applied.reset {
            stats.inc_resets_recorded();
            debug!(
                semaphore = ?entry.real,
                physical = reset.physical_at_reset,
                previous = reset.virtual_before_reset,
                value = op.virtual_value,
                "signaller: reset recorded"
            );
        }
        if let Some(evicted) = applied.evicted {
            stats.inc_resets_dropped();
            error!(
                semaphore = ?entry.real,
                physical = evicted.physical_at_reset,
                previous = evicted.virtual_before_reset,
                "signaller: reset history full, oldest checkpoint dropped"
            );
        }
        if op.notify {
            finished.insert(op.id);
        }
        pool.recycle(op.stand_in, stats);
    }

    let mut index = 0;
    while index < entry.waits.len() {
        let op = &entry.waits[index];
        match block.resolve_wait(op.virtual_value, op.since_physical) {
            WaitResolution::Pending => index += 1,
            WaitResolution::Satisfied => {
                let op = entry.waits.remove(index);
                pool.release(host, device, op.stand_in, stats);
            }
            WaitResolution::Unresolvable { dropped_physical } => {
                let op = entry.waits.remove(index);
                stats.inc_unresolvable_waits();
                error!(
                    semaphore = ?entry.real,
                    value = op.virtual_value,
                    since = op.since_physical,
                    dropped_physical,
                    "signaller: wait depends on a dropped reset; releasing it with an error"
                );
                if entry.error.is_none() {
                    entry.error = Some(BridgeError::ResetBacklogOverflow {
                        value: op.virtual_value,
                        dropped_physical,
                    });
                }
                pool.release(host, device, op.stand_in, stats);
            }
        }
    }
    entry.seen_physical = block.physical_value();
}

fn wait_set(state: &SignallerState, control: HostSemaphoreOp) -> Vec<HostSemaphoreOp> {
    let mut waits = vec![control];
    for entry in state.entries.values() {
        waits.extend(
            entry
                .signals
                .iter()
                .map(|op| HostSemaphoreOp::new(op.stand_in.semaphore, op.stand_in.value)),
        );
        if !entry.waits.is_empty() {
            waits.push(HostSemaphoreOp::new(entry.real, entry.seen_physical + 1));
        }
    }
    waits.extend(
        state
            .orphans
            .iter()
            .map(|op| HostSemaphoreOp::new(op.stand_in.semaphore, op.stand_in.value)),
    );
    waits
}
