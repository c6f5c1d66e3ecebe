use std::sync::atomic::{AtomicU64, Ordering};

/// Telemetry counters for one device's synchronization emulation.
///
/// Updated from submitting threads and the Signaller; cheap enough to leave on unconditionally.
#[derive(Debug, Default)]
pub struct BridgeStats {
    fast_path_waits: AtomicU64,
    pending_waits: AtomicU64,
    pending_signals: AtomicU64,
    signals_superseded: AtomicU64,
    stand_ins_created: AtomicU64,
    stand_ins_recycled: AtomicU64,
    resets_recorded: AtomicU64,
    resets_dropped: AtomicU64,
    unresolvable_waits: AtomicU64,
    signaller_iterations: AtomicU64,
    signaller_timeouts: AtomicU64,
    keyed_mutex_rollbacks: AtomicU64,
}

impl BridgeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_fast_path_waits(&self) {
        self.fast_path_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_pending_waits(&self) {
        self.pending_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_pending_signals(&self) {
        self.pending_signals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_signals_superseded(&self) {
        self.signals_superseded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stand_ins_created(&self) {
        self.stand_ins_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stand_ins_recycled(&self) {
        self.stand_ins_recycled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_resets_recorded(&self) {
        self.resets_recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_resets_dropped(&self) {
        self.resets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_unresolvable_waits(&self) {
        self.unresolvable_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_signaller_iterations(&self) {
        self.signaller_iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_signaller_timeouts(&self) {
        self.signaller_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_keyed_mutex_rollbacks(&self) {
        self.keyed_mutex_rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BridgeStatsSnapshot {
        BridgeStatsSnapshot {
            fast_path_waits: self.fast_path_waits.load(Ordering::Relaxed),
            pending_waits: self.pending_waits.load(Ordering::Relaxed),
            pending_signals: self.pending_signals.load(Ordering::Relaxed),
            signals_superseded: self.signals_superseded.load(Ordering::Relaxed),
            stand_ins_created: self.stand_ins_created.load(Ordering::Relaxed),
            stand_ins_recycled: self.stand_ins_recycled.load(Ordering::Relaxed),
            resets_recorded: self.resets_recorded.load(Ordering::Relaxed),
            resets_dropped: self.resets_dropped.load(Ordering::Relaxed),
            unresolvable_waits: self.unresolvable_waits.load(Ordering::Relaxed),
            signaller_iterations: self.signaller_iterations.load(Ordering::Relaxed),
            signaller_timeouts: self.signaller_timeouts.load(Ordering::Relaxed),
            keyed_mutex_rollbacks: self.keyed_mutex_rollbacks.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BridgeStatsSnapshot {
    /// Waits already satisfied at submission time (never handed to the Signaller).
    pub fast_path_waits: u64,
    pub pending_waits: u64,
    pub pending_signals: u64,
    /// GPU signals that completed after a later-submitted signal on the same semaphore was
    /// already applied; dropped without effect.
    pub signals_superseded: u64,
    pub stand_ins_created: u64,
    pub stand_ins_recycled: u64,
    pub resets_recorded: u64,
    pub resets_dropped: u64,
    pub unresolvable_waits: u64,
    pub signaller_iterations: u64,
    pub signaller_timeouts: u64,
    pub keyed_mutex_rollbacks: u64,
}
