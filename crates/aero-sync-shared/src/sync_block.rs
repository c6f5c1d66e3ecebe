//! Cross-process state of a fence-compatible timeline semaphore.
//!
//! The record tracks two counters:
//!
//! - the *virtual* value: what the guest observes. Signals may move it backwards ("reset").
//! - the *physical* value: a strictly monotonic step counter mirrored by a real host timeline
//!   semaphore. Every applied signal advances it by exactly one, so "something changed" can be
//!   waited for with the host primitive.
//!
//! Because the virtual value can go backwards, a waiter that was not looking at the right moment
//! may miss the window in which its target was reached. Each reset therefore records the virtual
//! value it replaced in a bounded ring of [`ResetCheckpoint`]s. When the ring overflows the oldest
//! checkpoint is evicted and only its physical value survives as the "dropped" watermark; waits
//! that started before the watermark can no longer be resolved and must fail instead of hanging.
//!
//! All fields are only touched while holding the embedded [`SharedLock`].

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::layout::RecordKind;
use crate::lock::{SharedLock, SharedLockGuard};
use crate::section::SharedRecord;

/// Number of reset checkpoints kept per semaphore.
pub const RESET_RING_CAPACITY: usize = 16;

/// Correspondence between a physical step and the virtual value it replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetCheckpoint {
    /// Physical value at which the reset became visible.
    pub physical_at_reset: u64,
    /// Virtual value immediately before the reset.
    pub virtual_before_reset: u64,
}

#[repr(C)]
struct ResetSlot {
    physical_at_reset: AtomicU64,
    virtual_before_reset: AtomicU64,
}

#[repr(C)]
pub struct SharedSyncBlock {
    lock: SharedLock,
    reset_head: AtomicU32,
    virtual_value: AtomicU64,
    physical_value: AtomicU64,
    last_dropped_reset_physical: AtomicU64,
    reset_count: AtomicU32,
    _reserved: AtomicU32,
    resets: [ResetSlot; RESET_RING_CAPACITY],
}

// SAFETY: `#[repr(C)]`, atomics only, all-zero is the valid "virtual 0, physical 0, no resets"
// state, 8-byte alignment.
unsafe impl SharedRecord for SharedSyncBlock {
    const KIND: RecordKind = RecordKind::SyncBlock;
}

impl SharedSyncBlock {
    pub fn lock(&self) -> SyncBlockGuard<'_> {
        SyncBlockGuard {
            _lock: self.lock.lock(),
            block: self,
        }
    }
}

/// Result of applying one signal to the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedSignal {
    /// New physical value; the real host semaphore must be signalled to this value.
    pub physical: u64,
    /// Checkpoint recorded if the signal moved the virtual value backwards.
    pub reset: Option<ResetCheckpoint>,
    /// Checkpoint evicted from a full ring to make room for `reset`.
    pub evicted: Option<ResetCheckpoint>,
}

/// Outcome of checking a wait against the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResolution {
    Satisfied,
    Pending,
    /// A reset the wait depends on was evicted from the ring.
    Unresolvable { dropped_physical: u64 },
}

pub struct SyncBlockGuard<'a> {
    block: &'a SharedSyncBlock,
    _lock: SharedLockGuard<'a>,
}

impl SyncBlockGuard<'_> {
    pub fn virtual_value(&self) -> u64 {
        self.block.virtual_value.load(Ordering::Relaxed)
    }

    pub fn physical_value(&self) -> u64 {
        self.block.physical_value.load(Ordering::Relaxed)
    }

    pub fn last_dropped_reset_physical(&self) -> u64 {
        self.block.last_dropped_reset_physical.load(Ordering::Relaxed)
    }

    pub fn reset_count(&self) -> usize {
        self.block.reset_count.load(Ordering::Relaxed) as usize
    }

    /// Initializes a freshly created (all-zero) block.
    pub fn initialize(&mut self, initial_value: u64) {
        self.block.virtual_value.store(initial_value, Ordering::Relaxed);
    }

    /// Recorded checkpoints, oldest first.
    pub fn resets(&self) -> impl Iterator<Item = ResetCheckpoint> + '_ {
        let head = self.block.reset_head.load(Ordering::Relaxed) as usize;
        (0..self.reset_count()).map(move |i| {
            let slot = &self.block.resets[(head + i) % RESET_RING_CAPACITY];
            ResetCheckpoint {
                physical_at_reset: slot.physical_at_reset.load(Ordering::Relaxed),
                virtual_before_reset: slot.virtual_before_reset.load(Ordering::Relaxed),
            }
        })
    }

    /// Sets the virtual value and advances the physical value by one step.
    pub fn apply_signal(&mut self, value: u64) -> AppliedSignal {
        let previous = self.virtual_value();
        let physical = self.physical_value() + 1;

        let mut applied = AppliedSignal {
            physical,
            reset: None,
            evicted: None,
        };
        if value < previous {
            let checkpoint = ResetCheckpoint {
                physical_at_reset: physical,
                virtual_before_reset: previous,
            };
            applied.evicted = self.push_reset(checkpoint);
            applied.reset = Some(checkpoint);
        }

        self.block.virtual_value.store(value, Ordering::Relaxed);
        self.block.physical_value.store(physical, Ordering::Relaxed);
        applied
    }

    fn push_reset(&mut self, checkpoint: ResetCheckpoint) -> Option<ResetCheckpoint> {
        let head = self.block.reset_head.load(Ordering::Relaxed) as usize;
        let count = self.reset_count();

        if count < RESET_RING_CAPACITY {
            let slot = &self.block.resets[(head + count) % RESET_RING_CAPACITY];
            slot.physical_at_reset
                .store(checkpoint.physical_at_reset, Ordering::Relaxed);
            slot.virtual_before_reset
                .store(checkpoint.virtual_before_reset, Ordering::Relaxed);
            self.block
                .reset_count
                .store(count as u32 + 1, Ordering::Relaxed);
            return None;
        }

        // Full: overwrite the oldest slot and remember how far history now reaches.
        let slot = &self.block.resets[head];
        let evicted = ResetCheckpoint {
            physical_at_reset: slot.physical_at_reset.load(Ordering::Relaxed),
            virtual_before_reset: slot.virtual_before_reset.load(Ordering::Relaxed),
        };
        slot.physical_at_reset
            .store(checkpoint.physical_at_reset, Ordering::Relaxed);
        slot.virtual_before_reset
            .store(checkpoint.virtual_before_reset, Ordering::Relaxed);
        self.block.reset_head.store(
            ((head + 1) % RESET_RING_CAPACITY) as u32,
            Ordering::Relaxed,
        );
        self.block
            .last_dropped_reset_physical
            .store(evicted.physical_at_reset, Ordering::Relaxed);
        Some(evicted)
    }

    /// Checks whether the virtual value reached `target` at any point after the physical value was
    /// `since_physical`.
    pub fn resolve_wait(&self, target: u64, since_physical: u64) -> WaitResolution {
        if self.virtual_value() >= target {
            return WaitResolution::Satisfied;
        }

        let covered = self.resets().any(|checkpoint| {
            checkpoint.physical_at_reset > since_physical
                && checkpoint.virtual_before_reset >= target
        });
        if covered {
            return WaitResolution::Satisfied;
        }

        let dropped = self.last_dropped_reset_physical();
        if dropped > since_physical {
            return WaitResolution::Unresolvable {
                dropped_physical: dropped,
            };
        }

        WaitResolution::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::section::SharedSection;

    use proptest::prelude::*;

    fn block_section(initial: u64) -> SharedSection {
        let section = SharedSection::create(RecordKind::SyncBlock).unwrap();
        section.sync_block().unwrap().lock().initialize(initial);
        section
    }

    #[test]
    fn record_layout_is_stable() {
        assert_eq!(core::mem::size_of::<SharedSyncBlock>(), 296);
        assert_eq!(core::mem::align_of::<SharedSyncBlock>(), 8);
    }

    #[test]
    fn forward_signals_advance_both_counters() {
        let section = block_section(3);
        let mut block = section.sync_block().unwrap().lock();

        let applied = block.apply_signal(5);
        assert_eq!(applied.physical, 1);
        assert_eq!(applied.reset, None);
        assert_eq!(block.virtual_value(), 5);

        // Re-signalling the current value still steps the physical counter.
        assert_eq!(block.apply_signal(5).physical, 2);
        assert_eq!(block.reset_count(), 0);
    }

    #[test]
    fn backwards_signal_records_checkpoint() {
        let section = block_section(0);
        let mut block = section.sync_block().unwrap().lock();

        block.apply_signal(10);
        let applied = block.apply_signal(4);
        assert_eq!(
            applied.reset,
            Some(ResetCheckpoint {
                physical_at_reset: 2,
                virtual_before_reset: 10,
            })
        );
        assert_eq!(block.virtual_value(), 4);
        assert_eq!(block.resets().count(), 1);
    }

    #[test]
    fn wait_covered_by_checkpoint_is_satisfied() {
        let section = block_section(0);
        let mut block = section.sync_block().unwrap().lock();

        let since = block.physical_value();
        block.apply_signal(10);
        block.apply_signal(2);

        assert_eq!(block.resolve_wait(8, since), WaitResolution::Satisfied);
        assert_eq!(block.resolve_wait(11, since), WaitResolution::Pending);
        // A wait that started after the reset cannot use it.
        let later = block.physical_value();
        assert_eq!(block.resolve_wait(8, later), WaitResolution::Pending);
    }

    #[test]
    fn seventeenth_reset_evicts_first_and_sets_watermark() {
        let section = block_section(0);
        let mut block = section.sync_block().unwrap().lock();
        let since = block.physical_value();

        let mut first_reset = None;
        for round in 0..=RESET_RING_CAPACITY as u64 {
            block.apply_signal(10 + round);
            let applied = block.apply_signal(1);
            first_reset.get_or_insert(applied.reset.unwrap());
            if round < RESET_RING_CAPACITY as u64 {
                assert_eq!(applied.evicted, None);
            } else {
                assert_eq!(applied.evicted, first_reset);
            }
        }

        assert_eq!(block.reset_count(), RESET_RING_CAPACITY);
        assert_eq!(
            block.last_dropped_reset_physical(),
            first_reset.unwrap().physical_at_reset
        );
        assert_eq!(
            block.resolve_wait(100, since),
            WaitResolution::Unresolvable {
                dropped_physical: first_reset.unwrap().physical_at_reset,
            }
        );
        // Still answerable from the surviving history.
        assert_eq!(block.resolve_wait(20, since), WaitResolution::Satisfied);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            .. ProptestConfig::default()
        })]

        #[test]
        fn every_reset_is_retained_or_below_watermark(values in proptest::collection::vec(0u64..64, 1..80)) {
            let section = block_section(0);
            let mut block = section.sync_block().unwrap().lock();

            let mut all_resets = Vec::new();
            let mut last_virtual = 0u64;
            let mut last_physical = 0u64;
            for value in values {
                let applied = block.apply_signal(value);
                prop_assert_eq!(applied.physical, last_physical + 1);
                prop_assert_eq!(applied.reset.is_some(), value < last_virtual);
                if let Some(reset) = applied.reset {
                    all_resets.push(reset);
                }
                last_virtual = value;
                last_physical = applied.physical;
            }

            let retained: Vec<_> = block.resets().collect();
            let watermark = block.last_dropped_reset_physical();
            for reset in &all_resets {
                prop_assert!(
                    retained.contains(reset) || reset.physical_at_reset <= watermark,
                    "reset {:?} lost (watermark {})", reset, watermark
                );
            }
            prop_assert!(retained.len() <= RESET_RING_CAPACITY);
        }
    }
}
