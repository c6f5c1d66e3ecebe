//! Fixed-layout records shared between processes that use the same synchronization objects.
//!
//! Two records are defined:
//! - [`SharedSyncBlock`]: virtual/physical counters and the reset-checkpoint ring of a
//!   fence-compatible timeline semaphore.
//! - [`KeyedMutexState`]: ownership, key and release timeline of a keyed mutex.
//!
//! Both live at a well-known offset inside a [`SharedSection`] (see [`layout`]) and are guarded
//! by an embedded process-shared [`SharedLock`]. This crate knows nothing about the host graphics
//! API; callers own the host semaphores these records describe.

pub mod keyed_mutex;
pub mod layout;
pub mod lock;
pub mod section;
pub mod sync_block;

pub use keyed_mutex::{
    AcquirePoll, KeyedMutexGuard, KeyedMutexPhase, KeyedMutexState, ReleaseError, ReleaseOutcome,
};
pub use layout::RecordKind;
pub use lock::{SharedLock, SharedLockGuard};
pub use section::{LayoutError, SharedRecord, SharedSection};
pub use sync_block::{
    AppliedSignal, ResetCheckpoint, SharedSyncBlock, SyncBlockGuard, WaitResolution,
    RESET_RING_CAPACITY,
};
