//! Cross-process keyed-mutex record.
//!
//! A keyed mutex is acquired with a key and released with a (possibly different) key; the next
//! acquire must present the key of the last release. Every release is numbered on a timeline that
//! the owner mirrors into a host timeline semaphore, which is what blocked acquirers wait on.
//!
//! A release may be *queued*: the record stays acquired until the host semaphore reaches the
//! queued value (signalled by a later GPU submission). The next acquirer that observes the
//! semaphore at or past that value completes the release on the owner's behalf.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::layout::RecordKind;
use crate::lock::{SharedLock, SharedLockGuard};
use crate::section::SharedRecord;

#[repr(C)]
pub struct KeyedMutexState {
    lock: SharedLock,
    acquired: AtomicU32,
    owner: AtomicU64,
    key: AtomicU64,
    timeline: AtomicU64,
    queued_release: AtomicU64,
}

// SAFETY: `#[repr(C)]`, atomics only, all-zero is "free, key 0, nothing released yet",
// 8-byte alignment.
unsafe impl SharedRecord for KeyedMutexState {
    const KIND: RecordKind = RecordKind::KeyedMutex;
}

impl KeyedMutexState {
    pub fn lock(&self) -> KeyedMutexGuard<'_> {
        KeyedMutexGuard {
            _lock: self.lock.lock(),
            state: self,
        }
    }
}

/// Observable phase of the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyedMutexPhase {
    Free { key: u64 },
    Acquired { owner: u64 },
    ReleaseQueued { owner: u64, value: u64 },
}

/// What an acquirer should do after one look at the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquirePoll {
    Acquired,
    /// The caller already holds the mutex.
    AlreadyHeld,
    /// Wait until the backing semaphore reaches this value, then poll again.
    WaitFor(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Released now; the caller must signal the backing semaphore to this value before dropping
    /// the guard.
    Immediate(u64),
    /// Still acquired until the backing semaphore reaches this value.
    Queued(u64),
}

impl ReleaseOutcome {
    /// Timeline value of the release.
    pub fn value(self) -> u64 {
        match self {
            Self::Immediate(value) | Self::Queued(value) => value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReleaseError {
    #[error("keyed mutex is not held by context {context:#x}")]
    NotOwned { context: u64 },
}

pub struct KeyedMutexGuard<'a> {
    state: &'a KeyedMutexState,
    _lock: SharedLockGuard<'a>,
}

impl KeyedMutexGuard<'_> {
    pub fn phase(&self) -> KeyedMutexPhase {
        let s = self.state;
        if s.acquired.load(Ordering::Relaxed) == 0 {
            return KeyedMutexPhase::Free {
                key: s.key.load(Ordering::Relaxed),
            };
        }
        let owner = s.owner.load(Ordering::Relaxed);
        match s.queued_release.load(Ordering::Relaxed) {
            0 => KeyedMutexPhase::Acquired { owner },
            value => KeyedMutexPhase::ReleaseQueued { owner, value },
        }
    }

    pub fn timeline(&self) -> u64 {
        self.state.timeline.load(Ordering::Relaxed)
    }

    /// Key the next acquire must present once the mutex is free.
    pub fn key(&self) -> u64 {
        self.state.key.load(Ordering::Relaxed)
    }

    /// One acquire attempt for `context`.
    ///
    /// `counter` reads the backing semaphore; it is only consulted when a queued release is
    /// outstanding.
    pub fn poll_acquire<E>(
        &mut self,
        context: u64,
        key: u64,
        counter: impl FnOnce() -> Result<u64, E>,
    ) -> Result<AcquirePoll, E> {
        if let KeyedMutexPhase::ReleaseQueued { value, .. } = self.phase() {
            if counter()? >= value {
                self.finish_queued_release();
            }
        }

        Ok(match self.phase() {
            KeyedMutexPhase::Acquired { owner } if owner == context => AcquirePoll::AlreadyHeld,
            KeyedMutexPhase::Free { key: required } if required == key => {
                self.state.acquired.store(1, Ordering::Relaxed);
                self.state.owner.store(context, Ordering::Relaxed);
                AcquirePoll::Acquired
            }
            KeyedMutexPhase::ReleaseQueued { value, .. } => AcquirePoll::WaitFor(value),
            KeyedMutexPhase::Free { .. } | KeyedMutexPhase::Acquired { .. } => {
                AcquirePoll::WaitFor(self.timeline() + 1)
            }
        })
    }

    /// Releases the mutex held by `context`, requiring `key` for the next acquire.
    pub fn release(
        &mut self,
        context: u64,
        key: u64,
        queued: bool,
    ) -> Result<ReleaseOutcome, ReleaseError> {
        match self.phase() {
            KeyedMutexPhase::Acquired { owner } if owner == context => {}
            _ => return Err(ReleaseError::NotOwned { context }),
        }

        let value = self.timeline() + 1;
        self.state.timeline.store(value, Ordering::Relaxed);
        self.state.key.store(key, Ordering::Relaxed);

        if queued {
            self.state.queued_release.store(value, Ordering::Relaxed);
            Ok(ReleaseOutcome::Queued(value))
        } else {
            self.state.acquired.store(0, Ordering::Relaxed);
            self.state.owner.store(0, Ordering::Relaxed);
            Ok(ReleaseOutcome::Immediate(value))
        }
    }

    /// Takes back release `value` made by `context`, which holds the mutex again with
    /// `previous_key` restored.
    ///
    /// Only the latest release can be undone, and only while nobody has acquired since. Returns
    /// whether the record was restored.
    pub fn undo_release(&mut self, context: u64, value: u64, previous_key: u64) -> bool {
        if value == 0 || self.timeline() != value {
            return false;
        }
        match self.phase() {
            KeyedMutexPhase::ReleaseQueued {
                owner,
                value: queued,
            } if owner == context && queued == value => {}
            KeyedMutexPhase::Free { .. } => {}
            _ => return false,
        }
        self.state.acquired.store(1, Ordering::Relaxed);
        self.state.owner.store(context, Ordering::Relaxed);
        self.state.key.store(previous_key, Ordering::Relaxed);
        self.state.timeline.store(value - 1, Ordering::Relaxed);
        self.state.queued_release.store(0, Ordering::Relaxed);
        true
    }

    fn finish_queued_release(&mut self) {
        self.state.acquired.store(0, Ordering::Relaxed);
        self.state.owner.store(0, Ordering::Relaxed);
        self.state.queued_release.store(0, Ordering::Relaxed);
    }
}
