//! Anonymous shared sections.
//!
//! A [`SharedSection`] is the in-process stand-in for an OS shared-memory mapping: every clone is
//! another mapping of the same bytes. Storage is a boxed slice of `AtomicU64`, which guarantees the
//! 8-byte alignment every record needs and lets any number of threads hold shared references into
//! it at the same time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::keyed_mutex::KeyedMutexState;
use crate::layout::{
    header_index, section_bytes_for, RecordKind, SectionHeader, RECORD_OFFSET, SECTION_MAGIC,
    SECTION_VERSION,
};
use crate::sync_block::SharedSyncBlock;

/// A fixed-layout record that lives inside a shared section.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, consist solely of atomics (so shared references may alias
/// across threads and processes), treat the all-zero bit pattern as a valid initial state and
/// require at most 8-byte alignment.
pub unsafe trait SharedRecord: Sync + Sized {
    const KIND: RecordKind;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("out of memory allocating a {bytes}-byte shared section")]
    OutOfMemory { bytes: usize },
    #[error("bad shared section magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported shared section version {0}")]
    UnsupportedVersion(u32),
    #[error("shared section carries record kind {found}, expected {expected:?}")]
    KindMismatch { expected: RecordKind, found: u32 },
    #[error("shared section record is {found} bytes, expected {expected}")]
    SizeMismatch { expected: usize, found: usize },
}

#[derive(Clone)]
pub struct SharedSection {
    words: Arc<[AtomicU64]>,
}

impl SharedSection {
    /// Allocates a zeroed section sized for `kind` and writes its header.
    pub fn create(kind: RecordKind) -> Result<Self, LayoutError> {
        let record_bytes = match kind {
            RecordKind::SyncBlock => core::mem::size_of::<SharedSyncBlock>(),
            RecordKind::KeyedMutex => core::mem::size_of::<KeyedMutexState>(),
        };
        let bytes = section_bytes_for(record_bytes);
        let len = bytes / 8;

        let mut words = Vec::new();
        words
            .try_reserve_exact(len)
            .map_err(|_| LayoutError::OutOfMemory { bytes })?;
        words.extend((0..len).map(|_| AtomicU64::new(0)));

        let section = Self {
            words: words.into(),
        };
        let header = SectionHeader::new(kind, record_bytes).encode();
        section.words[header_index::MAGIC_VERSION].store(header[0], Ordering::Release);
        section.words[header_index::KIND_SIZE].store(header[1], Ordering::Release);
        Ok(section)
    }

    pub fn len_bytes(&self) -> usize {
        self.words.len() * 8
    }

    pub fn header(&self) -> SectionHeader {
        SectionHeader::decode([
            self.words[header_index::MAGIC_VERSION].load(Ordering::Acquire),
            self.words[header_index::KIND_SIZE].load(Ordering::Acquire),
        ])
    }

    /// Whether both values map the same underlying memory.
    pub fn same_section(&self, other: &SharedSection) -> bool {
        Arc::ptr_eq(&self.words, &other.words)
    }

    pub fn sync_block(&self) -> Result<&SharedSyncBlock, LayoutError> {
        self.record()
    }

    pub fn keyed_mutex(&self) -> Result<&KeyedMutexState, LayoutError> {
        self.record()
    }

    fn record<T: SharedRecord>(&self) -> Result<&T, LayoutError> {
        let header = self.header();
        if header.magic != SECTION_MAGIC {
            return Err(LayoutError::BadMagic(header.magic));
        }
        if header.version != SECTION_VERSION {
            return Err(LayoutError::UnsupportedVersion(header.version));
        }
        if header.kind != T::KIND as u32 {
            return Err(LayoutError::KindMismatch {
                expected: T::KIND,
                found: header.kind,
            });
        }
        let expected = core::mem::size_of::<T>();
        if header.record_bytes as usize != expected
            || RECORD_OFFSET + expected > self.len_bytes()
        {
            return Err(LayoutError::SizeMismatch {
                expected,
                found: header.record_bytes as usize,
            });
        }
        debug_assert!(core::mem::align_of::<T>() <= core::mem::align_of::<AtomicU64>());

        // SAFETY: bounds and kind were validated above; `SharedRecord` guarantees the record is
        // made of atomics, valid when zeroed, and at most 8-byte aligned, and the storage is
        // 8-byte aligned with `RECORD_OFFSET` a multiple of 8.
        let ptr = self.words[RECORD_OFFSET / 8..].as_ptr() as *const T;
        Ok(unsafe { &*ptr })
    }
}

impl std::fmt::Debug for SharedSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSection")
            .field("header", &self.header())
            .field("len_bytes", &self.len_bytes())
            .finish()
    }
}
