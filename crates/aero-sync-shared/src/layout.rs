//! Shared-section layout contract.
//!
//! A shared section is a single anonymous memory region mapped by every process that takes part
//! in a cross-process synchronization object. It starts with a fixed header followed by exactly
//! one record at [`RECORD_OFFSET`]:
//!
//! ```text
//! +--------------------+ 0
//! | header (64 bytes)  |
//! +--------------------+ RECORD_OFFSET
//! | record             |
//! +--------------------+ section_bytes_for(record size)
//! ```
//!
//! All header fields are little-endian `u32`s packed into 64-bit words so the whole section can be
//! backed by (and accessed through) `AtomicU64`s.

/// `b"AVKS"` as a little-endian `u32`.
pub const SECTION_MAGIC: u32 = 0x534B_5641;

/// Shared-section ABI version. Bump whenever a record layout changes.
pub const SECTION_VERSION: u32 = 1;

/// Size of the section header in bytes.
pub const SECTION_HEADER_BYTES: usize = 64;

/// Well-known byte offset of the record inside the section.
pub const RECORD_OFFSET: usize = SECTION_HEADER_BYTES;

/// Sections are sized in multiples of this many bytes.
pub const SECTION_ALIGN: usize = 64;

/// Word indices of the header when the section is viewed as a `u64[]`.
///
/// Layout:
/// - word 0: magic (low 32 bits), version (high 32 bits)
/// - word 1: record kind (low 32 bits), record size in bytes (high 32 bits)
/// - words 2..8: reserved (zero)
pub mod header_index {
    pub const MAGIC_VERSION: usize = 0;
    pub const KIND_SIZE: usize = 1;
    pub const WORDS: usize = super::SECTION_HEADER_BYTES / 8;
}

/// Which record a section carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RecordKind {
    SyncBlock = 1,
    KeyedMutex = 2,
}

impl RecordKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::SyncBlock),
            2 => Some(Self::KeyedMutex),
            _ => None,
        }
    }
}

/// Decoded section header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    pub magic: u32,
    pub version: u32,
    pub kind: u32,
    pub record_bytes: u32,
}

impl SectionHeader {
    pub fn new(kind: RecordKind, record_bytes: usize) -> Self {
        Self {
            magic: SECTION_MAGIC,
            version: SECTION_VERSION,
            kind: kind as u32,
            record_bytes: record_bytes as u32,
        }
    }

    pub fn encode(self) -> [u64; 2] {
        [
            u64::from(self.magic) | u64::from(self.version) << 32,
            u64::from(self.kind) | u64::from(self.record_bytes) << 32,
        ]
    }

    pub fn decode(words: [u64; 2]) -> Self {
        Self {
            magic: words[0] as u32,
            version: (words[0] >> 32) as u32,
            kind: words[1] as u32,
            record_bytes: (words[1] >> 32) as u32,
        }
    }
}

/// Total section size for a record of `record_bytes`.
pub fn section_bytes_for(record_bytes: usize) -> usize {
    align_up(RECORD_OFFSET + record_bytes, SECTION_ALIGN)
}

pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + (align - 1)) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_spells_avks() {
        assert_eq!(&SECTION_MAGIC.to_le_bytes(), b"AVKS");
    }

    #[test]
    fn header_encoding_is_reversible() {
        let header = SectionHeader::new(RecordKind::KeyedMutex, 40);
        assert_eq!(SectionHeader::decode(header.encode()), header);
        assert_eq!(RecordKind::from_raw(header.kind), Some(RecordKind::KeyedMutex));
        assert_eq!(RecordKind::from_raw(0), None);
    }

    #[test]
    fn section_size_is_aligned_and_covers_record() {
        assert_eq!(section_bytes_for(0), 64);
        assert_eq!(section_bytes_for(1), 128);
        assert_eq!(section_bytes_for(64), 128);
        assert_eq!(section_bytes_for(296), 384);
    }
}
