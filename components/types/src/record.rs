use std::{
    fmt::{Debug, Display, Formatter},
    ops::Range,
};

use byteorder::{BigEndian, ByteOrder};
use dedupe_common::{RECORD_DATA_SIZE, RECORD_NAME_SIZE};
use serde::{Deserialize, Serialize};

/// Bytes of a name that select the volume index delta list and address.
pub const VOLUME_INDEX_BYTES: Range<usize> = 0..8;
/// Bytes of a name that select the chapter index delta list and address.
pub const CHAPTER_INDEX_BYTES: Range<usize> = 8..14;
/// Bytes of a name that decide whether it is a sparse hook.
pub const SAMPLE_BYTES: Range<usize> = 14..16;

/// The width of the chapter index field, in bits.
pub const CHAPTER_INDEX_BITS: u32 = ((CHAPTER_INDEX_BYTES.end - CHAPTER_INDEX_BYTES.start) * 8) as u32;

const _: () = {
    assert!(VOLUME_INDEX_BYTES.end <= CHAPTER_INDEX_BYTES.start);
    assert!(CHAPTER_INDEX_BYTES.end <= SAMPLE_BYTES.start);
    assert!(SAMPLE_BYTES.end <= RECORD_NAME_SIZE);
};

/// The content hash a record is indexed by.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct RecordName(pub [u8; RECORD_NAME_SIZE]);

impl RecordName {
    pub const fn new(bytes: [u8; RECORD_NAME_SIZE]) -> Self { Self(bytes) }

    pub fn from_slice(buf: &[u8]) -> Option<Self> {
        let bytes: [u8; RECORD_NAME_SIZE] = buf.get(..RECORD_NAME_SIZE)?.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; RECORD_NAME_SIZE] { &self.0 }

    pub fn volume_index_bytes(&self) -> u64 { BigEndian::read_u64(&self.0[VOLUME_INDEX_BYTES]) }

    pub fn chapter_index_bytes(&self) -> u64 {
        BigEndian::read_uint(&self.0[CHAPTER_INDEX_BYTES], CHAPTER_INDEX_BYTES.len())
    }

    pub fn sample_bytes(&self) -> u16 { BigEndian::read_u16(&self.0[SAMPLE_BYTES]) }

    /// Whether the name is a hook for an index sampling one name in `rate`.
    pub fn is_sample(&self, rate: u32) -> bool {
        rate > 0 && (self.sample_bytes() as u32) % rate == 0
    }

    /// Scale the chapter index bytes onto `[0, slot_count)`.
    pub fn hash_slot(&self, slot_count: u32) -> u32 {
        ((self.chapter_index_bytes() as u128 * slot_count as u128) >> CHAPTER_INDEX_BITS) as u32
    }

    /// The chapter delta list for a chapter split into `2^list_bits` lists.
    pub fn chapter_delta_list(&self, list_bits: u32) -> u32 {
        (self.chapter_index_bytes() & ((1 << list_bits) - 1)) as u32
    }

    /// The key of the name within its chapter delta list.
    pub fn chapter_delta_address(&self, list_bits: u32, address_bits: u32) -> u32 {
        ((self.chapter_index_bytes() >> list_bits) & ((1 << address_bits) - 1)) as u32
    }
}

impl Display for RecordName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl Debug for RecordName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { write!(f, "RecordName({})", self) }
}

/// The caller supplied metadata stored alongside a name.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RecordData(pub [u8; RECORD_DATA_SIZE]);

impl RecordData {
    pub fn from_slice(buf: &[u8]) -> Option<Self> {
        let bytes: [u8; RECORD_DATA_SIZE] = buf.get(..RECORD_DATA_SIZE)?.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Metadata carrying a single number, handy for callers that only
    /// need a block address.
    pub fn from_u64(value: u64) -> Self {
        let mut data = [0u8; RECORD_DATA_SIZE];
        BigEndian::write_u64(&mut data[..8], value);
        Self(data)
    }

    pub fn as_u64(&self) -> u64 { BigEndian::read_u64(&self.0[..8]) }
}

impl Debug for RecordData {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RecordData(")?;
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// A name and its metadata, the unit stored in chapters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Record {
    pub name: RecordName,
    pub data: RecordData,
}

impl Record {
    pub fn new(name: RecordName, data: RecordData) -> Self { Self { name, data } }
}
