use std::fmt::{Display, Formatter};

use dedupe_common::{JournalEntryCount, PhysicalBlockNumber, SequenceNumber, ZERO_BLOCK};
use serde::{Deserialize, Serialize};

/// The kinds of reference count change recorded in journals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum JournalOperation {
    DataDecrement      = 0,
    DataIncrement      = 1,
    BlockMapDecrement  = 2,
    BlockMapIncrement  = 3,
}

impl JournalOperation {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(JournalOperation::DataDecrement),
            1 => Some(JournalOperation::DataIncrement),
            2 => Some(JournalOperation::BlockMapDecrement),
            3 => Some(JournalOperation::BlockMapIncrement),
            _ => None,
        }
    }

    pub fn is_increment(&self) -> bool {
        matches!(self, JournalOperation::DataIncrement | JournalOperation::BlockMapIncrement)
    }

    pub fn is_block_map(&self) -> bool {
        matches!(self, JournalOperation::BlockMapDecrement | JournalOperation::BlockMapIncrement)
    }

    pub fn name(&self) -> &'static str {
        match self {
            JournalOperation::DataDecrement => "data decrement",
            JournalOperation::DataIncrement => "data increment",
            JournalOperation::BlockMapDecrement => "block map decrement",
            JournalOperation::BlockMapIncrement => "block map increment",
        }
    }
}

impl Display for JournalOperation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { f.write_str(self.name()) }
}

/// A position in a journal: a block sequence number and an entry within it.
///
/// Points order lexicographically, which is what replay relies on to
/// apply every change at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct JournalPoint {
    pub sequence_number: SequenceNumber,
    pub entry_count: JournalEntryCount,
}

impl JournalPoint {
    pub const fn new(sequence_number: SequenceNumber, entry_count: JournalEntryCount) -> Self {
        Self {
            sequence_number,
            entry_count,
        }
    }

    pub fn is_valid(&self) -> bool { self.sequence_number > 0 }

    pub fn before(&self, other: &JournalPoint) -> bool { self < other }

    /// Move to the next entry, rolling into the next block when full.
    pub fn advance(&mut self, entries_per_block: JournalEntryCount) {
        self.entry_count += 1;
        if self.entry_count == entries_per_block {
            self.sequence_number += 1;
            self.entry_count = 0;
        }
    }

    /// Pack into 64 bits: 48 bits of sequence, 16 of entry.
    pub fn pack(&self) -> u64 { (self.sequence_number << 16) | self.entry_count as u64 }

    pub fn unpack(packed: u64) -> Self {
        Self {
            sequence_number: packed >> 16,
            entry_count:     (packed & 0xffff) as JournalEntryCount,
        }
    }
}

/// How a logical block is mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MappingState {
    #[default]
    Unmapped,
    Uncompressed,
    /// Mapped into slot `n` of a compressed block.
    Compressed(u8),
}

/// Compressed blocks hold at most this many fragments.
pub const MAX_COMPRESSION_SLOTS: u8 = 14;

impl MappingState {
    pub fn is_compressed(&self) -> bool { matches!(self, MappingState::Compressed(_)) }

    pub fn encode(&self) -> u8 {
        match self {
            MappingState::Unmapped => 0,
            MappingState::Uncompressed => 1,
            MappingState::Compressed(slot) => 2 + slot,
        }
    }

    pub fn decode(v: u8) -> Option<Self> {
        match v {
            0 => Some(MappingState::Unmapped),
            1 => Some(MappingState::Uncompressed),
            v if v - 2 < MAX_COMPRESSION_SLOTS => Some(MappingState::Compressed(v - 2)),
            _ => None,
        }
    }
}

/// The physical side of a block mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DataLocation {
    pub pbn:   PhysicalBlockNumber,
    pub state: MappingState,
}

impl DataLocation {
    pub const fn new(pbn: PhysicalBlockNumber, state: MappingState) -> Self { Self { pbn, state } }

    pub fn is_mapped(&self) -> bool { self.state != MappingState::Unmapped }

    /// Unmapped locations must point at the zero block, mapped ones may not
    /// be compressed fragments of the zero block.
    pub fn is_valid(&self) -> bool {
        if self.pbn == ZERO_BLOCK {
            !self.state.is_compressed()
        } else {
            self.is_mapped()
        }
    }
}

/// A slot in a block map page: the page's pbn and the entry index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct BlockMapSlot {
    pub pbn:  PhysicalBlockNumber,
    pub slot: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_order_and_advance() {
        let mut p = JournalPoint::new(3, 2);
        assert!(JournalPoint::new(3, 1).before(&p));
        assert!(p.before(&JournalPoint::new(4, 0)));
        p.advance(3);
        assert_eq!(p, JournalPoint::new(4, 0));
        assert_eq!(JournalPoint::unpack(p.pack()), p);
    }

    #[test]
    fn mapping_states() {
        for v in 0..(2 + MAX_COMPRESSION_SLOTS) {
            assert_eq!(MappingState::decode(v).unwrap().encode(), v);
        }
        assert!(MappingState::decode(2 + MAX_COMPRESSION_SLOTS).is_none());
        assert!(DataLocation::new(ZERO_BLOCK, MappingState::Unmapped).is_valid());
        assert!(!DataLocation::new(7, MappingState::Unmapped).is_valid());
        assert!(!DataLocation::new(ZERO_BLOCK, MappingState::Compressed(1)).is_valid());
    }
}
