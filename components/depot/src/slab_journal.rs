//! The per-slab journal of reference count changes.
//!
//! Entries are appended to an in-memory tail block which is written to
//! the on-disk ring when it fills or is committed. Blocks stay in the ring
//! from `head` until the reference counts covering them have been saved,
//! at which point the journal is reaped.

use bytes::{Buf, BufMut};
use dedupe_common::{BlockCount, Nonce, PhysicalBlockNumber, SequenceNumber, SlabBlockNumber, VDO_BLOCK_SIZE};
use dedupe_types::journal::{JournalOperation, JournalPoint};
use serde::Serialize;
use snafu::ensure;
use tracing::debug;

use crate::{
    config::{SlabConfig, SLAB_JOURNAL_HEADER_BYTES},
    err::{BadStateSnafu, CorruptJournalSnafu, Result},
    ref_counts::RefCounts,
    store::MetadataStore,
};

pub const SLAB_JOURNAL_METADATA_TYPE: u8 = 2;

const SBN_MASK: u32 = (1 << 23) - 1;
const INCREMENT_BIT: u32 = 1 << 23;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabJournalEntry {
    pub sbn:       SlabBlockNumber,
    pub operation: JournalOperation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlabJournalHeader {
    pub head:                     SequenceNumber,
    pub sequence_number:          SequenceNumber,
    pub recovery_point:           JournalPoint,
    pub nonce:                    Nonce,
    pub metadata_type:            u8,
    pub has_block_map_increments: bool,
    pub entry_count:              u16,
}

/// One decoded journal block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlabJournalBlock {
    pub header:  SlabJournalHeader,
    pub entries: Vec<SlabJournalEntry>,
}

impl SlabJournalBlock {
    /// Block map entries carry a type bit, stored in a bitmap after the
    /// largest number of entries such a block may hold.
    pub fn encode(&self, full_entries_per_block: u16) -> Vec<u8> {
        let header = &self.header;
        let mut buf = Vec::with_capacity(VDO_BLOCK_SIZE);
        buf.put_u64_le(header.head);
        buf.put_u64_le(header.sequence_number);
        buf.put_u64_le(header.recovery_point.pack());
        buf.put_u64_le(header.nonce);
        buf.put_u8(header.metadata_type);
        buf.put_u8(header.has_block_map_increments as u8);
        buf.put_u16_le(self.entries.len() as u16);

        for entry in &self.entries {
            let mut packed = entry.sbn & SBN_MASK;
            if entry.operation.is_increment() {
                packed |= INCREMENT_BIT;
            }
            buf.put_uint_le(packed as u64, 3);
        }
        if header.has_block_map_increments {
            buf.resize(SLAB_JOURNAL_HEADER_BYTES + full_entries_per_block as usize * 3, 0);
            let mut bitmap = vec![0u8; (full_entries_per_block as usize + 7) / 8];
            for (i, entry) in self.entries.iter().enumerate() {
                if entry.operation.is_block_map() {
                    bitmap[i / 8] |= 1 << (i % 8);
                }
            }
            buf.put_slice(&bitmap);
        }
        buf.resize(VDO_BLOCK_SIZE, 0);
        buf
    }

    /// Decode without judging whether the block belongs to any journal.
    pub fn decode(raw: &[u8], full_entries_per_block: u16) -> Self {
        let mut buf = raw;
        let header = SlabJournalHeader {
            head:                     buf.get_u64_le(),
            sequence_number:          buf.get_u64_le(),
            recovery_point:           JournalPoint::unpack(buf.get_u64_le()),
            nonce:                    buf.get_u64_le(),
            metadata_type:            buf.get_u8(),
            has_block_map_increments: buf.get_u8() != 0,
            entry_count:              buf.get_u16_le(),
        };
        let payload = &raw[SLAB_JOURNAL_HEADER_BYTES..];
        let count = (header.entry_count as usize).min(payload.len() / 3);
        let bitmap_at = full_entries_per_block as usize * 3;
        let entries = (0..count)
            .map(|i| {
                let mut bytes = &payload[i * 3..i * 3 + 3];
                let packed = bytes.get_uint_le(3) as u32;
                let block_map = header.has_block_map_increments
                    && payload
                        .get(bitmap_at + i / 8)
                        .is_some_and(|b| b & (1 << (i % 8)) != 0);
                let operation = match (block_map, packed & INCREMENT_BIT != 0) {
                    (false, false) => JournalOperation::DataDecrement,
                    (false, true) => JournalOperation::DataIncrement,
                    (true, false) => JournalOperation::BlockMapDecrement,
                    (true, true) => JournalOperation::BlockMapIncrement,
                };
                SlabJournalEntry {
                    sbn: packed & SBN_MASK,
                    operation,
                }
            })
            .collect();
        Self { header, entries }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SlabJournalStats {
    /// Entries refused because the ring was full.
    pub disk_full_count: u64,
    /// Times the reference counts were saved to make room.
    pub flush_count:     u64,
    /// Entries that arrived with the journal past the blocking threshold.
    pub blocked_count:   u64,
    pub blocks_written:  u64,
}

#[derive(Debug, Clone)]
pub struct SlabJournal {
    origin:                        PhysicalBlockNumber,
    config:                        SlabConfig,
    nonce:                         Nonce,
    /// Oldest block whose entries may be missing from saved counts.
    head:                          SequenceNumber,
    /// Sequence number of the block being filled.
    tail:                          SequenceNumber,
    tail_entries:                  Vec<SlabJournalEntry>,
    tail_has_block_map_increments: bool,
    /// Latest recovery journal point recorded.
    recovery_point:                JournalPoint,
    stats:                         SlabJournalStats,
}

impl SlabJournal {
    pub fn new(origin: PhysicalBlockNumber, config: SlabConfig, nonce: Nonce) -> Self {
        Self {
            origin,
            config,
            nonce,
            head: 1,
            tail: 1,
            tail_entries: Vec::new(),
            tail_has_block_map_increments: false,
            recovery_point: JournalPoint::default(),
            stats: SlabJournalStats::default(),
        }
    }

    pub fn head(&self) -> SequenceNumber { self.head }

    pub fn tail(&self) -> SequenceNumber { self.tail }

    pub fn stats(&self) -> SlabJournalStats { self.stats }

    pub fn recovery_point(&self) -> JournalPoint { self.recovery_point }

    /// Committed blocks not yet covered by saved reference counts.
    pub fn length(&self) -> BlockCount { self.tail - self.head }

    pub fn is_blank(&self) -> bool { self.tail == 1 && self.tail_entries.is_empty() }

    pub fn has_uncommitted_entries(&self) -> bool { !self.tail_entries.is_empty() }

    /// Whether the reference counts should be saved so the journal can be
    /// reaped.
    pub fn needs_flush(&self) -> bool { self.length() >= self.config.slab_journal_flushing_threshold }

    pub fn is_blocked(&self) -> bool { self.length() >= self.config.slab_journal_blocking_threshold }

    /// Whether an unrecovered slab with this journal must be scrubbed
    /// before anything else.
    pub fn requires_scrubbing(&self) -> bool { self.length() >= self.config.slab_journal_scrubbing_threshold }

    /// The ring offset the latest committed block was written to.
    pub fn tail_block_offset(&self) -> u8 {
        (self.tail.saturating_sub(1) % self.config.slab_journal_blocks) as u8
    }

    fn block_pbn(&self, sequence: SequenceNumber) -> PhysicalBlockNumber {
        self.origin + sequence % self.config.slab_journal_blocks
    }

    /// Append an entry and return its journal point.
    pub fn add_entry(
        &mut self,
        sbn: SlabBlockNumber,
        operation: JournalOperation,
        recovery_point: JournalPoint,
        store: &dyn MetadataStore,
    ) -> Result<JournalPoint> {
        if self.length() >= self.config.slab_journal_blocks {
            self.stats.disk_full_count += 1;
            return BadStateSnafu {
                reason: format!("slab journal at {} is full", self.origin),
            }
            .fail();
        }
        let needs_full_format = self.tail_has_block_map_increments || operation.is_block_map();
        let capacity = if needs_full_format {
            self.config.full_entries_per_block
        } else {
            self.config.entries_per_block
        };
        if self.tail_entries.len() >= capacity as usize {
            self.commit_tail(store)?;
        }
        if self.is_blocked() {
            self.stats.blocked_count += 1;
        }

        let point = JournalPoint::new(self.tail, self.tail_entries.len() as u16);
        self.tail_entries.push(SlabJournalEntry { sbn, operation });
        self.tail_has_block_map_increments |= operation.is_block_map();
        if self.recovery_point.before(&recovery_point) {
            self.recovery_point = recovery_point;
        }
        if self.tail_entries.len() == self.config.entries_per_block as usize {
            self.commit_tail(store)?;
        }
        Ok(point)
    }

    /// Write the tail block, even if partly full, and start a new one.
    pub fn commit_tail(&mut self, store: &dyn MetadataStore) -> Result<()> {
        if self.tail_entries.is_empty() {
            return Ok(());
        }
        ensure!(
            self.length() < self.config.slab_journal_blocks,
            BadStateSnafu {
                reason: format!("no room to commit slab journal block at {}", self.origin),
            }
        );

        let block = SlabJournalBlock {
            header:  SlabJournalHeader {
                head:                     self.head,
                sequence_number:          self.tail,
                recovery_point:           self.recovery_point,
                nonce:                    self.nonce,
                metadata_type:            SLAB_JOURNAL_METADATA_TYPE,
                has_block_map_increments: self.tail_has_block_map_increments,
                entry_count:              self.tail_entries.len() as u16,
            },
            entries: std::mem::take(&mut self.tail_entries),
        };
        store.write_block(self.block_pbn(self.tail), &block.encode(self.config.full_entries_per_block))?;
        self.tail += 1;
        self.tail_has_block_map_increments = false;
        self.stats.blocks_written += 1;
        Ok(())
    }

    /// Drop every block before `tail` once the counts covering them are
    /// saved.
    pub fn reap(&mut self) {
        if self.head < self.tail {
            self.stats.flush_count += 1;
        }
        self.head = self.tail;
    }

    /// Find the journal's bounds from its newest block, which lives at
    /// ring offset `tail_block_offset`. A `clean` journal has nothing the
    /// saved reference counts lack.
    pub fn load(&mut self, tail_block_offset: u8, clean: bool, store: &dyn MetadataStore) -> Result<()> {
        let mut raw = vec![0u8; VDO_BLOCK_SIZE];
        store.read_block(self.origin + tail_block_offset as u64, &mut raw)?;
        let block = SlabJournalBlock::decode(&raw, self.config.full_entries_per_block);
        let header = &block.header;
        if header.nonce == self.nonce
            && header.metadata_type == SLAB_JOURNAL_METADATA_TYPE
            && header.sequence_number > 0
            && header.head <= header.sequence_number
        {
            self.tail = header.sequence_number + 1;
            self.head = if clean { self.tail } else { header.head };
            self.recovery_point = header.recovery_point;
        } else {
            self.head = 1;
            self.tail = 1;
            self.recovery_point = JournalPoint::default();
        }
        self.tail_entries.clear();
        self.tail_has_block_map_increments = false;
        Ok(())
    }

    /// Read committed block `sequence` and check it belongs to this
    /// journal.
    pub fn read_block(&self, sequence: SequenceNumber, store: &dyn MetadataStore) -> Result<SlabJournalBlock> {
        let mut raw = vec![0u8; VDO_BLOCK_SIZE];
        store.read_block(self.block_pbn(sequence), &mut raw)?;
        let block = SlabJournalBlock::decode(&raw, self.config.full_entries_per_block);
        let header = &block.header;
        ensure!(
            header.nonce == self.nonce && header.metadata_type == SLAB_JOURNAL_METADATA_TYPE,
            CorruptJournalSnafu {
                reason: format!("slab journal block {sequence} at {} is not ours", self.origin),
            }
        );
        ensure!(
            header.sequence_number == sequence,
            CorruptJournalSnafu {
                reason: format!(
                    "slab journal block at {} has sequence {}, expected {sequence}",
                    self.origin, header.sequence_number
                ),
            }
        );
        let limit = if header.has_block_map_increments {
            self.config.full_entries_per_block
        } else {
            self.config.entries_per_block
        };
        ensure!(
            header.entry_count <= limit,
            CorruptJournalSnafu {
                reason: format!("slab journal block {sequence} claims {} entries", header.entry_count),
            }
        );
        Ok(block)
    }

    /// Apply every committed entry from head to tail to `ref_counts`.
    /// Entries already reflected in the counts are skipped. Returns the
    /// number applied.
    pub fn replay_into(&self, ref_counts: &mut RefCounts, store: &dyn MetadataStore) -> Result<usize> {
        let max_sbn = ref_counts.data_blocks();
        let mut applied = 0;
        for sequence in self.head..self.tail {
            let block = self.read_block(sequence, store)?;
            for (i, entry) in block.entries.iter().enumerate() {
                ensure!(
                    (entry.sbn as u64) < max_sbn,
                    CorruptJournalSnafu {
                        reason: format!(
                            "slab journal entry for block {} in a slab of {max_sbn} data blocks",
                            entry.sbn
                        ),
                    }
                );
                let point = JournalPoint::new(sequence, i as u16);
                if ref_counts.replay(entry.sbn, entry.operation, point)? {
                    applied += 1;
                }
            }
        }
        debug!(
            "replayed {applied} slab journal entries from {} blocks at {}",
            self.tail - self.head,
            self.origin
        );
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryMetadata;
    use JournalOperation::*;

    fn config() -> SlabConfig { SlabConfig::configure_with_entries(64, 8, 4).unwrap() }

    fn recovery(n: u64) -> JournalPoint { JournalPoint::new(n, 0) }

    #[test]
    fn block_encoding_keeps_entry_types() {
        let block = SlabJournalBlock {
            header:  SlabJournalHeader {
                head: 3,
                sequence_number: 5,
                recovery_point: JournalPoint::new(9, 2),
                nonce: 17,
                metadata_type: SLAB_JOURNAL_METADATA_TYPE,
                has_block_map_increments: true,
                entry_count: 3,
            },
            entries: vec![
                SlabJournalEntry { sbn: 1, operation: DataIncrement },
                SlabJournalEntry { sbn: SBN_MASK, operation: BlockMapIncrement },
                SlabJournalEntry { sbn: 0, operation: DataDecrement },
            ],
        };
        let raw = block.encode(1299);
        assert_eq!(raw.len(), VDO_BLOCK_SIZE);
        assert_eq!(SlabJournalBlock::decode(&raw, 1299), block);
    }

    #[test]
    fn entries_fill_blocks_and_replay() {
        let store = MemoryMetadata::new(64);
        let mut journal = SlabJournal::new(56, config(), 7);
        assert!(journal.is_blank());

        let mut points = vec![];
        for i in 0..6 {
            points.push(journal.add_entry(i, DataIncrement, recovery(i as u64 + 1), &store).unwrap());
        }
        assert_eq!(points[3], JournalPoint::new(1, 3));
        assert_eq!(points[4], JournalPoint::new(2, 0));
        assert_eq!(journal.length(), 1);
        journal.commit_tail(&store).unwrap();
        assert_eq!(journal.length(), 2);
        assert!(!journal.is_blank());

        let mut counts = RefCounts::new(config().data_blocks, 1);
        assert_eq!(journal.replay_into(&mut counts, &store).unwrap(), 6);
        assert_eq!(counts.free_blocks(), config().data_blocks - 6);
        // once the counts are saved a second replay finds everything applied
        counts.pack_block(0);
        assert_eq!(journal.replay_into(&mut counts, &store).unwrap(), 0);

        let mut loaded = SlabJournal::new(56, config(), 7);
        loaded.load(journal.tail_block_offset(), false, &store).unwrap();
        assert_eq!((loaded.head(), loaded.tail()), (1, 3));
        assert_eq!(loaded.recovery_point(), recovery(6));
    }

    #[test]
    fn block_map_entries_use_the_smaller_format() {
        let store = MemoryMetadata::new(64);
        let cfg = SlabConfig::configure_with_entries(64, 8, 50).unwrap();
        assert_eq!(cfg.full_entries_per_block, 48);
        let mut journal = SlabJournal::new(56, cfg, 7);
        for i in 0..48 {
            journal.add_entry(i, DataIncrement, recovery(1), &store).unwrap();
        }
        let point = journal.add_entry(50, BlockMapIncrement, recovery(2), &store).unwrap();
        assert_eq!(point, JournalPoint::new(2, 0));
        let block = journal.read_block(1, &store).unwrap();
        assert_eq!(block.entries.len(), 48);
        assert!(!block.header.has_block_map_increments);
    }

    #[test]
    fn scrubbing_rejects_foreign_blocks() {
        let store = MemoryMetadata::new(64);
        let mut journal = SlabJournal::new(56, config(), 7);
        journal.add_entry(2, DataIncrement, recovery(1), &store).unwrap();
        journal.commit_tail(&store).unwrap();

        let mut other = SlabJournal::new(56, config(), 8);
        other.head = 1;
        other.tail = 2;
        let mut counts = RefCounts::new(config().data_blocks, 1);
        assert!(other.replay_into(&mut counts, &store).unwrap_err().is_corrupt_journal());

        // an entry past the end of the slab
        let mut bad = SlabJournal::new(56, config(), 9);
        bad.add_entry(60_000, DataIncrement, recovery(1), &store).unwrap();
        bad.commit_tail(&store).unwrap();
        assert!(bad.replay_into(&mut counts, &store).unwrap_err().is_corrupt_journal());
    }

    #[test]
    fn thresholds_and_reaping() {
        let store = MemoryMetadata::new(64);
        let cfg = config();
        let mut journal = SlabJournal::new(56, cfg, 7);
        for i in 0..(cfg.slab_journal_flushing_threshold * 4) as u32 {
            journal.add_entry(i, DataIncrement, recovery(1), &store).unwrap();
        }
        assert!(journal.needs_flush());
        journal.reap();
        assert_eq!(journal.length(), 0);
        assert_eq!(journal.stats().flush_count, 1);

        for i in 0..(cfg.slab_journal_blocks * 4) as u32 {
            journal.add_entry(i % 50, DataIncrement, recovery(2), &store).unwrap();
        }
        assert!(journal.requires_scrubbing());
        assert!(journal.add_entry(1, DataIncrement, recovery(3), &store).is_err());
        assert_eq!(journal.stats().disk_full_count, 1);
    }
}
