use dedupe_common::{ilog2, BlockCount, Nonce, PhysicalBlockNumber, SlabBlockNumber, SlabCount, VDO_BLOCK_SIZE};
use dedupe_types::journal::{JournalOperation, JournalPoint};
use snafu::ensure;
use tracing::debug;

use crate::{
    config::SlabConfig,
    err::{OutOfRangeSnafu, Result},
    ref_counts::{CountChange, RefCounts, ReferenceStatus},
    slab_journal::SlabJournal,
    store::MetadataStore,
};

/// Whether a slab's reference counts can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabRebuildStatus {
    Rebuilt,
    RequiresScrubbing,
    RequiresHighPriorityScrubbing,
    Rebuilding,
    Replaying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabAdminState {
    New,
    NormalOperation,
    Scrubbing,
    Rebuilt,
}

/// What the slab summary remembers about a slab between loads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlabSummaryEntry {
    pub tail_block_offset: u8,
    /// Free blocks, shifted down to seven bits.
    pub fullness_hint:     u8,
    /// The reference counts have been written at least once.
    pub load_ref_counts:   bool,
    /// The journal holds entries the saved counts lack.
    pub is_dirty:          bool,
}

impl SlabSummaryEntry {
    pub fn encode(&self) -> [u8; 3] {
        [
            self.tail_block_offset,
            (self.fullness_hint & 0x7f) | ((self.load_ref_counts as u8) << 7),
            self.is_dirty as u8,
        ]
    }

    pub fn decode(raw: &[u8]) -> Self {
        Self {
            tail_block_offset: raw[0],
            fullness_hint:     raw[1] & 0x7f,
            load_ref_counts:   raw[1] & 0x80 != 0,
            is_dirty:          raw[2] != 0,
        }
    }
}

/// The shift that maps a slab's free block count into a summary hint.
pub fn hint_shift(data_blocks: BlockCount) -> u32 { ilog2(data_blocks.max(1)).saturating_sub(6) }

/// A contiguous run of data blocks with the reference counts and journal
/// that track them.
#[derive(Debug, Clone)]
pub struct Slab {
    pub number:            SlabCount,
    pub start:             PhysicalBlockNumber,
    pub end:               PhysicalBlockNumber,
    pub ref_counts_origin: PhysicalBlockNumber,
    pub journal_origin:    PhysicalBlockNumber,
    pub status:            SlabRebuildStatus,
    pub admin:             SlabAdminState,
    pub(crate) priority:   u32,
    pub(crate) summary:    SlabSummaryEntry,
    config:                SlabConfig,
    ref_counts:            RefCounts,
    journal:               SlabJournal,
}

impl Slab {
    pub fn new(number: SlabCount, start: PhysicalBlockNumber, config: SlabConfig, nonce: Nonce) -> Self {
        let ref_counts_origin = start + config.data_blocks;
        let journal_origin = ref_counts_origin + config.reference_count_blocks;
        Self {
            number,
            start,
            end: start + config.slab_blocks,
            ref_counts_origin,
            journal_origin,
            status: SlabRebuildStatus::Rebuilt,
            admin: SlabAdminState::New,
            priority: 0,
            summary: SlabSummaryEntry::default(),
            config,
            ref_counts: RefCounts::new(config.data_blocks, config.reference_count_blocks),
            journal: SlabJournal::new(journal_origin, config, nonce),
        }
    }

    pub fn data_blocks(&self) -> BlockCount { self.config.data_blocks }

    pub fn free_blocks(&self) -> BlockCount { self.ref_counts.free_blocks() }

    pub fn ref_counts(&self) -> &RefCounts { &self.ref_counts }

    pub fn journal(&self) -> &SlabJournal { &self.journal }

    pub fn is_blank(&self) -> bool { self.journal.is_blank() }

    pub fn is_open(&self) -> bool { self.admin == SlabAdminState::NormalOperation }

    pub fn is_unrecovered(&self) -> bool { self.status != SlabRebuildStatus::Rebuilt }

    pub fn summary(&self) -> SlabSummaryEntry { self.summary }

    pub fn sbn_from_pbn(&self, pbn: PhysicalBlockNumber) -> Result<SlabBlockNumber> {
        ensure!(
            pbn >= self.start && pbn < self.ref_counts_origin,
            OutOfRangeSnafu {
                pbn,
                what: format!("the data blocks of slab {}", self.number),
            }
        );
        Ok((pbn - self.start) as SlabBlockNumber)
    }

    pub fn pbn_from_sbn(&self, sbn: SlabBlockNumber) -> PhysicalBlockNumber { self.start + sbn as u64 }

    /// Hand out a free block with a provisional reference.
    pub fn allocate(&mut self) -> Option<PhysicalBlockNumber> {
        self.ref_counts.allocate_unreferenced().map(|sbn| self.pbn_from_sbn(sbn))
    }

    /// Hold `pbn` provisionally. Returns whether a free block was taken.
    pub fn provisionally_reference(&mut self, pbn: PhysicalBlockNumber) -> Result<bool> {
        let sbn = self.sbn_from_pbn(pbn)?;
        let before = self.ref_counts.free_blocks();
        self.ref_counts.provisionally_reference(sbn);
        Ok(self.ref_counts.free_blocks() < before)
    }

    /// Drop an unused provisional reference on `pbn`. Returns whether the
    /// block became free.
    pub fn release_provisional(&mut self, pbn: PhysicalBlockNumber) -> Result<bool> {
        let sbn = self.sbn_from_pbn(pbn)?;
        if self.ref_counts.status(sbn) != ReferenceStatus::Provisional {
            return Ok(false);
        }
        let change = self.ref_counts.adjust(sbn, JournalOperation::DataDecrement, None)?;
        Ok(change.free_status_changed)
    }

    /// Ready a slab to be allocated from.
    pub fn open(&mut self) {
        self.admin = SlabAdminState::NormalOperation;
    }

    /// Journal and then apply a reference count change. An unrecovered
    /// slab only journals it; scrubbing applies it later.
    pub fn modify(
        &mut self,
        pbn: PhysicalBlockNumber,
        operation: JournalOperation,
        recovery_point: JournalPoint,
        store: &dyn MetadataStore,
    ) -> Result<CountChange> {
        let sbn = self.sbn_from_pbn(pbn)?;
        let point = self.journal.add_entry(sbn, operation, recovery_point, store)?;
        if self.is_unrecovered() {
            return Ok(CountChange::default());
        }
        let change = self.ref_counts.adjust(sbn, operation, Some(point))?;
        if self.journal.needs_flush() {
            self.flush(store)?;
        }
        Ok(change)
    }

    /// Journal an entry from the recovery journal unless this journal
    /// already recorded it. Returns whether it was added.
    pub fn replay_recovery_entry(
        &mut self,
        pbn: PhysicalBlockNumber,
        operation: JournalOperation,
        recovery_point: JournalPoint,
        store: &dyn MetadataStore,
    ) -> Result<bool> {
        let sbn = self.sbn_from_pbn(pbn)?;
        if !self.journal.recovery_point().before(&recovery_point) {
            return Ok(false);
        }
        self.journal.add_entry(sbn, operation, recovery_point, store)?;
        if self.status == SlabRebuildStatus::Rebuilt {
            self.status = SlabRebuildStatus::RequiresScrubbing;
        }
        if self.journal.requires_scrubbing() {
            // make room by folding what is journaled so far into the counts
            self.scrub(store)?;
        }
        Ok(true)
    }

    /// Apply a reference found while rebuilding from the block map.
    pub fn rebuild_reference(&mut self, pbn: PhysicalBlockNumber, operation: JournalOperation) -> Result<()> {
        let sbn = self.sbn_from_pbn(pbn)?;
        self.ref_counts.adjust_for_rebuild(sbn, operation)
    }

    /// Write every dirty reference block.
    pub fn save_ref_counts(&mut self, store: &dyn MetadataStore) -> Result<()> {
        for index in self.ref_counts.dirty_blocks() {
            let raw = self.ref_counts.pack_block(index);
            store.write_block(self.ref_counts_origin + index as u64, &raw)?;
        }
        self.summary.load_ref_counts = true;
        Ok(())
    }

    /// Save the counts so every journal block so far can be reaped.
    pub fn flush(&mut self, store: &dyn MetadataStore) -> Result<()> {
        self.save_ref_counts(store)?;
        self.journal.reap();
        debug!("flushed slab {}", self.number);
        Ok(())
    }

    pub fn commit_journal(&mut self, store: &dyn MetadataStore) -> Result<()> { self.journal.commit_tail(store) }

    /// Bring the summary entry up to date.
    pub fn update_summary(&mut self) {
        self.summary.tail_block_offset = self.journal.tail_block_offset();
        self.summary.fullness_hint = (self.free_blocks() >> hint_shift(self.data_blocks())).min(0x7f) as u8;
        self.summary.is_dirty = self.journal.length() > 0 || self.is_unrecovered();
    }

    /// Read the slab's state as of `summary`, deciding whether it needs
    /// scrubbing before it can be used.
    pub fn load(&mut self, summary: SlabSummaryEntry, store: &dyn MetadataStore) -> Result<()> {
        self.summary = summary;
        self.journal.load(summary.tail_block_offset, !summary.is_dirty, store)?;
        self.ref_counts = RefCounts::new(self.config.data_blocks, self.config.reference_count_blocks);
        if summary.load_ref_counts {
            self.load_ref_counts(store)?;
        }
        self.status = if self.journal.length() == 0 {
            SlabRebuildStatus::Rebuilt
        } else if self.journal.requires_scrubbing() {
            SlabRebuildStatus::RequiresHighPriorityScrubbing
        } else {
            SlabRebuildStatus::RequiresScrubbing
        };
        self.admin = SlabAdminState::New;
        Ok(())
    }

    fn load_ref_counts(&mut self, store: &dyn MetadataStore) -> Result<()> {
        let mut raw = vec![0u8; VDO_BLOCK_SIZE];
        for index in 0..self.config.reference_count_blocks {
            store.read_block(self.ref_counts_origin + index, &mut raw)?;
            self.ref_counts.unpack_block(index as usize, &raw)?;
        }
        Ok(())
    }

    /// Forget every reference so the counts can be rebuilt from the block
    /// map.
    pub fn reset_for_rebuild(&mut self) {
        self.ref_counts.reset();
        self.journal.reap();
        self.status = SlabRebuildStatus::Rebuilding;
        self.admin = SlabAdminState::New;
    }

    pub fn finish_rebuild(&mut self) { self.status = SlabRebuildStatus::Rebuilt; }

    /// Rebuild the counts from the saved ones plus the journal, then save
    /// them so the journal can be reaped.
    pub fn scrub(&mut self, store: &dyn MetadataStore) -> Result<usize> {
        self.admin = SlabAdminState::Scrubbing;
        self.status = SlabRebuildStatus::Replaying;
        let mut ref_counts = RefCounts::new(self.config.data_blocks, self.config.reference_count_blocks);
        std::mem::swap(&mut self.ref_counts, &mut ref_counts);
        if self.summary.load_ref_counts {
            self.load_ref_counts(store)?;
        }
        self.journal.commit_tail(store)?;
        let applied = self.journal.replay_into(&mut self.ref_counts, store)?;
        self.flush(store)?;
        self.status = SlabRebuildStatus::Rebuilt;
        self.admin = SlabAdminState::Rebuilt;
        self.update_summary();
        Ok(applied)
    }
}
