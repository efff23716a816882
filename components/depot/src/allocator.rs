//! One physical zone's share of the depot: its slabs, the priority table
//! they are allocated from, and the scrubber that readies unrecovered ones.

use std::sync::Arc;

use dedupe_common::{ilog2, BlockCount, PhysicalBlockNumber, SequenceNumber, SlabCount, VDO_BLOCK_SIZE};
use dedupe_types::journal::{JournalOperation, JournalPoint};
use serde::Serialize;
use snafu::ensure;
use tracing::{debug, info};

use crate::{
    config::{SlabConfig, SLAB_SUMMARY_ENTRY_BYTES},
    err::{BadStateSnafu, NoSpaceSnafu, OutOfRangeSnafu, Result},
    priority_table::PriorityTable,
    read_only::ReadOnlyNotifier,
    scrubber::{ScrubberStats, SlabScrubber},
    slab::{Slab, SlabRebuildStatus, SlabSummaryEntry},
    slab_journal::SlabJournalStats,
    store::MetadataStore,
};

/// How the depot's saved state is being brought back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadType {
    /// After a clean shutdown.
    Normal,
    /// After a crash, with the recovery journal to replay.
    Recovery,
    /// Discard every count and rebuild them from the block map.
    Rebuild,
}

/// What a drain leaves behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainKind {
    /// Commit journals only. Counts are restored by scrubbing.
    Suspend,
    /// Commit journals and save every count.
    Save,
}

/// Steps of a drain, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStep {
    Start,
    Scrubber,
    Slabs,
    Summary,
    Finished,
}

impl DrainStep {
    fn next(self) -> Self {
        match self {
            DrainStep::Start => DrainStep::Scrubber,
            DrainStep::Scrubber => DrainStep::Slabs,
            DrainStep::Slabs => DrainStep::Summary,
            DrainStep::Summary | DrainStep::Finished => DrainStep::Finished,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorState {
    Loading,
    NormalOperation,
    Draining(DrainKind, DrainStep),
    Quiescent(DrainKind),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AllocatorStats {
    pub slab_count:       u64,
    /// Slabs opened for the first time.
    pub slabs_opened:     u64,
    /// Slabs opened again after being written before.
    pub slabs_reopened:   u64,
    pub allocated_blocks: BlockCount,
    pub unrecovered:      u64,
    pub scrubber:         ScrubberStats,
    pub slab_journal:     SlabJournalStats,
}

pub struct BlockAllocator {
    zone:              usize,
    zone_count:        usize,
    slab_config:       SlabConfig,
    slabs:             Vec<Slab>,
    table:             PriorityTable,
    open_slab:         Option<usize>,
    unopened_priority: u32,
    scrubber:          SlabScrubber,
    summary_origin:    PhysicalBlockNumber,
    store:             Arc<dyn MetadataStore>,
    read_only:         Arc<ReadOnlyNotifier>,
    state:             AllocatorState,
    allocated_blocks:  BlockCount,
    slabs_opened:      u64,
    slabs_reopened:    u64,
}

impl BlockAllocator {
    pub fn new(
        zone: usize,
        zone_count: usize,
        slab_config: SlabConfig,
        slabs: Vec<Slab>,
        summary_origin: PhysicalBlockNumber,
        store: Arc<dyn MetadataStore>,
        read_only: Arc<ReadOnlyNotifier>,
    ) -> Result<Self> {
        let data_blocks = slab_config.data_blocks.max(1);
        Ok(Self {
            zone,
            zone_count,
            slab_config,
            slabs,
            table: PriorityTable::new(2 + ilog2(data_blocks))?,
            open_slab: None,
            unopened_priority: 1 + ilog2((data_blocks * 3 / 4).max(1)),
            scrubber: SlabScrubber::default(),
            summary_origin,
            store,
            read_only,
            state: AllocatorState::Loading,
            allocated_blocks: 0,
            slabs_opened: 0,
            slabs_reopened: 0,
        })
    }

    pub fn zone(&self) -> usize { self.zone }

    pub fn state(&self) -> AllocatorState { self.state }

    pub fn slab_count(&self) -> usize { self.slabs.len() }

    pub fn allocated_blocks(&self) -> BlockCount { self.allocated_blocks }

    fn index_of(&self, slab_number: SlabCount) -> Option<usize> {
        let number = (slab_number as usize).checked_sub(self.zone)?;
        (number % self.zone_count == 0).then_some(number / self.zone_count)
    }

    pub fn slab(&self, slab_number: SlabCount) -> Option<&Slab> { self.slabs.get(self.index_of(slab_number)?) }

    /// The local index of the slab holding `pbn`. Slabs are numbered in
    /// address order and striped over the zones.
    fn slab_at(&self, pbn: PhysicalBlockNumber) -> Result<usize> {
        let index = self.slabs.first().and_then(|first| {
            let offset = pbn.checked_sub(first.start)? / self.slab_config.slab_blocks;
            let index = (offset as usize % self.zone_count == 0).then_some(offset as usize / self.zone_count)?;
            self.slabs.get(index).filter(|s| pbn < s.end).map(|_| index)
        });
        index.ok_or_else(|| {
            OutOfRangeSnafu {
                pbn,
                what: format!("zone {}", self.zone),
            }
            .build()
        })
    }

    /// Full slabs rank lowest. Never-opened slabs sit at a reserved
    /// priority so that slabs already written to are reused first unless
    /// they are nearly full.
    fn calculate_priority(&self, slab: &Slab) -> u32 {
        let free_blocks = slab.free_blocks();
        if free_blocks == 0 {
            return 0;
        }
        if slab.is_blank() {
            return self.unopened_priority;
        }
        let priority = 1 + ilog2(free_blocks);
        if priority < self.unopened_priority {
            priority
        } else {
            priority + 1
        }
    }

    fn prioritize(&mut self, index: usize) {
        let priority = self.calculate_priority(&self.slabs[index]);
        self.slabs[index].priority = priority;
        self.table.enqueue(priority, index);
    }

    /// Make a rebuilt slab available for allocation, or send an unrecovered
    /// one to the scrubber.
    fn queue_slab(&mut self, index: usize) {
        let slab = &mut self.slabs[index];
        if slab.is_unrecovered() {
            let high = slab.status == SlabRebuildStatus::RequiresHighPriorityScrubbing;
            self.scrubber.register(index, high);
            return;
        }
        slab.open();
        self.allocated_blocks -= slab.free_blocks();
        if !slab.is_blank() {
            self.slabs_opened += 1;
        }
        self.prioritize(index);
    }

    /// Account for a change in `index`'s free blocks, moving it in the
    /// table if its bucket changed.
    pub fn adjust_free_block_count(&mut self, index: usize, increment: bool) {
        if increment {
            self.allocated_blocks -= 1;
        } else {
            self.allocated_blocks += 1;
        }
        if self.open_slab == Some(index) || self.slabs[index].is_unrecovered() {
            return;
        }
        let priority = self.calculate_priority(&self.slabs[index]);
        if priority == self.slabs[index].priority {
            return;
        }
        self.table.remove(self.slabs[index].priority, index);
        self.prioritize(index);
    }

    /// Treat every slab as in use, then queue each one.
    pub fn prepare_to_allocate(&mut self) {
        self.allocated_blocks = self.slabs.len() as u64 * self.slab_config.data_blocks;
        self.table.clear();
        self.scrubber.clear();
        self.open_slab = None;
        for index in 0..self.slabs.len() {
            if self.slabs[index].status == SlabRebuildStatus::Rebuilding {
                self.slabs[index].finish_rebuild();
            }
            self.queue_slab(index);
        }
        self.state = AllocatorState::NormalOperation;
        debug!(
            "zone {} ready: {} allocated blocks, {} slabs to scrub",
            self.zone,
            self.allocated_blocks,
            self.scrubber.slab_count()
        );
    }

    fn open(&mut self, index: usize) {
        if self.slabs[index].is_blank() {
            self.slabs_opened += 1;
        } else {
            self.slabs_reopened += 1;
        }
        self.open_slab = Some(index);
    }

    fn check_operating(&self) -> Result<()> {
        self.read_only.check()?;
        ensure!(
            self.state == AllocatorState::NormalOperation,
            BadStateSnafu {
                reason: format!("zone {} is {:?}", self.zone, self.state),
            }
        );
        Ok(())
    }

    /// Allocate a free block, holding it with a provisional reference.
    /// When every clean slab is full, unrecovered slabs are scrubbed one at
    /// a time until one has room.
    pub fn allocate_block(&mut self) -> Result<PhysicalBlockNumber> {
        self.check_operating()?;
        loop {
            if let Some(index) = self.open_slab {
                if let Some(pbn) = self.slabs[index].allocate() {
                    self.adjust_free_block_count(index, false);
                    return Ok(pbn);
                }
                self.open_slab = None;
                self.prioritize(index);
            }

            if let Some(index) = self.table.dequeue() {
                self.open(index);
                if let Some(pbn) = self.slabs[index].allocate() {
                    self.adjust_free_block_count(index, false);
                    return Ok(pbn);
                }
            }

            if self.scrub_next(false)?.is_none() {
                return NoSpaceSnafu { zone: self.zone }.fail();
            }
        }
    }

    /// Change a block's reference count, journaling it first.
    pub fn modify_reference_count(
        &mut self,
        pbn: PhysicalBlockNumber,
        operation: JournalOperation,
        recovery_point: JournalPoint,
    ) -> Result<()> {
        self.check_operating()?;
        let index = self.slab_at(pbn)?;
        let tail = self.slabs[index].journal().tail();
        let change = match self.slabs[index].modify(pbn, operation, recovery_point, &*self.store) {
            Ok(change) => change,
            Err(err) if err.is_out_of_range() => return Err(err),
            Err(err) => return Err(self.read_only.enter(err)),
        };
        self.note_commit(index, tail)?;

        let slab = &self.slabs[index];
        if slab.is_unrecovered() && slab.journal().requires_scrubbing() && self.scrubber.escalate(index) {
            // the journal cannot grow further until the slab is scrubbed
            while self.slabs[index].is_unrecovered() && self.scrub_next(true)?.is_some() {}
        }
        if change.free_status_changed {
            self.adjust_free_block_count(index, !operation.is_increment());
        }
        Ok(())
    }

    /// Drop an allocated block that was never used.
    pub fn release_block_reference(&mut self, pbn: PhysicalBlockNumber) -> Result<()> {
        self.check_operating()?;
        let index = self.slab_at(pbn)?;
        if self.slabs[index].release_provisional(pbn)? {
            self.adjust_free_block_count(index, true);
        }
        Ok(())
    }

    pub fn increment_limit(&self, pbn: PhysicalBlockNumber) -> Result<u8> {
        let slab = &self.slabs[self.slab_at(pbn)?];
        Ok(slab.ref_counts().increment_limit(slab.sbn_from_pbn(pbn)?))
    }

    /// Journal a recovery journal entry into the slab holding `pbn`.
    pub fn replay_recovery_entry(
        &mut self,
        pbn: PhysicalBlockNumber,
        operation: JournalOperation,
        recovery_point: JournalPoint,
    ) -> Result<bool> {
        self.read_only.check()?;
        let index = self.slab_at(pbn)?;
        let tail = self.slabs[index].journal().tail();
        let added = self.slabs[index]
            .replay_recovery_entry(pbn, operation, recovery_point, &*self.store)
            .map_err(|err| self.read_only.enter(err))?;
        self.note_commit(index, tail)?;
        Ok(added)
    }

    /// Rewrite the summary once slab `index`'s journal has moved past
    /// `tail`, so a crash never finds a summary older than the journal.
    fn note_commit(&mut self, index: usize, tail: SequenceNumber) -> Result<()> {
        if self.slabs[index].journal().tail() != tail {
            self.write_summary().map_err(|err| self.read_only.enter(err))?;
        }
        Ok(())
    }

    /// Count a reference found in the block map while rebuilding.
    pub fn rebuild_reference(&mut self, pbn: PhysicalBlockNumber, operation: JournalOperation) -> Result<()> {
        self.read_only.check()?;
        let index = self.slab_at(pbn)?;
        self.slabs[index]
            .rebuild_reference(pbn, operation)
            .map_err(|err| self.read_only.enter(err))
    }

    /// Scrub the next waiting slab and make it available. Returns the slab
    /// number scrubbed, if any.
    fn scrub_next(&mut self, high_priority_only: bool) -> Result<Option<SlabCount>> {
        let Some((index, high)) = self.scrubber.next(high_priority_only) else {
            return Ok(None);
        };
        let entries = match self.slabs[index].scrub(&*self.store) {
            Ok(entries) => entries,
            Err(err) => return Err(self.read_only.enter(err)),
        };
        self.scrubber.record(high, entries);
        // counted as fully allocated until now
        self.slabs[index].open();
        self.allocated_blocks -= self.slabs[index].free_blocks();
        self.prioritize(index);
        self.write_summary().map_err(|err| self.read_only.enter(err))?;
        debug!(
            "scrubbed slab {} ({entries} entries replayed)",
            self.slabs[index].number
        );
        Ok(Some(self.slabs[index].number))
    }

    /// Scrub every waiting slab, high priority ones first.
    pub fn scrub_slabs(&mut self) -> Result<usize> {
        self.read_only.check()?;
        let mut scrubbed = 0;
        while self.scrub_next(false)?.is_some() {
            scrubbed += 1;
        }
        if scrubbed > 0 {
            info!("zone {} scrubbed {scrubbed} slabs", self.zone);
        }
        Ok(scrubbed)
    }

    /// Read the summary and every slab's saved state.
    pub fn load(&mut self, load_type: LoadType) -> Result<()> {
        let summary = self.read_summary()?;
        for (slab, entry) in self.slabs.iter_mut().zip(summary) {
            match load_type {
                LoadType::Rebuild => {
                    slab.load(entry, &*self.store)?;
                    slab.reset_for_rebuild();
                }
                LoadType::Normal | LoadType::Recovery => slab.load(entry, &*self.store)?,
            }
        }
        self.state = AllocatorState::Loading;
        Ok(())
    }

    fn summary_blocks(&self) -> usize { (self.slabs.len() * SLAB_SUMMARY_ENTRY_BYTES).div_ceil(VDO_BLOCK_SIZE) }

    fn read_summary(&self) -> Result<Vec<SlabSummaryEntry>> {
        let mut raw = vec![0u8; self.summary_blocks() * VDO_BLOCK_SIZE];
        for (i, block) in raw.chunks_mut(VDO_BLOCK_SIZE).enumerate() {
            self.store.read_block(self.summary_origin + i as u64, block)?;
        }
        Ok(raw
            .chunks(SLAB_SUMMARY_ENTRY_BYTES)
            .take(self.slabs.len())
            .map(SlabSummaryEntry::decode)
            .collect())
    }

    fn write_summary(&mut self) -> Result<()> {
        let mut raw = vec![0u8; self.summary_blocks() * VDO_BLOCK_SIZE];
        for (slab, chunk) in self.slabs.iter_mut().zip(raw.chunks_mut(SLAB_SUMMARY_ENTRY_BYTES)) {
            slab.update_summary();
            chunk.copy_from_slice(&slab.summary().encode());
        }
        for (i, block) in raw.chunks(VDO_BLOCK_SIZE).enumerate() {
            self.store.write_block(self.summary_origin + i as u64, block)?;
        }
        Ok(())
    }

    /// Take one drain step. Returns the step that comes next.
    pub fn advance_drain(&mut self, kind: DrainKind) -> Result<DrainStep> {
        let step = match self.state {
            AllocatorState::NormalOperation | AllocatorState::Loading => DrainStep::Start,
            AllocatorState::Draining(current, step) if current == kind => step,
            AllocatorState::Quiescent(current) if current == kind => return Ok(DrainStep::Finished),
            state => {
                return BadStateSnafu {
                    reason: format!("cannot {kind:?} zone {} while {state:?}", self.zone),
                }
                .fail();
            }
        };

        match step {
            DrainStep::Start => {}
            DrainStep::Scrubber => self.scrubber.stop(),
            DrainStep::Slabs => {
                if !self.read_only.is_read_only() {
                    for slab in &mut self.slabs {
                        slab.commit_journal(&*self.store)?;
                        if kind == DrainKind::Save && !slab.is_unrecovered() {
                            slab.flush(&*self.store)?;
                        }
                    }
                }
            }
            DrainStep::Summary => {
                if !self.read_only.is_read_only() {
                    self.write_summary()?;
                }
            }
            DrainStep::Finished => {}
        }

        let next = step.next();
        self.state = if step == DrainStep::Finished {
            AllocatorState::Quiescent(kind)
        } else {
            AllocatorState::Draining(kind, next)
        };
        Ok(next)
    }

    /// Run every drain step.
    pub fn drain(&mut self, kind: DrainKind) -> Result<()> {
        while self.advance_drain(kind)? != DrainStep::Finished {}
        self.advance_drain(kind)?;
        debug!("zone {} drained for {kind:?}", self.zone);
        Ok(())
    }

    /// Leave a quiescent state and continue serving.
    pub fn resume(&mut self) -> Result<()> {
        match self.state {
            AllocatorState::Quiescent(_) => {
                self.scrubber.resume();
                self.state = AllocatorState::NormalOperation;
                Ok(())
            }
            AllocatorState::NormalOperation => Ok(()),
            state => BadStateSnafu {
                reason: format!("cannot resume zone {} while {state:?}", self.zone),
            }
            .fail(),
        }
    }

    /// Take ownership of slabs added by growing the depot.
    pub fn add_slabs(&mut self, slabs: Vec<Slab>, summary_origin: PhysicalBlockNumber) {
        self.summary_origin = summary_origin;
        for slab in slabs {
            self.slabs.push(slab);
            self.allocated_blocks += self.slab_config.data_blocks;
            self.queue_slab(self.slabs.len() - 1);
        }
    }

    pub fn stats(&self) -> AllocatorStats {
        let mut journal = SlabJournalStats::default();
        for slab in &self.slabs {
            let s = slab.journal().stats();
            journal.disk_full_count += s.disk_full_count;
            journal.flush_count += s.flush_count;
            journal.blocked_count += s.blocked_count;
            journal.blocks_written += s.blocks_written;
        }
        AllocatorStats {
            slab_count:       self.slabs.len() as u64,
            slabs_opened:     self.slabs_opened,
            slabs_reopened:   self.slabs_reopened,
            allocated_blocks: self.allocated_blocks,
            unrecovered:      self.slabs.iter().filter(|s| s.is_unrecovered()).count() as u64,
            scrubber:         self.scrubber.stats(),
            slab_journal:     journal,
        }
    }
}

impl std::fmt::Debug for BlockAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockAllocator")
            .field("zone", &self.zone)
            .field("slabs", &self.slabs.len())
            .field("state", &self.state)
            .field("allocated_blocks", &self.allocated_blocks)
            .finish()
    }
}
