use bytes::{Buf, BufMut};
use dedupe_common::{BlockCount, SlabBlockNumber, VDO_BLOCK_SIZE};
use dedupe_types::journal::{JournalOperation, JournalPoint};
use snafu::ensure;
use tracing::warn;

use crate::{
    config::{COUNTS_PER_BLOCK, COUNTS_PER_SECTOR, SECTORS_PER_BLOCK, SECTOR_BYTES},
    err::{CorruptComponentSnafu, RefCountInvalidSnafu, Result},
};

pub const EMPTY_REFERENCE_COUNT: u8 = 0;
pub const MAXIMUM_REFERENCE_COUNT: u8 = 254;
pub const PROVISIONAL_REFERENCE_COUNT: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceStatus {
    Free,
    Single,
    Shared,
    Provisional,
}

impl ReferenceStatus {
    fn of(count: u8) -> Self {
        match count {
            EMPTY_REFERENCE_COUNT => ReferenceStatus::Free,
            1 => ReferenceStatus::Single,
            PROVISIONAL_REFERENCE_COUNT => ReferenceStatus::Provisional,
            _ => ReferenceStatus::Shared,
        }
    }
}

/// What applying a change did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountChange {
    /// The block went from free to in use or back.
    pub free_status_changed:   bool,
    /// A provisional reference was dropped; nothing needs saving.
    pub provisional_decrement: bool,
}

#[derive(Debug, Clone)]
struct ReferenceBlock {
    commit_points: [JournalPoint; SECTORS_PER_BLOCK],
    dirty:         bool,
}

/// The reference count of every data block in one slab, stored one byte
/// per block in `COUNTS_PER_BLOCK` sized on-disk blocks.
#[derive(Debug, Clone)]
pub struct RefCounts {
    counters:           Vec<u8>,
    blocks:             Vec<ReferenceBlock>,
    free_blocks:        BlockCount,
    search_cursor:      usize,
    /// The latest slab journal point applied to any count.
    slab_journal_point: JournalPoint,
}

impl RefCounts {
    pub fn new(data_blocks: BlockCount, reference_blocks: BlockCount) -> Self {
        Self {
            counters:           vec![EMPTY_REFERENCE_COUNT; data_blocks as usize],
            blocks:             vec![
                ReferenceBlock {
                    commit_points: [JournalPoint::default(); SECTORS_PER_BLOCK],
                    dirty:         false,
                };
                reference_blocks as usize
            ],
            free_blocks:        data_blocks,
            search_cursor:      0,
            slab_journal_point: JournalPoint::default(),
        }
    }

    pub fn free_blocks(&self) -> BlockCount { self.free_blocks }

    pub fn data_blocks(&self) -> BlockCount { self.counters.len() as u64 }

    pub fn slab_journal_point(&self) -> JournalPoint { self.slab_journal_point }

    pub fn count(&self, sbn: SlabBlockNumber) -> u8 { self.counters[sbn as usize] }

    pub fn status(&self, sbn: SlabBlockNumber) -> ReferenceStatus { ReferenceStatus::of(self.count(sbn)) }

    /// How many more increments `sbn` can take.
    pub fn increment_limit(&self, sbn: SlabBlockNumber) -> u8 {
        match self.count(sbn) {
            EMPTY_REFERENCE_COUNT | PROVISIONAL_REFERENCE_COUNT => MAXIMUM_REFERENCE_COUNT,
            count => MAXIMUM_REFERENCE_COUNT - count,
        }
    }

    pub fn is_dirty(&self) -> bool { self.blocks.iter().any(|b| b.dirty) }

    /// Find a free block at or after the cursor, wrapping once, and hold
    /// it with a provisional reference.
    pub fn allocate_unreferenced(&mut self) -> Option<SlabBlockNumber> {
        let len = self.counters.len();
        if self.free_blocks == 0 || len == 0 {
            return None;
        }
        let start = self.search_cursor % len;
        let index = (start..len)
            .chain(0..start)
            .find(|i| self.counters[*i] == EMPTY_REFERENCE_COUNT)?;
        self.make_provisional(index);
        self.search_cursor = index + 1;
        Some(index as SlabBlockNumber)
    }

    /// Hold `sbn` provisionally if nothing references it.
    pub fn provisionally_reference(&mut self, sbn: SlabBlockNumber) {
        if self.counters[sbn as usize] == EMPTY_REFERENCE_COUNT {
            self.make_provisional(sbn as usize);
        }
    }

    fn make_provisional(&mut self, index: usize) {
        self.counters[index] = PROVISIONAL_REFERENCE_COUNT;
        self.free_blocks -= 1;
    }

    /// Apply a change made in normal operation. `point` is the slab journal
    /// entry that recorded it.
    pub fn adjust(
        &mut self,
        sbn: SlabBlockNumber,
        operation: JournalOperation,
        point: Option<JournalPoint>,
    ) -> Result<CountChange> {
        let change = self.update(sbn, operation, point, true)?;
        if !change.provisional_decrement {
            self.dirty(sbn);
        }
        Ok(change)
    }

    /// Apply a change found while rebuilding counts from the block map.
    pub fn adjust_for_rebuild(&mut self, sbn: SlabBlockNumber, operation: JournalOperation) -> Result<()> {
        self.update(sbn, operation, None, false)?;
        self.dirty(sbn);
        Ok(())
    }

    /// Apply a slab journal entry unless the counts already include it.
    /// Returns whether it was applied.
    pub fn replay(&mut self, sbn: SlabBlockNumber, operation: JournalOperation, point: JournalPoint) -> Result<bool> {
        let (block, sector) = Self::locate(sbn);
        if !self.blocks[block].commit_points[sector].before(&point) {
            return Ok(false);
        }
        self.update(sbn, operation, Some(point), false)?;
        self.blocks[block].dirty = true;
        Ok(true)
    }

    fn locate(sbn: SlabBlockNumber) -> (usize, usize) {
        let sbn = sbn as usize;
        (sbn / COUNTS_PER_BLOCK, (sbn % COUNTS_PER_BLOCK) / COUNTS_PER_SECTOR)
    }

    fn dirty(&mut self, sbn: SlabBlockNumber) { self.blocks[Self::locate(sbn).0].dirty = true; }

    fn update(
        &mut self,
        sbn: SlabBlockNumber,
        operation: JournalOperation,
        point: Option<JournalPoint>,
        normal_operation: bool,
    ) -> Result<CountChange> {
        let change = match operation {
            JournalOperation::DataIncrement => self.increment_for_data(sbn)?,
            JournalOperation::DataDecrement | JournalOperation::BlockMapDecrement => self.decrement(sbn)?,
            JournalOperation::BlockMapIncrement => self.increment_for_block_map(sbn, normal_operation)?,
        };
        if let Some(point) = point.filter(JournalPoint::is_valid) {
            self.slab_journal_point = point;
        }
        Ok(change)
    }

    fn increment_for_data(&mut self, sbn: SlabBlockNumber) -> Result<CountChange> {
        let count = &mut self.counters[sbn as usize];
        let mut change = CountChange::default();
        match ReferenceStatus::of(*count) {
            ReferenceStatus::Free => {
                *count = 1;
                self.free_blocks -= 1;
                change.free_status_changed = true;
            }
            ReferenceStatus::Provisional => *count = 1,
            _ => {
                ensure!(
                    *count < MAXIMUM_REFERENCE_COUNT,
                    RefCountInvalidSnafu {
                        reason: format!("incrementing a block already at the maximum ({sbn})"),
                    }
                );
                *count += 1;
            }
        }
        Ok(change)
    }

    fn decrement(&mut self, sbn: SlabBlockNumber) -> Result<CountChange> {
        let count = &mut self.counters[sbn as usize];
        let mut change = CountChange::default();
        match ReferenceStatus::of(*count) {
            ReferenceStatus::Free => {
                return RefCountInvalidSnafu {
                    reason: format!("decrementing free block {sbn}"),
                }
                .fail();
            }
            status @ (ReferenceStatus::Provisional | ReferenceStatus::Single) => {
                change.provisional_decrement = status == ReferenceStatus::Provisional;
                *count = EMPTY_REFERENCE_COUNT;
                self.free_blocks += 1;
                change.free_status_changed = true;
            }
            ReferenceStatus::Shared => *count -= 1,
        }
        Ok(change)
    }

    /// Block map pages are never shared: their count jumps straight to the
    /// maximum.
    fn increment_for_block_map(&mut self, sbn: SlabBlockNumber, normal_operation: bool) -> Result<CountChange> {
        let count = &mut self.counters[sbn as usize];
        let mut change = CountChange::default();
        match ReferenceStatus::of(*count) {
            ReferenceStatus::Free if !normal_operation => {
                *count = MAXIMUM_REFERENCE_COUNT;
                self.free_blocks -= 1;
                change.free_status_changed = true;
            }
            ReferenceStatus::Provisional if normal_operation => *count = MAXIMUM_REFERENCE_COUNT,
            status => {
                return RefCountInvalidSnafu {
                    reason: format!("block map increment of {status:?} block {sbn}"),
                }
                .fail();
            }
        }
        Ok(change)
    }

    /// Indexes of reference blocks changed since they were last saved.
    pub fn dirty_blocks(&self) -> Vec<usize> {
        self.blocks
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.dirty.then_some(i))
            .collect()
    }

    /// Pack reference block `index` for writing and mark it clean. Every
    /// sector records the latest journal point applied.
    pub fn pack_block(&mut self, index: usize) -> Vec<u8> {
        let point = self.slab_journal_point;
        let block = &mut self.blocks[index];
        block.commit_points = [point; SECTORS_PER_BLOCK];
        block.dirty = false;

        let first = index * COUNTS_PER_BLOCK;
        let mut buf = Vec::with_capacity(VDO_BLOCK_SIZE);
        for sector in 0..SECTORS_PER_BLOCK {
            buf.put_u64_le(point.pack());
            let start = (first + sector * COUNTS_PER_SECTOR).min(self.counters.len());
            let end = (start + COUNTS_PER_SECTOR).min(self.counters.len());
            let counts = &self.counters[start..end];
            // provisional references do not survive a restart
            buf.extend(counts.iter().map(|c| match *c {
                PROVISIONAL_REFERENCE_COUNT => EMPTY_REFERENCE_COUNT,
                c => c,
            }));
            buf.put_bytes(EMPTY_REFERENCE_COUNT, COUNTS_PER_SECTOR - counts.len());
        }
        buf
    }

    /// Load reference block `index` from `raw`, dropping provisional
    /// references.
    pub fn unpack_block(&mut self, index: usize, raw: &[u8]) -> Result<()> {
        ensure!(
            raw.len() == VDO_BLOCK_SIZE && index < self.blocks.len(),
            CorruptComponentSnafu {
                component: "reference block",
                reason: format!("block {index} of {} bytes", raw.len()),
            }
        );
        let first = index * COUNTS_PER_BLOCK;
        let mut torn = None;
        for (sector, mut bytes) in raw.chunks(SECTOR_BYTES).enumerate() {
            let point = JournalPoint::unpack(bytes.get_u64_le());
            self.blocks[index].commit_points[sector] = point;
            if self.slab_journal_point.before(&point) {
                self.slab_journal_point = point;
            }
            if sector > 0 && point != self.blocks[index].commit_points[0] {
                torn.get_or_insert(sector);
            }

            let start = (first + sector * COUNTS_PER_SECTOR).min(self.counters.len());
            let end = (start + COUNTS_PER_SECTOR).min(self.counters.len());
            for (slot, count) in self.counters[start..end].iter_mut().zip(bytes) {
                let count = match *count {
                    PROVISIONAL_REFERENCE_COUNT => EMPTY_REFERENCE_COUNT,
                    c => c,
                };
                if *slot == EMPTY_REFERENCE_COUNT && count != EMPTY_REFERENCE_COUNT {
                    self.free_blocks -= 1;
                } else if *slot != EMPTY_REFERENCE_COUNT && count == EMPTY_REFERENCE_COUNT {
                    self.free_blocks += 1;
                }
                *slot = count;
            }
        }
        if let Some(sector) = torn {
            warn!("torn write detected in sector {sector} of reference block {index}");
        }
        self.blocks[index].dirty = false;
        Ok(())
    }

    /// Forget every count, as if the slab were new.
    pub fn reset(&mut self) {
        self.counters.fill(EMPTY_REFERENCE_COUNT);
        for block in &mut self.blocks {
            block.commit_points = [JournalPoint::default(); SECTORS_PER_BLOCK];
            block.dirty = true;
        }
        self.free_blocks = self.counters.len() as u64;
        self.search_cursor = 0;
        self.slab_journal_point = JournalPoint::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use JournalOperation::*;

    fn point(seq: u64, entry: u16) -> Option<JournalPoint> { Some(JournalPoint::new(seq, entry)) }

    #[test]
    fn data_reference_lifecycle() {
        let mut counts = RefCounts::new(10, 1);
        let change = counts.adjust(3, DataIncrement, point(1, 0)).unwrap();
        assert!(change.free_status_changed);
        assert_eq!(counts.free_blocks(), 9);
        assert_eq!(counts.status(3), ReferenceStatus::Single);

        assert!(!counts.adjust(3, DataIncrement, point(1, 1)).unwrap().free_status_changed);
        assert_eq!(counts.status(3), ReferenceStatus::Shared);
        assert_eq!(counts.increment_limit(3), MAXIMUM_REFERENCE_COUNT - 2);

        counts.adjust(3, DataDecrement, point(1, 2)).unwrap();
        let change = counts.adjust(3, DataDecrement, point(1, 3)).unwrap();
        assert!(change.free_status_changed);
        assert_eq!(counts.free_blocks(), 10);
        assert!(counts.adjust(3, DataDecrement, point(1, 4)).unwrap_err().is_ref_count_invalid());
        assert_eq!(counts.slab_journal_point(), JournalPoint::new(1, 3));
    }

    #[test]
    fn counts_stop_at_the_maximum() {
        let mut counts = RefCounts::new(4, 1);
        for _ in 0..MAXIMUM_REFERENCE_COUNT {
            counts.adjust(0, DataIncrement, None).unwrap();
        }
        assert_eq!(counts.increment_limit(0), 0);
        assert!(counts.adjust(0, DataIncrement, None).unwrap_err().is_ref_count_invalid());
    }

    #[test]
    fn provisional_references() {
        let mut counts = RefCounts::new(3, 1);
        assert_eq!(counts.allocate_unreferenced(), Some(0));
        assert_eq!(counts.status(0), ReferenceStatus::Provisional);
        assert_eq!(counts.free_blocks(), 2);

        // confirming a provisional reference does not change free space
        assert!(!counts.adjust(0, DataIncrement, None).unwrap().free_status_changed);
        assert_eq!(counts.free_blocks(), 2);

        assert_eq!(counts.allocate_unreferenced(), Some(1));
        let change = counts.adjust(1, DataDecrement, None).unwrap();
        assert!(change.provisional_decrement);
        assert_eq!(counts.free_blocks(), 2);

        assert_eq!(counts.allocate_unreferenced(), Some(2));
        // the cursor wraps back to the freed block
        assert_eq!(counts.allocate_unreferenced(), Some(1));
        assert_eq!(counts.allocate_unreferenced(), None);
    }

    #[test]
    fn block_map_increments() {
        let mut counts = RefCounts::new(4, 1);
        assert!(counts.adjust(0, BlockMapIncrement, None).unwrap_err().is_ref_count_invalid());
        counts.adjust_for_rebuild(0, BlockMapIncrement).unwrap();
        assert_eq!(counts.count(0), MAXIMUM_REFERENCE_COUNT);

        counts.provisionally_reference(1);
        counts.adjust(1, BlockMapIncrement, None).unwrap();
        assert_eq!(counts.count(1), MAXIMUM_REFERENCE_COUNT);
        assert_eq!(counts.free_blocks(), 2);

        counts.provisionally_reference(2);
        assert!(counts.adjust_for_rebuild(2, BlockMapIncrement).is_err());
    }

    #[test]
    fn replay_skips_saved_entries() {
        let mut counts = RefCounts::new(600, 1);
        counts.adjust(5, DataIncrement, point(2, 0)).unwrap();
        counts.adjust(550, DataIncrement, point(2, 1)).unwrap();
        let raw = counts.pack_block(0);
        assert!(!counts.is_dirty());

        let mut loaded = RefCounts::new(600, 1);
        loaded.unpack_block(0, &raw).unwrap();
        assert_eq!(loaded.free_blocks(), 598);
        assert_eq!(loaded.slab_journal_point(), JournalPoint::new(2, 1));

        assert!(!loaded.replay(5, DataIncrement, JournalPoint::new(2, 0)).unwrap());
        assert!(!loaded.replay(550, DataIncrement, JournalPoint::new(2, 1)).unwrap());
        assert!(loaded.replay(550, DataIncrement, JournalPoint::new(3, 0)).unwrap());
        assert_eq!(loaded.count(550), 2);
    }

    #[test]
    fn provisional_counts_are_not_saved() {
        let mut counts = RefCounts::new(8, 1);
        counts.allocate_unreferenced();
        counts.adjust(4, DataIncrement, point(1, 0)).unwrap();
        let raw = counts.pack_block(0);

        let mut loaded = RefCounts::new(8, 1);
        loaded.unpack_block(0, &raw).unwrap();
        assert_eq!(loaded.status(0), ReferenceStatus::Free);
        assert_eq!(loaded.status(4), ReferenceStatus::Single);
        assert_eq!(loaded.free_blocks(), 7);
    }
}
