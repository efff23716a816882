//! Replaying the recovery journal into the slab journals after a crash.
//!
//! Every data write journals an increment of its new mapping and a
//! decrement of the one it replaced. A crash can lose the decrement of the
//! newest write to a slot; those are found by walking the journal
//! backwards and are synthesized at journal points past the real tail.

use std::collections::HashMap;

use dedupe_common::{JournalEntryCount, PhysicalBlockNumber, SequenceNumber, BLOCK_MAP_ENTRIES_PER_PAGE, ZERO_BLOCK};
use dedupe_types::journal::{BlockMapSlot, DataLocation, JournalOperation, JournalPoint};
use snafu::ensure;
use tracing::{debug, info};

use crate::{
    depot::SlabDepot,
    err::{BadMappingSnafu, BadStateSnafu, CorruptJournalSnafu, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryJournalEntry {
    pub slot:      BlockMapSlot,
    pub mapping:   DataLocation,
    pub operation: JournalOperation,
}

impl RecoveryJournalEntry {
    pub fn new(slot: BlockMapSlot, mapping: DataLocation, operation: JournalOperation) -> Self {
        Self {
            slot,
            mapping,
            operation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumberedEntry {
    pub point: JournalPoint,
    pub entry: RecoveryJournalEntry,
}

/// The valid entries of a recovery journal, oldest first.
#[derive(Debug, Clone)]
pub struct RecoveryJournal {
    entries_per_block: JournalEntryCount,
    tail:              SequenceNumber,
    next:              JournalPoint,
    entries:           Vec<NumberedEntry>,
}

impl RecoveryJournal {
    pub fn new(entries_per_block: JournalEntryCount) -> Self { Self::starting_at(JournalPoint::new(1, 0), entries_per_block) }

    /// A journal whose first entry will sit at `start`.
    pub fn starting_at(start: JournalPoint, entries_per_block: JournalEntryCount) -> Self {
        Self {
            entries_per_block,
            tail: start.sequence_number,
            next: start,
            entries: Vec::new(),
        }
    }

    /// Append `entry` at the next journal point.
    pub fn push(&mut self, entry: RecoveryJournalEntry) -> JournalPoint {
        let point = self.next;
        self.entries.push(NumberedEntry { point, entry });
        self.tail = point.sequence_number;
        self.next.advance(self.entries_per_block);
        point
    }

    pub fn entries(&self) -> &[NumberedEntry] { &self.entries }

    pub fn tail(&self) -> SequenceNumber { self.tail }

    pub fn entries_per_block(&self) -> JournalEntryCount { self.entries_per_block }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

/// Where the block map currently says a slot points.
pub trait BlockMapLookup: Send + Sync {
    fn lookup(&self, slot: BlockMapSlot) -> Result<DataLocation>;
}

impl BlockMapLookup for HashMap<BlockMapSlot, DataLocation> {
    fn lookup(&self, slot: BlockMapSlot) -> Result<DataLocation> { Ok(self.get(&slot).copied().unwrap_or_default()) }
}

/// A decrement the journal should hold but does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissingDecref {
    pub slot:                BlockMapSlot,
    /// The mapping the lost decrement would have released, when an older
    /// increment of the slot is still in the journal.
    pub penultimate_mapping: Option<DataLocation>,
    pub journal_point:       JournalPoint,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub entries:          usize,
    pub entries_replayed: usize,
    pub missing_decrefs:  usize,
    pub decrefs_applied:  usize,
}

/// Check that `entry` could have been written by a sane device.
pub fn validate_entry(depot: &SlabDepot, entry: &RecoveryJournalEntry) -> Result<()> {
    let RecoveryJournalEntry {
        slot,
        mapping,
        operation,
    } = *entry;
    ensure!(
        slot.pbn < depot.physical_blocks()
            && slot.slot < BLOCK_MAP_ENTRIES_PER_PAGE
            && mapping.is_valid()
            && depot.is_physical_data_block(mapping.pbn),
        CorruptJournalSnafu {
            reason: format!("invalid entry ({}, {}) to {} ({})", slot.pbn, slot.slot, mapping.pbn, operation.name()),
        }
    );
    ensure!(
        !operation.is_block_map() || !(mapping.state.is_compressed() || mapping.pbn == ZERO_BLOCK),
        CorruptJournalSnafu {
            reason: format!("invalid block map entry ({}, {}) to {}", slot.pbn, slot.slot, mapping.pbn),
        }
    );
    Ok(())
}

#[derive(Clone, Copy)]
enum Mark {
    FoundDecref,
    Missing(usize),
}

/// Walk the journal from newest to oldest pairing every increment with a
/// later decrement of its slot. Increments without one get a synthesized
/// decrement.
pub fn find_missing_decrefs(journal: &RecoveryJournal) -> Result<Vec<MissingDecref>> {
    let mut marks: HashMap<BlockMapSlot, Mark> = HashMap::new();
    let mut missing: Vec<MissingDecref> = Vec::new();
    let mut next_point = JournalPoint::new(journal.tail, journal.entries_per_block);

    for NumberedEntry { entry, .. } in journal.entries.iter().rev() {
        if !entry.operation.is_increment() {
            marks.entry(entry.slot).or_insert(Mark::FoundDecref);
            continue;
        }
        let mark = marks.remove(&entry.slot);
        if entry.operation == JournalOperation::BlockMapIncrement {
            ensure!(
                mark.is_none(),
                CorruptJournalSnafu {
                    reason: format!("block map page ({}, {}) was decremented", entry.slot.pbn, entry.slot.slot),
                }
            );
            continue;
        }
        match mark {
            Some(Mark::FoundDecref) => {}
            None => {
                marks.insert(entry.slot, Mark::Missing(missing.len()));
                missing.push(MissingDecref {
                    slot:                entry.slot,
                    penultimate_mapping: None,
                    journal_point:       next_point,
                });
                next_point.entry_count += 1;
            }
            Some(Mark::Missing(index)) => missing[index].penultimate_mapping = Some(entry.mapping),
        }
    }
    Ok(missing)
}

/// Replay `journal` into a depot loaded with
/// [`LoadType::Recovery`](crate::allocator::LoadType::Recovery), then
/// ready it to allocate. Slabs that took entries are left for the
/// scrubber.
pub fn recover(depot: &SlabDepot, journal: &RecoveryJournal, block_map: &dyn BlockMapLookup) -> Result<RecoveryStats> {
    let notifier = depot.read_only_notifier();
    notifier.check()?;
    for NumberedEntry { entry, .. } in &journal.entries {
        validate_entry(depot, entry).map_err(|err| notifier.enter(err))?;
    }

    let missing = find_missing_decrefs(journal).map_err(|err| notifier.enter(err))?;
    let mut decrefs = Vec::with_capacity(missing.len());
    for decref in &missing {
        let mapping = match decref.penultimate_mapping {
            Some(mapping) => mapping,
            None => resolve(depot, block_map, decref.slot).map_err(|err| notifier.enter(err))?,
        };
        if mapping.pbn != ZERO_BLOCK {
            decrefs.push((mapping.pbn, decref.journal_point));
        }
    }
    debug!("{} missing decrefs, {} to apply", missing.len(), decrefs.len());

    let replayed = replay_by_zone(depot, journal, &decrefs)?;
    depot.prepare_to_allocate();

    let stats = RecoveryStats {
        entries:          journal.len(),
        entries_replayed: replayed,
        missing_decrefs:  missing.len(),
        decrefs_applied:  decrefs.len(),
    };
    info!("replayed recovery journal: {stats:?}");
    Ok(stats)
}

fn resolve(depot: &SlabDepot, block_map: &dyn BlockMapLookup, slot: BlockMapSlot) -> Result<DataLocation> {
    let mapping = block_map.lookup(slot)?;
    ensure!(
        mapping.is_valid() && depot.is_physical_data_block(mapping.pbn),
        BadMappingSnafu {
            pbn:    mapping.pbn,
            reason: format!("block map slot ({}, {})", slot.pbn, slot.slot),
        }
    );
    Ok(mapping)
}

/// Each zone replays, in journal order, the entries for its own blocks
/// followed by its synthesized decrements.
fn replay_by_zone(
    depot: &SlabDepot,
    journal: &RecoveryJournal,
    decrefs: &[(PhysicalBlockNumber, JournalPoint)],
) -> Result<usize> {
    let replay_zone = |zone: usize| -> Result<usize> {
        let mut replayed = 0;
        let changes = journal
            .entries
            .iter()
            .map(|e| (e.entry.mapping.pbn, e.entry.operation, e.point))
            .chain(decrefs.iter().map(|&(pbn, point)| (pbn, JournalOperation::DataDecrement, point)));
        for (pbn, operation, point) in changes {
            if pbn == ZERO_BLOCK || depot.get_zone(pbn)? != zone {
                continue;
            }
            if depot.replay_recovery_entry(zone, pbn, operation, point)? {
                replayed += 1;
            }
        }
        Ok(replayed)
    };

    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..depot.zone_count())
            .map(|zone| scope.spawn(move || replay_zone(zone)))
            .collect();
        handles.into_iter().try_fold(0, |total, handle| -> Result<usize> {
            let replayed = handle.join().unwrap_or_else(|_| {
                BadStateSnafu {
                    reason: "recovery thread panicked",
                }
                .fail()
            })?;
            Ok(total + replayed)
        })
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use dedupe_types::journal::MappingState;

    use super::*;
    use crate::{
        allocator::{DrainKind, LoadType},
        config::{DepotConfig, SlabConfig},
        ref_counts::{ReferenceStatus, MAXIMUM_REFERENCE_COUNT},
        store::{MemoryMetadata, MetadataStore},
    };
    use JournalOperation::*;

    const PAGE: u64 = 40;

    fn slot(slot: u16) -> BlockMapSlot { BlockMapSlot { pbn: PAGE, slot } }

    fn data(pbn: u64) -> DataLocation { DataLocation::new(pbn, MappingState::Uncompressed) }

    fn entry(slot: BlockMapSlot, pbn: u64, operation: JournalOperation) -> RecoveryJournalEntry {
        RecoveryJournalEntry::new(slot, data(pbn), operation)
    }

    /// A saved two-zone depot where blocks 2, 3 and 66 hold one reference,
    /// reloaded for recovery.
    fn crashed_depot() -> SlabDepot {
        let slab = SlabConfig::configure_with_entries(64, 8, 4).unwrap();
        let config = DepotConfig::new(slab, 1, 1 + 2 * 64, 2, 9).unwrap();
        let store: Arc<dyn MetadataStore> = Arc::new(MemoryMetadata::new(config.total_blocks() + 16));
        let depot = SlabDepot::format(config, store.clone()).unwrap();
        depot.load(LoadType::Normal).unwrap();
        for (i, pbn) in [2, 3, 66].into_iter().enumerate() {
            depot
                .modify_reference_count(pbn, DataIncrement, JournalPoint::new(1, i as u16))
                .unwrap();
        }
        depot.drain(DrainKind::Save).unwrap();

        let depot = SlabDepot::decode(&depot.encode_state(), store).unwrap();
        depot.load(LoadType::Recovery).unwrap();
        depot
    }

    /// Slot 0 is written twice and the second decref is lost; slot 1 is
    /// written once and its decref is lost; slot 2 is complete.
    fn torn_journal() -> RecoveryJournal {
        let mut journal = RecoveryJournal::starting_at(JournalPoint::new(1, 0), 4);
        journal.push(entry(slot(0), 10, DataIncrement));
        journal.push(entry(slot(0), 2, DataDecrement));
        journal.push(entry(slot(1), 70, DataIncrement));
        journal.push(entry(slot(2), 11, DataIncrement));
        journal.push(entry(slot(2), 3, DataDecrement));
        journal.push(entry(slot(0), 12, DataIncrement));
        journal.push(entry(BlockMapSlot { pbn: 41, slot: 0 }, 75, BlockMapIncrement));
        journal
    }

    fn block_map() -> HashMap<BlockMapSlot, DataLocation> { HashMap::from([(slot(1), data(66))]) }

    fn status(depot: &SlabDepot, pbn: u64) -> ReferenceStatus {
        depot
            .with_slab(pbn, |s| s.ref_counts().status(s.sbn_from_pbn(pbn).unwrap()))
            .unwrap()
    }

    #[test]
    fn lost_decrefs_are_found_newest_first() {
        let journal = torn_journal();
        assert_eq!(journal.tail(), 2);
        let missing = find_missing_decrefs(&journal).unwrap();
        assert_eq!(
            missing,
            vec![
                MissingDecref {
                    slot:                slot(0),
                    penultimate_mapping: Some(data(10)),
                    journal_point:       JournalPoint::new(2, 4),
                },
                MissingDecref {
                    slot:                slot(1),
                    penultimate_mapping: None,
                    journal_point:       JournalPoint::new(2, 5),
                },
            ]
        );
    }

    #[test]
    fn decremented_block_map_pages_are_corrupt() {
        let mut journal = RecoveryJournal::new(4);
        journal.push(entry(slot(3), 20, BlockMapIncrement));
        journal.push(entry(slot(3), 20, DataDecrement));
        assert!(find_missing_decrefs(&journal).unwrap_err().is_corrupt_journal());
    }

    #[test]
    fn recovery_restores_counts() {
        let depot = crashed_depot();
        let stats = recover(&depot, &torn_journal(), &block_map()).unwrap();
        assert_eq!(
            stats,
            RecoveryStats {
                entries:          7,
                entries_replayed: 9,
                missing_decrefs:  2,
                decrefs_applied:  2,
            }
        );
        assert_eq!(depot.scrub_all_unrecovered().unwrap(), 2);

        for pbn in [2, 3, 10, 66] {
            assert_eq!(status(&depot, pbn), ReferenceStatus::Free, "block {pbn}");
        }
        for pbn in [11, 12, 70] {
            assert_eq!(status(&depot, pbn), ReferenceStatus::Single, "block {pbn}");
        }
        assert_eq!(depot.increment_limit(75).unwrap(), 0);
        assert_eq!(depot.with_slab(75, |s| s.ref_counts().count(10)).unwrap(), MAXIMUM_REFERENCE_COUNT);
        assert_eq!(depot.stats().allocated_blocks, 4);
        assert!(!depot.is_read_only());
    }

    #[test]
    fn replaying_twice_changes_nothing() {
        let depot = crashed_depot();
        let journal = torn_journal();
        recover(&depot, &journal, &block_map()).unwrap();
        let again = recover(&depot, &journal, &block_map()).unwrap();
        assert_eq!(again.entries_replayed, 0);
        depot.scrub_all_unrecovered().unwrap();
        assert_eq!(depot.stats().allocated_blocks, 4);
    }

    #[test]
    fn corrupt_entries_make_the_depot_read_only() {
        let depot = crashed_depot();
        let mut journal = RecoveryJournal::new(4);
        journal.push(entry(slot(BLOCK_MAP_ENTRIES_PER_PAGE), 10, DataIncrement));
        assert!(recover(&depot, &journal, &block_map()).unwrap_err().is_read_only());
        assert!(depot.read_only_notifier().error().unwrap().is_corrupt_journal());
    }

    #[test]
    fn entries_must_map_data_blocks() {
        let depot = crashed_depot();
        // block 56 holds slab 0's reference counts
        assert!(validate_entry(&depot, &entry(slot(0), 56, DataIncrement)).is_err());
        assert!(validate_entry(&depot, &entry(slot(0), ZERO_BLOCK, BlockMapIncrement)).is_err());
        let compressed = RecoveryJournalEntry::new(
            slot(0),
            DataLocation::new(10, MappingState::Compressed(1)),
            BlockMapIncrement,
        );
        assert!(validate_entry(&depot, &compressed).is_err());
        assert!(validate_entry(&depot, &entry(slot(0), ZERO_BLOCK, DataDecrement)).is_ok());
        assert!(!depot.is_read_only());
    }

    #[test]
    fn bad_block_map_mappings_are_fatal() {
        let depot = crashed_depot();
        let mut journal = RecoveryJournal::new(4);
        journal.push(entry(slot(1), 70, DataIncrement));
        let block_map = HashMap::from([(slot(1), data(56))]);
        assert!(recover(&depot, &journal, &block_map).unwrap_err().is_read_only());
        assert!(matches!(
            depot.read_only_notifier().error().as_deref(),
            Some(crate::err::Error::BadMapping { pbn: 56, .. })
        ));
    }

    #[test]
    fn unmapped_slots_release_nothing() {
        let depot = crashed_depot();
        let mut journal = RecoveryJournal::new(4);
        journal.push(entry(slot(5), 13, DataIncrement));
        let stats = recover(&depot, &journal, &HashMap::new()).unwrap();
        assert_eq!((stats.missing_decrefs, stats.decrefs_applied), (1, 0));
        depot.scrub_all_unrecovered().unwrap();
        assert_eq!(status(&depot, 13), ReferenceStatus::Single);
    }
}
