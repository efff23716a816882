use std::{collections::HashMap, sync::Arc};

use dedupe_depot::{
    recover, DepotConfig, DrainKind, LoadType, MemoryMetadata, MetadataStore, RecoveryJournal, RecoveryJournalEntry,
    ReferenceStatus, SlabConfig, SlabDepot,
};
use dedupe_types::journal::{BlockMapSlot, DataLocation, JournalOperation, JournalPoint, MappingState};

const SLAB_BLOCKS: u64 = 64;

fn depot_config(slabs: u64) -> DepotConfig {
    let slab = SlabConfig::configure_with_entries(SLAB_BLOCKS, 8, 4).unwrap();
    DepotConfig::new(slab, 1, 1 + slabs * SLAB_BLOCKS, 2, 0x5eed).unwrap()
}

fn status(depot: &SlabDepot, pbn: u64) -> ReferenceStatus {
    depot
        .with_slab(pbn, |s| s.ref_counts().status(s.sbn_from_pbn(pbn).unwrap()))
        .unwrap()
}

fn slot(slot: u16) -> BlockMapSlot { BlockMapSlot { pbn: 30, slot } }

fn data(pbn: u64) -> DataLocation { DataLocation::new(pbn, MappingState::Uncompressed) }

/// A toy logical layer: journals every write to the recovery journal
/// before touching the depot, the way a block device does.
struct Device {
    depot:     SlabDepot,
    journal:   RecoveryJournal,
    block_map: HashMap<BlockMapSlot, DataLocation>,
}

impl Device {
    fn new(depot: SlabDepot) -> Self {
        Self {
            depot,
            journal: RecoveryJournal::new(4),
            block_map: HashMap::new(),
        }
    }

    fn write(&mut self, slot: BlockMapSlot, pbn: u64) {
        self.torn_write(slot, pbn);
        let old = self.block_map.insert(slot, data(pbn)).unwrap_or_default();
        let point = self
            .journal
            .push(RecoveryJournalEntry::new(slot, old, JournalOperation::DataDecrement));
        self.depot
            .modify_reference_count(old.pbn, JournalOperation::DataDecrement, point)
            .unwrap();
    }

    /// The increment reaches the journal but the crash comes before the
    /// decrement of the old mapping.
    fn torn_write(&mut self, slot: BlockMapSlot, pbn: u64) {
        let point = self
            .journal
            .push(RecoveryJournalEntry::new(slot, data(pbn), JournalOperation::DataIncrement));
        self.depot
            .modify_reference_count(pbn, JournalOperation::DataIncrement, point)
            .unwrap();
    }
}

#[test]
fn torn_write_is_repaired_after_a_crash() {
    dedupe_utils::logger::install_fmt_log();
    let config = depot_config(4);
    let store: Arc<dyn MetadataStore> = Arc::new(MemoryMetadata::new(config.total_blocks() + 16));
    let depot = SlabDepot::format(config, store.clone()).unwrap();
    depot.load(LoadType::Normal).unwrap();
    let state = depot.encode_state();

    // zone 0 owns slabs 0 and 2, zone 1 slabs 1 and 3
    let (a, b, c, d, e) = (1, 65, 2, 66, 3);
    let mut device = Device::new(depot);
    device.write(slot(0), a);
    device.write(slot(1), b);
    device.write(slot(2), c);
    device.write(slot(0), d);
    device.torn_write(slot(2), e);
    // the block map never saw the torn write
    let Device {
        depot,
        journal,
        block_map,
    } = device;
    drop(depot);

    let depot = SlabDepot::decode(&state, store).unwrap();
    depot.load(LoadType::Recovery).unwrap();
    let stats = recover(&depot, &journal, &block_map).unwrap();
    assert_eq!(stats.entries, 9);
    assert_eq!((stats.missing_decrefs, stats.decrefs_applied), (1, 1));
    depot.scrub_all_unrecovered().unwrap();

    assert_eq!(status(&depot, a), ReferenceStatus::Free);
    assert_eq!(status(&depot, c), ReferenceStatus::Free);
    for pbn in [b, d, e] {
        assert_eq!(status(&depot, pbn), ReferenceStatus::Single, "block {pbn}");
    }
    assert_eq!(depot.stats().allocated_blocks, 3);
    assert!(!depot.is_read_only());
}

#[test]
fn grown_depot_survives_a_reload() {
    let grown = depot_config(4);
    let store: Arc<dyn MetadataStore> = Arc::new(MemoryMetadata::new(grown.total_blocks()));
    let depot = SlabDepot::format(depot_config(2), store.clone()).unwrap();
    depot.load(LoadType::Normal).unwrap();
    for i in 0..20 {
        let pbn = depot.allocate_block(i % depot.zone_count()).unwrap();
        let point = JournalPoint::new(1 + i as u64, 0);
        depot
            .modify_reference_count(pbn, JournalOperation::DataIncrement, point)
            .unwrap();
    }
    let allocated = depot.stats().allocated_blocks;
    assert_eq!(allocated, 20);

    assert_eq!(depot.prepare_to_grow(grown.last_block).unwrap(), 2);
    depot.use_new_slabs().unwrap();
    depot.drain(DrainKind::Save).unwrap();
    assert_eq!(depot.config(), grown);

    let depot = SlabDepot::decode(&depot.encode_state(), store).unwrap();
    depot.load(LoadType::Normal).unwrap();
    let stats = depot.stats();
    assert_eq!(stats.slab_count, 4);
    assert_eq!(stats.allocated_blocks, allocated);
    assert_eq!(stats.free_blocks, stats.data_blocks - allocated);
    assert!(depot.allocate_block(0).is_ok());
}
