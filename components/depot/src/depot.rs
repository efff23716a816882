use std::sync::Arc;

use dedupe_common::{BlockCount, PhysicalBlockNumber, SlabCount, VDO_BLOCK_SIZE, ZERO_BLOCK};
use dedupe_types::journal::{JournalOperation, JournalPoint};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use snafu::ensure;
use tracing::info;

use crate::{
    allocator::{AllocatorStats, BlockAllocator, DrainKind, LoadType},
    config::DepotConfig,
    err::{BadStateSnafu, IncrementTooSmallSnafu, InvalidArgumentSnafu, OutOfRangeSnafu, Result},
    read_only::ReadOnlyNotifier,
    slab::Slab,
    store::MetadataStore,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DepotStats {
    pub slab_count:       SlabCount,
    pub data_blocks:      BlockCount,
    pub allocated_blocks: BlockCount,
    pub free_blocks:      BlockCount,
    pub zones:            Vec<AllocatorStats>,
}

/// Every slab of the device, split into one [`BlockAllocator`] per
/// physical zone. Slab `n` belongs to zone `n % zone_count`.
pub struct SlabDepot {
    config:     RwLock<DepotConfig>,
    allocators: Vec<Mutex<BlockAllocator>>,
    store:      Arc<dyn MetadataStore>,
    read_only:  Arc<ReadOnlyNotifier>,
    /// Layout after a prepared but unapplied growth.
    new_config: Mutex<Option<DepotConfig>>,
}

impl SlabDepot {
    /// Lay out a new depot, writing empty slab summaries.
    pub fn format(config: DepotConfig, store: Arc<dyn MetadataStore>) -> Result<Self> {
        ensure!(
            store.block_count() >= config.total_blocks(),
            InvalidArgumentSnafu {
                reason: format!(
                    "depot needs {} blocks, the device has {}",
                    config.total_blocks(),
                    store.block_count()
                ),
            }
        );
        let zero = vec![0u8; VDO_BLOCK_SIZE];
        for pbn in config.last_block..config.total_blocks() {
            store.write_block(pbn, &zero)?;
        }
        info!(
            "formatted slab depot: {} slabs of {} blocks in {} zones",
            config.slab_count(),
            config.slab_config.slab_blocks,
            config.zone_count
        );
        Self::new(config, store)
    }

    /// Build the in-memory depot for `config`. Nothing is read until
    /// [`SlabDepot::load`].
    pub fn new(config: DepotConfig, store: Arc<dyn MetadataStore>) -> Result<Self> {
        let read_only = ReadOnlyNotifier::new();
        let zones = config.zone_count as usize;
        let mut slabs: Vec<Vec<Slab>> = (0..zones).map(|_| Vec::new()).collect();
        for number in 0..config.slab_count() {
            slabs[number as usize % zones].push(Self::make_slab(&config, number));
        }
        let allocators = slabs
            .into_iter()
            .enumerate()
            .map(|(zone, slabs)| {
                BlockAllocator::new(
                    zone,
                    zones,
                    config.slab_config,
                    slabs,
                    config.summary_origin(zone),
                    store.clone(),
                    read_only.clone(),
                )
                .map(Mutex::new)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            config: RwLock::new(config),
            allocators,
            store,
            read_only,
            new_config: Mutex::new(None),
        })
    }

    /// Rebuild a depot from its encoded state block.
    pub fn decode(raw: &[u8], store: Arc<dyn MetadataStore>) -> Result<Self> {
        Self::new(DepotConfig::decode(raw)?, store)
    }

    pub fn encode_state(&self) -> Vec<u8> { self.config.read().encode() }

    fn make_slab(config: &DepotConfig, number: SlabCount) -> Slab {
        let start = config.first_block + number as u64 * config.slab_config.slab_blocks;
        Slab::new(number, start, config.slab_config, config.nonce)
    }

    pub fn config(&self) -> DepotConfig { *self.config.read() }

    pub fn zone_count(&self) -> usize { self.allocators.len() }

    /// Blocks on the underlying device.
    pub fn physical_blocks(&self) -> BlockCount { self.store.block_count() }

    pub fn read_only_notifier(&self) -> &Arc<ReadOnlyNotifier> { &self.read_only }

    pub fn is_read_only(&self) -> bool { self.read_only.is_read_only() }

    /// The number of the slab containing `pbn`.
    pub fn get_slab_number(&self, pbn: PhysicalBlockNumber) -> Result<SlabCount> {
        let config = self.config.read();
        ensure!(
            pbn >= config.first_block && pbn < config.last_block,
            OutOfRangeSnafu {
                pbn,
                what: format!("the depot [{}, {})", config.first_block, config.last_block),
            }
        );
        Ok(((pbn - config.first_block) / config.slab_config.slab_blocks) as SlabCount)
    }

    /// The zone whose allocator owns `pbn`.
    pub fn get_zone(&self, pbn: PhysicalBlockNumber) -> Result<usize> {
        Ok(self.get_slab_number(pbn)? as usize % self.zone_count())
    }

    /// Run `f` against the slab holding `pbn`.
    pub fn with_slab<T>(&self, pbn: PhysicalBlockNumber, f: impl FnOnce(&Slab) -> T) -> Result<T> {
        let number = self.get_slab_number(pbn)?;
        let allocator = self.allocators[number as usize % self.zone_count()].lock();
        let slab = allocator.slab(number).ok_or_else(|| {
            OutOfRangeSnafu {
                pbn,
                what: format!("slab {number}"),
            }
            .build()
        })?;
        Ok(f(slab))
    }

    /// Whether `pbn` may hold user data: the zero block or a slab data block.
    pub fn is_physical_data_block(&self, pbn: PhysicalBlockNumber) -> bool {
        pbn == ZERO_BLOCK || self.with_slab(pbn, |slab| slab.sbn_from_pbn(pbn).is_ok()).unwrap_or(false)
    }

    fn allocator_for(&self, pbn: PhysicalBlockNumber) -> Result<&Mutex<BlockAllocator>> {
        Ok(&self.allocators[self.get_zone(pbn)?])
    }

    /// Allocate a block from zone `zone`, with a provisional reference.
    pub fn allocate_block(&self, zone: usize) -> Result<PhysicalBlockNumber> {
        let allocator = self.allocators.get(zone).ok_or_else(|| {
            InvalidArgumentSnafu {
                reason: format!("no zone {zone}"),
            }
            .build()
        })?;
        allocator.lock().allocate_block()
    }

    /// Journal and apply a reference change. The zero block is never
    /// counted.
    pub fn modify_reference_count(
        &self,
        pbn: PhysicalBlockNumber,
        operation: JournalOperation,
        recovery_point: JournalPoint,
    ) -> Result<()> {
        if pbn == ZERO_BLOCK {
            return Ok(());
        }
        self.allocator_for(pbn)?
            .lock()
            .modify_reference_count(pbn, operation, recovery_point)
    }

    /// Release the provisional reference of an allocated block that was
    /// not written.
    pub fn release_block_reference(&self, pbn: PhysicalBlockNumber) -> Result<()> {
        if pbn == ZERO_BLOCK {
            return Ok(());
        }
        self.allocator_for(pbn)?.lock().release_block_reference(pbn)
    }

    /// How many more references `pbn` can take.
    pub fn increment_limit(&self, pbn: PhysicalBlockNumber) -> Result<u8> {
        self.allocator_for(pbn)?.lock().increment_limit(pbn)
    }

    pub(crate) fn replay_recovery_entry(
        &self,
        zone: usize,
        pbn: PhysicalBlockNumber,
        operation: JournalOperation,
        recovery_point: JournalPoint,
    ) -> Result<bool> {
        self.allocators[zone]
            .lock()
            .replay_recovery_entry(pbn, operation, recovery_point)
    }

    /// Count a reference found in the block map during a rebuild.
    pub fn rebuild_reference(&self, pbn: PhysicalBlockNumber, operation: JournalOperation) -> Result<()> {
        if pbn == ZERO_BLOCK {
            return Ok(());
        }
        self.allocator_for(pbn)?.lock().rebuild_reference(pbn, operation)
    }

    /// Load every zone. A normal load is ready to allocate when this
    /// returns; recovery and rebuild loads must feed in their references
    /// and then call [`SlabDepot::prepare_to_allocate`].
    pub fn load(&self, load_type: LoadType) -> Result<()> {
        self.for_each_zone(|allocator| allocator.load(load_type))?;
        if load_type == LoadType::Normal {
            self.prepare_to_allocate();
        }
        info!("loaded slab depot ({load_type:?})");
        Ok(())
    }

    pub fn prepare_to_allocate(&self) {
        for allocator in &self.allocators {
            allocator.lock().prepare_to_allocate();
        }
    }

    /// Scrub every unrecovered slab, all zones at once.
    pub fn scrub_all_unrecovered(&self) -> Result<usize> {
        let counts = self.map_zones(|allocator| allocator.scrub_slabs())?;
        Ok(counts.into_iter().sum())
    }

    pub fn drain(&self, kind: DrainKind) -> Result<()> {
        self.for_each_zone(|allocator| allocator.drain(kind))?;
        info!("slab depot drained for {kind:?}");
        Ok(())
    }

    pub fn resume(&self) -> Result<()> { self.for_each_zone(BlockAllocator::resume) }

    fn for_each_zone(&self, f: impl Fn(&mut BlockAllocator) -> Result<()> + Sync) -> Result<()> {
        self.map_zones(f).map(|_| ())
    }

    /// Run `f` on every allocator, each on its own thread.
    fn map_zones<T: Send>(&self, f: impl Fn(&mut BlockAllocator) -> Result<T> + Sync) -> Result<Vec<T>> {
        let f = &f;
        std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .allocators
                .iter()
                .map(|allocator| scope.spawn(move || f(&mut allocator.lock())))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        BadStateSnafu {
                            reason: "zone thread panicked",
                        }
                        .fail()
                    })
                })
                .collect()
        })
    }

    /// Work out the layout for a device grown to `new_last_block`. Returns
    /// the number of slabs that would be added.
    pub fn prepare_to_grow(&self, new_last_block: PhysicalBlockNumber) -> Result<SlabCount> {
        let config = self.config();
        let new_count = new_last_block.saturating_sub(config.first_block) / config.slab_config.slab_blocks;
        ensure!(
            new_count > config.slab_count() as u64,
            IncrementTooSmallSnafu {
                requested: new_last_block,
            }
        );
        let new_config = DepotConfig {
            last_block: config.first_block + new_count * config.slab_config.slab_blocks,
            ..config
        };
        ensure!(
            self.store.block_count() >= new_config.total_blocks(),
            InvalidArgumentSnafu {
                reason: format!("growing needs {} blocks", new_config.total_blocks()),
            }
        );
        let added = new_config.slab_count() - config.slab_count();
        *self.new_config.lock() = Some(new_config);
        Ok(added)
    }

    /// Hand the slabs from [`SlabDepot::prepare_to_grow`] to their zones.
    pub fn use_new_slabs(&self) -> Result<()> {
        let Some(new_config) = self.new_config.lock().take() else {
            return BadStateSnafu {
                reason: "no growth prepared",
            }
            .fail();
        };
        let old_count = self.config().slab_count();
        let zones = self.zone_count();
        let mut slabs: Vec<Vec<Slab>> = (0..zones).map(|_| Vec::new()).collect();
        for number in old_count..new_config.slab_count() {
            slabs[number as usize % zones].push(Self::make_slab(&new_config, number));
        }
        for (zone, slabs) in slabs.into_iter().enumerate() {
            self.allocators[zone]
                .lock()
                .add_slabs(slabs, new_config.summary_origin(zone));
        }
        *self.config.write() = new_config;
        info!("slab depot grew to {} slabs", new_config.slab_count());
        Ok(())
    }

    pub fn abandon_new_slabs(&self) { self.new_config.lock().take(); }

    pub fn stats(&self) -> DepotStats {
        let config = self.config();
        let zones: Vec<_> = self.allocators.iter().map(|a| a.lock().stats()).collect();
        let allocated_blocks = zones.iter().map(|z| z.allocated_blocks).sum();
        DepotStats {
            slab_count: config.slab_count(),
            data_blocks: config.data_blocks(),
            allocated_blocks,
            free_blocks: config.data_blocks() - allocated_blocks,
            zones,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::{config::SlabConfig, ref_counts::ReferenceStatus, store::MemoryMetadata};
    use JournalOperation::*;

    const SLAB_BLOCKS: u64 = 64;

    fn config(slabs: u64, zones: u8) -> DepotConfig {
        let slab = SlabConfig::configure_with_entries(SLAB_BLOCKS, 8, 4).unwrap();
        DepotConfig::new(slab, 1, 1 + slabs * SLAB_BLOCKS, zones, 0xfeed).unwrap()
    }

    fn depot(slabs: u64, zones: u8) -> (SlabDepot, Arc<MemoryMetadata>) {
        let config = config(slabs, zones);
        let store = Arc::new(MemoryMetadata::new(config.total_blocks() + 4 * SLAB_BLOCKS));
        let depot = SlabDepot::format(config, store.clone()).unwrap();
        depot.load(LoadType::Normal).unwrap();
        (depot, store)
    }

    fn point(n: u64) -> JournalPoint { JournalPoint::new(n, 0) }

    #[test]
    fn slab_numbers_and_ranges() {
        let (depot, _) = depot(4, 2);
        assert_eq!(depot.get_slab_number(1).unwrap(), 0);
        assert_eq!(depot.get_slab_number(1 + SLAB_BLOCKS * 3).unwrap(), 3);
        assert_eq!(depot.get_zone(1 + SLAB_BLOCKS * 3).unwrap(), 1);
        assert!(depot.get_slab_number(0).unwrap_err().is_out_of_range());
        assert!(depot.get_slab_number(1 + SLAB_BLOCKS * 4).unwrap_err().is_out_of_range());

        assert!(depot.is_physical_data_block(ZERO_BLOCK));
        assert!(depot.is_physical_data_block(1));
        // reference count and journal blocks hold metadata
        assert!(!depot.is_physical_data_block(1 + 55));
        assert!(!depot.is_physical_data_block(1 + SLAB_BLOCKS - 1));
        assert!(depot.modify_reference_count(1 + 60, DataIncrement, point(1)).unwrap_err().is_out_of_range());
        assert!(depot.modify_reference_count(5000, DataIncrement, point(1)).unwrap_err().is_out_of_range());
    }

    #[test]
    fn state_block_rebuilds_the_layout() {
        let (depot, store) = depot(3, 1);
        let copy = SlabDepot::decode(&depot.encode_state(), store).unwrap();
        assert_eq!(copy.config(), depot.config());
    }

    #[test]
    fn allocation_exhausts_every_slab() {
        let (depot, _) = depot(2, 1);
        let data_blocks = depot.config().data_blocks();
        let mut seen = HashSet::new();
        for _ in 0..data_blocks {
            let pbn = depot.allocate_block(0).unwrap();
            assert!(depot.is_physical_data_block(pbn));
            assert!(seen.insert(pbn));
        }
        assert!(depot.allocate_block(0).unwrap_err().is_no_space());
        assert_eq!(depot.stats().free_blocks, 0);

        // releasing a provisional reference makes room again
        let pbn = *seen.iter().next().unwrap();
        depot.release_block_reference(pbn).unwrap();
        assert_eq!(depot.allocate_block(0).unwrap(), pbn);
    }

    #[test]
    fn written_slabs_are_preferred_to_unopened_ones() {
        let (depot, _) = depot(3, 1);
        // slab 2 has been written to but is almost entirely free
        let in_slab_2 = 1 + 2 * SLAB_BLOCKS + 7;
        depot.modify_reference_count(in_slab_2, DataIncrement, point(1)).unwrap();

        let first = depot.allocate_block(0).unwrap();
        assert_eq!(depot.get_slab_number(first).unwrap(), 2);
        let stats = depot.stats().zones[0];
        assert_eq!((stats.slabs_opened, stats.slabs_reopened), (0, 1));
    }

    #[test]
    fn nearly_full_slabs_wait_behind_unopened_ones() {
        let (depot, _) = depot(2, 1);
        let data_blocks = depot.config().slab_config.data_blocks;
        // fill all but 10 blocks of slab 1
        for sbn in 0..data_blocks - 10 {
            depot.modify_reference_count(1 + SLAB_BLOCKS + sbn, DataIncrement, point(1)).unwrap();
        }
        let first = depot.allocate_block(0).unwrap();
        assert_eq!(depot.get_slab_number(first).unwrap(), 0);
    }

    #[test]
    fn references_are_counted_per_block() {
        let (depot, _) = depot(2, 2);
        let pbn = depot.allocate_block(1).unwrap();
        assert_eq!(depot.get_zone(pbn).unwrap(), 1);
        depot.modify_reference_count(pbn, DataIncrement, point(1)).unwrap();
        depot.modify_reference_count(pbn, DataIncrement, point(2)).unwrap();
        assert_eq!(depot.with_slab(pbn, |s| s.ref_counts().status(s.sbn_from_pbn(pbn).unwrap())).unwrap(), ReferenceStatus::Shared);
        assert_eq!(depot.increment_limit(pbn).unwrap(), 252);
        assert_eq!(depot.stats().allocated_blocks, 1);

        depot.modify_reference_count(pbn, DataDecrement, point(3)).unwrap();
        depot.modify_reference_count(pbn, DataDecrement, point(4)).unwrap();
        assert_eq!(depot.stats().allocated_blocks, 0);
        assert!(depot.modify_reference_count(ZERO_BLOCK, DataIncrement, point(5)).is_ok());
    }

    #[test]
    fn invalid_changes_make_the_depot_read_only() {
        let (depot, _) = depot(2, 1);
        let err = depot.modify_reference_count(1 + 3, DataDecrement, point(1)).unwrap_err();
        assert!(err.is_read_only());
        assert!(depot.is_read_only());
        assert!(depot.allocate_block(0).unwrap_err().is_read_only());
        assert!(depot.read_only_notifier().error().unwrap().is_ref_count_invalid());
    }

    #[test]
    fn saved_depot_reloads_clean() {
        let (depot, store) = depot(2, 1);
        let blocks: Vec<_> = (0..20).map(|_| depot.allocate_block(0).unwrap()).collect();
        for (i, pbn) in blocks.iter().enumerate() {
            depot.modify_reference_count(*pbn, DataIncrement, point(i as u64 + 1)).unwrap();
        }
        depot.drain(DrainKind::Save).unwrap();
        assert!(depot.allocate_block(0).unwrap_err().to_string().contains("zone 0"));

        let reloaded = SlabDepot::decode(&depot.encode_state(), store).unwrap();
        reloaded.load(LoadType::Normal).unwrap();
        let stats = reloaded.stats();
        assert_eq!(stats.allocated_blocks, 20);
        assert_eq!(stats.zones[0].unrecovered, 0);

        depot.resume().unwrap();
        assert!(depot.allocate_block(0).is_ok());
    }

    #[test]
    fn suspended_depot_is_scrubbed_on_load() {
        let (depot, store) = depot(3, 1);
        for i in 0..9 {
            let pbn = depot.allocate_block(0).unwrap();
            depot.modify_reference_count(pbn, DataIncrement, point(i + 1)).unwrap();
        }
        depot.drain(DrainKind::Suspend).unwrap();

        let reloaded = SlabDepot::decode(&depot.encode_state(), store).unwrap();
        reloaded.load(LoadType::Normal).unwrap();
        let before = reloaded.stats();
        assert_eq!(before.zones[0].unrecovered, 1);
        // unscrubbed slabs count as fully allocated
        assert_eq!(before.allocated_blocks, reloaded.config().slab_config.data_blocks);

        assert_eq!(reloaded.scrub_all_unrecovered().unwrap(), 1);
        let after = reloaded.stats();
        assert_eq!(after.allocated_blocks, 9);
        assert_eq!(after.zones[0].scrubber.entries_replayed, 9);
    }

    #[test]
    fn allocation_scrubs_when_clean_slabs_run_out() {
        let (depot, store) = depot(1, 1);
        let pbn = depot.allocate_block(0).unwrap();
        depot.modify_reference_count(pbn, DataIncrement, point(1)).unwrap();
        depot.drain(DrainKind::Suspend).unwrap();

        let reloaded = SlabDepot::decode(&depot.encode_state(), store).unwrap();
        reloaded.load(LoadType::Normal).unwrap();
        let next = reloaded.allocate_block(0).unwrap();
        assert_ne!(next, pbn);
        assert_eq!(reloaded.stats().zones[0].scrubber.slabs_scrubbed, 1);
    }

    #[test]
    fn rebuild_starts_from_nothing() {
        let (depot, store) = depot(2, 1);
        let pbn = depot.allocate_block(0).unwrap();
        depot.modify_reference_count(pbn, DataIncrement, point(1)).unwrap();
        depot.drain(DrainKind::Save).unwrap();

        let rebuilt = SlabDepot::decode(&depot.encode_state(), store).unwrap();
        rebuilt.load(LoadType::Rebuild).unwrap();
        rebuilt.rebuild_reference(pbn, DataIncrement).unwrap();
        rebuilt.rebuild_reference(1 + SLAB_BLOCKS, BlockMapIncrement).unwrap();
        rebuilt.prepare_to_allocate();
        assert_eq!(rebuilt.stats().allocated_blocks, 2);
        assert_eq!(rebuilt.increment_limit(1 + SLAB_BLOCKS).unwrap(), 0);
    }

    #[test]
    fn growing_adds_slabs_to_zones() {
        let (depot, _) = depot(2, 2);
        let last = depot.config().last_block;
        assert!(matches!(
            depot.prepare_to_grow(last + SLAB_BLOCKS - 1),
            Err(crate::err::Error::IncrementTooSmall { .. })
        ));
        assert_eq!(depot.prepare_to_grow(last + 2 * SLAB_BLOCKS).unwrap(), 2);
        depot.use_new_slabs().unwrap();
        assert_eq!(depot.config().slab_count(), 4);
        assert_eq!(depot.get_zone(last + SLAB_BLOCKS + 1).unwrap(), 1);
        assert!(depot.modify_reference_count(last + 1, DataIncrement, point(1)).is_ok());
        assert!(depot.use_new_slabs().is_err());
    }
}
