//! The per-zone open chapter: an in-memory hash table of the records added
//! since the last chapter closed, plus collation and persistence of the
//! open chapters of every zone.

use bytes::{Buf, BufMut};
use dedupe_common::{bits_per, BYTES_PER_RECORD, RECORD_NAME_SIZE};
use dedupe_types::record::{Record, RecordData, RecordName};
use snafu::ensure;
use tracing::{debug, warn};

use crate::{
    chapter_index::OpenChapterIndex,
    err::{CorruptDataSnafu, Result},
    geometry::Geometry,
    storage::{BufferedReader, BufferedWriter},
};

const OPEN_CHAPTER_MAGIC: &[u8; 5] = b"ALBOC";
const OPEN_CHAPTER_VERSION: &[u8; 5] = b"02.00";

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    /// 1-based index into `records`, 0 when the slot is empty.
    record_number: u32,
    /// Indexed by record number rather than by slot.
    deleted:       bool,
}

/// One zone's share of the open chapter.
#[derive(Debug, Clone)]
pub struct OpenChapterZone {
    capacity:   u32,
    slot_count: u32,
    size:       u32,
    deletions:  u32,
    records:    Vec<Record>,
    slots:      Vec<Slot>,
}

impl OpenChapterZone {
    pub fn new(geometry: &Geometry, zone_count: usize) -> Self {
        let capacity = geometry.records_per_chapter / zone_count as u32;
        let slot_count = 1u32 << bits_per(capacity as u64 * 2);
        Self {
            capacity,
            slot_count,
            size: 0,
            deletions: 0,
            records: vec![Record::default(); capacity as usize + 1],
            slots: vec![Slot::default(); slot_count as usize],
        }
    }

    pub fn capacity(&self) -> u32 { self.capacity }

    /// Records added, deleted ones included.
    pub fn size(&self) -> u32 { self.size }

    pub fn deletions(&self) -> u32 { self.deletions }

    pub fn is_full(&self) -> bool { self.size >= self.capacity }

    /// The slot holding `name`, or the empty slot that ends its probe chain.
    fn probe(&self, name: &RecordName) -> usize {
        let mut slot = name.hash_slot(self.slot_count);
        let mut attempts = 1u32;
        loop {
            let record_number = self.slots[slot as usize].record_number;
            if record_number == 0 {
                return slot as usize;
            }
            if self.records[record_number as usize].name == *name
                && !self.slots[record_number as usize].deleted
            {
                return slot as usize;
            }
            slot = (slot + attempts) % self.slot_count;
            attempts += 1;
        }
    }

    pub fn search(&self, name: &RecordName) -> Option<RecordData> {
        let record_number = self.slots[self.probe(name)].record_number;
        (record_number != 0).then(|| self.records[record_number as usize].data)
    }

    /// Add or overwrite `name`, returning how many more records fit. A full
    /// zone refuses the put and returns 0.
    pub fn put(&mut self, name: &RecordName, data: &RecordData) -> u32 {
        if self.is_full() {
            return 0;
        }
        let slot = self.probe(name);
        let mut record_number = self.slots[slot].record_number;
        if record_number == 0 {
            self.size += 1;
            record_number = self.size;
            self.slots[slot].record_number = record_number;
        }
        self.records[record_number as usize] = Record::new(*name, *data);
        self.capacity - self.size
    }

    pub fn remove(&mut self, name: &RecordName) -> bool {
        let record_number = self.slots[self.probe(name)].record_number;
        if record_number == 0 {
            return false;
        }
        self.slots[record_number as usize].deleted = true;
        self.deletions += 1;
        true
    }

    pub fn reset(&mut self) {
        self.size = 0;
        self.deletions = 0;
        self.slots.fill(Slot::default());
    }

    /// The record in position `record_number` (1-based) unless deleted.
    fn live_record(&self, record_number: u32) -> Option<&Record> {
        (record_number <= self.size && !self.slots[record_number as usize].deleted)
            .then(|| &self.records[record_number as usize])
    }

    fn live_count(&self) -> u32 { self.size - self.deletions }
}

/// Interleave the zones' records into chapter order, indexing each live one
/// in `index`. Empty and deleted positions take a copy of the first live
/// record; the chapter index never points at them. Returns the collated
/// records and how many entries overflowed the chapter index.
pub fn collate_records(
    zones: &[&OpenChapterZone],
    index: &mut OpenChapterIndex,
    geometry: &Geometry,
) -> Result<(Vec<Record>, u64)> {
    let zone_count = zones.len() as u32;
    let position = |i: u32| (zones[(i % zone_count) as usize], 1 + i / zone_count);
    let fill = (0..geometry.records_per_chapter)
        .find_map(|i| {
            let (zone, n) = position(i);
            zone.live_record(n).copied()
        })
        .unwrap_or_default();

    let mut records = Vec::with_capacity(geometry.records_per_chapter as usize);
    let mut overflows = 0u64;
    for i in 0..geometry.records_per_chapter {
        let (zone, n) = position(i);
        let Some(record) = zone.live_record(n) else {
            records.push(fill);
            continue;
        };
        match index.put_record(&record.name, i / geometry.records_per_page) {
            Ok(()) => {}
            Err(e) if e.is_overflow() => overflows += 1,
            Err(e) => return Err(e),
        }
        records.push(*record);
    }

    if overflows > 0 {
        warn!(
            "chapter {} lost {overflows} chapter index entries to overflow",
            index.virtual_chapter()
        );
    }
    Ok((records, overflows))
}

/// Bytes the saved open chapter may take.
pub fn save_bytes(geometry: &Geometry) -> u64 {
    (OPEN_CHAPTER_MAGIC.len() + OPEN_CHAPTER_VERSION.len() + 4) as u64
        + geometry.records_per_chapter as u64 * BYTES_PER_RECORD as u64
}

/// Write the live records of every zone, interleaved across zones.
pub fn save_open_chapters(zones: &[&OpenChapterZone], writer: &mut BufferedWriter) -> Result<()> {
    let record_count: u32 = zones.iter().map(|z| z.live_count()).sum();
    let mut buf = Vec::with_capacity(14 + record_count as usize * BYTES_PER_RECORD);
    buf.put_slice(OPEN_CHAPTER_MAGIC);
    buf.put_slice(OPEN_CHAPTER_VERSION);
    buf.put_u32_le(record_count);

    let longest = zones.iter().map(|z| z.size).max().unwrap_or(0);
    for record_number in 1..=longest {
        for zone in zones {
            if let Some(record) = zone.live_record(record_number) {
                buf.put_slice(record.name.as_bytes());
                buf.put_slice(&record.data.0);
            }
        }
    }
    writer.write_all(&buf)?;
    writer.flush()?;
    debug!("saved {record_count} open chapter records");
    Ok(())
}

/// Read a saved open chapter back into `zones`, which may number
/// differently from the zones that saved it. No zone is filled past its
/// last slot; records beyond that are dropped.
pub fn load_open_chapters(
    zones: &mut [&mut OpenChapterZone],
    zone_of: impl Fn(&RecordName) -> usize,
    reader: &mut BufferedReader,
) -> Result<u32> {
    ensure!(
        reader.check_bytes(OPEN_CHAPTER_MAGIC)?,
        CorruptDataSnafu {
            reason: "open chapter save has a bad magic number",
        }
    );
    ensure!(
        reader.check_bytes(OPEN_CHAPTER_VERSION)?,
        CorruptDataSnafu {
            reason: "open chapter save has an unknown version",
        }
    );
    let record_count = reader.read_vec(4)?.as_slice().get_u32_le();

    let mut full = vec![false; zones.len()];
    let mut loaded = 0;
    for _ in 0..record_count {
        let raw = reader.read_vec(BYTES_PER_RECORD)?;
        let (Some(name), Some(data)) = (
            RecordName::from_slice(&raw),
            RecordData::from_slice(&raw[RECORD_NAME_SIZE..]),
        ) else {
            return CorruptDataSnafu {
                reason: "truncated open chapter record",
            }
            .fail();
        };
        let zone = if zones.len() > 1 { zone_of(&name) } else { 0 };
        if full[zone] {
            continue;
        }
        let remaining = zones[zone].put(&name, &data);
        full[zone] = remaining <= 1;
        loaded += 1;
    }
    debug!("loaded {loaded} of {record_count} open chapter records");
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::storage::{BlockStore, MemoryStore, Region};

    fn geometry() -> Geometry { Geometry::new(256, 4, 8, 0).unwrap() }

    fn name(seed: u64) -> RecordName {
        let mut rng = StdRng::seed_from_u64(seed);
        RecordName::new(rng.gen())
    }

    #[test]
    fn put_search_remove() {
        let mut zone = OpenChapterZone::new(&geometry(), 1);
        assert_eq!(zone.capacity(), 32);
        assert_eq!(zone.slot_count, 128);

        assert_eq!(zone.put(&name(1), &RecordData::from_u64(1)), 31);
        assert_eq!(zone.put(&name(1), &RecordData::from_u64(2)), 31);
        assert_eq!(zone.search(&name(1)), Some(RecordData::from_u64(2)));
        assert_eq!(zone.search(&name(2)), None);

        assert!(zone.remove(&name(1)));
        assert!(!zone.remove(&name(1)));
        assert_eq!(zone.search(&name(1)), None);
        assert_eq!((zone.size(), zone.deletions()), (1, 1));

        // a deleted name comes back in a fresh record
        assert_eq!(zone.put(&name(1), &RecordData::from_u64(3)), 30);
        assert_eq!(zone.search(&name(1)), Some(RecordData::from_u64(3)));

        zone.reset();
        assert_eq!(zone.size(), 0);
        assert_eq!(zone.search(&name(1)), None);
    }

    #[test]
    fn zones_share_the_chapter() {
        let zone = OpenChapterZone::new(&geometry(), 3);
        assert_eq!(zone.capacity(), 10);
        assert_eq!(zone.slot_count, 32);
    }

    proptest! {
        #[test]
        fn capacity_is_never_exceeded(seeds in proptest::collection::vec(0u64..64, 0..200)) {
            let mut zone = OpenChapterZone::new(&geometry(), 2);
            for (i, seed) in seeds.iter().enumerate() {
                if i % 5 == 4 {
                    zone.remove(&name(*seed));
                } else {
                    zone.put(&name(*seed), &RecordData::from_u64(i as u64));
                }
                prop_assert!(zone.size() - zone.deletions() <= zone.capacity());
                prop_assert!(zone.size() <= zone.capacity());
            }
        }
    }

    #[test]
    fn collation_interleaves_zones_and_fills() {
        let geometry = geometry();
        let mut a = OpenChapterZone::new(&geometry, 2);
        let mut b = OpenChapterZone::new(&geometry, 2);
        for i in 0..3 {
            a.put(&name(i), &RecordData::from_u64(i));
            b.put(&name(100 + i), &RecordData::from_u64(100 + i));
        }
        b.remove(&name(101));

        let mut index = OpenChapterIndex::new(&geometry, 0);
        index.empty(4);
        let (records, overflows) = collate_records(&[&a, &b], &mut index, &geometry).unwrap();
        assert_eq!(overflows, 0);
        assert_eq!(records.len(), geometry.records_per_chapter as usize);
        assert_eq!(records[0].name, name(0));
        assert_eq!(records[1].name, name(100));
        assert_eq!(records[2].name, name(1));
        // the deleted record and every unused position hold the fill record
        assert_eq!(records[3].name, name(0));
        assert_eq!(records[31].name, name(0));
        assert_eq!(index.record_count(), 5);
    }

    #[test]
    fn save_and_load_with_another_zone_count() {
        let geometry = geometry();
        let mut a = OpenChapterZone::new(&geometry, 2);
        let mut b = OpenChapterZone::new(&geometry, 2);
        for i in 0..5 {
            a.put(&name(i), &RecordData::from_u64(i));
            b.put(&name(10 + i), &RecordData::from_u64(10 + i));
        }
        a.remove(&name(2));

        let store: Arc<dyn BlockStore> = Arc::new(MemoryStore::new(4096));
        let region = Region::new(store, "open chapter", 0, save_bytes(&geometry));
        save_open_chapters(&[&a, &b], &mut BufferedWriter::new(region.clone())).unwrap();

        let mut single = OpenChapterZone::new(&geometry, 1);
        let loaded =
            load_open_chapters(&mut [&mut single], |_| 0, &mut BufferedReader::new(region.clone())).unwrap();
        assert_eq!(loaded, 9);
        assert_eq!(single.search(&name(2)), None);
        assert_eq!(single.search(&name(4)), Some(RecordData::from_u64(4)));
        assert_eq!(single.search(&name(14)), Some(RecordData::from_u64(14)));

        region.write(0, b"ALBOX").unwrap();
        let err = load_open_chapters(&mut [&mut single], |_| 0, &mut BufferedReader::new(region)).unwrap_err();
        assert!(err.is_corrupt());
    }

    #[test]
    fn load_leaves_a_slot_free() {
        let geometry = geometry();
        let mut full = OpenChapterZone::new(&geometry, 1);
        for i in 0..32 {
            full.put(&name(i), &RecordData::from_u64(i));
        }
        let store: Arc<dyn BlockStore> = Arc::new(MemoryStore::new(4096));
        let region = Region::new(store, "open chapter", 0, save_bytes(&geometry));
        save_open_chapters(&[&full], &mut BufferedWriter::new(region.clone())).unwrap();

        let mut zone = OpenChapterZone::new(&geometry, 1);
        let loaded = load_open_chapters(&mut [&mut zone], |_| 0, &mut BufferedReader::new(region)).unwrap();
        assert_eq!(loaded, 31);
        assert!(!zone.is_full());
    }
}
