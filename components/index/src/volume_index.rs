//! The in-memory map from record names to the chapters that last held them.
//!
//! A volume index is one or two sub-indexes of delta lists whose values are
//! chapter numbers masked to `chapter_bits`. Sparse volumes split hooks into
//! their own sub-index, which covers every chapter, while the dense
//! sub-index only covers the dense chapters.
//!
//! Entries are never scanned out when chapters expire. Each list remembers
//! the oldest chapter it might still hold, and the first lookup that touches
//! a list after its chapters have fallen out of the window removes the stale
//! entries as it walks past them.
//!
//! Lists are split into contiguous runs, one per zone. Only the owning zone
//! mutates a run; the triage lookup of hooks is the one reader from outside,
//! so every zone sits behind its own mutex.

use bytes::{Buf, BufMut};
use dedupe_common::{bits_per, div_round_up, NO_CHAPTER, MAX_ZONES};
use dedupe_types::record::RecordName;
use parking_lot::Mutex;
use serde::Serialize;
use snafu::ensure;
use tracing::{debug, info, warn};

use crate::{
    delta::{self, DeltaEntry, DeltaZone, SavedDeltaList},
    err::{BadStateSnafu, CorruptDataSnafu, InvalidArgumentSnafu, InvalidGeometrySnafu, Result},
    geometry::Geometry,
    storage::{BufferedReader, BufferedWriter},
};

const SPLIT_MAGIC: &[u8; 8] = b"MI6-0001";
const SUB_INDEX_MAGIC: &[u8; 8] = b"MI5-0005";
const GUARD_MAGIC: &[u8; 8] = b"MI-GUARD";
// magic, nonce, low, high, first list, list count
const SUB_INDEX_HEADER_BYTES: usize = 8 + 8 * 3 + 4 * 2;

const RECORDS_PER_LIST: u64 = 256;
const MIN_LISTS: u64 = (MAX_ZONES * MAX_ZONES) as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubIndexKind {
    Dense,
    Hook,
}

#[derive(Debug, Clone, Copy)]
struct SubIndexParams {
    address_bits:     u32,
    chapter_bits:     u32,
    mean_delta:       u32,
    list_count:       u32,
    chapter_count:    u64,
    bits_per_chapter: u64,
    memory_bits:      u64,
    target_free_bits: u64,
}

impl SubIndexParams {
    fn compute(records_per_chapter: u64, chapter_count: u64, volume_mean_delta: u32) -> Result<Self> {
        ensure!(
            records_per_chapter > 0,
            InvalidGeometrySnafu {
                reason: "cannot size a volume index for empty chapters",
            }
        );
        ensure!(
            chapter_count > 0,
            InvalidGeometrySnafu {
                reason: "cannot size a volume index for zero chapters",
            }
        );

        let list_count = (records_per_chapter * chapter_count / RECORDS_PER_LIST).max(MIN_LISTS);
        let address_bits = bits_per(volume_mean_delta as u64 * RECORDS_PER_LIST - 1);
        let chapter_bits = bits_per(chapter_count - 1);
        ensure!(
            list_count <= u32::MAX as u64,
            InvalidGeometrySnafu {
                reason: format!("{list_count} volume index lists is too many"),
            }
        );
        ensure!(
            address_bits <= 31,
            InvalidGeometrySnafu {
                reason: format!("{address_bits} volume index address bits is too many"),
            }
        );

        // Untouched lists keep expired entries around; allow for a few
        // chapters' worth of them.
        let invalid_chapters = (chapter_count / 256).max(2);
        let indexed_chapters = chapter_count + invalid_chapters;
        let entries = records_per_chapter * indexed_chapters;
        let mean_delta = u32::try_from((list_count << address_bits) / entries).map_err(|_| {
            InvalidGeometrySnafu {
                reason: "volume index mean delta does not fit in 32 bits",
            }
            .build()
        })?;

        let bits_per_chapter = delta::index_bits(records_per_chapter as u32, mean_delta, chapter_bits);
        let expected_bytes = bits_per_chapter * indexed_chapters / 8;
        Ok(Self {
            address_bits,
            chapter_bits,
            mean_delta,
            list_count: list_count as u32,
            chapter_count,
            bits_per_chapter,
            memory_bits: expected_bytes * 106 / 100 * 8,
            target_free_bits: expected_bytes / 20 * 8,
        })
    }
}

/// A run of chapters to flush, in masked chapter numbers.
#[derive(Debug, Clone, Copy)]
struct ChapterRange {
    start: u64,
    count: u64,
}

struct SubIndexZone {
    low:            u64,
    high:           u64,
    early_flushes:  u64,
    delta:          DeltaZone,
    /// Per list, the oldest chapter that may still have entries.
    flush_chapters: Vec<u64>,
}

impl SubIndexZone {
    fn slot(&self, list: u32) -> usize { (list - self.delta.first_list()) as usize }
}

struct SubIndex {
    kind:              SubIndexKind,
    address_bits:      u32,
    address_mask:      u64,
    chapter_mask:      u64,
    chapter_count:     u64,
    list_count:        u32,
    lists_per_zone:    u32,
    chapter_zone_bits: u64,
    max_zone_bits:     u64,
    nonce:             u64,
    zones:             Vec<Mutex<SubIndexZone>>,
}

struct SavedSubIndexZone {
    low:            u64,
    high:           u64,
    first_list:     u32,
    flush_chapters: Vec<u64>,
    lists:          Vec<SavedDeltaList>,
}

impl SubIndex {
    fn new(kind: SubIndexKind, params: SubIndexParams, zone_count: usize, nonce: u64) -> Self {
        let lists_per_zone = div_round_up(params.list_count as u64, zone_count as u64) as u32;
        let zone_bits = params.memory_bits / zone_count as u64;
        let zones = (0..zone_count as u32)
            .map(|z| {
                let first_list = z * lists_per_zone;
                let list_count = lists_per_zone.min(params.list_count - first_list);
                Mutex::new(SubIndexZone {
                    low:            0,
                    high:           0,
                    early_flushes:  0,
                    delta:          DeltaZone::new(
                        first_list,
                        list_count,
                        params.mean_delta,
                        params.chapter_bits,
                        zone_bits,
                    ),
                    flush_chapters: vec![0; list_count as usize],
                })
            })
            .collect();

        Self {
            kind,
            address_bits: params.address_bits,
            address_mask: (1 << params.address_bits) - 1,
            chapter_mask: (1 << params.chapter_bits) - 1,
            chapter_count: params.chapter_count,
            list_count: params.list_count,
            lists_per_zone,
            chapter_zone_bits: (params.bits_per_chapter / zone_count as u64).max(1),
            max_zone_bits: params.memory_bits.saturating_sub(params.target_free_bits) / zone_count as u64,
            nonce,
            zones,
        }
    }

    fn address(&self, name: &RecordName) -> u32 { (name.volume_index_bytes() & self.address_mask) as u32 }

    fn list(&self, name: &RecordName) -> u32 {
        ((name.volume_index_bytes() >> self.address_bits) % self.list_count as u64) as u32
    }

    fn zone_of_list(&self, list: u32) -> usize { (list / self.lists_per_zone) as usize }

    fn zone_of(&self, name: &RecordName) -> usize { self.zone_of_list(self.list(name)) }

    fn to_index_chapter(&self, virtual_chapter: u64) -> u32 { (virtual_chapter & self.chapter_mask) as u32 }

    fn to_virtual_chapter(&self, low: u64, index_chapter: u32) -> u64 {
        low + ((index_chapter as u64).wrapping_sub(low) & self.chapter_mask)
    }

    /// Step to the next entry, removing every entry inside `range` on the way.
    fn flush_invalid_entries(
        &self,
        delta: &mut DeltaZone,
        entry: &mut DeltaEntry,
        range: ChapterRange,
        next_to_invalidate: &mut u64,
    ) -> Result<()> {
        delta.next(entry)?;
        while !entry.at_end {
            let index_chapter = delta.value(entry) as u64;
            let relative = index_chapter.wrapping_sub(range.start) & self.chapter_mask;
            if relative >= range.count {
                *next_to_invalidate = (*next_to_invalidate).min(relative);
                break;
            }
            delta.remove_entry(entry)?;
        }
        Ok(())
    }

    /// Find `key` (and `name` among its collisions) while flushing the whole
    /// list, then narrow `range` to the oldest chapter still present.
    fn search_and_flush(
        &self,
        delta: &mut DeltaZone,
        list: u32,
        key: u32,
        name: &RecordName,
        range: &mut ChapterRange,
    ) -> Result<DeltaEntry> {
        let mut next_to_invalidate = self.chapter_mask;
        let mut entry = DeltaEntry::start(list);
        loop {
            self.flush_invalid_entries(delta, &mut entry, *range, &mut next_to_invalidate)?;
            if entry.at_end || key <= entry.key {
                break;
            }
        }

        let mut other = entry;
        if entry.is_found(key) {
            loop {
                self.flush_invalid_entries(delta, &mut other, *range, &mut next_to_invalidate)?;
                if other.at_end || !other.is_collision {
                    break;
                }
                if delta.collision_name(&other) == *name {
                    entry = other;
                    break;
                }
            }
        }
        while !other.at_end {
            self.flush_invalid_entries(delta, &mut other, *range, &mut next_to_invalidate)?;
        }

        range.start = (next_to_invalidate + range.start) & self.chapter_mask;
        range.count = 0;
        Ok(entry)
    }

    fn get_record(&self, name: &RecordName) -> Result<VolumeIndexRecord> {
        let key = self.address(name);
        let list = self.list(name);
        let zone_number = self.zone_of_list(list);
        let mut zone = self.zones[zone_number].lock();
        let zone = &mut *zone;

        let slot = zone.slot(list);
        let flush_chapter = zone.flush_chapters[slot];
        let entry = if flush_chapter < zone.low {
            let flush_count = zone.low - flush_chapter;
            let mut range = ChapterRange {
                start: self.to_index_chapter(flush_chapter) as u64,
                count: flush_count.min(self.chapter_mask + 1),
            };
            let entry = self.search_and_flush(&mut zone.delta, list, key, name, &mut range)?;
            zone.flush_chapters[slot] = self
                .to_virtual_chapter(zone.low, range.start as u32)
                .min(zone.high);
            entry
        } else {
            zone.delta.get_entry(list, key, Some(name))?
        };

        let is_found = entry.is_found(key);
        let virtual_chapter = if is_found {
            self.to_virtual_chapter(zone.low, zone.delta.value(&entry))
        } else {
            NO_CHAPTER
        };
        Ok(VolumeIndexRecord {
            name: *name,
            is_found,
            is_collision: entry.is_collision,
            virtual_chapter,
            kind: self.kind,
            zone: zone_number,
            key,
            entry,
            removed: false,
        })
    }

    fn check_window(&self, zone: &SubIndexZone, virtual_chapter: u64) -> Result<()> {
        ensure!(
            virtual_chapter >= zone.low && virtual_chapter <= zone.high,
            InvalidArgumentSnafu {
                reason: format!(
                    "chapter {virtual_chapter} is outside the valid range {} to {}",
                    zone.low, zone.high
                ),
            }
        );
        Ok(())
    }

    fn put_record(&self, record: &mut VolumeIndexRecord, virtual_chapter: u64) -> Result<()> {
        let mut zone = self.zones[record.zone].lock();
        self.check_window(&zone, virtual_chapter)?;
        let name = record.is_found.then_some(record.name);
        let result = zone.delta.put_entry(
            &mut record.entry,
            record.key,
            self.to_index_chapter(virtual_chapter),
            name.as_ref(),
        );
        match result {
            Ok(()) => {
                record.virtual_chapter = virtual_chapter;
                record.is_collision = record.entry.is_collision;
                record.is_found = true;
                Ok(())
            }
            Err(e) => {
                if e.is_overflow() {
                    warn!(
                        "volume index entry for {} dropped: delta list {} overflowed",
                        record.name, record.entry.list
                    );
                }
                Err(e)
            }
        }
    }

    fn set_record_chapter(&self, record: &mut VolumeIndexRecord, virtual_chapter: u64) -> Result<()> {
        let mut zone = self.zones[record.zone].lock();
        self.check_window(&zone, virtual_chapter)?;
        zone.delta
            .set_value(&record.entry, self.to_index_chapter(virtual_chapter))?;
        record.virtual_chapter = virtual_chapter;
        Ok(())
    }

    fn remove_record(&self, record: &mut VolumeIndexRecord) -> Result<()> {
        let mut zone = self.zones[record.zone].lock();
        zone.delta.remove_entry(&mut record.entry)
    }

    fn set_zone_open_chapter(&self, zone_number: usize, virtual_chapter: u64) {
        let mut zone = self.zones[zone_number].lock();
        zone.low = (virtual_chapter + 1).saturating_sub(self.chapter_count);
        zone.high = virtual_chapter;

        let used_bits = zone.delta.bits_used();
        if used_bits <= self.max_zone_bits {
            return;
        }
        let expire_count = 1 + (used_bits - self.max_zone_bits) / self.chapter_zone_bits;
        if expire_count == 1 {
            info!(
                "zone {zone_number}: at chapter {virtual_chapter}, expiring chapter {} early",
                zone.low
            );
            zone.early_flushes += 1;
            zone.low += 1;
        } else {
            let first_expired = zone.low;
            if first_expired + expire_count < zone.high {
                zone.early_flushes += expire_count;
                zone.low += expire_count;
            } else {
                zone.early_flushes += zone.high - zone.low;
                zone.low = zone.high;
            }
            info!(
                "zone {zone_number}: at chapter {virtual_chapter}, expiring chapters {first_expired} to {} early",
                zone.low - 1
            );
        }
    }

    /// Read-only lookup, used to decide whether a sparse chapter is wanted.
    fn lookup(&self, name: &RecordName) -> Option<u64> {
        let key = self.address(name);
        let list = self.list(name);
        let zone = self.zones[self.zone_of_list(list)].lock();
        let entry = zone.delta.get_entry(list, key, Some(name)).ok()?;
        if !entry.is_found(key) {
            return None;
        }
        let virtual_chapter = self.to_virtual_chapter(zone.low, zone.delta.value(&entry));
        (virtual_chapter <= zone.high).then_some(virtual_chapter)
    }

    fn reset(&self) {
        for zone in &self.zones {
            let mut zone = zone.lock();
            zone.delta.empty();
            zone.flush_chapters.fill(0);
            zone.low = 0;
            zone.high = 0;
        }
    }

    fn stats(&self) -> VolumeIndexStats {
        let mut stats = VolumeIndexStats::default();
        for zone in &self.zones {
            let zone = zone.lock();
            let delta = zone.delta.stats();
            stats.record_count += delta.record_count;
            stats.collision_count += delta.collision_count;
            stats.discard_count += delta.discard_count;
            stats.overflow_count += delta.overflow_count;
            stats.list_count += delta.list_count;
            stats.bits_used += delta.bits_used;
            stats.bits_allowed += delta.bits_allowed;
            stats.early_flushes += zone.early_flushes;
        }
        stats
    }

    fn save_zone(&self, zone_number: usize, writer: &mut BufferedWriter) -> Result<()> {
        let zone = self.zones[zone_number].lock();
        let mut buf = Vec::with_capacity(SUB_INDEX_HEADER_BYTES + zone.flush_chapters.len() * 8);
        buf.put_slice(SUB_INDEX_MAGIC);
        buf.put_u64_le(self.nonce);
        buf.put_u64_le(zone.low);
        buf.put_u64_le(zone.high);
        buf.put_u32_le(zone.delta.first_list());
        buf.put_u32_le(zone.delta.list_count());
        for chapter in &zone.flush_chapters {
            buf.put_u64_le(*chapter);
        }
        writer.write_all(&buf)?;
        zone.delta
            .save(zone_number as u32, self.zones.len() as u32, writer)
    }

    fn read_zone(&self, reader: &mut BufferedReader) -> Result<SavedSubIndexZone> {
        let raw = reader.read_vec(SUB_INDEX_HEADER_BYTES)?;
        let mut buf = raw.as_slice();
        ensure!(
            buf[..SUB_INDEX_MAGIC.len()] == SUB_INDEX_MAGIC[..],
            CorruptDataSnafu {
                reason: "volume index save has a bad magic number",
            }
        );
        buf.advance(SUB_INDEX_MAGIC.len());
        let nonce = buf.get_u64_le();
        ensure!(
            nonce == self.nonce,
            CorruptDataSnafu {
                reason: format!("volume index nonce {nonce:#x} is not {:#x}", self.nonce),
            }
        );
        let low = buf.get_u64_le();
        let high = buf.get_u64_le();
        let first_list = buf.get_u32_le();
        let list_count = buf.get_u32_le();
        ensure!(
            first_list as u64 + list_count as u64 <= self.list_count as u64,
            CorruptDataSnafu {
                reason: format!(
                    "saved lists {first_list}..{} exceed {} volume index lists",
                    first_list as u64 + list_count as u64,
                    self.list_count
                ),
            }
        );

        let raw = reader.read_vec(list_count as usize * 8)?;
        let mut buf = raw.as_slice();
        let flush_chapters = (0..list_count).map(|_| buf.get_u64_le()).collect();

        let (header, lists) = DeltaZone::read_saved(reader)?;
        ensure!(
            header.first_list == first_list && header.list_count == list_count,
            CorruptDataSnafu {
                reason: "volume index and delta index saves disagree on their lists",
            }
        );
        Ok(SavedSubIndexZone {
            low,
            high,
            first_list,
            flush_chapters,
            lists,
        })
    }

    /// Install saved zones, which may have been written by a different
    /// number of zones than this index has.
    fn restore(&self, saved: Vec<SavedSubIndexZone>) -> Result<()> {
        let Some(first) = saved.first() else {
            return BadStateSnafu {
                reason: "no volume index streams to restore",
            }
            .fail();
        };
        let high = first.high;
        let mut low = first.low;
        for (i, s) in saved.iter().enumerate() {
            ensure!(
                s.high == high,
                CorruptDataSnafu {
                    reason: format!(
                        "inconsistent volume index zone saves: stream 0 ends at chapter {high}, stream {i} at {}",
                        s.high
                    ),
                }
            );
            low = low.max(s.low);
        }

        self.reset();
        for zone in &self.zones {
            let mut zone = zone.lock();
            zone.low = low;
            zone.high = high;
            zone.early_flushes = 0;
        }

        let mut restored = 0u64;
        for s in saved {
            for (i, chapter) in s.flush_chapters.into_iter().enumerate() {
                let list = s.first_list + i as u32;
                let mut zone = self.zones[self.zone_of_list(list)].lock();
                let slot = zone.slot(list);
                zone.flush_chapters[slot] = chapter;
            }
            for list in s.lists {
                let mut zone = self.zones[self.zone_of_list(list.list)].lock();
                zone.delta.restore_list(list)?;
                restored += 1;
            }
        }
        ensure!(
            restored == self.list_count as u64,
            CorruptDataSnafu {
                reason: format!("restored {restored} of {} volume index lists", self.list_count),
            }
        );
        Ok(())
    }
}

/// The result of looking a name up, and the cursor used to change its entry.
///
/// A record stays valid until its zone's next volume index mutation.
#[derive(Debug, Clone)]
pub struct VolumeIndexRecord {
    pub name:            RecordName,
    pub is_found:        bool,
    /// The entry is a collision carrying the full name.
    pub is_collision:    bool,
    /// The chapter of a found entry, `NO_CHAPTER` otherwise.
    pub virtual_chapter: u64,
    kind:                SubIndexKind,
    zone:                usize,
    key:                 u32,
    entry:               DeltaEntry,
    removed:             bool,
}

impl VolumeIndexRecord {
    fn check_usable(&self) -> Result<()> {
        ensure!(
            !self.removed,
            BadStateSnafu {
                reason: "volume index record was already removed",
            }
        );
        ensure!(
            self.is_found,
            BadStateSnafu {
                reason: "illegal operation on a new volume index record",
            }
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VolumeIndexStats {
    pub record_count:    u64,
    pub collision_count: u64,
    pub discard_count:   u64,
    pub overflow_count:  u64,
    pub list_count:      u32,
    pub early_flushes:   u64,
    pub bits_used:       u64,
    pub bits_allowed:    u64,
}

/// Parameters the volume index is sized from.
#[derive(Debug, Clone, Copy)]
pub struct VolumeIndexConfig {
    pub zone_count:  usize,
    pub mean_delta:  u32,
    pub sample_rate: u32,
    pub nonce:       u64,
}

pub struct VolumeIndex {
    sample_rate: u32,
    zone_count:  usize,
    dense:       SubIndex,
    hook:        Option<SubIndex>,
}

impl VolumeIndex {
    pub fn new(geometry: &Geometry, config: VolumeIndexConfig) -> Result<Self> {
        ensure!(
            (1..=MAX_ZONES).contains(&config.zone_count),
            InvalidArgumentSnafu {
                reason: format!("zone count {} not in 1..={MAX_ZONES}", config.zone_count),
            }
        );
        let records_per_chapter = geometry.records_per_chapter as u64;

        if !geometry.is_sparse() {
            let params = SubIndexParams::compute(
                records_per_chapter,
                geometry.chapters_per_volume as u64,
                config.mean_delta,
            )?;
            debug!("dense volume index: {params:?}");
            return Ok(Self {
                sample_rate: 0,
                zone_count:  config.zone_count,
                dense:       SubIndex::new(SubIndexKind::Dense, params, config.zone_count, config.nonce),
                hook:        None,
            });
        }

        ensure!(
            config.sample_rate > 0,
            InvalidGeometrySnafu {
                reason: "a sparse volume index needs a sample rate",
            }
        );
        let hook_records = records_per_chapter / config.sample_rate as u64;
        ensure!(
            hook_records > 0,
            InvalidGeometrySnafu {
                reason: format!(
                    "sample rate {} leaves no hooks in a chapter of {records_per_chapter} records",
                    config.sample_rate
                ),
            }
        );
        let dense_params = SubIndexParams::compute(
            records_per_chapter - hook_records,
            geometry.dense_chapters_per_volume as u64,
            config.mean_delta,
        )?;
        let hook_params = SubIndexParams::compute(
            hook_records,
            geometry.chapters_per_volume as u64,
            config.mean_delta,
        )?;
        debug!("split volume index: dense {dense_params:?}, hooks {hook_params:?}");
        Ok(Self {
            sample_rate: config.sample_rate,
            zone_count:  config.zone_count,
            dense:       SubIndex::new(SubIndexKind::Dense, dense_params, config.zone_count, config.nonce),
            hook:        Some(SubIndex::new(SubIndexKind::Hook, hook_params, config.zone_count, config.nonce)),
        })
    }

    /// Whether `name` is tracked as a hook.
    pub fn is_sample(&self, name: &RecordName) -> bool {
        self.hook.is_some() && name.is_sample(self.sample_rate)
    }

    fn sub_index(&self, name: &RecordName) -> &SubIndex {
        match &self.hook {
            Some(hook) if name.is_sample(self.sample_rate) => hook,
            _ => &self.dense,
        }
    }

    fn sub_index_of(&self, record: &VolumeIndexRecord) -> Result<&SubIndex> {
        match record.kind {
            SubIndexKind::Dense => Ok(&self.dense),
            SubIndexKind::Hook => self.hook.as_ref().ok_or_else(|| {
                BadStateSnafu {
                    reason: "hook record from an index without hooks",
                }
                .build()
            }),
        }
    }

    /// The zone that owns `name`.
    pub fn get_zone(&self, name: &RecordName) -> usize { self.sub_index(name).zone_of(name) }

    pub fn get_record(&self, name: &RecordName) -> Result<VolumeIndexRecord> {
        self.sub_index(name).get_record(name)
    }

    /// Index the record in `virtual_chapter`. A found record gains a
    /// collision entry carrying its full name.
    pub fn put_record(&self, record: &mut VolumeIndexRecord, virtual_chapter: u64) -> Result<()> {
        ensure!(
            !record.removed,
            BadStateSnafu {
                reason: "volume index record was already removed",
            }
        );
        self.sub_index_of(record)?.put_record(record, virtual_chapter)
    }

    pub fn set_record_chapter(&self, record: &mut VolumeIndexRecord, virtual_chapter: u64) -> Result<()> {
        record.check_usable()?;
        self.sub_index_of(record)?
            .set_record_chapter(record, virtual_chapter)
    }

    pub fn remove_record(&self, record: &mut VolumeIndexRecord) -> Result<()> {
        record.check_usable()?;
        record.removed = true;
        self.sub_index_of(record)?.remove_record(record)
    }

    pub fn set_zone_open_chapter(&self, zone: usize, virtual_chapter: u64) {
        self.dense.set_zone_open_chapter(zone, virtual_chapter);
        if let Some(hook) = &self.hook {
            hook.set_zone_open_chapter(zone, virtual_chapter);
        }
    }

    pub fn set_open_chapter(&self, virtual_chapter: u64) {
        for zone in 0..self.zone_count {
            self.set_zone_open_chapter(zone, virtual_chapter);
        }
    }

    /// The chapter a hook was last indexed in, if it is still live. Safe to
    /// call from outside the owning zone.
    pub fn lookup_name(&self, name: &RecordName) -> Option<u64> {
        if !self.is_sample(name) {
            return None;
        }
        self.hook.as_ref()?.lookup(name)
    }

    /// Drop every entry, as before a rebuild.
    pub fn reset(&self) {
        self.dense.reset();
        if let Some(hook) = &self.hook {
            hook.reset();
        }
    }

    /// Statistics of the dense and hook sub-indexes.
    pub fn stats(&self) -> (VolumeIndexStats, VolumeIndexStats) {
        let sparse = self.hook.as_ref().map(SubIndex::stats).unwrap_or_default();
        (self.dense.stats(), sparse)
    }

    /// Write every zone, one after another, behind the zone count.
    pub fn save(&self, writer: &mut BufferedWriter) -> Result<()> {
        writer.write_all(&(self.zone_count as u32).to_le_bytes())?;
        for zone in 0..self.zone_count {
            if let Some(hook) = &self.hook {
                let mut buf = Vec::with_capacity(SPLIT_MAGIC.len() + 4);
                buf.put_slice(SPLIT_MAGIC);
                buf.put_u32_le(self.sample_rate);
                writer.write_all(&buf)?;
                self.dense.save_zone(zone, writer)?;
                hook.save_zone(zone, writer)?;
            } else {
                self.dense.save_zone(zone, writer)?;
            }
            writer.write_all(GUARD_MAGIC)?;
        }
        writer.flush()?;
        info!("saved volume index in {} zones", self.zone_count);
        Ok(())
    }

    /// Restore from a stream written by [`VolumeIndex::save`] with any zone
    /// count.
    pub fn load(&self, reader: &mut BufferedReader) -> Result<()> {
        let saved_zones = reader.read_vec(4)?.as_slice().get_u32_le() as usize;
        ensure!(
            (1..=MAX_ZONES).contains(&saved_zones),
            CorruptDataSnafu {
                reason: format!("volume index saved with {saved_zones} zones"),
            }
        );
        let mut dense = Vec::with_capacity(saved_zones);
        let mut hooks = Vec::with_capacity(saved_zones);
        for _ in 0..saved_zones {
            if self.hook.is_some() {
                let raw = reader.read_vec(SPLIT_MAGIC.len() + 4)?;
                let mut buf = raw.as_slice();
                ensure!(
                    buf[..SPLIT_MAGIC.len()] == SPLIT_MAGIC[..],
                    CorruptDataSnafu {
                        reason: "volume index save has a bad magic number",
                    }
                );
                buf.advance(SPLIT_MAGIC.len());
                let rate = buf.get_u32_le();
                ensure!(
                    rate == self.sample_rate,
                    CorruptDataSnafu {
                        reason: format!("saved sample rate {rate} is not {}", self.sample_rate),
                    }
                );
            }
            dense.push(self.dense.read_zone(reader)?);
            if let Some(hook) = &self.hook {
                hooks.push(hook.read_zone(reader)?);
            }
            ensure!(
                reader.check_bytes(GUARD_MAGIC)?,
                CorruptDataSnafu {
                    reason: "volume index save is missing its guard",
                }
            );
        }

        self.dense.restore(dense)?;
        if let Some(hook) = &self.hook {
            hook.restore(hooks)?;
        }
        info!(
            "loaded volume index saved in {saved_zones} zones into {} zones",
            self.zone_count
        );
        Ok(())
    }

    /// Bytes a save may need with any zone count, for laying out its region.
    pub fn save_bytes(&self) -> u64 {
        let sub_bytes = |sub: &SubIndex| {
            let budget: u64 = sub.zones.iter().map(|z| z.lock().delta.bit_budget()).sum();
            MAX_ZONES as u64 * (SUB_INDEX_HEADER_BYTES + 64) as u64
                + (sub.list_count as u64 + MAX_ZONES as u64) * (8 + 2 + 1)
                + budget / 8
                + MAX_ZONES as u64
        };
        let hook_bytes = self.hook.as_ref().map(sub_bytes).unwrap_or(0);
        4 + MAX_ZONES as u64 * (SPLIT_MAGIC.len() + 4 + GUARD_MAGIC.len()) as u64
            + sub_bytes(&self.dense)
            + hook_bytes
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::storage::{BlockStore, MemoryStore, Region};

    fn geometry(chapters: u32, sparse: u32) -> Geometry { Geometry::new(256, 4, chapters, sparse).unwrap() }

    fn config(zone_count: usize) -> VolumeIndexConfig {
        VolumeIndexConfig {
            zone_count,
            mean_delta: 4096,
            sample_rate: 0,
            nonce: 42,
        }
    }

    fn names(count: usize, seed: u64) -> Vec<RecordName> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count).map(|_| RecordName::new(rng.gen())).collect()
    }

    fn put(index: &VolumeIndex, name: &RecordName, chapter: u64) {
        let mut record = index.get_record(name).unwrap();
        if record.is_found {
            index.set_record_chapter(&mut record, chapter).unwrap();
        } else {
            index.put_record(&mut record, chapter).unwrap();
        }
    }

    fn chapter_of(index: &VolumeIndex, name: &RecordName) -> Option<u64> {
        let record = index.get_record(name).unwrap();
        record.is_found.then_some(record.virtual_chapter)
    }

    #[test]
    fn records_land_in_their_chapter() {
        let index = VolumeIndex::new(&geometry(16, 0), config(1)).unwrap();
        index.set_open_chapter(3);
        let names = names(100, 1);
        for n in &names {
            put(&index, n, 3);
        }
        for n in &names {
            assert_eq!(chapter_of(&index, n), Some(3));
        }
        assert_eq!(index.stats().0.record_count, 100);
        assert!(chapter_of(&index, &RecordName::new([0xab; 16])).is_none());
    }

    #[test]
    fn expired_chapters_vanish_on_touch() {
        let index = VolumeIndex::new(&geometry(4, 0), config(1)).unwrap();
        let names = names(40, 2);
        for chapter in 0..4u64 {
            index.set_open_chapter(chapter);
            for n in &names[chapter as usize * 10..(chapter as usize + 1) * 10] {
                put(&index, n, chapter);
            }
        }
        index.set_open_chapter(5);
        for (i, n) in names.iter().enumerate() {
            let expected = (i / 10) as u64;
            if expected < 2 {
                assert_eq!(chapter_of(&index, n), None);
            } else {
                assert_eq!(chapter_of(&index, n), Some(expected));
            }
        }
        assert_eq!(index.stats().0.record_count, 20);
        assert!(index.stats().0.discard_count >= 20);
    }

    #[test]
    fn touching_a_record_moves_it_forward() {
        let index = VolumeIndex::new(&geometry(4, 0), config(1)).unwrap();
        let name = names(1, 3)[0];
        index.set_open_chapter(0);
        put(&index, &name, 0);
        index.set_open_chapter(3);
        put(&index, &name, 3);
        index.set_open_chapter(6);
        assert_eq!(chapter_of(&index, &name), Some(3));
        assert_eq!(index.stats().0.record_count, 1);
    }

    #[test]
    fn colliding_names_are_kept_apart() {
        let index = VolumeIndex::new(&geometry(8, 0), config(1)).unwrap();
        index.set_open_chapter(5);
        let mut a = [7u8; 16];
        let mut b = [7u8; 16];
        a[12] = 1;
        b[12] = 2;
        let (a, b) = (RecordName::new(a), RecordName::new(b));

        let mut record = index.get_record(&a).unwrap();
        index.put_record(&mut record, 4).unwrap();
        let mut record = index.get_record(&b).unwrap();
        assert!(record.is_found && !record.is_collision);
        index.put_record(&mut record, 5).unwrap();
        assert!(record.is_collision);

        let found = index.get_record(&b).unwrap();
        assert!(found.is_collision);
        assert_eq!(found.virtual_chapter, 5);
        assert_eq!(chapter_of(&index, &a), Some(4));
        assert_eq!(index.stats().0.collision_count, 1);

        let mut record = index.get_record(&a).unwrap();
        index.remove_record(&mut record).unwrap();
        assert!(index.remove_record(&mut record).is_err());
        let survivor = index.get_record(&b).unwrap();
        assert!(survivor.is_found && !survivor.is_collision);
        assert_eq!(survivor.virtual_chapter, 5);
    }

    #[test]
    fn puts_outside_the_window_are_refused() {
        let index = VolumeIndex::new(&geometry(4, 0), config(2)).unwrap();
        index.set_open_chapter(10);
        let name = names(1, 4)[0];
        let mut record = index.get_record(&name).unwrap();
        let err = index.put_record(&mut record, 6).unwrap_err();
        assert!(matches!(err, crate::err::Error::InvalidArgument { .. }));
        index.put_record(&mut record, 7).unwrap();
        assert_eq!(chapter_of(&index, &name), Some(7));
    }

    #[test]
    fn zones_partition_names() {
        let index = VolumeIndex::new(&geometry(8, 0), config(4)).unwrap();
        let mut seen = [0usize; 4];
        for n in names(400, 5) {
            seen[index.get_zone(&n)] += 1;
        }
        assert!(seen.iter().all(|count| *count > 0));
    }

    #[test]
    fn save_and_load_with_another_zone_count() {
        let geometry = geometry(8, 0);
        let saved = VolumeIndex::new(&geometry, config(2)).unwrap();
        let names = names(200, 6);
        for chapter in 0..5u64 {
            saved.set_open_chapter(chapter);
            for n in &names[chapter as usize * 40..(chapter as usize + 1) * 40] {
                let mut record = saved.get_record(n).unwrap();
                saved.put_record(&mut record, chapter).unwrap();
            }
        }

        let store: Arc<dyn BlockStore> = Arc::new(MemoryStore::new(1 << 20));
        let region = Region::new(store, "volume index", 0, saved.save_bytes());
        saved.save(&mut BufferedWriter::new(region.clone())).unwrap();

        let loaded = VolumeIndex::new(&geometry, config(3)).unwrap();
        loaded.load(&mut BufferedReader::new(region.clone())).unwrap();
        for n in &names {
            assert_eq!(chapter_of(&loaded, n), chapter_of(&saved, n));
        }
        assert_eq!(loaded.stats().0.record_count, 200);

        let other_nonce = VolumeIndex::new(&geometry, VolumeIndexConfig { nonce: 7, ..config(1) }).unwrap();
        assert!(other_nonce
            .load(&mut BufferedReader::new(region))
            .unwrap_err()
            .is_corrupt());
    }

    #[test]
    fn hooks_outlive_the_dense_window() {
        let geometry = geometry(10, 5);
        let index = VolumeIndex::new(&geometry, VolumeIndexConfig {
            sample_rate: 4,
            ..config(1)
        })
        .unwrap();
        let mut hook = [1u8; 16];
        hook[14] = 0;
        hook[15] = 8;
        let mut plain = [2u8; 16];
        plain[14] = 0;
        plain[15] = 9;
        let (hook, plain) = (RecordName::new(hook), RecordName::new(plain));
        assert!(index.is_sample(&hook) && !index.is_sample(&plain));

        index.set_open_chapter(0);
        put(&index, &hook, 0);
        put(&index, &plain, 0);
        assert_eq!(index.lookup_name(&hook), Some(0));
        assert_eq!(index.lookup_name(&plain), None);

        index.set_open_chapter(7);
        assert_eq!(chapter_of(&index, &hook), Some(0));
        assert_eq!(chapter_of(&index, &plain), None);
        index.set_open_chapter(10);
        assert_eq!(index.lookup_name(&hook), None);
        assert_eq!(chapter_of(&index, &hook), None);
    }
}
