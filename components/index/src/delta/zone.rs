use bytes::{Buf, BufMut};
use dedupe_types::record::RecordName;
use serde::Serialize;
use snafu::ensure;
use tracing::warn;

use super::{bits, DeltaCoding, DeltaEntry, DeltaListView, MAX_LIST_BITS};
use crate::{
    err::{
        CorruptDataSnafu, DuplicateNameSnafu, InvalidArgumentSnafu, OverflowSnafu, Result,
    },
    storage::{BufferedReader, BufferedWriter},
};

pub const DELTA_INDEX_MAGIC: &[u8; 8] = b"DI-00002";

// magic, zone, zone count, first list, list count, records, collisions
const SAVED_HEADER_BYTES: usize = 8 + 4 * 4 + 8 * 2;

#[derive(Debug, Clone, Default)]
struct DeltaList {
    bits: Vec<u8>,
    size: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeltaZoneStats {
    pub record_count:    u64,
    pub collision_count: u64,
    pub discard_count:   u64,
    pub overflow_count:  u64,
    pub list_count:      u32,
    pub bits_used:       u64,
    pub bits_allowed:    u64,
}

impl std::ops::AddAssign for DeltaZoneStats {
    fn add_assign(&mut self, rhs: Self) {
        self.record_count += rhs.record_count;
        self.collision_count += rhs.collision_count;
        self.discard_count += rhs.discard_count;
        self.overflow_count += rhs.overflow_count;
        self.list_count += rhs.list_count;
        self.bits_used += rhs.bits_used;
        self.bits_allowed = self.bits_allowed.saturating_add(rhs.bits_allowed);
    }
}

/// Header of one saved zone stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedZoneHeader {
    pub zone:            u32,
    pub zone_count:      u32,
    pub first_list:      u32,
    pub list_count:      u32,
    pub record_count:    u64,
    pub collision_count: u64,
}

/// One list read back from a save stream.
#[derive(Debug, Clone)]
pub struct SavedDeltaList {
    pub list: u32,
    pub size: u32,
    pub bits: Vec<u8>,
}

/// A mutable range of delta lists, owned by a single zone.
///
/// Each list is its own bit string, so inserting into one list never moves
/// another. The zone as a whole is held to a bit budget.
#[derive(Debug, Clone)]
pub struct DeltaZone {
    pub coding:      DeltaCoding,
    first_list:      u32,
    lists:           Vec<DeltaList>,
    bit_budget:      u64,
    bits_used:       u64,
    record_count:    u64,
    collision_count: u64,
    discard_count:   u64,
    overflow_count:  u64,
}

impl DeltaZone {
    pub fn new(first_list: u32, list_count: u32, mean_delta: u32, value_bits: u32, bit_budget: u64) -> Self {
        Self {
            coding: DeltaCoding::new(mean_delta, value_bits),
            first_list,
            lists: vec![DeltaList::default(); list_count as usize],
            bit_budget,
            bits_used: 0,
            record_count: 0,
            collision_count: 0,
            discard_count: 0,
            overflow_count: 0,
        }
    }

    pub fn first_list(&self) -> u32 { self.first_list }

    pub fn list_count(&self) -> u32 { self.lists.len() as u32 }

    pub fn contains(&self, list: u32) -> bool {
        list >= self.first_list && list < self.first_list + self.list_count()
    }

    fn slot(&self, list: u32) -> usize {
        debug_assert!(self.contains(list), "list {list} is not in this zone");
        (list - self.first_list) as usize
    }

    pub fn list_size(&self, list: u32) -> u32 { self.lists[self.slot(list)].size }

    pub fn list_bytes(&self, list: u32) -> &[u8] { &self.lists[self.slot(list)].bits }

    pub fn view(&self, list: u32) -> DeltaListView<'_> {
        let l = &self.lists[self.slot(list)];
        DeltaListView {
            coding: &self.coding,
            mem:    &l.bits,
            start:  0,
            size:   l.size,
        }
    }

    /// Drop every entry, keeping the statistics.
    pub fn empty(&mut self) {
        for l in self.lists.iter_mut() {
            *l = DeltaList::default();
        }
        self.bits_used = 0;
        self.record_count = 0;
        self.collision_count = 0;
    }

    pub fn get_entry(&self, list: u32, key: u32, name: Option<&RecordName>) -> Result<DeltaEntry> {
        self.view(list).find(list, key, name)
    }

    pub fn next(&self, entry: &mut DeltaEntry) -> Result<()> { self.view(entry.list).next(entry) }

    pub fn value(&self, entry: &DeltaEntry) -> u32 { self.view(entry.list).value(entry) }

    pub fn collision_name(&self, entry: &DeltaEntry) -> RecordName {
        self.view(entry.list).collision_name(entry)
    }

    pub fn set_value(&mut self, entry: &DeltaEntry, value: u32) -> Result<()> {
        self.check_value(value)?;
        ensure!(
            !entry.at_end,
            InvalidArgumentSnafu {
                reason: "cannot set the value past the end of a list",
            }
        );
        let value_bits = self.coding.value_bits;
        let slot = self.slot(entry.list);
        bits::set_field(&mut self.lists[slot].bits, value, entry.offset as u64, value_bits);
        Ok(())
    }

    fn check_value(&self, value: u32) -> Result<()> {
        ensure!(
            self.coding.value_bits >= 32 || value < (1 << self.coding.value_bits),
            InvalidArgumentSnafu {
                reason: format!("value {value} is wider than {} bits", self.coding.value_bits),
            }
        );
        Ok(())
    }

    fn insert_bits(&mut self, list: u32, offset: u32, count: u32) -> Result<()> {
        let slot = self.slot(list);
        let l = &mut self.lists[slot];
        let new_size = l.size + count;
        if new_size > MAX_LIST_BITS || self.bits_used + count as u64 > self.bit_budget {
            self.overflow_count += 1;
            return OverflowSnafu { list }.fail();
        }
        // Slack past the end lets the word-sized field helpers run freely.
        l.bits.resize(bits::bytes_for(new_size as u64) + 8, 0);
        bits::move_bits(&mut l.bits, offset as u64, (offset + count) as u64, (l.size - offset) as u64);
        l.size = new_size;
        self.bits_used += count as u64;
        Ok(())
    }

    fn delete_bits(&mut self, list: u32, offset: u32, count: u32) {
        let slot = self.slot(list);
        let l = &mut self.lists[slot];
        let tail = l.size - offset - count;
        bits::move_bits(&mut l.bits, (offset + count) as u64, offset as u64, tail as u64);
        l.size -= count;
        l.bits.truncate(bits::bytes_for(l.size as u64) + 8);
        self.bits_used -= count as u64;
    }

    fn encode(&mut self, entry: &DeltaEntry, value: u32, name: Option<&RecordName>) {
        let coding = self.coding;
        let slot = self.slot(entry.list);
        coding.encode_entry(&mut self.lists[slot].bits, entry.offset as u64, value, entry.delta, name);
    }

    /// Insert `key` at the cursor returned by [`DeltaZone::get_entry`].
    ///
    /// With a `name` the new entry is a collision placed after the entry the
    /// cursor found; otherwise it goes in front of the cursor, re-encoding
    /// the delta of the entry that follows.
    pub fn put_entry(
        &mut self,
        entry: &mut DeltaEntry,
        key: u32,
        value: u32,
        name: Option<&RecordName>,
    ) -> Result<()> {
        self.check_value(value)?;
        ensure!(!entry.is_collision, DuplicateNameSnafu { list: entry.list });

        if let Some(name) = name {
            ensure!(
                entry.is_found(key),
                InvalidArgumentSnafu {
                    reason: format!("collision key {key} does not match entry key {}", entry.key),
                }
            );
            let mut collision = *entry;
            collision.offset += entry.entry_bits;
            collision.delta = 0;
            collision.is_collision = true;
            collision.entry_bits = self.coding.entry_bits(0, true);
            self.insert_bits(entry.list, collision.offset, collision.entry_bits)?;
            self.encode(&collision, value, Some(name));
            *entry = collision;
            self.collision_count += 1;
        } else if entry.at_end {
            ensure!(
                key >= entry.key,
                InvalidArgumentSnafu {
                    reason: format!("key {key} precedes the end of the list at {}", entry.key),
                }
            );
            let mut added = *entry;
            added.delta = key - entry.key;
            added.key = key;
            added.at_end = false;
            added.entry_bits = self.coding.entry_bits(added.delta, false);
            self.insert_bits(entry.list, added.offset, added.entry_bits)?;
            self.encode(&added, value, None);
            *entry = added;
        } else {
            let previous_key = entry.key - entry.delta;
            ensure!(
                key < entry.key && key >= previous_key,
                InvalidArgumentSnafu {
                    reason: format!("key {key} does not belong before entry key {}", entry.key),
                }
            );
            let next_value = self.value(entry);
            let old_bits = entry.entry_bits;

            let mut added = *entry;
            added.delta = key - previous_key;
            added.key = key;
            added.entry_bits = self.coding.entry_bits(added.delta, false);

            let mut following = *entry;
            following.delta = entry.key - key;
            following.entry_bits = self.coding.entry_bits(following.delta, false);
            following.offset = added.offset + added.entry_bits;

            self.insert_bits(entry.list, added.offset, added.entry_bits + following.entry_bits - old_bits)?;
            self.encode(&following, next_value, None);
            self.encode(&added, value, None);
            *entry = added;
        }
        self.record_count += 1;
        Ok(())
    }

    /// Remove the entry under the cursor, leaving the cursor on the entry
    /// that followed it.
    pub fn remove_entry(&mut self, entry: &mut DeltaEntry) -> Result<()> {
        ensure!(
            !entry.at_end,
            InvalidArgumentSnafu {
                reason: "cannot remove past the end of a list",
            }
        );
        let mut next = *entry;
        self.next(&mut next)?;

        if entry.is_collision {
            self.delete_bits(entry.list, entry.offset, entry.entry_bits);
            next.offset = entry.offset;
            self.collision_count -= 1;
        } else if next.at_end {
            self.delete_bits(entry.list, entry.offset, entry.entry_bits);
            next.key -= entry.delta;
            next.offset = entry.offset;
        } else {
            let next_value = self.value(&next);
            let old_bits = entry.entry_bits + next.entry_bits;
            if next.is_collision {
                // The collision takes over as the primary entry for this key.
                next.is_collision = false;
                self.collision_count -= 1;
            }
            next.delta += entry.delta;
            next.entry_bits = self.coding.entry_bits(next.delta, false);
            next.offset = entry.offset;
            self.delete_bits(entry.list, entry.offset, old_bits - next.entry_bits);
            self.encode(&next, next_value, None);
        }
        self.record_count -= 1;
        self.discard_count += 1;
        *entry = next;
        Ok(())
    }

    /// Drop every entry of one list, returning how many were dropped.
    pub fn clear_list(&mut self, list: u32) -> Result<u64> {
        let (mut records, mut collisions) = (0u64, 0u64);
        let mut entry = DeltaEntry::start(list);
        loop {
            self.next(&mut entry)?;
            if entry.at_end {
                break;
            }
            records += 1;
            collisions += entry.is_collision as u64;
        }
        let slot = self.slot(list);
        let old = std::mem::take(&mut self.lists[slot]);
        self.bits_used -= old.size as u64;
        self.record_count -= records;
        self.collision_count -= collisions;
        self.discard_count += records;
        Ok(records)
    }

    pub fn stats(&self) -> DeltaZoneStats {
        DeltaZoneStats {
            record_count:    self.record_count,
            collision_count: self.collision_count,
            discard_count:   self.discard_count,
            overflow_count:  self.overflow_count,
            list_count:      self.list_count(),
            bits_used:       self.bits_used,
            bits_allowed:    self.bit_budget,
        }
    }

    pub fn bits_used(&self) -> u64 { self.bits_used }

    pub fn bit_budget(&self) -> u64 { self.bit_budget }

    pub fn save(&self, zone: u32, zone_count: u32, writer: &mut BufferedWriter) -> Result<()> {
        let mut buf = Vec::with_capacity(SAVED_HEADER_BYTES + self.lists.len() * 2);
        buf.put_slice(DELTA_INDEX_MAGIC);
        buf.put_u32_le(zone);
        buf.put_u32_le(zone_count);
        buf.put_u32_le(self.first_list);
        buf.put_u32_le(self.list_count());
        buf.put_u64_le(self.record_count);
        buf.put_u64_le(self.collision_count);
        for l in &self.lists {
            buf.put_u16_le(l.size as u16);
        }
        writer.write_all(&buf)?;
        for l in &self.lists {
            writer.write_all(&l.bits[..bits::bytes_for(l.size as u64)])?;
        }
        Ok(())
    }

    /// Read one zone stream written by [`DeltaZone::save`].
    pub fn read_saved(reader: &mut BufferedReader) -> Result<(SavedZoneHeader, Vec<SavedDeltaList>)> {
        let raw = reader.read_vec(SAVED_HEADER_BYTES)?;
        let mut buf = raw.as_slice();
        ensure!(
            buf[..DELTA_INDEX_MAGIC.len()] == DELTA_INDEX_MAGIC[..],
            CorruptDataSnafu {
                reason: "delta index save is missing its magic",
            }
        );
        buf.advance(DELTA_INDEX_MAGIC.len());
        let header = SavedZoneHeader {
            zone:            buf.get_u32_le(),
            zone_count:      buf.get_u32_le(),
            first_list:      buf.get_u32_le(),
            list_count:      buf.get_u32_le(),
            record_count:    buf.get_u64_le(),
            collision_count: buf.get_u64_le(),
        };
        ensure!(
            header.zone < header.zone_count,
            CorruptDataSnafu {
                reason: format!("saved zone {} of {}", header.zone, header.zone_count),
            }
        );

        let raw = reader.read_vec(header.list_count as usize * 2)?;
        let mut sizes = raw.as_slice();
        let mut lists = Vec::with_capacity(header.list_count as usize);
        for i in 0..header.list_count {
            let size = sizes.get_u16_le() as u32;
            let bits = reader.read_vec(bits::bytes_for(size as u64))?;
            lists.push(SavedDeltaList {
                list: header.first_list + i,
                size,
                bits,
            });
        }
        Ok((header, lists))
    }

    /// Install a saved list, walking it to recount and validate its entries.
    pub fn restore_list(&mut self, saved: SavedDeltaList) -> Result<()> {
        ensure!(
            self.contains(saved.list),
            InvalidArgumentSnafu {
                reason: format!("list {} is not in this zone", saved.list),
            }
        );
        let mut bits = saved.bits;
        bits.resize(bits::bytes_for(saved.size as u64) + 8, 0);
        let view = DeltaListView {
            coding: &self.coding,
            mem:    &bits,
            start:  0,
            size:   saved.size,
        };
        let (mut records, mut collisions) = (0u64, 0u64);
        let mut entry = DeltaEntry::start(saved.list);
        loop {
            view.next(&mut entry)?;
            if entry.at_end {
                break;
            }
            records += 1;
            collisions += entry.is_collision as u64;
        }

        let slot = self.slot(saved.list);
        let old = std::mem::replace(&mut self.lists[slot], DeltaList {
            bits,
            size: saved.size,
        });
        self.bits_used = self.bits_used + saved.size as u64 - old.size as u64;
        if self.bits_used > self.bit_budget {
            warn!(
                "restored delta list {} leaves the zone {} bits over budget",
                saved.list,
                self.bits_used - self.bit_budget
            );
        }
        self.record_count += records;
        self.collision_count += collisions;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;
    use crate::storage::{MemoryStore, Region};

    fn name(i: u8) -> RecordName {
        let mut b = [0u8; 16];
        b[15] = i;
        RecordName::new(b)
    }

    fn put(zone: &mut DeltaZone, list: u32, key: u32, value: u32) {
        let mut entry = zone.get_entry(list, key, None).unwrap();
        zone.put_entry(&mut entry, key, value, None).unwrap();
    }

    fn keys(zone: &DeltaZone, list: u32) -> Vec<(u32, u32, bool)> {
        let mut out = vec![];
        let mut entry = DeltaEntry::start(list);
        loop {
            zone.next(&mut entry).unwrap();
            if entry.at_end {
                return out;
            }
            out.push((entry.key, zone.value(&entry), entry.is_collision));
        }
    }

    #[test]
    fn insert_in_front_reencodes_the_following_delta() {
        let mut zone = DeltaZone::new(0, 1, 256, 8, u64::MAX);
        put(&mut zone, 0, 1000, 1);
        put(&mut zone, 0, 10, 2);
        put(&mut zone, 0, 500, 3);
        put(&mut zone, 0, 5000, 4);
        assert_eq!(keys(&zone, 0), vec![(10, 2, false), (500, 3, false), (1000, 1, false), (5000, 4, false)]);
        assert_eq!(zone.stats().record_count, 4);
    }

    #[test]
    fn collisions_are_found_by_name() {
        let mut zone = DeltaZone::new(0, 1, 256, 8, u64::MAX);
        put(&mut zone, 0, 77, 1);
        let mut entry = zone.get_entry(0, 77, Some(&name(2))).unwrap();
        assert!(entry.is_found(77) && !entry.is_collision);
        zone.put_entry(&mut entry, 77, 2, Some(&name(2))).unwrap();

        let found = zone.get_entry(0, 77, Some(&name(2))).unwrap();
        assert!(found.is_collision);
        assert_eq!(zone.value(&found), 2);
        assert_eq!(zone.collision_name(&found), name(2));

        // an unknown name lands on the primary
        let other = zone.get_entry(0, 77, Some(&name(3))).unwrap();
        assert!(!other.is_collision);
        assert_eq!(zone.value(&other), 1);

        // a second collision on top of a collision is refused
        let mut again = zone.get_entry(0, 77, Some(&name(2))).unwrap();
        assert!(zone.put_entry(&mut again, 77, 9, Some(&name(2))).is_err());
        assert_eq!(zone.stats().collision_count, 1);
    }

    #[test]
    fn removing_a_primary_promotes_its_collision() {
        let mut zone = DeltaZone::new(0, 1, 256, 8, u64::MAX);
        put(&mut zone, 0, 40, 1);
        let mut entry = zone.get_entry(0, 40, None).unwrap();
        zone.put_entry(&mut entry, 40, 2, Some(&name(2))).unwrap();
        put(&mut zone, 0, 90, 3);

        let mut primary = zone.get_entry(0, 40, None).unwrap();
        zone.remove_entry(&mut primary).unwrap();
        assert_eq!(primary.key, 40);
        assert!(!primary.is_collision);
        assert_eq!(keys(&zone, 0), vec![(40, 2, false), (90, 3, false)]);
        assert_eq!(zone.stats().collision_count, 0);
        assert_eq!(zone.stats().discard_count, 1);

        let mut last = zone.get_entry(0, 90, None).unwrap();
        zone.remove_entry(&mut last).unwrap();
        assert!(last.at_end);
        assert_eq!(keys(&zone, 0), vec![(40, 2, false)]);
    }

    #[test]
    fn list_and_budget_overflow() {
        let mut zone = DeltaZone::new(0, 2, 256, 8, 40);
        put(&mut zone, 0, 1, 1);
        let mut entry = zone.get_entry(1, 4000, None).unwrap();
        let err = zone.put_entry(&mut entry, 4000, 1, None).unwrap_err();
        assert!(err.is_overflow());
        assert_eq!(zone.stats().overflow_count, 1);
        assert_eq!(keys(&zone, 1), vec![]);
    }

    #[test]
    fn clearing_a_list_leaves_the_others() {
        let mut zone = DeltaZone::new(0, 2, 256, 8, u64::MAX);
        put(&mut zone, 0, 5, 1);
        put(&mut zone, 0, 9, 2);
        put(&mut zone, 1, 7, 3);
        assert_eq!(zone.clear_list(0).unwrap(), 2);
        assert_eq!(keys(&zone, 0), vec![]);
        assert_eq!(keys(&zone, 1), vec![(7, 3, false)]);
        assert_eq!(zone.list_size(0), 0);
        assert_eq!(zone.stats().record_count, 1);
        assert_eq!(zone.stats().discard_count, 2);
    }

    #[test]
    fn values_must_fit() {
        let mut zone = DeltaZone::new(0, 1, 256, 4, u64::MAX);
        let mut entry = zone.get_entry(0, 3, None).unwrap();
        assert!(zone.put_entry(&mut entry, 3, 16, None).is_err());
        zone.put_entry(&mut entry, 3, 15, None).unwrap();
        zone.set_value(&entry, 7).unwrap();
        assert_eq!(keys(&zone, 0), vec![(3, 7, false)]);
    }

    #[test]
    fn save_and_restore_into_other_zones() {
        let mut zone = DeltaZone::new(0, 4, 256, 8, u64::MAX);
        for list in 0..4 {
            put(&mut zone, list, 10 * list + 3, list);
        }
        let store = Arc::new(MemoryStore::new(4096));
        let region = Region::new(store, "delta", 0, 4096);
        let mut writer = BufferedWriter::new(region.clone());
        zone.save(0, 1, &mut writer).unwrap();
        writer.flush().unwrap();

        let mut reader = BufferedReader::new(region);
        let (header, lists) = DeltaZone::read_saved(&mut reader).unwrap();
        assert_eq!(header.list_count, 4);
        assert_eq!(header.record_count, 4);

        let mut low = DeltaZone::new(0, 2, 256, 8, u64::MAX);
        let mut high = DeltaZone::new(2, 2, 256, 8, u64::MAX);
        for saved in lists {
            if low.contains(saved.list) {
                low.restore_list(saved).unwrap();
            } else {
                high.restore_list(saved).unwrap();
            }
        }
        assert_eq!(keys(&low, 1), vec![(13, 1, false)]);
        assert_eq!(keys(&high, 3), vec![(33, 3, false)]);
        assert_eq!(low.stats().record_count + high.stats().record_count, 4);
    }

    proptest! {
        #[test]
        fn lists_stay_sorted(ops in proptest::collection::vec((0u32..5000, any::<bool>()), 1..200)) {
            let mut zone = DeltaZone::new(0, 1, 256, 8, u64::MAX);
            let mut model = std::collections::BTreeSet::new();
            for (key, insert) in ops {
                let mut entry = zone.get_entry(0, key, None).unwrap();
                if insert && !entry.is_found(key) {
                    zone.put_entry(&mut entry, key, key % 256, None).unwrap();
                    model.insert(key);
                } else if !insert && entry.is_found(key) {
                    zone.remove_entry(&mut entry).unwrap();
                    model.remove(&key);
                }
            }
            let got: Vec<u32> = keys(&zone, 0).into_iter().map(|(k, _, _)| k).collect();
            prop_assert_eq!(got, model.into_iter().collect::<Vec<_>>());
        }
    }
}
