//! Delta lists: sorted runs of keys stored as variable length deltas.
//!
//! Both the volume index and the chapter indexes are built from delta
//! lists. A mutable [`DeltaZone`] owns a range of lists as separate bit
//! strings; a [`DeltaPage`] is the immutable on-disk form of a chapter index
//! page.

pub mod bits;
mod page;
mod zone;

use dedupe_common::{bits_per, RECORD_NAME_SIZE};
use dedupe_types::record::RecordName;
use snafu::{ensure, OptionExt};

pub use self::{
    page::{pack_page, DeltaPage, PAGE_HEADER_BYTES},
    zone::{DeltaZone, SavedDeltaList},
};
use crate::err::{CorruptDataSnafu, Result};

/// Bits needed to store a collision name.
pub const COLLISION_BITS: u32 = (RECORD_NAME_SIZE * 8) as u32;
/// Width of a list offset in an immutable page.
pub const IMMUTABLE_HEADER_BITS: u32 = 19;
/// Trailing bytes of an immutable page that must be all ones.
pub const POST_FIELD_GUARD_BYTES: usize = 7;
/// A list may not grow past what a u16 bit count can describe.
pub const MAX_LIST_BITS: u32 = u16::MAX as u32;
/// Smallest page able to hold a header, one list offset pair and guards.
pub const MIN_PAGE_BYTES: usize = 64;

/// The Huffman-style parameters for a given mean delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaCoding {
    pub min_bits:   u32,
    pub min_keys:   u32,
    pub incr_keys:  u32,
    pub value_bits: u32,
}

impl DeltaCoding {
    pub fn new(mean_delta: u32, value_bits: u32) -> Self {
        // incr_keys is log(2) * mean_delta, rounded.
        let incr_keys = ((836158u64 * mean_delta as u64 + 603160) / 1206321) as u32;
        let min_bits = bits_per(incr_keys as u64 + 1);
        let min_keys = (1 << min_bits) - incr_keys;
        Self {
            min_bits,
            min_keys,
            incr_keys,
            value_bits,
        }
    }

    /// Bits used to store `delta`.
    pub fn delta_bits(&self, delta: u32) -> u32 {
        self.min_bits + (self.incr_keys - self.min_keys + delta) / self.incr_keys
    }

    /// Bits used by an entry with `delta`, including a collision name.
    pub fn entry_bits(&self, delta: u32, is_collision: bool) -> u32 {
        self.value_bits + self.delta_bits(delta) + if is_collision { COLLISION_BITS } else { 0 }
    }

    fn encode_delta(&self, mem: &mut [u8], offset: u64, delta: u32) {
        if delta < self.min_keys {
            bits::set_field(mem, delta, offset, self.min_bits);
            return;
        }
        let temp = delta - self.min_keys;
        let low = temp % self.incr_keys + self.min_keys;
        let zeros = (temp / self.incr_keys) as u64;
        bits::set_field(mem, low, offset, self.min_bits);
        bits::set_zero(mem, offset + self.min_bits as u64, zeros);
        bits::set_field(mem, 1, offset + self.min_bits as u64 + zeros, 1);
    }

    /// Decode a delta at `offset`, returning it and the bits it used.
    fn decode_delta(&self, mem: &[u8], offset: u64, limit: u64) -> Result<(u32, u32)> {
        let mut delta = bits::get_field(mem, offset, self.min_bits);
        let mut key_bits = self.min_bits;
        if delta >= self.min_keys {
            let mut pos = offset + self.min_bits as u64;
            loop {
                ensure!(
                    pos < limit,
                    CorruptDataSnafu {
                        reason: "delta runs past the end of its list",
                    }
                );
                let word = bits::get_field(mem, pos, (limit - pos).min(32) as u32);
                if word != 0 {
                    let ones = word.trailing_zeros();
                    pos += ones as u64 + 1;
                    break;
                }
                pos += 32.min(limit - pos);
            }
            key_bits = (pos - offset) as u32;
            delta += (key_bits - self.min_bits - 1) * self.incr_keys;
        }
        Ok((delta, key_bits))
    }

    pub(crate) fn encode_entry(
        &self,
        mem: &mut [u8],
        offset: u64,
        value: u32,
        delta: u32,
        name: Option<&RecordName>,
    ) {
        bits::set_field(mem, value, offset, self.value_bits);
        self.encode_delta(mem, offset + self.value_bits as u64, delta);
        if let Some(name) = name {
            let name_offset = offset + self.entry_bits(delta, false) as u64;
            for (i, b) in name.as_bytes().iter().enumerate() {
                bits::set_field(mem, *b as u32, name_offset + 8 * i as u64, 8);
            }
        }
    }
}

/// A cursor over one delta list.
///
/// A fresh cursor sits before the first entry; [`DeltaListView::next`]
/// decodes the following entry into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaEntry {
    /// Global list number.
    pub list:         u32,
    /// Bit offset of the entry from the start of the list.
    pub offset:       u32,
    pub key:          u32,
    pub delta:        u32,
    pub entry_bits:   u32,
    pub is_collision: bool,
    pub at_end:       bool,
}

impl DeltaEntry {
    pub fn start(list: u32) -> Self {
        Self {
            list,
            offset: 0,
            key: 0,
            delta: 0,
            entry_bits: 0,
            is_collision: false,
            at_end: false,
        }
    }

    /// Whether the cursor stopped on an entry with exactly `key`.
    pub fn is_found(&self, key: u32) -> bool { !self.at_end && self.key == key }
}

/// A read-only window onto one list's bits.
#[derive(Clone, Copy)]
pub struct DeltaListView<'a> {
    pub coding: &'a DeltaCoding,
    pub mem:    &'a [u8],
    /// Bit offset of the list within `mem`.
    pub start:  u64,
    /// Length of the list in bits.
    pub size:   u32,
}

impl<'a> DeltaListView<'a> {
    pub fn next(&self, entry: &mut DeltaEntry) -> Result<()> {
        ensure!(
            !entry.at_end,
            CorruptDataSnafu {
                reason: format!("stepped past the end of delta list {}", entry.list),
            }
        );
        entry.offset += entry.entry_bits;
        if entry.offset >= self.size {
            ensure!(
                entry.offset == self.size,
                CorruptDataSnafu {
                    reason: format!("entry past the end of delta list {}", entry.list),
                }
            );
            entry.at_end = true;
            entry.delta = 0;
            entry.entry_bits = 0;
            entry.is_collision = false;
            return Ok(());
        }

        let limit = self.start + self.size as u64;
        let delta_offset = self.start + entry.offset as u64 + self.coding.value_bits as u64;
        let (delta, key_bits) = self.coding.decode_delta(self.mem, delta_offset, limit)?;
        entry.delta = delta;
        entry.key = entry.key.checked_add(delta).context(CorruptDataSnafu {
            reason: format!("key overflow in delta list {}", entry.list),
        })?;
        entry.is_collision = delta == 0 && entry.offset > 0;
        entry.entry_bits = self.coding.value_bits
            + key_bits
            + if entry.is_collision { COLLISION_BITS } else { 0 };
        ensure!(
            entry.offset + entry.entry_bits <= self.size,
            CorruptDataSnafu {
                reason: format!("decoded past the end of delta list {}", entry.list),
            }
        );
        Ok(())
    }

    /// Position a cursor on the first entry whose key is at least `key`,
    /// preferring a collision entry that carries `name` exactly.
    pub fn find(&self, list: u32, key: u32, name: Option<&RecordName>) -> Result<DeltaEntry> {
        let mut entry = DeltaEntry::start(list);
        loop {
            self.next(&mut entry)?;
            if entry.at_end || key <= entry.key {
                break;
            }
        }

        if let Some(name) = name {
            if entry.is_found(key) {
                let mut collision = entry;
                loop {
                    self.next(&mut collision)?;
                    if collision.at_end || !collision.is_collision {
                        break;
                    }
                    if self.collision_name(&collision) == *name {
                        entry = collision;
                        break;
                    }
                }
            }
        }
        Ok(entry)
    }

    pub fn value(&self, entry: &DeltaEntry) -> u32 {
        bits::get_field(self.mem, self.start + entry.offset as u64, self.coding.value_bits)
    }

    pub fn collision_name(&self, entry: &DeltaEntry) -> RecordName {
        let offset = self.start + (entry.offset + entry.entry_bits - COLLISION_BITS) as u64;
        let mut bytes = [0u8; RECORD_NAME_SIZE];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = bits::get_field(self.mem, offset + 8 * i as u64, 8) as u8;
        }
        RecordName::new(bytes)
    }
}

/// Bits an index of `entry_count` entries is expected to need.
pub fn index_bits(entry_count: u32, mean_delta: u32, payload_bits: u32) -> u64 {
    let coding = DeltaCoding::new(mean_delta, payload_bits);
    // Each delta takes about min_bits + 1.5 bits.
    entry_count as u64 * (payload_bits + coding.min_bits + 1) as u64 + entry_count as u64 / 2
}

/// Immutable pages needed for a chapter index of `entry_count` entries.
pub fn page_count(
    entry_count: u32,
    list_count: u32,
    mean_delta: u32,
    payload_bits: u32,
    bytes_per_page: usize,
) -> u32 {
    let mut bits_per_index = index_bits(entry_count, mean_delta, payload_bits);
    let bits_per_list = bits_per_index / list_count as u64;
    bits_per_index += list_count as u64 * IMMUTABLE_HEADER_BITS as u64;
    let bits_per_page = (bytes_per_page - PAGE_HEADER_BYTES) as u64 * 8
        - IMMUTABLE_HEADER_BITS as u64
        - bits_per_list;
    dedupe_common::div_round_up(bits_per_index, bits_per_page) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coding_constants() {
        let c = DeltaCoding::new(4096, 0);
        assert_eq!(c.incr_keys, 2839);
        assert_eq!(c.min_bits, 12);
        assert_eq!(c.min_keys, 4096 - 2839);

        // the smallest deltas fit in min_bits, larger ones add a unary tail
        assert_eq!(c.delta_bits(0), 12);
        assert_eq!(c.delta_bits(c.min_keys - 1), 12);
        assert_eq!(c.delta_bits(c.min_keys), 13);
        assert_eq!(c.delta_bits(c.min_keys + c.incr_keys), 14);
    }

    #[test]
    fn deltas_decode_to_what_was_encoded() {
        let c = DeltaCoding::new(256, 3);
        let mut mem = vec![0u8; 256];
        let mut offset = 0u64;
        let deltas = [0u32, 1, c.min_keys - 1, c.min_keys, 1000, 5000];
        for d in deltas {
            c.encode_entry(&mut mem, offset, 5, d, None);
            offset += c.entry_bits(d, false) as u64;
        }
        let mut offset = 0u64;
        for d in deltas {
            let (got, key_bits) = c
                .decode_delta(&mem, offset + c.value_bits as u64, 256 * 8)
                .unwrap();
            assert_eq!(got, d);
            assert_eq!(key_bits, c.delta_bits(d));
            assert_eq!(bits::get_field(&mem, offset, 3), 5);
            offset += c.entry_bits(d, false) as u64;
        }
    }

    #[test]
    fn small_pages_still_fit_a_chapter() {
        assert_eq!(page_count(8192, 128, 1 << 16, 6, 4096), 7);
        assert!(page_count(32, 1, 1 << 16, 1, 1024) >= 1);
    }
}
