use bytes::{Buf, BufMut, Bytes};
use dedupe_types::record::RecordName;
use snafu::ensure;

use super::{bits, DeltaCoding, DeltaEntry, DeltaListView, DeltaZone, IMMUTABLE_HEADER_BITS, POST_FIELD_GUARD_BYTES};
use crate::err::{CorruptDataSnafu, InvalidArgumentSnafu, Result};

/// nonce, virtual chapter, first list and list count.
pub const PAGE_HEADER_BYTES: usize = 8 + 8 + 2 + 2;

fn list_offset_position(list: u32) -> u64 {
    (PAGE_HEADER_BYTES * 8) as u64 + list as u64 * IMMUTABLE_HEADER_BITS as u64
}

fn list_offset(page: &[u8], list: u32) -> u64 {
    bits::get_field(page, list_offset_position(list), IMMUTABLE_HEADER_BITS) as u64
}

/// Pack lists starting at `first_list` from `zone` into `page`, stopping at
/// the first list that does not fit. Returns the number of lists packed.
pub fn pack_page(
    zone: &DeltaZone,
    nonce: u64,
    virtual_chapter: u64,
    first_list: u32,
    page: &mut [u8],
) -> Result<u32> {
    let page_bits = (page.len() * 8) as u64;
    ensure!(
        page_bits <= 1 << IMMUTABLE_HEADER_BITS,
        InvalidArgumentSnafu {
            reason: format!("page of {} bytes is too large for list offsets", page.len()),
        }
    );
    let mut free_bits = page_bits
        .checked_sub(list_offset_position(1) + (POST_FIELD_GUARD_BYTES * 8) as u64)
        .unwrap_or(0);
    ensure!(
        free_bits >= IMMUTABLE_HEADER_BITS as u64,
        InvalidArgumentSnafu {
            reason: format!("page of {} bytes cannot hold a delta list", page.len()),
        }
    );

    let last_list = zone.first_list() + zone.list_count();
    let mut count = 0u32;
    while first_list + count < last_list {
        let bits = IMMUTABLE_HEADER_BITS as u64 + zone.list_size(first_list + count) as u64;
        if bits > free_bits {
            break;
        }
        free_bits -= bits;
        count += 1;
    }

    page.fill(0);
    let mut header = &mut page[..PAGE_HEADER_BYTES];
    header.put_u64_le(nonce);
    header.put_u64_le(virtual_chapter);
    header.put_u16_le(first_list as u16);
    header.put_u16_le(count as u16);

    let mut offset = list_offset_position(count + 1);
    bits::set_field(page, offset as u32, list_offset_position(0), IMMUTABLE_HEADER_BITS);
    for i in 0..count {
        let list = first_list + i;
        let size = zone.list_size(list) as u64;
        bits::copy_bits(zone.list_bytes(list), 0, page, offset, size);
        offset += size;
        bits::set_field(page, offset as u32, list_offset_position(i + 1), IMMUTABLE_HEADER_BITS);
    }

    let guard_start = page.len() - POST_FIELD_GUARD_BYTES;
    page[guard_start..].fill(0xff);
    Ok(count)
}

/// A decoded, read-only chapter index page.
#[derive(Debug, Clone)]
pub struct DeltaPage {
    bytes:               Bytes,
    coding:              DeltaCoding,
    pub virtual_chapter: u64,
    pub first_list:      u32,
    pub list_count:      u32,
}

impl DeltaPage {
    /// Check the layout of a page read from disk. A nonce mismatch is an
    /// ordinary outcome for never-written chapters and reads as corrupt.
    pub fn parse(bytes: Bytes, expected_nonce: u64, coding: DeltaCoding) -> Result<Self> {
        let len = bytes.len();
        ensure!(
            len > PAGE_HEADER_BYTES + POST_FIELD_GUARD_BYTES,
            CorruptDataSnafu {
                reason: format!("index page of {len} bytes is too small"),
            }
        );
        let mut header = &bytes[..PAGE_HEADER_BYTES];
        let nonce = header.get_u64_le();
        let virtual_chapter = header.get_u64_le();
        let first_list = header.get_u16_le() as u32;
        let list_count = header.get_u16_le() as u32;

        ensure!(
            nonce == expected_nonce,
            CorruptDataSnafu {
                reason: format!("index page nonce {nonce:#x} is not {expected_nonce:#x}"),
            }
        );
        ensure!(
            (list_count as u64) <= ((len - PAGE_HEADER_BYTES) * 8) as u64 / IMMUTABLE_HEADER_BITS as u64,
            CorruptDataSnafu {
                reason: format!("{list_count} lists cannot fit in an index page"),
            }
        );
        ensure!(
            list_offset(&bytes, 0) == list_offset_position(list_count + 1),
            CorruptDataSnafu {
                reason: "first delta list does not follow the offsets",
            }
        );
        for i in 0..list_count {
            ensure!(
                list_offset(&bytes, i) <= list_offset(&bytes, i + 1),
                CorruptDataSnafu {
                    reason: format!("delta list {i} of index page is out of order"),
                }
            );
        }
        ensure!(
            list_offset(&bytes, list_count) <= ((len - POST_FIELD_GUARD_BYTES) * 8) as u64,
            CorruptDataSnafu {
                reason: "delta lists run into the page guard",
            }
        );
        ensure!(
            bytes[len - POST_FIELD_GUARD_BYTES..].iter().all(|b| *b == 0xff),
            CorruptDataSnafu {
                reason: "index page guard bytes are damaged",
            }
        );

        Ok(Self {
            bytes,
            coding,
            virtual_chapter,
            first_list,
            list_count,
        })
    }

    /// The highest list on the page; a page may hold no lists at all.
    pub fn highest_list(&self) -> Option<u32> {
        (self.list_count > 0).then(|| self.first_list + self.list_count - 1)
    }

    pub fn contains_list(&self, list: u32) -> bool {
        list >= self.first_list && list < self.first_list + self.list_count
    }

    pub fn view(&self, list: u32) -> Option<DeltaListView<'_>> {
        if !self.contains_list(list) {
            return None;
        }
        let i = list - self.first_list;
        let start = list_offset(&self.bytes, i);
        let end = list_offset(&self.bytes, i + 1);
        Some(DeltaListView {
            coding: &self.coding,
            mem:    &self.bytes,
            start,
            size:   (end - start) as u32,
        })
    }

    /// The value stored for `name` at `key`, if the page has one.
    pub fn search(&self, list: u32, key: u32, name: &RecordName) -> Result<Option<u32>> {
        let Some(view) = self.view(list) else {
            return InvalidArgumentSnafu {
                reason: format!(
                    "list {list} is not on the index page for lists {}..{}",
                    self.first_list,
                    self.first_list + self.list_count
                ),
            }
            .fail();
        };
        let entry = view.find(list, key, Some(name))?;
        Ok(entry.is_found(key).then(|| view.value(&entry)))
    }

    /// Walk every entry, checking it decodes and its value is below `limit`.
    pub fn validate(&self, limit: u32) -> Result<()> {
        for list in self.first_list..self.first_list + self.list_count {
            let Some(view) = self.view(list) else {
                continue;
            };
            let mut entry = DeltaEntry::start(list);
            loop {
                view.next(&mut entry)?;
                if entry.at_end {
                    break;
                }
                let value = view.value(&entry);
                ensure!(
                    value < limit,
                    CorruptDataSnafu {
                        reason: format!("index page entry in list {list} names record page {value}"),
                    }
                );
            }
        }
        Ok(())
    }

    /// Every (list, key, value) on the page, for rebuilding the sparse cache.
    pub fn entries(&self) -> Result<Vec<(u32, u32, u32)>> {
        let mut out = Vec::new();
        for list in self.first_list..self.first_list + self.list_count {
            let Some(view) = self.view(list) else {
                continue;
            };
            let mut entry = DeltaEntry::start(list);
            loop {
                view.next(&mut entry)?;
                if entry.at_end {
                    break;
                }
                out.push((list, entry.key, view.value(&entry)));
            }
        }
        Ok(out)
    }
}
