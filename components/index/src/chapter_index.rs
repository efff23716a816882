//! The chapter index of a closing chapter: one delta list entry per record,
//! mapping the name's chapter address to the record page that holds it.

use dedupe_types::record::RecordName;
use snafu::ensure;
use tracing::{debug, warn};

use crate::{
    delta::{pack_page, DeltaPage, DeltaZone},
    err::{InvalidArgumentSnafu, Result},
    geometry::Geometry,
};

/// A mutable chapter index, refilled for every chapter the writer closes.
pub struct OpenChapterIndex {
    virtual_chapter: u64,
    nonce:           u64,
    list_bits:       u32,
    address_bits:    u32,
    record_pages:    u32,
    delta:           DeltaZone,
}

impl OpenChapterIndex {
    pub fn new(geometry: &Geometry, nonce: u64) -> Self {
        Self {
            virtual_chapter: 0,
            nonce,
            list_bits: geometry.chapter_delta_list_bits,
            address_bits: geometry.chapter_address_bits,
            record_pages: geometry.record_pages_per_chapter,
            delta: DeltaZone::new(
                0,
                geometry.delta_lists_per_chapter,
                geometry.chapter_mean_delta,
                geometry.chapter_payload_bits,
                u64::MAX,
            ),
        }
    }

    /// Forget every entry and start indexing `virtual_chapter`.
    pub fn empty(&mut self, virtual_chapter: u64) {
        self.virtual_chapter = virtual_chapter;
        self.delta.empty();
    }

    pub fn virtual_chapter(&self) -> u64 { self.virtual_chapter }

    pub fn record_count(&self) -> u64 { self.delta.stats().record_count }

    pub fn discard_count(&self) -> u64 { self.delta.stats().discard_count }

    /// Index `name` as stored on record page `page`. A second put of the
    /// same name becomes a collision entry; a third is `DuplicateName`.
    pub fn put_record(&mut self, name: &RecordName, page: u32) -> Result<()> {
        ensure!(
            page < self.record_pages,
            InvalidArgumentSnafu {
                reason: format!("record page {page} is not below {}", self.record_pages),
            }
        );
        let list = name.chapter_delta_list(self.list_bits);
        let address = name.chapter_delta_address(self.list_bits, self.address_bits);
        let mut entry = self.delta.get_entry(list, address, Some(name))?;
        let found = entry.is_found(address);
        self.delta
            .put_entry(&mut entry, address, page, found.then_some(name))
    }

    /// Pack lists from `first_list` onto `page`, returning how many went.
    ///
    /// A list too big for an empty page is cleared so the chapter can make
    /// progress. On the last page every list must land, so lists are
    /// dropped until the rest fit; dropped entries count as discards.
    pub fn pack_page(&mut self, page: &mut [u8], first_list: u32, last_page: bool) -> Result<u32> {
        let list_count = self.delta.list_count();
        let mut removals = 0u64;
        let packed = loop {
            let packed = pack_page(&self.delta, self.nonce, self.virtual_chapter, first_list, page)?;
            if first_list + packed == list_count {
                break packed;
            }
            if packed == 0 {
                removals += self.delta.clear_list(first_list)?;
                continue;
            }
            if !last_page {
                break packed;
            }

            let victim = (first_list + packed..list_count)
                .find(|l| self.delta.list_size(*l) > 0)
                .or_else(|| (first_list..first_list + packed).rev().find(|l| self.delta.list_size(*l) > 0));
            let Some(victim) = victim else {
                return InvalidArgumentSnafu {
                    reason: format!(
                        "index page of {} bytes cannot hold {} empty lists",
                        page.len(),
                        list_count - first_list
                    ),
                }
                .fail();
            };
            removals += self.delta.clear_list(victim)?;
        };

        if removals > 0 {
            warn!(
                "chapter {} discarded {removals} chapter index entries to fit its index pages",
                self.virtual_chapter
            );
        }
        if packed == 0 {
            debug!("no delta lists packed on a page of chapter {}", self.virtual_chapter);
        }
        Ok(packed)
    }
}

/// The record page `name` is on according to one chapter index page.
pub fn search_index_page(page: &DeltaPage, geometry: &Geometry, name: &RecordName) -> Result<Option<u32>> {
    let list = geometry.chapter_delta_list(name);
    let address = geometry.chapter_delta_address(name);
    page.search(list, address, name)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    fn random_names(count: usize, seed: u64) -> Vec<RecordName> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count).map(|_| RecordName::new(rng.gen())).collect()
    }

    #[test]
    fn packed_chapter_finds_every_name() {
        let geometry = Geometry::new(1024, 8, 16, 0).unwrap();
        let mut index = OpenChapterIndex::new(&geometry, 42);
        index.empty(5);
        let names = random_names(geometry.records_per_chapter as usize, 1);
        for (i, name) in names.iter().enumerate() {
            index.put_record(name, i as u32 / geometry.records_per_page).unwrap();
        }
        assert_eq!(index.record_count(), names.len() as u64);

        let mut pages = Vec::new();
        let mut first_list = 0;
        for p in 0..geometry.index_pages_per_chapter {
            let mut page = vec![0u8; geometry.bytes_per_page];
            let last = p + 1 == geometry.index_pages_per_chapter;
            first_list += index.pack_page(&mut page, first_list, last).unwrap();
            pages.push(DeltaPage::parse(Bytes::from(page), 42, geometry.chapter_coding()).unwrap());
        }
        assert_eq!(first_list, geometry.delta_lists_per_chapter);
        assert_eq!(index.discard_count(), 0);

        for (i, name) in names.iter().enumerate() {
            let list = geometry.chapter_delta_list(name);
            let page = pages.iter().find(|p| p.contains_list(list)).unwrap();
            assert_eq!(page.virtual_chapter, 5);
            assert_eq!(
                search_index_page(page, &geometry, name).unwrap(),
                Some(i as u32 / geometry.records_per_page)
            );
        }
    }

    #[test]
    fn last_page_drops_lists_that_do_not_fit() {
        let geometry = Geometry::new(1024, 8, 16, 0).unwrap();
        assert_eq!(geometry.delta_lists_per_chapter, 4);
        let mut index = OpenChapterIndex::new(&geometry, 1);
        for name in random_names(geometry.records_per_chapter as usize, 2) {
            index.put_record(&name, 0).unwrap();
        }

        let mut page = vec![0u8; 96];
        let packed = index.pack_page(&mut page, 0, true).unwrap();
        assert_eq!(packed, 4);
        assert_eq!(index.discard_count(), geometry.records_per_chapter as u64);
        assert_eq!(index.record_count(), 0);
    }

    #[test]
    fn duplicate_names() {
        let geometry = Geometry::new(256, 4, 8, 0).unwrap();
        let mut index = OpenChapterIndex::new(&geometry, 1);
        let name = random_names(1, 3)[0];
        index.put_record(&name, 0).unwrap();
        index.put_record(&name, 1).unwrap();
        assert!(matches!(
            index.put_record(&name, 2).unwrap_err(),
            crate::err::Error::DuplicateName { .. }
        ));
        assert!(index.put_record(&name, 4).is_err());
    }
}
