use bytes::{Buf, BufMut};
use dedupe_types::record::RecordName;
use snafu::ensure;

use crate::{
    err::{CorruptDataSnafu, Result},
    geometry::Geometry,
    storage::{BufferedReader, BufferedWriter},
};

const PAGE_MAP_MAGIC: &[u8; 8] = b"ALBIPM02";

/// For each physical chapter, the highest delta list on every index page
/// but the last, so a name's list leads straight to its index page.
#[derive(Debug, Clone)]
pub struct IndexPageMap {
    entries_per_chapter: u32,
    lists_per_chapter:   u32,
    list_bits:           u32,
    last_update:         u64,
    entries:             Vec<u16>,
}

impl IndexPageMap {
    pub fn new(geometry: &Geometry) -> Self {
        let entries_per_chapter = geometry.index_pages_per_chapter - 1;
        Self {
            entries_per_chapter,
            lists_per_chapter: geometry.delta_lists_per_chapter,
            list_bits: geometry.chapter_delta_list_bits,
            last_update: 0,
            entries: vec![0; entries_per_chapter as usize * geometry.chapters_per_volume as usize],
        }
    }

    /// The newest chapter whose pages were recorded.
    pub fn last_update(&self) -> u64 { self.last_update }

    fn slot(&self, chapter: u32) -> usize { (chapter * self.entries_per_chapter) as usize }

    /// Record that index page `page` of `chapter` ends with `highest_list`.
    pub fn update(&mut self, virtual_chapter: u64, chapter: u32, page: u32, highest_list: u32) {
        self.last_update = virtual_chapter;
        if page == self.entries_per_chapter {
            return;
        }
        let slot = self.slot(chapter) + page as usize;
        self.entries[slot] = highest_list as u16;
    }

    /// The index page of `chapter` covering `name`'s delta list.
    pub fn find_index_page_number(&self, name: &RecordName, chapter: u32) -> u32 {
        let list = name.chapter_delta_list(self.list_bits);
        let slot = self.slot(chapter);
        (0..self.entries_per_chapter)
            .find(|page| list <= self.entries[slot + *page as usize] as u32)
            .unwrap_or(self.entries_per_chapter)
    }

    /// The inclusive range of lists on index page `page` of `chapter`.
    pub fn list_number_bounds(&self, chapter: u32, page: u32) -> (u32, u32) {
        let slot = self.slot(chapter);
        let lowest = if page == 0 {
            0
        } else {
            self.entries[slot + page as usize - 1] as u32 + 1
        };
        let highest = if page < self.entries_per_chapter {
            self.entries[slot + page as usize] as u32
        } else {
            self.lists_per_chapter - 1
        };
        (lowest, highest)
    }

    pub fn save_bytes(geometry: &Geometry) -> u64 {
        let entries = (geometry.index_pages_per_chapter - 1) as u64 * geometry.chapters_per_volume as u64;
        (PAGE_MAP_MAGIC.len() + 8) as u64 + entries * 2
    }

    pub fn save(&self, writer: &mut BufferedWriter) -> Result<()> {
        let mut buf = Vec::with_capacity(PAGE_MAP_MAGIC.len() + 8 + self.entries.len() * 2);
        buf.put_slice(PAGE_MAP_MAGIC);
        buf.put_u64_le(self.last_update);
        for entry in &self.entries {
            buf.put_u16_le(*entry);
        }
        writer.write_all(&buf)?;
        writer.flush()
    }

    pub fn load(&mut self, reader: &mut BufferedReader) -> Result<()> {
        ensure!(
            reader.check_bytes(PAGE_MAP_MAGIC)?,
            CorruptDataSnafu {
                reason: "bad index page map saved magic",
            }
        );
        let raw = reader.read_vec(8 + self.entries.len() * 2)?;
        let mut buf = raw.as_slice();
        self.last_update = buf.get_u64_le();
        for entry in self.entries.iter_mut() {
            *entry = buf.get_u16_le();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::storage::{BlockStore, MemoryStore, Region};

    fn name_in_list(list: u32) -> RecordName {
        let mut bytes = [0u8; 16];
        // the chapter delta list comes from the low bits of bytes 8..14
        bytes[13] = list as u8;
        RecordName::new(bytes)
    }

    fn three_page_geometry() -> Geometry {
        let mut geometry = Geometry::new(4096, 64, 4, 0).unwrap();
        geometry.index_pages_per_chapter = 3;
        geometry
    }

    #[test]
    fn pages_and_bounds() {
        let geometry = three_page_geometry();
        let lists = geometry.delta_lists_per_chapter;
        let mut map = IndexPageMap::new(&geometry);
        map.update(6, 2, 0, 9);
        map.update(6, 2, 1, 40);
        map.update(6, 2, 2, lists - 1);
        assert_eq!(map.last_update(), 6);

        assert_eq!(map.find_index_page_number(&name_in_list(0), 2), 0);
        assert_eq!(map.find_index_page_number(&name_in_list(9), 2), 0);
        assert_eq!(map.find_index_page_number(&name_in_list(10), 2), 1);
        assert_eq!(map.find_index_page_number(&name_in_list(41), 2), 2);

        assert_eq!(map.list_number_bounds(2, 0), (0, 9));
        assert_eq!(map.list_number_bounds(2, 1), (10, 40));
        assert_eq!(map.list_number_bounds(2, 2), (41, lists - 1));
    }

    #[test]
    fn save_and_load() {
        let geometry = three_page_geometry();
        let mut map = IndexPageMap::new(&geometry);
        map.update(11, 3, 0, 20);
        map.update(11, 3, 1, 30);

        let store: Arc<dyn BlockStore> = Arc::new(MemoryStore::new(4096));
        let region = Region::new(store, "page map", 0, IndexPageMap::save_bytes(&geometry));
        map.save(&mut BufferedWriter::new(region.clone())).unwrap();

        let mut loaded = IndexPageMap::new(&geometry);
        loaded.load(&mut BufferedReader::new(region.clone())).unwrap();
        assert_eq!(loaded.last_update(), 11);
        assert_eq!(loaded.list_number_bounds(3, 1), (21, 30));

        region.write(0, b"garbage!").unwrap();
        assert!(loaded.load(&mut BufferedReader::new(region)).unwrap_err().is_corrupt());
    }
}
