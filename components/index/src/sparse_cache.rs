//! Decoded chapter indexes of recently used sparse chapters.
//!
//! Membership only changes inside [`SparseCache::update`], which every zone
//! calls with the same chapter: the zones meet at a barrier, zone 0 alone
//! rewrites the cache and hands its search order to the others, and all
//! meet again before anyone searches. Between updates each zone keeps its
//! own most-recently-used order.

use std::sync::Barrier;

use dedupe_common::NO_CHAPTER;
use dedupe_types::record::RecordName;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::debug;

use crate::{
    chapter_index::search_index_page, delta::DeltaPage, err::Result, geometry::Geometry,
    index_page_map::IndexPageMap,
};

const SKIP_SEARCH_THRESHOLD: u64 = 20000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SparseCacheStats {
    pub chapter_hits:   u64,
    pub chapter_misses: u64,
    pub search_hits:    u64,
    pub search_misses:  u64,
    pub invalidations:  u64,
    pub evictions:      u64,
}

struct CachedChapter {
    virtual_chapter:    u64,
    skip_search:        bool,
    search_hits:        u64,
    search_misses:      u64,
    consecutive_misses: u64,
    index_pages:        Vec<DeltaPage>,
}

impl CachedChapter {
    fn dead() -> Self {
        Self {
            virtual_chapter:    NO_CHAPTER,
            skip_search:        false,
            search_hits:        0,
            search_misses:      0,
            consecutive_misses: 0,
            index_pages:        Vec::new(),
        }
    }
}

/// A permutation of the cache entries, most recently used first. Entries
/// from `first_dead` on hold no searchable chapter.
#[derive(Clone)]
struct SearchList {
    entries:    Vec<usize>,
    first_dead: usize,
}

impl SearchList {
    /// Move the entry at `prefix - 1` to the front.
    fn rotate(&mut self, prefix: usize) -> usize {
        let most_recent = self.entries[prefix - 1];
        self.entries[..prefix].rotate_right(1);
        // a dead entry pulled to the front is about to be reused
        if self.first_dead < prefix {
            self.first_dead += 1;
        }
        most_recent
    }

    /// Reorder the live prefix into alive, skipped and dead entries,
    /// keeping the recency order within each group.
    fn purge(&mut self, chapters: &[RwLock<CachedChapter>], oldest: u64) {
        let (mut alive, mut skipped, mut dead) = (Vec::new(), Vec::new(), Vec::new());
        for entry in &self.entries[..self.first_dead] {
            let chapter = chapters[*entry].read();
            if chapter.virtual_chapter == NO_CHAPTER || chapter.virtual_chapter < oldest {
                dead.push(*entry);
            } else if chapter.skip_search {
                skipped.push(*entry);
            } else {
                alive.push(*entry);
            }
        }
        self.first_dead = alive.len() + skipped.len();
        let purged: Vec<usize> = alive.into_iter().chain(skipped).chain(dead).collect();
        self.entries[..purged.len()].copy_from_slice(&purged);
    }
}

pub struct SparseCache {
    geometry:       Geometry,
    capacity:       usize,
    skip_threshold: u64,
    chapters:       Vec<RwLock<CachedChapter>>,
    search_lists:   Vec<Mutex<SearchList>>,
    begin_update:   Barrier,
    end_update:     Barrier,
    stats:          Mutex<SparseCacheStats>,
}

impl SparseCache {
    pub fn new(geometry: &Geometry, capacity: usize, zone_count: usize) -> Self {
        let list = SearchList {
            entries:    (0..capacity).collect(),
            first_dead: 0,
        };
        Self {
            geometry: geometry.clone(),
            capacity,
            // the threshold is shared out over the zones' searches
            skip_threshold: SKIP_SEARCH_THRESHOLD / zone_count as u64,
            chapters: (0..capacity).map(|_| RwLock::new(CachedChapter::dead())).collect(),
            search_lists: (0..zone_count).map(|_| Mutex::new(list.clone())).collect(),
            begin_update: Barrier::new(zone_count),
            end_update: Barrier::new(zone_count),
            stats: Mutex::new(SparseCacheStats::default()),
        }
    }

    /// Whether `virtual_chapter` is cached, refreshing it in `zone`'s order.
    /// Every zone answers alike between updates, expired or not.
    pub fn contains(&self, virtual_chapter: u64, zone: usize) -> bool {
        let mut list = self.search_lists[zone].lock();
        let position = list.entries[..list.first_dead]
            .iter()
            .position(|e| self.chapters[*e].read().virtual_chapter == virtual_chapter);
        match position {
            Some(i) => {
                if zone == 0 {
                    self.stats.lock().chapter_hits += 1;
                    self.chapters[list.entries[i]].write().skip_search = false;
                }
                list.rotate(i + 1);
                true
            }
            None => {
                if zone == 0 {
                    self.stats.lock().chapter_misses += 1;
                }
                false
            }
        }
    }

    /// Cache the index of `virtual_chapter`. Every zone must call this with
    /// the same chapter; zone 0 reads the pages with `read_chapter_index`.
    pub fn update(
        &self,
        zone: usize,
        zone_oldest: u64,
        index_oldest: u64,
        virtual_chapter: u64,
        read_chapter_index: impl FnOnce(u64) -> Result<Vec<DeltaPage>>,
    ) -> Result<()> {
        if self.contains(virtual_chapter, zone) {
            return Ok(());
        }

        self.begin_update.wait();
        let mut result = Ok(());
        if zone == 0 {
            result = self.replace_victim(zone_oldest, index_oldest, virtual_chapter, read_chapter_index);
        }
        self.end_update.wait();
        result
    }

    fn replace_victim(
        &self,
        zone_oldest: u64,
        index_oldest: u64,
        virtual_chapter: u64,
        read_chapter_index: impl FnOnce(u64) -> Result<Vec<DeltaPage>>,
    ) -> Result<()> {
        let mut list = self.search_lists[0].lock();
        list.purge(&self.chapters, zone_oldest);

        let mut result = Ok(());
        if virtual_chapter >= index_oldest {
            let victim = list.rotate(self.capacity);
            let mut chapter = self.chapters[victim].write();
            if chapter.virtual_chapter != NO_CHAPTER {
                let mut stats = self.stats.lock();
                if chapter.virtual_chapter < zone_oldest {
                    stats.invalidations += 1;
                } else {
                    stats.evictions += 1;
                }
            }

            *chapter = CachedChapter::dead();
            match read_chapter_index(virtual_chapter) {
                Ok(pages) => {
                    chapter.index_pages = pages;
                    chapter.virtual_chapter = virtual_chapter;
                    debug!("cached sparse chapter {virtual_chapter}");
                }
                Err(e) => result = Err(e),
            }
        }

        for other in &self.search_lists[1..] {
            *other.lock() = list.clone();
        }
        result
    }

    /// Search the cached chapters for `name`, or only `virtual_chapter`
    /// when one is given. Returns the chapter and record page of a hit.
    pub fn search(
        &self,
        zone: usize,
        zone_oldest: u64,
        name: &RecordName,
        virtual_chapter: Option<u64>,
        page_map: &IndexPageMap,
    ) -> Result<Option<(u64, u32)>> {
        let mut list = self.search_lists[zone].lock();
        for i in 0..list.first_dead {
            let entry = list.entries[i];
            let chapter = self.chapters[entry].read();
            if chapter.virtual_chapter == NO_CHAPTER || chapter.virtual_chapter < zone_oldest {
                continue;
            }
            let skip = match virtual_chapter {
                Some(wanted) => wanted != chapter.virtual_chapter,
                None => chapter.skip_search,
            };
            if skip {
                continue;
            }

            let physical = self.geometry.map_to_physical_chapter(chapter.virtual_chapter);
            let page = page_map.find_index_page_number(name, physical) as usize;
            let Some(index_page) = chapter.index_pages.get(page) else {
                continue;
            };
            let found = search_index_page(index_page, &self.geometry, name)?;
            let found_chapter = chapter.virtual_chapter;
            drop(chapter);

            if let Some(record_page) = found {
                if zone == 0 {
                    self.score_search(entry, true);
                }
                list.rotate(i + 1);
                return Ok(Some((found_chapter, record_page)));
            }
            if zone == 0 {
                self.score_search(entry, false);
            }
            if virtual_chapter.is_some() {
                break;
            }
        }
        Ok(None)
    }

    fn score_search(&self, entry: usize, hit: bool) {
        let mut chapter = self.chapters[entry].write();
        let mut stats = self.stats.lock();
        if hit {
            stats.search_hits += 1;
            chapter.search_hits += 1;
            chapter.consecutive_misses = 0;
            chapter.skip_search = false;
        } else {
            stats.search_misses += 1;
            chapter.search_misses += 1;
            chapter.consecutive_misses += 1;
            if chapter.consecutive_misses > self.skip_threshold {
                chapter.skip_search = true;
            }
        }
    }

    /// Drop every cached chapter, as before a rebuild.
    pub fn invalidate(&self) {
        for chapter in &self.chapters {
            *chapter.write() = CachedChapter::dead();
        }
    }

    pub fn stats(&self) -> SparseCacheStats { *self.stats.lock() }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use bytes::Bytes;
    use dedupe_types::record::RecordName;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::chapter_index::OpenChapterIndex;

    fn geometry() -> Geometry { Geometry::new(256, 4, 10, 5).unwrap() }

    /// A one-page chapter index holding `names` on record page 1.
    fn chapter_pages(geometry: &Geometry, virtual_chapter: u64, names: &[RecordName]) -> Vec<DeltaPage> {
        let mut index = OpenChapterIndex::new(geometry, 0);
        index.empty(virtual_chapter);
        for name in names {
            index.put_record(name, 1).unwrap();
        }
        let mut page = vec![0u8; geometry.bytes_per_page];
        index.pack_page(&mut page, 0, true).unwrap();
        vec![DeltaPage::parse(Bytes::from(page), 0, geometry.chapter_coding()).unwrap()]
    }

    fn names(seed: u64, count: usize) -> Vec<RecordName> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count).map(|_| RecordName::new(rng.gen())).collect()
    }

    #[test]
    fn cached_chapters_are_searched_most_recent_first() {
        let geometry = geometry();
        let map = IndexPageMap::new(&geometry);
        let cache = SparseCache::new(&geometry, 2, 1);
        let (a, b, c) = (names(1, 4), names(2, 4), names(3, 4));

        cache.update(0, 0, 0, 3, |vcn| Ok(chapter_pages(&geometry, vcn, &a))).unwrap();
        cache.update(0, 0, 0, 4, |vcn| Ok(chapter_pages(&geometry, vcn, &b))).unwrap();
        assert!(cache.contains(3, 0));
        assert!(cache.contains(4, 0));

        assert_eq!(cache.search(0, 0, &a[0], None, &map).unwrap(), Some((3, 1)));
        assert_eq!(cache.search(0, 0, &b[2], None, &map).unwrap(), Some((4, 1)));
        assert_eq!(cache.search(0, 0, &b[2], Some(3), &map).unwrap(), None);
        assert_eq!(cache.search(0, 0, &c[0], None, &map).unwrap(), None);

        // chapter 3 is now least recently used and makes room for 5
        cache.update(0, 0, 0, 5, |vcn| Ok(chapter_pages(&geometry, vcn, &c))).unwrap();
        assert!(!cache.contains(3, 0));
        assert!(cache.contains(5, 0));
        assert_eq!(cache.stats().evictions, 1);

        // expired chapters stay members but are never searched
        assert_eq!(cache.search(0, 5, &b[0], None, &map).unwrap(), None);
        assert!(cache.contains(4, 0));
    }

    #[test]
    fn chapters_before_the_window_are_not_cached() {
        let geometry = geometry();
        let cache = SparseCache::new(&geometry, 2, 1);
        cache
            .update(0, 6, 6, 2, |_| panic!("expired chapters are never read"))
            .unwrap();
        assert!(!cache.contains(2, 0));
    }

    #[test]
    fn failed_read_leaves_no_member() {
        let geometry = geometry();
        let cache = SparseCache::new(&geometry, 2, 1);
        let err = cache
            .update(0, 0, 0, 3, |_| {
                crate::err::CorruptDataSnafu {
                    reason: "unreadable",
                }
                .fail()
            })
            .unwrap_err();
        assert!(err.is_corrupt());
        assert!(!cache.contains(3, 0));
    }

    #[test]
    fn misses_past_the_threshold_skip_a_chapter() {
        let geometry = geometry();
        let map = IndexPageMap::new(&geometry);
        let cache = SparseCache::new(&geometry, 1, 1);
        let a = names(1, 4);
        cache.update(0, 0, 0, 3, |vcn| Ok(chapter_pages(&geometry, vcn, &a))).unwrap();

        let strangers = names(9, 1);
        for _ in 0..=SKIP_SEARCH_THRESHOLD {
            assert_eq!(cache.search(0, 0, &strangers[0], None, &map).unwrap(), None);
        }
        // skipped when searching everything, still found by chapter
        assert_eq!(cache.search(0, 0, &a[1], None, &map).unwrap(), None);
        assert_eq!(cache.search(0, 0, &a[1], Some(3), &map).unwrap(), Some((3, 1)));
        assert_eq!(cache.search(0, 0, &a[1], None, &map).unwrap(), Some((3, 1)));
    }

    #[test]
    fn zones_update_together() {
        let geometry = geometry();
        let cache = Arc::new(SparseCache::new(&geometry, 2, 3));
        let a = names(1, 4);
        let handles: Vec<_> = (0..3)
            .map(|zone| {
                let cache = cache.clone();
                let geometry = geometry.clone();
                let a = a.clone();
                thread::spawn(move || {
                    cache
                        .update(zone, 0, 0, 7, |vcn| Ok(chapter_pages(&geometry, vcn, &a)))
                        .unwrap();
                    cache.contains(7, zone)
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
        let map = IndexPageMap::new(&geometry);
        assert_eq!(cache.search(2, 0, &a[3], None, &map).unwrap(), Some((7, 1)));
    }
}
