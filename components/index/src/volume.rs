//! The volume: every closed chapter on disk, a cache of its pages, the index
//! page map and the sparse chapter cache.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use bytes::{Buf, BufMut, Bytes};
use dedupe_common::MAX_BAD_CHAPTERS;
use dedupe_types::record::{Record, RecordData, RecordName};
use moka::sync::Cache;
use parking_lot::RwLock;
use snafu::ensure;
use tracing::{debug, error, info, warn};

use crate::{
    chapter_index::{search_index_page, OpenChapterIndex},
    delta::DeltaPage,
    err::{CorruptDataSnafu, Result},
    geometry::Geometry,
    index_page_map::IndexPageMap,
    record_page::{decode_record_page, encode_record_page, search_record_page},
    sparse_cache::{SparseCache, SparseCacheStats},
    storage::{BufferedReader, BufferedWriter, Region},
};

const VOLUME_MAGIC: &[u8; 8] = b"DDVOLUME";
// magic, page size, record pages, chapters, sparse chapters, nonce, checksum
const HEADER_BYTES: usize = 8 + 4 * 4 + 8 + 4;

#[derive(Debug, Clone)]
pub struct VolumeConfig {
    pub nonce:          u64,
    /// Pages the page cache may hold.
    pub cache_pages:    u64,
    /// Chapters the sparse cache may hold; unused by dense volumes.
    pub cache_chapters: usize,
    pub zone_count:     usize,
}

#[derive(Clone)]
enum CachedPage {
    Index(Arc<DeltaPage>),
    Record(Bytes),
}

/// The outcome of a search that may not touch the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSearch {
    Found(RecordData),
    NotFound,
    /// A page the search needs is not cached.
    Miss,
}

/// The lowest and highest chapters found on disk by a rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChapterBoundaries {
    pub lowest:   u64,
    pub highest:  u64,
    pub is_empty: bool,
}

pub struct Volume {
    geometry:           Geometry,
    nonce:              u64,
    region:             Region,
    /// Keyed by virtual chapter and page within the chapter, so a page
    /// cached for an expired chapter never answers for its replacement.
    cache:              Cache<(u64, u32), CachedPage>,
    page_map:           RwLock<IndexPageMap>,
    sparse_cache:       Option<SparseCache>,
    lookup_for_rebuild: AtomicBool,
}

impl Volume {
    pub fn new(geometry: &Geometry, region: Region, config: &VolumeConfig) -> Self {
        let sparse_cache = geometry
            .is_sparse()
            .then(|| SparseCache::new(geometry, config.cache_chapters, config.zone_count));
        Self {
            geometry: geometry.clone(),
            nonce: config.nonce,
            region,
            cache: Cache::builder().max_capacity(config.cache_pages).build(),
            page_map: RwLock::new(IndexPageMap::new(geometry)),
            sparse_cache,
            lookup_for_rebuild: AtomicBool::new(false),
        }
    }

    pub fn geometry(&self) -> &Geometry { &self.geometry }

    pub fn nonce(&self) -> u64 { self.nonce }

    fn encode_header(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_BYTES);
        buf.put_slice(VOLUME_MAGIC);
        buf.put_u32_le(self.geometry.bytes_per_page as u32);
        buf.put_u32_le(self.geometry.record_pages_per_chapter);
        buf.put_u32_le(self.geometry.chapters_per_volume);
        buf.put_u32_le(self.geometry.sparse_chapters_per_volume);
        buf.put_u64_le(self.nonce);
        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);
        buf
    }

    /// Write the header page of a new volume.
    pub fn format(&self) -> Result<()> {
        let mut page = vec![0u8; self.geometry.bytes_per_page];
        let header = self.encode_header();
        page[..header.len()].copy_from_slice(&header);
        self.region.write(0, &page)?;
        self.region.sync()?;
        info!(
            "formatted volume of {} chapters, {} bytes",
            self.geometry.chapters_per_volume, self.geometry.bytes_per_volume
        );
        Ok(())
    }

    /// Check the header page matches this volume's geometry and nonce.
    pub fn check_header(&self) -> Result<()> {
        let mut raw = vec![0u8; HEADER_BYTES];
        self.region.read(0, &mut raw)?;
        ensure!(
            raw[..VOLUME_MAGIC.len()] == VOLUME_MAGIC[..],
            CorruptDataSnafu {
                reason: "volume header has a bad magic number",
            }
        );
        let mut checksum = &raw[HEADER_BYTES - 4..];
        ensure!(
            crc32fast::hash(&raw[..HEADER_BYTES - 4]) == checksum.get_u32_le(),
            CorruptDataSnafu {
                reason: "volume header checksum mismatch",
            }
        );
        ensure!(
            raw == self.encode_header(),
            CorruptDataSnafu {
                reason: "volume header does not match the configured geometry",
            }
        );
        Ok(())
    }

    /// In rebuild mode index pages are read without checking them against
    /// the page map, which is being rebuilt.
    pub fn set_lookup_for_rebuild(&self, rebuilding: bool) { self.lookup_for_rebuild.store(rebuilding, Ordering::Relaxed) }

    fn read_page(&self, chapter: u32, page: u32) -> Result<Bytes> {
        let mut buf = vec![0u8; self.geometry.bytes_per_page];
        let offset = self.geometry.physical_page(chapter, page) * self.geometry.bytes_per_page as u64;
        self.region.read(offset, &mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn parse_index_page(&self, bytes: Bytes) -> Result<DeltaPage> {
        DeltaPage::parse(bytes, self.nonce, self.geometry.chapter_coding())
    }

    /// Check a page read for `virtual_chapter` against the page map.
    fn validate_index_page(&self, page: &DeltaPage, virtual_chapter: u64, index_page: u32) -> Result<()> {
        let chapter = self.geometry.map_to_physical_chapter(virtual_chapter);
        if page.virtual_chapter != virtual_chapter {
            warn!(
                "index page {index_page} of chapter {chapter} holds chapter {}, not {virtual_chapter}",
                page.virtual_chapter
            );
            return CorruptDataSnafu {
                reason: format!("index page {index_page} of chapter {virtual_chapter} is stale"),
            }
            .fail();
        }
        let (lowest, highest) = self.page_map.read().list_number_bounds(chapter, index_page);
        if page.first_list != lowest || page.first_list + page.list_count != highest + 1 {
            warn!(
                "index page {index_page} of chapter {chapter} holds lists {}..{}, expected {lowest}..={highest}",
                page.first_list,
                page.first_list + page.list_count
            );
            return CorruptDataSnafu {
                reason: format!("index page {index_page} of chapter {virtual_chapter} disagrees with the page map"),
            }
            .fail();
        }
        Ok(())
    }

    pub fn get_index_page(&self, virtual_chapter: u64, index_page: u32) -> Result<Arc<DeltaPage>> {
        if let Some(CachedPage::Index(page)) = self.cache.get(&(virtual_chapter, index_page)) {
            return Ok(page);
        }
        let chapter = self.geometry.map_to_physical_chapter(virtual_chapter);
        let page = self.parse_index_page(self.read_page(chapter, index_page)?)?;
        if !self.lookup_for_rebuild.load(Ordering::Relaxed) {
            self.validate_index_page(&page, virtual_chapter, index_page)?;
        }
        let page = Arc::new(page);
        self.cache
            .insert((virtual_chapter, index_page), CachedPage::Index(page.clone()));
        Ok(page)
    }

    pub fn get_record_page(&self, virtual_chapter: u64, record_page: u32) -> Result<Bytes> {
        let page = self.geometry.index_pages_per_chapter + record_page;
        if let Some(CachedPage::Record(bytes)) = self.cache.get(&(virtual_chapter, page)) {
            return Ok(bytes);
        }
        let chapter = self.geometry.map_to_physical_chapter(virtual_chapter);
        let bytes = self.read_page(chapter, page)?;
        self.cache
            .insert((virtual_chapter, page), CachedPage::Record(bytes.clone()));
        Ok(bytes)
    }

    pub fn find_index_page_number(&self, name: &RecordName, virtual_chapter: u64) -> u32 {
        let chapter = self.geometry.map_to_physical_chapter(virtual_chapter);
        self.page_map.read().find_index_page_number(name, chapter)
    }

    /// Search `virtual_chapter` for `name`, reading pages as needed.
    pub fn search_page_cache(&self, name: &RecordName, virtual_chapter: u64) -> Result<Option<RecordData>> {
        let index_page = self.get_index_page(virtual_chapter, self.find_index_page_number(name, virtual_chapter))?;
        match search_index_page(&index_page, &self.geometry, name)? {
            Some(record_page) => self.search_record_page(name, virtual_chapter, record_page),
            None => Ok(None),
        }
    }

    /// Search one record page of `virtual_chapter`, reading it if needed.
    pub fn search_record_page(
        &self,
        name: &RecordName,
        virtual_chapter: u64,
        record_page: u32,
    ) -> Result<Option<RecordData>> {
        let page = self.get_record_page(virtual_chapter, record_page)?;
        Ok(search_record_page(&page, name, self.geometry.records_per_page))
    }

    /// [`Volume::search_page_cache`] without touching the disk.
    pub fn search_cached(&self, name: &RecordName, virtual_chapter: u64) -> Result<CacheSearch> {
        let index_page_number = self.find_index_page_number(name, virtual_chapter);
        let Some(CachedPage::Index(index_page)) = self.cache.get(&(virtual_chapter, index_page_number)) else {
            return Ok(CacheSearch::Miss);
        };
        match search_index_page(&index_page, &self.geometry, name)? {
            Some(record_page) => Ok(self.search_cached_record_page(name, virtual_chapter, record_page)),
            None => Ok(CacheSearch::NotFound),
        }
    }

    /// [`Volume::search_record_page`] without touching the disk.
    pub fn search_cached_record_page(&self, name: &RecordName, virtual_chapter: u64, record_page: u32) -> CacheSearch {
        let page = self.geometry.index_pages_per_chapter + record_page;
        match self.cache.get(&(virtual_chapter, page)) {
            Some(CachedPage::Record(bytes)) => {
                match search_record_page(&bytes, name, self.geometry.records_per_page) {
                    Some(data) => CacheSearch::Found(data),
                    None => CacheSearch::NotFound,
                }
            }
            _ => CacheSearch::Miss,
        }
    }

    /// Whether `name` is stored in `virtual_chapter`, read without the page
    /// map check while rebuilding.
    pub fn search_page_cache_for_rebuild(&self, name: &RecordName, virtual_chapter: u64) -> Result<bool> {
        Ok(self.search_page_cache(name, virtual_chapter)?.is_some())
    }

    /// Drop the cached pages of an expired chapter.
    pub fn forget_chapter(&self, virtual_chapter: u64) {
        debug!("forgetting chapter {virtual_chapter}");
        for page in 0..self.geometry.pages_per_chapter {
            self.cache.invalidate(&(virtual_chapter, page));
        }
    }

    /// Write the chapter indexed by `chapter_index` holding `records` in
    /// chapter order, then sync.
    pub fn write_chapter(&self, chapter_index: &mut OpenChapterIndex, records: &[Record]) -> Result<()> {
        let geometry = &self.geometry;
        let virtual_chapter = chapter_index.virtual_chapter();
        let chapter = geometry.map_to_physical_chapter(virtual_chapter);
        ensure!(
            records.len() == geometry.records_per_chapter as usize,
            CorruptDataSnafu {
                reason: format!("chapter {virtual_chapter} has {} records", records.len()),
            }
        );
        self.forget_chapter(virtual_chapter);

        let page_bytes = geometry.bytes_per_page;
        let mut buf = vec![0u8; geometry.pages_per_chapter as usize * page_bytes];
        let (index_part, record_part) = buf.split_at_mut(geometry.index_pages_per_chapter as usize * page_bytes);

        let mut first_list = 0;
        let mut index_pages = Vec::with_capacity(geometry.index_pages_per_chapter as usize);
        for (page, bytes) in index_part.chunks_exact_mut(page_bytes).enumerate() {
            let page = page as u32;
            let last_page = page + 1 == geometry.index_pages_per_chapter;
            first_list += chapter_index.pack_page(bytes, first_list, last_page)?;
            self.page_map
                .write()
                .update(virtual_chapter, chapter, page, first_list.saturating_sub(1));
            index_pages.push(self.parse_index_page(Bytes::copy_from_slice(bytes))?);
        }

        for (records, bytes) in records
            .chunks_exact(geometry.records_per_page as usize)
            .zip(record_part.chunks_exact_mut(page_bytes))
        {
            encode_record_page(records, bytes);
        }

        let offset = geometry.physical_page(chapter, 0) * page_bytes as u64;
        self.region.write(offset, &buf)?;
        self.region.sync()?;

        for (page, index_page) in index_pages.into_iter().enumerate() {
            self.cache
                .insert((virtual_chapter, page as u32), CachedPage::Index(Arc::new(index_page)));
        }
        debug!("wrote chapter {virtual_chapter} to physical chapter {chapter}");
        Ok(())
    }

    /// Every index page of `virtual_chapter`, for the sparse cache.
    pub fn read_chapter_index(&self, virtual_chapter: u64) -> Result<Vec<DeltaPage>> {
        (0..self.geometry.index_pages_per_chapter)
            .map(|page| Ok(self.get_index_page(virtual_chapter, page)?.as_ref().clone()))
            .collect()
    }

    /// Every record of `virtual_chapter`, read straight from disk.
    pub fn read_chapter_records(&self, virtual_chapter: u64) -> Result<Vec<Record>> {
        let chapter = self.geometry.map_to_physical_chapter(virtual_chapter);
        let mut records = Vec::with_capacity(self.geometry.records_per_chapter as usize);
        for page in 0..self.geometry.record_pages_per_chapter {
            let bytes = self.read_page(chapter, self.geometry.index_pages_per_chapter + page)?;
            records.extend(decode_record_page(&bytes, self.geometry.records_per_page));
        }
        Ok(records)
    }

    /// Restore the page map entries of `virtual_chapter` from its index
    /// pages on disk.
    pub fn rebuild_page_map(&self, virtual_chapter: u64) -> Result<()> {
        let chapter = self.geometry.map_to_physical_chapter(virtual_chapter);
        let mut expected = 0;
        for page in 0..self.geometry.index_pages_per_chapter {
            let index_page = self.parse_index_page(self.read_page(chapter, page)?)?;
            ensure!(
                index_page.first_list == expected && index_page.virtual_chapter == virtual_chapter,
                CorruptDataSnafu {
                    reason: format!(
                        "chapter {virtual_chapter} index page {page} starts at list {}, expected {expected}",
                        index_page.first_list
                    ),
                }
            );
            expected = index_page.first_list + index_page.list_count;
            self.page_map
                .write()
                .update(virtual_chapter, chapter, page, expected.saturating_sub(1));
        }
        Ok(())
    }

    /// The virtual chapter stored in physical `chapter`, if its index pages
    /// are whole and consistent.
    fn probe_chapter(&self, chapter: u32) -> Option<u64> {
        let mut virtual_chapter = None;
        let mut expected = 0;
        for page in 0..self.geometry.index_pages_per_chapter {
            let index_page = self
                .read_page(chapter, page)
                .and_then(|bytes| self.parse_index_page(bytes))
                .ok()?;
            match virtual_chapter {
                None => virtual_chapter = Some(index_page.virtual_chapter),
                Some(vcn) if vcn != index_page.virtual_chapter => {
                    error!(
                        "inconsistent chapter {chapter} index page {page}: expected chapter {vcn}, got {}",
                        index_page.virtual_chapter
                    );
                    return None;
                }
                Some(_) => {}
            }
            if index_page.first_list != expected {
                error!(
                    "inconsistent chapter {chapter} index page {page}: expected list {expected}, got {}",
                    index_page.first_list
                );
                return None;
            }
            expected = index_page.first_list + index_page.list_count;
            index_page.validate(self.geometry.record_pages_per_chapter).ok()?;
        }

        let virtual_chapter = virtual_chapter?;
        if self.geometry.map_to_physical_chapter(virtual_chapter) != chapter {
            error!(
                "chapter {chapter} holds chapter {virtual_chapter}, out of phase with {} chapters",
                self.geometry.chapters_per_volume
            );
            return None;
        }
        Some(virtual_chapter)
    }

    /// One past the last physical chapter worth searching: trailing chapters
    /// that never made it to disk are stepped over in growing strides.
    fn find_real_end_of_volume(&self, mut limit: u32) -> u32 {
        let (mut span, mut tries) = (1u32, 0u32);
        while limit > 0 {
            let chapter = if span > limit { 0 } else { limit - span };
            if self.probe_chapter(chapter).is_none() {
                limit = chapter;
                tries += 1;
                if tries > 1 {
                    span *= 2;
                }
            } else {
                if span == 1 {
                    break;
                }
                span /= 2;
                tries = 0;
            }
        }
        limit
    }

    /// Find the chapters with the lowest and highest virtual numbers. At
    /// most one run of bad chapters is expected, next to the highest.
    fn find_chapter_limits(&self, limit: u32) -> Result<(u64, u64)> {
        let bad = u64::MAX;
        let zero = self.probe_chapter(0).unwrap_or(bad);

        let (mut left, mut right) = (0u32, limit);
        while left < right {
            let chapter = (left + right) / 2;
            if zero <= self.probe_chapter(chapter).unwrap_or(bad) {
                left = chapter + 1;
            } else {
                right = chapter;
            }
        }
        if left >= limit {
            left = 0;
        }
        let lowest = self.probe_chapter(left).unwrap_or(bad);

        let mut bad_chapters = 0;
        let highest = loop {
            right = (right + limit - 1) % limit;
            if let Some(highest) = self.probe_chapter(right) {
                break highest;
            }
            bad_chapters += 1;
            ensure!(
                bad_chapters <= MAX_BAD_CHAPTERS,
                CorruptDataSnafu {
                    reason: format!("too many bad chapters in volume: {bad_chapters}"),
                }
            );
        };
        Ok((lowest, highest))
    }

    pub fn find_volume_chapter_boundaries(&self) -> Result<ChapterBoundaries> {
        let limit = self.find_real_end_of_volume(self.geometry.chapters_per_volume);
        if limit == 0 {
            return Ok(ChapterBoundaries {
                lowest:   0,
                highest:  0,
                is_empty: true,
            });
        }
        let (lowest, highest) = self.find_chapter_limits(limit)?;
        Ok(ChapterBoundaries {
            lowest,
            highest,
            is_empty: false,
        })
    }

    pub fn page_map_last_update(&self) -> u64 { self.page_map.read().last_update() }

    pub fn save_page_map(&self, writer: &mut BufferedWriter) -> Result<()> { self.page_map.read().save(writer) }

    pub fn load_page_map(&self, reader: &mut BufferedReader) -> Result<()> { self.page_map.write().load(reader) }

    pub fn sparse_cache_contains(&self, virtual_chapter: u64, zone: usize) -> bool {
        self.sparse_cache
            .as_ref()
            .is_some_and(|cache| cache.contains(virtual_chapter, zone))
    }

    /// Bring `virtual_chapter` into the sparse cache; every zone calls this
    /// for the same chapter.
    pub fn update_sparse_cache(
        &self,
        zone: usize,
        zone_oldest: u64,
        index_oldest: u64,
        virtual_chapter: u64,
    ) -> Result<()> {
        let Some(cache) = &self.sparse_cache else {
            return Ok(());
        };
        cache.update(zone, zone_oldest, index_oldest, virtual_chapter, |vcn| {
            self.read_chapter_index(vcn)
        })
    }

    /// Search the sparse cache for `name`, in one chapter or all of them.
    /// Returns the chapter and record page of a hit.
    pub fn search_sparse_cache(
        &self,
        zone: usize,
        zone_oldest: u64,
        name: &RecordName,
        virtual_chapter: Option<u64>,
    ) -> Result<Option<(u64, u32)>> {
        let Some(cache) = &self.sparse_cache else {
            return Ok(None);
        };
        let page_map = self.page_map.read();
        cache.search(zone, zone_oldest, name, virtual_chapter, &page_map)
    }

    pub fn sparse_cache_stats(&self) -> SparseCacheStats {
        self.sparse_cache.as_ref().map(SparseCache::stats).unwrap_or_default()
    }

    /// Drop every cached page and sparse chapter.
    pub fn invalidate_caches(&self) {
        self.cache.invalidate_all();
        if let Some(cache) = &self.sparse_cache {
            cache.invalidate();
        }
    }
}
