use dedupe_common::{
    bits_per, BYTES_PER_RECORD, DEFAULT_CHAPTER_MEAN_DELTA_BITS, HEADER_PAGES_PER_VOLUME,
};
use dedupe_types::record::{RecordName, CHAPTER_INDEX_BITS};
use serde::{Deserialize, Serialize};
use snafu::ensure;

use crate::{
    delta::{self, DeltaCoding},
    err::{InvalidGeometrySnafu, Result},
};

/// The fixed layout of a volume, derived once from four inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub bytes_per_page:             usize,
    pub record_pages_per_chapter:   u32,
    pub chapters_per_volume:        u32,
    pub sparse_chapters_per_volume: u32,
    pub dense_chapters_per_volume:  u32,

    pub records_per_page:        u32,
    pub records_per_chapter:     u32,
    pub records_per_volume:      u64,
    pub index_pages_per_chapter: u32,
    pub pages_per_chapter:       u32,
    pub pages_per_volume:        u64,
    pub bytes_per_volume:        u64,

    pub chapter_mean_delta:      u32,
    pub chapter_payload_bits:    u32,
    pub chapter_delta_list_bits: u32,
    pub delta_lists_per_chapter: u32,
    pub chapter_address_bits:    u32,
}

impl Geometry {
    pub fn new(
        bytes_per_page: usize,
        record_pages_per_chapter: u32,
        chapters_per_volume: u32,
        sparse_chapters_per_volume: u32,
    ) -> Result<Self> {
        ensure!(
            bytes_per_page.is_power_of_two(),
            InvalidGeometrySnafu {
                reason: format!("page size {bytes_per_page} is not a power of two"),
            }
        );
        ensure!(
            bytes_per_page >= delta::MIN_PAGE_BYTES && bytes_per_page >= BYTES_PER_RECORD,
            InvalidGeometrySnafu {
                reason: format!("page size {bytes_per_page} is too small"),
            }
        );
        ensure!(
            bytes_per_page * 8 <= 1 << delta::IMMUTABLE_HEADER_BITS,
            InvalidGeometrySnafu {
                reason: format!("page size {bytes_per_page} is too large for index page offsets"),
            }
        );
        ensure!(
            record_pages_per_chapter > 0,
            InvalidGeometrySnafu {
                reason: "a chapter needs at least one record page",
            }
        );
        ensure!(
            chapters_per_volume >= 2,
            InvalidGeometrySnafu {
                reason: format!("{chapters_per_volume} chapters is too few"),
            }
        );
        ensure!(
            sparse_chapters_per_volume < chapters_per_volume,
            InvalidGeometrySnafu {
                reason: format!(
                    "{sparse_chapters_per_volume} sparse chapters leaves no dense chapter in {chapters_per_volume}"
                ),
            }
        );

        let records_per_page = (bytes_per_page / BYTES_PER_RECORD) as u32;
        let records_per_chapter = records_per_page * record_pages_per_chapter;
        let records_per_volume = records_per_chapter as u64 * chapters_per_volume as u64;

        let chapter_mean_delta = 1 << DEFAULT_CHAPTER_MEAN_DELTA_BITS;
        let chapter_payload_bits = bits_per(record_pages_per_chapter as u64 - 1);
        // Aim for about 64 records per chapter delta list.
        let chapter_delta_list_bits = bits_per((records_per_chapter as u64 - 1) | 0o77) - 6;
        let delta_lists_per_chapter = 1 << chapter_delta_list_bits;
        let chapter_address_bits = DEFAULT_CHAPTER_MEAN_DELTA_BITS - chapter_delta_list_bits
            + bits_per(records_per_chapter as u64 - 1);
        ensure!(
            chapter_delta_list_bits + chapter_address_bits <= CHAPTER_INDEX_BITS,
            InvalidGeometrySnafu {
                reason: format!(
                    "{records_per_chapter} records per chapter need more than {CHAPTER_INDEX_BITS} chapter index bits"
                ),
            }
        );

        let index_pages_per_chapter = delta::page_count(
            records_per_chapter,
            delta_lists_per_chapter,
            chapter_mean_delta,
            chapter_payload_bits,
            bytes_per_page,
        );
        let pages_per_chapter = index_pages_per_chapter + record_pages_per_chapter;
        let pages_per_volume = pages_per_chapter as u64 * chapters_per_volume as u64;
        let bytes_per_volume =
            bytes_per_page as u64 * (pages_per_volume + HEADER_PAGES_PER_VOLUME as u64);

        Ok(Self {
            bytes_per_page,
            record_pages_per_chapter,
            chapters_per_volume,
            sparse_chapters_per_volume,
            dense_chapters_per_volume: chapters_per_volume - sparse_chapters_per_volume,
            records_per_page,
            records_per_chapter,
            records_per_volume,
            index_pages_per_chapter,
            pages_per_chapter,
            pages_per_volume,
            bytes_per_volume,
            chapter_mean_delta,
            chapter_payload_bits,
            chapter_delta_list_bits,
            delta_lists_per_chapter,
            chapter_address_bits,
        })
    }

    pub fn map_to_physical_chapter(&self, virtual_chapter: u64) -> u32 {
        (virtual_chapter % self.chapters_per_volume as u64) as u32
    }

    pub fn is_sparse(&self) -> bool { self.sparse_chapters_per_volume > 0 }

    /// Whether `virtual_chapter` has aged into the sparse part of the window.
    pub fn is_chapter_sparse(&self, oldest: u64, newest: u64, virtual_chapter: u64) -> bool {
        self.is_sparse()
            && virtual_chapter >= oldest
            && virtual_chapter + self.dense_chapters_per_volume as u64 <= newest
    }

    /// Whether the window `[oldest, newest]` reaches into sparse chapters.
    pub fn has_sparse_chapters(&self, oldest: u64, newest: u64) -> bool {
        self.is_sparse() && newest >= oldest + self.dense_chapters_per_volume as u64
    }

    /// Chapters that expire when chapter `newest` opens.
    pub fn chapters_to_expire(&self, newest: u64) -> u64 {
        if newest >= self.chapters_per_volume as u64 {
            1
        } else {
            0
        }
    }

    /// The delta coding of chapter index pages.
    pub fn chapter_coding(&self) -> DeltaCoding { DeltaCoding::new(self.chapter_mean_delta, self.chapter_payload_bits) }

    /// Page `page` of physical chapter `chapter`, counting the header page.
    pub fn physical_page(&self, chapter: u32, page: u32) -> u64 {
        HEADER_PAGES_PER_VOLUME as u64 + chapter as u64 * self.pages_per_chapter as u64 + page as u64
    }

    pub fn is_record_page(&self, physical_page: u64) -> bool {
        physical_page >= HEADER_PAGES_PER_VOLUME as u64
            && (physical_page - HEADER_PAGES_PER_VOLUME as u64) % self.pages_per_chapter as u64
                >= self.index_pages_per_chapter as u64
    }

    pub fn chapter_delta_list(&self, name: &RecordName) -> u32 {
        name.chapter_delta_list(self.chapter_delta_list_bits)
    }

    pub fn chapter_delta_address(&self, name: &RecordName) -> u32 {
        name.chapter_delta_address(self.chapter_delta_list_bits, self.chapter_address_bits)
    }
}

#[cfg(test)]
mod tests {
    use dedupe_common::{DEFAULT_BYTES_PER_PAGE, SMALL_RECORD_PAGES_PER_CHAPTER};

    use super::*;

    #[test]
    fn default_small_layout() {
        let g = Geometry::new(DEFAULT_BYTES_PER_PAGE, SMALL_RECORD_PAGES_PER_CHAPTER, 1024, 0).unwrap();
        assert_eq!(g.records_per_page, 128);
        assert_eq!(g.records_per_chapter, 8192);
        assert_eq!(g.records_per_volume, 8192 * 1024);
        assert_eq!(g.chapter_payload_bits, 6);
        assert_eq!(g.chapter_delta_list_bits, 7);
        assert_eq!(g.delta_lists_per_chapter, 128);
        assert_eq!(g.chapter_address_bits, 16 - 7 + 13);
        assert_eq!(g.pages_per_chapter, g.index_pages_per_chapter + g.record_pages_per_chapter);
        assert_eq!(g.dense_chapters_per_volume + g.sparse_chapters_per_volume, g.chapters_per_volume);
        assert_eq!(g.bytes_per_volume, 4096 * (g.pages_per_volume + 1));
        assert!(g.index_pages_per_chapter >= 1);
    }

    #[test]
    fn rejects_bad_inputs() {
        assert!(Geometry::new(3000, 1, 10, 0).is_err());
        assert!(Geometry::new(16, 1, 10, 0).is_err());
        assert!(Geometry::new(4096, 0, 10, 0).is_err());
        assert!(Geometry::new(4096, 1, 1, 0).is_err());
        assert!(Geometry::new(4096, 1, 10, 10).is_err());
    }

    #[test]
    fn sparse_window() {
        let g = Geometry::new(1024, 1, 10, 5).unwrap();
        assert!(g.is_sparse());
        assert_eq!(g.dense_chapters_per_volume, 5);
        // chapter 0 turns sparse once chapter 5 is the newest
        assert!(!g.is_chapter_sparse(0, 4, 0));
        assert!(g.is_chapter_sparse(0, 5, 0));
        assert!(!g.is_chapter_sparse(0, 5, 1));
        assert!(!g.has_sparse_chapters(0, 4));
        assert!(g.has_sparse_chapters(0, 5));

        assert_eq!(g.chapters_to_expire(9), 0);
        assert_eq!(g.chapters_to_expire(10), 1);
        assert_eq!(g.map_to_physical_chapter(13), 3);
    }

    #[test]
    fn physical_pages() {
        let g = Geometry::new(256, 4, 8, 0).unwrap();
        assert_eq!(g.index_pages_per_chapter, 1);
        assert_eq!(g.physical_page(0, 0), 1);
        assert_eq!(g.physical_page(2, 3), 1 + 2 * 5 + 3);
        assert!(!g.is_record_page(0));
        assert!(!g.is_record_page(g.physical_page(2, 0)));
        assert!(g.is_record_page(g.physical_page(2, 1)));
        assert!(g.is_record_page(g.physical_page(7, 4)));
    }
}
