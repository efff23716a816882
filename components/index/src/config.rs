use dedupe_common::{
    DEFAULT_BYTES_PER_PAGE, DEFAULT_CACHE_CHAPTERS, DEFAULT_CHAPTERS_PER_VOLUME,
    DEFAULT_PAGE_CACHE_PAGES, DEFAULT_READ_THREADS, DEFAULT_RECORD_PAGES_PER_CHAPTER,
    DEFAULT_SPARSE_SAMPLE_RATE, DEFAULT_VOLUME_INDEX_MEAN_DELTA, MAX_ZONES,
    SMALL_RECORD_PAGES_PER_CHAPTER, SPARSE_CHAPTER_MULTIPLIER,
};
use dedupe_utils::readable_size::ReadableSize;
use serde::{Deserialize, Serialize};
use snafu::ensure;
use tracing::debug;

use crate::{
    err::{InvalidConfigSnafu, Result},
    geometry::Geometry,
};

/// The coarse memory budgets an index can be sized for.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Eq, PartialEq)]
pub enum MemorySize {
    Mb256,
    Mb512,
    Mb768,
    Gb(u32),
}

impl MemorySize {
    pub fn from_readable(size: ReadableSize) -> Result<Self> {
        let memory = match size {
            s if s == ReadableSize::mb(256) => MemorySize::Mb256,
            s if s == ReadableSize::mb(512) => MemorySize::Mb512,
            s if s == ReadableSize::mb(768) => MemorySize::Mb768,
            s if s.as_bytes() % ReadableSize::gb(1).as_bytes() == 0 && s.as_gb() > 0 => {
                MemorySize::Gb(s.as_gb() as u32)
            }
            _ => {
                return InvalidConfigSnafu {
                    reason: format!("unsupported memory size {size}"),
                }
                .fail()
            }
        };
        Ok(memory)
    }

    /// Record pages per chapter and chapters for a dense volume.
    fn layout(&self) -> (u32, u32) {
        match self {
            MemorySize::Mb256 => (SMALL_RECORD_PAGES_PER_CHAPTER, DEFAULT_CHAPTERS_PER_VOLUME),
            MemorySize::Mb512 => (2 * SMALL_RECORD_PAGES_PER_CHAPTER, DEFAULT_CHAPTERS_PER_VOLUME),
            MemorySize::Mb768 => (3 * SMALL_RECORD_PAGES_PER_CHAPTER, DEFAULT_CHAPTERS_PER_VOLUME),
            MemorySize::Gb(n) => (DEFAULT_RECORD_PAGES_PER_CHAPTER, n * DEFAULT_CHAPTERS_PER_VOLUME),
        }
    }
}

/// An explicit volume layout, bypassing the memory size classes.
#[derive(Debug, Deserialize, Serialize, Clone, Eq, PartialEq)]
pub struct GeometryConfig {
    pub bytes_per_page:             usize,
    pub record_pages_per_chapter:   u32,
    pub chapters_per_volume:        u32,
    pub sparse_chapters_per_volume: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone, Eq, PartialEq)]
pub struct IndexConfig {
    pub memory_size:             MemorySize,
    pub sparse:                  bool,
    /// Number of zone threads requests are partitioned over.
    pub zone_count:              usize,
    /// Number of sparse chapter indexes kept decoded in memory.
    pub cache_chapters:          usize,
    pub volume_index_mean_delta: u32,
    /// One name in this many is a hook in a sparse index.
    pub sparse_sample_rate:      u32,
    /// Identifies this index's pages on disk.
    pub nonce:                   u64,
    pub bytes_per_page:          usize,
    pub geometry:                Option<GeometryConfig>,
    pub page_cache_pages:        u64,
    pub read_threads:            usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            memory_size:             MemorySize::Mb256,
            sparse:                  false,
            zone_count:              dedupe_utils::default_zone_count(),
            cache_chapters:          DEFAULT_CACHE_CHAPTERS,
            volume_index_mean_delta: DEFAULT_VOLUME_INDEX_MEAN_DELTA,
            sparse_sample_rate:      DEFAULT_SPARSE_SAMPLE_RATE,
            nonce:                   0x6465_6475_7065_0001,
            bytes_per_page:          DEFAULT_BYTES_PER_PAGE,
            geometry:                None,
            page_cache_pages:        DEFAULT_PAGE_CACHE_PAGES,
            read_threads:            DEFAULT_READ_THREADS,
        }
    }
}

impl IndexConfig {
    /// Apply `DEDUPE_*` overrides from the environment or a `.env` file.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        let env = |e: snafu::Whatever| InvalidConfigSnafu {
            reason: e.to_string(),
        }
        .build();
        if let Some(zones) = dedupe_utils::env::var_parsed("DEDUPE_ZONE_COUNT").map_err(env)? {
            config.zone_count = zones;
        }
        if let Some(chapters) = dedupe_utils::env::var_parsed("DEDUPE_CACHE_CHAPTERS").map_err(env)? {
            config.cache_chapters = chapters;
        }
        if let Some(sparse) = dedupe_utils::env::var_parsed("DEDUPE_SPARSE").map_err(env)? {
            config.sparse = sparse;
        }
        if let Some(size) = dedupe_utils::env::var("DEDUPE_MEMORY_SIZE").map_err(env)? {
            let size: ReadableSize = size
                .parse()
                .map_err(|reason: String| InvalidConfigSnafu { reason }.build())?;
            config.memory_size = MemorySize::from_readable(size)?;
        }
        debug!("index config from env: {:?}", config);
        config.validate()?;
        Ok(config)
    }

    pub fn with_zone_count(mut self, zone_count: usize) -> Self {
        self.zone_count = zone_count;
        self
    }

    pub fn with_sparse(mut self, sparse: bool) -> Self {
        self.sparse = sparse;
        self
    }

    pub fn with_geometry(mut self, geometry: GeometryConfig) -> Self {
        self.geometry = Some(geometry);
        self
    }

    pub fn with_cache_chapters(mut self, cache_chapters: usize) -> Self {
        self.cache_chapters = cache_chapters;
        self
    }

    pub fn with_sample_rate(mut self, rate: u32) -> Self {
        self.sparse_sample_rate = rate;
        self
    }

    pub fn with_memory_size(mut self, memory_size: MemorySize) -> Self {
        self.memory_size = memory_size;
        self
    }

    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.nonce = nonce;
        self
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            (1..=MAX_ZONES).contains(&self.zone_count),
            InvalidConfigSnafu {
                reason: format!("zone count {} not in 1..={}", self.zone_count, MAX_ZONES),
            }
        );
        ensure!(
            self.volume_index_mean_delta > 0 && self.volume_index_mean_delta.is_power_of_two(),
            InvalidConfigSnafu {
                reason: format!("mean delta {} must be a power of two", self.volume_index_mean_delta),
            }
        );
        ensure!(
            !self.sparse || self.sparse_sample_rate > 0,
            InvalidConfigSnafu {
                reason: "a sparse index needs a sample rate",
            }
        );
        ensure!(
            !self.sparse || self.cache_chapters > 0,
            InvalidConfigSnafu {
                reason: "a sparse index needs a sparse cache",
            }
        );
        ensure!(
            self.read_threads > 0,
            InvalidConfigSnafu {
                reason: "at least one volume reader is required",
            }
        );
        Ok(())
    }

    /// The sample rate in effect: only sparse indexes have hooks.
    pub fn effective_sample_rate(&self) -> u32 {
        if self.sparse {
            self.sparse_sample_rate
        } else {
            0
        }
    }

    pub fn make_geometry(&self) -> Result<Geometry> {
        if let Some(g) = &self.geometry {
            return Geometry::new(
                g.bytes_per_page,
                g.record_pages_per_chapter,
                g.chapters_per_volume,
                g.sparse_chapters_per_volume,
            );
        }

        let (record_pages, mut chapters) = self.memory_size.layout();
        let mut sparse_chapters = 0;
        if self.sparse {
            chapters *= SPARSE_CHAPTER_MULTIPLIER;
            sparse_chapters = 19 * chapters / 20;
        }
        Geometry::new(self.bytes_per_page, record_pages, chapters, sparse_chapters)
    }

    /// Load a config from a JSON document.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: IndexConfig = serde_json::from_str(text).map_err(|e| {
            InvalidConfigSnafu {
                reason: e.to_string(),
            }
            .build()
        })?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sizes_map_to_layouts() {
        assert_eq!(MemorySize::from_readable(ReadableSize::mb(512)).unwrap(), MemorySize::Mb512);
        assert_eq!(MemorySize::from_readable(ReadableSize::gb(2)).unwrap(), MemorySize::Gb(2));
        assert!(MemorySize::from_readable(ReadableSize::mb(300)).is_err());

        let config = IndexConfig::default().with_zone_count(1);
        let geometry = config.make_geometry().unwrap();
        assert_eq!(geometry.record_pages_per_chapter, SMALL_RECORD_PAGES_PER_CHAPTER);
        assert_eq!(geometry.chapters_per_volume, DEFAULT_CHAPTERS_PER_VOLUME);
        assert_eq!(geometry.sparse_chapters_per_volume, 0);
    }

    #[test]
    fn sparse_multiplies_chapters() {
        let config = IndexConfig::default().with_zone_count(1).with_sparse(true);
        let geometry = config.make_geometry().unwrap();
        assert_eq!(geometry.chapters_per_volume, 10 * DEFAULT_CHAPTERS_PER_VOLUME);
        assert_eq!(geometry.sparse_chapters_per_volume, 19 * 10 * DEFAULT_CHAPTERS_PER_VOLUME / 20);
        assert_eq!(config.effective_sample_rate(), DEFAULT_SPARSE_SAMPLE_RATE);
        assert_eq!(config.with_sparse(false).effective_sample_rate(), 0);
    }

    #[test]
    fn validation() {
        assert!(IndexConfig::default().with_zone_count(0).validate().is_err());
        assert!(IndexConfig::default().with_zone_count(MAX_ZONES + 1).validate().is_err());
        assert!(IndexConfig::default()
            .with_zone_count(1)
            .with_sparse(true)
            .with_sample_rate(0)
            .validate()
            .is_err());

        let text = serde_json::to_string(&IndexConfig::default().with_zone_count(3)).unwrap();
        assert_eq!(IndexConfig::from_json(&text).unwrap().zone_count, 3);
    }
}
