mod chapter_index;
mod chapter_writer;
pub mod config;
mod delta;
pub mod err;
pub mod geometry;
mod index;
mod index_page_map;
pub mod layout;
mod open_chapter;
mod record_page;
mod sparse_cache;
pub mod storage;
mod volume;
mod volume_index;
mod worker;
mod zone;

pub use config::{GeometryConfig, IndexConfig, MemorySize};
pub use err::{Error, Result};
pub use geometry::Geometry;
pub use index::{Index, IndexStats, OpenMode, RebuildStats, SuspendToken};
pub use sparse_cache::SparseCacheStats;
pub use storage::{BlockStore, FileStore, MemoryStore};
pub use volume_index::VolumeIndexStats;
