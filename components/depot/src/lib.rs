//! The slab depot: every physical data block of a deduplicating volume,
//! its reference count, and the journals and summaries that make those
//! counts crash safe.

pub mod allocator;
pub mod config;
pub mod depot;
pub mod err;
mod priority_table;
pub mod read_only;
pub mod recovery;
pub mod ref_counts;
pub mod scrubber;
pub mod slab;
pub mod slab_journal;
pub mod store;

pub use allocator::{AllocatorStats, BlockAllocator, DrainKind, LoadType};
pub use config::{DepotConfig, SlabConfig};
pub use depot::{DepotStats, SlabDepot};
pub use err::{Error, Result};
pub use read_only::ReadOnlyNotifier;
pub use recovery::{recover, BlockMapLookup, RecoveryJournal, RecoveryJournalEntry, RecoveryStats};
pub use ref_counts::ReferenceStatus;
pub use store::{FileMetadata, MemoryMetadata, MetadataStore};
