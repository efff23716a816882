use std::{path::PathBuf, str::FromStr, sync::Arc};

use clap::{Args, Subcommand};
use dedupe_common::{DEDUPE_DEBUG_INDEX_PATH, RECORD_NAME_SIZE};
use dedupe_index::{FileStore, Index, IndexConfig, MemorySize, OpenMode};
use dedupe_types::{
    record::{RecordData, RecordName},
    request::Request,
};
use dedupe_utils::readable_size::ReadableSize;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use snafu::{ResultExt, Whatever};
use tracing::info;

use super::{init_logging, print_json, LOGGING_OPTIONS_HEADER};

const INDEX_OPTIONS_HEADER: &str = "Index options";

#[derive(Debug, Clone, Args)]
#[command(long_about = r"

Create, load and exercise a deduplication index kept in a single file.
Settings not given on the command line are read from DEDUPE_* variables
in the environment or a .env file.
")]
pub struct IndexArgs {
    #[command(subcommand)]
    pub action: IndexAction,

    #[arg(
        long,
        global = true,
        help = "File holding the index",
        help_heading = INDEX_OPTIONS_HEADER,
        default_value = DEDUPE_DEBUG_INDEX_PATH,
    )]
    pub path: PathBuf,

    #[arg(
        long,
        global = true,
        help = "Memory budget: 256MiB, 512MiB, 768MiB or whole GiB",
        help_heading = INDEX_OPTIONS_HEADER,
        value_parser = ReadableSize::from_str,
    )]
    pub memory_size: Option<ReadableSize>,

    #[arg(long, global = true, help = "Keep most chapters sparse", help_heading = INDEX_OPTIONS_HEADER)]
    pub sparse: bool,

    #[arg(long, global = true, help = "Number of zone threads", help_heading = INDEX_OPTIONS_HEADER)]
    pub zones: Option<usize>,

    #[arg(
        short,
        long,
        global = true,
        help = "Log level",
        help_heading = LOGGING_OPTIONS_HEADER,
        default_value = "info",
    )]
    pub level: String,
}

#[derive(Debug, Clone, Subcommand)]
pub enum IndexAction {
    /// Format a new, empty index.
    Create,
    /// Post generated names, some of them repeats, and report what was
    /// found.
    Stress {
        #[arg(long, default_value = "100000")]
        records:           u64,
        #[arg(long, default_value = "25", value_parser = clap::value_parser!(u32).range(0..=100))]
        duplicate_percent: u32,
        #[arg(long, default_value = "1")]
        seed:              u64,
    },
    /// Rebuild the volume index from the chapters on disk.
    Rebuild,
    /// Load the index and print its counters.
    Stats,
}

#[derive(Debug, Default, Serialize)]
struct StressReport {
    posted:     u64,
    duplicates: u64,
    found:      u64,
}

impl IndexArgs {
    fn config(&self) -> Result<IndexConfig, Whatever> {
        let mut config = IndexConfig::from_env().whatever_context("failed to read the index config")?;
        if let Some(size) = self.memory_size {
            config.memory_size = MemorySize::from_readable(size).whatever_context("bad memory size")?;
        }
        if let Some(zones) = self.zones {
            config = config.with_zone_count(zones);
        }
        if self.sparse {
            config = config.with_sparse(true);
        }
        config.validate().whatever_context("invalid index config")?;
        Ok(config)
    }

    fn open(&self, mode: OpenMode) -> Result<Index, Whatever> {
        let config = self.config()?;
        let bytes = Index::required_store_bytes(&config).whatever_context("failed to size the index")?;
        let store = FileStore::open(&self.path, bytes)
            .with_whatever_context(|_| format!("failed to open {}", self.path.display()))?;
        info!("opening {} ({mode:?}, {})", self.path.display(), ReadableSize(bytes));
        Index::open(config, Arc::new(store), mode).whatever_context("failed to open the index")
    }

    pub fn run(&self) -> Result<(), Whatever> {
        init_logging(&self.level)?;
        match &self.action {
            IndexAction::Create => {
                let index = self.open(OpenMode::Create)?;
                index.close().whatever_context("failed to close the index")?;
                info!("created index {}", self.path.display());
            }
            IndexAction::Stress {
                records,
                duplicate_percent,
                seed,
            } => {
                let index = self.open(OpenMode::Load)?;
                let report = stress(&index, *records, *duplicate_percent, *seed)?;
                print_json(&report)?;
                print_json(&index.stats())?;
                index.close().whatever_context("failed to close the index")?;
            }
            IndexAction::Rebuild => {
                let index = self.open(OpenMode::Rebuild)?;
                print_json(&index.rebuild_stats())?;
                index.close().whatever_context("failed to close the index")?;
            }
            IndexAction::Stats => {
                let index = self.open(OpenMode::NoRebuild)?;
                print_json(&index.stats())?;
                index.close().whatever_context("failed to close the index")?;
            }
        }
        Ok(())
    }
}

fn stress(index: &Index, records: u64, duplicate_percent: u32, seed: u64) -> Result<StressReport, Whatever> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut posted: Vec<RecordName> = Vec::new();
    let mut report = StressReport::default();
    for i in 0..records {
        let repeat = !posted.is_empty() && rng.gen_range(0..100) < duplicate_percent;
        let name = if repeat {
            report.duplicates += 1;
            posted[rng.gen_range(0..posted.len())]
        } else {
            let mut bytes = [0u8; RECORD_NAME_SIZE];
            rng.fill(&mut bytes);
            let name = RecordName::new(bytes);
            posted.push(name);
            name
        };
        let response = index
            .process_blocking(Request::post(name, RecordData::from_u64(i)))
            .whatever_context("post failed")?;
        report.posted += 1;
        report.found += response.found as u64;
    }
    index.flush();
    info!("posted {} names, {} found", report.posted, report.found);
    Ok(report)
}
