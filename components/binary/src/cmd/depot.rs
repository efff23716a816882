use std::{path::PathBuf, sync::Arc};

use clap::{Args, Subcommand};
use dedupe_common::VDO_BLOCK_SIZE;
use dedupe_depot::{
    config::DEPOT_STATE_BYTES, DepotConfig, DrainKind, FileMetadata, LoadType, MetadataStore, SlabConfig,
    SlabDepot,
};
use dedupe_types::journal::{JournalOperation, JournalPoint};
use snafu::{ResultExt, Whatever};
use tracing::info;

use super::{init_logging, print_json, LOGGING_OPTIONS_HEADER};

const DEPOT_OPTIONS_HEADER: &str = "Depot options";

/// The depot state lives in the block after the zero block.
const STATE_BLOCK: u64 = 1;
const FIRST_SLAB_BLOCK: u64 = 2;

#[derive(Debug, Clone, Args)]
#[command(long_about = r"

Format and exercise a slab depot kept in a single file. Block 1 of the
file holds the depot state, slabs start at block 2 and the slab
summaries follow the last slab.
")]
pub struct DepotArgs {
    #[command(subcommand)]
    pub action: DepotAction,

    #[arg(
        long,
        global = true,
        help = "File holding the depot",
        help_heading = DEPOT_OPTIONS_HEADER,
        default_value = "/tmp/dedupe.depot",
    )]
    pub path: PathBuf,

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
pub enum DepotAction {
    /// Lay out a new depot.
    Format {
        #[arg(long, default_value = "16")]
        slabs:          u64,
        #[arg(long, default_value = "8192")]
        slab_blocks:    u64,
        #[arg(long, default_value = "224")]
        journal_blocks: u64,
        #[arg(long, default_value = "1")]
        zones:          u8,
        #[arg(long, default_value = "0")]
        nonce:          u64,
    },
    /// Allocate and reference blocks, spreading them over the zones, then
    /// save the depot.
    Fill {
        #[arg(long, default_value = "1000")]
        blocks: u64,
    },
    /// Add slabs to the end of the depot.
    Grow {
        #[arg(long)]
        slabs: u64,
    },
    /// Load the depot, scrubbing anything left unclean, and print its
    /// counters.
    Stats,
}

impl DepotArgs {
    pub fn run(&self) -> Result<(), Whatever> {
        init_logging(&self.level)?;
        match &self.action {
            DepotAction::Format {
                slabs,
                slab_blocks,
                journal_blocks,
                zones,
                nonce,
            } => {
                let slab = SlabConfig::configure(*slab_blocks, *journal_blocks).whatever_context("bad slab layout")?;
                let last_block = FIRST_SLAB_BLOCK + slabs * slab_blocks;
                let config = DepotConfig::new(slab, FIRST_SLAB_BLOCK, last_block, *zones, *nonce)
                    .whatever_context("bad depot layout")?;
                let store = self.store(config.total_blocks())?;
                let depot = SlabDepot::format(config, store.clone()).whatever_context("failed to format")?;
                save_state(&depot, &store)?;
                info!("formatted {} with {} slabs", self.path.display(), config.slab_count());
            }
            DepotAction::Fill { blocks } => {
                let (depot, store) = self.load(None)?;
                fill(&depot, *blocks)?;
                depot.drain(DrainKind::Save).whatever_context("failed to save")?;
                save_state(&depot, &store)?;
                print_json(&depot.stats())?;
            }
            DepotAction::Grow { slabs } => {
                let config = self.read_config()?;
                let new_last = config.last_block + slabs * config.slab_config.slab_blocks;
                let grown = DepotConfig {
                    last_block: new_last,
                    ..config
                };
                let (depot, store) = self.load(Some(grown.total_blocks()))?;
                let added = depot.prepare_to_grow(new_last).whatever_context("cannot grow")?;
                depot.use_new_slabs().whatever_context("failed to add slabs")?;
                depot.drain(DrainKind::Save).whatever_context("failed to save")?;
                save_state(&depot, &store)?;
                info!("added {added} slabs");
            }
            DepotAction::Stats => {
                let (depot, _) = self.load(None)?;
                let scrubbed = depot.scrub_all_unrecovered().whatever_context("failed to scrub")?;
                if scrubbed > 0 {
                    info!("scrubbed {scrubbed} slabs");
                }
                print_json(&depot.stats())?;
            }
        }
        Ok(())
    }

    fn store(&self, blocks: u64) -> Result<Arc<FileMetadata>, Whatever> {
        let store = FileMetadata::open(&self.path, blocks)
            .with_whatever_context(|_| format!("failed to open {}", self.path.display()))?;
        Ok(Arc::new(store))
    }

    fn read_config(&self) -> Result<DepotConfig, Whatever> {
        let store = self.store(0)?;
        let mut block = vec![0u8; VDO_BLOCK_SIZE];
        store.read_block(STATE_BLOCK, &mut block).whatever_context("failed to read the depot state")?;
        DepotConfig::decode(&block[..DEPOT_STATE_BYTES]).whatever_context("bad depot state")
    }

    /// Open and load the depot, growing the file to `blocks` if given.
    fn load(&self, blocks: Option<u64>) -> Result<(SlabDepot, Arc<FileMetadata>), Whatever> {
        let config = self.read_config()?;
        let store = self.store(blocks.unwrap_or(0))?;
        let depot = SlabDepot::new(config, store.clone()).whatever_context("failed to build the depot")?;
        depot.load(LoadType::Normal).whatever_context("failed to load")?;
        Ok((depot, store))
    }
}

fn save_state(depot: &SlabDepot, store: &FileMetadata) -> Result<(), Whatever> {
    let mut block = depot.encode_state();
    block.resize(VDO_BLOCK_SIZE, 0);
    store.write_block(STATE_BLOCK, &block).whatever_context("failed to write the depot state")?;
    store.sync().whatever_context("failed to sync")
}

fn fill(depot: &SlabDepot, blocks: u64) -> Result<(), Whatever> {
    let mut point = JournalPoint::new(1, 0);
    for i in 0..blocks {
        let zone = i as usize % depot.zone_count();
        let pbn = depot.allocate_block(zone).whatever_context("allocation failed")?;
        depot
            .modify_reference_count(pbn, JournalOperation::DataIncrement, point)
            .whatever_context("reference failed")?;
        point.advance(u16::MAX);
    }
    info!("referenced {blocks} blocks");
    Ok(())
}
