use bytes::{Buf, BufMut};
use dedupe_common::{
    div_round_up, BlockCount, Nonce, PhysicalBlockNumber, SlabCount, VDO_BLOCK_SIZE, ZERO_BLOCK,
};
use serde::{Deserialize, Serialize};
use snafu::ensure;

use crate::err::{CorruptComponentSnafu, InvalidArgumentSnafu, Result};

/// Reference counts are stored in 512 byte sectors, each led by the
/// journal point it was last saved at.
pub const COUNTS_PER_SECTOR: usize = 504;
pub const SECTORS_PER_BLOCK: usize = 8;
pub const COUNTS_PER_BLOCK: usize = COUNTS_PER_SECTOR * SECTORS_PER_BLOCK;
pub const SECTOR_BYTES: usize = VDO_BLOCK_SIZE / SECTORS_PER_BLOCK;

/// head, sequence, recovery point, nonce, metadata type, block map flag,
/// entry count
pub const SLAB_JOURNAL_HEADER_BYTES: usize = 8 + 8 + 8 + 8 + 1 + 1 + 2;
pub const SLAB_JOURNAL_PAYLOAD_BYTES: usize = VDO_BLOCK_SIZE - SLAB_JOURNAL_HEADER_BYTES;
/// Three byte entries.
pub const SLAB_JOURNAL_ENTRIES_PER_BLOCK: u16 = (SLAB_JOURNAL_PAYLOAD_BYTES / 3) as u16;
/// Three byte entries plus one type bit each.
pub const SLAB_JOURNAL_FULL_ENTRIES_PER_BLOCK: u16 = (SLAB_JOURNAL_PAYLOAD_BYTES * 8 / 25) as u16;

/// The most writes that can be in flight, and so the most entries that
/// may need journal space at once.
pub const MAXIMUM_USER_VIOS: u64 = 2048;

/// Journals address their blocks with an 8 bit tail offset.
pub const MAX_SLAB_JOURNAL_BLOCKS: BlockCount = 256;

/// Slab journal entries address data blocks with 23 bits.
pub const MAX_SLAB_BLOCKS: BlockCount = 1 << 23;

/// Bytes of one slab summary entry: tail block offset, fullness hint
/// with the load flag, dirty flag.
pub const SLAB_SUMMARY_ENTRY_BYTES: usize = 3;

const DEPOT_MAGIC: &[u8; 12] = b"DEDUPE-DEPOT";
const DEPOT_MAJOR_VERSION: u32 = 2;
const DEPOT_MINOR_VERSION: u32 = 0;
const DEPOT_BODY_BYTES: usize = 9 * 8 + 2 * 2 + 8 + 8 + 1 + 8;
/// magic, versions, body size, body, checksum
pub const DEPOT_STATE_BYTES: usize = DEPOT_MAGIC.len() + 4 + 4 + 8 + DEPOT_BODY_BYTES + 4;

/// The layout of every slab and the thresholds of its journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlabConfig {
    pub slab_blocks:                      BlockCount,
    pub data_blocks:                      BlockCount,
    pub reference_count_blocks:           BlockCount,
    pub slab_journal_blocks:              BlockCount,
    /// Journal length at which reference counts are flushed to free space.
    pub slab_journal_flushing_threshold:  BlockCount,
    /// Journal length at which new entries must wait for a flush.
    pub slab_journal_blocking_threshold:  BlockCount,
    /// Journal length at which an unrecovered slab must be scrubbed.
    pub slab_journal_scrubbing_threshold: BlockCount,
    pub entries_per_block:                u16,
    pub full_entries_per_block:           u16,
}

impl SlabConfig {
    /// Lay out a slab of `slab_size` blocks with a journal of
    /// `journal_blocks`.
    pub fn configure(slab_size: BlockCount, journal_blocks: BlockCount) -> Result<Self> {
        Self::configure_with_entries(slab_size, journal_blocks, SLAB_JOURNAL_ENTRIES_PER_BLOCK)
    }

    /// [`SlabConfig::configure`] with journal blocks holding
    /// `entries_per_block` entries, for small slabs.
    pub fn configure_with_entries(
        slab_size: BlockCount,
        journal_blocks: BlockCount,
        entries_per_block: u16,
    ) -> Result<Self> {
        ensure!(
            (2..=MAX_SLAB_JOURNAL_BLOCKS).contains(&journal_blocks),
            InvalidArgumentSnafu {
                reason: format!("slab journal of {journal_blocks} blocks"),
            }
        );
        ensure!(
            (1..=SLAB_JOURNAL_ENTRIES_PER_BLOCK).contains(&entries_per_block),
            InvalidArgumentSnafu {
                reason: format!("{entries_per_block} slab journal entries per block"),
            }
        );
        ensure!(
            slab_size <= MAX_SLAB_BLOCKS,
            InvalidArgumentSnafu {
                reason: format!("slab of {slab_size} blocks exceeds {MAX_SLAB_BLOCKS}"),
            }
        );
        ensure!(
            slab_size > journal_blocks + 1,
            InvalidArgumentSnafu {
                reason: format!("slab of {slab_size} blocks cannot hold a {journal_blocks} block journal"),
            }
        );

        let counted = slab_size - journal_blocks;
        // a reference block covers COUNTS_PER_BLOCK data blocks and takes one
        let reference_count_blocks = div_round_up(counted, COUNTS_PER_BLOCK as u64 + 1);
        let data_blocks = counted - reference_count_blocks;

        let flushing = (3 * journal_blocks + 3) / 4;
        let remaining = journal_blocks - flushing;
        let mut blocking = flushing + remaining * 5 / 7;
        let minimal_extra_space = 1 + MAXIMUM_USER_VIOS / entries_per_block as u64;
        let mut scrubbing = blocking;
        if journal_blocks > minimal_extra_space {
            scrubbing = journal_blocks - minimal_extra_space;
        }
        if blocking > scrubbing {
            blocking = scrubbing;
        }

        Ok(Self {
            slab_blocks: slab_size,
            data_blocks,
            reference_count_blocks,
            slab_journal_blocks: journal_blocks,
            slab_journal_flushing_threshold: flushing,
            slab_journal_blocking_threshold: blocking,
            slab_journal_scrubbing_threshold: scrubbing,
            entries_per_block,
            full_entries_per_block: (entries_per_block as u64 * SLAB_JOURNAL_FULL_ENTRIES_PER_BLOCK as u64
                / SLAB_JOURNAL_ENTRIES_PER_BLOCK as u64)
                .max(1) as u16,
        })
    }
}

/// The persistent description of a depot: where its slabs are and how
/// they are split into zones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepotConfig {
    pub slab_config: SlabConfig,
    pub first_block: PhysicalBlockNumber,
    pub last_block:  PhysicalBlockNumber,
    pub zone_count:  u8,
    pub nonce:       Nonce,
}

impl DepotConfig {
    /// Fit as many slabs as possible into `[first_block, last_block)`.
    pub fn new(
        slab_config: SlabConfig,
        first_block: PhysicalBlockNumber,
        last_block: PhysicalBlockNumber,
        zone_count: u8,
        nonce: Nonce,
    ) -> Result<Self> {
        ensure!(
            first_block > ZERO_BLOCK,
            InvalidArgumentSnafu {
                reason: "the zero block cannot belong to a slab",
            }
        );
        ensure!(
            zone_count > 0,
            InvalidArgumentSnafu {
                reason: "a depot needs at least one zone",
            }
        );
        let slab_count = last_block.saturating_sub(first_block) / slab_config.slab_blocks;
        ensure!(
            slab_count >= zone_count as u64,
            InvalidArgumentSnafu {
                reason: format!("{slab_count} slabs cannot fill {zone_count} zones"),
            }
        );
        Ok(Self {
            slab_config,
            first_block,
            last_block: first_block + slab_count * slab_config.slab_blocks,
            zone_count,
            nonce,
        })
    }

    pub fn slab_count(&self) -> SlabCount {
        ((self.last_block - self.first_block) / self.slab_config.slab_blocks) as SlabCount
    }

    pub fn data_blocks(&self) -> BlockCount { self.slab_count() as u64 * self.slab_config.data_blocks }

    /// Slabs zone `zone` owns.
    pub fn zone_slab_count(&self, zone: usize) -> usize {
        let slabs = self.slab_count() as usize;
        let zones = self.zone_count as usize;
        slabs / zones + usize::from(zone < slabs % zones)
    }

    pub fn summary_blocks_per_zone(&self) -> BlockCount {
        let most = self.zone_slab_count(0) * SLAB_SUMMARY_ENTRY_BYTES;
        div_round_up(most as u64, VDO_BLOCK_SIZE as u64)
    }

    /// The first block of zone `zone`'s slab summary.
    pub fn summary_origin(&self, zone: usize) -> PhysicalBlockNumber {
        self.last_block + zone as u64 * self.summary_blocks_per_zone()
    }

    /// Blocks the depot spans, summaries included.
    pub fn total_blocks(&self) -> BlockCount {
        self.last_block + self.zone_count as u64 * self.summary_blocks_per_zone()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(DEPOT_BODY_BYTES);
        let slab = &self.slab_config;
        body.put_u64_le(slab.slab_blocks);
        body.put_u64_le(slab.data_blocks);
        body.put_u64_le(slab.reference_count_blocks);
        body.put_u64_le(slab.slab_journal_blocks);
        body.put_u64_le(slab.slab_journal_flushing_threshold);
        body.put_u64_le(slab.slab_journal_blocking_threshold);
        body.put_u64_le(slab.slab_journal_scrubbing_threshold);
        body.put_u64_le(0);
        body.put_u64_le(0);
        body.put_u16_le(slab.entries_per_block);
        body.put_u16_le(slab.full_entries_per_block);
        body.put_u64_le(self.first_block);
        body.put_u64_le(self.last_block);
        body.put_u8(self.zone_count);
        body.put_u64_le(self.nonce);

        let mut buf = Vec::with_capacity(DEPOT_STATE_BYTES);
        buf.put_slice(DEPOT_MAGIC);
        buf.put_u32_le(DEPOT_MAJOR_VERSION);
        buf.put_u32_le(DEPOT_MINOR_VERSION);
        buf.put_u64_le(body.len() as u64);
        buf.put_slice(&body);
        buf.put_u32_le(crc32fast::hash(&buf));
        buf
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let corrupt = |reason: String| {
            CorruptComponentSnafu {
                component: "slab depot state",
                reason,
            }
            .build()
        };
        ensure!(
            raw.len() == DEPOT_STATE_BYTES,
            CorruptComponentSnafu {
                component: "slab depot state",
                reason: format!("{} bytes, expected {DEPOT_STATE_BYTES}", raw.len()),
            }
        );
        let (content, mut checksum) = raw.split_at(DEPOT_STATE_BYTES - 4);
        if crc32fast::hash(content) != checksum.get_u32_le() {
            return Err(corrupt("checksum mismatch".to_string()));
        }

        let mut buf = content;
        if &buf[..DEPOT_MAGIC.len()] != DEPOT_MAGIC {
            return Err(corrupt("bad magic".to_string()));
        }
        buf.advance(DEPOT_MAGIC.len());
        let (major, minor) = (buf.get_u32_le(), buf.get_u32_le());
        if (major, minor) != (DEPOT_MAJOR_VERSION, DEPOT_MINOR_VERSION) {
            return Err(corrupt(format!("unsupported version {major}.{minor}")));
        }
        let size = buf.get_u64_le();
        if size != DEPOT_BODY_BYTES as u64 || buf.remaining() != DEPOT_BODY_BYTES {
            return Err(corrupt(format!("body of {size} bytes, expected {DEPOT_BODY_BYTES}")));
        }

        let slab_blocks = buf.get_u64_le();
        let data_blocks = buf.get_u64_le();
        let reference_count_blocks = buf.get_u64_le();
        let slab_journal_blocks = buf.get_u64_le();
        let flushing = buf.get_u64_le();
        let blocking = buf.get_u64_le();
        let scrubbing = buf.get_u64_le();
        // reserved
        buf.advance(16);
        let slab_config = SlabConfig {
            slab_blocks,
            data_blocks,
            reference_count_blocks,
            slab_journal_blocks,
            slab_journal_flushing_threshold: flushing,
            slab_journal_blocking_threshold: blocking,
            slab_journal_scrubbing_threshold: scrubbing,
            entries_per_block: buf.get_u16_le(),
            full_entries_per_block: buf.get_u16_le(),
        };
        if data_blocks + reference_count_blocks + slab_journal_blocks != slab_blocks {
            return Err(corrupt(format!("slab of {slab_blocks} blocks does not add up")));
        }
        let config = Self {
            slab_config,
            first_block: buf.get_u64_le(),
            last_block: buf.get_u64_le(),
            zone_count: buf.get_u8(),
            nonce: buf.get_u64_le(),
        };
        if config.zone_count == 0 || config.last_block < config.first_block {
            return Err(corrupt("bad slab range or zone count".to_string()));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_journal_thresholds() {
        let config = SlabConfig::configure(1 << 15, 224).unwrap();
        assert_eq!(config.slab_journal_flushing_threshold, 168);
        assert_eq!(config.slab_journal_blocking_threshold, 208);
        assert_eq!(config.slab_journal_scrubbing_threshold, 222);
        assert_eq!(
            config.data_blocks + config.reference_count_blocks + config.slab_journal_blocks,
            config.slab_blocks
        );
        assert!(config.data_blocks <= config.reference_count_blocks * COUNTS_PER_BLOCK as u64);
    }

    #[test]
    fn blocking_never_passes_scrubbing() {
        let config = SlabConfig::configure_with_entries(64, 8, 16).unwrap();
        assert_eq!(config.slab_journal_flushing_threshold, 6);
        assert!(config.slab_journal_blocking_threshold <= config.slab_journal_scrubbing_threshold);
        assert_eq!(config.data_blocks, 55);
    }

    #[test]
    fn state_is_exact() {
        let slab = SlabConfig::configure_with_entries(64, 8, 16).unwrap();
        let config = DepotConfig::new(slab, 1, 1 + 64 * 5 + 10, 2, 99).unwrap();
        assert_eq!(config.slab_count(), 5);
        assert_eq!(config.last_block, 321);
        assert_eq!((config.zone_slab_count(0), config.zone_slab_count(1)), (3, 2));

        let raw = config.encode();
        assert_eq!(raw.len(), DEPOT_STATE_BYTES);
        assert_eq!(DepotConfig::decode(&raw).unwrap(), config);

        assert!(DepotConfig::decode(&raw[1..]).is_err());
        let mut bad = raw.clone();
        bad[20] ^= 1;
        assert!(DepotConfig::decode(&bad).is_err());
    }
}
