//! Where an index keeps its pieces in its store, and the state block that
//! says whether the saved pieces can be trusted.

use std::sync::Arc;

use bytes::{Buf, BufMut};
use snafu::ensure;

use crate::{
    err::{CorruptDataSnafu, InvalidConfigSnafu, Result},
    geometry::Geometry,
    index_page_map::IndexPageMap,
    open_chapter,
    storage::{BlockStore, Region},
};

const STATE_MAGIC: &[u8; 18] = b"DEDUPE-INDEX-STATE";
const STATE_VERSION: u32 = 1;
// magic, version, newest, oldest, last save, zone count, clean, checksum
const STATE_BYTES: usize = STATE_MAGIC.len() + 4 + 8 * 3 + 4 + 1 + 4;

/// The regions of one index, in store order. The volume index save goes
/// last since its size depends on the zone count it was written with.
#[derive(Debug, Clone)]
pub struct IndexLayout {
    pub volume:       Region,
    pub state:        Region,
    pub page_map:     Region,
    pub open_chapter: Region,
    pub volume_index: Region,
}

fn round_to_page(bytes: u64, geometry: &Geometry) -> u64 {
    dedupe_common::div_round_up(bytes, geometry.bytes_per_page as u64) * geometry.bytes_per_page as u64
}

impl IndexLayout {
    /// Store bytes an index of `geometry` needs.
    pub fn required_bytes(geometry: &Geometry, volume_index_bytes: u64) -> u64 {
        let page = geometry.bytes_per_page as u64;
        geometry.bytes_per_volume
            + page
            + round_to_page(IndexPageMap::save_bytes(geometry), geometry)
            + round_to_page(open_chapter::save_bytes(geometry), geometry)
            + round_to_page(volume_index_bytes, geometry)
            + page
    }

    pub fn new(store: Arc<dyn BlockStore>, geometry: &Geometry, volume_index_bytes: u64) -> Result<Self> {
        let required = Self::required_bytes(geometry, volume_index_bytes);
        ensure!(
            store.size() >= required,
            InvalidConfigSnafu {
                reason: format!("store of {} bytes is smaller than the {required} bytes needed", store.size()),
            }
        );

        let page = geometry.bytes_per_page as u64;
        let page_map_bytes = round_to_page(IndexPageMap::save_bytes(geometry), geometry);
        let open_chapter_bytes = round_to_page(open_chapter::save_bytes(geometry), geometry);
        let state_at = geometry.bytes_per_volume;
        let page_map_at = state_at + page;
        let open_chapter_at = page_map_at + page_map_bytes;
        let volume_index_at = open_chapter_at + open_chapter_bytes;

        let volume = Region::new(store.clone(), "volume", 0, geometry.bytes_per_volume);
        let state = Region::new(store.clone(), "index state", state_at, page);
        let page_map = Region::new(store.clone(), "index page map", page_map_at, page_map_bytes);
        let open_chapter = Region::new(store.clone(), "open chapter", open_chapter_at, open_chapter_bytes);
        let volume_index = Region::new(
            store.clone(),
            "volume index",
            volume_index_at,
            store.size() - volume_index_at,
        );
        Ok(Self {
            volume,
            state,
            page_map,
            open_chapter,
            volume_index,
        })
    }
}

/// The chapter window and save bookkeeping of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexState {
    pub newest_chapter: u64,
    pub oldest_chapter: u64,
    /// The newest chapter at the last save.
    pub last_save:      u64,
    pub zone_count:     u32,
    /// Whether the saved pieces match the volume.
    pub clean:          bool,
}

impl IndexState {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(STATE_BYTES);
        buf.put_slice(STATE_MAGIC);
        buf.put_u32_le(STATE_VERSION);
        buf.put_u64_le(self.newest_chapter);
        buf.put_u64_le(self.oldest_chapter);
        buf.put_u64_le(self.last_save);
        buf.put_u32_le(self.zone_count);
        buf.put_u8(self.clean as u8);
        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);
        buf
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        ensure!(
            raw.len() >= STATE_BYTES && raw[..STATE_MAGIC.len()] == STATE_MAGIC[..],
            CorruptDataSnafu {
                reason: "index state block has a bad magic number",
            }
        );
        let (body, mut tail) = raw[..STATE_BYTES].split_at(STATE_BYTES - 4);
        ensure!(
            crc32fast::hash(body) == tail.get_u32_le(),
            CorruptDataSnafu {
                reason: "index state block checksum mismatch",
            }
        );

        let mut buf = &body[STATE_MAGIC.len()..];
        let version = buf.get_u32_le();
        ensure!(
            version == STATE_VERSION,
            CorruptDataSnafu {
                reason: format!("unknown index state version {version}"),
            }
        );
        Ok(Self {
            newest_chapter: buf.get_u64_le(),
            oldest_chapter: buf.get_u64_le(),
            last_save:      buf.get_u64_le(),
            zone_count:     buf.get_u32_le(),
            clean:          buf.get_u8() != 0,
        })
    }

    pub fn read(region: &Region) -> Result<Self> {
        let mut raw = vec![0u8; STATE_BYTES];
        region.read(0, &mut raw)?;
        Self::decode(&raw)
    }

    pub fn write(&self, region: &Region) -> Result<()> {
        region.write(0, &self.encode())?;
        region.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[test]
    fn regions_follow_each_other() {
        let geometry = Geometry::new(256, 4, 8, 0).unwrap();
        let required = IndexLayout::required_bytes(&geometry, 1000);
        let store: Arc<dyn BlockStore> = Arc::new(MemoryStore::new(required));
        let layout = IndexLayout::new(store.clone(), &geometry, 1000).unwrap();
        assert_eq!(layout.volume.size(), geometry.bytes_per_volume);
        assert_eq!(layout.state.size(), 256);
        assert!(layout.volume_index.size() >= 1000);

        let small: Arc<dyn BlockStore> = Arc::new(MemoryStore::new(required - 1));
        assert!(IndexLayout::new(small, &geometry, 1000).is_err());
    }

    #[test]
    fn state_block() {
        let store: Arc<dyn BlockStore> = Arc::new(MemoryStore::new(256));
        let region = Region::new(store, "state", 0, 256);
        assert!(IndexState::read(&region).unwrap_err().is_corrupt());

        let state = IndexState {
            newest_chapter: 12,
            oldest_chapter: 4,
            last_save:      12,
            zone_count:     3,
            clean:          true,
        };
        state.write(&region).unwrap();
        assert_eq!(IndexState::read(&region).unwrap(), state);

        let mut raw = state.encode();
        raw[STATE_MAGIC.len() + 5] ^= 1;
        assert!(IndexState::decode(&raw).unwrap_err().is_corrupt());
    }
}
