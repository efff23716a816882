//! Block storage for depot metadata: reference count blocks, slab journal
//! blocks and slab summaries.

use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::Path,
};

use dedupe_common::{BlockCount, PhysicalBlockNumber, VDO_BLOCK_SIZE};
use parking_lot::RwLock;
use snafu::{ensure, ResultExt};

use crate::err::{InvalidArgumentSnafu, IoSnafu, OutOfRangeSnafu, Result};

/// Whole-block reads and writes by physical block number.
pub trait MetadataStore: Send + Sync {
    fn read_block(&self, pbn: PhysicalBlockNumber, buf: &mut [u8]) -> Result<()>;
    fn write_block(&self, pbn: PhysicalBlockNumber, buf: &[u8]) -> Result<()>;
    fn block_count(&self) -> BlockCount;
}

/// A sparse in-memory device. Blocks never written read back as zeros.
pub struct MemoryMetadata {
    blocks:      RwLock<HashMap<PhysicalBlockNumber, Box<[u8]>>>,
    block_count: BlockCount,
}

impl MemoryMetadata {
    pub fn new(block_count: BlockCount) -> Self {
        Self {
            blocks: RwLock::new(HashMap::new()),
            block_count,
        }
    }

}

fn check_access(block_count: BlockCount, pbn: PhysicalBlockNumber, len: usize) -> Result<()> {
    ensure!(
        pbn < block_count,
        OutOfRangeSnafu {
            pbn,
            what: format!("a device of {block_count} blocks"),
        }
    );
    ensure!(
        len == VDO_BLOCK_SIZE,
        InvalidArgumentSnafu {
            reason: format!("buffer of {len} bytes is not one block"),
        }
    );
    Ok(())
}

impl MetadataStore for MemoryMetadata {
    fn read_block(&self, pbn: PhysicalBlockNumber, buf: &mut [u8]) -> Result<()> {
        check_access(self.block_count, pbn, buf.len())?;
        match self.blocks.read().get(&pbn) {
            Some(block) => buf.copy_from_slice(block),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_block(&self, pbn: PhysicalBlockNumber, buf: &[u8]) -> Result<()> {
        check_access(self.block_count, pbn, buf.len())?;
        self.blocks.write().insert(pbn, buf.into());
        Ok(())
    }

    fn block_count(&self) -> BlockCount { self.block_count }
}

/// A device backed by a regular file, one block per 4 KiB.
pub struct FileMetadata {
    file:        File,
    block_count: BlockCount,
    path:        String,
}

impl FileMetadata {
    /// Open `path`, creating it and growing it to `block_count` blocks if
    /// it is smaller.
    pub fn open(path: impl AsRef<Path>, block_count: BlockCount) -> Result<Self> {
        let path = path.as_ref().display().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .context(IoSnafu {
                what: format!("open {path}"),
            })?;
        let len = file.metadata().context(IoSnafu { what: format!("stat {path}") })?.len();
        let size = block_count * VDO_BLOCK_SIZE as u64;
        if len < size {
            file.set_len(size).context(IoSnafu {
                what: format!("extend {path}"),
            })?;
        }
        Ok(Self {
            file,
            block_count: len.max(size) / VDO_BLOCK_SIZE as u64,
            path,
        })
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data().context(IoSnafu {
            what: format!("sync {}", self.path),
        })
    }
}

impl MetadataStore for FileMetadata {
    fn read_block(&self, pbn: PhysicalBlockNumber, buf: &mut [u8]) -> Result<()> {
        check_access(self.block_count, pbn, buf.len())?;
        self.file
            .read_exact_at(buf, pbn * VDO_BLOCK_SIZE as u64)
            .context(IoSnafu {
                what: format!("read block {pbn} of {}", self.path),
            })
    }

    fn write_block(&self, pbn: PhysicalBlockNumber, buf: &[u8]) -> Result<()> {
        check_access(self.block_count, pbn, buf.len())?;
        self.file
            .write_all_at(buf, pbn * VDO_BLOCK_SIZE as u64)
            .context(IoSnafu {
                what: format!("write block {pbn} of {}", self.path),
            })
    }

    fn block_count(&self) -> BlockCount { self.block_count }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwritten_blocks_are_zero() {
        let store = MemoryMetadata::new(4);
        let mut buf = vec![1u8; VDO_BLOCK_SIZE];
        store.read_block(3, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0));

        store.write_block(2, &vec![7u8; VDO_BLOCK_SIZE]).unwrap();
        store.read_block(2, &mut buf).unwrap();
        assert_eq!(buf[100], 7);
        assert!(store.read_block(4, &mut buf).unwrap_err().is_out_of_range());
    }

    #[test]
    fn file_blocks_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("depot");
        let store = FileMetadata::open(&path, 8).unwrap();
        store.write_block(5, &vec![3u8; VDO_BLOCK_SIZE]).unwrap();
        store.sync().unwrap();
        drop(store);

        let store = FileMetadata::open(&path, 4).unwrap();
        assert_eq!(store.block_count(), 8);
        let mut buf = vec![0u8; VDO_BLOCK_SIZE];
        store.read_block(5, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 3));
        assert!(store.write_block(8, &buf).unwrap_err().is_out_of_range());
    }
}
