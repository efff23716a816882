//! Block storage underneath the index: a flat store, named regions within
//! it, and buffered streams that report running off a region distinctly
//! from hard I/O failures.

use std::{
    fmt::{Debug, Formatter},
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::Path,
    sync::Arc,
};

use parking_lot::RwLock;
use snafu::{ensure, ResultExt};

use crate::err::{IoSnafu, OutOfRangeSnafu, Result, ShortReadSnafu};

/// Byte addressed durable storage.
pub trait BlockStore: Send + Sync {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;
    fn sync(&self) -> Result<()>;
    fn size(&self) -> u64;
}

/// A store kept in memory, for tests and throwaway indexes.
pub struct MemoryStore {
    data: RwLock<Vec<u8>>,
}

impl MemoryStore {
    pub fn new(size: u64) -> Self {
        Self {
            data: RwLock::new(vec![0; size as usize]),
        }
    }

    fn check(&self, offset: u64, len: usize) -> Result<()> {
        let size = self.size();
        ensure!(
            offset + len as u64 <= size,
            OutOfRangeSnafu {
                region: "memory",
                offset: offset + len as u64,
                size,
            }
        );
        Ok(())
    }
}

impl BlockStore for MemoryStore {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check(offset, buf.len())?;
        let data = self.data.read();
        buf.copy_from_slice(&data[offset as usize..offset as usize + buf.len()]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check(offset, buf.len())?;
        let mut data = self.data.write();
        data[offset as usize..offset as usize + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> { Ok(()) }

    fn size(&self) -> u64 { self.data.read().len() as u64 }
}

/// A store backed by a preallocated file.
pub struct FileStore {
    file: File,
    size: u64,
    path: String,
}

impl FileStore {
    /// Open `path`, creating it and extending it to `size` bytes if needed.
    pub fn open(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .context(IoSnafu {
                what: format!("open {display}"),
            })?;
        let len = file
            .metadata()
            .context(IoSnafu {
                what: format!("stat {display}"),
            })?
            .len();
        if len < size {
            file.set_len(size).context(IoSnafu {
                what: format!("extend {display}"),
            })?;
        }
        Ok(Self {
            file,
            size: len.max(size),
            path: display,
        })
    }
}

impl BlockStore for FileStore {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        ensure!(
            offset + buf.len() as u64 <= self.size,
            OutOfRangeSnafu {
                region: self.path.clone(),
                offset: offset + buf.len() as u64,
                size: self.size,
            }
        );
        self.file.read_exact_at(buf, offset).context(IoSnafu {
            what: format!("read {} at {offset}", self.path),
        })
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        ensure!(
            offset + buf.len() as u64 <= self.size,
            OutOfRangeSnafu {
                region: self.path.clone(),
                offset: offset + buf.len() as u64,
                size: self.size,
            }
        );
        self.file.write_all_at(buf, offset).context(IoSnafu {
            what: format!("write {} at {offset}", self.path),
        })
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data().context(IoSnafu {
            what: format!("sync {}", self.path),
        })
    }

    fn size(&self) -> u64 { self.size }
}

/// A named window of a store.
#[derive(Clone)]
pub struct Region {
    store:  Arc<dyn BlockStore>,
    name:   String,
    offset: u64,
    size:   u64,
}

impl Debug for Region {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("name", &self.name)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

impl Region {
    pub fn new(store: Arc<dyn BlockStore>, name: impl Into<String>, offset: u64, size: u64) -> Self {
        Self {
            store,
            name: name.into(),
            offset,
            size,
        }
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn size(&self) -> u64 { self.size }

    fn check(&self, offset: u64, len: usize) -> Result<()> {
        ensure!(
            offset + len as u64 <= self.size,
            OutOfRangeSnafu {
                region: self.name.clone(),
                offset: offset + len as u64,
                size: self.size,
            }
        );
        Ok(())
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check(offset, buf.len())?;
        self.store.read_at(self.offset + offset, buf)
    }

    pub fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check(offset, buf.len())?;
        self.store.write_at(self.offset + offset, buf)
    }

    pub fn sync(&self) -> Result<()> { self.store.sync() }
}

const BUFFER_BYTES: usize = 64 << 10;

/// Appends to a region through a buffer; running past the region's end is
/// `OutOfRange`.
pub struct BufferedWriter {
    region: Region,
    pos:    u64,
    buf:    Vec<u8>,
}

impl BufferedWriter {
    pub fn new(region: Region) -> Self {
        Self {
            region,
            pos: 0,
            buf: Vec::with_capacity(BUFFER_BYTES),
        }
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        ensure!(
            self.pos + (self.buf.len() + data.len()) as u64 <= self.region.size(),
            OutOfRangeSnafu {
                region: self.region.name().to_string(),
                offset: self.pos + (self.buf.len() + data.len()) as u64,
                size: self.region.size(),
            }
        );
        self.buf.extend_from_slice(data);
        if self.buf.len() >= BUFFER_BYTES {
            self.flush_buffer()?;
        }
        Ok(())
    }

    fn flush_buffer(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.region.write(self.pos, &self.buf)?;
        self.pos += self.buf.len() as u64;
        self.buf.clear();
        Ok(())
    }

    /// Write out buffered bytes and sync the store.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_buffer()?;
        self.region.sync()
    }

    pub fn position(&self) -> u64 { self.pos + self.buf.len() as u64 }
}

/// Reads a region front to back; asking for bytes past its end is
/// `ShortRead`.
pub struct BufferedReader {
    region: Region,
    pos:    u64,
}

impl BufferedReader {
    pub fn new(region: Region) -> Self { Self { region, pos: 0 } }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        ensure!(
            self.pos + buf.len() as u64 <= self.region.size(),
            ShortReadSnafu {
                region: self.region.name().to_string(),
            }
        );
        self.region.read(self.pos, buf)?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    pub fn read_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Read `expected.len()` bytes and report whether they match.
    pub fn check_bytes(&mut self, expected: &[u8]) -> Result<bool> {
        Ok(self.read_vec(expected.len())? == expected)
    }

    pub fn position(&self) -> u64 { self.pos }
}
