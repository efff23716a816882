// Copyright 2024 kisekifs
//
// JuiceFS, Copyright 2020 Juicedata, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub const DEDUPE: &str = "dedupe";
pub const DEDUPE_DEBUG_INDEX_PATH: &str = "/tmp/dedupe.index";

pub const RECORD_NAME_SIZE: usize = 16;
pub const RECORD_DATA_SIZE: usize = 16;
pub const BYTES_PER_RECORD: usize = RECORD_NAME_SIZE + RECORD_DATA_SIZE;

pub const DEFAULT_BYTES_PER_PAGE: usize = 4 << 10; // 4 KiB
pub const HEADER_PAGES_PER_VOLUME: u32 = 1;

pub const DEFAULT_CHAPTERS_PER_VOLUME: u32 = 1024;
pub const DEFAULT_RECORD_PAGES_PER_CHAPTER: u32 = 256;
pub const SMALL_RECORD_PAGES_PER_CHAPTER: u32 = 64;
// Sparse volumes are ten times larger and keep one chapter in twenty dense.
pub const SPARSE_CHAPTER_MULTIPLIER: u32 = 10;

pub const DEFAULT_CHAPTER_MEAN_DELTA_BITS: u32 = 16;
pub const DEFAULT_VOLUME_INDEX_MEAN_DELTA: u32 = 4096;
pub const DEFAULT_SPARSE_SAMPLE_RATE: u32 = 32;
pub const DEFAULT_CACHE_CHAPTERS: usize = 7;
pub const DEFAULT_PAGE_CACHE_PAGES: u64 = 4096;
pub const DEFAULT_READ_THREADS: usize = 2;

pub const MAX_ZONES: usize = 16;
/// A rebuild gives up after this many unreadable chapters in a row.
pub const MAX_BAD_CHAPTERS: u32 = 100;

/// Marks "no chapter" wherever a virtual chapter number is expected.
pub const NO_CHAPTER: u64 = u64::MAX;
/// The chapter index has no entry for a name.
pub const NO_CHAPTER_INDEX_ENTRY: u16 = u16::MAX;

pub const VDO_BLOCK_SIZE: usize = 4 << 10; // 4 KiB
pub const ZERO_BLOCK: PhysicalBlockNumber = 0;
pub const BLOCK_MAP_ENTRIES_PER_PAGE: u16 = 812;

/// Number of bits needed to represent `n`, with `bits_per(0) == 1`.
pub const fn bits_per(n: u64) -> u32 {
    if n < 2 {
        1
    } else {
        64 - n.leading_zeros()
    }
}

pub const fn ilog2(n: u64) -> u32 { 63 - n.leading_zeros() }

pub fn div_round_up(n: u64, d: u64) -> u64 { (n + d - 1) / d }

pub type VirtualChapter = u64;
pub type PhysicalChapter = u32;
pub type ZoneNumber = usize;
pub type Nonce = u64;

pub type PhysicalBlockNumber = u64;
pub type SlabBlockNumber = u32;
pub type SlabCount = u32;
pub type BlockCount = u64;
pub type SequenceNumber = u64;
pub type JournalEntryCount = u16;
