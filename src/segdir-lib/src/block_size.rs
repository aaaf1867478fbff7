use crate::{SegError, SegResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Fixed block size of a chunked directory. Always a power of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BlockSize {
    Size1K,
    Size2K,
    Size4K,
    Size8K,
    Size16K,
    Size32K,
    Size64K,
    Size128K,
    Size256K,
    Size512K,
    Size1M,
    Size2M,
    Size4M,
}

impl Default for BlockSize {
    fn default() -> Self {
        BlockSize::Size32K
    }
}

impl BlockSize {
    pub const ALL: [BlockSize; 13] = [
        BlockSize::Size1K,
        BlockSize::Size2K,
        BlockSize::Size4K,
        BlockSize::Size8K,
        BlockSize::Size16K,
        BlockSize::Size32K,
        BlockSize::Size64K,
        BlockSize::Size128K,
        BlockSize::Size256K,
        BlockSize::Size512K,
        BlockSize::Size1M,
        BlockSize::Size2M,
        BlockSize::Size4M,
    ];

    pub fn shift(&self) -> u32 {
        match self {
            BlockSize::Size1K => 10,
            BlockSize::Size2K => 11,
            BlockSize::Size4K => 12,
            BlockSize::Size8K => 13,
            BlockSize::Size16K => 14,
            BlockSize::Size32K => 15,
            BlockSize::Size64K => 16,
            BlockSize::Size128K => 17,
            BlockSize::Size256K => 18,
            BlockSize::Size512K => 19,
            BlockSize::Size1M => 20,
            BlockSize::Size2M => 21,
            BlockSize::Size4M => 22,
        }
    }

    pub fn size(&self) -> usize {
        1usize << self.shift()
    }

    pub fn mask(&self) -> u64 {
        (self.size() as u64) - 1
    }

    pub fn block_id(&self, pos: u64) -> u64 {
        pos >> self.shift()
    }

    pub fn offset_in_block(&self, pos: u64) -> usize {
        (pos & self.mask()) as usize
    }

    pub fn position(&self, block_id: u64, offset_in_block: usize) -> u64 {
        (block_id << self.shift()) + offset_in_block as u64
    }

    /// Id of the last block holding data for a file of `length` bytes.
    pub fn last_block_id(&self, length: u64) -> Option<u64> {
        if length == 0 {
            None
        } else {
            Some(self.block_id(length - 1))
        }
    }

    pub fn from_size(size: usize) -> SegResult<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|b| b.size() == size)
            .ok_or_else(|| SegError::InvalidParam(format!("unsupported block size: {}", size)))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockSize::Size1K => "1k",
            BlockSize::Size2K => "2k",
            BlockSize::Size4K => "4k",
            BlockSize::Size8K => "8k",
            BlockSize::Size16K => "16k",
            BlockSize::Size32K => "32k",
            BlockSize::Size64K => "64k",
            BlockSize::Size128K => "128k",
            BlockSize::Size256K => "256k",
            BlockSize::Size512K => "512k",
            BlockSize::Size1M => "1m",
            BlockSize::Size2M => "2m",
            BlockSize::Size4M => "4m",
        }
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockSize {
    type Err = SegError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        if let Some(found) = Self::ALL.iter().find(|b| b.as_str() == lower) {
            return Ok(*found);
        }
        match lower.parse::<usize>() {
            Ok(size) => Self::from_size(size),
            Err(_) => Err(SegError::InvalidParam(format!("invalid block size: {}", s))),
        }
    }
}

impl Serialize for BlockSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for BlockSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        BlockSize::from_str(&s).map_err(serde::de::Error::custom)
    }
}
