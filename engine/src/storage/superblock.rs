//! Tree superblock structure and serialization.
//!
//! Each B-tree owns one superblock block recording where its root lives and
//! the newest timestamp any mutation has carried. The superblock never moves,
//! so it is the stable handle a tree is opened by.

// Block sizes are bounded by MAX_BLOCK_SIZE and fit in u32.
#![allow(clippy::cast_possible_truncation)]

use crate::storage::page::{self, BlockId, BlockMagic, NULL_BLOCK_ID};
use crate::types::Timestamp;

/// Magic identifying a tree superblock.
pub const MAGIC: BlockMagic = BlockMagic(*b"supe");

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

/// Superblock field offsets.
mod offsets {
    pub const FORMAT_VERSION: usize = 4;
    pub const BLOCK_SIZE: usize = 8;
    pub const ROOT_BLOCK: usize = 12;
    pub const NEWEST_TSTAMP: usize = 20;
}

/// Metadata stored in a tree's superblock.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Superblock {
    /// Block size the tree was created with.
    pub block_size: u32,
    /// Root node of the tree, or `NULL_BLOCK_ID` for an empty tree.
    pub root: BlockId,
    /// Newest timestamp written to the tree; bounds every untimestamped leaf entry.
    pub newest_tstamp: Timestamp,
}

impl Superblock {
    /// Superblock for an empty tree.
    #[must_use]
    pub const fn new(block_size: usize) -> Self {
        Self {
            block_size: block_size as u32,
            root: NULL_BLOCK_ID,
            newest_tstamp: Timestamp::DISTANT_PAST,
        }
    }

    /// Serialize into `block`, overwriting its header.
    pub fn write_to(&self, block: &mut [u8]) {
        MAGIC.write_to(block);
        page::write_u32(block, offsets::FORMAT_VERSION, FORMAT_VERSION);
        page::write_u32(block, offsets::BLOCK_SIZE, self.block_size);
        page::write_block_id(block, offsets::ROOT_BLOCK, self.root);
        page::write_u64(block, offsets::NEWEST_TSTAMP, self.newest_tstamp.0);
    }

    /// Deserialize a superblock from `block`.
    ///
    /// # Errors
    ///
    /// Returns an error if the magic, version or recorded block size do not
    /// match this block.
    pub fn read_from(block: &[u8]) -> Result<Self, SuperblockError> {
        if !MAGIC.matches(block) {
            return Err(SuperblockError::InvalidMagic(BlockMagic::read_from(block)));
        }

        let format_version = page::read_u32(block, offsets::FORMAT_VERSION);
        if format_version != FORMAT_VERSION {
            return Err(SuperblockError::UnsupportedVersion(format_version));
        }

        let block_size = page::read_u32(block, offsets::BLOCK_SIZE);
        if block_size as usize != block.len() {
            return Err(SuperblockError::InvalidBlockSize(block_size));
        }

        Ok(Self {
            block_size,
            root: page::read_block_id(block, offsets::ROOT_BLOCK),
            newest_tstamp: Timestamp(page::read_u64(block, offsets::NEWEST_TSTAMP)),
        })
    }

    /// Update only the root pointer of an existing superblock block.
    pub fn set_root(block: &mut [u8], root: BlockId) {
        page::write_block_id(block, offsets::ROOT_BLOCK, root);
    }

    /// Update only the newest-timestamp field of an existing superblock block.
    pub fn set_newest_tstamp(block: &mut [u8], tstamp: Timestamp) {
        page::write_u64(block, offsets::NEWEST_TSTAMP, tstamp.0);
    }
}

/// Errors that can occur when reading a superblock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuperblockError {
    /// Invalid magic.
    InvalidMagic(BlockMagic),
    /// Unsupported format version.
    UnsupportedVersion(u32),
    /// Recorded block size does not match the block.
    InvalidBlockSize(u32),
}

impl std::fmt::Display for SuperblockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMagic(magic) => write!(f, "invalid superblock magic: {magic}"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported format version: {v}"),
            Self::InvalidBlockSize(s) => write!(f, "invalid block size: {s}"),
        }
    }
}

impl std::error::Error for SuperblockError {}
