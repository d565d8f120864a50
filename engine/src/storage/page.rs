//! Block identifiers, block magics and byte accessors.
//!
//! Every structure the engine keeps on disk lives inside a fixed-size block
//! owned by the buffer cache. Node code never reinterprets a block as a Rust
//! struct; it reads and writes fields at explicit offsets with the
//! little-endian helpers in this module.

/// A block identifier assigned by the buffer cache.
pub type BlockId = u64;

/// Sentinel for "no block".
pub const NULL_BLOCK_ID: BlockId = u64::MAX;

/// Size of a serialized block id in bytes.
pub const BLOCK_ID_SIZE: usize = 8;

/// Size of a block magic in bytes.
pub const MAGIC_SIZE: usize = 4;

/// Smallest block size the engine supports.
pub const MIN_BLOCK_SIZE: usize = 512;

/// Largest block size the engine supports.
///
/// In-block offsets are stored as `u16`, so a block may not exceed 64KB.
pub const MAX_BLOCK_SIZE: usize = 65536;

/// Four bytes at the start of a block identifying its format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMagic(pub [u8; MAGIC_SIZE]);

impl BlockMagic {
    /// Read the magic stored at the start of `block`.
    #[must_use]
    pub fn read_from(block: &[u8]) -> Self {
        let mut bytes = [0u8; MAGIC_SIZE];
        bytes.copy_from_slice(&block[..MAGIC_SIZE]);
        Self(bytes)
    }

    /// Write this magic to the start of `block`.
    pub fn write_to(self, block: &mut [u8]) {
        block[..MAGIC_SIZE].copy_from_slice(&self.0);
    }

    /// Check whether `block` starts with this magic.
    #[must_use]
    pub fn matches(self, block: &[u8]) -> bool {
        block.len() >= MAGIC_SIZE && block[..MAGIC_SIZE] == self.0
    }
}

impl std::fmt::Display for BlockMagic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for &b in &self.0 {
            if b.is_ascii_graphic() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

/// Read a u16 (little-endian) at the given offset.
#[must_use]
pub fn read_u16(buf: &[u8], offset: usize) -> u16 {
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(&buf[offset..offset + 2]);
    u16::from_le_bytes(bytes)
}

/// Write a u16 (little-endian) at the given offset.
pub fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

/// Read a u32 (little-endian) at the given offset.
#[must_use]
pub fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

/// Write a u32 (little-endian) at the given offset.
pub fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Read a u64 (little-endian) at the given offset.
#[must_use]
pub fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

/// Write a u64 (little-endian) at the given offset.
pub fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Read a block id at the given offset.
#[must_use]
pub fn read_block_id(buf: &[u8], offset: usize) -> BlockId {
    read_u64(buf, offset)
}

/// Write a block id at the given offset.
pub fn write_block_id(buf: &mut [u8], offset: usize, id: BlockId) {
    write_u64(buf, offset, id);
}
