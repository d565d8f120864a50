//! Value sizing for leaf nodes.
//!
//! Leaf nodes store values as opaque byte strings whose length is not
//! recorded in the entry. A `ValueSizer` recovers that length from the value
//! bytes themselves and supplies the leaf's format magic.

use crate::storage::blob;
use crate::storage::page::BlockMagic;

/// Interprets values stored in a leaf node.
pub trait ValueSizer {
    /// Encoded length of the value starting at `value[0]`.
    ///
    /// `value` may extend past the end of the encoded value.
    fn size(&self, value: &[u8]) -> usize;

    /// Whether a well-formed value fits in the first `length_available` bytes.
    fn fits(&self, value: &[u8], length_available: usize) -> bool;

    /// Largest encoded value length.
    fn max_possible_size(&self) -> usize;

    /// Magic identifying leaves holding this value type.
    fn leaf_magic(&self) -> BlockMagic;

    /// Block size of the nodes the values live in.
    fn block_size(&self) -> usize;
}

/// Sizer for leaves whose values are blob references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobValueSizer {
    block_size: usize,
    max_ref_len: usize,
}

impl BlobValueSizer {
    /// Magic of a leaf holding blob references.
    pub const LEAF_MAGIC: BlockMagic = BlockMagic(*b"leaf");

    #[must_use]
    pub const fn new(block_size: usize, max_ref_len: usize) -> Self {
        Self {
            block_size,
            max_ref_len,
        }
    }
}

impl ValueSizer for BlobValueSizer {
    fn size(&self, value: &[u8]) -> usize {
        blob::ref_size(self.block_size, value, self.max_ref_len)
    }

    fn fits(&self, value: &[u8], length_available: usize) -> bool {
        blob::ref_fits(self.block_size, length_available, value, self.max_ref_len)
    }

    fn max_possible_size(&self) -> usize {
        self.max_ref_len
    }

    fn leaf_magic(&self) -> BlockMagic {
        Self::LEAF_MAGIC
    }

    fn block_size(&self) -> usize {
        self.block_size
    }
}
