//! Out-of-line storage for values too large to inline in a leaf.
//!
//! A blob is addressed by a compact reference stored inside a leaf entry. The
//! reference is at most `max_ref_len` bytes and is self-describing.
//!
//! # Reference Format
//!
//! The size field is 1 byte when `max_ref_len <= 255`, otherwise 2 bytes
//! (little-endian).
//!
//! ```text
//! small: +-------------+------------------------+
//!        | size (1-2)  | inline bytes (size)    |
//!        +-------------+------------------------+
//!
//! large: +-------------+-----------------+------------------------+
//!        | marker(1-2) | value size (8)  | block ids (8 each)     |
//!        +-------------+-----------------+------------------------+
//! ```
//!
//! A size field above the inline capacity is the large marker. An empty blob
//! is a one-byte (or two-byte) small reference, never zero-length.
//!
//! # Blob Tree
//!
//! The block ids of a large reference form the root level of a tree of
//! blocks. Leaf blocks (`"larl"`) hold raw bytes, internal blocks (`"larn"`)
//! hold child block ids. `levels` is the depth of that tree: 0 for an inline
//! value, 1 when the reference points directly at leaf blocks.
//!
//! # Invariants
//!
//! - A large blob's size exceeds the inline capacity
//! - `levels` is the smallest depth whose capacity covers the value size
//! - The reference holds exactly `ceil(size / stepsize(levels))` block ids and
//!   every internal block exactly as many ids as its covered range needs

// Block and reference sizes are bounded by u16 offsets.
#![allow(clippy::cast_possible_truncation)]

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt, TryStreamExt};

use crate::config;
use crate::storage::cache::{Access, BlockLock, CacheError, Transaction};
use crate::storage::page::{self, BLOCK_ID_SIZE, BlockId, BlockMagic, MAGIC_SIZE};

/// Magic of a blob leaf block.
pub const LEAF_MAGIC: BlockMagic = BlockMagic(*b"larl");

/// Magic of a blob internal block.
pub const INTERNAL_MAGIC: BlockMagic = BlockMagic(*b"larn");

/// Size of the encoded value size in a large reference.
const BIG_SIZE_FIELD: usize = 8;

/// Width of the size field for references bounded by `max_ref_len`.
#[must_use]
pub const fn size_field_width(max_ref_len: usize) -> usize {
    if max_ref_len <= 255 { 1 } else { 2 }
}

/// Largest value stored inline in a reference.
#[must_use]
pub const fn max_inline_size(max_ref_len: usize) -> usize {
    max_ref_len - size_field_width(max_ref_len)
}

/// Bytes of value data held by one leaf block.
#[must_use]
pub const fn leaf_capacity(block_size: usize) -> usize {
    block_size - MAGIC_SIZE
}

/// Child ids held by one internal block.
#[must_use]
pub const fn internal_capacity(block_size: usize) -> usize {
    (block_size - MAGIC_SIZE) / BLOCK_ID_SIZE
}

/// Block ids held by a large reference.
#[must_use]
pub const fn ref_capacity(max_ref_len: usize) -> usize {
    (max_ref_len - size_field_width(max_ref_len) - BIG_SIZE_FIELD) / BLOCK_ID_SIZE
}

/// Bytes covered by one block id at depth `levels` (>= 1).
#[must_use]
pub fn stepsize(block_size: usize, levels: usize) -> u64 {
    let mut step = leaf_capacity(block_size) as u64;
    for _ in 1..levels {
        step = step.saturating_mul(internal_capacity(block_size) as u64);
    }
    step
}

/// Largest value a reference can address at depth `levels`.
#[must_use]
pub fn max_end(block_size: usize, max_ref_len: usize, levels: usize) -> u64 {
    if levels == 0 {
        return max_inline_size(max_ref_len) as u64;
    }
    (ref_capacity(max_ref_len) as u64).saturating_mul(stepsize(block_size, levels))
}

/// Smallest depth able to hold `size` bytes.
#[must_use]
pub fn levels_for(block_size: usize, max_ref_len: usize, size: u64) -> usize {
    let mut levels = 0;
    while max_end(block_size, max_ref_len, levels) < size {
        levels += 1;
    }
    levels
}

const fn ceil_div(n: u64, d: u64) -> u64 {
    n.div_ceil(d)
}

fn read_size_field(r: &[u8], max_ref_len: usize) -> usize {
    if size_field_width(max_ref_len) == 1 {
        usize::from(r[0])
    } else {
        usize::from(page::read_u16(r, 0))
    }
}

fn write_size_field(r: &mut [u8], max_ref_len: usize, value: usize) {
    if size_field_width(max_ref_len) == 1 {
        r[0] = value as u8;
    } else {
        page::write_u16(r, 0, value as u16);
    }
}

fn is_small_ref(r: &[u8], max_ref_len: usize) -> bool {
    read_size_field(r, max_ref_len) <= max_inline_size(max_ref_len)
}

/// Logical size of the value a reference points at.
#[must_use]
pub fn ref_value_size(r: &[u8], max_ref_len: usize) -> u64 {
    if is_small_ref(r, max_ref_len) {
        read_size_field(r, max_ref_len) as u64
    } else {
        page::read_u64(r, size_field_width(max_ref_len))
    }
}

/// Encoded length of a reference.
#[must_use]
pub fn ref_size(block_size: usize, r: &[u8], max_ref_len: usize) -> usize {
    let width = size_field_width(max_ref_len);
    if is_small_ref(r, max_ref_len) {
        return width + read_size_field(r, max_ref_len);
    }
    let size = page::read_u64(r, width);
    let levels = levels_for(block_size, max_ref_len, size);
    width + BIG_SIZE_FIELD + BLOCK_ID_SIZE * ceil_div(size, stepsize(block_size, levels)) as usize
}

/// Check that a well-formed reference fits within the first `available` bytes of `r`.
#[must_use]
pub fn ref_fits(block_size: usize, available: usize, r: &[u8], max_ref_len: usize) -> bool {
    let width = size_field_width(max_ref_len);
    let available = available.min(r.len());
    if available < width {
        return false;
    }
    let field = read_size_field(r, max_ref_len);
    if field > max_inline_size(max_ref_len) + 1 {
        return false;
    }
    if field > max_inline_size(max_ref_len) {
        if available < width + BIG_SIZE_FIELD {
            return false;
        }
        if page::read_u64(r, width) <= max_inline_size(max_ref_len) as u64 {
            return false;
        }
    }
    let size = ref_size(block_size, r, max_ref_len);
    size <= available && size <= max_ref_len
}

/// Errors returned by blob operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobError {
    /// Buffer cache failure.
    Cache(CacheError),
    /// A blob block does not carry the expected magic.
    BadMagic { block: BlockId, found: BlockMagic },
    /// Requested region extends past the end of the value.
    OutOfRange { offset: u64, size: u64, value_size: u64 },
    /// Write through a region exposed for read.
    ReadOnlyRegion,
    /// Data length does not match the exposed region.
    LengthMismatch { expected: usize, actual: usize },
    /// Value would exceed the addressable size.
    TooLarge,
}

impl std::fmt::Display for BlobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cache(e) => write!(f, "cache error: {e}"),
            Self::BadMagic { block, found } => write!(f, "blob block {block} has bad magic {found}"),
            Self::OutOfRange { offset, size, value_size } => {
                write!(f, "region {offset}+{size} exceeds blob size {value_size}")
            }
            Self::ReadOnlyRegion => write!(f, "write through a read-only blob region"),
            Self::LengthMismatch { expected, actual } => {
                write!(f, "region length mismatch: expected {expected}, got {actual}")
            }
            Self::TooLarge => write!(f, "blob too large"),
        }
    }
}

impl std::error::Error for BlobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Cache(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CacheError> for BlobError {
    fn from(e: CacheError) -> Self {
        Self::Cache(e)
    }
}

fn check_magic(lock: &BlockLock, magic: BlockMagic) -> Result<(), BlobError> {
    if magic.matches(lock.data()) {
        Ok(())
    } else {
        Err(BlobError::BadMagic {
            block: lock.id(),
            found: BlockMagic::read_from(lock.data()),
        })
    }
}

fn read_ids(buf: &[u8], base: usize, count: usize) -> Vec<BlockId> {
    (0..count).map(|i| page::read_block_id(buf, base + i * BLOCK_ID_SIZE)).collect()
}

fn write_ids(buf: &mut [u8], base: usize, ids: &[BlockId]) {
    for (i, &id) in ids.iter().enumerate() {
        page::write_block_id(buf, base + i * BLOCK_ID_SIZE, id);
    }
}

/// One contiguous piece of an exposed region.
enum Segment<'a> {
    Inline(&'a mut [u8]),
    Block { lock: BlockLock, start: usize, len: usize },
}

impl Segment<'_> {
    fn bytes(&self) -> &[u8] {
        match self {
            Self::Inline(bytes) => bytes,
            Self::Block { lock, start, len } => &lock.data()[*start..*start + *len],
        }
    }
}

/// A byte range of a blob, exposed as in-place buffers.
///
/// Block-backed segments keep their acquisitions until the region is dropped.
pub struct BlobRegion<'a> {
    segments: Vec<Segment<'a>>,
    access: Access,
    len: usize,
}

impl BlobRegion<'_> {
    /// Total length of the region.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of in-place buffers backing the region.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Copy the region into `buf`.
    ///
    /// # Errors
    ///
    /// Returns `LengthMismatch` if `buf` is not exactly the region length.
    pub fn copy_out(&self, buf: &mut [u8]) -> Result<(), BlobError> {
        if buf.len() != self.len {
            return Err(BlobError::LengthMismatch {
                expected: self.len,
                actual: buf.len(),
            });
        }
        let mut pos = 0;
        for segment in &self.segments {
            let bytes = segment.bytes();
            buf[pos..pos + bytes.len()].copy_from_slice(bytes);
            pos += bytes.len();
        }
        Ok(())
    }

    /// Overwrite the region with `data`.
    ///
    /// # Errors
    ///
    /// Returns `ReadOnlyRegion` for a region exposed for read, or
    /// `LengthMismatch` if `data` is not exactly the region length.
    pub fn copy_in(&mut self, data: &[u8]) -> Result<(), BlobError> {
        if self.access != Access::Write {
            return Err(BlobError::ReadOnlyRegion);
        }
        if data.len() != self.len {
            return Err(BlobError::LengthMismatch {
                expected: self.len,
                actual: data.len(),
            });
        }
        let mut pos = 0;
        for segment in &mut self.segments {
            match segment {
                Segment::Inline(bytes) => {
                    let n = bytes.len();
                    bytes.copy_from_slice(&data[pos..pos + n]);
                    pos += n;
                }
                Segment::Block { lock, start, len } => {
                    let n = *len;
                    lock.data_mut()[*start..*start + n].copy_from_slice(&data[pos..pos + n]);
                    pos += n;
                }
            }
        }
        Ok(())
    }
}

/// A blob addressed by a reference held in a caller-owned buffer.
///
/// # Pre-conditions
///
/// - The reference buffer is at least `max_ref_len` bytes long
/// - The reference is well-formed (`ref_fits`); a zeroed buffer is an empty blob
pub struct Blob<'r> {
    r: &'r mut [u8],
    block_size: usize,
    max_ref_len: usize,
    fanout: usize,
}

impl<'r> Blob<'r> {
    /// Wrap a reference buffer.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is shorter than `max_ref_len`.
    #[must_use]
    pub fn new(block_size: usize, r: &'r mut [u8], max_ref_len: usize) -> Self {
        assert!(r.len() >= max_ref_len, "blob reference buffer shorter than max_ref_len");
        Self {
            r,
            block_size,
            max_ref_len,
            fanout: config::global().blob_fanout,
        }
    }

    /// Override the number of leaf blocks acquired concurrently.
    #[must_use]
    pub fn with_fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout.max(1);
        self
    }

    /// Number of leaf blocks acquired concurrently.
    #[must_use]
    pub const fn fanout(&self) -> usize {
        self.fanout
    }

    /// A buffer holding an empty reference.
    #[must_use]
    pub fn empty_ref(max_ref_len: usize) -> Vec<u8> {
        vec![0u8; max_ref_len]
    }

    /// Logical size of the value.
    #[must_use]
    pub fn value_size(&self) -> u64 {
        ref_value_size(self.r, self.max_ref_len)
    }

    /// Encoded length of the reference.
    #[must_use]
    pub fn ref_size(&self) -> usize {
        ref_size(self.block_size, self.r, self.max_ref_len)
    }

    /// The encoded reference.
    #[must_use]
    pub fn ref_bytes(&self) -> &[u8] {
        &self.r[..self.ref_size()]
    }

    /// Depth of the blob tree (0 for an inline value).
    #[must_use]
    pub fn levels(&self) -> usize {
        if is_small_ref(self.r, self.max_ref_len) {
            0
        } else {
            levels_for(self.block_size, self.max_ref_len, self.value_size())
        }
    }

    fn width(&self) -> usize {
        size_field_width(self.max_ref_len)
    }

    fn ids_base(&self) -> usize {
        self.width() + BIG_SIZE_FIELD
    }

    fn ref_ids(&self) -> Vec<BlockId> {
        if is_small_ref(self.r, self.max_ref_len) {
            return Vec::new();
        }
        let size = self.value_size();
        let count = ceil_div(size, stepsize(self.block_size, self.levels())) as usize;
        read_ids(self.r, self.ids_base(), count)
    }

    fn set_small(&mut self, size: usize) {
        write_size_field(self.r, self.max_ref_len, size);
    }

    fn set_large(&mut self, size: u64, ids: &[BlockId]) {
        debug_assert!(ids.len() <= ref_capacity(self.max_ref_len));
        write_size_field(self.r, self.max_ref_len, max_inline_size(self.max_ref_len) + 1);
        page::write_u64(self.r, self.width(), size);
        let base = self.ids_base();
        write_ids(self.r, base, ids);
    }

    /// Expose `[offset, offset + size)` as in-place buffers.
    ///
    /// Internal blob levels are resolved serially; leaf blocks are acquired
    /// with a bounded fan-out.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` if the region extends past the value, or any
    /// acquisition error.
    pub async fn expose_region(
        &mut self,
        txn: &Transaction,
        access: Access,
        offset: u64,
        size: u64,
    ) -> Result<BlobRegion<'_>, BlobError> {
        let value_size = self.value_size();
        let end = offset.checked_add(size).ok_or(BlobError::TooLarge)?;
        if end > value_size {
            return Err(BlobError::OutOfRange {
                offset,
                size,
                value_size,
            });
        }

        let levels = self.levels();
        if levels == 0 {
            let start = self.width() + offset as usize;
            let len = size as usize;
            let segments = if len == 0 {
                Vec::new()
            } else {
                vec![Segment::Inline(&mut self.r[start..start + len])]
            };
            return Ok(BlobRegion { segments, access, len });
        }
        if size == 0 {
            return Ok(BlobRegion {
                segments: Vec::new(),
                access,
                len: 0,
            });
        }

        let block_size = self.block_size;
        let covering = |base: u64, step: u64, ids: &[BlockId]| -> Vec<(BlockId, u64)> {
            let first = offset.max(base).saturating_sub(base) / step;
            let last = ceil_div(end.min(base + step * ids.len() as u64) - base, step);
            (first..last).map(|j| (ids[j as usize], base + j * step)).collect()
        };

        let mut frontier = covering(0, stepsize(block_size, levels), &self.ref_ids());
        for level in (2..=levels).rev() {
            let child_step = stepsize(block_size, level - 1);
            let parent_step = stepsize(block_size, level);
            let mut next = Vec::new();
            for (id, base) in frontier {
                let lock = txn.acquire(id, Access::Read).await?;
                check_magic(&lock, INTERNAL_MAGIC)?;
                let covered = (value_size - base).min(parent_step);
                let ids = read_ids(lock.data(), MAGIC_SIZE, ceil_div(covered, child_step) as usize);
                next.extend(covering(base, child_step, &ids));
            }
            frontier = next;
        }

        let leaf_step = stepsize(block_size, 1);
        let segments: Vec<Segment<'_>> = stream::iter(frontier)
            .map(|(id, base)| async move {
                let lock = txn.acquire(id, access).await?;
                check_magic(&lock, LEAF_MAGIC)?;
                let from = offset.max(base);
                let to = end.min(base + leaf_step);
                Ok::<_, BlobError>(Segment::Block {
                    lock,
                    start: MAGIC_SIZE + (from - base) as usize,
                    len: (to - from) as usize,
                })
            })
            .buffered(self.fanout)
            .try_collect()
            .await?;

        Ok(BlobRegion {
            segments,
            access,
            len: size as usize,
        })
    }

    /// Grow the value by `size` bytes, adding levels as needed.
    ///
    /// The appended bytes read as zeros until written.
    ///
    /// # Errors
    ///
    /// Returns any acquisition error, or `TooLarge` on overflow.
    pub async fn append_region(&mut self, txn: &Transaction, size: u64) -> Result<(), BlobError> {
        let old_size = self.value_size();
        let new_size = old_size.checked_add(size).ok_or(BlobError::TooLarge)?;
        let max_inline = max_inline_size(self.max_ref_len);

        if new_size <= max_inline as u64 {
            let width = self.width();
            self.r[width + old_size as usize..width + new_size as usize].fill(0);
            self.set_small(new_size as usize);
            return Ok(());
        }

        let target_levels = levels_for(self.block_size, self.max_ref_len, new_size);
        let mut levels = self.levels();
        let mut ids = self.ref_ids();

        if levels == 0 {
            if old_size > 0 {
                let mut leaf = txn.create().await?;
                LEAF_MAGIC.write_to(leaf.data_mut());
                let width = self.width();
                let len = old_size as usize;
                leaf.data_mut()[MAGIC_SIZE..MAGIC_SIZE + len].copy_from_slice(&self.r[width..width + len]);
                ids.push(leaf.id());
            }
            levels = 1;
            tracing::debug!(size = new_size, "blob moved out of line");
        }

        while levels < target_levels {
            if !ids.is_empty() {
                let mut node = txn.create().await?;
                INTERNAL_MAGIC.write_to(node.data_mut());
                write_ids(node.data_mut(), MAGIC_SIZE, &ids);
                ids = vec![node.id()];
            }
            levels += 1;
            tracing::debug!(levels, "blob gained a level");
        }

        traverse_to_dimensions(txn, self.block_size, levels, &mut ids, old_size, new_size).await?;
        self.set_large(new_size, &ids);
        Ok(())
    }

    /// Shrink the value by `size` bytes from the end, removing levels as possible.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` if `size` exceeds the value size, or any
    /// acquisition error.
    pub async fn unappend_region(&mut self, txn: &Transaction, size: u64) -> Result<(), BlobError> {
        let old_size = self.value_size();
        if size > old_size {
            return Err(BlobError::OutOfRange {
                offset: old_size.saturating_sub(size),
                size,
                value_size: old_size,
            });
        }
        let new_size = old_size - size;

        let mut levels = self.levels();
        if levels == 0 {
            self.set_small(new_size as usize);
            return Ok(());
        }

        let mut ids = self.ref_ids();
        traverse_to_dimensions(txn, self.block_size, levels, &mut ids, old_size, new_size).await?;

        while levels > 1 && new_size <= max_end(self.block_size, self.max_ref_len, levels - 1) {
            if let Some(&only) = ids.first() {
                debug_assert_eq!(ids.len(), 1);
                let node = txn.acquire(only, Access::Write).await?;
                check_magic(&node, INTERNAL_MAGIC)?;
                let count = ceil_div(new_size, stepsize(self.block_size, levels - 1)) as usize;
                ids = read_ids(node.data(), MAGIC_SIZE, count);
                txn.mark_deleted(node)?;
            }
            levels -= 1;
            tracing::debug!(levels, "blob lost a level");
        }

        if levels == 1 && new_size <= max_inline_size(self.max_ref_len) as u64 {
            let width = self.width();
            let len = new_size as usize;
            if let Some(&only) = ids.first() {
                let leaf = txn.acquire(only, Access::Write).await?;
                check_magic(&leaf, LEAF_MAGIC)?;
                self.r[width..width + len].copy_from_slice(&leaf.data()[MAGIC_SIZE..MAGIC_SIZE + len]);
                txn.mark_deleted(leaf)?;
            }
            self.set_small(len);
            tracing::debug!(size = new_size, "blob moved inline");
        } else {
            self.set_large(new_size, &ids);
        }
        Ok(())
    }

    /// Release every block of the blob, leaving an empty inline reference.
    ///
    /// # Errors
    ///
    /// Returns any acquisition error.
    pub async fn clear(&mut self, txn: &Transaction) -> Result<(), BlobError> {
        let size = self.value_size();
        self.unappend_region(txn, size).await
    }

    /// Hand off ownership of the top-level blob blocks without destroying them.
    ///
    /// # Errors
    ///
    /// Returns any cache error.
    pub fn detach_subtrees(&self, txn: &Transaction) -> Result<(), BlobError> {
        for id in self.ref_ids() {
            txn.detach_child(id)?;
        }
        Ok(())
    }

    /// Read `buf.len()` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` or any acquisition error.
    pub async fn read(&mut self, txn: &Transaction, offset: u64, buf: &mut [u8]) -> Result<(), BlobError> {
        let region = self.expose_region(txn, Access::Read, offset, buf.len() as u64).await?;
        region.copy_out(buf)
    }

    /// Overwrite bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` or any acquisition error.
    pub async fn write(&mut self, txn: &Transaction, offset: u64, data: &[u8]) -> Result<(), BlobError> {
        let mut region = self.expose_region(txn, Access::Write, offset, data.len() as u64).await?;
        region.copy_in(data)
    }

    /// Read the whole value.
    ///
    /// # Errors
    ///
    /// Returns any acquisition error.
    pub async fn read_all(&mut self, txn: &Transaction) -> Result<Vec<u8>, BlobError> {
        let mut buf = vec![0u8; self.value_size() as usize];
        self.read(txn, 0, &mut buf).await?;
        Ok(buf)
    }

    /// Append `data` to the end of the value.
    ///
    /// # Errors
    ///
    /// Returns any acquisition error.
    pub async fn append_value(&mut self, txn: &Transaction, data: &[u8]) -> Result<(), BlobError> {
        let offset = self.value_size();
        self.append_region(txn, data.len() as u64).await?;
        self.write(txn, offset, data).await
    }
}

/// Allocate or release exactly the blocks whose coverage differs between
/// `old_end` and `new_end` under a subtree at depth `levels`.
///
/// `ids` are the subtree's top-level children covering `old_end` on entry and
/// `new_end` on return.
fn traverse_to_dimensions<'a>(
    txn: &'a Transaction,
    block_size: usize,
    levels: usize,
    ids: &'a mut Vec<BlockId>,
    old_end: u64,
    new_end: u64,
) -> BoxFuture<'a, Result<(), BlobError>> {
    async move {
        let step = stepsize(block_size, levels);
        let old_count = ceil_div(old_end, step);
        let new_count = ceil_div(new_end, step);

        for i in 0..old_count.max(new_count) {
            let base = i * step;
            let child_old = old_end.saturating_sub(base).min(step);
            let child_new = new_end.saturating_sub(base).min(step);
            if child_old == child_new {
                continue;
            }

            let mut lock = if child_old == 0 {
                let mut lock = txn.create().await?;
                let magic = if levels == 1 { LEAF_MAGIC } else { INTERNAL_MAGIC };
                magic.write_to(lock.data_mut());
                debug_assert_eq!(ids.len() as u64, i);
                ids.push(lock.id());
                lock
            } else {
                txn.acquire(ids[i as usize], Access::Write).await?
            };

            if levels > 1 {
                check_magic(&lock, INTERNAL_MAGIC)?;
                let child_step = stepsize(block_size, levels - 1);
                let mut child_ids = read_ids(lock.data(), MAGIC_SIZE, ceil_div(child_old, child_step) as usize);
                traverse_to_dimensions(txn, block_size, levels - 1, &mut child_ids, child_old, child_new).await?;
                write_ids(lock.data_mut(), MAGIC_SIZE, &child_ids);
            } else if child_new > 0 && child_new < child_old {
                check_magic(&lock, LEAF_MAGIC)?;
                let data = lock.data_mut();
                data[MAGIC_SIZE + child_new as usize..MAGIC_SIZE + child_old as usize].fill(0);
            }

            if child_new == 0 {
                txn.mark_deleted(lock)?;
            }
        }

        ids.truncate(new_count as usize);
        Ok(())
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::cache::BufferCache;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::time::Duration;
    use tokio::time::timeout;

    const BLOCK_SIZE: usize = 4096;
    const MAX_REF_LEN: usize = 251;

    fn pattern(len: usize, seed: u64) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..len).map(|_| rng.random()).collect()
    }

    #[test]
    fn test_capacities() {
        assert_eq!(size_field_width(251), 1);
        assert_eq!(size_field_width(256), 2);
        assert_eq!(max_inline_size(251), 250);
        assert_eq!(leaf_capacity(4096), 4092);
        assert_eq!(internal_capacity(4096), 511);
        assert_eq!(ref_capacity(251), 30);
        assert_eq!(max_end(4096, 251, 1), 30 * 4092);
        assert_eq!(stepsize(4096, 2), 511 * 4092);
    }

    #[test]
    fn test_levels_for() {
        assert_eq!(levels_for(BLOCK_SIZE, MAX_REF_LEN, 0), 0);
        assert_eq!(levels_for(BLOCK_SIZE, MAX_REF_LEN, 250), 0);
        assert_eq!(levels_for(BLOCK_SIZE, MAX_REF_LEN, 251), 1);
        assert_eq!(levels_for(BLOCK_SIZE, MAX_REF_LEN, 30 * 4092), 1);
        assert_eq!(levels_for(BLOCK_SIZE, MAX_REF_LEN, 30 * 4092 + 1), 2);
    }

    #[test]
    fn test_empty_ref() {
        let mut r = Blob::empty_ref(MAX_REF_LEN);
        let blob = Blob::new(BLOCK_SIZE, &mut r, MAX_REF_LEN);
        assert_eq!(blob.value_size(), 0);
        assert_eq!(blob.ref_size(), 1);
        assert_eq!(blob.levels(), 0);
        assert!(ref_fits(BLOCK_SIZE, 1, &r, MAX_REF_LEN));
        assert!(!ref_fits(BLOCK_SIZE, 0, &r, MAX_REF_LEN));
    }

    #[tokio::test]
    async fn test_roundtrip_small() {
        let cache = BufferCache::new(BLOCK_SIZE);
        let txn = cache.begin(Access::Write);
        let mut r = Blob::empty_ref(MAX_REF_LEN);
        let mut blob = Blob::new(BLOCK_SIZE, &mut r, MAX_REF_LEN);

        let data = pattern(MAX_REF_LEN - 1, 1);
        blob.append_value(&txn, &data).await.expect("append");
        assert_eq!(blob.levels(), 0);
        assert_eq!(blob.ref_size(), MAX_REF_LEN);
        assert_eq!(blob.read_all(&txn).await.expect("read"), data);
        assert_eq!(cache.block_count(), 0);

        blob.clear(&txn).await.expect("clear");
        assert_eq!(blob.value_size(), 0);
        assert_eq!(blob.ref_size(), 1);
    }

    #[tokio::test]
    async fn test_roundtrip_empty() {
        let cache = BufferCache::new(BLOCK_SIZE);
        let txn = cache.begin(Access::Write);
        let mut r = Blob::empty_ref(MAX_REF_LEN);
        let mut blob = Blob::new(BLOCK_SIZE, &mut r, MAX_REF_LEN);

        blob.append_value(&txn, &[]).await.expect("append");
        assert!(blob.read_all(&txn).await.expect("read").is_empty());
        assert_eq!(blob.ref_size(), 1);
    }

    #[tokio::test]
    async fn test_roundtrip_multi_megabyte() {
        let cache = BufferCache::new(BLOCK_SIZE);
        let txn = cache.begin(Access::Write);
        let mut r = Blob::empty_ref(MAX_REF_LEN);
        let mut blob = Blob::new(BLOCK_SIZE, &mut r, MAX_REF_LEN);

        let data = pattern(3 * 1024 * 1024, 2);
        blob.append_value(&txn, &data).await.expect("append");
        assert_eq!(blob.levels(), 2);
        assert!(ref_fits(BLOCK_SIZE, MAX_REF_LEN, blob.ref_bytes(), MAX_REF_LEN));
        assert_eq!(blob.read_all(&txn).await.expect("read"), data);

        let mut middle = vec![0u8; 10_000];
        blob.read(&txn, 1_000_000, &mut middle).await.expect("read middle");
        assert_eq!(middle, &data[1_000_000..1_010_000]);

        blob.clear(&txn).await.expect("clear");
        assert_eq!(blob.levels(), 0);
        assert_eq!(blob.ref_size(), 1);
        assert_eq!(cache.block_count(), 0);
    }

    #[tokio::test]
    async fn test_three_levels_and_back() {
        let block_size = 512;
        let max_ref_len = 64;
        let cache = BufferCache::new(block_size);
        let txn = cache.begin(Access::Write);
        let mut r = Blob::empty_ref(max_ref_len);
        let mut blob = Blob::new(block_size, &mut r, max_ref_len).with_fanout(3);

        let data = pattern(500_000, 3);
        blob.append_value(&txn, &data).await.expect("append");
        assert_eq!(blob.levels(), 3);
        assert_eq!(blob.read_all(&txn).await.expect("read"), data);

        blob.unappend_region(&txn, 497_000).await.expect("shrink");
        assert_eq!(blob.levels(), 1);
        assert_eq!(blob.read_all(&txn).await.expect("read"), &data[..3000]);

        blob.unappend_region(&txn, 3000 - 40).await.expect("shrink");
        assert_eq!(blob.levels(), 0);
        assert_eq!(blob.read_all(&txn).await.expect("read"), &data[..40]);
        assert_eq!(cache.block_count(), 0);
    }

    #[tokio::test]
    async fn test_levels_monotonic_in_size() {
        let block_size = 512;
        let max_ref_len = 64;
        let cache = BufferCache::new(block_size);
        let txn = cache.begin(Access::Write);
        let mut r = Blob::empty_ref(max_ref_len);
        let mut blob = Blob::new(block_size, &mut r, max_ref_len);
        let mut rng = StdRng::seed_from_u64(4);

        let mut last_levels = 0;
        let mut expected = Vec::new();
        while expected.len() < 250_000 {
            let chunk = pattern(rng.random_range(1..20_000), rng.random());
            blob.append_value(&txn, &chunk).await.expect("append");
            expected.extend_from_slice(&chunk);
            assert!(blob.levels() >= last_levels);
            assert_eq!(blob.levels(), levels_for(block_size, max_ref_len, expected.len() as u64));
            last_levels = blob.levels();
        }
        assert_eq!(blob.read_all(&txn).await.expect("read"), expected);

        blob.unappend_region(&txn, expected.len() as u64).await.expect("truncate");
        assert_eq!(blob.levels(), 0);
        assert_eq!(blob.value_size(), 0);
        assert_eq!(blob.ref_size(), 1);
        assert_eq!(cache.block_count(), 0);
    }

    #[tokio::test]
    async fn test_shrink_then_regrow_reads_zeros() {
        let cache = BufferCache::new(BLOCK_SIZE);
        let txn = cache.begin(Access::Write);
        let mut r = Blob::empty_ref(MAX_REF_LEN);
        let mut blob = Blob::new(BLOCK_SIZE, &mut r, MAX_REF_LEN);

        blob.append_value(&txn, &[7u8; 9000]).await.expect("append");
        blob.unappend_region(&txn, 1000).await.expect("shrink");
        blob.append_region(&txn, 1000).await.expect("regrow");

        let all = blob.read_all(&txn).await.expect("read");
        assert!(all[..8000].iter().all(|&b| b == 7));
        assert!(all[8000..].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_expose_region_out_of_range() {
        let cache = BufferCache::new(BLOCK_SIZE);
        let txn = cache.begin(Access::Write);
        let mut r = Blob::empty_ref(MAX_REF_LEN);
        let mut blob = Blob::new(BLOCK_SIZE, &mut r, MAX_REF_LEN);
        blob.append_value(&txn, &[1u8; 10]).await.expect("append");

        let err = blob.expose_region(&txn, Access::Read, 5, 6).await.err();
        assert_eq!(
            err,
            Some(BlobError::OutOfRange {
                offset: 5,
                size: 6,
                value_size: 10
            })
        );
    }

    #[tokio::test]
    async fn test_read_region_rejects_writes() {
        let cache = BufferCache::new(BLOCK_SIZE);
        let txn = cache.begin(Access::Write);
        let mut r = Blob::empty_ref(MAX_REF_LEN);
        let mut blob = Blob::new(BLOCK_SIZE, &mut r, MAX_REF_LEN);
        blob.append_value(&txn, &[1u8; 5000]).await.expect("append");

        let mut region = blob.expose_region(&txn, Access::Read, 4000, 200).await.expect("expose");
        assert_eq!(region.segment_count(), 2);
        assert_eq!(region.copy_in(&[0u8; 200]), Err(BlobError::ReadOnlyRegion));
    }

    #[tokio::test]
    async fn test_leaf_fanout_is_bounded() {
        let cache = BufferCache::new(BLOCK_SIZE);
        let txn = cache.begin(Access::Write);
        let mut r = Blob::empty_ref(MAX_REF_LEN);
        let data = pattern(5 * leaf_capacity(BLOCK_SIZE) - 100, 5);
        let ids = {
            let mut blob = Blob::new(BLOCK_SIZE, &mut r, MAX_REF_LEN);
            blob.append_value(&txn, &data).await.expect("append");
            assert_eq!(blob.levels(), 1);
            blob.ref_ids()
        };
        assert_eq!(ids.len(), 5);

        let writer = cache.begin(Access::Write);
        let first = writer.acquire(ids[0], Access::Write).await.expect("hold first leaf");

        let reader = cache.begin(Access::Read);
        let mut blob = Blob::new(BLOCK_SIZE, &mut r, MAX_REF_LEN).with_fanout(2);
        let mut read = std::pin::pin!(blob.read_all(&reader));
        assert!(futures::poll!(read.as_mut()).is_pending());

        // Two leaves are in flight: the second is held, the third not yet requested.
        let wait = Duration::from_millis(20);
        assert!(timeout(wait, writer.acquire(ids[1], Access::Write)).await.is_err());
        let third = timeout(wait, writer.acquire(ids[2], Access::Write))
            .await
            .expect("third leaf is free")
            .expect("acquire third leaf");
        drop(third);

        drop(first);
        assert_eq!(read.await.expect("read"), data);
    }

    #[tokio::test]
    async fn test_detach_subtrees() {
        let cache = BufferCache::new(BLOCK_SIZE);
        let txn = cache.begin(Access::Write);
        let mut r = Blob::empty_ref(MAX_REF_LEN);
        let mut blob = Blob::new(BLOCK_SIZE, &mut r, MAX_REF_LEN);
        blob.append_value(&txn, &[3u8; 9000]).await.expect("append");

        blob.detach_subtrees(&txn).expect("detach");
        let ids = blob.ref_ids();
        assert_eq!(ids.len(), 3);
        assert!(ids.iter().all(|&id| cache.is_detached(id)));
    }
}
