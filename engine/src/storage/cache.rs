//! In-memory transactional buffer cache.
//!
//! The B-tree and blob code only ever touch blocks through a `Transaction`:
//! acquire an existing block for read or write, create a fresh block, delete
//! a block, or hand off ownership of a child block. This module provides an
//! in-memory implementation of that interface.
//!
//! # Design
//!
//! - Every block is a `block_size` byte buffer behind its own `tokio` `RwLock`
//! - Acquisitions are owned guards, so a task may suspend while waiting for a
//!   block and may hold several blocks at once
//! - Freed ids are reused before new ids are minted
//!
//! # Invariants
//!
//! - A block id is either live (present in the block map) or on the free list,
//!   never both
//! - At most one write acquisition of a block exists at a time; readers never
//!   overlap a writer (enforced by the per-block lock)

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::storage::page::BlockId;

/// Requested access mode for a transaction or a block acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Shared, read-only access.
    Read,
    /// Exclusive access.
    Write,
}

/// Shared buffer for a single block.
type BlockBuffer = Arc<RwLock<Box<[u8]>>>;

/// Mutable bookkeeping guarded by the cache mutex.
#[derive(Default)]
struct CacheState {
    /// Live blocks.
    blocks: HashMap<BlockId, BlockBuffer>,
    /// Ids released by `mark_deleted`, reused first.
    free_ids: Vec<BlockId>,
    /// Next never-used id.
    next_id: BlockId,
    /// Blocks whose ownership was handed off with `detach_child`.
    detached: HashSet<BlockId>,
}

/// An in-memory buffer cache of fixed-size blocks.
///
/// # Pre-conditions
/// - `block_size` must be > 0 when creating
///
/// # Invariants
/// - Every buffer is exactly `block_size` bytes
pub struct BufferCache {
    block_size: usize,
    state: Mutex<CacheState>,
}

impl BufferCache {
    /// Create an empty cache of `block_size` byte blocks.
    ///
    /// # Panics
    /// Panics if `block_size` is 0.
    #[must_use]
    pub fn new(block_size: usize) -> Arc<Self> {
        assert!(block_size > 0, "Block size must be positive");

        Arc::new(Self {
            block_size,
            state: Mutex::new(CacheState::default()),
        })
    }

    /// Size of every block in bytes.
    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    /// Begin a transaction.
    #[must_use]
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    pub fn begin(self: &Arc<Self>, access: Access) -> Transaction {
        Transaction {
            cache: Arc::clone(self),
            access,
        }
    }

    /// Number of live blocks.
    #[must_use]
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    pub fn block_count(&self) -> usize {
        self.state.lock().expect("lock poisoned").blocks.len()
    }

    /// Whether ownership of `id` was handed off with `detach_child`.
    #[must_use]
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    pub fn is_detached(&self, id: BlockId) -> bool {
        self.state.lock().expect("lock poisoned").detached.contains(&id)
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    fn buffer(&self, id: BlockId) -> Result<BlockBuffer, CacheError> {
        let state = self.state.lock().expect("lock poisoned");
        state
            .blocks
            .get(&id)
            .map(Arc::clone)
            .ok_or(CacheError::UnknownBlock(id))
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    fn allocate(&self) -> (BlockId, BlockBuffer) {
        let mut state = self.state.lock().expect("lock poisoned");
        let id = state.free_ids.pop().unwrap_or_else(|| {
            let id = state.next_id;
            state.next_id += 1;
            id
        });
        let buffer: BlockBuffer = Arc::new(RwLock::new(vec![0u8; self.block_size].into_boxed_slice()));
        state.blocks.insert(id, Arc::clone(&buffer));
        (id, buffer)
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn release(&self, id: BlockId) -> Result<(), CacheError> {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.blocks.remove(&id).is_none() {
            return Err(CacheError::UnknownBlock(id));
        }
        state.detached.remove(&id);
        state.free_ids.push(id);
        Ok(())
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn detach(&self, id: BlockId) -> Result<(), CacheError> {
        let mut state = self.state.lock().expect("lock poisoned");
        if !state.blocks.contains_key(&id) {
            return Err(CacheError::UnknownBlock(id));
        }
        state.detached.insert(id);
        Ok(())
    }
}

impl std::fmt::Debug for BufferCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferCache")
            .field("block_size", &self.block_size)
            .finish_non_exhaustive()
    }
}

/// A transaction against the buffer cache.
///
/// All block acquisitions are scoped to a transaction. A read transaction may
/// only take read acquisitions and may not create, delete or detach blocks.
pub struct Transaction {
    cache: Arc<BufferCache>,
    access: Access,
}

impl Transaction {
    /// Access mode of this transaction.
    #[must_use]
    pub const fn access(&self) -> Access {
        self.access
    }

    /// Block size of the underlying cache.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.cache.block_size()
    }

    const fn check_writable(&self) -> Result<(), CacheError> {
        match self.access {
            Access::Write => Ok(()),
            Access::Read => Err(CacheError::ReadOnlyTransaction),
        }
    }

    /// Acquire an existing block.
    ///
    /// Suspends until no conflicting acquisition is held.
    pub async fn acquire(&self, id: BlockId, access: Access) -> Result<BlockLock, CacheError> {
        if access == Access::Write {
            self.check_writable()?;
        }
        let buffer = self.cache.buffer(id)?;
        let guard = match access {
            Access::Read => Guard::Read(buffer.read_owned().await),
            Access::Write => Guard::Write(buffer.write_owned().await),
        };
        Ok(BlockLock { id, guard })
    }

    /// Create a new zeroed block and acquire it for write.
    pub async fn create(&self) -> Result<BlockLock, CacheError> {
        self.check_writable()?;
        let (id, buffer) = self.cache.allocate();
        tracing::trace!(block_id = id, "created block");
        Ok(BlockLock {
            id,
            guard: Guard::Write(buffer.write_owned().await),
        })
    }

    /// Delete a block held under a write acquisition.
    ///
    /// The acquisition is released and the id becomes reusable.
    pub fn mark_deleted(&self, lock: BlockLock) -> Result<(), CacheError> {
        self.check_writable()?;
        if lock.access() != Access::Write {
            return Err(CacheError::NotWriteLocked(lock.id));
        }
        let id = lock.id;
        drop(lock);
        self.cache.release(id)?;
        tracing::trace!(block_id = id, "deleted block");
        Ok(())
    }

    /// Hand off ownership of `child` without destroying it.
    pub fn detach_child(&self, child: BlockId) -> Result<(), CacheError> {
        self.check_writable()?;
        self.cache.detach(child)?;
        tracing::trace!(block_id = child, "detached block");
        Ok(())
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("access", &self.access)
            .finish_non_exhaustive()
    }
}

enum Guard {
    Read(OwnedRwLockReadGuard<Box<[u8]>>),
    Write(OwnedRwLockWriteGuard<Box<[u8]>>),
}

/// An acquired block. The acquisition is released on drop.
pub struct BlockLock {
    id: BlockId,
    guard: Guard,
}

impl BlockLock {
    /// Id of the acquired block.
    #[must_use]
    pub const fn id(&self) -> BlockId {
        self.id
    }

    /// Mode the block was acquired in.
    #[must_use]
    pub const fn access(&self) -> Access {
        match self.guard {
            Guard::Read(_) => Access::Read,
            Guard::Write(_) => Access::Write,
        }
    }

    /// Block contents.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        match &self.guard {
            Guard::Read(g) => g,
            Guard::Write(g) => g,
        }
    }

    /// Mutable block contents, or `None` for a read acquisition.
    pub fn try_data_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.guard {
            Guard::Read(_) => None,
            Guard::Write(g) => Some(g),
        }
    }

    /// Mutable block contents.
    ///
    /// # Panics
    /// Panics if the block was acquired for read; callers must hold a write
    /// acquisition on every block they mutate.
    pub fn data_mut(&mut self) -> &mut [u8] {
        let id = self.id;
        match self.try_data_mut() {
            Some(data) => data,
            None => panic!("block {id} mutated under a read acquisition"),
        }
    }
}

impl std::fmt::Debug for BlockLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockLock")
            .field("id", &self.id)
            .field("access", &self.access())
            .finish_non_exhaustive()
    }
}

/// Errors returned by buffer cache operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// No live block has this id.
    UnknownBlock(BlockId),
    /// A write operation was attempted in a read transaction.
    ReadOnlyTransaction,
    /// A block held for read was passed where a write acquisition is required.
    NotWriteLocked(BlockId),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownBlock(id) => write!(f, "unknown block {id}"),
            Self::ReadOnlyTransaction => write!(f, "write attempted in a read-only transaction"),
            Self::NotWriteLocked(id) => write!(f, "block {id} is not write-locked"),
        }
    }
}

impl std::error::Error for CacheError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_create_write_and_read_back() {
        let cache = BufferCache::new(128);
        let txn = cache.begin(Access::Write);

        let mut lock = txn.create().await.expect("create");
        let id = lock.id();
        assert_eq!(lock.data().len(), 128);
        assert!(lock.data().iter().all(|&b| b == 0));
        lock.data_mut()[5] = 0xAB;
        drop(lock);

        let lock = txn.acquire(id, Access::Read).await.expect("acquire");
        assert_eq!(lock.data()[5], 0xAB);
        assert_eq!(lock.access(), Access::Read);
        assert_eq!(cache.block_count(), 1);
    }

    #[tokio::test]
    async fn test_read_transaction_rejects_writes() {
        let cache = BufferCache::new(64);
        let id = {
            let txn = cache.begin(Access::Write);
            txn.create().await.expect("create").id()
        };

        let txn = cache.begin(Access::Read);
        assert_eq!(txn.create().await.err(), Some(CacheError::ReadOnlyTransaction));
        assert_eq!(
            txn.acquire(id, Access::Write).await.err(),
            Some(CacheError::ReadOnlyTransaction)
        );
        assert_eq!(txn.detach_child(id), Err(CacheError::ReadOnlyTransaction));
        assert!(txn.acquire(id, Access::Read).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_frees_and_reuses_id() {
        let cache = BufferCache::new(64);
        let txn = cache.begin(Access::Write);

        let a = txn.create().await.expect("create");
        let a_id = a.id();
        let b = txn.create().await.expect("create");
        assert_ne!(a_id, b.id());

        txn.mark_deleted(a).expect("delete");
        assert_eq!(cache.block_count(), 1);
        assert_eq!(
            txn.acquire(a_id, Access::Read).await.err(),
            Some(CacheError::UnknownBlock(a_id))
        );

        let c = txn.create().await.expect("create");
        assert_eq!(c.id(), a_id);
        assert!(c.data().iter().all(|&x| x == 0));
    }

    #[tokio::test]
    async fn test_mark_deleted_requires_write_lock() {
        let cache = BufferCache::new(64);
        let txn = cache.begin(Access::Write);
        let id = txn.create().await.expect("create").id();

        let read = txn.acquire(id, Access::Read).await.expect("acquire");
        assert_eq!(txn.mark_deleted(read), Err(CacheError::NotWriteLocked(id)));
        assert_eq!(cache.block_count(), 1);
    }

    #[tokio::test]
    async fn test_writer_excludes_other_acquisitions() {
        let cache = BufferCache::new(64);
        let txn = cache.begin(Access::Write);
        let lock = txn.create().await.expect("create");
        let id = lock.id();

        let other = cache.begin(Access::Read);
        let pending = tokio::time::timeout(Duration::from_millis(20), other.acquire(id, Access::Read)).await;
        assert!(pending.is_err(), "reader must wait for the writer");

        drop(lock);
        let granted = tokio::time::timeout(Duration::from_millis(200), other.acquire(id, Access::Read)).await;
        assert!(granted.is_ok());
    }

    #[tokio::test]
    async fn test_shared_readers() {
        let cache = BufferCache::new(64);
        let id = cache.begin(Access::Write).create().await.expect("create").id();

        let txn = cache.begin(Access::Read);
        let first = txn.acquire(id, Access::Read).await.expect("first");
        let second = txn.acquire(id, Access::Read).await.expect("second");
        assert_eq!(first.id(), second.id());
    }

    #[tokio::test]
    async fn test_detach_child() {
        let cache = BufferCache::new(64);
        let txn = cache.begin(Access::Write);
        let lock = txn.create().await.expect("create");
        let id = lock.id();
        drop(lock);

        txn.detach_child(id).expect("detach");
        assert!(cache.is_detached(id));
        assert_eq!(cache.block_count(), 1);
        assert_eq!(txn.detach_child(9999), Err(CacheError::UnknownBlock(9999)));
    }

    #[tokio::test]
    #[should_panic(expected = "mutated under a read acquisition")]
    async fn test_data_mut_on_read_lock_panics() {
        let cache = BufferCache::new(64);
        let id = cache.begin(Access::Write).create().await.expect("create").id();
        let mut lock = cache.begin(Access::Read).acquire(id, Access::Read).await.expect("acquire");
        let _ = lock.data_mut();
    }
}
