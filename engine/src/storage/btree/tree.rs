//! B-tree traversal over the buffer cache.
//!
//! Keys map to values stored as blobs; each leaf entry holds the blob
//! reference. Writers restructure proactively on the way down: a full child
//! is split and an underfull child is merged with or leveled against a
//! sibling before the traversal enters it, so the parent always has room for
//! the resulting separator change. Locks are taken hand over hand, parent
//! before child.

use std::collections::HashSet;

use crate::config::{ConfigError, EngineConfig};
use crate::storage::blob::{Blob, BlobError};
use crate::storage::btree::sizer::{BlobValueSizer, ValueSizer};
use crate::storage::btree::{CorruptionError, internal, leaf};
use crate::storage::cache::{Access, BlockLock, CacheError, Transaction};
use crate::storage::page::{BlockId, NULL_BLOCK_ID};
use crate::storage::superblock::{Superblock, SuperblockError};
use crate::types::{KeyError, Timestamp, check_key};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Internal,
    Leaf,
}

/// A B-tree rooted at a superblock.
#[derive(Debug, Clone)]
pub struct BTree {
    superblock: BlockId,
    block_size: usize,
    max_ref_len: usize,
    blob_fanout: usize,
    sizer: BlobValueSizer,
}

impl BTree {
    /// Create an empty tree with a new superblock.
    pub async fn create(txn: &Transaction, config: &EngineConfig) -> Result<Self, BTreeError> {
        Self::check_config(txn, config)?;
        let mut superblock = txn.create().await?;
        Superblock::new(config.block_size).write_to(superblock.data_mut());
        tracing::debug!(superblock = superblock.id(), "created tree");
        Ok(Self::with_superblock(superblock.id(), config))
    }

    /// Open an existing tree by its superblock id.
    pub async fn open(txn: &Transaction, superblock: BlockId, config: &EngineConfig) -> Result<Self, BTreeError> {
        Self::check_config(txn, config)?;
        let lock = txn.acquire(superblock, Access::Read).await?;
        Superblock::read_from(lock.data())?;
        Ok(Self::with_superblock(superblock, config))
    }

    fn check_config(txn: &Transaction, config: &EngineConfig) -> Result<(), BTreeError> {
        config.validate()?;
        if txn.block_size() != config.block_size {
            return Err(BTreeError::BlockSizeMismatch {
                config: config.block_size,
                cache: txn.block_size(),
            });
        }
        Ok(())
    }

    const fn with_superblock(superblock: BlockId, config: &EngineConfig) -> Self {
        Self {
            superblock,
            block_size: config.block_size,
            max_ref_len: config.max_ref_len,
            blob_fanout: config.blob_fanout,
            sizer: BlobValueSizer::new(config.block_size, config.max_ref_len),
        }
    }

    /// Id of the superblock this tree is opened by.
    #[must_use]
    pub const fn superblock(&self) -> BlockId {
        self.superblock
    }

    /// Newest timestamp written to the tree.
    pub async fn newest_tstamp(&self, txn: &Transaction) -> Result<Timestamp, BTreeError> {
        let lock = txn.acquire(self.superblock, Access::Read).await?;
        Ok(Superblock::read_from(lock.data())?.newest_tstamp)
    }

    fn node_kind(&self, data: &[u8]) -> Result<NodeKind, BTreeError> {
        if internal::MAGIC.matches(data) {
            Ok(NodeKind::Internal)
        } else if self.sizer.leaf_magic().matches(data) {
            Ok(NodeKind::Leaf)
        } else {
            Err(CorruptionError::tree("unknown node magic").into())
        }
    }

    /// Look up a value by key.
    pub async fn get(&self, txn: &Transaction, key: &[u8]) -> Result<Option<Vec<u8>>, BTreeError> {
        check_key(key)?;
        let Some((node, _)) = self.find_leaf(txn, key).await? else {
            return Ok(None);
        };
        let Some(r) = leaf::lookup(&self.sizer, node.data(), key).map(<[u8]>::to_vec) else {
            return Ok(None);
        };
        // The leaf stays read-locked while its value is read.
        let value = self.read_value(txn, &r).await?;
        drop(node);
        Ok(Some(value))
    }

    /// Insert or update a key-value pair, stamped with `tstamp`.
    ///
    /// The replaced value's blob blocks are released.
    pub async fn insert(&self, txn: &Transaction, key: &[u8], value: &[u8], tstamp: Timestamp) -> Result<(), BTreeError> {
        check_key(key)?;

        let mut r = Blob::empty_ref(self.max_ref_len);
        let ref_size = {
            let mut blob = self.blob(&mut r);
            blob.append_value(txn, value).await?;
            blob.ref_size()
        };
        r.truncate(ref_size);

        // Until the reference is in a leaf, its blocks belong to no one.
        let old = match self.insert_ref(txn, key, &r, tstamp).await {
            Ok(old) => old,
            Err(e) => {
                if let Err(clear) = self.clear_value(txn, &r).await {
                    tracing::warn!(error = %clear, "failed to release the value of a failed insert");
                }
                return Err(e);
            }
        };
        if let Some(old) = old {
            self.clear_value(txn, &old).await?;
        }
        tracing::trace!(key_len = key.len(), value_len = value.len(), "inserted");
        Ok(())
    }

    /// Store blob reference `r` under `key`, returning the replaced reference.
    async fn insert_ref(&self, txn: &Transaction, key: &[u8], r: &[u8], tstamp: Timestamp) -> Result<Option<Vec<u8>>, BTreeError> {
        let superblock = txn.acquire(self.superblock, Access::Write).await?;
        let (superblock, max_existing) = Self::advance_tstamp(superblock, tstamp)?;
        let mut node = self.descend_for_write(txn, superblock, key, Some(r)).await?;

        let old = leaf::lookup(&self.sizer, node.data(), key).map(<[u8]>::to_vec);
        if !leaf::insert(&self.sizer, node.data_mut(), key, r, tstamp, max_existing) {
            return Err(CorruptionError::tree("leaf full after split").into());
        }
        tracing::trace!(leaf = node.id(), "stored reference");
        Ok(old)
    }

    /// Delete `key`, stamped with `tstamp`.
    ///
    /// Returns whether the key was present.
    pub async fn remove(&self, txn: &Transaction, key: &[u8], tstamp: Timestamp) -> Result<bool, BTreeError> {
        check_key(key)?;
        let superblock = txn.acquire(self.superblock, Access::Write).await?;
        if Superblock::read_from(superblock.data())?.root == NULL_BLOCK_ID {
            return Ok(false);
        }
        let (superblock, max_existing) = Self::advance_tstamp(superblock, tstamp)?;
        let mut node = self.descend_for_write(txn, superblock, key, None).await?;

        let old = leaf::lookup(&self.sizer, node.data(), key).map(<[u8]>::to_vec);
        leaf::remove(&self.sizer, node.data_mut(), key, tstamp, max_existing);
        let Some(old) = old else {
            return Ok(false);
        };
        self.clear_value(txn, &old).await?;
        tracing::trace!(leaf = node.id(), key_len = key.len(), "removed");
        Ok(true)
    }

    /// Up to `limit` live pairs with keys `>= start`, in key order.
    pub async fn range(&self, txn: &Transaction, start: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>, BTreeError> {
        let mut pairs = Vec::new();
        let mut cursor = start.to_vec();
        while pairs.len() < limit {
            let Some((node, bound)) = self.find_leaf(txn, &cursor).await? else {
                break;
            };
            let refs: Vec<(Vec<u8>, Vec<u8>)> = leaf::iter_from(&self.sizer, node.data(), &cursor)
                .take(limit - pairs.len())
                .map(|(k, r)| (k.to_vec(), r.to_vec()))
                .collect();
            for (key, r) in refs {
                let value = self.read_value(txn, &r).await?;
                pairs.push((key, value));
            }
            drop(node);

            // The next leaf starts just past this leaf's upper bound.
            let Some(mut bound) = bound else {
                break;
            };
            bound.push(0);
            cursor = bound;
        }
        Ok(pairs)
    }

    /// Check every node's structure, key ranges and leaf depth.
    pub async fn check(&self, txn: &Transaction) -> Result<(), BTreeError> {
        let root = {
            let lock = txn.acquire(self.superblock, Access::Read).await?;
            Superblock::read_from(lock.data())?.root
        };
        if root == NULL_BLOCK_ID {
            return Ok(());
        }

        let mut stack: Vec<(BlockId, Option<Vec<u8>>, Option<Vec<u8>>, usize)> = vec![(root, None, None, 0)];
        let mut leaf_depth = None;
        let mut visited = HashSet::new();
        while let Some((id, lower, upper, depth)) = stack.pop() {
            if !visited.insert(id) {
                return Err(CorruptionError::tree("node reachable from two parents").into());
            }
            let lock = txn.acquire(id, Access::Read).await?;
            let data = lock.data();
            let outside = |key: &[u8]| {
                lower.as_deref().is_some_and(|l| key <= l) || upper.as_deref().is_some_and(|u| key > u)
            };
            match self.node_kind(data)? {
                NodeKind::Internal => {
                    internal::validate(data)?;
                    let n = internal::child_count(data);
                    if n == 0 {
                        return Err(CorruptionError::tree("empty internal node").into());
                    }
                    let mut previous = lower.clone();
                    for index in 0..n {
                        let next = match internal::separator(data, index) {
                            Some(separator) if outside(separator) => {
                                return Err(CorruptionError::tree("separator outside its parent's range").into());
                            }
                            Some(separator) => Some(separator.to_vec()),
                            None => upper.clone(),
                        };
                        stack.push((internal::child_at(data, index), previous, next.clone(), depth + 1));
                        previous = next;
                    }
                }
                NodeKind::Leaf => {
                    leaf::validate(&self.sizer, data)?;
                    if *leaf_depth.get_or_insert(depth) != depth {
                        return Err(CorruptionError::tree("leaves at different depths").into());
                    }
                    if leaf::iter(&self.sizer, data).any(|(key, _)| outside(key)) {
                        return Err(CorruptionError::tree("key outside its parent's range").into());
                    }
                }
            }
        }
        Ok(())
    }

    /// Record `tstamp` in the superblock, returning the previous newest
    /// timestamp as the bound for untimestamped leaf entries.
    fn advance_tstamp(mut superblock: BlockLock, tstamp: Timestamp) -> Result<(BlockLock, Timestamp), BTreeError> {
        let newest = Superblock::read_from(superblock.data())?.newest_tstamp;
        if tstamp > newest {
            Superblock::set_newest_tstamp(superblock.data_mut(), tstamp);
        }
        Ok((superblock, newest))
    }

    /// Read-locked descent to the leaf responsible for `key`.
    ///
    /// Also returns the leaf's upper bound: the smallest separator routing to
    /// it, or `None` for the rightmost leaf.
    async fn find_leaf(&self, txn: &Transaction, key: &[u8]) -> Result<Option<(BlockLock, Option<Vec<u8>>)>, BTreeError> {
        let superblock = txn.acquire(self.superblock, Access::Read).await?;
        let root = Superblock::read_from(superblock.data())?.root;
        if root == NULL_BLOCK_ID {
            return Ok(None);
        }
        let mut node = txn.acquire(root, Access::Read).await?;
        drop(superblock);

        let mut bound = None;
        while self.node_kind(node.data())? == NodeKind::Internal {
            if let Some(separator) = internal::upper_bound(node.data(), key) {
                bound = Some(separator.to_vec());
            }
            let child = internal::lookup(node.data(), key);
            node = txn.acquire(child, Access::Read).await?;
        }
        Ok(Some((node, bound)))
    }

    /// Write-locked descent to the leaf responsible for `key`, restructuring
    /// on the way so the leaf can take `value` (or, for a removal, so no
    /// node on the path is underfull).
    async fn descend_for_write(
        &self,
        txn: &Transaction,
        mut superblock: BlockLock,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<BlockLock, BTreeError> {
        let root = Superblock::read_from(superblock.data())?.root;
        if root == NULL_BLOCK_ID {
            let mut node = txn.create().await?;
            leaf::init(&self.sizer, node.data_mut());
            Superblock::set_root(superblock.data_mut(), node.id());
            tracing::debug!(root = node.id(), "created root leaf");
            return Ok(node);
        }

        let mut node = txn.acquire(root, Access::Write).await?;
        loop {
            let grow = match self.node_kind(node.data())? {
                NodeKind::Internal if internal::child_count(node.data()) == 1 => {
                    let child = internal::child_at(node.data(), 0);
                    Superblock::set_root(superblock.data_mut(), child);
                    txn.mark_deleted(node)?;
                    node = txn.acquire(child, Access::Write).await?;
                    tracing::debug!(root = child, "collapsed root");
                    continue;
                }
                NodeKind::Internal => internal::is_full(node.data()),
                NodeKind::Leaf => value.is_some_and(|v| leaf::is_full(&self.sizer, node.data(), key, v)),
            };
            if grow {
                let (median, right) = self.split_node(txn, &mut node).await?;
                let mut new_root = txn.create().await?;
                internal::init(new_root.data_mut());
                insert_separator(new_root.data_mut(), &median, node.id(), right.id())?;
                Superblock::set_root(superblock.data_mut(), new_root.id());
                tracing::debug!(root = new_root.id(), "grew root");
                node = new_root;
            }
            break;
        }
        drop(superblock);

        while self.node_kind(node.data())? == NodeKind::Internal {
            let child = txn.acquire(internal::lookup(node.data(), key), Access::Write).await?;
            node = self.restructure(txn, &mut node, child, key, value).await?;
        }
        Ok(node)
    }

    /// Split `node` into itself and a new right sibling.
    async fn split_node(&self, txn: &Transaction, node: &mut BlockLock) -> Result<(Vec<u8>, BlockLock), BTreeError> {
        let mut right = txn.create().await?;
        let median = match self.node_kind(node.data())? {
            NodeKind::Internal => {
                internal::init(right.data_mut());
                internal::split(node.data_mut(), right.data_mut())
            }
            NodeKind::Leaf => {
                leaf::init(&self.sizer, right.data_mut());
                leaf::split(&self.sizer, node.data_mut(), right.data_mut())
            }
        };
        Ok((median, right))
    }

    /// Make `child` safe to enter: split it if full, rebalance it if
    /// underfull. Returns whichever node now covers `key`.
    async fn restructure(
        &self,
        txn: &Transaction,
        parent: &mut BlockLock,
        mut child: BlockLock,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<BlockLock, BTreeError> {
        let kind = self.node_kind(child.data())?;
        let needs_split = match kind {
            NodeKind::Internal => internal::is_full(child.data()),
            NodeKind::Leaf => value.is_some_and(|v| leaf::is_full(&self.sizer, child.data(), key, v)),
        };
        if needs_split {
            let (median, right) = self.split_node(txn, &mut child).await?;
            insert_separator(parent.data_mut(), &median, child.id(), right.id())?;
            return Ok(if key <= median.as_slice() { child } else { right });
        }

        let underfull = match kind {
            NodeKind::Internal => internal::is_underfull(child.data()),
            NodeKind::Leaf => value.is_none() && leaf::is_underfull(&self.sizer, child.data()),
        };
        if underfull {
            return self.rebalance(txn, parent, child, kind, key).await;
        }
        Ok(child)
    }

    /// Merge `child` with a sibling, or level the two if they do not fit in
    /// one node.
    async fn rebalance(
        &self,
        txn: &Transaction,
        parent: &mut BlockLock,
        mut child: BlockLock,
        kind: NodeKind,
        key: &[u8],
    ) -> Result<BlockLock, BTreeError> {
        let Some(sibling) = internal::sibling(parent.data(), key) else {
            return Ok(child);
        };
        let mut sibling_lock = txn.acquire(sibling.id, Access::Write).await?;

        let mergable = match kind {
            NodeKind::Internal => internal::is_mergable(child.data(), sibling_lock.data()),
            NodeKind::Leaf => leaf::is_mergable(&self.sizer, child.data(), sibling_lock.data()),
        };
        if mergable {
            let (mut left, mut right) = if sibling.node_is_left {
                (child, sibling_lock)
            } else {
                (sibling_lock, child)
            };
            match kind {
                NodeKind::Internal => internal::merge(left.data_mut(), right.data_mut(), &sibling.separator),
                NodeKind::Leaf => leaf::merge(&self.sizer, left.data_mut(), right.data_mut()),
            }
            if internal::remove(parent.data_mut(), &sibling.separator) != Some(left.id()) {
                return Err(CorruptionError::tree("merged child missing from its parent").into());
            }
            tracing::debug!(deleted = left.id(), kept = right.id(), "merged children");
            txn.mark_deleted(left)?;
            return Ok(right);
        }

        let separator = match kind {
            NodeKind::Internal => internal::level(
                child.data_mut(),
                sibling_lock.data_mut(),
                &sibling.separator,
                !sibling.node_is_left,
            )
            .map(|leveled| {
                tracing::trace!(moved = leveled.moved.len(), "children changed parents");
                leveled.separator
            }),
            NodeKind::Leaf => leaf::level(&self.sizer, child.data_mut(), sibling_lock.data_mut(), !sibling.node_is_left),
        };
        let Some(separator) = separator else {
            return Ok(child);
        };
        internal::update_key(parent.data_mut(), &sibling.separator, &separator);

        let key_goes_left = key <= separator.as_slice();
        Ok(if key_goes_left == sibling.node_is_left { child } else { sibling_lock })
    }

    fn ref_buffer(&self, r: &[u8]) -> Vec<u8> {
        let mut buf = r.to_vec();
        buf.resize(r.len().max(self.max_ref_len), 0);
        buf
    }

    /// Blob over reference buffer `r`, read with this tree's fan-out.
    fn blob<'r>(&self, r: &'r mut [u8]) -> Blob<'r> {
        Blob::new(self.block_size, r, self.max_ref_len).with_fanout(self.blob_fanout)
    }

    async fn read_value(&self, txn: &Transaction, r: &[u8]) -> Result<Vec<u8>, BTreeError> {
        let mut buf = self.ref_buffer(r);
        Ok(self.blob(&mut buf).read_all(txn).await?)
    }

    async fn clear_value(&self, txn: &Transaction, r: &[u8]) -> Result<(), BTreeError> {
        let mut buf = self.ref_buffer(r);
        Ok(self.blob(&mut buf).clear(txn).await?)
    }
}

fn insert_separator(parent: &mut [u8], median: &[u8], left: BlockId, right: BlockId) -> Result<(), BTreeError> {
    if internal::insert(parent, median, left, right) {
        Ok(())
    } else {
        Err(CorruptionError::tree("parent full during split").into())
    }
}

/// Errors that can occur during B-tree operations.
#[derive(Debug)]
pub enum BTreeError {
    /// Buffer cache error.
    Cache(CacheError),
    /// Blob read or write error.
    Blob(BlobError),
    /// A node failed a structural check.
    Corruption(CorruptionError),
    /// The superblock could not be read.
    Superblock(SuperblockError),
    /// The key cannot be stored.
    Key(KeyError),
    /// The configuration is invalid.
    Config(ConfigError),
    /// The configuration and the cache disagree on the block size.
    BlockSizeMismatch { config: usize, cache: usize },
}

impl std::fmt::Display for BTreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cache(e) => write!(f, "cache error: {e}"),
            Self::Blob(e) => write!(f, "blob error: {e}"),
            Self::Corruption(e) => write!(f, "{e}"),
            Self::Superblock(e) => write!(f, "superblock error: {e}"),
            Self::Key(e) => write!(f, "{e}"),
            Self::Config(e) => write!(f, "config error: {e}"),
            Self::BlockSizeMismatch { config, cache } => {
                write!(f, "configured block size {config} does not match cache block size {cache}")
            }
        }
    }
}

impl std::error::Error for BTreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Cache(e) => Some(e),
            Self::Blob(e) => Some(e),
            Self::Corruption(e) => Some(e),
            Self::Superblock(e) => Some(e),
            Self::Key(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::BlockSizeMismatch { .. } => None,
        }
    }
}

impl From<CacheError> for BTreeError {
    fn from(e: CacheError) -> Self {
        Self::Cache(e)
    }
}

impl From<BlobError> for BTreeError {
    fn from(e: BlobError) -> Self {
        Self::Blob(e)
    }
}

impl From<CorruptionError> for BTreeError {
    fn from(e: CorruptionError) -> Self {
        Self::Corruption(e)
    }
}

impl From<SuperblockError> for BTreeError {
    fn from(e: SuperblockError) -> Self {
        Self::Superblock(e)
    }
}

impl From<KeyError> for BTreeError {
    fn from(e: KeyError) -> Self {
        Self::Key(e)
    }
}

impl From<ConfigError> for BTreeError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::cache::BufferCache;
    use crate::testing;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    const CONFIG: EngineConfig = testing::small_ref_config();

    async fn new_tree() -> (Arc<BufferCache>, BTree) {
        let (cache, txn) = testing::new_write_txn(CONFIG.block_size);
        let tree = BTree::create(&txn, &CONFIG).await.expect("create tree");
        (cache, tree)
    }

    fn padded_key(i: usize) -> Vec<u8> {
        format!("{i:0>100}").into_bytes()
    }

    #[tokio::test]
    async fn test_btree_basic_operations() {
        let (cache, tree) = new_tree().await;
        let txn = cache.begin(Access::Write);

        assert_eq!(tree.get(&txn, b"missing").await.expect("get"), None);
        assert!(!tree.remove(&txn, b"missing", Timestamp(1)).await.expect("remove"));

        tree.insert(&txn, b"key1", b"value1", Timestamp(1)).await.expect("insert");
        tree.insert(&txn, b"key2", b"value2", Timestamp(2)).await.expect("insert");
        assert_eq!(tree.get(&txn, b"key1").await.expect("get"), Some(b"value1".to_vec()));
        assert_eq!(tree.get(&txn, b"key2").await.expect("get"), Some(b"value2".to_vec()));

        tree.insert(&txn, b"key1", b"updated", Timestamp(3)).await.expect("update");
        assert_eq!(tree.get(&txn, b"key1").await.expect("get"), Some(b"updated".to_vec()));

        assert!(tree.remove(&txn, b"key1", Timestamp(4)).await.expect("remove"));
        assert_eq!(tree.get(&txn, b"key1").await.expect("get"), None);
        assert!(!tree.remove(&txn, b"key1", Timestamp(5)).await.expect("remove again"));
        assert_eq!(tree.newest_tstamp(&txn).await.expect("tstamp"), Timestamp(5));
        tree.check(&txn).await.expect("check");
    }

    #[tokio::test]
    async fn test_btree_rejects_long_key() {
        let (cache, tree) = new_tree().await;
        let txn = cache.begin(Access::Write);
        let key = vec![b'k'; 251];
        assert!(matches!(
            tree.insert(&txn, &key, b"v", Timestamp(1)).await,
            Err(BTreeError::Key(KeyError::TooLong(251)))
        ));
    }

    #[tokio::test]
    async fn test_btree_open() {
        let (cache, tree) = new_tree().await;
        let txn = cache.begin(Access::Write);
        tree.insert(&txn, b"persisted", b"yes", Timestamp(1)).await.expect("insert");

        let reopened = BTree::open(&txn, tree.superblock(), &CONFIG).await.expect("open");
        assert_eq!(reopened.get(&txn, b"persisted").await.expect("get"), Some(b"yes".to_vec()));

        let wrong = EngineConfig {
            block_size: 8192,
            ..CONFIG
        };
        assert!(matches!(
            BTree::open(&txn, tree.superblock(), &wrong).await,
            Err(BTreeError::BlockSizeMismatch { config: 8192, cache: 4096 })
        ));
    }

    #[tokio::test]
    async fn test_btree_read_transaction_cannot_write() {
        let (cache, tree) = new_tree().await;
        let txn = cache.begin(Access::Read);
        assert!(tree.get(&txn, b"k").await.expect("get").is_none());
        assert!(matches!(
            tree.insert(&txn, b"k", b"v", Timestamp(1)).await,
            Err(BTreeError::Cache(CacheError::ReadOnlyTransaction) | BTreeError::Blob(BlobError::Cache(CacheError::ReadOnlyTransaction)))
        ));
    }

    #[tokio::test]
    async fn test_btree_many_inserts_and_removes() {
        let (cache, tree) = new_tree().await;
        let txn = cache.begin(Access::Write);
        let mut rng = StdRng::seed_from_u64(42);

        let mut order: Vec<usize> = (0..3000).collect();
        order.shuffle(&mut rng);
        let mut model = BTreeMap::new();
        for (tick, &i) in order.iter().enumerate() {
            let value = format!("value-{i}").into_bytes();
            tree.insert(&txn, &padded_key(i), &value, Timestamp(tick as u64 + 1)).await.expect("insert");
            model.insert(padded_key(i), value);
        }
        tree.check(&txn).await.expect("check after inserts");

        for i in [0, 1, 1500, 2999] {
            assert_eq!(tree.get(&txn, &padded_key(i)).await.expect("get"), model.get(&padded_key(i)).cloned());
        }
        let all = tree.range(&txn, b"", usize::MAX).await.expect("range");
        assert_eq!(all, model.clone().into_iter().collect::<Vec<_>>());

        let mut tick = 10_000;
        order.shuffle(&mut rng);
        for &i in &order[..2500] {
            tick += 1;
            assert!(tree.remove(&txn, &padded_key(i), Timestamp(tick)).await.expect("remove"));
            model.remove(&padded_key(i));
        }
        tree.check(&txn).await.expect("check after removes");

        let all = tree.range(&txn, b"", usize::MAX).await.expect("range");
        assert_eq!(all, model.into_iter().collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_btree_random_operations_match_model() {
        let (cache, tree) = new_tree().await;
        let txn = cache.begin(Access::Write);
        let mut rng = StdRng::seed_from_u64(7);
        let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

        for tick in 1..=4000u64 {
            let key = padded_key(rng.random_range(0..800));
            if rng.random_bool(0.65) {
                let value = vec![rng.random::<u8>(); rng.random_range(0..200)];
                tree.insert(&txn, &key, &value, Timestamp(tick)).await.expect("insert");
                model.insert(key, value);
            } else {
                let removed = tree.remove(&txn, &key, Timestamp(tick)).await.expect("remove");
                assert_eq!(removed, model.remove(&key).is_some());
            }
        }

        tree.check(&txn).await.expect("check");
        let all = tree.range(&txn, b"", usize::MAX).await.expect("range");
        assert_eq!(all, model.into_iter().collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_btree_range_with_limit() {
        let (cache, tree) = new_tree().await;
        let txn = cache.begin(Access::Write);
        for i in 0..500 {
            tree.insert(&txn, &padded_key(i), b"v", Timestamp(i as u64 + 1)).await.expect("insert");
        }

        let page = tree.range(&txn, &padded_key(100), 250).await.expect("range");
        assert_eq!(page.len(), 250);
        assert_eq!(page[0].0, padded_key(100));
        assert_eq!(page[249].0, padded_key(349));

        let tail = tree.range(&txn, &padded_key(490), 100).await.expect("range");
        assert_eq!(tail.len(), 10);
    }

    #[tokio::test]
    async fn test_btree_large_values_release_blocks() {
        let (cache, tree) = new_tree().await;
        let txn = cache.begin(Access::Write);
        tree.insert(&txn, b"small", b"x", Timestamp(1)).await.expect("insert");
        let baseline = cache.block_count();

        let big: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        tree.insert(&txn, b"big", &big, Timestamp(2)).await.expect("insert big");
        assert!(cache.block_count() > baseline + 40);
        assert_eq!(tree.get(&txn, b"big").await.expect("get"), Some(big));

        tree.insert(&txn, b"big", b"now small", Timestamp(3)).await.expect("overwrite");
        assert_eq!(cache.block_count(), baseline);

        let big2 = vec![9u8; 50_000];
        tree.insert(&txn, b"big2", &big2, Timestamp(4)).await.expect("insert big2");
        assert!(tree.remove(&txn, b"big2", Timestamp(5)).await.expect("remove"));
        assert_eq!(cache.block_count(), baseline);
    }

    #[tokio::test]
    async fn test_btree_uses_configured_fanout() {
        let config = EngineConfig {
            blob_fanout: 3,
            ..CONFIG
        };
        let (_cache, txn) = testing::new_write_txn(config.block_size);
        let tree = BTree::create(&txn, &config).await.expect("create");
        let mut r = Blob::empty_ref(config.max_ref_len);
        assert_eq!(tree.blob(&mut r).fanout(), 3);

        let reopened = BTree::open(&txn, tree.superblock(), &config).await.expect("open");
        assert_eq!(reopened.blob(&mut r).fanout(), 3);
    }

    #[tokio::test]
    async fn test_btree_failed_insert_releases_value() {
        let (cache, tree) = new_tree().await;
        let txn = cache.begin(Access::Write);
        tree.insert(&txn, b"a", b"small", Timestamp(1)).await.expect("insert");

        let root = {
            let lock = txn.acquire(tree.superblock(), Access::Read).await.expect("superblock");
            Superblock::read_from(lock.data()).expect("read superblock").root
        };
        txn.acquire(root, Access::Write).await.expect("root").data_mut()[..4].fill(0);
        let baseline = cache.block_count();

        let big = vec![5u8; 30_000];
        assert!(matches!(
            tree.insert(&txn, b"b", &big, Timestamp(2)).await,
            Err(BTreeError::Corruption(_))
        ));
        assert_eq!(cache.block_count(), baseline);
    }

    #[tokio::test]
    async fn test_btree_check_detects_cycle() {
        let (cache, tree) = new_tree().await;
        let txn = cache.begin(Access::Write);
        for i in 0..200 {
            tree.insert(&txn, &padded_key(i), b"v", Timestamp(i as u64 + 1)).await.expect("insert");
        }
        tree.check(&txn).await.expect("check");

        let root = {
            let lock = txn.acquire(tree.superblock(), Access::Read).await.expect("superblock");
            Superblock::read_from(lock.data()).expect("read superblock").root
        };
        {
            let mut lock = txn.acquire(root, Access::Write).await.expect("root");
            assert!(internal::MAGIC.matches(lock.data()));
            internal::init(lock.data_mut());
            assert!(internal::insert(lock.data_mut(), b"m", root, root));
        }
        assert!(matches!(tree.check(&txn).await, Err(BTreeError::Corruption(_))));
    }

    #[tokio::test]
    async fn test_btree_concurrent_writers() {
        let (cache, tree) = new_tree().await;
        let tree = Arc::new(tree);

        let writer = |offset: usize| {
            let cache = Arc::clone(&cache);
            let tree = Arc::clone(&tree);
            async move {
                let txn = cache.begin(Access::Write);
                for i in 0..300 {
                    let n = offset + i * 2;
                    tree.insert(&txn, &padded_key(n), b"v", Timestamp(n as u64 + 1)).await.expect("insert");
                }
            }
        };
        tokio::join!(writer(0), writer(1));

        let txn = cache.begin(Access::Read);
        tree.check(&txn).await.expect("check");
        assert_eq!(tree.range(&txn, b"", usize::MAX).await.expect("range").len(), 600);
    }
}
