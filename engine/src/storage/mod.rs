//! Block storage for the engine.
//!
//! B-tree nodes and blob trees live in fixed-size blocks owned by a
//! transactional buffer cache. Every block access goes through a
//! `Transaction`; node code only ever sees the acquired bytes.
//!
//! # Block kinds
//!
//! - Superblock (`"supe"`): root pointer and newest timestamp of one tree
//! - Internal node (`"lari"`): separator keys routing to child blocks
//! - Leaf node (`"leaf"`): entries whose values are blob references
//! - Blob blocks (`"larl"` / `"larn"`): raw bytes and child ids of large values
//!
//! # Usage
//!
//! ```ignore
//! use engine::config::EngineConfig;
//! use engine::storage::{Access, BTree, BufferCache};
//! use engine::types::Timestamp;
//!
//! let config = EngineConfig::default();
//! let cache = BufferCache::new(config.block_size);
//! let txn = cache.begin(Access::Write);
//!
//! let tree = BTree::create(&txn, &config).await?;
//! tree.insert(&txn, b"key", b"value", Timestamp(1)).await?;
//! assert_eq!(tree.get(&txn, b"key").await?, Some(b"value".to_vec()));
//! ```

pub mod blob;
pub mod btree;
pub mod cache;
pub mod page;
pub mod superblock;

pub use blob::{Blob, BlobError};
pub use btree::{BTree, BTreeError, CorruptionError};
pub use cache::{Access, BlockLock, BufferCache, CacheError, Transaction};
pub use page::{BlockId, NULL_BLOCK_ID};
pub use superblock::{Superblock, SuperblockError};
