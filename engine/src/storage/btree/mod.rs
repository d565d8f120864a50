//! B-tree nodes and traversal.
//!
//! # Structure
//!
//! - Internal nodes (`internal`): separator keys routing to child blocks
//! - Leaf nodes (`leaf`): key/value entries plus recent tombstones and
//!   modification timestamps
//! - `BTree` (`tree`): top-down traversal composing the two over the buffer cache
//!
//! Node modules are pure byte-buffer transformers: they assume the caller
//! holds a write acquisition on every block they mutate.

pub mod internal;
pub mod leaf;
mod retention;
mod sizer;
mod tree;

pub use leaf::{EntryReceiver, HEADER_SIZE as LEAF_HEADER_SIZE};
pub use retention::{DELETION_RESERVE_FRACTION, MANDATORY_TIMESTAMPS};
pub use sizer::{BlobValueSizer, ValueSizer};
pub use tree::{BTree, BTreeError};

/// A structural check of a node failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorruptionError {
    /// Kind of node or structure that failed the check.
    pub node: &'static str,
    pub message: &'static str,
}

impl CorruptionError {
    #[must_use]
    pub const fn leaf(message: &'static str) -> Self {
        Self { node: "leaf", message }
    }

    #[must_use]
    pub const fn internal(message: &'static str) -> Self {
        Self {
            node: "internal",
            message,
        }
    }

    #[must_use]
    pub const fn tree(message: &'static str) -> Self {
        Self { node: "tree", message }
    }
}

impl std::fmt::Display for CorruptionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "corrupt {} node: {}", self.node, self.message)
    }
}

impl std::error::Error for CorruptionError {}
