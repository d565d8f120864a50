//! Keys stored in B-tree nodes.
//!
//! Keys are arbitrary byte strings compared lexicographically. On disk a key
//! is stored as a one-byte length followed by its bytes, so the length is
//! bounded by `MAX_KEY_SIZE`.

/// Maximum key length in bytes.
///
/// Leaf entries reuse the length byte as an entry-kind code; values above
/// this bound are reserved for tombstones and skip entries.
pub const MAX_KEY_SIZE: usize = 250;

/// Errors produced when validating a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// Key exceeds `MAX_KEY_SIZE`.
    TooLong(usize),
}

impl std::fmt::Display for KeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooLong(len) => write!(f, "key too long: {len} bytes (max {MAX_KEY_SIZE})"),
        }
    }
}

impl std::error::Error for KeyError {}

/// Check that a key can be stored in a node.
pub const fn check_key(key: &[u8]) -> Result<(), KeyError> {
    if key.len() > MAX_KEY_SIZE {
        return Err(KeyError::TooLong(key.len()));
    }
    Ok(())
}

/// Serialized size of a key (length byte plus key bytes).
#[must_use]
pub const fn key_cost(key: &[u8]) -> usize {
    1 + key.len()
}
