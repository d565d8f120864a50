//! Replication timestamps attached to leaf entries.
//!
//! A timestamp records when a key was last modified. Leaves keep explicit
//! timestamps only for their most recent entries; older entries share an
//! implicit upper bound (see `storage::btree::leaf`).

/// Size of a serialized timestamp in bytes.
pub const TIMESTAMP_SIZE: usize = 8;

/// A logical modification time supplied by the caller of a tree mutation.
///
/// # Invariants
///
/// - Ordering is the ordering of the inner `u64`
/// - `DISTANT_PAST` is older than every real timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// The oldest representable timestamp.
    pub const DISTANT_PAST: Self = Self(0);

    /// One tick older than this timestamp (saturating at `DISTANT_PAST`).
    #[must_use]
    pub const fn next_older(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_older_saturates() {
        assert_eq!(Timestamp(10).next_older(), Timestamp(9));
        assert_eq!(Timestamp::DISTANT_PAST.next_older(), Timestamp::DISTANT_PAST);
    }

    #[test]
    fn test_display_and_order() {
        assert_eq!(Timestamp(42).to_string(), "t42");
        assert!(Timestamp::DISTANT_PAST < Timestamp(1));
    }
}
