//! Retained-cost calculation for leaf nodes.
//!
//! A leaf keeps explicit timestamps only for its most recent entries and keeps
//! tombstones only while they fall inside that window. The bytes a leaf must
//! hold regardless of garbage collection (its "mandatory cost") are therefore
//! the live entries plus the timestamps and tombstones of the retained window.
//!
//! Every operation that sizes a leaf (insert, split, merge, level, garbage
//! collection) asks this module where the window ends and what it costs, so
//! the accounting lives in exactly one place.

use crate::types::TIMESTAMP_SIZE;

/// Number of most recent entries whose timestamps a leaf retains.
pub const MANDATORY_TIMESTAMPS: usize = 5;

/// Tombstones in the retained window may use at most `1 / DELETION_RESERVE_FRACTION`
/// of a leaf's free space.
pub const DELETION_RESERVE_FRACTION: usize = 10;

/// Size of one entry in a leaf's offset table.
const PAIR_OFFSET_SIZE: usize = 2;

/// Kind of a physical leaf record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// Live key/value entry.
    Live,
    /// Deletion tombstone.
    Tombstone,
    /// Compaction padding, or an entry that is about to be replaced.
    Skip,
}

/// Sizing facts about one physical record, newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordCost {
    pub kind: RecordKind,
    /// Record size including any timestamp prefix.
    pub size: usize,
    pub timestamped: bool,
}

/// Result of a retention walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Retention {
    /// Bytes the window costs beyond the live entries themselves.
    pub extra_cost: usize,
    /// Number of leading records inside the window.
    pub window: usize,
}

/// Tombstone byte budget for a leaf with `free_space` usable bytes.
#[must_use]
pub const fn deletion_budget(free_space: usize, reserve_fraction: usize) -> usize {
    free_space / reserve_fraction
}

/// Walk records newest to oldest and find the retained window.
///
/// The window ends after `keep` live entries or tombstones, at the first
/// untimestamped record, or at the first tombstone that would exceed
/// `deletion_budget`, whichever comes first. Skip records inside the window
/// cost nothing and are not counted.
pub fn retain<I>(records: I, keep: usize, deletion_budget: usize) -> Retention
where
    I: IntoIterator<Item = RecordCost>,
{
    let mut retention = Retention::default();
    let mut counted = 0;
    let mut deletions = 0;

    for record in records {
        if !record.timestamped || counted >= keep {
            break;
        }
        match record.kind {
            RecordKind::Skip => {}
            RecordKind::Live => {
                retention.extra_cost += TIMESTAMP_SIZE;
                counted += 1;
            }
            RecordKind::Tombstone => {
                let cost = PAIR_OFFSET_SIZE + record.size;
                if deletions + cost > deletion_budget {
                    break;
                }
                deletions += cost;
                retention.extra_cost += cost;
                counted += 1;
            }
        }
        retention.window += 1;
    }

    retention
}

#[cfg(test)]
mod tests {
    use super::*;

    const fn live(size: usize, timestamped: bool) -> RecordCost {
        RecordCost {
            kind: RecordKind::Live,
            size,
            timestamped,
        }
    }

    const fn tombstone(size: usize) -> RecordCost {
        RecordCost {
            kind: RecordKind::Tombstone,
            size,
            timestamped: true,
        }
    }

    const SKIP: RecordCost = RecordCost {
        kind: RecordKind::Skip,
        size: 9,
        timestamped: true,
    };

    #[test]
    fn test_window_stops_after_keep() {
        let records = vec![live(20, true); 8];
        let r = retain(records, MANDATORY_TIMESTAMPS, 1000);
        assert_eq!(r.window, 5);
        assert_eq!(r.extra_cost, 5 * TIMESTAMP_SIZE);
    }

    #[test]
    fn test_window_stops_at_untimestamped() {
        let records = vec![live(20, true), live(20, true), live(20, false), live(20, true)];
        let r = retain(records, MANDATORY_TIMESTAMPS, 1000);
        assert_eq!(r.window, 2);
    }

    #[test]
    fn test_skips_are_free() {
        let records = vec![SKIP, live(20, true), SKIP, SKIP, live(20, true)];
        let r = retain(records, 2, 1000);
        assert_eq!(r.window, 5);
        assert_eq!(r.extra_cost, 2 * TIMESTAMP_SIZE);
    }

    #[test]
    fn test_tombstones_capped_by_budget() {
        let records = vec![tombstone(20), live(30, true), tombstone(20), tombstone(20)];
        let r = retain(records, MANDATORY_TIMESTAMPS, 50);
        // Each tombstone costs 22; a third would exceed the budget.
        assert_eq!(r.window, 3);
        assert_eq!(r.extra_cost, 22 + TIMESTAMP_SIZE + 22);
    }

    #[test]
    fn test_zero_keep() {
        let r = retain(vec![live(20, true)], 0, 100);
        assert_eq!(r, Retention::default());
    }

    #[test]
    fn test_deletion_budget() {
        assert_eq!(deletion_budget(4076, DELETION_RESERVE_FRACTION), 407);
    }
}
