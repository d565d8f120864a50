//! Leaf node format and algorithms.
//!
//! A leaf holds live key/value entries, deletion tombstones and compaction
//! padding inside one block. Recent entries carry an explicit modification
//! timestamp; older entries share an implicit recency bound.
//!
//! # Layout
//!
//! ```text
//! +-------+-----------+-----------+-----------+-----------------+----------------+
//! | magic | num_pairs | live_size | frontmost | tstamp_cutpoint | offsets (u16)  |
//! | (4)   | (u32)     | (u32)     | (u32)     | (u32)           | num_pairs * 2  |
//! +-------+-----------+-----------+-----------+-----------------+----------------+
//! |                free space                 | records, packed toward the end  |
//! +-------------------------------------------+---------------------------------+
//!                                             ^ frontmost
//! ```
//!
//! A record at an offset below `tstamp_cutpoint` starts with an 8-byte
//! timestamp. The entry itself is one of:
//!
//! - live: `key_size (<= 250)`, key, value (length given by the value sizer)
//! - tombstone: `255`, `key_size`, key
//! - skip: `254` | `253, pad` | `252, u16 extra, pad[extra]`
//!
//! # Invariants
//!
//! - Records are contiguous from `frontmost` to the block end, newest first
//! - `frontmost <= tstamp_cutpoint <= block_size` and the cutpoint falls on a
//!   record boundary
//! - Timestamps are non-increasing from `frontmost` toward the block end
//! - The offset table references every live entry and tombstone exactly once,
//!   in strictly increasing key order; skips are never referenced
//! - Tombstones always carry a timestamp
//! - `live_size` is the sum of `2 + entry size` over live entries

// Offsets are bounded by the block size (<= 64KB) and fit in u16/u32.
#![allow(clippy::cast_possible_truncation)]

use crate::storage::btree::CorruptionError;
use crate::storage::btree::retention::{
    self, DELETION_RESERVE_FRACTION, MANDATORY_TIMESTAMPS, RecordCost, RecordKind,
};
use crate::storage::btree::sizer::ValueSizer;
use crate::storage::page;
use crate::types::{MAX_KEY_SIZE, TIMESTAMP_SIZE, Timestamp, key_cost};

/// Size of the leaf header in bytes.
pub const HEADER_SIZE: usize = 20;

/// Size of one offset table entry.
const PAIR_OFFSET_SIZE: usize = 2;

/// Header field offsets.
mod offsets {
    pub const NUM_PAIRS: usize = 4;
    pub const LIVE_SIZE: usize = 8;
    pub const FRONTMOST: usize = 12;
    pub const TSTAMP_CUTPOINT: usize = 16;
}

const DELETE_ENTRY_CODE: u8 = 255;
const SKIP_ENTRY_CODE_ONE: u8 = 254;
const SKIP_ENTRY_CODE_TWO: u8 = 253;
const SKIP_ENTRY_CODE_MANY: u8 = 252;

fn num_pairs(buf: &[u8]) -> usize {
    page::read_u32(buf, offsets::NUM_PAIRS) as usize
}

fn set_num_pairs(buf: &mut [u8], n: usize) {
    page::write_u32(buf, offsets::NUM_PAIRS, n as u32);
}

fn live_size(buf: &[u8]) -> usize {
    page::read_u32(buf, offsets::LIVE_SIZE) as usize
}

fn set_live_size(buf: &mut [u8], size: usize) {
    page::write_u32(buf, offsets::LIVE_SIZE, size as u32);
}

fn frontmost(buf: &[u8]) -> usize {
    page::read_u32(buf, offsets::FRONTMOST) as usize
}

fn set_frontmost(buf: &mut [u8], offset: usize) {
    page::write_u32(buf, offsets::FRONTMOST, offset as u32);
}

fn cutpoint(buf: &[u8]) -> usize {
    page::read_u32(buf, offsets::TSTAMP_CUTPOINT) as usize
}

fn set_cutpoint(buf: &mut [u8], offset: usize) {
    page::write_u32(buf, offsets::TSTAMP_CUTPOINT, offset as u32);
}

fn pair_offset(buf: &[u8], index: usize) -> usize {
    usize::from(page::read_u16(buf, HEADER_SIZE + PAIR_OFFSET_SIZE * index))
}

fn set_pair_offset(buf: &mut [u8], index: usize, offset: usize) {
    page::write_u16(buf, HEADER_SIZE + PAIR_OFFSET_SIZE * index, offset as u16);
}

fn insert_pair_offset(buf: &mut [u8], index: usize, offset: usize) {
    let n = num_pairs(buf);
    let start = HEADER_SIZE + PAIR_OFFSET_SIZE * index;
    let end = HEADER_SIZE + PAIR_OFFSET_SIZE * n;
    buf.copy_within(start..end, start + PAIR_OFFSET_SIZE);
    set_pair_offset(buf, index, offset);
    set_num_pairs(buf, n + 1);
}

fn remove_pair_offset(buf: &mut [u8], index: usize) {
    let n = num_pairs(buf);
    let start = HEADER_SIZE + PAIR_OFFSET_SIZE * index;
    let end = HEADER_SIZE + PAIR_OFFSET_SIZE * n;
    buf.copy_within(start + PAIR_OFFSET_SIZE..end, start);
    set_num_pairs(buf, n - 1);
}

fn is_timestamped(buf: &[u8], offset: usize) -> bool {
    offset < cutpoint(buf)
}

/// Start of the entry proper within the record at `offset`.
fn entry_start(buf: &[u8], offset: usize) -> usize {
    if is_timestamped(buf, offset) { offset + TIMESTAMP_SIZE } else { offset }
}

fn record_timestamp(buf: &[u8], offset: usize) -> Option<Timestamp> {
    is_timestamped(buf, offset).then(|| Timestamp(page::read_u64(buf, offset)))
}

fn entry_kind(buf: &[u8], entry: usize) -> RecordKind {
    match buf[entry] {
        DELETE_ENTRY_CODE => RecordKind::Tombstone,
        SKIP_ENTRY_CODE_ONE | SKIP_ENTRY_CODE_TWO | SKIP_ENTRY_CODE_MANY => RecordKind::Skip,
        _ => RecordKind::Live,
    }
}

fn entry_size<S: ValueSizer + ?Sized>(sizer: &S, buf: &[u8], entry: usize) -> usize {
    match buf[entry] {
        DELETE_ENTRY_CODE => 2 + usize::from(buf[entry + 1]),
        SKIP_ENTRY_CODE_ONE => 1,
        SKIP_ENTRY_CODE_TWO => 2,
        SKIP_ENTRY_CODE_MANY => 3 + usize::from(page::read_u16(buf, entry + 1)),
        key_size => {
            let value = entry + 1 + usize::from(key_size);
            1 + usize::from(key_size) + sizer.size(&buf[value..])
        }
    }
}

fn record_size<S: ValueSizer + ?Sized>(sizer: &S, buf: &[u8], offset: usize) -> usize {
    let entry = entry_start(buf, offset);
    (entry - offset) + entry_size(sizer, buf, entry)
}

fn entry_key(buf: &[u8], entry: usize) -> &[u8] {
    if buf[entry] == DELETE_ENTRY_CODE {
        let size = usize::from(buf[entry + 1]);
        &buf[entry + 2..entry + 2 + size]
    } else {
        let size = usize::from(buf[entry]);
        &buf[entry + 1..entry + 1 + size]
    }
}

fn entry_value<'a, S: ValueSizer + ?Sized>(sizer: &S, buf: &'a [u8], entry: usize) -> &'a [u8] {
    let value = entry + 1 + usize::from(buf[entry]);
    let size = sizer.size(&buf[value..]);
    &buf[value..value + size]
}

/// Physical record offsets from `frontmost` to the block end.
struct Records<'a, S: ?Sized> {
    sizer: &'a S,
    buf: &'a [u8],
    offset: usize,
}

impl<S: ValueSizer + ?Sized> Iterator for Records<'_, S> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.offset >= self.buf.len() {
            return None;
        }
        let offset = self.offset;
        self.offset += record_size(self.sizer, self.buf, offset);
        Some(offset)
    }
}

fn records<'a, S: ValueSizer + ?Sized>(sizer: &'a S, buf: &'a [u8]) -> Records<'a, S> {
    Records {
        sizer,
        buf,
        offset: frontmost(buf),
    }
}

/// Binary search over the offset table, like `slice::binary_search`.
fn search(buf: &[u8], key: &[u8]) -> Result<usize, usize> {
    let (mut lo, mut hi) = (0, num_pairs(buf));
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let entry = entry_start(buf, pair_offset(buf, mid));
        match entry_key(buf, entry).cmp(key) {
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid,
            std::cmp::Ordering::Equal => return Ok(mid),
        }
    }
    Err(lo)
}

/// Usable bytes of a leaf (block size minus header).
#[must_use]
pub fn free_space<S: ValueSizer + ?Sized>(sizer: &S) -> usize {
    sizer.block_size() - HEADER_SIZE
}

/// Largest footprint of a single entry, including its offset and timestamp.
#[must_use]
pub fn leaf_epsilon<S: ValueSizer + ?Sized>(sizer: &S) -> usize {
    PAIR_OFFSET_SIZE + TIMESTAMP_SIZE + 1 + MAX_KEY_SIZE + sizer.max_possible_size()
}

fn available(buf: &[u8]) -> usize {
    frontmost(buf) - (HEADER_SIZE + PAIR_OFFSET_SIZE * num_pairs(buf))
}

fn deletion_budget<S: ValueSizer + ?Sized>(sizer: &S) -> usize {
    retention::deletion_budget(free_space(sizer), DELETION_RESERVE_FRACTION)
}

/// Retained cost of a leaf and the offset where its retained window ends.
///
/// `exclude` names a record that is about to be replaced; it is costed as if
/// it were already gone.
fn retained<S: ValueSizer + ?Sized>(sizer: &S, buf: &[u8], keep: usize, exclude: Option<usize>) -> (usize, usize) {
    let mut cost = live_size(buf);
    if let Some(offset) = exclude {
        let entry = entry_start(buf, offset);
        if entry_kind(buf, entry) == RecordKind::Live {
            cost -= PAIR_OFFSET_SIZE + entry_size(sizer, buf, entry);
        }
    }

    let costs = records(sizer, buf).map(|offset| {
        let kind = if Some(offset) == exclude {
            RecordKind::Skip
        } else {
            entry_kind(buf, entry_start(buf, offset))
        };
        RecordCost {
            kind,
            size: record_size(sizer, buf, offset),
            timestamped: is_timestamped(buf, offset),
        }
    });
    let retention = retention::retain(costs, keep, deletion_budget(sizer));

    let boundary = records(sizer, buf)
        .take(retention.window)
        .last()
        .map_or(frontmost(buf), |offset| offset + record_size(sizer, buf, offset));
    (cost + retention.extra_cost, boundary)
}

/// Bytes the leaf must keep regardless of garbage collection.
#[must_use]
pub fn mandatory_cost<S: ValueSizer + ?Sized>(sizer: &S, buf: &[u8]) -> usize {
    retained(sizer, buf, MANDATORY_TIMESTAMPS, None).0
}

/// Initialize an empty leaf.
pub fn init<S: ValueSizer + ?Sized>(sizer: &S, buf: &mut [u8]) {
    let block_size = buf.len();
    sizer.leaf_magic().write_to(buf);
    set_num_pairs(buf, 0);
    set_live_size(buf, 0);
    set_frontmost(buf, block_size);
    set_cutpoint(buf, block_size);
}

/// Number of live entries and tombstones.
#[must_use]
pub fn pair_count(buf: &[u8]) -> usize {
    num_pairs(buf)
}

/// Whether the leaf holds no live entries or tombstones.
#[must_use]
pub fn is_empty(buf: &[u8]) -> bool {
    num_pairs(buf) == 0
}

/// Whether inserting `key` with `value` could fail for lack of space.
///
/// An entry replacing an existing key is costed net of the entry it replaces.
#[must_use]
pub fn is_full<S: ValueSizer + ?Sized>(sizer: &S, buf: &[u8], key: &[u8], value: &[u8]) -> bool {
    let exclude = search(buf, key).ok().map(|index| pair_offset(buf, index));
    let (cost, _) = retained(sizer, buf, MANDATORY_TIMESTAMPS - 1, exclude);
    let needed = PAIR_OFFSET_SIZE + TIMESTAMP_SIZE + key_cost(key) + sizer.size(value);
    cost + needed > free_space(sizer)
}

#[must_use]
pub fn is_underfull<S: ValueSizer + ?Sized>(sizer: &S, buf: &[u8]) -> bool {
    mandatory_cost(sizer, buf) + leaf_epsilon(sizer) < free_space(sizer) / 2
}

/// Whether `node` and `sibling` fit in one leaf with room for another entry.
#[must_use]
pub fn is_mergable<S: ValueSizer + ?Sized>(sizer: &S, node: &[u8], sibling: &[u8]) -> bool {
    mandatory_cost(sizer, node) + mandatory_cost(sizer, sibling) + leaf_epsilon(sizer) < free_space(sizer)
}

/// Value stored under `key`, if it is live.
#[must_use]
pub fn lookup<'a, S: ValueSizer + ?Sized>(sizer: &S, buf: &'a [u8], key: &[u8]) -> Option<&'a [u8]> {
    let index = search(buf, key).ok()?;
    let entry = entry_start(buf, pair_offset(buf, index));
    (entry_kind(buf, entry) == RecordKind::Live).then(|| entry_value(sizer, buf, entry))
}

fn write_skip(buf: &mut [u8], entry: usize, size: usize) {
    match size {
        1 => buf[entry] = SKIP_ENTRY_CODE_ONE,
        2 => {
            buf[entry] = SKIP_ENTRY_CODE_TWO;
            buf[entry + 1] = 0;
        }
        _ => {
            buf[entry] = SKIP_ENTRY_CODE_MANY;
            page::write_u16(buf, entry + 1, (size - 3) as u16);
            buf[entry + 3..entry + size].fill(0);
        }
    }
}

/// Turn the record at `offset` into padding, keeping any timestamp prefix.
fn clean_record<S: ValueSizer + ?Sized>(sizer: &S, buf: &mut [u8], offset: usize) {
    let entry = entry_start(buf, offset);
    let size = entry_size(sizer, buf, entry);
    if entry_kind(buf, entry) == RecordKind::Live {
        let live = live_size(buf);
        set_live_size(buf, live - (PAIR_OFFSET_SIZE + size));
    }
    write_skip(buf, entry, size);
}

fn write_entry(buf: &mut [u8], entry: usize, key: &[u8], value: Option<&[u8]>) {
    match value {
        Some(value) => {
            buf[entry] = key.len() as u8;
            buf[entry + 1..entry + 1 + key.len()].copy_from_slice(key);
            let start = entry + 1 + key.len();
            buf[start..start + value.len()].copy_from_slice(value);
        }
        None => {
            buf[entry] = DELETE_ENTRY_CODE;
            buf[entry + 1] = key.len() as u8;
            buf[entry + 2..entry + 2 + key.len()].copy_from_slice(key);
        }
    }
}

/// How a new entry is timestamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stamp {
    /// The entry (a tombstone) is not written at all.
    Drop,
    Explicit(Timestamp),
    /// The entry joins the untimestamped region.
    Implicit,
}

fn decide_stamp<S: ValueSizer + ?Sized>(
    sizer: &S,
    buf: &[u8],
    tstamp: Timestamp,
    max_existing_tstamp: Timestamp,
    tombstone: bool,
) -> Stamp {
    let front = frontmost(buf);
    if front < cutpoint(buf) {
        let newest = Timestamp(page::read_u64(buf, front));
        if tombstone && tstamp < newest {
            let newer = records(sizer, buf)
                .take_while(|&offset| is_timestamped(buf, offset))
                .filter(|&offset| {
                    entry_kind(buf, entry_start(buf, offset)) != RecordKind::Skip
                        && record_timestamp(buf, offset).is_some_and(|ts| ts > tstamp)
                })
                .take(MANDATORY_TIMESTAMPS)
                .count();
            if newer >= MANDATORY_TIMESTAMPS {
                return Stamp::Drop;
            }
        }
        Stamp::Explicit(tstamp.max(newest))
    } else if tstamp > max_existing_tstamp {
        Stamp::Explicit(tstamp)
    } else if tombstone {
        Stamp::Drop
    } else {
        Stamp::Implicit
    }
}

/// Clear any prior entry for `key` and reserve room for a new entry of
/// `size` bytes at the front of the record area.
///
/// Returns where the entry proper must be written, or `None` when a
/// tombstone is dropped instead of written.
fn prepare_space<S: ValueSizer + ?Sized>(
    sizer: &S,
    buf: &mut [u8],
    key: &[u8],
    size: usize,
    tstamp: Timestamp,
    max_existing_tstamp: Timestamp,
    tombstone: bool,
) -> Option<usize> {
    let mut index = match search(buf, key) {
        Ok(index) => {
            clean_record(sizer, buf, pair_offset(buf, index));
            remove_pair_offset(buf, index);
            index
        }
        Err(index) => index,
    };

    let needed = |stamp: Stamp| {
        PAIR_OFFSET_SIZE + size + if matches!(stamp, Stamp::Explicit(_)) { TIMESTAMP_SIZE } else { 0 }
    };

    let mut stamp = decide_stamp(sizer, buf, tstamp, max_existing_tstamp, tombstone);
    if stamp == Stamp::Drop {
        return None;
    }
    if needed(stamp) > available(buf) {
        garbage_collect(sizer, buf, MANDATORY_TIMESTAMPS - 1, &mut index);
        stamp = decide_stamp(sizer, buf, tstamp, max_existing_tstamp, tombstone);
        if stamp == Stamp::Drop {
            return None;
        }
        if needed(stamp) > available(buf) {
            assert!(tombstone, "no room for a live leaf entry; callers must check is_full");
            return None;
        }
    }

    let front = frontmost(buf) - (needed(stamp) - PAIR_OFFSET_SIZE);
    insert_pair_offset(buf, index, front);
    set_frontmost(buf, front);
    match stamp {
        Stamp::Explicit(ts) => {
            page::write_u64(buf, front, ts.0);
            Some(front + TIMESTAMP_SIZE)
        }
        Stamp::Implicit => {
            set_cutpoint(buf, front);
            Some(front)
        }
        Stamp::Drop => None,
    }
}

/// Insert or replace `key`.
///
/// Returns `false` without modifying the leaf if it is full.
///
/// # Pre-conditions
///
/// - `key.len() <= MAX_KEY_SIZE`
/// - `value` is exactly one encoded value
pub fn insert<S: ValueSizer + ?Sized>(
    sizer: &S,
    buf: &mut [u8],
    key: &[u8],
    value: &[u8],
    tstamp: Timestamp,
    max_existing_tstamp: Timestamp,
) -> bool {
    debug_assert!(key.len() <= MAX_KEY_SIZE);
    debug_assert_eq!(sizer.size(value), value.len());
    if is_full(sizer, buf, key, value) {
        return false;
    }

    let size = key_cost(key) + value.len();
    if let Some(entry) = prepare_space(sizer, buf, key, size, tstamp, max_existing_tstamp, false) {
        write_entry(buf, entry, key, Some(value));
        let live = live_size(buf);
        set_live_size(buf, live + PAIR_OFFSET_SIZE + size);
    }
    debug_validate(sizer, buf);
    true
}

/// Delete `key`, leaving a tombstone when it falls inside the retained window.
///
/// Always succeeds; a tombstone too old to retain is dropped and the key
/// simply disappears.
pub fn remove<S: ValueSizer + ?Sized>(
    sizer: &S,
    buf: &mut [u8],
    key: &[u8],
    tstamp: Timestamp,
    max_existing_tstamp: Timestamp,
) {
    debug_assert!(key.len() <= MAX_KEY_SIZE);
    let size = 2 + key.len();
    if let Some(entry) = prepare_space(sizer, buf, key, size, tstamp, max_existing_tstamp, true) {
        write_entry(buf, entry, key, None);
    }
    debug_validate(sizer, buf);
}

/// Remove every trace of `key`, including any tombstone.
///
/// Returns whether an entry was removed.
pub fn erase_presence<S: ValueSizer + ?Sized>(sizer: &S, buf: &mut [u8], key: &[u8]) -> bool {
    let Ok(index) = search(buf, key) else {
        return false;
    };
    clean_record(sizer, buf, pair_offset(buf, index));
    remove_pair_offset(buf, index);
    debug_validate(sizer, buf);
    true
}

/// An entry copied out of a leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
struct OwnedEntry {
    key: Vec<u8>,
    /// `None` for a tombstone.
    value: Option<Vec<u8>>,
    tstamp: Option<Timestamp>,
}

impl OwnedEntry {
    fn entry_size(&self) -> usize {
        match &self.value {
            Some(value) => 1 + self.key.len() + value.len(),
            None => 2 + self.key.len(),
        }
    }

    fn record_size(&self) -> usize {
        self.entry_size() + if self.tstamp.is_some() { TIMESTAMP_SIZE } else { 0 }
    }

    fn cost(&self) -> usize {
        PAIR_OFFSET_SIZE + self.record_size()
    }

    fn record_cost(&self) -> RecordCost {
        RecordCost {
            kind: if self.value.is_some() {
                RecordKind::Live
            } else {
                RecordKind::Tombstone
            },
            size: self.record_size(),
            timestamped: self.tstamp.is_some(),
        }
    }
}

/// Copy out every live entry and tombstone, newest first.
fn collect_entries<S: ValueSizer + ?Sized>(sizer: &S, buf: &[u8]) -> Vec<OwnedEntry> {
    records(sizer, buf)
        .filter_map(|offset| {
            let entry = entry_start(buf, offset);
            let kind = entry_kind(buf, entry);
            (kind != RecordKind::Skip).then(|| OwnedEntry {
                key: entry_key(buf, entry).to_vec(),
                value: (kind == RecordKind::Live).then(|| entry_value(sizer, buf, entry).to_vec()),
                tstamp: record_timestamp(buf, offset),
            })
        })
        .collect()
}

/// Keep timestamps only inside the retained window; drop tombstones outside it.
fn windowed<S: ValueSizer + ?Sized>(sizer: &S, entries: Vec<OwnedEntry>) -> Vec<OwnedEntry> {
    let window = retention::retain(
        entries.iter().map(OwnedEntry::record_cost),
        MANDATORY_TIMESTAMPS,
        deletion_budget(sizer),
    )
    .window;

    entries
        .into_iter()
        .enumerate()
        .filter_map(|(i, mut entry)| {
            if i < window {
                Some(entry)
            } else if entry.value.is_none() {
                None
            } else {
                entry.tstamp = None;
                Some(entry)
            }
        })
        .collect()
}

/// Recency bound of a set of entries' untimestamped members.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UntimestampedBound {
    /// Every entry carries a timestamp.
    Empty,
    /// Untimestamped entries are no newer than this.
    Known(Timestamp),
    /// Untimestamped entries exist and nothing bounds them.
    Unknown,
}

fn untimestamped_bound(entries: &[OwnedEntry]) -> UntimestampedBound {
    if entries.iter().all(|e| e.tstamp.is_some()) {
        return UntimestampedBound::Empty;
    }
    entries
        .iter()
        .filter_map(|e| e.tstamp)
        .min()
        .map_or(UntimestampedBound::Unknown, |oldest| UntimestampedBound::Known(oldest.next_older()))
}

/// Merge two entry sets into one newest-first list for a single leaf.
///
/// A timestamp survives only if it is newer than every untimestamped entry of
/// either set.
fn combine<S: ValueSizer + ?Sized>(sizer: &S, first: Vec<OwnedEntry>, second: Vec<OwnedEntry>) -> Vec<OwnedEntry> {
    let mut floor: Option<Timestamp> = None;
    let mut unbounded = false;
    for bound in [untimestamped_bound(&first), untimestamped_bound(&second)] {
        match bound {
            UntimestampedBound::Empty => {}
            UntimestampedBound::Known(ts) => floor = Some(floor.map_or(ts, |f| f.max(ts))),
            UntimestampedBound::Unknown => unbounded = true,
        }
    }

    let mut stamped = Vec::new();
    let mut plain = Vec::new();
    for entry in first.into_iter().chain(second) {
        match entry.tstamp {
            Some(ts) if !unbounded && floor.is_none_or(|f| ts > f) => stamped.push(entry),
            Some(_) if entry.value.is_none() => {}
            _ => plain.push(OwnedEntry { tstamp: None, ..entry }),
        }
    }

    stamped.sort_by(|a, b| b.tstamp.cmp(&a.tstamp));
    stamped.extend(plain);
    windowed(sizer, stamped)
}

/// Rewrite the leaf to hold exactly `entries`, given newest first.
///
/// # Panics
///
/// Panics if the entries do not fit, or if an untimestamped entry precedes a
/// timestamped one.
fn rebuild<S: ValueSizer + ?Sized>(sizer: &S, buf: &mut [u8], entries: &[OwnedEntry]) {
    let total: usize = entries.iter().map(OwnedEntry::cost).sum();
    assert!(total <= free_space(sizer), "rebuilt leaf entries exceed the block");

    init(sizer, buf);
    let mut front = buf.len();
    let mut live = 0;
    let mut placed: Vec<(&[u8], usize)> = Vec::with_capacity(entries.len());

    for entry in entries.iter().rev() {
        front -= entry.record_size();
        let start = match entry.tstamp {
            Some(ts) => {
                page::write_u64(buf, front, ts.0);
                front + TIMESTAMP_SIZE
            }
            None => {
                debug_assert_eq!(cutpoint(buf), front + entry.record_size(), "untimestamped entry after a timestamped one");
                set_cutpoint(buf, front);
                front
            }
        };
        write_entry(buf, start, &entry.key, entry.value.as_deref());
        if entry.value.is_some() {
            live += PAIR_OFFSET_SIZE + entry.entry_size();
        }
        placed.push((entry.key.as_slice(), front));
    }

    placed.sort_by(|a, b| a.0.cmp(b.0));
    for (index, &(_, offset)) in placed.iter().enumerate() {
        set_pair_offset(buf, index, offset);
    }
    set_num_pairs(buf, placed.len());
    set_live_size(buf, live);
    set_frontmost(buf, front);
}

/// Reclaim padding and drop timestamps and tombstones outside the newest
/// `keep` entries.
///
/// `preserved_index` is an offset table position held by the caller; it is
/// adjusted for any tombstones dropped before it.
pub fn garbage_collect<S: ValueSizer + ?Sized>(sizer: &S, buf: &mut [u8], keep: usize, preserved_index: &mut usize) {
    let (_, boundary) = retained(sizer, buf, keep, None);

    let mut by_offset: Vec<(usize, usize)> = (0..num_pairs(buf)).map(|i| (pair_offset(buf, i), i)).collect();
    by_offset.sort_unstable();

    let mut entries = Vec::with_capacity(by_offset.len());
    let mut dropped_before = 0;
    let mut dropped = 0;
    for offset in records(sizer, buf) {
        let entry = entry_start(buf, offset);
        let kind = entry_kind(buf, entry);
        if kind == RecordKind::Skip {
            continue;
        }
        let in_window = offset < boundary;
        if kind == RecordKind::Tombstone && !in_window {
            dropped += 1;
            let index = by_offset
                .binary_search_by_key(&offset, |&(o, _)| o)
                .map(|pos| by_offset[pos].1);
            if index.is_ok_and(|index| index < *preserved_index) {
                dropped_before += 1;
            }
            continue;
        }
        entries.push(OwnedEntry {
            key: entry_key(buf, entry).to_vec(),
            value: (kind == RecordKind::Live).then(|| entry_value(sizer, buf, entry).to_vec()),
            tstamp: if in_window { record_timestamp(buf, offset) } else { None },
        });
    }

    *preserved_index -= dropped_before;
    let reclaimed_from = frontmost(buf);
    rebuild(sizer, buf, &entries);
    tracing::trace!(
        entries = entries.len(),
        dropped_tombstones = dropped,
        reclaimed = frontmost(buf) - reclaimed_from,
        "leaf garbage collected"
    );
}

/// Move the upper half (by retained cost) of `node` into the empty `rnode`.
///
/// Returns the median key: `node` keeps keys `<=` it, `rnode` the rest.
///
/// # Panics
///
/// Panics if `node` holds fewer than two entries.
pub fn split<S: ValueSizer + ?Sized>(sizer: &S, node: &mut [u8], rnode: &mut [u8]) -> Vec<u8> {
    let entries = windowed(sizer, collect_entries(sizer, node));
    assert!(entries.len() >= 2, "splitting a leaf with fewer than two entries");

    let mut order: Vec<usize> = (0..entries.len()).collect();
    order.sort_by(|&a, &b| entries[a].key.cmp(&entries[b].key));

    let total: usize = entries.iter().map(OwnedEntry::cost).sum();
    let mut left_cost = 0;
    let mut split_at = 0;
    for &index in &order {
        left_cost += entries[index].cost();
        split_at += 1;
        if left_cost * 2 >= total {
            break;
        }
    }
    let split_at = split_at.clamp(1, entries.len() - 1);
    let median = entries[order[split_at - 1]].key.clone();

    let (left, right): (Vec<_>, Vec<_>) = entries.into_iter().partition(|e| e.key <= median);
    rebuild(sizer, node, &left);
    rebuild(sizer, rnode, &right);
    debug_validate(sizer, node);
    debug_validate(sizer, rnode);

    tracing::debug!(left = left.len(), right = right.len(), "split leaf");
    median
}

/// Move every entry of `left` into `right`.
///
/// # Pre-conditions
///
/// - Every key of `left` sorts before every key of `right`
/// - `is_mergable(left, right)`
pub fn merge<S: ValueSizer + ?Sized>(sizer: &S, left: &mut [u8], right: &mut [u8]) {
    let combined = combine(sizer, collect_entries(sizer, left), collect_entries(sizer, right));
    rebuild(sizer, right, &combined);
    init(sizer, left);
    debug_validate(sizer, right);
    tracing::debug!(entries = combined.len(), "merged leaves");
}

/// Move entries from `sibling` into `node` until their retained costs are
/// balanced within one entry.
///
/// Returns the new separator key (the largest key of whichever node is now
/// on the left), or `None` if no entry was worth moving.
pub fn level<S: ValueSizer + ?Sized>(
    sizer: &S,
    node: &mut [u8],
    sibling: &mut [u8],
    sibling_is_left: bool,
) -> Option<Vec<u8>> {
    let node_entries = windowed(sizer, collect_entries(sizer, node));
    let sibling_entries = windowed(sizer, collect_entries(sizer, sibling));

    let mut node_cost: usize = node_entries.iter().map(OwnedEntry::cost).sum();
    let mut sibling_cost: usize = sibling_entries.iter().map(OwnedEntry::cost).sum();

    let mut order: Vec<usize> = (0..sibling_entries.len()).collect();
    order.sort_by(|&a, &b| sibling_entries[a].key.cmp(&sibling_entries[b].key));

    let mut moving = vec![false; sibling_entries.len()];
    let mut separator = None;
    let (mut lo, mut hi) = (0, order.len());
    while hi - lo > 1 {
        let index = if sibling_is_left { order[hi - 1] } else { order[lo] };
        let cost = sibling_entries[index].cost();
        if node_cost + cost > sibling_cost - cost {
            break;
        }
        node_cost += cost;
        sibling_cost -= cost;
        moving[index] = true;
        if sibling_is_left {
            hi -= 1;
        } else {
            separator = Some(sibling_entries[index].key.clone());
            lo += 1;
        }
    }
    if !moving.contains(&true) {
        return None;
    }
    if sibling_is_left {
        separator = Some(sibling_entries[order[hi - 1]].key.clone());
    }
    // The empty key sorts first and cannot separate two non-empty ranges.
    if separator.as_deref().is_some_and(<[u8]>::is_empty) {
        return None;
    }

    let (moved, remaining): (Vec<_>, Vec<_>) = sibling_entries
        .into_iter()
        .zip(moving)
        .partition(|&(_, is_moving)| is_moving);
    let moved: Vec<OwnedEntry> = moved.into_iter().map(|(e, _)| e).collect();
    let remaining: Vec<OwnedEntry> = remaining.into_iter().map(|(e, _)| e).collect();

    let moved_count = moved.len();
    let node_final = combine(sizer, node_entries, moved);
    rebuild(sizer, node, &node_final);
    rebuild(sizer, sibling, &remaining);
    debug_validate(sizer, node);
    debug_validate(sizer, sibling);

    tracing::debug!(moved = moved_count, sibling_is_left, "leveled leaves");
    separator
}

/// Forward and reverse iterator over live entries in key order.
pub struct LeafIter<'a, S: ?Sized> {
    sizer: &'a S,
    buf: &'a [u8],
    front: usize,
    back: usize,
}

impl<'a, S: ValueSizer + ?Sized> LeafIter<'a, S> {
    fn live_pair(&self, index: usize) -> Option<(&'a [u8], &'a [u8])> {
        let entry = entry_start(self.buf, pair_offset(self.buf, index));
        (entry_kind(self.buf, entry) == RecordKind::Live)
            .then(|| (entry_key(self.buf, entry), entry_value(self.sizer, self.buf, entry)))
    }
}

impl<'a, S: ValueSizer + ?Sized> Iterator for LeafIter<'a, S> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        while self.front < self.back {
            let index = self.front;
            self.front += 1;
            if let Some(pair) = self.live_pair(index) {
                return Some(pair);
            }
        }
        None
    }
}

impl<S: ValueSizer + ?Sized> DoubleEndedIterator for LeafIter<'_, S> {
    fn next_back(&mut self) -> Option<Self::Item> {
        while self.front < self.back {
            self.back -= 1;
            if let Some(pair) = self.live_pair(self.back) {
                return Some(pair);
            }
        }
        None
    }
}

/// Iterate live entries in key order.
#[must_use]
pub fn iter<'a, S: ValueSizer + ?Sized>(sizer: &'a S, buf: &'a [u8]) -> LeafIter<'a, S> {
    LeafIter {
        sizer,
        buf,
        front: 0,
        back: num_pairs(buf),
    }
}

/// Iterate live entries with keys `>= key`.
#[must_use]
pub fn iter_from<'a, S: ValueSizer + ?Sized>(sizer: &'a S, buf: &'a [u8], key: &[u8]) -> LeafIter<'a, S> {
    LeafIter {
        sizer,
        buf,
        front: search(buf, key).unwrap_or_else(|index| index),
        back: num_pairs(buf),
    }
}

/// Visitor for `dump_entries_since`.
pub trait EntryReceiver {
    fn key_value(&mut self, key: &[u8], value: &[u8], tstamp: Timestamp);
    fn deletion(&mut self, key: &[u8], tstamp: Timestamp);
    /// Deletions at or after the requested minimum may no longer be visible.
    fn lost_deletions(&mut self);
}

/// Report entries modified at or after `minimum_tstamp`, newest first.
///
/// Untimestamped entries are reported after a `lost_deletions` signal, with
/// an implicit timestamp one tick older than the oldest retained timestamp
/// (or `maximum_possible_tstamp` when none is retained), and only if that
/// implicit timestamp is not below the minimum.
pub fn dump_entries_since<S, R>(
    sizer: &S,
    buf: &[u8],
    minimum_tstamp: Timestamp,
    maximum_possible_tstamp: Timestamp,
    receiver: &mut R,
) where
    S: ValueSizer + ?Sized,
    R: EntryReceiver + ?Sized,
{
    let cut = cutpoint(buf);
    let mut offset = frontmost(buf);
    let mut oldest = None;

    while offset < cut {
        let tstamp = Timestamp(page::read_u64(buf, offset));
        if tstamp < minimum_tstamp {
            return;
        }
        oldest = Some(tstamp);
        let entry = offset + TIMESTAMP_SIZE;
        match entry_kind(buf, entry) {
            RecordKind::Live => receiver.key_value(entry_key(buf, entry), entry_value(sizer, buf, entry), tstamp),
            RecordKind::Tombstone => receiver.deletion(entry_key(buf, entry), tstamp),
            RecordKind::Skip => {}
        }
        offset += record_size(sizer, buf, offset);
    }

    let implicit = oldest.map_or(maximum_possible_tstamp, Timestamp::next_older);
    if implicit < minimum_tstamp {
        return;
    }
    receiver.lost_deletions();
    while offset < buf.len() {
        if entry_kind(buf, offset) == RecordKind::Live {
            receiver.key_value(entry_key(buf, offset), entry_value(sizer, buf, offset), implicit);
        }
        offset += record_size(sizer, buf, offset);
    }
}

/// Check every structural invariant of a leaf.
///
/// Never panics, even on arbitrary bytes.
pub fn validate<S: ValueSizer + ?Sized>(sizer: &S, buf: &[u8]) -> Result<(), CorruptionError> {
    let corrupt = |message| Err(CorruptionError::leaf(message));
    let block_size = sizer.block_size();
    if buf.len() != block_size || block_size < HEADER_SIZE {
        return corrupt("block length does not match the block size");
    }
    if !sizer.leaf_magic().matches(buf) {
        return corrupt("bad magic");
    }

    let n = num_pairs(buf);
    let front = frontmost(buf);
    let cut = cutpoint(buf);
    if HEADER_SIZE + PAIR_OFFSET_SIZE * n > front || front > cut || cut > block_size {
        return corrupt("header offsets out of order");
    }

    let mut starts = Vec::with_capacity(n);
    let mut live_sum = 0;
    let mut previous_tstamp: Option<Timestamp> = None;
    let mut offset = front;
    while offset < block_size {
        let entry = if offset < cut {
            if offset + TIMESTAMP_SIZE > cut {
                return corrupt("timestamp crosses the cutpoint");
            }
            let tstamp = Timestamp(page::read_u64(buf, offset));
            if previous_tstamp.is_some_and(|previous| tstamp > previous) {
                return corrupt("timestamps out of order");
            }
            previous_tstamp = Some(tstamp);
            offset + TIMESTAMP_SIZE
        } else {
            offset
        };
        if entry >= block_size {
            return corrupt("record runs past the block end");
        }

        let size = match buf[entry] {
            DELETE_ENTRY_CODE => {
                if offset >= cut {
                    return corrupt("tombstone without a timestamp");
                }
                let Some(&key_size) = buf.get(entry + 1) else {
                    return corrupt("record runs past the block end");
                };
                if usize::from(key_size) > MAX_KEY_SIZE {
                    return corrupt("key too long");
                }
                starts.push(offset);
                2 + usize::from(key_size)
            }
            SKIP_ENTRY_CODE_ONE => 1,
            SKIP_ENTRY_CODE_TWO => 2,
            SKIP_ENTRY_CODE_MANY => {
                if entry + 3 > block_size {
                    return corrupt("record runs past the block end");
                }
                3 + usize::from(page::read_u16(buf, entry + 1))
            }
            key_size if usize::from(key_size) <= MAX_KEY_SIZE => {
                let value = entry + 1 + usize::from(key_size);
                if value >= block_size || !sizer.fits(&buf[value..], block_size - value) {
                    return corrupt("value does not fit in the block");
                }
                let size = 1 + usize::from(key_size) + sizer.size(&buf[value..]);
                starts.push(offset);
                live_sum += PAIR_OFFSET_SIZE + size;
                size
            }
            _ => return corrupt("unknown entry code"),
        };

        let end = entry + size;
        if end > block_size {
            return corrupt("record runs past the block end");
        }
        if offset < cut && end > cut {
            return corrupt("record crosses the cutpoint");
        }
        offset = end;
    }

    if live_sum != live_size(buf) {
        return corrupt("live size does not match live entries");
    }
    if starts.len() != n {
        return corrupt("offset table does not match entries");
    }

    let mut previous_key: Option<&[u8]> = None;
    for index in 0..n {
        let offset = pair_offset(buf, index);
        if starts.binary_search(&offset).is_err() {
            return corrupt("offset does not point at an entry");
        }
        let key = entry_key(buf, entry_start(buf, offset));
        if previous_key.is_some_and(|previous| previous >= key) {
            return corrupt("keys out of order");
        }
        previous_key = Some(key);
    }

    Ok(())
}

/// `validate`, panicking on failure in debug builds.
pub fn debug_validate<S: ValueSizer + ?Sized>(sizer: &S, buf: &[u8]) {
    if cfg!(debug_assertions) {
        if let Err(e) = validate(sizer, buf) {
            panic!("{e}");
        }
    }
}
