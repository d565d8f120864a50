//! Internal node format and algorithms.
//!
//! An internal node routes keys to child blocks. Pair `i` holds a separator
//! key and a child id; the child covers keys greater than the previous
//! separator and less than or equal to its own. The last pair has an empty
//! ("special") key and catches every key greater than the last separator.
//!
//! # Layout
//!
//! ```text
//! +-------+--------+-----------+-----------------+------------+-----------------+
//! | magic | npairs | frontmost | offsets (u16)   | free space | pairs           |
//! | lari  | (u16)  | (u16)     | npairs * 2      |            | packed backward |
//! +-------+--------+-----------+-----------------+------------+-----------------+
//! ```
//!
//! Each pair is `{ block_id: u64, key_size: u8, key[key_size] }`.
//!
//! # Invariants
//!
//! - Offsets are sorted by key; every separator except the last is non-empty
//!   and the last is empty
//! - Pair data is compacted: it occupies exactly `frontmost..block_size`

// Offsets are bounded by the block size (<= 64KB) and fit in u16.
#![allow(clippy::cast_possible_truncation)]

use std::ops::Range;

use crate::storage::btree::CorruptionError;
use crate::storage::page::{self, BLOCK_ID_SIZE, BlockId, BlockMagic};
use crate::types::{MAX_KEY_SIZE, key_cost};

/// Magic identifying an internal node block.
pub const MAGIC: BlockMagic = BlockMagic(*b"lari");

/// Size of the internal node header in bytes.
pub const HEADER_SIZE: usize = 8;

const PAIR_OFFSET_SIZE: usize = 2;

/// Largest footprint of one pair, including its offset.
pub const INTERNAL_EPSILON: usize = PAIR_OFFSET_SIZE + BLOCK_ID_SIZE + 1 + MAX_KEY_SIZE;

mod offsets {
    pub const NPAIRS: usize = 4;
    pub const FRONTMOST: usize = 6;
}

fn npairs(buf: &[u8]) -> usize {
    usize::from(page::read_u16(buf, offsets::NPAIRS))
}

fn set_npairs(buf: &mut [u8], n: usize) {
    page::write_u16(buf, offsets::NPAIRS, n as u16);
}

fn frontmost(buf: &[u8]) -> usize {
    let front = usize::from(page::read_u16(buf, offsets::FRONTMOST));
    // A full 64KB block stores its empty frontmost as 0.
    if front == 0 { buf.len() } else { front }
}

fn set_frontmost(buf: &mut [u8], offset: usize) {
    page::write_u16(buf, offsets::FRONTMOST, offset as u16);
}

fn pair_offset(buf: &[u8], index: usize) -> usize {
    usize::from(page::read_u16(buf, HEADER_SIZE + PAIR_OFFSET_SIZE * index))
}

fn set_pair_offset(buf: &mut [u8], index: usize, offset: usize) {
    page::write_u16(buf, HEADER_SIZE + PAIR_OFFSET_SIZE * index, offset as u16);
}

fn pair_child(buf: &[u8], offset: usize) -> BlockId {
    page::read_block_id(buf, offset)
}

fn pair_key(buf: &[u8], offset: usize) -> &[u8] {
    let size = usize::from(buf[offset + BLOCK_ID_SIZE]);
    let start = offset + BLOCK_ID_SIZE + 1;
    &buf[start..start + size]
}

const fn pair_size(key: &[u8]) -> usize {
    BLOCK_ID_SIZE + key_cost(key)
}

fn key_at(buf: &[u8], index: usize) -> &[u8] {
    pair_key(buf, pair_offset(buf, index))
}

/// Bytes used by the offset table and pair data.
fn used_space(buf: &[u8]) -> usize {
    PAIR_OFFSET_SIZE * npairs(buf) + (buf.len() - frontmost(buf))
}

const fn free_space(buf: &[u8]) -> usize {
    buf.len() - HEADER_SIZE
}

/// Initialize an empty internal node.
pub fn init(buf: &mut [u8]) {
    MAGIC.write_to(buf);
    set_npairs(buf, 0);
    let block_size = buf.len();
    set_frontmost(buf, block_size);
}

/// Initialize `buf` with copies of the pairs of `source` at `indexes`.
pub fn init_from(buf: &mut [u8], source: &[u8], indexes: Range<usize>) {
    let copied: Vec<(Vec<u8>, BlockId)> = indexes
        .map(|index| {
            let offset = pair_offset(source, index);
            (pair_key(source, offset).to_vec(), pair_child(source, offset))
        })
        .collect();
    rebuild(buf, &copied);
}

fn collect_pairs(buf: &[u8]) -> Vec<(Vec<u8>, BlockId)> {
    (0..npairs(buf))
        .map(|index| {
            let offset = pair_offset(buf, index);
            (pair_key(buf, offset).to_vec(), pair_child(buf, offset))
        })
        .collect()
}

/// Rewrite the node to hold exactly `pairs`, in order.
fn rebuild(buf: &mut [u8], pairs: &[(Vec<u8>, BlockId)]) {
    let needed: usize = pairs.iter().map(|(key, _)| PAIR_OFFSET_SIZE + pair_size(key)).sum();
    assert!(needed <= free_space(buf), "rebuilt internal node exceeds the block");

    init(buf);
    let mut front = buf.len();
    for (index, (key, child)) in pairs.iter().enumerate() {
        front -= pair_size(key);
        write_pair(buf, front, key, *child);
        set_pair_offset(buf, index, front);
    }
    set_npairs(buf, pairs.len());
    set_frontmost(buf, front);
}

fn write_pair(buf: &mut [u8], offset: usize, key: &[u8], child: BlockId) {
    page::write_block_id(buf, offset, child);
    buf[offset + BLOCK_ID_SIZE] = key.len() as u8;
    let start = offset + BLOCK_ID_SIZE + 1;
    buf[start..start + key.len()].copy_from_slice(key);
}

fn insert_pair(buf: &mut [u8], index: usize, key: &[u8], child: BlockId) {
    let n = npairs(buf);
    let front = frontmost(buf) - pair_size(key);
    write_pair(buf, front, key, child);

    let start = HEADER_SIZE + PAIR_OFFSET_SIZE * index;
    let end = HEADER_SIZE + PAIR_OFFSET_SIZE * n;
    buf.copy_within(start..end, start + PAIR_OFFSET_SIZE);
    set_pair_offset(buf, index, front);
    set_npairs(buf, n + 1);
    set_frontmost(buf, front);
}

/// Remove pair `index` and compact the pair data.
fn remove_pair(buf: &mut [u8], index: usize) {
    let n = npairs(buf);
    let removed = pair_offset(buf, index);
    let size = pair_size(pair_key(buf, removed));
    let front = frontmost(buf);

    buf.copy_within(front..removed, front + size);
    for i in 0..n {
        let offset = pair_offset(buf, i);
        if offset < removed {
            set_pair_offset(buf, i, offset + size);
        }
    }

    let start = HEADER_SIZE + PAIR_OFFSET_SIZE * index;
    let end = HEADER_SIZE + PAIR_OFFSET_SIZE * n;
    buf.copy_within(start + PAIR_OFFSET_SIZE..end, start);
    set_npairs(buf, n - 1);
    set_frontmost(buf, front + size);
}

/// Index of the pair routing `key`: the first separator `>= key`, or the
/// special pair.
fn route(buf: &[u8], key: &[u8]) -> usize {
    let n = npairs(buf);
    debug_assert!(n > 0, "routing through an empty internal node");
    // The special pair is excluded from the search and compares greatest.
    let (mut lo, mut hi) = (0, n - 1);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if key_at(buf, mid) < key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

/// Child block responsible for `key`.
#[must_use]
pub fn lookup(buf: &[u8], key: &[u8]) -> BlockId {
    pair_child(buf, pair_offset(buf, route(buf, key)))
}

/// Separator of pair `index`, or `None` for the special pair.
#[must_use]
pub fn separator(buf: &[u8], index: usize) -> Option<&[u8]> {
    (index + 1 < npairs(buf)).then(|| key_at(buf, index))
}

/// Separator bounding the child that routes `key` from above, or `None` if
/// the key routes to the special pair.
#[must_use]
pub fn upper_bound<'a>(buf: &'a [u8], key: &[u8]) -> Option<&'a [u8]> {
    separator(buf, route(buf, key))
}

/// Number of children.
#[must_use]
pub fn child_count(buf: &[u8]) -> usize {
    npairs(buf)
}

/// Child id of pair `index`.
#[must_use]
pub fn child_at(buf: &[u8], index: usize) -> BlockId {
    pair_child(buf, pair_offset(buf, index))
}

/// Whether another pair of maximal size might not fit.
#[must_use]
pub fn is_full(buf: &[u8]) -> bool {
    HEADER_SIZE + used_space(buf) + INTERNAL_EPSILON > buf.len()
}

#[must_use]
pub fn is_underfull(buf: &[u8]) -> bool {
    used_space(buf) + INTERNAL_EPSILON < free_space(buf) / 2
}

/// Whether merging the two nodes leaves a node that is not full.
///
/// Accounts for the separator key that replaces the left node's special key.
#[must_use]
pub fn is_mergable(node: &[u8], sibling: &[u8]) -> bool {
    used_space(node) + used_space(sibling) + 2 * INTERNAL_EPSILON < free_space(node)
}

/// Whether a child split or merge could leave this node full or underfull.
#[must_use]
pub fn change_unsafe(buf: &[u8]) -> bool {
    is_full(buf) || is_underfull(buf)
}

/// Record that the child covering `key` split into `lnode` (keys `<= key`)
/// and `rnode`.
///
/// On an empty node this creates the first separator and the special pair.
/// Returns `false` without modifying the node if it is full.
///
/// # Panics
///
/// Panics if `key` is already a separator.
pub fn insert(buf: &mut [u8], key: &[u8], lnode: BlockId, rnode: BlockId) -> bool {
    debug_assert!(!key.is_empty() && key.len() <= MAX_KEY_SIZE);
    if is_full(buf) {
        return false;
    }

    if npairs(buf) == 0 {
        insert_pair(buf, 0, key, lnode);
        insert_pair(buf, 1, &[], rnode);
    } else {
        let index = route(buf, key);
        assert!(
            index == npairs(buf) - 1 || key_at(buf, index) != key,
            "duplicate separator key in internal node"
        );
        insert_pair(buf, index, key, lnode);
        let next = pair_offset(buf, index + 1);
        page::write_block_id(buf, next, rnode);
    }
    debug_validate(buf);
    true
}

/// Remove the pair whose separator is exactly `key`.
///
/// Returns the removed child id, or `None` if `key` is not a separator.
pub fn remove(buf: &mut [u8], key: &[u8]) -> Option<BlockId> {
    let index = route(buf, key);
    if index == npairs(buf) - 1 || key_at(buf, index) != key {
        return None;
    }
    let child = child_at(buf, index);
    remove_pair(buf, index);
    debug_validate(buf);
    Some(child)
}

/// Replace separator `old_key` with `new_key`, keeping its child.
///
/// # Panics
///
/// Panics if `old_key` is not a separator or the new key does not fit.
pub fn update_key(buf: &mut [u8], old_key: &[u8], new_key: &[u8]) {
    let index = route(buf, old_key);
    assert!(
        index < npairs(buf) - 1 && key_at(buf, index) == old_key,
        "updating a missing separator"
    );
    let child = child_at(buf, index);
    remove_pair(buf, index);
    assert!(
        HEADER_SIZE + used_space(buf) + PAIR_OFFSET_SIZE + pair_size(new_key) <= buf.len(),
        "no room for an updated separator"
    );
    insert_pair(buf, index, new_key, child);
    debug_validate(buf);
}

/// A neighbor of the child routing some key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sibling {
    pub id: BlockId,
    /// Whether the routed child is left of the sibling.
    pub node_is_left: bool,
    /// Separator between the two children in this node.
    pub separator: Vec<u8>,
}

/// Neighbor of the child routing `key`: the next child if there is one,
/// otherwise the previous one.
///
/// Returns `None` if the node has a single child.
#[must_use]
pub fn sibling(buf: &[u8], key: &[u8]) -> Option<Sibling> {
    let n = npairs(buf);
    if n < 2 {
        return None;
    }
    let index = route(buf, key);
    Some(if index + 1 < n {
        Sibling {
            id: child_at(buf, index + 1),
            node_is_left: true,
            separator: key_at(buf, index).to_vec(),
        }
    } else {
        Sibling {
            id: child_at(buf, index - 1),
            node_is_left: false,
            separator: key_at(buf, index - 1).to_vec(),
        }
    })
}

/// Move the upper half (by bytes) of `node`'s pairs into the empty `rnode`.
///
/// Returns the median key, which the parent must insert with `node` on the
/// left and `rnode` on the right.
///
/// # Panics
///
/// Panics if `node` has fewer than two pairs.
pub fn split(node: &mut [u8], rnode: &mut [u8]) -> Vec<u8> {
    let n = npairs(node);
    assert!(n >= 2, "splitting an internal node with fewer than two pairs");

    let total = used_space(node);
    let mut left_size = 0;
    let mut split_at = 0;
    while split_at < n - 1 {
        left_size += PAIR_OFFSET_SIZE + pair_size(key_at(node, split_at));
        split_at += 1;
        if left_size * 2 >= total {
            break;
        }
    }

    init_from(rnode, node, split_at..n);
    let mut left = collect_pairs(node);
    left.truncate(split_at);
    let median = left.last_mut().map(|(key, _)| std::mem::take(key)).unwrap_or_default();
    rebuild(node, &left);

    debug_validate(node);
    debug_validate(rnode);
    tracing::debug!(left = split_at, right = n - split_at, "split internal node");
    median
}

/// Append `left`'s pairs, with its special key replaced by `separator`, to the
/// front of `right`.
///
/// # Pre-conditions
///
/// - `separator` is the parent's key between `left` and `right`
/// - `is_mergable(left, right)`
pub fn merge(left: &mut [u8], right: &mut [u8], separator: &[u8]) {
    let mut pairs = collect_pairs(left);
    if let Some((key, _)) = pairs.last_mut() {
        *key = separator.to_vec();
    }
    pairs.extend(collect_pairs(right));
    rebuild(right, &pairs);
    init(left);
    debug_validate(right);
    tracing::debug!(pairs = pairs.len(), "merged internal nodes");
}

/// Outcome of leveling two internal nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leveled {
    /// New separator between the two nodes.
    pub separator: Vec<u8>,
    /// Children that changed parents.
    pub moved: Vec<BlockId>,
}

/// Move pairs from `sibling` into `node` until their sizes are balanced
/// within one pair.
///
/// `separator` is the parent's current key between the two. Returns `None`
/// when no pair is worth moving.
pub fn level(node: &mut [u8], sibling: &mut [u8], separator: &[u8], sibling_is_left: bool) -> Option<Leveled> {
    let (left_buf, right_buf): (&[u8], &[u8]) = if sibling_is_left { (&*sibling, &*node) } else { (&*node, &*sibling) };
    let mut left = collect_pairs(left_buf);
    if let Some((key, _)) = left.last_mut() {
        *key = separator.to_vec();
    }
    let right = collect_pairs(right_buf);

    let cost = |key: &Vec<u8>| PAIR_OFFSET_SIZE + pair_size(key);
    let mut node_size = used_space(node);
    let mut sibling_size = used_space(sibling);
    let sibling_len = if sibling_is_left { left.len() } else { right.len() };

    // Boundary: number of combined pairs that end up on the left.
    let mut boundary = left.len();
    let mut moved = Vec::new();
    let combined: Vec<(Vec<u8>, BlockId)> = left.into_iter().chain(right).collect();
    while moved.len() + 1 < sibling_len {
        let index = if sibling_is_left { boundary - 1 } else { boundary };
        let size = cost(&combined[index].0);
        if node_size + size > sibling_size - size.min(sibling_size) {
            break;
        }
        node_size += size;
        sibling_size -= size;
        moved.push(combined[index].1);
        if sibling_is_left {
            boundary -= 1;
        } else {
            boundary += 1;
        }
    }
    if moved.is_empty() {
        return None;
    }

    let mut new_left = combined;
    let new_right = new_left.split_off(boundary);
    let new_separator = new_left.last_mut().map(|(key, _)| std::mem::take(key)).unwrap_or_default();

    let (left_buf, right_buf) = if sibling_is_left { (sibling, node) } else { (node, sibling) };
    rebuild(left_buf, &new_left);
    rebuild(right_buf, &new_right);
    debug_validate(left_buf);
    debug_validate(right_buf);

    tracing::debug!(moved = moved.len(), sibling_is_left, "leveled internal nodes");
    Some(Leveled {
        separator: new_separator,
        moved,
    })
}

/// Check every structural invariant of an internal node.
///
/// Never panics, even on arbitrary bytes.
pub fn validate(buf: &[u8]) -> Result<(), CorruptionError> {
    let corrupt = |message| Err(CorruptionError::internal(message));
    if buf.len() < HEADER_SIZE || !MAGIC.matches(buf) {
        return corrupt("bad magic");
    }
    let n = npairs(buf);
    let front = frontmost(buf);
    if HEADER_SIZE + PAIR_OFFSET_SIZE * n > front || front > buf.len() {
        return corrupt("header offsets out of order");
    }

    let mut data = 0;
    let mut previous: Option<&[u8]> = None;
    for index in 0..n {
        let offset = pair_offset(buf, index);
        if offset < front || offset + BLOCK_ID_SIZE + 1 > buf.len() {
            return corrupt("pair offset out of bounds");
        }
        let size = usize::from(buf[offset + BLOCK_ID_SIZE]);
        if size > MAX_KEY_SIZE || offset + BLOCK_ID_SIZE + 1 + size > buf.len() {
            return corrupt("pair runs past the block end");
        }
        let key = pair_key(buf, offset);
        let last = index + 1 == n;
        if last != key.is_empty() {
            return corrupt("special key misplaced");
        }
        if !last && previous.is_some_and(|p| p >= key) {
            return corrupt("keys out of order");
        }
        previous = Some(key);
        data += pair_size(key);
    }

    if data != buf.len() - front {
        return corrupt("pair data is not compacted");
    }
    Ok(())
}

/// `validate`, panicking on failure in debug builds.
pub fn debug_validate(buf: &[u8]) {
    if cfg!(debug_assertions) {
        if let Err(e) = validate(buf) {
            panic!("{e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_node(block_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; block_size];
        init(&mut buf);
        buf
    }

    /// Node with children 100, 101, ... separated by `keys`.
    fn node_with(block_size: usize, keys: &[&[u8]]) -> Vec<u8> {
        let mut buf = new_node(block_size);
        let mut pairs: Vec<(Vec<u8>, BlockId)> =
            keys.iter().enumerate().map(|(i, k)| (k.to_vec(), 100 + i as u64)).collect();
        pairs.push((Vec::new(), 100 + keys.len() as u64));
        rebuild(&mut buf, &pairs);
        buf
    }

    #[test]
    fn test_lookup_scenario() {
        let mut node = new_node(4096);
        assert!(insert(&mut node, b"d", 1, 2));
        assert!(insert(&mut node, b"m", 2, 3));
        validate(&node).expect("valid");

        assert_eq!(child_count(&node), 3);
        assert_eq!(lookup(&node, b"a"), 1);
        assert_eq!(lookup(&node, b"d"), 1);
        assert_eq!(lookup(&node, b"e"), 2);
        assert_eq!(lookup(&node, b"m"), 2);
        assert_eq!(lookup(&node, b"z"), 3);
    }

    #[test]
    fn test_upper_bound() {
        let node = node_with(4096, &[b"d", b"m"]);
        assert_eq!(upper_bound(&node, b"a"), Some(b"d".as_slice()));
        assert_eq!(upper_bound(&node, b"e"), Some(b"m".as_slice()));
        assert_eq!(upper_bound(&node, b"z"), None);
        assert_eq!(separator(&node, 2), None);
    }

    #[test]
    fn test_insert_splits_slot() {
        let mut node = node_with(4096, &[b"d", b"m"]);
        // Child 101 covers (d, m]; it splits at "g" into 200 and 201.
        assert!(insert(&mut node, b"g", 200, 201));
        assert_eq!(lookup(&node, b"e"), 200);
        assert_eq!(lookup(&node, b"h"), 201);
        assert_eq!(lookup(&node, b"m"), 201);
        assert_eq!(lookup(&node, b"a"), 100);
        assert_eq!(lookup(&node, b"zz"), 102);
    }

    #[test]
    #[should_panic(expected = "duplicate separator")]
    fn test_insert_duplicate_panics() {
        let mut node = node_with(4096, &[b"d"]);
        insert(&mut node, b"d", 1, 2);
    }

    #[test]
    fn test_fill_until_full() {
        let mut node = new_node(4096);
        assert!(insert(&mut node, &[0, 0], 0, 1));
        let mut i = 1u16;
        while !is_full(&node) {
            let key = i.to_be_bytes();
            assert!(insert(&mut node, &key, u64::from(i), u64::from(i) + 1));
            i += 1;
        }
        assert!(!insert(&mut node, &[0xFF, 0xFF], 9, 10));
        assert!(HEADER_SIZE + used_space(&node) <= 4096);
        validate(&node).expect("valid");
    }

    #[test]
    fn test_remove_compacts() {
        let mut node = node_with(4096, &[b"b", b"d", b"f"]);
        assert_eq!(remove(&mut node, b"d"), Some(101));
        validate(&node).expect("valid");
        assert_eq!(child_count(&node), 3);
        assert_eq!(lookup(&node, b"c"), 102);
        assert_eq!(remove(&mut node, b"zz"), None);
        assert_eq!(remove(&mut node, b""), None);
    }

    #[test]
    fn test_update_key() {
        let mut node = node_with(4096, &[b"b", b"d", b"f"]);
        update_key(&mut node, b"d", b"ee");
        validate(&node).expect("valid");
        assert_eq!(lookup(&node, b"e"), 101);
        assert_eq!(lookup(&node, b"ef"), 102);
    }

    #[test]
    fn test_sibling() {
        let node = node_with(4096, &[b"d", b"m"]);
        assert_eq!(
            sibling(&node, b"e"),
            Some(Sibling {
                id: 102,
                node_is_left: true,
                separator: b"m".to_vec(),
            })
        );
        assert_eq!(
            sibling(&node, b"z"),
            Some(Sibling {
                id: 101,
                node_is_left: false,
                separator: b"m".to_vec(),
            })
        );

        let single = node_with(4096, &[]);
        assert_eq!(sibling(&single, b"a"), None);
    }

    fn big_node(count: u8) -> Vec<u8> {
        let keys: Vec<Vec<u8>> = (0..count).map(|i| vec![b'a' + i / 26, b'a' + i % 26, b'x', b'x']).collect();
        let refs: Vec<&[u8]> = keys.iter().map(Vec::as_slice).collect();
        node_with(1024, &refs)
    }

    #[test]
    fn test_split_then_merge() {
        let mut node = big_node(40);
        let before = collect_pairs(&node);
        let mut right = new_node(1024);

        let median = split(&mut node, &mut right);
        validate(&node).expect("left valid");
        validate(&right).expect("right valid");
        assert!(child_count(&node) >= 1 && child_count(&right) >= 1);
        assert_eq!(child_count(&node) + child_count(&right), 40 + 1);
        assert_eq!(lookup(&right, &median), child_at(&right, 0));
        assert!(used_space(&node).abs_diff(used_space(&right)) <= INTERNAL_EPSILON);

        merge(&mut node, &mut right, &median);
        validate(&right).expect("merged valid");
        assert_eq!(collect_pairs(&right), before);
    }

    #[test]
    fn test_level_from_right() {
        let mut node = node_with(1024, &[b"A"]);
        let mut sibling = big_node(30);
        let before_children = child_count(&node) + child_count(&sibling);

        let leveled = level(&mut node, &mut sibling, b"B", false).expect("moved");
        validate(&node).expect("node valid");
        validate(&sibling).expect("sibling valid");
        assert_eq!(child_count(&node) + child_count(&sibling), before_children);
        assert_eq!(leveled.moved.len(), child_count(&node) - 2);
        assert_eq!(leveled.moved[0], 100);
        assert!(used_space(&node).abs_diff(used_space(&sibling)) <= 2 * (PAIR_OFFSET_SIZE + pair_size(b"aaxx")) + 4);
        assert_eq!(lookup(&sibling, &leveled.separator), child_at(&sibling, 0));
    }

    #[test]
    fn test_level_from_left() {
        let mut sibling = big_node(30);
        let mut node = node_with(1024, &[b"zz"]);

        let leveled = level(&mut node, &mut sibling, b"z", true).expect("moved");
        validate(&node).expect("node valid");
        validate(&sibling).expect("sibling valid");
        assert_eq!(leveled.moved[0], 130);
        assert_eq!(child_at(&node, 0), *leveled.moved.last().expect("moved"));
        assert!(key_at(&sibling, child_count(&sibling) - 1).is_empty());
        assert!(leveled.separator.as_slice() < b"z".as_slice());
    }

    #[test]
    fn test_level_nothing_to_move() {
        let mut node = node_with(1024, &[b"a"]);
        let mut sibling = node_with(1024, &[b"x"]);
        assert_eq!(level(&mut node, &mut sibling, b"m", false), None);
    }

    #[test]
    fn test_capacity_predicates() {
        let small = node_with(4096, &[b"a"]);
        assert!(is_underfull(&small));
        assert!(change_unsafe(&small));
        assert!(is_mergable(&small, &small.clone()));

        let mut full = new_node(1024);
        assert!(insert(&mut full, &[0], 0, 1));
        let mut i = 1u8;
        while !is_full(&full) {
            assert!(insert(&mut full, &[i], 0, 1));
            i += 1;
        }
        assert!(!is_underfull(&full));
        assert!(change_unsafe(&full));
        assert!(!is_mergable(&full, &full.clone()));
    }

    #[test]
    fn test_validate_detects_corruption() {
        let node = node_with(4096, &[b"b", b"d"]);

        let mut bad_magic = node.clone();
        bad_magic[1] = b'?';
        assert!(validate(&bad_magic).is_err());

        let mut swapped = node.clone();
        let (a, b) = (pair_offset(&swapped, 0), pair_offset(&swapped, 1));
        set_pair_offset(&mut swapped, 0, b);
        set_pair_offset(&mut swapped, 1, a);
        assert_eq!(validate(&swapped), Err(CorruptionError::internal("keys out of order")));

        let mut bad_count = node;
        set_npairs(&mut bad_count, 2);
        assert!(validate(&bad_count).is_err());

        assert!(validate(&[0xEE; 512]).is_err());
    }
}
