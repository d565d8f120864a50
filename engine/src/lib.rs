// Storage engine for a document database.
//
// Layers, bottom up:
//  - Buffer cache: fixed-size blocks acquired for read or write inside a
//    transaction
//  - Blob store: values too large for a leaf, chunked into a tree of blocks
//    and addressed by a short in-leaf reference
//  - Leaf and internal nodes: byte-level page formats with timestamped
//    entries and tombstones
//  - B-tree: top-down traversal composing the above
//
// Configuration is read once at startup (`config::init`) and is immutable
// afterwards.

pub mod config;
pub mod storage;
pub mod types;

#[cfg(test)]
mod testing;
