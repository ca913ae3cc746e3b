//! RFC 6962 compact range: an O(log n) representation of a contiguous span
//! of leaves, sufficient to compute the range's root hash and to extend or
//! merge it without rehashing already-covered leaves.
//!
//! A compact range for `[begin, end)` decomposes into a small number of
//! "complete" subtree nodes. Appending a leaf, or merging two adjacent
//! ranges, is a carry-propagating combine over these nodes, exactly like
//! incrementing a binary counter. The final root hash, when the range
//! does not itself collapse to a single complete subtree, additionally
//! folds the remaining nodes right-to-left; those fold hashes are
//! ephemeral and are never reported to a node visitor.

use crate::entry::hash_children;
use crate::error::{Result, TesseraError};
use sha2::{Digest, Sha256};

/// Callback invoked for every node hash computed while extending or merging
/// a range that corresponds to a real, storable tree node (a "carry", in
/// the binary-counter sense). Kept as a plain function parameter rather
/// than a trait object so a no-op closure can stand in when the caller only
/// wants a root hash.
pub type NodeVisitor<'a> = &'a mut dyn FnMut(u8, u64, [u8; 32]) -> Result<()>;

fn no_op_visitor(_level: u8, _index: u64, _hash: [u8; 32]) -> Result<()> {
    Ok(())
}

/// A single node retained by a compact range: its level (0 = leaf), its
/// index at that level, and its hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Node {
    level: u8,
    index: u64,
    hash: [u8; 32],
}

/// A compact representation of the Merkle tree nodes covering `[begin, end)`.
#[derive(Clone, Debug)]
pub struct CompactRange {
    begin: u64,
    end: u64,
    /// Remaining, un-mergeable nodes, ordered left to right by position.
    nodes: Vec<Node>,
}

impl CompactRange {
    /// An empty range anchored at `begin`, ready to be grown with [`CompactRange::append`].
    pub fn new_empty(begin: u64) -> Self {
        Self {
            begin,
            end: begin,
            nodes: Vec::new(),
        }
    }

    /// Construct a range directly from its decomposition, as read back from
    /// storage. `nodes` must be ordered left to right and must exactly
    /// decompose `[begin, end)`; this is not re-validated here.
    pub(crate) fn from_nodes(begin: u64, end: u64, nodes: Vec<(u8, u64, [u8; 32])>) -> Self {
        Self {
            begin,
            end,
            nodes: nodes
                .into_iter()
                .map(|(level, index, hash)| Node { level, index, hash })
                .collect(),
        }
    }

    pub fn begin(&self) -> u64 {
        self.begin
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn size(&self) -> u64 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// The decomposition nodes needed to reconstruct this range from
    /// storage, as `(level, index)` pairs covering `[begin, end)`.
    pub(crate) fn node_ids(&self) -> Vec<(u8, u64)> {
        self.nodes.iter().map(|n| (n.level, n.index)).collect()
    }

    /// Append a single leaf hash at `end()`, extending the range by one.
    pub fn append(&mut self, leaf_hash: [u8; 32], visit: NodeVisitor) -> Result<()> {
        let index = self.end;
        self.push(Node {
            level: 0,
            index,
            hash: leaf_hash,
        }, visit)?;
        self.end += 1;
        Ok(())
    }

    /// Merge `other`, which must begin exactly where this range ends, into
    /// this range.
    pub fn merge(&mut self, other: CompactRange, visit: NodeVisitor) -> Result<()> {
        if self.end != other.begin {
            return Err(TesseraError::inconsistent(format!(
                "cannot merge range [{}, {}) into range ending at {}",
                other.begin, other.end, self.end
            )));
        }
        for node in other.nodes {
            self.push(node, visit)?;
        }
        self.end = other.end;
        Ok(())
    }

    /// Push a single node onto the right edge of the range, repeatedly
    /// combining it with the current rightmost node whenever they are
    /// siblings (same level, and the existing node is the even-indexed
    /// left child).
    fn push(&mut self, mut node: Node, visit: NodeVisitor) -> Result<()> {
        loop {
            match self.nodes.last() {
                Some(top) if top.level == node.level && top.index % 2 == 0 && top.index + 1 == node.index => {
                    let left = self.nodes.pop().unwrap();
                    let combined_hash = hash_children(&left.hash, &node.hash);
                    let combined = Node {
                        level: node.level + 1,
                        index: left.index / 2,
                        hash: combined_hash,
                    };
                    visit(combined.level, combined.index, combined.hash)?;
                    node = combined;
                }
                _ => {
                    self.nodes.push(node);
                    return Ok(());
                }
            }
        }
    }

    /// The root hash of this range. For an empty range this is only
    /// defined when `begin == 0` (the empty-tree hash per RFC 6962);
    /// otherwise the range has no meaningful root on its own and must
    /// first be merged with a preceding range.
    pub fn root_hash(&self) -> Result<[u8; 32]> {
        if self.nodes.is_empty() {
            if self.begin == 0 {
                return Ok(Sha256::digest([]).into());
            }
            return Err(TesseraError::inconsistent(
                "empty non-prefix range has no root hash".to_string(),
            ));
        }

        // Fold the remaining nodes right-to-left; per RFC 6962, MTH(D[0:n])
        // recursively combines the largest left-aligned complete subtree
        // with the hash of the (possibly incomplete) remainder. These
        // fold combinations are not persisted: they do not correspond to
        // complete, aligned subtrees in the general case.
        let mut iter = self.nodes.iter().rev();
        let mut acc = iter.next().unwrap().hash;
        for node in iter {
            acc = hash_children(&node.hash, &acc);
        }
        Ok(acc)
    }
}

/// Fetches the hash of a specific `(level, index)` node, typically backed
/// by the tile read cache.
pub type HashReader<'a> = &'a dyn Fn(&[(u8, u64)]) -> Result<Vec<[u8; 32]>>;

/// Builds compact ranges for arbitrary prefixes by reading their
/// decomposition nodes from storage, rather than replaying every leaf.
pub struct RangeFactory<'a> {
    pub hash_reader: HashReader<'a>,
}

impl<'a> RangeFactory<'a> {
    pub fn new(hash_reader: HashReader<'a>) -> Self {
        Self { hash_reader }
    }

    /// Build the compact range for the prefix `[0, size)`.
    pub fn prefix_range(&self, size: u64) -> Result<CompactRange> {
        let ids = decompose_prefix(size);
        let hashes = (self.hash_reader)(&ids)?;
        if hashes.len() != ids.len() {
            return Err(TesseraError::inconsistent(
                "hash reader returned the wrong number of hashes".to_string(),
            ));
        }
        let nodes = ids
            .into_iter()
            .zip(hashes)
            .map(|((level, index), hash)| (level, index, hash))
            .collect();
        Ok(CompactRange::from_nodes(0, size, nodes))
    }
}

/// Decompose the prefix `[0, size)` into its complete-subtree node ids,
/// ordered left to right (largest subtree first). Public so the integrator
/// can prewarm exactly the tiles a prefix range needs before building it.
pub fn prefix_node_ids(size: u64) -> Vec<(u8, u64)> {
    decompose_prefix(size)
}

/// Decompose the prefix `[0, size)` into its complete-subtree nodes,
/// ordered left to right (largest subtree first).
fn decompose_prefix(size: u64) -> Vec<(u8, u64)> {
    let mut ids = Vec::new();
    let mut remaining = size;
    let mut consumed = 0u64;
    // Highest set bit first, matching RFC 6962's recursive left/right split.
    for level in (0..64u8).rev() {
        let width = 1u64 << level;
        if remaining & width != 0 {
            ids.push((level, consumed / width));
            consumed += width;
            remaining &= !width;
        }
    }
    ids
}

/// Decompose an arbitrary contiguous leaf range `[begin, end)` into its
/// maximal complete, tree-aligned subtree nodes, ordered left to right.
/// Greedily takes, at each position, the widest node whose span both
/// starts tree-aligned at that position and does not overrun `end`; for
/// `begin == 0` this reproduces [`decompose_prefix`].
///
/// Used by consistency-proof construction, where the sibling hashes
/// needed are not always rooted at the tree's own prefix.
pub fn decompose_range(begin: u64, end: u64) -> Vec<(u8, u64)> {
    let mut ids = Vec::new();
    let mut pos = begin;
    while pos < end {
        let mut level = 0u8;
        while {
            let width = 1u64 << (level + 1);
            pos % width == 0 && pos + width <= end
        } {
            level += 1;
        }
        let width = 1u64 << level;
        ids.push((level, pos / width));
        pos += width;
    }
    ids
}
