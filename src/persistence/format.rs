//! Binary artifact format for a [`Forest`].
//!
//! One artifact holds everything a query needs; nothing is split across
//! objects, so an artifact can never be paired with the wrong identifier table.
//!
//! # Layout
//!
//! All integers and floats are little-endian.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ Magic (4B): "CNPY"                      │
//! │ Format version (u32)                    │
//! ├─────────────────────────────────────────┤
//! │ Header:                                 │
//! │   - Dimension N (u32)                   │
//! │   - Vector count M (u32)                │
//! │   - Tree count T (u32)                  │
//! │   - Leaf size L (u32)                   │
//! ├─────────────────────────────────────────┤
//! │ Vector table: M x N f32, row-major      │
//! ├─────────────────────────────────────────┤
//! │ Identifier table: M x (u32 len + UTF-8) │
//! ├─────────────────────────────────────────┤
//! │ Trees: T x pre-order node stream        │
//! │   - Tag (u8): 0 = leaf, 1 = split       │
//! │   - Leaf: count (u32) + count x u32     │
//! │   - Split: N x f32 normal + f32 offset  │
//! ├─────────────────────────────────────────┤
//! │ Footer: CRC32 of everything above (u32) │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Children are implicit: a split is followed by its whole left subtree, then
//! its right subtree. Decoding rebuilds the same arena layout the builder
//! produces and then re-validates every forest invariant.

use crate::error::{ForestError, Result};
use crate::forest::{Forest, IdentifierTable, InternalIndex, LeafItems, Node, NodeId, Tree};

/// Magic bytes for forest artifacts.
pub const FOREST_MAGIC: &[u8; 4] = b"CNPY";

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

const TAG_LEAF: u8 = 0;
const TAG_SPLIT: u8 = 1;

/// Fixed bytes before the vector table.
const HEADER_LEN: usize = 4 + 4 * 5;
const FOOTER_LEN: usize = 4;

/// Trait for types that can be persisted.
pub trait Persistable: Sized {
    /// Serialize to bytes.
    fn to_bytes(&self) -> Vec<u8>;

    /// Deserialize from bytes.
    fn from_bytes(bytes: &[u8]) -> Result<Self>;

    /// Estimated size in bytes.
    fn size_hint(&self) -> usize;
}

impl Persistable for Forest {
    fn to_bytes(&self) -> Vec<u8> {
        encode_forest(self)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        decode_forest(bytes)
    }

    fn size_hint(&self) -> usize {
        let ids: usize = self.ids.iter().map(|id| 4 + id.len()).sum();
        let nodes: usize = self
            .trees
            .iter()
            .flat_map(|t| t.nodes.iter())
            .map(|n| match n {
                Node::Leaf { items } => 1 + 4 + 4 * items.len(),
                Node::Split { .. } => 1 + 4 * (self.dimension + 1),
            })
            .sum();
        HEADER_LEN + self.vectors.len() * 4 + ids + nodes + FOOTER_LEN
    }
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_f32(buf: &mut Vec<u8>, v: f32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Serialize a forest.
pub fn encode_forest(forest: &Forest) -> Vec<u8> {
    let mut buf = Vec::with_capacity(forest.size_hint());

    buf.extend_from_slice(FOREST_MAGIC);
    put_u32(&mut buf, FORMAT_VERSION);
    put_u32(&mut buf, forest.dimension as u32);
    put_u32(&mut buf, forest.len() as u32);
    put_u32(&mut buf, forest.trees.len() as u32);
    put_u32(&mut buf, forest.leaf_size as u32);

    for &v in &forest.vectors {
        put_f32(&mut buf, v);
    }

    for id in forest.ids.iter() {
        put_u32(&mut buf, id.len() as u32);
        buf.extend_from_slice(id.as_bytes());
    }

    for tree in &forest.trees {
        let mut stack = vec![Tree::ROOT];
        while let Some(id) = stack.pop() {
            match tree.node(id) {
                Node::Leaf { items } => {
                    buf.push(TAG_LEAF);
                    put_u32(&mut buf, items.len() as u32);
                    for &item in items {
                        put_u32(&mut buf, item);
                    }
                }
                Node::Split {
                    normal,
                    offset,
                    left,
                    right,
                } => {
                    buf.push(TAG_SPLIT);
                    for &v in normal {
                        put_f32(&mut buf, v);
                    }
                    put_f32(&mut buf, *offset);
                    stack.push(*right);
                    stack.push(*left);
                }
            }
        }
    }

    let checksum = crc32fast::hash(&buf);
    put_u32(&mut buf, checksum);
    buf
}

/// Bounds-checked little-endian reader; every short read is a corrupt artifact.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ForestError::corrupt(format!(
                "truncated while reading {what} at byte {}",
                self.pos
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f32(&mut self, what: &str) -> Result<f32> {
        let b = self.take(4, what)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reject counts that could not possibly fit in the remaining bytes.
    fn check_count(&self, count: usize, unit: usize, what: &str) -> Result<()> {
        match count.checked_mul(unit) {
            Some(bytes) if bytes <= self.remaining() => Ok(()),
            _ => Err(ForestError::corrupt(format!(
                "{what} count {count} exceeds artifact size"
            ))),
        }
    }
}

/// Deserialize a forest. Never returns a partially decoded forest.
pub fn decode_forest(bytes: &[u8]) -> Result<Forest> {
    if bytes.len() < HEADER_LEN + FOOTER_LEN {
        return Err(ForestError::corrupt(format!(
            "artifact is {} bytes, shorter than header and footer",
            bytes.len()
        )));
    }
    let (body, footer) = bytes.split_at(bytes.len() - FOOTER_LEN);
    let stored = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]);
    let actual = crc32fast::hash(body);
    if stored != actual {
        return Err(ForestError::corrupt(format!(
            "checksum mismatch: expected {stored:08x}, got {actual:08x}"
        )));
    }

    let mut r = Reader::new(body);
    if r.take(4, "magic")? != FOREST_MAGIC {
        return Err(ForestError::corrupt("bad magic"));
    }
    let version = r.u32("format version")?;
    if version != FORMAT_VERSION {
        return Err(ForestError::corrupt(format!(
            "unsupported format version {version}"
        )));
    }
    let dimension = r.u32("dimension")? as usize;
    let num_vectors = r.u32("vector count")? as usize;
    let n_trees = r.u32("tree count")? as usize;
    let leaf_size = r.u32("leaf size")? as usize;
    if dimension == 0 || num_vectors == 0 || n_trees == 0 || leaf_size == 0 {
        return Err(ForestError::corrupt("header has a zero dimension or count"));
    }

    let total = num_vectors
        .checked_mul(dimension)
        .ok_or_else(|| ForestError::corrupt("vector table size overflows"))?;
    r.check_count(total, 4, "vector value")?;
    let mut vectors = Vec::with_capacity(total);
    for _ in 0..total {
        let v = r.f32("vector table")?;
        if !v.is_finite() {
            return Err(ForestError::corrupt("vector table holds a non-finite value"));
        }
        vectors.push(v);
    }

    r.check_count(num_vectors, 4, "identifier")?;
    let mut ids = IdentifierTable::new();
    for _ in 0..num_vectors {
        let len = r.u32("identifier length")? as usize;
        let raw = r.take(len, "identifier")?;
        let id = std::str::from_utf8(raw)
            .map_err(|_| ForestError::corrupt("identifier is not valid UTF-8"))?;
        ids.push(id.to_string())
            .map_err(|e| ForestError::corrupt(format!("identifier table: {e}")))?;
    }

    let mut trees = Vec::with_capacity(n_trees.min(r.remaining()));
    for _ in 0..n_trees {
        trees.push(decode_tree(&mut r, dimension, num_vectors, leaf_size)?);
    }

    if r.remaining() != 0 {
        return Err(ForestError::corrupt(format!(
            "{} trailing bytes after last tree",
            r.remaining()
        )));
    }

    Forest::from_parts(dimension, leaf_size, vectors, ids, trees)
}

fn decode_tree(
    r: &mut Reader<'_>,
    dimension: usize,
    num_vectors: usize,
    leaf_size: usize,
) -> Result<Tree> {
    let placeholder = || Node::Leaf {
        items: LeafItems::new(),
    };
    let mut nodes = vec![placeholder()];
    let mut pending: Vec<NodeId> = vec![Tree::ROOT];
    let mut covered = 0usize;

    while let Some(slot) = pending.pop() {
        match r.u8("node tag")? {
            TAG_LEAF => {
                let count = r.u32("leaf count")? as usize;
                if count == 0 || count > leaf_size {
                    return Err(ForestError::corrupt(format!(
                        "leaf holds {count} items, limit is {leaf_size}"
                    )));
                }
                r.check_count(count, 4, "leaf item")?;
                let mut items = LeafItems::with_capacity(count);
                for _ in 0..count {
                    let item: InternalIndex = r.u32("leaf item")?;
                    if item as usize >= num_vectors {
                        return Err(ForestError::corrupt(format!(
                            "leaf item {item} out of range (vectors: {num_vectors})"
                        )));
                    }
                    items.push(item);
                }
                covered += count;
                if covered > num_vectors {
                    return Err(ForestError::corrupt("tree holds more items than vectors"));
                }
                nodes[slot as usize] = Node::Leaf { items };
            }
            TAG_SPLIT => {
                r.check_count(dimension + 1, 4, "split value")?;
                let mut normal = Vec::with_capacity(dimension);
                for _ in 0..dimension {
                    normal.push(r.f32("split normal")?);
                }
                let offset = r.f32("split offset")?;
                let left = nodes.len() as NodeId;
                let right = left + 1;
                nodes.push(placeholder());
                nodes.push(placeholder());
                nodes[slot as usize] = Node::Split {
                    normal,
                    offset,
                    left,
                    right,
                };
                pending.push(right);
                pending.push(left);
            }
            tag => {
                return Err(ForestError::corrupt(format!("unknown node tag {tag}")));
            }
        }
    }

    Ok(Tree::from_nodes(nodes))
}
