//! # Pages
//!
//! A page is one immutable B-tree node: sorted keys plus either values (leaf)
//! or child references and per-child entry counts (interior node). Mutations
//! never change a published page; the write path copies every page from the
//! root down and publishes a new root, so readers holding any root see a
//! stable tree.
//!
//! ## Positions
//!
//! Once a page is written into a chunk it is addressed by a 64-bit position:
//!
//! ```text
//! chunkId:26 | offset:24 | lengthCode:5 | type:1
//! ```
//!
//! `lengthCode` encodes the page's maximum length as `32 << code` bytes; the
//! free-space accounting charges chunks by this maximum, so it never needs to
//! re-read a page to free it. Type bit 1 marks an interior node. Position 0
//! means "not written yet".
//!
//! The position of a page and of each child slot is an atomic set exactly
//! once by the commit path; an unsaved child additionally holds a strong
//! reference to the child page, cleared after the chunk reaches the file.
//! Readers first try the cached reference and fall back to the position, so
//! navigation is safe at every point of a concurrent commit.
//!
//! ## On-disk format
//!
//! ```text
//! len:   u32   total page length in bytes
//! check: u16   (chunkId ^ offset ^ len) truncated
//! mapId: varint
//! count: varint     number of keys
//! type:  u8         bit 0 node, bit 1 compressed
//! body:  node: childPos u64 x (count+1), childCount varint x (count+1), keys
//!        leaf: keys, values
//! ```
//!
//! A compressed body is preceded by a varint holding the difference between
//! expanded and compressed length.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::RwLock;
use zerocopy::big_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::encoding::{ByteReader, Compressor, WriteBuffer};
use crate::error::{store_bail, ErrorCode, StoreError};
use crate::store::chunk::Chunk;
use crate::types::{DataType, Value};

/// The fixed prologue of every on-disk page.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct PagePrologue {
    len: U32,
    check: U16,
}

pub(crate) const PAGE_PROLOGUE_SIZE: usize = std::mem::size_of::<PagePrologue>();

impl PagePrologue {
    /// Reads `(len, check)` from the first bytes of a page.
    pub(crate) fn parse(bytes: &[u8]) -> Result<(u32, u16)> {
        let head = bytes.get(..PAGE_PROLOGUE_SIZE).ok_or_else(|| {
            StoreError::new(ErrorCode::FileCorrupt, "page shorter than its prologue")
        })?;
        let p = PagePrologue::ref_from_bytes(head)
            .map_err(|_| StoreError::new(ErrorCode::FileCorrupt, "unreadable page prologue"))?;
        Ok((p.len.get(), p.check.get()))
    }
}

pub const PAGE_TYPE_LEAF: u8 = 0;
pub const PAGE_TYPE_NODE: u8 = 1;
const PAGE_COMPRESSED: u8 = 2;

/// Base memory estimate per page, before keys and values.
pub const PAGE_MEMORY: usize = 128;
/// Memory estimate per child slot of an interior node.
pub const PAGE_MEMORY_CHILD: usize = 16;

/// Encodes the byte position of a page.
pub fn page_pos(chunk_id: u32, offset: u32, len: u32, page_type: u8) -> u64 {
    ((chunk_id as u64) << 38)
        | ((offset as u64) << 6)
        | ((encode_length(len) as u64) << 1)
        | page_type as u64
}

/// Smallest code with `32 << code >= len`.
fn encode_length(len: u32) -> u8 {
    let mut code = 0u8;
    while (32u64 << code) < len as u64 {
        code += 1;
    }
    code
}

pub fn pos_chunk_id(pos: u64) -> u32 {
    (pos >> 38) as u32
}

pub fn pos_offset(pos: u64) -> u32 {
    ((pos >> 6) & 0xFF_FFFF) as u32
}

/// Maximum length of the page at `pos`, decoded from the length code.
pub fn pos_max_length(pos: u64) -> u64 {
    32u64 << ((pos >> 1) & 0x1F)
}

pub fn pos_is_leaf(pos: u64) -> bool {
    pos & 1 == PAGE_TYPE_LEAF as u64
}

fn check_value(chunk_id: u32, offset: u32, len: u32) -> u16 {
    (chunk_id ^ offset ^ len) as u16
}

/// A slot of an interior node pointing at one child.
#[derive(Debug)]
pub struct ChildRef {
    pos: AtomicU64,
    cached: RwLock<Option<Arc<Page>>>,
}

impl ChildRef {
    pub fn unsaved(page: Arc<Page>) -> Self {
        Self {
            pos: AtomicU64::new(0),
            cached: RwLock::new(Some(page)),
        }
    }

    pub fn saved(pos: u64) -> Self {
        Self {
            pos: AtomicU64::new(pos),
            cached: RwLock::new(None),
        }
    }

    pub fn pos(&self) -> u64 {
        self.pos.load(Ordering::Acquire)
    }

    pub fn cached(&self) -> Option<Arc<Page>> {
        self.cached.read().clone()
    }

    /// Records the on-disk position once the child has been serialized. The
    /// cached reference stays until [`Page::write_end`] so that concurrent
    /// readers never observe a position that is not yet on disk.
    pub fn set_pos(&self, pos: u64) {
        self.pos.store(pos, Ordering::Release);
    }

    fn clear_cached(&self) {
        *self.cached.write() = None;
    }

    fn duplicate(&self) -> Self {
        Self {
            pos: AtomicU64::new(self.pos()),
            cached: RwLock::new(self.cached()),
        }
    }
}

#[derive(Debug)]
pub enum PageContent {
    Leaf { values: Vec<Value> },
    Node { children: Vec<ChildRef>, counts: Vec<u64> },
}

/// One B-tree node. Immutable after publication; the `pos` atomic is set
/// exactly once when the page is written to a chunk.
#[derive(Debug)]
pub struct Page {
    pos: AtomicU64,
    keys: Vec<Value>,
    content: PageContent,
    total_count: u64,
    memory: usize,
}

impl Page {
    pub fn empty_leaf() -> Page {
        Page {
            pos: AtomicU64::new(0),
            keys: Vec::new(),
            content: PageContent::Leaf { values: Vec::new() },
            total_count: 0,
            memory: PAGE_MEMORY,
        }
    }

    pub fn new_leaf(
        keys: Vec<Value>,
        values: Vec<Value>,
        key_type: &dyn DataType,
        value_type: &dyn DataType,
    ) -> Page {
        debug_assert_eq!(keys.len(), values.len());
        let memory = PAGE_MEMORY
            + keys.iter().map(|k| key_type.memory(k)).sum::<usize>()
            + values.iter().map(|v| value_type.memory(v)).sum::<usize>();
        let total_count = keys.len() as u64;
        Page {
            pos: AtomicU64::new(0),
            keys,
            content: PageContent::Leaf { values },
            total_count,
            memory,
        }
    }

    pub fn new_node(
        keys: Vec<Value>,
        children: Vec<ChildRef>,
        counts: Vec<u64>,
        key_type: &dyn DataType,
    ) -> Page {
        debug_assert_eq!(keys.len() + 1, children.len());
        debug_assert_eq!(children.len(), counts.len());
        let memory = PAGE_MEMORY
            + keys.iter().map(|k| key_type.memory(k)).sum::<usize>()
            + children.len() * PAGE_MEMORY_CHILD;
        let total_count = counts.iter().sum();
        Page {
            pos: AtomicU64::new(0),
            keys,
            content: PageContent::Node { children, counts },
            total_count,
            memory,
        }
    }

    pub fn pos(&self) -> u64 {
        self.pos.load(Ordering::Acquire)
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.content, PageContent::Leaf { .. })
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn key(&self, index: usize) -> &Value {
        &self.keys[index]
    }

    pub fn keys(&self) -> &[Value] {
        &self.keys
    }

    pub fn content(&self) -> &PageContent {
        &self.content
    }

    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    pub fn memory(&self) -> usize {
        self.memory
    }

    pub fn value(&self, index: usize) -> &Value {
        match &self.content {
            PageContent::Leaf { values } => &values[index],
            PageContent::Node { .. } => unreachable!("value() on an interior node"),
        }
    }

    pub fn child_ref(&self, index: usize) -> &ChildRef {
        match &self.content {
            PageContent::Node { children, .. } => &children[index],
            PageContent::Leaf { .. } => unreachable!("child_ref() on a leaf"),
        }
    }

    pub fn child_count(&self) -> usize {
        match &self.content {
            PageContent::Node { children, .. } => children.len(),
            PageContent::Leaf { .. } => 0,
        }
    }

    pub fn counts(&self, index: usize) -> u64 {
        match &self.content {
            PageContent::Node { counts, .. } => counts[index],
            PageContent::Leaf { .. } => unreachable!("counts() on a leaf"),
        }
    }

    pub fn binary_search(&self, key: &Value, key_type: &dyn DataType) -> Result<usize, usize> {
        self.keys.binary_search_by(|probe| key_type.compare(probe, key))
    }

    /// An owned, unsaved copy sharing the same logical content. The caller
    /// registers the replaced page as freed.
    pub fn copy(&self) -> Page {
        let content = match &self.content {
            PageContent::Leaf { values } => PageContent::Leaf {
                values: values.clone(),
            },
            PageContent::Node { children, counts } => PageContent::Node {
                children: children.iter().map(ChildRef::duplicate).collect(),
                counts: counts.clone(),
            },
        };
        Page {
            pos: AtomicU64::new(0),
            keys: self.keys.clone(),
            content,
            total_count: self.total_count,
            memory: self.memory,
        }
    }

    // ----- mutators, valid only while the page is owned by the writer -----

    pub fn insert_leaf(
        &mut self,
        index: usize,
        key: Value,
        value: Value,
        key_type: &dyn DataType,
        value_type: &dyn DataType,
    ) {
        self.memory += key_type.memory(&key) + value_type.memory(&value);
        self.keys.insert(index, key);
        match &mut self.content {
            PageContent::Leaf { values } => values.insert(index, value),
            PageContent::Node { .. } => unreachable!("insert_leaf on an interior node"),
        }
        self.total_count += 1;
    }

    pub fn set_value(&mut self, index: usize, value: Value, value_type: &dyn DataType) -> Value {
        match &mut self.content {
            PageContent::Leaf { values } => {
                self.memory += value_type.memory(&value);
                self.memory -= value_type.memory(&values[index]);
                std::mem::replace(&mut values[index], value)
            }
            PageContent::Node { .. } => unreachable!("set_value on an interior node"),
        }
    }

    /// Removes the entry at `index`: key and value on a leaf, child slot and
    /// adjacent separator on a node.
    pub fn remove(
        &mut self,
        index: usize,
        key_type: &dyn DataType,
        value_type: &dyn DataType,
    ) -> Option<Value> {
        match &mut self.content {
            PageContent::Leaf { values } => {
                let key = self.keys.remove(index);
                let value = values.remove(index);
                self.memory -= key_type.memory(&key) + value_type.memory(&value);
                self.total_count -= 1;
                Some(value)
            }
            PageContent::Node { children, counts } => {
                let key_index = if index >= self.keys.len() {
                    index - 1
                } else {
                    index
                };
                let key = self.keys.remove(key_index);
                self.memory -= key_type.memory(&key) + PAGE_MEMORY_CHILD;
                children.remove(index);
                let removed = counts.remove(index);
                self.total_count -= removed;
                None
            }
        }
    }

    /// Replaces the child at `index`, updating the subtree count.
    pub fn set_child(&mut self, index: usize, child: Arc<Page>) {
        match &mut self.content {
            PageContent::Node { children, counts } => {
                counts[index] = child.total_count;
                children[index] = ChildRef::unsaved(child);
                self.total_count = counts.iter().sum();
            }
            PageContent::Leaf { .. } => unreachable!("set_child on a leaf"),
        }
    }

    /// Inserts `key` and `child` at `index`, shifting the existing slots
    /// right. Used after a split, with the right half already stored at
    /// `index` via [`Page::set_child`].
    pub fn insert_node(
        &mut self,
        index: usize,
        key: Value,
        child: Arc<Page>,
        key_type: &dyn DataType,
    ) {
        match &mut self.content {
            PageContent::Node { children, counts } => {
                self.memory += key_type.memory(&key) + PAGE_MEMORY_CHILD;
                self.keys.insert(index, key);
                counts.insert(index, child.total_count);
                children.insert(index, ChildRef::unsaved(child));
                self.total_count = counts.iter().sum();
            }
            PageContent::Leaf { .. } => unreachable!("insert_node on a leaf"),
        }
    }

    /// Splits off the upper half at `at`, returning the new right sibling.
    /// For a leaf the key at `at` becomes the first key of the right page;
    /// for a node it is removed and promoted by the caller as the separator.
    pub fn split(
        &mut self,
        at: usize,
        key_type: &dyn DataType,
        value_type: &dyn DataType,
    ) -> Page {
        match &mut self.content {
            PageContent::Leaf { values } => {
                let right_keys = self.keys.split_off(at);
                let right_values = values.split_off(at);
                let right = Page::new_leaf(right_keys, right_values, key_type, value_type);
                self.total_count = self.keys.len() as u64;
                self.memory = PAGE_MEMORY
                    + self.keys.iter().map(|k| key_type.memory(k)).sum::<usize>()
                    + values.iter().map(|v| value_type.memory(v)).sum::<usize>();
                right
            }
            PageContent::Node { children, counts } => {
                let right_keys = self.keys.split_off(at + 1);
                self.keys.pop(); // the promoted separator
                let right_children: Vec<ChildRef> = children.split_off(at + 1);
                let right_counts = counts.split_off(at + 1);
                let right = Page {
                    pos: AtomicU64::new(0),
                    total_count: right_counts.iter().sum(),
                    memory: PAGE_MEMORY
                        + right_keys.iter().map(|k| key_type.memory(k)).sum::<usize>()
                        + right_children.len() * PAGE_MEMORY_CHILD,
                    keys: right_keys,
                    content: PageContent::Node {
                        children: right_children,
                        counts: right_counts,
                    },
                };
                self.total_count = counts.iter().sum();
                self.memory = PAGE_MEMORY
                    + self.keys.iter().map(|k| key_type.memory(k)).sum::<usize>()
                    + children.len() * PAGE_MEMORY_CHILD;
                right
            }
        }
    }

    // ----- serialization -----

    /// Writes this page and every unsaved descendant into `buf`, children
    /// before parents, assigning positions as it goes. Returns this page's
    /// position. Pages written are collected into `written` for the
    /// [`Page::write_end`] pass after the chunk reaches the file.
    pub fn write_unsaved_recursive(
        self: &Arc<Page>,
        chunk: &mut Chunk,
        buf: &mut WriteBuffer,
        map_id: u32,
        key_type: &dyn DataType,
        value_type: &dyn DataType,
        compressor: Option<&dyn Compressor>,
        written: &mut Vec<Arc<Page>>,
    ) -> Result<u64> {
        let existing = self.pos();
        if existing != 0 {
            return Ok(existing);
        }
        if let PageContent::Node { children, .. } = &self.content {
            for child in children {
                if child.pos() == 0 {
                    let Some(page) = child.cached() else {
                        store_bail!(
                            ErrorCode::Internal,
                            "unsaved child of map {} has no in-memory page",
                            map_id
                        );
                    };
                    let pos = page.write_unsaved_recursive(
                        chunk, buf, map_id, key_type, value_type, compressor, written,
                    )?;
                    child.set_pos(pos);
                }
            }
        }

        let start = buf.len();
        buf.put_u32(0); // len, patched below
        buf.put_u16(0); // check, patched below
        buf.put_varint(map_id as u64);
        buf.put_varint(self.keys.len() as u64);

        let mut body = WriteBuffer::new();
        let mut page_type = match &self.content {
            PageContent::Leaf { .. } => PAGE_TYPE_LEAF,
            PageContent::Node { .. } => PAGE_TYPE_NODE,
        };
        match &self.content {
            PageContent::Leaf { values } => {
                for k in &self.keys {
                    key_type.write(&mut body, k)?;
                }
                for v in values {
                    value_type.write(&mut body, v)?;
                }
            }
            PageContent::Node { children, counts } => {
                for child in children {
                    debug_assert_ne!(child.pos(), 0);
                    body.put_u64(child.pos());
                }
                for &c in counts {
                    body.put_varint(c);
                }
                for k in &self.keys {
                    key_type.write(&mut body, k)?;
                }
            }
        }

        let mut compressed = Vec::new();
        let body_slice = match compressor {
            Some(c) => {
                c.compress(body.as_slice(), &mut compressed);
                if compressed.len() < body.len() {
                    page_type |= PAGE_COMPRESSED;
                    Some(compressed.as_slice())
                } else {
                    None
                }
            }
            None => None,
        };
        buf.put_u8(page_type);
        match body_slice {
            Some(data) => {
                buf.put_varint((body.len() - data.len()) as u64);
                buf.put_slice(data);
            }
            None => buf.put_slice(body.as_slice()),
        }

        let len = (buf.len() - start) as u32;
        ensure!(start <= 0xFF_FFFF, "chunk overflows the page offset range");
        buf.patch(start, &len.to_be_bytes());
        buf.patch(
            start + 4,
            &check_value(chunk.id, start as u32, len).to_be_bytes(),
        );

        let pos = page_pos(chunk.id, start as u32, len, page_type & PAGE_TYPE_NODE);
        self.pos.store(pos, Ordering::Release);
        let max = pos_max_length(pos);
        chunk.page_count += 1;
        chunk.page_count_live += 1;
        chunk.max_length += max;
        chunk.max_len_live += max as i64;
        written.push(self.clone());
        Ok(pos)
    }

    /// Drops the strong references to freshly written children. Called after
    /// the chunk (and its trailing header) are on disk; from here on,
    /// navigation goes through positions and the page cache.
    pub fn write_end(&self) {
        if let PageContent::Node { children, .. } = &self.content {
            for child in children {
                child.clear_cached();
            }
        }
    }

    /// Decodes a page from `bytes`, which start at the page's position in
    /// its chunk.
    pub fn read(
        bytes: &[u8],
        pos: u64,
        expected_map_id: u32,
        key_type: &dyn DataType,
        value_type: &dyn DataType,
        compressor: &dyn Compressor,
    ) -> Result<Page> {
        let chunk_id = pos_chunk_id(pos);
        let offset = pos_offset(pos);
        let (len, check) = PagePrologue::parse(bytes)?;
        if (len as usize) > bytes.len() || (len as usize) < PAGE_PROLOGUE_SIZE + 3 {
            store_bail!(
                ErrorCode::FileCorrupt,
                "page length {} out of range at position {}",
                len,
                pos
            );
        }
        let mut r = ByteReader::new(bytes);
        let _ = r.get_slice(PAGE_PROLOGUE_SIZE)?;
        if check != check_value(chunk_id, offset, len) {
            store_bail!(ErrorCode::FileCorrupt, "page checksum mismatch at {}", pos);
        }
        let map_id = r.get_varint()? as u32;
        if map_id != expected_map_id {
            store_bail!(
                ErrorCode::FileCorrupt,
                "page at {} belongs to map {}, expected {}",
                pos,
                map_id,
                expected_map_id
            );
        }
        let key_count = r.get_varint()? as usize;
        let page_type = r.get_u8()?;
        let header_len = r.position();

        let expanded;
        let body: &[u8] = if page_type & PAGE_COMPRESSED != 0 {
            let len_add = r.get_varint()? as usize;
            let comp = r.get_slice(len as usize - r.position())?;
            expanded = compressor.expand(comp, comp.len() + len_add)?;
            &expanded
        } else {
            r.get_slice(len as usize - header_len)?
        };

        let mut b = ByteReader::new(body);
        if page_type & PAGE_TYPE_NODE != 0 {
            let mut children = Vec::with_capacity(key_count + 1);
            for _ in 0..key_count + 1 {
                children.push(ChildRef::saved(b.get_u64()?));
            }
            let mut counts = Vec::with_capacity(key_count + 1);
            for _ in 0..key_count + 1 {
                counts.push(b.get_varint()?);
            }
            let mut keys = Vec::with_capacity(key_count);
            for _ in 0..key_count {
                keys.push(key_type.read(&mut b)?);
            }
            let mut page = Page::new_node(keys, children, counts, key_type);
            page.pos = AtomicU64::new(pos);
            Ok(page)
        } else {
            let mut keys = Vec::with_capacity(key_count);
            for _ in 0..key_count {
                keys.push(key_type.read(&mut b)?);
            }
            let mut values = Vec::with_capacity(key_count);
            for _ in 0..key_count {
                values.push(value_type.read(&mut b)?);
            }
            let mut page = Page::new_leaf(keys, values, key_type, value_type);
            page.pos = AtomicU64::new(pos);
            Ok(page)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::Lz4Compressor;
    use crate::types::{string_type, variant_type};

    #[test]
    fn position_codec_round_trips() {
        let pos = page_pos(7, 4096, 900, PAGE_TYPE_NODE);
        assert_eq!(pos_chunk_id(pos), 7);
        assert_eq!(pos_offset(pos), 4096);
        assert!(!pos_is_leaf(pos));
        assert!(pos_max_length(pos) >= 900);
        assert!(pos_max_length(pos) < 2 * 1024);

        let leaf = page_pos(1, 0, 31, PAGE_TYPE_LEAF);
        assert!(pos_is_leaf(leaf));
        assert_eq!(pos_max_length(leaf), 32);
        assert_ne!(leaf, 0);
    }

    #[test]
    fn length_codes_are_powers_of_two() {
        assert_eq!(encode_length(1), 0);
        assert_eq!(encode_length(32), 0);
        assert_eq!(encode_length(33), 1);
        assert_eq!(encode_length(64), 1);
        assert_eq!(encode_length(1 << 20), 15);
    }

    fn leaf_with(entries: &[(i64, &str)]) -> Arc<Page> {
        let kt = variant_type();
        let vt = variant_type();
        let keys = entries.iter().map(|&(k, _)| Value::from(k)).collect();
        let values = entries.iter().map(|&(_, v)| Value::from(v)).collect();
        Arc::new(Page::new_leaf(keys, values, kt.as_ref(), vt.as_ref()))
    }

    #[test]
    fn leaf_round_trips_through_a_chunk_buffer() {
        let kt = variant_type();
        let vt = variant_type();
        let page = leaf_with(&[(1, "one"), (2, "two"), (3, "three")]);
        let mut chunk = Chunk::new(5);
        let mut buf = WriteBuffer::new();
        let mut written = Vec::new();

        let pos = page
            .write_unsaved_recursive(
                &mut chunk, &mut buf, 9, kt.as_ref(), vt.as_ref(), None, &mut written,
            )
            .unwrap();
        assert_eq!(page.pos(), pos);
        assert_eq!(chunk.page_count, 1);
        assert_eq!(written.len(), 1);

        let back = Page::read(
            buf.as_slice(),
            pos,
            9,
            kt.as_ref(),
            vt.as_ref(),
            &Lz4Compressor,
        )
        .unwrap();
        assert_eq!(back.key_count(), 3);
        assert_eq!(back.value(1), &Value::from("two"));
        assert_eq!(back.total_count(), 3);
    }

    #[test]
    fn node_serializes_children_first() {
        let kt = variant_type();
        let vt = variant_type();
        let left = leaf_with(&[(1, "a")]);
        let right = leaf_with(&[(5, "b"), (6, "c")]);
        let node = Arc::new(Page::new_node(
            vec![Value::from(5)],
            vec![
                ChildRef::unsaved(left.clone()),
                ChildRef::unsaved(right.clone()),
            ],
            vec![1, 2],
            kt.as_ref(),
        ));
        assert_eq!(node.total_count(), 3);

        let mut chunk = Chunk::new(1);
        let mut buf = WriteBuffer::new();
        let mut written = Vec::new();
        let pos = node
            .write_unsaved_recursive(
                &mut chunk, &mut buf, 0, kt.as_ref(), vt.as_ref(), None, &mut written,
            )
            .unwrap();

        // children got their own positions, written before the parent
        assert_ne!(left.pos(), 0);
        assert_ne!(right.pos(), 0);
        assert!(pos_offset(left.pos()) < pos_offset(pos));
        assert_eq!(chunk.page_count, 3);

        let back = Page::read(
            &buf.as_slice()[pos_offset(pos) as usize..],
            pos,
            0,
            kt.as_ref(),
            vt.as_ref(),
            &Lz4Compressor,
        )
        .unwrap();
        assert!(!back.is_leaf());
        assert_eq!(back.child_ref(0).pos(), left.pos());
        assert_eq!(back.counts(1), 2);
    }

    #[test]
    fn compressed_pages_round_trip() {
        let kt = string_type();
        let vt = string_type();
        let keys: Vec<Value> = (0..50).map(|i| Value::from(format!("key{:04}", i))).collect();
        let values: Vec<Value> = (0..50).map(|_| Value::from("same same same")).collect();
        let page = Arc::new(Page::new_leaf(keys, values, kt.as_ref(), vt.as_ref()));

        let mut chunk = Chunk::new(2);
        let mut buf = WriteBuffer::new();
        let mut written = Vec::new();
        let pos = page
            .write_unsaved_recursive(
                &mut chunk,
                &mut buf,
                1,
                kt.as_ref(),
                vt.as_ref(),
                Some(&Lz4Compressor),
                &mut written,
            )
            .unwrap();

        let back = Page::read(
            buf.as_slice(),
            pos,
            1,
            kt.as_ref(),
            vt.as_ref(),
            &Lz4Compressor,
        )
        .unwrap();
        assert_eq!(back.key_count(), 50);
        assert_eq!(back.value(49), &Value::from("same same same"));
    }

    #[test]
    fn corrupt_check_is_rejected() {
        let kt = variant_type();
        let vt = variant_type();
        let page = leaf_with(&[(1, "x")]);
        let mut chunk = Chunk::new(1);
        let mut buf = WriteBuffer::new();
        let mut written = Vec::new();
        let pos = page
            .write_unsaved_recursive(
                &mut chunk, &mut buf, 0, kt.as_ref(), vt.as_ref(), None, &mut written,
            )
            .unwrap();

        let mut bytes = buf.as_slice().to_vec();
        bytes[5] ^= 0xFF;
        let err = Page::read(&bytes, pos, 0, kt.as_ref(), vt.as_ref(), &Lz4Compressor)
            .unwrap_err();
        assert_eq!(
            crate::error::StoreError::code_of(&err),
            Some(ErrorCode::FileCorrupt)
        );
    }

    #[test]
    fn split_leaf_keeps_lower_half() {
        let kt = variant_type();
        let vt = variant_type();
        let mut page = leaf_with(&[(1, "a"), (2, "b"), (3, "c"), (4, "d")])
            .copy();
        let right = page.split(2, kt.as_ref(), vt.as_ref());

        assert_eq!(page.key_count(), 2);
        assert_eq!(right.key_count(), 2);
        assert_eq!(page.key(1), &Value::from(2));
        assert_eq!(right.key(0), &Value::from(3));
        assert_eq!(page.total_count() + right.total_count(), 4);
    }

    #[test]
    fn split_node_promotes_the_separator() {
        let kt = variant_type();
        let children: Vec<ChildRef> = (0..4)
            .map(|i| ChildRef::unsaved(leaf_with(&[(10 * i, "v")])))
            .collect();
        let mut node = Page::new_node(
            vec![Value::from(10), Value::from(20), Value::from(30)],
            children,
            vec![1, 1, 1, 1],
            kt.as_ref(),
        );

        let separator = node.key(1).clone();
        let right = node.split(1, kt.as_ref(), kt.as_ref());
        assert_eq!(separator, Value::from(20));
        assert_eq!(node.key_count(), 1);
        assert_eq!(right.key_count(), 1);
        assert_eq!(node.child_count(), 2);
        assert_eq!(right.child_count(), 2);
        assert_eq!(node.key(0), &Value::from(10));
        assert_eq!(right.key(0), &Value::from(30));
    }
}
