//! # Chunks
//!
//! A chunk is a page-aligned file segment carrying all pages written by one
//! store operation, plus the meta-map snapshot of that version. Chunks are
//! self-describing: an ASCII header at the start, a checksummed ASCII footer
//! in the last [`CHUNK_FOOTER_LENGTH`] bytes, and one extra block after the
//! chunk holding a store-header copy so recovery can find the newest chunk by
//! reading the end of the file.
//!
//! There are at most 2^26 chunks and a chunk spans at most 2^24 page-offset
//! bytes, matching the page position encoding.
//!
//! `block` and `len` count [`BLOCK_SIZE`] units. While a chunk is being
//! composed, `block` and `len` hold placeholder maxima; the header is written
//! once with those (reserving worst-case space) and patched in place when the
//! final values are known.

use eyre::Result;

use crate::config::{BLOCK_SIZE, CHUNK_FOOTER_LENGTH, MAX_HEADER_LENGTH};
use crate::encoding::{fletcher32, kvmap};
use crate::error::{store_bail, ErrorCode};

/// Metadata for one chunk. Serialized into the meta map under
/// `chunk.<id hex>` and into the chunk's own header and footer.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Monotonically increasing chunk id.
    pub id: u32,
    /// Start of the chunk, in blocks. `u64::MAX` while unplaced.
    pub block: u64,
    /// Chunk length in blocks, excluding the trailing store-header block.
    /// `u32::MAX` while unplaced.
    pub len: u32,
    /// Total number of pages in the chunk.
    pub page_count: u32,
    /// Number of pages still referenced by some retained root.
    pub page_count_live: i64,
    /// Sum of the maximum lengths of all pages.
    pub max_length: u64,
    /// Sum of the maximum lengths of the pages still live.
    pub max_len_live: i64,
    /// Position of the meta-map root written with this chunk.
    pub meta_root_pos: u64,
    /// The version this chunk belongs to.
    pub version: i64,
    /// Creation time, in milliseconds after the store was created.
    pub time: u64,
    /// The last map id in use when the chunk was written.
    pub map_id: u32,
    /// Predicted position of the next chunk, in blocks; 0 when unknown.
    pub next: u64,
    /// Garbage collection priority, transient.
    pub collect_priority: u32,
}

impl Chunk {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            block: u64::MAX,
            len: u32::MAX,
            page_count: 0,
            page_count_live: 0,
            max_length: 0,
            max_len_live: 0,
            meta_root_pos: 0,
            version: id as i64,
            time: 0,
            map_id: 0,
            next: 0,
            collect_priority: 0,
        }
    }

    /// The meta-map key of this chunk, e.g. `chunk.1f`.
    pub fn meta_key(chunk_id: u32) -> String {
        format!("chunk.{:x}", chunk_id)
    }

    /// Percentage of the chunk that is still live.
    pub fn fill_rate(&self) -> u32 {
        if self.max_length == 0 {
            0
        } else {
            (100 * self.max_len_live.max(0) as u64 / self.max_length) as u32
        }
    }

    /// Byte length of the chunk including its trailing store-header block.
    pub fn extent_bytes(&self) -> u64 {
        (self.len as u64 + 1) * BLOCK_SIZE as u64
    }

    /// Byte position of the chunk start.
    pub fn start_pos(&self) -> u64 {
        self.block * BLOCK_SIZE as u64
    }

    /// Serializes the chunk fields. Live values equal to their totals, a
    /// version equal to the id, and a zero `next` are omitted, matching
    /// `from_string` defaults.
    pub fn as_string(&self) -> String {
        let mut s = String::new();
        kvmap::append_hex(&mut s, "chunk", self.id as u64);
        kvmap::append_hex(&mut s, "block", self.block);
        kvmap::append_hex(&mut s, "len", self.len as u64);
        if self.max_len_live != self.max_length as i64 {
            kvmap::append_hex(&mut s, "liveMax", self.max_len_live.max(0) as u64);
        }
        if self.page_count_live != self.page_count as i64 {
            kvmap::append_hex(&mut s, "livePages", self.page_count_live.max(0) as u64);
        }
        kvmap::append_hex(&mut s, "map", self.map_id as u64);
        kvmap::append_hex(&mut s, "max", self.max_length);
        if self.next != 0 {
            kvmap::append_hex(&mut s, "next", self.next);
        }
        kvmap::append_hex(&mut s, "pages", self.page_count as u64);
        kvmap::append_hex(&mut s, "root", self.meta_root_pos);
        kvmap::append_hex(&mut s, "time", self.time);
        if self.version != self.id as i64 {
            kvmap::append_hex(&mut s, "version", self.version as u64);
        }
        s
    }

    /// Parses a chunk record serialized by [`Chunk::as_string`].
    pub fn from_string(s: &str) -> Result<Self> {
        let map = kvmap::parse(s)?;
        let id = kvmap::read_hex(&map, "chunk", 0)? as u32;
        let page_count = kvmap::read_hex(&map, "pages", 0)? as u32;
        let max_length = kvmap::read_hex(&map, "max", 0)?;
        Ok(Self {
            id,
            block: kvmap::read_hex(&map, "block", 0)?,
            len: kvmap::read_hex(&map, "len", 0)? as u32,
            page_count,
            page_count_live: kvmap::read_hex(&map, "livePages", page_count as u64)? as i64,
            max_length,
            max_len_live: kvmap::read_hex(&map, "liveMax", max_length)? as i64,
            meta_root_pos: kvmap::read_hex(&map, "root", 0)?,
            version: kvmap::read_hex(&map, "version", id as u64)? as i64,
            time: kvmap::read_hex(&map, "time", 0)?,
            map_id: kvmap::read_hex(&map, "map", 0)? as u32,
            next: kvmap::read_hex(&map, "next", 0)?,
            collect_priority: 0,
        })
    }

    /// Renders the header with trailing space padding to exactly
    /// `reserved - 1` bytes plus a newline.
    pub fn header_bytes(&self, reserved: usize) -> Result<Vec<u8>> {
        let mut s = self.as_string();
        if s.len() + 1 > reserved || reserved > MAX_HEADER_LENGTH {
            store_bail!(
                ErrorCode::Internal,
                "chunk header of {} bytes exceeds the {} reserved",
                s.len() + 1,
                reserved
            );
        }
        while s.len() < reserved - 1 {
            s.push(' ');
        }
        s.push('\n');
        Ok(s.into_bytes())
    }

    /// Parses a chunk header from the first bytes of a chunk.
    pub fn read_header(bytes: &[u8], start: u64) -> Result<Self> {
        let limit = bytes.len().min(MAX_HEADER_LENGTH);
        for i in 0..limit {
            if bytes[i] == b'\n' {
                if let Ok(s) = std::str::from_utf8(&bytes[..i]) {
                    if let Ok(chunk) = Self::from_string(s.trim()) {
                        return Ok(chunk);
                    }
                }
                break;
            }
        }
        store_bail!(
            ErrorCode::FileCorrupt,
            "corrupt chunk header at position {}",
            start
        );
    }

    /// The checksummed footer occupying the last [`CHUNK_FOOTER_LENGTH`]
    /// bytes of the chunk.
    pub fn footer_bytes(&self) -> Vec<u8> {
        let mut s = String::new();
        kvmap::append_hex(&mut s, "chunk", self.id as u64);
        kvmap::append_hex(&mut s, "block", self.block);
        if self.version != self.id as i64 {
            kvmap::append_hex(&mut s, "version", self.version as u64);
        }
        let bytes = s.as_bytes();
        let check = fletcher32(bytes, bytes.len() / 2 * 2);
        kvmap::append_hex(&mut s, "fletcher", check as u64);
        while s.len() < CHUNK_FOOTER_LENGTH - 1 {
            s.push(' ');
        }
        s.push('\n');
        s.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips_with_omitted_defaults() {
        let mut c = Chunk::new(31);
        c.block = 2;
        c.len = 3;
        c.page_count = 10;
        c.page_count_live = 10;
        c.max_length = 9000;
        c.max_len_live = 9000;
        c.meta_root_pos = 0xABCDEF;
        c.time = 1234;
        c.map_id = 4;

        let s = c.as_string();
        assert!(!s.contains("livePages"), "default livePages serialized: {}", s);
        assert!(!s.contains("liveMax"));
        assert!(!s.contains("version"));

        let back = Chunk::from_string(&s).unwrap();
        assert_eq!(back.id, 31);
        assert_eq!(back.block, 2);
        assert_eq!(back.len, 3);
        assert_eq!(back.page_count_live, 10);
        assert_eq!(back.max_len_live, 9000);
        assert_eq!(back.version, 31);
        assert_eq!(back.meta_root_pos, 0xABCDEF);
    }

    #[test]
    fn live_values_and_version_survive_when_different() {
        let mut c = Chunk::new(5);
        c.block = 7;
        c.len = 1;
        c.page_count = 8;
        c.page_count_live = 3;
        c.max_length = 4000;
        c.max_len_live = 1000;
        c.version = 9;

        let back = Chunk::from_string(&c.as_string()).unwrap();
        assert_eq!(back.page_count_live, 3);
        assert_eq!(back.max_len_live, 1000);
        assert_eq!(back.version, 9);
    }

    #[test]
    fn header_is_padded_and_parsable() {
        let mut c = Chunk::new(1);
        c.block = 2;
        c.len = 1;
        let header = c.header_bytes(256).unwrap();
        assert_eq!(header.len(), 256);
        assert_eq!(*header.last().unwrap(), b'\n');

        let back = Chunk::read_header(&header, 8192).unwrap();
        assert_eq!(back.id, 1);
        assert_eq!(back.block, 2);
    }

    #[test]
    fn garbage_header_is_corrupt() {
        let err = Chunk::read_header(&[0xFF; 64], 0).unwrap_err();
        assert_eq!(
            crate::error::StoreError::code_of(&err),
            Some(ErrorCode::FileCorrupt)
        );
    }

    #[test]
    fn footer_has_fixed_length_and_checksum() {
        let mut c = Chunk::new(3);
        c.block = 9;
        let footer = c.footer_bytes();
        assert_eq!(footer.len(), CHUNK_FOOTER_LENGTH);

        let s = std::str::from_utf8(&footer).unwrap();
        let map = kvmap::parse(s).unwrap();
        let check = kvmap::read_hex(&map, "fletcher", 0).unwrap() as u32;
        let prefix = "chunk:3,block:9";
        assert_eq!(check, fletcher32(prefix.as_bytes(), prefix.len() / 2 * 2));
    }

    #[test]
    fn fill_rate_is_live_over_total() {
        let mut c = Chunk::new(1);
        c.max_length = 1000;
        c.max_len_live = 250;
        assert_eq!(c.fill_rate(), 25);
        c.max_length = 0;
        assert_eq!(c.fill_rate(), 0);
    }
}
