//! # Store
//!
//! The chunk and commit engine. A store owns one file (or nothing, for a
//! purely in-memory store) and a forest of maps. Committed snapshots are
//! written as [chunks](chunk::Chunk): self-describing, page-aligned segments
//! carrying the new pages of the stored version plus a serialized meta-map
//! snapshot. The meta map (map id 0) indexes everything: map names and
//! configurations, root positions per map, the chunk table, and settings.
//!
//! ## Commit protocol
//!
//! A store operation, under the store-wide commit lock:
//!
//! 1. increments the version and assigns a new chunk id;
//! 2. snapshots every map changed since the last stored version;
//! 3. applies pending freed-page accounting, collecting chunks whose live
//!    content dropped to zero and whose retention time has passed;
//! 4. serializes the changed roots depth-first (children before parents)
//!    into the write buffer, then the meta root, patching the chunk header
//!    once positions are known;
//! 5. places the chunk (first-fit into free space, or at the end of the
//!    file), writes chunk plus trailing store-header block in one I/O;
//! 6. rewrites the two primary headers only when the chunk was not written
//!    at the end of the file.
//!
//! Because the headers are only touched after the chunk bytes are durable, a
//! crash at any point leaves either the previous committed version or the
//! new one.
//!
//! ## Recovery
//!
//! Opening a store reads the header candidates at offsets 0, `BLOCK_SIZE`,
//! and `size - BLOCK_SIZE`, keeps the ones whose Fletcher-32 verifies, and
//! follows the newest one to the meta map, from which the chunk table and
//! free-space map are rebuilt. A `rollbackOnOpen` marker (written when
//! uncommitted data was flushed under memory pressure) triggers an immediate
//! rollback to the last committed version.

pub mod background;
pub mod builder;
pub mod chunk;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::btree::map::{Map, MapInner};
use crate::btree::page::{pos_chunk_id, pos_max_length, pos_offset, Page};
use crate::config::{
    BLOCK_SIZE, CHUNK_FOOTER_LENGTH, FORMAT_READ, FORMAT_WRITE, WRITE_BUFFER_KEEP_LIMIT,
};
use crate::encoding::{fletcher32, kvmap, Compressor, Lz4Compressor, WriteBuffer};
use crate::error::{store_bail, ErrorCode, StoreError};
use crate::storage::{FileStore, LirsCache};
use crate::types::{string_type, DataType, Value};
use background::BackgroundWriter;
use builder::StoreBuilder;
use chunk::Chunk;

/// Space reserved at the start of each chunk for the (patched) header.
const CHUNK_HEADER_RESERVE: usize = 256;

pub(crate) type BackgroundHandler = Arc<dyn Fn(&eyre::Report) + Send + Sync>;

#[derive(Debug, Default, Clone, Copy)]
struct FreedChunk {
    max_len_live: i64,
    page_count_live: i64,
}

struct CommitState {
    store_header: HashMap<String, String>,
    write_buffer: Option<WriteBuffer>,
    /// Version of the oldest chunk pinned during a temporary store.
    retain_chunk_version: Option<i64>,
}

pub(crate) struct StoreState {
    file: RwLock<Option<FileStore>>,
    file_backed: bool,
    read_only: bool,
    cache: Option<LirsCache<Arc<Page>>>,
    compressor: Lz4Compressor,
    compress: bool,
    page_split_size: usize,
    unsaved_page_count_max: usize,
    background_exception_handler: Option<BackgroundHandler>,

    creation_time: AtomicU64,
    current_version: AtomicI64,
    last_committed_version: AtomicI64,
    last_stored_version: AtomicI64,
    current_store_version: AtomicI64,
    last_store_time: AtomicU64,
    unsaved_page_count: AtomicUsize,
    last_map_id: AtomicU32,
    last_chunk_id: AtomicU32,
    root_chunk_start: AtomicU64,
    retention_time: AtomicU64,
    retain_version: AtomicI64,
    write_delay: AtomicI64,
    reuse_space: AtomicBool,
    closed: AtomicBool,
    meta_changed: AtomicBool,

    meta: Arc<MapInner>,
    maps: RwLock<HashMap<u32, Arc<MapInner>>>,
    chunks: RwLock<HashMap<u32, Chunk>>,
    freed_page_space: Mutex<BTreeMap<i64, HashMap<u32, FreedChunk>>>,
    commit: Mutex<CommitState>,
    meta_lock: Mutex<()>,
    open_map_lock: Mutex<()>,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl StoreState {
    pub(crate) fn new(
        file: Option<FileStore>,
        cfg: &builder::StoreConfig,
    ) -> Arc<StoreState> {
        let file_backed = file.is_some();
        let unsaved_max = if cfg.write_buffer_mb == 0 {
            0
        } else {
            (cfg.write_buffer_mb * 1024 * 1024) / cfg.page_split_size.max(1)
        };
        Arc::new_cyclic(|weak| StoreState {
            file: RwLock::new(file),
            file_backed,
            read_only: cfg.read_only,
            cache: (cfg.cache_size_mb > 0)
                .then(|| LirsCache::new(cfg.cache_size_mb * 1024 * 1024)),
            compressor: Lz4Compressor,
            compress: cfg.compress,
            page_split_size: cfg.page_split_size,
            unsaved_page_count_max: unsaved_max,
            background_exception_handler: cfg.background_exception_handler.clone(),
            creation_time: AtomicU64::new(0),
            current_version: AtomicI64::new(0),
            last_committed_version: AtomicI64::new(0),
            last_stored_version: AtomicI64::new(-1),
            current_store_version: AtomicI64::new(-1),
            last_store_time: AtomicU64::new(0),
            unsaved_page_count: AtomicUsize::new(0),
            last_map_id: AtomicU32::new(0),
            last_chunk_id: AtomicU32::new(0),
            root_chunk_start: AtomicU64::new(0),
            retention_time: AtomicU64::new(cfg.retention_time_ms),
            retain_version: AtomicI64::new(-1),
            // distinct from any real setting, so the first set_write_delay
            // call always takes effect
            write_delay: AtomicI64::new(i64::MIN),
            reuse_space: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            meta_changed: AtomicBool::new(false),
            meta: MapInner::new(0, 0, string_type(), string_type(), weak.clone(), false),
            maps: RwLock::new(HashMap::new()),
            chunks: RwLock::new(HashMap::new()),
            freed_page_space: Mutex::new(BTreeMap::new()),
            commit: Mutex::new(CommitState {
                store_header: HashMap::new(),
                write_buffer: None,
                retain_chunk_version: None,
            }),
            meta_lock: Mutex::new(()),
            open_map_lock: Mutex::new(()),
        })
    }

    // ----- small accessors -----

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            store_bail!(ErrorCode::Closed, "this store is closed");
        }
        Ok(())
    }

    pub(crate) fn current_version(&self) -> i64 {
        self.current_version.load(Ordering::SeqCst)
    }

    pub(crate) fn committed_version(&self) -> i64 {
        self.last_committed_version.load(Ordering::SeqCst)
    }

    pub(crate) fn page_split_size(&self) -> usize {
        self.page_split_size
    }

    pub(crate) fn has_file(&self) -> bool {
        self.file_backed
    }

    pub(crate) fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub(crate) fn unsaved_page_count(&self) -> usize {
        self.unsaved_page_count.load(Ordering::Relaxed)
    }

    pub(crate) fn register_unsaved_page(&self) {
        self.unsaved_page_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn mark_changed(&self, map_id: u32) {
        if map_id == 0 {
            self.meta_changed.store(true, Ordering::Release);
        }
    }

    fn mark_meta_changed(&self) {
        self.mark_changed(0);
    }

    pub(crate) fn get_retain_version(&self) -> i64 {
        let v = self.retain_version.load(Ordering::SeqCst);
        let store_version = self.current_store_version.load(Ordering::SeqCst);
        if store_version > -1 {
            v.min(store_version)
        } else {
            v
        }
    }

    fn time_ms(&self) -> u64 {
        now_millis().saturating_sub(self.creation_time.load(Ordering::Acquire))
    }

    fn with_file<T>(&self, f: impl FnOnce(&FileStore) -> Result<T>) -> Result<T> {
        let guard = self.file.read();
        match guard.as_ref() {
            Some(file) => f(file),
            None => Err(StoreError::new(
                ErrorCode::Closed,
                "the store file is closed",
            )),
        }
    }

    pub(crate) fn meta_map(&self) -> Map {
        Map {
            inner: self.meta.clone(),
        }
    }

    fn meta_put(&self, key: &str, value: impl Into<String>) -> Result<()> {
        let _lock = self.meta_lock.lock();
        self.meta_map().put(key, value.into())?;
        Ok(())
    }

    fn meta_remove(&self, key: &str) -> Result<()> {
        let _lock = self.meta_lock.lock();
        self.meta_map().remove(key)?;
        Ok(())
    }

    fn meta_get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .meta_map()
            .get(key)?
            .and_then(|v| v.as_str().map(str::to_owned)))
    }

    // ----- opening -----

    pub(crate) fn init_file(self: &Arc<Self>) -> Result<()> {
        let size = self.with_file(|f| Ok(f.size()))?;
        if size == 0 {
            let now = now_millis();
            self.creation_time.store(now, Ordering::Release);
            self.last_store_time.store(0, Ordering::Release);
            let mut cs = self.commit.lock();
            cs.store_header
                .insert("H".to_owned(), "3".to_owned());
            cs.store_header
                .insert("blockSize".to_owned(), BLOCK_SIZE.to_string());
            cs.store_header
                .insert("format".to_owned(), FORMAT_WRITE.to_string());
            cs.store_header
                .insert("creationTime".to_owned(), now.to_string());
            self.write_store_header(&mut cs)?;
        } else {
            {
                let mut cs = self.commit.lock();
                self.read_store_header(&mut cs)?;
                let format = kvmap::read_u64(&cs.store_header, "format", 1)?;
                if format > FORMAT_WRITE && !self.read_only {
                    store_bail!(
                        ErrorCode::UnsupportedFormat,
                        "the write format {} is larger than the supported format {}, \
                         and the file was not opened in read-only mode",
                        format,
                        FORMAT_WRITE
                    );
                }
                let format_read = kvmap::read_u64(&cs.store_header, "formatRead", format)?;
                if format_read > FORMAT_READ {
                    store_bail!(
                        ErrorCode::UnsupportedFormat,
                        "the read format {} is larger than the supported format {}",
                        format_read,
                        FORMAT_READ
                    );
                }
            }
            if self.root_chunk_start.load(Ordering::Acquire) > 0 {
                self.read_meta()?;
            }
        }
        if let Some(rollback) = self.meta_get("rollbackOnOpen")? {
            let version: i64 = rollback
                .parse()
                .map_err(|_| StoreError::new(ErrorCode::FileCorrupt, "bad rollbackOnOpen marker"))?;
            debug!(version, "rolling back uncommitted data flushed before the crash");
            self.rollback_to(version)?;
        }
        self.last_store_time.store(self.time_ms(), Ordering::Release);
        self.last_committed_version
            .store(self.current_version(), Ordering::SeqCst);
        Ok(())
    }

    fn read_store_header(&self, cs: &mut CommitState) -> Result<()> {
        self.current_version.store(-1, Ordering::SeqCst);
        let mut newest_chunk: i64 = -1;
        let size = self.with_file(|f| Ok(f.size()))?;
        if size < 2 * BLOCK_SIZE as u64 {
            store_bail!(
                ErrorCode::FileCorrupt,
                "store file is too short: {} bytes",
                size
            );
        }
        let mut candidates: Vec<Vec<u8>> = Vec::with_capacity(3);
        candidates.push(self.with_file(|f| f.read_fully(size - BLOCK_SIZE as u64, BLOCK_SIZE))?);
        let first = self.with_file(|f| f.read_fully(0, 2 * BLOCK_SIZE))?;
        candidates.push(first[..BLOCK_SIZE].to_vec());
        candidates.push(first[BLOCK_SIZE..].to_vec());

        for bytes in candidates {
            let Ok(text) = std::str::from_utf8(&bytes) else {
                continue;
            };
            let text = text.trim_end_matches(['\0', '\n', ' ']).trim();
            let Some(fletcher_at) = text.rfind(",fletcher:") else {
                continue;
            };
            let Ok(mut m) = kvmap::parse(text) else {
                continue;
            };
            let Some(stored) = m.remove("fletcher") else {
                continue;
            };
            let Ok(check) = u64::from_str_radix(&stored, 16) else {
                continue;
            };
            let prefix = &text.as_bytes()[..fletcher_at];
            if fletcher32(prefix, prefix.len() / 2 * 2) != check as u32 {
                continue;
            }
            let Ok(chunk) = kvmap::read_u64(&m, "chunk", 0) else {
                continue;
            };
            if (chunk as i64) > newest_chunk {
                newest_chunk = chunk as i64;
                self.root_chunk_start
                    .store(kvmap::read_u64(&m, "rootChunk", 0)?, Ordering::Release);
                self.creation_time
                    .store(kvmap::read_u64(&m, "creationTime", 0)?, Ordering::Release);
                self.last_map_id
                    .store(kvmap::read_u64(&m, "lastMapId", 0)? as u32, Ordering::Release);
                self.current_version
                    .store(kvmap::read_u64(&m, "version", 0)? as i64, Ordering::SeqCst);
                cs.store_header = m;
            }
        }
        if self.current_version() < 0 {
            store_bail!(ErrorCode::FileCorrupt, "store header is corrupt");
        }
        self.last_stored_version.store(-1, Ordering::SeqCst);
        Ok(())
    }

    fn store_header_bytes(&self, cs: &mut CommitState) -> Result<Vec<u8>> {
        cs.store_header.insert(
            "lastMapId".to_owned(),
            self.last_map_id.load(Ordering::Acquire).to_string(),
        );
        cs.store_header.insert(
            "chunk".to_owned(),
            self.last_chunk_id.load(Ordering::Acquire).to_string(),
        );
        cs.store_header.insert(
            "rootChunk".to_owned(),
            self.root_chunk_start.load(Ordering::Acquire).to_string(),
        );
        cs.store_header
            .insert("version".to_owned(), self.current_version().to_string());

        let mut keys: Vec<&String> = cs.store_header.keys().collect();
        keys.sort();
        let mut s = String::new();
        for key in keys {
            kvmap::append(&mut s, key, &cs.store_header[key]);
        }
        let bytes = s.as_bytes();
        let check = fletcher32(bytes, bytes.len() / 2 * 2);
        kvmap::append_hex(&mut s, "fletcher", check as u64);
        let bytes = s.into_bytes();
        if bytes.len() > BLOCK_SIZE {
            store_bail!(ErrorCode::UnsupportedFormat, "store header too large");
        }
        Ok(bytes)
    }

    fn write_store_header(&self, cs: &mut CommitState) -> Result<()> {
        let bytes = self.store_header_bytes(cs)?;
        let mut block = vec![0u8; 2 * BLOCK_SIZE];
        block[..bytes.len()].copy_from_slice(&bytes);
        block[BLOCK_SIZE..BLOCK_SIZE + bytes.len()].copy_from_slice(&bytes);
        self.with_file(|f| f.write_fully(0, &block))
    }

    fn read_chunk_header(&self, pos: u64) -> Result<Chunk> {
        let size = self.with_file(|f| Ok(f.size()))?;
        if pos >= size {
            store_bail!(
                ErrorCode::FileCorrupt,
                "chunk position {} beyond the end of the file",
                pos
            );
        }
        let len = (BLOCK_SIZE as u64).min(size - pos) as usize;
        let bytes = self.with_file(|f| f.read_fully(pos, len))?;
        Chunk::read_header(&bytes, pos)
    }

    fn read_meta(self: &Arc<Self>) -> Result<()> {
        self.chunks.write().clear();
        let root_chunk_start = self.root_chunk_start.load(Ordering::Acquire);
        let header = self.read_chunk_header(root_chunk_start)?;
        if header.block == u64::MAX {
            store_bail!(ErrorCode::FileCorrupt, "chunk {} is invalid", header.id);
        }
        self.last_chunk_id.store(header.id, Ordering::Release);
        self.chunks.write().insert(header.id, header.clone());
        self.meta.set_root_pos(header.meta_root_pos, -1)?;

        // the meta entry of the newest chunk was written before the chunk was
        // placed; patch it from the actual header
        let stored = self
            .meta_get(&Chunk::meta_key(header.id))?
            .ok_or_else(|| StoreError::new(ErrorCode::FileCorrupt, "newest chunk not in meta"))?;
        let mut newest = Chunk::from_string(&stored)?;
        newest.block = header.block;
        newest.len = header.len;
        newest.meta_root_pos = header.meta_root_pos;
        newest.page_count = header.page_count;
        newest.page_count_live = header.page_count_live;
        newest.max_length = header.max_length;
        newest.max_len_live = header.max_len_live;
        self.chunks.write().insert(newest.id, newest);

        // chunks may be referenced recursively while loading; collect keys
        // first
        let mut records = Vec::new();
        let mut cursor = self
            .meta_map()
            .key_iterator(Some(Value::from("chunk.")))?;
        while let Some(key) = cursor.next()? {
            let Some(name) = key.as_str() else { break };
            if !name.starts_with("chunk.") {
                break;
            }
            if let Some(s) = self.meta_get(name)? {
                records.push(s);
            }
        }
        for s in records {
            let c = Chunk::from_string(&s)?;
            let mut chunks = self.chunks.write();
            if !chunks.contains_key(&c.id) {
                if c.block == u64::MAX {
                    store_bail!(ErrorCode::FileCorrupt, "chunk {} is invalid", c.id);
                }
                chunks.insert(c.id, c);
            }
        }

        // rebuild the free-space map, and queue fully dead chunks
        let chunks: Vec<Chunk> = self.chunks.read().values().cloned().collect();
        for c in &chunks {
            self.with_file(|f| {
                f.mark_used(c.start_pos(), c.extent_bytes());
                Ok(())
            })?;
            if c.page_count_live == 0 {
                self.register_freed_page(self.current_version(), c.id, 0, 0);
            }
        }
        debug!(
            chunks = chunks.len(),
            version = self.current_version(),
            "store recovered"
        );
        Ok(())
    }

    // ----- chunks and pages -----

    fn get_chunk(&self, chunk_id: u32) -> Result<Chunk> {
        if let Some(c) = self.chunks.read().get(&chunk_id) {
            return Ok(c.clone());
        }
        let Some(s) = self.meta_get(&Chunk::meta_key(chunk_id))? else {
            store_bail!(ErrorCode::FileCorrupt, "chunk {} not found", chunk_id);
        };
        let c = Chunk::from_string(&s)?;
        if c.block == u64::MAX {
            store_bail!(ErrorCode::FileCorrupt, "chunk {} is invalid", chunk_id);
        }
        self.chunks.write().insert(c.id, c.clone());
        Ok(c)
    }

    fn chunk_for_version(&self, version: i64) -> Option<Chunk> {
        let chunks = self.chunks.read();
        let mut id = self.last_chunk_id.load(Ordering::Acquire);
        loop {
            let c = chunks.get(&id)?;
            if c.version <= version {
                return Some(c.clone());
            }
            if id == 0 {
                return None;
            }
            id -= 1;
        }
    }

    pub(crate) fn read_page(&self, map: &MapInner, pos: u64) -> Result<Arc<Page>> {
        if pos == 0 {
            store_bail!(ErrorCode::FileCorrupt, "position 0");
        }
        if let Some(cache) = &self.cache {
            if let Some(p) = cache.get(pos) {
                return Ok(p);
            }
        }
        let c = self.get_chunk(pos_chunk_id(pos))?;
        let file_pos = c.start_pos() + pos_offset(pos) as u64;
        let size = self.with_file(|f| Ok(f.size()))?;
        if file_pos >= size {
            store_bail!(
                ErrorCode::FileCorrupt,
                "page position {} beyond the end of the file",
                file_pos
            );
        }
        let len = pos_max_length(pos).min(size - file_pos) as usize;
        let bytes = self.with_file(|f| f.read_fully(file_pos, len))?;
        let page = Arc::new(Page::read(
            &bytes,
            pos,
            map.id,
            &*map.key_type,
            &*map.value_type,
            &self.compressor,
        )?);
        if let Some(cache) = &self.cache {
            cache.insert(pos, page.clone(), page.memory());
        }
        Ok(page)
    }

    pub(crate) fn remove_page(&self, map_id: u32, pos: u64) {
        if pos == 0 {
            // the page only ever existed in memory
            let _ = self
                .unsaved_page_count
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                    Some(n.saturating_sub(1))
                });
            return;
        }
        if let Some(cache) = &self.cache {
            cache.remove(pos);
        }
        let mut version = self.current_version();
        let store_version = self.current_store_version.load(Ordering::SeqCst);
        if map_id == 0 && store_version >= 0 {
            // meta pages freed while storing belong to the stored version,
            // so the superseded chunk can be reclaimed
            version = store_version;
        }
        self.register_freed_page(version, pos_chunk_id(pos), pos_max_length(pos) as i64, 1);
    }

    fn register_freed_page(&self, version: i64, chunk_id: u32, max_len_live: i64, count: i64) {
        let mut freed = self.freed_page_space.lock();
        let f = freed
            .entry(version)
            .or_default()
            .entry(chunk_id)
            .or_default();
        f.max_len_live -= max_len_live;
        f.page_count_live -= count;
    }

    // ----- maps -----

    pub(crate) fn open_map(
        self: &Arc<Self>,
        name: &str,
        key_type: Arc<dyn DataType>,
        value_type: Arc<dyn DataType>,
    ) -> Result<Map> {
        self.check_open()?;
        let _lock = self.open_map_lock.lock();
        if let Some(x) = self.meta_get(&format!("name.{}", name))? {
            let id: u32 = x
                .parse()
                .map_err(|_| StoreError::new(ErrorCode::FileCorrupt, "bad map id in meta"))?;
            if let Some(existing) = self.maps.read().get(&id) {
                return Ok(Map {
                    inner: existing.clone(),
                });
            }
            let config = self
                .meta_get(&format!("map.{}", id))?
                .ok_or_else(|| StoreError::new(ErrorCode::FileCorrupt, "map config missing"))?;
            let c = kvmap::parse(&config)?;
            let create_version = kvmap::read_u64(&c, "createVersion", 0)? as i64;
            let inner = MapInner::new(
                id,
                create_version,
                key_type,
                value_type,
                Arc::downgrade(self),
                self.read_only,
            );
            let root = self
                .meta_get(&format!("root.{}", id))?
                .map(|r| r.parse::<u64>())
                .transpose()
                .map_err(|_| StoreError::new(ErrorCode::FileCorrupt, "bad root position"))?
                .unwrap_or(0);
            inner.set_root_pos(root, -1)?;
            self.maps.write().insert(id, inner.clone());
            Ok(Map { inner })
        } else {
            let id = self.last_map_id.fetch_add(1, Ordering::SeqCst) + 1;
            let create_version = self.current_version();
            let inner = MapInner::new(
                id,
                create_version,
                key_type,
                value_type,
                Arc::downgrade(self),
                self.read_only,
            );
            let mut config = String::new();
            kvmap::append(&mut config, "name", name);
            if create_version != 0 {
                kvmap::append_u64(&mut config, "createVersion", create_version as u64);
            }
            self.meta_put(&format!("map.{}", id), config)?;
            self.meta_put(&format!("name.{}", name), id.to_string())?;
            self.mark_meta_changed();
            self.maps.write().insert(id, inner.clone());
            Ok(Map { inner })
        }
    }

    pub(crate) fn has_map(&self, name: &str) -> Result<bool> {
        Ok(self.meta_get(&format!("name.{}", name))?.is_some())
    }

    pub(crate) fn map_name(&self, id: u32) -> Result<Option<String>> {
        let Some(config) = self.meta_get(&format!("map.{}", id))? else {
            return Ok(None);
        };
        Ok(kvmap::parse(&config)?.get("name").cloned())
    }

    pub(crate) fn remove_map(&self, id: u32) -> Result<()> {
        let name = self.map_name(id)?;
        self.mark_meta_changed();
        self.meta_remove(&format!("map.{}", id))?;
        if let Some(name) = name {
            self.meta_remove(&format!("name.{}", name))?;
        }
        self.meta_remove(&format!("root.{}", id))?;
        self.maps.write().remove(&id);
        Ok(())
    }

    pub(crate) fn rename_map(&self, id: u32, new_name: &str) -> Result<()> {
        self.check_open()?;
        if id == 0 {
            store_bail!(ErrorCode::Internal, "renaming the meta map is not allowed");
        }
        let old_name = self
            .map_name(id)?
            .ok_or_else(|| StoreError::new(ErrorCode::FileCorrupt, "map config missing"))?;
        if old_name == new_name {
            return Ok(());
        }
        if self.has_map(new_name)? {
            store_bail!(
                ErrorCode::Internal,
                "a map named {:?} already exists",
                new_name
            );
        }
        self.mark_meta_changed();
        self.meta_remove(&format!("name.{}", old_name))?;
        let mut config = String::new();
        kvmap::append(&mut config, "name", new_name);
        let create_version = self
            .maps
            .read()
            .get(&id)
            .map(|m| m.create_version)
            .unwrap_or(0);
        if create_version != 0 {
            kvmap::append_u64(&mut config, "createVersion", create_version as u64);
        }
        self.meta_put(&format!("map.{}", id), config)?;
        self.meta_put(&format!("name.{}", new_name), id.to_string())?;
        Ok(())
    }

    /// Materializes a read-only view of a map at a version that is no longer
    /// retained in memory, by reading the meta map stored with that version.
    pub(crate) fn open_map_version(
        self: &Arc<Self>,
        version: i64,
        template: &Arc<MapInner>,
    ) -> Result<Map> {
        let old_meta = self.get_meta_map_version(version)?;
        let root = old_meta
            .get(format!("root.{}", template.id))?
            .and_then(|v| v.as_str().and_then(|s| s.parse::<u64>().ok()))
            .unwrap_or(0);
        let inner = MapInner::new(
            template.id,
            template.create_version,
            template.key_type.clone(),
            template.value_type.clone(),
            Arc::downgrade(self),
            true,
        );
        inner.set_root_pos(root, version)?;
        Ok(Map { inner })
    }

    fn get_meta_map_version(self: &Arc<Self>, version: i64) -> Result<Map> {
        let Some(c) = self.chunk_for_version(version) else {
            store_bail!(ErrorCode::UnknownVersion, "unknown version {}", version);
        };
        let header = self.read_chunk_header(c.start_pos())?;
        let inner = MapInner::new(
            0,
            0,
            string_type(),
            string_type(),
            Arc::downgrade(self),
            true,
        );
        inner.set_root_pos(header.meta_root_pos, version)?;
        Ok(Map { inner })
    }

    // ----- committing -----

    pub(crate) fn has_unsaved_changes(&self) -> bool {
        if self.meta_changed.load(Ordering::Acquire) {
            return true;
        }
        let last_stored = self.last_stored_version.load(Ordering::SeqCst);
        for m in self.maps.read().values() {
            if !m.is_closed() {
                let v = m.version();
                if v >= 0 && v > last_stored {
                    return true;
                }
            }
        }
        false
    }

    pub(crate) fn increment_version(&self) -> i64 {
        self.current_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Marks the changes committed and increments the version. Writes to
    /// disk immediately only when the write delay is zero; otherwise the
    /// background writer (or an explicit [`StoreState::store`]) persists
    /// them.
    pub(crate) fn commit(self: &Arc<Self>) -> Result<i64> {
        let v = self.increment_version();
        self.last_committed_version.store(v, Ordering::SeqCst);
        if self.write_delay.load(Ordering::Acquire) == 0 {
            self.store_internal(false)?;
        }
        Ok(v)
    }

    pub(crate) fn store(self: &Arc<Self>) -> Result<i64> {
        self.check_open()?;
        self.store_internal(false)
    }

    /// Called before every map write; flushes (as uncommitted, temporary
    /// data) when the write buffer budget is exhausted.
    pub(crate) fn before_write(self: &Arc<Self>) -> Result<()> {
        if !self.file_backed {
            return Ok(());
        }
        if self.current_store_version.load(Ordering::SeqCst) >= 0 {
            return Ok(());
        }
        if self.unsaved_page_count_max > 0
            && self.unsaved_page_count.load(Ordering::Relaxed) > self.unsaved_page_count_max
        {
            self.store_internal(true)?;
        }
        Ok(())
    }

    pub(crate) fn store_in_background(self: &Arc<Self>) {
        if self.closed.load(Ordering::Acquire) || self.unsaved_page_count() == 0 {
            return;
        }
        if self.last_stored_version.load(Ordering::SeqCst)
            >= self.last_committed_version.load(Ordering::SeqCst)
        {
            return;
        }
        let delay = self.write_delay.load(Ordering::Acquire).max(0) as u64;
        if self.time_ms() <= self.last_store_time.load(Ordering::Acquire) + delay {
            return;
        }
        if !self.has_unsaved_changes() {
            return;
        }
        if let Err(e) = self.store_internal(true) {
            warn!(error = %e, "background store failed");
            if let Some(handler) = &self.background_exception_handler {
                handler(&e);
            }
        }
    }

    fn store_internal(self: &Arc<Self>, temp: bool) -> Result<i64> {
        let mut cs = self.commit.lock();
        if self.closed.load(Ordering::Acquire) {
            return Ok(self.current_version());
        }
        if !self.file_backed {
            return Ok(self.increment_version());
        }
        if self.current_store_version.load(Ordering::SeqCst) >= 0 {
            return Ok(self.current_version());
        }
        if !self.has_unsaved_changes() {
            return Ok(self.current_version());
        }
        if self.read_only {
            store_bail!(ErrorCode::WritingFailed, "this store is read-only");
        }
        self.current_store_version
            .store(self.current_version(), Ordering::SeqCst);
        let result = self.store_now(temp, &mut cs);
        // reset in any case, to keep the store usable after a failed write
        self.current_store_version.store(-1, Ordering::SeqCst);
        result
    }

    fn store_now(self: &Arc<Self>, temp: bool, cs: &mut CommitState) -> Result<i64> {
        let current_unsaved = self.unsaved_page_count.load(Ordering::Relaxed);
        let store_version = self.current_store_version.load(Ordering::SeqCst);
        let version = self.increment_version();
        let mut time = self.time_ms();
        self.last_store_time.store(time, Ordering::Release);

        if temp {
            self.meta_put(
                "rollbackOnOpen",
                self.last_committed_version.load(Ordering::SeqCst).to_string(),
            )?;
            // pin the oldest chunk so rollback data is not overwritten
            cs.retain_chunk_version = self
                .chunks
                .read()
                .values()
                .map(|c| c.version)
                .min();
        } else {
            self.last_committed_version.store(version, Ordering::SeqCst);
            self.meta_remove("rollbackOnOpen")?;
            cs.retain_chunk_version = None;
        }

        // the previous chunk's live counts changed since it was written;
        // refresh its meta entry now
        let last_chunk_id = self.last_chunk_id.load(Ordering::Acquire);
        let last_chunk = self.chunks.read().get(&last_chunk_id).cloned();
        if let Some(lc) = last_chunk {
            self.meta_put(&Chunk::meta_key(lc.id), lc.as_string())?;
            // never go backward in time
            time = time.max(lc.time);
        }

        let chunk_id = last_chunk_id + 1;
        self.last_chunk_id.store(chunk_id, Ordering::Release);
        let mut c = Chunk::new(chunk_id);
        c.time = time;
        c.version = version;
        c.map_id = self.last_map_id.load(Ordering::Acquire);
        self.chunks.write().insert(c.id, c.clone());
        self.meta_put(&Chunk::meta_key(c.id), c.as_string())?;

        // collect the maps whose snapshot at the stored version is unsaved
        let maps_list: Vec<Arc<MapInner>> = self.maps.read().values().cloned().collect();
        let last_stored = self.last_stored_version.load(Ordering::SeqCst);
        let mut changed: Vec<(Arc<MapInner>, Arc<Page>)> = Vec::new();
        for m in maps_list {
            if m.is_closed() || m.create_version > store_version {
                continue;
            }
            let v = m.version();
            if v >= 0 && v >= last_stored {
                m.wait_until_written();
                let snapshot = m.open_version_internal(store_version)?;
                let (root, _) = snapshot.inner.root_snapshot();
                if root.pos() == 0 {
                    changed.push((m, root));
                }
            }
        }
        for (m, root) in &changed {
            let placeholder = if root.total_count() == 0 {
                "0".to_owned()
            } else {
                u64::MAX.to_string()
            };
            self.meta_put(&format!("root.{}", m.id), placeholder)?;
        }

        let removed = self.apply_freed_space(store_version, time, cs)?;

        let mut buf = cs.write_buffer.take().unwrap_or_default();
        buf.clear();
        buf.put_slice(&c.header_bytes(CHUNK_HEADER_RESERVE)?);

        let compressor: Option<&dyn Compressor> =
            self.compress.then_some(&self.compressor as &dyn Compressor);
        let mut written: Vec<Arc<Page>> = Vec::new();
        for (m, root) in &changed {
            if root.total_count() > 0 {
                let pos = root.write_unsaved_recursive(
                    &mut c,
                    &mut buf,
                    m.id,
                    &*m.key_type,
                    &*m.value_type,
                    compressor,
                    &mut written,
                )?;
                self.meta_put(&format!("root.{}", m.id), pos.to_string())?;
            }
        }
        self.meta_put(&Chunk::meta_key(c.id), c.as_string())?;

        // the meta root is written last; its own position lands in the
        // patched chunk header rather than in the meta map
        let (meta_root, _) = self.meta.root_snapshot();
        let meta_pos = meta_root.write_unsaved_recursive(
            &mut c,
            &mut buf,
            0,
            &*self.meta.key_type,
            &*self.meta.value_type,
            compressor,
            &mut written,
        )?;
        c.meta_root_pos = meta_pos;

        let chunk_body_len = buf.len();
        let total_chunk_bytes =
            (chunk_body_len + CHUNK_FOOTER_LENGTH).div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
        c.len = (total_chunk_bytes / BLOCK_SIZE) as u32;
        let full_len = total_chunk_bytes + BLOCK_SIZE;

        // the space of fully dead chunks can be reclaimed now
        for x in &removed {
            if x.block != u64::MAX {
                self.with_file(|f| {
                    f.free(x.start_pos(), x.extent_bytes());
                    Ok(())
                })?;
            }
        }

        let end = self.end_position();
        let file_pos = if self.reuse_space.load(Ordering::Acquire) {
            self.with_file(|f| Ok(f.allocate(full_len as u64)))?
        } else {
            self.with_file(|f| {
                f.mark_used(end, full_len as u64);
                Ok(end)
            })?
        };
        let store_at_end = file_pos + full_len as u64 >= end;

        c.block = file_pos / BLOCK_SIZE as u64;
        self.root_chunk_start.store(file_pos, Ordering::Release);
        self.chunks.write().insert(c.id, c.clone());
        self.revert_temp(store_version);

        buf.pad_to(total_chunk_bytes - CHUNK_FOOTER_LENGTH);
        buf.put_slice(&c.footer_bytes());
        buf.patch(0, &c.header_bytes(CHUNK_HEADER_RESERVE)?);

        let header_bytes = self.store_header_bytes(cs)?;
        buf.put_slice(&header_bytes);
        buf.pad_to(full_len);

        self.with_file(|f| f.write_fully(file_pos, buf.as_slice()))?;
        if buf.capacity() <= WRITE_BUFFER_KEEP_LIMIT {
            cs.write_buffer = Some(buf);
        }

        if !store_at_end {
            self.write_store_header(cs)?;
            self.shrink_file_if_possible(1)?;
        }

        // release the in-memory tree references; reads now go through the
        // cache and the file
        for p in &written {
            p.write_end();
            if let Some(cache) = &self.cache {
                cache.insert(p.pos(), p.clone(), p.memory());
            }
        }

        let _ = self
            .unsaved_page_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(current_unsaved))
            });

        if !temp {
            self.meta_changed.store(false, Ordering::Release);
            self.last_stored_version.store(store_version, Ordering::SeqCst);
        }
        debug!(
            chunk = c.id,
            version,
            blocks = c.len,
            pages = c.page_count,
            temp,
            "chunk written"
        );
        Ok(version)
    }

    fn can_overwrite_chunk(&self, c: &Chunk, time: u64, cs: &CommitState) -> bool {
        if c.time + self.retention_time.load(Ordering::Acquire) > time {
            return false;
        }
        if let Some(retain_version) = cs.retain_chunk_version {
            if c.version > retain_version {
                return false;
            }
        }
        true
    }

    /// Applies the pending freed-page deltas for versions up to the stored
    /// one, returning the chunks that became fully dead and reclaimable.
    fn apply_freed_space(
        &self,
        store_version: i64,
        time: u64,
        cs: &CommitState,
    ) -> Result<Vec<Chunk>> {
        let mut removed = Vec::new();
        loop {
            let mut modified: Vec<Chunk> = Vec::new();
            {
                let mut freed_map = self.freed_page_space.lock();
                let versions: Vec<i64> = freed_map
                    .range(..=store_version)
                    .map(|(v, _)| *v)
                    .collect();
                for v in versions {
                    let freed = freed_map.remove(&v).unwrap();
                    let mut chunks = self.chunks.write();
                    for (chunk_id, f) in freed {
                        let Some(c) = chunks.get_mut(&chunk_id) else {
                            continue; // already removed
                        };
                        c.max_len_live += f.max_len_live;
                        c.page_count_live += f.page_count_live;
                        if c.page_count_live < 0 {
                            store_bail!(
                                ErrorCode::Internal,
                                "corrupt page count {} in chunk {}",
                                c.page_count_live,
                                c.id
                            );
                        }
                        if c.max_len_live < 0 {
                            store_bail!(
                                ErrorCode::Internal,
                                "corrupt live length {} in chunk {}",
                                c.max_len_live,
                                c.id
                            );
                        }
                        modified.push(c.clone());
                    }
                }
            }
            if modified.is_empty() {
                break;
            }
            for c in &modified {
                if c.max_len_live == 0 {
                    if self.can_overwrite_chunk(c, time, cs) {
                        removed.push(c.clone());
                        self.chunks.write().remove(&c.id);
                        self.meta_remove(&Chunk::meta_key(c.id))?;
                    } else {
                        // not reclaimable yet; try again in the next version
                        self.register_freed_page(store_version + 1, c.id, 0, 0);
                    }
                } else {
                    self.meta_put(&Chunk::meta_key(c.id), c.as_string())?;
                }
            }
        }
        Ok(removed)
    }

    fn revert_temp(&self, store_version: i64) {
        self.freed_page_space
            .lock()
            .retain(|&v, _| v > store_version);
        for m in self.maps.read().values() {
            m.remove_unused_old_versions(self);
        }
    }

    fn end_position(&self) -> u64 {
        let mut end = (2 * BLOCK_SIZE) as u64;
        for c in self.chunks.read().values() {
            if c.block != u64::MAX {
                end = end.max(c.start_pos() + c.extent_bytes());
            }
        }
        end
    }

    fn shrink_file_if_possible(&self, min_percent: u64) -> Result<()> {
        let end = self.end_position();
        self.with_file(|f| {
            let size = f.size();
            if end >= size {
                return Ok(());
            }
            if min_percent > 0 && size - end < BLOCK_SIZE as u64 {
                return Ok(());
            }
            let saved_percent = 100 - end * 100 / size;
            if saved_percent < min_percent {
                return Ok(());
            }
            f.truncate(end)
        })
    }

    pub(crate) fn sync(&self) -> Result<()> {
        self.with_file(FileStore::sync)
    }

    // ----- rollback -----

    fn is_known_version(self: &Arc<Self>, version: i64) -> bool {
        if version > self.current_version() || version < 0 {
            return false;
        }
        if version == self.current_version() || self.chunks.read().is_empty() {
            return true;
        }
        if self.chunk_for_version(version).is_none() {
            return false;
        }
        let Ok(old_meta) = self.get_meta_map_version(version) else {
            return false;
        };
        let current_meta = self.meta_map();
        let Ok(mut cursor) = old_meta.key_iterator(Some(Value::from("chunk."))) else {
            return false;
        };
        loop {
            match cursor.next() {
                Ok(Some(key)) => {
                    let Some(name) = key.as_str() else { return false };
                    if !name.starts_with("chunk.") {
                        return true;
                    }
                    match current_meta.contains_key(name) {
                        Ok(true) => {}
                        _ => return false,
                    }
                }
                Ok(None) => return true,
                Err(_) => return false,
            }
        }
    }

    /// Reverts to the beginning of the given version: all later changes,
    /// stored or not, are forgotten. Rolling back below the last stored
    /// version drops the newer chunks from the file. Version 0 removes all
    /// data.
    pub(crate) fn rollback_to(self: &Arc<Self>, version: i64) -> Result<()> {
        self.check_open()?;
        let mut cs = self.commit.lock();
        if version == 0 {
            for m in self.maps.read().values() {
                m.close();
            }
            {
                let mut st = self.meta.state.write();
                st.root = Arc::new(Page::empty_leaf());
                st.root_version = 0;
                st.old_roots.clear();
            }
            self.chunks.write().clear();
            self.maps.write().clear();
            self.freed_page_space.lock().clear();
            self.current_version.store(0, Ordering::SeqCst);
            self.last_committed_version.store(0, Ordering::SeqCst);
            self.last_stored_version.store(-1, Ordering::SeqCst);
            self.last_chunk_id.store(0, Ordering::Release);
            self.root_chunk_start.store(0, Ordering::Release);
            self.meta_changed.store(false, Ordering::Release);
            if self.file_backed {
                self.with_file(|f| {
                    f.clear()?;
                    Ok(())
                })?;
                self.write_store_header(&mut cs)?;
            }
            return Ok(());
        }
        if !self.is_known_version(version) {
            store_bail!(ErrorCode::UnknownVersion, "unknown version {}", version);
        }
        for m in self.maps.read().values() {
            m.rollback_to(self, version)?;
        }
        self.freed_page_space.lock().retain(|&v, _| v < version);
        self.meta.rollback_to(self, version)?;
        self.meta_changed.store(false, Ordering::Release);

        let mut load_from_file = false;
        let last_chunk_id = self.last_chunk_id.load(Ordering::Acquire);
        let mut remove_newer_than: i64 = -1;
        {
            let chunks = self.chunks.read();
            let mut id = last_chunk_id;
            while let Some(x) = chunks.get(&id) {
                if x.version >= version {
                    remove_newer_than = x.id as i64;
                }
                if id == 0 {
                    break;
                }
                id -= 1;
            }
        }
        if remove_newer_than >= 0 && last_chunk_id as i64 > remove_newer_than {
            self.revert_temp(version);
            load_from_file = true;
            let mut last = None;
            loop {
                let id = self.last_chunk_id.load(Ordering::Acquire);
                let c = self.chunks.read().get(&id).cloned();
                match c {
                    None => break,
                    Some(c) if (c.id as i64) <= remove_newer_than => {
                        last = Some(c);
                        break;
                    }
                    Some(c) => {
                        self.chunks.write().remove(&c.id);
                        self.with_file(|f| {
                            f.free(c.start_pos(), c.extent_bytes());
                            Ok(())
                        })?;
                        self.last_chunk_id.store(id - 1, Ordering::Release);
                    }
                }
            }
            if let Some(last) = last {
                self.root_chunk_start
                    .store(last.start_pos(), Ordering::Release);
                self.write_store_header(&mut cs)?;
                // overwrite the end-of-file header copy so a newer one is
                // never picked up again
                let bytes = self.store_header_bytes(&mut cs)?;
                let mut block = vec![0u8; BLOCK_SIZE];
                block[..bytes.len()].copy_from_slice(&bytes);
                let size = self.with_file(|f| Ok(f.size()))?;
                self.with_file(|f| f.write_fully(size, &block))?;
                self.read_store_header(&mut cs)?;
                drop(cs);
                self.read_meta()?;
                cs = self.commit.lock();
            }
        }
        let maps_list: Vec<Arc<MapInner>> = self.maps.read().values().cloned().collect();
        for m in maps_list {
            if m.create_version >= version {
                m.close();
                self.maps.write().remove(&m.id);
            } else if load_from_file {
                let root = self
                    .meta_get(&format!("root.{}", m.id))?
                    .and_then(|r| r.parse::<u64>().ok())
                    .unwrap_or(0);
                m.set_root_pos(root, -1)?;
            }
        }
        // the rollback may have reverted the previous chunk's stored
        // metadata as well
        let prev_id = self.last_chunk_id.load(Ordering::Acquire).wrapping_sub(1);
        let prev = self.chunks.read().get(&prev_id).cloned();
        if let Some(c) = prev {
            self.meta_put(&Chunk::meta_key(c.id), c.as_string())?;
        }
        drop(cs);
        self.current_version.store(version, Ordering::SeqCst);
        self.last_committed_version.store(version, Ordering::SeqCst);
        debug!(version, "rolled back");
        Ok(())
    }

    // ----- compaction -----

    /// Rewrites the live content of poorly filled chunks so their space can
    /// be reclaimed. Returns whether anything was rewritten.
    pub(crate) fn compact(self: &Arc<Self>, target_fill_rate: u32) -> Result<bool> {
        self.check_open()?;
        let old: Vec<Chunk> = {
            let cs = self.commit.lock();
            let chunks: Vec<Chunk> = self.chunks.read().values().cloned().collect();
            if chunks.is_empty() {
                return Ok(false);
            }
            let max_len_sum: u64 = chunks.iter().map(|c| c.max_length).sum::<u64>().max(1);
            let max_len_live_sum: i64 = chunks.iter().map(|c| c.max_len_live).sum();
            let total_fill_rate = (100 * max_len_live_sum.max(0) as u64 / max_len_sum) as u32;
            if total_fill_rate > target_fill_rate {
                return Ok(false);
            }
            let average_max = max_len_sum / chunks.len() as u64;
            let time = self.time_ms();
            let last_chunk_id = self.last_chunk_id.load(Ordering::Acquire);

            let mut old: Vec<Chunk> = chunks
                .into_iter()
                .filter(|c| self.can_overwrite_chunk(c, time, &cs))
                .map(|mut c| {
                    let age = (last_chunk_id - c.id + 1).max(1);
                    c.collect_priority = c.fill_rate() / age;
                    c
                })
                .collect();
            if old.is_empty() {
                return Ok(false);
            }
            old.sort_by_key(|c| c.collect_priority);

            // move roughly one average chunk's worth of live data
            let mut moved: i64 = 0;
            let mut cutoff = None;
            for c in &old {
                if cutoff.is_some() && moved + c.max_len_live > average_max as i64 {
                    break;
                }
                moved += c.max_len_live;
                cutoff = Some(c.id);
            }
            if let Some(cutoff) = cutoff {
                let keep = old.iter().position(|c| c.id == cutoff).unwrap() + 1;
                old.truncate(keep);
            }
            old
        };
        debug!(chunks = old.len(), "compacting");
        for c in &old {
            self.copy_live(c, &old)?;
        }
        self.store()?;
        Ok(true)
    }

    /// Rewrites every live key found in the pages of `chunk` through its
    /// owning map, so the next store writes the data into a fresh chunk.
    fn copy_live(self: &Arc<Self>, chunk: &Chunk, old: &[Chunk]) -> Result<()> {
        let data = self.with_file(|f| {
            f.read_fully(chunk.start_pos(), chunk.len as usize * BLOCK_SIZE)
        })?;
        let mut pos = data
            .iter()
            .take(crate::config::MAX_HEADER_LENGTH)
            .position(|&b| b == b'\n')
            .map(|i| i + 1)
            .ok_or_else(|| StoreError::new(ErrorCode::FileCorrupt, "corrupt chunk header"))?;
        self.mark_meta_changed();
        let mut remaining = chunk.page_count;
        while remaining > 0 && pos + 11 <= data.len() {
            let (page_len, _) = crate::btree::page::PagePrologue::parse(&data[pos..])?;
            let page_len = page_len as usize;
            if page_len < 11 || pos + page_len > data.len() {
                store_bail!(
                    ErrorCode::FileCorrupt,
                    "corrupt page of length {} in chunk {}",
                    page_len,
                    chunk.id
                );
            }
            let (map_id, _) = crate::encoding::decode_varint(&data[pos + 6..])?;
            let map = if map_id == 0 {
                Some(self.meta_map())
            } else {
                self.maps.read().get(&(map_id as u32)).map(|inner| Map {
                    inner: inner.clone(),
                })
            };
            let Some(map) = map else {
                // pages of maps that are not open are not moved; their live
                // counters keep the chunk alive
                pos += page_len;
                remaining -= 1;
                continue;
            };
            let page = Page::read(
                &data[pos..pos + page_len],
                crate::btree::page::page_pos(chunk.id, pos as u32, page_len as u32, 0),
                map_id as u32,
                &*map.inner.key_type,
                &*map.inner.value_type,
                &self.compressor,
            )?;
            for key in page.keys() {
                let Some(leaf_pos) = self.leaf_pos_of(&map, key)? else {
                    continue; // removed later on
                };
                if leaf_pos == 0 {
                    continue; // changed in memory, will be rewritten anyway
                }
                let leaf_chunk = pos_chunk_id(leaf_pos);
                if old.iter().any(|c| c.id == leaf_chunk) {
                    if map_id == 0 {
                        let _lock = self.meta_lock.lock();
                        if let Some(value) = map.remove(key.clone())? {
                            map.put(key.clone(), value)?;
                        }
                    } else if let Some(value) = map.remove(key.clone())? {
                        map.put(key.clone(), value)?;
                    }
                }
            }
            pos += page_len;
            remaining -= 1;
        }
        Ok(())
    }

    /// Position of the leaf currently holding `key`, or `None` if absent.
    fn leaf_pos_of(&self, map: &Map, key: &Value) -> Result<Option<u64>> {
        let (mut p, _) = map.inner.root_snapshot();
        loop {
            match p.binary_search(key, &*map.inner.key_type) {
                Ok(i) => {
                    if p.is_leaf() {
                        return Ok(Some(p.pos()));
                    }
                    let next = map.inner.child_page(&p, i + 1)?;
                    p = next;
                }
                Err(i) => {
                    if p.is_leaf() {
                        return Ok(None);
                    }
                    let next = map.inner.child_page(&p, i)?;
                    p = next;
                }
            }
        }
    }

    /// Physically moves chunks toward the start of the file without touching
    /// page contents, then shrinks the file. Chunks are moved irrespective
    /// of the retention time.
    pub(crate) fn compact_move_chunks(self: &Arc<Self>) -> Result<bool> {
        self.check_open()?;
        if self.chunks.read().is_empty() {
            return Ok(false);
        }
        let old_retention = self.retention_time.swap(0, Ordering::AcqRel);
        let old_reuse = self.reuse_space.load(Ordering::Acquire);
        let result = self.compact_move_chunks_inner();
        self.retention_time.store(old_retention, Ordering::Release);
        self.reuse_space.store(old_reuse, Ordering::Release);
        result
    }

    fn compact_move_chunks_inner(self: &Arc<Self>) -> Result<bool> {
        let time = self.time_ms();
        {
            let cs = self.commit.lock();
            let free: Vec<Chunk> = self
                .chunks
                .read()
                .values()
                .filter(|c| c.max_len_live == 0 && self.can_overwrite_chunk(c, time, &cs))
                .cloned()
                .collect();
            drop(cs);
            for c in free {
                self.chunks.write().remove(&c.id);
                self.meta_remove(&Chunk::meta_key(c.id))?;
                self.with_file(|f| {
                    f.free(c.start_pos(), c.extent_bytes());
                    Ok(())
                })?;
            }
        }
        if self.with_file(|f| Ok(f.fill_rate()))? == 100 {
            return Ok(false);
        }
        let first_free = self.with_file(|f| Ok(f.first_free()))?;
        let mut move_list: Vec<Chunk> = self
            .chunks
            .read()
            .values()
            .filter(|c| c.start_pos() > first_free)
            .cloned()
            .collect();
        move_list.sort_by_key(|c| c.block);

        // first pass: move the chunks to the end of the file, so their old
        // space becomes contiguous free space
        for c in &move_list {
            let end = self.end_position();
            self.relocate_chunk(c.clone(), Some(end))?;
        }
        // persist the metadata at the end of the file
        self.reuse_space.store(false, Ordering::Release);
        self.mark_meta_changed();
        self.store()?;
        self.sync()?;

        // second pass: move them into the reclaimed space near the start
        self.reuse_space.store(true, Ordering::Release);
        let move_list: Vec<Chunk> = {
            let chunks = self.chunks.read();
            move_list
                .iter()
                .filter_map(|c| chunks.get(&c.id).cloned())
                .collect()
        };
        for c in move_list {
            self.relocate_chunk(c, None)?;
        }
        self.mark_meta_changed();
        self.store()?;
        self.sync()?;
        self.shrink_file_if_possible(0)?;
        Ok(true)
    }

    /// Copies a chunk's bytes to `target` (or a first-fit allocation),
    /// patching header, footer, and the trailing store-header block.
    fn relocate_chunk(self: &Arc<Self>, mut c: Chunk, target: Option<u64>) -> Result<()> {
        let extent = c.extent_bytes();
        let old_start = c.start_pos();
        let mut bytes = self.with_file(|f| f.read_fully(old_start, extent as usize))?;
        let new_pos = match target {
            Some(end) => {
                self.with_file(|f| {
                    f.mark_used(end, extent);
                    Ok(())
                })?;
                end
            }
            None => self.with_file(|f| Ok(f.allocate(extent)))?,
        };
        self.with_file(|f| {
            f.free(old_start, extent);
            Ok(())
        })?;
        c.block = new_pos / BLOCK_SIZE as u64;

        let header = c.header_bytes(CHUNK_HEADER_RESERVE)?;
        bytes[..header.len()].copy_from_slice(&header);
        let footer_at = (c.len as usize) * BLOCK_SIZE - CHUNK_FOOTER_LENGTH;
        bytes[footer_at..footer_at + CHUNK_FOOTER_LENGTH].copy_from_slice(&c.footer_bytes());
        if self.root_chunk_start.load(Ordering::Acquire) == old_start {
            // moving the newest chunk; keep the headers pointing at it
            self.root_chunk_start.store(new_pos, Ordering::Release);
        }
        {
            let mut cs = self.commit.lock();
            let tail = self.store_header_bytes(&mut cs)?;
            let tail_at = (c.len as usize) * BLOCK_SIZE;
            bytes[tail_at..].fill(0);
            bytes[tail_at..tail_at + tail.len()].copy_from_slice(&tail);
        }
        self.with_file(|f| f.write_fully(new_pos, &bytes))?;
        self.chunks.write().insert(c.id, c.clone());
        self.meta_put(&Chunk::meta_key(c.id), c.as_string())?;
        Ok(())
    }

    // ----- settings -----

    pub(crate) fn get_store_version(&self) -> Result<u32> {
        self.check_open()?;
        Ok(self
            .meta_get("setting.storeVersion")?
            .and_then(|s| s.parse().ok())
            .unwrap_or(0))
    }

    pub(crate) fn set_store_version(&self, version: u32) -> Result<()> {
        self.check_open()?;
        self.mark_meta_changed();
        self.meta_put("setting.storeVersion", version.to_string())
    }

    pub(crate) fn set_retention_time(&self, ms: u64) {
        self.retention_time.store(ms, Ordering::Release);
    }

    pub(crate) fn get_retention_time(&self) -> u64 {
        self.retention_time.load(Ordering::Acquire)
    }

    pub(crate) fn set_retain_version(&self, version: i64) {
        self.retain_version.store(version, Ordering::SeqCst);
    }

    pub(crate) fn set_reuse_space(&self, reuse: bool) {
        self.reuse_space.store(reuse, Ordering::Release);
    }

    pub(crate) fn set_cache_size(&self, mb: usize) {
        if let Some(cache) = &self.cache {
            cache.set_max_memory(mb * 1024 * 1024);
        }
    }

    // ----- closing -----

    pub(crate) fn close_full(self: &Arc<Self>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.file_backed && !self.read_only {
            if self.current_store_version.load(Ordering::SeqCst) >= 0 {
                store_bail!(ErrorCode::WritingFailed, "cannot close while storing");
            }
            let committed = self.last_committed_version.load(Ordering::SeqCst);
            if self.has_unsaved_changes() || committed != self.current_version() {
                self.rollback_to(committed)?;
                self.meta_changed.store(true, Ordering::Release);
                self.store_internal(false)?;
            }
            // a clean close leaves the primary headers current, so recovery
            // does not depend on the end-of-file copy
            let mut cs = self.commit.lock();
            self.write_store_header(&mut cs)?;
        }
        self.close_store(true)
    }

    pub(crate) fn close_store(&self, shrink: bool) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _cs = self.commit.lock();
        if shrink && self.file_backed && !self.read_only {
            let _ = self.shrink_file_if_possible(0);
        }
        for m in self.maps.read().values() {
            m.close();
        }
        self.maps.write().clear();
        self.chunks.write().clear();
        self.meta.close();
        // dropping the file releases the lock
        *self.file.write() = None;
        Ok(())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// A persistent, log-structured store for ordered maps.
///
/// Open one with [`Store::open`] or through the [`StoreBuilder`]:
///
/// ```no_run
/// # fn main() -> eyre::Result<()> {
/// use thicketdb::Store;
///
/// let store = Store::builder()
///     .file_name("data.thicket")
///     .cache_size_mb(32)
///     .open()?;
/// let map = store.open_map("data")?;
/// map.put(1, "Hello")?;
/// store.commit()?;
/// store.close()?;
/// # Ok(())
/// # }
/// ```
pub struct Store {
    state: Arc<StoreState>,
    background: Mutex<Option<BackgroundWriter>>,
}

impl Store {
    /// Opens (creating if needed) a file-backed store with default settings.
    pub fn open(file_name: impl Into<std::path::PathBuf>) -> Result<Store> {
        Store::builder().file_name(file_name).open()
    }

    pub fn builder() -> StoreBuilder {
        StoreBuilder::new()
    }

    pub(crate) fn from_state(state: Arc<StoreState>) -> Store {
        Store {
            state,
            background: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> &Arc<StoreState> {
        &self.state
    }

    /// Opens a map by name with the default self-describing key and value
    /// types. The map is created if it does not exist yet.
    pub fn open_map(&self, name: &str) -> Result<Map> {
        self.state
            .open_map(name, crate::types::variant_type(), crate::types::variant_type())
    }

    /// Opens a map with explicit key and value types.
    pub fn open_map_with(
        &self,
        name: &str,
        key_type: Arc<dyn DataType>,
        value_type: Arc<dyn DataType>,
    ) -> Result<Map> {
        self.state.open_map(name, key_type, value_type)
    }

    pub fn has_map(&self, name: &str) -> Result<bool> {
        self.state.has_map(name)
    }

    /// The metadata map. For informational purposes; modifying it may
    /// corrupt the store.
    pub fn meta_map(&self) -> Map {
        self.state.meta_map()
    }

    /// Current version of the data. A new store starts at version 0.
    pub fn current_version(&self) -> i64 {
        self.state.current_version()
    }

    /// The last committed version.
    pub fn committed_version(&self) -> i64 {
        self.state.committed_version()
    }

    /// Increments the version without committing.
    pub fn increment_version(&self) -> i64 {
        self.state.increment_version()
    }

    /// Marks the current changes as committed and increments the version.
    /// Data is written to disk according to the write delay.
    pub fn commit(&self) -> Result<i64> {
        self.state.commit()
    }

    /// Persists all committed but unsaved changes now.
    pub fn store(&self) -> Result<i64> {
        self.state.store()
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.state.has_unsaved_changes()
    }

    /// Estimated number of unsaved pages.
    pub fn unsaved_page_count(&self) -> usize {
        self.state.unsaved_page_count()
    }

    /// Reverts to the beginning of the given version; see
    /// [`StoreState::rollback_to`] semantics in the module docs.
    pub fn rollback_to(&self, version: i64) -> Result<()> {
        self.state.rollback_to(version)
    }

    /// Rewrites poorly filled chunks when the overall fill rate is at or
    /// below the target percentage.
    pub fn compact(&self, target_fill_rate: u32) -> Result<bool> {
        self.state.compact(target_fill_rate)
    }

    /// Physically moves chunks next to each other and shrinks the file.
    pub fn compact_move_chunks(&self) -> Result<bool> {
        self.state.compact_move_chunks()
    }

    /// Forces all buffered writes to the storage device.
    pub fn sync(&self) -> Result<()> {
        self.state.sync()
    }

    pub fn get_store_version(&self) -> Result<u32> {
        self.state.get_store_version()
    }

    pub fn set_store_version(&self, version: u32) -> Result<()> {
        self.state.set_store_version(version)
    }

    /// How long dead chunks are retained before their space is reused.
    pub fn set_retention_time(&self, ms: u64) {
        self.state.set_retention_time(ms);
    }

    pub fn get_retention_time(&self) -> u64 {
        self.state.get_retention_time()
    }

    /// Oldest version to retain in memory; -1 retains everything back to the
    /// last stored version.
    pub fn set_retain_version(&self, version: i64) {
        self.state.set_retain_version(version);
    }

    /// Whether to overwrite reclaimed space (default) or only append.
    pub fn set_reuse_space(&self, reuse: bool) {
        self.state.set_reuse_space(reuse);
    }

    pub fn set_cache_size(&self, mb: usize) {
        self.state.set_cache_size(mb);
    }

    /// Maximum delay in milliseconds before committed changes are stored.
    /// 0 stores on every commit; a negative value disables automatic
    /// storing.
    pub fn set_write_delay(&self, ms: i64) {
        let current = self.state.write_delay.load(Ordering::Acquire);
        if current == ms {
            return;
        }
        self.state.write_delay.store(ms, Ordering::Release);
        let mut background = self.background.lock();
        if let Some(mut writer) = background.take() {
            writer.stop();
        }
        if ms > 0 && self.state.has_file() && !self.state.is_read_only() {
            let sleep = (ms as u64 / 10).max(1);
            *background = Some(BackgroundWriter::start(self.state.clone(), sleep));
        }
    }

    pub fn get_write_delay(&self) -> i64 {
        self.state.write_delay.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    pub fn is_read_only(&self) -> bool {
        self.state.is_read_only()
    }

    fn stop_background(&self) {
        if let Some(mut writer) = self.background.lock().take() {
            writer.stop();
        }
    }

    /// Closes the store. Committed but unsaved changes are written first;
    /// uncommitted changes are rolled back. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.state.is_closed() {
            return Ok(());
        }
        self.stop_background();
        self.state.close_full()
    }

    /// Closes without writing anything, ignoring all errors.
    pub fn close_immediately(&self) {
        self.stop_background();
        if let Err(e) = self.state.close_store(false) {
            if let Some(handler) = &self.state.background_exception_handler {
                handler(&e);
            }
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if !self.state.is_closed() {
            self.close_immediately();
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("version", &self.current_version())
            .field("closed", &self.is_closed())
            .finish()
    }
}
