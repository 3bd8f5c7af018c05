//! # Store Builder
//!
//! Fluent configuration for opening a [`Store`]. Every setting has a
//! sensible default; a builder with no file name opens a purely in-memory
//! store (useful for tests and scratch data; nothing is ever written).
//!
//! | Setting                        | Default       |
//! |--------------------------------|---------------|
//! | `file_name`                    | none (memory) |
//! | `encryption_key`               | none          |
//! | `read_only`                    | false         |
//! | `cache_size_mb`                | 16            |
//! | `compress_data`                | false         |
//! | `write_buffer_size_mb`         | 4             |
//! | `page_split_size`              | 6 KiB         |
//! | `write_delay_ms`               | 1000          |
//! | `retention_time_ms`            | 45000         |
//! | `background_exception_handler` | none          |

use std::path::PathBuf;
use std::sync::Arc;

use eyre::Result;

use super::{BackgroundHandler, Store, StoreState};
use crate::config::{
    DEFAULT_CACHE_SIZE_MB, DEFAULT_PAGE_SPLIT_SIZE, DEFAULT_RETENTION_TIME_MS,
    DEFAULT_WRITE_BUFFER_MB, DEFAULT_WRITE_DELAY_MS,
};
use crate::storage::FileStore;

pub(crate) struct StoreConfig {
    pub file_name: Option<PathBuf>,
    pub file_store: Option<FileStore>,
    pub encryption_key: Option<Vec<u8>>,
    pub read_only: bool,
    pub cache_size_mb: usize,
    pub compress: bool,
    pub write_buffer_mb: usize,
    pub page_split_size: usize,
    pub write_delay_ms: i64,
    pub retention_time_ms: u64,
    pub background_exception_handler: Option<BackgroundHandler>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            file_name: None,
            file_store: None,
            encryption_key: None,
            read_only: false,
            cache_size_mb: DEFAULT_CACHE_SIZE_MB,
            compress: false,
            write_buffer_mb: DEFAULT_WRITE_BUFFER_MB,
            page_split_size: DEFAULT_PAGE_SPLIT_SIZE,
            write_delay_ms: DEFAULT_WRITE_DELAY_MS as i64,
            retention_time_ms: DEFAULT_RETENTION_TIME_MS,
            background_exception_handler: None,
        }
    }
}

/// Builder for a [`Store`].
pub struct StoreBuilder {
    config: StoreConfig,
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self {
            config: StoreConfig::default(),
        }
    }

    /// Backs the store with the given file, created if missing. Without a
    /// file name the store lives in memory only.
    pub fn file_name(mut self, name: impl Into<PathBuf>) -> Self {
        self.config.file_name = Some(name.into());
        self
    }

    /// Uses an already opened file store instead of opening by name.
    pub fn file_store(mut self, file_store: FileStore) -> Self {
        self.config.file_store = Some(file_store);
        self
    }

    /// Encrypts the file with a key derived from this password. The buffer
    /// is zeroed during open, as early as possible.
    pub fn encryption_key(mut self, password: Vec<u8>) -> Self {
        self.config.encryption_key = Some(password);
        self
    }

    /// Opens read-only with a shared file lock, so concurrent readers are
    /// allowed but writers are excluded.
    pub fn read_only(mut self) -> Self {
        self.config.read_only = true;
        self
    }

    /// Read cache size in MiB; 0 disables the cache.
    pub fn cache_size_mb(mut self, mb: usize) -> Self {
        self.config.cache_size_mb = mb;
        self
    }

    /// Compresses page bodies before writing. Reading compressed stores
    /// works regardless of this setting.
    pub fn compress_data(mut self) -> Self {
        self.config.compress = true;
        self
    }

    /// Write buffer budget in MiB. When the unsaved page count outgrows
    /// `buffer / page_split_size`, changes are flushed as temporary data
    /// (rolled back on reopen unless committed).
    pub fn write_buffer_size_mb(mut self, mb: usize) -> Self {
        self.config.write_buffer_mb = mb;
        self
    }

    /// Page size in bytes at which a page is split. Pages holding a single
    /// entry may still exceed it.
    pub fn page_split_size(mut self, bytes: usize) -> Self {
        self.config.page_split_size = bytes;
        self
    }

    /// Maximum delay before committed changes are written by the background
    /// writer. 0 writes on every commit; negative disables automatic
    /// writing.
    pub fn write_delay_ms(mut self, ms: i64) -> Self {
        self.config.write_delay_ms = ms;
        self
    }

    /// Minimum age before a dead chunk's space may be reused.
    pub fn retention_time_ms(mut self, ms: u64) -> Self {
        self.config.retention_time_ms = ms;
        self
    }

    /// Receives errors raised by the background writer; they are never
    /// propagated to foreground callers.
    pub fn background_exception_handler(
        mut self,
        handler: impl Fn(&eyre::Report) + Send + Sync + 'static,
    ) -> Self {
        self.config.background_exception_handler = Some(Arc::new(handler));
        self
    }

    /// Opens the store.
    pub fn open(self) -> Result<Store> {
        let mut config = self.config;
        let file = match config.file_store.take() {
            Some(fs) => Some(fs),
            None => match &config.file_name {
                Some(path) => {
                    let mut key = config.encryption_key.take();
                    Some(FileStore::open(
                        path,
                        config.read_only,
                        key.as_deref_mut(),
                    )?)
                }
                None => None,
            },
        };
        let state = StoreState::new(file, &config);
        if state.has_file() {
            state.init_file()?;
        }
        let store = Store::from_state(state);
        store.set_write_delay(config.write_delay_ms);
        Ok(store)
    }
}

impl Default for StoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}
