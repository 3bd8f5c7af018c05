//! # File Backend
//!
//! `FileStore` wraps the single store file: positioned reads and writes, an
//! advisory lock, size tracking, the free-space interval list, and the
//! optional transparent encryption layer.
//!
//! Read-write opens take an exclusive lock; read-only opens take a shared
//! lock, so concurrent readers are allowed but a writer excludes everyone
//! else. The lock is released when the store (and therefore the `File`) is
//! dropped, on every exit path.
//!
//! All I/O is positioned (`read_at`/`write_at` style); there is no shared
//! seek cursor, so concurrent readers never interfere. Free-space state is
//! tracked in blocks internally; the byte-based API rounds lengths up.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use eyre::{ensure, Context, Result};
use fs2::FileExt as _;
use parking_lot::Mutex;

use super::encrypt::FileCipher;
use super::free_space::FreeSpaceList;
use crate::config::BLOCK_SIZE;

pub struct FileStore {
    file: File,
    file_name: String,
    read_only: bool,
    size: AtomicU64,
    free: Mutex<FreeSpaceList>,
    cipher: Option<FileCipher>,
}

impl FileStore {
    /// Opens (creating if missing) and locks the store file. If `key` is
    /// given, the file is transparently encrypted; the key buffer is zeroed
    /// before this returns.
    pub fn open(path: &Path, read_only: bool, key: Option<&mut [u8]>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(path)
            .wrap_err_with(|| format!("cannot open {}", path.display()))?;

        if read_only {
            file.try_lock_shared()
                .wrap_err_with(|| format!("cannot share-lock {}", path.display()))?;
        } else {
            file.try_lock_exclusive()
                .wrap_err_with(|| format!("cannot lock {} exclusively", path.display()))?;
        }

        let size = file.metadata()?.len();
        let cipher = key.map(FileCipher::from_password);
        Ok(Self {
            file,
            file_name: path.display().to_string(),
            read_only,
            size: AtomicU64::new(size),
            free: Mutex::new(FreeSpaceList::new()),
            cipher,
        })
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Reads exactly `len` bytes at `pos`, decrypting if needed.
    pub fn read_fully(&self, pos: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        read_at(&self.file, pos, &mut buf)
            .wrap_err_with(|| format!("read of {} bytes at {} failed", len, pos))?;
        if let Some(cipher) = &self.cipher {
            cipher.apply(pos, &mut buf);
        }
        Ok(buf)
    }

    /// Writes all of `data` at `pos`, encrypting if needed.
    pub fn write_fully(&self, pos: u64, data: &[u8]) -> Result<()> {
        ensure!(!self.read_only, "store file {} is read-only", self.file_name);
        if let Some(cipher) = &self.cipher {
            let mut enc = data.to_vec();
            cipher.apply(pos, &mut enc);
            write_at(&self.file, pos, &enc)
        } else {
            write_at(&self.file, pos, data)
        }
        .wrap_err_with(|| format!("write of {} bytes at {} failed", data.len(), pos))?;
        self.size.fetch_max(pos + data.len() as u64, Ordering::AcqRel);
        Ok(())
    }

    pub fn truncate(&self, len: u64) -> Result<()> {
        self.file
            .set_len(len)
            .wrap_err_with(|| format!("truncate of {} to {} failed", self.file_name, len))?;
        self.size.store(len, Ordering::Release);
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all().wrap_err("sync failed")
    }

    /// Marks the byte range `[pos, pos + len)` as in use.
    pub fn mark_used(&self, pos: u64, len: u64) {
        self.free.lock().mark_used(to_block(pos), blocks_of(len));
    }

    /// Returns the byte range `[pos, pos + len)` to the free pool.
    pub fn free(&self, pos: u64, len: u64) {
        self.free.lock().free(to_block(pos), blocks_of(len));
    }

    /// Allocates `len` bytes first-fit and returns the byte position.
    pub fn allocate(&self, len: u64) -> u64 {
        self.free.lock().allocate(blocks_of(len)) * BLOCK_SIZE as u64
    }

    /// Byte position of the first free region.
    pub fn first_free(&self) -> u64 {
        self.free.lock().first_free() * BLOCK_SIZE as u64
    }

    /// Percentage of the current file size that is in use.
    pub fn fill_rate(&self) -> u32 {
        let blocks = self.size() / BLOCK_SIZE as u64;
        self.free.lock().fill_rate(blocks)
    }

    /// Resets free-space tracking and truncates the file to the header
    /// blocks. Used by a rollback to version 0.
    pub fn clear(&self) -> Result<()> {
        self.free.lock().clear();
        self.truncate((2 * BLOCK_SIZE) as u64)
    }
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("file", &self.file_name)
            .field("size", &self.size())
            .field("read_only", &self.read_only)
            .field("encrypted", &self.cipher.is_some())
            .finish()
    }
}

fn to_block(pos: u64) -> u64 {
    debug_assert_eq!(pos % BLOCK_SIZE as u64, 0, "unaligned position {}", pos);
    pos / BLOCK_SIZE as u64
}

fn blocks_of(len: u64) -> u64 {
    len.div_ceil(BLOCK_SIZE as u64)
}

#[cfg(unix)]
fn read_at(file: &File, pos: u64, buf: &mut [u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, pos)
}

#[cfg(unix)]
fn write_at(file: &File, pos: u64, data: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, pos)
}

#[cfg(windows)]
fn read_at(file: &File, mut pos: u64, mut buf: &mut [u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_read(buf, pos)?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        pos += n as u64;
        buf = &mut buf[n..];
    }
    Ok(())
}

#[cfg(windows)]
fn write_at(file: &File, mut pos: u64, mut data: &[u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !data.is_empty() {
        let n = file.seek_write(data, pos)?;
        pos += n as u64;
        data = &data[n..];
    }
    Ok(())
}
