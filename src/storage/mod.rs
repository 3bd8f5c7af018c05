//! # Storage Layer
//!
//! The foundation under the B-tree and the commit engine:
//!
//! - [`file`]: the locked store file with positioned I/O, size tracking, the
//!   free-space interval list, and transparent encryption.
//! - [`free_space`]: the sorted interval list of free block ranges.
//! - [`encrypt`]: the per-position file cipher keyed from a hashed password.
//! - [`cache`]: the memory-weighted LIRS page cache with segment-local
//!   locking.
//!
//! Nothing in this layer knows about pages, chunks, or versions; it deals in
//! bytes, blocks, and positions only.

mod cache;
mod encrypt;
mod file;
mod free_space;

pub use cache::LirsCache;
pub use encrypt::FileCipher;
pub use file::FileStore;
pub use free_space::FreeSpaceList;
