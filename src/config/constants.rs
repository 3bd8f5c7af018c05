//! # ThicketDB Configuration Constants
//!
//! This module centralizes the on-disk format constants and runtime defaults.
//! Constants that depend on each other are co-located so a change to one is
//! visible next to the values it constrains.
//!
//! ## Relationships
//!
//! ```text
//! BLOCK_SIZE (4096 bytes)
//!       │
//!       ├─> store headers occupy blocks 0 and 1; chunks start at block 2
//!       │
//!       ├─> chunk extents are whole blocks; every chunk is followed by one
//!       │   extra block carrying a store header copy
//!       │
//!       └─> MAX_HEADER_LENGTH and CHUNK_FOOTER_LENGTH must both fit in a
//!           single block
//!
//! DEFAULT_PAGE_SPLIT_SIZE (6 KiB)
//!       │
//!       └─> DEFAULT_WRITE_BUFFER_SIZE / pageSplitSize gives the unsaved-page
//!           count that triggers an automatic (temporary) store
//! ```

/// The physical block size. Store headers are written twice, one copy per
/// block, so a torn write of one block leaves the other readable.
pub const BLOCK_SIZE: usize = 4 * 1024;

/// Maximum length of a chunk header, including the terminating newline.
pub const MAX_HEADER_LENGTH: usize = 1024;

/// Length of the chunk footer written at the end of each chunk.
pub const CHUNK_FOOTER_LENGTH: usize = 128;

/// Number of reserved header blocks at the start of the file.
pub const HEADER_BLOCKS: usize = 2;

/// The file format this build writes.
pub const FORMAT_WRITE: u64 = 1;

/// The newest file format this build can read.
pub const FORMAT_READ: u64 = 1;

/// Default number of bytes a page may reach before a mutation splits it.
/// Pages holding a single entry can still exceed this.
pub const DEFAULT_PAGE_SPLIT_SIZE: usize = 6 * 1024;

/// Default read cache size, in MiB.
pub const DEFAULT_CACHE_SIZE_MB: usize = 16;

/// Number of independently locked cache segments.
pub const CACHE_SEGMENT_COUNT: usize = 16;

/// Default delay before committed changes are flushed by the background
/// writer, in milliseconds.
pub const DEFAULT_WRITE_DELAY_MS: u64 = 1000;

/// Default write buffer size, in MiB. When unsaved pages exceed
/// `writeBufferSize / pageSplitSize`, a temporary store is forced.
pub const DEFAULT_WRITE_BUFFER_MB: usize = 4;

/// Write buffers larger than this are discarded after use instead of pooled.
pub const WRITE_BUFFER_KEEP_LIMIT: usize = 4 * 1024 * 1024;

/// Default minimum age of a dead chunk before its storage is reused, in
/// milliseconds. A file system is assumed to have flushed its buffers within
/// this window.
pub const DEFAULT_RETENTION_TIME_MS: u64 = 45_000;

/// Unsaved-page budget of the transaction store; exceeding it while logging
/// an undo entry forces a store commit.
pub const MAX_UNSAVED_PAGES: usize = 4 * 1024;

const _: () = assert!(MAX_HEADER_LENGTH <= BLOCK_SIZE);
const _: () = assert!(CHUNK_FOOTER_LENGTH <= BLOCK_SIZE);
const _: () = assert!(DEFAULT_PAGE_SPLIT_SIZE < BLOCK_SIZE * 2);
