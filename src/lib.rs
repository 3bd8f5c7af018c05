//! # ThicketDB: Log-Structured Multi-Version Key-Value Store
//!
//! ThicketDB keeps a forest of copy-on-write B-trees ("maps") in a single
//! append-oriented file and layers MVCC transactions on top. Its priorities:
//!
//! - **Crash-consistent commits**: a committed snapshot is written as one
//!   self-describing chunk; file headers are only updated after the chunk is
//!   durable, so recovery always finds either the previous version or the
//!   new one.
//! - **Cheap snapshots**: every mutation copies its page path and publishes
//!   a new root; readers pin a root and never block on writers.
//! - **Optimistic transactions**: row-level version triples and an undo log
//!   give snapshot-style reads and immediate write-conflict detection.
//!
//! ## Quick Start
//!
//! ```no_run
//! # fn main() -> eyre::Result<()> {
//! use thicketdb::Store;
//!
//! let store = Store::open("data.thicket")?;
//! let map = store.open_map("data")?;
//! map.put(1, "Hello")?;
//! map.put(2, "World")?;
//! store.commit()?;
//!
//! assert_eq!(map.get(1)?.unwrap().as_str(), Some("Hello"));
//! store.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────┐
//! │   Transactions (mvcc)                 │  row triples + undo log
//! ├───────────────────────────────────────┤
//! │   Store (store)                       │  chunks, commit, recovery,
//! │                                       │  compaction, background writer
//! ├───────────────────────────────────────┤
//! │   Copy-on-write B-tree (btree)        │  maps, pages, cursors
//! ├───────────────────────────────────────┤
//! │   Values & types (types)              │  tagged values, data types
//! ├───────────────────────────────────────┤
//! │   Storage (storage)                   │  locked file, free space,
//! │                                       │  encryption, LIRS page cache
//! └───────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! [ store header ][ store header ][ chunk 1 ][ chunk 2 ] ... [ header ]
//!   block 0         block 1                                   last block
//! ```
//!
//! Two header copies at the start survive a torn write of either block; one
//! more follows the newest chunk so recovery can find it by reading the end
//! of the file. Each chunk carries an ASCII header, densely packed pages, a
//! checksummed footer, and the meta-map snapshot of its version.
//!
//! ## Module Overview
//!
//! - [`store`]: the [`Store`] itself: commit protocol, recovery, rollback,
//!   compaction, background writer
//! - [`btree`]: ordered maps with versioned roots and rank-aware cursors
//! - [`mvcc`]: the [`TransactionStore`] MVCC layer
//! - [`types`]: the [`Value`] variant and pluggable data types
//! - [`storage`]: file backend, free-space tracking, page cache, encryption
//! - [`encoding`]: varints, ASCII header maps, Fletcher-32, compression

pub mod btree;
pub mod config;
pub mod encoding;
pub mod error;
pub mod mvcc;
pub mod storage;
pub mod store;
pub mod types;

pub use btree::{ChangeCursor, Cursor, Map};
pub use error::{ErrorCode, StoreError};
pub use mvcc::{Transaction, TransactionMap, TransactionStore, TxStatus};
pub use store::builder::StoreBuilder;
pub use store::Store;
pub use types::{DataType, Value};
