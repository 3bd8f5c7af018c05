//! # Multi-Version Concurrency Control
//!
//! The transaction layer turns plain maps into transactional maps with
//! snapshot-style visibility and row-level optimistic conflict detection.
//! It is built entirely on top of ordinary maps; nothing in the store core
//! knows about transactions.
//!
//! ## Row format
//!
//! A transactional map stores each row as a `(txId, logId, value)` triple,
//! where a `Null` value is a tombstone written by that transaction. The undo
//! log, a single map keyed by `[txId, logId]`, records
//! `(opType, mapId, key, oldTriple)` per write, enabling savepoint rollback
//! by replaying entries in descending log order.
//!
//! ## Visibility
//!
//! A reader resolves a row by walking from the newest triple backwards
//! through the undo log until it reaches a triple that is either its own
//! (below its read log id) or belongs to a transaction that is no longer
//! open. Readers never block on writers.
//!
//! ## Conflicts
//!
//! A writer fails immediately when the current triple belongs to another
//! open transaction; [`TransactionMap::put`] retries in one-millisecond
//! steps up to the configured lock timeout before giving up with
//! `LOCK_TIMEOUT`.
//!
//! ## State machine
//!
//! ```text
//!     [OPEN] --prepare--> [PREPARED] --commit--> [CLOSED]
//!        |                   |
//!        +--commit-----------+
//!        |                   |
//!        +--rollback---------+--> [CLOSED]
//! ```
//!
//! Open transactions (those with at least one undo-log entry) are persisted
//! in the `openTransactions` map, so prepared transactions survive a close
//! and can be committed or rolled back after reopening the store (two-phase
//! commit).

mod transaction;

pub use transaction::{
    Transaction, TransactionMap, TransactionStore, TxStatus, OP_ADD, OP_REMOVE, OP_SET,
};
