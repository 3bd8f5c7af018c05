//! Transaction store, transactions, and transactional maps.
//!
//! Persistent state lives in three ordinary maps:
//!
//! - `settings`: `lastTransactionId`, flushed ahead in steps of 32 so that
//!   ids are never reused even after a crash (some ids are lost instead);
//! - `openTransactions`: `txId -> [status, name]`, one entry per transaction
//!   that has written at least one log entry;
//! - `undoLog`: `[txId, logId] -> [opType, mapId, key, oldTriple]`.
//!
//! On construction the store joins `openTransactions` with the undo log and
//! rebuilds handles for the transactions that were open when the store was
//! last written, restoring their next log id from the newest undo entry.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use eyre::{ensure, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;

use crate::btree::{Cursor, Map};
use crate::config::MAX_UNSAVED_PAGES;
use crate::error::{store_bail, ErrorCode, StoreError};
use crate::store::Store;
use crate::types::{long_type, string_type, variant_type, ArrayType, DataType, Value};

/// Operation type of an undo-log entry: the entry removed a row.
pub const OP_REMOVE: i64 = 0;
/// The entry added a row.
pub const OP_ADD: i64 = 1;
/// The entry changed an existing row.
pub const OP_SET: i64 = 2;

const LAST_TRANSACTION_ID: &str = "lastTransactionId";

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Open,
    Prepared,
    Closed,
}

impl TxStatus {
    fn as_i64(self) -> i64 {
        match self {
            TxStatus::Open => 0,
            TxStatus::Prepared => 1,
            TxStatus::Closed => 2,
        }
    }

    fn from_i64(v: i64) -> Result<TxStatus> {
        match v {
            0 => Ok(TxStatus::Open),
            1 => Ok(TxStatus::Prepared),
            2 => Ok(TxStatus::Closed),
            other => Err(StoreError::new(
                ErrorCode::FileCorrupt,
                format!("unknown transaction status {}", other),
            )),
        }
    }
}

/// The element type of a stored row: `[txId, logId, value]`.
fn triple_type() -> Arc<dyn DataType> {
    Arc::new(ArrayType::new(vec![
        long_type(),
        long_type(),
        variant_type(),
    ]))
}

struct TxInner {
    store: Arc<crate::store::StoreState>,
    settings: Map,
    open_transactions: Map,
    undo_log: Map,
    registry: Mutex<BTreeMap<i64, Transaction>>,
    lock_timeout: AtomicU64,
    last_transaction_id: AtomicI64,
    last_transaction_id_stored: AtomicI64,
}

/// A store that supports concurrent transactions on top of a [`Store`].
#[derive(Clone)]
pub struct TransactionStore {
    inner: Arc<TxInner>,
}

impl TransactionStore {
    /// Creates the transaction layer over a store, restoring any
    /// transactions that were open when the store was last written.
    pub fn new(store: &Store) -> Result<TransactionStore> {
        let store = store.state().clone();
        let settings = store.open_map("settings", string_type(), string_type())?;
        let open_transactions = store.open_map(
            "openTransactions",
            long_type(),
            Arc::new(ArrayType::new(vec![long_type(), string_type()])),
        )?;
        let undo_log = store.open_map(
            "undoLog",
            Arc::new(ArrayType::new(vec![long_type(), long_type()])),
            Arc::new(ArrayType::new(vec![
                long_type(),
                long_type(),
                variant_type(),
                triple_type(),
            ])),
        )?;
        let ts = TransactionStore {
            inner: Arc::new(TxInner {
                store,
                settings,
                open_transactions,
                undo_log,
                registry: Mutex::new(BTreeMap::new()),
                lock_timeout: AtomicU64::new(0),
                last_transaction_id: AtomicI64::new(0),
                last_transaction_id_stored: AtomicI64::new(0),
            }),
        };
        ts.init()?;
        Ok(ts)
    }

    fn init(&self) -> Result<()> {
        let inner = &self.inner;
        if let Some(s) = inner.settings.get(LAST_TRANSACTION_ID)? {
            let last: i64 = s
                .as_str()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| StoreError::new(ErrorCode::FileCorrupt, "bad transaction id"))?;
            inner.last_transaction_id.store(last, Ordering::SeqCst);
            inner
                .last_transaction_id_stored
                .store(last, Ordering::SeqCst);
        }
        if let Some(last_key) = inner.open_transactions.last_key()? {
            let last_open = last_key.as_long().unwrap_or(0);
            if last_open >= inner.last_transaction_id.load(Ordering::SeqCst) {
                store_bail!(ErrorCode::Internal, "last transaction not stored");
            }
        }
        let mut cursor = inner.open_transactions.key_iterator(None)?;
        while let Some(key) = cursor.next()? {
            let id = key
                .as_long()
                .ok_or_else(|| StoreError::new(ErrorCode::FileCorrupt, "bad transaction key"))?;
            let Some(data) = inner.open_transactions.get(key)? else {
                continue;
            };
            let fields = data.as_array().unwrap_or(&[]);
            let status = TxStatus::from_i64(fields.first().and_then(Value::as_long).unwrap_or(0))?;
            let name = fields.get(1).and_then(Value::as_str).map(str::to_owned);
            // find the transaction's newest undo entry
            let probe = Value::Array(vec![Value::Long(id + 1), Value::Long(-1)]);
            let Some(last) = inner.undo_log.floor_key(probe)? else {
                continue;
            };
            let entry = last.as_array().unwrap_or(&[]);
            if entry.first().and_then(Value::as_long) != Some(id) {
                continue;
            }
            let last_log_id = entry.get(1).and_then(Value::as_long).unwrap_or(-1);
            let t = Transaction::restored(
                Arc::downgrade(inner),
                id,
                status,
                name,
                last_log_id + 1,
                inner.store.current_version(),
            );
            t.inner.stored.store(true, Ordering::Release);
            inner.registry.lock().insert(id, t);
        }
        Ok(())
    }

    /// Begins a new transaction.
    pub fn begin(&self) -> Result<Transaction> {
        let id = self
            .inner
            .last_transaction_id
            .fetch_add(1, Ordering::SeqCst);
        Ok(Transaction::restored(
            Arc::downgrade(&self.inner),
            id,
            TxStatus::Open,
            None,
            0,
            self.inner.store.current_version(),
        ))
    }

    /// The currently open transactions that have pending writes, plus all
    /// transactions restored from a previous session, ordered by id.
    pub fn get_open_transactions(&self) -> Vec<Transaction> {
        self.inner.registry.lock().values().cloned().collect()
    }

    /// Milliseconds a blocked write waits for a row lock; 0 fails
    /// immediately.
    pub fn set_lock_timeout(&self, ms: u64) {
        self.inner.lock_timeout.store(ms, Ordering::Release);
    }

    pub fn lock_timeout(&self) -> u64 {
        self.inner.lock_timeout.load(Ordering::Acquire)
    }

    /// Persists the exact last transaction id and commits the underlying
    /// store, so no ids are lost across the restart.
    pub fn close(&self) -> Result<()> {
        self.inner.settings.put(
            LAST_TRANSACTION_ID,
            self.inner
                .last_transaction_id
                .load(Ordering::SeqCst)
                .to_string(),
        )?;
        self.inner.store.commit()?;
        Ok(())
    }
}

impl TxInner {
    /// Writes the transaction to the open-transactions map on its first log
    /// entry, and flushes the id high-water mark ahead in steps of 32.
    fn store_transaction(&self, t: &Transaction) -> Result<()> {
        if self.store.unsaved_page_count() > MAX_UNSAVED_PAGES {
            self.store.commit()?;
        }
        if t.inner.stored.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let id = t.id();
        self.write_status(id, t.status(), t.name())?;
        self.registry.lock().insert(id, t.clone());
        let last = self.last_transaction_id.load(Ordering::SeqCst);
        if last > self.last_transaction_id_stored.load(Ordering::SeqCst) {
            let stored = self
                .last_transaction_id_stored
                .fetch_add(32, Ordering::SeqCst)
                + 32;
            self.settings
                .put(LAST_TRANSACTION_ID, stored.to_string())?;
        }
        Ok(())
    }

    fn write_status(&self, id: i64, status: TxStatus, name: Option<String>) -> Result<()> {
        let name_value = match name {
            Some(n) => Value::Str(n),
            None => Value::Null,
        };
        self.open_transactions.put(
            id,
            Value::Array(vec![Value::Long(status.as_i64()), name_value]),
        )?;
        Ok(())
    }

    fn log(
        &self,
        t: &Transaction,
        log_id: i64,
        op_type: i64,
        map_id: u32,
        key: Value,
        old_triple: Value,
    ) -> Result<()> {
        self.store_transaction(t)?;
        self.undo_log.put(
            Value::Array(vec![Value::Long(t.id()), Value::Long(log_id)]),
            Value::Array(vec![
                Value::Long(op_type),
                Value::Long(map_id as i64),
                key,
                old_triple,
            ]),
        )?;
        Ok(())
    }

    fn prepare(&self, t: &Transaction) -> Result<()> {
        self.store_transaction(t)?;
        self.write_status(t.id(), TxStatus::Prepared, t.name())?;
        self.store.commit()?;
        Ok(())
    }

    fn set_transaction_name(&self, t: &Transaction, name: &str) -> Result<()> {
        self.store_transaction(t)?;
        self.write_status(t.id(), t.status(), Some(name.to_owned()))?;
        Ok(())
    }

    /// Reopens the underlying map an undo entry refers to, with the
    /// transactional triple value type.
    fn map_for_id(&self, map_id: u32) -> Result<Option<Map>> {
        let Some(name) = self.store.map_name(map_id)? else {
            return Ok(None);
        };
        Ok(Some(self.store.open_map(
            &name,
            variant_type(),
            triple_type(),
        )?))
    }

    fn commit(&self, t: &Transaction, max_log_id: i64) -> Result<()> {
        for log_id in 0..max_log_id {
            let undo_key = Value::Array(vec![Value::Long(t.id()), Value::Long(log_id)]);
            let Some(op) = self.undo_log.get(undo_key.clone())? else {
                continue;
            };
            let fields = op.as_array().unwrap_or(&[]);
            let op_type = fields.first().and_then(Value::as_long).unwrap_or(OP_SET);
            if op_type == OP_REMOVE {
                let map_id = fields.get(1).and_then(Value::as_long).unwrap_or(0) as u32;
                if let Some(map) = self.map_for_id(map_id)? {
                    let key = fields.get(2).cloned().unwrap_or(Value::Null);
                    // the entry may have been added again later on
                    if let Some(current) = map.get(key.clone())? {
                        let tombstone = current
                            .as_array()
                            .and_then(|a| a.get(2))
                            .is_some_and(Value::is_null);
                        if tombstone {
                            map.remove(key)?;
                        }
                    }
                }
            }
            self.undo_log.remove(undo_key)?;
        }
        self.end_transaction(t)
    }

    fn rollback(&self, t: &Transaction, max_log_id: i64) -> Result<()> {
        self.rollback_to(t, max_log_id, 0)?;
        self.end_transaction(t)
    }

    /// Replays undo entries in descending log order, restoring the previous
    /// triple (or deleting the row the transaction added).
    fn rollback_to(&self, t: &Transaction, max_log_id: i64, to_log_id: i64) -> Result<()> {
        for log_id in (to_log_id..max_log_id).rev() {
            let undo_key = Value::Array(vec![Value::Long(t.id()), Value::Long(log_id)]);
            let Some(op) = self.undo_log.get(undo_key.clone())? else {
                continue;
            };
            let fields = op.as_array().unwrap_or(&[]);
            let map_id = fields.get(1).and_then(Value::as_long).unwrap_or(0) as u32;
            if let Some(map) = self.map_for_id(map_id)? {
                let key = fields.get(2).cloned().unwrap_or(Value::Null);
                let old = fields.get(3).cloned().unwrap_or(Value::Null);
                if old.is_null() {
                    map.remove(key)?;
                } else {
                    map.put(key, old)?;
                }
            }
            self.undo_log.remove(undo_key)?;
        }
        Ok(())
    }

    fn end_transaction(&self, t: &Transaction) -> Result<()> {
        self.open_transactions.remove(t.id())?;
        self.registry.lock().remove(&t.id());
        Ok(())
    }

    fn is_transaction_open(&self, tx_id: i64) -> Result<bool> {
        self.open_transactions.contains_key(tx_id)
    }
}

struct TxState {
    store: Weak<TxInner>,
    id: i64,
    start_version: i64,
    status: Mutex<TxStatus>,
    name: Mutex<Option<String>>,
    log_id: AtomicI64,
    stored: AtomicBool,
}

/// One transaction. Clones share the same state; a transaction is not meant
/// to be used from multiple threads at once.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TxState>,
}

impl Transaction {
    fn restored(
        store: Weak<TxInner>,
        id: i64,
        status: TxStatus,
        name: Option<String>,
        log_id: i64,
        start_version: i64,
    ) -> Transaction {
        Transaction {
            inner: Arc::new(TxState {
                store,
                id,
                start_version,
                status: Mutex::new(status),
                name: Mutex::new(name),
                log_id: AtomicI64::new(log_id),
                stored: AtomicBool::new(false),
            }),
        }
    }

    fn store(&self) -> Result<Arc<TxInner>> {
        self.inner
            .store
            .upgrade()
            .ok_or_else(|| StoreError::new(ErrorCode::Closed, "the transaction store is gone"))
    }

    fn check_open(&self) -> Result<()> {
        if self.status() != TxStatus::Open {
            store_bail!(ErrorCode::Closed, "transaction {} is not open", self.id());
        }
        Ok(())
    }

    pub fn id(&self) -> i64 {
        self.inner.id
    }

    /// The store version at the time the transaction began.
    pub fn start_version(&self) -> i64 {
        self.inner.start_version
    }

    pub fn status(&self) -> TxStatus {
        *self.inner.status.lock()
    }

    pub fn name(&self) -> Option<String> {
        self.inner.name.lock().clone()
    }

    /// Names the transaction; the name is persisted with its status.
    pub fn set_name(&self, name: &str) -> Result<()> {
        self.check_open()?;
        self.store()?.set_transaction_name(self, name)?;
        *self.inner.name.lock() = Some(name.to_owned());
        Ok(())
    }

    /// Opens a transactional view over the named map.
    pub fn open_map(&self, name: &str) -> Result<TransactionMap> {
        self.check_open()?;
        let store = self.store()?;
        let map = store
            .store
            .open_map(name, variant_type(), triple_type())?;
        Ok(TransactionMap {
            tx: self.clone(),
            map_id: map.id(),
            map,
            read_log_id: Arc::new(AtomicI64::new(i64::MAX)),
        })
    }

    /// Returns the current log id as a savepoint token.
    pub fn set_savepoint(&self) -> Result<i64> {
        self.check_open()?;
        Ok(self.inner.log_id.load(Ordering::SeqCst))
    }

    /// Undoes every change made after the given savepoint.
    pub fn rollback_to_savepoint(&self, savepoint_id: i64) -> Result<()> {
        self.check_open()?;
        let max = self.inner.log_id.load(Ordering::SeqCst);
        self.store()?.rollback_to(self, max, savepoint_id)?;
        self.inner.log_id.store(savepoint_id, Ordering::SeqCst);
        Ok(())
    }

    /// Prepares the transaction for a two-phase commit: the status is
    /// persisted and the underlying store is committed, so the transaction
    /// survives a restart and can only be committed or rolled back.
    pub fn prepare(&self) -> Result<()> {
        self.check_open()?;
        self.store()?.prepare(self)?;
        *self.inner.status.lock() = TxStatus::Prepared;
        Ok(())
    }

    /// Commits the transaction; afterwards it is closed.
    pub fn commit(&self) -> Result<()> {
        if self.status() != TxStatus::Closed {
            let max = self.inner.log_id.load(Ordering::SeqCst);
            self.store()?.commit(self, max)?;
            *self.inner.status.lock() = TxStatus::Closed;
        }
        Ok(())
    }

    /// Rolls the transaction back; afterwards it is closed.
    pub fn rollback(&self) -> Result<()> {
        if self.status() != TxStatus::Closed {
            let max = self.inner.log_id.load(Ordering::SeqCst);
            self.store()?.rollback(self, max)?;
            *self.inner.status.lock() = TxStatus::Closed;
        }
        Ok(())
    }

    fn log(&self, op_type: i64, map_id: u32, key: Value, old_triple: Value) -> Result<()> {
        let log_id = self.inner.log_id.fetch_add(1, Ordering::SeqCst);
        self.store()?
            .log(self, log_id, op_type, map_id, key, old_triple)
    }

    fn log_id(&self) -> i64 {
        self.inner.log_id.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id())
            .field("status", &self.status())
            .finish()
    }
}

/// A transactional view over one map.
///
/// Reads resolve row triples against the owning transaction's read log id,
/// so a view pinned with [`TransactionMap::set_savepoint`] sees the state as
/// of that savepoint; its own later writes are included only once a new view
/// is opened. Writes are optimistic: they fail against rows owned by another
/// open transaction.
#[derive(Clone)]
pub struct TransactionMap {
    tx: Transaction,
    map: Map,
    map_id: u32,
    read_log_id: Arc<AtomicI64>,
}

impl TransactionMap {
    /// Pins reads to the given savepoint (log id).
    pub fn set_savepoint(&self, savepoint: i64) {
        self.read_log_id.store(savepoint, Ordering::SeqCst);
    }

    /// A clone of this view for the given transaction, pinned to the given
    /// savepoint.
    pub fn get_instance(&self, tx: &Transaction, savepoint: i64) -> TransactionMap {
        TransactionMap {
            tx: tx.clone(),
            map: self.map.clone(),
            map_id: self.map_id,
            read_log_id: Arc::new(AtomicI64::new(savepoint)),
        }
    }

    fn read_log_id(&self) -> i64 {
        self.read_log_id.load(Ordering::SeqCst)
    }

    /// The value visible to this view, or `None`.
    pub fn get(&self, key: impl Into<Value>) -> Result<Option<Value>> {
        self.get_at(key.into(), self.read_log_id())
    }

    /// The most recent value, regardless of the read savepoint.
    pub fn get_latest(&self, key: impl Into<Value>) -> Result<Option<Value>> {
        self.get_at(key.into(), i64::MAX)
    }

    pub fn contains_key(&self, key: impl Into<Value>) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn get_at(&self, key: Value, max_log_id: i64) -> Result<Option<Value>> {
        self.tx.check_open()?;
        let triple = self.get_triple(&key, max_log_id)?;
        Ok(triple
            .and_then(|t| t.as_array().and_then(|a| a.get(2).cloned()))
            .filter(|v| !v.is_null()))
    }

    /// Resolves the triple visible at `max_log_id` by following the undo
    /// log past uncommitted changes of other transactions (and past this
    /// transaction's own changes at or above the read log id).
    fn get_triple(&self, key: &Value, max_log_id: i64) -> Result<Option<Value>> {
        let store = self.tx.store()?;
        let mut data = self.map.get(key.clone())?;
        loop {
            let Some(d) = data else {
                // does not exist, or deleted by a committed transaction
                return Ok(None);
            };
            let fields = d.as_array().unwrap_or(&[]);
            let tx_id = fields.first().and_then(Value::as_long).unwrap_or(0);
            let log_id = fields.get(1).and_then(Value::as_long).unwrap_or(0);
            if tx_id == self.tx.id() && log_id < max_log_id {
                return Ok(Some(d));
            }
            if !store.is_transaction_open(tx_id)? {
                // committed
                return Ok(Some(d));
            }
            // fetch the value before the uncommitted change
            let undo_key = Value::Array(vec![Value::Long(tx_id), Value::Long(log_id)]);
            data = store
                .undo_log
                .get(undo_key)?
                .and_then(|u| u.as_array().and_then(|a| a.get(3).cloned()))
                .filter(|old| !old.is_null());
        }
    }

    /// Adds or changes a row, waiting up to the lock timeout for rows locked
    /// by another transaction. Returns the previously visible value.
    pub fn put(&self, key: impl Into<Value>, value: impl Into<Value>) -> Result<Option<Value>> {
        let value = value.into();
        ensure!(!value.is_null(), "the value may not be null");
        self.set(key.into(), Some(value))
    }

    /// Removes a row, with the same waiting behavior as
    /// [`TransactionMap::put`].
    pub fn remove(&self, key: impl Into<Value>) -> Result<Option<Value>> {
        self.set(key.into(), None)
    }

    fn set(&self, key: Value, value: Option<Value>) -> Result<Option<Value>> {
        self.tx.check_open()?;
        let mut started: Option<Instant> = None;
        loop {
            let old = self.get(key.clone())?;
            if self.try_set_internal(key.clone(), value.clone(), false)? {
                return Ok(old);
            }
            // the row is locked by an uncommitted transaction: wait until it
            // commits, or until the lock timeout
            let timeout = self.tx.store()?.lock_timeout.load(Ordering::Acquire);
            if timeout == 0 {
                store_bail!(ErrorCode::LockTimeout, "lock timeout on {:?}", key);
            }
            match started {
                None => started = Some(Instant::now()),
                Some(t) => {
                    if t.elapsed().as_millis() as u64 > timeout {
                        store_bail!(ErrorCode::LockTimeout, "lock timeout on {:?}", key);
                    }
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
            }
        }
    }

    /// Tries to add or change a row; fails if it is locked by another open
    /// transaction.
    pub fn try_put(&self, key: impl Into<Value>, value: impl Into<Value>) -> Result<bool> {
        let value = value.into();
        ensure!(!value.is_null(), "the value may not be null");
        self.try_set_internal(key.into(), Some(value), false)
    }

    /// Tries to remove a row; fails if it is locked by another open
    /// transaction.
    pub fn try_remove(&self, key: impl Into<Value>) -> Result<bool> {
        self.try_set_internal(key.into(), None, false)
    }

    /// Tries to set or remove a row. With `only_if_unchanged`, the write
    /// additionally requires that the row has not changed since the read
    /// savepoint (by this or any other transaction), the serializability
    /// check used for statement processing.
    pub fn try_set(
        &self,
        key: impl Into<Value>,
        value: Option<Value>,
        only_if_unchanged: bool,
    ) -> Result<bool> {
        self.try_set_internal(key.into(), value, only_if_unchanged)
    }

    fn try_set_internal(
        &self,
        key: Value,
        value: Option<Value>,
        only_if_unchanged: bool,
    ) -> Result<bool> {
        self.tx.check_open()?;
        let store = self.tx.store()?;
        let current = self.map.get(key.clone())?;
        if only_if_unchanged {
            let old = self.get_triple(&key, self.read_log_id())?;
            if !self.map.values_equal(old.as_ref(), current.as_ref()) {
                let Some(cur) = current.as_ref().and_then(Value::as_array) else {
                    // visible at the savepoint, removed by a committed
                    // transaction since
                    return Ok(false);
                };
                let tx_id = cur.first().and_then(Value::as_long).unwrap_or(0);
                if tx_id == self.tx.id() {
                    if value.is_none() {
                        // ignore removing an entry it already added or
                        // changed in the same statement
                        return Ok(true);
                    } else if cur.get(2).is_some_and(Value::is_null) {
                        // re-adding an entry removed in the same statement
                    } else {
                        return Ok(false);
                    }
                } else {
                    return Ok(false);
                }
            }
        }

        let current_is_tombstone = match &current {
            None => true,
            Some(c) => c
                .as_array()
                .and_then(|a| a.get(2))
                .map_or(true, Value::is_null),
        };
        let op_type = if current_is_tombstone {
            if value.is_none() {
                OP_SET
            } else {
                OP_ADD
            }
        } else if value.is_none() {
            OP_REMOVE
        } else {
            OP_SET
        };

        let new_triple = Value::Array(vec![
            Value::Long(self.tx.id()),
            Value::Long(self.tx.log_id()),
            value.unwrap_or(Value::Null),
        ]);
        match current {
            None => {
                let old = self.map.put_if_absent(key.clone(), new_triple)?;
                if old.is_none() {
                    self.tx.log(op_type, self.map_id, key, Value::Null)?;
                    return Ok(true);
                }
                Ok(false)
            }
            Some(cur) => {
                let tx_id = cur
                    .as_array()
                    .and_then(|a| a.first())
                    .and_then(Value::as_long)
                    .unwrap_or(0);
                if tx_id == self.tx.id() || !store.is_transaction_open(tx_id)? {
                    // own row, or the owner has committed: overwrite
                    if self.map.replace_if_equal(key.clone(), &cur, new_triple)? {
                        self.tx.log(op_type, self.map_id, key, cur)?;
                        return Ok(true);
                    }
                    // somebody else was faster
                    return Ok(false);
                }
                // the row belongs to another open transaction
                Ok(false)
            }
        }
    }

    /// Number of rows visible to this view. Scans the whole map.
    pub fn len(&self) -> Result<u64> {
        // TODO: keep a per-transaction delta against the committed row count
        // to avoid the full scan
        let mut count = 0;
        let mut cursor = self.map.key_iterator(None)?;
        while let Some(key) = cursor.next()? {
            if self.get(key)?.is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Iterates over the keys visible to this view, in order.
    pub fn key_iterator(&self, from: Option<Value>) -> Result<TxKeyCursor<'_>> {
        Ok(TxKeyCursor {
            map: self,
            cursor: self.map.key_iterator(from)?,
        })
    }

    /// First key of the underlying map, visible or not.
    pub fn first_key(&self) -> Result<Option<Value>> {
        self.map.first_key()
    }

    /// Last key of the underlying map, visible or not.
    pub fn last_key(&self) -> Result<Option<Value>> {
        self.map.last_key()
    }

    pub fn ceiling_key(&self, key: impl Into<Value>) -> Result<Option<Value>> {
        self.map.ceiling_key(key)
    }

    pub fn higher_key(&self, key: impl Into<Value>) -> Result<Option<Value>> {
        self.map.higher_key(key)
    }

    pub fn lower_key(&self, key: impl Into<Value>) -> Result<Option<Value>> {
        self.map.lower_key(key)
    }

    pub fn transaction(&self) -> &Transaction {
        &self.tx
    }
}

/// Ordered cursor over the keys visible to one transactional view.
pub struct TxKeyCursor<'a> {
    map: &'a TransactionMap,
    cursor: Cursor,
}

impl TxKeyCursor<'_> {
    pub fn next(&mut self) -> Result<Option<Value>> {
        while let Some(key) = self.cursor.next()? {
            if self.map.get(key.clone())?.is_some() {
                return Ok(Some(key));
            }
        }
        Ok(None)
    }
}
