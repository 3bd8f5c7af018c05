//! Transaction-layer integration tests: visibility, savepoints, conflicts,
//! and two-phase commit across a reopen.

use tempfile::TempDir;
use thicketdb::{ErrorCode, Store, StoreError, TransactionStore, TxStatus, Value};

fn store_path(dir: &TempDir) -> std::path::PathBuf {
    dir.path().join("tx.thicket")
}

fn memory_store() -> Store {
    Store::builder().open().unwrap()
}

fn s(v: &str) -> Option<Value> {
    Some(Value::from(v))
}

#[test]
fn single_transaction_commit_and_rollback() {
    let store = memory_store();
    let ts = TransactionStore::new(&store).unwrap();

    // add, rollback
    let tx = ts.begin().unwrap();
    let m = tx.open_map("test").unwrap();
    m.put("1", "Hello").unwrap();
    assert_eq!(m.get("1").unwrap(), s("Hello"));
    m.put("2", "World").unwrap();
    assert_eq!(m.get("2").unwrap(), s("World"));
    tx.rollback().unwrap();

    let tx = ts.begin().unwrap();
    let m = tx.open_map("test").unwrap();
    assert_eq!(m.get("1").unwrap(), None);
    assert_eq!(m.get("2").unwrap(), None);

    // add, commit
    m.put("1", "Hello").unwrap();
    m.put("2", "World").unwrap();
    tx.commit().unwrap();

    // update + delete + insert, rollback
    let tx = ts.begin().unwrap();
    let m = tx.open_map("test").unwrap();
    m.put("1", "Hallo").unwrap();
    m.remove("2").unwrap();
    m.put("3", "!").unwrap();
    assert_eq!(m.get("1").unwrap(), s("Hallo"));
    assert_eq!(m.get("2").unwrap(), None);
    assert_eq!(m.get("3").unwrap(), s("!"));
    tx.rollback().unwrap();

    let tx = ts.begin().unwrap();
    let m = tx.open_map("test").unwrap();
    assert_eq!(m.get("1").unwrap(), s("Hello"));
    assert_eq!(m.get("2").unwrap(), s("World"));
    assert_eq!(m.get("3").unwrap(), None);

    // update + delete + insert, commit
    m.put("1", "Hallo").unwrap();
    m.remove("2").unwrap();
    m.put("3", "!").unwrap();
    tx.commit().unwrap();

    let tx = ts.begin().unwrap();
    let m = tx.open_map("test").unwrap();
    assert_eq!(m.get("1").unwrap(), s("Hallo"));
    assert_eq!(m.get("2").unwrap(), None);
    assert_eq!(m.get("3").unwrap(), s("!"));
    tx.rollback().unwrap();
    store.close().unwrap();
}

#[test]
fn savepoint_rollback_restores_the_observed_state() {
    let store = memory_store();
    let ts = TransactionStore::new(&store).unwrap();

    let tx = ts.begin().unwrap();
    let m = tx.open_map("test").unwrap();
    m.put("1", "Hello").unwrap();
    m.put("2", "World").unwrap();
    m.put("1", "Hallo").unwrap();
    m.remove("2").unwrap();
    m.put("3", "!").unwrap();
    let log_id = tx.set_savepoint().unwrap();
    m.put("1", "Hi").unwrap();
    m.put("2", ".").unwrap();
    m.remove("3").unwrap();

    tx.rollback_to_savepoint(log_id).unwrap();
    assert_eq!(m.get("1").unwrap(), s("Hallo"));
    assert_eq!(m.get("2").unwrap(), None);
    assert_eq!(m.get("3").unwrap(), s("!"));
    tx.rollback().unwrap();

    let tx = ts.begin().unwrap();
    let m = tx.open_map("test").unwrap();
    assert_eq!(m.get("1").unwrap(), None);
    assert_eq!(m.get("2").unwrap(), None);
    assert_eq!(m.get("3").unwrap(), None);
    store.close().unwrap();
}

#[test]
fn statement_level_visibility_and_duplicate_detection() {
    // each "statement" pins its reads to a savepoint; changes made within
    // the statement are only seen by the next one
    let store = memory_store();
    let ts = TransactionStore::new(&store).unwrap();
    let tx = ts.begin().unwrap();
    let m = tx.open_map("test").unwrap();

    // statement: insert 1 -> Hello, 2 -> World
    let sp = tx.set_savepoint().unwrap();
    let view = m.get_instance(&tx, sp);
    assert!(view.try_set("1", s("Hello"), true).unwrap());
    assert!(view.try_set("2", s("World"), true).unwrap());
    // not seen yet, within the same statement
    assert_eq!(view.get("1").unwrap(), None);
    assert_eq!(view.get("2").unwrap(), None);

    // next statement sees the inserts
    let sp = tx.set_savepoint().unwrap();
    let view = m.get_instance(&tx, sp);
    assert_eq!(view.get("1").unwrap(), s("Hello"));
    assert_eq!(view.get("2").unwrap(), s("World"));
    // shift every row by one key, delete/add style
    assert!(view.try_set("1", None, true).unwrap());
    assert!(view.try_set("2", s("Hello"), true).unwrap());
    assert_eq!(view.get("2").unwrap(), s("World"));
    // removing a row this statement already changed is ignored, but allowed
    assert!(view.try_set("2", None, true).unwrap());
    assert!(view.try_set("3", s("World"), true).unwrap());
    assert_eq!(view.get("1").unwrap(), s("Hello"));
    assert_eq!(view.get("3").unwrap(), None);

    // next statement sees the shifted state
    let sp = tx.set_savepoint().unwrap();
    let view = m.get_instance(&tx, sp);
    assert_eq!(view.get("1").unwrap(), None);
    assert_eq!(view.get("2").unwrap(), s("Hello"));
    assert_eq!(view.get("3").unwrap(), s("World"));

    // statement that would produce a duplicate key fails part-way and is
    // rolled back to its savepoint
    let start_update = tx.set_savepoint().unwrap();
    let view = m.get_instance(&tx, start_update);
    assert!(view.try_set("2", None, true).unwrap());
    assert!(view.try_set("1", s("Hello"), true).unwrap());
    assert!(view.try_set("3", None, true).unwrap());
    assert!(!view.try_set("1", s("World"), true).unwrap());
    tx.rollback_to_savepoint(start_update).unwrap();

    let sp = tx.set_savepoint().unwrap();
    let view = m.get_instance(&tx, sp);
    assert_eq!(view.get("1").unwrap(), None);
    assert_eq!(view.get("2").unwrap(), s("Hello"));
    assert_eq!(view.get("3").unwrap(), s("World"));

    tx.commit().unwrap();
    ts.close().unwrap();
    store.close().unwrap();
}

#[test]
fn concurrent_transactions_read_committed() {
    let store = memory_store();
    let ts = TransactionStore::new(&store).unwrap();

    let tx1 = ts.begin().unwrap();
    let m1 = tx1.open_map("test").unwrap();
    m1.put("1", "Hi").unwrap();
    m1.put("3", ".").unwrap();
    tx1.commit().unwrap();

    let tx1 = ts.begin().unwrap();
    let m1 = tx1.open_map("test").unwrap();
    m1.put("1", "Hello").unwrap();
    m1.put("2", "World").unwrap();
    m1.remove("3").unwrap();
    tx1.commit().unwrap();

    // a transaction that started before tx1's next commit reads old data
    let tx2 = ts.begin().unwrap();
    let m2 = tx2.open_map("test").unwrap();

    let tx1 = ts.begin().unwrap();
    let m1 = tx1.open_map("test").unwrap();
    m1.put("1", "Hallo").unwrap();
    m1.remove("2").unwrap();
    m1.put("3", "!").unwrap();

    assert_eq!(m2.get("1").unwrap(), s("Hello"));
    assert_eq!(m2.get("2").unwrap(), s("World"));
    assert_eq!(m2.get("3").unwrap(), None);

    tx1.commit().unwrap();

    // read committed: after the commit the same view sees the new data
    assert_eq!(m2.get("1").unwrap(), s("Hallo"));
    assert_eq!(m2.get("2").unwrap(), None);
    assert_eq!(m2.get("3").unwrap(), s("!"));
    store.close().unwrap();
}

#[test]
fn writers_conflict_on_rows_of_open_transactions() {
    let store = memory_store();
    let ts = TransactionStore::new(&store).unwrap();

    let tx1 = ts.begin().unwrap();
    let m1 = tx1.open_map("test").unwrap();
    assert!(m1.try_put("k", "v1").unwrap());

    let tx2 = ts.begin().unwrap();
    let m2 = tx2.open_map("test").unwrap();
    assert!(!m2.try_put("k", "v2").unwrap());
    assert!(!m2.try_remove("k").unwrap());
    // readers do not block: tx2 simply does not see the row
    assert_eq!(m2.get("k").unwrap(), None);

    // with a zero lock timeout, a blocking put fails immediately
    let err = m2.put("k", "v2").unwrap_err();
    assert_eq!(StoreError::code_of(&err), Some(ErrorCode::LockTimeout));

    tx1.commit().unwrap();
    // committed rows can be overwritten
    assert!(m2.try_put("k", "v2").unwrap());
    tx2.commit().unwrap();
    store.close().unwrap();
}

#[test]
fn lock_timeout_expires_while_the_owner_stays_open() {
    let store = memory_store();
    let ts = TransactionStore::new(&store).unwrap();
    ts.set_lock_timeout(30);

    let tx1 = ts.begin().unwrap();
    let m1 = tx1.open_map("test").unwrap();
    m1.put("k", "v1").unwrap();

    let tx2 = ts.begin().unwrap();
    let m2 = tx2.open_map("test").unwrap();
    let started = std::time::Instant::now();
    let err = m2.put("k", "v2").unwrap_err();
    assert_eq!(StoreError::code_of(&err), Some(ErrorCode::LockTimeout));
    assert!(started.elapsed().as_millis() >= 30);
    tx1.rollback().unwrap();
    store.close().unwrap();
}

#[test]
fn rollback_leaves_no_trace_in_later_snapshots() {
    let store = memory_store();
    let ts = TransactionStore::new(&store).unwrap();

    let tx = ts.begin().unwrap();
    let m = tx.open_map("test").unwrap();
    m.put("a", "1").unwrap();
    tx.commit().unwrap();

    let tx = ts.begin().unwrap();
    let m = tx.open_map("test").unwrap();
    m.put("a", "2").unwrap();
    m.put("b", "3").unwrap();
    m.remove("a").unwrap();
    tx.rollback().unwrap();

    let tx = ts.begin().unwrap();
    let m = tx.open_map("test").unwrap();
    assert_eq!(m.get("a").unwrap(), s("1"));
    assert_eq!(m.get("b").unwrap(), None);
    assert_eq!(m.len().unwrap(), 1);
    store.close().unwrap();
}

#[test]
fn visible_keys_iterate_in_order() {
    let store = memory_store();
    let ts = TransactionStore::new(&store).unwrap();

    let tx = ts.begin().unwrap();
    let m = tx.open_map("test").unwrap();
    for i in 0..10i64 {
        m.put(i, i).unwrap();
    }
    tx.commit().unwrap();

    let tx1 = ts.begin().unwrap();
    let m1 = tx1.open_map("test").unwrap();
    m1.put(100, 100i64).unwrap(); // uncommitted, invisible to others
    m1.remove(3).unwrap();

    let tx2 = ts.begin().unwrap();
    let m2 = tx2.open_map("test").unwrap();
    let mut seen = Vec::new();
    let mut cursor = m2.key_iterator(None).unwrap();
    while let Some(k) = cursor.next().unwrap() {
        seen.push(k.as_long().unwrap());
    }
    assert_eq!(seen, (0..10).collect::<Vec<i64>>());
    assert_eq!(m2.len().unwrap(), 10);

    // the writer sees its own changes
    assert_eq!(m1.len().unwrap(), 10); // 10 - removed 3 + added 100
    tx1.rollback().unwrap();
    store.close().unwrap();
}

#[test]
fn two_phase_commit_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = store_path(&dir);

    {
        let store = Store::open(&path).unwrap();
        let ts = TransactionStore::new(&store).unwrap();
        let tx = ts.begin().unwrap();
        assert_eq!(tx.id(), 0);
        assert_eq!(tx.name(), None);
        tx.set_name("first transaction").unwrap();
        assert_eq!(tx.name().as_deref(), Some("first transaction"));
        assert_eq!(tx.status(), TxStatus::Open);
        let m = tx.open_map("test").unwrap();
        m.put("1", "Hello").unwrap();
        let list = ts.get_open_transactions();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id(), tx.id());
        store.commit().unwrap();
        ts.close().unwrap();
        store.close().unwrap();
    }

    {
        let store = Store::open(&path).unwrap();
        let ts = TransactionStore::new(&store).unwrap();
        let tx = ts.begin().unwrap();
        assert_eq!(tx.id(), 1);
        let m = tx.open_map("test").unwrap();
        // the row belongs to the still-open transaction 0
        assert_eq!(m.get("1").unwrap(), None);

        let list = ts.get_open_transactions();
        assert_eq!(list.len(), 1);
        let old = &list[0];
        assert_eq!(old.id(), 0);
        assert_eq!(old.status(), TxStatus::Open);
        assert_eq!(old.name().as_deref(), Some("first transaction"));
        old.prepare().unwrap();
        assert_eq!(old.status(), TxStatus::Prepared);
        ts.close().unwrap();
        store.close().unwrap();
    }

    {
        let store = Store::open(&path).unwrap();
        let ts = TransactionStore::new(&store).unwrap();
        let list = ts.get_open_transactions();
        assert_eq!(list.len(), 1);
        let old = &list[0];
        assert_eq!(old.id(), 0);
        assert_eq!(old.status(), TxStatus::Prepared);
        assert_eq!(old.name().as_deref(), Some("first transaction"));
        old.commit().unwrap();

        let tx = ts.begin().unwrap();
        let m = tx.open_map("test").unwrap();
        assert_eq!(m.get("1").unwrap(), s("Hello"));
        ts.close().unwrap();
        store.close().unwrap();
    }
}

#[test]
fn transaction_ids_skip_ahead_after_an_unclean_stop() {
    let dir = tempfile::tempdir().unwrap();
    let path = store_path(&dir);
    {
        let store = Store::open(&path).unwrap();
        let ts = TransactionStore::new(&store).unwrap();
        let tx = ts.begin().unwrap();
        assert_eq!(tx.id(), 0);
        let m = tx.open_map("test").unwrap();
        m.put("1", "x").unwrap();
        tx.commit().unwrap();
        // no ts.close(): only the flushed-ahead id high-water mark survives
        store.close().unwrap();
    }
    let store = Store::open(&path).unwrap();
    let ts = TransactionStore::new(&store).unwrap();
    let tx = ts.begin().unwrap();
    assert!(tx.id() >= 1, "transaction id {} was reused", tx.id());
    let m = tx.open_map("test").unwrap();
    assert_eq!(m.get("1").unwrap(), s("x"));
    store.close().unwrap();
}

#[test]
fn closed_transactions_reject_further_writes() {
    let store = memory_store();
    let ts = TransactionStore::new(&store).unwrap();
    let tx = ts.begin().unwrap();
    let m = tx.open_map("test").unwrap();
    m.put("1", "x").unwrap();
    tx.commit().unwrap();

    let err = m.put("2", "y").unwrap_err();
    assert_eq!(StoreError::code_of(&err), Some(ErrorCode::Closed));
    let err = tx.set_savepoint().unwrap_err();
    assert_eq!(StoreError::code_of(&err), Some(ErrorCode::Closed));
    // commit is idempotent on a closed transaction
    tx.commit().unwrap();
    store.close().unwrap();
}
