//! Store-level integration tests: file format round trips, versioned
//! snapshots, crash and corruption recovery, encryption, and compaction.

use std::collections::BTreeMap;

use tempfile::TempDir;
use thicketdb::{ErrorCode, Store, StoreError, Value};

fn store_path(dir: &TempDir) -> std::path::PathBuf {
    dir.path().join("test.thicket")
}

/// Small deterministic generator, so failures reproduce.
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }
}

#[test]
fn round_trip_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = store_path(&dir);
    let mut reference: BTreeMap<i64, String> = BTreeMap::new();
    let mut rng = Rng(42);

    {
        let store = Store::open(&path).unwrap();
        let map = store.open_map("data").unwrap();
        for _ in 0..500 {
            let key = (rng.next() % 200) as i64;
            if rng.next() % 4 == 0 {
                reference.remove(&key);
                map.remove(key).unwrap();
            } else {
                let value = format!("value-{}", rng.next() % 1000);
                reference.insert(key, value.clone());
                map.put(key, value).unwrap();
            }
        }
        store.commit().unwrap();
        store.store().unwrap();
        assert_eq!(map.len(), reference.len() as u64);
        store.close().unwrap();
    }

    let store = Store::open(&path).unwrap();
    let map = store.open_map("data").unwrap();
    assert_eq!(map.len(), reference.len() as u64);
    for (k, v) in &reference {
        assert_eq!(
            map.get(*k).unwrap(),
            Some(Value::from(v.clone())),
            "key {} after reopen",
            k
        );
    }
    // absent keys stay absent
    assert_eq!(map.get(100_000).unwrap(), None);
    store.close().unwrap();
}

#[test]
fn versioned_reads_see_the_old_snapshot() {
    // the literal "Hello/World then Hi" scenario
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(store_path(&dir)).unwrap();
    let map = store.open_map("data").unwrap();

    map.put(1, "Hello").unwrap();
    map.put(2, "World").unwrap();
    let v0 = store.current_version();
    store.increment_version();
    map.put(1, "Hi").unwrap();
    map.remove(2).unwrap();
    store.commit().unwrap();

    let old = map.open_version(v0).unwrap();
    assert_eq!(old.get(1).unwrap(), Some(Value::from("Hello")));
    assert_eq!(old.get(2).unwrap(), Some(Value::from("World")));
    assert_eq!(map.get(1).unwrap(), Some(Value::from("Hi")));
    assert_eq!(map.get(2).unwrap(), None);
    store.close().unwrap();
}

#[test]
fn snapshots_are_isolated_from_later_writes() {
    let store = Store::builder().open().unwrap();
    let map = store.open_map("data").unwrap();
    for i in 0..100i64 {
        map.put(i, i * 10).unwrap();
    }
    let v = store.current_version();
    store.increment_version();

    let snapshot = map.open_version(v).unwrap();
    for i in 0..100i64 {
        map.put(i, -1i64).unwrap();
    }
    map.clear().unwrap();
    store.commit().unwrap();

    assert_eq!(snapshot.len(), 100);
    for i in 0..100i64 {
        assert_eq!(snapshot.get(i).unwrap(), Some(Value::from(i * 10)));
    }
    assert!(map.is_empty());
}

#[test]
fn rank_and_key_index_agree() {
    // multi-level tree: tiny split size, keys 0, 2, .., 98
    let store = Store::builder().page_split_size(200).open().unwrap();
    let map = store.open_map("test").unwrap();
    for i in (0..100i64).step_by(2) {
        map.put(i, 10 * i).unwrap();
    }

    for i in -1..100i64 {
        let index = map.get_key_index(i).unwrap();
        if i < 0 || i % 2 != 0 {
            let expected = if i < 0 { -1 } else { -(i / 2) - 2 };
            assert_eq!(index, expected, "index of absent {}", i);
        } else {
            assert_eq!(index, i / 2, "index of {}", i);
        }
    }
    for i in -1..60i64 {
        let key = map.get_key(i).unwrap();
        if !(0..50).contains(&i) {
            assert_eq!(key, None);
        } else {
            assert_eq!(key, Some(Value::from(i * 2)));
        }
    }
}

#[test]
fn cursor_skip_jumps_by_rank() {
    let store = Store::builder().page_split_size(200).open().unwrap();
    let map = store.open_map("test").unwrap();
    for i in (0..100i64).step_by(2) {
        map.put(i, 10 * i).unwrap();
    }

    let mut c = map.key_iterator(Some(Value::from(0))).unwrap();
    assert_eq!(c.next().unwrap(), Some(Value::from(0)));
    c.skip(0).unwrap();
    assert_eq!(c.next().unwrap(), Some(Value::from(2)));
    c.skip(1).unwrap();
    assert_eq!(c.next().unwrap(), Some(Value::from(6)));
    c.skip(20).unwrap();
    assert_eq!(c.next().unwrap(), Some(Value::from(48)));

    let mut c = map.key_iterator(Some(Value::from(0))).unwrap();
    c.skip(20).unwrap();
    assert_eq!(c.next().unwrap(), Some(Value::from(40)));

    // skipping past the end exhausts the cursor
    let mut c = map.key_iterator(None).unwrap();
    c.skip(1000).unwrap();
    assert_eq!(c.next().unwrap(), None);
}

#[test]
fn navigation_respects_bounds() {
    let store = Store::builder().open().unwrap();
    let map = store.open_map("test").unwrap();
    map.put(10, 100).unwrap();
    map.put(20, 200).unwrap();

    assert_eq!(map.first_key().unwrap(), Some(Value::from(10)));
    assert_eq!(map.last_key().unwrap(), Some(Value::from(20)));
    assert_eq!(map.ceiling_key(15).unwrap(), Some(Value::from(20)));
    assert_eq!(map.ceiling_key(20).unwrap(), Some(Value::from(20)));
    assert_eq!(map.floor_key(15).unwrap(), Some(Value::from(10)));
    assert_eq!(map.floor_key(10).unwrap(), Some(Value::from(10)));
    assert_eq!(map.higher_key(10).unwrap(), Some(Value::from(20)));
    assert_eq!(map.higher_key(20).unwrap(), None);
    assert_eq!(map.lower_key(20).unwrap(), Some(Value::from(10)));
    assert_eq!(map.lower_key(10).unwrap(), None);
    assert_eq!(map.ceiling_key(21).unwrap(), None);
    assert_eq!(map.floor_key(9).unwrap(), None);
}

#[test]
fn navigation_matches_a_reference_model() {
    let store = Store::builder().page_split_size(200).open().unwrap();
    let map = store.open_map("test").unwrap();
    let mut reference = BTreeMap::new();
    let mut rng = Rng(7);
    for _ in 0..300 {
        let k = (rng.next() % 500) as i64;
        map.put(k, k).unwrap();
        reference.insert(k, k);
    }

    for probe in -1..501i64 {
        let ceiling = reference.range(probe..).next().map(|(k, _)| Value::from(*k));
        let higher = reference
            .range(probe + 1..)
            .next()
            .map(|(k, _)| Value::from(*k));
        let floor = reference
            .range(..=probe)
            .next_back()
            .map(|(k, _)| Value::from(*k));
        let lower = reference
            .range(..probe)
            .next_back()
            .map(|(k, _)| Value::from(*k));
        assert_eq!(map.ceiling_key(probe).unwrap(), ceiling, "ceiling {}", probe);
        assert_eq!(map.higher_key(probe).unwrap(), higher, "higher {}", probe);
        assert_eq!(map.floor_key(probe).unwrap(), floor, "floor {}", probe);
        assert_eq!(map.lower_key(probe).unwrap(), lower, "lower {}", probe);
    }

    // full ordered iteration
    let mut cursor = map.key_iterator(None).unwrap();
    let mut keys = Vec::new();
    while let Some(k) = cursor.next().unwrap() {
        keys.push(k.as_long().unwrap());
    }
    let expected: Vec<i64> = reference.keys().copied().collect();
    assert_eq!(keys, expected);
}

#[test]
fn change_iterator_reports_changed_keys() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::builder()
        .file_name(store_path(&dir))
        .page_split_size(200)
        .open()
        .unwrap();
    let map = store.open_map("test").unwrap();
    for i in 0..200i64 {
        map.put(i, i).unwrap();
    }
    let v = store.current_version();
    // persist, so unchanged subtrees share on-disk positions
    store.store().unwrap();
    map.put(5, -5i64).unwrap();
    map.put(195, -195i64).unwrap();

    let mut changed = Vec::new();
    let mut cursor = map.change_iterator(v).unwrap();
    while let Some(k) = cursor.next().unwrap() {
        changed.push(k.as_long().unwrap());
    }
    assert!(changed.contains(&5));
    assert!(changed.contains(&195));
    // pruning keeps the result far below the full key count
    assert!(changed.len() < 200, "changed {} keys", changed.len());
}

#[test]
fn uncommitted_changes_are_rolled_back_on_close() {
    let dir = tempfile::tempdir().unwrap();
    let path = store_path(&dir);
    {
        let store = Store::open(&path).unwrap();
        let map = store.open_map("data").unwrap();
        map.put(1, "committed").unwrap();
        store.commit().unwrap();
        map.put(2, "uncommitted").unwrap();
        store.close().unwrap();
    }
    let store = Store::open(&path).unwrap();
    let map = store.open_map("data").unwrap();
    assert_eq!(map.get(1).unwrap(), Some(Value::from("committed")));
    assert_eq!(map.get(2).unwrap(), None);
    store.close().unwrap();
}

#[test]
fn rollback_to_discards_newer_versions() {
    let dir = tempfile::tempdir().unwrap();
    let path = store_path(&dir);
    let store = Store::open(&path).unwrap();
    let map = store.open_map("data").unwrap();

    map.put(1, "one").unwrap();
    store.store().unwrap();
    let v1 = store.current_version();
    map.put(1, "two").unwrap();
    map.put(2, "extra").unwrap();
    store.store().unwrap();

    store.rollback_to(v1).unwrap();
    assert_eq!(store.current_version(), v1);
    assert_eq!(map.get(1).unwrap(), Some(Value::from("one")));
    assert_eq!(map.get(2).unwrap(), None);

    let err = store.rollback_to(10_000).unwrap_err();
    assert_eq!(StoreError::code_of(&err), Some(ErrorCode::UnknownVersion));
    store.close().unwrap();
}

#[test]
fn rollback_to_zero_clears_everything() {
    let dir = tempfile::tempdir().unwrap();
    let path = store_path(&dir);
    let store = Store::open(&path).unwrap();
    let map = store.open_map("data").unwrap();
    map.put(1, "x").unwrap();
    store.commit().unwrap();
    store.store().unwrap();

    store.rollback_to(0).unwrap();
    assert_eq!(store.current_version(), 0);
    let map = store.open_map("data").unwrap();
    assert_eq!(map.get(1).unwrap(), None);
    store.close().unwrap();
}

#[test]
fn encrypted_store_requires_the_right_password() {
    let dir = tempfile::tempdir().unwrap();
    let path = store_path(&dir);
    {
        let key = b"007".to_vec();
        let store = Store::builder()
            .file_name(&path)
            .encryption_key(key)
            .open()
            .unwrap();
        let map = store.open_map("data").unwrap();
        map.put(1, "Hello").unwrap();
        store.commit().unwrap();
        store.close().unwrap();
    }

    let wrong = Store::builder()
        .file_name(&path)
        .encryption_key(b"008".to_vec())
        .open();
    assert!(wrong.is_err(), "opening with the wrong password succeeded");

    let store = Store::builder()
        .file_name(&path)
        .encryption_key(b"007".to_vec())
        .open()
        .unwrap();
    let map = store.open_map("data").unwrap();
    assert_eq!(map.get(1).unwrap(), Some(Value::from("Hello")));
    store.close().unwrap();
}

/// Flips the first hex digit after `fletcher:` inside the block starting at
/// `block_pos`.
fn corrupt_header_checksum(path: &std::path::Path, block_pos: usize) {
    let mut bytes = std::fs::read(path).unwrap();
    let block = &mut bytes[block_pos..block_pos + 4096];
    let marker = b"fletcher:";
    let at = block
        .windows(marker.len())
        .position(|w| w == marker)
        .expect("no fletcher in header block")
        + marker.len();
    let old = char::from(block[at]).to_digit(16).unwrap();
    let bad = (old + 1) & 15;
    block[at] = char::from_digit(bad, 16).unwrap() as u8;
    std::fs::write(path, bytes).unwrap();
}

#[test]
fn corrupt_primary_header_falls_back_to_the_backup() {
    let dir = tempfile::tempdir().unwrap();
    let path = store_path(&dir);
    {
        let store = Store::open(&path).unwrap();
        let map = store.open_map("test").unwrap();
        map.put(10, 100).unwrap();
        store.commit().unwrap();
        store.store().unwrap();
        store.close().unwrap();
    }

    // drop the end-of-file header copy, then corrupt the primary header
    let len = std::fs::metadata(&path).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - 4096).unwrap();
    drop(file);
    corrupt_header_checksum(&path, 0);

    {
        // the backup header at BLOCK_SIZE still works
        let store = Store::open(&path).unwrap();
        let map = store.open_map("test").unwrap();
        assert_eq!(map.get(10).unwrap(), Some(Value::from(100)));
        store.close().unwrap();
    }

    // truncate the tail again (close wrote a fresh copy), corrupt the
    // primary once more, and now also the backup: open must fail
    let len = std::fs::metadata(&path).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - 4096).unwrap();
    drop(file);
    corrupt_header_checksum(&path, 0);
    corrupt_header_checksum(&path, 4096);

    let result = Store::open(&path);
    assert!(result.is_err(), "opened a store with two corrupt headers");
}

#[test]
fn torn_store_keeps_the_previous_version() {
    let dir = tempfile::tempdir().unwrap();
    let path = store_path(&dir);

    // state A, cleanly closed so the primary headers point at it
    {
        let store = Store::open(&path).unwrap();
        let map = store.open_map("data").unwrap();
        for i in 0..50i64 {
            map.put(i, format!("a{}", i)).unwrap();
        }
        store.commit().unwrap();
        store.close().unwrap();
    }
    let bytes_a = std::fs::read(&path).unwrap();

    // state B appended by a second session that "crashes" (no clean close)
    {
        let store = Store::open(&path).unwrap();
        let map = store.open_map("data").unwrap();
        for i in 0..50i64 {
            map.put(i, format!("b{}", i)).unwrap();
        }
        store.commit().unwrap();
        store.store().unwrap();
        store.close_immediately();
    }
    let bytes_b = std::fs::read(&path).unwrap();
    assert!(bytes_b.len() > bytes_a.len());

    // any prefix of the new chunk's bytes leaves state A readable; the full
    // file yields state B
    let cut_points = [
        bytes_a.len(),
        bytes_a.len() + 100,
        bytes_a.len() + 4096,
        bytes_b.len() - 100,
        bytes_b.len(),
    ];
    for &cut in &cut_points {
        std::fs::write(&path, &bytes_b[..cut]).unwrap();
        let store = Store::open(&path).unwrap();
        let map = store.open_map("data").unwrap();
        let value = map.get(0).unwrap().unwrap();
        let value = value.as_str().unwrap();
        if cut == bytes_b.len() {
            assert_eq!(value, "b0", "full file must show the new version");
        } else {
            assert_eq!(value, "a0", "torn write at {} must show the old version", cut);
        }
        // whichever version came back must be complete
        let expected = if value.starts_with('b') { "b" } else { "a" };
        for i in 0..50i64 {
            assert_eq!(
                map.get(i).unwrap(),
                Some(Value::from(format!("{}{}", expected, i))),
                "key {} at cut {}",
                i,
                cut
            );
        }
        store.close_immediately();
    }
}

#[test]
fn compaction_preserves_entries_and_bounds_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = store_path(&dir);
    let store = Store::builder()
        .file_name(&path)
        .retention_time_ms(0)
        .open()
        .unwrap();
    let map = store.open_map("data").unwrap();

    let mut baseline = 0u64;
    for cycle in 0..20i64 {
        for i in 0..100i64 {
            map.put(i, format!("cycle-{}-{}", cycle, i)).unwrap();
        }
        store.commit().unwrap();
        store.store().unwrap();
        if cycle == 0 {
            baseline = std::fs::metadata(&path).unwrap().len();
        }
    }

    store.compact(100).unwrap();
    store.compact_move_chunks().unwrap();

    for i in 0..100i64 {
        assert_eq!(
            map.get(i).unwrap(),
            Some(Value::from(format!("cycle-19-{}", i))),
            "key {} after compaction",
            i
        );
    }
    let size = std::fs::metadata(&path).unwrap().len();
    assert!(
        size <= baseline * 3,
        "file of {} bytes exceeds 3x the {} byte baseline",
        size,
        baseline
    );
    store.close().unwrap();

    // and everything still reads back after a reopen
    let store = Store::open(&path).unwrap();
    let map = store.open_map("data").unwrap();
    assert_eq!(map.len(), 100);
    store.close().unwrap();
}

#[test]
fn flushed_uncommitted_data_is_rolled_back_on_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = store_path(&dir);
    {
        // a tiny write buffer forces temporary stores of uncommitted data
        let store = Store::builder()
            .file_name(&path)
            .write_buffer_size_mb(1)
            .open()
            .unwrap();
        let map = store.open_map("data").unwrap();
        map.put(0, "committed").unwrap();
        store.commit().unwrap();
        store.store().unwrap();

        for i in 1..3000i64 {
            map.put(i, format!("uncommitted-{}", i)).unwrap();
        }
        // crash without commit
        store.close_immediately();
    }

    let store = Store::open(&path).unwrap();
    let map = store.open_map("data").unwrap();
    assert_eq!(map.get(0).unwrap(), Some(Value::from("committed")));
    assert_eq!(map.get(1).unwrap(), None);
    assert_eq!(map.get(2999).unwrap(), None);
    assert_eq!(map.len(), 1);
    store.close().unwrap();
}

#[test]
fn background_writer_flushes_committed_changes() {
    let dir = tempfile::tempdir().unwrap();
    let path = store_path(&dir);
    let store = Store::builder()
        .file_name(&path)
        .write_delay_ms(50)
        .open()
        .unwrap();
    let map = store.open_map("data").unwrap();
    map.put(1, "x").unwrap();
    store.commit().unwrap();

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while store.has_unsaved_changes() && std::time::Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    assert!(!store.has_unsaved_changes(), "background writer never ran");
    store.close().unwrap();
}

#[test]
fn second_writer_is_locked_out() {
    let dir = tempfile::tempdir().unwrap();
    let path = store_path(&dir);
    let store = Store::open(&path).unwrap();
    assert!(Store::open(&path).is_err());
    store.close().unwrap();
    // and the lock is gone after close
    let store = Store::open(&path).unwrap();
    store.close().unwrap();
}

#[test]
fn read_only_opens_share_and_reject_writes() {
    let dir = tempfile::tempdir().unwrap();
    let path = store_path(&dir);
    {
        let store = Store::open(&path).unwrap();
        let map = store.open_map("data").unwrap();
        map.put(1, "x").unwrap();
        store.commit().unwrap();
        store.close().unwrap();
    }
    let r1 = Store::builder().file_name(&path).read_only().open().unwrap();
    let r2 = Store::builder().file_name(&path).read_only().open().unwrap();
    assert_eq!(
        r1.open_map("data").unwrap().get(1).unwrap(),
        Some(Value::from("x"))
    );
    let map = r2.open_map("data").unwrap();
    assert!(map.put(2, "y").is_err());
    r1.close().unwrap();
    r2.close().unwrap();
}

#[test]
fn store_version_setting_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = store_path(&dir);
    {
        let store = Store::open(&path).unwrap();
        assert_eq!(store.get_store_version().unwrap(), 0);
        store.set_store_version(1).unwrap();
        store.store().unwrap();
        store.close().unwrap();
    }
    let store = Store::open(&path).unwrap();
    assert_eq!(store.get_store_version().unwrap(), 1);
    store.close().unwrap();
}

#[test]
fn maps_can_be_renamed_and_removed() {
    let dir = tempfile::tempdir().unwrap();
    let path = store_path(&dir);
    {
        let store = Store::open(&path).unwrap();
        let map = store.open_map("first").unwrap();
        map.put(1, "x").unwrap();
        map.rename("second").unwrap();
        store.commit().unwrap();
        store.close().unwrap();
    }
    let store = Store::open(&path).unwrap();
    assert!(!store.has_map("first").unwrap());
    assert!(store.has_map("second").unwrap());
    let map = store.open_map("second").unwrap();
    assert_eq!(map.get(1).unwrap(), Some(Value::from("x")));
    assert_eq!(map.name().unwrap().as_deref(), Some("second"));

    map.remove_map().unwrap();
    assert!(!store.has_map("second").unwrap());
    store.close().unwrap();
}

#[test]
fn compressed_stores_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = store_path(&dir);
    {
        let store = Store::builder()
            .file_name(&path)
            .compress_data()
            .open()
            .unwrap();
        let map = store.open_map("data").unwrap();
        for i in 0..200i64 {
            map.put(i, "repetitive repetitive repetitive").unwrap();
        }
        store.commit().unwrap();
        store.close().unwrap();
    }
    // reading works without the compression flag
    let store = Store::open(&path).unwrap();
    let map = store.open_map("data").unwrap();
    assert_eq!(
        map.get(199).unwrap(),
        Some(Value::from("repetitive repetitive repetitive"))
    );
    store.close().unwrap();
}
