//! # Maps
//!
//! A [`Map`] is one ordered key-value tree inside a store. Mutations are
//! copy-on-write: every page on the path from the root to the touched leaf is
//! copied, the copy is mutated while exclusively owned, and a new root is
//! published at the end. Readers hold a root and traverse immutable pages,
//! so a snapshot is simply a retained root.
//!
//! Retained previous roots (`old_roots`, version-ascending) back
//! [`Map::open_version`]; versions that fall behind the store's retain
//! version are forgotten. Snapshots older than in-memory retention are
//! materialized from disk through the store's meta map.
//!
//! ## Writer contract
//!
//! A map supports one writer at a time. A `writing` flag is claimed on entry
//! to every mutation and a second concurrent writer fails immediately with
//! `CONCURRENT_MODIFICATION`; this is a best-effort safeguard, not a
//! scheduler. The compare-and-set style operations (`put_if_absent`,
//! `replace_if_equal`, ...) additionally serialize on an internal mutex so
//! their read-check-write sequence is atomic with respect to each other,
//! which is what the transaction layer builds its conflict detection on.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};

use eyre::{ensure, Result};
use parking_lot::{Mutex, RwLock};

use super::cursor::{ChangeCursor, Cursor};
use super::page::{pos_is_leaf, Page, PageContent};
use crate::error::{store_bail, ErrorCode, StoreError};
use crate::store::StoreState;
use crate::types::{DataType, Value};

/// A root retained for snapshot reads.
#[derive(Clone)]
pub(crate) struct RootRef {
    pub page: Arc<Page>,
    pub version: i64,
}

pub(crate) struct MapVersions {
    pub root: Arc<Page>,
    pub root_version: i64,
    /// Previous roots, version ascending.
    pub old_roots: Vec<RootRef>,
}

pub(crate) struct MapInner {
    pub id: u32,
    pub create_version: i64,
    pub key_type: Arc<dyn DataType>,
    pub value_type: Arc<dyn DataType>,
    store: Weak<StoreState>,
    pub(crate) state: RwLock<MapVersions>,
    sync: Mutex<()>,
    writing: AtomicBool,
    closed: AtomicBool,
    read_only: AtomicBool,
}

/// Handle to a map. Cheap to clone; all clones share the same tree.
#[derive(Clone)]
pub struct Map {
    pub(crate) inner: Arc<MapInner>,
}

pub(crate) struct WritingGuard<'a> {
    map: &'a MapInner,
}

impl Drop for WritingGuard<'_> {
    fn drop(&mut self) {
        self.map.writing.store(false, AtomicOrdering::SeqCst);
    }
}

impl MapInner {
    pub(crate) fn new(
        id: u32,
        create_version: i64,
        key_type: Arc<dyn DataType>,
        value_type: Arc<dyn DataType>,
        store: Weak<StoreState>,
        read_only: bool,
    ) -> Arc<MapInner> {
        Arc::new(MapInner {
            id,
            create_version,
            key_type,
            value_type,
            store,
            state: RwLock::new(MapVersions {
                root: Arc::new(Page::empty_leaf()),
                root_version: -1,
                old_roots: Vec::new(),
            }),
            sync: Mutex::new(()),
            writing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            read_only: AtomicBool::new(read_only),
        })
    }

    pub(crate) fn store(&self) -> Result<Arc<StoreState>> {
        self.store
            .upgrade()
            .ok_or_else(|| StoreError::new(ErrorCode::Closed, "the store has been closed"))
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed.load(AtomicOrdering::Acquire) {
            store_bail!(ErrorCode::Closed, "map {} is closed", self.id);
        }
        Ok(())
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, AtomicOrdering::Release);
        self.read_only.store(true, AtomicOrdering::Release);
        let mut st = self.state.write();
        st.old_roots.clear();
        st.root = Arc::new(Page::empty_leaf());
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::Acquire)
    }

    pub(crate) fn version(&self) -> i64 {
        self.state.read().root_version
    }

    pub(crate) fn root_snapshot(&self) -> (Arc<Page>, i64) {
        let st = self.state.read();
        (st.root.clone(), st.root_version)
    }

    /// Spin until no write is in flight. The caller must have made sure new
    /// writes will observe its state change first.
    pub(crate) fn wait_until_written(&self) {
        while self.writing.load(AtomicOrdering::SeqCst) {
            std::thread::yield_now();
        }
    }

    fn before_write(&self) -> Result<(Arc<StoreState>, WritingGuard<'_>)> {
        if self.read_only.load(AtomicOrdering::Acquire) {
            self.check_open()?;
            store_bail!(ErrorCode::WritingFailed, "map {} is read-only", self.id);
        }
        self.check_open()?;
        let store = self.store()?;
        // may trigger a flush; runs before the flag is claimed so the flush
        // does not wait on ourselves. The meta map is exempt: it is written
        // under the commit lock, and its changes ride along with every store
        // operation anyway.
        if self.id != 0 {
            store.before_write()?;
        }
        if self
            .writing
            .compare_exchange(false, true, AtomicOrdering::SeqCst, AtomicOrdering::SeqCst)
            .is_err()
        {
            store_bail!(
                ErrorCode::ConcurrentModification,
                "concurrent write on map {}",
                self.id
            );
        }
        Ok((store, WritingGuard { map: self }))
    }

    /// Flag-only guard for internal callers already coordinated with the
    /// store (rollback, set_root_pos), where the flush hook must not run.
    fn write_guard(&self) -> Result<WritingGuard<'_>> {
        if self
            .writing
            .compare_exchange(false, true, AtomicOrdering::SeqCst, AtomicOrdering::SeqCst)
            .is_err()
        {
            store_bail!(
                ErrorCode::ConcurrentModification,
                "concurrent write on map {}",
                self.id
            );
        }
        Ok(WritingGuard { map: self })
    }

    // ----- page access -----

    pub(crate) fn read_page(&self, pos: u64) -> Result<Arc<Page>> {
        self.store()?.read_page(self, pos)
    }

    pub(crate) fn child_page(&self, p: &Page, index: usize) -> Result<Arc<Page>> {
        let r = p.child_ref(index);
        if let Some(cached) = r.cached() {
            return Ok(cached);
        }
        let pos = r.pos();
        if pos == 0 {
            store_bail!(
                ErrorCode::Internal,
                "child {} of map {} has neither page nor position",
                index,
                self.id
            );
        }
        self.read_page(pos)
    }

    fn copy_page(&self, store: &StoreState, p: &Page) -> Page {
        store.register_unsaved_page();
        p.copy()
    }

    // ----- reads -----

    pub(crate) fn get_in(&self, root: &Arc<Page>, key: &Value) -> Result<Option<Value>> {
        let mut p = root.clone();
        loop {
            match p.binary_search(key, &*self.key_type) {
                Ok(i) => {
                    if p.is_leaf() {
                        return Ok(Some(p.value(i).clone()));
                    }
                    let next = self.child_page(&p, i + 1)?;
                    p = next;
                }
                Err(i) => {
                    if p.is_leaf() {
                        return Ok(None);
                    }
                    let next = self.child_page(&p, i)?;
                    p = next;
                }
            }
        }
    }

    fn first_last_in(&self, root: &Arc<Page>, first: bool) -> Result<Option<Value>> {
        if root.total_count() == 0 {
            return Ok(None);
        }
        let mut p = root.clone();
        loop {
            if p.is_leaf() {
                let i = if first { 0 } else { p.key_count() - 1 };
                return Ok(Some(p.key(i).clone()));
            }
            let i = if first { 0 } else { p.child_count() - 1 };
            let next = self.child_page(&p, i)?;
            p = next;
        }
    }

    fn min_max_in(
        &self,
        p: &Arc<Page>,
        key: &Value,
        min: bool,
        excluding: bool,
    ) -> Result<Option<Value>> {
        if p.is_leaf() {
            let x: i64 = match p.binary_search(key, &*self.key_type) {
                Ok(i) => {
                    if excluding {
                        i as i64 + if min { -1 } else { 1 }
                    } else {
                        i as i64
                    }
                }
                Err(ins) => ins as i64 - if min { 1 } else { 0 },
            };
            if x < 0 || x >= p.key_count() as i64 {
                return Ok(None);
            }
            return Ok(Some(p.key(x as usize).clone()));
        }
        let mut x: i64 = match p.binary_search(key, &*self.key_type) {
            Ok(i) => i as i64 + 1,
            Err(i) => i as i64,
        };
        loop {
            if x < 0 || x >= p.child_count() as i64 {
                return Ok(None);
            }
            let child = self.child_page(p, x as usize)?;
            if let Some(k) = self.min_max_in(&child, key, min, excluding)? {
                return Ok(Some(k));
            }
            x += if min { -1 } else { 1 };
        }
    }

    /// Key at `index` (rank) within the tree under `root`.
    pub(crate) fn key_at_in(&self, root: &Arc<Page>, index: i64) -> Result<Option<Value>> {
        if index < 0 || index >= root.total_count() as i64 {
            return Ok(None);
        }
        let mut p = root.clone();
        let mut offset: i64 = 0;
        loop {
            if p.is_leaf() {
                if index >= offset + p.key_count() as i64 {
                    return Ok(None);
                }
                return Ok(Some(p.key((index - offset) as usize).clone()));
            }
            let size = p.child_count();
            let mut i = 0;
            while i < size {
                let c = p.counts(i) as i64;
                if index < c + offset {
                    break;
                }
                offset += c;
                i += 1;
            }
            if i == size {
                return Ok(None);
            }
            let next = self.child_page(&p, i)?;
            p = next;
        }
    }

    /// Rank of `key` under `root`, or the negated insertion point minus one
    /// when absent.
    pub(crate) fn key_index_in(&self, root: &Arc<Page>, key: &Value) -> Result<i64> {
        if root.total_count() == 0 {
            return Ok(-1);
        }
        let mut p = root.clone();
        let mut offset: i64 = 0;
        loop {
            match p.binary_search(key, &*self.key_type) {
                Ok(i) => {
                    if p.is_leaf() {
                        return Ok(offset + i as i64);
                    }
                    for j in 0..=i {
                        offset += p.counts(j) as i64;
                    }
                    let next = self.child_page(&p, i + 1)?;
                    p = next;
                }
                Err(i) => {
                    if p.is_leaf() {
                        return Ok(-offset - i as i64 - 1);
                    }
                    for j in 0..i {
                        offset += p.counts(j) as i64;
                    }
                    let next = self.child_page(&p, i)?;
                    p = next;
                }
            }
        }
    }

    // ----- writes -----

    fn split_root_if_needed(&self, store: &StoreState, mut p: Page) -> Page {
        if p.memory() <= store.page_split_size() || p.key_count() <= 1 {
            return p;
        }
        let at = p.key_count() / 2;
        let k = p.key(at).clone();
        let right = p.split(at, &*self.key_type, &*self.value_type);
        store.register_unsaved_page();
        let left_count = p.total_count();
        let right_count = right.total_count();
        let root = Page::new_node(
            vec![k],
            vec![
                super::page::ChildRef::unsaved(Arc::new(p)),
                super::page::ChildRef::unsaved(Arc::new(right)),
            ],
            vec![left_count, right_count],
            &*self.key_type,
        );
        store.register_unsaved_page();
        root
    }

    fn put_rec(
        &self,
        store: &StoreState,
        p: &mut Page,
        key: Value,
        value: Value,
    ) -> Result<Option<Value>> {
        let kt = &*self.key_type;
        let vt = &*self.value_type;
        if p.is_leaf() {
            return match p.binary_search(&key, kt) {
                Ok(i) => Ok(Some(p.set_value(i, value, vt))),
                Err(i) => {
                    p.insert_leaf(i, key, value, kt, vt);
                    Ok(None)
                }
            };
        }
        let index = match p.binary_search(&key, kt) {
            Ok(i) => i + 1,
            Err(i) => i,
        };
        let child_arc = self.child_page(p, index)?;
        let mut c = self.copy_page(store, &child_arc);
        store.remove_page(self.id, child_arc.pos());
        if c.memory() > store.page_split_size() && c.key_count() > 1 {
            // split on the way down
            let at = c.key_count() / 2;
            let k = c.key(at).clone();
            let right = c.split(at, kt, vt);
            store.register_unsaved_page();
            p.set_child(index, Arc::new(right));
            p.insert_node(index, k, Arc::new(c), kt);
            // the insertion point moved; search this node again
            return self.put_rec(store, p, key, value);
        }
        let result = self.put_rec(store, &mut c, key, value)?;
        p.set_child(index, Arc::new(c));
        Ok(result)
    }

    fn put_internal(&self, store: &Arc<StoreState>, key: Value, value: Value) -> Result<Option<Value>> {
        let write_version = store.current_version();
        let (root, _) = self.root_snapshot();
        let mut p = self.copy_page(store, &root);
        store.remove_page(self.id, root.pos());
        p = self.split_root_if_needed(store, p);
        let result = self.put_rec(store, &mut p, key, value)?;
        self.publish_root(store, Arc::new(p), write_version);
        Ok(result)
    }

    fn remove_rec(&self, store: &StoreState, p: &mut Page, key: &Value) -> Result<Option<Value>> {
        let kt = &*self.key_type;
        let vt = &*self.value_type;
        if p.is_leaf() {
            return match p.binary_search(key, kt) {
                Ok(i) => {
                    let v = p.remove(i, kt, vt);
                    if p.key_count() == 0 {
                        // fresh copy, position 0: cancels its unsaved count
                        store.remove_page(self.id, p.pos());
                    }
                    Ok(v)
                }
                Err(_) => Ok(None),
            };
        }
        let index = match p.binary_search(key, kt) {
            Ok(i) => i + 1,
            Err(i) => i,
        };
        let child_arc = self.child_page(p, index)?;
        let mut c = self.copy_page(store, &child_arc);
        let result = self.remove_rec(store, &mut c, key)?;
        if result.is_none() {
            // nothing removed; abandon the copy
            store.remove_page(self.id, 0);
            return Ok(None);
        }
        store.remove_page(self.id, child_arc.pos());
        if c.total_count() == 0 {
            if p.key_count() == 0 {
                p.set_child(index, Arc::new(c));
                store.remove_page(self.id, p.pos());
            } else {
                p.remove(index, kt, vt);
            }
        } else {
            p.set_child(index, Arc::new(c));
        }
        Ok(result)
    }

    fn remove_internal(&self, store: &Arc<StoreState>, key: &Value) -> Result<Option<Value>> {
        let write_version = store.current_version();
        let (root, _) = self.root_snapshot();
        let mut p = self.copy_page(store, &root);
        store.remove_page(self.id, root.pos());
        let result = self.remove_rec(store, &mut p, key)?;
        // collapse an empty interior root down to its remaining child
        let mut new_root = Arc::new(p);
        while !new_root.is_leaf() && new_root.key_count() == 0 && new_root.child_count() == 1 {
            let child = self.child_page(&new_root, 0)?;
            store.remove_page(self.id, new_root.pos());
            new_root = child;
        }
        self.publish_root(store, new_root, write_version);
        Ok(result)
    }

    pub(crate) fn publish_root(&self, store: &StoreState, new_root: Arc<Page>, version: i64) {
        let retain = store.get_retain_version();
        let mut st = self.state.write();
        Self::drop_unused_roots(&mut st, retain);
        if st.root_version != version {
            let push = st
                .old_roots
                .last()
                .map_or(true, |last| last.version != st.root_version);
            if push {
                let prev = RootRef {
                    page: st.root.clone(),
                    version: st.root_version,
                };
                st.old_roots.push(prev);
            }
            store.mark_changed(self.id);
        }
        st.root = new_root;
        st.root_version = version;
    }

    fn drop_unused_roots(st: &mut MapVersions, retain_version: i64) {
        if retain_version == -1 {
            return;
        }
        // keep the newest root at or below the retain version and everything
        // after it
        let i = match st
            .old_roots
            .binary_search_by_key(&retain_version, |r| r.version)
        {
            Ok(i) => i,
            Err(ins) => {
                if ins == 0 {
                    return;
                }
                ins - 1
            }
        };
        st.old_roots.drain(..i);
    }

    pub(crate) fn remove_unused_old_versions(&self, store: &StoreState) {
        let retain = store.get_retain_version();
        Self::drop_unused_roots(&mut self.state.write(), retain);
    }

    fn remove_all_recursive(&self, store: &StoreState, page: &Arc<Page>) -> Result<()> {
        if let PageContent::Node { children, .. } = page.content() {
            for child in children {
                if let Some(c) = child.cached() {
                    self.remove_all_recursive(store, &c)?;
                } else {
                    let pos = child.pos();
                    if pos != 0 {
                        if pos_is_leaf(pos) {
                            store.remove_page(self.id, pos);
                        } else {
                            let c = self.read_page(pos)?;
                            self.remove_all_recursive(store, &c)?;
                        }
                    }
                }
            }
        }
        store.remove_page(self.id, page.pos());
        Ok(())
    }

    // ----- versions -----

    pub(crate) fn set_root_pos(&self, pos: u64, version: i64) -> Result<()> {
        let page = if pos == 0 {
            Arc::new(Page::empty_leaf())
        } else {
            self.read_page(pos)?
        };
        let mut st = self.state.write();
        st.root = page;
        st.root_version = version;
        Ok(())
    }

    pub(crate) fn rollback_to(&self, store: &StoreState, version: i64) -> Result<()> {
        let _guard = self.write_guard()?;
        self.remove_unused_old_versions(store);
        if version <= self.create_version {
            // the store closes and drops this map afterwards
            return Ok(());
        }
        let mut st = self.state.write();
        if st.root_version >= version {
            while let Some(last) = st.old_roots.pop() {
                let v = last.version;
                st.root = last.page;
                st.root_version = v;
                if v < version {
                    break;
                }
            }
        }
        Ok(())
    }

    fn open_read_only(self: &Arc<Self>, root: Arc<Page>, version: i64) -> Map {
        let inner = MapInner::new(
            self.id,
            self.create_version,
            self.key_type.clone(),
            self.value_type.clone(),
            self.store.clone(),
            true,
        );
        {
            let mut st = inner.state.write();
            st.root = root;
            st.root_version = version;
        }
        Map { inner }
    }

    pub(crate) fn open_version_internal(self: &Arc<Self>, version: i64) -> Result<Map> {
        if self.read_only.load(AtomicOrdering::Acquire) {
            store_bail!(
                ErrorCode::WritingFailed,
                "open_version must be called on the writable map"
            );
        }
        if version < self.create_version {
            store_bail!(
                ErrorCode::UnknownVersion,
                "version {} predates the map (created in version {})",
                version,
                self.create_version
            );
        }
        let store = self.store()?;
        let (root, newest) = {
            let st = self.state.read();
            if version >= st.root_version
                && (st.root_version >= 0 || version <= self.create_version || !store.has_file())
            {
                (st.root.clone(), st.root_version)
            } else {
                let i = match st
                    .old_roots
                    .binary_search_by_key(&version, |r| r.version)
                {
                    Ok(i) => i as i64,
                    Err(0) => -1,
                    Err(ins) => ins as i64 - 1,
                };
                if i < 0 {
                    // older than anything retained in memory
                    drop(st);
                    return store.open_map_version(version, self);
                }
                let r = &st.old_roots[i as usize];
                (r.page.clone(), r.version)
            }
        };
        Ok(self.open_read_only(root, newest))
    }
}

impl Map {
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn name(&self) -> Result<Option<String>> {
        self.inner.store()?.map_name(self.inner.id)
    }

    /// The version of the current root.
    pub fn version(&self) -> i64 {
        self.inner.version()
    }

    pub fn create_version(&self) -> i64 {
        self.inner.create_version
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.read_only.load(AtomicOrdering::Acquire)
    }

    /// Number of entries.
    pub fn len(&self) -> u64 {
        self.inner.state.read().root.total_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds or replaces a key-value pair, returning the previous value.
    /// Values may not be `Null`.
    pub fn put(&self, key: impl Into<Value>, value: impl Into<Value>) -> Result<Option<Value>> {
        let (key, value) = (key.into(), value.into());
        ensure!(!value.is_null(), "the value may not be null");
        let (store, _guard) = self.inner.before_write()?;
        self.inner.put_internal(&store, key, value)
    }

    /// Removes a key, returning the previous value if present.
    pub fn remove(&self, key: impl Into<Value>) -> Result<Option<Value>> {
        let key = key.into();
        let (store, _guard) = self.inner.before_write()?;
        self.inner.remove_internal(&store, &key)
    }

    /// Adds the pair only if the key is absent; returns the existing value
    /// otherwise.
    pub fn put_if_absent(
        &self,
        key: impl Into<Value>,
        value: impl Into<Value>,
    ) -> Result<Option<Value>> {
        let (key, value) = (key.into(), value.into());
        let _sync = self.inner.sync.lock();
        let old = self.get(key.clone())?;
        if old.is_none() {
            self.put(key, value)?;
        }
        Ok(old)
    }

    /// Replaces the value only if the current value equals `old`.
    pub fn replace_if_equal(
        &self,
        key: impl Into<Value>,
        old: &Value,
        new: impl Into<Value>,
    ) -> Result<bool> {
        let key = key.into();
        let _sync = self.inner.sync.lock();
        let current = self.get(key.clone())?;
        if self.values_equal(current.as_ref(), Some(old)) {
            self.put(key, new)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Replaces the value of an existing key, returning the previous value.
    pub fn replace(&self, key: impl Into<Value>, value: impl Into<Value>) -> Result<Option<Value>> {
        let key = key.into();
        let _sync = self.inner.sync.lock();
        let old = self.get(key.clone())?;
        if old.is_some() {
            self.put(key, value)?;
        }
        Ok(old)
    }

    /// Removes the key only if its value equals `old`.
    pub fn remove_if_equal(&self, key: impl Into<Value>, old: &Value) -> Result<bool> {
        let key = key.into();
        let _sync = self.inner.sync.lock();
        let current = self.get(key.clone())?;
        if self.values_equal(current.as_ref(), Some(old)) {
            self.remove(key)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Compares two optional values with the map's value type.
    pub fn values_equal(&self, a: Option<&Value>, b: Option<&Value>) -> bool {
        match (a, b) {
            (None, None) => true,
            (Some(x), Some(y)) => {
                self.inner.value_type.compare(x, y) == std::cmp::Ordering::Equal
            }
            _ => false,
        }
    }

    pub fn get(&self, key: impl Into<Value>) -> Result<Option<Value>> {
        self.inner.check_open()?;
        let key = key.into();
        let (root, _) = self.inner.root_snapshot();
        self.inner.get_in(&root, &key)
    }

    pub fn contains_key(&self, key: impl Into<Value>) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    pub fn first_key(&self) -> Result<Option<Value>> {
        self.inner.check_open()?;
        let (root, _) = self.inner.root_snapshot();
        self.inner.first_last_in(&root, true)
    }

    pub fn last_key(&self) -> Result<Option<Value>> {
        self.inner.check_open()?;
        let (root, _) = self.inner.root_snapshot();
        self.inner.first_last_in(&root, false)
    }

    /// Smallest key `>=` the given key.
    pub fn ceiling_key(&self, key: impl Into<Value>) -> Result<Option<Value>> {
        self.min_max(key.into(), false, false)
    }

    /// Smallest key `>` the given key.
    pub fn higher_key(&self, key: impl Into<Value>) -> Result<Option<Value>> {
        self.min_max(key.into(), false, true)
    }

    /// Largest key `<=` the given key.
    pub fn floor_key(&self, key: impl Into<Value>) -> Result<Option<Value>> {
        self.min_max(key.into(), true, false)
    }

    /// Largest key `<` the given key.
    pub fn lower_key(&self, key: impl Into<Value>) -> Result<Option<Value>> {
        self.min_max(key.into(), true, true)
    }

    fn min_max(&self, key: Value, min: bool, excluding: bool) -> Result<Option<Value>> {
        self.inner.check_open()?;
        let (root, _) = self.inner.root_snapshot();
        if root.total_count() == 0 {
            return Ok(None);
        }
        self.inner.min_max_in(&root, &key, min, excluding)
    }

    /// Key at the given rank, or `None` out of range.
    pub fn get_key(&self, index: i64) -> Result<Option<Value>> {
        self.inner.check_open()?;
        let (root, _) = self.inner.root_snapshot();
        self.inner.key_at_in(&root, index)
    }

    /// Rank of the key if present; otherwise `-(insertion point) - 1`.
    pub fn get_key_index(&self, key: impl Into<Value>) -> Result<i64> {
        self.inner.check_open()?;
        let key = key.into();
        let (root, _) = self.inner.root_snapshot();
        self.inner.key_index_in(&root, &key)
    }

    /// Ordered cursor over all keys, starting at `from` if given.
    pub fn key_iterator(&self, from: Option<Value>) -> Result<Cursor> {
        self.inner.check_open()?;
        let (root, _) = self.inner.root_snapshot();
        Cursor::new(self.inner.clone(), root, from)
    }

    /// Keys living in pages that differ from the tree as of `version`.
    pub fn change_iterator(&self, version: i64) -> Result<ChangeCursor> {
        self.inner.check_open()?;
        let old = self.open_version(version)?;
        let (old_root, _) = old.inner.root_snapshot();
        let (root, _) = self.inner.root_snapshot();
        ChangeCursor::new(self.inner.clone(), root, old_root)
    }

    /// A read-only view at the newest retained version `<=` the requested
    /// one. Falls back to disk for versions no longer retained in memory.
    pub fn open_version(&self, version: i64) -> Result<Map> {
        self.inner.open_version_internal(version)
    }

    /// Removes all entries.
    pub fn clear(&self) -> Result<()> {
        let (store, _guard) = self.inner.before_write()?;
        let (root, _) = self.inner.root_snapshot();
        self.inner.remove_all_recursive(&store, &root)?;
        self.inner.publish_root(
            &store,
            Arc::new(Page::empty_leaf()),
            store.current_version(),
        );
        Ok(())
    }

    /// Removes all entries and drops the map from the store.
    pub fn remove_map(&self) -> Result<()> {
        let store = self.inner.store()?;
        if self.inner.id == 0 {
            // the meta map cannot be removed
            return Ok(());
        }
        {
            let (store, _guard) = self.inner.before_write()?;
            let (root, _) = self.inner.root_snapshot();
            self.inner.remove_all_recursive(&store, &root)?;
        }
        store.remove_map(self.inner.id)?;
        self.inner.close();
        Ok(())
    }

    /// Renames the map. The new name must be unused.
    pub fn rename(&self, new_name: &str) -> Result<()> {
        let (store, _guard) = self.inner.before_write()?;
        store.rename_map(self.inner.id, new_name)
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("id", &self.inner.id)
            .field("version", &self.version())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn memory_map() -> (Store, Map) {
        let store = Store::builder().page_split_size(200).open().unwrap();
        let map = store.open_map("test").unwrap();
        (store, map)
    }

    #[test]
    fn put_get_remove() {
        let (_store, map) = memory_map();
        assert_eq!(map.put(1, "one").unwrap(), None);
        assert_eq!(map.put(1, "uno").unwrap(), Some(Value::from("one")));
        assert_eq!(map.get(1).unwrap(), Some(Value::from("uno")));
        assert_eq!(map.remove(1).unwrap(), Some(Value::from("uno")));
        assert_eq!(map.remove(1).unwrap(), None);
        assert!(map.is_empty());
    }

    #[test]
    fn null_values_are_rejected() {
        let (_store, map) = memory_map();
        assert!(map.put(1, Value::Null).is_err());
    }

    #[test]
    fn splits_keep_order_and_counts() {
        let (_store, map) = memory_map();
        for i in (0..500i64).rev() {
            map.put(i, i * 2).unwrap();
        }
        assert_eq!(map.len(), 500);
        for i in 0..500i64 {
            assert_eq!(map.get(i).unwrap(), Some(Value::from(i * 2)), "key {}", i);
        }
        // deep tree: the root must be an interior node by now
        let (root, _) = map.inner.root_snapshot();
        assert!(!root.is_leaf());
        assert_eq!(root.total_count(), 500);
    }

    #[test]
    fn removals_collapse_the_tree() {
        let (_store, map) = memory_map();
        for i in 0..500i64 {
            map.put(i, i).unwrap();
        }
        for i in 0..500i64 {
            map.remove(i).unwrap();
        }
        assert_eq!(map.len(), 0);
        let (root, _) = map.inner.root_snapshot();
        assert!(root.is_leaf());
    }

    #[test]
    fn old_versions_remain_readable() {
        let (store, map) = memory_map();
        map.put(1, "a").unwrap();
        let v1 = store.current_version();
        store.increment_version();
        map.put(1, "b").unwrap();
        let v2 = store.current_version();
        store.increment_version();
        map.put(1, "c").unwrap();

        assert_eq!(
            map.open_version(v1).unwrap().get(1).unwrap(),
            Some(Value::from("a"))
        );
        assert_eq!(
            map.open_version(v2).unwrap().get(1).unwrap(),
            Some(Value::from("b"))
        );
        assert_eq!(map.get(1).unwrap(), Some(Value::from("c")));

        // snapshots are read-only
        let snapshot = map.open_version(v1).unwrap();
        assert!(snapshot.put(2, "x").is_err());
    }

    #[test]
    fn conditional_updates() {
        let (_store, map) = memory_map();
        assert_eq!(map.put_if_absent(1, "a").unwrap(), None);
        assert_eq!(
            map.put_if_absent(1, "b").unwrap(),
            Some(Value::from("a"))
        );
        assert!(map
            .replace_if_equal(1, &Value::from("a"), "c")
            .unwrap());
        assert!(!map
            .replace_if_equal(1, &Value::from("a"), "d")
            .unwrap());
        assert_eq!(map.get(1).unwrap(), Some(Value::from("c")));
        assert!(!map.remove_if_equal(1, &Value::from("x")).unwrap());
        assert!(map.remove_if_equal(1, &Value::from("c")).unwrap());
        assert!(map.is_empty());
    }

    #[test]
    fn closed_maps_reject_access() {
        let (store, map) = memory_map();
        map.put(1, "a").unwrap();
        map.remove_map().unwrap();
        assert!(map.get(1).is_err());
        assert!(map.put(1, "b").is_err());
        assert!(!store.has_map("test").unwrap());
    }
}
