//! # Cursors
//!
//! [`Cursor`] walks the keys of one pinned root in order, with an efficient
//! `skip` that uses the per-level entry counts to jump in O(log n) instead
//! of stepping. [`ChangeCursor`] yields the keys living in pages that differ
//! between two roots, pruning shared subtrees by their on-disk positions.
//!
//! Both cursors pin the root they were created from: writes and commits
//! happening while a cursor is open do not affect what it sees.

use std::sync::Arc;

use eyre::Result;
use hashbrown::HashSet;
use smallvec::SmallVec;

use super::map::MapInner;
use super::page::{pos_is_leaf, Page, PageContent};
use crate::types::Value;

struct CursorPos {
    page: Arc<Page>,
    index: usize,
}

/// Ordered key cursor over a pinned root.
pub struct Cursor {
    map: Arc<MapInner>,
    root: Arc<Page>,
    stack: SmallVec<[CursorPos; 8]>,
}

impl Cursor {
    pub(crate) fn new(map: Arc<MapInner>, root: Arc<Page>, from: Option<Value>) -> Result<Cursor> {
        let mut cursor = Cursor {
            map,
            root: root.clone(),
            stack: SmallVec::new(),
        };
        cursor.descend_min(root, from.as_ref())?;
        Ok(cursor)
    }

    /// Positions the cursor at the first key `>= from` within `p`.
    fn descend_min(&mut self, mut p: Arc<Page>, from: Option<&Value>) -> Result<()> {
        loop {
            if p.is_leaf() {
                let index = match from {
                    None => 0,
                    Some(k) => match p.binary_search(k, &*self.map.key_type) {
                        Ok(i) => i,
                        Err(i) => i,
                    },
                };
                self.stack.push(CursorPos { page: p, index });
                return Ok(());
            }
            let index = match from {
                None => 0,
                Some(k) => match p.binary_search(k, &*self.map.key_type) {
                    Ok(i) => i + 1,
                    Err(i) => i,
                },
            };
            let child = self.map.child_page(&p, index)?;
            self.stack.push(CursorPos { page: p, index });
            p = child;
        }
    }

    /// Returns the next key, or `None` at the end.
    pub fn next(&mut self) -> Result<Option<Value>> {
        loop {
            let Some(top) = self.stack.last_mut() else {
                return Ok(None);
            };
            if top.page.is_leaf() {
                if top.index < top.page.key_count() {
                    let key = top.page.key(top.index).clone();
                    top.index += 1;
                    return Ok(Some(key));
                }
                self.stack.pop();
                continue;
            }
            top.index += 1;
            if top.index < top.page.child_count() {
                let page = top.page.clone();
                let index = top.index;
                let mut p = self.map.child_page(&page, index)?;
                loop {
                    if p.is_leaf() {
                        self.stack.push(CursorPos { page: p, index: 0 });
                        break;
                    }
                    let child = self.map.child_page(&p, 0)?;
                    self.stack.push(CursorPos { page: p, index: 0 });
                    p = child;
                }
            } else {
                self.stack.pop();
            }
        }
    }

    /// Skips `n` keys. Small skips step; large skips compute the target rank
    /// from the per-level counts and re-position in O(log n).
    pub fn skip(&mut self, mut n: u64) -> Result<()> {
        if n < 10 {
            while n > 0 {
                if self.next()?.is_none() {
                    return Ok(());
                }
                n -= 1;
            }
            return Ok(());
        }
        let Some(first) = self.next()? else {
            return Ok(());
        };
        let index = self.map.key_index_in(&self.root, &first)?;
        self.stack.clear();
        match self.map.key_at_in(&self.root, index + n as i64)? {
            Some(key) => {
                let root = self.root.clone();
                self.descend_min(root, Some(&key))?;
            }
            None => {} // skipped past the end
        }
        Ok(())
    }
}

/// Cursor over the keys of pages that differ between two roots.
pub struct ChangeCursor {
    map: Arc<MapInner>,
    old_positions: HashSet<u64>,
    stack: Vec<CursorPos>,
}

impl ChangeCursor {
    pub(crate) fn new(
        map: Arc<MapInner>,
        root: Arc<Page>,
        old_root: Arc<Page>,
    ) -> Result<ChangeCursor> {
        let mut old_positions = HashSet::new();
        Self::collect_positions(&map, &old_root, &mut old_positions)?;
        let mut cursor = ChangeCursor {
            map,
            old_positions,
            stack: Vec::new(),
        };
        if !cursor.is_shared(root.pos()) {
            cursor.stack.push(CursorPos {
                page: root,
                index: 0,
            });
        }
        Ok(cursor)
    }

    fn collect_positions(
        map: &Arc<MapInner>,
        page: &Arc<Page>,
        set: &mut HashSet<u64>,
    ) -> Result<()> {
        if page.pos() != 0 {
            set.insert(page.pos());
        }
        if let PageContent::Node { children, .. } = page.content() {
            for child in children {
                if let Some(c) = child.cached() {
                    Self::collect_positions(map, &c, set)?;
                } else {
                    let pos = child.pos();
                    if pos == 0 {
                        continue;
                    }
                    if pos_is_leaf(pos) {
                        set.insert(pos);
                    } else {
                        let c = map.read_page(pos)?;
                        Self::collect_positions(map, &c, set)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn is_shared(&self, pos: u64) -> bool {
        pos != 0 && self.old_positions.contains(&pos)
    }

    /// Returns the next key of a changed page, or `None` at the end.
    pub fn next(&mut self) -> Result<Option<Value>> {
        loop {
            let Some(top) = self.stack.last_mut() else {
                return Ok(None);
            };
            if top.page.is_leaf() {
                if top.index < top.page.key_count() {
                    let key = top.page.key(top.index).clone();
                    top.index += 1;
                    return Ok(Some(key));
                }
                self.stack.pop();
                continue;
            }
            let index = top.index;
            top.index += 1;
            if index < top.page.child_count() {
                let page = top.page.clone();
                if self.is_shared(page.child_ref(index).pos()) {
                    continue;
                }
                let child = self.map.child_page(&page, index)?;
                self.stack.push(CursorPos {
                    page: child,
                    index: 0,
                });
            } else {
                self.stack.pop();
            }
        }
    }
}
