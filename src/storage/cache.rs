//! # LIRS Page Cache
//!
//! Decoded pages are cached by their on-disk position in a cache using the
//! LIRS (Low Inter-reference Recency Set) replacement policy. Plain LRU has
//! a bad failure mode for storage engines: one sequential scan of a large
//! map evicts the whole working set. LIRS keeps entries with low
//! inter-reference recency ("LIR", the protected majority of the budget) and
//! cycles scan traffic through a small "HIR" queue, so one-shot pages leave
//! quickly while hot pages survive.
//!
//! ## Sharding
//!
//! The cache is split into [`CACHE_SEGMENT_COUNT`](crate::config) segments,
//! each behind its own mutex, indexed by a hash of the page position. There
//! is no global lock.
//!
//! ## Weighting
//!
//! Entries are weighted by their decoded memory cost, not by count; the
//! budget is bytes. Entries larger than a segment's whole budget are not
//! cached.
//!
//! ## Bookkeeping
//!
//! Each segment keeps the LIRS stack (recency order, holding LIR entries and
//! recently seen HIR entries) and the queue of resident HIR entries. Stack
//! and queue hold `(stamp, key)` pairs and entries record their current
//! stamps, so moving an entry is a push plus a lazily skipped stale pair
//! rather than a linear removal. Structures are compacted when stale pairs
//! dominate.

use std::collections::VecDeque;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::config::CACHE_SEGMENT_COUNT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Lir,
    HirResident,
    HirNonResident,
}

#[derive(Debug)]
struct Entry<V> {
    value: Option<V>,
    memory: usize,
    state: State,
    stack_stamp: u64,
    queue_stamp: u64,
}

#[derive(Debug)]
struct Segment<V> {
    map: HashMap<u64, Entry<V>>,
    stack: VecDeque<(u64, u64)>,
    queue: VecDeque<(u64, u64)>,
    next_stamp: u64,
    max_memory: usize,
    lir_memory: usize,
    resident_memory: usize,
}

impl<V: Clone> Segment<V> {
    fn new(max_memory: usize) -> Self {
        Self {
            map: HashMap::new(),
            stack: VecDeque::new(),
            queue: VecDeque::new(),
            next_stamp: 1,
            max_memory,
            lir_memory: 0,
            resident_memory: 0,
        }
    }

    fn lir_target(&self) -> usize {
        self.max_memory - self.max_memory / 16
    }

    fn touch_stack(&mut self, key: u64) {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        if let Some(e) = self.map.get_mut(&key) {
            e.stack_stamp = stamp;
        }
        self.stack.push_back((stamp, key));
        if self.stack.len() > 4 * self.map.len() + 16 {
            self.compact_stack();
        }
    }

    fn push_queue(&mut self, key: u64) {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        if let Some(e) = self.map.get_mut(&key) {
            e.queue_stamp = stamp;
        }
        self.queue.push_back((stamp, key));
        if self.queue.len() > 4 * self.map.len() + 16 {
            self.compact_queue();
        }
    }

    fn compact_stack(&mut self) {
        let map = &self.map;
        self.stack
            .retain(|&(stamp, key)| map.get(&key).is_some_and(|e| e.stack_stamp == stamp));
    }

    fn compact_queue(&mut self) {
        let map = &self.map;
        self.queue
            .retain(|&(stamp, key)| map.get(&key).is_some_and(|e| e.queue_stamp == stamp));
    }

    /// Pops non-LIR entries off the stack bottom until a LIR entry (or
    /// nothing) remains. Non-resident entries falling off the stack are
    /// forgotten entirely.
    fn prune_stack(&mut self) {
        while let Some(&(stamp, key)) = self.stack.front() {
            let Some(e) = self.map.get_mut(&key) else {
                self.stack.pop_front();
                continue;
            };
            if e.stack_stamp != stamp {
                self.stack.pop_front();
                continue;
            }
            if e.state == State::Lir {
                break;
            }
            e.stack_stamp = 0;
            if e.state == State::HirNonResident {
                self.map.remove(&key);
            }
            self.stack.pop_front();
        }
    }

    /// Moves the bottom LIR entry to the HIR queue.
    fn demote_bottom_lir(&mut self) -> bool {
        while let Some(&(stamp, key)) = self.stack.front() {
            let Some(e) = self.map.get_mut(&key) else {
                self.stack.pop_front();
                continue;
            };
            if e.stack_stamp != stamp {
                self.stack.pop_front();
                continue;
            }
            if e.state != State::Lir {
                self.prune_stack();
                continue;
            }
            e.state = State::HirResident;
            e.stack_stamp = 0;
            self.lir_memory -= e.memory;
            self.stack.pop_front();
            self.push_queue(key);
            self.prune_stack();
            return true;
        }
        false
    }

    fn evict(&mut self) {
        while self.resident_memory > self.max_memory {
            let Some(&(stamp, key)) = self.queue.front() else {
                // no resident HIR entries left; demote LIR mass into the
                // queue and retry
                if !self.demote_bottom_lir() {
                    break;
                }
                continue;
            };
            self.queue.pop_front();
            let Some(e) = self.map.get_mut(&key) else {
                continue;
            };
            if e.queue_stamp != stamp {
                continue;
            }
            e.queue_stamp = 0;
            e.value = None;
            e.state = State::HirNonResident;
            self.resident_memory -= e.memory;
            if e.stack_stamp == 0 {
                self.map.remove(&key);
            }
        }
    }

    fn get(&mut self, key: u64) -> Option<V> {
        let e = self.map.get_mut(&key)?;
        let value = e.value.clone()?;
        match e.state {
            State::Lir => {
                self.touch_stack(key);
                self.prune_stack();
            }
            State::HirResident => {
                if e.stack_stamp != 0 {
                    // re-referenced while still on the stack: low
                    // inter-reference recency, promote to LIR
                    e.state = State::Lir;
                    e.queue_stamp = 0;
                    self.lir_memory += e.memory;
                    self.touch_stack(key);
                    while self.lir_memory > self.lir_target() {
                        if !self.demote_bottom_lir() {
                            break;
                        }
                    }
                    self.prune_stack();
                } else {
                    self.touch_stack(key);
                    self.push_queue(key);
                }
            }
            State::HirNonResident => return None,
        }
        Some(value)
    }

    fn insert(&mut self, key: u64, value: V, memory: usize) {
        if memory > self.max_memory {
            self.remove(key);
            return;
        }
        let was_ghost = match self.map.get_mut(&key) {
            Some(e) => {
                if e.value.take().is_some() {
                    self.resident_memory -= e.memory;
                    if e.state == State::Lir {
                        self.lir_memory -= e.memory;
                    }
                }
                e.state == State::HirNonResident && e.stack_stamp != 0
            }
            None => {
                self.map.insert(
                    key,
                    Entry {
                        value: None,
                        memory: 0,
                        state: State::HirNonResident,
                        stack_stamp: 0,
                        queue_stamp: 0,
                    },
                );
                false
            }
        };

        let make_lir = was_ghost || self.lir_memory + memory <= self.lir_target();
        let e = self.map.get_mut(&key).unwrap();
        e.value = Some(value);
        e.memory = memory;
        e.state = if make_lir {
            State::Lir
        } else {
            State::HirResident
        };
        e.queue_stamp = 0;
        self.resident_memory += memory;
        if make_lir {
            self.lir_memory += memory;
        }
        self.touch_stack(key);
        if !make_lir {
            self.push_queue(key);
        }
        while self.lir_memory > self.lir_target() {
            if !self.demote_bottom_lir() {
                break;
            }
        }
        self.prune_stack();
        self.evict();
    }

    fn remove(&mut self, key: u64) {
        if let Some(e) = self.map.remove(&key) {
            if e.value.is_some() {
                self.resident_memory -= e.memory;
                if e.state == State::Lir {
                    self.lir_memory -= e.memory;
                }
            }
        }
    }

    fn set_max_memory(&mut self, max: usize) {
        self.max_memory = max.max(1);
        while self.lir_memory > self.lir_target() {
            if !self.demote_bottom_lir() {
                break;
            }
        }
        self.evict();
    }
}

/// Memory-weighted LIRS cache with segment-local locking.
pub struct LirsCache<V: Clone> {
    segments: Vec<Mutex<Segment<V>>>,
}

impl<V: Clone> LirsCache<V> {
    /// Creates a cache with the given total budget in bytes.
    pub fn new(max_memory: usize) -> Self {
        let per_segment = (max_memory / CACHE_SEGMENT_COUNT).max(1);
        let segments = (0..CACHE_SEGMENT_COUNT)
            .map(|_| Mutex::new(Segment::new(per_segment)))
            .collect();
        Self { segments }
    }

    fn segment(&self, key: u64) -> &Mutex<Segment<V>> {
        // low 6 bits of a page position hold the length code and type
        let index = ((key >> 6).wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as usize;
        &self.segments[index % self.segments.len()]
    }

    pub fn get(&self, key: u64) -> Option<V> {
        self.segment(key).lock().get(key)
    }

    pub fn insert(&self, key: u64, value: V, memory: usize) {
        self.segment(key).lock().insert(key, value, memory);
    }

    pub fn remove(&self, key: u64) {
        self.segment(key).lock().remove(key);
    }

    /// Adjusts the total budget; evicts immediately if shrinking.
    pub fn set_max_memory(&self, max_memory: usize) {
        let per_segment = (max_memory / self.segments.len()).max(1);
        for seg in &self.segments {
            seg.lock().set_max_memory(per_segment);
        }
    }

    /// Bytes currently held by resident entries.
    pub fn used_memory(&self) -> usize {
        self.segments.iter().map(|s| s.lock().resident_memory).sum()
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.segments
            .iter()
            .map(|s| {
                s.lock()
                    .map
                    .values()
                    .filter(|e| e.value.is_some())
                    .count()
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // exercise a single segment so eviction decisions are deterministic
    fn single_segment(max: usize) -> Segment<u64> {
        Segment::new(max)
    }

    #[test]
    fn basic_insert_and_get() {
        let cache: LirsCache<u64> = LirsCache::new(1 << 20);
        cache.insert(64, 7, 100);
        assert_eq!(cache.get(64), Some(7));
        assert_eq!(cache.get(128), None);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.used_memory(), 100);
    }

    #[test]
    fn remove_releases_memory() {
        let cache: LirsCache<u64> = LirsCache::new(1 << 20);
        cache.insert(64, 7, 100);
        cache.remove(64);
        assert_eq!(cache.get(64), None);
        assert_eq!(cache.used_memory(), 0);
    }

    #[test]
    fn memory_stays_bounded() {
        let mut seg = single_segment(1000);
        for i in 0..100u64 {
            seg.insert(i << 6, i, 100);
        }
        assert!(seg.resident_memory <= 1000);
    }

    #[test]
    fn hot_entries_survive_a_scan() {
        let mut seg = single_segment(1000);
        // build a small hot set and touch it again so it becomes LIR
        for i in 0..5u64 {
            seg.insert(i << 6, i, 100);
        }
        for i in 0..5u64 {
            assert!(seg.get(i << 6).is_some());
        }
        // a long one-shot scan
        for i in 100..200u64 {
            seg.insert(i << 6, i, 100);
        }
        let survivors = (0..5u64).filter(|&i| seg.get(i << 6).is_some()).count();
        assert!(survivors >= 4, "hot set evicted by scan: {}", survivors);
    }

    #[test]
    fn rewrite_replaces_value_and_weight() {
        let mut seg = single_segment(1000);
        seg.insert(64, 1, 600);
        seg.insert(64, 2, 100);
        assert_eq!(seg.get(64), Some(2));
        assert_eq!(seg.resident_memory, 100);
    }

    #[test]
    fn oversized_entries_are_not_cached() {
        let mut seg = single_segment(1000);
        seg.insert(64, 1, 4000);
        assert_eq!(seg.get(64), None);
        assert_eq!(seg.resident_memory, 0);
    }

    #[test]
    fn shrinking_the_budget_evicts() {
        let cache: LirsCache<u64> = LirsCache::new(1 << 20);
        for i in 0..64u64 {
            cache.insert(i << 6, i, 4096);
        }
        cache.set_max_memory(16 * 1024);
        assert!(cache.used_memory() <= 16 * 1024);
    }
}
