// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Indexed binary heap keyed by a single ordering field.
//!
//! The position map keeps remove-by-key and update-by-key at O(log n), and
//! updates reposition an entry without disturbing its insertion sequence,
//! so callers holding a key never lose their slot identity.

use muster_core::ItemKey;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Instant;

/// The ordering field a sub-queue sorts by.
///
/// `Time` sorts earliest-first (delay queue: ready-at; run queue: release
/// deadline). `PriorityFifo` sorts highest-priority-first, then by the
/// insertion sequence (ready queue).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Time(Instant),
    PriorityFifo(u8),
}

impl SortKey {
    /// Min-heap ordering: "less" pops first.
    fn heap_cmp(&self, other: &SortKey) -> Ordering {
        match (self, other) {
            (SortKey::Time(a), SortKey::Time(b)) => a.cmp(b),
            // Higher priority pops first
            (SortKey::PriorityFifo(a), SortKey::PriorityFifo(b)) => b.cmp(a),
            // A sub-queue never mixes variants; keep Ord total anyway
            (SortKey::Time(_), SortKey::PriorityFifo(_)) => Ordering::Less,
            (SortKey::PriorityFifo(_), SortKey::Time(_)) => Ordering::Greater,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    sort: SortKey,
    /// Tie-break for equal sort keys: insertion order.
    seq: u64,
    key: ItemKey,
}

impl Entry {
    fn heap_cmp(&self, other: &Entry) -> Ordering {
        self.sort.heap_cmp(&other.sort).then(self.seq.cmp(&other.seq))
    }
}

/// A mutable ordered collection with O(log n) push, pop-min, remove and
/// update, parameterised by which field of the item orders it.
#[derive(Debug, Default)]
pub struct SubQueue {
    heap: Vec<Entry>,
    pos: HashMap<ItemKey, usize>,
}

impl SubQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, key: &ItemKey) -> bool {
        self.pos.contains_key(key)
    }

    /// Insert a key with its ordering field and insertion sequence.
    ///
    /// The key must not already be present.
    pub fn push(&mut self, key: ItemKey, sort: SortKey, seq: u64) {
        debug_assert!(!self.pos.contains_key(&key));
        let idx = self.heap.len();
        self.pos.insert(key.clone(), idx);
        self.heap.push(Entry { sort, seq, key });
        self.sift_up(idx);
    }

    /// Remove and return the minimum entry's key.
    pub fn pop(&mut self) -> Option<ItemKey> {
        if self.heap.is_empty() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.heap.swap(0, last);
        self.fix_pos(0);
        let entry = self.heap.pop().map(|e| {
            self.pos.remove(&e.key);
            e.key
        });
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        entry
    }

    /// The minimum entry without removing it.
    pub fn peek(&self) -> Option<(&ItemKey, &SortKey)> {
        self.heap.first().map(|e| (&e.key, &e.sort))
    }

    /// Remove an arbitrary key. Returns false if it was not present.
    pub fn remove(&mut self, key: &ItemKey) -> bool {
        let Some(idx) = self.pos.remove(key) else {
            return false;
        };
        let last = self.heap.len() - 1;
        if idx == last {
            self.heap.pop();
            return true;
        }
        self.heap.swap(idx, last);
        self.heap.pop();
        self.fix_pos(idx);
        self.sift_down(idx);
        self.sift_up(idx);
        true
    }

    /// Reposition a key after its ordering field changed. The entry keeps
    /// its insertion sequence. Returns false if the key was not present.
    pub fn update(&mut self, key: &ItemKey, sort: SortKey) -> bool {
        let Some(&idx) = self.pos.get(key) else {
            return false;
        };
        self.heap[idx].sort = sort;
        self.sift_down(idx);
        self.sift_up(idx);
        true
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.pos.clear();
    }

    fn fix_pos(&mut self, idx: usize) {
        if let Some(entry) = self.heap.get(idx) {
            self.pos.insert(entry.key.clone(), idx);
        }
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.heap[idx].heap_cmp(&self.heap[parent]) == Ordering::Less {
                self.heap.swap(idx, parent);
                self.fix_pos(idx);
                self.fix_pos(parent);
                idx = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * idx + 1;
            let right = 2 * idx + 2;
            let mut smallest = idx;
            if left < len && self.heap[left].heap_cmp(&self.heap[smallest]) == Ordering::Less {
                smallest = left;
            }
            if right < len && self.heap[right].heap_cmp(&self.heap[smallest]) == Ordering::Less {
                smallest = right;
            }
            if smallest == idx {
                break;
            }
            self.heap.swap(idx, smallest);
            self.fix_pos(idx);
            self.fix_pos(smallest);
            idx = smallest;
        }
    }
}

#[cfg(test)]
#[path = "sub_queue_tests.rs"]
mod tests;
