// src/services/dedup.rs
//! Cache of shared context fragments keyed by dedup id.
//!
//! Order is driven by payload succession: a dedup payload bumps each of its ids
//! to the front, then everything behind its first id is evicted. Fragments are
//! handed back to the caller on eviction and are never dropped silently.

use std::collections::HashMap;

struct Node<F> {
    id: u64,
    fragment: F,
    prev: Option<usize>,
    next: Option<usize>,
}

pub struct LruDedupCache<F> {
    slots: Vec<Option<Node<F>>>,
    free: Vec<usize>,
    index: HashMap<u64, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<F> Default for LruDedupCache<F> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
        }
    }
}

impl<F> LruDedupCache<F> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn exists(&self, id: u64) -> bool {
        self.index.contains_key(&id)
    }

    pub fn get(&self, id: u64) -> Option<&F> {
        let slot = *self.index.get(&id)?;
        self.slots[slot].as_ref().map(|n| &n.fragment)
    }

    /// Inserts at the front. If `id` was already cached its old fragment is
    /// returned so the caller can release it.
    pub fn add(&mut self, id: u64, fragment: F) -> Option<F> {
        if let Some(&slot) = self.index.get(&id) {
            self.unlink(slot);
            self.push_front(slot);
            let node = self.slots[slot].as_mut()?;
            return Some(std::mem::replace(&mut node.fragment, fragment));
        }
        let node = Node {
            id,
            fragment,
            prev: None,
            next: None,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.index.insert(id, slot);
        self.push_front(slot);
        None
    }

    /// Moves an existing id to the front. Unknown ids are ignored.
    pub fn update(&mut self, id: u64) -> bool {
        let Some(&slot) = self.index.get(&id) else {
            return false;
        };
        self.unlink(slot);
        self.push_front(slot);
        true
    }

    /// Evicts every entry behind `id`. Returns how many were released.
    pub fn clear_after(&mut self, id: u64, mut release: impl FnMut(F)) -> usize {
        let Some(&slot) = self.index.get(&id) else {
            return 0;
        };
        let mut cursor = self.slots[slot].as_ref().and_then(|n| n.next);
        if let Some(node) = self.slots[slot].as_mut() {
            node.next = None;
        }
        self.tail = Some(slot);

        let mut evicted = 0;
        while let Some(cur) = cursor {
            let Some(node) = self.slots[cur].take() else {
                break;
            };
            cursor = node.next;
            self.index.remove(&node.id);
            self.free.push(cur);
            release(node.fragment);
            evicted += 1;
        }
        evicted
    }

    /// Releases everything.
    pub fn clear(&mut self, mut release: impl FnMut(F)) {
        for node in self.slots.drain(..).flatten() {
            release(node.fragment);
        }
        self.free.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
    }

    /// Ids from most to least recently bumped.
    pub fn ids_in_order(&self) -> Vec<u64> {
        let mut out = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while let Some(cur) = cursor {
            let Some(node) = self.slots[cur].as_ref() else {
                break;
            };
            out.push(node.id);
            cursor = node.next;
        }
        out
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = match self.slots[slot].as_ref() {
            Some(n) => (n.prev, n.next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(n) = self.slots[p].as_mut() {
                    n.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(nx) => {
                if let Some(n) = self.slots[nx].as_mut() {
                    n.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(n) = self.slots[slot].as_mut() {
            n.prev = None;
            n.next = None;
        }
    }

    fn push_front(&mut self, slot: usize) {
        let old_head = self.head;
        if let Some(n) = self.slots[slot].as_mut() {
            n.prev = None;
            n.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(n) = self.slots[h].as_mut() {
                n.prev = Some(slot);
            }
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }
}
