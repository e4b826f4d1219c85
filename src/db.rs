//! The keyspace: a single flat map of key bytes to typed entries, plus the
//! expiration heap. All mutation happens on the event-loop thread; the
//! structure is owned by the server value and passed down explicitly.

use tracing::debug;

use crate::heap::{self, HeapItem};
use crate::hmap::{str_hash, HMap};
use crate::zset::ZSet;

/// Keys expired per timer tick; bounds the sweep so one tick stays short.
const K_MAX_EXPIRE_WORKS: usize = 2000;

#[derive(Debug)]
pub enum Value {
    Str(Vec<u8>),
    ZSet(ZSet),
}

#[derive(Debug)]
pub struct Entry {
    key: Vec<u8>,
    pub value: Value,
    heap_idx: Option<usize>,
}

impl Entry {
    pub fn new(key: Vec<u8>, value: Value) -> Self {
        Self {
            key,
            value,
            heap_idx: None,
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }
}

#[derive(Default)]
pub struct Db {
    index: HMap<Entry>,
    heap: Vec<HeapItem>,
}

impl Db {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn get(&self, key: &[u8]) -> Option<&Entry> {
        self.index.lookup(str_hash(key), |e| e.key == key)
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut Entry> {
        self.index.lookup_mut(str_hash(key), |e| e.key == key)
    }

    pub fn insert(&mut self, entry: Entry) {
        self.index.insert(str_hash(&entry.key), entry);
    }

    /// Drop a key, its value, and any pending expiration. Returns whether
    /// the key existed.
    pub fn remove(&mut self, key: &[u8]) -> bool {
        let Some(entry) = self.index.remove(str_hash(key), |e| e.key == key) else {
            return false;
        };
        if let Some(pos) = entry.heap_idx {
            let index = &mut self.index;
            heap::remove(&mut self.heap, pos, |item, i| {
                set_backlink(index, item, i);
            });
        }
        true
    }

    pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
        self.index.iter().map(|e| e.key.as_slice())
    }

    /// Set or clear a key's time to live. A negative `ttl_ms` clears it.
    /// Returns whether the key exists.
    pub fn set_ttl(&mut self, key: &[u8], ttl_ms: i64, now_ms: u64) -> bool {
        let hcode = str_hash(key);
        let Some(cur_idx) = self
            .index
            .lookup(hcode, |e| e.key == key)
            .map(|e| e.heap_idx)
        else {
            return false;
        };
        let index = &mut self.index;
        if ttl_ms < 0 {
            if let Some(pos) = cur_idx {
                heap::remove(&mut self.heap, pos, |item, i| {
                    set_backlink(index, item, i);
                });
                if let Some(e) = index.lookup_mut(hcode, |e| e.key == key) {
                    e.heap_idx = None;
                }
            }
            return true;
        }
        let at_ms = now_ms.saturating_add(ttl_ms as u64);
        match cur_idx {
            Some(pos) => {
                self.heap[pos].at_ms = at_ms;
                heap::update(&mut self.heap, pos, |item, i| {
                    set_backlink(index, item, i);
                });
            }
            None => {
                let item = HeapItem {
                    at_ms,
                    hcode,
                    key: key.to_vec(),
                };
                heap::push(&mut self.heap, item, |item, i| {
                    set_backlink(index, item, i);
                });
            }
        }
        true
    }

    /// Remaining TTL in milliseconds: `None` when the key has no deadline.
    pub fn ttl_ms(&self, entry: &Entry, now_ms: u64) -> Option<u64> {
        let pos = entry.heap_idx?;
        Some(self.heap[pos].at_ms.saturating_sub(now_ms))
    }

    /// Earliest pending expiration.
    pub fn next_expiry_ms(&self) -> Option<u64> {
        self.heap.first().map(|item| item.at_ms)
    }

    /// Remove keys whose deadline has passed, up to the per-tick bound.
    pub fn expire_keys(&mut self, now_ms: u64) {
        let mut nworks = 0;
        while nworks < K_MAX_EXPIRE_WORKS {
            let due = match self.heap.first() {
                Some(item) if item.at_ms <= now_ms => item.key.clone(),
                _ => break,
            };
            debug!(key = %String::from_utf8_lossy(&due), "key expired");
            self.remove(&due);
            nworks += 1;
        }
    }
}

fn set_backlink(index: &mut HMap<Entry>, item: &HeapItem, pos: usize) {
    if let Some(entry) = index.lookup_mut(item.hcode, |e| e.key() == item.key.as_slice()) {
        entry.heap_idx = Some(pos);
    }
}
