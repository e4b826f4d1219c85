//! Sorted set: a name-to-score mapping with range queries by `(score, name)`.
//!
//! Nodes live in an arena owned by the set; the name hash index and the
//! ordered tree both refer to them by handle, so one allocation serves both
//! views and neither holds a reference into the other.

use ordered_float::OrderedFloat;

use crate::avl::AvlTree;
use crate::hmap::{str_hash, HMap};

#[derive(Debug, Default)]
pub struct ZNode {
    name: Vec<u8>,
    score: f64,
    hcode: u64,
}

#[derive(Debug, Default)]
pub struct ZSet {
    nodes: Vec<ZNode>,
    free: Vec<u32>,
    by_name: HMap<u32>,
    tree: AvlTree,
}

fn zless(a: &ZNode, b: &ZNode) -> bool {
    (OrderedFloat(a.score), a.name.as_slice()) < (OrderedFloat(b.score), b.name.as_slice())
}

impl ZSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn name(&self, handle: u32) -> &[u8] {
        &self.nodes[handle as usize].name
    }

    pub fn score(&self, handle: u32) -> f64 {
        self.nodes[handle as usize].score
    }

    /// Add `name` with `score`, or update the score of an existing member.
    /// Returns `true` iff the member is new.
    pub fn insert(&mut self, name: &[u8], score: f64) -> bool {
        debug_assert!(!score.is_nan());
        if let Some(handle) = self.lookup(name) {
            self.update_score(handle, score);
            return false;
        }
        let hcode = str_hash(name);
        let node = ZNode {
            name: name.to_vec(),
            score,
            hcode,
        };
        let handle = match self.free.pop() {
            Some(h) => {
                self.nodes[h as usize] = node;
                h
            }
            None => {
                self.nodes.push(node);
                (self.nodes.len() - 1) as u32
            }
        };
        self.by_name.insert(hcode, handle);
        let nodes = &self.nodes;
        self.tree
            .insert(handle, |a, b| zless(&nodes[a as usize], &nodes[b as usize]));
        true
    }

    pub fn lookup(&self, name: &[u8]) -> Option<u32> {
        let nodes = &self.nodes;
        self.by_name
            .lookup(str_hash(name), |&h| nodes[h as usize].name == name)
            .copied()
    }

    /// Remove a member. Returns `true` iff it was present.
    pub fn remove(&mut self, name: &[u8]) -> bool {
        let nodes = &self.nodes;
        let handle = self
            .by_name
            .remove(str_hash(name), |&h| nodes[h as usize].name == name);
        match handle {
            Some(h) => {
                self.tree.remove(h);
                self.nodes[h as usize] = ZNode::default();
                self.free.push(h);
                true
            }
            None => false,
        }
    }

    /// Least member with `(score, name) >= (target_score, target_name)`.
    pub fn seekge(&self, target_score: f64, target_name: &[u8]) -> Option<u32> {
        let nodes = &self.nodes;
        let target = (OrderedFloat(target_score), target_name);
        self.tree.lower_bound(|h| {
            let n = &nodes[h as usize];
            (OrderedFloat(n.score), n.name.as_slice()) >= target
        })
    }

    /// Walk `offset` ranks from `handle` in `(score, name)` order.
    pub fn offset(&self, handle: u32, offset: i64) -> Option<u32> {
        self.tree.offset(handle, offset)
    }

    fn update_score(&mut self, handle: u32, score: f64) {
        if self.nodes[handle as usize].score == score {
            return;
        }
        // the tree position depends on the score: detach, update, reinsert
        self.tree.remove(handle);
        self.nodes[handle as usize].score = score;
        let nodes = &self.nodes;
        self.tree
            .insert(handle, |a, b| zless(&nodes[a as usize], &nodes[b as usize]));
    }
}
