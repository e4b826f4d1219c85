//! AVL tree over arena handles.
//!
//! The tree owns only link records (parent/left/right plus subtree height and
//! count), indexed by the same `u32` handles the caller's arena uses. Payload
//! never moves between handles, so a secondary index holding the same handles
//! stays valid across rebalancing and deletion. Ordering is supplied per
//! operation as a closure over handles.

pub const NIL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy)]
struct AvlNode {
    parent: u32,
    left: u32,
    right: u32,
    height: u32,
    count: u32,
}

const DETACHED: AvlNode = AvlNode {
    parent: NIL,
    left: NIL,
    right: NIL,
    height: 0,
    count: 0,
};

#[derive(Debug)]
pub struct AvlTree {
    nodes: Vec<AvlNode>,
    root: u32,
}

impl Default for AvlTree {
    fn default() -> Self {
        Self::new()
    }
}

impl AvlTree {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            root: NIL,
        }
    }

    pub fn len(&self) -> usize {
        self.count(self.root) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.root == NIL
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.root = NIL;
    }

    /// Insert `handle`, descending with `lt(a, b)` = "a orders before b".
    /// The handle must not already be in the tree.
    pub fn insert(&mut self, handle: u32, lt: impl Fn(u32, u32) -> bool) {
        if handle as usize >= self.nodes.len() {
            self.nodes.resize(handle as usize + 1, DETACHED);
        }
        self.nodes[handle as usize] = AvlNode {
            parent: NIL,
            left: NIL,
            right: NIL,
            height: 1,
            count: 1,
        };
        if self.root == NIL {
            self.root = handle;
            return;
        }
        let mut cur = self.root;
        loop {
            let go_left = lt(handle, cur);
            let next = if go_left {
                self.nodes[cur as usize].left
            } else {
                self.nodes[cur as usize].right
            };
            if next == NIL {
                if go_left {
                    self.nodes[cur as usize].left = handle;
                } else {
                    self.nodes[cur as usize].right = handle;
                }
                self.nodes[handle as usize].parent = cur;
                self.root = self.fix(handle);
                return;
            }
            cur = next;
        }
    }

    /// Remove `handle` from the tree. Its arena slot is untouched.
    pub fn remove(&mut self, handle: u32) {
        self.root = self.detach(handle);
        self.nodes[handle as usize] = DETACHED;
    }

    /// Least node for which `ge` holds, assuming `ge` is monotone along the
    /// tree order (false ... false true ... true).
    pub fn lower_bound(&self, ge: impl Fn(u32) -> bool) -> Option<u32> {
        let mut found = None;
        let mut cur = self.root;
        while cur != NIL {
            if ge(cur) {
                found = Some(cur);
                cur = self.nodes[cur as usize].left;
            } else {
                cur = self.nodes[cur as usize].right;
            }
        }
        found
    }

    /// Walk `offset` ranks from `node`; negative offsets walk toward smaller
    /// elements. `None` when the target rank falls off either end.
    pub fn offset(&self, node: u32, offset: i64) -> Option<u32> {
        let mut pos = 0i64;
        let mut cur = node;
        while pos != offset {
            let n = self.nodes[cur as usize];
            let right_count = self.count(n.right) as i64;
            let left_count = self.count(n.left) as i64;
            if pos < offset && pos + right_count >= offset {
                // target is inside the right subtree
                cur = n.right;
                pos += self.count(self.nodes[cur as usize].left) as i64 + 1;
            } else if pos > offset && pos - left_count <= offset {
                // target is inside the left subtree
                cur = n.left;
                pos -= self.count(self.nodes[cur as usize].right) as i64 + 1;
            } else {
                let parent = n.parent;
                if parent == NIL {
                    return None;
                }
                if self.nodes[parent as usize].right == cur {
                    pos -= left_count + 1;
                } else {
                    pos += right_count + 1;
                }
                cur = parent;
            }
        }
        Some(cur)
    }

    fn height(&self, node: u32) -> u32 {
        if node == NIL {
            0
        } else {
            self.nodes[node as usize].height
        }
    }

    fn count(&self, node: u32) -> u32 {
        if node == NIL {
            0
        } else {
            self.nodes[node as usize].count
        }
    }

    fn update(&mut self, node: u32) {
        let n = self.nodes[node as usize];
        self.nodes[node as usize].height = 1 + self.height(n.left).max(self.height(n.right));
        self.nodes[node as usize].count = 1 + self.count(n.left) + self.count(n.right);
    }

    /// Replace `parent`'s child link `old` with `new` (or move the root).
    fn relink(&mut self, parent: u32, old: u32, new: u32) {
        if parent == NIL {
            return;
        }
        let p = &mut self.nodes[parent as usize];
        if p.left == old {
            p.left = new;
        } else {
            debug_assert_eq!(p.right, old);
            p.right = new;
        }
    }

    fn rot_left(&mut self, node: u32) -> u32 {
        let pivot = self.nodes[node as usize].right;
        let inner = self.nodes[pivot as usize].left;
        let parent = self.nodes[node as usize].parent;

        self.nodes[node as usize].right = inner;
        if inner != NIL {
            self.nodes[inner as usize].parent = node;
        }
        self.nodes[pivot as usize].left = node;
        self.nodes[node as usize].parent = pivot;
        self.nodes[pivot as usize].parent = parent;
        self.relink(parent, node, pivot);

        self.update(node);
        self.update(pivot);
        pivot
    }

    fn rot_right(&mut self, node: u32) -> u32 {
        let pivot = self.nodes[node as usize].left;
        let inner = self.nodes[pivot as usize].right;
        let parent = self.nodes[node as usize].parent;

        self.nodes[node as usize].left = inner;
        if inner != NIL {
            self.nodes[inner as usize].parent = node;
        }
        self.nodes[pivot as usize].right = node;
        self.nodes[node as usize].parent = pivot;
        self.nodes[pivot as usize].parent = parent;
        self.relink(parent, node, pivot);

        self.update(node);
        self.update(pivot);
        pivot
    }

    fn fix_left(&mut self, node: u32) -> u32 {
        let left = self.nodes[node as usize].left;
        let l = self.nodes[left as usize];
        if self.height(l.left) < self.height(l.right) {
            self.rot_left(left);
        }
        self.rot_right(node)
    }

    fn fix_right(&mut self, node: u32) -> u32 {
        let right = self.nodes[node as usize].right;
        let r = self.nodes[right as usize];
        if self.height(r.right) < self.height(r.left) {
            self.rot_right(right);
        }
        self.rot_left(node)
    }

    /// Walk from `node` to the root, updating aggregates and rotating where
    /// the balance is off by two. Returns the (possibly new) tree root.
    fn fix(&mut self, mut node: u32) -> u32 {
        loop {
            let parent = self.nodes[node as usize].parent;
            self.update(node);
            let n = self.nodes[node as usize];
            let (lh, rh) = (self.height(n.left), self.height(n.right));
            let fixed = if lh == rh + 2 {
                self.fix_left(node)
            } else if lh + 2 == rh {
                self.fix_right(node)
            } else {
                node
            };
            if parent == NIL {
                return fixed;
            }
            node = parent;
        }
    }

    /// Detach a node with at most one child. Returns the new tree root.
    fn detach_easy(&mut self, node: u32) -> u32 {
        let n = self.nodes[node as usize];
        debug_assert!(n.left == NIL || n.right == NIL);
        let child = if n.left != NIL { n.left } else { n.right };
        if child != NIL {
            self.nodes[child as usize].parent = n.parent;
        }
        if n.parent == NIL {
            return child;
        }
        self.relink(n.parent, node, child);
        self.fix(n.parent)
    }

    /// Detach any node. Returns the new tree root.
    fn detach(&mut self, node: u32) -> u32 {
        let n = self.nodes[node as usize];
        if n.left == NIL || n.right == NIL {
            return self.detach_easy(node);
        }
        // swap in the in-order successor by link surgery; handles stay put
        let mut victim = n.right;
        while self.nodes[victim as usize].left != NIL {
            victim = self.nodes[victim as usize].left;
        }
        let mut root = self.detach_easy(victim);
        self.nodes[victim as usize] = self.nodes[node as usize];
        let v = self.nodes[victim as usize];
        if v.left != NIL {
            self.nodes[v.left as usize].parent = victim;
        }
        if v.right != NIL {
            self.nodes[v.right as usize].parent = victim;
        }
        if v.parent == NIL {
            root = victim;
        } else {
            self.relink(v.parent, node, victim);
        }
        root
    }
}
