//! # B-Tree Operations
//!
//! [`BTree`] implements insertion, removal, and ordered range scans over
//! the nodes of a [`NodeManager`]. The tree borrows its manager mutably
//! for the duration of one operation, so node loads and saves need no
//! further synchronization.
//!
//! ## Shape
//!
//! A max-key B+ tree: all `(value, row)` keys live in leaves, interior
//! entry *i* carries a copy of the largest key below child *i*, and
//! leaves chain through `prev`/`next` for range scans. The tree is
//! seeded with a single leaf holding only the sentinel key; the sentinel
//! stays at the tail of the rightmost spine forever, so inserting past
//! every real key still lands *before* some stored key.
//!
//! ## Balancing
//!
//! Inserts split full nodes top-down while descending: the left half
//! moves to a fresh node, the original keeps the upper half (and with it
//! the parent's separator). Removals rebalance top-down as well: before
//! descending into a minimal child, one key (or entry) is borrowed from
//! an adjacent sibling, or the child is merged with one.
//!
//! Duplicate values are welcome as long as their rows differ; the row id
//! is part of the key, so only a true `(value, row)` duplicate is
//! rejected.

use eyre::Result;

use super::manager::NodeManager;
use super::node::{BTreeKey, Node, NIL_NODE};
use crate::error::{fail, ErrorKind};

pub struct BTree<'a> {
    mgr: &'a mut NodeManager,
}

impl<'a> BTree<'a> {
    pub fn new(mgr: &'a mut NodeManager) -> Self {
        Self { mgr }
    }

    /// The root node, created as a sentinel-only leaf on first use.
    fn root(&mut self) -> Result<Node> {
        if self.mgr.root_id() == NIL_NODE {
            let mut root = self.mgr.allocate_node()?;

            let layout = self.mgr.layout();
            let mut sentinel = vec![0u8; layout.key_size()];
            layout.encode_sentinel(&mut sentinel);
            root.insert_entry_at(&layout, 0, &sentinel);

            self.mgr.set_root_id(root.id);
            self.mgr.save_node(root.clone())?;
            return Ok(root);
        }

        self.mgr.load_node(self.mgr.root_id())
    }

    /// Inserts `key` and returns the `(leaf node id, slot)` locator of
    /// the new entry. A `(value, row)` duplicate is rejected.
    pub fn insert_key(&mut self, key: &BTreeKey) -> Result<(u32, usize)> {
        let layout = self.mgr.layout();
        let mut probe = vec![0u8; layout.key_size()];
        layout.encode(key, &mut probe)?;

        let mut node = self.root()?;

        if node.is_full(&layout) {
            node = self.split_root(node)?;
        }

        loop {
            if node.is_leaf() {
                // A separator can sit above every remaining key after
                // removals, so the probe may land past the last slot.
                let pos = node.lower_bound(&layout, &probe);

                if pos < node.keys_count()
                    && layout.compare(node.key_at(&layout, pos), &probe)
                        == std::cmp::Ordering::Equal
                {
                    fail!(
                        ErrorKind::GeneralControlError,
                        "key for row {} already indexed",
                        key.row
                    );
                }

                node.insert_entry_at(&layout, pos, &probe);
                let located = (node.id, pos);
                self.mgr.save_node(node)?;
                return Ok(located);
            }

            let pos = node.lower_bound(&layout, &probe);
            debug_assert!(pos < node.keys_count());

            let child_id = node.child_at(&layout, pos);
            let child = self.mgr.load_node(child_id)?;

            if child.is_full(&layout) {
                let (parent, left, right) = self.split_child(node, pos, child)?;
                // Descend into whichever half now bounds the probe.
                let sep = parent.key_at(&layout, pos).to_vec();
                node = if layout.compare(&probe, &sep) != std::cmp::Ordering::Greater {
                    left
                } else {
                    right
                };
            } else {
                node = child;
            }
        }
    }

    /// Removes the exact `(value, row)` key.
    pub fn remove_key(&mut self, key: &BTreeKey) -> Result<()> {
        let layout = self.mgr.layout();
        let mut probe = vec![0u8; layout.key_size()];
        layout.encode(key, &mut probe)?;

        let mut node = self.root()?;

        // Collapse a root that lost all but one child.
        while !node.is_leaf() && node.keys_count() == 1 {
            let only = node.child_at(&layout, 0);
            self.mgr.free_node(node.id)?;
            self.mgr.set_root_id(only);
            node = self.mgr.load_node(only)?;
        }

        loop {
            if node.is_leaf() {
                let pos = node.lower_bound(&layout, &probe);
                if pos >= node.keys_count()
                    || layout.compare(node.key_at(&layout, pos), &probe)
                        != std::cmp::Ordering::Equal
                {
                    fail!(
                        ErrorKind::GeneralControlError,
                        "key for row {} is not indexed",
                        key.row
                    );
                }

                node.remove_entry_at(&layout, pos);
                return self.mgr.save_node(node);
            }

            let pos = node.lower_bound(&layout, &probe);
            debug_assert!(pos < node.keys_count());

            let child_id = node.child_at(&layout, pos);
            let child = self.mgr.load_node(child_id)?;
            let min_keys = child.capacity(&layout) / 2;

            if child.keys_count() > min_keys {
                node = child;
            } else {
                node = self.rebalance(node, pos, child)?;
            }
        }
    }

    /// Rows of every key in `[lo, hi]`, in key order.
    pub fn range_rows(&mut self, lo: &BTreeKey, hi: &BTreeKey) -> Result<Vec<u64>> {
        let layout = self.mgr.layout();
        let mut lo_probe = vec![0u8; layout.key_size()];
        let mut hi_probe = vec![0u8; layout.key_size()];
        layout.encode(lo, &mut lo_probe)?;
        layout.encode(hi, &mut hi_probe)?;

        let mut node = self.root()?;
        while !node.is_leaf() {
            let pos = node.lower_bound(&layout, &lo_probe);
            debug_assert!(pos < node.keys_count());
            node = self.mgr.load_node(node.child_at(&layout, pos))?;
        }

        let mut rows = Vec::new();
        let mut pos = node.lower_bound(&layout, &lo_probe);

        loop {
            if pos >= node.keys_count() {
                if node.next() == NIL_NODE {
                    break;
                }
                node = self.mgr.load_node(node.next())?;
                pos = 0;
                continue;
            }

            let key = node.key_at(&layout, pos);
            if layout.is_sentinel(key)
                || layout.compare(key, &hi_probe) == std::cmp::Ordering::Greater
            {
                break;
            }

            rows.push(layout.row_of(key));
            pos += 1;
        }

        Ok(rows)
    }

    /// Removes and returns the smallest real key, or `None` when the
    /// tree holds only the sentinel.
    pub fn pop_smallest(&mut self) -> Result<Option<BTreeKey>> {
        let layout = self.mgr.layout();

        let mut node = self.root()?;
        while !node.is_leaf() {
            node = self.mgr.load_node(node.child_at(&layout, 0))?;
        }

        debug_assert!(node.keys_count() > 0);
        let first = node.key_at(&layout, 0);
        if layout.is_sentinel(first) {
            return Ok(None);
        }

        let key = layout.decode(first)?;
        self.remove_key(&key)?;
        Ok(Some(key))
    }

    /// True when the tree holds no real keys.
    pub fn is_empty(&mut self) -> Result<bool> {
        let layout = self.mgr.layout();

        let mut node = self.root()?;
        while !node.is_leaf() {
            node = self.mgr.load_node(node.child_at(&layout, 0))?;
        }

        Ok(node.keys_count() == 0 || layout.is_sentinel(node.key_at(&layout, 0)))
    }

    /// Splits a full root, producing a new root with two children.
    fn split_root(&mut self, root: Node) -> Result<Node> {
        let layout = self.mgr.layout();

        let mut new_root = self.mgr.allocate_node()?;
        new_root.set_leaf(false);

        // Seed the new root with a single entry covering the old root,
        // then run the ordinary child split below it.
        let max_key = root.key_at(&layout, root.keys_count() - 1).to_vec();
        let mut entry = max_key;
        entry.extend_from_slice(&root.id.to_le_bytes());
        new_root.insert_entry_at(&layout, 0, &entry);

        self.mgr.set_root_id(new_root.id);

        let (parent, _, _) = self.split_child(new_root, 0, root)?;
        Ok(parent)
    }

    /// Splits the full `child` at entry `pos` of `parent`. The lower half
    /// moves to a fresh node inserted at `pos`; `child` keeps the upper
    /// half (and the parent's existing separator). Returns the updated
    /// parent and both halves.
    fn split_child(&mut self, mut parent: Node, pos: usize, mut child: Node) -> Result<(Node, Node, Node)> {
        let layout = self.mgr.layout();
        let count = child.keys_count();
        let mid = count / 2;

        let mut left = self.mgr.allocate_node()?;
        left.set_leaf(child.is_leaf());

        for slot in 0..mid {
            let entry = child.entry_at(&layout, slot);
            left.insert_entry_at(&layout, slot, &entry);
        }
        for _ in 0..mid {
            child.remove_entry_at(&layout, 0);
        }

        if child.is_leaf() {
            left.set_prev(child.prev());
            left.set_next(child.id);
            child.set_prev(left.id);

            if left.prev() != NIL_NODE {
                let mut before = self.mgr.load_node(left.prev())?;
                before.set_next(left.id);
                self.mgr.save_node(before)?;
            }
        }

        let mut entry = left.key_at(&layout, left.keys_count() - 1).to_vec();
        entry.extend_from_slice(&left.id.to_le_bytes());
        parent.insert_entry_at(&layout, pos, &entry);
        parent.set_child_at(&layout, pos + 1, child.id);

        self.mgr.save_node(left.clone())?;
        self.mgr.save_node(child.clone())?;
        self.mgr.save_node(parent.clone())?;

        Ok((parent, left, child))
    }

    /// Grows the minimal child at `pos` by borrowing from a sibling or by
    /// merging; returns the node the removal should descend into.
    fn rebalance(&mut self, mut parent: Node, pos: usize, mut child: Node) -> Result<Node> {
        let layout = self.mgr.layout();
        let min_keys = child.capacity(&layout) / 2;

        // Borrow the left sibling's largest entry.
        if pos > 0 {
            let left_id = parent.child_at(&layout, pos - 1);
            let mut left = self.mgr.load_node(left_id)?;

            if left.keys_count() > min_keys {
                let moved = left.entry_at(&layout, left.keys_count() - 1);
                left.remove_entry_at(&layout, left.keys_count() - 1);
                child.insert_entry_at(&layout, 0, &moved);

                let new_sep = left.key_at(&layout, left.keys_count() - 1).to_vec();
                parent.set_key_at(&layout, pos - 1, &new_sep);

                self.mgr.save_node(left)?;
                self.mgr.save_node(parent)?;
                self.mgr.save_node(child.clone())?;
                return Ok(child);
            }
        }

        // Borrow the right sibling's smallest entry.
        if pos + 1 < parent.keys_count() {
            let right_id = parent.child_at(&layout, pos + 1);
            let mut right = self.mgr.load_node(right_id)?;

            if right.keys_count() > min_keys {
                let moved = right.entry_at(&layout, 0);
                right.remove_entry_at(&layout, 0);
                let slot = child.keys_count();
                child.insert_entry_at(&layout, slot, &moved);

                parent.set_key_at(&layout, pos, &moved[..layout.key_size()]);

                self.mgr.save_node(right)?;
                self.mgr.save_node(parent)?;
                self.mgr.save_node(child.clone())?;
                return Ok(child);
            }
        }

        // Merge with a sibling; both are minimal, so the union fits.
        if pos + 1 < parent.keys_count() {
            self.merge_into_left(parent, pos, child)
        } else {
            let left_id = parent.child_at(&layout, pos - 1);
            let left = self.mgr.load_node(left_id)?;
            self.merge_into_left(parent, pos - 1, left)
        }
    }

    /// Merges the child at `pos + 1` into the child at `pos` (given as
    /// `left`), dropping the separator entry at `pos`.
    fn merge_into_left(&mut self, mut parent: Node, pos: usize, mut left: Node) -> Result<Node> {
        let layout = self.mgr.layout();

        let right_id = parent.child_at(&layout, pos + 1);
        let right = self.mgr.load_node(right_id)?;

        for slot in 0..right.keys_count() {
            let entry = right.entry_at(&layout, slot);
            let at = left.keys_count();
            left.insert_entry_at(&layout, at, &entry);
        }

        if left.is_leaf() {
            left.set_next(right.next());
            if right.next() != NIL_NODE {
                let mut after = self.mgr.load_node(right.next())?;
                after.set_prev(left.id);
                self.mgr.save_node(after)?;
            }
        }

        parent.remove_entry_at(&layout, pos);
        parent.set_child_at(&layout, pos, left.id);

        self.mgr.free_node(right_id)?;
        self.mgr.save_node(parent)?;
        self.mgr.save_node(left.clone())?;

        Ok(left)
    }
}
