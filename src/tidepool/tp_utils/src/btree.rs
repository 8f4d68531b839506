// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! A fixed-fanout B-tree map.
//!
//! Used where the engine needs an ordered container with predictable node
//! granularity (dedup-table live trees, per-txg allocation trees). The
//! test suite drives it against `std::collections::BTreeMap` as the
//! reference and checks membership and iteration order after every
//! operation.

/// Minimum degree `t`: nodes hold between `t - 1` and `2t - 1` keys
/// (the root may hold fewer).
const MIN_DEGREE: usize = 8;
const MAX_KEYS: usize = 2 * MIN_DEGREE - 1;

struct Node<K, V> {
    keys: Vec<K>,
    vals: Vec<V>,
    /// Empty for leaves, `keys.len() + 1` entries otherwise.
    children: Vec<Box<Node<K, V>>>,
}

impl<K: Ord + Clone, V> Node<K, V> {
    fn new_leaf() -> Self {
        Node {
            keys: Vec::new(),
            vals: Vec::new(),
            children: Vec::new(),
        }
    }

    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    fn is_full(&self) -> bool {
        self.keys.len() == MAX_KEYS
    }

    fn get(&self, key: &K) -> Option<&V> {
        match self.keys.binary_search(key) {
            Ok(i) => Some(&self.vals[i]),
            Err(i) => {
                if self.is_leaf() {
                    None
                } else {
                    self.children[i].get(key)
                }
            }
        }
    }

    fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        match self.keys.binary_search(key) {
            Ok(i) => Some(&mut self.vals[i]),
            Err(i) => {
                if self.is_leaf() {
                    None
                } else {
                    self.children[i].get_mut(key)
                }
            }
        }
    }

    /// Split full child `i`; the median key moves up into `self`.
    fn split_child(&mut self, i: usize) {
        let child = &mut self.children[i];
        let mid = MIN_DEGREE - 1;
        let right = Box::new(Node {
            keys: child.keys.split_off(mid + 1),
            vals: child.vals.split_off(mid + 1),
            children: if child.is_leaf() {
                Vec::new()
            } else {
                child.children.split_off(MIN_DEGREE)
            },
        });
        debug_assert!(right.is_leaf() == child.is_leaf());
        let up_key = child.keys.pop().unwrap();
        let up_val = child.vals.pop().unwrap();
        self.keys.insert(i, up_key);
        self.vals.insert(i, up_val);
        self.children.insert(i + 1, right);
    }

    fn insert_nonfull(&mut self, key: K, val: V) -> Option<V> {
        match self.keys.binary_search(&key) {
            Ok(i) => Some(std::mem::replace(&mut self.vals[i], val)),
            Err(mut i) => {
                if self.is_leaf() {
                    self.keys.insert(i, key);
                    self.vals.insert(i, val);
                    None
                } else {
                    if self.children[i].is_full() {
                        self.split_child(i);
                        match key.cmp(&self.keys[i]) {
                            std::cmp::Ordering::Equal => {
                                return Some(std::mem::replace(&mut self.vals[i], val));
                            }
                            std::cmp::Ordering::Greater => i += 1,
                            std::cmp::Ordering::Less => {}
                        }
                    }
                    self.children[i].insert_nonfull(key, val)
                }
            }
        }
    }

    /// Make sure `children[i]` holds at least `MIN_DEGREE` keys before
    /// descending; returns the (possibly shifted) child index.
    fn fix_child(&mut self, i: usize) -> usize {
        if self.children[i].keys.len() >= MIN_DEGREE {
            return i;
        }
        if i > 0 && self.children[i - 1].keys.len() >= MIN_DEGREE {
            // Rotate right: separator moves down, left sibling's max moves up.
            let (k, v, c) = {
                let left = &mut self.children[i - 1];
                (
                    left.keys.pop().unwrap(),
                    left.vals.pop().unwrap(),
                    if left.is_leaf() {
                        None
                    } else {
                        Some(left.children.pop().unwrap())
                    },
                )
            };
            let sep_k = std::mem::replace(&mut self.keys[i - 1], k);
            let sep_v = std::mem::replace(&mut self.vals[i - 1], v);
            let child = &mut self.children[i];
            child.keys.insert(0, sep_k);
            child.vals.insert(0, sep_v);
            if let Some(c) = c {
                child.children.insert(0, c);
            }
            i
        } else if i + 1 < self.children.len() && self.children[i + 1].keys.len() >= MIN_DEGREE {
            // Rotate left.
            let (k, v, c) = {
                let right = &mut self.children[i + 1];
                (
                    right.keys.remove(0),
                    right.vals.remove(0),
                    if right.is_leaf() {
                        None
                    } else {
                        Some(right.children.remove(0))
                    },
                )
            };
            let sep_k = std::mem::replace(&mut self.keys[i], k);
            let sep_v = std::mem::replace(&mut self.vals[i], v);
            let child = &mut self.children[i];
            child.keys.push(sep_k);
            child.vals.push(sep_v);
            if let Some(c) = c {
                child.children.push(c);
            }
            i
        } else if i + 1 < self.children.len() {
            self.merge_children(i);
            i
        } else {
            self.merge_children(i - 1);
            i - 1
        }
    }

    /// Merge `children[i]`, the separator at `i`, and `children[i + 1]`.
    fn merge_children(&mut self, i: usize) {
        let right = self.children.remove(i + 1);
        let sep_k = self.keys.remove(i);
        let sep_v = self.vals.remove(i);
        let left = &mut self.children[i];
        left.keys.push(sep_k);
        left.vals.push(sep_v);
        left.keys.extend(right.keys);
        left.vals.extend(right.vals);
        left.children.extend(right.children);
    }

    fn pop_max(&mut self) -> (K, V) {
        if self.is_leaf() {
            let k = self.keys.pop().unwrap();
            let v = self.vals.pop().unwrap();
            (k, v)
        } else {
            let i = self.fix_child(self.children.len() - 1);
            self.children[i].pop_max()
        }
    }

    fn pop_min(&mut self) -> (K, V) {
        if self.is_leaf() {
            let k = self.keys.remove(0);
            let v = self.vals.remove(0);
            (k, v)
        } else {
            let i = self.fix_child(0);
            self.children[i].pop_min()
        }
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        match self.keys.binary_search(key) {
            Ok(i) => {
                if self.is_leaf() {
                    self.keys.remove(i);
                    return Some(self.vals.remove(i));
                }
                if self.children[i].keys.len() >= MIN_DEGREE {
                    let (pk, pv) = self.children[i].pop_max();
                    self.keys[i] = pk;
                    return Some(std::mem::replace(&mut self.vals[i], pv));
                }
                if self.children[i + 1].keys.len() >= MIN_DEGREE {
                    let (sk, sv) = self.children[i + 1].pop_min();
                    self.keys[i] = sk;
                    return Some(std::mem::replace(&mut self.vals[i], sv));
                }
                self.merge_children(i);
                self.children[i].remove(key)
            }
            Err(i) => {
                if self.is_leaf() {
                    return None;
                }
                let i = self.fix_child(i);
                self.children[i].remove(key)
            }
        }
    }

    fn first_entry(&self) -> Option<(&K, &V)> {
        let mut node = self;
        if node.keys.is_empty() {
            return None;
        }
        while !node.is_leaf() {
            node = &node.children[0];
        }
        Some((&node.keys[0], &node.vals[0]))
    }

    fn next_after<'a>(&'a self, key: &K) -> Option<(&'a K, &'a V)> {
        match self.keys.binary_search(key) {
            Ok(i) => {
                if !self.is_leaf() {
                    if let Some(found) = self.children[i + 1].first_entry() {
                        return Some(found);
                    }
                }
                if i + 1 < self.keys.len() {
                    Some((&self.keys[i + 1], &self.vals[i + 1]))
                } else {
                    None
                }
            }
            Err(i) => {
                if !self.is_leaf() {
                    if let Some(found) = self.children[i].next_after(key) {
                        return Some(found);
                    }
                }
                if i < self.keys.len() {
                    Some((&self.keys[i], &self.vals[i]))
                } else {
                    None
                }
            }
        }
    }

    fn next_at_or_after<'a>(&'a self, key: &K) -> Option<(&'a K, &'a V)> {
        match self.keys.binary_search(key) {
            Ok(i) => Some((&self.keys[i], &self.vals[i])),
            Err(i) => {
                if !self.is_leaf() {
                    if let Some(found) = self.children[i].next_at_or_after(key) {
                        return Some(found);
                    }
                }
                if i < self.keys.len() {
                    Some((&self.keys[i], &self.vals[i]))
                } else {
                    None
                }
            }
        }
    }
}

/// An ordered map with fixed node fanout.
pub struct Btree<K, V> {
    root: Node<K, V>,
    len: usize,
}

impl<K: Ord + Clone, V> Default for Btree<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone, V> Btree<K, V> {
    pub fn new() -> Self {
        Btree {
            root: Node::new_leaf(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.root = Node::new_leaf();
        self.len = 0;
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.root.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.root.get_mut(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Insert, returning the previous value if the key was present.
    pub fn insert(&mut self, key: K, val: V) -> Option<V> {
        if self.root.is_full() {
            let old_root = std::mem::replace(&mut self.root, Node::new_leaf());
            self.root.children.push(Box::new(old_root));
            self.root.split_child(0);
        }
        let prev = self.root.insert_nonfull(key, val);
        if prev.is_none() {
            self.len += 1;
        }
        prev
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let removed = self.root.remove(key);
        if removed.is_some() {
            self.len -= 1;
            if self.root.keys.is_empty() && !self.root.is_leaf() {
                self.root = *self.root.children.remove(0);
            }
        }
        removed
    }

    pub fn first(&self) -> Option<(&K, &V)> {
        let mut node = &self.root;
        if node.keys.is_empty() {
            return None;
        }
        while !node.is_leaf() {
            node = &node.children[0];
        }
        Some((&node.keys[0], &node.vals[0]))
    }

    pub fn pop_first(&mut self) -> Option<(K, V)> {
        if self.len == 0 {
            return None;
        }
        let out = self.root.pop_min();
        self.len -= 1;
        if self.root.keys.is_empty() && !self.root.is_leaf() {
            self.root = *self.root.children.remove(0);
        }
        Some(out)
    }

    /// Smallest entry with key >= `key`. The walk cursor of the dedup
    /// table resumes through this.
    pub fn next_at_or_after(&self, key: &K) -> Option<(&K, &V)> {
        self.root.next_at_or_after(key)
    }

    /// Smallest entry with key > `key`.
    pub fn next_after(&self, key: &K) -> Option<(&K, &V)> {
        self.root.next_after(key)
    }

    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            stack: vec![(&self.root, 0)],
        }
    }
}

/// In-order iterator. Internal-node positions alternate child/key slots.
pub struct Iter<'a, K, V> {
    stack: Vec<(&'a Node<K, V>, usize)>,
}

impl<'a, K: Ord + Clone, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (node, pos) = match self.stack.last_mut() {
                Some(top) => {
                    let node: &'a Node<K, V> = top.0;
                    let pos = top.1;
                    top.1 += 1;
                    (node, pos)
                }
                None => return None,
            };
            if node.is_leaf() {
                if pos < node.keys.len() {
                    return Some((&node.keys[pos], &node.vals[pos]));
                }
                self.stack.pop();
            } else if pos % 2 == 0 {
                let ci = pos / 2;
                if ci < node.children.len() {
                    self.stack.push((&node.children[ci], 0));
                } else {
                    self.stack.pop();
                }
            } else {
                let ki = (pos - 1) / 2;
                if ki < node.keys.len() {
                    return Some((&node.keys[ki], &node.vals[ki]));
                }
                self.stack.pop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;

    fn assert_matches_reference(tree: &Btree<u64, u64>, reference: &BTreeMap<u64, u64>) {
        assert_eq!(tree.len(), reference.len());
        let got: Vec<(u64, u64)> = tree.iter().map(|(k, v)| (*k, *v)).collect();
        let want: Vec<(u64, u64)> = reference.iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(got, want, "iteration order diverged from reference");
    }

    #[test]
    fn random_ops_match_reference() {
        let mut rng = StdRng::seed_from_u64(0x7469646570);
        let mut tree = Btree::new();
        let mut reference = BTreeMap::new();
        for step in 0..4000 {
            let key = rng.gen_range(0..512u64);
            if rng.gen_bool(0.6) {
                let val = rng.gen::<u64>();
                assert_eq!(tree.insert(key, val), reference.insert(key, val));
            } else {
                assert_eq!(tree.remove(&key), reference.remove(&key));
            }
            if step % 64 == 0 {
                assert_matches_reference(&tree, &reference);
            }
            assert_eq!(tree.get(&key).copied(), reference.get(&key).copied());
        }
        assert_matches_reference(&tree, &reference);
    }

    #[test]
    fn ascending_then_drain() {
        let mut tree = Btree::new();
        for i in 0..1000u64 {
            assert!(tree.insert(i, i * 2).is_none());
        }
        for i in 0..1000u64 {
            let (k, v) = tree.pop_first().unwrap();
            assert_eq!((k, v), (i, i * 2));
        }
        assert!(tree.is_empty());
        assert!(tree.pop_first().is_none());
    }

    #[test]
    fn cursor_resume() {
        let mut tree = Btree::new();
        for i in (0..100u64).map(|i| i * 3) {
            tree.insert(i, i);
        }
        assert_eq!(tree.next_at_or_after(&4).map(|(k, _)| *k), Some(6));
        assert_eq!(tree.next_at_or_after(&6).map(|(k, _)| *k), Some(6));
        assert_eq!(tree.next_at_or_after(&298).map(|(k, _)| *k), None);

        // Walk the whole tree through the cursor, as the dedup walk does.
        let mut cursor = 0u64;
        let mut seen = Vec::new();
        while let Some((k, _)) = tree.next_at_or_after(&cursor) {
            seen.push(*k);
            cursor = *k + 1;
        }
        assert_eq!(seen.len(), 100);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }
}
