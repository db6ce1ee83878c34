//! A node paired with one index, keeping its children in index order.
//!
//! The ordered set is a balanced tree keyed by (projected value, key), so
//! membership, insertion, and neighbor lookups stay logarithmic for any of
//! the four index types.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::core::node::index::{value_order, Index};
use crate::core::node::Node;
use crate::core::path::{key_compare, ChildKey};

#[derive(Clone, Debug)]
pub(crate) struct IndexedEntry {
    pub sort: Node,
    pub key: ChildKey,
}

impl PartialEq for IndexedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexedEntry {}

impl PartialOrd for IndexedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        value_order(&self.sort, &other.sort).then_with(|| key_compare(&self.key, &other.key))
    }
}

#[derive(Clone, Debug)]
pub struct IndexedNode {
    node: Node,
    index: Index,
    entries: Arc<BTreeSet<IndexedEntry>>,
}

impl IndexedNode {
    pub fn new(node: Node, index: Index) -> Self {
        let entries = node
            .children()
            .map(|(key, child)| IndexedEntry {
                sort: index.indexed_value(child),
                key: key.clone(),
            })
            .collect();
        Self {
            node,
            index,
            entries: Arc::new(entries),
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn num_children(&self) -> usize {
        self.entries.len()
    }

    fn entry_for(&self, key: &ChildKey, child: &Node) -> IndexedEntry {
        IndexedEntry {
            sort: self.index.indexed_value(child),
            key: key.clone(),
        }
    }

    /// Replaces (or removes, when `child` is empty) one child, keeping the
    /// order set in sync.
    pub fn update_child(&self, key: &ChildKey, child: Node) -> IndexedNode {
        let mut entries = (*self.entries).clone();
        let old_child = self.node.immediate_child(key);
        if !old_child.is_empty() {
            entries.remove(&self.entry_for(key, &old_child));
        }
        if !child.is_empty() {
            entries.insert(self.entry_for(key, &child));
        }
        IndexedNode {
            node: self.node.update_immediate_child(key, child),
            index: self.index.clone(),
            entries: Arc::new(entries),
        }
    }

    pub fn update_priority(&self, priority: crate::core::node::Priority) -> IndexedNode {
        IndexedNode {
            node: self.node.with_priority(priority),
            index: self.index.clone(),
            entries: self.entries.clone(),
        }
    }

    /// Children in index order.
    pub fn iter(&self) -> impl Iterator<Item = (ChildKey, Node)> + '_ {
        self.entries
            .iter()
            .map(|entry| (entry.key.clone(), self.node.immediate_child(&entry.key)))
    }

    /// Children in reverse index order.
    pub fn iter_rev(&self) -> impl Iterator<Item = (ChildKey, Node)> + '_ {
        self.entries
            .iter()
            .rev()
            .map(|entry| (entry.key.clone(), self.node.immediate_child(&entry.key)))
    }

    pub fn first(&self) -> Option<(ChildKey, Node)> {
        self.entries
            .first()
            .map(|entry| (entry.key.clone(), self.node.immediate_child(&entry.key)))
    }

    pub fn last(&self) -> Option<(ChildKey, Node)> {
        self.entries
            .last()
            .map(|entry| (entry.key.clone(), self.node.immediate_child(&entry.key)))
    }

    /// The key ordered immediately before `key`, per this index.
    pub fn predecessor(&self, key: &ChildKey) -> Option<ChildKey> {
        let child = self.node.immediate_child(key);
        if child.is_empty() {
            return None;
        }
        let entry = self.entry_for(key, &child);
        self.entries
            .range(..entry)
            .next_back()
            .map(|prev| prev.key.clone())
    }

    pub fn has_child(&self, key: &ChildKey) -> bool {
        self.node.has_child(key)
    }
}
