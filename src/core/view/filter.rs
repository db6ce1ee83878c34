//! Node filters shape a view's data per its query params.
//!
//! Three layers: the indexed filter passes everything through and records
//! child deltas; the ranged filter drops children outside the start/end
//! bounds; the limited filter maintains a fixed-size window anchored at
//! either end, pulling replacement children from a completeness source when
//! one slides out.

use std::cmp::Ordering;

use crate::core::node::index::value_order;
use crate::core::node::{Index, IndexedNode, Node, Priority};
use crate::core::path::{key_compare, ChildKey, Path};
use crate::core::query::QueryParams;
use crate::core::view::change::{Change, ChildChangeAccumulator};

/// Supplies children a filtered view cannot see on its own.
pub trait CompleteChildSource {
    fn complete_child(&self, key: &ChildKey) -> Option<Node>;
    fn child_after(
        &self,
        index: &Index,
        key: &ChildKey,
        node: &Node,
        reverse: bool,
    ) -> Option<(ChildKey, Node)>;
}

/// Source that knows nothing; used where no server data can help.
pub struct NoCompleteSource;

impl CompleteChildSource for NoCompleteSource {
    fn complete_child(&self, _key: &ChildKey) -> Option<Node> {
        None
    }

    fn child_after(
        &self,
        _index: &Index,
        _key: &ChildKey,
        _node: &Node,
        _reverse: bool,
    ) -> Option<(ChildKey, Node)> {
        None
    }
}

pub trait NodeFilter: Send + Sync {
    /// Applies one child update, tracking deltas into `acc`.
    fn update_child(
        &self,
        indexed: &IndexedNode,
        key: &ChildKey,
        new_child: Node,
        affected_path: &Path,
        source: &dyn CompleteChildSource,
        acc: Option<&mut ChildChangeAccumulator>,
    ) -> IndexedNode;

    /// Replaces the whole node, tracking per-child deltas into `acc`.
    fn update_full_node(
        &self,
        old: &IndexedNode,
        new: &IndexedNode,
        acc: Option<&mut ChildChangeAccumulator>,
    ) -> IndexedNode;

    fn update_priority(&self, old: &IndexedNode, priority: Priority) -> IndexedNode;

    /// Whether this filter can drop children (so its output is a window).
    fn filters_nodes(&self) -> bool;

    /// The pass-through variant used for unfiltered server caches.
    fn indexed_filter(&self) -> &dyn NodeFilter;

    fn index(&self) -> &Index;
}

/// Pass-through filter: applies updates and records the deltas.
pub struct IndexedFilter {
    index: Index,
}

impl IndexedFilter {
    pub fn new(index: Index) -> Self {
        Self { index }
    }
}

impl NodeFilter for IndexedFilter {
    fn update_child(
        &self,
        indexed: &IndexedNode,
        key: &ChildKey,
        new_child: Node,
        affected_path: &Path,
        _source: &dyn CompleteChildSource,
        acc: Option<&mut ChildChangeAccumulator>,
    ) -> IndexedNode {
        let old_child = indexed.node().immediate_child(key);
        // Nothing observable changed under the affected path: skip the
        // update entirely.
        if old_child.get(affected_path) == new_child.get(affected_path)
            && old_child.is_empty() == new_child.is_empty()
        {
            return indexed.clone();
        }

        if let Some(acc) = acc {
            if new_child.is_empty() {
                if indexed.has_child(key) {
                    acc.track(Change::ChildRemoved {
                        key: key.clone(),
                        node: old_child.clone(),
                    });
                }
            } else if old_child.is_empty() {
                acc.track(Change::ChildAdded {
                    key: key.clone(),
                    node: new_child.clone(),
                });
            } else {
                acc.track(Change::ChildChanged {
                    key: key.clone(),
                    node: new_child.clone(),
                    old_node: old_child.clone(),
                });
            }
        }

        if indexed.node().is_leaf() && new_child.is_empty() {
            indexed.clone()
        } else {
            indexed.update_child(key, new_child)
        }
    }

    fn update_full_node(
        &self,
        old: &IndexedNode,
        new: &IndexedNode,
        acc: Option<&mut ChildChangeAccumulator>,
    ) -> IndexedNode {
        if let Some(acc) = acc {
            for (key, old_child) in old.node().children() {
                if !new.node().has_child(key) {
                    acc.track(Change::ChildRemoved {
                        key: key.clone(),
                        node: old_child.clone(),
                    });
                }
            }
            for (key, new_child) in new.node().children() {
                let old_child = old.node().immediate_child(key);
                if old_child.is_empty() {
                    acc.track(Change::ChildAdded {
                        key: key.clone(),
                        node: new_child.clone(),
                    });
                } else if &old_child != new_child {
                    acc.track(Change::ChildChanged {
                        key: key.clone(),
                        node: new_child.clone(),
                        old_node: old_child,
                    });
                }
            }
        }
        new.clone()
    }

    fn update_priority(&self, old: &IndexedNode, priority: Priority) -> IndexedNode {
        if old.node().is_empty() {
            old.clone()
        } else {
            old.update_priority(priority)
        }
    }

    fn filters_nodes(&self) -> bool {
        false
    }

    fn indexed_filter(&self) -> &dyn NodeFilter {
        self
    }

    fn index(&self) -> &Index {
        &self.index
    }
}

/// Applies start/end bounds on top of the indexed filter.
pub struct RangedFilter {
    indexed: IndexedFilter,
    index: Index,
    start: Option<(Node, ChildKey)>,
    end: Option<(Node, ChildKey)>,
}

impl RangedFilter {
    pub fn new(params: &QueryParams) -> Self {
        Self {
            indexed: IndexedFilter::new(params.index.clone()),
            index: params.index.clone(),
            start: params.start_bound(),
            end: params.end_bound(),
        }
    }

    pub fn matches(&self, key: &ChildKey, node: &Node) -> bool {
        let value = self.index.indexed_value(node);
        let after_start = match &self.start {
            None => true,
            Some((bound_value, bound_key)) => {
                value_order(bound_value, &value)
                    .then_with(|| key_compare(bound_key, key))
                    != Ordering::Greater
            }
        };
        let before_end = match &self.end {
            None => true,
            Some((bound_value, bound_key)) => {
                value_order(&value, bound_value)
                    .then_with(|| key_compare(key, bound_key))
                    != Ordering::Greater
            }
        };
        after_start && before_end
    }
}

impl NodeFilter for RangedFilter {
    fn update_child(
        &self,
        indexed: &IndexedNode,
        key: &ChildKey,
        new_child: Node,
        affected_path: &Path,
        source: &dyn CompleteChildSource,
        acc: Option<&mut ChildChangeAccumulator>,
    ) -> IndexedNode {
        let new_child = if self.matches(key, &new_child) {
            new_child
        } else {
            Node::empty()
        };
        self.indexed
            .update_child(indexed, key, new_child, affected_path, source, acc)
    }

    fn update_full_node(
        &self,
        old: &IndexedNode,
        new: &IndexedNode,
        acc: Option<&mut ChildChangeAccumulator>,
    ) -> IndexedNode {
        // Leaves never match a ranged query at the child level.
        let mut filtered = IndexedNode::new(Node::empty(), self.index.clone());
        if !new.node().is_leaf() {
            for (key, child) in new.iter() {
                if self.matches(&key, &child) {
                    filtered = filtered.update_child(&key, child);
                }
            }
        }
        self.indexed.update_full_node(old, &filtered, acc)
    }

    fn update_priority(&self, old: &IndexedNode, _priority: Priority) -> IndexedNode {
        // Priority changes cannot affect a filtered window's membership.
        old.clone()
    }

    fn filters_nodes(&self) -> bool {
        true
    }

    fn indexed_filter(&self) -> &dyn NodeFilter {
        &self.indexed
    }

    fn index(&self) -> &Index {
        &self.index
    }
}

/// Keeps at most `limit` matching children, anchored at the start
/// (`limitToFirst`) or the end (`limitToLast`) of the ranged window.
pub struct LimitedFilter {
    ranged: RangedFilter,
    index: Index,
    limit: usize,
    reverse: bool,
}

impl LimitedFilter {
    pub fn new(params: &QueryParams) -> Self {
        let limit = params.limit.expect("limited filter requires a limit");
        Self {
            ranged: RangedFilter::new(params),
            index: params.index.clone(),
            limit: limit.count() as usize,
            reverse: limit.anchors_last(),
        }
    }

    fn compare(&self, a: (&ChildKey, &Node), b: (&ChildKey, &Node)) -> Ordering {
        if self.reverse {
            self.index.compare(b, a)
        } else {
            self.index.compare(a, b)
        }
    }

    /// Window update when the view is already at capacity.
    fn full_limit_update_child(
        &self,
        indexed: &IndexedNode,
        key: &ChildKey,
        new_child: Node,
        source: &dyn CompleteChildSource,
        mut acc: Option<&mut ChildChangeAccumulator>,
    ) -> IndexedNode {
        let window_boundary = if self.reverse {
            indexed.first()
        } else {
            indexed.last()
        };
        let Some(window_boundary) = window_boundary else {
            return indexed.clone();
        };
        let in_range = self.ranged.matches(key, &new_child);

        if indexed.has_child(key) {
            let old_child = indexed.node().immediate_child(key);
            // A replacement candidate from outside the current window.
            let mut next = source.child_after(
                &self.index,
                &window_boundary.0,
                &window_boundary.1,
                self.reverse,
            );
            while let Some(candidate) = &next {
                if candidate.0 == *key || indexed.has_child(&candidate.0) {
                    next = source.child_after(
                        &self.index,
                        &candidate.0,
                        &candidate.1,
                        self.reverse,
                    );
                } else {
                    break;
                }
            }
            let compare_next = match &next {
                None => Ordering::Greater,
                Some(candidate) => self.compare((&candidate.0, &candidate.1), (key, &new_child)),
            };
            let stays = in_range && !new_child.is_empty() && compare_next != Ordering::Less;
            if stays {
                if let Some(acc) = acc {
                    acc.track(Change::ChildChanged {
                        key: key.clone(),
                        node: new_child.clone(),
                        old_node: old_child,
                    });
                }
                indexed.update_child(key, new_child)
            } else {
                if let Some(acc) = acc.as_deref_mut() {
                    acc.track(Change::ChildRemoved {
                        key: key.clone(),
                        node: old_child,
                    });
                }
                let shrunk = indexed.update_child(key, Node::empty());
                let next_in_range = next
                    .as_ref()
                    .map(|candidate| self.ranged.matches(&candidate.0, &candidate.1))
                    .unwrap_or(false);
                if next_in_range {
                    let (next_key, next_node) = next.expect("checked above");
                    if let Some(acc) = acc {
                        acc.track(Change::ChildAdded {
                            key: next_key.clone(),
                            node: next_node.clone(),
                        });
                    }
                    shrunk.update_child(&next_key, next_node)
                } else {
                    shrunk
                }
            }
        } else if new_child.is_empty() {
            indexed.clone()
        } else if in_range {
            // Only displaces the boundary child if it sorts inside it.
            if self.compare((&window_boundary.0, &window_boundary.1), (key, &new_child))
                != Ordering::Less
            {
                if let Some(acc) = acc {
                    acc.track(Change::ChildRemoved {
                        key: window_boundary.0.clone(),
                        node: window_boundary.1.clone(),
                    });
                    acc.track(Change::ChildAdded {
                        key: key.clone(),
                        node: new_child.clone(),
                    });
                }
                indexed
                    .update_child(key, new_child)
                    .update_child(&window_boundary.0, Node::empty())
            } else {
                indexed.clone()
            }
        } else {
            indexed.clone()
        }
    }
}

impl NodeFilter for LimitedFilter {
    fn update_child(
        &self,
        indexed: &IndexedNode,
        key: &ChildKey,
        new_child: Node,
        affected_path: &Path,
        source: &dyn CompleteChildSource,
        acc: Option<&mut ChildChangeAccumulator>,
    ) -> IndexedNode {
        let new_child = if self.ranged.matches(key, &new_child) {
            new_child
        } else {
            Node::empty()
        };
        if indexed.node().immediate_child(key) == new_child {
            indexed.clone()
        } else if indexed.num_children() < self.limit {
            self.ranged
                .indexed_filter()
                .update_child(indexed, key, new_child, affected_path, source, acc)
        } else {
            self.full_limit_update_child(indexed, key, new_child, source, acc)
        }
    }

    fn update_full_node(
        &self,
        old: &IndexedNode,
        new: &IndexedNode,
        acc: Option<&mut ChildChangeAccumulator>,
    ) -> IndexedNode {
        let mut filtered = IndexedNode::new(Node::empty(), self.index.clone());
        if !new.node().is_leaf() {
            let mut taken = 0usize;
            let entries: Vec<(ChildKey, Node)> = if self.reverse {
                new.iter_rev().collect()
            } else {
                new.iter().collect()
            };
            for (key, child) in entries {
                if taken >= self.limit {
                    break;
                }
                if self.ranged.matches(&key, &child) {
                    filtered = filtered.update_child(&key, child);
                    taken += 1;
                }
            }
        }
        self.ranged.indexed_filter().update_full_node(old, &filtered, acc)
    }

    fn update_priority(&self, old: &IndexedNode, _priority: Priority) -> IndexedNode {
        old.clone()
    }

    fn filters_nodes(&self) -> bool {
        true
    }

    fn indexed_filter(&self) -> &dyn NodeFilter {
        self.ranged.indexed_filter()
    }

    fn index(&self) -> &Index {
        &self.index
    }
}

/// Builds the filter matching a set of query params.
pub fn filter_for_params(params: &QueryParams) -> Box<dyn NodeFilter> {
    if params.limit.is_some() {
        Box::new(LimitedFilter::new(params))
    } else if !params.loads_all_data() {
        Box::new(RangedFilter::new(params))
    } else {
        Box::new(IndexedFilter::new(params.index.clone()))
    }
}
