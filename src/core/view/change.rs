//! Child-level deltas produced while applying an operation to a view.

use std::collections::BTreeMap;

use crate::core::node::Node;
use crate::core::path::ChildKey;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Change {
    /// The view's whole value changed; raised once per batch, after child
    /// changes.
    Value { snapshot: Node },
    ChildAdded { key: ChildKey, node: Node },
    ChildRemoved { key: ChildKey, node: Node },
    ChildChanged {
        key: ChildKey,
        node: Node,
        old_node: Node,
    },
    ChildMoved { key: ChildKey, node: Node },
}

impl Change {
    pub fn child_key(&self) -> Option<&ChildKey> {
        match self {
            Change::Value { .. } => None,
            Change::ChildAdded { key, .. }
            | Change::ChildRemoved { key, .. }
            | Change::ChildChanged { key, .. }
            | Change::ChildMoved { key, .. } => Some(key),
        }
    }

    pub fn node(&self) -> &Node {
        match self {
            Change::Value { snapshot } => snapshot,
            Change::ChildAdded { node, .. }
            | Change::ChildRemoved { node, .. }
            | Change::ChildChanged { node, .. }
            | Change::ChildMoved { node, .. } => node,
        }
    }
}

/// Collects child changes while a filter reshapes a node, merging changes
/// that land on the same key so listeners see one net delta per child.
#[derive(Default, Debug)]
pub struct ChildChangeAccumulator {
    changes: BTreeMap<ChildKey, Change>,
}

impl ChildChangeAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, change: Change) {
        let Some(key) = change.child_key().cloned() else {
            debug_assert!(false, "value changes are not accumulated");
            return;
        };
        let merged = match (self.changes.remove(&key), change) {
            (None, change) => Some(change),
            // Removed then re-added: net effect is a change.
            (Some(Change::ChildRemoved { node: old_node, .. }), Change::ChildAdded { key, node }) => {
                Some(Change::ChildChanged {
                    key,
                    node,
                    old_node,
                })
            }
            // Added then removed: nothing happened.
            (Some(Change::ChildAdded { .. }), Change::ChildRemoved { .. }) => None,
            // Added then changed: still an add, with the newest value.
            (Some(Change::ChildAdded { .. }), Change::ChildChanged { key, node, .. }) => {
                Some(Change::ChildAdded { key, node })
            }
            // Changed then removed: a remove of the original value.
            (Some(Change::ChildChanged { old_node, .. }), Change::ChildRemoved { key, .. }) => {
                Some(Change::ChildRemoved {
                    key,
                    node: old_node,
                })
            }
            // Changed then changed again: one change spanning both.
            (
                Some(Change::ChildChanged { old_node, .. }),
                Change::ChildChanged { key, node, .. },
            ) => Some(Change::ChildChanged {
                key,
                node,
                old_node,
            }),
            (Some(stale), fresh) => {
                debug_assert!(
                    false,
                    "illegal change combination: {stale:?} then {fresh:?}"
                );
                Some(fresh)
            }
        };
        if let Some(merged) = merged {
            self.changes.insert(key, merged);
        }
    }

    pub fn into_changes(self) -> Vec<Change> {
        self.changes.into_values().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node::serializer::json_to_node;
    use serde_json::json;

    fn key(name: &str) -> ChildKey {
        ChildKey::new(name).unwrap()
    }

    fn n(value: serde_json::Value) -> Node {
        json_to_node(&value).unwrap()
    }

    #[test]
    fn add_then_remove_cancels_out() {
        let mut acc = ChildChangeAccumulator::new();
        acc.track(Change::ChildAdded {
            key: key("a"),
            node: n(json!(1)),
        });
        acc.track(Change::ChildRemoved {
            key: key("a"),
            node: n(json!(1)),
        });
        assert!(acc.into_changes().is_empty());
    }

    #[test]
    fn remove_then_add_becomes_change() {
        let mut acc = ChildChangeAccumulator::new();
        acc.track(Change::ChildRemoved {
            key: key("a"),
            node: n(json!(1)),
        });
        acc.track(Change::ChildAdded {
            key: key("a"),
            node: n(json!(2)),
        });
        assert_eq!(
            acc.into_changes(),
            vec![Change::ChildChanged {
                key: key("a"),
                node: n(json!(2)),
                old_node: n(json!(1)),
            }]
        );
    }

    #[test]
    fn chained_changes_keep_original_old_value() {
        let mut acc = ChildChangeAccumulator::new();
        acc.track(Change::ChildChanged {
            key: key("a"),
            node: n(json!(2)),
            old_node: n(json!(1)),
        });
        acc.track(Change::ChildChanged {
            key: key("a"),
            node: n(json!(3)),
            old_node: n(json!(2)),
        });
        assert_eq!(
            acc.into_changes(),
            vec![Change::ChildChanged {
                key: key("a"),
                node: n(json!(3)),
                old_node: n(json!(1)),
            }]
        );
    }
}
