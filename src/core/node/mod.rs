//! The tree node model.
//!
//! A node is either a leaf scalar or a keyed set of children; both carry an
//! optional priority. Nodes are immutable: every update produces a new node,
//! sharing unchanged subtrees through `Arc`.

pub mod hash;
pub mod index;
pub mod indexed;
pub mod priority;
pub mod serializer;

use std::collections::BTreeMap;
use std::sync::Arc;

use ordered_float::OrderedFloat;
use serde_json::Value;

use crate::core::path::{ChildKey, Path};

pub use index::Index;
pub use indexed::IndexedNode;
pub use priority::Priority;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum LeafValue {
    Boolean(bool),
    Number(OrderedFloat<f64>),
    String(String),
    /// An unresolved server placeholder (`{".sv": …}`), stored as its JSON
    /// text so it can travel to the wire verbatim. Local caches never hold
    /// one; placeholders are resolved before optimistic application.
    Placeholder(String),
}

impl LeafValue {
    pub fn number(value: f64) -> Self {
        LeafValue::Number(OrderedFloat(value))
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Repr {
    Leaf {
        value: LeafValue,
        priority: Priority,
    },
    Children {
        children: BTreeMap<ChildKey, Node>,
        priority: Priority,
    },
}

#[derive(Clone, Debug)]
pub struct Node {
    repr: Arc<Repr>,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.repr, &other.repr) || self.repr == other.repr
    }
}

impl Eq for Node {}

impl Node {
    pub fn empty() -> Self {
        static EMPTY: std::sync::LazyLock<Node> = std::sync::LazyLock::new(|| Node {
            repr: Arc::new(Repr::Children {
                children: BTreeMap::new(),
                priority: Priority::None,
            }),
        });
        EMPTY.clone()
    }

    pub fn leaf(value: LeafValue) -> Self {
        Self::leaf_with_priority(value, Priority::None)
    }

    pub fn leaf_with_priority(value: LeafValue, priority: Priority) -> Self {
        Node {
            repr: Arc::new(Repr::Leaf { value, priority }),
        }
    }

    pub fn from_children(children: BTreeMap<ChildKey, Node>, priority: Priority) -> Self {
        let children: BTreeMap<ChildKey, Node> = children
            .into_iter()
            .filter(|(_, child)| !child.is_empty())
            .collect();
        if children.is_empty() {
            return Node::empty();
        }
        Node {
            repr: Arc::new(Repr::Children { children, priority }),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self.repr.as_ref() {
            Repr::Leaf { .. } => false,
            Repr::Children { children, .. } => children.is_empty(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.repr.as_ref(), Repr::Leaf { .. })
    }

    pub fn leaf_value(&self) -> Option<&LeafValue> {
        match self.repr.as_ref() {
            Repr::Leaf { value, .. } => Some(value),
            Repr::Children { .. } => None,
        }
    }

    pub fn priority(&self) -> &Priority {
        match self.repr.as_ref() {
            Repr::Leaf { priority, .. } => priority,
            Repr::Children { priority, .. } => priority,
        }
    }

    pub fn with_priority(&self, priority: Priority) -> Node {
        match self.repr.as_ref() {
            _ if self.is_empty() => Node::empty(),
            Repr::Leaf { value, .. } => Node::leaf_with_priority(value.clone(), priority),
            Repr::Children { children, .. } => Node {
                repr: Arc::new(Repr::Children {
                    children: children.clone(),
                    priority,
                }),
            },
        }
    }

    pub fn immediate_child(&self, key: &ChildKey) -> Node {
        match self.repr.as_ref() {
            Repr::Leaf { .. } => Node::empty(),
            Repr::Children { children, .. } => {
                children.get(key).cloned().unwrap_or_else(Node::empty)
            }
        }
    }

    pub fn get(&self, path: &Path) -> Node {
        let mut current = self.clone();
        for key in path.segments() {
            current = current.immediate_child(key);
            if current.is_empty() {
                return Node::empty();
            }
        }
        current
    }

    pub fn has_child(&self, key: &ChildKey) -> bool {
        match self.repr.as_ref() {
            Repr::Leaf { .. } => false,
            Repr::Children { children, .. } => children.contains_key(key),
        }
    }

    pub fn update_immediate_child(&self, key: &ChildKey, new_child: Node) -> Node {
        let (mut children, priority) = match self.repr.as_ref() {
            Repr::Children { children, priority } => (children.clone(), priority.clone()),
            // Writing a child through a leaf replaces the leaf with a
            // children node; the leaf value is lost, matching server behavior.
            Repr::Leaf { .. } => (BTreeMap::new(), Priority::None),
        };
        if new_child.is_empty() {
            children.remove(key);
        } else {
            children.insert(key.clone(), new_child);
        }
        if children.is_empty() {
            Node::empty()
        } else {
            Node {
                repr: Arc::new(Repr::Children { children, priority }),
            }
        }
    }

    pub fn update_child(&self, path: &Path, new_child: Node) -> Node {
        match path.front() {
            None => new_child,
            Some(front) => {
                let updated = self
                    .immediate_child(front)
                    .update_child(&path.pop_front(), new_child);
                self.update_immediate_child(front, updated)
            }
        }
    }

    pub fn num_children(&self) -> usize {
        match self.repr.as_ref() {
            Repr::Leaf { .. } => 0,
            Repr::Children { children, .. } => children.len(),
        }
    }

    /// Children in key order.
    pub fn children(&self) -> impl Iterator<Item = (&ChildKey, &Node)> {
        let children = match self.repr.as_ref() {
            Repr::Leaf { .. } => None,
            Repr::Children { children, .. } => Some(children.iter()),
        };
        children.into_iter().flatten()
    }

    pub fn first_child(&self) -> Option<(&ChildKey, &Node)> {
        self.children().next()
    }

    pub fn last_child(&self) -> Option<(&ChildKey, &Node)> {
        match self.repr.as_ref() {
            Repr::Leaf { .. } => None,
            Repr::Children { children, .. } => children.iter().next_back(),
        }
    }

    /// Whether any leaf under this node is an unresolved server placeholder.
    pub fn contains_placeholder(&self) -> bool {
        match self.repr.as_ref() {
            Repr::Leaf { value, .. } => matches!(value, LeafValue::Placeholder(_)),
            Repr::Children { children, .. } => {
                children.values().any(Node::contains_placeholder)
            }
        }
    }

    /// Plain JSON value, priorities stripped.
    pub fn value(&self) -> Value {
        serializer::node_to_json(self, false)
    }

    /// Export JSON: priorities encoded via `.priority` / `.value` wrappers.
    pub fn export_value(&self) -> Value {
        serializer::node_to_json(self, true)
    }

    /// Content hash used as the transaction precondition (`h` on the wire).
    pub fn hash(&self) -> String {
        hash::node_hash(self)
    }
}

impl Default for Node {
    fn default() -> Self {
        Node::empty()
    }
}

impl std::hash::Hash for Node {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self.repr.as_ref() {
            Repr::Leaf { value, priority } => {
                0u8.hash(state);
                value.hash(state);
                priority.hash(state);
            }
            Repr::Children { children, priority } => {
                1u8.hash(state);
                for (key, child) in children {
                    key.hash(state);
                    std::hash::Hash::hash(child, state);
                }
                priority.hash(state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ChildKey {
        ChildKey::new(name).unwrap()
    }

    #[test]
    fn empty_node_identity() {
        assert!(Node::empty().is_empty());
        assert_eq!(Node::empty(), Node::empty());
        assert!(!Node::leaf(LeafValue::Boolean(false)).is_empty());
    }

    #[test]
    fn removing_last_child_collapses_to_empty() {
        let node = Node::empty()
            .update_immediate_child(&key("a"), Node::leaf(LeafValue::number(1.0)));
        assert_eq!(node.num_children(), 1);

        let cleared = node.update_immediate_child(&key("a"), Node::empty());
        assert!(cleared.is_empty());
    }

    #[test]
    fn deep_update_creates_intermediate_children() {
        let path = Path::parse("a/b/c").unwrap();
        let node = Node::empty().update_child(&path, Node::leaf(LeafValue::number(3.0)));
        assert_eq!(node.get(&path).leaf_value(), Some(&LeafValue::number(3.0)));
        assert_eq!(node.num_children(), 1);
    }

    #[test]
    fn writing_child_through_leaf_discards_leaf() {
        let leaf = Node::leaf(LeafValue::String("scalar".into()));
        let node = leaf.update_immediate_child(&key("x"), Node::leaf(LeafValue::Boolean(true)));
        assert!(!node.is_leaf());
        assert!(node.has_child(&key("x")));
    }

    #[test]
    fn with_priority_on_empty_is_noop() {
        let prioritized = Node::empty().with_priority(Priority::String("p".into()));
        assert!(prioritized.is_empty());
        assert!(prioritized.priority().is_none());
    }

    #[test]
    fn placeholder_detection_recurses() {
        let placeholder = Node::leaf(LeafValue::Placeholder(
            r#"{".sv":"timestamp"}"#.to_string(),
        ));
        let tree = Node::empty().update_child(&Path::parse("a/b").unwrap(), placeholder);
        assert!(tree.contains_placeholder());
        assert!(!Node::leaf(LeafValue::number(0.0)).contains_placeholder());
    }
}
