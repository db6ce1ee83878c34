//! Index definitions and the total value order they rely on.

use std::cmp::Ordering;

use crate::core::node::{LeafValue, Node, Priority};
use crate::core::path::{key_compare, ChildKey, Path};
use crate::error::{invalid_argument, DatabaseResult};

/// Total order over nodes used wherever children are ranked by value:
/// empty < booleans (false < true) < numbers < strings < children.
/// Children nodes compare equal among themselves; the child key breaks ties.
pub fn value_order(a: &Node, b: &Node) -> Ordering {
    fn rank(node: &Node) -> u8 {
        if node.is_empty() {
            return 0;
        }
        match node.leaf_value() {
            Some(LeafValue::Boolean(_)) => 1,
            Some(LeafValue::Number(_)) => 2,
            Some(LeafValue::String(_)) => 3,
            Some(LeafValue::Placeholder(_)) => 5,
            None => 4,
        }
    }

    let (ra, rb) = (rank(a), rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a.leaf_value(), b.leaf_value()) {
        (Some(LeafValue::Boolean(x)), Some(LeafValue::Boolean(y))) => x.cmp(y),
        (Some(LeafValue::Number(x)), Some(LeafValue::Number(y))) => x.cmp(y),
        (Some(LeafValue::String(x)), Some(LeafValue::String(y))) => x.cmp(y),
        (Some(LeafValue::Placeholder(x)), Some(LeafValue::Placeholder(y))) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

/// A priority rendered as a node, so priority ordering reuses `value_order`.
pub fn priority_node(priority: &Priority) -> Node {
    match priority {
        Priority::None => Node::empty(),
        Priority::Number(value) => Node::leaf(LeafValue::Number(*value)),
        Priority::String(text) => Node::leaf(LeafValue::String(text.clone())),
    }
}

/// The four ways a view may rank children.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum Index {
    #[default]
    Priority,
    Key,
    Value,
    Child(Path),
}

impl Index {
    /// The value this index extracts from a child for ranking. The key index
    /// projects to empty; key order alone decides.
    pub fn indexed_value(&self, node: &Node) -> Node {
        match self {
            Index::Priority => priority_node(node.priority()),
            Index::Key => Node::empty(),
            Index::Value => node.clone(),
            Index::Child(path) => node.get(path),
        }
    }

    pub fn compare(&self, a: (&ChildKey, &Node), b: (&ChildKey, &Node)) -> Ordering {
        value_order(&self.indexed_value(a.1), &self.indexed_value(b.1))
            .then_with(|| key_compare(a.0, b.0))
    }

    pub fn is_default(&self) -> bool {
        matches!(self, Index::Priority)
    }

    /// Whether a child's position could have changed between two values.
    pub fn indexed_value_changed(&self, old: &Node, new: &Node) -> bool {
        self.indexed_value(old) != self.indexed_value(new)
    }

    /// Wire encoding used in listen bodies (`"i"`).
    pub fn to_wire(&self) -> String {
        match self {
            Index::Priority => ".priority".to_string(),
            Index::Key => ".key".to_string(),
            Index::Value => ".value".to_string(),
            Index::Child(path) => path
                .segments()
                .iter()
                .map(|key| key.as_str())
                .collect::<Vec<_>>()
                .join("/"),
        }
    }

    pub fn from_wire(raw: &str) -> DatabaseResult<Self> {
        match raw {
            ".priority" => Ok(Index::Priority),
            ".key" => Ok(Index::Key),
            ".value" => Ok(Index::Value),
            other => {
                let path = Path::parse(other)?;
                if path.is_empty() {
                    return Err(invalid_argument("index path cannot be empty"));
                }
                Ok(Index::Child(path))
            }
        }
    }
}
