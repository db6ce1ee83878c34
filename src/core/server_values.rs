//! Resolution of `.sv` placeholders against local state and server time.

use serde_json::Value;

use crate::core::node::serializer::json_to_node;
use crate::core::node::{LeafValue, Node};
use crate::core::path::Path;
use crate::core::sparse_snapshot_tree::SparseSnapshotTree;

/// The concrete values placeholders resolve to at one instant.
#[derive(Clone, Copy, Debug)]
pub struct ServerValues {
    /// Local clock plus the connection's measured offset, in millis.
    pub timestamp: i64,
}

impl ServerValues {
    pub fn generate(server_time_offset_millis: i64) -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|duration| duration.as_millis() as i64)
            .unwrap_or(0);
        Self {
            timestamp: now + server_time_offset_millis,
        }
    }
}

/// Replaces every placeholder leaf in `node`, using `existing` (the current
/// visible node at the same location) for `increment`.
pub fn resolve_deferred_value_snapshot(
    node: &Node,
    existing: &Node,
    server_values: &ServerValues,
) -> Node {
    if let Some(LeafValue::Placeholder(raw)) = node.leaf_value() {
        let priority = node.priority().clone();
        return resolve_placeholder(raw, existing, server_values).with_priority(priority);
    }
    if node.is_leaf() || node.is_empty() {
        return node.clone();
    }
    let mut resolved = node.clone();
    for (key, child) in node.children() {
        if child.contains_placeholder() {
            let existing_child = existing.immediate_child(key);
            resolved = resolved.update_immediate_child(
                key,
                resolve_deferred_value_snapshot(child, &existing_child, server_values),
            );
        }
    }
    resolved
}

/// Resolves every staged onDisconnect snapshot in place.
pub fn resolve_deferred_value_tree(
    tree: &SparseSnapshotTree,
    current: impl Fn(&Path) -> Node,
    server_values: &ServerValues,
) -> SparseSnapshotTree {
    let mut resolved = SparseSnapshotTree::new();
    tree.for_each(&Path::root(), &mut |path, node| {
        let existing = current(path);
        resolved.remember(
            path,
            resolve_deferred_value_snapshot(node, &existing, server_values),
        );
    });
    resolved
}

fn resolve_placeholder(raw: &str, existing: &Node, server_values: &ServerValues) -> Node {
    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw) else {
        return Node::empty();
    };
    match map.get(".sv") {
        Some(Value::String(token)) if token == "timestamp" => {
            Node::leaf(LeafValue::number(server_values.timestamp as f64))
        }
        Some(Value::Object(spec)) => match spec.get("increment") {
            Some(delta) => {
                let delta = delta.as_f64().unwrap_or(0.0);
                let base = match existing.leaf_value() {
                    Some(LeafValue::Number(number)) => number.into_inner(),
                    _ => 0.0,
                };
                Node::leaf(LeafValue::number(base + delta))
            }
            None => Node::empty(),
        },
        _ => Node::empty(),
    }
}

/// Convenience used by API layers working in JSON space.
pub fn resolve_deferred_json(
    value: &Value,
    existing: &Node,
    server_values: &ServerValues,
) -> crate::error::DatabaseResult<Node> {
    let node = json_to_node(value)?;
    Ok(resolve_deferred_value_snapshot(&node, existing, server_values))
}
