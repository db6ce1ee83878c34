//! Snapshot content hashing.
//!
//! The server compares these hashes against its own when a write carries a
//! precondition (`h` in put bodies, listen bodies). Leaves hash a typed text
//! rendering (doubles as IEEE 754 bit patterns); children nodes concatenate
//! `:<key>:<child-hash>` in priority-index order. The digest is SHA-1,
//! base64-encoded; the empty node hashes to the empty string.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};

use crate::core::node::index::Index;
use crate::core::node::{IndexedNode, LeafValue, Node, Priority};

pub fn node_hash(node: &Node) -> String {
    if node.is_empty() {
        return String::new();
    }

    let mut text = String::new();
    hash_text(node, &mut text);
    sha1_base64(text.as_bytes())
}

fn hash_text(node: &Node, out: &mut String) {
    if let Priority::Number(_) | Priority::String(_) = node.priority() {
        out.push_str("priority:");
        priority_hash_text(node.priority(), out);
        out.push(':');
    }

    if let Some(leaf) = node.leaf_value() {
        leaf_hash_text(leaf, out);
        return;
    }

    let indexed = IndexedNode::new(node.clone(), Index::Priority);
    for (key, child) in indexed.iter() {
        out.push(':');
        out.push_str(key.as_str());
        out.push(':');
        out.push_str(&node_hash(&child));
    }
}

fn leaf_hash_text(leaf: &LeafValue, out: &mut String) {
    match leaf {
        LeafValue::Boolean(flag) => {
            out.push_str("boolean:");
            out.push_str(if *flag { "true" } else { "false" });
        }
        LeafValue::Number(number) => {
            out.push_str("number:");
            out.push_str(&double_to_ieee754_hex(number.into_inner()));
        }
        LeafValue::String(text) => {
            out.push_str("string:");
            out.push_str(text);
        }
        // Placeholders never reach a hashed snapshot; hash their JSON text so
        // the function stays total.
        LeafValue::Placeholder(raw) => {
            out.push_str("deferred:");
            out.push_str(raw);
        }
    }
}

fn priority_hash_text(priority: &Priority, out: &mut String) {
    match priority {
        Priority::None => {}
        Priority::Number(number) => {
            out.push_str("number:");
            out.push_str(&double_to_ieee754_hex(number.into_inner()));
        }
        Priority::String(text) => {
            out.push_str("string:");
            out.push_str(text);
        }
    }
}

fn double_to_ieee754_hex(value: f64) -> String {
    format!("{:016x}", value.to_bits())
}

fn sha1_base64(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    BASE64.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node::serializer::json_to_node;
    use serde_json::json;

    #[test]
    fn empty_node_hashes_to_empty_string() {
        assert_eq!(node_hash(&Node::empty()), "");
    }

    #[test]
    fn double_bits_render_as_hex() {
        assert_eq!(double_to_ieee754_hex(1.0), "3ff0000000000000");
        assert_eq!(double_to_ieee754_hex(0.0), "0000000000000000");
        assert_eq!(double_to_ieee754_hex(-2.5), "c004000000000000");
    }

    #[test]
    fn hash_is_stable_and_value_sensitive() {
        let a1 = node_hash(&json_to_node(&json!({ "x": 1, "y": "s" })).unwrap());
        let a2 = node_hash(&json_to_node(&json!({ "y": "s", "x": 1 })).unwrap());
        let b = node_hash(&json_to_node(&json!({ "x": 2, "y": "s" })).unwrap());
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert!(!a1.is_empty());
    }

    #[test]
    fn priority_changes_the_hash() {
        let plain = json_to_node(&json!("v")).unwrap();
        let prioritized = json_to_node(&json!({ ".value": "v", ".priority": 1 })).unwrap();
        assert_ne!(node_hash(&plain), node_hash(&prioritized));
    }

    #[test]
    fn children_hash_uses_priority_order() {
        // Same children, different priorities: order inside the hash text
        // changes, so the hash changes.
        let one = json_to_node(&json!({
            "a": { ".value": 1, ".priority": 2 },
            "b": { ".value": 2, ".priority": 1 }
        }))
        .unwrap();
        let two = json_to_node(&json!({
            "a": { ".value": 1, ".priority": 1 },
            "b": { ".value": 2, ".priority": 2 }
        }))
        .unwrap();
        assert_ne!(node_hash(&one), node_hash(&two));
    }
}
