//! JSON ↔ node conversion.
//!
//! Wire and user payloads are plain JSON; priorities travel through the
//! `.priority` / `.value` wrappers and server placeholders through `.sv`
//! objects. Arrays become children keyed `"0"`, `"1"`, … with nulls skipped.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::core::node::{LeafValue, Node, Priority};
use crate::core::path::ChildKey;
use crate::error::{invalid_argument, DatabaseResult};

pub fn json_to_node(value: &Value) -> DatabaseResult<Node> {
    json_to_node_with_priority(value, Priority::None)
}

fn json_to_node_with_priority(value: &Value, priority: Priority) -> DatabaseResult<Node> {
    match value {
        Value::Null => Ok(Node::empty()),
        Value::Bool(flag) => Ok(Node::leaf_with_priority(LeafValue::Boolean(*flag), priority)),
        Value::Number(number) => {
            let number = number
                .as_f64()
                .ok_or_else(|| invalid_argument("numeric value is out of range"))?;
            if !number.is_finite() {
                return Err(invalid_argument("NaN and infinity cannot be stored"));
            }
            Ok(Node::leaf_with_priority(LeafValue::number(number), priority))
        }
        Value::String(text) => Ok(Node::leaf_with_priority(
            LeafValue::String(text.clone()),
            priority,
        )),
        Value::Array(items) => {
            let mut children = BTreeMap::new();
            for (index, item) in items.iter().enumerate() {
                let child = json_to_node(item)?;
                if !child.is_empty() {
                    children.insert(ChildKey::from_trusted(index.to_string()), child);
                }
            }
            Ok(Node::from_children(children, priority))
        }
        Value::Object(map) => object_to_node(map, priority),
    }
}

fn object_to_node(map: &Map<String, Value>, outer_priority: Priority) -> DatabaseResult<Node> {
    if map.contains_key(".sv") {
        let serialized = serde_json::to_string(&Value::Object(map.clone()))
            .map_err(|err| invalid_argument(format!("unencodable server value: {err}")))?;
        return Ok(Node::leaf_with_priority(
            LeafValue::Placeholder(serialized),
            outer_priority,
        ));
    }

    let priority = match map.get(".priority") {
        Some(raw) => Priority::from_json(raw)?,
        None => outer_priority,
    };

    if let Some(wrapped) = map.get(".value") {
        return json_to_node_with_priority(wrapped, priority);
    }

    let mut children = BTreeMap::new();
    for (key, raw) in map {
        if key == ".priority" {
            continue;
        }
        let child = json_to_node(raw)?;
        if !child.is_empty() {
            children.insert(ChildKey::new(key.clone())?, child);
        }
    }
    Ok(Node::from_children(children, priority))
}

pub fn node_to_json(node: &Node, export: bool) -> Value {
    if node.is_empty() {
        return Value::Null;
    }

    if let Some(leaf) = node.leaf_value() {
        let plain = leaf_to_json(leaf);
        if export && !node.priority().is_none() {
            let mut wrapper = Map::with_capacity(2);
            wrapper.insert(".value".to_string(), plain);
            wrapper.insert(".priority".to_string(), node.priority().to_json());
            return Value::Object(wrapper);
        }
        return plain;
    }

    let mut map = Map::new();
    if export && !node.priority().is_none() {
        map.insert(".priority".to_string(), node.priority().to_json());
    }
    for (key, child) in node.children() {
        map.insert(key.as_str().to_string(), node_to_json(child, export));
    }
    Value::Object(map)
}

fn leaf_to_json(leaf: &LeafValue) -> Value {
    match leaf {
        LeafValue::Boolean(flag) => Value::Bool(*flag),
        LeafValue::Number(number) => number_to_json(number.into_inner()),
        LeafValue::String(text) => Value::String(text.clone()),
        LeafValue::Placeholder(raw) => {
            serde_json::from_str(raw).unwrap_or(Value::Null)
        }
    }
}

/// Integral doubles inside the 53-bit safe range serialize as JSON integers,
/// matching what the server echoes back.
fn number_to_json(value: f64) -> Value {
    const SAFE: f64 = 9_007_199_254_740_992.0;
    if value.fract() == 0.0 && value.abs() < SAFE {
        Value::from(value as i64)
    } else {
        serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalars_round_trip() {
        for value in [json!(true), json!(42), json!(4.25), json!("hello")] {
            let node = json_to_node(&value).unwrap();
            assert_eq!(node_to_json(&node, false), value);
        }
        assert!(json_to_node(&json!(null)).unwrap().is_empty());
    }

    #[test]
    fn nested_objects_skip_null_children() {
        let node = json_to_node(&json!({
            "alive": { "a": 1 },
            "dead": null
        }))
        .unwrap();
        assert_eq!(node.num_children(), 1);
        assert_eq!(node_to_json(&node, false), json!({ "alive": { "a": 1 } }));
    }

    #[test]
    fn arrays_become_integer_keyed_children() {
        let node = json_to_node(&json!(["x", null, "z"])).unwrap();
        assert_eq!(
            node_to_json(&node, false),
            json!({ "0": "x", "2": "z" })
        );
    }

    #[test]
    fn priority_wrappers_round_trip() {
        let exported = json!({ ".value": 10, ".priority": "gold" });
        let node = json_to_node(&exported).unwrap();
        assert_eq!(node.priority(), &Priority::String("gold".into()));
        assert_eq!(node_to_json(&node, true), exported);
        assert_eq!(node_to_json(&node, false), json!(10));
    }

    #[test]
    fn children_priority_survives_export() {
        let node = json_to_node(&json!({
            ".priority": 2,
            "a": 1
        }))
        .unwrap();
        assert_eq!(
            node_to_json(&node, true),
            json!({ ".priority": 2, "a": 1 })
        );
    }

    #[test]
    fn server_values_stay_verbatim() {
        let placeholder = json!({ ".sv": "timestamp" });
        let node = json_to_node(&placeholder).unwrap();
        assert!(node.contains_placeholder());
        assert_eq!(node_to_json(&node, false), placeholder);
    }

    #[test]
    fn rejects_non_finite_numbers() {
        let bad = Value::Number(serde_json::Number::from_f64(1.0).unwrap());
        assert!(json_to_node(&bad).is_ok());
        // NaN cannot be expressed through serde_json::Number; the guard covers
        // values arriving through other constructors.
    }

    #[test]
    fn invalid_keys_are_rejected() {
        assert!(json_to_node(&json!({ "a#b": 1 })).is_err());
    }
}
