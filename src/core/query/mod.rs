//! Query parameters and the addressable identity of a listen.

use serde_json::{Map, Value};

use crate::core::node::serializer::{json_to_node, node_to_json};
use crate::core::node::{Index, Node};
use crate::core::path::{predecessor_key, successor_key, ChildKey, Path};
use crate::error::{invalid_argument, DatabaseResult};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueryBound {
    pub value: Node,
    pub key: Option<ChildKey>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Copy)]
pub enum QueryLimit {
    First(u32),
    Last(u32),
}

impl QueryLimit {
    pub fn count(&self) -> u32 {
        match self {
            QueryLimit::First(count) | QueryLimit::Last(count) => *count,
        }
    }

    pub fn anchors_last(&self) -> bool {
        matches!(self, QueryLimit::Last(_))
    }
}

/// The (index, window, limit) portion of a query spec.
///
/// Exclusive bounds (`start_after` / `end_before`) are normalized into
/// inclusive ones at construction time, stepping the boundary key, so that
/// params equality, wire encoding, and local filtering all agree.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct QueryParams {
    pub index: Index,
    pub start: Option<QueryBound>,
    pub end: Option<QueryBound>,
    pub limit: Option<QueryLimit>,
    order_by_called: bool,
}

impl QueryParams {
    pub fn is_default(&self) -> bool {
        !self.order_by_called
            && self.index.is_default()
            && self.start.is_none()
            && self.end.is_none()
            && self.limit.is_none()
    }

    /// True when the params select every child (no window, no limit); such
    /// queries load complete data even if an explicit index was chosen.
    pub fn loads_all_data(&self) -> bool {
        self.start.is_none() && self.end.is_none() && self.limit.is_none()
    }

    pub fn set_index(&mut self, index: Index) -> DatabaseResult<()> {
        if self.order_by_called {
            return Err(invalid_argument("orderBy has already been specified"));
        }
        self.index = index;
        self.order_by_called = true;
        Ok(())
    }

    pub fn set_start(&mut self, bound: QueryBound, inclusive: bool) -> DatabaseResult<()> {
        if self.start.is_some() {
            return Err(invalid_argument(
                "startAt/startAfter/equalTo has already been specified",
            ));
        }
        let bound = if inclusive {
            bound
        } else {
            self.step_exclusive_bound(bound, true)
        };
        self.start = Some(bound);
        Ok(())
    }

    pub fn set_end(&mut self, bound: QueryBound, inclusive: bool) -> DatabaseResult<()> {
        if self.end.is_some() {
            return Err(invalid_argument(
                "endAt/endBefore/equalTo has already been specified",
            ));
        }
        let bound = if inclusive {
            bound
        } else {
            self.step_exclusive_bound(bound, false)
        };
        self.end = Some(bound);
        Ok(())
    }

    fn step_exclusive_bound(&self, bound: QueryBound, is_start: bool) -> QueryBound {
        if matches!(self.index, Index::Key) {
            // Keys are the sort values themselves; step the value's key form.
            let key = match bound.value.leaf_value() {
                Some(crate::core::node::LeafValue::String(text)) => {
                    ChildKey::from_trusted(text.clone())
                }
                _ => ChildKey::from_trusted(String::new()),
            };
            let stepped = if is_start {
                successor_key(&key)
            } else {
                predecessor_key(&key)
            };
            return QueryBound {
                value: Node::leaf(crate::core::node::LeafValue::String(
                    stepped.as_str().to_string(),
                )),
                key: None,
            };
        }

        let key = match (&bound.key, is_start) {
            (Some(key), true) => successor_key(key),
            (Some(key), false) => predecessor_key(key),
            (None, true) => ChildKey::max(),
            (None, false) => ChildKey::min(),
        };
        QueryBound {
            value: bound.value,
            key: Some(key),
        }
    }

    pub fn set_limit(&mut self, limit: QueryLimit) -> DatabaseResult<()> {
        if self.limit.is_some() {
            return Err(invalid_argument("limit has already been specified"));
        }
        if limit.count() == 0 {
            return Err(invalid_argument("limit must be greater than zero"));
        }
        self.limit = Some(limit);
        Ok(())
    }

    /// Start boundary as (value, key); the key defaults to the minimum
    /// sentinel so an unkeyed bound admits every key at the start value.
    pub fn start_bound(&self) -> Option<(Node, ChildKey)> {
        self.start.as_ref().map(|bound| {
            let key = bound.key.clone().unwrap_or_else(ChildKey::min);
            (bound.value.clone(), key)
        })
    }

    pub fn end_bound(&self) -> Option<(Node, ChildKey)> {
        self.end.as_ref().map(|bound| {
            let key = bound.key.clone().unwrap_or_else(ChildKey::max);
            (bound.value.clone(), key)
        })
    }

    /// Wire encoding for listen bodies (`"q"`).
    pub fn to_wire(&self) -> Value {
        let mut obj = Map::new();
        if let Some(bound) = &self.start {
            obj.insert("sp".to_string(), node_to_json(&bound.value, false));
            if let Some(key) = &bound.key {
                obj.insert("sn".to_string(), Value::String(key.as_str().to_string()));
            }
        }
        if let Some(bound) = &self.end {
            obj.insert("ep".to_string(), node_to_json(&bound.value, false));
            if let Some(key) = &bound.key {
                obj.insert("en".to_string(), Value::String(key.as_str().to_string()));
            }
        }
        if let Some(limit) = &self.limit {
            obj.insert("l".to_string(), Value::from(limit.count()));
            let anchor = if limit.anchors_last() { "r" } else { "l" };
            obj.insert("vf".to_string(), Value::String(anchor.to_string()));
        }
        if !self.index.is_default() {
            obj.insert("i".to_string(), Value::String(self.index.to_wire()));
        }
        Value::Object(obj)
    }

    pub fn from_wire(raw: &Value) -> DatabaseResult<Self> {
        let Some(obj) = raw.as_object() else {
            return Ok(QueryParams::default());
        };
        let mut params = QueryParams::default();
        if let Some(index) = obj.get("i").and_then(Value::as_str) {
            params.index = Index::from_wire(index)?;
            params.order_by_called = true;
        }
        if let Some(sp) = obj.get("sp") {
            params.start = Some(QueryBound {
                value: json_to_node(sp)?,
                key: obj
                    .get("sn")
                    .and_then(Value::as_str)
                    .map(ChildKey::from_trusted),
            });
        }
        if let Some(ep) = obj.get("ep") {
            params.end = Some(QueryBound {
                value: json_to_node(ep)?,
                key: obj
                    .get("en")
                    .and_then(Value::as_str)
                    .map(ChildKey::from_trusted),
            });
        }
        if let Some(count) = obj.get("l").and_then(Value::as_u64) {
            let anchor = obj.get("vf").and_then(Value::as_str).unwrap_or("l");
            params.limit = Some(if anchor == "r" {
                QueryLimit::Last(count as u32)
            } else {
                QueryLimit::First(count as u32)
            });
        }
        Ok(params)
    }
}

/// The addressable identity of a server listen: a path plus params.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QuerySpec {
    pub path: Path,
    pub params: QueryParams,
}

impl QuerySpec {
    pub fn new(path: Path, params: QueryParams) -> Self {
        Self { path, params }
    }

    pub fn default_at(path: Path) -> Self {
        Self {
            path,
            params: QueryParams::default(),
        }
    }

    pub fn is_default(&self) -> bool {
        self.params.is_default()
    }

    /// Stable textual identity; `"default"` for parameterless queries so a
    /// default listen at a path always maps to the same id.
    pub fn query_id(&self) -> String {
        if self.is_default() {
            return "default".to_string();
        }
        // serde_json::Map preserves insertion order; to_wire inserts in a
        // fixed sequence, so the serialization is canonical.
        serde_json::to_string(&self.params.to_wire()).unwrap_or_else(|_| "default".to_string())
    }

    /// Identity including the path, used as a persistence key.
    pub fn storage_key(&self) -> String {
        format!("{}|{}", self.path.to_wire(), self.query_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node::LeafValue;
    use serde_json::json;

    fn params() -> QueryParams {
        QueryParams::default()
    }

    #[test]
    fn default_detection() {
        assert!(params().is_default());
        let mut limited = params();
        limited.set_limit(QueryLimit::Last(2)).unwrap();
        assert!(!limited.is_default());
        assert!(!limited.loads_all_data());
    }

    #[test]
    fn duplicate_constraints_are_rejected() {
        let mut p = params();
        p.set_index(Index::Key).unwrap();
        assert!(p.set_index(Index::Value).is_err());
        p.set_limit(QueryLimit::First(5)).unwrap();
        assert!(p.set_limit(QueryLimit::First(5)).is_err());
        assert!(p.set_limit(QueryLimit::First(0)).is_err());

        let bound = QueryBound {
            value: Node::leaf(LeafValue::number(1.0)),
            key: None,
        };
        p.set_start(bound.clone(), true).unwrap();
        assert!(p.set_start(bound, true).is_err());
    }

    #[test]
    fn wire_round_trip() {
        let mut p = params();
        p.set_index(Index::Child(Path::parse("score").unwrap()))
            .unwrap();
        p.set_start(
            QueryBound {
                value: Node::leaf(LeafValue::number(10.0)),
                key: Some(ChildKey::new("alice").unwrap()),
            },
            true,
        )
        .unwrap();
        p.set_limit(QueryLimit::Last(3)).unwrap();

        let wire = p.to_wire();
        assert_eq!(
            wire,
            json!({ "sp": 10, "sn": "alice", "l": 3, "vf": "r", "i": "score" })
        );
        assert_eq!(QueryParams::from_wire(&wire).unwrap(), p);
    }

    #[test]
    fn start_after_normalizes_to_inclusive() {
        let mut p = params();
        p.set_start(
            QueryBound {
                value: Node::leaf(LeafValue::number(10.0)),
                key: Some(ChildKey::new("alice").unwrap()),
            },
            false,
        )
        .unwrap();
        let (value, key) = p.start_bound().unwrap();
        assert_eq!(value, Node::leaf(LeafValue::number(10.0)));
        assert_eq!(key.as_str(), "alice-");
    }

    #[test]
    fn query_ids_distinguish_specs() {
        let path = Path::parse("rooms").unwrap();
        let default = QuerySpec::default_at(path.clone());
        assert_eq!(default.query_id(), "default");

        let mut limited = params();
        limited.set_limit(QueryLimit::First(1)).unwrap();
        let spec = QuerySpec::new(path, limited);
        assert_ne!(spec.query_id(), default.query_id());
        assert!(spec.storage_key().starts_with("/rooms|"));
    }
}
