//! Composable queries over a database location.

use std::sync::Arc;

use serde_json::Value;

use crate::api::database::Database;
use crate::api::listener::{
    ChildConsumer, ChildEvent, ListenerRegistration, ValueConsumer,
};
use crate::api::reference::DatabaseReference;
use crate::api::snapshot::DataSnapshot;
use crate::core::node::serializer::json_to_node;
use crate::core::node::Index;
use crate::core::path::{ChildKey, Path};
use crate::core::query::{QueryBound, QueryLimit, QueryParams, QuerySpec};
use crate::core::view::event::{EventConsumer, EventKind};
use crate::error::{invalid_argument, DatabaseResult};

#[derive(Clone, Debug)]
pub struct DatabaseQuery {
    reference: DatabaseReference,
    params: QueryParams,
}

impl DatabaseQuery {
    pub(crate) fn new(reference: DatabaseReference) -> Self {
        Self {
            reference,
            params: QueryParams::default(),
        }
    }

    pub fn reference(&self) -> &DatabaseReference {
        &self.reference
    }

    pub(crate) fn spec(&self) -> QuerySpec {
        QuerySpec::new(self.reference.path_internal().clone(), self.params.clone())
    }

    fn database(&self) -> &Database {
        self.reference.database()
    }

    // -----------------------------------------------------------------
    // Ordering
    // -----------------------------------------------------------------

    pub fn order_by_child(mut self, child_path: &str) -> DatabaseResult<Self> {
        validate_order_by_child_target(child_path)?;
        let path = Path::parse(child_path)?;
        if path.is_empty() {
            return Err(invalid_argument("orderByChild path cannot be empty"));
        }
        self.params.set_index(Index::Child(path))?;
        Ok(self)
    }

    pub fn order_by_key(mut self) -> DatabaseResult<Self> {
        self.params.set_index(Index::Key)?;
        Ok(self)
    }

    pub fn order_by_value(mut self) -> DatabaseResult<Self> {
        self.params.set_index(Index::Value)?;
        Ok(self)
    }

    pub fn order_by_priority(mut self) -> DatabaseResult<Self> {
        self.params.set_index(Index::Priority)?;
        Ok(self)
    }

    // -----------------------------------------------------------------
    // Bounds and limits
    // -----------------------------------------------------------------

    pub fn start_at(self, value: Value) -> DatabaseResult<Self> {
        self.add_bound(value, None, true, true)
    }

    pub fn start_at_with_key(
        self,
        value: Value,
        key: impl Into<String>,
    ) -> DatabaseResult<Self> {
        self.add_bound(value, Some(key.into()), true, true)
    }

    pub fn start_after(self, value: Value) -> DatabaseResult<Self> {
        self.add_bound(value, None, true, false)
    }

    pub fn start_after_with_key(
        self,
        value: Value,
        key: impl Into<String>,
    ) -> DatabaseResult<Self> {
        self.add_bound(value, Some(key.into()), true, false)
    }

    pub fn end_at(self, value: Value) -> DatabaseResult<Self> {
        self.add_bound(value, None, false, true)
    }

    pub fn end_at_with_key(self, value: Value, key: impl Into<String>) -> DatabaseResult<Self> {
        self.add_bound(value, Some(key.into()), false, true)
    }

    pub fn end_before(self, value: Value) -> DatabaseResult<Self> {
        self.add_bound(value, None, false, false)
    }

    pub fn end_before_with_key(
        self,
        value: Value,
        key: impl Into<String>,
    ) -> DatabaseResult<Self> {
        self.add_bound(value, Some(key.into()), false, false)
    }

    pub fn equal_to(self, value: Value) -> DatabaseResult<Self> {
        self.equal_to_with_optional_key(value, None)
    }

    pub fn equal_to_with_key(self, value: Value, key: impl Into<String>) -> DatabaseResult<Self> {
        self.equal_to_with_optional_key(value, Some(key.into()))
    }

    fn equal_to_with_optional_key(
        mut self,
        value: Value,
        key: Option<String>,
    ) -> DatabaseResult<Self> {
        let bound = make_bound(&value, key.as_deref())?;
        self.params.set_start(bound.clone(), true)?;
        self.params.set_end(bound, true)?;
        Ok(self)
    }

    fn add_bound(
        mut self,
        value: Value,
        key: Option<String>,
        is_start: bool,
        inclusive: bool,
    ) -> DatabaseResult<Self> {
        let bound = make_bound(&value, key.as_deref())?;
        if is_start {
            self.params.set_start(bound, inclusive)?;
        } else {
            self.params.set_end(bound, inclusive)?;
        }
        Ok(self)
    }

    pub fn limit_to_first(mut self, limit: u32) -> DatabaseResult<Self> {
        self.params.set_limit(QueryLimit::First(limit))?;
        Ok(self)
    }

    pub fn limit_to_last(mut self, limit: u32) -> DatabaseResult<Self> {
        self.params.set_limit(QueryLimit::Last(limit))?;
        Ok(self)
    }

    // -----------------------------------------------------------------
    // Listeners
    // -----------------------------------------------------------------

    /// Registers a value listener. The callback receives every snapshot of
    /// this query (starting with the current one once loaded), or the error
    /// that cancelled the listen.
    pub fn on_value<F>(&self, callback: F) -> DatabaseResult<ListenerRegistration>
    where
        F: Fn(DatabaseResult<DataSnapshot>) + Send + Sync + 'static,
    {
        self.register(
            EventKind::Value,
            Arc::new(ValueConsumer {
                database: self.database().clone(),
                callback: Arc::new(callback),
            }),
        )
    }

    pub fn on_child_added<F>(&self, callback: F) -> DatabaseResult<ListenerRegistration>
    where
        F: Fn(DatabaseResult<ChildEvent>) + Send + Sync + 'static,
    {
        self.register_child(EventKind::ChildAdded, callback)
    }

    pub fn on_child_changed<F>(&self, callback: F) -> DatabaseResult<ListenerRegistration>
    where
        F: Fn(DatabaseResult<ChildEvent>) + Send + Sync + 'static,
    {
        self.register_child(EventKind::ChildChanged, callback)
    }

    pub fn on_child_removed<F>(&self, callback: F) -> DatabaseResult<ListenerRegistration>
    where
        F: Fn(DatabaseResult<ChildEvent>) + Send + Sync + 'static,
    {
        self.register_child(EventKind::ChildRemoved, callback)
    }

    pub fn on_child_moved<F>(&self, callback: F) -> DatabaseResult<ListenerRegistration>
    where
        F: Fn(DatabaseResult<ChildEvent>) + Send + Sync + 'static,
    {
        self.register_child(EventKind::ChildMoved, callback)
    }

    fn register_child<F>(
        &self,
        kind: EventKind,
        callback: F,
    ) -> DatabaseResult<ListenerRegistration>
    where
        F: Fn(DatabaseResult<ChildEvent>) + Send + Sync + 'static,
    {
        self.register(
            kind,
            Arc::new(ChildConsumer {
                database: self.database().clone(),
                callback: Arc::new(callback),
            }),
        )
    }

    fn register(
        &self,
        kind: EventKind,
        consumer: Arc<dyn EventConsumer>,
    ) -> DatabaseResult<ListenerRegistration> {
        let database = self.database().clone();
        let id = database.mint_registration_id();
        let spec = self.spec();
        let task_spec = spec.clone();
        database.repo().post(move |repo| {
            repo.add_event_callback(id, task_spec, kind, consumer);
        })?;
        Ok(ListenerRegistration::new(database, spec, id))
    }

    // -----------------------------------------------------------------
    // Reads and sync pinning
    // -----------------------------------------------------------------

    /// One-shot read: asks the server, falling back to any complete local
    /// cache when offline.
    pub async fn get(&self) -> DatabaseResult<Value> {
        let (sender, receiver) = futures::channel::oneshot::channel();
        let spec = self.spec();
        self.database().repo().post(move |repo| {
            repo.get_value(
                spec,
                Box::new(move |result| {
                    let _ = sender.send(result);
                }),
            );
        })?;
        receiver
            .await
            .map_err(|_| crate::error::unavailable("database has been shut down"))?
    }

    /// Pins this query's server data locally (and to disk, when persistence
    /// is on) even while no listener is attached.
    pub fn keep_synced(&self, enabled: bool) -> DatabaseResult<()> {
        let spec = self.spec();
        self.database()
            .repo()
            .post(move |repo| repo.keep_synced(spec, enabled))
    }
}

fn make_bound(value: &Value, key: Option<&str>) -> DatabaseResult<QueryBound> {
    let node = json_to_node(value)?;
    if !(node.is_leaf() || node.is_empty()) {
        return Err(invalid_argument(
            "query bounds must be scalar values or null",
        ));
    }
    let key = match key {
        None => None,
        Some(raw) => Some(ChildKey::new(raw)?),
    };
    Ok(QueryBound { value: node, key })
}

fn validate_order_by_child_target(path: &str) -> DatabaseResult<()> {
    match path {
        "$key" | ".key" => Err(invalid_argument(
            "orderByChild(\"$key\") is invalid; call order_by_key() instead",
        )),
        "$priority" | ".priority" => Err(invalid_argument(
            "orderByChild(\"$priority\") is invalid; call order_by_priority() instead",
        )),
        "$value" | ".value" => Err(invalid_argument(
            "orderByChild(\"$value\") is invalid; call order_by_value() instead",
        )),
        _ => Ok(()),
    }
}

/// A single constraint produced by the standalone helpers below; applied in
/// order by [`query`].
#[derive(Clone, Debug)]
pub struct QueryConstraint {
    kind: QueryConstraintKind,
}

#[derive(Clone, Debug)]
enum QueryConstraintKind {
    OrderByChild(String),
    OrderByKey,
    OrderByValue,
    OrderByPriority,
    Start {
        value: Value,
        key: Option<String>,
        inclusive: bool,
    },
    End {
        value: Value,
        key: Option<String>,
        inclusive: bool,
    },
    LimitFirst(u32),
    LimitLast(u32),
    EqualTo {
        value: Value,
        key: Option<String>,
    },
}

impl QueryConstraint {
    fn apply(self, query: DatabaseQuery) -> DatabaseResult<DatabaseQuery> {
        match self.kind {
            QueryConstraintKind::OrderByChild(path) => query.order_by_child(&path),
            QueryConstraintKind::OrderByKey => query.order_by_key(),
            QueryConstraintKind::OrderByValue => query.order_by_value(),
            QueryConstraintKind::OrderByPriority => query.order_by_priority(),
            QueryConstraintKind::Start {
                value,
                key,
                inclusive,
            } => match key {
                Some(key) if inclusive => query.start_at_with_key(value, key),
                Some(key) => query.start_after_with_key(value, key),
                None if inclusive => query.start_at(value),
                None => query.start_after(value),
            },
            QueryConstraintKind::End {
                value,
                key,
                inclusive,
            } => match key {
                Some(key) if inclusive => query.end_at_with_key(value, key),
                Some(key) => query.end_before_with_key(value, key),
                None if inclusive => query.end_at(value),
                None => query.end_before(value),
            },
            QueryConstraintKind::LimitFirst(limit) => query.limit_to_first(limit),
            QueryConstraintKind::LimitLast(limit) => query.limit_to_last(limit),
            QueryConstraintKind::EqualTo { value, key } => match key {
                Some(key) => query.equal_to_with_key(value, key),
                None => query.equal_to(value),
            },
        }
    }
}

/// Builds a query by applying constraints to a reference, in order.
pub fn query(
    reference: DatabaseReference,
    constraints: impl IntoIterator<Item = QueryConstraint>,
) -> DatabaseResult<DatabaseQuery> {
    let mut current = reference.query();
    for constraint in constraints {
        current = constraint.apply(current)?;
    }
    Ok(current)
}

pub fn order_by_child(path: impl Into<String>) -> QueryConstraint {
    QueryConstraint {
        kind: QueryConstraintKind::OrderByChild(path.into()),
    }
}

pub fn order_by_key() -> QueryConstraint {
    QueryConstraint {
        kind: QueryConstraintKind::OrderByKey,
    }
}

pub fn order_by_value() -> QueryConstraint {
    QueryConstraint {
        kind: QueryConstraintKind::OrderByValue,
    }
}

pub fn order_by_priority() -> QueryConstraint {
    QueryConstraint {
        kind: QueryConstraintKind::OrderByPriority,
    }
}

pub fn start_at(value: impl Into<Value>) -> QueryConstraint {
    QueryConstraint {
        kind: QueryConstraintKind::Start {
            value: value.into(),
            key: None,
            inclusive: true,
        },
    }
}

pub fn start_at_with_key(value: impl Into<Value>, key: impl Into<String>) -> QueryConstraint {
    QueryConstraint {
        kind: QueryConstraintKind::Start {
            value: value.into(),
            key: Some(key.into()),
            inclusive: true,
        },
    }
}

pub fn start_after(value: impl Into<Value>) -> QueryConstraint {
    QueryConstraint {
        kind: QueryConstraintKind::Start {
            value: value.into(),
            key: None,
            inclusive: false,
        },
    }
}

pub fn start_after_with_key(value: impl Into<Value>, key: impl Into<String>) -> QueryConstraint {
    QueryConstraint {
        kind: QueryConstraintKind::Start {
            value: value.into(),
            key: Some(key.into()),
            inclusive: false,
        },
    }
}

pub fn end_at(value: impl Into<Value>) -> QueryConstraint {
    QueryConstraint {
        kind: QueryConstraintKind::End {
            value: value.into(),
            key: None,
            inclusive: true,
        },
    }
}

pub fn end_at_with_key(value: impl Into<Value>, key: impl Into<String>) -> QueryConstraint {
    QueryConstraint {
        kind: QueryConstraintKind::End {
            value: value.into(),
            key: Some(key.into()),
            inclusive: true,
        },
    }
}

pub fn end_before(value: impl Into<Value>) -> QueryConstraint {
    QueryConstraint {
        kind: QueryConstraintKind::End {
            value: value.into(),
            key: None,
            inclusive: false,
        },
    }
}

pub fn end_before_with_key(value: impl Into<Value>, key: impl Into<String>) -> QueryConstraint {
    QueryConstraint {
        kind: QueryConstraintKind::End {
            value: value.into(),
            key: Some(key.into()),
            inclusive: false,
        },
    }
}

pub fn limit_to_first(limit: u32) -> QueryConstraint {
    QueryConstraint {
        kind: QueryConstraintKind::LimitFirst(limit),
    }
}

pub fn limit_to_last(limit: u32) -> QueryConstraint {
    QueryConstraint {
        kind: QueryConstraintKind::LimitLast(limit),
    }
}

pub fn equal_to(value: impl Into<Value>) -> QueryConstraint {
    QueryConstraint {
        kind: QueryConstraintKind::EqualTo {
            value: value.into(),
            key: None,
        },
    }
}

pub fn equal_to_with_key(value: impl Into<Value>, key: impl Into<String>) -> QueryConstraint {
    QueryConstraint {
        kind: QueryConstraintKind::EqualTo {
            value: value.into(),
            key: Some(key.into()),
        },
    }
}
