//! Events delivered to listeners, and the registrations that receive them.

use std::fmt;
use std::sync::Arc;

use crate::core::node::{Index, Node};
use crate::core::path::{ChildKey, Path};
use crate::core::query::QuerySpec;
use crate::error::DatabaseError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Value,
    ChildAdded,
    ChildChanged,
    ChildRemoved,
    ChildMoved,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Value => "value",
            EventKind::ChildAdded => "child_added",
            EventKind::ChildChanged => "child_changed",
            EventKind::ChildRemoved => "child_removed",
            EventKind::ChildMoved => "child_moved",
        }
    }
}

/// A materialized data event: the snapshot plus ordering context.
#[derive(Clone, Debug)]
pub struct DataEventPayload {
    pub kind: EventKind,
    /// Path of the query the event was generated for.
    pub path: Path,
    pub snapshot: Node,
    pub index: Index,
    /// The child the event is about; `None` for value events.
    pub child_key: Option<ChildKey>,
    /// The key ordered immediately before this child in the post-state.
    pub prev_key: Option<ChildKey>,
}

/// Receiver half of a registration. The API layer adapts user closures to
/// this; the engine only ever talks to the trait.
pub trait EventConsumer: Send + Sync {
    fn fire_event(&self, payload: &DataEventPayload);
    fn fire_cancel(&self, path: &Path, error: &DatabaseError);
}

/// One listener attached to a query spec for one event kind.
pub struct EventRegistration {
    pub id: u64,
    pub spec: QuerySpec,
    pub kind: EventKind,
    pub consumer: Arc<dyn EventConsumer>,
}

impl EventRegistration {
    pub fn responds_to(&self, kind: EventKind) -> bool {
        self.kind == kind
    }
}

impl fmt::Debug for EventRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistration")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("path", &self.spec.path)
            .finish()
    }
}

/// A scheduled delivery: payload plus the registration it targets.
#[derive(Clone)]
pub enum Event {
    Data {
        payload: DataEventPayload,
        registration: Arc<EventRegistration>,
    },
    Cancel {
        path: Path,
        error: DatabaseError,
        registration: Arc<EventRegistration>,
    },
}

impl Event {
    pub fn fire(&self) {
        match self {
            Event::Data {
                payload,
                registration,
            } => registration.consumer.fire_event(payload),
            Event::Cancel {
                path,
                error,
                registration,
            } => registration.consumer.fire_cancel(path, error),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Event::Data { payload, .. } => &payload.path,
            Event::Cancel { path, .. } => path,
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Data { payload, .. } => f
                .debug_struct("DataEvent")
                .field("kind", &payload.kind.as_str())
                .field("path", &payload.path)
                .field("child", &payload.child_key)
                .finish(),
            Event::Cancel { path, error, .. } => f
                .debug_struct("CancelEvent")
                .field("path", path)
                .field("error", &error.code_str())
                .finish(),
        }
    }
}
