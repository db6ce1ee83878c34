//! Adapters between user callbacks and the engine's event consumers, plus
//! the RAII listener handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::api::database::Database;
use crate::api::snapshot::DataSnapshot;
use crate::core::path::Path;
use crate::core::query::QuerySpec;
use crate::core::view::event::{DataEventPayload, EventConsumer, EventKind};
use crate::error::{DatabaseError, DatabaseResult};

/// The kind of child-level change a [`ChildEvent`] describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildEventType {
    Added,
    Changed,
    Removed,
    Moved,
}

impl ChildEventType {
    pub(crate) fn from_event_kind(kind: EventKind) -> Option<Self> {
        match kind {
            EventKind::ChildAdded => Some(ChildEventType::Added),
            EventKind::ChildChanged => Some(ChildEventType::Changed),
            EventKind::ChildRemoved => Some(ChildEventType::Removed),
            EventKind::ChildMoved => Some(ChildEventType::Moved),
            EventKind::Value => None,
        }
    }
}

/// One child-level notification: the child snapshot plus the key ordered
/// immediately before it under the query's index.
#[derive(Clone, Debug)]
pub struct ChildEvent {
    pub event_type: ChildEventType,
    pub snapshot: DataSnapshot,
    pub previous_key: Option<String>,
}

pub(crate) type ValueCallback =
    Arc<dyn Fn(DatabaseResult<DataSnapshot>) + Send + Sync + 'static>;
pub(crate) type ChildCallback =
    Arc<dyn Fn(DatabaseResult<ChildEvent>) + Send + Sync + 'static>;

pub(crate) struct ValueConsumer {
    pub database: Database,
    pub callback: ValueCallback,
}

impl EventConsumer for ValueConsumer {
    fn fire_event(&self, payload: &DataEventPayload) {
        let Ok(reference) = self.database.reference_at(&payload.path) else {
            return;
        };
        let snapshot =
            DataSnapshot::new(reference, payload.snapshot.clone(), payload.index.clone());
        (self.callback)(Ok(snapshot));
    }

    fn fire_cancel(&self, _path: &Path, error: &DatabaseError) {
        (self.callback)(Err(error.clone()));
    }
}

pub(crate) struct ChildConsumer {
    pub database: Database,
    pub callback: ChildCallback,
}

impl EventConsumer for ChildConsumer {
    fn fire_event(&self, payload: &DataEventPayload) {
        let Some(event_type) = ChildEventType::from_event_kind(payload.kind) else {
            return;
        };
        let Some(child_key) = &payload.child_key else {
            return;
        };
        let child_path = payload.path.child(child_key.clone());
        let Ok(reference) = self.database.reference_at(&child_path) else {
            return;
        };
        let snapshot =
            DataSnapshot::new(reference, payload.snapshot.clone(), payload.index.clone());
        (self.callback)(Ok(ChildEvent {
            event_type,
            snapshot,
            previous_key: payload
                .prev_key
                .as_ref()
                .map(|key| key.as_str().to_string()),
        }));
    }

    fn fire_cancel(&self, _path: &Path, error: &DatabaseError) {
        (self.callback)(Err(error.clone()));
    }
}

/// RAII listener handle: dropping it (or calling [`detach`]) removes the
/// listener. Detaching twice, or after the listener was already cancelled,
/// is a no-op.
///
/// [`detach`]: ListenerRegistration::detach
pub struct ListenerRegistration {
    database: Database,
    spec: QuerySpec,
    id: u64,
    detached: AtomicBool,
}

impl ListenerRegistration {
    pub(crate) fn new(database: Database, spec: QuerySpec, id: u64) -> Self {
        Self {
            database,
            spec,
            id,
            detached: AtomicBool::new(false),
        }
    }

    pub fn detach(self) {
        self.detach_inner();
    }

    fn detach_inner(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        let spec = self.spec.clone();
        let id = self.id;
        let _ = self
            .database
            .repo()
            .post(move |repo| repo.remove_event_callback(spec, Some(id)));
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.detach_inner();
    }
}
