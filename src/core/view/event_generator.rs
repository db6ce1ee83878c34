//! Turns a batch of child changes into ordered listener events.
//!
//! Within one batch the order is: removes, adds, changes, moves, then the
//! value event. Each sub-sequence is sorted by the view's index, and child
//! events carry the key ordered immediately before them in the post-state.

use std::sync::Arc;

use crate::core::node::IndexedNode;
use crate::core::query::QuerySpec;
use crate::core::view::change::Change;
use crate::core::view::event::{DataEventPayload, Event, EventKind, EventRegistration};

pub struct EventGenerator {
    spec: QuerySpec,
}

impl EventGenerator {
    pub fn new(spec: QuerySpec) -> Self {
        Self { spec }
    }

    pub fn generate_events_for_changes(
        &self,
        changes: &[Change],
        event_cache: &IndexedNode,
        registrations: &[Arc<EventRegistration>],
    ) -> Vec<Event> {
        let index = &self.spec.params.index;

        // A change whose indexed value moved position also surfaces as a move.
        let moves: Vec<Change> = changes
            .iter()
            .filter_map(|change| match change {
                Change::ChildChanged {
                    key,
                    node,
                    old_node,
                } if index.indexed_value_changed(old_node, node) => Some(Change::ChildMoved {
                    key: key.clone(),
                    node: node.clone(),
                }),
                _ => None,
            })
            .collect();

        let mut events = Vec::new();
        self.generate_events_for_kind(
            &mut events,
            EventKind::ChildRemoved,
            changes,
            event_cache,
            registrations,
        );
        self.generate_events_for_kind(
            &mut events,
            EventKind::ChildAdded,
            changes,
            event_cache,
            registrations,
        );
        self.generate_events_for_kind(
            &mut events,
            EventKind::ChildChanged,
            changes,
            event_cache,
            registrations,
        );
        self.generate_events_for_kind(
            &mut events,
            EventKind::ChildMoved,
            &moves,
            event_cache,
            registrations,
        );
        self.generate_events_for_kind(
            &mut events,
            EventKind::Value,
            changes,
            event_cache,
            registrations,
        );
        events
    }

    fn generate_events_for_kind(
        &self,
        events: &mut Vec<Event>,
        kind: EventKind,
        changes: &[Change],
        event_cache: &IndexedNode,
        registrations: &[Arc<EventRegistration>],
    ) {
        let index = &self.spec.params.index;
        let mut filtered: Vec<&Change> = changes
            .iter()
            .filter(|change| change_kind(change) == kind)
            .collect();
        filtered.sort_by(|a, b| match (a.child_key(), b.child_key()) {
            (Some(key_a), Some(key_b)) => {
                index.compare((key_a, a.node()), (key_b, b.node()))
            }
            _ => std::cmp::Ordering::Equal,
        });

        for change in filtered {
            let prev_key = match kind {
                EventKind::Value | EventKind::ChildRemoved => None,
                _ => change
                    .child_key()
                    .and_then(|key| event_cache.predecessor(key)),
            };
            let payload = DataEventPayload {
                kind,
                path: self.spec.path.clone(),
                snapshot: change.node().clone(),
                index: index.clone(),
                child_key: change.child_key().cloned(),
                prev_key,
            };
            for registration in registrations {
                if registration.responds_to(kind) {
                    events.push(Event::Data {
                        payload: payload.clone(),
                        registration: registration.clone(),
                    });
                }
            }
        }
    }
}

fn change_kind(change: &Change) -> EventKind {
    match change {
        Change::Value { .. } => EventKind::Value,
        Change::ChildAdded { .. } => EventKind::ChildAdded,
        Change::ChildRemoved { .. } => EventKind::ChildRemoved,
        Change::ChildChanged { .. } => EventKind::ChildChanged,
        Change::ChildMoved { .. } => EventKind::ChildMoved,
    }
}
