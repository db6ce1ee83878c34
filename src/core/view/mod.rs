//! A materialized query: filtered snapshots plus the listeners watching them.

pub mod change;
pub mod event;
pub mod event_generator;
pub mod filter;
pub mod processor;
pub mod view_cache;

use std::sync::Arc;

use crate::core::node::{IndexedNode, Node};
use crate::core::operation::Operation;
use crate::core::path::Path;
use crate::core::query::QuerySpec;
use crate::core::view::change::Change;
use crate::core::view::event::{Event, EventKind, EventRegistration};
use crate::core::view::event_generator::EventGenerator;
use crate::core::view::filter::{filter_for_params, IndexedFilter, NodeFilter};
use crate::core::view::processor::ViewProcessor;
use crate::core::view::view_cache::{CacheNode, ViewCache};
use crate::core::write_tree::WriteTreeRef;
use crate::error::DatabaseError;

pub struct View {
    spec: QuerySpec,
    processor: ViewProcessor,
    view_cache: ViewCache,
    registrations: Vec<Arc<EventRegistration>>,
    event_generator: EventGenerator,
}

impl View {
    pub fn new(spec: QuerySpec, initial_view_cache: &ViewCache) -> Self {
        let index_filter = IndexedFilter::new(spec.params.index.clone());
        let filter = filter_for_params(&spec.params);

        let initial_server = initial_view_cache.server_cache();
        let initial_event = initial_view_cache.event_cache();

        // The server cache stays unfiltered until tagged data proves the
        // server is filtering for us; the event cache runs through the real
        // filter immediately.
        let empty = IndexedNode::new(Node::empty(), spec.params.index.clone());
        let server_snap = index_filter.update_full_node(&empty, initial_server.indexed(), None);
        let event_snap = filter.update_full_node(&empty, initial_event.indexed(), None);

        let view_cache = ViewCache::new(
            CacheNode::new(
                event_snap,
                initial_event.is_fully_initialized(),
                filter.filters_nodes(),
            ),
            CacheNode::new(
                server_snap,
                initial_server.is_fully_initialized(),
                index_filter.filters_nodes(),
            ),
        );

        Self {
            event_generator: EventGenerator::new(spec.clone()),
            processor: ViewProcessor::new(filter),
            view_cache,
            registrations: Vec::new(),
            spec,
        }
    }

    pub fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    pub fn view_cache(&self) -> &ViewCache {
        &self.view_cache
    }

    pub fn server_cache_node(&self) -> &Node {
        self.view_cache.server_cache().node()
    }

    /// The complete server value under `path`, when this view can vouch for
    /// it (it loads all data, or it has that child materialized).
    pub fn complete_server_cache(&self, path: &Path) -> Option<Node> {
        let cache = self.view_cache.complete_server_snap()?;
        if self.spec.params.loads_all_data()
            || (!path.is_empty()
                && !cache
                    .immediate_child(path.front().expect("non-empty"))
                    .is_empty())
        {
            return Some(cache.get(path));
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.len()
    }

    pub fn add_event_registration(&mut self, registration: Arc<EventRegistration>) {
        self.registrations.push(registration);
    }

    /// Removes a registration (all of them when `registration_id` is `None`).
    /// With a cancel error, returns one cancel event per removed value/child
    /// registration instead of silently dropping them.
    pub fn remove_event_registration(
        &mut self,
        registration_id: Option<u64>,
        cancel_error: Option<DatabaseError>,
    ) -> Vec<Event> {
        let removed: Vec<Arc<EventRegistration>> = match registration_id {
            None => std::mem::take(&mut self.registrations),
            Some(id) => {
                let (removed, kept) = std::mem::take(&mut self.registrations)
                    .into_iter()
                    .partition(|registration| registration.id == id);
                self.registrations = kept;
                removed
            }
        };

        match cancel_error {
            None => Vec::new(),
            Some(error) => removed
                .into_iter()
                .map(|registration| Event::Cancel {
                    path: self.spec.path.clone(),
                    error: error.clone(),
                    registration,
                })
                .collect(),
        }
    }

    pub fn apply_operation(
        &mut self,
        operation: &Operation,
        writes: &WriteTreeRef<'_>,
        complete_server_cache: Option<&Node>,
    ) -> Vec<Event> {
        let (new_cache, changes) = self.processor.apply_operation(
            &self.view_cache,
            operation,
            writes,
            complete_server_cache,
        );
        self.view_cache = new_cache;
        self.generate_events(&changes, None)
    }

    /// The events a newly attached registration must see to catch up with
    /// the current state: one add per child, then the value.
    pub fn initial_events(&self, registration: &Arc<EventRegistration>) -> Vec<Event> {
        let event_cache = self.view_cache.event_cache();
        if !event_cache.is_fully_initialized() {
            return Vec::new();
        }
        let mut changes: Vec<Change> = event_cache
            .indexed()
            .iter()
            .map(|(key, node)| Change::ChildAdded { key, node })
            .collect();
        changes.push(Change::Value {
            snapshot: event_cache.node().clone(),
        });
        self.generate_events(&changes, Some(registration))
    }

    fn generate_events(
        &self,
        changes: &[Change],
        only: Option<&Arc<EventRegistration>>,
    ) -> Vec<Event> {
        let scoped;
        let registrations: &[Arc<EventRegistration>] = match only {
            Some(registration) => {
                scoped = [registration.clone()];
                &scoped
            }
            None => &self.registrations,
        };
        self.event_generator.generate_events_for_changes(
            changes,
            self.view_cache.event_cache().indexed(),
            registrations,
        )
    }

    /// Whether any registration listens for `kind`.
    pub fn has_registration_for(&self, kind: EventKind) -> bool {
        self.registrations
            .iter()
            .any(|registration| registration.responds_to(kind))
    }
}
