//! One location in the sync tree: the views anchored there.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::node::{IndexedNode, Node};
use crate::core::operation::Operation;
use crate::core::path::Path;
use crate::core::query::QuerySpec;
use crate::core::view::event::{Event, EventRegistration};
use crate::core::view::view_cache::{CacheNode, ViewCache};
use crate::core::view::View;
use crate::core::write_tree::WriteTreeRef;
use crate::error::DatabaseError;

#[derive(Default)]
pub struct SyncPoint {
    /// Views keyed by query id; at most one per distinct params.
    views: BTreeMap<String, View>,
}

impl SyncPoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn apply_operation(
        &mut self,
        operation: &Operation,
        writes: &WriteTreeRef<'_>,
        server_cache: Option<&Node>,
        target_query_id: Option<&str>,
    ) -> Vec<Event> {
        match target_query_id {
            Some(query_id) => match self.views.get_mut(query_id) {
                Some(view) => view.apply_operation(operation, writes, server_cache),
                None => {
                    // The listen was already torn down; nothing to update.
                    Vec::new()
                }
            },
            None => {
                let mut events = Vec::new();
                for view in self.views.values_mut() {
                    events.extend(view.apply_operation(operation, writes, server_cache));
                }
                events
            }
        }
    }

    pub fn add_event_registration(
        &mut self,
        spec: &QuerySpec,
        registration: Arc<EventRegistration>,
        writes: &WriteTreeRef<'_>,
        server_cache: Option<&Node>,
        server_cache_complete: bool,
    ) -> Vec<Event> {
        let query_id = spec.query_id();
        if !self.views.contains_key(&query_id) {
            // First listener at this spec: materialize the view.
            let event_cache = writes.calc_complete_event_cache(if server_cache_complete {
                server_cache
            } else {
                None
            });
            let (event_node, event_complete) = match event_cache {
                Some(node) => (node, true),
                None => (
                    writes.calc_complete_event_children(server_cache),
                    false,
                ),
            };

            let index = spec.params.index.clone();
            let view_cache = ViewCache::new(
                CacheNode::new(
                    IndexedNode::new(event_node, index.clone()),
                    event_complete,
                    false,
                ),
                CacheNode::new(
                    IndexedNode::new(
                        server_cache.cloned().unwrap_or_else(Node::empty),
                        index,
                    ),
                    server_cache_complete,
                    false,
                ),
            );
            self.views
                .insert(query_id.clone(), View::new(spec.clone(), &view_cache));
        }

        let view = self.views.get_mut(&query_id).expect("view just ensured");
        view.add_event_registration(registration.clone());
        view.initial_events(&registration)
    }

    /// Removes a registration. On a default spec the registration is removed
    /// from every view at this location. Returns the specs whose views died
    /// (candidates for unlisten) plus any cancel events.
    pub fn remove_event_registration(
        &mut self,
        spec: &QuerySpec,
        registration_id: Option<u64>,
        cancel_error: Option<DatabaseError>,
    ) -> (Vec<QuerySpec>, Vec<Event>) {
        let mut removed_specs = Vec::new();
        let mut cancel_events = Vec::new();
        let had_complete_view = self.has_complete_view();

        if spec.is_default() {
            let mut dead = Vec::new();
            for (query_id, view) in self.views.iter_mut() {
                cancel_events.extend(
                    view.remove_event_registration(registration_id, cancel_error.clone()),
                );
                if view.is_empty() {
                    dead.push(query_id.clone());
                    if !view.spec().params.loads_all_data() {
                        removed_specs.push(view.spec().clone());
                    }
                }
            }
            for query_id in dead {
                self.views.remove(&query_id);
            }
        } else {
            let query_id = spec.query_id();
            if let Some(view) = self.views.get_mut(&query_id) {
                cancel_events.extend(
                    view.remove_event_registration(registration_id, cancel_error.clone()),
                );
                if view.is_empty() {
                    self.views.remove(&query_id);
                    if !spec.params.loads_all_data() {
                        removed_specs.push(spec.clone());
                    }
                }
            }
        }

        if had_complete_view && !self.has_complete_view() {
            // The covering default listen is gone; the server listen at this
            // path must go too.
            removed_specs.push(QuerySpec::default_at(spec.path.clone()));
        }
        (removed_specs, cancel_events)
    }

    /// A complete server-side value for `path`, from whichever view has one.
    pub fn complete_server_cache(&self, path: &Path) -> Option<Node> {
        self.views
            .values()
            .find_map(|view| view.complete_server_cache(path))
    }

    pub fn view_for_spec(&self, spec: &QuerySpec) -> Option<&View> {
        self.views.get(&spec.query_id())
    }

    pub fn view_exists_for_spec(&self, spec: &QuerySpec) -> bool {
        self.views.contains_key(&spec.query_id())
    }

    /// Whether some view here loads all data (a default-style listen that
    /// covers every deeper query).
    pub fn has_complete_view(&self) -> bool {
        self.complete_view().is_some()
    }

    pub fn complete_view(&self) -> Option<&View> {
        self.views
            .values()
            .find(|view| view.spec().params.loads_all_data())
    }

    /// Views with filtering params (the ones that need their own tags).
    pub fn query_views(&self) -> impl Iterator<Item = &View> {
        self.views
            .values()
            .filter(|view| !view.spec().params.loads_all_data())
    }

    pub fn views(&self) -> impl Iterator<Item = &View> {
        self.views.values()
    }
}
