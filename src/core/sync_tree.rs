//! The authoritative local view of everything being observed.
//!
//! A path-indexed tree of sync points, the pending write log, and the tag
//! bookkeeping for filtered server listens. All server and user operations
//! enter here and come out as listener events.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::core::compound_write::CompoundWrite;
use crate::core::immutable_tree::ImmutableTree;
use crate::core::node::Node;
use crate::core::operation::{Operation, OperationSource, Tag};
use crate::core::path::{ChildKey, Path};
use crate::core::query::QuerySpec;
use crate::core::sync_point::SyncPoint;
use crate::core::view::event::{Event, EventRegistration};
use crate::core::write_tree::{WritePayload, WriteTree};
use crate::error::DatabaseError;

/// Where the sync tree sends listen start/stop commands.
pub trait ListenProvider: Send {
    fn start_listening(&mut self, spec: &QuerySpec, tag: Option<Tag>, hash: String);
    fn stop_listening(&mut self, spec: &QuerySpec, tag: Option<Tag>);
}

/// Provider that ignores everything; used for the `.info` tree.
pub struct NoopListenProvider;

impl ListenProvider for NoopListenProvider {
    fn start_listening(&mut self, _spec: &QuerySpec, _tag: Option<Tag>, _hash: String) {}
    fn stop_listening(&mut self, _spec: &QuerySpec, _tag: Option<Tag>) {}
}

#[derive(Default)]
struct SyncPointNode {
    point: Option<SyncPoint>,
    children: BTreeMap<ChildKey, SyncPointNode>,
}

impl SyncPointNode {
    fn is_empty(&self) -> bool {
        self.point.as_ref().map(SyncPoint::is_empty).unwrap_or(true)
            && self.children.is_empty()
    }

    fn get(&self, path: &Path) -> Option<&SyncPointNode> {
        let mut current = self;
        for key in path.segments() {
            current = current.children.get(key)?;
        }
        Some(current)
    }

    fn get_mut(&mut self, path: &Path) -> Option<&mut SyncPointNode> {
        let mut current = self;
        for key in path.segments() {
            current = current.children.get_mut(key)?;
        }
        Some(current)
    }

    fn ensure(&mut self, path: &Path) -> &mut SyncPointNode {
        let mut current = self;
        for key in path.segments() {
            current = current.children.entry(key.clone()).or_default();
        }
        current
    }

    fn prune(&mut self, path: &Path) {
        if let Some(front) = path.front() {
            if let Some(child) = self.children.get_mut(front) {
                child.prune(&path.pop_front());
                if child.is_empty() {
                    self.children.remove(front);
                }
            }
        }
    }
}

pub struct SyncTree {
    root: SyncPointNode,
    pending_write_tree: WriteTree,
    tag_to_query: HashMap<Tag, QuerySpec>,
    query_to_tag: HashMap<QuerySpec, Tag>,
    next_tag: u64,
    listen_provider: Box<dyn ListenProvider>,
}

impl SyncTree {
    pub fn new(listen_provider: Box<dyn ListenProvider>) -> Self {
        Self {
            root: SyncPointNode::default(),
            pending_write_tree: WriteTree::new(),
            tag_to_query: HashMap::new(),
            query_to_tag: HashMap::new(),
            next_tag: 1,
            listen_provider,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    pub fn pending_writes(&self) -> &WriteTree {
        &self.pending_write_tree
    }

    // ---------------------------------------------------------------------
    // User operations
    // ---------------------------------------------------------------------

    pub fn apply_user_overwrite(
        &mut self,
        path: Path,
        new_data: Node,
        write_id: u64,
        visible: bool,
    ) -> Vec<Event> {
        self.pending_write_tree
            .add_overwrite(path.clone(), new_data.clone(), write_id, visible);
        if !visible {
            return Vec::new();
        }
        self.apply_operation(&Operation::Overwrite {
            source: OperationSource::User,
            path,
            snap: new_data,
        })
    }

    pub fn apply_user_merge(
        &mut self,
        path: Path,
        changed_children: CompoundWrite,
        write_id: u64,
    ) -> Vec<Event> {
        self.pending_write_tree
            .add_merge(path.clone(), changed_children.clone(), write_id);
        self.apply_operation(&Operation::Merge {
            source: OperationSource::User,
            path,
            children: changed_children,
        })
    }

    /// Resolves a write with its terminal outcome: confirmed (`revert=false`)
    /// or rejected (`revert=true`).
    pub fn ack_user_write(&mut self, write_id: u64, revert: bool) -> Vec<Event> {
        let Some(record) = self.pending_write_tree.get_write(write_id) else {
            return Vec::new();
        };
        let path = record.path.clone();
        let affected = match &record.payload {
            WritePayload::Overwrite(_) => ImmutableTree::empty().set(&Path::root(), true),
            WritePayload::Merge(children) => {
                let mut tree = ImmutableTree::empty();
                for (child_path, _) in children.entries() {
                    tree = tree.set(&child_path, true);
                }
                tree
            }
        };

        let needs_reevaluation = self.pending_write_tree.remove_write(write_id);
        if !needs_reevaluation {
            return Vec::new();
        }
        self.apply_operation(&Operation::AckUserWrite {
            path,
            affected,
            revert,
        })
    }

    /// Cancels every pending write; views re-emit whatever the reverts demand.
    pub fn remove_all_writes(&mut self) -> Vec<Event> {
        let purged = self.pending_write_tree.purge_all_writes();
        if purged.is_empty() {
            return Vec::new();
        }
        // All writes vanished at once; replay the server state over the root.
        self.apply_operation(&Operation::AckUserWrite {
            path: Path::root(),
            affected: ImmutableTree::empty().set(&Path::root(), true),
            revert: true,
        })
    }

    // ---------------------------------------------------------------------
    // Server operations
    // ---------------------------------------------------------------------

    pub fn apply_server_overwrite(&mut self, path: Path, new_data: Node) -> Vec<Event> {
        self.apply_operation(&Operation::Overwrite {
            source: OperationSource::Server,
            path,
            snap: new_data,
        })
    }

    pub fn apply_server_merge(
        &mut self,
        path: Path,
        changed_children: &[(Path, Node)],
    ) -> Vec<Event> {
        let children = CompoundWrite::empty().add_writes(&Path::root(), changed_children);
        self.apply_operation(&Operation::Merge {
            source: OperationSource::Server,
            path,
            children,
        })
    }

    pub fn apply_listen_complete(&mut self, path: Path) -> Vec<Event> {
        self.apply_operation(&Operation::ListenComplete {
            source: OperationSource::Server,
            path,
        })
    }

    pub fn apply_tagged_query_overwrite(
        &mut self,
        path: Path,
        new_data: Node,
        tag: Tag,
    ) -> Vec<Event> {
        let Some(spec) = self.tag_to_query.get(&tag).cloned() else {
            // Affects a query that was already removed; ignore.
            return Vec::new();
        };
        let Some(relative) = spec.path.relative(&path) else {
            return Vec::new();
        };
        let operation = Operation::Overwrite {
            source: OperationSource::ServerTagged(tag),
            path: relative,
            snap: new_data,
        };
        self.apply_tagged_operation(&spec, &operation)
    }

    pub fn apply_tagged_query_merge(
        &mut self,
        path: Path,
        changed_children: &[(Path, Node)],
        tag: Tag,
    ) -> Vec<Event> {
        let Some(spec) = self.tag_to_query.get(&tag).cloned() else {
            return Vec::new();
        };
        let Some(relative) = spec.path.relative(&path) else {
            return Vec::new();
        };
        let children = CompoundWrite::empty().add_writes(&Path::root(), changed_children);
        let operation = Operation::Merge {
            source: OperationSource::ServerTagged(tag),
            path: relative,
            children,
        };
        self.apply_tagged_operation(&spec, &operation)
    }

    pub fn apply_tagged_listen_complete(&mut self, tag: Tag) -> Vec<Event> {
        let Some(spec) = self.tag_to_query.get(&tag).cloned() else {
            return Vec::new();
        };
        let operation = Operation::ListenComplete {
            source: OperationSource::ServerTagged(tag),
            path: Path::root(),
        };
        self.apply_tagged_operation(&spec, &operation)
    }

    fn apply_tagged_operation(&mut self, spec: &QuerySpec, operation: &Operation) -> Vec<Event> {
        let query_id = spec.query_id();
        let Some(node) = self.root.get_mut(&spec.path) else {
            return Vec::new();
        };
        let Some(point) = node.point.as_mut() else {
            return Vec::new();
        };
        let writes = self.pending_write_tree.child_writes(spec.path.clone());
        point.apply_operation(operation, &writes, None, Some(&query_id))
    }

    // ---------------------------------------------------------------------
    // Registrations
    // ---------------------------------------------------------------------

    pub fn add_event_registration(
        &mut self,
        registration: Arc<EventRegistration>,
        skip_listen_setup: bool,
    ) -> Vec<Event> {
        let spec = registration.spec.clone();
        let path = spec.path.clone();

        let mut server_cache: Option<Node> = None;
        let mut found_ancestor_default_view = false;
        {
            // Walk ancestors for a covering cache or a covering default view.
            let mut current = &self.root;
            let mut walked = 0usize;
            loop {
                if let Some(point) = &current.point {
                    let relative = Path::from_segments(path.segments()[walked..].to_vec());
                    server_cache = server_cache.or_else(|| point.complete_server_cache(&relative));
                    found_ancestor_default_view =
                        found_ancestor_default_view || point.has_complete_view();
                }
                if walked == path.len() {
                    break;
                }
                match current.children.get(&path.segments()[walked]) {
                    Some(child) => {
                        current = child;
                        walked += 1;
                    }
                    None => break,
                }
            }
        }

        let node = self.root.ensure(&path);
        if node.point.is_none() {
            node.point = Some(SyncPoint::new());
        }

        let server_cache_complete = server_cache.is_some();
        let server_cache = match server_cache {
            Some(cache) => Some(cache),
            None => {
                // Assemble whatever complete children the deeper sync points
                // can vouch for.
                let mut assembled = Node::empty();
                for (child_key, child_node) in &node.children {
                    if let Some(point) = &child_node.point {
                        if let Some(complete) = point.complete_server_cache(&Path::root()) {
                            assembled = assembled.update_immediate_child(child_key, complete);
                        }
                    }
                }
                (!assembled.is_empty()).then_some(assembled)
            }
        };

        let view_already_exists = node
            .point
            .as_ref()
            .expect("sync point ensured")
            .view_exists_for_spec(&spec);
        if !view_already_exists && !spec.params.loads_all_data() {
            debug_assert!(
                !self.query_to_tag.contains_key(&spec),
                "view does not exist but a tag is registered"
            );
            let tag = Tag(self.next_tag);
            self.next_tag += 1;
            self.query_to_tag.insert(spec.clone(), tag);
            self.tag_to_query.insert(tag, spec.clone());
        }

        let writes = self.pending_write_tree.child_writes(path.clone());
        let mut events = self
            .root
            .get_mut(&path)
            .and_then(|node| node.point.as_mut())
            .expect("sync point ensured")
            .add_event_registration(
                &spec,
                registration,
                &writes,
                server_cache.as_ref(),
                server_cache_complete,
            );

        if !view_already_exists && !found_ancestor_default_view && !skip_listen_setup {
            self.setup_listener(&spec);
        }
        events
    }

    /// Removes a registration; a no-op when nothing matches (idempotent
    /// unlisten). `registration_id = None` removes every listener at the spec.
    pub fn remove_event_registration(
        &mut self,
        spec: &QuerySpec,
        registration_id: Option<u64>,
        cancel_error: Option<DatabaseError>,
    ) -> Vec<Event> {
        let path = spec.path.clone();
        let Some(node) = self.root.get_mut(&path) else {
            return Vec::new();
        };
        let Some(point) = node.point.as_mut() else {
            return Vec::new();
        };
        if !(spec.is_default() || point.view_exists_for_spec(spec)) {
            return Vec::new();
        }

        let (removed, cancel_events) =
            point.remove_event_registration(spec, registration_id, cancel_error.clone());
        if point.is_empty() {
            node.point = None;
            self.root.prune(&path);
        }

        let removing_default = removed
            .iter()
            .any(|removed_spec| removed_spec.params.loads_all_data());
        let covered = self.is_path_covered_by_default_view(&path);

        if removing_default && !covered {
            // Promote the now-exposed deeper listens back onto the wire.
            if let Some(subtree) = self.root.get(&path) {
                let to_start = Self::collect_distinct_views(subtree, true);
                for (start_spec, hash) in to_start {
                    let tag = self.query_to_tag.get(&start_spec).copied();
                    let wire_spec = Self::spec_for_listening(&start_spec);
                    self.listen_provider.start_listening(&wire_spec, tag, hash);
                }
            }
        }

        if !covered && !removed.is_empty() && cancel_error.is_none() {
            if removing_default {
                let wire_spec = QuerySpec::default_at(path.clone());
                self.listen_provider.stop_listening(&wire_spec, None);
            } else {
                for removed_spec in &removed {
                    let tag = self.query_to_tag.get(removed_spec).copied();
                    let wire_spec = Self::spec_for_listening(removed_spec);
                    self.listen_provider.stop_listening(&wire_spec, tag);
                }
            }
        }

        for removed_spec in removed {
            if let Some(tag) = self.query_to_tag.remove(&removed_spec) {
                self.tag_to_query.remove(&tag);
            }
        }
        cancel_events
    }

    // ---------------------------------------------------------------------
    // Lookups
    // ---------------------------------------------------------------------

    /// The locally visible node at `path`, including hidden writes, with
    /// selected writes excluded (transaction rollback previews).
    pub fn calc_complete_event_cache(
        &self,
        path: &Path,
        write_ids_to_exclude: &[u64],
    ) -> Option<Node> {
        let server_cache = self.find_complete_server_cache(path);
        self.pending_write_tree.calc_complete_event_cache(
            path,
            server_cache.as_ref(),
            write_ids_to_exclude,
            true,
        )
    }

    /// The current event cache of the view for `spec`, when materialized and
    /// complete; used to answer one-shot reads locally.
    pub fn get_server_value(&self, spec: &QuerySpec) -> Option<Node> {
        let node = self.root.get(&spec.path)?;
        let point = node.point.as_ref()?;
        let view = point.view_for_spec(spec)?;
        let cache = view.view_cache().event_cache();
        cache.is_fully_initialized().then(|| cache.node().clone())
    }

    pub fn tag_for_query(&self, spec: &QuerySpec) -> Option<Tag> {
        self.query_to_tag.get(spec).copied()
    }

    /// Whether a materialized view currently exists for `spec`.
    pub fn view_exists(&self, spec: &QuerySpec) -> bool {
        self.root
            .get(&spec.path)
            .and_then(|node| node.point.as_ref())
            .map(|point| point.view_exists_for_spec(spec))
            .unwrap_or(false)
    }

    /// The complete server-confirmed value at `path`, if any view (at the
    /// path or an ancestor) can vouch for one.
    pub fn server_cache_at(&self, path: &Path) -> Option<Node> {
        self.find_complete_server_cache(path)
    }

    fn find_complete_server_cache(&self, path: &Path) -> Option<Node> {
        let mut current = &self.root;
        let mut walked = 0usize;
        loop {
            if let Some(point) = &current.point {
                let relative = Path::from_segments(path.segments()[walked..].to_vec());
                if let Some(cache) = point.complete_server_cache(&relative) {
                    return Some(cache);
                }
            }
            if walked == path.len() {
                return None;
            }
            match current.children.get(&path.segments()[walked]) {
                Some(child) => {
                    current = child;
                    walked += 1;
                }
                None => return None,
            }
        }
    }

    fn is_path_covered_by_default_view(&self, path: &Path) -> bool {
        let mut current = &self.root;
        let mut walked = 0usize;
        loop {
            if let Some(point) = &current.point {
                if point.has_complete_view() {
                    return true;
                }
            }
            if walked == path.len() {
                return false;
            }
            match current.children.get(&path.segments()[walked]) {
                Some(child) => {
                    current = child;
                    walked += 1;
                }
                None => return false,
            }
        }
    }

    // ---------------------------------------------------------------------
    // Listen management
    // ---------------------------------------------------------------------

    /// Queries that load all data go on the wire as default listens.
    fn spec_for_listening(spec: &QuerySpec) -> QuerySpec {
        if spec.params.loads_all_data() && !spec.is_default() {
            QuerySpec::default_at(spec.path.clone())
        } else {
            spec.clone()
        }
    }

    fn setup_listener(&mut self, spec: &QuerySpec) {
        let path = &spec.path;
        let tag = self.query_to_tag.get(spec).copied();
        let hash = self
            .root
            .get(path)
            .and_then(|node| node.point.as_ref())
            .and_then(|point| point.view_for_spec(spec))
            .map(|view| view.server_cache_node().hash())
            .unwrap_or_default();

        let wire_spec = Self::spec_for_listening(spec);
        self.listen_provider.start_listening(&wire_spec, tag, hash);

        if tag.is_none() {
            // A new default listen shadows every listen underneath it.
            let to_stop = self
                .root
                .get(path)
                .map(|subtree| Self::collect_queries_to_stop(subtree, true))
                .unwrap_or_default();
            for stop_spec in to_stop {
                let stop_tag = self.query_to_tag.get(&stop_spec).copied();
                let wire_stop = Self::spec_for_listening(&stop_spec);
                self.listen_provider.stop_listening(&wire_stop, stop_tag);
            }
        }
    }

    fn collect_queries_to_stop(node: &SyncPointNode, at_listen_root: bool) -> Vec<QuerySpec> {
        if !at_listen_root {
            if let Some(point) = &node.point {
                if let Some(view) = point.complete_view() {
                    return vec![view.spec().clone()];
                }
            }
        }
        let mut specs = Vec::new();
        if let Some(point) = &node.point {
            specs.extend(point.query_views().map(|view| view.spec().clone()));
        }
        for child in node.children.values() {
            specs.extend(Self::collect_queries_to_stop(child, false));
        }
        specs
    }

    /// The minimal set of (spec, server hash) listens covering a subtree.
    fn collect_distinct_views(
        node: &SyncPointNode,
        at_listen_root: bool,
    ) -> Vec<(QuerySpec, String)> {
        if !at_listen_root {
            if let Some(point) = &node.point {
                if let Some(view) = point.complete_view() {
                    return vec![(view.spec().clone(), view.server_cache_node().hash())];
                }
            }
        }
        let mut views = Vec::new();
        if let Some(point) = &node.point {
            views.extend(
                point
                    .query_views()
                    .map(|view| (view.spec().clone(), view.server_cache_node().hash())),
            );
        }
        for child in node.children.values() {
            views.extend(Self::collect_distinct_views(child, false));
        }
        views
    }

    // ---------------------------------------------------------------------
    // Operation routing
    // ---------------------------------------------------------------------

    fn apply_operation(&mut self, operation: &Operation) -> Vec<Event> {
        Self::apply_operation_helper(
            &mut self.root,
            &self.pending_write_tree,
            Path::root(),
            operation,
            None,
        )
    }

    fn apply_operation_helper(
        node: &mut SyncPointNode,
        write_tree: &WriteTree,
        abs_path: Path,
        operation: &Operation,
        mut server_cache: Option<Node>,
    ) -> Vec<Event> {
        if operation.path().is_empty() {
            return Self::apply_operation_descendants(
                node,
                write_tree,
                abs_path,
                operation,
                server_cache,
            );
        }

        if server_cache.is_none() {
            if let Some(point) = &node.point {
                server_cache = point.complete_server_cache(&Path::root());
            }
        }

        let mut events = Vec::new();
        let child_key = operation.path().front().expect("non-empty path").clone();
        if let (Some(child_node), Some(child_operation)) = (
            node.children.get_mut(&child_key),
            operation.for_child(&child_key),
        ) {
            let child_server_cache = server_cache
                .as_ref()
                .map(|cache| cache.immediate_child(&child_key));
            events.extend(Self::apply_operation_helper(
                child_node,
                write_tree,
                abs_path.child(child_key.clone()),
                &child_operation,
                child_server_cache,
            ));
        }
        if let Some(point) = node.point.as_mut() {
            let writes = write_tree.child_writes(abs_path);
            events.extend(point.apply_operation(operation, &writes, server_cache.as_ref(), None));
        }
        events
    }

    fn apply_operation_descendants(
        node: &mut SyncPointNode,
        write_tree: &WriteTree,
        abs_path: Path,
        operation: &Operation,
        mut server_cache: Option<Node>,
    ) -> Vec<Event> {
        if server_cache.is_none() {
            if let Some(point) = &node.point {
                server_cache = point.complete_server_cache(&Path::root());
            }
        }

        let mut events = Vec::new();
        for (child_key, child_node) in node.children.iter_mut() {
            if let Some(child_operation) = operation.for_child(child_key) {
                let child_server_cache = server_cache
                    .as_ref()
                    .map(|cache| cache.immediate_child(child_key));
                events.extend(Self::apply_operation_descendants(
                    child_node,
                    write_tree,
                    abs_path.child(child_key.clone()),
                    &child_operation,
                    child_server_cache,
                ));
            }
        }
        if let Some(point) = node.point.as_mut() {
            let writes = write_tree.child_writes(abs_path);
            events.extend(point.apply_operation(operation, &writes, server_cache.as_ref(), None));
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node::serializer::json_to_node;
    use crate::core::query::{QueryLimit, QueryParams};
    use crate::core::view::event::{DataEventPayload, EventConsumer, EventKind};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingProvider {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ListenProvider for RecordingProvider {
        fn start_listening(&mut self, spec: &QuerySpec, tag: Option<Tag>, _hash: String) {
            self.log.lock().unwrap().push(format!(
                "listen {} {} tag={:?}",
                spec.path.to_wire(),
                spec.query_id(),
                tag.map(|tag| tag.0)
            ));
        }

        fn stop_listening(&mut self, spec: &QuerySpec, _tag: Option<Tag>) {
            self.log
                .lock()
                .unwrap()
                .push(format!("unlisten {} {}", spec.path.to_wire(), spec.query_id()));
        }
    }

    #[derive(Default)]
    struct RecordingConsumer {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl EventConsumer for RecordingConsumer {
        fn fire_event(&self, payload: &DataEventPayload) {
            self.events.lock().unwrap().push(format!(
                "{} {} {}",
                payload.kind.as_str(),
                payload
                    .child_key
                    .as_ref()
                    .map(|key| key.as_str().to_string())
                    .unwrap_or_else(|| payload.path.to_wire()),
                payload.snapshot.value()
            ));
        }

        fn fire_cancel(&self, path: &Path, error: &DatabaseError) {
            self.events
                .lock()
                .unwrap()
                .push(format!("cancel {} {}", path.to_wire(), error.code_str()));
        }
    }

    fn registration(
        id: u64,
        spec: QuerySpec,
        kind: EventKind,
        consumer: Arc<RecordingConsumer>,
    ) -> Arc<EventRegistration> {
        Arc::new(EventRegistration {
            id,
            spec,
            kind,
            consumer,
        })
    }

    fn tree_with_log() -> (SyncTree, Arc<Mutex<Vec<String>>>) {
        let provider = RecordingProvider::default();
        let log = provider.log.clone();
        (SyncTree::new(Box::new(provider)), log)
    }

    fn p(raw: &str) -> Path {
        Path::parse(raw).unwrap()
    }

    #[test]
    fn value_listener_sees_server_then_user_data() {
        let (mut tree, _log) = tree_with_log();
        let consumer = Arc::new(RecordingConsumer::default());
        let spec = QuerySpec::default_at(p("users/alice"));

        let events =
            tree.add_event_registration(registration(1, spec, EventKind::Value, consumer.clone()), false);
        for event in events {
            event.fire();
        }
        // No initial event until the server answers.
        assert!(consumer.events.lock().unwrap().is_empty());

        let events = tree.apply_server_overwrite(p("users/alice"), Node::empty());
        for event in events {
            event.fire();
        }
        let events = tree.apply_user_overwrite(
            p("users/alice"),
            json_to_node(&json!({ "name": "Alice" })).unwrap(),
            1,
            true,
        );
        for event in events {
            event.fire();
        }

        let seen = consumer.events.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                "value /users/alice null".to_string(),
                "value /users/alice {\"name\":\"Alice\"}".to_string(),
            ]
        );
    }

    #[test]
    fn default_listen_consolidates_deeper_and_filtered_listens() {
        let (mut tree, log) = tree_with_log();
        let consumer = Arc::new(RecordingConsumer::default());

        // Filtered query at /rooms gets a tagged listen.
        let mut params = QueryParams::default();
        params.set_limit(QueryLimit::Last(2)).unwrap();
        let filtered = QuerySpec::new(p("rooms"), params);
        tree.add_event_registration(
            registration(1, filtered.clone(), EventKind::Value, consumer.clone()),
            false,
        );
        // Deeper default listen.
        let deep = QuerySpec::default_at(p("rooms/a"));
        tree.add_event_registration(
            registration(2, deep, EventKind::Value, consumer.clone()),
            false,
        );
        // Covering default listen shadows both.
        let covering = QuerySpec::default_at(p("rooms"));
        tree.add_event_registration(
            registration(3, covering, EventKind::Value, consumer.clone()),
            false,
        );

        let log = log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec![
                "listen /rooms {\"l\":2,\"vf\":\"r\"} tag=Some(1)".to_string(),
                "listen /rooms/a default tag=None".to_string(),
                "listen /rooms default tag=None".to_string(),
                "unlisten /rooms {\"l\":2,\"vf\":\"r\"}".to_string(),
                "unlisten /rooms/a default".to_string(),
            ]
        );
    }

    #[test]
    fn removing_covering_listen_promotes_covered_ones() {
        let (mut tree, log) = tree_with_log();
        let consumer = Arc::new(RecordingConsumer::default());

        let covering = QuerySpec::default_at(p("rooms"));
        tree.add_event_registration(
            registration(1, covering.clone(), EventKind::Value, consumer.clone()),
            false,
        );
        let deep = QuerySpec::default_at(p("rooms/a"));
        tree.add_event_registration(
            registration(2, deep, EventKind::Value, consumer.clone()),
            false,
        );
        log.lock().unwrap().clear();

        tree.remove_event_registration(&covering, Some(1), None);
        let log = log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec![
                "listen /rooms/a default tag=None".to_string(),
                "unlisten /rooms default".to_string(),
            ]
        );
    }

    #[test]
    fn unlisten_of_unknown_registration_is_noop() {
        let (mut tree, log) = tree_with_log();
        let spec = QuerySpec::default_at(p("nowhere"));
        let events = tree.remove_event_registration(&spec, Some(99), None);
        assert!(events.is_empty());
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn ack_revert_restores_server_state() {
        let (mut tree, _log) = tree_with_log();
        let consumer = Arc::new(RecordingConsumer::default());
        let spec = QuerySpec::default_at(p("x"));

        tree.add_event_registration(
            registration(1, spec, EventKind::Value, consumer.clone()),
            false,
        );
        for event in tree.apply_server_overwrite(p("x"), json_to_node(&json!("server")).unwrap()) {
            event.fire();
        }
        for event in
            tree.apply_user_overwrite(p("x"), json_to_node(&json!("local")).unwrap(), 1, true)
        {
            event.fire();
        }
        for event in tree.ack_user_write(1, true) {
            event.fire();
        }

        let seen = consumer.events.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                "value /x \"server\"".to_string(),
                "value /x \"local\"".to_string(),
                "value /x \"server\"".to_string(),
            ]
        );
    }

    #[test]
    fn ack_success_produces_no_duplicate_events() {
        let (mut tree, _log) = tree_with_log();
        let consumer = Arc::new(RecordingConsumer::default());
        let spec = QuerySpec::default_at(p("x"));

        tree.add_event_registration(
            registration(1, spec, EventKind::Value, consumer.clone()),
            false,
        );
        for event in tree.apply_server_overwrite(p("x"), Node::empty()) {
            event.fire();
        }
        for event in tree.apply_user_overwrite(p("x"), json_to_node(&json!(7)).unwrap(), 1, true) {
            event.fire();
        }
        // Server confirms the value, then the ack lands.
        for event in tree.apply_server_overwrite(p("x"), json_to_node(&json!(7)).unwrap()) {
            event.fire();
        }
        for event in tree.ack_user_write(1, false) {
            event.fire();
        }

        let seen = consumer.events.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec!["value /x null".to_string(), "value /x 7".to_string()]
        );
    }

    #[test]
    fn purge_reverts_all_pending_writes() {
        let (mut tree, _log) = tree_with_log();
        let consumer = Arc::new(RecordingConsumer::default());
        let spec = QuerySpec::default_at(p("x"));

        tree.add_event_registration(
            registration(1, spec, EventKind::Value, consumer.clone()),
            false,
        );
        for event in tree.apply_server_overwrite(p("x"), Node::empty()) {
            event.fire();
        }
        for event in tree.apply_user_overwrite(p("x"), json_to_node(&json!(1)).unwrap(), 1, true) {
            event.fire();
        }
        for event in tree.remove_all_writes() {
            event.fire();
        }

        let seen = consumer.events.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                "value /x null".to_string(),
                "value /x 1".to_string(),
                "value /x null".to_string(),
            ]
        );
    }

    #[test]
    fn child_events_arrive_in_index_order() {
        let (mut tree, _log) = tree_with_log();
        let consumer = Arc::new(RecordingConsumer::default());
        let spec = QuerySpec::default_at(p("scores"));

        tree.add_event_registration(
            registration(1, spec.clone(), EventKind::ChildAdded, consumer.clone()),
            false,
        );
        tree.add_event_registration(
            registration(2, spec, EventKind::ChildRemoved, consumer.clone()),
            false,
        );

        for event in tree.apply_server_overwrite(
            p("scores"),
            json_to_node(&json!({ "b": 2, "a": 1 })).unwrap(),
        ) {
            event.fire();
        }
        for event in
            tree.apply_server_overwrite(p("scores"), json_to_node(&json!({ "b": 2 })).unwrap())
        {
            event.fire();
        }

        let seen = consumer.events.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                "child_added a 1".to_string(),
                "child_added b 2".to_string(),
                "child_removed a 1".to_string(),
            ]
        );
    }

    #[test]
    fn tagged_updates_only_touch_their_view(){
        let (mut tree, _log) = tree_with_log();
        let consumer = Arc::new(RecordingConsumer::default());

        let mut params = QueryParams::default();
        params.set_limit(QueryLimit::Last(1)).unwrap();
        let spec = QuerySpec::new(p("items"), params);
        tree.add_event_registration(
            registration(1, spec.clone(), EventKind::Value, consumer.clone()),
            false,
        );

        let tag = tree.tag_for_query(&spec).expect("filtered query gets a tag");
        for event in tree.apply_tagged_query_overwrite(
            p("items"),
            json_to_node(&json!({ "last": 9 })).unwrap(),
            tag,
        ) {
            event.fire();
        }
        for event in tree.apply_tagged_listen_complete(tag) {
            event.fire();
        }

        let seen = consumer.events.lock().unwrap().clone();
        assert_eq!(seen, vec!["value /items {\"last\":9}".to_string()]);
    }
}
