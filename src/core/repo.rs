//! The engine: a single task owning the sync trees, the write queue, and the
//! transaction runner.
//!
//! Every public operation posts a closure onto the run-loop channel; the task
//! drains it in FIFO order, so engine state needs no locks. Results travel
//! back through oneshot completions, and listener callbacks go out through
//! the event target.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::auth::TokenProvider;
use crate::core::compound_write::CompoundWrite;
use crate::core::event_queue::EventTarget;
use crate::core::node::serializer::json_to_node;
use crate::core::node::{LeafValue, Node, Priority};
use crate::core::path::{ChildKey, Path};
use crate::core::query::QuerySpec;
use crate::core::server_values::{
    resolve_deferred_value_snapshot, resolve_deferred_value_tree, ServerValues,
};
use crate::core::snapshot_holder::SnapshotHolder;
use crate::core::sparse_snapshot_tree::SparseSnapshotTree;
use crate::core::sync_tree::{ListenProvider, NoopListenProvider, SyncTree};
use crate::core::transaction::{
    TransactionData, TransactionResult, TransactionStatus, TransactionTree, TransactionUpdate,
    TransactionUpdater, MAX_TRANSACTION_RETRIES,
};
use crate::core::view::event::{
    DataEventPayload, Event, EventConsumer, EventKind, EventRegistration,
};
use crate::core::view::filter::filter_for_params;
use crate::error::{
    disconnected, invalid_argument, overridden_by_set, unavailable,
    write_canceled, DatabaseError, DatabaseResult,
};
use crate::logger::Logger;
use crate::persistence::PersistenceManager;
use crate::realtime::persistent_connection::{
    ConnectionDelegate, ConnectionTunables, PersistentConnection, PersistentConnectionHandle,
    RangeMerge, StatusCallback,
};
use crate::realtime::HostInfo;
use crate::runtime::spawn_detached;

type EngineTask = Box<dyn FnOnce(&mut Repo) + Send>;

/// Handle to the run loop; cloneable, cheap, and the only way in.
#[derive(Clone)]
pub struct RepoHandle {
    sender: mpsc::UnboundedSender<EngineTask>,
}

impl RepoHandle {
    pub fn post(&self, task: impl FnOnce(&mut Repo) + Send + 'static) -> DatabaseResult<()> {
        self.sender
            .send(Box::new(task))
            .map_err(|_| unavailable("database has been shut down"))
    }

    /// Posts a task and blocks the caller (never the engine) on its result.
    pub async fn call<T: Send + 'static>(
        &self,
        task: impl FnOnce(&mut Repo) -> T + Send + 'static,
    ) -> DatabaseResult<T> {
        let (sender, receiver) = futures::channel::oneshot::channel();
        self.post(move |repo| {
            let _ = sender.send(task(repo));
        })?;
        receiver
            .await
            .map_err(|_| unavailable("database has been shut down"))
    }
}

/// Everything the engine needs from the outside world, passed explicitly.
pub struct RepoConfig {
    pub host_info: HostInfo,
    pub token_provider: Arc<dyn TokenProvider>,
    pub tunables: ConnectionTunables,
    pub persistence: Option<Arc<PersistenceManager>>,
    /// Registration-id space shared with the API layer, so listener handles
    /// can be minted without a round trip through the run loop.
    pub registration_ids: Arc<AtomicU64>,
}

enum PendingPut {
    Write {
        path: Path,
        complete: Option<StatusCallback>,
    },
    Transaction {
        path: Path,
        write_ids: Vec<u64>,
    },
}

pub struct Repo {
    logger: Logger,
    event_target: EventTarget,
    connection: PersistentConnectionHandle,
    self_handle: RepoHandle,
    server_sync_tree: SyncTree,
    info_sync_tree: SyncTree,
    info_data: SnapshotHolder,
    persistence: Option<Arc<PersistenceManager>>,

    next_write_id: u64,
    registration_ids: Arc<AtomicU64>,
    pending_puts: HashMap<u64, PendingPut>,

    on_disconnect_staging: SparseSnapshotTree,
    transactions: TransactionTree,
    transaction_watches: HashMap<String, Vec<u64>>,
    next_transaction_order: u64,

    server_time_offset: i64,
    connected: bool,
    keep_synced: HashMap<String, (QuerySpec, u64)>,
    shutting_down: bool,
}

struct ConnectionListenProvider {
    connection: PersistentConnectionHandle,
}

impl ListenProvider for ConnectionListenProvider {
    fn start_listening(
        &mut self,
        spec: &QuerySpec,
        tag: Option<crate::core::operation::Tag>,
        hash: String,
    ) {
        self.connection.listen(spec.clone(), tag, hash);
    }

    fn stop_listening(&mut self, spec: &QuerySpec, _tag: Option<crate::core::operation::Tag>) {
        self.connection.unlisten(spec.clone());
    }
}

/// Routes connection callbacks back onto the run loop.
struct RepoDelegate {
    handle: RepoHandle,
}

impl ConnectionDelegate for RepoDelegate {
    fn on_connect(&self) {
        let _ = self.handle.post(Repo::handle_connect);
    }

    fn on_disconnect(&self) {
        let _ = self.handle.post(Repo::handle_disconnect);
    }

    fn on_data_update(
        &self,
        path: Path,
        data: Value,
        is_merge: bool,
        tag: Option<crate::core::operation::Tag>,
    ) {
        let _ = self.handle.post(move |repo| {
            repo.handle_data_update(path, data, is_merge, tag);
        });
    }

    fn on_range_merge(
        &self,
        path: Path,
        merges: Vec<RangeMerge>,
        tag: Option<crate::core::operation::Tag>,
    ) {
        let _ = self.handle.post(move |repo| {
            repo.handle_range_merge(path, merges, tag);
        });
    }

    fn on_listen_revoked(&self, path: Path, params: Option<Value>, error: DatabaseError) {
        let _ = self.handle.post(move |repo| {
            repo.handle_listen_revoked(path, params, error);
        });
    }

    fn on_write_response(&self, write_id: u64, result: DatabaseResult<()>) {
        let _ = self.handle.post(move |repo| {
            repo.handle_write_response(write_id, result);
        });
    }

    fn on_server_info_update(&self, server_time_offset_millis: i64) {
        let _ = self.handle.post(move |repo| {
            repo.handle_server_info_update(server_time_offset_millis);
        });
    }

    fn on_auth_status(&self, authenticated: bool) {
        let _ = self.handle.post(move |repo| {
            repo.handle_auth_status(authenticated);
        });
    }

    fn on_connection_shutdown(&self, reason: String) {
        let _ = self.handle.post(move |repo| {
            repo.handle_connection_shutdown(reason);
        });
    }
}

impl Repo {
    /// Builds the engine and starts its run loop. The connection stays down
    /// until the first listen or write creates interest.
    pub fn spawn(config: RepoConfig, logger: Logger) -> RepoHandle {
        let (sender, mut receiver) = mpsc::unbounded_channel::<EngineTask>();
        let handle = RepoHandle { sender };

        let delegate = Arc::new(RepoDelegate {
            handle: handle.clone(),
        });
        let connection = PersistentConnection::spawn(
            config.host_info,
            delegate,
            config.token_provider,
            config.tunables,
            Logger::new("firebase-database/connection"),
        );

        let event_target = EventTarget::new(Logger::new("firebase-database/events"));
        let server_sync_tree = SyncTree::new(Box::new(ConnectionListenProvider {
            connection: connection.clone(),
        }));
        let info_sync_tree = SyncTree::new(Box::new(NoopListenProvider));

        let mut repo = Repo {
            logger,
            event_target,
            connection,
            self_handle: handle.clone(),
            server_sync_tree,
            info_sync_tree,
            info_data: SnapshotHolder::new(),
            persistence: config.persistence,
            next_write_id: 1,
            registration_ids: config.registration_ids,
            pending_puts: HashMap::new(),
            on_disconnect_staging: SparseSnapshotTree::new(),
            transactions: TransactionTree::default(),
            transaction_watches: HashMap::new(),
            next_transaction_order: 1,
            server_time_offset: 0,
            connected: false,
            keep_synced: HashMap::new(),
            shutting_down: false,
        };
        repo.startup();

        spawn_detached(async move {
            while let Some(task) = receiver.recv().await {
                task(&mut repo);
                if repo.shutting_down {
                    break;
                }
            }
        });
        handle
    }

    /// Initial `.info` state and persisted-write recovery. The write log
    /// loads before any server data can arrive, so local shadowing is in
    /// place first.
    fn startup(&mut self) {
        self.update_info("connected", Node::leaf(LeafValue::Boolean(false)));
        self.update_info("authenticated", Node::leaf(LeafValue::Boolean(false)));
        self.update_info("serverTimeOffset", Node::leaf(LeafValue::number(0.0)));

        let Some(persistence) = self.persistence.clone() else {
            return;
        };
        self.next_write_id = persistence.last_write_id() + 1;
        let server_values = ServerValues::generate(0);
        for write in persistence.load_user_writes() {
            let write_id = write.write_id;
            self.logger
                .debug(format!("replaying persisted write {write_id}"));
            if let Some(node) = write.overwrite {
                let existing = self.latest_state(&write.path, &[]);
                let resolved =
                    resolve_deferred_value_snapshot(&node, &existing, &server_values);
                let events = self.server_sync_tree.apply_user_overwrite(
                    write.path.clone(),
                    resolved,
                    write_id,
                    true,
                );
                self.raise_events(events);
                self.pending_puts.insert(
                    write_id,
                    PendingPut::Write {
                        path: write.path.clone(),
                        complete: None,
                    },
                );
                self.connection
                    .put(write.path, node.export_value(), None, write_id);
            } else if let Some(merge) = write.merge {
                let events = self.server_sync_tree.apply_user_merge(
                    write.path.clone(),
                    merge.clone(),
                    write_id,
                );
                self.raise_events(events);
                let mut data = Map::new();
                for (child_path, node) in merge.entries() {
                    data.insert(
                        child_path
                            .segments()
                            .iter()
                            .map(ChildKey::as_str)
                            .collect::<Vec<_>>()
                            .join("/"),
                        node.export_value(),
                    );
                }
                self.pending_puts.insert(
                    write_id,
                    PendingPut::Write {
                        path: write.path.clone(),
                        complete: None,
                    },
                );
                self.connection
                    .merge(write.path, Value::Object(data), write_id);
            }
        }
    }

    fn raise_events(&self, events: Vec<Event>) {
        self.event_target.post_events(events);
    }

    fn post_completion(&self, complete: StatusCallback, result: DatabaseResult<()>) {
        self.event_target.post(move || complete(result));
    }

    fn take_write_id(&mut self) -> u64 {
        let id = self.next_write_id;
        self.next_write_id += 1;
        id
    }

    fn server_values(&self) -> ServerValues {
        ServerValues::generate(self.server_time_offset)
    }

    /// The locally visible node at `path`, hidden writes included.
    fn latest_state(&self, path: &Path, exclude: &[u64]) -> Node {
        self.server_sync_tree
            .calc_complete_event_cache(path, exclude)
            .unwrap_or_else(Node::empty)
    }

    // -----------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------

    pub fn set_value(
        &mut self,
        path: Path,
        value: Value,
        priority: Option<Value>,
        complete: StatusCallback,
    ) {
        if path.is_info_path() {
            self.post_completion(
                complete,
                Err(invalid_argument("the .info tree is read-only")),
            );
            return;
        }
        let node = match build_node(value, priority) {
            Ok(node) => node,
            Err(err) => {
                self.post_completion(complete, Err(err));
                return;
            }
        };

        let server_values = self.server_values();
        let existing = self.latest_state(&path, &[]);
        let resolved = resolve_deferred_value_snapshot(&node, &existing, &server_values);

        let write_id = self.take_write_id();
        if let Some(persistence) = &self.persistence {
            persistence.save_user_overwrite(&path, &node, write_id);
        }
        let events =
            self.server_sync_tree
                .apply_user_overwrite(path.clone(), resolved, write_id, true);
        self.raise_events(events);

        self.pending_puts.insert(
            write_id,
            PendingPut::Write {
                path: path.clone(),
                complete: Some(complete),
            },
        );
        self.connection
            .put(path.clone(), node.export_value(), None, write_id);

        let affected = self.abort_transactions(&path, overridden_by_set("transaction overridden by set"));
        self.rerun_transactions(&affected);
    }

    pub fn set_priority(&mut self, path: Path, priority: Value, complete: StatusCallback) {
        let priority_node = match Priority::from_json(&priority) {
            Ok(parsed) => crate::core::node::index::priority_node(&parsed),
            Err(err) => {
                self.post_completion(complete, Err(err));
                return;
            }
        };
        let priority_path = path.child(ChildKey::from_trusted(".priority"));

        let write_id = self.take_write_id();
        let events = self.server_sync_tree.apply_user_overwrite(
            priority_path.clone(),
            priority_node.clone(),
            write_id,
            true,
        );
        self.raise_events(events);

        self.pending_puts.insert(
            write_id,
            PendingPut::Write {
                path: priority_path.clone(),
                complete: Some(complete),
            },
        );
        self.connection
            .put(priority_path, priority_node.export_value(), None, write_id);
    }

    pub fn update_children(
        &mut self,
        path: Path,
        updates: Map<String, Value>,
        complete: StatusCallback,
    ) {
        if path.is_info_path() {
            self.post_completion(
                complete,
                Err(invalid_argument("the .info tree is read-only")),
            );
            return;
        }
        if updates.is_empty() {
            // An empty update is a successful no-op.
            self.post_completion(complete, Ok(()));
            return;
        }

        let mut raw = CompoundWrite::empty();
        let mut wire = Map::new();
        for (raw_child_path, value) in &updates {
            let child_path = match Path::parse(raw_child_path) {
                Ok(parsed) if !parsed.is_empty() => parsed,
                Ok(_) => {
                    self.post_completion(
                        complete,
                        Err(invalid_argument("update keys must be non-empty paths")),
                    );
                    return;
                }
                Err(err) => {
                    self.post_completion(complete, Err(err));
                    return;
                }
            };
            let node = match json_to_node(value) {
                Ok(node) => node,
                Err(err) => {
                    self.post_completion(complete, Err(err));
                    return;
                }
            };
            raw = raw.add_write(&child_path, node.clone());
            wire.insert(raw_child_path.clone(), node.export_value());
        }

        let server_values = self.server_values();
        let mut resolved = CompoundWrite::empty();
        for (child_path, node) in raw.entries() {
            let absolute = path.join(&child_path);
            let existing = self.latest_state(&absolute, &[]);
            resolved = resolved.add_write(
                &child_path,
                resolve_deferred_value_snapshot(&node, &existing, &server_values),
            );
        }

        let write_id = self.take_write_id();
        if let Some(persistence) = &self.persistence {
            persistence.save_user_merge(&path, &raw, write_id);
        }
        let events =
            self.server_sync_tree
                .apply_user_merge(path.clone(), resolved, write_id);
        self.raise_events(events);

        self.pending_puts.insert(
            write_id,
            PendingPut::Write {
                path: path.clone(),
                complete: Some(complete),
            },
        );
        self.connection
            .merge(path.clone(), Value::Object(wire), write_id);

        for (child_path, _) in raw.entries() {
            let absolute = path.join(&child_path);
            let affected = self.abort_transactions(
                &absolute,
                overridden_by_set("transaction overridden by update"),
            );
            self.rerun_transactions(&affected);
        }
    }

    fn handle_write_response(&mut self, write_id: u64, result: DatabaseResult<()>) {
        match self.pending_puts.remove(&write_id) {
            None => {
                // Already purged or resolved; nothing to do.
            }
            Some(PendingPut::Write { path, complete }) => {
                let revert = result.is_err();
                if let Err(err) = &result {
                    self.logger
                        .warn(format!("write at {path} rejected: {err}"));
                }
                if let Some(persistence) = &self.persistence {
                    persistence.remove_user_write(write_id);
                }
                let events = self.server_sync_tree.ack_user_write(write_id, revert);
                self.raise_events(events);
                if let Some(complete) = complete {
                    self.post_completion(complete, result);
                }
                if revert {
                    self.rerun_transactions(&path);
                }
            }
            Some(PendingPut::Transaction { path, write_ids }) => {
                self.handle_transaction_response(path, write_ids, result);
            }
        }
    }

    // -----------------------------------------------------------------
    // onDisconnect
    // -----------------------------------------------------------------

    pub fn on_disconnect_set(&mut self, path: Path, value: Value, complete: StatusCallback) {
        let node = match json_to_node(&value) {
            Ok(node) => node,
            Err(err) => {
                self.post_completion(complete, Err(err));
                return;
            }
        };
        let staging_path = path.clone();
        let staged = node.clone();
        let handle = self.repo_handle_for_callbacks();
        self.connection.on_disconnect_put(
            path,
            node.export_value(),
            Box::new(move |result| {
                if result.is_ok() {
                    let _ = handle.post(move |repo| {
                        repo.on_disconnect_staging.remember(&staging_path, staged);
                    });
                }
                complete(result);
            }),
        );
    }

    pub fn on_disconnect_merge(
        &mut self,
        path: Path,
        updates: Map<String, Value>,
        complete: StatusCallback,
    ) {
        let mut staged: Vec<(Path, Node)> = Vec::new();
        let mut wire = Map::new();
        for (raw_child_path, value) in &updates {
            let child_path = match Path::parse(raw_child_path) {
                Ok(parsed) => parsed,
                Err(err) => {
                    self.post_completion(complete, Err(err));
                    return;
                }
            };
            let node = match json_to_node(value) {
                Ok(node) => node,
                Err(err) => {
                    self.post_completion(complete, Err(err));
                    return;
                }
            };
            staged.push((child_path, node.clone()));
            wire.insert(raw_child_path.clone(), node.export_value());
        }

        let staging_root = path.clone();
        let handle = self.repo_handle_for_callbacks();
        self.connection.on_disconnect_merge(
            path,
            Value::Object(wire),
            Box::new(move |result| {
                if result.is_ok() {
                    let _ = handle.post(move |repo| {
                        for (child_path, node) in staged {
                            repo.on_disconnect_staging
                                .remember(&staging_root.join(&child_path), node);
                        }
                    });
                }
                complete(result);
            }),
        );
    }

    pub fn on_disconnect_cancel(&mut self, path: Path, complete: StatusCallback) {
        let staging_path = path.clone();
        let handle = self.repo_handle_for_callbacks();
        self.connection.on_disconnect_cancel(
            path,
            Box::new(move |result| {
                if result.is_ok() {
                    let _ = handle.post(move |repo| {
                        repo.on_disconnect_staging.forget(&staging_path);
                    });
                }
                complete(result);
            }),
        );
    }

    /// Connection callbacks run on the connection task; they post back onto
    /// the run loop through this handle.
    fn repo_handle_for_callbacks(&self) -> RepoHandle {
        self.self_handle.clone()
    }

    // -----------------------------------------------------------------
    // Listeners
    // -----------------------------------------------------------------

    fn take_registration_id(&self) -> u64 {
        self.registration_ids.fetch_add(1, Ordering::SeqCst)
    }

    /// Registers a listener under a caller-minted id (see
    /// [`RepoConfig::registration_ids`]).
    pub fn add_event_callback(
        &mut self,
        id: u64,
        spec: QuerySpec,
        kind: EventKind,
        consumer: Arc<dyn EventConsumer>,
    ) -> u64 {
        let registration = Arc::new(EventRegistration {
            id,
            spec: spec.clone(),
            kind,
            consumer,
        });

        if spec.path.is_info_path() {
            let mut events = self
                .info_sync_tree
                .add_event_registration(registration, false);
            events.extend(
                self.info_sync_tree
                    .apply_server_overwrite(spec.path.clone(), self.info_data.get(&spec.path)),
            );
            self.raise_events(events);
            return id;
        }

        if let Some(persistence) = &self.persistence {
            persistence.set_query_active(&spec);
        }
        let cached = self
            .persistence
            .as_ref()
            .and_then(|persistence| persistence.server_cache(&spec));

        let mut events = self
            .server_sync_tree
            .add_event_registration(registration, false);
        if !self.connected {
            if let Some(cached) = cached {
                events.extend(
                    self.server_sync_tree
                        .apply_server_overwrite(spec.path.clone(), cached),
                );
            }
        }
        self.raise_events(events);
        id
    }

    pub fn remove_event_callback(&mut self, spec: QuerySpec, registration_id: Option<u64>) {
        if spec.path.is_info_path() {
            let events = self
                .info_sync_tree
                .remove_event_registration(&spec, registration_id, None);
            self.raise_events(events);
            return;
        }
        let events = self
            .server_sync_tree
            .remove_event_registration(&spec, registration_id, None);
        self.raise_events(events);
        if let Some(persistence) = &self.persistence {
            if !self.server_sync_tree.view_exists(&spec) {
                persistence.set_query_inactive(&spec);
            }
        }
    }

    pub fn keep_synced(&mut self, spec: QuerySpec, enabled: bool) {
        let key = spec.storage_key();
        if enabled {
            if self.keep_synced.contains_key(&key) {
                return;
            }
            let id = self.take_registration_id();
            self.add_event_callback(id, spec.clone(), EventKind::Value, Arc::new(NoopConsumer));
            self.keep_synced.insert(key, (spec, id));
        } else if let Some((spec, id)) = self.keep_synced.remove(&key) {
            self.remove_event_callback(spec, Some(id));
        }
    }

    // -----------------------------------------------------------------
    // One-shot reads
    // -----------------------------------------------------------------

    pub fn get_value(
        &mut self,
        spec: QuerySpec,
        complete: Box<dyn FnOnce(DatabaseResult<Value>) + Send>,
    ) {
        if spec.path.is_info_path() {
            let value = self.info_data.get(&spec.path).value();
            self.event_target.post(move || complete(Ok(value)));
            return;
        }

        let handle = self.repo_handle_for_callbacks();
        let read_spec = spec.clone();
        self.connection.get(
            spec.path.clone(),
            spec.params.to_wire(),
            Box::new(move |result| {
                let _ = handle.post(move |repo| match result {
                    Ok(data) => {
                        let value = data;
                        if let Ok(node) = json_to_node(&value) {
                            if read_spec.is_default() {
                                let events = repo
                                    .server_sync_tree
                                    .apply_server_overwrite(read_spec.path.clone(), node);
                                repo.raise_events(events);
                            }
                        }
                        repo.event_target.post(move || complete(Ok(value)));
                    }
                    // Transport failures fall back to cache; server
                    // rejections (permission denied) surface as-is.
                    Err(err)
                        if matches!(
                            err.code,
                            crate::error::DatabaseErrorCode::Disconnected
                                | crate::error::DatabaseErrorCode::Network
                        ) =>
                    {
                        let fallback = repo.local_read(&read_spec);
                        repo.event_target.post(move || complete(fallback));
                    }
                    Err(err) => {
                        repo.event_target.post(move || complete(Err(err)));
                    }
                });
            }),
        );
    }

    /// Serves a read from whatever complete local data exists.
    fn local_read(&self, spec: &QuerySpec) -> DatabaseResult<Value> {
        if let Some(node) = self.server_sync_tree.get_server_value(spec) {
            return Ok(node.value());
        }
        let cached = self
            .persistence
            .as_ref()
            .and_then(|persistence| persistence.server_cache(spec));
        let complete = match cached {
            Some(node) => node,
            None => {
                let node = self.latest_state(&spec.path, &[]);
                if node.is_empty()
                    && self
                        .server_sync_tree
                        .calc_complete_event_cache(&spec.path, &[])
                        .is_none()
                {
                    return Err(disconnected(
                        "no cached data available while offline",
                    ));
                }
                node
            }
        };
        // Shape the complete node the way the query would.
        let filter = filter_for_params(&spec.params);
        let empty = crate::core::node::IndexedNode::new(Node::empty(), spec.params.index.clone());
        let indexed =
            crate::core::node::IndexedNode::new(complete, spec.params.index.clone());
        let filtered = filter.update_full_node(&empty, &indexed, None);
        Ok(filtered.node().value())
    }

    // -----------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------

    pub fn start_transaction(
        &mut self,
        path: Path,
        updater: TransactionUpdater,
        apply_locally: bool,
        complete: Box<dyn FnOnce(DatabaseResult<TransactionResult>) + Send>,
    ) {
        if path.is_info_path() {
            self.event_target.post(move || {
                complete(Err(invalid_argument(
                    "transactions cannot run on the .info tree",
                )))
            });
            return;
        }

        // Keep the location synced while the transaction is outstanding so
        // reruns see fresh server data.
        let watch_spec = QuerySpec::default_at(path.clone());
        let watch_id = self.take_registration_id();
        self.add_event_callback(
            watch_id,
            watch_spec.clone(),
            EventKind::Value,
            Arc::new(NoopConsumer),
        );
        self.transaction_watches
            .entry(watch_spec.storage_key())
            .or_default()
            .push(watch_id);

        let mut transaction = TransactionData {
            path: path.clone(),
            update: updater,
            on_complete: Some(complete),
            status: TransactionStatus::Run,
            order: self.next_transaction_order,
            apply_locally,
            retry_count: 0,
            abort_reason: None,
            current_write_id: 0,
            current_input_snapshot: Node::empty(),
            current_output_snapshot_raw: Node::empty(),
            current_output_snapshot_resolved: Node::empty(),
        };
        self.next_transaction_order += 1;

        let input = self.latest_state(&path, &[]);
        transaction.current_input_snapshot = input.clone();
        let update = (transaction.update)(input.value());
        match update {
            TransactionUpdate::Abort => {
                let snapshot = input.value();
                if let Some(on_complete) = transaction.on_complete.take() {
                    self.event_target.post(move || {
                        on_complete(Ok(TransactionResult {
                            committed: false,
                            snapshot,
                        }))
                    });
                }
                self.remove_transaction_watch(&path);
            }
            TransactionUpdate::Set(new_value) => {
                let staged = match stage_transaction_value(new_value, &input) {
                    Ok(node) => node,
                    Err(err) => {
                        if let Some(on_complete) = transaction.on_complete.take() {
                            self.event_target.post(move || on_complete(Err(err)));
                        }
                        self.remove_transaction_watch(&path);
                        return;
                    }
                };
                let server_values = self.server_values();
                let resolved =
                    resolve_deferred_value_snapshot(&staged, &input, &server_values);
                let write_id = self.take_write_id();

                transaction.current_write_id = write_id;
                transaction.current_output_snapshot_raw = staged;
                transaction.current_output_snapshot_resolved = resolved.clone();

                if let Some(persistence) = &self.persistence {
                    persistence.save_user_overwrite(
                        &path,
                        &transaction.current_output_snapshot_raw,
                        write_id,
                    );
                }

                self.transactions.push(&path, transaction);
                let events = self.server_sync_tree.apply_user_overwrite(
                    path,
                    resolved,
                    write_id,
                    apply_locally,
                );
                self.raise_events(events);
                self.send_ready_transactions();
            }
        }
    }

    /// Sends every transaction queue whose members are all freshly staged.
    fn send_ready_transactions(&mut self) {
        if !self.connected {
            return;
        }
        for path in self.transactions.queue_roots() {
            let all_run = self
                .transactions
                .build_queue(&path)
                .iter()
                .all(|transaction| transaction.status == TransactionStatus::Run);
            if all_run {
                self.send_transaction_queue(&path);
            }
        }
    }

    fn send_transaction_queue(&mut self, path: &Path) {
        let (write_ids, snap_to_send, hash) = {
            let sets_to_ignore: Vec<u64> = self
                .transactions
                .build_queue(path)
                .iter()
                .map(|transaction| transaction.current_write_id)
                .collect();
            let latest_state = self.latest_state(path, &sets_to_ignore);
            let hash = latest_state.hash();
            let mut snap_to_send = latest_state;
            let mut write_ids = Vec::new();
            for transaction in self.transactions.build_queue(path) {
                transaction.status = TransactionStatus::Sent;
                transaction.retry_count += 1;
                write_ids.push(transaction.current_write_id);
                let relative = path
                    .relative(&transaction.path)
                    .expect("queue members live under the queue path");
                snap_to_send = snap_to_send
                    .update_child(&relative, transaction.current_output_snapshot_raw.clone());
            }
            (write_ids, snap_to_send, hash)
        };

        let Some(first_write_id) = write_ids.first().copied() else {
            return;
        };
        self.pending_puts.insert(
            first_write_id,
            PendingPut::Transaction {
                path: path.clone(),
                write_ids,
            },
        );
        self.connection.put(
            path.clone(),
            snap_to_send.export_value(),
            Some(hash),
            first_write_id,
        );
    }

    fn handle_transaction_response(
        &mut self,
        path: Path,
        write_ids: Vec<u64>,
        result: DatabaseResult<()>,
    ) {
        match result {
            Ok(()) => {
                let mut events = Vec::new();
                let mut callbacks: Vec<Box<dyn FnOnce() + Send>> = Vec::new();
                let committed = self
                    .transactions
                    .drain_matching(&|transaction| {
                        write_ids.contains(&transaction.current_write_id)
                    });
                for mut transaction in committed {
                    if let Some(persistence) = &self.persistence {
                        persistence.remove_user_write(transaction.current_write_id);
                    }
                    events.extend(
                        self.server_sync_tree
                            .ack_user_write(transaction.current_write_id, false),
                    );
                    let snapshot = transaction.current_output_snapshot_resolved.value();
                    if let Some(on_complete) = transaction.on_complete.take() {
                        callbacks.push(Box::new(move || {
                            on_complete(Ok(TransactionResult {
                                committed: true,
                                snapshot,
                            }))
                        }));
                    }
                    self.remove_transaction_watch(&transaction.path);
                }
                self.raise_events(events);
                for callback in callbacks {
                    self.event_target.post(callback);
                }
                self.send_ready_transactions();
            }
            Err(err) => {
                if err.code == crate::error::DatabaseErrorCode::DataStale {
                    self.for_each_transaction_in(&path, |transaction| {
                        if transaction.status == TransactionStatus::SentNeedsAbort {
                            transaction.status = TransactionStatus::NeedsAbort;
                        } else {
                            transaction.status = TransactionStatus::Run;
                        }
                    });
                } else {
                    self.logger
                        .warn(format!("transaction at {path} failed: {err}"));
                    self.for_each_transaction_in(&path, |transaction| {
                        transaction.status = TransactionStatus::NeedsAbort;
                        transaction.abort_reason = Some(err.clone());
                    });
                }
                self.rerun_transactions(&path);
            }
        }
    }

    fn for_each_transaction_in(
        &mut self,
        path: &Path,
        mut f: impl FnMut(&mut TransactionData),
    ) {
        for transaction in self.transactions.build_queue(path) {
            f(transaction);
        }
    }

    /// Re-runs every transaction that serializes with `changed_path` against
    /// the freshest local data.
    fn rerun_transactions(&mut self, changed_path: &Path) {
        let root_path = self.transactions.ancestor_transaction_path(changed_path);
        let orders: Vec<u64> = self
            .transactions
            .build_queue(&root_path)
            .iter()
            .map(|transaction| transaction.order)
            .collect();
        if orders.is_empty() {
            return;
        }

        let mut sets_to_ignore: Vec<u64> = self
            .transactions
            .build_queue(&root_path)
            .iter()
            .filter(|transaction| transaction.status == TransactionStatus::Run)
            .map(|transaction| transaction.current_write_id)
            .collect();

        let mut events = Vec::new();
        let mut callbacks: Vec<Box<dyn FnOnce() + Send>> = Vec::new();
        let mut completed_orders = Vec::new();

        for order in orders {
            enum Outcome {
                Keep,
                Abort(Option<DatabaseError>, Value),
            }
            let server_values = self.server_values();

            // Split borrows: the transaction tree and the sync tree are
            // distinct fields.
            let latest = |tree: &SyncTree, path: &Path, ignore: &[u64]| {
                tree.calc_complete_event_cache(path, ignore)
                    .unwrap_or_else(Node::empty)
            };

            let mut outcome = Outcome::Keep;
            let mut staged: Option<(Path, Node, u64, u64, bool)> = None;
            {
                let Repo {
                    transactions,
                    server_sync_tree,
                    next_write_id,
                    ..
                } = self;
                let Some(transaction) = transactions
                    .build_queue(&root_path)
                    .into_iter()
                    .find(|transaction| transaction.order == order)
                else {
                    continue;
                };

                match transaction.status {
                    TransactionStatus::NeedsAbort => {
                        outcome = Outcome::Abort(
                            Some(transaction.abort_reason.clone().unwrap_or_else(|| {
                                write_canceled("transaction aborted")
                            })),
                            transaction.current_input_snapshot.value(),
                        );
                        events.extend(
                            server_sync_tree.ack_user_write(transaction.current_write_id, true),
                        );
                    }
                    TransactionStatus::Run => {
                        if transaction.retry_count >= MAX_TRANSACTION_RETRIES {
                            outcome = Outcome::Abort(
                                Some(crate::error::max_retries(
                                    "transaction exceeded its retry limit",
                                )),
                                transaction.current_input_snapshot.value(),
                            );
                            events.extend(
                                server_sync_tree
                                    .ack_user_write(transaction.current_write_id, true),
                            );
                        } else {
                            let current =
                                latest(server_sync_tree, &transaction.path, &sets_to_ignore);
                            transaction.current_input_snapshot = current.clone();
                            match (transaction.update)(current.value()) {
                                TransactionUpdate::Abort => {
                                    outcome = Outcome::Abort(None, current.value());
                                    events.extend(server_sync_tree.ack_user_write(
                                        transaction.current_write_id,
                                        true,
                                    ));
                                }
                                TransactionUpdate::Set(new_value) => {
                                    match stage_transaction_value(new_value, &current) {
                                        Err(err) => {
                                            outcome = Outcome::Abort(
                                                Some(err),
                                                current.value(),
                                            );
                                            events.extend(server_sync_tree.ack_user_write(
                                                transaction.current_write_id,
                                                true,
                                            ));
                                        }
                                        Ok(staged_node) => {
                                            let old_write_id = transaction.current_write_id;
                                            let resolved = resolve_deferred_value_snapshot(
                                                &staged_node,
                                                &current,
                                                &server_values,
                                            );
                                            let write_id = *next_write_id;
                                            *next_write_id += 1;

                                            transaction.current_write_id = write_id;
                                            transaction.current_output_snapshot_raw =
                                                staged_node;
                                            transaction.current_output_snapshot_resolved =
                                                resolved.clone();
                                            sets_to_ignore
                                                .retain(|id| *id != old_write_id);
                                            sets_to_ignore.push(write_id);

                                            staged = Some((
                                                transaction.path.clone(),
                                                resolved,
                                                write_id,
                                                old_write_id,
                                                transaction.apply_locally,
                                            ));
                                        }
                                    }
                                }
                            }
                        }
                    }
                    TransactionStatus::Sent | TransactionStatus::SentNeedsAbort => {
                        // Awaiting the server's verdict; leave untouched.
                    }
                    TransactionStatus::Completed => {
                        // Terminal; awaiting removal from the queue.
                    }
                }
            }

            if let Some((txn_path, resolved, write_id, old_write_id, apply_locally)) = staged {
                let mut new_events = self.server_sync_tree.apply_user_overwrite(
                    txn_path,
                    resolved,
                    write_id,
                    apply_locally,
                );
                new_events.extend(self.server_sync_tree.ack_user_write(old_write_id, true));
                events.append(&mut new_events);
            }

            if let Outcome::Abort(error, snapshot) = outcome {
                completed_orders.push(order);
                let persistence = self.persistence.clone();
                let mut watch_path = None;
                if let Some(transaction) = self
                    .transactions
                    .build_queue(&root_path)
                    .into_iter()
                    .find(|transaction| transaction.order == order)
                {
                    if let Some(persistence) = &persistence {
                        persistence.remove_user_write(transaction.current_write_id);
                    }
                    watch_path = Some(transaction.path.clone());
                    if let Some(on_complete) = transaction.on_complete.take() {
                        let result = match error {
                            None => Ok(TransactionResult {
                                committed: false,
                                snapshot,
                            }),
                            Some(error) => Err(error),
                        };
                        callbacks.push(Box::new(move || on_complete(result)));
                    }
                }
                if let Some(watch_path) = watch_path {
                    self.remove_transaction_watch(&watch_path);
                }
            }
        }

        self.transactions
            .drain_matching(&|transaction| completed_orders.contains(&transaction.order));

        self.raise_events(events);
        for callback in callbacks {
            self.event_target.post(callback);
        }
        self.send_ready_transactions();
    }

    /// Aborts transactions that conflict with an overriding operation at
    /// `path`; sent ones are flagged and resolve when the server responds.
    fn abort_transactions(&mut self, path: &Path, error: DatabaseError) -> Path {
        let affected = self.transactions.ancestor_transaction_path(path);
        let mut events = Vec::new();
        let mut callbacks: Vec<Box<dyn FnOnce() + Send>> = Vec::new();
        let mut watches = Vec::new();

        {
            let Repo {
                transactions,
                server_sync_tree,
                persistence,
                ..
            } = self;
            transactions.for_each_related(path, &mut |_, queue| {
                for transaction in queue.iter_mut() {
                    match transaction.status {
                        TransactionStatus::SentNeedsAbort => {}
                        TransactionStatus::Sent => {
                            transaction.status = TransactionStatus::SentNeedsAbort;
                            transaction.abort_reason = Some(error.clone());
                        }
                        TransactionStatus::Run | TransactionStatus::NeedsAbort => {
                            events.extend(
                                server_sync_tree
                                    .ack_user_write(transaction.current_write_id, true),
                            );
                            if let Some(persistence) = persistence {
                                persistence.remove_user_write(transaction.current_write_id);
                            }
                            transaction.status = TransactionStatus::Completed;
                            watches.push(transaction.path.clone());
                            if let Some(on_complete) = transaction.on_complete.take() {
                                let error = error.clone();
                                callbacks.push(Box::new(move || on_complete(Err(error))));
                            }
                        }
                        TransactionStatus::Completed => {}
                    }
                }
            });
        }
        self.transactions
            .drain_matching(&|transaction| transaction.status == TransactionStatus::Completed);

        self.raise_events(events);
        for callback in callbacks {
            self.event_target.post(callback);
        }
        for watch_path in watches {
            self.remove_transaction_watch(&watch_path);
        }
        affected
    }

    /// Drops one transaction watch at `path`. Watches are removed by their
    /// registration id so user listeners at the same spec are untouched.
    fn remove_transaction_watch(&mut self, path: &Path) {
        let spec = QuerySpec::default_at(path.clone());
        let watch_id = self
            .transaction_watches
            .get_mut(&spec.storage_key())
            .and_then(Vec::pop);
        if let Some(watch_id) = watch_id {
            self.remove_event_callback(spec, Some(watch_id));
        }
    }

    // -----------------------------------------------------------------
    // Connection events
    // -----------------------------------------------------------------

    fn handle_connect(&mut self) {
        self.connected = true;
        self.update_info("connected", Node::leaf(LeafValue::Boolean(true)));
        self.send_ready_transactions();
    }

    fn handle_disconnect(&mut self) {
        self.connected = false;
        self.update_info("connected", Node::leaf(LeafValue::Boolean(false)));
        self.run_on_disconnect_events();
    }

    fn run_on_disconnect_events(&mut self) {
        if self.on_disconnect_staging.is_empty() {
            return;
        }
        let server_values = self.server_values();
        let staging = std::mem::take(&mut self.on_disconnect_staging);
        let snapshots = {
            let tree = &self.server_sync_tree;
            resolve_deferred_value_tree(
                &staging,
                |path| {
                    tree.calc_complete_event_cache(path, &[])
                        .unwrap_or_else(Node::empty)
                },
                &server_values,
            )
        };

        let mut updates: Vec<(Path, Node)> = Vec::new();
        snapshots.for_each(&Path::root(), &mut |path, node| {
            updates.push((path.clone(), node.clone()));
        });

        let mut events = Vec::new();
        for (path, node) in updates {
            events.extend(self.server_sync_tree.apply_server_overwrite(path.clone(), node));
            let affected = self.abort_transactions(
                &path,
                overridden_by_set("transaction overridden by onDisconnect write"),
            );
            self.rerun_transactions(&affected);
        }
        self.raise_events(events);
    }

    fn handle_data_update(
        &mut self,
        path: Path,
        data: Value,
        is_merge: bool,
        tag: Option<crate::core::operation::Tag>,
    ) {
        let events = if is_merge {
            let Some(children) = decode_merge_children(&data) else {
                self.logger
                    .warn(format!("dropping malformed merge at {path}"));
                return;
            };
            if children.is_empty() {
                return;
            }
            if let Some(persistence) = &self.persistence {
                if tag.is_none() {
                    if let Ok(node) = json_to_node(&data) {
                        persistence.on_server_update(&path, &node, true);
                    }
                }
            }
            match tag {
                Some(tag) => self
                    .server_sync_tree
                    .apply_tagged_query_merge(path.clone(), &children, tag),
                None => self
                    .server_sync_tree
                    .apply_server_merge(path.clone(), &children),
            }
        } else {
            let node = match json_to_node(&data) {
                Ok(node) => node,
                Err(err) => {
                    self.logger
                        .warn(format!("dropping malformed update at {path}: {err}"));
                    return;
                }
            };
            if let Some(persistence) = &self.persistence {
                if tag.is_none() {
                    persistence.on_server_update(&path, &node, false);
                    // A full overwrite at the listen path makes the default
                    // query's cache complete.
                    persistence.set_query_complete(&QuerySpec::default_at(path.clone()));
                }
            }
            match tag {
                Some(tag) => self
                    .server_sync_tree
                    .apply_tagged_query_overwrite(path.clone(), node, tag),
                None => self
                    .server_sync_tree
                    .apply_server_overwrite(path.clone(), node),
            }
        };
        self.raise_events(events);
        self.rerun_transactions(&path);
    }

    fn handle_range_merge(
        &mut self,
        path: Path,
        merges: Vec<RangeMerge>,
        tag: Option<crate::core::operation::Tag>,
    ) {
        let Some(existing) = self.server_sync_tree.server_cache_at(&path) else {
            // Range merges refine data we never loaded; ignore.
            return;
        };
        let mut merged = existing;
        for merge in &merges {
            merged = apply_range_merge(&merged, merge);
        }
        let events = match tag {
            Some(tag) => self
                .server_sync_tree
                .apply_tagged_query_overwrite(path.clone(), merged, tag),
            None => self.server_sync_tree.apply_server_overwrite(path.clone(), merged),
        };
        self.raise_events(events);
        self.rerun_transactions(&path);
    }

    fn handle_listen_revoked(
        &mut self,
        path: Path,
        params: Option<Value>,
        error: DatabaseError,
    ) {
        let spec = match params {
            None => QuerySpec::default_at(path),
            Some(raw) => match crate::core::query::QueryParams::from_wire(&raw) {
                Ok(parsed) => QuerySpec::new(path, parsed),
                Err(_) => QuerySpec::default_at(path),
            },
        };
        self.keep_synced.remove(&spec.storage_key());
        let events = self
            .server_sync_tree
            .remove_event_registration(&spec, None, Some(error));
        self.raise_events(events);
    }

    fn handle_server_info_update(&mut self, server_time_offset_millis: i64) {
        self.server_time_offset = server_time_offset_millis;
        self.update_info(
            "serverTimeOffset",
            Node::leaf(LeafValue::number(server_time_offset_millis as f64)),
        );
    }

    fn handle_auth_status(&mut self, authenticated: bool) {
        self.update_info("authenticated", Node::leaf(LeafValue::Boolean(authenticated)));
    }

    fn handle_connection_shutdown(&mut self, reason: String) {
        self.connected = false;
        self.update_info("connected", Node::leaf(LeafValue::Boolean(false)));
        self.logger
            .error(format!("realtime connection permanently closed: {reason}"));

        let error = unavailable(format!("connection closed by server: {reason}"));
        let pending = std::mem::take(&mut self.pending_puts);
        for (write_id, put) in pending {
            match put {
                PendingPut::Write { complete, .. } => {
                    let events = self.server_sync_tree.ack_user_write(write_id, true);
                    self.raise_events(events);
                    if let Some(complete) = complete {
                        self.post_completion(complete, Err(error.clone()));
                    }
                }
                PendingPut::Transaction { path, .. } => {
                    let abort_error = error.clone();
                    self.for_each_transaction_in(&path, move |transaction| {
                        transaction.status = TransactionStatus::NeedsAbort;
                        transaction.abort_reason = Some(abort_error.clone());
                    });
                    self.rerun_transactions(&path);
                }
            }
        }
    }

    fn update_info(&mut self, key: &str, node: Node) {
        let path = Path::from_trusted(&format!(".info/{key}"));
        self.info_data.update(&path, node.clone());
        let events = self.info_sync_tree.apply_server_overwrite(path, node);
        self.raise_events(events);
    }

    // -----------------------------------------------------------------
    // Controls
    // -----------------------------------------------------------------

    pub fn purge_outstanding_writes(&mut self) {
        self.logger.debug("purging outstanding writes");
        let events = self.server_sync_tree.remove_all_writes();
        self.raise_events(events);

        self.abort_transactions(&Path::root(), write_canceled("write canceled by purge"));
        self.connection.purge_outstanding_writes();

        let pending = std::mem::take(&mut self.pending_puts);
        for (_, put) in pending {
            if let PendingPut::Write {
                complete: Some(complete),
                ..
            } = put
            {
                self.post_completion(complete, Err(write_canceled("write canceled by purge")));
            }
        }
        if let Some(persistence) = &self.persistence {
            persistence.remove_all_user_writes();
        }
    }

    pub fn interrupt(&mut self) {
        self.connection.interrupt();
    }

    pub fn resume(&mut self) {
        self.connection.resume();
    }

    pub fn shutdown(&mut self) {
        self.logger.debug("shutting down the sync engine");
        self.connection.shutdown();
        self.shutting_down = true;
    }
}

/// Consumer that swallows everything; backs keepSynced and transaction
/// watches.
struct NoopConsumer;

impl EventConsumer for NoopConsumer {
    fn fire_event(&self, _payload: &DataEventPayload) {}
    fn fire_cancel(&self, _path: &Path, _error: &DatabaseError) {}
}

fn build_node(value: Value, priority: Option<Value>) -> DatabaseResult<Node> {
    let node = json_to_node(&value)?;
    match priority {
        None => Ok(node),
        Some(priority) => Ok(node.with_priority(Priority::from_json(&priority)?)),
    }
}

/// A transaction result keeps the current priority unless it sets one.
fn stage_transaction_value(new_value: Value, current: &Node) -> DatabaseResult<Node> {
    let has_explicit_priority = new_value
        .as_object()
        .map(|map| map.contains_key(".priority"))
        .unwrap_or(false);
    let node = json_to_node(&new_value)?;
    if has_explicit_priority {
        Ok(node)
    } else {
        Ok(node.with_priority(current.priority().clone()))
    }
}

fn decode_merge_children(data: &Value) -> Option<Vec<(Path, Node)>> {
    let map = data.as_object()?;
    let mut children = Vec::new();
    for (raw_path, value) in map {
        let child_path = Path::from_trusted(raw_path);
        let node = json_to_node(value).ok()?;
        children.push((child_path, node));
    }
    Some(children)
}

/// Replaces the keyed window `(start, end]` of `node` with the merge data.
fn apply_range_merge(node: &Node, merge: &RangeMerge) -> Node {
    let start = merge.start.as_deref().map(ChildKey::from_trusted);
    let end = merge.end.as_deref().map(ChildKey::from_trusted);
    let in_range = |key: &ChildKey| -> bool {
        let after_start = start
            .as_ref()
            .map(|bound| crate::core::path::key_compare(key, bound) == std::cmp::Ordering::Greater)
            .unwrap_or(true);
        let before_end = end
            .as_ref()
            .map(|bound| crate::core::path::key_compare(key, bound) != std::cmp::Ordering::Greater)
            .unwrap_or(true);
        after_start && before_end
    };

    let mut result = node.clone();
    let stale: Vec<ChildKey> = node
        .children()
        .filter(|(key, _)| in_range(key))
        .map(|(key, _)| key.clone())
        .collect();
    for key in stale {
        result = result.update_immediate_child(&key, Node::empty());
    }
    if let Ok(updates) = json_to_node(&merge.data) {
        for (key, child) in updates.children() {
            result = result.update_immediate_child(key, child.clone());
        }
    }
    result
}
