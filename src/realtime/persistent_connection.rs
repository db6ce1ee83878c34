//! The long-lived, self-healing realtime channel.
//!
//! Owns the single socket, the request-id space, and the outstanding
//! listen/put/onDisconnect queues. Runs as its own task: the engine talks to
//! it through a command handle, and it reports back through the delegate,
//! which posts onto the engine's run loop.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use crate::auth::TokenProvider;
use crate::core::operation::Tag;
use crate::core::path::Path;
use crate::core::query::QuerySpec;
use crate::error::{disconnected, DatabaseError, DatabaseResult};
use crate::logger::Logger;
use crate::realtime::connection::{Connection, ConnectionEvent};
use crate::realtime::host_info::{resolve_canonical_host, HostInfo};
use crate::realtime::protocol as proto;
use crate::realtime::retry::{RetryConfig, RetryHelper};
use crate::runtime::spawn_detached;
use std::sync::Arc;

/// Consecutive invalid-token failures tolerated before the connection stops
/// retrying and waits for new credentials.
const INVALID_TOKEN_THRESHOLD: u32 = 3;

#[derive(Clone, Debug)]
pub struct ConnectionTunables {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub idle_interval: Duration,
    pub retry: RetryConfig,
}

impl Default for ConnectionTunables {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            idle_interval: Duration::from_secs(60),
            retry: RetryConfig::default(),
        }
    }
}

pub type StatusCallback = Box<dyn FnOnce(DatabaseResult<()>) + Send>;
pub type GetCallback = Box<dyn FnOnce(DatabaseResult<Value>) + Send>;

#[derive(Clone, Debug)]
pub struct RangeMerge {
    pub start: Option<String>,
    pub end: Option<String>,
    pub data: Value,
}

/// How the connection reports back into the engine. Implementations post
/// onto the run loop; none of these calls may block.
pub trait ConnectionDelegate: Send + Sync + 'static {
    fn on_connect(&self);
    fn on_disconnect(&self);
    fn on_data_update(&self, path: Path, data: Value, is_merge: bool, tag: Option<Tag>);
    fn on_range_merge(&self, path: Path, merges: Vec<RangeMerge>, tag: Option<Tag>);
    fn on_listen_revoked(&self, path: Path, params: Option<Value>, error: DatabaseError);
    fn on_write_response(&self, write_id: u64, result: DatabaseResult<()>);
    fn on_server_info_update(&self, server_time_offset_millis: i64);
    fn on_auth_status(&self, authenticated: bool);
    /// The server killed the session (or credentials failed terminally); no
    /// automatic reconnect will happen.
    fn on_connection_shutdown(&self, reason: String);
}

enum Request {
    Listen {
        spec: QuerySpec,
        tag: Option<Tag>,
        hash: String,
    },
    Unlisten {
        spec: QuerySpec,
    },
    Put {
        path: Path,
        data: Value,
        hash: Option<String>,
        write_id: u64,
    },
    Merge {
        path: Path,
        data: Value,
        write_id: u64,
    },
    OnDisconnectPut {
        path: Path,
        data: Value,
        complete: StatusCallback,
    },
    OnDisconnectMerge {
        path: Path,
        data: Value,
        complete: StatusCallback,
    },
    OnDisconnectCancel {
        path: Path,
        complete: StatusCallback,
    },
    Get {
        path: Path,
        params: Value,
        complete: GetCallback,
    },
    RefreshToken,
    PurgeOutstandingWrites,
    Interrupt,
    Resume,
    Shutdown,
}

#[derive(Clone)]
pub struct PersistentConnectionHandle {
    sender: mpsc::UnboundedSender<Request>,
}

impl PersistentConnectionHandle {
    fn send(&self, request: Request) {
        let _ = self.sender.send(request);
    }

    pub fn listen(&self, spec: QuerySpec, tag: Option<Tag>, hash: String) {
        self.send(Request::Listen { spec, tag, hash });
    }

    pub fn unlisten(&self, spec: QuerySpec) {
        self.send(Request::Unlisten { spec });
    }

    pub fn put(&self, path: Path, data: Value, hash: Option<String>, write_id: u64) {
        self.send(Request::Put {
            path,
            data,
            hash,
            write_id,
        });
    }

    pub fn merge(&self, path: Path, data: Value, write_id: u64) {
        self.send(Request::Merge {
            path,
            data,
            write_id,
        });
    }

    pub fn on_disconnect_put(&self, path: Path, data: Value, complete: StatusCallback) {
        self.send(Request::OnDisconnectPut {
            path,
            data,
            complete,
        });
    }

    pub fn on_disconnect_merge(&self, path: Path, data: Value, complete: StatusCallback) {
        self.send(Request::OnDisconnectMerge {
            path,
            data,
            complete,
        });
    }

    pub fn on_disconnect_cancel(&self, path: Path, complete: StatusCallback) {
        self.send(Request::OnDisconnectCancel { path, complete });
    }

    pub fn get(&self, path: Path, params: Value, complete: GetCallback) {
        self.send(Request::Get {
            path,
            params,
            complete,
        });
    }

    pub fn refresh_token(&self) {
        self.send(Request::RefreshToken);
    }

    pub fn purge_outstanding_writes(&self) {
        self.send(Request::PurgeOutstandingWrites);
    }

    pub fn interrupt(&self) {
        self.send(Request::Interrupt);
    }

    pub fn resume(&self) {
        self.send(Request::Resume);
    }

    pub fn shutdown(&self) {
        self.send(Request::Shutdown);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConnState {
    Disconnected,
    GatheringHost,
    Connecting,
    Authenticating,
    Connected,
}

struct OutstandingListen {
    spec: QuerySpec,
    tag: Option<Tag>,
    hash: String,
    sent: bool,
}

struct OutstandingPut {
    put_id: u64,
    action: &'static str,
    body: Value,
    write_id: u64,
    sent: bool,
}

struct OutstandingOnDisconnect {
    od_id: u64,
    action: &'static str,
    body: Value,
    complete: Option<StatusCallback>,
    sent: bool,
}

enum PendingKind {
    Listen { spec: QuerySpec },
    Unlisten,
    Put { put_id: u64 },
    OnDisconnect { od_id: u64 },
    Get { complete: GetCallback },
    Auth,
    Stats,
}

struct PendingRequest {
    kind: PendingKind,
    deadline: Instant,
}

pub struct PersistentConnection {
    delegate: Arc<dyn ConnectionDelegate>,
    token_provider: Arc<dyn TokenProvider>,
    host_info: HostInfo,
    tunables: ConnectionTunables,
    logger: Logger,
    http: reqwest::Client,

    state: ConnState,
    connection: Option<Connection>,
    cached_host: Option<String>,
    last_session_id: Option<String>,
    connected_at: Option<Instant>,
    last_activity: Instant,

    retry: RetryHelper,
    reconnect_deadline: Option<Instant>,
    interrupted: bool,
    killed: bool,

    force_token_refresh: bool,
    invalid_token_count: u32,

    next_request_id: u64,
    next_put_id: u64,
    next_od_id: u64,
    listens: Vec<OutstandingListen>,
    puts: Vec<OutstandingPut>,
    on_disconnects: Vec<OutstandingOnDisconnect>,
    /// One-shot reads waiting for a socket; they count as interest so the
    /// connection opens for them.
    pending_gets: Vec<(Path, Value, GetCallback)>,
    pending: HashMap<u64, PendingRequest>,
    stats_sent: bool,
}

impl PersistentConnection {
    pub fn spawn(
        host_info: HostInfo,
        delegate: Arc<dyn ConnectionDelegate>,
        token_provider: Arc<dyn TokenProvider>,
        tunables: ConnectionTunables,
        logger: Logger,
    ) -> PersistentConnectionHandle {
        let (sender, receiver) = mpsc::unbounded_channel();
        let retry = RetryHelper::new(tunables.retry);
        let connection = PersistentConnection {
            delegate,
            token_provider,
            host_info,
            tunables,
            logger,
            http: reqwest::Client::new(),
            state: ConnState::Disconnected,
            connection: None,
            cached_host: None,
            last_session_id: None,
            connected_at: None,
            last_activity: Instant::now(),
            retry,
            reconnect_deadline: None,
            interrupted: false,
            killed: false,
            force_token_refresh: false,
            invalid_token_count: 0,
            next_request_id: 0,
            next_put_id: 0,
            next_od_id: 0,
            listens: Vec::new(),
            puts: Vec::new(),
            on_disconnects: Vec::new(),
            pending_gets: Vec::new(),
            pending: HashMap::new(),
            stats_sent: false,
        };
        spawn_detached(connection.run(receiver));
        PersistentConnectionHandle { sender }
    }

    async fn run(mut self, mut requests: mpsc::UnboundedReceiver<Request>) {
        enum LoopEvent {
            Request(Option<Request>),
            Conn(ConnectionEvent),
            Tick,
        }

        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let event = if let Some(connection) = self.connection.as_mut() {
                tokio::select! {
                    request = requests.recv() => LoopEvent::Request(request),
                    event = connection.next_event() => LoopEvent::Conn(event),
                    _ = tick.tick() => LoopEvent::Tick,
                }
            } else {
                tokio::select! {
                    request = requests.recv() => LoopEvent::Request(request),
                    _ = tick.tick() => LoopEvent::Tick,
                }
            };

            match event {
                LoopEvent::Request(None) => {
                    self.close_connection(false);
                    return;
                }
                LoopEvent::Request(Some(request)) => {
                    if self.handle_request(request) {
                        self.close_connection(false);
                        return;
                    }
                }
                LoopEvent::Conn(event) => self.handle_connection_event(event),
                LoopEvent::Tick => self.handle_tick(),
            }

            if self.should_connect()
                && self
                    .reconnect_deadline
                    .map(|deadline| Instant::now() >= deadline)
                    .unwrap_or(true)
            {
                self.establish_connection().await;
            }
        }
    }

    fn should_connect(&self) -> bool {
        self.connection.is_none() && !self.interrupted && !self.killed && self.has_interest()
    }

    fn has_interest(&self) -> bool {
        !self.listens.is_empty()
            || !self.puts.is_empty()
            || !self.on_disconnects.is_empty()
            || !self.pending_gets.is_empty()
    }

    /// Requests may flow as soon as the socket is up: anything sent behind
    /// the auth frame is evaluated by the server with the new credentials.
    fn is_connected(&self) -> bool {
        matches!(
            self.state,
            ConnState::Authenticating | ConnState::Connected
        ) && self.connection.is_some()
    }

    // -----------------------------------------------------------------
    // Commands from the engine
    // -----------------------------------------------------------------

    /// Returns true when the task should shut down.
    fn handle_request(&mut self, request: Request) -> bool {
        self.last_activity = Instant::now();
        match request {
            Request::Listen { spec, tag, hash } => {
                self.listens
                    .retain(|listen| listen.spec != spec);
                self.listens.push(OutstandingListen {
                    spec,
                    tag,
                    hash,
                    sent: false,
                });
                if self.is_connected() {
                    let index = self.listens.len() - 1;
                    self.send_listen(index);
                }
            }
            Request::Unlisten { spec } => {
                let existed = self
                    .listens
                    .iter()
                    .any(|listen| listen.spec == spec);
                self.listens.retain(|listen| listen.spec != spec);
                if existed && self.is_connected() {
                    self.send_unlisten(&spec);
                }
            }
            Request::Put {
                path,
                data,
                hash,
                write_id,
            } => {
                let mut body = Map::new();
                body.insert("p".to_string(), Value::String(path.to_wire()));
                body.insert("d".to_string(), data);
                if let Some(hash) = hash {
                    body.insert("h".to_string(), Value::String(hash));
                }
                self.queue_put(proto::ACTION_PUT, Value::Object(body), write_id);
            }
            Request::Merge {
                path,
                data,
                write_id,
            } => {
                let body = json!({ "p": path.to_wire(), "d": data });
                self.queue_put(proto::ACTION_MERGE, body, write_id);
            }
            Request::OnDisconnectPut {
                path,
                data,
                complete,
            } => {
                let body = json!({ "p": path.to_wire(), "d": data });
                self.queue_on_disconnect(proto::ACTION_ON_DISCONNECT_PUT, body, complete);
            }
            Request::OnDisconnectMerge {
                path,
                data,
                complete,
            } => {
                let body = json!({ "p": path.to_wire(), "d": data });
                self.queue_on_disconnect(proto::ACTION_ON_DISCONNECT_MERGE, body, complete);
            }
            Request::OnDisconnectCancel { path, complete } => {
                let body = json!({ "p": path.to_wire() });
                self.queue_on_disconnect(proto::ACTION_ON_DISCONNECT_CANCEL, body, complete);
            }
            Request::Get {
                path,
                params,
                complete,
            } => {
                if self.is_connected() {
                    let body = json!({ "p": path.to_wire(), "q": params });
                    self.send_tracked(
                        proto::ACTION_GET,
                        body,
                        PendingKind::Get { complete },
                    );
                } else if self.interrupted || self.killed {
                    complete(Err(disconnected("not connected; served from cache")));
                } else {
                    // Queue it; the read is interest, so a connection opens.
                    self.pending_gets.push((path, params, complete));
                }
            }
            Request::RefreshToken => {
                self.force_token_refresh = true;
                if self.connection.is_some() {
                    self.close_connection(true);
                }
            }
            Request::PurgeOutstandingWrites => {
                self.puts.clear();
                self.on_disconnects.clear();
                self.pending.retain(|_, pending| {
                    !matches!(
                        pending.kind,
                        PendingKind::Put { .. } | PendingKind::OnDisconnect { .. }
                    )
                });
            }
            Request::Interrupt => {
                self.interrupted = true;
                self.reconnect_deadline = None;
                for (_, _, complete) in self.pending_gets.drain(..) {
                    complete(Err(disconnected("connection interrupted")));
                }
                if self.connection.is_some() {
                    self.close_connection(false);
                }
            }
            Request::Resume => {
                self.interrupted = false;
                self.retry.reset();
                self.reconnect_deadline = None;
            }
            Request::Shutdown => return true,
        }
        false
    }

    fn queue_put(&mut self, action: &'static str, body: Value, write_id: u64) {
        let put_id = self.next_put_id;
        self.next_put_id += 1;
        self.puts.push(OutstandingPut {
            put_id,
            action,
            body,
            write_id,
            sent: false,
        });
        if self.is_connected() {
            let index = self.puts.len() - 1;
            self.send_put(index);
        }
    }

    fn queue_on_disconnect(
        &mut self,
        action: &'static str,
        body: Value,
        complete: StatusCallback,
    ) {
        let od_id = self.next_od_id;
        self.next_od_id += 1;
        self.on_disconnects.push(OutstandingOnDisconnect {
            od_id,
            action,
            body,
            complete: Some(complete),
            sent: false,
        });
        if self.is_connected() {
            let index = self.on_disconnects.len() - 1;
            self.send_on_disconnect(index);
        }
    }

    // -----------------------------------------------------------------
    // Socket events
    // -----------------------------------------------------------------

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        self.last_activity = Instant::now();
        match event {
            ConnectionEvent::Handshake(_) => {
                // Handshakes are consumed inside Connection::open.
            }
            ConnectionEvent::DataResponse { request_id, body } => {
                self.handle_response(request_id, body);
            }
            ConnectionEvent::DataPush { action, body } => {
                self.handle_push(&action, body);
            }
            ConnectionEvent::Reset { host } => {
                self.logger
                    .debug("reset frame received; reconnecting to new host");
                if let Some(host) = host {
                    self.cached_host = Some(host);
                }
                self.close_connection(true);
            }
            ConnectionEvent::Shutdown { reason } => {
                self.logger
                    .warn(format!("connection permanently closed by server: {reason}"));
                self.killed = true;
                self.close_connection(false);
                self.delegate.on_connection_shutdown(reason);
            }
            ConnectionEvent::Closed => {
                self.logger.debug("socket closed");
                self.close_connection(false);
            }
        }
    }

    fn handle_response(&mut self, request_id: u64, body: Value) {
        let Some(pending) = self.pending.remove(&request_id) else {
            self.logger
                .debug(format!("response for unknown request {request_id}"));
            return;
        };
        let status = body
            .get("s")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let ok = status == proto::STATUS_OK;
        let data = body.get("d").cloned().unwrap_or(Value::Null);

        match pending.kind {
            PendingKind::Listen { spec } => {
                if ok {
                    if let Some(warnings) = data.get("w").and_then(Value::as_array) {
                        if !warnings.is_empty() {
                            self.logger.warn(format!(
                                "listen at {} generated warnings: {warnings:?}",
                                spec.path
                            ));
                        }
                    }
                } else {
                    self.listens.retain(|listen| listen.spec != spec);
                    let error =
                        DatabaseError::from_wire_status(&status, &format!("listen at {}", spec.path));
                    let params = (!spec.is_default()).then(|| spec.params.to_wire());
                    self.delegate
                        .on_listen_revoked(spec.path, params, error);
                }
            }
            PendingKind::Unlisten => {
                if !ok {
                    self.logger.debug(format!("unlisten failed: {status}"));
                }
            }
            PendingKind::Put { put_id } => {
                if let Some(index) = self.puts.iter().position(|put| put.put_id == put_id) {
                    let put = self.puts.remove(index);
                    let result = if ok {
                        Ok(())
                    } else {
                        Err(DatabaseError::from_wire_status(&status, "write rejected"))
                    };
                    self.delegate.on_write_response(put.write_id, result);
                }
            }
            PendingKind::OnDisconnect { od_id } => {
                if let Some(index) = self
                    .on_disconnects
                    .iter()
                    .position(|od| od.od_id == od_id)
                {
                    let mut od = self.on_disconnects.remove(index);
                    if let Some(complete) = od.complete.take() {
                        let result = if ok {
                            Ok(())
                        } else {
                            Err(DatabaseError::from_wire_status(
                                &status,
                                "onDisconnect rejected",
                            ))
                        };
                        complete(result);
                    }
                }
            }
            PendingKind::Get { complete } => {
                if ok {
                    complete(Ok(data));
                } else {
                    complete(Err(DatabaseError::from_wire_status(&status, "get failed")));
                }
            }
            PendingKind::Auth => {
                if ok {
                    self.invalid_token_count = 0;
                    self.state = ConnState::Connected;
                    self.delegate.on_auth_status(true);
                    // Anything queued while authenticating goes out now.
                    self.restore_state();
                } else {
                    self.handle_auth_failure(&status);
                }
            }
            PendingKind::Stats => {
                if !ok {
                    self.logger.debug(format!("stats report rejected: {status}"));
                }
            }
        }
    }

    fn handle_auth_failure(&mut self, status: &str) {
        self.force_token_refresh = true;
        self.delegate.on_auth_status(false);
        let code = crate::error::DatabaseErrorCode::from_wire_status(status);
        if code.is_retriable_auth_failure() {
            self.logger
                .debug(format!("auth failed ({status}); reconnecting with fresh token"));
            self.close_connection(false);
            return;
        }
        self.invalid_token_count += 1;
        if self.invalid_token_count >= INVALID_TOKEN_THRESHOLD {
            self.logger.error(format!(
                "auth failed {} times with invalid credentials; halting reconnects",
                self.invalid_token_count
            ));
            self.killed = true;
            self.close_connection(false);
            self.delegate
                .on_connection_shutdown(format!("credentials rejected: {status}"));
        } else {
            self.logger.warn(format!("auth failed ({status}); retrying"));
            self.close_connection(false);
        }
    }

    fn handle_push(&mut self, action: &str, body: Value) {
        let path = body
            .get("p")
            .and_then(Value::as_str)
            .map(Path::from_trusted)
            .unwrap_or_default();
        let tag = body.get("t").and_then(Value::as_u64).map(Tag);

        match action {
            proto::PUSH_DATA_UPDATE | proto::PUSH_DATA_MERGE => {
                let data = body.get("d").cloned().unwrap_or(Value::Null);
                let is_merge = action == proto::PUSH_DATA_MERGE;
                self.delegate.on_data_update(path, data, is_merge, tag);
            }
            proto::PUSH_RANGE_MERGE => {
                let merges = Self::parse_range_merges(&body);
                if !merges.is_empty() {
                    self.delegate.on_range_merge(path, merges, tag);
                }
            }
            proto::PUSH_LISTEN_REVOKED => {
                let params = body.get("q").cloned();
                self.listens.retain(|listen| listen.spec.path != path);
                self.delegate.on_listen_revoked(
                    path.clone(),
                    params,
                    DatabaseError::from_wire_status(
                        proto::STATUS_PERMISSION_DENIED,
                        &format!("listen at {path} revoked"),
                    ),
                );
            }
            proto::PUSH_AUTH_REVOKED | proto::PUSH_AUTH_PROVIDER_REVOKED => {
                let status = body
                    .get("s")
                    .and_then(Value::as_str)
                    .unwrap_or(proto::STATUS_EXPIRED_TOKEN)
                    .to_string();
                self.logger.debug(format!("auth revoked by server: {status}"));
                self.handle_auth_failure(&status);
            }
            proto::PUSH_SECURITY_DEBUG => {
                if let Some(message) = body.get("msg").and_then(Value::as_str) {
                    for line in message.split('\n') {
                        self.logger.info(line);
                    }
                }
            }
            other => {
                self.logger
                    .debug(format!("unhandled server push action '{other}'"));
            }
        }
    }

    fn parse_range_merges(body: &Value) -> Vec<RangeMerge> {
        let parse_one = |value: &Value| -> Option<RangeMerge> {
            Some(RangeMerge {
                start: value.get("s").and_then(Value::as_str).map(str::to_owned),
                end: value.get("e").and_then(Value::as_str).map(str::to_owned),
                data: value.get("m").cloned()?,
            })
        };
        if let Some(list) = body.get("m").and_then(Value::as_array) {
            return list.iter().filter_map(parse_one).collect();
        }
        parse_one(body).into_iter().collect()
    }

    // -----------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------

    fn handle_tick(&mut self) {
        let now = Instant::now();

        if self
            .pending
            .values()
            .any(|pending| now >= pending.deadline)
        {
            self.logger
                .warn("request timed out with no response; cycling connection");
            self.close_connection(false);
            return;
        }

        if self.is_connected()
            && !self.has_interest()
            && self.pending.is_empty()
            && now.duration_since(self.last_activity) >= self.tunables.idle_interval
        {
            self.logger.debug("closing idle connection");
            self.close_idle();
        }
    }

    /// Idle close: no backoff, no pending state; reopens on demand.
    fn close_idle(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
        if let Some(connected_at) = self.connected_at.take() {
            self.retry.record_connection_uptime(connected_at.elapsed());
        }
        self.state = ConnState::Disconnected;
        self.pending.clear();
        self.delegate.on_disconnect();
    }

    // -----------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------

    fn close_connection(&mut self, reconnect_immediately: bool) {
        let was_open = self.connection.is_some();
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
        if let Some(connected_at) = self.connected_at.take() {
            self.retry.record_connection_uptime(connected_at.elapsed());
        }
        self.state = ConnState::Disconnected;
        self.pending.clear();
        for listen in &mut self.listens {
            listen.sent = false;
        }
        for put in &mut self.puts {
            put.sent = false;
        }
        for od in &mut self.on_disconnects {
            od.sent = false;
        }
        self.stats_sent = false;

        if was_open {
            self.delegate.on_disconnect();
        }
        if self.killed || self.interrupted {
            self.reconnect_deadline = None;
        } else if reconnect_immediately {
            self.reconnect_deadline = None;
        } else if self.has_interest() {
            let delay = self.retry.next_delay();
            self.logger
                .debug(format!("reconnecting in {delay:?}"));
            self.reconnect_deadline = Some(Instant::now() + delay);
        }
    }

    async fn establish_connection(&mut self) {
        self.reconnect_deadline = None;
        self.state = ConnState::GatheringHost;

        if self.cached_host.is_none() {
            match resolve_canonical_host(&self.http, &self.host_info).await {
                Ok(Some(canonical)) => {
                    self.logger
                        .debug(format!("canonical host resolved: {canonical}"));
                    self.cached_host = Some(canonical);
                }
                Ok(None) => {}
                Err(err) => {
                    self.logger
                        .debug(format!("host resolution failed ({err}); using configured host"));
                }
            }
        }
        let host = self
            .cached_host
            .clone()
            .unwrap_or_else(|| self.host_info.host.clone());

        let token = match self
            .token_provider
            .access_token(self.force_token_refresh)
            .await
        {
            Ok(token) => {
                self.force_token_refresh = false;
                token
            }
            Err(err) => {
                self.logger
                    .warn(format!("token acquisition failed: {err}"));
                self.schedule_retry();
                return;
            }
        };

        self.state = ConnState::Connecting;
        let url = match self
            .host_info
            .websocket_url(&host, self.last_session_id.as_deref())
        {
            Ok(url) => url,
            Err(err) => {
                self.logger.error(format!("cannot build connection URL: {err}"));
                self.schedule_retry();
                return;
            }
        };

        let opened = Connection::open(
            url,
            self.tunables.connect_timeout,
            self.logger.clone(),
        )
        .await;
        let (connection, handshake) = match opened {
            Ok(opened) => opened,
            Err(err) => {
                self.logger.debug(format!("connection attempt failed: {err}"));
                self.schedule_retry();
                return;
            }
        };

        if !handshake.host.is_empty() && handshake.host != host {
            self.cached_host = Some(handshake.host.clone());
        }
        self.last_session_id = Some(handshake.session_id.clone());
        let local_now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis() as i64)
            .unwrap_or(0);
        self.delegate
            .on_server_info_update(handshake.timestamp - local_now);

        self.connection = Some(connection);
        self.connected_at = Some(Instant::now());
        self.last_activity = Instant::now();

        // Auth first, then state restoration; the server processes the
        // channel in order, so listens sent behind the auth request are
        // evaluated with the new credentials.
        self.state = ConnState::Authenticating;
        match token {
            Some(token) => {
                let body = json!({ "cred": token });
                self.send_tracked(proto::ACTION_AUTH, body, PendingKind::Auth);
            }
            None => {
                self.state = ConnState::Connected;
                self.delegate.on_auth_status(false);
            }
        }

        self.delegate.on_connect();
        self.restore_state();
    }

    fn schedule_retry(&mut self) {
        self.state = ConnState::Disconnected;
        // Queued one-shot reads fail fast so callers fall back to cache
        // instead of waiting out the backoff.
        for (_, _, complete) in self.pending_gets.drain(..) {
            complete(Err(disconnected("connection attempt failed")));
        }
        if self.interrupted || self.killed {
            return;
        }
        let delay = self.retry.next_delay();
        self.logger.debug(format!("retrying connection in {delay:?}"));
        self.reconnect_deadline = Some(Instant::now() + delay);
    }

    fn restore_state(&mut self) {
        for index in 0..self.listens.len() {
            if !self.listens[index].sent {
                self.send_listen(index);
            }
        }
        for index in 0..self.on_disconnects.len() {
            if !self.on_disconnects[index].sent {
                self.send_on_disconnect(index);
            }
        }
        for index in 0..self.puts.len() {
            if !self.puts[index].sent {
                self.send_put(index);
            }
        }
        for (path, params, complete) in std::mem::take(&mut self.pending_gets) {
            let body = json!({ "p": path.to_wire(), "q": params });
            self.send_tracked(proto::ACTION_GET, body, PendingKind::Get { complete });
        }
        if !self.stats_sent {
            self.send_stats();
        }
    }

    // -----------------------------------------------------------------
    // Outbound requests
    // -----------------------------------------------------------------

    fn send_tracked(&mut self, action: &str, body: Value, kind: PendingKind) {
        let Some(connection) = self.connection.as_ref() else {
            return;
        };
        let request_id = {
            self.next_request_id += 1;
            self.next_request_id
        };
        if let Err(err) = connection.send_request(request_id, action, body) {
            self.logger.debug(format!("send failed: {err}"));
            self.close_connection(false);
            return;
        }
        self.pending.insert(
            request_id,
            PendingRequest {
                kind,
                deadline: Instant::now() + self.tunables.request_timeout,
            },
        );
        self.last_activity = Instant::now();
    }

    fn send_listen(&mut self, index: usize) {
        let listen = &mut self.listens[index];
        listen.sent = true;
        let spec = listen.spec.clone();
        let mut body = Map::new();
        body.insert("p".to_string(), Value::String(spec.path.to_wire()));
        if !spec.is_default() {
            body.insert("q".to_string(), spec.params.to_wire());
        }
        if let Some(tag) = listen.tag {
            body.insert("t".to_string(), Value::from(tag.0));
        }
        body.insert("h".to_string(), Value::String(listen.hash.clone()));
        self.send_tracked(
            proto::ACTION_LISTEN,
            Value::Object(body),
            PendingKind::Listen { spec },
        );
    }

    fn send_unlisten(&mut self, spec: &QuerySpec) {
        let mut body = Map::new();
        body.insert("p".to_string(), Value::String(spec.path.to_wire()));
        if !spec.is_default() {
            body.insert("q".to_string(), spec.params.to_wire());
        }
        self.send_tracked(
            proto::ACTION_UNLISTEN,
            Value::Object(body),
            PendingKind::Unlisten,
        );
    }

    fn send_put(&mut self, index: usize) {
        let put = &mut self.puts[index];
        put.sent = true;
        let action = put.action;
        let body = put.body.clone();
        let put_id = put.put_id;
        self.send_tracked(action, body, PendingKind::Put { put_id });
    }

    fn send_on_disconnect(&mut self, index: usize) {
        let od = &mut self.on_disconnects[index];
        od.sent = true;
        let action = od.action;
        let body = od.body.clone();
        let od_id = od.od_id;
        self.send_tracked(action, body, PendingKind::OnDisconnect { od_id });
    }

    fn send_stats(&mut self) {
        self.stats_sent = true;
        let sdk_key = format!(
            "sdk.admin-rust.{}",
            env!("CARGO_PKG_VERSION").replace('.', "-")
        );
        let body = json!({ "c": { sdk_key: 1 } });
        self.send_tracked(proto::ACTION_STATS, body, PendingKind::Stats);
    }
}

impl std::fmt::Debug for PersistentConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentConnection")
            .field("state", &self.state)
            .field("listens", &self.listens.len())
            .field("puts", &self.puts.len())
            .field("interrupted", &self.interrupted)
            .field("killed", &self.killed)
            .finish()
    }
}
