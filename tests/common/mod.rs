#![allow(dead_code)] // shared across test binaries; not every helper is used by each

//! In-process realtime wire server for integration tests.
//!
//! Speaks just enough of the v5 protocol to drive the client end-to-end:
//! handshake, auth, listens (with optional tags and limit filtering), puts
//! with hash preconditions, merges, onDisconnect staging, one-shot gets, and
//! server-initiated pushes (data updates and listen revocation).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use firebase_admin_database::core::node::serializer::json_to_node;

pub struct WireServer {
    state: Arc<Mutex<ServerState>>,
    local_addr: SocketAddr,
}

#[derive(Clone, Debug)]
struct ListenEntry {
    conn_id: u64,
    path: String,
    tag: Option<u64>,
    query: Option<Value>,
}

#[derive(Default)]
struct ServerState {
    data: Value,
    listens: Vec<ListenEntry>,
    senders: HashMap<u64, mpsc::UnboundedSender<String>>,
    on_disconnect: HashMap<u64, Vec<(String, String, Value)>>,
    put_log: Vec<(String, Value)>,
    listen_log: Vec<String>,
    tokens: Vec<String>,
    deny_listens: Vec<String>,
    fail_next_put: Option<String>,
}

impl WireServer {
    pub async fn start() -> WireServer {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind wire server");
        let local_addr = listener.local_addr().expect("local addr");
        let state: Arc<Mutex<ServerState>> = Arc::new(Mutex::new(ServerState {
            data: Value::Null,
            ..Default::default()
        }));

        let accept_state = state.clone();
        tokio::spawn(async move {
            let conn_ids = AtomicU64::new(1);
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let conn_id = conn_ids.fetch_add(1, Ordering::SeqCst);
                let conn_state = accept_state.clone();
                tokio::spawn(async move {
                    // Plain HTTP probes (host resolution) fail the upgrade;
                    // ignore them.
                    if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                        run_connection(conn_id, ws, conn_state).await;
                    }
                });
            }
        });

        WireServer { state, local_addr }
    }

    pub fn url(&self) -> String {
        format!("http://{}?ns=test-ns", self.local_addr)
    }

    pub fn set_data(&self, path: &str, value: Value) {
        let mut state = self.state.lock().unwrap();
        set_json(&mut state.data, path, value);
    }

    pub fn data(&self, path: &str) -> Value {
        let state = self.state.lock().unwrap();
        get_json(&state.data, path)
    }

    pub fn deny_listen(&self, path: &str) {
        self.state
            .lock()
            .unwrap()
            .deny_listens
            .push(normalize(path));
    }

    pub fn fail_next_put(&self, status: &str) {
        self.state.lock().unwrap().fail_next_put = Some(status.to_string());
    }

    /// Pushes a `c` frame for every listen at `path` and forgets them.
    pub fn revoke_listen(&self, path: &str) {
        let path = normalize(path);
        let mut state = self.state.lock().unwrap();
        let revoked: Vec<ListenEntry> = state
            .listens
            .iter()
            .filter(|listen| listen.path == path)
            .cloned()
            .collect();
        state.listens.retain(|listen| listen.path != path);
        for listen in revoked {
            if let Some(sender) = state.senders.get(&listen.conn_id) {
                let frame = json!({
                    "t": "d",
                    "d": { "a": "c", "b": { "p": listen.path } }
                });
                let _ = sender.send(frame.to_string());
            }
        }
    }

    /// Severs every open socket; clients reconnect on their own schedule.
    pub fn drop_connections(&self) {
        let mut state = self.state.lock().unwrap();
        state.senders.clear();
        state.listens.clear();
    }

    pub fn put_log(&self) -> Vec<(String, Value)> {
        self.state.lock().unwrap().put_log.clone()
    }

    pub fn listen_log(&self) -> Vec<String> {
        self.state.lock().unwrap().listen_log.clone()
    }

    pub fn tokens(&self) -> Vec<String> {
        self.state.lock().unwrap().tokens.clone()
    }

    /// Applies a server-side write and notifies listeners, as if another
    /// client wrote.
    pub fn write(&self, path: &str, value: Value) {
        let mut state = self.state.lock().unwrap();
        set_json(&mut state.data, path, value);
        broadcast(&mut state, path);
    }
}

async fn run_connection(
    conn_id: u64,
    ws: tokio_tungstenite::WebSocketStream<TcpStream>,
    state: Arc<Mutex<ServerState>>,
) {
    let (mut sink, mut stream) = ws.split();
    let (sender, mut outgoing) = mpsc::unbounded_channel::<String>();
    state.lock().unwrap().senders.insert(conn_id, sender);

    let handshake = json!({
        "t": "c",
        "d": {
            "t": "h",
            "d": {
                "ts": now_millis(),
                "v": "5",
                "h": "",
                "s": format!("session-{conn_id}")
            }
        }
    });
    let _ = sink.send(Message::Text(handshake.to_string())).await;

    loop {
        tokio::select! {
            frame = outgoing.recv() => {
                match frame {
                    Some(frame) => {
                        if sink.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    // Sender dropped: the test asked us to sever the socket.
                    None => {
                        let _ = sink.close().await;
                        break;
                    }
                }
            }
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(conn_id, &text, &state);
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    disconnect_cleanup(conn_id, &state);
}

fn disconnect_cleanup(conn_id: u64, state: &Arc<Mutex<ServerState>>) {
    let mut state = state.lock().unwrap();
    state.senders.remove(&conn_id);
    state.listens.retain(|listen| listen.conn_id != conn_id);

    // Commit staged onDisconnect operations.
    let staged = state.on_disconnect.remove(&conn_id).unwrap_or_default();
    for (action, path, payload) in staged {
        match action.as_str() {
            "o" => set_json(&mut state.data, &path, payload),
            "om" => {
                if let Value::Object(children) = payload {
                    for (key, child) in children {
                        let child_path = format!("{path}/{key}");
                        set_json(&mut state.data, &child_path, child);
                    }
                }
            }
            _ => {}
        }
        broadcast(&mut state, &path);
    }
}

fn handle_frame(conn_id: u64, text: &str, state: &Arc<Mutex<ServerState>>) {
    let Ok(envelope) = serde_json::from_str::<Value>(text) else {
        return;
    };
    if envelope.get("t").and_then(Value::as_str) != Some("d") {
        return;
    }
    let Some(data) = envelope.get("d") else {
        return;
    };
    let Some(request_id) = data.get("r").and_then(Value::as_u64) else {
        return;
    };
    let action = data.get("a").and_then(Value::as_str).unwrap_or("");
    let body = data.get("b").cloned().unwrap_or(Value::Null);

    let mut state = state.lock().unwrap();
    let response = handle_action(conn_id, action, &body, &mut state);
    if let Some(sender) = state.senders.get(&conn_id) {
        let frame = json!({ "t": "d", "d": { "r": request_id, "b": response } });
        let _ = sender.send(frame.to_string());
    }
}

fn handle_action(conn_id: u64, action: &str, body: &Value, state: &mut ServerState) -> Value {
    let path = body
        .get("p")
        .and_then(Value::as_str)
        .map(normalize)
        .unwrap_or_else(|| "/".to_string());

    match action {
        "auth" => {
            if let Some(token) = body.get("cred").and_then(Value::as_str) {
                state.tokens.push(token.to_string());
            }
            json!({ "s": "ok", "d": { "auth": {} } })
        }
        "unauth" | "s" => json!({ "s": "ok", "d": {} }),
        "q" => {
            if state.deny_listens.contains(&path) {
                return json!({ "s": "permission_denied", "d": "Permission denied" });
            }
            let entry = ListenEntry {
                conn_id,
                path: path.clone(),
                tag: body.get("t").and_then(Value::as_u64),
                query: body.get("q").cloned(),
            };
            state.listen_log.push(path.clone());
            state.listens.push(entry.clone());
            push_listen_data(state, &entry);
            json!({ "s": "ok", "d": {} })
        }
        "n" => {
            state
                .listens
                .retain(|listen| !(listen.conn_id == conn_id && listen.path == path));
            json!({ "s": "ok", "d": {} })
        }
        "p" => {
            if let Some(status) = state.fail_next_put.take() {
                return json!({ "s": status, "d": "rejected by test" });
            }
            if let Some(expected_hash) = body.get("h").and_then(Value::as_str) {
                let current = get_json(&state.data, &path);
                let actual_hash = json_to_node(&current)
                    .map(|node| node.hash())
                    .unwrap_or_default();
                if expected_hash != actual_hash {
                    return json!({ "s": "datastale", "d": "hash mismatch" });
                }
            }
            let payload = body.get("d").cloned().unwrap_or(Value::Null);
            state.put_log.push((path.clone(), payload.clone()));
            set_json(&mut state.data, &path, payload);
            broadcast(state, &path);
            json!({ "s": "ok", "d": {} })
        }
        "m" => {
            if let Some(Value::Object(children)) = body.get("d") {
                for (key, child) in children {
                    let child_path = format!("{path}/{key}");
                    set_json(&mut state.data, &normalize(&child_path), child.clone());
                }
            }
            broadcast(state, &path);
            json!({ "s": "ok", "d": {} })
        }
        "o" | "om" | "oc" => {
            let staged = state.on_disconnect.entry(conn_id).or_default();
            if action == "oc" {
                staged.retain(|(_, staged_path, _)| !staged_path.starts_with(&path));
            } else {
                staged.push((
                    action.to_string(),
                    path,
                    body.get("d").cloned().unwrap_or(Value::Null),
                ));
            }
            json!({ "s": "ok", "d": {} })
        }
        "g" => {
            let value = get_json(&state.data, &path);
            json!({ "s": "ok", "d": value })
        }
        _ => json!({ "s": "ok", "d": {} }),
    }
}

fn broadcast(state: &mut ServerState, changed_path: &str) {
    let listens = state.listens.clone();
    for listen in listens {
        if !paths_related(&listen.path, changed_path) {
            continue;
        }
        push_listen_data(state, &listen);
    }
}

fn push_listen_data(state: &ServerState, listen: &ListenEntry) {
    let Some(sender) = state.senders.get(&listen.conn_id) else {
        return;
    };
    let mut value = get_json(&state.data, &listen.path);
    if let Some(query) = &listen.query {
        value = apply_query(&value, query);
    }
    let mut body = json!({ "p": listen.path, "d": value });
    if let Some(tag) = listen.tag {
        body["t"] = json!(tag);
    }
    let frame = json!({ "t": "d", "d": { "a": "d", "b": body } });
    let _ = sender.send(frame.to_string());
}

/// Minimal server-side filtering: orderByChild + limitToFirst/Last, enough
/// to exercise tagged listens.
fn apply_query(value: &Value, query: &Value) -> Value {
    let Some(limit) = query.get("l").and_then(Value::as_u64) else {
        return value.clone();
    };
    let Value::Object(children) = value else {
        return value.clone();
    };
    let index_path = query.get("i").and_then(Value::as_str).unwrap_or("");
    let anchors_last = query.get("vf").and_then(Value::as_str) == Some("r");

    let mut entries: Vec<(String, Value)> = children
        .iter()
        .map(|(key, child)| (key.clone(), child.clone()))
        .collect();
    entries.sort_by(|(key_a, child_a), (key_b, child_b)| {
        let value_a = index_value(child_a, index_path);
        let value_b = index_value(child_b, index_path);
        value_a
            .partial_cmp(&value_b)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| key_a.cmp(key_b))
    });
    let window: Vec<(String, Value)> = if anchors_last {
        let skip = entries.len().saturating_sub(limit as usize);
        entries.into_iter().skip(skip).collect()
    } else {
        entries.into_iter().take(limit as usize).collect()
    };
    Value::Object(window.into_iter().collect())
}

fn index_value(child: &Value, index_path: &str) -> f64 {
    let mut current = child;
    for segment in index_path.split('/').filter(|segment| !segment.is_empty()) {
        match current.get(segment) {
            Some(next) => current = next,
            None => return f64::MIN,
        }
    }
    current.as_f64().unwrap_or(f64::MIN)
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn paths_related(a: &str, b: &str) -> bool {
    let a = normalize(a);
    let b = normalize(b);
    a == "/" || b == "/" || a.starts_with(&format!("{b}/")) || b.starts_with(&format!("{a}/")) || a == b
}

fn segments(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

fn get_json(root: &Value, path: &str) -> Value {
    let mut current = root;
    for segment in segments(path) {
        match current.get(&segment) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn set_json(root: &mut Value, path: &str, value: Value) {
    let parts = segments(path);
    if parts.is_empty() {
        *root = value;
        return;
    }
    let mut current = root;
    for segment in &parts[..parts.len() - 1] {
        if !current.is_object() {
            *current = json!({});
        }
        current = current
            .as_object_mut()
            .unwrap()
            .entry(segment.clone())
            .or_insert(json!({}));
    }
    if !current.is_object() {
        *current = json!({});
    }
    let map = current.as_object_mut().unwrap();
    let last = parts.last().unwrap();
    if value.is_null() {
        map.remove(last);
    } else {
        map.insert(last.clone(), value);
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

/// Polls until `check` passes or the timeout elapses; true on success.
pub async fn wait_until(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
