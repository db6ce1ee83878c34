//! One realtime session: envelope framing and control-frame handling over a
//! single socket. Connection establishment completes at the server handshake.

use std::time::Duration;

use serde_json::{json, Value};
use url::Url;

use crate::error::{network_error, DatabaseResult};
use crate::logger::Logger;
use crate::realtime::protocol::{
    CONTROL_HANDSHAKE, CONTROL_PING, CONTROL_REDIRECT, CONTROL_RESET, CONTROL_SHUTDOWN,
    ENVELOPE_CONTROL, ENVELOPE_DATA,
};
use crate::realtime::websocket::{SocketEvent, WebSocketClient};
use crate::runtime::with_timeout;

#[derive(Debug, Clone)]
pub(crate) struct HandshakeInfo {
    pub timestamp: i64,
    pub session_id: String,
    /// The host the server wants future connections to use.
    pub host: String,
}

#[derive(Debug)]
pub(crate) enum ConnectionEvent {
    Handshake(HandshakeInfo),
    DataResponse { request_id: u64, body: Value },
    DataPush { action: String, body: Value },
    Reset { host: Option<String> },
    Shutdown { reason: String },
    Closed,
}

pub(crate) struct Connection {
    socket: WebSocketClient,
    logger: Logger,
}

impl Connection {
    /// Dials the server and waits for the `h` control frame.
    pub(crate) async fn open(
        url: Url,
        connect_timeout: Duration,
        logger: Logger,
    ) -> DatabaseResult<(Connection, HandshakeInfo)> {
        let socket = WebSocketClient::open(url, connect_timeout, logger.clone()).await?;
        let mut connection = Connection { socket, logger };

        let handshake = with_timeout(
            connection.wait_for_handshake(),
            connect_timeout,
        )
        .await
        .map_err(|_| network_error("timed out waiting for server handshake"))??;
        Ok((connection, handshake))
    }

    async fn wait_for_handshake(&mut self) -> DatabaseResult<HandshakeInfo> {
        loop {
            match self.next_event().await {
                ConnectionEvent::Closed => {
                    return Err(network_error("connection closed before handshake"));
                }
                ConnectionEvent::Shutdown { reason } => {
                    return Err(network_error(format!(
                        "server refused connection: {reason}"
                    )));
                }
                ConnectionEvent::DataPush { .. }
                | ConnectionEvent::DataResponse { .. }
                | ConnectionEvent::Reset { .. } => continue,
                ConnectionEvent::Handshake(info) => return Ok(info),
            }
        }
    }

    pub(crate) fn send_request(
        &self,
        request_id: u64,
        action: &str,
        body: Value,
    ) -> DatabaseResult<()> {
        let envelope = json!({
            "t": ENVELOPE_DATA,
            "d": {
                "r": request_id,
                "a": action,
                "b": body,
            }
        });
        self.socket.send_text(envelope.to_string())
    }

    pub(crate) async fn next_event(&mut self) -> ConnectionEvent {
        loop {
            let Some(event) = self.socket.incoming.recv().await else {
                return ConnectionEvent::Closed;
            };
            let value = match event {
                SocketEvent::Message(value) => value,
                SocketEvent::Closed => return ConnectionEvent::Closed,
            };
            if let Some(event) = self.parse_envelope(value) {
                return event;
            }
        }
    }

    fn parse_envelope(&self, value: Value) -> Option<ConnectionEvent> {
        let envelope = value.as_object()?;
        let kind = envelope.get("t").and_then(Value::as_str)?;
        let payload = envelope.get("d")?;
        match kind {
            ENVELOPE_DATA => self.parse_data(payload),
            ENVELOPE_CONTROL => self.parse_control(payload),
            other => {
                self.logger.debug(format!("unknown envelope type '{other}'"));
                None
            }
        }
    }

    fn parse_data(&self, payload: &Value) -> Option<ConnectionEvent> {
        let data = payload.as_object()?;
        if let Some(request_id) = data.get("r").and_then(Value::as_u64) {
            return Some(ConnectionEvent::DataResponse {
                request_id,
                body: data.get("b").cloned().unwrap_or(Value::Null),
            });
        }
        let action = data.get("a").and_then(Value::as_str)?;
        Some(ConnectionEvent::DataPush {
            action: action.to_string(),
            body: data.get("b").cloned().unwrap_or(Value::Null),
        })
    }

    fn parse_control(&self, payload: &Value) -> Option<ConnectionEvent> {
        let control = payload.as_object()?;
        let kind = control.get("t").and_then(Value::as_str)?;
        let body = control.get("d");
        match kind {
            CONTROL_HANDSHAKE => {
                let body = body?.as_object()?;
                Some(ConnectionEvent::Handshake(HandshakeInfo {
                    timestamp: body.get("ts").and_then(Value::as_i64).unwrap_or(0),
                    session_id: body
                        .get("s")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    host: body
                        .get("h")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                }))
            }
            CONTROL_RESET | CONTROL_REDIRECT => {
                let host = body.and_then(|value| {
                    value
                        .as_str()
                        .map(str::to_owned)
                        .or_else(|| value.get("h").and_then(Value::as_str).map(str::to_owned))
                });
                Some(ConnectionEvent::Reset { host })
            }
            CONTROL_SHUTDOWN => Some(ConnectionEvent::Shutdown {
                reason: body
                    .and_then(Value::as_str)
                    .unwrap_or("server shutdown")
                    .to_string(),
            }),
            CONTROL_PING => {
                // Tungstenite answers transport-level pings; the protocol
                // ping needs no reply.
                None
            }
            other => {
                self.logger.debug(format!("unknown control frame '{other}'"));
                None
            }
        }
    }

    pub(crate) fn close(&self) {
        self.socket.close();
    }
}
