//! WebSocket transport: one reader task, one writer task, text frames.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::{network_error, DatabaseResult};
use crate::logger::Logger;
use crate::realtime::frame::{split_outgoing, FrameReassembler, MAX_FRAME_BYTES};
use crate::runtime::{spawn_detached, with_timeout};

/// Client-side keepalive; a bare `0` frame the server ignores.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(45);
const KEEPALIVE_FRAME: &str = "0";

type TcpWebSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug)]
pub(crate) enum SocketEvent {
    /// A fully reassembled, parsed JSON message.
    Message(Value),
    /// The socket closed (peer close, I/O error, or protocol error).
    Closed,
}

enum Outgoing {
    Text(String),
    Shutdown,
}

/// Handle to the two socket tasks. Dropping it closes the socket.
pub(crate) struct WebSocketClient {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    pub(crate) incoming: mpsc::UnboundedReceiver<SocketEvent>,
}

impl WebSocketClient {
    pub(crate) async fn open(
        url: Url,
        connect_timeout: Duration,
        logger: Logger,
    ) -> DatabaseResult<Self> {
        let connected = with_timeout(connect_async(url.as_str()), connect_timeout)
            .await
            .map_err(|_| network_error("websocket connect timed out"))?
            .map_err(|err| network_error(format!("websocket connect failed: {err}")))?;
        let (stream, _response) = connected;
        let (mut sink, mut reader) = stream.split();

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Outgoing>();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel::<SocketEvent>();

        // Writer: single owner of the sink; splits oversized frames and
        // keeps the connection alive while idle.
        let writer_logger = logger.clone();
        spawn_detached(async move {
            let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
            keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            keepalive.tick().await;
            loop {
                tokio::select! {
                    command = outgoing_rx.recv() => {
                        match command {
                            Some(Outgoing::Text(payload)) => {
                                for frame in split_outgoing(payload, MAX_FRAME_BYTES) {
                                    if let Err(err) = sink.send(Message::Text(frame)).await {
                                        writer_logger
                                            .warn(format!("websocket send failed: {err}"));
                                        return;
                                    }
                                }
                                keepalive.reset();
                            }
                            Some(Outgoing::Shutdown) | None => {
                                let _ = sink.close().await;
                                return;
                            }
                        }
                    }
                    _ = keepalive.tick() => {
                        if sink
                            .send(Message::Text(KEEPALIVE_FRAME.to_string()))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
            }
        });

        // Reader: reassembles segmented frames and parses the JSON envelope.
        // A malformed frame is fatal for this socket.
        spawn_detached(async move {
            let mut reassembler = FrameReassembler::new();
            while let Some(message) = reader.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            logger.warn("non-UTF8 binary frame; closing socket");
                            break;
                        }
                    },
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {
                        continue;
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                };

                let Some(complete) = reassembler.push(text) else {
                    continue;
                };
                match serde_json::from_str::<Value>(&complete) {
                    Ok(value) => {
                        if incoming_tx.send(SocketEvent::Message(value)).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        logger.warn(format!("malformed server frame ({err}); closing socket"));
                        break;
                    }
                }
            }
            let _ = incoming_tx.send(SocketEvent::Closed);
        });

        Ok(Self {
            outgoing: outgoing_tx,
            incoming: incoming_rx,
        })
    }

    pub(crate) fn send_text(&self, payload: String) -> DatabaseResult<()> {
        self.outgoing
            .send(Outgoing::Text(payload))
            .map_err(|_| network_error("websocket writer is gone"))
    }

    pub(crate) fn close(&self) {
        let _ = self.outgoing.send(Outgoing::Shutdown);
    }
}

impl Drop for WebSocketClient {
    fn drop(&mut self) {
        self.close();
    }
}
