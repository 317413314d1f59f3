use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use iobroker_bridge_commons::{Error, Result, ServerConfig};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::MaybeTlsStream;

use super::{Client, ClientEvent, Connector, LogEntry, ObjectValue, StateValue};

type WebSocketStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default production [`Connector`]: opens a `tokio-tungstenite` socket
/// and speaks a minimal JSON envelope over it, following the
/// request/response de-multiplexing pattern of an `ethers`-style
/// JSON-RPC-over-WebSocket transport (a per-call `oneshot` keyed by a
/// locally assigned request id, matched against inbound `response`
/// frames). Only the [`crate::connection::ConnectionManager`] constructs
/// one of these.
#[derive(Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    type Client = WsClient;

    async fn connect(
        &self, config: &ServerConfig,
    ) -> Result<(WsClient, mpsc::UnboundedReceiver<ClientEvent>)> {
        let url = config.url();
        let (stream, _) = tokio::time::timeout(config.connect_timeout, tokio_tungstenite::connect_async(&url))
            .await
            .map_err(|_| Error::Timeout(format!("connect to {url}")))?
            .map_err(|e| Error::Transport(e.to_string()))?;

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ready = Arc::new(AtomicBool::new(false));

        let server = WsServer {
            pending: HashMap::new(),
            stream,
            events_tx: events_tx.clone(),
            ready: ready.clone(),
        };
        tokio::spawn(server.run(request_rx));

        // The handshake is complete the moment the socket connects; the
        // server task flips `ready` and emits `Ready` on the first
        // successful frame exchange (or immediately, for this minimal
        // wire protocol).
        ready.store(true, Ordering::SeqCst);
        let _ = events_tx.send(ClientEvent::Ready);

        Ok((
            WsClient {
                next_id: AtomicU64::new(1),
                request_tx,
                ready,
            },
            events_rx,
        ))
    }
}

pub struct WsClient {
    next_id: AtomicU64,
    request_tx: mpsc::UnboundedSender<WsRequest>,
    ready: Arc<AtomicBool>,
}

#[async_trait]
impl Client for WsClient {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && !self.request_tx.is_closed()
    }

    async fn emit(&self, command: &str, args: Vec<Value>, timeout: Duration) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        self.request_tx
            .send(WsRequest::Call {
                id,
                command: command.to_string(),
                args,
                tx,
            })
            .map_err(|_| Error::Transport("client task exited".into()))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Transport("client task dropped the request".into())),
            Err(_) => Err(Error::Timeout(command.to_string())),
        }
    }

    async fn emit_no_reply(&self, command: &str, args: Vec<Value>) -> Result<()> {
        self.request_tx
            .send(WsRequest::CallNoReply {
                command: command.to_string(),
                args,
            })
            .map_err(|_| Error::Transport("client task exited".into()))
    }

    async fn destroy(&self) {
        self.ready.store(false, Ordering::SeqCst);
        // Dropping the sender makes the server task's `rx.recv()` return
        // `None`, ending its run loop.
    }
}

enum WsRequest {
    Call {
        id: u64,
        command: String,
        args: Vec<Value>,
        tx: oneshot::Sender<Result<Value>>,
    },
    CallNoReply {
        command: String,
        args: Vec<Value>,
    },
}

struct WsServer {
    pending: HashMap<u64, oneshot::Sender<Result<Value>>>,
    stream: WebSocketStream,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    ready: Arc<AtomicBool>,
}

impl WsServer {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<WsRequest>) {
        loop {
            tokio::select! {
                biased;
                request = rx.recv() => match request {
                    Some(request) => {
                        if let Err(e) = self.handle_request(request).await {
                            tracing::warn!(error = %e, "ws client exiting after send failure");
                            break;
                        }
                    }
                    None => break,
                },
                msg = self.stream.next() => match msg {
                    Some(Ok(msg)) => self.handle_message(msg),
                    Some(Err(e)) => {
                        self.ready.store(false, Ordering::SeqCst);
                        let _ = self.events_tx.send(ClientEvent::Error(e.to_string()));
                        break;
                    }
                    None => {
                        self.ready.store(false, Ordering::SeqCst);
                        let _ = self.events_tx.send(ClientEvent::Disconnect("stream closed".into()));
                        break;
                    }
                },
            }
        }
    }

    async fn handle_request(&mut self, request: WsRequest) -> Result<()> {
        match request {
            WsRequest::Call { id, command, args, tx } => {
                self.pending.insert(id, tx);
                let frame = serde_json::json!({ "t": "call", "id": id, "cmd": command, "args": args });
                self.stream
                    .send(Message::text(frame.to_string()))
                    .await
                    .map_err(|e| Error::Transport(e.to_string()))
            }
            WsRequest::CallNoReply { command, args } => {
                let frame = serde_json::json!({ "t": "call", "cmd": command, "args": args });
                self.stream
                    .send(Message::text(frame.to_string()))
                    .await
                    .map_err(|e| Error::Transport(e.to_string()))
            }
        }
    }

    fn handle_message(&mut self, msg: Message) {
        let Message::Text(text) = msg else { return };
        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            tracing::warn!("dropping malformed frame");
            return;
        };

        match frame.get("t").and_then(Value::as_str) {
            Some("response") => self.handle_response(frame),
            Some("event") => self.handle_event(frame),
            _ => tracing::warn!(frame = %frame, "unknown frame type"),
        }
    }

    fn handle_response(&mut self, frame: Value) {
        let Some(id) = frame.get("id").and_then(Value::as_u64) else {
            return;
        };
        let Some(tx) = self.pending.remove(&id) else {
            tracing::warn!(id, "no pending request for response id");
            return;
        };

        let result = if frame.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            Ok(frame.get("result").cloned().unwrap_or(Value::Null))
        } else {
            let message = frame
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            Err(Error::Protocol(message))
        };

        let _ = tx.send(result);
    }

    fn handle_event(&mut self, frame: Value) {
        let event = match frame.get("kind").and_then(Value::as_str) {
            Some("stateChange") => {
                let id = frame.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
                match serde_json::from_value::<StateValue>(frame.get("state").cloned().unwrap_or(Value::Null)) {
                    Ok(state) => ClientEvent::StateChange(id, state),
                    Err(_) => return,
                }
            }
            Some("objectChange") => {
                let id = frame.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
                let obj = frame
                    .get("object")
                    .cloned()
                    .and_then(|v| serde_json::from_value::<ObjectValue>(v).ok());
                ClientEvent::ObjectChange(id, obj)
            }
            Some("log") => match serde_json::from_value::<LogEntry>(frame.get("entry").cloned().unwrap_or(Value::Null)) {
                Ok(entry) => ClientEvent::Log(entry),
                Err(_) => return,
            },
            Some("disconnect") => {
                self.ready.store(false, Ordering::SeqCst);
                ClientEvent::Disconnect(
                    frame.get("reason").and_then(Value::as_str).unwrap_or("disconnected").to_string(),
                )
            }
            Some("error") => ClientEvent::Error(
                frame.get("message").and_then(Value::as_str).unwrap_or("error").to_string(),
            ),
            Some("tokenRefresh") => ClientEvent::TokenRefresh,
            _ => return,
        };

        let _ = self.events_tx.send(event);
    }
}
