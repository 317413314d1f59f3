//! The wire-client contract of `spec.md` §6: a bidirectional, socket-like
//! message channel to the remote home-automation server. The concrete
//! implementation ([`ws::WsClient`]) is a leaf — only the
//! [`crate::connection::ConnectionManager`] ever constructs, reads the
//! readiness of, or destroys one.

#[cfg(test)]
pub mod mock;
pub mod ws;

use std::time::Duration;

use async_trait::async_trait;
use iobroker_bridge_commons::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

pub use ws::WsClient;

/// State value format from `spec.md` §6: opaque to the core, passed
/// through verbatim except when constructing `setState` payloads.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StateValue {
    pub val: Value,
    #[serde(default)]
    pub ack: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl StateValue {
    pub fn new(val: Value, ack: bool) -> Self {
        Self {
            val,
            ack,
            from: None,
            ts: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Stamps the payload the way `setState` does: `from` defaults to the
    /// bridge's adapter id and `ts` defaults to `now_ms` unless the caller
    /// already supplied one.
    pub fn for_set(mut self, now_ms: i64) -> Self {
        if self.from.is_none() {
            self.from = Some("system.adapter.node-red".to_string());
        }
        if self.ts.is_none() {
            self.ts = Some(now_ms);
        }
        self
    }
}

/// Object format from `spec.md` §6.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ObjectValue {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub common: Value,
    #[serde(default)]
    pub native: Value,
}

impl ObjectValue {
    /// `setObject` must strip `_id` from the body before sending.
    pub fn body_without_id(&self) -> Value {
        serde_json::json!({
            "type": self.kind,
            "common": self.common,
            "native": self.native,
        })
    }
}

/// Options for `getHistory`, passed through verbatim to the wire command;
/// the exact option/result shape is otherwise left to the remote server.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistoryQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_ts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<String>,
}

/// A log record delivered through `requireLog`/`log` events.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub severity: String,
    pub message: String,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub ts: Option<i64>,
}

/// Events a `Client` may push asynchronously, per `spec.md` §6's event
/// list. `Connect`/`Reconnect`/`TokenRefresh` are transport bookkeeping the
/// `Client` implementation may surface for diagnostics; the
/// [`crate::connection::ConnectionManager`] only acts on `Ready`,
/// `Disconnect` and `Error`.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    Connect,
    Ready,
    Disconnect(String),
    Reconnect,
    Error(String),
    StateChange(String, StateValue),
    ObjectChange(String, Option<ObjectValue>),
    Log(LogEntry),
    TokenRefresh,
}

/// Request helpers exposed by the remote server, per `spec.md` §6.
#[async_trait]
pub trait Client: Send + Sync {
    /// `true` once the handshake/auth has completed and the client is
    /// accepting requests.
    fn is_ready(&self) -> bool;

    /// `emit(command, args…, callback(err, result?))`: invokes one of the
    /// wire commands {getState, setState, getStates, getObject, setObject,
    /// getObjectView, subscribe, unsubscribe, subscribeObjects,
    /// unsubscribeObjects, requireLog, sendTo}. `timeout` is applied by the
    /// caller (see `operation::timeouts`), not by the `Client` itself.
    async fn emit(&self, command: &str, args: Vec<Value>, timeout: Duration) -> Result<Value>;

    /// Fire-and-forget variant of [`Client::emit`] used by `sendToAdapter`
    /// when no response timeout was supplied.
    async fn emit_no_reply(&self, command: &str, args: Vec<Value>) -> Result<()>;

    /// Enables or disables the client's own reconnect bookkeeping; the
    /// core always drives reconnection itself, so implementations
    /// typically no-op this.
    fn set_connection_recovery(&self, _enabled: bool) {}

    async fn destroy(&self);
}

/// Connects to `config` and returns the ready client handle together with
/// the event stream the [`crate::connection::ConnectionManager`] will
/// drain for the lifetime of this client generation.
#[async_trait]
pub trait Connector: Send + Sync {
    type Client: Client + 'static;

    async fn connect(
        &self, config: &iobroker_bridge_commons::ServerConfig,
    ) -> Result<(Self::Client, mpsc::UnboundedReceiver<ClientEvent>)>;
}

pub fn timeout_err(op: &str) -> Error {
    Error::Timeout(op.to_string())
}
