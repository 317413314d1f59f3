//! Connection broker core, per `spec.md`: a pooled, auto-reconnecting link
//! to a remote home-automation server, split into four collaborating
//! managers wired together by the [`facade::Facade`].

pub mod classify;
pub mod client;
pub mod connection;
pub mod facade;
pub mod operation;
pub mod pattern;
pub mod recovery;
pub mod registry;
pub mod server_id;
pub mod status;

pub use client::{Client, ClientEvent, Connector, HistoryQuery, LogEntry, ObjectValue, StateValue, WsClient};
pub use connection::{ConnectionCallbacks, ConnectionManager, ConnectionOutcome, ConnectionState};
pub use facade::{ConnectionStatusSnapshot, Facade};
pub use operation::OperationManager;
pub use recovery::RecoveryManager;
pub use registry::{ConsumerCallbacks, NodeEvent, NodeRegistry};
pub use server_id::{NodeId, ServerId};
pub use status::ConnectionStatus;
