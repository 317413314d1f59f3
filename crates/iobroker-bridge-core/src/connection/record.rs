use std::sync::Arc;
use std::time::Instant;

use iobroker_bridge_commons::ServerConfig;
use tokio::task::JoinHandle;

use crate::client::Client;
use crate::server_id::{ConfigHash, Generation};

/// The seven states of the per-`ServerId` connection state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    AuthFailed,
    NetworkError,
    RetryScheduled,
    Destroying,
}

/// One per `ServerId`. Owned exclusively by the `ConnectionManager`; every
/// mutation happens under the per-record `tokio::sync::Mutex` that wraps
/// this struct.
pub struct ConnectionRecord<C: Client> {
    pub state: ConnectionState,
    pub client: Option<Arc<C>>,
    pub generation: Generation,
    pub stored_config: Option<ServerConfig>,
    pub config_hash: Option<ConfigHash>,
    pub last_error: Option<String>,
    pub last_success: Option<Instant>,
    pub recovery_in_progress: bool,
    pub retry_handle: Option<JoinHandle<()>>,
    /// `true` while a `connect()` call is in flight for this generation;
    /// an error event is only processed while this is true, and
    /// processing it clears the flag (the "in-flight-connection future"
    /// invariant from the data model).
    pub connecting: bool,
}

impl<C: Client> Default for ConnectionRecord<C> {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            client: None,
            generation: Generation::INITIAL,
            stored_config: None,
            config_hash: None,
            last_error: None,
            last_success: None,
            recovery_in_progress: false,
            retry_handle: None,
            connecting: false,
        }
    }
}

impl<C: Client> ConnectionRecord<C> {
    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Connected
            && self.client.as_deref().is_some_and(Client::is_ready)
    }

    pub fn cancel_retry(&mut self) {
        if let Some(handle) = self.retry_handle.take() {
            handle.abort();
        }
    }

    pub fn recently_successful(&self, within: std::time::Duration) -> bool {
        self.last_success.is_some_and(|t| t.elapsed() < within)
    }
}
