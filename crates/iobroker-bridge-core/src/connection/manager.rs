use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use iobroker_bridge_commons::ServerConfig;
use rand::RngExt;
use tokio::sync::Mutex;
use tracing::instrument;

use crate::classify::{classify, FailureClass};
use crate::client::{Client, ClientEvent, Connector};
use crate::server_id::{ConfigHash, Generation, ServerId};
use crate::status::ConnectionStatus;

use super::record::{ConnectionRecord, ConnectionState};

const RETRY_BASE: Duration = Duration::from_millis(5000);
const RETRY_JITTER_MAX_MS: u64 = 2000;
const IMMEDIATE_RETRY_DELAY: Duration = Duration::from_millis(100);
const RETRY_COOLDOWN: Duration = Duration::from_secs(10);
const RECENTLY_SUCCESSFUL_WINDOW: Duration = Duration::from_secs(5);

/// The three outcomes [`ConnectionManager::get_connection`] can return, per
/// `spec.md` §4.1: a usable client, "start one / join the one in flight",
/// or a terminal rejection.
pub enum ConnectionOutcome<C> {
    Ready(Arc<C>),
    Pending,
    Failed,
}

/// Callbacks injected at wiring time so CM never holds a back-reference to
/// the Façade, OM, RM or NR (per the "all cross-component communication is
/// via documented callbacks" ownership rule).
#[derive(Clone)]
pub struct ConnectionCallbacks {
    /// Invoked on every state-machine transition that has a consumer-visible
    /// status.
    pub on_status: Arc<dyn Fn(ServerId, ConnectionStatus) + Send + Sync>,
    /// Invoked once per processed error/disconnect with the raw message, so
    /// the Façade can apply the "recently successful" guard and ask RM to
    /// schedule recovery.
    pub on_error: Arc<dyn Fn(ServerId, String) + Send + Sync>,
    /// Forwards everything that isn't connection bookkeeping (state/object
    /// changes, logs, token refresh) to the Node Registry.
    pub on_event: Arc<dyn Fn(ServerId, ClientEvent) + Send + Sync>,
    /// Invoked whenever a `Client` is torn down under `DESTROYING`
    /// (explicit close, force-switch, or a config-hash change forcing a
    /// reconnect) so the Façade can reject anything still queued for this
    /// `ServerId` with "Connection destroyed".
    pub on_destroyed: Arc<dyn Fn(ServerId) + Send + Sync>,
}

/// Owns the per-`ServerId` connection state machine and `Client` instances.
/// Grounded on the teacher's pooled-shared-client manager: one logical
/// connection multiplexed across consumers, keyed by a stable id, torn down
/// and recreated wholesale on a credential/endpoint change.
pub struct ConnectionManager<C: Connector> {
    connector: C,
    callbacks: ConnectionCallbacks,
    records: DashMap<ServerId, Arc<Mutex<ConnectionRecord<C::Client>>>>,
}

impl<C: Connector + 'static> ConnectionManager<C> {
    pub fn new(connector: C, callbacks: ConnectionCallbacks) -> Arc<Self> {
        Arc::new(Self {
            connector,
            callbacks,
            records: DashMap::new(),
        })
    }

    fn record(&self, server_id: &ServerId) -> Arc<Mutex<ConnectionRecord<C::Client>>> {
        self.records
            .entry(server_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ConnectionRecord::default())))
            .clone()
    }

    pub async fn state(&self, server_id: &ServerId) -> ConnectionState {
        self.record(server_id).lock().await.state
    }

    pub async fn is_ready(&self, server_id: &ServerId) -> bool {
        self.record(server_id).lock().await.is_ready()
    }

    pub async fn stored_config(&self, server_id: &ServerId) -> Option<ServerConfig> {
        self.record(server_id).lock().await.stored_config.clone()
    }

    pub async fn recently_successful(&self, server_id: &ServerId) -> bool {
        self.record(server_id)
            .lock()
            .await
            .recently_successful(RECENTLY_SUCCESSFUL_WINDOW)
    }

    pub async fn is_recovery_in_progress(&self, server_id: &ServerId) -> bool {
        self.record(server_id).lock().await.recovery_in_progress
    }

    /// Every `ServerId` this manager has ever seen an operation or
    /// registration for, used by the Façade's shutdown handler.
    pub fn known_servers(&self) -> Vec<ServerId> {
        self.records.iter().map(|entry| entry.key().clone()).collect()
    }

    pub async fn set_recovery_in_progress(&self, server_id: &ServerId, value: bool) {
        self.record(server_id).lock().await.recovery_in_progress = value;
    }

    /// `get_connection` from `spec.md` §4.1.
    #[instrument(skip(self, config))]
    pub async fn get_connection(
        self: &Arc<Self>, server_id: &ServerId, config: ServerConfig,
    ) -> ConnectionOutcome<C::Client> {
        let new_hash = ConfigHash::of(&config);
        let rec_handle = self.record(server_id);

        let needs_reconnect = {
            let rec = rec_handle.lock().await;
            rec.state == ConnectionState::Connected
                && rec.is_ready()
                && rec.config_hash != Some(new_hash)
        };
        if needs_reconnect {
            self.teardown(server_id, ConnectionState::Idle).await;
        }

        let mut rec = rec_handle.lock().await;
        if rec.state == ConnectionState::Connected && rec.is_ready() {
            return ConnectionOutcome::Ready(rec.client.clone().expect("connected implies client"));
        }

        match rec.state {
            ConnectionState::Idle => {
                rec.state = ConnectionState::Connecting;
                rec.stored_config = Some(config.clone());
                rec.config_hash = Some(new_hash);
                rec.connecting = true;
                let generation = rec.generation;
                drop(rec);
                (self.callbacks.on_status)(server_id.clone(), ConnectionStatus::Connecting);
                self.spawn_connect(server_id.clone(), config, generation);
                ConnectionOutcome::Pending
            }
            ConnectionState::Connecting | ConnectionState::RetryScheduled | ConnectionState::NetworkError => {
                ConnectionOutcome::Pending
            }
            ConnectionState::AuthFailed | ConnectionState::Destroying | ConnectionState::Connected => {
                ConnectionOutcome::Failed
            }
        }
    }

    fn spawn_connect(self: &Arc<Self>, server_id: ServerId, config: ServerConfig, generation: Generation) {
        let this = self.clone();
        tokio::spawn(async move {
            match this.connector.connect(&config).await {
                Ok((client, events_rx)) => this.on_connect_ok(server_id, client, events_rx, generation).await,
                Err(err) => this.on_connect_err(&server_id, err.to_string(), generation).await,
            }
        });
    }

    async fn on_connect_ok(
        self: Arc<Self>, server_id: ServerId, client: C::Client,
        mut events_rx: tokio::sync::mpsc::UnboundedReceiver<ClientEvent>, generation: Generation,
    ) {
        {
            let rec_handle = self.record(&server_id);
            let mut rec = rec_handle.lock().await;
            if rec.generation != generation || rec.state == ConnectionState::Destroying {
                return;
            }
            rec.client = Some(Arc::new(client));
        }

        while let Some(event) = events_rx.recv().await {
            self.handle_client_event(&server_id, generation, event).await;
        }
    }

    async fn handle_client_event(self: &Arc<Self>, server_id: &ServerId, generation: Generation, event: ClientEvent) {
        match event {
            ClientEvent::Ready => self.on_ready(server_id, generation).await,
            ClientEvent::Disconnect(reason) => self.on_wire_error(server_id, generation, reason, true).await,
            ClientEvent::Error(message) => self.on_wire_error(server_id, generation, message, false).await,
            other => (self.callbacks.on_event)(server_id.clone(), other),
        }
    }

    async fn on_ready(self: &Arc<Self>, server_id: &ServerId, generation: Generation) {
        let rec_handle = self.record(server_id);
        {
            let mut rec = rec_handle.lock().await;
            if rec.generation != generation || rec.state == ConnectionState::Destroying {
                return;
            }
            rec.state = ConnectionState::Connected;
            rec.connecting = false;
            rec.last_success = Some(std::time::Instant::now());
            rec.cancel_retry();
        }
        (self.callbacks.on_status)(server_id.clone(), ConnectionStatus::Ready);
    }

    /// Handles both `error` (classified auth/network) and `disconnect`
    /// (always network) wire events, applying generation-based duplicate
    /// suppression and the "recently successful" guard before transitioning.
    async fn on_wire_error(
        self: &Arc<Self>, server_id: &ServerId, generation: Generation, message: String, is_disconnect: bool,
    ) {
        let rec_handle = self.record(server_id);
        let (class, status);
        {
            let mut rec = rec_handle.lock().await;
            if rec.generation != generation || rec.state == ConnectionState::Destroying {
                return;
            }
            // Duplicate-event suppression: once a generation has already
            // left CONNECTING/CONNECTED, a second error for it is a no-op.
            if !matches!(rec.state, ConnectionState::Connecting | ConnectionState::Connected) {
                return;
            }

            class = if is_disconnect { FailureClass::Network } else { classify(&message) };
            if class == FailureClass::Network && rec.recently_successful(RECENTLY_SUCCESSFUL_WINDOW) {
                return;
            }

            rec.connecting = false;
            rec.last_error = Some(message.clone());
            rec.client = None;
            rec.state = match class {
                FailureClass::Auth => ConnectionState::AuthFailed,
                FailureClass::Network => ConnectionState::NetworkError,
            };
            status = match class {
                FailureClass::Auth => ConnectionStatus::FailedPermanently,
                FailureClass::Network if is_disconnect => ConnectionStatus::Disconnected,
                FailureClass::Network => ConnectionStatus::Reconnecting,
            };
        }

        (self.callbacks.on_status)(server_id.clone(), status);
        (self.callbacks.on_error)(server_id.clone(), message);
    }

    async fn on_connect_err(self: &Arc<Self>, server_id: &ServerId, message: String, generation: Generation) {
        let rec_handle = self.record(server_id);
        let class;
        {
            let mut rec = rec_handle.lock().await;
            if rec.generation != generation || rec.state == ConnectionState::Destroying {
                return;
            }
            rec.connecting = false;
            rec.last_error = Some(message.clone());
            rec.client = None;
            class = classify(&message);
            rec.state = match class {
                FailureClass::Auth => ConnectionState::AuthFailed,
                FailureClass::Network => ConnectionState::NetworkError,
            };
        }

        let status = match class {
            FailureClass::Auth => ConnectionStatus::FailedPermanently,
            FailureClass::Network => ConnectionStatus::Reconnecting,
        };
        (self.callbacks.on_status)(server_id.clone(), status);
        (self.callbacks.on_error)(server_id.clone(), message);

        if class == FailureClass::Network {
            let this = self.clone();
            let sid = server_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(RETRY_COOLDOWN).await;
                this.arm_retry(&sid, Self::jittered_retry_delay()).await;
            });
        }
    }

    fn jittered_retry_delay() -> Duration {
        let jitter = rand::rng().random_range(0..=RETRY_JITTER_MAX_MS);
        RETRY_BASE + Duration::from_millis(jitter)
    }

    /// Arms the base+jitter retry timer. Called by RM after it has checked
    /// consumer-count > 0.
    pub async fn schedule_retry(self: &Arc<Self>, server_id: &ServerId) {
        self.arm_retry(server_id, Self::jittered_retry_delay()).await;
    }

    /// Arms the 100ms immediate-retry variant, used when an operation
    /// arrives at an IDLE server with `StoredConfig`.
    pub async fn schedule_immediate_retry(self: &Arc<Self>, server_id: &ServerId) {
        self.arm_retry(server_id, IMMEDIATE_RETRY_DELAY).await;
    }

    async fn arm_retry(self: &Arc<Self>, server_id: &ServerId, delay: Duration) {
        let rec_handle = self.record(server_id);
        let generation = {
            let mut rec = rec_handle.lock().await;
            if matches!(rec.state, ConnectionState::AuthFailed | ConnectionState::Destroying) {
                return;
            }
            rec.cancel_retry();
            rec.state = ConnectionState::RetryScheduled;
            rec.generation
        };
        (self.callbacks.on_status)(server_id.clone(), ConnectionStatus::Retrying);

        let this = self.clone();
        let sid = server_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.fire_retry(&sid, generation).await;
        });
        rec_handle.lock().await.retry_handle = Some(handle);
    }

    async fn fire_retry(self: &Arc<Self>, server_id: &ServerId, generation: Generation) {
        let rec_handle = self.record(server_id);
        let config = {
            let mut rec = rec_handle.lock().await;
            if rec.generation != generation || rec.state != ConnectionState::RetryScheduled {
                return;
            }
            rec.retry_handle = None;
            rec.state = ConnectionState::Connecting;
            rec.connecting = true;
            rec.stored_config.clone()
        };
        let Some(config) = config else { return };
        (self.callbacks.on_status)(server_id.clone(), ConnectionStatus::Connecting);
        self.spawn_connect(server_id.clone(), config, generation);
    }

    /// `force_server_switch` from `spec.md` §4.1: tears down `old_id`
    /// entirely (including `StoredConfig`), then pre-seeds `new_id`'s
    /// `ConfigHash`/`StoredConfig` so the next `get_connection` for it
    /// starts a connection cleanly.
    pub async fn force_server_switch(self: &Arc<Self>, old_id: &ServerId, new_id: &ServerId, new_config: ServerConfig) {
        self.teardown(old_id, ConnectionState::Idle).await;
        self.record(old_id).lock().await.stored_config = None;

        let new_hash = ConfigHash::of(&new_config);
        let new_rec_handle = self.record(new_id);
        let mut new_rec = new_rec_handle.lock().await;
        new_rec.config_hash = Some(new_hash);
        new_rec.stored_config = Some(new_config);
    }

    pub async fn close(self: &Arc<Self>, server_id: &ServerId) {
        self.teardown(server_id, ConnectionState::Idle).await;
        self.record(server_id).lock().await.stored_config = None;
    }

    /// Forces `DESTROYING`, cancels any retry timer, bumps the generation so
    /// every in-flight task for the old generation becomes a no-op, destroys
    /// the `Client` if one exists, then settles into `target_state`.
    async fn teardown(self: &Arc<Self>, server_id: &ServerId, target_state: ConnectionState) {
        let rec_handle = self.record(server_id);
        let client = {
            let mut rec = rec_handle.lock().await;
            rec.state = ConnectionState::Destroying;
            rec.cancel_retry();
            rec.generation = rec.generation.next();
            rec.connecting = false;
            rec.client.take()
        };

        if let Some(client) = client {
            client.destroy().await;
        }

        (self.callbacks.on_status)(server_id.clone(), ConnectionStatus::Disconnected);
        (self.callbacks.on_destroyed)(server_id.clone());
        rec_handle.lock().await.state = target_state;
    }

    /// Returns the current ready client, or `None` if the connection isn't
    /// usable right now. Unlike [`Self::get_connection`] this never starts a
    /// connection attempt; it is the read-only accessor OM uses to decide
    /// whether to run an op-fn directly or enqueue it.
    pub async fn current_client(&self, server_id: &ServerId) -> Option<Arc<C::Client>> {
        let rec_handle = self.record(server_id);
        let rec = rec_handle.lock().await;
        if rec.is_ready() {
            rec.client.clone()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use iobroker_bridge_commons::ServerConfig;

    use super::*;
    use crate::client::mock::{ConnectOutcome, MockConnector};

    fn test_callbacks() -> (ConnectionCallbacks, Arc<StdMutex<Vec<(ServerId, ConnectionStatus)>>>) {
        let statuses = Arc::new(StdMutex::new(Vec::new()));
        let recorded = statuses.clone();
        let callbacks = ConnectionCallbacks {
            on_status: Arc::new(move |id, status| recorded.lock().unwrap().push((id, status))),
            on_error: Arc::new(|_, _| {}),
            on_event: Arc::new(|_, _| {}),
            on_destroyed: Arc::new(|_| {}),
        };
        (callbacks, statuses)
    }

    async fn drain(n: usize) {
        for _ in 0..n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn successful_connect_reaches_connected() {
        let connector = MockConnector::new();
        let (callbacks, statuses) = test_callbacks();
        let cm = ConnectionManager::new(connector, callbacks);
        let server_id = ServerId::new("h:1");
        let config = ServerConfig::new("h", 1);

        let outcome = cm.get_connection(&server_id, config).await;
        assert!(matches!(outcome, ConnectionOutcome::Pending));
        drain(20).await;

        assert_eq!(cm.state(&server_id).await, ConnectionState::Connected);
        assert!(cm.is_ready(&server_id).await);
        assert!(statuses.lock().unwrap().iter().any(|(_, s)| *s == ConnectionStatus::Ready));
    }

    #[tokio::test]
    async fn auth_failure_is_terminal() {
        let connector = MockConnector::new();
        connector.push_connect_outcome(ConnectOutcome::Err("invalid credentials".into())).await;
        let (callbacks, _statuses) = test_callbacks();
        let cm = ConnectionManager::new(connector, callbacks);
        let server_id = ServerId::new("h:2");
        let config = ServerConfig::new("h", 2);

        cm.get_connection(&server_id, config.clone()).await;
        drain(5).await;

        assert_eq!(cm.state(&server_id).await, ConnectionState::AuthFailed);

        let second = cm.get_connection(&server_id, config).await;
        assert!(matches!(second, ConnectionOutcome::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_retry_from_idle_reaches_connected() {
        let connector = MockConnector::new();
        let (callbacks, _statuses) = test_callbacks();
        let cm = ConnectionManager::new(connector, callbacks);
        let server_id = ServerId::new("h:3");
        let config = ServerConfig::new("h", 3);

        cm.get_connection(&server_id, config.clone()).await;
        drain(5).await;
        assert_eq!(cm.state(&server_id).await, ConnectionState::Connected);

        // force it back to idle with stored config still present, mimicking
        // the IDLE-with-StoredConfig branch OM drives via `schedule_immediate_retry`.
        cm.close(&server_id).await;
        cm.record(&server_id).lock().await.stored_config = Some(config);

        cm.schedule_immediate_retry(&server_id).await;
        tokio::time::advance(Duration::from_millis(150)).await;
        drain(20).await;

        assert_eq!(cm.state(&server_id).await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn stale_generation_events_are_dropped() {
        let connector = MockConnector::new();
        let (callbacks, statuses) = test_callbacks();
        let cm = ConnectionManager::new(connector, callbacks);
        let server_id = ServerId::new("h:4");
        let config = ServerConfig::new("h", 4);

        cm.get_connection(&server_id, config).await;
        drain(5).await;
        assert_eq!(cm.state(&server_id).await, ConnectionState::Connected);

        cm.close(&server_id).await;
        drain(5).await;

        // A stray Ready for the old (now-stale) generation must not revive it.
        cm.on_ready(&server_id, Generation::INITIAL).await;
        assert_eq!(cm.state(&server_id).await, ConnectionState::Idle);
        let _ = statuses;
    }
}
