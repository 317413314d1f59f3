//! Façade (F): the single entry point a consumer talks to, per `spec.md`
//! §4.5/§6. Wires CM, OM, RM and NR together via the callbacks CM was
//! designed around, and owns the cross-component ordering rules that don't
//! belong to any one of them.

use std::sync::Arc;
use std::time::Duration;

use iobroker_bridge_commons::{Result, ServerConfig};
use once_cell::sync::OnceCell;
use serde_json::Value;
use tracing::instrument;

use crate::client::{ClientEvent, Connector, HistoryQuery, ObjectValue, StateValue};
use crate::connection::{ConnectionCallbacks, ConnectionManager, ConnectionState};
use crate::operation::OperationManager;
use crate::recovery::RecoveryManager;
use crate::registry::{ConsumerCallbacks, NodeRegistry};
use crate::server_id::{NodeId, ServerId};
use crate::status::ConnectionStatus;

const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(50);
const RESUBSCRIBE_PHASE_GAP: Duration = Duration::from_millis(100);

/// Snapshot returned by `getConnectionStatus`.
#[derive(Clone, Debug)]
pub struct ConnectionStatusSnapshot {
    pub state: ConnectionState,
    pub queue_depth: usize,
    pub recovery_in_progress: bool,
    pub consumer_count: i64,
    pub tls: bool,
    pub has_credentials: bool,
}

pub struct Facade<C: Connector + 'static> {
    cm: Arc<ConnectionManager<C>>,
    om: Arc<OperationManager<C>>,
    rm: Arc<RecoveryManager<C>>,
    nr: Arc<NodeRegistry<C>>,
}

impl<C: Connector + 'static> Facade<C> {
    pub fn new(connector: C) -> Arc<Self> {
        let cm_cell: Arc<OnceCell<Arc<ConnectionManager<C>>>> = Arc::new(OnceCell::new());
        let om_cell: Arc<OnceCell<Arc<OperationManager<C>>>> = Arc::new(OnceCell::new());
        let rm_cell: Arc<OnceCell<Arc<RecoveryManager<C>>>> = Arc::new(OnceCell::new());
        let nr_cell: Arc<OnceCell<Arc<NodeRegistry<C>>>> = Arc::new(OnceCell::new());

        let callbacks = ConnectionCallbacks {
            on_status: Self::on_status_callback(cm_cell.clone(), om_cell.clone(), rm_cell.clone(), nr_cell.clone()),
            on_error: Self::on_error_callback(rm_cell.clone()),
            on_event: Self::on_event_callback(nr_cell.clone()),
            on_destroyed: Self::on_destroyed_callback(om_cell.clone()),
        };

        let cm = ConnectionManager::new(connector, callbacks);
        let om = OperationManager::new(cm.clone(), Self::immediate_retry_callback(rm_cell.clone()));
        let rm = RecoveryManager::new(cm.clone());
        let nr = NodeRegistry::new(om.clone(), rm.clone());

        let _ = cm_cell.set(cm.clone());
        let _ = om_cell.set(om.clone());
        let _ = rm_cell.set(rm.clone());
        let _ = nr_cell.set(nr.clone());

        Arc::new(Self { cm, om, rm, nr })
    }

    fn immediate_retry_callback(rm_cell: Arc<OnceCell<Arc<RecoveryManager<C>>>>) -> Arc<dyn Fn(ServerId) + Send + Sync> {
        Arc::new(move |server_id| {
            let rm_cell = rm_cell.clone();
            tokio::spawn(async move {
                if let Some(rm) = rm_cell.get().cloned() {
                    rm.schedule_immediate_retry(&server_id).await;
                }
            });
        })
    }

    fn on_error_callback(rm_cell: Arc<OnceCell<Arc<RecoveryManager<C>>>>) -> Arc<dyn Fn(ServerId, String) + Send + Sync> {
        Arc::new(move |server_id, _message| {
            let rm_cell = rm_cell.clone();
            tokio::spawn(async move {
                if let Some(rm) = rm_cell.get().cloned() {
                    rm.handle_connection_error(&server_id).await;
                }
            });
        })
    }

    fn on_event_callback(nr_cell: Arc<OnceCell<Arc<NodeRegistry<C>>>>) -> Arc<dyn Fn(ServerId, ClientEvent) + Send + Sync> {
        Arc::new(move |server_id, event| {
            let nr_cell = nr_cell.clone();
            tokio::spawn(async move {
                let Some(nr) = nr_cell.get().cloned() else { return };
                match event {
                    ClientEvent::StateChange(id, value) => nr.handle_state_change(&server_id, &id, value).await,
                    ClientEvent::ObjectChange(id, value) => nr.handle_object_change(&server_id, &id, value).await,
                    ClientEvent::Log(entry) => nr.handle_log(&server_id, entry).await,
                    _ => {}
                }
            });
        })
    }

    fn on_destroyed_callback(om_cell: Arc<OnceCell<Arc<OperationManager<C>>>>) -> Arc<dyn Fn(ServerId) + Send + Sync> {
        Arc::new(move |server_id| {
            let om_cell = om_cell.clone();
            tokio::spawn(async move {
                if let Some(om) = om_cell.get().cloned() {
                    om.clear_with_destroyed(&server_id).await;
                }
            });
        })
    }

    fn on_status_callback(
        cm_cell: Arc<OnceCell<Arc<ConnectionManager<C>>>>, om_cell: Arc<OnceCell<Arc<OperationManager<C>>>>,
        rm_cell: Arc<OnceCell<Arc<RecoveryManager<C>>>>, nr_cell: Arc<OnceCell<Arc<NodeRegistry<C>>>>,
    ) -> Arc<dyn Fn(ServerId, ConnectionStatus) + Send + Sync> {
        Arc::new(move |server_id, status| {
            let (cm_cell, om_cell, rm_cell, nr_cell) = (cm_cell.clone(), om_cell.clone(), rm_cell.clone(), nr_cell.clone());
            tokio::spawn(async move {
                let (Some(cm), Some(om), Some(rm), Some(nr)) =
                    (cm_cell.get().cloned(), om_cell.get().cloned(), rm_cell.get().cloned(), nr_cell.get().cloned())
                else {
                    return;
                };
                Self::on_cm_status(cm, om, rm, nr, server_id, status).await;
            });
        })
    }

    /// The ordering rules of `spec.md` §4.5.
    async fn on_cm_status(
        cm: Arc<ConnectionManager<C>>, om: Arc<OperationManager<C>>, rm: Arc<RecoveryManager<C>>, nr: Arc<NodeRegistry<C>>,
        server_id: ServerId, status: ConnectionStatus,
    ) {
        match status {
            ConnectionStatus::Ready => {
                cm.set_recovery_in_progress(&server_id, false).await;
                nr.sync_all_node_statuses(&server_id).await;
                nr.execute_recovery_callbacks(&server_id).await;
                Self::spawn_resubscription_cycle(cm.clone(), nr.clone(), server_id.clone());
                om.drain(&server_id).await;
            }
            ConnectionStatus::FailedPermanently => {
                om.clear_with_auth_failure(&server_id).await;
                cm.set_recovery_in_progress(&server_id, false).await;
                nr.update_node_status(&server_id, status).await;
            }
            ConnectionStatus::Disconnected => {
                // CM's own generation/time-based guard already suppresses a
                // Network-classified event within the "recently successful"
                // window before this callback ever fires; this check is a
                // second, RM-accounting-level gate on top of that, per
                // spec.md §4.5's explicit wording.
                let already_recovering = cm.is_recovery_in_progress(&server_id).await;
                if !already_recovering && !cm.recently_successful(&server_id).await {
                    cm.set_recovery_in_progress(&server_id, true).await;
                    rm.handle_connection_error(&server_id).await;
                }
                nr.update_node_status(&server_id, status).await;
            }
            other => nr.update_node_status(&server_id, other).await,
        }
    }

    /// 50ms after CONNECTED, then state → 100ms → object → 100ms → log,
    /// each phase re-checking that the connection is still CONNECTED.
    fn spawn_resubscription_cycle(cm: Arc<ConnectionManager<C>>, nr: Arc<NodeRegistry<C>>, server_id: ServerId) {
        tokio::spawn(async move {
            tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            if cm.state(&server_id).await != ConnectionState::Connected {
                return;
            }
            nr.resubscribe_states(&server_id).await;

            tokio::time::sleep(RESUBSCRIBE_PHASE_GAP).await;
            if cm.state(&server_id).await != ConnectionState::Connected {
                return;
            }
            nr.resubscribe_objects(&server_id).await;

            tokio::time::sleep(RESUBSCRIBE_PHASE_GAP).await;
            if cm.state(&server_id).await != ConnectionState::Connected {
                return;
            }
            nr.resubscribe_logs(&server_id).await;

            nr.sync_all_node_statuses(&server_id).await;
        });
    }

    // ---- Consumer API, spec.md §6 ----

    #[instrument(skip(self, config, callbacks))]
    pub async fn register_for_events(&self, node_id: NodeId, server_id: ServerId, config: ServerConfig, callbacks: ConsumerCallbacks) {
        self.cm.get_connection(&server_id, config).await;
        self.nr.register_for_events(node_id, server_id, callbacks, false);
    }

    pub async fn subscribe(
        &self, node_id: NodeId, server_id: ServerId, config: ServerConfig, pattern: String, callbacks: ConsumerCallbacks,
        wants_initial_value: bool,
    ) -> Result<()> {
        self.cm.get_connection(&server_id, config).await;
        self.nr.subscribe(node_id, server_id, pattern, callbacks, wants_initial_value, false).await
    }

    pub async fn subscribe_multiple(
        &self, node_id: NodeId, server_id: ServerId, config: ServerConfig, ids: Vec<String>, callbacks: ConsumerCallbacks,
        wants_initial_value: bool,
    ) -> Result<Vec<String>> {
        self.cm.get_connection(&server_id, config).await;
        self.nr.subscribe_multiple(node_id, server_id, ids, callbacks, wants_initial_value, false).await
    }

    pub async fn subscribe_objects(
        &self, node_id: NodeId, server_id: ServerId, config: ServerConfig, pattern: String, callbacks: ConsumerCallbacks,
    ) -> Result<()> {
        self.cm.get_connection(&server_id, config).await;
        self.nr.subscribe_objects(node_id, server_id, pattern, callbacks, false).await
    }

    pub async fn subscribe_to_live_logs(
        &self, node_id: NodeId, server_id: ServerId, config: ServerConfig, callbacks: ConsumerCallbacks, level: String,
    ) -> Result<()> {
        self.cm.get_connection(&server_id, config).await;
        self.nr.subscribe_to_logs(node_id, server_id, callbacks, level, false).await
    }

    /// Covers `unsubscribe`, `unsubscribeObjects`, `unsubscribeLogs` and
    /// `unregisterFromEvents` from the consumer table: each registration is
    /// one `NodeId` of a single kind, so tearing it down is the same
    /// operation regardless of which of those names the caller used.
    pub async fn unsubscribe(&self, node_id: &NodeId) -> Result<()> {
        self.nr.unregister(node_id).await
    }

    pub async fn get_state(&self, server_id: &ServerId, id: String) -> Result<Option<StateValue>> {
        self.om.get_state(server_id, id).await
    }

    pub async fn set_state(&self, server_id: &ServerId, id: String, value: StateValue, now_ms: i64) -> Result<()> {
        self.om.set_state(server_id, id, value, now_ms).await
    }

    pub async fn get_states(&self, server_id: &ServerId, pattern: String) -> Result<Value> {
        self.om.get_states(server_id, pattern).await
    }

    pub async fn get_object(&self, server_id: &ServerId, id: String) -> Result<Option<ObjectValue>> {
        self.om.get_object(server_id, id).await
    }

    pub async fn set_object(&self, server_id: &ServerId, object: ObjectValue) -> Result<()> {
        self.om.set_object(server_id, object).await
    }

    pub async fn get_objects(&self, server_id: &ServerId, pattern: String, object_type: Option<String>) -> Result<Vec<ObjectValue>> {
        self.om.get_objects(server_id, pattern, object_type).await
    }

    pub async fn get_object_view(&self, server_id: &ServerId, design_id: String, search_id: String, params: Value) -> Result<Value> {
        self.om.get_object_view(server_id, design_id, search_id, params).await
    }

    pub async fn get_history(&self, server_id: &ServerId, adapter: String, id: String, options: HistoryQuery) -> Result<Vec<StateValue>> {
        self.om.get_history(server_id, adapter, id, options).await
    }

    pub async fn send_to_adapter(
        &self, server_id: &ServerId, adapter: String, command: Option<String>, message: Value, timeout: Option<Duration>,
    ) -> Result<Option<Value>> {
        self.om.send_to_adapter(server_id, adapter, command, message, timeout).await
    }

    /// Tears down `old_id` entirely and pre-seeds `new_id`, per `spec.md`
    /// §4.1/§6. Existing NR registrations are untouched: they keep pointing
    /// at their original `ServerId`, matching the consumer table's
    /// description of this call as a CM-level operation only.
    pub async fn force_server_switch(&self, old_id: &ServerId, new_id: &ServerId, new_config: ServerConfig) {
        self.cm.force_server_switch(old_id, new_id, new_config).await;
    }

    pub async fn get_connection_status(&self, server_id: &ServerId) -> ConnectionStatusSnapshot {
        let stored_config = self.cm.stored_config(server_id).await;
        ConnectionStatusSnapshot {
            state: self.cm.state(server_id).await,
            queue_depth: self.om.queue_depth(server_id).await,
            recovery_in_progress: self.cm.is_recovery_in_progress(server_id).await,
            consumer_count: self.rm.consumer_count(server_id),
            tls: stored_config.as_ref().map(|c| c.tls).unwrap_or(false),
            has_credentials: stored_config.as_ref().map(|c| c.user.is_some()).unwrap_or(false),
        }
    }

    /// Explicit close of one server, releasing its Client and StoredConfig.
    pub async fn close(&self, server_id: &ServerId) {
        self.cm.close(server_id).await;
    }

    /// Best-effort teardown of every known connection, for the graceful
    /// shutdown path.
    pub async fn shutdown(&self) {
        for server_id in self.cm.known_servers() {
            self.cm.close(&server_id).await;
        }
    }

    /// Blocks until SIGINT/SIGTERM, then runs [`Self::shutdown`]. A panic
    /// inside any spawned task stays isolated to that task; this is the
    /// only deliberate shutdown path the Façade owns.
    pub async fn run_until_shutdown(&self) {
        let _ = tokio::signal::ctrl_c().await;
        self.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockConnector;
    use crate::registry::NodeEvent;

    async fn drain(n: usize) {
        for _ in 0..n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn ready_drains_queue_and_resubscribes_before_status_settles() {
        let facade = Facade::new(MockConnector::new());
        let server_id = ServerId::new("h:1");
        let config = ServerConfig::new("h", 1);

        let statuses = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorded = statuses.clone();
        let callbacks = ConsumerCallbacks {
            on_event: Arc::new(|_| {}),
            update_status: Arc::new(move |status| recorded.lock().unwrap().push(status)),
            on_subscribed: None,
        };

        facade
            .subscribe(NodeId::new("n1"), server_id.clone(), config, "lights.*".to_string(), callbacks, false)
            .await
            .unwrap();
        drain(20).await;

        let snapshot = facade.get_connection_status(&server_id).await;
        assert_eq!(snapshot.state, ConnectionState::Connected);
        assert!(statuses.lock().unwrap().contains(&ConnectionStatus::Connected));
    }

    #[tokio::test]
    async fn auth_failure_rejects_a_pending_subscribe() {
        let connector = MockConnector::new();
        connector.push_connect_outcome(crate::client::mock::ConnectOutcome::Err("unauthorized".into())).await;
        let facade = Facade::new(connector);
        let server_id = ServerId::new("h:2");
        let config = ServerConfig::new("h", 2);

        let callbacks = ConsumerCallbacks {
            on_event: Arc::new(|_| {}),
            update_status: Arc::new(|_| {}),
            on_subscribed: None,
        };
        let err = facade
            .subscribe(NodeId::new("n9"), server_id.clone(), config, "lights.*".to_string(), callbacks, false)
            .await
            .unwrap_err();
        assert!(matches!(err, iobroker_bridge_commons::Error::NotReady(_)));
        drain(10).await;
        assert_eq!(facade.get_connection_status(&server_id).await.state, ConnectionState::AuthFailed);
    }

    #[tokio::test]
    async fn state_change_after_resubscription_reaches_the_consumer() {
        let facade = Facade::new(MockConnector::new());
        let server_id = ServerId::new("h:3");
        let config = ServerConfig::new("h", 3);

        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorded = events.clone();
        let callbacks = ConsumerCallbacks {
            on_event: Arc::new(move |event| recorded.lock().unwrap().push(event)),
            update_status: Arc::new(|_| {}),
            on_subscribed: None,
        };
        facade
            .subscribe(NodeId::new("n2"), server_id.clone(), config, "sensors.temp".to_string(), callbacks, false)
            .await
            .unwrap();
        drain(20).await;

        facade
            .nr
            .handle_state_change(&server_id, "sensors.temp", StateValue::new(serde_json::json!(21.5), true))
            .await;
        drain(10).await;

        let recorded = events.lock().unwrap();
        assert!(recorded.iter().any(|e| matches!(e, NodeEvent::State { id, .. } if id == "sensors.temp")));
    }
}
