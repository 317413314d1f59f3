use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use iobroker_bridge_commons::Result;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::client::{Connector, LogEntry, ObjectValue, StateValue};
use crate::operation::OperationManager;
use crate::recovery::RecoveryManager;
use crate::server_id::{NodeId, ServerId};
use crate::status::ConnectionStatus;

use super::subscription_index::SubscriptionIndex;

const GROUPED_INITIAL_DEADLINE: Duration = Duration::from_millis(3000);

/// What a consumer's `on_event` hook receives, per `spec.md` §4.4.
#[derive(Clone, Debug)]
pub enum NodeEvent {
    State { id: String, value: StateValue, initial: bool },
    StateGroup { values: HashMap<String, StateValue>, initial: bool },
    Object { id: String, value: Option<ObjectValue> },
    Log(LogEntry),
}

/// The sealed capability set a consumer registers, replacing the ad-hoc
/// per-callback members of the REDESIGN FLAGS list: `onReconnect` and
/// `onDisconnect` are folded into `update_status`'s `ConnectionStatus`
/// variants rather than kept as separate hooks.
#[derive(Clone)]
pub struct ConsumerCallbacks {
    pub on_event: Arc<dyn Fn(NodeEvent) + Send + Sync>,
    pub update_status: Arc<dyn Fn(ConnectionStatus) + Send + Sync>,
    pub on_subscribed: Option<Arc<dyn Fn() + Send + Sync>>,
}

#[derive(Clone, Debug)]
enum RegistrationKind {
    State { pattern: String },
    StateMulti { ids: Vec<String> },
    ObjectPattern { pattern: String },
    EventsOnly,
    Logs,
}

struct Registration {
    server_id: ServerId,
    kind: RegistrationKind,
    callbacks: ConsumerCallbacks,
    wants_initial_value: bool,
    initial_values: HashMap<String, StateValue>,
    grouped_initial_sent: bool,
    grouped_deadline: Option<JoinHandle<()>>,
}

/// Node Registry (NR): consumer lifecycle, event routing and
/// resubscription, per `spec.md` §4.4.
pub struct NodeRegistry<C: Connector + 'static> {
    om: Arc<OperationManager<C>>,
    rm: Arc<RecoveryManager<C>>,
    registrations: DashMap<NodeId, Arc<Mutex<Registration>>>,
    server_nodes: DashMap<ServerId, Arc<DashSet<NodeId>>>,
    indexes: DashMap<ServerId, Arc<RwLock<SubscriptionIndex>>>,
    log_levels: DashMap<ServerId, Arc<DashSet<String>>>,
}

impl<C: Connector + 'static> NodeRegistry<C> {
    pub fn new(om: Arc<OperationManager<C>>, rm: Arc<RecoveryManager<C>>) -> Arc<Self> {
        Arc::new(Self {
            om,
            rm,
            registrations: DashMap::new(),
            server_nodes: DashMap::new(),
            indexes: DashMap::new(),
            log_levels: DashMap::new(),
        })
    }

    fn index(&self, server_id: &ServerId) -> Arc<RwLock<SubscriptionIndex>> {
        self.indexes
            .entry(server_id.clone())
            .or_insert_with(|| Arc::new(RwLock::new(SubscriptionIndex::default())))
            .clone()
    }

    fn server_nodes(&self, server_id: &ServerId) -> Arc<DashSet<NodeId>> {
        self.server_nodes.entry(server_id.clone()).or_insert_with(|| Arc::new(DashSet::new())).clone()
    }

    fn log_levels(&self, server_id: &ServerId) -> Arc<DashSet<String>> {
        self.log_levels.entry(server_id.clone()).or_insert_with(|| Arc::new(DashSet::new())).clone()
    }

    fn register(&self, node_id: NodeId, server_id: ServerId, kind: RegistrationKind, callbacks: ConsumerCallbacks, wants_initial_value: bool) {
        let registration = Arc::new(Mutex::new(Registration {
            server_id: server_id.clone(),
            kind,
            callbacks,
            wants_initial_value,
            initial_values: HashMap::new(),
            grouped_initial_sent: false,
            grouped_deadline: None,
        }));
        self.registrations.insert(node_id.clone(), registration);
        self.server_nodes(&server_id).insert(node_id);
    }

    async fn mark_subscribed(&self, node_id: &NodeId) {
        let Some(reg) = self.registrations.get(node_id).map(|r| r.clone()) else { return };
        let reg = reg.lock().await;
        if let Some(cb) = &reg.callbacks.on_subscribed {
            cb();
        }
    }

    // ---- Public operations, spec.md §4.4 ----

    #[instrument(skip(self, callbacks))]
    pub async fn subscribe(
        self: &Arc<Self>, node_id: NodeId, server_id: ServerId, pattern: String, callbacks: ConsumerCallbacks,
        wants_initial_value: bool, is_recovery: bool,
    ) -> Result<()> {
        if !is_recovery {
            self.rm.increment(&server_id);
            self.register(node_id.clone(), server_id.clone(), RegistrationKind::State { pattern: pattern.clone() }, callbacks, wants_initial_value);
            self.index(&server_id).write().await.add_state(node_id.clone(), &pattern)?;
        }

        self.om.subscribe(&server_id, pattern.clone()).await?;
        self.mark_subscribed(&node_id).await;

        if !is_recovery && wants_initial_value && !pattern.contains('*') {
            self.emit_single_initial_value(&server_id, &node_id, &pattern).await;
        }
        Ok(())
    }

    /// Best-effort per-id subscribe; returns the subset that succeeded.
    pub async fn subscribe_multiple(
        self: &Arc<Self>, node_id: NodeId, server_id: ServerId, ids: Vec<String>, callbacks: ConsumerCallbacks,
        wants_initial_value: bool, is_recovery: bool,
    ) -> Result<Vec<String>> {
        if !is_recovery {
            self.rm.increment(&server_id);
            self.register(node_id.clone(), server_id.clone(), RegistrationKind::StateMulti { ids: ids.clone() }, callbacks, wants_initial_value);
            let index = self.index(&server_id);
            let mut index = index.write().await;
            for id in &ids {
                index.add_state(node_id.clone(), id)?;
            }
        }

        let mut succeeded = Vec::new();
        for id in &ids {
            if self.om.subscribe(&server_id, id.clone()).await.is_ok() {
                succeeded.push(id.clone());
            }
        }
        self.mark_subscribed(&node_id).await;

        if !is_recovery && wants_initial_value && !succeeded.is_empty() {
            self.spawn_grouped_initial_deadline(node_id).await;
        }
        Ok(succeeded)
    }

    pub async fn subscribe_objects(
        self: &Arc<Self>, node_id: NodeId, server_id: ServerId, pattern: String, callbacks: ConsumerCallbacks, is_recovery: bool,
    ) -> Result<()> {
        if !is_recovery {
            self.rm.increment(&server_id);
            self.register(node_id.clone(), server_id.clone(), RegistrationKind::ObjectPattern { pattern: pattern.clone() }, callbacks, false);
            self.index(&server_id).write().await.add_object(node_id.clone(), &pattern)?;
        }
        self.om.subscribe_objects(&server_id, pattern).await?;
        self.mark_subscribed(&node_id).await;
        Ok(())
    }

    pub fn register_for_events(self: &Arc<Self>, node_id: NodeId, server_id: ServerId, callbacks: ConsumerCallbacks, is_recovery: bool) {
        if !is_recovery {
            self.rm.increment(&server_id);
            self.register(node_id, server_id, RegistrationKind::EventsOnly, callbacks, false);
        }
    }

    pub async fn subscribe_to_logs(
        self: &Arc<Self>, node_id: NodeId, server_id: ServerId, callbacks: ConsumerCallbacks, level: String, is_recovery: bool,
    ) -> Result<()> {
        if !is_recovery {
            self.rm.increment(&server_id);
            self.register(node_id.clone(), server_id.clone(), RegistrationKind::Logs, callbacks, false);
            self.index(&server_id).write().await.add_log(node_id.clone());
            self.log_levels(&server_id).insert(level.clone());
        }
        self.om.subscribe_logs(&server_id, level).await?;
        self.mark_subscribed(&node_id).await;
        Ok(())
    }

    /// Tears down a registration of any kind: wire unsubscribe (best-effort,
    /// never rejects), index cleanup, and consumer-count decrement.
    pub async fn unregister(self: &Arc<Self>, node_id: &NodeId) -> Result<()> {
        let Some((_, registration)) = self.registrations.remove(node_id) else { return Ok(()) };
        let server_id = {
            let mut reg = registration.lock().await;
            let server_id = reg.server_id.clone();
            if let Some(handle) = reg.grouped_deadline.take() {
                handle.abort();
            }

            match reg.kind.clone() {
                RegistrationKind::State { pattern } => {
                    self.index(&server_id).write().await.remove_state(node_id, &pattern);
                    let _ = self.om.unsubscribe(&server_id, pattern).await;
                }
                RegistrationKind::StateMulti { ids } => {
                    let index = self.index(&server_id);
                    let mut index = index.write().await;
                    for id in ids {
                        index.remove_state(node_id, &id);
                        let _ = self.om.unsubscribe(&server_id, id).await;
                    }
                }
                RegistrationKind::ObjectPattern { pattern } => {
                    self.index(&server_id).write().await.remove_object(node_id, &pattern);
                    let _ = self.om.unsubscribe_objects(&server_id, pattern).await;
                }
                RegistrationKind::Logs => {
                    self.index(&server_id).write().await.remove_log(node_id);
                    let has_listeners = self.index(&server_id).read().await.has_log_listeners();
                    if !has_listeners {
                        let _ = self.om.unsubscribe_logs(&server_id).await;
                    }
                }
                RegistrationKind::EventsOnly => {}
            }
            server_id
        };

        self.server_nodes(&server_id).remove(node_id);
        self.rm.decrement(&server_id);
        Ok(())
    }

    // ---- Internal ops, spec.md §4.4 ----

    pub async fn handle_state_change(&self, server_id: &ServerId, id: &str, value: StateValue) {
        let nodes = {
            let index = self.index(server_id);
            let index = index.read().await;
            index.match_state(id)
        };
        for node_id in nodes {
            let Some(reg) = self.registrations.get(&node_id).map(|r| r.clone()) else { continue };
            let mut reg = reg.lock().await;
            if let RegistrationKind::StateMulti { ids } = reg.kind.clone() {
                if !reg.grouped_initial_sent && reg.wants_initial_value && ids.contains(&id.to_string()) {
                    reg.initial_values.insert(id.to_string(), value.clone());
                    if ids.iter().all(|i| reg.initial_values.contains_key(i)) {
                        self.flush_grouped_initial_value(&mut reg);
                    }
                    continue;
                }
            }
            (reg.callbacks.on_event)(NodeEvent::State { id: id.to_string(), value: value.clone(), initial: false });
        }
    }

    pub async fn handle_object_change(&self, server_id: &ServerId, id: &str, value: Option<ObjectValue>) {
        let nodes = {
            let index = self.index(server_id);
            let index = index.read().await;
            index.match_object(id)
        };
        for node_id in nodes {
            if let Some(reg) = self.registrations.get(&node_id).map(|r| r.clone()) {
                let reg = reg.lock().await;
                (reg.callbacks.on_event)(NodeEvent::Object { id: id.to_string(), value: value.clone() });
            }
        }
    }

    pub async fn handle_log(&self, server_id: &ServerId, entry: LogEntry) {
        let nodes = {
            let index = self.index(server_id);
            let index = index.read().await;
            index.log_listeners()
        };
        for node_id in nodes {
            if let Some(reg) = self.registrations.get(&node_id).map(|r| r.clone()) {
                let reg = reg.lock().await;
                (reg.callbacks.on_event)(NodeEvent::Log(entry.clone()));
            }
        }
    }

    pub async fn update_node_status(&self, server_id: &ServerId, status: ConnectionStatus) {
        let nodes: Vec<NodeId> = self.server_nodes(server_id).iter().map(|n| n.clone()).collect();
        for node_id in nodes {
            if let Some(reg) = self.registrations.get(&node_id).map(|r| r.clone()) {
                (reg.lock().await.callbacks.update_status)(status);
            }
        }
    }

    /// Settles every still-registered consumer on `Connected` once
    /// resubscription has completed; see the doc comment on
    /// [`ConnectionStatus`].
    pub async fn sync_all_node_statuses(&self, server_id: &ServerId) {
        self.update_node_status(server_id, ConnectionStatus::Connected).await;
    }

    /// Re-issues one `subscribe` per distinct pattern currently held in the
    /// index, as a recovery call (no consumer-count change).
    pub async fn resubscribe_states(&self, server_id: &ServerId) {
        let patterns = {
            let index = self.index(server_id);
            let index = index.read().await;
            index.state_patterns()
        };
        for pattern in patterns {
            let _ = self.om.subscribe(server_id, pattern).await;
        }
    }

    pub async fn resubscribe_objects(&self, server_id: &ServerId) {
        let patterns = {
            let index = self.index(server_id);
            let index = index.read().await;
            index.object_patterns()
        };
        for pattern in patterns {
            let _ = self.om.subscribe_objects(server_id, pattern).await;
        }
    }

    pub async fn resubscribe_logs(&self, server_id: &ServerId) {
        let has_listeners = {
            let index = self.index(server_id);
            let index = index.read().await;
            index.has_log_listeners()
        };
        if !has_listeners {
            return;
        }
        let levels: Vec<String> = self.log_levels(server_id).iter().map(|l| l.clone()).collect();
        for level in levels {
            let _ = self.om.subscribe_logs(server_id, level).await;
        }
    }

    /// Delegates to RM, which exclusively owns the pending recovery-callback
    /// list per `spec.md` §3.
    pub async fn execute_recovery_callbacks(&self, server_id: &ServerId) {
        self.rm.execute_recovery_callbacks(server_id).await;
    }

    async fn emit_single_initial_value(&self, server_id: &ServerId, node_id: &NodeId, id: &str) {
        let Ok(Some(value)) = self.om.get_state(server_id, id.to_string()).await else { return };
        let Some(reg) = self.registrations.get(node_id).map(|r| r.clone()) else { return };
        let mut reg = reg.lock().await;
        if reg.grouped_initial_sent {
            return;
        }
        reg.grouped_initial_sent = true;
        (reg.callbacks.on_event)(NodeEvent::State { id: id.to_string(), value, initial: true });
    }

    async fn spawn_grouped_initial_deadline(self: &Arc<Self>, node_id: NodeId) {
        let this = self.clone();
        let target = node_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(GROUPED_INITIAL_DEADLINE).await;
            this.flush_grouped_initial_deadline(&target).await;
        });
        if let Some(reg) = self.registrations.get(&node_id).map(|r| r.clone()) {
            reg.lock().await.grouped_deadline = Some(handle);
        }
    }

    async fn flush_grouped_initial_deadline(&self, node_id: &NodeId) {
        let Some(reg) = self.registrations.get(node_id).map(|r| r.clone()) else { return };
        let mut reg = reg.lock().await;
        self.flush_grouped_initial_value(&mut reg);
    }

    /// Exactly-once grouped-initial emission, invoked either because every
    /// requested id has arrived or because the 3000ms deadline fired.
    fn flush_grouped_initial_value(&self, reg: &mut Registration) {
        if reg.grouped_initial_sent {
            return;
        }
        reg.grouped_initial_sent = true;
        reg.grouped_deadline = None;
        let snapshot = std::mem::take(&mut reg.initial_values);
        (reg.callbacks.on_event)(NodeEvent::StateGroup { values: snapshot, initial: true });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use iobroker_bridge_commons::ServerConfig;

    use super::*;
    use crate::client::mock::MockConnector;
    use crate::connection::{ConnectionCallbacks, ConnectionManager};

    fn cm_callbacks() -> ConnectionCallbacks {
        ConnectionCallbacks {
            on_status: Arc::new(|_, _| {}),
            on_error: Arc::new(|_, _| {}),
            on_event: Arc::new(|_, _| {}),
            on_destroyed: Arc::new(|_| {}),
        }
    }

    fn consumer_callbacks() -> (ConsumerCallbacks, Arc<StdMutex<Vec<NodeEvent>>>) {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let recorded = events.clone();
        (
            ConsumerCallbacks {
                on_event: Arc::new(move |event| recorded.lock().unwrap().push(event)),
                update_status: Arc::new(|_| {}),
                on_subscribed: None,
            },
            events,
        )
    }

    async fn drain(n: usize) {
        for _ in 0..n {
            tokio::task::yield_now().await;
        }
    }

    async fn setup(server_id: &ServerId) -> (Arc<ConnectionManager<MockConnector>>, Arc<OperationManager<MockConnector>>, Arc<RecoveryManager<MockConnector>>, Arc<NodeRegistry<MockConnector>>) {
        let connector = MockConnector::new();
        let cm = ConnectionManager::new(connector, cm_callbacks());
        cm.get_connection(server_id, ServerConfig::new("h", 1)).await;
        drain(10).await;
        let om = OperationManager::new(cm.clone(), Arc::new(|_| {}));
        let rm = RecoveryManager::new(cm.clone());
        let nr = NodeRegistry::new(om.clone(), rm.clone());
        (cm, om, rm, nr)
    }

    #[tokio::test]
    async fn state_change_reaches_matching_pattern_consumer_only() {
        let server_id = ServerId::new("h:1");
        let (_cm, _om, _rm, nr) = setup(&server_id).await;

        let (cb1, events1) = consumer_callbacks();
        nr.subscribe(NodeId::new("n1"), server_id.clone(), "lights.*".to_string(), cb1, false, false).await.unwrap();
        let (cb2, events2) = consumer_callbacks();
        nr.subscribe(NodeId::new("n2"), server_id.clone(), "sensors.temp".to_string(), cb2, false, false).await.unwrap();

        nr.handle_state_change(&server_id, "lights.kitchen", StateValue::new(serde_json::json!(true), true)).await;

        assert_eq!(events1.lock().unwrap().len(), 1);
        assert!(events2.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn grouped_initial_value_flushes_after_deadline_with_partial_data() {
        let server_id = ServerId::new("h:2");
        let (_cm, _om, _rm, nr) = setup(&server_id).await;

        let (cb, events) = consumer_callbacks();
        let succeeded = nr
            .subscribe_multiple(NodeId::new("n3"), server_id.clone(), vec!["a".into(), "b".into(), "c".into()], cb, true, false)
            .await
            .unwrap();
        assert_eq!(succeeded.len(), 3);

        nr.handle_state_change(&server_id, "a", StateValue::new(serde_json::json!(1), true)).await;
        nr.handle_state_change(&server_id, "b", StateValue::new(serde_json::json!(2), true)).await;
        assert!(events.lock().unwrap().is_empty());

        tokio::time::advance(Duration::from_millis(3001)).await;
        drain(10).await;

        let recorded = events.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        match &recorded[0] {
            NodeEvent::StateGroup { values, initial } => {
                assert!(*initial);
                assert_eq!(values.len(), 2);
                assert!(values.contains_key("a") && values.contains_key("b"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn grouped_initial_value_completes_early_without_waiting_for_deadline() {
        let server_id = ServerId::new("h:3");
        let (_cm, _om, _rm, nr) = setup(&server_id).await;

        let (cb, events) = consumer_callbacks();
        nr.subscribe_multiple(NodeId::new("n4"), server_id.clone(), vec!["a".into(), "b".into()], cb, true, false)
            .await
            .unwrap();

        nr.handle_state_change(&server_id, "a", StateValue::new(serde_json::json!(1), true)).await;
        nr.handle_state_change(&server_id, "b", StateValue::new(serde_json::json!(2), true)).await;

        let recorded = events.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert!(matches!(&recorded[0], NodeEvent::StateGroup { initial: true, .. }));
    }

    #[tokio::test]
    async fn unregister_removes_index_entry_and_decrements_consumer_count() {
        let server_id = ServerId::new("h:4");
        let (_cm, _om, rm, nr) = setup(&server_id).await;

        let (cb, _events) = consumer_callbacks();
        let node_id = NodeId::new("n5");
        nr.subscribe(node_id.clone(), server_id.clone(), "lights.*".to_string(), cb, false, false).await.unwrap();
        assert_eq!(rm.consumer_count(&server_id), 1);

        nr.unregister(&node_id).await.unwrap();
        assert_eq!(rm.consumer_count(&server_id), 0);

        let (cb2, events2) = consumer_callbacks();
        nr.subscribe(NodeId::new("n6"), server_id.clone(), "other".to_string(), cb2, false, false).await.unwrap();
        nr.handle_state_change(&server_id, "lights.kitchen", StateValue::new(serde_json::json!(true), true)).await;
        assert!(events2.lock().unwrap().is_empty());
    }
}
