use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use iobroker_bridge_commons::{Error, Result};
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tracing::instrument;

use crate::client::{Client, Connector, HistoryQuery, ObjectValue, StateValue};
use crate::connection::{ConnectionManager, ConnectionState};
use crate::pattern::pattern_to_regex;
use crate::server_id::ServerId;

use super::queue::{OpFn, OperationQueue, QueuedOp};

const FIXED_OBJECT_TYPES: &[&str] = &[
    "state", "channel", "device", "folder", "adapter", "instance", "host", "group", "user", "config", "enum",
];

const QUEUE_STAGGER: Duration = Duration::from_millis(50);

/// Operation Manager (OM): the single gateway for request/response
/// traffic. Queues operations across connection gaps and replays them, in
/// order, once the connection becomes ready again.
pub struct OperationManager<C: Connector + 'static> {
    cm: Arc<ConnectionManager<C>>,
    request_immediate_retry: Arc<dyn Fn(ServerId) + Send + Sync>,
    queues: DashMap<ServerId, Arc<Mutex<OperationQueue<C::Client>>>>,
    next_id: AtomicU64,
}

impl<C: Connector + 'static> OperationManager<C> {
    pub fn new(cm: Arc<ConnectionManager<C>>, request_immediate_retry: Arc<dyn Fn(ServerId) + Send + Sync>) -> Arc<Self> {
        Arc::new(Self {
            cm,
            request_immediate_retry,
            queues: DashMap::new(),
            next_id: AtomicU64::new(1),
        })
    }

    fn queue(&self, server_id: &ServerId) -> Arc<Mutex<OperationQueue<C::Client>>> {
        self.queues
            .entry(server_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(OperationQueue::default())))
            .clone()
    }

    /// Number of operations currently waiting for a ready connection, for
    /// `getConnectionStatus`'s "queue depth" field.
    pub async fn queue_depth(&self, server_id: &ServerId) -> usize {
        self.queue(server_id).lock().await.entries.len()
    }

    /// The dispatch algorithm from `spec.md` §4.2.
    #[instrument(skip(self, op))]
    async fn dispatch(self: &Arc<Self>, server_id: &ServerId, name: &str, op: OpFn<C::Client>) -> Result<Value> {
        if let Some(client) = self.cm.current_client(server_id).await {
            return op(client).await;
        }

        let state = self.cm.state(server_id).await;
        let deadline = match state {
            ConnectionState::Connecting => Some(Duration::from_secs(10)),
            ConnectionState::RetryScheduled | ConnectionState::NetworkError => Some(Duration::from_secs(15)),
            ConnectionState::Idle if self.cm.stored_config(server_id).await.is_some() => {
                (self.request_immediate_retry)(server_id.clone());
                Some(Duration::from_secs(15))
            }
            _ => None,
        };

        let Some(deadline) = deadline else {
            return Err(if state == ConnectionState::AuthFailed {
                Error::NotReady("Authentication failed permanently".into())
            } else {
                Error::NotReady(format!("no ready connection: {server_id}"))
            });
        };

        let (tx, rx) = oneshot::channel();
        self.enqueue(server_id.clone(), name.to_string(), deadline, op, tx).await;
        rx.await.map_err(|_| Error::NotReady("queue entry dropped".into()))?
    }

    async fn enqueue(
        self: &Arc<Self>, server_id: ServerId, name: String, deadline: Duration, op: OpFn<C::Client>,
        resolver: oneshot::Sender<Result<Value>>,
    ) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = self.queue(&server_id);
        queue.lock().await.entries.push_back(QueuedOp {
            id,
            name: name.clone(),
            enqueued_at: Instant::now(),
            deadline,
            op,
            resolver,
        });

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            this.expire(&server_id, id, name).await;
        });
    }

    async fn expire(&self, server_id: &ServerId, id: u64, name: String) {
        let queue = self.queue(server_id);
        let entry = queue.lock().await.remove(id);
        if let Some(entry) = entry {
            let _ = entry.resolver.send(Err(Error::Timeout(name)));
        }
    }

    /// Drains the queue on a CM "ready" transition, dispatching entries
    /// with a 50ms stagger. If the connection drops again before a client
    /// handle can be grabbed, entries are restored at the front of the
    /// queue, preserving FIFO order for the next drain.
    #[instrument(skip(self))]
    pub async fn drain(self: &Arc<Self>, server_id: &ServerId) {
        let queue = self.queue(server_id);
        let entries = queue.lock().await.take_all();
        if entries.is_empty() {
            return;
        }

        let Some(client) = self.cm.current_client(server_id).await else {
            queue.lock().await.restore_front(entries);
            return;
        };

        for (i, entry) in entries.into_iter().enumerate() {
            let client = client.clone();
            let stagger = QUEUE_STAGGER * i as u32;
            tokio::spawn(async move {
                if !stagger.is_zero() {
                    tokio::time::sleep(stagger).await;
                }
                let result = (entry.op)(client).await;
                let _ = entry.resolver.send(result);
            });
        }
    }

    /// "Failed permanently" queue handling from `spec.md` §4.2.
    pub async fn clear_with_auth_failure(&self, server_id: &ServerId) {
        let queue = self.queue(server_id);
        for entry in queue.lock().await.drain_all() {
            let _ = entry.resolver.send(Err(Error::NotReady("Authentication failed permanently".into())));
        }
    }

    /// Rejects everything still queued when CM tears down the connection
    /// (explicit close, force-switch, or a config-hash change), per the
    /// "hash-change-during-reconnect" resolution in `spec.md` §9.
    pub async fn clear_with_destroyed(&self, server_id: &ServerId) {
        let queue = self.queue(server_id);
        for entry in queue.lock().await.drain_all() {
            let _ = entry.resolver.send(Err(Error::Destroyed));
        }
    }

    // ---- Public operations, spec.md §4.2 ----

    pub async fn get_state(self: &Arc<Self>, server_id: &ServerId, id: String) -> Result<Option<StateValue>> {
        let timeout = Duration::from_secs(8);
        let value = self
            .dispatch(
                server_id,
                "getState",
                Box::new(move |client| Box::pin(async move { client.emit("getState", vec![Value::String(id)], timeout).await })),
            )
            .await?;
        value_to_option(value)
    }

    pub async fn set_state(self: &Arc<Self>, server_id: &ServerId, id: String, value: StateValue, now_ms: i64) -> Result<()> {
        let value = value.for_set(now_ms);
        let timeout = Duration::from_secs(8);
        self.dispatch(
            server_id,
            "setState",
            Box::new(move |client| {
                Box::pin(async move {
                    let payload = serde_json::to_value(&value)?;
                    client.emit("setState", vec![Value::String(id), payload], timeout).await
                })
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn get_states(self: &Arc<Self>, server_id: &ServerId, pattern: String) -> Result<Value> {
        let timeout = Duration::from_secs(15);
        self.dispatch(
            server_id,
            "getStates",
            Box::new(move |client| Box::pin(async move { client.emit("getStates", vec![Value::String(pattern)], timeout).await })),
        )
        .await
    }

    pub async fn get_object(self: &Arc<Self>, server_id: &ServerId, id: String) -> Result<Option<ObjectValue>> {
        let timeout = Duration::from_secs(10);
        let value = self
            .dispatch(
                server_id,
                "getObject",
                Box::new(move |client| Box::pin(async move { client.emit("getObject", vec![Value::String(id)], timeout).await })),
            )
            .await?;
        value_to_option(value)
    }

    pub async fn set_object(self: &Arc<Self>, server_id: &ServerId, object: ObjectValue) -> Result<()> {
        let timeout = Duration::from_secs(10);
        self.dispatch(
            server_id,
            "setObject",
            Box::new(move |client| {
                Box::pin(async move {
                    let id = object.id.clone();
                    let body = object.body_without_id();
                    client.emit("setObject", vec![Value::String(id), body], timeout).await
                })
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn get_object_view(
        self: &Arc<Self>, server_id: &ServerId, design_id: String, search_id: String, params: Value,
    ) -> Result<Value> {
        let timeout = Duration::from_secs(25);
        self.dispatch(
            server_id,
            "getObjectView",
            Box::new(move |client| {
                Box::pin(async move { client.emit("getObjectView", vec![Value::String(design_id), Value::String(search_id), params], timeout).await })
            }),
        )
        .await
    }

    /// `getObjects(pattern, type?)` from `spec.md` §4.2: a wildcard pattern
    /// fans out over `getObjectView` (a single type, or the fixed eleven-type
    /// set when none was given); an exact pattern is a single `getObject`.
    /// Results are filtered by type and the pattern-as-regex, then sorted by
    /// `_id`.
    pub async fn get_objects(
        self: &Arc<Self>, server_id: &ServerId, pattern: String, object_type: Option<String>,
    ) -> Result<Vec<ObjectValue>> {
        let regex = pattern_to_regex(&pattern)?;

        let mut rows = if pattern.contains('*') {
            let types: Vec<String> = match &object_type {
                Some(t) => vec![t.clone()],
                None => FIXED_OBJECT_TYPES.iter().map(|t| (*t).to_string()).collect(),
            };
            let mut all = Vec::new();
            for object_type in types {
                let view = self
                    .get_object_view(server_id, "system".to_string(), object_type, Value::Object(Default::default()))
                    .await?;
                all.extend(rows_from_view(view));
            }
            all
        } else {
            match self.get_object(server_id, pattern.clone()).await? {
                Some(obj) => vec![obj],
                None => Vec::new(),
            }
        };

        rows.retain(|obj| object_type.as_deref().map_or(true, |t| obj.kind == t) && regex.is_match(&obj.id));
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rows)
    }

    pub async fn get_history(self: &Arc<Self>, server_id: &ServerId, adapter: String, id: String, options: HistoryQuery) -> Result<Vec<StateValue>> {
        let timeout = Duration::from_secs(30);
        let value = self
            .dispatch(
                server_id,
                "getHistory",
                Box::new(move |client| {
                    Box::pin(async move {
                        let options = serde_json::to_value(&options)?;
                        client.emit("getHistory", vec![Value::String(adapter), Value::String(id), options], timeout).await
                    })
                }),
            )
            .await?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    /// `sendToAdapter(adapter, command?, message, timeoutOrNull)` from
    /// `spec.md` §4.2. `timeout = None` is fire-and-forget.
    pub async fn send_to_adapter(
        self: &Arc<Self>, server_id: &ServerId, adapter: String, command: Option<String>, message: Value,
        timeout: Option<Duration>,
    ) -> Result<Option<Value>> {
        let mut args = vec![Value::String(adapter)];
        if let Some(command) = command {
            args.push(Value::String(command));
        }
        args.push(message);

        match timeout {
            None => {
                self.dispatch(
                    server_id,
                    "sendToAdapter",
                    Box::new(move |client| Box::pin(async move {
                        client.emit_no_reply("sendTo", args).await?;
                        Ok(Value::Null)
                    })),
                )
                .await?;
                Ok(None)
            }
            Some(timeout) => {
                let value = self
                    .dispatch(server_id, "sendToAdapter", Box::new(move |client| Box::pin(async move { client.emit("sendTo", args, timeout).await })))
                    .await?;
                Ok(Some(value))
            }
        }
    }

    pub async fn subscribe(self: &Arc<Self>, server_id: &ServerId, pattern: String) -> Result<()> {
        let timeout = Duration::from_secs(5);
        self.dispatch(
            server_id,
            "subscribe",
            Box::new(move |client| Box::pin(async move { client.emit("subscribe", vec![Value::String(pattern)], timeout).await })),
        )
        .await?;
        Ok(())
    }

    /// Unsubscribe never rejects: a timeout resolves as success.
    pub async fn unsubscribe(self: &Arc<Self>, server_id: &ServerId, pattern: String) -> Result<()> {
        let timeout = Duration::from_secs(3);
        let result = self
            .dispatch(
                server_id,
                "unsubscribe",
                Box::new(move |client| Box::pin(async move { client.emit("unsubscribe", vec![Value::String(pattern)], timeout).await })),
            )
            .await;
        ok_or_timeout(result)
    }

    pub async fn subscribe_objects(self: &Arc<Self>, server_id: &ServerId, pattern: String) -> Result<()> {
        let timeout = Duration::from_secs(5);
        self.dispatch(
            server_id,
            "subscribeObjects",
            Box::new(move |client| Box::pin(async move { client.emit("subscribeObjects", vec![Value::String(pattern)], timeout).await })),
        )
        .await?;
        Ok(())
    }

    pub async fn unsubscribe_objects(self: &Arc<Self>, server_id: &ServerId, pattern: String) -> Result<()> {
        let timeout = Duration::from_secs(3);
        let result = self
            .dispatch(
                server_id,
                "unsubscribeObjects",
                Box::new(move |client| Box::pin(async move { client.emit("unsubscribeObjects", vec![Value::String(pattern)], timeout).await })),
            )
            .await;
        ok_or_timeout(result)
    }

    pub async fn subscribe_logs(self: &Arc<Self>, server_id: &ServerId, level: String) -> Result<()> {
        let timeout = Duration::from_secs(5);
        self.dispatch(
            server_id,
            "subscribeLogs",
            Box::new(move |client| Box::pin(async move { client.emit("requireLog", vec![Value::Bool(true), Value::String(level)], timeout).await })),
        )
        .await?;
        Ok(())
    }

    pub async fn unsubscribe_logs(self: &Arc<Self>, server_id: &ServerId) -> Result<()> {
        let timeout = Duration::from_secs(3);
        let result = self
            .dispatch(
                server_id,
                "unsubscribeLogs",
                Box::new(move |client| Box::pin(async move { client.emit("requireLog", vec![Value::Bool(false)], timeout).await })),
            )
            .await;
        ok_or_timeout(result)
    }
}

fn value_to_option<T: serde::de::DeserializeOwned>(value: Value) -> Result<Option<T>> {
    if value.is_null() {
        Ok(None)
    } else {
        Ok(Some(serde_json::from_value(value)?))
    }
}

fn ok_or_timeout(result: Result<Value>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(Error::Timeout(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

fn rows_from_view(view: Value) -> Vec<ObjectValue> {
    view.get("rows")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(|row| row.get("value").cloned())
                .filter_map(|v| serde_json::from_value::<ObjectValue>(v).ok())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use iobroker_bridge_commons::ServerConfig;

    use super::*;
    use crate::client::mock::MockConnector;
    use crate::connection::ConnectionCallbacks;

    fn callbacks() -> ConnectionCallbacks {
        ConnectionCallbacks {
            on_status: Arc::new(|_, _| {}),
            on_error: Arc::new(|_, _| {}),
            on_event: Arc::new(|_, _| {}),
            on_destroyed: Arc::new(|_| {}),
        }
    }

    async fn drain_tasks(n: usize) {
        for _ in 0..n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn runs_directly_when_ready() {
        let connector = MockConnector::new();
        connector.push_emit_outcome(Ok(Value::String("hello".into()))).await;
        let cm = ConnectionManager::new(connector, callbacks());
        let server_id = ServerId::new("h:1");
        cm.get_connection(&server_id, ServerConfig::new("h", 1)).await;
        drain_tasks(10).await;

        let om = OperationManager::new(cm, Arc::new(|_| {}));
        let value = om.get_states(&server_id, "*".to_string()).await.unwrap();
        assert_eq!(value, Value::String("hello".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_dispatches_queued_entries_in_order_with_stagger() {
        let connector = MockConnector::new();
        let cm = ConnectionManager::new(connector, callbacks());
        let server_id = ServerId::new("h:2");
        let om = OperationManager::new(cm.clone(), Arc::new(|_| {}));

        let order: Arc<std::sync::Mutex<Vec<(&'static str, tokio::time::Instant)>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut resolvers = Vec::new();
        {
            let queue = om.queue(&server_id);
            let mut q = queue.lock().await;
            for name in ["a", "b"] {
                let (tx, rx) = oneshot::channel();
                resolvers.push(rx);
                let order = order.clone();
                q.entries.push_back(QueuedOp {
                    id: 0,
                    name: name.to_string(),
                    enqueued_at: Instant::now(),
                    deadline: Duration::from_secs(15),
                    op: Box::new(move |_client| {
                        Box::pin(async move {
                            order.lock().unwrap().push((name, tokio::time::Instant::now()));
                            Ok(Value::Null)
                        })
                    }),
                    resolver: tx,
                });
            }
        }

        cm.get_connection(&server_id, ServerConfig::new("h", 2)).await;
        drain_tasks(10).await;
        assert_eq!(cm.state(&server_id).await, ConnectionState::Connected);

        om.drain(&server_id).await;
        tokio::time::advance(Duration::from_millis(100)).await;
        drain_tasks(10).await;

        for rx in resolvers {
            rx.await.unwrap().unwrap();
        }

        let recorded = order.lock().unwrap();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].0, "a");
        assert_eq!(recorded[1].0, "b");
        assert!(recorded[1].1.duration_since(recorded[0].1) >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn auth_failed_rejects_immediately() {
        let connector = MockConnector::new();
        connector.push_connect_outcome(crate::client::mock::ConnectOutcome::Err("unauthorized".into())).await;
        let cm = ConnectionManager::new(connector, callbacks());
        let server_id = ServerId::new("h:3");
        cm.get_connection(&server_id, ServerConfig::new("h", 3)).await;
        drain_tasks(10).await;
        assert_eq!(cm.state(&server_id).await, ConnectionState::AuthFailed);

        let om = OperationManager::new(cm, Arc::new(|_| {}));
        let err = om.get_state(&server_id, "x".to_string()).await.unwrap_err();
        assert!(matches!(err, Error::NotReady(_)));
    }
}
