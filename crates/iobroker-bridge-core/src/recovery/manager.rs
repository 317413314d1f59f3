use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::Mutex;

use crate::client::Connector;
use crate::connection::ConnectionManager;
use crate::server_id::ServerId;

/// A per-consumer callback registered by the Node Registry on behalf of a
/// consumer that failed to subscribe; invoked once the connection for its
/// `ServerId` is ready again.
pub type RecoveryCallback = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Default)]
struct RecoveryBookkeeping {
    consumer_count: AtomicI64,
    callbacks: Mutex<Vec<RecoveryCallback>>,
    backoff_attempts: AtomicU64,
}

/// Recovery Manager (RM): consumer accounting and retry scheduling, per
/// `spec.md` §4.3.
pub struct RecoveryManager<C: Connector + 'static> {
    cm: Arc<ConnectionManager<C>>,
    bookkeeping: DashMap<ServerId, Arc<RecoveryBookkeeping>>,
}

impl<C: Connector + 'static> RecoveryManager<C> {
    pub fn new(cm: Arc<ConnectionManager<C>>) -> Arc<Self> {
        Arc::new(Self {
            cm,
            bookkeeping: DashMap::new(),
        })
    }

    fn bookkeeping(&self, server_id: &ServerId) -> Arc<RecoveryBookkeeping> {
        self.bookkeeping
            .entry(server_id.clone())
            .or_insert_with(|| Arc::new(RecoveryBookkeeping::default()))
            .clone()
    }

    pub fn consumer_count(&self, server_id: &ServerId) -> i64 {
        self.bookkeeping(server_id).consumer_count.load(Ordering::SeqCst)
    }

    /// Consumer count increments only for non-recovery registrations;
    /// resubscriptions issued during the recovery cycle must call
    /// `increment` at most once per live registration, which NR already
    /// guarantees by only calling this from the initial (non-recovery)
    /// subscribe path.
    pub fn increment(&self, server_id: &ServerId) -> i64 {
        self.bookkeeping(server_id).consumer_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrements the consumer count; when it reaches zero, requests CM
    /// close for the `ServerId`.
    pub fn decrement(self: &Arc<Self>, server_id: &ServerId) -> i64 {
        let remaining = self.bookkeeping(server_id).consumer_count.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining <= 0 {
            let this = self.clone();
            let server_id = server_id.clone();
            tokio::spawn(async move {
                this.cm.close(&server_id).await;
                this.cleanup_server(&server_id);
            });
        }
        remaining
    }

    /// Delegates to CM's retry policy, but only if a consumer is still
    /// interested in this `ServerId`.
    pub async fn schedule_retry(&self, server_id: &ServerId) {
        if self.consumer_count(server_id) > 0 {
            self.cm.schedule_retry(server_id).await;
        }
    }

    pub async fn schedule_immediate_retry(&self, server_id: &ServerId) {
        if self.consumer_count(server_id) > 0 {
            self.cm.schedule_immediate_retry(server_id).await;
        }
    }

    pub async fn handle_connection_error(&self, server_id: &ServerId) {
        self.bookkeeping(server_id).backoff_attempts.fetch_add(1, Ordering::SeqCst);
        self.schedule_retry(server_id).await;
    }

    pub fn handle_connection_success(&self, server_id: &ServerId) {
        self.bookkeeping(server_id).backoff_attempts.store(0, Ordering::SeqCst);
    }

    pub async fn register_recovery_callback(&self, server_id: &ServerId, callback: RecoveryCallback) {
        self.bookkeeping(server_id).callbacks.lock().await.push(callback);
    }

    /// Runs after the generation becomes CONNECTED and NR's resubscription
    /// cycle starts, per `spec.md` §4.3/§4.5 ordering.
    pub async fn execute_recovery_callbacks(&self, server_id: &ServerId) {
        let callbacks = {
            let entry = self.bookkeeping(server_id);
            let mut guard = entry.callbacks.lock().await;
            std::mem::take(&mut *guard)
        };
        for callback in callbacks {
            callback().await;
        }
    }

    pub fn cleanup_server(&self, server_id: &ServerId) {
        self.bookkeeping.remove(server_id);
    }
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

    #[tokio::test]
    async fn decrement_to_zero_closes_the_connection() {
        let connector = MockConnector::new();
        let cm = ConnectionManager::new(connector, callbacks());
        let rm = RecoveryManager::new(cm.clone());
        let server_id = ServerId::new("h:1");

        rm.increment(&server_id);
        rm.increment(&server_id);
        assert_eq!(rm.consumer_count(&server_id), 2);

        assert_eq!(rm.decrement(&server_id), 1);
        assert_eq!(rm.decrement(&server_id), 0);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(cm.state(&server_id).await, crate::connection::ConnectionState::Idle);
    }

    #[tokio::test]
    async fn schedule_retry_is_a_no_op_without_consumers() {
        let connector = MockConnector::new();
        let cm = ConnectionManager::new(connector, callbacks());
        let rm = RecoveryManager::new(cm.clone());
        let server_id = ServerId::new("h:2");
        let config = ServerConfig::new("h", 2);

        cm.get_connection(&server_id, config).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(cm.state(&server_id).await, crate::connection::ConnectionState::Connected);
        cm.close(&server_id).await;
        assert_eq!(cm.state(&server_id).await, crate::connection::ConnectionState::Idle);

        rm.schedule_retry(&server_id).await;
        assert_eq!(cm.state(&server_id).await, crate::connection::ConnectionState::Idle);

        rm.increment(&server_id);
        rm.schedule_retry(&server_id).await;
        assert_eq!(cm.state(&server_id).await, crate::connection::ConnectionState::RetryScheduled);
    }

    #[tokio::test]
    async fn recovery_callbacks_run_once_and_then_drain() {
        let connector = MockConnector::new();
        let cm = ConnectionManager::new(connector, callbacks());
        let rm = RecoveryManager::new(cm);
        let server_id = ServerId::new("h:3");

        let ran = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let r1 = ran.clone();
        rm.register_recovery_callback(&server_id, Box::new(move || Box::pin(async move {
            r1.fetch_add(1, Ordering::SeqCst);
        })))
        .await;

        rm.execute_recovery_callbacks(&server_id).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        // A second execution with nothing registered is a no-op.
        rm.execute_recovery_callbacks(&server_id).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
