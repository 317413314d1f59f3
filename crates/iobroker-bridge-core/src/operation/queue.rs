use std::collections::VecDeque;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use iobroker_bridge_commons::Result;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::client::Client;

/// A boxed op-fn: the operation body that runs once a ready `Client`
/// handle is available, whether that happens immediately or after a
/// queue drain.
pub type OpFn<C> = Box<dyn FnOnce(std::sync::Arc<C>) -> BoxFuture<'static, Result<Value>> + Send>;

/// One pending operation, per `spec.md` §3's `OperationQueue` entry.
pub struct QueuedOp<C: Client> {
    pub id: u64,
    pub name: String,
    pub enqueued_at: Instant,
    pub deadline: Duration,
    pub op: OpFn<C>,
    pub resolver: oneshot::Sender<Result<Value>>,
}

/// FIFO queue of pending operations for one `ServerId`. Guarded by the
/// per-`ServerId` `tokio::sync::Mutex` the `OperationManager` holds
/// alongside it — a separate lock from CM's connection-state mutex so
/// draining never blocks state transitions.
pub struct OperationQueue<C: Client> {
    pub entries: VecDeque<QueuedOp<C>>,
}

impl<C: Client> Default for OperationQueue<C> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }
}

impl<C: Client> OperationQueue<C> {
    pub fn take_all(&mut self) -> VecDeque<QueuedOp<C>> {
        std::mem::take(&mut self.entries)
    }

    pub fn restore_front(&mut self, entries: VecDeque<QueuedOp<C>>) {
        for entry in entries.into_iter().rev() {
            self.entries.push_front(entry);
        }
    }

    pub fn remove(&mut self, id: u64) -> Option<QueuedOp<C>> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        self.entries.remove(pos)
    }

    pub fn drain_all(&mut self) -> VecDeque<QueuedOp<C>> {
        self.entries.drain(..).collect()
    }
}
