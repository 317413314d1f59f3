//! A scriptable [`Client`]/[`Connector`] pair for unit tests. Lets tests
//! drive connect outcomes, emit outcomes and inbound events without any
//! networking, mirroring the teacher's in-memory test doubles for its
//! proxy recovery manager.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use iobroker_bridge_commons::{Error, Result, ServerConfig};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use super::{Client, ClientEvent, Connector};

/// Scripted outcome for a single `connect` call.
#[derive(Clone)]
pub enum ConnectOutcome {
    Ok,
    Err(String),
}

/// Shared handle a test keeps to push events into a live [`MockClient`]
/// and to inspect which commands were emitted.
pub struct MockHandle {
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    calls: Arc<Mutex<Vec<(String, Vec<Value>)>>>,
    ready: Arc<AtomicBool>,
}

impl MockHandle {
    pub fn push_event(&self, event: ClientEvent) {
        let _ = self.events_tx.send(event);
    }

    pub async fn calls(&self) -> Vec<(String, Vec<Value>)> {
        self.calls.lock().await.clone()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

/// A [`Connector`] that hands out [`MockClient`]s according to a queue of
/// scripted [`ConnectOutcome`]s (FIFO; the last entry repeats once the
/// queue is drained, so a test doesn't need one entry per reconnect
/// attempt unless it cares about varying them).
#[derive(Default)]
pub struct MockConnector {
    outcomes: Mutex<VecDeque<ConnectOutcome>>,
    emit_outcomes: Mutex<VecDeque<Result<Value>>>,
    handles: Mutex<Vec<MockHandle>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push_connect_outcome(&self, outcome: ConnectOutcome) {
        self.outcomes.lock().await.push_back(outcome);
    }

    pub async fn push_emit_outcome(&self, outcome: Result<Value>) {
        self.emit_outcomes.lock().await.push_back(outcome);
    }

    /// Returns the handle for the most recently connected client, if any.
    pub async fn last_handle(&self) -> Option<MockHandle> {
        let handles = self.handles.lock().await;
        handles.last().map(|h| MockHandle {
            events_tx: h.events_tx.clone(),
            calls: h.calls.clone(),
            ready: h.ready.clone(),
        })
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Client = MockClient;

    async fn connect(
        &self, _config: &ServerConfig,
    ) -> Result<(MockClient, mpsc::UnboundedReceiver<ClientEvent>)> {
        let outcome = {
            let mut outcomes = self.outcomes.lock().await;
            outcomes.pop_front().unwrap_or(ConnectOutcome::Ok)
        };

        if let ConnectOutcome::Err(message) = outcome {
            return Err(Error::Transport(message));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ready = Arc::new(AtomicBool::new(true));
        let calls = Arc::new(Mutex::new(Vec::new()));

        self.handles.lock().await.push(MockHandle {
            events_tx: events_tx.clone(),
            calls: calls.clone(),
            ready: ready.clone(),
        });

        let _ = events_tx.send(ClientEvent::Ready);

        Ok((
            MockClient {
                ready,
                calls,
                emit_outcomes: self.emit_outcomes_snapshot().await,
            },
            events_rx,
        ))
    }
}

impl MockConnector {
    async fn emit_outcomes_snapshot(&self) -> Arc<Mutex<VecDeque<Result<Value>>>> {
        let mut outcomes = self.emit_outcomes.lock().await;
        Arc::new(Mutex::new(std::mem::take(&mut *outcomes)))
    }
}

pub struct MockClient {
    ready: Arc<AtomicBool>,
    calls: Arc<Mutex<Vec<(String, Vec<Value>)>>>,
    emit_outcomes: Arc<Mutex<VecDeque<Result<Value>>>>,
}

#[async_trait]
impl Client for MockClient {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn emit(&self, command: &str, args: Vec<Value>, _timeout: Duration) -> Result<Value> {
        self.calls.lock().await.push((command.to_string(), args));
        let mut outcomes = self.emit_outcomes.lock().await;
        match outcomes.pop_front() {
            Some(Ok(value)) => Ok(value),
            Some(Err(e)) => Err(e),
            None => Ok(Value::Null),
        }
    }

    async fn emit_no_reply(&self, command: &str, args: Vec<Value>) -> Result<()> {
        self.calls.lock().await.push((command.to_string(), args));
        Ok(())
    }

    async fn destroy(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }
}
