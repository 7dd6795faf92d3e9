//! Supervisor/worker message transport
//!
//! The supervisor keeps one [`Transport`] hub. Every child registers with it;
//! messages a child emits are tagged with its id and fanned out to listeners.
//! Worker processes talk back through a [`WorkerChannel`].

pub mod codec;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::models::{Message, MessageKind};
use crate::process::ProcessHandle;

/// Capacity of the inbound fan-out channel
const INBOUND_CAPACITY: usize = 1024;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("no child registered as {0}")]
    NotRegistered(String),

    #[error("channel closed")]
    Closed,

    #[error("failed to spawn process: {0}")]
    Spawn(String),
}

/// A message received from a child, tagged with its id
#[derive(Clone, Debug)]
pub struct Inbound {
    pub source: String,
    pub message: Message,
}

/// Listener registration; dropping it unsubscribes
#[derive(Debug)]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Supervisor-side message hub
pub struct Transport {
    children: Mutex<HashMap<String, Arc<dyn ProcessHandle>>>,
    inbound: broadcast::Sender<Inbound>,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport {
    pub fn new() -> Self {
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        Self {
            children: Mutex::new(HashMap::new()),
            inbound,
        }
    }

    /// Register a child and start forwarding its messages
    pub fn register_child(
        &self,
        id: &str,
        handle: Arc<dyn ProcessHandle>,
        mut messages: mpsc::UnboundedReceiver<Message>,
    ) {
        self.children().insert(id.to_string(), handle);

        let inbound = self.inbound.clone();
        let source = id.to_string();
        tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                // Nobody listening is fine; the message is simply unobserved.
                let _ = inbound.send(Inbound {
                    source: source.clone(),
                    message,
                });
            }
            debug!(worker_id = %source, "child message stream closed");
        });
    }

    pub fn unregister_child(&self, id: &str) -> Option<Arc<dyn ProcessHandle>> {
        self.children().remove(id)
    }

    /// Send a message to one child
    pub fn send(&self, target: &str, message: Message) -> Result<(), TransportError> {
        let handle = self
            .children()
            .get(target)
            .cloned()
            .ok_or_else(|| TransportError::NotRegistered(target.to_string()))?;
        handle.send(message)
    }

    /// Send a message to every registered child; returns how many accepted it
    pub fn broadcast_universally(&self, message: Message) -> usize {
        let children: Vec<_> = self
            .children()
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect();

        let mut delivered = 0;
        for (id, handle) in children {
            match handle.send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => warn!(worker_id = %id, error = %err, "broadcast not delivered"),
            }
        }
        delivered
    }

    /// Call `handler` for every inbound message of `kind`
    pub fn on<F>(&self, kind: MessageKind, handler: F) -> Subscription
    where
        F: Fn(Inbound) + Send + 'static,
    {
        let mut rx = self.inbound.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(inbound) if inbound.message.kind() == kind => handler(inbound),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(%kind, skipped, "listener lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { task }
    }

    /// The first `kind` message from `source`.
    ///
    /// The listener is registered when this is called, not when the future is
    /// first polled, so it can be created before the request is sent.
    pub fn once_from(
        &self,
        source: &str,
        kind: MessageKind,
    ) -> impl Future<Output = Result<Message, TransportError>> + Send + 'static {
        let mut rx = self.inbound.subscribe();
        let source = source.to_string();
        async move {
            loop {
                match rx.recv().await {
                    Ok(inbound) if inbound.source == source && inbound.message.kind() == kind => {
                        return Ok(inbound.message);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(worker_id = %source, %kind, skipped, "listener lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(TransportError::Closed),
                }
            }
        }
    }

    fn children(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn ProcessHandle>>> {
        self.children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Worker-side sender towards the supervisor
#[derive(Clone, Debug)]
pub struct WorkerChannel {
    tx: mpsc::UnboundedSender<Message>,
}

impl WorkerChannel {
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { tx }
    }

    pub fn broadcast_universally(&self, message: Message) {
        if self.tx.send(message).is_err() {
            debug!("supervisor channel closed; dropping message");
        }
    }
}
