//! Workers hosted as tasks inside the supervisor process

use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::debug;

use super::{KillSignal, ProcessHandle, ProcessStatus, SpawnedProcess, Spawner};
use crate::models::Message;
use crate::transport::{TransportError, WorkerChannel};
use crate::worker::ExecutionController;

/// Runs an [`ExecutionController`] on the current runtime instead of a child
/// process. Same protocol, no isolation.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalSpawner;

impl Spawner for LocalSpawner {
    fn spawn<'a>(&'a self, worker_id: &'a str) -> BoxFuture<'a, Result<SpawnedProcess, TransportError>> {
        Box::pin(async move {
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (status_tx, status_rx) = watch::channel(ProcessStatus::Running);

            let controller = ExecutionController::new(WorkerChannel::new(outbound_tx));
            let task = tokio::spawn(controller.run(inbound_rx));
            let abort = task.abort_handle();

            let id = worker_id.to_string();
            tokio::spawn(async move {
                let status = match task.await {
                    Ok(()) => ProcessStatus::Exited(Some(0)),
                    Err(err) if err.is_cancelled() => ProcessStatus::Exited(None),
                    Err(err) => ProcessStatus::Errored(err.to_string()),
                };
                debug!(worker_id = %id, %status, "local worker stopped");
                status_tx.send_replace(status);
            });

            debug!(worker_id, "spawned local worker");
            Ok(SpawnedProcess {
                handle: Arc::new(LocalHandle {
                    inbound: Mutex::new(Some(inbound_tx)),
                    abort,
                    status: status_rx,
                }),
                messages: outbound_rx,
            })
        })
    }
}

struct LocalHandle {
    inbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    abort: AbortHandle,
    status: watch::Receiver<ProcessStatus>,
}

impl ProcessHandle for LocalHandle {
    fn send(&self, message: Message) -> Result<(), TransportError> {
        let inbound = self.inbound.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inbound
            .as_ref()
            .ok_or(TransportError::Closed)?
            .send(message)
            .map_err(|_| TransportError::Closed)
    }

    fn kill(&self, signal: KillSignal) -> Result<(), TransportError> {
        match signal {
            KillSignal::Terminate => {
                self.inbound
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
            }
            KillSignal::Kill => self.abort.abort(),
        }
        Ok(())
    }

    fn status(&self) -> watch::Receiver<ProcessStatus> {
        self.status.clone()
    }
}
