//! Workers as separate OS processes

use futures::future::BoxFuture;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{BufReader, BufWriter};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{KillSignal, ProcessHandle, ProcessStatus, SpawnedProcess, Spawner};
use crate::models::Message;
use crate::transport::{codec, TransportError};

/// Spawns `<binary> worker` with stdin/stdout piped; stderr is inherited so
/// worker logs end up next to the supervisor's.
#[derive(Clone, Debug)]
pub struct ProcessSpawner {
    binary: PathBuf,
    args: Vec<String>,
}

impl ProcessSpawner {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            args: vec!["worker".to_string()],
        }
    }

    /// Re-run the current executable in worker mode
    pub fn current_exe() -> Result<Self, TransportError> {
        Ok(Self::new(std::env::current_exe()?))
    }

    #[cfg(test)]
    fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

impl Spawner for ProcessSpawner {
    fn spawn<'a>(&'a self, worker_id: &'a str) -> BoxFuture<'a, Result<SpawnedProcess, TransportError>> {
        Box::pin(async move {
            let mut command = Command::new(&self.binary);
            command
                .args(&self.args)
                .env("TESTRIG_WORKER_ID", worker_id)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .kill_on_drop(true);

            let mut child = command
                .spawn()
                .map_err(|err| TransportError::Spawn(format!("{}: {err}", self.binary.display())))?;
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| TransportError::Spawn("worker stdin missing".to_string()))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| TransportError::Spawn("worker stdout missing".to_string()))?;
            let pid = child.id();
            info!(worker_id, pid, "spawned worker process");

            let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
            let (messages_tx, messages_rx) = mpsc::unbounded_channel();
            let (kill_tx, mut kill_rx) = mpsc::unbounded_channel::<()>();
            let (status_tx, status_rx) = watch::channel(ProcessStatus::Running);

            let id = worker_id.to_string();
            tokio::spawn(async move {
                let mut writer = BufWriter::new(stdin);
                while let Some(message) = outbound_rx.recv().await {
                    if let Err(err) = codec::write_message(&mut writer, &message).await {
                        warn!(worker_id = %id, error = %err, "failed to write to worker");
                        break;
                    }
                }
                // dropping the writer closes the worker's stdin
            });

            let id = worker_id.to_string();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout);
                loop {
                    match codec::read_message(&mut reader).await {
                        Ok(Some(message)) => {
                            if messages_tx.send(message).is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(TransportError::Codec(err)) => {
                            warn!(worker_id = %id, error = %err, "skipping malformed worker message");
                        }
                        Err(err) => {
                            warn!(worker_id = %id, error = %err, "worker stdout failed");
                            break;
                        }
                    }
                }
                debug!(worker_id = %id, "worker stdout closed");
            });

            let id = worker_id.to_string();
            tokio::spawn(async move {
                let exit = tokio::select! {
                    exit = child.wait() => exit,
                    Some(()) = kill_rx.recv() => {
                        if let Err(err) = child.start_kill() {
                            warn!(worker_id = %id, error = %err, "failed to kill worker");
                        }
                        child.wait().await
                    }
                };
                let status = match exit {
                    Ok(exit) => ProcessStatus::Exited(exit.code()),
                    Err(err) => ProcessStatus::Errored(err.to_string()),
                };
                debug!(worker_id = %id, %status, "worker process exited");
                status_tx.send_replace(status);
            });

            let handle = ChildHandle {
                outbound: Mutex::new(Some(outbound_tx)),
                kill: kill_tx,
                status: status_rx,
            };
            Ok(SpawnedProcess {
                handle: Arc::new(handle),
                messages: messages_rx,
            })
        })
    }
}

struct ChildHandle {
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    kill: mpsc::UnboundedSender<()>,
    status: watch::Receiver<ProcessStatus>,
}

impl ProcessHandle for ChildHandle {
    fn send(&self, message: Message) -> Result<(), TransportError> {
        let outbound = self.outbound.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        outbound
            .as_ref()
            .ok_or(TransportError::Closed)?
            .send(message)
            .map_err(|_| TransportError::Closed)
    }

    fn kill(&self, signal: KillSignal) -> Result<(), TransportError> {
        match signal {
            KillSignal::Terminate => {
                self.outbound
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
                Ok(())
            }
            KillSignal::Kill => self.kill.send(()).map_err(|_| TransportError::Closed),
        }
    }

    fn status(&self) -> watch::Receiver<ProcessStatus> {
        self.status.clone()
    }
}
