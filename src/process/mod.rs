//! Worker process handles and spawners
//!
//! A worker is either a real child process speaking JSON lines over stdio
//! ([`ProcessSpawner`]) or a task inside the supervisor ([`LocalSpawner`]).
//! Both hand the supervisor the same [`ProcessHandle`].

mod child;
mod local;

pub use child::ProcessSpawner;
pub use local::LocalSpawner;

use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::models::Message;
use crate::transport::TransportError;

/// Lifecycle of a spawned worker
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Exited(Option<i32>),
    Errored(String),
}

impl ProcessStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessStatus::Running)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::Running => write!(f, "running"),
            ProcessStatus::Exited(Some(code)) => write!(f, "exit code {code}"),
            ProcessStatus::Exited(None) => write!(f, "killed"),
            ProcessStatus::Errored(message) => write!(f, "error: {message}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KillSignal {
    /// Close the worker's input and let it wind down
    Terminate,
    /// Stop it immediately
    Kill,
}

/// Supervisor-side view of one worker
pub trait ProcessHandle: Send + Sync {
    fn send(&self, message: Message) -> Result<(), TransportError>;

    fn kill(&self, signal: KillSignal) -> Result<(), TransportError>;

    fn status(&self) -> watch::Receiver<ProcessStatus>;

    fn is_running(&self) -> bool {
        self.status().borrow().is_running()
    }
}

/// Wait until the worker is gone and report how it ended
pub async fn wait_for_exit(handle: &dyn ProcessHandle) -> ProcessStatus {
    let mut status = handle.status();
    let exit = match status.wait_for(|status| !status.is_running()).await {
        Ok(status) => status.clone(),
        // The status sender only goes away together with the process.
        Err(_) => ProcessStatus::Exited(None),
    };
    exit
}

/// A freshly spawned worker plus the stream of messages it emits
pub struct SpawnedProcess {
    pub handle: Arc<dyn ProcessHandle>,
    pub messages: mpsc::UnboundedReceiver<Message>,
}

pub trait Spawner: Send + Sync {
    fn spawn<'a>(&'a self, worker_id: &'a str) -> BoxFuture<'a, Result<SpawnedProcess, TransportError>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct StatusOnly {
        status: watch::Receiver<ProcessStatus>,
    }

    impl ProcessHandle for StatusOnly {
        fn send(&self, _message: Message) -> Result<(), TransportError> {
            Err(TransportError::Closed)
        }

        fn kill(&self, _signal: KillSignal) -> Result<(), TransportError> {
            Ok(())
        }

        fn status(&self) -> watch::Receiver<ProcessStatus> {
            self.status.clone()
        }
    }

    #[tokio::test]
    async fn test_wait_for_exit_reports_final_status() {
        let (tx, rx) = watch::channel(ProcessStatus::Running);
        let handle = StatusOnly { status: rx };
        assert!(handle.is_running());

        let exit = tokio::spawn(async move { wait_for_exit(&handle).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send_replace(ProcessStatus::Exited(Some(2)));

        let status = tokio::time::timeout(Duration::from_secs(1), exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, ProcessStatus::Exited(Some(2)));
    }

    #[tokio::test]
    async fn test_wait_for_exit_when_status_sender_is_gone() {
        let (tx, rx) = watch::channel(ProcessStatus::Running);
        drop(tx);
        let handle = StatusOnly { status: rx };

        assert_eq!(wait_for_exit(&handle).await, ProcessStatus::Exited(None));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ProcessStatus::Exited(Some(3)).to_string(), "exit code 3");
        assert_eq!(ProcessStatus::Exited(None).to_string(), "killed");
        assert!(ProcessStatus::Running.is_running());
        assert!(!ProcessStatus::Errored("boom".into()).is_running());
    }
}
