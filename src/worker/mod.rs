//! Worker-side execution controller
//!
//! Runs inside every worker. Receives `executeTest` and the debug control
//! messages, drives the sandbox, and reports back with `register`,
//! `updateExecutionState`, `unregister` and finally `executionComplete`.

mod state;

use std::sync::Arc;
use tokio::io::{BufReader, BufWriter};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::deps::{DependencyDictionary, DEFAULT_IMPORT_CALLEE};
use crate::models::{
    ErrorPayload, EvaluateCodePayload, ExecuteTestPayload, ExecutionCompletePayload, Message,
};
use crate::sandbox::{
    AfterRunCallbacks, Breakpoints, BusEvent, ModuleCache, Sandbox, SandboxContext, SandboxError,
    TestBus,
};
use crate::transport::{codec, TransportError, WorkerChannel};
use state::StateBroadcaster;

type Settled = (u64, Result<(), SandboxError>);

struct ActiveTest {
    id: u64,
    path: String,
    dependencies: Arc<DependencyDictionary>,
    import_callee: String,
    wait_for_release: bool,
    /// Finished, held open until `releaseTest`
    awaiting_release: bool,
    task: JoinHandle<()>,
}

pub struct ExecutionController {
    channel: WorkerChannel,
    state: StateBroadcaster,
    breakpoints: Arc<Breakpoints>,
    module_cache: ModuleCache,
    after_run: AfterRunCallbacks,
    /// Set by the first test asking to wait for release; never unset
    debug_controls: bool,
    active: Option<ActiveTest>,
    /// `evaluateCode` snippets still running
    evaluations: JoinSet<()>,
    next_id: u64,
}

impl ExecutionController {
    pub fn new(channel: WorkerChannel) -> Self {
        Self {
            state: StateBroadcaster::new(channel.clone()),
            channel,
            breakpoints: Arc::new(Breakpoints::new()),
            module_cache: ModuleCache::default(),
            after_run: AfterRunCallbacks::default(),
            debug_controls: false,
            active: None,
            evaluations: JoinSet::new(),
            next_id: 0,
        }
    }

    /// Serve until the inbound side closes
    pub async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<Message>) {
        let (settled_tx, mut settled_rx) = mpsc::unbounded_channel::<Settled>();

        loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(message) => self.handle(message, &settled_tx).await,
                    None => break,
                },
                Some((id, result)) = settled_rx.recv() => self.settle(id, result).await,
                Some(joined) = self.evaluations.join_next(), if !self.evaluations.is_empty() => {
                    if let Err(err) = joined {
                        warn!(error = %err, "evaluation task failed");
                    }
                    self.evaluation_finished();
                }
            }
        }

        if let Some(active) = self.active.take() {
            warn!(test = %active.path, "worker shutting down with a test in flight");
            active.task.abort();
        }
        debug!("worker inbound closed");
    }

    async fn handle(&mut self, message: Message, settled: &mpsc::UnboundedSender<Settled>) {
        match message {
            Message::ExecuteTest(payload) => self.execute_test(payload, settled),
            Message::EvaluateCode(payload) => self.evaluate_code(payload),
            control @ (Message::PauseTestExecution
            | Message::RunTillNextExecution
            | Message::ResumeTestExecution
            | Message::ReleaseTest) => {
                if self.debug_controls {
                    self.control(control).await;
                } else {
                    debug!(kind = %control.kind(), "debug controls not installed; ignoring");
                }
            }
            other => warn!(kind = %other.kind(), "unexpected message for a worker"),
        }
    }

    fn execute_test(&mut self, payload: ExecuteTestPayload, settled: &mpsc::UnboundedSender<Settled>) {
        if let Some(active) = &self.active {
            warn!(running = %active.path, requested = %payload.path, "worker busy; rejecting executeTest");
            let error = ErrorPayload::new("WorkerBusyError", format!("worker busy running {}", active.path));
            self.channel
                .broadcast_universally(Message::ExecutionComplete(ExecutionCompletePayload::failed(error)));
            return;
        }

        self.channel
            .broadcast_universally(Message::Register(self.state.current()));
        if payload.wait_for_release && !self.debug_controls {
            self.debug_controls = true;
            debug!("debug controls installed");
        }
        self.breakpoints.reset();
        self.state.set_pending(true);

        self.next_id += 1;
        let id = self.next_id;
        let dependencies = Arc::new(payload.dependencies);
        let (bus, events) = TestBus::channel();
        let context = SandboxContext {
            bus,
            parameters: payload.parameters,
            env_parameters: payload.env_parameters,
            breakpoints: Some(self.breakpoints.clone()),
            module_cache: self.module_cache.clone(),
            after_run: self.after_run.clone(),
            import_callee: payload.import_callee.clone(),
        };

        info!(test = %payload.path, "executing test");
        let sandbox = Sandbox::new(payload.content, payload.path.clone(), dependencies.clone(), context);
        let breakpoints = self.breakpoints.clone();
        let settled = settled.clone();
        let task = tokio::spawn(async move {
            let result = run_test(sandbox, events, &breakpoints).await;
            // the controller only goes away together with the worker
            let _ = settled.send((id, result));
        });

        self.active = Some(ActiveTest {
            id,
            path: payload.path,
            dependencies,
            import_callee: payload.import_callee,
            wait_for_release: payload.wait_for_release,
            awaiting_release: false,
            task,
        });
    }

    async fn settle(&mut self, id: u64, result: Result<(), SandboxError>) {
        let Some(active) = self.active.as_mut().filter(|active| active.id == id) else {
            debug!(id, "ignoring stale test result");
            return;
        };
        let path = active.path.clone();
        // a release that raced the last instruction still counts
        if active.wait_for_release && result.is_ok() && !self.breakpoints.is_broken() {
            active.awaiting_release = true;
        }
        self.state.set_pending(!self.evaluations.is_empty());

        match result {
            Ok(()) if self.awaiting_release() => {
                info!(test = %path, "test finished; waiting for release");
            }
            Ok(()) => self.complete(None).await,
            Err(err) if err.is_break() => {
                debug!(test = %path, "test released early");
                self.complete(None).await;
            }
            Err(err) => {
                warn!(test = %path, error = %err, "test failed");
                self.complete(Some(err.to_payload())).await;
            }
        }
    }

    async fn control(&mut self, message: Message) {
        match message {
            Message::PauseTestExecution => {
                self.state.set_paused(true);
                self.breakpoints.pause();
            }
            Message::RunTillNextExecution => {
                self.state.set_paused(false);
                self.breakpoints.run_till_next();
                self.state.set_paused_til_next(true);
            }
            Message::ResumeTestExecution => {
                self.state.set_paused(false);
                self.state.set_paused_til_next(false);
                self.breakpoints.resume();
            }
            Message::ReleaseTest => {
                if !self.evaluations.is_empty() {
                    debug!("interrupting evaluated code");
                    self.evaluations.shutdown().await;
                    self.evaluation_finished();
                }
                if self.test_running() {
                    self.breakpoints.break_execution();
                } else if self.awaiting_release() {
                    self.complete(None).await;
                } else {
                    debug!("nothing to release");
                }
            }
            _ => {}
        }
    }

    fn awaiting_release(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| active.awaiting_release)
    }

    /// A test is executing and has not settled yet
    fn test_running(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| !active.awaiting_release)
    }

    /// Run a snippet next to the current test without blocking control
    /// messages; `releaseTest` interrupts it
    fn evaluate_code(&mut self, payload: EvaluateCodePayload) {
        self.state.set_pending(true);

        let (dependencies, import_callee) = match &self.active {
            Some(active) => (active.dependencies.clone(), active.import_callee.clone()),
            None => (Arc::default(), DEFAULT_IMPORT_CALLEE.to_string()),
        };
        let context = SandboxContext {
            bus: TestBus::channel().0,
            parameters: serde_json::Value::Null,
            env_parameters: serde_json::Value::Null,
            breakpoints: None,
            module_cache: self.module_cache.clone(),
            after_run: self.after_run.clone(),
            import_callee,
        };
        let path = payload.path.clone();
        let sandbox = Sandbox::new(payload.content, payload.path, dependencies, context);
        self.evaluations.spawn(async move {
            if let Err(err) = sandbox.execute().await {
                warn!(%path, error = %err, "evaluated code failed");
            }
        });
    }

    fn evaluation_finished(&mut self) {
        if self.evaluations.is_empty() {
            self.state.set_pending(self.test_running());
        }
    }

    async fn complete(&mut self, error: Option<ErrorPayload>) {
        self.state.set_paused(false);
        self.state.set_paused_til_next(false);
        self.breakpoints.resume();

        let failures = self.after_run.flush().await;
        if failures > 0 {
            debug!(failures, "after-run callbacks failed");
        }
        self.module_cache.clear();

        self.channel
            .broadcast_universally(Message::Unregister(self.state.current()));
        let payload = match error {
            None => ExecutionCompletePayload::done(),
            Some(error) => ExecutionCompletePayload::failed(error),
        };
        self.channel
            .broadcast_universally(Message::ExecutionComplete(payload));
        self.active = None;
    }
}

/// Evaluate the test, then honor its start/finish signals
async fn run_test(
    sandbox: Sandbox,
    mut events: mpsc::UnboundedReceiver<BusEvent>,
    breakpoints: &Breakpoints,
) -> Result<(), SandboxError> {
    sandbox.execute().await?;
    // Only timers the test scheduled may still signal from here on.
    drop(sandbox);

    let mut started = false;
    while let Ok(event) = events.try_recv() {
        match event {
            BusEvent::Started => started = true,
            BusEvent::Finished => return Ok(()),
            BusEvent::Failed(message) => return Err(SandboxError::thrown("Error", message)),
        }
    }
    if !started {
        return Ok(());
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(BusEvent::Finished) => return Ok(()),
                Some(BusEvent::Failed(message)) => return Err(SandboxError::thrown("Error", message)),
                Some(BusEvent::Started) => {}
                None => return Err(SandboxError::Abandoned),
            },
            _ = breakpoints.broken() => return Err(crate::sandbox::Break.into()),
        }
    }
}

/// Worker process entry point: serve the protocol over stdin/stdout
pub async fn run_stdio() -> Result<(), TransportError> {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();

    let writer = tokio::spawn(async move {
        let mut stdout = BufWriter::new(tokio::io::stdout());
        while let Some(message) = outbound_rx.recv().await {
            codec::write_message(&mut stdout, &message).await?;
        }
        Ok::<_, TransportError>(())
    });

    tokio::spawn(async move {
        let mut stdin = BufReader::new(tokio::io::stdin());
        loop {
            match codec::read_message(&mut stdin).await {
                Ok(Some(message)) => {
                    if inbound_tx.send(message).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(TransportError::Codec(err)) => {
                    warn!(error = %err, "skipping malformed supervisor message");
                }
                Err(err) => {
                    warn!(error = %err, "stdin failed");
                    break;
                }
            }
        }
    });

    ExecutionController::new(WorkerChannel::new(outbound_tx))
        .run(inbound_rx)
        .await;

    writer
        .await
        .map_err(|err| TransportError::Io(std::io::Error::other(err)))?
}
