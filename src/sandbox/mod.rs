//! Sandboxed execution of compiled test scripts
//!
//! A [`Sandbox`] interprets one compiled script. Imports resolve from the
//! dependency dictionary shipped with the test, never from disk. Tests talk
//! back to their worker through a [`TestBus`] and can register callbacks to
//! run once the test is finished.

mod breakpoints;

pub use breakpoints::{Break, Breakpoints};

use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::deps::{is_framework_request, DependencyDictionary};
use crate::models::ErrorPayload;
use crate::script::{self, Call, Literal, ParseError, Program};

/// Position of one executing call, innermost last
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub callee: String,
    pub path: String,
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "at {} ({}:{}:{})",
            self.callee, self.path, self.line, self.column
        )
    }
}

/// Errors raised while evaluating a script
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("{path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: ParseError,
    },

    #[error("{message}")]
    Thrown {
        name: String,
        message: String,
        trace: Vec<Frame>,
    },

    #[error("test signalled start but never finished")]
    Abandoned,

    #[error(transparent)]
    Break(#[from] Break),
}

impl SandboxError {
    pub fn thrown(name: impl Into<String>, message: impl Into<String>) -> Self {
        SandboxError::Thrown {
            name: name.into(),
            message: message.into(),
            trace: Vec::new(),
        }
    }

    pub fn is_break(&self) -> bool {
        matches!(self, SandboxError::Break(_))
    }

    fn with_trace(mut self, stack: &[Frame]) -> Self {
        if let SandboxError::Thrown { trace, .. } = &mut self {
            if trace.is_empty() {
                *trace = stack.iter().rev().cloned().collect();
            }
        }
        self
    }

    /// Normalize into the shape sent across the process boundary
    pub fn to_payload(&self) -> ErrorPayload {
        let name = match self {
            SandboxError::Parse { .. } => "SyntaxError",
            SandboxError::Thrown { name, .. } => name.as_str(),
            SandboxError::Abandoned => "AbandonedTestError",
            SandboxError::Break(_) => "Break",
        };
        let message = self.to_string();

        let mut stack = format!("{name}: {message}");
        if let SandboxError::Thrown { trace, .. } = self {
            for frame in trace {
                stack.push_str("\n    ");
                stack.push_str(&frame.to_string());
            }
        }

        ErrorPayload::new(name, message).with_stack(stack)
    }
}

/// Lifecycle signals a test emits on its bus
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BusEvent {
    Started,
    Finished,
    Failed(String),
}

/// Test-scoped signal bus
#[derive(Clone, Debug)]
pub struct TestBus {
    tx: mpsc::UnboundedSender<BusEvent>,
}

impl TestBus {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: BusEvent) {
        // The receiver is gone once the test settled; late signals are moot.
        let _ = self.tx.send(event);
    }
}

/// Paths of modules already evaluated in this process
#[derive(Clone, Debug, Default)]
pub struct ModuleCache {
    loaded: Arc<Mutex<HashSet<String>>>,
}

impl ModuleCache {
    /// Returns false when the module was already evaluated (or is being evaluated)
    fn mark(&self, path: &str) -> bool {
        self.lock().insert(path.to_string())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.loaded.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub type AfterRunCallback = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Callbacks a test registers to run after it is finished
#[derive(Clone, Default)]
pub struct AfterRunCallbacks {
    callbacks: Arc<Mutex<Vec<AfterRunCallback>>>,
}

impl AfterRunCallbacks {
    pub fn register(&self, callback: AfterRunCallback) {
        self.lock().push(callback);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Run every registered callback once; failures are logged, never raised.
    /// Returns the number of callbacks that failed.
    pub async fn flush(&self) -> usize {
        let callbacks = std::mem::take(&mut *self.lock());
        let mut failures = 0;
        for callback in callbacks {
            if let Err(err) = callback().await {
                warn!(error = %err, "after-run callback failed");
                failures += 1;
            }
        }
        failures
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<AfterRunCallback>> {
        self.callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Everything a sandbox shares with the worker hosting it
#[derive(Clone)]
pub struct SandboxContext {
    pub bus: TestBus,
    pub parameters: Value,
    pub env_parameters: Value,
    /// `None` runs without suspension points
    pub breakpoints: Option<Arc<Breakpoints>>,
    pub module_cache: ModuleCache,
    pub after_run: AfterRunCallbacks,
    /// Callee that imports a module from the dependency dictionary
    pub import_callee: String,
}

/// One compiled script plus the modules it may import
pub struct Sandbox {
    source: String,
    path: String,
    dependencies: Arc<DependencyDictionary>,
    context: SandboxContext,
}

impl Sandbox {
    pub fn new(
        source: impl Into<String>,
        path: impl Into<String>,
        dependencies: Arc<DependencyDictionary>,
        context: SandboxContext,
    ) -> Self {
        Self {
            source: source.into(),
            path: path.into(),
            dependencies,
            context,
        }
    }

    /// Evaluate the script; resolves when its last statement has run
    pub async fn execute(&self) -> Result<(), SandboxError> {
        let program = parse(&self.path, &self.source)?;
        self.context.module_cache.mark(&self.path);
        let mut stack = Vec::new();
        self.run_program(&self.path, &program, &mut stack).await
    }

    fn run_program<'a>(
        &'a self,
        path: &'a str,
        program: &'a Program,
        stack: &'a mut Vec<Frame>,
    ) -> BoxFuture<'a, Result<(), SandboxError>> {
        Box::pin(async move {
            for call in &program.statements {
                stack.push(Frame {
                    callee: call.callee.clone(),
                    path: path.to_string(),
                    line: call.line,
                    column: call.column,
                });
                if let Err(err) = self.step(path, call, stack).await {
                    return Err(err.with_trace(stack));
                }
                stack.pop();
            }
            Ok(())
        })
    }

    async fn step(
        &self,
        path: &str,
        call: &Call,
        stack: &mut Vec<Frame>,
    ) -> Result<(), SandboxError> {
        if let Some(breakpoints) = &self.context.breakpoints {
            breakpoints.before_instruction().await?;
        }
        self.exec(path, call, stack).await?;
        if let Some(breakpoints) = &self.context.breakpoints {
            breakpoints.after_instruction().await?;
        }
        Ok(())
    }

    async fn exec(
        &self,
        path: &str,
        call: &Call,
        stack: &mut Vec<Frame>,
    ) -> Result<(), SandboxError> {
        if call.callee == self.context.import_callee {
            return self.require(path, str_arg(call, 0)?, stack).await;
        }
        match call.callee.as_str() {
            "log" => {
                info!(test = %self.path, "{}", str_arg(call, 0)?);
                Ok(())
            }
            "sleep" => self.sleep(int_arg(call, 0)?).await,
            "emit" => {
                self.context.bus.emit(bus_event(call, 0)?);
                Ok(())
            }
            "emit_after" => {
                let delay = Duration::from_millis(int_arg(call, 0)?);
                let event = bus_event(call, 1)?;
                let bus = self.context.bus.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    bus.emit(event);
                });
                Ok(())
            }
            "fail" => Err(SandboxError::thrown("Error", str_arg(call, 0)?)),
            "assert_eq" => {
                let (left, right) = (arg(call, 0)?, arg(call, 1)?);
                if left == right {
                    Ok(())
                } else {
                    Err(SandboxError::thrown(
                        "AssertionError",
                        format!("expected {right}, got {left}"),
                    ))
                }
            }
            "pass_after_retries" => {
                let required = int_arg(call, 0)?;
                let retry_count = self.context.parameters["retryCount"].as_u64().unwrap_or(0);
                if retry_count >= required {
                    Ok(())
                } else {
                    Err(SandboxError::thrown(
                        "Error",
                        format!("needs {required} retries, this is retry {retry_count}"),
                    ))
                }
            }
            "assert_env" => {
                let key = str_arg(call, 0)?;
                let expected = str_arg(call, 1)?;
                let actual = match self.context.env_parameters.get(key) {
                    Some(Value::String(value)) => Some(value.clone()),
                    Some(other) => Some(other.to_string()),
                    None => None,
                };
                if actual.as_deref() == Some(expected) {
                    Ok(())
                } else {
                    Err(SandboxError::thrown(
                        "AssertionError",
                        format!("env parameter '{key}' is {actual:?}, expected \"{expected}\""),
                    ))
                }
            }
            "after_run" => {
                let message = str_arg(call, 0)?.to_string();
                let test = self.path.clone();
                self.context.after_run.register(Box::new(move || {
                    Box::pin(async move {
                        info!(test = %test, "{message}");
                        Ok(())
                    })
                }));
                Ok(())
            }
            "after_run_error" => {
                let message = str_arg(call, 0)?.to_string();
                self.context.after_run.register(Box::new(move || {
                    Box::pin(async move { Err(anyhow::anyhow!(message)) })
                }));
                Ok(())
            }
            other => Err(SandboxError::thrown(
                "ReferenceError",
                format!("{other} is not defined"),
            )),
        }
    }

    async fn require(
        &self,
        path: &str,
        request: &str,
        stack: &mut Vec<Frame>,
    ) -> Result<(), SandboxError> {
        if is_framework_request(request) {
            return Ok(());
        }

        let module = self
            .dependencies
            .get(path)
            .and_then(|imports| imports.get(request))
            .ok_or_else(|| {
                SandboxError::thrown(
                    "ModuleNotFoundError",
                    format!("cannot find module '{request}' from {path}"),
                )
            })?;

        if !self.context.module_cache.mark(&module.path) {
            return Ok(());
        }

        let program = parse(&module.path, &module.content)?;
        self.run_program(&module.path, &program, stack).await
    }

    async fn sleep(&self, millis: u64) -> Result<(), SandboxError> {
        let delay = tokio::time::sleep(Duration::from_millis(millis));
        match &self.context.breakpoints {
            Some(breakpoints) => tokio::select! {
                _ = delay => Ok(()),
                _ = breakpoints.broken() => Err(Break.into()),
            },
            None => {
                delay.await;
                Ok(())
            }
        }
    }
}

fn parse(path: &str, source: &str) -> Result<Program, SandboxError> {
    script::parse(source).map_err(|source| SandboxError::Parse {
        path: path.to_string(),
        source,
    })
}

fn arg(call: &Call, index: usize) -> Result<&Literal, SandboxError> {
    call.args.get(index).ok_or_else(|| {
        SandboxError::thrown(
            "TypeError",
            format!("{} expects an argument at position {}", call.callee, index + 1),
        )
    })
}

fn str_arg(call: &Call, index: usize) -> Result<&str, SandboxError> {
    arg(call, index)?.as_str().ok_or_else(|| {
        SandboxError::thrown(
            "TypeError",
            format!("{} expects a string at position {}", call.callee, index + 1),
        )
    })
}

fn int_arg(call: &Call, index: usize) -> Result<u64, SandboxError> {
    arg(call, index)?
        .as_int()
        .and_then(|value| u64::try_from(value).ok())
        .ok_or_else(|| {
            SandboxError::thrown(
                "TypeError",
                format!(
                    "{} expects a non-negative integer at position {}",
                    call.callee,
                    index + 1
                ),
            )
        })
}

fn bus_event(call: &Call, index: usize) -> Result<BusEvent, SandboxError> {
    match str_arg(call, index)? {
        "started" => Ok(BusEvent::Started),
        "finished" => Ok(BusEvent::Finished),
        "failed" => {
            let message = match call.args.get(index + 1) {
                Some(_) => str_arg(call, index + 1)?.to_string(),
                None => "test failed".to_string(),
            };
            Ok(BusEvent::Failed(message))
        }
        other => Err(SandboxError::thrown(
            "TypeError",
            format!("unknown test event '{other}'"),
        )),
    }
}
