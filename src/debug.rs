//! Interactive debug session
//!
//! Runs a single test on a worker that holds it open until released, and
//! drives the worker's breakpoints from line-oriented commands.

use serde_json::{json, Value};
use std::str::FromStr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

use crate::executor::{TestWorker, WorkerError};
use crate::models::{EvaluateCodePayload, Message, MessageKind, SourceFile};
use crate::process::KillSignal;
use crate::transport::{Subscription, Transport};

pub const HELP: &str = "\
commands:
  pause          stop before the next instruction
  step           run one instruction, then stop again
  resume         continue until the test ends
  release        end the test now (or let a finished test report)
  eval <code>    evaluate a script snippet next to the test
  help           show this list";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DebugCommand {
    Pause,
    Step,
    Resume,
    Release,
    Eval(String),
    Help,
}

impl FromStr for DebugCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        match word {
            "pause" | "p" => Ok(DebugCommand::Pause),
            "step" | "s" | "next" | "n" => Ok(DebugCommand::Step),
            "resume" | "continue" | "c" => Ok(DebugCommand::Resume),
            "release" | "quit" | "q" => Ok(DebugCommand::Release),
            "eval" | "e" if !rest.trim().is_empty() => Ok(DebugCommand::Eval(rest.trim().to_string())),
            "eval" | "e" => Err("eval needs code to evaluate".to_string()),
            "help" | "h" | "?" => Ok(DebugCommand::Help),
            "" => Err("empty command".to_string()),
            other => Err(format!("unknown command '{other}'; try 'help'")),
        }
    }
}

impl DebugCommand {
    /// Wire message for this command; `path` names the evaluated snippet
    pub fn to_message(&self, path: &str) -> Option<Message> {
        match self {
            DebugCommand::Pause => Some(Message::PauseTestExecution),
            DebugCommand::Step => Some(Message::RunTillNextExecution),
            DebugCommand::Resume => Some(Message::ResumeTestExecution),
            DebugCommand::Release => Some(Message::ReleaseTest),
            DebugCommand::Eval(code) => Some(Message::EvaluateCode(EvaluateCodePayload {
                path: path.to_string(),
                content: code.clone(),
            })),
            DebugCommand::Help => None,
        }
    }
}

/// One line per worker state broadcast
pub fn describe_event(message: &Message) -> Option<String> {
    let (label, state) = match message {
        Message::Register(state) => ("register", state),
        Message::UpdateExecutionState(state) => ("state", state),
        Message::Unregister(state) => ("unregister", state),
        _ => return None,
    };
    Some(format!(
        "[{label}] paused={} pending={} step={}",
        state.paused, state.pending, state.paused_til_next
    ))
}

/// Drives one test step by step.
///
/// The worker must be built with `wait_for_release` set, otherwise it
/// ignores every control message.
pub struct DebugSession {
    worker: TestWorker,
}

impl DebugSession {
    pub fn new(worker: TestWorker) -> Self {
        Self { worker }
    }

    /// Run `file`, reading commands from `commands` until the test reports.
    /// When the commands run out the test is released.
    pub async fn run<R>(&self, file: &SourceFile, env_parameters: Value, commands: R) -> Result<(), WorkerError>
    where
        R: AsyncBufRead + Unpin,
    {
        let transport = self.worker.transport().clone();
        let instance = self.worker.spawn();
        let worker_id = instance.worker_id().to_string();
        let _listeners = watch_state(&transport, &worker_id);

        let registered = transport.once_from(&worker_id, MessageKind::Register);
        let execution = instance.execute(file, json!({ "retryCount": 0 }), env_parameters);
        tokio::pin!(execution);

        let result = tokio::select! {
            result = &mut execution => Some(result),
            _ = registered => None,
        };
        let result = match result {
            Some(result) => result,
            None => {
                println!("{HELP}");
                let mut lines = commands.lines();
                let mut input_open = true;
                loop {
                    tokio::select! {
                        result = &mut execution => break result,
                        line = lines.next_line(), if input_open => match line {
                            Ok(Some(line)) => self.dispatch(&transport, &worker_id, &file.path, &line),
                            Ok(None) => {
                                debug!("commands exhausted; releasing test");
                                input_open = false;
                                release_all(&transport);
                            }
                            Err(err) => {
                                warn!(error = %err, "failed to read command; releasing test");
                                input_open = false;
                                release_all(&transport);
                            }
                        },
                    }
                }
            }
        };

        instance.kill(KillSignal::Terminate).await?;
        result
    }

    fn dispatch(&self, transport: &Transport, worker_id: &str, path: &str, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let command = match line.parse::<DebugCommand>() {
            Ok(command) => command,
            Err(message) => {
                println!("{message}");
                return;
            }
        };
        let Some(message) = command.to_message(path) else {
            println!("{HELP}");
            return;
        };
        if let Err(err) = transport.send(worker_id, message) {
            warn!(worker_id, error = %err, "failed to send debug command");
        }
    }
}

/// Release every worker on the hub so none is left holding a test
fn release_all(transport: &Transport) {
    let released = transport.broadcast_universally(Message::ReleaseTest);
    debug!(released, "released held tests");
}

fn watch_state(transport: &Transport, worker_id: &str) -> Vec<Subscription> {
    [
        MessageKind::Register,
        MessageKind::UpdateExecutionState,
        MessageKind::Unregister,
    ]
    .into_iter()
    .map(|kind| {
        let worker_id = worker_id.to_string();
        transport.on(kind, move |inbound| {
            if inbound.source == worker_id {
                if let Some(line) = describe_event(&inbound.message) {
                    println!("{line}");
                }
            }
        })
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deps::MemoryReader;
    use crate::executor::WorkerOptions;
    use crate::models::ExecutionState;
    use crate::process::LocalSpawner;
    use std::sync::Arc;
    use std::time::Duration;

    fn session() -> DebugSession {
        let worker = TestWorker::new(Arc::new(Transport::new()), Arc::new(LocalSpawner))
            .with_reader(Arc::new(MemoryReader::new()))
            .with_options(WorkerOptions {
                wait_for_release: true,
                ..Default::default()
            });
        DebugSession::new(worker)
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!("pause".parse::<DebugCommand>(), Ok(DebugCommand::Pause));
        assert_eq!(" s ".parse::<DebugCommand>(), Ok(DebugCommand::Step));
        assert_eq!("continue".parse::<DebugCommand>(), Ok(DebugCommand::Resume));
        assert_eq!("q".parse::<DebugCommand>(), Ok(DebugCommand::Release));
        assert_eq!(
            "eval log(\"x y\")".parse::<DebugCommand>(),
            Ok(DebugCommand::Eval("log(\"x y\")".to_string()))
        );
        assert!("eval".parse::<DebugCommand>().is_err());
        assert!("jump".parse::<DebugCommand>().is_err());
        assert!("".parse::<DebugCommand>().is_err());
    }

    #[test]
    fn test_commands_map_to_messages() {
        assert_eq!(
            DebugCommand::Step.to_message("/t/a.tst"),
            Some(Message::RunTillNextExecution)
        );
        assert_eq!(DebugCommand::Help.to_message("/t/a.tst"), None);
        match DebugCommand::Eval("log(1)".into()).to_message("/t/a.tst") {
            Some(Message::EvaluateCode(payload)) => {
                assert_eq!(payload.path, "/t/a.tst");
                assert_eq!(payload.content, "log(1)");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_describe_event() {
        let state = ExecutionState {
            paused: true,
            pending: true,
            paused_til_next: false,
        };
        assert_eq!(
            describe_event(&Message::UpdateExecutionState(state)).as_deref(),
            Some("[state] paused=true pending=true step=false")
        );
        assert_eq!(describe_event(&Message::ReleaseTest), None);
    }

    #[tokio::test]
    async fn test_session_steps_and_releases() {
        let file = SourceFile::new("/t/debug.tst", "log(\"a\")\nsleep(20)\nlog(\"b\")\n");
        let commands: &[u8] = b"pause\nstep\nbogus\neval log(\"peek\")\nresume\nrelease\n";

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            session().run(&file, json!({}), commands),
        )
        .await
        .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_session_releases_when_input_ends() {
        let file = SourceFile::new("/t/debug.tst", "log(\"only\")\n");

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            session().run(&file, json!({}), &b""[..]),
        )
        .await
        .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_session_reports_failures() {
        let file = SourceFile::new("/t/debug.tst", "fail(\"nope\")\n");

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            session().run(&file, json!({}), &b""[..]),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(WorkerError::TestFailed(_))));
    }
}
