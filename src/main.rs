//! testrig - parallel test orchestrator
//!
//! Runs test scripts across a pool of sandboxed worker processes. Each test
//! is bundled with its local imports, shipped to a worker over a JSON line
//! protocol and retried on failure.
//!
//! ## Features
//!
//! - Dependency bundling: every local import travels with the test
//! - Worker pool with lazy spawn, reuse and optional restart per test
//! - Bounded retries, bail-on-first-failure and live queue additions
//! - Step-by-step debugging of a single test
//! - Table, JSON and CSV reports
//!
//! ## Usage
//!
//! ```bash
//! # Run tests on four workers
//! testrig run tests/*.tst --workers 4
//!
//! # Stop at the first failure and save the report
//! testrig run tests/*.tst --bail --output report.json
//!
//! # Inspect what gets bundled with a test
//! testrig deps tests/login.tst
//!
//! # Step through a test
//! testrig debug tests/login.tst
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use std::sync::Arc;
use futures::future::{join_all, FutureExt};
use tracing::{debug, info, warn};

mod cli;
mod config;
mod debug;
mod deps;
mod executor;
mod models;
mod output;
mod process;
mod sandbox;
mod script;
mod transport;
mod utils;
mod worker;

use cli::{Args, Command};
use config::env::EnvConfig;
use config::AppConfig;
use debug::DebugSession;
use executor::{LoggingHooks, RunOutcome, SetupFiles, TestRunController, TestWorker};
use models::{RunReport, SourceFile};
use output::{OutputFormat, ResultFormatter};
use process::{LocalSpawner, ProcessSpawner, Spawner};
use transport::Transport;
use utils::logger::{init_logger, LogLevel, Output};
use utils::timer::Timer;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let env_config = EnvConfig::load();
    let level = log_level(&args, &env_config)?;

    if let Command::Worker = args.command {
        // stdout carries the protocol
        init_logger(level, Output::Stderr);
        let worker_id = std::env::var("TESTRIG_WORKER_ID").unwrap_or_else(|_| "worker".to_string());
        info!(%worker_id, "worker started");
        worker::run_stdio().await.context("Worker transport failed")?;
        return Ok(());
    }

    init_logger(level, Output::Stdout);
    if env_config.has_any() {
        debug!(?env_config, "environment overrides");
    }
    let path = args
        .config
        .clone()
        .or_else(|| env_config.config_file.clone().map(Into::into));
    let mut config = AppConfig::load_or_default(path.as_deref())?;
    env_config.apply(&mut config);

    let success = match args.command {
        Command::Run(run_args) => run_tests(run_args, config).await?,
        Command::Deps(deps_args) => {
            show_dependencies(deps_args, &config).await?;
            true
        }
        Command::Debug(debug_args) => debug_test(debug_args, config).await?,
        Command::Config(config_args) => {
            manage_config(config_args, &config)?;
            true
        }
        Command::Worker => true,
    };

    if !success {
        std::process::exit(1);
    }
    Ok(())
}

fn log_level(args: &Args, env_config: &EnvConfig) -> Result<LogLevel> {
    match args.log_level.as_ref().or(env_config.log_level.as_ref()) {
        Some(level) => level.parse().map_err(|err: String| anyhow::anyhow!(err)),
        None => Ok(LogLevel::from_verbosity(args.verbose)),
    }
}

fn build_worker(config: &AppConfig, wait_for_release: bool) -> Result<TestWorker> {
    let spawner: Arc<dyn Spawner> = if config.local_workers {
        Arc::new(LocalSpawner)
    } else {
        match &config.worker_binary {
            Some(binary) => Arc::new(ProcessSpawner::new(binary)),
            None => Arc::new(ProcessSpawner::current_exe().context("Failed to locate worker binary")?),
        }
    };

    Ok(TestWorker::new(Arc::new(Transport::new()), spawner)
        .with_options(config.worker_options(wait_for_release))
        .with_hooks(Arc::new(SetupFiles::new(config.setup_file_paths()?))))
}

async fn read_sources(paths: &[std::path::PathBuf]) -> Result<Vec<SourceFile>> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let file = SourceFile::read(path)
            .await
            .with_context(|| format!("Failed to read test file: {}", path.display()))?;
        files.push(file);
    }
    Ok(files)
}

async fn run_tests(args: cli::RunArgs, mut config: AppConfig) -> Result<bool> {
    let format: OutputFormat = args.format.parse()?;
    args.apply(&mut config);
    config.validate()?;

    let files = read_sources(&args.files).await?;
    let total = files.len() + args.eval.len();
    let worker = build_worker(&config, false)?;
    let controller =
        TestRunController::new(config.run_config(), worker).with_hooks(Arc::new(LoggingHooks));

    let timer = Timer::start("run");
    // inline sources join the run started by the files
    let mut runs = Vec::new();
    if !files.is_empty() {
        runs.push(controller.run_queue(files).boxed());
    }
    for source in &args.eval {
        runs.push(controller.push_test_into_queue(source.clone()).boxed());
    }
    let run = join_all(runs).map(merge_outcomes);
    tokio::pin!(run);
    let errors = tokio::select! {
        errors = &mut run => errors,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; stopping workers");
            controller.kill().await;
            run.await
        }
    };

    let report = RunReport::new(timer.started_at(), timer.elapsed_ms(), total, errors);
    println!("{}", ResultFormatter::new(format).format_report(&report)?);

    if let Some(path) = &args.output {
        report.save(path)?;
        info!("Report saved to {}", path.display());
    }

    Ok(report.is_success())
}

/// Joined calls resolve with the same run's outcome; report each failure once
fn merge_outcomes(outcomes: Vec<RunOutcome>) -> RunOutcome {
    let mut errors: Vec<_> = outcomes.into_iter().flatten().flatten().collect();
    errors.sort_by(|left, right| left.path.cmp(&right.path));
    errors.dedup_by(|left, right| left.path == right.path);
    (!errors.is_empty()).then_some(errors)
}

async fn show_dependencies(args: cli::DepsArgs, config: &AppConfig) -> Result<()> {
    config.validate()?;
    let options = config.build_options();
    let reader = deps::FsReader;

    let file = SourceFile::read(&args.file)
        .await
        .with_context(|| format!("Failed to read test file: {}", args.file.display()))?;
    let mut dictionary = deps::build_dependency_dictionary(&file, &reader, &options).await?;

    if args.with_setup {
        for path in config.setup_file_paths()? {
            let setup = SourceFile::read(&path)
                .await
                .with_context(|| format!("Failed to read setup file: {}", path.display()))?;
            let extra = deps::build_dependency_dictionary(&setup, &reader, &options).await?;
            dictionary = deps::merge_dependency_dictionaries(dictionary, extra);
        }
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&dictionary).context("Failed to serialize dependencies")?
    );
    Ok(())
}

async fn debug_test(args: cli::DebugArgs, mut config: AppConfig) -> Result<bool> {
    config.local_workers |= args.local;
    config.validate()?;

    let file = SourceFile::read(&args.file)
        .await
        .with_context(|| format!("Failed to read test file: {}", args.file.display()))?;
    let session = DebugSession::new(build_worker(&config, true)?);
    let commands = tokio::io::BufReader::new(tokio::io::stdin());

    match session
        .run(&file, Value::Object(config.env_parameters.clone()), commands)
        .await
    {
        Ok(()) => {
            println!("PASS {}", file.path);
            Ok(true)
        }
        Err(err) => {
            println!("FAIL {}: {err}", file.path);
            Ok(false)
        }
    }
}

fn manage_config(args: cli::ConfigArgs, config: &AppConfig) -> Result<()> {
    match args.action {
        cli::ConfigAction::Show { format } => {
            let content = match format.as_str() {
                "json" => serde_json::to_string_pretty(config)?,
                "yaml" | "yml" => serde_yaml::to_string(config)?,
                other => anyhow::bail!("unknown config format '{other}' (yaml, json)"),
            };
            println!("{content}");
        }
        cli::ConfigAction::Init { path, force } => {
            if path.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
            }
            AppConfig::default().save(&path)?;
            println!("Wrote default configuration to {}", path.display());
        }
        cli::ConfigAction::Env => config::env::print_env_help(),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use executor::WorkerError;
    use models::TestError;

    fn failed(path: &str) -> TestError {
        TestError::new(path, 1, WorkerError::Crashed("boom".into()))
    }

    #[test]
    fn test_merge_outcomes_reports_each_failure_once() {
        let shared = Some(vec![failed("/t/b.tst"), failed("/t/a.tst")]);
        let merged = merge_outcomes(vec![shared.clone(), shared, None]).unwrap();

        let paths: Vec<_> = merged.iter().map(|error| error.path.as_str()).collect();
        assert_eq!(paths, vec!["/t/a.tst", "/t/b.tst"]);
        assert!(merge_outcomes(vec![None, None]).is_none());
    }
}
