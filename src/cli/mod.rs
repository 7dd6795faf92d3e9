//! CLI argument parsing
//!
//! Defines command-line interface using clap.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::AppConfig;

/// Parallel test orchestrator with sandboxed worker processes
#[derive(Parser, Debug)]
#[command(name = "testrig")]
#[command(version)]
#[command(about = "Run test scripts across a pool of sandboxed worker processes")]
#[command(long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Log level (trace, debug, info, warn, error); overrides -v
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Configuration file (default: first of the standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run test files
    Run(RunArgs),

    /// Serve one worker over stdin/stdout
    #[command(hide = true)]
    Worker,

    /// Print the dependency dictionary of a test file as JSON
    Deps(DepsArgs),

    /// Step through one test interactively
    Debug(DebugArgs),

    /// Show or create configuration
    Config(ConfigArgs),
}

/// Arguments for run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Test files to run
    #[arg(required_unless_present = "eval")]
    pub files: Vec<PathBuf>,

    /// Script source to run as an extra in-memory test (repeatable)
    #[arg(short, long)]
    pub eval: Vec<String>,

    /// Maximum concurrent workers
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Retries per failed test
    #[arg(long)]
    pub retry_count: Option<u32>,

    /// Pause before a retry, in milliseconds
    #[arg(long)]
    pub retry_delay: Option<u64>,

    /// Stop at the first failed test
    #[arg(short, long)]
    pub bail: bool,

    /// Use a fresh worker for every test
    #[arg(long)]
    pub restart_worker: bool,

    /// Run workers in-process instead of as child processes
    #[arg(long)]
    pub local: bool,

    /// Extra file bundled with every test (repeatable)
    #[arg(long = "setup")]
    pub setup_files: Vec<PathBuf>,

    /// Output format (table, json, csv)
    #[arg(short, long, default_value = "table")]
    pub format: String,

    /// Save the run report as JSON
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

impl RunArgs {
    /// Apply command-line overrides on top of file and environment config
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(workers) = self.workers {
            config.worker_limit = workers;
        }
        if let Some(retry_count) = self.retry_count {
            config.retry_count = retry_count;
        }
        if let Some(retry_delay) = self.retry_delay {
            config.retry_delay_ms = retry_delay;
        }
        config.bail |= self.bail;
        config.restart_worker |= self.restart_worker;
        config.local_workers |= self.local;
        config.setup_files.extend(self.setup_files.iter().cloned());
    }
}

/// Arguments for deps command
#[derive(Parser, Debug)]
pub struct DepsArgs {
    /// Test file to inspect
    pub file: PathBuf,

    /// Include the setup files from configuration
    #[arg(long)]
    pub with_setup: bool,
}

/// Arguments for debug command
#[derive(Parser, Debug)]
pub struct DebugArgs {
    /// Test file to debug
    pub file: PathBuf,

    /// Run the worker in-process
    #[arg(long)]
    pub local: bool,
}

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show {
        /// Output format (yaml, json)
        #[arg(short, long, default_value = "yaml")]
        format: String,
    },

    /// Write a default configuration file
    Init {
        /// Destination
        #[arg(default_value = "testrig.yaml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// List the environment variables that override configuration
    Env,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args() {
        let args = Args::parse_from([
            "testrig",
            "-vv",
            "run",
            "a.tst",
            "b.tst",
            "--workers",
            "4",
            "--bail",
            "--setup",
            "setup.tst",
            "--format",
            "csv",
        ]);
        assert_eq!(args.verbose, 2);
        match args.command {
            Command::Run(run_args) => {
                assert_eq!(run_args.files.len(), 2);
                assert_eq!(run_args.workers, Some(4));
                assert!(run_args.bail);
                assert!(!run_args.local);
                assert_eq!(run_args.format, "csv");

                let mut config = AppConfig {
                    retry_count: 7,
                    ..Default::default()
                };
                run_args.apply(&mut config);
                assert_eq!(config.worker_limit, 4);
                assert_eq!(config.retry_count, 7);
                assert!(config.bail);
                assert_eq!(config.setup_files, vec![PathBuf::from("setup.tst")]);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_requires_files() {
        assert!(Args::try_parse_from(["testrig", "run"]).is_err());
    }

    #[test]
    fn test_run_with_inline_sources_only() {
        let args = Args::parse_from([
            "testrig",
            "run",
            "--eval",
            "log(\"a\")",
            "-e",
            "sleep(5)",
        ]);
        match args.command {
            Command::Run(run_args) => {
                assert!(run_args.files.is_empty());
                assert_eq!(run_args.eval, vec!["log(\"a\")", "sleep(5)"]);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_worker_and_debug() {
        let args = Args::parse_from(["testrig", "worker"]);
        assert!(matches!(args.command, Command::Worker));

        let args = Args::parse_from(["testrig", "debug", "t.tst", "--local", "-c", "rig.yaml"]);
        assert_eq!(args.config, Some(PathBuf::from("rig.yaml")));
        match args.command {
            Command::Debug(debug_args) => {
                assert!(debug_args.local);
                assert_eq!(debug_args.file, PathBuf::from("t.tst"));
            }
            _ => panic!("Expected Debug command"),
        }
    }

    #[test]
    fn test_config_init_default_path() {
        let args = Args::parse_from(["testrig", "config", "init"]);
        match args.command {
            Command::Config(ConfigArgs {
                action: ConfigAction::Init { path, force },
            }) => {
                assert_eq!(path, PathBuf::from("testrig.yaml"));
                assert!(!force);
            }
            _ => panic!("Expected Config Init command"),
        }
    }
}
