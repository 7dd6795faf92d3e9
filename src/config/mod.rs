//! Configuration module
//!
//! Handles finding, loading and validating configuration. Values are layered
//! file < environment (`TESTRIG_*`) < command line.

pub mod env;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::deps::{BuildOptions, ResolveOptions, DEFAULT_IMPORT_CALLEE};
use crate::executor::{RunConfig, WorkerOptions};

/// Configuration file locations (in order of precedence)
const CONFIG_LOCATIONS: &[&str] = &[
    "./testrig.yaml",
    "./testrig.yml",
    "./testrig.json",
    "./.testrig.yaml",
    "~/.config/testrig/config.yaml",
    "~/.testrig.yaml",
];

/// Application configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Maximum concurrent workers
    pub worker_limit: usize,

    /// Retries per failed test
    pub retry_count: u32,

    /// Pause before a retry, in milliseconds
    pub retry_delay_ms: u64,

    /// Abort the run on the first failure
    pub bail: bool,

    /// Fresh worker for every test
    pub restart_worker: bool,

    /// Run workers as tasks of this process instead of child processes
    pub local_workers: bool,

    /// Callee marking an import
    pub import_callee: String,

    /// Extension appended to extensionless imports
    pub test_extension: String,

    /// Directories whose contents are never bundled
    pub package_dirs: Vec<String>,

    /// Files bundled with every test
    pub setup_files: Vec<PathBuf>,

    /// Passed to every test as `envParameters`
    pub env_parameters: Map<String, Value>,

    /// Worker executable; the current one when unset
    pub worker_binary: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            worker_limit: 1,
            retry_count: 3,
            retry_delay_ms: 2000,
            bail: false,
            restart_worker: false,
            local_workers: false,
            import_callee: DEFAULT_IMPORT_CALLEE.to_string(),
            test_extension: "tst".to_string(),
            package_dirs: vec!["vendor".to_string()],
            setup_files: Vec::new(),
            env_parameters: Map::new(),
            worker_binary: None,
        }
    }
}

impl AppConfig {
    /// Find configuration file in standard locations
    pub fn find() -> Option<PathBuf> {
        CONFIG_LOCATIONS
            .iter()
            .map(|location| expand_path(location))
            .find(|path| path.exists())
    }

    /// Load from `path`, or from the first standard location, or defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path.map(Path::to_path_buf).or_else(Self::find) {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = if is_yaml_file(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display()))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_yaml_file(path) {
            serde_yaml::to_string(self).context("Failed to serialize config")?
        } else {
            serde_json::to_string_pretty(self).context("Failed to serialize config")?
        };

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.worker_limit == 0 {
            anyhow::bail!("worker_limit must be at least 1");
        }
        if self.import_callee.trim().is_empty() {
            anyhow::bail!("import_callee must not be empty");
        }
        if self.test_extension.starts_with('.') {
            anyhow::bail!(
                "test_extension is given without the dot, got '{}'",
                self.test_extension
            );
        }
        Ok(())
    }

    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            worker_limit: self.worker_limit,
            retry_count: self.retry_count,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            bail: self.bail,
            restart_worker: self.restart_worker,
            env_parameters: Value::Object(self.env_parameters.clone()),
            test_extension: self.test_extension.clone(),
        }
    }

    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            import_callee: self.import_callee.clone(),
            resolve: ResolveOptions {
                extension: self.test_extension.clone(),
                package_dirs: self.package_dirs.clone(),
            },
        }
    }

    pub fn worker_options(&self, wait_for_release: bool) -> WorkerOptions {
        WorkerOptions {
            build: self.build_options(),
            wait_for_release,
        }
    }

    /// Setup files made absolute against the working directory
    pub fn setup_file_paths(&self) -> Result<Vec<PathBuf>> {
        let cwd = std::env::current_dir().context("Failed to read working directory")?;
        Ok(self
            .setup_files
            .iter()
            .map(|path| cwd.join(expand_path(&path.to_string_lossy())))
            .collect())
    }
}

fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn is_yaml_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext == "yaml" || ext == "yml")
        .unwrap_or(false)
}
