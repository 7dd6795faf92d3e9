//! Environment variable configuration
//!
//! Provides environment variable overrides for configuration.

use std::env;

use super::AppConfig;

/// Environment variable prefix
const ENV_PREFIX: &str = "TESTRIG";

/// Environment configuration from environment variables
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EnvConfig {
    /// Worker limit from TESTRIG_WORKERS
    pub worker_limit: Option<usize>,
    /// Retry count from TESTRIG_RETRY_COUNT
    pub retry_count: Option<u32>,
    /// Retry delay in milliseconds from TESTRIG_RETRY_DELAY
    pub retry_delay_ms: Option<u64>,
    /// Bail from TESTRIG_BAIL
    pub bail: Option<bool>,
    /// In-process workers from TESTRIG_LOCAL
    pub local_workers: Option<bool>,
    /// Config file from TESTRIG_CONFIG
    pub config_file: Option<String>,
    /// Log level from TESTRIG_LOG
    pub log_level: Option<String>,
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self {
            worker_limit: get_env_parse("WORKERS"),
            retry_count: get_env_parse("RETRY_COUNT"),
            retry_delay_ms: get_env_parse("RETRY_DELAY"),
            bail: get_env_bool("BAIL"),
            local_workers: get_env_bool("LOCAL"),
            config_file: get_env("CONFIG"),
            log_level: get_env("LOG"),
        }
    }

    /// Check if any environment variables are set
    pub fn has_any(&self) -> bool {
        *self != Self::default()
    }

    /// Override `config` with whatever is set
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(worker_limit) = self.worker_limit {
            config.worker_limit = worker_limit;
        }
        if let Some(retry_count) = self.retry_count {
            config.retry_count = retry_count;
        }
        if let Some(retry_delay_ms) = self.retry_delay_ms {
            config.retry_delay_ms = retry_delay_ms;
        }
        if let Some(bail) = self.bail {
            config.bail = bail;
        }
        if let Some(local_workers) = self.local_workers {
            config.local_workers = local_workers;
        }
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}")).ok()
}

/// Get environment variable and parse to type
fn get_env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.parse().ok())
}

/// Get environment variable as boolean
fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).map(|v| {
        matches!(
            v.to_lowercase().as_str(),
            "1" | "true" | "yes" | "on" | "enabled"
        )
    })
}

/// Print all TESTRIG environment variables
pub fn print_env_help() {
    println!("Environment Variables:");
    println!();
    println!("  {ENV_PREFIX}_WORKERS      Maximum concurrent workers");
    println!("  {ENV_PREFIX}_RETRY_COUNT  Retries per failed test");
    println!("  {ENV_PREFIX}_RETRY_DELAY  Pause before a retry, in milliseconds");
    println!("  {ENV_PREFIX}_BAIL         Abort on the first failure (true/false)");
    println!("  {ENV_PREFIX}_LOCAL        Run workers in-process (true/false)");
    println!("  {ENV_PREFIX}_CONFIG       Path to configuration file");
    println!("  {ENV_PREFIX}_LOG          Log level (trace, debug, info, warn, error)");
    println!();
    println!("Example:");
    println!("  export {ENV_PREFIX}_WORKERS=4");
    println!("  testrig run tests/*.tst");
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sets `TESTRIG_*` variables and restores the previous values on drop
    struct ScopedEnv {
        previous: Vec<(String, Option<String>)>,
    }

    impl ScopedEnv {
        fn set(vars: &[(&str, &str)]) -> Self {
            let previous = vars
                .iter()
                .map(|(name, value)| {
                    let key = format!("{ENV_PREFIX}_{name}");
                    let previous = env::var(&key).ok();
                    env::set_var(&key, value);
                    (key, previous)
                })
                .collect();
            Self { previous }
        }
    }

    impl Drop for ScopedEnv {
        fn drop(&mut self) {
            for (key, value) in self.previous.drain(..).rev() {
                match value {
                    Some(value) => env::set_var(key, value),
                    None => env::remove_var(key),
                }
            }
        }
    }

    // All variable-touching assertions share one test; tests run in parallel
    // threads and the process environment is global.
    #[test]
    fn test_env_overrides_apply() {
        let _env = ScopedEnv::set(&[
            ("WORKERS", "6"),
            ("RETRY_COUNT", "0"),
            ("RETRY_DELAY", "150"),
            ("BAIL", "true"),
            ("LOCAL", "yes"),
            ("LOG", "debug"),
        ]);

        let env_config = EnvConfig::load();
        assert!(env_config.has_any());
        assert_eq!(env_config.worker_limit, Some(6));
        assert_eq!(env_config.log_level.as_deref(), Some("debug"));

        let mut config = AppConfig::default();
        env_config.apply(&mut config);
        assert_eq!(config.worker_limit, 6);
        assert_eq!(config.retry_count, 0);
        assert_eq!(config.retry_delay_ms, 150);
        assert!(config.bail);
        assert!(config.local_workers);
        assert_eq!(config.import_callee, "require");

        let _bad = ScopedEnv::set(&[("WORKERS", "many")]);
        assert_eq!(EnvConfig::load().worker_limit, None);
    }

    #[test]
    fn test_empty_env_leaves_config_alone() {
        let env_config = EnvConfig::default();
        assert!(!env_config.has_any());

        let mut config = AppConfig::default();
        env_config.apply(&mut config);
        assert_eq!(config, AppConfig::default());
    }
}
