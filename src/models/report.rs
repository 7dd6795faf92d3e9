//! Run result models
//!
//! Defines the per-test error recorded by the run controller and the
//! report produced once a run settles.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::executor::WorkerError;

/// A permanently failed test (one per test, not one per attempt)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestError {
    /// Path of the failed test file
    pub path: String,
    /// Number of attempts made before giving up
    pub attempts: u32,
    pub error: WorkerError,
}

impl TestError {
    pub fn new(path: impl Into<String>, attempts: u32, error: WorkerError) -> Self {
        Self {
            path: path.into(),
            attempts,
            error,
        }
    }
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} attempt", self.path, self.attempts)?;
        if self.attempts != 1 {
            write!(f, "s")?;
        }
        write!(f, "): {}", self.error)
    }
}

impl std::error::Error for TestError {}

/// Summary of one run of the queue
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReport {
    /// Unique run ID
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Number of test files queued
    pub total: usize,
    pub errors: Vec<TestError>,
}

impl RunReport {
    pub fn new(
        started_at: DateTime<Utc>,
        duration_ms: u64,
        total: usize,
        errors: Option<Vec<TestError>>,
    ) -> Self {
        Self {
            id: generate_run_id(started_at),
            started_at,
            duration_ms,
            total,
            errors: errors.unwrap_or_default(),
        }
    }

    pub fn failed(&self) -> usize {
        self.errors.len()
    }

    pub fn passed(&self) -> usize {
        self.total.saturating_sub(self.errors.len())
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Save the report as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self).context("Failed to serialize report")?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write report: {}", path.display()))?;
        Ok(())
    }
}

/// Generate unique run ID
fn generate_run_id(started_at: DateTime<Utc>) -> String {
    let timestamp = started_at.format("%Y%m%d_%H%M%S");
    let random: u32 = rand::random::<u32>() % 10000;
    format!("{timestamp}_{random:04}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ErrorPayload;
    use tempfile::tempdir;

    fn failed(path: &str, attempts: u32) -> TestError {
        TestError::new(
            path,
            attempts,
            WorkerError::TestFailed(ErrorPayload::new("Error", "assertion failed")),
        )
    }

    #[test]
    fn test_report_counts() {
        let report = RunReport::new(Utc::now(), 120, 3, Some(vec![failed("/t/a.tst", 4)]));
        assert_eq!(report.passed(), 2);
        assert_eq!(report.failed(), 1);
        assert!(!report.is_success());

        let clean = RunReport::new(Utc::now(), 5, 2, None);
        assert!(clean.is_success());
    }

    #[test]
    fn test_run_id_format() {
        let report = RunReport::new(Utc::now(), 0, 0, None);
        let (timestamp, random) = report.id.rsplit_once('_').unwrap();
        assert_eq!(timestamp.len(), 15);
        assert_eq!(random.len(), 4);
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            failed("/t/a.tst", 1).to_string(),
            "/t/a.tst (1 attempt): test failed: Error: assertion failed"
        );
        assert!(failed("/t/b.tst", 3).to_string().contains("3 attempts"));
    }

    #[test]
    fn test_report_save() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reports/run.json");

        let report = RunReport::new(Utc::now(), 10, 1, Some(vec![failed("/t/a.tst", 1)]));
        report.save(&path).unwrap();

        let loaded: RunReport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.id, report.id);
        assert_eq!(loaded.errors.len(), 1);
    }
}
