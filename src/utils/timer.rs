//! Timer utilities

use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

/// Measures a labelled span of work, keeping the wall-clock start for reports
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    started_at: DateTime<Utc>,
    label: String,
}

impl Timer {
    /// Create and start a new timer
    pub fn start(label: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            started_at: Utc::now(),
            label: label.into(),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed().as_millis() as u64
    }

    /// Stop timer and return elapsed time
    pub fn stop(self) -> Duration {
        let elapsed = self.elapsed();
        tracing::debug!("{}: {}ms", self.label, elapsed.as_millis());
        elapsed
    }
}
