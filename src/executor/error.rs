use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::ErrorPayload;

/// Why a test attempt did not complete successfully
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerError {
    #[error("compile error in {path}: {message}")]
    Compile { path: String, message: String },

    #[error("dependency build failed for {path}: {message}")]
    Build { path: String, message: String },

    #[error("failed to spawn worker {worker_id}: {message}")]
    Spawn { worker_id: String, message: String },

    #[error("transport error on worker {worker_id}: {message}")]
    Transport { worker_id: String, message: String },

    #[error("worker {worker_id} exited unexpectedly ({status})")]
    ProcessExited { worker_id: String, status: String },

    #[error("worker loop crashed: {0}")]
    Crashed(String),

    #[error("test failed: {0}")]
    TestFailed(ErrorPayload),
}
