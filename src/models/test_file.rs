//! Test file models
//!
//! Defines source files and the queue items built from them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};

use super::TestError;

/// A source file read from disk (or synthesized in memory)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    /// Absolute path of the file
    pub path: String,
    /// Raw file content
    pub content: String,
}

impl SourceFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }

    /// Read a file from disk, making its path absolute
    pub async fn read(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = absolute_path(path.as_ref())?;
        let content = tokio::fs::read_to_string(&path).await?;
        Ok(Self {
            path: path.display().to_string(),
            content,
        })
    }
}

impl fmt::Display for SourceFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)
    }
}

/// Turn a possibly relative path into an absolute one without touching the disk
pub(crate) fn absolute_path(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// A test waiting in (or pulled from) the run queue
///
/// Only the run controller mutates `retry_count` and `retry_errors`.
#[derive(Clone, Debug)]
pub struct QueuedTest {
    pub test: SourceFile,
    pub parameters: Map<String, Value>,
    pub retry_count: u32,
    pub retry_errors: Vec<TestError>,
}

impl QueuedTest {
    pub fn new(test: SourceFile) -> Self {
        Self {
            test,
            parameters: Map::new(),
            retry_count: 0,
            retry_errors: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Parameters sent to the worker for the current attempt
    pub fn execution_parameters(&self) -> Value {
        let mut parameters = self.parameters.clone();
        parameters.insert("retryCount".to_string(), Value::from(self.retry_count));
        Value::Object(parameters)
    }

    /// Number of the current attempt (1-based)
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_parameters_carry_retry_count() {
        let mut params = Map::new();
        params.insert("browser".to_string(), Value::from("headless"));

        let mut queued = QueuedTest::new(SourceFile::new("/tests/a.tst", "log(\"a\")"))
            .with_parameters(params);
        queued.retry_count = 2;

        let value = queued.execution_parameters();
        assert_eq!(value["retryCount"], 2);
        assert_eq!(value["browser"], "headless");
        assert_eq!(queued.attempt(), 3);
    }

    #[test]
    fn test_absolute_path() {
        let path = absolute_path(Path::new("/already/absolute.tst")).unwrap();
        assert_eq!(path, PathBuf::from("/already/absolute.tst"));

        let relative = absolute_path(Path::new("relative.tst")).unwrap();
        assert!(relative.is_absolute());
    }
}
