//! Lifecycle hooks of the run controller and the worker
//!
//! Every method has a no-op default; implementors override what they need.
//! Hook failures are logged by the caller and never abort a run.

use futures::future::{self, BoxFuture};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::models::{QueuedTest, SourceFile, TestError};

pub trait RunHooks: Send + Sync {
    /// `true` skips the whole run
    fn should_not_execute<'a>(&'a self, _files: &'a [SourceFile]) -> BoxFuture<'a, bool> {
        Box::pin(future::ready(false))
    }

    fn before_run<'a>(&'a self, _files: &'a [SourceFile]) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(future::ready(Ok(())))
    }

    /// `true` skips this test
    fn should_not_start<'a>(&'a self, _test: &'a QueuedTest) -> BoxFuture<'a, bool> {
        Box::pin(future::ready(false))
    }

    fn before_test<'a>(&'a self, _test: &'a QueuedTest) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(future::ready(Ok(())))
    }

    fn after_test<'a>(
        &'a self,
        _test: &'a QueuedTest,
        _error: Option<&'a TestError>,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(future::ready(Ok(())))
    }

    fn should_retry<'a>(&'a self, _test: &'a QueuedTest, _error: &'a TestError) -> BoxFuture<'a, bool> {
        Box::pin(future::ready(true))
    }

    fn before_test_retry<'a>(
        &'a self,
        _test: &'a QueuedTest,
        _error: &'a TestError,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(future::ready(Ok(())))
    }

    fn after_run<'a>(&'a self, _errors: Option<&'a [TestError]>) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(future::ready(Ok(())))
    }
}

pub trait WorkerHooks: Send + Sync {
    /// Extra files compiled and bundled with every test
    fn before_compile<'a>(
        &'a self,
        paths: Vec<PathBuf>,
        _file: &'a SourceFile,
    ) -> BoxFuture<'a, anyhow::Result<Vec<PathBuf>>> {
        Box::pin(future::ready(Ok(paths)))
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoHooks;

impl RunHooks for NoHooks {}

impl WorkerHooks for NoHooks {}

/// Bundles configured setup files with every test
#[derive(Clone, Debug, Default)]
pub struct SetupFiles {
    files: Vec<PathBuf>,
}

impl SetupFiles {
    pub fn new(files: Vec<PathBuf>) -> Self {
        Self { files }
    }
}

impl WorkerHooks for SetupFiles {
    fn before_compile<'a>(
        &'a self,
        mut paths: Vec<PathBuf>,
        _file: &'a SourceFile,
    ) -> BoxFuture<'a, anyhow::Result<Vec<PathBuf>>> {
        paths.extend(self.files.iter().cloned());
        Box::pin(future::ready(Ok(paths)))
    }
}

/// Console progress for interactive runs
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingHooks;

impl RunHooks for LoggingHooks {
    fn before_run<'a>(&'a self, files: &'a [SourceFile]) -> BoxFuture<'a, anyhow::Result<()>> {
        info!("Running {} test file(s)", files.len());
        Box::pin(future::ready(Ok(())))
    }

    fn after_test<'a>(
        &'a self,
        test: &'a QueuedTest,
        error: Option<&'a TestError>,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        match error {
            None => info!("PASS {} (attempt {})", test.test, test.attempt()),
            Some(error) => warn!("FAIL {}", error),
        }
        Box::pin(future::ready(Ok(())))
    }

    fn before_test_retry<'a>(
        &'a self,
        test: &'a QueuedTest,
        error: &'a TestError,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        warn!(
            "RETRY {} (attempt {} failed: {})",
            test.test, error.attempts, error.error
        );
        Box::pin(future::ready(Ok(())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_setup_files_appended() {
        let hooks = SetupFiles::new(vec![PathBuf::from("/setup/env.tst")]);
        let file = SourceFile::new("/t/a.tst", "");
        let paths = hooks
            .before_compile(vec![PathBuf::from("/setup/first.tst")], &file)
            .await
            .unwrap();
        assert_eq!(
            paths,
            vec![PathBuf::from("/setup/first.tst"), PathBuf::from("/setup/env.tst")]
        );
    }

    #[tokio::test]
    async fn test_defaults() {
        let queued = QueuedTest::new(SourceFile::new("/t/a.tst", ""));
        assert!(!NoHooks.should_not_start(&queued).await);
        assert!(NoHooks.before_test(&queued).await.is_ok());
        assert!(NoHooks.after_run(None).await.is_ok());
    }
}
