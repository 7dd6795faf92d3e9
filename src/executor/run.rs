//! Run controller
//!
//! Owns a pool of workers. Every run gets its own queue; each worker runs a
//! loop that pulls the next test, executes it, retries failures up to the
//! configured limit and retires itself once the queue is empty.

use futures::future::{try_join_all, BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::hooks::{NoHooks, RunHooks};
use super::instance::{TestWorker, WorkerInstance};
use super::WorkerError;
use crate::models::{QueuedTest, SourceFile, TestError};
use crate::process::KillSignal;
use crate::utils::timer::Timer;

pub type RunOutcome = Option<Vec<TestError>>;

#[derive(Clone, Debug)]
pub struct RunConfig {
    /// Upper bound on concurrent workers
    pub worker_limit: usize,
    /// Retries per test after the first attempt
    pub retry_count: u32,
    pub retry_delay: Duration,
    /// Abort the whole run on the first failure
    pub bail: bool,
    /// Stop the worker after every test
    pub restart_worker: bool,
    pub env_parameters: Value,
    /// Extension of synthesized in-memory tests
    pub test_extension: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            worker_limit: 1,
            retry_count: 3,
            retry_delay: Duration::from_millis(2000),
            bail: false,
            restart_worker: false,
            env_parameters: Value::Object(Default::default()),
            test_extension: "tst".to_string(),
        }
    }
}

#[derive(Debug)]
struct QueueState {
    items: VecDeque<QueuedTest>,
    /// Worker loops still pulling from the queue
    active_loops: usize,
    /// Cleared once the last loop retires; later tests need a new run
    accepting: bool,
    closed: bool,
}

/// Queue of one run, shared by its worker loops
#[derive(Debug)]
struct TestQueue {
    state: Mutex<QueueState>,
}

impl TestQueue {
    fn new(items: Vec<QueuedTest>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: items.into(),
                active_loops: 0,
                accepting: true,
                closed: false,
            }),
        }
    }

    fn files(&self) -> Vec<SourceFile> {
        self.lock().items.iter().map(|item| item.test.clone()).collect()
    }

    /// Size the pool against what is queued now; returns `(tests, loops)`
    fn start(&self, worker_limit: usize) -> (usize, usize) {
        let mut state = self.lock();
        let tests = state.items.len();
        let loops = worker_limit.min(tests);
        state.active_loops = loops;
        if loops == 0 {
            state.accepting = false;
        }
        (tests, loops)
    }

    /// Next test, or `None` after marking the calling loop as retired
    fn pop_or_retire(&self) -> Option<QueuedTest> {
        let mut state = self.lock();
        let next = if state.closed {
            None
        } else {
            state.items.pop_front()
        };
        if next.is_none() {
            state.active_loops = state.active_loops.saturating_sub(1);
            if state.active_loops == 0 {
                state.accepting = false;
            }
        }
        next
    }

    /// Put a test back at the tail; refused once the run is closed
    fn requeue(&self, item: QueuedTest) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.items.push_back(item);
        true
    }

    /// Append to a run that has not wound down yet
    fn push_live(&self, items: Vec<QueuedTest>) -> Result<(), Vec<QueuedTest>> {
        let mut state = self.lock();
        if state.closed || !state.accepting {
            return Err(items);
        }
        state.items.extend(items);
        Ok(())
    }

    fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.accepting = false;
        state.items.clear();
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The most recent run and the queue new tests can join
struct LiveRun {
    queue: Arc<TestQueue>,
    outcome: Shared<BoxFuture<'static, RunOutcome>>,
}

struct RunInner {
    config: RunConfig,
    worker: TestWorker,
    hooks: Arc<dyn RunHooks>,
    workers: Mutex<Vec<Arc<WorkerInstance>>>,
    virtual_tests: AtomicUsize,
}

pub struct TestRunController {
    inner: Arc<RunInner>,
    current: Mutex<Option<LiveRun>>,
}

impl TestRunController {
    pub fn new(config: RunConfig, worker: TestWorker) -> Self {
        Self {
            inner: Arc::new(RunInner {
                config,
                worker,
                hooks: Arc::new(NoHooks),
                workers: Mutex::new(Vec::new()),
                virtual_tests: AtomicUsize::new(0),
            }),
            current: Mutex::new(None),
        }
    }

    pub fn with_hooks(self, hooks: Arc<dyn RunHooks>) -> Self {
        let Self { inner, current } = self;
        let inner = Arc::try_unwrap(inner)
            .map(|mut inner| {
                inner.hooks = hooks;
                Arc::new(inner)
            })
            .unwrap_or_else(|shared| {
                warn!("hooks changed after the controller was shared; ignoring");
                shared
            });
        Self { inner, current }
    }

    /// Run every file. `None` when all tests passed, otherwise one error per
    /// failed test (exactly one when the run bailed).
    ///
    /// While a run is still pulling tests the files join it and the call
    /// resolves with that run's outcome.
    pub async fn run_queue(&self, files: Vec<SourceFile>) -> RunOutcome {
        let run = self.enqueue(files);
        run.await
    }

    /// Run `source` as an in-memory test, joining the run in progress when
    /// there is one.
    pub async fn push_test_into_queue(&self, source: impl Into<String>) -> RunOutcome {
        let file = SourceFile::new(self.inner.virtual_path(), source);
        self.run_queue(vec![file]).await
    }

    /// Abort the run: drop everything queued and stop every worker
    pub async fn kill(&self) {
        if let Some(live) = self.lock_current().as_ref() {
            live.queue.close();
        }
        let workers = std::mem::take(&mut *self.inner.lock_workers());
        info!("Stopping {} worker(s)", workers.len());
        for worker in workers {
            if let Err(err) = worker.kill(KillSignal::Kill).await {
                warn!(worker_id = %worker.worker_id(), error = %err, "failed to stop worker");
            }
        }
    }

    fn enqueue(&self, files: Vec<SourceFile>) -> Shared<BoxFuture<'static, RunOutcome>> {
        let items: Vec<_> = files.into_iter().map(QueuedTest::new).collect();
        let mut current = self.lock_current();

        let items = match current.as_ref() {
            Some(live) => match live.queue.push_live(items) {
                Ok(()) => {
                    debug!("joined the run in progress");
                    return live.outcome.clone();
                }
                Err(items) => items,
            },
            None => items,
        };

        let queue = Arc::new(TestQueue::new(items));
        let outcome = RunInner::run(self.inner.clone(), queue.clone())
            .boxed()
            .shared();
        *current = Some(LiveRun {
            queue,
            outcome: outcome.clone(),
        });
        outcome
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<LiveRun>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RunInner {
    async fn run(self: Arc<Self>, queue: Arc<TestQueue>) -> RunOutcome {
        let timer = Timer::start("run");
        let files = queue.files();

        if self.hooks.should_not_execute(&files).await {
            info!("Run skipped by hook");
            queue.close();
            return None;
        }
        if let Err(err) = self.hooks.before_run(&files).await {
            warn!(error = %err, "before-run hook failed");
        }

        let (tests, worker_count) = queue.start(self.config.worker_limit.max(1));
        info!("Running {} test(s) on {} worker(s)", tests, worker_count);

        let errors = Arc::new(Mutex::new(Vec::new()));
        let loops = (0..worker_count).map(|_| {
            let worker = Arc::new(self.worker.spawn());
            self.lock_workers().push(worker.clone());
            let inner = self.clone();
            let queue = queue.clone();
            let errors = errors.clone();
            tokio::spawn(async move { inner.worker_loop(&queue, worker, errors).await })
        });
        let loops: Vec<_> = loops.collect();

        let outcome = try_join_all(loops.into_iter().map(|handle| async move {
            handle
                .await
                .unwrap_or_else(|err| Err(TestError::new("<worker loop>", 0, WorkerError::Crashed(err.to_string()))))
        }))
        .await;

        let mut errors = std::mem::take(&mut *errors.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
        if let Err(bailed) = outcome {
            // the bailing failure is the only one reported
            errors = vec![bailed];
        }

        let result = (!errors.is_empty()).then_some(errors);
        if let Err(err) = self.hooks.after_run(result.as_deref()).await {
            warn!(error = %err, "after-run hook failed");
        }
        let elapsed = timer.stop();
        info!(
            "Run finished in {}ms with {} failed test(s)",
            elapsed.as_millis(),
            result.as_ref().map_or(0, Vec::len)
        );
        result
    }

    async fn worker_loop(
        &self,
        queue: &TestQueue,
        worker: Arc<WorkerInstance>,
        errors: Arc<Mutex<Vec<TestError>>>,
    ) -> Result<(), TestError> {
        while let Some(item) = queue.pop_or_retire() {
            if self.hooks.should_not_start(&item).await {
                debug!(test = %item.test, "test skipped by hook");
                continue;
            }
            if let Err(err) = self.hooks.before_test(&item).await {
                warn!(test = %item.test, error = %err, "before-test hook failed");
            }

            let result = worker
                .execute(
                    &item.test,
                    item.execution_parameters(),
                    self.config.env_parameters.clone(),
                )
                .await;
            if self.config.restart_worker {
                self.stop_worker(&worker, false).await;
            }

            let Err(error) = result else {
                self.after_test(&item, None).await;
                continue;
            };
            let error = TestError::new(item.test.path.clone(), item.attempt(), error);

            if self.config.bail {
                self.after_test(&item, Some(&error)).await;
                queue.close();
                self.stop_worker(&worker, true).await;
                warn!(test = %item.test, "Bailing out after first failure");
                return Err(error);
            }

            if self.hooks.should_retry(&item, &error).await
                && item.retry_count < self.config.retry_count
            {
                let mut retry = item.clone();
                retry.retry_count += 1;
                retry.retry_errors.push(error.clone());
                if let Err(err) = self.hooks.before_test_retry(&retry, &error).await {
                    warn!(test = %retry.test, error = %err, "before-retry hook failed");
                }
                if !self.config.retry_delay.is_zero() {
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                if queue.requeue(retry) {
                    continue;
                }
                debug!(test = %item.test, "run closed; retry dropped");
            }

            errors
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(error.clone());
            self.after_test(&item, Some(&error)).await;
        }

        self.stop_worker(&worker, true).await;
        Ok(())
    }

    async fn after_test(&self, item: &QueuedTest, error: Option<&TestError>) {
        if let Err(err) = self.hooks.after_test(item, error).await {
            warn!(test = %item.test, error = %err, "after-test hook failed");
        }
    }

    /// Terminate the worker; `retire` also drops it from the kill list
    async fn stop_worker(&self, worker: &Arc<WorkerInstance>, retire: bool) {
        if let Err(err) = worker.kill(KillSignal::Terminate).await {
            warn!(worker_id = %worker.worker_id(), error = %err, "failed to stop worker");
        }
        if retire {
            self.lock_workers()
                .retain(|candidate| !Arc::ptr_eq(candidate, worker));
        }
    }

    fn virtual_path(&self) -> String {
        let n = self.virtual_tests.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::current_dir().unwrap_or_else(|_| "/".into());
        dir.join(format!("virtual-test-{n}.{}", self.config.test_extension))
            .display()
            .to_string()
    }

    fn lock_workers(&self) -> MutexGuard<'_, Vec<Arc<WorkerInstance>>> {
        self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
