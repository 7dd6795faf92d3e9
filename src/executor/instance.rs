//! Supervisor-side handle on one worker
//!
//! A [`WorkerInstance`] compiles and bundles a test, lazily spawns its worker
//! on first use, hands the test over and waits for the worker to report back.
//! The same worker is reused for every test until it is killed.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use super::compile::{Compiler, ScriptCompiler};
use super::hooks::{NoHooks, WorkerHooks};
use super::WorkerError;
use crate::deps::{
    build_dependency_dictionary, merge_dependency_dictionaries, BuildOptions, FileReader, FsReader,
};
use crate::models::{
    CompletionStatus, ErrorPayload, ExecuteTestPayload, Message, MessageKind, SourceFile,
};
use crate::process::{wait_for_exit, KillSignal, ProcessHandle, Spawner};
use crate::transport::Transport;

type SpawnResult = Result<Arc<dyn ProcessHandle>, WorkerError>;

#[derive(Clone, Debug, Default)]
pub struct WorkerOptions {
    pub build: BuildOptions,
    /// Hold every test open for debugging until it is released
    pub wait_for_release: bool,
}

/// Factory for [`WorkerInstance`]s sharing one set of collaborators
#[derive(Clone)]
pub struct TestWorker {
    transport: Arc<Transport>,
    spawner: Arc<dyn Spawner>,
    compiler: Arc<dyn Compiler>,
    reader: Arc<dyn FileReader>,
    hooks: Arc<dyn WorkerHooks>,
    options: WorkerOptions,
}

impl TestWorker {
    pub fn new(transport: Arc<Transport>, spawner: Arc<dyn Spawner>) -> Self {
        Self {
            transport,
            spawner,
            compiler: Arc::new(ScriptCompiler),
            reader: Arc::new(FsReader),
            hooks: Arc::new(NoHooks),
            options: WorkerOptions::default(),
        }
    }

    #[cfg(test)]
    pub fn with_reader(mut self, reader: Arc<dyn FileReader>) -> Self {
        self.reader = reader;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn WorkerHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// A new instance; its process is only started by the first `execute`
    pub fn spawn(&self) -> WorkerInstance {
        WorkerInstance::new(self.clone())
    }
}

#[derive(Default)]
struct ProcessSlot {
    process: Option<Arc<dyn ProcessHandle>>,
    pending_spawn: Option<Shared<BoxFuture<'static, SpawnResult>>>,
}

pub struct WorkerInstance {
    worker_id: String,
    worker: TestWorker,
    slot: Arc<Mutex<ProcessSlot>>,
    compile_cache: Mutex<HashMap<String, String>>,
}

impl WorkerInstance {
    fn new(worker: TestWorker) -> Self {
        Self {
            worker_id: format!("worker/{:016x}", rand::random::<u64>()),
            worker,
            slot: Arc::new(Mutex::new(ProcessSlot::default())),
            compile_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run one test on this worker. Resolves once the worker reports the
    /// test as done; rejects on test failure or if the worker dies meanwhile.
    pub async fn execute(
        &self,
        file: &SourceFile,
        parameters: Value,
        env_parameters: Value,
    ) -> Result<(), WorkerError> {
        let payload = self.build_payload(file, parameters, env_parameters).await?;
        let process = self.process().await?;

        // registered before sending so the reply cannot slip past
        let completion = self
            .worker
            .transport
            .once_from(&self.worker_id, MessageKind::ExecutionComplete);
        let mut status = process.status();

        debug!(worker_id = %self.worker_id, test = %file.path, "sending test to worker");
        process
            .send(Message::ExecuteTest(payload))
            .map_err(|err| self.transport_error(err))?;

        tokio::select! {
            message = completion => match message {
                Ok(Message::ExecutionComplete(complete)) => match complete.status {
                    CompletionStatus::Done => Ok(()),
                    CompletionStatus::Failed => Err(WorkerError::TestFailed(
                        complete
                            .error
                            .unwrap_or_else(|| ErrorPayload::new("Error", "test failed without an error")),
                    )),
                },
                Ok(other) => Err(self.transport_error(format!("unexpected reply {}", other.kind()))),
                Err(err) => Err(self.transport_error(err)),
            },
            exited = status.wait_for(|status| !status.is_running()) => {
                let status = exited
                    .map(|status| status.to_string())
                    .unwrap_or_else(|_| "gone".to_string());
                warn!(worker_id = %self.worker_id, %status, "worker exited during test");
                self.forget(&process);
                Err(WorkerError::ProcessExited {
                    worker_id: self.worker_id.clone(),
                    status,
                })
            }
        }
    }

    /// Stop the worker if it is running; waits for a spawn in flight first
    pub async fn kill(&self, signal: KillSignal) -> Result<(), WorkerError> {
        let pending = self.lock_slot().pending_spawn.clone();
        if let Some(pending) = pending {
            // a failed spawn leaves nothing to kill
            let _ = pending.await;
        }

        let Some(process) = self.lock_slot().process.take() else {
            return Ok(());
        };
        self.worker.transport.unregister_child(&self.worker_id);

        if let Err(err) = process.kill(signal) {
            debug!(worker_id = %self.worker_id, error = %err, "worker already closing");
        }
        let status = wait_for_exit(process.as_ref()).await;
        debug!(worker_id = %self.worker_id, %status, ?signal, "worker stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.lock_slot()
            .process
            .as_ref()
            .is_some_and(|process| process.is_running())
    }

    async fn process(&self) -> SpawnResult {
        let spawn = {
            let mut slot = self.lock_slot();
            match &slot.process {
                Some(process) if process.is_running() => return Ok(process.clone()),
                Some(_) => {
                    slot.process = None;
                    self.worker.transport.unregister_child(&self.worker_id);
                }
                None => {}
            }
            match &slot.pending_spawn {
                Some(pending) => pending.clone(),
                None => {
                    let pending = self.spawn_process().boxed().shared();
                    slot.pending_spawn = Some(pending.clone());
                    pending
                }
            }
        };
        spawn.await
    }

    /// Spawn and register; the slot is filled before any waiter resumes
    fn spawn_process(&self) -> impl std::future::Future<Output = SpawnResult> + Send + 'static {
        let worker_id = self.worker_id.clone();
        let spawner = self.worker.spawner.clone();
        let transport = self.worker.transport.clone();
        let slot = self.slot.clone();

        async move {
            let result = spawner.spawn(&worker_id).await;
            let mut slot = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            slot.pending_spawn = None;

            let spawned = result.map_err(|err| WorkerError::Spawn {
                worker_id: worker_id.clone(),
                message: err.to_string(),
            })?;
            transport.register_child(&worker_id, spawned.handle.clone(), spawned.messages);
            slot.process = Some(spawned.handle.clone());
            Ok(spawned.handle)
        }
    }

    fn forget(&self, process: &Arc<dyn ProcessHandle>) {
        let mut slot = self.lock_slot();
        if slot
            .process
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, process))
        {
            slot.process = None;
            self.worker.transport.unregister_child(&self.worker_id);
        }
    }

    async fn build_payload(
        &self,
        file: &SourceFile,
        parameters: Value,
        env_parameters: Value,
    ) -> Result<ExecuteTestPayload, WorkerError> {
        let content = self.compile(&file.content, &file.path)?;
        let entry = SourceFile::new(file.path.clone(), content.clone());
        let reader = CompilingReader { instance: self };
        let options = &self.worker.options.build;

        let mut dependencies = build_dependency_dictionary(&entry, &reader, options)
            .await
            .map_err(|err| build_error(&file.path, err))?;

        let extra = match self.worker.hooks.before_compile(Vec::new(), file).await {
            Ok(paths) => paths,
            Err(err) => {
                warn!(test = %file.path, error = %err, "before-compile hook failed");
                Vec::new()
            }
        };
        for path in extra {
            let display = path.display().to_string();
            let source = reader
                .read_file(&path)
                .await
                .map_err(|err| build_error(&display, err))?
                .ok_or_else(|| WorkerError::Build {
                    path: display.clone(),
                    message: "file not found".to_string(),
                })?;
            let extra = build_dependency_dictionary(&source, &reader, options)
                .await
                .map_err(|err| build_error(&display, err))?;
            dependencies = merge_dependency_dictionaries(dependencies, extra);
        }

        Ok(ExecuteTestPayload {
            content,
            path: file.path.clone(),
            dependencies,
            parameters,
            env_parameters,
            wait_for_release: self.worker.options.wait_for_release,
            import_callee: options.import_callee.clone(),
        })
    }

    /// Compile through the per-instance cache
    fn compile(&self, source: &str, path: &str) -> Result<String, WorkerError> {
        if let Some(compiled) = self.lock_cache().get(source) {
            return Ok(compiled.clone());
        }
        let compiled = self
            .worker
            .compiler
            .compile(source, path)
            .map_err(|err| WorkerError::Compile {
                path: err.path,
                message: err.message,
            })?;
        self.lock_cache().insert(source.to_string(), compiled.clone());
        Ok(compiled)
    }

    fn transport_error(&self, err: impl ToString) -> WorkerError {
        WorkerError::Transport {
            worker_id: self.worker_id.clone(),
            message: err.to_string(),
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, ProcessSlot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_cache(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.compile_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn build_error(path: &str, err: impl ToString) -> WorkerError {
    WorkerError::Build {
        path: path.to_string(),
        message: err.to_string(),
    }
}

/// Reads through the configured reader and compiles what it reads
struct CompilingReader<'a> {
    instance: &'a WorkerInstance,
}

impl FileReader for CompilingReader<'_> {
    fn read_file<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, io::Result<Option<SourceFile>>> {
        Box::pin(async move {
            let Some(file) = self.instance.worker.reader.read_file(path).await? else {
                return Ok(None);
            };
            let content = self
                .instance
                .compile(&file.content, &file.path)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
            Ok(Some(SourceFile::new(file.path, content)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deps::MemoryReader;
    use crate::executor::SetupFiles;
    use crate::process::{LocalSpawner, SpawnedProcess};
    use crate::transport::TransportError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts spawns and remembers the handles it gave out
    #[derive(Default)]
    struct CountingSpawner {
        spawns: AtomicUsize,
        handles: Mutex<Vec<Arc<dyn ProcessHandle>>>,
    }

    impl Spawner for CountingSpawner {
        fn spawn<'a>(&'a self, worker_id: &'a str) -> BoxFuture<'a, Result<SpawnedProcess, TransportError>> {
            Box::pin(async move {
                self.spawns.fetch_add(1, Ordering::SeqCst);
                let spawned = LocalSpawner.spawn(worker_id).await?;
                self.handles.lock().unwrap().push(spawned.handle.clone());
                Ok(spawned)
            })
        }
    }

    fn worker(reader: MemoryReader, spawner: Arc<CountingSpawner>) -> TestWorker {
        TestWorker::new(Arc::new(Transport::new()), spawner).with_reader(Arc::new(reader))
    }

    fn reader() -> MemoryReader {
        MemoryReader::new()
            .with_file("/t/a.tst", "require(\"./lib\"); log(\"a\")")
            .with_file("/t/b.tst", "require(\"./lib\"); fail(\"b is broken\")")
            .with_file("/t/lib.tst", "log(\"lib\")")
            .with_file("/t/bad.tst", "log(")
    }

    async fn read(reader: &MemoryReader, path: &str) -> SourceFile {
        reader.read_file(Path::new(path)).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_worker_reused_across_tests() {
        let files = reader();
        let a = read(&files, "/t/a.tst").await;
        let b = read(&files, "/t/b.tst").await;
        let spawner = Arc::new(CountingSpawner::default());
        let instance = worker(files, spawner.clone()).spawn();

        instance.execute(&a, json!({}), json!({})).await.unwrap();
        let err = instance.execute(&b, json!({}), json!({})).await.unwrap_err();
        assert!(matches!(err, WorkerError::TestFailed(ref payload) if payload.message == "b is broken"));
        instance.execute(&a, json!({}), json!({})).await.unwrap();

        assert_eq!(spawner.spawns.load(Ordering::SeqCst), 1);
        assert!(instance.is_running());

        instance.kill(KillSignal::Terminate).await.unwrap();
        assert!(!instance.is_running());
        // killing twice is a no-op
        instance.kill(KillSignal::Terminate).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_first_use_spawns_once() {
        let spawner = Arc::new(CountingSpawner::default());
        let instance = worker(reader(), spawner.clone()).spawn();

        let (first, second) = tokio::join!(instance.process(), instance.process());
        assert!(Arc::ptr_eq(&first.unwrap(), &second.unwrap()));
        assert_eq!(spawner.spawns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_kill_waits_for_pending_spawn() {
        let spawner = Arc::new(CountingSpawner::default());
        let instance = worker(reader(), spawner.clone()).spawn();

        let (spawned, killed) = tokio::join!(instance.process(), async {
            tokio::task::yield_now().await;
            instance.kill(KillSignal::Kill).await
        });
        spawned.unwrap();
        killed.unwrap();
        assert!(!instance.is_running());
    }

    #[tokio::test]
    async fn test_compile_error_rejects_before_spawn() {
        let files = reader();
        let bad = read(&files, "/t/bad.tst").await;
        let spawner = Arc::new(CountingSpawner::default());
        let instance = worker(files, spawner.clone()).spawn();

        let err = instance.execute(&bad, json!({}), json!({})).await.unwrap_err();
        assert!(matches!(err, WorkerError::Compile { ref path, .. } if path == "/t/bad.tst"));
        assert_eq!(spawner.spawns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_compile_cache_hit() {
        let files = reader();
        let a = read(&files, "/t/a.tst").await;
        let instance = worker(files, Arc::new(CountingSpawner::default())).spawn();

        instance.build_payload(&a, json!({}), json!({})).await.unwrap();
        instance.build_payload(&a, json!({}), json!({})).await.unwrap();
        assert_eq!(instance.lock_cache().len(), 2);
    }

    #[tokio::test]
    async fn test_setup_files_bundled() {
        let files = reader()
            .with_file("/setup/env.tst", "require(\"./helpers\")")
            .with_file("/setup/helpers.tst", "log(\"helpers\")");
        let a = read(&files, "/t/a.tst").await;
        let instance = worker(files, Arc::new(CountingSpawner::default()))
            .with_hooks(Arc::new(SetupFiles::new(vec!["/setup/env.tst".into()])))
            .spawn();

        let payload = instance.build_payload(&a, json!({}), json!({})).await.unwrap();
        assert!(payload.dependencies.contains_key("/t/a.tst"));
        assert_eq!(
            payload.dependencies["/setup/env.tst"]["./helpers"].path,
            "/setup/helpers.tst"
        );
        assert_eq!(payload.content, "require(\"./lib\");\nlog(\"a\");\n");
    }

    #[tokio::test]
    async fn test_custom_import_callee_bundles_and_runs() {
        let files = MemoryReader::new()
            .with_file("/t/main.tst", "load(\"./lib\"); assert_eq(\"a\", \"a\")")
            .with_file("/t/lib.tst", "log(\"lib\")");
        let main = read(&files, "/t/main.tst").await;
        let mut options = WorkerOptions::default();
        options.build.import_callee = "load".to_string();
        let instance = worker(files, Arc::new(CountingSpawner::default()))
            .with_options(options)
            .spawn();

        let payload = instance.build_payload(&main, json!({}), json!({})).await.unwrap();
        assert_eq!(payload.import_callee, "load");
        assert_eq!(payload.dependencies["/t/main.tst"]["./lib"].path, "/t/lib.tst");

        instance.execute(&main, json!({}), json!({})).await.unwrap();
        instance.kill(KillSignal::Terminate).await.unwrap();
    }

    #[tokio::test]
    async fn test_process_exit_rejects_execution() {
        let files = MemoryReader::new().with_file("/t/slow.tst", "sleep(60000)");
        let slow = read(&files, "/t/slow.tst").await;
        let spawner = Arc::new(CountingSpawner::default());
        let instance = worker(files, spawner.clone()).spawn();

        let killer = {
            let spawner = spawner.clone();
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                let handle = spawner.handles.lock().unwrap()[0].clone();
                handle.kill(KillSignal::Kill).unwrap();
            }
        };
        let (result, ()) = tokio::join!(instance.execute(&slow, json!({}), json!({})), killer);

        assert!(matches!(result, Err(WorkerError::ProcessExited { .. })));
        assert!(!instance.is_running());
    }
}
