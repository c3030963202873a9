//! ============================================================================
//! Task Loop - Fetch, Prepare, Dispatch, Recover
//! ============================================================================
//! The worker's outer loop:
//! - fetch a task from the server, or resume the pending one
//! - download the opening book and networks it needs
//! - hand it to the train or match orchestrator
//! - while training, poll the server and preempt when the work changes
//! - classify failures: fallback retry, backoff, or termination
//! ============================================================================

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend::BackendState;
use crate::cache::{AssetCache, BookCache, Retention};
use crate::config::WorkerConfig;
use crate::error::{Disposition, WorkerError, WorkerResult};
use crate::orchestrator::{run_match, run_training, TaskContext, TaskOutcome};
use crate::pgn::{LongAlgebraicPgn, PgnBuilder};
use crate::server::GridServer;
use crate::types::{ClientMeta, Task, TaskKind};
use crate::upload_retry::GameCounter;

/// Consecutive poll failures before the poller gives up
pub const MAX_POLL_ERRORS: u32 = 10;

/// Drives tasks one at a time for the life of the process
pub struct TaskLoop {
    config: WorkerConfig,
    server: Arc<dyn GridServer>,
    cache: AssetCache,
    books: BookCache,
    backend: BackendState,
    meta: ClientMeta,
    pgn: Arc<dyn PgnBuilder>,
    counter: Arc<GameCounter>,
    pending: Option<Task>,
    shutdown: CancellationToken,
}

impl TaskLoop {
    pub fn new(
        config: WorkerConfig,
        server: Arc<dyn GridServer>,
        backend: BackendState,
        meta: ClientMeta,
    ) -> WorkerResult<Self> {
        let cache = AssetCache::open(&config.cache_dir)?;
        let books = BookCache::open(&config.books_dir)?;
        Ok(Self {
            config,
            server,
            cache,
            books,
            backend,
            meta,
            pgn: Arc::new(LongAlgebraicPgn),
            counter: Arc::new(GameCounter::new()),
            pending: None,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_pgn(mut self, pgn: Arc<dyn PgnBuilder>) -> Self {
        self.pgn = pgn;
        self
    }

    /// Cancelling this token kills the running engine and stops the loop
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn pending(&self) -> Option<&Task> {
        self.pending.as_ref()
    }

    pub fn backend(&self) -> &BackendState {
        &self.backend
    }

    pub fn meta(&self) -> &ClientMeta {
        &self.meta
    }

    /// Run until shutdown or until the server rejects this client
    pub async fn run(&mut self) -> WorkerResult<()> {
        while !self.shutdown.is_cancelled() {
            let err = match self.run_once().await {
                Ok(outcome) => {
                    info!("Task finished: {:?}", outcome);
                    continue;
                }
                Err(e) => e,
            };

            let pause = match err.disposition() {
                Disposition::Terminate => {
                    error!("{}", err);
                    error!("You probably need the latest release of the worker and engine");
                    return Err(err);
                }
                Disposition::RetrySoon => {
                    warn!("{}", err);
                    self.config.retry_sleep
                }
                Disposition::Backoff => {
                    error!("{}", err);
                    info!("Sleeping for {:?}...", self.config.backoff_sleep);
                    self.config.backoff_sleep
                }
            };

            tokio::select! {
                _ = sleep(pause) => {}
                _ = self.shutdown.cancelled() => {}
            }
        }
        info!("Shutting down");
        Ok(())
    }

    /// One attempt: fetch or resume a task, prepare it, run it
    pub async fn run_once(&mut self) -> WorkerResult<TaskOutcome> {
        let task = match self.pending.take() {
            Some(task) => {
                info!("Resuming pending {} task", task.kind.as_str());
                task
            }
            None => self.server.next_task(&self.meta).await?,
        };
        info!("Server params: {:?}", task.params);

        let result = self.dispatch(&task).await;
        match &result {
            // Work the server assigned meanwhile wins over a fallback retry
            Err(WorkerError::RetryWithFallback { .. }) if self.pending.is_none() => {
                self.pending = Some(task)
            }
            Ok(TaskOutcome::Superseded(next)) => self.pending = Some(next.clone()),
            _ => {}
        }
        result
    }

    async fn dispatch(&mut self, task: &Task) -> WorkerResult<TaskOutcome> {
        if let Some(url) = &task.book_url {
            self.books.resolve(self.server.as_ref(), url).await?;
        }

        match task.kind {
            TaskKind::Match => {
                let candidate_id = task.candidate.as_deref().ok_or_else(|| {
                    WorkerError::InvalidTask("match task without a candidate network".to_string())
                })?;
                info!("Getting networks for match");
                let primary = self
                    .cache
                    .resolve(self.server.as_ref(), &task.primary, Retention::Forever)
                    .await?;
                let candidate = self
                    .cache
                    .resolve(self.server.as_ref(), candidate_id, Retention::Forever)
                    .await?;

                info!("Starting match");
                let cancel = self.shutdown.child_token();
                let (result, device) = {
                    let mut ctx = self.context(cancel);
                    let result = run_match(&mut ctx, task, &primary, &candidate).await;
                    (result, ctx.device)
                };
                self.record_device(device);
                result
            }
            TaskKind::Train => {
                let retention = Retention::for_training(task.keep_time.as_deref(), self.config.keep);
                let primary = self.resolve_waiting(&task.primary, retention).await?;
                let candidate = match &task.candidate {
                    Some(id) => Some(
                        self.cache
                            .resolve(self.server.as_ref(), id, Retention::Forever)
                            .await?,
                    ),
                    None => None,
                };

                let cancel = self.shutdown.child_token();
                let poller = self.spawn_poller(task, cancel.clone());
                let (result, device) = {
                    let mut ctx = self.context(cancel);
                    let result = run_training(&mut ctx, task, &primary, candidate.as_deref()).await;
                    (result, ctx.device)
                };
                self.record_device(device);

                self.collect_poller(poller).await;
                result
            }
        }
    }

    /// Stop the poller and keep any task it fetched, whatever the training
    /// outcome was
    async fn collect_poller(&mut self, poller: JoinHandle<Option<Task>>) {
        poller.abort();
        if let Ok(Some(next)) = poller.await {
            self.pending = Some(next);
        }
    }

    fn context(&mut self, cancel: CancellationToken) -> TaskContext<'_> {
        TaskContext {
            server: self.server.clone(),
            meta: Arc::new(self.meta.clone()),
            engine: &self.config.engine,
            extra_args: &self.config.engine_args,
            parallelism: self.config.parallelism,
            backend: &mut self.backend,
            pgn: self.pgn.clone(),
            retry: self.config.upload_retry.clone(),
            counter: self.counter.clone(),
            cancel,
            device: None,
        }
    }

    /// Report the engine's device name when asked to and the backend is ours
    fn record_device(&mut self, device: Option<String>) {
        if let Some(device) = device {
            if self.config.report_gpu && !self.backend.has_override() {
                self.meta.gpu = device;
            }
        }
    }

    /// Resolve the training network, waiting while another process downloads it
    async fn resolve_waiting(&self, id: &str, retention: Retention) -> WorkerResult<PathBuf> {
        let deadline = Instant::now() + self.config.lock_wait_limit;
        loop {
            match self.cache.resolve(self.server.as_ref(), id, retention).await {
                Err(WorkerError::LockBusy { .. }) if Instant::now() < deadline => {
                    info!("Waiting for another client to finish downloading {}", id);
                    sleep(self.config.lock_poll_interval).await;
                }
                other => return other,
            }
        }
    }

    fn spawn_poller(&self, task: &Task, cancel: CancellationToken) -> JoinHandle<Option<Task>> {
        tokio::spawn(poll_for_new_work(
            self.server.clone(),
            Arc::new(self.meta.clone()),
            task.clone(),
            self.cache.clone(),
            self.config.poll_interval,
            cancel,
        ))
    }
}

/// Ask the server for work every `interval`. When it hands out something
/// other than `current`, prefetch what a match needs, cancel the running
/// task and return the new task.
async fn poll_for_new_work(
    server: Arc<dyn GridServer>,
    meta: Arc<ClientMeta>,
    current: Task,
    cache: AssetCache,
    interval: Duration,
    cancel: CancellationToken,
) -> Option<Task> {
    let mut errors = 0u32;
    loop {
        tokio::select! {
            _ = sleep(interval) => {}
            _ = cancel.cancelled() => return None,
        }

        match server.next_task(&meta).await {
            Ok(next) if next.same_training(&current) => errors = 0,
            Ok(next) => {
                if next.kind == TaskKind::Match {
                    if let Some(candidate) = &next.candidate {
                        // Prefetch the next network before stopping training
                        if let Err(e) = cache
                            .resolve(server.as_ref(), candidate, Retention::Forever)
                            .await
                        {
                            warn!("Prefetch of {} failed: {}", candidate, e);
                        }
                    }
                }
                info!("Server assigned new work, ending training");
                cancel.cancel();
                return Some(next);
            }
            Err(e) => {
                errors += 1;
                warn!("Error talking to server ({}/{}): {}", errors, MAX_POLL_ERRORS, e);
                if errors >= MAX_POLL_ERRORS {
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::backend::{Capabilities, Capability};
    use crate::cache::test_support::{gzip, sha_hex};
    use crate::cache::CacheLock;
    use crate::orchestrator::test_support::{fast_retry, meta, task, FakeServer};

    struct Fixture {
        dir: tempfile::TempDir,
        server: Arc<FakeServer>,
        config: WorkerConfig,
    }

    impl Fixture {
        /// Server holding one network per content string
        fn new(networks: &[&str]) -> (Self, Vec<String>) {
            let dir = tempfile::tempdir().unwrap();
            let mut server = FakeServer::default();
            let mut ids = Vec::new();
            for content in networks {
                let id = sha_hex(content.as_bytes());
                server.assets.insert(id.clone(), gzip(content.as_bytes()));
                ids.push(id);
            }
            let config = WorkerConfig {
                user: "tester".into(),
                password: "secret".into(),
                cache_dir: dir.path().join("cache"),
                books_dir: dir.path().join("books"),
                poll_interval: Duration::from_secs(60),
                lock_poll_interval: Duration::from_secs(1),
                lock_wait_limit: Duration::from_secs(3),
                upload_retry: fast_retry(),
                ..Default::default()
            };
            (
                Self {
                    dir,
                    server: Arc::new(server),
                    config,
                },
                ids,
            )
        }

        fn task_loop(&self, caps: &[Capability]) -> TaskLoop {
            let backend = BackendState::new(Capabilities::with(caps), None, None).unwrap();
            TaskLoop::new(self.config.clone(), self.server.clone(), backend, meta()).unwrap()
        }

        #[cfg(unix)]
        fn with_engine(mut self, body: &str) -> Self {
            self.config.engine = crate::engine::test_support::fake_engine(self.dir.path(), body);
            self
        }

        #[cfg(unix)]
        fn one_game_script(&self, tail: &str) -> String {
            let train = self.dir.path().join("train");
            format!(
                "mkdir -p '{0}'\n: > '{0}/g1.gz'\n\
                 echo 'gameready trainingfile {0}/g1.gz gameid 1 player1 white result draw moves e2e4'\n{1}",
                train.display(),
                tail
            )
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_train_task_end_to_end() {
        let (fixture, ids) = Fixture::new(&["network-a"]);
        let script = fixture.one_game_script("");
        let fixture = fixture.with_engine(&script);

        let mut t = task(TaskKind::Train, &ids[0], None);
        t.book_url = Some("https://books.example.org/openings/small.pgn".into());
        fixture.server.push_task(Ok(t));

        let mut task_loop = fixture.task_loop(&[Capability::Blas]);
        let outcome = task_loop.run_once().await.unwrap();

        assert_eq!(outcome, TaskOutcome::Completed);
        assert_eq!(fixture.server.uploaded_games(), 1);
        assert!(fixture.config.cache_dir.join(&ids[0]).exists());
        assert!(fixture.config.books_dir.join("small.pgn").exists());
        assert!(task_loop.pending().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fallback_redispatches_same_task() {
        let (fixture, ids) = Fixture::new(&["network-a"]);
        let fixture = fixture.with_engine("echo \"Your GPU doesn't support FP16\"\n");
        let t = task(TaskKind::Train, &ids[0], None);
        fixture.server.push_task(Ok(t.clone()));

        let mut task_loop = fixture.task_loop(&[Capability::CudnnFp16, Capability::Cudnn]);
        let err = task_loop.run_once().await.unwrap_err();
        assert!(matches!(err, WorkerError::RetryWithFallback { .. }));
        assert_eq!(err.disposition(), Disposition::RetrySoon);
        assert_eq!(task_loop.pending(), Some(&t));
        assert!(task_loop.backend().is_revoked(Capability::CudnnFp16));

        // Second attempt runs the pending task on plain cudnn without asking
        // the server again; the same diagnostic is now fatal for the attempt.
        let err = task_loop.run_once().await.unwrap_err();
        assert!(matches!(err, WorkerError::EngineRejected(_)));
        assert_eq!(fixture.server.next_task_calls.load(Ordering::SeqCst), 1);
        assert!(task_loop.pending().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_poller_preempts_training_for_match() {
        let (fixture, ids) = Fixture::new(&["network-a", "network-b"]);
        let script = fixture.one_game_script("exec sleep 30\n");
        let mut fixture = fixture.with_engine(&script);
        fixture.config.poll_interval = Duration::from_millis(50);

        fixture.server.push_task(Ok(task(TaskKind::Train, &ids[0], None)));
        let next = task(TaskKind::Match, &ids[0], Some(&ids[1]));
        fixture.server.push_task(Ok(next.clone()));

        let mut task_loop = fixture.task_loop(&[Capability::Blas]);
        let outcome = tokio::time::timeout(Duration::from_secs(10), task_loop.run_once())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome, TaskOutcome::Preempted);
        assert_eq!(task_loop.pending(), Some(&next));
        // Candidate prefetched before training stopped
        assert!(fixture.config.cache_dir.join(&ids[1]).exists());
    }

    #[tokio::test]
    async fn test_polled_task_survives_completed_training() {
        let (fixture, ids) = Fixture::new(&["network-a", "network-b"]);
        let mut task_loop = fixture.task_loop(&[Capability::Blas]);
        let next = task(TaskKind::Match, &ids[0], Some(&ids[1]));

        let polled = next.clone();
        let poller = tokio::spawn(async move { Some(polled) });
        while !poller.is_finished() {
            tokio::task::yield_now().await;
        }
        task_loop.collect_poller(poller).await;
        assert_eq!(task_loop.pending(), Some(&next));

        // An aborted poller that found nothing leaves pending alone
        let idle = tokio::spawn(async {
            sleep(Duration::from_secs(3600)).await;
            None
        });
        task_loop.collect_poller(idle).await;
        assert_eq!(task_loop.pending(), Some(&next));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_kills_running_engine() {
        let (fixture, ids) = Fixture::new(&["network-a"]);
        let fixture = fixture.with_engine("exec sleep 30\n");
        fixture.server.push_task(Ok(task(TaskKind::Train, &ids[0], None)));

        let mut task_loop = fixture.task_loop(&[Capability::Blas]);
        let shutdown = task_loop.shutdown_token();
        let stopper = tokio::spawn(async move {
            sleep(Duration::from_millis(300)).await;
            shutdown.cancel();
        });

        tokio::time::timeout(Duration::from_secs(10), task_loop.run())
            .await
            .expect("shutdown should not wait for the engine to finish")
            .unwrap();
        stopper.await.unwrap();
        assert_eq!(fixture.server.next_task_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_rejection_terminates_after_backoff() {
        let (fixture, _) = Fixture::new(&[]);
        fixture
            .server
            .push_task(Err(WorkerError::Network("connection refused".into())));
        fixture
            .server
            .push_task(Err(WorkerError::ServerRejected("please upgrade".into())));

        let mut task_loop = fixture.task_loop(&[Capability::Blas]);
        let started = Instant::now();
        let err = task_loop.run().await.unwrap_err();

        assert!(matches!(err, WorkerError::ServerRejected(_)));
        assert_eq!(fixture.server.next_task_calls.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= fixture.config.backoff_sleep);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_training_network_waits_then_gives_up() {
        let (fixture, ids) = Fixture::new(&["network-a"]);
        fixture.server.push_task(Ok(task(TaskKind::Train, &ids[0], None)));
        let mut task_loop = fixture.task_loop(&[Capability::Blas]);
        let _held = CacheLock::try_acquire(&fixture.config.cache_dir, &ids[0]).unwrap();

        let started = Instant::now();
        let err = task_loop.run_once().await.unwrap_err();
        assert!(matches!(err, WorkerError::LockBusy { .. }));
        assert!(started.elapsed() >= fixture.config.lock_wait_limit);
        assert_eq!(fixture.server.asset_fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_busy_match_network_fails_immediately() {
        let (fixture, ids) = Fixture::new(&["network-a", "network-b"]);
        fixture
            .server
            .push_task(Ok(task(TaskKind::Match, &ids[0], Some(&ids[1]))));
        let mut task_loop = fixture.task_loop(&[Capability::Blas]);
        let _held = CacheLock::try_acquire(&fixture.config.cache_dir, &ids[0]).unwrap();

        let err = task_loop.run_once().await.unwrap_err();
        assert!(matches!(err, WorkerError::LockBusy { .. }));
    }

    #[tokio::test]
    async fn test_match_without_candidate_is_invalid() {
        let (fixture, ids) = Fixture::new(&["network-a"]);
        fixture
            .server
            .push_task(Ok(task(TaskKind::Match, &ids[0], None)));
        let mut task_loop = fixture.task_loop(&[Capability::Blas]);

        let err = task_loop.run_once().await.unwrap_err();
        assert!(matches!(err, WorkerError::InvalidTask(_)));
    }
}
