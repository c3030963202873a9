//! ============================================================================
//! Orchestrator Module - Running One Task Against One Engine Session
//! ============================================================================
//! - train: self-play, one upload worker per finished game, preemptible
//! - matchplay: candidate vs primary, games paired with server slots
//!
//! Both share the launch, shutdown and cleanup steps defined here.
//! ============================================================================

mod matchplay;
mod train;

pub use matchplay::{match_params, run_match, SlotBuckets, DEFAULT_MATCH_VISITS, MAX_SLOT_ERRORS};
pub use train::run_training;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{BackendChoice, BackendState};
use crate::engine::{EngineMode, EngineSession, LaunchArgs, RetrySignal, Weights};
use crate::error::{WorkerError, WorkerResult};
use crate::pgn::PgnBuilder;
use crate::server::GridServer;
use crate::types::{ClientMeta, Task};
use crate::upload_retry::{GameCounter, RetryConfig};

/// How a task attempt ended when it did not fail
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The engine finished on its own
    Completed,
    /// The preemption token fired and the engine was stopped
    Preempted,
    /// The server handed out different work mid-match
    Superseded(Task),
}

/// Everything one task attempt borrows from the task loop
pub struct TaskContext<'a> {
    pub server: Arc<dyn GridServer>,
    pub meta: Arc<ClientMeta>,
    pub engine: &'a Path,
    pub extra_args: &'a [String],
    pub parallelism: Option<u32>,
    pub backend: &'a mut BackendState,
    pub pgn: Arc<dyn PgnBuilder>,
    pub retry: RetryConfig,
    pub counter: Arc<GameCounter>,
    /// One-shot preemption signal for this attempt
    pub cancel: CancellationToken,
    /// Device name reported by the engine, filled in when the session ends
    pub device: Option<String>,
}

impl TaskContext<'_> {
    /// Sanity check the backend if needed, then start the engine
    async fn launch(
        &mut self,
        mode: EngineMode,
        weights: Weights,
        params: Vec<String>,
        parallelism: Option<u32>,
        checked_weights: &Path,
    ) -> WorkerResult<(EngineSession, BackendChoice)> {
        self.backend
            .ensure_sanity_checked(self.engine, checked_weights)
            .await?;

        let (choice, backend_opts) = self.backend.choose_args();
        let mut launch = LaunchArgs::new(mode, weights);
        launch.extra = self.extra_args.to_vec();
        launch.backend_opts = backend_opts;
        launch.parallelism = parallelism;
        launch.params = params;

        let session = EngineSession::launch(self.engine, &launch, self.pgn.clone())?;
        Ok((session, choice))
    }

    /// Wait for the engine and its reader, then fold what the session proved
    /// into the backend state
    async fn finish_session(&mut self, session: &mut EngineSession, choice: &BackendChoice) {
        info!("Waiting for the engine to stop");
        match session.wait().await {
            Ok(status) => info!("Engine stopped ({})", status),
            Err(e) => warn!("Failed waiting for the engine: {}", e),
        }
        session.join_reader().await;

        let info = session.info();
        if info.activity_seen() {
            if let BackendChoice::Capability(capability) = choice {
                self.backend.mark_verified(*capability);
            }
        }
        if let Some(device) = info.device() {
            self.device = Some(device);
        }
    }

    /// Error for a retry signal raised by the engine
    fn signal_error(&mut self, signal: RetrySignal, choice: &BackendChoice) -> WorkerError {
        match signal {
            RetrySignal::BackendIncompatible => self.backend.on_incompatible(choice),
            RetrySignal::UnknownFlag(line) => WorkerError::EngineRejected(format!(
                "{} - you probably have an old engine version",
                line
            )),
            RetrySignal::SelfCheckFailed => WorkerError::EngineRejected(
                "The dx12 backend failed the self check - try updating gpu drivers".to_string(),
            ),
        }
    }

    /// Error for a session that ended without producing anything
    fn no_progress_error(&mut self, session: &EngineSession, choice: &BackendChoice) -> WorkerError {
        let activity = session.info().activity_seen();
        self.backend
            .on_silent_exit(choice, activity)
            .unwrap_or(WorkerError::NoProgress)
    }
}

/// Join every upload worker, keeping the most severe failure
pub(crate) async fn join_uploads(uploads: &mut JoinSet<WorkerResult<()>>) -> WorkerResult<()> {
    let mut failure: Option<WorkerError> = None;
    while let Some(joined) = uploads.join_next().await {
        let err = match joined {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e,
            Err(e) => WorkerError::UploadFailed {
                attempts: 0,
                reason: format!("upload worker failed: {}", e),
            },
        };
        warn!("Upload failed: {}", err);
        failure = match failure {
            Some(WorkerError::ServerRejected(msg)) => Some(WorkerError::ServerRejected(msg)),
            _ => Some(err),
        };
    }
    failure.map_or(Ok(()), Err)
}

/// Remove the engine's training data directory for this task
pub(crate) async fn remove_training_dir(dir: Option<PathBuf>) {
    let Some(dir) = dir else { return };
    info!("Removing training dir: {}", dir.display());
    if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Error removing training dir: {}", e);
        }
    }
}
