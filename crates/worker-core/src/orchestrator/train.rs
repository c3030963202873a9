//! Self-play training: every game the engine finishes is uploaded by its own
//! worker while the engine keeps playing.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{info, warn};

use super::{join_uploads, remove_training_dir, TaskContext, TaskOutcome};
use crate::engine::{EngineMode, Weights};
use crate::error::{WorkerError, WorkerResult};
use crate::server::GameUpload;
use crate::types::Task;
use crate::upload_retry::upload_training_game;

/// Run one training task until the engine exits or the task is preempted
pub async fn run_training(
    ctx: &mut TaskContext<'_>,
    task: &Task,
    primary: &Path,
    candidate: Option<&Path>,
) -> WorkerResult<TaskOutcome> {
    let mut params = task.params.clone();
    params.push("--training=true".to_string());
    let weights = match candidate {
        Some(candidate) => Weights::Pair {
            player1: primary.to_path_buf(),
            player2: candidate.to_path_buf(),
        },
        None => Weights::Single(primary.to_path_buf()),
    };

    let parallelism = ctx.parallelism;
    let (mut session, choice) = ctx
        .launch(EngineMode::Selfplay, weights, params, parallelism, primary)
        .await?;
    let mut events = session
        .take_events()
        .ok_or_else(|| WorkerError::EngineRejected("session events unavailable".to_string()))?;

    let task = Arc::new(task.clone());
    let info = session.info();
    let mut uploads: JoinSet<WorkerResult<()>> = JoinSet::new();
    let mut games = 0u64;
    let mut training_dir: Option<PathBuf> = None;
    let mut preempted = false;

    let streamed: WorkerResult<()> = loop {
        tokio::select! {
            biased;

            Some(signal) = events.retry.recv() => {
                break Err(ctx.signal_error(signal, &choice));
            }
            _ = ctx.cancel.cancelled(), if !preempted => {
                info!("Received message to end training, killing engine");
                preempted = true;
                if let Err(e) = session.kill().await {
                    warn!("Failed to kill engine: {}", e);
                }
            }
            game = events.games.recv() => {
                let Some(record) = game else {
                    info!("Game channel closed, exiting train loop");
                    break Ok(());
                };
                games += 1;
                info!("Uploading game: {}", games);
                training_dir = record.training_file.parent().map(Path::to_path_buf);

                let server = ctx.server.clone();
                let meta = ctx.meta.clone();
                let task = task.clone();
                let retry = ctx.retry.clone();
                let counter = ctx.counter.clone();
                let version = info.version().unwrap_or_default();
                uploads.spawn(async move {
                    let upload = GameUpload {
                        meta: &meta,
                        task: &task,
                        record: &record,
                        engine_version: &version,
                    };
                    upload_training_game(server.as_ref(), upload, &retry, &counter).await
                });
            }
            // Best moves are only meaningful in interactive mode
            Some(_) = events.best_moves.recv() => {}
        }
    };

    // Unblock the reader if it is still holding undelivered games
    drop(events);
    if streamed.is_err() {
        if let Err(e) = session.kill().await {
            warn!("Failed to kill engine: {}", e);
        }
    }
    ctx.finish_session(&mut session, &choice).await;

    info!("Waiting for uploads to complete");
    let uploaded = join_uploads(&mut uploads).await;
    remove_training_dir(training_dir).await;

    streamed?;
    if games == 0 && !preempted {
        return Err(ctx.no_progress_error(&session, &choice));
    }
    uploaded?;

    Ok(if preempted {
        TaskOutcome::Preempted
    } else {
        TaskOutcome::Completed
    })
}
