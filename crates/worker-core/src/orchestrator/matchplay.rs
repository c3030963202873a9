//! Match play: the candidate network (player1) against the primary network
//! (player2). The engine plays games back to back; a background slot worker
//! binds each finished game to a server-assigned match slot and reports it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{remove_training_dir, TaskContext, TaskOutcome};
use crate::engine::{EngineMode, SessionInfo, Weights};
use crate::error::{WorkerError, WorkerResult};
use crate::server::{GridServer, MatchUpload};
use crate::types::{ClientMeta, Color, GameRecord, Task};
use crate::upload_retry::{upload_match_game, GameCounter, RetryConfig};

/// Visits per move when the server does not set a search budget
pub const DEFAULT_MATCH_VISITS: u32 = 800;

/// Consecutive server errors that end a match
pub const MAX_SLOT_ERRORS: u32 = 10;

/// Engine arguments for a match task
pub fn match_params(params: &[String]) -> Vec<String> {
    let mut out = params.to_vec();
    out.push("--training=true".to_string());
    let has_budget = out
        .iter()
        .any(|p| p.starts_with("--visits=") || p.starts_with("--playouts="));
    if !has_budget {
        out.push(format!("--visits={}", DEFAULT_MATCH_VISITS));
    }
    out
}

// ============================================================================
// Slot Pairing
// ============================================================================

/// Finished games waiting for a slot, split by which color the candidate
/// played. Pairing takes the most recent game of the matching bucket.
#[derive(Debug, Default)]
pub struct SlotBuckets {
    flipped: Vec<GameRecord>,
    normal: Vec<GameRecord>,
}

impl SlotBuckets {
    pub fn push(&mut self, game: GameRecord) {
        if game.player1 == Some(Color::Black) {
            self.flipped.push(game);
        } else {
            self.normal.push(game);
        }
    }

    /// Most recent game suitable for a slot with the given flip flag
    pub fn take(&mut self, flip: bool) -> Option<GameRecord> {
        if flip {
            self.flipped.pop()
        } else {
            self.normal.pop()
        }
    }

    pub fn len(&self) -> usize {
        self.flipped.len() + self.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Why the slot worker stopped
#[derive(Debug)]
enum SlotEnd {
    /// Engine output ended first
    EngineDone,
    /// The server assigned different work
    Superseded(Task),
    /// Too many consecutive server errors
    ServerErrors,
    /// The server refuses this client
    Rejected(WorkerError),
}

struct SlotWorker {
    server: Arc<dyn GridServer>,
    meta: Arc<ClientMeta>,
    retry: RetryConfig,
    counter: Arc<GameCounter>,
    session: Arc<SessionInfo>,
    /// Task that started the match
    origin: Task,
    /// Slot waiting for a game
    current: Option<Task>,
    buckets: SlotBuckets,
    errors: u32,
}

impl SlotWorker {
    async fn run(mut self, mut games: mpsc::UnboundedReceiver<GameRecord>) -> SlotEnd {
        while let Some(game) = games.recv().await {
            self.buckets.push(game);
            if let Some(end) = self.fill_slots().await {
                return end;
            }
        }
        info!("Match uploader exiting");
        SlotEnd::EngineDone
    }

    /// Upload games into slots until a slot has no matching game or the
    /// server stops handing out slots of this match
    async fn fill_slots(&mut self) -> Option<SlotEnd> {
        loop {
            if let Some(slot) = self.current.take() {
                match self.buckets.take(slot.flip) {
                    Some(game) => {
                        if let Err(e) = self.upload(&slot, &game).await {
                            if matches!(e, WorkerError::ServerRejected(_)) {
                                return Some(SlotEnd::Rejected(e));
                            }
                            warn!("Dropping result for match game {}: {}", slot.match_game_id, e);
                        }
                    }
                    None => {
                        self.current = Some(slot);
                        return None;
                    }
                }
            }

            match self.server.next_task(&self.meta).await {
                Ok(next) if next.same_match(&self.origin) => {
                    self.current = Some(next);
                    self.errors = 0;
                }
                Ok(next) => {
                    info!("Current match finished");
                    return Some(SlotEnd::Superseded(next));
                }
                Err(e @ WorkerError::ServerRejected(_)) => return Some(SlotEnd::Rejected(e)),
                Err(e) => {
                    self.errors += 1;
                    warn!("Error talking to server ({}/{}): {}", self.errors, MAX_SLOT_ERRORS, e);
                    if self.errors >= MAX_SLOT_ERRORS {
                        return Some(SlotEnd::ServerErrors);
                    }
                    return None;
                }
            }
        }
    }

    async fn upload(&self, slot: &Task, game: &GameRecord) -> WorkerResult<()> {
        info!("Uploading match result for slot {}", slot.match_game_id);
        let version = self.session.version().unwrap_or_default();
        let upload = MatchUpload {
            meta: &self.meta,
            match_game_id: slot.match_game_id,
            result: game.signed_result(slot.flip),
            record: game,
            engine_version: &version,
        };
        upload_match_game(self.server.as_ref(), upload, &self.retry, &self.counter).await
    }
}

// ============================================================================
// Match Loop
// ============================================================================

/// Run a match task until the server moves on or the engine exits
pub async fn run_match(
    ctx: &mut TaskContext<'_>,
    task: &Task,
    primary: &Path,
    candidate: &Path,
) -> WorkerResult<TaskOutcome> {
    let weights = Weights::Pair {
        player1: candidate.to_path_buf(),
        player2: primary.to_path_buf(),
    };
    let (mut session, choice) = ctx
        .launch(EngineMode::Selfplay, weights, match_params(&task.params), None, candidate)
        .await?;
    let mut events = session
        .take_events()
        .ok_or_else(|| WorkerError::EngineRejected("session events unavailable".to_string()))?;

    let match_over = CancellationToken::new();
    let (slot_tx, slot_rx) = mpsc::unbounded_channel();
    let worker = SlotWorker {
        server: ctx.server.clone(),
        meta: ctx.meta.clone(),
        retry: ctx.retry.clone(),
        counter: ctx.counter.clone(),
        session: session.info(),
        origin: task.clone(),
        current: Some(task.clone()),
        buckets: SlotBuckets::default(),
        errors: 0,
    };
    let worker = {
        let guard = match_over.clone().drop_guard();
        tokio::spawn(async move {
            let _guard = guard;
            worker.run(slot_rx).await
        })
    };

    let mut games = 0u64;
    let mut training_dir: Option<PathBuf> = None;
    let mut stopped = false;
    let mut preempted = false;

    let streamed: WorkerResult<()> = loop {
        tokio::select! {
            biased;

            Some(signal) = events.retry.recv() => {
                break Err(ctx.signal_error(signal, &choice));
            }
            _ = match_over.cancelled(), if !stopped => {
                info!("Received message to end matches, killing engine");
                stopped = true;
                if let Err(e) = session.kill().await {
                    warn!("Failed to kill engine: {}", e);
                }
            }
            _ = ctx.cancel.cancelled(), if !stopped => {
                info!("Match preempted, killing engine");
                stopped = true;
                preempted = true;
                if let Err(e) = session.kill().await {
                    warn!("Failed to kill engine: {}", e);
                }
            }
            game = events.games.recv() => {
                let Some(record) = game else {
                    info!("Game channel closed, exiting match loop");
                    break Ok(());
                };
                games += 1;
                training_dir = record.training_file.parent().map(Path::to_path_buf);
                if slot_tx.send(record).is_err() {
                    warn!("Match uploader already stopped, game discarded");
                }
            }
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
    drop(slot_tx);
    let end = match worker.await {
        Ok(end) => end,
        Err(e) => {
            warn!("Match uploader failed: {}", e);
            SlotEnd::EngineDone
        }
    };
    remove_training_dir(training_dir).await;

    streamed?;
    if games == 0 && !stopped {
        return Err(ctx.no_progress_error(&session, &choice));
    }

    match end {
        SlotEnd::Rejected(e) => Err(e),
        SlotEnd::Superseded(next) => Ok(TaskOutcome::Superseded(next)),
        SlotEnd::ServerErrors => {
            warn!("Giving up on match after {} server errors", MAX_SLOT_ERRORS);
            Ok(TaskOutcome::Completed)
        }
        SlotEnd::EngineDone if preempted => Ok(TaskOutcome::Preempted),
        SlotEnd::EngineDone => Ok(TaskOutcome::Completed),
    }
}
