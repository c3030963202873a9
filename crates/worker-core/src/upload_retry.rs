//! ============================================================================
//! Upload Retry Logic - Exponential Backoff & Throughput Accounting
//! ============================================================================
//! Game uploads are delivered at least once with a bounded number of tries:
//! - Exponential backoff with jitter between attempts
//! - Error classification (transient vs server rejection)
//! - Training file removal and games/day logging after success
//! ============================================================================

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{WorkerError, WorkerResult};
use crate::server::{GameUpload, GridServer, MatchUpload};

/// Configuration for upload retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of upload attempts
    pub max_attempts: u32,
    /// Base delay between retries (will be multiplied by 2^attempt)
    pub base_delay_ms: u64,
    /// Maximum delay between retries
    pub max_delay_ms: u64,
    /// Whether to add jitter to delays
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 4000,
            max_delay_ms: 60_000,
            jitter: true,
        }
    }
}

/// Calculate delay with exponential backoff and optional jitter
pub fn calculate_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let multiplier = 2u64.saturating_pow(attempt.min(63));
    let base_delay = config.base_delay_ms.saturating_mul(multiplier);
    let capped_delay = base_delay.min(config.max_delay_ms);

    let final_delay = if config.jitter {
        // 0-50% extra
        let jitter_factor = 1.0 + rand::random::<f64>() * 0.5;
        (capped_delay as f64 * jitter_factor) as u64
    } else {
        capped_delay
    };

    Duration::from_millis(final_delay)
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
/// `op` receives the zero-based attempt number.
pub async fn upload_with_retry<F, Fut>(config: &RetryConfig, what: &str, mut op: F) -> WorkerResult<()>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = WorkerResult<()>>,
{
    let max_attempts = config.max_attempts.max(1);

    for attempt in 0..max_attempts {
        if attempt > 0 {
            let delay = calculate_delay(attempt - 1, config);
            debug!("Retrying {} after {:?} delay", what, delay);
            sleep(delay).await;
        }

        match op(attempt).await {
            Ok(()) => {
                debug!("Uploaded {} (attempt {})", what, attempt + 1);
                return Ok(());
            }
            Err(e) if !e.is_retryable_upload() => {
                warn!("Upload of {} failed permanently: {}", what, e);
                return Err(e);
            }
            Err(e) => {
                warn!("Upload attempt {} of {} failed: {}", attempt + 1, what, e);
                if attempt + 1 == max_attempts {
                    return Err(WorkerError::UploadFailed {
                        attempts: max_attempts,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    Err(WorkerError::UploadFailed {
        attempts: max_attempts,
        reason: "no attempt made".to_string(),
    })
}

// ============================================================================
// Throughput
// ============================================================================

/// Games uploaded since process start
#[derive(Debug)]
pub struct GameCounter {
    started: Instant,
    total: AtomicU64,
}

impl Default for GameCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl GameCounter {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            total: AtomicU64::new(0),
        }
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    /// Count one uploaded game and log the running rate
    pub fn record(&self) -> u64 {
        let total = self.total.fetch_add(1, Ordering::SeqCst) + 1;
        let elapsed = self.started.elapsed();
        info!(
            "Completed {} games in {:?} time ({} games/day)",
            total,
            elapsed,
            games_per_day(total, elapsed)
        );
        total
    }
}

pub fn games_per_day(total: u64, elapsed: Duration) -> u64 {
    let hours = elapsed.as_secs_f64() / 3600.0;
    if hours <= 0.0 {
        return 0;
    }
    (total as f64 / hours * 24.0) as u64
}

// ============================================================================
// Upload Helpers
// ============================================================================

/// Upload a training game, then remove its data file
pub async fn upload_training_game(
    server: &dyn GridServer,
    upload: GameUpload<'_>,
    config: &RetryConfig,
    counter: &GameCounter,
) -> WorkerResult<()> {
    let what = upload.record.training_file.display().to_string();
    upload_with_retry(config, &what, |_| server.upload_game(upload)).await?;

    counter.record();
    if let Err(e) = tokio::fs::remove_file(&upload.record.training_file).await {
        warn!("Failed to remove training file {}: {}", what, e);
    }
    Ok(())
}

/// Report one match game result
pub async fn upload_match_game(
    server: &dyn GridServer,
    upload: MatchUpload<'_>,
    config: &RetryConfig,
    counter: &GameCounter,
) -> WorkerResult<()> {
    let what = format!("match game {}", upload.match_game_id);
    upload_with_retry(config, &what, |_| server.upload_match_result(upload)).await?;
    counter.record();
    Ok(())
}
