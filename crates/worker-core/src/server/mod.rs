//! ============================================================================
//! Grid Server Interface
//! ============================================================================
//! The coordinating server as the worker sees it:
//! - next_task: fetch the next unit of work (or the next match slot)
//! - fetch_asset / fetch_url: stream network weights and opening books
//! - upload_game / upload_match_result: report finished games
//!
//! `HttpGridServer` is the production implementation; tests substitute
//! in-memory fakes through the same trait object.
//! ============================================================================

mod http;

pub use http::HttpGridServer;

use async_trait::async_trait;
use tokio::io::AsyncWrite;

use crate::error::WorkerResult;
use crate::types::{ClientMeta, GameRecord, Task};

/// Destination for streamed downloads
pub type DownloadSink<'a> = &'a mut (dyn AsyncWrite + Unpin + Send);

/// A finished training game plus the identifiers the server attributes it by
#[derive(Debug, Clone, Copy)]
pub struct GameUpload<'a> {
    pub meta: &'a ClientMeta,
    pub task: &'a Task,
    pub record: &'a GameRecord,
    pub engine_version: &'a str,
}

/// A finished match game bound to a server slot
#[derive(Debug, Clone, Copy)]
pub struct MatchUpload<'a> {
    pub meta: &'a ClientMeta,
    pub match_game_id: u64,
    /// Result from the candidate's perspective: +1 win, 0 draw, -1 loss
    pub result: i32,
    pub record: &'a GameRecord,
    pub engine_version: &'a str,
}

/// Operations the worker consumes from the coordinating server
#[async_trait]
pub trait GridServer: Send + Sync {
    /// Request the next unit of work
    async fn next_task(&self, meta: &ClientMeta) -> WorkerResult<Task>;

    /// Stream the gzip container of asset `id` into `out`, returning bytes written
    async fn fetch_asset(&self, id: &str, out: DownloadSink<'_>) -> WorkerResult<u64>;

    /// Stream an arbitrary URL (opening books) into `out`
    async fn fetch_url(&self, url: &str, out: DownloadSink<'_>) -> WorkerResult<u64>;

    /// Upload one training game with its data file
    async fn upload_game(&self, upload: GameUpload<'_>) -> WorkerResult<()>;

    /// Report one match game result for a slot
    async fn upload_match_result(&self, upload: MatchUpload<'_>) -> WorkerResult<()>;
}
