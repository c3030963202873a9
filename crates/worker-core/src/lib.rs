//! ============================================================================
//! WORKER-CORE: Grid Worker Engine Room
//! ============================================================================
//! Everything a worker node needs to contribute to a distributed
//! engine-training grid:
//! - grid server client (task fetch, asset download, game uploads)
//! - content-addressed network cache with cross-process locks and retention
//! - backend capability probing, fallback and sanity checks
//! - engine process supervision and output protocol decoding
//! - training and match orchestration with retrying uploads
//! - the outer task loop with preemption and failure classification
//! ============================================================================

pub mod backend;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod pgn;
pub mod server;
pub mod task_loop;
pub mod types;
pub mod upload_retry;

// Re-export main types for convenience
pub use types::*;
pub use backend::{BackendState, Capabilities, Capability};
pub use cache::{AssetCache, BookCache, Retention};
pub use config::{Settings, WorkerConfig};
pub use error::{Disposition, WorkerError, WorkerResult};
pub use orchestrator::TaskOutcome;
pub use server::{GridServer, HttpGridServer};
pub use task_loop::TaskLoop;
