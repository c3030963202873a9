//! ============================================================================
//! Cache Module - Shared On-Disk Assets
//! ============================================================================
//! Network weights and opening books shared by every worker process on the
//! machine that points at the same directories:
//! - AssetCache: content-addressed, gzip + sha256 verified, age-evicted
//! - BookCache: URL-named books, kept forever
//! - CacheLock: per-asset advisory lock coordinating concurrent downloads
//! ============================================================================

mod books;
mod lock;
mod retention;
mod store;

pub use books::{BookCache, DEFAULT_BOOKS_DIR};
pub use lock::{CacheLock, LOCK_SUFFIX};
pub use retention::{parse_duration, Retention, DEFAULT_TRAINING_WINDOW, KEEP_FOREVER};
pub use store::{gunzip_digest, AssetCache, AssetEntry, DEFAULT_CACHE_DIR};

#[cfg(test)]
pub(crate) use store::tests as test_support;
