//! ============================================================================
//! Asset Cache - Content-Addressed Network Store
//! ============================================================================
//! One file per asset, named by the sha256 of its gunzipped content:
//! - Entries are re-verified on every lookup; a mismatch deletes the file
//! - Downloads go to a temp file in the same directory and are renamed
//!   into place, under the asset's CacheLock
//! - Retention evicts stale entries before the requested one is resolved
//! ============================================================================

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::lock::{CacheLock, LOCK_SUFFIX};
use super::retention::Retention;
use crate::error::{WorkerError, WorkerResult};
use crate::server::GridServer;

/// Default cache directory, relative to the working directory
pub const DEFAULT_CACHE_DIR: &str = "client-cache";

/// State of one cache entry after a lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetEntry {
    pub id: String,
    pub path: PathBuf,
    pub present: bool,
    pub verified: bool,
}

/// Result of hashing a stored artifact
#[derive(Debug, Clone, PartialEq, Eq)]
enum Verification {
    Missing,
    Valid,
    Mismatch(String),
}

/// Disk-backed store for downloadable network weights
#[derive(Debug, Clone)]
pub struct AssetCache {
    dir: PathBuf,
}

impl AssetCache {
    /// Open (creating if needed) the cache rooted at `dir`
    pub fn open(dir: impl Into<PathBuf>) -> WorkerResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    /// Look up and verify `id`; a corrupt entry is deleted
    pub fn lookup(&self, id: &str) -> WorkerResult<AssetEntry> {
        let path = self.path_for(id);
        let verification = verify_file(&path, id)?;
        if let Verification::Mismatch(actual) = &verification {
            warn!("Deleting invalid network {} (hash {})", id, actual);
            remove_if_exists(&path)?;
        }

        Ok(AssetEntry {
            id: id.to_string(),
            present: verification == Verification::Valid,
            verified: verification == Verification::Valid,
            path,
        })
    }

    /// Resolve `id` to a verified local path, downloading it if needed.
    ///
    /// Retention runs first so stale entries are reclaimed without ever
    /// touching the requested asset. Lock contention yields `LockBusy`; a
    /// fresh download that fails verification yields `Corrupt` and never
    /// replaces the file at the entry's path.
    pub async fn resolve(
        &self,
        source: &dyn GridServer,
        id: &str,
        retention: Retention,
    ) -> WorkerResult<PathBuf> {
        if let Retention::Window(window) = retention {
            let cache = self.clone();
            let keep = id.to_string();
            let evicted = tokio::task::spawn_blocking(move || cache.evict_stale(&keep, window))
                .await
                .map_err(|e| WorkerError::Io(io::Error::other(e)))?;
            if let Err(e) = evicted {
                warn!("Failed to remove old network(s): {}", e);
            }
        }

        let entry = self.lookup_blocking(id).await?;
        if entry.verified {
            debug!("Network {} already cached", id);
            return Ok(entry.path);
        }

        let lock = match CacheLock::try_acquire(&self.dir, id) {
            Ok(lock) => lock,
            Err(e @ WorkerError::LockBusy { .. }) => {
                info!("Download of {} initiated by another client", id);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        // Another holder may have finished between the lookup and the lock.
        let entry = self.lookup_blocking(id).await?;
        if entry.verified {
            return Ok(entry.path);
        }

        info!("Downloading network {}...", id);
        download_into(source, Fetch::Asset(id), &self.dir, &entry.path, Some(id)).await?;
        drop(lock);

        info!("Network {} downloaded and verified", id);
        Ok(entry.path)
    }

    /// Remove every entry except `keep` (and its lock) older than `window`.
    /// Lock files held by another process are left alone.
    pub fn evict_stale(&self, keep: &str, window: std::time::Duration) -> WorkerResult<usize> {
        let keep_lock = format!("{}{}", keep, LOCK_SUFFIX);
        let now = SystemTime::now();
        let mut removed = 0;

        for dirent in fs::read_dir(&self.dir)? {
            let dirent = dirent?;
            let name = dirent.file_name().to_string_lossy().into_owned();
            if name == keep || name == keep_lock {
                continue;
            }
            if remove_if_stale(&dirent.path(), window, now)? {
                info!("Removed {}", name);
                removed += 1;
            }
        }

        Ok(removed)
    }

    async fn lookup_blocking(&self, id: &str) -> WorkerResult<AssetEntry> {
        let cache = self.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || cache.lookup(&id))
            .await
            .map_err(|e| WorkerError::Io(io::Error::other(e)))?
    }
}

/// What a download pulls from the server
#[derive(Debug, Clone, Copy)]
pub(crate) enum Fetch<'a> {
    Asset(&'a str),
    Url(&'a str),
}

/// Stream a download into a temp file next to `dest`, verify it against
/// `expect` when given, then rename it into place. The temp file is removed
/// on any failure, so a bad download never lands at `dest`.
pub(crate) async fn download_into(
    source: &dyn GridServer,
    fetch: Fetch<'_>,
    dir: &Path,
    dest: &Path,
    expect: Option<&str>,
) -> WorkerResult<u64> {
    let prefix = format!(
        "{}_tmp",
        dest.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    );
    let temp = tempfile::Builder::new().prefix(&prefix).tempfile_in(dir)?;
    let mut out = tokio::fs::File::from_std(temp.reopen()?);

    let written = match fetch {
        Fetch::Asset(id) => source.fetch_asset(id, &mut out).await?,
        Fetch::Url(url) => source.fetch_url(url, &mut out).await?,
    };
    out.sync_all().await?;
    drop(out);

    if let Some(id) = expect {
        match verify_blocking(temp.path().to_path_buf(), id.to_string()).await? {
            Verification::Valid => {}
            Verification::Mismatch(actual) => {
                warn!("Downloaded network {} failed verification", id);
                return Err(WorkerError::Corrupt {
                    id: id.to_string(),
                    actual,
                });
            }
            Verification::Missing => {
                return Err(WorkerError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("download of {} vanished before verification", id),
                )))
            }
        }
    }

    temp.persist(dest).map_err(|e| WorkerError::Io(e.error))?;
    Ok(written)
}

async fn verify_blocking(path: PathBuf, id: String) -> WorkerResult<Verification> {
    tokio::task::spawn_blocking(move || verify_file(&path, &id))
        .await
        .map_err(|e| WorkerError::Io(io::Error::other(e)))?
}

/// Remove `path` if it is older than `window`. An entry that disappears
/// mid-sweep (another worker evicted it) is skipped.
fn remove_if_stale(path: &Path, window: std::time::Duration, now: SystemTime) -> WorkerResult<bool> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    let age = metadata
        .modified()
        .ok()
        .and_then(|m| now.duration_since(m).ok())
        .unwrap_or_default();
    if age < window {
        return Ok(false);
    }

    let is_lock = path
        .file_name()
        .is_some_and(|n| n.to_string_lossy().ends_with(LOCK_SUFFIX));
    if is_lock && CacheLock::is_held(path) {
        debug!("Skipping held lock {}", path.display());
        return Ok(false);
    }

    let removed = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match removed {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Gunzip `path` and compare its sha256 with `id`
fn verify_file(path: &Path, id: &str) -> WorkerResult<Verification> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Verification::Missing),
        Err(e) => return Err(e.into()),
    };

    match gunzip_digest(file) {
        Ok(actual) if actual == id => Ok(Verification::Valid),
        Ok(actual) => Ok(Verification::Mismatch(actual)),
        Err(e) => Ok(Verification::Mismatch(format!("unreadable ({})", e))),
    }
}

/// Lowercase hex sha256 of the gunzipped content of `file`
pub fn gunzip_digest(file: File) -> io::Result<String> {
    let mut decoder = GzDecoder::new(BufReader::new(file));
    let mut hasher = Sha256::new();
    io::copy(&mut decoder, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn remove_if_exists(path: &Path) -> WorkerResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::server::{DownloadSink, GameUpload, MatchUpload};
    use crate::types::{ClientMeta, Task};
    use async_trait::async_trait;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    pub(crate) fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    pub(crate) fn sha_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    /// Serves one fixed blob for every asset id, counting downloads
    pub(crate) struct BlobSource {
        pub blob: Vec<u8>,
        pub downloads: Arc<AtomicUsize>,
        pub delay: Duration,
    }

    impl BlobSource {
        pub(crate) fn new(blob: Vec<u8>) -> Self {
            Self {
                blob,
                downloads: Arc::new(AtomicUsize::new(0)),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl GridServer for BlobSource {
        async fn next_task(&self, _meta: &ClientMeta) -> WorkerResult<Task> {
            Err(WorkerError::Network("not a task server".into()))
        }

        async fn fetch_asset(&self, _id: &str, out: DownloadSink<'_>) -> WorkerResult<u64> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            out.write_all(&self.blob).await?;
            Ok(self.blob.len() as u64)
        }

        async fn fetch_url(&self, _url: &str, out: DownloadSink<'_>) -> WorkerResult<u64> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            out.write_all(&self.blob).await?;
            Ok(self.blob.len() as u64)
        }

        async fn upload_game(&self, _upload: GameUpload<'_>) -> WorkerResult<()> {
            Ok(())
        }

        async fn upload_match_result(&self, _upload: MatchUpload<'_>) -> WorkerResult<()> {
            Ok(())
        }
    }

    fn age_file(path: &Path, age: Duration) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[tokio::test]
    async fn test_resolve_downloads_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AssetCache::open(dir.path()).unwrap();
        let content = b"network weights v1";
        let id = sha_hex(content);
        let source = BlobSource::new(gzip(content));

        let path = cache.resolve(&source, &id, Retention::Forever).await.unwrap();
        assert_eq!(path, dir.path().join(&id));
        assert_eq!(gunzip_digest(File::open(&path).unwrap()).unwrap(), id);

        // Second resolve is served from disk.
        cache.resolve(&source, &id, Retention::Forever).await.unwrap();
        assert_eq!(source.downloads.load(Ordering::SeqCst), 1);

        // No temp files left behind.
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| !n.ends_with(LOCK_SUFFIX))
            .collect();
        assert_eq!(names, vec![id]);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_deleted_and_redownloaded() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AssetCache::open(dir.path()).unwrap();
        let content = b"good weights";
        let id = sha_hex(content);
        fs::write(dir.path().join(&id), gzip(b"tampered")).unwrap();

        let entry = cache.lookup(&id).unwrap();
        assert!(!entry.verified);
        assert!(!dir.path().join(&id).exists());

        let source = BlobSource::new(gzip(content));
        cache.resolve(&source, &id, Retention::Forever).await.unwrap();
        assert_eq!(source.downloads.load(Ordering::SeqCst), 1);
        assert!(cache.lookup(&id).unwrap().verified);
    }

    #[tokio::test]
    async fn test_repeated_corruption_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AssetCache::open(dir.path()).unwrap();
        let id = sha_hex(b"expected");
        let source = BlobSource::new(gzip(b"something else"));

        let err = cache.resolve(&source, &id, Retention::Forever).await.unwrap_err();
        assert!(matches!(err, WorkerError::Corrupt { .. }));
        assert!(!dir.path().join(&id).exists());
    }

    #[tokio::test]
    async fn test_non_gzip_content_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AssetCache::open(dir.path()).unwrap();
        let id = sha_hex(b"expected");
        let source = BlobSource::new(b"plain bytes, not gzip".to_vec());

        let err = cache.resolve(&source, &id, Retention::Forever).await.unwrap_err();
        assert!(matches!(err, WorkerError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_held_lock_means_lock_busy_without_download() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AssetCache::open(dir.path()).unwrap();
        let content = b"weights";
        let id = sha_hex(content);
        let source = BlobSource::new(gzip(content));

        // Another process is downloading.
        let _other = CacheLock::try_acquire(dir.path(), &id).unwrap();

        let err = cache.resolve(&source, &id, Retention::Forever).await.unwrap_err();
        assert!(matches!(err, WorkerError::LockBusy { .. }));
        assert_eq!(source.downloads.load(Ordering::SeqCst), 0);
        assert!(!dir.path().join(&id).exists());
    }

    #[tokio::test]
    async fn test_concurrent_resolves_download_at_most_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AssetCache::open(dir.path()).unwrap();
        let content = b"shared weights";
        let id = sha_hex(content);
        let mut source = BlobSource::new(gzip(content));
        source.delay = Duration::from_millis(100);

        let (a, b) = tokio::join!(
            cache.resolve(&source, &id, Retention::Forever),
            cache.resolve(&source, &id, Retention::Forever)
        );

        assert_eq!(source.downloads.load(Ordering::SeqCst), 1);
        for result in [a, b] {
            match result {
                Ok(path) => assert_eq!(path, dir.path().join(&id)),
                Err(WorkerError::LockBusy { .. }) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
    }

    #[tokio::test]
    async fn test_retention_window_spares_current_asset() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AssetCache::open(dir.path()).unwrap();
        let content = b"current";
        let id = sha_hex(content);

        fs::write(dir.path().join(&id), gzip(content)).unwrap();
        fs::write(dir.path().join("old-network"), b"x").unwrap();
        fs::write(dir.path().join("recent-network"), b"y").unwrap();
        age_file(&dir.path().join(&id), Duration::from_secs(10 * 3600));
        age_file(&dir.path().join("old-network"), Duration::from_secs(5 * 3600));
        age_file(&dir.path().join("recent-network"), Duration::from_secs(3 * 3600));

        let source = BlobSource::new(gzip(content));
        let window = Retention::parse("4h").unwrap();
        let path = cache.resolve(&source, &id, window).await.unwrap();

        assert!(path.exists());
        assert!(!dir.path().join("old-network").exists());
        assert!(dir.path().join("recent-network").exists());
        assert_eq!(source.downloads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_evict_skips_held_locks() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AssetCache::open(dir.path()).unwrap();

        let held = CacheLock::try_acquire(dir.path(), "busy").unwrap();
        fs::write(dir.path().join("idle.lck"), b"").unwrap();
        age_file(held.path(), Duration::from_secs(5 * 3600));
        age_file(&dir.path().join("idle.lck"), Duration::from_secs(5 * 3600));

        let removed = cache
            .evict_stale("current", Duration::from_secs(4 * 3600))
            .unwrap();
        assert_eq!(removed, 1);
        assert!(held.path().exists());
        assert!(!dir.path().join("idle.lck").exists());
    }

    #[tokio::test]
    async fn test_forever_never_evicts() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AssetCache::open(dir.path()).unwrap();
        fs::write(dir.path().join("ancient"), b"x").unwrap();
        age_file(&dir.path().join("ancient"), Duration::from_secs(1000 * 3600));

        let content = b"n";
        let id = sha_hex(content);
        let source = BlobSource::new(gzip(content));
        cache.resolve(&source, &id, Retention::Forever).await.unwrap();
        assert!(dir.path().join("ancient").exists());
    }

    /// Streams bad bytes while a peer process finishes a good copy at `dest`
    struct RacingPeerSource {
        dest: PathBuf,
        good: Vec<u8>,
        bad: Vec<u8>,
    }

    #[async_trait]
    impl GridServer for RacingPeerSource {
        async fn next_task(&self, _meta: &ClientMeta) -> WorkerResult<Task> {
            Err(WorkerError::Network("not a task server".into()))
        }

        async fn fetch_asset(&self, _id: &str, out: DownloadSink<'_>) -> WorkerResult<u64> {
            fs::write(&self.dest, &self.good)?;
            out.write_all(&self.bad).await?;
            Ok(self.bad.len() as u64)
        }

        async fn fetch_url(&self, _url: &str, _out: DownloadSink<'_>) -> WorkerResult<u64> {
            Err(WorkerError::Network("not a book server".into()))
        }

        async fn upload_game(&self, _upload: GameUpload<'_>) -> WorkerResult<()> {
            Ok(())
        }

        async fn upload_match_result(&self, _upload: MatchUpload<'_>) -> WorkerResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_corrupt_download_never_replaces_valid_copy() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AssetCache::open(dir.path()).unwrap();
        let content = b"shared weights";
        let id = sha_hex(content);
        let source = RacingPeerSource {
            dest: dir.path().join(&id),
            good: gzip(content),
            bad: gzip(b"truncated weights"),
        };

        let err = cache.resolve(&source, &id, Retention::Forever).await.unwrap_err();
        assert!(matches!(err, WorkerError::Corrupt { .. }));

        // The peer's copy survives and the lock is free again
        assert!(cache.lookup(&id).unwrap().verified);
        assert!(CacheLock::try_acquire(dir.path(), &id).is_ok());
        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                let name = e.as_ref().unwrap().file_name().to_string_lossy().into_owned();
                name.contains("_tmp")
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_vanished_entry_is_skipped_by_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("evicted-elsewhere");
        let removed = remove_if_stale(&gone, Duration::ZERO, SystemTime::now()).unwrap();
        assert!(!removed);

        fs::write(&gone, b"x").unwrap();
        age_file(&gone, Duration::from_secs(10));
        assert!(remove_if_stale(&gone, Duration::from_secs(1), SystemTime::now()).unwrap());
        assert!(!gone.exists());
    }
}
