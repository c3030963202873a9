//! Opening books: downloaded once by URL, kept forever.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;
use url::Url;

use super::lock::CacheLock;
use super::store::{download_into, Fetch};
use crate::error::{WorkerError, WorkerResult};
use crate::server::GridServer;

/// Default books directory, relative to the working directory
pub const DEFAULT_BOOKS_DIR: &str = "books";

/// Directory of opening books named after the last segment of their URL
#[derive(Debug, Clone)]
pub struct BookCache {
    dir: PathBuf,
}

impl BookCache {
    pub fn open(dir: impl Into<PathBuf>) -> WorkerResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Local file name for a book URL
    pub fn book_name(book_url: &str) -> WorkerResult<String> {
        let url = Url::parse(book_url)
            .map_err(|e| WorkerError::InvalidUrl(format!("{}: {}", book_url, e)))?;
        let name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or_default();
        if name.is_empty() {
            return Err(WorkerError::InvalidUrl(format!(
                "{}: no file name in path",
                book_url
            )));
        }
        Ok(name.to_string())
    }

    /// Return the local path of the book, downloading it under its lock
    pub async fn resolve(&self, source: &dyn GridServer, book_url: &str) -> WorkerResult<PathBuf> {
        let name = Self::book_name(book_url)?;
        let path = self.dir.join(&name);
        if path.exists() {
            return Ok(path);
        }

        let _lock = CacheLock::try_acquire(&self.dir, &name).inspect_err(|e| {
            if matches!(e, WorkerError::LockBusy { .. }) {
                info!("Book download initiated by another client");
            }
        })?;
        if path.exists() {
            return Ok(path);
        }

        info!("Downloading book {}...", name);
        download_into(source, Fetch::Url(book_url), &self.dir, &path, None).await?;
        Ok(path)
    }
}
