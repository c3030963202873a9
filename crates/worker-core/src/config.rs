//! ============================================================================
//! Worker Configuration - Resolved Settings & Tunables
//! ============================================================================
//! Values come from, in order of precedence:
//! - command line flags (parsed by the binary)
//! - environment / `.env`
//! - `settings.json` (`User`, `Pass`, `Localhost`) in the working directory
//!   or the platform config directory
//! - the defaults below
//! ============================================================================

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backend::BackendState;
use crate::cache::{DEFAULT_BOOKS_DIR, DEFAULT_CACHE_DIR};
use crate::error::{WorkerError, WorkerResult};
use crate::types::{client_token, ClientMeta};
use crate::upload_retry::RetryConfig;

pub const DEFAULT_SERVER_URL: &str = "http://api.lczero.org";
pub const TEST_SERVER_URL: &str = "http://testserver.lczero.org";

/// Name reported when the operator sets none
pub const DEFAULT_LOCAL_HOST: &str = "Unknown";

/// GPU name reported when device reporting is off
pub const DEFAULT_GPU_NAME: &str = "Unknown";

pub const SETTINGS_FILE: &str = "settings.json";

/// Largest accepted training run number
pub const MAX_RUN_ID: u32 = 640;

// ============================================================================
// settings.json
// ============================================================================

/// Credentials file shared with earlier clients
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Settings {
    pub user: String,
    pub pass: String,
    pub localhost: String,
}

impl Settings {
    /// Candidate locations, most specific first
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(SETTINGS_FILE)];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("grid-worker").join(SETTINGS_FILE));
        }
        paths
    }

    /// Read settings from `path`. A missing file yields None; a malformed one
    /// is an error.
    pub fn read(path: &Path) -> WorkerResult<Option<Self>> {
        match fs::read_to_string(path) {
            Ok(text) => {
                let settings = serde_json::from_str(&text)?;
                info!("Loaded settings from {}", path.display());
                Ok(Some(settings))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// First settings file found in `search_paths`
    pub fn discover() -> WorkerResult<Option<Self>> {
        for path in Self::search_paths() {
            if let Some(settings) = Self::read(&path)? {
                return Ok(Some(settings));
            }
        }
        Ok(None)
    }
}

// ============================================================================
// WorkerConfig
// ============================================================================

/// Fully resolved worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub server_url: String,
    pub user: String,
    pub password: String,
    /// Machine name reported to the server
    pub local_host: String,
    pub engine: PathBuf,
    /// Extra engine arguments, for testing engine builds
    pub engine_args: Vec<String>,
    pub backend_opts: Option<String>,
    pub gpu: Option<u32>,
    pub parallelism: Option<u32>,
    pub run_id: u32,
    /// Never evict cached networks
    pub keep: bool,
    /// None: decide from the probed backends
    pub train_only: Option<bool>,
    pub report_gpu: bool,
    pub cache_dir: PathBuf,
    pub books_dir: PathBuf,
    /// Interval between preemption polls during training
    pub poll_interval: Duration,
    /// Interval between checks of a network another process is downloading
    pub lock_poll_interval: Duration,
    /// Give up waiting on another process's download after this long
    pub lock_wait_limit: Duration,
    /// Sleep before re-dispatching after a backend fallback
    pub retry_sleep: Duration,
    /// Sleep after any other failed attempt
    pub backoff_sleep: Duration,
    pub upload_retry: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            user: String::new(),
            password: String::new(),
            local_host: String::new(),
            engine: default_engine_path(),
            engine_args: Vec::new(),
            backend_opts: None,
            gpu: None,
            parallelism: None,
            run_id: 0,
            keep: false,
            train_only: None,
            report_gpu: false,
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            books_dir: PathBuf::from(DEFAULT_BOOKS_DIR),
            poll_interval: Duration::from_secs(60),
            lock_poll_interval: Duration::from_secs(10),
            lock_wait_limit: Duration::from_secs(600),
            retry_sleep: Duration::from_secs(1),
            backoff_sleep: Duration::from_secs(30),
            upload_retry: RetryConfig::default(),
        }
    }
}

/// Engine binary next to the working directory
pub fn default_engine_path() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from("lc0.exe")
    } else {
        PathBuf::from("./lc0")
    }
}

/// Best-effort machine hostname
pub fn machine_hostname() -> Option<String> {
    for var in ["HOSTNAME", "COMPUTERNAME"] {
        if let Ok(name) = std::env::var(var) {
            if !name.trim().is_empty() {
                return Some(name.trim().to_string());
            }
        }
    }
    fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl WorkerConfig {
    /// Fill credentials and host name from settings, then validate
    pub fn apply_settings(&mut self, settings: Option<&Settings>, report_host: bool) -> WorkerResult<()> {
        if let Some(settings) = settings {
            if self.user.is_empty() || self.password.is_empty() {
                self.user = settings.user.clone();
                self.password = settings.pass.clone();
            }
            if self.local_host.is_empty() && !settings.localhost.is_empty() {
                self.local_host = settings.localhost.clone();
            }
        }

        if self.user.is_empty() {
            return Err(WorkerError::InvalidConfig(
                "You must specify a username".to_string(),
            ));
        }
        if self.password.is_empty() {
            return Err(WorkerError::InvalidConfig(
                "You must specify a non-empty password".to_string(),
            ));
        }

        if report_host && self.local_host.is_empty() {
            if let Some(name) = machine_hostname() {
                self.local_host = name;
            }
        }
        if self.local_host.is_empty() {
            self.local_host = DEFAULT_LOCAL_HOST.to_string();
        }
        Ok(())
    }

    pub fn validate(&self) -> WorkerResult<()> {
        if self.run_id > MAX_RUN_ID {
            return Err(WorkerError::InvalidConfig(format!(
                "Training run number too large: {} > {}",
                self.run_id, MAX_RUN_ID
            )));
        }
        Ok(())
    }

    /// Train-only mode: explicit flag, or automatic without a GPU backend
    pub fn effective_train_only(&self, backend: &BackendState) -> bool {
        match self.train_only {
            Some(explicit) => explicit,
            None if !backend.has_gpu_backend() => {
                info!("Will only run training games, use --train-only=false to override");
                true
            }
            None => false,
        }
    }

    /// Metadata attached to every server request for this process
    pub fn client_meta(&self, backend: &BackendState) -> ClientMeta {
        ClientMeta {
            user: self.user.clone(),
            password: self.password.clone(),
            token: client_token(self.run_id),
            train_only: self.effective_train_only(backend),
            hostname: self.local_host.clone(),
            gpu: DEFAULT_GPU_NAME.to_string(),
            gpu_id: self.gpu.map(i64::from).unwrap_or(-1),
        }
    }
}
