//! ============================================================================
//! Backend Selection - Capability Probe, Choice & Sticky Revocation
//! ============================================================================
//! The engine binary advertises its compute backends in `--help`. The worker:
//! - probes them once at startup
//! - picks the most preferred backend that has not been revoked
//! - revokes the half-precision backend for the rest of the process when the
//!   engine proves it cannot run on this GPU
//!
//! An operator-supplied backend string always wins and never falls back.
//! ============================================================================

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{WorkerError, WorkerResult};

/// Tokens rejected in operator backend options
const DISALLOWED_OVERRIDE_TOKENS: &[&str] = &["random"];

/// Marker printed by the engine when a backend self-check fails
pub const SELF_CHECK_FAILED: &str = "*** ERROR check failed";

/// Minimum compute capability that proves half precision works
pub const FP16_MIN_COMPUTE_CAPABILITY: f32 = 7.0;

/// Start position used for the dx12 sanity benchmark
const STARTPOS_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

/// Compute backends, declared in preference order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    CudnnFp16,
    Cudnn,
    Dx12,
    OpenCl,
    Blas,
}

impl Capability {
    /// All backends, most preferred first
    pub const PREFERENCE: [Capability; 5] = [
        Capability::CudnnFp16,
        Capability::Cudnn,
        Capability::Dx12,
        Capability::OpenCl,
        Capability::Blas,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Capability::CudnnFp16 => "cudnn-fp16",
            Capability::Cudnn => "cudnn",
            Capability::Dx12 => "dx12",
            Capability::OpenCl => "opencl",
            Capability::Blas => "blas",
        }
    }

    /// Only half precision can be withdrawn at runtime
    pub fn is_revocable(&self) -> bool {
        matches!(self, Capability::CudnnFp16)
    }

    /// Backends fast enough for match play
    pub fn is_gpu(&self) -> bool {
        matches!(
            self,
            Capability::CudnnFp16 | Capability::Cudnn | Capability::Dx12
        )
    }

    /// Value for `--backend-opts`, or None to let the engine decide
    fn backend_opts(&self, gpu: Option<u32>) -> Option<String> {
        let gpu = gpu.map(|g| format!(",gpu={}", g)).unwrap_or_default();
        match self {
            Capability::CudnnFp16 => Some(format!("backend=cudnn-fp16{}", gpu)),
            Capability::Cudnn => Some(format!("backend=cudnn{}", gpu)),
            Capability::Dx12 => Some(format!("check(freq=1e-5,atol=5e-1,dx12{})", gpu)),
            Capability::OpenCl => Some(format!("backend=opencl{}", gpu)),
            Capability::Blas => None,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Backends declared by the engine binary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    present: BTreeSet<Capability>,
}

impl Capabilities {
    /// Parse the engine's `--help` output
    pub fn from_help(output: &str) -> Self {
        let mut present = BTreeSet::new();
        if output.contains("blas") {
            present.insert(Capability::Blas);
        }
        if output.contains("dx12") {
            present.insert(Capability::Dx12);
        }
        let has_fp16 = output.contains("cudnn-fp16");
        if has_fp16 {
            present.insert(Capability::CudnnFp16);
        }
        // "cudnn-fp16" alone also contains "cudnn"; plain cudnn needs a
        // second mention.
        let cudnn_mentions = output.matches("cudnn").count();
        if cudnn_mentions > 0 && !(has_fp16 && cudnn_mentions == 1) {
            present.insert(Capability::Cudnn);
        }
        if output.contains("opencl") {
            present.insert(Capability::OpenCl);
        }
        Self { present }
    }

    pub fn with(capabilities: &[Capability]) -> Self {
        Self {
            present: capabilities.iter().copied().collect(),
        }
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.present.contains(&capability)
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.present.iter().copied()
    }
}

/// Backend configuration used for one engine launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendChoice {
    /// Operator string, passed verbatim
    Override(String),
    /// Best surviving probed backend
    Capability(Capability),
    /// Nothing probed; the engine picks its own default
    EngineDefault,
}

impl BackendChoice {
    /// Capability this launch could revoke if the engine rejects it
    pub fn revocable(&self) -> Option<Capability> {
        match self {
            BackendChoice::Capability(c) if c.is_revocable() => Some(*c),
            _ => None,
        }
    }
}

/// Reject operator backend strings containing disallowed tokens
pub fn validate_override(opts: &str) -> WorkerResult<()> {
    let is_separator = |c: char| matches!(c, ',' | '=' | '(' | ')' | '.') || c.is_ascii_digit();
    for token in opts.split(is_separator) {
        if DISALLOWED_OVERRIDE_TOKENS.contains(&token) {
            return Err(WorkerError::EngineRejected(format!(
                "Not accepted in --backend-opts: {}",
                token
            )));
        }
    }
    Ok(())
}

/// Process-wide backend state, owned by the task loop and lent to one task
/// attempt at a time
#[derive(Debug, Clone)]
pub struct BackendState {
    capabilities: Capabilities,
    revoked: BTreeSet<Capability>,
    verified: BTreeSet<Capability>,
    override_opts: Option<String>,
    gpu: Option<u32>,
    sanity_checked: Option<PathBuf>,
}

impl BackendState {
    /// Create the state from probed capabilities and operator settings
    pub fn new(
        capabilities: Capabilities,
        override_opts: Option<String>,
        gpu: Option<u32>,
    ) -> WorkerResult<Self> {
        let override_opts = override_opts.filter(|o| !o.is_empty());
        if let Some(opts) = &override_opts {
            validate_override(opts)?;
        }
        Ok(Self {
            capabilities,
            revoked: BTreeSet::new(),
            verified: BTreeSet::new(),
            override_opts,
            gpu,
            sanity_checked: None,
        })
    }

    /// Run `<engine> --help` and record the advertised backends
    pub async fn probe(engine: &Path) -> WorkerResult<Capabilities> {
        info!("Probing engine backends: {}", engine.display());
        let output = Command::new(engine).arg("--help").output().await?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        let capabilities = Capabilities::from_help(&text);

        let names: Vec<&str> = capabilities.iter().map(|c| c.name()).collect();
        info!("Engine backends available: {:?}", names);
        Ok(capabilities)
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn has_override(&self) -> bool {
        self.override_opts.is_some()
    }

    pub fn gpu(&self) -> Option<u32> {
        self.gpu
    }

    /// Backend for the next launch
    pub fn choose(&self) -> BackendChoice {
        if let Some(opts) = &self.override_opts {
            return BackendChoice::Override(opts.clone());
        }
        Capability::PREFERENCE
            .iter()
            .copied()
            .find(|c| self.capabilities.contains(*c) && !self.revoked.contains(c))
            .map(BackendChoice::Capability)
            .unwrap_or(BackendChoice::EngineDefault)
    }

    /// Choose a backend and render its `--backend-opts=` argument
    pub fn choose_args(&self) -> (BackendChoice, Option<String>) {
        let choice = self.choose();
        let arg = match &choice {
            BackendChoice::Override(opts) => Some(opts.clone()),
            BackendChoice::Capability(c) => c.backend_opts(self.gpu),
            BackendChoice::EngineDefault => None,
        }
        .map(|opts| format!("--backend-opts={}", opts));
        (choice, arg)
    }

    /// Whether any surviving backend is fast enough for match play
    pub fn has_gpu_backend(&self) -> bool {
        self.capabilities
            .iter()
            .any(|c| c.is_gpu() && !self.revoked.contains(&c))
    }

    pub fn is_revoked(&self, capability: Capability) -> bool {
        self.revoked.contains(&capability)
    }

    pub fn is_verified(&self, capability: Capability) -> bool {
        self.verified.contains(&capability)
    }

    /// Record that the engine produced work on `capability`
    pub fn mark_verified(&mut self, capability: Capability) {
        if self.verified.insert(capability) {
            debug!("Backend {} verified", capability);
        }
    }

    /// Withdraw `capability` for the rest of the process.
    /// Returns false when revocation does not apply.
    pub fn revoke(&mut self, capability: Capability) -> bool {
        if self.override_opts.is_some() || !capability.is_revocable() {
            return false;
        }
        if self.revoked.insert(capability) {
            warn!("Backend {} revoked for this process", capability);
        }
        true
    }

    /// The engine reported it cannot run the chosen backend
    pub fn on_incompatible(&mut self, choice: &BackendChoice) -> WorkerError {
        match choice.revocable() {
            Some(capability) if self.revoke(capability) => {
                WorkerError::RetryWithFallback { capability }
            }
            _ => WorkerError::EngineRejected(
                "GPU doesn't support the requested backend".to_string(),
            ),
        }
    }

    /// The engine's output closed before any activity. Revokes and returns
    /// the fallback error when the launch was an unverified revocable backend.
    pub fn on_silent_exit(
        &mut self,
        choice: &BackendChoice,
        activity_seen: bool,
    ) -> Option<WorkerError> {
        let capability = choice.revocable()?;
        if activity_seen || self.is_verified(capability) {
            return None;
        }
        warn!("GPU probably doesn't support the {} backend", capability);
        if self.revoke(capability) {
            Some(WorkerError::RetryWithFallback { capability })
        } else {
            None
        }
    }

    /// Whether a dx12 launch with `weights` still needs its self check
    pub fn needs_sanity_check(&self, weights: &Path) -> bool {
        self.choose() == BackendChoice::Capability(Capability::Dx12)
            && self.sanity_checked.as_deref() != Some(weights)
    }

    /// Run the engine's backend self check once per network when dx12 is the
    /// chosen backend
    pub async fn ensure_sanity_checked(&mut self, engine: &Path, weights: &Path) -> WorkerResult<()> {
        if !self.needs_sanity_check(weights) {
            return Ok(());
        }
        if !self.capabilities.contains(Capability::Blas) {
            return Err(WorkerError::EngineRejected(
                "Dx12 backend cannot be validated without blas".to_string(),
            ));
        }

        info!("Sanity checking the dx12 driver");
        let gpu = self.gpu.map(|g| format!(",gpu={}", g)).unwrap_or_default();
        let output = Command::new(engine)
            .arg("benchmark")
            .arg("-w")
            .arg(weights)
            .arg("--backend=check")
            .arg(format!("--backend-opts=mode=check,freq=1.0,atol=5e-1,dx12{}", gpu))
            .arg(format!("--fen={}", STARTPOS_FEN))
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stdout.contains(SELF_CHECK_FAILED) || stderr.contains(SELF_CHECK_FAILED) {
            return Err(WorkerError::EngineRejected(
                "The dx12 backend failed the self check - try updating gpu drivers".to_string(),
            ));
        }

        info!("The dx12 driver passed the initial sanity check");
        self.sanity_checked = Some(weights.to_path_buf());
        Ok(())
    }
}
