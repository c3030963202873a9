//! ============================================================================
//! Engine Module - Subprocess Driver
//! ============================================================================
//! The external compute engine as a child process:
//! - args: deterministic command line for one launch
//! - protocol: ordered line classification and game assembly
//! - session: the process, its reader task and its channels
//! ============================================================================

mod args;
mod protocol;
mod session;

pub use args::{EngineMode, LaunchArgs, Weights};
pub use protocol::{parse_line, Decoded, EngineEvent, GameAssembler, GameReady, VERSION_PREFIX};
pub use session::{EngineSession, RetrySignal, SessionEvents, SessionInfo, SessionState};

#[cfg(all(test, unix))]
pub(crate) mod test_support {
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    /// Write an executable `sh` script standing in for the engine
    pub fn fake_engine(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-engine");
        std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }
}
