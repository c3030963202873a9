//! Engine command line, assembled in a fixed order.

use std::path::PathBuf;

/// Engine run mode, always the first argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    Selfplay,
    Uci,
}

impl EngineMode {
    pub fn token(&self) -> &'static str {
        match self {
            EngineMode::Selfplay => "selfplay",
            EngineMode::Uci => "uci",
        }
    }

    /// Modes that read commands from stdin
    pub fn is_interactive(&self) -> bool {
        matches!(self, EngineMode::Uci)
    }
}

/// Network files handed to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Weights {
    Single(PathBuf),
    /// player1 plays `player1`, player2 plays `player2`, trees not shared
    Pair { player1: PathBuf, player2: PathBuf },
}

/// Everything that goes on the engine command line
#[derive(Debug, Clone)]
pub struct LaunchArgs {
    pub mode: EngineMode,
    /// Operator-supplied engine arguments
    pub extra: Vec<String>,
    /// Rendered `--backend-opts=...` flag, if any
    pub backend_opts: Option<String>,
    pub parallelism: Option<u32>,
    /// Server-chosen arguments
    pub params: Vec<String>,
    pub weights: Weights,
}

impl LaunchArgs {
    pub fn new(mode: EngineMode, weights: Weights) -> Self {
        Self {
            mode,
            extra: Vec::new(),
            backend_opts: None,
            parallelism: None,
            params: Vec::new(),
            weights,
        }
    }

    /// Render the argument vector (program name excluded)
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![self.mode.token().to_string()];
        if self.mode != EngineMode::Selfplay {
            args.push("--backend=multiplexing".to_string());
        }
        args.extend(self.extra.iter().cloned());
        if let Some(opts) = &self.backend_opts {
            args.push(opts.clone());
        }
        if let (Some(n), EngineMode::Selfplay) = (self.parallelism, self.mode) {
            args.push(format!("--parallelism={}", n));
        }
        args.extend(self.params.iter().cloned());
        match &self.weights {
            Weights::Single(path) => {
                args.push(format!("--weights={}", path.display()));
            }
            Weights::Pair { player1, player2 } => {
                args.push(format!("--player1.weights={}", player1.display()));
                args.push(format!("--player2.weights={}", player2.display()));
                args.push("--no-share-trees".to_string());
            }
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selfplay_order() {
        let mut launch = LaunchArgs::new(EngineMode::Selfplay, Weights::Single("/c/aa".into()));
        launch.extra = vec!["--threads=2".into()];
        launch.backend_opts = Some("--backend-opts=backend=cudnn".into());
        launch.parallelism = Some(16);
        launch.params = vec!["--visits=10".into(), "--training=true".into()];

        assert_eq!(
            launch.to_args(),
            vec![
                "selfplay",
                "--threads=2",
                "--backend-opts=backend=cudnn",
                "--parallelism=16",
                "--visits=10",
                "--training=true",
                "--weights=/c/aa",
            ]
        );
    }

    #[test]
    fn test_uci_uses_multiplexing_and_no_parallelism() {
        let mut launch = LaunchArgs::new(EngineMode::Uci, Weights::Single("/c/aa".into()));
        launch.parallelism = Some(8);
        assert_eq!(
            launch.to_args(),
            vec!["uci", "--backend=multiplexing", "--weights=/c/aa"]
        );
    }

    #[test]
    fn test_pair_weights() {
        let launch = LaunchArgs::new(
            EngineMode::Selfplay,
            Weights::Pair {
                player1: "/c/cand".into(),
                player2: "/c/base".into(),
            },
        );
        assert_eq!(
            launch.to_args(),
            vec![
                "selfplay",
                "--player1.weights=/c/cand",
                "--player2.weights=/c/base",
                "--no-share-trees",
            ]
        );
    }
}
