//! One running engine process and the task that reads its output.

use std::io::BufRead;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::args::LaunchArgs;
use super::protocol::{Decoded, EngineEvent, GameAssembler};
use crate::backend::FP16_MIN_COMPUTE_CAPABILITY;
use crate::error::{WorkerError, WorkerResult};
use crate::pgn::PgnBuilder;
use crate::types::GameRecord;

/// Completed games buffered between the reader and the orchestrator
const GAME_CHANNEL_CAPACITY: usize = 16;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Launched,
    Streaming,
    Exited,
    Killed,
}

/// Conditions that abort the current launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetrySignal {
    /// The chosen backend cannot run on this GPU
    BackendIncompatible,
    /// The engine does not understand its arguments
    UnknownFlag(String),
    /// The backend self check failed
    SelfCheckFailed,
}

/// Receiving ends of the session channels. All of them close exactly once,
/// when the merged output stream reaches EOF.
#[derive(Debug)]
pub struct SessionEvents {
    pub best_moves: mpsc::UnboundedReceiver<String>,
    pub games: mpsc::Receiver<GameRecord>,
    pub retry: mpsc::UnboundedReceiver<RetrySignal>,
}

/// Facts learned from the output, shared with the reader task
#[derive(Debug)]
pub struct SessionInfo {
    version: watch::Sender<Option<String>>,
    device: watch::Sender<Option<String>>,
    streaming: AtomicBool,
    activity: AtomicBool,
}

impl Default for SessionInfo {
    fn default() -> Self {
        Self {
            version: watch::Sender::new(None),
            device: watch::Sender::new(None),
            streaming: AtomicBool::new(false),
            activity: AtomicBool::new(false),
        }
    }
}

impl SessionInfo {
    /// Engine version from the `id name` banner
    pub fn version(&self) -> Option<String> {
        self.version.borrow().clone()
    }

    /// Last GPU/device name the engine reported
    pub fn device(&self) -> Option<String> {
        self.device.borrow().clone()
    }

    /// Whether the engine proved its backend works: a best move, search
    /// info, a game, or a compute capability that supports half precision
    pub fn activity_seen(&self) -> bool {
        self.activity.load(Ordering::SeqCst)
    }

    fn mark_activity(&self) {
        self.activity.store(true, Ordering::SeqCst);
    }
}

struct Senders {
    best_moves: mpsc::UnboundedSender<String>,
    games: mpsc::Sender<GameRecord>,
    retry: mpsc::UnboundedSender<RetrySignal>,
}

/// A launched engine subprocess
pub struct EngineSession {
    child: Child,
    stdin: Option<ChildStdin>,
    events: Option<SessionEvents>,
    info: Arc<SessionInfo>,
    reader: Option<JoinHandle<()>>,
    finished: Option<SessionState>,
}

impl EngineSession {
    /// Spawn the engine and start reading its output
    pub fn launch(engine: &Path, launch: &LaunchArgs, pgn: Arc<dyn PgnBuilder>) -> WorkerResult<Self> {
        let args = launch.to_args();
        info!("Launching engine: {} {}", engine.display(), args.join(" "));

        // stdout and stderr share one pipe so lines keep the engine's order
        let (output, writer) = os_pipe::pipe()?;
        let mut cmd = Command::new(engine);
        cmd.args(&args)
            .stdout(writer.try_clone()?)
            .stderr(writer)
            .kill_on_drop(true);
        if launch.mode.is_interactive() {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }

        let mut child = cmd.spawn()?;
        // The command holds our copies of the write end until dropped
        drop(cmd);
        let stdin = child.stdin.take();

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        tokio::task::spawn_blocking(move || forward_lines(output, line_tx));

        let (best_tx, best_rx) = mpsc::unbounded_channel();
        let (games_tx, games_rx) = mpsc::channel(GAME_CHANNEL_CAPACITY);
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let info = Arc::new(SessionInfo::default());

        let reader = tokio::spawn(read_output(
            line_rx,
            GameAssembler::new(pgn),
            Senders {
                best_moves: best_tx,
                games: games_tx,
                retry: retry_tx,
            },
            info.clone(),
        ));

        Ok(Self {
            child,
            stdin,
            events: Some(SessionEvents {
                best_moves: best_rx,
                games: games_rx,
                retry: retry_rx,
            }),
            info,
            reader: Some(reader),
            finished: None,
        })
    }

    pub fn state(&self) -> SessionState {
        match self.finished {
            Some(state) => state,
            None if self.info.streaming.load(Ordering::SeqCst) => SessionState::Streaming,
            None => SessionState::Launched,
        }
    }

    pub fn info(&self) -> Arc<SessionInfo> {
        self.info.clone()
    }

    /// Hand the channels to an orchestrator. Returns None if already taken.
    pub fn take_events(&mut self) -> Option<SessionEvents> {
        self.events.take()
    }

    // ========================================================================
    // Commands (interactive mode)
    // ========================================================================

    pub async fn send_command(&mut self, command: &str) -> WorkerResult<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            WorkerError::EngineRejected("engine was not launched in interactive mode".to_string())
        })?;
        debug!("engine <- {}", command);
        stdin.write_all(command.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    pub async fn position(&mut self, moves: &[String]) -> WorkerResult<()> {
        let mut command = String::from("position startpos");
        if !moves.is_empty() {
            command.push_str(" moves ");
            command.push_str(&moves.join(" "));
        }
        self.send_command(&command).await
    }

    pub async fn go(&mut self, nodes: u64) -> WorkerResult<()> {
        self.send_command(&format!("go nodes {}", nodes)).await
    }

    /// Wait for the next best move. Expiry is a hard failure.
    pub async fn wait_best_move(&mut self, timeout: Duration) -> WorkerResult<String> {
        let events = self.events.as_mut().ok_or_else(|| {
            WorkerError::EngineRejected("session channels were handed off".to_string())
        })?;
        match tokio::time::timeout(timeout, events.best_moves.recv()).await {
            Ok(Some(mv)) => Ok(mv),
            Ok(None) => Err(WorkerError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "engine output closed before a best move",
            ))),
            Err(_) => Err(WorkerError::Timeout(timeout)),
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Signal the process and wait for it to exit
    pub async fn kill(&mut self) -> WorkerResult<()> {
        if self.finished.is_some() {
            return Ok(());
        }
        self.stdin.take();
        if let Err(e) = self.child.start_kill() {
            // Already reaped
            if e.kind() != std::io::ErrorKind::InvalidInput {
                return Err(e.into());
            }
        }
        let status = self.child.wait().await?;
        debug!("Engine killed ({})", status);
        self.finished = Some(SessionState::Killed);
        Ok(())
    }

    /// Wait for the process to exit on its own
    pub async fn wait(&mut self) -> WorkerResult<ExitStatus> {
        self.stdin.take();
        let status = self.child.wait().await?;
        if self.finished.is_none() {
            self.finished = Some(SessionState::Exited);
        }
        Ok(status)
    }

    /// Wait until the reader has drained the output
    pub async fn join_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            if let Err(e) = reader.await {
                warn!("Engine reader task failed: {}", e);
            }
        }
    }
}

/// Blocking half of the reader: split the merged output into lines
fn forward_lines(output: os_pipe::PipeReader, lines: mpsc::UnboundedSender<String>) {
    let mut output = std::io::BufReader::new(output);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match output.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(|c: char| c == '\n' || c == '\r');
                if lines.send(line.to_string()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Error reading engine output: {}", e);
                break;
            }
        }
    }
}

async fn read_output(
    mut lines: mpsc::UnboundedReceiver<String>,
    mut assembler: GameAssembler,
    senders: Senders,
    info: Arc<SessionInfo>,
) {
    while let Some(line) = lines.recv().await {
        handle_line(&line, &mut assembler, &senders, &info).await;
    }
    debug!("Engine output closed");
}

async fn handle_line(line: &str, assembler: &mut GameAssembler, senders: &Senders, info: &SessionInfo) {
    info.streaming.store(true, Ordering::SeqCst);

    let decoded = match assembler.decode(line) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!("{}", e);
            return;
        }
    };

    let event = match decoded {
        Decoded::Game(record) => {
            info.mark_activity();
            info!("Game ready: {}", record.training_file.display());
            if senders.games.send(record).await.is_err() {
                debug!("Game receiver dropped, discarding game");
            }
            return;
        }
        Decoded::Event(event) => event,
    };

    match event {
        EngineEvent::BestMove(mv) => {
            info.mark_activity();
            let _ = senders.best_moves.send(mv);
        }
        EngineEvent::SearchInfo => info.mark_activity(),
        EngineEvent::ComputeCapability(cc) => {
            if cc >= FP16_MIN_COMPUTE_CAPABILITY {
                info.mark_activity();
            }
            info!("{}", line);
        }
        EngineEvent::BackendIncompatible => {
            warn!("GPU doesn't support the requested backend");
            let _ = senders.retry.send(RetrySignal::BackendIncompatible);
        }
        EngineEvent::UnknownFlag(flag) => {
            error!("{} (the engine is probably too old)", flag);
            let _ = senders.retry.send(RetrySignal::UnknownFlag(flag));
        }
        EngineEvent::SelfCheckFailed => {
            error!("{}", line);
            let _ = senders.retry.send(RetrySignal::SelfCheckFailed);
        }
        EngineEvent::VersionAnnounce(version) => {
            info!("{}", line);
            info.version.send_replace(Some(version));
        }
        EngineEvent::DeviceReport(device) => {
            info!("{}", line);
            info.device.send_replace(Some(device));
        }
        EngineEvent::ResignReport(_) => info!("{}", line),
        EngineEvent::Diagnostic(_) | EngineEvent::GameReady(_) => debug!("engine: {}", line),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::engine::args::{EngineMode, Weights};
    use crate::engine::test_support::fake_engine;
    use crate::pgn::LongAlgebraicPgn;

    fn launch(engine: &Path, mode: EngineMode) -> EngineSession {
        let args = LaunchArgs::new(mode, Weights::Single("/nets/aa".into()));
        EngineSession::launch(engine, &args, Arc::new(LongAlgebraicPgn)).unwrap()
    }

    #[tokio::test]
    async fn test_selfplay_games_and_channel_close() {
        let dir = tempfile::tempdir().unwrap();
        let engine = fake_engine(
            dir.path(),
            r#"echo "id name Lc0 v0.31.0"
echo "GPU: Fake Accelerator" 1>&2
echo "resign_report fp_threshold 0.25"
echo "gameready trainingfile /tmp/t/g1.gz gameid 1 player1 white result draw moves e2e4 e7e5"
echo "garbage gameready" 1>&2
echo "gameready trainingfile /tmp/t/g2.gz gameid 2 player1 black result blackwon moves d2d4"
"#,
        );

        let mut session = launch(&engine, EngineMode::Selfplay);
        let mut events = session.take_events().unwrap();
        assert!(session.take_events().is_none());

        let mut games = Vec::new();
        while let Some(game) = events.games.recv().await {
            games.push(game);
        }
        assert!(events.best_moves.recv().await.is_none());
        assert!(events.retry.recv().await.is_none());

        assert_eq!(games.len(), 2);
        assert_eq!(games[0].fp_threshold, 0.25);
        assert_eq!(games[1].fp_threshold, -1.0);

        session.wait().await.unwrap();
        session.join_reader().await;
        assert_eq!(session.state(), SessionState::Exited);

        let info = session.info();
        assert!(info.activity_seen());
        assert_eq!(info.version().as_deref(), Some("v0.31.0"));
        assert_eq!(info.device().as_deref(), Some("Fake Accelerator"));
    }

    #[tokio::test]
    async fn test_stderr_and_stdout_keep_emission_order() {
        let dir = tempfile::tempdir().unwrap();
        let engine = fake_engine(
            dir.path(),
            r#"i=1
while [ $i -le 40 ]; do
  echo "resign_report fp_threshold 0.$i" 1>&2
  echo "gameready trainingfile /tmp/t/g$i.gz gameid $i player1 white result draw moves e2e4"
  i=$((i + 1))
done
"#,
        );

        let mut session = launch(&engine, EngineMode::Selfplay);
        let mut events = session.take_events().unwrap();
        let mut games = Vec::new();
        while let Some(game) = events.games.recv().await {
            games.push(game);
        }
        session.wait().await.unwrap();
        session.join_reader().await;

        assert_eq!(games.len(), 40);
        for (i, game) in games.iter().enumerate() {
            let expected: f64 = format!("0.{}", i + 1).parse().unwrap();
            assert_eq!(game.fp_threshold, expected, "game {}", i + 1);
            assert_eq!(
                game.training_file,
                std::path::PathBuf::from(format!("/tmp/t/g{}.gz", i + 1))
            );
        }
    }

    #[tokio::test]
    async fn test_uci_best_move_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let engine = fake_engine(
            dir.path(),
            r#"while read line; do
  case "$line" in
    go*) echo "info depth 1"; echo "bestmove e2e4 ponder e7e5" ;;
    quit) exit 0 ;;
  esac
done
"#,
        );

        let mut session = launch(&engine, EngineMode::Uci);
        session.position(&["d2d4".to_string()]).await.unwrap();
        session.go(100).await.unwrap();
        let mv = session.wait_best_move(Duration::from_secs(10)).await.unwrap();
        assert_eq!(mv, "e2e4");
        assert_eq!(session.state(), SessionState::Streaming);

        session.send_command("quit").await.unwrap();
        session.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_best_move_timeout_then_kill() {
        let dir = tempfile::tempdir().unwrap();
        let engine = fake_engine(dir.path(), "while read line; do :; done\n");

        let mut session = launch(&engine, EngineMode::Uci);
        session.go(1).await.unwrap();
        let err = session
            .wait_best_move(Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Timeout(_)));

        session.kill().await.unwrap();
        assert_eq!(session.state(), SessionState::Killed);
        let mut events = session.take_events().unwrap();
        assert!(events.games.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_incompatible_backend_signals_retry() {
        let dir = tempfile::tempdir().unwrap();
        let engine = fake_engine(
            dir.path(),
            "echo \"GPU compute capability: 6.1\"\necho \"Error: Your GPU doesn't support FP16\" 1>&2\n",
        );

        let mut session = launch(&engine, EngineMode::Selfplay);
        let mut events = session.take_events().unwrap();
        assert_eq!(events.retry.recv().await, Some(RetrySignal::BackendIncompatible));
        assert!(events.games.recv().await.is_none());
        assert!(!session.info().activity_seen());
    }

    #[tokio::test]
    async fn test_commands_rejected_without_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let engine = fake_engine(dir.path(), "exit 0\n");
        let mut session = launch(&engine, EngineMode::Selfplay);
        assert!(matches!(
            session.go(1).await,
            Err(WorkerError::EngineRejected(_))
        ));
        session.kill().await.unwrap();
    }
}
