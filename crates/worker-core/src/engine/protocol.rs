//! Line protocol spoken by the engine on stdout/stderr.
//!
//! Every line is classified by the first matching entry of an ordered rule
//! table. `GameAssembler` adds the only piece of cross-line state: the resign
//! false-positive threshold announced just before a game completes.

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{WorkerError, WorkerResult};
use crate::pgn::PgnBuilder;
use crate::types::{Color, GameOutcome, GameRecord, FP_THRESHOLD_UNSET};

/// Prefix of the engine's version banner
pub const VERSION_PREFIX: &str = "id name Lc0 ";

/// Diagnostic printed when the GPU cannot run half precision
pub const FP16_UNSUPPORTED: &str = "Your GPU doesn't support FP16";

/// A completed game exactly as announced by the engine
#[derive(Debug, Clone, PartialEq)]
pub struct GameReady {
    pub training_file: PathBuf,
    pub moves: Vec<String>,
    pub player1: Option<Color>,
    pub outcome: Option<GameOutcome>,
    pub start_ply: i32,
}

/// One classified line of engine output
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    BestMove(String),
    GameReady(GameReady),
    /// `None` when the report carries no threshold
    ResignReport(Option<f64>),
    BackendIncompatible,
    VersionAnnounce(String),
    SearchInfo,
    ComputeCapability(f32),
    DeviceReport(String),
    SelfCheckFailed,
    UnknownFlag(String),
    Diagnostic(String),
}

// ============================================================================
// Rule Table
// ============================================================================

type Build = fn(&str) -> Result<EngineEvent, String>;

struct Rule {
    matches: fn(&str) -> bool,
    build: Build,
}

const RULES: &[Rule] = &[
    Rule {
        matches: |l| l.starts_with("Unknown command line flag"),
        build: |l| Ok(EngineEvent::UnknownFlag(l.to_string())),
    },
    Rule {
        matches: |l| l.contains(FP16_UNSUPPORTED),
        build: |_| Ok(EngineEvent::BackendIncompatible),
    },
    Rule {
        matches: |l| l.starts_with("resign_report "),
        build: parse_resign_report,
    },
    Rule {
        matches: |l| l.starts_with("gameready "),
        build: |l| parse_gameready(l).map(EngineEvent::GameReady),
    },
    Rule {
        matches: |l| l.starts_with("bestmove "),
        build: |l| {
            l.split(' ')
                .nth(1)
                .filter(|m| !m.is_empty())
                .map(|m| EngineEvent::BestMove(m.to_string()))
                .ok_or_else(|| "bestmove without a move".to_string())
        },
    },
    Rule {
        matches: |l| l.starts_with(VERSION_PREFIX),
        build: |l| {
            l.split(' ')
                .nth(3)
                .map(|v| EngineEvent::VersionAnnounce(v.to_string()))
                .ok_or_else(|| "version banner without a version".to_string())
        },
    },
    Rule {
        matches: |l| l.starts_with("info"),
        build: |_| Ok(EngineEvent::SearchInfo),
    },
    Rule {
        matches: |l| l.starts_with("GPU: "),
        build: |l| Ok(EngineEvent::DeviceReport(l["GPU: ".len()..].to_string())),
    },
    Rule {
        matches: |l| l.starts_with("Selected device: "),
        build: |l| Ok(EngineEvent::DeviceReport(l["Selected device: ".len()..].to_string())),
    },
    Rule {
        matches: |l| l.starts_with("BLAS"),
        build: |_| Ok(EngineEvent::DeviceReport("None".to_string())),
    },
    Rule {
        matches: |l| l.starts_with(crate::backend::SELF_CHECK_FAILED),
        build: |_| Ok(EngineEvent::SelfCheckFailed),
    },
    Rule {
        matches: |l| l.starts_with("GPU compute capability:"),
        build: |l| {
            l.split(' ')
                .nth(3)
                .and_then(|v| v.parse::<f32>().ok())
                .map(EngineEvent::ComputeCapability)
                .ok_or_else(|| "unreadable compute capability".to_string())
        },
    },
];

/// Classify one line of engine output
pub fn parse_line(line: &str) -> WorkerResult<EngineEvent> {
    match RULES.iter().find(|rule| (rule.matches)(line)) {
        Some(rule) => (rule.build)(line).map_err(|reason| WorkerError::ProtocolViolation {
            line: line.to_string(),
            reason,
        }),
        None => Ok(EngineEvent::Diagnostic(line.to_string())),
    }
}

fn parse_resign_report(line: &str) -> Result<EngineEvent, String> {
    let mut fields = line.split(' ');
    if fields.any(|f| f == "fp_threshold") {
        let value = fields.next().ok_or("fp_threshold without a value")?;
        let threshold: f64 = value
            .parse()
            .map_err(|_| format!("unreadable fp_threshold {:?}", value))?;
        Ok(EngineEvent::ResignReport(Some(threshold)))
    } else {
        Ok(EngineEvent::ResignReport(None))
    }
}

/// `gameready trainingfile <path> gameid <n> [play_start_ply <n>] [player1 <color>] [result <r>] moves <m>...`
///
/// The training file path may contain spaces, so fields are located by
/// keyword rather than position.
fn parse_gameready(line: &str) -> Result<GameReady, String> {
    let file_at = line.find(" trainingfile ").ok_or("missing trainingfile")?;
    let id_at = line.rfind(" gameid ").ok_or("missing gameid")?;
    let moves_at = line.rfind(" moves").ok_or("missing moves")?;
    let file_start = file_at + " trainingfile ".len();
    if id_at < file_start || moves_at < id_at {
        return Err("fields out of order".to_string());
    }

    let training_file = PathBuf::from(&line[file_start..id_at]);
    let moves: Vec<String> = line[moves_at + " moves".len()..]
        .split(' ')
        .filter(|m| !m.is_empty())
        .map(String::from)
        .collect();

    // Optional keyword/value pairs between gameid and moves
    let mut player1 = None;
    let mut outcome = None;
    let mut start_ply = -1;
    let mut header = line[id_at..moves_at].split(' ').filter(|t| !t.is_empty());
    while let Some(key) = header.next() {
        match key {
            "player1" => {
                let v = header.next().ok_or("player1 without a value")?;
                player1 = Some(Color::parse(v).ok_or_else(|| format!("unknown color {:?}", v))?);
            }
            "result" => {
                let v = header.next().ok_or("result without a value")?;
                outcome = Some(GameOutcome::parse(v).ok_or_else(|| format!("unknown result {:?}", v))?);
            }
            "play_start_ply" => {
                let v = header.next().ok_or("play_start_ply without a value")?;
                start_ply = v.parse().map_err(|_| format!("unreadable play_start_ply {:?}", v))?;
            }
            _ => {}
        }
    }

    Ok(GameReady {
        training_file,
        moves,
        player1,
        outcome,
        start_ply,
    })
}

// ============================================================================
// Game Assembly
// ============================================================================

/// Output of the assembler for one line
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Event(EngineEvent),
    Game(GameRecord),
}

/// Turns classified lines into complete game records
pub struct GameAssembler {
    pgn: Arc<dyn PgnBuilder>,
    fp_threshold: f64,
}

impl GameAssembler {
    pub fn new(pgn: Arc<dyn PgnBuilder>) -> Self {
        Self {
            pgn,
            fp_threshold: FP_THRESHOLD_UNSET,
        }
    }

    /// Threshold that will be attached to the next game
    pub fn pending_threshold(&self) -> f64 {
        self.fp_threshold
    }

    pub fn decode(&mut self, line: &str) -> WorkerResult<Decoded> {
        let event = match parse_line(line) {
            Ok(event) => event,
            Err(e) => {
                if line.starts_with("resign_report ") {
                    self.fp_threshold = FP_THRESHOLD_UNSET;
                }
                return Err(e);
            }
        };

        match event {
            EngineEvent::ResignReport(Some(threshold)) => {
                self.fp_threshold = threshold;
                Ok(Decoded::Event(EngineEvent::ResignReport(Some(threshold))))
            }
            EngineEvent::GameReady(game) => {
                let pgn = self.pgn.build(&game.moves, game.outcome, game.start_ply);
                let record = GameRecord {
                    pgn,
                    training_file: game.training_file,
                    fp_threshold: self.fp_threshold,
                    player1: game.player1,
                    outcome: game.outcome,
                    start_ply: game.start_ply,
                };
                self.fp_threshold = FP_THRESHOLD_UNSET;
                Ok(Decoded::Game(record))
            }
            other => Ok(Decoded::Event(other)),
        }
    }
}
