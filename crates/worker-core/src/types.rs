//! ============================================================================
//! Core Types for the Grid Worker
//! ============================================================================
//! Tasks assigned by the server, finished games reported back, and the
//! client metadata attached to every request.
//! ============================================================================

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{WorkerError, WorkerResult};

/// Client protocol version reported to the server
pub const CLIENT_VERSION: &str = "26";

/// Resign false-positive threshold value meaning "not reported"
pub const FP_THRESHOLD_UNSET: f64 = -1.0;

// ============================================================================
// Server Wire Types
// ============================================================================

/// Raw `next_game` response as the server encodes it
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct NextGameResponse {
    #[serde(rename = "Type")]
    pub kind: String,
    pub training_id: u64,
    pub network_id: u64,
    pub sha: String,
    pub candidate_sha: String,
    /// JSON-encoded list of engine arguments
    pub params: String,
    pub flip: bool,
    pub match_game_id: u64,
    pub keep_time: String,
    pub book_url: String,
    pub book_sha: String,
}

// ============================================================================
// Task
// ============================================================================

/// Kind of work the server assigned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Autonomous self-play producing training data
    Train,
    /// Head-to-head evaluation of a candidate against the primary network
    Match,
}

impl TaskKind {
    pub fn parse(s: &str) -> WorkerResult<Self> {
        match s {
            "train" => Ok(TaskKind::Train),
            "match" => Ok(TaskKind::Match),
            other => Err(WorkerError::UnknownTaskKind(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Train => "train",
            TaskKind::Match => "match",
        }
    }
}

/// One server-assigned unit of work
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub kind: TaskKind,
    pub training_id: u64,
    pub network_id: u64,
    /// Content hash of the primary network
    pub primary: String,
    /// Content hash of the candidate network (always set for match tasks)
    pub candidate: Option<String>,
    /// Engine arguments chosen by the server
    pub params: Vec<String>,
    /// Retention window hint for training assets (e.g. "4h", "inf")
    pub keep_time: Option<String>,
    /// Match only: candidate plays the flipped color in this slot
    pub flip: bool,
    /// Match only: server slot this game result belongs to
    pub match_game_id: u64,
    pub book_url: Option<String>,
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

impl Task {
    /// Build a task from the server response, decoding the params list
    pub fn from_response(resp: NextGameResponse) -> WorkerResult<Self> {
        let kind = TaskKind::parse(&resp.kind)?;
        let params: Vec<String> = if resp.params.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&resp.params)?
        };

        Ok(Self {
            kind,
            training_id: resp.training_id,
            network_id: resp.network_id,
            primary: resp.sha,
            candidate: non_empty(resp.candidate_sha),
            params,
            keep_time: non_empty(resp.keep_time),
            flip: resp.flip,
            match_game_id: resp.match_game_id,
            book_url: non_empty(resp.book_url),
        })
    }

    /// Same kind and same networks: a new slot of the same match
    pub fn same_match(&self, other: &Task) -> bool {
        self.kind == other.kind
            && self.primary == other.primary
            && self.candidate == other.candidate
    }

    /// Same kind and same primary network: training can continue
    pub fn same_training(&self, other: &Task) -> bool {
        self.kind == other.kind && self.primary == other.primary
    }
}

// ============================================================================
// Games
// ============================================================================

/// Side to move / side played
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Color {
    White,
    Black,
}

impl Color {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "white" => Some(Color::White),
            "black" => Some(Color::Black),
            _ => None,
        }
    }
}

/// Terminal result of a game as the engine reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameOutcome {
    WhiteWon,
    BlackWon,
    Draw,
}

impl GameOutcome {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "whitewon" => Some(GameOutcome::WhiteWon),
            "blackwon" => Some(GameOutcome::BlackWon),
            "draw" => Some(GameOutcome::Draw),
            _ => None,
        }
    }

    /// +1 white win, -1 black win, 0 draw
    pub fn score(&self) -> i32 {
        match self {
            GameOutcome::WhiteWon => 1,
            GameOutcome::BlackWon => -1,
            GameOutcome::Draw => 0,
        }
    }

    pub fn pgn_token(&self) -> &'static str {
        match self {
            GameOutcome::WhiteWon => "1-0",
            GameOutcome::BlackWon => "0-1",
            GameOutcome::Draw => "1/2-1/2",
        }
    }
}

/// A completed game ready for upload
#[derive(Debug, Clone, PartialEq)]
pub struct GameRecord {
    pub pgn: String,
    /// Training data file written by the engine
    pub training_file: PathBuf,
    /// Resign false-positive threshold, `FP_THRESHOLD_UNSET` when absent
    pub fp_threshold: f64,
    /// Color played by player1 (the candidate in match mode)
    pub player1: Option<Color>,
    pub outcome: Option<GameOutcome>,
    pub start_ply: i32,
}

impl GameRecord {
    pub fn has_fp_threshold(&self) -> bool {
        self.fp_threshold >= 0.0
    }

    /// Result from player1's fixed perspective given the slot's flip flag
    pub fn signed_result(&self, flip: bool) -> i32 {
        let raw = self.outcome.map(|o| o.score()).unwrap_or(0);
        if flip {
            -raw
        } else {
            raw
        }
    }
}

// ============================================================================
// Client Metadata
// ============================================================================

/// Identity and host details attached to every server request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMeta {
    pub user: String,
    pub password: String,
    /// Run id in the high bits, random low 16 bits
    pub token: i64,
    pub train_only: bool,
    pub hostname: String,
    pub gpu: String,
    pub gpu_id: i64,
}

impl ClientMeta {
    /// Form fields in the order the server documents them
    pub fn form_fields(&self) -> Vec<(String, String)> {
        vec![
            ("user".into(), self.user.clone()),
            ("password".into(), self.password.clone()),
            ("version".into(), CLIENT_VERSION.into()),
            ("token".into(), self.token.to_string()),
            ("train_only".into(), self.train_only.to_string()),
            ("hostname".into(), self.hostname.clone()),
            ("gpu".into(), self.gpu.clone()),
            ("gpu_id".into(), self.gpu_id.to_string()),
        ]
    }
}

/// Token combining the run id with 16 random bits
pub fn client_token(run_id: u32) -> i64 {
    let random: u16 = rand::random();
    (i64::from(run_id) << 16) | i64::from(random)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(kind: &str) -> NextGameResponse {
        NextGameResponse {
            kind: kind.into(),
            training_id: 3,
            network_id: 42,
            sha: "aa".into(),
            candidate_sha: "bb".into(),
            params: r#"["--visits=100","--cpuct=2.0"]"#.into(),
            flip: true,
            match_game_id: 7,
            ..Default::default()
        }
    }

    #[test]
    fn test_task_from_response_decodes_params() {
        let task = Task::from_response(response("match")).unwrap();
        assert_eq!(task.kind, TaskKind::Match);
        assert_eq!(task.params, vec!["--visits=100", "--cpuct=2.0"]);
        assert_eq!(task.candidate.as_deref(), Some("bb"));
        assert!(task.keep_time.is_none());
        assert!(task.book_url.is_none());
    }

    #[test]
    fn test_task_from_response_rejects_unknown_kind() {
        let err = Task::from_response(response("tune")).unwrap_err();
        assert!(matches!(err, WorkerError::UnknownTaskKind(k) if k == "tune"));
    }

    #[test]
    fn test_response_deserializes_server_field_names() {
        let json = r#"{"Type":"train","TrainingId":1,"NetworkId":2,"Sha":"abc","Params":"[]","KeepTime":"4h"}"#;
        let resp: NextGameResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.kind, "train");
        assert_eq!(resp.sha, "abc");
        assert_eq!(resp.keep_time, "4h");
        assert!(!resp.flip);
    }

    #[test]
    fn test_same_match_and_training() {
        let a = Task::from_response(response("match")).unwrap();
        let mut b = a.clone();
        b.match_game_id = 8;
        assert!(a.same_match(&b));
        b.candidate = Some("cc".into());
        assert!(!a.same_match(&b));
        assert!(a.same_training(&b));
    }

    #[test]
    fn test_signed_result_negates_when_flipped() {
        let game = GameRecord {
            pgn: String::new(),
            training_file: PathBuf::from("/tmp/x"),
            fp_threshold: FP_THRESHOLD_UNSET,
            player1: Some(Color::Black),
            outcome: Some(GameOutcome::WhiteWon),
            start_ply: 0,
        };
        assert_eq!(game.signed_result(false), 1);
        assert_eq!(game.signed_result(true), -1);
        assert!(!game.has_fp_threshold());
    }

    #[test]
    fn test_client_token_keeps_run_id() {
        let token = client_token(5);
        assert_eq!(token >> 16, 5);
    }
}
