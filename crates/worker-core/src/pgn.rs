//! Game notation for uploads.
//!
//! The engine reports a game as a list of long-algebraic moves, optionally
//! followed by `from_fen` and the six FEN fields of the starting position.
//! `PgnBuilder` turns that into the PGN text the server stores.

use chrono::Utc;

use crate::types::GameOutcome;

/// Marker preceding the starting position in a gameready move list
const FROM_FEN: &str = "from_fen";

/// Number of space-separated fields in a FEN string
const FEN_FIELDS: usize = 6;

/// Renders engine move lists as PGN
pub trait PgnBuilder: Send + Sync {
    fn build(&self, moves: &[String], outcome: Option<GameOutcome>, start_ply: i32) -> String;
}

/// Minimal writer that keeps moves in the engine's long-algebraic form
#[derive(Debug, Clone, Copy, Default)]
pub struct LongAlgebraicPgn;

/// Split a trailing `from_fen <6 fields>` off the move list
pub fn split_start_position(moves: &[String]) -> (&[String], Option<String>) {
    let n = moves.len();
    if n > FEN_FIELDS && moves[n - FEN_FIELDS - 1] == FROM_FEN {
        let fen = moves[n - FEN_FIELDS..].join(" ");
        (&moves[..n - FEN_FIELDS - 1], Some(fen))
    } else {
        (moves, None)
    }
}

/// Side to move and full move number encoded in a FEN
fn fen_move_counter(fen: &str) -> (bool, u32) {
    let fields: Vec<&str> = fen.split(' ').collect();
    let black_to_move = fields.get(1).is_some_and(|s| *s == "b");
    let fullmove = fields
        .get(5)
        .and_then(|s| s.parse().ok())
        .filter(|n| *n > 0)
        .unwrap_or(1);
    (black_to_move, fullmove)
}

impl PgnBuilder for LongAlgebraicPgn {
    fn build(&self, moves: &[String], outcome: Option<GameOutcome>, start_ply: i32) -> String {
        let (moves, fen) = split_start_position(moves);
        let result = outcome.map(|o| o.pgn_token()).unwrap_or("*");

        let mut out = String::new();
        out.push_str(&format!("[Date \"{}\"]\n", Utc::now().format("%Y.%m.%d")));
        out.push_str(&format!("[Result \"{}\"]\n", result));
        if let Some(fen) = &fen {
            out.push_str("[SetUp \"1\"]\n");
            out.push_str(&format!("[FEN \"{}\"]\n", fen));
        }
        out.push('\n');

        let (mut black_to_move, mut number) = fen.as_deref().map(fen_move_counter).unwrap_or((false, 1));
        let mut body = Vec::with_capacity(moves.len() + 2);
        for (i, mv) in moves.iter().enumerate() {
            if !black_to_move {
                body.push(format!("{}. {}", number, mv));
            } else if i == 0 {
                body.push(format!("{}... {}", number, mv));
            } else {
                body.push(mv.clone());
            }
            if black_to_move {
                number += 1;
            }
            black_to_move = !black_to_move;
        }
        body.push(result.to_string());

        out.push_str(&body.join(" "));
        out.push_str(&format!(" {{OL: {}}}", start_ply));
        out
    }
}
