//! Retention policy for cached assets other than the one being resolved.

use std::time::Duration;

use tracing::warn;

/// Keep-time token meaning "never evict"
pub const KEEP_FOREVER: &str = "inf";

/// Window used for training assets when the server sends no hint.
/// Long enough for a machine serving two runs from one directory.
pub const DEFAULT_TRAINING_WINDOW: Duration = Duration::from_secs(4 * 3600);

/// How long non-current cache entries survive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    Forever,
    Window(Duration),
}

impl Retention {
    /// Parse a server keep-time such as `inf`, `4h`, `90m` or `1h30m`
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s == KEEP_FOREVER {
            return Some(Retention::Forever);
        }
        parse_duration(s).map(Retention::Window)
    }

    /// Policy for a training task's primary network
    pub fn for_training(hint: Option<&str>, keep_everything: bool) -> Self {
        if keep_everything {
            return Retention::Forever;
        }
        match hint {
            None => Retention::Window(DEFAULT_TRAINING_WINDOW),
            Some(h) => Self::parse(h).unwrap_or_else(|| {
                warn!("Unparseable keep time {:?}, using default window", h);
                Retention::Window(DEFAULT_TRAINING_WINDOW)
            }),
        }
    }
}

/// Durations in the server's notation: decimal numbers with unit suffixes
/// (`h`, `m`, `s`, `ms`, `us`, `ns`), concatenated.
pub fn parse_duration(s: &str) -> Option<Duration> {
    if s.is_empty() {
        return None;
    }
    if s == "0" {
        return Some(Duration::ZERO);
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return None;
        }
        let value: f64 = rest[..num_len].parse().ok()?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds_per_unit = match &rest[..unit_len] {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 1e-3,
            "us" | "µs" => 1e-6,
            "ns" => 1e-9,
            _ => return None,
        };
        rest = &rest[unit_len..];
        total += value * seconds_per_unit;
    }

    Some(Duration::from_secs_f64(total))
}
