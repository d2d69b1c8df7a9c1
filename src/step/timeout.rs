//! Step timeout parsing and budgeting.

use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeoutError {
    #[error("Timeout cannot be empty")]
    Empty,

    #[error("Invalid timeout '{0}': expected units such as 1h30m, 10m, 45s or 500ms")]
    Invalid(String),
}

fn component_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(\d+)(ms|s|m|h|d|w)").expect("valid timeout pattern"))
}

/// Parses a timeout such as `1h30m`, `10m`, `45s` or `500ms`.
pub fn parse_timeout(value: &str) -> Result<Duration, TimeoutError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(TimeoutError::Empty);
    }

    let mut total = Duration::ZERO;
    let mut consumed = 0;
    for captures in component_pattern().captures_iter(value) {
        let (Some(whole), Some(amount), Some(unit)) =
            (captures.get(0), captures.get(1), captures.get(2))
        else {
            return Err(TimeoutError::Invalid(value.to_string()));
        };
        // Components must be contiguous
        if whole.start() != consumed {
            return Err(TimeoutError::Invalid(value.to_string()));
        }
        consumed = whole.end();

        let amount: u64 = amount
            .as_str()
            .parse()
            .map_err(|_| TimeoutError::Invalid(value.to_string()))?;
        let component = match unit.as_str() {
            "ms" => Duration::from_millis(amount),
            "s" => Duration::from_secs(amount),
            "m" => Duration::from_secs(amount.saturating_mul(60)),
            "h" => Duration::from_secs(amount.saturating_mul(3_600)),
            "d" => Duration::from_secs(amount.saturating_mul(86_400)),
            "w" => Duration::from_secs(amount.saturating_mul(604_800)),
            _ => return Err(TimeoutError::Invalid(value.to_string())),
        };
        total = total.saturating_add(component);
    }

    if consumed != value.len() {
        return Err(TimeoutError::Invalid(value.to_string()));
    }
    Ok(total)
}

/// Computes the execution timeout sent with a step's remote tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutBudget {
    /// Floor applied to every computed timeout.
    pub min_timeout: Duration,
    /// Elapsed time assumed when the group start is unknown.
    pub default_group_elapsed: Duration,
}

impl TimeoutBudget {
    pub fn new(min_timeout: Duration, default_group_elapsed: Duration) -> Self {
        Self {
            min_timeout,
            default_group_elapsed,
        }
    }

    /// Declared timeout minus the time already spent in the step group,
    /// never below `min_timeout`.
    pub fn remaining(
        &self,
        declared: Duration,
        group_started_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Duration {
        let elapsed = match group_started_at {
            Some(started) => (now - started).to_std().unwrap_or(Duration::ZERO),
            None => self.default_group_elapsed,
        };
        declared.saturating_sub(elapsed).max(self.min_timeout)
    }
}

impl Default for TimeoutBudget {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(600))
    }
}
