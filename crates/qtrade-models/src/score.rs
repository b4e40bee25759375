use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A bounded 0-100 score used for every confidence and effectiveness value.
///
/// Out-of-range values are rejected both at construction and when
/// deserializing, so a `Score` held anywhere in the system is always valid.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub struct Score(u8);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("score {0} is outside the range 0..=100")]
pub struct ScoreError(pub i64);

impl Score {
    pub const ZERO: Score = Score(0);
    pub const MAX: Score = Score(100);

    pub fn new(value: u8) -> Result<Self, ScoreError> {
        if value > 100 {
            return Err(ScoreError(value as i64));
        }
        Ok(Self(value))
    }

    /// Clamp any integer into the valid range.
    pub fn clamped(value: i64) -> Self {
        Self(value.clamp(0, 100) as u8)
    }

    /// Convert a fractional score (0.0-1.0 or 0-100) into a `Score`.
    /// Values at or below 1.0 are treated as probabilities.
    pub fn from_f64_lenient(value: f64) -> Self {
        if !value.is_finite() {
            return Self::ZERO;
        }
        let scaled = if (0.0..=1.0).contains(&value) {
            value * 100.0
        } else {
            value
        };
        Self::clamped(scaled.round() as i64)
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn saturating_add(self, delta: u8) -> Self {
        Self::clamped(self.0 as i64 + delta as i64)
    }
}

impl TryFrom<u8> for Score {
    type Error = ScoreError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Score::new(value)
    }
}

impl From<Score> for u8 {
    fn from(score: Score) -> Self {
        score.0
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
