use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimeLimitError {
    #[error("invalid time limit: {0:?}")]
    Invalid(String),

    #[error("time limit too large: {minutes} minutes")]
    TooLarge { minutes: u64 },
}

/// Overall exam countdown configuration.
///
/// Parsed from strings shaped like `"12min"`. Zero minutes and an absent limit
/// both mean practice mode: the exam clock never runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeLimit {
    #[default]
    Unlimited,
    Seconds(u32),
}

impl TimeLimit {
    /// Parses an optional limit string; `None` means unlimited.
    ///
    /// # Errors
    ///
    /// Returns `TimeLimitError` if the string is not a whole number of minutes.
    pub fn parse_optional(raw: Option<&str>) -> Result<Self, TimeLimitError> {
        match raw {
            None => Ok(Self::Unlimited),
            Some(s) if s.trim().is_empty() => Ok(Self::Unlimited),
            Some(s) => s.parse(),
        }
    }

    #[must_use]
    pub fn from_minutes(minutes: u32) -> Self {
        if minutes == 0 {
            Self::Unlimited
        } else {
            Self::Seconds(minutes.saturating_mul(60))
        }
    }

    /// Total seconds, or `None` in practice mode.
    #[must_use]
    pub fn seconds(self) -> Option<u32> {
        match self {
            Self::Unlimited => None,
            Self::Seconds(secs) => Some(secs),
        }
    }

    #[must_use]
    pub fn is_unlimited(self) -> bool {
        matches!(self, Self::Unlimited)
    }
}

impl FromStr for TimeLimit {
    type Err = TimeLimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let lower = trimmed.to_ascii_lowercase();
        let digits = lower.strip_suffix("min").unwrap_or(&lower).trim_end();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TimeLimitError::Invalid(trimmed.to_string()));
        }
        let minutes: u64 = digits
            .parse()
            .map_err(|_| TimeLimitError::Invalid(trimmed.to_string()))?;
        let minutes = u32::try_from(minutes).map_err(|_| TimeLimitError::TooLarge { minutes })?;
        if minutes.checked_mul(60).is_none() {
            return Err(TimeLimitError::TooLarge {
                minutes: u64::from(minutes),
            });
        }
        Ok(Self::from_minutes(minutes))
    }
}
