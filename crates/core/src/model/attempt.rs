use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::ids::SessionId;
use crate::model::part::Part;
use crate::model::recording::RecordingSet;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AttemptSummaryError {
    #[error("completed_at is before started_at")]
    InvalidTimeRange,
}

/// What a submitted attempt leaves behind on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptSummary {
    session_id: SessionId,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
    recordings: [u32; 3],
    total_recorded_secs: u64,
    expired: bool,
}

impl AttemptSummary {
    /// Summarise a finished attempt from its recordings.
    ///
    /// # Errors
    ///
    /// Returns `AttemptSummaryError::InvalidTimeRange` if `completed_at < started_at`.
    pub fn from_recordings(
        session_id: SessionId,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        recordings: &RecordingSet,
        expired: bool,
    ) -> Result<Self, AttemptSummaryError> {
        Self::from_persisted(
            session_id,
            started_at,
            completed_at,
            [
                recordings.count_for(Part::One),
                recordings.count_for(Part::Two),
                recordings.count_for(Part::Three),
            ],
            recordings.total_duration_secs(),
            expired,
        )
    }

    /// Rehydrate a summary from persisted storage.
    ///
    /// # Errors
    ///
    /// Returns `AttemptSummaryError::InvalidTimeRange` if `completed_at < started_at`.
    pub fn from_persisted(
        session_id: SessionId,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        recordings: [u32; 3],
        total_recorded_secs: u64,
        expired: bool,
    ) -> Result<Self, AttemptSummaryError> {
        if completed_at < started_at {
            return Err(AttemptSummaryError::InvalidTimeRange);
        }
        Ok(Self {
            session_id,
            started_at,
            completed_at,
            recordings,
            total_recorded_secs,
            expired,
        })
    }

    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    #[must_use]
    pub fn completed_at(&self) -> DateTime<Utc> {
        self.completed_at
    }

    #[must_use]
    pub fn recordings_in(&self, part: Part) -> u32 {
        self.recordings[usize::from(part.number() - 1)]
    }

    #[must_use]
    pub fn total_recordings(&self) -> u32 {
        self.recordings.iter().sum()
    }

    #[must_use]
    pub fn total_recorded_secs(&self) -> u64 {
        self.total_recorded_secs
    }

    /// True when the exam clock ran out and forced the submission.
    #[must_use]
    pub fn expired(&self) -> bool {
        self.expired
    }

    #[must_use]
    pub fn is_empty_submission(&self) -> bool {
        self.total_recordings() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::fixed_now;

    #[test]
    fn rejects_inverted_time_range() {
        let now = fixed_now();
        let err = AttemptSummary::from_persisted(
            SessionId::from(1_u64),
            now,
            now - chrono::Duration::seconds(1),
            [0, 0, 0],
            0,
            false,
        )
        .unwrap_err();
        assert_eq!(err, AttemptSummaryError::InvalidTimeRange);
    }

    #[test]
    fn counts_per_part() {
        let now = fixed_now();
        let summary = AttemptSummary::from_persisted(
            SessionId::from(5_u64),
            now,
            now,
            [2, 0, 1],
            42,
            true,
        )
        .unwrap();
        assert_eq!(summary.recordings_in(Part::One), 2);
        assert_eq!(summary.recordings_in(Part::Three), 1);
        assert_eq!(summary.total_recordings(), 3);
        assert!(!summary.is_empty_submission());
        assert!(summary.expired());
    }
}
