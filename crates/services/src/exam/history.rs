use chrono::{DateTime, Utc};
use std::sync::Arc;

use exam_core::model::{AttemptSummary, SessionId};
use storage::repository::{AttemptRepository, AttemptRow, Storage};

use crate::error::HistoryError;

/// Presentation-agnostic list item for a finished attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptListItem {
    pub id: i64,
    pub session_id: SessionId,
    pub completed_at: DateTime<Utc>,
    pub recordings: u32,
    pub total_recorded_secs: u64,
    pub expired: bool,
}

impl AttemptListItem {
    #[must_use]
    pub fn from_row(row: &AttemptRow) -> Self {
        let summary = &row.summary;
        Self {
            id: row.id,
            session_id: summary.session_id().clone(),
            completed_at: summary.completed_at(),
            recordings: summary.total_recordings(),
            total_recorded_secs: summary.total_recorded_secs(),
            expired: summary.expired(),
        }
    }
}

/// Read access to attempts recorded on this device.
#[derive(Clone)]
pub struct AttemptHistoryService {
    attempts: Arc<dyn AttemptRepository>,
}

impl AttemptHistoryService {
    #[must_use]
    pub fn new(attempts: Arc<dyn AttemptRepository>) -> Self {
        Self { attempts }
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Storage::in_memory().attempts)
    }

    /// Most recent attempts first.
    ///
    /// # Errors
    ///
    /// Returns `HistoryError::Storage` on repository failures.
    pub async fn list_recent(&self, limit: u32) -> Result<Vec<AttemptListItem>, HistoryError> {
        let rows = self.attempts.list_attempts(limit).await?;
        Ok(rows.iter().map(AttemptListItem::from_row).collect())
    }

    /// # Errors
    ///
    /// Returns `HistoryError::Storage` if the attempt is missing or storage fails.
    pub async fn get(&self, id: i64) -> Result<AttemptSummary, HistoryError> {
        Ok(self.attempts.get_attempt(id).await?)
    }
}
