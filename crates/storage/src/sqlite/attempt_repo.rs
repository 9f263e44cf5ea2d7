use exam_core::model::{AttemptSummary, Part};

use super::SqliteRepository;
use super::mapping::{i64_from_u64, map_attempt_row, map_attempt_row_with_id};
use crate::repository::{AttemptRepository, AttemptRow, StorageError};

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

#[async_trait::async_trait]
impl AttemptRepository for SqliteRepository {
    async fn append_attempt(&self, summary: &AttemptSummary) -> Result<i64, StorageError> {
        let res = sqlx::query(
            r"
                INSERT INTO attempts (
                    session_id, started_at, completed_at,
                    part1_recordings, part2_recordings, part3_recordings,
                    total_recorded_secs, expired
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ",
        )
        .bind(summary.session_id().as_str())
        .bind(summary.started_at())
        .bind(summary.completed_at())
        .bind(i64::from(summary.recordings_in(Part::One)))
        .bind(i64::from(summary.recordings_in(Part::Two)))
        .bind(i64::from(summary.recordings_in(Part::Three)))
        .bind(i64_from_u64("total_recorded_secs", summary.total_recorded_secs())?)
        .bind(summary.expired())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StorageError::Conflict
            } else {
                StorageError::Connection(e.to_string())
            }
        })?;

        Ok(res.last_insert_rowid())
    }

    async fn get_attempt(&self, id: i64) -> Result<AttemptSummary, StorageError> {
        let row = sqlx::query(
            r"
                SELECT
                    session_id, started_at, completed_at,
                    part1_recordings, part2_recordings, part3_recordings,
                    total_recorded_secs, expired
                FROM attempts
                WHERE id = ?1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?
        .ok_or(StorageError::NotFound)?;

        map_attempt_row(&row)
    }

    async fn list_attempts(&self, limit: u32) -> Result<Vec<AttemptRow>, StorageError> {
        let rows = sqlx::query(
            r"
                SELECT
                    id, session_id, started_at, completed_at,
                    part1_recordings, part2_recordings, part3_recordings,
                    total_recorded_secs, expired
                FROM attempts
                ORDER BY completed_at DESC, id DESC
                LIMIT ?1
            ",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(map_attempt_row_with_id(&row)?);
        }
        Ok(out)
    }
}
