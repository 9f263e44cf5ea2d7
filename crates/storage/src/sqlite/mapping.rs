use exam_core::model::{AttemptSummary, SessionId};
use sqlx::Row;

use crate::repository::{AttemptRow, StorageError};

pub(crate) fn ser<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Serialization(e.to_string())
}

fn u32_from_i64(field: &'static str, v: i64) -> Result<u32, StorageError> {
    u32::try_from(v).map_err(|_| StorageError::Serialization(format!("invalid {field}: {v}")))
}

fn u64_from_i64(field: &'static str, v: i64) -> Result<u64, StorageError> {
    u64::try_from(v).map_err(|_| StorageError::Serialization(format!("{field} sign overflow")))
}

pub(crate) fn i64_from_u64(field: &'static str, v: u64) -> Result<i64, StorageError> {
    i64::try_from(v).map_err(|_| StorageError::Serialization(format!("{field} overflow")))
}

pub(crate) fn map_attempt_row(row: &sqlx::sqlite::SqliteRow) -> Result<AttemptSummary, StorageError> {
    let session_id = SessionId::new(row.try_get::<String, _>("session_id").map_err(ser)?)
        .map_err(ser)?;
    let started_at = row.try_get("started_at").map_err(ser)?;
    let completed_at = row.try_get("completed_at").map_err(ser)?;
    let recordings = [
        u32_from_i64("part1_recordings", row.try_get("part1_recordings").map_err(ser)?)?,
        u32_from_i64("part2_recordings", row.try_get("part2_recordings").map_err(ser)?)?,
        u32_from_i64("part3_recordings", row.try_get("part3_recordings").map_err(ser)?)?,
    ];
    let total_recorded_secs = u64_from_i64(
        "total_recorded_secs",
        row.try_get("total_recorded_secs").map_err(ser)?,
    )?;
    let expired: bool = row.try_get("expired").map_err(ser)?;

    AttemptSummary::from_persisted(
        session_id,
        started_at,
        completed_at,
        recordings,
        total_recorded_secs,
        expired,
    )
    .map_err(ser)
}

pub(crate) fn map_attempt_row_with_id(
    row: &sqlx::sqlite::SqliteRow,
) -> Result<AttemptRow, StorageError> {
    let id: i64 = row.try_get("id").map_err(ser)?;
    let summary = map_attempt_row(row)?;
    Ok(AttemptRow::new(id, summary))
}
