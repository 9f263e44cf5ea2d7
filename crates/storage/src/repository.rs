use async_trait::async_trait;
use exam_core::model::AttemptSummary;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors surfaced by storage adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    #[error("conflict")]
    Conflict,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Persisted attempt summary with its storage id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRow {
    pub id: i64,
    pub summary: AttemptSummary,
}

impl AttemptRow {
    #[must_use]
    pub fn new(id: i64, summary: AttemptSummary) -> Self {
        Self { id, summary }
    }
}

/// Repository contract for finished attempts.
#[async_trait]
pub trait AttemptRepository: Send + Sync {
    /// Persist a finished attempt and return its id.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Conflict` if the session was already recorded,
    /// or other storage errors.
    async fn append_attempt(&self, summary: &AttemptSummary) -> Result<i64, StorageError>;

    /// Fetch an attempt by id.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if missing, or other storage errors.
    async fn get_attempt(&self, id: i64) -> Result<AttemptSummary, StorageError>;

    /// Most recent attempts first.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the query fails.
    async fn list_attempts(&self, limit: u32) -> Result<Vec<AttemptRow>, StorageError>;
}

/// Simple in-memory repository implementation for testing and prototyping.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    attempts: Arc<Mutex<Vec<AttemptRow>>>,
}

impl InMemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AttemptRepository for InMemoryRepository {
    async fn append_attempt(&self, summary: &AttemptSummary) -> Result<i64, StorageError> {
        let mut guard = self
            .attempts
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        if guard
            .iter()
            .any(|row| row.summary.session_id() == summary.session_id())
        {
            return Err(StorageError::Conflict);
        }
        let id = i64::try_from(guard.len())
            .map_err(|_| StorageError::Serialization("attempt id overflow".into()))?
            + 1;
        guard.push(AttemptRow::new(id, summary.clone()));
        Ok(id)
    }

    async fn get_attempt(&self, id: i64) -> Result<AttemptSummary, StorageError> {
        let guard = self
            .attempts
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        guard
            .iter()
            .find(|row| row.id == id)
            .map(|row| row.summary.clone())
            .ok_or(StorageError::NotFound)
    }

    async fn list_attempts(&self, limit: u32) -> Result<Vec<AttemptRow>, StorageError> {
        let guard = self
            .attempts
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        let mut rows = guard.clone();
        rows.sort_by(|a, b| {
            b.summary
                .completed_at()
                .cmp(&a.summary.completed_at())
                .then(b.id.cmp(&a.id))
        });
        rows.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(rows)
    }
}

/// Aggregates repositories behind trait objects for easy backend swapping.
#[derive(Clone)]
pub struct Storage {
    pub attempts: Arc<dyn AttemptRepository>,
}

impl Storage {
    #[must_use]
    pub fn in_memory() -> Self {
        let attempts: Arc<dyn AttemptRepository> = Arc::new(InMemoryRepository::new());
        Self { attempts }
    }
}
