//! Shared error types for the services crate.

use thiserror::Error;

use exam_core::model::{Part, QuestionId, TimeLimitError};
use exam_core::session::TransitionError;
use storage::repository::StorageError;

/// Failures talking to the backend.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("backend request failed with status {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("could not read audio: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected backend payload: {0}")]
    Decode(String),
    #[error("backend rejected the request: {0}")]
    Rejected(String),
}

/// Errors emitted by the recording capability.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RecorderError {
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("audio capture failed: {0}")]
    Device(String),
}

/// Errors emitted by the prompt player.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PromptError {
    #[error("prompt playback is unavailable right now")]
    Unavailable,
}

/// Question metadata could not be loaded. Fatal to the session.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LoadError {
    #[error("session has no questions")]
    NoQuestions,
    #[error(transparent)]
    InvalidTimeLimit(#[from] TimeLimitError),
    #[error("failed to fetch question {id}: {source}")]
    Fetch {
        id: QuestionId,
        #[source]
        source: GatewayError,
    },
    #[error("question {0} was not returned by the backend")]
    Unresolved(QuestionId),
}

/// A step of the upload protocol failed; the whole attempt must be resubmitted.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SubmissionError {
    #[error("failed to request upload targets for {part}: {source}")]
    RequestTargets {
        part: Part,
        #[source]
        source: GatewayError,
    },
    #[error("backend returned no upload targets for {part}")]
    NoTargets { part: Part },
    #[error("backend returned no upload target for question {question_id} in {part}")]
    MissingTarget { part: Part, question_id: QuestionId },
    #[error("failed to upload answer to question {question_id}: {source}")]
    Transfer {
        part: Part,
        question_id: QuestionId,
        #[source]
        source: GatewayError,
    },
    #[error("failed to confirm upload of {part}: {source}")]
    Confirm {
        part: Part,
        #[source]
        source: GatewayError,
    },
}

/// Errors emitted by the exam session controller and runner.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExamError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Recording(#[from] RecorderError),
    #[error(transparent)]
    PromptPlayback(#[from] PromptError),
    #[error(transparent)]
    Submission(#[from] SubmissionError),
    #[error("no answers were recorded; confirm to submit an empty attempt")]
    EmptySubmissionConfirmationRequired,
    #[error(transparent)]
    InvalidState(#[from] TransitionError),
    #[error("session has not been initialized")]
    NotInitialized,
    #[error("session is closed")]
    SessionClosed,
}

impl ExamError {
    /// Errors the candidate can dismiss and carry on from.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExamError::Recording(_) | ExamError::PromptPlayback(_) | ExamError::InvalidState(_)
        )
    }

    /// Errors whose remedy is retrying the whole operation.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExamError::Load(_) | ExamError::Submission(_))
    }
}

/// Errors emitted by the attempt history facade.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HistoryError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}
