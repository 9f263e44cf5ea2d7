//! Contracts for the collaborators a session controller drives.
//!
//! The controller never touches audio hardware, speech engines or the network
//! directly; platform layers implement these traits.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use exam_core::model::{AudioResource, Part, Question, QuestionId, SessionId};

use crate::error::{GatewayError, PromptError, RecorderError};

//
// ─── RECORDING ─────────────────────────────────────────────────────────────────
//

/// Live capture status as reported by the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecorderStatus {
    pub is_recording: bool,
    pub is_paused: bool,
}

/// Audio capture capability.
///
/// `stop` on an idle recorder is a no-op returning `Ok(None)`. `discard` must
/// always leave the device idle and drop any unfinished capture.
#[async_trait]
pub trait Recorder: Send + Sync {
    /// # Errors
    ///
    /// Returns `RecorderError` if permission is missing or capture cannot start.
    async fn start(&self) -> Result<(), RecorderError>;

    /// # Errors
    ///
    /// Returns `RecorderError` if the device refuses to pause.
    async fn pause(&self) -> Result<(), RecorderError>;

    /// # Errors
    ///
    /// Returns `RecorderError` if the device refuses to resume.
    async fn resume(&self) -> Result<(), RecorderError>;

    /// Finish the capture and hand back the stored audio.
    ///
    /// # Errors
    ///
    /// Returns `RecorderError` if the capture could not be finalized.
    async fn stop(&self) -> Result<Option<AudioResource>, RecorderError>;

    async fn discard(&self);

    fn status(&self) -> RecorderStatus;
}

//
// ─── PROMPT PLAYBACK ───────────────────────────────────────────────────────────
//

/// How a spoken prompt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptEnd {
    Done,
    Stopped,
    Failed(String),
}

/// Completion side of a started prompt.
#[derive(Debug)]
pub struct PromptCompletion {
    rx: oneshot::Receiver<PromptEnd>,
}

/// Sending side held by the speech engine.
#[derive(Debug)]
pub struct PromptSignal {
    tx: oneshot::Sender<PromptEnd>,
}

impl PromptCompletion {
    #[must_use]
    pub fn channel() -> (PromptSignal, PromptCompletion) {
        let (tx, rx) = oneshot::channel();
        (PromptSignal { tx }, PromptCompletion { rx })
    }

    /// A completion that has already finished.
    #[must_use]
    pub fn finished(end: PromptEnd) -> Self {
        let (signal, completion) = Self::channel();
        signal.finish(end);
        completion
    }

    /// Wait for the prompt to end. A dropped signal reads as `Stopped`.
    pub async fn wait(self) -> PromptEnd {
        self.rx.await.unwrap_or(PromptEnd::Stopped)
    }
}

impl PromptSignal {
    pub fn finish(self, end: PromptEnd) {
        // The listener may already be gone; nothing to report then.
        let _ = self.tx.send(end);
    }
}

/// Text-to-speech capability for reading prompts aloud.
#[async_trait]
pub trait PromptPlayer: Send + Sync {
    /// Start speaking `text`.
    ///
    /// # Errors
    ///
    /// Returns `PromptError` if playback cannot start.
    async fn speak(&self, text: &str) -> Result<PromptCompletion, PromptError>;

    /// Stop playback. Safe when nothing is playing.
    async fn stop(&self);
}

//
// ─── BACKEND ───────────────────────────────────────────────────────────────────
//

/// Question metadata lookup.
#[async_trait]
pub trait QuestionSource: Send + Sync {
    /// # Errors
    ///
    /// Returns `GatewayError` if the question cannot be fetched.
    async fn get_question(&self, id: QuestionId) -> Result<Question, GatewayError>;
}

/// Backend-issued destination for one answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadTarget {
    pub upload_url: String,
    pub storage_path: String,
}

/// The three-step upload protocol.
#[async_trait]
pub trait SubmissionGateway: Send + Sync {
    /// # Errors
    ///
    /// Returns `GatewayError` if the backend refuses or cannot be reached.
    async fn request_upload_targets(
        &self,
        session_id: &SessionId,
        part: Part,
        question_ids: &[QuestionId],
    ) -> Result<HashMap<QuestionId, UploadTarget>, GatewayError>;

    /// # Errors
    ///
    /// Returns `GatewayError` if the bytes could not be delivered.
    async fn transfer(&self, target: &UploadTarget, audio: &AudioResource)
    -> Result<(), GatewayError>;

    /// # Errors
    ///
    /// Returns `GatewayError` if the backend refuses the confirmation.
    async fn confirm(
        &self,
        session_id: &SessionId,
        part: Part,
        storage_paths: &BTreeMap<QuestionId, String>,
    ) -> Result<(), GatewayError>;
}
