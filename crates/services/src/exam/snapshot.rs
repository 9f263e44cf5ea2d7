use serde::Serialize;

use exam_core::model::{Cursor, Part, QuestionId, SessionId};
use exam_core::session::{ExamSession, Phase, SessionProgress};

/// Transient message for the presentation layer. Cleared by the next command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    TimeWarning { remaining_secs: u32 },
    RecordingFailed { message: String },
    PromptFailed { message: String },
    SubmissionFailed { message: String },
    ConfirmEmptySubmission,
}

/// Read-only view of a session, safe to hand to any renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Option<SessionId>,
    #[serde(flatten)]
    pub phase: Phase,
    pub cursor: Option<Cursor>,
    pub part: Option<Part>,
    pub question_id: Option<QuestionId>,
    pub question_text: Option<String>,
    pub has_time_limit: bool,
    pub remaining_secs: u32,
    pub warning_shown: bool,
    pub expired: bool,
    pub thinking_remaining: Option<u32>,
    pub recording_elapsed: Option<u32>,
    pub recording_paused: bool,
    pub recorded: Vec<QuestionId>,
    pub listened: bool,
    pub prompt_playing: bool,
    pub progress: Option<SessionProgress>,
    pub notice: Option<Notice>,
}

impl SessionSnapshot {
    /// Snapshot of a controller that has not been initialized yet.
    #[must_use]
    pub fn idle() -> Self {
        Self {
            session_id: None,
            phase: Phase::Loading,
            cursor: None,
            part: None,
            question_id: None,
            question_text: None,
            has_time_limit: false,
            remaining_secs: 0,
            warning_shown: false,
            expired: false,
            thinking_remaining: None,
            recording_elapsed: None,
            recording_paused: false,
            recorded: Vec::new(),
            listened: false,
            prompt_playing: false,
            progress: None,
            notice: None,
        }
    }

    pub(crate) fn of(session: &ExamSession, prompt_playing: bool, notice: Option<Notice>) -> Self {
        let phase = session.phase();
        let question_id = session.current_question_id();
        let (recording_elapsed, recording_paused) = match phase {
            Phase::Recording { elapsed, paused } => (Some(elapsed), paused),
            _ => (None, false),
        };
        let thinking_remaining = match phase {
            Phase::Thinking { remaining } => Some(remaining),
            _ => None,
        };
        // The prompt stays hidden during preparation.
        let question_text = if phase.is_thinking() {
            None
        } else {
            session.current_question().map(|q| q.text().to_string())
        };

        Self {
            session_id: Some(session.session_id().clone()),
            phase,
            cursor: session.cursor(),
            part: session.cursor().map(|c| c.part),
            question_id,
            question_text,
            has_time_limit: session.has_time_limit(),
            remaining_secs: session.remaining_secs(),
            warning_shown: session.warning_shown(),
            expired: session.is_expired(),
            thinking_remaining,
            recording_elapsed,
            recording_paused,
            recorded: session.recordings().iter().map(|r| r.question_id).collect(),
            listened: question_id.is_some_and(|id| session.listened(id)),
            prompt_playing,
            progress: Some(session.progress()),
            notice,
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Complete
    }
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self::idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_snapshot_serializes_flat_phase() {
        let value = serde_json::to_value(SessionSnapshot::idle()).unwrap();
        assert_eq!(value["phase"], "loading");
        assert!(value["notice"].is_null());
    }

    #[test]
    fn notices_are_tagged() {
        let value = serde_json::to_value(Notice::TimeWarning { remaining_secs: 120 }).unwrap();
        assert_eq!(value["kind"], "time_warning");
        assert_eq!(value["remaining_secs"], 120);
    }
}
