use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::model::{
    AudioResource, Cursor, ExamPlan, Part, Question, QuestionId, Recording, RecordingSet,
    SessionId, TimeLimit,
};

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("cannot {action} while {phase}")]
    InvalidPhase {
        action: &'static str,
        phase: &'static str,
    },
    #[error("session has no questions")]
    EmptyPlan,
    #[error("question {0} could not be resolved")]
    UnresolvedQuestion(QuestionId),
    #[error("no recordings to submit")]
    NoRecordings,
    #[error("exam time has run out")]
    TimeExpired,
}

//
// ─── SETTINGS ──────────────────────────────────────────────────────────────────
//

/// Tunables for one session. Defaults follow the official test format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Length of the one-time Part 2 preparation window.
    pub thinking_secs: u32,
    /// Remaining time at which the one-time warning fires.
    pub warning_secs: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            thinking_secs: 60,
            warning_secs: 120,
        }
    }
}

//
// ─── PHASE ─────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedStage {
    Load,
    Submission,
}

/// The single source of truth for where an attempt is.
///
/// `Failed { stage: Submission }` behaves like `AwaitingAnswer` with a retry
/// affordance; `Failed { stage: Load }` is terminal for this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    Loading,
    Ready,
    Thinking { remaining: u32 },
    AwaitingAnswer,
    Recording { elapsed: u32, paused: bool },
    Submitting,
    Complete,
    Failed { stage: FailedStage },
}

impl Phase {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Loading => "loading",
            Phase::Ready => "ready",
            Phase::Thinking { .. } => "thinking",
            Phase::AwaitingAnswer => "awaiting an answer",
            Phase::Recording { .. } => "recording",
            Phase::Submitting => "submitting",
            Phase::Complete => "complete",
            Phase::Failed {
                stage: FailedStage::Load,
            } => "failed to load",
            Phase::Failed {
                stage: FailedStage::Submission,
            } => "failed to submit",
        }
    }

    #[must_use]
    pub fn is_recording(&self) -> bool {
        matches!(self, Phase::Recording { .. })
    }

    #[must_use]
    pub fn is_thinking(&self) -> bool {
        matches!(self, Phase::Thinking { .. })
    }
}

//
// ─── TRANSITION OUTCOMES ───────────────────────────────────────────────────────
//

/// Where the cursor ended up after a move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Landing {
    /// The Part 2 preparation window started; prompts are held back.
    Thinking { secs: u32 },
    /// A question is ready to be answered; its prompt should auto-play.
    Question {
        cursor: Cursor,
        question_id: QuestionId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Landed(Landing),
    /// No questions remain; the attempt should be submitted.
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retreat {
    Landed(Landing),
    AtStart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingTick {
    Idle,
    Counting { remaining: u32 },
    Finished { question_id: QuestionId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockTick {
    /// Clock not running: practice mode, not loaded, submitting, or already expired.
    Idle,
    Counting { remaining: u32 },
    /// First tick inside the warning window. Fires once per session.
    Warning { remaining: u32 },
    Expired,
}

/// Recordings of one part, in capture order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartUpload {
    pub part: Part,
    pub recordings: Vec<Recording>,
}

/// Everything the upload protocol needs, grouped per part in order 1 → 2 → 3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionPlan {
    pub session_id: SessionId,
    pub parts: Vec<PartUpload>,
}

/// Aggregated view of attempt progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionProgress {
    pub total: usize,
    pub answered: usize,
    /// 1-based position of the cursor in visiting order, 0 before loading.
    pub position: usize,
}

//
// ─── SESSION ───────────────────────────────────────────────────────────────────
//

/// State of one attempt at a mock speaking test.
///
/// Every mutation is a synchronous transition; callers perform I/O around them.
#[derive(Debug, Clone)]
pub struct ExamSession {
    session_id: SessionId,
    plan: ExamPlan,
    settings: SessionSettings,
    phase: Phase,
    cursor: Option<Cursor>,
    questions: HashMap<QuestionId, Question>,
    limited: bool,
    remaining_secs: u32,
    warning_shown: bool,
    thinking_consumed: bool,
    expired: bool,
    recordings: RecordingSet,
    listened: HashSet<QuestionId>,
}

impl ExamSession {
    /// Create a session in `Loading`.
    ///
    /// # Errors
    ///
    /// Returns `TransitionError::EmptyPlan` if no part references a question.
    pub fn new(
        session_id: SessionId,
        plan: ExamPlan,
        limit: TimeLimit,
        settings: SessionSettings,
    ) -> Result<Self, TransitionError> {
        if plan.is_empty() {
            return Err(TransitionError::EmptyPlan);
        }
        Ok(Self {
            session_id,
            plan,
            settings,
            phase: Phase::Loading,
            cursor: None,
            questions: HashMap::new(),
            limited: limit.seconds().is_some(),
            remaining_secs: limit.seconds().unwrap_or(0),
            warning_shown: false,
            thinking_consumed: false,
            expired: false,
            recordings: RecordingSet::new(),
            listened: HashSet::new(),
        })
    }

    fn invalid(&self, action: &'static str) -> TransitionError {
        TransitionError::InvalidPhase {
            action,
            phase: self.phase.name(),
        }
    }

    /// Install fetched questions and move to `Ready`.
    ///
    /// # Errors
    ///
    /// Returns `TransitionError::UnresolvedQuestion` (and fails the session) if a
    /// referenced id is missing from `questions`.
    pub fn loaded(&mut self, questions: Vec<Question>) -> Result<(), TransitionError> {
        if self.phase != Phase::Loading {
            return Err(self.invalid("load questions"));
        }
        let map: HashMap<QuestionId, Question> =
            questions.into_iter().map(|q| (q.id(), q)).collect();
        if let Some(missing) = self.plan.all_ids().into_iter().find(|id| !map.contains_key(id)) {
            self.phase = Phase::Failed {
                stage: FailedStage::Load,
            };
            return Err(TransitionError::UnresolvedQuestion(missing));
        }
        self.questions = map;
        self.cursor = self.plan.first_cursor();
        self.phase = Phase::Ready;
        Ok(())
    }

    pub fn load_failed(&mut self) {
        self.phase = Phase::Failed {
            stage: FailedStage::Load,
        };
    }

    /// Land on the first question.
    ///
    /// # Errors
    ///
    /// Returns `TransitionError::InvalidPhase` unless the session is `Ready`.
    pub fn begin(&mut self) -> Result<Landing, TransitionError> {
        if self.phase != Phase::Ready {
            return Err(self.invalid("begin"));
        }
        let cursor = self.cursor.ok_or(TransitionError::EmptyPlan)?;
        self.land(cursor)
    }

    fn land(&mut self, cursor: Cursor) -> Result<Landing, TransitionError> {
        let question_id = self
            .plan
            .question_at(cursor)
            .ok_or(TransitionError::EmptyPlan)?;
        self.cursor = Some(cursor);

        let opens_part_two = cursor.part == Part::Two && cursor.index == 0;
        if opens_part_two && !self.thinking_consumed {
            // Consumed on entry so that coming back here never re-arms it.
            self.thinking_consumed = true;
            if self.settings.thinking_secs > 0 {
                self.phase = Phase::Thinking {
                    remaining: self.settings.thinking_secs,
                };
                return Ok(Landing::Thinking {
                    secs: self.settings.thinking_secs,
                });
            }
        }

        self.phase = Phase::AwaitingAnswer;
        Ok(Landing::Question {
            cursor,
            question_id,
        })
    }

    /// True while the candidate may record, navigate, or retry a failed submission.
    #[must_use]
    pub fn is_answering(&self) -> bool {
        matches!(
            self.phase,
            Phase::AwaitingAnswer
                | Phase::Failed {
                    stage: FailedStage::Submission
                }
        )
    }

    /// True once questions are in place and the attempt has not failed to load.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        !matches!(
            self.phase,
            Phase::Loading
                | Phase::Failed {
                    stage: FailedStage::Load
                }
        )
    }

    // ─── Recording ─────────────────────────────────────────────────────────────

    /// Whether `start_recording` would succeed, without changing anything.
    ///
    /// # Errors
    ///
    /// Returns the error `start_recording` would return.
    pub fn check_start_recording(&self) -> Result<(), TransitionError> {
        if self.expired {
            return Err(TransitionError::TimeExpired);
        }
        if !self.is_answering() {
            return Err(self.invalid("start recording"));
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `TransitionError` unless the session is awaiting an answer with time left.
    pub fn start_recording(&mut self) -> Result<(), TransitionError> {
        self.check_start_recording()?;
        self.phase = Phase::Recording {
            elapsed: 0,
            paused: false,
        };
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `TransitionError::InvalidPhase` unless an unpaused recording is open.
    pub fn pause_recording(&mut self) -> Result<(), TransitionError> {
        match self.phase {
            Phase::Recording {
                elapsed,
                paused: false,
            } => {
                self.phase = Phase::Recording {
                    elapsed,
                    paused: true,
                };
                Ok(())
            }
            _ => Err(self.invalid("pause recording")),
        }
    }

    /// # Errors
    ///
    /// Returns `TransitionError::InvalidPhase` unless a paused recording is open.
    pub fn resume_recording(&mut self) -> Result<(), TransitionError> {
        match self.phase {
            Phase::Recording {
                elapsed,
                paused: true,
            } => {
                self.phase = Phase::Recording {
                    elapsed,
                    paused: false,
                };
                Ok(())
            }
            _ => Err(self.invalid("resume recording")),
        }
    }

    /// Report how many whole seconds the open capture has run, pauses excluded.
    ///
    /// The count never moves backwards. Returns the stored count, or `None`
    /// when no recording is open.
    pub fn record_elapsed(&mut self, secs: u32) -> Option<u32> {
        match self.phase {
            Phase::Recording { elapsed, paused } => {
                let elapsed = elapsed.max(secs);
                self.phase = Phase::Recording { elapsed, paused };
                Some(elapsed)
            }
            _ => None,
        }
    }

    /// Store the capture for the current question and return to `AwaitingAnswer`.
    ///
    /// Any earlier recording for the same question is replaced.
    ///
    /// # Errors
    ///
    /// Returns `TransitionError::InvalidPhase` unless a recording is open.
    pub fn finish_recording(&mut self, audio: AudioResource) -> Result<&Recording, TransitionError> {
        let Phase::Recording { elapsed, .. } = self.phase else {
            return Err(self.invalid("finish recording"));
        };
        let cursor = self.cursor.ok_or(TransitionError::EmptyPlan)?;
        let question_id = self
            .plan
            .question_at(cursor)
            .ok_or(TransitionError::EmptyPlan)?;

        self.recordings.insert(Recording {
            question_id,
            part: cursor.part,
            audio,
            duration_secs: elapsed,
        });
        self.phase = Phase::AwaitingAnswer;
        self.recordings
            .get(question_id)
            .ok_or(TransitionError::UnresolvedQuestion(question_id))
    }

    /// Drop an open capture without storing it. Returns false if none was open.
    pub fn discard_recording(&mut self) -> bool {
        if self.phase.is_recording() {
            self.phase = Phase::AwaitingAnswer;
            true
        } else {
            false
        }
    }

    // ─── Navigation ────────────────────────────────────────────────────────────

    /// Move to the next question, or report that none remain.
    ///
    /// # Errors
    ///
    /// Returns `TransitionError` while recording, thinking, or after time ran out.
    pub fn advance(&mut self) -> Result<Advance, TransitionError> {
        if self.expired {
            return Err(TransitionError::TimeExpired);
        }
        if !self.is_answering() {
            return Err(self.invalid("move to the next question"));
        }
        let cursor = self.cursor.ok_or(TransitionError::EmptyPlan)?;
        match self.plan.next_cursor(cursor) {
            Some(next) => Ok(Advance::Landed(self.land(next)?)),
            None => Ok(Advance::Exhausted),
        }
    }

    /// Move back one question.
    ///
    /// # Errors
    ///
    /// Returns `TransitionError` while recording, thinking, or after time ran out.
    pub fn retreat(&mut self) -> Result<Retreat, TransitionError> {
        if self.expired {
            return Err(TransitionError::TimeExpired);
        }
        if !self.is_answering() {
            return Err(self.invalid("move to the previous question"));
        }
        let cursor = self.cursor.ok_or(TransitionError::EmptyPlan)?;
        match self.plan.previous_cursor(cursor) {
            Some(previous) => Ok(Retreat::Landed(self.land(previous)?)),
            None => Ok(Retreat::AtStart),
        }
    }

    // ─── Timers ────────────────────────────────────────────────────────────────

    pub fn tick_thinking(&mut self) -> ThinkingTick {
        let Phase::Thinking { remaining } = self.phase else {
            return ThinkingTick::Idle;
        };
        let remaining = remaining.saturating_sub(1);
        if remaining == 0 {
            self.phase = Phase::AwaitingAnswer;
            match self.current_question_id() {
                Some(question_id) => ThinkingTick::Finished { question_id },
                None => ThinkingTick::Idle,
            }
        } else {
            self.phase = Phase::Thinking { remaining };
            ThinkingTick::Counting { remaining }
        }
    }

    /// End the preparation window early.
    ///
    /// # Errors
    ///
    /// Returns `TransitionError::InvalidPhase` unless thinking.
    pub fn skip_thinking(&mut self) -> Result<QuestionId, TransitionError> {
        if !self.phase.is_thinking() {
            return Err(self.invalid("skip preparation"));
        }
        self.phase = Phase::AwaitingAnswer;
        self.current_question_id()
            .ok_or(TransitionError::EmptyPlan)
    }

    pub fn tick_exam_clock(&mut self) -> ClockTick {
        let running = self.limited
            && self.is_loaded()
            && !self.expired
            && self.remaining_secs > 0
            && !matches!(self.phase, Phase::Submitting | Phase::Complete);
        if !running {
            return ClockTick::Idle;
        }

        self.remaining_secs -= 1;
        if self.remaining_secs == 0 {
            self.expired = true;
            if self.phase.is_thinking() {
                self.phase = Phase::AwaitingAnswer;
            }
            return ClockTick::Expired;
        }
        if self.remaining_secs <= self.settings.warning_secs && !self.warning_shown {
            self.warning_shown = true;
            return ClockTick::Warning {
                remaining: self.remaining_secs,
            };
        }
        ClockTick::Counting {
            remaining: self.remaining_secs,
        }
    }

    // ─── Submission ────────────────────────────────────────────────────────────

    /// Whether the attempt may be handed in from the current phase.
    ///
    /// # Errors
    ///
    /// Returns `TransitionError::InvalidPhase` while loading, recording,
    /// submitting, or once complete.
    pub fn check_submit(&self) -> Result<(), TransitionError> {
        if self.is_answering() || matches!(self.phase, Phase::Ready | Phase::Thinking { .. }) {
            Ok(())
        } else {
            Err(self.invalid("submit"))
        }
    }

    /// Enter `Submitting` and hand out the per-part upload plan.
    ///
    /// # Errors
    ///
    /// Returns `TransitionError::NoRecordings` when nothing was recorded, or
    /// `InvalidPhase` while recording, loading, or already submitting.
    pub fn begin_submission(&mut self) -> Result<SubmissionPlan, TransitionError> {
        self.check_submit()?;
        if self.recordings.is_empty() {
            return Err(TransitionError::NoRecordings);
        }

        let parts = self
            .recordings
            .parts_with_recordings()
            .into_iter()
            .map(|part| PartUpload {
                part,
                recordings: self.recordings.for_part(part).into_iter().cloned().collect(),
            })
            .collect();
        self.phase = Phase::Submitting;
        Ok(SubmissionPlan {
            session_id: self.session_id.clone(),
            parts,
        })
    }

    /// Close an attempt that the candidate confirmed submitting with no answers.
    ///
    /// # Errors
    ///
    /// Returns `TransitionError::InvalidPhase` when submission is not possible.
    pub fn complete_empty(&mut self) -> Result<(), TransitionError> {
        self.check_submit()?;
        self.phase = Phase::Complete;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `TransitionError::InvalidPhase` unless submitting.
    pub fn submission_succeeded(&mut self) -> Result<(), TransitionError> {
        if self.phase != Phase::Submitting {
            return Err(self.invalid("complete submission"));
        }
        self.phase = Phase::Complete;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `TransitionError::InvalidPhase` unless submitting.
    pub fn submission_failed(&mut self) -> Result<(), TransitionError> {
        if self.phase != Phase::Submitting {
            return Err(self.invalid("fail submission"));
        }
        self.phase = Phase::Failed {
            stage: FailedStage::Submission,
        };
        Ok(())
    }

    // ─── Observers ─────────────────────────────────────────────────────────────

    pub fn mark_listened(&mut self, id: QuestionId) {
        self.listened.insert(id);
    }

    #[must_use]
    pub fn listened(&self, id: QuestionId) -> bool {
        self.listened.contains(&id)
    }

    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    #[must_use]
    pub fn plan(&self) -> &ExamPlan {
        &self.plan
    }

    #[must_use]
    pub fn settings(&self) -> SessionSettings {
        self.settings
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[must_use]
    pub fn cursor(&self) -> Option<Cursor> {
        self.cursor
    }

    #[must_use]
    pub fn current_question_id(&self) -> Option<QuestionId> {
        self.cursor.and_then(|c| self.plan.question_at(c))
    }

    #[must_use]
    pub fn current_question(&self) -> Option<&Question> {
        self.current_question_id()
            .and_then(|id| self.questions.get(&id))
    }

    #[must_use]
    pub fn question(&self, id: QuestionId) -> Option<&Question> {
        self.questions.get(&id)
    }

    /// Remaining exam seconds; always 0 in practice mode.
    #[must_use]
    pub fn remaining_secs(&self) -> u32 {
        self.remaining_secs
    }

    #[must_use]
    pub fn has_time_limit(&self) -> bool {
        self.limited
    }

    #[must_use]
    pub fn warning_shown(&self) -> bool {
        self.warning_shown
    }

    #[must_use]
    pub fn thinking_consumed(&self) -> bool {
        self.thinking_consumed
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expired
    }

    #[must_use]
    pub fn recordings(&self) -> &RecordingSet {
        &self.recordings
    }

    #[must_use]
    pub fn progress(&self) -> SessionProgress {
        let position = self.cursor.map_or(0, |cursor| {
            let before: usize = Part::ALL
                .iter()
                .take_while(|p| **p != cursor.part)
                .map(|p| self.plan.question_ids(*p).len())
                .sum();
            before + cursor.index + 1
        });
        SessionProgress {
            total: self.plan.total(),
            answered: self.recordings.len(),
            position,
        }
    }
}
