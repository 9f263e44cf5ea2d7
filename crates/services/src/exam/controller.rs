use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt, stream};
use tokio::time::Instant;

use exam_core::model::{AttemptSummary, ExamPlan, QuestionId, Recording, SessionId, TimeLimit};
use exam_core::session::{
    Advance, ClockTick, ExamSession, Landing, Phase, Retreat, SessionSettings, ThinkingTick,
    TransitionError,
};
use storage::repository::AttemptRepository;

use super::snapshot::{Notice, SessionSnapshot};
use super::submission::{SubmissionReport, submit_plan};
use crate::Clock;
use crate::capabilities::{
    PromptCompletion, PromptEnd, PromptPlayer, QuestionSource, Recorder, SubmissionGateway,
};
use crate::error::{ExamError, LoadError, RecorderError};

const FETCH_CONCURRENCY: usize = 4;

//
// ─── OUTCOMES ──────────────────────────────────────────────────────────────────
//

/// Identifies one started prompt so late completions can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PromptToken(u64);

/// A prompt that started playing; await it and report back via
/// [`ExamController::prompt_finished`].
#[derive(Debug)]
pub struct PromptTicket {
    pub token: PromptToken,
    pub question_id: QuestionId,
    completion: PromptCompletion,
}

impl PromptTicket {
    pub async fn wait(self) -> (PromptToken, PromptEnd) {
        (self.token, self.completion.wait().await)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advanced {
    Landed(Landing),
    /// The last question was passed and the attempt was submitted.
    Submitted(SubmissionReport),
}

/// Result of one heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickOutcome {
    pub clock: ClockTick,
    pub thinking: ThinkingTick,
    /// Set when expiry forced the attempt in.
    pub submitted: Option<SubmissionReport>,
}

/// Capture time of the open recording, pauses excluded.
#[derive(Debug, Clone, Copy)]
struct CaptureClock {
    banked: Duration,
    running_since: Option<Instant>,
}

impl CaptureClock {
    fn started(now: Instant) -> Self {
        Self {
            banked: Duration::ZERO,
            running_since: Some(now),
        }
    }

    fn pause(&mut self, now: Instant) {
        if let Some(since) = self.running_since.take() {
            self.banked += now.saturating_duration_since(since);
        }
    }

    fn resume(&mut self, now: Instant) {
        self.running_since.get_or_insert(now);
    }

    fn whole_secs(&self, now: Instant) -> u32 {
        let running = self
            .running_since
            .map_or(Duration::ZERO, |since| now.saturating_duration_since(since));
        u32::try_from((self.banked + running).as_secs()).unwrap_or(u32::MAX)
    }
}

#[derive(Debug, Clone, Copy)]
struct PlayingPrompt {
    token: PromptToken,
    question_id: QuestionId,
}

//
// ─── CONTROLLER ────────────────────────────────────────────────────────────────
//

/// Drives one speaking-test attempt against its collaborators.
///
/// The controller owns the session state; every operation takes `&mut self`,
/// so commands, ticks and prompt completions are applied one at a time.
pub struct ExamController {
    clock: Clock,
    settings: SessionSettings,
    questions: Arc<dyn QuestionSource>,
    recorder: Arc<dyn Recorder>,
    prompts: Arc<dyn PromptPlayer>,
    gateway: Arc<dyn SubmissionGateway>,
    attempts: Option<Arc<dyn AttemptRepository>>,

    session: Option<ExamSession>,
    started_at: Option<DateTime<Utc>>,
    attempt_id: Option<i64>,
    notice: Option<Notice>,
    capture: Option<CaptureClock>,
    playing: Option<PlayingPrompt>,
    pending_prompt: Option<PromptTicket>,
    prompt_seq: u64,
}

impl ExamController {
    #[must_use]
    pub fn new(
        clock: Clock,
        questions: Arc<dyn QuestionSource>,
        recorder: Arc<dyn Recorder>,
        prompts: Arc<dyn PromptPlayer>,
        gateway: Arc<dyn SubmissionGateway>,
    ) -> Self {
        Self {
            clock,
            settings: SessionSettings::default(),
            questions,
            recorder,
            prompts,
            gateway,
            attempts: None,
            session: None,
            started_at: None,
            attempt_id: None,
            notice: None,
            capture: None,
            playing: None,
            pending_prompt: None,
            prompt_seq: 0,
        }
    }

    #[must_use]
    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Record finished attempts in `attempts`.
    #[must_use]
    pub fn with_attempts(mut self, attempts: Arc<dyn AttemptRepository>) -> Self {
        self.attempts = Some(attempts);
        self
    }

    fn session(&self) -> Result<&ExamSession, ExamError> {
        self.session.as_ref().ok_or(ExamError::NotInitialized)
    }

    fn session_mut(&mut self) -> Result<&mut ExamSession, ExamError> {
        self.session.as_mut().ok_or(ExamError::NotInitialized)
    }

    fn invalid(&self, action: &'static str) -> ExamError {
        let phase = self.session.as_ref().map_or("not started", |s| s.phase().name());
        ExamError::InvalidState(TransitionError::InvalidPhase { action, phase })
    }

    #[must_use]
    pub fn exam_session(&self) -> Option<&ExamSession> {
        self.session.as_ref()
    }

    /// Storage id of the persisted attempt, once the session completed.
    #[must_use]
    pub fn attempt_id(&self) -> Option<i64> {
        self.attempt_id
    }

    #[must_use]
    pub fn notice(&self) -> Option<&Notice> {
        self.notice.as_ref()
    }

    pub fn clear_notice(&mut self) {
        self.notice = None;
    }

    // ─── Loading ───────────────────────────────────────────────────────────────

    /// Fetch every question of `plan` and get ready to begin.
    ///
    /// Calling this again starts over from scratch.
    ///
    /// # Errors
    ///
    /// Returns `ExamError::Load` for an empty plan, a malformed time limit, or
    /// any question that cannot be fetched.
    pub async fn initialize(
        &mut self,
        session_id: SessionId,
        plan: ExamPlan,
        time_limit: Option<&str>,
    ) -> Result<(), ExamError> {
        self.teardown().await;
        self.session = None;
        self.started_at = None;
        self.attempt_id = None;
        self.notice = None;

        let limit = TimeLimit::parse_optional(time_limit).map_err(LoadError::from)?;
        if plan.is_empty() {
            return Err(LoadError::NoQuestions.into());
        }
        let mut session = ExamSession::new(session_id, plan, limit, self.settings)?;

        let mut seen = HashSet::new();
        let mut ids = session.plan().all_ids();
        ids.retain(|id| seen.insert(*id));
        tracing::info!(
            session_id = %session.session_id(),
            questions = ids.len(),
            time_limit_secs = limit.seconds(),
            "loading exam session"
        );

        let fetched: Result<Vec<_>, LoadError> = stream::iter(ids)
            .map(|id| {
                let source = Arc::clone(&self.questions);
                async move {
                    source
                        .get_question(id)
                        .await
                        .map_err(|source| LoadError::Fetch { id, source })
                }
            })
            .buffered(FETCH_CONCURRENCY)
            .try_collect()
            .await;
        let result = match fetched {
            Ok(questions) => session.loaded(questions).map_err(|err| match err {
                TransitionError::UnresolvedQuestion(id) => LoadError::Unresolved(id).into(),
                other => ExamError::from(other),
            }),
            Err(err) => {
                session.load_failed();
                Err(err.into())
            }
        };

        if let Err(err) = &result {
            tracing::warn!(session_id = %session.session_id(), error = %err, "exam session failed to load");
        } else {
            self.started_at = Some(self.clock.now());
        }
        self.session = Some(session);
        result
    }

    /// Land on the first question (or the Part 2 preparation window).
    ///
    /// # Errors
    ///
    /// Returns `ExamError::InvalidState` unless the session is ready.
    pub async fn begin(&mut self) -> Result<Landing, ExamError> {
        let landing = self.session_mut()?.begin()?;
        self.after_landing(landing).await;
        Ok(landing)
    }

    async fn after_landing(&mut self, landing: Landing) {
        match landing {
            Landing::Question {
                cursor,
                question_id,
            } => {
                tracing::info!(%question_id, part = cursor.part.key(), index = cursor.index, "question ready");
                self.auto_play(question_id).await;
            }
            Landing::Thinking { secs } => {
                tracing::info!(secs, "part two preparation started");
            }
        }
    }

    // ─── Recording ─────────────────────────────────────────────────────────────

    /// # Errors
    ///
    /// Returns `ExamError::InvalidState` outside an answering phase, or
    /// `ExamError::Recording` if the device refuses; the phase is unchanged then.
    pub async fn start_recording(&mut self) -> Result<(), ExamError> {
        self.session()?.check_start_recording()?;
        self.stop_prompt().await;

        let started = self.recorder.start().await;
        if let Err(err) = started {
            return Err(self.recording_failed("start", err));
        }
        self.session_mut()?.start_recording()?;
        self.capture = Some(CaptureClock::started(Instant::now()));
        tracing::debug!("recording started");
        Ok(())
    }

    /// Stop capture and store the answer for the current question.
    ///
    /// # Errors
    ///
    /// Returns `ExamError::Recording` if the device fails to stop; the
    /// session stays in `Recording` so the stop can be retried.
    pub async fn stop_recording(&mut self) -> Result<Recording, ExamError> {
        if !self.session()?.phase().is_recording() {
            return Err(self.invalid("stop recording"));
        }
        let stopped = self.recorder.stop().await;
        let audio = match stopped {
            Ok(Some(audio)) => audio,
            Ok(None) => {
                // The device lost the capture; nothing can be stored.
                self.capture = None;
                self.session_mut()?.discard_recording();
                return Err(self.recording_failed(
                    "stop",
                    RecorderError::Device("recorder returned no audio".into()),
                ));
            }
            Err(err) => return Err(self.recording_failed("stop", err)),
        };
        self.sync_capture();
        let recording = self.session_mut()?.finish_recording(audio)?.clone();
        self.capture = None;
        tracing::info!(
            question_id = %recording.question_id,
            part = recording.part.key(),
            duration_secs = recording.duration_secs,
            "answer recorded"
        );
        Ok(recording)
    }

    /// # Errors
    ///
    /// Returns `ExamError` if no unpaused recording is open or the device refuses.
    pub async fn pause_recording(&mut self) -> Result<(), ExamError> {
        if !matches!(
            self.session()?.phase(),
            Phase::Recording { paused: false, .. }
        ) {
            return Err(self.invalid("pause recording"));
        }
        let paused = self.recorder.pause().await;
        if let Err(err) = paused {
            return Err(self.recording_failed("pause", err));
        }
        self.session_mut()?.pause_recording()?;
        if let Some(capture) = self.capture.as_mut() {
            capture.pause(Instant::now());
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `ExamError` if no paused recording is open or the device refuses.
    pub async fn resume_recording(&mut self) -> Result<(), ExamError> {
        if !matches!(
            self.session()?.phase(),
            Phase::Recording { paused: true, .. }
        ) {
            return Err(self.invalid("resume recording"));
        }
        let resumed = self.recorder.resume().await;
        if let Err(err) = resumed {
            return Err(self.recording_failed("resume", err));
        }
        self.session_mut()?.resume_recording()?;
        if let Some(capture) = self.capture.as_mut() {
            capture.resume(Instant::now());
        }
        Ok(())
    }

    fn recording_failed(&mut self, action: &'static str, err: RecorderError) -> ExamError {
        tracing::warn!(action, error = %err, "recorder failed");
        self.notice = Some(Notice::RecordingFailed {
            message: err.to_string(),
        });
        ExamError::Recording(err)
    }

    fn sync_capture(&mut self) {
        let (Some(capture), Some(session)) = (self.capture, self.session.as_mut()) else {
            return;
        };
        session.record_elapsed(capture.whole_secs(Instant::now()));
    }

    // ─── Navigation ────────────────────────────────────────────────────────────

    async fn stop_if_recording(&mut self) -> Result<(), ExamError> {
        if self.session()?.phase().is_recording() {
            self.stop_recording().await?;
        }
        Ok(())
    }

    /// Move on, stopping and storing an open recording first.
    ///
    /// Passing the last question submits the attempt.
    ///
    /// # Errors
    ///
    /// Returns `ExamError` if the open recording cannot be stopped, the move is
    /// not allowed, or the final submission fails.
    pub async fn advance_question(&mut self) -> Result<Advanced, ExamError> {
        self.stop_if_recording().await?;
        match self.session_mut()?.advance()? {
            Advance::Landed(landing) => {
                self.stop_prompt().await;
                self.after_landing(landing).await;
                Ok(Advanced::Landed(landing))
            }
            Advance::Exhausted => Ok(Advanced::Submitted(self.submit(false).await?)),
        }
    }

    /// Move back one question, stopping and storing an open recording first.
    ///
    /// # Errors
    ///
    /// Returns `ExamError` if the open recording cannot be stopped or the move
    /// is not allowed.
    pub async fn previous_question(&mut self) -> Result<Retreat, ExamError> {
        self.stop_if_recording().await?;
        let retreat = self.session_mut()?.retreat()?;
        if let Retreat::Landed(landing) = retreat {
            self.stop_prompt().await;
            self.after_landing(landing).await;
        }
        Ok(retreat)
    }

    /// End the Part 2 preparation window early and play the prompt.
    ///
    /// # Errors
    ///
    /// Returns `ExamError::InvalidState` unless preparing.
    pub async fn skip_thinking(&mut self) -> Result<QuestionId, ExamError> {
        let question_id = self.session_mut()?.skip_thinking()?;
        tracing::info!(%question_id, "preparation skipped");
        self.auto_play(question_id).await;
        Ok(question_id)
    }

    // ─── Prompts ───────────────────────────────────────────────────────────────

    /// Read the current question aloud.
    ///
    /// # Errors
    ///
    /// Returns `ExamError::InvalidState` while preparing or recording, and
    /// `ExamError::PromptPlayback` if the player cannot start.
    pub async fn play_prompt(&mut self) -> Result<PromptToken, ExamError> {
        let session = self.session()?;
        if !session.is_answering() {
            return Err(self.invalid("play the prompt"));
        }
        let question_id = session
            .current_question_id()
            .ok_or_else(|| self.invalid("play the prompt"))?;
        self.speak(question_id).await
    }

    /// Stop prompt playback. Safe when nothing is playing.
    pub async fn stop_prompt(&mut self) {
        if self.playing.take().is_some() {
            self.pending_prompt = None;
            self.prompts.stop().await;
        }
    }

    /// Report how a started prompt ended.
    ///
    /// Completions of superseded prompts are ignored.
    pub fn prompt_finished(&mut self, token: PromptToken, end: PromptEnd) {
        let Some(playing) = self.playing else {
            return;
        };
        if playing.token != token {
            return;
        }
        self.playing = None;
        match end {
            PromptEnd::Done => {
                if let Some(session) = self.session.as_mut() {
                    session.mark_listened(playing.question_id);
                }
            }
            PromptEnd::Stopped => {}
            PromptEnd::Failed(message) => {
                tracing::warn!(question_id = %playing.question_id, %message, "prompt playback failed");
                self.notice = Some(Notice::PromptFailed { message });
            }
        }
    }

    /// Hand out the most recently started prompt so the caller can await it.
    pub fn take_prompt(&mut self) -> Option<PromptTicket> {
        self.pending_prompt.take()
    }

    #[must_use]
    pub fn is_prompt_playing(&self) -> bool {
        self.playing.is_some()
    }

    async fn auto_play(&mut self, question_id: QuestionId) {
        // Playback problems never block the attempt.
        if let Err(err) = self.speak(question_id).await {
            tracing::debug!(%question_id, error = %err, "auto-play skipped");
        }
    }

    async fn speak(&mut self, question_id: QuestionId) -> Result<PromptToken, ExamError> {
        let text = self
            .session()?
            .question(question_id)
            .map(|q| q.text().to_string())
            .ok_or(TransitionError::UnresolvedQuestion(question_id))?;
        self.stop_prompt().await;

        let started = self.prompts.speak(&text).await;
        let completion = match started {
            Ok(completion) => completion,
            Err(err) => {
                tracing::warn!(%question_id, error = %err, "prompt playback failed to start");
                self.notice = Some(Notice::PromptFailed {
                    message: err.to_string(),
                });
                return Err(err.into());
            }
        };
        self.prompt_seq += 1;
        let token = PromptToken(self.prompt_seq);
        self.playing = Some(PlayingPrompt { token, question_id });
        self.pending_prompt = Some(PromptTicket {
            token,
            question_id,
            completion,
        });
        Ok(token)
    }

    // ─── Heartbeat ─────────────────────────────────────────────────────────────

    /// Advance every one-second timer.
    ///
    /// When the exam clock runs out, an open recording is stopped and stored
    /// and the attempt is submitted before this returns.
    ///
    /// # Errors
    ///
    /// Returns the forced submission's error after expiry.
    pub async fn tick(&mut self) -> Result<TickOutcome, ExamError> {
        self.sync_capture();
        let Some(session) = self.session.as_mut() else {
            return Ok(TickOutcome {
                clock: ClockTick::Idle,
                thinking: ThinkingTick::Idle,
                submitted: None,
            });
        };
        let thinking = session.tick_thinking();
        let clock = session.tick_exam_clock();

        if let ThinkingTick::Finished { question_id } = thinking {
            tracing::info!(%question_id, "preparation time over");
            if clock != ClockTick::Expired {
                self.auto_play(question_id).await;
            }
        }

        let mut submitted = None;
        match clock {
            ClockTick::Warning { remaining } => {
                tracing::info!(remaining_secs = remaining, "exam time warning");
                self.notice = Some(Notice::TimeWarning {
                    remaining_secs: remaining,
                });
            }
            ClockTick::Expired => {
                tracing::info!("exam time is up");
                submitted = Some(self.expire().await?);
            }
            ClockTick::Idle | ClockTick::Counting { .. } => {}
        }

        Ok(TickOutcome {
            clock,
            thinking,
            submitted,
        })
    }

    async fn expire(&mut self) -> Result<SubmissionReport, ExamError> {
        if self.session()?.phase().is_recording() {
            let stopped = self.stop_recording().await;
            if let Err(err) = stopped {
                tracing::warn!(error = %err, "could not keep the open answer at expiry");
                self.recorder.discard().await;
                self.capture = None;
                self.session_mut()?.discard_recording();
            }
        }
        self.submit(false).await
    }

    // ─── Submission ────────────────────────────────────────────────────────────

    /// Upload every recording and close the attempt.
    ///
    /// # Errors
    ///
    /// Returns `ExamError::EmptySubmissionConfirmationRequired` when nothing was
    /// recorded and `confirm_empty` is false, and `ExamError::Submission` when
    /// the upload fails (the attempt can be submitted again).
    pub async fn submit(&mut self, confirm_empty: bool) -> Result<SubmissionReport, ExamError> {
        self.stop_if_recording().await?;
        self.stop_prompt().await;

        if self.session()?.recordings().is_empty() {
            if !confirm_empty {
                self.session()?.check_submit()?;
                self.notice = Some(Notice::ConfirmEmptySubmission);
                return Err(ExamError::EmptySubmissionConfirmationRequired);
            }
            self.session_mut()?.complete_empty()?;
            tracing::info!(session_id = %self.session()?.session_id(), "empty attempt submitted");
            self.record_attempt().await;
            return Ok(SubmissionReport::default());
        }

        let plan = self.session_mut()?.begin_submission()?;
        tracing::info!(
            session_id = %plan.session_id,
            parts = plan.parts.len(),
            "submitting attempt"
        );
        match submit_plan(self.gateway.as_ref(), &plan).await {
            Ok(report) => {
                self.session_mut()?.submission_succeeded()?;
                tracing::info!(
                    session_id = %plan.session_id,
                    answers = report.uploaded_count(),
                    "attempt submitted"
                );
                self.record_attempt().await;
                Ok(report)
            }
            Err(err) => {
                self.session_mut()?.submission_failed()?;
                tracing::warn!(session_id = %plan.session_id, error = %err, "submission failed");
                self.notice = Some(Notice::SubmissionFailed {
                    message: err.to_string(),
                });
                Err(err.into())
            }
        }
    }

    async fn record_attempt(&mut self) {
        let Some(attempts) = self.attempts.clone() else {
            return;
        };
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let completed_at = self.clock.now();
        let started_at = self.started_at.unwrap_or(completed_at);
        let summary = match AttemptSummary::from_recordings(
            session.session_id().clone(),
            started_at,
            completed_at,
            session.recordings(),
            session.is_expired(),
        ) {
            Ok(summary) => summary,
            Err(err) => {
                tracing::warn!(error = %err, "attempt summary rejected");
                return;
            }
        };
        match attempts.append_attempt(&summary).await {
            Ok(id) => self.attempt_id = Some(id),
            Err(err) => tracing::warn!(error = %err, "failed to record attempt"),
        }
    }

    // ─── Lifecycle ─────────────────────────────────────────────────────────────

    /// Release the audio devices. Safe to call repeatedly.
    pub async fn teardown(&mut self) {
        self.playing = None;
        self.pending_prompt = None;
        self.prompts.stop().await;
        self.recorder.discard().await;
        self.capture = None;
        if let Some(session) = self.session.as_mut() {
            if session.discard_recording() {
                tracing::debug!("open recording discarded");
            }
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        match &self.session {
            Some(session) => {
                SessionSnapshot::of(session, self.playing.is_some(), self.notice.clone())
            }
            None => SessionSnapshot {
                notice: self.notice.clone(),
                ..SessionSnapshot::idle()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GatewayError, PromptError, SubmissionError};
    use crate::in_memory::{
        CallLog, InMemoryGateway, InMemoryQuestionSource, ScriptedRecorder, SilentPromptPlayer,
    };
    use exam_core::model::{Cursor, Part, Question, TopicMeta};
    use exam_core::session::FailedStage;
    use exam_core::time::fixed_clock;
    use storage::repository::InMemoryRepository;

    struct Harness {
        log: CallLog,
        source: InMemoryQuestionSource,
        recorder: ScriptedRecorder,
        player: SilentPromptPlayer,
        gateway: InMemoryGateway,
        attempts: InMemoryRepository,
    }

    impl Harness {
        fn new(plan: &ExamPlan) -> Self {
            let log = CallLog::new();
            let questions = Part::ALL.iter().flat_map(|part| {
                plan.question_ids(*part).iter().map(move |id| {
                    Question::new(*id, *part, format!("Question {id}"), TopicMeta::default())
                        .unwrap()
                })
            });
            Self {
                source: InMemoryQuestionSource::new(questions.collect::<Vec<_>>()),
                recorder: ScriptedRecorder::new().with_log(log.clone()),
                player: SilentPromptPlayer::held().with_log(log.clone()),
                gateway: InMemoryGateway::new().with_log(log.clone()),
                attempts: InMemoryRepository::new(),
                log,
            }
        }

        fn controller(&self) -> ExamController {
            ExamController::new(
                fixed_clock(),
                Arc::new(self.source.clone()),
                Arc::new(self.recorder.clone()),
                Arc::new(self.player.clone()),
                Arc::new(self.gateway.clone()),
            )
            .with_attempts(Arc::new(self.attempts.clone()))
        }
    }

    async fn ready(plan: ExamPlan, limit: &str) -> (Harness, ExamController) {
        let harness = Harness::new(&plan);
        let mut controller = harness.controller();
        controller
            .initialize(SessionId::from(981_u64), plan, Some(limit))
            .await
            .unwrap();
        (harness, controller)
    }

    async fn record_for(controller: &mut ExamController, secs: u32) {
        controller.start_recording().await.unwrap();
        for _ in 0..secs {
            tokio::time::advance(Duration::from_secs(1)).await;
            controller.tick().await.unwrap();
        }
    }

    fn phase(controller: &ExamController) -> Phase {
        controller.exam_session().unwrap().phase()
    }

    #[tokio::test(start_paused = true)]
    async fn timed_session_starts_at_first_question() {
        let (_h, controller) = ready(ExamPlan::from_raw(&[101, 102], &[201], &[]), "12min").await;
        let session = controller.exam_session().unwrap();
        assert_eq!(session.remaining_secs(), 720);
        assert_eq!(session.cursor(), Some(Cursor::new(Part::One, 0)));
        assert_eq!(session.phase(), Phase::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn practice_mode_never_counts_down() {
        let (_h, mut controller) = ready(ExamPlan::from_raw(&[101], &[], &[]), "0min").await;
        controller.begin().await.unwrap();
        for _ in 0..300 {
            let outcome = controller.tick().await.unwrap();
            assert_eq!(outcome.clock, ClockTick::Idle);
        }
        assert_eq!(controller.exam_session().unwrap().remaining_secs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_plan_fails_before_any_timer() {
        let harness = Harness::new(&ExamPlan::default());
        let mut controller = harness.controller();
        let err = controller
            .initialize(SessionId::from(1_u64), ExamPlan::default(), Some("12min"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExamError::Load(LoadError::NoQuestions)));
        assert!(controller.exam_session().is_none());
        assert_eq!(controller.tick().await.unwrap().clock, ClockTick::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_time_limit_is_a_load_error() {
        let plan = ExamPlan::from_raw(&[101], &[], &[]);
        let harness = Harness::new(&plan);
        let mut controller = harness.controller();
        let err = controller
            .initialize(SessionId::from(1_u64), plan, Some("twelve minutes"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExamError::Load(LoadError::InvalidTimeLimit(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_fails_the_load_and_retry_starts_over() {
        let plan = ExamPlan::from_raw(&[101, 102], &[], &[]);
        let harness = Harness::new(&plan);
        harness.source.fail(QuestionId::new(102));
        let mut controller = harness.controller();

        let err = controller
            .initialize(SessionId::from(1_u64), plan.clone(), Some("5min"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(
            err,
            ExamError::Load(LoadError::Fetch { id, .. }) if id == QuestionId::new(102)
        ));
        assert_eq!(
            phase(&controller),
            Phase::Failed {
                stage: FailedStage::Load
            }
        );
        assert_eq!(controller.tick().await.unwrap().clock, ClockTick::Idle);

        harness.source.heal(QuestionId::new(102));
        controller
            .initialize(SessionId::from(1_u64), plan, Some("5min"))
            .await
            .unwrap();
        assert_eq!(phase(&controller), Phase::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_question_is_fetched_once() {
        let (h, controller) =
            ready(ExamPlan::from_raw(&[101, 102, 101], &[], &[102]), "5min").await;

        assert_eq!(h.source.fetch_count(), 2);
        let session = controller.exam_session().unwrap();
        assert_eq!(session.plan().total(), 4);
        assert_eq!(
            session.question(QuestionId::new(101)).map(Question::text),
            Some("Question 101")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn begin_auto_plays_the_first_prompt() {
        let (h, mut controller) = ready(ExamPlan::from_raw(&[101], &[], &[]), "0min").await;
        controller.begin().await.unwrap();
        assert_eq!(h.player.spoken(), vec!["Question 101"]);

        let ticket = controller.take_prompt().unwrap();
        h.player.finish_current(PromptEnd::Done);
        let (token, end) = ticket.wait().await;
        controller.prompt_finished(token, end);
        assert!(controller.exam_session().unwrap().listened(QuestionId::new(101)));
        assert!(controller.snapshot().listened);
    }

    #[tokio::test(start_paused = true)]
    async fn recording_stops_prompt_playback_first() {
        let (h, mut controller) = ready(ExamPlan::from_raw(&[101], &[], &[]), "0min").await;
        controller.begin().await.unwrap();
        h.log.clear();

        controller.start_recording().await.unwrap();
        assert_eq!(h.log.entries(), vec!["tts:stop", "recorder:start"]);
        assert!(!controller.is_prompt_playing());
        assert!(controller.play_prompt().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn one_answer_of_five_seconds_is_stored() {
        let (_h, mut controller) = ready(ExamPlan::from_raw(&[101], &[], &[]), "0min").await;
        controller.begin().await.unwrap();
        record_for(&mut controller, 5).await;
        let recording = controller.stop_recording().await.unwrap();

        assert_eq!(recording.duration_secs, 5);
        assert_eq!(recording.question_id, QuestionId::new(101));
        let report = controller.submit(false).await.unwrap();
        assert_eq!(report.uploaded_count(), 1);
        assert_eq!(phase(&controller), Phase::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn duration_counts_capture_time_not_heartbeats() {
        let (_h, mut controller) = ready(ExamPlan::from_raw(&[101], &[], &[]), "0min").await;
        controller.begin().await.unwrap();
        tokio::time::advance(Duration::from_millis(900)).await;
        controller.start_recording().await.unwrap();
        tokio::time::advance(Duration::from_millis(100)).await;
        controller.tick().await.unwrap();
        tokio::time::advance(Duration::from_millis(1_100)).await;

        let recording = controller.stop_recording().await.unwrap();
        assert_eq!(recording.duration_secs, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_time_is_left_out_of_the_duration() {
        let (_h, mut controller) = ready(ExamPlan::from_raw(&[101], &[], &[]), "0min").await;
        controller.begin().await.unwrap();
        controller.start_recording().await.unwrap();
        tokio::time::advance(Duration::from_millis(1_500)).await;
        controller.pause_recording().await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        controller.tick().await.unwrap();
        controller.resume_recording().await.unwrap();
        tokio::time::advance(Duration::from_millis(700)).await;

        let recording = controller.stop_recording().await.unwrap();
        assert_eq!(recording.duration_secs, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rerecording_keeps_a_single_answer() {
        let (h, mut controller) = ready(ExamPlan::from_raw(&[101], &[], &[]), "0min").await;
        controller.begin().await.unwrap();
        record_for(&mut controller, 2).await;
        controller.stop_recording().await.unwrap();
        record_for(&mut controller, 4).await;
        controller.stop_recording().await.unwrap();

        let recordings = controller.exam_session().unwrap().recordings();
        assert_eq!(recordings.len(), 1);
        let stored = recordings.get(QuestionId::new(101)).unwrap();
        assert_eq!(stored.duration_secs, 4);
        assert_eq!(stored.audio.handle(), "take-2");
        assert_eq!(h.recorder.takes(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn advancing_stops_and_stores_the_open_recording() {
        let (h, mut controller) = ready(ExamPlan::from_raw(&[101, 102], &[], &[]), "0min").await;
        controller.begin().await.unwrap();
        record_for(&mut controller, 3).await;
        h.log.clear();

        let advanced = controller.advance_question().await.unwrap();

        assert!(matches!(
            advanced,
            Advanced::Landed(Landing::Question { question_id, .. }) if question_id == QuestionId::new(102)
        ));
        assert_eq!(h.log.entries()[0], "recorder:stop");
        let stored = controller
            .exam_session()
            .unwrap()
            .recordings()
            .get(QuestionId::new(101))
            .cloned()
            .unwrap();
        assert_eq!(stored.duration_secs, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_stop_aborts_the_advance() {
        let (h, mut controller) = ready(ExamPlan::from_raw(&[101, 102], &[], &[]), "0min").await;
        controller.begin().await.unwrap();
        record_for(&mut controller, 1).await;
        h.recorder
            .fail_next_stop(RecorderError::Device("disk full".into()));

        let err = controller.advance_question().await.unwrap_err();

        assert!(err.is_transient());
        assert!(phase(&controller).is_recording());
        assert_eq!(
            controller.exam_session().unwrap().cursor(),
            Some(Cursor::new(Part::One, 0))
        );
        assert!(matches!(
            controller.snapshot().notice,
            Some(Notice::RecordingFailed { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn refused_microphone_leaves_phase_unchanged() {
        let (h, mut controller) = ready(ExamPlan::from_raw(&[101], &[], &[]), "0min").await;
        controller.begin().await.unwrap();
        h.recorder.fail_next_start(RecorderError::PermissionDenied);

        let err = controller.start_recording().await.unwrap_err();

        assert!(matches!(err, ExamError::Recording(RecorderError::PermissionDenied)));
        assert_eq!(phase(&controller), Phase::AwaitingAnswer);
    }

    #[tokio::test(start_paused = true)]
    async fn prompt_failure_is_not_fatal() {
        let (h, mut controller) = ready(ExamPlan::from_raw(&[101, 102], &[], &[]), "0min").await;
        h.player.fail_next(PromptError::Unavailable);
        controller.begin().await.unwrap();

        assert!(matches!(
            controller.snapshot().notice,
            Some(Notice::PromptFailed { .. })
        ));
        controller.start_recording().await.unwrap();
        assert!(phase(&controller).is_recording());
    }

    #[tokio::test(start_paused = true)]
    async fn part_two_preparation_runs_once_then_plays_prompt() {
        let (h, mut controller) = ready(ExamPlan::from_raw(&[101], &[201], &[]), "0min").await;
        controller.begin().await.unwrap();
        let advanced = controller.advance_question().await.unwrap();
        assert_eq!(advanced, Advanced::Landed(Landing::Thinking { secs: 60 }));
        assert!(controller.snapshot().question_text.is_none());
        assert!(controller.play_prompt().await.is_err());

        for _ in 0..59 {
            controller.tick().await.unwrap();
        }
        let outcome = controller.tick().await.unwrap();
        assert_eq!(
            outcome.thinking,
            ThinkingTick::Finished {
                question_id: QuestionId::new(201)
            }
        );
        assert_eq!(h.player.spoken().last().unwrap(), "Question 201");

        controller.previous_question().await.unwrap();
        let again = controller.advance_question().await.unwrap();
        assert!(matches!(again, Advanced::Landed(Landing::Question { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn skipping_preparation_plays_the_prompt() {
        let (h, mut controller) = ready(ExamPlan::from_raw(&[], &[201], &[]), "0min").await;
        assert_eq!(
            controller.begin().await.unwrap(),
            Landing::Thinking { secs: 60 }
        );
        controller.skip_thinking().await.unwrap();
        assert_eq!(phase(&controller), Phase::AwaitingAnswer);
        assert_eq!(h.player.spoken(), vec!["Question 201"]);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_stops_recording_and_submits() {
        let (h, mut controller) = ready(ExamPlan::from_raw(&[101, 102], &[], &[]), "3min").await;
        controller.begin().await.unwrap();
        controller.start_recording().await.unwrap();

        let mut warnings = 0;
        let mut last = None;
        for _ in 0..180 {
            let outcome = controller.tick().await.unwrap();
            if matches!(outcome.clock, ClockTick::Warning { .. }) {
                warnings += 1;
            }
            last = Some(outcome);
        }
        let last = last.unwrap();

        assert_eq!(warnings, 1);
        assert_eq!(last.clock, ClockTick::Expired);
        assert_eq!(last.submitted.unwrap().uploaded_count(), 1);
        assert_eq!(phase(&controller), Phase::Complete);
        assert_eq!(h.gateway.uploaded().len(), 1);
        assert!(matches!(
            controller.advance_question().await,
            Err(ExamError::InvalidState(_))
        ));
        assert_eq!(controller.attempt_id(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_with_no_answers_asks_for_confirmation() {
        let (_h, mut controller) = ready(ExamPlan::from_raw(&[101], &[], &[]), "1min").await;
        controller.begin().await.unwrap();
        for _ in 0..59 {
            controller.tick().await.unwrap();
        }
        let err = controller.tick().await.unwrap_err();
        assert!(matches!(err, ExamError::EmptySubmissionConfirmationRequired));
        assert!(matches!(
            controller.start_recording().await,
            Err(ExamError::InvalidState(TransitionError::TimeExpired))
        ));

        let report = controller.submit(true).await.unwrap();
        assert!(report.is_empty());
        assert_eq!(phase(&controller), Phase::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_submission_needs_confirmation() {
        let (h, mut controller) = ready(ExamPlan::from_raw(&[101], &[], &[]), "0min").await;
        controller.begin().await.unwrap();

        let err = controller.submit(false).await.unwrap_err();
        assert!(matches!(err, ExamError::EmptySubmissionConfirmationRequired));
        assert_eq!(phase(&controller), Phase::AwaitingAnswer);
        assert_eq!(
            controller.snapshot().notice,
            Some(Notice::ConfirmEmptySubmission)
        );

        controller.submit(true).await.unwrap();
        assert_eq!(phase(&controller), Phase::Complete);
        assert!(h.log.filtered("gateway:").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn passing_the_last_question_submits() {
        let (h, mut controller) = ready(ExamPlan::from_raw(&[101], &[], &[301]), "0min").await;
        controller.begin().await.unwrap();
        record_for(&mut controller, 2).await;
        controller.advance_question().await.unwrap();
        record_for(&mut controller, 2).await;

        let advanced = controller.advance_question().await.unwrap();

        let Advanced::Submitted(report) = advanced else {
            panic!("expected submission, got {advanced:?}");
        };
        let parts: Vec<Part> = report.parts.iter().map(|p| p.part).collect();
        assert_eq!(parts, vec![Part::One, Part::Three]);
        assert!(h.log.filtered("gateway:targets:part2").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_upload_can_be_resubmitted_in_full() {
        let (h, mut controller) = ready(ExamPlan::from_raw(&[101, 102], &[], &[]), "0min").await;
        controller.begin().await.unwrap();
        record_for(&mut controller, 1).await;
        controller.advance_question().await.unwrap();
        record_for(&mut controller, 1).await;
        controller.stop_recording().await.unwrap();
        h.gateway.fail_transfer_for(Some(QuestionId::new(102)));

        let err = controller.submit(false).await.unwrap_err();
        assert!(matches!(
            err,
            ExamError::Submission(SubmissionError::Transfer { .. })
        ));
        assert_eq!(
            phase(&controller),
            Phase::Failed {
                stage: FailedStage::Submission
            }
        );
        assert_eq!(controller.exam_session().unwrap().recordings().len(), 2);

        h.gateway.fail_transfer_for(None);
        h.log.clear();
        controller.submit(false).await.unwrap();
        assert_eq!(
            h.log.filtered("gateway:transfer"),
            vec![
                "gateway:transfer:981/part1/101.m4a",
                "gateway:transfer:981/part1/102.m4a",
            ]
        );
        assert_eq!(phase(&controller), Phase::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn completed_attempt_is_recorded() {
        let (h, mut controller) = ready(ExamPlan::from_raw(&[101], &[201], &[]), "0min").await;
        controller.begin().await.unwrap();
        record_for(&mut controller, 4).await;
        controller.submit(false).await.unwrap();

        let id = controller.attempt_id().unwrap();
        let summary = h.attempts.get_attempt(id).await.unwrap();
        assert_eq!(summary.session_id().as_str(), "981");
        assert_eq!(summary.recordings_in(Part::One), 1);
        assert_eq!(summary.total_recorded_secs(), 4);
        assert!(!summary.expired());
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_discards_open_recording_and_stops_prompt() {
        let (h, mut controller) = ready(ExamPlan::from_raw(&[101], &[], &[]), "0min").await;
        controller.begin().await.unwrap();
        record_for(&mut controller, 2).await;
        h.log.clear();

        controller.teardown().await;
        controller.teardown().await;

        assert_eq!(h.log.filtered("recorder:"), vec!["recorder:discard"]);
        assert!(controller.exam_session().unwrap().recordings().is_empty());
        assert_eq!(phase(&controller), Phase::AwaitingAnswer);
        assert!(!h.recorder.status().is_recording);
    }

    #[tokio::test(start_paused = true)]
    async fn late_prompt_completion_is_ignored() {
        let (h, mut controller) = ready(ExamPlan::from_raw(&[101, 102], &[], &[]), "0min").await;
        controller.begin().await.unwrap();
        let first = controller.take_prompt().unwrap();
        controller.advance_question().await.unwrap();
        h.player.finish_current(PromptEnd::Done);

        let (token, end) = first.wait().await;
        controller.prompt_finished(token, end);
        assert!(controller.is_prompt_playing());
        assert!(!controller.exam_session().unwrap().listened(QuestionId::new(101)));
    }

    #[tokio::test(start_paused = true)]
    async fn gateway_errors_surface_per_part() {
        let (h, mut controller) = ready(ExamPlan::from_raw(&[101], &[201], &[]), "0min").await;
        controller.begin().await.unwrap();
        record_for(&mut controller, 1).await;
        h.gateway.fail_confirm_for(Some(Part::One));

        let err = controller.submit(false).await.unwrap_err();
        let ExamError::Submission(SubmissionError::Confirm { part, source }) = err else {
            panic!("expected confirm failure");
        };
        assert_eq!(part, Part::One);
        assert!(matches!(source, GatewayError::Rejected(_)));
    }
}
