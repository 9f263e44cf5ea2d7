//! In-memory collaborators for testing and prototyping.
//!
//! Every double can share a [`CallLog`] so tests can assert on the interleaving
//! of recorder, prompt and gateway calls.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use exam_core::model::{AudioResource, AudioUri, Part, Question, QuestionId, SessionId};

use crate::capabilities::{
    PromptCompletion, PromptEnd, PromptPlayer, PromptSignal, QuestionSource, Recorder,
    RecorderStatus, SubmissionGateway, UploadTarget,
};
use crate::error::{GatewayError, PromptError, RecorderError};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared, ordered record of collaborator calls.
#[derive(Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        lock(&self.entries).push(entry.into());
    }

    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        lock(&self.entries).clone()
    }

    /// Entries starting with `prefix`, in call order.
    #[must_use]
    pub fn filtered(&self, prefix: &str) -> Vec<String> {
        lock(&self.entries)
            .iter()
            .filter(|e| e.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}

//
// ─── RECORDER ──────────────────────────────────────────────────────────────────
//

#[derive(Default)]
struct RecorderState {
    status: RecorderStatus,
    takes: u32,
    fail_start: Option<RecorderError>,
    fail_stop: Option<RecorderError>,
}

/// Recorder that produces numbered in-memory takes.
#[derive(Clone, Default)]
pub struct ScriptedRecorder {
    state: Arc<Mutex<RecorderState>>,
    log: CallLog,
}

impl ScriptedRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }

    pub fn fail_next_start(&self, err: RecorderError) {
        lock(&self.state).fail_start = Some(err);
    }

    pub fn fail_next_stop(&self, err: RecorderError) {
        lock(&self.state).fail_stop = Some(err);
    }

    /// Number of captures that were finalized.
    #[must_use]
    pub fn takes(&self) -> u32 {
        lock(&self.state).takes
    }
}

#[async_trait]
impl Recorder for ScriptedRecorder {
    async fn start(&self) -> Result<(), RecorderError> {
        let mut state = lock(&self.state);
        if let Some(err) = state.fail_start.take() {
            self.log.push("recorder:start:failed");
            return Err(err);
        }
        state.status = RecorderStatus {
            is_recording: true,
            is_paused: false,
        };
        self.log.push("recorder:start");
        Ok(())
    }

    async fn pause(&self) -> Result<(), RecorderError> {
        let mut state = lock(&self.state);
        if !state.status.is_recording {
            return Err(RecorderError::Device("not recording".into()));
        }
        state.status.is_paused = true;
        self.log.push("recorder:pause");
        Ok(())
    }

    async fn resume(&self) -> Result<(), RecorderError> {
        let mut state = lock(&self.state);
        if !state.status.is_recording {
            return Err(RecorderError::Device("not recording".into()));
        }
        state.status.is_paused = false;
        self.log.push("recorder:resume");
        Ok(())
    }

    async fn stop(&self) -> Result<Option<AudioResource>, RecorderError> {
        let mut state = lock(&self.state);
        if !state.status.is_recording {
            return Ok(None);
        }
        if let Some(err) = state.fail_stop.take() {
            self.log.push("recorder:stop:failed");
            return Err(err);
        }
        state.status = RecorderStatus::default();
        state.takes += 1;
        let handle = format!("take-{}", state.takes);
        let uri = AudioUri::from_file(format!("memory/{handle}.m4a"))
            .map_err(|e| RecorderError::Device(e.to_string()))?;
        let audio =
            AudioResource::new(handle, uri).map_err(|e| RecorderError::Device(e.to_string()))?;
        self.log.push("recorder:stop");
        Ok(Some(audio))
    }

    async fn discard(&self) {
        let mut state = lock(&self.state);
        if state.status.is_recording {
            self.log.push("recorder:discard");
        }
        state.status = RecorderStatus::default();
    }

    fn status(&self) -> RecorderStatus {
        lock(&self.state).status
    }
}

//
// ─── PROMPT PLAYER ─────────────────────────────────────────────────────────────
//

#[derive(Default)]
struct PlayerState {
    playing: Option<PromptSignal>,
    spoken: Vec<String>,
    fail_next: Option<PromptError>,
}

/// Prompt player that either finishes instantly or holds playback open until
/// stopped or finished by hand.
#[derive(Clone, Default)]
pub struct SilentPromptPlayer {
    state: Arc<Mutex<PlayerState>>,
    hold: bool,
    log: CallLog,
}

impl SilentPromptPlayer {
    /// Every prompt completes with `Done` as soon as it starts.
    #[must_use]
    pub fn instant() -> Self {
        Self::default()
    }

    /// Prompts stay "playing" until `stop` or `finish_current`.
    #[must_use]
    pub fn held() -> Self {
        Self {
            hold: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }

    pub fn fail_next(&self, err: PromptError) {
        lock(&self.state).fail_next = Some(err);
    }

    /// Ends the held prompt, if any.
    pub fn finish_current(&self, end: PromptEnd) {
        if let Some(signal) = lock(&self.state).playing.take() {
            signal.finish(end);
        }
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        lock(&self.state).playing.is_some()
    }

    /// Texts passed to `speak`, in order.
    #[must_use]
    pub fn spoken(&self) -> Vec<String> {
        lock(&self.state).spoken.clone()
    }
}

#[async_trait]
impl PromptPlayer for SilentPromptPlayer {
    async fn speak(&self, text: &str) -> Result<PromptCompletion, PromptError> {
        let mut state = lock(&self.state);
        if let Some(err) = state.fail_next.take() {
            self.log.push("tts:speak:failed");
            return Err(err);
        }
        if let Some(previous) = state.playing.take() {
            previous.finish(PromptEnd::Stopped);
        }
        state.spoken.push(text.to_string());
        self.log.push("tts:speak");
        if !self.hold {
            return Ok(PromptCompletion::finished(PromptEnd::Done));
        }
        let (signal, completion) = PromptCompletion::channel();
        state.playing = Some(signal);
        Ok(completion)
    }

    async fn stop(&self) {
        if let Some(signal) = lock(&self.state).playing.take() {
            signal.finish(PromptEnd::Stopped);
            self.log.push("tts:stop");
        }
    }
}

//
// ─── QUESTIONS ─────────────────────────────────────────────────────────────────
//

/// Question source backed by a map, with per-id failure injection.
#[derive(Clone, Default)]
pub struct InMemoryQuestionSource {
    questions: Arc<Mutex<HashMap<QuestionId, Question>>>,
    failing: Arc<Mutex<HashSet<QuestionId>>>,
    fetches: Arc<Mutex<u32>>,
}

impl InMemoryQuestionSource {
    #[must_use]
    pub fn new(questions: impl IntoIterator<Item = Question>) -> Self {
        let map = questions.into_iter().map(|q| (q.id(), q)).collect();
        Self {
            questions: Arc::new(Mutex::new(map)),
            ..Self::default()
        }
    }

    pub fn fail(&self, id: QuestionId) {
        lock(&self.failing).insert(id);
    }

    pub fn heal(&self, id: QuestionId) {
        lock(&self.failing).remove(&id);
    }

    #[must_use]
    pub fn fetch_count(&self) -> u32 {
        *lock(&self.fetches)
    }
}

#[async_trait]
impl QuestionSource for InMemoryQuestionSource {
    async fn get_question(&self, id: QuestionId) -> Result<Question, GatewayError> {
        *lock(&self.fetches) += 1;
        if lock(&self.failing).contains(&id) {
            return Err(GatewayError::Rejected(format!("question {id} unavailable")));
        }
        lock(&self.questions)
            .get(&id)
            .cloned()
            .ok_or_else(|| GatewayError::Rejected(format!("question {id} not found")))
    }
}

//
// ─── GATEWAY ───────────────────────────────────────────────────────────────────
//

#[derive(Default)]
struct GatewayState {
    fail_transfer: Option<QuestionId>,
    no_targets: Option<Part>,
    fail_confirm: Option<Part>,
    uploaded: BTreeMap<String, String>,
    confirmed: Vec<(Part, BTreeMap<QuestionId, String>)>,
}

/// Gateway that accepts uploads into a map and logs each protocol step.
#[derive(Clone, Default)]
pub struct InMemoryGateway {
    state: Arc<Mutex<GatewayState>>,
    log: CallLog,
}

impl InMemoryGateway {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }

    pub fn fail_transfer_for(&self, id: Option<QuestionId>) {
        lock(&self.state).fail_transfer = id;
    }

    pub fn return_no_targets_for(&self, part: Option<Part>) {
        lock(&self.state).no_targets = part;
    }

    pub fn fail_confirm_for(&self, part: Option<Part>) {
        lock(&self.state).fail_confirm = part;
    }

    /// Storage path → audio handle for every transferred answer.
    #[must_use]
    pub fn uploaded(&self) -> BTreeMap<String, String> {
        lock(&self.state).uploaded.clone()
    }

    #[must_use]
    pub fn confirmed(&self) -> Vec<(Part, BTreeMap<QuestionId, String>)> {
        lock(&self.state).confirmed.clone()
    }
}

#[async_trait]
impl SubmissionGateway for InMemoryGateway {
    async fn request_upload_targets(
        &self,
        session_id: &SessionId,
        part: Part,
        question_ids: &[QuestionId],
    ) -> Result<HashMap<QuestionId, UploadTarget>, GatewayError> {
        let ids: Vec<String> = question_ids.iter().map(ToString::to_string).collect();
        self.log
            .push(format!("gateway:targets:{}:{}", part.key(), ids.join(",")));
        if lock(&self.state).no_targets == Some(part) {
            return Ok(HashMap::new());
        }
        Ok(question_ids
            .iter()
            .map(|id| {
                let storage_path = format!("{session_id}/{}/{id}.m4a", part.key());
                let target = UploadTarget {
                    upload_url: format!("memory://upload/{storage_path}"),
                    storage_path,
                };
                (*id, target)
            })
            .collect())
    }

    async fn transfer(
        &self,
        target: &UploadTarget,
        audio: &AudioResource,
    ) -> Result<(), GatewayError> {
        let mut state = lock(&self.state);
        let failing = state.fail_transfer.is_some_and(|id| {
            target
                .storage_path
                .ends_with(&format!("/{id}.m4a"))
        });
        self.log
            .push(format!("gateway:transfer:{}", target.storage_path));
        if failing {
            return Err(GatewayError::Rejected("upload refused".into()));
        }
        state
            .uploaded
            .insert(target.storage_path.clone(), audio.handle().to_string());
        Ok(())
    }

    async fn confirm(
        &self,
        _session_id: &SessionId,
        part: Part,
        storage_paths: &BTreeMap<QuestionId, String>,
    ) -> Result<(), GatewayError> {
        let mut state = lock(&self.state);
        self.log.push(format!("gateway:confirm:{}", part.key()));
        if state.fail_confirm == Some(part) {
            return Err(GatewayError::Rejected("confirmation refused".into()));
        }
        state.confirmed.push((part, storage_paths.clone()));
        Ok(())
    }
}
