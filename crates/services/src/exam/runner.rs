use std::future;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use exam_core::model::{QuestionId, Recording};
use exam_core::session::{Landing, Retreat};

use super::controller::{Advanced, ExamController, PromptToken};
use super::snapshot::SessionSnapshot;
use super::submission::SubmissionReport;
use crate::capabilities::PromptEnd;
use crate::error::ExamError;

/// Something the candidate asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Begin,
    StartRecording,
    StopRecording,
    PauseRecording,
    ResumeRecording,
    Next,
    Previous,
    PlayPrompt,
    StopPrompt,
    SkipThinking,
    Submit { confirm_empty: bool },
}

/// What a command did, when it succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Done,
    Landed(Landing),
    AtStart,
    Recorded(Recording),
    PromptStarted(PromptToken),
    ThinkingSkipped(QuestionId),
    Submitted(SubmissionReport),
}

#[derive(Debug, Clone, Copy)]
pub struct RunnerSettings {
    pub tick: Duration,
    pub command_buffer: usize,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            command_buffer: 32,
        }
    }
}

struct Envelope {
    command: SessionCommand,
    reply: oneshot::Sender<Result<CommandOutcome, ExamError>>,
}

/// Owns a controller on a background task and feeds it one event at a time.
pub struct SessionRunner;

impl SessionRunner {
    /// Start driving `controller`. The controller should already be initialized.
    #[must_use]
    pub fn spawn(controller: ExamController, settings: RunnerSettings) -> SessionHandle {
        let (commands_tx, commands_rx) = mpsc::channel(settings.command_buffer.max(1));
        let (snapshots_tx, snapshots_rx) = watch::channel(controller.snapshot());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run(
            controller,
            settings,
            commands_rx,
            snapshots_tx,
            cancel.clone(),
        ));

        SessionHandle {
            commands: commands_tx,
            snapshots: snapshots_rx,
            cancel,
            task,
        }
    }
}

/// Client side of a running session.
pub struct SessionHandle {
    commands: mpsc::Sender<Envelope>,
    snapshots: watch::Receiver<SessionSnapshot>,
    cancel: CancellationToken,
    task: JoinHandle<ExamController>,
}

impl SessionHandle {
    /// Send a command and wait for its outcome.
    ///
    /// # Errors
    ///
    /// Returns the controller's error, or `ExamError::SessionClosed` once the
    /// runner has stopped.
    pub async fn send(&self, command: SessionCommand) -> Result<CommandOutcome, ExamError> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(Envelope { command, reply })
            .await
            .map_err(|_| ExamError::SessionClosed)?;
        outcome.await.map_err(|_| ExamError::SessionClosed)?
    }

    #[must_use]
    pub fn snapshots(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Stop the runner, releasing the audio devices, and hand back the controller.
    ///
    /// # Errors
    ///
    /// Returns `ExamError::SessionClosed` if the runner task panicked.
    pub async fn exit(self) -> Result<ExamController, ExamError> {
        self.cancel.cancel();
        self.task.await.map_err(|_| ExamError::SessionClosed)
    }
}

type PendingPrompt = Option<BoxFuture<'static, (PromptToken, PromptEnd)>>;

async fn prompt_end(pending: &mut PendingPrompt) -> (PromptToken, PromptEnd) {
    match pending {
        Some(wait) => wait.await,
        None => future::pending().await,
    }
}

async fn run(
    mut controller: ExamController,
    settings: RunnerSettings,
    mut commands: mpsc::Receiver<Envelope>,
    snapshots: watch::Sender<SessionSnapshot>,
    cancel: CancellationToken,
) -> ExamController {
    let mut ticker = tokio::time::interval_at(Instant::now() + settings.tick, settings.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pending: PendingPrompt = None;
    let mut reply = None;

    loop {
        if let Some(ticket) = controller.take_prompt() {
            pending = Some(ticket.wait().boxed());
        }

        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            _ = ticker.tick() => {
                if let Err(err) = controller.tick().await {
                    tracing::warn!(error = %err, "timed event failed");
                }
            }

            (token, end) = prompt_end(&mut pending) => {
                pending = None;
                controller.prompt_finished(token, end);
            }

            received = commands.recv() => {
                let Some(envelope) = received else {
                    break;
                };
                controller.clear_notice();
                let outcome = dispatch(&mut controller, envelope.command).await;
                if let Err(err) = &outcome {
                    tracing::debug!(command = ?envelope.command, error = %err, "command refused");
                }
                reply = Some((envelope.reply, outcome));
            }
        }

        // Publish before replying so callers never read a stale snapshot.
        snapshots.send_replace(controller.snapshot());
        if let Some((tx, outcome)) = reply.take() {
            // The caller may have stopped waiting.
            let _ = tx.send(outcome);
        }
    }

    controller.teardown().await;
    snapshots.send_replace(controller.snapshot());
    tracing::debug!("session runner stopped");
    controller
}

async fn dispatch(
    controller: &mut ExamController,
    command: SessionCommand,
) -> Result<CommandOutcome, ExamError> {
    match command {
        SessionCommand::Begin => controller.begin().await.map(CommandOutcome::Landed),
        SessionCommand::StartRecording => {
            controller.start_recording().await?;
            Ok(CommandOutcome::Done)
        }
        SessionCommand::StopRecording => controller
            .stop_recording()
            .await
            .map(CommandOutcome::Recorded),
        SessionCommand::PauseRecording => {
            controller.pause_recording().await?;
            Ok(CommandOutcome::Done)
        }
        SessionCommand::ResumeRecording => {
            controller.resume_recording().await?;
            Ok(CommandOutcome::Done)
        }
        SessionCommand::Next => match controller.advance_question().await? {
            Advanced::Landed(landing) => Ok(CommandOutcome::Landed(landing)),
            Advanced::Submitted(report) => Ok(CommandOutcome::Submitted(report)),
        },
        SessionCommand::Previous => match controller.previous_question().await? {
            Retreat::Landed(landing) => Ok(CommandOutcome::Landed(landing)),
            Retreat::AtStart => Ok(CommandOutcome::AtStart),
        },
        SessionCommand::PlayPrompt => controller
            .play_prompt()
            .await
            .map(CommandOutcome::PromptStarted),
        SessionCommand::StopPrompt => {
            controller.stop_prompt().await;
            Ok(CommandOutcome::Done)
        }
        SessionCommand::SkipThinking => controller
            .skip_thinking()
            .await
            .map(CommandOutcome::ThinkingSkipped),
        SessionCommand::Submit { confirm_empty } => controller
            .submit(confirm_empty)
            .await
            .map(CommandOutcome::Submitted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::in_memory::{
        CallLog, InMemoryGateway, InMemoryQuestionSource, ScriptedRecorder, SilentPromptPlayer,
    };
    use exam_core::model::{ExamPlan, Part, Question, SessionId, TopicMeta};
    use exam_core::session::Phase;
    use exam_core::time::fixed_clock;

    struct Rig {
        log: CallLog,
        gateway: InMemoryGateway,
        handle: SessionHandle,
    }

    async fn rig(plan: ExamPlan, limit: &str) -> Rig {
        let log = CallLog::new();
        let questions: Vec<Question> = Part::ALL
            .iter()
            .flat_map(|part| {
                plan.question_ids(*part).iter().map(move |id| {
                    Question::new(*id, *part, format!("Question {id}"), TopicMeta::default())
                        .unwrap()
                })
            })
            .collect();
        let gateway = InMemoryGateway::new().with_log(log.clone());
        let mut controller = ExamController::new(
            fixed_clock(),
            Arc::new(InMemoryQuestionSource::new(questions)),
            Arc::new(ScriptedRecorder::new().with_log(log.clone())),
            Arc::new(SilentPromptPlayer::instant().with_log(log.clone())),
            Arc::new(gateway.clone()),
        );
        controller
            .initialize(SessionId::from(42_u64), plan, Some(limit))
            .await
            .unwrap();
        let handle = SessionRunner::spawn(controller, RunnerSettings::default());
        Rig {
            log,
            gateway,
            handle,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_measure_the_recording() {
        let rig = rig(ExamPlan::from_raw(&[1], &[], &[]), "0min").await;
        rig.handle.send(SessionCommand::Begin).await.unwrap();
        rig.handle
            .send(SessionCommand::StartRecording)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5_500)).await;
        assert_eq!(rig.handle.snapshot().recording_elapsed, Some(5));

        let outcome = rig
            .handle
            .send(SessionCommand::StopRecording)
            .await
            .unwrap();
        let CommandOutcome::Recorded(recording) = outcome else {
            panic!("expected a recording, got {outcome:?}");
        };
        assert_eq!(recording.duration_secs, 5);

        let submitted = rig
            .handle
            .send(SessionCommand::Submit {
                confirm_empty: false,
            })
            .await
            .unwrap();
        assert!(matches!(submitted, CommandOutcome::Submitted(r) if r.uploaded_count() == 1));
        assert!(rig.handle.snapshot().is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn takes_between_heartbeats_keep_their_own_length() {
        let rig = rig(ExamPlan::from_raw(&[1, 2], &[], &[]), "0min").await;
        rig.handle.send(SessionCommand::Begin).await.unwrap();

        tokio::time::sleep(Duration::from_millis(998)).await;
        rig.handle
            .send(SessionCommand::StartRecording)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(4)).await;
        let outcome = rig
            .handle
            .send(SessionCommand::StopRecording)
            .await
            .unwrap();
        let CommandOutcome::Recorded(short) = outcome else {
            panic!("expected a recording, got {outcome:?}");
        };
        assert_eq!(short.duration_secs, 0);

        rig.handle.send(SessionCommand::Next).await.unwrap();
        tokio::time::sleep(Duration::from_millis(900)).await;
        rig.handle
            .send(SessionCommand::StartRecording)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1_200)).await;
        let outcome = rig
            .handle
            .send(SessionCommand::StopRecording)
            .await
            .unwrap();
        let CommandOutcome::Recorded(straddling) = outcome else {
            panic!("expected a recording, got {outcome:?}");
        };
        assert_eq!(straddling.duration_secs, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn prompt_completion_marks_question_listened() {
        let rig = rig(ExamPlan::from_raw(&[1], &[], &[]), "0min").await;
        rig.handle.send(SessionCommand::Begin).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rig.handle.snapshot().listened);
        assert!(!rig.handle.snapshot().prompt_playing);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_wins_over_later_commands() {
        let rig = rig(ExamPlan::from_raw(&[1, 2], &[], &[]), "1min").await;
        let mut snapshots = rig.handle.snapshots();
        rig.handle.send(SessionCommand::Begin).await.unwrap();
        rig.handle
            .send(SessionCommand::StartRecording)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60_500)).await;
        snapshots
            .wait_for(|s| s.phase == Phase::Complete)
            .await
            .unwrap();

        let err = rig.handle.send(SessionCommand::Next).await.unwrap_err();
        assert!(matches!(err, ExamError::InvalidState(_)));
        assert_eq!(rig.gateway.uploaded().len(), 1);
        let snapshot = rig.handle.snapshot();
        assert!(snapshot.expired);
        assert!(snapshot.warning_shown);
    }

    #[tokio::test(start_paused = true)]
    async fn exit_discards_the_open_recording() {
        let rig = rig(ExamPlan::from_raw(&[1], &[], &[]), "0min").await;
        rig.handle.send(SessionCommand::Begin).await.unwrap();
        rig.handle
            .send(SessionCommand::StartRecording)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        let controller = rig.handle.exit().await.unwrap();

        assert!(rig.log.filtered("recorder:discard").len() == 1);
        let session = controller.exam_session().unwrap();
        assert!(session.recordings().is_empty());
        assert_eq!(session.phase(), Phase::AwaitingAnswer);
    }

    #[tokio::test(start_paused = true)]
    async fn commands_after_exit_report_closed_session() {
        let rig = rig(ExamPlan::from_raw(&[1], &[], &[]), "0min").await;
        let commands = rig.handle.commands.clone();
        rig.handle.exit().await.unwrap();

        let (reply, _outcome) = oneshot::channel();
        let sent = commands
            .send(Envelope {
                command: SessionCommand::Begin,
                reply,
            })
            .await;
        assert!(sent.is_err());
    }
}
