mod controller;
mod history;
mod runner;
mod snapshot;
mod submission;

// Public API of the exam subsystem.
pub use controller::{Advanced, ExamController, PromptTicket, PromptToken, TickOutcome};
pub use history::{AttemptHistoryService, AttemptListItem};
pub use runner::{CommandOutcome, RunnerSettings, SessionCommand, SessionHandle, SessionRunner};
pub use snapshot::{Notice, SessionSnapshot};
pub use submission::{PartReceipt, SubmissionReport, submit_plan};
