mod attempt;
mod ids;
mod part;
mod question;
mod recording;
mod time_limit;

pub use ids::{ParseIdError, QuestionId, SessionId};

pub use attempt::{AttemptSummary, AttemptSummaryError};
pub use part::{Cursor, ExamPlan, Part, PartError};
pub use question::{Question, QuestionError, TopicMeta};
pub use recording::{AudioError, AudioResource, AudioUri, Recording, RecordingSet};
pub use time_limit::{TimeLimit, TimeLimitError};
