#![forbid(unsafe_code)]

pub mod capabilities;
pub mod error;
pub mod exam;
pub mod http_gateway;
pub mod in_memory;

pub use exam_core::Clock;

pub use error::{
    ExamError, GatewayError, HistoryError, LoadError, PromptError, RecorderError, SubmissionError,
};
pub use exam::{
    AttemptHistoryService, ExamController, SessionCommand, SessionHandle, SessionRunner,
    SessionSnapshot,
};
pub use http_gateway::{ApiConfig, HttpGateway};
