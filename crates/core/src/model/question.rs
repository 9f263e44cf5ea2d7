use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::ids::QuestionId;
use crate::model::part::Part;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuestionError {
    #[error("question {0} has an empty prompt")]
    EmptyText(QuestionId),
}

/// Topic metadata attached to a question.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicMeta {
    pub name: String,
    pub tag: Option<String>,
}

/// A prompt the candidate answers. Read-only once fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    id: QuestionId,
    part: Part,
    text: String,
    topic: TopicMeta,
}

impl Question {
    /// # Errors
    ///
    /// Returns `QuestionError::EmptyText` if the prompt is blank.
    pub fn new(
        id: QuestionId,
        part: Part,
        text: impl Into<String>,
        topic: TopicMeta,
    ) -> Result<Self, QuestionError> {
        let text = text.into();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(QuestionError::EmptyText(id));
        }
        Ok(Self {
            id,
            part,
            text: trimmed.to_string(),
            topic,
        })
    }

    #[must_use]
    pub fn id(&self) -> QuestionId {
        self.id
    }

    #[must_use]
    pub fn part(&self) -> Part {
        self.part
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn topic(&self) -> &TopicMeta {
        &self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_prompt_text() {
        let q = Question::new(
            QuestionId::new(1),
            Part::One,
            "  Where do you live?  ",
            TopicMeta::default(),
        )
        .unwrap();
        assert_eq!(q.text(), "Where do you live?");
    }

    #[test]
    fn rejects_blank_prompt() {
        let err = Question::new(QuestionId::new(9), Part::Two, " \n", TopicMeta::default())
            .unwrap_err();
        assert_eq!(err, QuestionError::EmptyText(QuestionId::new(9)));
    }
}
