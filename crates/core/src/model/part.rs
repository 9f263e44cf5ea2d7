use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::model::ids::QuestionId;

//
// ─── ERRORS ───────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PartError {
    #[error("invalid part number: {0}")]
    InvalidNumber(u8),
}

//
// ─── PART ─────────────────────────────────────────────────────────────────────
//

/// One of the three ordered segments of a speaking test.
///
/// - `One`: introduction and interview
/// - `Two`: long turn, preceded by a one-time preparation window
/// - `Three`: two-way discussion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Part {
    One,
    Two,
    Three,
}

impl Part {
    /// All parts in visiting order.
    pub const ALL: [Part; 3] = [Part::One, Part::Two, Part::Three];

    /// Converts a part number (1-3) to a `Part`.
    ///
    /// # Errors
    ///
    /// Returns `PartError::InvalidNumber` outside 1-3.
    pub fn from_u8(value: u8) -> Result<Self, PartError> {
        match value {
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            3 => Ok(Self::Three),
            _ => Err(PartError::InvalidNumber(value)),
        }
    }

    #[must_use]
    pub fn number(self) -> u8 {
        match self {
            Part::One => 1,
            Part::Two => 2,
            Part::Three => 3,
        }
    }

    /// Key used by the backend upload protocol.
    #[must_use]
    pub fn key(self) -> &'static str {
        match self {
            Part::One => "part1",
            Part::Two => "part2",
            Part::Three => "part3",
        }
    }

    #[must_use]
    pub fn next(self) -> Option<Part> {
        match self {
            Part::One => Some(Part::Two),
            Part::Two => Some(Part::Three),
            Part::Three => None,
        }
    }

    #[must_use]
    pub fn previous(self) -> Option<Part> {
        match self {
            Part::One => None,
            Part::Two => Some(Part::One),
            Part::Three => Some(Part::Two),
        }
    }

    fn slot(self) -> usize {
        usize::from(self.number() - 1)
    }
}

impl fmt::Display for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Part {}", self.number())
    }
}

//
// ─── PLAN & CURSOR ────────────────────────────────────────────────────────────
//

/// Position of the candidate inside the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub part: Part,
    pub index: usize,
}

impl Cursor {
    #[must_use]
    pub fn new(part: Part, index: usize) -> Self {
        Self { part, index }
    }
}

/// Ordered question ids for each part of one attempt.
///
/// Any part may be empty; navigation skips empty parts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExamPlan {
    parts: [Vec<QuestionId>; 3],
}

impl ExamPlan {
    #[must_use]
    pub fn new(part1: Vec<QuestionId>, part2: Vec<QuestionId>, part3: Vec<QuestionId>) -> Self {
        Self {
            parts: [part1, part2, part3],
        }
    }

    /// Convenience constructor from raw numeric ids.
    #[must_use]
    pub fn from_raw(part1: &[u64], part2: &[u64], part3: &[u64]) -> Self {
        let ids = |raw: &[u64]| raw.iter().copied().map(QuestionId::new).collect();
        Self::new(ids(part1), ids(part2), ids(part3))
    }

    #[must_use]
    pub fn question_ids(&self, part: Part) -> &[QuestionId] {
        &self.parts[part.slot()]
    }

    /// Every referenced id, in visiting order.
    #[must_use]
    pub fn all_ids(&self) -> Vec<QuestionId> {
        self.parts.iter().flatten().copied().collect()
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.parts.iter().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Resolves the question id under a cursor.
    #[must_use]
    pub fn question_at(&self, cursor: Cursor) -> Option<QuestionId> {
        self.question_ids(cursor.part).get(cursor.index).copied()
    }

    /// First question of the first non-empty part.
    #[must_use]
    pub fn first_cursor(&self) -> Option<Cursor> {
        Part::ALL
            .into_iter()
            .find(|part| !self.question_ids(*part).is_empty())
            .map(|part| Cursor::new(part, 0))
    }

    /// Next question in the current part, else the first question of the next non-empty part.
    #[must_use]
    pub fn next_cursor(&self, cursor: Cursor) -> Option<Cursor> {
        if cursor.index + 1 < self.question_ids(cursor.part).len() {
            return Some(Cursor::new(cursor.part, cursor.index + 1));
        }
        let mut part = cursor.part.next();
        while let Some(candidate) = part {
            if !self.question_ids(candidate).is_empty() {
                return Some(Cursor::new(candidate, 0));
            }
            part = candidate.next();
        }
        None
    }

    /// Previous question in the current part, else the last question of the previous non-empty part.
    #[must_use]
    pub fn previous_cursor(&self, cursor: Cursor) -> Option<Cursor> {
        if cursor.index > 0 {
            return Some(Cursor::new(cursor.part, cursor.index - 1));
        }
        let mut part = cursor.part.previous();
        while let Some(candidate) = part {
            let len = self.question_ids(candidate).len();
            if len > 0 {
                return Some(Cursor::new(candidate, len - 1));
            }
            part = candidate.previous();
        }
        None
    }
}
