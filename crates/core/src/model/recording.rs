use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use crate::model::ids::QuestionId;
use crate::model::part::Part;

//
// ─── ERRORS (domain validation) ────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("Audio handle cannot be empty.")]
    EmptyHandle,

    #[error("Audio URI cannot be empty.")]
    EmptyUri,

    #[error("Audio URI is not a valid URL: {0}")]
    InvalidUrl(String),
}

//
// ─── AUDIO RESOURCE ────────────────────────────────────────────────────────────
//

/// Where captured audio can be read back from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioUri {
    FilePath(PathBuf),
    Url(Url),
}

impl AudioUri {
    /// # Errors
    ///
    /// Returns `AudioError::EmptyUri` for an empty path.
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, AudioError> {
        let p = path.into();
        if p.as_os_str().is_empty() {
            return Err(AudioError::EmptyUri);
        }
        Ok(AudioUri::FilePath(p))
    }

    /// Accepts `file://` URLs as local paths and anything else as a URL.
    ///
    /// # Errors
    ///
    /// Returns `AudioError` if the string is empty or not a URL.
    pub fn parse(raw: impl AsRef<str>) -> Result<Self, AudioError> {
        let s = raw.as_ref().trim();
        if s.is_empty() {
            return Err(AudioError::EmptyUri);
        }
        let u = Url::parse(s).map_err(|_| AudioError::InvalidUrl(s.to_string()))?;
        if u.scheme() == "file" {
            if let Ok(path) = u.to_file_path() {
                return Ok(AudioUri::FilePath(path));
            }
        }
        Ok(AudioUri::Url(u))
    }

    #[must_use]
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            AudioUri::FilePath(p) => Some(p.as_path()),
            AudioUri::Url(_) => None,
        }
    }

    #[must_use]
    pub fn as_url(&self) -> Option<&Url> {
        match self {
            AudioUri::Url(u) => Some(u),
            AudioUri::FilePath(_) => None,
        }
    }
}

/// A locally addressable capture produced by the recording capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioResource {
    handle: String,
    uri: AudioUri,
}

impl AudioResource {
    /// # Errors
    ///
    /// Returns `AudioError::EmptyHandle` if the handle is blank.
    pub fn new(handle: impl Into<String>, uri: AudioUri) -> Result<Self, AudioError> {
        let handle = handle.into();
        if handle.trim().is_empty() {
            return Err(AudioError::EmptyHandle);
        }
        Ok(Self { handle, uri })
    }

    #[must_use]
    pub fn handle(&self) -> &str {
        &self.handle
    }

    #[must_use]
    pub fn uri(&self) -> &AudioUri {
        &self.uri
    }
}

//
// ─── RECORDING ─────────────────────────────────────────────────────────────────
//

/// One captured answer for one question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recording {
    pub question_id: QuestionId,
    pub part: Part,
    pub audio: AudioResource,
    /// Seconds counted by the session's own ticker.
    pub duration_secs: u32,
}

/// Recordings captured during one attempt, at most one per question.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordingSet {
    items: Vec<Recording>,
}

impl RecordingSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a recording, replacing any earlier one for the same question.
    ///
    /// Returns the replaced recording, if any.
    pub fn insert(&mut self, recording: Recording) -> Option<Recording> {
        let previous = self
            .items
            .iter()
            .position(|r| r.question_id == recording.question_id)
            .map(|idx| self.items.remove(idx));
        self.items.push(recording);
        previous
    }

    #[must_use]
    pub fn get(&self, id: QuestionId) -> Option<&Recording> {
        self.items.iter().find(|r| r.question_id == id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Recording> {
        self.items.iter()
    }

    /// Recordings for one part, in capture order.
    #[must_use]
    pub fn for_part(&self, part: Part) -> Vec<&Recording> {
        self.items.iter().filter(|r| r.part == part).collect()
    }

    /// Parts that have at least one recording, in fixed order 1 → 2 → 3.
    #[must_use]
    pub fn parts_with_recordings(&self) -> Vec<Part> {
        Part::ALL
            .into_iter()
            .filter(|part| self.items.iter().any(|r| r.part == *part))
            .collect()
    }

    #[must_use]
    pub fn count_for(&self, part: Part) -> u32 {
        let count = self.items.iter().filter(|r| r.part == part).count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn total_duration_secs(&self) -> u64 {
        self.items.iter().map(|r| u64::from(r.duration_secs)).sum()
    }
}
