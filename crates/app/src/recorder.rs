use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use uuid::Uuid;

use exam_core::model::{AudioResource, AudioUri};
use services::capabilities::{Recorder, RecorderStatus};
use services::error::RecorderError;

const AUDIO_EXTENSIONS: [&str; 5] = ["m4a", "mp3", "wav", "ogg", "webm"];

#[derive(Default)]
struct Takes {
    status: RecorderStatus,
    next: usize,
}

/// Stands in for a microphone by handing out pre-recorded files in name order.
pub struct DirectoryRecorder {
    files: Vec<PathBuf>,
    takes: Mutex<Takes>,
}

impl DirectoryRecorder {
    /// Collect the audio files in `dir`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be read or holds no audio.
    pub async fn open(dir: &Path) -> std::io::Result<Self> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_audio = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| AUDIO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
            if is_audio {
                files.push(path);
            }
        }
        if files.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no audio files in {}", dir.display()),
            ));
        }
        files.sort();
        tracing::debug!(count = files.len(), dir = %dir.display(), "audio takes found");
        Ok(Self {
            files,
            takes: Mutex::new(Takes::default()),
        })
    }

    fn takes(&self) -> MutexGuard<'_, Takes> {
        self.takes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Recorder for DirectoryRecorder {
    async fn start(&self) -> Result<(), RecorderError> {
        let mut takes = self.takes();
        if takes.next >= self.files.len() {
            return Err(RecorderError::Device("no audio takes left".into()));
        }
        takes.status = RecorderStatus {
            is_recording: true,
            is_paused: false,
        };
        Ok(())
    }

    async fn pause(&self) -> Result<(), RecorderError> {
        self.takes().status.is_paused = true;
        Ok(())
    }

    async fn resume(&self) -> Result<(), RecorderError> {
        self.takes().status.is_paused = false;
        Ok(())
    }

    async fn stop(&self) -> Result<Option<AudioResource>, RecorderError> {
        let mut takes = self.takes();
        if !takes.status.is_recording {
            return Ok(None);
        }
        let path = self
            .files
            .get(takes.next)
            .cloned()
            .ok_or_else(|| RecorderError::Device("no audio takes left".into()))?;
        takes.status = RecorderStatus::default();
        takes.next += 1;

        let uri = AudioUri::from_file(path).map_err(|e| RecorderError::Device(e.to_string()))?;
        let audio = AudioResource::new(Uuid::new_v4().to_string(), uri)
            .map_err(|e| RecorderError::Device(e.to_string()))?;
        Ok(Some(audio))
    }

    async fn discard(&self) {
        self.takes().status = RecorderStatus::default();
    }

    fn status(&self) -> RecorderStatus {
        self.takes().status
    }
}
