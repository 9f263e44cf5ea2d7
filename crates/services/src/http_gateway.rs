use std::collections::{BTreeMap, HashMap};
use std::env;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};

use exam_core::model::{AudioResource, Part, Question, QuestionId, SessionId, TopicMeta};

use crate::capabilities::{QuestionSource, SubmissionGateway, UploadTarget};
use crate::error::GatewayError;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub base_url: String,
    pub token: Option<String>,
}

impl ApiConfig {
    #[must_use]
    pub fn from_env() -> Option<Self> {
        let base_url = env::var("EXAM_API_BASE_URL").ok()?;
        if base_url.trim().is_empty() {
            return None;
        }
        let token = env::var("EXAM_API_TOKEN")
            .ok()
            .filter(|token| !token.trim().is_empty());
        Some(Self { base_url, token })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// Backend adapter for question lookup and the upload protocol.
#[derive(Clone)]
pub struct HttpGateway {
    client: Client,
    config: ApiConfig,
}

impl HttpGateway {
    #[must_use]
    pub fn new(config: ApiConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    #[must_use]
    pub fn from_env() -> Option<Self> {
        ApiConfig::from_env().map(Self::new)
    }

    #[must_use]
    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn session_path(session_id: &SessionId, part: Part, action: &str) -> String {
        format!("sessions/{session_id}/{}/{action}", part.key())
    }
}

async fn ensure_success(response: Response) -> Result<Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(GatewayError::Status { status, body })
}

#[async_trait]
impl QuestionSource for HttpGateway {
    async fn get_question(&self, id: QuestionId) -> Result<Question, GatewayError> {
        let url = self.config.endpoint(&format!("questions/{id}"));
        let response = self.authorized(self.client.get(url)).send().await?;
        let body: QuestionPayload = ensure_success(response).await?.json().await?;
        body.into_question(id)
    }
}

#[async_trait]
impl SubmissionGateway for HttpGateway {
    async fn request_upload_targets(
        &self,
        session_id: &SessionId,
        part: Part,
        question_ids: &[QuestionId],
    ) -> Result<HashMap<QuestionId, UploadTarget>, GatewayError> {
        let url = self
            .config
            .endpoint(&Self::session_path(session_id, part, "upload-urls"));
        let payload = UploadUrlsRequest {
            question_ids: question_ids.to_vec(),
        };
        let response = self
            .authorized(self.client.post(url))
            .json(&payload)
            .send()
            .await?;
        let body: UploadUrlsResponse = ensure_success(response).await?.json().await?;
        body.into_targets()
    }

    async fn transfer(
        &self,
        target: &UploadTarget,
        audio: &AudioResource,
    ) -> Result<(), GatewayError> {
        let path = audio.uri().as_path().ok_or_else(|| {
            GatewayError::Rejected(format!("audio {} is not a local file", audio.handle()))
        })?;
        let bytes = tokio::fs::read(path).await?;
        // Upload URLs are pre-signed; they carry their own authorization.
        let response = self
            .client
            .put(&target.upload_url)
            .header(reqwest::header::CONTENT_TYPE, "audio/mp4")
            .body(bytes)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn confirm(
        &self,
        session_id: &SessionId,
        part: Part,
        storage_paths: &BTreeMap<QuestionId, String>,
    ) -> Result<(), GatewayError> {
        let url = self
            .config
            .endpoint(&Self::session_path(session_id, part, "confirm"));
        let payload = ConfirmRequest::new(storage_paths);
        let response = self
            .authorized(self.client.post(url))
            .json(&payload)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct QuestionPayload {
    id: u64,
    part: u8,
    text: String,
    #[serde(default)]
    topic: TopicMeta,
}

impl QuestionPayload {
    fn into_question(self, requested: QuestionId) -> Result<Question, GatewayError> {
        if self.id != requested.value() {
            return Err(GatewayError::Decode(format!(
                "asked for question {requested}, got {}",
                self.id
            )));
        }
        let part = Part::from_u8(self.part).map_err(|e| GatewayError::Decode(e.to_string()))?;
        Question::new(requested, part, self.text, self.topic)
            .map_err(|e| GatewayError::Decode(e.to_string()))
    }
}

#[derive(Debug, Serialize)]
struct UploadUrlsRequest {
    question_ids: Vec<QuestionId>,
}

#[derive(Debug, Deserialize)]
struct UploadUrlsResponse {
    #[serde(default)]
    targets: HashMap<String, UploadTarget>,
}

impl UploadUrlsResponse {
    fn into_targets(self) -> Result<HashMap<QuestionId, UploadTarget>, GatewayError> {
        self.targets
            .into_iter()
            .map(|(key, target)| {
                let id = key
                    .parse::<QuestionId>()
                    .map_err(|e| GatewayError::Decode(format!("upload target key {key:?}: {e}")))?;
                Ok((id, target))
            })
            .collect()
    }
}

#[derive(Debug, Serialize)]
struct ConfirmRequest {
    files: BTreeMap<String, String>,
}

impl ConfirmRequest {
    fn new(storage_paths: &BTreeMap<QuestionId, String>) -> Self {
        Self {
            files: storage_paths
                .iter()
                .map(|(id, path)| (id.to_string(), path.clone()))
                .collect(),
        }
    }
}
