//! Music generation provider client
//!
//! Trait-based so the server can run against the hosted Suno-compatible API
//! in production and an in-memory mock in tests. The webhook payload types
//! live here too since they are the provider's wire format.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::status::VariantUpdate;

/// What to generate: approved lyrics plus styling hints from the request.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationSpec {
    pub title: String,
    pub lyrics: String,
    pub style: Option<String>,
    pub instrumental: bool,
}

/// A task's state as reported by the provider's status API.
#[derive(Debug, Clone)]
pub struct ProviderTaskStatus {
    /// Normalized state: `completed`, `failed`, or `processing`.
    pub state: String,
    pub variants: Vec<VariantUpdate>,
    pub error: Option<String>,
}

/// Webhook body: `{ code, msg, data: { task_id, callbackType, data: [...] } }`.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationCallback {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub data: Option<GenerationCallbackData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerationCallbackData {
    #[serde(default, alias = "taskId")]
    pub task_id: Option<String>,
    #[serde(default, alias = "callbackType")]
    pub callback_type: String,
    #[serde(default)]
    pub data: Vec<VariantUpdate>,
}

#[async_trait]
pub trait MusicGenerator: Send + Sync {
    /// Unique provider name (e.g. "suno").
    fn name(&self) -> &str;

    /// Kick off generation; returns the provider task id.
    async fn start(&self, spec: &GenerationSpec) -> Result<String>;

    /// Poll the provider for a task's current state.
    async fn fetch_status(&self, task_id: &str) -> Result<ProviderTaskStatus>;
}

/// Client for the hosted Suno generation API.
pub struct SunoClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    callback_url: Option<String>,
}

const SUNO_BASE_URL: &str = "https://api.sunoapi.org";

#[derive(Debug, Deserialize)]
struct SunoEnvelope<T> {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct SunoStartData {
    #[serde(alias = "taskId")]
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct SunoRecordData {
    #[serde(default)]
    status: String,
    #[serde(default, alias = "errorMessage")]
    error_message: Option<String>,
    #[serde(default)]
    response: Option<SunoRecordResponse>,
}

#[derive(Debug, Default, Deserialize)]
struct SunoRecordResponse {
    #[serde(default, alias = "sunoData")]
    suno_data: Vec<VariantUpdate>,
}

impl SunoClient {
    pub fn new(api_key: String, callback_url: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build generation HTTP client")?;

        Ok(Self {
            client,
            base_url: SUNO_BASE_URL.to_string(),
            api_key,
            callback_url,
        })
    }

    /// Point the client at a different host (tests, self-hosted proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Normalize the provider's task status codes.
    fn normalize_state(status: &str) -> &'static str {
        match status.to_uppercase().as_str() {
            "SUCCESS" | "COMPLETE" | "COMPLETED" => "completed",
            s if s.ends_with("_FAILED") || s == "FAILED" || s == "ERROR" => "failed",
            _ => "processing",
        }
    }
}

#[async_trait]
impl MusicGenerator for SunoClient {
    fn name(&self) -> &str {
        "suno"
    }

    async fn start(&self, spec: &GenerationSpec) -> Result<String> {
        let mut body = serde_json::json!({
            "prompt": spec.lyrics,
            "title": spec.title,
            "customMode": true,
            "instrumental": spec.instrumental,
        });
        if let Some(style) = &spec.style {
            body["style"] = serde_json::Value::String(style.clone());
        }
        if let Some(callback_url) = &self.callback_url {
            body["callBackUrl"] = serde_json::Value::String(callback_url.clone());
        }

        tracing::debug!("Starting generation for title: {}", spec.title);

        let response = self
            .client
            .post(format!("{}/api/v1/generate", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("Generation request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("Generation API returned HTTP {}", response.status());
        }

        let envelope: SunoEnvelope<SunoStartData> = response
            .json()
            .await
            .context("Failed to decode generation response")?;

        if envelope.code != 200 {
            anyhow::bail!(
                "Generation API error {}: {}",
                envelope.code,
                envelope.msg.unwrap_or_else(|| "unknown".to_string())
            );
        }

        let data = envelope.data.context("Generation response missing data")?;
        tracing::debug!("Generation task started: {}", data.task_id);
        Ok(data.task_id)
    }

    async fn fetch_status(&self, task_id: &str) -> Result<ProviderTaskStatus> {
        tracing::debug!("Fetching generation status for task: {}", task_id);

        let response = self
            .client
            .get(format!("{}/api/v1/generate/record-info", self.base_url))
            .bearer_auth(&self.api_key)
            .query(&[("taskId", task_id)])
            .send()
            .await
            .context("Status request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("Status API returned HTTP {}", response.status());
        }

        let envelope: SunoEnvelope<SunoRecordData> = response
            .json()
            .await
            .context("Failed to decode status response")?;

        if envelope.code != 200 {
            anyhow::bail!(
                "Status API error {}: {}",
                envelope.code,
                envelope.msg.unwrap_or_else(|| "unknown".to_string())
            );
        }

        let data = envelope.data.context("Status response missing data")?;
        let variants = data.response.unwrap_or_default().suno_data;

        Ok(ProviderTaskStatus {
            state: Self::normalize_state(&data.status).to_string(),
            variants,
            error: data.error_message,
        })
    }
}

/// In-memory generator for tests and local development.
///
/// `start` hands out sequential task ids; `fetch_status` returns the
/// configured scripted statuses in order, repeating the last one.
pub struct MockGenerator {
    statuses: tokio::sync::Mutex<Vec<ProviderTaskStatus>>,
    started: tokio::sync::Mutex<Vec<GenerationSpec>>,
}

impl MockGenerator {
    pub fn new(statuses: Vec<ProviderTaskStatus>) -> Self {
        Self {
            statuses: tokio::sync::Mutex::new(statuses),
            started: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub async fn started_specs(&self) -> Vec<GenerationSpec> {
        self.started.lock().await.clone()
    }
}

#[async_trait]
impl MusicGenerator for MockGenerator {
    fn name(&self) -> &str {
        "mock"
    }

    async fn start(&self, spec: &GenerationSpec) -> Result<String> {
        let mut started = self.started.lock().await;
        started.push(spec.clone());
        Ok(format!("mock-task-{}", started.len()))
    }

    async fn fetch_status(&self, _task_id: &str) -> Result<ProviderTaskStatus> {
        let mut statuses = self.statuses.lock().await;
        if statuses.is_empty() {
            anyhow::bail!("Mock generator has no scripted status");
        }
        if statuses.len() == 1 {
            Ok(statuses[0].clone())
        } else {
            Ok(statuses.remove(0))
        }
    }
}
