//! Generation, speech and transport backends
//!
//! Each adapter implements one of the collaborator traits in
//! `runtime::traits`. A backend whose credentials are missing is replaced by
//! a `Disabled` stub that fails softly.

mod elevenlabs;
mod error;
mod gateway;
mod kobold;
mod replicate;
mod wavespeed;

pub use elevenlabs::ElevenLabsBackend;
pub use error::ProviderError;
pub use gateway::GatewayTransport;
pub use kobold::KoboldTextGenerator;
pub use replicate::ReplicateImageBackend;
pub use wavespeed::WavespeedVideoBackend;

use crate::config::BackendConfig;
use crate::runtime::traits::{ImageBackend, SpeechBackend, TextGenerator, VideoBackend};
use crate::state_machine::Verdict;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ============================================================================
// Request / response types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageRequest {
    /// Backend model identifier for the persona
    pub model: String,
    pub prompt: String,
    pub negative_prompt: String,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoRequest {
    pub image_ref: String,
    pub prompt: String,
    pub lora_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPollStatus {
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoPoll {
    pub status: JobPollStatus,
    pub artifact_ref: Option<String>,
}

impl VideoPoll {
    pub fn processing() -> Self {
        Self {
            status: JobPollStatus::Processing,
            artifact_ref: None,
        }
    }

    pub fn completed(artifact_ref: impl Into<String>) -> Self {
        Self {
            status: JobPollStatus::Completed,
            artifact_ref: Some(artifact_ref.into()),
        }
    }

    pub fn failed() -> Self {
        Self {
            status: JobPollStatus::Failed,
            artifact_ref: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallRequest {
    pub agent_id: String,
    pub phone_number: String,
    pub user_id: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Active,
    Ended,
    Unknown,
}

impl CallStatus {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "ended" | "completed" | "terminated" | "finished" | "done" | "failed" => {
                CallStatus::Ended
            }
            "active" | "in-progress" | "in_progress" | "processing" | "initiated" | "ringing" => {
                CallStatus::Active
            }
            _ => CallStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MediaPayload {
    Url(String),
    Bytes(Vec<u8>),
}

/// One button of an interactive message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InteractiveOption {
    pub id: String,
    pub label: String,
}

impl InteractiveOption {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

// ============================================================================
// Logging wrapper
// ============================================================================

/// Logging wrapper for text generators
pub struct LoggingTextGenerator {
    inner: Arc<dyn TextGenerator>,
    name: String,
}

impl LoggingTextGenerator {
    pub fn new(inner: Arc<dyn TextGenerator>) -> Self {
        let name = inner.name().to_string();
        Self { inner, name }
    }
}

#[async_trait]
impl TextGenerator for LoggingTextGenerator {
    async fn generate(&self, prompt: &str, max_len: u32) -> Result<String, ProviderError> {
        let start = std::time::Instant::now();
        let result = self.inner.generate(prompt, max_len).await;
        let duration = start.elapsed();

        match &result {
            Ok(text) => {
                tracing::info!(
                    backend = %self.name,
                    duration_ms = %duration.as_millis(),
                    prompt_chars = prompt.len(),
                    reply_chars = text.len(),
                    "Text generation completed"
                );
            }
            Err(e) => {
                tracing::error!(
                    backend = %self.name,
                    duration_ms = %duration.as_millis(),
                    error = %e.message,
                    retryable = e.is_retryable(),
                    "Text generation failed"
                );
            }
        }

        result
    }

    async fn is_available(&self) -> bool {
        self.inner.is_available().await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// Disabled stubs
// ============================================================================

/// Stand-in for a backend whose credentials are missing
pub struct Disabled(&'static str);

#[async_trait]
impl ImageBackend for Disabled {
    async fn generate_image(&self, _request: &ImageRequest) -> Result<String, ProviderError> {
        Err(ProviderError::disabled(self.0))
    }

    async fn classify(&self, _artifact_ref: &str) -> Result<Verdict, ProviderError> {
        Err(ProviderError::disabled(self.0))
    }
}

#[async_trait]
impl VideoBackend for Disabled {
    async fn submit_video(&self, _request: &VideoRequest) -> Result<Option<String>, ProviderError> {
        Err(ProviderError::disabled(self.0))
    }

    async fn poll_video(&self, _job_id: &str) -> Result<VideoPoll, ProviderError> {
        Err(ProviderError::disabled(self.0))
    }
}

#[async_trait]
impl SpeechBackend for Disabled {
    async fn synthesize(&self, _text: &str, _voice_id: &str) -> Result<Vec<u8>, ProviderError> {
        Err(ProviderError::disabled(self.0))
    }

    async fn start_call(&self, _request: &CallRequest) -> Result<Option<String>, ProviderError> {
        Err(ProviderError::disabled(self.0))
    }

    async fn call_status(&self, _call_id: &str) -> Result<CallStatus, ProviderError> {
        Err(ProviderError::disabled(self.0))
    }

    async fn terminate_call(&self, _call_id: &str) -> Result<bool, ProviderError> {
        Err(ProviderError::disabled(self.0))
    }
}

// ============================================================================
// Construction from config
// ============================================================================

/// The set of production backends
pub struct Backends {
    pub text: Arc<dyn TextGenerator>,
    pub image: Arc<dyn ImageBackend>,
    pub video: Arc<dyn VideoBackend>,
    pub speech: Arc<dyn SpeechBackend>,
}

impl Backends {
    pub fn from_config(config: &BackendConfig) -> Result<Self, ProviderError> {
        let text: Arc<dyn TextGenerator> = Arc::new(LoggingTextGenerator::new(Arc::new(
            KoboldTextGenerator::new(&config.text_backend_url)?,
        )));

        let image: Arc<dyn ImageBackend> = match &config.replicate_api_token {
            Some(token) => Arc::new(ReplicateImageBackend::new(token.clone())?),
            None => {
                tracing::warn!("REPLICATE_API_TOKEN not set, image generation disabled");
                Arc::new(Disabled("image"))
            }
        };

        let video: Arc<dyn VideoBackend> = match &config.wavespeed_api_token {
            Some(token) => Arc::new(WavespeedVideoBackend::new(token.clone())?),
            None => {
                tracing::warn!("WAVESPEED_API_TOKEN not set, video generation disabled");
                Arc::new(Disabled("video"))
            }
        };

        let speech: Arc<dyn SpeechBackend> = match &config.elevenlabs_api_key {
            Some(key) => Arc::new(ElevenLabsBackend::new(key.clone())?),
            None => {
                tracing::warn!("ELEVENLABS_API_KEY not set, voice notes and calls disabled");
                Arc::new(Disabled("speech"))
            }
        };

        Ok(Self {
            text,
            image,
            video,
            speech,
        })
    }
}

/// Shared HTTP client construction
fn http_client(timeout: std::time::Duration) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ProviderError::unknown(format!("Failed to create HTTP client: {e}")))
}

#[cfg(test)]
mod tests {
    use super::error::ProviderErrorKind;
    use super::*;

    #[test]
    fn call_status_labels() {
        assert_eq!(CallStatus::from_label("completed"), CallStatus::Ended);
        assert_eq!(CallStatus::from_label("Terminated"), CallStatus::Ended);
        assert_eq!(CallStatus::from_label("in-progress"), CallStatus::Active);
        assert_eq!(CallStatus::from_label("mystery"), CallStatus::Unknown);
    }

    #[tokio::test]
    async fn disabled_backends_fail_softly() {
        let stub = Disabled("video");
        let err = VideoBackend::submit_video(
            &stub,
            &VideoRequest {
                image_ref: "x".into(),
                prompt: "y".into(),
                lora_url: None,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Disabled);
    }

    #[test]
    fn missing_credentials_build_stubs() {
        let backends = Backends::from_config(&BackendConfig {
            text_backend_url: "http://localhost:5001/api/v1/generate".to_string(),
            ..BackendConfig::default()
        });
        assert!(backends.is_ok());
    }
}
