//! ElevenLabs speech synthesis and outbound agent calls

use super::{http_client, CallRequest, CallStatus, ProviderError};
use crate::runtime::traits::SpeechBackend;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::sync::OnceCell;

const API_BASE: &str = "https://api.elevenlabs.io/v1";

/// Names that are placeholders rather than something the user told us
const PLACEHOLDER_NAMES: [&str; 5] = ["user", "handsome", "bello", "there", "baby"];

pub struct ElevenLabsBackend {
    client: Client,
    api_key: String,
    /// Outbound phone number id, fetched once on first call
    phone_number_id: OnceCell<String>,
}

impl ElevenLabsBackend {
    pub fn new(api_key: String) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(Duration::from_secs(60))?,
            api_key,
            phone_number_id: OnceCell::new(),
        })
    }

    async fn fetch_phone_number_id(&self) -> Result<String, ProviderError> {
        let response = self
            .client
            .get(format!("{API_BASE}/convai/phone-numbers"))
            .header("xi-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::network(format!("Failed to read response: {e}")))?;
        if !status.is_success() {
            return Err(ProviderError::from_status(status, &body));
        }
        let numbers: Vec<PhoneNumber> = serde_json::from_str(&body)
            .map_err(|e| ProviderError::unknown(format!("Failed to parse phone numbers: {e}")))?;
        numbers
            .iter()
            .find(|n| n.provider.as_deref() == Some("twilio"))
            .or_else(|| numbers.first())
            .map(|n| n.phone_number_id.clone())
            .ok_or_else(|| ProviderError::invalid_request("No outbound phone number configured"))
    }
}

#[async_trait]
impl SpeechBackend for ElevenLabsBackend {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>, ProviderError> {
        let response = self
            .client
            .post(format!("{API_BASE}/text-to-speech/{voice_id}"))
            .header("xi-api-key", &self.api_key)
            .header("accept", "audio/mpeg")
            .json(&json!({ "text": text }))
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProviderError::network(format!("Failed to read audio: {e}")))?;
        Ok(bytes.to_vec())
    }

    async fn start_call(&self, request: &CallRequest) -> Result<Option<String>, ProviderError> {
        let phone_number_id = self
            .phone_number_id
            .get_or_try_init(|| self.fetch_phone_number_id())
            .await?;

        let user_name = request
            .display_name
            .as_deref()
            .filter(|n| !PLACEHOLDER_NAMES.contains(&n.to_lowercase().as_str()))
            .unwrap_or("baby");

        let response = self
            .client
            .post(format!("{API_BASE}/convai/twilio/outbound-call"))
            .header("xi-api-key", &self.api_key)
            .json(&json!({
                "agent_id": request.agent_id,
                "agent_phone_number_id": phone_number_id,
                "to_number": request.phone_number,
                "dynamic_variables": { "user_name": user_name },
            }))
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::network(format!("Failed to read response: {e}")))?;
        if !status.is_success() {
            tracing::warn!(status = %status, user_id = %request.user_id, "Call was not placed");
            return Ok(None);
        }
        let started: CallStarted = serde_json::from_str(&body)
            .map_err(|e| ProviderError::unknown(format!("Failed to parse call response: {e}")))?;
        Ok(started.call_sid.or(started.call_id))
    }

    async fn call_status(&self, call_id: &str) -> Result<CallStatus, ProviderError> {
        let response = self
            .client
            .get(format!("{API_BASE}/convai/calls/{call_id}"))
            .header("xi-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e))?;
        let status = response.status();
        // An unknown call id means the provider has already dropped it
        if status == StatusCode::NOT_FOUND {
            return Ok(CallStatus::Ended);
        }
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::network(format!("Failed to read response: {e}")))?;
        if !status.is_success() {
            return Err(ProviderError::from_status(status, &body));
        }
        let parsed: CallInfo = serde_json::from_str(&body)
            .map_err(|e| ProviderError::unknown(format!("Failed to parse call status: {e}")))?;
        Ok(parsed
            .status
            .as_deref()
            .map_or(CallStatus::Unknown, CallStatus::from_label))
    }

    async fn terminate_call(&self, call_id: &str) -> Result<bool, ProviderError> {
        let response = self
            .client
            .post(format!("{API_BASE}/convai/calls/{call_id}/terminate"))
            .header("xi-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e))?;
        Ok(response.status().is_success())
    }
}

#[derive(Debug, Deserialize)]
struct PhoneNumber {
    phone_number_id: String,
    provider: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallStarted {
    #[serde(rename = "callSid")]
    call_sid: Option<String>,
    call_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallInfo {
    status: Option<String>,
}
