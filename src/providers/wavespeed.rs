//! Wavespeed image-to-video jobs (submit + poll)

use super::{http_client, ProviderError, VideoPoll, VideoRequest};
use crate::runtime::traits::VideoBackend;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const SUBMIT_URL: &str = "https://api.wavespeed.ai/api/v3/wavespeed-ai/wan-2.1/i2v-480p-lora";
const RESULT_URL: &str = "https://api.wavespeed.ai/api/v3/predictions";

/// Words the video backend's filter rejects
const FILTERED_WORDS: [&str; 19] = [
    "nude",
    "naked",
    "sexual",
    "sexy",
    "seductive",
    "provocative",
    "erotic",
    "intimate",
    "sensual",
    "alluring",
    "tempting",
    "suggestive",
    "flirtatious",
    "undressing",
    "stripping",
    "revealing",
    "exposed",
    "bare",
    "topless",
];

const NEUTRAL_PROMPT: &str =
    "elegant woman, graceful movement, cinematic lighting, artistic composition";

pub struct WavespeedVideoBackend {
    client: Client,
    api_token: String,
}

impl WavespeedVideoBackend {
    pub fn new(api_token: String) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(Duration::from_secs(30))?,
            api_token,
        })
    }
}

#[async_trait]
impl VideoBackend for WavespeedVideoBackend {
    async fn submit_video(&self, request: &VideoRequest) -> Result<Option<String>, ProviderError> {
        let loras: Vec<_> = request
            .lora_url
            .iter()
            .map(|path| json!({ "path": path, "scale": 1 }))
            .collect();
        let payload = json!({
            "image": request.image_ref,
            "prompt": sanitize_prompt(&request.prompt),
            "loras": loras,
            "size": "832*480",
            "num_inference_steps": 30,
            "duration": 10,
            "guidance_scale": 5,
            "flow_shift": 3,
            "seed": -1,
            "enable_prompt_optimizer": false,
            "enable_safety_checker": false,
        });

        let response = self
            .client
            .post(SUBMIT_URL)
            .bearer_auth(&self.api_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::network(format!("Failed to read response: {e}")))?;
        if !status.is_success() {
            tracing::warn!(status = %status, "Video submission rejected");
            return Ok(None);
        }
        let parsed: Envelope<SubmitData> = serde_json::from_str(&body)
            .map_err(|e| ProviderError::unknown(format!("Failed to parse submission: {e}")))?;
        Ok(parsed.data.and_then(|d| d.id))
    }

    async fn poll_video(&self, job_id: &str) -> Result<VideoPoll, ProviderError> {
        let response = self
            .client
            .get(format!("{RESULT_URL}/{job_id}/result"))
            .bearer_auth(&self.api_token)
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
        let parsed: Envelope<ResultData> = serde_json::from_str(&body)
            .map_err(|e| ProviderError::unknown(format!("Failed to parse result: {e}")))?;
        Ok(parsed.data.map_or_else(VideoPoll::processing, ResultData::into_poll))
    }
}

fn sanitize_prompt(prompt: &str) -> String {
    let mut safe = prompt.to_lowercase();
    for word in FILTERED_WORDS {
        safe = safe.replace(word, "");
    }
    let safe = safe
        .replace("dancing", "moving gracefully")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if safe.is_empty() {
        NEUTRAL_PROMPT.to_string()
    } else {
        safe
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct SubmitData {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResultData {
    status: Option<String>,
    #[serde(default)]
    outputs: Vec<String>,
}

impl ResultData {
    fn into_poll(self) -> VideoPoll {
        match self.status.as_deref() {
            Some("completed") => match self.outputs.into_iter().next() {
                Some(url) => VideoPoll::completed(url),
                None => VideoPoll::processing(),
            },
            Some("failed") => VideoPoll::failed(),
            _ => VideoPoll::processing(),
        }
    }
}
