//! Replicate image generation and content classifier

use super::{http_client, ImageRequest, ProviderError};
use crate::runtime::traits::ImageBackend;
use crate::state_machine::Verdict;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const API_BASE: &str = "https://api.replicate.com/v1";
const CLASSIFIER_VERSION: &str =
    "97116600cabd3037e5f22ca08ffcc33b92cfacebf7ccd3609e9c1d29e43d3a8d";

pub struct ReplicateImageBackend {
    client: Client,
    api_token: String,
}

impl ReplicateImageBackend {
    pub fn new(api_token: String) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(Duration::from_secs(120))?,
            api_token,
        })
    }

    /// Create a prediction and wait for it synchronously (`Prefer: wait`)
    async fn run(&self, version: &str, input: Value) -> Result<Value, ProviderError> {
        let response = self
            .client
            .post(format!("{API_BASE}/predictions"))
            .bearer_auth(&self.api_token)
            .header("Prefer", "wait")
            .json(&json!({ "version": version, "input": input }))
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

        let prediction: Prediction = serde_json::from_str(&body)
            .map_err(|e| ProviderError::unknown(format!("Failed to parse prediction: {e}")))?;
        match prediction.status.as_str() {
            "succeeded" => prediction
                .output
                .ok_or_else(|| ProviderError::unknown("Prediction succeeded without output")),
            "failed" | "canceled" => Err(ProviderError::server_error(
                prediction
                    .error
                    .unwrap_or_else(|| format!("Prediction {}", prediction.status)),
            )),
            other => Err(ProviderError::network(format!(
                "Prediction still {other} after wait"
            ))),
        }
    }
}

#[async_trait]
impl ImageBackend for ReplicateImageBackend {
    async fn generate_image(&self, request: &ImageRequest) -> Result<String, ProviderError> {
        let version = request
            .model
            .rsplit_once(':')
            .map_or(request.model.as_str(), |(_, v)| v);
        let output = self
            .run(
                version,
                json!({
                    "prompt": request.prompt,
                    "negative_prompt": request.negative_prompt,
                    "scheduler": "DPM++ 2M Karras",
                    "aspect_ratio": "9:16",
                    "lora_scale": 1,
                    "guidance_scale": 4,
                    "num_inference_steps": 30,
                    "disable_safety_checker": true,
                    "seed": request.seed,
                }),
            )
            .await?;
        first_output(&output).ok_or_else(|| ProviderError::unknown("Image prediction had no URL"))
    }

    async fn classify(&self, artifact_ref: &str) -> Result<Verdict, ProviderError> {
        let output = self
            .run(CLASSIFIER_VERSION, json!({ "image": artifact_ref }))
            .await?;
        let label = output.as_str().unwrap_or_default();
        Ok(Verdict::from_label(label))
    }
}

/// Predictions return either a single URL or a list of them
fn first_output(output: &Value) -> Option<String> {
    match output {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items.first().and_then(Value::as_str).map(String::from),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct Prediction {
    status: String,
    output: Option<Value>,
    error: Option<String>,
}
