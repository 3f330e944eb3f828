//! KoboldAI-compatible text generation endpoint

use super::{http_client, ProviderError};
use crate::runtime::traits::TextGenerator;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const STOP_SEQUENCES: [&str; 4] = ["<|im_end|>", "User:", "\n\n", "user:"];

pub struct KoboldTextGenerator {
    client: Client,
    generate_url: String,
    check_url: String,
}

impl KoboldTextGenerator {
    pub fn new(generate_url: &str) -> Result<Self, ProviderError> {
        let generate_url = generate_url.trim_end_matches('/').to_string();
        let check_url = generate_url.replace("/generate", "/model");
        Ok(Self {
            client: http_client(Duration::from_secs(90))?,
            generate_url,
            check_url,
        })
    }
}

#[async_trait]
impl TextGenerator for KoboldTextGenerator {
    async fn generate(&self, prompt: &str, max_len: u32) -> Result<String, ProviderError> {
        let request = KoboldRequest {
            prompt,
            max_length: max_len,
            temperature: 0.6,
            top_p: 0.9,
            min_p: 0.05,
            rep_pen: 1.1,
            stop_sequence: &STOP_SEQUENCES,
        };

        let response = self
            .client
            .post(&self.generate_url)
            .json(&request)
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

        let parsed: KoboldResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::unknown(format!("Failed to parse response: {e}")))?;
        let text = parsed
            .results
            .into_iter()
            .next()
            .map(|r| strip_echo(&r.text))
            .unwrap_or_default();
        Ok(text)
    }

    async fn is_available(&self) -> bool {
        match self
            .client
            .get(&self.check_url)
            .timeout(Duration::from_secs(3))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::warn!(error = %e, "Text backend availability check failed");
                false
            }
        }
    }

    fn name(&self) -> &str {
        "kobold"
    }
}

/// Cut the model's continuation at the point it starts speaking for the user
fn strip_echo(text: &str) -> String {
    let mut out = text.trim();
    for marker in ["User:", "<|im_start|>"] {
        if let Some((head, _)) = out.split_once(marker) {
            out = head.trim();
        }
    }
    out.to_string()
}

#[derive(Debug, Serialize)]
struct KoboldRequest<'a> {
    prompt: &'a str,
    max_length: u32,
    temperature: f32,
    top_p: f32,
    min_p: f32,
    rep_pen: f32,
    stop_sequence: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
struct KoboldResponse {
    results: Vec<KoboldResult>,
}

#[derive(Debug, Deserialize)]
struct KoboldResult {
    text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echoed_user_turns_are_cut() {
        assert_eq!(strip_echo("  *I smile.* Hi.\nUser: hey"), "*I smile.* Hi.");
        assert_eq!(strip_echo("Hello<|im_start|>assistant"), "Hello");
        assert_eq!(strip_echo("Plain."), "Plain.");
    }

    #[test]
    fn check_url_is_derived_from_generate_url() {
        let backend = KoboldTextGenerator::new("http://localhost:5001/api/v1/generate/").unwrap();
        assert_eq!(backend.check_url, "http://localhost:5001/api/v1/model");
    }
}
