//! Outbound chat gateway
//!
//! Every outbound message is one JSON POST to the gateway. Binary media is
//! sent inline as base64.

use super::{http_client, InteractiveOption, MediaKind, MediaPayload, ProviderError};
use crate::runtime::traits::Transport;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

pub struct GatewayTransport {
    client: Client,
    base_url: String,
    token: String,
}

impl GatewayTransport {
    pub fn new(base_url: &str, token: String) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(Duration::from_secs(60))?,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn post(&self, message: &OutboundMessage<'_>) -> Result<(), ProviderError> {
        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .bearer_auth(&self.token)
            .json(message)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for GatewayTransport {
    async fn send_text(&self, user_id: &str, text: &str) -> Result<(), ProviderError> {
        self.post(&OutboundMessage {
            user_id,
            body: OutboundBody::Text { text },
        })
        .await
    }

    async fn send_media(
        &self,
        user_id: &str,
        kind: MediaKind,
        payload: MediaPayload,
        caption: Option<&str>,
    ) -> Result<(), ProviderError> {
        let (url, data) = match payload {
            MediaPayload::Url(url) => (Some(url), None),
            MediaPayload::Bytes(bytes) => (None, Some(STANDARD.encode(bytes))),
        };
        self.post(&OutboundMessage {
            user_id,
            body: OutboundBody::Media {
                kind,
                url,
                data,
                caption,
            },
        })
        .await
    }

    async fn send_interactive(
        &self,
        user_id: &str,
        text: &str,
        options: &[InteractiveOption],
    ) -> Result<(), ProviderError> {
        self.post(&OutboundMessage {
            user_id,
            body: OutboundBody::Interactive { text, options },
        })
        .await
    }
}

#[derive(Debug, Serialize)]
struct OutboundMessage<'a> {
    user_id: &'a str,
    #[serde(flatten)]
    body: OutboundBody<'a>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutboundBody<'a> {
    Text {
        text: &'a str,
    },
    Media {
        kind: MediaKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        caption: Option<&'a str>,
    },
    Interactive {
        text: &'a str,
        options: &'a [InteractiveOption],
    },
}
