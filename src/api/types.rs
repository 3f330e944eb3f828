//! API request and response types

use crate::providers::{InteractiveOption, MediaKind, MediaPayload};
use crate::turn::{Reply, TurnOutcome};
use serde::{Deserialize, Serialize};

/// Inbound chat text
#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub user_id: String,
    pub text: String,
}

/// Inbound option press
#[derive(Debug, Deserialize)]
pub struct OptionRequest {
    pub user_id: String,
    pub option_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ScenarioRequest {
    pub persona_id: String,
    pub scenario_id: String,
}

#[derive(Debug, Deserialize)]
pub struct VideoWebhook {
    pub job_id: String,
    pub status: String,
    pub artifact_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CallWebhook {
    pub call_id: String,
    pub event_type: String,
    pub duration_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PaymentRequest {
    pub charge_id: String,
    pub user_id: String,
    pub product: String,
}

#[derive(Debug, Serialize)]
pub struct AttachmentResponse {
    pub kind: MediaKind,
    /// Absent for inline audio bytes
    pub url: Option<String>,
    pub caption: Option<String>,
}

/// What was sent back to the user for one inbound event
#[derive(Debug, Serialize)]
pub struct ReplyResponse {
    pub outcome: TurnOutcome,
    pub text: String,
    pub options: Vec<InteractiveOption>,
    pub attachment: Option<AttachmentResponse>,
}

impl From<Reply> for ReplyResponse {
    fn from(reply: Reply) -> Self {
        Self {
            outcome: reply.outcome,
            text: reply.text,
            options: reply.options,
            attachment: reply.attachment.map(|a| AttachmentResponse {
                kind: a.kind,
                url: match a.payload {
                    MediaPayload::Url(url) => Some(url),
                    MediaPayload::Bytes(_) => None,
                },
                caption: a.caption,
            }),
        }
    }
}

/// Webhook acknowledgement
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    /// False when the event was a duplicate, unknown or non-terminal
    pub handled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub text_backend: bool,
    pub version: &'static str,
}

/// Generic error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}
