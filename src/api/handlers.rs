//! HTTP request handlers

use super::types::{
    CallWebhook, ErrorResponse, HealthResponse, MessageRequest, OptionRequest, PaymentRequest,
    ReplyResponse, ScenarioRequest, VideoWebhook, WebhookResponse,
};
use super::AppState;
use crate::fulfillment::Resolution;
use crate::payments::PaymentOutcome;
use crate::state_machine::Session;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Inbound chat
        .route("/api/messages", post(post_message))
        .route("/api/options", post(post_option))
        // Sessions
        .route("/api/sessions/:user_id", get(get_session))
        .route("/api/sessions/:user_id/scenario", post(select_scenario))
        // Backend callbacks
        .route("/api/webhooks/video", post(video_webhook))
        .route("/api/webhooks/call", post(call_webhook))
        .route("/api/payments", post(apply_payment))
        .route("/api/health", get(health))
        .with_state(state)
}

// ============================================================
// Inbound Chat
// ============================================================

async fn post_message(
    State(state): State<AppState>,
    Json(req): Json<MessageRequest>,
) -> Result<Json<ReplyResponse>, AppError> {
    if req.user_id.trim().is_empty() {
        return Err(AppError::BadRequest("user_id is required".to_string()));
    }
    let reply = state.runtime.handle_message(&req.user_id, &req.text).await;
    Ok(Json(reply.into()))
}

async fn post_option(
    State(state): State<AppState>,
    Json(req): Json<OptionRequest>,
) -> Result<Json<ReplyResponse>, AppError> {
    let reply = state
        .runtime
        .handle_option(&req.user_id, &req.option_id)
        .await
        .ok_or_else(|| AppError::BadRequest(format!("Unknown option: {}", req.option_id)))?;
    Ok(Json(reply.into()))
}

// ============================================================
// Sessions
// ============================================================

async fn get_session(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Session>, AppError> {
    state
        .runtime
        .session_snapshot(&user_id)
        .await
        .map_err(AppError::Internal)?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("No session for {user_id}")))
}

async fn select_scenario(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(req): Json<ScenarioRequest>,
) -> Result<Json<ReplyResponse>, AppError> {
    let reply = state
        .runtime
        .select_scenario(&user_id, &req.persona_id, &req.scenario_id)
        .await
        .ok_or_else(|| {
            AppError::NotFound(format!(
                "Unknown scenario: {}/{}",
                req.persona_id, req.scenario_id
            ))
        })?;
    Ok(Json(reply.into()))
}

// ============================================================
// Webhooks and Payments
// ============================================================

async fn video_webhook(
    State(state): State<AppState>,
    Json(req): Json<VideoWebhook>,
) -> Json<WebhookResponse> {
    let resolution = state
        .runtime
        .handle_video_event(&req.job_id, &req.status, req.artifact_ref)
        .await;
    let handled = matches!(
        resolution,
        Some(Resolution::Delivered | Resolution::RolledBack)
    );
    Json(WebhookResponse {
        handled,
        detail: resolution.map(|r| format!("{r:?}").to_lowercase()),
    })
}

async fn call_webhook(
    State(state): State<AppState>,
    Json(req): Json<CallWebhook>,
) -> Json<WebhookResponse> {
    let charged = state
        .runtime
        .handle_call_event(&req.call_id, &req.event_type, req.duration_secs)
        .await;
    Json(WebhookResponse {
        handled: charged.is_some(),
        detail: charged.map(|gems| format!("charged {gems}")),
    })
}

async fn apply_payment(
    State(state): State<AppState>,
    Json(req): Json<PaymentRequest>,
) -> Result<Json<PaymentOutcome>, AppError> {
    let outcome = state
        .runtime
        .apply_payment(&req.charge_id, &req.user_id, &req.product)
        .await
        .map_err(AppError::Internal)?;
    Ok(Json(outcome))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        text_backend: state.runtime.check_text_backend().await,
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============================================================
// Error Handling
// ============================================================

enum AppError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FulfillmentConfig, RetentionConfig, TurnConfig};
    use crate::persona::Catalog;
    use crate::runtime::testing::TestServices;
    use crate::runtime::RelayRuntime;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn router(t: &TestServices) -> Router {
        let runtime = RelayRuntime::new(
            t.services(),
            Catalog::builtin(),
            TurnConfig::default(),
            FulfillmentConfig::default(),
            RetentionConfig::default(),
        );
        create_router(AppState::new(Arc::new(runtime)))
    }

    async fn post_json(router: Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let response = router
            .oneshot(
                Request::post(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn message_before_scenario_returns_options() {
        let t = TestServices::new();
        let (status, body) = post_json(
            router(&t),
            "/api/messages",
            json!({"user_id": "u1", "text": "hey"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"]["type"], "needs_scenario");
        assert_eq!(body["options"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_option_is_a_bad_request() {
        let t = TestServices::new();
        let (status, body) = post_json(
            router(&t),
            "/api/options",
            json!({"user_id": "u1", "option_id": "bogus"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("bogus"));
    }

    #[tokio::test]
    async fn unknown_video_job_is_acknowledged_but_not_handled() {
        let t = TestServices::new();
        let (status, body) = post_json(
            router(&t),
            "/api/webhooks/video",
            json!({
                "job_id": "nope",
                "status": "completed",
                "artifact_ref": "https://v.test/1.mp4"
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["handled"], false);
    }

    #[tokio::test]
    async fn payment_is_applied_once() {
        let t = TestServices::new().with_account("u1", 0);
        let app = router(&t);
        let request = json!({"charge_id": "ch_1", "user_id": "u1", "product": "gems_100"});
        let (_, first) = post_json(app.clone(), "/api/payments", request.clone()).await;
        let (_, second) = post_json(app, "/api/payments", request).await;
        assert_eq!(first["result"], "credited");
        assert_eq!(second["result"], "duplicate");
        assert_eq!(t.db.get_balance("u1").unwrap(), 95);
    }
}
