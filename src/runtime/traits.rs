//! Trait abstractions for runtime I/O
//!
//! These traits let the turn processor and the fulfillment coordinator run
//! against mock collaborators in tests.

use crate::db::{Account, Database, PurchaseStatus};
use crate::providers::{
    CallRequest, CallStatus, ImageRequest, InteractiveOption, MediaKind, MediaPayload,
    ProviderError, VideoPoll, VideoRequest,
};
use crate::state_machine::{Session, Verdict};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

// ============================================================================
// Persistence
// ============================================================================

/// Durable session documents plus the transcript
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_session(&self, user_id: &str) -> Result<Option<Session>, String>;

    /// Last-write-wins by revision; returns whether the write landed
    async fn put_session(&self, session: &Session) -> Result<bool, String>;

    async fn prune_sessions(&self, older_than: DateTime<Utc>) -> Result<usize, String>;

    async fn log_turn(
        &self,
        user_id: &str,
        persona_id: Option<&str>,
        role: &str,
        text: &str,
    ) -> Result<(), String>;
}

/// Balances, reservation snapshots, quota and entitlement
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn ensure_account(&self, user_id: &str, welcome_bonus: u64)
        -> Result<(Account, bool), String>;

    async fn get_account(&self, user_id: &str) -> Result<Account, String>;

    async fn get_balance(&self, user_id: &str) -> Result<u64, String>;

    async fn update_balance(&self, user_id: &str, new_balance: u64) -> Result<(), String>;

    async fn get_reservation(&self, user_id: &str) -> Result<Option<u64>, String>;

    async fn set_reservation(&self, user_id: &str, snapshot: Option<u64>) -> Result<(), String>;

    /// Consume one turn of the daily quota atomically
    async fn try_consume_daily_turn(
        &self,
        user_id: &str,
        quota: u32,
        today: &str,
    ) -> Result<bool, String>;

    async fn set_display_name(&self, user_id: &str, name: &str) -> Result<(), String>;

    async fn grant_subscription(
        &self,
        user_id: &str,
        tier: &str,
        until: DateTime<Utc>,
    ) -> Result<(), String>;

    async fn record_call_start(
        &self,
        call_id: &str,
        user_id: &str,
        agent_id: &str,
        phone_number: &str,
    ) -> Result<(), String>;

    async fn finish_call(
        &self,
        call_id: &str,
        duration_secs: u64,
        cost: u64,
        status: &str,
    ) -> Result<(), String>;
}

/// Charge-id bookkeeping for idempotent payment application
#[async_trait]
pub trait PaymentValidator: Send + Sync {
    async fn has_processed(&self, charge_id: &str) -> Result<bool, String>;

    /// Returns `Ok(false)` if the charge id was already recorded
    async fn record_purchase(
        &self,
        charge_id: &str,
        user_id: &str,
        product: &str,
        gems: u64,
        status: PurchaseStatus,
    ) -> Result<bool, String>;

    async fn mark_processed(&self, charge_id: &str, status: PurchaseStatus) -> Result<(), String>;
}

// ============================================================================
// Backends
// ============================================================================

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, max_len: u32) -> Result<String, ProviderError>;

    async fn is_available(&self) -> bool;

    fn name(&self) -> &str;
}

#[async_trait]
pub trait ImageBackend: Send + Sync {
    /// Returns the artifact reference (URL) of the generated image
    async fn generate_image(&self, request: &ImageRequest) -> Result<String, ProviderError>;

    async fn classify(&self, artifact_ref: &str) -> Result<Verdict, ProviderError>;
}

#[async_trait]
pub trait VideoBackend: Send + Sync {
    /// `Ok(None)` means the backend refused the submission
    async fn submit_video(&self, request: &VideoRequest) -> Result<Option<String>, ProviderError>;

    async fn poll_video(&self, job_id: &str) -> Result<VideoPoll, ProviderError>;
}

#[async_trait]
pub trait SpeechBackend: Send + Sync {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>, ProviderError>;

    /// `Ok(None)` means the call could not be placed
    async fn start_call(&self, request: &CallRequest) -> Result<Option<String>, ProviderError>;

    async fn call_status(&self, call_id: &str) -> Result<CallStatus, ProviderError>;

    async fn terminate_call(&self, call_id: &str) -> Result<bool, ProviderError>;
}

/// Outbound half of the chat transport
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_text(&self, user_id: &str, text: &str) -> Result<(), ProviderError>;

    async fn send_media(
        &self,
        user_id: &str,
        kind: MediaKind,
        payload: MediaPayload,
        caption: Option<&str>,
    ) -> Result<(), ProviderError>;

    async fn send_interactive(
        &self,
        user_id: &str,
        text: &str,
        options: &[InteractiveOption],
    ) -> Result<(), ProviderError>;
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: TextGenerator + ?Sized> TextGenerator for Arc<T> {
    async fn generate(&self, prompt: &str, max_len: u32) -> Result<String, ProviderError> {
        (**self).generate(prompt, max_len).await
    }

    async fn is_available(&self) -> bool {
        (**self).is_available().await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

#[async_trait]
impl<T: ImageBackend + ?Sized> ImageBackend for Arc<T> {
    async fn generate_image(&self, request: &ImageRequest) -> Result<String, ProviderError> {
        (**self).generate_image(request).await
    }

    async fn classify(&self, artifact_ref: &str) -> Result<Verdict, ProviderError> {
        (**self).classify(artifact_ref).await
    }
}

#[async_trait]
impl<T: VideoBackend + ?Sized> VideoBackend for Arc<T> {
    async fn submit_video(&self, request: &VideoRequest) -> Result<Option<String>, ProviderError> {
        (**self).submit_video(request).await
    }

    async fn poll_video(&self, job_id: &str) -> Result<VideoPoll, ProviderError> {
        (**self).poll_video(job_id).await
    }
}

#[async_trait]
impl<T: SpeechBackend + ?Sized> SpeechBackend for Arc<T> {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>, ProviderError> {
        (**self).synthesize(text, voice_id).await
    }

    async fn start_call(&self, request: &CallRequest) -> Result<Option<String>, ProviderError> {
        (**self).start_call(request).await
    }

    async fn call_status(&self, call_id: &str) -> Result<CallStatus, ProviderError> {
        (**self).call_status(call_id).await
    }

    async fn terminate_call(&self, call_id: &str) -> Result<bool, ProviderError> {
        (**self).terminate_call(call_id).await
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send_text(&self, user_id: &str, text: &str) -> Result<(), ProviderError> {
        (**self).send_text(user_id, text).await
    }

    async fn send_media(
        &self,
        user_id: &str,
        kind: MediaKind,
        payload: MediaPayload,
        caption: Option<&str>,
    ) -> Result<(), ProviderError> {
        (**self).send_media(user_id, kind, payload, caption).await
    }

    async fn send_interactive(
        &self,
        user_id: &str,
        text: &str,
        options: &[InteractiveOption],
    ) -> Result<(), ProviderError> {
        (**self).send_interactive(user_id, text, options).await
    }
}

// ============================================================================
// Production Adapters
// ============================================================================

#[async_trait]
impl SessionStore for Database {
    async fn get_session(&self, user_id: &str) -> Result<Option<Session>, String> {
        Database::get_session(self, user_id).map_err(|e| e.to_string())
    }

    async fn put_session(&self, session: &Session) -> Result<bool, String> {
        Database::put_session(self, session).map_err(|e| e.to_string())
    }

    async fn prune_sessions(&self, older_than: DateTime<Utc>) -> Result<usize, String> {
        Database::prune_sessions(self, older_than).map_err(|e| e.to_string())
    }

    async fn log_turn(
        &self,
        user_id: &str,
        persona_id: Option<&str>,
        role: &str,
        text: &str,
    ) -> Result<(), String> {
        Database::log_turn(self, user_id, persona_id, role, text).map_err(|e| e.to_string())
    }
}

#[async_trait]
impl AccountStore for Database {
    async fn ensure_account(
        &self,
        user_id: &str,
        welcome_bonus: u64,
    ) -> Result<(Account, bool), String> {
        Database::ensure_account(self, user_id, welcome_bonus).map_err(|e| e.to_string())
    }

    async fn get_account(&self, user_id: &str) -> Result<Account, String> {
        Database::get_account(self, user_id).map_err(|e| e.to_string())
    }

    async fn get_balance(&self, user_id: &str) -> Result<u64, String> {
        Database::get_balance(self, user_id).map_err(|e| e.to_string())
    }

    async fn update_balance(&self, user_id: &str, new_balance: u64) -> Result<(), String> {
        Database::update_balance(self, user_id, new_balance).map_err(|e| e.to_string())
    }

    async fn get_reservation(&self, user_id: &str) -> Result<Option<u64>, String> {
        Database::get_reservation(self, user_id).map_err(|e| e.to_string())
    }

    async fn set_reservation(&self, user_id: &str, snapshot: Option<u64>) -> Result<(), String> {
        Database::set_reservation(self, user_id, snapshot).map_err(|e| e.to_string())
    }

    async fn try_consume_daily_turn(
        &self,
        user_id: &str,
        quota: u32,
        today: &str,
    ) -> Result<bool, String> {
        Database::try_consume_daily_turn(self, user_id, quota, today).map_err(|e| e.to_string())
    }

    async fn set_display_name(&self, user_id: &str, name: &str) -> Result<(), String> {
        Database::set_display_name(self, user_id, name).map_err(|e| e.to_string())
    }

    async fn grant_subscription(
        &self,
        user_id: &str,
        tier: &str,
        until: DateTime<Utc>,
    ) -> Result<(), String> {
        Database::grant_subscription(self, user_id, tier, until).map_err(|e| e.to_string())
    }

    async fn record_call_start(
        &self,
        call_id: &str,
        user_id: &str,
        agent_id: &str,
        phone_number: &str,
    ) -> Result<(), String> {
        Database::record_call_start(self, call_id, user_id, agent_id, phone_number)
            .map_err(|e| e.to_string())
    }

    async fn finish_call(
        &self,
        call_id: &str,
        duration_secs: u64,
        cost: u64,
        status: &str,
    ) -> Result<(), String> {
        Database::finish_call(self, call_id, duration_secs, cost, status).map_err(|e| e.to_string())
    }
}

#[async_trait]
impl PaymentValidator for Database {
    async fn has_processed(&self, charge_id: &str) -> Result<bool, String> {
        Database::has_processed(self, charge_id).map_err(|e| e.to_string())
    }

    async fn record_purchase(
        &self,
        charge_id: &str,
        user_id: &str,
        product: &str,
        gems: u64,
        status: PurchaseStatus,
    ) -> Result<bool, String> {
        match Database::record_purchase(self, charge_id, user_id, product, gems, status) {
            Ok(()) => Ok(true),
            Err(crate::db::DbError::DuplicateCharge(_)) => Ok(false),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn mark_processed(&self, charge_id: &str, status: PurchaseStatus) -> Result<(), String> {
        Database::mark_processed(self, charge_id, status).map_err(|e| e.to_string())
    }
}
