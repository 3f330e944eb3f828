//! Runtime wiring
//!
//! `RelayRuntime` owns the session cache, the ledger, the offer desk, the
//! turn processor and the fulfillment coordinator, and routes inbound
//! events (messages, option presses, webhooks, payments) to them.

pub mod traits;

#[cfg(test)]
pub mod testing;

pub use traits::*;

use crate::config::{FulfillmentConfig, RetentionConfig, TurnConfig};
use crate::fulfillment::{FulfillmentCoordinator, Resolution};
use crate::ledger::Ledger;
use crate::offers::Offers;
use crate::payments::{PaymentOutcome, PaymentProcessor};
use crate::persona::Catalog;
use crate::session_cache::SessionCache;
use crate::state_machine::{OfferKind, Session};
use crate::turn::{parse_scenario_option, Reply, TurnOutcome, TurnProcessor};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

/// Terminal jobs are remembered this long to absorb late duplicate webhooks
const FINISHED_JOB_RETENTION_HOURS: i64 = 6;

/// Every external collaborator the runtime talks to
#[derive(Clone)]
pub struct Services {
    pub sessions: Arc<dyn SessionStore>,
    pub accounts: Arc<dyn AccountStore>,
    pub payments: Arc<dyn PaymentValidator>,
    pub text: Arc<dyn TextGenerator>,
    pub image: Arc<dyn ImageBackend>,
    pub video: Arc<dyn VideoBackend>,
    pub speech: Arc<dyn SpeechBackend>,
    pub transport: Arc<dyn Transport>,
}

// ============================================================================
// Retry
// ============================================================================

/// Bounded exponential backoff for store writes and reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): base, 2x base, 4x base...
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * (1 << attempt.saturating_sub(1).min(16))
    }
}

pub async fn retry_with_backoff<T, F, Fut>(
    policy: RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, String>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.attempts => {
                let delay = policy.delay(attempt);
                tracing::warn!(what, attempt, error = %e, delay_ms = delay.as_millis(), "Retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ============================================================================
// Relay Runtime
// ============================================================================

pub struct RelayRuntime {
    services: Services,
    catalog: Arc<Catalog>,
    sessions: Arc<SessionCache>,
    ledger: Arc<Ledger>,
    coordinator: Arc<FulfillmentCoordinator>,
    offers: Arc<Offers>,
    turns: TurnProcessor,
    payments: PaymentProcessor,
    retention: RetentionConfig,
}

impl RelayRuntime {
    pub fn new(
        services: Services,
        catalog: Catalog,
        turn: TurnConfig,
        fulfillment: FulfillmentConfig,
        retention: RetentionConfig,
    ) -> Self {
        Self::with_retry(services, catalog, turn, fulfillment, retention, RetryPolicy::default())
    }

    pub fn with_retry(
        services: Services,
        catalog: Catalog,
        turn: TurnConfig,
        fulfillment: FulfillmentConfig,
        retention: RetentionConfig,
        retry: RetryPolicy,
    ) -> Self {
        let catalog = Arc::new(catalog);
        let sessions = Arc::new(SessionCache::new(services.sessions.clone(), retry));
        let ledger = Arc::new(Ledger::new(services.accounts.clone()));
        let coordinator = Arc::new(FulfillmentCoordinator::new(
            &services,
            ledger.clone(),
            fulfillment,
            turn.pricing.voice_call_per_minute,
        ));
        let offers = Arc::new(Offers::new(
            services.clone(),
            catalog.clone(),
            turn.pricing,
            ledger.clone(),
            coordinator.clone(),
        ));
        let payments = PaymentProcessor::new(
            services.payments.clone(),
            services.accounts.clone(),
            ledger.clone(),
            retention.welcome_bonus,
        );
        let turns = TurnProcessor::new(
            services.clone(),
            catalog.clone(),
            turn,
            sessions.clone(),
            offers.clone(),
        );
        Self {
            services,
            catalog,
            sessions,
            ledger,
            coordinator,
            offers,
            turns,
            payments,
            retention,
        }
    }

    #[allow(dead_code)] // Used in tests
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub async fn check_text_backend(&self) -> bool {
        self.turns.check_text_backend().await
    }

    /// Create the account on first contact; returns the stored display name
    async fn ensure_account(&self, user_id: &str) -> Option<String> {
        match self
            .services
            .accounts
            .ensure_account(user_id, self.retention.welcome_bonus)
            .await
        {
            Ok((account, created)) => {
                if created {
                    tracing::info!(
                        user_id = %user_id,
                        bonus = self.retention.welcome_bonus,
                        "Account created"
                    );
                }
                account.display_name
            }
            Err(e) => {
                tracing::error!(user_id = %user_id, error = %e, "Failed to ensure account");
                None
            }
        }
    }

    /// Inbound chat text
    pub async fn handle_message(&self, user_id: &str, text: &str) -> Reply {
        let span = tracing::info_span!("turn", turn_id = %Uuid::new_v4(), user_id = %user_id);
        async {
            let stored_name = self.ensure_account(user_id).await;
            let handle = self.sessions.get_or_create(user_id).await;
            let reply = {
                let mut session = handle.lock().await;
                if session.display_name.is_none() {
                    session.display_name = stored_name;
                }
                self.turns.process_turn(&mut session, text).await
            };
            self.deliver(user_id, &reply).await;
            reply
        }
        .instrument(span)
        .await
    }

    /// Inbound option press. `None` if the option id is not recognized.
    pub async fn handle_option(&self, user_id: &str, option_id: &str) -> Option<Reply> {
        if let Some(kind) = OfferKind::from_option_id(option_id) {
            let span =
                tracing::info_span!("confirm", turn_id = %Uuid::new_v4(), user_id = %user_id);
            return Some(self.confirm_offer(user_id, kind).instrument(span).await);
        }
        if let Some((persona_id, scenario_id)) = parse_scenario_option(option_id) {
            return self.select_scenario(user_id, persona_id, scenario_id).await;
        }
        tracing::warn!(user_id = %user_id, option_id = %option_id, "Unknown option");
        None
    }

    async fn confirm_offer(&self, user_id: &str, kind: OfferKind) -> Reply {
        self.ensure_account(user_id).await;
        let handle = self.sessions.get_or_create(user_id).await;
        let reply = {
            let mut session = handle.lock().await;
            let reply = self.offers.confirm(&mut session, kind).await;
            session.bump();
            self.sessions.persist(&session);
            reply
        };
        self.deliver(user_id, &reply).await;
        reply
    }

    /// Switch persona and scenario, then greet with the scenario's intro and
    /// first message. `None` if the pair is not in the catalog.
    pub async fn select_scenario(
        &self,
        user_id: &str,
        persona_id: &str,
        scenario_id: &str,
    ) -> Option<Reply> {
        let (_, scenario) = self.catalog.lookup(persona_id, scenario_id)?;
        let stored_name = self.ensure_account(user_id).await;
        let handle = self.sessions.get_or_create(user_id).await;
        {
            let mut session = handle.lock().await;
            if session.display_name.is_none() {
                session.display_name = stored_name;
            }
            session.select_persona_scenario(
                persona_id,
                scenario_id,
                &scenario.first_message,
                &scenario.attire,
            );
            self.sessions.persist(&session);
        }
        tracing::info!(
            user_id = %user_id,
            persona_id = %persona_id,
            scenario_id = %scenario_id,
            "Scenario selected"
        );

        if !scenario.intro_text.is_empty() {
            if let Err(e) = self
                .services
                .transport
                .send_text(user_id, &scenario.intro_text)
                .await
            {
                tracing::warn!(user_id = %user_id, error = %e.message, "Failed to send intro");
            }
        }
        let reply = Reply::text(TurnOutcome::ScenarioSelected, scenario.first_message.clone());
        self.deliver(user_id, &reply).await;
        Some(reply)
    }

    pub async fn session_snapshot(&self, user_id: &str) -> Result<Option<Session>, String> {
        self.sessions.snapshot(user_id).await
    }

    pub async fn handle_video_event(
        &self,
        job_id: &str,
        status: &str,
        artifact_ref: Option<String>,
    ) -> Option<Resolution> {
        self.coordinator
            .handle_video_event(job_id, status, artifact_ref)
            .await
    }

    pub async fn handle_call_event(
        &self,
        call_id: &str,
        event_type: &str,
        duration_secs: Option<u64>,
    ) -> Option<u64> {
        self.coordinator
            .handle_call_event(call_id, event_type, duration_secs)
            .await
    }

    pub async fn apply_payment(
        &self,
        charge_id: &str,
        user_id: &str,
        payload: &str,
    ) -> Result<PaymentOutcome, String> {
        self.payments.apply(charge_id, user_id, payload).await
    }

    /// Send a reply: attachment first, then text (with options if any)
    async fn deliver(&self, user_id: &str, reply: &Reply) {
        let transport = &self.services.transport;
        if let Some(attachment) = &reply.attachment {
            if let Err(e) = transport
                .send_media(
                    user_id,
                    attachment.kind,
                    attachment.payload.clone(),
                    attachment.caption.as_deref(),
                )
                .await
            {
                tracing::warn!(user_id = %user_id, error = %e.message, "Failed to send attachment");
            }
        }
        let sent = if !reply.options.is_empty() {
            transport
                .send_interactive(user_id, &reply.text, &reply.options)
                .await
        } else if !reply.text.is_empty() {
            transport.send_text(user_id, &reply.text).await
        } else {
            Ok(())
        };
        if let Err(e) = sent {
            tracing::warn!(user_id = %user_id, error = %e.message, "Failed to send reply");
        }
    }

    // ========================================================================
    // Housekeeping
    // ========================================================================

    /// Evict idle sessions, prune old durable state, re-probe the text backend
    pub async fn sweep(&self) {
        let evicted = self.sessions.evict_idle(self.retention.idle_eviction);
        let locks = self.ledger.prune_idle_locks(self.retention.idle_eviction);
        let pruned = match self
            .sessions
            .prune_durable(Utc::now() - self.retention.durable_retention)
            .await
        {
            Ok(pruned) => pruned,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to prune sessions");
                0
            }
        };
        let jobs = self
            .coordinator
            .prune_finished(chrono::Duration::hours(FINISHED_JOB_RETENTION_HOURS));
        let text_available = self.check_text_backend().await;
        tracing::info!(
            evicted,
            locks,
            pruned,
            jobs,
            cached = self.sessions.len(),
            text_available,
            "Sweep complete"
        );
    }

    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let runtime = Arc::clone(self);
        let period = self.retention.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => runtime.sweep().await,
                }
            }
            tracing::info!("Sweeper stopped");
        })
    }

    pub fn shutdown(&self) {
        self.coordinator.shutdown();
    }
}
