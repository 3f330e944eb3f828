//! Per-turn pipeline
//!
//! A turn runs under the user's session lock:
//!
//! 1. Guards: message length, scenario selection, a call offer waiting for
//!    a phone number, then the daily quota.
//! 2. Bookkeeping: display name, history, counters, reveal keywords.
//! 3. An explicit premium request turns into an offer and ends the turn.
//! 4. Otherwise the included artifact (if due) and the persona's reply,
//!    with an occasional unprompted offer appended.
//!
//! The reply is always produced: backend failures degrade to an in-character
//! fallback line.

mod artifact;

use crate::config::TurnConfig;
use crate::intent::{detect_offer, extract_display_name, mentions_reveal};
use crate::offers::Offers;
use crate::persona::{Catalog, Persona, Scenario};
use crate::postprocess::normalize_reply;
use crate::prompt::{reply_prompt, ReplyContext};
use crate::providers::{InteractiveOption, MediaKind, MediaPayload};
use crate::runtime::Services;
use crate::session_cache::SessionCache;
use crate::state_machine::{keyword_target, AppearanceSignal, OfferKind, Role, Session};
use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const FALLBACK_REPLY: &str =
    "*I tilt my head and smile.* Sorry, my mind wandered for a second. What were you saying?";
const TOO_LONG_REPLY: &str = "That's a lot to take in! Could you say it in fewer words?";
const QUOTA_REPLY: &str =
    "We've talked so much today! Come back tomorrow, or subscribe to keep chatting.";
const CHOOSE_SCENARIO_REPLY: &str = "Who would you like to spend time with?";

const SCENARIO_OPTION_PREFIX: &str = "scenario:";

/// What a turn (or an option press) ended with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "kind", rename_all = "snake_case")]
pub enum TurnOutcome {
    Replied,
    Offered(OfferKind),
    InsufficientFunds(OfferKind),
    Delivered(OfferKind),
    Queued(OfferKind),
    Failed(OfferKind),
    AwaitingPhone,
    PhoneAccepted,
    PhoneRejected,
    Cancelled,
    OfferExpired,
    Busy,
    QuotaExceeded,
    TooLong,
    NeedsScenario,
    ScenarioSelected,
}

#[derive(Debug, Clone)]
pub struct Attachment {
    pub kind: MediaKind,
    pub payload: MediaPayload,
    pub caption: Option<String>,
}

/// Everything to send back for one inbound event
#[derive(Debug, Clone)]
pub struct Reply {
    pub outcome: TurnOutcome,
    pub text: String,
    pub attachment: Option<Attachment>,
    pub options: Vec<InteractiveOption>,
}

impl Reply {
    pub fn text(outcome: TurnOutcome, text: impl Into<String>) -> Self {
        Self {
            outcome,
            text: text.into(),
            attachment: None,
            options: Vec::new(),
        }
    }

    /// Nothing left to send; the outcome was delivered out of band
    pub fn silent(outcome: TurnOutcome) -> Self {
        Self::text(outcome, String::new())
    }

    pub fn with_options(mut self, options: Vec<InteractiveOption>) -> Self {
        self.options = options;
        self
    }

    pub fn with_attachment(mut self, attachment: Option<Attachment>) -> Self {
        self.attachment = attachment;
        self
    }
}

/// One option per (persona, scenario) pair in the catalog
pub fn scenario_options(catalog: &Catalog) -> Vec<InteractiveOption> {
    catalog
        .personas
        .iter()
        .flat_map(|persona| {
            persona.scenarios.iter().map(move |scenario| {
                InteractiveOption::new(
                    format!("{SCENARIO_OPTION_PREFIX}{}/{}", persona.id, scenario.id),
                    format!("{}: {}", persona.full_name, scenario.title),
                )
            })
        })
        .collect()
}

/// `scenario:<persona>/<scenario>` into its two ids
pub fn parse_scenario_option(option_id: &str) -> Option<(&str, &str)> {
    let (persona, scenario) = option_id
        .strip_prefix(SCENARIO_OPTION_PREFIX)?
        .split_once('/')?;
    (!persona.is_empty() && !scenario.is_empty()).then_some((persona, scenario))
}

/// Weighted pick for unprompted offers: video 40%, voice note 30%, call 30%
fn fallback_kind(roll: f64) -> OfferKind {
    if roll < 0.4 {
        OfferKind::Video
    } else if roll < 0.7 {
        OfferKind::VoiceNote
    } else {
        OfferKind::VoiceCall
    }
}

pub struct TurnProcessor {
    services: Services,
    catalog: Arc<Catalog>,
    config: TurnConfig,
    sessions: Arc<SessionCache>,
    offers: Arc<Offers>,
    text_available: AtomicBool,
}

impl TurnProcessor {
    pub fn new(
        services: Services,
        catalog: Arc<Catalog>,
        config: TurnConfig,
        sessions: Arc<SessionCache>,
        offers: Arc<Offers>,
    ) -> Self {
        Self {
            services,
            catalog,
            config,
            sessions,
            offers,
            text_available: AtomicBool::new(true),
        }
    }

    /// Probe the text backend; while it is down replies use the fallback line
    pub async fn check_text_backend(&self) -> bool {
        let available = self.services.text.is_available().await;
        let was = self.text_available.swap(available, Ordering::SeqCst);
        if was != available {
            tracing::warn!(
                backend = self.services.text.name(),
                available,
                "Text backend availability changed"
            );
        }
        available
    }

    pub async fn process_turn(&self, session: &mut Session, text: &str) -> Reply {
        let user_id = session.user_id.clone();

        if text.chars().count() > self.config.max_message_len {
            tracing::info!(user_id = %user_id, len = text.len(), "Message too long");
            return Reply::text(TurnOutcome::TooLong, TOO_LONG_REPLY);
        }

        let catalog = Arc::clone(&self.catalog);
        let Some((persona, scenario)) = lookup(&catalog, session) else {
            return Reply::text(TurnOutcome::NeedsScenario, CHOOSE_SCENARIO_REPLY)
                .with_options(scenario_options(&catalog));
        };

        // A call offer waiting for a number owns the next message
        if session.awaiting_input_offer().is_some() {
            let reply = self.offers.collect_phone(session, persona, text).await;
            session.bump();
            self.sessions.persist(session);
            return reply;
        }

        if let Some(kind) = session.expire_pending_offer() {
            tracing::info!(user_id = %user_id, kind = kind.as_str(), "Offer expired unconfirmed");
        }

        if !self.consume_quota(&user_id).await {
            tracing::info!(user_id = %user_id, "Daily quota exhausted");
            session.bump();
            self.sessions.persist(session);
            return Reply::text(TurnOutcome::QuotaExceeded, QUOTA_REPLY);
        }

        let named = self.update_display_name(session, text).await;

        session.push_turn(Role::User, text, self.config.history_cap);
        session.scenario_turns += 1;
        session.turns_since_artifact += 1;
        self.log_turn(session, Role::User, text);

        if mentions_reveal(text) {
            if let Some(target) = keyword_target(session.appearance) {
                session.try_transition_appearance(target, AppearanceSignal::Keyword);
            }
        }

        let explicit = detect_offer(text, &catalog.video_actions)
            .filter(|(kind, _)| !(named && *kind == OfferKind::VoiceCall));
        if let Some((kind, action)) = explicit {
            let reply = self.offers.propose(session, kind, action).await;
            return self.finish(session, reply);
        }

        let attachment = self.included_artifact(session, persona, scenario, text).await;
        let reply_text = self.compose_reply(session, persona, scenario).await;
        let reply = Reply::text(TurnOutcome::Replied, reply_text).with_attachment(attachment);
        let reply = self.maybe_fallback_offer(session, reply).await;
        self.finish(session, reply)
    }

    /// Admin and subscribers are exempt. A store failure lets the turn through.
    async fn consume_quota(&self, user_id: &str) -> bool {
        if self.config.admin_user_id.as_deref() == Some(user_id) {
            return true;
        }
        match self.services.accounts.get_account(user_id).await {
            Ok(account) if account.is_subscribed(Utc::now()) => return true,
            Ok(_) => {}
            Err(e) => tracing::warn!(user_id = %user_id, error = %e, "Account lookup failed"),
        }
        let today = Utc::now().format("%Y-%m-%d").to_string();
        self.services
            .accounts
            .try_consume_daily_turn(user_id, self.config.daily_turn_quota, &today)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(user_id = %user_id, error = %e, "Quota check failed");
                true
            })
    }

    /// Returns whether a name was introduced in this message
    async fn update_display_name(&self, session: &mut Session, text: &str) -> bool {
        let Some(name) = extract_display_name(text) else {
            return false;
        };
        if session.display_name.as_deref() != Some(name.as_str()) {
            tracing::info!(user_id = %session.user_id, name = %name, "Display name learned");
            if let Err(e) = self
                .services
                .accounts
                .set_display_name(&session.user_id, &name)
                .await
            {
                tracing::warn!(
                    user_id = %session.user_id,
                    error = %e,
                    "Failed to save display name"
                );
            }
            session.display_name = Some(name);
        }
        true
    }

    async fn compose_reply(
        &self,
        session: &Session,
        persona: &Persona,
        scenario: &Scenario,
    ) -> String {
        if !self.text_available.load(Ordering::SeqCst) {
            return FALLBACK_REPLY.to_string();
        }
        let prompt = reply_prompt(&ReplyContext {
            persona,
            scenario,
            session,
            history_window: self.config.prompt_history_window,
            reply_max_len: self.config.reply_max_len,
        });
        match self
            .services
            .text
            .generate(&prompt, self.config.reply_max_len)
            .await
        {
            Ok(raw) => normalize_reply(&raw, session.display_name.as_deref()),
            Err(e) => {
                tracing::warn!(
                    user_id = %session.user_id,
                    error = %e.message,
                    retryable = e.is_retryable(),
                    "Reply generation failed"
                );
                FALLBACK_REPLY.to_string()
            }
        }
    }

    /// Occasionally append an offer the user did not ask for
    async fn maybe_fallback_offer(&self, session: &mut Session, reply: Reply) -> Reply {
        if session.scenario_turns < self.config.fallback_offer_after_turns
            || session.open_offer().is_some()
        {
            return reply;
        }
        let (offer_roll, kind_roll) = {
            let mut rng = rand::thread_rng();
            (rng.gen::<f64>(), rng.gen::<f64>())
        };
        if offer_roll >= self.config.fallback_offer_chance {
            return reply;
        }
        let kind = fallback_kind(kind_roll);
        if !self.offers.can_offer(&session.user_id, kind).await {
            return reply;
        }

        let offer = self.offers.propose(session, kind, None).await;
        if offer.outcome != TurnOutcome::Offered(kind) {
            return reply;
        }
        tracing::info!(user_id = %session.user_id, kind = kind.as_str(), "Fallback offer");
        Reply {
            outcome: offer.outcome,
            text: format!("{}\n\n{}", reply.text, offer.text),
            attachment: reply.attachment,
            options: offer.options,
        }
    }

    fn finish(&self, session: &mut Session, reply: Reply) -> Reply {
        if !reply.text.is_empty() {
            session.push_turn(Role::Assistant, reply.text.clone(), self.config.history_cap);
            self.log_turn(session, Role::Assistant, &reply.text);
        }
        session.bump();
        self.sessions.persist(session);
        reply
    }

    fn log_turn(&self, session: &Session, role: Role, text: &str) {
        let store = self.services.sessions.clone();
        let user_id = session.user_id.clone();
        let persona_id = session.persona_id.clone();
        let text = text.to_string();
        tokio::spawn(async move {
            if let Err(e) = store
                .log_turn(&user_id, persona_id.as_deref(), role.as_str(), &text)
                .await
            {
                tracing::warn!(user_id = %user_id, error = %e, "Failed to log turn");
            }
        });
    }
}

fn lookup<'a>(catalog: &'a Catalog, session: &Session) -> Option<(&'a Persona, &'a Scenario)> {
    catalog.lookup(session.persona_id.as_deref()?, session.scenario_id.as_deref()?)
}
