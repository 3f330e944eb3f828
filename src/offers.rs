//! Premium offers
//!
//! An offer is proposed during a turn and confirmed later through an
//! interactive option. Confirmation reserves and deducts in one step, then
//! either commits after the artifact reached the user or rolls back to the
//! snapshot. Video is handed to the fulfillment coordinator, which settles
//! the reservation when the job ends. Calls are billed when they end.

use crate::config::Pricing;
use crate::fulfillment::FulfillmentCoordinator;
use crate::intent::parse_phone_number;
use crate::ledger::{Deduction, Ledger};
use crate::persona::{Catalog, Persona, Scenario};
use crate::postprocess::clean_voice_text;
use crate::prompt::{image_prompt, voice_note_prompt};
use crate::providers::{
    CallRequest, ImageRequest, InteractiveOption, MediaKind, MediaPayload, VideoRequest,
};
use crate::runtime::Services;
use crate::state_machine::{
    verdict_target, AppearanceSignal, Offer, OfferKind, OfferStatus, Session,
};
use crate::turn::{Reply, TurnOutcome};
use std::sync::Arc;

const BUSY_REPLY: &str = "I'm still working on your last surprise. Give me a moment.";
const EXPIRED_REPLY: &str = "That offer has expired. Just ask me again.";
const CHARGE_ERROR_REPLY: &str = "Something went wrong on my side. You haven't been charged.";
const PHOTO_CAPTION: &str = "Just for you.";
const PHOTO_FAILED: &str = "I couldn't take that photo right now. Your gems have been refunded.";
const VOICE_NOTE_FALLBACK_LINE: &str = "I've been thinking about you. I love hearing from you.";
const VOICE_NOTE_FAILED: &str =
    "My voice isn't cooperating right now. Your gems have been refunded.";
const VIDEO_QUEUED: &str = "Give me a few minutes, I'm making your video now.";
const VIDEO_FAILED: &str = "I couldn't start your video right now. Your gems have been refunded.";
const DEFAULT_VIDEO_MOTION: &str = "she moves gently and smiles at the camera";
const VIDEO_STILL_POSE: &str = "facing the camera, ready to move";
const PHONE_PROMPT: &str =
    "Send me your phone number with the country code, like +15551234567, and I'll call you.";
const PHONE_INVALID: &str = "That doesn't look like a phone number. Send it with the country \
    code, like +15551234567, or say cancel.";
const CALL_CANCELLED: &str = "No problem, maybe another time.";
const CALL_PLACED: &str = "Calling you now. Pick up!";
const CALL_FAILED: &str = "I couldn't place the call right now. You haven't been charged.";

pub struct Offers {
    services: Services,
    catalog: Arc<Catalog>,
    pricing: Pricing,
    ledger: Arc<Ledger>,
    coordinator: Arc<FulfillmentCoordinator>,
}

impl Offers {
    pub fn new(
        services: Services,
        catalog: Arc<Catalog>,
        pricing: Pricing,
        ledger: Arc<Ledger>,
        coordinator: Arc<FulfillmentCoordinator>,
    ) -> Self {
        Self {
            services,
            catalog,
            pricing,
            ledger,
            coordinator,
        }
    }

    /// Gems per unit: once for artifacts, per minute for calls
    pub fn unit_cost(&self, kind: OfferKind) -> u64 {
        match kind {
            OfferKind::Image => self.pricing.image,
            OfferKind::Video => self.pricing.video,
            OfferKind::VoiceNote => self.pricing.voice_note,
            OfferKind::VoiceCall => self.pricing.voice_call_per_minute,
        }
    }

    /// A job in flight or an outstanding reservation blocks new offers
    pub async fn is_busy(&self, user_id: &str) -> bool {
        if self.coordinator.has_active_job(user_id) {
            return true;
        }
        self.ledger.has_reservation(user_id).await.unwrap_or_else(|e| {
            tracing::warn!(user_id = %user_id, error = %e, "Reservation check failed");
            false
        })
    }

    /// Whether an unprompted offer of `kind` would be accepted right now
    pub async fn can_offer(&self, user_id: &str, kind: OfferKind) -> bool {
        if self.is_busy(user_id).await {
            return false;
        }
        self.ledger
            .balance(user_id)
            .await
            .is_ok_and(|balance| balance >= self.unit_cost(kind))
    }

    /// Put an offer in the session's slot, or explain why not
    pub async fn propose(
        &self,
        session: &mut Session,
        kind: OfferKind,
        action: Option<String>,
    ) -> Reply {
        let user_id = session.user_id.clone();
        if self.is_busy(&user_id).await {
            return Reply::text(TurnOutcome::Busy, BUSY_REPLY);
        }

        let cost = self.unit_cost(kind);
        let balance = match self.ledger.balance(&user_id).await {
            Ok(balance) => balance,
            Err(e) => {
                tracing::error!(user_id = %user_id, error = %e, "Balance lookup failed");
                return Reply::text(TurnOutcome::Busy, BUSY_REPLY);
            }
        };
        if balance < cost {
            tracing::info!(
                user_id = %user_id,
                kind = kind.as_str(),
                balance,
                cost,
                "Offer blocked by balance"
            );
            return insufficient(kind, balance, cost);
        }

        if let Err(occupied) = session.create_offer(Offer::new(kind, cost).with_action(action)) {
            tracing::info!(user_id = %user_id, error = %occupied, "Offer slot occupied");
            return Reply::text(TurnOutcome::Busy, BUSY_REPLY);
        }
        tracing::info!(user_id = %user_id, kind = kind.as_str(), cost, "Offer created");

        let (text, label) = match kind {
            OfferKind::Image => (
                format!("Would you like a private photo of me? It's {cost} gems."),
                format!("Yes, send it ({cost} gems)"),
            ),
            OfferKind::Video => (
                format!("I could make you a little video. It's {cost} gems."),
                format!("Yes, make it ({cost} gems)"),
            ),
            OfferKind::VoiceNote => (
                format!("Want to hear my voice? A voice note is {cost} gems."),
                format!("Yes, send it ({cost} gems)"),
            ),
            OfferKind::VoiceCall => (
                format!("I'd love to talk to you for real. A call is {cost} gems per minute."),
                format!("Call me ({cost} gems/min)"),
            ),
        };
        Reply::text(TurnOutcome::Offered(kind), text)
            .with_options(vec![InteractiveOption::new(kind.option_id(), label)])
    }

    /// The user pressed the confirmation option for `kind`
    pub async fn confirm(&self, session: &mut Session, kind: OfferKind) -> Reply {
        let offer = match session.open_offer() {
            Some(offer) if offer.kind == kind => offer.clone(),
            _ => return Reply::text(TurnOutcome::OfferExpired, EXPIRED_REPLY),
        };
        if offer.status == OfferStatus::AwaitingInput {
            return Reply::text(TurnOutcome::AwaitingPhone, PHONE_PROMPT);
        }

        let catalog = Arc::clone(&self.catalog);
        let Some((persona, scenario)) = lookup(&catalog, session) else {
            session.clear_offer();
            return Reply::text(TurnOutcome::OfferExpired, EXPIRED_REPLY);
        };

        tracing::info!(user_id = %session.user_id, kind = kind.as_str(), "Offer confirmed");
        let reply = match kind {
            OfferKind::Image => self.fulfill_image(session, persona, scenario, &offer).await,
            OfferKind::VoiceNote => self.fulfill_voice_note(session, persona, &offer).await,
            OfferKind::Video => self.fulfill_video(session, persona, scenario, &offer).await,
            OfferKind::VoiceCall => self.await_phone_number(session, persona, &offer).await,
        };
        close_offer(session, reply)
    }

    /// Reserve and deduct the offer's cost. `Err` carries the reply to send.
    async fn charge(&self, user_id: &str, kind: OfferKind, cost: u64) -> Result<(), Reply> {
        match self.ledger.reserve_and_deduct(user_id, cost).await {
            Ok(Deduction::Applied { new_balance }) => {
                tracing::info!(
                    user_id = %user_id,
                    kind = kind.as_str(),
                    cost,
                    new_balance,
                    "Offer charged"
                );
                Ok(())
            }
            Ok(Deduction::Insufficient { balance, required }) => {
                Err(insufficient(kind, balance, required))
            }
            Err(e) => {
                tracing::error!(user_id = %user_id, error = %e, "Charge failed");
                Err(Reply::text(TurnOutcome::Failed(kind), CHARGE_ERROR_REPLY))
            }
        }
    }

    async fn refund(&self, user_id: &str) {
        if let Err(e) = self.ledger.rollback(user_id, None).await {
            tracing::error!(user_id = %user_id, error = %e, "Rollback failed");
        }
    }

    async fn commit(&self, user_id: &str) {
        if let Err(e) = self.ledger.commit(user_id).await {
            tracing::error!(user_id = %user_id, error = %e, "Commit failed");
        }
    }

    async fn fulfill_image(
        &self,
        session: &mut Session,
        persona: &Persona,
        scenario: &Scenario,
        offer: &Offer,
    ) -> Reply {
        let user_id = session.user_id.clone();
        if let Err(reply) = self.charge(&user_id, offer.kind, offer.unit_cost).await {
            return reply;
        }

        let (prompt, negative_prompt) =
            image_prompt(persona, scenario, session, "posing just for you", None);
        let request = ImageRequest {
            model: persona.image_model.clone(),
            prompt,
            negative_prompt,
            seed: u64::from(rand::random::<u32>()),
        };
        let artifact_ref = match self.services.image.generate_image(&request).await {
            Ok(artifact_ref) => artifact_ref,
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e.message, "Premium image failed");
                self.refund(&user_id).await;
                return Reply::text(TurnOutcome::Failed(OfferKind::Image), PHOTO_FAILED);
            }
        };

        let sent = self
            .services
            .transport
            .send_media(
                &user_id,
                MediaKind::Image,
                MediaPayload::Url(artifact_ref.clone()),
                Some(PHOTO_CAPTION),
            )
            .await;
        if let Err(e) = sent {
            tracing::warn!(user_id = %user_id, error = %e.message, "Premium image delivery failed");
            self.refund(&user_id).await;
            return Reply::text(TurnOutcome::Failed(OfferKind::Image), PHOTO_FAILED);
        }
        self.commit(&user_id).await;

        let verdict = match self.services.image.classify(&artifact_ref).await {
            Ok(verdict) => Some(verdict),
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e.message, "Classifier failed");
                None
            }
        };
        if let Some(verdict) = verdict {
            if let Some(target) = verdict_target(session.appearance, verdict) {
                session.try_transition_appearance(target, AppearanceSignal::Classifier { verdict });
            }
        }
        session.set_artifact_context(&artifact_ref, verdict);
        Reply::silent(TurnOutcome::Delivered(OfferKind::Image))
    }

    async fn fulfill_voice_note(
        &self,
        session: &mut Session,
        persona: &Persona,
        offer: &Offer,
    ) -> Reply {
        let user_id = session.user_id.clone();
        if let Err(reply) = self.charge(&user_id, offer.kind, offer.unit_cost).await {
            return reply;
        }

        let line = match self
            .services
            .text
            .generate(&voice_note_prompt(persona, session), 60)
            .await
        {
            Ok(raw) => clean_voice_text(&raw),
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e.message, "Voice note line failed");
                String::new()
            }
        };
        let line = if line.is_empty() {
            VOICE_NOTE_FALLBACK_LINE.to_string()
        } else {
            line
        };

        let audio = match self.services.speech.synthesize(&line, &persona.voice_id).await {
            Ok(audio) => audio,
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e.message, "Synthesis failed");
                self.refund(&user_id).await;
                return Reply::text(TurnOutcome::Failed(OfferKind::VoiceNote), VOICE_NOTE_FAILED);
            }
        };
        let sent = self
            .services
            .transport
            .send_media(&user_id, MediaKind::Audio, MediaPayload::Bytes(audio), None)
            .await;
        if let Err(e) = sent {
            tracing::warn!(user_id = %user_id, error = %e.message, "Voice note delivery failed");
            self.refund(&user_id).await;
            return Reply::text(TurnOutcome::Failed(OfferKind::VoiceNote), VOICE_NOTE_FAILED);
        }
        self.commit(&user_id).await;
        Reply::silent(TurnOutcome::Delivered(OfferKind::VoiceNote))
    }

    async fn fulfill_video(
        &self,
        session: &mut Session,
        persona: &Persona,
        scenario: &Scenario,
        offer: &Offer,
    ) -> Reply {
        let user_id = session.user_id.clone();
        if let Err(reply) = self.charge(&user_id, offer.kind, offer.unit_cost).await {
            return reply;
        }

        let action = offer
            .metadata
            .action
            .as_deref()
            .and_then(|key| self.catalog.video_action(key));

        let (prompt, negative_prompt) =
            image_prompt(persona, scenario, session, VIDEO_STILL_POSE, None);
        let still = self
            .services
            .image
            .generate_image(&ImageRequest {
                model: persona.image_model.clone(),
                prompt,
                negative_prompt,
                seed: u64::from(rand::random::<u32>()),
            })
            .await;
        let image_ref = match still {
            Ok(image_ref) => image_ref,
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e.message, "Video still failed");
                self.refund(&user_id).await;
                return Reply::text(TurnOutcome::Failed(OfferKind::Video), VIDEO_FAILED);
            }
        };

        let request = VideoRequest {
            image_ref,
            prompt: action.map_or(DEFAULT_VIDEO_MOTION, |a| a.prompt.as_str()).to_string(),
            lora_url: action.and_then(|a| a.lora_url.clone()),
        };
        match self
            .coordinator
            .submit_video(&user_id, offer.unit_cost, &request)
            .await
        {
            Ok(Some(_job_id)) => Reply::text(TurnOutcome::Queued(OfferKind::Video), VIDEO_QUEUED),
            Ok(None) => {
                self.refund(&user_id).await;
                Reply::text(TurnOutcome::Failed(OfferKind::Video), VIDEO_FAILED)
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e.message, "Video submission failed");
                self.refund(&user_id).await;
                Reply::text(TurnOutcome::Failed(OfferKind::Video), VIDEO_FAILED)
            }
        }
    }

    async fn await_phone_number(
        &self,
        session: &mut Session,
        persona: &Persona,
        offer: &Offer,
    ) -> Reply {
        let user_id = session.user_id.clone();
        let balance = self.ledger.balance(&user_id).await.unwrap_or(0);
        if balance < offer.unit_cost {
            return insufficient(OfferKind::VoiceCall, balance, offer.unit_cost);
        }
        if let Some(pending) = session.pending_offer.as_mut() {
            pending.status = OfferStatus::AwaitingInput;
            pending.metadata.agent_id = Some(persona.call_agent_id.clone());
        }
        Reply::text(TurnOutcome::AwaitingPhone, PHONE_PROMPT)
    }

    /// Inbound text while a call offer waits for a phone number
    pub async fn collect_phone(
        &self,
        session: &mut Session,
        persona: &Persona,
        text: &str,
    ) -> Reply {
        if text.trim().eq_ignore_ascii_case("cancel") {
            session.clear_offer();
            return Reply::text(TurnOutcome::Cancelled, CALL_CANCELLED);
        }
        let Some(phone_number) = parse_phone_number(text.trim()) else {
            return Reply::text(TurnOutcome::PhoneRejected, PHONE_INVALID);
        };
        let Some(offer) = session.awaiting_input_offer().cloned() else {
            return Reply::text(TurnOutcome::OfferExpired, EXPIRED_REPLY);
        };
        let reply = self.place_call(session, persona, &offer, phone_number).await;
        close_offer(session, reply)
    }

    async fn place_call(
        &self,
        session: &Session,
        persona: &Persona,
        offer: &Offer,
        phone_number: String,
    ) -> Reply {
        let user_id = session.user_id.clone();
        if self.coordinator.has_active_job(&user_id) {
            return Reply::text(TurnOutcome::Busy, BUSY_REPLY);
        }
        let balance = self.ledger.balance(&user_id).await.unwrap_or(0);
        if balance < offer.unit_cost {
            return insufficient(OfferKind::VoiceCall, balance, offer.unit_cost);
        }

        let request = CallRequest {
            agent_id: offer
                .metadata
                .agent_id
                .clone()
                .unwrap_or_else(|| persona.call_agent_id.clone()),
            phone_number,
            user_id: user_id.clone(),
            display_name: session.display_name.clone(),
        };
        match self.coordinator.start_call(&request).await {
            Ok(Some(_call_id)) => Reply::text(TurnOutcome::PhoneAccepted, CALL_PLACED),
            Ok(None) => Reply::text(TurnOutcome::Failed(OfferKind::VoiceCall), CALL_FAILED),
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e.message, "Call start failed");
                Reply::text(TurnOutcome::Failed(OfferKind::VoiceCall), CALL_FAILED)
            }
        }
    }
}

/// Close the slot after a confirmation. An offer that was taken up stays
/// behind as `fulfilled`; one that failed is dropped.
fn close_offer(session: &mut Session, reply: Reply) -> Reply {
    match reply.outcome {
        TurnOutcome::Delivered(_) | TurnOutcome::Queued(_) | TurnOutcome::PhoneAccepted => {
            session.fulfill_offer();
        }
        TurnOutcome::AwaitingPhone => {}
        _ => session.clear_offer(),
    }
    reply
}

fn lookup<'a>(catalog: &'a Catalog, session: &Session) -> Option<(&'a Persona, &'a Scenario)> {
    catalog.lookup(session.persona_id.as_deref()?, session.scenario_id.as_deref()?)
}

fn insufficient(kind: OfferKind, balance: u64, cost: u64) -> Reply {
    let per = if kind.is_metered() { " per minute" } else { "" };
    Reply::text(
        TurnOutcome::InsufficientFunds(kind),
        format!(
            "That costs {cost} gems{per} and you have {balance}. \
             Top up your gems to unlock it."
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FulfillmentConfig;
    use crate::providers::{CallStatus, ProviderError};
    use crate::runtime::testing::{Outbound, TestServices};
    use crate::state_machine::{AppearanceState, Verdict};
    use std::time::Duration;

    struct Fixture {
        t: TestServices,
        offers: Offers,
        ledger: Arc<Ledger>,
        coordinator: Arc<FulfillmentCoordinator>,
        session: Session,
    }

    fn fixture(balance: u64) -> Fixture {
        let t = TestServices::new().with_account("u1", balance);
        let services = t.services();
        let catalog = Arc::new(Catalog::builtin());
        let ledger = Arc::new(Ledger::new(services.accounts.clone()));
        let coordinator = Arc::new(FulfillmentCoordinator::new(
            &services,
            ledger.clone(),
            FulfillmentConfig {
                poll_interval: Duration::from_secs(3600),
                call_monitor_interval: Duration::from_secs(3600),
                ..FulfillmentConfig::default()
            },
            50,
        ));
        let offers = Offers::new(
            services,
            catalog.clone(),
            Pricing::default(),
            ledger.clone(),
            coordinator.clone(),
        );
        let (_, scenario) = catalog.lookup("isabella", "cooking_class").unwrap();
        let mut session = Session::new("u1");
        session.select_persona_scenario(
            "isabella",
            "cooking_class",
            &scenario.first_message,
            &scenario.attire,
        );
        Fixture {
            t,
            offers,
            ledger,
            coordinator,
            session,
        }
    }

    #[tokio::test]
    async fn insufficient_balance_creates_no_offer_and_reserves_nothing() {
        let mut f = fixture(25);
        let reply = f.offers.propose(&mut f.session, OfferKind::VoiceNote, None).await;
        assert_eq!(reply.outcome, TurnOutcome::InsufficientFunds(OfferKind::VoiceNote));
        assert!(reply.text.contains("30 gems"));
        assert!(f.session.pending_offer.is_none());
        assert!(!f.ledger.has_reservation("u1").await.unwrap());
        assert_eq!(f.ledger.balance("u1").await.unwrap(), 25);
    }

    #[tokio::test]
    async fn offer_carries_a_confirmation_option() {
        let mut f = fixture(100);
        let reply = f.offers.propose(&mut f.session, OfferKind::Image, None).await;
        assert_eq!(reply.outcome, TurnOutcome::Offered(OfferKind::Image));
        assert_eq!(reply.options.len(), 1);
        assert_eq!(reply.options[0].id, "offer:image");
        assert_eq!(f.session.open_offer().unwrap().unit_cost, 10);
    }

    #[tokio::test]
    async fn confirmed_image_is_delivered_and_committed() {
        let mut f = fixture(100);
        f.t.image.queue_verdict(Verdict::Suggestive);
        f.offers.propose(&mut f.session, OfferKind::Image, None).await;

        let reply = f.offers.confirm(&mut f.session, OfferKind::Image).await;
        assert_eq!(reply.outcome, TurnOutcome::Delivered(OfferKind::Image));
        assert_eq!(f.t.transport.media_count(MediaKind::Image), 1);
        assert_eq!(f.ledger.balance("u1").await.unwrap(), 90);
        assert!(!f.ledger.has_reservation("u1").await.unwrap());
        assert_eq!(
            f.session.pending_offer.as_ref().map(|o| o.status),
            Some(OfferStatus::Fulfilled)
        );
        assert!(f.session.open_offer().is_none());
        // the verdict moved the appearance one step and the reply step will know
        assert_eq!(f.session.appearance, AppearanceState::Transitioning);
        assert!(f.session.last_artifact.is_some());
        assert_eq!(f.session.artifacts_delivered, 0);
    }

    #[tokio::test]
    async fn failed_image_rolls_back() {
        let mut f = fixture(100);
        f.t.image.queue_error(ProviderError::server_error("boom"));
        f.offers.propose(&mut f.session, OfferKind::Image, None).await;

        let reply = f.offers.confirm(&mut f.session, OfferKind::Image).await;
        assert_eq!(reply.outcome, TurnOutcome::Failed(OfferKind::Image));
        assert_eq!(f.ledger.balance("u1").await.unwrap(), 100);
        assert!(!f.ledger.has_reservation("u1").await.unwrap());
    }

    #[tokio::test]
    async fn confirming_without_an_open_offer_expires() {
        let mut f = fixture(100);
        let reply = f.offers.confirm(&mut f.session, OfferKind::Video).await;
        assert_eq!(reply.outcome, TurnOutcome::OfferExpired);
        assert_eq!(f.ledger.balance("u1").await.unwrap(), 100);
    }

    #[tokio::test]
    async fn voice_note_uses_cleaned_line_and_persona_voice() {
        let mut f = fixture(100);
        f.t.text.queue_reply("*giggles* [soft] Come closer...");
        f.offers.propose(&mut f.session, OfferKind::VoiceNote, None).await;

        let reply = f.offers.confirm(&mut f.session, OfferKind::VoiceNote).await;
        assert_eq!(reply.outcome, TurnOutcome::Delivered(OfferKind::VoiceNote));
        let synthesized = f.t.speech.synthesized.lock().unwrap().clone();
        assert_eq!(
            synthesized,
            vec![("giggles Come closer...".to_string(), "voice-isabella".to_string())]
        );
        assert_eq!(f.t.transport.media_count(MediaKind::Audio), 1);
        assert_eq!(f.ledger.balance("u1").await.unwrap(), 70);
    }

    #[tokio::test]
    async fn voice_note_synthesis_failure_refunds() {
        let mut f = fixture(100);
        f.t.speech.fail_synthesis();
        f.offers.propose(&mut f.session, OfferKind::VoiceNote, None).await;
        let reply = f.offers.confirm(&mut f.session, OfferKind::VoiceNote).await;
        assert_eq!(reply.outcome, TurnOutcome::Failed(OfferKind::VoiceNote));
        assert_eq!(f.ledger.balance("u1").await.unwrap(), 100);
    }

    #[tokio::test]
    async fn video_is_queued_with_the_requested_action() {
        let mut f = fixture(500);
        f.offers
            .propose(&mut f.session, OfferKind::Video, Some("twirl".to_string()))
            .await;
        let reply = f.offers.confirm(&mut f.session, OfferKind::Video).await;

        assert_eq!(reply.outcome, TurnOutcome::Queued(OfferKind::Video));
        let requests = f.t.video.requests.lock().unwrap().clone();
        assert_eq!(requests[0].prompt, "she twirls slowly in place");
        assert_eq!(f.ledger.balance("u1").await.unwrap(), 420);
        assert!(f.ledger.has_reservation("u1").await.unwrap());
        // job in flight: no new offers
        let busy = f.offers.propose(&mut f.session, OfferKind::Image, None).await;
        assert_eq!(busy.outcome, TurnOutcome::Busy);
        f.coordinator.shutdown();
    }

    #[tokio::test]
    async fn refused_video_restores_the_balance() {
        let mut f = fixture(500);
        f.t.video.queue_submission(Ok(None));
        f.offers.propose(&mut f.session, OfferKind::Video, None).await;
        let reply = f.offers.confirm(&mut f.session, OfferKind::Video).await;
        assert_eq!(reply.outcome, TurnOutcome::Failed(OfferKind::Video));
        assert_eq!(f.ledger.balance("u1").await.unwrap(), 500);
        assert!(!f.ledger.has_reservation("u1").await.unwrap());
    }

    #[tokio::test]
    async fn call_flow_collects_a_phone_number() {
        let mut f = fixture(200);
        f.t.speech.queue_status(CallStatus::Active);
        f.offers.propose(&mut f.session, OfferKind::VoiceCall, None).await;

        let reply = f.offers.confirm(&mut f.session, OfferKind::VoiceCall).await;
        assert_eq!(reply.outcome, TurnOutcome::AwaitingPhone);
        assert!(f.session.awaiting_input_offer().is_some());

        let (catalog, persona_id) = (Catalog::builtin(), "isabella");
        let persona = catalog.persona(persona_id).unwrap();
        let rejected = f.offers.collect_phone(&mut f.session, persona, "tomorrow?").await;
        assert_eq!(rejected.outcome, TurnOutcome::PhoneRejected);
        assert!(f.session.awaiting_input_offer().is_some());

        let accepted = f
            .offers
            .collect_phone(&mut f.session, persona, "+1 555 123 4567")
            .await;
        assert_eq!(accepted.outcome, TurnOutcome::PhoneAccepted);
        assert_eq!(
            f.session.pending_offer.as_ref().map(|o| o.status),
            Some(OfferStatus::Fulfilled)
        );
        let requests = f.t.speech.call_requests.lock().unwrap().clone();
        assert_eq!(requests[0].phone_number, "+15551234567");
        assert_eq!(requests[0].agent_id, "agent-isabella");
        // nothing is charged until the call ends
        assert_eq!(f.ledger.balance("u1").await.unwrap(), 200);
        assert!(f.coordinator.has_active_job("u1"));
        f.coordinator.shutdown();
    }

    #[tokio::test]
    async fn call_can_be_cancelled() {
        let mut f = fixture(200);
        f.offers.propose(&mut f.session, OfferKind::VoiceCall, None).await;
        f.offers.confirm(&mut f.session, OfferKind::VoiceCall).await;
        let catalog = Catalog::builtin();
        let persona = catalog.persona("isabella").unwrap();
        let reply = f.offers.collect_phone(&mut f.session, persona, "Cancel").await;
        assert_eq!(reply.outcome, TurnOutcome::Cancelled);
        assert!(f.session.pending_offer.is_none());
        assert!(f.t.transport.messages().iter().all(|m| !matches!(m, Outbound::Media { .. })));
    }
}
