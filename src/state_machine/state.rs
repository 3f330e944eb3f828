//! Session document and its conversational sub-state

use super::event::{AppearanceSignal, Verdict};
use super::transition::permits;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// Appearance
// ============================================================================

/// Monotonic appearance state. The derive order is the transition order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum AppearanceState {
    #[default]
    Initial,
    Transitioning,
    Revealed,
}

impl AppearanceState {
    /// The unique allowed successor, if any
    pub fn successor(self) -> Option<Self> {
        match self {
            AppearanceState::Initial => Some(AppearanceState::Transitioning),
            AppearanceState::Transitioning => Some(AppearanceState::Revealed),
            AppearanceState::Revealed => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AppearanceState::Initial => "initial",
            AppearanceState::Transitioning => "transitioning",
            AppearanceState::Revealed => "revealed",
        }
    }
}

impl fmt::Display for AppearanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One applied appearance transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: AppearanceState,
    pub to: AppearanceState,
    pub signal: AppearanceSignal,
    pub at: DateTime<Utc>,
}

// ============================================================================
// Turns
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub at: DateTime<Utc>,
}

// ============================================================================
// Offers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferKind {
    Image,
    Video,
    VoiceNote,
    VoiceCall,
}

impl OfferKind {
    pub const ALL: [OfferKind; 4] = [
        OfferKind::Image,
        OfferKind::Video,
        OfferKind::VoiceNote,
        OfferKind::VoiceCall,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OfferKind::Image => "image",
            OfferKind::Video => "video",
            OfferKind::VoiceNote => "voice_note",
            OfferKind::VoiceCall => "voice_call",
        }
    }

    /// Option id used for the confirmation button
    pub fn option_id(self) -> String {
        format!("offer:{}", self.as_str())
    }

    pub fn from_option_id(option_id: &str) -> Option<Self> {
        let kind = option_id.strip_prefix("offer:")?;
        Self::ALL.into_iter().find(|k| k.as_str() == kind)
    }

    /// Whether the unit cost is charged per minute rather than once
    pub fn is_metered(self) -> bool {
        matches!(self, OfferKind::VoiceCall)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferStatus {
    Pending,
    /// Confirmed, waiting for more input from the user (phone number)
    AwaitingInput,
    Fulfilled,
    Expired,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OfferMetadata {
    /// Detected action key for video requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Call agent for voice-call offers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub kind: OfferKind,
    pub unit_cost: u64,
    pub status: OfferStatus,
    #[serde(default)]
    pub metadata: OfferMetadata,
    pub created_at: DateTime<Utc>,
}

impl Offer {
    pub fn new(kind: OfferKind, unit_cost: u64) -> Self {
        Self {
            kind,
            unit_cost,
            status: OfferStatus::Pending,
            metadata: OfferMetadata::default(),
            created_at: Utc::now(),
        }
    }

    pub fn with_action(mut self, action: Option<String>) -> Self {
        self.metadata.action = action;
        self
    }

    /// Pending and awaiting-input offers occupy the slot
    pub fn is_open(&self) -> bool {
        matches!(self.status, OfferStatus::Pending | OfferStatus::AwaitingInput)
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("an offer for {0} is already open")]
pub struct OfferSlotOccupied(pub &'static str);

// ============================================================================
// Artifacts
// ============================================================================

/// What the reply step needs to know about the last delivered artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactContext {
    pub artifact_ref: String,
    pub appearance: AppearanceState,
    pub attire: String,
    #[serde(default)]
    pub verdict: Option<Verdict>,
    pub delivered_at: DateTime<Utc>,
}

// ============================================================================
// Session
// ============================================================================

/// One user's session document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub persona_id: Option<String>,
    pub scenario_id: Option<String>,
    #[serde(default)]
    pub turns: Vec<Turn>,
    pub display_name: Option<String>,
    #[serde(default)]
    pub appearance: AppearanceState,
    #[serde(default)]
    pub appearance_history: Vec<TransitionRecord>,
    /// Attire description active for the current scenario
    #[serde(default)]
    pub attire: String,
    #[serde(default)]
    pub artifacts_delivered: u32,
    #[serde(default)]
    pub turns_since_artifact: u32,
    #[serde(default)]
    pub scenario_turns: u32,
    #[serde(default)]
    pub pending_offer: Option<Offer>,
    pub last_turn_at: Option<DateTime<Utc>>,
    pub last_offer_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_artifact: Option<ArtifactContext>,
    /// Bumped on every mutation that should be persisted; the store keeps the highest
    #[serde(default)]
    pub revision: u64,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            persona_id: None,
            scenario_id: None,
            turns: Vec::new(),
            display_name: None,
            appearance: AppearanceState::Initial,
            appearance_history: Vec::new(),
            attire: String::new(),
            artifacts_delivered: 0,
            turns_since_artifact: 0,
            scenario_turns: 0,
            pending_offer: None,
            last_turn_at: None,
            last_offer_at: None,
            last_artifact: None,
            revision: 0,
            created_at: Utc::now(),
        }
    }

    #[allow(dead_code)] // Used in tests
    pub fn has_scenario(&self) -> bool {
        self.persona_id.is_some() && self.scenario_id.is_some()
    }

    /// Switch persona/scenario. Conversational sub-state is reset; identity
    /// (user id, display name) survives.
    pub fn select_persona_scenario(
        &mut self,
        persona_id: &str,
        scenario_id: &str,
        first_message: &str,
        attire: &str,
    ) {
        self.persona_id = Some(persona_id.to_string());
        self.scenario_id = Some(scenario_id.to_string());
        self.turns.clear();
        self.appearance = AppearanceState::Initial;
        self.appearance_history.clear();
        self.attire = attire.to_string();
        self.artifacts_delivered = 0;
        self.turns_since_artifact = 0;
        self.scenario_turns = 0;
        self.pending_offer = None;
        self.last_offer_at = None;
        self.last_artifact = None;
        self.turns.push(Turn {
            role: Role::Assistant,
            text: first_message.to_string(),
            at: Utc::now(),
        });
        self.bump();
    }

    /// Append a turn, evicting the oldest entries beyond `cap`
    pub fn push_turn(&mut self, role: Role, text: impl Into<String>, cap: usize) {
        let now = Utc::now();
        self.turns.push(Turn {
            role,
            text: text.into(),
            at: now,
        });
        if self.turns.len() > cap {
            let excess = self.turns.len() - cap;
            self.turns.drain(..excess);
        }
        if role == Role::User {
            self.last_turn_at = Some(now);
        }
    }

    /// The last `n` turns, oldest first
    pub fn recent_turns(&self, n: usize) -> &[Turn] {
        let start = self.turns.len().saturating_sub(n);
        &self.turns[start..]
    }

    /// Apply `target` only if it is the unique successor of the current state
    /// and the signal is allowed to drive it. A `false` return is a no-op.
    pub fn try_transition_appearance(
        &mut self,
        target: AppearanceState,
        signal: AppearanceSignal,
    ) -> bool {
        let from = self.appearance;
        if !permits(from, target, signal) {
            tracing::info!(
                user_id = %self.user_id,
                from = %from,
                to = %target,
                ?signal,
                "Rejected appearance transition"
            );
            return false;
        }
        self.appearance = target;
        self.appearance_history.push(TransitionRecord {
            from,
            to: target,
            signal,
            at: Utc::now(),
        });
        tracing::info!(
            user_id = %self.user_id,
            from = %from,
            to = %target,
            "Appearance transition"
        );
        true
    }

    /// Occupy the single offer slot
    pub fn create_offer(&mut self, offer: Offer) -> Result<(), OfferSlotOccupied> {
        if let Some(existing) = &self.pending_offer {
            if existing.is_open() {
                return Err(OfferSlotOccupied(existing.kind.as_str()));
            }
        }
        self.last_offer_at = Some(offer.created_at);
        self.pending_offer = Some(offer);
        Ok(())
    }

    /// Expire a `pending` offer that was not confirmed before the next turn.
    /// Awaiting-input offers are left alone. The expired offer stays in the
    /// slot until the next one replaces it. Returns the expired kind.
    pub fn expire_pending_offer(&mut self) -> Option<OfferKind> {
        match &mut self.pending_offer {
            Some(offer) if offer.status == OfferStatus::Pending => {
                offer.status = OfferStatus::Expired;
                Some(offer.kind)
            }
            _ => None,
        }
    }

    /// The open offer was taken up
    pub fn fulfill_offer(&mut self) {
        if let Some(offer) = self.pending_offer.as_mut().filter(|o| o.is_open()) {
            offer.status = OfferStatus::Fulfilled;
        }
    }

    pub fn clear_offer(&mut self) {
        self.pending_offer = None;
    }

    pub fn open_offer(&self) -> Option<&Offer> {
        self.pending_offer.as_ref().filter(|o| o.is_open())
    }

    pub fn awaiting_input_offer(&self) -> Option<&Offer> {
        self.pending_offer
            .as_ref()
            .filter(|o| o.status == OfferStatus::AwaitingInput)
    }

    /// Record an included artifact. The caller resets `turns_since_artifact`.
    pub fn record_artifact(&mut self, artifact_ref: &str, verdict: Option<Verdict>) {
        self.artifacts_delivered += 1;
        self.set_artifact_context(artifact_ref, verdict);
    }

    /// Remember what the user last saw without counting it against the
    /// included-artifact schedule
    pub fn set_artifact_context(&mut self, artifact_ref: &str, verdict: Option<Verdict>) {
        self.last_artifact = Some(ArtifactContext {
            artifact_ref: artifact_ref.to_string(),
            appearance: self.appearance,
            attire: self.attire.clone(),
            verdict,
            delivered_at: Utc::now(),
        });
    }

    /// Mark the document dirty; the new revision is what gets persisted
    pub fn bump(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }
}
