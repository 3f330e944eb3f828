//! Session state machine
//!
//! `Session` is the per-user document; the appearance transitions it allows
//! are decided by the pure functions in `transition`.

pub mod event;
pub mod state;
pub(crate) mod transition;

#[cfg(test)]
mod proptests;

pub use event::{AppearanceSignal, Verdict};
pub use state::{
    AppearanceState, ArtifactContext, Offer, OfferKind, OfferStatus, Role, Session, Turn,
};
pub use transition::{cadence_due, keyword_target, verdict_target};
