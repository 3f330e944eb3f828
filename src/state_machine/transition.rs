//! Pure appearance and cadence decisions
//!
//! Nothing here touches a session; callers feed the current state in and
//! apply whatever comes back.

use super::event::{AppearanceSignal, Verdict};
use super::state::AppearanceState;

/// Whether `to` is the unique successor of `from`
pub fn allowed(from: AppearanceState, to: AppearanceState) -> bool {
    from.successor() == Some(to)
}

/// Whether `signal` may drive `from -> to`.
///
/// A keyword can only start the transition. Reaching `Revealed` takes an
/// explicit verdict on a generated artifact.
pub fn permits(from: AppearanceState, to: AppearanceState, signal: AppearanceSignal) -> bool {
    if !allowed(from, to) {
        return false;
    }
    match (to, signal) {
        (AppearanceState::Transitioning, AppearanceSignal::Keyword) => true,
        (AppearanceState::Transitioning, AppearanceSignal::Classifier { verdict }) => {
            verdict >= Verdict::Suggestive
        }
        (AppearanceState::Revealed, AppearanceSignal::Classifier { verdict }) => {
            verdict == Verdict::Explicit
        }
        _ => false,
    }
}

/// Target state for a classifier verdict on an artifact generated while in
/// `current`. At most one step per artifact.
pub fn verdict_target(current: AppearanceState, verdict: Verdict) -> Option<AppearanceState> {
    match (current, verdict) {
        (_, Verdict::Safe) => None,
        (AppearanceState::Initial, Verdict::Suggestive | Verdict::Explicit) => {
            Some(AppearanceState::Transitioning)
        }
        (AppearanceState::Transitioning, Verdict::Explicit) => Some(AppearanceState::Revealed),
        _ => None,
    }
}

/// Target state when reveal vocabulary shows up in user text
pub fn keyword_target(current: AppearanceState) -> Option<AppearanceState> {
    (current == AppearanceState::Initial).then_some(AppearanceState::Transitioning)
}

/// Whether the included-artifact cadence fires this turn.
///
/// The first artifact is due after `first_threshold` turns; later ones every
/// `interval` turns. Nothing is due once `limit` artifacts were delivered.
pub fn cadence_due(
    turns_since_artifact: u32,
    artifacts_delivered: u32,
    first_threshold: u32,
    interval: u32,
    limit: u32,
) -> bool {
    if artifacts_delivered >= limit {
        return false;
    }
    let threshold = if artifacts_delivered == 0 {
        first_threshold
    } else {
        interval
    };
    turns_since_artifact >= threshold
}
