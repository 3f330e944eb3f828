//! Property-based tests for the appearance state machine

use super::event::{AppearanceSignal, Verdict};
use super::state::{AppearanceState, Session};
use super::transition::{cadence_due, keyword_target, verdict_target};
use proptest::prelude::*;

// ============================================================================
// Arbitrary Generators
// ============================================================================

fn arb_state() -> impl Strategy<Value = AppearanceState> {
    prop_oneof![
        Just(AppearanceState::Initial),
        Just(AppearanceState::Transitioning),
        Just(AppearanceState::Revealed),
    ]
}

fn arb_verdict() -> impl Strategy<Value = Verdict> {
    prop_oneof![
        Just(Verdict::Safe),
        Just(Verdict::Suggestive),
        Just(Verdict::Explicit),
    ]
}

fn arb_signal() -> impl Strategy<Value = AppearanceSignal> {
    prop_oneof![
        Just(AppearanceSignal::Keyword),
        arb_verdict().prop_map(|verdict| AppearanceSignal::Classifier { verdict }),
    ]
}

/// A requested transition: the target the caller asks for plus its signal
fn arb_attempt() -> impl Strategy<Value = (AppearanceState, AppearanceSignal)> {
    (arb_state(), arb_signal())
}

fn scenario_session() -> Session {
    let mut session = Session::new("prop-user");
    session.select_persona_scenario("p", "s", "hi", "a coat");
    session
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    /// Whatever sequence of attempts arrives, recorded history never moves backwards
    #[test]
    fn appearance_history_is_non_decreasing(
        attempts in prop::collection::vec(arb_attempt(), 0..40),
    ) {
        let mut session = scenario_session();
        for (target, signal) in attempts {
            let before = session.appearance;
            let applied = session.try_transition_appearance(target, signal);
            if applied {
                prop_assert_eq!(before.successor(), Some(session.appearance));
            } else {
                prop_assert_eq!(before, session.appearance);
            }
        }
        for pair in session.appearance_history.windows(2) {
            prop_assert!(pair[0].to <= pair[1].from);
        }
        for record in &session.appearance_history {
            prop_assert!(record.from < record.to);
        }
    }

    /// Keywords alone can never reveal
    #[test]
    fn keywords_never_reach_revealed(targets in prop::collection::vec(arb_state(), 0..20)) {
        let mut session = scenario_session();
        for target in targets {
            session.try_transition_appearance(target, AppearanceSignal::Keyword);
        }
        prop_assert!(session.appearance < AppearanceState::Revealed);
    }

    /// A single applied transition is always exactly one step
    #[test]
    fn no_state_is_skipped(state in arb_state(), verdict in arb_verdict()) {
        if let Some(target) = verdict_target(state, verdict) {
            prop_assert_eq!(state.successor(), Some(target));
        }
        if let Some(target) = keyword_target(state) {
            prop_assert_eq!(state.successor(), Some(target));
        }
    }

    /// The cadence never fires past the included-artifact limit
    #[test]
    fn cadence_respects_limit(turns in 0u32..100, delivered in 0u32..30) {
        if cadence_due(turns, delivered, 3, 4, 12) {
            prop_assert!(delivered < 12);
            prop_assert!(turns >= 3);
        }
    }
}
