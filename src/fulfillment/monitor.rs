//! Metered call tracking
//!
//! Calls are billed per started minute once they end. While a call runs the
//! monitor compares elapsed minutes with what the balance can cover.

use tokio::time::Instant;

/// A live voice call
#[derive(Debug, Clone)]
pub struct CallJob {
    pub user_id: String,
    pub started: Instant,
    /// Minutes the balance covered when the call started
    pub ceiling_minutes: u64,
    pub warned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallAction {
    Continue,
    /// One minute of balance left
    Warn,
    /// Balance exhausted; hang up and bill
    Terminate,
    /// Hard wall-clock limit reached
    Failsafe,
}

/// Why a call ended, as written to the call log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEnd {
    Natural,
    Ceiling,
    Failsafe,
}

impl CallEnd {
    pub fn as_str(self) -> &'static str {
        match self {
            CallEnd::Natural => "completed",
            CallEnd::Ceiling => "terminated_balance",
            CallEnd::Failsafe => "terminated_failsafe",
        }
    }
}

pub fn affordable_minutes(balance: u64, per_minute: u64) -> u64 {
    balance.checked_div(per_minute).unwrap_or(u64::MAX)
}

/// Started minutes, never less than one
pub fn billable_minutes(duration_secs: u64) -> u64 {
    duration_secs.div_ceil(60).max(1)
}

/// Minutes to bill for a finished call. A call we hung up is billed no
/// further than the ceiling it was stopped at, whatever the monitor overshot.
pub fn settled_minutes(duration_secs: u64, cap_minutes: Option<u64>) -> u64 {
    let minutes = billable_minutes(duration_secs);
    cap_minutes.map_or(minutes, |cap| minutes.min(cap))
}

pub fn evaluate_call(
    elapsed_minutes: u64,
    ceiling_minutes: u64,
    warned: bool,
    failsafe_minutes: u64,
) -> CallAction {
    if elapsed_minutes >= failsafe_minutes {
        return CallAction::Failsafe;
    }
    if elapsed_minutes >= ceiling_minutes {
        return CallAction::Terminate;
    }
    if !warned && elapsed_minutes + 1 >= ceiling_minutes {
        return CallAction::Warn;
    }
    CallAction::Continue
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warning_then_termination_at_the_ceiling() {
        // 250 gems at 50/min
        let ceiling = affordable_minutes(250, 50);
        assert_eq!(ceiling, 5);
        assert_eq!(evaluate_call(2, ceiling, false, 60), CallAction::Continue);
        assert_eq!(evaluate_call(4, ceiling, false, 60), CallAction::Warn);
        assert_eq!(evaluate_call(4, ceiling, true, 60), CallAction::Continue);
        assert_eq!(evaluate_call(5, ceiling, true, 60), CallAction::Terminate);
    }

    #[test]
    fn failsafe_wins_over_everything() {
        assert_eq!(evaluate_call(60, u64::MAX, false, 60), CallAction::Failsafe);
        assert_eq!(evaluate_call(60, 3, false, 60), CallAction::Failsafe);
    }

    #[test]
    fn billing_rounds_up_with_a_one_minute_floor() {
        assert_eq!(billable_minutes(0), 1);
        assert_eq!(billable_minutes(60), 1);
        assert_eq!(billable_minutes(61), 2);
        assert_eq!(billable_minutes(299), 5);
    }

    #[test]
    fn hung_up_calls_bill_at_most_the_ceiling() {
        // stopped at a 2 minute ceiling, noticed 10 s late
        assert_eq!(settled_minutes(130, Some(2)), 2);
        assert_eq!(settled_minutes(130, None), 3);
        assert_eq!(settled_minutes(20, Some(2)), 1);
    }

    #[test]
    fn free_calls_have_no_ceiling() {
        assert_eq!(affordable_minutes(10, 0), u64::MAX);
    }
}
