//! Condition ledger: transition-time semantics and the retry-delay policy.
//!
//! All functions take `now` explicitly so the policy is a pure function of
//! its inputs; the orchestrator passes `Utc::now()`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use coral_model::{ComponentStatus, Condition, ConditionStatus, ConditionType};

/// Retry delays double with elapsed failure time but never exceed this.
pub const MAX_RETRY: Duration = Duration::from_secs(6 * 60 * 60);

const MIN_RETRY: Duration = Duration::from_secs(1);

/// Set `type_` on the status. `lastUpdateTime` is stamped unconditionally;
/// `lastTransitionTime` only moves when the status value flips.
pub fn set_condition(
    status: &mut ComponentStatus,
    type_: ConditionType,
    new: ConditionStatus,
    reason: Option<String>,
    message: Option<String>,
    now: DateTime<Utc>,
) {
    let transition = match status.condition(type_) {
        Some(prev) if prev.status == new => prev.last_transition_time,
        _ => Some(now),
    };
    status.put_condition(Condition {
        type_,
        status: new,
        reason,
        message,
        last_update_time: Some(now),
        last_transition_time: transition,
    });
}

/// Next retry delay given the condition as it was *before* this pass's
/// failure was recorded: 1s after a fresh or previously-true condition,
/// otherwise twice the time since the last update, capped at six hours and
/// rounded to whole seconds.
pub fn retry_delay(previous: Option<&Condition>, now: DateTime<Utc>) -> Duration {
    let prev = match previous {
        Some(p) if p.status != ConditionStatus::True => p,
        _ => return MIN_RETRY,
    };
    let last = match prev.last_update_time {
        Some(t) => t,
        None => return MIN_RETRY,
    };
    let elapsed_ms = (now - last).num_milliseconds();
    if elapsed_ms <= 0 {
        return MIN_RETRY;
    }
    let secs = (2 * elapsed_ms + 500) / 1000;
    Duration::from_secs(secs.max(1) as u64).min(MAX_RETRY).max(MIN_RETRY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn failed_at(secs: i64) -> Condition {
        Condition {
            type_: ConditionType::Reconciled,
            status: ConditionStatus::False,
            reason: Some("ReconcileFailed".into()),
            message: None,
            last_update_time: Some(at(secs)),
            last_transition_time: Some(at(secs)),
        }
    }

    #[test]
    fn transition_time_moves_only_on_flips() {
        let mut st = ComponentStatus::default();
        set_condition(&mut st, ConditionType::Reconciled, ConditionStatus::False, None, None, at(0));
        set_condition(&mut st, ConditionType::Reconciled, ConditionStatus::False, None, None, at(10));
        let c = st.condition(ConditionType::Reconciled).unwrap();
        assert_eq!(c.last_transition_time, Some(at(0)));
        assert_eq!(c.last_update_time, Some(at(10)));

        set_condition(&mut st, ConditionType::Reconciled, ConditionStatus::True, None, None, at(20));
        let c = st.condition(ConditionType::Reconciled).unwrap();
        assert_eq!(c.last_transition_time, Some(at(20)));
    }

    #[test]
    fn update_time_always_advances() {
        let mut st = ComponentStatus::default();
        for s in [0, 5, 9] {
            set_condition(&mut st, ConditionType::Reconciled, ConditionStatus::False, None, None, at(s));
            let c = st.condition(ConditionType::Reconciled).unwrap();
            assert_eq!(c.last_update_time, Some(at(s)));
        }
    }

    #[test]
    fn first_failure_retries_after_one_second() {
        assert_eq!(retry_delay(None, at(0)), Duration::from_secs(1));
        let mut prev = failed_at(0);
        prev.status = ConditionStatus::True;
        assert_eq!(retry_delay(Some(&prev), at(100)), Duration::from_secs(1));
    }

    #[test]
    fn delay_doubles_elapsed_failure_time() {
        assert_eq!(retry_delay(Some(&failed_at(0)), at(1)), Duration::from_secs(2));
        assert_eq!(retry_delay(Some(&failed_at(0)), at(4)), Duration::from_secs(8));
        assert_eq!(retry_delay(Some(&failed_at(100)), at(160)), Duration::from_secs(120));
    }

    #[test]
    fn delay_never_decreases_while_failing_and_caps_at_six_hours() {
        let mut last = Duration::ZERO;
        for elapsed in [1, 2, 4, 8, 1_000, 20_000, 100_000] {
            let d = retry_delay(Some(&failed_at(0)), at(elapsed));
            assert!(d >= last, "delay shrank: {d:?} < {last:?}");
            last = d;
        }
        assert_eq!(last, MAX_RETRY);
    }
}
