//! Pure state-machine transitions for the circuit breaker.
//!
//! Every function takes the current record and "now" and returns the next
//! record; nothing here touches storage. Transitions never skip a state:
//! closed -> open -> half_open -> {closed | open}.

use super::BreakerVerdict;
use crate::state::{BreakerRecord, CircuitState};
use chrono::{DateTime, Duration, Utc};

/// Evaluate a call check. Returns the transitioned record (when the check
/// itself moves the state, i.e. open -> half_open) and the verdict.
pub fn check(
    record: BreakerRecord,
    now: DateTime<Utc>,
) -> (Option<BreakerRecord>, BreakerVerdict) {
    match record.state {
        CircuitState::Closed => (
            None,
            BreakerVerdict {
                allowed: true,
                fallback: None,
                state: CircuitState::Closed,
            },
        ),
        CircuitState::Open => {
            let recovered = record
                .opened_at
                .map(|opened| now - opened >= Duration::milliseconds(record.recovery_ms))
                .unwrap_or(false);

            if recovered {
                let mut next = record;
                next.state = CircuitState::HalfOpen;
                next.half_open_at = Some(now);
                (
                    Some(next),
                    BreakerVerdict {
                        allowed: true,
                        fallback: None,
                        state: CircuitState::HalfOpen,
                    },
                )
            } else {
                let fallback = record.fallback_model.clone();
                (
                    None,
                    BreakerVerdict {
                        allowed: false,
                        fallback: Some(fallback),
                        state: CircuitState::Open,
                    },
                )
            }
        }
        // One probe is intended here; concurrent checks are not serialized
        // against each other, so this is a best-effort single probe.
        CircuitState::HalfOpen => (
            None,
            BreakerVerdict {
                allowed: true,
                fallback: None,
                state: CircuitState::HalfOpen,
            },
        ),
    }
}

/// Apply a successful call.
pub fn on_success(mut record: BreakerRecord, now: DateTime<Utc>) -> BreakerRecord {
    record.success_count += 1;
    record.last_success_at = Some(now);

    if record.state == CircuitState::HalfOpen {
        // Successful probe: close the circuit
        record.state = CircuitState::Closed;
        record.failure_count = 0;
        record.opened_at = None;
        record.half_open_at = None;
    }

    record
}

/// Apply a failed call.
pub fn on_failure(mut record: BreakerRecord, now: DateTime<Utc>) -> BreakerRecord {
    record.failure_count += 1;
    record.last_failure_at = Some(now);

    match record.state {
        CircuitState::HalfOpen => {
            // Failed probe: reopen with a fresh cooldown
            record.state = CircuitState::Open;
            record.opened_at = Some(now);
            record.half_open_at = None;
        }
        CircuitState::Closed if record.failure_count >= record.threshold => {
            record.state = CircuitState::Open;
            record.opened_at = Some(now);
        }
        _ => {}
    }

    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::BreakerDefaults;

    fn record() -> BreakerRecord {
        BreakerRecord::new("openai", "gpt-4o", &BreakerDefaults::default())
    }

    #[test]
    fn test_closed_check_is_allowed_without_transition() {
        let (next, verdict) = check(record(), Utc::now());
        assert!(next.is_none());
        assert!(verdict.allowed);
    }

    #[test]
    fn test_failure_below_threshold_keeps_closed() {
        let now = Utc::now();
        let mut r = record();
        for _ in 0..4 {
            r = on_failure(r, now);
        }
        assert_eq!(r.state, CircuitState::Closed);
        assert_eq!(r.failure_count, 4);
    }

    #[test]
    fn test_failure_at_threshold_opens() {
        let now = Utc::now();
        let mut r = record();
        for _ in 0..5 {
            r = on_failure(r, now);
        }
        assert_eq!(r.state, CircuitState::Open);
        assert_eq!(r.opened_at, Some(now));
    }

    #[test]
    fn test_open_denies_with_fallback_until_recovery() {
        let opened = Utc::now();
        let mut r = record();
        r.state = CircuitState::Open;
        r.opened_at = Some(opened);

        let (next, verdict) = check(r.clone(), opened + Duration::milliseconds(59_999));
        assert!(next.is_none());
        assert!(!verdict.allowed);
        assert_eq!(verdict.fallback.as_deref(), Some("gpt-4o-mini"));

        let (next, verdict) = check(r, opened + Duration::milliseconds(60_000));
        assert!(verdict.allowed);
        assert_eq!(verdict.state, CircuitState::HalfOpen);
        assert_eq!(next.unwrap().state, CircuitState::HalfOpen);
    }

    #[test]
    fn test_open_without_opened_at_never_recovers_via_elapsed() {
        // Defensive case: corrupt row with open state but no timestamp
        let mut r = record();
        r.state = CircuitState::Open;
        r.opened_at = None;

        let (next, verdict) = check(r, Utc::now());
        assert!(next.is_none());
        assert!(!verdict.allowed);
    }

    #[test]
    fn test_half_open_success_closes_and_resets() {
        let now = Utc::now();
        let mut r = record();
        r.state = CircuitState::HalfOpen;
        r.failure_count = 5;
        r.opened_at = Some(now - Duration::minutes(2));
        r.half_open_at = Some(now);

        let r = on_success(r, now);
        assert_eq!(r.state, CircuitState::Closed);
        assert_eq!(r.failure_count, 0);
        assert!(r.opened_at.is_none());
        assert!(r.half_open_at.is_none());
        assert_eq!(r.success_count, 1);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let now = Utc::now();
        let mut r = record();
        r.state = CircuitState::HalfOpen;
        r.failure_count = 5;
        r.half_open_at = Some(now - Duration::seconds(1));

        let r = on_failure(r, now);
        assert_eq!(r.state, CircuitState::Open);
        assert_eq!(r.opened_at, Some(now));
        assert!(r.half_open_at.is_none());
    }

    #[test]
    fn test_success_in_closed_only_bookkeeps() {
        let now = Utc::now();
        let mut r = record();
        r.failure_count = 2;

        let r = on_success(r, now);
        assert_eq!(r.state, CircuitState::Closed);
        // Closed-state success does not reset the failure counter
        assert_eq!(r.failure_count, 2);
        assert_eq!(r.success_count, 1);
    }
}
