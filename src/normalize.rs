//! Recovery of stored scheduling state before it reaches the scheduler.
//!
//! Nothing here fails. Each out-of-domain field is reset on its own and the
//! reset is reported as an [`Anomaly`] so callers can log it.

use thiserror::Error;

use crate::models::{add_days, SchedulingState, StoredSchedule};
use crate::sm2::Policy;

/// A recovered input problem. Never surfaced as a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Anomaly {
    #[error("quality {given} outside 0..=5, clamped to {clamped}")]
    OutOfRangeQuality { given: i64, clamped: u8 },

    #[error("no prior schedule, starting from the initial state")]
    MissingPriorState,

    #[error("invalid prior schedule: {0}")]
    InvalidPriorState(InvalidField),
}

/// Which stored field was out of its domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidField {
    #[error("negative repetition count {0}")]
    NegativeRepetitions(i64),

    #[error("repetition count {0} too large")]
    RepetitionsOverflow(i64),

    #[error("negative interval {0}")]
    NegativeInterval(i64),

    #[error("interval {0} too large")]
    IntervalOverflow(i64),

    #[error("ease factor below the floor or not a number")]
    EaseOutOfRange,

    #[error("due date does not match last review plus interval")]
    DueDateMismatch,
}

/// A valid state plus everything that had to be fixed to get it.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub state: SchedulingState,
    pub anomalies: Vec<Anomaly>,
}

impl Normalized {
    pub fn is_clean(&self) -> bool {
        self.anomalies.is_empty()
    }
}

pub fn normalize(raw: Option<&StoredSchedule>, policy: &Policy) -> Normalized {
    let Some(raw) = raw else {
        return Normalized {
            state: SchedulingState::initial(policy.initial_ease),
            anomalies: vec![Anomaly::MissingPriorState],
        };
    };

    let mut anomalies = Vec::new();
    let mut invalid = |field| anomalies.push(Anomaly::InvalidPriorState(field));

    let repetition_count = match u32::try_from(raw.repetition_count) {
        Ok(n) => n,
        Err(_) if raw.repetition_count < 0 => {
            invalid(InvalidField::NegativeRepetitions(raw.repetition_count));
            0
        }
        Err(_) => {
            invalid(InvalidField::RepetitionsOverflow(raw.repetition_count));
            u32::MAX
        }
    };

    let interval_days = match u32::try_from(raw.interval_days) {
        Ok(n) => n,
        Err(_) if raw.interval_days < 0 => {
            invalid(InvalidField::NegativeInterval(raw.interval_days));
            0
        }
        Err(_) => {
            invalid(InvalidField::IntervalOverflow(raw.interval_days));
            u32::MAX
        }
    };

    let ease_factor = if raw.ease_factor.is_finite() && raw.ease_factor >= policy.min_ease {
        raw.ease_factor
    } else {
        invalid(InvalidField::EaseOutOfRange);
        policy.initial_ease
    };

    let due_at = raw.last_reviewed_at.map(|at| add_days(at, interval_days));
    if due_at != raw.due_at {
        invalid(InvalidField::DueDateMismatch);
    }

    Normalized {
        state: SchedulingState {
            repetition_count,
            ease_factor,
            interval_days,
            due_at,
            last_reviewed_at: raw.last_reviewed_at,
            lapsed: raw.lapsed,
        },
        anomalies,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn stored(repetition_count: i64, ease_factor: f64, interval_days: i64) -> StoredSchedule {
        StoredSchedule {
            repetition_count,
            ease_factor,
            interval_days,
            due_at: Some(t0() + Duration::days(interval_days)),
            last_reviewed_at: Some(t0()),
            lapsed: false,
        }
    }

    #[test]
    fn missing_state_becomes_initial() {
        let n = normalize(None, &Policy::default());
        assert_eq!(n.state, SchedulingState::default());
        assert_eq!(n.anomalies, vec![Anomaly::MissingPriorState]);
    }

    #[test]
    fn valid_state_passes_through() {
        let n = normalize(Some(&stored(2, 2.36, 6)), &Policy::default());
        assert!(n.is_clean());
        assert_eq!(n.state.repetition_count, 2);
        assert_eq!(n.state.interval_days, 6);
        assert_eq!(n.state.ease_factor, 2.36);
        assert_eq!(n.state.due_at, Some(t0() + Duration::days(6)));
    }

    #[test]
    fn negative_interval_only_resets_interval() {
        let n = normalize(Some(&stored(4, 2.1, -3)), &Policy::default());

        assert_eq!(n.state.interval_days, 0);
        assert_eq!(n.state.repetition_count, 4);
        assert_eq!(n.state.ease_factor, 2.1);
        assert!(n
            .anomalies
            .contains(&Anomaly::InvalidPriorState(InvalidField::NegativeInterval(-3))));
        // Stored due date was derived from the bad interval.
        assert_eq!(n.state.due_at, Some(t0()));
    }

    #[test]
    fn negative_repetitions_reset_to_zero() {
        let n = normalize(Some(&stored(-1, 2.5, 6)), &Policy::default());
        assert_eq!(n.state.repetition_count, 0);
        assert_eq!(
            n.anomalies,
            vec![Anomaly::InvalidPriorState(InvalidField::NegativeRepetitions(-1))]
        );
    }

    #[test]
    fn bad_ease_resets_to_initial() {
        for ease in [0.4, -2.0, f64::NAN, f64::INFINITY] {
            let n = normalize(Some(&stored(3, ease, 15)), &Policy::default());
            assert_eq!(n.state.ease_factor, 2.5);
            assert_eq!(
                n.anomalies,
                vec![Anomaly::InvalidPriorState(InvalidField::EaseOutOfRange)]
            );
        }
    }

    #[test]
    fn oversized_counters_saturate() {
        let raw = StoredSchedule {
            interval_days: 1 << 40,
            due_at: None,
            ..stored(i64::MAX, 2.5, 0)
        };

        let n = normalize(Some(&raw), &Policy::default());

        assert_eq!(n.state.repetition_count, u32::MAX);
        assert_eq!(n.state.interval_days, u32::MAX);
        assert!(n.anomalies.contains(&Anomaly::InvalidPriorState(
            InvalidField::IntervalOverflow(1 << 40)
        )));
    }

    #[test]
    fn inconsistent_due_date_is_recomputed() {
        let mut raw = stored(2, 2.5, 6);
        raw.due_at = Some(t0() + Duration::days(40));

        let n = normalize(Some(&raw), &Policy::default());

        assert_eq!(n.state.due_at, Some(t0() + Duration::days(6)));
        assert_eq!(
            n.anomalies,
            vec![Anomaly::InvalidPriorState(InvalidField::DueDateMismatch)]
        );
    }

    #[test]
    fn due_date_without_review_is_dropped() {
        let mut raw = stored(0, 2.5, 0);
        raw.last_reviewed_at = None;

        let n = normalize(Some(&raw), &Policy::default());

        assert_eq!(n.state.due_at, None);
        assert!(!n.is_clean());
    }
}
