//! SM-2 (SuperMemo 2) review scheduling.
//!
//! Every grade moves the ease factor (EF) and decides the next interval:
//! - EF' = EF + (0.1 - (5 - q) * (0.08 + (5 - q) * 0.02)), never below 1.3
//! - Grades 0-2 are lapses: the streak resets and the card returns after a day
//! - Grades 3-5 grow the interval: 1 day, then 6 days, then previous * EF'
//!
//! Scheduling is a pure function of the prior state, the grade and the
//! caller's "now". Nothing here reads the system clock or touches storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::{
    add_days, Flashcard, Quality, SchedulingState, StoredSchedule, DEFAULT_EASE_FACTOR,
    MIN_EASE_FACTOR, PASS_THRESHOLD,
};
use crate::normalize::{normalize, Anomaly};

/// Tunable constants of the algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub initial_ease: f64,
    pub min_ease: f64,
    pub first_interval: u32,
    pub second_interval: u32,
    pub lapse_interval: u32,
    pub pass_threshold: u8,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            initial_ease: DEFAULT_EASE_FACTOR,
            min_ease: MIN_EASE_FACTOR,
            first_interval: 1,
            second_interval: 6,
            lapse_interval: 1,
            pass_threshold: PASS_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyError {
    #[error("ease floor must be at least 1.0, got {0}")]
    InvalidFloor(f64),

    #[error("initial ease {initial} is below the ease floor {floor}")]
    InitialBelowFloor { initial: f64, floor: f64 },

    #[error("{0} interval must be at least one day")]
    ZeroInterval(&'static str),

    #[error("second interval {second} is shorter than first interval {first}")]
    ShrinkingIntervals { first: u32, second: u32 },

    #[error("pass threshold must be within 1..=5, got {0}")]
    ThresholdOutOfRange(u8),
}

impl Policy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        // Below 1.0 a passing streak would shrink intervals.
        if !self.min_ease.is_finite() || self.min_ease < 1.0 {
            return Err(PolicyError::InvalidFloor(self.min_ease));
        }
        if !self.initial_ease.is_finite() || self.initial_ease < self.min_ease {
            return Err(PolicyError::InitialBelowFloor {
                initial: self.initial_ease,
                floor: self.min_ease,
            });
        }

        for (name, days) in [
            ("first", self.first_interval),
            ("second", self.second_interval),
            ("lapse", self.lapse_interval),
        ] {
            if days == 0 {
                return Err(PolicyError::ZeroInterval(name));
            }
        }
        if self.second_interval < self.first_interval {
            return Err(PolicyError::ShrinkingIntervals {
                first: self.first_interval,
                second: self.second_interval,
            });
        }

        if !(1..=5).contains(&self.pass_threshold) {
            return Err(PolicyError::ThresholdOutOfRange(self.pass_threshold));
        }

        Ok(())
    }

    pub fn is_pass(&self, quality: Quality) -> bool {
        quality.value() >= self.pass_threshold
    }

    /// Ease factor after a review graded `quality`.
    pub fn next_ease(&self, ease: f64, quality: Quality) -> f64 {
        let miss = f64::from(5 - quality.value());
        // f64::max drops a NaN operand, so a NaN ease lands on the floor.
        (ease + (0.1 - miss * (0.08 + miss * 0.02))).max(self.min_ease)
    }
}

/// Computes next review states under a [`Policy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Scheduler {
    policy: Policy,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: Policy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Next state of a card graded `quality` at `now`.
    ///
    /// An absent prior state is the initial state, so the first passing
    /// grade always yields the first interval.
    pub fn schedule(
        &self,
        prior: Option<&SchedulingState>,
        quality: Quality,
        now: DateTime<Utc>,
    ) -> SchedulingState {
        let prior = prior
            .cloned()
            .unwrap_or_else(|| SchedulingState::initial(self.policy.initial_ease));

        let ease_factor = self.policy.next_ease(prior.ease_factor, quality);

        let (repetition_count, interval_days, lapsed) = if self.policy.is_pass(quality) {
            let interval = match prior.repetition_count {
                0 => self.policy.first_interval,
                1 => self.policy.second_interval,
                _ => grow(prior.interval_days, ease_factor)
                    .max(prior.interval_days)
                    .max(self.policy.first_interval),
            };
            (prior.repetition_count.saturating_add(1), interval, false)
        } else {
            (0, self.policy.lapse_interval, true)
        };

        debug!(
            quality = quality.value(),
            repetitions = repetition_count,
            ease = ease_factor,
            interval = interval_days,
            lapsed,
            "scheduled review"
        );

        SchedulingState {
            repetition_count,
            ease_factor,
            interval_days,
            due_at: Some(add_days(now, interval_days)),
            last_reviewed_at: Some(now),
            lapsed,
        }
    }

    /// Grade a card in place: recover its stored schedule, compute the next
    /// one and update the review counters.
    pub fn review_card(
        &self,
        card: &mut Flashcard,
        quality: Quality,
        now: DateTime<Utc>,
    ) -> SchedulingState {
        let prior = normalize(card.schedule.as_ref(), &self.policy);
        for anomaly in &prior.anomalies {
            match anomaly {
                Anomaly::MissingPriorState => debug!(card = %card.id, "first review"),
                _ => warn!(card = %card.id, %anomaly, "recovered stored schedule"),
            }
        }

        let next = self.schedule(Some(&prior.state), quality, now);

        card.schedule = Some(StoredSchedule::from(&next));
        card.total_reviews = card.total_reviews.saturating_add(1);
        if next.lapsed {
            card.lapses = card.lapses.saturating_add(1);
        }

        next
    }

    /// Interval each grade would produce if the card were graded at `now`.
    pub fn preview_intervals(&self, card: &Flashcard, now: DateTime<Utc>) -> [(Quality, u32); 6] {
        let prior = normalize(card.schedule.as_ref(), &self.policy).state;
        Quality::ALL.map(|q| (q, self.schedule(Some(&prior), q, now).interval_days))
    }
}

/// Schedule with the default policy. `quality` is clamped into `0..=5`.
pub fn schedule(
    prior: Option<&SchedulingState>,
    quality: i64,
    now: DateTime<Utc>,
) -> SchedulingState {
    Scheduler::new().schedule(prior, Quality::clamped(quality), now)
}

/// Whole days, rounded half up. The cast saturates at `u32::MAX`.
fn grow(interval: u32, ease: f64) -> u32 {
    (f64::from(interval) * ease).round() as u32
}

/// Short human form of an interval, e.g. `6d`, `1.5mo`, `2.0y`.
pub fn format_interval(days: u32) -> String {
    match days {
        0 => "now".to_string(),
        1..=29 => format!("{}d", days),
        30..=364 => format!("{:.1}mo", f64::from(days) / 30.0),
        _ => format!("{:.1}y", f64::from(days) / 365.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn state(repetition_count: u32, ease_factor: f64, interval_days: u32) -> SchedulingState {
        SchedulingState {
            repetition_count,
            ease_factor,
            interval_days,
            due_at: Some(add_days(t0(), interval_days)),
            last_reviewed_at: Some(t0()),
            lapsed: false,
        }
    }

    #[test]
    fn ease_deltas_per_grade() {
        let policy = Policy::default();
        let deltas: Vec<f64> = Quality::ALL
            .iter()
            .map(|q| policy.next_ease(2.5, *q) - 2.5)
            .collect();

        let expected = [-0.8, -0.54, -0.32, -0.14, 0.0, 0.1];
        for (got, want) in deltas.iter().zip(expected) {
            assert!((got - want).abs() < 1e-9, "got {got}, want {want}");
        }
    }

    #[test]
    fn nan_ease_lands_on_floor() {
        assert_eq!(Policy::default().next_ease(f64::NAN, Quality::Good), 1.3);
    }

    #[test]
    fn third_pass_multiplies_by_new_ease() {
        let next = Scheduler::new().schedule(Some(&state(2, 2.5, 6)), Quality::Perfect, t0());
        // 6 * 2.6 = 15.6
        assert_eq!(next.interval_days, 16);
        assert_eq!(next.repetition_count, 3);
    }

    #[test]
    fn rounding_is_half_up() {
        // 5 * 2.5 = 12.5
        let next = Scheduler::new().schedule(Some(&state(3, 2.5, 5)), Quality::Good, t0());
        assert_eq!(next.interval_days, 13);
    }

    #[test]
    fn huge_interval_saturates() {
        let next = Scheduler::new().schedule(Some(&state(9, 2.5, u32::MAX / 2)), Quality::Good, t0());
        assert_eq!(next.interval_days, u32::MAX);
        assert_eq!(next.due_at, Some(DateTime::<Utc>::MAX_UTC));
    }

    #[test]
    fn pass_never_schedules_below_first_interval() {
        let next = Scheduler::new().schedule(Some(&state(4, 2.5, 0)), Quality::Good, t0());
        assert_eq!(next.interval_days, 1);
    }

    #[test]
    fn custom_policy_changes_constants() {
        let scheduler = Scheduler::with_policy(Policy {
            first_interval: 2,
            second_interval: 5,
            lapse_interval: 3,
            pass_threshold: 4,
            ..Policy::default()
        });

        assert_eq!(scheduler.schedule(None, Quality::Good, t0()).interval_days, 2);

        let failed = scheduler.schedule(Some(&state(1, 2.5, 2)), Quality::Hard, t0());
        assert!(failed.lapsed);
        assert_eq!(failed.interval_days, 3);
    }

    #[test]
    fn hard_streak_never_shrinks_interval() {
        // Built directly, so it skips config validation.
        let scheduler = Scheduler::with_policy(Policy {
            initial_ease: 0.5,
            min_ease: 0.5,
            ..Policy::default()
        });

        let mut state = None;
        let mut intervals = Vec::new();
        for day in 0..6 {
            let next = scheduler.schedule(state.as_ref(), Quality::Hard, t0() + Duration::days(day));
            intervals.push(next.interval_days);
            state = Some(next);
        }

        assert_eq!(intervals, [1, 6, 6, 6, 6, 6]);
    }

    #[test]
    fn pass_follows_policy_threshold() {
        let default = Policy::default();
        assert!(!default.is_pass(Quality::Familiar));
        assert!(default.is_pass(Quality::Hard));

        let strict = Policy {
            pass_threshold: 4,
            ..Policy::default()
        };
        assert!(!strict.is_pass(Quality::Hard));
        assert!(strict.is_pass(Quality::Good));
    }

    #[test]
    fn policy_validation() {
        assert_eq!(Policy::default().validate(), Ok(()));

        let bad = Policy {
            min_ease: 0.0,
            ..Policy::default()
        };
        assert_eq!(bad.validate(), Err(PolicyError::InvalidFloor(0.0)));

        let bad = Policy {
            initial_ease: 0.5,
            min_ease: 0.5,
            ..Policy::default()
        };
        assert_eq!(bad.validate(), Err(PolicyError::InvalidFloor(0.5)));

        let floor_of_one = Policy {
            min_ease: 1.0,
            ..Policy::default()
        };
        assert_eq!(floor_of_one.validate(), Ok(()));

        let bad = Policy {
            initial_ease: 1.0,
            ..Policy::default()
        };
        assert!(matches!(
            bad.validate(),
            Err(PolicyError::InitialBelowFloor { .. })
        ));

        let bad = Policy {
            lapse_interval: 0,
            ..Policy::default()
        };
        assert_eq!(bad.validate(), Err(PolicyError::ZeroInterval("lapse")));

        let bad = Policy {
            pass_threshold: 6,
            ..Policy::default()
        };
        assert_eq!(bad.validate(), Err(PolicyError::ThresholdOutOfRange(6)));
    }

    #[test]
    fn review_card_updates_counters() {
        let scheduler = Scheduler::new();
        let mut card = Flashcard::new("Q".into(), "A".into(), t0());

        scheduler.review_card(&mut card, Quality::Good, t0());
        let lapsed = scheduler.review_card(&mut card, Quality::Blackout, t0() + Duration::days(1));

        assert!(lapsed.lapsed);
        assert_eq!(card.total_reviews, 2);
        assert_eq!(card.lapses, 1);
        assert_eq!(
            card.schedule.as_ref().map(|s| s.repetition_count),
            Some(0)
        );
    }

    #[test]
    fn review_card_recovers_corrupt_schedule() {
        let mut card = Flashcard::new("Q".into(), "A".into(), t0());
        card.schedule = Some(StoredSchedule {
            repetition_count: -4,
            ease_factor: 0.2,
            interval_days: -10,
            due_at: None,
            last_reviewed_at: Some(t0()),
            lapsed: false,
        });

        let next = Scheduler::new().review_card(&mut card, Quality::Good, t0() + Duration::days(1));

        assert_eq!(next.repetition_count, 1);
        assert_eq!(next.interval_days, 1);
        assert_eq!(next.ease_factor, 2.5);
    }

    #[test]
    fn preview_matches_review() {
        let scheduler = Scheduler::new();
        let mut card = Flashcard::new("Q".into(), "A".into(), t0());
        card.schedule = Some(StoredSchedule::from(&state(2, 2.5, 6)));

        let preview = scheduler.preview_intervals(&card, t0());

        assert_eq!(
            preview.map(|(_, days)| days),
            [1, 1, 1, 14, 15, 16]
        );

        let next = scheduler.review_card(&mut card, Quality::Good, t0());
        assert_eq!(next.interval_days, preview[4].1);
    }

    #[test]
    fn interval_labels() {
        assert_eq!(format_interval(0), "now");
        assert_eq!(format_interval(6), "6d");
        assert_eq!(format_interval(45), "1.5mo");
        assert_eq!(format_interval(730), "2.0y");
    }
}
