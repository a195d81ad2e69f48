//! Data models for flashcards, decks and their scheduling state.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::normalize::Anomaly;

/// Ease factor of a card that has never been reviewed.
pub const DEFAULT_EASE_FACTOR: f64 = 2.5;
/// Lowest ease factor a card can reach.
pub const MIN_EASE_FACTOR: f64 = 1.3;
/// Lowest grade that counts as a successful recall.
pub const PASS_THRESHOLD: u8 = 3;
/// Cards at or above this interval count as mature in deck statistics.
pub const MATURE_INTERVAL_DAYS: u32 = 21;

/// Learner's self-reported recall grade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Quality {
    Blackout = 0, // No recall at all
    Wrong = 1,    // Wrong, answer felt new
    Familiar = 2, // Wrong, but the answer was familiar
    Hard = 3,     // Correct with serious difficulty
    Good = 4,     // Correct after some hesitation
    Perfect = 5,  // Perfect recall
}

impl Quality {
    pub const ALL: [Quality; 6] = [
        Self::Blackout,
        Self::Wrong,
        Self::Familiar,
        Self::Hard,
        Self::Good,
        Self::Perfect,
    ];

    /// Build a grade from any integer, clamping into `0..=5`.
    pub fn clamped(value: i64) -> Self {
        match value {
            i64::MIN..=0 => Self::Blackout,
            1 => Self::Wrong,
            2 => Self::Familiar,
            3 => Self::Hard,
            4 => Self::Good,
            _ => Self::Perfect,
        }
    }

    /// Like [`Quality::clamped`], but reports whether clamping happened.
    pub fn checked(value: i64) -> (Self, Option<Anomaly>) {
        let quality = Self::clamped(value);
        let anomaly = (i64::from(quality.value()) != value).then_some(Anomaly::OutOfRangeQuality {
            given: value,
            clamped: quality.value(),
        });
        (quality, anomaly)
    }

    pub fn value(self) -> u8 {
        self as u8
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Blackout => "Blackout",
            Self::Wrong => "Wrong",
            Self::Familiar => "Familiar",
            Self::Hard => "Hard",
            Self::Good => "Good",
            Self::Perfect => "Perfect",
        }
    }
}

/// Scheduling state of a card after at least one review, or the initial
/// state of a card that was never reviewed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulingState {
    pub repetition_count: u32,
    pub ease_factor: f64,
    pub interval_days: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reviewed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lapsed: bool,
}

impl Default for SchedulingState {
    fn default() -> Self {
        Self::initial(DEFAULT_EASE_FACTOR)
    }
}

impl SchedulingState {
    pub fn initial(ease_factor: f64) -> Self {
        Self {
            repetition_count: 0,
            ease_factor,
            interval_days: 0,
            due_at: None,
            last_reviewed_at: None,
            lapsed: false,
        }
    }

    /// A state without a due date is due immediately.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_at.map_or(true, |due| now >= due)
    }
}

/// Schedule as it is persisted or received from a client.
///
/// Counters are signed and nothing is range-checked, so a corrupted or
/// hand-edited record still loads. Run it through
/// [`normalize`](crate::normalize::normalize) before scheduling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSchedule {
    #[serde(default)]
    pub repetition_count: i64,
    #[serde(default = "default_ease_factor")]
    pub ease_factor: f64,
    #[serde(default)]
    pub interval_days: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reviewed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lapsed: bool,
}

fn default_ease_factor() -> f64 {
    DEFAULT_EASE_FACTOR
}

impl From<&SchedulingState> for StoredSchedule {
    fn from(state: &SchedulingState) -> Self {
        Self {
            repetition_count: i64::from(state.repetition_count),
            ease_factor: state.ease_factor,
            interval_days: i64::from(state.interval_days),
            due_at: state.due_at,
            last_reviewed_at: state.last_reviewed_at,
            lapsed: state.lapsed,
        }
    }
}

impl StoredSchedule {
    /// Due date recomputed from the last review, ignoring the stored one.
    pub fn derived_due_at(&self) -> Option<DateTime<Utc>> {
        self.last_reviewed_at.map(|at| add_days(at, self.interval()))
    }

    /// Interval in days with negative values read as zero.
    pub fn interval(&self) -> u32 {
        u32::try_from(self.interval_days.max(0)).unwrap_or(u32::MAX)
    }
}

/// `at + days`, saturating at the latest representable instant.
pub fn add_days(at: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    at.checked_add_signed(Duration::days(i64::from(days)))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A single flashcard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flashcard {
    pub id: String,
    pub front: String,
    pub back: String,

    // Scheduling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<StoredSchedule>,
    #[serde(default)]
    pub version: u64,

    // Tracking
    #[serde(default)]
    pub total_reviews: u32,
    #[serde(default)]
    pub lapses: u32,

    // Metadata
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub notes: String,
    pub created_at: DateTime<Utc>,
}

impl Flashcard {
    pub fn new(front: String, back: String, created_at: DateTime<Utc>) -> Self {
        Self {
            id: short_id(),
            front,
            back,
            schedule: None,
            version: 0,
            total_reviews: 0,
            lapses: 0,
            tags: Vec::new(),
            notes: String::new(),
            created_at,
        }
    }

    pub fn is_new(&self) -> bool {
        self.schedule
            .as_ref()
            .map_or(true, |s| s.last_reviewed_at.is_none())
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.schedule.as_ref().and_then(StoredSchedule::derived_due_at) {
            None => true,
            Some(due) => now >= due,
        }
    }

    pub fn interval(&self) -> u32 {
        self.schedule.as_ref().map_or(0, StoredSchedule::interval)
    }

    /// Forget all review history so the card is new again.
    ///
    /// The version still moves forward so a stale grade cannot land on the
    /// reset card.
    pub fn reset_progress(&mut self) {
        self.schedule = None;
        self.total_reviews = 0;
        self.lapses = 0;
        self.version += 1;
    }
}

/// Statistics for a deck.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DeckStats {
    pub total_cards: usize,
    pub new_cards: usize,
    pub due_cards: usize,
    pub learning_cards: usize,
    pub mature_cards: usize,
}

/// A collection of flashcards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deck {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub cards: Vec<Flashcard>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_studied: Option<DateTime<Utc>>,
}

impl Deck {
    pub fn new(name: String, created_at: DateTime<Utc>) -> Self {
        Self {
            id: short_id(),
            name,
            description: String::new(),
            cards: Vec::new(),
            created_at,
            last_studied: None,
        }
    }

    pub fn add_card(&mut self, front: String, back: String, now: DateTime<Utc>) -> &Flashcard {
        let card = Flashcard::new(front, back, now);
        self.cards.push(card);
        &self.cards[self.cards.len() - 1]
    }

    pub fn find_card(&self, card_id: &str) -> Option<&Flashcard> {
        self.cards.iter().find(|c| c.id == card_id)
    }

    pub fn find_card_mut(&mut self, card_id: &str) -> Option<&mut Flashcard> {
        self.cards.iter_mut().find(|c| c.id == card_id)
    }

    pub fn get_due_cards(&self, now: DateTime<Utc>) -> Vec<&Flashcard> {
        self.cards.iter().filter(|c| c.is_due(now)).collect()
    }

    pub fn get_new_cards(&self) -> Vec<&Flashcard> {
        self.cards.iter().filter(|c| c.is_new()).collect()
    }

    pub fn get_stats(&self, now: DateTime<Utc>) -> DeckStats {
        let mut stats = DeckStats {
            total_cards: self.cards.len(),
            ..Default::default()
        };

        for card in &self.cards {
            if card.is_new() {
                stats.new_cards += 1;
                continue;
            }

            if card.is_due(now) {
                stats.due_cards += 1;
            }

            if card.interval() >= MATURE_INTERVAL_DAYS {
                stats.mature_cards += 1;
            } else {
                stats.learning_cards += 1;
            }
        }

        stats
    }
}

fn short_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}
