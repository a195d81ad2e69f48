//! Spaced-repetition review scheduling for study flashcards.
//!
//! The core is [`sm2::Scheduler`], a pure SM-2 transform from a card's prior
//! [`SchedulingState`] and a recall grade to its next state. Around it sit
//! the recovery of stored state ([`normalize`]), an injectable [`Clock`],
//! and a JSON deck store with optimistic concurrency ([`storage`]).

pub mod clock;
pub mod config;
pub mod models;
pub mod normalize;
pub mod sm2;
pub mod storage;

pub use clock::{Clock, FixedClock, SystemClock};
pub use models::{Deck, Flashcard, Quality, SchedulingState, StoredSchedule};
pub use normalize::{normalize, Anomaly, InvalidField, Normalized};
pub use sm2::{schedule, Policy, Scheduler};
pub use storage::{DeckStorage, ReviewOutcome, StorageError};
