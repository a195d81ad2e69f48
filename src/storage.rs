//! Storage module for saving and loading flashcard decks.
//!
//! Each deck is one pretty-printed JSON file named after its id. Grading goes
//! through [`DeckStorage::record_review`], which checks the card's version
//! before writing so a stale read cannot overwrite a newer review.
//!
//! Every write holds an advisory `<id>.lock` file next to the deck for the
//! whole read-check-write, so separate processes sharing a decks directory
//! serialize on it. Deck files are replaced by renaming a uniquely named temp
//! file into place.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::models::{Deck, Quality, SchedulingState};
use crate::sm2::Scheduler;

/// How long a writer waits for another writer's lock before giving up.
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_RETRY: Duration = Duration::from_millis(5);
/// A lock file older than this is left over from a crashed writer.
const STALE_LOCK_AGE: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to create decks directory {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Deck not found: {0}")]
    DeckNotFound(String),

    #[error("Card {card_id} not found in deck {deck_id}")]
    CardNotFound { deck_id: String, card_id: String },

    #[error("Card {card_id} changed since it was read (expected version {expected}, found {found})")]
    VersionConflict {
        card_id: String,
        expected: u64,
        found: u64,
    },

    #[error("Deck {0} is locked by another writer")]
    Locked(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Result of a persisted review.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewOutcome {
    pub card_id: String,
    /// Card version after the write. Pass it back to grade the card again.
    pub version: u64,
    pub state: SchedulingState,
}

/// Exclusive hold on one deck, released when dropped.
struct DeckLock {
    path: PathBuf,
}

impl DeckLock {
    fn acquire(path: PathBuf, deck_id: &str) -> Result<Self> {
        let started = Instant::now();

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if Self::is_stale(&path) {
                        warn!(deck = deck_id, path = ?path, "breaking stale deck lock");
                        // Another waiter may have removed it first.
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if started.elapsed() >= LOCK_TIMEOUT {
                        return Err(StorageError::Locked(deck_id.to_string()));
                    }
                    thread::sleep(LOCK_RETRY);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn is_stale(path: &Path) -> bool {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .map_or(false, |age| age > STALE_LOCK_AGE)
    }
}

impl Drop for DeckLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = ?self.path, error = %e, "failed to release deck lock");
        }
    }
}

/// Handles deck persistence.
pub struct DeckStorage {
    decks_dir: PathBuf,
}

impl DeckStorage {
    pub fn new(decks_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&decks_dir).map_err(|source| StorageError::CreateDir {
            path: decks_dir.clone(),
            source,
        })?;

        Ok(Self { decks_dir })
    }

    /// Get default storage location.
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("study-review")
            .join("decks")
    }

    pub fn decks_dir(&self) -> &Path {
        &self.decks_dir
    }

    fn deck_path(&self, deck_id: &str) -> PathBuf {
        self.decks_dir.join(format!("{}.json", deck_id))
    }

    fn lock_path(&self, deck_id: &str) -> PathBuf {
        self.decks_dir.join(format!("{}.lock", deck_id))
    }

    fn lock_deck(&self, deck_id: &str) -> Result<DeckLock> {
        DeckLock::acquire(self.lock_path(deck_id), deck_id)
    }

    /// Save a deck to disk, replacing any previous file atomically.
    ///
    /// Waits for concurrent writers of the same deck, including those in other
    /// processes.
    pub fn save_deck(&self, deck: &Deck) -> Result<PathBuf> {
        let _lock = self.lock_deck(&deck.id)?;
        self.write_deck(deck)
    }

    // Callers must hold the deck's lock.
    fn write_deck(&self, deck: &Deck) -> Result<PathBuf> {
        let path = self.deck_path(&deck.id);
        let json = serde_json::to_string_pretty(deck)?;

        let mut tmp = NamedTempFile::new_in(&self.decks_dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.persist(&path).map_err(|e| e.error)?;

        debug!(deck = %deck.id, path = ?path, "saved deck");
        Ok(path)
    }

    /// Load a deck from disk.
    pub fn load_deck(&self, deck_id: &str) -> Result<Option<Deck>> {
        let path = self.deck_path(deck_id);
        if !path.exists() {
            return Ok(None);
        }

        let json = fs::read_to_string(&path)?;
        let deck: Deck = serde_json::from_str(&json)?;
        Ok(Some(deck))
    }

    /// Load a deck, treating absence as an error.
    pub fn require_deck(&self, deck_id: &str) -> Result<Deck> {
        self.load_deck(deck_id)?
            .ok_or_else(|| StorageError::DeckNotFound(deck_id.to_string()))
    }

    pub fn create_deck(&self, name: &str, now: DateTime<Utc>) -> Result<Deck> {
        let deck = Deck::new(name.to_string(), now);
        self.save_deck(&deck)?;
        info!(deck = %deck.id, name, "created deck");
        Ok(deck)
    }

    /// Delete a deck file.
    pub fn delete_deck(&self, deck_id: &str) -> Result<bool> {
        let _lock = self.lock_deck(deck_id)?;
        let path = self.deck_path(deck_id);
        if path.exists() {
            fs::remove_file(&path)?;
            info!(deck = deck_id, "deleted deck");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// List all available decks.
    pub fn list_decks(&self) -> Result<Vec<DeckInfo>> {
        let mut decks = Vec::new();

        for entry in fs::read_dir(&self.decks_dir)? {
            let path = entry?.path();

            if path.extension().map_or(false, |e| e == "json") {
                let parsed = fs::read_to_string(&path)
                    .map_err(StorageError::from)
                    .and_then(|json| serde_json::from_str::<Deck>(&json).map_err(Into::into));

                match parsed {
                    Ok(deck) => decks.push(DeckInfo {
                        id: deck.id,
                        name: deck.name,
                        card_count: deck.cards.len(),
                        description: deck.description,
                    }),
                    Err(e) => warn!(path = ?path, error = %e, "skipping unreadable deck file"),
                }
            }
        }

        decks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(decks)
    }

    /// Add a card to a stored deck and return the new card's id.
    pub fn add_card(
        &self,
        deck_id: &str,
        front: String,
        back: String,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let _lock = self.lock_deck(deck_id)?;
        let mut deck = self.require_deck(deck_id)?;
        let card_id = deck.add_card(front, back, now).id.clone();
        self.write_deck(&deck)?;
        Ok(card_id)
    }

    /// Grade a card and persist its new schedule.
    ///
    /// With `expected_version` set, the write only happens if the stored card
    /// still has that version; otherwise [`StorageError::VersionConflict`].
    pub fn record_review(
        &self,
        deck_id: &str,
        card_id: &str,
        expected_version: Option<u64>,
        quality: Quality,
        scheduler: &Scheduler,
        clock: &dyn Clock,
    ) -> Result<ReviewOutcome> {
        let _lock = self.lock_deck(deck_id)?;
        let mut deck = self.require_deck(deck_id)?;
        let now = clock.now();

        let card = deck
            .find_card_mut(card_id)
            .ok_or_else(|| StorageError::CardNotFound {
                deck_id: deck_id.to_string(),
                card_id: card_id.to_string(),
            })?;

        if let Some(expected) = expected_version {
            if card.version != expected {
                warn!(card = card_id, expected, found = card.version, "stale review rejected");
                return Err(StorageError::VersionConflict {
                    card_id: card_id.to_string(),
                    expected,
                    found: card.version,
                });
            }
        }

        let state = scheduler.review_card(card, quality, now);
        card.version += 1;
        let version = card.version;

        deck.last_studied = Some(now);
        self.write_deck(&deck)?;

        info!(
            deck = deck_id,
            card = card_id,
            quality = quality.value(),
            interval = state.interval_days,
            lapsed = state.lapsed,
            version,
            "recorded review"
        );

        Ok(ReviewOutcome {
            card_id: card_id.to_string(),
            version,
            state,
        })
    }

    /// Reset a card to new and persist it.
    pub fn reset_card(&self, deck_id: &str, card_id: &str) -> Result<u64> {
        let _lock = self.lock_deck(deck_id)?;
        let mut deck = self.require_deck(deck_id)?;
        let card = deck
            .find_card_mut(card_id)
            .ok_or_else(|| StorageError::CardNotFound {
                deck_id: deck_id.to_string(),
                card_id: card_id.to_string(),
            })?;

        card.reset_progress();
        let version = card.version;
        self.write_deck(&deck)?;
        info!(deck = deck_id, card = card_id, "reset card progress");
        Ok(version)
    }

    /// Import cards from a CSV file.
    pub fn import_csv(&self, csv_path: &Path, deck_name: &str, now: DateTime<Utc>) -> Result<Deck> {
        let mut deck = Deck::new(deck_name.to_string(), now);
        let content = fs::read_to_string(csv_path)?;

        for (i, line) in content.lines().enumerate() {
            // Skip header
            if i == 0 && line.to_lowercase().contains("front") {
                continue;
            }

            if let Some((front, back)) = line.split_once(',') {
                let front = front.trim();
                let back = back.trim();

                if !front.is_empty() && !back.is_empty() {
                    deck.add_card(front.to_string(), back.to_string(), now);
                }
            }
        }

        info!(deck = %deck.id, cards = deck.cards.len(), path = ?csv_path, "imported csv");
        Ok(deck)
    }
}

/// Summary info for a deck.
#[derive(Debug, Clone)]
pub struct DeckInfo {
    pub id: String,
    pub name: String,
    pub card_count: usize,
    pub description: String,
}

/// Backup format containing all decks.
#[derive(Debug, Serialize, Deserialize)]
pub struct Backup {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub decks: Vec<Deck>,
}

impl DeckStorage {
    /// Export all decks to a backup file.
    pub fn export_backup(&self, path: &Path, now: DateTime<Utc>) -> Result<usize> {
        let mut decks = Vec::new();

        for info in self.list_decks()? {
            if let Some(deck) = self.load_deck(&info.id)? {
                decks.push(deck);
            }
        }

        let backup = Backup {
            version: 1,
            created_at: now,
            decks,
        };

        let json = serde_json::to_string_pretty(&backup)?;
        fs::write(path, json)?;

        info!(decks = backup.decks.len(), path = ?path, "exported backup");
        Ok(backup.decks.len())
    }

    /// Import decks from a backup file, skipping ids that already exist.
    /// Returns (imported_count, skipped_count).
    pub fn import_backup(&self, path: &Path) -> Result<(usize, usize)> {
        let json = fs::read_to_string(path)?;
        let backup: Backup = serde_json::from_str(&json)?;

        let mut imported = 0;
        let mut skipped = 0;

        for deck in backup.decks {
            let _lock = self.lock_deck(&deck.id)?;
            if self.deck_path(&deck.id).exists() {
                skipped += 1;
            } else {
                self.write_deck(&deck)?;
                imported += 1;
            }
        }

        info!(imported, skipped, path = ?path, "restored backup");
        Ok((imported, skipped))
    }

    /// Get default backup path.
    pub fn default_backup_path(now: DateTime<Utc>) -> PathBuf {
        let timestamp = now.format("%Y%m%d_%H%M%S");
        dirs::document_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(format!("study_review_backup_{}.json", timestamp))
    }
}
