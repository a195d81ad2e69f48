//! study-review - spaced repetition review scheduling from the command line
//!
//! Grades flashcards with the SM-2 scheduler and keeps decks as JSON files.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use study_review::config::Config;
use study_review::sm2::format_interval;
use study_review::{Clock, DeckStorage, Quality, Scheduler, SystemClock};

// ══════════════════════════════════════════════════════════════════════════
// CLI Arguments
// ══════════════════════════════════════════════════════════════════════════

#[derive(Parser, Debug)]
#[command(name = "study-review")]
#[command(author, version, about = "Spaced repetition review scheduler for study flashcards", long_about = None)]
struct Args {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory containing deck files (overrides the config)
    #[arg(short, long, global = true)]
    decks_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List decks
    Decks,
    /// Create an empty deck
    CreateDeck { name: String },
    /// Delete a deck and all its cards
    DeleteDeck { deck: String },
    /// Add a card to a deck
    Add {
        deck: String,
        front: String,
        back: String,
    },
    /// Import `front,back` lines from a CSV file as a new deck
    Import {
        csv: PathBuf,
        #[arg(long, default_value = "Imported Deck")]
        name: String,
    },
    /// List cards due now
    Due { deck: String },
    /// Grade a card from 0 (blackout) to 5 (perfect)
    Grade {
        deck: String,
        card: String,
        #[arg(allow_negative_numbers = true)]
        quality: i64,
        /// Only grade if the card is still at this version
        #[arg(long)]
        expect_version: Option<u64>,
    },
    /// Show the interval each grade would give a card
    Preview { deck: String, card: String },
    /// Show deck statistics
    Stats { deck: String },
    /// Forget a card's review history
    Reset { deck: String, card: String },
    /// Write all decks to a backup file
    Export { path: Option<PathBuf> },
    /// Restore decks from a backup file
    Restore { path: PathBuf },
    /// Write a config file with default settings
    InitConfig,
}

// ══════════════════════════════════════════════════════════════════════════
// Main Entry Point
// ══════════════════════════════════════════════════════════════════════════

fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.unwrap_or_else(Config::default_path);
    let config = Config::load_from(&config_path)?;

    init_logging(&config.log_filter);

    let decks_dir = args.decks_dir.unwrap_or_else(|| config.decks_dir());
    let storage = DeckStorage::new(decks_dir)?;
    let scheduler = Scheduler::with_policy(config.policy);

    run(args.command, &config_path, &storage, &scheduler, &SystemClock)
}

fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        println!("Config already exists at {}", path.display());
        return Ok(());
    }

    Config::default().save_to(path)?;
    println!("✓ Wrote default config to {}", path.display());
    Ok(())
}

fn run(
    command: Command,
    config_path: &Path,
    storage: &DeckStorage,
    scheduler: &Scheduler,
    clock: &dyn Clock,
) -> Result<()> {
    match command {
        Command::Decks => {
            for deck in storage.list_decks()? {
                println!("{}  {} ({} cards)", deck.id, deck.name, deck.card_count);
            }
        }

        Command::CreateDeck { name } => {
            let deck = storage.create_deck(&name, clock.now())?;
            println!("✓ Created '{}' ({})", deck.name, deck.id);
        }

        Command::DeleteDeck { deck } => {
            if storage.delete_deck(&deck)? {
                println!("✓ Deleted {}", deck);
            } else {
                println!("No deck {}", deck);
            }
        }

        Command::Add { deck, front, back } => {
            let card_id = storage.add_card(&deck, front, back, clock.now())?;
            println!("✓ Added card {}", card_id);
        }

        Command::Import { csv, name } => {
            let deck = storage.import_csv(&csv, &name, clock.now())?;
            storage.save_deck(&deck)?;
            println!("✓ Imported {} cards into '{}' ({})", deck.cards.len(), deck.name, deck.id);
        }

        Command::Due { deck } => {
            let deck = storage.require_deck(&deck)?;
            let due = deck.get_due_cards(clock.now());

            println!("{} of {} cards due in '{}'", due.len(), deck.cards.len(), deck.name);
            for card in due {
                println!("{}  v{}  {}", card.id, card.version, card.front.replace('\n', " "));
            }
        }

        Command::Grade {
            deck,
            card,
            quality,
            expect_version,
        } => {
            let (quality, anomaly) = Quality::checked(quality);
            if let Some(anomaly) = anomaly {
                warn!(%anomaly, "grade adjusted");
            }

            let outcome =
                storage.record_review(&deck, &card, expect_version, quality, scheduler, clock)?;
            let state = &outcome.state;

            println!(
                "{} graded {} ({}): next review in {}{}",
                outcome.card_id,
                quality.value(),
                quality.name(),
                format_interval(state.interval_days),
                if state.lapsed { " [lapsed]" } else { "" },
            );
            if let Some(due) = state.due_at {
                println!(
                    "  due {}  ease {:.2}  version {}",
                    due.format("%Y-%m-%d %H:%M"),
                    state.ease_factor,
                    outcome.version
                );
            }
        }

        Command::Preview { deck, card } => {
            let deck = storage.require_deck(&deck)?;
            let card = deck
                .find_card(&card)
                .with_context(|| format!("Card {} not found in deck {}", card, deck.id))?;

            for (quality, days) in scheduler.preview_intervals(card, clock.now()) {
                println!("{} {:<9} {}", quality.value(), quality.name(), format_interval(days));
            }
        }

        Command::Stats { deck } => {
            let deck = storage.require_deck(&deck)?;
            let stats = deck.get_stats(clock.now());

            println!("{}", deck.name);
            println!("  total     {}", stats.total_cards);
            println!("  new       {}", stats.new_cards);
            println!("  due       {}", stats.due_cards);
            println!("  learning  {}", stats.learning_cards);
            println!("  mature    {}", stats.mature_cards);
        }

        Command::Reset { deck, card } => {
            let version = storage.reset_card(&deck, &card)?;
            println!("✓ Reset {} (version {})", card, version);
        }

        Command::Export { path } => {
            let now = clock.now();
            let path = path.unwrap_or_else(|| DeckStorage::default_backup_path(now));
            let count = storage.export_backup(&path, now)?;
            println!("✓ Exported {} decks to {}", count, path.display());
        }

        Command::Restore { path } => {
            let (imported, skipped) = storage.import_backup(&path)?;
            println!("✓ Restored {} decks ({} already present)", imported, skipped);
        }

        Command::InitConfig => init_config(config_path)?,
    }

    Ok(())
}
