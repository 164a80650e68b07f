//! nudge CLI: inspect ledgers, import snapshots, preview policy decisions.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use nudge_engine::config::NudgeConfig;
use nudge_engine::engine::{NudgeEngine, Platform};
use nudge_engine::error::EngineError;
use nudge_engine::geofence::{desired_regions, region_signature};
use nudge_engine::ledger::LedgerStore;
use nudge_engine::model::{DomainSnapshot, NudgeType};
use nudge_engine::paths::NudgePaths;
use nudge_engine::platform::{InMemoryGeofenceMonitor, InMemoryNotificationCenter, InMemoryPermissions};
use nudge_engine::policy::FireDecision;
use nudge_engine::time::{Clock, ManualClock, SystemClock, parse_instant};

#[derive(Parser)]
#[command(name = "nudge", version, about = "Local notification and geofence scheduling engine")]
struct Cli {
    /// Directory holding the ledger database.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Config file (defaults to $XDG_CONFIG_HOME/nudge-engine/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show ledger, schedule and permission state.
    Status,

    /// Dry-run the policy for one nudge type.
    Decide {
        /// Nudge type (dailyShowUp, dailyFocus, goalNudge, activityReminder).
        #[arg(long = "type")]
        nudge_type: String,

        /// Evaluate at this instant instead of now (RFC 3339).
        #[arg(long)]
        at: Option<String>,

        /// Target instant for an activity reminder (RFC 3339).
        #[arg(long)]
        reminder_at: Option<String>,
    },

    /// Import or show the persisted domain snapshot.
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },

    /// Preview the geofence regions the snapshot yields.
    Regions,

    /// Delete ledgers (rate-limit history, schedules, offer debounce).
    Reset {
        /// Also delete the snapshot and the persisted permission state.
        #[arg(long)]
        all: bool,
    },

    /// Print the effective configuration.
    Config {
        /// Write it to the config file.
        #[arg(long)]
        write: bool,
    },
}

#[derive(Subcommand)]
enum SnapshotAction {
    /// Persist a snapshot from a JSON file.
    Import {
        #[arg(long)]
        file: PathBuf,
    },
    /// Print the persisted snapshot.
    Show,
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let paths = NudgePaths::resolve()?;
    let config_path = cli.config.clone().unwrap_or_else(|| paths.config_file());
    let mut config = NudgeConfig::load(&config_path)?;
    if let Some(dir) = cli.data_dir.clone() {
        config.data_dir = Some(dir);
    }
    let data_dir = config.data_dir.clone().unwrap_or_else(|| paths.ledger_dir());

    match cli.command {
        Commands::Status => {
            let engine = open_engine(&config, &data_dir)?;
            let status = engine.status()?;
            if cli.json {
                print_json(&status)?;
            } else {
                println!("{status}");
            }
        }

        Commands::Decide {
            nudge_type,
            at,
            reminder_at,
        } => {
            let Some(nudge_type) = NudgeType::from_label(&nudge_type) else {
                miette::bail!("unknown nudge type: {nudge_type}");
            };
            let clock: Arc<dyn Clock> = match at {
                Some(at) => Arc::new(ManualClock::new(parse_instant(&at)?)),
                None => Arc::new(SystemClock),
            };
            let reminder_at = reminder_at.as_deref().map(parse_instant).transpose()?;
            let engine = open_engine_with_clock(&config, &data_dir, clock)?;
            let decision = engine.decide(nudge_type, reminder_at)?;
            if cli.json {
                print_json(&decision)?;
            } else {
                match decision {
                    FireDecision::Fire(plan) => {
                        println!("{nudge_type}: fire at {}", plan.at);
                        if plan.deferred_days > 0 {
                            println!("  deferred {} day(s) by cap/spacing", plan.deferred_days);
                        }
                        if plan.ignored_streak > 0 {
                            println!("  ignored streak: {}", plan.ignored_streak);
                        }
                    }
                    FireDecision::Skip { reason } => println!("{nudge_type}: skip ({reason:?})"),
                }
            }
        }

        Commands::Snapshot { action } => {
            let store = LedgerStore::open(&data_dir)?;
            match action {
                SnapshotAction::Import { file } => {
                    let content = std::fs::read_to_string(&file).into_diagnostic()?;
                    let snapshot: DomainSnapshot = serde_json::from_str(&content).into_diagnostic()?;
                    store.save_snapshot(&snapshot)?;
                    println!(
                        "Imported snapshot with {} activities from {}",
                        snapshot.activities.len(),
                        file.display()
                    );
                }
                SnapshotAction::Show => match store.snapshot()? {
                    Some(snapshot) => print_json(&snapshot)?,
                    None => return Err(EngineError::NoSnapshot.into()),
                },
            }
        }

        Commands::Regions => {
            let store = LedgerStore::open(&data_dir)?;
            let snapshot = store.snapshot()?.unwrap_or_default();
            let regions = desired_regions(&snapshot, &config.location);
            let signature = region_signature(&regions);
            let applied = store.load()?.geofence;
            if cli.json {
                print_json(&regions)?;
            } else {
                println!("{} eligible region(s):", regions.len());
                for r in &regions {
                    let flags = match (r.notify_on_enter, r.notify_on_exit) {
                        (true, true) => "enter+exit",
                        (true, false) => "enter",
                        (false, true) => "exit",
                        (false, false) => "none",
                    };
                    println!(
                        "  {} @ {:.5},{:.5} r={:.0}m [{flags}]",
                        r.identifier, r.latitude, r.longitude, r.radius_m
                    );
                }
                let in_sync = applied.signature.as_deref() == Some(signature.as_str());
                println!("applied: {} region(s), in sync: {in_sync}", applied.region_count);
            }
        }

        Commands::Reset { all } => {
            let store = LedgerStore::open(&data_dir)?;
            let removed = store.reset(all)?;
            println!("Removed {removed} document(s) from {}", data_dir.display());
        }

        Commands::Config { write } => {
            config.validate()?;
            if write {
                paths.ensure_dirs()?;
                config.save(&config_path)?;
                println!("Wrote {}", config_path.display());
            } else {
                print!("{}", config.to_toml()?);
            }
        }
    }

    Ok(())
}

fn open_engine(config: &NudgeConfig, data_dir: &Path) -> Result<NudgeEngine> {
    open_engine_with_clock(config, data_dir, Arc::new(SystemClock))
}

/// The CLI has no OS notification center; in-memory doubles stand in so
/// read-only engine calls work against the real ledgers.
fn open_engine_with_clock(
    config: &NudgeConfig,
    data_dir: &Path,
    clock: Arc<dyn Clock>,
) -> Result<NudgeEngine> {
    let store = LedgerStore::open(data_dir)?;
    let platform = Platform::new(
        Arc::new(InMemoryNotificationCenter::new()),
        Arc::new(InMemoryGeofenceMonitor::new()),
        Arc::new(InMemoryPermissions::new()),
    );
    Ok(NudgeEngine::with_store(config.clone(), store, platform, clock)?)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).into_diagnostic()?);
    Ok(())
}
