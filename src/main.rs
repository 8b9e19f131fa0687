//! # Slotwise: scheduling maintenance CLI
//!
//! Usage:
//!   slotwise migrate                               # Create/upgrade the database
//!   slotwise reminders                             # Run the reminder sweep forever
//!   slotwise reminders --once                      # One sweep, then exit
//!   slotwise conflicts --program p --facility f --start T --end T [--instructor i]...
//!   slotwise sessions --program p --facility f [--limit N --offset N]
//!   slotwise deliveries [--limit N]                # Recent notification deliveries

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset};
use clap::{Parser, Subcommand};
use slotwise_core::SlotwiseConfig;
use slotwise_core::traits::Directory;
use slotwise_core::types::RequestContext;
use slotwise_scheduler::{
    Dispatcher, InMemoryDirectory, PageRequest, ReminderSweep, SchedulingDb, SessionFilter,
    SessionManager, sinks_from_config, spawn_reminder_loop,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "slotwise",
    version,
    about = "📅 Slotwise: facility session scheduling"
)]
struct Cli {
    /// Config file (default: ~/.slotwise/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create or upgrade the scheduling database
    Migrate,
    /// Send reminders for sessions starting soon
    Reminders {
        /// Run a single sweep and exit
        #[arg(long)]
        once: bool,
    },
    /// Check a proposed slot for facility and instructor conflicts
    Conflicts {
        #[arg(long)]
        program: String,
        #[arg(long)]
        facility: String,
        /// RFC 3339 start, e.g. 2026-03-02T10:00:00+01:00
        #[arg(long, value_parser = parse_timestamp)]
        start: DateTime<FixedOffset>,
        #[arg(long, value_parser = parse_timestamp)]
        end: DateTime<FixedOffset>,
        #[arg(long = "instructor")]
        instructors: Vec<String>,
    },
    /// List sessions at a facility
    Sessions {
        #[arg(long)]
        program: String,
        #[arg(long)]
        facility: String,
        #[arg(long, default_value = "0")]
        limit: u32,
        #[arg(long, default_value = "0")]
        offset: u32,
        #[arg(long)]
        include_cancelled: bool,
    },
    /// Show recent notification deliveries
    Deliveries {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

fn parse_timestamp(s: &str) -> std::result::Result<DateTime<FixedOffset>, String> {
    DateTime::parse_from_rfc3339(s).map_err(|e| format!("expected RFC 3339 timestamp: {e}"))
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

struct App {
    config: SlotwiseConfig,
    db: Arc<SchedulingDb>,
    dispatcher: Arc<Dispatcher>,
    manager: SessionManager,
}

fn build(config: SlotwiseConfig) -> Result<App> {
    let db_path = expand_path(&config.database.path);
    let db = Arc::new(
        SchedulingDb::open(Path::new(&db_path), config.database.busy_timeout_ms)
            .with_context(|| format!("opening {db_path}"))?,
    );

    let directory_path = expand_path(&config.directory.path);
    let directory: Arc<dyn Directory> = Arc::new(InMemoryDirectory::load_from(Path::new(&directory_path))?);

    let mut dispatcher = Dispatcher::new(db.clone(), directory.clone());
    for (priority, sink) in sinks_from_config(&config.notifications)? {
        dispatcher.register_sink(sink, priority);
    }
    dispatcher.set_enabled(config.notifications.enabled);
    let dispatcher = Arc::new(dispatcher);

    let manager = SessionManager::new(&config, db.clone(), directory, dispatcher.clone());
    Ok(App {
        config,
        db,
        dispatcher,
        manager,
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "slotwise=debug,slotwise_scheduler=debug,slotwise_core=debug"
    } else {
        "slotwise=info,slotwise_scheduler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => SlotwiseConfig::load_from(Path::new(&expand_path(path)))?,
        None => SlotwiseConfig::load()?,
    };
    let app = build(config)?;

    match cli.command {
        Command::Migrate => {
            println!("✅ Database ready: {}", expand_path(&app.config.database.path));
        }
        Command::Reminders { once } => {
            let sweep = Arc::new(ReminderSweep::new(
                &app.config.notifications,
                app.db.clone(),
                app.dispatcher.clone(),
            ));
            if once {
                let reminded = sweep.run_once(chrono::Utc::now().fixed_offset()).await?;
                print_json(&reminded)?;
            } else {
                spawn_reminder_loop(sweep, app.config.notifications.reminder_scan_interval_secs).await;
            }
        }
        Command::Conflicts {
            program,
            facility,
            start,
            end,
            instructors,
        } => {
            let ctx = RequestContext::new("cli", program);
            let report = app
                .manager
                .check_conflicts(&ctx, &facility, start, end, &instructors, &[])?;
            if report.has_conflicts() {
                tracing::info!("🚧 {}", report.summary());
            }
            print_json(&report)?;
        }
        Command::Sessions {
            program,
            facility,
            limit,
            offset,
            include_cancelled,
        } => {
            let ctx = RequestContext::new("cli", program);
            let filter = SessionFilter {
                include_cancelled,
                ..Default::default()
            };
            let page = app
                .manager
                .get_facility_sessions(&ctx, &facility, &filter, PageRequest { offset, limit })?;
            print_json(&page)?;
        }
        Command::Deliveries { limit } => {
            let entries = app.db.read(|repo| repo.recent_deliveries(limit))?;
            print_json(&entries)?;
        }
    }

    Ok(())
}
