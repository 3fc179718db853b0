// parallel-sessions/crates/parallel-sessions/src/main.rs

#[cfg(feature = "cli")]
use anyhow::{Context, Result};
#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};
#[cfg(feature = "cli")]
use parallel_sessions::{
    config::ParallelSessionsConfig,
    memory_db::{KnowledgeQuery, SearchOptions, SearchScope, SharedMemoryBackend, WorkItemFilter, WorkStatus},
    telemetry::init_tracing,
};
#[cfg(feature = "cli")]
use serde::Serialize;
#[cfg(feature = "cli")]
use std::path::PathBuf;

/// Inspect and maintain a parallel sessions database.
#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "parallel-sessions", version)]
struct Cli {
    /// Database file. Defaults to PARALLEL_SESSIONS_DB_PATH.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Command {
    /// Row counts for memories, knowledge, sessions and work.
    Stats,
    /// Delete expired channel memories, then run store maintenance.
    Cleanup,
    /// Global knowledge, highest confidence first.
    Knowledge {
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        min_confidence: Option<f64>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Substring search across channel memories and global knowledge.
    Search {
        query: String,
        /// channel, global or both
        #[arg(long, default_value = "both")]
        scope: String,
        #[arg(long)]
        channel: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Hibernated sessions.
    Sessions,
    #[command(subcommand)]
    Work(WorkCommand),
    /// Print the effective configuration.
    Config,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum WorkCommand {
    List {
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        channel: Option<String>,
        /// Repeatable status filter.
        #[arg(long)]
        status: Vec<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Claim ready items, marking them executing.
    Claim {
        #[arg(long, default_value_t = 1)]
        limit: usize,
    },
    Cancel { id: i64 },
}

#[cfg(feature = "cli")]
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(feature = "cli")]
fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = ParallelSessionsConfig::from_env()?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    if let Command::Config = cli.command {
        config.print_config();
        return print_json(&config);
    }

    let backend = SharedMemoryBackend::new(config.backend_config());
    backend
        .initialize()
        .with_context(|| format!("failed to open {}", config.db_path.display()))?;

    match cli.command {
        Command::Stats => print_json(&backend.get_stats()?)?,
        Command::Cleanup => {
            let removed = backend.cleanup_expired()?;
            backend.run_maintenance()?;
            print_json(&serde_json::json!({ "expired_removed": removed }))?;
        }
        Command::Knowledge {
            category,
            min_confidence,
            limit,
        } => {
            let entries = backend.get_global_knowledge(&KnowledgeQuery {
                category,
                min_confidence,
                limit: Some(limit),
            })?;
            print_json(&entries)?;
        }
        Command::Search {
            query,
            scope,
            channel,
            limit,
        } => {
            let scope: SearchScope = scope.parse()?;
            let hits = backend.search_memories(
                &query,
                &SearchOptions {
                    scope,
                    channel_id: channel,
                    limit,
                },
            )?;
            print_json(&hits)?;
        }
        Command::Sessions => print_json(&backend.list_session_states()?)?,
        Command::Work(WorkCommand::List {
            session,
            channel,
            status,
            limit,
        }) => {
            let statuses = status
                .iter()
                .map(|s| s.parse::<WorkStatus>())
                .collect::<Result<Vec<_>, _>>()?;
            let items = backend.get_work_items(&WorkItemFilter {
                session_key: session,
                channel_id: channel,
                statuses,
                limit,
            })?;
            print_json(&items)?;
        }
        Command::Work(WorkCommand::Claim { limit }) => print_json(&backend.claim_work_items(limit)?)?,
        Command::Work(WorkCommand::Cancel { id }) => {
            let cancelled = backend.cancel_work_item(id)?;
            print_json(&serde_json::json!({ "id": id, "cancelled": cancelled }))?;
        }
        Command::Config => {}
    }

    backend.close()?;
    Ok(())
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
