use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use qtrade_models::memory::{MemoryEffect, MemoryQuery, MemoryRecord, MemoryType, Priority};
use qtrade_models::trade_decision::DecisionOutcome;
use qtrade_models::trade_input::RunRequest;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "qtrade", about = "Tiered multi-agent trading decisions with a memory vault")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/qtrade.toml", global = true)]
    config: String,

    /// Pretty-print the output JSON
    #[arg(long, global = true)]
    pretty: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every tier for a symbol and print the decision
    Run {
        symbol: String,

        /// Market context JSON file, `-` for stdin
        #[arg(short, long)]
        market: Option<String>,

        /// Print the full run report instead of just the decision
        #[arg(long)]
        report: bool,
    },

    /// Show the most recent decisions
    Decisions {
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show agent counts and vault health
    State,

    /// Manage vault memories
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },

    /// Run one consolidation pass
    Consolidate,

    /// Record the realized outcome of a decision
    Outcome {
        /// Decision id
        decision: Uuid,

        /// Realized profit or loss
        #[arg(long, allow_hyphen_values = true)]
        pnl: Decimal,

        #[arg(long)]
        exit_reason: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum MemoryAction {
    /// Store a new memory
    Store {
        #[arg(long = "type")]
        memory_type: MemoryType,

        #[arg(long)]
        title: String,

        #[arg(long)]
        content: String,

        #[arg(long, default_value = "operator")]
        source: String,

        #[arg(long, default_value = "MEDIUM")]
        priority: Priority,

        /// Related symbol, repeatable
        #[arg(long = "symbol")]
        symbols: Vec<String>,

        /// Effect as JSON, e.g. {"kind":"set_parameter","name":"stop_pct","value":"1.5"}
        #[arg(long)]
        effect: Option<String>,

        /// Re-apply the effect automatically after restarts
        #[arg(long)]
        auto_apply: bool,
    },

    /// List memories
    List {
        #[arg(long = "type")]
        memory_type: Option<MemoryType>,

        #[arg(long)]
        symbol: Option<String>,

        #[arg(long)]
        pending: bool,

        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Apply a memory's effect to the runtime configuration
    Apply { id: Uuid },

    /// Re-apply every applied auto-apply memory
    Replay,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing (respects RUST_LOG env var)
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr);
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let config = qtrade::load_config(&cli.config)?;
    let orchestrator =
        qtrade::build_orchestrator(&config).context("Failed to build orchestrator")?;
    let vault = orchestrator.vault().clone();

    match cli.command {
        Commands::Run {
            symbol,
            market,
            report,
        } => {
            let market = read_market(market.as_deref())?;
            let run = orchestrator
                .run(RunRequest::new(symbol, market))
                .await
                .map_err(|e| anyhow::anyhow!("Run failed: {e}"))?;
            if report {
                print_json(&run, cli.pretty)?;
            } else {
                print_json(&run.decision, cli.pretty)?;
            }
        }
        Commands::Decisions { limit } => {
            print_json(&orchestrator.recent_decisions(limit)?, cli.pretty)?;
        }
        Commands::State => {
            print_json(&orchestrator.system_state()?, cli.pretty)?;
        }
        Commands::Memory { action } => match action {
            MemoryAction::Store {
                memory_type,
                title,
                content,
                source,
                priority,
                symbols,
                effect,
                auto_apply,
            } => {
                let mut record = MemoryRecord::new(memory_type, title, content, source)
                    .with_priority(priority)
                    .with_symbols(symbols);
                if let Some(effect) = effect {
                    let effect: MemoryEffect =
                        serde_json::from_str(&effect).context("Failed to parse --effect JSON")?;
                    record = record.with_effect(effect);
                }
                if auto_apply {
                    record = record.auto_apply();
                }
                let id = vault.store(record).await?;
                print_json(&serde_json::json!({ "id": id }), cli.pretty)?;
            }
            MemoryAction::List {
                memory_type,
                symbol,
                pending,
                limit,
            } => {
                let query = MemoryQuery {
                    memory_type,
                    symbol,
                    applied: pending.then_some(false),
                    limit: Some(limit),
                    ..MemoryQuery::default()
                };
                print_json(&vault.retrieve(&query)?, cli.pretty)?;
            }
            MemoryAction::Apply { id } => {
                print_json(&vault.apply(id).await?, cli.pretty)?;
            }
            MemoryAction::Replay => {
                print_json(&vault.replay_auto_apply().await?, cli.pretty)?;
            }
        },
        Commands::Consolidate => {
            print_json(&vault.consolidate(&config.consolidation).await?, cli.pretty)?;
        }
        Commands::Outcome {
            decision,
            pnl,
            exit_reason,
        } => {
            let recorded = vault
                .get_decision(decision)?
                .with_context(|| format!("Unknown decision: {decision}"))?;
            let id = orchestrator
                .record_outcome(DecisionOutcome {
                    decision_id: recorded.id,
                    symbol: recorded.symbol,
                    action: recorded.action,
                    pnl,
                    positive: pnl > Decimal::ZERO,
                    exit_reason,
                    observed_at: Utc::now(),
                })
                .await?;
            print_json(&serde_json::json!({ "memory_id": id }), cli.pretty)?;
        }
    }

    Ok(())
}

fn read_market(source: Option<&str>) -> Result<serde_json::Value> {
    let raw = match source {
        None => return Ok(serde_json::json!({})),
        Some("-") => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read from stdin")?;
            buf
        }
        Some(path) => std::fs::read_to_string(PathBuf::from(path))
            .with_context(|| format!("Failed to read market context: {path}"))?,
    };
    serde_json::from_str(&raw).context("Failed to parse market context JSON")
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    let output = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{output}");
    Ok(())
}
