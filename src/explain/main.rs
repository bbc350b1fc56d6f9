//! Policy Explain
//!
//! Reads an audit event log (a JSON array or one event per line) and prints
//! the causal tree of each evaluation in it.

use policy_engine::audit::{build_explain_tree, parse_event_log};
use policy_engine::config::LoggingConfig;
use policy_engine::telemetry::init_tracing;

use anyhow::{Context, Result};
use clap::Parser;
use std::io::Read;
use std::path::PathBuf;
use tracing::{debug, info};

/// Explain policy evaluations from their audit trail
#[derive(Parser, Debug)]
#[command(name = "policy-explain")]
#[command(about = "Rebuild and print the explain tree of audited policy evaluations")]
#[command(version)]
struct Args {
    /// Audit log file; reads stdin when omitted or "-"
    #[arg(env = "POLICY_EXPLAIN_INPUT")]
    input: Option<PathBuf>,

    /// Only show this evaluation id
    #[arg(short, long)]
    evaluation: Option<String>,

    /// Print the forest as JSON instead of indented text
    #[arg(long)]
    json: bool,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Enable JSON log format
    #[arg(long, env = "JSON_LOGS")]
    json_logs: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing(&LoggingConfig {
        level: args.log_level.clone(),
        json: args.json_logs,
    })?;

    let log = read_input(args.input.as_ref())?;
    let mut events = parse_event_log(&log).context("Failed to parse audit log")?;
    info!(events = events.len(), "Loaded audit log");

    if let Some(ref evaluation) = args.evaluation {
        events.retain(|e| &e.evaluation_id == evaluation);
        debug!(evaluation = %evaluation, events = events.len(), "Filtered audit log");
    }

    let forest = build_explain_tree(&events);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&forest)?);
    } else {
        for root in &forest {
            print!("{}", root.render());
        }
    }

    Ok(())
}

fn read_input(path: Option<&PathBuf>) -> Result<String> {
    match path {
        Some(path) if path.as_os_str() != "-" => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display())),
        _ => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read stdin")?;
            Ok(buf)
        }
    }
}
