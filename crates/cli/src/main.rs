//! scribe-wal - operator tool for scribe WAL directories.
//!
//! Read-only by construction: nothing here opens a writer or takes the
//! directory lock, so it is safe to point at a live directory.
//! - `inspect <file>`: header plus every decoded entry and skipped region
//! - `recover <dir>`: dry-run recovery with the full report
//! - `status <dir>`: one storage sample and its evaluation
//!
//! Logs go to stderr, filtered by `RUST_LOG` (default `warn`).

mod commands;
mod format;
mod parse;
mod wal_file;

use std::path::Path;
use std::process;

use scribe_core::Timestamp;
use scribe_durability::{list_files, StorageMonitor, WalRecoveryManager};
use scribe_engine::PersistenceConfig;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use commands::build_cli;
use format::{format_error, format_inspection, format_recovery, format_status, OutputMode};
use parse::{matches_to_action, CliAction};

fn main() {
    init_logging();

    let matches = build_cli().get_matches();
    let mode = if matches.get_flag("json") {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    let result = load_config(matches.get_one::<String>("config").map(Path::new))
        .and_then(|config| {
            let action = matches_to_action(&matches)?;
            run(action, &config, mode)
        });

    match result {
        Ok(output) => println!("{}", output),
        Err(e) => {
            eprintln!("{}", format_error(&e, mode));
            process::exit(1);
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<PersistenceConfig, String> {
    match path {
        Some(path) => PersistenceConfig::from_file(path).map_err(|e| e.to_string()),
        None => Ok(PersistenceConfig::default()),
    }
}

fn run(action: CliAction, config: &PersistenceConfig, mode: OutputMode) -> Result<String, String> {
    debug!(?action, "Running command");
    match action {
        CliAction::Inspect { file, limit } => {
            let inspection = wal_file::inspect_file(&file, limit)?;
            Ok(format_inspection(&inspection, mode))
        }
        CliAction::Recover {
            dir,
            policy,
            list_utterances,
        } => {
            if !dir.is_dir() {
                return Err(format!("{} is not a directory", dir.display()));
            }
            let mut recovery = config.recovery.clone().with_enabled(true);
            if let Some(policy) = policy {
                recovery = recovery.with_conflict_policy(policy);
            }
            let report = WalRecoveryManager::new(recovery)
                .recover(&dir, Timestamp::now())
                .map_err(|e| e.to_string())?;
            Ok(format_recovery(&report, mode, list_utterances))
        }
        CliAction::Status { dir } => {
            if !dir.is_dir() {
                return Err(format!("{} is not a directory", dir.display()));
            }
            let mut monitor = StorageMonitor::new(config.monitor.clone());
            monitor
                .sample(&dir, Timestamp::now())
                .map_err(|e| e.to_string())?;
            let files = list_files(&dir).map_err(|e| e.to_string())?;
            Ok(format_status(&monitor.evaluate(), &files, mode))
        }
    }
}
