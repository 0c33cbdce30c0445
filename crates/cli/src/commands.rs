//! Clap command tree definition.
//!
//! Builds the `clap::Command` tree for `scribe-wal`. Kept separate from
//! `main` so tests can drive it with `try_get_matches_from`.

use clap::{Arg, ArgAction, Command};

/// Build the complete CLI command tree.
pub fn build_cli() -> Command {
    Command::new("scribe-wal")
        .about("Inspect, dry-run recover and measure scribe WAL directories")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("json")
                .long("json")
                .help("JSON output mode")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("FILE")
                .help("scribe.toml to take recovery and monitor settings from")
                .global(true),
        )
        .subcommand(build_inspect())
        .subcommand(build_recover())
        .subcommand(build_status())
}

fn build_inspect() -> Command {
    Command::new("inspect")
        .about("Print a WAL file's header and every decoded entry")
        .arg(
            Arg::new("file")
                .required(true)
                .value_name("FILE")
                .help("WAL file (wal_<millis>.log, or an archived .gz copy)"),
        )
        .arg(
            Arg::new("limit")
                .long("limit")
                .short('n')
                .value_name("N")
                .value_parser(clap::value_parser!(usize))
                .help("Stop after N entries"),
        )
}

fn build_recover() -> Command {
    Command::new("recover")
        .about("Replay a WAL directory without writing to it and print the report")
        .arg(
            Arg::new("dir")
                .required(true)
                .value_name("DIR")
                .help("WAL directory"),
        )
        .arg(
            Arg::new("policy")
                .long("policy")
                .value_name("POLICY")
                .value_parser(["newest", "oldest", "merge"])
                .help("Conflict policy (default: from config, else merge)"),
        )
        .arg(
            Arg::new("sessions")
                .long("sessions")
                .help("List every recovered utterance, not just session totals")
                .action(ArgAction::SetTrue),
        )
}

fn build_status() -> Command {
    Command::new("status")
        .about("Sample a WAL directory once and evaluate its storage health")
        .arg(
            Arg::new("dir")
                .required(true)
                .value_name("DIR")
                .help("WAL directory"),
        )
}
