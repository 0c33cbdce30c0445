//! ArgMatches → CliAction conversion.

use std::path::PathBuf;

use clap::ArgMatches;
use scribe_durability::ConflictPolicy;

/// The result of parsing the command line.
#[derive(Debug, Clone, PartialEq)]
pub enum CliAction {
    /// Decode one WAL file.
    Inspect {
        file: PathBuf,
        limit: Option<usize>,
    },
    /// Dry-run recovery over a directory.
    Recover {
        dir: PathBuf,
        policy: Option<ConflictPolicy>,
        list_utterances: bool,
    },
    /// Storage sample and evaluation.
    Status { dir: PathBuf },
}

/// Convert parsed matches into an action.
pub fn matches_to_action(matches: &ArgMatches) -> Result<CliAction, String> {
    match matches.subcommand() {
        Some(("inspect", sub)) => Ok(CliAction::Inspect {
            file: required_path(sub, "file")?,
            limit: sub.get_one::<usize>("limit").copied(),
        }),
        Some(("recover", sub)) => {
            let policy = sub
                .get_one::<String>("policy")
                .map(|p| p.parse::<ConflictPolicy>())
                .transpose()?;
            Ok(CliAction::Recover {
                dir: required_path(sub, "dir")?,
                policy,
                list_utterances: sub.get_flag("sessions"),
            })
        }
        Some(("status", sub)) => Ok(CliAction::Status {
            dir: required_path(sub, "dir")?,
        }),
        Some((other, _)) => Err(format!("unknown command '{}'", other)),
        None => Err("no command given".to_string()),
    }
}

fn required_path(matches: &ArgMatches, name: &str) -> Result<PathBuf, String> {
    matches
        .get_one::<String>(name)
        .map(PathBuf::from)
        .ok_or_else(|| format!("missing <{}>", name))
}
