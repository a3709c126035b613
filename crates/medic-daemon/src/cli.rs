//! Command-line surface of the `medic` binary

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;

/// Parsed invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Run,
    Once { json: bool },
    List { json: bool },
    Clear { pipeline: String, run_id: String },
}

/// Build the command tree
#[must_use]
pub fn command() -> Command {
    Command::new("medic")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Retries failed pipeline runs and escalates what automation cannot fix")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Path to the TOML configuration file"),
        )
        .subcommand(Command::new("run").about("Poll and reconcile until Ctrl-C (default)"))
        .subcommand(
            Command::new("once")
                .about("Run a single reconciliation tick and print its report")
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(
            Command::new("list")
                .about("Print the tracked runs")
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(
            Command::new("clear")
                .about("Forget a tracked run so automation may start over")
                .arg(
                    Arg::new("pipeline")
                        .long("pipeline")
                        .required(true)
                        .help("Pipeline name"),
                )
                .arg(
                    Arg::new("run")
                        .long("run")
                        .required(true)
                        .help("Original run id"),
                ),
        )
}

/// Config path, if given
#[must_use]
pub fn config_path(matches: &ArgMatches) -> Option<PathBuf> {
    matches.get_one::<PathBuf>("config").cloned()
}

/// Map matches onto an invocation; no subcommand means `run`
#[must_use]
pub fn invocation(matches: &ArgMatches) -> Invocation {
    match matches.subcommand() {
        Some(("once", args)) => Invocation::Once {
            json: args.get_flag("json"),
        },
        Some(("list", args)) => Invocation::List {
            json: args.get_flag("json"),
        },
        Some(("clear", args)) => Invocation::Clear {
            pipeline: args
                .get_one::<String>("pipeline")
                .cloned()
                .unwrap_or_default(),
            run_id: args.get_one::<String>("run").cloned().unwrap_or_default(),
        },
        _ => Invocation::Run,
    }
}
