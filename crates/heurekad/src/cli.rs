use std::ffi::OsStr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use heureka_config::LogFormat;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "Heureka scan reconciliation")]
pub struct Cli {
    #[arg(
        long,
        global = true,
        default_value = ".",
        help = "Workspace root holding .heureka/"
    )]
    pub workspace: PathBuf,

    #[arg(
        long,
        global = true,
        help = "Log at debug level regardless of [logging].level"
    )]
    pub verbose: bool,

    #[arg(
        long,
        global = true,
        value_parser = parse_log_format,
        help = "Log format override: human or json"
    )]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Commands {
    /// Write the default config and create the database.
    Init,
    /// Retire component instances that vanished from the latest run of each tag.
    Autopatch,
    /// Mitigate issue matches whose issue vanished from the latest run of each tag.
    Autoclose,
    /// Run autopatch, then autoclose.
    Reconcile,
    /// Scanner run lifecycle.
    #[command(subcommand)]
    Run(RunCommand),
    /// List tags of non-deleted scanner runs.
    Tags,
    /// List recorded patches.
    Patches(PatchesArgs),
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum RunCommand {
    Create(RunCreateArgs),
    Track(RunTrackArgs),
    Complete(RunUuidArgs),
    Fail(RunFailArgs),
    Delete(RunUuidArgs),
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct RunCreateArgs {
    #[arg(long, help = "External handle the scanner uses for this run")]
    pub uuid: String,

    #[arg(long, help = "Scanner tag grouping comparable runs")]
    pub tag: String,

    #[arg(long, help = "Start timestamp in unix milliseconds, defaults to now")]
    pub start: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct RunTrackArgs {
    #[arg(long)]
    pub uuid: String,

    #[arg(long = "instance", help = "Component instance id observed by the run")]
    pub instances: Vec<i64>,

    #[arg(long = "issue", help = "Issue id observed by the run")]
    pub issues: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct RunUuidArgs {
    #[arg(long)]
    pub uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct RunFailArgs {
    #[arg(long)]
    pub uuid: String,

    #[arg(long)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Args, Default)]
pub struct PatchesArgs {
    #[arg(long)]
    pub service_id: Option<i64>,

    #[arg(long)]
    pub component_version_id: Option<i64>,

    #[arg(long)]
    pub run_id: Option<i64>,
}

pub fn parse_cli() -> Cli {
    let mut args: Vec<_> = std::env::args_os().collect();
    if args.get(1).is_some_and(|arg| arg == OsStr::new("--")) {
        args.remove(1);
    }

    Cli::parse_from(args)
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    value.parse()
}
