//! Administrative commands over an overlay directory.

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use serde::Serialize;

use crate::{Error, Result};

pub mod fsck;
pub mod info;
pub mod scan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub enum Command {
    Info(info::InfoArgs),
    Scan(scan::ScanArgs),
    Fsck(fsck::FsckArgs),
    None,
}

#[derive(Debug, Clone)]
pub struct CliArgs {
    pub command: Command,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            command: Command::None,
        }
    }
}

pub fn dispatch(args: CliArgs) -> Result<()> {
    match args.command {
        Command::Info(a) => info::execute(a),
        Command::Scan(a) => scan::execute(a),
        Command::Fsck(a) => fsck::execute(a),
        Command::None => Ok(()),
    }
}

#[derive(Parser, Debug)]
#[command(name = "ovfs", version, about = "Overlay store maintenance for ovfs mounts")]
struct Cli {
    #[command(subcommand)]
    command: Option<Subcommands>,
}

#[derive(Subcommand, Debug)]
enum Subcommands {
    /// Show the shutdown state and persisted next node id without taking the lock.
    Info(info::InfoArgs),
    /// Recompute the next node id from the records on disk and close cleanly.
    Scan(scan::ScanArgs),
    /// Validate every record header in the overlay.
    Fsck(fsck::FsckArgs),
}

/// Parse CLI arguments into internal representation.
pub fn parse_args<I, S>(args: I) -> Result<CliArgs>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let argv: Vec<String> = args.into_iter().map(Into::into).collect();
    let cli = match Cli::try_parse_from(argv) {
        Ok(cli) => cli,
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => return Err(Error::Cli(e.to_string()).into()),
    };
    let command = match cli.command {
        Some(Subcommands::Info(args)) => Command::Info(args),
        Some(Subcommands::Scan(args)) => Command::Scan(args),
        Some(Subcommands::Fsck(args)) => Command::Fsck(args),
        None => Command::None,
    };

    Ok(CliArgs { command })
}

/// Build the underlying clap `Command` (useful for help/usage contract tests).
pub fn clap_command() -> clap::Command {
    Cli::command()
}

fn require_overlay(path: Option<PathBuf>) -> Result<PathBuf> {
    path.ok_or_else(|| Error::Cli("overlay is required".into()).into())
}

fn print_report<T: Serialize + std::fmt::Display>(report: &T, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => println!("{report}"),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}
