//! Opas — scheduled fetch-and-publish pipeline CLI.
//!
//! # Usage
//!
//! ```text
//! opas init <repo> --fetch <program> [--output-dir <dir>] [--at HH:MM] [--no-push]
//! opas run [--dry-run]
//! opas status [--json]
//! opas cache list [--json]
//! opas cache prune [--keep <n>]
//! opas daemon start|stop|status|trigger|logs
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    cache::CacheCommand, daemon::DaemonCommand, init::InitArgs, run::RunArgs, status::StatusArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "opas",
    version,
    about = "Fetch a broadcast schedule on a timer and publish it to git",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the pipeline config for a publishing repository.
    Init(InitArgs),

    /// Run the pipeline once: restore cache, fetch, detect, publish.
    Run(RunArgs),

    /// Show pipeline configuration, cache store, and daemon state.
    Status(StatusArgs),

    /// Inspect and prune archived cache generations.
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },

    /// Manage the background scheduler daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Init(args) => args.run(),
        Commands::Run(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::Cache { command } => commands::cache::run(command),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}
