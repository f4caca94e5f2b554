//! `opas cache list` and `opas cache prune`

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use opas_core::config;

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// List archived cache generations, newest first.
    List(ListArgs),

    /// Remove archived generations beyond the retention limit.
    Prune(PruneArgs),
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct PruneArgs {
    /// Generations to retain; defaults to the configured limit.
    #[arg(long)]
    pub keep: Option<usize>,
}

pub fn run(cmd: CacheCommand) -> Result<()> {
    match cmd {
        CacheCommand::List(args) => list(args),
        CacheCommand::Prune(args) => prune(args),
    }
}

fn list(args: ListArgs) -> Result<()> {
    let home = dirs::home_dir().context("could not determine home directory")?;
    let config = config::load_at(&home).context("failed to load config — run `opas init` first")?;

    let store_dir = config.store_dir_at(&home);
    let entries = if store_dir.exists() {
        opas_store::list_at(&store_dir).context("failed to read cache store manifest")?
    } else {
        Vec::new()
    };

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&entries).context("failed to serialize cache list")?
        );
        return Ok(());
    }

    if entries.is_empty() {
        println!("No archived cache generations.");
        return Ok(());
    }

    for entry in entries {
        println!(
            "{}  {}  {} bytes",
            entry.key,
            entry.saved_at.to_rfc3339(),
            entry.bytes
        );
    }
    Ok(())
}

fn prune(args: PruneArgs) -> Result<()> {
    let home = dirs::home_dir().context("could not determine home directory")?;
    let config = config::load_at(&home).context("failed to load config — run `opas init` first")?;

    let store_dir = config.store_dir_at(&home);
    if !store_dir.exists() {
        println!("No cache store to prune.");
        return Ok(());
    }

    let keep = args.keep.unwrap_or(config.cache.keep);
    let removed = opas_store::prune_at(&store_dir, keep).context("failed to prune cache store")?;

    if removed.is_empty() {
        println!("✓ Nothing to prune ({keep} generations retained).");
    } else {
        println!("✓ Pruned {} generation(s):", removed.len());
        for key in removed {
            println!("  - {key}");
        }
    }
    Ok(())
}
