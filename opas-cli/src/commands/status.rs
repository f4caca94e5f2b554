//! `opas status` — pipeline configuration, cache store, and daemon visibility.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use opas_core::{config, PipelineConfig};
use opas_daemon::{request_status, DaemonError};
use opas_store::CacheEntry;

/// Arguments for `opas status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        let config = config::load_at(&home)
            .context("failed to load config — run `opas init` first")?;

        let entries = load_store(&home, &config)?;
        let daemon = daemon_state(&home)?;

        if self.json {
            print_json(&config, &entries, daemon)?;
            return Ok(());
        }

        print_human(&config, &entries, daemon);
        Ok(())
    }
}

fn load_store(home: &Path, config: &PipelineConfig) -> Result<Vec<CacheEntry>> {
    let store_dir = config.store_dir_at(home);
    if !store_dir.exists() {
        return Ok(Vec::new());
    }
    opas_store::list_at(&store_dir).context("failed to read cache store manifest")
}

/// Daemon status payload, or `None` when the daemon is not running.
fn daemon_state(home: &Path) -> Result<Option<serde_json::Value>> {
    match request_status(home) {
        Ok(payload) => Ok(Some(payload)),
        Err(DaemonError::DaemonNotRunning { .. }) => Ok(None),
        Err(err) => Err(err).context("failed to query daemon status"),
    }
}

#[derive(Serialize)]
struct StatusJson<'a> {
    repo: String,
    output_dir: String,
    fetch_program: String,
    schedule_at: &'a str,
    push: bool,
    cache_generations: &'a [CacheEntry],
    daemon: serde_json::Value,
}

#[derive(Tabled)]
struct CacheTableRow {
    #[tabled(rename = "key")]
    key: String,
    #[tabled(rename = "saved at")]
    saved_at: String,
    #[tabled(rename = "size")]
    size: String,
}

fn print_json(
    config: &PipelineConfig,
    entries: &[CacheEntry],
    daemon: Option<serde_json::Value>,
) -> Result<()> {
    let payload = StatusJson {
        repo: config.repo.display().to_string(),
        output_dir: config.output_dir.display().to_string(),
        fetch_program: config.fetch.program.display().to_string(),
        schedule_at: &config.schedule.at,
        push: config.publish.push,
        cache_generations: entries,
        daemon: daemon.unwrap_or_else(|| serde_json::json!({ "running": false })),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&payload).context("failed to serialize status JSON")?
    );
    Ok(())
}

fn print_human(config: &PipelineConfig, entries: &[CacheEntry], daemon: Option<serde_json::Value>) {
    println!(
        "Opas v{} | repo {} | daily at {} UTC",
        env!("CARGO_PKG_VERSION"),
        config.repo.display(),
        config.schedule.at,
    );
    println!("  snapshot dir: {}", config.output_path().display());
    println!("  fetch: {}", config.fetch.program.display());
    println!(
        "  publish: {} -> {}/{}{}",
        config.publish.author_name,
        config.publish.remote,
        config.publish.branch,
        if config.publish.push {
            String::new()
        } else {
            " (push disabled)".to_string()
        },
    );

    match daemon {
        Some(payload) => {
            let next = payload
                .get("next_fire_at_unix")
                .and_then(|v| v.as_i64())
                .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
                .map(|dt| dt.to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string());
            println!("  daemon: {} (next run {})", "running".green().bold(), next);
        }
        None => println!("  daemon: {}", "not running".yellow().bold()),
    }

    if entries.is_empty() {
        println!("\nNo archived cache generations.");
        return;
    }

    println!("\nCache store ({} generations):", entries.len());
    let rows: Vec<CacheTableRow> = entries
        .iter()
        .map(|entry| CacheTableRow {
            key: entry.key.to_string(),
            saved_at: entry.saved_at.to_rfc3339(),
            size: format_bytes(entry.bytes),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}

fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * 1024;
    if bytes < KIB {
        format!("{bytes} B")
    } else if bytes < MIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    }
}
