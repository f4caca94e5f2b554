//! `opas run` — execute one pipeline pass in the foreground.

use anyhow::{Context, Result};
use clap::Args;

use opas_core::config;
use opas_pipeline::{pipeline, RunReport};

/// Arguments for `opas run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Fetch into staging and report pending changes without touching the
    /// repository or the cache store.
    #[arg(long)]
    pub dry_run: bool,

    /// Emit the run report as JSON instead of the summary.
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    pub fn run(self) -> Result<()> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        let config = config::load_at(&home)
            .context("failed to load config — run `opas init` first")?;

        let report =
            pipeline::run(&home, &config, self.dry_run).context("pipeline run failed")?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to serialize run report")?
            );
            return Ok(());
        }

        print_report(&report);
        Ok(())
    }
}

fn print_report(report: &RunReport) {
    let prefix = if report.dry_run { "[dry-run] " } else { "" };

    println!(
        "{prefix}✓ run {} finished in {} ms",
        report.run_id, report.duration_ms
    );

    match (&report.cache_restored, report.cache_fallback) {
        (Some(key), false) => println!("  cache: restored '{key}'"),
        (Some(key), true) => println!("  cache: restored fallback '{key}'"),
        (None, _) => println!("  cache: cold start"),
    }

    println!(
        "  snapshot: {} written, {} unchanged, {} removed",
        report.written, report.unchanged, report.removed
    );

    if report.baseline {
        println!("  first run — full snapshot treated as changed");
    }

    match &report.commit {
        Some(id) => println!("  published commit {id}"),
        None if report.dry_run && report.changed_paths > 0 => {
            println!("  {} path(s) would change", report.changed_paths)
        }
        None if report.changed_paths == 0 => println!("  no changes — nothing to publish"),
        None => {}
    }

    if let Some(key) = &report.cache_archived {
        println!("  cache: archived '{key}'");
    }
}
