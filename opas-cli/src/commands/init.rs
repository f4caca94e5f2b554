//! `opas init <repo> --fetch <program> [...]`

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;

use opas_core::{config, PipelineConfig};

/// Create the pipeline config for a publishing repository.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Path to the git repository the schedule snapshot is published into.
    pub repo: PathBuf,

    /// Fetch program (absolute path, or resolved via $PATH).
    #[arg(long, short = 'f')]
    pub fetch: PathBuf,

    /// Snapshot directory inside the repository.
    #[arg(long, default_value = "schedule")]
    pub output_dir: PathBuf,

    /// Daily fire time, HH:MM 24-hour UTC.
    #[arg(long)]
    pub at: Option<String>,

    /// Remote to push to.
    #[arg(long)]
    pub remote: Option<String>,

    /// Branch to push to.
    #[arg(long)]
    pub branch: Option<String>,

    /// Commit without pushing (for repositories without a remote).
    #[arg(long)]
    pub no_push: bool,

    /// Overwrite an existing config.
    #[arg(long)]
    pub force: bool,
}

impl InitArgs {
    pub fn run(self) -> Result<()> {
        let home = dirs::home_dir().context("could not determine home directory")?;

        let repo = self
            .repo
            .canonicalize()
            .with_context(|| format!("cannot resolve repo path '{}'", self.repo.display()))?;
        if !repo.join(".git").exists() {
            bail!("'{}' is not a git repository", repo.display());
        }

        let config_path = config::config_path_at(&home);
        if config_path.exists() && !self.force {
            bail!(
                "config already exists at {} (use --force to overwrite)",
                config_path.display()
            );
        }

        let mut config = PipelineConfig::new(repo.clone(), self.output_dir, self.fetch);
        if let Some(at) = self.at {
            config.schedule.at = at;
        }
        if let Some(remote) = self.remote {
            config.publish.remote = remote;
        }
        if let Some(branch) = self.branch {
            config.publish.branch = branch;
        }
        if self.no_push {
            config.publish.push = false;
        }

        config::save_at(&home, &config).context("failed to save config")?;

        println!("✓ Configured pipeline for '{}'", repo.display());
        println!("  Snapshot dir: {}", config.output_path().display());
        println!("  Daily run at: {} UTC", config.schedule.at);
        println!("  Saved to: {}", config_path.display());
        Ok(())
    }
}
