//! CLI commands.

mod plan;
mod snapshot;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;
use volsnap_engine::{
    CommandRunner, EngineConfig, MockRunner, SnapshotService, SshRunner, StateStore,
};
use volsnap_model::Model;

use crate::config::{Config, STATE_DB_FILE};
use crate::output::OutputFormat;

/// snapctl - Snapshot and restore a deployment's volumes.
#[derive(Debug, Parser)]
#[command(name = "snapctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    /// Deployment model file.
    #[arg(long, global = true, env = "VOLSNAP_MODEL")]
    model: Option<PathBuf>,

    /// Directory holding the state store.
    #[arg(long, global = true, env = "VOLSNAP_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    /// Run against a simulated fleet instead of SSH.
    #[arg(long, global = true, env = "VOLSNAP_SIMULATE")]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create a deployment or named snapshot set.
    CreateSnapshot(snapshot::CreateSnapshotArgs),

    /// Remove a deployment or named snapshot set.
    RemoveSnapshot(snapshot::RemoveSnapshotArgs),

    /// Roll the deployment back to its deployment snapshot.
    RestoreSnapshot(snapshot::RestoreSnapshotArgs),

    /// List snapshot sets.
    ShowSnapshots,

    /// Run the current plan.
    RunPlan,

    /// Stop the running plan after its in-flight tasks.
    StopPlan,

    /// Delete the current plan.
    RemovePlan,

    /// Show the current plan.
    ShowPlan,

    /// Show CLI version.
    Version,
}

impl Cli {
    pub fn log_json(&self) -> bool {
        self.log_json
    }

    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        if let Commands::Version = self.command {
            println!("snapctl {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }

        let config = Config::load()?;
        let ctx = CommandContext::open(&config, self.model, self.state_dir, self.simulate, self.format)?;

        match self.command {
            Commands::CreateSnapshot(args) => args.run(ctx).await,
            Commands::RemoveSnapshot(args) => args.run(ctx).await,
            Commands::RestoreSnapshot(args) => args.run(ctx).await,
            Commands::ShowSnapshots => snapshot::show_snapshots(ctx),
            Commands::RunPlan => plan::run_plan(ctx).await,
            Commands::StopPlan => plan::stop_plan(ctx),
            Commands::RemovePlan => plan::remove_plan(ctx),
            Commands::ShowPlan => plan::show_plan(ctx),
            Commands::Version => Ok(()),
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub service: SnapshotService,
    pub format: OutputFormat,
}

impl CommandContext {
    fn open(
        config: &Config,
        model: Option<PathBuf>,
        state_dir: Option<PathBuf>,
        simulate: bool,
        format: OutputFormat,
    ) -> Result<Self> {
        let model_path = config.model_path(model);
        let model = Model::load(&model_path)?;

        let state_dir = config.state_dir(state_dir)?;
        std::fs::create_dir_all(&state_dir)
            .with_context(|| format!("Failed to create state directory {:?}", state_dir))?;
        let store = StateStore::open(state_dir.join(STATE_DB_FILE))
            .with_context(|| format!("Failed to open state store in {:?}", state_dir))?;

        let runner: Arc<dyn CommandRunner> = if simulate {
            Arc::new(MockRunner::new())
        } else {
            Arc::new(SshRunner::new(config.ssh.clone()))
        };

        debug!(model = ?model_path, state_dir = ?state_dir, simulate, "Opened context");
        Ok(Self {
            service: SnapshotService::new(model, runner, store, EngineConfig::from_env()?),
            format,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_create_with_exclusions() {
        let cli = Cli::try_parse_from([
            "snapctl",
            "create-snapshot",
            "-n",
            "nightly",
            "-e",
            "node1,node2",
            "-e",
            "node3",
            "--format",
            "json",
        ])
        .unwrap();

        assert_eq!(cli.format, OutputFormat::Json);
        match cli.command {
            Commands::CreateSnapshot(args) => {
                assert_eq!(args.name.as_deref(), Some("nightly"));
                assert_eq!(args.exclude_nodes, vec!["node1", "node2", "node3"]);
                assert!(!args.plan_only);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_restore_takes_no_name() {
        assert!(Cli::try_parse_from(["snapctl", "restore-snapshot", "-n", "x"]).is_err());
        assert!(Cli::try_parse_from(["snapctl", "restore-snapshot", "-f"]).is_ok());
    }
}
