//! Snapshot commands.

use std::collections::BTreeSet;

use anyhow::Result;
use clap::Args;
use volsnap_engine::{Plan, PlanState, SnapshotRequest, SnapshotTag};
use volsnap_id::NodeId;

use crate::error::CliError;
use crate::output::{print_event, print_plan, print_snapshots, print_success};

use super::CommandContext;

#[derive(Debug, Args)]
pub struct CreateSnapshotArgs {
    /// Snapshot name; omit for the deployment snapshot.
    #[arg(short = 'n', long = "name")]
    pub name: Option<String>,

    /// Nodes to leave out (repeatable or comma-separated).
    #[arg(short = 'e', long = "exclude-nodes", value_delimiter = ',')]
    pub exclude_nodes: Vec<String>,

    /// Only create the plan; run it later with `run-plan`.
    #[arg(long)]
    pub plan_only: bool,
}

#[derive(Debug, Args)]
pub struct RemoveSnapshotArgs {
    /// Snapshot name; omit for the deployment snapshot.
    #[arg(short = 'n', long = "name")]
    pub name: Option<String>,

    /// Nodes to leave out (repeatable or comma-separated).
    #[arg(short = 'e', long = "exclude-nodes", value_delimiter = ',')]
    pub exclude_nodes: Vec<String>,

    /// Skip reachability checks and continue past offline nodes.
    #[arg(short = 'f', long)]
    pub force: bool,

    /// Only create the plan; run it later with `run-plan`.
    #[arg(long)]
    pub plan_only: bool,
}

#[derive(Debug, Args)]
pub struct RestoreSnapshotArgs {
    /// Skip presence checks and continue past offline nodes.
    #[arg(short = 'f', long)]
    pub force: bool,

    /// Only create the plan; run it later with `run-plan`.
    #[arg(long)]
    pub plan_only: bool,
}

impl CreateSnapshotArgs {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let request = SnapshotRequest::create(parse_tag(self.name)?)
            .exclude(parse_nodes(&self.exclude_nodes)?);
        submit(ctx, request, self.plan_only).await
    }
}

impl RemoveSnapshotArgs {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let request = SnapshotRequest::remove(parse_tag(self.name)?)
            .exclude(parse_nodes(&self.exclude_nodes)?)
            .force(self.force);
        submit(ctx, request, self.plan_only).await
    }
}

impl RestoreSnapshotArgs {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        submit(ctx, SnapshotRequest::restore().force(self.force), self.plan_only).await
    }
}

/// List snapshot sets.
pub fn show_snapshots(ctx: CommandContext) -> Result<()> {
    let records = ctx.service.list_snapshots()?;
    print_snapshots(&records, ctx.format);
    Ok(())
}

async fn submit(ctx: CommandContext, request: SnapshotRequest, plan_only: bool) -> Result<()> {
    let request = match std::env::var("USER") {
        Ok(user) if !user.is_empty() => request.requested_by(user),
        _ => request,
    };

    if plan_only {
        let plan = ctx.service.submit(request).await?;
        print_plan(&plan, ctx.format);
        print_success("Plan created. Run it with `snapctl run-plan`.");
        return Ok(());
    }

    ctx.service.submit(request).await?;
    run_installed(&ctx).await
}

/// Runs the installed plan, printing progress as it goes.
pub(super) async fn run_installed(ctx: &CommandContext) -> Result<()> {
    let mut events = ctx.service.subscribe();
    let run = ctx.service.run_plan();
    tokio::pin!(run);

    let plan = loop {
        tokio::select! {
            result = &mut run => break result?,
            Ok(event) = events.recv() => print_event(&event, ctx.format),
        }
    };
    while let Ok(event) = events.try_recv() {
        print_event(&event, ctx.format);
    }

    finish(&plan)
}

fn finish(plan: &Plan) -> Result<()> {
    if plan.state == PlanState::Complete {
        print_success(&format!("{} plan {} completed", plan.operation(), plan.id));
        return Ok(());
    }

    let detail = match plan.first_failure() {
        Some(task) => format!(
            "{}: {}",
            task.description,
            task.failure
                .as_ref()
                .map(|f| f.message.as_str())
                .unwrap_or("failed")
        ),
        None => format!("{} task(s) not run", plan.counts().pending),
    };
    Err(CliError::PlanUnsuccessful {
        state: plan.state,
        detail,
    }
    .into())
}

fn parse_tag(name: Option<String>) -> Result<Option<SnapshotTag>> {
    Ok(name.as_deref().map(SnapshotTag::parse).transpose()?)
}

fn parse_nodes(names: &[String]) -> Result<BTreeSet<NodeId>> {
    names
        .iter()
        .map(|name| {
            NodeId::parse(name.trim()).map_err(|e| {
                anyhow::Error::from(CliError::InvalidNode {
                    name: name.clone(),
                    reason: e.to_string(),
                })
            })
        })
        .collect()
}
