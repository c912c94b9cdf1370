//! Plan commands.

use anyhow::Result;

use crate::output::{print_info, print_plan, print_success};

use super::snapshot::run_installed;
use super::CommandContext;

pub async fn run_plan(ctx: CommandContext) -> Result<()> {
    run_installed(&ctx).await
}

pub fn stop_plan(ctx: CommandContext) -> Result<()> {
    let plan = ctx.service.stop_plan()?;
    print_success(&format!(
        "Stop requested for plan {}; in-flight tasks will finish first",
        plan.id
    ));
    Ok(())
}

pub fn remove_plan(ctx: CommandContext) -> Result<()> {
    ctx.service.remove_plan()?;
    print_success("Plan removed");
    Ok(())
}

pub fn show_plan(ctx: CommandContext) -> Result<()> {
    match ctx.service.show_plan()? {
        Some(plan) => print_plan(&plan, ctx.format),
        None => print_info("No plan"),
    }
    Ok(())
}
