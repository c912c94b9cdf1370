//! Error handling and display for the CLI.

use colored::Colorize;
use thiserror::Error;
use volsnap_engine::{EngineError, PlanState};
use volsnap_model::ModelError;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Plan finished in state {state}: {detail}")]
    PlanUnsuccessful { state: PlanState, detail: String },

    #[error("Invalid node name \"{name}\": {reason}")]
    InvalidNode { name: String, reason: String },

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl CliError {
    fn error_type(&self) -> &'static str {
        match self {
            CliError::PlanUnsuccessful { .. } => "PlanError",
            CliError::InvalidNode { .. } => "ValidationError",
            CliError::Other(_) => "Error",
        }
    }
}

/// Print an error as `<ErrorType>    <message>`.
pub fn print_error(err: &anyhow::Error) {
    if let Some(engine_err) = err.downcast_ref::<EngineError>() {
        eprintln!("{}    {}", engine_err.error_type().red().bold(), engine_err);
        if let EngineError::Store(_) = engine_err {
            eprintln!(
                "\n{}",
                "Hint: Check that --state-dir is writable.".yellow()
            );
        }
        return;
    }

    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        eprintln!("{}    {}", cli_err.error_type().red().bold(), cli_err);
        if let CliError::PlanUnsuccessful { .. } = cli_err {
            eprintln!(
                "\n{}",
                "Hint: Run `snapctl show-plan` for the state of every task.".yellow()
            );
        }
        return;
    }

    if let Some(model_err) = err.downcast_ref::<ModelError>() {
        eprintln!("{}    {}", "ModelError".red().bold(), model_err);
        eprintln!(
            "\n{}",
            "Hint: Pass the deployment model with --model or VOLSNAP_MODEL.".yellow()
        );
        return;
    }

    eprintln!("{}    {:#}", "Error".red().bold(), err);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_unsuccessful_message() {
        let err = CliError::PlanUnsuccessful {
            state: PlanState::Failed,
            detail: "node \"n1\" is unreachable".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Plan finished in state Failed: node \"n1\" is unreachable"
        );
        assert_eq!(err.error_type(), "PlanError");
    }
}
