//! Engine error taxonomy.

use thiserror::Error;
use volsnap_model::ModelError;

use crate::plan::Operation;
use crate::store::StateStoreError;

/// Errors surfaced to callers of the engine.
///
/// Task failures are not errors: they are recorded on the task and reflected
/// in the plan state.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Plan generation produced no snapshot tasks.
    #[error("{} plan failed: no tasks were generated", .operation.title())]
    DoNothingPlan { operation: Operation },

    /// The request conflicts with the current plan.
    #[error("{0}")]
    InvalidRequest(String),

    /// The request itself is malformed.
    #[error("{0}")]
    Validation(String),

    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("state store error: {0}")]
    Store(#[from] StateStoreError),
}

impl EngineError {
    /// Caller-facing error type printed before the message.
    pub fn error_type(&self) -> &'static str {
        match self {
            EngineError::DoNothingPlan { .. } => "DoNothingPlanError",
            EngineError::InvalidRequest(_) => "InvalidRequestError",
            EngineError::Validation(_) => "ValidationError",
            EngineError::Model(_) | EngineError::Store(_) => "InternalServerError",
        }
    }

    pub(crate) fn invalid_request(msg: impl Into<String>) -> Self {
        EngineError::InvalidRequest(msg.into())
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_do_nothing_message() {
        let err = EngineError::DoNothingPlan {
            operation: Operation::Remove,
        };
        assert_eq!(err.to_string(), "Remove plan failed: no tasks were generated");
        assert_eq!(err.error_type(), "DoNothingPlanError");
    }

    #[test]
    fn test_error_types() {
        assert_eq!(
            EngineError::invalid_request("Plan already running").error_type(),
            "InvalidRequestError"
        );
        assert_eq!(
            EngineError::validation("bad tag").error_type(),
            "ValidationError"
        );
        assert_eq!(
            EngineError::Store(StateStoreError::Poisoned).error_type(),
            "InternalServerError"
        );
    }
}
