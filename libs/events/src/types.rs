//! Event type definitions for plan progress.
//!
//! Each event type has a payload struct; [`PlanEvent`] ties a payload to its
//! event type name so the executor can publish a single stream.

use serde::{Deserialize, Serialize};
use volsnap_id::NodeId;

use crate::EventError;

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    pub const PLAN_STARTED: &str = "plan.started";
    pub const PLAN_WARNING: &str = "plan.warning";
    pub const PLAN_FINISHED: &str = "plan.finished";

    pub const PHASE_STARTED: &str = "phase.started";

    pub const TASK_STARTED: &str = "task.started";
    pub const TASK_SUCCEEDED: &str = "task.succeeded";
    pub const TASK_FAILED: &str = "task.failed";
}

// =============================================================================
// Enums
// =============================================================================

/// Terminal outcome of a plan run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanOutcome {
    Complete,
    Failed,
    Stopped,
}

impl std::fmt::Display for PlanOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanOutcome::Complete => write!(f, "Complete"),
            PlanOutcome::Failed => write!(f, "Failed"),
            PlanOutcome::Stopped => write!(f, "Stopped"),
        }
    }
}

// =============================================================================
// Event Payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStartedPayload {
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub force: bool,
    pub phase_count: usize,
    pub task_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanWarningPayload {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanFinishedPayload {
    pub outcome: PlanOutcome,
    pub succeeded: usize,
    pub failed: usize,
    pub pending: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseStartedPayload {
    /// One-based phase number.
    pub phase: usize,
    pub description: String,
    pub task_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStartedPayload {
    pub phase: usize,
    pub task: usize,
    pub node: NodeId,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSucceededPayload {
    pub phase: usize,
    pub task: usize,
    pub node: NodeId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailedPayload {
    pub phase: usize,
    pub task: usize,
    pub node: NodeId,
    /// Failure kind tag, e.g. `merging` or `execution_expired`.
    pub kind: String,
    pub message: String,
}

// =============================================================================
// Plan Event
// =============================================================================

/// A plan progress event together with its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PlanEvent {
    #[serde(rename = "plan.started")]
    PlanStarted(PlanStartedPayload),
    #[serde(rename = "plan.warning")]
    PlanWarning(PlanWarningPayload),
    #[serde(rename = "plan.finished")]
    PlanFinished(PlanFinishedPayload),
    #[serde(rename = "phase.started")]
    PhaseStarted(PhaseStartedPayload),
    #[serde(rename = "task.started")]
    TaskStarted(TaskStartedPayload),
    #[serde(rename = "task.succeeded")]
    TaskSucceeded(TaskSucceededPayload),
    #[serde(rename = "task.failed")]
    TaskFailed(TaskFailedPayload),
}

impl PlanEvent {
    /// Returns the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            PlanEvent::PlanStarted(_) => event_types::PLAN_STARTED,
            PlanEvent::PlanWarning(_) => event_types::PLAN_WARNING,
            PlanEvent::PlanFinished(_) => event_types::PLAN_FINISHED,
            PlanEvent::PhaseStarted(_) => event_types::PHASE_STARTED,
            PlanEvent::TaskStarted(_) => event_types::TASK_STARTED,
            PlanEvent::TaskSucceeded(_) => event_types::TASK_SUCCEEDED,
            PlanEvent::TaskFailed(_) => event_types::TASK_FAILED,
        }
    }

    /// Decodes an event from its type name and JSON payload.
    pub fn from_parts(event_type: &str, data: serde_json::Value) -> Result<Self, EventError> {
        let event = match event_type {
            event_types::PLAN_STARTED => PlanEvent::PlanStarted(serde_json::from_value(data)?),
            event_types::PLAN_WARNING => PlanEvent::PlanWarning(serde_json::from_value(data)?),
            event_types::PLAN_FINISHED => PlanEvent::PlanFinished(serde_json::from_value(data)?),
            event_types::PHASE_STARTED => PlanEvent::PhaseStarted(serde_json::from_value(data)?),
            event_types::TASK_STARTED => PlanEvent::TaskStarted(serde_json::from_value(data)?),
            event_types::TASK_SUCCEEDED => {
                PlanEvent::TaskSucceeded(serde_json::from_value(data)?)
            }
            event_types::TASK_FAILED => PlanEvent::TaskFailed(serde_json::from_value(data)?),
            other => return Err(EventError::UnknownEventType(other.to_string())),
        };
        Ok(event)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn node() -> NodeId {
        NodeId::parse("node1").unwrap()
    }

    #[test]
    fn test_plan_outcome_serialization() {
        assert_eq!(
            serde_json::to_string(&PlanOutcome::Complete).unwrap(),
            "\"complete\""
        );
        assert_eq!(PlanOutcome::Stopped.to_string(), "Stopped");
    }

    #[test]
    fn test_plan_event_tagging() {
        let event = PlanEvent::TaskFailed(TaskFailedPayload {
            phase: 2,
            task: 1,
            node: node(),
            kind: "merging".to_string(),
            message: "L_vg1_root_ is merging, can't proceed.".to_string(),
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "task.failed");
        assert_eq!(json["data"]["node"], "node1");
        assert_eq!(event.event_type(), event_types::TASK_FAILED);
    }

    #[test]
    fn test_from_parts_matches_event_type() {
        let payload = TaskSucceededPayload {
            phase: 1,
            task: 3,
            node: node(),
            note: Some("Node \"node1\" not currently reachable. Continuing.".to_string()),
        };
        let data = serde_json::to_value(&payload).unwrap();

        let event = PlanEvent::from_parts(event_types::TASK_SUCCEEDED, data).unwrap();
        assert_eq!(event, PlanEvent::TaskSucceeded(payload));
    }

    #[test]
    fn test_from_parts_unknown_type() {
        let result = PlanEvent::from_parts("plan.exploded", serde_json::Value::Null);
        assert!(matches!(result, Err(EventError::UnknownEventType(_))));
    }

    proptest! {
        #[test]
        fn prop_task_failed_rebuilds_from_parts(
            phase in 1usize..64,
            task in 1usize..512,
            kind in "[a-z_]{1,24}",
            message in "\\PC{0,80}",
        ) {
            let event = PlanEvent::TaskFailed(TaskFailedPayload {
                phase,
                task,
                node: node(),
                kind,
                message,
            });
            let json = serde_json::to_value(&event).unwrap();

            let rebuilt = PlanEvent::from_parts(event.event_type(), json["data"].clone()).unwrap();
            prop_assert_eq!(rebuilt, event);
        }
    }
}
