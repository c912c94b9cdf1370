//! Plan data model.
//!
//! A plan is an ordered list of phases; a phase is a set of tasks that may
//! run concurrently across nodes. Each task targets exactly one node.
//!
//! State machines:
//! - Task: `Pending -> Running -> Success | Failed`
//! - Plan: `Initial -> Running -> Complete | Failed | Stopping -> Stopped`

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use volsnap_id::{ClusterId, NodeId, PlanId, RequestId};

use crate::naming::SnapshotTag;
use crate::runner::{FailureKind, LvmSnapshot, SnapshotSize, VxvmSnapshot};

/// Snapshot operation requested by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Remove,
    Restore,
}

impl Operation {
    /// Capitalized name used in operator messages.
    pub fn title(&self) -> &'static str {
        match self {
            Operation::Create => "Create",
            Operation::Remove => "Remove",
            Operation::Restore => "Restore",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Create => write!(f, "create"),
            Operation::Remove => write!(f, "remove"),
            Operation::Restore => write!(f, "restore"),
        }
    }
}

/// Parameters of a snapshot operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub operation: Operation,
    /// Absent for the deployment snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<SnapshotTag>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub exclude_nodes: BTreeSet<NodeId>,
    #[serde(default)]
    pub force: bool,
    /// Tags every event of the resulting plan.
    #[serde(default)]
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
}

impl SnapshotRequest {
    fn new(operation: Operation, tag: Option<SnapshotTag>) -> Self {
        Self {
            operation,
            tag,
            exclude_nodes: BTreeSet::new(),
            force: false,
            request_id: RequestId::new(),
            requested_by: None,
        }
    }

    pub fn create(tag: Option<SnapshotTag>) -> Self {
        Self::new(Operation::Create, tag)
    }

    pub fn remove(tag: Option<SnapshotTag>) -> Self {
        Self::new(Operation::Remove, tag)
    }

    /// Restore always targets the deployment snapshot.
    pub fn restore() -> Self {
        Self::new(Operation::Restore, None)
    }

    pub fn exclude(mut self, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        self.exclude_nodes.extend(nodes);
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Records the operator on whose behalf the plan runs.
    pub fn requested_by(mut self, operator: impl Into<String>) -> Self {
        self.requested_by = Some(operator.into());
        self
    }

    /// Whether the request targets the deployment snapshot.
    pub fn is_deployment(&self) -> bool {
        self.tag.is_none()
    }
}

/// Plan lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanState {
    Initial,
    Running,
    Stopping,
    Stopped,
    Complete,
    Failed,
}

impl PlanState {
    /// Running or winding down.
    pub fn is_active(&self) -> bool {
        matches!(self, PlanState::Running | PlanState::Stopping)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlanState::Stopped | PlanState::Complete | PlanState::Failed
        )
    }
}

impl std::fmt::Display for PlanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PlanState::Initial => "Initial",
            PlanState::Running => "Running",
            PlanState::Stopping => "Stopping",
            PlanState::Stopped => "Stopped",
            PlanState::Complete => "Successful",
            PlanState::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Success,
    Failed,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Pending => "Initial",
            TaskState::Running => "Running",
            TaskState::Success => "Success",
            TaskState::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Why a task failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// A snapshot checked by the presence and validity tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "snake_case")]
pub enum SnapshotRef {
    Lvm(LvmSnapshot),
    Vxvm(VxvmSnapshot),
}

/// What a task does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    CheckNodeReachable,
    CreateLvmSnapshot {
        snapshot: LvmSnapshot,
        size: SnapshotSize,
    },
    RemoveLvmSnapshot {
        snapshot: LvmSnapshot,
    },
    CreateVxvmSnapshot {
        snapshot: VxvmSnapshot,
        cache_mib: u64,
    },
    RemoveVxvmSnapshot {
        snapshot: VxvmSnapshot,
    },
    CheckSnapshotsPresent {
        snapshots: Vec<SnapshotRef>,
    },
    CheckSnapshotsValid {
        snapshots: Vec<SnapshotRef>,
    },
    StopClusterServices {
        cluster: ClusterId,
    },
    RestoreLvmSnapshot {
        snapshot: LvmSnapshot,
    },
    RestoreVxvmSnapshot {
        snapshot: VxvmSnapshot,
    },
    RestartNode,
    WaitForNodeRestart,
}

impl TaskKind {
    /// Short name used in logs and events.
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::CheckNodeReachable => "check_node_reachable",
            TaskKind::CreateLvmSnapshot { .. } => "create_lvm_snapshot",
            TaskKind::RemoveLvmSnapshot { .. } => "remove_lvm_snapshot",
            TaskKind::CreateVxvmSnapshot { .. } => "create_vxvm_snapshot",
            TaskKind::RemoveVxvmSnapshot { .. } => "remove_vxvm_snapshot",
            TaskKind::CheckSnapshotsPresent { .. } => "check_snapshots_present",
            TaskKind::CheckSnapshotsValid { .. } => "check_snapshots_valid",
            TaskKind::StopClusterServices { .. } => "stop_cluster_services",
            TaskKind::RestoreLvmSnapshot { .. } => "restore_lvm_snapshot",
            TaskKind::RestoreVxvmSnapshot { .. } => "restore_vxvm_snapshot",
            TaskKind::RestartNode => "restart_node",
            TaskKind::WaitForNodeRestart => "wait_for_node_restart",
        }
    }
}

/// A unit of work on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub node: NodeId,
    pub kind: TaskKind,
    pub description: String,
    pub state: TaskState,
    /// An unreachable node counts as success, with a note.
    #[serde(default)]
    pub tolerate_unreachable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<TaskFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Task {
    pub fn new(node: NodeId, kind: TaskKind, description: impl Into<String>) -> Self {
        Self {
            node,
            kind,
            description: description.into(),
            state: TaskState::Pending,
            tolerate_unreachable: false,
            failure: None,
            note: None,
        }
    }

    pub fn tolerating_unreachable(mut self, tolerate: bool) -> Self {
        self.tolerate_unreachable = tolerate;
        self
    }
}

/// Tasks that run together; the next phase starts only after this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub description: String,
    pub tasks: Vec<Task>,
}

impl Phase {
    pub fn new(description: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            description: description.into(),
            tasks,
        }
    }
}

/// Task totals by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl TaskCounts {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.succeeded + self.failed
    }
}

/// An executable plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub request: SnapshotRequest,
    pub state: PlanState,
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Nodes the plan acts on.
    pub scope_nodes: BTreeSet<NodeId>,
    pub model_fingerprint: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Plan {
    pub fn new(
        request: SnapshotRequest,
        phases: Vec<Phase>,
        warnings: Vec<String>,
        scope_nodes: BTreeSet<NodeId>,
        model_fingerprint: String,
    ) -> Self {
        Self {
            id: PlanId::new(),
            request,
            state: PlanState::Initial,
            phases,
            warnings,
            scope_nodes,
            model_fingerprint,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn operation(&self) -> Operation {
        self.request.operation
    }

    /// Restore plans can be neither stopped nor removed while running.
    pub fn is_protected(&self) -> bool {
        self.request.operation == Operation::Restore
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.phases.iter().flat_map(|p| p.tasks.iter())
    }

    pub fn task_count(&self) -> usize {
        self.phases.iter().map(|p| p.tasks.len()).sum()
    }

    pub fn counts(&self) -> TaskCounts {
        let mut counts = TaskCounts::default();
        for task in self.tasks() {
            match task.state {
                TaskState::Pending => counts.pending += 1,
                TaskState::Running => counts.running += 1,
                TaskState::Success => counts.succeeded += 1,
                TaskState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// First failed task, in plan order.
    pub fn first_failure(&self) -> Option<&Task> {
        self.tasks().find(|t| t.state == TaskState::Failed)
    }

    /// Whether any task targets `node`.
    pub fn touches_node(&self, node: &NodeId) -> bool {
        self.tasks().any(|t| &t.node == node)
    }
}
