//! Remote command execution.
//!
//! The engine never talks to nodes directly. Every storage, cluster and
//! reboot operation goes through a [`CommandRunner`]:
//! - [`SshRunner`] runs commands over SSH in production
//! - [`MockRunner`] simulates a fleet in memory for tests and dry runs
//!
//! Runners classify failures once, at the transport boundary, into a
//! [`FailureKind`]; nothing downstream inspects command output.

mod command;
mod mock;
mod ssh;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use volsnap_id::NodeId;

pub use command::{shell_join, LvmSnapshot, SnapshotSize, StorageCommand, VxvmSnapshot};
pub use mock::{MockRunner, SnapshotCondition};
pub use ssh::{SshConfig, SshRunner};

/// Why a task or command failed.
///
/// Each kind carries the fixed phrase operators grep for in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The node did not answer.
    Unreachable,
    /// The command or task exceeded its time budget.
    ExecutionExpired,
    /// A snapshot with the same name already exists.
    AlreadyExists,
    /// The volume group cannot hold the requested snapshot.
    InsufficientSpace,
    /// The LVM snapshot is being merged into its origin.
    Merging,
    /// The LVM snapshot overflowed and is no longer usable.
    Invalid,
    /// The VxVM snapshot is detached or invalid.
    DetachedInvalid,
    /// The snapshot does not exist.
    Missing,
    /// Any other non-zero exit.
    CommandFailed,
}

impl FailureKind {
    /// Stable tag used in events and JSON output.
    pub fn tag(&self) -> &'static str {
        match self {
            FailureKind::Unreachable => "unreachable",
            FailureKind::ExecutionExpired => "execution_expired",
            FailureKind::AlreadyExists => "already_exists",
            FailureKind::InsufficientSpace => "insufficient_space",
            FailureKind::Merging => "merging",
            FailureKind::Invalid => "invalid",
            FailureKind::DetachedInvalid => "detached_invalid",
            FailureKind::Missing => "missing",
            FailureKind::CommandFailed => "command_failed",
        }
    }

    /// Operator-facing phrase that identifies this failure in messages.
    pub fn phrase(&self) -> &'static str {
        match self {
            FailureKind::Unreachable => "Unreachable node(s)",
            FailureKind::ExecutionExpired => "execution expired",
            FailureKind::AlreadyExists => "already exists in volume group",
            FailureKind::InsufficientSpace => "has insufficient free space",
            FailureKind::Merging => "is merging, can't proceed",
            FailureKind::Invalid => "is invalid",
            FailureKind::DetachedInvalid => "DETACHED INVALID",
            FailureKind::Missing => "not found",
            FailureKind::CommandFailed => "command failed",
        }
    }

    /// Classifies command stderr into a failure kind.
    pub fn classify(stderr: &str) -> FailureKind {
        let lower = stderr.to_ascii_lowercase();
        if lower.contains("already exists in volume group") || lower.contains("already exists") {
            FailureKind::AlreadyExists
        } else if lower.contains("insufficient free space") {
            FailureKind::InsufficientSpace
        } else if lower.contains("merging") {
            FailureKind::Merging
        } else if stderr.contains("DETACHED") || stderr.contains("INVALID") {
            FailureKind::DetachedInvalid
        } else if lower.contains("not found") || lower.contains("failed to find") {
            FailureKind::Missing
        } else {
            FailureKind::CommandFailed
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Output of a command that exited successfully.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
}

/// Errors returned by a [`CommandRunner`].
#[derive(Debug, Clone, Error)]
pub enum CommandError {
    #[error("Unreachable node(s): {node}")]
    Unreachable { node: NodeId },

    #[error("execution expired after {}s on node \"{node}\"", .after.as_secs())]
    Timeout { node: NodeId, after: Duration },

    #[error("{message}")]
    Failed {
        node: NodeId,
        kind: FailureKind,
        message: String,
    },
}

impl CommandError {
    /// Returns the failure classification.
    pub fn kind(&self) -> FailureKind {
        match self {
            CommandError::Unreachable { .. } => FailureKind::Unreachable,
            CommandError::Timeout { .. } => FailureKind::ExecutionExpired,
            CommandError::Failed { kind, .. } => *kind,
        }
    }

    /// Returns the node the command ran against.
    pub fn node(&self) -> &NodeId {
        match self {
            CommandError::Unreachable { node }
            | CommandError::Timeout { node, .. }
            | CommandError::Failed { node, .. } => node,
        }
    }
}

/// Remote command execution interface.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `command` on `node`, giving up after `timeout`.
    async fn run(
        &self,
        node: &NodeId,
        command: &StorageCommand,
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(
        "Logical volume \"L_vg1_root_\" already exists in volume group \"vg_app\"",
        FailureKind::AlreadyExists
    )]
    #[case(
        "Volume group \"vg_app\" has insufficient free space (10 extents): 512 required.",
        FailureKind::InsufficientSpace
    )]
    #[case("Can't remove merging snapshot", FailureKind::Merging)]
    #[case("L_fs1_  DETACHED INVALID", FailureKind::DetachedInvalid)]
    #[case("Failed to find logical volume \"vg/L_x_\"", FailureKind::Missing)]
    #[case("permission denied", FailureKind::CommandFailed)]
    fn test_classify_stderr(#[case] stderr: &str, #[case] expected: FailureKind) {
        assert_eq!(FailureKind::classify(stderr), expected);
    }

    #[test]
    fn test_command_error_messages_carry_phrases() {
        let node = NodeId::parse("node1").unwrap();

        let unreachable = CommandError::Unreachable { node: node.clone() };
        assert!(unreachable
            .to_string()
            .contains(FailureKind::Unreachable.phrase()));

        let timeout = CommandError::Timeout {
            node,
            after: Duration::from_secs(30),
        };
        assert_eq!(timeout.kind(), FailureKind::ExecutionExpired);
        assert!(timeout.to_string().contains("execution expired"));
    }
}
