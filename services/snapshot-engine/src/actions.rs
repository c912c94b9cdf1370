//! Task actions.
//!
//! Maps each [`TaskKind`] to the command sequence that carries it out on the
//! task's node. Removal and restore inspect the snapshot first so that a
//! rerun after partial success is a no-op for the snapshots already handled.

use tokio::time::Instant;
use tracing::{debug, info};
use volsnap_id::NodeId;

use crate::config::EngineConfig;
use crate::plan::{SnapshotRef, Task, TaskFailure, TaskKind};
use crate::runner::{
    CommandError, CommandRunner, FailureKind, LvmSnapshot, StorageCommand, VxvmSnapshot,
};

/// Success with an optional operator note.
type ActionResult = Result<Option<String>, CommandError>;

/// Runs one task to completion.
///
/// Returns the note to record on success.
pub async fn execute_task(
    runner: &dyn CommandRunner,
    config: &EngineConfig,
    task: &Task,
) -> Result<Option<String>, TaskFailure> {
    let actions = Actions {
        runner,
        config,
        node: &task.node,
    };

    let result = match &task.kind {
        TaskKind::CheckNodeReachable => actions.ping().await.map(|_| None),
        TaskKind::CreateLvmSnapshot { snapshot, size } => {
            actions
                .storage(StorageCommand::CreateLvmSnapshot {
                    snapshot: snapshot.clone(),
                    size: *size,
                })
                .await
        }
        TaskKind::RemoveLvmSnapshot { snapshot } => actions.remove_lvm(snapshot).await,
        TaskKind::CreateVxvmSnapshot {
            snapshot,
            cache_mib,
        } => {
            actions
                .storage(StorageCommand::CreateVxvmSnapshot {
                    snapshot: snapshot.clone(),
                    cache_mib: *cache_mib,
                })
                .await
        }
        TaskKind::RemoveVxvmSnapshot { snapshot } => actions.remove_vxvm(snapshot).await,
        TaskKind::CheckSnapshotsPresent { snapshots } => actions.check_present(snapshots).await,
        TaskKind::CheckSnapshotsValid { snapshots } => actions.check_valid(snapshots).await,
        TaskKind::StopClusterServices { .. } => {
            actions.storage(StorageCommand::StopClusterServices).await
        }
        TaskKind::RestoreLvmSnapshot { snapshot } => actions.restore_lvm(snapshot).await,
        TaskKind::RestoreVxvmSnapshot { snapshot } => actions.restore_vxvm(snapshot).await,
        TaskKind::RestartNode => actions.storage(StorageCommand::Reboot).await,
        TaskKind::WaitForNodeRestart => actions.wait_for_restart().await,
    };

    match result {
        Ok(note) => Ok(note),
        Err(CommandError::Unreachable { node }) if task.tolerate_unreachable => {
            info!(node = %node, task = task.kind.name(), "Node not reachable, continuing");
            Ok(Some(format!(
                "Node \"{node}\" not currently reachable. Continuing."
            )))
        }
        Err(e) => Err(TaskFailure::new(e.kind(), e.to_string())),
    }
}

struct Actions<'a> {
    runner: &'a dyn CommandRunner,
    config: &'a EngineConfig,
    node: &'a NodeId,
}

impl Actions<'_> {
    async fn ping(&self) -> Result<(), CommandError> {
        self.runner
            .run(self.node, &StorageCommand::Ping, self.config.reachability_timeout)
            .await
            .map(|_| ())
    }

    async fn storage(&self, command: StorageCommand) -> ActionResult {
        self.runner
            .run(self.node, &command, self.config.command_timeout)
            .await
            .map(|_| None)
    }

    /// Inspects a snapshot; `Ok(false)` when it does not exist.
    async fn inspect(&self, snapshot: &SnapshotRef) -> Result<bool, CommandError> {
        let command = match snapshot {
            SnapshotRef::Lvm(s) => StorageCommand::InspectLvmSnapshot { snapshot: s.clone() },
            SnapshotRef::Vxvm(s) => StorageCommand::InspectVxvmSnapshot { snapshot: s.clone() },
        };
        match self.runner.run(self.node, &command, self.config.command_timeout).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == FailureKind::Missing => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Like [`Self::inspect`], but a damaged snapshot still counts as present.
    async fn exists(&self, snapshot: &SnapshotRef) -> Result<bool, CommandError> {
        match self.inspect(snapshot).await {
            Err(e) if matches!(e.kind(), FailureKind::Invalid | FailureKind::DetachedInvalid) => {
                Ok(true)
            }
            other => other,
        }
    }

    fn not_found(&self, what: impl std::fmt::Display, action: &str) -> Option<String> {
        debug!(node = %self.node, snapshot = %what, "Snapshot not found");
        Some(format!(
            "Snapshot \"{what}\" not found on node \"{}\". Nothing to {action}.",
            self.node
        ))
    }

    async fn remove_lvm(&self, snapshot: &LvmSnapshot) -> ActionResult {
        // a merging snapshot fails here, even under force
        if !self.exists(&SnapshotRef::Lvm(snapshot.clone())).await? {
            return Ok(self.not_found(snapshot, "remove"));
        }
        self.storage(StorageCommand::RemoveLvmSnapshot {
            snapshot: snapshot.clone(),
        })
        .await
    }

    async fn remove_vxvm(&self, snapshot: &VxvmSnapshot) -> ActionResult {
        if !self.exists(&SnapshotRef::Vxvm(snapshot.clone())).await? {
            return Ok(self.not_found(snapshot, "remove"));
        }
        self.storage(StorageCommand::RemoveVxvmSnapshot {
            snapshot: snapshot.clone(),
        })
        .await
    }

    async fn check_present(&self, snapshots: &[SnapshotRef]) -> ActionResult {
        for snapshot in snapshots {
            match self.exists(snapshot).await {
                Ok(true) => {}
                // merging snapshots are present; the validity check rejects them
                Err(e) if e.kind() == FailureKind::Merging => {}
                Ok(false) => {
                    let name = match snapshot {
                        SnapshotRef::Lvm(s) => s.to_string(),
                        SnapshotRef::Vxvm(s) => s.to_string(),
                    };
                    return Err(CommandError::Failed {
                        node: self.node.clone(),
                        kind: FailureKind::Missing,
                        message: format!(
                            "Snapshot \"{name}\" is missing on node \"{}\"",
                            self.node
                        ),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    async fn check_valid(&self, snapshots: &[SnapshotRef]) -> ActionResult {
        let mut absent = 0;
        for snapshot in snapshots {
            if !self.inspect(snapshot).await? {
                absent += 1;
            }
        }
        Ok((absent > 0).then(|| format!("{absent} snapshot(s) not present; nothing to validate")))
    }

    async fn restore_lvm(&self, snapshot: &LvmSnapshot) -> ActionResult {
        if !self.inspect(&SnapshotRef::Lvm(snapshot.clone())).await? {
            return Ok(self.not_found(snapshot, "restore"));
        }
        self.storage(StorageCommand::MergeLvmSnapshot {
            snapshot: snapshot.clone(),
        })
        .await
    }

    async fn restore_vxvm(&self, snapshot: &VxvmSnapshot) -> ActionResult {
        if !self.inspect(&SnapshotRef::Vxvm(snapshot.clone())).await? {
            return Ok(self.not_found(snapshot, "restore"));
        }
        self.storage(StorageCommand::RestoreVxvmSnapshot {
            snapshot: snapshot.clone(),
        })
        .await?;
        // the snapshot is spent once its contents are written back
        self.storage(StorageCommand::RemoveVxvmSnapshot {
            snapshot: snapshot.clone(),
        })
        .await
    }

    /// Waits for the node to go down and answer again.
    async fn wait_for_restart(&self) -> ActionResult {
        let deadline = Instant::now() + self.config.restart_timeout;
        let mut went_down = false;

        loop {
            match self.ping().await {
                Ok(()) if went_down => {
                    info!(node = %self.node, "Node is back after restart");
                    return Ok(None);
                }
                Ok(()) => {}
                Err(_) => went_down = true,
            }

            if Instant::now() >= deadline {
                return Err(CommandError::Timeout {
                    node: self.node.clone(),
                    after: self.config.restart_timeout,
                });
            }
            tokio::time::sleep(self.config.restart_poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{MockRunner, SnapshotCondition, SnapshotSize};
    use std::time::Duration;

    fn config() -> EngineConfig {
        EngineConfig {
            command_timeout: Duration::from_millis(100),
            reachability_timeout: Duration::from_millis(100),
            restart_timeout: Duration::from_millis(300),
            restart_poll_interval: Duration::from_millis(10),
            ..EngineConfig::default()
        }
    }

    fn node() -> NodeId {
        NodeId::parse("node1").unwrap()
    }

    fn snap() -> LvmSnapshot {
        LvmSnapshot {
            volume_group: "vg_app".into(),
            origin: "vg1_root".into(),
            name: "L_vg1_root_".into(),
        }
    }

    fn task(kind: TaskKind) -> Task {
        Task::new(node(), kind, "test")
    }

    #[tokio::test]
    async fn test_remove_missing_snapshot_is_noop() {
        let runner = MockRunner::new();
        let note = execute_task(&runner, &config(), &task(TaskKind::RemoveLvmSnapshot { snapshot: snap() }))
            .await
            .unwrap();
        assert!(note.unwrap().contains("Nothing to remove"));
    }

    #[tokio::test]
    async fn test_remove_invalid_snapshot_succeeds() {
        let runner = MockRunner::new();
        runner.insert_lvm_snapshot("node1", &snap(), SnapshotCondition::Invalid);

        execute_task(&runner, &config(), &task(TaskKind::RemoveLvmSnapshot { snapshot: snap() }))
            .await
            .unwrap();
        assert!(runner.lvm_snapshots("node1").is_empty());
    }

    #[tokio::test]
    async fn test_merging_snapshot_fails_even_when_tolerant() {
        let runner = MockRunner::new();
        runner.insert_lvm_snapshot("node1", &snap(), SnapshotCondition::Merging);

        let t = task(TaskKind::RemoveLvmSnapshot { snapshot: snap() }).tolerating_unreachable(true);
        let failure = execute_task(&runner, &config(), &t).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Merging);
        assert!(failure.message.contains("is merging, can't proceed"));
    }

    #[tokio::test]
    async fn test_tolerated_unreachable_note() {
        let runner = MockRunner::new().with_unreachable("node1");
        let t = task(TaskKind::RemoveLvmSnapshot { snapshot: snap() }).tolerating_unreachable(true);

        let note = execute_task(&runner, &config(), &t).await.unwrap();
        assert_eq!(
            note.as_deref(),
            Some("Node \"node1\" not currently reachable. Continuing.")
        );

        let strict = task(TaskKind::CheckNodeReachable);
        let failure = execute_task(&runner, &config(), &strict).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Unreachable);
    }

    #[tokio::test]
    async fn test_presence_and_validity_checks() {
        let runner = MockRunner::new();
        let refs = vec![SnapshotRef::Lvm(snap())];

        let present = task(TaskKind::CheckSnapshotsPresent { snapshots: refs.clone() });
        let failure = execute_task(&runner, &config(), &present).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Missing);

        // nothing to validate is not a failure
        let valid = task(TaskKind::CheckSnapshotsValid { snapshots: refs.clone() });
        assert!(execute_task(&runner, &config(), &valid).await.is_ok());

        runner.insert_lvm_snapshot("node1", &snap(), SnapshotCondition::Invalid);
        assert!(execute_task(&runner, &config(), &present).await.is_ok());
        let failure = execute_task(&runner, &config(), &valid).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Invalid);
    }

    #[tokio::test]
    async fn test_restore_lvm_merges() {
        let runner = MockRunner::new();
        runner.insert_lvm_snapshot("node1", &snap(), SnapshotCondition::Valid);

        execute_task(&runner, &config(), &task(TaskKind::RestoreLvmSnapshot { snapshot: snap() }))
            .await
            .unwrap();
        assert_eq!(runner.merged(), vec![("node1".to_string(), "L_vg1_root_".to_string())]);
    }

    #[tokio::test]
    async fn test_restore_vxvm_restores_then_removes() {
        let runner = MockRunner::new().with_disk_group("vxdg1", "node1");
        let snapshot = VxvmSnapshot {
            disk_group: "vxdg1".into(),
            volume: "fs1".into(),
            name: "L_fs1_".into(),
        };
        runner.insert_vxvm_snapshot(&snapshot, SnapshotCondition::Valid);

        execute_task(&runner, &config(), &task(TaskKind::RestoreVxvmSnapshot { snapshot }))
            .await
            .unwrap();
        assert_eq!(runner.restored().len(), 1);
        assert!(runner.vxvm_snapshots("vxdg1").is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_restart() {
        let runner = MockRunner::new();
        execute_task(&runner, &config(), &task(TaskKind::RestartNode))
            .await
            .unwrap();
        execute_task(&runner, &config(), &task(TaskKind::WaitForNodeRestart))
            .await
            .unwrap();
        assert_eq!(runner.reboots(), vec!["node1".to_string()]);
    }

    #[tokio::test]
    async fn test_wait_expires_when_node_never_restarts() {
        let runner = MockRunner::new();
        let failure = execute_task(&runner, &config(), &task(TaskKind::WaitForNodeRestart))
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::ExecutionExpired);
    }

    #[tokio::test]
    async fn test_create_reports_duplicate() {
        let runner = MockRunner::new();
        runner.insert_lvm_snapshot("node1", &snap(), SnapshotCondition::Valid);
        let t = task(TaskKind::CreateLvmSnapshot {
            snapshot: snap(),
            size: SnapshotSize::Mib(10),
        });
        let failure = execute_task(&runner, &config(), &t).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::AlreadyExists);
    }
}
