//! In-memory fleet simulation.
//!
//! `MockRunner` keeps a model of every node's snapshot volumes, disk group
//! imports and reachability, and answers [`StorageCommand`]s against it the
//! way the real tools would. Tests drive it to reproduce offline nodes, hung
//! commands, merging or invalid snapshots and full volume groups. A rebooted
//! node misses exactly one command before it answers again.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};
use volsnap_id::NodeId;

use super::{
    CommandError, CommandOutput, CommandRunner, FailureKind, LvmSnapshot, SnapshotSize,
    StorageCommand, VxvmSnapshot,
};

/// Simulated condition of a snapshot volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotCondition {
    Valid,
    /// LVM: overflowed copy-on-write space.
    Invalid,
    /// LVM: merge into origin in progress.
    Merging,
    /// VxVM: detached from its cache object.
    DetachedInvalid,
}

type LvmKey = (String, String, String);
type VxvmKey = (String, String);

#[derive(Debug, Default)]
struct Fleet {
    unreachable: BTreeSet<String>,
    hanging: BTreeSet<String>,
    latency: Option<Duration>,
    /// Rebooted nodes that have not yet been seen down.
    rebooting: BTreeSet<String>,
    lvm: BTreeMap<LvmKey, SnapshotCondition>,
    vxvm: BTreeMap<VxvmKey, SnapshotCondition>,
    imported: BTreeMap<String, String>,
    free_mib: BTreeMap<(String, String), u64>,
    forced: BTreeMap<(String, &'static str), FailureKind>,
    merged: Vec<(String, String)>,
    restored: Vec<(String, String)>,
    cluster_stops: Vec<String>,
    reboots: Vec<String>,
    calls: Vec<(NodeId, StorageCommand)>,
}

/// Mock command runner backed by a simulated fleet.
pub struct MockRunner {
    fleet: Mutex<Fleet>,
    command_counter: AtomicU64,
}

impl MockRunner {
    /// Creates a fleet where every node is reachable and holds no snapshots.
    pub fn new() -> Self {
        Self {
            fleet: Mutex::new(Fleet::default()),
            command_counter: AtomicU64::new(0),
        }
    }

    /// Delays every command by `latency` before it is answered.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.fleet().latency = Some(latency);
        self
    }

    /// Marks a node as powered off.
    pub fn with_unreachable(self, node: &str) -> Self {
        self.set_reachable(node, false);
        self
    }

    /// Makes every command on `node` hang until its timeout expires.
    pub fn with_hang(self, node: &str) -> Self {
        self.fleet().hanging.insert(node.to_string());
        self
    }

    /// Imports a VxVM disk group on `node`.
    pub fn with_disk_group(self, disk_group: &str, node: &str) -> Self {
        self.fleet()
            .imported
            .insert(disk_group.to_string(), node.to_string());
        self
    }

    /// Limits free space in an LVM volume group.
    pub fn with_free_space(self, node: &str, volume_group: &str, mib: u64) -> Self {
        self.fleet()
            .free_mib
            .insert((node.to_string(), volume_group.to_string()), mib);
        self
    }

    /// Makes every `command` (by [`StorageCommand::name`]) on `node` fail.
    pub fn with_failure(self, node: &str, command: &'static str, kind: FailureKind) -> Self {
        self.fleet().forced.insert((node.to_string(), command), kind);
        self
    }

    /// Powers a node on or off.
    pub fn set_reachable(&self, node: &str, reachable: bool) {
        let mut fleet = self.fleet();
        if reachable {
            fleet.unreachable.remove(node);
        } else {
            fleet.unreachable.insert(node.to_string());
        }
    }

    /// Places an LVM snapshot on a node, e.g. one left over from an earlier run.
    pub fn insert_lvm_snapshot(
        &self,
        node: &str,
        snapshot: &LvmSnapshot,
        condition: SnapshotCondition,
    ) {
        self.fleet().lvm.insert(lvm_key(node, snapshot), condition);
    }

    /// Places a VxVM snapshot in a disk group.
    pub fn insert_vxvm_snapshot(&self, snapshot: &VxvmSnapshot, condition: SnapshotCondition) {
        self.fleet().vxvm.insert(vxvm_key(snapshot), condition);
    }

    /// Changes the condition of every LVM snapshot named `name` on `node`.
    pub fn set_lvm_condition(&self, node: &str, name: &str, condition: SnapshotCondition) {
        let mut fleet = self.fleet();
        for (key, value) in fleet.lvm.iter_mut() {
            if key.0 == node && key.2 == name {
                *value = condition;
            }
        }
    }

    /// Changes the condition of a VxVM snapshot.
    pub fn set_vxvm_condition(&self, disk_group: &str, name: &str, condition: SnapshotCondition) {
        if let Some(value) = self
            .fleet()
            .vxvm
            .get_mut(&(disk_group.to_string(), name.to_string()))
        {
            *value = condition;
        }
    }

    /// Names of the LVM snapshots present on a node.
    pub fn lvm_snapshots(&self, node: &str) -> Vec<String> {
        self.fleet()
            .lvm
            .keys()
            .filter(|(n, _, _)| n == node)
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    /// Names of the snapshots present in a VxVM disk group.
    pub fn vxvm_snapshots(&self, disk_group: &str) -> Vec<String> {
        self.fleet()
            .vxvm
            .keys()
            .filter(|(dg, _)| dg == disk_group)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// `(node, snapshot)` pairs merged into their origins, in order.
    pub fn merged(&self) -> Vec<(String, String)> {
        self.fleet().merged.clone()
    }

    /// `(disk group, snapshot)` pairs restored, in order.
    pub fn restored(&self) -> Vec<(String, String)> {
        self.fleet().restored.clone()
    }

    /// Nodes that received a cluster stop, in order.
    pub fn cluster_stops(&self) -> Vec<String> {
        self.fleet().cluster_stops.clone()
    }

    /// Nodes that were rebooted, in order.
    pub fn reboots(&self) -> Vec<String> {
        self.fleet().reboots.clone()
    }

    /// Every command received, in order.
    pub fn calls(&self) -> Vec<(NodeId, StorageCommand)> {
        self.fleet().calls.clone()
    }

    /// Number of commands received.
    pub fn command_count(&self) -> u64 {
        self.command_counter.load(Ordering::SeqCst)
    }

    fn fleet(&self) -> MutexGuard<'_, Fleet> {
        self.fleet.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn apply(&self, node: &NodeId, command: &StorageCommand) -> Result<CommandOutput, CommandError> {
        let host = node.as_str();
        let mut fleet = self.fleet();

        if fleet.unreachable.contains(host) || fleet.rebooting.remove(host) {
            return Err(CommandError::Unreachable { node: node.clone() });
        }

        let fail = |kind: FailureKind, message: String| CommandError::Failed {
            node: node.clone(),
            kind,
            message,
        };

        if let Some(kind) = fleet.forced.get(&(host.to_string(), command.name())) {
            return Err(fail(
                *kind,
                format!("[MOCK] {} failed: {}", command.name(), kind.phrase()),
            ));
        }

        match command {
            StorageCommand::Ping => {}

            StorageCommand::CreateLvmSnapshot { snapshot, size } => {
                let key = lvm_key(host, snapshot);
                if fleet.lvm.contains_key(&key) {
                    return Err(fail(
                        FailureKind::AlreadyExists,
                        format!(
                            "Logical volume \"{}\" already exists in volume group \"{}\"",
                            snapshot.name, snapshot.volume_group
                        ),
                    ));
                }
                let vg_key = (host.to_string(), snapshot.volume_group.clone());
                if let (Some(free), SnapshotSize::Mib(required)) =
                    (fleet.free_mib.get_mut(&vg_key), size)
                {
                    if *required > *free {
                        return Err(fail(
                            FailureKind::InsufficientSpace,
                            format!(
                                "Volume group \"{}\" has insufficient free space ({}M): {}M required.",
                                snapshot.volume_group, free, required
                            ),
                        ));
                    }
                    *free -= *required;
                }
                fleet.lvm.insert(key, SnapshotCondition::Valid);
            }

            StorageCommand::RemoveLvmSnapshot { snapshot } => {
                let key = lvm_key(host, snapshot);
                match fleet.lvm.get(&key) {
                    None => return Err(lvm_missing(node, snapshot)),
                    Some(SnapshotCondition::Merging) => return Err(lvm_merging(node, snapshot)),
                    Some(_) => {
                        fleet.lvm.remove(&key);
                    }
                }
            }

            StorageCommand::InspectLvmSnapshot { snapshot } => {
                match fleet.lvm.get(&lvm_key(host, snapshot)) {
                    None => return Err(lvm_missing(node, snapshot)),
                    Some(SnapshotCondition::Merging) => return Err(lvm_merging(node, snapshot)),
                    Some(SnapshotCondition::Invalid | SnapshotCondition::DetachedInvalid) => {
                        return Err(fail(
                            FailureKind::Invalid,
                            format!("Snapshot \"{snapshot}\" on node \"{node}\" is invalid"),
                        ))
                    }
                    Some(SnapshotCondition::Valid) => {}
                }
            }

            StorageCommand::MergeLvmSnapshot { snapshot } => {
                let key = lvm_key(host, snapshot);
                match fleet.lvm.get(&key) {
                    None => return Err(lvm_missing(node, snapshot)),
                    Some(SnapshotCondition::Merging) => return Err(lvm_merging(node, snapshot)),
                    Some(SnapshotCondition::Invalid | SnapshotCondition::DetachedInvalid) => {
                        return Err(fail(
                            FailureKind::Invalid,
                            format!("Unable to merge invalid snapshot \"{snapshot}\""),
                        ))
                    }
                    Some(SnapshotCondition::Valid) => {
                        fleet.lvm.remove(&key);
                        fleet.merged.push((host.to_string(), snapshot.name.clone()));
                    }
                }
            }

            StorageCommand::CreateVxvmSnapshot { snapshot, .. } => {
                check_imported(&fleet, node, &snapshot.disk_group)?;
                let key = vxvm_key(snapshot);
                if fleet.vxvm.contains_key(&key) {
                    return Err(fail(
                        FailureKind::AlreadyExists,
                        format!(
                            "Volume \"{}\" already exists in disk group \"{}\"",
                            snapshot.name, snapshot.disk_group
                        ),
                    ));
                }
                fleet.vxvm.insert(key, SnapshotCondition::Valid);
            }

            StorageCommand::RemoveVxvmSnapshot { snapshot } => {
                check_imported(&fleet, node, &snapshot.disk_group)?;
                if fleet.vxvm.remove(&vxvm_key(snapshot)).is_none() {
                    return Err(vxvm_missing(node, snapshot));
                }
            }

            StorageCommand::InspectVxvmSnapshot { snapshot } => {
                check_imported(&fleet, node, &snapshot.disk_group)?;
                match fleet.vxvm.get(&vxvm_key(snapshot)) {
                    None => return Err(vxvm_missing(node, snapshot)),
                    Some(SnapshotCondition::Valid) => {}
                    Some(_) => {
                        return Err(fail(
                            FailureKind::DetachedInvalid,
                            format!("{}  DETACHED INVALID", snapshot.name),
                        ))
                    }
                }
            }

            StorageCommand::RestoreVxvmSnapshot { snapshot } => {
                check_imported(&fleet, node, &snapshot.disk_group)?;
                match fleet.vxvm.get(&vxvm_key(snapshot)) {
                    None => return Err(vxvm_missing(node, snapshot)),
                    Some(SnapshotCondition::Valid) => {
                        fleet
                            .restored
                            .push((snapshot.disk_group.clone(), snapshot.name.clone()));
                    }
                    Some(_) => {
                        return Err(fail(
                            FailureKind::DetachedInvalid,
                            format!("{}  DETACHED INVALID", snapshot.name),
                        ))
                    }
                }
            }

            StorageCommand::DiskGroupImported { disk_group } => {
                check_imported(&fleet, node, disk_group)?;
            }

            StorageCommand::StopClusterServices => fleet.cluster_stops.push(host.to_string()),

            StorageCommand::Reboot => {
                fleet.reboots.push(host.to_string());
                fleet.rebooting.insert(host.to_string());
            }
        }

        Ok(CommandOutput::default())
    }
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(
        &self,
        node: &NodeId,
        command: &StorageCommand,
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        self.command_counter.fetch_add(1, Ordering::SeqCst);

        let (hanging, latency) = {
            let mut fleet = self.fleet();
            fleet.calls.push((node.clone(), command.clone()));
            (fleet.hanging.contains(node.as_str()), fleet.latency)
        };

        if hanging {
            info!(node = %node, command = command.name(), "[MOCK] Command hanging");
            tokio::time::sleep(timeout).await;
            return Err(CommandError::Timeout {
                node: node.clone(),
                after: timeout,
            });
        }

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let result = self.apply(node, command);
        debug!(
            node = %node,
            command = command.name(),
            ok = result.is_ok(),
            "[MOCK] Command finished"
        );
        result
    }
}

fn lvm_key(node: &str, snapshot: &LvmSnapshot) -> LvmKey {
    (
        node.to_string(),
        snapshot.volume_group.clone(),
        snapshot.name.clone(),
    )
}

fn vxvm_key(snapshot: &VxvmSnapshot) -> VxvmKey {
    (snapshot.disk_group.clone(), snapshot.name.clone())
}

fn lvm_missing(node: &NodeId, snapshot: &LvmSnapshot) -> CommandError {
    CommandError::Failed {
        node: node.clone(),
        kind: FailureKind::Missing,
        message: format!("Failed to find logical volume \"{snapshot}\""),
    }
}

fn lvm_merging(node: &NodeId, snapshot: &LvmSnapshot) -> CommandError {
    CommandError::Failed {
        node: node.clone(),
        kind: FailureKind::Merging,
        message: format!(
            "Snapshot \"{}\" on node \"{}\" is merging, can't proceed.",
            snapshot.name, node
        ),
    }
}

fn vxvm_missing(node: &NodeId, snapshot: &VxvmSnapshot) -> CommandError {
    CommandError::Failed {
        node: node.clone(),
        kind: FailureKind::Missing,
        message: format!(
            "Snapshot volume \"{}\" not found in disk group \"{}\"",
            snapshot.name, snapshot.disk_group
        ),
    }
}

fn check_imported(fleet: &Fleet, node: &NodeId, disk_group: &str) -> Result<(), CommandError> {
    if fleet.imported.get(disk_group).map(String::as_str) == Some(node.as_str()) {
        Ok(())
    } else {
        Err(CommandError::Failed {
            node: node.clone(),
            kind: FailureKind::CommandFailed,
            message: format!("Disk group \"{disk_group}\" is not imported on node \"{node}\""),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> NodeId {
        NodeId::parse(name).unwrap()
    }

    fn snap() -> LvmSnapshot {
        LvmSnapshot {
            volume_group: "vg_app".into(),
            origin: "vg1_data".into(),
            name: "L_vg1_data_".into(),
        }
    }

    const T: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_mock_create_then_duplicate() {
        let runner = MockRunner::new();
        let cmd = StorageCommand::CreateLvmSnapshot {
            snapshot: snap(),
            size: SnapshotSize::Mib(100),
        };

        runner.run(&node("n1"), &cmd, T).await.unwrap();
        assert_eq!(runner.lvm_snapshots("n1"), vec!["L_vg1_data_"]);

        let err = runner.run(&node("n1"), &cmd, T).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::AlreadyExists);
        assert!(err.to_string().contains("already exists in volume group"));
    }

    #[tokio::test]
    async fn test_mock_insufficient_space() {
        let runner = MockRunner::new().with_free_space("n1", "vg_app", 50);
        let cmd = StorageCommand::CreateLvmSnapshot {
            snapshot: snap(),
            size: SnapshotSize::Mib(100),
        };

        let err = runner.run(&node("n1"), &cmd, T).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::InsufficientSpace);
        assert!(err.to_string().contains("has insufficient free space"));
    }

    #[tokio::test]
    async fn test_mock_merging_blocks_remove() {
        let runner = MockRunner::new();
        runner.insert_lvm_snapshot("n1", &snap(), SnapshotCondition::Merging);

        let cmd = StorageCommand::RemoveLvmSnapshot { snapshot: snap() };
        let err = runner.run(&node("n1"), &cmd, T).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Merging);
        assert_eq!(runner.lvm_snapshots("n1").len(), 1);
    }

    #[tokio::test]
    async fn test_mock_unreachable_and_hang() {
        let runner = MockRunner::new().with_unreachable("n1").with_hang("n2");

        let err = runner
            .run(&node("n1"), &StorageCommand::Ping, T)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Unreachable);

        let err = runner
            .run(&node("n2"), &StorageCommand::Ping, T)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::ExecutionExpired);
        assert_eq!(runner.command_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_vxvm_requires_import() {
        let runner = MockRunner::new().with_disk_group("vxdg1", "n2");
        let cmd = StorageCommand::CreateVxvmSnapshot {
            snapshot: VxvmSnapshot {
                disk_group: "vxdg1".into(),
                volume: "fs1".into(),
                name: "L_fs1_".into(),
            },
            cache_mib: 10,
        };

        assert!(runner.run(&node("n1"), &cmd, T).await.is_err());
        runner.run(&node("n2"), &cmd, T).await.unwrap();
        assert_eq!(runner.vxvm_snapshots("vxdg1"), vec!["L_fs1_"]);
    }
}
