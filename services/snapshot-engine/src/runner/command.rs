//! Storage commands and their command-line rendering.

use serde::{Deserialize, Serialize};

/// An LVM snapshot logical volume.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LvmSnapshot {
    /// Volume group name on the node.
    pub volume_group: String,
    /// Origin logical volume.
    pub origin: String,
    /// Snapshot logical volume name.
    pub name: String,
}

impl LvmSnapshot {
    /// Device path of the snapshot volume.
    pub fn device_path(&self) -> String {
        format!("/dev/{}/{}", self.volume_group, self.name)
    }

    /// Device path of the origin volume.
    pub fn origin_path(&self) -> String {
        format!("/dev/{}/{}", self.volume_group, self.origin)
    }
}

impl std::fmt::Display for LvmSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.volume_group, self.name)
    }
}

/// A VxVM space-optimised snapshot volume.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VxvmSnapshot {
    pub disk_group: String,
    /// Origin volume.
    pub volume: String,
    /// Snapshot volume name.
    pub name: String,
}

impl VxvmSnapshot {
    /// Name of the cache object backing the snapshot.
    pub fn cache_object(&self) -> String {
        format!("{}_co", self.name)
    }
}

impl std::fmt::Display for VxvmSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.disk_group, self.name)
    }
}

/// Copy-on-write space reserved for a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotSize {
    /// An absolute size in mebibytes.
    Mib(u64),
    /// A percentage of the origin volume, resolved on the node.
    PercentOfOrigin(u8),
}

impl std::fmt::Display for SnapshotSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotSize::Mib(mib) => write!(f, "{mib}M"),
            SnapshotSize::PercentOfOrigin(pct) => write!(f, "{pct}%ORIGIN"),
        }
    }
}

/// An operation the engine asks a node to perform.
///
/// Commands are typed so that callers never build shell strings; transports
/// render them with [`StorageCommand::argv`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum StorageCommand {
    /// Does nothing; succeeds iff the node answers.
    Ping,
    CreateLvmSnapshot {
        snapshot: LvmSnapshot,
        size: SnapshotSize,
    },
    RemoveLvmSnapshot {
        snapshot: LvmSnapshot,
    },
    /// Succeeds iff the snapshot exists and is neither invalid nor merging.
    InspectLvmSnapshot {
        snapshot: LvmSnapshot,
    },
    MergeLvmSnapshot {
        snapshot: LvmSnapshot,
    },
    CreateVxvmSnapshot {
        snapshot: VxvmSnapshot,
        cache_mib: u64,
    },
    RemoveVxvmSnapshot {
        snapshot: VxvmSnapshot,
    },
    /// Succeeds iff the snapshot exists and is not detached or invalid.
    InspectVxvmSnapshot {
        snapshot: VxvmSnapshot,
    },
    RestoreVxvmSnapshot {
        snapshot: VxvmSnapshot,
    },
    /// Succeeds iff the disk group is imported on the node.
    DiskGroupImported {
        disk_group: String,
    },
    StopClusterServices,
    Reboot,
}

impl StorageCommand {
    /// Whether the command needs root on the target node.
    pub fn requires_root(&self) -> bool {
        !matches!(self, StorageCommand::Ping)
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            StorageCommand::Ping => "ping",
            StorageCommand::CreateLvmSnapshot { .. } => "create_lvm_snapshot",
            StorageCommand::RemoveLvmSnapshot { .. } => "remove_lvm_snapshot",
            StorageCommand::InspectLvmSnapshot { .. } => "inspect_lvm_snapshot",
            StorageCommand::MergeLvmSnapshot { .. } => "merge_lvm_snapshot",
            StorageCommand::CreateVxvmSnapshot { .. } => "create_vxvm_snapshot",
            StorageCommand::RemoveVxvmSnapshot { .. } => "remove_vxvm_snapshot",
            StorageCommand::InspectVxvmSnapshot { .. } => "inspect_vxvm_snapshot",
            StorageCommand::RestoreVxvmSnapshot { .. } => "restore_vxvm_snapshot",
            StorageCommand::DiskGroupImported { .. } => "disk_group_imported",
            StorageCommand::StopClusterServices => "stop_cluster_services",
            StorageCommand::Reboot => "reboot",
        }
    }

    /// Renders the command as an argument vector for the target node.
    pub fn argv(&self) -> Vec<String> {
        match self {
            StorageCommand::Ping => vec!["true".into()],
            StorageCommand::CreateLvmSnapshot { snapshot, size } => {
                let (flag, amount) = match size {
                    SnapshotSize::Mib(mib) => ("-L", format!("{mib}M")),
                    SnapshotSize::PercentOfOrigin(pct) => ("-l", format!("{pct}%ORIGIN")),
                };
                vec![
                    "lvcreate".into(),
                    "--snapshot".into(),
                    "--name".into(),
                    snapshot.name.clone(),
                    flag.into(),
                    amount,
                    snapshot.origin_path(),
                ]
            }
            StorageCommand::RemoveLvmSnapshot { snapshot } => {
                vec!["lvremove".into(), "-f".into(), snapshot.device_path()]
            }
            StorageCommand::InspectLvmSnapshot { snapshot } => vec![
                "lvs".into(),
                "--noheadings".into(),
                "--separator".into(),
                ",".into(),
                "-o".into(),
                "lv_attr,lv_merging,snap_invalid".into(),
                snapshot.to_string(),
            ],
            StorageCommand::MergeLvmSnapshot { snapshot } => vec![
                "lvconvert".into(),
                "--merge".into(),
                snapshot.device_path(),
            ],
            StorageCommand::CreateVxvmSnapshot {
                snapshot,
                cache_mib,
            } => vec![
                "vxsnap".into(),
                "-g".into(),
                snapshot.disk_group.clone(),
                "make".into(),
                format!(
                    "source={}/newvol={}/cache={}/cachesize={}m",
                    snapshot.volume,
                    snapshot.name,
                    snapshot.cache_object(),
                    cache_mib
                ),
            ],
            StorageCommand::RemoveVxvmSnapshot { snapshot } => vec![
                "vxedit".into(),
                "-g".into(),
                snapshot.disk_group.clone(),
                "-rf".into(),
                "rm".into(),
                snapshot.name.clone(),
                snapshot.cache_object(),
            ],
            StorageCommand::InspectVxvmSnapshot { snapshot } => vec![
                "vxsnap".into(),
                "-g".into(),
                snapshot.disk_group.clone(),
                "print".into(),
                snapshot.name.clone(),
            ],
            StorageCommand::RestoreVxvmSnapshot { snapshot } => vec![
                "vxsnap".into(),
                "-g".into(),
                snapshot.disk_group.clone(),
                "restore".into(),
                snapshot.volume.clone(),
                format!("source={}", snapshot.name),
            ],
            StorageCommand::DiskGroupImported { disk_group } => {
                vec!["vxdg".into(), "list".into(), disk_group.clone()]
            }
            StorageCommand::StopClusterServices => vec!["hastop".into(), "-all".into()],
            // Delayed so the caller can record the outcome before the node goes down.
            StorageCommand::Reboot => vec!["shutdown".into(), "-r".into(), "+1".into()],
        }
    }
}

/// Joins an argument vector into a single POSIX shell command line.
pub fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=%+,:@".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
