//! Volume inventory.
//!
//! Flattens the model into typed [`Volume`] records, one per file system:
//! - LVM logical volumes owned by a node (management server or peer)
//! - VxVM volumes in disk groups shared by a cluster
//! - The management server's installer-created root volumes, which exist on
//!   disk whether or not the model declares them
//!
//! Inventory construction is a pure read of the model. Eligibility for a
//! particular snapshot operation is decided by [`Volume::is_snapshot_eligible`].

use volsnap_id::{ClusterId, FileSystemId, NodeId, VolumeGroupId};
use volsnap_model::{FileSystemSpec, FsType, Model, Size, VolumeGroupSpec};

use crate::naming::SnapshotTag;

/// Volume group name the installer gives the management server's root disk.
pub const ROOT_VOLUME_GROUP: &str = "vg_root";

/// Storage driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Driver {
    Lvm,
    Vxvm,
}

impl std::fmt::Display for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Driver::Lvm => write!(f, "LVM"),
            Driver::Vxvm => write!(f, "VxVM"),
        }
    }
}

/// Who owns a volume.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Owner {
    /// An LVM volume on a single node.
    Node(NodeId),
    /// A VxVM volume in a disk group shared by the cluster's nodes.
    Cluster(ClusterId),
}

/// A kickstart volume: created by the OS installer on the management server.
struct KickstartVolume {
    file_system: &'static str,
    mount_point: Option<&'static str>,
    lv_name: &'static str,
    fs_type: FsType,
    snapshot_by_default: bool,
}

const KICKSTART_VOLUMES: &[KickstartVolume] = &[
    KickstartVolume {
        file_system: "root",
        mount_point: Some("/"),
        lv_name: "lv_root",
        fs_type: FsType::Ext4,
        snapshot_by_default: true,
    },
    KickstartVolume {
        file_system: "home",
        mount_point: Some("/home"),
        lv_name: "lv_home",
        fs_type: FsType::Ext4,
        snapshot_by_default: true,
    },
    KickstartVolume {
        file_system: "var",
        mount_point: Some("/var"),
        lv_name: "lv_var",
        fs_type: FsType::Ext4,
        snapshot_by_default: true,
    },
    KickstartVolume {
        file_system: "var_log",
        mount_point: Some("/var/log"),
        lv_name: "lv_var_log",
        fs_type: FsType::Ext4,
        snapshot_by_default: false,
    },
    KickstartVolume {
        file_system: "var_www",
        mount_point: Some("/var/www"),
        lv_name: "lv_var_www",
        fs_type: FsType::Ext4,
        snapshot_by_default: false,
    },
    KickstartVolume {
        file_system: "var_lib_puppetdb",
        mount_point: Some("/var/lib/puppetdb"),
        lv_name: "lv_var_lib_puppetdb",
        fs_type: FsType::Ext4,
        snapshot_by_default: false,
    },
    KickstartVolume {
        file_system: "software",
        mount_point: Some("/software"),
        lv_name: "lv_software",
        fs_type: FsType::Ext4,
        snapshot_by_default: false,
    },
    KickstartVolume {
        file_system: "swap",
        mount_point: None,
        lv_name: "lv_swap",
        fs_type: FsType::Swap,
        snapshot_by_default: false,
    },
];

/// Returns the installer LV name for a root-disk mount point, if it has one.
pub fn kickstart_lv_name(mount_point: &str) -> Option<&'static str> {
    KICKSTART_VOLUMES
        .iter()
        .find(|k| k.mount_point == Some(mount_point))
        .map(|k| k.lv_name)
}

/// A storage volume eligible to be considered for snapshotting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub driver: Driver,
    pub owner: Owner,
    pub volume_group_id: VolumeGroupId,
    /// Volume group (LVM) or disk group (VxVM) name on the node.
    pub volume_group_name: String,
    pub file_system_id: FileSystemId,
    /// Logical volume name on the node.
    pub volume_name: String,
    pub mount_point: Option<String>,
    /// Unknown for root volumes the model does not declare.
    pub size: Option<Size>,
    pub snap_size: u8,
    pub backup_snap_size: Option<u8>,
    pub snap_external: bool,
    pub fs_type: FsType,
    /// Lives in the management server's root volume group.
    pub root_vg: bool,
    /// Declared in the model rather than inferred from the installer layout.
    pub modeled: bool,
}

impl Volume {
    /// Percentage of the origin reserved for a snapshot with this tag.
    pub fn effective_snap_percent(&self, tag: Option<&SnapshotTag>) -> u8 {
        match (tag, self.backup_snap_size) {
            (Some(_), Some(backup)) => backup,
            _ => self.snap_size,
        }
    }

    /// Whether a snapshot with this tag covers the volume.
    pub fn is_snapshot_eligible(&self, tag: Option<&SnapshotTag>) -> bool {
        self.fs_type != FsType::Swap && self.effective_snap_percent(tag) > 0
    }

    /// Owning node for LVM volumes.
    pub fn node(&self) -> Option<&NodeId> {
        match &self.owner {
            Owner::Node(node) => Some(node),
            Owner::Cluster(_) => None,
        }
    }

    /// Owning cluster for VxVM volumes.
    pub fn cluster(&self) -> Option<&ClusterId> {
        match &self.owner {
            Owner::Cluster(cluster) => Some(cluster),
            Owner::Node(_) => None,
        }
    }
}

/// Which part of the deployment to list.
#[derive(Debug, Clone, Copy)]
pub enum Scope<'a> {
    All,
    Node(&'a NodeId),
    Cluster(&'a ClusterId),
}

/// Every volume in a model.
#[derive(Debug, Clone, Default)]
pub struct VolumeInventory {
    volumes: Vec<Volume>,
}

impl VolumeInventory {
    /// Builds the inventory for a model.
    pub fn from_model(model: &Model) -> Self {
        let mut volumes = Vec::new();

        let ms = &model.management_server;
        let root_vg = ms
            .volume_groups
            .iter()
            .find(|vg| vg.volume_group_name == ROOT_VOLUME_GROUP);
        for vg in &ms.volume_groups {
            let is_root = root_vg.is_some_and(|r| r.id == vg.id);
            push_group(&mut volumes, Owner::Node(ms.hostname.clone()), vg, Driver::Lvm, is_root);
        }
        push_kickstart(&mut volumes, &ms.hostname, root_vg);

        for cluster in &model.clusters {
            for node in &cluster.nodes {
                for vg in &node.volume_groups {
                    let owner = Owner::Node(node.hostname.clone());
                    push_group(&mut volumes, owner, vg, Driver::Lvm, false);
                }
            }
            for dg in &cluster.volume_groups {
                let owner = Owner::Cluster(cluster.id.clone());
                push_group(&mut volumes, owner, dg, Driver::Vxvm, false);
            }
        }

        Self { volumes }
    }

    /// All volumes, in model order.
    pub fn volumes(&self) -> &[Volume] {
        &self.volumes
    }

    /// Lists volumes by driver and scope, including non-eligible ones.
    pub fn list_volumes(&self, driver: Option<Driver>, scope: Scope<'_>) -> Vec<&Volume> {
        self.volumes
            .iter()
            .filter(|v| driver.is_none_or(|d| v.driver == d))
            .filter(|v| match scope {
                Scope::All => true,
                Scope::Node(node) => v.node() == Some(node),
                Scope::Cluster(cluster) => v.cluster() == Some(cluster),
            })
            .collect()
    }

    /// Volumes covered by a snapshot with the given tag.
    pub fn snapshot_volumes(&self, tag: Option<&SnapshotTag>) -> Vec<&Volume> {
        self.volumes
            .iter()
            .filter(|v| v.is_snapshot_eligible(tag))
            .collect()
    }
}

fn push_group(
    volumes: &mut Vec<Volume>,
    owner: Owner,
    vg: &VolumeGroupSpec,
    driver: Driver,
    root_vg: bool,
) {
    for fs in &vg.file_systems {
        let volume_name = lv_name(vg, fs, driver, root_vg);
        volumes.push(Volume {
            driver,
            owner: owner.clone(),
            volume_group_id: vg.id.clone(),
            volume_group_name: vg.volume_group_name.clone(),
            file_system_id: fs.id.clone(),
            volume_name,
            mount_point: fs.mount_point.clone(),
            size: Some(fs.size),
            snap_size: fs.snap_size,
            backup_snap_size: fs.backup_snap_size,
            snap_external: fs.snap_external,
            fs_type: fs.fs_type,
            root_vg,
            modeled: true,
        });
    }
}

fn lv_name(vg: &VolumeGroupSpec, fs: &FileSystemSpec, driver: Driver, root_vg: bool) -> String {
    match driver {
        Driver::Vxvm => fs.id.to_string(),
        Driver::Lvm => {
            let kickstart = if root_vg {
                match (&fs.mount_point, fs.fs_type) {
                    (Some(mount), _) => kickstart_lv_name(mount),
                    (None, FsType::Swap) => Some("lv_swap"),
                    (None, _) => None,
                }
            } else {
                None
            };
            kickstart
                .map(str::to_string)
                .unwrap_or_else(|| format!("{}_{}", vg.id, fs.id))
        }
    }
}

/// Adds installer volumes the model does not already declare.
fn push_kickstart(volumes: &mut Vec<Volume>, ms: &NodeId, root_vg: Option<&VolumeGroupSpec>) {
    let vg_id = match root_vg {
        Some(vg) => vg.id.clone(),
        None => match VolumeGroupId::parse(ROOT_VOLUME_GROUP) {
            Ok(id) => id,
            Err(_) => return,
        },
    };

    for ks in KICKSTART_VOLUMES {
        let declared = volumes.iter().any(|v| {
            v.root_vg
                && (v.volume_name == ks.lv_name
                    || (ks.mount_point.is_some() && v.mount_point.as_deref() == ks.mount_point))
        });
        if declared {
            continue;
        }
        let Ok(file_system_id) = FileSystemId::parse(ks.file_system) else {
            continue;
        };

        volumes.push(Volume {
            driver: Driver::Lvm,
            owner: Owner::Node(ms.clone()),
            volume_group_id: vg_id.clone(),
            volume_group_name: ROOT_VOLUME_GROUP.to_string(),
            file_system_id,
            volume_name: ks.lv_name.to_string(),
            mount_point: ks.mount_point.map(str::to_string),
            size: None,
            snap_size: if ks.snapshot_by_default { 100 } else { 0 },
            backup_snap_size: None,
            snap_external: false,
            fs_type: ks.fs_type,
            root_vg: true,
            modeled: false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODEL: &str = r#"
[management_server]
hostname = "ms1"

[[management_server.volume_groups]]
id = "vg1"
volume_group_name = "vg_root"

[[management_server.volume_groups.file_systems]]
id = "software"
type = "xfs"
mount_point = "/software"
size = "50G"
snap_size = 1

[[management_server.volume_groups.file_systems]]
id = "extra"
type = "ext4"
mount_point = "/extra"
size = "1G"

[[clusters]]
id = "c1"

[[clusters.nodes]]
hostname = "node1"

[[clusters.nodes.volume_groups]]
id = "vg1"
volume_group_name = "vg_app"

[[clusters.nodes.volume_groups.file_systems]]
id = "root"
type = "ext4"
mount_point = "/"
size = "10G"
snap_size = 50

[[clusters.nodes.volume_groups.file_systems]]
id = "swap"
type = "swap"
size = "2G"
snap_size = 0

[[clusters.volume_groups]]
id = "dg1"
volume_group_name = "vxdg1"

[[clusters.volume_groups.file_systems]]
id = "fs1"
type = "vxfs"
mount_point = "/shared"
size = "4G"
snap_size = 0
backup_snap_size = 20
"#;

    fn inventory() -> VolumeInventory {
        VolumeInventory::from_model(&Model::from_toml_str(MODEL).unwrap())
    }

    fn find<'a>(inv: &'a VolumeInventory, lv: &str) -> &'a Volume {
        inv.volumes()
            .iter()
            .find(|v| v.volume_name == lv)
            .unwrap_or_else(|| panic!("no volume {lv}"))
    }

    #[test]
    fn test_kickstart_volumes_merge_with_model() {
        let inv = inventory();

        let software = find(&inv, "lv_software");
        assert!(software.modeled);
        assert_eq!(software.snap_size, 1);

        let root = find(&inv, "lv_root");
        assert!(!root.modeled);
        assert!(root.size.is_none());
        assert_eq!(root.volume_group_id.as_str(), "vg1");

        assert_eq!(find(&inv, "vg1_extra").mount_point.as_deref(), Some("/extra"));

        let on_root_vg = inv
            .volumes()
            .iter()
            .filter(|v| v.root_vg && v.mount_point.as_deref() == Some("/software"))
            .count();
        assert_eq!(on_root_vg, 1);
    }

    #[test]
    fn test_unmodelled_root_volumes_snapshot_by_default() {
        let inv = inventory();
        let eligible: Vec<_> = inv
            .snapshot_volumes(None)
            .into_iter()
            .filter(|v| !v.modeled)
            .map(|v| v.volume_name.as_str())
            .collect();
        assert_eq!(eligible, vec!["lv_root", "lv_home", "lv_var"]);
    }

    #[test]
    fn test_swap_and_zero_snap_size_excluded() {
        let inv = inventory();
        let node = NodeId::parse("node1").unwrap();

        let all = inv.list_volumes(Some(Driver::Lvm), Scope::Node(&node));
        assert_eq!(all.len(), 2);

        let eligible: Vec<_> = inv
            .snapshot_volumes(None)
            .into_iter()
            .filter(|v| v.node() == Some(&node))
            .collect();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].volume_name, "vg1_root");
    }

    #[test]
    fn test_backup_snap_size_applies_to_named_snapshots() {
        let inv = inventory();
        let fs1 = find(&inv, "fs1");
        let tag = SnapshotTag::parse("ombs").unwrap();

        assert_eq!(fs1.driver, Driver::Vxvm);
        assert!(!fs1.is_snapshot_eligible(None));
        assert!(fs1.is_snapshot_eligible(Some(&tag)));
        assert_eq!(fs1.effective_snap_percent(Some(&tag)), 20);
    }

    #[test]
    fn test_list_by_cluster_scope() {
        let inv = inventory();
        let c1 = ClusterId::parse("c1").unwrap();
        let vxvm = inv.list_volumes(None, Scope::Cluster(&c1));
        assert_eq!(vxvm.len(), 1);
        assert_eq!(vxvm[0].volume_group_name, "vxdg1");
    }

    #[test]
    fn test_root_vg_defaults_without_model() {
        let model = Model::from_toml_str("[management_server]\nhostname = \"ms1\"\n").unwrap();
        let inv = VolumeInventory::from_model(&model);
        assert_eq!(inv.volumes().len(), KICKSTART_VOLUMES.len());
        assert!(inv
            .volumes()
            .iter()
            .all(|v| v.volume_group_id.as_str() == ROOT_VOLUME_GROUP));
    }
}
