//! Model item definitions, loading and validation.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use volsnap_id::{ClusterId, FileSystemId, NodeId, VolumeGroupId};

use crate::{ModelError, ModelResult, Size};

/// Default `snap_size` for modelled file systems.
pub const DEFAULT_SNAP_SIZE: u8 = 100;

fn default_snap_size() -> u8 {
    DEFAULT_SNAP_SIZE
}

/// File system type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsType {
    Ext4,
    Xfs,
    Vxfs,
    Swap,
}

impl std::fmt::Display for FsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FsType::Ext4 => write!(f, "ext4"),
            FsType::Xfs => write!(f, "xfs"),
            FsType::Vxfs => write!(f, "vxfs"),
            FsType::Swap => write!(f, "swap"),
        }
    }
}

/// A file system (logical volume) inside a volume group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSystemSpec {
    pub id: FileSystemId,
    #[serde(rename = "type")]
    pub fs_type: FsType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<String>,
    pub size: Size,
    /// Percentage of `size` reserved for the deployment snapshot.
    #[serde(default = "default_snap_size")]
    pub snap_size: u8,
    /// Percentage reserved for named snapshots; falls back to `snap_size`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_snap_size: Option<u8>,
    /// Reachability of the owning node is guaranteed by an external mechanism.
    #[serde(default)]
    pub snap_external: bool,
}

/// A volume group: LVM when owned by a node, a VxVM disk group when owned by
/// a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeGroupSpec {
    pub id: VolumeGroupId,
    pub volume_group_name: String,
    #[serde(default)]
    pub file_systems: Vec<FileSystemSpec>,
}

/// A node: the management server or a cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub hostname: NodeId,
    #[serde(default)]
    pub volume_groups: Vec<VolumeGroupSpec>,
}

/// A cluster of peer nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub id: ClusterId,
    /// Clusters that must be back online before this one restarts.
    #[serde(default)]
    pub dependency_list: Vec<ClusterId>,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    /// Shared VxVM disk groups.
    #[serde(default)]
    pub volume_groups: Vec<VolumeGroupSpec>,
}

impl ClusterSpec {
    /// Returns the hostnames of the member nodes in declaration order.
    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.iter().map(|n| &n.hostname)
    }
}

/// An immutable snapshot of the deployment model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub management_server: NodeSpec,
    #[serde(default)]
    pub clusters: Vec<ClusterSpec>,
}

impl Model {
    /// Parses and validates a model from TOML.
    pub fn from_toml_str(contents: &str) -> ModelResult<Self> {
        let model: Model = toml::from_str(contents)?;
        model.validate()?;
        Ok(model)
    }

    /// Reads, parses and validates a model file.
    pub fn load(path: &Path) -> ModelResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Returns the management server hostname.
    pub fn management_server_id(&self) -> &NodeId {
        &self.management_server.hostname
    }

    /// Returns true if `node` is the management server.
    pub fn is_management_server(&self, node: &NodeId) -> bool {
        &self.management_server.hostname == node
    }

    /// Iterates over every peer node together with its cluster.
    pub fn peer_nodes(&self) -> impl Iterator<Item = (&ClusterSpec, &NodeSpec)> {
        self.clusters
            .iter()
            .flat_map(|c| c.nodes.iter().map(move |n| (c, n)))
    }

    /// Returns every node hostname, management server first.
    pub fn node_ids(&self) -> Vec<NodeId> {
        std::iter::once(self.management_server.hostname.clone())
            .chain(self.peer_nodes().map(|(_, n)| n.hostname.clone()))
            .collect()
    }

    /// Looks up a node by hostname.
    pub fn node(&self, hostname: &str) -> Option<&NodeSpec> {
        if self.management_server.hostname.as_str() == hostname {
            return Some(&self.management_server);
        }
        self.peer_nodes()
            .map(|(_, n)| n)
            .find(|n| n.hostname.as_str() == hostname)
    }

    /// Looks up a cluster by id.
    pub fn cluster(&self, id: &str) -> Option<&ClusterSpec> {
        self.clusters.iter().find(|c| c.id.as_str() == id)
    }

    /// Returns the cluster a peer node belongs to.
    pub fn cluster_of(&self, node: &NodeId) -> Option<&ClusterSpec> {
        self.clusters
            .iter()
            .find(|c| c.nodes.iter().any(|n| &n.hostname == node))
    }

    /// Content hash of the model, stable across TOML formatting.
    pub fn fingerprint(&self) -> String {
        // Serializing a validated model into a Vec cannot fail.
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        format!("sha256:{:x}", hasher.finalize())
    }

    /// Checks structural rules that the schema alone cannot express.
    pub fn validate(&self) -> ModelResult<()> {
        let mut errors = Vec::new();

        let mut hostnames = BTreeSet::new();
        for node in std::iter::once(&self.management_server)
            .chain(self.peer_nodes().map(|(_, n)| n))
        {
            if !hostnames.insert(node.hostname.as_str()) {
                errors.push(format!("duplicate node hostname \"{}\"", node.hostname));
            }
            let owner = format!("node \"{}\"", node.hostname);
            validate_volume_groups(&owner, &node.volume_groups, false, &mut errors);
        }

        let cluster_ids: BTreeSet<&str> = self.clusters.iter().map(|c| c.id.as_str()).collect();
        if cluster_ids.len() != self.clusters.len() {
            errors.push("cluster ids must be unique".to_string());
        }

        for cluster in &self.clusters {
            for dep in &cluster.dependency_list {
                if !cluster_ids.contains(dep.as_str()) {
                    errors.push(format!(
                        "cluster \"{}\" depends on unknown cluster \"{}\"",
                        cluster.id, dep
                    ));
                }
            }
            let owner = format!("cluster \"{}\"", cluster.id);
            validate_volume_groups(&owner, &cluster.volume_groups, true, &mut errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ModelError::Validation(errors))
        }
    }
}

fn validate_volume_groups(
    owner: &str,
    groups: &[VolumeGroupSpec],
    shared: bool,
    errors: &mut Vec<String>,
) {
    let mut vg_ids = BTreeSet::new();
    for vg in groups {
        if !vg_ids.insert(vg.id.as_str()) {
            errors.push(format!("{owner}: duplicate volume group id \"{}\"", vg.id));
        }
        if vg.volume_group_name.is_empty()
            || !vg
                .volume_group_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '+'))
        {
            errors.push(format!(
                "{owner}: invalid volume_group_name \"{}\"",
                vg.volume_group_name
            ));
        }

        let mut fs_ids = BTreeSet::new();
        for fs in &vg.file_systems {
            let item = format!("{owner}: file system \"{}\" in \"{}\"", fs.id, vg.id);
            if !fs_ids.insert(fs.id.as_str()) {
                errors.push(format!("{item} is declared twice"));
            }
            if fs.snap_size > 100 {
                errors.push(format!("{item}: snap_size must be between 0 and 100"));
            }
            if fs.backup_snap_size.is_some_and(|p| p > 100) {
                errors.push(format!("{item}: backup_snap_size must be between 0 and 100"));
            }
            match (shared, fs.fs_type) {
                (true, FsType::Vxfs) | (false, FsType::Ext4 | FsType::Xfs | FsType::Swap) => {}
                (true, other) => errors.push(format!(
                    "{item}: type \"{other}\" is not supported on a VxVM disk group"
                )),
                (false, other) => errors.push(format!(
                    "{item}: type \"{other}\" is not supported on an LVM volume group"
                )),
            }
            if let Some(mount) = &fs.mount_point {
                if !mount.starts_with('/') {
                    errors.push(format!("{item}: mount_point must be absolute"));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[management_server]
hostname = "ms1"

[[clusters]]
id = "c1"
dependency_list = ["c2"]

[[clusters.nodes]]
hostname = "node1"

[[clusters.nodes.volume_groups]]
id = "vg1"
volume_group_name = "vg_app"

[[clusters.nodes.volume_groups.file_systems]]
id = "data"
type = "ext4"
mount_point = "/data"
size = "10G"
snap_size = 20
backup_snap_size = 30

[[clusters.volume_groups]]
id = "dg1"
volume_group_name = "vxdg1"

[[clusters.volume_groups.file_systems]]
id = "shared"
type = "vxfs"
mount_point = "/shared"
size = "2G"

[[clusters]]
id = "c2"

[[clusters.nodes]]
hostname = "node2"
"#;

    #[test]
    fn test_parse_sample_model() {
        let model = Model::from_toml_str(SAMPLE).unwrap();

        assert_eq!(model.management_server_id().as_str(), "ms1");
        assert_eq!(model.clusters.len(), 2);
        assert!(model.cluster("c2").unwrap().dependency_list.is_empty());

        let fs = &model.clusters[0].nodes[0].volume_groups[0].file_systems[0];
        assert_eq!(fs.size.mib(), 10 * 1024);
        assert_eq!(fs.backup_snap_size, Some(30));
        assert!(!fs.snap_external);

        let shared = &model.clusters[0].volume_groups[0].file_systems[0];
        assert_eq!(shared.snap_size, DEFAULT_SNAP_SIZE);
    }

    #[test]
    fn test_node_lookup() {
        let model = Model::from_toml_str(SAMPLE).unwrap();

        assert!(model.node("ms1").is_some());
        assert!(model.node("node2").is_some());
        assert!(model.node("node9").is_none());

        let node2 = NodeId::parse("node2").unwrap();
        assert_eq!(model.cluster_of(&node2).unwrap().id.as_str(), "c2");
        assert_eq!(model.node_ids().len(), 3);
        assert!(model.is_management_server(model.management_server_id()));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let toml = SAMPLE.replace("dependency_list = [\"c2\"]", "dependency_list = [\"c9\"]");
        let err = Model::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("unknown cluster \"c9\""));
    }

    #[test]
    fn test_wrong_fs_type_for_driver_rejected() {
        let toml = SAMPLE.replace("type = \"vxfs\"", "type = \"ext4\"");
        let err = Model::from_toml_str(&toml).unwrap_err();
        assert!(matches!(err, ModelError::Validation(_)));
        assert!(err.to_string().contains("VxVM disk group"));
    }

    #[test]
    fn test_snap_size_out_of_range_rejected() {
        let toml = SAMPLE.replace("snap_size = 20", "snap_size = 120");
        let err = Model::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("snap_size must be between 0 and 100"));
    }

    #[test]
    fn test_duplicate_hostname_rejected() {
        let toml = SAMPLE.replace("hostname = \"node2\"", "hostname = \"node1\"");
        let err = Model::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("duplicate node hostname"));
    }

    #[test]
    fn test_fingerprint_ignores_formatting() {
        let a = Model::from_toml_str(SAMPLE).unwrap();
        let b = Model::from_toml_str(&SAMPLE.replace(" = ", "=")).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert!(a.fingerprint().starts_with("sha256:"));
    }
}
