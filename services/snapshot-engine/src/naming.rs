//! Snapshot naming.
//!
//! Snapshot names are derived, never stored: the same volume and tag always
//! produce the same name. Deployment snapshots end with a bare `_`, which no
//! tagged name can match because tags are never empty.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::inventory::{Driver, Volume, VolumeInventory, ROOT_VOLUME_GROUP};
use crate::runner::{LvmSnapshot, SnapshotSize, VxvmSnapshot};

/// Prefix shared by every snapshot volume.
pub const SNAPSHOT_PREFIX: &str = "L_";

/// Longest device path LVM accepts for a snapshot volume.
pub const MAX_SNAPSHOT_NAME_LEN: usize = 122;

/// Record key of the deployment snapshot; not usable as a tag.
pub const DEPLOYMENT_SNAPSHOT: &str = "snapshot";

/// Installer volume with the longest identifier on the root disk.
const LONGEST_KICKSTART_VOLUME: usize = ROOT_VOLUME_GROUP.len() + "lv_var_lib_puppetdb".len();

/// A user-supplied snapshot name tag.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SnapshotTag(String);

impl SnapshotTag {
    /// Validates the tag's characters. Length is checked against a model
    /// with [`validate_tag_length`].
    pub fn parse(s: &str) -> EngineResult<Self> {
        if s.is_empty() {
            return Err(EngineError::validation("Snapshot name tag cannot be empty"));
        }
        if s == DEPLOYMENT_SNAPSHOT {
            return Err(EngineError::validation(format!(
                "Snapshot name tag \"{DEPLOYMENT_SNAPSHOT}\" is reserved"
            )));
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
        {
            return Err(EngineError::validation(format!(
                "Invalid snapshot name tag \"{s}\": only letters, digits, '_' and '-' are allowed"
            )));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SnapshotTag {
    type Error = EngineError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<SnapshotTag> for String {
    fn from(tag: SnapshotTag) -> Self {
        tag.0
    }
}

/// Key of the persisted record for a tag.
pub fn record_key(tag: Option<&SnapshotTag>) -> &str {
    tag.map_or(DEPLOYMENT_SNAPSHOT, SnapshotTag::as_str)
}

/// Derives the snapshot volume name for a volume.
pub fn compute_name(volume: &Volume, tag: Option<&SnapshotTag>) -> String {
    let tag = tag.map_or("", SnapshotTag::as_str);
    match volume.driver {
        Driver::Vxvm => format!("{SNAPSHOT_PREFIX}{}_{tag}", volume.file_system_id),
        Driver::Lvm if volume.root_vg => format!("{SNAPSHOT_PREFIX}{}_{tag}", volume.volume_name),
        Driver::Lvm => format!(
            "{SNAPSHOT_PREFIX}{}_{}_{tag}",
            volume.volume_group_id, volume.file_system_id
        ),
    }
}

/// Copy-on-write reservation for a volume's snapshot.
pub fn snapshot_size(volume: &Volume, tag: Option<&SnapshotTag>) -> SnapshotSize {
    let percent = volume.effective_snap_percent(tag);
    match volume.size {
        Some(size) => SnapshotSize::Mib(size.percent(percent).mib().max(1)),
        None => SnapshotSize::PercentOfOrigin(percent),
    }
}

/// The LVM snapshot volume for `volume`.
pub fn lvm_snapshot(volume: &Volume, tag: Option<&SnapshotTag>) -> LvmSnapshot {
    LvmSnapshot {
        volume_group: volume.volume_group_name.clone(),
        origin: volume.volume_name.clone(),
        name: compute_name(volume, tag),
    }
}

/// The VxVM snapshot volume for `volume`.
pub fn vxvm_snapshot(volume: &Volume, tag: Option<&SnapshotTag>) -> VxvmSnapshot {
    VxvmSnapshot {
        disk_group: volume.volume_group_name.clone(),
        volume: volume.volume_name.clone(),
        name: compute_name(volume, tag),
    }
}

/// Longest tag that keeps every LVM snapshot path within the limit.
pub fn max_tag_len(inventory: &VolumeInventory) -> usize {
    let longest = inventory
        .volumes()
        .iter()
        .filter(|v| v.driver == Driver::Lvm)
        .map(|v| {
            let vg_id = if v.modeled {
                v.volume_group_id.len()
            } else {
                0
            };
            v.volume_group_name.len() + vg_id + v.volume_name.len()
        })
        .max()
        .unwrap_or_default()
        .max(LONGEST_KICKSTART_VOLUME);

    // identifier separators plus the device path separator and prefix
    MAX_SNAPSHOT_NAME_LEN.saturating_sub(2 + longest + 2)
}

/// Rejects tags that would push a snapshot name past the LVM limit.
pub fn validate_tag_length(inventory: &VolumeInventory, tag: &SnapshotTag) -> EngineResult<()> {
    let max = max_tag_len(inventory);
    if tag.as_str().len() > max {
        return Err(EngineError::validation(format!(
            "Create snapshot failed: Snapshot name tag cannot exceed {max} characters \
             which is the maximum available length for an ext4 or xfs file system."
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use volsnap_model::Model;

    const MODEL: &str = r#"
[management_server]
hostname = "ms1"

[[clusters]]
id = "c1"

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

[[clusters.volume_groups]]
id = "dg1"
volume_group_name = "vxdg1"

[[clusters.volume_groups.file_systems]]
id = "shared"
type = "vxfs"
mount_point = "/shared"
size = "2G"
"#;

    fn inventory() -> VolumeInventory {
        VolumeInventory::from_model(&Model::from_toml_str(MODEL).unwrap())
    }

    fn volume<'a>(inv: &'a VolumeInventory, lv: &str) -> &'a Volume {
        inv.volumes().iter().find(|v| v.volume_name == lv).unwrap()
    }

    #[test]
    fn test_names_per_driver() {
        let inv = inventory();
        let tag = SnapshotTag::parse("ombs").unwrap();

        let data = volume(&inv, "vg1_data");
        assert_eq!(compute_name(data, None), "L_vg1_data_");
        assert_eq!(compute_name(data, Some(&tag)), "L_vg1_data_ombs");

        let root = volume(&inv, "lv_root");
        assert_eq!(compute_name(root, None), "L_lv_root_");

        let shared = volume(&inv, "shared");
        assert_eq!(compute_name(shared, Some(&tag)), "L_shared_ombs");
    }

    #[test]
    fn test_sizes() {
        let inv = inventory();
        assert_eq!(
            snapshot_size(volume(&inv, "vg1_data"), None),
            SnapshotSize::Mib(2048)
        );
        assert_eq!(
            snapshot_size(volume(&inv, "lv_home"), None),
            SnapshotSize::PercentOfOrigin(100)
        );
    }

    #[test]
    fn test_tag_charset_and_reserved() {
        assert!(SnapshotTag::parse("backup-1_a").is_ok());
        assert!(SnapshotTag::parse("").is_err());
        assert!(SnapshotTag::parse("snapshot").is_err());
        assert!(SnapshotTag::parse("a/b").is_err());
        assert!(SnapshotTag::parse("a b").is_err());
    }

    #[test]
    fn test_max_tag_length_boundary() {
        let inv = inventory();
        let max = max_tag_len(&inv);
        // "vg_root" + "lv_var_lib_puppetdb" is the longest identifier here
        assert_eq!(max, 122 - (2 + 26 + 2));

        let fits = SnapshotTag::parse(&"n".repeat(max)).unwrap();
        assert!(validate_tag_length(&inv, &fits).is_ok());

        let long = SnapshotTag::parse(&"n".repeat(max + 1)).unwrap();
        let err = validate_tag_length(&inv, &long).unwrap_err();
        assert_eq!(err.error_type(), "ValidationError");
        assert_eq!(
            err.to_string(),
            format!(
                "Create snapshot failed: Snapshot name tag cannot exceed {max} characters \
                 which is the maximum available length for an ext4 or xfs file system."
            )
        );
    }

    #[test]
    fn test_long_modelled_volume_shrinks_tag_budget() {
        let model = MODEL.replace("id = \"data\"", &format!("id = \"{}\"", "d".repeat(40)));
        let inv = VolumeInventory::from_model(&Model::from_toml_str(&model).unwrap());
        // "vg_app" + "vg1" + "vg1_" + 40
        assert_eq!(max_tag_len(&inv), 122 - (2 + 6 + 3 + 44 + 2));
    }

    proptest! {
        #[test]
        fn prop_names_deterministic_and_distinct(tag in "[A-Za-z0-9_-]{1,20}") {
            prop_assume!(tag != DEPLOYMENT_SNAPSHOT);
            let inv = inventory();
            let tag = SnapshotTag::parse(&tag).unwrap();
            for v in inv.volumes() {
                let anonymous = compute_name(v, None);
                prop_assert_eq!(&anonymous, &compute_name(v, None));
                prop_assert!(anonymous.ends_with('_'));
                prop_assert_ne!(anonymous, compute_name(v, Some(&tag)));
                prop_assert_eq!(compute_name(v, Some(&tag)), compute_name(v, Some(&tag)));
            }
        }
    }
}
