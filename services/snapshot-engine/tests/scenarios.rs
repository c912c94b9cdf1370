//! Plan generation scenarios.
//!
//! These tests exercise the generator end to end from a TOML model:
//! 1. Which volumes a snapshot set covers
//! 2. Exclusions and the tasks they suppress
//! 3. Cluster restart ordering in restore plans
//! 4. Reserved snapshot capacity

use std::collections::BTreeSet;

use chrono::Utc;
use proptest::prelude::*;
use rstest::rstest;
use volsnap_engine::naming::compute_name;
use volsnap_engine::plan::{Phase, TaskKind};
use volsnap_engine::resolver::order_clusters;
use volsnap_engine::runner::SnapshotSize;
use volsnap_engine::inventory::VolumeInventory;
use volsnap_engine::{
    generate_plan, LiveView, Plan, RecordState, SnapshotRecord, SnapshotRequest, SnapshotTag,
};
use volsnap_id::{ClusterId, NodeId, PlanId};
use volsnap_model::Model;

const FLEET: &str = r#"
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
id = "root"
type = "ext4"
mount_point = "/"
size = "10G"
snap_size = 20

[[clusters.nodes]]
hostname = "node2"

[[clusters.nodes.volume_groups]]
id = "vg1"
volume_group_name = "vg_app"

[[clusters.nodes.volume_groups.file_systems]]
id = "root"
type = "ext4"
mount_point = "/"
size = "10G"
snap_size = 20

[[clusters.volume_groups]]
id = "dg1"
volume_group_name = "vxdg1"

[[clusters.volume_groups.file_systems]]
id = "fs1"
type = "vxfs"
mount_point = "/shared"
size = "4G"
snap_size = 10

[[clusters]]
id = "c2"

[[clusters.nodes]]
hostname = "node3"

[[clusters.nodes.volume_groups]]
id = "vg1"
volume_group_name = "vg_app"

[[clusters.nodes.volume_groups.file_systems]]
id = "data"
type = "xfs"
mount_point = "/data"
size = "1G"

[[clusters.nodes]]
hostname = "node4"

[[clusters.nodes.volume_groups]]
id = "vg1"
volume_group_name = "vg_app"

[[clusters.nodes.volume_groups.file_systems]]
id = "data"
type = "xfs"
mount_point = "/data"
size = "1G"
"#;

const PEERS: [&str; 4] = ["node1", "node2", "node3", "node4"];

fn fleet() -> Model {
    Model::from_toml_str(FLEET).unwrap()
}

fn node(name: &str) -> NodeId {
    NodeId::parse(name).unwrap()
}

fn cluster(name: &str) -> ClusterId {
    ClusterId::parse(name).unwrap()
}

fn live() -> LiveView {
    LiveView::all_reachable().with_active_disk_group("vxdg1", node("node1"))
}

fn applied(model: &Model, tag: Option<&str>) -> SnapshotRecord {
    SnapshotRecord {
        key: tag.unwrap_or("snapshot").to_string(),
        tag: tag.map(|t| SnapshotTag::parse(t).unwrap()),
        state: RecordState::Applied,
        created_at: Utc::now(),
        timestamp: Some(Utc::now()),
        nodes: model.node_ids().into_iter().collect(),
        plan_id: PlanId::new(),
        model_fingerprint: model.fingerprint(),
    }
}

fn phase<'a>(plan: &'a Plan, description: &str) -> &'a Phase {
    plan.phases
        .iter()
        .find(|p| p.description == description)
        .unwrap_or_else(|| panic!("no phase \"{description}\""))
}

#[test]
fn test_zero_snap_size_and_swap_are_never_snapshotted() {
    let model = Model::from_toml_str(
        r#"
[management_server]
hostname = "ms1"

[[clusters]]
id = "c1"

[[clusters.nodes]]
hostname = "n1"

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
"#,
    )
    .unwrap();

    let plan = generate_plan(
        &model,
        &LiveView::all_reachable(),
        None,
        &SnapshotRequest::create(None),
    )
    .unwrap();

    let on_n1: Vec<_> = phase(&plan, "Create snapshots")
        .tasks
        .iter()
        .filter(|t| t.node.as_str() == "n1")
        .collect();
    assert_eq!(on_n1.len(), 1);
    assert!(on_n1[0].description.contains("vg1_root"));
    assert!(plan.tasks().all(|t| !t.description.contains("swap")));
}

#[test]
fn test_restart_order_follows_dependency_chain() {
    let order = order_clusters(&[
        (cluster("c1"), vec![cluster("c2")]),
        (cluster("c2"), vec![cluster("c3")]),
        (cluster("c3"), vec![]),
    ]);

    assert!(!order.is_degenerate());
    assert_eq!(order.sequence, vec![cluster("c3"), cluster("c2"), cluster("c1")]);
}

#[test]
fn test_restore_restarts_dependencies_first() {
    let model = fleet();
    let record = applied(&model, None);
    let plan = generate_plan(&model, &live(), Some(&record), &SnapshotRequest::restore()).unwrap();

    let restarts: Vec<&str> = plan
        .phases
        .iter()
        .map(|p| p.description.as_str())
        .filter(|d| d.starts_with("Restart"))
        .collect();
    assert_eq!(
        restarts,
        vec![
            "Restart nodes of cluster \"c2\"",
            "Restart nodes of cluster \"c1\"",
            "Restart management server",
        ]
    );
    assert!(plan.warnings.is_empty());
}

#[test]
fn test_excluded_node_absent_from_plan_output() {
    let model = fleet();
    let request = SnapshotRequest::create(None).exclude([node("node3")]);
    let plan = generate_plan(&model, &live(), None, &request).unwrap();

    let rendered = serde_json::to_string(&plan.phases).unwrap();
    assert!(!rendered.contains("node3"));
    assert!(!plan.touches_node(&node("node3")));
    assert!(plan.touches_node(&node("node4")));
}

#[rstest]
#[case::deployment(None)]
#[case::named(Some("ombs"))]
fn test_remove_without_record_is_do_nothing(#[case] tag: Option<&str>) {
    let model = fleet();
    let tag = tag.map(|t| SnapshotTag::parse(t).unwrap());

    let err = generate_plan(&model, &live(), None, &SnapshotRequest::remove(tag)).unwrap_err();
    assert_eq!(err.error_type(), "DoNothingPlanError");
}

#[rstest]
#[case::deployment(None, "")]
#[case::named(Some("ombs"), "ombs")]
fn test_snapshot_names_carry_tag(#[case] tag: Option<&str>, #[case] suffix: &str) {
    let model = fleet();
    let inventory = VolumeInventory::from_model(&model);
    let tag = tag.map(|t| SnapshotTag::parse(t).unwrap());

    for volume in inventory.volumes() {
        let name = compute_name(volume, tag.as_ref());
        assert_eq!(name, compute_name(volume, tag.as_ref()));
        assert!(name.starts_with("L_"));
        assert!(name.ends_with(&format!("_{suffix}")));
    }
}

#[test]
fn test_named_snapshot_uses_backup_size() {
    let model = Model::from_toml_str(
        &FLEET.replacen("snap_size = 20\n", "snap_size = 20\nbackup_snap_size = 50\n", 1),
    )
    .unwrap();
    let tag = SnapshotTag::parse("nightly").unwrap();
    let plan = generate_plan(
        &model,
        &live(),
        None,
        &SnapshotRequest::create(Some(tag)),
    )
    .unwrap();

    let size = phase(&plan, "Create snapshots")
        .tasks
        .iter()
        .find_map(|t| match &t.kind {
            TaskKind::CreateLvmSnapshot { snapshot, size } if t.node.as_str() == "node1" => {
                assert_eq!(snapshot.name, "L_vg1_root_nightly");
                Some(*size)
            }
            _ => None,
        })
        .unwrap();
    assert_eq!(size, SnapshotSize::Mib(5120));
}

fn excluded_set(mask: u8) -> BTreeSet<NodeId> {
    PEERS
        .iter()
        .enumerate()
        .filter(|(i, _)| mask & (1 << i) != 0)
        .map(|(_, n)| node(n))
        .collect()
}

proptest! {
    #[test]
    fn prop_excluded_nodes_never_targeted(mask in 0u8..16, remove in any::<bool>(), force in any::<bool>()) {
        let model = fleet();
        let excluded = excluded_set(mask);

        let record = applied(&model, None);
        let (request, record) = if remove {
            (SnapshotRequest::remove(None).exclude(excluded.clone()).force(force), Some(&record))
        } else {
            (SnapshotRequest::create(None).exclude(excluded.clone()), None)
        };

        let plan = generate_plan(&model, &live(), record, &request).unwrap();
        for task in plan.tasks() {
            prop_assert!(!excluded.contains(&task.node));
            for name in &excluded {
                prop_assert!(!task.description.contains(name.as_str()));
            }
        }
        for warning in &plan.warnings {
            for name in &excluded {
                prop_assert!(!warning.contains(name.as_str()));
            }
        }
    }

    #[test]
    fn prop_reserved_capacity_matches_percentage(size_mib in 2048u64..1_048_576, percent in 1u8..=100) {
        let toml = format!(
            r#"
[management_server]
hostname = "ms1"

[[clusters]]
id = "c1"

[[clusters.nodes]]
hostname = "n1"

[[clusters.nodes.volume_groups]]
id = "vg1"
volume_group_name = "vg_app"

[[clusters.nodes.volume_groups.file_systems]]
id = "data"
type = "ext4"
size = "{size_mib}M"
snap_size = {percent}
"#
        );
        let model = Model::from_toml_str(&toml).unwrap();
        let plan = generate_plan(&model, &LiveView::all_reachable(), None, &SnapshotRequest::create(None)).unwrap();

        let reserved = plan
            .tasks()
            .find_map(|t| match &t.kind {
                TaskKind::CreateLvmSnapshot { size: SnapshotSize::Mib(mib), .. } if t.node.as_str() == "n1" => Some(*mib),
                _ => None,
            })
            .unwrap();

        let expected = size_mib as f64 * f64::from(percent) / 100.0;
        prop_assert!((reserved as f64 - expected).abs() <= expected * 0.05);
    }
}
