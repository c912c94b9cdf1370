//! Task generation.
//!
//! Turns a snapshot request into a [`Plan`]. Generation is a pure function
//! of the model, the live view, the persisted record for the tag and the
//! request; nothing is executed here.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};
use volsnap_id::{ClusterId, NodeId};
use volsnap_model::Model;

use crate::error::{EngineError, EngineResult};
use crate::inventory::{Driver, Volume, VolumeInventory};
use crate::liveness::LiveView;
use crate::naming::{self, SnapshotTag};
use crate::plan::{Operation, Phase, Plan, SnapshotRef, SnapshotRequest, Task, TaskKind};
use crate::resolver::{order_model_clusters, RestartOrder};
use crate::store::SnapshotRecord;

/// Builds the plan for `request`.
///
/// `record` is the persisted record for the request's tag, if any.
pub fn generate_plan(
    model: &Model,
    live: &LiveView,
    record: Option<&SnapshotRecord>,
    request: &SnapshotRequest,
) -> EngineResult<Plan> {
    validate_exclusions(model, request)?;
    let inventory = VolumeInventory::from_model(model);

    let plan = match request.operation {
        Operation::Create => create_plan(model, &inventory, live, record, request)?,
        Operation::Remove => remove_plan(model, &inventory, live, record, request)?,
        Operation::Restore => restore_plan(model, &inventory, live, record, request)?,
    };

    info!(
        plan_id = %plan.id,
        operation = %request.operation,
        tag = request.tag.as_ref().map(SnapshotTag::as_str).unwrap_or(""),
        phases = plan.phases.len(),
        tasks = plan.task_count(),
        "Generated plan"
    );
    Ok(plan)
}

fn validate_exclusions(model: &Model, request: &SnapshotRequest) -> EngineResult<()> {
    if request.exclude_nodes.is_empty() {
        return Ok(());
    }
    if request.operation == Operation::Restore {
        return Err(EngineError::validation(
            "Nodes cannot be excluded from a restore",
        ));
    }
    for node in &request.exclude_nodes {
        if model.is_management_server(node) {
            return Err(EngineError::validation(format!(
                "The management server \"{node}\" cannot be excluded"
            )));
        }
        if model.node(node.as_str()).is_none() {
            return Err(EngineError::validation(format!(
                "Node \"{node}\" in the exclude list does not exist"
            )));
        }
    }
    Ok(())
}

fn snapshot_kind(tag: Option<&SnapshotTag>) -> &'static str {
    match tag {
        Some(_) => "named backup",
        None => "deployment",
    }
}

/// A volume paired with the node its commands run on.
struct Target<'a> {
    volume: &'a Volume,
    node: NodeId,
}

/// Resolves each eligible volume to the node that acts on it.
///
/// LVM volumes act on their owner; VxVM volumes on the node where the disk
/// group is imported. Volumes whose node is excluded are dropped; disk
/// groups without a usable active node are dropped with a warning.
fn resolve_targets<'a>(
    model: &Model,
    volumes: Vec<&'a Volume>,
    live: &LiveView,
    excluded: &BTreeSet<NodeId>,
    warnings: &mut Vec<String>,
) -> Vec<Target<'a>> {
    let mut targets = Vec::new();
    let mut skipped_groups = BTreeSet::new();

    for volume in volumes {
        match volume.driver {
            Driver::Lvm => {
                let Some(node) = volume.node() else { continue };
                if excluded.contains(node) {
                    debug!(node = %node, volume = %volume.volume_name, "Skipping volume on excluded node");
                    continue;
                }
                targets.push(Target {
                    volume,
                    node: node.clone(),
                });
            }
            Driver::Vxvm => {
                let group = &volume.volume_group_name;
                match live.active_node(group) {
                    Some(node) if !excluded.contains(node) => targets.push(Target {
                        volume,
                        node: node.clone(),
                    }),
                    active => {
                        if skipped_groups.insert(group.clone()) {
                            let cluster = volume.cluster().map(ClusterId::as_str).unwrap_or("");
                            let reason = if active.is_some() {
                                "its active node is excluded"
                            } else {
                                "it is not imported on any reachable node"
                            };
                            let message = format!(
                                "Skipping VxVM disk group \"{group}\" of cluster \"{cluster}\": {reason}"
                            );
                            warn!("{message}");
                            warnings.push(message);
                        }
                    }
                }
            }
        }
    }

    sort_by_model_order(model, &mut targets);
    targets
}

/// Stable sort of targets by the node's position in the model.
fn sort_by_model_order(model: &Model, targets: &mut [Target<'_>]) {
    let order: BTreeMap<NodeId, usize> = model
        .node_ids()
        .into_iter()
        .enumerate()
        .map(|(i, n)| (n, i))
        .collect();
    targets.sort_by_key(|t| order.get(&t.node).copied().unwrap_or(usize::MAX));
}

/// Peer nodes whose reachability must be confirmed before acting on them.
fn reachability_phase(model: &Model, targets: &[Target<'_>]) -> Option<Phase> {
    let mut seen = BTreeSet::new();
    let tasks: Vec<Task> = targets
        .iter()
        .filter(|t| !t.volume.snap_external && !model.is_management_server(&t.node))
        .filter(|t| seen.insert(t.node.clone()))
        .map(|t| check_reachable_task(&t.node))
        .collect();

    (!tasks.is_empty()).then(|| Phase::new("Check peer nodes are reachable", tasks))
}

fn check_reachable_task(node: &NodeId) -> Task {
    Task::new(
        node.clone(),
        TaskKind::CheckNodeReachable,
        format!("Check node \"{node}\" is reachable"),
    )
}

fn restart_order(model: &Model, nodes: &BTreeSet<NodeId>) -> RestartOrder {
    let clusters: BTreeSet<ClusterId> = model
        .clusters
        .iter()
        .filter(|c| c.node_ids().any(|n| nodes.contains(n)))
        .map(|c| c.id.clone())
        .collect();
    order_model_clusters(model, &clusters)
}

fn finish(
    model: &Model,
    request: &SnapshotRequest,
    phases: Vec<Phase>,
    mut warnings: Vec<String>,
    scope: BTreeSet<NodeId>,
) -> Plan {
    if let Some(w) = restart_order(model, &scope).warning() {
        warnings.push(w.to_string());
    }
    let phases = phases.into_iter().filter(|p| !p.tasks.is_empty()).collect();
    Plan::new(request.clone(), phases, warnings, scope, model.fingerprint())
}

fn included_nodes(model: &Model, request: &SnapshotRequest) -> BTreeSet<NodeId> {
    model
        .node_ids()
        .into_iter()
        .filter(|n| !request.exclude_nodes.contains(n))
        .collect()
}

fn create_plan(
    model: &Model,
    inventory: &VolumeInventory,
    live: &LiveView,
    record: Option<&SnapshotRecord>,
    request: &SnapshotRequest,
) -> EngineResult<Plan> {
    let tag = request.tag.as_ref();
    if let Some(tag) = tag {
        naming::validate_tag_length(inventory, tag)?;
    }
    if record.is_some() {
        return Err(EngineError::validation(format!(
            "Create snapshot failed: a {} snapshot named \"{}\" already exists",
            snapshot_kind(tag),
            naming::record_key(tag)
        )));
    }

    let mut warnings = Vec::new();
    let targets = resolve_targets(
        model,
        inventory.snapshot_volumes(tag),
        live,
        &request.exclude_nodes,
        &mut warnings,
    );

    let kind = snapshot_kind(tag);
    let tasks: Vec<Task> = targets
        .iter()
        .map(|t| match t.volume.driver {
            Driver::Lvm => {
                let snapshot = naming::lvm_snapshot(t.volume, tag);
                let description = format!(
                    "Create LVM {kind} snapshot \"{}\" of \"{}/{}\" on node \"{}\"",
                    snapshot.name, snapshot.volume_group, snapshot.origin, t.node
                );
                let size = naming::snapshot_size(t.volume, tag);
                Task::new(t.node.clone(), TaskKind::CreateLvmSnapshot { snapshot, size }, description)
            }
            Driver::Vxvm => {
                let snapshot = naming::vxvm_snapshot(t.volume, tag);
                let description = format!(
                    "Create VxVM {kind} snapshot \"{}\" for cluster \"{}\" volume group \"{}\"",
                    snapshot.name,
                    t.volume.cluster().map(ClusterId::as_str).unwrap_or(""),
                    snapshot.disk_group
                );
                let cache_mib = cache_size_mib(t.volume, tag);
                Task::new(
                    t.node.clone(),
                    TaskKind::CreateVxvmSnapshot {
                        snapshot,
                        cache_mib,
                    },
                    description,
                )
            }
        })
        .collect();

    if tasks.is_empty() {
        return Err(EngineError::DoNothingPlan {
            operation: Operation::Create,
        });
    }

    let mut phases = Vec::new();
    phases.extend(reachability_phase(model, &targets));
    phases.push(Phase::new("Create snapshots", tasks));

    Ok(finish(model, request, phases, warnings, included_nodes(model, request)))
}

fn cache_size_mib(volume: &Volume, tag: Option<&SnapshotTag>) -> u64 {
    let percent = volume.effective_snap_percent(tag);
    volume
        .size
        .map(|s| s.percent(percent).mib())
        .unwrap_or_default()
        .max(1)
}

fn remove_plan(
    model: &Model,
    inventory: &VolumeInventory,
    live: &LiveView,
    record: Option<&SnapshotRecord>,
    request: &SnapshotRequest,
) -> EngineResult<Plan> {
    let Some(_record) = record else {
        return Err(EngineError::DoNothingPlan {
            operation: Operation::Remove,
        });
    };
    let tag = request.tag.as_ref();

    let mut warnings = Vec::new();
    let targets = resolve_targets(
        model,
        inventory.snapshot_volumes(tag),
        live,
        &request.exclude_nodes,
        &mut warnings,
    );

    let kind = snapshot_kind(tag);
    let tasks: Vec<Task> = targets
        .iter()
        .map(|t| match t.volume.driver {
            Driver::Lvm => {
                let snapshot = naming::lvm_snapshot(t.volume, tag);
                let description = format!(
                    "Remove LVM {kind} snapshot \"{}\" on node \"{}\"",
                    snapshot.name, t.node
                );
                Task::new(t.node.clone(), TaskKind::RemoveLvmSnapshot { snapshot }, description)
            }
            Driver::Vxvm => {
                let snapshot = naming::vxvm_snapshot(t.volume, tag);
                let description = format!(
                    "Remove VxVM {kind} snapshot \"{}\" from volume group \"{}\"",
                    snapshot.name, snapshot.disk_group
                );
                Task::new(t.node.clone(), TaskKind::RemoveVxvmSnapshot { snapshot }, description)
            }
        })
        .map(|t| t.tolerating_unreachable(request.force))
        .collect();

    if tasks.is_empty() {
        return Err(EngineError::DoNothingPlan {
            operation: Operation::Remove,
        });
    }

    let mut phases = Vec::new();
    if !request.force {
        phases.extend(reachability_phase(model, &targets));
    }
    phases.push(Phase::new("Remove snapshots", tasks));

    Ok(finish(model, request, phases, warnings, included_nodes(model, request)))
}

fn restore_plan(
    model: &Model,
    inventory: &VolumeInventory,
    live: &LiveView,
    record: Option<&SnapshotRecord>,
    request: &SnapshotRequest,
) -> EngineResult<Plan> {
    if request.tag.is_some() {
        return Err(EngineError::validation(
            "Only the deployment snapshot can be restored",
        ));
    }
    let Some(record) = record else {
        return Err(EngineError::DoNothingPlan {
            operation: Operation::Restore,
        });
    };
    if !record.is_applied() {
        return Err(EngineError::validation(
            "Restore snapshot failed: the deployment snapshot was not created successfully",
        ));
    }

    let force = request.force;
    let scope: BTreeSet<NodeId> = model
        .node_ids()
        .into_iter()
        .filter(|n| record.nodes.contains(n))
        .collect();
    let outside: BTreeSet<NodeId> = model
        .node_ids()
        .into_iter()
        .filter(|n| !scope.contains(n))
        .collect();

    let mut warnings = Vec::new();
    let targets = resolve_targets(
        model,
        inventory.snapshot_volumes(None),
        live,
        &outside,
        &mut warnings,
    );
    if targets.is_empty() {
        return Err(EngineError::DoNothingPlan {
            operation: Operation::Restore,
        });
    }

    // Snapshots to check, per node, in model order.
    let mut per_node: Vec<(NodeId, Vec<SnapshotRef>)> = Vec::new();
    for t in &targets {
        let snapshot = match t.volume.driver {
            Driver::Lvm => SnapshotRef::Lvm(naming::lvm_snapshot(t.volume, None)),
            Driver::Vxvm => SnapshotRef::Vxvm(naming::vxvm_snapshot(t.volume, None)),
        };
        match per_node.iter_mut().find(|(node, _)| node == &t.node) {
            Some((_, refs)) => refs.push(snapshot),
            None => per_node.push((t.node.clone(), vec![snapshot])),
        }
    }

    let mut phases = Vec::new();

    if !force {
        let tasks = per_node
            .iter()
            .map(|(node, refs)| {
                if live.is_reachable(node) {
                    Task::new(
                        node.clone(),
                        TaskKind::CheckSnapshotsPresent {
                            snapshots: refs.clone(),
                        },
                        format!("Check snapshots are present on node \"{node}\""),
                    )
                } else {
                    check_reachable_task(node)
                }
            })
            .collect();
        phases.push(Phase::new("Check snapshots are present", tasks));
    }

    let tasks = per_node
        .iter()
        .map(|(node, refs)| {
            Task::new(
                node.clone(),
                TaskKind::CheckSnapshotsValid {
                    snapshots: refs.clone(),
                },
                format!("Check snapshots on node \"{node}\" are valid"),
            )
            .tolerating_unreachable(force)
        })
        .collect();
    phases.push(Phase::new("Check snapshots are valid", tasks));

    let order = restart_order(model, &scope);
    let clusters: Vec<_> = order
        .sequence
        .iter()
        .filter_map(|id| model.cluster(id.as_str()))
        .collect();

    let stop_tasks = clusters
        .iter()
        .filter_map(|cluster| {
            let members: Vec<&NodeId> = cluster.node_ids().filter(|n| scope.contains(*n)).collect();
            let target = members
                .iter()
                .find(|n| live.is_reachable(n))
                .or(members.first())?;
            Some(
                Task::new(
                    (*target).clone(),
                    TaskKind::StopClusterServices {
                        cluster: cluster.id.clone(),
                    },
                    format!("Stop VCS services on cluster \"{}\"", cluster.id),
                )
                .tolerating_unreachable(force),
            )
        })
        .collect();
    phases.push(Phase::new("Stop cluster services", stop_tasks));

    let restore_tasks = targets
        .iter()
        .map(|t| match t.volume.driver {
            Driver::Lvm => {
                let snapshot = naming::lvm_snapshot(t.volume, None);
                let description = format!(
                    "Restore LVM deployment snapshot \"{}\" on node \"{}\"",
                    snapshot.name, t.node
                );
                Task::new(t.node.clone(), TaskKind::RestoreLvmSnapshot { snapshot }, description)
            }
            Driver::Vxvm => {
                let snapshot = naming::vxvm_snapshot(t.volume, None);
                let description = format!(
                    "Restore VxVM deployment snapshot \"{}\" for volume group \"{}\"",
                    snapshot.name, snapshot.disk_group
                );
                Task::new(t.node.clone(), TaskKind::RestoreVxvmSnapshot { snapshot }, description)
            }
        })
        .map(|t| t.tolerating_unreachable(force))
        .collect();
    phases.push(Phase::new("Restore snapshots", restore_tasks));

    for cluster in &clusters {
        let members: Vec<&NodeId> = cluster.node_ids().filter(|n| scope.contains(*n)).collect();

        let restarts = members
            .iter()
            .map(|node| {
                Task::new(
                    (*node).clone(),
                    TaskKind::RestartNode,
                    format!("Restart node \"{node}\""),
                )
                .tolerating_unreachable(force)
            })
            .collect();
        phases.push(Phase::new(
            format!("Restart nodes of cluster \"{}\"", cluster.id),
            restarts,
        ));

        // A node known to be offline under force will not come back on its own.
        let waits = members
            .iter()
            .filter(|node| !(force && !live.is_reachable(node)))
            .map(|node| {
                Task::new(
                    (*node).clone(),
                    TaskKind::WaitForNodeRestart,
                    format!("Wait for node \"{node}\" to restart"),
                )
            })
            .collect();
        phases.push(Phase::new(
            format!("Wait for nodes of cluster \"{}\" to restart", cluster.id),
            waits,
        ));
    }

    let ms = model.management_server_id();
    phases.push(Phase::new(
        "Restart management server",
        vec![Task::new(
            ms.clone(),
            TaskKind::RestartNode,
            format!("Restart node \"{ms}\""),
        )],
    ));

    Ok(finish(model, request, phases, warnings, scope))
}
