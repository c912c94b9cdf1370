//! Node reachability and disk group activity.
//!
//! Plan generation is a pure function, so liveness is gathered up front into
//! a [`LiveView`] and handed to the generator read-only.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{debug, info};
use volsnap_id::NodeId;
use volsnap_model::Model;

use crate::runner::{CommandRunner, StorageCommand};

/// Reachability of every node and where each VxVM disk group is imported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveView {
    unreachable: BTreeSet<NodeId>,
    active_disk_groups: BTreeMap<String, NodeId>,
}

impl LiveView {
    /// A view in which every node answers and no disk group is imported.
    pub fn all_reachable() -> Self {
        Self::default()
    }

    pub fn with_unreachable(mut self, node: NodeId) -> Self {
        self.unreachable.insert(node);
        self
    }

    pub fn with_active_disk_group(mut self, disk_group: impl Into<String>, node: NodeId) -> Self {
        self.active_disk_groups.insert(disk_group.into(), node);
        self
    }

    pub fn is_reachable(&self, node: &NodeId) -> bool {
        !self.unreachable.contains(node)
    }

    /// Node on which `disk_group` is imported, if any.
    pub fn active_node(&self, disk_group: &str) -> Option<&NodeId> {
        self.active_disk_groups.get(disk_group)
    }

    pub fn unreachable(&self) -> impl Iterator<Item = &NodeId> {
        self.unreachable.iter()
    }
}

/// Probes every peer node and locates the active node of every disk group.
///
/// The management server runs the engine and is always reachable.
pub async fn probe(model: &Model, runner: &dyn CommandRunner, timeout: Duration) -> LiveView {
    let peers: Vec<NodeId> = model
        .peer_nodes()
        .map(|(_, n)| n.hostname.clone())
        .collect();

    let pings = peers.iter().map(|node| async move {
        let reachable = runner.run(node, &StorageCommand::Ping, timeout).await.is_ok();
        (node, reachable)
    });

    let mut view = LiveView::default();
    for (node, reachable) in join_all(pings).await {
        if !reachable {
            info!(node = %node, "Node is not reachable");
            view.unreachable.insert(node.clone());
        }
    }

    for cluster in &model.clusters {
        for dg in &cluster.volume_groups {
            let candidates: Vec<&NodeId> = cluster
                .node_ids()
                .filter(|n| view.is_reachable(n))
                .collect();
            let checks = candidates.iter().map(|node| {
                let command = StorageCommand::DiskGroupImported {
                    disk_group: dg.volume_group_name.clone(),
                };
                async move { (*node, runner.run(node, &command, timeout).await.is_ok()) }
            });
            let active = join_all(checks)
                .await
                .into_iter()
                .find_map(|(node, imported)| imported.then_some(node));

            match active {
                Some(node) => {
                    debug!(disk_group = %dg.volume_group_name, node = %node, "Disk group is imported");
                    view.active_disk_groups
                        .insert(dg.volume_group_name.clone(), node.clone());
                }
                None => {
                    info!(disk_group = %dg.volume_group_name, cluster = %cluster.id, "Disk group is not imported on any reachable node");
                }
            }
        }
    }

    view
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::MockRunner;

    const MODEL: &str = r#"
[management_server]
hostname = "ms1"

[[clusters]]
id = "c1"

[[clusters.nodes]]
hostname = "node1"

[[clusters.nodes]]
hostname = "node2"

[[clusters.volume_groups]]
id = "dg1"
volume_group_name = "vxdg1"

[[clusters.volume_groups.file_systems]]
id = "fs1"
type = "vxfs"
size = "1G"
"#;

    fn node(name: &str) -> NodeId {
        NodeId::parse(name).unwrap()
    }

    #[tokio::test]
    async fn test_probe_reports_unreachable_and_active_node() {
        let model = Model::from_toml_str(MODEL).unwrap();
        let runner = MockRunner::new()
            .with_unreachable("node1")
            .with_disk_group("vxdg1", "node2");

        let view = probe(&model, &runner, Duration::from_millis(100)).await;

        assert!(!view.is_reachable(&node("node1")));
        assert!(view.is_reachable(&node("node2")));
        assert!(view.is_reachable(&node("ms1")));
        assert_eq!(view.active_node("vxdg1"), Some(&node("node2")));
    }

    #[tokio::test]
    async fn test_probe_without_import() {
        let model = Model::from_toml_str(MODEL).unwrap();
        let runner = MockRunner::new();

        let view = probe(&model, &runner, Duration::from_millis(100)).await;
        assert!(view.active_node("vxdg1").is_none());
        assert_eq!(view.unreachable().count(), 0);
    }
}
