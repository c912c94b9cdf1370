//! Cluster restart ordering.
//!
//! Clusters list the clusters they depend on; a cluster restarts only after
//! every in-scope dependency is back. Ordering uses Kahn's algorithm in
//! waves: each wave takes every remaining cluster whose dependencies are
//! already placed, in declaration order, so the result is deterministic.
//!
//! A cyclic graph is not an error. The restart still happens, in declaration
//! order, and the caller surfaces a warning.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::warn;
use volsnap_id::ClusterId;
use volsnap_model::Model;

/// Warning logged and attached to the plan when the graph has a cycle.
pub const INVALID_ORDER_WARNING: &str = "WARNING: Order of clusters is invalid.";

/// Whether a usable order was found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OrderOutcome {
    Sorted,
    /// The clusters that could not be placed.
    Degenerate { cycle: Vec<ClusterId> },
}

/// Restart sequence for a set of clusters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestartOrder {
    pub sequence: Vec<ClusterId>,
    pub outcome: OrderOutcome,
}

impl RestartOrder {
    pub fn is_degenerate(&self) -> bool {
        matches!(self.outcome, OrderOutcome::Degenerate { .. })
    }

    /// Warning for the plan, if ordering fell back to declaration order.
    pub fn warning(&self) -> Option<&'static str> {
        self.is_degenerate().then_some(INVALID_ORDER_WARNING)
    }
}

/// Orders clusters so that every cluster follows its dependencies.
///
/// `clusters` is `(id, dependency_list)` in declaration order. Dependencies
/// on clusters outside `clusters` are ignored.
pub fn order_clusters(clusters: &[(ClusterId, Vec<ClusterId>)]) -> RestartOrder {
    let in_scope: BTreeSet<&ClusterId> = clusters.iter().map(|(id, _)| id).collect();

    let mut pending: BTreeMap<&ClusterId, BTreeSet<&ClusterId>> = BTreeMap::new();
    for (id, deps) in clusters {
        let deps = deps
            .iter()
            .filter(|d| in_scope.contains(d) && *d != id)
            .collect();
        pending.insert(id, deps);
    }

    let mut sequence: Vec<ClusterId> = Vec::with_capacity(clusters.len());
    let mut placed: BTreeSet<&ClusterId> = BTreeSet::new();

    loop {
        let wave: Vec<&ClusterId> = clusters
            .iter()
            .map(|(id, _)| id)
            .filter(|id| !placed.contains(id))
            .filter(|id| pending.get(id).is_some_and(|d| d.iter().all(|d| placed.contains(d))))
            .collect();
        if wave.is_empty() {
            break;
        }
        for id in wave {
            placed.insert(id);
            sequence.push(id.clone());
        }
    }

    if sequence.len() == clusters.len() {
        return RestartOrder {
            sequence,
            outcome: OrderOutcome::Sorted,
        };
    }

    let cycle: Vec<ClusterId> = clusters
        .iter()
        .map(|(id, _)| id)
        .filter(|id| !placed.contains(id))
        .cloned()
        .collect();
    warn!(cycle = ?cycle, "{INVALID_ORDER_WARNING}");

    RestartOrder {
        sequence: clusters.iter().map(|(id, _)| id.clone()).collect(),
        outcome: OrderOutcome::Degenerate { cycle },
    }
}

/// Orders the model's clusters that appear in `scope`.
pub fn order_model_clusters(model: &Model, scope: &BTreeSet<ClusterId>) -> RestartOrder {
    let clusters: Vec<(ClusterId, Vec<ClusterId>)> = model
        .clusters
        .iter()
        .filter(|c| scope.contains(&c.id))
        .map(|c| (c.id.clone(), c.dependency_list.clone()))
        .collect();
    order_clusters(&clusters)
}
