//! Snapshot service.
//!
//! Owns the single current plan and the snapshot records. Every operation
//! goes through the [`StateStore`], so separate processes (one running a
//! plan, another asking it to stop) see the same state.
//!
//! Checks and the writes they guard share one store transaction. The
//! process running a plan holds a lease on it and renews it while it polls
//! for stop requests; a plan whose lease has expired is marked failed
//! by the next operation that loads it.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, info, warn};
use volsnap_events::{EventEnvelope, PlanEvent};
use volsnap_id::{NodeId, Ulid};
use volsnap_model::Model;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::executor::{PlanCheckpoint, PlanExecutor};
use crate::generator::generate_plan;
use crate::liveness;
use crate::naming::{record_key, SnapshotTag, DEPLOYMENT_SNAPSHOT};
use crate::plan::{Operation, Plan, PlanState, SnapshotRequest, TaskFailure, TaskState};
use crate::runner::{CommandRunner, FailureKind};
use crate::store::{RecordState, SnapshotRecord, StateStore, StateStoreError};

const EVENT_CAPACITY: usize = 1024;

type SharedStore = Arc<Mutex<StateStore>>;

fn with_store<T, E>(store: &SharedStore, f: impl FnOnce(&StateStore) -> Result<T, E>) -> Result<T, E>
where
    E: From<StateStoreError>,
{
    let guard = store.lock().map_err(|_| StateStoreError::Poisoned)?;
    f(&guard)
}

/// Identifies this run in the lease: process id plus a fresh ULID.
fn lease_owner() -> String {
    format!("{}-{}", std::process::id(), Ulid::new())
}

/// Persists the plan after every executor state change.
struct StoreCheckpoint {
    store: SharedStore,
}

impl PlanCheckpoint for StoreCheckpoint {
    fn checkpoint(&self, plan: &Plan) {
        match with_store(&self.store, |s| s.update_plan(plan)) {
            Ok(true) => {}
            Ok(false) => warn!(plan_id = %plan.id, "Plan was replaced in the store"),
            Err(e) => warn!(plan_id = %plan.id, error = %e, "Failed to checkpoint plan"),
        }
    }
}

/// Entry point for snapshot operations against one deployment model.
pub struct SnapshotService {
    model: Model,
    runner: Arc<dyn CommandRunner>,
    store: SharedStore,
    config: EngineConfig,
    events: broadcast::Sender<EventEnvelope<PlanEvent>>,
}

impl SnapshotService {
    pub fn new(
        model: Model,
        runner: Arc<dyn CommandRunner>,
        store: StateStore,
        config: EngineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            model,
            runner,
            store: Arc::new(Mutex::new(store)),
            config,
            events,
        }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Subscribe to progress events of plans run by this service.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope<PlanEvent>> {
        self.events.subscribe()
    }

    /// Installs a plan that creates the snapshot set for `tag`.
    pub async fn create_snapshot(
        &self,
        tag: Option<SnapshotTag>,
        exclude_nodes: BTreeSet<NodeId>,
    ) -> EngineResult<Plan> {
        self.submit(SnapshotRequest::create(tag).exclude(exclude_nodes))
            .await
    }

    /// Installs a plan that removes the snapshot set for `tag`.
    pub async fn remove_snapshot(
        &self,
        tag: Option<SnapshotTag>,
        exclude_nodes: BTreeSet<NodeId>,
        force: bool,
    ) -> EngineResult<Plan> {
        self.submit(
            SnapshotRequest::remove(tag)
                .exclude(exclude_nodes)
                .force(force),
        )
        .await
    }

    /// Installs a plan that rolls the deployment back to its snapshot.
    pub async fn restore_snapshot(&self, force: bool) -> EngineResult<Plan> {
        self.submit(SnapshotRequest::restore().force(force)).await
    }

    /// Generates and installs the plan for `request`, replacing an inactive
    /// previous plan.
    pub async fn submit(&self, request: SnapshotRequest) -> EngineResult<Plan> {
        let ttl = self.config.lease_ttl;
        let key = record_key(request.tag.as_ref());
        let (seen, record) = with_store(&self.store, |s| {
            s.transaction(|s| -> EngineResult<_> {
                let current = current_plan(s, ttl)?;
                if current.as_ref().is_some_and(|p| p.state.is_active()) {
                    return Err(EngineError::invalid_request("Plan already running"));
                }
                // The record of a replaced, never-run create is discarded on install.
                let record = s.get_snapshot(key)?.filter(|r| {
                    !current.as_ref().is_some_and(|p| is_unrun_record(p, r))
                });
                Ok((current.map(|p| (p.id, p.state)), record))
            })
        })?;

        let live = liveness::probe(
            &self.model,
            self.runner.as_ref(),
            self.config.reachability_timeout,
        )
        .await;

        let plan = generate_plan(&self.model, &live, record.as_ref(), &request)?;

        // Generation awaited the nodes, so the plan and record it was based
        // on are checked again under the write lock.
        with_store(&self.store, |s| {
            s.transaction(|s| -> EngineResult<()> {
                let current = current_plan(s, ttl)?;
                if current.as_ref().is_some_and(|p| p.state.is_active()) {
                    return Err(EngineError::invalid_request("Plan already running"));
                }
                if current.as_ref().map(|p| (p.id, p.state)) != seen {
                    return Err(changed_during_generation());
                }
                if let Some(current) = &current {
                    discard_unrun_record(s, current)?;
                }
                if s.get_snapshot(key)? != record {
                    return Err(changed_during_generation());
                }

                if plan.operation() == Operation::Create {
                    s.put_snapshot(&SnapshotRecord {
                        key: key.to_string(),
                        tag: request.tag.clone(),
                        state: RecordState::Initial,
                        created_at: Utc::now(),
                        timestamp: None,
                        nodes: plan.scope_nodes.clone(),
                        plan_id: plan.id,
                        model_fingerprint: plan.model_fingerprint.clone(),
                    })?;
                }
                s.save_plan(&plan)?;
                s.release_lease(None)?;
                Ok(s.clear_stop()?)
            })
        })?;

        info!(plan_id = %plan.id, operation = %plan.operation(), "Plan created");
        Ok(plan)
    }

    /// Generates, installs and runs the plan for `request`.
    pub async fn execute(&self, request: SnapshotRequest) -> EngineResult<Plan> {
        self.submit(request).await?;
        self.run_plan().await
    }

    /// Runs the installed plan to completion and updates the records.
    ///
    /// The plan is claimed with a compare-and-set from `initial` to
    /// `running`, so only one caller runs it.
    pub async fn run_plan(&self) -> EngineResult<Plan> {
        let plan = self
            .load_plan()?
            .ok_or_else(|| EngineError::invalid_request("Plan does not exist"))?;
        if plan.state != PlanState::Initial {
            return Err(not_runnable(&plan));
        }
        if plan.model_fingerprint != self.model.fingerprint() {
            return Err(EngineError::invalid_request(
                "Model has changed since the plan was created",
            ));
        }

        let owner = lease_owner();
        let mut claimed = plan.clone();
        claimed.state = PlanState::Running;
        claimed.started_at = Some(Utc::now());
        if !with_store(&self.store, |s| s.claim_plan(&claimed, &owner))? {
            return Err(match self.load_plan()? {
                Some(current) if current.id == plan.id => not_runnable(&current),
                Some(_) => EngineError::invalid_request("Plan was replaced before it could run"),
                None => EngineError::invalid_request("Plan does not exist"),
            });
        }

        let shared = Arc::new(RwLock::new(plan));
        let (stop_tx, stop_rx) = watch::channel(false);
        let poller = tokio::spawn(poll_stop_requests(
            self.store.clone(),
            shared.clone(),
            stop_tx,
            owner.clone(),
            self.config.stop_poll_interval,
        ));

        let executor = PlanExecutor::new(
            self.runner.clone(),
            self.config.clone(),
            self.events.clone(),
        );
        let checkpoint = StoreCheckpoint {
            store: self.store.clone(),
        };
        let state = executor.run(shared.clone(), stop_rx, &checkpoint).await;
        poller.abort();

        let plan = shared.read().await.clone();
        let settled = with_store(&self.store, |s| {
            s.transaction(|s| -> Result<bool, StateStoreError> {
                if !s.update_plan(&plan)? {
                    return Ok(false);
                }
                settle_records(s, &plan)?;
                s.release_lease(Some(&owner))?;
                s.clear_stop()?;
                Ok(true)
            })
        })?;
        if !settled {
            warn!(plan_id = %plan.id, "Plan was replaced while running; records left unchanged");
        }

        info!(plan_id = %plan.id, state = %state, "Plan run finished");
        Ok(plan)
    }

    /// Asks the running plan to stop after its in-flight tasks.
    pub fn stop_plan(&self) -> EngineResult<Plan> {
        let ttl = self.config.lease_ttl;
        let plan = with_store(&self.store, |s| {
            s.transaction(|s| -> EngineResult<Plan> {
                let mut plan = current_plan(s, ttl)?
                    .ok_or_else(|| EngineError::invalid_request("Plan does not exist"))?;

                if plan.is_protected() && plan.state.is_active() {
                    return Err(EngineError::invalid_request(
                        "Cannot stop plan when restore is ongoing",
                    ));
                }
                match plan.state {
                    PlanState::Running => {}
                    PlanState::Stopping => {
                        return Err(EngineError::invalid_request("Plan is already stopping"))
                    }
                    _ => return Err(EngineError::invalid_request("Plan not currently running")),
                }

                plan.state = PlanState::Stopping;
                s.request_stop()?;
                s.update_plan(&plan)?;
                Ok(plan)
            })
        })?;

        info!(plan_id = %plan.id, "Stop requested");
        Ok(plan)
    }

    /// Deletes the current plan.
    pub fn remove_plan(&self) -> EngineResult<()> {
        let ttl = self.config.lease_ttl;
        let plan = with_store(&self.store, |s| {
            s.transaction(|s| -> EngineResult<Plan> {
                let plan = current_plan(s, ttl)?
                    .ok_or_else(|| EngineError::invalid_request("Plan does not exist"))?;
                if plan.state.is_active() {
                    return Err(EngineError::invalid_request(
                        "Removing a running/stopping plan is not allowed",
                    ));
                }

                discard_unrun_record(s, &plan)?;
                s.delete_plan()?;
                Ok(plan)
            })
        })?;

        info!(plan_id = %plan.id, "Plan removed");
        Ok(())
    }

    /// The current plan, if any.
    pub fn show_plan(&self) -> EngineResult<Option<Plan>> {
        self.load_plan()
    }

    pub fn list_snapshots(&self) -> EngineResult<Vec<SnapshotRecord>> {
        Ok(with_store(&self.store, |s| s.list_snapshots())?)
    }

    /// Loads the current plan, failing it first if its runner is gone.
    fn load_plan(&self) -> EngineResult<Option<Plan>> {
        let ttl = self.config.lease_ttl;
        Ok(with_store(&self.store, |s| {
            s.transaction(|s| current_plan(s, ttl))
        })?)
    }
}

fn changed_during_generation() -> EngineError {
    EngineError::invalid_request(
        "Plan or snapshot records changed while the plan was generated, retry",
    )
}

fn not_runnable(plan: &Plan) -> EngineError {
    EngineError::invalid_request(format!("Plan cannot be run in state {}", plan.state))
}

/// The current plan, after failing it if it is active but its lease expired.
fn current_plan(store: &StateStore, ttl: Duration) -> Result<Option<Plan>, StateStoreError> {
    let Some(mut plan) = store.load_plan()? else {
        return Ok(None);
    };
    if !plan.state.is_active() {
        return Ok(Some(plan));
    }

    let now = Utc::now();
    if let Some(lease) = store.lease()? {
        if !lease.is_expired(ttl, now) {
            return Ok(Some(plan));
        }
    }

    abandon(&mut plan, now);
    store.save_plan(&plan)?;
    store.release_lease(None)?;
    store.clear_stop()?;
    warn!(plan_id = %plan.id, "Plan abandoned by its runner, marked failed");
    Ok(Some(plan))
}

fn abandon(plan: &mut Plan, now: DateTime<Utc>) {
    for task in plan.phases.iter_mut().flat_map(|p| p.tasks.iter_mut()) {
        if task.state == TaskState::Running {
            task.state = TaskState::Failed;
            task.failure = Some(TaskFailure::new(
                FailureKind::ExecutionExpired,
                format!(
                    "Task \"{}\" abandoned: the process running the plan stopped",
                    task.description
                ),
            ));
        }
    }
    plan.state = PlanState::Failed;
    plan.finished_at = Some(now);
}

/// Renews the run lease and forwards the stop flag to the executor. Runs
/// until aborted.
async fn poll_stop_requests(
    store: SharedStore,
    plan: Arc<RwLock<Plan>>,
    stop: watch::Sender<bool>,
    owner: String,
    interval: Duration,
) {
    let mut stopping = false;
    loop {
        tokio::time::sleep(interval).await;
        let polled = with_store(&store, |s| -> Result<_, StateStoreError> {
            Ok((s.renew_lease(&owner)?, s.stop_requested()?))
        });
        match polled {
            Ok((renewed, requested)) => {
                if !renewed {
                    warn!(owner = %owner, "Run lease is no longer held");
                }
                if requested && !stopping {
                    stopping = true;
                    let mut p = plan.write().await;
                    if p.state == PlanState::Running {
                        p.state = PlanState::Stopping;
                    }
                    info!(plan_id = %p.id, "Stopping plan");
                    let _ = stop.send(true);
                }
            }
            Err(e) => warn!(error = %e, "Failed to poll plan control"),
        }
    }
}

/// Applies the outcome of a finished plan to the snapshot records.
fn settle_records(store: &StateStore, plan: &Plan) -> Result<(), StateStoreError> {
    let key = record_key(plan.request.tag.as_ref());

    match (plan.operation(), plan.state) {
        (Operation::Create, PlanState::Complete) => {
            let now = Utc::now();
            let mut record = store.get_snapshot(key)?.unwrap_or_else(|| SnapshotRecord {
                key: key.to_string(),
                tag: plan.request.tag.clone(),
                state: RecordState::Initial,
                created_at: now,
                timestamp: None,
                nodes: plan.scope_nodes.clone(),
                plan_id: plan.id,
                model_fingerprint: plan.model_fingerprint.clone(),
            });
            record.state = RecordState::Applied;
            record.timestamp = Some(now);
            store.put_snapshot(&record)?;
            info!(snapshot = key, "Snapshot set applied");
        }
        (Operation::Remove, PlanState::Complete) => {
            store.delete_snapshot(key)?;
            info!(snapshot = key, "Snapshot set removed");
        }
        (Operation::Restore, PlanState::Complete) => {
            store.delete_snapshot(DEPLOYMENT_SNAPSHOT)?;
            info!("Deployment snapshot consumed by restore");
        }
        (operation, state) => {
            debug!(%operation, %state, "Snapshot records left unchanged");
        }
    }
    Ok(())
}

/// Whether `record` is the `Initial` record installed by `plan`, a create
/// plan that never ran.
fn is_unrun_record(plan: &Plan, record: &SnapshotRecord) -> bool {
    plan.operation() == Operation::Create
        && plan.state == PlanState::Initial
        && record.plan_id == plan.id
        && record.state == RecordState::Initial
}

/// Drops the `Initial` record installed by a create plan that never ran.
fn discard_unrun_record(store: &StateStore, plan: &Plan) -> Result<(), StateStoreError> {
    let key = record_key(plan.request.tag.as_ref());
    if let Some(record) = store.get_snapshot(key)? {
        if is_unrun_record(plan, &record) {
            store.delete_snapshot(key)?;
            debug!(snapshot = key, "Discarded record of unrun plan");
        }
    }
    Ok(())
}
