//! Plan execution.
//!
//! The executor:
//! - Runs phases strictly in sequence
//! - Within a phase, drives each node's tasks sequentially and different
//!   nodes concurrently, bounded by `max_parallel_nodes`
//! - Bounds every task by its time budget
//! - Stops a node's remaining tasks after its first failure, lets the other
//!   nodes of the phase finish, then fails the plan
//! - Honours stop requests between tasks
//!
//! Progress is published as [`PlanEvent`]s on a broadcast channel and every
//! state change is handed to a [`PlanCheckpoint`].

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use tokio::sync::{broadcast, watch, RwLock, Semaphore};
use tracing::{debug, error, info, warn};
use volsnap_events::{
    ActorType, EventEnvelope, PhaseStartedPayload, PlanEvent, PlanFinishedPayload, PlanOutcome,
    PlanStartedPayload, PlanWarningPayload, TaskFailedPayload, TaskStartedPayload,
    TaskSucceededPayload,
};
use volsnap_id::{EventId, NodeId, PlanId, RequestId};

use crate::actions::execute_task;
use crate::config::EngineConfig;
use crate::plan::{Plan, PlanState, TaskFailure, TaskKind, TaskState};
use crate::runner::{CommandRunner, FailureKind};

/// Receives the plan after every state change.
pub trait PlanCheckpoint: Send + Sync {
    fn checkpoint(&self, plan: &Plan);
}

/// Checkpoint that discards updates.
pub struct NoCheckpoint;

impl PlanCheckpoint for NoCheckpoint {
    fn checkpoint(&self, _plan: &Plan) {}
}

/// Identity stamped on every event of one run.
#[derive(Debug, Clone)]
struct RunOrigin {
    plan_id: PlanId,
    request_id: RequestId,
    operator: Option<String>,
}

/// How a node's task group ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupOutcome {
    Done,
    Failed,
    Stopped,
}

/// Drives a plan against the fleet.
pub struct PlanExecutor {
    runner: Arc<dyn CommandRunner>,
    config: EngineConfig,
    events: broadcast::Sender<EventEnvelope<PlanEvent>>,
    sequence: AtomicI64,
}

impl PlanExecutor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        config: EngineConfig,
        events: broadcast::Sender<EventEnvelope<PlanEvent>>,
    ) -> Self {
        Self {
            runner,
            config,
            events,
            sequence: AtomicI64::new(EventId::FIRST.value()),
        }
    }

    /// Runs an `Initial` plan to a terminal state and returns that state.
    pub async fn run(
        &self,
        plan: Arc<RwLock<Plan>>,
        stop: watch::Receiver<bool>,
        checkpoint: &dyn PlanCheckpoint,
    ) -> PlanState {
        let (origin, phase_count) = {
            let mut p = plan.write().await;
            if p.state != PlanState::Initial {
                warn!(plan_id = %p.id, state = %p.state, "Plan is not runnable");
                return p.state;
            }
            p.state = PlanState::Running;
            p.started_at = Some(Utc::now());
            checkpoint.checkpoint(&p);
            let origin = RunOrigin {
                plan_id: p.id,
                request_id: p.request.request_id,
                operator: p.request.requested_by.clone(),
            };

            info!(
                plan_id = %p.id,
                request_id = %origin.request_id,
                operation = %p.operation(),
                phases = p.phases.len(),
                tasks = p.task_count(),
                "Running plan"
            );
            self.emit(
                &origin,
                PlanEvent::PlanStarted(PlanStartedPayload {
                    operation: p.operation().to_string(),
                    tag: p.request.tag.as_ref().map(ToString::to_string),
                    force: p.request.force,
                    phase_count: p.phases.len(),
                    task_count: p.task_count(),
                }),
            );
            for warning in &p.warnings {
                self.emit(
                    &origin,
                    PlanEvent::PlanWarning(PlanWarningPayload {
                        message: warning.clone(),
                    }),
                );
            }
            (origin, p.phases.len())
        };

        let mut outcome = PlanOutcome::Complete;
        for phase in 0..phase_count {
            if *stop.borrow() {
                outcome = PlanOutcome::Stopped;
                break;
            }
            match self.run_phase(&plan, &origin, phase, &stop, checkpoint).await {
                GroupOutcome::Done => {}
                GroupOutcome::Failed => {
                    outcome = PlanOutcome::Failed;
                    break;
                }
                GroupOutcome::Stopped => {
                    outcome = PlanOutcome::Stopped;
                    break;
                }
            }
        }

        let mut p = plan.write().await;
        p.state = match outcome {
            PlanOutcome::Complete => PlanState::Complete,
            PlanOutcome::Failed => PlanState::Failed,
            PlanOutcome::Stopped => PlanState::Stopped,
        };
        p.finished_at = Some(Utc::now());
        checkpoint.checkpoint(&p);

        let counts = p.counts();
        match outcome {
            PlanOutcome::Failed => {
                error!(plan_id = %origin.plan_id, failed = counts.failed, "Plan failed")
            }
            _ => info!(plan_id = %origin.plan_id, outcome = %outcome, "Plan finished"),
        }
        self.emit(
            &origin,
            PlanEvent::PlanFinished(PlanFinishedPayload {
                outcome,
                succeeded: counts.succeeded,
                failed: counts.failed,
                pending: counts.pending,
            }),
        );
        p.state
    }

    async fn run_phase(
        &self,
        plan: &RwLock<Plan>,
        origin: &RunOrigin,
        phase: usize,
        stop: &watch::Receiver<bool>,
        checkpoint: &dyn PlanCheckpoint,
    ) -> GroupOutcome {
        let groups = {
            let p = plan.read().await;
            let current = &p.phases[phase];
            info!(
                plan_id = %origin.plan_id,
                phase = phase + 1,
                description = %current.description,
                tasks = current.tasks.len(),
                "Starting phase"
            );
            self.emit(
                origin,
                PlanEvent::PhaseStarted(PhaseStartedPayload {
                    phase: phase + 1,
                    description: current.description.clone(),
                    task_count: current.tasks.len(),
                }),
            );

            // tasks per node, nodes in order of first appearance
            let mut groups: Vec<(NodeId, Vec<usize>)> = Vec::new();
            for (index, task) in current.tasks.iter().enumerate() {
                match groups.iter_mut().find(|(node, _)| node == &task.node) {
                    Some((_, indices)) => indices.push(index),
                    None => groups.push((task.node.clone(), vec![index])),
                }
            }
            groups
        };

        let semaphore = Semaphore::new(self.config.max_parallel_nodes.max(1));
        let runs = groups.iter().map(|(node, indices)| {
            let semaphore = &semaphore;
            async move {
                let _permit = semaphore.acquire().await.ok();
                debug!(node = %node, tasks = indices.len(), "Driving node");
                for &index in indices {
                    if *stop.borrow() {
                        return GroupOutcome::Stopped;
                    }
                    if !self.run_task(plan, origin, phase, index, checkpoint).await {
                        return GroupOutcome::Failed;
                    }
                }
                GroupOutcome::Done
            }
        });
        let outcomes = join_all(runs).await;

        if outcomes.contains(&GroupOutcome::Failed) {
            return GroupOutcome::Failed;
        }
        // A stop only counts if it left work in this phase undone.
        let undone = plan.read().await.phases[phase]
            .tasks
            .iter()
            .any(|t| t.state == TaskState::Pending);
        if undone {
            GroupOutcome::Stopped
        } else {
            GroupOutcome::Done
        }
    }

    /// Runs one task; returns whether it succeeded.
    async fn run_task(
        &self,
        plan: &RwLock<Plan>,
        origin: &RunOrigin,
        phase: usize,
        index: usize,
        checkpoint: &dyn PlanCheckpoint,
    ) -> bool {
        let task = {
            let mut p = plan.write().await;
            let task = &mut p.phases[phase].tasks[index];
            task.state = TaskState::Running;
            let task = task.clone();
            checkpoint.checkpoint(&p);
            task
        };

        info!(node = %task.node, task = task.kind.name(), "{}", task.description);
        self.emit(
            origin,
            PlanEvent::TaskStarted(TaskStartedPayload {
                phase: phase + 1,
                task: index + 1,
                node: task.node.clone(),
                description: task.description.clone(),
            }),
        );

        let budget = self
            .config
            .task_budget(matches!(task.kind, TaskKind::WaitForNodeRestart));
        let result = match tokio::time::timeout(
            budget,
            execute_task(self.runner.as_ref(), &self.config, &task),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TaskFailure::new(
                FailureKind::ExecutionExpired,
                format!(
                    "Task \"{}\" execution expired after {budget:?}",
                    task.description
                ),
            )),
        };

        let succeeded = result.is_ok();
        let mut p = plan.write().await;
        let slot = &mut p.phases[phase].tasks[index];
        match result {
            Ok(note) => {
                slot.state = TaskState::Success;
                slot.note = note.clone();
                if let Some(note) = &note {
                    info!(node = %task.node, "{note}");
                }
                self.emit(
                    origin,
                    PlanEvent::TaskSucceeded(TaskSucceededPayload {
                        phase: phase + 1,
                        task: index + 1,
                        node: task.node.clone(),
                        note,
                    }),
                );
            }
            Err(failure) => {
                error!(
                    node = %task.node,
                    task = task.kind.name(),
                    kind = %failure.kind,
                    "{}",
                    failure.message
                );
                self.emit(
                    origin,
                    PlanEvent::TaskFailed(TaskFailedPayload {
                        phase: phase + 1,
                        task: index + 1,
                        node: task.node.clone(),
                        kind: failure.kind.tag().to_string(),
                        message: failure.message.clone(),
                    }),
                );
                slot.state = TaskState::Failed;
                slot.failure = Some(failure);
            }
        }
        checkpoint.checkpoint(&p);
        succeeded
    }

    fn emit(&self, origin: &RunOrigin, event: PlanEvent) {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let mut builder = EventEnvelope::builder()
            .event_id(EventId::new(seq))
            .plan_id(origin.plan_id)
            .request_id(origin.request_id)
            .event_type(event.event_type());
        if let Some(operator) = &origin.operator {
            builder = builder.actor(ActorType::User, operator.clone());
        }
        let envelope = builder.payload(event).build();

        match envelope {
            // no subscribers is fine
            Ok(envelope) => {
                let _ = self.events.send(envelope);
            }
            Err(e) => warn!(error = %e, "Failed to build plan event"),
        }
    }
}
