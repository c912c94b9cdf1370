//! # volsnap-events
//!
//! Progress events emitted while a snapshot plan runs.
//!
//! ## Design Principles
//!
//! - Events are immutable records of plan, phase and task transitions
//! - Every event belongs to exactly one plan run
//! - Events are versioned for schema evolution
//!
//! ## Event Envelope
//!
//! All events share a common envelope with:
//! - Per-run ordering (`event_id`, starting at 1)
//! - Plan identity (`plan_id`)
//! - Audit context (`actor_type`, `actor_id`, `request_id`)
//!
//! ## Event Types
//!
//! - Plan events (`plan.started`, `plan.warning`, `plan.finished`)
//! - Phase events (`phase.started`)
//! - Task events (`task.started`, `task.succeeded`, `task.failed`)

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
