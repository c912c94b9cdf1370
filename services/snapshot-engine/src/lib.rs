//! volsnap snapshot engine
//!
//! Plans and runs snapshot operations over a fleet of nodes: create and
//! remove LVM and VxVM snapshot sets, and roll a deployment back to its
//! snapshot with an ordered restart of every cluster.
//!
//! ## Architecture
//!
//! ```text
//! SnapshotService
//! ├── liveness       (reachability and disk group imports)
//! ├── generator      (request -> phased Plan, pure)
//! │   ├── inventory  (volumes derived from the model)
//! │   ├── naming     (snapshot names, sizes, tag limits)
//! │   └── resolver   (cluster restart order)
//! ├── executor       (phases in order, nodes in parallel)
//! │   └── actions    (task -> remote commands)
//! └── store          (SQLite records, current plan, stop flag)
//! ```
//!
//! ## Modules
//!
//! - `runner`: Remote command transport (SSH and simulated fleet)
//! - `plan`: Plan, phase and task types
//! - `store`: Local SQLite state persistence

pub mod actions;
pub mod config;
pub mod error;
pub mod executor;
pub mod generator;
pub mod inventory;
pub mod liveness;
pub mod naming;
pub mod plan;
pub mod resolver;
pub mod runner;
pub mod service;
pub mod store;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use executor::{NoCheckpoint, PlanCheckpoint, PlanExecutor};
pub use generator::generate_plan;
pub use liveness::LiveView;
pub use naming::SnapshotTag;
pub use plan::{Operation, Plan, PlanState, SnapshotRequest, TaskState};
pub use runner::{CommandRunner, FailureKind, MockRunner, SnapshotCondition, SshConfig, SshRunner};
pub use service::SnapshotService;
pub use store::{RecordState, SnapshotRecord, StateStore};
