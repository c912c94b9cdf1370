//! # volsnap-id
//!
//! Typed identifiers for the volsnap snapshot engine.
//!
//! Two families of identifier live here:
//!
//! - **Generated IDs** (`PlanId`, `RequestId`): system-generated, prefixed
//!   ULIDs in the form `{prefix}_{ulid}`, e.g. `plan_01HV4Z2WQXKJNM8GPQY6VBKC3D`.
//! - **Model names** (`NodeId`, `ClusterId`, `VolumeGroupId`, `FileSystemId`):
//!   operator-chosen item names from the deployment model, validated once at
//!   the boundary so the rest of the engine can treat them as opaque keys.
//!
//! Keeping each kind in its own newtype stops a node hostname from being
//! passed where a cluster id is expected.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use macros::{validate_name, MAX_NAME_LEN};
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
