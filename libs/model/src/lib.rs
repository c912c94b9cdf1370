//! # volsnap-model
//!
//! The declarative deployment model the snapshot engine plans against.
//!
//! A [`Model`] is an immutable snapshot of the management server, its
//! clusters and their storage, loaded from TOML and validated once. Plan
//! generation takes a `&Model` per request; nothing in the engine mutates it.
//!
//! ## Layout
//!
//! ```toml
//! [management_server]
//! hostname = "ms1"
//!
//! [[clusters]]
//! id = "c1"
//! dependency_list = ["c2"]
//!
//! [[clusters.nodes]]
//! hostname = "node1"
//!
//! [[clusters.nodes.volume_groups]]
//! id = "vg1"
//! volume_group_name = "vg_app"
//!
//! [[clusters.nodes.volume_groups.file_systems]]
//! id = "data"
//! type = "ext4"
//! mount_point = "/data"
//! size = "10G"
//! snap_size = 20
//! ```
//!
//! Volume groups under a node are LVM; volume groups under a cluster are
//! shared VxVM disk groups.

mod error;
mod size;
mod types;

pub use error::{ModelError, ModelResult};
pub use size::Size;
pub use types::*;
