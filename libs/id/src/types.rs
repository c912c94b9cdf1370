//! Typed identifier definitions.

use crate::{define_id, define_name};

// =============================================================================
// Generated IDs
// =============================================================================

define_id!(PlanId, "plan");
define_id!(RequestId, "req");

// =============================================================================
// Model names
// =============================================================================

define_name!(NodeId, "node");
define_name!(ClusterId, "cluster");
define_name!(VolumeGroupId, "volume group");
define_name!(FileSystemId, "file system");

// =============================================================================
// Events
// =============================================================================

/// Sequence number of an event within a single plan run.
///
/// Starts at 1 and increases by one for every event the executor emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(i64);

impl EventId {
    /// The first event of a run.
    pub const FIRST: Self = Self(1);

    /// Creates a new EventId from an i64.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the underlying i64 value.
    #[must_use]
    pub const fn value(&self) -> i64 {
        self.0
    }

    /// Returns the following sequence number.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for EventId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl serde::Serialize for EventId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for EventId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let id = i64::deserialize(deserializer)?;
        Ok(Self(id))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdError;
    use proptest::prelude::*;

    #[test]
    fn test_plan_id_roundtrip() {
        let id = PlanId::new();
        let parsed: PlanId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(id.to_string().starts_with("plan_"));
    }

    #[test]
    fn test_plan_id_invalid_prefix() {
        let result: Result<PlanId, _> = "req_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(result, Err(IdError::InvalidPrefix { .. })));
    }

    #[test]
    fn test_plan_id_missing_separator() {
        let result: Result<PlanId, _> = "plan01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(result, Err(IdError::MissingSeparator)));
    }

    #[test]
    fn test_plan_id_invalid_ulid() {
        let result: Result<PlanId, _> = "plan_invalid".parse();
        assert!(matches!(result, Err(IdError::InvalidUlid(_))));
    }

    #[test]
    fn test_plan_id_json_roundtrip() {
        let id = PlanId::new();
        let json = serde_json::to_string(&id).unwrap();
        let parsed: PlanId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_plan_ids_sortable() {
        let id1 = PlanId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = PlanId::new();
        assert!(id1 < id2);
    }

    #[test]
    fn test_node_name_accepts_hostnames() {
        for name in ["ms1", "node1", "sc-2", "db.node_3", "1node"] {
            let node = NodeId::parse(name).unwrap();
            assert_eq!(node.as_str(), name);
            assert_eq!(node.to_string(), name);
        }
    }

    #[test]
    fn test_name_rejects_bad_input() {
        assert!(matches!(NodeId::parse(""), Err(IdError::Empty)));
        assert!(matches!(
            ClusterId::parse("_c1"),
            Err(IdError::InvalidName { kind: "cluster", .. })
        ));
        assert!(matches!(
            VolumeGroupId::parse("vg root"),
            Err(IdError::InvalidName { .. })
        ));
        assert!(FileSystemId::parse(&"f".repeat(65)).is_err());
    }

    #[test]
    fn test_name_json_is_plain_string() {
        let vg = VolumeGroupId::parse("vg_root").unwrap();
        assert_eq!(serde_json::to_string(&vg).unwrap(), "\"vg_root\"");

        let bad: Result<NodeId, _> = serde_json::from_str("\"no/slash\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_name_borrows_as_str() {
        let mut set = std::collections::BTreeSet::new();
        set.insert(NodeId::parse("node1").unwrap());
        assert!(set.contains("node1"));
    }

    #[test]
    fn test_event_id_next() {
        let id = EventId::FIRST;
        assert_eq!(id.value(), 1);
        assert_eq!(id.next().value(), 2);

        let json = serde_json::to_string(&id).unwrap();
        let parsed: EventId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    proptest! {
        #[test]
        fn prop_valid_names_roundtrip(name in "[a-z0-9][a-z0-9_.-]{0,40}") {
            let node: NodeId = name.parse().unwrap();
            prop_assert_eq!(node.to_string(), name);
        }
    }
}
