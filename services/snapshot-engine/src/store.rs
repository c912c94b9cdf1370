//! SQLite-based state store for the snapshot engine.
//!
//! Holds what must survive the process that ran a plan:
//! - Snapshot records, one per tag (`snapshot` for the deployment snapshot)
//! - The current plan, as a JSON document next to its state
//! - The stop flag, so `stop-plan` from another process reaches the runner
//! - The run lease, renewed by the process running the plan
//!
//! Claiming a plan is a compare-and-set on its state, and multi-step
//! changes go through [`StateStore::transaction`], which takes SQLite's
//! write lock up front. Two processes sharing a database therefore cannot
//! both install or both run a plan.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use volsnap_id::{NodeId, PlanId};

use crate::naming::SnapshotTag;
use crate::plan::{Plan, PlanState};

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state: {0}")]
    Invalid(String),

    #[error("State store lock poisoned")]
    Poisoned,
}

/// Lifecycle of a snapshot record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    /// The create plan has started but not completed.
    Initial,
    /// Every snapshot of the set was created.
    Applied,
}

impl RecordState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Applied => "applied",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "initial" => Some(Self::Initial),
            "applied" => Some(Self::Applied),
            _ => None,
        }
    }
}

impl std::fmt::Display for RecordState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initial => write!(f, "Initial"),
            Self::Applied => write!(f, "Applied"),
        }
    }
}

/// A persisted snapshot set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotRecord {
    /// Tag, or `snapshot` for the deployment snapshot.
    pub key: String,
    pub tag: Option<SnapshotTag>,
    pub state: RecordState,
    pub created_at: DateTime<Utc>,
    /// Set when the create plan completes.
    pub timestamp: Option<DateTime<Utc>>,
    /// Nodes covered when the set was created.
    pub nodes: BTreeSet<NodeId>,
    pub plan_id: PlanId,
    pub model_fingerprint: String,
}

impl SnapshotRecord {
    pub fn is_applied(&self) -> bool {
        self.state == RecordState::Applied
    }
}

/// The claim of one process on the running plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanLease {
    pub owner: String,
    pub renewed_at: DateTime<Utc>,
}

impl PlanLease {
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(self.renewed_at) > ttl
    }
}

fn state_column(state: PlanState) -> &'static str {
    match state {
        PlanState::Initial => "initial",
        PlanState::Running => "running",
        PlanState::Stopping => "stopping",
        PlanState::Stopped => "stopped",
        PlanState::Complete => "complete",
        PlanState::Failed => "failed",
    }
}

/// SQLite state store.
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    /// Open or create a state store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)?;

        // WAL lets `stop-plan` write while a plan is being checkpointed
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let store = Self { conn };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StateStoreError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS snapshots (
                key TEXT PRIMARY KEY,
                tag TEXT,
                state TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                timestamp INTEGER,
                nodes TEXT NOT NULL,
                plan_id TEXT NOT NULL,
                model_fingerprint TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS plan (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                plan_id TEXT NOT NULL,
                state TEXT NOT NULL,
                body TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS plan_control (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                stop_requested INTEGER NOT NULL DEFAULT 0,
                lease_owner TEXT,
                lease_renewed_at INTEGER
            );

            INSERT OR IGNORE INTO plan_control (id) VALUES (1);
            "#,
        )?;

        debug!("State store schema initialized");
        Ok(())
    }

    /// Runs `f` inside an immediate transaction, committing only if it
    /// returns `Ok`. Must not be nested.
    pub fn transaction<T, E>(&self, f: impl FnOnce(&Self) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StateStoreError>,
    {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .map_err(StateStoreError::from)?;
        let value = f(self)?;
        tx.commit().map_err(StateStoreError::from)?;
        Ok(value)
    }

    /// Get a snapshot record by key.
    pub fn get_snapshot(&self, key: &str) -> Result<Option<SnapshotRecord>, StateStoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT key, tag, state, created_at, timestamp, nodes, plan_id, model_fingerprint
                 FROM snapshots WHERE key = ?1",
                params![key],
                RawRecord::from_row,
            )
            .optional()?;

        row.map(RawRecord::into_record).transpose()
    }

    /// Insert or replace a snapshot record.
    pub fn put_snapshot(&self, record: &SnapshotRecord) -> Result<(), StateStoreError> {
        let nodes = serde_json::to_string(&record.nodes)?;
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO snapshots
                (key, tag, state, created_at, timestamp, nodes, plan_id, model_fingerprint)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                record.key,
                record.tag.as_ref().map(SnapshotTag::as_str),
                record.state.as_str(),
                record.created_at.timestamp_millis(),
                record.timestamp.map(|t| t.timestamp_millis()),
                nodes,
                record.plan_id.to_string(),
                record.model_fingerprint,
            ],
        )?;
        Ok(())
    }

    /// Delete a snapshot record. Returns whether it existed.
    pub fn delete_snapshot(&self, key: &str) -> Result<bool, StateStoreError> {
        let deleted = self
            .conn
            .execute("DELETE FROM snapshots WHERE key = ?1", params![key])?;
        Ok(deleted > 0)
    }

    /// All snapshot records, oldest first.
    pub fn list_snapshots(&self) -> Result<Vec<SnapshotRecord>, StateStoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT key, tag, state, created_at, timestamp, nodes, plan_id, model_fingerprint
             FROM snapshots ORDER BY created_at, key",
        )?;

        let rows = stmt.query_map([], RawRecord::from_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }

    /// Replace the current plan, whichever plan it is.
    pub fn save_plan(&self, plan: &Plan) -> Result<(), StateStoreError> {
        let body = serde_json::to_string(plan)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO plan (id, plan_id, state, body) VALUES (1, ?1, ?2, ?3)",
            params![plan.id.to_string(), state_column(plan.state), body],
        )?;
        Ok(())
    }

    /// Overwrite the current plan only if it is still `plan`. Returns whether
    /// it was written.
    pub fn update_plan(&self, plan: &Plan) -> Result<bool, StateStoreError> {
        let body = serde_json::to_string(plan)?;
        let updated = self.conn.execute(
            "UPDATE plan SET state = ?2, body = ?3 WHERE id = 1 AND plan_id = ?1",
            params![plan.id.to_string(), state_column(plan.state), body],
        )?;
        Ok(updated > 0)
    }

    /// Moves the stored plan from `initial` to `plan`'s state and takes the
    /// lease for `owner`, atomically. Returns false if the stored plan is a
    /// different plan or is no longer `initial`.
    pub fn claim_plan(&self, plan: &Plan, owner: &str) -> Result<bool, StateStoreError> {
        let body = serde_json::to_string(plan)?;
        self.transaction(|s| -> Result<bool, StateStoreError> {
            let claimed = s.conn.execute(
                "UPDATE plan SET state = ?2, body = ?3
                 WHERE id = 1 AND plan_id = ?1 AND state = 'initial'",
                params![plan.id.to_string(), state_column(plan.state), body],
            )?;
            if claimed == 0 {
                return Ok(false);
            }
            s.conn.execute(
                "UPDATE plan_control
                 SET stop_requested = 0, lease_owner = ?1, lease_renewed_at = ?2
                 WHERE id = 1",
                params![owner, Utc::now().timestamp_millis()],
            )?;
            debug!(plan_id = %plan.id, owner, "Plan claimed");
            Ok(true)
        })
    }

    /// Renews the lease if `owner` still holds it.
    pub fn renew_lease(&self, owner: &str) -> Result<bool, StateStoreError> {
        let renewed = self.conn.execute(
            "UPDATE plan_control SET lease_renewed_at = ?2 WHERE id = 1 AND lease_owner = ?1",
            params![owner, Utc::now().timestamp_millis()],
        )?;
        Ok(renewed > 0)
    }

    pub fn lease(&self) -> Result<Option<PlanLease>, StateStoreError> {
        let (owner, renewed_at): (Option<String>, Option<i64>) = self.conn.query_row(
            "SELECT lease_owner, lease_renewed_at FROM plan_control WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        match (owner, renewed_at) {
            (Some(owner), Some(ms)) => {
                let renewed_at = DateTime::from_timestamp_millis(ms)
                    .ok_or_else(|| StateStoreError::Invalid("bad lease timestamp".into()))?;
                Ok(Some(PlanLease { owner, renewed_at }))
            }
            _ => Ok(None),
        }
    }

    /// Drops the lease; with `Some(owner)` only if that owner holds it.
    pub fn release_lease(&self, owner: Option<&str>) -> Result<(), StateStoreError> {
        match owner {
            Some(owner) => self.conn.execute(
                "UPDATE plan_control SET lease_owner = NULL, lease_renewed_at = NULL
                 WHERE id = 1 AND lease_owner = ?1",
                params![owner],
            )?,
            None => self.conn.execute(
                "UPDATE plan_control SET lease_owner = NULL, lease_renewed_at = NULL WHERE id = 1",
                [],
            )?,
        };
        Ok(())
    }

    /// Load the current plan, if any.
    pub fn load_plan(&self) -> Result<Option<Plan>, StateStoreError> {
        let body: Option<String> = self
            .conn
            .query_row("SELECT body FROM plan WHERE id = 1", [], |row| row.get(0))
            .optional()?;

        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    /// Delete the current plan, clearing the stop flag and the lease.
    pub fn delete_plan(&self) -> Result<(), StateStoreError> {
        self.conn.execute("DELETE FROM plan WHERE id = 1", [])?;
        self.release_lease(None)?;
        self.clear_stop()
    }

    /// Ask the process running the plan to stop.
    pub fn request_stop(&self) -> Result<(), StateStoreError> {
        self.conn.execute(
            "UPDATE plan_control SET stop_requested = 1 WHERE id = 1",
            [],
        )?;
        Ok(())
    }

    pub fn stop_requested(&self) -> Result<bool, StateStoreError> {
        let flag: i64 = self.conn.query_row(
            "SELECT stop_requested FROM plan_control WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(flag != 0)
    }

    pub fn clear_stop(&self) -> Result<(), StateStoreError> {
        self.conn.execute(
            "UPDATE plan_control SET stop_requested = 0 WHERE id = 1",
            [],
        )?;
        Ok(())
    }
}

/// Columns of a `snapshots` row before conversion.
struct RawRecord {
    key: String,
    tag: Option<String>,
    state: String,
    created_at: i64,
    timestamp: Option<i64>,
    nodes: String,
    plan_id: String,
    model_fingerprint: String,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            tag: row.get(1)?,
            state: row.get(2)?,
            created_at: row.get(3)?,
            timestamp: row.get(4)?,
            nodes: row.get(5)?,
            plan_id: row.get(6)?,
            model_fingerprint: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<SnapshotRecord, StateStoreError> {
        let invalid = |what: &str| StateStoreError::Invalid(format!("{what} for record {}", self.key));

        let tag = match &self.tag {
            Some(t) => Some(SnapshotTag::parse(t).map_err(|_| invalid("bad tag"))?),
            None => None,
        };
        let state = RecordState::from_str(&self.state).ok_or_else(|| invalid("unknown state"))?;
        let created_at = DateTime::from_timestamp_millis(self.created_at)
            .ok_or_else(|| invalid("bad created_at"))?;
        let timestamp = match self.timestamp {
            Some(ms) => Some(DateTime::from_timestamp_millis(ms).ok_or_else(|| invalid("bad timestamp"))?),
            None => None,
        };
        let nodes = serde_json::from_str(&self.nodes)?;
        let plan_id = PlanId::parse(&self.plan_id).map_err(|_| invalid("bad plan id"))?;

        Ok(SnapshotRecord {
            key: self.key,
            tag,
            state,
            created_at,
            timestamp,
            nodes,
            plan_id,
            model_fingerprint: self.model_fingerprint,
        })
    }
}
