//! Event envelope - the common wrapper for all plan events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use volsnap_id::{EventId, PlanId, RequestId};

use crate::EventError;

/// Schema version stamped on every envelope.
pub const SCHEMA_VERSION: i32 = 1;

/// Actor type for audit logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// An operator invoking the CLI.
    User,
    /// The engine itself (executor, liveness probe).
    #[default]
    System,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::System => write!(f, "system"),
        }
    }
}

/// The event envelope - common metadata for all plan events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<P> {
    /// Monotonic event identifier within one plan run.
    pub event_id: EventId,

    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,

    /// The plan this event belongs to.
    pub plan_id: PlanId,

    /// The event type (e.g., "plan.started", "task.failed").
    pub event_type: String,

    /// Schema version for this event type.
    pub event_version: i32,

    /// Type of actor that triggered the event.
    pub actor_type: ActorType,

    /// Identifier of the actor.
    pub actor_id: String,

    /// Request correlation ID for tracing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,

    /// Event-specific payload.
    pub payload: P,
}

impl<P> EventEnvelope<P> {
    /// Creates a new event envelope builder.
    pub fn builder() -> EventEnvelopeBuilder<P> {
        EventEnvelopeBuilder::new()
    }
}

/// Builder for constructing event envelopes.
#[derive(Debug)]
pub struct EventEnvelopeBuilder<P> {
    event_id: Option<EventId>,
    plan_id: Option<PlanId>,
    event_type: Option<String>,
    actor_type: ActorType,
    actor_id: Option<String>,
    request_id: Option<RequestId>,
    payload: Option<P>,
}

impl<P> EventEnvelopeBuilder<P> {
    pub fn new() -> Self {
        Self {
            event_id: None,
            plan_id: None,
            event_type: None,
            actor_type: ActorType::System,
            actor_id: None,
            request_id: None,
            payload: None,
        }
    }

    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    pub fn plan_id(mut self, plan_id: PlanId) -> Self {
        self.plan_id = Some(plan_id);
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn actor(mut self, actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        self.actor_type = actor_type;
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn payload(mut self, payload: P) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Builds the event envelope.
    ///
    /// Stamps the current time; the actor defaults to the engine.
    pub fn build(self) -> Result<EventEnvelope<P>, EventError> {
        Ok(EventEnvelope {
            event_id: self.event_id.ok_or(EventError::MissingField("event_id"))?,
            occurred_at: Utc::now(),
            plan_id: self.plan_id.ok_or(EventError::MissingField("plan_id"))?,
            event_type: self
                .event_type
                .ok_or(EventError::MissingField("event_type"))?,
            event_version: SCHEMA_VERSION,
            actor_type: self.actor_type,
            actor_id: self.actor_id.unwrap_or_else(|| "volsnap-engine".to_string()),
            request_id: self.request_id,
            payload: self.payload.ok_or(EventError::MissingField("payload"))?,
        })
    }
}

impl<P> Default for EventEnvelopeBuilder<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_type_serialization() {
        assert_eq!(serde_json::to_string(&ActorType::User).unwrap(), "\"user\"");
        assert_eq!(
            serde_json::to_string(&ActorType::System).unwrap(),
            "\"system\""
        );
    }

    #[test]
    fn test_event_envelope_builder() {
        let plan_id = PlanId::new();
        let envelope = EventEnvelope::<serde_json::Value>::builder()
            .event_id(EventId::FIRST)
            .plan_id(plan_id)
            .event_type("plan.started")
            .payload(serde_json::json!({"operation": "create"}))
            .build()
            .unwrap();

        assert_eq!(envelope.event_type, "plan.started");
        assert_eq!(envelope.event_version, 1);
        assert_eq!(envelope.plan_id, plan_id);
        assert_eq!(envelope.actor_type, ActorType::System);
        assert_eq!(envelope.actor_id, "volsnap-engine");
    }

    #[test]
    fn test_event_envelope_builder_missing_field() {
        let result = EventEnvelope::<serde_json::Value>::builder()
            .event_id(EventId::FIRST)
            .event_type("plan.started")
            .payload(serde_json::Value::Null)
            .build();

        assert!(matches!(result, Err(EventError::MissingField("plan_id"))));
    }

    #[test]
    fn test_request_id_omitted_when_absent() {
        let envelope = EventEnvelope::builder()
            .event_id(EventId::FIRST)
            .plan_id(PlanId::new())
            .event_type("plan.warning")
            .payload(1u8)
            .build()
            .unwrap();

        let json = serde_json::to_value(&envelope).unwrap();
        assert!(json.get("request_id").is_none());
    }
}
