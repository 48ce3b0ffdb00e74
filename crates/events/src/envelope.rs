use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tradeflow_core::{MilestoneId, OptionId, UserId};

use crate::event::{EventPayload, EventType};

/// Human-traceable event identifier: `{type}_{entity keys}_{unix nanos}`.
///
/// Not guaranteed unique: two envelopes for the same entities built within the
/// clock's resolution share an id. Use it for tracing, not as an idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn generate(event_type: EventType, keys: &RoutingKeys, at: DateTime<Utc>) -> Self {
        let mut id = String::from(event_type.as_str());
        for key in keys.values() {
            id.push('_');
            id.push_str(&key.to_string());
        }
        let nanos = at
            .timestamp_nanos_opt()
            .unwrap_or_else(|| at.timestamp_micros().saturating_mul(1_000));
        id.push('_');
        id.push_str(&nanos.to_string());
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for EventId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EventId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Entity identifiers an event concerns.
///
/// Used for filtering and metrics only; delivery order never depends on them.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingKeys {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub milestone_id: Option<MilestoneId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub option_id: Option<OptionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

impl RoutingKeys {
    /// Present keys in milestone, option, user order.
    fn values(&self) -> impl Iterator<Item = i64> {
        [
            self.milestone_id.map(MilestoneId::get),
            self.option_id.map(OptionId::get),
            self.user_id.map(UserId::get),
        ]
        .into_iter()
        .flatten()
    }
}

/// Envelope for an event travelling through a queue.
///
/// This is the unit appended to a stream (JSON-encoded into the `event` field).
///
/// Notes:
/// - **Immutable** once built; a failed delivery republishes a copy produced by
///   [`EventEnvelope::with_retry`].
/// - `timestamp` is producer-side emission time in unix seconds.
/// - `retry` counts failed handler invocations, starting at 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    id: EventId,

    #[serde(flatten)]
    routing: RoutingKeys,

    #[serde(flatten)]
    payload: EventPayload,

    timestamp: i64,

    #[serde(default)]
    retry: u32,
}

impl EventEnvelope {
    /// Build an envelope stamped with the current time.
    pub fn new(payload: impl Into<EventPayload>) -> Self {
        Self::new_at(payload, Utc::now())
    }

    /// Build an envelope stamped with an explicit time (deterministic in tests).
    pub fn new_at(payload: impl Into<EventPayload>, at: DateTime<Utc>) -> Self {
        let payload = payload.into();
        let routing = payload.routing_keys();
        Self {
            id: EventId::generate(payload.event_type(), &routing, at),
            routing,
            payload,
            timestamp: at.timestamp(),
            retry: 0,
        }
    }

    /// Copy of this envelope carrying a different retry count.
    pub fn with_retry(&self, retry: u32) -> Self {
        Self {
            retry,
            ..self.clone()
        }
    }

    pub fn id(&self) -> &EventId {
        &self.id
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    pub fn routing_keys(&self) -> &RoutingKeys {
        &self.routing
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    pub fn into_payload(self) -> EventPayload {
        self.payload
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn retry_count(&self) -> u32 {
        self.retry
    }
}
