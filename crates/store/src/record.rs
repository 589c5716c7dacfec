use chrono::{DateTime, Utc};
use common::EventId;
use serde::{Deserialize, Serialize};

/// An append-only event record.
///
/// At most one record exists per `idempotency_key`; the key guards the
/// *recording* of a fact, independently of the scope version that guarded
/// the *decision* which produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// Unique identifier for this event.
    pub event_id: EventId,

    /// Key guaranteeing at-most-once recording.
    pub idempotency_key: String,

    /// The stream (aggregate) type, e.g. "order", "product".
    pub stream_type: String,

    /// The stream (aggregate) instance ID.
    pub stream_id: String,

    /// The type of the event (e.g. "StockReserved").
    pub event_type: String,

    /// The event payload as JSON.
    pub payload: serde_json::Value,

    /// The bounded context the event belongs to.
    pub bounded_context: String,

    /// When the event was recorded.
    pub recorded_at: DateTime<Utc>,
}

impl EventRecord {
    /// Creates a new event record builder.
    pub fn builder() -> EventRecordBuilder {
        EventRecordBuilder::default()
    }
}

/// Builder for constructing event records.
#[derive(Debug, Default)]
pub struct EventRecordBuilder {
    event_id: Option<EventId>,
    idempotency_key: Option<String>,
    stream_type: Option<String>,
    stream_id: Option<String>,
    event_type: Option<String>,
    payload: Option<serde_json::Value>,
    bounded_context: Option<String>,
    recorded_at: Option<DateTime<Utc>>,
}

impl EventRecordBuilder {
    /// Sets the event ID. If not set, a new ID will be generated.
    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    /// Sets the idempotency key.
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Sets the stream type.
    pub fn stream_type(mut self, stream_type: impl Into<String>) -> Self {
        self.stream_type = Some(stream_type.into());
        self
    }

    /// Sets the stream ID.
    pub fn stream_id(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = Some(stream_id.into());
        self
    }

    /// Sets the event type.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Sets the payload from a raw JSON value.
    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Sets the bounded context.
    pub fn bounded_context(mut self, context: impl Into<String>) -> Self {
        self.bounded_context = Some(context.into());
        self
    }

    /// Sets the recorded-at timestamp. If not set, the current time is used.
    pub fn recorded_at(mut self, at: DateTime<Utc>) -> Self {
        self.recorded_at = Some(at);
        self
    }

    /// Builds the event record.
    ///
    /// # Panics
    ///
    /// Panics if required fields (idempotency_key, stream_type, stream_id,
    /// event_type, payload) are not set.
    pub fn build(self) -> EventRecord {
        EventRecord {
            event_id: self.event_id.unwrap_or_default(),
            idempotency_key: self.idempotency_key.expect("idempotency_key is required"),
            stream_type: self.stream_type.expect("stream_type is required"),
            stream_id: self.stream_id.expect("stream_id is required"),
            event_type: self.event_type.expect("event_type is required"),
            payload: self.payload.expect("payload is required"),
            bounded_context: self.bounded_context.unwrap_or_default(),
            recorded_at: self.recorded_at.unwrap_or_else(Utc::now),
        }
    }

    /// Tries to build the record, returning None if required fields are missing.
    pub fn try_build(self) -> Option<EventRecord> {
        Some(EventRecord {
            event_id: self.event_id.unwrap_or_default(),
            idempotency_key: self.idempotency_key?,
            stream_type: self.stream_type?,
            stream_id: self.stream_id?,
            event_type: self.event_type?,
            payload: self.payload?,
            bounded_context: self.bounded_context.unwrap_or_default(),
            recorded_at: self.recorded_at.unwrap_or_else(Utc::now),
        })
    }
}
