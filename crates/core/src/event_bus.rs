//! Event bus for in-app analytics. Components accept an `Arc<dyn EventSink>`
//! and emit one event per message resolution or expiry.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InAppEvent {
    pub event_id: Uuid,
    pub schedule_id: String,
    pub message_id: String,
    /// Opaque campaign attribution copied from the message.
    pub campaigns: Option<Value>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl InAppEvent {
    /// The `type` field of the payload.
    pub fn event_type(&self) -> &str {
        self.payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }
}

/// Trait for emitting analytics events. Implementations forward events to
/// whatever transport the host app uses.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: InAppEvent);
}

/// No-op sink for hosts that don't collect analytics.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: InAppEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<InAppEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<InAppEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_type(&self, event_type: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: InAppEvent) {
        self.events.lock().push(event);
    }
}

pub fn make_event(
    schedule_id: impl Into<String>,
    message_id: impl Into<String>,
    campaigns: Option<Value>,
    payload: Value,
) -> InAppEvent {
    InAppEvent {
        event_id: Uuid::new_v4(),
        schedule_id: schedule_id.into(),
        message_id: message_id.into(),
        campaigns,
        payload,
        timestamp: Utc::now(),
    }
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
