//! Event bridge to the UI collaborator.
//!
//! The engine reports state changes and operator-facing notifications as
//! named events with JSON payloads; the embedding shell decides how to
//! render them. Event names:
//! - `network_status`  — `{ "isOnline": bool }`
//! - `sync_status`     — pending counts and last sync time
//! - `notification`    — `{ "severity", "message", ... }` shown to the operator

use serde_json::Value;
use std::sync::Mutex;

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &str, payload: Value);
}

/// Discards every event. For headless embedding and tests that don't
/// observe events.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: &str, _payload: Value) {}
}

/// Buffers events for a polling consumer.
pub struct BufferedEventSink {
    events: Mutex<Vec<(String, Value)>>,
}

impl BufferedEventSink {
    pub fn new() -> Self {
        BufferedEventSink {
            events: Mutex::new(Vec::new()),
        }
    }

    /// Drain all buffered events, oldest first.
    pub fn take(&self) -> Vec<(String, Value)> {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *events)
    }

    /// Payloads of buffered events with the given name, without draining.
    pub fn named(&self, event: &str) -> Vec<Value> {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

impl Default for BufferedEventSink {
    fn default() -> Self {
        BufferedEventSink::new()
    }
}

impl EventSink for BufferedEventSink {
    fn emit(&self, event: &str, payload: Value) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.push((event.to_string(), payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffered_sink_collects_in_order() {
        let sink = BufferedEventSink::new();
        sink.emit("sync_status", serde_json::json!({ "pending": 2 }));
        sink.emit("notification", serde_json::json!({ "message": "hi" }));

        assert_eq!(sink.named("sync_status").len(), 1);
        let events = sink.take();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, "sync_status");
        assert!(sink.take().is_empty());
    }
}
