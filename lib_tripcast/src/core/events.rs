//! # Broadcast Events
//!
//! The three event types viewers receive, and their text framing for a
//! server-push stream.

use serde_json::{json, Value};

/// Named type of a broadcast event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// An enriched telemetry sample.
    TelematicsUpdate,
    /// A device connectivity transition.
    StatusUpdate,
    /// The current set of active trips.
    TripListUpdate,
}

impl EventKind {
    /// Wire name of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TelematicsUpdate => "telematics-update",
            EventKind::StatusUpdate => "status-update",
            EventKind::TripListUpdate => "trip-list-update",
        }
    }
}

/// One published event: a type name plus a JSON payload.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastEvent {
    /// Event type.
    pub kind: EventKind,
    /// Structured payload.
    pub payload: Value,
}

impl BroadcastEvent {
    /// Wraps a payload.
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self { kind, payload }
    }

    /// `status-update` carrying a device status label.
    pub fn status_update(device_status: &str) -> Self {
        Self::new(EventKind::StatusUpdate, json!({ "deviceStatus": device_status }))
    }

    /// `trip-list-update` carrying the active trip ids.
    pub fn trip_list_update(active_trips: &[String]) -> Self {
        Self::new(EventKind::TripListUpdate, json!({ "activeTrips": active_trips }))
    }

    /// Serialises the payload as compact JSON.
    pub fn data(&self) -> String {
        self.payload.to_string()
    }

    /// Full `text/event-stream` frame: `event:` line, `data:` line, blank line.
    pub fn to_sse_frame(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.kind.as_str(), self.data())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_frame_matches_wire_format() {
        let frame = BroadcastEvent::status_update("Device Connected").to_sse_frame();
        assert_eq!(
            frame,
            "event: status-update\ndata: {\"deviceStatus\":\"Device Connected\"}\n\n"
        );
    }

    #[test]
    fn trip_list_payload_keeps_order() {
        let ids = vec!["a".to_string(), "b".to_string()];
        let event = BroadcastEvent::trip_list_update(&ids);
        assert_eq!(event.kind.as_str(), "trip-list-update");
        assert_eq!(event.payload["activeTrips"], json!(["a", "b"]));
    }
}
