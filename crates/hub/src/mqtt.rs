use serde::Deserialize;

pub(crate) const TELEMETRY_TOPIC: &str = "tele/+/reading";

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct TelemetryMsg {
    pub(crate) raw_value: i64,
}

// ---------------------------------------------------------------------------
// Topic helpers
// ---------------------------------------------------------------------------

/// Extract sensor_id from "tele/<sensor_id>/reading".
pub(crate) fn extract_sensor_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "tele" && parts[2] == "reading" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

// ===========================================================================
// Tests
// ===========================================================================
