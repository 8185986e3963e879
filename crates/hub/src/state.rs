use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

pub fn shared() -> SharedState {
    Arc::new(RwLock::new(SystemState::new()))
}

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub sensors: HashMap<String, SensorState>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct SensorState {
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub plant_name: String,
    pub moisture_percentage: i64,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Advice,
    Alert,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub sensors: HashMap<String, SensorState>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            sensors: HashMap::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Record a reading that made it into the ledger.
    pub fn record_reading(&mut self, sensor_id: &str, plant_name: &str, moisture_percentage: i64) {
        self.sensors.insert(
            sensor_id.to_string(),
            SensorState {
                last_seen: OffsetDateTime::now_utc(),
                plant_name: plant_name.to_string(),
                moisture_percentage,
            },
        );

        self.push_event(
            EventKind::Reading,
            format!("{sensor_id} ({plant_name}): {moisture_percentage}%"),
        );
    }

    /// Record an advisory decision that did not require an alert.
    pub fn record_advice(&mut self, plant_name: &str, advice: &str) {
        self.push_event(EventKind::Advice, format!("{plant_name}: {advice}"));
    }

    /// Record an alert handed to the notifier.
    pub fn record_alert(&mut self, plant_name: &str, advice: &str) {
        self.push_event(EventKind::Alert, format!("{plant_name}: {advice}"));
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Broker session is up. A failed subscribe is kept in the feed; the
    /// next reconnect retries it.
    pub fn record_mqtt_connected<E: Display>(&mut self, subscribed: Result<(), E>) {
        self.mqtt_connected = true;
        self.record_system("mqtt connected".to_string());
        if let Err(e) = subscribed {
            self.record_error(format!("mqtt subscribe failed: {e}"));
        }
    }

    /// Build the JSON-serialisable status snapshot, newest events first.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            sensors: self.sensors.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reading_updates_sensor_and_feed() {
        let mut st = SystemState::new();
        st.record_reading("S1", "Basil", 42);

        let sensor = &st.sensors["S1"];
        assert_eq!(sensor.moisture_percentage, 42);
        assert_eq!(sensor.plant_name, "Basil");
        assert_eq!(st.events.len(), 1);
        assert_eq!(st.events[0].kind, EventKind::Reading);
        assert_eq!(st.events[0].detail, "S1 (Basil): 42%");
    }

    #[test]
    fn ring_buffer_drops_oldest() {
        let mut st = SystemState::new();
        for i in 0..(MAX_EVENTS + 10) {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        assert_eq!(st.events.front().unwrap().detail, "event 10");
    }

    #[test]
    fn failed_subscribe_is_recorded_not_fatal() {
        let mut st = SystemState::new();
        st.record_mqtt_connected(Err("request channel closed"));

        assert!(st.mqtt_connected);
        let kinds: Vec<EventKind> = st.events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::System, EventKind::Error]);
        assert_eq!(st.events[1].detail, "mqtt subscribe failed: request channel closed");

        st.record_mqtt_connected(Ok::<(), &str>(()));
        assert_eq!(st.events.len(), 3);
        assert_eq!(st.events[2].kind, EventKind::System);
    }

    #[test]
    fn status_lists_newest_first() {
        let mut st = SystemState::new();
        st.record_system("first".into());
        st.record_alert("Basil", "water now");

        let status = st.to_status();
        assert_eq!(status.events[0].kind, EventKind::Alert);
        assert_eq!(status.events[1].detail, "first");

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["events"][0]["kind"], "alert");
        assert_eq!(json["mqtt_connected"], false);
    }
}
