//! Ingestion surface shared by the HTTP and MQTT front ends.

use time::OffsetDateTime;
use tracing::{info, warn};

use crate::advisory::Dispatcher;
use crate::db::{Db, Plant, Reading, Sensor};
use crate::error::{PipelineError, Result};
use crate::state::SharedState;

/// Sensor ids are compared trimmed, whichever front end they arrive on.
fn sensor_key(sensor_id: &str) -> Result<&str> {
    let key = sensor_id.trim();
    if key.is_empty() {
        return Err(PipelineError::Validation(
            "missing required field: sensor_id".to_string(),
        ));
    }
    Ok(key)
}

#[derive(Clone)]
pub struct Pipeline {
    db: Db,
    dispatcher: Dispatcher,
    shared: SharedState,
}

impl Pipeline {
    pub fn new(db: Db, dispatcher: Dispatcher, shared: SharedState) -> Self {
        Self {
            db,
            dispatcher,
            shared,
        }
    }

    pub fn shared(&self) -> &SharedState {
        &self.shared
    }

    pub async fn calibrate(&self, sensor_id: &str, dry_reference: i64, wet_reference: i64) -> Result<()> {
        let sensor_id = sensor_key(sensor_id)?;
        self.db
            .upsert_calibration(sensor_id, dry_reference, wet_reference)
            .await?;
        info!(sensor = %sensor_id, dry_reference, wet_reference, "calibration saved");
        Ok(())
    }

    pub async fn configure_plant(
        &self,
        sensor_id: &str,
        name: &str,
        date_planted: OffsetDateTime,
    ) -> Result<Plant> {
        let sensor_id = sensor_key(sensor_id)?;
        let plant = self
            .db
            .upsert_plant_configuration(sensor_id, name, date_planted)
            .await?;
        info!(sensor = %sensor_id, plant = %plant.name, plant_id = plant.id, "plant configured");
        Ok(plant)
    }

    /// Store a raw reading and return its moisture percentage. Advisory work
    /// is handed off to a detached task before this returns, so the caller's
    /// acknowledgment never waits on the agent or the relay.
    pub async fn submit_reading(&self, sensor_id: &str, raw_value: i64) -> Result<i64> {
        let sensor_id = sensor_key(sensor_id)?;
        let ingested = match self.db.insert_reading(sensor_id, raw_value).await {
            Ok(i) => i,
            Err(e) => {
                warn!(sensor = %sensor_id, raw_value, "reading rejected: {e}");
                return Err(e);
            }
        };
        let moisture = ingested.moisture_percentage;

        info!(
            sensor = %sensor_id,
            raw_value,
            moisture,
            plant = %ingested.plant.name,
            "reading stored"
        );
        self.shared
            .write()
            .await
            .record_reading(sensor_id, &ingested.plant.name, moisture);

        self.dispatcher.spawn(ingested.plant, moisture);
        Ok(moisture)
    }

    pub async fn readings(&self, sensor_id: &str, limit: i64) -> Result<Vec<Reading>> {
        self.db.fetch_readings(sensor_key(sensor_id)?, limit).await
    }

    pub async fn sensors(&self) -> Result<Vec<Sensor>> {
        self.db.list_sensors().await
    }

    pub async fn current_plant(&self, sensor_id: &str) -> Result<Option<Plant>> {
        self.db.find_current_plant(sensor_key(sensor_id)?).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::tests::seeded_db;
    use crate::notify::Notifier;
    use crate::state;
    use crate::testutil::{fake_relay, serve, unreachable_url, Deliveries};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    pub(crate) fn pipeline_with(db: Db, agent_url: &str, relay_url: &str, target: Option<&str>) -> Pipeline {
        let shared = state::shared();
        let client = reqwest::Client::new();
        let notifier = Notifier::new(client.clone(), relay_url, target.map(str::to_string));
        let dispatcher = Dispatcher::new(client, agent_url, notifier, Arc::clone(&shared));
        Pipeline::new(db, dispatcher, shared)
    }

    /// Pipeline whose advisory agent is down.
    pub(crate) async fn offline_pipeline(db: Db) -> Pipeline {
        let agent = unreachable_url().await;
        let relay = unreachable_url().await;
        pipeline_with(db, &agent, &relay, Some("garden"))
    }

    async fn wait_for_delivery(deliveries: &Deliveries) -> Vec<(String, String)> {
        for _ in 0..250 {
            let got = deliveries.lock().await.clone();
            if !got.is_empty() {
                return got;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no notification delivered");
    }

    #[tokio::test]
    async fn reading_is_acknowledged_while_agent_is_down() {
        let p = offline_pipeline(seeded_db().await).await;

        assert_eq!(p.submit_reading("S1", 550).await.unwrap(), 50);

        let history = p.readings("S1", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].moisture_percentage, 50);
        assert_eq!(p.shared().read().await.sensors["S1"].moisture_percentage, 50);
    }

    #[tokio::test]
    async fn rejected_reading_leaves_no_trace() {
        let p = offline_pipeline(seeded_db().await).await;

        let err = p.submit_reading("unknown", 550).await.unwrap_err();
        assert!(matches!(err, PipelineError::CalibrationMissing(_)));
        assert!(p.shared().read().await.events.is_empty());
    }

    #[tokio::test]
    async fn ack_does_not_wait_on_a_hanging_agent() {
        let agent = serve(Router::new().route(
            "/analyze",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Json(json!({"alert_needed": false, "advice": ""}))
            }),
        ))
        .await;
        let (relay, deliveries) = fake_relay().await;
        let p = pipeline_with(seeded_db().await, &agent, &relay, Some("garden"));

        let moisture = tokio::time::timeout(Duration::from_secs(2), p.submit_reading("S1", 550))
            .await
            .expect("acknowledgment waited on the agent")
            .unwrap();
        assert_eq!(moisture, 50);
        assert_eq!(p.readings("S1", 10).await.unwrap().len(), 1);
        assert!(deliveries.lock().await.is_empty());
    }

    #[tokio::test]
    async fn sensor_ids_are_trimmed() {
        let p = offline_pipeline(crate::db::tests::test_db().await).await;

        p.calibrate(" S1", 800, 300).await.unwrap();
        p.configure_plant("S1 ", "Basil", OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert_eq!(p.submit_reading("S1 ", 550).await.unwrap(), 50);

        let sensors = p.sensors().await.unwrap();
        assert_eq!(sensors.len(), 1);
        assert_eq!(sensors[0].sensor_id, "S1");
        assert_eq!(p.readings("S1", 10).await.unwrap().len(), 1);
        assert!(p.current_plant(" S1 ").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn blank_sensor_id_is_rejected() {
        let p = offline_pipeline(seeded_db().await).await;

        let err = p.submit_reading("  ", 550).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert!(p.readings("S1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn alert_reaches_relay_after_ack() {
        let agent = serve(Router::new().route(
            "/analyze",
            post(|| async { Json(json!({"alert_needed": true, "advice": "water now"})) }),
        ))
        .await;
        let (relay, deliveries) = fake_relay().await;
        let p = pipeline_with(seeded_db().await, &agent, &relay, Some("garden"));

        assert_eq!(p.submit_reading("S1", 760).await.unwrap(), 8);

        let got = wait_for_delivery(&deliveries).await;
        assert_eq!(got, vec![("garden".to_string(), "water now".to_string())]);
    }

    #[tokio::test]
    async fn configure_then_calibrate_then_submit() {
        let p = offline_pipeline(crate::db::tests::test_db().await).await;

        let plant = p
            .configure_plant("S7", "Chili", OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert_eq!(p.current_plant("S7").await.unwrap().unwrap().id, plant.id);

        p.calibrate("S7", 300, 800).await.unwrap();
        assert_eq!(p.sensors().await.unwrap().len(), 1);
        assert_eq!(p.submit_reading("S7", 800).await.unwrap(), 100);
    }
}
