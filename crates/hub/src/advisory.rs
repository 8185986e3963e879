//! Advisory dispatch: after a reading is stored, ask the external analysis
//! agent whether the plant needs attention and push an alert if it does.
//!
//! Dispatch runs on a detached task that may outlive the request which
//! triggered it. Nothing waits on it and nothing can cancel it; if the
//! process exits mid-flight the advice is simply lost. Failures are logged
//! and recorded in the activity feed, never retried and never persisted.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::db::Plant;
use crate::error::Result;
use crate::notify::Notifier;
use crate::state::SharedState;

const SECS_PER_DAY: i64 = 86_400;

/// Body of `POST /analyze`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvisoryRequest {
    pub plant_name: String,
    pub plant_age_days: i64,
    pub moisture_percentage: i64,
}

/// The agent's verdict. Extra fields in the response are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct AdvisoryDecision {
    pub alert_needed: bool,
    pub advice: String,
}

/// Whole days since planting, rounded down.
pub fn plant_age_days(date_planted: OffsetDateTime, now: OffsetDateTime) -> i64 {
    (now - date_planted).whole_seconds().div_euclid(SECS_PER_DAY)
}

impl AdvisoryRequest {
    pub fn new(plant: &Plant, moisture_percentage: i64, now: OffsetDateTime) -> Self {
        Self {
            plant_name: plant.name.clone(),
            plant_age_days: plant_age_days(plant.date_planted, now),
            moisture_percentage,
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    client: reqwest::Client,
    analyze_url: String,
    notifier: Notifier,
    shared: SharedState,
}

impl Dispatcher {
    pub fn new(
        client: reqwest::Client,
        agent_url: &str,
        notifier: Notifier,
        shared: SharedState,
    ) -> Self {
        Self {
            client,
            analyze_url: format!("{}/analyze", agent_url.trim_end_matches('/')),
            notifier,
            shared,
        }
    }

    /// Start advisory work for a freshly stored reading and return at once.
    pub fn spawn(&self, plant: Plant, moisture_percentage: i64) {
        let this = self.clone();
        tokio::spawn(async move {
            this.run(&plant, moisture_percentage).await;
        });
    }

    /// One advisory round: ask the agent, then alert if it says so.
    pub async fn run(&self, plant: &Plant, moisture_percentage: i64) {
        let request = AdvisoryRequest::new(plant, moisture_percentage, OffsetDateTime::now_utc());

        let decision = match self.analyze(&request).await {
            Ok(d) => d,
            Err(e) => {
                warn!(plant = %plant.name, sensor = %plant.sensor_id, "advisory abandoned: {e}");
                self.shared.write().await.record_error(e.to_string());
                return;
            }
        };

        if !decision.alert_needed {
            info!(plant = %plant.name, moisture = moisture_percentage, "status ok");
            self.shared
                .write()
                .await
                .record_advice(&plant.name, &decision.advice);
            return;
        }

        warn!(plant = %plant.name, moisture = moisture_percentage, "ALERT: {}", decision.advice);
        self.shared
            .write()
            .await
            .record_alert(&plant.name, &decision.advice);

        if let Err(e) = self.notifier.notify(&decision.advice).await {
            self.shared.write().await.record_error(e.to_string());
        }
    }

    /// Non-2xx and undecodable bodies count as the agent being unavailable.
    pub async fn analyze(&self, request: &AdvisoryRequest) -> Result<AdvisoryDecision> {
        let resp = self
            .client
            .post(&self.analyze_url)
            .json(request)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json::<AdvisoryDecision>().await?)
    }
}
