mod advisory;
mod config;
mod db;
mod error;
mod mqtt;
mod notify;
mod pipeline;
mod state;
#[cfg(test)]
mod testutil;
mod web;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use advisory::Dispatcher;
use config::{MqttSettings, Settings};
use db::Db;
use mqtt::{extract_sensor_id, TelemetryMsg, TELEMETRY_TOPIC};
use notify::Notifier;
use pipeline::Pipeline;

#[tokio::main]
async fn main() -> Result<()> {
    // ── Env config ──────────────────────────────────────────────────
    // Load .env before the subscriber so RUST_LOG can live there too.
    let dotenv_loaded = dotenv::dotenv().is_ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    if !dotenv_loaded {
        warn!(".env file not found; using process environment only");
    }
    let settings = Settings::from_env();

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&settings.db_url).await?;
    db.migrate().await?;

    // ── Seed file (calibrations + plants) ───────────────────────────
    if let Some(path) = &settings.seed_path {
        let seed = config::load(path)?;
        config::apply(&seed, &db).await?;
    }

    let sensors = db.list_sensors().await?;
    info!(sensors = sensors.len(), "db ready");

    if settings.notification_target.is_none() {
        warn!("NOTIFICATION_TARGET is not set; alerts will only be logged");
    }

    // ── Shared state (ephemeral, for /api/status) ───────────────────
    let shared = state::shared();
    shared.write().await.record_system("hub started".to_string());

    // ── Pipeline ────────────────────────────────────────────────────
    let client = reqwest::Client::new();
    let notifier = Notifier::new(
        client.clone(),
        &settings.relay_url,
        settings.notification_target.clone(),
    );
    let dispatcher = Dispatcher::new(client, &settings.agent_url, notifier, Arc::clone(&shared));
    let pipeline = Pipeline::new(db, dispatcher, shared);

    // ── Web server (+ MQTT ingest when configured) ──────────────────
    match &settings.mqtt {
        None => web::serve(pipeline, settings.web_port).await,
        Some(mqtt) => {
            let web_pipeline = pipeline.clone();
            tokio::select! {
                r = web::serve(web_pipeline, settings.web_port) => r,
                r = run_mqtt(mqtt, pipeline) => r,
            }
        }
    }
}

/// Feed `tele/<sensor_id>/reading` messages into the pipeline. Never returns
/// on its own; connection errors are logged and retried.
async fn run_mqtt(settings: &MqttSettings, pipeline: Pipeline) -> Result<()> {
    let mut mqttoptions = MqttOptions::new("sentinel-hub", settings.host.clone(), settings.port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let Some(sensor_id) = extract_sensor_id(&p.topic) else {
                    warn!(topic = %p.topic, "unhandled topic");
                    continue;
                };

                match serde_json::from_slice::<TelemetryMsg>(&p.payload) {
                    Ok(msg) => {
                        // Rejections are already logged by the pipeline.
                        if let Err(e) = pipeline.submit_reading(sensor_id, msg.raw_value).await {
                            let mut st = pipeline.shared().write().await;
                            st.record_error(format!("{sensor_id}: {e}"));
                        }
                    }
                    Err(e) => {
                        warn!(topic = %p.topic, "bad telemetry json: {e}");
                        let mut st = pipeline.shared().write().await;
                        st.record_error(format!("bad telemetry json: {e}"));
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(broker = %settings.host, "mqtt connected");
                // Subscriptions do not survive a reconnect with a clean session.
                let subscribed = client.subscribe(TELEMETRY_TOPIC, QoS::AtLeastOnce).await;
                if let Err(e) = &subscribed {
                    error!(topic = TELEMETRY_TOPIC, "mqtt subscribe failed: {e}");
                }
                pipeline.shared().write().await.record_mqtt_connected(subscribed);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = pipeline.shared().write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                error!("mqtt error: {e}. reconnecting...");
                let mut st = pipeline.shared().write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}
