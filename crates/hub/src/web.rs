use anyhow::Context;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::parse_planting_date;
use crate::db::{Plant, Reading, Sensor};
use crate::error::{PipelineError, Result};
use crate::pipeline::Pipeline;
use crate::state::StatusResponse;

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------
//
// Every field is optional at the serde level so a missing field surfaces as
// a validation error naming it. The PascalCase aliases are what the
// dashboard sends.

#[derive(Debug, Deserialize)]
struct CalibrationPayload {
    #[serde(alias = "SensorID")]
    sensor_id: Option<String>,
    #[serde(alias = "DryReference")]
    dry_reference: Option<i64>,
    #[serde(alias = "WetReference")]
    wet_reference: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct PlantPayload {
    #[serde(alias = "SensorID")]
    sensor_id: Option<String>,
    #[serde(alias = "Name")]
    name: Option<String>,
    #[serde(alias = "DatePlanted")]
    date_planted: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelemetryPayload {
    sensor_id: Option<String>,
    raw_value: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    sensor_id: Option<String>,
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct PlantQuery {
    #[serde(alias = "sensorID")]
    sensor_id: Option<String>,
}

/// Records a missing field and passes the value through.
fn field<T>(value: Option<T>, name: &'static str, missing: &mut Vec<&'static str>) -> Option<T> {
    if value.is_none() {
        missing.push(name);
    }
    value
}

/// Blank strings count as missing.
fn text(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn missing_fields(missing: &[&str]) -> PipelineError {
    PipelineError::Validation(format!(
        "missing required field{}: {}",
        if missing.len() == 1 { "" } else { "s" },
        missing.join(", ")
    ))
}

fn json_body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(p)| p)
        .map_err(|e| PipelineError::Validation(e.body_text()))
}

fn query<T>(q: std::result::Result<Query<T>, QueryRejection>) -> Result<T> {
    q.map(|Query(q)| q)
        .map_err(|e| PipelineError::Validation(e.body_text()))
}

fn required_sensor_id(sensor_id: Option<String>) -> Result<String> {
    text(sensor_id).ok_or_else(|| missing_fields(&["sensor_id"]))
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = match &self {
            PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
            PipelineError::CalibrationMissing(_) | PipelineError::PlantMissing(_) => {
                StatusCode::NOT_FOUND
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("request failed: {self}");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(pipeline: Pipeline) -> Router {
    Router::new()
        .route("/telemetry", post(telemetry))
        .route("/api/calibrate", post(calibrate))
        .route("/api/configure", put(configure).post(configure))
        .route("/api/readings", get(readings))
        .route("/api/sensors", get(sensors))
        .route("/api/plant", get(plant))
        .route("/api/status", get(api_status))
        .with_state(pipeline)
}

async fn calibrate(
    State(p): State<Pipeline>,
    payload: std::result::Result<Json<CalibrationPayload>, JsonRejection>,
) -> Result<Json<Value>> {
    let body = json_body(payload)?;
    let mut missing = Vec::new();
    let sensor_id = field(text(body.sensor_id), "sensor_id", &mut missing);
    let dry = field(body.dry_reference, "dry_reference", &mut missing);
    let wet = field(body.wet_reference, "wet_reference", &mut missing);
    let (Some(sensor_id), Some(dry), Some(wet)) = (sensor_id, dry, wet) else {
        return Err(missing_fields(&missing));
    };

    p.calibrate(&sensor_id, dry, wet).await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn configure(
    State(p): State<Pipeline>,
    payload: std::result::Result<Json<PlantPayload>, JsonRejection>,
) -> Result<Json<Plant>> {
    let body = json_body(payload)?;
    let mut missing = Vec::new();
    let sensor_id = field(text(body.sensor_id), "sensor_id", &mut missing);
    let name = field(text(body.name), "name", &mut missing);
    let date = field(text(body.date_planted), "date_planted", &mut missing);
    let (Some(sensor_id), Some(name), Some(date)) = (sensor_id, name, date) else {
        return Err(missing_fields(&missing));
    };
    let date_planted = parse_planting_date(&date)?;

    Ok(Json(p.configure_plant(&sensor_id, &name, date_planted).await?))
}

async fn telemetry(
    State(p): State<Pipeline>,
    payload: std::result::Result<Json<TelemetryPayload>, JsonRejection>,
) -> Result<Json<Value>> {
    let body = json_body(payload)?;
    let mut missing = Vec::new();
    let sensor_id = field(text(body.sensor_id), "sensor_id", &mut missing);
    let raw_value = field(body.raw_value, "raw_value", &mut missing);
    let (Some(sensor_id), Some(raw_value)) = (sensor_id, raw_value) else {
        return Err(missing_fields(&missing));
    };

    let moisture = p.submit_reading(&sensor_id, raw_value).await?;
    Ok(Json(json!({ "status": "ACK", "moisture_percentage": moisture })))
}

async fn readings(
    State(p): State<Pipeline>,
    q: std::result::Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<Vec<Reading>>> {
    let q = query(q)?;
    let sensor_id = required_sensor_id(q.sensor_id)?;
    Ok(Json(p.readings(&sensor_id, q.limit.unwrap_or(0)).await?))
}

async fn sensors(State(p): State<Pipeline>) -> Result<Json<Vec<Sensor>>> {
    Ok(Json(p.sensors().await?))
}

/// Zero or one element; the dashboard checks the array length.
async fn plant(
    State(p): State<Pipeline>,
    q: std::result::Result<Query<PlantQuery>, QueryRejection>,
) -> Result<Json<Vec<Plant>>> {
    let sensor_id = required_sensor_id(query(q)?.sensor_id)?;
    Ok(Json(p.current_plant(&sensor_id).await?.into_iter().collect()))
}

async fn api_status(State(p): State<Pipeline>) -> Json<StatusResponse> {
    let st = p.shared().read().await;
    Json(st.to_status())
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(pipeline: Pipeline, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("web api listening on http://{addr}");

    axum::serve(listener, router(pipeline))
        .await
        .context("web server error")?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
