//! Process settings from the environment, plus TOML seed-file loading,
//! validation, and database seeding for calibrations and plants.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime};

use crate::db::Db;
use crate::error::PipelineError;

// ---------------------------------------------------------------------------
// Environment settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub db_url: String,
    pub web_port: u16,
    pub agent_url: String,
    pub relay_url: String,
    pub notification_target: Option<String>,
    pub mqtt: Option<MqttSettings>,
    pub seed_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Unset and empty variables are treated the same.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let port = |key: &str, default: u16| {
            get(key)
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(default)
        };

        Self {
            db_url: get("DB_URL").unwrap_or_else(|| "sqlite:sentinel.db?mode=rwc".to_string()),
            web_port: port("WEB_PORT", 8080),
            agent_url: get("AGENT_URL").unwrap_or_else(|| "http://localhost:5000".to_string()),
            relay_url: get("NOTIFICATION_RELAY_URL")
                .unwrap_or_else(|| "https://ntfy.sh".to_string()),
            notification_target: get("NOTIFICATION_TARGET"),
            mqtt: get("MQTT_HOST").map(|host| MqttSettings {
                host,
                port: port("MQTT_PORT", 1883),
            }),
            seed_path: get("SEED_CONFIG_PATH"),
        }
    }
}

// ---------------------------------------------------------------------------
// Planting dates
// ---------------------------------------------------------------------------

/// Accepts a bare `YYYY-MM-DD` (midnight UTC) or a full RFC 3339 timestamp.
pub fn parse_planting_date(s: &str) -> Result<OffsetDateTime, PipelineError> {
    let s = s.trim();
    if let Ok(ts) = OffsetDateTime::parse(s, &Rfc3339) {
        return Ok(ts);
    }
    Date::parse(s, format_description!("[year]-[month]-[day]"))
        .map(|d| d.midnight().assume_utc())
        .map_err(|_| {
            PipelineError::Validation(format!(
                "date_planted '{s}' is not YYYY-MM-DD or RFC 3339"
            ))
        })
}

// ---------------------------------------------------------------------------
// Seed file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SeedConfig {
    #[serde(default)]
    pub sensors: Vec<SensorEntry>,
    #[serde(default)]
    pub plants: Vec<PlantEntry>,
}

#[derive(Debug, Deserialize)]
pub struct SensorEntry {
    pub sensor_id: String,
    pub dry_reference: i64,
    pub wet_reference: i64,
}

#[derive(Debug, Deserialize)]
pub struct PlantEntry {
    pub sensor_id: String,
    pub name: String,
    pub date_planted: String,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl SeedConfig {
    /// Validate all entries. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_sensors(&mut errors);
        self.validate_plants(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "seed validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, s) in self.sensors.iter().enumerate() {
            let ctx = || {
                if s.sensor_id.is_empty() {
                    format!("sensors[{i}]")
                } else {
                    format!("sensor '{}'", s.sensor_id)
                }
            };

            if s.sensor_id.trim().is_empty() {
                errors.push(format!("{}: sensor_id is empty", ctx()));
            } else if !seen_ids.insert(&s.sensor_id) {
                errors.push(format!("{}: duplicate sensor_id", ctx()));
            }

            // ADC counts are never negative.
            if s.dry_reference < 0 {
                errors.push(format!(
                    "{}: dry_reference {} is negative",
                    ctx(),
                    s.dry_reference
                ));
            }
            if s.wet_reference < 0 {
                errors.push(format!(
                    "{}: wet_reference {} is negative",
                    ctx(),
                    s.wet_reference
                ));
            }
        }
    }

    fn validate_plants(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, p) in self.plants.iter().enumerate() {
            let ctx = || {
                if p.sensor_id.is_empty() {
                    format!("plants[{i}]")
                } else {
                    format!("plant for '{}'", p.sensor_id)
                }
            };

            if p.sensor_id.trim().is_empty() {
                errors.push(format!("{}: sensor_id is empty", ctx()));
            } else if !seen_ids.insert(&p.sensor_id) {
                errors.push(format!("{}: sensor already has a plant", ctx()));
            }

            if p.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            if let Err(e) = parse_planting_date(&p.date_planted) {
                errors.push(format!("{}: {e}", ctx()));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML seed file.
pub fn load(path: &str) -> Result<SeedConfig> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read seed file: {path}"))?;
    let config: SeedConfig =
        toml::from_str(&contents).with_context(|| format!("failed to parse seed file: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid seed file: {path}"))?;
    Ok(config)
}

/// Upsert every calibration and plant from the seed into the database.
pub async fn apply(config: &SeedConfig, db: &Db) -> Result<()> {
    for s in &config.sensors {
        db.upsert_calibration(&s.sensor_id, s.dry_reference, s.wet_reference)
            .await
            .with_context(|| format!("failed to seed calibration for '{}'", s.sensor_id))?;
    }

    for p in &config.plants {
        let planted = parse_planting_date(&p.date_planted)?;
        db.upsert_plant_configuration(&p.sensor_id, p.name.trim(), planted)
            .await
            .with_context(|| format!("failed to seed plant for '{}'", p.sensor_id))?;
    }

    tracing::info!(
        sensors = config.sensors.len(),
        plants = config.plants.len(),
        "seed applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
