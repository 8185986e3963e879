use anyhow::Context;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

use crate::error::{PipelineError, Result};

/// History queries with a non-positive limit fall back to this many rows.
pub const DEFAULT_HISTORY_LIMIT: i64 = 100;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Sensor {
    pub sensor_id: String,
    pub dry_reference: i64,
    pub wet_reference: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calibration {
    pub dry_reference: i64,
    pub wet_reference: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Plant {
    pub id: i64,
    pub sensor_id: String,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub date_planted: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct Reading {
    pub id: i64,
    pub plant_id: i64,
    pub moisture_percentage: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Outcome of a successful ingest: the stored percentage and the plant it
/// was attributed to.
#[derive(Debug, Clone)]
pub struct IngestedReading {
    pub moisture_percentage: i64,
    pub plant: Plant,
}

// Raw rows as stored; timestamps are unix seconds.

#[derive(FromRow)]
struct SensorRow {
    sensor_id: String,
    dry_reference: i64,
    wet_reference: i64,
    created_at: i64,
}

#[derive(FromRow)]
struct PlantRow {
    id: i64,
    sensor_id: String,
    name: String,
    date_planted: i64,
    created_at: i64,
    updated_at: i64,
}

#[derive(FromRow)]
struct ReadingRow {
    id: i64,
    plant_id: i64,
    moisture_percentage: i64,
    created_at: i64,
}

fn from_unix(ts: i64) -> std::result::Result<OffsetDateTime, sqlx::Error> {
    OffsetDateTime::from_unix_timestamp(ts).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

impl TryFrom<SensorRow> for Sensor {
    type Error = sqlx::Error;

    fn try_from(r: SensorRow) -> std::result::Result<Self, Self::Error> {
        Ok(Sensor {
            sensor_id: r.sensor_id,
            dry_reference: r.dry_reference,
            wet_reference: r.wet_reference,
            created_at: from_unix(r.created_at)?,
        })
    }
}

impl TryFrom<PlantRow> for Plant {
    type Error = sqlx::Error;

    fn try_from(r: PlantRow) -> std::result::Result<Self, Self::Error> {
        Ok(Plant {
            id: r.id,
            sensor_id: r.sensor_id,
            name: r.name,
            date_planted: from_unix(r.date_planted)?,
            created_at: from_unix(r.created_at)?,
            updated_at: from_unix(r.updated_at)?,
        })
    }
}

impl TryFrom<ReadingRow> for Reading {
    type Error = sqlx::Error;

    fn try_from(r: ReadingRow) -> std::result::Result<Self, Self::Error> {
        Ok(Reading {
            id: r.id,
            plant_id: r.plant_id,
            moisture_percentage: r.moisture_percentage,
            created_at: from_unix(r.created_at)?,
        })
    }
}

/// Convert a raw ADC reading to an integer moisture percentage in 0..=100
/// using the sensor's dry/wet calibration endpoints.
///
/// The endpoints may be in either order. Readings at or past an endpoint
/// clamp to 0 or 100; in between the scale is linear with truncating integer
/// division. Equal endpoints only ever take the clamp path.
pub fn compute_moisture(raw: i64, dry_ref: i64, wet_ref: i64) -> i64 {
    // i128 so `* 100` cannot overflow for any i64 calibration span.
    let (raw, dry, wet) = (raw as i128, dry_ref as i128, wet_ref as i128);
    let pct = if dry > wet {
        // Probe reads lower as the soil gets wetter.
        if raw >= dry {
            0
        } else if raw <= wet {
            100
        } else {
            (dry - raw) * 100 / (dry - wet)
        }
    } else if raw <= dry {
        0
    } else if raw >= wet {
        100
    } else {
        (raw - dry) * 100 / (wet - dry)
    };
    pct as i64
}

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/sentinel/sentinel.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Calibration store
    // ----------------------------

    /// Insert a sensor, or overwrite both references if it already exists.
    /// `created_at` is only set on first insert.
    pub async fn upsert_calibration(
        &self,
        sensor_id: &str,
        dry_reference: i64,
        wet_reference: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sensors (sensor_id, dry_reference, wet_reference, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(sensor_id) DO UPDATE SET
              dry_reference=excluded.dry_reference,
              wet_reference=excluded.wet_reference
            "#,
        )
        .bind(sensor_id)
        .bind(dry_reference)
        .bind(wet_reference)
        .bind(now_unix())
        .execute(&self.pool)
        .await
        .map_err(PipelineError::storage("upsert_calibration"))?;
        Ok(())
    }

    pub async fn get_calibration(&self, sensor_id: &str) -> Result<Calibration> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT dry_reference, wet_reference
            FROM sensors
            WHERE sensor_id = ?
            "#,
        )
        .bind(sensor_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(PipelineError::storage("get_calibration"))?;

        row.map(|(dry_reference, wet_reference)| Calibration {
            dry_reference,
            wet_reference,
        })
        .ok_or_else(|| PipelineError::CalibrationMissing(sensor_id.to_string()))
    }

    pub async fn list_sensors(&self) -> Result<Vec<Sensor>> {
        let rows: Vec<SensorRow> = sqlx::query_as(
            r#"
            SELECT sensor_id, dry_reference, wet_reference, created_at
            FROM sensors
            ORDER BY sensor_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(PipelineError::storage("list_sensors"))?;

        rows.into_iter()
            .map(Sensor::try_from)
            .collect::<std::result::Result<_, _>>()
            .map_err(PipelineError::storage("list_sensors"))
    }

    // ----------------------------
    // Plant registry
    // ----------------------------

    /// Create the sensor's plant, or replace its name and planting date.
    /// The sensor does not need to be calibrated yet.
    pub async fn upsert_plant_configuration(
        &self,
        sensor_id: &str,
        name: &str,
        date_planted: OffsetDateTime,
    ) -> Result<Plant> {
        let now = now_unix();
        sqlx::query(
            r#"
            INSERT INTO plants (sensor_id, name, date_planted, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(sensor_id) DO UPDATE SET
              name=excluded.name,
              date_planted=excluded.date_planted,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(sensor_id)
        .bind(name)
        .bind(date_planted.unix_timestamp())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(PipelineError::storage("upsert_plant_configuration"))?;

        self.get_current_plant(sensor_id).await
    }

    /// Most recently created plant for the sensor (highest id wins).
    pub async fn find_current_plant(&self, sensor_id: &str) -> Result<Option<Plant>> {
        let row: Option<PlantRow> = sqlx::query_as(
            r#"
            SELECT id, sensor_id, name, date_planted, created_at, updated_at
            FROM plants
            WHERE sensor_id = ?
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(sensor_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(PipelineError::storage("get_current_plant"))?;

        row.map(Plant::try_from)
            .transpose()
            .map_err(PipelineError::storage("get_current_plant"))
    }

    pub async fn get_current_plant(&self, sensor_id: &str) -> Result<Plant> {
        self.find_current_plant(sensor_id)
            .await?
            .ok_or_else(|| PipelineError::PlantMissing(sensor_id.to_string()))
    }

    // ----------------------------
    // Reading ledger
    // ----------------------------

    /// Normalize `raw_value` against the sensor's calibration and append it to
    /// the ledger under the sensor's current plant. Nothing is written unless
    /// both the calibration and the plant resolve.
    pub async fn insert_reading(&self, sensor_id: &str, raw_value: i64) -> Result<IngestedReading> {
        let cal = self.get_calibration(sensor_id).await?;
        let plant = self.get_current_plant(sensor_id).await?;

        let moisture_percentage = compute_moisture(raw_value, cal.dry_reference, cal.wet_reference);
        self.append_reading(plant.id, moisture_percentage).await?;

        Ok(IngestedReading {
            moisture_percentage,
            plant,
        })
    }

    /// `created_at` never goes below the newest stored reading, so the ledger
    /// stays ordered even if the wall clock steps backwards.
    async fn append_reading(&self, plant_id: i64, moisture_percentage: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO readings (plant_id, moisture_percentage, created_at)
            SELECT ?, ?, MAX(?, COALESCE(MAX(created_at), 0))
            FROM readings
            "#,
        )
        .bind(plant_id)
        .bind(moisture_percentage)
        .bind(now_unix())
        .execute(&self.pool)
        .await
        .map_err(PipelineError::storage("insert_reading"))?;
        Ok(())
    }

    /// Up to `limit` readings for the sensor's plant, oldest first. An unknown
    /// sensor yields an empty list.
    pub async fn fetch_readings(&self, sensor_id: &str, limit: i64) -> Result<Vec<Reading>> {
        let limit = if limit < 1 { DEFAULT_HISTORY_LIMIT } else { limit };

        let rows: Vec<ReadingRow> = sqlx::query_as(
            r#"
            SELECT r.id, r.plant_id, r.moisture_percentage, r.created_at
            FROM readings r
            JOIN plants p ON p.id = r.plant_id
            WHERE p.sensor_id = ?
            ORDER BY r.created_at ASC, r.id ASC
            LIMIT ?
            "#,
        )
        .bind(sensor_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(PipelineError::storage("fetch_readings"))?;

        rows.into_iter()
            .map(Reading::try_from)
            .collect::<std::result::Result<_, _>>()
            .map_err(PipelineError::storage("fetch_readings"))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
