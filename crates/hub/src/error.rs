//! Error taxonomy for the ingestion and advisory pipeline.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed or missing input field.
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("sensor '{0}' has no calibration on file")]
    CalibrationMissing(String),

    #[error("no plant configured for sensor '{0}'")]
    PlantMissing(String),

    #[error("{op} failed: {source}")]
    Storage {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// Advisory agent unreachable, non-2xx, or returned an undecodable body.
    #[error("advisory agent unavailable: {0}")]
    AgentUnavailable(String),

    #[error("NOTIFICATION_TARGET is not configured")]
    NotificationUnconfigured,
}

impl PipelineError {
    /// Adapter for `map_err` that tags a sqlx failure with the store operation.
    pub fn storage(op: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| Self::Storage { op, source }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(value: reqwest::Error) -> Self {
        Self::AgentUnavailable(value.to_string())
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
