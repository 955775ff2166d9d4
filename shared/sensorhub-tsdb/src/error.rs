//! Store Error Types

use sensorhub_core::SensorHubError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(#[from] tokio_postgres::Error),

    #[error("Query error: {0}")]
    Query(tokio_postgres::Error),

    #[error("Pool error: {0}")]
    Pool(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid aggregate expression '{0}'")]
    InvalidExpression(String),

    #[error("Record rejected: {0}")]
    Rejected(String),

    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: &'static str, after_ms: u64 },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for SensorHubError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Configuration(_) | StoreError::InvalidExpression(_) => {
                SensorHubError::Config(err.to_string())
            }
            StoreError::Rejected(_) => SensorHubError::Validation(err.to_string()),
            StoreError::Timeout { .. } => SensorHubError::Timeout(err.to_string()),
            StoreError::Unavailable(_) => SensorHubError::Unavailable(err.to_string()),
            _ => SensorHubError::Database(err.to_string()),
        }
    }
}
