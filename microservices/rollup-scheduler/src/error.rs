//! Rollup Scheduler Error Types

use sensorhub_core::SensorHubError;
use sensorhub_tsdb::StoreError;
use thiserror::Error;

use crate::pubsub::PublishError;

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to install continuous query '{rule}': {source}")]
    RuleInstall {
        rule: String,
        #[source]
        source: StoreError,
    },

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Config file error: {0}")]
    ConfigFile(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SchedulerError> for SensorHubError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Config(_) | SchedulerError::ConfigFile(_) => {
                SensorHubError::Config(err.to_string())
            }
            SchedulerError::Store(e) => e.into(),
            SchedulerError::RuleInstall { .. } => SensorHubError::Database(err.to_string()),
            SchedulerError::Publish(_) => SensorHubError::Network(err.to_string()),
            SchedulerError::Io(e) => e.into(),
        }
    }
}
