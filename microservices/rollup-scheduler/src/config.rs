//! Rollup Scheduler Configuration
//!
//! Process settings come from the environment; the measurement map and the
//! aggregation policies come from a YAML file:
//!
//! ```yaml
//! measurements:
//!   wxpackets:
//!     database: weather
//!     rp: autogen
//!     cqs:
//!       - cq_policy: wx_5m
//!         cq_destination: wxpackets_5m
//!         cq_name: cq_wxpackets_5m
//! cq_policies:
//!   wx_5m:
//!     interval: 5m
//!     aggregation:
//!       - obs_type: out_temperature
//!         subsample: mean(out_temperature)
//! ```

use sensorhub_core::ServiceConfig;
use sensorhub_tsdb::AggregationRule;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::{Result, SchedulerError};

/// Continuous query attached to one measurement
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CqConfig {
    pub cq_policy: String,
    pub cq_destination: String,
    pub cq_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MeasurementConfig {
    pub database: String,
    #[serde(default = "default_rp", alias = "retention_policy")]
    pub rp: String,
    #[serde(default)]
    pub cqs: Vec<CqConfig>,
}

fn default_rp() -> String {
    "autogen".to_string()
}

impl MeasurementConfig {
    /// Fully qualified `database.rp.measurement` name
    pub fn qualified(&self, measurement: &str) -> String {
        format!("{}.{}.{}", self.database, self.rp, measurement)
    }
}

pub type MeasurementConfigs = BTreeMap<String, MeasurementConfig>;

/// Interval given either as milliseconds or as duration text (`5m`, `1h30m`)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum IntervalSpec {
    Millis(i64),
    Text(String),
}

impl IntervalSpec {
    pub fn to_millis(&self) -> Result<i64> {
        match self {
            Self::Millis(ms) => Ok(*ms),
            Self::Text(text) => parse_interval(text),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PolicyConfig {
    pub interval: IntervalSpec,
    pub aggregation: Vec<AggregationRule>,
}

/// Contents of the rollup configuration file
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RollupFile {
    #[serde(default)]
    pub measurements: MeasurementConfigs,
    #[serde(default)]
    pub cq_policies: BTreeMap<String, PolicyConfig>,
}

impl RollupFile {
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            SchedulerError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }
}

/// Parse duration text such as `300s`, `5m`, `1h30m` or `250ms` into milliseconds.
/// A bare number is taken as milliseconds.
pub fn parse_interval(text: &str) -> Result<i64> {
    let invalid = || SchedulerError::Config(format!("invalid interval '{}'", text));

    let text = text.trim();
    if text.is_empty() {
        return Err(invalid());
    }
    if let Ok(ms) = text.parse::<i64>() {
        return Ok(ms);
    }

    let mut total: i64 = 0;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return Err(invalid());
        }
        let amount: i64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest.chars().take_while(|c| c.is_ascii_alphabetic()).count();
        let scale = match &rest[..unit_len] {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            "w" => 604_800_000,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];

        total = amount
            .checked_mul(scale)
            .and_then(|ms| total.checked_add(ms))
            .ok_or_else(invalid)?;
    }
    Ok(total)
}

/// Longest settle delay accepted after a boundary
pub const MAX_CQ_DELAY_MS: u64 = 86_400_000;

/// Process-wide settings for the rollup scheduler
#[derive(Debug, Clone)]
pub struct RollupConfig {
    pub service: ServiceConfig,
    pub config_path: String,
    /// Settle time after each boundary before the latest rollup is trusted
    pub cq_delay_ms: u64,
    pub store_timeout_ms: u64,
    pub install_cqs_on_start: bool,
    pub catchup_on_start: bool,
    pub hub_capacity: usize,
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

fn env_number<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|e| SchedulerError::Config(format!("Invalid {}: {}", name, e))),
        Err(_) => Ok(default),
    }
}

impl RollupConfig {
    pub fn from_env() -> Result<Self> {
        let service =
            ServiceConfig::from_env().map_err(|e| SchedulerError::Config(e.to_string()))?;
        Self {
            service,
            config_path: std::env::var("ROLLUP_CONFIG")
                .unwrap_or_else(|_| "config/rollups.yaml".to_string()),
            cq_delay_ms: env_number("CQ_DELAY_MS", 5_000)?,
            store_timeout_ms: env_number("STORE_TIMEOUT_MS", 10_000)?,
            install_cqs_on_start: env_flag("INSTALL_CQS", true),
            catchup_on_start: env_flag("CATCHUP_ON_START", true),
            hub_capacity: env_number("HUB_CAPACITY", 64)?,
        }
        .validated()
    }

    fn validated(self) -> Result<Self> {
        if self.cq_delay_ms > MAX_CQ_DELAY_MS {
            return Err(SchedulerError::Config(format!(
                "CQ_DELAY_MS {} exceeds the {}ms limit",
                self.cq_delay_ms, MAX_CQ_DELAY_MS
            )));
        }
        if self.store_timeout_ms == 0 {
            return Err(SchedulerError::Config("STORE_TIMEOUT_MS must be positive".to_string()));
        }
        Ok(self)
    }
}
