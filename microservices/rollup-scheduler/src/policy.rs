//! Aggregation Policy Registry
//!
//! Named aggregation policies (interval + strategy), loaded once at startup
//! and only ever read afterwards.

use sensorhub_tsdb::AggregationRule;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::config::{MeasurementConfigs, PolicyConfig};
use crate::{Result, SchedulerError};

/// Longest interval a policy may use: one leap year
pub const MAX_INTERVAL_MS: i64 = 366 * 86_400_000;

#[derive(Debug, Clone, PartialEq)]
pub struct AggregationPolicy {
    pub name: String,
    pub interval_ms: i64,
    pub strategy: Vec<AggregationRule>,
}

impl AggregationPolicy {
    /// Build a policy, rejecting anything that would aggregate with a
    /// meaningless clause.
    pub fn new(name: impl Into<String>, interval_ms: i64, strategy: Vec<AggregationRule>) -> Result<Self> {
        let name = name.into();
        if interval_ms <= 0 {
            return Err(SchedulerError::Config(format!(
                "policy '{}' has non-positive interval {}ms",
                name, interval_ms
            )));
        }
        if interval_ms > MAX_INTERVAL_MS {
            return Err(SchedulerError::Config(format!(
                "policy '{}' interval {}ms exceeds the {}ms limit",
                name, interval_ms, MAX_INTERVAL_MS
            )));
        }
        if strategy.is_empty() {
            return Err(SchedulerError::Config(format!(
                "policy '{}' has an empty aggregation strategy",
                name
            )));
        }

        let mut seen = HashSet::new();
        for rule in &strategy {
            rule.parse().map_err(|e| {
                SchedulerError::Config(format!("policy '{}': {}", name, e))
            })?;
            if !seen.insert(rule.obs_type.as_str()) {
                return Err(SchedulerError::Config(format!(
                    "policy '{}' aggregates '{}' more than once",
                    name, rule.obs_type
                )));
            }
        }

        Ok(Self {
            name,
            interval_ms,
            strategy,
        })
    }
}

/// One continuous query resolved against its policy
#[derive(Debug, Clone, PartialEq)]
pub struct RollupTarget {
    pub source: String,
    pub database: String,
    pub retention_policy: String,
    pub qualified_source: String,
    pub destination: String,
    pub rule_name: String,
    pub policy: Arc<AggregationPolicy>,
}

#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: HashMap<String, Arc<AggregationPolicy>>,
}

impl PolicyRegistry {
    pub fn from_config(policies: &BTreeMap<String, PolicyConfig>) -> Result<Self> {
        let mut registry = Self::default();
        for (name, config) in policies {
            let interval_ms = config.interval.to_millis().map_err(|e| {
                SchedulerError::Config(format!("policy '{}': {}", name, e))
            })?;
            registry.insert(AggregationPolicy::new(name.clone(), interval_ms, config.aggregation.clone())?);
        }
        Ok(registry)
    }

    pub fn from_policies(policies: impl IntoIterator<Item = AggregationPolicy>) -> Self {
        let mut registry = Self::default();
        for policy in policies {
            registry.insert(policy);
        }
        registry
    }

    fn insert(&mut self, policy: AggregationPolicy) {
        self.policies.insert(policy.name.clone(), Arc::new(policy));
    }

    pub fn get(&self, name: &str) -> Result<Arc<AggregationPolicy>> {
        self.policies
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::Config(format!("unknown aggregation policy '{}'", name)))
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Every continuous query in the measurement map, resolved. Fails on the
    /// first reference to an unknown policy.
    pub fn targets(&self, measurements: &MeasurementConfigs) -> Result<Vec<RollupTarget>> {
        let mut targets = Vec::new();
        for (measurement, config) in measurements {
            for cq in &config.cqs {
                let policy = self.get(&cq.cq_policy).map_err(|e| {
                    SchedulerError::Config(format!("measurement '{}', cq '{}': {}", measurement, cq.cq_name, e))
                })?;
                targets.push(RollupTarget {
                    source: measurement.clone(),
                    database: config.database.clone(),
                    retention_policy: config.rp.clone(),
                    qualified_source: config.qualified(measurement),
                    destination: cq.cq_destination.clone(),
                    rule_name: cq.cq_name.clone(),
                    policy,
                });
            }
        }
        Ok(targets)
    }
}
