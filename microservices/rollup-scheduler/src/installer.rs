//! Continuous-Aggregation Installer
//!
//! Installs one engine-resident rule per configured continuous query so that
//! steady-state rollups are produced by the store itself.

use futures_util::future::join_all;
use sensorhub_tsdb::{PersistentRule, TimeSeriesStore};
use tracing::{error, info};

use crate::clause::form_agg_clause;
use crate::config::MeasurementConfigs;
use crate::policy::{PolicyRegistry, RollupTarget};
use crate::{Result, SchedulerError};

/// Engine-native statement text for one continuous query
pub fn form_cq_stmt(target: &RollupTarget) -> String {
    let agg_clause = form_agg_clause(&target.policy.strategy, true);
    format!(
        "CREATE CONTINUOUS QUERY {} ON {} BEGIN SELECT {} INTO {} FROM {} GROUP BY time({}ms), * END",
        target.rule_name,
        target.database,
        agg_clause,
        target.destination,
        target.qualified_source,
        target.policy.interval_ms,
    )
}

pub fn build_rule(target: &RollupTarget) -> PersistentRule {
    PersistentRule {
        name: target.rule_name.clone(),
        database: target.database.clone(),
        retention_policy: target.retention_policy.clone(),
        source: target.source.clone(),
        destination: target.destination.clone(),
        interval_ms: target.policy.interval_ms,
        clause: form_agg_clause(&target.policy.strategy, true),
        statement: form_cq_stmt(target),
    }
}

pub fn build_rules(measurements: &MeasurementConfigs, registry: &PolicyRegistry) -> Result<Vec<PersistentRule>> {
    Ok(registry.targets(measurements)?.iter().map(build_rule).collect())
}

/// Install every configured continuous query.
///
/// All rules are submitted concurrently and every one is attempted. Returns
/// the number installed, or the first failure wrapped with its rule name.
pub async fn create_all_cqs(
    store: &dyn TimeSeriesStore,
    measurements: &MeasurementConfigs,
    registry: &PolicyRegistry,
) -> Result<usize> {
    let rules = build_rules(measurements, registry)?;

    let results = join_all(rules.iter().map(|rule| async move {
        let result = store.install_persistent_rule(rule).await;
        (rule, result)
    }))
    .await;

    let mut installed = 0;
    let mut first_error = None;
    for (rule, result) in results {
        match result {
            Ok(()) => {
                installed += 1;
                info!(
                    rule = %rule.name,
                    source = %rule.source,
                    destination = %rule.destination,
                    interval_ms = rule.interval_ms,
                    "Continuous query installed"
                );
            }
            Err(e) => {
                error!(rule = %rule.name, error = %e, "Continuous query installation failed");
                if first_error.is_none() {
                    first_error = Some(SchedulerError::RuleInstall {
                        rule: rule.name.clone(),
                        source: e,
                    });
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(installed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CqConfig, MeasurementConfig};
    use crate::policy::AggregationPolicy;
    use sensorhub_tsdb::{AggregationRule, Fault, MemoryStore};

    fn fixture() -> (MeasurementConfigs, PolicyRegistry) {
        let registry = PolicyRegistry::from_policies([
            AggregationPolicy::new(
                "wx_5m",
                300_000,
                vec![
                    AggregationRule::new("out_temperature", "mean(out_temperature)"),
                    AggregationRule::new("rain_rain", "sum(rain_rain)"),
                ],
            )
            .unwrap(),
            AggregationPolicy::new(
                "wx_1h",
                3_600_000,
                vec![AggregationRule::new("out_temperature", "mean(out_temperature)")],
            )
            .unwrap(),
        ]);

        let mut measurements = MeasurementConfigs::new();
        measurements.insert(
            "wxpackets".to_string(),
            MeasurementConfig {
                database: "weather".to_string(),
                rp: "autogen".to_string(),
                cqs: vec![
                    CqConfig {
                        cq_policy: "wx_5m".to_string(),
                        cq_destination: "wxpackets_5m".to_string(),
                        cq_name: "cq_wx_5m".to_string(),
                    },
                    CqConfig {
                        cq_policy: "wx_1h".to_string(),
                        cq_destination: "wxpackets_1h".to_string(),
                        cq_name: "cq_wx_1h".to_string(),
                    },
                ],
            },
        );
        measurements.insert(
            "events".to_string(),
            MeasurementConfig {
                database: "weather".to_string(),
                rp: "autogen".to_string(),
                cqs: vec![],
            },
        );
        (measurements, registry)
    }

    #[test]
    fn test_statement_text() {
        let (measurements, registry) = fixture();
        let rules = build_rules(&measurements, &registry).unwrap();
        assert_eq!(rules.len(), 2);

        let rule = rules.iter().find(|r| r.name == "cq_wx_5m").unwrap();
        assert_eq!(
            rule.statement,
            "CREATE CONTINUOUS QUERY cq_wx_5m ON weather BEGIN SELECT \
             mean(out_temperature) as out_temperature, sum(rain_rain) as rain_rain \
             INTO wxpackets_5m FROM weather.autogen.wxpackets GROUP BY time(300000ms), * END"
        );
        assert_eq!(rule.clause, "mean(out_temperature) as out_temperature, sum(rain_rain) as rain_rain");
    }

    #[tokio::test]
    async fn test_installs_every_rule() {
        let (measurements, registry) = fixture();
        let store = MemoryStore::new();

        let installed = create_all_cqs(&store, &measurements, &registry).await.unwrap();
        assert_eq!(installed, 2);
        assert_eq!(store.installed_rules().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_names_rule_and_does_not_block_others() {
        let (measurements, registry) = fixture();
        let store = MemoryStore::new();
        store.inject(Fault::Install {
            name: "cq_wx_5m".to_string(),
        });

        let err = create_all_cqs(&store, &measurements, &registry).await.unwrap_err();
        match err {
            SchedulerError::RuleInstall { rule, .. } => assert_eq!(rule, "cq_wx_5m"),
            other => panic!("unexpected error: {other}"),
        }

        let installed: Vec<String> = store.installed_rules().into_iter().map(|r| r.name).collect();
        assert_eq!(installed, vec!["cq_wx_1h".to_string()]);
    }
}
