//! Aggregation Clause Builder

use sensorhub_tsdb::AggregationRule;

/// Join a strategy into an engine aggregation clause, e.g.
/// `mean(out_temperature) as out_temperature, sum(rain_rain) as rain_rain`.
///
/// An empty strategy yields an empty clause; policies reject that upstream.
pub fn form_agg_clause(strategy: &[AggregationRule], with_alias: bool) -> String {
    strategy
        .iter()
        .map(|rule| {
            if with_alias {
                format!("{} as {}", rule.expression, rule.obs_type)
            } else {
                rule.expression.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}
