//! LumaDB store over the PostgreSQL wire protocol
//!
//! Points are kept in a narrow `(measurement, time, tags, field, value)` table.
//! Absent tags are stored as the empty string so series keys stay comparable.
//! Every value reaches the engine as a bound parameter; the only text spliced
//! into statements is the fixed SQL name of a parsed aggregate function.
//!
//! Continuous queries land in the `continuous_queries` catalog. LumaDB does
//! not evaluate them; destinations are advanced by the scheduler's refresh at
//! each interval boundary.

use async_trait::async_trait;
use sensorhub_core::{Record, SeriesIdentity, Timestamp};
use tracing::{debug, instrument};

use crate::{AggregateFn, AggregateQuery, PersistentRule, Result, StoreError, TimeSeriesStore, TsdbPool};
use crate::store::validate_write;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS points (
        measurement TEXT NOT NULL,
        time_ms BIGINT NOT NULL,
        platform TEXT NOT NULL DEFAULT '',
        stream TEXT NOT NULL DEFAULT '',
        field TEXT NOT NULL,
        value DOUBLE PRECISION NOT NULL,
        PRIMARY KEY (measurement, platform, stream, time_ms, field)
    );
    CREATE TABLE IF NOT EXISTS continuous_queries (
        name TEXT PRIMARY KEY,
        database TEXT NOT NULL,
        retention_policy TEXT NOT NULL,
        source TEXT NOT NULL,
        destination TEXT NOT NULL,
        interval_ms BIGINT NOT NULL,
        clause TEXT NOT NULL,
        statement TEXT NOT NULL,
        installed_at TIMESTAMPTZ NOT NULL DEFAULT now()
    );
"#;

const SERIES_FILTER: &str = "measurement = $1 AND platform = $2 AND stream = $3";

/// LumaDB-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: TsdbPool,
}

fn tag(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("")
}

fn untag(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

impl PgStore {
    pub fn new(pool: TsdbPool) -> Self {
        Self { pool }
    }

    /// Create the points table and rule catalog if missing
    pub async fn ensure_schema(&self) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.batch_execute(SCHEMA).await.map_err(StoreError::Query)?;
        debug!("LumaDB schema ensured");
        Ok(())
    }

    /// Round-trip latency to LumaDB
    pub async fn ping(&self) -> Result<std::time::Duration> {
        self.pool.ping().await
    }

    async fn timestamp_bound(&self, series: &SeriesIdentity, bound: &str) -> Result<Option<Timestamp>> {
        let conn = self.pool.get().await?;
        let sql = format!("SELECT {}(time_ms) FROM points WHERE {}", bound, SERIES_FILTER);
        let row = conn
            .query_one(
                sql.as_str(),
                &[&series.measurement, &tag(&series.platform), &tag(&series.stream)],
            )
            .await
            .map_err(StoreError::Query)?;
        Ok(row.get(0))
    }
}

#[async_trait]
impl TimeSeriesStore for PgStore {
    #[instrument(skip(self))]
    async fn list_series(&self, measurement: &str) -> Result<Vec<SeriesIdentity>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT DISTINCT platform, stream FROM points WHERE measurement = $1 ORDER BY platform, stream",
                &[&measurement],
            )
            .await
            .map_err(StoreError::Query)?;

        Ok(rows
            .into_iter()
            .map(|row| SeriesIdentity {
                measurement: measurement.to_string(),
                platform: untag(row.get(0)),
                stream: untag(row.get(1)),
            })
            .collect())
    }

    async fn first_timestamp(&self, series: &SeriesIdentity) -> Result<Option<Timestamp>> {
        self.timestamp_bound(series, "min").await
    }

    async fn last_timestamp(&self, series: &SeriesIdentity) -> Result<Option<Timestamp>> {
        self.timestamp_bound(series, "max").await
    }

    #[instrument(skip(self, query), fields(series = %query.series, window = %query.window))]
    async fn query_aggregate(&self, query: &AggregateQuery) -> Result<Option<Record>> {
        let conn = self.pool.get().await?;
        let platform = tag(&query.series.platform);
        let stream = tag(&query.series.stream);
        let (start, end) = (query.window.start, query.window.end);

        let exists: bool = conn
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM points WHERE measurement = $1 AND platform = $2 \
                 AND stream = $3 AND time_ms >= $4 AND time_ms < $5)",
                &[&query.series.measurement, &platform, &stream, &start, &end],
            )
            .await
            .map_err(StoreError::Query)?
            .get(0);
        if !exists {
            return Ok(None);
        }

        let mut record = Record::new(&query.series, end);
        for rule in &query.strategy {
            let expr = rule.parse()?;
            let filter = format!(
                "{} AND field = $4 AND time_ms >= $5 AND time_ms < $6",
                SERIES_FILTER
            );
            let params: [&(dyn tokio_postgres::types::ToSql + Sync); 6] = [
                &query.series.measurement,
                &platform,
                &stream,
                &expr.field,
                &start,
                &end,
            ];

            let value: Option<f64> = match (expr.func, expr.func.sql_name()) {
                (_, Some(func)) => conn
                    .query_one(
                        format!("SELECT {}(value)::DOUBLE PRECISION FROM points WHERE {}", func, filter).as_str(),
                        &params,
                    )
                    .await
                    .map_err(StoreError::Query)?
                    .get(0),
                (AggregateFn::First, None) | (AggregateFn::Last, None) => {
                    let order = if expr.func == AggregateFn::First { "ASC" } else { "DESC" };
                    conn.query_opt(
                        format!("SELECT value FROM points WHERE {} ORDER BY time_ms {} LIMIT 1", filter, order)
                            .as_str(),
                        &params,
                    )
                    .await
                    .map_err(StoreError::Query)?
                    .map(|row| row.get(0))
                }
                (func, None) => {
                    return Err(StoreError::InvalidExpression(func.name().to_string()));
                }
            };

            if let Some(value) = value {
                record.fields.insert(rule.obs_type.clone(), value);
            }
        }

        if record.fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(record))
    }

    #[instrument(skip(self, record), fields(ts = record.timestamp))]
    async fn write_record(&self, destination: &str, record: &Record) -> Result<()> {
        validate_write(destination, record)?;

        let platform = tag(&record.platform);
        let stream = tag(&record.stream);

        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await.map_err(StoreError::Query)?;
        for (field, value) in &record.fields {
            tx.execute(
                "INSERT INTO points (measurement, time_ms, platform, stream, field, value) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (measurement, platform, stream, time_ms, field) DO UPDATE SET value = EXCLUDED.value",
                &[&destination, &record.timestamp, &platform, &stream, field, value],
            )
            .await
            .map_err(StoreError::Query)?;
        }
        tx.commit().await.map_err(StoreError::Query)?;
        Ok(())
    }

    #[instrument(skip(self, rule), fields(rule = %rule.name))]
    async fn install_persistent_rule(&self, rule: &PersistentRule) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(
            "INSERT INTO continuous_queries \
             (name, database, retention_policy, source, destination, interval_ms, clause, statement) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (name) DO UPDATE SET \
             database = EXCLUDED.database, retention_policy = EXCLUDED.retention_policy, \
             source = EXCLUDED.source, destination = EXCLUDED.destination, \
             interval_ms = EXCLUDED.interval_ms, clause = EXCLUDED.clause, \
             statement = EXCLUDED.statement, installed_at = now()",
            &[
                &rule.name,
                &rule.database,
                &rule.retention_policy,
                &rule.source,
                &rule.destination,
                &rule.interval_ms,
                &rule.clause,
                &rule.statement,
            ],
        )
        .await
        .map_err(StoreError::Query)?;
        Ok(())
    }

    async fn latest_record(&self, measurement: &str) -> Result<Option<Record>> {
        let conn = self.pool.get().await?;
        let Some(head) = conn
            .query_opt(
                "SELECT time_ms, platform, stream FROM points WHERE measurement = $1 \
                 ORDER BY time_ms DESC LIMIT 1",
                &[&measurement],
            )
            .await
            .map_err(StoreError::Query)?
        else {
            return Ok(None);
        };

        let timestamp: i64 = head.get(0);
        let platform: String = head.get(1);
        let stream: String = head.get(2);

        let rows = conn
            .query(
                "SELECT field, value FROM points WHERE measurement = $1 AND platform = $2 \
                 AND stream = $3 AND time_ms = $4",
                &[&measurement, &platform, &stream, &timestamp],
            )
            .await
            .map_err(StoreError::Query)?;

        let mut record = Record::new(
            &SeriesIdentity {
                measurement: measurement.to_string(),
                platform: untag(platform),
                stream: untag(stream),
            },
            timestamp,
        );
        for row in rows {
            record.fields.insert(row.get(0), row.get(1));
        }
        Ok(Some(record))
    }
}
