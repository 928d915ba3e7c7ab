use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    PgPool, Row,
    postgres::{PgConnectOptions, PgPoolOptions, PgRow},
    types::Json,
};
use tally_common::{
    ApplicationIdentity, AuditAction, AuditEvent, Attributes, CanonicalKey, HistogramSample,
    MetricIdentity, MetricKind, MetricSample,
    error::{Result, TallyError},
};
use tracing::{debug, info};

use crate::traits::{MetricStore, NewMetric};

const SCHEMA: &str = include_str!("../sql/schema.sql");

const TIMESCALE_SCHEMA: &str = "
CREATE EXTENSION IF NOT EXISTS timescaledb;
SELECT create_hypertable('metrics_values', 'time', if_not_exists => TRUE, migrate_data => TRUE);
SELECT create_hypertable('metrics_histograms', 'time', if_not_exists => TRUE, migrate_data => TRUE);
";

const DEDUP_SCHEMA: &str = "
CREATE UNIQUE INDEX IF NOT EXISTS metrics_values_dedup_idx ON metrics_values (metric_id, time);
CREATE UNIQUE INDEX IF NOT EXISTS metrics_histograms_dedup_idx ON metrics_histograms (metric_id, time);
";

const METRIC_COLUMNS: &str = "id, name, description, unit, type, attributes, explicit_bounds, \
                              application_id, created_at";

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub url: String,
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub command_timeout: Duration,
    pub timescale: bool,
    pub dedup_samples: bool,
}

impl PostgresConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            min_connections: 1,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(60),
            timescale: false,
            dedup_samples: false,
        }
    }
}

/// `MetricStore` over Postgres (optionally TimescaleDB).
///
/// Create-or-fetch relies on `ON CONFLICT DO NOTHING ... RETURNING`, so
/// concurrent processes racing on one key are arbitrated by the unique index.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
    config: PostgresConfig,
}

impl PostgresStore {
    pub async fn connect(config: PostgresConfig) -> Result<Self> {
        let options = PgConnectOptions::from_str(&config.url)
            .map_err(|err| TallyError::InternalError(format!("invalid database url: {err}")))?
            .options([(
                "statement_timeout",
                config.command_timeout.as_millis().to_string(),
            )]);

        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await
            .map_err(map_sqlx_error)?;

        info!(
            min_connections = config.min_connections,
            max_connections = config.max_connections,
            timescale = config.timescale,
            dedup_samples = config.dedup_samples,
            "connected to postgres"
        );
        Ok(Self { pool, config })
    }

    /// Applies the schema; every statement is idempotent.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        if self.config.timescale {
            sqlx::raw_sql(TIMESCALE_SCHEMA)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        }
        if self.config.dedup_samples {
            sqlx::raw_sql(DEDUP_SCHEMA)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        }
        info!("database schema is up to date");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn sample_conflict_clause(&self) -> &'static str {
        if self.config.dedup_samples {
            " ON CONFLICT DO NOTHING"
        } else {
            ""
        }
    }
}

#[async_trait]
impl MetricStore for PostgresStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn insert_application(&self, name: &str) -> Result<Option<ApplicationIdentity>> {
        let row = sqlx::query(
            "INSERT INTO application (name) VALUES ($1) \
             ON CONFLICT (name) DO NOTHING \
             RETURNING id, name, owner_id, created_at",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.as_ref().map(application_from_row).transpose()
    }

    async fn find_application(&self, name: &str) -> Result<Option<ApplicationIdentity>> {
        let row = sqlx::query(
            "SELECT id, name, owner_id, created_at FROM application WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.as_ref().map(application_from_row).transpose()
    }

    async fn delete_application(&self, id: i64) -> Result<()> {
        let referenced: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM metrics_info WHERE application_id = $1")
                .bind(id)
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        if referenced > 0 {
            return Err(TallyError::ApplicationInUse {
                id,
                metrics: referenced as usize,
            });
        }

        let result = sqlx::query("DELETE FROM application WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|err| {
                // A metric may be attached between the count and the delete.
                if foreign_key_violation(&err) {
                    TallyError::ApplicationInUse { id, metrics: 1 }
                } else {
                    map_sqlx_error(err)
                }
            })?;

        if result.rows_affected() == 0 {
            return Err(TallyError::NotFound(format!("application {id}")));
        }
        Ok(())
    }

    async fn insert_metric(&self, metric: &NewMetric) -> Result<Option<MetricIdentity>> {
        let bounds = non_empty_bounds(metric.key.bounds());
        let row = sqlx::query(
            "INSERT INTO metrics_info \
             (name, description, unit, type, attributes, explicit_bounds, application_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT DO NOTHING \
             RETURNING id, created_at",
        )
        .bind(metric.key.name())
        .bind(metric.description.as_deref())
        .bind(metric.unit.as_deref())
        .bind(metric.kind.as_str())
        .bind(Json(metric.key.attributes()))
        .bind(bounds)
        .bind(metric.application_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let Some(row) = row else {
            debug!(name = metric.key.name(), "metric insert lost uniqueness race");
            return Ok(None);
        };

        Ok(Some(MetricIdentity {
            id: row.try_get("id").map_err(map_sqlx_error)?,
            name: metric.key.name().to_string(),
            description: metric.description.clone(),
            unit: metric.unit.clone(),
            kind: metric.kind,
            attributes: metric.key.attributes().clone(),
            bounds: metric.key.bounds().to_vec(),
            application_id: metric.application_id,
            created_at: row.try_get("created_at").map_err(map_sqlx_error)?,
        }))
    }

    async fn find_metric(&self, key: &CanonicalKey) -> Result<Option<MetricIdentity>> {
        let query = format!(
            "SELECT {METRIC_COLUMNS} FROM metrics_info \
             WHERE name = $1 AND attributes = $2 \
             AND COALESCE(explicit_bounds, '{{}}'::DOUBLE PRECISION[]) = $3"
        );
        let row = sqlx::query(&query)
            .bind(key.name())
            .bind(Json(key.attributes()))
            .bind(key.bounds().to_vec())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.as_ref().map(metric_from_row).transpose()
    }

    async fn get_metric(&self, id: i64) -> Result<Option<MetricIdentity>> {
        let query = format!("SELECT {METRIC_COLUMNS} FROM metrics_info WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.as_ref().map(metric_from_row).transpose()
    }

    async fn append_value(&self, sample: &MetricSample) -> Result<()> {
        let query = format!(
            "INSERT INTO metrics_values (time, metric_id, value) VALUES ($1, $2, $3){}",
            self.sample_conflict_clause()
        );
        sqlx::query(&query)
            .bind(sample.time)
            .bind(sample.metric_id)
            .bind(sample.value)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn append_histogram(&self, sample: &HistogramSample) -> Result<()> {
        let count = to_bigint(sample.count, "count")?;
        let bucket_counts = sample
            .bucket_counts
            .iter()
            .map(|&value| to_bigint(value, "bucket_counts"))
            .collect::<Result<Vec<i64>>>()?;

        let query = format!(
            "INSERT INTO metrics_histograms (time, metric_id, sum, count, bucket_counts) \
             VALUES ($1, $2, $3, $4, $5){}",
            self.sample_conflict_clause()
        );
        sqlx::query(&query)
            .bind(sample.time)
            .bind(sample.metric_id)
            .bind(sample.sum)
            .bind(count)
            .bind(bucket_counts)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn record_audit_event(&self, event: &AuditEvent) -> Result<i64> {
        sqlx::query_scalar(
            "INSERT INTO audit_log \
             (user_id, session_key, action, target, ip_address, user_agent, status_code, timestamp) \
             VALUES ($1, $2, $3, $4, $5::inet, $6, $7, $8) \
             RETURNING id",
        )
        .bind(event.user_id)
        .bind(event.session_key.as_deref())
        .bind(event.action.as_str())
        .bind(event.target.as_deref())
        .bind(&event.ip_address)
        .bind(event.user_agent.as_deref())
        .bind(i32::from(event.status_code))
        .bind(event.timestamp)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)
    }

    async fn list_audit_events(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            "SELECT id, user_id, session_key, action, target, host(ip_address) AS ip_address, \
             user_agent, status_code, timestamp \
             FROM audit_log ORDER BY timestamp DESC, id DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter().map(audit_from_row).collect()
    }
}

fn application_from_row(row: &PgRow) -> Result<ApplicationIdentity> {
    Ok(ApplicationIdentity {
        id: row.try_get("id").map_err(map_sqlx_error)?,
        name: row.try_get("name").map_err(map_sqlx_error)?,
        owner_id: row.try_get("owner_id").map_err(map_sqlx_error)?,
        created_at: row.try_get("created_at").map_err(map_sqlx_error)?,
    })
}

fn metric_from_row(row: &PgRow) -> Result<MetricIdentity> {
    let kind: String = row.try_get("type").map_err(map_sqlx_error)?;
    let Json(attributes): Json<Attributes> = row.try_get("attributes").map_err(map_sqlx_error)?;
    let bounds: Option<Vec<f64>> = row.try_get("explicit_bounds").map_err(map_sqlx_error)?;

    Ok(MetricIdentity {
        id: row.try_get("id").map_err(map_sqlx_error)?,
        name: row.try_get("name").map_err(map_sqlx_error)?,
        description: row.try_get("description").map_err(map_sqlx_error)?,
        unit: row.try_get("unit").map_err(map_sqlx_error)?,
        kind: kind
            .parse::<MetricKind>()
            .map_err(|err| TallyError::Storage(format!("corrupt metrics_info.type: {err}")))?,
        attributes,
        bounds: bounds.unwrap_or_default(),
        application_id: row.try_get("application_id").map_err(map_sqlx_error)?,
        created_at: row.try_get("created_at").map_err(map_sqlx_error)?,
    })
}

fn audit_from_row(row: &PgRow) -> Result<AuditEvent> {
    let action: String = row.try_get("action").map_err(map_sqlx_error)?;
    let status_code: i32 = row.try_get("status_code").map_err(map_sqlx_error)?;
    let timestamp: DateTime<Utc> = row.try_get("timestamp").map_err(map_sqlx_error)?;

    Ok(AuditEvent {
        id: row.try_get("id").map_err(map_sqlx_error)?,
        user_id: row.try_get("user_id").map_err(map_sqlx_error)?,
        session_key: row.try_get("session_key").map_err(map_sqlx_error)?,
        action: action.parse::<AuditAction>()?,
        target: row.try_get("target").map_err(map_sqlx_error)?,
        ip_address: row.try_get("ip_address").map_err(map_sqlx_error)?,
        user_agent: row.try_get("user_agent").map_err(map_sqlx_error)?,
        status_code: status_code_from_column(status_code)?,
        timestamp,
    })
}

fn status_code_from_column(value: i32) -> Result<u16> {
    u16::try_from(value)
        .map_err(|_| TallyError::Storage(format!("corrupt audit_log.status_code: {value}")))
}

fn non_empty_bounds(bounds: &[f64]) -> Option<Vec<f64>> {
    if bounds.is_empty() {
        None
    } else {
        Some(bounds.to_vec())
    }
}

fn to_bigint(value: u64, field: &str) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| TallyError::Validation(format!("{field} value {value} exceeds BIGINT")))
}

fn foreign_key_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == FOREIGN_KEY_VIOLATION)
}

/// Connection-level failures are retryable; everything else is permanent.
pub(crate) fn map_sqlx_error(err: sqlx::Error) -> TallyError {
    match &err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::WorkerCrashed => TallyError::StorageUnavailable(err.to_string()),
        sqlx::Error::Database(db) => {
            let code = db.code().map(|code| code.into_owned()).unwrap_or_default();
            if code == UNIQUE_VIOLATION {
                TallyError::Conflict(db.message().to_string())
            } else if is_transient_sqlstate(&code) {
                TallyError::StorageUnavailable(err.to_string())
            } else {
                TallyError::Storage(err.to_string())
            }
        }
        _ => TallyError::Storage(err.to_string()),
    }
}

fn is_transient_sqlstate(code: &str) -> bool {
    // 08: connection exception, 53: insufficient resources, 57P: operator intervention,
    // 40001/40P01: serialization failure and deadlock.
    code.starts_with("08")
        || code.starts_with("53")
        || code.starts_with("57P")
        || code == "40001"
        || code == "40P01"
}

#[cfg(test)]
mod tests {
    use tally_common::TallyError;

    use super::{
        is_transient_sqlstate, map_sqlx_error, non_empty_bounds, status_code_from_column,
        to_bigint,
    };

    #[test]
    fn pool_exhaustion_is_retryable() {
        assert!(map_sqlx_error(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(matches!(
            map_sqlx_error(sqlx::Error::RowNotFound),
            TallyError::Storage(_)
        ));
    }

    #[test]
    fn transient_sqlstates() {
        assert!(is_transient_sqlstate("08006"));
        assert!(is_transient_sqlstate("57P01"));
        assert!(is_transient_sqlstate("40P01"));
        assert!(!is_transient_sqlstate("23505"));
        assert!(!is_transient_sqlstate("22P02"));
    }

    #[test]
    fn empty_bounds_are_stored_as_null() {
        assert_eq!(non_empty_bounds(&[]), None);
        assert_eq!(non_empty_bounds(&[1.0]), Some(vec![1.0]));
    }

    #[test]
    fn out_of_range_status_code_is_a_storage_error() {
        assert_eq!(status_code_from_column(503).unwrap(), 503);
        assert!(matches!(
            status_code_from_column(70_000),
            Err(TallyError::Storage(_))
        ));
        assert!(matches!(
            status_code_from_column(-1),
            Err(TallyError::Storage(_))
        ));
    }

    #[test]
    fn oversized_counts_are_rejected() {
        assert!(to_bigint(u64::MAX, "count").is_err());
        assert_eq!(to_bigint(42, "count").unwrap(), 42);
    }

    /// Run with `DATABASE_URL=postgres://... cargo test -p tally-store -- --ignored`.
    mod live {
        use std::collections::BTreeMap;

        use chrono::Utc;
        use tally_common::{CanonicalKey, MetricKind, key::attribute};

        use super::super::{PostgresConfig, PostgresStore};
        use crate::traits::{MetricStore, NewMetric};

        async fn connect() -> Option<PostgresStore> {
            let url = std::env::var("DATABASE_URL").ok()?;
            let store = PostgresStore::connect(PostgresConfig::new(url)).await.unwrap();
            store.migrate().await.unwrap();
            Some(store)
        }

        fn unique(prefix: &str) -> String {
            format!(
                "{prefix}-{}-{}",
                std::process::id(),
                Utc::now().timestamp_nanos_opt().unwrap_or_default()
            )
        }

        fn counter(name: &str, key: CanonicalKey, application_id: i64) -> NewMetric {
            assert_eq!(key.name(), name);
            NewMetric {
                key,
                kind: MetricKind::Counter,
                description: Some("requests served".to_string()),
                unit: Some("1".to_string()),
                application_id,
            }
        }

        #[tokio::test]
        #[ignore = "needs DATABASE_URL"]
        async fn duplicate_inserts_return_none() {
            let Some(store) = connect().await else { return };
            let app_name = unique("api");
            let app = store.insert_application(&app_name).await.unwrap().unwrap();
            assert!(store.insert_application(&app_name).await.unwrap().is_none());
            assert_eq!(
                store.find_application(&app_name).await.unwrap().unwrap().id,
                app.id
            );

            let name = unique("http.requests");
            let attributes = BTreeMap::from([attribute("service.name", "api")]);
            let key = CanonicalKey::new(&name, &attributes, None).unwrap();
            let first = store
                .insert_metric(&counter(&name, key.clone(), app.id))
                .await
                .unwrap()
                .unwrap();
            assert!(
                store
                    .insert_metric(&counter(&name, key.clone(), app.id))
                    .await
                    .unwrap()
                    .is_none()
            );
            let found = store.find_metric(&key).await.unwrap().unwrap();
            assert_eq!(found.id, first.id);
            assert_eq!(found.description.as_deref(), Some("requests served"));
        }

        #[tokio::test]
        #[ignore = "needs DATABASE_URL"]
        async fn integral_floats_and_empty_bounds_find_the_same_row() {
            let Some(store) = connect().await else { return };
            let app = store
                .insert_application(&unique("batch"))
                .await
                .unwrap()
                .unwrap();
            let name = unique("jobs");

            let as_float = BTreeMap::from([attribute("shard", 1.0)]);
            let no_bounds: &[f64] = &[];
            let stored_key = CanonicalKey::new(&name, &as_float, Some(no_bounds)).unwrap();
            let stored = store
                .insert_metric(&counter(&name, stored_key, app.id))
                .await
                .unwrap()
                .unwrap();

            let as_int = BTreeMap::from([attribute("shard", 1i64)]);
            let lookup = CanonicalKey::new(&name, &as_int, None).unwrap();
            let found = store.find_metric(&lookup).await.unwrap().unwrap();
            assert_eq!(found.id, stored.id);
            assert!(found.bounds.is_empty());
        }

        #[tokio::test]
        #[ignore = "needs DATABASE_URL"]
        async fn empty_array_and_null_bounds_share_the_unique_key() {
            let Some(store) = connect().await else { return };
            let app = store
                .insert_application(&unique("web"))
                .await
                .unwrap()
                .unwrap();
            let name = unique("sessions");

            sqlx::query(
                "INSERT INTO metrics_info (name, type, attributes, explicit_bounds, application_id) \
                 VALUES ($1, 'gauge', '{}'::jsonb, '{}'::DOUBLE PRECISION[], $2)",
            )
            .bind(&name)
            .bind(app.id)
            .execute(&store.pool)
            .await
            .unwrap();

            let key = CanonicalKey::new(&name, &BTreeMap::new(), None).unwrap();
            assert!(
                store
                    .insert_metric(&counter(&name, key.clone(), app.id))
                    .await
                    .unwrap()
                    .is_none()
            );
            let found = store.find_metric(&key).await.unwrap().unwrap();
            assert_eq!(found.kind, MetricKind::Gauge);
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        #[ignore = "needs DATABASE_URL"]
        async fn concurrent_inserts_create_one_row() {
            let Some(store) = connect().await else { return };
            let app = store
                .insert_application(&unique("racers"))
                .await
                .unwrap()
                .unwrap();
            let name = unique("race");
            let attributes = BTreeMap::from([attribute("region", "eu")]);
            let key = CanonicalKey::new(&name, &attributes, None).unwrap();

            let tasks: Vec<_> = (0..8)
                .map(|_| {
                    let store = store.clone();
                    let metric = counter(&name, key.clone(), app.id);
                    tokio::spawn(async move { store.insert_metric(&metric).await })
                })
                .collect();
            let mut created = 0;
            for result in futures::future::join_all(tasks).await {
                if result.unwrap().unwrap().is_some() {
                    created += 1;
                }
            }
            assert_eq!(created, 1);

            let rows: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM metrics_info WHERE name = $1",
            )
            .bind(&name)
            .fetch_one(&store.pool)
            .await
            .unwrap();
            assert_eq!(rows, 1);
        }
    }
}
