use async_trait::async_trait;
use tally_common::{
    ApplicationIdentity, AuditEvent, CanonicalKey, HistogramSample, MetricIdentity, MetricKind,
    MetricSample,
    error::Result,
};

#[derive(Debug, Clone)]
pub struct NewMetric {
    pub key: CanonicalKey,
    pub kind: MetricKind,
    pub description: Option<String>,
    pub unit: Option<String>,
    pub application_id: i64,
}

/// Backing store for identities and sample series.
///
/// The `insert_*` operations are conflict-do-nothing inserts: `Ok(None)`
/// means another writer already owns the unique key and the caller must
/// re-fetch. Implementations may also surface the same race as
/// `TallyError::Conflict`.
#[async_trait]
pub trait MetricStore: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn insert_application(&self, name: &str) -> Result<Option<ApplicationIdentity>>;
    async fn find_application(&self, name: &str) -> Result<Option<ApplicationIdentity>>;
    /// Rejected with `ApplicationInUse` while any metric references the application.
    async fn delete_application(&self, id: i64) -> Result<()>;

    async fn insert_metric(&self, metric: &NewMetric) -> Result<Option<MetricIdentity>>;
    async fn find_metric(&self, key: &CanonicalKey) -> Result<Option<MetricIdentity>>;
    async fn get_metric(&self, id: i64) -> Result<Option<MetricIdentity>>;

    async fn append_value(&self, sample: &MetricSample) -> Result<()>;
    async fn append_histogram(&self, sample: &HistogramSample) -> Result<()>;

    async fn record_audit_event(&self, event: &AuditEvent) -> Result<i64>;
    /// Newest first.
    async fn list_audit_events(&self, limit: usize) -> Result<Vec<AuditEvent>>;
}
