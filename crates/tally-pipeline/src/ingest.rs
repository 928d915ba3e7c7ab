use std::sync::Arc;

use tally_common::error::Result;
use tally_identity::IdentityResolver;
use tally_stream::MetricPoint;

use crate::writer::TimeSeriesWriter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Stored { metric_id: i64 },
    /// Will never succeed; the entry belongs in the dead-letter sink.
    Rejected(String),
}

/// Resolves a point's identity and writes its sample.
///
/// Retryable failures are returned as errors so the caller keeps the entry
/// unacknowledged; every other failure becomes [`Outcome::Rejected`].
pub struct Ingestor {
    resolver: Arc<IdentityResolver>,
    writer: TimeSeriesWriter,
}

impl Ingestor {
    pub fn new(resolver: Arc<IdentityResolver>, writer: TimeSeriesWriter) -> Self {
        Self { resolver, writer }
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    pub async fn ingest(&self, point: &MetricPoint) -> Result<Outcome> {
        match self.store(point).await {
            Ok(metric_id) => Ok(Outcome::Stored { metric_id }),
            Err(err) if err.is_retryable() => Err(err),
            Err(err) => Ok(Outcome::Rejected(err.to_string())),
        }
    }

    async fn store(&self, point: &MetricPoint) -> Result<i64> {
        let metric = self
            .resolver
            .resolve_key(
                &point.key,
                point.kind,
                point.description.as_deref(),
                point.unit.as_deref(),
            )
            .await?;
        self.writer
            .append(&metric, point.time, &point.payload)
            .await?;
        Ok(metric.id)
    }
}
