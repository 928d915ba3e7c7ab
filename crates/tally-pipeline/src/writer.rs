use std::sync::Arc;

use chrono::{DateTime, Utc};
use tally_common::{
    HistogramSample, MetricIdentity, MetricSample, SamplePayload,
    error::{Result, TallyError},
};
use tally_store::MetricStore;

/// Appends samples to the value or histogram series of a resolved metric.
pub struct TimeSeriesWriter {
    store: Arc<dyn MetricStore>,
}

impl TimeSeriesWriter {
    pub fn new(store: Arc<dyn MetricStore>) -> Self {
        Self { store }
    }

    pub async fn append(
        &self,
        metric: &MetricIdentity,
        time: DateTime<Utc>,
        payload: &SamplePayload,
    ) -> Result<()> {
        if !payload.matches_kind(metric.kind) {
            return Err(TallyError::Validation(format!(
                "metric {} is a {} but the sample does not match",
                metric.id, metric.kind
            )));
        }

        match payload {
            SamplePayload::Value(value) => {
                self.store
                    .append_value(&MetricSample {
                        time,
                        metric_id: metric.id,
                        value: *value,
                    })
                    .await
            }
            SamplePayload::Histogram(data) => {
                if data.bucket_counts.len() != metric.bucket_count() {
                    return Err(TallyError::Validation(format!(
                        "metric {} has {} bound(s) and needs {} bucket count(s), got {}",
                        metric.id,
                        metric.bounds.len(),
                        metric.bucket_count(),
                        data.bucket_counts.len()
                    )));
                }
                self.store
                    .append_histogram(&HistogramSample {
                        time,
                        metric_id: metric.id,
                        sum: data.sum,
                        count: data.count,
                        bucket_counts: data.bucket_counts.clone(),
                    })
                    .await
            }
        }
    }
}
