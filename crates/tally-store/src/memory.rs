use std::{
    collections::{HashMap, HashSet},
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tally_common::{
    ApplicationIdentity, AuditEvent, CanonicalKey, HistogramSample, MetricIdentity, MetricSample,
    error::{Result, TallyError},
};

use crate::traits::{MetricStore, NewMetric};

#[derive(Debug, Default)]
struct MemoryState {
    next_application_id: i64,
    next_metric_id: i64,
    next_audit_id: i64,
    applications: HashMap<i64, ApplicationIdentity>,
    application_by_name: HashMap<String, i64>,
    metrics: HashMap<i64, MetricIdentity>,
    metric_by_key: HashMap<CanonicalKey, i64>,
    values: Vec<MetricSample>,
    histograms: Vec<HistogramSample>,
    value_keys: HashSet<(i64, DateTime<Utc>)>,
    histogram_keys: HashSet<(i64, DateTime<Utc>)>,
    audit_log: Vec<AuditEvent>,
}

/// In-process store with the same uniqueness and reference rules as the SQL schema.
///
/// Every operation takes one lock, so each insert is atomic with respect to
/// its conflict check, which is the property the resolvers rely on.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    available: AtomicBool,
    dedup_samples: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            available: AtomicBool::new(true),
            dedup_samples: false,
        }
    }

    /// Drop repeated samples with the same `(metric_id, time)`.
    pub fn with_sample_dedup(mut self, enabled: bool) -> Self {
        self.dedup_samples = enabled;
        self
    }

    /// While unavailable every call fails with `StorageUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn applications(&self) -> Result<Vec<ApplicationIdentity>> {
        let state = self.state()?;
        let mut applications: Vec<_> = state.applications.values().cloned().collect();
        applications.sort_by_key(|application| application.id);
        Ok(applications)
    }

    pub fn metrics(&self) -> Result<Vec<MetricIdentity>> {
        let state = self.state()?;
        let mut metrics: Vec<_> = state.metrics.values().cloned().collect();
        metrics.sort_by_key(|metric| metric.id);
        Ok(metrics)
    }

    pub fn values(&self) -> Result<Vec<MetricSample>> {
        Ok(self.state()?.values.clone())
    }

    pub fn histograms(&self) -> Result<Vec<HistogramSample>> {
        Ok(self.state()?.histograms.clone())
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| TallyError::InternalError("memory store lock poisoned".to_string()))
    }

    fn checked_state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(TallyError::StorageUnavailable(
                "memory store is offline".to_string(),
            ));
        }
        self.state()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        self.checked_state().map(|_| ())
    }

    async fn insert_application(&self, name: &str) -> Result<Option<ApplicationIdentity>> {
        let mut state = self.checked_state()?;
        if state.application_by_name.contains_key(name) {
            return Ok(None);
        }

        state.next_application_id += 1;
        let application = ApplicationIdentity {
            id: state.next_application_id,
            name: name.to_string(),
            owner_id: None,
            created_at: Utc::now(),
        };
        state
            .application_by_name
            .insert(application.name.clone(), application.id);
        state.applications.insert(application.id, application.clone());
        Ok(Some(application))
    }

    async fn find_application(&self, name: &str) -> Result<Option<ApplicationIdentity>> {
        let state = self.checked_state()?;
        Ok(state
            .application_by_name
            .get(name)
            .and_then(|id| state.applications.get(id))
            .cloned())
    }

    async fn delete_application(&self, id: i64) -> Result<()> {
        let mut state = self.checked_state()?;
        if !state.applications.contains_key(&id) {
            return Err(TallyError::NotFound(format!("application {id}")));
        }

        let metrics = state
            .metrics
            .values()
            .filter(|metric| metric.application_id == id)
            .count();
        if metrics > 0 {
            return Err(TallyError::ApplicationInUse { id, metrics });
        }

        if let Some(application) = state.applications.remove(&id) {
            state.application_by_name.remove(&application.name);
        }
        Ok(())
    }

    async fn insert_metric(&self, metric: &NewMetric) -> Result<Option<MetricIdentity>> {
        let mut state = self.checked_state()?;
        if state.metric_by_key.contains_key(&metric.key) {
            return Ok(None);
        }
        if !state.applications.contains_key(&metric.application_id) {
            return Err(TallyError::Storage(format!(
                "metric references unknown application {}",
                metric.application_id
            )));
        }

        state.next_metric_id += 1;
        let identity = MetricIdentity {
            id: state.next_metric_id,
            name: metric.key.name().to_string(),
            description: metric.description.clone(),
            unit: metric.unit.clone(),
            kind: metric.kind,
            attributes: metric.key.attributes().clone(),
            bounds: metric.key.bounds().to_vec(),
            application_id: metric.application_id,
            created_at: Utc::now(),
        };
        state.metric_by_key.insert(metric.key.clone(), identity.id);
        state.metrics.insert(identity.id, identity.clone());
        Ok(Some(identity))
    }

    async fn find_metric(&self, key: &CanonicalKey) -> Result<Option<MetricIdentity>> {
        let state = self.checked_state()?;
        Ok(state
            .metric_by_key
            .get(key)
            .and_then(|id| state.metrics.get(id))
            .cloned())
    }

    async fn get_metric(&self, id: i64) -> Result<Option<MetricIdentity>> {
        Ok(self.checked_state()?.metrics.get(&id).cloned())
    }

    async fn append_value(&self, sample: &MetricSample) -> Result<()> {
        let mut state = self.checked_state()?;
        if !state.metrics.contains_key(&sample.metric_id) {
            return Err(TallyError::Storage(format!(
                "sample references unknown metric {}",
                sample.metric_id
            )));
        }
        if self.dedup_samples && !state.value_keys.insert((sample.metric_id, sample.time)) {
            return Ok(());
        }
        state.values.push(sample.clone());
        Ok(())
    }

    async fn append_histogram(&self, sample: &HistogramSample) -> Result<()> {
        let mut state = self.checked_state()?;
        if !state.metrics.contains_key(&sample.metric_id) {
            return Err(TallyError::Storage(format!(
                "sample references unknown metric {}",
                sample.metric_id
            )));
        }
        if self.dedup_samples && !state.histogram_keys.insert((sample.metric_id, sample.time)) {
            return Ok(());
        }
        state.histograms.push(sample.clone());
        Ok(())
    }

    async fn record_audit_event(&self, event: &AuditEvent) -> Result<i64> {
        let mut state = self.checked_state()?;
        state.next_audit_id += 1;
        let id = state.next_audit_id;
        state.audit_log.push(AuditEvent {
            id: Some(id),
            ..event.clone()
        });
        Ok(id)
    }

    async fn list_audit_events(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        let state = self.checked_state()?;
        Ok(state.audit_log.iter().rev().take(limit).cloned().collect())
    }
}
