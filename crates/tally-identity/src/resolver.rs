use std::sync::Arc;

use tally_common::{
    Attributes, CanonicalKey, MetricIdentity, MetricKind,
    error::{Result, TallyError},
};
use tally_store::{MetricStore, NewMetric};
use tracing::{debug, info};

use crate::{
    cache::BoundedCache,
    registrar::{ApplicationRegistrar, derive_name},
};

/// Maps canonical metric keys to stable identities, creating them on first sight.
///
/// Uniqueness is decided by the store: a lost insert race is answered by
/// re-reading the winner's row, so any number of resolvers in any number of
/// processes converge on the same id for the same key.
pub struct IdentityResolver {
    store: Arc<dyn MetricStore>,
    registrar: Arc<ApplicationRegistrar>,
    cache: BoundedCache<CanonicalKey, MetricIdentity>,
}

impl IdentityResolver {
    pub fn new(
        store: Arc<dyn MetricStore>,
        registrar: Arc<ApplicationRegistrar>,
        cache_capacity: usize,
    ) -> Self {
        Self {
            store,
            registrar,
            cache: BoundedCache::new(cache_capacity),
        }
    }

    pub fn cache(&self) -> &BoundedCache<CanonicalKey, MetricIdentity> {
        &self.cache
    }

    pub fn registrar(&self) -> &ApplicationRegistrar {
        &self.registrar
    }

    pub async fn resolve(
        &self,
        name: &str,
        kind: MetricKind,
        attributes: &Attributes,
        bounds: Option<&[f64]>,
    ) -> Result<MetricIdentity> {
        let key = CanonicalKey::new(name, attributes, bounds)?;
        self.resolve_key(&key, kind, None, None).await
    }

    /// `description` and `unit` are only recorded when this call creates the metric.
    pub async fn resolve_key(
        &self,
        key: &CanonicalKey,
        kind: MetricKind,
        description: Option<&str>,
        unit: Option<&str>,
    ) -> Result<MetricIdentity> {
        if let Some(identity) = self.cache.get(key) {
            return Ok(identity);
        }

        if let Some(identity) = self.store.find_metric(key).await? {
            self.cache.insert(key.clone(), identity.clone());
            return Ok(identity);
        }

        let application = self
            .registrar
            .resolve_or_create(&derive_name(key.attributes()))
            .await?;
        let metric = NewMetric {
            key: key.clone(),
            kind,
            description: description.map(str::to_string),
            unit: unit.map(str::to_string),
            application_id: application.id,
        };

        let identity = match self.store.insert_metric(&metric).await {
            Ok(Some(created)) => {
                info!(
                    metric_id = created.id,
                    metric = %created.name,
                    application_id = created.application_id,
                    application = %application.name,
                    "created metric"
                );
                created
            }
            Ok(None) | Err(TallyError::Conflict(_)) => {
                debug!(metric = key.name(), "lost metric create race, re-fetching");
                self.store.find_metric(key).await?.ok_or_else(|| {
                    TallyError::InternalError(format!(
                        "metric {:?} conflicted on insert but is not visible",
                        key.name()
                    ))
                })?
            }
            Err(err) => return Err(err),
        };
        self.cache.insert(key.clone(), identity.clone());
        Ok(identity)
    }
}
