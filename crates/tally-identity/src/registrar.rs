use std::sync::Arc;

use tally_common::{
    ApplicationIdentity, Attributes,
    error::{Result, TallyError},
};
use tally_store::MetricStore;
use tracing::{debug, info};

use crate::cache::BoundedCache;

pub const UNKNOWN_APPLICATION: &str = "unknown";

/// Attribute keys consulted, in order, for the owning application's name.
pub const APPLICATION_NAME_KEYS: [&str; 2] = ["service.name", "application.name"];

/// Name of the application that owns a metric with these attributes.
///
/// Only non-blank string values count.
pub fn derive_name(attributes: &Attributes) -> String {
    APPLICATION_NAME_KEYS
        .iter()
        .filter_map(|key| attributes.get(*key).and_then(|value| value.as_str()))
        .map(str::trim)
        .find(|name| !name.is_empty())
        .unwrap_or(UNKNOWN_APPLICATION)
        .to_string()
}

pub struct ApplicationRegistrar {
    store: Arc<dyn MetricStore>,
    cache: BoundedCache<String, ApplicationIdentity>,
}

impl ApplicationRegistrar {
    pub fn new(store: Arc<dyn MetricStore>, cache_capacity: usize) -> Self {
        Self {
            store,
            cache: BoundedCache::new(cache_capacity),
        }
    }

    pub fn cache(&self) -> &BoundedCache<String, ApplicationIdentity> {
        &self.cache
    }

    /// Id of the application called `name`, creating it on first sight.
    pub async fn resolve_or_create(&self, name: &str) -> Result<ApplicationIdentity> {
        if let Some(application) = self.cache.get(&name.to_string()) {
            return Ok(application);
        }

        if let Some(application) = self.store.find_application(name).await? {
            self.cache.insert(name.to_string(), application.clone());
            return Ok(application);
        }

        let application = match self.store.insert_application(name).await {
            Ok(Some(created)) => {
                info!(application_id = created.id, application = name, "created application");
                created
            }
            Ok(None) | Err(TallyError::Conflict(_)) => {
                debug!(application = name, "lost application create race, re-fetching");
                self.store.find_application(name).await?.ok_or_else(|| {
                    TallyError::InternalError(format!(
                        "application {name:?} conflicted on insert but is not visible"
                    ))
                })?
            }
            Err(err) => return Err(err),
        };
        self.cache.insert(name.to_string(), application.clone());
        Ok(application)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Arc};

    use tally_common::{Attributes, key::attribute};
    use tally_store::{MemoryStore, MetricStore};

    use super::{ApplicationRegistrar, derive_name};

    #[test]
    fn derive_name_prefers_service_name() {
        let attributes: Attributes = BTreeMap::from([
            attribute("application.name", "legacy"),
            attribute("service.name", "billing"),
        ]);
        assert_eq!(derive_name(&attributes), "billing");
    }

    #[test]
    fn derive_name_falls_back_in_order() {
        let only_app: Attributes = BTreeMap::from([attribute("application.name", "portal")]);
        assert_eq!(derive_name(&only_app), "portal");

        let blank_service: Attributes = BTreeMap::from([
            attribute("service.name", "   "),
            attribute("application.name", "portal"),
        ]);
        assert_eq!(derive_name(&blank_service), "portal");

        let non_string: Attributes = BTreeMap::from([attribute("service.name", 7i64)]);
        assert_eq!(derive_name(&non_string), "unknown");

        assert_eq!(derive_name(&Attributes::new()), "unknown");
    }

    #[tokio::test]
    async fn resolve_or_create_is_idempotent_across_registrars() {
        let store = Arc::new(MemoryStore::new());
        let first = ApplicationRegistrar::new(store.clone(), 16);
        let second = ApplicationRegistrar::new(store.clone(), 16);

        let a = first.resolve_or_create("api").await.unwrap();
        let b = second.resolve_or_create("api").await.unwrap();
        let c = first.resolve_or_create("api").await.unwrap();

        assert_eq!(a.id, b.id);
        assert_eq!(a.id, c.id);
        assert_eq!(store.applications().unwrap().len(), 1);
        assert_eq!(first.cache().hits(), 1);
    }

    #[tokio::test]
    async fn concurrent_creation_yields_one_application() {
        let store = Arc::new(MemoryStore::new());
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registrar = ApplicationRegistrar::new(store.clone(), 4);
                tokio::spawn(async move { registrar.resolve_or_create("worker").await })
            })
            .collect();

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap().unwrap().id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert!(store.find_application("worker").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn storage_outage_is_surfaced() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let registrar = ApplicationRegistrar::new(store, 4);
        let err = registrar.resolve_or_create("api").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
