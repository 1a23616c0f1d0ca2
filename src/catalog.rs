use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Catalog entry for a bookable service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub id: Ulid,
    pub name: String,
    pub duration_minutes: u32,
    pub default_price: u32,
}

/// Read-only source of service durations and prices.
#[async_trait]
pub trait ServiceCatalog: Send + Sync {
    async fn lookup(&self, service_id: Ulid) -> Option<ServiceInfo>;
}

/// In-memory catalog, seeded from configuration.
#[derive(Default)]
pub struct StaticCatalog {
    services: DashMap<Ulid, ServiceInfo>,
}

impl StaticCatalog {
    pub fn new(services: impl IntoIterator<Item = ServiceInfo>) -> Self {
        let catalog = Self::default();
        for service in services {
            catalog.insert(service);
        }
        catalog
    }

    pub fn insert(&self, service: ServiceInfo) {
        self.services.insert(service.id, service);
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[async_trait]
impl ServiceCatalog for StaticCatalog {
    async fn lookup(&self, service_id: Ulid) -> Option<ServiceInfo> {
        self.services.get(&service_id).map(|e| e.value().clone())
    }
}
