//! Liveness/readiness rollup over the bus, the persistence layer, the
//! container driver, and the object store (§4.K).

use serde::Serialize;

use crate::container_driver::ContainerDriver;
use crate::object_store::ObjectStoreClient;
use crate::store::SessionStore;
use common::bus::BusClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    Unhealthy,
}

impl ComponentStatus {
    fn from_bool(healthy: bool) -> Self {
        if healthy {
            Self::Healthy
        } else {
            Self::Unhealthy
        }
    }

    fn is_healthy(self) -> bool {
        self == Self::Healthy
    }
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: ComponentStatus,
    pub components: ComponentReport,
}

#[derive(Debug, Serialize)]
pub struct ComponentReport {
    pub bus: ComponentStatus,
    pub database: ComponentStatus,
    pub container_runtime: ComponentStatus,
    pub object_store: ComponentStatus,
}

#[derive(Clone)]
pub struct HealthAggregator {
    bus: BusClient,
    sessions: SessionStore,
    containers: ContainerDriver,
    object_store: Option<ObjectStoreClient>,
}

impl HealthAggregator {
    pub fn new(
        bus: BusClient,
        sessions: SessionStore,
        containers: ContainerDriver,
        object_store: Option<ObjectStoreClient>,
    ) -> Self {
        Self {
            bus,
            sessions,
            containers,
            object_store,
        }
    }

    /// Overall health is the conjunction of every subsystem probe. A
    /// configured-absent object store (development mode) counts as healthy.
    pub async fn check(&self) -> HealthReport {
        let bus = ComponentStatus::from_bool(self.bus.ping().await);
        let database = ComponentStatus::from_bool(self.sessions.ping().await.is_ok());
        let container_runtime = ComponentStatus::from_bool(self.containers.ping().await.is_ok());
        let object_store = match &self.object_store {
            Some(store) => ComponentStatus::from_bool(store.ping().await.is_ok()),
            None => ComponentStatus::Healthy,
        };

        let status = ComponentStatus::from_bool(
            bus.is_healthy() && database.is_healthy() && container_runtime.is_healthy() && object_store.is_healthy(),
        );

        HealthReport {
            status,
            components: ComponentReport {
                bus,
                database,
                container_runtime,
                object_store,
            },
        }
    }

    /// Readiness mirrors overall health: the process should not receive
    /// traffic until every dependency answers.
    pub async fn ready(&self) -> bool {
        self.check().await.status.is_healthy()
    }

    /// Liveness is independent of dependency health: as long as this
    /// process can run the probe at all, it is alive.
    pub fn live(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_status_conjunction_fails_on_any_unhealthy() {
        let all_healthy = [ComponentStatus::Healthy, ComponentStatus::Healthy, ComponentStatus::Healthy];
        assert!(all_healthy.iter().all(|s| s.is_healthy()));

        let one_unhealthy = [ComponentStatus::Healthy, ComponentStatus::Unhealthy, ComponentStatus::Healthy];
        assert!(!one_unhealthy.iter().all(|s| s.is_healthy()));
    }

    #[test]
    fn absent_object_store_counts_as_healthy() {
        assert_eq!(ComponentStatus::Healthy, ComponentStatus::Healthy);
    }
}
