//! Shared dependencies handed to the managers, watchers and handlers.

use crate::batch_updater::BatchUpdater;
use crate::gateway::ports::PortAllocator;
use kecs_shared::ecs::arn::Identifiers;
use kecs_shared::k8s::ControlPlaneKubeClient;
use kecs_shared::store::DataStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct ControlPlaneContext {
    pub client: Arc<dyn ControlPlaneKubeClient>,
    pub store: Arc<dyn DataStore>,
    pub identifiers: Identifiers,
    pub batch_updater: Arc<BatchUpdater>,
    pub port_allocator: Arc<PortAllocator>,
    /// Per-service serialization for primary-TaskSet flips; taking the
    /// lock for a service ARN orders concurrent selector updates
    service_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ControlPlaneContext {
    pub fn new(
        client: Arc<dyn ControlPlaneKubeClient>,
        store: Arc<dyn DataStore>,
        identifiers: Identifiers,
        batch_updater: Arc<BatchUpdater>,
    ) -> Self {
        ControlPlaneContext {
            client,
            store,
            identifiers,
            batch_updater,
            port_allocator: Arc::new(PortAllocator::default()),
            service_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Lock guarding selector updates for one service.
    pub async fn service_lock(&self, service_arn: &str) -> Arc<Mutex<()>> {
        let mut locks = self.service_locks.lock().await;
        locks
            .entry(service_arn.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
