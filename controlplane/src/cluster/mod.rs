//! Kubernetes cluster lifecycle management.
//!
//! One provider (k3d, a lightweight in-container distribution) backs
//! every ECS cluster; the trait keeps the door open for others and lets
//! tests run against a mock.

use async_trait::async_trait;
use kecs_shared::ecs::error::EcsError;
use std::path::PathBuf;
use std::time::Duration;

pub mod k3d;

/// Interval between API server readiness probes
pub const READY_PROBE_INTERVAL: Duration = Duration::from_secs(2);
/// Overall deadline for cluster creation
pub const CREATE_DEADLINE: Duration = Duration::from_secs(300);
/// Default deadline for a readiness wait on an existing cluster
pub const READY_DEADLINE: Duration = Duration::from_secs(60);

/// Observed state of a provisioned cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterInfo {
    pub name: String,
    pub running: bool,
    pub servers: u32,
    pub agents: u32,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterProvider: Send + Sync {
    /// Provision the cluster and wait until its API server answers a
    /// `list nodes` probe. A no-op when the cluster already exists.
    async fn create_cluster(&self, name: &str) -> Result<(), EcsError>;

    /// Tear the cluster down and remove its kubeconfig. A no-op when
    /// the cluster does not exist.
    async fn delete_cluster(&self, name: &str) -> Result<(), EcsError>;

    /// Start a stopped cluster. A no-op when it is already running.
    async fn start_cluster(&self, name: &str) -> Result<(), EcsError>;

    /// Stop a running cluster without destroying its state.
    async fn stop_cluster(&self, name: &str) -> Result<(), EcsError>;

    async fn cluster_exists(&self, name: &str) -> Result<bool, EcsError>;

    async fn get_cluster_info(&self, name: &str) -> Result<Option<ClusterInfo>, EcsError>;

    /// Block until the API server answers, probing every
    /// [`READY_PROBE_INTERVAL`] within `timeout`.
    async fn wait_for_cluster_ready(&self, name: &str, timeout: Duration) -> Result<(), EcsError>;

    /// Where this provider materializes the cluster's kubeconfig.
    fn kubeconfig_path(&self, name: &str) -> PathBuf;
}
