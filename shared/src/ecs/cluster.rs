//! Cluster entity.

use super::Tag;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterStatus {
    #[serde(rename = "ACTIVE")]
    Active,
    #[serde(rename = "INACTIVE")]
    Inactive,
}

impl ClusterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterStatus::Active => "ACTIVE",
            ClusterStatus::Inactive => "INACTIVE",
        }
    }
}

/// Capacity provider strategy entry recorded verbatim from
/// PutClusterCapacityProviders.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CapacityProviderStrategyItem {
    pub capacity_provider: String,
    #[serde(default)]
    pub weight: i32,
    #[serde(default)]
    pub base: i32,
}

/// Cluster entity as persisted in the store. Identity is
/// `(region, account, name)`; the bound Kubernetes cluster is recorded so
/// the lifecycle manager can find it again after a restart.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub cluster_arn: String,
    pub cluster_name: String,
    pub status: ClusterStatus,
    pub region: String,
    /// Name of the backing Kubernetes cluster (`kecs-<name>`)
    pub k8s_cluster_name: String,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub capacity_providers: Vec<String>,
    #[serde(default)]
    pub default_capacity_provider_strategy: Vec<CapacityProviderStrategyItem>,
    #[serde(default)]
    pub registered_container_instances_count: i32,
    #[serde(default)]
    pub running_tasks_count: i32,
    #[serde(default)]
    pub pending_tasks_count: i32,
    #[serde(default)]
    pub active_services_count: i32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub version: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_serializes_camel_case() {
        let cluster = Cluster {
            cluster_arn: "arn:aws:ecs:us-east-1:000000000000:cluster/production".to_string(),
            cluster_name: "production".to_string(),
            status: ClusterStatus::Active,
            region: "us-east-1".to_string(),
            k8s_cluster_name: "kecs-production".to_string(),
            tags: vec![],
            capacity_providers: vec![],
            default_capacity_provider_strategy: vec![],
            registered_container_instances_count: 0,
            running_tasks_count: 0,
            pending_tasks_count: 0,
            active_services_count: 0,
            created_at: Utc::now(),
            version: 1,
        };
        let value = serde_json::to_value(&cluster).unwrap();
        assert_eq!("ACTIVE", value["status"]);
        assert_eq!("production", value["clusterName"]);
        assert_eq!("kecs-production", value["k8sClusterName"]);
    }
}
