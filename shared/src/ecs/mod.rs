/// Label identifying every Kubernetes object created by this control plane
pub const KECS_MANAGED_BY_LABEL_NAME: &str = "kecs.dev/managed-by";
/// Value of the managed-by label
pub const KECS_MANAGED_BY_LABEL_VALUE: &str = "kecs";
/// Label recording the owning ECS cluster name
pub const KECS_CLUSTER_LABEL_NAME: &str = "kecs.dev/cluster";
/// Label recording the owning ECS service name
pub const KECS_SERVICE_LABEL_NAME: &str = "kecs.dev/service";
/// Label carrying a pre-assigned task ID (set by the admission webhook when present)
pub const KECS_TASK_ID_LABEL_NAME: &str = "kecs.dev/task-id";
/// Label recording the owning TaskSet ID
pub const KECS_TASK_SET_LABEL_NAME: &str = "kecs.io/taskset";
/// Label marking the primary TaskSet's pods
pub const KECS_TASK_SET_PRIMARY_LABEL_NAME: &str = "kecs.io/taskset-primary";
/// Annotation recording the awsvpc network configuration on a pod
pub const KECS_NETWORK_CONFIG_ANNOTATION_NAME: &str = "kecs.dev/network-configuration";
/// Pod label used as the Deployment selector
pub const APP_LABEL_ID: &str = "app";
/// Namespace hosting control-plane workloads
pub const SYSTEM_NAMESPACE: &str = "kecs-system";
/// Wire-protocol target prefix for ECS operations
pub const ECS_TARGET_PREFIX: &str = "AmazonEC2ContainerServiceV20141113";

pub mod arn;
pub mod cluster;
pub mod error;
pub mod metrics;
pub mod service;
pub mod task;
pub mod task_definition;
pub mod task_set;

use serde::{Deserialize, Serialize};

/// Resource tag, ECS wire shape
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub key: String,
    pub value: String,
}

/// Name/value pair used for container environment entries and
/// attachment details
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KeyValuePair {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Account-level opt-in setting, ECS wire shape
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccountSetting {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal_arn: Option<String>,
}

/// Custom attribute attached to a cluster-scoped target, ECS wire shape
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Attribute {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
}

pub mod retry {
    use std::time::Duration;

    /// Maximum attempts for a transient Kubernetes error before it is
    /// surfaced as a dependency failure
    pub const MAX_TRANSIENT_TRIES: u32 = 3;
    /// Initial backoff between transient retries
    pub const INITIAL_BACKOFF_MILLIS: u64 = 100;
    /// Cap on the backoff between transient retries
    pub const MAX_BACKOFF_MILLIS: u64 = 5000;

    /// Backoff for the `attempt`th retry: 100ms doubling, capped at 5s.
    pub fn backoff_for_attempt(attempt: u32) -> Duration {
        let millis = INITIAL_BACKOFF_MILLIS
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(MAX_BACKOFF_MILLIS);
        Duration::from_millis(millis)
    }

}
