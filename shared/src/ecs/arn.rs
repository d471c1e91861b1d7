//! Deterministic construction of ARNs and internal Kubernetes names.
//!
//! Every identifier the control plane hands out is derived from
//! `(region, account, cluster, resource)` so the same inputs always
//! produce the same ARN, and the same pod always maps to the same task
//! across restarts.

use crate::os::env_var::EnvVarQuery;
use sha2::{Digest, Sha256};

/// Region used when none is configured
pub const DEFAULT_REGION: &str = "us-east-1";
/// Account ID used when none is configured
pub const DEFAULT_ACCOUNT_ID: &str = "000000000000";
/// Environment variable overriding the region
pub const REGION_ENV_VAR: &str = "KECS_REGION";
/// Environment variable overriding the account ID
pub const ACCOUNT_ID_ENV_VAR: &str = "KECS_ACCOUNT_ID";

/// Prefix applied to internal Kubernetes cluster names
const K8S_CLUSTER_PREFIX: &str = "kecs-";

/// ARN factory bound to one (region, account) pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identifiers {
    region: String,
    account_id: String,
}

impl Identifiers {
    pub fn new(region: &str, account_id: &str) -> Self {
        Identifiers {
            region: region.to_string(),
            account_id: account_id.to_string(),
        }
    }

    /// Read region and account from the environment, falling back to the
    /// local-development defaults.
    pub fn from_env(env: &dyn EnvVarQuery) -> Self {
        let region = env
            .get_env_var(REGION_ENV_VAR)
            .unwrap_or_else(|_| DEFAULT_REGION.to_string());
        let account_id = env
            .get_env_var(ACCOUNT_ID_ENV_VAR)
            .unwrap_or_else(|_| DEFAULT_ACCOUNT_ID.to_string());
        Identifiers::new(&region, &account_id)
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// `arn:aws:ecs:<region>:<account>:cluster/<name>`; the cluster ARN
    /// omits the `<cluster>/` segment other resource ARNs carry.
    pub fn cluster_arn(&self, cluster_name: &str) -> String {
        format!(
            "arn:aws:ecs:{}:{}:cluster/{}",
            self.region, self.account_id, cluster_name
        )
    }

    /// `arn:aws:ecs:<region>:<account>:task-definition/<family>:<revision>`
    pub fn task_definition_arn(&self, family: &str, revision: i64) -> String {
        format!(
            "arn:aws:ecs:{}:{}:task-definition/{}:{}",
            self.region, self.account_id, family, revision
        )
    }

    /// `arn:aws:ecs:<region>:<account>:task/<cluster>/<taskId>`
    pub fn task_arn(&self, cluster_name: &str, task_id: &str) -> String {
        format!(
            "arn:aws:ecs:{}:{}:task/{}/{}",
            self.region, self.account_id, cluster_name, task_id
        )
    }

    /// `arn:aws:ecs:<region>:<account>:service/<cluster>/<serviceName>`
    pub fn service_arn(&self, cluster_name: &str, service_name: &str) -> String {
        format!(
            "arn:aws:ecs:{}:{}:service/{}/{}",
            self.region, self.account_id, cluster_name, service_name
        )
    }

    /// `arn:aws:ecs:<region>:<account>:task-set/<cluster>/<service>/<id>`
    pub fn task_set_arn(&self, cluster_name: &str, service_name: &str, task_set_id: &str) -> String {
        format!(
            "arn:aws:ecs:{}:{}:task-set/{}/{}/{}",
            self.region, self.account_id, cluster_name, service_name, task_set_id
        )
    }

    /// `arn:aws:ecs:<region>:<account>:container-instance/<cluster>/<id>`
    pub fn container_instance_arn(&self, cluster_name: &str, instance_id: &str) -> String {
        format!(
            "arn:aws:ecs:{}:{}:container-instance/{}/{}",
            self.region, self.account_id, cluster_name, instance_id
        )
    }

    /// Namespace hosting the workloads of an ECS cluster.
    pub fn workload_namespace(&self, cluster_name: &str) -> String {
        format!("{}-{}", cluster_name, self.region)
    }
}

impl Default for Identifiers {
    fn default() -> Self {
        Identifiers::new(DEFAULT_REGION, DEFAULT_ACCOUNT_ID)
    }
}

/// Normalize an ECS cluster name to the backing Kubernetes cluster name.
/// Already-prefixed names pass through unchanged.
pub fn k8s_cluster_name(cluster_name: &str) -> String {
    if cluster_name.starts_with(K8S_CLUSTER_PREFIX) {
        cluster_name.to_string()
    } else {
        format!("{}{}", K8S_CLUSTER_PREFIX, cluster_name)
    }
}

/// Derive the deterministic 16-hex task ID for a pod. Hashing the pod
/// name keeps the mapping stable across control-plane restarts.
pub fn task_id_from_pod_name(pod_name: &str) -> String {
    let digest = Sha256::digest(pod_name.as_bytes());
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Last path segment of an ARN (`cluster/<name>` -> `<name>`,
/// `task/<cluster>/<id>` -> `<id>`).
pub fn resource_id_from_arn(arn: &str) -> Option<&str> {
    arn.rsplit('/').next().filter(|s| !s.is_empty())
}

/// Cluster segment of a task/service/task-set ARN, i.e. the second to
/// last path component. For a cluster ARN the last segment is returned.
pub fn cluster_name_from_arn(arn: &str) -> Option<&str> {
    let mut segments = arn.rsplit('/');
    let resource = segments.next()?;
    match segments.next() {
        Some(prefix) if prefix.ends_with(":cluster") => Some(resource),
        Some(cluster) => Some(cluster),
        None => None,
    }
}

/// Accept either a bare cluster name or a full cluster ARN.
pub fn cluster_name_from_name_or_arn(name_or_arn: &str) -> &str {
    if name_or_arn.starts_with("arn:") {
        resource_id_from_arn(name_or_arn).unwrap_or(name_or_arn)
    } else {
        name_or_arn
    }
}

/// Split `family:revision` (or a full task-definition ARN) into its parts.
/// A missing revision yields `None` for the revision.
pub fn family_and_revision(task_definition: &str) -> (String, Option<i64>) {
    let tail = if task_definition.starts_with("arn:") {
        task_definition
            .rsplit('/')
            .next()
            .unwrap_or(task_definition)
    } else {
        task_definition
    };
    match tail.rsplit_once(':') {
        Some((family, revision)) => match revision.parse::<i64>() {
            Ok(r) => (family.to_string(), Some(r)),
            Err(_) => (tail.to_string(), None),
        },
        None => (tail.to_string(), None),
    }
}
