//! Durable store backing the ECS API.
//!
//! The store exclusively owns all ECS entities. Every read API serves
//! from here and never calls Kubernetes inline; reconciliation writes
//! land here through the batch updater. Updates are optimistic: each
//! entity carries a version counter and a stale write fails with
//! [`StoreError::Conflict`].

use crate::ecs::cluster::Cluster;
use crate::ecs::service::Service;
use crate::ecs::task::{LaunchType, Task, TaskDesiredStatus};
use crate::ecs::task_definition::{TaskDefinition, TaskDefinitionStatus};
use crate::ecs::task_set::TaskSet;
use crate::ecs::{AccountSetting, Attribute, Tag};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use mockall::automock;
use thiserror::Error;

pub mod sqlite;

/// Default and maximum page size for every List operation
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    /// Optimistic version mismatch; the caller must re-read and retry
    #[error("version conflict on {0}")]
    Conflict(String),

    /// Concurrent create of the same identity
    #[error("duplicate key: {0}")]
    Duplicate(String),

    #[error("invalid pagination token")]
    InvalidToken,

    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store error: {0}")]
    Internal(String),
}

impl From<StoreError> for crate::ecs::error::EcsError {
    fn from(e: StoreError) -> Self {
        use crate::ecs::error::EcsError;
        match e {
            StoreError::Conflict(what) => EcsError::Conflict(what),
            StoreError::Duplicate(what) => EcsError::Conflict(what),
            StoreError::InvalidToken => {
                EcsError::Validation("Invalid nextToken provided".to_string())
            }
            other => EcsError::Internal(other.to_string()),
        }
    }
}

/// Pagination request carried by every List operation.
#[derive(Clone, Debug, Default)]
pub struct Pagination {
    pub max_results: Option<i32>,
    pub next_token: Option<String>,
}

impl Pagination {
    pub fn first_page(max_results: Option<i32>) -> Self {
        Pagination {
            max_results,
            next_token: None,
        }
    }

    /// Effective window size: default 100, capped at 100, floor 1.
    pub fn limit(&self) -> usize {
        match self.max_results {
            Some(n) if n >= 1 => (n as usize).min(MAX_PAGE_SIZE),
            _ => MAX_PAGE_SIZE,
        }
    }
}

/// One window of a listing. `next_token` is set only when more results
/// exist.
#[derive(Clone, Debug)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_token: Option<String>,
}

/// Sort key every listing is ordered by: creation time in millis, ties
/// broken by ARN.
pub type ListKey = (i64, String);

/// Opaque token encoding of the last-seen list key.
pub fn encode_token(key: &ListKey) -> String {
    BASE64.encode(format!("{}:{}", key.0, key.1))
}

pub fn decode_token(token: &str) -> Result<ListKey, StoreError> {
    let raw = BASE64.decode(token).map_err(|_| StoreError::InvalidToken)?;
    let text = String::from_utf8(raw).map_err(|_| StoreError::InvalidToken)?;
    let (millis, arn) = text.split_once(':').ok_or(StoreError::InvalidToken)?;
    let millis = millis.parse::<i64>().map_err(|_| StoreError::InvalidToken)?;
    if arn.is_empty() {
        return Err(StoreError::InvalidToken);
    }
    Ok((millis, arn.to_string()))
}

/// Window `items` (already sorted by list key) according to `page`.
/// Identical token+filter inputs yield disjoint successive windows.
pub fn paginate<T>(
    items: Vec<T>,
    page: &Pagination,
    key_of: impl Fn(&T) -> ListKey,
) -> Result<Page<T>, StoreError> {
    let start = match &page.next_token {
        Some(token) => {
            let last_seen = decode_token(token)?;
            items
                .iter()
                .position(|item| key_of(item) > last_seen)
                .unwrap_or(items.len())
        }
        None => 0,
    };
    let limit = page.limit();
    let window: Vec<T> = items
        .into_iter()
        .skip(start)
        .take(limit + 1)
        .collect();
    if window.len() > limit {
        let mut window = window;
        window.truncate(limit);
        let token = window
            .last()
            .map(|item| encode_token(&key_of(item)))
            .ok_or_else(|| StoreError::Internal("empty page with continuation".to_string()))?;
        Ok(Page {
            items: window,
            next_token: Some(token),
        })
    } else {
        Ok(Page {
            items: window,
            next_token: None,
        })
    }
}

/// Filters accepted by task listing.
#[derive(Clone, Debug, Default)]
pub struct TaskFilter {
    pub cluster_arn: String,
    /// Matches tasks started by `ecs-svc/<name>` or grouped under
    /// `service:<name>`
    pub service_name: Option<String>,
    pub desired_status: Option<TaskDesiredStatus>,
    pub launch_type: Option<LaunchType>,
    pub family: Option<String>,
    pub group: Option<String>,
    pub container_instance: Option<String>,
}

impl TaskFilter {
    pub fn for_cluster(cluster_arn: &str) -> Self {
        TaskFilter {
            cluster_arn: cluster_arn.to_string(),
            ..Default::default()
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        if task.cluster_arn != self.cluster_arn {
            return false;
        }
        if let Some(service) = &self.service_name {
            let started_by = format!("ecs-svc/{}", service);
            let group = format!("service:{}", service);
            let by_start = task.started_by.as_deref() == Some(started_by.as_str());
            let by_group = task.group.as_deref() == Some(group.as_str());
            if !by_start && !by_group {
                return false;
            }
        }
        if let Some(desired) = self.desired_status {
            if task.desired_status != desired {
                return false;
            }
        }
        if let Some(launch_type) = self.launch_type {
            if task.launch_type != launch_type {
                return false;
            }
        }
        if let Some(family) = &self.family {
            let (task_family, _) = crate::ecs::arn::family_and_revision(&task.task_definition_arn);
            if &task_family != family {
                return false;
            }
        }
        if let Some(group) = &self.group {
            if task.group.as_deref() != Some(group.as_str()) {
                return false;
            }
        }
        if let Some(instance) = &self.container_instance {
            if task.container_instance_arn.as_deref() != Some(instance.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Durable mapping from ECS identifiers to canonical ECS entities.
///
/// One trait covers every entity so tests can hand a single mock to the
/// managers, the same way the kube facade is mocked.
#[automock]
#[async_trait]
pub trait DataStore: Send + Sync {
    // -- clusters -----------------------------------------------------
    async fn create_cluster(&self, cluster: &Cluster) -> Result<(), StoreError>;
    async fn get_cluster(&self, name: &str) -> Result<Option<Cluster>, StoreError>;
    async fn update_cluster(&self, cluster: &Cluster) -> Result<Cluster, StoreError>;
    async fn delete_cluster(&self, name: &str) -> Result<(), StoreError>;
    async fn list_clusters(&self, page: &Pagination) -> Result<Page<Cluster>, StoreError>;

    // -- task definitions ---------------------------------------------
    /// Assigns the next revision for the family and persists, atomically.
    async fn register_task_definition(
        &self,
        definition: TaskDefinition,
    ) -> Result<TaskDefinition, StoreError>;
    async fn get_task_definition(
        &self,
        family: &str,
        revision: i64,
    ) -> Result<Option<TaskDefinition>, StoreError>;
    /// Highest-revision definition of the family, if any.
    async fn latest_task_definition(
        &self,
        family: &str,
    ) -> Result<Option<TaskDefinition>, StoreError>;
    async fn update_task_definition_status(
        &self,
        family: &str,
        revision: i64,
        status: TaskDefinitionStatus,
    ) -> Result<TaskDefinition, StoreError>;
    async fn list_task_definitions(
        &self,
        family: Option<String>,
        status: Option<TaskDefinitionStatus>,
        page: &Pagination,
    ) -> Result<Page<TaskDefinition>, StoreError>;
    async fn list_task_definition_families(
        &self,
        prefix: Option<String>,
        status: Option<TaskDefinitionStatus>,
        page: &Pagination,
    ) -> Result<Page<String>, StoreError>;

    // -- tasks --------------------------------------------------------
    async fn create_task(&self, task: &Task) -> Result<(), StoreError>;
    /// Accepts the short task ID or the full ARN.
    async fn get_task(
        &self,
        cluster_arn: &str,
        task_id_or_arn: &str,
    ) -> Result<Option<Task>, StoreError>;
    async fn update_task(&self, task: &Task) -> Result<Task, StoreError>;
    async fn list_tasks(
        &self,
        filter: &TaskFilter,
        page: &Pagination,
    ) -> Result<Page<Task>, StoreError>;

    // -- services -----------------------------------------------------
    async fn create_service(&self, service: &Service) -> Result<(), StoreError>;
    async fn get_service(
        &self,
        cluster_arn: &str,
        service_name: &str,
    ) -> Result<Option<Service>, StoreError>;
    async fn update_service(&self, service: &Service) -> Result<Service, StoreError>;
    async fn list_services(
        &self,
        cluster_arn: &str,
        launch_type: Option<LaunchType>,
        page: &Pagination,
    ) -> Result<Page<Service>, StoreError>;

    // -- task sets ----------------------------------------------------
    async fn create_task_set(&self, task_set: &TaskSet) -> Result<(), StoreError>;
    async fn get_task_set(
        &self,
        service_arn: &str,
        task_set_id: &str,
    ) -> Result<Option<TaskSet>, StoreError>;
    async fn update_task_set(&self, task_set: &TaskSet) -> Result<TaskSet, StoreError>;
    async fn delete_task_set(
        &self,
        service_arn: &str,
        task_set_id: &str,
    ) -> Result<(), StoreError>;
    async fn list_task_sets(&self, service_arn: &str) -> Result<Vec<TaskSet>, StoreError>;

    // -- tags ---------------------------------------------------------
    async fn put_tags(&self, arn: &str, tags: &[Tag]) -> Result<(), StoreError>;
    async fn remove_tags(&self, arn: &str, keys: &[String]) -> Result<(), StoreError>;
    async fn list_tags(&self, arn: &str) -> Result<Vec<Tag>, StoreError>;

    // -- account settings ---------------------------------------------
    async fn put_account_setting(&self, setting: &AccountSetting) -> Result<(), StoreError>;
    async fn delete_account_setting(
        &self,
        principal_arn: Option<String>,
        name: &str,
    ) -> Result<(), StoreError>;
    async fn list_account_settings(&self) -> Result<Vec<AccountSetting>, StoreError>;

    // -- attributes ---------------------------------------------------
    async fn put_attributes(
        &self,
        cluster_arn: &str,
        attributes: &[Attribute],
    ) -> Result<(), StoreError>;
    async fn delete_attributes(
        &self,
        cluster_arn: &str,
        attributes: &[Attribute],
    ) -> Result<(), StoreError>;
    async fn list_attributes(&self, cluster_arn: &str) -> Result<Vec<Attribute>, StoreError>;
}
