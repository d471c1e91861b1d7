//! Cluster operations.

use super::{Api, ApiError, DEFAULT_CLUSTER_NAME};
use chrono::Utc;
use kecs_shared::ecs::arn::{cluster_name_from_name_or_arn, k8s_cluster_name};
use kecs_shared::ecs::cluster::{CapacityProviderStrategyItem, Cluster, ClusterStatus};
use kecs_shared::ecs::task::{TaskDesiredStatus, TaskLastStatus};
use kecs_shared::ecs::Tag;
use kecs_shared::store::{Pagination, StoreError, TaskFilter};
use log::{error, info};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateClusterRequest {
    pub cluster_name: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<Tag>>,
    #[serde(default)]
    pub capacity_providers: Option<Vec<String>>,
    #[serde(default)]
    pub default_capacity_provider_strategy: Option<Vec<CapacityProviderStrategyItem>>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DescribeClustersRequest {
    #[serde(default)]
    pub clusters: Option<Vec<String>>,
    #[serde(default)]
    pub include: Option<Vec<String>>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ListClustersRequest {
    #[serde(default)]
    pub max_results: Option<i32>,
    #[serde(default)]
    pub next_token: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeleteClusterRequest {
    pub cluster: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PutClusterCapacityProvidersRequest {
    pub cluster: String,
    pub capacity_providers: Vec<String>,
    #[serde(default)]
    pub default_capacity_provider_strategy: Vec<CapacityProviderStrategyItem>,
}

/// ECS wire shape of a cluster entity.
pub(crate) fn cluster_to_wire(cluster: &Cluster) -> Value {
    json!({
        "clusterArn": cluster.cluster_arn,
        "clusterName": cluster.cluster_name,
        "status": cluster.status.as_str(),
        "registeredContainerInstancesCount": cluster.registered_container_instances_count,
        "runningTasksCount": cluster.running_tasks_count,
        "pendingTasksCount": cluster.pending_tasks_count,
        "activeServicesCount": cluster.active_services_count,
        "capacityProviders": cluster.capacity_providers,
        "defaultCapacityProviderStrategy": cluster.default_capacity_provider_strategy,
        "tags": cluster.tags,
    })
}

fn validate_cluster_name(name: &str) -> Result<(), ApiError> {
    if name.is_empty() || name.len() > 255 {
        return Err(ApiError::validation(
            "clusterName must be between 1 and 255 characters",
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ApiError::validation(
            "clusterName may only contain letters, numbers, hyphens and underscores",
        ));
    }
    Ok(())
}

impl Api {
    pub async fn create_cluster(&self, request: CreateClusterRequest) -> Result<Value, ApiError> {
        let name = request
            .cluster_name
            .unwrap_or_else(|| DEFAULT_CLUSTER_NAME.to_string());
        validate_cluster_name(&name)?;

        if let Some(existing) = self.ctx.store.get_cluster(&name).await? {
            return Ok(json!({ "cluster": cluster_to_wire(&existing) }));
        }

        let cluster = Cluster {
            cluster_arn: self.ctx.identifiers.cluster_arn(&name),
            cluster_name: name.clone(),
            status: ClusterStatus::Active,
            region: self.ctx.identifiers.region().to_string(),
            k8s_cluster_name: k8s_cluster_name(&name),
            tags: request.tags.unwrap_or_default(),
            capacity_providers: request.capacity_providers.unwrap_or_default(),
            default_capacity_provider_strategy: request
                .default_capacity_provider_strategy
                .unwrap_or_default(),
            registered_container_instances_count: 0,
            running_tasks_count: 0,
            pending_tasks_count: 0,
            active_services_count: 0,
            created_at: Utc::now(),
            version: 1,
        };
        match self.ctx.store.create_cluster(&cluster).await {
            Ok(()) => {}
            Err(StoreError::Duplicate(_)) => {
                // concurrent create; serve whichever record won
                if let Some(existing) = self.ctx.store.get_cluster(&name).await? {
                    return Ok(json!({ "cluster": cluster_to_wire(&existing) }));
                }
            }
            Err(e) => return Err(e.into()),
        }

        if !self.config.test_mode {
            // provisioning may exceed the handler deadline; the entity
            // is already durable, the Kubernetes side self-heals
            let provider = self.provider.clone();
            let k8s_name = cluster.k8s_cluster_name.clone();
            tokio::spawn(async move {
                if let Err(e) = provider.create_cluster(&k8s_name).await {
                    error!("create_cluster - provisioning {} failed: {}", k8s_name, e);
                }
            });
        } else {
            self.provider
                .create_cluster(&cluster.k8s_cluster_name)
                .await?;
        }
        info!("create_cluster - {}", cluster.cluster_arn);
        Ok(json!({ "cluster": cluster_to_wire(&cluster) }))
    }

    /// Live usage counts derived from the store at describe time.
    async fn cluster_counts(&self, cluster: &Cluster) -> Result<(i32, i32, i32), ApiError> {
        let mut active_services = 0;
        let mut page = Pagination::default();
        loop {
            let window = self
                .ctx
                .store
                .list_services(&cluster.cluster_arn, None, &page)
                .await?;
            active_services += window
                .items
                .iter()
                .filter(|s| s.status != kecs_shared::ecs::service::ServiceStatus::Inactive)
                .count() as i32;
            match window.next_token {
                Some(token) => page.next_token = Some(token),
                None => break,
            }
        }

        let mut running = 0;
        let mut pending = 0;
        let filter = TaskFilter::for_cluster(&cluster.cluster_arn);
        let mut page = Pagination::default();
        loop {
            let window = self.ctx.store.list_tasks(&filter, &page).await?;
            for task in &window.items {
                match task.last_status {
                    TaskLastStatus::Running => running += 1,
                    TaskLastStatus::Provisioning
                    | TaskLastStatus::Pending
                    | TaskLastStatus::Activating => pending += 1,
                    _ => {}
                }
            }
            match window.next_token {
                Some(token) => page.next_token = Some(token),
                None => break,
            }
        }
        Ok((active_services, running, pending))
    }

    pub async fn describe_clusters(
        &self,
        request: DescribeClustersRequest,
    ) -> Result<Value, ApiError> {
        let names = request
            .clusters
            .unwrap_or_else(|| vec![DEFAULT_CLUSTER_NAME.to_string()]);
        let mut clusters = Vec::new();
        let mut failures = Vec::new();
        for reference in &names {
            let name = cluster_name_from_name_or_arn(reference);
            match self.ctx.store.get_cluster(name).await? {
                Some(mut cluster) => {
                    let (services, running, pending) = self.cluster_counts(&cluster).await?;
                    cluster.active_services_count = services;
                    cluster.running_tasks_count = running;
                    cluster.pending_tasks_count = pending;
                    clusters.push(cluster_to_wire(&cluster));
                }
                None => failures.push(json!({
                    "arn": self.ctx.identifiers.cluster_arn(name),
                    "reason": "MISSING",
                })),
            }
        }
        Ok(json!({ "clusters": clusters, "failures": failures }))
    }

    pub async fn list_clusters(&self, request: ListClustersRequest) -> Result<Value, ApiError> {
        let page = self
            .ctx
            .store
            .list_clusters(&Pagination {
                max_results: request.max_results,
                next_token: request.next_token,
            })
            .await?;
        let arns: Vec<String> = page.items.iter().map(|c| c.cluster_arn.clone()).collect();
        let mut body = json!({ "clusterArns": arns });
        if let Some(token) = page.next_token {
            body["nextToken"] = Value::String(token);
        }
        Ok(body)
    }

    pub async fn delete_cluster(&self, request: DeleteClusterRequest) -> Result<Value, ApiError> {
        let cluster = self.resolve_cluster(Some(&request.cluster)).await?;

        let services = self
            .ctx
            .store
            .list_services(&cluster.cluster_arn, None, &Pagination::default())
            .await?;
        let active_services = services
            .items
            .iter()
            .filter(|s| s.status != kecs_shared::ecs::service::ServiceStatus::Inactive)
            .count();
        if active_services > 0 {
            return Err(ApiError::new(
                "ClusterContainsServicesException",
                "The Cluster cannot be deleted while Services are active.",
            ));
        }

        let mut filter = TaskFilter::for_cluster(&cluster.cluster_arn);
        filter.desired_status = Some(TaskDesiredStatus::Running);
        let running = self
            .ctx
            .store
            .list_tasks(&filter, &Pagination::default())
            .await?;
        if running.items.iter().any(|t| !t.is_stopped()) {
            return Err(ApiError::new(
                "ClusterContainsTasksException",
                "The Cluster cannot be deleted while Tasks are active.",
            ));
        }

        self.ctx.store.delete_cluster(&cluster.cluster_name).await?;

        if !self.config.test_mode {
            let provider = self.provider.clone();
            let k8s_name = cluster.k8s_cluster_name.clone();
            tokio::spawn(async move {
                if let Err(e) = provider.delete_cluster(&k8s_name).await {
                    error!("delete_cluster - tearing down {} failed: {}", k8s_name, e);
                }
            });
        } else {
            self.provider
                .delete_cluster(&cluster.k8s_cluster_name)
                .await?;
        }

        let mut deleted = cluster;
        deleted.status = ClusterStatus::Inactive;
        info!("delete_cluster - {}", deleted.cluster_arn);
        Ok(json!({ "cluster": cluster_to_wire(&deleted) }))
    }

    pub async fn put_cluster_capacity_providers(
        &self,
        request: PutClusterCapacityProvidersRequest,
    ) -> Result<Value, ApiError> {
        let mut cluster = self.resolve_cluster(Some(&request.cluster)).await?;
        for strategy in &request.default_capacity_provider_strategy {
            if !request
                .capacity_providers
                .contains(&strategy.capacity_provider)
            {
                return Err(ApiError::validation(format!(
                    "capacity provider {} is not in the capacityProviders list",
                    strategy.capacity_provider
                )));
            }
        }
        cluster.capacity_providers = request.capacity_providers;
        cluster.default_capacity_provider_strategy = request.default_capacity_provider_strategy;
        let stored = self.ctx.store.update_cluster(&cluster).await?;
        Ok(json!({ "cluster": cluster_to_wire(&stored) }))
    }
}
