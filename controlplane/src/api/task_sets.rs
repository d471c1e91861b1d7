//! TaskSet operations.
//!
//! TaskSets ride the service Deployment machinery with one extra label
//! dimension. Primary selection is serialized per service so concurrent
//! flips cannot leave the selector flapping between TaskSets.

use super::{Api, ApiError};
use crate::convert::service::{service_to_kube_service, task_set_to_deployment};
use crate::util::with_transient_retry;
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service as KubeService;
use kecs_shared::ecs::arn::cluster_name_from_arn;
use kecs_shared::ecs::error::{EcsError, ResourceKind};
use kecs_shared::ecs::service::Service;
use kecs_shared::ecs::task_set::{Scale, StabilityStatus, TaskSet};
use kecs_shared::ecs::KECS_TASK_SET_LABEL_NAME;
use kecs_shared::k8s::api::IntoApi;
use kecs_shared::k8s::FIELD_MANAGER;
use log::{error, info};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateTaskSetRequest {
    pub cluster: String,
    pub service: String,
    pub task_definition: String,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub scale: Option<Scale>,
    #[serde(default)]
    pub client_token: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DescribeTaskSetsRequest {
    pub cluster: String,
    pub service: String,
    #[serde(default)]
    pub task_sets: Option<Vec<String>>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdateTaskSetRequest {
    pub cluster: String,
    pub service: String,
    pub task_set: String,
    pub scale: Scale,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeleteTaskSetRequest {
    pub cluster: String,
    pub service: String,
    pub task_set: String,
    #[serde(default)]
    pub force: Option<bool>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdateServicePrimaryTaskSetRequest {
    pub cluster: String,
    pub service: String,
    pub primary_task_set: String,
}

/// ECS wire shape of a task set entity.
pub(crate) fn task_set_to_wire(task_set: &TaskSet) -> Value {
    json!({
        "id": task_set.id,
        "taskSetArn": task_set.task_set_arn,
        "serviceArn": task_set.service_arn,
        "clusterArn": task_set.cluster_arn,
        "taskDefinition": task_set.task_definition,
        "scale": task_set.scale,
        "computedDesiredCount": task_set.computed_desired_count,
        "stabilityStatus": task_set.stability_status.as_str(),
        "status": task_set.status_str(),
        "externalId": task_set.external_id,
        "createdAt": task_set.created_at,
        "updatedAt": task_set.updated_at,
    })
}

fn task_set_id_from_reference(reference: &str) -> &str {
    kecs_shared::ecs::arn::resource_id_from_arn(reference).unwrap_or(reference)
}

fn validate_scale(scale: &Scale) -> Result<(), ApiError> {
    if scale.unit != "PERCENT" {
        return Err(ApiError::validation(format!(
            "unknown scale unit: {}",
            scale.unit
        )));
    }
    if !(0.0..=100.0).contains(&scale.value) {
        return Err(ApiError::validation(
            "scale value must be between 0 and 100",
        ));
    }
    Ok(())
}

impl Api {
    async fn apply_task_set_deployment(
        &self,
        service: &Service,
        task_set: &TaskSet,
    ) -> Result<(), ApiError> {
        if self.config.test_mode {
            return Ok(());
        }
        let definition = self.resolve_task_definition(&task_set.task_definition).await?;
        let cluster_name = cluster_name_from_arn(&service.cluster_arn)
            .ok_or_else(|| EcsError::Internal(format!("bad cluster arn {}", service.cluster_arn)))?;
        let deployment =
            task_set_to_deployment(service, task_set, &definition, cluster_name)
                .map_err(ApiError::from)?;
        let deployments =
            IntoApi::<Deployment>::namespaced(self.ctx.client.as_ref(), &service.namespace);
        with_transient_retry("apply task set deployment", || {
            deployments.apply(deployment.clone(), FIELD_MANAGER)
        })
        .await?;
        Ok(())
    }

    pub async fn create_task_set(&self, request: CreateTaskSetRequest) -> Result<Value, ApiError> {
        let scale = request.scale.unwrap_or_default();
        validate_scale(&scale)?;
        let cluster = self.resolve_cluster(Some(&request.cluster)).await?;
        let service = self
            .load_service_for_task_sets(&cluster.cluster_arn, &request.service)
            .await?;
        let definition = self.resolve_task_definition(&request.task_definition).await?;

        let id = format!("ecs-svc-{}", &Uuid::new_v4().simple().to_string()[..12]);
        let now = Utc::now();
        let task_set = TaskSet {
            id: id.clone(),
            task_set_arn: self.ctx.identifiers.task_set_arn(
                &cluster.cluster_name,
                &service.service_name,
                &id,
            ),
            service_arn: service.service_arn.clone(),
            cluster_arn: cluster.cluster_arn.clone(),
            task_definition: definition.task_definition_arn.clone(),
            computed_desired_count: TaskSet::compute_desired_count(
                &scale,
                service.desired_count,
            ),
            scale,
            stability_status: StabilityStatus::Stabilizing,
            primary: false,
            external_id: request.external_id,
            created_at: now,
            updated_at: now,
            version: 1,
        };
        self.ctx.store.create_task_set(&task_set).await?;
        self.apply_task_set_deployment(&service, &task_set).await?;
        info!("create_task_set - {}", task_set.task_set_arn);
        Ok(json!({ "taskSet": task_set_to_wire(&task_set) }))
    }

    async fn load_service_for_task_sets(
        &self,
        cluster_arn: &str,
        reference: &str,
    ) -> Result<Service, ApiError> {
        let name = kecs_shared::ecs::arn::resource_id_from_arn(reference).unwrap_or(reference);
        let service = self
            .ctx
            .store
            .get_service(cluster_arn, name)
            .await?
            .ok_or_else(|| ApiError::from(EcsError::not_found(ResourceKind::Service, name)))?;
        if service.status == kecs_shared::ecs::service::ServiceStatus::Inactive {
            return Err(ApiError::from(EcsError::not_found(
                ResourceKind::Service,
                name,
            )));
        }
        Ok(service)
    }

    async fn load_task_set(
        &self,
        service_arn: &str,
        reference: &str,
    ) -> Result<TaskSet, ApiError> {
        let id = task_set_id_from_reference(reference);
        self.ctx
            .store
            .get_task_set(service_arn, id)
            .await?
            .ok_or_else(|| ApiError::from(EcsError::not_found(ResourceKind::TaskSet, id)))
    }

    pub async fn describe_task_sets(
        &self,
        request: DescribeTaskSetsRequest,
    ) -> Result<Value, ApiError> {
        let cluster = self.resolve_cluster(Some(&request.cluster)).await?;
        let service = self
            .load_service_for_task_sets(&cluster.cluster_arn, &request.service)
            .await?;
        let all = self.ctx.store.list_task_sets(&service.service_arn).await?;
        let mut task_sets = Vec::new();
        let mut failures = Vec::new();
        match request.task_sets {
            None => {
                task_sets = all.iter().map(task_set_to_wire).collect();
            }
            Some(references) => {
                for reference in &references {
                    let id = task_set_id_from_reference(reference);
                    match all.iter().find(|ts| ts.id == id) {
                        Some(task_set) => task_sets.push(task_set_to_wire(task_set)),
                        None => failures.push(json!({
                            "arn": reference,
                            "reason": "MISSING",
                        })),
                    }
                }
            }
        }
        Ok(json!({ "taskSets": task_sets, "failures": failures }))
    }

    pub async fn update_task_set(&self, request: UpdateTaskSetRequest) -> Result<Value, ApiError> {
        validate_scale(&request.scale)?;
        let cluster = self.resolve_cluster(Some(&request.cluster)).await?;
        let service = self
            .load_service_for_task_sets(&cluster.cluster_arn, &request.service)
            .await?;
        let mut task_set = self
            .load_task_set(&service.service_arn, &request.task_set)
            .await?;
        task_set.computed_desired_count =
            TaskSet::compute_desired_count(&request.scale, service.desired_count);
        task_set.scale = request.scale;
        task_set.stability_status = StabilityStatus::Stabilizing;
        task_set.updated_at = Utc::now();
        let stored = self.ctx.store.update_task_set(&task_set).await?;
        self.apply_task_set_deployment(&service, &stored).await?;
        Ok(json!({ "taskSet": task_set_to_wire(&stored) }))
    }

    pub async fn delete_task_set(&self, request: DeleteTaskSetRequest) -> Result<Value, ApiError> {
        let cluster = self.resolve_cluster(Some(&request.cluster)).await?;
        let service = self
            .load_service_for_task_sets(&cluster.cluster_arn, &request.service)
            .await?;
        let task_set = self
            .load_task_set(&service.service_arn, &request.task_set)
            .await?;
        if task_set.primary && !request.force.unwrap_or(false) {
            return Err(ApiError::validation(
                "the primary task set cannot be deleted without force",
            ));
        }
        if !self.config.test_mode {
            let deployment_name = format!("{}-{}", service.deployment_name, task_set.id);
            let deployments =
                IntoApi::<Deployment>::namespaced(self.ctx.client.as_ref(), &service.namespace);
            with_transient_retry("delete task set deployment", || {
                deployments.delete(&deployment_name)
            })
            .await?;
        }
        self.ctx
            .store
            .delete_task_set(&service.service_arn, &task_set.id)
            .await?;
        info!("delete_task_set - {}", task_set.task_set_arn);
        Ok(json!({ "taskSet": task_set_to_wire(&task_set) }))
    }

    /// Flip the primary TaskSet. The per-service lock orders concurrent
    /// flips; the service selector is retargeted to the new primary's
    /// label so only its pods receive traffic.
    pub async fn update_service_primary_task_set(
        &self,
        request: UpdateServicePrimaryTaskSetRequest,
    ) -> Result<Value, ApiError> {
        let cluster = self.resolve_cluster(Some(&request.cluster)).await?;
        let service = self
            .load_service_for_task_sets(&cluster.cluster_arn, &request.service)
            .await?;

        let lock: Arc<tokio::sync::Mutex<()>> =
            self.ctx.service_lock(&service.service_arn).await;
        let _guard = lock.lock().await;

        let target_id = task_set_id_from_reference(&request.primary_task_set).to_string();
        let all = self.ctx.store.list_task_sets(&service.service_arn).await?;
        if !all.iter().any(|ts| ts.id == target_id) {
            return Err(ApiError::from(EcsError::not_found(
                ResourceKind::TaskSet,
                target_id,
            )));
        }

        let mut primary = None;
        for task_set in all {
            let should_be_primary = task_set.id == target_id;
            if task_set.primary == should_be_primary {
                if should_be_primary {
                    primary = Some(task_set);
                }
                continue;
            }
            let mut updated = task_set;
            updated.primary = should_be_primary;
            updated.updated_at = Utc::now();
            let stored = self.ctx.store.update_task_set(&updated).await?;
            if should_be_primary {
                primary = Some(stored);
            }
        }
        let primary = primary
            .ok_or_else(|| EcsError::Internal("primary task set vanished".to_string()))?;

        self.retarget_service_selector(&service, &primary).await?;
        info!(
            "update_service_primary_task_set - {} now primary for {}",
            primary.id, service.service_name
        );
        Ok(json!({ "taskSet": task_set_to_wire(&primary) }))
    }

    /// Point the Kubernetes Service selector at the primary TaskSet's
    /// pods.
    async fn retarget_service_selector(
        &self,
        service: &Service,
        primary: &TaskSet,
    ) -> Result<(), ApiError> {
        if self.config.test_mode {
            return Ok(());
        }
        let definition = self.resolve_task_definition(&service.task_definition).await?;
        let cluster_name = cluster_name_from_arn(&service.cluster_arn)
            .ok_or_else(|| EcsError::Internal(format!("bad cluster arn {}", service.cluster_arn)))?;
        let Some(mut kube_service) =
            service_to_kube_service(service, &definition, cluster_name)
        else {
            // no ports, nothing routes through a Service object
            return Ok(());
        };
        if let Some(spec) = kube_service.spec.as_mut() {
            if let Some(selector) = spec.selector.as_mut() {
                selector.insert(KECS_TASK_SET_LABEL_NAME.to_string(), primary.id.clone());
            }
        }
        let services =
            IntoApi::<KubeService>::namespaced(self.ctx.client.as_ref(), &service.namespace);
        match with_transient_retry("retarget service selector", || {
            services.apply(kube_service.clone(), FIELD_MANAGER)
        })
        .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                error!(
                    "retarget_service_selector - {} failed: {}",
                    service.service_name, e
                );
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{call, test_api};
    use super::*;

    async fn seed_service(api: &Api) {
        call(api, "CreateCluster", json!({"clusterName": "production"}))
            .await
            .unwrap();
        call(
            api,
            "RegisterTaskDefinition",
            json!({
                "family": "web",
                "containerDefinitions": [{"name": "web", "image": "nginx:1.25"}]
            }),
        )
        .await
        .unwrap();
        call(
            api,
            "CreateService",
            json!({
                "cluster": "production",
                "serviceName": "web",
                "taskDefinition": "web:1",
                "desiredCount": 4
            }),
        )
        .await
        .unwrap();
    }

    async fn create_task_set(api: &Api, scale: f64) -> String {
        let body = call(
            api,
            "CreateTaskSet",
            json!({
                "cluster": "production",
                "service": "web",
                "taskDefinition": "web:1",
                "scale": {"value": scale, "unit": "PERCENT"}
            }),
        )
        .await
        .unwrap();
        body["taskSet"]["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_create_task_set_computes_replicas() {
        let api = test_api();
        seed_service(&api).await;
        let body = call(
            &api,
            "CreateTaskSet",
            json!({
                "cluster": "production",
                "service": "web",
                "taskDefinition": "web:1",
                "scale": {"value": 50.0, "unit": "PERCENT"}
            }),
        )
        .await
        .unwrap();
        assert_eq!(2, body["taskSet"]["computedDesiredCount"]);
        assert_eq!("STABILIZING", body["taskSet"]["stabilityStatus"]);
        assert_eq!("ACTIVE", body["taskSet"]["status"]);
    }

    #[tokio::test]
    async fn test_scale_validation() {
        let api = test_api();
        seed_service(&api).await;
        let error = call(
            &api,
            "CreateTaskSet",
            json!({
                "cluster": "production",
                "service": "web",
                "taskDefinition": "web:1",
                "scale": {"value": 150.0, "unit": "PERCENT"}
            }),
        )
        .await
        .unwrap_err();
        assert_eq!("InvalidParameterException", error.kind);
    }

    #[tokio::test]
    async fn test_primary_flip_is_exclusive() {
        let api = test_api();
        seed_service(&api).await;
        let first = create_task_set(&api, 100.0).await;
        let second = create_task_set(&api, 100.0).await;

        let body = call(
            &api,
            "UpdateServicePrimaryTaskSet",
            json!({"cluster": "production", "service": "web", "primaryTaskSet": first}),
        )
        .await
        .unwrap();
        assert_eq!("PRIMARY", body["taskSet"]["status"]);

        let body = call(
            &api,
            "UpdateServicePrimaryTaskSet",
            json!({"cluster": "production", "service": "web", "primaryTaskSet": second.clone()}),
        )
        .await
        .unwrap();
        assert_eq!(second, body["taskSet"]["id"]);

        let described = call(
            &api,
            "DescribeTaskSets",
            json!({"cluster": "production", "service": "web"}),
        )
        .await
        .unwrap();
        let primaries: Vec<&str> = described["taskSets"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|ts| ts["status"] == "PRIMARY")
            .map(|ts| ts["id"].as_str().unwrap())
            .collect();
        assert_eq!(vec![second.as_str()], primaries);
    }

    #[tokio::test]
    async fn test_update_task_set_rescales() {
        let api = test_api();
        seed_service(&api).await;
        let id = create_task_set(&api, 100.0).await;
        let body = call(
            &api,
            "UpdateTaskSet",
            json!({
                "cluster": "production",
                "service": "web",
                "taskSet": id,
                "scale": {"value": 25.0, "unit": "PERCENT"}
            }),
        )
        .await
        .unwrap();
        assert_eq!(1, body["taskSet"]["computedDesiredCount"]);
    }

    #[tokio::test]
    async fn test_delete_primary_requires_force() {
        let api = test_api();
        seed_service(&api).await;
        let id = create_task_set(&api, 100.0).await;
        call(
            &api,
            "UpdateServicePrimaryTaskSet",
            json!({"cluster": "production", "service": "web", "primaryTaskSet": id.clone()}),
        )
        .await
        .unwrap();

        let error = call(
            &api,
            "DeleteTaskSet",
            json!({"cluster": "production", "service": "web", "taskSet": id.clone()}),
        )
        .await
        .unwrap_err();
        assert_eq!("InvalidParameterException", error.kind);

        call(
            &api,
            "DeleteTaskSet",
            json!({"cluster": "production", "service": "web", "taskSet": id.clone(), "force": true}),
        )
        .await
        .unwrap();
        let error = call(
            &api,
            "DescribeTaskSets",
            json!({"cluster": "production", "service": "web", "taskSets": [id]}),
        )
        .await
        .unwrap();
        assert_eq!("MISSING", error["failures"][0]["reason"]);
    }

    #[tokio::test]
    async fn test_unknown_task_set_not_found() {
        let api = test_api();
        seed_service(&api).await;
        let error = call(
            &api,
            "UpdateServicePrimaryTaskSet",
            json!({"cluster": "production", "service": "web", "primaryTaskSet": "ghost"}),
        )
        .await
        .unwrap_err();
        assert_eq!("TaskSetNotFoundException", error.kind);
    }
}
