//! Service operations.

use super::{Api, ApiError};
use chrono::Utc;
use kecs_shared::ecs::error::{EcsError, ResourceKind};
use kecs_shared::ecs::service::{
    DeploymentConfiguration, LoadBalancer, Service, ServiceRegistry, ServiceStatus,
};
use kecs_shared::ecs::task::{LaunchType, Task, TaskDesiredStatus, TaskLastStatus, TaskStopCode};
use kecs_shared::ecs::task_definition::TaskDefinitionStatus;
use kecs_shared::ecs::Tag;
use kecs_shared::store::{Pagination, TaskFilter};
use log::{error, info};
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateServiceRequest {
    #[serde(default)]
    pub cluster: Option<String>,
    pub service_name: String,
    pub task_definition: String,
    #[serde(default)]
    pub desired_count: Option<i32>,
    #[serde(default)]
    pub launch_type: Option<String>,
    #[serde(default)]
    pub deployment_configuration: Option<DeploymentConfiguration>,
    #[serde(default)]
    pub load_balancers: Option<Vec<LoadBalancer>>,
    #[serde(default)]
    pub service_registries: Option<Vec<ServiceRegistry>>,
    #[serde(default)]
    pub tags: Option<Vec<Tag>>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdateServiceRequest {
    #[serde(default)]
    pub cluster: Option<String>,
    pub service: String,
    #[serde(default)]
    pub desired_count: Option<i32>,
    #[serde(default)]
    pub task_definition: Option<String>,
    #[serde(default)]
    pub deployment_configuration: Option<DeploymentConfiguration>,
    #[serde(default)]
    pub force_new_deployment: Option<bool>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeleteServiceRequest {
    #[serde(default)]
    pub cluster: Option<String>,
    pub service: String,
    #[serde(default)]
    pub force: Option<bool>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DescribeServicesRequest {
    #[serde(default)]
    pub cluster: Option<String>,
    pub services: Vec<String>,
    #[serde(default)]
    pub include: Option<Vec<String>>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ListServicesRequest {
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub launch_type: Option<String>,
    #[serde(default)]
    pub max_results: Option<i32>,
    #[serde(default)]
    pub next_token: Option<String>,
}

/// ECS wire shape of a service entity.
pub(crate) fn service_to_wire(service: &Service) -> Value {
    json!({
        "serviceArn": service.service_arn,
        "serviceName": service.service_name,
        "clusterArn": service.cluster_arn,
        "taskDefinition": service.task_definition,
        "desiredCount": service.desired_count,
        "runningCount": service.running_count,
        "pendingCount": service.pending_count,
        "status": service.status.as_str(),
        "launchType": service.launch_type.as_str(),
        "deploymentConfiguration": service.deployment_configuration,
        "loadBalancers": service.load_balancers,
        "serviceRegistries": service.service_registries,
        "createdAt": service.created_at,
        "updatedAt": service.updated_at,
    })
}

fn service_name_from_reference(reference: &str) -> &str {
    kecs_shared::ecs::arn::resource_id_from_arn(reference).unwrap_or(reference)
}

fn validate_service_name(name: &str) -> Result<(), ApiError> {
    if name.is_empty() || name.len() > 255 {
        return Err(ApiError::validation(
            "serviceName must be between 1 and 255 characters",
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ApiError::validation(
            "serviceName may only contain letters, numbers, hyphens and underscores",
        ));
    }
    Ok(())
}

impl Api {
    fn spawn_service_watcher(&self, service: &Service) {
        if self.config.test_mode {
            return;
        }
        let manager = self.services.clone();
        let stopper = self.stopper.clone();
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.watch_service_pods(service, stopper).await {
                error!("spawn_service_watcher - watcher exited: {}", e);
            }
        });
    }

    pub async fn create_service(&self, request: CreateServiceRequest) -> Result<Value, ApiError> {
        validate_service_name(&request.service_name)?;
        let desired_count = request.desired_count.unwrap_or(1);
        if desired_count < 0 {
            return Err(ApiError::validation("desiredCount must be non-negative"));
        }
        let launch_type = match request.launch_type.as_deref() {
            None => LaunchType::default(),
            Some(value) => LaunchType::from_str(value).map_err(ApiError::validation)?,
        };
        let cluster = self.resolve_cluster(request.cluster.as_deref()).await?;
        let definition = self.resolve_task_definition(&request.task_definition).await?;
        if definition.status != TaskDefinitionStatus::Active {
            return Err(ApiError::validation(format!(
                "task definition {} is INACTIVE",
                definition.family_revision()
            )));
        }

        let existing = self
            .ctx
            .store
            .get_service(&cluster.cluster_arn, &request.service_name)
            .await?;
        if let Some(existing) = &existing {
            if existing.status != ServiceStatus::Inactive {
                return Err(ApiError::validation(format!(
                    "Creation of service was not idempotent: {} already exists",
                    request.service_name
                )));
            }
        }

        let now = Utc::now();
        let mut service = Service {
            service_arn: self
                .ctx
                .identifiers
                .service_arn(&cluster.cluster_name, &request.service_name),
            service_name: request.service_name.clone(),
            cluster_arn: cluster.cluster_arn.clone(),
            task_definition: definition.task_definition_arn.clone(),
            desired_count,
            running_count: 0,
            pending_count: 0,
            status: ServiceStatus::Pending,
            launch_type,
            deployment_configuration: request.deployment_configuration,
            load_balancers: request.load_balancers.unwrap_or_default(),
            service_registries: request.service_registries.unwrap_or_default(),
            tags: request.tags.unwrap_or_default(),
            namespace: self
                .ctx
                .identifiers
                .workload_namespace(&cluster.cluster_name),
            deployment_name: request.service_name.clone(),
            created_at: now,
            updated_at: now,
            version: 1,
        };

        match existing {
            // an INACTIVE record may be re-created in place
            Some(inactive) => {
                service.created_at = inactive.created_at;
                service.version = inactive.version;
                service = self.ctx.store.update_service(&service).await?;
            }
            None => {
                self.ctx.store.create_service(&service).await?;
            }
        }
        info!("create_service - persisted {}", service.service_arn);

        if self.config.test_mode {
            let mut active = service.clone();
            active.status = ServiceStatus::Active;
            let stored = self.ctx.store.update_service(&active).await?;
            return Ok(json!({ "service": service_to_wire(&stored) }));
        }

        // the entity is durable; the Kubernetes side is best-effort and
        // self-heals, a failed apply leaves the service PENDING
        let stored = match self.services.create_service(&service, &definition).await {
            Ok(stored) => stored,
            Err(e) => {
                error!(
                    "create_service - applying {} failed, leaving PENDING: {}",
                    service.service_name, e
                );
                service
            }
        };
        self.spawn_service_watcher(&stored);
        Ok(json!({ "service": service_to_wire(&stored) }))
    }

    async fn load_service(
        &self,
        cluster_arn: &str,
        reference: &str,
    ) -> Result<Service, ApiError> {
        let name = service_name_from_reference(reference);
        self.ctx
            .store
            .get_service(cluster_arn, name)
            .await?
            .ok_or_else(|| ApiError::from(EcsError::not_found(ResourceKind::Service, name)))
    }

    pub async fn update_service(&self, request: UpdateServiceRequest) -> Result<Value, ApiError> {
        if let Some(desired) = request.desired_count {
            if desired < 0 {
                return Err(ApiError::validation("desiredCount must be non-negative"));
            }
        }
        let cluster = self.resolve_cluster(request.cluster.as_deref()).await?;
        let mut service = self.load_service(&cluster.cluster_arn, &request.service).await?;
        if service.status == ServiceStatus::Inactive {
            return Err(ApiError::from(EcsError::not_found(
                ResourceKind::Service,
                service.service_name.clone(),
            )));
        }

        let definition = match &request.task_definition {
            Some(reference) => {
                let definition = self.resolve_task_definition(reference).await?;
                service.task_definition = definition.task_definition_arn.clone();
                definition
            }
            None => {
                self.resolve_task_definition(&service.task_definition.clone())
                    .await?
            }
        };
        if let Some(desired) = request.desired_count {
            service.desired_count = desired;
        }
        if let Some(config) = request.deployment_configuration {
            service.deployment_configuration = Some(config);
        }
        service.status = ServiceStatus::Updating;
        service.updated_at = Utc::now();
        let stored = self.ctx.store.update_service(&service).await?;

        if !self.config.test_mode {
            if let Err(e) = self.services.update_service(&stored, &definition).await {
                error!(
                    "update_service - re-applying {} failed: {}",
                    stored.service_name, e
                );
            }
        }
        info!(
            "update_service - {} desired {}",
            stored.service_name, stored.desired_count
        );
        Ok(json!({ "service": service_to_wire(&stored) }))
    }

    pub async fn delete_service(&self, request: DeleteServiceRequest) -> Result<Value, ApiError> {
        let cluster = self.resolve_cluster(request.cluster.as_deref()).await?;
        let service = self.load_service(&cluster.cluster_arn, &request.service).await?;
        if service.status == ServiceStatus::Inactive {
            return Ok(json!({ "service": service_to_wire(&service) }));
        }
        if service.desired_count > 0 && !request.force.unwrap_or(false) {
            return Err(ApiError::validation(
                "The service cannot be deleted while it has a non-zero desired count. \
                 Scale the service to zero or use force=true.",
            ));
        }

        let stored = if self.config.test_mode {
            self.stop_service_tasks_in_store(&service).await?;
            let mut inactive = service.clone();
            inactive.status = ServiceStatus::Inactive;
            inactive.running_count = 0;
            inactive.pending_count = 0;
            inactive.updated_at = Utc::now();
            self.ctx.store.update_service(&inactive).await?
        } else {
            self.services.delete_service(&service).await?
        };
        info!("delete_service - {}", stored.service_arn);
        Ok(json!({ "service": service_to_wire(&stored) }))
    }

    /// Store-only variant of the manager's task sweep, used in test
    /// mode where no pods exist.
    async fn stop_service_tasks_in_store(&self, service: &Service) -> Result<(), ApiError> {
        let mut filter = TaskFilter::for_cluster(&service.cluster_arn);
        filter.service_name = Some(service.service_name.clone());
        let tasks = self
            .ctx
            .store
            .list_tasks(&filter, &Pagination::default())
            .await?;
        for task in tasks.items {
            if task.is_stopped() {
                continue;
            }
            let mut stopped: Task = task;
            stopped.desired_status = TaskDesiredStatus::Stopped;
            stopped.last_status = TaskLastStatus::Stopped;
            let now = Utc::now();
            stopped.stopped_at.get_or_insert(now);
            stopped.execution_stopped_at.get_or_insert(now);
            stopped.stopped_reason = Some("Service deleted".to_string());
            stopped.stop_code.get_or_insert(TaskStopCode::ServiceSchedulerInitiated);
            self.ctx.store.update_task(&stopped).await?;
        }
        Ok(())
    }

    pub async fn describe_services(
        &self,
        request: DescribeServicesRequest,
    ) -> Result<Value, ApiError> {
        if request.services.is_empty() {
            return Err(ApiError::validation("services must not be empty"));
        }
        let cluster = self.resolve_cluster(request.cluster.as_deref()).await?;
        let mut services = Vec::new();
        let mut failures = Vec::new();
        for reference in &request.services {
            let name = service_name_from_reference(reference);
            match self.ctx.store.get_service(&cluster.cluster_arn, name).await? {
                Some(service) => services.push(service_to_wire(&service)),
                None => failures.push(json!({
                    "arn": self
                        .ctx
                        .identifiers
                        .service_arn(&cluster.cluster_name, name),
                    "reason": "MISSING",
                })),
            }
        }
        Ok(json!({ "services": services, "failures": failures }))
    }

    pub async fn list_services(&self, request: ListServicesRequest) -> Result<Value, ApiError> {
        let cluster = self.resolve_cluster(request.cluster.as_deref()).await?;
        let launch_type = match request.launch_type.as_deref() {
            None => None,
            Some(value) => Some(LaunchType::from_str(value).map_err(ApiError::validation)?),
        };
        let page = self
            .ctx
            .store
            .list_services(
                &cluster.cluster_arn,
                launch_type,
                &Pagination {
                    max_results: request.max_results,
                    next_token: request.next_token,
                },
            )
            .await?;
        let arns: Vec<String> = page
            .items
            .iter()
            .filter(|s| s.status != ServiceStatus::Inactive)
            .map(|s| s.service_arn.clone())
            .collect();
        let mut body = json!({ "serviceArns": arns });
        if let Some(token) = page.next_token {
            body["nextToken"] = Value::String(token);
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{call, test_api};
    use super::*;

    async fn seed(api: &Api) {
        call(api, "CreateCluster", json!({"clusterName": "production"}))
            .await
            .unwrap();
        call(
            api,
            "RegisterTaskDefinition",
            json!({
                "family": "web",
                "containerDefinitions": [
                    {
                        "name": "web",
                        "image": "nginx:1.25",
                        "portMappings": [{"containerPort": 80, "protocol": "tcp"}]
                    }
                ]
            }),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_create_service_round_trip() {
        let api = test_api();
        seed(&api).await;
        let created = call(
            &api,
            "CreateService",
            json!({
                "cluster": "production",
                "serviceName": "web",
                "taskDefinition": "web:1",
                "desiredCount": 3
            }),
        )
        .await
        .unwrap();
        assert_eq!(
            "arn:aws:ecs:us-east-1:000000000000:service/production/web",
            created["service"]["serviceArn"]
        );
        assert_eq!("ACTIVE", created["service"]["status"]);
        assert_eq!(3, created["service"]["desiredCount"]);

        let described = call(
            &api,
            "DescribeServices",
            json!({"cluster": "production", "services": ["web"]}),
        )
        .await
        .unwrap();
        assert_eq!("ACTIVE", described["services"][0]["status"]);
        assert!(described["services"][0]["taskDefinition"]
            .as_str()
            .unwrap()
            .ends_with("web:1"));
    }

    #[tokio::test]
    async fn test_create_service_duplicate_rejected() {
        let api = test_api();
        seed(&api).await;
        let request = json!({
            "cluster": "production",
            "serviceName": "web",
            "taskDefinition": "web:1",
            "desiredCount": 1
        });
        call(&api, "CreateService", request.clone()).await.unwrap();
        let error = call(&api, "CreateService", request).await.unwrap_err();
        assert_eq!("InvalidParameterException", error.kind);
    }

    #[tokio::test]
    async fn test_update_service_desired_count() {
        let api = test_api();
        seed(&api).await;
        call(
            &api,
            "CreateService",
            json!({
                "cluster": "production",
                "serviceName": "web",
                "taskDefinition": "web:1",
                "desiredCount": 3
            }),
        )
        .await
        .unwrap();
        let updated = call(
            &api,
            "UpdateService",
            json!({"cluster": "production", "service": "web", "desiredCount": 1}),
        )
        .await
        .unwrap();
        assert_eq!(1, updated["service"]["desiredCount"]);
        assert_eq!("UPDATING", updated["service"]["status"]);
    }

    #[tokio::test]
    async fn test_update_service_rolls_task_definition() {
        let api = test_api();
        seed(&api).await;
        call(
            &api,
            "CreateService",
            json!({
                "cluster": "production",
                "serviceName": "web",
                "taskDefinition": "web:1"
            }),
        )
        .await
        .unwrap();
        // register revision 2 and roll the service onto it
        call(
            &api,
            "RegisterTaskDefinition",
            json!({
                "family": "web",
                "containerDefinitions": [{"name": "web", "image": "nginx:1.26"}]
            }),
        )
        .await
        .unwrap();
        let updated = call(
            &api,
            "UpdateService",
            json!({"cluster": "production", "service": "web", "taskDefinition": "web:2"}),
        )
        .await
        .unwrap();
        assert!(updated["service"]["taskDefinition"]
            .as_str()
            .unwrap()
            .ends_with("web:2"));
    }

    #[tokio::test]
    async fn test_delete_service_requires_zero_desired_or_force() {
        let api = test_api();
        seed(&api).await;
        call(
            &api,
            "CreateService",
            json!({
                "cluster": "production",
                "serviceName": "web",
                "taskDefinition": "web:1",
                "desiredCount": 2
            }),
        )
        .await
        .unwrap();
        let error = call(
            &api,
            "DeleteService",
            json!({"cluster": "production", "service": "web"}),
        )
        .await
        .unwrap_err();
        assert_eq!("InvalidParameterException", error.kind);

        let deleted = call(
            &api,
            "DeleteService",
            json!({"cluster": "production", "service": "web", "force": true}),
        )
        .await
        .unwrap();
        assert_eq!("INACTIVE", deleted["service"]["status"]);

        // INACTIVE services disappear from listings but stay describable
        let listed = call(&api, "ListServices", json!({"cluster": "production"}))
            .await
            .unwrap();
        assert!(listed["serviceArns"].as_array().unwrap().is_empty());
        let described = call(
            &api,
            "DescribeServices",
            json!({"cluster": "production", "services": ["web"]}),
        )
        .await
        .unwrap();
        assert_eq!("INACTIVE", described["services"][0]["status"]);
    }

    #[tokio::test]
    async fn test_delete_cluster_blocked_by_active_service() {
        let api = test_api();
        seed(&api).await;
        call(
            &api,
            "CreateService",
            json!({
                "cluster": "production",
                "serviceName": "web",
                "taskDefinition": "web:1"
            }),
        )
        .await
        .unwrap();
        let error = call(&api, "DeleteCluster", json!({"cluster": "production"}))
            .await
            .unwrap_err();
        assert_eq!("ClusterContainsServicesException", error.kind);
    }

    #[tokio::test]
    async fn test_describe_missing_service_fails_entry() {
        let api = test_api();
        seed(&api).await;
        let body = call(
            &api,
            "DescribeServices",
            json!({"cluster": "production", "services": ["ghost"]}),
        )
        .await
        .unwrap();
        assert_eq!("MISSING", body["failures"][0]["reason"]);
    }

    #[tokio::test]
    async fn test_update_unknown_service_not_found() {
        let api = test_api();
        seed(&api).await;
        let error = call(
            &api,
            "UpdateService",
            json!({"cluster": "production", "service": "ghost", "desiredCount": 1}),
        )
        .await
        .unwrap_err();
        assert_eq!("ServiceNotFoundException", error.kind);
    }
}
