//! Task operations.

use super::{Api, ApiError};
use crate::convert::task_definition::task_definition_to_pod_spec;
use chrono::Utc;
use kecs_shared::ecs::arn::task_id_from_pod_name;
use kecs_shared::ecs::cluster::Cluster;
use kecs_shared::ecs::error::{EcsError, ResourceKind};
use kecs_shared::ecs::task::{
    Attachment, Connectivity, ContainerSnapshot, HealthStatus, LaunchType, Task,
    TaskDesiredStatus, TaskLastStatus, TaskStopCode,
};
use kecs_shared::ecs::task_definition::{NetworkMode, TaskDefinition, TaskDefinitionStatus};
use kecs_shared::ecs::KeyValuePair;
use kecs_shared::store::{Pagination, TaskFilter};
use log::{error, info};
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;
use uuid::Uuid;

/// Upper bound on tasks started by one RunTask call
const MAX_RUN_TASK_COUNT: i32 = 10;

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RunTaskRequest {
    #[serde(default)]
    pub cluster: Option<String>,
    pub task_definition: String,
    #[serde(default)]
    pub count: Option<i32>,
    #[serde(default)]
    pub launch_type: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub started_by: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StartTaskRequest {
    #[serde(default)]
    pub cluster: Option<String>,
    pub task_definition: String,
    pub container_instances: Vec<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub started_by: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StopTaskRequest {
    #[serde(default)]
    pub cluster: Option<String>,
    pub task: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DescribeTasksRequest {
    #[serde(default)]
    pub cluster: Option<String>,
    pub tasks: Vec<String>,
    #[serde(default)]
    pub include: Option<Vec<String>>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ListTasksRequest {
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default)]
    pub desired_status: Option<String>,
    #[serde(default)]
    pub launch_type: Option<String>,
    #[serde(default)]
    pub container_instance: Option<String>,
    #[serde(default)]
    pub max_results: Option<i32>,
    #[serde(default)]
    pub next_token: Option<String>,
}

/// ECS wire shape of a task entity.
pub(crate) fn task_to_wire(task: &Task) -> Value {
    json!({
        "taskArn": task.task_arn,
        "clusterArn": task.cluster_arn,
        "taskDefinitionArn": task.task_definition_arn,
        "desiredStatus": task.desired_status.as_str(),
        "lastStatus": task.last_status.as_str(),
        "launchType": task.launch_type.as_str(),
        "containers": task.containers,
        "attachments": task.attachments,
        "startedBy": task.started_by,
        "group": task.group,
        "connectivity": task.connectivity,
        "healthStatus": task.health_status,
        "stopCode": task.stop_code,
        "stoppedReason": task.stopped_reason,
        "createdAt": task.created_at,
        "pullStartedAt": task.pull_started_at,
        "pullStoppedAt": task.pull_stopped_at,
        "startedAt": task.started_at,
        "stoppingAt": task.stopping_at,
        "stoppedAt": task.stopped_at,
        "executionStoppedAt": task.execution_stopped_at,
        "containerInstanceArn": task.container_instance_arn,
        "version": task.version,
    })
}

fn parse_launch_type(launch_type: Option<&str>) -> Result<LaunchType, ApiError> {
    match launch_type {
        None => Ok(LaunchType::default()),
        Some(value) => LaunchType::from_str(value).map_err(ApiError::validation),
    }
}

fn initial_containers(definition: &TaskDefinition) -> Vec<ContainerSnapshot> {
    definition
        .container_definitions
        .iter()
        .map(|container| ContainerSnapshot {
            name: container.name.clone(),
            container_arn: None,
            image: Some(container.image.clone()),
            last_status: "PENDING".to_string(),
            exit_code: None,
            reason: None,
            health_status: HealthStatus::Unknown,
        })
        .collect()
}

/// Fabricated ENI attachment for awsvpc tasks. The IDs are synthetic;
/// the pod network is the real transport.
fn fabricate_eni_attachment() -> Attachment {
    let eni_suffix: String = Uuid::new_v4().simple().to_string()[..17].to_string();
    Attachment {
        id: Uuid::new_v4().to_string(),
        attachment_type: "ElasticNetworkInterface".to_string(),
        status: "ATTACHED".to_string(),
        details: vec![KeyValuePair {
            name: Some("networkInterfaceId".to_string()),
            value: Some(format!("eni-{}", eni_suffix)),
        }],
    }
}

impl Api {
    fn build_task(
        &self,
        cluster: &Cluster,
        definition: &TaskDefinition,
        launch_type: LaunchType,
        group: Option<&str>,
        started_by: Option<&str>,
        container_instance_arn: Option<&str>,
    ) -> Task {
        let suffix = Uuid::new_v4().simple().to_string()[..8].to_string();
        let pod_name = format!("{}-{}", definition.family, suffix);
        let task_id = task_id_from_pod_name(&pod_name);
        let namespace = self
            .ctx
            .identifiers
            .workload_namespace(&cluster.cluster_name);
        let attachments = if definition.network_mode == NetworkMode::Awsvpc {
            vec![fabricate_eni_attachment()]
        } else {
            vec![]
        };
        Task {
            task_arn: self.ctx.identifiers.task_arn(&cluster.cluster_name, &task_id),
            cluster_arn: cluster.cluster_arn.clone(),
            task_definition_arn: definition.task_definition_arn.clone(),
            desired_status: TaskDesiredStatus::Running,
            last_status: TaskLastStatus::Pending,
            launch_type,
            containers: initial_containers(definition),
            containers_json: None,
            attachments,
            started_by: started_by.map(str::to_string),
            group: Some(
                group
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("family:{}", definition.family)),
            ),
            connectivity: Connectivity::Connected,
            health_status: HealthStatus::Unknown,
            stop_code: None,
            stopped_reason: None,
            created_at: Utc::now(),
            pull_started_at: None,
            pull_stopped_at: None,
            started_at: None,
            stopping_at: None,
            stopped_at: None,
            execution_stopped_at: None,
            container_instance_arn: container_instance_arn.map(str::to_string),
            pod_name: Some(pod_name),
            namespace: Some(namespace),
            version: 1,
        }
    }

    async fn launch_tasks(
        &self,
        cluster: &Cluster,
        definition: &TaskDefinition,
        count: i32,
        launch_type: LaunchType,
        group: Option<&str>,
        started_by: Option<&str>,
        container_instance_arn: Option<&str>,
    ) -> Result<Value, ApiError> {
        let conversion = task_definition_to_pod_spec(definition).map_err(ApiError::from)?;
        let publishes_ports = definition
            .container_definitions
            .iter()
            .flat_map(|c| c.port_mappings.iter())
            .any(|mapping| mapping.container_port.is_some());

        let mut tasks = Vec::new();
        let mut failures = Vec::new();
        for _ in 0..count {
            let task = self.build_task(
                cluster,
                definition,
                launch_type,
                group,
                started_by,
                container_instance_arn,
            );
            if publishes_ports {
                if let Err(e) = self.ctx.port_allocator.allocate(&task.task_arn) {
                    failures.push(json!({
                        "arn": task.task_arn,
                        "reason": "RESOURCE:PORTS",
                        "detail": e.to_string(),
                    }));
                    continue;
                }
            }
            if self.config.test_mode {
                self.ctx.store.create_task(&task).await?;
                tasks.push(task_to_wire(&task));
                continue;
            }
            match self.tasks.create_task(&conversion, task.clone()).await {
                Ok(created) => {
                    tasks.push(task_to_wire(&created));
                    self.spawn_task_watcher(&created);
                }
                Err(e) => {
                    error!("launch_tasks - {} failed: {}", task.task_arn, e);
                    self.ctx.port_allocator.release(&task.task_arn);
                    failures.push(json!({
                        "arn": task.task_arn,
                        "reason": "RESOURCE",
                        "detail": e.to_string(),
                    }));
                }
            }
        }
        Ok(json!({ "tasks": tasks, "failures": failures }))
    }

    fn spawn_task_watcher(&self, task: &Task) {
        let (Some(namespace), Some(pod_name)) = (task.namespace.clone(), task.pod_name.clone())
        else {
            return;
        };
        let manager = self.tasks.clone();
        let task_arn = task.task_arn.clone();
        let stopper = self.stopper.clone();
        tokio::spawn(async move {
            if let Err(e) = manager
                .watch_pod(&namespace, &pod_name, &task_arn, stopper)
                .await
            {
                error!("spawn_task_watcher - watcher for {} exited: {}", task_arn, e);
            }
        });
    }

    pub async fn run_task(&self, request: RunTaskRequest) -> Result<Value, ApiError> {
        let count = request.count.unwrap_or(1);
        if !(1..=MAX_RUN_TASK_COUNT).contains(&count) {
            return Err(ApiError::validation(format!(
                "count must be between 1 and {}",
                MAX_RUN_TASK_COUNT
            )));
        }
        let launch_type = parse_launch_type(request.launch_type.as_deref())?;
        let cluster = self.resolve_cluster(request.cluster.as_deref()).await?;
        let definition = self.resolve_task_definition(&request.task_definition).await?;
        if definition.status != TaskDefinitionStatus::Active {
            return Err(ApiError::validation(format!(
                "task definition {} is INACTIVE",
                definition.family_revision()
            )));
        }
        info!(
            "run_task - {} x{} on {}",
            definition.family_revision(),
            count,
            cluster.cluster_name
        );
        self.launch_tasks(
            &cluster,
            &definition,
            count,
            launch_type,
            request.group.as_deref(),
            request.started_by.as_deref(),
            None,
        )
        .await
    }

    pub async fn start_task(&self, request: StartTaskRequest) -> Result<Value, ApiError> {
        if request.container_instances.is_empty() {
            return Err(ApiError::validation(
                "containerInstances must contain at least one instance",
            ));
        }
        let cluster = self.resolve_cluster(request.cluster.as_deref()).await?;
        let definition = self.resolve_task_definition(&request.task_definition).await?;
        if definition.status != TaskDefinitionStatus::Active {
            return Err(ApiError::validation(format!(
                "task definition {} is INACTIVE",
                definition.family_revision()
            )));
        }
        self.launch_tasks(
            &cluster,
            &definition,
            request.container_instances.len() as i32,
            LaunchType::Ec2,
            request.group.as_deref(),
            request.started_by.as_deref(),
            request.container_instances.first().map(String::as_str),
        )
        .await
    }

    pub async fn stop_task(&self, request: StopTaskRequest) -> Result<Value, ApiError> {
        let cluster = self.resolve_cluster(request.cluster.as_deref()).await?;
        let reason = request
            .reason
            .unwrap_or_else(|| "Task stopped by user".to_string());

        let stopped = if self.config.test_mode {
            let task = self
                .ctx
                .store
                .get_task(&cluster.cluster_arn, &request.task)
                .await?
                .ok_or_else(|| {
                    ApiError::from(EcsError::not_found(ResourceKind::Task, &request.task))
                })?;
            let mut stopping = task;
            stopping.desired_status = TaskDesiredStatus::Stopped;
            stopping.stopped_reason = Some(reason);
            stopping.stop_code = Some(TaskStopCode::UserInitiated);
            stopping.stopping_at.get_or_insert_with(Utc::now);
            self.ctx.store.update_task(&stopping).await?
        } else {
            self.tasks
                .stop_task(
                    &cluster.cluster_arn,
                    &request.task,
                    &reason,
                    TaskStopCode::UserInitiated,
                )
                .await?
        };
        Ok(json!({ "task": task_to_wire(&stopped) }))
    }

    pub async fn describe_tasks(&self, request: DescribeTasksRequest) -> Result<Value, ApiError> {
        if request.tasks.is_empty() {
            return Err(ApiError::validation("tasks must not be empty"));
        }
        let cluster = self.resolve_cluster(request.cluster.as_deref()).await?;
        let mut tasks = Vec::new();
        let mut failures = Vec::new();
        for reference in &request.tasks {
            match self
                .ctx
                .store
                .get_task(&cluster.cluster_arn, reference)
                .await?
            {
                Some(task) => tasks.push(task_to_wire(&task)),
                None => failures.push(json!({
                    "arn": reference,
                    "reason": "MISSING",
                })),
            }
        }
        Ok(json!({ "tasks": tasks, "failures": failures }))
    }

    pub async fn list_tasks(&self, request: ListTasksRequest) -> Result<Value, ApiError> {
        let cluster = self.resolve_cluster(request.cluster.as_deref()).await?;
        let desired_status = match request.desired_status.as_deref() {
            None => None,
            Some("RUNNING") => Some(TaskDesiredStatus::Running),
            Some("STOPPED") => Some(TaskDesiredStatus::Stopped),
            Some(other) => {
                return Err(ApiError::validation(format!(
                    "unknown desiredStatus: {}",
                    other
                )))
            }
        };
        let launch_type = match request.launch_type.as_deref() {
            None => None,
            Some(value) => Some(LaunchType::from_str(value).map_err(ApiError::validation)?),
        };
        let filter = TaskFilter {
            cluster_arn: cluster.cluster_arn.clone(),
            service_name: request.service_name,
            desired_status,
            launch_type,
            family: request.family,
            group: None,
            container_instance: request.container_instance,
        };
        let page = self
            .ctx
            .store
            .list_tasks(
                &filter,
                &Pagination {
                    max_results: request.max_results,
                    next_token: request.next_token,
                },
            )
            .await?;
        let arns: Vec<String> = page.items.iter().map(|t| t.task_arn.clone()).collect();
        let mut body = json!({ "taskArns": arns });
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

    async fn seed_cluster_and_definition(api: &Api) {
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
                ],
                "networkMode": "awsvpc"
            }),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_run_task_returns_task_arn_in_cluster() {
        let api = test_api();
        seed_cluster_and_definition(&api).await;
        let body = call(
            &api,
            "RunTask",
            json!({"cluster": "production", "taskDefinition": "web:1", "count": 1}),
        )
        .await
        .unwrap();
        let arn = body["tasks"][0]["taskArn"].as_str().unwrap();
        assert!(arn.starts_with("arn:aws:ecs:us-east-1:000000000000:task/production/"));
        let task_id = arn.rsplit('/').next().unwrap();
        assert_eq!(16, task_id.len());
        assert!(task_id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!("PENDING", body["tasks"][0]["lastStatus"]);
        assert_eq!("CONNECTED", body["tasks"][0]["connectivity"]);
        assert!(body["failures"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_task_awsvpc_synthesizes_eni_attachment() {
        let api = test_api();
        seed_cluster_and_definition(&api).await;
        let body = call(
            &api,
            "RunTask",
            json!({"cluster": "production", "taskDefinition": "web:1"}),
        )
        .await
        .unwrap();
        let attachment = &body["tasks"][0]["attachments"][0];
        assert_eq!("ElasticNetworkInterface", attachment["type"]);
        assert!(attachment["details"][0]["value"]
            .as_str()
            .unwrap()
            .starts_with("eni-"));
    }

    #[tokio::test]
    async fn test_run_task_appears_in_list_tasks() {
        let api = test_api();
        seed_cluster_and_definition(&api).await;
        let run = call(
            &api,
            "RunTask",
            json!({"cluster": "production", "taskDefinition": "web:1"}),
        )
        .await
        .unwrap();
        let arn = run["tasks"][0]["taskArn"].as_str().unwrap();
        let list = call(&api, "ListTasks", json!({"cluster": "production"}))
            .await
            .unwrap();
        let arns: Vec<&str> = list["taskArns"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert!(arns.contains(&arn));
    }

    #[tokio::test]
    async fn test_run_task_count_bounds() {
        let api = test_api();
        seed_cluster_and_definition(&api).await;
        let error = call(
            &api,
            "RunTask",
            json!({"cluster": "production", "taskDefinition": "web:1", "count": 11}),
        )
        .await
        .unwrap_err();
        assert_eq!("InvalidParameterException", error.kind);
    }

    #[tokio::test]
    async fn test_run_task_unknown_cluster() {
        let api = test_api();
        let error = call(
            &api,
            "RunTask",
            json!({"cluster": "ghost", "taskDefinition": "web:1"}),
        )
        .await
        .unwrap_err();
        assert_eq!("ClusterNotFoundException", error.kind);
    }

    #[tokio::test]
    async fn test_run_task_rejects_inactive_definition() {
        let api = test_api();
        seed_cluster_and_definition(&api).await;
        call(
            &api,
            "DeregisterTaskDefinition",
            json!({"taskDefinition": "web:1"}),
        )
        .await
        .unwrap();
        let error = call(
            &api,
            "RunTask",
            json!({"cluster": "production", "taskDefinition": "web:1"}),
        )
        .await
        .unwrap_err();
        assert_eq!("InvalidParameterException", error.kind);
    }

    #[tokio::test]
    async fn test_stop_task_round_trip() {
        let api = test_api();
        seed_cluster_and_definition(&api).await;
        let run = call(
            &api,
            "RunTask",
            json!({"cluster": "production", "taskDefinition": "web:1"}),
        )
        .await
        .unwrap();
        let arn = run["tasks"][0]["taskArn"].as_str().unwrap();

        let stopped = call(
            &api,
            "StopTask",
            json!({"cluster": "production", "task": arn, "reason": "deploy rollback"}),
        )
        .await
        .unwrap();
        assert_eq!("STOPPED", stopped["task"]["desiredStatus"]);
        assert_eq!("deploy rollback", stopped["task"]["stoppedReason"]);
        assert_eq!("UserInitiated", stopped["task"]["stopCode"]);

        let described = call(
            &api,
            "DescribeTasks",
            json!({"cluster": "production", "tasks": [arn]}),
        )
        .await
        .unwrap();
        assert_eq!("STOPPED", described["tasks"][0]["desiredStatus"]);
    }

    #[tokio::test]
    async fn test_describe_tasks_by_short_id_and_missing() {
        let api = test_api();
        seed_cluster_and_definition(&api).await;
        let run = call(
            &api,
            "RunTask",
            json!({"cluster": "production", "taskDefinition": "web:1"}),
        )
        .await
        .unwrap();
        let arn = run["tasks"][0]["taskArn"].as_str().unwrap();
        let short_id = arn.rsplit('/').next().unwrap();

        let body = call(
            &api,
            "DescribeTasks",
            json!({"cluster": "production", "tasks": [short_id, "0000000000000000"]}),
        )
        .await
        .unwrap();
        assert_eq!(1, body["tasks"].as_array().unwrap().len());
        assert_eq!("MISSING", body["failures"][0]["reason"]);
    }

    #[tokio::test]
    async fn test_list_tasks_filters_by_desired_status() {
        let api = test_api();
        seed_cluster_and_definition(&api).await;
        let run = call(
            &api,
            "RunTask",
            json!({"cluster": "production", "taskDefinition": "web:1", "count": 2}),
        )
        .await
        .unwrap();
        let arn = run["tasks"][0]["taskArn"].as_str().unwrap();
        call(
            &api,
            "StopTask",
            json!({"cluster": "production", "task": arn}),
        )
        .await
        .unwrap();

        let stopped = call(
            &api,
            "ListTasks",
            json!({"cluster": "production", "desiredStatus": "STOPPED"}),
        )
        .await
        .unwrap();
        assert_eq!(json!([arn]), stopped["taskArns"]);

        let running = call(
            &api,
            "ListTasks",
            json!({"cluster": "production", "desiredStatus": "RUNNING"}),
        )
        .await
        .unwrap();
        assert_eq!(1, running["taskArns"].as_array().unwrap().len());
    }

    #[tokio::test]
    async fn test_start_task_requires_container_instance() {
        let api = test_api();
        seed_cluster_and_definition(&api).await;
        let error = call(
            &api,
            "StartTask",
            json!({"cluster": "production", "taskDefinition": "web:1", "containerInstances": []}),
        )
        .await
        .unwrap_err();
        assert_eq!("InvalidParameterException", error.kind);

        let body = call(
            &api,
            "StartTask",
            json!({
                "cluster": "production",
                "taskDefinition": "web:1",
                "containerInstances": ["arn:aws:ecs:us-east-1:000000000000:container-instance/production/abc"]
            }),
        )
        .await
        .unwrap();
        assert_eq!("EC2", body["tasks"][0]["launchType"]);
    }
}
