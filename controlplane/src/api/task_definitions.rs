//! TaskDefinition operations.

use super::{Api, ApiError};
use chrono::Utc;
use kecs_shared::ecs::arn::family_and_revision;
use kecs_shared::ecs::error::{EcsError, ResourceKind};
use kecs_shared::ecs::task_definition::{
    ContainerDefinition, NetworkMode, PlacementConstraint, TaskDefinition, TaskDefinitionStatus,
    Volume,
};
use kecs_shared::ecs::Tag;
use kecs_shared::store::Pagination;
use log::info;
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RegisterTaskDefinitionRequest {
    pub family: String,
    pub container_definitions: Vec<ContainerDefinition>,
    #[serde(default)]
    pub network_mode: Option<String>,
    #[serde(default)]
    pub cpu: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub volumes: Option<Vec<Volume>>,
    #[serde(default)]
    pub placement_constraints: Option<Vec<PlacementConstraint>>,
    #[serde(default)]
    pub requires_compatibilities: Option<Vec<String>>,
    #[serde(default)]
    pub tags: Option<Vec<Tag>>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DescribeTaskDefinitionRequest {
    pub task_definition: String,
    #[serde(default)]
    pub include: Option<Vec<String>>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ListTaskDefinitionsRequest {
    #[serde(default)]
    pub family_prefix: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub max_results: Option<i32>,
    #[serde(default)]
    pub next_token: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ListTaskDefinitionFamiliesRequest {
    #[serde(default)]
    pub family_prefix: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub max_results: Option<i32>,
    #[serde(default)]
    pub next_token: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeregisterTaskDefinitionRequest {
    pub task_definition: String,
}

/// ECS wire shape of a task definition entity.
pub(crate) fn task_definition_to_wire(definition: &TaskDefinition) -> Value {
    json!({
        "taskDefinitionArn": definition.task_definition_arn,
        "family": definition.family,
        "revision": definition.revision,
        "status": definition.status.as_str(),
        "containerDefinitions": definition.container_definitions,
        "networkMode": definition.network_mode.as_str(),
        "cpu": definition.cpu,
        "memory": definition.memory,
        "volumes": definition.volumes,
        "placementConstraints": definition.placement_constraints,
        "requiresCompatibilities": definition.requires_compatibilities,
        "registeredAt": definition.registered_at,
        "deregisteredAt": definition.deregistered_at,
    })
}

fn parse_status(status: Option<&str>) -> Result<Option<TaskDefinitionStatus>, ApiError> {
    match status {
        None => Ok(None),
        Some("ACTIVE") => Ok(Some(TaskDefinitionStatus::Active)),
        Some("INACTIVE") => Ok(Some(TaskDefinitionStatus::Inactive)),
        Some(other) => Err(ApiError::validation(format!(
            "unknown task definition status: {}",
            other
        ))),
    }
}

fn validate_register(request: &RegisterTaskDefinitionRequest) -> Result<NetworkMode, ApiError> {
    if request.family.is_empty() || request.family.len() > 255 {
        return Err(ApiError::validation(
            "family must be between 1 and 255 characters",
        ));
    }
    if !request
        .family
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ApiError::validation(
            "family may only contain letters, numbers, hyphens and underscores",
        ));
    }
    if request.container_definitions.is_empty() {
        return Err(ApiError::validation(
            "containerDefinitions must contain at least one container",
        ));
    }
    for container in &request.container_definitions {
        if container.name.is_empty() {
            return Err(ApiError::validation("container name is required"));
        }
        if container.image.is_empty() {
            return Err(ApiError::validation(format!(
                "container {} has no image",
                container.name
            )));
        }
    }
    if !request.container_definitions.iter().any(|c| c.is_essential()) {
        return Err(ApiError::validation(
            "at least one container must be essential",
        ));
    }
    match request.network_mode.as_deref() {
        None => Ok(NetworkMode::default()),
        Some(mode) => NetworkMode::from_str(mode).map_err(ApiError::validation),
    }
}

impl Api {
    pub async fn register_task_definition(
        &self,
        request: RegisterTaskDefinitionRequest,
    ) -> Result<Value, ApiError> {
        let network_mode = validate_register(&request)?;
        let definition = TaskDefinition {
            task_definition_arn: String::new(),
            family: request.family.clone(),
            revision: 0,
            status: TaskDefinitionStatus::Active,
            container_definitions: request.container_definitions,
            network_mode,
            cpu: request.cpu,
            memory: request.memory,
            volumes: request.volumes.unwrap_or_default(),
            placement_constraints: request.placement_constraints.unwrap_or_default(),
            requires_compatibilities: request.requires_compatibilities.unwrap_or_default(),
            tags: request.tags.unwrap_or_default(),
            registered_at: Utc::now(),
            deregistered_at: None,
            version: 0,
        };
        let registered = self.ctx.store.register_task_definition(definition).await?;
        info!(
            "register_task_definition - {}",
            registered.task_definition_arn
        );
        Ok(json!({ "taskDefinition": task_definition_to_wire(&registered) }))
    }

    /// Look up a definition by `family`, `family:revision` or full ARN;
    /// a bare family resolves to its latest revision.
    pub(crate) async fn resolve_task_definition(
        &self,
        reference: &str,
    ) -> Result<TaskDefinition, ApiError> {
        let (family, revision) = family_and_revision(reference);
        let found = match revision {
            Some(revision) => self.ctx.store.get_task_definition(&family, revision).await?,
            None => self.ctx.store.latest_task_definition(&family).await?,
        };
        found.ok_or_else(|| {
            ApiError::from(EcsError::not_found(ResourceKind::TaskDefinition, reference))
        })
    }

    pub async fn describe_task_definition(
        &self,
        request: DescribeTaskDefinitionRequest,
    ) -> Result<Value, ApiError> {
        let definition = self.resolve_task_definition(&request.task_definition).await?;
        let mut body = json!({ "taskDefinition": task_definition_to_wire(&definition) });
        if request
            .include
            .as_deref()
            .map(|include| include.iter().any(|i| i == "TAGS"))
            .unwrap_or(false)
        {
            body["tags"] = serde_json::to_value(&definition.tags)
                .map_err(|e| ApiError::new("ServerException", e.to_string()))?;
        }
        Ok(body)
    }

    pub async fn list_task_definitions(
        &self,
        request: ListTaskDefinitionsRequest,
    ) -> Result<Value, ApiError> {
        let status = parse_status(request.status.as_deref())?;
        let page = self
            .ctx
            .store
            .list_task_definitions(
                request.family_prefix,
                status,
                &Pagination {
                    max_results: request.max_results,
                    next_token: request.next_token,
                },
            )
            .await?;
        let mut arns: Vec<String> = page
            .items
            .iter()
            .map(|d| d.task_definition_arn.clone())
            .collect();
        if request.sort.as_deref() == Some("DESC") {
            arns.reverse();
        }
        let mut body = json!({ "taskDefinitionArns": arns });
        if let Some(token) = page.next_token {
            body["nextToken"] = Value::String(token);
        }
        Ok(body)
    }

    pub async fn list_task_definition_families(
        &self,
        request: ListTaskDefinitionFamiliesRequest,
    ) -> Result<Value, ApiError> {
        let status = parse_status(request.status.as_deref())?;
        let page = self
            .ctx
            .store
            .list_task_definition_families(
                request.family_prefix,
                status,
                &Pagination {
                    max_results: request.max_results,
                    next_token: request.next_token,
                },
            )
            .await?;
        let mut body = json!({ "families": page.items });
        if let Some(token) = page.next_token {
            body["nextToken"] = Value::String(token);
        }
        Ok(body)
    }

    pub async fn deregister_task_definition(
        &self,
        request: DeregisterTaskDefinitionRequest,
    ) -> Result<Value, ApiError> {
        let (family, revision) = family_and_revision(&request.task_definition);
        let Some(revision) = revision else {
            return Err(ApiError::validation(
                "taskDefinition must include a revision (family:revision)",
            ));
        };
        // resolve first so an unknown definition surfaces as not-found
        self.ctx
            .store
            .get_task_definition(&family, revision)
            .await?
            .ok_or_else(|| {
                ApiError::from(EcsError::not_found(
                    ResourceKind::TaskDefinition,
                    &request.task_definition,
                ))
            })?;
        let deregistered = self
            .ctx
            .store
            .update_task_definition_status(&family, revision, TaskDefinitionStatus::Inactive)
            .await?;
        info!(
            "deregister_task_definition - {}",
            deregistered.task_definition_arn
        );
        Ok(json!({ "taskDefinition": task_definition_to_wire(&deregistered) }))
    }
}
