//! ECS API handlers and the operation dispatcher.
//!
//! The gateway delivers decoded operations as `(name, JSON payload)`
//! pairs; the dispatcher routes them to typed handlers. Requests are
//! parsed strictly: unknown fields and unknown enum values reject with
//! `InvalidParameterException` rather than being silently dropped.

use crate::cluster::ClusterProvider;
use crate::ctx::ControlPlaneContext;
use crate::service_manager::ServiceManager;
use crate::task_manager::TaskManager;
use crate::util::config::ControlPlaneConfig;
use crate::util::stopper::Stopper;
use kecs_shared::ecs::arn::cluster_name_from_name_or_arn;
use kecs_shared::ecs::cluster::Cluster;
use kecs_shared::ecs::error::{EcsError, ResourceKind};
use log::{info, trace};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub mod account;
pub mod clusters;
pub mod services;
pub mod tags;
pub mod task_definitions;
pub mod task_sets;
pub mod tasks;

/// Handler deadline per request
pub const HANDLER_TIMEOUT: Duration = Duration::from_secs(30);
/// Cluster assumed when a request omits one
pub const DEFAULT_CLUSTER_NAME: &str = "default";

/// Error carried back to the wire as
/// `{"__type":"<Kind>","message":"..."}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiError {
    pub kind: String,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        ApiError {
            kind: kind.to_string(),
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new("InvalidParameterException", message)
    }

    pub fn unknown_operation(op: &str) -> Self {
        Self::new(
            "UnknownOperationException",
            format!("The operation {} is not supported", op),
        )
    }

    pub fn body(&self) -> Value {
        serde_json::json!({
            "__type": self.kind,
            "message": self.message,
        })
    }
}

impl From<EcsError> for ApiError {
    fn from(e: EcsError) -> Self {
        ApiError {
            kind: e.exception_kind().to_string(),
            message: e.to_string(),
        }
    }
}

impl From<kecs_shared::store::StoreError> for ApiError {
    fn from(e: kecs_shared::store::StoreError) -> Self {
        ApiError::from(EcsError::from(e))
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// All state the handlers need.
pub struct Api {
    pub ctx: Arc<ControlPlaneContext>,
    pub provider: Arc<dyn ClusterProvider>,
    pub tasks: Arc<TaskManager>,
    pub services: Arc<ServiceManager>,
    pub config: ControlPlaneConfig,
    pub stopper: Stopper,
}

impl Api {
    pub fn new(
        ctx: Arc<ControlPlaneContext>,
        provider: Arc<dyn ClusterProvider>,
        config: ControlPlaneConfig,
        stopper: Stopper,
    ) -> Arc<Self> {
        Arc::new(Api {
            tasks: Arc::new(TaskManager::new(ctx.clone())),
            services: Arc::new(ServiceManager::new(ctx.clone())),
            ctx,
            provider,
            config,
            stopper,
        })
    }

    /// Strict request parsing: any malformed or unknown field is the
    /// caller's fault.
    fn parse<T: DeserializeOwned>(payload: Value) -> Result<T, ApiError> {
        serde_json::from_value(payload).map_err(|e| ApiError::validation(e.to_string()))
    }

    fn to_value<T: serde::Serialize>(response: T) -> Result<Value, ApiError> {
        serde_json::to_value(response)
            .map_err(|e| ApiError::new("ServerException", e.to_string()))
    }

    /// Resolve a cluster reference (name, ARN or absent) to the stored
    /// entity.
    pub(crate) async fn resolve_cluster(
        &self,
        cluster: Option<&str>,
    ) -> Result<Cluster, ApiError> {
        let name = cluster
            .map(cluster_name_from_name_or_arn)
            .unwrap_or(DEFAULT_CLUSTER_NAME);
        self.ctx
            .store
            .get_cluster(name)
            .await?
            .ok_or_else(|| EcsError::not_found(ResourceKind::Cluster, name).into())
    }

    /// Route one decoded operation. `op` is the suffix of
    /// `X-Amz-Target` after the service prefix.
    pub async fn dispatch(&self, op: &str, payload: Value) -> Result<Value, ApiError> {
        trace!("dispatch - {}", op);
        let handled = tokio::time::timeout(HANDLER_TIMEOUT, self.dispatch_inner(op, payload)).await;
        match handled {
            Ok(result) => result,
            Err(_) => {
                info!("dispatch - {} timed out after {:?}", op, HANDLER_TIMEOUT);
                Err(ApiError::new(
                    "ServerException",
                    format!("{} did not complete within {:?}", op, HANDLER_TIMEOUT),
                ))
            }
        }
    }

    async fn dispatch_inner(&self, op: &str, payload: Value) -> Result<Value, ApiError> {
        match op {
            // clusters
            "CreateCluster" => Self::to_value(self.create_cluster(Self::parse(payload)?).await?),
            "DescribeClusters" => {
                Self::to_value(self.describe_clusters(Self::parse(payload)?).await?)
            }
            "ListClusters" => Self::to_value(self.list_clusters(Self::parse(payload)?).await?),
            "DeleteCluster" => Self::to_value(self.delete_cluster(Self::parse(payload)?).await?),
            "PutClusterCapacityProviders" => Self::to_value(
                self.put_cluster_capacity_providers(Self::parse(payload)?)
                    .await?,
            ),

            // task definitions
            "RegisterTaskDefinition" => {
                Self::to_value(self.register_task_definition(Self::parse(payload)?).await?)
            }
            "DescribeTaskDefinition" => {
                Self::to_value(self.describe_task_definition(Self::parse(payload)?).await?)
            }
            "ListTaskDefinitions" => {
                Self::to_value(self.list_task_definitions(Self::parse(payload)?).await?)
            }
            "ListTaskDefinitionFamilies" => Self::to_value(
                self.list_task_definition_families(Self::parse(payload)?)
                    .await?,
            ),
            "DeregisterTaskDefinition" => Self::to_value(
                self.deregister_task_definition(Self::parse(payload)?)
                    .await?,
            ),

            // tasks
            "RunTask" => Self::to_value(self.run_task(Self::parse(payload)?).await?),
            "StartTask" => Self::to_value(self.start_task(Self::parse(payload)?).await?),
            "StopTask" => Self::to_value(self.stop_task(Self::parse(payload)?).await?),
            "DescribeTasks" => Self::to_value(self.describe_tasks(Self::parse(payload)?).await?),
            "ListTasks" => Self::to_value(self.list_tasks(Self::parse(payload)?).await?),

            // services
            "CreateService" => Self::to_value(self.create_service(Self::parse(payload)?).await?),
            "UpdateService" => Self::to_value(self.update_service(Self::parse(payload)?).await?),
            "DescribeServices" => {
                Self::to_value(self.describe_services(Self::parse(payload)?).await?)
            }
            "ListServices" => Self::to_value(self.list_services(Self::parse(payload)?).await?),
            "DeleteService" => Self::to_value(self.delete_service(Self::parse(payload)?).await?),

            // task sets
            "CreateTaskSet" => Self::to_value(self.create_task_set(Self::parse(payload)?).await?),
            "DescribeTaskSets" => {
                Self::to_value(self.describe_task_sets(Self::parse(payload)?).await?)
            }
            "UpdateTaskSet" => Self::to_value(self.update_task_set(Self::parse(payload)?).await?),
            "DeleteTaskSet" => Self::to_value(self.delete_task_set(Self::parse(payload)?).await?),
            "UpdateServicePrimaryTaskSet" => Self::to_value(
                self.update_service_primary_task_set(Self::parse(payload)?)
                    .await?,
            ),

            // tags
            "TagResource" => Self::to_value(self.tag_resource(Self::parse(payload)?).await?),
            "UntagResource" => Self::to_value(self.untag_resource(Self::parse(payload)?).await?),
            "ListTagsForResource" => {
                Self::to_value(self.list_tags_for_resource(Self::parse(payload)?).await?)
            }

            // account settings / attributes / container instances
            "PutAccountSetting" => {
                Self::to_value(self.put_account_setting(Self::parse(payload)?).await?)
            }
            "PutAccountSettingDefault" => Self::to_value(
                self.put_account_setting_default(Self::parse(payload)?)
                    .await?,
            ),
            "ListAccountSettings" => {
                Self::to_value(self.list_account_settings(Self::parse(payload)?).await?)
            }
            "DeleteAccountSetting" => {
                Self::to_value(self.delete_account_setting(Self::parse(payload)?).await?)
            }
            "PutAttributes" => Self::to_value(self.put_attributes(Self::parse(payload)?).await?),
            "DeleteAttributes" => {
                Self::to_value(self.delete_attributes(Self::parse(payload)?).await?)
            }
            "ListAttributes" => Self::to_value(self.list_attributes(Self::parse(payload)?).await?),
            "ListContainerInstances" => {
                Self::to_value(self.list_container_instances(Self::parse(payload)?).await?)
            }
            "DescribeContainerInstances" => Self::to_value(
                self.describe_container_instances(Self::parse(payload)?)
                    .await?,
            ),

            other => Err(ApiError::unknown_operation(other)),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{call, test_api};
    use super::*;

    #[test]
    fn test_api_error_wire_body() {
        let error = ApiError::validation("desiredCount must be non-negative");
        let body = error.body();
        assert_eq!("InvalidParameterException", body["__type"]);
        assert_eq!("desiredCount must be non-negative", body["message"]);
    }

    #[test]
    fn test_ecs_error_mapping() {
        let error: ApiError = EcsError::not_found(ResourceKind::Cluster, "production").into();
        assert_eq!("ClusterNotFoundException", error.kind);
        let error: ApiError = EcsError::Unsupported("task sets".to_string()).into();
        assert_eq!("UnsupportedFeatureException", error.kind);
    }

    #[tokio::test]
    async fn test_unknown_operation_rejected() {
        let api = test_api();
        let error = call(&api, "LaunchRockets", serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!("UnknownOperationException", error.kind);
    }

    #[tokio::test]
    async fn test_unknown_request_field_rejected() {
        let api = test_api();
        let error = call(
            &api,
            "CreateCluster",
            serde_json::json!({"clusterName": "production", "warpDrive": true}),
        )
        .await
        .unwrap_err();
        assert_eq!("InvalidParameterException", error.kind);
    }
}
