//! Pod lifecycle for RunTask-originated tasks.
//!
//! The manager owns the pod from creation to termination: it ensures
//! the namespace, materializes referenced Secrets, creates the pod,
//! persists the task entity, and keeps the entity in sync with the pod
//! through a per-pod watcher. Status writes flow through the batch
//! updater and never move a task backwards.

use crate::convert::pod_status::project_pod_onto_task;
use crate::convert::task_definition::{build_task_pod, PodConversion, SECRET_VALUE_KEY};
use crate::ctx::ControlPlaneContext;
use crate::util::stopper::Stopper;
use crate::util::with_transient_retry;
use chrono::Utc;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kecs_shared::ecs::arn::cluster_name_from_arn;
use kecs_shared::ecs::error::{EcsError, ResourceKind};
use kecs_shared::ecs::task::{Task, TaskDesiredStatus, TaskLastStatus, TaskStopCode};
use kecs_shared::k8s::api::IntoApi;
use kecs_shared::k8s::{ensure_namespace, managed_labels, FIELD_MANAGER, OBJECT_NAME_FIELD};
use kube::runtime::watcher::{Config, Event};
use log::{error, info, trace};
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct TaskManager {
    ctx: Arc<ControlPlaneContext>,
}

impl TaskManager {
    pub fn new(ctx: Arc<ControlPlaneContext>) -> Self {
        TaskManager { ctx }
    }

    /// Materialize the Kubernetes Secrets a pod spec references. The
    /// body is a placeholder until an upstream secret provider exists;
    /// the object merely has to satisfy the env `secretKeyRef`s.
    async fn materialize_secrets(
        &self,
        conversion: &PodConversion,
        namespace: &str,
    ) -> Result<(), EcsError> {
        let secrets = IntoApi::<Secret>::namespaced(self.ctx.client.as_ref(), namespace);
        for materialization in &conversion.secrets {
            let mut string_data = BTreeMap::new();
            string_data.insert(SECRET_VALUE_KEY.to_string(), "placeholder".to_string());
            let secret = Secret {
                metadata: ObjectMeta {
                    name: Some(materialization.object_name.clone()),
                    namespace: Some(namespace.to_string()),
                    labels: Some(managed_labels()),
                    annotations: Some(BTreeMap::from([(
                        "kecs.dev/value-from".to_string(),
                        materialization.value_from.clone(),
                    )])),
                    ..Default::default()
                },
                string_data: Some(string_data),
                ..Default::default()
            };
            with_transient_retry("apply secret", || {
                secrets.apply(secret.clone(), FIELD_MANAGER)
            })
            .await?;
            trace!(
                "materialize_secrets - applied {} in {}",
                materialization.object_name,
                namespace
            );
        }
        Ok(())
    }

    /// Create the pod and persist the task entity. On pod-create
    /// success but task-persist failure the pod is deleted again so the
    /// two sides stay consistent.
    pub async fn create_task(
        &self,
        conversion: &PodConversion,
        task: Task,
    ) -> Result<Task, EcsError> {
        let namespace = task
            .namespace
            .clone()
            .ok_or_else(|| EcsError::Internal("task has no namespace".to_string()))?;
        let pod_name = task
            .pod_name
            .clone()
            .ok_or_else(|| EcsError::Internal("task has no pod name".to_string()))?;
        let cluster_name = cluster_name_from_arn(&task.cluster_arn)
            .ok_or_else(|| EcsError::Internal(format!("bad cluster arn {}", task.cluster_arn)))?
            .to_string();

        let namespaces = IntoApi::<k8s_openapi::api::core::v1::Namespace>::all(self.ctx.client.as_ref());
        with_transient_retry("ensure namespace", || {
            ensure_namespace(namespaces.as_ref(), &namespace)
        })
        .await?;

        self.materialize_secrets(conversion, &namespace).await?;

        let pod = build_task_pod(
            conversion,
            &pod_name,
            &namespace,
            &cluster_name,
            task.task_id(),
        );
        let pods = IntoApi::<Pod>::namespaced(self.ctx.client.as_ref(), &namespace);
        with_transient_retry("create pod", || pods.create(&pod)).await?;
        info!("create_task - created pod {}/{}", namespace, pod_name);

        if let Err(e) = self.ctx.store.create_task(&task).await {
            error!(
                "create_task - persisting {} failed, deleting pod: {}",
                task.task_arn, e
            );
            if let Err(delete_err) = pods.delete(&pod_name).await {
                error!(
                    "create_task - rollback delete of {}/{} failed: {}",
                    namespace, pod_name, delete_err
                );
            }
            return Err(e.into());
        }

        Ok(task)
    }

    /// Persist the stop intent and delete the backing pod. Idempotent
    /// when the pod is already gone.
    pub async fn stop_task(
        &self,
        cluster_arn: &str,
        task_id: &str,
        reason: &str,
        stop_code: TaskStopCode,
    ) -> Result<Task, EcsError> {
        let task = self
            .ctx
            .store
            .get_task(cluster_arn, task_id)
            .await
            .map_err(EcsError::from)?
            .ok_or_else(|| EcsError::not_found(ResourceKind::Task, task_id))?;

        let mut stopping = task.clone();
        stopping.desired_status = TaskDesiredStatus::Stopped;
        if stopping.stopping_at.is_none() {
            stopping.stopping_at = Some(Utc::now());
        }
        if stopping.stopped_reason.is_none() {
            stopping.stopped_reason = Some(reason.to_string());
        }
        if stopping.stop_code.is_none() {
            stopping.stop_code = Some(stop_code);
        }
        let stored = self
            .ctx
            .store
            .update_task(&stopping)
            .await
            .map_err(EcsError::from)?;

        if let (Some(namespace), Some(pod_name)) = (&stored.namespace, &stored.pod_name) {
            let pods = IntoApi::<Pod>::namespaced(self.ctx.client.as_ref(), namespace);
            with_transient_retry("delete pod", || pods.delete(pod_name)).await?;
            trace!("stop_task - deleted pod {}/{}", namespace, pod_name);
        }
        self.ctx.port_allocator.release(&stored.task_arn);
        Ok(stored)
    }

    /// Project a pod observation onto the task and hand the snapshot to
    /// the batch updater. A STOPPED task is never rewritten.
    pub async fn update_task_status(&self, task_arn: &str, pod: &Pod) -> Result<(), EcsError> {
        let cluster_arn = cluster_name_from_arn(task_arn)
            .map(|name| self.ctx.identifiers.cluster_arn(name))
            .unwrap_or_default();
        let Some(task) = self
            .ctx
            .store
            .get_task(&cluster_arn, task_arn)
            .await
            .map_err(EcsError::from)?
        else {
            trace!("update_task_status - no task for {}", task_arn);
            return Ok(());
        };
        let projected = project_pod_onto_task(&task, pod, Utc::now());
        if projected == task {
            return Ok(());
        }
        if projected.is_stopped() {
            self.ctx.port_allocator.release(&projected.task_arn);
        }
        self.ctx.batch_updater.submit_task_update(projected);
        Ok(())
    }

    /// Mark the task stopped after its pod disappeared.
    pub async fn handle_pod_gone(&self, task_arn: &str, reason: &str) -> Result<(), EcsError> {
        let cluster_arn = cluster_name_from_arn(task_arn)
            .map(|name| self.ctx.identifiers.cluster_arn(name))
            .unwrap_or_default();
        let Some(task) = self
            .ctx
            .store
            .get_task(&cluster_arn, task_arn)
            .await
            .map_err(EcsError::from)?
        else {
            return Ok(());
        };
        if task.is_stopped() {
            return Ok(());
        }
        let mut stopped = task;
        stopped.desired_status = TaskDesiredStatus::Stopped;
        stopped.last_status = TaskLastStatus::Stopped;
        let now = Utc::now();
        stopped.stopped_at.get_or_insert(now);
        stopped.execution_stopped_at.get_or_insert(now);
        if stopped.stopped_reason.is_none() {
            stopped.stopped_reason = Some(reason.to_string());
        }
        self.ctx.port_allocator.release(&stopped.task_arn);
        self.ctx.batch_updater.submit_task_update(stopped);
        Ok(())
    }

    /// Single-pod watcher: a field-selector watch on the pod's name.
    /// Returns once the pod reaches `Succeeded` or `Failed`, or when the
    /// stream ends (the caller may reopen), or on stop.
    pub async fn watch_pod(
        &self,
        namespace: &str,
        pod_name: &str,
        task_arn: &str,
        stopper: Stopper,
    ) -> Result<(), EcsError> {
        trace!("watch_pod - enter {}/{}", namespace, pod_name);
        let pods = IntoApi::<Pod>::namespaced(self.ctx.client.as_ref(), namespace);
        let config = Config::default().fields(&format!("{}={}", OBJECT_NAME_FIELD, pod_name));
        let mut stream = pods.watch(config);
        loop {
            let event = tokio::select! {
                event = stream.try_next() => event,
                _ = stopper.stopped() => {
                    trace!("watch_pod - stopping for {}", pod_name);
                    return Ok(());
                }
            };
            match event {
                Ok(Some(Event::Applied(pod))) => {
                    let phase = pod
                        .status
                        .as_ref()
                        .and_then(|s| s.phase.clone())
                        .unwrap_or_else(|| "Unknown".to_string());
                    self.update_task_status(task_arn, &pod).await?;
                    if phase == "Succeeded" || phase == "Failed" {
                        trace!("watch_pod - {} reached {}", pod_name, phase);
                        return Ok(());
                    }
                }
                Ok(Some(Event::Deleted(pod))) => {
                    self.update_task_status(task_arn, &pod).await?;
                    self.handle_pod_gone(task_arn, "Task stopped").await?;
                    return Ok(());
                }
                Ok(Some(Event::Restarted(pods))) => {
                    for pod in pods {
                        self.update_task_status(task_arn, &pod).await?;
                    }
                }
                Ok(None) => {
                    trace!("watch_pod - stream for {} ended", pod_name);
                    return Ok(());
                }
                Err(e) => {
                    error!("watch_pod - watch error for {}: {}", pod_name, e);
                    return Err(EcsError::Transient(e.to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch_updater::{BatchConfig, BatchUpdater};
    use crate::convert::task_definition::task_definition_to_pod_spec;
    use crate::util::mock_client::MockControlPlaneKubeClient;
    use kecs_shared::ecs::arn::Identifiers;
    use kecs_shared::ecs::task::{Connectivity, HealthStatus, LaunchType};
    use kecs_shared::ecs::task_definition::*;
    use kecs_shared::k8s::api::MockApi;
    use kecs_shared::store::MockDataStore;
    use k8s_openapi::api::core::v1::{Namespace, PodStatus};

    fn conversion() -> PodConversion {
        let definition = TaskDefinition {
            task_definition_arn: "arn:aws:ecs:us-east-1:000000000000:task-definition/web:1"
                .to_string(),
            family: "web".to_string(),
            revision: 1,
            status: TaskDefinitionStatus::Active,
            container_definitions: vec![ContainerDefinition {
                name: "web".to_string(),
                image: "nginx:1.25".to_string(),
                ..Default::default()
            }],
            network_mode: NetworkMode::Bridge,
            cpu: None,
            memory: None,
            volumes: vec![],
            placement_constraints: vec![],
            requires_compatibilities: vec![],
            tags: vec![],
            registered_at: Utc::now(),
            deregistered_at: None,
            version: 1,
        };
        task_definition_to_pod_spec(&definition).unwrap()
    }

    fn pending_task() -> Task {
        Task {
            task_arn: "arn:aws:ecs:us-east-1:000000000000:task/production/ab12cd34ab12cd34"
                .to_string(),
            cluster_arn: "arn:aws:ecs:us-east-1:000000000000:cluster/production".to_string(),
            task_definition_arn: "arn:aws:ecs:us-east-1:000000000000:task-definition/web:1"
                .to_string(),
            desired_status: TaskDesiredStatus::Running,
            last_status: TaskLastStatus::Pending,
            launch_type: LaunchType::Fargate,
            containers: vec![],
            containers_json: None,
            attachments: vec![],
            started_by: None,
            group: Some("family:web".to_string()),
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
            container_instance_arn: None,
            pod_name: Some("web-ab12cd34".to_string()),
            namespace: Some("production-us-east-1".to_string()),
            version: 1,
        }
    }

    fn manager_with(client: MockControlPlaneKubeClient, store: MockDataStore) -> TaskManager {
        let store: Arc<dyn kecs_shared::store::DataStore> = Arc::new(store);
        let updater = BatchUpdater::new(store.clone(), BatchConfig::default());
        let ctx = Arc::new(ControlPlaneContext::new(
            Arc::new(client),
            store,
            Identifiers::default(),
            updater,
        ));
        TaskManager::new(ctx)
    }

    fn existing_namespace_api() -> MockApi<Namespace> {
        let mut namespaces = MockApi::new();
        namespaces.expect_get().returning(|name| {
            Ok(Some(Namespace {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            }))
        });
        namespaces
    }

    #[tokio::test]
    async fn test_create_task_persists_after_pod_create() {
        let mut client = MockControlPlaneKubeClient::default();
        client
            .namespace
            .expect_all()
            .return_once(|| Box::new(existing_namespace_api()));
        client.pod.expect_namespaced().return_once(|_| {
            let mut pods = MockApi::new();
            pods.expect_create()
                .times(1)
                .withf(|pod: &Pod| {
                    pod.metadata.name.as_deref() == Some("web-ab12cd34")
                        && pod
                            .metadata
                            .labels
                            .as_ref()
                            .map(|l| l.contains_key("kecs.dev/task-id"))
                            .unwrap_or(false)
                })
                .returning(|pod| Ok(pod.clone()));
            Box::new(pods)
        });
        let mut store = MockDataStore::new();
        store.expect_create_task().times(1).returning(|_| Ok(()));

        let manager = manager_with(client, store);
        let task = manager
            .create_task(&conversion(), pending_task())
            .await
            .unwrap();
        assert_eq!(TaskLastStatus::Pending, task.last_status);
        assert_eq!(Connectivity::Connected, task.connectivity);
    }

    #[tokio::test]
    async fn test_create_task_rolls_back_pod_on_persist_failure() {
        let mut client = MockControlPlaneKubeClient::default();
        client
            .namespace
            .expect_all()
            .return_once(|| Box::new(existing_namespace_api()));
        client.pod.expect_namespaced().return_once(|_| {
            let mut pods = MockApi::new();
            pods.expect_create().times(1).returning(|pod: &Pod| Ok(pod.clone()));
            pods.expect_delete()
                .times(1)
                .withf(|name| name == "web-ab12cd34")
                .returning(|_| Ok(()));
            Box::new(pods)
        });
        let mut store = MockDataStore::new();
        store.expect_create_task().times(1).returning(|task| {
            Err(kecs_shared::store::StoreError::Duplicate(
                task.task_arn.clone(),
            ))
        });

        let manager = manager_with(client, store);
        let result = manager.create_task(&conversion(), pending_task()).await;
        assert!(matches!(result, Err(EcsError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_create_task_materializes_secrets() {
        let mut definition_conversion = conversion();
        definition_conversion.secrets = vec![crate::convert::task_definition::SecretMaterialization {
            object_name: "kecs-secret-db-pass".to_string(),
            value_from: "arn:aws:secretsmanager:us-east-1:000000000000:secret:db-pass".to_string(),
        }];
        let mut client = MockControlPlaneKubeClient::default();
        client
            .namespace
            .expect_all()
            .return_once(|| Box::new(existing_namespace_api()));
        client.secret.expect_namespaced().return_once(|_| {
            let mut secrets = MockApi::new();
            secrets
                .expect_apply()
                .times(1)
                .withf(|secret: &Secret, _| {
                    secret.metadata.name.as_deref() == Some("kecs-secret-db-pass")
                })
                .returning(|secret, _| Ok(secret));
            Box::new(secrets)
        });
        client.pod.expect_namespaced().return_once(|_| {
            let mut pods = MockApi::new();
            pods.expect_create().returning(|pod: &Pod| Ok(pod.clone()));
            Box::new(pods)
        });
        let mut store = MockDataStore::new();
        store.expect_create_task().returning(|_| Ok(()));

        let manager = manager_with(client, store);
        manager
            .create_task(&definition_conversion, pending_task())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_task_deletes_pod_and_sets_desired_stopped() {
        let mut client = MockControlPlaneKubeClient::default();
        client.pod.expect_namespaced().return_once(|_| {
            let mut pods = MockApi::new();
            pods.expect_delete().times(1).returning(|_| Ok(()));
            Box::new(pods)
        });
        let mut store = MockDataStore::new();
        store
            .expect_get_task()
            .returning(|_, _| Ok(Some(pending_task())));
        store
            .expect_update_task()
            .times(1)
            .withf(|task| {
                task.desired_status == TaskDesiredStatus::Stopped
                    && task.stopped_reason.as_deref() == Some("Task stopped by user")
                    && task.stop_code == Some(TaskStopCode::UserInitiated)
            })
            .returning(|task| {
                let mut updated = task.clone();
                updated.version += 1;
                Ok(updated)
            });

        let manager = manager_with(client, store);
        let stopped = manager
            .stop_task(
                "arn:aws:ecs:us-east-1:000000000000:cluster/production",
                "ab12cd34ab12cd34",
                "Task stopped by user",
                TaskStopCode::UserInitiated,
            )
            .await
            .unwrap();
        assert_eq!(2, stopped.version);
    }

    #[tokio::test]
    async fn test_stop_task_unknown_task_not_found() {
        let client = MockControlPlaneKubeClient::default();
        let mut store = MockDataStore::new();
        store.expect_get_task().returning(|_, _| Ok(None));
        let manager = manager_with(client, store);
        let result = manager
            .stop_task(
                "arn:aws:ecs:us-east-1:000000000000:cluster/production",
                "ffffffffffffffff",
                "Task stopped by user",
                TaskStopCode::UserInitiated,
            )
            .await;
        assert!(matches!(
            result,
            Err(EcsError::NotFound {
                kind: ResourceKind::Task,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_update_task_status_never_rewrites_stopped() {
        let client = MockControlPlaneKubeClient::default();
        let mut store = MockDataStore::new();
        store.expect_get_task().returning(|_, _| {
            let mut task = pending_task();
            task.last_status = TaskLastStatus::Stopped;
            task.stopped_at = Some(Utc::now());
            Ok(Some(task))
        });
        // no update_task expectation: a flush after the call must not
        // produce any store write
        let manager = manager_with(client, store);
        let pod = Pod {
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        manager
            .update_task_status(
                "arn:aws:ecs:us-east-1:000000000000:task/production/ab12cd34ab12cd34",
                &pod,
            )
            .await
            .unwrap();
        manager.ctx.batch_updater.flush_now().await;
    }

    #[tokio::test]
    async fn test_handle_pod_gone_leaves_stopped_task_untouched() {
        // a restart replays pod-gone for tasks that already stopped; the
        // record must keep its version and timestamps
        let client = MockControlPlaneKubeClient::default();
        let mut store = MockDataStore::new();
        store.expect_get_task().returning(|_, _| {
            let mut task = pending_task();
            task.last_status = TaskLastStatus::Stopped;
            task.stopped_at = Some(Utc::now());
            task.version = 4;
            Ok(Some(task))
        });
        // no update_task expectation: nothing may be written
        let manager = manager_with(client, store);
        manager
            .handle_pod_gone(
                "arn:aws:ecs:us-east-1:000000000000:task/production/ab12cd34ab12cd34",
                "Service pod terminated",
            )
            .await
            .unwrap();
        manager.ctx.batch_updater.flush_now().await;
    }

    #[tokio::test]
    async fn test_handle_pod_gone_stops_task_with_reason() {
        let client = MockControlPlaneKubeClient::default();
        let mut store = MockDataStore::new();
        store
            .expect_get_task()
            .returning(|_, _| Ok(Some(pending_task())));
        store
            .expect_update_task()
            .times(1)
            .withf(|task| {
                task.last_status == TaskLastStatus::Stopped
                    && task.stopped_reason.as_deref() == Some("Service pod terminated")
                    && task.stopped_at.is_some()
            })
            .returning(|task| Ok(task.clone()));
        let manager = manager_with(client, store);
        manager
            .handle_pod_gone(
                "arn:aws:ecs:us-east-1:000000000000:task/production/ab12cd34ab12cd34",
                "Service pod terminated",
            )
            .await
            .unwrap();
        manager.ctx.batch_updater.flush_now().await;
    }
}
