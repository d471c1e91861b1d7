//! Deployment ownership for ECS services.
//!
//! The manager applies the Deployment (and optional Kubernetes Service)
//! derived from a service, registers every pod the deployment produces
//! as a task entity, and projects deployment replica counts back onto
//! the service record. On startup a catch-up pass re-derives task
//! entities from pods that already exist before live watches begin.

use crate::convert::pod_status::project_pod_onto_task;
use crate::convert::service::{service_to_deployment, service_to_kube_service};
use crate::ctx::ControlPlaneContext;
use crate::task_manager::TaskManager;
use crate::util::stopper::Stopper;
use crate::util::with_transient_retry;
use chrono::Utc;
use futures::TryStreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service as KubeService};
use kecs_shared::ecs::arn::{cluster_name_from_arn, task_id_from_pod_name};
use kecs_shared::ecs::error::EcsError;
use kecs_shared::ecs::service::{Service, ServiceStatus};
use kecs_shared::ecs::task::{
    Connectivity, HealthStatus, Task, TaskDesiredStatus, TaskLastStatus, TaskStopCode,
};
use kecs_shared::ecs::task_definition::TaskDefinition;
use kecs_shared::ecs::{
    APP_LABEL_ID, KECS_CLUSTER_LABEL_NAME, KECS_MANAGED_BY_LABEL_NAME, KECS_MANAGED_BY_LABEL_VALUE,
    KECS_SERVICE_LABEL_NAME, KECS_TASK_ID_LABEL_NAME,
};
use kecs_shared::k8s::api::IntoApi;
use kecs_shared::k8s::{ensure_namespace, FIELD_MANAGER};
use kecs_shared::store::{Pagination, StoreError, TaskFilter};
use kube::runtime::watcher::{Config, Event};
use kube::ResourceExt;
use log::{error, info, trace};
use std::sync::Arc;

/// Stop reason recorded when a scale-down removes a pod
pub const SCALED_DOWN_REASON: &str = "Service scaled down";
/// Stop reason recorded when a service is deleted
pub const SERVICE_DELETED_REASON: &str = "Service deleted";
/// Stop reason recorded when a service pod terminates outside a
/// scale-down
pub const POD_TERMINATED_REASON: &str = "Service pod terminated";

pub struct ServiceManager {
    ctx: Arc<ControlPlaneContext>,
    tasks: TaskManager,
}

impl ServiceManager {
    pub fn new(ctx: Arc<ControlPlaneContext>) -> Self {
        let tasks = TaskManager::new(ctx.clone());
        ServiceManager { ctx, tasks }
    }

    fn cluster_name_of(service: &Service) -> Result<String, EcsError> {
        cluster_name_from_arn(&service.cluster_arn)
            .map(str::to_string)
            .ok_or_else(|| EcsError::Internal(format!("bad cluster arn {}", service.cluster_arn)))
    }

    async fn apply_workload(
        &self,
        service: &Service,
        deployment: Deployment,
        kube_service: Option<KubeService>,
    ) -> Result<(), EcsError> {
        let namespaces = IntoApi::<k8s_openapi::api::core::v1::Namespace>::all(self.ctx.client.as_ref());
        with_transient_retry("ensure namespace", || {
            ensure_namespace(namespaces.as_ref(), &service.namespace)
        })
        .await?;

        let deployments =
            IntoApi::<Deployment>::namespaced(self.ctx.client.as_ref(), &service.namespace);
        with_transient_retry("apply deployment", || {
            deployments.apply(deployment.clone(), FIELD_MANAGER)
        })
        .await?;

        if let Some(kube_service) = kube_service {
            let services =
                IntoApi::<KubeService>::namespaced(self.ctx.client.as_ref(), &service.namespace);
            with_transient_retry("apply service", || {
                services.apply(kube_service.clone(), FIELD_MANAGER)
            })
            .await?;
        }
        Ok(())
    }

    /// Apply the Deployment and optional Service, then mark the ECS
    /// service ACTIVE in the store.
    pub async fn create_service(
        &self,
        service: &Service,
        definition: &TaskDefinition,
    ) -> Result<Service, EcsError> {
        let cluster_name = Self::cluster_name_of(service)?;
        let deployment = service_to_deployment(service, definition, &cluster_name)?;
        let kube_service = service_to_kube_service(service, definition, &cluster_name);
        self.apply_workload(service, deployment, kube_service).await?;

        let mut active = service.clone();
        active.status = ServiceStatus::Active;
        active.updated_at = Utc::now();
        let stored = self
            .ctx
            .store
            .update_service(&active)
            .await
            .map_err(EcsError::from)?;
        info!(
            "create_service - {} is ACTIVE in {}",
            service.service_name, service.namespace
        );
        Ok(stored)
    }

    /// Re-apply the deployment after a desired-count or task-definition
    /// change. Kubernetes deletes excess pods on scale-down; the pod
    /// watcher records those tasks as stopped.
    pub async fn update_service(
        &self,
        service: &Service,
        definition: &TaskDefinition,
    ) -> Result<(), EcsError> {
        let cluster_name = Self::cluster_name_of(service)?;
        let deployment = service_to_deployment(service, definition, &cluster_name)?;
        let kube_service = service_to_kube_service(service, definition, &cluster_name);
        self.apply_workload(service, deployment, kube_service).await?;
        info!(
            "update_service - re-applied {} (desired {})",
            service.service_name, service.desired_count
        );
        Ok(())
    }

    /// Delete the Deployment and Service, mark every owned task
    /// stopped, and set the ECS service INACTIVE.
    pub async fn delete_service(&self, service: &Service) -> Result<Service, EcsError> {
        let deployments =
            IntoApi::<Deployment>::namespaced(self.ctx.client.as_ref(), &service.namespace);
        with_transient_retry("delete deployment", || {
            deployments.delete(&service.deployment_name)
        })
        .await?;
        let services =
            IntoApi::<KubeService>::namespaced(self.ctx.client.as_ref(), &service.namespace);
        with_transient_retry("delete service", || services.delete(&service.deployment_name))
            .await?;

        self.stop_owned_tasks(service, SERVICE_DELETED_REASON).await?;

        let mut inactive = service.clone();
        inactive.status = ServiceStatus::Inactive;
        inactive.running_count = 0;
        inactive.pending_count = 0;
        inactive.updated_at = Utc::now();
        let stored = self
            .ctx
            .store
            .update_service(&inactive)
            .await
            .map_err(EcsError::from)?;
        info!("delete_service - {} is INACTIVE", service.service_name);
        Ok(stored)
    }

    async fn stop_owned_tasks(&self, service: &Service, reason: &str) -> Result<(), EcsError> {
        let mut filter = TaskFilter::for_cluster(&service.cluster_arn);
        filter.service_name = Some(service.service_name.clone());
        let mut page = Pagination::default();
        loop {
            let window = self
                .ctx
                .store
                .list_tasks(&filter, &page)
                .await
                .map_err(EcsError::from)?;
            for task in &window.items {
                if task.is_stopped() {
                    continue;
                }
                let mut stopped = task.clone();
                stopped.desired_status = TaskDesiredStatus::Stopped;
                stopped.last_status = TaskLastStatus::Stopped;
                let now = Utc::now();
                stopped.stopped_at.get_or_insert(now);
                stopped.execution_stopped_at.get_or_insert(now);
                stopped.stopped_reason = Some(reason.to_string());
                stopped.stop_code.get_or_insert(TaskStopCode::ServiceSchedulerInitiated);
                self.ctx.batch_updater.submit_task_update(stopped);
            }
            match window.next_token {
                Some(token) => page.next_token = Some(token),
                None => return Ok(()),
            }
        }
    }

    /// Derive the service status and counts from the backing
    /// deployment's replica counts.
    pub async fn get_service_status(
        &self,
        service: &Service,
    ) -> Result<(ServiceStatus, i32, i32), EcsError> {
        let deployments =
            IntoApi::<Deployment>::namespaced(self.ctx.client.as_ref(), &service.namespace);
        let deployment = with_transient_retry("get deployment", || {
            deployments.get(&service.deployment_name)
        })
        .await?;
        let Some(deployment) = deployment else {
            return Ok((ServiceStatus::Inactive, 0, 0));
        };
        let status = deployment.status.unwrap_or_default();
        let replicas = status.replicas.unwrap_or(0);
        let ready = status.ready_replicas.unwrap_or(0);
        let pending = (replicas - ready).max(0);
        let derived = if replicas == 0 && service.desired_count == 0 {
            ServiceStatus::Active
        } else if ready == 0 && replicas > 0 {
            ServiceStatus::Pending
        } else if ready < replicas {
            ServiceStatus::Updating
        } else {
            ServiceStatus::Active
        };
        Ok((derived, ready, pending))
    }

    fn task_id_for_pod(pod: &Pod) -> String {
        pod.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(KECS_TASK_ID_LABEL_NAME))
            .cloned()
            .unwrap_or_else(|| task_id_from_pod_name(&pod.name_any()))
    }

    /// Create or refresh the task entity backing a service pod. The
    /// race with a concurrent create resolves by falling through to the
    /// update path.
    pub async fn register_pod_as_task(
        &self,
        service: &Service,
        pod: &Pod,
    ) -> Result<(), EcsError> {
        let cluster_name = Self::cluster_name_of(service)?;
        let task_id = Self::task_id_for_pod(pod);
        let task_arn = self.ctx.identifiers.task_arn(&cluster_name, &task_id);

        let existing = self
            .ctx
            .store
            .get_task(&service.cluster_arn, &task_arn)
            .await
            .map_err(EcsError::from)?;
        if existing.is_some() {
            return self.tasks.update_task_status(&task_arn, pod).await;
        }

        let seed = Task {
            task_arn: task_arn.clone(),
            cluster_arn: service.cluster_arn.clone(),
            task_definition_arn: service.task_definition.clone(),
            desired_status: TaskDesiredStatus::Running,
            last_status: TaskLastStatus::Provisioning,
            launch_type: service.launch_type,
            containers: vec![],
            containers_json: None,
            attachments: vec![],
            started_by: Some(format!("ecs-svc/{}", service.service_name)),
            group: Some(format!("service:{}", service.service_name)),
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
            pod_name: Some(pod.name_any()),
            namespace: pod.metadata.namespace.clone(),
            version: 1,
        };
        let task = project_pod_onto_task(&seed, pod, Utc::now());
        match self.ctx.store.create_task(&task).await {
            Ok(()) => {
                trace!(
                    "register_pod_as_task - created task {} for pod {}",
                    task_arn,
                    pod.name_any()
                );
                Ok(())
            }
            Err(StoreError::Duplicate(_)) => {
                // another watcher won the create; fall through to update
                self.tasks.update_task_status(&task_arn, pod).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record a deleted service pod as a stopped task. Scale-downs are
    /// recognized by the service wanting fewer tasks than currently
    /// exist.
    pub async fn handle_pod_deletion(
        &self,
        service: &Service,
        pod_name: &str,
    ) -> Result<(), EcsError> {
        let cluster_name = Self::cluster_name_of(service)?;
        let task_id = task_id_from_pod_name(pod_name);
        let task_arn = self.ctx.identifiers.task_arn(&cluster_name, &task_id);

        let current = self
            .ctx
            .store
            .get_service(&service.cluster_arn, &service.service_name)
            .await
            .map_err(EcsError::from)?
            .unwrap_or_else(|| service.clone());

        let mut filter = TaskFilter::for_cluster(&service.cluster_arn);
        filter.service_name = Some(service.service_name.clone());
        let owned = self
            .ctx
            .store
            .list_tasks(&filter, &Pagination::default())
            .await
            .map_err(EcsError::from)?;
        let live = owned.items.iter().filter(|t| !t.is_stopped()).count() as i32;

        let reason = if current.status == ServiceStatus::Inactive {
            SERVICE_DELETED_REASON
        } else if live > current.desired_count {
            SCALED_DOWN_REASON
        } else {
            POD_TERMINATED_REASON
        };
        self.tasks.handle_pod_gone(&task_arn, reason).await
    }

    async fn refresh_service_counts(&self, service: &Service) {
        match self.get_service_status(service).await {
            Ok((status, running, pending)) => {
                let mut observed = service.clone();
                observed.status = status;
                observed.running_count = running;
                observed.pending_count = pending;
                observed.updated_at = Utc::now();
                self.ctx.batch_updater.submit_service_update(observed);
            }
            Err(e) => {
                error!(
                    "refresh_service_counts - {}: {}",
                    service.service_name, e
                );
            }
        }
    }

    /// Deployment pod watcher: label-selector watch on
    /// `app=<deploymentName>`.
    pub async fn watch_service_pods(
        &self,
        service: Service,
        stopper: Stopper,
    ) -> Result<(), EcsError> {
        trace!(
            "watch_service_pods - enter for {} in {}",
            service.service_name,
            service.namespace
        );
        let pods = IntoApi::<Pod>::namespaced(self.ctx.client.as_ref(), &service.namespace);
        let config = Config::default().labels(&format!(
            "{}={}",
            APP_LABEL_ID, service.deployment_name
        ));
        let mut stream = pods.watch(config);
        loop {
            let event = tokio::select! {
                event = stream.try_next() => event,
                _ = stopper.stopped() => {
                    trace!("watch_service_pods - stopping for {}", service.service_name);
                    return Ok(());
                }
            };
            match event {
                Ok(Some(Event::Applied(pod))) => {
                    self.register_pod_as_task(&service, &pod).await?;
                    self.refresh_service_counts(&service).await;
                }
                Ok(Some(Event::Deleted(pod))) => {
                    self.handle_pod_deletion(&service, &pod.name_any()).await?;
                    self.refresh_service_counts(&service).await;
                }
                Ok(Some(Event::Restarted(pods))) => {
                    for pod in pods {
                        self.register_pod_as_task(&service, &pod).await?;
                    }
                    self.refresh_service_counts(&service).await;
                }
                Ok(None) => {
                    trace!(
                        "watch_service_pods - stream ended for {}",
                        service.service_name
                    );
                    return Ok(());
                }
                Err(e) => {
                    error!(
                        "watch_service_pods - watch error for {}: {}",
                        service.service_name, e
                    );
                    return Err(EcsError::Transient(e.to_string()));
                }
            }
        }
    }

    /// One-shot startup scan: find KECS-labelled pods that are already
    /// running and register them as tasks before any live watch starts.
    pub async fn catch_up(&self) -> Result<usize, EcsError> {
        let pods = IntoApi::<Pod>::all(self.ctx.client.as_ref());
        let selector = format!(
            "{}={}",
            KECS_MANAGED_BY_LABEL_NAME, KECS_MANAGED_BY_LABEL_VALUE
        );
        let list = with_transient_retry("list pods", || pods.list(Some(selector.clone()))).await?;
        let mut registered = 0;
        for pod in list.items {
            let Some(labels) = pod.metadata.labels.as_ref() else {
                continue;
            };
            let (Some(cluster_name), Some(service_name)) = (
                labels.get(KECS_CLUSTER_LABEL_NAME),
                labels.get(KECS_SERVICE_LABEL_NAME),
            ) else {
                // RunTask pods have their own watcher; only service pods
                // are re-derived here
                continue;
            };
            let cluster_arn = self.ctx.identifiers.cluster_arn(cluster_name);
            let service = match self
                .ctx
                .store
                .get_service(&cluster_arn, service_name)
                .await
            {
                Ok(Some(service)) => service,
                Ok(None) => {
                    trace!(
                        "catch_up - pod {} references unknown service {}",
                        pod.name_any(),
                        service_name
                    );
                    continue;
                }
                Err(e) => {
                    error!("catch_up - reading service {}: {}", service_name, e);
                    continue;
                }
            };
            if let Err(e) = self.register_pod_as_task(&service, &pod).await {
                error!("catch_up - registering pod {}: {}", pod.name_any(), e);
                continue;
            }
            registered += 1;
        }
        info!("catch_up - registered {} existing pod(s)", registered);
        Ok(registered)
    }
}
