//! Pod-level reconciliation queue.
//!
//! A shared informer over every KECS-labelled pod enqueues
//! namespace/name keys; a worker pool resolves each key against the
//! live pod and translates it into a task-state update. The queue
//! decouples event delivery from store writes and deduplicates keys
//! that are already waiting.

use crate::ctx::ControlPlaneContext;
use crate::service_manager::POD_TERMINATED_REASON;
use crate::task_manager::TaskManager;
use crate::util::stopper::Stopper;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use kecs_shared::ecs::arn::task_id_from_pod_name;
use kecs_shared::ecs::error::EcsError;
use kecs_shared::ecs::{
    KECS_CLUSTER_LABEL_NAME, KECS_MANAGED_BY_LABEL_NAME, KECS_MANAGED_BY_LABEL_VALUE,
    KECS_TASK_ID_LABEL_NAME,
};
use kecs_shared::k8s::api::IntoApi;
use kecs_shared::k8s::is_kecs_managed;
use kube::runtime::watcher::{Config, Event};
use kube::ResourceExt;
use log::{error, trace};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Base delay for the first requeue of a failing key
const REQUEUE_BASE_DELAY: Duration = Duration::from_secs(1);
/// Requeue backoff cap
const REQUEUE_MAX_DELAY: Duration = Duration::from_secs(300);
/// Default worker pool size; bounds concurrent store writes
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Work-queue key: one pod.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl PodKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        PodKey {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

/// Requeue delay for the `attempt`th consecutive failure, doubling from
/// one second and capped at five minutes.
pub fn requeue_delay(attempt: u32) -> Duration {
    let exp = REQUEUE_BASE_DELAY.saturating_mul(2u32.saturating_pow(attempt.min(16)));
    exp.min(REQUEUE_MAX_DELAY)
}

/// Cloneable handle for enqueueing keys.
#[derive(Clone)]
pub struct SyncQueue {
    tx: mpsc::UnboundedSender<PodKey>,
    queued: Arc<Mutex<HashSet<PodKey>>>,
}

impl SyncQueue {
    /// Enqueue unless the key is already waiting. Returns whether the
    /// key was accepted.
    pub fn enqueue(&self, key: PodKey) -> bool {
        let mut queued = self
            .queued
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !queued.insert(key.clone()) {
            return false;
        }
        drop(queued);
        if self.tx.send(key).is_err() {
            return false;
        }
        true
    }

    fn take(&self, key: &PodKey) {
        self.queued
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(key);
    }
}

pub struct SyncController {
    ctx: Arc<ControlPlaneContext>,
    tasks: TaskManager,
    queue: SyncQueue,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PodKey>>,
    attempts: Mutex<HashMap<PodKey, u32>>,
}

impl SyncController {
    pub fn new(ctx: Arc<ControlPlaneContext>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = SyncQueue {
            tx,
            queued: Arc::new(Mutex::new(HashSet::new())),
        };
        Arc::new(SyncController {
            tasks: TaskManager::new(ctx.clone()),
            ctx,
            queue,
            rx: tokio::sync::Mutex::new(rx),
            attempts: Mutex::new(HashMap::new()),
        })
    }

    pub fn queue(&self) -> SyncQueue {
        self.queue.clone()
    }

    /// Cluster name implied by a workload namespace
    /// (`<cluster>-<region>`).
    fn cluster_from_namespace(&self, namespace: &str) -> Option<String> {
        namespace
            .strip_suffix(&format!("-{}", self.ctx.identifiers.region()))
            .map(str::to_string)
    }

    /// Translate one key into a task-state update. A missing pod takes
    /// the deletion path against the implied task ARN.
    pub async fn process_key(&self, key: &PodKey) -> Result<(), EcsError> {
        trace!("process_key - {}/{}", key.namespace, key.name);
        let pods = IntoApi::<Pod>::namespaced(self.ctx.client.as_ref(), &key.namespace);
        let pod = crate::util::with_transient_retry("get pod", || pods.get(&key.name)).await?;
        match pod {
            Some(pod) => {
                if !is_kecs_managed(pod.metadata.labels.as_ref()) {
                    return Ok(());
                }
                let labels = pod.metadata.labels.as_ref();
                let cluster_name = labels
                    .and_then(|l| l.get(KECS_CLUSTER_LABEL_NAME).cloned())
                    .or_else(|| self.cluster_from_namespace(&key.namespace));
                let Some(cluster_name) = cluster_name else {
                    trace!("process_key - no cluster for pod {}", key.name);
                    return Ok(());
                };
                let task_id = labels
                    .and_then(|l| l.get(KECS_TASK_ID_LABEL_NAME).cloned())
                    .unwrap_or_else(|| task_id_from_pod_name(&pod.name_any()));
                let task_arn = self.ctx.identifiers.task_arn(&cluster_name, &task_id);
                self.tasks.update_task_status(&task_arn, &pod).await
            }
            None => {
                let Some(cluster_name) = self.cluster_from_namespace(&key.namespace) else {
                    return Ok(());
                };
                let task_id = task_id_from_pod_name(&key.name);
                let task_arn = self.ctx.identifiers.task_arn(&cluster_name, &task_id);
                self.tasks
                    .handle_pod_gone(&task_arn, POD_TERMINATED_REASON)
                    .await
            }
        }
    }

    async fn work(self: &Arc<Self>, key: PodKey) {
        self.queue.take(&key);
        match self.process_key(&key).await {
            Ok(()) => {
                self.attempts
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .remove(&key);
            }
            Err(e) => {
                let attempt = {
                    let mut attempts = self
                        .attempts
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    let counter = attempts.entry(key.clone()).or_insert(0);
                    let current = *counter;
                    *counter += 1;
                    current
                };
                let delay = requeue_delay(attempt);
                error!(
                    "work - {}/{} failed (attempt {}), requeueing in {:?}: {}",
                    key.namespace, key.name, attempt, delay, e
                );
                let controller = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    controller.queue.enqueue(key);
                });
            }
        }
    }

    /// Worker loop: dequeue keys until stopped. Run one task per
    /// desired worker.
    pub async fn run_worker(self: Arc<Self>, stopper: Stopper) {
        loop {
            let key = {
                let mut rx = self.rx.lock().await;
                tokio::select! {
                    key = rx.recv() => key,
                    _ = stopper.stopped() => return,
                }
            };
            match key {
                Some(key) => self.work(key).await,
                None => return,
            }
        }
    }

    /// Shared informer: watch every KECS-labelled pod and enqueue keys
    /// for add, modify and delete events.
    pub async fn run_informer(self: Arc<Self>, stopper: Stopper) -> Result<(), EcsError> {
        let pods = IntoApi::<Pod>::all(self.ctx.client.as_ref());
        let selector = format!(
            "{}={}",
            KECS_MANAGED_BY_LABEL_NAME, KECS_MANAGED_BY_LABEL_VALUE
        );
        let mut stream = pods.watch(Config::default().labels(&selector));
        loop {
            let event = tokio::select! {
                event = stream.try_next() => event,
                _ = stopper.stopped() => return Ok(()),
            };
            match event {
                Ok(Some(Event::Applied(pod))) | Ok(Some(Event::Deleted(pod))) => {
                    self.enqueue_pod(&pod);
                }
                Ok(Some(Event::Restarted(pods))) => {
                    for pod in pods {
                        self.enqueue_pod(&pod);
                    }
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    error!("run_informer - watch error: {}", e);
                    return Err(EcsError::Transient(e.to_string()));
                }
            }
        }
    }

    fn enqueue_pod(&self, pod: &Pod) {
        if let Some(namespace) = pod.metadata.namespace.as_deref() {
            self.queue.enqueue(PodKey::new(namespace, &pod.name_any()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch_updater::{BatchConfig, BatchUpdater};
    use crate::util::mock_client::MockControlPlaneKubeClient;
    use chrono::Utc;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kecs_shared::ecs::arn::Identifiers;
    use kecs_shared::ecs::task::*;
    use kecs_shared::k8s::api::MockApi;
    use kecs_shared::store::MockDataStore;
    use std::collections::BTreeMap;

    fn controller_with(
        client: MockControlPlaneKubeClient,
        store: MockDataStore,
    ) -> Arc<SyncController> {
        let store: Arc<dyn kecs_shared::store::DataStore> = Arc::new(store);
        let updater = BatchUpdater::new(store.clone(), BatchConfig::default());
        let ctx = Arc::new(ControlPlaneContext::new(
            Arc::new(client),
            store,
            Identifiers::default(),
            updater,
        ));
        SyncController::new(ctx)
    }

    fn stored_task(pod_name: &str) -> Task {
        let identifiers = Identifiers::default();
        let task_id = task_id_from_pod_name(pod_name);
        Task {
            task_arn: identifiers.task_arn("production", &task_id),
            cluster_arn: identifiers.cluster_arn("production"),
            task_definition_arn: identifiers.task_definition_arn("web", 1),
            desired_status: TaskDesiredStatus::Running,
            last_status: TaskLastStatus::Pending,
            launch_type: LaunchType::Fargate,
            containers: vec![],
            containers_json: None,
            attachments: vec![],
            started_by: Some("ecs-svc/web".to_string()),
            group: Some("service:web".to_string()),
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
            pod_name: Some(pod_name.to_string()),
            namespace: Some("production-us-east-1".to_string()),
            version: 1,
        }
    }

    fn managed_pod(name: &str, phase: &str) -> Pod {
        let mut labels = BTreeMap::new();
        labels.insert(
            KECS_MANAGED_BY_LABEL_NAME.to_string(),
            KECS_MANAGED_BY_LABEL_VALUE.to_string(),
        );
        labels.insert(KECS_CLUSTER_LABEL_NAME.to_string(), "production".to_string());
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("production-us-east-1".to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_requeue_delay_doubles_and_caps_at_five_minutes() {
        assert_eq!(Duration::from_secs(1), requeue_delay(0));
        assert_eq!(Duration::from_secs(2), requeue_delay(1));
        assert_eq!(Duration::from_secs(64), requeue_delay(6));
        assert_eq!(Duration::from_secs(300), requeue_delay(12));
        assert_eq!(Duration::from_secs(300), requeue_delay(31));
    }

    #[tokio::test]
    async fn test_enqueue_deduplicates_waiting_keys() {
        let controller = controller_with(
            MockControlPlaneKubeClient::default(),
            MockDataStore::new(),
        );
        let queue = controller.queue();
        assert!(queue.enqueue(PodKey::new("production-us-east-1", "web-a")));
        assert!(!queue.enqueue(PodKey::new("production-us-east-1", "web-a")));
        assert!(queue.enqueue(PodKey::new("production-us-east-1", "web-b")));
    }

    #[tokio::test]
    async fn test_process_key_updates_task_from_live_pod() {
        let mut client = MockControlPlaneKubeClient::default();
        client.pod.expect_namespaced().return_once(|_| {
            let mut pods = MockApi::new();
            pods.expect_get()
                .returning(|name| Ok(Some(managed_pod(name, "Running"))));
            Box::new(pods)
        });
        let mut store = MockDataStore::new();
        store
            .expect_get_task()
            .returning(|_, _| Ok(Some(stored_task("web-a"))));
        store
            .expect_update_task()
            .times(1)
            .withf(|task| task.last_status == TaskLastStatus::Running)
            .returning(|task| Ok(task.clone()));

        let controller = controller_with(client, store);
        controller
            .process_key(&PodKey::new("production-us-east-1", "web-a"))
            .await
            .unwrap();
        controller.ctx.batch_updater.flush_now().await;
    }

    #[tokio::test]
    async fn test_missing_pod_takes_deletion_path() {
        let mut client = MockControlPlaneKubeClient::default();
        client.pod.expect_namespaced().return_once(|_| {
            let mut pods = MockApi::new();
            pods.expect_get().returning(|_| Ok(None));
            Box::new(pods)
        });
        let mut store = MockDataStore::new();
        store
            .expect_get_task()
            .returning(|_, _| Ok(Some(stored_task("web-a"))));
        store
            .expect_update_task()
            .times(1)
            .withf(|task| {
                task.last_status == TaskLastStatus::Stopped
                    && task.stopped_reason.as_deref() == Some(POD_TERMINATED_REASON)
            })
            .returning(|task| Ok(task.clone()));

        let controller = controller_with(client, store);
        controller
            .process_key(&PodKey::new("production-us-east-1", "web-a"))
            .await
            .unwrap();
        controller.ctx.batch_updater.flush_now().await;
    }

    #[tokio::test]
    async fn test_unmanaged_pod_is_ignored() {
        let mut client = MockControlPlaneKubeClient::default();
        client.pod.expect_namespaced().return_once(|_| {
            let mut pods = MockApi::new();
            pods.expect_get().returning(|name| {
                let mut pod = managed_pod(name, "Running");
                pod.metadata.labels = None;
                Ok(Some(pod))
            });
            Box::new(pods)
        });
        // no store expectations: any access panics
        let controller = controller_with(client, MockDataStore::new());
        controller
            .process_key(&PodKey::new("production-us-east-1", "web-a"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_worker_drains_queue_and_stops() {
        let mut client = MockControlPlaneKubeClient::default();
        client.pod.expect_namespaced().returning(|_| {
            let mut pods = MockApi::new();
            pods.expect_get()
                .returning(|name| Ok(Some(managed_pod(name, "Running"))));
            Box::new(pods)
        });
        let mut store = MockDataStore::new();
        store
            .expect_get_task()
            .returning(|_, _| Ok(Some(stored_task("web-a"))));
        store
            .expect_update_task()
            .returning(|task| Ok(task.clone()));

        let controller = controller_with(client, store);
        let stopper = Stopper::new();
        let worker = tokio::spawn(controller.clone().run_worker(stopper.clone()));
        controller
            .queue()
            .enqueue(PodKey::new("production-us-east-1", "web-a"));
        tokio::time::sleep(Duration::from_millis(200)).await;
        stopper.stop();
        tokio::time::timeout(Duration::from_secs(2), worker)
            .await
            .unwrap()
            .unwrap();
        controller.ctx.batch_updater.flush_now().await;
    }
}
