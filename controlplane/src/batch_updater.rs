//! Coalescing writer between the watchers and the store.
//!
//! Watchers submit task and service snapshots at pod-event rate; the
//! updater keeps only the latest snapshot per ARN and flushes either
//! when a buffer reaches its size threshold or when the flush interval
//! elapses. Intermediate states may be collapsed; the store always
//! converges on the most recent observation.

use crate::util::stopper::Stopper;
use kecs_shared::ecs::service::Service;
use kecs_shared::ecs::task::Task;
use kecs_shared::store::{DataStore, StoreError};
use log::{error, trace};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Buffered writes per kind that force a flush
pub const DEFAULT_SIZE_THRESHOLD: usize = 50;
/// Flush interval
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct BatchConfig {
    pub size_threshold: usize,
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            size_threshold: DEFAULT_SIZE_THRESHOLD,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

pub struct BatchUpdater {
    store: Arc<dyn DataStore>,
    config: BatchConfig,
    pending_tasks: Mutex<HashMap<String, Task>>,
    pending_services: Mutex<HashMap<String, Service>>,
    flush_tx: mpsc::Sender<()>,
    flush_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl BatchUpdater {
    pub fn new(store: Arc<dyn DataStore>, config: BatchConfig) -> Arc<Self> {
        let (flush_tx, flush_rx) = mpsc::channel(1);
        Arc::new(BatchUpdater {
            store,
            config,
            pending_tasks: Mutex::new(HashMap::new()),
            pending_services: Mutex::new(HashMap::new()),
            flush_tx,
            flush_rx: tokio::sync::Mutex::new(flush_rx),
        })
    }

    /// Queue a task snapshot; the latest write per ARN wins.
    pub fn submit_task_update(&self, task: Task) {
        let pending = {
            let mut tasks = self
                .pending_tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            tasks.insert(task.task_arn.clone(), task);
            tasks.len()
        };
        if pending >= self.config.size_threshold {
            // a full channel already has a wakeup queued
            let _ = self.flush_tx.try_send(());
        }
    }

    /// Queue a service snapshot; the latest write per ARN wins.
    pub fn submit_service_update(&self, service: Service) {
        let pending = {
            let mut services = self
                .pending_services
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            services.insert(service.service_arn.clone(), service);
            services.len()
        };
        if pending >= self.config.size_threshold {
            let _ = self.flush_tx.try_send(());
        }
    }

    /// Drain both buffers into the store. Per-entity failures are
    /// logged; the flush continues past them.
    pub async fn flush_now(&self) {
        let tasks: Vec<Task> = {
            let mut pending = self
                .pending_tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            pending.drain().map(|(_, task)| task).collect()
        };
        let services: Vec<Service> = {
            let mut pending = self
                .pending_services
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            pending.drain().map(|(_, service)| service).collect()
        };
        if !tasks.is_empty() || !services.is_empty() {
            trace!(
                "flush_now - {} task(s), {} service(s)",
                tasks.len(),
                services.len()
            );
        }
        for task in tasks {
            self.write_task(task).await;
        }
        for service in services {
            self.write_service(service).await;
        }
    }

    async fn write_task(&self, task: Task) {
        let outcome = match self.store.update_task(&task).await {
            Ok(_) => "ok",
            Err(StoreError::NotFound(_)) => match self.store.create_task(&task).await {
                Ok(()) => "created",
                Err(e) => {
                    error!("write_task - create {} failed: {}", task.task_arn, e);
                    "error"
                }
            },
            Err(e) => {
                error!("write_task - update {} failed: {}", task.task_arn, e);
                "error"
            }
        };
        crate::STORE_WRITE_COUNT_METRIC
            .with_label_values(&["task", outcome])
            .inc();
    }

    /// Service writes merge into the stored record: only status, counts
    /// and updatedAt move here. Declarative fields belong to the
    /// handler path.
    async fn write_service(&self, observed: Service) {
        let current = match self
            .store
            .get_service(&observed.cluster_arn, &observed.service_name)
            .await
        {
            Ok(current) => current,
            Err(e) => {
                error!(
                    "write_service - read {} failed: {}",
                    observed.service_arn, e
                );
                return;
            }
        };
        let result = match current {
            Some(mut stored) => {
                stored.merge_observation(&observed);
                self.store.update_service(&stored).await.map(|_| ())
            }
            None => self.store.create_service(&observed).await,
        };
        let outcome = match &result {
            Ok(()) => "ok",
            Err(e) => {
                error!(
                    "write_service - write {} failed: {}",
                    observed.service_arn, e
                );
                "error"
            }
        };
        crate::STORE_WRITE_COUNT_METRIC
            .with_label_values(&["service", outcome])
            .inc();
    }

    /// Background flusher: wakes on the interval, on size-threshold
    /// signals, and once more to drain on stop.
    pub async fn run(self: Arc<Self>, stopper: Stopper) {
        trace!("run - batch updater started");
        let mut interval = tokio::time::interval(self.config.flush_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut flush_rx = self.flush_rx.lock().await;
        loop {
            tokio::select! {
                _ = interval.tick() => self.flush_now().await,
                _ = flush_rx.recv() => self.flush_now().await,
                _ = stopper.stopped() => {
                    self.flush_now().await;
                    trace!("run - batch updater drained and stopped");
                    return;
                }
            }
        }
    }
}
