#[macro_use]
extern crate lazy_static;

mod api;
mod batch_updater;
mod cluster;
mod convert;
mod ctx;
mod gateway;
mod service_manager;
mod sync_controller;
mod task_manager;
mod util;

use api::Api;
use batch_updater::{BatchConfig, BatchUpdater};
use clap::Parser;
use cluster::k3d::K3dProvider;
use cluster::ClusterProvider;
use ctx::ControlPlaneContext;
use gateway::proxy::Gateway;
use kecs_shared::ecs::arn::{k8s_cluster_name, Identifiers};
use kecs_shared::ecs::metrics::run_metrics_server;
use kecs_shared::ecs::service::ServiceStatus;
use kecs_shared::k8s::ControlPlaneKubeClient;
use kecs_shared::os::env_var::ActualEnvVarQuery;
use kecs_shared::store::sqlite::SqliteDataStore;
use kecs_shared::store::{DataStore, Pagination};
use kecs_shared::ecs::SYSTEM_NAMESPACE;
use kecs_shared::k8s::api::IntoApi;
use kecs_shared::k8s::ensure_namespace;
use prometheus::IntCounterVec;
use service_manager::ServiceManager;
use std::sync::Arc;
use sync_controller::{SyncController, DEFAULT_WORKER_COUNT};
use util::config::ControlPlaneConfig;
use util::once::OnceLatch;
use util::stopper::Stopper;

lazy_static! {
    // Counts store writes performed by the batch updater, by entity
    // kind and outcome
    pub static ref STORE_WRITE_COUNT_METRIC: IntCounterVec = prometheus::register_int_counter_vec!(
        "kecs_store_writes_total",
        "KECS batched store writes",
        &["kind", "outcome"]
    )
    .unwrap();
}

/// Backing cluster the control plane itself connects to.
const DEFAULT_BACKING_CLUSTER: &str = "default";

/// Creates the control-plane namespace at most once per process.
static SYSTEM_NAMESPACE_LATCH: OnceLatch = OnceLatch::new();

/// ECS-compatible control plane backed by a local Kubernetes cluster.
/// Flags override the corresponding KECS_* environment variables.
#[derive(Parser, Debug)]
#[command(name = "controlplane")]
struct Args {
    /// The control plane itself runs inside a container
    #[arg(long)]
    container_mode: bool,
    /// Store pods as synthetic tasks without a real Kubernetes client
    #[arg(long)]
    test_mode: bool,
    /// Port the AWS-API gateway listens on
    #[arg(long)]
    gateway_port: Option<u16>,
    /// Directory kubeconfigs are written into
    #[arg(long)]
    kubeconfig_dir: Option<std::path::PathBuf>,
    /// Store database file
    #[arg(long)]
    store_path: Option<std::path::PathBuf>,
    /// Address containers use to reach the host
    #[arg(long)]
    host_gateway_address: Option<String>,
    /// AWS-compatible backend for non-ECS requests
    #[arg(long)]
    aws_backend_endpoint: Option<String>,
}

impl Args {
    fn apply(self, config: &mut ControlPlaneConfig) {
        if self.container_mode {
            config.container_mode = true;
        }
        if self.test_mode {
            config.test_mode = true;
        }
        if let Some(port) = self.gateway_port {
            config.gateway_port = port;
        }
        if let Some(dir) = self.kubeconfig_dir {
            config.kubeconfig_dir = dir;
        }
        if let Some(path) = self.store_path {
            config.store_path = path;
        }
        if let Some(address) = self.host_gateway_address {
            config.host_gateway_address = address;
        }
        if self.aws_backend_endpoint.is_some() {
            config.aws_backend_endpoint = self.aws_backend_endpoint;
        }
    }
}

async fn connect_kube_client(
    config: &ControlPlaneConfig,
    provider: &dyn ClusterProvider,
) -> anyhow::Result<kube::Client> {
    if config.test_mode {
        // never contacted in test mode; point it at a loopback endpoint
        let kube_config = kube::Config::new("http://127.0.0.1:8001".parse()?);
        return Ok(kube::Client::try_from(kube_config)?);
    }
    let backing = k8s_cluster_name(DEFAULT_BACKING_CLUSTER);
    provider.create_cluster(&backing).await.map_err(|e| {
        anyhow::anyhow!("provisioning backing cluster {}: {}", backing, e)
    })?;
    let kubeconfig = provider.kubeconfig_path(&backing);
    if kubeconfig.exists() {
        kecs_shared::k8s::client_from_kubeconfig(&kubeconfig).await
    } else {
        kecs_shared::k8s::default_client().await
    }
}

/// Restart pod watchers for services that were ACTIVE before the
/// control plane went down.
async fn restart_service_watchers(
    store: &dyn DataStore,
    services: &Arc<ServiceManager>,
    stopper: &Stopper,
) -> anyhow::Result<usize> {
    let mut restarted = 0;
    let clusters = store.list_clusters(&Pagination::default()).await?;
    for cluster in clusters.items {
        let mut page = Pagination::default();
        loop {
            let window = store
                .list_services(&cluster.cluster_arn, None, &page)
                .await?;
            for service in &window.items {
                if service.status == ServiceStatus::Inactive {
                    continue;
                }
                let manager = services.clone();
                let stopper = stopper.clone();
                let service = service.clone();
                restarted += 1;
                tokio::spawn(async move {
                    if let Err(e) = manager.watch_service_pods(service, stopper).await {
                        log::error!("restart_service_watchers - watcher exited: {}", e);
                    }
                });
            }
            match window.next_token {
                Some(token) => page.next_token = Some(token),
                None => break,
            }
        }
    }
    Ok(restarted)
}

/// This is the entry point for the control plane.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    env_logger::try_init()?;
    log::info!("kecs control plane starting");

    let env = ActualEnvVarQuery;
    let mut config = ControlPlaneConfig::from_env(&env);
    Args::parse().apply(&mut config);
    let config = config;
    let identifiers = Identifiers::from_env(&env);
    log::info!(
        "main - region {} account {} test_mode {}",
        identifiers.region(),
        identifiers.account_id(),
        config.test_mode
    );

    let store: Arc<dyn DataStore> = if config.test_mode {
        Arc::new(SqliteDataStore::open_in_memory(identifiers.clone())?)
    } else {
        Arc::new(SqliteDataStore::open(&config.store_path, identifiers.clone())?)
    };

    let provider: Arc<dyn ClusterProvider> = Arc::new(K3dProvider::new(&config));
    let kube_client = connect_kube_client(&config, provider.as_ref()).await?;
    let client: Arc<dyn ControlPlaneKubeClient> = Arc::new(kube_client);

    let stopper = Stopper::new();
    stopper.stop_on_sigterm();

    let batch_updater = BatchUpdater::new(store.clone(), BatchConfig::default());
    let ctx = Arc::new(ControlPlaneContext::new(
        client,
        store.clone(),
        identifiers,
        batch_updater.clone(),
    ));
    let api = Api::new(ctx.clone(), provider, config.clone(), stopper.clone());
    let sync = SyncController::new(ctx.clone());

    let mut tasks = Vec::new();

    // Prometheus metrics endpoint
    tasks.push(tokio::spawn(async move {
        if let Err(e) = run_metrics_server().await {
            log::error!("main - metrics server exited: {}", e);
        }
    }));

    // batched store writer
    tasks.push(tokio::spawn(
        batch_updater.clone().run(stopper.clone()),
    ));

    if !config.test_mode {
        let namespaces =
            IntoApi::<k8s_openapi::api::core::v1::Namespace>::all(ctx.client.as_ref());
        let outcome = SYSTEM_NAMESPACE_LATCH
            .ensure(|| async {
                ensure_namespace(namespaces.as_ref(), SYSTEM_NAMESPACE)
                    .await
                    .map_err(|e| e.to_string())
            })
            .await;
        if let Err(e) = outcome {
            log::error!("main - creating {} namespace failed: {}", SYSTEM_NAMESPACE, e);
        }

        // one-shot catch-up before any live watch
        match api.services.catch_up().await {
            Ok(count) => log::info!("main - catch-up registered {} pod(s)", count),
            Err(e) => log::error!("main - catch-up failed: {}", e),
        }
        match restart_service_watchers(store.as_ref(), &api.services, &stopper).await {
            Ok(count) => log::info!("main - restarted {} service watcher(s)", count),
            Err(e) => log::error!("main - restarting service watchers failed: {}", e),
        }

        for _ in 0..DEFAULT_WORKER_COUNT {
            tasks.push(tokio::spawn(sync.clone().run_worker(stopper.clone())));
        }
        let informer = sync.clone();
        let informer_stopper = stopper.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = informer.run_informer(informer_stopper).await {
                log::error!("main - informer exited: {}", e);
            }
        }));
    }

    // AWS-API gateway
    let gateway = Gateway::new(api.clone(), config.aws_backend_endpoint.clone());
    let gateway_port = config.gateway_port;
    let gateway_stopper = stopper.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = gateway.run(gateway_port, gateway_stopper).await {
            log::error!("main - gateway exited: {}", e);
        }
    }));

    futures::future::try_join_all(tasks).await?;
    log::info!("kecs control plane stopped");
    Ok(())
}
