//! k3d-backed [`ClusterProvider`].
//!
//! Clusters are driven through the `k3d` CLI. Creation pre-maps the
//! task host-port range onto the server node's NodePort range so the
//! port allocator can hand out host ports without touching Docker
//! again. All k3d output is discarded; the control plane's own logs are
//! the source of truth.

use super::{ClusterInfo, ClusterProvider, CREATE_DEADLINE, READY_PROBE_INTERVAL};
use crate::util::config::{
    ControlPlaneConfig, HOST_PORT_RANGE_END, HOST_PORT_RANGE_START, NODE_PORT_BASE,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kecs_shared::ecs::error::EcsError;
use kecs_shared::k8s::client_from_kubeconfig;
use kube::api::ListParams;
use log::{info, trace};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

pub struct K3dProvider {
    container_mode: bool,
    kubeconfig_dir: PathBuf,
    host_gateway_address: String,
}

impl K3dProvider {
    pub fn new(config: &ControlPlaneConfig) -> Self {
        K3dProvider {
            container_mode: config.container_mode,
            kubeconfig_dir: config.kubeconfig_dir.clone(),
            host_gateway_address: config.host_gateway_address.clone(),
        }
    }

    /// Arguments for `k3d cluster create`: one server, no default
    /// kubeconfig merge, the pre-provisioned host-port window.
    fn create_args(name: &str) -> Vec<String> {
        let node_port_end = NODE_PORT_BASE + (HOST_PORT_RANGE_END - HOST_PORT_RANGE_START);
        vec![
            "cluster".to_string(),
            "create".to_string(),
            name.to_string(),
            "--servers".to_string(),
            "1".to_string(),
            "--wait".to_string(),
            "--timeout".to_string(),
            format!("{}s", CREATE_DEADLINE.as_secs()),
            "--kubeconfig-update-default=false".to_string(),
            "--kubeconfig-switch-context=false".to_string(),
            "--port".to_string(),
            format!(
                "{}-{}:{}-{}@server:0",
                HOST_PORT_RANGE_START, HOST_PORT_RANGE_END, NODE_PORT_BASE, node_port_end
            ),
        ]
    }

    /// Rewrite the loopback server address for use from inside a
    /// container.
    fn rewrite_for_container(kubeconfig: &str, host_gateway: &str) -> String {
        kubeconfig
            .replace("https://0.0.0.0", &format!("https://{}", host_gateway))
            .replace("https://127.0.0.1", &format!("https://{}", host_gateway))
            .replace("https://localhost", &format!("https://{}", host_gateway))
    }

    async fn run_k3d(args: &[String]) -> Result<(), EcsError> {
        trace!("run_k3d - k3d {}", args.join(" "));
        let status = Command::new("k3d")
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| EcsError::DependencyFailure(format!("spawning k3d: {}", e)))?;
        if !status.success() {
            return Err(EcsError::DependencyFailure(format!(
                "k3d {} exited with {}",
                args.first().map(String::as_str).unwrap_or(""),
                status
            )));
        }
        Ok(())
    }

    async fn capture_k3d(args: &[String]) -> Result<String, EcsError> {
        trace!("capture_k3d - k3d {}", args.join(" "));
        let output = Command::new("k3d")
            .args(args)
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|e| EcsError::DependencyFailure(format!("spawning k3d: {}", e)))?;
        if !output.status.success() {
            return Err(EcsError::DependencyFailure(format!(
                "k3d {} exited with {}",
                args.first().map(String::as_str).unwrap_or(""),
                output.status
            )));
        }
        String::from_utf8(output.stdout)
            .map_err(|e| EcsError::Internal(format!("k3d output was not UTF-8: {}", e)))
    }

    fn parse_cluster_list(json: &str, name: &str) -> Result<Option<ClusterInfo>, EcsError> {
        let clusters: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| EcsError::Internal(format!("parsing k3d cluster list: {}", e)))?;
        let Some(entries) = clusters.as_array() else {
            return Ok(None);
        };
        for entry in entries {
            if entry["name"].as_str() != Some(name) {
                continue;
            }
            let servers = entry["serversCount"].as_u64().unwrap_or(0) as u32;
            let servers_running = entry["serversRunning"].as_u64().unwrap_or(0) as u32;
            let agents = entry["agentsCount"].as_u64().unwrap_or(0) as u32;
            return Ok(Some(ClusterInfo {
                name: name.to_string(),
                running: servers > 0 && servers_running == servers,
                servers,
                agents,
            }));
        }
        Ok(None)
    }

    async fn materialize_kubeconfig(&self, name: &str) -> Result<(), EcsError> {
        let kubeconfig = Self::capture_k3d(&[
            "kubeconfig".to_string(),
            "get".to_string(),
            name.to_string(),
        ])
        .await?;
        let kubeconfig = if self.container_mode {
            Self::rewrite_for_container(&kubeconfig, &self.host_gateway_address)
        } else {
            kubeconfig
        };
        std::fs::create_dir_all(&self.kubeconfig_dir)
            .map_err(|e| EcsError::Internal(format!("creating kubeconfig dir: {}", e)))?;
        let path = self.kubeconfig_path(name);
        std::fs::write(&path, kubeconfig)
            .map_err(|e| EcsError::Internal(format!("writing kubeconfig: {}", e)))?;
        info!(
            "materialize_kubeconfig - wrote kubeconfig for {} to {}",
            name,
            path.display()
        );
        Ok(())
    }

    /// One `list nodes` probe against the cluster's API server.
    async fn probe_nodes(&self, name: &str) -> Result<bool, EcsError> {
        let path = self.kubeconfig_path(name);
        if !path.exists() {
            return Ok(false);
        }
        let client = match client_from_kubeconfig(&path).await {
            Ok(client) => client,
            Err(_) => return Ok(false),
        };
        let nodes: kube::Api<Node> = kube::Api::all(client);
        match nodes.list(&ListParams::default().limit(1)).await {
            Ok(list) => Ok(!list.items.is_empty()),
            Err(_) => Ok(false),
        }
    }
}

#[async_trait]
impl ClusterProvider for K3dProvider {
    async fn create_cluster(&self, name: &str) -> Result<(), EcsError> {
        if self.cluster_exists(name).await? {
            info!("create_cluster - {} already exists", name);
            return Ok(());
        }
        info!("create_cluster - provisioning {}", name);
        Self::run_k3d(&Self::create_args(name)).await?;
        self.materialize_kubeconfig(name).await?;
        self.wait_for_cluster_ready(name, CREATE_DEADLINE).await?;
        info!("create_cluster - {} is ready", name);
        Ok(())
    }

    async fn delete_cluster(&self, name: &str) -> Result<(), EcsError> {
        if !self.cluster_exists(name).await? {
            return Ok(());
        }
        info!("delete_cluster - tearing down {}", name);
        Self::run_k3d(&[
            "cluster".to_string(),
            "delete".to_string(),
            name.to_string(),
        ])
        .await?;
        let path = self.kubeconfig_path(name);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(EcsError::Internal(format!(
                    "removing kubeconfig {}: {}",
                    path.display(),
                    e
                )));
            }
        }
        Ok(())
    }

    async fn start_cluster(&self, name: &str) -> Result<(), EcsError> {
        match self.get_cluster_info(name).await? {
            None => Err(EcsError::DependencyFailure(format!(
                "cluster {} does not exist",
                name
            ))),
            Some(info) if info.running => Ok(()),
            Some(_) => {
                info!("start_cluster - starting {}", name);
                Self::run_k3d(&[
                    "cluster".to_string(),
                    "start".to_string(),
                    name.to_string(),
                ])
                .await
            }
        }
    }

    async fn stop_cluster(&self, name: &str) -> Result<(), EcsError> {
        match self.get_cluster_info(name).await? {
            None => Ok(()),
            Some(info) if !info.running => Ok(()),
            Some(_) => {
                info!("stop_cluster - stopping {}", name);
                Self::run_k3d(&[
                    "cluster".to_string(),
                    "stop".to_string(),
                    name.to_string(),
                ])
                .await
            }
        }
    }

    async fn cluster_exists(&self, name: &str) -> Result<bool, EcsError> {
        Ok(self.get_cluster_info(name).await?.is_some())
    }

    async fn get_cluster_info(&self, name: &str) -> Result<Option<ClusterInfo>, EcsError> {
        let json = Self::capture_k3d(&[
            "cluster".to_string(),
            "list".to_string(),
            "-o".to_string(),
            "json".to_string(),
        ])
        .await?;
        Self::parse_cluster_list(&json, name)
    }

    async fn wait_for_cluster_ready(&self, name: &str, timeout: Duration) -> Result<(), EcsError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.probe_nodes(name).await? {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EcsError::Transient(format!(
                    "cluster {} not ready within {:?}",
                    name, timeout
                )));
            }
            tokio::time::sleep(READY_PROBE_INTERVAL).await;
        }
    }

    fn kubeconfig_path(&self, name: &str) -> PathBuf {
        self.kubeconfig_dir.join(format!("{}.yaml", name))
    }
}
