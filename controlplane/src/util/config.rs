//! Control-plane configuration, read from the environment.
//!
//! Every knob is an env var; CLI flags in `main` override them.

use kecs_shared::os::env_var::{env_flag, env_or, EnvVarQuery};
use std::path::PathBuf;

/// Flag: the control plane itself runs inside a container
pub const CONTAINER_MODE_ENV_VAR: &str = "KECS_CONTAINER_MODE";
/// Directory kubeconfigs are written into
pub const KUBECONFIG_DIR_ENV_VAR: &str = "KECS_KUBECONFIG_DIR";
/// Address containers use to reach the host
pub const HOST_GATEWAY_ENV_VAR: &str = "KECS_HOST_GATEWAY_ADDRESS";
/// Flag: store pods as synthetic tasks without a real Kubernetes client
pub const TEST_MODE_ENV_VAR: &str = "KECS_TEST_MODE";
/// Gateway listen port
pub const GATEWAY_PORT_ENV_VAR: &str = "KECS_GATEWAY_PORT";
/// Optional AWS-compatible backend for non-ECS requests
pub const AWS_BACKEND_ENV_VAR: &str = "KECS_AWS_BACKEND_ENDPOINT";
/// Store database file
pub const STORE_PATH_ENV_VAR: &str = "KECS_STORE_PATH";

/// Default host-reachable address on Linux (the docker bridge gateway);
/// macOS and Windows resolve `host.docker.internal` instead.
pub const DEFAULT_LINUX_HOST_GATEWAY: &str = "172.17.0.1";
pub const DEFAULT_GATEWAY_PORT: u16 = 5373;

/// First host port handed out to tasks
pub const HOST_PORT_RANGE_START: u16 = 32000;
/// Last host port handed out to tasks
pub const HOST_PORT_RANGE_END: u16 = 32999;
/// NodePort the first host port maps onto
pub const NODE_PORT_BASE: u16 = 30000;

#[derive(Clone, Debug)]
pub struct ControlPlaneConfig {
    pub container_mode: bool,
    pub kubeconfig_dir: PathBuf,
    pub host_gateway_address: String,
    pub test_mode: bool,
    pub gateway_port: u16,
    pub aws_backend_endpoint: Option<String>,
    pub store_path: PathBuf,
}

impl ControlPlaneConfig {
    pub fn from_env(env: &dyn EnvVarQuery) -> Self {
        let default_host_gateway = if cfg!(target_os = "linux") {
            DEFAULT_LINUX_HOST_GATEWAY
        } else {
            "host.docker.internal"
        };
        let gateway_port = env
            .get_env_var(GATEWAY_PORT_ENV_VAR)
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(DEFAULT_GATEWAY_PORT);
        ControlPlaneConfig {
            container_mode: env_flag(env, CONTAINER_MODE_ENV_VAR),
            kubeconfig_dir: PathBuf::from(env_or(env, KUBECONFIG_DIR_ENV_VAR, "/var/lib/kecs/kubeconfigs")),
            host_gateway_address: env_or(env, HOST_GATEWAY_ENV_VAR, default_host_gateway),
            test_mode: env_flag(env, TEST_MODE_ENV_VAR),
            gateway_port,
            aws_backend_endpoint: env.get_env_var(AWS_BACKEND_ENV_VAR).ok(),
            store_path: PathBuf::from(env_or(env, STORE_PATH_ENV_VAR, "/var/lib/kecs/kecs.db")),
        }
    }
}
