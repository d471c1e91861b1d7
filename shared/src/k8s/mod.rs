use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Pod, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use log::trace;
use std::collections::BTreeMap;
use std::path::Path;

pub mod api;

use crate::ecs::{KECS_MANAGED_BY_LABEL_NAME, KECS_MANAGED_BY_LABEL_VALUE};
use api::{Api, IntoApi};

pub const ERROR_NOT_FOUND: u16 = 404;
pub const ERROR_CONFLICT: u16 = 409;
/// Field selector key for watching a single object by name
pub const OBJECT_NAME_FIELD: &str = "metadata.name";
/// Field manager recorded on server-side applies
pub const FIELD_MANAGER: &str = "kecs-controlplane";

pub fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == ERROR_NOT_FOUND)
}

pub fn is_already_exists(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == ERROR_CONFLICT || ae.reason == "AlreadyExists")
}

pub fn is_conflict(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == ERROR_CONFLICT)
}

/// The resources the control plane drives. A bare `kube::Client`
/// satisfies this (the generic [`IntoApi`] blanket impl covers any
/// resource); tests assemble it from per-resource mocks.
pub trait ControlPlaneKubeClient:
    IntoApi<Namespace> + IntoApi<Deployment> + IntoApi<Pod> + IntoApi<Service> + IntoApi<Secret>
{
}

impl<
        T: IntoApi<Namespace>
            + IntoApi<Deployment>
            + IntoApi<Pod>
            + IntoApi<Service>
            + IntoApi<Secret>,
    > ControlPlaneKubeClient for T
{
}

/// Connect using the ambient configuration (in-cluster service account
/// or `KUBECONFIG`).
pub async fn default_client() -> anyhow::Result<Client> {
    Ok(Client::try_default().await?)
}

/// Connect using an explicit kubeconfig file, as written by the cluster
/// lifecycle manager.
pub async fn client_from_kubeconfig(path: &Path) -> anyhow::Result<Client> {
    trace!("client_from_kubeconfig - loading {}", path.display());
    let kubeconfig = Kubeconfig::read_from(path)?;
    let config =
        kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
    Ok(Client::try_from(config)?)
}

/// Labels stamped on every object this control plane creates.
pub fn managed_labels() -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        KECS_MANAGED_BY_LABEL_NAME.to_string(),
        KECS_MANAGED_BY_LABEL_VALUE.to_string(),
    );
    labels
}

/// True when the object carries the managed-by label. Pods not labelled
/// for KECS are ignored by every watcher.
pub fn is_kecs_managed(labels: Option<&BTreeMap<String, String>>) -> bool {
    labels
        .and_then(|l| l.get(KECS_MANAGED_BY_LABEL_NAME))
        .map(|v| v == KECS_MANAGED_BY_LABEL_VALUE)
        .unwrap_or(false)
}

/// Create the namespace if it does not already exist.
pub async fn ensure_namespace(api: &dyn Api<Namespace>, name: &str) -> Result<(), kube::Error> {
    if api.get(name).await?.is_some() {
        return Ok(());
    }
    let namespace = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        ..Default::default()
    };
    match api.create(&namespace).await {
        Ok(_) => {
            trace!("ensure_namespace - created namespace {}", name);
            Ok(())
        }
        Err(e) if is_already_exists(&e) => Ok(()),
        Err(e) => Err(e),
    }
}
