//! TaskDefinition → PodSpec / Pod manifest conversion.

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, CSIVolumeSource, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    HostPathVolumeSource, Pod, PodSpec, SecretKeySelector, Volume as KubeVolume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kecs_shared::ecs::error::EcsError;
use kecs_shared::ecs::task_definition::{ContainerDefinition, NetworkMode, TaskDefinition, Volume};
use kecs_shared::ecs::{
    KECS_CLUSTER_LABEL_NAME, KECS_NETWORK_CONFIG_ANNOTATION_NAME, KECS_TASK_ID_LABEL_NAME,
};
use kecs_shared::k8s::managed_labels;
use std::collections::BTreeMap;

/// Key under which secret material is stored in the synthesized
/// Kubernetes Secret objects
pub const SECRET_VALUE_KEY: &str = "value";
/// Annotation naming the container whose exit ends the task
pub const ESSENTIAL_CONTAINER_ANNOTATION: &str = "kecs.dev/essential-container";

/// A Kubernetes Secret the task manager must materialize before the pod
/// can start.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretMaterialization {
    /// Name of the Kubernetes Secret object
    pub object_name: String,
    /// Upstream reference (`valueFrom`) the material comes from
    pub value_from: String,
}

/// Result of converting a task definition: the pod spec plus everything
/// the caller needs to wrap it into a Pod.
#[derive(Clone, Debug)]
pub struct PodConversion {
    pub pod_spec: PodSpec,
    /// First essential container; its termination carries pod-failure
    /// semantics
    pub essential_container: String,
    pub network_mode: NetworkMode,
    pub secrets: Vec<SecretMaterialization>,
}

/// Kubernetes object name for the Secret backing a `valueFrom`
/// reference. The reference's last path/colon segment is sanitized into
/// a DNS-1123 label.
pub fn secret_object_name(value_from: &str) -> String {
    let tail = value_from
        .rsplit(|c| c == '/' || c == ':')
        .next()
        .unwrap_or(value_from);
    let sanitized: String = tail
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    format!("kecs-secret-{}", sanitized.trim_matches('-'))
}

fn cpu_quantity(units: i64) -> Quantity {
    Quantity(format!("{}m", units))
}

fn memory_quantity(mib: i64) -> Quantity {
    Quantity(format!("{}Mi", mib))
}

/// Per-container resource limits: explicit container values win, task
/// level values are divided evenly across containers otherwise.
fn container_resources(
    container: &ContainerDefinition,
    definition: &TaskDefinition,
    container_count: i64,
) -> BTreeMap<String, Quantity> {
    let mut limits = BTreeMap::new();
    let task_cpu = definition.cpu.as_deref().and_then(|c| c.parse::<i64>().ok());
    let task_memory = definition
        .memory
        .as_deref()
        .and_then(|m| m.parse::<i64>().ok());
    if let Some(cpu) = container.cpu.filter(|c| *c > 0).or_else(|| {
        task_cpu.map(|c| (c / container_count).max(1))
    }) {
        limits.insert("cpu".to_string(), cpu_quantity(cpu));
    }
    if let Some(memory) = container
        .memory
        .filter(|m| *m > 0)
        .or_else(|| task_memory.map(|m| (m / container_count).max(1)))
    {
        limits.insert("memory".to_string(), memory_quantity(memory));
    }
    limits
}

fn container_env(container: &ContainerDefinition) -> Option<Vec<EnvVar>> {
    let mut env: Vec<EnvVar> = container
        .environment
        .iter()
        .filter_map(|pair| {
            pair.name.as_ref().map(|name| EnvVar {
                name: name.clone(),
                value: pair.value.clone(),
                ..Default::default()
            })
        })
        .collect();
    for secret in &container.secrets {
        env.push(EnvVar {
            name: secret.name.clone(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: Some(secret_object_name(&secret.value_from)),
                    key: SECRET_VALUE_KEY.to_string(),
                    optional: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    if env.is_empty() {
        None
    } else {
        Some(env)
    }
}

fn container_ports(container: &ContainerDefinition) -> Option<Vec<ContainerPort>> {
    let ports: Vec<ContainerPort> = container
        .port_mappings
        .iter()
        .filter_map(|mapping| {
            mapping.container_port.map(|port| ContainerPort {
                container_port: port,
                protocol: Some(
                    mapping
                        .protocol
                        .clone()
                        .unwrap_or_else(|| "tcp".to_string())
                        .to_ascii_uppercase(),
                ),
                ..Default::default()
            })
        })
        .collect();
    if ports.is_empty() {
        None
    } else {
        Some(ports)
    }
}

fn container_mounts(container: &ContainerDefinition) -> Option<Vec<VolumeMount>> {
    let mounts: Vec<VolumeMount> = container
        .mount_points
        .iter()
        .filter_map(|mount| {
            match (&mount.source_volume, &mount.container_path) {
                (Some(volume), Some(path)) => Some(VolumeMount {
                    name: volume.clone(),
                    mount_path: path.clone(),
                    read_only: mount.read_only,
                    ..Default::default()
                }),
                _ => None,
            }
        })
        .collect();
    if mounts.is_empty() {
        None
    } else {
        Some(mounts)
    }
}

/// Translate a task-level volume per kind: host path, Docker named
/// volume as an emptyDir with a size hint, EFS through the external CSI
/// driver.
fn kube_volume(volume: &Volume) -> KubeVolume {
    if let Some(host) = &volume.host {
        return KubeVolume {
            name: volume.name.clone(),
            host_path: Some(HostPathVolumeSource {
                path: host.source_path.clone().unwrap_or_else(|| "/".to_string()),
                type_: None,
            }),
            ..Default::default()
        };
    }
    if let Some(efs) = &volume.efs_volume_configuration {
        return KubeVolume {
            name: volume.name.clone(),
            csi: Some(CSIVolumeSource {
                driver: "efs.csi.aws.com".to_string(),
                volume_attributes: Some(
                    [(
                        "fileSystemId".to_string(),
                        efs.file_system_id.clone(),
                    )]
                    .into_iter()
                    .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        };
    }
    let size_hint = volume
        .docker_volume_configuration
        .as_ref()
        .and_then(|docker| docker.size_hint.clone());
    KubeVolume {
        name: volume.name.clone(),
        empty_dir: Some(EmptyDirVolumeSource {
            medium: None,
            size_limit: size_hint.map(Quantity),
        }),
        ..Default::default()
    }
}

/// TaskDefinition → PodSpec. One Kubernetes container per ECS container
/// definition, in declared order.
pub fn task_definition_to_pod_spec(definition: &TaskDefinition) -> Result<PodConversion, EcsError> {
    if definition.container_definitions.is_empty() {
        return Err(EcsError::Validation(
            "task definition has no container definitions".to_string(),
        ));
    }
    let essential_container = definition
        .container_definitions
        .iter()
        .find(|c| c.is_essential())
        .map(|c| c.name.clone())
        .ok_or_else(|| {
            EcsError::Validation("at least one container must be essential".to_string())
        })?;

    let container_count = definition.container_definitions.len() as i64;
    let containers: Vec<Container> = definition
        .container_definitions
        .iter()
        .map(|container| {
            let limits = container_resources(container, definition, container_count);
            Container {
                name: container.name.clone(),
                image: Some(container.image.clone()),
                command: (!container.entry_point.is_empty())
                    .then(|| container.entry_point.clone()),
                args: (!container.command.is_empty()).then(|| container.command.clone()),
                working_dir: container.working_directory.clone(),
                env: container_env(container),
                ports: container_ports(container),
                volume_mounts: container_mounts(container),
                resources: (!limits.is_empty()).then(|| {
                    k8s_openapi::api::core::v1::ResourceRequirements {
                        limits: Some(limits),
                        ..Default::default()
                    }
                }),
                ..Default::default()
            }
        })
        .collect();

    let volumes: Vec<KubeVolume> = definition.volumes.iter().map(kube_volume).collect();

    let mut secrets: Vec<SecretMaterialization> = Vec::new();
    for container in &definition.container_definitions {
        for secret in &container.secrets {
            let materialization = SecretMaterialization {
                object_name: secret_object_name(&secret.value_from),
                value_from: secret.value_from.clone(),
            };
            if !secrets.contains(&materialization) {
                secrets.push(materialization);
            }
        }
    }

    let pod_spec = PodSpec {
        containers,
        volumes: (!volumes.is_empty()).then_some(volumes),
        host_network: (definition.network_mode == NetworkMode::Host).then_some(true),
        ..Default::default()
    };

    Ok(PodConversion {
        pod_spec,
        essential_container,
        network_mode: definition.network_mode,
        secrets,
    })
}

/// Wrap a converted pod spec into the Pod manifest for a
/// RunTask-originated task.
pub fn build_task_pod(
    conversion: &PodConversion,
    pod_name: &str,
    namespace: &str,
    cluster_name: &str,
    task_id: &str,
) -> Pod {
    let mut labels = managed_labels();
    labels.insert(KECS_CLUSTER_LABEL_NAME.to_string(), cluster_name.to_string());
    labels.insert(KECS_TASK_ID_LABEL_NAME.to_string(), task_id.to_string());

    let mut annotations = BTreeMap::new();
    annotations.insert(
        ESSENTIAL_CONTAINER_ANNOTATION.to_string(),
        conversion.essential_container.clone(),
    );
    if conversion.network_mode == NetworkMode::Awsvpc {
        annotations.insert(
            KECS_NETWORK_CONFIG_ANNOTATION_NAME.to_string(),
            format!("{{\"networkMode\":\"{}\"}}", conversion.network_mode.as_str()),
        );
    }

    let mut pod_spec = conversion.pod_spec.clone();
    pod_spec.restart_policy = Some("Never".to_string());

    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(pod_spec),
        ..Default::default()
    }
}
