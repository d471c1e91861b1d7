//! Service / TaskSet → Deployment (+ Kubernetes Service) conversion.

use super::task_definition::{task_definition_to_pod_spec, ESSENTIAL_CONTAINER_ANNOTATION};
use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{PodTemplateSpec, Service as KubeService, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kecs_shared::ecs::error::EcsError;
use kecs_shared::ecs::service::Service;
use kecs_shared::ecs::task_definition::TaskDefinition;
use kecs_shared::ecs::task_set::TaskSet;
use kecs_shared::ecs::{
    APP_LABEL_ID, KECS_CLUSTER_LABEL_NAME, KECS_SERVICE_LABEL_NAME, KECS_TASK_SET_LABEL_NAME,
    KECS_TASK_SET_PRIMARY_LABEL_NAME,
};
use kecs_shared::k8s::managed_labels;
use std::collections::BTreeMap;

/// Rolling update strategy derived from the ECS deployment
/// configuration: `maximumPercent` above 100 becomes maxSurge,
/// `100 - minimumHealthyPercent` becomes maxUnavailable.
fn rolling_update_strategy(service: &Service) -> Option<DeploymentStrategy> {
    let config = service.deployment_configuration.as_ref()?;
    let max_surge = config
        .maximum_percent
        .map(|max| IntOrString::String(format!("{}%", (max - 100).max(0))));
    let max_unavailable = config
        .minimum_healthy_percent
        .map(|min| IntOrString::String(format!("{}%", (100 - min).max(0))));
    if max_surge.is_none() && max_unavailable.is_none() {
        return None;
    }
    Some(DeploymentStrategy {
        type_: Some("RollingUpdate".to_string()),
        rolling_update: Some(RollingUpdateDeployment {
            max_surge,
            max_unavailable,
        }),
    })
}

fn workload_labels(service: &Service, cluster_name: &str) -> BTreeMap<String, String> {
    let mut labels = managed_labels();
    labels.insert(APP_LABEL_ID.to_string(), service.deployment_name.clone());
    labels.insert(KECS_CLUSTER_LABEL_NAME.to_string(), cluster_name.to_string());
    labels.insert(
        KECS_SERVICE_LABEL_NAME.to_string(),
        service.service_name.clone(),
    );
    labels
}

fn pod_template(
    definition: &TaskDefinition,
    labels: BTreeMap<String, String>,
) -> Result<PodTemplateSpec, EcsError> {
    let conversion = task_definition_to_pod_spec(definition)?;
    let mut annotations = BTreeMap::new();
    annotations.insert(
        ESSENTIAL_CONTAINER_ANNOTATION.to_string(),
        conversion.essential_container.clone(),
    );
    Ok(PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        }),
        spec: Some(conversion.pod_spec),
    })
}

/// Service → Deployment. Replicas follow the desired count; the
/// selector is `app=<deploymentName>` where the deployment name equals
/// the service name.
pub fn service_to_deployment(
    service: &Service,
    definition: &TaskDefinition,
    cluster_name: &str,
) -> Result<Deployment, EcsError> {
    let labels = workload_labels(service, cluster_name);
    let selector = BTreeMap::from([(APP_LABEL_ID.to_string(), service.deployment_name.clone())]);
    let template = pod_template(definition, labels.clone())?;
    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(service.deployment_name.clone()),
            namespace: Some(service.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(service.desired_count),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template,
            strategy: rolling_update_strategy(service),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Service → Kubernetes Service, synthesized only when the task
/// definition declares any container port. The port list is the union
/// of declared container ports.
pub fn service_to_kube_service(
    service: &Service,
    definition: &TaskDefinition,
    cluster_name: &str,
) -> Option<KubeService> {
    let ports = definition.declared_container_ports();
    if ports.is_empty() {
        return None;
    }
    let service_ports: Vec<ServicePort> = ports
        .into_iter()
        .map(|port| ServicePort {
            name: Some(format!("port-{}", port)),
            port,
            target_port: Some(IntOrString::Int(port)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect();
    Some(KubeService {
        metadata: ObjectMeta {
            name: Some(service.deployment_name.clone()),
            namespace: Some(service.namespace.clone()),
            labels: Some(workload_labels(service, cluster_name)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([(
                APP_LABEL_ID.to_string(),
                service.deployment_name.clone(),
            )])),
            ports: Some(service_ports),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// TaskSet → Deployment. Same machinery as the service deployment with
/// the TaskSet label dimension added; the primary TaskSet's pods carry
/// an extra marker label the service selector can target.
pub fn task_set_to_deployment(
    service: &Service,
    task_set: &TaskSet,
    definition: &TaskDefinition,
    cluster_name: &str,
) -> Result<Deployment, EcsError> {
    let deployment_name = format!("{}-{}", service.deployment_name, task_set.id);
    let mut labels = workload_labels(service, cluster_name);
    labels.insert(KECS_TASK_SET_LABEL_NAME.to_string(), task_set.id.clone());
    if task_set.primary {
        labels.insert(
            KECS_TASK_SET_PRIMARY_LABEL_NAME.to_string(),
            "true".to_string(),
        );
    }
    let selector = BTreeMap::from([
        (APP_LABEL_ID.to_string(), service.deployment_name.clone()),
        (KECS_TASK_SET_LABEL_NAME.to_string(), task_set.id.clone()),
    ]);
    let template = pod_template(definition, labels.clone())?;
    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(deployment_name),
            namespace: Some(service.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(task_set.computed_desired_count),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template,
            ..Default::default()
        }),
        ..Default::default()
    })
}
