//! Test double assembling the aggregate kube client from per-resource
//! mocks. Tests set expectations on the resource they exercise; the
//! remaining fields panic on use, which keeps unexpected Kubernetes
//! traffic visible.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Pod, Secret, Service};
use kecs_shared::k8s::api::{Api, IntoApi, MockIntoApi};

#[derive(Default)]
pub struct MockControlPlaneKubeClient {
    pub namespace: MockIntoApi<Namespace>,
    pub deployment: MockIntoApi<Deployment>,
    pub pod: MockIntoApi<Pod>,
    pub service: MockIntoApi<Service>,
    pub secret: MockIntoApi<Secret>,
}

macro_rules! delegate_into_api {
    ($field:ident, $resource:ty) => {
        impl IntoApi<$resource> for MockControlPlaneKubeClient {
            fn all(&self) -> Box<dyn Api<$resource>> {
                self.$field.all()
            }

            fn namespaced(&self, namespace: &str) -> Box<dyn Api<$resource>>
            where
                $resource: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
            {
                self.$field.namespaced(namespace)
            }
        }
    };
}

// `Namespace` is cluster-scoped, so it can never satisfy the
// `Scope = NamespaceResourceScope` bound that `namespaced` requires;
// callers only ever reach it through `all()`.
macro_rules! delegate_into_api_cluster_scoped {
    ($field:ident, $resource:ty) => {
        impl IntoApi<$resource> for MockControlPlaneKubeClient {
            fn all(&self) -> Box<dyn Api<$resource>> {
                self.$field.all()
            }

            fn namespaced(&self, _namespace: &str) -> Box<dyn Api<$resource>> {
                unreachable!(concat!(stringify!($resource), " is cluster-scoped"))
            }
        }
    };
}

delegate_into_api_cluster_scoped!(namespace, Namespace);
delegate_into_api!(deployment, Deployment);
delegate_into_api!(pod, Pod);
delegate_into_api!(service, Service);
delegate_into_api!(secret, Secret);
