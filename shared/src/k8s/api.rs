//! Generic, mockable facade over `kube::Api`.
//!
//! The control plane only ever goes through these traits; tests swap in
//! the generated mocks instead of a live cluster. Create is idempotent
//! toward AlreadyExists (callers fall through to apply), delete is
//! idempotent toward NotFound, and watches come back as a boxed event
//! stream with the default backoff already attached.

use std::fmt::Debug;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::ObjectList,
    runtime::{
        watcher,
        watcher::{default_backoff, Event},
        WatchStreamExt,
    },
    Error, Resource, ResourceExt,
};
use mockall::automock;
use serde::de::DeserializeOwned;

/// Event stream handed to watchers.
pub type WatchStream<T> = BoxStream<'static, Result<Event<T>, watcher::Error>>;

#[automock]
#[async_trait]
pub trait Api<T: Clone + Send + Sync + Resource + 'static>: Send + Sync {
    fn as_inner(&self) -> kube::Api<T>;

    /// Plain create; surfaces AlreadyExists so callers can resolve the
    /// race their own way (tasks fall through to a status update).
    async fn create(&self, obj: &T) -> Result<T, Error>;

    /// Server-side apply: create-or-update in one call.
    async fn apply(&self, obj: T, field_manager: &str) -> Result<T, Error>;

    async fn raw_patch(
        &self,
        name: &str,
        patch: &Patch<serde_json::Value>,
        pp: &PatchParams,
    ) -> Result<T, Error>;

    /// None when the object does not exist.
    async fn get(&self, name: &str) -> Result<Option<T>, Error>;

    async fn list(&self, label_selector: Option<String>) -> Result<ObjectList<T>, Error>;

    /// Delete, treating NotFound as success.
    async fn delete(&self, name: &str) -> Result<(), Error>;

    /// Lazy event stream for the given watch configuration.
    fn watch(&self, config: watcher::Config) -> WatchStream<T>;
}

#[async_trait]
impl<T> Api<T> for kube::Api<T>
where
    T: Clone
        + DeserializeOwned
        + Debug
        + Resource<DynamicType = ()>
        + serde::Serialize
        + Send
        + Sync
        + 'static,
{
    fn as_inner(&self) -> kube::Api<T> {
        self.to_owned()
    }

    async fn create(&self, obj: &T) -> Result<T, Error> {
        self.create(&PostParams::default(), obj).await
    }

    async fn apply(&self, obj: T, field_manager: &str) -> Result<T, Error> {
        let name = obj.name_any();
        let pp = PatchParams::apply(field_manager).force();
        self.patch(&name, &pp, &Patch::Apply(obj)).await
    }

    async fn raw_patch(
        &self,
        name: &str,
        patch: &Patch<serde_json::Value>,
        pp: &PatchParams,
    ) -> Result<T, Error> {
        self.patch(name, pp, patch).await
    }

    async fn get(&self, name: &str) -> Result<Option<T>, Error> {
        self.get_opt(name).await
    }

    async fn list(&self, label_selector: Option<String>) -> Result<ObjectList<T>, Error> {
        let lp = ListParams {
            label_selector,
            ..Default::default()
        };
        self.list(&lp).await
    }

    async fn delete(&self, name: &str) -> Result<(), Error> {
        match self.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if super::is_not_found(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn watch(&self, config: watcher::Config) -> WatchStream<T> {
        watcher(self.clone(), config)
            .backoff(default_backoff())
            .boxed()
    }
}

#[automock]
#[allow(clippy::multiple_bound_locations)]
pub trait IntoApi<T: Resource + 'static + Send + Sync>: Send + Sync {
    fn all(&self) -> Box<dyn Api<T>>;
    fn namespaced(&self, namespace: &str) -> Box<dyn Api<T>>
    where
        T: Resource<Scope = k8s_openapi::NamespaceResourceScope>;
}

impl<T> IntoApi<T> for kube::Client
where
    T: Resource<DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug
        + serde::Serialize
        + Send
        + Sync
        + 'static,
{
    fn all(&self) -> Box<dyn Api<T>> {
        Box::new(kube::Api::all(self.clone()))
    }

    fn namespaced(&self, namespace: &str) -> Box<dyn Api<T>>
    where
        T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    {
        Box::new(kube::Api::namespaced(self.clone(), namespace))
    }
}
