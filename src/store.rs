//! Access to the cluster's declarative resource store.
//!
//! Everything the engine reads or writes goes through [`ResourceStore`] so the
//! orchestration logic can be exercised against an in-memory store in tests.
use crate::{
    apis::trigger_types::{Backup, Restore, TriggerKind},
    Error, Result,
};
use async_trait::async_trait;
use futures::{future, stream::BoxStream, StreamExt};
#[cfg(test)]
use mockall::automock;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{
        Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams, WatchEvent,
        WatchParams,
    },
    client::Client,
    Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt::Debug, marker::PhantomData};
use tracing::{debug, warn};

pub const FIELD_MANAGER: &str = "cntrlr";

/// Which objects a list call should return
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListScope {
    /// None lists across all namespaces
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
}

impl ListScope {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn namespaced(namespace: &str) -> Self {
        Self {
            namespace: Some(namespace.to_string()),
            label_selector: None,
        }
    }

    pub fn labels(mut self, selector: &str) -> Self {
        self.label_selector = Some(selector.to_string());
        self
    }
}

/// Typed list/get/create/patch/delete against the resource store.
///
/// Errors follow the crate taxonomy: a missing object on write is
/// [`Error::NotFound`], a stale resourceVersion is [`Error::Conflict`], a
/// create over a live object is [`Error::AlreadyExists`] and anything else
/// from the transport is [`Error::KubeError`].
#[async_trait]
pub trait ResourceStore<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    async fn list(&self, scope: &ListScope) -> Result<Vec<K>>;

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    async fn create(&self, namespace: &str, obj: &K) -> Result<K>;

    /// JSON merge patch of the main resource
    async fn patch(&self, namespace: &str, name: &str, patch: &serde_json::Value) -> Result<K>;

    /// JSON merge patch of the status subresource
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// [`ResourceStore`] backed by the Kubernetes API
pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K> {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
{
    fn api(&self, namespace: Option<&str>) -> Api<K> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

fn patch_params() -> PatchParams {
    PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..PatchParams::default()
    }
}

/// Translate API status codes into the crate's error taxonomy
pub(crate) fn map_kube_error<K: Resource<DynamicType = ()>>(
    err: kube::Error,
    namespace: &str,
    name: &str,
) -> Error {
    match &err {
        kube::Error::Api(resp) if resp.code == 404 => Error::NotFound {
            kind: K::kind(&()).to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            Error::AlreadyExists {
                kind: K::kind(&()).to_string(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(resp) if resp.code == 409 => {
            Error::Conflict(format!("{} {namespace}/{name}: {}", K::kind(&()), resp.message))
        }
        _ => Error::KubeError(err),
    }
}

#[async_trait]
impl<K> ResourceStore<K> for KubeStore<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    async fn list(&self, scope: &ListScope) -> Result<Vec<K>> {
        let mut lp = ListParams::default();
        if let Some(selector) = &scope.label_selector {
            lp = lp.labels(selector);
        }
        let list = self.api(scope.namespace.as_deref()).list(&lp).await?;
        Ok(list.items)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.api(Some(namespace)).get_opt(name).await?)
    }

    async fn create(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = obj.meta().name.clone().unwrap_or_default();
        debug!("Creating {} {}/{}", K::kind(&()), namespace, name);
        self.api(Some(namespace))
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| map_kube_error::<K>(e, namespace, &name))
    }

    async fn patch(&self, namespace: &str, name: &str, patch: &serde_json::Value) -> Result<K> {
        self.api(Some(namespace))
            .patch(name, &patch_params(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_kube_error::<K>(e, namespace, name))
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K> {
        self.api(Some(namespace))
            .patch_status(name, &patch_params(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_kube_error::<K>(e, namespace, name))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        debug!("Deleting {} {}/{}", K::kind(&()), namespace, name);
        self.api(Some(namespace))
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_kube_error::<K>(e, namespace, name))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
    Bookmark,
    Error,
}

/// One untyped event from a watch stream
#[derive(Clone, Debug)]
pub struct StoreEvent {
    pub kind: EventKind,
    pub object: serde_json::Value,
}

impl From<WatchEvent<DynamicObject>> for StoreEvent {
    fn from(event: WatchEvent<DynamicObject>) -> Self {
        let (kind, object) = match event {
            WatchEvent::Added(obj) => (EventKind::Added, serde_json::to_value(obj)),
            WatchEvent::Modified(obj) => (EventKind::Modified, serde_json::to_value(obj)),
            WatchEvent::Deleted(obj) => (EventKind::Deleted, serde_json::to_value(obj)),
            WatchEvent::Bookmark(bm) => (EventKind::Bookmark, serde_json::to_value(bm)),
            WatchEvent::Error(err) => (EventKind::Error, serde_json::to_value(err)),
        };
        Self {
            kind,
            object: object.unwrap_or_default(),
        }
    }
}

/// Opens event subscriptions for trigger resources.
///
/// The returned stream ends when the underlying watch is closed; callers are
/// expected to subscribe again.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn subscribe(&self, kind: TriggerKind) -> Result<BoxStream<'static, StoreEvent>>;
}

/// [`EventSource`] using raw watches on the Kubernetes API
pub struct KubeEventSource {
    client: Client,
}

impl KubeEventSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventSource for KubeEventSource {
    async fn subscribe(&self, kind: TriggerKind) -> Result<BoxStream<'static, StoreEvent>> {
        let resource = match kind {
            TriggerKind::Backup => ApiResource::erase::<Backup>(&()),
            TriggerKind::Restore => ApiResource::erase::<Restore>(&()),
        };
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        let stream = api.watch(&WatchParams::default(), "0").await?;
        // a transport error terminates the subscription
        let events = stream
            .take_while(move |item| {
                if let Err(e) = item {
                    warn!("{} watch stream failed: {}", kind, e);
                }
                future::ready(item.is_ok())
            })
            .filter_map(|item| future::ready(item.ok().map(StoreEvent::from)));
        Ok(events.boxed())
    }
}
