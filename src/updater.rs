//! Read-mutate-write with optimistic concurrency.
//!
//! Every write carries the resourceVersion it was computed from; when the
//! store rejects it as stale the whole cycle is repeated against a fresh read.
use crate::{retry::RetryConfig, store::ResourceStore, Error, Result};
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicUsize, Ordering},
};
use tokio_retry::RetryIf;
use tracing::{debug, warn};

/// Apply `mutate` to the current status of `namespace/name` and write it back.
///
/// Exactly one write succeeds per call. Fails with [`Error::NotFound`] if the
/// object is gone and [`Error::ConflictExhausted`] once the retry budget is
/// spent.
pub async fn update_status<K, F>(
    store: &dyn ResourceStore<K>,
    namespace: &str,
    name: &str,
    retry: &RetryConfig,
    mutate: F,
) -> Result<K>
where
    K: Resource<DynamicType = ()> + Serialize + Clone + Send + Sync + 'static,
    F: Fn(&mut K) -> Result<()>,
{
    update_status_if(store, namespace, name, retry, |k: &mut K| mutate(k).map(|()| true))
        .await?
        .ok_or_else(|| Error::NotFound {
            kind: K::kind(&()).to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
}

/// Like [`update_status`], but `mutate` may decline by returning `false`.
///
/// The decision is taken against the freshly read object on every attempt;
/// a declined update writes nothing and returns `None`.
pub async fn update_status_if<K, F>(
    store: &dyn ResourceStore<K>,
    namespace: &str,
    name: &str,
    retry: &RetryConfig,
    mutate: F,
) -> Result<Option<K>>
where
    K: Resource<DynamicType = ()> + Serialize + Clone + Send + Sync + 'static,
    F: Fn(&mut K) -> Result<bool>,
{
    read_modify_write(store, namespace, name, retry, |current| {
        let mut desired = current.clone();
        if !mutate(&mut desired)? {
            return Ok(None);
        }
        let value = serde_json::to_value(&desired)?;
        Ok(Some(json!({
            "metadata": { "resourceVersion": current.resource_version() },
            "status": value.get("status").cloned().unwrap_or(Value::Null),
        })))
    }, Target::Status)
    .await
}

/// Apply `mutate` to the annotations of `namespace/name` and write them back
pub async fn update_annotations<K, F>(
    store: &dyn ResourceStore<K>,
    namespace: &str,
    name: &str,
    retry: &RetryConfig,
    mutate: F,
) -> Result<K>
where
    K: Resource<DynamicType = ()> + Serialize + Clone + Send + Sync + 'static,
    F: Fn(&mut BTreeMap<String, String>),
{
    read_modify_write(store, namespace, name, retry, |current| {
        let mut annotations = current.annotations().clone();
        mutate(&mut annotations);
        Ok(Some(json!({
            "metadata": {
                "resourceVersion": current.resource_version(),
                "annotations": annotations,
            }
        })))
    }, Target::Main)
    .await?
    .ok_or_else(|| Error::NotFound {
        kind: K::kind(&()).to_string(),
        namespace: namespace.to_string(),
        name: name.to_string(),
    })
}

#[derive(Clone, Copy)]
enum Target {
    Main,
    Status,
}

async fn read_modify_write<K, P>(
    store: &dyn ResourceStore<K>,
    namespace: &str,
    name: &str,
    retry: &RetryConfig,
    build_patch: P,
    target: Target,
) -> Result<Option<K>>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
    P: Fn(&K) -> Result<Option<Value>>,
{
    let attempts = AtomicUsize::new(0);
    let (counter, build_patch) = (&attempts, &build_patch);
    let attempt = move || async move {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        let current = store
            .get(namespace, name)
            .await?
            .ok_or_else(|| Error::NotFound {
                kind: K::kind(&()).to_string(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;
        let Some(patch) = build_patch(&current)? else {
            debug!("Update of {}/{} declined", namespace, name);
            return Ok(None);
        };
        let res = match target {
            Target::Main => store.patch(namespace, name, &patch).await,
            Target::Status => store.patch_status(namespace, name, &patch).await,
        };
        if let Err(e) = &res {
            if e.is_conflict() {
                warn!("Conflict updating {}/{} (attempt {}): {}", namespace, name, n, e);
            }
        }
        res.map(Some)
    };

    match RetryIf::spawn(retry.strategy(), attempt, |e: &Error| e.is_conflict()).await {
        Ok(updated) => {
            debug!(
                "Updated {} {}/{} after {} attempt(s)",
                K::kind(&()),
                namespace,
                name,
                attempts.load(Ordering::SeqCst)
            );
            Ok(updated)
        }
        Err(e) if e.is_conflict() => Err(Error::ConflictExhausted {
            name: format!("{namespace}/{name}"),
            attempts: attempts.load(Ordering::SeqCst),
        }),
        Err(e) => Err(e),
    }
}
