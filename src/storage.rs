//! Resolution of where a cluster's backups are written.
use crate::{
    apis::cluster_types::{BackendType, MiddlewareCluster, SYSTEM_OWNER},
    config::Config,
    store::ResourceStore,
    Error, Result,
};
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::ResourceExt;
use moka::future::Cache;
use std::sync::Arc;
use tracing::debug;

/// Maps an owner to the storage path published on their storage workload.
///
/// Lookups are cached per owner until the TTL expires.
pub struct StoragePathResolver {
    workloads: Arc<dyn ResourceStore<StatefulSet>>,
    cache: Cache<String, String>,
    system_namespace: String,
    user_namespace_prefix: String,
    workload_name: String,
    annotation: String,
}

impl StoragePathResolver {
    pub fn new(workloads: Arc<dyn ResourceStore<StatefulSet>>, config: &Config) -> Self {
        let cache = Cache::builder()
            .max_capacity(1000)
            .time_to_live(config.storage_cache_ttl)
            .build();
        Self {
            workloads,
            cache,
            system_namespace: config.system_storage_namespace.clone(),
            user_namespace_prefix: config.user_storage_namespace_prefix.clone(),
            workload_name: config.storage_workload_name.clone(),
            annotation: config.storage_path_annotation.clone(),
        }
    }

    fn storage_namespace(&self, owner: &str) -> String {
        if owner == SYSTEM_OWNER {
            self.system_namespace.clone()
        } else {
            format!("{}{}", self.user_namespace_prefix, owner)
        }
    }

    /// Storage root of `owner`
    pub async fn owner_path(&self, owner: &str) -> Result<String> {
        if let Some(path) = self.cache.get(owner).await {
            return Ok(path);
        }
        let namespace = self.storage_namespace(owner);
        let workload = self
            .workloads
            .get(&namespace, &self.workload_name)
            .await?
            .ok_or_else(|| Error::NotFound {
                kind: "StatefulSet".to_string(),
                namespace: namespace.clone(),
                name: self.workload_name.clone(),
            })?;
        let path = workload
            .annotations()
            .get(&self.annotation)
            .filter(|p| !p.is_empty())
            .cloned()
            .ok_or_else(|| {
                Error::ValidationError(format!(
                    "{}/{} has no {} annotation",
                    namespace, self.workload_name, self.annotation
                ))
            })?;
        debug!("Resolved storage path of owner {} to {}", owner, path);
        self.cache.insert(owner.to_string(), path.clone()).await;
        Ok(path)
    }

    /// Backup destination of a cluster.
    ///
    /// A path declared on the cluster wins; otherwise the owner's storage root
    /// is suffixed with `/<backend>-backup/<namespace>/<cluster>`.
    pub async fn destination(&self, cluster: &MiddlewareCluster) -> Result<String> {
        if let Some(path) = cluster.declared_backup_path() {
            return Ok(path.to_string());
        }
        let base = self.owner_path(cluster.owner()).await?;
        Ok(backend_subpath(
            &base,
            cluster.backend(),
            &cluster.namespace_or_default(),
            &cluster.name_any(),
        ))
    }
}

fn backend_subpath(base: &str, backend: BackendType, namespace: &str, cluster: &str) -> String {
    format!(
        "{}/{}-backup/{}/{}",
        base.trim_end_matches('/'),
        backend,
        namespace,
        cluster
    )
}
