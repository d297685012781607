//! Per-backend backup and restore workflows.
//!
//! Every backend follows the same shape: list its clusters, validate them,
//! resolve where the data goes, force-create one job per cluster and wait for
//! all of them. The backend files choose which of the shared steps apply.
pub mod document;
pub mod keyvalue;
pub mod keyvalue_cluster;
pub mod relational;

use crate::{
    apis::{
        cluster_types::{BackendType, MiddlewareCluster},
        job_types::{JobResource, JobState, MiddlewareBackup, MiddlewareRestore},
        trigger_types::{Backup, TriggerEvent},
    },
    completion::{backend_scope, wait_for_jobs},
    config::Config,
    poll::{poll_until, PollConfig},
    recreate::force_recreate,
    retry::RetryConfig,
    storage::StoragePathResolver,
    store::{KubeStore, ListScope, ResourceStore},
    workload::{KubeWorkloads, WorkloadControl},
    Error, Result,
};
use async_trait::async_trait;
use kube::{client::Client, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info};

#[async_trait]
pub trait BackupWorkflow: Send + Sync {
    fn backend(&self) -> BackendType;
    async fn backup(&self, run: &TriggerEvent) -> Result<()>;
}

#[async_trait]
pub trait RestoreWorkflow: Send + Sync {
    fn backend(&self) -> BackendType;
    async fn restore(&self, run: &TriggerEvent) -> Result<()>;
}

/// Everything a workflow or job reconciler touches
pub struct WorkflowContext {
    pub config: Config,
    pub retry: RetryConfig,
    pub clusters: Arc<dyn ResourceStore<MiddlewareCluster>>,
    pub backups: Arc<dyn ResourceStore<MiddlewareBackup>>,
    pub restores: Arc<dyn ResourceStore<MiddlewareRestore>>,
    pub backup_triggers: Arc<dyn ResourceStore<Backup>>,
    pub workloads: Arc<dyn WorkloadControl>,
    pub storage: StoragePathResolver,
}

impl WorkflowContext {
    pub fn new(client: Client, config: Config) -> Self {
        let storage = StoragePathResolver::new(Arc::new(KubeStore::new(client.clone())), &config);
        Self {
            retry: RetryConfig::with_retries(config.conflict_retries),
            clusters: Arc::new(KubeStore::new(client.clone())),
            backups: Arc::new(KubeStore::new(client.clone())),
            restores: Arc::new(KubeStore::new(client.clone())),
            backup_triggers: Arc::new(KubeStore::new(client.clone())),
            workloads: Arc::new(KubeWorkloads::new(client, &config.keyvalue_container)),
            storage,
            config,
        }
    }

    fn job_poll(&self) -> PollConfig {
        PollConfig::new(self.config.job_poll_interval, self.config.job_poll_timeout)
    }

    fn delete_poll(&self) -> PollConfig {
        PollConfig::every_second(self.config.delete_confirm_timeout)
    }

    fn workload_poll(&self) -> PollConfig {
        PollConfig::new(self.config.job_poll_interval, self.config.workload_wait_timeout)
    }

    /// Clusters of one backend across all namespaces
    pub async fn clusters_of(&self, backend: BackendType) -> Result<Vec<MiddlewareCluster>> {
        let clusters = self.clusters.list(&ListScope::all()).await?;
        Ok(clusters
            .into_iter()
            .filter(|c| c.backend() == backend)
            .collect())
    }
}

/// Which shared steps a backend takes
#[derive(Clone, Copy, Debug)]
pub struct BackendPolicy {
    pub backend: BackendType,
    /// Refuse to start unless every cluster reports Healthy
    pub requires_health: bool,
    /// Wait for a deleted predecessor job to disappear before creating
    pub confirm_delete: bool,
    /// Restore waits for cluster initialization and skips clusters whose
    /// restore is already running or done
    pub guarded_restore: bool,
}

pub fn job_name(cluster: &MiddlewareCluster, backend: BackendType, suffix: &str) -> String {
    format!("{}-{}-{}", cluster.name_any(), backend, suffix)
}

fn check_health(clusters: &[MiddlewareCluster]) -> Result<()> {
    match clusters.iter().find(|c| !c.is_healthy()) {
        Some(cluster) => Err(Error::HealthCheckError {
            namespace: cluster.namespace_or_default(),
            cluster: cluster.name_any(),
            health: cluster.health().to_string(),
        }),
        None => Ok(()),
    }
}

/// List, validate, create one backup job per cluster and wait for them
pub async fn run_backup(ctx: &WorkflowContext, policy: &BackendPolicy) -> Result<()> {
    let clusters = ctx.clusters_of(policy.backend).await?;
    if clusters.is_empty() {
        debug!("No {} clusters to back up", policy.backend);
        return Ok(());
    }
    if policy.requires_health {
        check_health(&clusters)?;
    }

    let mut jobs = Vec::with_capacity(clusters.len());
    for cluster in &clusters {
        let destination = ctx.storage.destination(cluster).await?;
        jobs.push(MiddlewareBackup::build(
            &job_name(cluster, policy.backend, "backup"),
            &cluster.namespace_or_default(),
            &cluster.name_any(),
            policy.backend,
            Some(destination),
        ));
    }

    let confirm = policy.confirm_delete.then(|| ctx.delete_poll());
    for job in jobs {
        force_recreate(ctx.backups.as_ref(), job, confirm.as_ref()).await?;
    }
    info!("Waiting for {} {} backup job(s)", clusters.len(), policy.backend);
    wait_for_jobs(ctx.backups.as_ref(), &backend_scope(policy.backend), &ctx.job_poll()).await
}

/// Wait for each cluster's workload, create one restore job per cluster and wait for them
pub async fn run_restore(ctx: &WorkflowContext, policy: &BackendPolicy) -> Result<()> {
    let clusters = ctx.clusters_of(policy.backend).await?;
    let mut created = 0;
    for cluster in &clusters {
        let namespace = cluster.namespace_or_default();
        let name = cluster.name_any();
        wait_for_workload(ctx, &namespace, &name).await?;

        let job_name = job_name(cluster, policy.backend, "restore");
        if policy.guarded_restore {
            wait_for_initialized(ctx, &namespace, &name).await?;
            if let Some(existing) = ctx.restores.get(&namespace, &job_name).await? {
                if matches!(existing.state(), JobState::Running | JobState::Ready) {
                    info!(
                        "Restore {}/{} already {}, skipping",
                        namespace,
                        job_name,
                        existing.state()
                    );
                    continue;
                }
            }
        }

        let source = ctx.storage.destination(cluster).await?;
        let job = MiddlewareRestore::build(&job_name, &namespace, &name, policy.backend, Some(source));
        let confirm = policy.confirm_delete.then(|| ctx.delete_poll());
        force_recreate(ctx.restores.as_ref(), job, confirm.as_ref()).await?;
        created += 1;
    }
    if created == 0 {
        return Ok(());
    }
    info!("Waiting for {} {} restore job(s)", created, policy.backend);
    wait_for_jobs(ctx.restores.as_ref(), &backend_scope(policy.backend), &ctx.job_poll()).await
}

async fn wait_for_workload(ctx: &WorkflowContext, namespace: &str, name: &str) -> Result<()> {
    let what = format!("workload {namespace}/{name}");
    poll_until(&what, &ctx.workload_poll(), || async {
        Ok(ctx.workloads.workload_exists(namespace, name).await?.then_some(()))
    })
    .await
}

async fn wait_for_initialized(ctx: &WorkflowContext, namespace: &str, name: &str) -> Result<()> {
    let what = format!("initialization of cluster {namespace}/{name}");
    poll_until(&what, &ctx.workload_poll(), || async {
        let cluster = ctx.clusters.get(namespace, name).await?;
        Ok(cluster.filter(|c| c.is_initialized()).map(|_| ()))
    })
    .await
}

/// The default set of backup workflows, one per backend
pub fn backup_workflows(ctx: &Arc<WorkflowContext>) -> Vec<Arc<dyn BackupWorkflow>> {
    vec![
        Arc::new(keyvalue::KeyValueWorkflow::new(ctx.clone())),
        Arc::new(keyvalue_cluster::KeyValueClusterWorkflow::new(ctx.clone())),
        Arc::new(relational::RelationalWorkflow::new(ctx.clone())),
        Arc::new(document::DocumentWorkflow::new(ctx.clone())),
    ]
}

/// The default set of restore workflows, one per backend
pub fn restore_workflows(ctx: &Arc<WorkflowContext>) -> Vec<Arc<dyn RestoreWorkflow>> {
    vec![
        Arc::new(keyvalue::KeyValueWorkflow::new(ctx.clone())),
        Arc::new(keyvalue_cluster::KeyValueClusterWorkflow::new(ctx.clone())),
        Arc::new(relational::RelationalWorkflow::new(ctx.clone())),
        Arc::new(document::DocumentWorkflow::new(ctx.clone())),
    ]
}
