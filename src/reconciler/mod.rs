//! Per-job reconcilers for the key-value backend.
//!
//! Key-value backups are driven by the job resources themselves: the
//! controller watches `MiddlewareBackup` / `MiddlewareRestore` objects and
//! executes the snapshot or data swap on the node's host path.
pub mod backup;
pub mod restore;

use crate::{
    apis::{
        cluster_types::{BackendType, MiddlewareCluster},
        job_types::{object_key, JobResource, JobState},
    },
    controller::Context,
    store::ResourceStore,
    telemetry,
    updater::update_status,
    workflows::WorkflowContext,
    Error, Result,
};
use async_trait::async_trait;
use chrono::Utc;
use kube::{
    api::Api,
    runtime::{
        controller::Action,
        events::{Event, EventType},
        finalizer::{finalizer, Event as Finalizer},
    },
    Resource, ResourceExt,
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::time::Duration;
use tracing::*;

pub static JOB_FINALIZER: &str = "middlewarebackups.middleware.io";

/// Host paths of one key-value instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobPaths {
    /// Live data directory mounted by the instance
    pub data: PathBuf,
    /// Snapshot destination for backups, snapshot source for restores
    pub backup: PathBuf,
}

impl JobPaths {
    pub fn for_job<K: JobResource>(data_root: &str, job: &K) -> Self {
        let base = Path::new(data_root)
            .join(job.namespace().unwrap_or_default())
            .join(job.cluster_name());
        let backup = match job.backup_path() {
            Some(path) => PathBuf::from(path),
            None => base.join("backup"),
        };
        Self {
            data: base.join("data"),
            backup,
        }
    }
}

/// The backend procedure behind a key-value job
#[async_trait]
pub trait KeyValueJob: JobResource {
    fn store(ctx: &WorkflowContext) -> &dyn ResourceStore<Self>;

    /// Run the procedure; the returned path is recorded as `status.backupPath`
    async fn execute(&self, ctx: &WorkflowContext, paths: &JobPaths) -> Result<Option<String>>;
}

#[instrument(skip(job, ctx), fields(trace_id))]
pub async fn reconcile<K: KeyValueJob>(job: Arc<K>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", &field::display(&trace_id));
    ctx.diagnostics.write().await.last_event = Utc::now();
    let ns = job.namespace().ok_or_else(|| {
        Error::ValidationError(format!("{} {} has no namespace", K::kind_name(), job.name_any()))
    })?;
    let jobs: Api<K> = Api::namespaced(ctx.client.clone(), &ns);

    // jobs of other backends are not ours to finalize; a finalizer left on
    // one is still run so deletion can complete
    let ours = job.backend() == BackendType::KeyValue;
    if !ours && !job.finalizers().iter().any(|f| f == JOB_FINALIZER) {
        debug!("{} {}/{} is a {} job, ignoring", K::kind_name(), ns, job.name_any(), job.backend());
        return Ok(Action::await_change());
    }

    debug!("Reconciling {} \"{}\" in {}", K::kind_name(), job.name_any(), ns);
    finalizer(&jobs, JOB_FINALIZER, job, |event| async {
        match event {
            Finalizer::Apply(job) => apply(job.as_ref(), &ctx).await,
            Finalizer::Cleanup(job) => cleanup(job.as_ref(), &ctx).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

pub fn error_policy<K: KeyValueJob>(job: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.job_failure(&object_key(job.as_ref()), error);
    Action::requeue(Duration::from_secs(5 * 60))
}

/// Drive one job from New to a terminal state
pub async fn apply<K: KeyValueJob>(job: &K, ctx: &Context) -> Result<Action> {
    let shared = ctx.shared.as_ref();
    let store = K::store(shared);
    let ns = job.namespace().unwrap_or_default();
    let name = job.name_any();

    // the watch cache can lag behind our own status writes
    let Some(job) = store.get(&ns, &name).await? else {
        return Ok(Action::await_change());
    };
    if job.backend() != BackendType::KeyValue {
        return Ok(Action::await_change());
    }
    if job.state().is_terminal() {
        debug!("{} {}/{} already {}, ignoring", K::kind_name(), ns, name, job.state());
        return Ok(Action::await_change());
    }
    if job.cluster_name().is_empty() {
        fail::<K>(shared, &ns, &name, "clusterName is required".to_string()).await?;
        return Ok(Action::await_change());
    }

    let cluster_name = job.cluster_name().to_string();
    let cluster = match shared.clusters.get(&ns, &cluster_name).await? {
        Some(cluster) => cluster,
        None => {
            let message = format!("cluster {ns}/{cluster_name} not found");
            fail::<K>(shared, &ns, &name, message).await?;
            return Ok(Action::await_change());
        }
    };
    if cluster.backend() != BackendType::KeyValue {
        debug!(
            "{} {}/{} targets a {} cluster, ignoring",
            K::kind_name(),
            ns,
            name,
            cluster.backend()
        );
        return Ok(Action::await_change());
    }

    if job.state() == JobState::Running {
        warn!("{} {}/{} was interrupted", K::kind_name(), ns, name);
        fail::<K>(shared, &ns, &name, "interrupted before completion".to_string()).await?;
        return Ok(Action::await_change());
    }

    if shared.workloads.running_pods(&ns, &cluster_name).await? == 0 {
        if job.state() != JobState::Waiting {
            update_status(store, &ns, &name, &shared.retry, |j: &mut K| {
                j.job_status_mut().state = JobState::Waiting;
                Ok(())
            })
            .await?;
        }
        info!("{} has no running instance yet, requeuing", cluster_key(&cluster));
        return Ok(Action::requeue(Duration::from_secs(10)));
    }

    update_status(store, &ns, &name, &shared.retry, |j: &mut K| {
        let status = j.job_status_mut();
        status.state = JobState::Running;
        status.start_at = Some(Utc::now());
        status.error = None;
        Ok(())
    })
    .await?;

    let paths = JobPaths::for_job(&shared.config.data_root, &job);
    info!("Running {} {}/{} for {}", K::kind_name(), ns, name, cluster_key(&cluster));
    match job.execute(shared, &paths).await {
        Ok(backup_path) => {
            update_status(store, &ns, &name, &shared.retry, |j: &mut K| {
                let status = j.job_status_mut();
                status.state = JobState::Ready;
                status.completed_at = Some(Utc::now());
                status.backup_path = backup_path.clone();
                Ok(())
            })
            .await?;
            info!("{} {}/{} is Ready", K::kind_name(), ns, name);
        }
        Err(e) => {
            error!("{} {}/{} failed: {}", K::kind_name(), ns, name, e);
            ctx.metrics.job_failure(&format!("{ns}/{name}"), &e);
            fail::<K>(shared, &ns, &name, e.to_string()).await?;
        }
    }
    Ok(Action::await_change())
}

async fn fail<K: KeyValueJob>(ctx: &WorkflowContext, ns: &str, name: &str, message: String) -> Result<()> {
    update_status(K::store(ctx), ns, name, &ctx.retry, |j: &mut K| {
        let status = j.job_status_mut();
        status.state = JobState::Error;
        status.completed_at = Some(Utc::now());
        status.error = Some(message.clone());
        Ok(())
    })
    .await?;
    Ok(())
}

fn cluster_key(cluster: &MiddlewareCluster) -> String {
    format!("{}/{}", cluster.namespace_or_default(), cluster.name_any())
}

/// Finalizer cleanup: drop the on-disk artifact of a deleted job
#[instrument(skip(job, ctx))]
async fn cleanup<K: KeyValueJob>(job: &K, ctx: &Context) -> Result<Action> {
    if let Some(path) = job.job_status().and_then(|s| s.backup_path.as_deref()) {
        remove_artifact(Path::new(path)).await;
    }
    let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone());
    let event = Event {
        type_: EventType::Normal,
        reason: format!("Delete{}", K::kind_name()),
        note: Some(format!("Delete `{}`", job.name_any())),
        action: "Reconciling".into(),
        secondary: None,
    };
    if let Err(e) = recorder.publish(&event, &job.object_ref(&())).await {
        warn!("Failed to publish delete event for {}: {}", object_key(job), e);
    }
    Ok(Action::await_change())
}

/// Best-effort removal; failures are only logged
pub async fn remove_artifact(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => info!("Removed backup artifact {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("Backup artifact {} already gone", path.display())
        }
        Err(e) => warn!("Failed to remove backup artifact {}: {}", path.display(), e),
    }
}
