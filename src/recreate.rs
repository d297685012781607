//! Ensure exactly one fresh job resource exists for a cluster and backend.
use crate::{
    apis::job_types::{JobResource, JobState, JobStatus},
    poll::{poll_until, PollConfig},
    store::ResourceStore,
    Error, Result,
};
use kube::ResourceExt;
use tracing::{debug, info};

/// Delete any idle predecessor of `desired` and create `desired` in state New.
///
/// A predecessor in state Running fails the call with [`Error::DuplicateJob`]
/// without touching the store. With `confirm_delete` set the predecessor's
/// removal is awaited before the create, which matters for jobs carrying a
/// finalizer.
pub async fn force_recreate<K: JobResource>(
    store: &dyn ResourceStore<K>,
    mut desired: K,
    confirm_delete: Option<&PollConfig>,
) -> Result<K> {
    let name = desired.name_any();
    let namespace = desired.namespace().unwrap_or_default();

    if let Some(existing) = store.get(&namespace, &name).await? {
        if existing.state() == JobState::Running {
            return Err(Error::DuplicateJob {
                kind: K::kind_name(),
                namespace,
                name,
            });
        }
        debug!(
            "Deleting previous {} {}/{} in state {}",
            K::kind_name(),
            namespace,
            name,
            existing.state()
        );
        match store.delete(&namespace, &name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        if let Some(poll) = confirm_delete {
            let what = format!("deletion of {} {namespace}/{name}", K::kind_name());
            poll_until(&what, poll, || async {
                Ok(store.get(&namespace, &name).await?.is_none().then_some(()))
            })
            .await?;
        }
    }

    *desired.job_status_mut() = JobStatus::default();
    desired.meta_mut().resource_version = None;
    let created = store.create(&namespace, &desired).await?;
    info!("Created {} {}/{}", K::kind_name(), namespace, name);
    Ok(created)
}
