//! Waiting for a set of jobs to reach terminal states.
use crate::{
    apis::{
        cluster_types::BackendType,
        job_types::{object_key, JobResource, BACKEND_LABEL},
    },
    poll::{poll_until, PollConfig},
    store::{ListScope, ResourceStore},
    Error, Result,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Poll the jobs matching `scope` until none is New, Waiting or Running.
///
/// Jobs seen in Error or Rejected are remembered across polls and reported
/// together once every job has finished; a single failure never cuts the wait
/// short.
pub async fn wait_for_jobs<K: JobResource>(
    store: &dyn ResourceStore<K>,
    scope: &ListScope,
    poll: &PollConfig,
) -> Result<()> {
    let failures: Mutex<BTreeMap<String, Error>> = Mutex::new(BTreeMap::new());
    let what = format!("{} jobs to finish", K::kind_name());

    let outcome = poll_until(&what, poll, || async {
        let jobs = store.list(scope).await?;
        let mut pending = 0;
        for job in &jobs {
            let state = job.state();
            if state.is_failed() {
                let key = object_key(job);
                let mut failures = failures.lock();
                if !failures.contains_key(&key) {
                    warn!("{} {} finished in state {}", K::kind_name(), key, state);
                    failures.insert(key, job_failure(job));
                }
            } else if !state.is_terminal() {
                pending += 1;
            }
        }
        debug!("{} of {} {} jobs pending", pending, jobs.len(), K::kind_name());
        Ok((pending == 0).then_some(()))
    })
    .await;

    let mut errors: Vec<Error> = failures.into_inner().into_values().collect();
    if let Err(e) = outcome {
        errors.push(e);
    }
    Error::aggregate(errors)
}

fn job_failure<K: JobResource>(job: &K) -> Error {
    Error::JobFailed {
        kind: K::kind_name(),
        namespace: job.meta().namespace.clone().unwrap_or_default(),
        name: job.meta().name.clone().unwrap_or_default(),
        state: job.state().to_string(),
        message: job
            .job_status()
            .and_then(|s| s.error.clone())
            .unwrap_or_else(|| "no error recorded".to_string()),
    }
}

/// A job scope used by the workflows: every job of one backend
pub fn backend_scope(backend: BackendType) -> ListScope {
    ListScope::all().labels(&format!("{}={}", BACKEND_LABEL, backend.as_str()))
}
