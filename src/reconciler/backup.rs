use super::{JobPaths, KeyValueJob};
use crate::{
    apis::job_types::{JobResource, MiddlewareBackup},
    poll::{poll_until, PollConfig},
    store::ResourceStore,
    workflows::WorkflowContext,
    Result,
};
use async_trait::async_trait;
use kube::ResourceExt;
use std::path::Path;
use tracing::*;

#[async_trait]
impl KeyValueJob for MiddlewareBackup {
    fn store(ctx: &WorkflowContext) -> &dyn ResourceStore<Self> {
        ctx.backups.as_ref()
    }

    #[instrument(skip(self, ctx), fields(job = %self.name_any()))]
    async fn execute(&self, ctx: &WorkflowContext, paths: &JobPaths) -> Result<Option<String>> {
        let ns = self.namespace().unwrap_or_default();
        let target = paths.backup.to_string_lossy().to_string();

        if tokio::fs::try_exists(&paths.backup).await? {
            info!("Removing stale backup directory {}", target);
            tokio::fs::remove_dir_all(&paths.backup).await?;
        }
        ctx.workloads.snapshot(&ns, self.cluster_name(), &target).await?;

        let what = format!("snapshot in {target}");
        let poll = PollConfig::every_second(ctx.config.snapshot_timeout);
        let backup: &Path = &paths.backup;
        poll_until(&what, &poll, move || async move {
            Ok(tokio::fs::try_exists(backup).await?.then_some(()))
        })
        .await?;
        debug!("Snapshot for {}/{} written to {}", ns, self.cluster_name(), target);
        Ok(Some(target))
    }
}
