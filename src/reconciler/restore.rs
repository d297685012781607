use super::{JobPaths, KeyValueJob};
use crate::{
    apis::job_types::{JobResource, MiddlewareRestore},
    poll::{poll_until, PollConfig},
    store::ResourceStore,
    workflows::WorkflowContext,
    Error, Result,
};
use async_trait::async_trait;
use kube::ResourceExt;
use std::path::{Path, PathBuf};
use tracing::*;

#[async_trait]
impl KeyValueJob for MiddlewareRestore {
    fn store(ctx: &WorkflowContext) -> &dyn ResourceStore<Self> {
        ctx.restores.as_ref()
    }

    #[instrument(skip(self, ctx), fields(job = %self.name_any()))]
    async fn execute(&self, ctx: &WorkflowContext, paths: &JobPaths) -> Result<Option<String>> {
        let ns = self.namespace().unwrap_or_default();
        let cluster = self.cluster_name();
        match tokio::fs::metadata(&paths.backup).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(Error::ValidationError(format!(
                    "backup path {} is not a directory",
                    paths.backup.display()
                )))
            }
            Err(_) => {
                return Err(Error::ValidationError(format!(
                    "backup directory {} does not exist",
                    paths.backup.display()
                )))
            }
        }

        let poll = PollConfig::every_second(ctx.config.scale_timeout);
        ctx.workloads.scale(&ns, cluster, 0).await?;
        let what = format!("pods of {ns}/{cluster} to stop");
        poll_until(&what, &poll, || {
            let count = ctx.workloads.pod_count(&ns, cluster);
            async move { Ok((count.await? == 0).then_some(())) }
        })
        .await?;

        swap_data_dir(&paths.data, &paths.backup).await?;

        ctx.workloads.scale(&ns, cluster, 1).await?;
        let what = format!("pods of {ns}/{cluster} to start");
        poll_until(&what, &poll, || {
            let count = ctx.workloads.pod_count(&ns, cluster);
            async move { Ok((count.await? >= 1).then_some(())) }
        })
        .await?;
        info!("Restored {}/{} from {}", ns, cluster, paths.backup.display());
        Ok(None)
    }
}

/// Replace `data` with `backup`, keeping the old data until the swap succeeded
async fn swap_data_dir(data: &Path, backup: &Path) -> Result<()> {
    let previous = previous_data_dir(data);
    if tokio::fs::try_exists(&previous).await? {
        tokio::fs::remove_dir_all(&previous).await?;
    }
    let had_data = tokio::fs::try_exists(data).await?;
    if had_data {
        tokio::fs::rename(data, &previous).await?;
    }
    if let Err(e) = tokio::fs::rename(backup, data).await {
        if had_data {
            if let Err(rollback) = tokio::fs::rename(&previous, data).await {
                error!("Failed to put back {}: {}", data.display(), rollback);
            }
        }
        return Err(e.into());
    }
    if had_data {
        if let Err(e) = tokio::fs::remove_dir_all(&previous).await {
            warn!("Failed to remove {}: {}", previous.display(), e);
        }
    }
    Ok(())
}

fn previous_data_dir(data: &Path) -> PathBuf {
    let mut name = data.file_name().unwrap_or_default().to_os_string();
    name.push(".old");
    data.with_file_name(name)
}
