//! Document database clusters.
//!
//! After a successful backup the snapshot id reported on the trigger is
//! recorded as an annotation, so the next run can tell which snapshot holds
//! the last complete document backup.
use super::{run_backup, run_restore, BackendPolicy, BackupWorkflow, RestoreWorkflow, WorkflowContext};
use crate::{
    apis::{
        cluster_types::BackendType,
        trigger_types::{TriggerEvent, TriggerKind, LAST_SNAPSHOT_ANNOTATION},
    },
    updater::update_annotations,
    Result,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, instrument};

const POLICY: BackendPolicy = BackendPolicy {
    backend: BackendType::Document,
    requires_health: true,
    confirm_delete: true,
    guarded_restore: true,
};

pub struct DocumentWorkflow {
    ctx: Arc<WorkflowContext>,
}

impl DocumentWorkflow {
    pub fn new(ctx: Arc<WorkflowContext>) -> Self {
        Self { ctx }
    }

    async fn record_snapshot(&self, run: &TriggerEvent) -> Result<()> {
        let Some(snapshot_id) = run.status.snapshot_id.clone() else {
            debug!("Trigger {}/{} carries no snapshot id", run.namespace, run.name);
            return Ok(());
        };
        update_annotations(
            self.ctx.backup_triggers.as_ref(),
            &run.namespace,
            &run.name,
            &self.ctx.retry,
            |annotations| {
                annotations.insert(LAST_SNAPSHOT_ANNOTATION.to_string(), snapshot_id.clone());
            },
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl BackupWorkflow for DocumentWorkflow {
    fn backend(&self) -> BackendType {
        POLICY.backend
    }

    #[instrument(skip_all, fields(trigger = %run.name))]
    async fn backup(&self, run: &TriggerEvent) -> Result<()> {
        run_backup(&self.ctx, &POLICY).await?;
        if run.kind == TriggerKind::Backup {
            self.record_snapshot(run).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl RestoreWorkflow for DocumentWorkflow {
    fn backend(&self) -> BackendType {
        POLICY.backend
    }

    #[instrument(skip_all, fields(trigger = %run.name))]
    async fn restore(&self, run: &TriggerEvent) -> Result<()> {
        run_restore(&self.ctx, &POLICY).await
    }
}
