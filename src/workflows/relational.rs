//! Relational database clusters.
//!
//! A restore is only requested once the cluster has finished initializing, and
//! never over a restore that is already running or done.
use super::{run_backup, run_restore, BackendPolicy, BackupWorkflow, RestoreWorkflow, WorkflowContext};
use crate::{
    apis::{cluster_types::BackendType, trigger_types::TriggerEvent},
    Result,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::instrument;

const POLICY: BackendPolicy = BackendPolicy {
    backend: BackendType::Relational,
    requires_health: true,
    confirm_delete: true,
    guarded_restore: true,
};

pub struct RelationalWorkflow {
    ctx: Arc<WorkflowContext>,
}

impl RelationalWorkflow {
    pub fn new(ctx: Arc<WorkflowContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl BackupWorkflow for RelationalWorkflow {
    fn backend(&self) -> BackendType {
        POLICY.backend
    }

    #[instrument(skip_all, fields(trigger = %run.name))]
    async fn backup(&self, run: &TriggerEvent) -> Result<()> {
        run_backup(&self.ctx, &POLICY).await
    }
}

#[async_trait]
impl RestoreWorkflow for RelationalWorkflow {
    fn backend(&self) -> BackendType {
        POLICY.backend
    }

    #[instrument(skip_all, fields(trigger = %run.name))]
    async fn restore(&self, run: &TriggerEvent) -> Result<()> {
        run_restore(&self.ctx, &POLICY).await
    }
}
