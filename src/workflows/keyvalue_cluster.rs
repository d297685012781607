//! Sharded key-value clusters, backed up by their own operator.
use super::{run_backup, run_restore, BackendPolicy, BackupWorkflow, RestoreWorkflow, WorkflowContext};
use crate::{
    apis::{cluster_types::BackendType, trigger_types::TriggerEvent},
    Result,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::instrument;

const POLICY: BackendPolicy = BackendPolicy {
    backend: BackendType::KeyValueCluster,
    requires_health: true,
    confirm_delete: false,
    guarded_restore: false,
};

pub struct KeyValueClusterWorkflow {
    ctx: Arc<WorkflowContext>,
}

impl KeyValueClusterWorkflow {
    pub fn new(ctx: Arc<WorkflowContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl BackupWorkflow for KeyValueClusterWorkflow {
    fn backend(&self) -> BackendType {
        POLICY.backend
    }

    #[instrument(skip_all, fields(trigger = %run.name))]
    async fn backup(&self, run: &TriggerEvent) -> Result<()> {
        run_backup(&self.ctx, &POLICY).await
    }
}

#[async_trait]
impl RestoreWorkflow for KeyValueClusterWorkflow {
    fn backend(&self) -> BackendType {
        POLICY.backend
    }

    #[instrument(skip_all, fields(trigger = %run.name))]
    async fn restore(&self, run: &TriggerEvent) -> Result<()> {
        run_restore(&self.ctx, &POLICY).await
    }
}
