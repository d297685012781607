//! Single instance key-value stores.
//!
//! Jobs of this backend are executed by the in-process job reconcilers, which
//! hold a finalizer on every job, so a replaced job must be gone before its
//! successor is created.
use super::{run_backup, run_restore, BackendPolicy, BackupWorkflow, RestoreWorkflow, WorkflowContext};
use crate::{
    apis::{cluster_types::BackendType, trigger_types::TriggerEvent},
    Result,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::instrument;

const POLICY: BackendPolicy = BackendPolicy {
    backend: BackendType::KeyValue,
    requires_health: false,
    confirm_delete: true,
    guarded_restore: false,
};

pub struct KeyValueWorkflow {
    ctx: Arc<WorkflowContext>,
}

impl KeyValueWorkflow {
    pub fn new(ctx: Arc<WorkflowContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl BackupWorkflow for KeyValueWorkflow {
    fn backend(&self) -> BackendType {
        POLICY.backend
    }

    #[instrument(skip_all, fields(trigger = %run.name))]
    async fn backup(&self, run: &TriggerEvent) -> Result<()> {
        run_backup(&self.ctx, &POLICY).await
    }
}

#[async_trait]
impl RestoreWorkflow for KeyValueWorkflow {
    fn backend(&self) -> BackendType {
        POLICY.backend
    }

    #[instrument(skip_all, fields(trigger = %run.name))]
    async fn restore(&self, run: &TriggerEvent) -> Result<()> {
        run_restore(&self.ctx, &POLICY).await
    }
}
