//! Decides when a trigger starts a run, and records the run's outcome.
use crate::{
    apis::trigger_types::{
        Backup, MiddlewarePhase, Restore, TriggerEvent, TriggerKind, TriggerPhase,
        TriggerResource, TriggerStatus,
    },
    metrics::Metrics,
    retry::RetryConfig,
    runner::{run_all, Task},
    store::ResourceStore,
    updater::update_status_if,
    watcher::TriggerHandler,
    workflows::{BackupWorkflow, RestoreWorkflow},
    Result,
};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::{collections::HashSet, sync::Arc};
use tracing::{debug, field, info, instrument, warn, Span};

pub struct TriggerMachine {
    backups: Arc<dyn ResourceStore<Backup>>,
    restores: Arc<dyn ResourceStore<Restore>>,
    backup_workflows: Vec<Arc<dyn BackupWorkflow>>,
    restore_workflows: Vec<Arc<dyn RestoreWorkflow>>,
    retry: RetryConfig,
    metrics: Metrics,
    /// Restore triggers this process already ran, by [`TriggerEvent::key`]
    handled_restores: Mutex<HashSet<String>>,
}

/// What to do with an incoming trigger
#[derive(Debug, PartialEq, Eq)]
pub enum Decision {
    Run,
    Skip(&'static str),
}

/// Backup triggers run once, when the requester has started them
pub fn decide_backup(event: &TriggerEvent) -> Decision {
    if event.phase() != Some(TriggerPhase::Started) {
        return Decision::Skip("phase is not Started");
    }
    match event.middleware_phase() {
        Some(MiddlewarePhase::Running) => Decision::Skip("a run is already in progress"),
        Some(_) => Decision::Skip("the run already finished"),
        None => Decision::Run,
    }
}

/// Restore triggers run on arrival whatever their phase, unless an earlier
/// run was already recorded on them
pub fn decide_restore(event: &TriggerEvent) -> Decision {
    match event.middleware_phase() {
        Some(_) => Decision::Skip("the restore was already handled"),
        None => Decision::Run,
    }
}

/// Only a Started trigger may carry `middlewarePhase`
fn records_outcome(event: &TriggerEvent) -> bool {
    event.phase() == Some(TriggerPhase::Started)
}

impl TriggerMachine {
    pub fn new(
        backups: Arc<dyn ResourceStore<Backup>>,
        restores: Arc<dyn ResourceStore<Restore>>,
        backup_workflows: Vec<Arc<dyn BackupWorkflow>>,
        restore_workflows: Vec<Arc<dyn RestoreWorkflow>>,
        retry: RetryConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            backups,
            restores,
            backup_workflows,
            restore_workflows,
            retry,
            metrics,
            handled_restores: Mutex::new(HashSet::new()),
        }
    }

    fn backup_tasks(&self, event: &TriggerEvent) -> Vec<Task> {
        self.backup_workflows
            .iter()
            .map(|wf| {
                let (wf, event) = (wf.clone(), event.clone());
                Task::new(
                    format!("{}-backup", wf.backend()),
                    async move { wf.backup(&event).await }.boxed(),
                )
            })
            .collect()
    }

    fn restore_tasks(&self, event: &TriggerEvent) -> Vec<Task> {
        self.restore_workflows
            .iter()
            .map(|wf| {
                let (wf, event) = (wf.clone(), event.clone());
                Task::new(
                    format!("{}-restore", wf.backend()),
                    async move { wf.restore(&event).await }.boxed(),
                )
            })
            .collect()
    }

    /// Remember a restore trigger; false if it was seen before
    fn first_restore(&self, event: &TriggerEvent) -> bool {
        self.handled_restores.lock().insert(event.key())
    }

    /// Run the workflows, tracking the run on the trigger's status
    #[instrument(skip_all, fields(trigger = %event.name, kind = %event.kind, trace_id))]
    async fn run_recorded<K: TriggerResource>(
        &self,
        store: &dyn ResourceStore<K>,
        event: &TriggerEvent,
        tasks: Vec<Task>,
    ) -> Result<()> {
        let trace_id = crate::telemetry::get_trace_id();
        Span::current().record("trace_id", field::display(&trace_id));

        let claimed = update_status_if(store, &event.namespace, &event.name, &self.retry, |t: &mut K| {
            let status = t.trigger_status_mut();
            if status.middleware_phase.is_some() || status.phase != Some(TriggerPhase::Started) {
                return Ok(false);
            }
            status.middleware_phase = Some(MiddlewarePhase::Running);
            status.middleware_failed_message = None;
            Ok(true)
        })
        .await?;
        if claimed.is_none() {
            warn!("{} {}/{} changed before the run started", event.kind, event.namespace, event.name);
            return Ok(());
        }

        let (phase, message) = self.execute(event, tasks).await;
        let recorded = update_status_if(store, &event.namespace, &event.name, &self.retry, |t: &mut K| {
            let status = t.trigger_status_mut();
            if status.phase != Some(TriggerPhase::Started) {
                return Ok(false);
            }
            set_outcome(status, phase, message.clone());
            Ok(true)
        })
        .await?;
        if recorded.is_none() {
            warn!(
                "Not recording outcome on {}/{}: trigger left phase Started during the run",
                event.namespace, event.name
            );
        }
        Ok(())
    }

    /// Run the workflows without touching the trigger
    #[instrument(skip_all, fields(trigger = %event.name, kind = %event.kind, trace_id))]
    async fn run_unrecorded(&self, event: &TriggerEvent, tasks: Vec<Task>) {
        let trace_id = crate::telemetry::get_trace_id();
        Span::current().record("trace_id", field::display(&trace_id));
        debug!(
            "{} {}/{} is in phase {:?}, its status is left as is",
            event.kind,
            event.namespace,
            event.name,
            event.phase()
        );
        self.execute(event, tasks).await;
    }

    async fn execute(&self, event: &TriggerEvent, tasks: Vec<Task>) -> (MiddlewarePhase, Option<String>) {
        info!("Starting {} run for {}/{}", event.kind, event.namespace, event.name);
        let outcome = {
            let _measure = self.metrics.count_and_measure(event.kind);
            run_all(tasks).await
        };
        if outcome.is_err() {
            self.metrics.trigger_failure(event.kind);
        }
        let (phase, message) = match outcome {
            Ok(()) => (MiddlewarePhase::Success, None),
            Err(e) => (MiddlewarePhase::Failed, Some(e.to_string())),
        };
        info!(
            "{} run for {}/{} finished: {:?}",
            event.kind, event.namespace, event.name, phase
        );
        (phase, message)
    }
}

fn set_outcome(status: &mut TriggerStatus, phase: MiddlewarePhase, message: Option<String>) {
    status.middleware_phase = Some(phase);
    status.middleware_failed_message = message;
}

#[async_trait]
impl TriggerHandler for TriggerMachine {
    async fn handle(&self, event: TriggerEvent) -> Result<()> {
        let decision = match event.kind {
            TriggerKind::Backup => decide_backup(&event),
            TriggerKind::Restore => decide_restore(&event),
        };
        if let Decision::Skip(reason) = decision {
            debug!("Skipping {} {}/{}: {}", event.kind, event.namespace, event.name, reason);
            return Ok(());
        }
        match event.kind {
            TriggerKind::Backup => {
                let tasks = self.backup_tasks(&event);
                self.run_recorded(self.backups.as_ref(), &event, tasks).await
            }
            TriggerKind::Restore => {
                if !self.first_restore(&event) {
                    debug!("Restore {}/{} was already run by this process", event.namespace, event.name);
                    return Ok(());
                }
                let tasks = self.restore_tasks(&event);
                if records_outcome(&event) {
                    self.run_recorded(self.restores.as_ref(), &event, tasks).await
                } else {
                    self.run_unrecorded(&event, tasks).await;
                    Ok(())
                }
            }
        }
    }
}
