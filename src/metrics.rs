use crate::{apis::trigger_types::TriggerKind, Error};
use prometheus::{histogram_opts, opts, HistogramVec, IntCounterVec, Registry};
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub trigger_runs: IntCounterVec,
    pub trigger_failures: IntCounterVec,
    pub run_duration: HistogramVec,
    pub job_failures: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let run_duration = HistogramVec::new(
            histogram_opts!(
                "middleware_backup_run_duration_seconds",
                "duration of backup and restore runs",
                vec![1., 10., 30., 60., 300., 900., 1800., 3600.]
            ),
            &["kind"],
        )
        .unwrap();
        let trigger_runs = IntCounterVec::new(
            opts!("middleware_backup_trigger_runs_total", "trigger runs started"),
            &["kind"],
        )
        .unwrap();
        let trigger_failures = IntCounterVec::new(
            opts!("middleware_backup_trigger_failures_total", "failed trigger runs"),
            &["kind"],
        )
        .unwrap();
        let job_failures = IntCounterVec::new(
            opts!(
                "middleware_backup_job_reconcile_failures_total",
                "job reconciliation errors"
            ),
            &["job", "error"],
        )
        .unwrap();
        Metrics {
            trigger_runs,
            trigger_failures,
            run_duration,
            job_failures,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.run_duration.clone()))?;
        registry.register(Box::new(self.trigger_runs.clone()))?;
        registry.register(Box::new(self.trigger_failures.clone()))?;
        registry.register(Box::new(self.job_failures.clone()))?;
        Ok(self)
    }

    pub fn job_failure(&self, job: &str, e: &Error) {
        self.job_failures
            .with_label_values(&[job, e.metric_label().as_str()])
            .inc();
    }

    pub fn trigger_failure(&self, kind: TriggerKind) {
        self.trigger_failures.with_label_values(&[kind.as_str()]).inc();
    }

    pub fn count_and_measure(&self, kind: TriggerKind) -> RunMeasurer {
        self.trigger_runs.with_label_values(&[kind.as_str()]).inc();
        RunMeasurer {
            start: Instant::now(),
            kind,
            metric: self.run_duration.clone(),
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct RunMeasurer {
    start: Instant,
    kind: TriggerKind,
    metric: HistogramVec,
}

impl Drop for RunMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric
            .with_label_values(&[self.kind.as_str()])
            .observe(duration);
    }
}
