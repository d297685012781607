/// Expose all controller components used by main
pub mod controller;
pub use crate::controller::*;
pub mod apis;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::Metrics;
pub mod config;

pub mod completion;
mod exec;
#[cfg(test)]
pub mod fixtures;
pub mod poll;
pub mod reconciler;
pub mod recreate;
pub mod retry;
pub mod runner;
pub mod storage;
pub mod store;
pub mod trigger;
pub mod updater;
pub mod watcher;
pub mod workflows;
pub mod workload;

use std::{fmt, time::Duration};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("An error occurred in kube-exec: {0}")]
    KubeExecError(String),

    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("Conflict writing {0}")]
    Conflict(String),

    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("Conflict writing {name}: gave up after {attempts} attempts")]
    ConflictExhausted { name: String, attempts: usize },

    #[error("{kind} {namespace}/{name} is already running")]
    DuplicateJob {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("Invalid Data: {0}")]
    ValidationError(String),

    #[error("Timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error("cluster {namespace}/{cluster} is not healthy (health: {health})")]
    HealthCheckError {
        namespace: String,
        cluster: String,
        health: String,
    },

    #[error("{kind} {namespace}/{name} finished in state {state}: {message}")]
    JobFailed {
        kind: String,
        namespace: String,
        name: String,
        state: String,
        message: String,
    },

    #[error("{0}")]
    Aggregate(AggregateError),

    #[error("Task {0} did not complete")]
    TaskFailed(String),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        let label = format!("{self:?}").to_lowercase();
        match label.find(|c: char| !c.is_alphanumeric()) {
            Some(end) => label[..end].to_string(),
            None => label,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Collapse a list of errors: none is success, one is returned as is.
    pub fn aggregate(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Aggregate(AggregateError(errors))),
        }
    }
}

/// Several independent failures reported as one
#[derive(Debug)]
pub struct AggregateError(pub Vec<Error>);

impl AggregateError {
    pub fn errors(&self) -> &[Error] {
        &self.0
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "[{}]", messages.join("; "))
    }
}
