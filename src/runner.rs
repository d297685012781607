//! Fan-out/fan-in execution of independent workflows.
use crate::{Error, Result};
use futures::future::BoxFuture;
use tracing::{debug, error};

/// A named unit of work
pub struct Task {
    pub name: String,
    pub work: BoxFuture<'static, Result<()>>,
}

impl Task {
    pub fn new(name: impl Into<String>, work: BoxFuture<'static, Result<()>>) -> Self {
        Self {
            name: name.into(),
            work,
        }
    }
}

/// Run every task concurrently and wait for all of them.
///
/// A failing task never cancels its siblings. Each task reports through its
/// own join handle, and the errors are collected after the barrier in the
/// order the tasks were given.
pub async fn run_all(tasks: Vec<Task>) -> Result<()> {
    let handles: Vec<_> = tasks
        .into_iter()
        .map(|task| {
            debug!("Starting task {}", task.name);
            (task.name, tokio::spawn(task.work))
        })
        .collect();

    let mut errors = Vec::new();
    for (name, handle) in handles {
        match handle.await {
            Ok(Ok(())) => debug!("Task {} finished", name),
            Ok(Err(e)) => {
                error!("Task {} failed: {}", name, e);
                errors.push(e);
            }
            Err(join_error) => {
                error!("Task {} did not complete: {}", name, join_error);
                errors.push(Error::TaskFailed(name));
            }
        }
    }
    Error::aggregate(errors)
}
