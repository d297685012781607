use k8s_openapi::api::core::v1::Pod;
use kube::{api::Api, client::Client, core::subresource::AttachParams};
use tokio::io::AsyncReadExt;

use crate::Error;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

/// Runs commands inside one container of a pod
pub struct ExecCommand {
    pods_api: Api<Pod>,
    pod_name: String,
    container: String,
}

impl ExecCommand {
    pub fn new(client: Client, namespace: &str, pod_name: &str, container: &str) -> Self {
        Self {
            pods_api: Api::namespaced(client, namespace),
            pod_name: pod_name.to_string(),
            container: container.to_string(),
        }
    }

    pub async fn execute(&self, command: &[String]) -> Result<ExecOutput, Error> {
        let attach_params = AttachParams {
            container: Some(self.container.clone()),
            tty: false,
            stdin: false,
            stdout: true,
            stderr: true,
            max_stdin_buf_size: Some(10240),
            max_stdout_buf_size: Some(10240),
            max_stderr_buf_size: Some(10240),
        };
        debug!("Executing {:?} in {}/{}", command, self.pod_name, self.container);

        let mut attached = self
            .pods_api
            .exec(self.pod_name.as_str(), command, &attach_params)
            .await?;

        let mut stdout = String::new();
        if let Some(mut reader) = attached.stdout() {
            reader.read_to_string(&mut stdout).await.unwrap_or_default();
        }
        let mut stderr = String::new();
        if let Some(mut reader) = attached.stderr() {
            reader.read_to_string(&mut stderr).await.unwrap_or_default();
        }

        let status = match attached.take_status() {
            Some(status) => status.await.unwrap_or_default(),
            None => {
                return Err(Error::KubeExecError(format!(
                    "no status reported for {:?} on pod {}",
                    command, self.pod_name
                )))
            }
        };

        let success = match status.status.as_deref() {
            Some("Success") => true,
            Some("Failure") => {
                warn!(
                    "Command {:?} failed on pod {}: {} {}",
                    command,
                    self.pod_name,
                    status.reason.unwrap_or_default(),
                    stderr.trim()
                );
                false
            }
            other => {
                return Err(Error::KubeExecError(format!(
                    "undefined exec status {:?} for {:?} on pod {}",
                    other, command, self.pod_name
                )))
            }
        };
        Ok(ExecOutput {
            stdout,
            stderr,
            success,
        })
    }

    /// Execute and turn a non-zero exit into an error
    pub async fn execute_checked(&self, command: &[String]) -> Result<ExecOutput, Error> {
        let output = self.execute(command).await?;
        if !output.success {
            return Err(Error::KubeExecError(format!(
                "{:?} on pod {} failed: {}",
                command,
                self.pod_name,
                output.stderr.trim()
            )));
        }
        Ok(output)
    }
}
