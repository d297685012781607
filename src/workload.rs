//! Control over the workloads backing a middleware cluster.
use crate::{apis::job_types::CLUSTER_LABEL, exec::ExecCommand, Result};
use async_trait::async_trait;
use k8s_openapi::api::{apps::v1::StatefulSet, core::v1::Pod};
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    client::Client,
};
#[cfg(test)]
use mockall::automock;
use serde_json::json;
use tracing::{debug, info};

/// Key-value instance admin CLI used for snapshots
const KEYVALUE_CLI: &str = "redis-cli";

#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadControl: Send + Sync {
    /// Whether the base StatefulSet of a cluster exists
    async fn workload_exists(&self, namespace: &str, name: &str) -> Result<bool>;

    async fn scale(&self, namespace: &str, name: &str, replicas: i32) -> Result<()>;

    /// Pods of the cluster in any phase
    async fn pod_count(&self, namespace: &str, name: &str) -> Result<usize>;

    /// Pods of the cluster in phase Running
    async fn running_pods(&self, namespace: &str, name: &str) -> Result<usize>;

    /// Ask the first instance to write an asynchronous snapshot into `target_dir`
    async fn snapshot(&self, namespace: &str, name: &str, target_dir: &str) -> Result<()>;
}

pub struct KubeWorkloads {
    client: Client,
    container: String,
}

impl KubeWorkloads {
    pub fn new(client: Client, container: &str) -> Self {
        Self {
            client,
            container: container.to_string(),
        }
    }

    async fn pods(&self, namespace: &str, name: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&format!("{CLUSTER_LABEL}={name}"));
        Ok(api.list(&lp).await?.items)
    }
}

fn snapshot_commands(target_dir: &str) -> [Vec<String>; 2] {
    [
        vec![
            KEYVALUE_CLI.to_string(),
            "CONFIG".to_string(),
            "SET".to_string(),
            "backup-dir".to_string(),
            target_dir.to_string(),
        ],
        vec![KEYVALUE_CLI.to_string(), "BGSAVE".to_string()],
    ]
}

fn is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(|phase| phase == "Running")
        .unwrap_or(false)
}

#[async_trait]
impl WorkloadControl for KubeWorkloads {
    async fn workload_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn scale(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        info!("Scaling {}/{} to {} replicas", namespace, name, replicas);
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "spec": { "replicas": replicas } });
        api.patch_scale(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn pod_count(&self, namespace: &str, name: &str) -> Result<usize> {
        Ok(self.pods(namespace, name).await?.len())
    }

    async fn running_pods(&self, namespace: &str, name: &str) -> Result<usize> {
        Ok(self
            .pods(namespace, name)
            .await?
            .iter()
            .filter(|p| is_running(p))
            .count())
    }

    async fn snapshot(&self, namespace: &str, name: &str, target_dir: &str) -> Result<()> {
        let pod = format!("{name}-0");
        let exec = ExecCommand::new(self.client.clone(), namespace, &pod, &self.container);
        for command in snapshot_commands(target_dir) {
            let output = exec.execute_checked(&command).await?;
            debug!("{:?} on {}/{}: {}", command, namespace, pod, output.stdout.trim());
        }
        Ok(())
    }
}
