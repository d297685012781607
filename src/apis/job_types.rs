use crate::apis::cluster_types::BackendType;
use chrono::{DateTime, Utc};
use k8s_openapi::NamespaceResourceScope;
use kube::{api::ObjectMeta, CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

pub const BACKEND_LABEL: &str = "middleware.io/backend";
pub const CLUSTER_LABEL: &str = "middleware.io/cluster";

/// Lifecycle of a single backup or restore job
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum JobState {
    #[default]
    New,
    Waiting,
    Running,
    Ready,
    Error,
    Rejected,
}

impl JobState {
    /// No further transitions are expected
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Ready | JobState::Error | JobState::Rejected)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, JobState::Error | JobState::Rejected)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    #[serde(default)]
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<String>,
}

/// Backup of one middleware cluster
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    kind = "MiddlewareBackup",
    group = "middleware.io",
    version = "v1alpha1",
    namespaced
)]
#[kube(status = "JobStatus", shortname = "mwbackup")]
#[kube(printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterName"}"#)]
#[kube(printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#)]
#[serde(rename_all = "camelCase")]
pub struct MiddlewareBackupSpec {
    #[serde(default)]
    pub cluster_name: String,
    pub backend: BackendType,
    /// Destination directory for the backup
    #[serde(default)]
    pub backup_path: Option<String>,
}

/// Restore of one middleware cluster
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    kind = "MiddlewareRestore",
    group = "middleware.io",
    version = "v1alpha1",
    namespaced
)]
#[kube(status = "JobStatus", shortname = "mwrestore")]
#[kube(printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterName"}"#)]
#[kube(printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#)]
#[serde(rename_all = "camelCase")]
pub struct MiddlewareRestoreSpec {
    #[serde(default)]
    pub cluster_name: String,
    pub backend: BackendType,
    /// Directory holding the backup to restore from
    #[serde(default)]
    pub backup_path: Option<String>,
}

/// Common view over backup and restore jobs
pub trait JobResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    fn build(
        name: &str,
        namespace: &str,
        cluster_name: &str,
        backend: BackendType,
        backup_path: Option<String>,
    ) -> Self;
    fn cluster_name(&self) -> &str;
    fn backend(&self) -> BackendType;
    fn backup_path(&self) -> Option<&str>;
    fn job_status(&self) -> Option<&JobStatus>;
    fn job_status_mut(&mut self) -> &mut JobStatus;

    /// A job without a status has not been picked up yet
    fn state(&self) -> JobState {
        self.job_status().map(|s| s.state).unwrap_or_default()
    }

    fn kind_name() -> String {
        Self::kind(&()).to_string()
    }
}

fn job_metadata(name: &str, namespace: &str, cluster_name: &str, backend: BackendType) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(BTreeMap::from([
            (BACKEND_LABEL.to_string(), backend.as_str().to_string()),
            (CLUSTER_LABEL.to_string(), cluster_name.to_string()),
        ])),
        ..ObjectMeta::default()
    }
}

impl JobResource for MiddlewareBackup {
    fn build(
        name: &str,
        namespace: &str,
        cluster_name: &str,
        backend: BackendType,
        backup_path: Option<String>,
    ) -> Self {
        Self {
            metadata: job_metadata(name, namespace, cluster_name, backend),
            spec: MiddlewareBackupSpec {
                cluster_name: cluster_name.to_string(),
                backend,
                backup_path,
            },
            status: Some(JobStatus::default()),
        }
    }

    fn cluster_name(&self) -> &str {
        &self.spec.cluster_name
    }

    fn backend(&self) -> BackendType {
        self.spec.backend
    }

    fn backup_path(&self) -> Option<&str> {
        self.spec.backup_path.as_deref().filter(|p| !p.is_empty())
    }

    fn job_status(&self) -> Option<&JobStatus> {
        self.status.as_ref()
    }

    fn job_status_mut(&mut self) -> &mut JobStatus {
        self.status.get_or_insert_with(JobStatus::default)
    }
}

impl JobResource for MiddlewareRestore {
    fn build(
        name: &str,
        namespace: &str,
        cluster_name: &str,
        backend: BackendType,
        backup_path: Option<String>,
    ) -> Self {
        Self {
            metadata: job_metadata(name, namespace, cluster_name, backend),
            spec: MiddlewareRestoreSpec {
                cluster_name: cluster_name.to_string(),
                backend,
                backup_path,
            },
            status: Some(JobStatus::default()),
        }
    }

    fn cluster_name(&self) -> &str {
        &self.spec.cluster_name
    }

    fn backend(&self) -> BackendType {
        self.spec.backend
    }

    fn backup_path(&self) -> Option<&str> {
        self.spec.backup_path.as_deref().filter(|p| !p.is_empty())
    }

    fn job_status(&self) -> Option<&JobStatus> {
        self.status.as_ref()
    }

    fn job_status_mut(&mut self) -> &mut JobStatus {
        self.status.get_or_insert_with(JobStatus::default)
    }
}

/// namespace/name of any namespaced object, for log lines and errors
pub fn object_key<K: Resource>(obj: &K) -> String {
    format!(
        "{}/{}",
        obj.namespace().unwrap_or_default(),
        obj.name_any()
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(JobState::Ready.is_terminal());
        assert!(JobState::Error.is_terminal());
        assert!(JobState::Rejected.is_terminal());
        assert!(!JobState::New.is_terminal());
        assert!(!JobState::Waiting.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(!JobState::Ready.is_failed());
    }

    #[test]
    fn job_without_status_is_new() {
        let mut job = MiddlewareBackup::build("kv-backup", "ns", "kv", BackendType::KeyValue, None);
        job.status = None;
        assert_eq!(job.state(), JobState::New);
        job.job_status_mut().state = JobState::Running;
        assert_eq!(job.state(), JobState::Running);
    }

    #[test]
    fn built_jobs_carry_backend_label() {
        let job = MiddlewareRestore::build(
            "pg-restore",
            "ns",
            "pg",
            BackendType::Relational,
            Some("/backup/pg".into()),
        );
        assert_eq!(
            job.labels().get(BACKEND_LABEL).map(String::as_str),
            Some("relational")
        );
        assert_eq!(job.backup_path(), Some("/backup/pg"));
        assert_eq!(object_key(&job), "ns/pg-restore");
        assert_eq!(MiddlewareRestore::kind_name(), "MiddlewareRestore");
    }

    #[test]
    fn status_uses_camel_case() {
        let status = JobStatus {
            state: JobState::Ready,
            backup_path: Some("/data/backup".into()),
            ..JobStatus::default()
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["state"], "Ready");
        assert_eq!(value["backupPath"], "/data/backup");
        assert!(value.get("error").is_none());
    }
}
