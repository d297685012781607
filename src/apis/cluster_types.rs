use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const SYSTEM_OWNER: &str = "system";
pub const HEALTHY: &str = "Healthy";

/// The kind of middleware engine behind a cluster
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum BackendType {
    /// Single instance key-value store
    KeyValue,
    /// Sharded key-value store
    KeyValueCluster,
    /// Relational database cluster
    Relational,
    /// Document database cluster
    Document,
}

impl BackendType {
    pub const ALL: [BackendType; 4] = [
        BackendType::KeyValue,
        BackendType::KeyValueCluster,
        BackendType::Relational,
        BackendType::Document,
    ];

    /// Stable lowercase name, used in labels, job names and paths
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::KeyValue => "keyvalue",
            BackendType::KeyValueCluster => "keyvalue-cluster",
            BackendType::Relational => "relational",
            BackendType::Document => "document",
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A middleware cluster provisioned outside of this operator.
///
/// The operator only reads these; provisioning owns their lifecycle.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    kind = "MiddlewareCluster",
    group = "middleware.io",
    version = "v1alpha1",
    namespaced
)]
#[kube(status = "MiddlewareClusterStatus", shortname = "mwc")]
#[serde(rename_all = "camelCase")]
pub struct MiddlewareClusterSpec {
    pub backend: BackendType,

    /// User owning the cluster, or "system"
    #[serde(default)]
    pub owner: Option<String>,

    /// Explicit backup location, overrides the owner's storage
    #[serde(default)]
    pub backup_path: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MiddlewareClusterStatus {
    #[serde(default)]
    pub health: Option<String>,
    #[serde(default)]
    pub initialized: Option<bool>,
}

impl MiddlewareCluster {
    pub fn backend(&self) -> BackendType {
        self.spec.backend
    }

    pub fn owner(&self) -> &str {
        match self.spec.owner.as_deref() {
            Some(owner) if !owner.is_empty() => owner,
            _ => SYSTEM_OWNER,
        }
    }

    pub fn health(&self) -> &str {
        self.status
            .as_ref()
            .and_then(|s| s.health.as_deref())
            .unwrap_or("Unknown")
    }

    pub fn is_healthy(&self) -> bool {
        self.health() == HEALTHY
    }

    pub fn is_initialized(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.initialized)
            .unwrap_or(false)
    }

    pub fn declared_backup_path(&self) -> Option<&str> {
        self.spec.backup_path.as_deref().filter(|p| !p.is_empty())
    }

    pub fn namespace_or_default(&self) -> String {
        self.namespace().unwrap_or_else(|| "default".to_string())
    }
}
