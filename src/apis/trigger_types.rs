use crate::Result;
use k8s_openapi::NamespaceResourceScope;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

/// Annotation recording the external snapshot tool's id of the last document backup
pub const LAST_SNAPSHOT_ANNOTATION: &str = "middleware.io/last-snapshot-id";

/// Lifecycle of the overall backup or restore run, owned by the requester
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum TriggerPhase {
    Pending,
    Started,
    Running,
    Succeed,
    Failed,
    Canceled,
}

/// Outcome of the middleware part of a run, owned by this operator
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum MiddlewarePhase {
    Running,
    Success,
    Failed,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TriggerStatus {
    #[serde(default)]
    pub phase: Option<TriggerPhase>,
    #[serde(default)]
    pub middleware_phase: Option<MiddlewarePhase>,
    #[serde(default)]
    pub failed_message: Option<String>,
    #[serde(default)]
    pub middleware_failed_message: Option<String>,
    /// Reported by the file snapshot subsystem, never written here
    #[serde(default)]
    pub restic_phase: Option<String>,
    /// Identifier assigned by the external snapshot tool
    #[serde(default)]
    pub snapshot_id: Option<String>,
}

/// A request to back up every middleware cluster
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(kind = "Backup", group = "middleware.io", version = "v1alpha1", namespaced)]
#[kube(status = "TriggerStatus")]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Middleware","type":"string","jsonPath":".status.middlewarePhase"}"#)]
pub struct BackupSpec {
    #[serde(default)]
    pub owner: Option<String>,
}

/// A request to restore every middleware cluster
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(kind = "Restore", group = "middleware.io", version = "v1alpha1", namespaced)]
#[kube(status = "TriggerStatus")]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Middleware","type":"string","jsonPath":".status.middlewarePhase"}"#)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSpec {
    #[serde(default)]
    pub owner: Option<String>,
    /// Snapshot to restore from, if not the latest
    #[serde(default)]
    pub snapshot_id: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    Backup,
    Restore,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Backup => "backup",
            TriggerKind::Restore => "restore",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common view over the two trigger kinds
pub trait TriggerResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    const KIND: TriggerKind;
    fn trigger_status(&self) -> Option<&TriggerStatus>;
    fn trigger_status_mut(&mut self) -> &mut TriggerStatus;
}

impl TriggerResource for Backup {
    const KIND: TriggerKind = TriggerKind::Backup;

    fn trigger_status(&self) -> Option<&TriggerStatus> {
        self.status.as_ref()
    }

    fn trigger_status_mut(&mut self) -> &mut TriggerStatus {
        self.status.get_or_insert_with(TriggerStatus::default)
    }
}

impl TriggerResource for Restore {
    const KIND: TriggerKind = TriggerKind::Restore;

    fn trigger_status(&self) -> Option<&TriggerStatus> {
        self.status.as_ref()
    }

    fn trigger_status_mut(&mut self) -> &mut TriggerStatus {
        self.status.get_or_insert_with(TriggerStatus::default)
    }
}

/// A decoded trigger as delivered by the event watcher
#[derive(Clone, Debug, PartialEq)]
pub struct TriggerEvent {
    pub kind: TriggerKind,
    pub name: String,
    pub namespace: String,
    pub uid: Option<String>,
    pub status: TriggerStatus,
}

impl TriggerEvent {
    /// Decode a raw watch object of the given trigger kind
    pub fn decode(kind: TriggerKind, object: serde_json::Value) -> Result<Self> {
        match kind {
            TriggerKind::Backup => Ok(Self::from_resource(&serde_json::from_value::<Backup>(
                object,
            )?)),
            TriggerKind::Restore => Ok(Self::from_resource(
                &serde_json::from_value::<Restore>(object)?,
            )),
        }
    }

    pub fn from_resource<T: TriggerResource>(trigger: &T) -> Self {
        Self {
            kind: T::KIND,
            name: trigger.name_any(),
            namespace: trigger.namespace().unwrap_or_default(),
            uid: trigger.uid(),
            status: trigger.trigger_status().cloned().unwrap_or_default(),
        }
    }

    pub fn phase(&self) -> Option<TriggerPhase> {
        self.status.phase
    }

    pub fn middleware_phase(&self) -> Option<MiddlewarePhase> {
        self.status.middleware_phase
    }

    /// Identity of the trigger object, distinct across delete and re-create
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.namespace,
            self.name,
            self.uid.as_deref().unwrap_or_default()
        )
    }
}
