use crate::{
    apis::{
        cluster_types::{BackendType, MiddlewareCluster},
        job_types::{MiddlewareBackup, MiddlewareRestore, BACKEND_LABEL},
        trigger_types::{Backup, Restore},
    },
    config::Config,
    reconciler::{error_policy, reconcile},
    retry::RetryConfig,
    store::{KubeEventSource, KubeStore},
    trigger::TriggerMachine,
    watcher::SubscriptionManager,
    workflows::{backup_workflows, restore_workflows, WorkflowContext},
    Metrics,
};
use chrono::{DateTime, Utc};
use futures::{future, stream::StreamExt};
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, ListParams},
    client::Client,
    runtime::{
        controller::Controller,
        events::{Recorder, Reporter},
        watcher::Config as watcherConfig,
    },
    Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt::Debug, sync::Arc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::*;

// Context for our reconcilers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    /// Stores, workload control and config shared with the workflows
    pub shared: Arc<WorkflowContext>,
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "middleware-backup-controller".into(),
        }
    }
}

impl Diagnostics {
    pub fn recorder(&self, client: Client) -> Recorder {
        Recorder::new(client, self.reporter.clone())
    }
}

/// State shared between the controller and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
}

/// State wrapper around the controller outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    /// Register the engine metrics with the shared registry
    fn register_metrics(&self) -> Result<Metrics, prometheus::Error> {
        Metrics::default().register(&self.registry)
    }

    // Create a Controller Context that can update State
    pub fn create_context(
        &self,
        client: Client,
        metrics: Metrics,
        shared: Arc<WorkflowContext>,
    ) -> Arc<Context> {
        Arc::new(Context {
            client,
            metrics,
            diagnostics: self.diagnostics.clone(),
            shared,
        })
    }
}

/// Exit with an installation hint when a CRD cannot be listed
async fn ensure_crd<K>(client: &Client)
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
{
    let api = Api::<K>::all(client.clone());
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("{} CRD is not queryable; {e:?}. Is the CRD installed?", K::kind(&()));
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }
}

/// Watch only the jobs the key-value reconcilers own
fn keyvalue_jobs() -> watcherConfig {
    watcherConfig::default()
        .labels(&format!("{}={}", BACKEND_LABEL, BackendType::KeyValue.as_str()))
        .any_semantic()
}

/// Initialize the engine and shared state (given the crds are installed)
pub async fn run(state: State) {
    // Initialize the Kubernetes client
    let client = match Client::try_default().await {
        Ok(client) => client,
        Err(e) => {
            error!("Please configure your Kubernetes Context: {}", e);
            std::process::exit(1);
        }
    };

    ensure_crd::<Backup>(&client).await;
    ensure_crd::<Restore>(&client).await;
    ensure_crd::<MiddlewareBackup>(&client).await;
    ensure_crd::<MiddlewareRestore>(&client).await;
    ensure_crd::<MiddlewareCluster>(&client).await;

    let metrics = match state.register_metrics() {
        Ok(metrics) => metrics,
        Err(e) => {
            error!("Failed to register metrics: {}", e);
            std::process::exit(1);
        }
    };
    let config = Config::default();
    let enable_reconcilers = config.enable_keyvalue_reconciler;
    let retry = RetryConfig::with_retries(config.conflict_retries);
    let resubscribe_delay = config.resubscribe_delay;
    let shared = Arc::new(WorkflowContext::new(client.clone(), config));

    let machine = TriggerMachine::new(
        Arc::new(KubeStore::<Backup>::new(client.clone())),
        Arc::new(KubeStore::<Restore>::new(client.clone())),
        backup_workflows(&shared),
        restore_workflows(&shared),
        retry,
        metrics.clone(),
    );
    let subscriptions = SubscriptionManager::new(
        Arc::new(KubeEventSource::new(client.clone())),
        Arc::new(machine),
        resubscribe_delay,
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown requested, closing trigger subscriptions");
        on_signal.cancel();
    });

    let ctx = state.create_context(client.clone(), metrics, shared);
    let reconcilers = async {
        if !enable_reconcilers {
            info!("Key-value job reconcilers are disabled");
            return;
        }
        let backups = Controller::new(
            Api::<MiddlewareBackup>::all(client.clone()),
            keyvalue_jobs(),
        )
        .shutdown_on_signal()
        .run(reconcile::<MiddlewareBackup>, error_policy::<MiddlewareBackup>, ctx.clone())
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| future::ready(()));
        let restores = Controller::new(
            Api::<MiddlewareRestore>::all(client.clone()),
            keyvalue_jobs(),
        )
        .shutdown_on_signal()
        .run(reconcile::<MiddlewareRestore>, error_policy::<MiddlewareRestore>, ctx.clone())
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| future::ready(()));
        tokio::join!(backups, restores);
    };

    tokio::join!(subscriptions.run(cancel), reconcilers);
}
