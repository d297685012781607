//! Helper methods only available for tests
use crate::{
    apis::{
        cluster_types::{
            BackendType, MiddlewareCluster, MiddlewareClusterSpec, MiddlewareClusterStatus, HEALTHY,
        },
        job_types::{JobResource, JobState, MiddlewareBackup, MiddlewareRestore},
        trigger_types::{
            Backup, BackupSpec, MiddlewarePhase, Restore, RestoreSpec, TriggerPhase, TriggerStatus,
        },
    },
    config::Config,
    reconciler::JOB_FINALIZER,
    retry::RetryConfig,
    storage::StoragePathResolver,
    store::{ListScope, ResourceStore},
    workflows::WorkflowContext,
    workload::{MockWorkloadControl, WorkloadControl},
    Context, Diagnostics, Error, Metrics, Result,
};
use assert_json_diff::assert_json_include;
use async_trait::async_trait;
use http::{Request, Response};
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::{api::ObjectMeta, client::Body, Client, Resource, ResourceExt};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use std::{collections::BTreeMap, sync::Arc};
use tokio::{sync::RwLock, task::JoinHandle};

impl MiddlewareCluster {
    /// A cluster in `testns` with no status reported yet
    pub fn test(name: &str, backend: BackendType) -> Self {
        let mut cluster = MiddlewareCluster::new(
            name,
            MiddlewareClusterSpec {
                backend,
                owner: None,
                backup_path: None,
            },
        );
        cluster.meta_mut().namespace = Some("testns".into());
        cluster
    }

    pub fn healthy(mut self) -> Self {
        self.status.get_or_insert_with(MiddlewareClusterStatus::default).health = Some(HEALTHY.into());
        self
    }

    pub fn initialized(mut self) -> Self {
        self.status.get_or_insert_with(MiddlewareClusterStatus::default).initialized = Some(true);
        self
    }
}

impl MiddlewareBackup {
    /// A fresh key-value style job named after its cluster, in `testns`
    pub fn test_job(cluster: &str, backend: BackendType) -> Self {
        let mut job = Self::build(&format!("{cluster}-{backend}-backup"), "testns", cluster, backend, None);
        job.meta_mut().uid = Some("5d3c1a4e-8f0b-4a55-9d7e-0c2f0f8f6a11".into());
        job
    }

    /// Modify a job to have the expected finalizer
    pub fn finalized(mut self) -> Self {
        self.finalizers_mut().push(JOB_FINALIZER.to_string());
        self
    }
}

impl Backup {
    /// A trigger in the system namespace with no status yet
    pub fn test(name: &str) -> Self {
        let mut backup = Backup::new(name, BackupSpec::default());
        backup.meta_mut().namespace = Some("os-system".into());
        backup
    }

    pub fn with_phase(mut self, phase: TriggerPhase) -> Self {
        self.status.get_or_insert_with(TriggerStatus::default).phase = Some(phase);
        self
    }

    pub fn with_middleware_phase(mut self, phase: MiddlewarePhase) -> Self {
        self.status.get_or_insert_with(TriggerStatus::default).middleware_phase = Some(phase);
        self
    }
}

impl Restore {
    /// A trigger in the system namespace with no status yet
    pub fn test(name: &str) -> Self {
        let mut restore = Restore::new(name, RestoreSpec::default());
        restore.meta_mut().namespace = Some("os-system".into());
        restore
    }

    pub fn with_phase(mut self, phase: TriggerPhase) -> Self {
        self.status.get_or_insert_with(TriggerStatus::default).phase = Some(phase);
        self
    }

    pub fn with_middleware_phase(mut self, phase: MiddlewarePhase) -> Self {
        self.status.get_or_insert_with(TriggerStatus::default).middleware_phase = Some(phase);
        self
    }
}

/// The storage agent StatefulSet publishing `path` for the owner of `namespace`
pub fn storage_workload(namespace: &str, path: &str) -> StatefulSet {
    let config = Config::default();
    StatefulSet {
        metadata: ObjectMeta {
            name: Some(config.storage_workload_name),
            namespace: Some(namespace.to_string()),
            annotations: Some(BTreeMap::from([(
                config.storage_path_annotation,
                path.to_string(),
            )])),
            ..ObjectMeta::default()
        },
        ..StatefulSet::default()
    }
}

/// Create hook that plays the job executor finishing every job in `state`
pub fn complete_jobs<K: JobResource>(state: JobState) -> impl Fn(&mut K) + Send + Sync + 'static {
    move |job: &mut K| {
        let status = job.job_status_mut();
        status.state = state;
        if state.is_failed() {
            status.error = Some("simulated failure".into());
        }
    }
}

type Hook<K> = Box<dyn Fn(&mut K) + Send + Sync>;

struct Entry<K> {
    obj: K,
    /// Reads left before a deleted object disappears
    lingering: Option<usize>,
}

struct Inner<K> {
    objects: BTreeMap<(String, String), Entry<K>>,
    version: u64,
    reads: usize,
    list_calls: usize,
    write_attempts: usize,
    successful_writes: usize,
    creates: usize,
    deletes: usize,
    conflicts_to_inject: usize,
    linger: usize,
    bump_after_read: Option<(String, String)>,
    list_hook: Option<(usize, Hook<K>)>,
    get_hook: Option<(usize, Hook<K>)>,
    write_hook: Option<(usize, Hook<K>)>,
    create_hook: Option<Hook<K>>,
}

impl<K: Resource> Inner<K> {
    fn stamp(&mut self, obj: &mut K) {
        self.version += 1;
        obj.meta_mut().resource_version = Some(self.version.to_string());
    }
}

/// In-memory [`ResourceStore`] with the API server's optimistic concurrency.
///
/// Writes are JSON merge patches checked against `metadata.resourceVersion`.
/// Hooks simulate other actors changing objects between calls.
pub struct MemoryStore<K> {
    inner: Mutex<Inner<K>>,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                objects: BTreeMap::new(),
                version: 0,
                reads: 0,
                list_calls: 0,
                write_attempts: 0,
                successful_writes: 0,
                creates: 0,
                deletes: 0,
                conflicts_to_inject: 0,
                linger: 0,
                bump_after_read: None,
                list_hook: None,
                get_hook: None,
                write_hook: None,
                create_hook: None,
            }),
        }
    }
}

fn key_of<K: Resource>(obj: &K) -> (String, String) {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

fn matches_selector<K: Resource>(obj: &K, selector: &str) -> bool {
    selector.split(',').filter(|s| !s.is_empty()).all(|term| match term.split_once('=') {
        Some((key, value)) => obj.labels().get(key).map(String::as_str) == Some(value),
        None => obj.labels().contains_key(term),
    })
}

impl<K> MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object without counting it as a write
    pub fn insert(&self, mut obj: K) {
        let mut inner = self.inner.lock();
        inner.stamp(&mut obj);
        inner.objects.insert(key_of(&obj), Entry { obj, lingering: None });
    }

    pub fn get_cloned(&self, namespace: &str, name: &str) -> Option<K> {
        let inner = self.inner.lock();
        inner
            .objects
            .get(&(namespace.to_string(), name.to_string()))
            .map(|e| e.obj.clone())
    }

    pub fn all(&self) -> Vec<K> {
        self.inner.lock().objects.values().map(|e| e.obj.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().objects.len()
    }

    pub fn creates(&self) -> usize {
        self.inner.lock().creates
    }

    pub fn deletes(&self) -> usize {
        self.inner.lock().deletes
    }

    pub fn read_count(&self) -> usize {
        self.inner.lock().reads
    }

    pub fn list_calls(&self) -> usize {
        self.inner.lock().list_calls
    }

    pub fn write_attempts(&self) -> usize {
        self.inner.lock().write_attempts
    }

    pub fn successful_writes(&self) -> usize {
        self.inner.lock().successful_writes
    }

    pub fn fail_next_writes_with_conflict(&self, n: usize) {
        self.inner.lock().conflicts_to_inject = n;
    }

    /// Another writer updates the object right after our next read of it
    pub fn bump_version_after_next_read(&self, namespace: &str, name: &str) {
        self.inner.lock().bump_after_read = Some((namespace.to_string(), name.to_string()));
    }

    /// Deleted objects stay readable for `reads` more gets, like a pending finalizer
    pub fn linger_deletes(&self, reads: usize) {
        self.inner.lock().linger = reads;
    }

    /// Mutate every stored object once the `nth` list call happens
    pub fn on_list(&self, nth: usize, hook: impl Fn(&mut K) + Send + Sync + 'static) {
        self.inner.lock().list_hook = Some((nth, Box::new(hook)));
    }

    /// Mutate the object read by the `nth` get
    pub fn on_get(&self, nth: usize, hook: impl Fn(&mut K) + Send + Sync + 'static) {
        self.inner.lock().get_hook = Some((nth, Box::new(hook)));
    }

    /// Mutate every object right after it is created
    pub fn on_create(&self, hook: impl Fn(&mut K) + Send + Sync + 'static) {
        self.inner.lock().create_hook = Some(Box::new(hook));
    }

    /// Mutate the written object after the `nth` successful write
    pub fn after_write(&self, nth: usize, hook: impl Fn(&mut K) + Send + Sync + 'static) {
        self.inner.lock().write_hook = Some((nth, Box::new(hook)));
    }

    fn not_found(namespace: &str, name: &str) -> Error {
        Error::NotFound {
            kind: K::kind(&()).to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn write(&self, namespace: &str, name: &str, patch: &Value, status_only: bool) -> Result<K> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.write_attempts += 1;
        if inner.conflicts_to_inject > 0 {
            inner.conflicts_to_inject -= 1;
            return Err(Error::Conflict(format!("{namespace}/{name}: injected")));
        }
        let key = (namespace.to_string(), name.to_string());
        let Some(entry) = inner.objects.get(&key) else {
            return Err(Self::not_found(namespace, name));
        };
        if let Some(expected) = patch.pointer("/metadata/resourceVersion").and_then(Value::as_str) {
            if entry.obj.resource_version().as_deref() != Some(expected) {
                return Err(Error::Conflict(format!("{namespace}/{name}: stale resourceVersion")));
            }
        }

        let mut doc = serde_json::to_value(&entry.obj)?;
        let mut effective = if status_only {
            json!({ "status": patch.get("status").cloned().unwrap_or(Value::Null) })
        } else {
            patch.clone()
        };
        if let Some(meta) = effective.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.remove("resourceVersion");
        }
        json_patch::merge(&mut doc, &effective);
        let mut updated: K = serde_json::from_value(doc)?;
        inner.stamp(&mut updated);
        inner.successful_writes += 1;
        let written = updated.clone();

        let fire = matches!(&inner.write_hook, Some((n, _)) if inner.successful_writes >= *n);
        if fire {
            if let Some((_, hook)) = inner.write_hook.take() {
                hook(&mut updated);
                inner.stamp(&mut updated);
            }
        }
        if let Some(entry) = inner.objects.get_mut(&key) {
            entry.obj = updated;
        }
        Ok(written)
    }
}

#[async_trait]
impl<K> ResourceStore<K> for MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn list(&self, scope: &ListScope) -> Result<Vec<K>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.list_calls += 1;
        let fire = matches!(&inner.list_hook, Some((n, _)) if inner.list_calls >= *n);
        if fire {
            if let Some((_, hook)) = inner.list_hook.take() {
                let mut version = inner.version;
                for entry in inner.objects.values_mut() {
                    hook(&mut entry.obj);
                    version += 1;
                    entry.obj.meta_mut().resource_version = Some(version.to_string());
                }
                inner.version = version;
            }
        }
        Ok(inner
            .objects
            .values()
            .map(|e| &e.obj)
            .filter(|obj| match &scope.namespace {
                Some(ns) => obj.namespace().as_deref() == Some(ns.as_str()),
                None => true,
            })
            .filter(|obj| match &scope.label_selector {
                Some(selector) => matches_selector(*obj, selector),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.reads += 1;
        let key = (namespace.to_string(), name.to_string());

        let fire = matches!(&inner.get_hook, Some((n, _)) if inner.reads >= *n);
        if fire && inner.objects.contains_key(&key) {
            if let Some((_, hook)) = inner.get_hook.take() {
                if let Some(entry) = inner.objects.get_mut(&key) {
                    hook(&mut entry.obj);
                }
            }
        }

        let expired = matches!(inner.objects.get(&key), Some(Entry { lingering: Some(0), .. }));
        if expired {
            inner.objects.remove(&key);
        }
        let found = inner.objects.get_mut(&key).map(|entry| {
            if let Some(left) = entry.lingering.as_mut() {
                *left = left.saturating_sub(1);
            }
            entry.obj.clone()
        });

        if found.is_some() && inner.bump_after_read.as_ref() == Some(&key) {
            inner.bump_after_read = None;
            inner.version += 1;
            let version = inner.version.to_string();
            if let Some(entry) = inner.objects.get_mut(&key) {
                entry.obj.meta_mut().resource_version = Some(version);
            }
        }
        Ok(found)
    }

    async fn create(&self, namespace: &str, obj: &K) -> Result<K> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let key = (namespace.to_string(), obj.name_any());
        if inner.objects.contains_key(&key) {
            return Err(Error::AlreadyExists {
                kind: K::kind(&()).to_string(),
                namespace: key.0,
                name: key.1,
            });
        }
        let mut created = obj.clone();
        created.meta_mut().namespace = Some(namespace.to_string());
        inner.stamp(&mut created);
        inner.creates += 1;
        let returned = created.clone();
        if let Some(hook) = &inner.create_hook {
            hook(&mut created);
        }
        inner.objects.insert(key, Entry {
            obj: created,
            lingering: None,
        });
        Ok(returned)
    }

    async fn patch(&self, namespace: &str, name: &str, patch: &Value) -> Result<K> {
        self.write(namespace, name, patch, false)
    }

    async fn patch_status(&self, namespace: &str, name: &str, patch: &Value) -> Result<K> {
        self.write(namespace, name, patch, true)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let key = (namespace.to_string(), name.to_string());
        let linger = inner.linger;
        match inner.objects.get_mut(&key) {
            None => return Err(Self::not_found(namespace, name)),
            Some(entry) if linger > 0 => {
                if entry.lingering.is_none() {
                    entry.lingering = Some(linger);
                }
            }
            Some(_) => {
                inner.objects.remove(&key);
            }
        }
        inner.deletes += 1;
        Ok(())
    }
}

/// Stores, workload mock and config wired into a [`WorkflowContext`]
pub struct TestBackends {
    pub config: Config,
    pub clusters: Arc<MemoryStore<MiddlewareCluster>>,
    pub backups: Arc<MemoryStore<MiddlewareBackup>>,
    pub restores: Arc<MemoryStore<MiddlewareRestore>>,
    pub backup_triggers: Arc<MemoryStore<Backup>>,
    pub storage_workloads: Arc<MemoryStore<StatefulSet>>,
    workloads: Arc<dyn WorkloadControl>,
}

impl TestBackends {
    /// System storage lives at /storage/system
    pub fn new(workloads: MockWorkloadControl) -> Self {
        let config = Config::default();
        let storage_workloads = Arc::new(MemoryStore::new());
        storage_workloads.insert(storage_workload(&config.system_storage_namespace, "/storage/system"));
        Self {
            config,
            clusters: Arc::new(MemoryStore::new()),
            backups: Arc::new(MemoryStore::new()),
            restores: Arc::new(MemoryStore::new()),
            backup_triggers: Arc::new(MemoryStore::new()),
            storage_workloads,
            workloads: Arc::new(workloads),
        }
    }

    pub fn context(&self) -> Arc<WorkflowContext> {
        Arc::new(WorkflowContext {
            config: self.config.clone(),
            retry: RetryConfig::default(),
            clusters: self.clusters.clone(),
            backups: self.backups.clone(),
            restores: self.restores.clone(),
            backup_triggers: self.backup_triggers.clone(),
            workloads: self.workloads.clone(),
            storage: StoragePathResolver::new(self.storage_workloads.clone(), &self.config),
        })
    }
}

impl Context {
    /// A context whose kube client talks to the returned verifier
    pub fn test(shared: Arc<WorkflowContext>) -> (Arc<Self>, ApiServerVerifier) {
        let (client, verifier) = ApiServerVerifier::new();
        let ctx = Self {
            client,
            metrics: Metrics::default(),
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            shared,
        };
        (Arc::new(ctx), verifier)
    }
}

type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;
pub struct ApiServerVerifier(ApiServerHandle);

pub async fn timeout_after_1s(handle: JoinHandle<()>) {
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("scenario succeeded")
}

/// Responds to the requests a test expects, asserting on each of them.
///
/// Await the returned `JoinHandle` with [`timeout_after_1s`] so missing calls
/// fail the test instead of hanging it.
impl ApiServerVerifier {
    pub fn new() -> (Client, Self) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        (Client::new(mock_service, "testns"), Self(handle))
    }

    pub fn run_not_found(self, path: &str) -> JoinHandle<()> {
        self.respond_with_failure(path, 404, "NotFound")
    }

    pub fn run_conflict(self, path: &str) -> JoinHandle<()> {
        self.respond_with_failure(path, 409, "Conflict")
    }

    /// Expect the finalizer to be added to `obj` at `path`
    pub fn run_finalizer_creation(self, path: &str, obj: MiddlewareBackup) -> JoinHandle<()> {
        let path = path.to_string();
        let mut handle = self.0;
        tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            // the finalizer is added with a guarded json patch
            assert_eq!(request.method(), http::Method::PATCH);
            assert_eq!(request.uri().path(), path);
            let expected_patch = json!([
                { "op": "test", "path": "/metadata/finalizers", "value": null },
                { "op": "add", "path": "/metadata/finalizers", "value": vec![JOB_FINALIZER] }
            ]);
            let req_body = request.into_body().collect_bytes().await.unwrap();
            let runtime_patch: Value =
                serde_json::from_slice(&req_body).expect("valid document from runtime");
            assert_json_include!(actual: runtime_patch, expected: expected_patch);

            let response = serde_json::to_vec(&obj.finalized()).unwrap();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());
        })
    }

    fn respond_with_failure(self, path: &str, code: u16, reason: &str) -> JoinHandle<()> {
        let path = path.to_string();
        let reason = reason.to_string();
        let mut handle = self.0;
        tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.uri().path(), path);
            let status = json!({
                "kind": "Status",
                "apiVersion": "v1",
                "metadata": {},
                "status": "Failure",
                "message": "rejected by test apiserver",
                "reason": reason,
                "code": code,
            });
            let response = Response::builder()
                .status(code)
                .body(Body::from(serde_json::to_vec(&status).unwrap()))
                .unwrap();
            send.send_response(response);
        })
    }
}
