// Include the #[ignore] macro on slow tests
// That way, 'cargo test' does not run them by default.
// To run just these tests, use 'cargo test -- --ignored'
//
// These tests assume there is already kubernetes running and you have a context configured.
// It also assumes that the CRDs and the operator are already installed for this cluster.
// The selected namespace must carry the label 'safe-to-run-middleware-tests=true'.

#[cfg(test)]
mod test {
    use controller::{
        apis::{
            cluster_types::{BackendType, MiddlewareCluster, MiddlewareClusterSpec},
            job_types::{JobResource, JobState, MiddlewareBackup},
            trigger_types::{Backup, BackupSpec, MiddlewarePhase, TriggerPhase},
        },
        reconciler::JOB_FINALIZER,
        store::{KubeStore, ResourceStore},
        Error,
    };
    use k8s_openapi::api::core::v1::Namespace;
    use kube::{
        api::{DeleteParams, Patch, PatchParams, PostParams},
        runtime::wait::{await_condition, Condition},
        Api, Client, Config, ResourceExt,
    };
    use rand::Rng;
    use serde_json::json;
    use std::time::Duration;

    const TIMEOUT_SECONDS_JOB_PICKED_UP: u64 = 120;
    const TIMEOUT_SECONDS_TRIGGER_HANDLED: u64 = 300;

    async fn kube_client() -> (Client, String) {
        let kube_config = Config::infer()
            .await
            .expect("Please configure your Kubernetes context.");
        let selected_namespace = kube_config.default_namespace.clone();
        let client = Client::try_from(kube_config).expect("Failed to initialize Kubernetes client");

        let namespaces: Api<Namespace> = Api::all(client.clone());
        let namespace = namespaces.get(&selected_namespace).await.unwrap();
        let labels = namespace.metadata.labels.unwrap_or_default();
        assert_eq!(
            labels.get("safe-to-run-middleware-tests").map(String::as_str),
            Some("true"),
            "expected to find label 'safe-to-run-middleware-tests' with value 'true'"
        );
        (client, selected_namespace)
    }

    fn suffix() -> u32 {
        rand::thread_rng().gen_range(0..100000)
    }

    fn job_picked_up() -> impl Condition<MiddlewareBackup> {
        |job: Option<&MiddlewareBackup>| {
            job.map(|j| j.finalizers().iter().any(|f| f == JOB_FINALIZER) && j.state() != JobState::New)
                .unwrap_or(false)
        }
    }

    fn middleware_phase_set() -> impl Condition<Backup> {
        |backup: Option<&Backup>| {
            backup
                .and_then(|b| b.status.as_ref())
                .and_then(|s| s.middleware_phase)
                .is_some_and(|phase| phase != MiddlewarePhase::Running)
        }
    }

    #[tokio::test]
    #[ignore]
    async fn functional_test_keyvalue_job_gets_finalizer_and_leaves_new() {
        let (client, namespace) = kube_client().await;
        let name = format!("kv-{}", suffix());

        let clusters: Api<MiddlewareCluster> = Api::namespaced(client.clone(), &namespace);
        let cluster = MiddlewareCluster::new(
            &name,
            MiddlewareClusterSpec {
                backend: BackendType::KeyValue,
                owner: None,
                backup_path: None,
            },
        );
        clusters.create(&PostParams::default(), &cluster).await.unwrap();

        let jobs: Api<MiddlewareBackup> = Api::namespaced(client.clone(), &namespace);
        let job_name = format!("{name}-keyvalue-backup");
        let job = MiddlewareBackup::build(&job_name, &namespace, &name, BackendType::KeyValue, None);
        jobs.create(&PostParams::default(), &job).await.unwrap();

        let picked_up = await_condition(jobs.clone(), &job_name, job_picked_up());
        tokio::time::timeout(Duration::from_secs(TIMEOUT_SECONDS_JOB_PICKED_UP), picked_up)
            .await
            .unwrap_or_else(|_| panic!("{job_name} was not picked up in time"))
            .unwrap();

        // no instance runs for this cluster, so the job waits
        let job = jobs.get(&job_name).await.unwrap();
        assert_eq!(job.state(), JobState::Waiting);

        jobs.delete(&job_name, &DeleteParams::default()).await.unwrap();
        clusters.delete(&name, &DeleteParams::default()).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn functional_test_started_backup_trigger_is_handled() {
        let (client, namespace) = kube_client().await;
        let name = format!("nightly-{}", suffix());

        let backups: Api<Backup> = Api::namespaced(client.clone(), &namespace);
        backups
            .create(&PostParams::default(), &Backup::new(&name, BackupSpec::default()))
            .await
            .unwrap();
        let status = json!({ "status": { "phase": TriggerPhase::Started } });
        backups
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&status))
            .await
            .unwrap();

        let handled = await_condition(backups.clone(), &name, middleware_phase_set());
        tokio::time::timeout(Duration::from_secs(TIMEOUT_SECONDS_TRIGGER_HANDLED), handled)
            .await
            .unwrap_or_else(|_| panic!("{name} was not handled in time"))
            .unwrap();

        backups.delete(&name, &DeleteParams::default()).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn functional_test_stale_status_write_is_a_conflict() {
        let (client, namespace) = kube_client().await;
        let name = format!("conflict-{}", suffix());
        let store = KubeStore::<Backup>::new(client.clone());

        let created = store
            .create(&namespace, &Backup::new(&name, BackupSpec::default()))
            .await
            .unwrap();
        let version = created.resource_version().unwrap();
        let first = json!({
            "metadata": { "resourceVersion": version },
            "status": { "phase": TriggerPhase::Pending },
        });
        store.patch_status(&namespace, &name, &first).await.unwrap();

        // same version again: someone else already wrote
        let second = json!({
            "metadata": { "resourceVersion": version },
            "status": { "phase": TriggerPhase::Canceled },
        });
        let err = store.patch_status(&namespace, &name, &second).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)), "got {err:?}");

        store.delete(&namespace, &name).await.unwrap();
    }
}
