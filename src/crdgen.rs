use controller::apis::{
    cluster_types::MiddlewareCluster,
    job_types::{MiddlewareBackup, MiddlewareRestore},
    trigger_types::{Backup, Restore},
};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let crds = [
        Backup::crd(),
        Restore::crd(),
        MiddlewareBackup::crd(),
        MiddlewareRestore::crd(),
        MiddlewareCluster::crd(),
    ];
    for mut crd in crds {
        // Add an annotation
        crd.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert("helm.sh/resource-policy".to_string(), "keep".to_string());
        print!("---\n{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
