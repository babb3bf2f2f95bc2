use std::sync::Mutex;

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;

use super::{Cluster, DeploymentEvent, JobEvent};
use crate::build::PatchOp;
use crate::error::Result;
use crate::labels::JobKind;

/// An in-memory stand-in for the real cluster, used by reconciler unit tests. Records
/// every mutating call so tests can assert on what a reconciler attempted without
/// talking to an API server.
#[derive(Default)]
pub struct FakeCluster {
    pub patches: Mutex<Vec<(String, String, Vec<PatchOp>)>>,
    pub applies: Mutex<Vec<(String, serde_json::Value)>>,
    pub deleted_deployments: Mutex<Vec<(String, String)>>,
    pub deleted_labeled: Mutex<Vec<(String, String)>>,
    pub jobs_run: Mutex<Vec<(String, String)>>,
    pub jobs_killed: Mutex<Vec<(String, String)>>,
    pub deployments: Mutex<std::collections::HashMap<String, Deployment>>,
    pub logs_read: Mutex<Vec<(String, Option<JobKind>)>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Cluster for FakeCluster {
    fn watch_deployments(&self) -> BoxStream<'static, Result<DeploymentEvent>> {
        stream::empty().boxed()
    }

    fn watch_jobs(&self) -> BoxStream<'static, Result<JobEvent>> {
        stream::empty().boxed()
    }

    async fn patch_deployment(&self, namespace: &str, name: &str, ops: &[PatchOp]) -> Result<()> {
        self.patches
            .lock()
            .unwrap()
            .push((namespace.to_string(), name.to_string(), ops.to_vec()));
        Ok(())
    }

    async fn apply(&self, namespace: &str, manifest: &serde_json::Value) -> Result<()> {
        self.applies
            .lock()
            .unwrap()
            .push((namespace.to_string(), manifest.clone()));
        // Mirrors the real cluster: a successful apply makes the object immediately
        // readable back through `get_deployment`.
        if manifest.get("kind").and_then(|k| k.as_str()) == Some("Deployment") {
            if let Ok(mut deployment) = serde_json::from_value::<Deployment>(manifest.clone()) {
                use kube::ResourceExt;
                if deployment.meta().creation_timestamp.is_none() {
                    deployment.meta_mut().creation_timestamp = Some(
                        k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
                    );
                }
                self.deployments
                    .lock()
                    .unwrap()
                    .insert(deployment.name_any(), deployment);
            }
        }
        Ok(())
    }

    async fn get_deployment(&self, _namespace: &str, name: &str) -> Result<Option<Deployment>> {
        Ok(self.deployments.lock().unwrap().get(name).cloned())
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        self.deleted_deployments
            .lock()
            .unwrap()
            .push((namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn delete_labeled_resources(&self, namespace: &str, build: &str) -> Result<()> {
        self.deleted_labeled
            .lock()
            .unwrap()
            .push((namespace.to_string(), build.to_string()));
        Ok(())
    }

    async fn run_job(&self, namespace: &str, job: &Job) -> Result<()> {
        use kube::ResourceExt;
        self.jobs_run
            .lock()
            .unwrap()
            .push((namespace.to_string(), job.name_any()));
        Ok(())
    }

    async fn kill_job(&self, namespace: &str, name: &str) -> Result<()> {
        self.jobs_killed
            .lock()
            .unwrap()
            .push((namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn read_log(
        &self,
        _namespace: &str,
        build: &str,
        job_kind: Option<JobKind>,
    ) -> Result<String> {
        self.logs_read
            .lock()
            .unwrap()
            .push((build.to_string(), job_kind));
        Ok(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_patches() {
        let cluster = FakeCluster::new();
        cluster
            .patch_deployment("runboat", "b1", &[serde_json::json!({"op": "replace"})])
            .await
            .unwrap();
        assert_eq!(cluster.patches.lock().unwrap().len(), 1);
    }
}
