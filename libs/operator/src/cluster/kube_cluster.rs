use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, PropagationPolicy};
use kube::runtime::watcher::{self, Event};
use kube::{Client, ResourceExt};

use super::{Cluster, DeploymentEvent, JobEvent};
use crate::build::PatchOp;
use crate::labels::{JobKind, LABEL_BUILD, LABEL_JOB_KIND};
use crate::error::{Error, Result};

/// The real cluster, backed by a `kube::Client`. Scoped to a single namespace, the
/// configured `build_namespace`.
pub struct KubeCluster {
    client: Client,
    namespace: String,
    field_manager: String,
}

impl KubeCluster {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            field_manager: "runboat-operator".to_string(),
        }
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

fn deployment_watch_event(event: Event<Deployment>) -> Option<DeploymentEvent> {
    match event {
        Event::Apply(d) => Some(DeploymentEvent::Applied(Box::new(d))),
        Event::Delete(d) => Some(DeploymentEvent::Deleted(Box::new(d))),
        Event::Init | Event::InitApply(_) => None,
        Event::InitDone => Some(DeploymentEvent::Restarted),
    }
}

fn job_watch_event(event: Event<Job>) -> Option<JobEvent> {
    match event {
        Event::Apply(j) => Some(JobEvent::Applied(Box::new(j))),
        Event::Delete(j) => Some(JobEvent::Deleted(Box::new(j))),
        Event::Init | Event::InitApply(_) => None,
        Event::InitDone => Some(JobEvent::Restarted),
    }
}

#[async_trait::async_trait]
impl Cluster for KubeCluster {
    fn watch_deployments(&self) -> BoxStream<'static, Result<DeploymentEvent>> {
        let config = watcher::Config::default().labels(LABEL_BUILD);
        watcher::watcher(self.deployments(), config)
            .filter_map(|res| async move {
                match res {
                    Ok(event) => deployment_watch_event(event).map(Ok),
                    Err(err) => Some(Err(Error::Kube(kube::Error::Api(
                        kube::core::ErrorResponse {
                            status: "Failure".to_string(),
                            message: err.to_string(),
                            reason: "WatchFailed".to_string(),
                            code: 0,
                        },
                    )))),
                }
            })
            .boxed()
    }

    fn watch_jobs(&self) -> BoxStream<'static, Result<JobEvent>> {
        let config = watcher::Config::default().labels(LABEL_BUILD);
        watcher::watcher(self.jobs(), config)
            .filter_map(|res| async move {
                match res {
                    Ok(event) => job_watch_event(event).map(Ok),
                    Err(err) => Some(Err(Error::Kube(kube::Error::Api(
                        kube::core::ErrorResponse {
                            status: "Failure".to_string(),
                            message: err.to_string(),
                            reason: "WatchFailed".to_string(),
                            code: 0,
                        },
                    )))),
                }
            })
            .boxed()
    }

    async fn patch_deployment(&self, namespace: &str, name: &str, ops: &[PatchOp]) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let patch_ops = ops
            .iter()
            .map(|op| serde_json::from_value(op.clone()))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let patch: Patch<Deployment> = Patch::Json(json_patch::Patch(patch_ops));
        api.patch(name, &PatchParams::default(), &patch).await?;
        Ok(())
    }

    async fn apply(&self, namespace: &str, manifest: &serde_json::Value) -> Result<()> {
        let kind = manifest
            .get("kind")
            .and_then(|k| k.as_str())
            .unwrap_or_default();
        let name = manifest
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(|n| n.as_str())
            .unwrap_or_default();

        let params = PatchParams::apply(&self.field_manager);
        let dry_run_params = params.clone().dry_run();
        let patch = Patch::Apply(manifest);

        match kind {
            "Deployment" => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                api.patch(name, &dry_run_params, &patch).await?;
                api.patch(name, &params, &patch).await?;
            }
            "Job" => {
                let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
                api.patch(name, &dry_run_params, &patch).await?;
                api.patch(name, &params, &patch).await?;
            }
            other => {
                return Err(Error::ManifestRender {
                    build: name.to_string(),
                    reason: format!("unsupported manifest kind {other}"),
                });
            }
        }
        Ok(())
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        match api.get_opt(name).await? {
            Some(d) => Ok(Some(d)),
            None => Ok(None),
        }
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    /// Deletes every configmap/deployment/ingress/job/secret/service/pvc labeled with
    /// `build`, the full set of resource kinds a build's manifests render.
    async fn delete_labeled_resources(&self, namespace: &str, build: &str) -> Result<()> {
        let params = DeleteParams::default();
        let list_params = kube::api::ListParams::default().labels(&format!("{LABEL_BUILD}={build}"));

        let configmaps: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        for item in configmaps.list(&list_params).await?.items {
            configmaps.delete(&item.name_any(), &params).await?;
        }

        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        for item in deployments.list(&list_params).await?.items {
            deployments.delete(&item.name_any(), &params).await?;
        }

        let ingresses: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        for item in ingresses.list(&list_params).await?.items {
            ingresses.delete(&item.name_any(), &params).await?;
        }

        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        for item in jobs.list(&list_params).await?.items {
            jobs.delete(&item.name_any(), &params).await?;
        }

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        for item in secrets.list(&list_params).await?.items {
            secrets.delete(&item.name_any(), &params).await?;
        }

        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        for item in services.list(&list_params).await?.items {
            services.delete(&item.name_any(), &params).await?;
        }

        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        for item in pvcs.list(&list_params).await?.items {
            pvcs.delete(&item.name_any(), &params).await?;
        }

        Ok(())
    }

    async fn run_job(&self, namespace: &str, job: &Job) -> Result<()> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), job).await?;
        Ok(())
    }

    /// Deletes the job with zero grace period and background propagation, so its pods
    /// are torn down immediately instead of waiting out their termination grace period.
    async fn kill_job(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            propagation_policy: Some(PropagationPolicy::Background),
            ..DeleteParams::default()
        };
        api.delete(name, &params).await?;
        Ok(())
    }

    async fn read_log(
        &self,
        namespace: &str,
        build: &str,
        job_kind: Option<JobKind>,
    ) -> Result<String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);

        let mut selector = format!("{LABEL_BUILD}={build}");
        if let Some(kind) = job_kind {
            selector.push_str(&format!(",{LABEL_JOB_KIND}={kind}"));
        }
        let list_params = ListParams::default().labels(&selector);

        let pod = pods
            .list(&list_params)
            .await?
            .items
            .into_iter()
            .next()
            .ok_or_else(|| Error::MissingAnnotation {
                deployment: build.to_string(),
                key: "pod matching runboat/build".to_string(),
            })?;

        let log_params = kube::api::LogParams {
            tail_lines: Some(1000),
            ..Default::default()
        };
        Ok(pods.logs(&pod.name_any(), &log_params).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::client::Body;
    use std::time::Duration;

    // Wraps tower_test's mock handle so a test can script the exact sequence of
    // requests the real apiserver would receive, without a cluster.
    type ApiServerHandle = tower_test::mock::Handle<http::Request<Body>, http::Response<Body>>;

    struct ApiServerVerifier(ApiServerHandle);

    impl ApiServerVerifier {
        async fn expect(mut self, check: impl FnOnce(&http::Request<Body>)) -> Self {
            let (request, send) = self.0.next_request().await.expect("cluster made no request");
            check(&request);
            let body = serde_json::to_vec(&serde_json::json!({
                "kind": "Deployment",
                "metadata": {"name": "build-abc"},
            }))
            .unwrap();
            send.send_response(http::Response::builder().body(Body::from(body)).unwrap());
            self
        }
    }

    fn test_cluster() -> (KubeCluster, ApiServerVerifier) {
        let (mock_service, handle) = tower_test::mock::pair::<http::Request<Body>, http::Response<Body>>();
        let client = Client::new(mock_service, "runboat-builds");
        (
            KubeCluster::new(client, "runboat-builds"),
            ApiServerVerifier(handle),
        )
    }

    async fn run_scenario(verifier: tokio::task::JoinHandle<()>) {
        tokio::time::timeout(Duration::from_secs(1), verifier)
            .await
            .expect("scenario timed out waiting for a cluster call")
            .expect("scenario task panicked");
    }

    #[tokio::test]
    async fn apply_dry_runs_before_writing_for_real() {
        let (cluster, verifier) = test_cluster();
        let manifest = serde_json::json!({
            "kind": "Deployment",
            "metadata": {"name": "build-abc", "namespace": "runboat-builds"},
            "spec": {"replicas": 1},
        });

        let scenario = tokio::spawn(async move {
            verifier
                .expect(|request| {
                    assert_eq!(request.method(), http::Method::PATCH);
                    assert!(
                        request.uri().to_string().contains("dryRun=All"),
                        "first patch should be a dry run: {}",
                        request.uri()
                    );
                })
                .await
                .expect(|request| {
                    assert_eq!(request.method(), http::Method::PATCH);
                    assert!(
                        !request.uri().to_string().contains("dryRun"),
                        "second patch should not be a dry run: {}",
                        request.uri()
                    );
                })
                .await;
        });

        cluster
            .apply("runboat-builds", &manifest)
            .await
            .expect("apply succeeds once both patches are answered");
        run_scenario(scenario).await;
    }

    #[tokio::test]
    async fn patch_deployment_sends_a_json_patch_body() {
        let (cluster, verifier) = test_cluster();
        let ops = vec![crate::build::patch_replicas(3)];

        let scenario = tokio::spawn(async move {
            verifier
                .expect(|request| {
                    assert_eq!(request.method(), http::Method::PATCH);
                    assert!(request
                        .uri()
                        .to_string()
                        .contains("/deployments/build-abc"));
                    assert_eq!(
                        request
                            .headers()
                            .get(http::header::CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok()),
                        Some("application/json-patch+json")
                    );
                })
                .await;
        });

        cluster
            .patch_deployment("runboat-builds", "build-abc", &ops)
            .await
            .expect("patch succeeds once answered");
        run_scenario(scenario).await;
    }
}
