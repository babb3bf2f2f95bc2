use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;
use serde_json::Value;

use crate::build::{initial_annotations, CommitInfo, FINALIZER_NAME};
use crate::labels::{JobKind, LABEL_BUILD, LABEL_JOB_KIND};

/// Which manifest bundle to render for a build. The deployment mode is used once, at
/// `deploy_commit` time; initialize/cleanup modes are re-applied by their respective
/// reconcilers every time the corresponding job needs to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManifestMode {
    Deploy,
    Initialize,
    Cleanup,
}

/// Out of scope: renders the actual resource manifests (deployment, service, ingress,
/// job) for a build. The core only needs a bundle of resources to hand to
/// [`crate::cluster::Cluster::apply`]; how hostnames, images and init commands are
/// templated belongs to the collaborator that owns the manifest templates.
pub trait ManifestRenderer: Send + Sync {
    fn render(&self, build_name: &str, commit_info: &CommitInfo, mode: ManifestMode) -> Vec<Value>;
}

/// A minimal renderer good enough to exercise the controller end to end: a deployment
/// running a placeholder image, scaled by `desired_replicas`, and a one-shot job for
/// the initialize/cleanup modes. Real deployments plug in a renderer backed by their
/// own manifest templates instead.
pub struct DefaultManifestRenderer {
    pub namespace: String,
    pub build_domain: String,
    pub image: String,
}

impl DefaultManifestRenderer {
    pub fn new(namespace: impl Into<String>, build_domain: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            build_domain: build_domain.into(),
            image: "ghcr.io/oca/runboat-sandbox:latest".to_string(),
        }
    }

    fn labels(&self, build_name: &str) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_BUILD.to_string(), build_name.to_string());
        labels
    }

    fn render_deployment(&self, build_name: &str, commit_info: &CommitInfo) -> Value {
        let labels = self.labels(build_name);
        let deployment = Deployment {
            metadata: ObjectMeta {
                name: Some(build_name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                annotations: Some(initial_annotations(commit_info)),
                finalizers: Some(vec![FINALIZER_NAME.to_string()]),
                ..ObjectMeta::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(0),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    match_expressions: None,
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..ObjectMeta::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "app".to_string(),
                            image: Some(self.image.clone()),
                            ..Container::default()
                        }],
                        ..PodSpec::default()
                    }),
                },
                ..DeploymentSpec::default()
            }),
            ..Deployment::default()
        };
        serde_json::to_value(deployment).expect("Deployment always serializes")
    }

    fn render_job(&self, build_name: &str, kind: JobKind) -> Value {
        let mut labels = self.labels(build_name);
        labels.insert(LABEL_JOB_KIND.to_string(), kind.as_str().to_string());
        let command = match kind {
            JobKind::Initialize => vec!["/bin/sh".to_string(), "-c".to_string(), "runboat-init".to_string()],
            JobKind::Cleanup => vec!["/bin/sh".to_string(), "-c".to_string(), "runboat-cleanup".to_string()],
        };
        let job = Job {
            metadata: ObjectMeta {
                name: Some(format!("{build_name}-{}", kind.as_str())),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                ..ObjectMeta::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(0),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..ObjectMeta::default()
                    }),
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".to_string()),
                        containers: vec![Container {
                            name: "job".to_string(),
                            image: Some(self.image.clone()),
                            command: Some(command),
                            ..Container::default()
                        }],
                        ..PodSpec::default()
                    }),
                },
                ..JobSpec::default()
            }),
            ..Job::default()
        };
        serde_json::to_value(job).expect("Job always serializes")
    }
}

impl ManifestRenderer for DefaultManifestRenderer {
    fn render(&self, build_name: &str, commit_info: &CommitInfo, mode: ManifestMode) -> Vec<Value> {
        match mode {
            ManifestMode::Deploy => vec![self.render_deployment(build_name, commit_info)],
            ManifestMode::Initialize => vec![self.render_job(build_name, JobKind::Initialize)],
            ManifestMode::Cleanup => vec![self.render_job(build_name, JobKind::Cleanup)],
        }
    }
}
