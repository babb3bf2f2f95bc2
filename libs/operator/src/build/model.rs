use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::labels::{
    ANNOTATION_GIT_COMMIT, ANNOTATION_INIT_STATUS, ANNOTATION_LAST_SCALED, ANNOTATION_PR,
    ANNOTATION_REPO, ANNOTATION_TARGET_BRANCH, FINALIZER, LABEL_BUILD, PATCH_PATH_FINALIZERS,
    PATCH_PATH_INIT_STATUS, PATCH_PATH_LAST_SCALED, PATCH_PATH_REPLICAS,
};

/// `slugify(repo)-slugify(target_branch)[-pr<n>]-<git_commit[:12]>`, deterministic
/// from commit info and used as the externally reachable hostname prefix.
pub fn slugify(s: &str) -> String {
    s.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// The coordinates that identify what code a build runs: a repository, the branch a
/// commit (or pull request) targets, an optional pull request number, and the exact
/// commit sha.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CommitInfo {
    pub repo: String,
    pub target_branch: String,
    pub pr: Option<u64>,
    pub git_commit: String,
}

impl CommitInfo {
    /// Builds commit info, lower-casing `repo` to its canonical `owner/name` form.
    pub fn new(repo: impl Into<String>, target_branch: impl Into<String>, pr: Option<u64>, git_commit: impl Into<String>) -> Self {
        Self {
            repo: repo.into().to_lowercase(),
            target_branch: target_branch.into(),
            pr,
            git_commit: git_commit.into(),
        }
    }

    pub fn slug(&self) -> String {
        let mut slug = format!("{}-{}", slugify(&self.repo), slugify(&self.target_branch));
        if let Some(pr) = self.pr {
            slug = format!("{slug}-pr{pr}");
        }
        let short_commit: String = self.git_commit.chars().take(12).collect();
        format!("{slug}-{short_commit}")
    }
}

/// Authoritative, annotation-backed initialization state. Transitions exclusively via
/// a patch to `runboat/init-status`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InitStatus {
    Todo,
    Started,
    Succeeded,
    Failed,
}

impl InitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InitStatus::Todo => "todo",
            InitStatus::Started => "started",
            InitStatus::Succeeded => "succeeded",
            InitStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for InitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InitStatus {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "todo" => Ok(InitStatus::Todo),
            "started" => Ok(InitStatus::Started),
            "succeeded" => Ok(InitStatus::Succeeded),
            "failed" => Ok(InitStatus::Failed),
            _ => Err(()),
        }
    }
}

/// Derived, read-only lifecycle state computed from the deployment's annotations and
/// replica counts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BuildStatus {
    Stopped,
    Stopping,
    Initializing,
    Starting,
    Started,
    Failed,
    Undeploying,
}

impl BuildStatus {
    /// Derives status from the raw signals a deployment carries. `current_replicas` is
    /// the deployment's `status.replicas` (pods that exist); `available_replicas` is
    /// `status.available_replicas` (pods that are ready).
    pub fn derive(
        deletion_marker: bool,
        init_status: InitStatus,
        desired_replicas: i32,
        current_replicas: i32,
        available_replicas: i32,
    ) -> Self {
        if deletion_marker {
            return BuildStatus::Undeploying;
        }
        match init_status {
            InitStatus::Todo | InitStatus::Started => BuildStatus::Initializing,
            InitStatus::Failed => BuildStatus::Failed,
            InitStatus::Succeeded => {
                if desired_replicas == 0 {
                    if current_replicas > 0 {
                        BuildStatus::Stopping
                    } else {
                        BuildStatus::Stopped
                    }
                } else if available_replicas >= desired_replicas {
                    BuildStatus::Started
                } else {
                    BuildStatus::Starting
                }
            }
        }
    }

    /// Status values eligible for undeployment once they fall outside capacity.
    pub fn is_evictable(&self) -> bool {
        matches!(
            self,
            BuildStatus::Stopping | BuildStatus::Stopped | BuildStatus::Failed
        )
    }
}

/// A value object derived from a deployment resource: identity, commit coordinates,
/// derived `status`, authoritative `init_status`, `desired_replicas`, `last_scaled`
/// and `created`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Build {
    pub name: String,
    pub deployment_name: String,
    pub commit_info: CommitInfo,
    pub status: BuildStatus,
    pub init_status: InitStatus,
    pub desired_replicas: i32,
    pub last_scaled: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
}

impl Build {
    pub fn slug(&self) -> String {
        self.commit_info.slug()
    }

    /// Reconstructs a [`Build`] from a deployment resource, validating every annotation
    /// this implementation depends on. Rejects unknown `init-status` values instead of
    /// silently defaulting.
    pub fn from_deployment(deployment: &Deployment) -> Result<Self> {
        let dep_name = deployment.name_any();
        let annotations = deployment.annotations();
        let labels = deployment.labels();

        let name = labels
            .get(LABEL_BUILD)
            .cloned()
            .ok_or_else(|| Error::MissingAnnotation {
                deployment: dep_name.clone(),
                key: LABEL_BUILD.to_string(),
            })?;

        let get_annotation = |key: &str| -> Result<String> {
            annotations
                .get(key)
                .cloned()
                .ok_or_else(|| Error::MissingAnnotation {
                    deployment: dep_name.clone(),
                    key: key.to_string(),
                })
        };

        let repo = get_annotation(ANNOTATION_REPO)?;
        let target_branch = get_annotation(ANNOTATION_TARGET_BRANCH)?;
        let pr_raw = annotations.get(ANNOTATION_PR).cloned().unwrap_or_default();
        let pr = if pr_raw.is_empty() {
            None
        } else {
            Some(pr_raw.parse::<u64>().map_err(|_| Error::InvalidAnnotation {
                deployment: dep_name.clone(),
                key: ANNOTATION_PR.to_string(),
                value: pr_raw.clone(),
            })?)
        };
        let git_commit = get_annotation(ANNOTATION_GIT_COMMIT)?;

        let init_status_raw = get_annotation(ANNOTATION_INIT_STATUS)?;
        let init_status: InitStatus =
            init_status_raw
                .parse()
                .map_err(|_| Error::InvalidAnnotation {
                    deployment: dep_name.clone(),
                    key: ANNOTATION_INIT_STATUS.to_string(),
                    value: init_status_raw.clone(),
                })?;

        let last_scaled = match annotations.get(ANNOTATION_LAST_SCALED) {
            Some(raw) if !raw.is_empty() => Some(
                DateTime::parse_from_rfc3339(raw)
                    .map_err(|_| Error::InvalidAnnotation {
                        deployment: dep_name.clone(),
                        key: ANNOTATION_LAST_SCALED.to_string(),
                        value: raw.clone(),
                    })?
                    .with_timezone(&Utc),
            ),
            _ => None,
        };

        let created = deployment
            .meta()
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .ok_or_else(|| Error::MissingAnnotation {
                deployment: dep_name.clone(),
                key: "creationTimestamp".to_string(),
            })?;

        let deletion_marker = deployment.meta().deletion_timestamp.is_some();

        let desired_replicas = deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(0);
        let status_block = deployment.status.as_ref();
        let current_replicas = status_block.and_then(|s| s.replicas).unwrap_or(0);
        let available_replicas = status_block.and_then(|s| s.available_replicas).unwrap_or(0);

        let status = BuildStatus::derive(
            deletion_marker,
            init_status,
            desired_replicas,
            current_replicas,
            available_replicas,
        );

        Ok(Build {
            name,
            deployment_name: dep_name,
            commit_info: CommitInfo {
                repo: repo.to_lowercase(),
                target_branch,
                pr,
                git_commit,
            },
            status,
            init_status,
            desired_replicas,
            last_scaled,
            created,
        })
    }

    /// The fields whose change should wake listeners; see `BuildIndex::add`.
    pub(crate) fn mutable_fields_eq(&self, other: &Build) -> bool {
        self.status == other.status
            && self.init_status == other.init_status
            && self.desired_replicas == other.desired_replicas
            && self.last_scaled == other.last_scaled
    }
}

/// A single JSON-patch (RFC 6902) operation against a deployment.
pub type PatchOp = Value;

pub fn patch_init_status(value: InitStatus) -> PatchOp {
    json!({ "op": "replace", "path": PATCH_PATH_INIT_STATUS, "value": value.as_str() })
}

pub fn patch_replicas(replicas: i32) -> PatchOp {
    json!({ "op": "replace", "path": PATCH_PATH_REPLICAS, "value": replicas })
}

pub fn patch_last_scaled(at: DateTime<Utc>) -> PatchOp {
    json!({
        "op": "replace",
        "path": PATCH_PATH_LAST_SCALED,
        "value": at.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
    })
}

pub fn patch_remove_finalizer() -> PatchOp {
    json!({ "op": "remove", "path": PATCH_PATH_FINALIZERS })
}

/// Annotations/labels a freshly applied deployment manifest must carry, derived from
/// commit info. Consumed by [`crate::manifest::ManifestRenderer`].
pub fn initial_annotations(commit_info: &CommitInfo) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    annotations.insert(ANNOTATION_REPO.to_string(), commit_info.repo.clone());
    annotations.insert(
        ANNOTATION_TARGET_BRANCH.to_string(),
        commit_info.target_branch.clone(),
    );
    annotations.insert(
        ANNOTATION_PR.to_string(),
        commit_info.pr.map(|pr| pr.to_string()).unwrap_or_default(),
    );
    annotations.insert(
        ANNOTATION_GIT_COMMIT.to_string(),
        commit_info.git_commit.clone(),
    );
    annotations.insert(
        ANNOTATION_INIT_STATUS.to_string(),
        InitStatus::Todo.as_str().to_string(),
    );
    annotations
}

pub const FINALIZER_NAME: &str = FINALIZER;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_replaces_non_alphanumerics() {
        assert_eq!(slugify("OCA/mis-builder"), "oca-mis-builder");
        assert_eq!(slugify("15.0"), "15-0");
    }

    #[test]
    fn commit_info_slug_without_pr() {
        let ci = CommitInfo::new("OCA/mis-builder", "15.0", None, "abcdef0123456789");
        assert_eq!(ci.slug(), "oca-mis-builder-15-0-abcdef012345");
    }

    #[test]
    fn commit_info_slug_with_pr() {
        let ci = CommitInfo::new("oca/mis-builder", "15.0", Some(381), "abcdef0123456789");
        assert_eq!(ci.slug(), "oca-mis-builder-15-0-pr381-abcdef012345");
    }

    #[test]
    fn status_derivation_table() {
        use BuildStatus::*;
        use InitStatus::*;

        assert_eq!(BuildStatus::derive(true, Succeeded, 1, 1, 1), Undeploying);
        assert_eq!(BuildStatus::derive(false, Todo, 0, 0, 0), Initializing);
        assert_eq!(BuildStatus::derive(false, Started, 0, 0, 0), Initializing);
        assert_eq!(BuildStatus::derive(false, Failed, 0, 0, 0), Failed);
        assert_eq!(BuildStatus::derive(false, Succeeded, 0, 1, 0), Stopping);
        assert_eq!(BuildStatus::derive(false, Succeeded, 0, 0, 0), Stopped);
        assert_eq!(BuildStatus::derive(false, Succeeded, 1, 0, 1), Started);
        assert_eq!(BuildStatus::derive(false, Succeeded, 1, 0, 0), Starting);
    }

    #[test]
    fn evictable_statuses() {
        assert!(BuildStatus::Stopped.is_evictable());
        assert!(BuildStatus::Stopping.is_evictable());
        assert!(BuildStatus::Failed.is_evictable());
        assert!(!BuildStatus::Started.is_evictable());
        assert!(!BuildStatus::Undeploying.is_evictable());
        assert!(!BuildStatus::Initializing.is_evictable());
    }
}
