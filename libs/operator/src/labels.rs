//! Label, annotation and finalizer names used on the orchestrator side.
//!
//! Kept stable across releases so that resources created by one generation of the
//! controller remain legible to another.

/// Identifies every resource (deployment, job, service, ...) owned by a build.
pub const LABEL_BUILD: &str = "runboat/build";

/// On job resources, distinguishes the one-shot initialize job from the cleanup job.
pub const LABEL_JOB_KIND: &str = "runboat/job-kind";

pub const ANNOTATION_REPO: &str = "runboat/repo";
pub const ANNOTATION_TARGET_BRANCH: &str = "runboat/target-branch";
pub const ANNOTATION_PR: &str = "runboat/pr";
pub const ANNOTATION_GIT_COMMIT: &str = "runboat/git-commit";
pub const ANNOTATION_INIT_STATUS: &str = "runboat/init-status";
pub const ANNOTATION_LAST_SCALED: &str = "runboat/last-scaled";

/// Held on the deployment until the cleanup job has run to completion; its removal is
/// what lets Kubernetes finally delete the deployment.
pub const FINALIZER: &str = "runboat/cleanup";

/// JSON-patch (RFC 6901) pointer to the `init-status` annotation. The `/` in the
/// annotation key is escaped as `~1`.
pub const PATCH_PATH_INIT_STATUS: &str = "/metadata/annotations/runboat~1init-status";
pub const PATCH_PATH_LAST_SCALED: &str = "/metadata/annotations/runboat~1last-scaled";
pub const PATCH_PATH_REPLICAS: &str = "/spec/replicas";
pub const PATCH_PATH_FINALIZERS: &str = "/metadata/finalizers";

/// The kind of one-shot job associated with a build.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobKind {
    Initialize,
    Cleanup,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Initialize => "initialize",
            JobKind::Cleanup => "cleanup",
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initialize" => Ok(JobKind::Initialize),
            "cleanup" => Ok(JobKind::Cleanup),
            other => Err(format!("unknown job kind {other:?}")),
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
