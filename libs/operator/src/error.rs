/// All errors possible to occur while reconciling builds.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Any error originating from the `kube-rs` crate.
    #[error("Kubernetes reported error: {0}")]
    Kube(#[from] kube::Error),

    /// A deployment annotation required to reconstruct a [`crate::build::Build`] was
    /// missing.
    #[error("deployment {deployment} is missing required annotation/label {key}")]
    MissingAnnotation { deployment: String, key: String },

    /// A deployment annotation held a value outside the closed set this implementation
    /// understands.
    #[error("deployment {deployment} has invalid value {value:?} for annotation {key}")]
    InvalidAnnotation {
        deployment: String,
        key: String,
        value: String,
    },

    /// Failure while serializing a manifest or patch body.
    #[error("failed to serialize: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The injected [`crate::manifest::ManifestRenderer`] failed to produce a manifest
    /// bundle for a build.
    #[error("failed to render manifests for build {build}: {reason}")]
    ManifestRender { build: String, reason: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
