use std::sync::Weak;

use super::model::Build;

/// What happened to a build as observed by [`super::index::BuildIndex`].
#[derive(Clone, Debug)]
pub enum BuildEvent {
    /// The build was added, or one of its tracked fields (status, init-status,
    /// desired replicas, last-scaled) changed.
    Modified(Build),
    /// The underlying deployment was deleted.
    Removed(Build),
}

/// Implemented by reconcilers that need to wake up when the index changes. The index
/// holds listeners weakly: a reconciler that is dropped (or never started) simply stops
/// receiving events instead of leaking a registration.
pub trait BuildEventListener {
    fn on_build_event(&self, event: &BuildEvent);
}

pub type WeakListener = Weak<dyn BuildEventListener + Send + Sync>;
