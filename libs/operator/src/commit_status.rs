use async_trait::async_trait;

use crate::build::CommitInfo;

/// A commit-status state, mirroring the states a code forge's check-run API accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitStatusState {
    Pending,
    Success,
    Failure,
}

/// Out of scope: posting commit statuses to a code forge. The core only needs to fire
/// four notifications (deploy, initialize-started, initialize-succeeded,
/// initialize-failed); failure to post is logged, never fatal.
#[async_trait]
pub trait CommitStatusNotifier: Send + Sync {
    async fn notify(
        &self,
        commit_info: &CommitInfo,
        state: CommitStatusState,
        target_url: Option<&str>,
    );
}

/// Logs the notification instead of reaching out to a forge. Good enough for
/// deployments that don't wire in a real forge client, and for tests.
pub struct LoggingCommitStatusNotifier;

#[async_trait]
impl CommitStatusNotifier for LoggingCommitStatusNotifier {
    async fn notify(
        &self,
        commit_info: &CommitInfo,
        state: CommitStatusState,
        target_url: Option<&str>,
    ) {
        tracing::info!(
            repo = %commit_info.repo,
            target_branch = %commit_info.target_branch,
            pr = ?commit_info.pr,
            git_commit = %commit_info.git_commit,
            state = ?state,
            target_url,
            "commit status",
        );
    }
}
