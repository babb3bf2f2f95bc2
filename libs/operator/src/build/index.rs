use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::listener::{BuildEvent, BuildEventListener, WeakListener};
use super::model::{Build, BuildStatus, CommitInfo, InitStatus};

/// Filter predicates for [`BuildIndex::search`] / `Lifecycle::undeploy_builds`. Every
/// field is optional and predicates combine with AND. `target_branch` and `branch` are
/// deliberately distinct: `target_branch` also matches PRs opened against that branch,
/// `branch` additionally requires `pr IS NULL`.
#[derive(Clone, Debug, Default)]
pub struct SearchFilter {
    pub repo: Option<String>,
    pub target_branch: Option<String>,
    pub branch: Option<String>,
    pub pr: Option<u64>,
    pub name: Option<String>,
    pub status: Option<BuildStatus>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Descending,
    Ascending,
}

/// In-memory, process-local view of every build deployment in the cluster, kept up to
/// date by the deployment watcher and read by the reconcilers. Only the watcher ever
/// calls [`BuildIndex::add`]/[`BuildIndex::remove`] (single-writer discipline); readers
/// only ever see a consistent snapshot because updates replace a build wholesale.
pub struct BuildIndex {
    builds: RwLock<HashMap<String, Build>>,
    listeners: RwLock<Vec<WeakListener>>,
}

impl Default for BuildIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildIndex {
    pub fn new() -> Self {
        Self {
            builds: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Registers `listener` for future events. Held weakly: callers must keep their own
    /// `Arc` alive for as long as they want to keep receiving events.
    pub fn register_listener(&self, listener: &Arc<dyn BuildEventListener + Send + Sync>) {
        self.listeners.write().unwrap().push(Arc::downgrade(listener));
    }

    fn notify(&self, event: BuildEvent) {
        let mut listeners = self.listeners.write().unwrap();
        listeners.retain(|weak| {
            if let Some(listener) = weak.upgrade() {
                listener.on_build_event(&event);
                true
            } else {
                false
            }
        });
    }

    /// Inserts or updates a build. Fires [`BuildEvent::Modified`] only when the build is
    /// new or one of its tracked mutable fields actually changed, so reconcilers don't
    /// wake up on every watch resync.
    pub fn add(&self, build: Build) {
        let changed = {
            let mut builds = self.builds.write().unwrap();
            let changed = match builds.get(&build.name) {
                Some(existing) => !existing.mutable_fields_eq(&build),
                None => true,
            };
            builds.insert(build.name.clone(), build.clone());
            changed
        };
        if changed {
            self.notify(BuildEvent::Modified(build));
        }
    }

    pub fn remove(&self, name: &str) {
        let removed = self.builds.write().unwrap().remove(name);
        if let Some(build) = removed {
            self.notify(BuildEvent::Removed(build));
        }
    }

    /// Drops every tracked build without firing events, used when a watcher restarts
    /// and must rebuild the index from a fresh list+watch from scratch.
    pub fn reset(&self) {
        self.builds.write().unwrap().clear();
    }

    pub fn get(&self, name: &str) -> Option<Build> {
        self.builds.read().unwrap().get(name).cloned()
    }

    pub fn get_for_commit(&self, commit_info: &CommitInfo) -> Option<Build> {
        self.builds
            .read()
            .unwrap()
            .values()
            .find(|b| &b.commit_info == commit_info)
            .cloned()
    }

    pub fn count_by_status(&self, status: BuildStatus) -> usize {
        self.builds
            .read()
            .unwrap()
            .values()
            .filter(|b| b.status == status)
            .count()
    }

    pub fn count_by_init_status(&self, init_status: InitStatus) -> usize {
        self.builds
            .read()
            .unwrap()
            .values()
            .filter(|b| b.init_status == init_status)
            .count()
    }

    pub fn count_all(&self) -> usize {
        self.builds.read().unwrap().len()
    }

    /// Builds that occupy "deployed" capacity: anything that isn't already undeploying.
    pub fn count_deployed(&self) -> usize {
        self.builds
            .read()
            .unwrap()
            .values()
            .filter(|b| b.status != BuildStatus::Undeploying)
            .count()
    }

    /// Builds whose `init-status` is `todo`, oldest first: the initializer reconciler's
    /// work queue.
    pub fn to_initialize(&self) -> Vec<Build> {
        let mut builds: Vec<Build> = self
            .builds
            .read()
            .unwrap()
            .values()
            .filter(|b| b.init_status == InitStatus::Todo)
            .cloned()
            .collect();
        builds.sort_by_key(|b| b.created);
        builds
    }

    /// Started builds, oldest `last_scaled` first: candidates to stop when over the
    /// started-capacity ceiling.
    pub fn oldest_started(&self) -> Vec<Build> {
        let mut builds: Vec<Build> = self
            .builds
            .read()
            .unwrap()
            .values()
            .filter(|b| b.status == BuildStatus::Started)
            .cloned()
            .collect();
        builds.sort_by_key(|b| b.last_scaled.unwrap_or(b.created));
        builds
    }

    /// Evictable builds (stopped/stopping/failed) ordered oldest-created first, with
    /// `protect_newest_per_group` excluded: the most recent build for each
    /// `(repo, target_branch)` group with `pr IS NULL` is never offered for eviction,
    /// so a branch always keeps at least one deployable build around. PR builds carry
    /// no such protection -- a lone stopped PR build is always evictable.
    pub fn oldest_stopped(&self, protect_newest_per_group: bool) -> Vec<Build> {
        let builds = self.builds.read().unwrap();
        let mut newest_per_branch: HashMap<(String, String), &Build> = HashMap::new();
        if protect_newest_per_group {
            for build in builds.values() {
                if build.commit_info.pr.is_some() {
                    continue;
                }
                let key = (
                    build.commit_info.repo.clone(),
                    build.commit_info.target_branch.clone(),
                );
                newest_per_branch
                    .entry(key)
                    .and_modify(|current| {
                        if build.created > current.created {
                            *current = build;
                        }
                    })
                    .or_insert(build);
            }
        }

        let mut evictable: Vec<Build> = builds
            .values()
            .filter(|b| b.status.is_evictable())
            .filter(|b| {
                if !protect_newest_per_group || b.commit_info.pr.is_some() {
                    return true;
                }
                let key = (
                    b.commit_info.repo.clone(),
                    b.commit_info.target_branch.clone(),
                );
                newest_per_branch.get(&key).map(|newest| newest.name != b.name).unwrap_or(true)
            })
            .cloned()
            .collect();
        evictable.sort_by_key(|b| b.last_scaled.unwrap_or(b.created));
        evictable
    }

    /// Builds currently undeploying whose cleanup job has finished: ready for the
    /// finalizer to be removed.
    pub fn to_cleanup(&self) -> Vec<Build> {
        let mut builds: Vec<Build> = self
            .builds
            .read()
            .unwrap()
            .values()
            .filter(|b| b.status == BuildStatus::Undeploying)
            .cloned()
            .collect();
        builds.sort_by_key(|b| b.created);
        builds
    }

    /// Filtered, ordered search over every field the Lifecycle API's `undeploy_builds`
    /// and status views need. `target_branch` matches PR and non-PR builds alike;
    /// `branch` additionally requires `pr IS NULL` (see `SearchFilter` docs).
    pub fn search(&self, filter: &SearchFilter, order: SortOrder) -> Vec<Build> {
        let mut results: Vec<Build> = self
            .builds
            .read()
            .unwrap()
            .values()
            .filter(|b| filter.repo.as_deref().map_or(true, |r| b.commit_info.repo == r.to_lowercase()))
            .filter(|b| {
                filter
                    .target_branch
                    .as_deref()
                    .map_or(true, |t| b.commit_info.target_branch == t)
            })
            .filter(|b| {
                filter
                    .branch
                    .as_deref()
                    .map_or(true, |br| b.commit_info.target_branch == br && b.commit_info.pr.is_none())
            })
            .filter(|b| filter.pr.map_or(true, |pr| b.commit_info.pr == Some(pr)))
            .filter(|b| filter.name.as_deref().map_or(true, |n| b.name == n))
            .filter(|b| filter.status.map_or(true, |s| b.status == s))
            .cloned()
            .collect();

        results.sort_by(|a, b| {
            let key = |build: &Build| {
                (
                    build.commit_info.repo.clone(),
                    build.commit_info.pr.unwrap_or(u64::MAX),
                    build.commit_info.target_branch.clone(),
                    build.created,
                )
            };
            key(a).cmp(&key(b))
        });
        if order == SortOrder::Descending {
            results.reverse();
        }
        results
    }

    /// Distinct repos currently tracked, for the repo-listing API.
    pub fn repos(&self) -> Vec<String> {
        let mut repos: Vec<String> = self
            .builds
            .read()
            .unwrap()
            .values()
            .map(|b| b.commit_info.repo.clone())
            .collect();
        repos.sort();
        repos.dedup();
        repos
    }

    pub fn all(&self) -> Vec<Build> {
        self.builds.read().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn build(name: &str, status: BuildStatus, created_secs: i64) -> Build {
        Build {
            name: name.to_string(),
            deployment_name: name.to_string(),
            commit_info: CommitInfo::new("oca/repo", "16.0", None, "abc123"),
            status,
            init_status: InitStatus::Succeeded,
            desired_replicas: 1,
            last_scaled: None,
            created: Utc.timestamp_opt(created_secs, 0).unwrap(),
        }
    }

    #[test]
    fn add_fires_modified_only_on_real_change() {
        struct Counter(Arc<std::sync::atomic::AtomicUsize>);
        impl BuildEventListener for Counter {
            fn on_build_event(&self, _event: &BuildEvent) {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let index = BuildIndex::new();
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter: Arc<dyn BuildEventListener + Send + Sync> = Arc::new(Counter(count.clone()));
        index.register_listener(&counter);

        let b = build("b1", BuildStatus::Started, 1);
        index.add(b.clone());
        index.add(b.clone());

        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn oldest_stopped_protects_newest_per_group() {
        let index = BuildIndex::new();
        index.add(build("b1", BuildStatus::Stopped, 1));
        index.add(build("b2", BuildStatus::Stopped, 2));

        let protected = index.oldest_stopped(true);
        assert_eq!(protected.len(), 1);
        assert_eq!(protected[0].name, "b1");

        let unprotected = index.oldest_stopped(false);
        assert_eq!(unprotected.len(), 2);
    }

    #[test]
    fn oldest_stopped_never_protects_pr_builds() {
        let index = BuildIndex::new();
        let mut pr = build_with_commit(
            "pr1",
            CommitInfo::new("oca/repo", "16.0", Some(7), "a1"),
            1,
        );
        pr.status = BuildStatus::Stopped;
        index.add(pr);

        let evictable = index.oldest_stopped(true);
        assert_eq!(evictable.len(), 1);
        assert_eq!(evictable[0].name, "pr1");
    }

    #[test]
    fn to_initialize_sorted_oldest_first() {
        let index = BuildIndex::new();
        let mut b1 = build("b1", BuildStatus::Initializing, 5);
        b1.init_status = InitStatus::Todo;
        let mut b2 = build("b2", BuildStatus::Initializing, 2);
        b2.init_status = InitStatus::Todo;
        index.add(b1);
        index.add(b2);

        let queue = index.to_initialize();
        assert_eq!(queue.iter().map(|b| b.name.as_str()).collect::<Vec<_>>(), vec!["b2", "b1"]);
    }

    fn build_with_commit(name: &str, ci: CommitInfo, created_secs: i64) -> Build {
        let mut b = build(name, BuildStatus::Started, created_secs);
        b.commit_info = ci;
        b
    }

    #[test]
    fn branch_filter_excludes_prs_target_branch_includes_them() {
        let index = BuildIndex::new();
        index.add(build_with_commit(
            "branch-build",
            CommitInfo::new("oca/repo", "16.0", None, "a1"),
            1,
        ));
        index.add(build_with_commit(
            "pr-build",
            CommitInfo::new("oca/repo", "16.0", Some(42), "b2"),
            2,
        ));

        let target_branch = index.search(
            &SearchFilter {
                target_branch: Some("16.0".to_string()),
                ..Default::default()
            },
            SortOrder::Ascending,
        );
        assert_eq!(target_branch.len(), 2);

        let branch_only = index.search(
            &SearchFilter {
                branch: Some("16.0".to_string()),
                ..Default::default()
            },
            SortOrder::Ascending,
        );
        assert_eq!(branch_only.iter().map(|b| b.name.as_str()).collect::<Vec<_>>(), vec!["branch-build"]);
    }

    #[test]
    fn search_orders_descending_by_default() {
        let index = BuildIndex::new();
        index.add(build_with_commit("older", CommitInfo::new("oca/repo", "16.0", None, "a1"), 1));
        index.add(build_with_commit("newer", CommitInfo::new("oca/repo", "16.0", None, "b2"), 2));

        let results = index.search(&SearchFilter::default(), SortOrder::Descending);
        assert_eq!(results.iter().map(|b| b.name.as_str()).collect::<Vec<_>>(), vec!["newer", "older"]);
    }
}
