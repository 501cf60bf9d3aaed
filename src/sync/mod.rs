//! Mirroring bare repositories into the record store and rebuilding them.
//!
//! After every accepted push the [`SyncPushHook`] runs the [`RefSyncer`] and
//! the [`BundleSyncer`] side by side.  When a repository is missing on disk
//! the [`BundleRecoveryHook`] asks the [`BundleRestorer`] to rebuild it from
//! the newest full bundle and every incremental bundle written after it.

pub mod bundles;
pub mod hooks;
pub mod locks;
pub mod refs;
pub mod restore;

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

pub use bundles::BundleSyncer;
pub use hooks::{BundleRecoveryHook, SyncPushHook};
pub use refs::RefSyncer;
pub use restore::{BundleRestorer, RestoreError};

use crate::git::{git_for_each_ref, git_head_commit, ProcessError};

/// Commit a repository points at: `HEAD` when it resolves, else the first
/// branch by name, else the first ref by name.
pub async fn resolve_tip(repo_path: &Path, timeout: Duration) -> Result<Option<String>, ProcessError> {
    if let Some(commit) = git_head_commit(repo_path, timeout).await? {
        return Ok(Some(commit));
    }
    let refs = git_for_each_ref(repo_path, timeout).await?;
    Ok(fallback_tip(&refs))
}

fn fallback_tip(refs: &BTreeMap<String, String>) -> Option<String> {
    refs.iter()
        .find(|(name, _)| name.starts_with("refs/heads/"))
        .or_else(|| refs.iter().next())
        .map(|(_, oid)| oid.clone())
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Repositories built with real git for sync and HTTP tests.
#[cfg(test)]
pub(crate) mod fixtures {
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use crate::git::run_git;

    pub const T: Duration = Duration::from_secs(30);

    /// Non-bare work tree with identity configured and one commit on `main`.
    pub async fn work_tree(dir: &Path) -> PathBuf {
        let wt = dir.join("work");
        std::fs::create_dir_all(&wt).unwrap();
        run_git(["init", "--quiet", "-b", "main"], Some(&wt), T).await.unwrap();
        run_git(["config", "user.email", "t@example.com"], Some(&wt), T).await.unwrap();
        run_git(["config", "user.name", "t"], Some(&wt), T).await.unwrap();
        commit(&wt, "one").await;
        wt
    }

    /// Commit a file named `name` and return the new `HEAD`.
    pub async fn commit(wt: &Path, name: &str) -> String {
        std::fs::write(wt.join(name), name).unwrap();
        run_git(["add", name], Some(wt), T).await.unwrap();
        run_git(["commit", "--quiet", "-m", name], Some(wt), T).await.unwrap();
        head(wt).await
    }

    pub async fn head(repo: &Path) -> String {
        run_git(["rev-parse", "HEAD"], Some(repo), T)
            .await
            .unwrap()
            .stdout_str()
            .trim()
            .to_string()
    }

    /// Write a `--all` bundle of `repo` to `dest`.
    pub async fn bundle(repo: &Path, dest: &Path) {
        crate::git::git_bundle_create(repo, dest, T).await.unwrap();
    }
}
