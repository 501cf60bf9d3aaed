//! Hook implementations wiring the sync machinery into the HTTP layer.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, instrument, warn};

use super::locks::KeyedLocks;
use super::{BundleRestorer, BundleSyncer, RefSyncer, RestoreError};
use crate::git::validate_bare_repo;
use crate::http::hooks::{PushHook, Restorer};
use crate::metrics::{Metrics, Outcome};
use crate::records::RepoContext;

/// Prefix for restore staging directories.  Starts with `.git`, so it can
/// never collide with a valid repository name.
const STAGING_PREFIX: &str = ".git-restore-";

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

/// Restores missing repositories from bundles.
///
/// Restores of one path are serialised; a caller that waited on the lock
/// finds the repository already in place.  Each restore clones into a
/// staging directory next to the target and is renamed in only on success.
pub struct BundleRecoveryHook {
    restorer: BundleRestorer,
    metrics: Arc<Metrics>,
    locks: KeyedLocks<PathBuf>,
}

impl BundleRecoveryHook {
    pub fn new(restorer: BundleRestorer, metrics: Arc<Metrics>) -> Self {
        Self {
            restorer,
            metrics,
            locks: KeyedLocks::default(),
        }
    }

    async fn restore_into_place(&self, ctx: &RepoContext, path: &Path) -> Result<bool> {
        let parent = path
            .parent()
            .context("repository path has no parent")?;
        let staging = stage_in(parent).await?;

        match self.restorer.restore(ctx, staging.path()).await {
            Ok(outcome) => {
                tokio::fs::rename(staging.path(), path)
                    .await
                    .context("failed to move restored repository into place")?;
                info!(
                    bundles_applied = outcome.bundles_applied,
                    tip = outcome.tip_commit.as_deref().unwrap_or("-"),
                    "repository recovered from bundles"
                );
                Ok(true)
            }
            Err(RestoreError::NoFullBundle) => {
                info!("no bundles recorded; repository unknown");
                drop(staging);
                // Only succeeds when the owner directory is empty.
                let _ = tokio::fs::remove_dir(parent).await;
                Ok(false)
            }
            Err(e) => Err(e).context("restore from bundles failed"),
        }
    }
}

#[async_trait::async_trait]
impl Restorer for BundleRecoveryHook {
    #[instrument(skip(self, path), fields(%ctx))]
    async fn restore(&self, ctx: &RepoContext, path: &Path) -> bool {
        let _guard = self.locks.lock(&path.to_path_buf()).await;

        if validate_bare_repo(path).await {
            return true;
        }
        match self.restore_into_place(ctx, path).await {
            Ok(restored) => {
                if restored {
                    self.metrics.record_restore(Outcome::Success);
                }
                restored
            }
            Err(e) => {
                self.metrics.record_restore(Outcome::Failure);
                error!(error = %format!("{e:#}"), "repository recovery failed");
                false
            }
        }
    }
}

/// Create `parent` and a staging directory inside it.
///
/// Restores of other repositories under the same owner may remove an empty
/// `parent` between the two steps, so a vanished parent is recreated once.
async fn stage_in(parent: &Path) -> Result<tempfile::TempDir> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;

        match tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(parent)
        {
            Ok(staging) => return Ok(staging),
            Err(e) if e.kind() == io::ErrorKind::NotFound && attempt < 3 => {
                warn!(parent = %parent.display(), "owner directory vanished; retrying");
            }
            Err(e) => return Err(e).context("failed to create restore staging directory"),
        }
    }
}

// ---------------------------------------------------------------------------
// Post-push
// ---------------------------------------------------------------------------

/// Runs ref and bundle sync concurrently after a push.  Failures are logged
/// and counted; they never reach the pusher.
pub struct SyncPushHook {
    refs: RefSyncer,
    bundles: BundleSyncer,
}

impl SyncPushHook {
    pub fn new(refs: RefSyncer, bundles: BundleSyncer) -> Self {
        Self { refs, bundles }
    }
}

#[async_trait::async_trait]
impl PushHook for SyncPushHook {
    #[instrument(skip(self, path), fields(%ctx, %pusher))]
    async fn on_push_complete(&self, pusher: &str, ctx: &RepoContext, path: &Path) {
        let (refs, bundle) = tokio::join!(
            self.refs.sync(ctx, path, Some(pusher)),
            self.bundles.sync(ctx, path),
        );

        if let Err(e) = refs {
            warn!(error = %format!("{e:#}"), "ref sync failed");
        }
        if let Err(e) = bundle {
            warn!(error = %format!("{e:#}"), "bundle sync failed");
        }
    }
}
