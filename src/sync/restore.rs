//! Rebuilding a bare repository from stored bundles.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument};

use super::resolve_tip;
use crate::git::{git_clone_bare, git_fetch_bundle, ProcessError};
use crate::records::{BundleRecord, RecordStore, RepoContext};

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("no full bundle recorded for repository")]
    NoFullBundle,
    #[error("record store error")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error(transparent)]
    Git(#[from] ProcessError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RestoreError {
    fn store(err: anyhow::Error) -> Self {
        RestoreError::Store(err.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOutcome {
    pub bundles_applied: usize,
    pub tip_commit: Option<String>,
}

pub struct BundleRestorer {
    store: Arc<dyn RecordStore>,
    timeout: Duration,
}

impl BundleRestorer {
    pub fn new(store: Arc<dyn RecordStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Clone the newest full bundle into `target` and fetch every incremental
    /// bundle created strictly after it, oldest first.
    ///
    /// `target` must not exist or be an empty directory.  On error it may hold
    /// a partial clone and must be discarded.
    #[instrument(skip(self, target), fields(%ctx))]
    pub async fn restore(&self, ctx: &RepoContext, target: &Path) -> Result<RestoreOutcome, RestoreError> {
        let full = self
            .store
            .latest_full_bundle(ctx)
            .await
            .map_err(RestoreError::store)?
            .ok_or(RestoreError::NoFullBundle)?;

        let newer: Vec<BundleRecord> = self
            .store
            .incremental_bundles(ctx)
            .await
            .map_err(RestoreError::store)?
            .into_iter()
            .filter(|r| r.created_at_ms > full.created_at_ms)
            .collect();

        // Removed with everything in it on every exit path.
        let scratch = tempfile::Builder::new()
            .prefix("sovgit-restore-")
            .tempdir()?;

        let full_path = scratch.path().join("full.bundle");
        self.store
            .download_bundle(&full, &full_path)
            .await
            .map_err(RestoreError::store)?;
        git_clone_bare(&full_path, target, self.timeout).await?;
        tokio::fs::remove_file(&full_path).await?;
        debug!(key = %full.key, "full bundle cloned");

        for (i, record) in newer.iter().enumerate() {
            let path = scratch.path().join(format!("incr-{i}.bundle"));
            self.store
                .download_bundle(record, &path)
                .await
                .map_err(RestoreError::store)?;
            git_fetch_bundle(target, &path, self.timeout).await?;
            tokio::fs::remove_file(&path).await?;
            debug!(key = %record.key, "incremental bundle applied");
        }

        let tip_commit = resolve_tip(target, self.timeout).await?;
        let outcome = RestoreOutcome {
            bundles_applied: 1 + newer.len(),
            tip_commit,
        };
        info!(
            bundles_applied = outcome.bundles_applied,
            tip = outcome.tip_commit.as_deref().unwrap_or("-"),
            "repository restored"
        );
        Ok(outcome)
    }
}
