//! Post-push ref mirroring.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument};

use super::now_ms;
use crate::git::{git_for_each_ref, git_head_symref};
use crate::metrics::{Metrics, Outcome};
use crate::records::{RecordStore, RefSnapshot, RepoContext};

pub struct RefSyncer {
    store: Arc<dyn RecordStore>,
    metrics: Arc<Metrics>,
    timeout: Duration,
}

impl RefSyncer {
    pub fn new(store: Arc<dyn RecordStore>, metrics: Arc<Metrics>, timeout: Duration) -> Self {
        Self {
            store,
            metrics,
            timeout,
        }
    }

    /// Read every ref and the symbolic `HEAD` and replace the stored mirror.
    #[instrument(skip(self, repo_path), fields(%ctx))]
    pub async fn sync(&self, ctx: &RepoContext, repo_path: &Path, pusher: Option<&str>) -> Result<RefSnapshot> {
        let result = self.sync_inner(ctx, repo_path, pusher).await;
        self.metrics.record_ref_sync(Outcome::of(&result));
        result
    }

    async fn sync_inner(&self, ctx: &RepoContext, repo_path: &Path, pusher: Option<&str>) -> Result<RefSnapshot> {
        let refs = git_for_each_ref(repo_path, self.timeout)
            .await
            .context("list refs")?;
        let head = git_head_symref(repo_path, self.timeout)
            .await
            .context("read HEAD")?;

        let snapshot = RefSnapshot {
            head,
            refs,
            pusher: pusher.map(str::to_string),
            updated_at_ms: now_ms(),
        };
        self.store.put_refs(ctx, &snapshot).await?;

        info!(refs = snapshot.refs.len(), "refs synced");
        Ok(snapshot)
    }
}
