//! Post-push bundle snapshots.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument};

use super::locks::KeyedLocks;
use super::{now_ms, resolve_tip};
use crate::git::{git_bundle_create, git_for_each_ref};
use crate::metrics::{BundleKind, Metrics, Outcome};
use crate::records::{BundleMeta, BundleRecord, RecordStore, RepoContext};

/// Writes one `--all` bundle per push, labelled full on a fixed cadence.
///
/// Every bundle is self-contained; the full/incremental label only decides
/// where a restore starts.  Syncs of one repository run one at a time so each
/// plan sees the record written before it.
pub struct BundleSyncer {
    store: Arc<dyn RecordStore>,
    metrics: Arc<Metrics>,
    full_every: u32,
    timeout: Duration,
    locks: KeyedLocks<RepoContext>,
}

/// Whether the next bundle is full and when it is stamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BundlePlan {
    is_full: bool,
    created_at_ms: i64,
}

impl BundleSyncer {
    pub fn new(store: Arc<dyn RecordStore>, metrics: Arc<Metrics>, full_every: u32, timeout: Duration) -> Self {
        Self {
            store,
            metrics,
            full_every: full_every.max(1),
            timeout,
            locks: KeyedLocks::default(),
        }
    }

    /// Snapshot `repo_path` into a new bundle record.  Returns `None` when the
    /// repository has no refs yet.
    #[instrument(skip(self, repo_path), fields(%ctx))]
    pub async fn sync(&self, ctx: &RepoContext, repo_path: &Path) -> Result<Option<BundleRecord>> {
        let _guard = self.locks.lock(ctx).await;

        let refs = git_for_each_ref(repo_path, self.timeout)
            .await
            .context("list refs for bundle")?;
        if refs.is_empty() {
            debug!("repository has no refs; skipping bundle");
            return Ok(None);
        }

        let plan = self.plan(ctx).await?;
        let kind = if plan.is_full {
            BundleKind::Full
        } else {
            BundleKind::Incremental
        };

        let result = self.write_bundle(ctx, repo_path, plan, refs.len()).await;
        self.metrics.record_bundle_sync(kind, Outcome::of(&result));
        result.map(Some)
    }

    async fn plan(&self, ctx: &RepoContext) -> Result<BundlePlan> {
        let latest_full = self.store.latest_full_bundle(ctx).await?;
        let incrementals = self.store.incremental_bundles(ctx).await?;

        let full_created = latest_full.as_ref().map(|r| r.created_at_ms);
        let since_full = incrementals
            .iter()
            .filter(|r| full_created.map_or(true, |f| r.created_at_ms > f))
            .count();
        let newest = incrementals
            .iter()
            .map(|r| r.created_at_ms)
            .chain(full_created)
            .max();

        Ok(plan_next(full_created.is_some(), since_full, self.full_every, newest, now_ms()))
    }

    async fn write_bundle(
        &self,
        ctx: &RepoContext,
        repo_path: &Path,
        plan: BundlePlan,
        ref_count: usize,
    ) -> Result<BundleRecord> {
        let tmp = tempfile::Builder::new()
            .prefix("sovgit-bundle-")
            .tempdir()
            .context("failed to create temp dir for bundle")?;
        let bundle_path = tmp.path().join("snapshot.bundle");

        git_bundle_create(repo_path, &bundle_path, self.timeout)
            .await
            .context("git bundle create")?;
        let size = tokio::fs::metadata(&bundle_path)
            .await
            .context("failed to stat bundle file")?
            .len();
        let tip_commit = resolve_tip(repo_path, self.timeout)
            .await
            .context("resolve tip commit")?;

        let meta = BundleMeta {
            is_full: plan.is_full,
            tip_commit,
            ref_count,
            size,
            created_at_ms: plan.created_at_ms,
        };
        let record = self.store.put_bundle(ctx, &meta, &bundle_path).await?;

        info!(
            key = %record.key,
            is_full = meta.is_full,
            size,
            ref_count,
            tip = meta.tip_commit.as_deref().unwrap_or("-"),
            "bundle synced"
        );
        Ok(record)
    }
}

/// Full when no full bundle exists or `full_every - 1` incrementals already
/// follow the last one, so every `full_every`-th bundle is full.  Timestamps never go backwards relative to the
/// store so that ordering by creation time matches write order.
fn plan_next(
    has_full: bool,
    since_full: usize,
    full_every: u32,
    newest_ms: Option<i64>,
    now_ms: i64,
) -> BundlePlan {
    let is_full = !has_full || since_full + 1 >= full_every as usize;
    let created_at_ms = match newest_ms {
        Some(newest) if newest >= now_ms => newest + 1,
        _ => now_ms,
    };
    BundlePlan {
        is_full,
        created_at_ms,
    }
}
