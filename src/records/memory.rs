//! In-memory [`RecordStore`] for tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};

use super::{BundleMeta, BundleRecord, Collaborator, RecordStore, RefSnapshot, RepoContext};

#[derive(Default)]
pub struct MemoryRecordStore {
    bundles: Mutex<HashMap<RepoContext, Vec<(BundleRecord, Vec<u8>)>>>,
    refs: Mutex<HashMap<RepoContext, RefSnapshot>>,
    collaborators: Mutex<HashMap<RepoContext, Vec<Collaborator>>>,
}

impl MemoryRecordStore {
    pub fn set_collaborators(&self, ctx: &RepoContext, list: Vec<Collaborator>) {
        self.collaborators.lock().unwrap().insert(ctx.clone(), list);
    }

    pub fn refs(&self, ctx: &RepoContext) -> Option<RefSnapshot> {
        self.refs.lock().unwrap().get(ctx).cloned()
    }

    pub fn bundles(&self, ctx: &RepoContext) -> Vec<BundleRecord> {
        let mut out: Vec<BundleRecord> = self
            .bundles
            .lock()
            .unwrap()
            .get(ctx)
            .map(|v| v.iter().map(|(r, _)| r.clone()).collect())
            .unwrap_or_default();
        out.sort_by_key(|r| r.created_at_ms);
        out
    }
}

#[async_trait::async_trait]
impl RecordStore for MemoryRecordStore {
    async fn put_refs(&self, ctx: &RepoContext, snapshot: &RefSnapshot) -> Result<()> {
        self.refs.lock().unwrap().insert(ctx.clone(), snapshot.clone());
        Ok(())
    }

    async fn put_bundle(&self, ctx: &RepoContext, meta: &BundleMeta, file: &Path) -> Result<BundleRecord> {
        let bytes = tokio::fs::read(file).await.context("read bundle")?;
        let mut all = self.bundles.lock().unwrap();
        let list = all.entry(ctx.clone()).or_default();
        let record = BundleRecord {
            key: format!("{ctx}#{}", list.len()),
            is_full: meta.is_full,
            tip_commit: meta.tip_commit.clone(),
            ref_count: Some(meta.ref_count),
            size: bytes.len() as u64,
            created_at_ms: meta.created_at_ms,
        };
        list.push((record.clone(), bytes));
        Ok(record)
    }

    async fn latest_full_bundle(&self, ctx: &RepoContext) -> Result<Option<BundleRecord>> {
        Ok(self
            .bundles(ctx)
            .into_iter()
            .filter(|r| r.is_full)
            .max_by_key(|r| r.created_at_ms))
    }

    async fn incremental_bundles(&self, ctx: &RepoContext) -> Result<Vec<BundleRecord>> {
        Ok(self.bundles(ctx).into_iter().filter(|r| !r.is_full).collect())
    }

    async fn download_bundle(&self, record: &BundleRecord, dest: &Path) -> Result<()> {
        let bytes = self
            .bundles
            .lock()
            .unwrap()
            .values()
            .flatten()
            .find(|(r, _)| r.key == record.key)
            .map(|(_, b)| b.clone())
            .ok_or_else(|| anyhow!("no such bundle: {}", record.key))?;
        tokio::fs::write(dest, bytes).await.context("write bundle")?;
        Ok(())
    }

    async fn collaborators(&self, ctx: &RepoContext) -> Result<Vec<Collaborator>> {
        Ok(self
            .collaborators
            .lock()
            .unwrap()
            .get(ctx)
            .cloned()
            .unwrap_or_default())
    }
}
