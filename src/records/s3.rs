//! S3-backed [`RecordStore`].
//!
//! Layout under the configured prefix:
//!
//! ```text
//! {prefix}{owner}/{repo}/refs.json
//! {prefix}{owner}/{repo}/collaborators.json
//! {prefix}{owner}/{repo}/bundles/{created_ms:020}-{full|incr}-{suffix}.bundle
//! ```
//!
//! Creation time and kind are encoded in the bundle key so a single listing
//! is enough to order the lineage; the remaining tags ride along as object
//! metadata.

use std::path::Path;

use anyhow::{Context, Result};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use rand::RngCore;
use tracing::{debug, instrument};

use super::{BundleMeta, BundleRecord, Collaborator, RecordStore, RefSnapshot, RepoContext};

const META_TIP_COMMIT: &str = "tip-commit";
const META_REF_COUNT: &str = "ref-count";
const META_IS_FULL: &str = "is-full";
const META_CREATED_AT: &str = "created-at";

pub struct S3RecordStore {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3RecordStore {
    pub fn new(client: Client, bucket: String, prefix: String) -> Self {
        Self {
            client,
            bucket,
            prefix,
        }
    }

    fn repo_prefix(&self, ctx: &RepoContext) -> String {
        format!("{}{}/{}/", self.prefix, ctx.owner, ctx.repo)
    }

    fn bundle_prefix(&self, ctx: &RepoContext) -> String {
        format!("{}bundles/", self.repo_prefix(ctx))
    }

    /// List every bundle for `ctx`, ascending by creation time.
    async fn list_bundle_records(&self, ctx: &RepoContext) -> Result<Vec<BundleRecord>> {
        let prefix = self.bundle_prefix(ctx);
        let mut records = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix);
            if let Some(ref token) = continuation_token {
                req = req.continuation_token(token);
            }

            let resp = req.send().await.context("S3 ListObjectsV2")?;

            for obj in resp.contents() {
                let Some(key) = obj.key() else { continue };
                let Some((created_at_ms, is_full)) = parse_bundle_key(key) else {
                    debug!(%key, "skipping unrecognised object under bundle prefix");
                    continue;
                };
                records.push(BundleRecord {
                    key: key.to_string(),
                    is_full,
                    tip_commit: None,
                    ref_count: None,
                    size: obj.size().unwrap_or(0).max(0) as u64,
                    created_at_ms,
                });
            }

            match resp.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }

        // Zero-padded timestamps sort lexically, but keys from other writers
        // are not guaranteed to share the listing order.
        records.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.key.cmp(&b.key))
        });
        debug!(count = records.len(), "listed bundles");
        Ok(records)
    }

    /// Fill in tags from object metadata.
    async fn with_metadata(&self, mut record: BundleRecord) -> Result<BundleRecord> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&record.key)
            .send()
            .await
            .context("S3 HeadObject")?;

        if let Some(meta) = head.metadata() {
            record.tip_commit = meta.get(META_TIP_COMMIT).filter(|s| !s.is_empty()).cloned();
            record.ref_count = meta.get(META_REF_COUNT).and_then(|s| s.parse().ok());
        }
        Ok(record)
    }

    async fn put_json(&self, key: String, body: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(body))
            .content_type("application/json")
            .send()
            .await
            .with_context(|| format!("S3 PutObject {key}"))?;
        Ok(())
    }
}

/// Parse `…/{created_ms}-{full|incr}-{suffix}.bundle` into
/// `(created_ms, is_full)`.
fn parse_bundle_key(key: &str) -> Option<(i64, bool)> {
    let name = key.rsplit('/').next()?.strip_suffix(".bundle")?;
    let mut parts = name.splitn(3, '-');
    let created = parts.next()?.parse::<i64>().ok()?;
    let is_full = match parts.next()? {
        "full" => true,
        "incr" => false,
        _ => return None,
    };
    parts.next().filter(|s| !s.is_empty())?;
    Some((created, is_full))
}

fn bundle_file_name(meta: &BundleMeta) -> String {
    let mut suffix = [0u8; 4];
    rand::rngs::OsRng.fill_bytes(&mut suffix);
    format!(
        "{:020}-{}-{}.bundle",
        meta.created_at_ms.max(0),
        if meta.is_full { "full" } else { "incr" },
        hex::encode(suffix)
    )
}

#[async_trait::async_trait]
impl RecordStore for S3RecordStore {
    #[instrument(skip(self, snapshot), fields(%ctx))]
    async fn put_refs(&self, ctx: &RepoContext, snapshot: &RefSnapshot) -> Result<()> {
        let body = serde_json::to_vec_pretty(snapshot).context("serialize ref snapshot")?;
        self.put_json(format!("{}refs.json", self.repo_prefix(ctx)), body)
            .await?;
        debug!(refs = snapshot.refs.len(), "ref snapshot stored");
        Ok(())
    }

    #[instrument(skip(self, meta, file), fields(%ctx, is_full = meta.is_full))]
    async fn put_bundle(&self, ctx: &RepoContext, meta: &BundleMeta, file: &Path) -> Result<BundleRecord> {
        let key = format!("{}{}", self.bundle_prefix(ctx), bundle_file_name(meta));
        let body = ByteStream::from_path(file)
            .await
            .with_context(|| format!("open bundle for upload: {}", file.display()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body)
            .content_type("application/x-git-bundle")
            .metadata(META_TIP_COMMIT, meta.tip_commit.clone().unwrap_or_default())
            .metadata(META_REF_COUNT, meta.ref_count.to_string())
            .metadata(META_IS_FULL, meta.is_full.to_string())
            .metadata(META_CREATED_AT, meta.created_at_ms.to_string())
            .send()
            .await
            .context("S3 PutObject bundle")?;

        debug!(%key, size = meta.size, "bundle uploaded");
        Ok(BundleRecord {
            key,
            is_full: meta.is_full,
            tip_commit: meta.tip_commit.clone(),
            ref_count: Some(meta.ref_count),
            size: meta.size,
            created_at_ms: meta.created_at_ms,
        })
    }

    #[instrument(skip(self), fields(%ctx))]
    async fn latest_full_bundle(&self, ctx: &RepoContext) -> Result<Option<BundleRecord>> {
        let latest = self
            .list_bundle_records(ctx)
            .await?
            .into_iter()
            .filter(|r| r.is_full)
            .last();
        match latest {
            Some(record) => Ok(Some(self.with_metadata(record).await?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(%ctx))]
    async fn incremental_bundles(&self, ctx: &RepoContext) -> Result<Vec<BundleRecord>> {
        Ok(self
            .list_bundle_records(ctx)
            .await?
            .into_iter()
            .filter(|r| !r.is_full)
            .collect())
    }

    #[instrument(skip(self, record), fields(key = %record.key))]
    async fn download_bundle(&self, record: &BundleRecord, dest: &Path) -> Result<()> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&record.key)
            .send()
            .await
            .context("S3 GetObject")?;

        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("create {}", dest.display()))?;
        let mut body = resp.body.into_async_read();
        let bytes = tokio::io::copy(&mut body, &mut file)
            .await
            .context("stream S3 GetObject body to disk")?;
        file.sync_all().await.context("flush downloaded bundle")?;

        debug!(path = %dest.display(), bytes, "bundle downloaded");
        Ok(())
    }

    #[instrument(skip(self), fields(%ctx))]
    async fn collaborators(&self, ctx: &RepoContext) -> Result<Vec<Collaborator>> {
        let key = format!("{}collaborators.json", self.repo_prefix(ctx));
        let resp = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) if err.as_service_error().is_some_and(|e| e.is_no_such_key()) => {
                debug!("no collaborator record");
                return Ok(Vec::new());
            }
            Err(err) => return Err(err).context("S3 GetObject collaborators"),
        };

        let bytes = resp
            .body
            .collect()
            .await
            .context("read collaborators body")?
            .into_bytes();
        serde_json::from_slice(&bytes).context("parse collaborators.json")
    }
}
