//! Record store: durable, owner-addressed storage for ref snapshots, git
//! bundles, and collaborator records.
//!
//! The server only talks to the store through [`RecordStore`].  The production
//! implementation is [`s3::S3RecordStore`]; tests use an in-memory store.

#[cfg(test)]
pub mod memory;
pub mod s3;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub use s3::S3RecordStore;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Scope of every record: one repository of one owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepoContext {
    pub owner: String,
    pub repo: String,
}

impl RepoContext {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
        }
    }
}

impl fmt::Display for RepoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// Tags written alongside a new bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleMeta {
    pub is_full: bool,
    pub tip_commit: Option<String>,
    pub ref_count: usize,
    pub size: u64,
    pub created_at_ms: i64,
}

/// A stored bundle as listed by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleRecord {
    /// Store-specific locator passed back to [`RecordStore::download_bundle`].
    pub key: String,
    pub is_full: bool,
    /// Not every listing carries tags; `None` when unknown.
    pub tip_commit: Option<String>,
    pub ref_count: Option<usize>,
    pub size: u64,
    pub created_at_ms: i64,
}

/// Mirror of a repository's refs after a push.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefSnapshot {
    /// Target of the symbolic `HEAD`, e.g. `refs/heads/main`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<String>,
    pub refs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pusher: Option<String>,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Read,
    Write,
    Admin,
}

impl Role {
    pub fn can_push(self) -> bool {
        self >= Role::Write
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collaborator {
    pub did: String,
    pub role: Role,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    /// Replace the ref mirror for `ctx`.
    async fn put_refs(&self, ctx: &RepoContext, snapshot: &RefSnapshot) -> Result<()>;

    /// Store the bundle file at `file` as a new, immutable record.
    async fn put_bundle(&self, ctx: &RepoContext, meta: &BundleMeta, file: &Path) -> Result<BundleRecord>;

    /// Most recently created full bundle, if any.
    async fn latest_full_bundle(&self, ctx: &RepoContext) -> Result<Option<BundleRecord>>;

    /// Every incremental bundle, ascending by creation time.
    async fn incremental_bundles(&self, ctx: &RepoContext) -> Result<Vec<BundleRecord>>;

    async fn download_bundle(&self, record: &BundleRecord, dest: &Path) -> Result<()>;

    /// Collaborator records for `ctx`; an absent list is empty.
    async fn collaborators(&self, ctx: &RepoContext) -> Result<Vec<Collaborator>>;
}
