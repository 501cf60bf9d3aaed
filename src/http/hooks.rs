//! Extension points the smart HTTP handler calls out to.

use std::path::Path;

use crate::records::RepoContext;

/// Materialises a repository that is missing on disk.
#[async_trait::async_trait]
pub trait Restorer: Send + Sync {
    /// Returns `true` once a usable bare repository exists at `path`.
    async fn restore(&self, ctx: &RepoContext, path: &Path) -> bool;
}

/// Runs after `receive-pack` exits successfully.  Runs detached from the
/// response; it cannot fail the push.
#[async_trait::async_trait]
pub trait PushHook: Send + Sync {
    async fn on_push_complete(&self, pusher: &str, ctx: &RepoContext, path: &Path);
}
