//! Bare Git repository lifecycle helpers.
//!
//! Repositories are created by recovery or by `sovgit init`, and never
//! deleted by the server.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use super::commands::GitCommand;

// ---------------------------------------------------------------------------
// Init
// ---------------------------------------------------------------------------

/// Initialise a new bare Git repository at `path`.
///
/// Creates missing parents.  A no-op when `path` already holds a bare repo.
#[instrument(fields(path = %path.display()))]
pub async fn init_bare_repo(path: &Path, timeout: Duration) -> Result<()> {
    if validate_bare_repo(path).await {
        debug!("bare repo already exists; skipping init");
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create parent directory: {}", parent.display()))?;
    }

    GitCommand::new(["init", "--bare", "--quiet"])
        .arg(path)
        .run(timeout)
        .await
        .context("git init --bare failed")?;

    debug!("bare repo initialised");
    Ok(())
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

/// Check whether `path` looks like a bare Git repository.
///
/// A bare repo is a directory with a `HEAD` file.  This is a cheap heuristic,
/// not an integrity check.
pub async fn validate_bare_repo(path: &Path) -> bool {
    let is_dir = tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if !is_dir {
        return false;
    }

    let head_exists = tokio::fs::metadata(path.join("HEAD"))
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);
    if !head_exists {
        debug!(path = %path.display(), "directory has no HEAD file");
        return false;
    }

    let objects_ok = tokio::fs::metadata(path.join("objects"))
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if !objects_ok {
        warn!(path = %path.display(), "HEAD exists but objects/ is missing");
    }

    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
