//! Mapping of `(owner identity, repository name)` to an on-disk bare repo.
//!
//! Repositories live at `{base}/{owner}/{repo}`.  Names are validated before
//! any filesystem access, and the resulting path is checked for containment
//! after resolving symlinks in the longest existing prefix of both the base
//! and the candidate path.

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Maximum accepted length for a repository name.
const MAX_REPO_NAME_LEN: usize = 100;
/// Maximum accepted length for an owner identity.
const MAX_OWNER_LEN: usize = 256;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("invalid repository name")]
    InvalidRepositoryName,
    #[error("invalid owner identity")]
    InvalidOwner,
    #[error("resolved path escapes the repository base directory")]
    EscapesBase,
    #[error("failed to resolve repository path: {0}")]
    Io(#[from] std::io::Error),
}

/// Validate a repository name.
///
/// Accepts `^[A-Za-z0-9._-]+$` except `.`, `..`, and anything starting with
/// `.git` (which would collide with git's own metadata names).
pub fn validate_repo_name(name: &str) -> Result<(), PathError> {
    let valid_chars = !name.is_empty()
        && name.len() <= MAX_REPO_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));

    if !valid_chars || name == "." || name == ".." || name.starts_with(".git") {
        return Err(PathError::InvalidRepositoryName);
    }
    Ok(())
}

/// Validate an owner identity such as `did:plc:abc123` or
/// `did:web:example.com%3A8443`.
///
/// Identities become one directory level on disk, so separators, traversal
/// components, and control bytes are refused outright.
pub fn validate_owner(owner: &str) -> Result<(), PathError> {
    let mut parts = owner.splitn(3, ':');
    let (Some("did"), Some(method), Some(specific)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(PathError::InvalidOwner);
    };

    let method_ok = !method.is_empty()
        && method
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
    let specific_ok = !specific.is_empty()
        && !specific.ends_with(':')
        && specific
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-' | b':' | b'%'));

    if owner.len() > MAX_OWNER_LEN || !method_ok || !specific_ok {
        return Err(PathError::InvalidOwner);
    }
    Ok(())
}

/// Resolves repository coordinates to paths under a fixed base directory.
#[derive(Debug, Clone)]
pub struct RepoPathResolver {
    base: PathBuf,
}

impl RepoPathResolver {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Validate `(owner, repo)` and return the bare-repository path.
    ///
    /// The path need not exist.  No filesystem state is modified.
    pub fn resolve(&self, owner: &str, repo: &str) -> Result<PathBuf, PathError> {
        validate_owner(owner)?;
        validate_repo_name(repo)?;

        let candidate = self.base.join(owner).join(repo);

        // Lexical check first: exactly two normal components below base.
        let relative = candidate
            .strip_prefix(&self.base)
            .map_err(|_| PathError::EscapesBase)?;
        let normal_components = relative
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .count();
        if normal_components != 2 || relative.components().count() != 2 {
            return Err(PathError::EscapesBase);
        }

        // Then on the real filesystem, following any symlinks that exist.
        let base_real = resolve_existing_prefix(&self.base)?;
        let candidate_real = resolve_existing_prefix(&candidate)?;
        if !candidate_real.starts_with(&base_real) || candidate_real == base_real {
            return Err(PathError::EscapesBase);
        }

        Ok(candidate)
    }
}

/// Canonicalize the longest existing ancestor of `path` and re-append the
/// remaining (not yet existing) components.
fn resolve_existing_prefix(path: &Path) -> Result<PathBuf, PathError> {
    let mut existing = path.to_path_buf();
    let mut tail: Vec<OsString> = Vec::new();

    loop {
        match existing.canonicalize() {
            Ok(mut real) => {
                real.extend(tail.iter().rev());
                return Ok(real);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let Some(name) = existing.file_name() else {
                    return Err(PathError::Io(e));
                };
                tail.push(name.to_os_string());
                existing.pop();
                if existing.as_os_str().is_empty() {
                    existing = PathBuf::from(".");
                }
            }
            Err(e) => return Err(PathError::Io(e)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
