//! Git subprocess wrappers and bare repository management.
//!
//! All object-level work shells out to the `git` binary through
//! [`commands::GitCommand`], which runs each invocation as its own process
//! with a wall-clock timeout.  [`resolver::RepoPathResolver`] is the single
//! place that turns request coordinates into filesystem paths.

pub mod bare_repo;
pub mod commands;
pub mod resolver;

pub use bare_repo::{init_bare_repo, validate_bare_repo};
pub use commands::{
    git_bundle_create, git_clone_bare, git_fetch_bundle, git_for_each_ref, git_head_commit,
    git_head_symref, GitCommand, ProcessError,
};
#[cfg(test)]
pub use commands::run_git;
pub use resolver::RepoPathResolver;
