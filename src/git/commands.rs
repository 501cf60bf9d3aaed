//! Git command wrappers using [`tokio::process::Command`].
//!
//! Every invocation goes through [`GitCommand`], which spawns the system
//! `git` binary with `kill_on_drop`, feeds stdin concurrently with draining
//! stdout/stderr, and enforces a wall-clock timeout.  A timed-out child is
//! killed when its future is dropped.
//!
//! The thin `git_*` helpers below cover the handful of commands the bundle
//! syncer and restorer need.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, instrument, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure of a git subprocess.
///
/// `stderr` is kept for the operator log only; it must never be echoed to an
/// HTTP client.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn git {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o error while running git {command}: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("git {command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("git {command} failed ({status}): {stderr}")]
    Exit {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Captured result of a successful git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub stdout: Vec<u8>,
}

impl GitOutput {
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// A single git invocation.
#[derive(Debug, Clone, Default)]
pub struct GitCommand {
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    envs: Vec<(String, String)>,
    stdin: Option<Bytes>,
}

impl GitCommand {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Self {
            args: args.into_iter().map(|a| a.as_ref().to_os_string()).collect(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    #[cfg(test)]
    pub fn stdin(mut self, input: Bytes) -> Self {
        self.stdin = Some(input);
        self
    }

    /// Short human-readable name used in errors and logs (the subcommand).
    fn label(&self) -> String {
        self.args
            .iter()
            .find(|a| !a.to_string_lossy().starts_with('-'))
            .map(|a| a.to_string_lossy().into_owned())
            .unwrap_or_else(|| "<none>".to_string())
    }

    fn build(&self) -> Command {
        let mut cmd = Command::new("git");
        cmd.args(&self.args);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }
        cmd.stdin(if self.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    /// Spawn the process and hand the [`Child`] to the caller for streaming.
    ///
    /// Any configured stdin is ignored; the caller owns `child.stdin`.
    pub fn spawn(&self) -> Result<Child, ProcessError> {
        let mut cmd = self.build();
        cmd.stdin(Stdio::piped());
        cmd.spawn().map_err(|source| ProcessError::Spawn {
            command: self.label(),
            source,
        })
    }

    /// Run to completion, returning captured output on a zero exit status.
    ///
    /// Stdin is written while stdout and stderr are drained so that a large
    /// response cannot deadlock against an unread pipe.
    pub async fn run(self, timeout: Duration) -> Result<GitOutput, ProcessError> {
        let command = self.label();
        let started = Instant::now();

        let mut child = self
            .build()
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                command: command.clone(),
                source,
            })?;

        let stdin_pipe = child.stdin.take();
        let input = self.stdin;
        let feed = async move {
            if let (Some(mut pipe), Some(input)) = (stdin_pipe, input) {
                // A child that exits early closes its end; the exit status
                // carries the real failure.
                if let Err(e) = pipe.write_all(&input).await {
                    debug!(error = %e, "git closed stdin early");
                }
                drop(pipe);
            }
        };

        let run = async {
            let ((), output) = tokio::join!(feed, child.wait_with_output());
            output
        };

        let output = match tokio::time::timeout(timeout, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => return Err(ProcessError::Io { command, source }),
            Err(_) => {
                warn!(%command, ?timeout, "git command timed out; killed");
                return Err(ProcessError::Timeout { command, timeout });
            }
        };

        debug!(
            %command,
            elapsed_ms = started.elapsed().as_millis() as u64,
            status = %output.status,
            "git command finished"
        );

        if !output.status.success() {
            return Err(ProcessError::Exit {
                command,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(GitOutput {
            stdout: output.stdout,
        })
    }
}

/// Run `git <args>` in `cwd` with the given timeout.
#[cfg(test)]
pub async fn run_git<I, S>(
    args: I,
    cwd: Option<&Path>,
    timeout: Duration,
) -> Result<GitOutput, ProcessError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = GitCommand::new(args);
    if let Some(cwd) = cwd {
        cmd = cmd.cwd(cwd);
    }
    cmd.run(timeout).await
}

// ---------------------------------------------------------------------------
// Clone / fetch from bundles
// ---------------------------------------------------------------------------

/// Run `git clone --bare <bundle> <dest>`.
#[instrument(fields(bundle = %bundle.display(), dest = %dest.display()))]
pub async fn git_clone_bare(
    bundle: &Path,
    dest: &Path,
    timeout: Duration,
) -> Result<(), ProcessError> {
    GitCommand::new(["clone", "--bare", "--quiet"])
        .arg(bundle)
        .arg(dest)
        .run(timeout)
        .await?;
    debug!("git clone --bare succeeded");
    Ok(())
}

/// Run `git fetch <bundle> +refs/*:refs/*` inside an existing bare repo.
///
/// Bundles carry every ref, so `--prune` brings the ref set to exactly the
/// bundle's, including deletions and forced updates.
#[instrument(fields(repo = %repo_path.display(), bundle = %bundle.display()))]
pub async fn git_fetch_bundle(
    repo_path: &Path,
    bundle: &Path,
    timeout: Duration,
) -> Result<(), ProcessError> {
    GitCommand::new(["fetch", "--quiet", "--prune", "--update-head-ok"])
        .cwd(repo_path)
        .arg(bundle)
        .arg("+refs/*:refs/*")
        .run(timeout)
        .await?;
    debug!("git fetch from bundle succeeded");
    Ok(())
}

// ---------------------------------------------------------------------------
// Bundle create
// ---------------------------------------------------------------------------

/// Run `git bundle create <output> --all` inside a bare repo.
#[instrument(fields(repo = %repo_path.display(), output = %output.display()))]
pub async fn git_bundle_create(
    repo_path: &Path,
    output: &Path,
    timeout: Duration,
) -> Result<(), ProcessError> {
    GitCommand::new(["bundle", "create", "--quiet"])
        .cwd(repo_path)
        .arg(output)
        .arg("--all")
        .run(timeout)
        .await?;
    debug!("git bundle create succeeded");
    Ok(())
}

// ---------------------------------------------------------------------------
// Refs
// ---------------------------------------------------------------------------

/// Run `git for-each-ref` in a bare repo and return `ref_name -> object_id`.
///
/// The map is ordered by ref name so callers get a deterministic enumeration.
#[instrument(fields(repo = %repo_path.display()))]
pub async fn git_for_each_ref(
    repo_path: &Path,
    timeout: Duration,
) -> Result<BTreeMap<String, String>, ProcessError> {
    let output = GitCommand::new([
        "for-each-ref",
        "--sort=refname",
        "--format=%(objectname) %(refname)",
    ])
    .cwd(repo_path)
    .run(timeout)
    .await?;

    let refs = parse_ref_lines(&output.stdout_str());
    debug!(ref_count = refs.len(), "git for-each-ref complete");
    Ok(refs)
}

/// Resolve `HEAD` to a commit id, or `None` when HEAD is unborn or dangling.
#[instrument(fields(repo = %repo_path.display()))]
pub async fn git_head_commit(
    repo_path: &Path,
    timeout: Duration,
) -> Result<Option<String>, ProcessError> {
    match GitCommand::new(["rev-parse", "--verify", "--quiet", "HEAD^{commit}"])
        .cwd(repo_path)
        .run(timeout)
        .await
    {
        Ok(output) => {
            let oid = output.stdout_str().trim().to_string();
            Ok((!oid.is_empty()).then_some(oid))
        }
        Err(ProcessError::Exit { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Return the symbolic target of `HEAD` (e.g. `refs/heads/main`), if any.
pub async fn git_head_symref(
    repo_path: &Path,
    timeout: Duration,
) -> Result<Option<String>, ProcessError> {
    match GitCommand::new(["symbolic-ref", "--quiet", "HEAD"])
        .cwd(repo_path)
        .run(timeout)
        .await
    {
        Ok(output) => {
            let target = output.stdout_str().trim().to_string();
            Ok((!target.is_empty()).then_some(target))
        }
        Err(ProcessError::Exit { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Parse `<oid> <refname>` lines.
fn parse_ref_lines(stdout: &str) -> BTreeMap<String, String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| line.split_once(' '))
        .map(|(oid, refname)| (refname.trim().to_string(), oid.trim().to_string()))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
