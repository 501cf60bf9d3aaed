use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub bundles: BundleConfig,
    pub records: RecordsConfig,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// URL prefix every git route is mounted under, e.g. `/git`.  Empty
    /// mounts at the root.
    #[serde(default)]
    pub path_prefix: String,
    /// Largest accepted request body (after gzip decoding).
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path_prefix: String::new(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_max_body_bytes() -> u64 {
    512 * 1024 * 1024
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Base directory; repositories live at `{repos_path}/{owner}/{repo}`.
    pub repos_path: PathBuf,
}

// ---------------------------------------------------------------------------
// Git
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl GitConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

fn default_command_timeout_secs() -> u64 {
    600
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationMode {
    /// Any identity whose signature verifies may push.
    #[default]
    Open,
    /// Only the owner and collaborators with `write`/`admin`.
    Collaborators,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_token_max_age_secs")]
    pub token_max_age_secs: u64,
    #[serde(default = "default_clock_skew_secs")]
    pub clock_skew_secs: u64,
    #[serde(default)]
    pub authorization: AuthorizationMode,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_max_age_secs: default_token_max_age_secs(),
            clock_skew_secs: default_clock_skew_secs(),
            authorization: AuthorizationMode::default(),
        }
    }
}

fn default_token_max_age_secs() -> u64 {
    300
}

fn default_clock_skew_secs() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_plc_directory_url")]
    pub plc_directory_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            plc_directory_url: default_plc_directory_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_plc_directory_url() -> String {
    "https://plc.directory".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

// ---------------------------------------------------------------------------
// Bundles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct BundleConfig {
    /// Write a full bundle once this many bundles exist since the last full
    /// one.  `1` makes every bundle full.
    #[serde(default = "default_full_every")]
    pub full_every: u32,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            full_every: default_full_every(),
        }
    }
}

fn default_full_every() -> u32 {
    10
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RecordsConfig {
    pub s3: S3Config,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    #[serde(default = "default_s3_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub region: Option<String>,
    /// Endpoint override for S3-compatible stores.
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub use_fips: bool,
}

fn default_s3_prefix() -> String {
    "sovgit/".to_string()
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config = parse_config(&contents)
        .with_context(|| format!("failed to load config file: {}", path.display()))?;
    Ok(config)
}

pub fn parse_config(contents: &str) -> Result<Config> {
    let mut config: Config = serde_yaml::from_str(contents).context("invalid YAML")?;
    config.server.path_prefix = normalize_prefix(&config.server.path_prefix);
    validate_config(&config)?;
    Ok(config)
}

/// `git/` -> `/git`, `/` -> empty.
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

pub fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.storage.repos_path.as_os_str().is_empty(),
        "storage.repos_path must not be empty"
    );
    anyhow::ensure!(
        config.server.max_body_bytes > 0,
        "server.max_body_bytes must be greater than 0"
    );
    anyhow::ensure!(
        config.git.command_timeout_secs > 0,
        "git.command_timeout_secs must be greater than 0"
    );
    anyhow::ensure!(
        config.auth.token_max_age_secs > 0,
        "auth.token_max_age_secs must be greater than 0"
    );
    anyhow::ensure!(
        config.bundles.full_every >= 1,
        "bundles.full_every must be at least 1"
    );
    anyhow::ensure!(
        !config.records.s3.bucket.is_empty(),
        "records.s3.bucket must not be empty"
    );
    anyhow::ensure!(
        !config.server.path_prefix.contains(['{', '}', '*']),
        "server.path_prefix must be a literal path"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
storage:
  repos_path: /var/lib/sovgit
records:
  s3:
    bucket: forge
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.server.path_prefix, "");
        assert_eq!(config.server.max_body_bytes, 512 * 1024 * 1024);
        assert_eq!(config.git.command_timeout(), Duration::from_secs(600));
        assert_eq!(config.auth.token_max_age_secs, 300);
        assert_eq!(config.auth.clock_skew_secs, 30);
        assert_eq!(config.auth.authorization, AuthorizationMode::Open);
        assert_eq!(config.identity.plc_directory_url, "https://plc.directory");
        assert_eq!(config.bundles.full_every, 10);
        assert_eq!(config.records.s3.prefix, "sovgit/");
        assert!(config.records.s3.endpoint_url.is_none());
    }

    #[test]
    fn full_config_parses() {
        let yaml = r#"
server:
  listen: 127.0.0.1:9000
  path_prefix: git/
  max_body_bytes: 1024
storage:
  repos_path: /srv/repos
git:
  command_timeout_secs: 30
auth:
  token_max_age_secs: 120
  clock_skew_secs: 5
  authorization: collaborators
identity:
  plc_directory_url: http://localhost:2582
bundles:
  full_every: 1
records:
  s3:
    bucket: forge
    prefix: ""
    region: us-east-1
    endpoint_url: http://localhost:9000
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.server.path_prefix, "/git");
        assert_eq!(config.server.max_body_bytes, 1024);
        assert_eq!(config.auth.authorization, AuthorizationMode::Collaborators);
        assert_eq!(config.bundles.full_every, 1);
        assert_eq!(config.records.s3.region.as_deref(), Some("us-east-1"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let zero_cadence = format!("{MINIMAL}bundles:\n  full_every: 0\n");
        assert!(parse_config(&zero_cadence).is_err());

        let bad_mode = format!("{MINIMAL}auth:\n  authorization: everyone\n");
        assert!(parse_config(&bad_mode).is_err());

        assert!(parse_config("storage:\n  repos_path: /x\n").is_err());
    }

    #[test]
    fn prefix_normalization() {
        assert_eq!(normalize_prefix(""), "");
        assert_eq!(normalize_prefix("/"), "");
        assert_eq!(normalize_prefix("git"), "/git");
        assert_eq!(normalize_prefix("/a/b/"), "/a/b");
    }
}
