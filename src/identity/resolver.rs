//! HTTP identity resolution for `did:plc` and `did:web`.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, instrument, warn};
use url::Url;

use super::{IdentityDocument, IdentityResolver};
use crate::config::IdentityConfig;

// ---------------------------------------------------------------------------
// Resolver struct
// ---------------------------------------------------------------------------

pub struct HttpIdentityResolver {
    client: reqwest::Client,
    plc_directory: Url,
}

impl HttpIdentityResolver {
    pub fn new(config: &IdentityConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("sovgit/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("failed to build identity HTTP client")?;
        let plc_directory = Url::parse(&config.plc_directory_url)
            .with_context(|| format!("invalid plc_directory_url: {}", config.plc_directory_url))?;
        Ok(Self {
            client,
            plc_directory,
        })
    }

    /// URL of the document for `identity`.
    pub fn document_url(&self, identity: &str) -> Result<Url> {
        if let Some(id) = identity.strip_prefix("did:plc:") {
            if id.is_empty() || !id.bytes().all(|b| b.is_ascii_alphanumeric()) {
                bail!("malformed did:plc identifier");
            }
            let mut url = self.plc_directory.clone();
            url.path_segments_mut()
                .map_err(|_| anyhow::anyhow!("plc_directory_url cannot be a base URL"))?
                .pop_if_empty()
                .push(identity);
            return Ok(url);
        }

        if let Some(rest) = identity.strip_prefix("did:web:") {
            return did_web_url(rest);
        }

        bail!("unsupported identity method")
    }
}

/// `did:web:host%3Aport:path:seg` -> `https://host:port/path/seg/did.json`;
/// a bare host maps to `/.well-known/did.json`.
fn did_web_url(method_specific: &str) -> Result<Url> {
    let mut segments = method_specific.split(':');
    let host = segments
        .next()
        .filter(|h| !h.is_empty())
        .context("did:web identifier has no host")?
        .replace("%3A", ":")
        .replace("%3a", ":");

    let path: Vec<&str> = segments.collect();
    if path.iter().any(|s| s.is_empty() || *s == "." || *s == "..") {
        bail!("did:web identifier has an invalid path segment");
    }

    let url = if path.is_empty() {
        format!("https://{host}/.well-known/did.json")
    } else {
        format!("https://{host}/{}/did.json", path.join("/"))
    };
    Url::parse(&url).context("did:web identifier does not form a valid URL")
}

// ---------------------------------------------------------------------------
// Trait implementation
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl IdentityResolver for HttpIdentityResolver {
    #[instrument(skip(self))]
    async fn resolve(&self, identity: &str) -> Result<IdentityDocument> {
        let url = self.document_url(identity)?;

        let resp = self
            .client
            .get(url.clone())
            .header("Accept", "application/did+ld+json, application/json")
            .send()
            .await
            .context("identity document request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            warn!(%url, %status, "identity document lookup returned non-success");
            bail!("identity document lookup returned {status}");
        }

        let document: IdentityDocument = resp
            .json()
            .await
            .context("failed to parse identity document")?;

        // A host must not be able to vouch for someone else's identity.
        if document.id != identity {
            bail!("identity document id does not match the requested identity");
        }

        debug!(methods = document.verification_method.len(), "identity resolved");
        Ok(document)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> HttpIdentityResolver {
        HttpIdentityResolver::new(&IdentityConfig::default()).unwrap()
    }

    #[test]
    fn plc_url() {
        let url = resolver().document_url("did:plc:ewvi7nxzyoun6zhxrhs64oiz").unwrap();
        assert_eq!(
            url.as_str(),
            "https://plc.directory/did:plc:ewvi7nxzyoun6zhxrhs64oiz"
        );
    }

    #[test]
    fn plc_rejects_path_tricks() {
        assert!(resolver().document_url("did:plc:../admin").is_err());
        assert!(resolver().document_url("did:plc:").is_err());
    }

    #[test]
    fn web_url_bare_host() {
        let url = resolver().document_url("did:web:example.com").unwrap();
        assert_eq!(url.as_str(), "https://example.com/.well-known/did.json");
    }

    #[test]
    fn web_url_with_port_and_path() {
        let url = resolver()
            .document_url("did:web:example.com%3A8443:users:alice")
            .unwrap();
        assert_eq!(url.as_str(), "https://example.com:8443/users/alice/did.json");
    }

    #[test]
    fn web_url_rejects_traversal() {
        assert!(resolver().document_url("did:web:example.com:..:x").is_err());
        assert!(resolver().document_url("did:web:").is_err());
    }

    #[test]
    fn unknown_method_is_rejected() {
        assert!(resolver().document_url("did:key:z6Mk").is_err());
        assert!(resolver().document_url("alice").is_err());
    }
}
