//! Identity documents and their resolution.
//!
//! An identity (`did:plc:*`, `did:web:*`) resolves to a document listing
//! verification methods.  Push signatures are checked against the methods
//! the document declares for the `authentication` purpose, falling back to
//! every listed method when that section resolves to nothing usable.

pub mod resolver;

pub use resolver::HttpIdentityResolver;

use anyhow::Result;
use base64::Engine;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Multicodec prefix for an Ed25519 public key (`0xed` as an unsigned varint).
const ED25519_MULTICODEC: [u8; 2] = [0xed, 0x01];

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Resolves an identity string to its current document.
#[async_trait::async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, identity: &str) -> Result<IdentityDocument>;
}

// ---------------------------------------------------------------------------
// Document model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityDocument {
    pub id: String,
    #[serde(default)]
    pub verification_method: Vec<VerificationMethod>,
    #[serde(default)]
    pub authentication: Vec<AuthenticationEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationMethod {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_multibase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_jwk: Option<Jwk>,
}

/// An `authentication` entry is either a reference to a verification
/// method (`"#key-1"` or a full `did:...#key-1`) or an embedded method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AuthenticationEntry {
    Reference(String),
    Embedded(VerificationMethod),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("verification method carries no supported key encoding")]
    MissingKey,
    #[error("multibase value is not base58btc")]
    UnsupportedMultibase,
    #[error("key material is not valid base58/base64")]
    Encoding,
    #[error("key is not an Ed25519 key")]
    UnsupportedKeyType,
    #[error("Ed25519 key has wrong length or is invalid")]
    InvalidKey,
}

// ---------------------------------------------------------------------------
// Key extraction
// ---------------------------------------------------------------------------

impl VerificationMethod {
    /// Decode this method's Ed25519 public key.
    pub fn ed25519_key(&self) -> Result<VerifyingKey, KeyError> {
        if let Some(multibase) = &self.public_key_multibase {
            return decode_multibase_key(multibase);
        }
        if let Some(jwk) = &self.public_key_jwk {
            return decode_jwk_key(jwk);
        }
        Err(KeyError::MissingKey)
    }
}

impl IdentityDocument {
    /// Ed25519 keys usable for authentication, in document order.
    ///
    /// Methods referenced from or embedded in `authentication` win; when none
    /// of them yield a key, every `verificationMethod` is tried instead.
    pub fn authentication_keys(&self) -> Vec<VerifyingKey> {
        let scoped: Vec<VerifyingKey> = self
            .authentication
            .iter()
            .filter_map(|entry| match entry {
                AuthenticationEntry::Embedded(method) => Some(method),
                AuthenticationEntry::Reference(reference) => self.find_method(reference),
            })
            .filter_map(|method| method.ed25519_key().ok())
            .collect();

        if !scoped.is_empty() {
            return scoped;
        }

        self.verification_method
            .iter()
            .filter_map(|method| method.ed25519_key().ok())
            .collect()
    }

    fn find_method(&self, reference: &str) -> Option<&VerificationMethod> {
        let wanted = self.absolute_id(reference);
        self.verification_method
            .iter()
            .find(|method| self.absolute_id(&method.id) == wanted)
    }

    fn absolute_id(&self, id: &str) -> String {
        if id.starts_with('#') {
            format!("{}{id}", self.id)
        } else {
            id.to_string()
        }
    }
}

/// Decode a `publicKeyMultibase` value (base58btc, `z` prefix) holding either
/// a multicodec-tagged or a raw 32-byte Ed25519 key.
pub fn decode_multibase_key(value: &str) -> Result<VerifyingKey, KeyError> {
    let encoded = value
        .strip_prefix('z')
        .ok_or(KeyError::UnsupportedMultibase)?;
    let bytes = bs58::decode(encoded)
        .into_vec()
        .map_err(|_| KeyError::Encoding)?;

    let raw = match bytes.len() {
        34 if bytes[..2] == ED25519_MULTICODEC => &bytes[2..],
        34 => return Err(KeyError::UnsupportedKeyType),
        32 => &bytes[..],
        _ => return Err(KeyError::InvalidKey),
    };
    verifying_key_from_slice(raw)
}

fn decode_jwk_key(jwk: &Jwk) -> Result<VerifyingKey, KeyError> {
    if jwk.kty != "OKP" || jwk.crv != "Ed25519" {
        return Err(KeyError::UnsupportedKeyType);
    }
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(jwk.x.trim_end_matches('='))
        .map_err(|_| KeyError::Encoding)?;
    verifying_key_from_slice(&bytes)
}

fn verifying_key_from_slice(raw: &[u8]) -> Result<VerifyingKey, KeyError> {
    let array: [u8; 32] = raw.try_into().map_err(|_| KeyError::InvalidKey)?;
    VerifyingKey::from_bytes(&array).map_err(|_| KeyError::InvalidKey)
}

/// Encode an Ed25519 public key as multicodec-tagged base58btc multibase.
#[cfg(test)]
pub fn encode_multibase_key(key: &VerifyingKey) -> String {
    let mut bytes = ED25519_MULTICODEC.to_vec();
    bytes.extend_from_slice(key.as_bytes());
    format!("z{}", bs58::encode(bytes).into_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
