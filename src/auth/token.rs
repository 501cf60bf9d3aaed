//! Push token codec.
//!
//! A push credential travels as the password of HTTP Basic Auth under the
//! fixed username [`SENTINEL_USER`]:
//!
//! ```text
//! Authorization: Basic base64("x-signed-push:" <sig_b64url> "." <token_b64url>)
//! ```
//!
//! The token is base64url (no padding) of a compact JSON payload and the
//! signature is Ed25519 over the token's encoded bytes.  Neither alphabet
//! contains `.`, so the first `.` always separates the two halves.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Basic Auth username carried by every push credential.  Identities contain
/// `:` and so cannot be used as the username.
pub const SENTINEL_USER: &str = "x-signed-push";

/// Default token lifetime in seconds.
pub const DEFAULT_TTL_SECS: i64 = 300;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed push token")]
    MalformedToken,
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushTokenPayload {
    pub pusher: String,
    pub owner: String,
    pub repo: String,
    /// Expiry as Unix seconds.
    pub exp: i64,
    /// 128-bit random value, lowercase hex.
    pub nonce: String,
}

/// Build a payload expiring `ttl_secs` from now with a fresh nonce.
pub fn build_payload(pusher: &str, owner: &str, repo: &str, ttl_secs: i64) -> PushTokenPayload {
    build_payload_at(pusher, owner, repo, ttl_secs, chrono::Utc::now().timestamp())
}

pub fn build_payload_at(
    pusher: &str,
    owner: &str,
    repo: &str,
    ttl_secs: i64,
    now: i64,
) -> PushTokenPayload {
    let mut nonce = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    PushTokenPayload {
        pusher: pusher.to_string(),
        owner: owner.to_string(),
        repo: repo.to_string(),
        exp: now + ttl_secs,
        nonce: hex::encode(nonce),
    }
}

// ---------------------------------------------------------------------------
// Token encoding
// ---------------------------------------------------------------------------

pub fn encode(payload: &PushTokenPayload) -> String {
    // Serializing a struct of strings and an integer cannot fail.
    let json = serde_json::to_vec(payload).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}

pub fn decode(token: &str) -> Result<PushTokenPayload, TokenError> {
    let json = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| TokenError::MalformedToken)?;
    let payload: PushTokenPayload =
        serde_json::from_slice(&json).map_err(|_| TokenError::MalformedToken)?;

    let any_empty = [&payload.pusher, &payload.owner, &payload.repo, &payload.nonce]
        .iter()
        .any(|field| field.is_empty());
    if any_empty {
        return Err(TokenError::MalformedToken);
    }
    Ok(payload)
}

// ---------------------------------------------------------------------------
// Credential
// ---------------------------------------------------------------------------

/// A parsed `<signature>.<token>` credential.  `token` is kept in its encoded
/// form because that is exactly what was signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedCredential {
    pub signature: Vec<u8>,
    pub token: String,
}

pub fn format_credential(signature: &[u8], token: &str) -> String {
    format!("{}.{token}", URL_SAFE_NO_PAD.encode(signature))
}

pub fn parse_credential(credential: &str) -> Result<SignedCredential, TokenError> {
    let (sig, token) = credential
        .split_once('.')
        .ok_or(TokenError::MalformedToken)?;
    if sig.is_empty() || token.is_empty() {
        return Err(TokenError::MalformedToken);
    }
    let signature = URL_SAFE_NO_PAD
        .decode(sig)
        .map_err(|_| TokenError::MalformedToken)?;
    Ok(SignedCredential {
        signature,
        token: token.to_string(),
    })
}

/// Encode and sign `payload`, returning the `<sig>.<token>` credential.
pub fn sign_credential(key: &SigningKey, payload: &PushTokenPayload) -> String {
    let token = encode(payload);
    let signature = key.sign(token.as_bytes());
    format_credential(&signature.to_bytes(), &token)
}

// ---------------------------------------------------------------------------
// Basic Auth framing
// ---------------------------------------------------------------------------

/// Full `Authorization` header value for a credential.
#[cfg(test)]
pub fn basic_header(credential: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{SENTINEL_USER}:{credential}")))
}

/// Split a `Basic` header into `(username, password)` on the first `:`.
pub fn parse_basic_header(header: &str) -> Option<(String, String)> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Verifier, Signature};

    #[test]
    fn build_payload_sets_expiry_and_nonce() {
        let p = build_payload_at("did:plc:alice", "did:plc:bob", "proj", 300, 1_000);
        assert_eq!(p.exp, 1_300);
        assert_eq!(p.nonce.len(), 32);
        assert!(p.nonce.bytes().all(|b| b.is_ascii_hexdigit()));

        let q = build_payload_at("did:plc:alice", "did:plc:bob", "proj", 300, 1_000);
        assert_ne!(p.nonce, q.nonce);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let p = build_payload("did:web:example.com%3A8443", "did:plc:bob", "a.b-c", 60);
        let token = encode(&p);
        assert!(!token.contains('.'));
        assert!(!token.contains('='));
        assert_eq!(decode(&token).unwrap(), p);
    }

    #[test]
    fn decode_rejects_missing_or_empty_fields() {
        let missing = URL_SAFE_NO_PAD.encode(r#"{"pusher":"a","owner":"b","repo":"c","exp":1}"#);
        assert_eq!(decode(&missing), Err(TokenError::MalformedToken));

        let empty = URL_SAFE_NO_PAD
            .encode(r#"{"pusher":"","owner":"b","repo":"c","exp":1,"nonce":"n"}"#);
        assert_eq!(decode(&empty), Err(TokenError::MalformedToken));

        assert_eq!(decode("!!not base64!!"), Err(TokenError::MalformedToken));
        assert_eq!(decode(&URL_SAFE_NO_PAD.encode("[]")), Err(TokenError::MalformedToken));
    }

    #[test]
    fn credential_splits_on_first_dot() {
        let cred = format_credential(&[1, 2, 3], "tok.with.dots");
        let parsed = parse_credential(&cred).unwrap();
        assert_eq!(parsed.signature, vec![1, 2, 3]);
        assert_eq!(parsed.token, "tok.with.dots");
    }

    #[test]
    fn credential_rejects_malformed() {
        for bad in ["", "nodot", ".tok", "sig.", "%%%.tok"] {
            assert!(parse_credential(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn signed_credential_verifies_over_token_bytes() {
        let key = SigningKey::from_bytes(&[42; 32]);
        let p = build_payload("did:plc:alice", "did:plc:bob", "proj", 300);
        let cred = parse_credential(&sign_credential(&key, &p)).unwrap();

        let sig = Signature::from_slice(&cred.signature).unwrap();
        assert!(key.verifying_key().verify(cred.token.as_bytes(), &sig).is_ok());
        assert_eq!(decode(&cred.token).unwrap(), p);
    }

    #[test]
    fn basic_header_roundtrip() {
        let header = basic_header("sig.tok");
        let (user, pass) = parse_basic_header(&header).unwrap();
        assert_eq!(user, SENTINEL_USER);
        assert_eq!(pass, "sig.tok");
    }

    #[test]
    fn basic_header_rejects_other_schemes() {
        assert!(parse_basic_header("Bearer abc").is_none());
        assert!(parse_basic_header("Basic").is_none());
        assert!(parse_basic_header("Basic !!!").is_none());
        // No colon after decoding.
        assert!(parse_basic_header(&format!("Basic {}", STANDARD.encode("nocolon"))).is_none());
    }

    #[test]
    fn basic_scheme_is_case_insensitive() {
        let header = format!("basic {}", STANDARD.encode("u:p:q"));
        assert_eq!(
            parse_basic_header(&header),
            Some(("u".to_string(), "p:q".to_string()))
        );
    }
}
