//! Ed25519 signature verification against identity documents.

use std::sync::Arc;

use ed25519_dalek::Signature;
use tracing::{debug, instrument, warn};

use crate::identity::IdentityResolver;

/// Verifies a raw signature over arbitrary bytes on behalf of an identity.
///
/// Every failure (unresolvable identity, no usable key, bad signature) is
/// `false`; nothing escapes this boundary.
#[async_trait::async_trait]
pub trait SignatureVerifier: Send + Sync {
    async fn verify(&self, identity: &str, message: &[u8], signature: &[u8]) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    Unresolvable,
    NoUsableKey,
    MalformedSignature,
    Mismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationOutcome {
    Valid,
    Invalid(InvalidReason),
}

/// [`SignatureVerifier`] backed by an [`IdentityResolver`].  Documents are
/// resolved on every call; nothing is cached.
pub struct DidSignatureVerifier {
    resolver: Arc<dyn IdentityResolver>,
}

impl DidSignatureVerifier {
    pub fn new(resolver: Arc<dyn IdentityResolver>) -> Self {
        Self { resolver }
    }

    #[instrument(skip(self, message, signature))]
    pub async fn check(&self, identity: &str, message: &[u8], signature: &[u8]) -> VerificationOutcome {
        let Ok(signature) = Signature::from_slice(signature) else {
            return VerificationOutcome::Invalid(InvalidReason::MalformedSignature);
        };

        let document = match self.resolver.resolve(identity).await {
            Ok(doc) => doc,
            Err(e) => {
                warn!(error = %e, "identity resolution failed");
                return VerificationOutcome::Invalid(InvalidReason::Unresolvable);
            }
        };

        let keys = document.authentication_keys();
        if keys.is_empty() {
            debug!("identity document has no usable Ed25519 key");
            return VerificationOutcome::Invalid(InvalidReason::NoUsableKey);
        }

        if keys
            .iter()
            .any(|key| key.verify_strict(message, &signature).is_ok())
        {
            VerificationOutcome::Valid
        } else {
            VerificationOutcome::Invalid(InvalidReason::Mismatch)
        }
    }
}

#[async_trait::async_trait]
impl SignatureVerifier for DidSignatureVerifier {
    async fn verify(&self, identity: &str, message: &[u8], signature: &[u8]) -> bool {
        match self.check(identity, message, signature).await {
            VerificationOutcome::Valid => true,
            VerificationOutcome::Invalid(reason) => {
                debug!(?reason, "signature rejected");
                false
            }
        }
    }
}
