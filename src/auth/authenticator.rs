//! Push authentication.
//!
//! Each attempt walks a fixed sequence of checks and stops at the first
//! failure:
//!
//! 1. a Basic `Authorization` header is present
//! 2. its username is [`SENTINEL_USER`]
//! 3. the password parses as `<signature>.<token>`
//! 4. the token decodes
//! 5. the token names exactly the repository being pushed to
//! 6. the token is neither expired nor implausibly far in the future
//! 7. the signature verifies for the token's pusher
//! 8. the nonce has not been seen
//! 9. the optional authoriser agrees
//!
//! The nonce is recorded only after the signature checks out, so unsigned
//! garbage cannot fill the replay cache or burn a legitimate nonce.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument};

use super::authorizer::PushAuthorizer;
use super::replay::ReplayCache;
use super::token::{self, SENTINEL_USER};
use super::verifier::SignatureVerifier;
use crate::config::AuthConfig;

/// Why a push was rejected.  Logged and counted, never sent to the client.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    #[error("no credentials supplied")]
    MissingCredentials,
    #[error("authorization header is not Basic")]
    MalformedHeader,
    #[error("unexpected Basic Auth username")]
    WrongUser,
    #[error("malformed credential")]
    MalformedCredential,
    #[error("malformed token")]
    MalformedToken,
    #[error("token is bound to a different repository")]
    ResourceMismatch,
    #[error("token expired")]
    Expired,
    #[error("token expiry too far in the future")]
    FutureDated,
    #[error("signature did not verify")]
    BadSignature,
    #[error("nonce already used")]
    Replayed,
    #[error("pusher is not authorised for this repository")]
    NotAuthorized,
}

impl AuthFailure {
    /// Stable label for metrics.
    pub fn reason(self) -> &'static str {
        match self {
            AuthFailure::MissingCredentials => "missing",
            AuthFailure::MalformedHeader => "malformed_header",
            AuthFailure::WrongUser => "wrong_user",
            AuthFailure::MalformedCredential => "malformed_credential",
            AuthFailure::MalformedToken => "malformed_token",
            AuthFailure::ResourceMismatch => "resource_mismatch",
            AuthFailure::Expired => "expired",
            AuthFailure::FutureDated => "future_dated",
            AuthFailure::BadSignature => "bad_signature",
            AuthFailure::Replayed => "replayed",
            AuthFailure::NotAuthorized => "not_authorized",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NonceUse {
    Consume,
    Peek,
}

/// A push that passed every check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedPush {
    pub pusher: String,
}

pub struct PushAuthenticator {
    verifier: Arc<dyn SignatureVerifier>,
    authorizer: Option<Arc<dyn PushAuthorizer>>,
    replay: ReplayCache,
    max_token_age_secs: i64,
    clock_skew_secs: i64,
}

impl PushAuthenticator {
    pub fn new(
        config: &AuthConfig,
        verifier: Arc<dyn SignatureVerifier>,
        authorizer: Option<Arc<dyn PushAuthorizer>>,
    ) -> Self {
        let max_token_age_secs = i64::try_from(config.token_max_age_secs).unwrap_or(i64::MAX);
        let clock_skew_secs = i64::try_from(config.clock_skew_secs).unwrap_or(i64::MAX);
        let window = Duration::from_secs(config.token_max_age_secs.saturating_add(config.clock_skew_secs));
        Self {
            verifier,
            authorizer,
            replay: ReplayCache::new(window),
            max_token_age_secs,
            clock_skew_secs,
        }
    }

    pub async fn authenticate(
        &self,
        header: Option<&str>,
        owner: &str,
        repo: &str,
    ) -> Result<AuthorizedPush, AuthFailure> {
        self.authenticate_at(header, owner, repo, chrono::Utc::now().timestamp())
            .await
    }

    pub async fn authenticate_at(
        &self,
        header: Option<&str>,
        owner: &str,
        repo: &str,
        now: i64,
    ) -> Result<AuthorizedPush, AuthFailure> {
        self.check(header, owner, repo, now, NonceUse::Consume).await
    }

    /// Authenticate git's empty preflight request that precedes a large push.
    ///
    /// The preflight carries the same credential as the push that follows, so
    /// its nonce is checked but not recorded.  A preflight body is a lone flush
    /// packet and changes nothing.
    pub async fn authenticate_preflight(
        &self,
        header: Option<&str>,
        owner: &str,
        repo: &str,
    ) -> Result<AuthorizedPush, AuthFailure> {
        let now = chrono::Utc::now().timestamp();
        self.check(header, owner, repo, now, NonceUse::Peek).await
    }

    #[instrument(skip(self, header), fields(%owner, %repo, ?nonce_use))]
    async fn check(
        &self,
        header: Option<&str>,
        owner: &str,
        repo: &str,
        now: i64,
        nonce_use: NonceUse,
    ) -> Result<AuthorizedPush, AuthFailure> {
        let header = header.ok_or(AuthFailure::MissingCredentials)?;

        let (user, password) =
            token::parse_basic_header(header).ok_or(AuthFailure::MalformedHeader)?;
        if user != SENTINEL_USER {
            return Err(AuthFailure::WrongUser);
        }

        let credential =
            token::parse_credential(&password).map_err(|_| AuthFailure::MalformedCredential)?;
        let payload = token::decode(&credential.token).map_err(|_| AuthFailure::MalformedToken)?;

        if payload.owner != owner || payload.repo != repo {
            return Err(AuthFailure::ResourceMismatch);
        }

        if payload.exp < now {
            return Err(AuthFailure::Expired);
        }
        let horizon = now
            .saturating_add(self.max_token_age_secs)
            .saturating_add(self.clock_skew_secs);
        if payload.exp > horizon {
            return Err(AuthFailure::FutureDated);
        }

        if !self
            .verifier
            .verify(&payload.pusher, credential.token.as_bytes(), &credential.signature)
            .await
        {
            return Err(AuthFailure::BadSignature);
        }
        debug!(pusher = %payload.pusher, "signature verified");

        let fresh = match nonce_use {
            NonceUse::Consume => self.replay.check_and_insert(&payload.nonce, now),
            NonceUse::Peek => !self.replay.contains(&payload.nonce, now),
        };
        if !fresh {
            return Err(AuthFailure::Replayed);
        }

        if let Some(authorizer) = &self.authorizer {
            if !authorizer.authorize(&payload.pusher, owner, repo).await {
                return Err(AuthFailure::NotAuthorized);
            }
        }

        info!(pusher = %payload.pusher, "push authenticated");
        Ok(AuthorizedPush {
            pusher: payload.pusher,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
