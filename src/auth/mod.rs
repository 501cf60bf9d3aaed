//! Push authentication and authorisation.
//!
//! Pushes carry a self-signed token in HTTP Basic Auth (see [`token`]).  The
//! [`PushAuthenticator`] checks it against the pusher's identity document via
//! a [`verifier::SignatureVerifier`], rejects replays, and optionally asks a
//! [`PushAuthorizer`].

pub mod authenticator;
pub mod authorizer;
pub mod replay;
pub mod token;
pub mod verifier;

pub use authenticator::{AuthFailure, AuthorizedPush, PushAuthenticator};
pub use authorizer::{CollaboratorAuthorizer, PushAuthorizer};
pub use verifier::DidSignatureVerifier;
