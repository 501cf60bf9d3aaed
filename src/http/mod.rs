//! HTTP layer: git smart HTTP over axum.
//!
//! Reads (ref advertisement, `upload-pack`) are anonymous.  Pushes carry a
//! signed, single-use credential checked before any request body reaches
//! git.  Missing repositories are handed to a [`hooks::Restorer`], and
//! completed pushes to a [`hooks::PushHook`].

pub mod body;
pub mod handler;
pub mod hooks;
pub mod pktline;
