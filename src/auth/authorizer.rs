//! Push authorisation against collaborator records.

use std::sync::Arc;

use tracing::{instrument, warn};

use crate::records::{RecordStore, RepoContext};

/// Decides whether a verified pusher may write to `owner/repo`.
#[async_trait::async_trait]
pub trait PushAuthorizer: Send + Sync {
    async fn authorize(&self, pusher: &str, owner: &str, repo: &str) -> bool;
}

/// Allows the owner and any collaborator holding `write` or `admin`.
pub struct CollaboratorAuthorizer {
    store: Arc<dyn RecordStore>,
}

impl CollaboratorAuthorizer {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl PushAuthorizer for CollaboratorAuthorizer {
    #[instrument(skip(self))]
    async fn authorize(&self, pusher: &str, owner: &str, repo: &str) -> bool {
        if pusher == owner {
            return true;
        }

        let ctx = RepoContext::new(owner, repo);
        match self.store.collaborators(&ctx).await {
            Ok(list) => list
                .iter()
                .any(|c| c.did == pusher && c.role.can_push()),
            Err(e) => {
                warn!(error = %e, "collaborator lookup failed; denying push");
                false
            }
        }
    }
}
