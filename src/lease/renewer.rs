use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::{manager::LeaseContext, SessionId};
use crate::{error::ClusterError, util::runnable::PeriodicRunnable};

/// Keeps the lease store session alive, replacing it when the store reports
/// that it expired.
///
/// Leases only count as held under the session they were claimed with, so a
/// replacement session implicitly drops every lease claimed under the old one.
pub(crate) struct SessionRenewer {
    ctx: Arc<LeaseContext>,
}

impl SessionRenewer {
    pub(crate) fn new(ctx: Arc<LeaseContext>) -> Self {
        Self { ctx }
    }

    async fn replace(&self, expired: SessionId) {
        warn!(session = %expired, "lease store session expired, requesting a new one");
        let replacement = match self.ctx.grant_session().await {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "unable to replace expired lease store session");
                return;
            }
        };

        if self.ctx.replace_session(expired, replacement) {
            info!(old = %expired, new = %replacement, "replaced lease store session");
        } else {
            // shut down or replaced concurrently
            if let Err(e) = self.ctx.store.revoke(replacement).await {
                debug!(session = %replacement, error = %e, "failed to revoke unused session");
            }
        }
    }
}

#[async_trait]
impl PeriodicRunnable for SessionRenewer {
    async fn run_once(&self) {
        let session = match self.ctx.session() {
            Some(session) => session,
            None => return,
        };

        match self.ctx.store.keep_alive(session).await {
            Ok(true) => debug!(%session, "refreshed lease store session"),
            Ok(false) | Err(ClusterError::SessionExpired { .. }) => self.replace(session).await,
            Err(e) => warn!(%session, error = %e, "failed to refresh lease store session"),
        }
    }
}
