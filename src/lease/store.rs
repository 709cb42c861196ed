use std::time::Duration;

use async_trait::async_trait;

use super::{LeaseRecord, PutOutcome, SessionId};
use crate::error::Result;

/// Strongly consistent key-value store with TTL'd sessions.
///
/// Implementations own consensus; callers only rely on each operation being
/// linearizable.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Creates a session that expires `ttl` after its last refresh.
    async fn grant(&self, ttl: Duration) -> Result<SessionId>;

    /// Refreshes `session`. Returns false if the session has already expired.
    async fn keep_alive(&self, session: SessionId) -> Result<bool>;

    /// Ends `session` immediately, deleting every key bound to it.
    async fn revoke(&self, session: SessionId) -> Result<()>;

    /// Creates `key` with value `owner`, bound to `session`, only if the key
    /// does not exist.
    async fn put_if_absent(&self, key: &str, owner: &str, session: SessionId)
        -> Result<PutOutcome>;

    /// Deletes `key` only if its value is `owner`. Returns whether a key was
    /// deleted.
    async fn delete_if_owner(&self, key: &str, owner: &str) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<LeaseRecord>>;
}
