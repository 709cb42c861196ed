//! A single-process [`LeaseStore`], for tests and local development.
//!
//! Sessions expire on tokio's clock, so tests running with paused time can
//! step past a TTL without sleeping for real.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::{store::LeaseStore, LeaseRecord, PutOutcome, SessionId};
use crate::error::{ClusterError, Result};

struct Session {
    ttl: Duration,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    next_session: i64,
    sessions: HashMap<i64, Session>,
    keys: HashMap<String, LeaseRecord>,
}

impl State {
    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<i64> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            debug!(session = %SessionId(id), "session expired");
            self.drop_session(id);
        }
    }

    fn drop_session(&mut self, id: i64) -> bool {
        let existed = self.sessions.remove(&id).is_some();
        self.keys.retain(|_, record| record.session.0 != id);
        existed
    }
}

#[derive(Default)]
pub struct InMemoryLeaseStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
    writes: AtomicUsize,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every request fail with a transport error until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Drops `session` and its keys as if its TTL had run out.
    pub fn expire_session(&self, session: SessionId) {
        self.state.lock().drop_session(session.0);
    }

    /// Number of conditional writes attempted so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn live_sessions(&self) -> usize {
        let mut state = self.state.lock();
        state.purge_expired(Instant::now());
        state.sessions.len()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(ClusterError::store("store unavailable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn grant(&self, ttl: Duration) -> Result<SessionId> {
        self.check_available()?;
        let mut state = self.state.lock();
        state.next_session += 1;
        let id = state.next_session;
        state.sessions.insert(
            id,
            Session {
                ttl,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(SessionId(id))
    }

    async fn keep_alive(&self, session: SessionId) -> Result<bool> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.state.lock();
        state.purge_expired(now);
        match state.sessions.get_mut(&session.0) {
            Some(s) => {
                s.expires_at = now + s.ttl;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn revoke(&self, session: SessionId) -> Result<()> {
        self.check_available()?;
        self.state.lock().drop_session(session.0);
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        owner: &str,
        session: SessionId,
    ) -> Result<PutOutcome> {
        self.check_available()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.purge_expired(Instant::now());
        if !state.sessions.contains_key(&session.0) {
            return Err(ClusterError::SessionExpired { session: session.0 });
        }
        if let Some(existing) = state.keys.get(key) {
            return Ok(PutOutcome::Conflict(Some(existing.clone())));
        }
        state.keys.insert(
            key.to_string(),
            LeaseRecord {
                owner: owner.to_string(),
                session,
            },
        );
        Ok(PutOutcome::Acquired)
    }

    async fn delete_if_owner(&self, key: &str, owner: &str) -> Result<bool> {
        self.check_available()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.purge_expired(Instant::now());
        match state.keys.get(key) {
            Some(record) if record.owner == owner => {
                state.keys.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<LeaseRecord>> {
        self.check_available()?;
        let mut state = self.state.lock();
        state.purge_expired(Instant::now());
        Ok(state.keys.get(key).cloned())
    }
}
