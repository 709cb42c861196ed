use std::{
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tracing::{debug, error, info, warn};

use super::{manager::LeaseContext, PutOutcome, SessionId};
use crate::{error::ClusterError, interface::listener::LeaseListener};

#[derive(Default)]
struct LeaseState {
    /// Session the lease was claimed under. Only counts as held while that
    /// session is still the manager's active one.
    held: Option<SessionId>,
    closed: bool,
}

/// An exclusive lease on one named resource.
///
/// Leases are created by [`LeaseManager::request_lease`](super::LeaseManager::request_lease)
/// and shared; every call on the same lease serializes through its own mutex
/// while different leases never block each other.
pub struct ResourceLease {
    name: String,
    key: String,
    ctx: Arc<LeaseContext>,
    state: AsyncMutex<LeaseState>,
    /// Lock-free copy of `state.held` for `is_held`. Zero means not held.
    held_session: AtomicI64,
    listeners: Mutex<Vec<Arc<dyn LeaseListener>>>,
}

impl ResourceLease {
    pub(crate) fn new(name: String, key: String, ctx: Arc<LeaseContext>) -> Self {
        Self {
            name,
            key,
            ctx,
            state: AsyncMutex::new(LeaseState::default()),
            held_session: AtomicI64::new(0),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this process held the lease as of the last check, under the
    /// session that is still active. Never touches the store.
    pub fn is_held(&self) -> bool {
        let held = self.held_session.load(Ordering::SeqCst);
        held != 0 && self.ctx.session().map(|s| s.0) == Some(held)
    }

    /// Reconciles the lease with the current membership snapshot: releases it
    /// if another member should own it, claims it if this member should.
    ///
    /// Store failures are logged and reported as not held.
    pub async fn check_held(&self) -> bool {
        let session = match self.ctx.session() {
            Some(session) => session,
            None => return false,
        };

        let mut state = self.state.lock().await;
        if state.closed {
            return false;
        }
        // shutdown or session recovery may have run while waiting for the lock
        if self.ctx.session() != Some(session) {
            debug!(lease = %self.name, "session changed while waiting for the lease");
            return false;
        }
        if state.held.map_or(false, |held| held != session) {
            debug!(lease = %self.name, "lease was claimed under an earlier session");
            self.clear(&mut state);
        }

        if !self.should_hold() {
            if state.held.is_some() {
                drop(state);
                self.release_held(session).await;
            }
            return false;
        }

        if state.held.is_some() {
            return true;
        }

        let acquired = match self
            .ctx
            .store
            .put_if_absent(&self.key, &self.ctx.owner, session)
            .await
        {
            Ok(PutOutcome::Acquired) => true,
            Ok(PutOutcome::Conflict(Some(record)))
                if record.owner == self.ctx.owner && record.session == session =>
            {
                info!(lease = %self.name, "reclaimed lease already bound to this session");
                true
            }
            Ok(PutOutcome::Conflict(record)) => {
                match record {
                    Some(record) => warn!(
                        lease = %self.name,
                        holder = %record.owner,
                        session = %record.session,
                        "lease is held elsewhere"
                    ),
                    None => warn!(lease = %self.name, "lease is held elsewhere"),
                }
                false
            }
            Err(e) => {
                warn!(lease = %self.name, error = %e, "failed to claim lease");
                false
            }
        };

        if !acquired {
            return false;
        }
        state.held = Some(session);
        self.held_session.store(session.0, Ordering::SeqCst);
        drop(state);

        info!(lease = %self.name, %session, "acquired lease");
        self.notify(|listener| listener.after_acquire(self));
        true
    }

    /// Same as [`check_held`](Self::check_held).
    pub async fn acquire(&self) -> bool {
        self.check_held().await
    }

    /// Gives the lease up if held. Returns whether the store record was
    /// deleted.
    pub async fn release(&self) -> bool {
        let session = match self.ctx.session() {
            Some(session) => session,
            None => return false,
        };
        if self.state.lock().await.held.is_none() {
            return false;
        }
        self.release_held(session).await
    }

    /// Registers `listener`, notifying it right away if the lease is held.
    pub async fn add_listener(&self, listener: Arc<dyn LeaseListener>) {
        // holding the lease mutex orders this against acquire/release
        let state = self.state.lock().await;
        self.listeners.lock().push(Arc::clone(&listener));
        let held = !state.closed && state.held.is_some() && state.held == self.ctx.session();
        drop(state);

        if held {
            self.notify_one(&listener, |listener| listener.after_acquire(self));
        }
    }

    /// Releases the lease if held and refuses every later claim.
    pub(crate) async fn close(&self) {
        let was_held = self.state.lock().await.held.is_some();
        if was_held {
            self.notify(|listener| listener.before_release(self));
        }

        let mut state = self.state.lock().await;
        state.closed = true;
        if state.held.is_none() {
            return;
        }
        self.clear(&mut state);
        self.delete(&mut state).await;
    }

    fn should_hold(&self) -> bool {
        if self.ctx.weight.weight() == 0 {
            return false;
        }
        match self.ctx.cluster.snapshot().owner(&self.name) {
            Ok(owner) => owner.name == self.ctx.owner,
            Err(ClusterError::NoMembersAvailable { .. }) => false,
            Err(e) => {
                warn!(lease = %self.name, error = %e, "unable to resolve lease owner");
                false
            }
        }
    }

    /// Notifies listeners, then clears local state before deleting the store
    /// record. Listeners run without the lease mutex held, so the state is
    /// re-checked once it is reacquired.
    async fn release_held(&self, session: SessionId) -> bool {
        self.notify(|listener| listener.before_release(self));

        let mut state = self.state.lock().await;
        if state.held != Some(session) {
            return false;
        }
        self.clear(&mut state);
        self.delete(&mut state).await
    }

    fn clear(&self, state: &mut MutexGuard<'_, LeaseState>) {
        state.held = None;
        self.held_session.store(0, Ordering::SeqCst);
    }

    /// Takes the guard so the delete stays serialized with other calls on
    /// this lease.
    async fn delete(&self, _state: &mut MutexGuard<'_, LeaseState>) -> bool {
        match self
            .ctx
            .store
            .delete_if_owner(&self.key, &self.ctx.owner)
            .await
        {
            Ok(deleted) => {
                info!(lease = %self.name, "released lease");
                deleted
            }
            Err(e) => {
                warn!(lease = %self.name, error = %e, "failed to delete lease record, it expires with the session");
                false
            }
        }
    }

    fn notify(&self, f: impl Fn(&dyn LeaseListener)) {
        let listeners = self.listeners.lock().clone();
        for listener in &listeners {
            self.notify_one(listener, &f);
        }
    }

    fn notify_one(&self, listener: &Arc<dyn LeaseListener>, f: impl Fn(&dyn LeaseListener)) {
        if catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))).is_err() {
            error!(lease = %self.name, "lease listener panicked");
        }
    }
}

impl fmt::Debug for ResourceLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLease")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("held", &self.is_held())
            .finish()
    }
}
