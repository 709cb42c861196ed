use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use futures_retry::FutureRetry;
use parking_lot::{Mutex, RwLock};
use tokio::{
    sync::{Notify, RwLock as AsyncRwLock},
    task::JoinHandle,
};
use tracing::{error, info, warn};

use super::{renewer::SessionRenewer, resource::ResourceLease, store::LeaseStore, SessionId};
use crate::{
    cluster::Cluster,
    config::LeaseConfig,
    error::Result,
    interface::weight::ClusterWeightProvider,
    util::{retry::FixedCountWithDelayStrategy, runnable::run_at_fixed_interval},
};

/// State shared between the manager, its leases and the session renewer.
pub(crate) struct LeaseContext {
    pub(crate) owner: String,
    pub(crate) config: LeaseConfig,
    pub(crate) store: Arc<dyn LeaseStore>,
    pub(crate) cluster: Arc<dyn Cluster>,
    pub(crate) weight: Arc<dyn ClusterWeightProvider>,
    session: RwLock<Option<SessionId>>,
}

impl LeaseContext {
    /// The active session, or `None` before start and after shutdown.
    pub(crate) fn session(&self) -> Option<SessionId> {
        *self.session.read()
    }

    /// Swaps `expected` for `replacement`, unless the session was changed
    /// (or cleared by shutdown) in the meantime.
    pub(crate) fn replace_session(&self, expected: SessionId, replacement: SessionId) -> bool {
        let mut session = self.session.write();
        if *session == Some(expected) {
            *session = Some(replacement);
            true
        } else {
            false
        }
    }

    pub(crate) async fn grant_session(&self) -> Result<SessionId> {
        let store = Arc::clone(&self.store);
        let ttl = self.config.session_ttl();
        FutureRetry::new(
            move || {
                let store = Arc::clone(&store);
                async move { store.grant(ttl).await }
            },
            FixedCountWithDelayStrategy::new(
                self.config.grant_attempts.max(1),
                self.config.grant_retry_delay(),
            ),
        )
        .await
        .map(|(session, _attempts)| session)
        .map_err(|(e, _attempts)| e)
    }
}

/// Hands out [`ResourceLease`]s and owns the store session backing them.
pub struct LeaseManager {
    ctx: Arc<LeaseContext>,
    leases: AsyncRwLock<HashMap<String, Arc<ResourceLease>>>,
    running: AtomicBool,
    shutdown: Arc<Notify>,
    renewer: Mutex<Option<JoinHandle<()>>>,
}

impl LeaseManager {
    pub fn new(
        config: LeaseConfig,
        store: Arc<dyn LeaseStore>,
        cluster: Arc<dyn Cluster>,
        weight: Arc<dyn ClusterWeightProvider>,
    ) -> Self {
        let owner = cluster.snapshot().self_member().name.clone();
        Self {
            ctx: Arc::new(LeaseContext {
                owner,
                config,
                store,
                cluster,
                weight,
                session: RwLock::new(None),
            }),
            leases: AsyncRwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
            renewer: Mutex::new(None),
        }
    }

    /// Obtains a session from the store and starts keeping it alive.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let session = match self.ctx.grant_session().await {
            Ok(session) => session,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                error!(error = %e, "unable to obtain a lease store session");
                return Err(e);
            }
        };
        *self.ctx.session.write() = Some(session);
        info!(%session, owner = %self.ctx.owner, "started lease manager");

        let renewer = Arc::new(SessionRenewer::new(Arc::clone(&self.ctx)));
        *self.renewer.lock() = Some(tokio::spawn(run_at_fixed_interval(
            renewer,
            self.ctx.config.keep_alive_interval(),
            Arc::clone(&self.shutdown),
        )));
        Ok(())
    }

    /// Returns the lease for `name`, creating it on first request. The same
    /// instance is returned for the lifetime of the manager.
    pub async fn request_lease(&self, name: &str) -> Arc<ResourceLease> {
        if let Some(lease) = self.leases.read().await.get(name) {
            return Arc::clone(lease);
        }

        let mut leases = self.leases.write().await;
        let lease = leases.entry(name.to_string()).or_insert_with(|| {
            Arc::new(ResourceLease::new(
                name.to_string(),
                self.ctx.config.lease_key(name),
                Arc::clone(&self.ctx),
            ))
        });
        Arc::clone(lease)
    }

    pub fn session(&self) -> Option<SessionId> {
        self.ctx.session()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops the keep-alive, invalidates the session so that in-flight checks
    /// fail closed, releases every held lease and finally revokes the
    /// session.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("shutting down lease manager");

        self.shutdown.notify_one();
        let renewer = self.renewer.lock().take();
        if let Some(renewer) = renewer {
            if let Err(e) = renewer.await {
                error!(error = %e, "session renewer exited abnormally");
            }
        }

        let session = self.ctx.session.write().take();

        let leases: Vec<Arc<ResourceLease>> = self.leases.read().await.values().cloned().collect();
        for lease in leases {
            lease.close().await;
        }

        if let Some(session) = session {
            match self.ctx.store.revoke(session).await {
                Ok(()) => info!(%session, "revoked lease store session"),
                Err(e) => warn!(%session, error = %e, "failed to revoke lease store session"),
            }
        }
    }
}

impl Drop for LeaseManager {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            warn!("lease manager dropped without shutdown; leases expire with the session");
            self.shutdown.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cluster::{Member, MembershipActor},
        interface::weight::FullClusterWeight,
        lease::InMemoryLeaseStore,
    };
    use std::time::Duration;

    fn config() -> LeaseConfig {
        LeaseConfig {
            app_name: "newswriter".to_string(),
            session_ttl_ms: 3_000,
            grant_retry_delay_ms: 100,
            ..LeaseConfig::default()
        }
    }

    fn manager(store: Arc<InMemoryLeaseStore>) -> (LeaseManager, Arc<MembershipActor>) {
        let actor = Arc::new(MembershipActor::new(Member::new("a", "10.0.0.1")));
        actor.start();
        let manager = LeaseManager::new(config(), store, actor.clone(), Arc::new(FullClusterWeight));
        (manager, actor)
    }

    #[tokio::test]
    async fn leases_are_cached_by_name() {
        let (manager, _actor) = manager(Arc::new(InMemoryLeaseStore::new()));
        let first = manager.request_lease("r1").await;
        let again = manager.request_lease("r1").await;
        let other = manager.request_lease("r2").await;
        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(first.name(), "r1");
    }

    #[tokio::test(start_paused = true)]
    async fn start_grants_and_shutdown_revokes_the_session() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let (manager, actor) = manager(Arc::clone(&store));
        assert!(manager.session().is_none());

        manager.start().await.unwrap();
        assert!(manager.session().is_some());
        assert_eq!(store.live_sessions(), 1);

        // the renewer keeps the session alive well past its TTL
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(store.live_sessions(), 1);

        manager.shutdown().await;
        assert!(manager.session().is_none());
        assert_eq!(store.live_sessions(), 0);
        actor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_retries_transient_grant_failures() {
        let store = Arc::new(InMemoryLeaseStore::new());
        store.set_unavailable(true);
        let (manager, actor) = manager(Arc::clone(&store));

        let healer = Arc::clone(&store);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            healer.set_unavailable(false);
        });

        manager.start().await.unwrap();
        assert!(manager.session().is_some());
        manager.shutdown().await;
        actor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_gives_up_when_store_stays_down() {
        let store = Arc::new(InMemoryLeaseStore::new());
        store.set_unavailable(true);
        let (manager, actor) = manager(store);
        assert!(manager.start().await.is_err());
        assert!(!manager.is_running());
        actor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn expired_session_is_replaced() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let (manager, actor) = manager(Arc::clone(&store));
        manager.start().await.unwrap();
        let first = manager.session().unwrap();

        store.expire_session(first);
        tokio::time::sleep(Duration::from_secs(2)).await;

        let second = manager.session().unwrap();
        assert_ne!(first, second);
        manager.shutdown().await;
        actor.shutdown().await;
    }
}
