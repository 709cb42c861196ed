//! Cluster membership and resource leases for replicas of one application.
//!
//! A [`ClusterService`] wires together the three moving parts:
//!
//! * a [`MembershipFeed`](feed::MembershipFeed) watching the orchestrator for
//!   pods becoming ready or going away,
//! * a [`MembershipActor`](cluster::MembershipActor) folding those events into
//!   immutable [`Snapshot`](cluster::Snapshot)s and announcing the differences,
//! * a [`LeaseManager`](lease::LeaseManager) handing out leases that a replica
//!   claims only while the consistent-hash ring assigns it the resource.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tracing::{error, info};

use cluster::{Cluster, Member, MembershipActor};
use feed::{MembershipFeed, PodWatcher};
use interface::weight::{ClusterWeightProvider, FullClusterWeight};
use lease::{LeaseManager, LeaseStore};

pub mod cluster;
pub mod config;
pub mod error;
pub mod feed;
pub mod interface;
pub mod lease;
pub(crate) mod util;

pub use config::ClusterConfig;
pub use error::{ClusterError, Result};

pub struct ClusterService {
    actor: Arc<MembershipActor>,
    feed: Arc<MembershipFeed>,
    lease_manager: Arc<LeaseManager>,
    running: AtomicBool,
}

impl ClusterService {
    pub fn new(
        config: ClusterConfig,
        watcher: Arc<dyn PodWatcher>,
        store: Arc<dyn LeaseStore>,
    ) -> Result<Self> {
        Self::with_weight(config, watcher, store, Arc::new(FullClusterWeight))
    }

    pub fn with_weight(
        config: ClusterConfig,
        watcher: Arc<dyn PodWatcher>,
        store: Arc<dyn LeaseStore>,
        weight: Arc<dyn ClusterWeightProvider>,
    ) -> Result<Self> {
        config.validate()?;

        let self_member = Member::new(
            config.kubernetes.my_pod_name.clone(),
            config.kubernetes.my_pod_ip.clone(),
        );
        let actor = Arc::new(MembershipActor::new(self_member));
        let lease_manager = Arc::new(LeaseManager::new(
            config.lease,
            store,
            actor.clone(),
            weight,
        ));
        let feed = Arc::new(MembershipFeed::new(watcher, actor.clone(), config.feed));

        Ok(Self {
            actor,
            feed,
            lease_manager,
            running: AtomicBool::new(false),
        })
    }

    /// Connects to Kubernetes and etcd using `config`, reading this pod's
    /// identity from the downward API environment.
    #[cfg(all(feature = "kubernetes", feature = "etcd"))]
    pub async fn connect(mut config: ClusterConfig) -> Result<Self> {
        config.kubernetes = config.kubernetes.with_env_overrides();
        let watcher = feed::kubernetes::KubernetesPodWatcher::connect(&config.kubernetes).await?;
        let store = lease::etcd::EtcdLeaseStore::connect(&config.lease).await?;
        Self::new(config, Arc::new(watcher), Arc::new(store))
    }

    /// Starts the lease manager, then the actor, then the feed. A failure to
    /// obtain a store session leaves everything unstarted, so `start` can be
    /// retried.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = self.lease_manager.start().await {
            error!(error = %e, "cluster service failed to start");
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }
        self.actor.start();
        self.feed.start();

        info!(member = %self.actor.snapshot().self_member(), "cluster service started");
        Ok(())
    }

    /// Stops the feed, then releases held leases, then stops the actor.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.feed.shutdown().await;
        self.lease_manager.shutdown().await;
        self.actor.shutdown().await;
        info!("cluster service stopped");
    }

    pub fn cluster(&self) -> &Arc<MembershipActor> {
        &self.actor
    }

    pub fn lease_manager(&self) -> &Arc<LeaseManager> {
        &self.lease_manager
    }
}
