#![allow(dead_code)]

use std::sync::Arc;

use cluster_lease::{
    cluster::{Member, MembershipActor},
    config::LeaseConfig,
    interface::weight::FullClusterWeight,
    lease::{InMemoryLeaseStore, LeaseManager},
};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn member(name: &str) -> Member {
    Member::new(name, format!("10.1.0.{}", name.as_bytes()[0]))
}

pub fn lease_config() -> LeaseConfig {
    LeaseConfig {
        app_name: "newswriter".to_string(),
        session_ttl_ms: 6_000,
        ..LeaseConfig::default()
    }
}

/// One replica: its own membership view and lease manager over a shared store.
pub struct Replica {
    pub actor: Arc<MembershipActor>,
    pub manager: LeaseManager,
}

impl Replica {
    pub async fn start(name: &str, store: Arc<InMemoryLeaseStore>) -> Self {
        let actor = Arc::new(MembershipActor::new(member(name)));
        actor.start();
        let manager = LeaseManager::new(lease_config(), store, actor.clone(), Arc::new(FullClusterWeight));
        manager.start().await.expect("lease manager starts");
        Self { actor, manager }
    }

    pub async fn changed(&self, ready: &[&str], not_ready: &[&str]) {
        self.actor
            .cluster_changed(
                ready.iter().map(|n| member(n)),
                not_ready.iter().map(|n| member(n)),
            )
            .expect("actor accepts changes");
        self.actor.sync().await.expect("actor drains");
    }

    pub async fn stop(&self) {
        self.manager.shutdown().await;
        self.actor.shutdown().await;
    }
}
