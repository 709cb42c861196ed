//! [`LeaseStore`] backed by etcd.
//!
//! Sessions map onto etcd leases and lease keys are attached to them, so etcd
//! deletes a crashed holder's keys once its lease TTL runs out.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, LeaseKeepAliveStream, LeaseKeeper, PutOptions,
    Txn, TxnOp, TxnOpResponse,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{store::LeaseStore, LeaseRecord, PutOutcome, SessionId};
use crate::{
    config::LeaseConfig,
    error::{ClusterError, Result},
};

fn store_error(e: etcd_client::Error) -> ClusterError {
    ClusterError::store(e.to_string())
}

pub struct EtcdLeaseStore {
    client: Client,
    keepers: Mutex<HashMap<i64, (LeaseKeeper, LeaseKeepAliveStream)>>,
}

impl EtcdLeaseStore {
    pub async fn connect(config: &LeaseConfig) -> Result<Self> {
        let options = ConnectOptions::new()
            .with_connect_timeout(Duration::from_secs(5))
            .with_timeout(config.session_ttl() / 3);
        let client = Client::connect(&config.endpoints, Some(options))
            .await
            .map_err(store_error)?;
        info!(endpoints = ?config.endpoints, "connected to etcd");
        Ok(Self::new(client))
    }

    pub fn new(client: Client) -> Self {
        Self {
            client,
            keepers: Mutex::new(HashMap::new()),
        }
    }

    fn record(owner: &str, lease: i64) -> LeaseRecord {
        LeaseRecord {
            owner: owner.to_string(),
            session: SessionId(lease),
        }
    }
}

#[async_trait]
impl LeaseStore for EtcdLeaseStore {
    async fn grant(&self, ttl: Duration) -> Result<SessionId> {
        let ttl_secs = ttl.as_secs().max(1) as i64;
        let response = self
            .client
            .clone()
            .lease_grant(ttl_secs, None)
            .await
            .map_err(store_error)?;
        debug!(session = %SessionId(response.id()), ttl_secs, "granted etcd lease");
        Ok(SessionId(response.id()))
    }

    async fn keep_alive(&self, session: SessionId) -> Result<bool> {
        let mut keepers = self.keepers.lock().await;
        if !keepers.contains_key(&session.0) {
            let stream = self
                .client
                .clone()
                .lease_keep_alive(session.0)
                .await
                .map_err(store_error)?;
            keepers.insert(session.0, stream);
        }

        let result = match keepers.get_mut(&session.0) {
            Some((keeper, stream)) => match keeper.keep_alive().await {
                Ok(()) => stream.message().await,
                Err(e) => Err(e),
            },
            None => return Ok(false),
        };

        match result {
            Ok(Some(response)) if response.ttl() > 0 => Ok(true),
            Ok(_) => {
                keepers.remove(&session.0);
                Ok(false)
            }
            Err(e) => {
                // reopen the keep-alive stream on the next call
                keepers.remove(&session.0);
                Err(store_error(e))
            }
        }
    }

    async fn revoke(&self, session: SessionId) -> Result<()> {
        self.keepers.lock().await.remove(&session.0);
        self.client
            .clone()
            .lease_revoke(session.0)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        owner: &str,
        session: SessionId,
    ) -> Result<PutOutcome> {
        let txn = Txn::new()
            .when([Compare::version(key, CompareOp::Equal, 0)])
            .and_then([TxnOp::put(
                key,
                owner,
                Some(PutOptions::new().with_lease(session.0)),
            )])
            .or_else([TxnOp::get(key, None)]);
        let response = self.client.clone().txn(txn).await.map_err(store_error)?;
        if response.succeeded() {
            return Ok(PutOutcome::Acquired);
        }

        let competing = response.op_responses().into_iter().find_map(|op| match op {
            TxnOpResponse::Get(get) => get.kvs().first().and_then(|kv| {
                kv.value_str()
                    .ok()
                    .map(|holder| Self::record(holder, kv.lease()))
            }),
            _ => None,
        });
        Ok(PutOutcome::Conflict(competing))
    }

    async fn delete_if_owner(&self, key: &str, owner: &str) -> Result<bool> {
        let txn = Txn::new()
            .when([Compare::value(key, CompareOp::Equal, owner)])
            .and_then([TxnOp::delete(key, None)]);
        let response = self.client.clone().txn(txn).await.map_err(store_error)?;
        Ok(response.succeeded())
    }

    async fn get(&self, key: &str) -> Result<Option<LeaseRecord>> {
        let response = self
            .client
            .clone()
            .get(key, None)
            .await
            .map_err(store_error)?;
        Ok(response.kvs().first().and_then(|kv| {
            kv.value_str()
                .ok()
                .map(|holder| Self::record(holder, kv.lease()))
        }))
    }
}
