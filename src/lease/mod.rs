//! Exclusive, time-bounded leases on named resources.
//!
//! Each replica decides locally, from its membership snapshot, which leases it
//! *should* hold. It then claims them with a compare-and-swap against a
//! strongly consistent [`LeaseStore`], tagging every claim with a session that
//! the store expires if the replica stops refreshing it. A replica that dies
//! without releasing therefore loses its leases after one session TTL.

use std::fmt;

pub(crate) mod manager;
pub mod memory;
mod renewer;
pub(crate) mod resource;
pub mod store;

#[cfg(feature = "etcd")]
pub mod etcd;

pub use manager::LeaseManager;
pub use memory::InMemoryLeaseStore;
pub use resource::ResourceLease;
pub use store::LeaseStore;

/// Identifier of a TTL'd session granted by the lease store. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub i64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// The current value of a lease key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    /// Identity of the holder.
    pub owner: String,
    /// Session the key is bound to.
    pub session: SessionId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    Acquired,
    /// The key already existed. Carries the competing record when the store
    /// could read it back.
    Conflict(Option<LeaseRecord>),
}
