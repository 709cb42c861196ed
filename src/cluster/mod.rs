//! Cluster membership: who the ready replicas are, and which of them owns a
//! given resource.
//!
//! All of the types here are immutable values. A [`Snapshot`] is replaced
//! wholesale by the [`MembershipActor`] whenever membership changes, and each
//! replacement is announced to watches as a [`Changes`].

use std::{collections::BTreeSet, fmt, sync::Arc};

use crate::{error::Result, interface::watch::ClusterWatch};

pub mod actor;
pub mod hash_ring;
mod tracker;

pub use actor::{ActorState, MembershipActor};
pub use hash_ring::{ClusterHashRing, ResourceMapper};

/// One replica, identified by its pod name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Member {
    pub name: String,
    pub ip_address: String,
}

impl Member {
    pub fn new(name: impl Into<String>, ip_address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ip_address: ip_address.into(),
        }
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.ip_address)
    }
}

/// A consistent point-in-time view of the cluster, with a resource mapper
/// bound to exactly the members in `ready_members`.
#[derive(Clone)]
pub struct Snapshot {
    self_member: Member,
    ready_members: BTreeSet<Member>,
    self_ready: bool,
    resource_mapper: Arc<dyn ResourceMapper>,
}

impl Snapshot {
    pub fn new(self_member: Member, ready_members: BTreeSet<Member>) -> Self {
        let resource_mapper: Arc<dyn ResourceMapper> =
            Arc::new(ClusterHashRing::new(&ready_members));
        Self::with_mapper(self_member, ready_members, resource_mapper)
    }

    pub fn with_mapper(
        self_member: Member,
        ready_members: BTreeSet<Member>,
        resource_mapper: Arc<dyn ResourceMapper>,
    ) -> Self {
        let self_ready = ready_members.iter().any(|m| m.name == self_member.name);
        Self {
            self_member,
            ready_members,
            self_ready,
            resource_mapper,
        }
    }

    pub fn empty(self_member: Member) -> Self {
        Self::new(self_member, BTreeSet::new())
    }

    pub fn self_member(&self) -> &Member {
        &self.self_member
    }

    pub fn ready_members(&self) -> &BTreeSet<Member> {
        &self.ready_members
    }

    pub fn self_ready(&self) -> bool {
        self.self_ready
    }

    /// Ready members other than this replica.
    pub fn ready_peers(&self) -> BTreeSet<Member> {
        self.ready_members
            .iter()
            .filter(|m| m.name != self.self_member.name)
            .cloned()
            .collect()
    }

    pub fn resource_mapper(&self) -> &Arc<dyn ResourceMapper> {
        &self.resource_mapper
    }

    /// Owner of `resource_id` among the ready members.
    pub fn owner(&self, resource_id: &str) -> Result<Member> {
        self.resource_mapper.owner(resource_id)
    }
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.self_member == other.self_member && self.ready_members == other.ready_members
    }
}

impl Eq for Snapshot {}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("self_member", &self.self_member)
            .field("self_ready", &self.self_ready)
            .field("ready_members", &self.ready_members)
            .finish()
    }
}

/// One membership transition: the snapshot it produced plus the delta.
///
/// A member whose address changed shows up in `added` only; consumers apply
/// `added` by name, replacing any previous entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Changes {
    pub snapshot: Arc<Snapshot>,
    pub added: BTreeSet<Member>,
    pub removed: BTreeSet<Member>,
}

impl Changes {
    /// A zero-diff change, used as the baseline for new watches.
    pub fn baseline(snapshot: Arc<Snapshot>) -> Self {
        Self {
            snapshot,
            added: BTreeSet::new(),
            removed: BTreeSet::new(),
        }
    }

    pub fn has_diffs(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

/// Read side of cluster membership, as consumed by leases and applications.
pub trait Cluster: Send + Sync {
    /// The last published snapshot.
    fn snapshot(&self) -> Arc<Snapshot>;

    /// Registers `watch`. It is called once with the current snapshot and no
    /// diffs, then once per subsequent membership change, in order.
    fn watch(&self, watch: ClusterWatch) -> Result<()>;

    fn new_resource_mapper(&self, members: &BTreeSet<Member>) -> Arc<dyn ResourceMapper> {
        Arc::new(ClusterHashRing::new(members))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(names: &[&str]) -> BTreeSet<Member> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| Member::new(*name, format!("10.0.0.{}", i + 1)))
            .collect()
    }

    #[test]
    fn self_ready_follows_ready_members() {
        let me = Member::new("a", "10.0.0.1");
        assert!(!Snapshot::empty(me.clone()).self_ready());
        assert!(Snapshot::new(me.clone(), members(&["a", "b"])).self_ready());
        assert!(!Snapshot::new(me, members(&["b", "c"])).self_ready());
    }

    #[test]
    fn ready_peers_excludes_self() {
        let snapshot = Snapshot::new(Member::new("a", "10.0.0.1"), members(&["a", "b", "c"]));
        let peers: Vec<String> = snapshot.ready_peers().into_iter().map(|m| m.name).collect();
        assert_eq!(peers, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn snapshot_equality_is_structural() {
        let me = Member::new("a", "10.0.0.1");
        assert_eq!(
            Snapshot::new(me.clone(), members(&["a", "b"])),
            Snapshot::new(me.clone(), members(&["b", "a"]))
        );
        assert_ne!(
            Snapshot::new(me.clone(), members(&["a"])),
            Snapshot::new(me, members(&["a", "b"]))
        );
    }

    #[test]
    fn empty_snapshot_has_no_owner() {
        let snapshot = Snapshot::empty(Member::new("a", "10.0.0.1"));
        assert!(snapshot.owner("r1").is_err());
    }

    #[test]
    fn baseline_has_no_diffs() {
        let snapshot = Arc::new(Snapshot::empty(Member::new("a", "10.0.0.1")));
        assert!(!Changes::baseline(snapshot).has_diffs());
    }
}
