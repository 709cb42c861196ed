use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use tracing::info;

use super::{Changes, Member, Snapshot};

/// Applies ready / not-ready transitions to a snapshot and computes the delta.
///
/// The delta is the net difference between the starting and final ready sets,
/// so a member made ready and not-ready within one batch produces nothing.
pub(crate) struct ClusterChangeTracker {
    snapshot: Arc<Snapshot>,
    ready: BTreeMap<String, Member>,
}

impl ClusterChangeTracker {
    pub(crate) fn new(snapshot: Arc<Snapshot>) -> Self {
        let ready = snapshot
            .ready_members()
            .iter()
            .map(|m| (m.name.clone(), m.clone()))
            .collect();
        Self { snapshot, ready }
    }

    pub(crate) fn member_ready(&mut self, member: Member) {
        if self.ready.get(&member.name) == Some(&member) {
            return;
        }
        self.ready.insert(member.name.clone(), member);
    }

    pub(crate) fn member_not_ready(&mut self, member: &Member) {
        self.ready.remove(&member.name);
    }

    pub(crate) fn finish(self) -> Changes {
        let before = self.snapshot.ready_members();
        let before_names: BTreeSet<&str> = before.iter().map(|m| m.name.as_str()).collect();

        let added: BTreeSet<Member> = self
            .ready
            .values()
            .filter(|m| !before.contains(*m))
            .cloned()
            .collect();
        let removed: BTreeSet<Member> = before
            .iter()
            .filter(|m| !self.ready.contains_key(&m.name))
            .cloned()
            .collect();

        if added.is_empty() && removed.is_empty() {
            return Changes::baseline(self.snapshot);
        }

        for member in &added {
            if before_names.contains(member.name.as_str()) {
                info!(member = %member.name, ip = %member.ip_address, "member address changed");
            } else {
                info!(member = %member.name, ip = %member.ip_address, "member ready");
            }
        }
        for member in &removed {
            info!(member = %member.name, "member no longer ready");
        }

        let ready_members: BTreeSet<Member> = self.ready.into_values().collect();
        let snapshot = Snapshot::new(self.snapshot.self_member().clone(), ready_members);
        Changes {
            snapshot: Arc::new(snapshot),
            added,
            removed,
        }
    }
}
