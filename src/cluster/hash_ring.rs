//! Consistent-hash assignment of resources to ready members.
//!
//! Every member contributes `vnodes_per_member` points to a ring, each point
//! hashed from `"{name} {index}"`. A resource belongs to the first point at or
//! after its own hash, wrapping around past the largest point. Two replicas
//! with the same member set therefore agree on every owner without talking to
//! each other, and removing a member only moves the resources that sat on its
//! points.

use std::{collections::BTreeSet, fmt};

use super::Member;
use crate::error::{ClusterError, Result};

pub const DEFAULT_VNODES_PER_MEMBER: u32 = 16;

pub type HashFn = fn(&[u8]) -> u64;

/// Maps a resource id to exactly one owning member.
pub trait ResourceMapper: Send + Sync + fmt::Debug {
    /// # Errors
    ///
    /// [`ClusterError::NoMembersAvailable`] when the mapper was built from an
    /// empty member set.
    fn owner(&self, resource_id: &str) -> Result<Member>;
}

#[derive(Clone)]
pub struct ClusterHashRing {
    points: Vec<(u64, Member)>,
    hash: HashFn,
}

impl ClusterHashRing {
    pub fn new(members: &BTreeSet<Member>) -> Self {
        Self::with_hasher(members, DEFAULT_VNODES_PER_MEMBER, ring_hash)
    }

    pub fn with_hasher<'a>(
        members: impl IntoIterator<Item = &'a Member>,
        vnodes_per_member: u32,
        hash: HashFn,
    ) -> Self {
        let mut points = Vec::new();
        for member in members {
            for vnode in 0..vnodes_per_member {
                let point = hash(format!("{} {}", member.name, vnode).as_bytes());
                points.push((point, member.clone()));
            }
        }
        // Ties are broken by name so that insertion order never matters.
        points.sort_by(|(a, a_member), (b, b_member)| {
            a.cmp(b).then_with(|| a_member.name.cmp(&b_member.name))
        });
        Self { points, hash }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

impl ResourceMapper for ClusterHashRing {
    fn owner(&self, resource_id: &str) -> Result<Member> {
        if self.points.is_empty() {
            return Err(ClusterError::NoMembersAvailable {
                resource: resource_id.to_string(),
            });
        }

        let key = (self.hash)(resource_id.as_bytes());
        let idx = self.points.partition_point(|(point, _)| *point < key);
        let (_, owner) = &self.points[idx % self.points.len()];
        Ok(owner.clone())
    }
}

impl fmt::Debug for ClusterHashRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let members: BTreeSet<&str> = self.points.iter().map(|(_, m)| m.name.as_str()).collect();
        f.debug_struct("ClusterHashRing")
            .field("members", &members)
            .field("points", &self.points.len())
            .finish()
    }
}

/// 64-bit FNV-1a followed by the murmur3 finalizer, so that keys differing
/// only in a trailing digit still land far apart on the ring.
pub fn ring_hash(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xff51_afd7_ed55_8ccd);
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    hash ^= hash >> 33;
    hash
}
