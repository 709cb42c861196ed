use crate::lease::ResourceLease;

/// Observes lease ownership transitions.
///
/// Listeners run outside the lease's lock, so they may query the lease (for
/// example with [`ResourceLease::is_held`]) without deadlocking.
pub trait LeaseListener: Send + Sync {
    /// Called after this process acquires the lease. Also called on
    /// registration if the lease is already held.
    fn after_acquire(&self, _lease: &ResourceLease) {}

    /// Called before this process gives the lease up.
    fn before_release(&self, _lease: &ResourceLease) {}
}
