/// Share of work this replica should take on.
///
/// A weight of zero keeps the replica in the cluster but makes it decline
/// every lease, which is how passive deployments stay warm without doing work.
pub trait ClusterWeightProvider: Send + Sync {
    fn weight(&self) -> u32;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FullClusterWeight;

impl ClusterWeightProvider for FullClusterWeight {
    fn weight(&self) -> u32 {
        100
    }
}
