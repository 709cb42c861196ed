use crate::cluster::Changes;

/// Callback notified of membership changes.
///
/// Watches run on the membership actor's worker. A watch that panics is
/// logged and skipped; it neither stops the worker nor hides the change from
/// other watches.
pub type ClusterWatch = Box<dyn Fn(&Changes) + Send + Sync>;
