//! Keeps the membership actor in step with the orchestrator's view of pods.
//!
//! The feed holds one long-lived watch open against the orchestrator and turns
//! each pod event into a ready / not-ready call on the [`MembershipActor`].
//! When the watch fails or ends it is reopened after an exponential backoff;
//! an outage that outlasts the escalation threshold is logged as an error, and
//! logged again each time the threshold elapses while it continues.
//!
//! A reopened watch starts with a full listing of the current pods. Pods the
//! feed reported ready that are missing from that listing were deleted while
//! the watch was down, and are reported not ready once the listing completes.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{
    sync::Notify,
    task::JoinHandle,
    time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};

use crate::{
    cluster::{Member, MembershipActor},
    config::FeedConfig,
    error::Result,
    util::retry::ExponentialBackoff,
};

#[cfg(feature = "kubernetes")]
pub mod kubernetes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

/// The parts of a pod watch event membership cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodEvent {
    pub kind: ChangeKind,
    pub name: String,
    pub ip_address: Option<String>,
    /// Ready flag of each container; `None` when the pod reports no statuses yet.
    pub containers_ready: Option<Vec<bool>>,
}

impl PodEvent {
    /// A pod is ready once every container is ready and it has an address.
    pub fn is_ready(&self) -> bool {
        let containers_ready = match &self.containers_ready {
            Some(statuses) => statuses.iter().all(|ready| *ready),
            None => false,
        };
        containers_ready
            && self
                .ip_address
                .as_deref()
                .map_or(false, |ip| !ip.is_empty())
    }

    pub fn member(&self) -> Member {
        Member::new(self.name.clone(), self.ip_address.clone().unwrap_or_default())
    }
}

/// What a [`PodWatcher`] reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    Pod(PodEvent),
    /// A full listing of the current pods follows as `Pod` events.
    ListStarted,
    /// The listing is complete. Pods it did not mention no longer exist.
    ListDone,
}

/// Source of pod lifecycle events.
#[async_trait]
pub trait PodWatcher: Send + Sync {
    /// Opens a watch and passes every event to `on_event` until the stream
    /// ends (`Ok`) or fails (`Err`).
    ///
    /// Watchers that replay the current pods on open should bracket the
    /// replay with `ListStarted` and `ListDone` so that pods deleted while no
    /// watch was open get dropped.
    async fn watch(&self, on_event: &mut (dyn FnMut(FeedEvent) + Send)) -> Result<()>;
}

pub struct MembershipFeed {
    watcher: Arc<dyn PodWatcher>,
    actor: Arc<MembershipActor>,
    config: FeedConfig,
    running: AtomicBool,
    shutdown: Notify,
    worker: Mutex<Option<JoinHandle<()>>>,
    // set together with `worker`, under its lock
    started: AtomicBool,
    finished: AtomicBool,
    stopped: Notify,
}

impl MembershipFeed {
    pub fn new(
        watcher: Arc<dyn PodWatcher>,
        actor: Arc<MembershipActor>,
        config: FeedConfig,
    ) -> Self {
        Self {
            watcher,
            actor,
            config,
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
            worker: Mutex::new(None),
            started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            stopped: Notify::new(),
        }
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("starting membership feed");
        let feed = Arc::clone(self);
        let mut worker = self.worker.lock();
        *worker = Some(tokio::spawn(async move { feed.run().await }));
        self.started.store(true, Ordering::SeqCst);
    }

    /// Stops the watch loop and waits for it to exit. A concurrent caller
    /// waits for the first one to finish joining the worker.
    pub async fn shutdown(&self) {
        let stopped = self.stopped.notified();
        if self.running.swap(false, Ordering::SeqCst) {
            info!("shutting down membership feed");
            self.shutdown.notify_one();
        }

        let (worker, started) = {
            let mut worker = self.worker.lock();
            (worker.take(), self.started.load(Ordering::SeqCst))
        };
        match worker {
            Some(worker) => {
                if let Err(e) = worker.await {
                    error!(error = %e, "membership feed exited abnormally");
                }
                self.finished.store(true, Ordering::SeqCst);
                self.stopped.notify_waiters();
            }
            None if started && !self.finished.load(Ordering::SeqCst) => stopped.await,
            None => {}
        }
    }

    async fn run(&self) {
        let mut backoff = ExponentialBackoff::new(self.config.min_backoff(), self.config.max_backoff());
        let mut outage = OutageTracker::new(self.config.escalation_threshold());
        let mut pods = ReportedPods::default();
        let mut attempt: u64 = 0;

        while self.running.load(Ordering::SeqCst) {
            attempt += 1;
            pods.abandon_listing();
            let result = {
                let mut on_event = |event: FeedEvent| {
                    backoff.reset();
                    outage.clear();
                    if let Some((ready, not_ready)) = pods.observe(event) {
                        self.apply(ready, not_ready);
                    }
                };
                tokio::select! {
                    result = self.watcher.watch(&mut on_event) => Some(result),
                    _ = self.shutdown.notified() => None,
                }
            };

            let failure = match result {
                None => break,
                Some(Ok(())) => {
                    debug!(attempt, "pod watch ended, reopening");
                    None
                }
                Some(Err(e)) => Some(e),
            };
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            let delay = backoff.next_delay();
            if outage.record_failure(Instant::now()) {
                match &failure {
                    Some(e) => error!(attempt, error = %e, ?delay, "pod watch has been failing for longer than {:?}", outage.threshold),
                    None => error!(attempt, ?delay, "pod watch has been unhealthy for longer than {:?}", outage.threshold),
                }
            } else if let Some(e) = &failure {
                warn!(attempt, error = %e, ?delay, "pod watch failed, retrying");
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.notified() => break,
            }
        }

        info!("membership feed stopped");
    }

    fn apply(&self, ready: Vec<Member>, not_ready: Vec<Member>) {
        if let Err(e) = self.actor.cluster_changed(ready, not_ready) {
            debug!(error = %e, "dropping membership change");
        }
    }
}

/// The pods this feed has reported ready, and the names seen by a listing in
/// progress.
#[derive(Debug, Default)]
struct ReportedPods {
    ready: BTreeMap<String, Member>,
    listing: Option<BTreeSet<String>>,
}

impl ReportedPods {
    /// A listing cut short by a failed watch proves nothing.
    fn abandon_listing(&mut self) {
        self.listing = None;
    }

    /// Returns the ready and not-ready members to report for `event`, if any.
    fn observe(&mut self, event: FeedEvent) -> Option<(Vec<Member>, Vec<Member>)> {
        match event {
            FeedEvent::ListStarted => {
                self.listing = Some(BTreeSet::new());
                None
            }
            FeedEvent::Pod(pod) => {
                if let Some(listing) = &mut self.listing {
                    listing.insert(pod.name.clone());
                }
                let member = pod.member();
                match pod.kind {
                    ChangeKind::Added | ChangeKind::Modified if pod.is_ready() => {
                        self.ready.insert(pod.name, member.clone());
                        Some((vec![member], Vec::new()))
                    }
                    ChangeKind::Added | ChangeKind::Modified | ChangeKind::Deleted => {
                        self.ready.remove(&pod.name);
                        Some((Vec::new(), vec![member]))
                    }
                }
            }
            FeedEvent::ListDone => {
                let listed = self.listing.take()?;
                let stale: Vec<Member> = self
                    .ready
                    .iter()
                    .filter(|(name, _)| !listed.contains(*name))
                    .map(|(_, member)| member.clone())
                    .collect();
                if stale.is_empty() {
                    return None;
                }
                for member in &stale {
                    info!(pod = %member.name, "pod disappeared while the watch was down");
                    self.ready.remove(&member.name);
                }
                Some((Vec::new(), stale))
            }
        }
    }
}

/// Tracks how long the watch has gone without delivering an event.
struct OutageTracker {
    threshold: Duration,
    started: Option<Instant>,
}

impl OutageTracker {
    fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            started: None,
        }
    }

    /// Returns true when the outage has lasted past the threshold, and
    /// restarts the clock so an ongoing outage escalates again later.
    fn record_failure(&mut self, now: Instant) -> bool {
        let started = *self.started.get_or_insert(now);
        if now.duration_since(started) >= self.threshold {
            self.started = Some(now);
            true
        } else {
            false
        }
    }

    fn clear(&mut self) {
        self.started = None;
    }
}
