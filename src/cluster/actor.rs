//! The single owner of cluster membership state.
//!
//! Every mutation and every watch notification is a [`Command`] drained in
//! FIFO order by one worker task. A watch registered at some point therefore
//! sees the snapshot as of that point followed by every later change exactly
//! once, and no lock is held while application watch code runs.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};
use tokio::{
    sync::{mpsc, oneshot, Notify},
    task::JoinHandle,
};
use tracing::{debug, error, info};

use super::{tracker::ClusterChangeTracker, Changes, Cluster, Member, Snapshot};
use crate::{
    error::{ClusterError, Result},
    interface::watch::ClusterWatch,
};

enum Command {
    RegisterWatch(ClusterWatch),
    ApplyChange {
        ready: Vec<Member>,
        not_ready: Vec<Member>,
    },
    SyncPoint(Box<dyn FnOnce() + Send>),
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    Created,
    Running,
    Stopping,
    Stopped,
}

pub struct MembershipActor {
    snapshot: RwLock<Arc<Snapshot>>,
    state: Mutex<ActorState>,
    // Taken on shutdown; a missing sender is how new commands get refused.
    sender: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stopped: Notify,
}

impl MembershipActor {
    pub fn new(self_member: Member) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot::empty(self_member))),
            state: Mutex::new(ActorState::Created),
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            worker: Mutex::new(None),
            stopped: Notify::new(),
        }
    }

    pub fn state(&self) -> ActorState {
        *self.state.lock()
    }

    /// Starts draining the command queue. Commands accepted before start are
    /// processed first. Calling start more than once has no effect.
    pub fn start(self: &Arc<Self>) {
        let receiver = {
            let mut state = self.state.lock();
            if *state != ActorState::Created {
                return;
            }
            let receiver = match self.receiver.lock().take() {
                Some(receiver) => receiver,
                None => return,
            };
            *state = ActorState::Running;
            receiver
        };

        info!(member = %self.snapshot().self_member().name, "starting membership actor");
        let actor = Arc::clone(self);
        let handle = tokio::spawn(async move { actor.run(receiver).await });
        *self.worker.lock() = Some(handle);
    }

    /// Refuses further commands, lets everything already queued finish, and
    /// waits until the actor has stopped. Commands queued before start are
    /// handled here if the actor was never started. Safe to call repeatedly
    /// and concurrently.
    pub async fn shutdown(&self) {
        let stopped = self.stopped.notified();
        let unstarted = {
            let mut state = self.state.lock();
            match self.sender.lock().take() {
                Some(sender) if *state == ActorState::Created => {
                    *state = ActorState::Stopping;
                    drop(sender);
                    self.receiver.lock().take()
                }
                Some(sender) => {
                    *state = ActorState::Stopping;
                    info!("shutting down membership actor");
                    // Wakes the worker even if the queue is otherwise empty.
                    let _ = sender.send(Command::Stop);
                    None
                }
                None => None,
            }
        };

        if let Some(receiver) = unstarted {
            info!("membership actor stopped before it was started, draining queued commands");
            self.drain(receiver);
            return;
        }

        let worker = self.worker.lock().take();
        match worker {
            Some(worker) => {
                if let Err(e) = worker.await {
                    error!(error = %e, "membership actor worker exited abnormally");
                    self.mark_stopped();
                }
            }
            None if self.state() != ActorState::Stopped => stopped.await,
            None => {}
        }
    }

    /// Applies a batch of readiness transitions. Members in `becoming_ready`
    /// are added (or replace a member of the same name with a different
    /// address); members in `becoming_not_ready` are removed by name.
    pub fn cluster_changed(
        &self,
        becoming_ready: impl IntoIterator<Item = Member>,
        becoming_not_ready: impl IntoIterator<Item = Member>,
    ) -> Result<()> {
        self.enqueue(Command::ApplyChange {
            ready: becoming_ready.into_iter().collect(),
            not_ready: becoming_not_ready.into_iter().collect(),
        })
    }

    /// Runs `callback` once every command queued before it has been handled.
    pub fn sync_point(&self, callback: impl FnOnce() + Send + 'static) -> Result<()> {
        self.enqueue(Command::SyncPoint(Box::new(callback)))
    }

    /// Waits until every command queued before this call has been handled.
    pub async fn sync(&self) -> Result<()> {
        if self.state() == ActorState::Created {
            return Err(ClusterError::NotStarted {
                component: "membership actor",
            });
        }
        let (tx, rx) = oneshot::channel();
        self.sync_point(move || {
            let _ = tx.send(());
        })?;
        rx.await.map_err(|_| ClusterError::ShuttingDown)
    }

    fn enqueue(&self, command: Command) -> Result<()> {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(command).map_err(|_| ClusterError::ShuttingDown),
            None => Err(ClusterError::ShuttingDown),
        }
    }

    async fn run(&self, mut receiver: mpsc::UnboundedReceiver<Command>) {
        let mut watches: Vec<ClusterWatch> = Vec::new();
        while let Some(command) = receiver.recv().await {
            if !self.handle(command, &mut watches) {
                break;
            }
        }
        self.mark_stopped();
    }

    /// Handles commands queued before the actor was ever started. The sender
    /// is gone, so the queue is finite.
    fn drain(&self, mut receiver: mpsc::UnboundedReceiver<Command>) {
        let mut watches: Vec<ClusterWatch> = Vec::new();
        while let Ok(command) = receiver.try_recv() {
            if !self.handle(command, &mut watches) {
                break;
            }
        }
        self.mark_stopped();
    }

    /// Returns false once the actor should stop.
    fn handle(&self, command: Command, watches: &mut Vec<ClusterWatch>) -> bool {
        match command {
            Command::RegisterWatch(watch) => self.handle_new_watch(watch, watches),
            Command::ApplyChange { ready, not_ready } => {
                self.handle_cluster_change(ready, not_ready, watches)
            }
            Command::SyncPoint(callback) => {
                if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                    error!("error triggering sync point callback");
                }
            }
            Command::Stop => return false,
        }
        true
    }

    fn mark_stopped(&self) {
        *self.state.lock() = ActorState::Stopped;
        self.stopped.notify_waiters();
        info!("membership actor stopped");
    }

    fn handle_new_watch(&self, watch: ClusterWatch, watches: &mut Vec<ClusterWatch>) {
        let baseline = Changes::baseline(self.snapshot());
        if catch_unwind(AssertUnwindSafe(|| watch(&baseline))).is_err() {
            error!("error triggering watch during registration");
        }
        watches.push(watch);
    }

    fn handle_cluster_change(
        &self,
        ready: Vec<Member>,
        not_ready: Vec<Member>,
        watches: &[ClusterWatch],
    ) {
        if ready.is_empty() && not_ready.is_empty() {
            return;
        }

        let mut tracker = ClusterChangeTracker::new(self.snapshot());
        for member in ready {
            tracker.member_ready(member);
        }
        for member in &not_ready {
            tracker.member_not_ready(member);
        }

        let changes = tracker.finish();
        if !changes.has_diffs() {
            debug!("cluster change produced no diffs");
            return;
        }

        *self.snapshot.write() = Arc::clone(&changes.snapshot);
        for watch in watches {
            if catch_unwind(AssertUnwindSafe(|| watch(&changes))).is_err() {
                error!("error triggering watch in response to cluster change");
            }
        }
    }
}

impl Cluster for MembershipActor {
    fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.read().clone()
    }

    fn watch(&self, watch: ClusterWatch) -> Result<()> {
        self.enqueue(Command::RegisterWatch(watch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::{
        collections::{BTreeMap, BTreeSet},
        sync::atomic::{AtomicBool, Ordering},
    };

    fn member(name: &str) -> Member {
        Member::new(name, format!("10.0.0.{}", name.len()))
    }

    fn started(name: &str) -> Arc<MembershipActor> {
        let actor = Arc::new(MembershipActor::new(member(name)));
        actor.start();
        actor
    }

    fn recording_watch() -> (ClusterWatch, Arc<Mutex<Vec<Changes>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let watch: ClusterWatch = Box::new(move |changes: &Changes| sink.lock().push(changes.clone()));
        (watch, seen)
    }

    #[tokio::test]
    async fn starts_with_self_not_ready_and_no_members() {
        let actor = started("me");
        let snapshot = actor.snapshot();
        assert!(!snapshot.self_ready());
        assert!(snapshot.ready_members().is_empty());
        assert_eq!(actor.state(), ActorState::Running);
        actor.shutdown().await;
    }

    #[tokio::test]
    async fn self_ready_and_not_ready() {
        let actor = started("me");
        actor.cluster_changed(vec![member("me")], vec![]).unwrap();
        actor.sync().await.unwrap();
        assert!(actor.snapshot().self_ready());

        actor.cluster_changed(vec![], vec![member("me")]).unwrap();
        actor.sync().await.unwrap();
        assert!(!actor.snapshot().self_ready());
        actor.shutdown().await;
    }

    #[tokio::test]
    async fn new_watch_gets_baseline_then_diffs() {
        let actor = started("me");
        actor.cluster_changed(vec![member("a")], vec![]).unwrap();

        let (watch, seen) = recording_watch();
        actor.watch(watch).unwrap();
        actor.cluster_changed(vec![member("b")], vec![member("a")]).unwrap();
        actor.sync().await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(!seen[0].has_diffs());
        assert_eq!(
            seen[0].snapshot.ready_members(),
            &[member("a")].into_iter().collect()
        );
        assert_eq!(seen[1].added, [member("b")].into_iter().collect());
        assert_eq!(seen[1].removed, [member("a")].into_iter().collect());
        drop(seen);
        actor.shutdown().await;
    }

    #[tokio::test]
    async fn identical_ready_calls_produce_one_event() {
        let actor = started("me");
        let (watch, seen) = recording_watch();
        actor.watch(watch).unwrap();
        for _ in 0..3 {
            actor.cluster_changed(vec![member("a")], vec![]).unwrap();
            actor.cluster_changed(vec![], vec![member("ghost")]).unwrap();
        }
        actor.sync().await.unwrap();
        // baseline + one add
        assert_eq!(seen.lock().len(), 2);
        actor.shutdown().await;
    }

    #[tokio::test]
    async fn panicking_watch_does_not_block_others() {
        let actor = started("me");
        let exploding: ClusterWatch = Box::new(|_| panic!("watch blew up"));
        actor.watch(exploding).unwrap();
        let (watch, seen) = recording_watch();
        actor.watch(watch).unwrap();
        actor.cluster_changed(vec![member("a")], vec![]).unwrap();
        actor.sync().await.unwrap();

        assert_eq!(seen.lock().len(), 2);
        assert_eq!(actor.state(), ActorState::Running);
        actor.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_drains_queue_and_refuses_new_work() {
        let actor = Arc::new(MembershipActor::new(member("me")));
        let (watch, seen) = recording_watch();
        actor.watch(watch).unwrap();
        actor.cluster_changed(vec![member("a")], vec![]).unwrap();
        actor.cluster_changed(vec![member("b")], vec![]).unwrap();
        actor.start();
        actor.shutdown().await;

        assert_eq!(actor.state(), ActorState::Stopped);
        assert_eq!(seen.lock().len(), 3);
        assert_eq!(actor.snapshot().ready_members().len(), 2);
        assert!(matches!(
            actor.cluster_changed(vec![member("c")], vec![]),
            Err(ClusterError::ShuttingDown)
        ));
        assert!(actor.sync().await.is_err());

        // second shutdown is a no-op
        actor.shutdown().await;
        assert_eq!(actor.state(), ActorState::Stopped);
    }

    #[tokio::test]
    async fn shutdown_without_start_handles_queued_commands() {
        let actor = Arc::new(MembershipActor::new(member("me")));
        let (watch, seen) = recording_watch();
        let synced = Arc::new(AtomicBool::new(false));
        actor.watch(watch).unwrap();
        actor.cluster_changed(vec![member("a")], vec![]).unwrap();
        {
            let synced = Arc::clone(&synced);
            actor
                .sync_point(move || synced.store(true, Ordering::SeqCst))
                .unwrap();
        }

        actor.shutdown().await;

        assert_eq!(actor.state(), ActorState::Stopped);
        assert!(synced.load(Ordering::SeqCst));
        assert_eq!(actor.snapshot().ready_members().len(), 1);
        assert_eq!(seen.lock().len(), 2);

        // start after shutdown stays stopped
        actor.start();
        assert_eq!(actor.state(), ActorState::Stopped);
    }

    #[tokio::test]
    async fn concurrent_shutdowns_return_after_the_queue_drains() {
        let actor = started("me");
        let slow_done = Arc::new(AtomicBool::new(false));
        {
            let slow_done = Arc::clone(&slow_done);
            actor
                .sync_point(move || {
                    std::thread::sleep(std::time::Duration::from_millis(50));
                    slow_done.store(true, Ordering::SeqCst);
                })
                .unwrap();
        }

        let first = {
            let actor = Arc::clone(&actor);
            tokio::spawn(async move { actor.shutdown().await })
        };
        let second = {
            let actor = Arc::clone(&actor);
            tokio::spawn(async move {
                actor.shutdown().await;
                actor.state()
            })
        };

        first.await.unwrap();
        assert_eq!(second.await.unwrap(), ActorState::Stopped);
        assert!(slow_done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn sync_before_start_is_refused() {
        let actor = Arc::new(MembershipActor::new(member("a")));
        assert!(matches!(
            actor.sync().await,
            Err(ClusterError::NotStarted { .. })
        ));
    }

    #[tokio::test]
    async fn sync_point_runs_after_prior_commands() {
        let actor = started("me");
        actor.cluster_changed(vec![member("a")], vec![]).unwrap();
        let observed = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&observed);
        let reader = Arc::clone(&actor);
        actor
            .sync_point(move || *slot.lock() = Some(reader.snapshot().ready_members().len()))
            .unwrap();
        actor.sync().await.unwrap();
        assert_eq!(*observed.lock(), Some(1));
        actor.shutdown().await;
    }

    #[tokio::test]
    async fn watches_converge_on_final_membership_under_random_changes() {
        let names = ["a", "b", "c", "d", "e", "f"];
        let mut rng = StdRng::seed_from_u64(0x5eed);

        let actor = started("a");
        let (watch, seen) = recording_watch();
        actor.watch(watch).unwrap();

        let mut producers = Vec::new();
        for producer in 0..4 {
            let actor = Arc::clone(&actor);
            let steps: Vec<(bool, usize, u8)> = (0..200)
                .map(|_| (rng.gen_bool(0.5), rng.gen_range(0..names.len()), rng.gen_range(1..3)))
                .collect();
            producers.push(tokio::spawn(async move {
                for (ready, idx, ip) in steps {
                    let m = Member::new(names[idx], format!("10.{}.0.{}", producer, ip));
                    if ready {
                        actor.cluster_changed(vec![m], vec![]).unwrap();
                    } else {
                        actor.cluster_changed(vec![], vec![m]).unwrap();
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }
        actor.sync().await.unwrap();

        let mut view: BTreeMap<String, Member> = BTreeMap::new();
        for (i, changes) in seen.lock().iter().enumerate() {
            if i == 0 {
                assert!(!changes.has_diffs());
                continue;
            }
            assert!(changes.has_diffs());
            for m in &changes.removed {
                view.remove(&m.name);
            }
            for m in &changes.added {
                view.insert(m.name.clone(), m.clone());
            }
            let expected: BTreeSet<Member> = view.values().cloned().collect();
            assert_eq!(&expected, changes.snapshot.ready_members());
        }
        let final_view: BTreeSet<Member> = view.into_values().collect();
        assert_eq!(&final_view, actor.snapshot().ready_members());
        actor.shutdown().await;
    }
}
