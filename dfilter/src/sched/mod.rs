// Copyright 2024 dshield developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! The update scheduler.
//!
//! One driver task per auto-firing source computes sleeps from its strategy
//! and enqueues tasks; a dispatcher drains the priority queue under a
//! concurrency bound and hands grants to the rule manager, which reports
//! completions back into the strategies.

pub mod strategy;

pub use strategy::{StrategyState, UpdateStrategy};

use crate::Label;
use chrono::{DateTime, Local, Utc};
use log::{debug, info, warn};
use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering as AtomicOrdering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use tokio::{
    sync::{mpsc, watch, Notify, OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
};

/// Lifecycle of the scheduler as a whole.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    /// Not dispatching; drivers stopped.
    Stopped,
    /// Dispatching normally.
    Running,
    /// Operator-paused; tasks queue but are not dispatched.
    Paused,
    /// System-initiated pause (constrained network, low power).
    Suspended,
}

/// Dispatch priority for queued updates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum UpdatePriority {
    /// Opportunistic refresh.
    Background = 0,
    /// Normal timer-driven refresh.
    Normal = 1,
    /// Operator-requested refresh.
    High = 2,
    /// Must run next.
    Critical = 3,
}

/// One pending update.
#[derive(Clone, Debug)]
pub struct UpdateTask {
    /// Source to refresh.
    pub source: Label,
    /// Dispatch priority.
    pub priority: UpdatePriority,
    /// When the task was enqueued.
    pub scheduled_at: DateTime<Utc>,
    seq: u64,
}

// Heap order: priority first, then FIFO by sequence.
#[derive(Debug)]
struct QueuedTask(UpdateTask);

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for QueuedTask {}
impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then(other.0.seq.cmp(&self.0.seq))
    }
}

/// A dispatched task plus its concurrency permit. Dropping the grant frees
/// the slot; call [`UpdateScheduler::record_completion`] with the outcome.
pub struct UpdateGrant {
    /// The task to execute.
    pub task: UpdateTask,
    _permit: OwnedSemaphorePermit,
}

/// Aggregate scheduler counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct SchedulerStats {
    /// Tasks ever enqueued.
    pub scheduled: u64,
    /// Tasks completed successfully.
    pub completed: u64,
    /// Tasks that failed.
    pub failed: u64,
    /// Mean execution time of completed/failed tasks.
    pub average_duration: Option<Duration>,
}

#[derive(Default)]
struct StatsInner {
    scheduled: u64,
    completed: u64,
    failed: u64,
    total_duration: Duration,
}

struct SourceEntry {
    strategy: UpdateStrategy,
    state: StrategyState,
    driver: Option<JoinHandle<()>>,
    in_flight: bool,
    completion: Arc<Notify>,
    next_fire: Option<DateTime<Utc>>,
}

struct Inner {
    state: watch::Sender<SchedulerState>,
    queue: Mutex<BinaryHeap<QueuedTask>>,
    queue_notify: Notify,
    sources: Mutex<HashMap<Label, SourceEntry>>,
    grants: mpsc::Sender<UpdateGrant>,
    semaphore: Arc<Semaphore>,
    stats: Mutex<StatsInner>,
    seq: AtomicU64,
}

impl Inner {
    fn enqueue(&self, source: Label, priority: UpdatePriority) {
        let task = UpdateTask {
            source,
            priority,
            scheduled_at: Utc::now(),
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
        };
        self.queue.lock().unwrap().push(QueuedTask(task));
        self.stats.lock().unwrap().scheduled += 1;
        self.queue_notify.notify_one();
    }

    // Pop the best dispatchable task, skipping sources with an update already
    // in flight (one fetch per source at a time).
    fn pop_ready(&self) -> Option<UpdateTask> {
        let sources = self.sources.lock().unwrap();
        let mut queue = self.queue.lock().unwrap();
        let mut deferred = Vec::new();
        let mut picked = None;
        while let Some(QueuedTask(task)) = queue.pop() {
            let busy = sources
                .get(&task.source)
                .map(|s| s.in_flight)
                .unwrap_or(false);
            if busy {
                deferred.push(QueuedTask(task));
            } else {
                picked = Some(task);
                break;
            }
        }
        for task in deferred {
            queue.push(task);
        }
        picked
    }
}

async fn driver_loop(inner: Arc<Inner>, source: Label) {
    loop {
        let (delay, completion) = {
            let mut sources = inner.sources.lock().unwrap();
            let Some(entry) = sources.get_mut(&source) else {
                return;
            };
            let delay = entry.strategy.next_fire(&entry.state, Local::now());
            entry.next_fire = delay
                .map(|d| Utc::now() + chrono::Duration::from_std(d).unwrap_or_default());
            (delay, entry.completion.clone())
        };
        let Some(delay) = delay else {
            // Never auto-fires; external triggers enqueue directly.
            return;
        };
        tokio::time::sleep(delay).await;
        inner.enqueue(source.clone(), UpdatePriority::Normal);
        // The next interval starts once the update actually finished.
        completion.notified().await;
    }
}

async fn dispatcher_loop(inner: Arc<Inner>) {
    let mut state_rx = inner.state.subscribe();
    loop {
        if *state_rx.borrow() != SchedulerState::Running {
            if state_rx.changed().await.is_err() {
                return;
            }
            continue;
        }
        let Some(task) = inner.pop_ready() else {
            tokio::select! {
                _ = inner.queue_notify.notified() => {}
                r = state_rx.changed() => { if r.is_err() { return; } }
            }
            continue;
        };
        let Ok(permit) = inner.semaphore.clone().acquire_owned().await else {
            return;
        };
        {
            let mut sources = inner.sources.lock().unwrap();
            if let Some(entry) = sources.get_mut(&task.source) {
                entry.in_flight = true;
            }
        }
        debug!("dispatching update for source '{}'", task.source);
        if inner
            .grants
            .send(UpdateGrant {
                task,
                _permit: permit,
            })
            .await
            .is_err()
        {
            return;
        }
    }
}

/// Timer-driven scheduling across all enabled rule sources.
pub struct UpdateScheduler {
    inner: Arc<Inner>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl UpdateScheduler {
    /// Create a scheduler bounded to `max_concurrent` simultaneous updates.
    /// The receiver side delivers dispatched grants to the rule manager.
    pub fn new(max_concurrent: usize) -> (Self, mpsc::Receiver<UpdateGrant>) {
        let (grants, rx) = mpsc::channel(16);
        let (state, _) = watch::channel(SchedulerState::Stopped);
        let inner = Arc::new(Inner {
            state,
            queue: Mutex::new(BinaryHeap::new()),
            queue_notify: Notify::new(),
            sources: Mutex::new(HashMap::new()),
            grants,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            stats: Mutex::new(StatsInner::default()),
            seq: AtomicU64::new(0),
        });
        (
            Self {
                inner,
                dispatcher: Mutex::new(None),
            },
            rx,
        )
    }

    /// Register a source with its strategy. Drivers start when the scheduler
    /// runs (or immediately if it is already running).
    pub fn register_source(&self, source: Label, strategy: UpdateStrategy) {
        let state = strategy.initial_state();
        let mut sources = self.inner.sources.lock().unwrap();
        if let Some(old) = sources.insert(
            source.clone(),
            SourceEntry {
                state,
                strategy,
                driver: None,
                in_flight: false,
                completion: Arc::new(Notify::new()),
                next_fire: None,
            },
        ) {
            if let Some(driver) = old.driver {
                driver.abort();
            }
        }
        drop(sources);
        if self.state() != SchedulerState::Stopped {
            self.spawn_driver(&source);
        }
    }

    /// Remove a source and cancel its driver.
    pub fn remove_source(&self, source: &str) {
        if let Some(entry) = self.inner.sources.lock().unwrap().remove(source) {
            if let Some(driver) = entry.driver {
                driver.abort();
            }
        }
    }

    fn spawn_driver(&self, source: &str) {
        let mut sources = self.inner.sources.lock().unwrap();
        let Some(entry) = sources.get_mut(source) else {
            return;
        };
        if entry.driver.is_some() {
            return;
        }
        let inner = self.inner.clone();
        let label = Label::from(source);
        entry.driver = Some(tokio::spawn(driver_loop(inner, label)));
    }

    /// Start dispatching.
    pub fn start(&self) {
        let was = *self.inner.state.borrow();
        if was == SchedulerState::Running {
            return;
        }
        self.inner.state.send_replace(SchedulerState::Running);
        let mut dispatcher = self.dispatcher.lock().unwrap();
        if dispatcher.is_none() {
            *dispatcher = Some(tokio::spawn(dispatcher_loop(self.inner.clone())));
        }
        drop(dispatcher);
        let labels: Vec<Label> = self
            .inner
            .sources
            .lock()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        for label in labels {
            self.spawn_driver(&label);
        }
        info!("update scheduler running");
    }

    /// Stop dispatching and cancel all drivers; the queue is drained.
    pub fn stop(&self) {
        self.inner.state.send_replace(SchedulerState::Stopped);
        if let Some(dispatcher) = self.dispatcher.lock().unwrap().take() {
            dispatcher.abort();
        }
        let mut sources = self.inner.sources.lock().unwrap();
        for entry in sources.values_mut() {
            if let Some(driver) = entry.driver.take() {
                driver.abort();
            }
            entry.in_flight = false;
        }
        drop(sources);
        self.inner.queue.lock().unwrap().clear();
        info!("update scheduler stopped");
    }

    /// Operator pause; timers keep queueing, nothing dispatches.
    pub fn pause(&self) {
        self.inner.state.send_replace(SchedulerState::Paused);
    }

    /// System-initiated pause.
    pub fn suspend(&self) {
        self.inner.state.send_replace(SchedulerState::Suspended);
    }

    /// Resume from Paused/Suspended.
    pub fn resume(&self) {
        self.inner.state.send_replace(SchedulerState::Running);
        self.inner.queue_notify.notify_one();
    }

    /// Current state.
    pub fn state(&self) -> SchedulerState {
        *self.inner.state.borrow()
    }

    /// Manually request an update. Returns false when the source is unknown
    /// or a Manual strategy's minimum interval rejects the retrigger.
    pub fn trigger(&self, source: &str, priority: UpdatePriority) -> bool {
        {
            let mut sources = self.inner.sources.lock().unwrap();
            let Some(entry) = sources.get_mut(source) else {
                warn!("trigger for unknown source '{}'", source);
                return false;
            };
            if !entry
                .strategy
                .clone()
                .try_manual_trigger(&mut entry.state, Instant::now())
            {
                debug!("manual trigger for '{}' rejected by minimum interval", source);
                return false;
            }
        }
        self.inner.enqueue(Label::from(source), priority);
        true
    }

    /// Report the outcome of a dispatched task. Feeds the strategy, frees
    /// the per-source slot, and wakes the source's driver.
    pub fn record_completion(&self, source: &str, success: bool, duration: Duration) {
        {
            let mut stats = self.inner.stats.lock().unwrap();
            if success {
                stats.completed += 1;
            } else {
                stats.failed += 1;
            }
            stats.total_duration += duration;
        }
        let mut sources = self.inner.sources.lock().unwrap();
        if let Some(entry) = sources.get_mut(source) {
            entry.in_flight = false;
            let strategy = entry.strategy.clone();
            strategy.record_outcome(&mut entry.state, success);
            entry.completion.notify_one();
        }
        drop(sources);
        self.inner.queue_notify.notify_one();
    }

    /// The next automatic fire time for a source, if any.
    pub fn next_fire_time(&self, source: &str) -> Option<DateTime<Utc>> {
        self.inner
            .sources
            .lock()
            .unwrap()
            .get(source)
            .and_then(|e| e.next_fire)
    }

    /// Number of queued (not yet dispatched) tasks.
    pub fn pending_tasks(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> SchedulerStats {
        let stats = self.inner.stats.lock().unwrap();
        let finished = stats.completed + stats.failed;
        SchedulerStats {
            scheduled: stats.scheduled,
            completed: stats.completed,
            failed: stats.failed,
            average_duration: (finished > 0).then(|| stats.total_duration / finished as u32),
        }
    }
}

impl Drop for UpdateScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn fast_interval() -> UpdateStrategy {
        UpdateStrategy::Interval {
            every: Duration::from_millis(20),
            jitter_percent: 0.0,
        }
    }

    #[tokio::test]
    async fn interval_source_fires_repeatedly() {
        let (scheduler, mut rx) = UpdateScheduler::new(4);
        scheduler.register_source("list".into(), fast_interval());
        scheduler.start();

        let grant = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(grant.task.source, "list");
        drop(grant);
        scheduler.record_completion("list", true, Duration::from_millis(1));

        // A second cycle proves the driver rearms after completion.
        let grant = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(grant.task.source, "list");
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let (scheduler, mut rx) = UpdateScheduler::new(1);
        scheduler.register_source("a".into(), fast_interval());
        scheduler.register_source("b".into(), fast_interval());
        scheduler.start();

        let first = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        // Holding the first grant holds the only permit.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(rx.try_recv().is_err());

        let held = first.task.source.clone();
        drop(first);
        scheduler.record_completion(&held, true, Duration::from_millis(1));
        let second = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_ne!(second.task.source, held);
    }

    #[tokio::test]
    async fn one_in_flight_per_source() {
        let (scheduler, mut rx) = UpdateScheduler::new(4);
        scheduler.register_source("a".into(), fast_interval());
        scheduler.start();

        let first = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        // Extra triggers for the same source must not dispatch while the
        // first update is still running.
        scheduler.trigger("a", UpdatePriority::High);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(rx.try_recv().is_err());

        drop(first);
        scheduler.record_completion("a", true, Duration::from_millis(1));
        assert!(timeout(Duration::from_secs(2), rx.recv()).await.is_ok());
    }

    #[tokio::test]
    async fn paused_scheduler_queues_without_dispatching() {
        let (scheduler, mut rx) = UpdateScheduler::new(4);
        scheduler.register_source(
            "manual".into(),
            UpdateStrategy::Manual {
                minimum_interval: Duration::ZERO,
            },
        );
        scheduler.start();
        scheduler.pause();
        assert_eq!(scheduler.state(), SchedulerState::Paused);

        assert!(scheduler.trigger("manual", UpdatePriority::Normal));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(scheduler.pending_tasks(), 1);

        scheduler.resume();
        let grant = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(grant.task.source, "manual");
    }

    #[tokio::test]
    async fn higher_priority_dispatches_first() {
        let (scheduler, mut rx) = UpdateScheduler::new(1);
        scheduler.register_source(
            "bg".into(),
            UpdateStrategy::Manual {
                minimum_interval: Duration::ZERO,
            },
        );
        scheduler.register_source(
            "crit".into(),
            UpdateStrategy::Manual {
                minimum_interval: Duration::ZERO,
            },
        );
        scheduler.start();
        scheduler.pause();
        scheduler.trigger("bg", UpdatePriority::Background);
        scheduler.trigger("crit", UpdatePriority::Critical);
        scheduler.resume();

        let grant = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(grant.task.source, "crit");
    }

    #[tokio::test]
    async fn manual_minimum_interval_guards_retrigger() {
        let (scheduler, _rx) = UpdateScheduler::new(1);
        scheduler.register_source(
            "m".into(),
            UpdateStrategy::Manual {
                minimum_interval: Duration::from_secs(3600),
            },
        );
        scheduler.start();
        assert!(scheduler.trigger("m", UpdatePriority::Normal));
        assert!(!scheduler.trigger("m", UpdatePriority::Normal));
        assert!(!scheduler.trigger("unknown", UpdatePriority::Normal));
    }

    #[tokio::test]
    async fn stats_accumulate() {
        let (scheduler, _rx) = UpdateScheduler::new(1);
        scheduler.register_source(
            "m".into(),
            UpdateStrategy::Manual {
                minimum_interval: Duration::ZERO,
            },
        );
        scheduler.start();
        scheduler.trigger("m", UpdatePriority::Normal);
        scheduler.record_completion("m", true, Duration::from_millis(10));
        scheduler.record_completion("m", false, Duration::from_millis(30));

        let stats = scheduler.stats();
        assert_eq!(stats.scheduled, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.average_duration, Some(Duration::from_millis(20)));
    }
}
