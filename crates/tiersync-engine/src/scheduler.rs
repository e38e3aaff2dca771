//! Sync scheduler - priority queue plus the periodic driver that drains it.
//!
//! Ordering is Critical > High > Medium > Low, FIFO within a priority.
//! Queued requests run one at a time; Critical submissions skip the queue and
//! run inline in the caller's task.

use crate::config::SchedulerConfig;
use crate::engine::SyncEngine;
use crate::events::{EventBus, SyncEvent};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tiersync_core::{Priority, RequestId, SyncRequest, SyncResult};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

struct Queued {
    priority: Priority,
    seq: u64,
    request: SyncRequest,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // max-heap: higher priority first, then lower sequence number
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
pub struct SyncQueue {
    heap: Mutex<BinaryHeap<Queued>>,
    next_seq: AtomicU64,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, request: SyncRequest) {
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.heap.lock().await.push(Queued {
            priority: request.priority,
            seq,
            request,
        });
    }

    pub async fn pop(&self) -> Option<SyncRequest> {
        self.heap.lock().await.pop().map(|q| q.request)
    }

    pub async fn len(&self) -> usize {
        self.heap.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.heap.lock().await.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// How a submitted request was handled.
#[derive(Debug, Clone)]
pub enum Submission {
    /// Waiting in the queue for the driver.
    Queued(RequestId),
    /// Critical request, already executed.
    Completed(SyncResult),
}

impl Submission {
    pub fn request_id(&self) -> &str {
        match self {
            Submission::Queued(id) => id,
            Submission::Completed(result) => &result.request_id,
        }
    }
}

pub struct SyncScheduler {
    engine: Arc<SyncEngine>,
    queue: SyncQueue,
    events: EventBus,
    tick_interval: Duration,
    drain_budget: Duration,
    /// Held for the duration of a drain so queued work never runs concurrently.
    draining: Mutex<()>,
}

impl SyncScheduler {
    pub fn new(engine: Arc<SyncEngine>, events: EventBus, config: &SchedulerConfig) -> Self {
        Self {
            engine,
            queue: SyncQueue::new(),
            events,
            tick_interval: config.tick(),
            drain_budget: config.drain_budget(),
            draining: Mutex::new(()),
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Queue `request` regardless of its priority.
    pub async fn enqueue(&self, request: SyncRequest) -> RequestId {
        let id = request.id.clone();
        debug!("Queued sync {} ({:?})", id, request.priority);
        self.queue.push(request).await;
        self.events.publish(SyncEvent::SyncQueued {
            request_id: id.clone(),
        });
        id
    }

    /// Execute Critical requests now, queue everything else.
    pub async fn submit(&self, request: SyncRequest) -> Submission {
        if request.priority == Priority::Critical {
            info!("Critical sync {} executing immediately", request.id);
            Submission::Completed(self.engine.process(request).await)
        } else {
            Submission::Queued(self.enqueue(request).await)
        }
    }

    pub async fn len(&self) -> usize {
        self.queue.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.is_empty().await
    }

    /// Run queued requests until the queue is empty.
    pub async fn drain(&self) -> Vec<SyncResult> {
        let _draining = self.draining.lock().await;
        self.run_queued(None).await
    }

    /// Run queued requests until the queue is empty or `budget` has elapsed.
    /// The budget is checked between requests; one already started always completes.
    pub async fn drain_for(&self, budget: Duration) -> Vec<SyncResult> {
        let _draining = self.draining.lock().await;
        self.run_queued(Some(Instant::now() + budget)).await
    }

    /// One driver tick. Skipped when a drain is already in progress.
    pub async fn tick(&self) -> usize {
        let Ok(_draining) = self.draining.try_lock() else {
            debug!("Previous drain still running, skipping tick");
            return 0;
        };
        self.run_queued(Some(Instant::now() + self.drain_budget))
            .await
            .len()
    }

    /// Start the periodic driver. Stops when `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("SyncScheduler started (tick {:?})", self.tick_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let ran = self.tick().await;
                        if ran > 0 {
                            debug!("Scheduler tick processed {} requests", ran);
                        }
                    }
                }
            }
            info!("SyncScheduler stopped");
        })
    }

    async fn run_queued(&self, deadline: Option<Instant>) -> Vec<SyncResult> {
        let mut results = Vec::new();
        while deadline.map_or(true, |d| Instant::now() < d) {
            let Some(request) = self.queue.pop().await else {
                break;
            };
            results.push(self.engine.process(request).await);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::default_registry;
    use crate::resolver::ConflictResolver;
    use crate::store::StateStore;

    fn scheduler() -> SyncScheduler {
        let registry = Arc::new(default_registry());
        let events = EventBus::new(256);
        let store = Arc::new(StateStore::new(events.clone()));
        for agent in registry.all() {
            store.register_agent(&agent);
        }
        let engine = Arc::new(SyncEngine::new(
            registry,
            store,
            Arc::new(ConflictResolver::default()),
            events.clone(),
        ));
        SyncScheduler::new(engine, events, &SchedulerConfig::default())
    }

    #[tokio::test]
    async fn queue_pops_by_priority_then_arrival() {
        let queue = SyncQueue::new();
        let mut ids = Vec::new();
        for p in [
            Priority::Low,
            Priority::Critical,
            Priority::Medium,
            Priority::Critical,
            Priority::High,
        ] {
            let req = SyncRequest::full("mrf").with_priority(p);
            ids.push(req.id.clone());
            queue.push(req).await;
        }
        let mut popped = Vec::new();
        while let Some(req) = queue.pop().await {
            popped.push(req.id);
        }
        assert_eq!(popped, vec![
            ids[1].clone(),
            ids[3].clone(),
            ids[4].clone(),
            ids[2].clone(),
            ids[0].clone(),
        ]);
    }

    #[tokio::test]
    async fn critical_submission_runs_inline() {
        let scheduler = scheduler();
        let sub = scheduler
            .submit(SyncRequest::full("oracle").with_priority(Priority::Critical))
            .await;
        assert!(matches!(sub, Submission::Completed(_)));
        assert_eq!(scheduler.len().await, 0);

        let sub = scheduler
            .submit(SyncRequest::full("oracle").with_priority(Priority::High))
            .await;
        assert!(matches!(sub, Submission::Queued(_)));
        assert_eq!(scheduler.len().await, 1);
    }

    #[tokio::test]
    async fn zero_budget_leaves_queue_untouched() {
        let scheduler = scheduler();
        scheduler.enqueue(SyncRequest::full("echo")).await;
        let ran = scheduler.drain_for(Duration::ZERO).await;
        assert!(ran.is_empty());
        assert_eq!(scheduler.len().await, 1);
        assert_eq!(scheduler.drain().await.len(), 1);
    }

    #[tokio::test]
    async fn spawned_driver_drains_and_stops() {
        let config = SchedulerConfig {
            tick_ms: 5,
            ..SchedulerConfig::default()
        };
        let base = scheduler();
        let scheduler = Arc::new(SyncScheduler::new(
            base.engine.clone(),
            base.events.clone(),
            &config,
        ));
        scheduler.enqueue(SyncRequest::full("echo")).await;
        let cancel = CancellationToken::new();
        let handle = scheduler.clone().spawn(cancel.clone());

        let deadline = Instant::now() + Duration::from_secs(2);
        while !scheduler.is_empty().await && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(scheduler.is_empty().await);
        cancel.cancel();
        handle.await.unwrap();
    }
}
