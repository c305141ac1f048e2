//! Liveness tracking and failure detection.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::clock::SharedClock;
use crate::common::lock;
use crate::common::shutdown_requested;
use crate::common::to_chrono;
use crate::errors::EngineError;
use crate::errors::Result;
use crate::metrics::EngineMetrics;
use crate::model::Worker;
use crate::model::WorkerId;
use crate::model::WorkerState;
use crate::registry::WorkerRegistry;

/// Emitted once per worker when its heartbeat goes silent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureEvent {
    pub worker_id: WorkerId,
    pub last_heartbeat: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Tracked {
    last_heartbeat: DateTime<Utc>,
    failed: bool,
}

pub struct HeartbeatMonitor {
    tracked: Mutex<HashMap<WorkerId, Tracked>>,
    registry: Arc<WorkerRegistry>,
    timeout: Duration,
    clock: SharedClock,
    events: mpsc::UnboundedSender<FailureEvent>,
    metrics: EngineMetrics,
}

impl HeartbeatMonitor {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        timeout: Duration,
        clock: SharedClock,
        metrics: EngineMetrics,
    ) -> (Self, mpsc::UnboundedReceiver<FailureEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                tracked: Mutex::new(HashMap::new()),
                registry,
                timeout,
                clock,
                events,
                metrics,
            },
            events_rx,
        )
    }

    /// Start tracking a worker, counting registration as its first
    /// heartbeat. Re-registering clears an earlier failure.
    pub fn register(&self, mut worker: Worker) {
        let now = self.clock.now();
        let worker_id = worker.id.clone();
        worker.last_heartbeat = Some(now);
        let mut tracked = lock(&self.tracked);
        self.registry.insert(worker);
        tracked.insert(
            worker_id.clone(),
            Tracked {
                last_heartbeat: now,
                failed: false,
            },
        );
        tracing::debug!("Tracking heartbeats of {worker_id}");
    }

    /// Stop tracking a worker. A scan can never report it afterwards.
    pub fn unregister(&self, worker_id: &WorkerId) -> bool {
        let removed = lock(&self.tracked).remove(worker_id).is_some();
        if removed {
            tracing::debug!("Stopped tracking heartbeats of {worker_id}");
        }
        removed
    }

    /// Record a heartbeat now. Returns `false` if the worker has
    /// already been declared failed; its heartbeats are ignored until
    /// it is registered again.
    pub fn report_heartbeat(&self, worker_id: &WorkerId) -> Result<bool> {
        let now = self.clock.now();
        let mut tracked = lock(&self.tracked);
        let entry = tracked
            .get_mut(worker_id)
            .ok_or_else(|| EngineError::NotFound(format!("heartbeat target {worker_id}")))?;
        if entry.failed {
            tracing::debug!("Ignoring heartbeat of failed worker {worker_id}");
            return Ok(false);
        }
        if now > entry.last_heartbeat {
            entry.last_heartbeat = now;
        }
        if let Err(err) = self.registry.touch(worker_id, now) {
            tracing::trace!("Heartbeat for unregistered worker: {err}");
        }
        Ok(true)
    }

    pub fn is_tracked(&self, worker_id: &WorkerId) -> bool {
        lock(&self.tracked).contains_key(worker_id)
    }

    pub fn last_heartbeat(&self, worker_id: &WorkerId) -> Option<DateTime<Utc>> {
        lock(&self.tracked).get(worker_id).map(|t| t.last_heartbeat)
    }

    /// Declare every worker silent for longer than the timeout
    /// failed, emitting one event each.
    ///
    /// The whole scan holds the tracking lock so it cannot interleave
    /// with [`Self::unregister`].
    pub fn scan(&self) -> Vec<FailureEvent> {
        let now = self.clock.now();
        let timeout = to_chrono(self.timeout);
        let mut detected = Vec::new();
        let mut tracked = lock(&self.tracked);
        for (worker_id, entry) in tracked.iter_mut() {
            if entry.failed || now - entry.last_heartbeat <= timeout {
                continue;
            }
            entry.failed = true;
            if let Err(err) = self.registry.set_state(worker_id, WorkerState::Failed) {
                tracing::warn!("Failed worker missing from registry: {err}");
            }
            tracing::warn!(
                "Worker {worker_id} silent since {}, declaring failed",
                entry.last_heartbeat
            );
            self.metrics.heartbeat_failures.add(1, &[]);
            let event = FailureEvent {
                worker_id: worker_id.clone(),
                last_heartbeat: entry.last_heartbeat,
                detected_at: now,
            };
            if self.events.send(event.clone()).is_err() {
                tracing::error!("No consumer for failure event of {worker_id}");
            }
            detected.push(event);
        }
        detected
    }

    pub async fn run(self: Arc<Self>, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.scan();
                }
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }
        tracing::debug!("Heartbeat monitor stopped");
    }
}
