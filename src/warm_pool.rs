//! Inventory of idle, ready workers keyed by resource class.
//!
//! Taking an entry and checking pool membership happen under one
//! lock, so concurrent acquirers never receive the same worker.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;

use crate::clock::SharedClock;
use crate::common::lock;
use crate::common::shutdown_requested;
use crate::errors::EngineError;
use crate::errors::Result;
use crate::heartbeat::HeartbeatMonitor;
use crate::metrics::label;
use crate::metrics::EngineMetrics;
use crate::model::ResourceClass;
use crate::model::WarmPoolEntry;
use crate::model::Worker;
use crate::model::WorkerId;
use crate::model::WorkerState;
use crate::racing::RacingProvisioner;
use crate::registry::WorkerRegistry;

/// Something that still depends on a worker and keeps it out of the
/// pool.
pub trait Obligations: Send + Sync {
    /// Why `worker_id` cannot be released, if it cannot.
    fn blocks_release(&self, worker_id: &WorkerId) -> Option<String>;
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub classes: Vec<ResourceClass>,
    pub min_ready: usize,
    pub max_ready: usize,
    pub race_candidates: usize,
    pub max_price: Option<f64>,
}

#[derive(Debug, Default)]
struct PoolState {
    entries: HashMap<ResourceClass, VecDeque<WarmPoolEntry>>,
    workers: HashMap<WorkerId, Worker>,
}

impl PoolState {
    fn take(&mut self, class: &ResourceClass) -> Option<Worker> {
        let entry = self.entries.get_mut(class)?.pop_front()?;
        self.workers.remove(&entry.worker_id)
    }
}

pub struct WarmPool {
    state: Mutex<PoolState>,
    enrolled: Notify,
    registry: Arc<WorkerRegistry>,
    monitor: Arc<HeartbeatMonitor>,
    obligations: Vec<Arc<dyn Obligations>>,
    racer: Arc<RacingProvisioner>,
    clock: SharedClock,
    metrics: EngineMetrics,
    settings: PoolSettings,
}

impl WarmPool {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        monitor: Arc<HeartbeatMonitor>,
        obligations: Vec<Arc<dyn Obligations>>,
        racer: Arc<RacingProvisioner>,
        clock: SharedClock,
        metrics: EngineMetrics,
        settings: PoolSettings,
    ) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            enrolled: Notify::new(),
            registry,
            monitor,
            obligations,
            racer,
            clock,
            metrics,
            settings,
        }
    }

    /// Take a ready worker of `class`, waiting up to `timeout` for
    /// one to be enrolled.
    pub async fn acquire(&self, class: &ResourceClass, timeout: Duration) -> Result<Worker> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.enrolled.notified();
            tokio::pin!(notified);
            // Register interest before looking so an enroll in between
            // is not missed.
            notified.as_mut().enable();
            let taken = lock(&self.state).take(class);
            if let Some(worker) = taken {
                tracing::info!("Acquired {} from the {class} warm pool", worker.id);
                self.metrics.warm_pool_acquire.add(1, &label("outcome", "hit"));
                return Ok(worker);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                self.metrics
                    .warm_pool_acquire
                    .add(1, &label("outcome", "empty"));
                return Err(EngineError::PoolEmpty(class.to_string()));
            }
        }
    }

    /// Add a ready worker that nothing else owns. Enrolling a worker
    /// already in the pool is a no-op.
    pub fn enroll(&self, worker: Worker) -> Result<bool> {
        if worker.state != WorkerState::Ready {
            return Err(EngineError::Conflict(format!(
                "worker {} is {:?}, not ready",
                worker.id, worker.state
            )));
        }
        {
            let mut state = lock(&self.state);
            if state.workers.contains_key(&worker.id) {
                return Ok(false);
            }
            state
                .entries
                .entry(worker.resource_class.clone())
                .or_default()
                .push_back(WarmPoolEntry {
                    resource_class: worker.resource_class.clone(),
                    worker_id: worker.id.clone(),
                    enrolled_at: self.clock.now(),
                });
            tracing::debug!("Enrolled {} into the {} pool", worker.id, worker.resource_class);
            state.workers.insert(worker.id.clone(), worker);
        }
        self.enrolled.notify_waiters();
        Ok(true)
    }

    /// Hand an idle registered worker back to the pool. The pool
    /// takes it out of the registry and out of heartbeat tracking, so
    /// an idle worker going quiet never starts a failover.
    ///
    /// Refused while the worker is unhealthy or still has
    /// obligations. Releasing a pooled worker again returns `false`.
    pub fn release(&self, worker_id: &WorkerId) -> Result<bool> {
        if self.contains(worker_id) {
            return Ok(false);
        }
        let worker = self.registry.require(worker_id)?;
        if worker.state != WorkerState::Ready {
            return Err(EngineError::Conflict(format!(
                "worker {worker_id} is {:?}, only ready workers can be pooled",
                worker.state
            )));
        }
        if let Some(why) = self
            .obligations
            .iter()
            .find_map(|o| o.blocks_release(worker_id))
        {
            return Err(EngineError::Conflict(format!(
                "worker {worker_id} cannot be released: {why}"
            )));
        }
        // Untracked before it becomes acquirable, so no scan in between
        // can report it.
        let tracked = self.monitor.unregister(worker_id);
        match self.enroll(worker.clone()) {
            Ok(true) => {
                self.registry.remove(worker_id);
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(err) => {
                if tracked {
                    self.monitor.register(worker);
                }
                Err(err)
            }
        }
    }

    pub fn contains(&self, worker_id: &WorkerId) -> bool {
        lock(&self.state).workers.contains_key(worker_id)
    }

    pub fn ready_count(&self, class: &ResourceClass) -> usize {
        lock(&self.state).entries.get(class).map_or(0, VecDeque::len)
    }

    pub fn entries(&self) -> Vec<WarmPoolEntry> {
        let state = lock(&self.state);
        let mut all: Vec<_> = state.entries.values().flatten().cloned().collect();
        all.sort_by(|a, b| a.enrolled_at.cmp(&b.enrolled_at));
        all
    }

    /// Top up every configured class that dropped below `min_ready`
    /// to `max_ready`, one race per missing worker. Returns how many
    /// workers were added.
    pub async fn replenish(&self) -> usize {
        let mut added = 0;
        for class in &self.settings.classes {
            let ready = self.ready_count(class);
            if ready >= self.settings.min_ready {
                continue;
            }
            let missing = self.settings.max_ready.saturating_sub(ready);
            tracing::info!("Replenishing {missing} {class} workers");
            for _ in 0..missing {
                let worker = match self
                    .racer
                    .race(class, self.settings.race_candidates, self.settings.max_price)
                    .await
                {
                    Ok(worker) => worker,
                    Err(err) => {
                        tracing::warn!("Unable to replenish {class} pool: {err}");
                        break;
                    }
                };
                match self.enroll(worker) {
                    Ok(_) => added += 1,
                    Err(err) => tracing::error!("Race winner refused by pool: {err}"),
                }
            }
        }
        added
    }

    pub async fn run(self: Arc<Self>, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.replenish().await;
                }
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }
        tracing::debug!("Warm pool replenisher stopped");
    }
}
