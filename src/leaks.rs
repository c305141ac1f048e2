//! Workers whose teardown failed and may still be billing.
//!
//! A failed destroy never fails the operation that attempted it;
//! the worker is recorded here and retried by [`LeakLedger::sweep`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::clock::SharedClock;
use crate::common::lock;
use crate::common::shutdown_requested;
use crate::errors::Result;
use crate::model::WorkerId;
use crate::provider::SharedProvider;
use crate::provider::WorkerProvider;
use crate::store::RecordStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeakReason {
    RaceLoser,
    OldWorker,
    AbandonedAcquisition,
    Standby,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLeak {
    pub worker_id: WorkerId,
    pub reason: LeakReason,
    pub detail: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub cleared: Vec<WorkerId>,
    pub remaining: Vec<WorkerId>,
}

#[derive(Debug)]
pub struct LeakLedger {
    entries: Mutex<BTreeMap<WorkerId, ResourceLeak>>,
    store: Arc<RecordStore>,
    clock: SharedClock,
}

impl LeakLedger {
    /// Load whatever leaks an earlier run left behind.
    pub fn load(store: Arc<RecordStore>, clock: SharedClock) -> Result<Self> {
        let entries = store
            .leaks()?
            .into_iter()
            .map(|leak| (leak.worker_id.clone(), leak))
            .collect();
        Ok(Self {
            entries: Mutex::new(entries),
            store,
            clock,
        })
    }

    pub fn record(&self, worker_id: &WorkerId, reason: LeakReason, detail: impl Into<String>) {
        let leak = ResourceLeak {
            worker_id: worker_id.clone(),
            reason,
            detail: detail.into(),
            recorded_at: self.clock.now(),
        };
        tracing::warn!(
            "Possible leaked worker {worker_id} ({reason:?}): {}",
            leak.detail
        );
        if let Err(err) = self.store.put_leak(&leak) {
            tracing::error!("Unable to persist leak of {worker_id}: {err}");
        }
        lock(&self.entries).insert(worker_id.clone(), leak);
    }

    pub fn list(&self) -> Vec<ResourceLeak> {
        lock(&self.entries).values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Retry destroying every recorded worker, clearing the ones that
    /// succeed.
    #[tracing::instrument(name = "leak_sweep", skip_all)]
    pub async fn sweep(&self, provider: &dyn WorkerProvider) -> SweepReport {
        let pending: Vec<WorkerId> = lock(&self.entries).keys().cloned().collect();
        let mut report = SweepReport::default();
        for worker_id in pending {
            match provider.destroy(&worker_id).await {
                Ok(()) => {
                    lock(&self.entries).remove(&worker_id);
                    if let Err(err) = self.store.delete_leak(&worker_id) {
                        tracing::error!("Unable to clear leak of {worker_id}: {err}");
                    }
                    tracing::info!("Reclaimed leaked worker {worker_id}");
                    report.cleared.push(worker_id);
                }
                Err(err) => {
                    tracing::warn!("Worker {worker_id} still not destroyed: {err}");
                    report.remaining.push(worker_id);
                }
            }
        }
        report
    }

    pub async fn run(
        self: Arc<Self>,
        provider: SharedProvider,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.is_empty() {
                        continue;
                    }
                    let report = self.sweep(provider.as_ref()).await;
                    if !report.remaining.is_empty() {
                        tracing::warn!("{} leaked workers remain", report.remaining.len());
                    }
                }
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }
        tracing::debug!("Leak sweeper stopped");
    }
}
