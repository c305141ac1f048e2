//! Periodic snapshots with a per-worker circuit breaker.
//!
//! [`SnapshotScheduler::tick`] is the unit of work; the run loop
//! only calls it on an interval. Overdue schedules are reported by
//! [`SnapshotScheduler::health`] and never caught up.

use std::collections::BTreeMap;
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
use crate::model::RunResult;
use crate::model::SnapshotScheduleConfig;
use crate::model::WorkerId;
use crate::snapshot::SnapshotTaker;
use crate::store::RecordStore;
use crate::warm_pool::Obligations;

/// Raised when a schedule trips its circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleAlert {
    pub worker_id: WorkerId,
    pub consecutive_failures: u32,
    pub last_error: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleHealth {
    pub worker_id: WorkerId,
    pub enabled: bool,
    pub overdue: bool,
    pub consecutive_failures: u32,
    pub last_run: Option<DateTime<Utc>>,
    pub next_due: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub succeeded: Vec<WorkerId>,
    pub failed: Vec<WorkerId>,
    pub tripped: Vec<WorkerId>,
}

pub struct SnapshotScheduler {
    schedules: Mutex<BTreeMap<WorkerId, SnapshotScheduleConfig>>,
    taker: Arc<dyn SnapshotTaker>,
    records: Arc<RecordStore>,
    clock: SharedClock,
    threshold: u32,
    alerts: mpsc::UnboundedSender<ScheduleAlert>,
}

impl SnapshotScheduler {
    /// Load persisted schedules. Alerts for tripped breakers go to
    /// the returned receiver.
    pub fn load(
        taker: Arc<dyn SnapshotTaker>,
        records: Arc<RecordStore>,
        clock: SharedClock,
        threshold: u32,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ScheduleAlert>)> {
        let schedules = records
            .schedules()?
            .into_iter()
            .map(|s| (s.worker_id.clone(), s))
            .collect();
        let (alerts, alerts_rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                schedules: Mutex::new(schedules),
                taker,
                records,
                clock,
                threshold,
                alerts,
            },
            alerts_rx,
        ))
    }

    /// Start scheduling `worker_id`, first run due now. Replaces any
    /// existing schedule for it.
    pub fn add_schedule(
        &self,
        worker_id: &WorkerId,
        paths: Vec<String>,
        interval: Duration,
    ) -> Result<SnapshotScheduleConfig> {
        if interval.is_zero() {
            return Err(EngineError::Config("snapshot interval must be non-zero".into()));
        }
        let schedule = SnapshotScheduleConfig::new(worker_id.clone(), paths, interval, self.clock.now());
        self.records.put_schedule(&schedule)?;
        lock(&self.schedules).insert(worker_id.clone(), schedule.clone());
        tracing::info!("Scheduled snapshots of {worker_id} every {interval:?}");
        Ok(schedule)
    }

    pub fn remove_schedule(&self, worker_id: &WorkerId) -> Result<()> {
        self.records.delete_schedule(worker_id)?;
        lock(&self.schedules).remove(worker_id);
        Ok(())
    }

    pub fn schedule(&self, worker_id: &WorkerId) -> Option<SnapshotScheduleConfig> {
        lock(&self.schedules).get(worker_id).cloned()
    }

    /// Manually re-enable a schedule, resetting its breaker. The next
    /// run is due immediately.
    pub fn enable(&self, worker_id: &WorkerId) -> Result<()> {
        self.update(worker_id, |s, now| {
            s.enabled = true;
            s.consecutive_failures = 0;
            s.next_due = now;
        })?;
        tracing::info!("Re-enabled snapshot schedule of {worker_id}");
        Ok(())
    }

    pub fn disable(&self, worker_id: &WorkerId) -> Result<()> {
        self.update(worker_id, |s, _| s.enabled = false)
    }

    fn update(
        &self,
        worker_id: &WorkerId,
        f: impl FnOnce(&mut SnapshotScheduleConfig, DateTime<Utc>),
    ) -> Result<()> {
        let now = self.clock.now();
        let mut schedules = lock(&self.schedules);
        let schedule = schedules
            .get_mut(worker_id)
            .ok_or_else(|| EngineError::NotFound(format!("snapshot schedule of {worker_id}")))?;
        f(schedule, now);
        self.records.put_schedule(schedule)
    }

    /// Run every enabled schedule that is due.
    ///
    /// Runs happen one after another; the schedule table is not locked
    /// while a snapshot is in progress.
    pub async fn tick(&self) -> TickReport {
        let now = self.clock.now();
        let due: Vec<(WorkerId, Vec<String>)> = lock(&self.schedules)
            .values()
            .filter(|s| s.enabled && s.next_due <= now)
            .map(|s| (s.worker_id.clone(), s.paths.clone()))
            .collect();

        let mut report = TickReport::default();
        for (worker_id, paths) in due {
            let res = self.taker.take_snapshot(&worker_id, &paths).await;
            let ran_at = self.clock.now();
            match res {
                Ok(record) => {
                    tracing::debug!("Scheduled snapshot {} of {worker_id} done", record.id);
                    self.record_success(&worker_id, ran_at);
                    report.succeeded.push(worker_id);
                }
                Err(err) => {
                    tracing::warn!("Scheduled snapshot of {worker_id} failed: {err}");
                    if self.record_failure(&worker_id, ran_at, &err) {
                        report.tripped.push(worker_id.clone());
                    }
                    report.failed.push(worker_id);
                }
            }
        }
        report
    }

    fn record_success(&self, worker_id: &WorkerId, at: DateTime<Utc>) {
        let mut schedules = lock(&self.schedules);
        // Removed while the snapshot ran.
        let Some(schedule) = schedules.get_mut(worker_id) else {
            return;
        };
        schedule.last_run = Some(at);
        schedule.next_due = at + to_chrono(schedule.interval);
        schedule.last_result = Some(RunResult::Success);
        schedule.consecutive_failures = 0;
        schedule.last_error = None;
        self.persist(schedule);
    }

    /// Returns whether this failure tripped the breaker.
    fn record_failure(&self, worker_id: &WorkerId, at: DateTime<Utc>, err: &EngineError) -> bool {
        let mut schedules = lock(&self.schedules);
        let Some(schedule) = schedules.get_mut(worker_id) else {
            return false;
        };
        schedule.last_run = Some(at);
        schedule.next_due = at + to_chrono(schedule.interval);
        schedule.last_result = Some(RunResult::Failure);
        schedule.consecutive_failures += 1;
        schedule.last_error = Some(err.to_string());
        let tripped = schedule.enabled && schedule.consecutive_failures >= self.threshold;
        if tripped {
            schedule.enabled = false;
            tracing::error!(
                "Disabled snapshots of {worker_id} after {} consecutive failures",
                schedule.consecutive_failures
            );
            let alert = ScheduleAlert {
                worker_id: worker_id.clone(),
                consecutive_failures: schedule.consecutive_failures,
                last_error: err.to_string(),
                at,
            };
            if self.alerts.send(alert).is_err() {
                tracing::trace!("No listener for schedule alerts");
            }
        }
        self.persist(schedule);
        tripped
    }

    fn persist(&self, schedule: &SnapshotScheduleConfig) {
        if let Err(err) = self.records.put_schedule(schedule) {
            tracing::error!("Unable to persist schedule of {}: {err}", schedule.worker_id);
        }
    }

    /// A schedule is overdue when more than two intervals have passed
    /// since its last run. Never-run schedules count from their first
    /// due time.
    pub fn health(&self) -> Vec<ScheduleHealth> {
        let now = self.clock.now();
        lock(&self.schedules)
            .values()
            .map(|s| {
                let since = s.last_run.unwrap_or(s.next_due);
                ScheduleHealth {
                    worker_id: s.worker_id.clone(),
                    enabled: s.enabled,
                    overdue: now > since + to_chrono(s.interval * 2),
                    consecutive_failures: s.consecutive_failures,
                    last_run: s.last_run,
                    next_due: s.next_due,
                }
            })
            .collect()
    }

    pub async fn run(self: Arc<Self>, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.tick().await;
                    if !report.failed.is_empty() {
                        tracing::debug!("Snapshot tick: {report:?}");
                    }
                }
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }
        tracing::debug!("Snapshot scheduler stopped");
    }
}

impl Obligations for SnapshotScheduler {
    fn blocks_release(&self, worker_id: &WorkerId) -> Option<String> {
        lock(&self.schedules)
            .get(worker_id)
            .filter(|s| s.enabled)
            .map(|s| format!("snapshots scheduled every {:?}", s.interval))
    }
}
