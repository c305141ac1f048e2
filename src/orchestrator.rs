//! The failover state machine.
//!
//! One episode per failed primary, driven through
//! `detecting -> acquiring_resource -> restoring -> verifying ->
//! complete`, with `failed` reachable from every non-terminal phase.
//! Phases run strictly in sequence and every transition is persisted
//! before the next phase starts.
//!
//! A second failure of a primary whose episode is still in flight is
//! coalesced into the running one.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::clock::SharedClock;
use crate::common::lock;
use crate::common::shutdown_requested;
use crate::common::with_timeout;
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::errors::ErrorKind;
use crate::errors::Result;
use crate::heartbeat::FailureEvent;
use crate::heartbeat::HeartbeatMonitor;
use crate::leaks::LeakLedger;
use crate::leaks::LeakReason;
use crate::metrics::label;
use crate::metrics::EngineMetrics;
use crate::model::AcquisitionStrategy;
use crate::model::ExecutionFilter;
use crate::model::ExecutionId;
use crate::model::ExecutionSummary;
use crate::model::FailoverExecution;
use crate::model::FailoverReport;
use crate::model::FailoverTrigger;
use crate::model::Outcome;
use crate::model::ResourceClass;
use crate::model::SnapshotRecord;
use crate::model::Worker;
use crate::model::WorkerId;
use crate::model::WorkerState;
use crate::provider::SharedProvider;
use crate::racing::RacingProvisioner;
use crate::registry::WorkerRegistry;
use crate::scheduler::SnapshotScheduler;
use crate::snapshot::StagedRestore;
use crate::snapshot::SnapshotStore;
use crate::standby::StandbyManager;
use crate::store::RecordStore;
use crate::warm_pool::WarmPool;

#[derive(Debug, Clone)]
pub struct FailoverSettings {
    pub pool_acquire_timeout: Duration,
    pub race_candidates: usize,
    pub max_price: Option<f64>,
    pub acquire_timeout: Duration,
    pub restore_timeout: Duration,
    pub verify_timeout: Duration,
    pub teardown_grace: Duration,
}

impl FailoverSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            pool_acquire_timeout: config.pool_acquire_timeout,
            race_candidates: config.race_candidates,
            max_price: config.max_price,
            acquire_timeout: config.acquire_phase_timeout,
            restore_timeout: config.restore_phase_timeout,
            verify_timeout: config.verify_phase_timeout,
            teardown_grace: config.teardown_grace,
        }
    }
}

/// Everything an episode touches.
pub struct Collaborators {
    pub registry: Arc<WorkerRegistry>,
    pub monitor: Arc<HeartbeatMonitor>,
    pub snapshots: Arc<SnapshotStore>,
    pub scheduler: Arc<SnapshotScheduler>,
    pub standby: Arc<StandbyManager>,
    pub pool: Arc<WarmPool>,
    pub racer: Arc<RacingProvisioner>,
    pub provider: SharedProvider,
    pub leaks: Arc<LeakLedger>,
    pub records: Arc<RecordStore>,
    pub clock: SharedClock,
    pub metrics: EngineMetrics,
}

struct InFlight {
    id: ExecutionId,
    cancel: watch::Sender<bool>,
}

struct Inner {
    parts: Collaborators,
    settings: FailoverSettings,
    history: Mutex<BTreeMap<ExecutionId, FailoverExecution>>,
    in_flight: Mutex<HashMap<WorkerId, InFlight>>,
    idle: Notify,
}

/// Working state of one episode next to its persisted record.
struct Episode {
    exec: FailoverExecution,
    old: Option<Worker>,
    snapshot: Option<SnapshotRecord>,
    new_worker: Option<Worker>,
    staged: Option<StagedRestore>,
    teardown: Option<JoinHandle<bool>>,
    phase_started: Instant,
}

#[derive(Clone)]
pub struct FailoverOrchestrator {
    inner: Arc<Inner>,
}

impl FailoverOrchestrator {
    /// Load episode history. Episodes a previous run left in flight
    /// can't be resumed and are closed as aborted.
    pub fn load(parts: Collaborators, settings: FailoverSettings) -> Result<Self> {
        let now = parts.clock.now();
        let mut history = BTreeMap::new();
        for mut exec in parts.records.failovers()? {
            if exec.is_active() {
                tracing::warn!("Closing failover {} interrupted by a restart", exec.id);
                let err = EngineError::Cancelled("engine restarted mid-failover".into());
                exec.fail(&err, Outcome::Aborted, now)?;
                parts.records.put_failover(&exec)?;
            }
            history.insert(exec.id.clone(), exec);
        }
        Ok(Self {
            inner: Arc::new(Inner {
                parts,
                settings,
                history: Mutex::new(history),
                in_flight: Mutex::new(HashMap::new()),
                idle: Notify::new(),
            }),
        })
    }

    /// Drive a failover of `worker_id` to a terminal phase.
    ///
    /// Fails with [`EngineError::Conflict`] if one is already in
    /// flight for it. Phase failures do not make this fail; they end
    /// up on the returned record.
    pub async fn run_failover(
        &self,
        worker_id: &WorkerId,
        trigger: FailoverTrigger,
    ) -> Result<FailoverExecution> {
        let (exec, cancel) = self.inner.begin(worker_id, trigger)?;
        Ok(self.inner.clone().drive(exec, cancel).await)
    }

    /// Start a failover in the background.
    pub fn spawn_failover(&self, worker_id: &WorkerId, trigger: FailoverTrigger) -> Result<ExecutionId> {
        let (exec, cancel) = self.inner.begin(worker_id, trigger)?;
        let id = exec.id.clone();
        tokio::spawn(self.inner.clone().drive(exec, cancel));
        Ok(id)
    }

    /// Operator-requested failover of a worker that may still be
    /// alive.
    pub fn request_failover(&self, worker_id: &WorkerId, reason: impl Into<String>) -> Result<ExecutionId> {
        self.spawn_failover(
            worker_id,
            FailoverTrigger::Manual {
                reason: reason.into(),
            },
        )
    }

    /// Ask an in-flight episode to stop. It destroys whatever it
    /// acquired and ends as [`Outcome::Aborted`].
    pub fn cancel(&self, execution_id: &ExecutionId) -> Result<()> {
        let in_flight = lock(&self.inner.in_flight);
        let entry = in_flight
            .values()
            .find(|f| &f.id == execution_id)
            .ok_or_else(|| EngineError::NotFound(format!("in-flight failover {execution_id}")))?;
        tracing::info!("Cancelling failover {execution_id}");
        // Receiver gone means the episode already finished.
        entry.cancel.send(true).ok();
        Ok(())
    }

    pub fn get(&self, execution_id: &ExecutionId) -> Option<FailoverExecution> {
        lock(&self.inner.history).get(execution_id).cloned()
    }

    pub fn is_in_flight(&self, worker_id: &WorkerId) -> bool {
        lock(&self.inner.in_flight).contains_key(worker_id)
    }

    /// Summaries of matching episodes, oldest first.
    pub fn list_executions(&self, filter: &ExecutionFilter) -> Vec<ExecutionSummary> {
        let history = lock(&self.inner.history);
        let mut matching: Vec<_> = history.values().filter(|e| filter.matches(e)).collect();
        matching.sort_by(|a, b| a.detected_at.cmp(&b.detected_at));
        matching.into_iter().map(FailoverExecution::summary).collect()
    }

    pub fn report(&self) -> FailoverReport {
        FailoverReport::from_executions(lock(&self.inner.history).values())
    }

    /// Start a failover for every failure event until shutdown, then
    /// cancel whatever is still in flight.
    pub async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<FailureEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    match self.spawn_failover(&event.worker_id, FailoverTrigger::HeartbeatTimeout) {
                        Ok(id) => tracing::debug!("Failover {id} started for {}", event.worker_id),
                        Err(err) if err.kind() == ErrorKind::Conflict => {
                            tracing::debug!("Coalesced failure event: {err}");
                        }
                        Err(err) => tracing::error!("Unable to start failover: {err}"),
                    }
                }
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }
        self.shutdown().await;
    }

    /// Cancel every in-flight episode and wait up to the teardown
    /// grace for them to clean up.
    pub async fn shutdown(&self) {
        let idle = self.inner.idle.notified();
        tokio::pin!(idle);
        idle.as_mut().enable();
        {
            let in_flight = lock(&self.inner.in_flight);
            if in_flight.is_empty() {
                return;
            }
            for entry in in_flight.values() {
                entry.cancel.send(true).ok();
            }
        }
        if tokio::time::timeout(self.inner.settings.teardown_grace, idle)
            .await
            .is_err()
        {
            tracing::warn!("Failovers still cleaning up at shutdown");
        }
    }
}

impl Inner {
    fn begin(
        &self,
        worker_id: &WorkerId,
        trigger: FailoverTrigger,
    ) -> Result<(FailoverExecution, watch::Receiver<bool>)> {
        let mut in_flight = lock(&self.in_flight);
        if let Some(running) = in_flight.get(worker_id) {
            return Err(EngineError::Conflict(format!(
                "failover {} already in flight for {worker_id}",
                running.id
            )));
        }
        let exec = FailoverExecution::new(worker_id.clone(), trigger, self.parts.clock.now());
        let (cancel, cancel_rx) = watch::channel(false);
        in_flight.insert(
            worker_id.clone(),
            InFlight {
                id: exec.id.clone(),
                cancel,
            },
        );
        drop(in_flight);
        tracing::info!("Failover {} of {worker_id} detecting", exec.id);
        self.persist(&exec);
        Ok((exec, cancel_rx))
    }

    fn persist(&self, exec: &FailoverExecution) {
        match self.parts.records.put_failover(exec) {
            Ok(true) => {}
            Ok(false) => tracing::error!("Failover {} was already final in the store", exec.id),
            Err(err) => tracing::error!("Unable to persist failover {}: {err}", exec.id),
        }
        lock(&self.history).insert(exec.id.clone(), exec.clone());
    }

    async fn drive(self: Arc<Self>, exec: FailoverExecution, mut cancel: watch::Receiver<bool>) -> FailoverExecution {
        let span = tracing::info_span!("failover", execution = %exec.id, worker = %exec.worker_id);
        async move {
            let mut ep = Episode {
                exec,
                old: None,
                snapshot: None,
                new_worker: None,
                staged: None,
                teardown: None,
                phase_started: Instant::now(),
            };
            if let Err(err) = self.run_phases(&mut ep, &mut cancel).await {
                self.abandon(&mut ep, err).await;
            }
            self.finish(ep)
        }
        .instrument(span)
        .await
    }

    async fn run_phases(&self, ep: &mut Episode, cancel: &mut watch::Receiver<bool>) -> Result<()> {
        let class = self.detect(ep)?;
        self.commit(ep, Some(&*cancel))?;

        self.acquire_phase(ep, &class, cancel).await?;
        self.commit(ep, Some(&*cancel))?;

        self.restore_phase(ep, cancel).await?;
        self.commit(ep, Some(&*cancel))?;

        self.verify_phase(ep, cancel).await?;
        self.complete(ep).await;
        self.commit(ep, None)
    }

    /// Take the old worker out of service and decide how to recover.
    fn detect(&self, ep: &mut Episode) -> Result<ResourceClass> {
        let worker_id = ep.exec.worker_id.clone();
        let now = self.parts.clock.now();
        self.parts.monitor.unregister(&worker_id);
        let old = self.parts.registry.require(&worker_id)?;
        self.parts.registry.set_state(&worker_id, WorkerState::Failed)?;
        match &ep.exec.trigger {
            FailoverTrigger::HeartbeatTimeout => ep.exec.note(
                now,
                format!("{worker_id} missed heartbeats, last at {:?}", old.last_heartbeat),
            ),
            FailoverTrigger::Manual { reason } => {
                ep.exec.note(now, format!("manual failover of {worker_id}: {reason}"))
            }
        }

        let snapshot = self.parts.snapshots.latest_snapshot(&worker_id)?;
        match &snapshot {
            Some(s) => {
                ep.exec.snapshot_id = Some(s.id.clone());
                ep.exec.note(
                    now,
                    format!("restoring snapshot {} taken {}", s.id, s.created_at),
                );
            }
            None => ep
                .exec
                .note(now, "no verified snapshot, the new worker starts fresh"),
        }
        match self.parts.standby.lookup(&worker_id) {
            Some(a) => ep.exec.note(
                now,
                format!("standby {} is {:?}", a.standby.worker_id, a.state),
            ),
            None => ep.exec.note(now, "no standby association"),
        }
        ep.exec.note(
            now,
            format!(
                "acquiring {}: warm pool for up to {:?}, then a {}-way race",
                old.resource_class, self.settings.pool_acquire_timeout, self.settings.race_candidates
            ),
        );
        let class = old.resource_class.clone();
        ep.old = Some(old);
        ep.snapshot = snapshot;
        Ok(class)
    }

    async fn acquire_phase(
        &self,
        ep: &mut Episode,
        class: &ResourceClass,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let acquiring = self.acquire(class, stop_rx);
        tokio::pin!(acquiring);
        let limit = self.settings.acquire_timeout;
        // On timeout or cancel a running race is told to stop and
        // awaited, so it destroys its candidates. A worker it still
        // hands back is kept for teardown.
        let res = tokio::select! {
            res = &mut acquiring => res,
            _ = tokio::time::sleep(limit) => {
                stop_tx.send(true).ok();
                if let Ok((worker, _)) = acquiring.await {
                    ep.new_worker = Some(worker);
                }
                Err(EngineError::Timeout {
                    operation: "acquiring a worker".into(),
                    after: limit,
                })
            }
            _ = shutdown_requested(cancel) => {
                stop_tx.send(true).ok();
                if let Ok((worker, _)) = acquiring.await {
                    ep.new_worker = Some(worker);
                }
                Err(cancelled())
            }
        };
        let (worker, strategy) = res?;
        let now = self.parts.clock.now();
        ep.exec.note(now, format!("acquired {} via {strategy:?}", worker.id));
        ep.exec.new_worker_id = Some(worker.id.clone());
        ep.exec.strategy = Some(strategy);
        ep.new_worker = Some(worker);
        Ok(())
    }

    async fn acquire(
        &self,
        class: &ResourceClass,
        stop: watch::Receiver<bool>,
    ) -> Result<(Worker, AcquisitionStrategy)> {
        match self
            .parts
            .pool
            .acquire(class, self.settings.pool_acquire_timeout)
            .await
        {
            Ok(worker) => return Ok((worker, AcquisitionStrategy::WarmPool)),
            Err(err) if err.kind() == ErrorKind::PoolEmpty => {
                tracing::debug!("{err}, falling back to a race");
            }
            Err(err) => return Err(err),
        }
        if *stop.borrow() {
            return Err(cancelled());
        }
        let worker = self
            .parts
            .racer
            .race_until(class, self.settings.race_candidates, self.settings.max_price, stop)
            .await?;
        Ok((worker, AcquisitionStrategy::Race))
    }

    async fn restore_phase(&self, ep: &mut Episode, cancel: &mut watch::Receiver<bool>) -> Result<()> {
        // Once restoring starts the old worker must never come back.
        if let Some(old) = &ep.old {
            ep.teardown = Some(self.spawn_teardown(old.id.clone()));
            ep.exec
                .note(self.parts.clock.now(), format!("destroying old worker {}", old.id));
        }
        let (Some(snapshot), Some(target)) = (&ep.snapshot, &ep.new_worker) else {
            return Ok(());
        };
        let staged = bounded(
            "restoring snapshot",
            self.settings.restore_timeout,
            cancel,
            self.parts.snapshots.extract_onto(snapshot, target),
        )
        .await?;
        ep.exec.note(
            self.parts.clock.now(),
            format!("extracted {} onto {}", snapshot.id, target.id),
        );
        ep.staged = Some(staged);
        Ok(())
    }

    async fn verify_phase(&self, ep: &mut Episode, cancel: &mut watch::Receiver<bool>) -> Result<()> {
        let (Some(snapshot), Some(staged), Some(target)) = (&ep.snapshot, &ep.staged, &ep.new_worker)
        else {
            return Ok(());
        };
        let restored = bounded(
            "verifying restore",
            self.settings.verify_timeout,
            cancel,
            self.parts.snapshots.verify_on(snapshot, staged, target),
        )
        .await?;
        ep.exec.note(
            self.parts.clock.now(),
            format!(
                "verified {} files against digest {}",
                restored.files_verified, restored.digest
            ),
        );
        ep.exec.restored = true;
        Ok(())
    }

    /// Put the new worker into service. Nothing here fails the
    /// episode; problems become warnings.
    async fn complete(&self, ep: &mut Episode) {
        let old_id = ep.exec.worker_id.clone();
        if let Some(worker) = &mut ep.new_worker {
            worker.state = WorkerState::Ready;
            self.parts.monitor.register(worker.clone());
            let new_id = worker.id.clone();
            match self.parts.standby.rebind(&old_id, &new_id) {
                Ok(true) => ep
                    .exec
                    .note(self.parts.clock.now(), format!("standby now backs {new_id}")),
                Ok(false) => {}
                Err(err) => ep.exec.warnings.push(format!("standby rebind failed: {err}")),
            }
            if let Some(schedule) = self.parts.scheduler.schedule(&old_id) {
                let moved = self
                    .parts
                    .scheduler
                    .remove_schedule(&old_id)
                    .and_then(|()| {
                        self.parts
                            .scheduler
                            .add_schedule(&new_id, schedule.paths, schedule.interval)
                    });
                if let Err(err) = moved {
                    ep.exec
                        .warnings
                        .push(format!("snapshot schedule not moved: {err}"));
                }
            }
        }

        let Some(teardown) = ep.teardown.take() else {
            return;
        };
        match tokio::time::timeout(self.settings.teardown_grace, teardown).await {
            Ok(Ok(true)) => {
                self.parts.registry.remove(&old_id);
            }
            Ok(Ok(false)) => ep
                .exec
                .warnings
                .push(format!("old worker {old_id} teardown failed, recorded as a leak")),
            Ok(Err(err)) => ep
                .exec
                .warnings
                .push(format!("old worker {old_id} teardown task failed: {err}")),
            Err(_) => ep.exec.warnings.push(format!(
                "old worker {old_id} still tearing down after {:?}",
                self.settings.teardown_grace
            )),
        }
    }

    /// Commit the current phase and enter the next. Checks for
    /// cancellation first unless `cancel` is `None`.
    fn commit(&self, ep: &mut Episode, cancel: Option<&watch::Receiver<bool>>) -> Result<()> {
        if cancel.map_or(false, |c| *c.borrow()) {
            return Err(cancelled());
        }
        let finished = ep.exec.phase;
        self.parts.metrics.failover_phase_duration.record(
            ep.phase_started.elapsed().as_secs_f64(),
            &label("phase", finished.as_str()),
        );
        let next = ep.exec.advance(self.parts.clock.now())?;
        ep.phase_started = Instant::now();
        tracing::info!("Failover {} {} -> {}", ep.exec.id, finished.as_str(), next.as_str());
        self.persist(&ep.exec);
        Ok(())
    }

    /// End the episode as failed, destroying anything it acquired.
    async fn abandon(&self, ep: &mut Episode, err: EngineError) {
        let outcome = if err.kind() == ErrorKind::Cancelled {
            Outcome::Aborted
        } else {
            Outcome::Failed
        };
        tracing::error!(
            "Failover {} failed in {}: {err}",
            ep.exec.id,
            ep.exec.phase.as_str()
        );
        if let Some(worker) = ep.new_worker.take() {
            self.parts.monitor.unregister(&worker.id);
            self.parts.registry.remove(&worker.id);
            match self.parts.provider.destroy(&worker.id).await {
                Ok(()) => ep.exec.note(
                    self.parts.clock.now(),
                    format!("destroyed acquired worker {}", worker.id),
                ),
                Err(destroy_err) => {
                    self.parts.leaks.record(
                        &worker.id,
                        LeakReason::AbandonedAcquisition,
                        destroy_err.to_string(),
                    );
                    ep.exec.warnings.push(format!(
                        "acquired worker {} not destroyed: {destroy_err}",
                        worker.id
                    ));
                }
            }
        }
        if let Err(fail_err) = ep.exec.fail(&err, outcome, self.parts.clock.now()) {
            tracing::error!("{fail_err}");
        }
    }

    fn finish(&self, ep: Episode) -> FailoverExecution {
        let exec = ep.exec;
        if exec.is_active() {
            tracing::error!("Failover {} left {}", exec.id, exec.phase.as_str());
        }
        self.persist(&exec);
        let outcome = exec.outcome.map_or("unknown", |o| o.as_str());
        self.parts
            .metrics
            .failover_total
            .add(1, &label("outcome", outcome));
        if let Some(mttr) = exec.mttr() {
            self.parts
                .metrics
                .failover_duration
                .record(mttr.num_milliseconds() as f64 / 1000.0, &[]);
            tracing::info!(
                "Failover {} of {} complete in {}ms",
                exec.id,
                exec.worker_id,
                mttr.num_milliseconds()
            );
        }
        let mut in_flight = lock(&self.in_flight);
        in_flight.remove(&exec.worker_id);
        if in_flight.is_empty() {
            self.idle.notify_waiters();
        }
        exec
    }

    fn spawn_teardown(&self, worker_id: WorkerId) -> JoinHandle<bool> {
        let provider = self.parts.provider.clone();
        let leaks = self.parts.leaks.clone();
        tokio::spawn(
            async move {
                match provider.destroy(&worker_id).await {
                    Ok(()) => {
                        tracing::info!("Destroyed replaced worker {worker_id}");
                        true
                    }
                    Err(err) => {
                        leaks.record(&worker_id, LeakReason::OldWorker, err.to_string());
                        false
                    }
                }
            }
            .in_current_span(),
        )
    }
}

fn cancelled() -> EngineError {
    EngineError::Cancelled("failover cancelled by operator".into())
}

/// Run a phase step under its deadline, giving up early on
/// cancellation.
async fn bounded<T, F>(
    operation: &str,
    limit: Duration,
    cancel: &mut watch::Receiver<bool>,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        res = with_timeout(operation, limit, fut) => res,
        _ = shutdown_requested(cancel) => Err(cancelled()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::clock::TestingClock;
    use crate::engine::Backends;
    use crate::engine::Engine;
    use crate::model::FailoverPhase;
    use crate::testing::MemObjectStore;
    use crate::testing::SimCloud;

    struct Fixture {
        cloud: SimCloud,
        objects: MemObjectStore,
        clock: TestingClock,
        engine: Engine,
    }

    fn config() -> EngineConfig {
        EngineConfig {
            api_port: None,
            race_candidates: 2,
            pool_acquire_timeout: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn fixture_with(config: EngineConfig) -> Fixture {
        let cloud = SimCloud::new();
        let objects = MemObjectStore::new();
        let clock = TestingClock::default();
        let engine = Engine::build(
            config,
            Backends {
                provider: cloud.provider(),
                transport: cloud.transport(),
                objects: Arc::new(objects.clone()),
                clock: Arc::new(clock.clone()),
            },
        )
        .unwrap();
        Fixture {
            cloud,
            objects,
            clock,
            engine,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(config())
    }

    impl Fixture {
        /// A registered primary with a verified snapshot of its
        /// workspace.
        async fn primary_with_snapshot(&self) -> (Worker, SnapshotRecord) {
            let worker = self.cloud.add_worker("a100");
            self.cloud
                .write_file(&worker.id, "/workspace/model.bin", b"weights v7");
            self.cloud
                .write_file(&worker.id, "/workspace/cfg/run.yaml", b"lr: 0.01");
            self.engine.monitor.register(worker.clone());
            let record = self
                .engine
                .snapshots
                .create_snapshot(&worker, &["/workspace".to_string()])
                .await
                .unwrap();
            (worker, record)
        }

        async fn wait_idle(&self, worker_id: &WorkerId) {
            for _ in 0..600 {
                if !self.engine.orchestrator.is_in_flight(worker_id) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            panic!("failover of {worker_id} never finished");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn restores_snapshot_onto_race_winner() {
        let f = fixture();
        f.cloud.add_offer("slow", "a100", 1.0, Duration::from_secs(20));
        f.cloud.add_offer("fast", "a100", 1.5, Duration::from_secs(3));
        let (old, record) = f.primary_with_snapshot().await;

        let exec = f
            .engine
            .orchestrator
            .run_failover(&old.id, FailoverTrigger::HeartbeatTimeout)
            .await
            .unwrap();

        assert_eq!(exec.phase, FailoverPhase::Complete);
        assert_eq!(exec.outcome, Some(Outcome::Success));
        assert_eq!(exec.strategy, Some(AcquisitionStrategy::Race));
        assert_eq!(exec.snapshot_id, Some(record.id));
        assert!(exec.restored);
        assert!(exec.warnings.is_empty(), "{:?}", exec.warnings);
        let phases: Vec<_> = exec.phases.iter().map(|s| s.phase).collect();
        assert_eq!(
            phases,
            vec![
                FailoverPhase::Detecting,
                FailoverPhase::AcquiringResource,
                FailoverPhase::Restoring,
                FailoverPhase::Verifying,
                FailoverPhase::Complete,
            ]
        );

        let new_id = exec.new_worker_id.clone().unwrap();
        assert_eq!(f.cloud.offer_of(&new_id).as_deref(), Some("fast"));
        assert_eq!(
            f.cloud.read_file(&new_id, "/workspace/model.bin").unwrap(),
            b"weights v7"
        );
        assert!(f.cloud.is_destroyed(&old.id));
        assert!(f.engine.registry.get(&old.id).is_none());
        assert_eq!(
            f.engine.registry.require(&new_id).unwrap().state,
            WorkerState::Ready
        );
        assert!(f.engine.monitor.is_tracked(&new_id));
        assert!(!f.engine.monitor.is_tracked(&old.id));
        assert!(f.engine.leaks.is_empty());
        assert_eq!(f.engine.orchestrator.get(&exec.id), Some(exec));
    }

    #[tokio::test(start_paused = true)]
    async fn warm_pool_worker_starts_fresh_without_snapshot() {
        let f = fixture();
        let old = f.cloud.add_worker("a100");
        f.engine.monitor.register(old.clone());
        let spare = f.cloud.add_worker("a100");
        f.engine.pool.enroll(spare.clone()).unwrap();
        f.clock.advance(chrono::Duration::seconds(2));

        let exec = f
            .engine
            .orchestrator
            .run_failover(&old.id, FailoverTrigger::HeartbeatTimeout)
            .await
            .unwrap();

        assert_eq!(exec.outcome, Some(Outcome::Success));
        assert_eq!(exec.strategy, Some(AcquisitionStrategy::WarmPool));
        assert_eq!(exec.new_worker_id, Some(spare.id.clone()));
        assert!(!exec.restored);
        assert!(exec.snapshot_id.is_none());
        assert!(exec
            .log
            .iter()
            .any(|e| e.message.contains("no verified snapshot")));
        assert!(f.cloud.provisioned().is_empty());
        assert!(!f.engine.pool.contains(&spare.id));
        assert_eq!(
            exec.mttr(),
            Some(
                exec.phase_at(FailoverPhase::Complete).unwrap()
                    - exec.phase_at(FailoverPhase::Detecting).unwrap()
            )
        );
    }

    #[tokio::test(start_paused = true)]
    async fn corrupted_archive_fails_verification() {
        let f = fixture();
        f.cloud.add_offer("o1", "a100", 1.0, Duration::from_secs(1));
        let (old, record) = f.primary_with_snapshot().await;
        assert!(f.objects.corrupt(&record.location));

        let exec = f
            .engine
            .orchestrator
            .run_failover(&old.id, FailoverTrigger::HeartbeatTimeout)
            .await
            .unwrap();

        assert_eq!(exec.phase, FailoverPhase::Failed);
        assert_eq!(exec.outcome, Some(Outcome::Failed));
        assert_eq!(exec.error_kind, Some(ErrorKind::Corruption));
        assert_eq!(exec.last_successful_phase, Some(FailoverPhase::Restoring));
        assert!(!exec.restored);

        let new_id = exec.new_worker_id.clone().unwrap();
        assert!(f.cloud.is_destroyed(&new_id));
        assert!(f.engine.registry.get(&new_id).is_none());
        assert_eq!(
            f.engine.registry.require(&old.id).unwrap().state,
            WorkerState::Failed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn second_failure_is_coalesced_and_cancel_aborts() {
        let f = fixture();
        f.cloud.add_offer("o1", "a100", 1.0, Duration::from_secs(120));
        let old = f.cloud.add_worker("a100");
        f.engine.monitor.register(old.clone());

        let id = f
            .engine
            .orchestrator
            .spawn_failover(&old.id, FailoverTrigger::HeartbeatTimeout)
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(f.engine.orchestrator.is_in_flight(&old.id));
        let dup = f
            .engine
            .orchestrator
            .run_failover(&old.id, FailoverTrigger::HeartbeatTimeout)
            .await
            .unwrap_err();
        assert_eq!(dup.kind(), ErrorKind::Conflict);
        assert_eq!(f.cloud.provisioned().len(), 1);

        f.engine.orchestrator.cancel(&id).unwrap();
        f.wait_idle(&old.id).await;

        let exec = f.engine.orchestrator.get(&id).unwrap();
        assert_eq!(exec.outcome, Some(Outcome::Aborted));
        assert_eq!(exec.error_kind, Some(ErrorKind::Cancelled));
        assert_eq!(
            exec.last_successful_phase,
            Some(FailoverPhase::Detecting)
        );
        assert!(f.cloud.live_workers().iter().all(|w| w == &old.id));
        assert!(f.engine.leaks.is_empty());
        assert!(f.engine.orchestrator.cancel(&id).is_err());

        let report = f.engine.orchestrator.report();
        assert_eq!(report.total, 1);
        assert_eq!(report.aborted, 1);
        assert_eq!(report.mttr_secs, None);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_timeout_fails_the_episode() {
        let f = fixture_with(EngineConfig {
            acquire_phase_timeout: Duration::from_secs(30),
            ..config()
        });
        f.cloud.add_offer("o1", "a100", 1.0, Duration::from_secs(600));
        let old = f.cloud.add_worker("a100");
        f.engine.monitor.register(old.clone());

        let exec = f
            .engine
            .orchestrator
            .run_failover(&old.id, FailoverTrigger::Manual {
                reason: "drain".into(),
            })
            .await
            .unwrap();

        assert_eq!(exec.outcome, Some(Outcome::Failed));
        assert_eq!(exec.error_kind, Some(ErrorKind::Timeout));
        let provisioned = f.cloud.provisioned();
        assert_eq!(provisioned.len(), 1);
        assert!(f.cloud.is_destroyed(&provisioned[0]));
        // Acquisition never finished, so the old worker was kept.
        assert!(!f.cloud.is_destroyed(&old.id));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_worker_fails_in_detecting() {
        let f = fixture();
        let exec = f
            .engine
            .orchestrator
            .run_failover(&"nobody".into(), FailoverTrigger::HeartbeatTimeout)
            .await
            .unwrap();
        assert_eq!(exec.error_kind, Some(ErrorKind::NotFound));
        assert_eq!(exec.last_successful_phase, None);
        assert!(!f.engine.orchestrator.is_in_flight(&"nobody".into()));

        let failed = f.engine.orchestrator.list_executions(&ExecutionFilter {
            outcome: Some(Outcome::Failed),
            ..Default::default()
        });
        assert_eq!(failed.len(), 1);
        assert!(f
            .engine
            .orchestrator
            .list_executions(&ExecutionFilter::active())
            .is_empty());
    }

    #[test]
    fn restart_closes_interrupted_episodes() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            record_store_path: Some(dir.path().join("records.sqlite3")),
            ..config()
        };
        let interrupted = {
            let f = fixture_with(config.clone());
            let exec = FailoverExecution::new(
                "w1".into(),
                FailoverTrigger::HeartbeatTimeout,
                f.clock.now(),
            );
            f.engine.records.put_failover(&exec).unwrap();
            exec
        };

        let f = fixture_with(config);
        let exec = f.engine.orchestrator.get(&interrupted.id).unwrap();
        assert_eq!(exec.outcome, Some(Outcome::Aborted));
        assert!(!exec.is_active());
    }
}
