//! Wiring of every component into one running engine.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::clock::SharedClock;
use crate::common::shutdown_requested;
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::errors::Result;
use crate::heartbeat::FailureEvent;
use crate::heartbeat::HeartbeatMonitor;
use crate::leaks::LeakLedger;
use crate::metrics::initialize_metrics;
use crate::metrics::EngineMetrics;
use crate::model::Worker;
use crate::model::WorkerId;
use crate::orchestrator::Collaborators;
use crate::orchestrator::FailoverOrchestrator;
use crate::orchestrator::FailoverSettings;
use crate::provider::RetryingProvider;
use crate::provider::SharedProvider;
use crate::racing::RaceSettings;
use crate::racing::RacingProvisioner;
use crate::racing::TransportProbe;
use crate::registry::WorkerRegistry;
use crate::retry::RetryPolicy;
use crate::scheduler::ScheduleAlert;
use crate::scheduler::SnapshotScheduler;
use crate::snapshot::SnapshotStore;
use crate::snapshot::SnapshotTaker;
use crate::standby::StandbyManager;
use crate::storage::SharedObjectStore;
use crate::store::RecordStore;
use crate::tracing::setup_tracing;
use crate::transport::SharedTransport;
use crate::warm_pool::Obligations;
use crate::warm_pool::PoolSettings;
use crate::warm_pool::WarmPool;
use crate::webserver::run_webserver;
use crate::webserver::ApiState;

/// The outside world the engine talks to.
pub struct Backends {
    pub provider: SharedProvider,
    pub transport: SharedTransport,
    pub objects: SharedObjectStore,
    pub clock: SharedClock,
}

pub struct Engine {
    pub config: EngineConfig,
    /// Marketplace access with retries applied.
    pub provider: SharedProvider,
    pub registry: Arc<WorkerRegistry>,
    pub records: Arc<RecordStore>,
    pub leaks: Arc<LeakLedger>,
    pub monitor: Arc<HeartbeatMonitor>,
    pub snapshots: Arc<SnapshotStore>,
    pub scheduler: Arc<SnapshotScheduler>,
    pub standby: Arc<StandbyManager>,
    pub racer: Arc<RacingProvisioner>,
    pub pool: Arc<WarmPool>,
    pub orchestrator: FailoverOrchestrator,
    pub clock: SharedClock,
    pub metrics: EngineMetrics,
    failures: Option<mpsc::UnboundedReceiver<FailureEvent>>,
    alerts: Option<mpsc::UnboundedReceiver<ScheduleAlert>>,
}

impl Engine {
    /// Build every component, loading persisted records. Nothing runs
    /// until [`Self::spawn`].
    ///
    /// Installs the prometheus meter provider first so every
    /// instrument is exported.
    pub fn build(config: EngineConfig, backends: Backends) -> Result<Self> {
        config.validate()?;
        let Backends {
            provider,
            transport,
            objects,
            clock,
        } = backends;
        if let Err(err) = initialize_metrics() {
            tracing::warn!("Metrics unavailable: {err}");
        }
        let metrics = EngineMetrics::new();
        let records = Arc::new(match &config.record_store_path {
            Some(path) => RecordStore::open(path)?,
            None => RecordStore::open_in_memory()?,
        });
        let retry = RetryPolicy::from_config(&config);
        let provider: SharedProvider = Arc::new(RetryingProvider::new(provider, retry.clone()));
        let registry = Arc::new(WorkerRegistry::new());
        let leaks = Arc::new(LeakLedger::load(records.clone(), clock.clone())?);

        let (monitor, failures) = HeartbeatMonitor::new(
            registry.clone(),
            config.heartbeat_timeout,
            clock.clone(),
            metrics.clone(),
        );
        let monitor = Arc::new(monitor);

        let snapshots = Arc::new(SnapshotStore::new(
            transport.clone(),
            objects,
            records.clone(),
            registry.clone(),
            clock.clone(),
            config.snapshot_bucket.clone(),
            retry,
            metrics.clone(),
        ));
        let taker: Arc<dyn SnapshotTaker> = snapshots.clone();
        let (scheduler, alerts) = SnapshotScheduler::load(
            taker,
            records.clone(),
            clock.clone(),
            config.circuit_breaker_threshold,
        )?;
        let scheduler = Arc::new(scheduler);

        let standby = Arc::new(StandbyManager::load(
            provider.clone(),
            transport.clone(),
            registry.clone(),
            records.clone(),
            leaks.clone(),
            clock.clone(),
            config.external_call_timeout,
        )?);

        let probe = Arc::new(TransportProbe::new(
            provider.clone(),
            transport,
            config.external_call_timeout,
        ));
        let racer = Arc::new(RacingProvisioner::new(
            provider.clone(),
            probe,
            leaks.clone(),
            metrics.clone(),
            RaceSettings::from_config(&config),
        ));

        let standby_guard: Arc<dyn Obligations> = standby.clone();
        let schedule_guard: Arc<dyn Obligations> = scheduler.clone();
        let pool = Arc::new(WarmPool::new(
            registry.clone(),
            monitor.clone(),
            vec![standby_guard, schedule_guard],
            racer.clone(),
            clock.clone(),
            metrics.clone(),
            PoolSettings {
                classes: config.pool_classes.clone(),
                min_ready: config.pool_min_ready,
                max_ready: config.pool_max_ready,
                race_candidates: config.race_candidates,
                max_price: config.max_price,
            },
        ));

        let orchestrator = FailoverOrchestrator::load(
            Collaborators {
                registry: registry.clone(),
                monitor: monitor.clone(),
                snapshots: snapshots.clone(),
                scheduler: scheduler.clone(),
                standby: standby.clone(),
                pool: pool.clone(),
                racer: racer.clone(),
                provider: provider.clone(),
                leaks: leaks.clone(),
                records: records.clone(),
                clock: clock.clone(),
                metrics: metrics.clone(),
            },
            FailoverSettings::from_config(&config),
        )?;

        Ok(Self {
            config,
            provider,
            registry,
            records,
            leaks,
            monitor,
            snapshots,
            scheduler,
            standby,
            racer,
            pool,
            orchestrator,
            clock,
            metrics,
            failures: Some(failures),
            alerts: Some(alerts),
        })
    }

    /// Set up logging from `config`, then build and run in one step.
    ///
    /// Embedders that install their own subscriber use
    /// [`Self::build`] and [`Self::spawn`] instead.
    pub fn start(config: EngineConfig, backends: Backends) -> Result<EngineHandle> {
        config.validate()?;
        setup_tracing(&config.log_level, config.otlp.as_ref())?;
        Self::build(config, backends)?.spawn()
    }

    /// Put a primary under heartbeat watch with the default snapshot
    /// schedule.
    pub fn register_worker(&self, worker: Worker) -> Result<()> {
        let worker_id = worker.id.clone();
        self.monitor.register(worker);
        self.scheduler.add_schedule(
            &worker_id,
            self.config.snapshot_paths.clone(),
            self.config.snapshot_interval,
        )?;
        Ok(())
    }

    pub fn report_heartbeat(&self, worker_id: &WorkerId) -> Result<bool> {
        self.monitor.report_heartbeat(worker_id)
    }

    /// Failure events not yet handed to a running orchestrator loop.
    ///
    /// Lets callers drive failovers themselves instead of
    /// [`Self::spawn`].
    pub fn take_failure_events(&mut self) -> Option<mpsc::UnboundedReceiver<FailureEvent>> {
        self.failures.take()
    }

    /// Spawn every control loop onto the current runtime.
    pub fn spawn(mut self) -> Result<EngineHandle> {
        let failures = self
            .failures
            .take()
            .ok_or_else(|| EngineError::Conflict("failure events already taken".into()))?;
        let alerts = self
            .alerts
            .take()
            .ok_or_else(|| EngineError::Conflict("engine already spawned".into()))?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let config = self.config.clone();
        let mut tasks = JoinSet::new();

        tasks.spawn(
            self.monitor
                .clone()
                .run(config.scan_interval, shutdown_rx.clone()),
        );
        tasks.spawn(
            self.scheduler
                .clone()
                .run(config.scheduler_tick, shutdown_rx.clone()),
        );
        if config.pool_max_ready > 0 && !config.pool_classes.is_empty() {
            tasks.spawn(
                self.pool
                    .clone()
                    .run(config.replenish_interval, shutdown_rx.clone()),
            );
        }
        tasks.spawn(
            self.orchestrator
                .clone()
                .run(failures, shutdown_rx.clone()),
        );
        tasks.spawn(log_alerts(alerts, shutdown_rx.clone()));
        tasks.spawn(self.leaks.clone().run(
            self.provider.clone(),
            config.leak_sweep_interval,
            shutdown_rx.clone(),
        ));

        if let Some(port) = config.api_port {
            let state = ApiState {
                orchestrator: self.orchestrator.clone(),
                leaks: self.leaks.clone(),
                scheduler: self.scheduler.clone(),
                pool: self.pool.clone(),
            };
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            let api_shutdown = shutdown_rx.clone();
            tasks.spawn(async move {
                if let Err(err) = run_webserver(addr, state, api_shutdown).await {
                    tracing::error!("Reporting API stopped: {err}");
                }
            });
        }

        tracing::info!("Engine started");
        Ok(EngineHandle {
            engine: Arc::new(self),
            shutdown,
            tasks,
        })
    }
}

async fn log_alerts(
    mut alerts: mpsc::UnboundedReceiver<ScheduleAlert>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            alert = alerts.recv() => {
                let Some(alert) = alert else { break };
                tracing::error!(
                    "Snapshots of {} disabled after {} consecutive failures: {}",
                    alert.worker_id,
                    alert.consecutive_failures,
                    alert.last_error
                );
            }
            _ = shutdown_requested(&mut shutdown) => break,
        }
    }
}

/// A running engine.
pub struct EngineHandle {
    engine: Arc<Engine>,
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl EngineHandle {
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Signal every loop to stop and wait for them. In-flight
    /// failovers are cancelled and clean up what they acquired.
    pub async fn shutdown(mut self) {
        tracing::info!("Engine shutting down");
        self.shutdown.send(true).ok();
        while let Some(res) = self.tasks.join_next().await {
            if let Err(err) = res {
                tracing::error!("Engine task failed: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::TestingClock;
    use crate::model::ResourceClass;
    use crate::model::WorkerState;
    use crate::testing::MemObjectStore;
    use crate::testing::SimCloud;

    fn backends(cloud: &SimCloud, clock: &TestingClock) -> Backends {
        Backends {
            provider: cloud.provider(),
            transport: cloud.transport(),
            objects: Arc::new(MemObjectStore::new()),
            clock: Arc::new(clock.clone()),
        }
    }

    #[tokio::test]
    async fn register_worker_adds_heartbeat_and_schedule() {
        let cloud = SimCloud::new();
        let clock = TestingClock::default();
        let engine = Engine::build(EngineConfig::default(), backends(&cloud, &clock)).unwrap();
        let worker = cloud.add_worker("a100");
        let id = worker.id.clone();
        engine.register_worker(worker).unwrap();

        assert!(engine.monitor.is_tracked(&id));
        assert_eq!(engine.registry.require(&id).unwrap().state, WorkerState::Ready);
        let schedule = engine.scheduler.schedule(&id).unwrap();
        assert_eq!(schedule.interval, Duration::from_secs(900));
        assert!(engine.report_heartbeat(&id).unwrap());
    }

    #[tokio::test]
    async fn failures_reach_the_metrics_endpoint() {
        let cloud = SimCloud::new();
        let clock = TestingClock::default();
        let engine = Engine::build(EngineConfig::default(), backends(&cloud, &clock)).unwrap();
        let worker = cloud.add_worker("a100");
        engine.register_worker(worker).unwrap();
        clock.advance(chrono::Duration::seconds(31));
        assert_eq!(engine.monitor.scan().len(), 1);

        let text = crate::metrics::render().unwrap();
        assert!(text.contains("heartbeat_failures"), "{text}");
    }

    #[test]
    fn invalid_config_is_rejected() {
        let cloud = SimCloud::new();
        let clock = TestingClock::default();
        let config = EngineConfig {
            race_candidates: 0,
            ..Default::default()
        };
        assert!(Engine::build(config, backends(&cloud, &clock)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_worker_is_failed_over_by_the_running_engine() {
        let cloud = SimCloud::new();
        cloud.add_offer("o1", "a100", 1.0, Duration::from_secs(5));
        let clock = TestingClock::default();
        let config = EngineConfig {
            api_port: None,
            race_candidates: 1,
            pool_acquire_timeout: Duration::from_millis(10),
            ..Default::default()
        };
        let handle = Engine::start(config, backends(&cloud, &clock)).unwrap();
        let engine = handle.engine().clone();
        let worker = cloud.add_worker("a100");
        let id = worker.id.clone();
        engine.monitor.register(worker);

        clock.advance(chrono::Duration::seconds(31));
        let mut done = None;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let report = engine.orchestrator.report();
            if report.total == 1 && !engine.orchestrator.is_in_flight(&id) {
                done = Some(report);
                break;
            }
        }
        let report = done.expect("failover finished");
        assert_eq!(report.succeeded, 1);
        assert!(cloud.is_destroyed(&id));
        let class = ResourceClass::from("a100");
        let replacement = engine
            .registry
            .list()
            .into_iter()
            .find(|w| w.id != id && w.resource_class == class)
            .unwrap();
        assert!(engine.monitor.is_tracked(&replacement.id));
        handle.shutdown().await;
    }
}
