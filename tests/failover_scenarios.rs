use std::sync::Arc;
use std::time::Duration;

use spotguard::clock::Clock;
use spotguard::clock::TestingClock;
use spotguard::config::EngineConfig;
use spotguard::errors::ErrorKind;
use spotguard::model::AcquisitionStrategy;
use spotguard::model::FailoverPhase;
use spotguard::model::FailoverTrigger;
use spotguard::model::Outcome;
use spotguard::model::ResourceClass;
use spotguard::model::SnapshotStatus;
use spotguard::model::StandbySpec;
use spotguard::model::WorkerState;
use spotguard::storage::sha256_hex;
use spotguard::testing::ChecksumMode;
use spotguard::testing::MemObjectStore;
use spotguard::testing::SimCloud;
use spotguard::Backends;
use spotguard::Engine;

struct Cluster {
    cloud: SimCloud,
    objects: MemObjectStore,
    clock: TestingClock,
    engine: Engine,
}

fn cluster() -> Cluster {
    let cloud = SimCloud::new();
    let objects = MemObjectStore::new();
    let clock = TestingClock::default();
    let config = EngineConfig {
        api_port: None,
        pool_acquire_timeout: Duration::from_secs(2),
        race_candidates: 3,
        ..Default::default()
    };
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
    Cluster {
        cloud,
        objects,
        clock,
        engine,
    }
}

fn workspace() -> Vec<String> {
    vec!["/workspace".to_string()]
}

#[tokio::test(start_paused = true)]
async fn heartbeat_timeout_fails_over_to_warm_pool_worker() {
    let mut c = cluster();
    c.cloud.add_offer("standby", "cpu-small", 0.02, Duration::ZERO);

    let w1 = c.cloud.add_worker("a100");
    c.cloud
        .write_file(&w1.id, "/workspace/ckpt/step-1000.pt", b"tensor bytes");
    c.cloud
        .write_file(&w1.id, "/workspace/train.py", b"print('hi')");
    c.engine.register_worker(w1.clone()).unwrap();
    let s1 = c
        .engine
        .snapshots
        .create_snapshot(&w1, &workspace())
        .await
        .unwrap();
    assert_eq!(s1.status, SnapshotStatus::Verified);

    let assoc = c
        .engine
        .standby
        .associate(
            &w1.id,
            StandbySpec {
                resource_class: ResourceClass::from("cpu-small"),
                disk_gb: 50,
                spot: true,
                max_price: None,
            },
        )
        .await
        .unwrap();

    let spare = c.cloud.add_worker("a100");
    assert!(c.engine.pool.enroll(spare.clone()).unwrap());

    let mut failures = c.engine.take_failure_events().unwrap();
    c.clock.advance(chrono::Duration::seconds(31));
    assert_eq!(c.engine.monitor.scan().len(), 1);
    c.clock.advance(chrono::Duration::seconds(31));
    assert!(c.engine.monitor.scan().is_empty());
    let event = failures.recv().await.unwrap();
    assert!(failures.try_recv().is_err());
    assert_eq!(event.worker_id, w1.id);

    let started = tokio::time::Instant::now();
    let exec = c
        .engine
        .orchestrator
        .run_failover(&event.worker_id, FailoverTrigger::HeartbeatTimeout)
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(exec.phase, FailoverPhase::Complete);
    assert_eq!(exec.strategy, Some(AcquisitionStrategy::WarmPool));
    assert_eq!(exec.new_worker_id, Some(spare.id.clone()));
    assert_eq!(exec.snapshot_id, Some(s1.id.clone()));
    assert!(exec.restored);
    assert!(c.cloud.provisioned().iter().all(|id| id == &assoc.standby.worker_id));

    // Every restored file hashes to the snapshot's manifest.
    for (path, digest) in &s1.manifest.0 {
        let data = c.cloud.read_file(&spare.id, path).unwrap();
        assert_eq!(&sha256_hex(&data), digest, "{path}");
    }

    let mttr = exec.mttr().unwrap();
    assert_eq!(
        mttr,
        exec.phase_at(FailoverPhase::Complete).unwrap()
            - exec.phase_at(FailoverPhase::Detecting).unwrap()
    );
    let report = c.engine.orchestrator.report();
    assert_eq!(report.total, 1);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.success_rate_pct, 100.0);
    assert_eq!(
        report.mttr_secs,
        Some(mttr.num_milliseconds() as f64 / 1000.0)
    );

    // The replacement inherits the standby and the snapshot schedule.
    assert_eq!(
        c.engine.standby.lookup(&spare.id).unwrap().standby.worker_id,
        assoc.standby.worker_id
    );
    assert!(c.engine.standby.lookup(&w1.id).is_none());
    assert!(c.engine.scheduler.schedule(&spare.id).is_some());
    assert!(c.engine.scheduler.schedule(&w1.id).is_none());
    assert!(c.cloud.is_destroyed(&w1.id));
    assert!(c.engine.report_heartbeat(&spare.id).unwrap());
    assert!(c.engine.report_heartbeat(&w1.id).is_err());
}

#[tokio::test(start_paused = true)]
async fn flipped_byte_in_archive_never_restores() {
    let c = cluster();
    c.cloud.add_offer("o1", "a100", 1.0, Duration::from_secs(2));
    let w1 = c.cloud.add_worker("a100");
    c.cloud.write_file(&w1.id, "/workspace/data.bin", b"0123456789");
    c.engine.register_worker(w1.clone()).unwrap();
    let s1 = c
        .engine
        .snapshots
        .create_snapshot(&w1, &workspace())
        .await
        .unwrap();
    assert!(c.objects.corrupt(&s1.location));

    let exec = c
        .engine
        .orchestrator
        .run_failover(&w1.id, FailoverTrigger::HeartbeatTimeout)
        .await
        .unwrap();

    assert_eq!(exec.outcome, Some(Outcome::Failed));
    assert_eq!(exec.error_kind, Some(ErrorKind::Corruption));
    assert_eq!(exec.last_successful_phase, Some(FailoverPhase::Restoring));
    let new_id = exec.new_worker_id.unwrap();
    assert!(c.cloud.is_destroyed(&new_id));
    assert_eq!(
        c.engine.registry.require(&w1.id).unwrap().state,
        WorkerState::Failed
    );
    let summary = &c.engine.orchestrator.list_executions(&Default::default())[0];
    assert!(!summary.success);
    assert_eq!(summary.phase, FailoverPhase::Failed);
}

#[tokio::test(start_paused = true)]
async fn failed_recheck_falls_back_to_prior_snapshot() {
    let c = cluster();
    let w1 = c.cloud.add_worker("a100");
    c.cloud.write_file(&w1.id, "/workspace/a.txt", b"v1");
    c.engine.register_worker(w1.clone()).unwrap();
    let s1 = c
        .engine
        .snapshots
        .create_snapshot(&w1, &workspace())
        .await
        .unwrap();

    c.clock.advance(chrono::Duration::minutes(15));
    c.cloud.write_file(&w1.id, "/workspace/a.txt", b"v2");
    c.objects.set_checksum_mode(ChecksumMode::Lie);
    let err = c
        .engine
        .snapshots
        .create_snapshot(&w1, &workspace())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corruption);

    let all = c.engine.snapshots.list_snapshots(&w1.id).unwrap();
    assert_eq!(all.len(), 2);
    let s2 = all.iter().find(|s| s.id != s1.id).unwrap();
    assert_eq!(s2.status, SnapshotStatus::Failed);
    assert!(s2.error.is_some());
    assert_eq!(
        c.engine.snapshots.latest_snapshot(&w1.id).unwrap().unwrap().id,
        s1.id
    );
}

#[tokio::test(start_paused = true)]
async fn race_keeps_first_ready_and_destroys_the_rest() {
    let c = cluster();
    c.cloud.add_offer("a", "h100", 2.0, Duration::from_secs(40));
    c.cloud.add_offer("b", "h100", 2.1, Duration::from_secs(5));
    c.cloud.add_offer("c", "h100", 2.2, Duration::from_secs(25));

    let winner = c
        .engine
        .racer
        .race(&ResourceClass::from("h100"), 3, None)
        .await
        .unwrap();

    assert_eq!(c.cloud.offer_of(&winner.id).as_deref(), Some("b"));
    let provisioned = c.cloud.provisioned();
    assert_eq!(provisioned.len(), 3);
    for id in provisioned.iter().filter(|id| *id != &winner.id) {
        assert!(c.cloud.is_destroyed(id), "loser {id} still running");
    }
    assert!(!c.cloud.is_destroyed(&winner.id));
    assert!(c.engine.leaks.is_empty());
}

#[tokio::test(start_paused = true)]
async fn unreachable_worker_trips_snapshot_breaker() {
    let c = cluster();
    let w1 = c.cloud.add_worker("a100");
    c.cloud.write_file(&w1.id, "/workspace/a.txt", b"v1");
    c.engine.register_worker(w1.clone()).unwrap();
    c.cloud.set_unreachable(&w1.id, true);

    for round in 0..3 {
        let report = c.engine.scheduler.tick().await;
        assert_eq!(report.failed, vec![w1.id.clone()], "round {round}");
        c.clock.advance(chrono::Duration::minutes(16));
    }
    let health = c.engine.scheduler.health();
    assert!(!health[0].enabled);
    assert_eq!(health[0].consecutive_failures, 3);

    let attempts = c.engine.snapshots.list_snapshots(&w1.id).unwrap().len();
    c.clock.advance(chrono::Duration::hours(1));
    c.engine.scheduler.tick().await;
    assert_eq!(
        c.engine.snapshots.list_snapshots(&w1.id).unwrap().len(),
        attempts
    );

    c.cloud.set_unreachable(&w1.id, false);
    c.engine.scheduler.enable(&w1.id).unwrap();
    let report = c.engine.scheduler.tick().await;
    assert_eq!(report.succeeded, vec![w1.id.clone()]);
    assert!(c.engine.scheduler.health()[0].last_run.unwrap() <= c.clock.now());
}
