//! Read-only reporting API.
//!
//! Serves the failover reporting contract as JSON, plus leaks,
//! snapshot schedule health, the warm pool and prometheus metrics.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Extension;
use axum::extract::Query;
use axum::http::header;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::Json;
use axum::Router;
use tokio::sync::watch;

use crate::common::shutdown_requested;
use crate::errors::EngineError;
use crate::errors::Result;
use crate::leaks::LeakLedger;
use crate::leaks::ResourceLeak;
use crate::metrics::render;
use crate::model::ExecutionFilter;
use crate::model::ExecutionSummary;
use crate::model::FailoverReport;
use crate::model::WarmPoolEntry;
use crate::orchestrator::FailoverOrchestrator;
use crate::scheduler::ScheduleHealth;
use crate::scheduler::SnapshotScheduler;
use crate::warm_pool::WarmPool;

pub struct ApiState {
    pub orchestrator: FailoverOrchestrator,
    pub leaks: Arc<LeakLedger>,
    pub scheduler: Arc<SnapshotScheduler>,
    pub pool: Arc<WarmPool>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/failovers", get(list_failovers))
        .route("/failovers/report", get(failover_report))
        .route("/leaks", get(list_leaks))
        .route("/snapshots/schedules", get(schedule_health))
        .route("/pool", get(pool_entries))
        .route("/metrics", get(metrics))
        .layer(Extension(Arc::new(state)))
}

/// Serve until `shutdown` flips.
pub async fn run_webserver(
    addr: SocketAddr,
    state: ApiState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let app = router(state);
    tracing::info!("Starting reporting API server on {addr:?}");
    axum::Server::try_bind(&addr)
        .map_err(|err| {
            EngineError::Config(format!("Unable to create local webserver at {addr}: {err}"))
        })?
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move { shutdown_requested(&mut shutdown).await })
        .await
        .map_err(|err| EngineError::TransientNetwork(format!("reporting API: {err}")))
}

async fn list_failovers(
    Extension(state): Extension<Arc<ApiState>>,
    Query(filter): Query<ExecutionFilter>,
) -> Json<Vec<ExecutionSummary>> {
    Json(state.orchestrator.list_executions(&filter))
}

async fn failover_report(Extension(state): Extension<Arc<ApiState>>) -> Json<FailoverReport> {
    Json(state.orchestrator.report())
}

async fn list_leaks(Extension(state): Extension<Arc<ApiState>>) -> Json<Vec<ResourceLeak>> {
    Json(state.leaks.list())
}

async fn schedule_health(Extension(state): Extension<Arc<ApiState>>) -> Json<Vec<ScheduleHealth>> {
    Json(state.scheduler.health())
}

async fn pool_entries(Extension(state): Extension<Arc<ApiState>>) -> Json<Vec<WarmPoolEntry>> {
    Json(state.pool.entries())
}

async fn metrics() -> Response {
    match render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            tracing::error!("{err}");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestingClock;
    use crate::config::EngineConfig;
    use crate::engine::Backends;
    use crate::engine::Engine;
    use crate::leaks::LeakReason;
    use crate::model::FailoverTrigger;
    use crate::testing::MemObjectStore;
    use crate::testing::SimCloud;

    fn state() -> (ApiState, Engine, SimCloud) {
        let cloud = SimCloud::new();
        let engine = Engine::build(
            EngineConfig::default(),
            Backends {
                provider: cloud.provider(),
                transport: cloud.transport(),
                objects: Arc::new(MemObjectStore::new()),
                clock: Arc::new(TestingClock::default()),
            },
        )
        .unwrap();
        let state = ApiState {
            orchestrator: engine.orchestrator.clone(),
            leaks: engine.leaks.clone(),
            scheduler: engine.scheduler.clone(),
            pool: engine.pool.clone(),
        };
        (state, engine, cloud)
    }

    #[tokio::test]
    async fn failovers_are_filtered_by_query() {
        let (state, engine, _cloud) = state();
        let state = Arc::new(state);
        // Unknown worker: the episode fails straight out of detecting.
        let exec = engine
            .orchestrator
            .run_failover(&"ghost".into(), FailoverTrigger::HeartbeatTimeout)
            .await
            .unwrap();
        assert!(!exec.is_active());

        let Json(all) = list_failovers(
            Extension(state.clone()),
            Query(ExecutionFilter::default()),
        )
        .await;
        assert_eq!(all.len(), 1);
        assert!(!all[0].success);
        assert!(all[0].error.is_some());

        let Json(active) =
            list_failovers(Extension(state.clone()), Query(ExecutionFilter::active())).await;
        assert!(active.is_empty());

        let Json(report) = failover_report(Extension(state)).await;
        assert_eq!(report.total, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.success_rate_pct, 0.0);
    }

    #[tokio::test]
    async fn leaks_are_listed() {
        let (state, engine, _cloud) = state();
        engine
            .leaks
            .record(&"w1".into(), LeakReason::RaceLoser, "destroy refused");
        let Json(leaks) = list_leaks(Extension(Arc::new(state))).await;
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].reason, LeakReason::RaceLoser);
    }
}
