//! Competitive provisioning.
//!
//! A race rents several candidates at once and keeps the first one
//! that answers its readiness probe. Every other candidate is
//! destroyed as soon as the race is decided, whatever its progress.
//! A loser that cannot be destroyed is recorded in the
//! [`LeakLedger`] and never fails the race.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::common::shutdown_requested;
use crate::common::with_timeout;
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::errors::Result;
use crate::leaks::LeakLedger;
use crate::leaks::LeakReason;
use crate::metrics::label;
use crate::metrics::EngineMetrics;
use crate::model::Endpoint;
use crate::model::Offer;
use crate::model::ResourceClass;
use crate::model::Worker;
use crate::model::WorkerId;
use crate::model::WorkerState;
use crate::provider::SharedProvider;
use crate::transport::RemoteCommand;
use crate::transport::SharedTransport;

/// Decides whether a freshly provisioned worker can take work.
#[async_trait]
pub trait ReadinessProbe: Send + Sync + 'static {
    /// Resolve the worker's endpoint and check it answers.
    async fn probe(&self, worker: &Worker) -> Result<Endpoint>;
}

/// Ready once the marketplace reports an endpoint and a no-op
/// command succeeds over the transport.
pub struct TransportProbe {
    provider: SharedProvider,
    transport: SharedTransport,
    timeout: Duration,
}

impl TransportProbe {
    pub fn new(provider: SharedProvider, transport: SharedTransport, timeout: Duration) -> Self {
        Self {
            provider,
            transport,
            timeout,
        }
    }
}

#[async_trait]
impl ReadinessProbe for TransportProbe {
    async fn probe(&self, worker: &Worker) -> Result<Endpoint> {
        let endpoint = self.provider.connection_info(&worker.id).await?;
        with_timeout(
            "readiness probe",
            self.timeout,
            self.transport.run(&endpoint, &RemoteCommand::new("true")),
        )
        .await?;
        Ok(endpoint)
    }
}

#[derive(Debug, Clone)]
pub struct RaceSettings {
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// How long a finished race waits for its losers to be
    /// destroyed before leaving it to the background.
    pub teardown_grace: Duration,
}

impl RaceSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            timeout: config.race_timeout,
            poll_interval: config.race_poll_interval,
            teardown_grace: config.teardown_grace,
        }
    }
}

#[derive(Debug)]
enum Candidate {
    Ready(Worker),
    Lost {
        worker_id: Option<WorkerId>,
        error: EngineError,
    },
}

pub struct RacingProvisioner {
    provider: SharedProvider,
    probe: Arc<dyn ReadinessProbe>,
    leaks: Arc<LeakLedger>,
    metrics: EngineMetrics,
    settings: RaceSettings,
}

impl RacingProvisioner {
    pub fn new(
        provider: SharedProvider,
        probe: Arc<dyn ReadinessProbe>,
        leaks: Arc<LeakLedger>,
        metrics: EngineMetrics,
        settings: RaceSettings,
    ) -> Self {
        Self {
            provider,
            probe,
            leaks,
            metrics,
            settings,
        }
    }

    /// Provision up to `candidates` of the cheapest offers at once
    /// and return the first to become ready.
    pub async fn race(
        &self,
        resource_class: &ResourceClass,
        candidates: usize,
        max_price: Option<f64>,
    ) -> Result<Worker> {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        self.race_until(resource_class, candidates, max_price, cancel_rx)
            .await
    }

    /// Like [`Self::race`], abandoning the race with
    /// [`EngineError::Cancelled`] once `cancel` flips to `true`. All
    /// candidates are still destroyed.
    #[tracing::instrument(name = "race", skip(self, cancel), fields(class = %resource_class))]
    pub async fn race_until(
        &self,
        resource_class: &ResourceClass,
        candidates: usize,
        max_price: Option<f64>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<Worker> {
        let mut offers = self.provider.list_offers(resource_class, max_price).await?;
        Offer::sort_by_price(&mut offers);
        offers.truncate(candidates);
        if offers.is_empty() {
            self.metrics.race_total.add(1, &label("outcome", "no_offers"));
            return Err(EngineError::CapacityUnavailable(format!(
                "no {resource_class} offers under {max_price:?}"
            )));
        }
        tracing::info!(
            "Racing {} candidates: {:?}",
            offers.len(),
            offers.iter().map(|o| &o.id).collect::<Vec<_>>()
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut set = JoinSet::new();
        for offer in offers {
            set.spawn(run_candidate(
                self.provider.clone(),
                self.probe.clone(),
                offer,
                self.settings.poll_interval,
                stop_rx.clone(),
            ));
        }

        let deadline = Instant::now() + self.settings.timeout;
        let expired = tokio::time::sleep_until(deadline);
        tokio::pin!(expired);
        let mut losers = Vec::new();
        let mut last_error = None;
        let outcome = loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    Some(Ok(Candidate::Ready(worker))) => break Ok(worker),
                    Some(Ok(Candidate::Lost { worker_id, error })) => {
                        tracing::debug!("Candidate dropped out: {error}");
                        losers.extend(worker_id);
                        last_error = Some(error);
                    }
                    Some(Err(err)) => tracing::error!("Race candidate task failed: {err}"),
                    None => {
                        let detail = last_error
                            .take()
                            .map_or_else(|| "no candidate finished".to_string(), |e| e.to_string());
                        break Err(EngineError::CapacityUnavailable(format!(
                            "every {resource_class} candidate failed; last: {detail}"
                        )));
                    }
                },
                _ = &mut expired => {
                    break Err(EngineError::ProvisioningTimeout(self.settings.timeout));
                }
                _ = shutdown_requested(&mut cancel) => {
                    break Err(EngineError::Cancelled("race cancelled".into()));
                }
            }
        };

        if stop_tx.send(true).is_err() {
            tracing::trace!("Every candidate already finished");
        }
        let reaper = tokio::spawn(reap(
            self.provider.clone(),
            self.leaks.clone(),
            self.metrics.clone(),
            set,
            losers,
        ));
        if tokio::time::timeout(self.settings.teardown_grace, reaper)
            .await
            .is_err()
        {
            tracing::warn!("Race losers still being destroyed in the background");
        }

        match outcome {
            Ok(worker) => {
                tracing::info!("Race won by {}", worker.id);
                self.metrics.race_total.add(1, &label("outcome", "won"));
                Ok(worker)
            }
            Err(err) => {
                tracing::warn!("Race for {resource_class} lost: {err}");
                self.metrics
                    .race_total
                    .add(1, &label("outcome", err.kind().as_str()));
                Err(err)
            }
        }
    }
}

async fn run_candidate(
    provider: SharedProvider,
    probe: Arc<dyn ReadinessProbe>,
    offer: Offer,
    poll_interval: Duration,
    mut stop: watch::Receiver<bool>,
) -> Candidate {
    // Provisioning is never interrupted so the worker id is always
    // known for teardown.
    let mut worker = match provider.provision(&offer).await {
        Ok(worker) => worker,
        Err(error) => {
            return Candidate::Lost {
                worker_id: None,
                error,
            }
        }
    };
    tracing::debug!("Candidate {} rented from offer {}", worker.id, offer.id);
    loop {
        if *stop.borrow() {
            break;
        }
        tokio::select! {
            probed = probe.probe(&worker) => match probed {
                Ok(endpoint) => {
                    worker.endpoint = endpoint;
                    worker.state = WorkerState::Ready;
                    return Candidate::Ready(worker);
                }
                Err(err) => tracing::trace!("Candidate {} not ready: {err}", worker.id),
            },
            _ = shutdown_requested(&mut stop) => break,
        }
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = shutdown_requested(&mut stop) => break,
        }
    }
    Candidate::Lost {
        worker_id: Some(worker.id),
        error: EngineError::Cancelled("race decided".into()),
    }
}

/// Destroy every loser concurrently, including candidates that only
/// finish after the race was decided.
async fn reap(
    provider: SharedProvider,
    leaks: Arc<LeakLedger>,
    metrics: EngineMetrics,
    mut candidates: JoinSet<Candidate>,
    losers: Vec<WorkerId>,
) {
    let mut destroys: JoinSet<(WorkerId, Result<()>)> = JoinSet::new();
    let spawn_destroy = |destroys: &mut JoinSet<(WorkerId, Result<()>)>, worker_id: WorkerId| {
        let provider = provider.clone();
        destroys.spawn(async move {
            let res = provider.destroy(&worker_id).await;
            (worker_id, res)
        });
    };
    for worker_id in losers {
        spawn_destroy(&mut destroys, worker_id);
    }
    while let Some(joined) = candidates.join_next().await {
        match joined {
            Ok(Candidate::Ready(worker)) => spawn_destroy(&mut destroys, worker.id),
            Ok(Candidate::Lost {
                worker_id: Some(worker_id),
                ..
            }) => spawn_destroy(&mut destroys, worker_id),
            Ok(Candidate::Lost { worker_id: None, .. }) => {}
            Err(err) => tracing::error!("Race candidate task failed: {err}"),
        }
    }
    while let Some(joined) = destroys.join_next().await {
        match joined {
            Ok((worker_id, Ok(()))) => tracing::debug!("Destroyed race loser {worker_id}"),
            Ok((worker_id, Err(err))) => {
                metrics.race_loser_leaks.add(1, &[]);
                leaks.record(&worker_id, LeakReason::RaceLoser, err.to_string());
            }
            Err(err) => tracing::error!("Loser teardown task failed: {err}"),
        }
    }
}
