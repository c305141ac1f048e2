//! Boundary to the compute marketplace.
//!
//! Implementations translate marketplace failures into
//! [`EngineError`]s. [`RetryingProvider`] is what the rest of the
//! engine talks to: it owns all marketplace retry and backoff, so
//! callers only ever see success, [`EngineError::CapacityUnavailable`]
//! or a non-retryable error.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::EngineError;
use crate::errors::Result;
use crate::model::Endpoint;
use crate::model::Offer;
use crate::model::ResourceClass;
use crate::model::Worker;
use crate::model::WorkerId;
use crate::retry::retry;
use crate::retry::RetryPolicy;

#[async_trait]
pub trait WorkerProvider: Send + Sync + 'static {
    /// Offers for `resource_class`, optionally capped at a price per
    /// hour.
    async fn list_offers(
        &self,
        resource_class: &ResourceClass,
        max_price: Option<f64>,
    ) -> Result<Vec<Offer>>;

    /// Rent the instance behind `offer`. The returned worker is in
    /// [`crate::model::WorkerState::Provisioning`].
    async fn provision(&self, offer: &Offer) -> Result<Worker>;

    /// Release a worker. Destroying an already gone worker succeeds.
    async fn destroy(&self, worker_id: &WorkerId) -> Result<()>;

    async fn connection_info(&self, worker_id: &WorkerId) -> Result<Endpoint>;
}

pub type SharedProvider = Arc<dyn WorkerProvider>;

/// Wraps a provider with timeouts, backoff and rate-limit handling.
pub struct RetryingProvider {
    inner: SharedProvider,
    policy: RetryPolicy,
}

impl RetryingProvider {
    pub fn new(inner: SharedProvider, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn call<T, F, Fut>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry(&self.policy, operation, f).await.map_err(|err| match err {
            EngineError::RateLimited(msg) => {
                EngineError::CapacityUnavailable(format!("{operation} still rate limited: {msg}"))
            }
            other => other,
        })
    }
}

#[async_trait]
impl WorkerProvider for RetryingProvider {
    async fn list_offers(
        &self,
        resource_class: &ResourceClass,
        max_price: Option<f64>,
    ) -> Result<Vec<Offer>> {
        self.call("list_offers", || self.inner.list_offers(resource_class, max_price))
            .await
    }

    async fn provision(&self, offer: &Offer) -> Result<Worker> {
        self.call("provision", || self.inner.provision(offer)).await
    }

    async fn destroy(&self, worker_id: &WorkerId) -> Result<()> {
        self.call("destroy", || self.inner.destroy(worker_id)).await
    }

    async fn connection_info(&self, worker_id: &WorkerId) -> Result<Endpoint> {
        self.call("connection_info", || self.inner.connection_info(worker_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::errors::ErrorKind;
    use crate::testing::SimCloud;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            rate_limit_delay: Duration::from_secs(1),
            call_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limits_are_absorbed() {
        let cloud = SimCloud::new();
        cloud.add_offer("o1", "a100", 1.0, Duration::ZERO);
        cloud.rate_limit_next(2);
        let provider = RetryingProvider::new(cloud.provider(), policy());

        let offers = provider.list_offers(&"a100".into(), None).await.unwrap();
        assert_eq!(offers.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_rate_limit_is_capacity_unavailable() {
        let cloud = SimCloud::new();
        cloud.add_offer("o1", "a100", 1.0, Duration::ZERO);
        cloud.rate_limit_next(10);
        let provider = RetryingProvider::new(cloud.provider(), policy());

        let err = provider
            .list_offers(&"a100".into(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapacityUnavailable);
    }
}
