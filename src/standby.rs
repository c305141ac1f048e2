//! Pairing of GPU primaries with cheap always-on standbys.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;

use crate::clock::SharedClock;
use crate::common::lock;
use crate::common::read;
use crate::common::with_timeout;
use crate::common::write;
use crate::errors::EngineError;
use crate::errors::Result;
use crate::leaks::LeakLedger;
use crate::leaks::LeakReason;
use crate::model::AssociationState;
use crate::model::CostEstimate;
use crate::model::Offer;
use crate::model::ResourceClass;
use crate::model::StandbyAssociation;
use crate::model::StandbyResource;
use crate::model::StandbySpec;
use crate::model::WorkerId;
use crate::provider::SharedProvider;
use crate::registry::WorkerRegistry;
use crate::store::RecordStore;
use crate::transport::RemoteCommand;
use crate::transport::SharedTransport;
use crate::warm_pool::Obligations;

const HOURS_PER_MONTH: f64 = 730.0;
const DISK_PER_GB_MONTH: f64 = 0.10;
const SPOT_DISCOUNT: f64 = 0.6;

/// On-demand hourly compute rates for standby classes.
const STANDBY_RATES: &[(&str, f64)] = &[
    ("cpu-small", 0.02),
    ("cpu-medium", 0.05),
    ("cpu-large", 0.10),
    ("gpu-t4", 0.35),
];
const UNLISTED_RATE: f64 = 0.10;

/// Projected spend of a candidate standby. Pure; callers use it
/// before committing to [`StandbyManager::associate`].
pub fn estimate_cost(spec: &StandbySpec) -> CostEstimate {
    let base = STANDBY_RATES
        .iter()
        .find(|(class, _)| *class == spec.resource_class.0)
        .map_or(UNLISTED_RATE, |(_, rate)| *rate);
    let hourly_compute = if spec.spot {
        base * (1.0 - SPOT_DISCOUNT)
    } else {
        base
    };
    let monthly_compute = hourly_compute * HOURS_PER_MONTH;
    let monthly_disk = f64::from(spec.disk_gb) * DISK_PER_GB_MONTH;
    CostEstimate {
        hourly_compute,
        monthly_compute,
        monthly_disk,
        monthly_total: monthly_compute + monthly_disk,
    }
}

pub struct StandbyManager {
    associations: RwLock<HashMap<WorkerId, StandbyAssociation>>,
    /// Held across provisioning so one primary never gets two standbys.
    provisioning: Mutex<HashMap<WorkerId, Arc<AsyncMutex<()>>>>,
    provider: SharedProvider,
    transport: SharedTransport,
    registry: Arc<WorkerRegistry>,
    records: Arc<RecordStore>,
    leaks: Arc<LeakLedger>,
    clock: SharedClock,
    probe_timeout: Duration,
}

impl StandbyManager {
    #[allow(clippy::too_many_arguments)]
    pub fn load(
        provider: SharedProvider,
        transport: SharedTransport,
        registry: Arc<WorkerRegistry>,
        records: Arc<RecordStore>,
        leaks: Arc<LeakLedger>,
        clock: SharedClock,
        probe_timeout: Duration,
    ) -> Result<Self> {
        let associations = records
            .associations()?
            .into_iter()
            .map(|a| (a.primary_id.clone(), a))
            .collect();
        Ok(Self {
            associations: RwLock::new(associations),
            provisioning: Mutex::new(HashMap::new()),
            provider,
            transport,
            registry,
            records,
            leaks,
            clock,
            probe_timeout,
        })
    }

    /// Pair `primary_id` with a standby, provisioning the cheapest
    /// matching offer. An existing active association is returned
    /// unchanged, also to a caller that raced the one creating it.
    #[tracing::instrument(name = "associate_standby", skip(self, spec), fields(class = %spec.resource_class))]
    pub async fn associate(
        &self,
        primary_id: &WorkerId,
        spec: StandbySpec,
    ) -> Result<StandbyAssociation> {
        let primary = self.registry.require(primary_id)?;
        if primary.resource_class == spec.resource_class {
            return Err(EngineError::Config(format!(
                "standby class {} must differ from the primary's",
                spec.resource_class
            )));
        }
        let slot = lock(&self.provisioning)
            .entry(primary_id.clone())
            .or_default()
            .clone();
        let _provisioning = slot.lock().await;
        if let Some(existing) = self.lookup(primary_id) {
            if existing.state == AssociationState::Active {
                tracing::debug!("Reusing standby {} of {primary_id}", existing.standby.worker_id);
                return Ok(existing);
            }
            // Broken standbys are replaced.
            self.break_association(primary_id).await?;
        }

        let offer = self.cheapest_offer(&spec).await?;
        let worker = self.provider.provision(&offer).await?;
        let now = self.clock.now();
        let assoc = StandbyAssociation {
            primary_id: primary_id.clone(),
            standby: StandbyResource {
                worker_id: worker.id,
                handle: worker.handle,
                endpoint: worker.endpoint,
                resource_class: worker.resource_class,
                price_per_hour: offer.price_per_hour,
            },
            spec,
            state: AssociationState::Active,
            created_at: now,
            last_verified_at: now,
        };
        if let Err(err) = self.records.put_association(&assoc) {
            self.destroy_standby(&assoc.standby.worker_id, "association not persisted").await;
            return Err(err);
        }
        write(&self.associations).insert(primary_id.clone(), assoc.clone());
        tracing::info!(
            "Associated standby {} with {primary_id}",
            assoc.standby.worker_id
        );
        Ok(assoc)
    }

    async fn cheapest_offer(&self, spec: &StandbySpec) -> Result<Offer> {
        let mut offers: Vec<Offer> = self
            .provider
            .list_offers(&spec.resource_class, spec.max_price)
            .await?
            .into_iter()
            .filter(|o| o.spot == spec.spot)
            .collect();
        Offer::sort_by_price(&mut offers);
        offers.into_iter().next().ok_or_else(|| {
            EngineError::CapacityUnavailable(format!(
                "no {} offers for a standby",
                spec.resource_class
            ))
        })
    }

    /// Remove the association and destroy its standby. A failed
    /// destroy is recorded as a leak.
    pub async fn break_association(&self, primary_id: &WorkerId) -> Result<Option<StandbyAssociation>> {
        let removed = write(&self.associations).remove(primary_id);
        let Some(assoc) = removed else {
            return Ok(None);
        };
        self.records.delete_association(primary_id)?;
        self.destroy_standby(&assoc.standby.worker_id, "association broken").await;
        tracing::info!("Broke standby association of {primary_id}");
        Ok(Some(assoc))
    }

    async fn destroy_standby(&self, standby_id: &WorkerId, why: &str) {
        if let Err(err) = self.provider.destroy(standby_id).await {
            self.leaks
                .record(standby_id, LeakReason::Standby, format!("{why}: {err}"));
        }
    }

    pub fn lookup(&self, primary_id: &WorkerId) -> Option<StandbyAssociation> {
        read(&self.associations).get(primary_id).cloned()
    }

    pub fn list(&self) -> Vec<StandbyAssociation> {
        let mut all: Vec<_> = read(&self.associations).values().cloned().collect();
        all.sort_by(|a, b| a.primary_id.cmp(&b.primary_id));
        all
    }

    /// Probe the standby and record whether it still answers.
    pub async fn verify(&self, primary_id: &WorkerId) -> Result<AssociationState> {
        let assoc = self
            .lookup(primary_id)
            .ok_or_else(|| EngineError::NotFound(format!("standby of {primary_id}")))?;
        let probe = RemoteCommand::new("true");
        let res = with_timeout(
            "standby probe",
            self.probe_timeout,
            self.transport.run(&assoc.standby.endpoint, &probe),
        )
        .await;
        let now = self.clock.now();

        let mut associations = write(&self.associations);
        let Some(current) = associations.get_mut(primary_id) else {
            return Err(EngineError::NotFound(format!("standby of {primary_id}")));
        };
        match res {
            Ok(_) => {
                current.state = AssociationState::Active;
                current.last_verified_at = now;
            }
            Err(err) => {
                tracing::warn!(
                    "Standby {} of {primary_id} unreachable: {err}",
                    current.standby.worker_id
                );
                current.state = AssociationState::Broken;
            }
        }
        self.records.put_association(current)?;
        Ok(current.state)
    }

    /// Move the association of a replaced primary onto its
    /// successor.
    pub fn rebind(&self, old_primary: &WorkerId, new_primary: &WorkerId) -> Result<bool> {
        let mut associations = write(&self.associations);
        let Some(mut assoc) = associations.remove(old_primary) else {
            return Ok(false);
        };
        assoc.primary_id = new_primary.clone();
        self.records.delete_association(old_primary)?;
        self.records.put_association(&assoc)?;
        tracing::info!(
            "Standby {} now backs {new_primary}",
            assoc.standby.worker_id
        );
        associations.insert(new_primary.clone(), assoc);
        Ok(true)
    }

    pub fn standby_class(&self, primary_id: &WorkerId) -> Option<ResourceClass> {
        self.lookup(primary_id).map(|a| a.standby.resource_class)
    }
}

impl Obligations for StandbyManager {
    fn blocks_release(&self, worker_id: &WorkerId) -> Option<String> {
        read(&self.associations).values().find_map(|a| {
            if a.state != AssociationState::Active {
                None
            } else if &a.primary_id == worker_id {
                Some(format!("primary of standby {}", a.standby.worker_id))
            } else if &a.standby.worker_id == worker_id {
                Some(format!("standby of {}", a.primary_id))
            } else {
                None
            }
        })
    }
}
