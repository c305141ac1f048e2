use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::model::Endpoint;
use crate::model::ResourceClass;
use crate::model::WorkerId;

/// What kind of standby to pair with a primary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandbySpec {
    pub resource_class: ResourceClass,
    pub disk_gb: u32,
    pub spot: bool,
    pub max_price: Option<f64>,
}

/// The provisioned standby instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandbyResource {
    pub worker_id: WorkerId,
    pub handle: String,
    pub endpoint: Endpoint,
    pub resource_class: ResourceClass,
    pub price_per_hour: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationState {
    Active,
    Broken,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandbyAssociation {
    pub primary_id: WorkerId,
    pub standby: StandbyResource,
    pub spec: StandbySpec,
    pub state: AssociationState,
    pub created_at: DateTime<Utc>,
    pub last_verified_at: DateTime<Utc>,
}

/// Projected spend for a standby, in dollars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub hourly_compute: f64,
    pub monthly_compute: f64,
    pub monthly_disk: f64,
    pub monthly_total: f64,
}
