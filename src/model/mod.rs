//! Records shared between the engine's components.

mod failover;
mod snapshot;
mod standby;
mod worker;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

pub use failover::AcquisitionStrategy;
pub use failover::ExecutionFilter;
pub use failover::ExecutionId;
pub use failover::ExecutionSummary;
pub use failover::FailoverExecution;
pub use failover::FailoverPhase;
pub use failover::FailoverReport;
pub use failover::FailoverTrigger;
pub use failover::LogEntry;
pub use failover::Outcome;
pub use failover::PhaseStamp;
pub use snapshot::Compression;
pub use snapshot::Manifest;
pub use snapshot::RestoreResult;
pub use snapshot::RunResult;
pub use snapshot::SnapshotId;
pub use snapshot::SnapshotRecord;
pub use snapshot::SnapshotScheduleConfig;
pub use snapshot::SnapshotStatus;
pub use snapshot::StorageLocation;
pub use standby::AssociationState;
pub use standby::CostEstimate;
pub use standby::StandbyAssociation;
pub use standby::StandbyResource;
pub use standby::StandbySpec;
pub use worker::Endpoint;
pub use worker::Offer;
pub use worker::ResourceClass;
pub use worker::Worker;
pub use worker::WorkerId;
pub use worker::WorkerState;

/// An idle, ready worker held in the warm pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmPoolEntry {
    pub resource_class: ResourceClass,
    pub worker_id: WorkerId,
    pub enrolled_at: DateTime<Utc>,
}
