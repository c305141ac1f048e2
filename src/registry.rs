//! Shared table of known workers.
//!
//! The heartbeat monitor only writes timestamps and the failed
//! transition here; every other lifecycle transition belongs to the
//! orchestrator.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::DateTime;
use chrono::Utc;

use crate::common::read;
use crate::common::write;
use crate::errors::EngineError;
use crate::errors::Result;
use crate::model::Worker;
use crate::model::WorkerId;
use crate::model::WorkerState;

#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<WorkerId, Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a worker.
    pub fn insert(&self, worker: Worker) {
        tracing::trace!("Registering worker {:?} in state {:?}", worker.id, worker.state);
        write(&self.workers).insert(worker.id.clone(), worker);
    }

    pub fn get(&self, id: &WorkerId) -> Option<Worker> {
        read(&self.workers).get(id).cloned()
    }

    pub fn require(&self, id: &WorkerId) -> Result<Worker> {
        self.get(id)
            .ok_or_else(|| EngineError::NotFound(format!("worker {id}")))
    }

    /// Returns the previous state.
    pub fn set_state(&self, id: &WorkerId, state: WorkerState) -> Result<WorkerState> {
        let mut workers = write(&self.workers);
        let worker = workers
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("worker {id}")))?;
        let prev = worker.state;
        worker.state = state;
        if prev != state {
            tracing::debug!("Worker {id} {prev:?} -> {state:?}");
        }
        Ok(prev)
    }

    pub fn touch(&self, id: &WorkerId, at: DateTime<Utc>) -> Result<()> {
        let mut workers = write(&self.workers);
        let worker = workers
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("worker {id}")))?;
        worker.last_heartbeat = Some(at);
        Ok(())
    }

    pub fn remove(&self, id: &WorkerId) -> Option<Worker> {
        write(&self.workers).remove(id)
    }

    pub fn list(&self) -> Vec<Worker> {
        let mut workers: Vec<_> = read(&self.workers).values().cloned().collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }
}
