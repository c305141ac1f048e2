//! Failover and recovery orchestration for spot GPU workers.
//!
//! Workers are watched through heartbeats. When one goes silent, a
//! failover episode acquires a replacement from the warm pool or by
//! racing several marketplace offers, restores the latest verified
//! snapshot onto it, checks every restored file against the
//! snapshot's manifest and puts it into service. Every episode is
//! recorded with per-phase timestamps for MTTR reporting.
//!
//! [`engine::Engine`] wires the components together. The
//! [`testing`] module has simulated backends to run it without a
//! marketplace.

pub mod clock;
pub(crate) mod common;
pub mod config;
pub mod engine;
pub mod errors;
pub mod heartbeat;
pub mod leaks;
#[macro_use]
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod provider;
pub mod racing;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod serde;
pub mod snapshot;
pub mod standby;
pub mod storage;
pub mod store;
pub mod testing;
pub mod tracing;
pub mod transport;
pub mod warm_pool;
pub mod webserver;

pub use engine::Backends;
pub use engine::Engine;
pub use engine::EngineHandle;
pub use errors::EngineError;
pub use errors::Result;
