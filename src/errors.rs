//! Error taxonomy shared by every component.
//!
//! Adapters (marketplace, remote execution, object storage) normalize
//! whatever their backend reports into [`EngineError`] before handing
//! it to orchestration logic, so the orchestrator only ever matches
//! on [`ErrorKind`].

use std::panic::Location;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Coarse classification of an [`EngineError`].
///
/// This is what gets persisted on failed records and reported
/// outward, so it is part of the reporting contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientNetwork,
    CapacityUnavailable,
    RateLimited,
    Corruption,
    Timeout,
    ProvisioningTimeout,
    PoolEmpty,
    CommandFailed,
    NotFound,
    Conflict,
    Cancelled,
    Storage,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientNetwork => "transient_network",
            Self::CapacityUnavailable => "capacity_unavailable",
            Self::RateLimited => "rate_limited",
            Self::Corruption => "corruption",
            Self::Timeout => "timeout",
            Self::ProvisioningTimeout => "provisioning_timeout",
            Self::PoolEmpty => "pool_empty",
            Self::CommandFailed => "command_failed",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Cancelled => "cancelled",
            Self::Storage => "storage",
            Self::Config => "config",
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),
    #[error("capacity unavailable: {0}")]
    CapacityUnavailable(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("corruption detected: {0}")]
    Corruption(String),
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },
    #[error("no candidate became ready within {0:?}")]
    ProvisioningTimeout(Duration),
    #[error("warm pool has no ready worker of class {0}")]
    PoolEmpty(String),
    #[error("remote command `{command}` exited with {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("record store error: {0}")]
    Storage(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransientNetwork(_) => ErrorKind::TransientNetwork,
            Self::CapacityUnavailable(_) => ErrorKind::CapacityUnavailable,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::Corruption(_) => ErrorKind::Corruption,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ProvisioningTimeout(_) => ErrorKind::ProvisioningTimeout,
            Self::PoolEmpty(_) => ErrorKind::PoolEmpty,
            Self::CommandFailed { .. } => ErrorKind::CommandFailed,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether a backoff-and-retry may fix this.
    ///
    /// Rate limits get the longer rate-limit backoff. Corruption is
    /// never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork(_) | Self::RateLimited(_))
    }

    /// Prefix the human readable part of the error, keeping its kind.
    pub fn context(self, msg: &str) -> Self {
        let wrap = |inner: String| format!("{msg}: {inner}");
        match self {
            Self::TransientNetwork(m) => Self::TransientNetwork(wrap(m)),
            Self::CapacityUnavailable(m) => Self::CapacityUnavailable(wrap(m)),
            Self::RateLimited(m) => Self::RateLimited(wrap(m)),
            Self::Corruption(m) => Self::Corruption(wrap(m)),
            Self::Timeout { operation, after } => Self::Timeout {
                operation: wrap(operation),
                after,
            },
            Self::ProvisioningTimeout(after) => Self::ProvisioningTimeout(after),
            Self::PoolEmpty(m) => Self::PoolEmpty(m),
            Self::CommandFailed {
                command,
                exit_code,
                stderr,
            } => Self::CommandFailed {
                command: wrap(command),
                exit_code,
                stderr,
            },
            Self::NotFound(m) => Self::NotFound(wrap(m)),
            Self::Conflict(m) => Self::Conflict(wrap(m)),
            Self::Cancelled(m) => Self::Cancelled(wrap(m)),
            Self::Storage(m) => Self::Storage(wrap(m)),
            Self::Config(m) => Self::Config(wrap(m)),
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<rusqlite_migration::Error> for EngineError {
    fn from(err: rusqlite_migration::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("serialization: {err}"))
    }
}

/// Attach a message and the caller's location to an error while
/// keeping its [`ErrorKind`].
pub trait Context<T> {
    /// Example:
    ///     store.open(path).reraise("can't open record store")?;
    fn reraise(self, msg: &str) -> Result<T>;
}

impl<T> Context<T> for Result<T> {
    #[track_caller]
    fn reraise(self, msg: &str) -> Result<T> {
        let caller = Location::caller();
        self.map_err(|err| err.context(&prepend_caller(caller, msg)))
    }
}

/// Prepend '({caller}) ' to the message
fn prepend_caller(caller: &Location, msg: &str) -> String {
    format!("({caller}) {msg}")
}
