use std::collections::BTreeMap;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::EngineError;
use crate::errors::Result;
use crate::model::WorkerId;

#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(pub String);

impl SnapshotId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl std::fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Pending,
    Uploaded,
    Verified,
    Failed,
}

impl SnapshotStatus {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploaded => "uploaded",
            Self::Verified => "verified",
            Self::Failed => "failed",
        }
    }
}

/// Per-file content digests of an archive, keyed by absolute path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest(pub BTreeMap<String, String>);

impl Manifest {
    /// Parse `sha256sum` output: one `<hex>  <path>` line per file,
    /// with `*` marking binary mode.
    pub fn parse_sha256sum(output: &str) -> Result<Self> {
        let mut files = BTreeMap::new();
        for line in output.lines().map(str::trim_end).filter(|l| !l.is_empty()) {
            let (digest, path) = line
                .split_once(' ')
                .ok_or_else(|| EngineError::Corruption(format!("bad checksum line {line:?}")))?;
            let path = path.trim_start_matches(' ').trim_start_matches('*');
            if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) || path.is_empty()
            {
                return Err(EngineError::Corruption(format!(
                    "bad checksum line {line:?}"
                )));
            }
            files.insert(path.to_string(), digest.to_ascii_lowercase());
        }
        Ok(Self(files))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Re-key files hashed under an extraction `root` to the absolute
    /// paths they were archived from.
    pub fn strip_root(self, root: &str) -> Result<Self> {
        let root = root.trim_end_matches('/');
        let mut files = BTreeMap::new();
        for (path, digest) in self.0 {
            let original = path
                .strip_prefix(root)
                .filter(|rest| rest.starts_with('/'))
                .ok_or_else(|| {
                    EngineError::Corruption(format!("{path} was not extracted under {root}"))
                })?;
            files.insert(original.to_string(), digest);
        }
        Ok(Self(files))
    }

    /// Paths whose digest in `found` differs from ours, or that are
    /// missing from `found` entirely.
    pub fn mismatches(&self, found: &Manifest) -> Vec<String> {
        self.0
            .iter()
            .filter(|(path, digest)| found.0.get(*path) != Some(*digest))
            .map(|(path, _)| path.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    Gzip,
}

impl Compression {
    pub(crate) fn extension(&self) -> &'static str {
        match self {
            Self::Gzip => "tar.gz",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageLocation {
    pub bucket: String,
    pub key: String,
}

impl std::fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// A content-verified archive of a worker's working state.
///
/// Only records with [`SnapshotStatus::Verified`] may be restored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: SnapshotId,
    pub worker_id: WorkerId,
    /// Hex sha256 of the whole archive. Empty until archived.
    pub digest: String,
    pub manifest: Manifest,
    pub location: StorageLocation,
    pub size_bytes: u64,
    pub compression: Compression,
    pub created_at: DateTime<Utc>,
    pub status: SnapshotStatus,
    pub error: Option<String>,
}

impl SnapshotRecord {
    pub fn is_restorable(&self) -> bool {
        self.status == SnapshotStatus::Verified
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreResult {
    pub snapshot_id: SnapshotId,
    pub target: WorkerId,
    pub files_verified: usize,
    pub digest: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunResult {
    Success,
    Failure,
}

/// Periodic snapshot settings and circuit breaker state for one
/// worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotScheduleConfig {
    pub worker_id: WorkerId,
    pub paths: Vec<String>,
    #[serde(with = "crate::serde::duration_secs")]
    pub interval: Duration,
    pub enabled: bool,
    pub next_due: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_result: Option<RunResult>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl SnapshotScheduleConfig {
    /// A fresh schedule whose first run is due immediately.
    pub fn new(
        worker_id: WorkerId,
        paths: Vec<String>,
        interval: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            worker_id,
            paths,
            interval,
            enabled: true,
            next_due: now,
            last_run: None,
            last_result: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}
