//! Content-verified snapshot archives.
//!
//! A snapshot is a gzipped tar of some paths on a worker. It is
//! created on the worker through the remote transport, pulled back,
//! stored write-once in object storage and only marked
//! [`SnapshotStatus::Verified`] after the stored object has been
//! re-checked against the archive's digest.
//!
//! Restoring is split in two, matching the failover phases:
//! [`SnapshotStore::extract_onto`] transfers and unpacks,
//! [`SnapshotStore::verify_on`] re-hashes every file on the target
//! against the manifest. Any mismatch fails the whole restore.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::SecondsFormat;
use tracing::instrument;

use crate::clock::SharedClock;
use crate::errors::EngineError;
use crate::errors::Result;
use crate::metrics::label;
use crate::metrics::EngineMetrics;
use crate::model::Compression;
use crate::model::Manifest;
use crate::model::RestoreResult;
use crate::model::SnapshotId;
use crate::model::SnapshotRecord;
use crate::model::SnapshotStatus;
use crate::model::StorageLocation;
use crate::model::Worker;
use crate::model::WorkerId;
use crate::model::WorkerState;
use crate::registry::WorkerRegistry;
use crate::retry::retry;
use crate::retry::RetryPolicy;
use crate::storage::sha256_hex;
use crate::storage::SharedObjectStore;
use crate::store::RecordStore;
use crate::transport::RemoteCommand;
use crate::transport::SharedTransport;

/// Scratch directory on workers for archives in flight.
const STAGING_DIR: &str = "/tmp/spotguard";

/// Progress of a restore between extraction and verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedRestore {
    pub snapshot_id: SnapshotId,
    pub target: WorkerId,
    /// Digest of the archive as it was fetched from storage.
    pub archive_digest: String,
}

/// Anything that can snapshot a worker by id. The scheduler only
/// needs this.
#[async_trait]
pub trait SnapshotTaker: Send + Sync + 'static {
    async fn take_snapshot(&self, worker_id: &WorkerId, paths: &[String])
        -> Result<SnapshotRecord>;
}

pub struct SnapshotStore {
    transport: SharedTransport,
    objects: SharedObjectStore,
    records: Arc<RecordStore>,
    registry: Arc<WorkerRegistry>,
    clock: SharedClock,
    bucket: String,
    retry: RetryPolicy,
    metrics: EngineMetrics,
}

impl SnapshotStore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: SharedTransport,
        objects: SharedObjectStore,
        records: Arc<RecordStore>,
        registry: Arc<WorkerRegistry>,
        clock: SharedClock,
        bucket: impl Into<String>,
        retry: RetryPolicy,
        metrics: EngineMetrics,
    ) -> Self {
        Self {
            transport,
            objects,
            records,
            registry,
            clock,
            bucket: bucket.into(),
            retry,
            metrics,
        }
    }

    /// Archive `paths` on `worker` into a new snapshot record.
    ///
    /// Every call creates a new record under a new key. On failure
    /// the record is left as [`SnapshotStatus::Failed`] with the
    /// error attached.
    #[instrument(name = "create_snapshot", skip_all, fields(worker = %worker.id))]
    pub async fn create_snapshot(&self, worker: &Worker, paths: &[String]) -> Result<SnapshotRecord> {
        if paths.is_empty() {
            return Err(EngineError::Config("no paths to snapshot".to_string()));
        }
        if let Some(relative) = paths.iter().find(|p| !p.starts_with('/')) {
            return Err(EngineError::Config(format!(
                "snapshot path {relative:?} is not absolute"
            )));
        }
        let id = SnapshotId::generate();
        let created_at = self.clock.now();
        let compression = Compression::Gzip;
        let key = format!(
            "{}/{}-{}.{}",
            worker.id,
            created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            id,
            compression.extension()
        );
        let mut record = SnapshotRecord {
            id,
            worker_id: worker.id.clone(),
            digest: String::new(),
            manifest: Manifest::default(),
            location: StorageLocation {
                bucket: self.bucket.clone(),
                key,
            },
            size_bytes: 0,
            compression,
            created_at,
            status: SnapshotStatus::Pending,
            error: None,
        };
        self.records.put_snapshot(&record)?;
        tracing::info!("Creating snapshot {} of {paths:?}", record.id);

        let res = with_timer!(
            self.metrics.snapshot_create_duration,
            label("worker_id", worker.id.0.clone()),
            self.archive_and_upload(worker, paths, &mut record).await
        );
        match res {
            Ok(()) => {
                tracing::info!(
                    "Snapshot {} verified at {} ({} files, {} bytes)",
                    record.id,
                    record.location,
                    record.manifest.len(),
                    record.size_bytes
                );
                Ok(record)
            }
            Err(err) => {
                tracing::error!("Snapshot {} of {} failed: {err}", record.id, worker.id);
                self.metrics
                    .snapshot_failures
                    .add(1, &label("kind", err.kind().as_str()));
                record.status = SnapshotStatus::Failed;
                record.error = Some(err.to_string());
                if let Err(store_err) = self.records.put_snapshot(&record) {
                    tracing::error!("Unable to record failed snapshot {}: {store_err}", record.id);
                }
                Err(err)
            }
        }
    }

    async fn archive_and_upload(
        &self,
        worker: &Worker,
        paths: &[String],
        record: &mut SnapshotRecord,
    ) -> Result<()> {
        let endpoint = &worker.endpoint;
        let archive = format!(
            "{STAGING_DIR}/{}.{}",
            record.id,
            record.compression.extension()
        );

        let mkdir = RemoteCommand::new("mkdir").args(["-p", STAGING_DIR]);
        retry(&self.retry, "mkdir staging", || self.transport.run(endpoint, &mkdir)).await?;

        let tar = RemoteCommand::new("tar")
            .args(["-czPf", archive.as_str()])
            .args(paths.iter().cloned());
        retry(&self.retry, "archive snapshot", || self.transport.run(endpoint, &tar)).await?;

        // Hash what the archive holds, not the live files, which can
        // change while tar runs.
        let members = format!("{STAGING_DIR}/{}.d", record.id);
        let manifest = self.hash_members(worker, &archive, &members).await;
        self.cleanup_dir(worker, &members).await;
        let manifest = match manifest {
            Ok(manifest) if !manifest.is_empty() => manifest,
            Ok(_) => {
                self.cleanup(worker, &archive).await;
                return Err(EngineError::NotFound(format!("no files under {paths:?}")));
            }
            Err(err) => {
                self.cleanup(worker, &archive).await;
                return Err(err);
            }
        };

        let downloaded = retry(&self.retry, "download archive", || {
            self.transport.download(endpoint, &archive)
        })
        .await;
        self.cleanup(worker, &archive).await;
        let data = downloaded?;

        record.digest = sha256_hex(&data);
        record.size_bytes = data.len() as u64;
        record.manifest = manifest;

        let location = record.location.clone();
        retry(&self.retry, "upload archive", || {
            self.objects.put(&location, data.clone())
        })
        .await?;
        record.status = SnapshotStatus::Uploaded;
        self.records.put_snapshot(record)?;

        self.recheck(record).await?;
        record.status = SnapshotStatus::Verified;
        self.records.put_snapshot(record)?;
        Ok(())
    }

    /// Compare the stored object against the archive digest, by
    /// provider checksum when there is one, otherwise by downloading
    /// and hashing.
    async fn recheck(&self, record: &SnapshotRecord) -> Result<()> {
        let location = &record.location;
        let reported = retry(&self.retry, "checksum archive", || {
            self.objects.checksum(location)
        })
        .await?;
        let stored = match reported {
            Some(sum) => sum,
            None => {
                let data =
                    retry(&self.retry, "re-download archive", || self.objects.get(location)).await?;
                sha256_hex(&data)
            }
        };
        if !stored.eq_ignore_ascii_case(&record.digest) {
            return Err(EngineError::Corruption(format!(
                "stored object {location} has digest {stored}, archive had {}",
                record.digest
            )));
        }
        Ok(())
    }

    /// Unpack `archive` under `members` on the worker and hash every
    /// file in it.
    async fn hash_members(&self, worker: &Worker, archive: &str, members: &str) -> Result<Manifest> {
        let endpoint = &worker.endpoint;
        let mkdir = RemoteCommand::new("mkdir").args(["-p", members]);
        retry(&self.retry, "mkdir members", || self.transport.run(endpoint, &mkdir)).await?;
        let untar = RemoteCommand::new("tar").args(["-xzf", archive, "-C", members]);
        retry(&self.retry, "unpack archive members", || {
            self.transport.run(endpoint, &untar)
        })
        .await?;
        let find = RemoteCommand::new("find")
            .arg(members)
            .args(["-type", "f", "-exec", "sha256sum", "{}", "+"]);
        let listed = retry(&self.retry, "hash archive members", || {
            self.transport.run(endpoint, &find)
        })
        .await?;
        Manifest::parse_sha256sum(&listed.stdout)?.strip_root(members)
    }

    async fn cleanup_dir(&self, worker: &Worker, dir: &str) {
        let rm = RemoteCommand::new("rm").args(["-rf", dir]);
        if let Err(err) = self.transport.run(&worker.endpoint, &rm).await {
            tracing::warn!("Unable to remove {dir} on {}: {err}", worker.id);
        }
    }

    async fn cleanup(&self, worker: &Worker, path: &str) {
        let rm = RemoteCommand::new("rm").args(["-f", path]);
        if let Err(err) = self.transport.run(&worker.endpoint, &rm).await {
            tracing::warn!("Unable to remove {path} on {}: {err}", worker.id);
        }
    }

    /// Fetch the archive and unpack it over `target`'s filesystem.
    /// Extraction overwrites, so repeating it is harmless.
    #[instrument(name = "extract_snapshot", skip_all, fields(snapshot = %record.id, target = %target.id))]
    pub async fn extract_onto(&self, record: &SnapshotRecord, target: &Worker) -> Result<StagedRestore> {
        if !record.is_restorable() {
            return Err(EngineError::Conflict(format!(
                "snapshot {} is {:?}, only verified snapshots can be restored",
                record.id, record.status
            )));
        }
        let endpoint = &target.endpoint;
        let location = &record.location;
        let data = retry(&self.retry, "fetch archive", || self.objects.get(location)).await?;
        let archive_digest = sha256_hex(&data);
        let archive = format!(
            "{STAGING_DIR}/{}.{}",
            record.id,
            record.compression.extension()
        );

        let mkdir = RemoteCommand::new("mkdir").args(["-p", STAGING_DIR]);
        retry(&self.retry, "mkdir staging", || self.transport.run(endpoint, &mkdir)).await?;
        retry(&self.retry, "upload archive to target", || {
            self.transport.upload(endpoint, &data, &archive)
        })
        .await?;
        let untar = RemoteCommand::new("tar").args(["-xzPf", archive.as_str()]);
        let extracted =
            retry(&self.retry, "extract archive", || self.transport.run(endpoint, &untar)).await;
        self.cleanup(target, &archive).await;
        extracted?;

        tracing::debug!("Extracted {} onto {}", record.id, target.id);
        Ok(StagedRestore {
            snapshot_id: record.id.clone(),
            target: target.id.clone(),
            archive_digest,
        })
    }

    /// Check the fetched archive and every restored file against the
    /// record. Never retried on mismatch.
    #[instrument(name = "verify_snapshot", skip_all, fields(snapshot = %record.id, target = %target.id))]
    pub async fn verify_on(
        &self,
        record: &SnapshotRecord,
        staged: &StagedRestore,
        target: &Worker,
    ) -> Result<RestoreResult> {
        if staged.snapshot_id != record.id || staged.target != target.id {
            return Err(EngineError::Conflict(format!(
                "staged restore of {} onto {} does not match {} onto {}",
                staged.snapshot_id, staged.target, record.id, target.id
            )));
        }
        if !staged.archive_digest.eq_ignore_ascii_case(&record.digest) {
            return Err(EngineError::Corruption(format!(
                "archive {} has digest {}, expected {}",
                record.location, staged.archive_digest, record.digest
            )));
        }

        let hash = RemoteCommand::new("sha256sum")
            .arg("--")
            .args(record.manifest.paths());
        let out = retry(&self.retry, "hash restored files", || {
            self.transport.exec(&target.endpoint, &hash)
        })
        .await?;
        let found = Manifest::parse_sha256sum(&out.stdout)?;
        let mismatched = record.manifest.mismatches(&found);
        if !mismatched.is_empty() {
            let shown: Vec<_> = mismatched.iter().take(5).collect();
            return Err(EngineError::Corruption(format!(
                "{} of {} restored files differ from snapshot {}: {shown:?}",
                mismatched.len(),
                record.manifest.len(),
                record.id
            )));
        }
        if !out.success() {
            return Err(out.check(&hash).err().unwrap_or_else(|| {
                EngineError::Corruption(format!("hashing restored files of {}", record.id))
            }));
        }

        Ok(RestoreResult {
            snapshot_id: record.id.clone(),
            target: target.id.clone(),
            files_verified: found.len(),
            digest: record.digest.clone(),
        })
    }

    /// Extract and verify in one go.
    pub async fn restore_snapshot(&self, record: &SnapshotRecord, target: &Worker) -> Result<RestoreResult> {
        let res = with_timer!(
            self.metrics.snapshot_restore_duration,
            label("worker_id", target.id.0.clone()),
            async {
                let staged = self.extract_onto(record, target).await?;
                self.verify_on(record, &staged, target).await
            }
            .await
        );
        if let Err(err) = &res {
            self.metrics
                .snapshot_failures
                .add(1, &label("kind", err.kind().as_str()));
        }
        res
    }

    /// Most recent verified snapshot of a worker.
    pub fn latest_snapshot(&self, worker_id: &WorkerId) -> Result<Option<SnapshotRecord>> {
        self.records.latest_verified_snapshot(worker_id)
    }

    /// All snapshots of a worker regardless of status, newest first.
    pub fn list_snapshots(&self, worker_id: &WorkerId) -> Result<Vec<SnapshotRecord>> {
        self.records.snapshots_for(worker_id)
    }
}

#[async_trait]
impl SnapshotTaker for SnapshotStore {
    async fn take_snapshot(&self, worker_id: &WorkerId, paths: &[String]) -> Result<SnapshotRecord> {
        let worker = self.registry.require(worker_id)?;
        if worker.state != WorkerState::Ready {
            return Err(EngineError::Conflict(format!(
                "worker {worker_id} is {:?}",
                worker.state
            )));
        }
        self.create_snapshot(&worker, paths).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::TestingClock;
    use crate::errors::ErrorKind;
    use crate::testing::ChecksumMode;
    use crate::testing::MemObjectStore;
    use crate::testing::SimCloud;

    struct Fixture {
        cloud: SimCloud,
        objects: MemObjectStore,
        store: SnapshotStore,
        source: Worker,
    }

    fn fixture() -> Fixture {
        let cloud = SimCloud::new();
        let objects = MemObjectStore::new();
        let registry = Arc::new(WorkerRegistry::new());
        let source = cloud.add_worker("a100");
        registry.insert(source.clone());
        cloud.write_file(&source.id, "/workspace/model.bin", b"weights v1");
        cloud.write_file(&source.id, "/workspace/cfg/run.yaml", b"lr: 0.1");
        let store = SnapshotStore::new(
            cloud.transport(),
            Arc::new(objects.clone()),
            Arc::new(RecordStore::open_in_memory().unwrap()),
            registry,
            Arc::new(TestingClock::default()),
            "snaps",
            RetryPolicy {
                attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                rate_limit_delay: Duration::from_millis(5),
                call_timeout: Duration::from_secs(5),
            },
            EngineMetrics::new(),
        );
        Fixture {
            cloud,
            objects,
            store,
            source,
        }
    }

    fn paths() -> Vec<String> {
        vec!["/workspace".to_string()]
    }

    #[tokio::test]
    async fn create_then_restore_onto_fresh_worker() {
        let f = fixture();
        let record = f.store.create_snapshot(&f.source, &paths()).await.unwrap();
        assert_eq!(record.status, SnapshotStatus::Verified);
        assert_eq!(record.manifest.len(), 2);
        assert!(record.location.key.starts_with(&format!("{}/", f.source.id)));
        assert!(record.location.key.ends_with(".tar.gz"));
        // Staging archive cleaned up.
        assert_eq!(f.cloud.files(&f.source.id).len(), 2);

        let target = f.cloud.add_worker("a100");
        let restored = f.store.restore_snapshot(&record, &target).await.unwrap();
        assert_eq!(restored.files_verified, 2);
        assert_eq!(
            f.cloud.read_file(&target.id, "/workspace/model.bin").unwrap(),
            b"weights v1"
        );
        assert_eq!(f.store.latest_snapshot(&f.source.id).unwrap(), Some(record));
    }

    #[tokio::test]
    async fn manifest_follows_archive_when_files_change_mid_snapshot() {
        let f = fixture();
        f.cloud
            .write_during_archive(&f.source.id, "/workspace/model.bin", b"weights v2");
        let record = f.store.create_snapshot(&f.source, &paths()).await.unwrap();
        assert_eq!(record.status, SnapshotStatus::Verified);
        assert_eq!(
            record.manifest.0["/workspace/model.bin"],
            sha256_hex(b"weights v2")
        );
        // Unpacked members and the archive are gone.
        assert_eq!(f.cloud.files(&f.source.id).len(), 2);

        let target = f.cloud.add_worker("a100");
        let restored = f.store.restore_snapshot(&record, &target).await.unwrap();
        assert_eq!(restored.files_verified, 2);
        assert_eq!(
            f.cloud.read_file(&target.id, "/workspace/model.bin").unwrap(),
            b"weights v2"
        );
    }

    #[tokio::test]
    async fn relative_paths_are_rejected() {
        let f = fixture();
        let err = f
            .store
            .create_snapshot(&f.source, &["workspace".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[tokio::test]
    async fn repeated_creates_make_new_records() {
        let f = fixture();
        let a = f.store.create_snapshot(&f.source, &paths()).await.unwrap();
        let b = f.store.create_snapshot(&f.source, &paths()).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_ne!(a.location, b.location);
        assert_eq!(f.objects.len(), 2);
        assert_eq!(f.store.list_snapshots(&f.source.id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn restore_is_repeatable() {
        let f = fixture();
        let record = f.store.create_snapshot(&f.source, &paths()).await.unwrap();
        let target = f.cloud.add_worker("a100");
        f.store.restore_snapshot(&record, &target).await.unwrap();
        f.store.restore_snapshot(&record, &target).await.unwrap();
    }

    #[tokio::test]
    async fn transient_transfer_errors_are_retried() {
        let f = fixture();
        f.cloud.fail_transfers(2);
        let record = f.store.create_snapshot(&f.source, &paths()).await.unwrap();
        assert_eq!(record.status, SnapshotStatus::Verified);
    }

    #[tokio::test]
    async fn corrupted_archive_fails_verification() {
        let f = fixture();
        let record = f.store.create_snapshot(&f.source, &paths()).await.unwrap();
        assert!(f.objects.corrupt(&record.location));

        let target = f.cloud.add_worker("a100");
        let staged = f.store.extract_onto(&record, &target).await.unwrap();
        let err = f.store.verify_on(&record, &staged, &target).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corruption);
    }

    #[tokio::test]
    async fn tampered_file_on_target_fails_verification() {
        let f = fixture();
        let record = f.store.create_snapshot(&f.source, &paths()).await.unwrap();
        let target = f.cloud.add_worker("a100");
        let staged = f.store.extract_onto(&record, &target).await.unwrap();
        f.cloud
            .write_file(&target.id, "/workspace/cfg/run.yaml", b"lr: 9.9");
        let err = f.store.verify_on(&record, &staged, &target).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corruption);
    }

    #[tokio::test]
    async fn failed_recheck_marks_record_failed() {
        let f = fixture();
        let good = f.store.create_snapshot(&f.source, &paths()).await.unwrap();
        f.objects.set_checksum_mode(ChecksumMode::Lie);
        let err = f
            .store
            .create_snapshot(&f.source, &paths())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corruption);

        let all = f.store.list_snapshots(&f.source.id).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].status, SnapshotStatus::Failed);
        assert_eq!(f.store.latest_snapshot(&f.source.id).unwrap(), Some(good));
    }

    #[tokio::test]
    async fn missing_provider_checksum_falls_back_to_download() {
        let f = fixture();
        f.objects.set_checksum_mode(ChecksumMode::Missing);
        let record = f.store.create_snapshot(&f.source, &paths()).await.unwrap();
        assert_eq!(record.status, SnapshotStatus::Verified);
    }

    #[tokio::test]
    async fn unverified_snapshots_never_restore() {
        let f = fixture();
        let mut record = f.store.create_snapshot(&f.source, &paths()).await.unwrap();
        record.status = SnapshotStatus::Uploaded;
        let target = f.cloud.add_worker("a100");
        let err = f.store.restore_snapshot(&record, &target).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn take_snapshot_requires_ready_worker() {
        let f = fixture();
        let err = f
            .store
            .take_snapshot(&"ghost".into(), &paths())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        f.store
            .take_snapshot(&f.source.id, &paths())
            .await
            .unwrap();
    }
}
