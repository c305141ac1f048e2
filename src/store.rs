//! Durable record of snapshots, schedules, failovers, standby
//! associations and leaks.
//!
//! Each row keeps its full record as JSON in `body` plus the columns
//! needed to query it. Two rules are enforced by the upserts
//! themselves so callers can't break them:
//!
//! - A `verified` snapshot row is never updated again.
//!
//! - A failover row that reached a terminal phase is frozen.

use std::path::Path;
use std::sync::Mutex;

use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::Utc;
use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite_migration::Migrations;
use rusqlite_migration::M;
use serde::de::DeserializeOwned;

use crate::common::lock;
use crate::errors::Context;
use crate::errors::EngineError;
use crate::errors::Result;
use crate::leaks::ResourceLeak;
use crate::model::FailoverExecution;
use crate::model::SnapshotId;
use crate::model::SnapshotRecord;
use crate::model::SnapshotScheduleConfig;
use crate::model::StandbyAssociation;
use crate::model::WorkerId;

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            "CREATE TABLE snapshots ( \
             id TEXT NOT NULL PRIMARY KEY, \
             worker_id TEXT NOT NULL, \
             status TEXT NOT NULL, \
             created_at TEXT NOT NULL, \
             body TEXT NOT NULL \
             ) STRICT",
        ),
        M::up("CREATE INDEX snapshots_by_worker ON snapshots (worker_id, status, created_at)"),
        M::up(
            "CREATE TABLE snapshot_schedules ( \
             worker_id TEXT NOT NULL PRIMARY KEY, \
             body TEXT NOT NULL \
             ) STRICT",
        ),
        M::up(
            "CREATE TABLE failovers ( \
             id TEXT NOT NULL PRIMARY KEY, \
             worker_id TEXT NOT NULL, \
             terminal INTEGER NOT NULL CHECK (terminal IN (0, 1)), \
             detected_at TEXT NOT NULL, \
             body TEXT NOT NULL \
             ) STRICT",
        ),
        M::up(
            "CREATE TABLE standby_associations ( \
             primary_id TEXT NOT NULL PRIMARY KEY, \
             body TEXT NOT NULL \
             ) STRICT",
        ),
        M::up(
            "CREATE TABLE leaks ( \
             worker_id TEXT NOT NULL PRIMARY KEY, \
             recorded_at TEXT NOT NULL, \
             body TEXT NOT NULL \
             ) STRICT",
        ),
    ])
}

#[test]
fn migrations_valid() {
    assert!(migrations().validate().is_ok());
}

/// Fixed width so text order is time order.
fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode<T: DeserializeOwned>(body: String) -> Result<T> {
    Ok(serde_json::from_str(&body)?)
}

pub struct RecordStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore").finish_non_exhaustive()
    }
}

impl RecordStore {
    pub fn open(file: &Path) -> Result<Self> {
        tracing::info!("Opening record store at {file:?}");
        let conn = Connection::open_with_flags(
            file,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(EngineError::from)
        .reraise("can't open record store")?;
        Self::setup(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::setup(conn)
    }

    /// Setup our connection-level pragmas and bring the schema up to
    /// date.
    fn setup(mut conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", "5000")?;
        migrations()
            .to_latest(&mut conn)
            .map_err(EngineError::from)
            .reraise("can't migrate record store")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn put_snapshot(&self, record: &SnapshotRecord) -> Result<()> {
        let body = serde_json::to_string(record)?;
        let conn = lock(&self.conn);
        conn.execute(
            "INSERT INTO snapshots (id, worker_id, status, created_at, body) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT (id) DO UPDATE \
             SET status = excluded.status, body = excluded.body \
             WHERE snapshots.status != 'verified'",
            (
                &record.id.0,
                &record.worker_id.0,
                record.status.as_str(),
                ts(&record.created_at),
                body,
            ),
        )?;
        tracing::trace!("Wrote snapshot {} as {:?}", record.id, record.status);
        Ok(())
    }

    pub fn snapshot(&self, id: &SnapshotId) -> Result<Option<SnapshotRecord>> {
        let conn = lock(&self.conn);
        let body = conn
            .query_row("SELECT body FROM snapshots WHERE id = ?1", (&id.0,), |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        body.map(decode).transpose()
    }

    /// Newest first.
    pub fn snapshots_for(&self, worker_id: &WorkerId) -> Result<Vec<SnapshotRecord>> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT body FROM snapshots WHERE worker_id = ?1 \
             ORDER BY created_at DESC, rowid DESC",
        )?;
        let bodies = stmt
            .query_map((&worker_id.0,), |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        bodies.into_iter().map(decode).collect()
    }

    pub fn latest_verified_snapshot(&self, worker_id: &WorkerId) -> Result<Option<SnapshotRecord>> {
        let conn = lock(&self.conn);
        let body = conn
            .query_row(
                "SELECT body FROM snapshots \
                 WHERE worker_id = ?1 AND status = 'verified' \
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                (&worker_id.0,),
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        body.map(decode).transpose()
    }

    pub fn put_schedule(&self, schedule: &SnapshotScheduleConfig) -> Result<()> {
        let body = serde_json::to_string(schedule)?;
        lock(&self.conn).execute(
            "INSERT INTO snapshot_schedules (worker_id, body) VALUES (?1, ?2) \
             ON CONFLICT (worker_id) DO UPDATE SET body = excluded.body",
            (&schedule.worker_id.0, body),
        )?;
        Ok(())
    }

    pub fn delete_schedule(&self, worker_id: &WorkerId) -> Result<()> {
        lock(&self.conn).execute(
            "DELETE FROM snapshot_schedules WHERE worker_id = ?1",
            (&worker_id.0,),
        )?;
        Ok(())
    }

    pub fn schedules(&self) -> Result<Vec<SnapshotScheduleConfig>> {
        self.load_bodies("SELECT body FROM snapshot_schedules ORDER BY worker_id")
    }

    /// Returns `false` if the stored row is already terminal and was
    /// left untouched.
    pub fn put_failover(&self, exec: &FailoverExecution) -> Result<bool> {
        let body = serde_json::to_string(exec)?;
        let changed = lock(&self.conn).execute(
            "INSERT INTO failovers (id, worker_id, terminal, detected_at, body) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT (id) DO UPDATE \
             SET terminal = excluded.terminal, body = excluded.body \
             WHERE failovers.terminal = 0",
            (
                &exec.id.0,
                &exec.worker_id.0,
                i64::from(exec.phase.is_terminal()),
                ts(&exec.detected_at),
                body,
            ),
        )?;
        Ok(changed > 0)
    }

    /// Oldest first.
    pub fn failovers(&self) -> Result<Vec<FailoverExecution>> {
        self.load_bodies("SELECT body FROM failovers ORDER BY detected_at, rowid")
    }

    pub fn put_association(&self, assoc: &StandbyAssociation) -> Result<()> {
        let body = serde_json::to_string(assoc)?;
        lock(&self.conn).execute(
            "INSERT INTO standby_associations (primary_id, body) VALUES (?1, ?2) \
             ON CONFLICT (primary_id) DO UPDATE SET body = excluded.body",
            (&assoc.primary_id.0, body),
        )?;
        Ok(())
    }

    pub fn delete_association(&self, primary_id: &WorkerId) -> Result<()> {
        lock(&self.conn).execute(
            "DELETE FROM standby_associations WHERE primary_id = ?1",
            (&primary_id.0,),
        )?;
        Ok(())
    }

    pub fn associations(&self) -> Result<Vec<StandbyAssociation>> {
        self.load_bodies("SELECT body FROM standby_associations ORDER BY primary_id")
    }

    pub fn put_leak(&self, leak: &ResourceLeak) -> Result<()> {
        let body = serde_json::to_string(leak)?;
        lock(&self.conn).execute(
            "INSERT INTO leaks (worker_id, recorded_at, body) VALUES (?1, ?2, ?3) \
             ON CONFLICT (worker_id) DO UPDATE \
             SET recorded_at = excluded.recorded_at, body = excluded.body",
            (&leak.worker_id.0, ts(&leak.recorded_at), body),
        )?;
        Ok(())
    }

    pub fn delete_leak(&self, worker_id: &WorkerId) -> Result<()> {
        lock(&self.conn).execute("DELETE FROM leaks WHERE worker_id = ?1", (&worker_id.0,))?;
        Ok(())
    }

    pub fn leaks(&self) -> Result<Vec<ResourceLeak>> {
        self.load_bodies("SELECT body FROM leaks ORDER BY recorded_at, worker_id")
    }

    fn load_bodies<T: DeserializeOwned>(&self, sql: &str) -> Result<Vec<T>> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(sql)?;
        let bodies = stmt
            .query_map((), |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        bodies.into_iter().map(decode).collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use chrono::TimeZone;

    use super::*;
    use crate::model::Compression;
    use crate::model::FailoverTrigger;
    use crate::model::Manifest;
    use crate::model::Outcome;
    use crate::model::SnapshotStatus;
    use crate::model::StorageLocation;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn snap(id: &str, at: i64, status: SnapshotStatus) -> SnapshotRecord {
        SnapshotRecord {
            id: SnapshotId(id.into()),
            worker_id: "w1".into(),
            digest: "d".into(),
            manifest: Manifest::default(),
            location: StorageLocation {
                bucket: "b".into(),
                key: format!("w1/{id}"),
            },
            size_bytes: 1,
            compression: Compression::Gzip,
            created_at: t(at),
            status,
            error: None,
        }
    }

    #[test]
    fn latest_verified_skips_failed() {
        let store = RecordStore::open_in_memory().unwrap();
        store
            .put_snapshot(&snap("s1", 0, SnapshotStatus::Verified))
            .unwrap();
        store
            .put_snapshot(&snap("s2", 10, SnapshotStatus::Failed))
            .unwrap();
        store
            .put_snapshot(&snap("s3", 20, SnapshotStatus::Pending))
            .unwrap();

        let latest = store.latest_verified_snapshot(&"w1".into()).unwrap().unwrap();
        assert_eq!(latest.id, SnapshotId("s1".into()));
        let all: Vec<_> = store
            .snapshots_for(&"w1".into())
            .unwrap()
            .into_iter()
            .map(|s| s.id.0)
            .collect();
        assert_eq!(all, vec!["s3", "s2", "s1"]);
    }

    #[test]
    fn verified_snapshots_are_immutable() {
        let store = RecordStore::open_in_memory().unwrap();
        store
            .put_snapshot(&snap("s1", 0, SnapshotStatus::Verified))
            .unwrap();
        store
            .put_snapshot(&snap("s1", 0, SnapshotStatus::Failed))
            .unwrap();
        let found = store.snapshot(&SnapshotId("s1".into())).unwrap().unwrap();
        assert_eq!(found.status, SnapshotStatus::Verified);
    }

    #[test]
    fn terminal_failovers_are_frozen() {
        let store = RecordStore::open_in_memory().unwrap();
        let mut exec = FailoverExecution::new("w1".into(), FailoverTrigger::HeartbeatTimeout, t(0));
        assert!(store.put_failover(&exec).unwrap());
        exec.fail(&EngineError::PoolEmpty("a100".into()), Outcome::Failed, t(5))
            .unwrap();
        assert!(store.put_failover(&exec).unwrap());

        let mut tampered = exec.clone();
        tampered.error = Some("rewritten".into());
        assert!(!store.put_failover(&tampered).unwrap());
        assert_eq!(store.failovers().unwrap(), vec![exec]);
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.sqlite3");
        {
            let store = RecordStore::open(&path).unwrap();
            store
                .put_snapshot(&snap("s1", 0, SnapshotStatus::Verified))
                .unwrap();
        }
        let store = RecordStore::open(&path).unwrap();
        assert!(store.latest_verified_snapshot(&"w1".into()).unwrap().is_some());
    }
}
