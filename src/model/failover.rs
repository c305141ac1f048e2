use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::EngineError;
use crate::errors::ErrorKind;
use crate::errors::Result;
use crate::model::SnapshotId;
use crate::model::WorkerId;

#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Phase of a failover episode.
///
/// Serialized names are part of the reporting contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverPhase {
    Detecting,
    AcquiringResource,
    Restoring,
    Verifying,
    Complete,
    Failed,
}

impl FailoverPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detecting => "detecting",
            Self::AcquiringResource => "acquiring_resource",
            Self::Restoring => "restoring",
            Self::Verifying => "verifying",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    /// The only phase a non-terminal phase may advance to on success.
    fn next(&self) -> Option<Self> {
        match self {
            Self::Detecting => Some(Self::AcquiringResource),
            Self::AcquiringResource => Some(Self::Restoring),
            Self::Restoring => Some(Self::Verifying),
            Self::Verifying => Some(Self::Complete),
            Self::Complete | Self::Failed => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failed,
    Aborted,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailoverTrigger {
    HeartbeatTimeout,
    Manual { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionStrategy {
    WarmPool,
    Race,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseStamp {
    pub phase: FailoverPhase,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// One failover episode.
///
/// Append-only: once [`FailoverExecution::phase`] is terminal every
/// mutator returns [`EngineError::Conflict`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverExecution {
    pub id: ExecutionId,
    pub worker_id: WorkerId,
    pub trigger: FailoverTrigger,
    pub detected_at: DateTime<Utc>,
    pub phase: FailoverPhase,
    pub phases: Vec<PhaseStamp>,
    pub new_worker_id: Option<WorkerId>,
    pub outcome: Option<Outcome>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub last_successful_phase: Option<FailoverPhase>,
    pub strategy: Option<AcquisitionStrategy>,
    pub snapshot_id: Option<SnapshotId>,
    /// `false` when no verified snapshot existed and the new worker
    /// started fresh.
    pub restored: bool,
    pub warnings: Vec<String>,
    pub log: Vec<LogEntry>,
}

impl FailoverExecution {
    pub fn new(worker_id: WorkerId, trigger: FailoverTrigger, now: DateTime<Utc>) -> Self {
        Self {
            id: ExecutionId::generate(),
            worker_id,
            trigger,
            detected_at: now,
            phase: FailoverPhase::Detecting,
            phases: vec![PhaseStamp {
                phase: FailoverPhase::Detecting,
                at: now,
            }],
            new_worker_id: None,
            outcome: None,
            error: None,
            error_kind: None,
            last_successful_phase: None,
            strategy: None,
            snapshot_id: None,
            restored: false,
            warnings: Vec::new(),
            log: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        !self.phase.is_terminal()
    }

    fn check_open(&self) -> Result<()> {
        if self.phase.is_terminal() {
            Err(EngineError::Conflict(format!(
                "failover {} already {}",
                self.id,
                self.phase.as_str()
            )))
        } else {
            Ok(())
        }
    }

    /// Commit the current phase and enter the next one.
    pub fn advance(&mut self, now: DateTime<Utc>) -> Result<FailoverPhase> {
        self.check_open()?;
        let next = self
            .phase
            .next()
            .ok_or_else(|| EngineError::Conflict(format!("no phase after {:?}", self.phase)))?;
        self.last_successful_phase = Some(self.phase);
        self.phase = next;
        self.phases.push(PhaseStamp { phase: next, at: now });
        if next == FailoverPhase::Complete {
            self.last_successful_phase = Some(next);
            self.outcome = Some(Outcome::Success);
        }
        Ok(next)
    }

    /// Terminate the episode as failed or aborted, keeping the last
    /// phase that committed.
    pub fn fail(&mut self, err: &EngineError, outcome: Outcome, now: DateTime<Utc>) -> Result<()> {
        self.check_open()?;
        self.phase = FailoverPhase::Failed;
        self.phases.push(PhaseStamp {
            phase: FailoverPhase::Failed,
            at: now,
        });
        self.outcome = Some(outcome);
        self.error = Some(err.to_string());
        self.error_kind = Some(err.kind());
        Ok(())
    }

    pub fn note(&mut self, now: DateTime<Utc>, message: impl Into<String>) {
        self.log.push(LogEntry {
            at: now,
            message: message.into(),
        });
    }

    pub fn phase_at(&self, phase: FailoverPhase) -> Option<DateTime<Utc>> {
        self.phases.iter().find(|s| s.phase == phase).map(|s| s.at)
    }

    /// Time from detection to completion; only successful episodes
    /// have one.
    pub fn mttr(&self) -> Option<chrono::Duration> {
        let done = self.phase_at(FailoverPhase::Complete)?;
        let start = self.phase_at(FailoverPhase::Detecting)?;
        Some(done - start)
    }

    /// Time from detection to the terminal phase.
    pub fn total_time(&self) -> Option<chrono::Duration> {
        if !self.phase.is_terminal() {
            return None;
        }
        let end = self.phases.last()?.at;
        Some(end - self.detected_at)
    }

    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            id: self.id.clone(),
            worker_id: self.worker_id.clone(),
            phase: self.phase,
            total_time_ms: self
                .total_time()
                .map(|d| u64::try_from(d.num_milliseconds()).unwrap_or(0)),
            success: self.outcome == Some(Outcome::Success),
            error: self.error.clone(),
        }
    }
}

/// Per-execution row of the reporting contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub id: ExecutionId,
    pub worker_id: WorkerId,
    pub phase: FailoverPhase,
    pub total_time_ms: Option<u64>,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ExecutionFilter {
    pub active: Option<bool>,
    pub outcome: Option<Outcome>,
    pub worker_id: Option<WorkerId>,
}

impl ExecutionFilter {
    pub fn active() -> Self {
        Self {
            active: Some(true),
            ..Default::default()
        }
    }

    pub fn matches(&self, exec: &FailoverExecution) -> bool {
        self.active.map_or(true, |a| exec.is_active() == a)
            && self.outcome.map_or(true, |o| exec.outcome == Some(o))
            && self
                .worker_id
                .as_ref()
                .map_or(true, |w| &exec.worker_id == w)
    }
}

/// Aggregate view over every recorded episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverReport {
    pub total: usize,
    pub active: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub aborted: usize,
    /// Successes over finished episodes, 0 when none finished.
    pub success_rate_pct: f64,
    /// Mean detection-to-complete time of successful episodes.
    pub mttr_secs: Option<f64>,
}

impl FailoverReport {
    pub fn from_executions<'a>(execs: impl IntoIterator<Item = &'a FailoverExecution>) -> Self {
        let mut report = Self {
            total: 0,
            active: 0,
            succeeded: 0,
            failed: 0,
            aborted: 0,
            success_rate_pct: 0.0,
            mttr_secs: None,
        };
        let mut mttr_sum = 0.0;
        for exec in execs {
            report.total += 1;
            match exec.outcome {
                None => report.active += 1,
                Some(Outcome::Success) => {
                    report.succeeded += 1;
                    if let Some(mttr) = exec.mttr() {
                        mttr_sum += mttr.num_milliseconds() as f64 / 1000.0;
                    }
                }
                Some(Outcome::Failed) => report.failed += 1,
                Some(Outcome::Aborted) => report.aborted += 1,
            }
        }
        let finished = report.succeeded + report.failed + report.aborted;
        if finished > 0 {
            report.success_rate_pct = report.succeeded as f64 * 100.0 / finished as f64;
        }
        if report.succeeded > 0 {
            report.mttr_secs = Some(mttr_sum / report.succeeded as f64);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use chrono::TimeZone;
    use serde_test::assert_tokens;
    use serde_test::Token;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn finished(secs: i64) -> FailoverExecution {
        let mut exec = FailoverExecution::new("w1".into(), FailoverTrigger::HeartbeatTimeout, t0());
        for i in 1..=4 {
            exec.advance(t0() + Duration::seconds(secs * i / 4)).unwrap();
        }
        exec
    }

    #[test]
    fn phase_wire_names() {
        assert_tokens(
            &FailoverPhase::AcquiringResource,
            &[Token::UnitVariant {
                name: "FailoverPhase",
                variant: "acquiring_resource",
            }],
        );
        assert_tokens(
            &FailoverPhase::Complete,
            &[Token::UnitVariant {
                name: "FailoverPhase",
                variant: "complete",
            }],
        );
    }

    #[test]
    fn advance_walks_happy_path_and_stamps_mttr() {
        let exec = finished(40);
        assert_eq!(exec.phase, FailoverPhase::Complete);
        assert_eq!(exec.outcome, Some(Outcome::Success));
        assert_eq!(exec.phases.len(), 5);
        assert_eq!(exec.mttr(), Some(Duration::seconds(40)));
        assert_eq!(exec.summary().total_time_ms, Some(40_000));
        assert!(exec.summary().success);
    }

    #[test]
    fn terminal_executions_are_frozen() {
        let mut exec = finished(10);
        let err = exec.advance(t0()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        let err = exec
            .fail(&EngineError::Cancelled("x".into()), Outcome::Aborted, t0())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(exec.outcome, Some(Outcome::Success));
    }

    #[test]
    fn fail_keeps_last_committed_phase() {
        let mut exec = FailoverExecution::new("w1".into(), FailoverTrigger::HeartbeatTimeout, t0());
        exec.advance(t0()).unwrap();
        exec.advance(t0()).unwrap();
        exec.fail(
            &EngineError::Corruption("bad".into()),
            Outcome::Failed,
            t0() + Duration::seconds(3),
        )
        .unwrap();
        assert_eq!(exec.last_successful_phase, Some(FailoverPhase::AcquiringResource));
        assert_eq!(exec.error_kind, Some(ErrorKind::Corruption));
        assert_eq!(exec.mttr(), None);
        let summary = exec.summary();
        assert_eq!(summary.phase, FailoverPhase::Failed);
        assert!(!summary.success);
        assert_eq!(summary.total_time_ms, Some(3_000));
    }

    #[test]
    fn report_aggregates_outcomes() {
        let mut failed = FailoverExecution::new("w2".into(), FailoverTrigger::HeartbeatTimeout, t0());
        failed
            .fail(&EngineError::PoolEmpty("a100".into()), Outcome::Failed, t0())
            .unwrap();
        let active = FailoverExecution::new("w3".into(), FailoverTrigger::HeartbeatTimeout, t0());
        let execs = vec![finished(20), finished(40), failed, active];

        let report = FailoverReport::from_executions(&execs);
        assert_eq!(report.total, 4);
        assert_eq!(report.active, 1);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert!((report.success_rate_pct - 66.666).abs() < 0.01);
        assert_eq!(report.mttr_secs, Some(30.0));

        let only_active: Vec<_> = execs
            .iter()
            .filter(|e| ExecutionFilter::active().matches(e))
            .collect();
        assert_eq!(only_active.len(), 1);
        assert_eq!(only_active[0].worker_id, WorkerId::from("w3"));
    }
}
