//! Result accumulators: per-phase and whole-run.
//!
//! These are the only artifacts the pipeline produces. A `PhaseResult` is
//! built by its owning engine and never mutated once appended to a
//! `WorkflowResult`; the `WorkflowResult` is handed to the report sink as-is.

use serde::{Deserialize, Serialize};

use crate::{now_ms, Instance, ReconciliationOutcome, SnapshotRecord, SnapshotStatus};

/// One of the three sequential pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Discovery,
    Snapshot,
    Reconciliation,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Discovery => "discovery",
            Phase::Snapshot => "snapshot",
            Phase::Reconciliation => "reconciliation",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate status of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Success,
    Partial,
    Failed,
    /// Phase disabled by configuration; no work was attempted.
    Skipped,
}

/// Per-instance outcome, polymorphic over the three phase payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseOutcome {
    Discovered(Instance),
    Snapshotted(SnapshotRecord),
    Reconciled(ReconciliationOutcome),
}

impl PhaseOutcome {
    pub fn instance_id(&self) -> &str {
        match self {
            PhaseOutcome::Discovered(instance) => &instance.id,
            PhaseOutcome::Snapshotted(record) => &record.instance_id,
            PhaseOutcome::Reconciled(outcome) => &outcome.instance_id,
        }
    }
}

/// Result of one phase: every input instance's fate plus phase-level errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: Phase,
    pub status: PhaseStatus,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
    pub outcomes: Vec<PhaseOutcome>,
    /// Zone-level and synthesized errors that are not tied to a single
    /// instance outcome.
    pub errors: Vec<String>,
}

impl PhaseResult {
    pub(crate) fn begin(phase: Phase) -> Self {
        Self {
            phase,
            status: PhaseStatus::Failed,
            started_at_ms: now_ms(),
            finished_at_ms: 0,
            outcomes: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Result for a phase disabled by configuration.
    pub fn skipped(phase: Phase) -> Self {
        let now = now_ms();
        Self {
            phase,
            status: PhaseStatus::Skipped,
            started_at_ms: now,
            finished_at_ms: now,
            outcomes: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub(crate) fn finish(&mut self, status: PhaseStatus) {
        self.status = status;
        self.finished_at_ms = now_ms();
    }

    pub fn duration_ms(&self) -> u64 {
        self.finished_at_ms.saturating_sub(self.started_at_ms)
    }

    /// Instances carried by discovery outcomes.
    pub fn discovered_instances(&self) -> Vec<Instance> {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                PhaseOutcome::Discovered(instance) => Some(instance.clone()),
                _ => None,
            })
            .collect()
    }

    /// Snapshot records carried by snapshot outcomes.
    pub fn snapshot_records(&self) -> Vec<&SnapshotRecord> {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                PhaseOutcome::Snapshotted(record) => Some(record),
                _ => None,
            })
            .collect()
    }

    /// Reconciliation outcomes carried by this result.
    pub fn reconciliations(&self) -> Vec<&ReconciliationOutcome> {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                PhaseOutcome::Reconciled(outcome) => Some(outcome),
                _ => None,
            })
            .collect()
    }

    /// Instance ids that hard-failed their snapshot, plus timed-out ones
    /// when `proceed_on_timeout` is false.
    pub(crate) fn snapshot_casualties(&self, proceed_on_timeout: bool) -> Vec<String> {
        self.snapshot_records()
            .into_iter()
            .filter(|r| match r.status {
                SnapshotStatus::Failed => true,
                SnapshotStatus::TimedOut => !proceed_on_timeout,
                _ => false,
            })
            .map(|r| r.instance_id.clone())
            .collect()
    }
}

/// Orchestrator run state; `Aborted` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Scanning,
    Snapshotting,
    Reconciling,
    Completed,
    Aborted,
}

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Success,
    Partial,
    Failed,
}

/// The whole-run artifact: ordered phase results plus overall status.
///
/// Immutable once the run ends; the orchestrator builds it incrementally
/// and it is the sole object handed to the report sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub phases: Vec<PhaseResult>,
    pub status: WorkflowStatus,
    pub run_state: RunState,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
    pub duration_ms: u64,
}

impl WorkflowResult {
    pub(crate) fn finalize(
        phases: Vec<PhaseResult>,
        run_state: RunState,
        started_at_ms: u64,
    ) -> Self {
        let status = Self::overall_status(&phases, run_state);
        let finished_at_ms = now_ms();
        Self {
            phases,
            status,
            run_state,
            started_at_ms,
            finished_at_ms,
            duration_ms: finished_at_ms.saturating_sub(started_at_ms),
        }
    }

    /// Overall status rules:
    /// - `Failed` when discovery failed outright, or the run aborted on a
    ///   failed phase with nothing more than clean results before it;
    /// - `Partial` when any phase was partial, or the run aborted after a
    ///   partially-successful earlier phase;
    /// - `Success` only when every phase succeeded (config-skipped phases
    ///   are neutral).
    fn overall_status(phases: &[PhaseResult], run_state: RunState) -> WorkflowStatus {
        let discovery_failed = phases
            .iter()
            .any(|p| p.phase == Phase::Discovery && p.status == PhaseStatus::Failed);
        if discovery_failed {
            return WorkflowStatus::Failed;
        }

        let any_partial = phases.iter().any(|p| p.status == PhaseStatus::Partial);
        if run_state == RunState::Aborted {
            return if any_partial {
                WorkflowStatus::Partial
            } else {
                WorkflowStatus::Failed
            };
        }

        let any_failed = phases.iter().any(|p| p.status == PhaseStatus::Failed);
        if any_partial || any_failed {
            WorkflowStatus::Partial
        } else {
            WorkflowStatus::Success
        }
    }

    pub fn phase(&self, phase: Phase) -> Option<&PhaseResult> {
        self.phases.iter().find(|p| p.phase == phase)
    }
}
