//! Pre-patch preparation of a virtual-machine fleet spread across isolated
//! account/region partitions ("landing zones").
//!
//! The crate drives a three-phase pipeline — Discovery, Snapshot,
//! State-Reconciliation — against a remote control plane reached through the
//! gateway traits in [`gateways`]. Each phase executes per-instance work on a
//! bounded worker pool and captures every instance's fate into an auditable
//! result set; the [`workflow::WorkflowOrchestrator`] sequences the phases
//! and applies the continue-or-abort policy between them.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub mod config;
pub mod gateways;
pub mod report;
pub mod workflow;

pub use config::{
    ConfigError, InstanceFilters, ReconcileConfig, ScannerConfig, SnapshotConfig, WorkflowConfig,
};
pub use workflow::results::{
    Phase, PhaseOutcome, PhaseResult, PhaseStatus, RunState, WorkflowResult, WorkflowStatus,
};
pub use workflow::WorkflowOrchestrator;

/// Milliseconds since the Unix epoch; the crate-wide timestamp representation.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// An isolated account/region partition owning a subset of the fleet.
///
/// Loaded from configuration and immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LandingZone {
    pub id: String,
    pub account_id: String,
    pub region: String,
    /// Role assumed by the access provider to obtain a scoped session.
    pub access_role: String,
    /// Disabled zones are skipped by discovery without being treated as errors.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl LandingZone {
    pub fn new(
        id: impl Into<String>,
        account_id: impl Into<String>,
        region: impl Into<String>,
        access_role: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            account_id: account_id.into(),
            region: region.into(),
            access_role: access_role.into(),
            enabled: true,
        }
    }
}

/// Instance operating platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Windows,
    Other(String),
}

impl Platform {
    /// Fold a control-plane platform string into the supported set.
    pub fn from_raw(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "" | "linux" => Platform::Linux,
            "windows" => Platform::Windows,
            other => Platform::Other(other.to_string()),
        }
    }
}

/// Observed instance lifecycle state.
///
/// The control plane's wider vocabulary (`shutting-down`, `terminating`, …)
/// is folded into this set by [`InstanceState::from_raw`]; anything
/// unrecognized maps to `Unknown` rather than failing the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Running,
    Stopped,
    Stopping,
    Terminated,
    Unknown,
}

impl InstanceState {
    pub fn from_raw(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "pending" | "starting" => InstanceState::Pending,
            "running" => InstanceState::Running,
            "stopped" => InstanceState::Stopped,
            "stopping" | "shutting-down" => InstanceState::Stopping,
            "terminated" | "terminating" => InstanceState::Terminated,
            _ => InstanceState::Unknown,
        }
    }

    /// Whether an instance in this state needs a rollback snapshot before
    /// patching: running and stopped instances do, terminal or indeterminate
    /// states do not.
    pub fn requires_backup(self) -> bool {
        matches!(self, InstanceState::Running | InstanceState::Stopped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::Stopped => "stopped",
            InstanceState::Stopping => "stopping",
            InstanceState::Terminated => "terminated",
            InstanceState::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Management-agent connectivity as observed through the agent gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Offline,
    Unknown,
}

/// A managed virtual-machine instance, normalized from the control plane's
/// raw description during discovery.
///
/// Created by the Scanner; only the StateReconciler updates `state` after
/// that. Instances are never dropped within a run — at worst their outcome
/// records a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    /// Id of the owning landing zone; every instance belongs to exactly one.
    pub landing_zone: String,
    /// Display name from the `Name` tag, falling back to the instance id.
    pub name: String,
    pub platform: Platform,
    pub state: InstanceState,
    pub agent: AgentStatus,
    /// Derived from `state` at discovery time, see
    /// [`InstanceState::requires_backup`].
    pub requires_backup: bool,
    pub tags: BTreeMap<String, String>,
}

/// Terminal-capable status of a snapshot operation.
///
/// `TimedOut` is deliberately distinct from `Failed`: a timed-out creation
/// was abandoned by this run but may still complete remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Pending,
    Creating,
    Available,
    Failed,
    TimedOut,
}

impl SnapshotStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SnapshotStatus::Available | SnapshotStatus::Failed | SnapshotStatus::TimedOut
        )
    }
}

/// Per-instance record of one snapshot attempt. One per instance per run.
///
/// Status transitions are monotone: once a record reaches a terminal status
/// the transition methods become no-ops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub instance_id: String,
    /// Assigned once the create call is accepted by the control plane.
    pub image_id: Option<String>,
    pub image_name: String,
    pub status: SnapshotStatus,
    pub started_at_ms: u64,
    pub completed_at_ms: Option<u64>,
    /// Transient-error retries consumed by the create call.
    pub retry_count: u32,
    pub error: Option<String>,
}

impl SnapshotRecord {
    pub fn new(instance_id: impl Into<String>) -> Self {
        let instance_id = instance_id.into();
        let started_at_ms = now_ms();
        Self {
            image_name: format!("backup-{instance_id}-{started_at_ms}"),
            instance_id,
            image_id: None,
            status: SnapshotStatus::Pending,
            started_at_ms,
            completed_at_ms: None,
            retry_count: 0,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn begin_creating(&mut self) {
        if !self.is_terminal() {
            self.status = SnapshotStatus::Creating;
        }
    }

    pub fn complete(&mut self) {
        if !self.is_terminal() {
            self.status = SnapshotStatus::Available;
            self.completed_at_ms = Some(now_ms());
        }
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        if !self.is_terminal() {
            self.status = SnapshotStatus::Failed;
            self.error = Some(error.into());
            self.completed_at_ms = Some(now_ms());
        }
    }

    pub fn time_out(&mut self, error: impl Into<String>) {
        if !self.is_terminal() {
            self.status = SnapshotStatus::TimedOut;
            self.error = Some(error.into());
            self.completed_at_ms = Some(now_ms());
        }
    }
}

/// State transition requested for an instance during reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestedTransition {
    /// A start was issued for a stopped instance.
    Start,
    /// The instance was already in the target state; nothing was requested.
    None,
}

/// How a reconciliation attempt concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileDisposition {
    /// Running with the agent reachable — patch-ready.
    Ready,
    /// The start was issued but the instance never reported running in time.
    StartTimedOut,
    /// The instance runs but its agent never answered; not patch-ready.
    AgentUnreachable,
    /// Observed in a state the phase does not act on; excluded from success
    /// accounting.
    SkippedUnexpectedState,
    Failed,
}

/// Per-instance result of the reconciliation phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationOutcome {
    pub instance_id: String,
    pub requested: RequestedTransition,
    pub resulting_state: InstanceState,
    pub disposition: ReconcileDisposition,
    pub success: bool,
    pub error: Option<String>,
}

impl ReconciliationOutcome {
    pub fn ready(instance_id: impl Into<String>, requested: RequestedTransition) -> Self {
        Self {
            instance_id: instance_id.into(),
            requested,
            resulting_state: InstanceState::Running,
            disposition: ReconcileDisposition::Ready,
            success: true,
            error: None,
        }
    }

    pub fn start_timed_out(instance_id: impl Into<String>, resulting_state: InstanceState) -> Self {
        Self {
            instance_id: instance_id.into(),
            requested: RequestedTransition::Start,
            resulting_state,
            disposition: ReconcileDisposition::StartTimedOut,
            success: false,
            error: Some("start timed out".to_string()),
        }
    }

    pub fn agent_unreachable(
        instance_id: impl Into<String>,
        requested: RequestedTransition,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            requested,
            resulting_state: InstanceState::Running,
            disposition: ReconcileDisposition::AgentUnreachable,
            success: false,
            error: Some("agent unreachable".to_string()),
        }
    }

    pub fn skipped_unexpected_state(
        instance_id: impl Into<String>,
        observed: InstanceState,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            requested: RequestedTransition::None,
            resulting_state: observed,
            disposition: ReconcileDisposition::SkippedUnexpectedState,
            success: false,
            error: Some(format!("skipped: unexpected state {observed}")),
        }
    }

    pub fn failed(
        instance_id: impl Into<String>,
        requested: RequestedTransition,
        resulting_state: InstanceState,
        error: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            requested,
            resulting_state,
            disposition: ReconcileDisposition::Failed,
            success: false,
            error: Some(error.into()),
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.disposition == ReconcileDisposition::SkippedUnexpectedState
    }
}

/// Backoff applied between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffStrategy {
    None,
    Fixed {
        delay: Duration,
    },
    Linear {
        base: Duration,
        max: Duration,
    },
    Exponential {
        base: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl BackoffStrategy {
    /// Delay to sleep after `attempt` (1-based) has failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match *self {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed { delay } => delay,
            BackoffStrategy::Linear { base, max } => {
                base.checked_mul(attempt).map(|d| d.min(max)).unwrap_or(max)
            }
            BackoffStrategy::Exponential { base, multiplier, max } => {
                let factor = multiplier.powi(attempt.saturating_sub(1) as i32);
                let millis = (base.as_millis() as f64 * factor).min(max.as_millis() as f64);
                Duration::from_millis(millis as u64).min(max)
            }
        }
    }
}

/// Retry policy for transient gateway errors.
///
/// `max_attempts` counts total attempts including the first; permanent
/// errors are never retried regardless of attempts remaining.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    /// Optional ceiling on the total time spent across attempts and backoff.
    pub timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential {
                base: Duration::from_millis(100),
                multiplier: 2.0,
                max: Duration::from_secs(30),
            },
            timeout: None,
        }
    }
}

impl RetryPolicy {
    /// Policy with `max_attempts` total attempts and the default backoff.
    ///
    /// Panics if `max_attempts` is zero.
    pub fn new(max_attempts: u32) -> Self {
        assert!(max_attempts >= 1, "max_attempts must be at least 1");
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }
}
