//! Validated run parameters.
//!
//! Configuration is deserialized by an external loader; this module only
//! defines the typed shape (unknown fields are rejected at load time) and
//! the pre-flight validation the orchestrator runs before touching the
//! control plane.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::LandingZone;

/// Criteria applied when enumerating instances in a landing zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct InstanceFilters {
    /// Every listed tag must be present with the given value.
    pub tag_filters: BTreeMap<String, String>,
    /// When false, stopped and stopping instances are excluded from
    /// discovery entirely.
    pub include_stopped: bool,
}

impl Default for InstanceFilters {
    fn default() -> Self {
        Self::include_all()
    }
}

impl InstanceFilters {
    pub fn include_all() -> Self {
        Self {
            tag_filters: BTreeMap::new(),
            include_stopped: true,
        }
    }
}

/// Discovery-phase parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ScannerConfig {
    pub enabled: bool,
    /// Per-instance budget for agent enrichment and per-zone listing calls.
    pub timeout_ms: u64,
    /// Hard ceiling on concurrently scanned landing zones.
    pub max_concurrent: usize,
    /// Additional attempts after the first for transient listing errors.
    pub retry_attempts: u32,
    pub filters: InstanceFilters,
    /// Optional deadline for the whole phase; outstanding zones are
    /// abandoned and reported as errors when it elapses.
    pub phase_timeout_ms: Option<u64>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 30_000,
            max_concurrent: 5,
            retry_attempts: 2,
            filters: InstanceFilters::include_all(),
            phase_timeout_ms: None,
        }
    }
}

impl ScannerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn phase_timeout(&self) -> Option<Duration> {
        self.phase_timeout_ms.map(Duration::from_millis)
    }
}

/// Snapshot-phase parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SnapshotConfig {
    pub enabled: bool,
    /// Per-instance budget covering the create call and status polling.
    pub timeout_ms: u64,
    pub max_concurrent: usize,
    /// Additional attempts after the first for transient create errors.
    pub retry_attempts: u32,
    /// Interval between image status polls.
    pub poll_interval_ms: u64,
    /// Retention hint stamped onto created images.
    pub retention_days: u32,
    /// Whether instances whose snapshot timed out (as opposed to failed)
    /// still proceed into the reconciliation phase.
    pub proceed_on_timeout: bool,
    pub phase_timeout_ms: Option<u64>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 3_600_000,
            max_concurrent: 10,
            retry_attempts: 2,
            poll_interval_ms: 30_000,
            retention_days: 30,
            proceed_on_timeout: true,
            phase_timeout_ms: None,
        }
    }
}

impl SnapshotConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn phase_timeout(&self) -> Option<Duration> {
        self.phase_timeout_ms.map(Duration::from_millis)
    }
}

/// Reconciliation-phase parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ReconcileConfig {
    pub enabled: bool,
    /// Per-instance budget covering start, state polling, and the agent
    /// reachability check.
    pub timeout_ms: u64,
    pub max_concurrent: usize,
    /// Additional attempts after the first for transient start errors.
    pub retry_attempts: u32,
    /// Interval between instance-state and agent polls.
    pub poll_interval_ms: u64,
    pub phase_timeout_ms: Option<u64>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 300_000,
            max_concurrent: 10,
            retry_attempts: 2,
            poll_interval_ms: 15_000,
            phase_timeout_ms: None,
        }
    }
}

impl ReconcileConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn phase_timeout(&self) -> Option<Duration> {
        self.phase_timeout_ms.map(Duration::from_millis)
    }
}

/// Complete run configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowConfig {
    pub landing_zones: Vec<LandingZone>,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    /// When false, a phase whose aggregate status is failed aborts the
    /// remaining pipeline.
    #[serde(default)]
    pub continue_on_error: bool,
}

impl WorkflowConfig {
    /// Configuration with defaults for everything except the zone list.
    pub fn for_zones(landing_zones: Vec<LandingZone>) -> Self {
        Self {
            landing_zones,
            scanner: ScannerConfig::default(),
            snapshot: SnapshotConfig::default(),
            reconcile: ReconcileConfig::default(),
            continue_on_error: false,
        }
    }

    /// Pre-flight consistency check. Failure is fatal: the orchestrator
    /// returns before any remote call is made.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.landing_zones.is_empty() {
            problems.push("landing_zones must not be empty".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for zone in &self.landing_zones {
            if zone.id.is_empty() {
                problems.push("landing zone with empty id".to_string());
            }
            if !seen.insert(zone.id.as_str()) {
                problems.push(format!("duplicate landing zone id: {}", zone.id));
            }
        }

        if self.scanner.enabled {
            check_positive(&mut problems, "scanner.timeout_ms", self.scanner.timeout_ms);
            check_positive(
                &mut problems,
                "scanner.max_concurrent",
                self.scanner.max_concurrent as u64,
            );
        }
        if self.snapshot.enabled {
            check_positive(&mut problems, "snapshot.timeout_ms", self.snapshot.timeout_ms);
            check_positive(
                &mut problems,
                "snapshot.max_concurrent",
                self.snapshot.max_concurrent as u64,
            );
            check_positive(
                &mut problems,
                "snapshot.poll_interval_ms",
                self.snapshot.poll_interval_ms,
            );
        }
        if self.reconcile.enabled {
            check_positive(&mut problems, "reconcile.timeout_ms", self.reconcile.timeout_ms);
            check_positive(
                &mut problems,
                "reconcile.max_concurrent",
                self.reconcile.max_concurrent as u64,
            );
            check_positive(
                &mut problems,
                "reconcile.poll_interval_ms",
                self.reconcile.poll_interval_ms,
            );
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError { problems })
        }
    }
}

fn check_positive(problems: &mut Vec<String>, field: &str, value: u64) {
    if value == 0 {
        problems.push(format!("{field} must be positive"));
    }
}

/// Fatal pre-flight validation failure; lists every detected problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub problems: Vec<String>,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid configuration: {}", self.problems.join("; "))
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(id: &str) -> LandingZone {
        LandingZone::new(id, "111111111111", "eu-west-1", "PrepRole")
    }

    #[test]
    fn default_config_validates() {
        let cfg = WorkflowConfig::for_zones(vec![zone("lz-a")]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn empty_zone_list_is_fatal() {
        let cfg = WorkflowConfig::for_zones(vec![]);
        let err = cfg.validate().unwrap_err();
        assert!(err.problems.iter().any(|p| p.contains("landing_zones")));
    }

    #[test]
    fn duplicate_zone_ids_are_fatal() {
        let cfg = WorkflowConfig::for_zones(vec![zone("lz-a"), zone("lz-a")]);
        let err = cfg.validate().unwrap_err();
        assert!(err.problems.iter().any(|p| p.contains("duplicate")));
    }

    #[test]
    fn zero_bounds_are_fatal_only_for_enabled_phases() {
        let mut cfg = WorkflowConfig::for_zones(vec![zone("lz-a")]);
        cfg.snapshot.max_concurrent = 0;
        cfg.snapshot.poll_interval_ms = 0;
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.problems.len(), 2);

        cfg.snapshot.enabled = false;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn unknown_fields_are_rejected_at_load_time() {
        let raw = r#"{
            "landing_zones": [
                {"id": "lz-a", "account_id": "1", "region": "eu-west-1", "access_role": "r"}
            ],
            "snapshot": {"surprise": true}
        }"#;
        let parsed: Result<WorkflowConfig, _> = serde_json::from_str(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn partial_phase_sections_fill_defaults() {
        let raw = r#"{
            "landing_zones": [
                {"id": "lz-a", "account_id": "1", "region": "eu-west-1", "access_role": "r"}
            ],
            "snapshot": {"max_concurrent": 3}
        }"#;
        let parsed: WorkflowConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.snapshot.max_concurrent, 3);
        assert_eq!(parsed.snapshot.retry_attempts, SnapshotConfig::default().retry_attempts);
        assert!(parsed.snapshot.proceed_on_timeout);
    }
}
