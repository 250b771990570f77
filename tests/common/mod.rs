//! Shared fixtures for the integration suites.

// Not every test file uses every helper.
#![allow(dead_code)]

pub mod fault_injection;

use std::sync::Arc;

use fleetprep::gateways::in_memory::InMemoryCloud;
use fleetprep::gateways::SessionCache;
use fleetprep::{Instance, LandingZone, WorkflowConfig, WorkflowOrchestrator};

pub fn zone(id: &str) -> LandingZone {
    LandingZone::new(id, "111111111111", "eu-west-1", "PrepRole")
}

/// Run configuration with timings scaled down for tests: millisecond-range
/// timeouts and poll intervals so timeout paths finish quickly.
pub fn fast_config(zones: Vec<LandingZone>) -> WorkflowConfig {
    let mut config = WorkflowConfig::for_zones(zones);
    config.scanner.timeout_ms = 1_000;
    config.scanner.retry_attempts = 2;
    config.snapshot.timeout_ms = 2_000;
    config.snapshot.poll_interval_ms = 10;
    config.snapshot.retry_attempts = 2;
    config.reconcile.timeout_ms = 2_000;
    config.reconcile.poll_interval_ms = 10;
    config.reconcile.retry_attempts = 2;
    config
}

/// Orchestrator wired to the in-memory cloud for all three gateway seams.
pub fn orchestrator(cloud: &Arc<InMemoryCloud>) -> WorkflowOrchestrator {
    WorkflowOrchestrator::new(cloud.clone(), cloud.clone(), cloud.clone())
}

/// Session cache over the in-memory cloud, for driving engines directly.
pub fn cache(cloud: &Arc<InMemoryCloud>, zones: &[LandingZone]) -> Arc<SessionCache> {
    Arc::new(SessionCache::new(cloud.clone(), zones.to_vec()))
}

/// Instance ids of a discovered set, sorted for comparison.
pub fn sorted_ids(instances: &[Instance]) -> Vec<String> {
    let mut ids: Vec<String> = instances.iter().map(|i| i.id.clone()).collect();
    ids.sort();
    ids
}
