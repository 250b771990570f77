//! Concurrency-ceiling property tests: the configured admission limit is a
//! hard ceiling, observed through instrumented gateway decorators counting
//! simultaneous in-flight operations.

mod common;

use std::sync::Arc;

use fleetprep::gateways::in_memory::{InMemoryCloud, SimInstance};
use fleetprep::gateways::instrumented::{
    ConcurrencyGauge, InstrumentedAgentGateway, InstrumentedComputeGateway,
};
use fleetprep::workflow::{Scanner, SnapshotEngine, StateReconciler};
use fleetprep::{LandingZone, PhaseStatus};

use common::{cache, fast_config, zone};

fn fleet(cloud: &InMemoryCloud, count: usize, stopped: bool) {
    for i in 0..count {
        let spec = SimInstance::new(format!("i-{i:03}")).image_ready_after(2);
        let spec = if stopped { spec.stopped().start_polls(2) } else { spec };
        cloud.add_instance("lz-a", spec);
    }
}

#[tokio::test]
async fn snapshot_pool_never_exceeds_the_configured_ceiling() {
    let cloud = Arc::new(InMemoryCloud::new());
    fleet(&cloud, 12, false);
    cloud.set_op_delay(std::time::Duration::from_millis(15));

    let zones = vec![zone("lz-a")];
    let mut config = fast_config(zones.clone());
    config.snapshot.max_concurrent = 3;
    config.snapshot.timeout_ms = 10_000;

    let instances = Scanner::new(
        cache(&cloud, &zones),
        cloud.clone(),
        cloud.clone(),
        config.scanner.clone(),
    )
    .discover(&zones)
    .await
    .discovered_instances();
    assert_eq!(instances.len(), 12);

    let gauge = Arc::new(ConcurrencyGauge::new());
    let instrumented = Arc::new(InstrumentedComputeGateway::new(cloud.clone(), gauge.clone()));
    let engine = SnapshotEngine::new(cache(&cloud, &zones), instrumented, config.snapshot.clone());
    let result = engine.backup(&instances).await;

    assert_eq!(result.status, PhaseStatus::Success);
    assert_eq!(result.snapshot_records().len(), 12);
    assert!(
        gauge.peak() <= 3,
        "admission limit violated: peak {} > 3",
        gauge.peak()
    );
    assert!(gauge.peak() >= 2, "expected overlapping snapshot work");
    assert_eq!(gauge.current(), 0);
}

#[tokio::test]
async fn reconcile_pool_never_exceeds_the_configured_ceiling() {
    let cloud = Arc::new(InMemoryCloud::new());
    fleet(&cloud, 10, true);
    cloud.set_op_delay(std::time::Duration::from_millis(15));

    let zones = vec![zone("lz-a")];
    let mut config = fast_config(zones.clone());
    config.reconcile.max_concurrent = 2;
    config.reconcile.timeout_ms = 10_000;

    let instances = Scanner::new(
        cache(&cloud, &zones),
        cloud.clone(),
        cloud.clone(),
        config.scanner.clone(),
    )
    .discover(&zones)
    .await
    .discovered_instances();

    let compute_gauge = Arc::new(ConcurrencyGauge::new());
    let agent_gauge = Arc::new(ConcurrencyGauge::new());
    let reconciler = StateReconciler::new(
        cache(&cloud, &zones),
        Arc::new(InstrumentedComputeGateway::new(cloud.clone(), compute_gauge.clone())),
        Arc::new(InstrumentedAgentGateway::new(cloud.clone(), agent_gauge.clone())),
        config.reconcile.clone(),
    );
    let result = reconciler.reconcile(&instances).await;

    assert_eq!(result.status, PhaseStatus::Success);
    assert_eq!(result.reconciliations().len(), 10);
    assert!(compute_gauge.peak() <= 2, "compute peak {} > 2", compute_gauge.peak());
    assert!(agent_gauge.peak() <= 2, "agent peak {} > 2", agent_gauge.peak());
}

#[tokio::test]
async fn scanner_zone_fanout_respects_its_own_ceiling() {
    let cloud = Arc::new(InMemoryCloud::new());
    let mut zones: Vec<LandingZone> = Vec::new();
    for z in 0..8 {
        let zone_id = format!("lz-{z}");
        cloud.add_instance(&zone_id, SimInstance::new(format!("i-{z}")));
        zones.push(zone(&zone_id));
    }
    cloud.set_op_delay(std::time::Duration::from_millis(15));

    let mut config = fast_config(zones.clone());
    config.scanner.max_concurrent = 2;

    let gauge = Arc::new(ConcurrencyGauge::new());
    let scanner = Scanner::new(
        cache(&cloud, &zones),
        Arc::new(InstrumentedComputeGateway::new(cloud.clone(), gauge.clone())),
        cloud.clone(),
        config.scanner.clone(),
    );
    let result = scanner.discover(&zones).await;

    assert_eq!(result.status, PhaseStatus::Success);
    assert_eq!(result.discovered_instances().len(), 8);
    assert!(gauge.peak() <= 2, "zone fan-out peak {} > 2", gauge.peak());
}

#[tokio::test]
async fn large_fleet_completes_with_one_outcome_per_instance() {
    let cloud = Arc::new(InMemoryCloud::new());
    fleet(&cloud, 50, false);

    let zones = vec![zone("lz-a")];
    let mut config = fast_config(zones.clone());
    config.snapshot.max_concurrent = 4;
    config.snapshot.timeout_ms = 30_000;

    let instances = Scanner::new(
        cache(&cloud, &zones),
        cloud.clone(),
        cloud.clone(),
        config.scanner.clone(),
    )
    .discover(&zones)
    .await
    .discovered_instances();
    assert_eq!(instances.len(), 50);

    let engine = SnapshotEngine::new(cache(&cloud, &zones), cloud.clone(), config.snapshot.clone());
    let result = engine.backup(&instances).await;

    let mut ids: Vec<String> = result
        .snapshot_records()
        .iter()
        .map(|r| r.instance_id.clone())
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 50, "no drops or duplicates under contention");
    assert_eq!(result.status, PhaseStatus::Success);
}
