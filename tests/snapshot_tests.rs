//! Snapshot-phase tests: retry behavior, polling, the timeout/failed
//! distinction, provenance tagging, and aggregate status rules.

mod common;

use std::sync::Arc;
use std::time::Instant;

use fleetprep::gateways::in_memory::{InMemoryCloud, SimInstance};
use fleetprep::workflow::SnapshotEngine;
use fleetprep::{
    Instance, LandingZone, PhaseStatus, SnapshotRecord, SnapshotStatus, WorkflowConfig,
};

use common::{cache, fast_config, zone};

fn engine(cloud: &Arc<InMemoryCloud>, zones: &[LandingZone], config: &WorkflowConfig) -> SnapshotEngine {
    SnapshotEngine::new(cache(cloud, zones), cloud.clone(), config.snapshot.clone())
}

async fn discover(
    cloud: &Arc<InMemoryCloud>,
    zones: &[LandingZone],
    config: &WorkflowConfig,
) -> Vec<Instance> {
    fleetprep::workflow::Scanner::new(
        cache(cloud, zones),
        cloud.clone(),
        cloud.clone(),
        config.scanner.clone(),
    )
    .discover(zones)
    .await
    .discovered_instances()
}

#[tokio::test]
async fn every_instance_reaching_available_is_success() {
    let cloud = Arc::new(InMemoryCloud::new());
    cloud.add_instance("lz-a", SimInstance::new("i-1"));
    cloud.add_instance("lz-a", SimInstance::new("i-2"));
    cloud.add_instance("lz-a", SimInstance::new("i-3").stopped());

    let zones = vec![zone("lz-a")];
    let config = fast_config(zones.clone());
    let instances = discover(&cloud, &zones, &config).await;
    let result = engine(&cloud, &zones, &config).backup(&instances).await;

    assert_eq!(result.status, PhaseStatus::Success);
    let records = result.snapshot_records();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.status == SnapshotStatus::Available));
    assert!(records.iter().all(|r| r.image_id.is_some()));
    assert!(records.iter().all(|r| r.completed_at_ms.is_some()));
}

#[tokio::test]
async fn transient_create_errors_are_retried_with_count_recorded() {
    let cloud = Arc::new(InMemoryCloud::new());
    cloud.add_instance("lz-a", SimInstance::new("i-flaky").create_fails_transient(2));

    let zones = vec![zone("lz-a")];
    let mut config = fast_config(zones.clone());
    config.snapshot.retry_attempts = 3;
    let instances = discover(&cloud, &zones, &config).await;
    let result = engine(&cloud, &zones, &config).backup(&instances).await;

    assert_eq!(result.status, PhaseStatus::Success);
    let records = result.snapshot_records();
    assert_eq!(records[0].status, SnapshotStatus::Available);
    assert_eq!(records[0].retry_count, 2);
    assert_eq!(cloud.create_calls("lz-a", "i-flaky"), 3);
}

#[tokio::test]
async fn exhausted_retries_become_failed() {
    let cloud = Arc::new(InMemoryCloud::new());
    cloud.add_instance("lz-a", SimInstance::new("i-throttled").create_fails_transient(10));

    let zones = vec![zone("lz-a")];
    let mut config = fast_config(zones.clone());
    config.snapshot.retry_attempts = 1;
    let instances = discover(&cloud, &zones, &config).await;
    let result = engine(&cloud, &zones, &config).backup(&instances).await;

    assert_eq!(result.status, PhaseStatus::Failed);
    let records = result.snapshot_records();
    assert_eq!(records[0].status, SnapshotStatus::Failed);
    assert_eq!(records[0].retry_count, 1);
    assert_eq!(cloud.create_calls("lz-a", "i-throttled"), 2);
}

#[tokio::test]
async fn permanent_create_errors_are_not_retried() {
    let cloud = Arc::new(InMemoryCloud::new());
    cloud.add_instance("lz-a", SimInstance::new("i-rejected").create_fails_permanent());

    let zones = vec![zone("lz-a")];
    let config = fast_config(zones.clone());
    let instances = discover(&cloud, &zones, &config).await;
    let result = engine(&cloud, &zones, &config).backup(&instances).await;

    let records = result.snapshot_records();
    assert_eq!(records[0].status, SnapshotStatus::Failed);
    assert_eq!(records[0].retry_count, 0);
    assert_eq!(cloud.create_calls("lz-a", "i-rejected"), 1);
}

#[tokio::test]
async fn timeout_is_terminal_but_distinct_from_failed() {
    let cloud = Arc::new(InMemoryCloud::new());
    cloud.add_instance("lz-a", SimInstance::new("i-slow").image_never_ready());

    let zones = vec![zone("lz-a")];
    let mut config = fast_config(zones.clone());
    config.snapshot.timeout_ms = 100;
    let instances = discover(&cloud, &zones, &config).await;
    let result = engine(&cloud, &zones, &config).backup(&instances).await;

    assert_eq!(result.status, PhaseStatus::Failed);
    let records = result.snapshot_records();
    assert_eq!(records[0].status, SnapshotStatus::TimedOut);
    assert!(records[0].image_id.is_some(), "create was accepted before the timeout");
    assert!(records[0].error.as_deref().unwrap_or("").contains("timeout"));
}

#[tokio::test]
async fn image_entering_failed_state_fails_the_record() {
    let cloud = Arc::new(InMemoryCloud::new());
    cloud.add_instance("lz-a", SimInstance::new("i-bad").image_fails());

    let zones = vec![zone("lz-a")];
    let config = fast_config(zones.clone());
    let instances = discover(&cloud, &zones, &config).await;
    let result = engine(&cloud, &zones, &config).backup(&instances).await;

    let records = result.snapshot_records();
    assert_eq!(records[0].status, SnapshotStatus::Failed);
    assert!(records[0].error.as_deref().unwrap_or("").contains("failed state"));
}

#[tokio::test]
async fn strict_subset_succeeding_is_partial() {
    let cloud = Arc::new(InMemoryCloud::new());
    cloud.add_instance("lz-a", SimInstance::new("i-good"));
    cloud.add_instance("lz-a", SimInstance::new("i-bad").create_fails_permanent());

    let zones = vec![zone("lz-a")];
    let config = fast_config(zones.clone());
    let instances = discover(&cloud, &zones, &config).await;
    let result = engine(&cloud, &zones, &config).backup(&instances).await;

    assert_eq!(result.status, PhaseStatus::Partial);
}

#[tokio::test]
async fn created_images_carry_provenance_tags() {
    let cloud = Arc::new(InMemoryCloud::new());
    cloud.add_instance("lz-a", SimInstance::new("i-tagged"));

    let zones = vec![zone("lz-a")];
    let mut config = fast_config(zones.clone());
    config.snapshot.retention_days = 14;
    let instances = discover(&cloud, &zones, &config).await;
    let result = engine(&cloud, &zones, &config).backup(&instances).await;
    assert_eq!(result.status, PhaseStatus::Success);

    let images = cloud.images("lz-a");
    assert_eq!(images.len(), 1);
    let (_, source, tags) = &images[0];
    assert_eq!(source, "i-tagged");
    assert_eq!(tags.get("SourceInstanceId").unwrap(), "i-tagged");
    assert_eq!(tags.get("RetentionDays").unwrap(), "14");
    assert!(tags.get("Name").unwrap().starts_with("backup-i-tagged-"));
    assert!(tags.contains_key("CreatedAtMs"));
}

#[tokio::test]
async fn empty_input_is_a_clean_success() {
    let cloud = Arc::new(InMemoryCloud::new());
    cloud.add_zone("lz-a");
    let zones = vec![zone("lz-a")];
    let config = fast_config(zones.clone());
    let result = engine(&cloud, &zones, &config).backup(&[]).await;

    assert_eq!(result.status, PhaseStatus::Success);
    assert!(result.outcomes.is_empty());
}

#[tokio::test]
async fn output_set_matches_input_set_exactly() {
    let cloud = Arc::new(InMemoryCloud::new());
    for i in 0..20 {
        let spec = if i % 5 == 0 {
            SimInstance::new(format!("i-{i:02}")).create_fails_permanent()
        } else {
            SimInstance::new(format!("i-{i:02}"))
        };
        cloud.add_instance("lz-a", spec);
    }

    let zones = vec![zone("lz-a")];
    let config = fast_config(zones.clone());
    let instances = discover(&cloud, &zones, &config).await;
    assert_eq!(instances.len(), 20);
    let result = engine(&cloud, &zones, &config).backup(&instances).await;

    let mut record_ids: Vec<String> = result
        .snapshot_records()
        .iter()
        .map(|r| r.instance_id.clone())
        .collect();
    record_ids.sort();
    record_ids.dedup();
    assert_eq!(record_ids.len(), 20, "one record per input, no duplicates, no drops");
}

#[tokio::test]
async fn phase_deadline_synthesizes_timeouts_for_unfinished_instances() {
    let cloud = Arc::new(InMemoryCloud::new());
    for i in 0..3 {
        cloud.add_instance("lz-a", SimInstance::new(format!("i-{i}")).image_never_ready());
    }

    let zones = vec![zone("lz-a")];
    let mut config = fast_config(zones.clone());
    config.snapshot.timeout_ms = 60_000;
    config.snapshot.phase_timeout_ms = Some(150);
    let instances = discover(&cloud, &zones, &config).await;

    let begun = Instant::now();
    let result = engine(&cloud, &zones, &config).backup(&instances).await;
    assert!(begun.elapsed().as_millis() < 5_000, "phase deadline must cut polling short");

    assert_eq!(result.status, PhaseStatus::Failed);
    let records = result.snapshot_records();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.status == SnapshotStatus::TimedOut));
}

#[test]
fn terminal_snapshot_statuses_are_monotone() {
    let mut record = SnapshotRecord::new("i-1");
    record.begin_creating();
    record.complete();
    assert_eq!(record.status, SnapshotStatus::Available);

    record.fail("late failure must not apply");
    assert_eq!(record.status, SnapshotStatus::Available);
    assert!(record.error.is_none());

    let mut timed_out = SnapshotRecord::new("i-2");
    timed_out.time_out("gone past deadline");
    timed_out.complete();
    assert_eq!(timed_out.status, SnapshotStatus::TimedOut);
}
