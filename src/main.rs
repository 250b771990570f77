use std::sync::Arc;

use fleetprep::gateways::in_memory::{InMemoryCloud, SimInstance};
use fleetprep::report::{InMemoryReportSink, ReportSink};
use fleetprep::{AgentStatus, LandingZone, WorkflowConfig, WorkflowOrchestrator};

/// Demo run against the in-memory control plane: two healthy zones with a
/// mixed fleet plus one zone whose access is denied, so the output shows a
/// partial result with every instance's fate enumerated.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install a tracing subscriber to print logs; respects RUST_LOG if set
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .try_init();

    let cloud = Arc::new(InMemoryCloud::new());
    cloud.add_instance("lz-alpha", SimInstance::new("i-web-1").tag("Name", "web-1"));
    cloud.add_instance(
        "lz-alpha",
        SimInstance::new("i-db-1").tag("Name", "db-1").stopped().agent_online_after(1),
    );
    cloud.add_instance(
        "lz-beta",
        SimInstance::new("i-batch-1")
            .tag("Name", "batch-1")
            .platform("windows")
            .create_fails_transient(1),
    );
    cloud.add_instance("lz-beta", SimInstance::new("i-old-1").state("terminated").agent(AgentStatus::Unknown));
    cloud.deny_zone("lz-gamma", "role assumption rejected");

    let mut config = WorkflowConfig::for_zones(vec![
        LandingZone::new("lz-alpha", "111111111111", "eu-west-1", "PrepRole"),
        LandingZone::new("lz-beta", "222222222222", "eu-central-1", "PrepRole"),
        LandingZone::new("lz-gamma", "333333333333", "us-east-1", "PrepRole"),
    ]);
    config.continue_on_error = true;
    config.snapshot.poll_interval_ms = 50;
    config.snapshot.timeout_ms = 5_000;
    config.snapshot.retry_attempts = 2;
    config.reconcile.poll_interval_ms = 50;
    config.reconcile.timeout_ms = 5_000;
    config.scanner.timeout_ms = 2_000;

    let orchestrator = WorkflowOrchestrator::new(cloud.clone(), cloud.clone(), cloud.clone());
    let result = orchestrator.run(&config).await?;

    let sink = InMemoryReportSink::new();
    sink.publish(&result)
        .await
        .map_err(|e| anyhow::anyhow!("publish failed: {e}"))?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
