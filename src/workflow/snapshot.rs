//! Snapshot phase: create a point-in-time rollback image per instance.
//!
//! Per instance: a provenance-tagged create call (transient errors retried
//! with backoff), then fixed-interval status polling until the image is
//! available or fails, or the per-instance deadline passes. A timed-out
//! record is terminal but distinct from failed — the remote operation is
//! abandoned by this run, not cancelled.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SnapshotConfig;
use crate::gateways::{ComputeGateway, ImageState, SessionCache};
use crate::workflow::pool::{poll_until, run_bounded, with_retry, BoxedWork};
use crate::workflow::results::{Phase, PhaseOutcome, PhaseResult, PhaseStatus};
use crate::{Instance, RetryPolicy, SnapshotRecord, SnapshotStatus};

/// Snapshot engine; cheap to clone, shares the run's session cache.
#[derive(Clone)]
pub struct SnapshotEngine {
    sessions: Arc<SessionCache>,
    compute: Arc<dyn ComputeGateway>,
    config: SnapshotConfig,
}

impl SnapshotEngine {
    pub fn new(
        sessions: Arc<SessionCache>,
        compute: Arc<dyn ComputeGateway>,
        config: SnapshotConfig,
    ) -> Self {
        Self {
            sessions,
            compute,
            config,
        }
    }

    /// Back up every given instance, bounded by `snapshot.max_concurrent`.
    pub async fn backup(&self, instances: &[Instance]) -> PhaseResult {
        let mut result = PhaseResult::begin(Phase::Snapshot);
        if instances.is_empty() {
            info!("no instances require backup");
            result.finish(PhaseStatus::Success);
            return result;
        }

        info!(instances = instances.len(), "snapshot phase started");

        let engine = self.clone();
        let work = move |instance: Instance| -> BoxedWork<SnapshotRecord> {
            let engine = engine.clone();
            Box::pin(async move { engine.backup_one(&instance).await })
        };
        let records = run_bounded(
            instances.to_vec(),
            self.config.max_concurrent,
            self.config.phase_timeout(),
            work,
            |instance| {
                let mut record = SnapshotRecord::new(&instance.id);
                record.time_out("abandoned at phase deadline");
                record
            },
        )
        .await;

        let available = records
            .iter()
            .filter(|r| r.status == SnapshotStatus::Available)
            .count();
        let status = if available == records.len() {
            PhaseStatus::Success
        } else if available > 0 {
            PhaseStatus::Partial
        } else {
            PhaseStatus::Failed
        };
        for record in records {
            result.outcomes.push(PhaseOutcome::Snapshotted(record));
        }
        result.finish(status);
        info!(
            status = ?result.status,
            available,
            total = result.outcomes.len(),
            "snapshot phase finished"
        );
        result
    }

    async fn backup_one(&self, instance: &Instance) -> SnapshotRecord {
        let mut record = SnapshotRecord::new(&instance.id);
        let session = match self.sessions.get(&instance.landing_zone).await {
            Ok(session) => session,
            Err(err) => {
                record.fail(format!("session unavailable: {err}"));
                return record;
            }
        };

        let deadline = Instant::now() + self.config.timeout();
        let tags = self.provenance_tags(instance, &record);
        record.begin_creating();

        let policy = RetryPolicy::new(self.config.retry_attempts + 1);
        let created = with_retry(&policy, Some(deadline), |_attempt| {
            let compute = self.compute.clone();
            let session = session.clone();
            let instance_id = instance.id.clone();
            let tags = tags.clone();
            async move { compute.create_image(&session, &instance_id, &tags).await }
        })
        .await;

        let handle = match created {
            Ok((handle, retries)) => {
                record.retry_count = retries;
                record.image_id = Some(handle.image_id.clone());
                debug!(
                    instance = %instance.id,
                    image = %handle.image_id,
                    retries,
                    "image creation accepted"
                );
                handle
            }
            Err(failure) => {
                record.retry_count = failure.retries;
                let detail = failure
                    .error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "create_image gave no detail".to_string());
                if failure.timed_out {
                    warn!(instance = %instance.id, "image creation abandoned at deadline");
                    record.time_out(format!("create abandoned at deadline: {detail}"));
                } else {
                    warn!(instance = %instance.id, error = %detail, "image creation failed");
                    record.fail(detail);
                }
                return record;
            }
        };

        let polled = poll_until(deadline, self.config.poll_interval(), || {
            let compute = self.compute.clone();
            let session = session.clone();
            let handle = handle.clone();
            async move {
                match compute.describe_image(&session, &handle).await {
                    Ok(ImageState::Available) => Some(Ok(())),
                    Ok(ImageState::Failed) => Some(Err("image entered failed state".to_string())),
                    Ok(ImageState::Pending) => None,
                    // Transient describe errors just mean poll again.
                    Err(err) if err.is_retryable() => None,
                    Err(err) => Some(Err(err.to_string())),
                }
            }
        })
        .await;

        match polled {
            Some(Ok(())) => {
                record.complete();
                info!(
                    instance = %instance.id,
                    image = %handle.image_id,
                    "snapshot available"
                );
            }
            Some(Err(message)) => {
                warn!(instance = %instance.id, error = %message, "snapshot failed");
                record.fail(message);
            }
            None => {
                warn!(instance = %instance.id, "snapshot timed out; remote operation abandoned");
                record.time_out("image did not become available before timeout");
            }
        }
        record
    }

    fn provenance_tags(
        &self,
        instance: &Instance,
        record: &SnapshotRecord,
    ) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("Name".to_string(), record.image_name.clone()),
            ("SourceInstanceId".to_string(), instance.id.clone()),
            ("SourceLandingZone".to_string(), instance.landing_zone.clone()),
            ("CreatedAtMs".to_string(), record.started_at_ms.to_string()),
            (
                "RetentionDays".to_string(),
                self.config.retention_days.to_string(),
            ),
            ("CreatedBy".to_string(), "fleetprep".to_string()),
        ])
    }
}
