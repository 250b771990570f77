//! Discovery phase: enumerate and normalize the instance inventory of every
//! requested landing zone.
//!
//! Zones are scanned concurrently (bounded by `scanner.max_concurrent`) and
//! are strictly fault-isolated: a zone whose session cannot be acquired or
//! whose listing fails contributes a zone-level error, never an abort of its
//! siblings.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ScannerConfig;
use crate::gateways::{AgentGateway, ComputeGateway, RawInstance, Session, SessionCache};
use crate::workflow::pool::{run_bounded, with_retry, BoxedWork};
use crate::workflow::results::{Phase, PhaseOutcome, PhaseResult, PhaseStatus};
use crate::{AgentStatus, Instance, InstanceState, LandingZone, Platform, RetryPolicy};

enum ZoneScan {
    Scanned {
        zone: String,
        instances: Vec<Instance>,
        errors: Vec<String>,
    },
    Failed {
        zone: String,
        error: String,
    },
    Abandoned {
        zone: String,
    },
}

/// Discovery engine; cheap to clone, shares the run's session cache.
#[derive(Clone)]
pub struct Scanner {
    sessions: Arc<SessionCache>,
    compute: Arc<dyn ComputeGateway>,
    agent: Arc<dyn AgentGateway>,
    config: ScannerConfig,
}

impl Scanner {
    pub fn new(
        sessions: Arc<SessionCache>,
        compute: Arc<dyn ComputeGateway>,
        agent: Arc<dyn AgentGateway>,
        config: ScannerConfig,
    ) -> Self {
        Self {
            sessions,
            compute,
            agent,
            config,
        }
    }

    /// Discover instances across the given zones.
    pub async fn discover(&self, zones: &[LandingZone]) -> PhaseResult {
        let mut result = PhaseResult::begin(Phase::Discovery);

        let enabled: Vec<LandingZone> = zones.iter().filter(|z| z.enabled).cloned().collect();
        for zone in zones.iter().filter(|z| !z.enabled) {
            debug!(zone = %zone.id, "zone disabled; skipping discovery");
        }
        if enabled.is_empty() {
            result.errors.push("no enabled landing zones".to_string());
            result.finish(PhaseStatus::Failed);
            return result;
        }

        info!(zones = enabled.len(), "discovery started");

        let engine = self.clone();
        let work = move |zone: LandingZone| -> BoxedWork<ZoneScan> {
            let engine = engine.clone();
            Box::pin(async move { engine.scan_zone(&zone).await })
        };
        let scans = run_bounded(
            enabled,
            self.config.max_concurrent,
            self.config.phase_timeout(),
            work,
            |zone| ZoneScan::Abandoned { zone: zone.id.clone() },
        )
        .await;

        let mut zones_ok = 0usize;
        let mut had_errors = false;
        for scan in scans {
            match scan {
                ZoneScan::Scanned { zone, instances, errors } => {
                    zones_ok += 1;
                    info!(zone = %zone, found = instances.len(), "zone scan complete");
                    if !errors.is_empty() {
                        had_errors = true;
                        result.errors.extend(errors);
                    }
                    for instance in instances {
                        result.outcomes.push(PhaseOutcome::Discovered(instance));
                    }
                }
                ZoneScan::Failed { zone, error } => {
                    warn!(zone = %zone, error = %error, "zone scan failed");
                    had_errors = true;
                    result.errors.push(format!("zone {zone}: {error}"));
                }
                ZoneScan::Abandoned { zone } => {
                    warn!(zone = %zone, "zone scan abandoned at phase deadline");
                    had_errors = true;
                    result.errors.push(format!("zone {zone}: abandoned at phase deadline"));
                }
            }
        }

        let status = if zones_ok == 0 {
            PhaseStatus::Failed
        } else if had_errors {
            PhaseStatus::Partial
        } else {
            PhaseStatus::Success
        };
        result.finish(status);
        info!(
            status = ?result.status,
            instances = result.outcomes.len(),
            errors = result.errors.len(),
            "discovery finished"
        );
        result
    }

    async fn scan_zone(&self, zone: &LandingZone) -> ZoneScan {
        let session = match self.sessions.get(&zone.id).await {
            Ok(session) => session,
            Err(err) => {
                return ZoneScan::Failed {
                    zone: zone.id.clone(),
                    error: err.to_string(),
                }
            }
        };

        let deadline = Instant::now() + self.config.timeout();
        let policy = RetryPolicy::new(self.config.retry_attempts + 1);
        let listed = with_retry(&policy, Some(deadline), |_attempt| {
            let compute = self.compute.clone();
            let session = session.clone();
            let filters = self.config.filters.clone();
            async move { compute.list_instances(&session, &filters).await }
        })
        .await;
        let raws = match listed {
            Ok((raws, _retries)) => raws,
            Err(failure) => {
                let error = failure
                    .error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "instance listing timed out".to_string());
                return ZoneScan::Failed {
                    zone: zone.id.clone(),
                    error,
                };
            }
        };

        let mut instances = Vec::with_capacity(raws.len());
        let mut errors = Vec::new();
        for raw in raws {
            let (instance, error) = self.normalize(zone, &session, raw).await;
            if let Some(error) = error {
                errors.push(error);
            }
            instances.push(instance);
        }
        ZoneScan::Scanned {
            zone: zone.id.clone(),
            instances,
            errors,
        }
    }

    /// Normalize a raw description and enrich it with agent connectivity.
    ///
    /// Enrichment failure is per-instance and non-fatal: the instance is
    /// kept with `agent = Unknown` and the error is reported alongside.
    async fn normalize(
        &self,
        zone: &LandingZone,
        session: &Session,
        raw: RawInstance,
    ) -> (Instance, Option<String>) {
        let state = InstanceState::from_raw(&raw.state);
        let name = raw
            .tags
            .get("Name")
            .cloned()
            .unwrap_or_else(|| raw.id.clone());

        let (agent, error) =
            match tokio::time::timeout(self.config.timeout(), self.agent.ping(session, &raw.id)).await {
                Ok(Ok(status)) => (status, None),
                Ok(Err(err)) => (
                    AgentStatus::Unknown,
                    Some(format!("instance {}: agent enrichment failed: {err}", raw.id)),
                ),
                Err(_elapsed) => (
                    AgentStatus::Unknown,
                    Some(format!("instance {}: agent enrichment timed out", raw.id)),
                ),
            };

        let instance = Instance {
            id: raw.id,
            landing_zone: zone.id.clone(),
            name,
            platform: Platform::from_raw(&raw.platform),
            state,
            agent,
            requires_backup: state.requires_backup(),
            tags: raw.tags,
        };
        debug!(
            instance = %instance.id,
            zone = %zone.id,
            state = %instance.state,
            requires_backup = instance.requires_backup,
            "instance discovered"
        );
        (instance, error)
    }
}
