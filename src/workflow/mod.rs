//! The three-phase pipeline and its orchestrator.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::WorkflowConfig;
use crate::gateways::{AccessProvider, AgentGateway, ComputeGateway, SessionCache};
use crate::{now_ms, ConfigError, Instance};

pub(crate) mod pool;
pub mod reconcile;
pub mod results;
pub mod scanner;
pub mod snapshot;

pub use reconcile::StateReconciler;
pub use scanner::Scanner;
pub use snapshot::SnapshotEngine;

use results::{Phase, PhaseResult, PhaseStatus, RunState, WorkflowResult};

/// Drives Discovery → Snapshot → Reconciliation in sequence, feeding each
/// phase the previous phase's surviving instance set and applying the
/// continue-or-abort policy between phases.
///
/// The orchestrator performs no control-plane calls itself; the injected
/// gateways are handed to the phase engines, which share one session cache
/// per run.
pub struct WorkflowOrchestrator {
    access: Arc<dyn AccessProvider>,
    compute: Arc<dyn ComputeGateway>,
    agent: Arc<dyn AgentGateway>,
}

impl WorkflowOrchestrator {
    pub fn new(
        access: Arc<dyn AccessProvider>,
        compute: Arc<dyn ComputeGateway>,
        agent: Arc<dyn AgentGateway>,
    ) -> Self {
        Self {
            access,
            compute,
            agent,
        }
    }

    /// Run the full pipeline.
    ///
    /// The only `Err` is a fatal configuration problem detected before any
    /// remote call; every remote-world failure is captured inside the
    /// returned [`WorkflowResult`].
    pub async fn run(&self, config: &WorkflowConfig) -> Result<WorkflowResult, ConfigError> {
        config.validate()?;
        let started_at_ms = now_ms();
        let sessions = self.session_cache(config);
        let mut phases: Vec<PhaseResult> = Vec::new();
        let mut run_state = RunState::Idle;
        info!(
            zones = config.landing_zones.len(),
            continue_on_error = config.continue_on_error,
            state = ?run_state,
            "workflow run started"
        );

        run_state = RunState::Scanning;
        debug!(state = ?run_state, "phase transition");
        let discovery = if config.scanner.enabled {
            self.scanner(&sessions, config)
                .discover(&config.landing_zones)
                .await
        } else {
            info!("discovery disabled by configuration; skipping");
            PhaseResult::skipped(Phase::Discovery)
        };
        let candidates = discovery.discovered_instances();
        let discovery_failed = discovery.status == PhaseStatus::Failed;
        phases.push(discovery);
        if discovery_failed && !config.continue_on_error {
            warn!("discovery failed; aborting run");
            return Ok(WorkflowResult::finalize(phases, RunState::Aborted, started_at_ms));
        }

        run_state = RunState::Snapshotting;
        debug!(state = ?run_state, "phase transition");
        let snapshot = if config.snapshot.enabled {
            let backup_candidates: Vec<Instance> = candidates
                .iter()
                .filter(|i| i.requires_backup)
                .cloned()
                .collect();
            self.snapshot_engine(&sessions, config)
                .backup(&backup_candidates)
                .await
        } else {
            info!("snapshot phase disabled by configuration; skipping");
            PhaseResult::skipped(Phase::Snapshot)
        };
        let casualties: HashSet<String> = snapshot
            .snapshot_casualties(config.snapshot.proceed_on_timeout)
            .into_iter()
            .collect();
        let snapshot_failed = snapshot.status == PhaseStatus::Failed;
        phases.push(snapshot);
        if snapshot_failed && !config.continue_on_error {
            warn!("snapshot phase failed; aborting run");
            return Ok(WorkflowResult::finalize(phases, RunState::Aborted, started_at_ms));
        }
        let survivors: Vec<Instance> = candidates
            .into_iter()
            .filter(|i| !casualties.contains(&i.id))
            .collect();

        run_state = RunState::Reconciling;
        debug!(state = ?run_state, "phase transition");
        let reconciliation = if config.reconcile.enabled {
            self.reconciler(&sessions, config).reconcile(&survivors).await
        } else {
            info!("reconciliation disabled by configuration; skipping");
            PhaseResult::skipped(Phase::Reconciliation)
        };
        let reconciliation_failed = reconciliation.status == PhaseStatus::Failed;
        phases.push(reconciliation);
        if reconciliation_failed && !config.continue_on_error {
            warn!("reconciliation failed; run aborted at final phase");
            return Ok(WorkflowResult::finalize(phases, RunState::Aborted, started_at_ms));
        }

        run_state = RunState::Completed;
        debug!(state = ?run_state, "phase transition");
        let result = WorkflowResult::finalize(phases, run_state, started_at_ms);
        info!(status = ?result.status, duration_ms = result.duration_ms, "workflow run finished");
        Ok(result)
    }

    /// Run a single phase in isolation, reusing the same engines.
    ///
    /// Discovery is the "scanner-only" invocation. Snapshot and
    /// Reconciliation first run a quiet discovery pass to build their
    /// candidate pool, since the contract only takes a phase and a config.
    pub async fn run_phase(
        &self,
        phase: Phase,
        config: &WorkflowConfig,
    ) -> Result<PhaseResult, ConfigError> {
        config.validate()?;
        let sessions = self.session_cache(config);
        info!(phase = %phase, "isolated phase run");
        let result = match phase {
            Phase::Discovery => {
                self.scanner(&sessions, config)
                    .discover(&config.landing_zones)
                    .await
            }
            Phase::Snapshot => {
                let pool = self.quiet_pool(&sessions, config).await;
                let backup_candidates: Vec<Instance> =
                    pool.into_iter().filter(|i| i.requires_backup).collect();
                self.snapshot_engine(&sessions, config)
                    .backup(&backup_candidates)
                    .await
            }
            Phase::Reconciliation => {
                let pool = self.quiet_pool(&sessions, config).await;
                self.reconciler(&sessions, config).reconcile(&pool).await
            }
        };
        Ok(result)
    }

    fn session_cache(&self, config: &WorkflowConfig) -> Arc<SessionCache> {
        Arc::new(SessionCache::new(
            self.access.clone(),
            config.landing_zones.clone(),
        ))
    }

    fn scanner(&self, sessions: &Arc<SessionCache>, config: &WorkflowConfig) -> Scanner {
        Scanner::new(
            sessions.clone(),
            self.compute.clone(),
            self.agent.clone(),
            config.scanner.clone(),
        )
    }

    fn snapshot_engine(
        &self,
        sessions: &Arc<SessionCache>,
        config: &WorkflowConfig,
    ) -> SnapshotEngine {
        SnapshotEngine::new(sessions.clone(), self.compute.clone(), config.snapshot.clone())
    }

    fn reconciler(&self, sessions: &Arc<SessionCache>, config: &WorkflowConfig) -> StateReconciler {
        StateReconciler::new(
            sessions.clone(),
            self.compute.clone(),
            self.agent.clone(),
            config.reconcile.clone(),
        )
    }

    async fn quiet_pool(
        &self,
        sessions: &Arc<SessionCache>,
        config: &WorkflowConfig,
    ) -> Vec<Instance> {
        self.scanner(sessions, config)
            .discover(&config.landing_zones)
            .await
            .discovered_instances()
    }
}
