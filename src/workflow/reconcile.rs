//! Reconciliation phase: bring every instance into the patch-ready state —
//! running, with its management agent reachable.
//!
//! Stopped instances are started and polled until running; running ones are
//! only verified. Anything in another state is recorded as skipped rather
//! than acted on. A running-but-unreachable instance is a failure: it is
//! not patch-ready even though the state transition succeeded.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ReconcileConfig;
use crate::gateways::{AgentGateway, ComputeGateway, Session, SessionCache};
use crate::workflow::pool::{poll_until, run_bounded, with_retry, BoxedWork};
use crate::workflow::results::{Phase, PhaseOutcome, PhaseResult, PhaseStatus};
use crate::{
    AgentStatus, Instance, InstanceState, ReconciliationOutcome, RequestedTransition, RetryPolicy,
};

/// Reconciliation engine; cheap to clone, shares the run's session cache.
#[derive(Clone)]
pub struct StateReconciler {
    sessions: Arc<SessionCache>,
    compute: Arc<dyn ComputeGateway>,
    agent: Arc<dyn AgentGateway>,
    config: ReconcileConfig,
}

impl StateReconciler {
    pub fn new(
        sessions: Arc<SessionCache>,
        compute: Arc<dyn ComputeGateway>,
        agent: Arc<dyn AgentGateway>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            sessions,
            compute,
            agent,
            config,
        }
    }

    /// Reconcile every given instance, bounded by `reconcile.max_concurrent`.
    pub async fn reconcile(&self, instances: &[Instance]) -> PhaseResult {
        let mut result = PhaseResult::begin(Phase::Reconciliation);
        if instances.is_empty() {
            info!("no instances to reconcile");
            result.finish(PhaseStatus::Success);
            return result;
        }

        info!(instances = instances.len(), "reconciliation started");

        let engine = self.clone();
        let work = move |instance: Instance| -> BoxedWork<ReconciliationOutcome> {
            let engine = engine.clone();
            Box::pin(async move { engine.reconcile_one(&instance).await })
        };
        let outcomes = run_bounded(
            instances.to_vec(),
            self.config.max_concurrent,
            self.config.phase_timeout(),
            work,
            |instance| {
                ReconciliationOutcome::failed(
                    &instance.id,
                    RequestedTransition::None,
                    instance.state,
                    "abandoned at phase deadline",
                )
            },
        )
        .await;

        let eligible = outcomes.iter().filter(|o| !o.is_skipped()).count();
        let successes = outcomes.iter().filter(|o| o.success).count();
        let status = if eligible == 0 {
            // Every instance sat in a state the phase does not act on.
            result
                .errors
                .push("no instance was in a reconcilable state".to_string());
            PhaseStatus::Failed
        } else if successes == eligible {
            PhaseStatus::Success
        } else if successes > 0 {
            PhaseStatus::Partial
        } else {
            PhaseStatus::Failed
        };
        for outcome in outcomes {
            result.outcomes.push(PhaseOutcome::Reconciled(outcome));
        }
        result.finish(status);
        info!(
            status = ?result.status,
            successes,
            total = result.outcomes.len(),
            "reconciliation finished"
        );
        result
    }

    async fn reconcile_one(&self, instance: &Instance) -> ReconciliationOutcome {
        let session = match self.sessions.get(&instance.landing_zone).await {
            Ok(session) => session,
            Err(err) => {
                return ReconciliationOutcome::failed(
                    &instance.id,
                    RequestedTransition::None,
                    instance.state,
                    format!("session unavailable: {err}"),
                )
            }
        };
        let deadline = Instant::now() + self.config.timeout();

        let requested = match instance.state {
            InstanceState::Stopped => {
                if let Some(outcome) = self.start_and_wait(instance, &session, deadline).await {
                    return outcome;
                }
                RequestedTransition::Start
            }
            InstanceState::Running => RequestedTransition::None,
            observed => {
                warn!(
                    instance = %instance.id,
                    state = %observed,
                    "unexpected state; skipping reconciliation"
                );
                return ReconciliationOutcome::skipped_unexpected_state(&instance.id, observed);
            }
        };

        // The instance is running; the agent still has to answer before it
        // counts as patch-ready.
        match self.await_agent(instance, &session, deadline).await {
            Ok(()) => {
                info!(instance = %instance.id, "instance patch-ready");
                ReconciliationOutcome::ready(&instance.id, requested)
            }
            Err(detail) => {
                warn!(instance = %instance.id, detail = %detail, "agent unreachable");
                let mut outcome = ReconciliationOutcome::agent_unreachable(&instance.id, requested);
                outcome.error = Some(detail);
                outcome
            }
        }
    }

    /// Issue a start and poll until the instance reports running.
    ///
    /// Returns `Some(outcome)` when reconciliation of this instance is over
    /// (start failed or timed out); `None` once the instance is running.
    async fn start_and_wait(
        &self,
        instance: &Instance,
        session: &Session,
        deadline: Instant,
    ) -> Option<ReconciliationOutcome> {
        debug!(instance = %instance.id, "starting stopped instance");
        let policy = RetryPolicy::new(self.config.retry_attempts + 1);
        let started = with_retry(&policy, Some(deadline), |_attempt| {
            let compute = self.compute.clone();
            let session = session.clone();
            let instance_id = instance.id.clone();
            async move { compute.start_instance(&session, &instance_id).await }
        })
        .await;
        if let Err(failure) = started {
            if failure.timed_out {
                return Some(ReconciliationOutcome::start_timed_out(
                    &instance.id,
                    instance.state,
                ));
            }
            let detail = failure
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "start_instance gave no detail".to_string());
            return Some(ReconciliationOutcome::failed(
                &instance.id,
                RequestedTransition::Start,
                instance.state,
                format!("start failed: {detail}"),
            ));
        }

        let mut last_observed = instance.state;
        loop {
            match self
                .compute
                .describe_instance_state(session, &instance.id)
                .await
            {
                Ok(InstanceState::Running) => {
                    debug!(instance = %instance.id, "instance running");
                    return None;
                }
                Ok(observed) => last_observed = observed,
                Err(err) if err.is_retryable() => {}
                Err(err) => {
                    return Some(ReconciliationOutcome::failed(
                        &instance.id,
                        RequestedTransition::Start,
                        last_observed,
                        format!("state polling failed: {err}"),
                    ))
                }
            }
            if Instant::now() >= deadline {
                return Some(ReconciliationOutcome::start_timed_out(
                    &instance.id,
                    last_observed,
                ));
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    /// Poll the agent until it answers online or the deadline passes.
    async fn await_agent(
        &self,
        instance: &Instance,
        session: &Session,
        deadline: Instant,
    ) -> Result<(), String> {
        let polled = poll_until(deadline, self.config.poll_interval(), || {
            let agent = self.agent.clone();
            let session = session.clone();
            let instance_id = instance.id.clone();
            async move {
                match agent.ping(&session, &instance_id).await {
                    Ok(AgentStatus::Online) => Some(Ok(())),
                    Ok(_) => None,
                    Err(err) if err.is_retryable() => None,
                    Err(err) => Some(Err(format!("agent unreachable: {err}"))),
                }
            }
        })
        .await;
        match polled {
            Some(Ok(())) => Ok(()),
            Some(Err(detail)) => Err(detail),
            None => Err("agent unreachable: no online response before timeout".to_string()),
        }
    }
}
