use std::collections::HashSet;

use crate::approval::{poll_backoff, ApprovalGateway};
use crate::baseline::TestRunner;
use crate::builder::AgentRunner;
use crate::error::ApError;
use crate::executor::{execute_phase, ExecutorEnv, PhaseExecution, ResumeState};
use crate::memory::MemoryRetriever;
use crate::store::RunStore;
use crate::types::{PhaseState, RunState};
use crate::{log_error, log_info, log_warn};

/// Control-plane surface the supervisor consumes at startup: the health
/// endpoint's storage-identity fingerprint.
pub trait ControlPlane: Send + Sync {
    fn health_identity(
        &self,
    ) -> impl std::future::Future<Output = Result<String, String>> + Send;
}

/// Local mode: no control plane; the guardrail trivially holds.
pub struct LocalControlPlane;

impl ControlPlane for LocalControlPlane {
    async fn health_identity(&self) -> Result<String, String> {
        Err("no control plane configured".to_string())
    }
}

/// Fixed identity, for tests and static deployments.
pub struct StaticControlPlane {
    pub identity: String,
}

impl ControlPlane for StaticControlPlane {
    async fn health_identity(&self) -> Result<String, String> {
        Ok(self.identity.clone())
    }
}

/// Callbacks exposed to the control plane. All default to no-ops.
pub trait RunCallbacks: Send + Sync {
    fn on_phase_start(&self, _run_id: &str, _phase_id: &str) {}
    fn on_phase_done(&self, _run_id: &str, _phase_id: &str, _state: PhaseState) {}
    fn on_approval_requested(&self, _run_id: &str, _phase_id: &str, _approval_id: &str) {}
    fn on_run_finished(&self, _run_id: &str, _state: RunState) {}
}

pub struct NoopCallbacks;

impl RunCallbacks for NoopCallbacks {}

#[derive(Debug, PartialEq, Eq)]
pub enum HaltReason {
    AllPhasesSettled,
    Cancelled,
    FatalError,
}

/// End-of-run summary for operator display.
#[derive(Debug)]
pub struct RunSummary {
    pub phases_executed: u32,
    pub phases_completed: Vec<String>,
    pub phases_failed: Vec<String>,
    pub tokens_used: u64,
    pub halt_reason: HaltReason,
}

/// Own a run's lifecycle end to end.
///
/// The supervisor is the single writer of `Run.state` and `Phase.state`:
/// it acquires the per-run advisory lock (a second writer is fatal), checks
/// the storage-identity guardrail, then iterates phases in `phase_index`
/// order, reacting to approval parks by polling the gateway with capped
/// backoff.
#[allow(clippy::too_many_arguments)]
pub async fn supervise_run<A, T, M, C, CB>(
    env: &ExecutorEnv<'_, A, T, M>,
    store: &mut RunStore,
    gateway: &mut ApprovalGateway,
    control_plane: &C,
    callbacks: &CB,
    run_id: &str,
) -> Result<RunSummary, ApError>
where
    A: AgentRunner,
    T: TestRunner,
    M: MemoryRetriever,
    C: ControlPlane,
    CB: RunCallbacks,
{
    let _run_lock = crate::lock::acquire_run_lock(env.runtime.runtime_dir(), run_id)
        .map_err(|_| ApError::ConflictingWriter(run_id.to_string()))?;

    // Storage-identity guardrail: refuse to run against a store the control
    // plane is not looking at.
    match control_plane.health_identity().await {
        Ok(api_identity) => {
            let local = store.health_fingerprint();
            if api_identity != local {
                let err = ApError::StorageDrift {
                    executor: local,
                    api: api_identity,
                };
                log_error!("{}", err);
                return Err(err);
            }
        }
        Err(e) => {
            log_warn!("Control plane identity unavailable ({}); continuing standalone", e);
        }
    }

    if store.get_run(run_id)?.state == RunState::Queued {
        store.update_run_state(run_id, RunState::Executing)?;
    }

    let mut summary = RunSummary {
        phases_executed: 0,
        phases_completed: Vec::new(),
        phases_failed: Vec::new(),
        tokens_used: 0,
        halt_reason: HaltReason::AllPhasesSettled,
    };
    let mut replanned: HashSet<String> = HashSet::new();

    loop {
        if env.cancel.is_cancelled() || crate::builder::is_shutdown_requested() {
            store.update_run_state(run_id, RunState::DoneAborted)?;
            callbacks.on_run_finished(run_id, RunState::DoneAborted);
            summary.halt_reason = HaltReason::Cancelled;
            summary.tokens_used = store.get_run(run_id)?.tokens_used;
            return Ok(summary);
        }

        let Some(phase) = store.next_queued_phase(run_id) else {
            break;
        };
        let phase_id = phase.phase_id.clone();

        log_info!(
            "[{}] Starting phase {} (index {})",
            run_id,
            phase_id,
            phase.phase_index
        );
        store.transition_phase(&phase_id, PhaseState::Executing)?;
        callbacks.on_phase_start(run_id, &phase_id);
        summary.phases_executed += 1;

        let mut resume: Option<ResumeState> = None;
        let terminal_state = loop {
            let outcome =
                execute_phase(env, store, gateway, &phase_id, resume.take()).await;
            match outcome {
                PhaseExecution::Complete(_) => {
                    store.transition_phase(&phase_id, PhaseState::Complete)?;
                    summary.phases_completed.push(phase_id.clone());
                    break PhaseState::Complete;
                }
                PhaseExecution::Failed { reason, fingerprint } => {
                    log_warn!("[{}] Phase {} failed: {}", run_id, phase_id, reason);
                    store.update_phase(&phase_id, |p| {
                        p.last_failure_reason = Some(reason.clone());
                        p.last_fingerprint = Some(fingerprint.clone());
                    })?;
                    store.transition_phase(&phase_id, PhaseState::Failed)?;
                    summary.phases_failed.push(phase_id.clone());
                    break PhaseState::Failed;
                }
                PhaseExecution::ApprovalPending { approval_id, resume: parked } => {
                    store.transition_phase(&phase_id, PhaseState::ApprovalPending)?;
                    callbacks.on_approval_requested(run_id, &phase_id, &approval_id);

                    let decided = wait_for_decision(env, gateway, &approval_id).await;
                    if !decided {
                        // Cancelled while waiting.
                        store.transition_phase(&phase_id, PhaseState::Executing)?;
                        store.update_run_state(run_id, RunState::DoneAborted)?;
                        callbacks.on_run_finished(run_id, RunState::DoneAborted);
                        summary.halt_reason = HaltReason::Cancelled;
                        summary.tokens_used = store.get_run(run_id)?.tokens_used;
                        return Ok(summary);
                    }

                    store.transition_phase(&phase_id, PhaseState::Executing)?;
                    resume = Some(*parked);
                }
                PhaseExecution::ReplanRequested { reason } => {
                    if replanned.contains(&phase_id) {
                        // One re-plan per phase; a second request fails it.
                        log_warn!(
                            "[{}] Phase {} requested a second re-plan; failing",
                            run_id,
                            phase_id
                        );
                        store.transition_phase(&phase_id, PhaseState::Failed)?;
                        summary.phases_failed.push(phase_id.clone());
                        break PhaseState::Failed;
                    }
                    log_info!("[{}] Phase {} re-plan: {}", run_id, phase_id, reason);
                    replanned.insert(phase_id.clone());
                    store.transition_phase(&phase_id, PhaseState::ReplanRequested)?;
                    store.update_phase(&phase_id, |p| {
                        p.attempts_used = 0;
                        p.last_failure_reason = Some(reason.clone());
                    })?;
                    store.transition_phase(&phase_id, PhaseState::Queued)?;
                    break PhaseState::Queued;
                }
                PhaseExecution::Cancelled => {
                    store.update_run_state(run_id, RunState::DoneAborted)?;
                    callbacks.on_run_finished(run_id, RunState::DoneAborted);
                    summary.halt_reason = HaltReason::Cancelled;
                    summary.tokens_used = store.get_run(run_id)?.tokens_used;
                    return Ok(summary);
                }
                PhaseExecution::Fatal(e) => {
                    log_error!("[{}] Fatal during phase {}: {}", run_id, phase_id, e);
                    store.update_run_state(run_id, RunState::DoneFailed)?;
                    callbacks.on_run_finished(run_id, RunState::DoneFailed);
                    summary.halt_reason = HaltReason::FatalError;
                    return Err(e);
                }
            }
        };

        if terminal_state != PhaseState::Queued {
            callbacks.on_phase_done(run_id, &phase_id, terminal_state);
        }
    }

    let final_state = if summary.phases_failed.is_empty() {
        RunState::DoneSuccess
    } else {
        RunState::DoneFailed
    };
    store.update_run_state(run_id, final_state)?;
    callbacks.on_run_finished(run_id, final_state);
    summary.tokens_used = store.get_run(run_id)?.tokens_used;

    log_info!(
        "[{}] Run finished: {:?} ({} completed, {} failed)",
        run_id,
        final_state,
        summary.phases_completed.len(),
        summary.phases_failed.len()
    );
    Ok(summary)
}

/// Poll the gateway until the approval reaches a terminal decision.
/// Returns false if cancelled while waiting.
async fn wait_for_decision<A, T, M>(
    env: &ExecutorEnv<'_, A, T, M>,
    gateway: &mut ApprovalGateway,
    approval_id: &str,
) -> bool
where
    A: AgentRunner,
    T: TestRunner,
    M: MemoryRetriever,
{
    let seed = approval_id
        .bytes()
        .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
    let mut poll_count = 0u32;
    loop {
        match gateway.poll(approval_id) {
            Ok(decision) if decision.is_terminal() => return true,
            Ok(_) => {}
            Err(_) => return true,
        }
        let delay = poll_backoff(poll_count, seed);
        poll_count = poll_count.saturating_add(1);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = env.cancel.cancelled() => return false,
        }
    }
}
