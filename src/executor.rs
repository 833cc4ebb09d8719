use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::apply::{self, ApplyError};
use crate::approval::ApprovalGateway;
use crate::baseline::{self, TestRunner};
use crate::builder::{AgentRunner, AuditVerdict};
use crate::config::AutopackConfig;
use crate::error::ApError;
use crate::fingerprint::failure_fingerprint;
use crate::governance;
use crate::layout::{ArtifactLayout, RuntimeLayout};
use crate::memory::{self, MemoryRetriever};
use crate::pending::{MoveAction, PendingMovesQueue};
use crate::prompt::{self, BuilderPromptParams};
use crate::router::{ModelRouter, QuotaLedger, RouteDecision};
use crate::store::RunStore;
use crate::telemetry::{EventKind, TelemetrySink};
use crate::types::{
    ApprovalDecision, AttemptOutcome, AttemptRecord, FinalizerDecision, FinalizerOutcome,
    HintKind, LearningHint, PatchFormat, PatchProposal, PhaseRecord, RiskAssessment, Role,
    Ruling, StopReason, merge_hints,
};
use crate::{log_info, log_warn};

/// Attempt count from which deep retrieval context is attached.
const DEEP_RETRIEVAL_FROM_ATTEMPT: u32 = 3;
/// Scope size beyond which the Builder is asked for structured edits.
const STRUCTURED_EDITS_FILE_LIMIT: usize = 30;
/// Consecutive identical failure fingerprints before requesting a re-plan.
const REPLAN_FINGERPRINT_REPEATS: usize = 3;

/// Immutable collaborators for phase execution.
pub struct ExecutorEnv<'a, A: AgentRunner, T: TestRunner, M: MemoryRetriever> {
    pub config: &'a AutopackConfig,
    pub agent: &'a A,
    pub tests: &'a T,
    pub memory: &'a M,
    pub quota: &'a dyn QuotaLedger,
    pub telemetry: &'a TelemetrySink,
    pub runtime: &'a RuntimeLayout,
    pub workspace_root: &'a Path,
    pub cancel: &'a CancellationToken,
}

/// State carried across an approval park so the attempt can resume at the
/// apply step without re-running the Builder.
#[derive(Debug, Clone)]
pub struct ResumeState {
    pub attempt_index: u32,
    pub route: RouteDecision,
    /// Absent when resuming a stale approval from a prior process; the
    /// attempt then restarts at the Builder.
    pub proposal: Option<PatchProposal>,
    pub assessment: Option<RiskAssessment>,
    pub approval_id: String,
    pub hints: Vec<LearningHint>,
    pub recent_fingerprints: Vec<String>,
}

/// What one `execute_phase` call produced. The supervisor owns all phase
/// state transitions; the executor only reports.
#[derive(Debug)]
pub enum PhaseExecution {
    Complete(FinalizerDecision),
    Failed { reason: String, fingerprint: String },
    ApprovalPending { approval_id: String, resume: Box<ResumeState> },
    ReplanRequested { reason: String },
    Cancelled,
    Fatal(ApError),
}

struct AttemptFailure {
    outcome: AttemptOutcome,
    reason: String,
    hints: Vec<LearningHint>,
}

/// Execute a phase through its remaining attempts.
///
/// Per-attempt pipeline: preflight → routing → Builder → governance →
/// governed apply → (auditor) → tests → finalizer → retry decision. The
/// executor mutates attempts and phase bookkeeping fields; it never
/// transitions `Phase.state` (the supervisor does).
#[allow(clippy::too_many_arguments)]
pub async fn execute_phase<A: AgentRunner, T: TestRunner, M: MemoryRetriever>(
    env: &ExecutorEnv<'_, A, T, M>,
    store: &mut RunStore,
    gateway: &mut ApprovalGateway,
    phase_id: &str,
    resume: Option<ResumeState>,
) -> PhaseExecution {
    let phase = match store.get_phase(phase_id) {
        Ok(p) => p.clone(),
        Err(e) => return PhaseExecution::Fatal(e),
    };

    // Preflight: a phase without an allowed scope can never produce an
    // in-scope deliverable.
    if phase.scope.allowed_paths.is_empty() {
        return PhaseExecution::Fatal(ApError::Config(format!(
            "phase {} has an empty allowed_paths scope",
            phase.phase_id
        )));
    }

    let mut hints: Vec<LearningHint> = Vec::new();
    let mut recent_fingerprints: Vec<String> = Vec::new();
    let mut attempt_index = phase.attempts_used + 1;
    let mut pending_resume = resume;

    loop {
        if env.cancel.is_cancelled() {
            return PhaseExecution::Cancelled;
        }
        if attempt_index > phase.max_attempts {
            // Exhausted before this call could start another attempt.
            let reason = phase
                .last_failure_reason
                .clone()
                .unwrap_or_else(|| "attempts exhausted".to_string());
            let fp = failure_fingerprint(Some(1), &reason);
            return PhaseExecution::Failed { reason, fingerprint: fp };
        }

        // --- Resume a parked attempt ---
        let mut resumed: Option<(RouteDecision, PatchProposal, RiskAssessment)> = None;
        if let Some(state) = pending_resume.take() {
            hints = state.hints.clone();
            recent_fingerprints = state.recent_fingerprints.clone();
            attempt_index = state.attempt_index;

            let decision = match gateway.poll(&state.approval_id) {
                Ok(d) => d,
                Err(e) => return PhaseExecution::Fatal(e),
            };
            let _ = env.telemetry.emit(
                &phase.run_id,
                Some(phase.phase_id.as_str()),
                None,
                EventKind::Approval,
                serde_json::json!({"approval_id": state.approval_id.as_str(), "decision": format!("{:?}", decision)}),
            );

            match decision {
                ApprovalDecision::Pending => {
                    let approval_id = state.approval_id.clone();
                    return PhaseExecution::ApprovalPending {
                        approval_id,
                        resume: Box::new(state),
                    };
                }
                ApprovalDecision::Approved => {
                    match (state.proposal, state.assessment) {
                        (Some(proposal), Some(assessment)) => {
                            resumed = Some((state.route, proposal, assessment));
                        }
                        // Stale approval with no carried proposal: restart
                        // the attempt from the Builder.
                        _ => {}
                    }
                }
                ApprovalDecision::Denied | ApprovalDecision::TimedOut => {
                    let (outcome, kind) = if decision == ApprovalDecision::Denied {
                        (AttemptOutcome::ApprovalDenied, HintKind::ApprovalDenied)
                    } else {
                        (AttemptOutcome::ApprovalTimeout, HintKind::ApprovalDenied)
                    };
                    let failure = AttemptFailure {
                        outcome,
                        reason: format!("approval {}: {:?}", state.approval_id, decision),
                        hints: vec![LearningHint {
                            kind,
                            from: None,
                            to: None,
                            detail: Some(format!("approval resolved {:?}", decision)),
                        }],
                    };
                    match conclude_failed_attempt(
                        env, store, &phase, attempt_index, &state.route.model_id, failure,
                        &mut hints, &mut recent_fingerprints,
                    ) {
                        ControlFlowStep::Retry => {
                            attempt_index += 1;
                            continue;
                        }
                        ControlFlowStep::Replan(reason) => {
                            return PhaseExecution::ReplanRequested { reason };
                        }
                        ControlFlowStep::Exhausted { reason, fingerprint } => {
                            return PhaseExecution::Failed { reason, fingerprint };
                        }
                    }
                }
            }
        }

        // Preflight: a still-pending approval from a prior attempt parks
        // the phase instead of starting a duplicate attempt.
        if resumed.is_none() {
            if let Some(stale) = gateway.pending_for_phase(&phase.phase_id).first() {
                let approval_id = stale.approval_id.clone();
                log_warn!(
                    "[{}] Pending approval {} from a prior attempt; parking",
                    phase.phase_id,
                    approval_id
                );
                return PhaseExecution::ApprovalPending {
                    approval_id: approval_id.clone(),
                    resume: Box::new(ResumeState {
                        attempt_index,
                        route: RouteDecision {
                            model_id: String::new(),
                            token_budget: 0,
                            escalated: false,
                        },
                        proposal: None,
                        assessment: None,
                        approval_id,
                        hints: hints.clone(),
                        recent_fingerprints: recent_fingerprints.clone(),
                    }),
                };
            }
        }

        // --- Run one attempt ---
        let step = run_attempt(
            env,
            store,
            gateway,
            &phase,
            attempt_index,
            &mut hints,
            &mut recent_fingerprints,
            resumed,
        )
        .await;

        match step {
            AttemptStep::Complete(decision) => return PhaseExecution::Complete(decision),
            AttemptStep::Park { approval_id, resume } => {
                return PhaseExecution::ApprovalPending { approval_id, resume };
            }
            AttemptStep::Cancelled => return PhaseExecution::Cancelled,
            AttemptStep::Fatal(e) => return PhaseExecution::Fatal(e),
            AttemptStep::Retry => {
                attempt_index += 1;
            }
            AttemptStep::Replan(reason) => {
                return PhaseExecution::ReplanRequested { reason };
            }
            AttemptStep::Exhausted { reason, fingerprint } => {
                return PhaseExecution::Failed { reason, fingerprint };
            }
        }
    }
}

enum AttemptStep {
    Complete(FinalizerDecision),
    Park {
        approval_id: String,
        resume: Box<ResumeState>,
    },
    Retry,
    Replan(String),
    Exhausted { reason: String, fingerprint: String },
    Cancelled,
    Fatal(ApError),
}

enum ControlFlowStep {
    Retry,
    Replan(String),
    Exhausted { reason: String, fingerprint: String },
}

#[allow(clippy::too_many_arguments)]
async fn run_attempt<A: AgentRunner, T: TestRunner, M: MemoryRetriever>(
    env: &ExecutorEnv<'_, A, T, M>,
    store: &mut RunStore,
    gateway: &mut ApprovalGateway,
    phase: &PhaseRecord,
    attempt_index: u32,
    hints: &mut Vec<LearningHint>,
    recent_fingerprints: &mut Vec<String>,
    resumed: Option<(RouteDecision, PatchProposal, RiskAssessment)>,
) -> AttemptStep {
    let timeout = Duration::from_secs(env.config.execution.phase_timeout_seconds);
    let approved_by_operator = resumed.is_some();

    // --- Routing ---
    let (route, mut proposal, mut assessment) = match resumed {
        Some((route, proposal, assessment)) => (route, Some(proposal), Some(assessment)),
        None => {
            let router = ModelRouter::new(&env.config.routing, &env.config.budgets, env.quota);
            let route = match router.select(
                phase.category,
                phase.complexity,
                attempt_index,
                Role::Builder,
            ) {
                Ok(r) => r,
                Err(e) => return AttemptStep::Fatal(e),
            };
            let _ = env.telemetry.emit(
                &phase.run_id,
                Some(phase.phase_id.as_str()),
                None,
                EventKind::RoutingDecision,
                serde_json::json!({
                    "model": route.model_id.as_str(),
                    "budget": route.token_budget,
                    "escalated": route.escalated,
                    "attempt": attempt_index,
                }),
            );
            (route, None, None)
        }
    };

    log_info!(
        "[{}][attempt {}/{}] Using model {} (budget {} tokens)",
        phase.phase_id,
        attempt_index,
        phase.max_attempts,
        route.model_id,
        route.token_budget
    );

    // --- Builder (skipped when resuming an approved proposal) ---
    if proposal.is_none() {
        let retrieval = if attempt_index >= DEEP_RETRIEVAL_FROM_ATTEMPT
            && memory::retrieval_enabled(&env.config.memory)
        {
            match env
                .memory
                .retrieve_context(
                    &env.config.project.project_id,
                    &phase.run_id,
                    "builder",
                    env.config.memory.sot_retrieval_max_chars,
                )
                .await
            {
                Ok(snippets) => snippets,
                Err(e) => {
                    // Retrieval is advisory; failures never sink an attempt.
                    log_warn!("[{}] Retrieval failed: {}", phase.phase_id, e);
                    vec![]
                }
            }
        } else {
            vec![]
        };

        let requested_format = if phase.deliverables.len() > STRUCTURED_EDITS_FILE_LIMIT {
            PatchFormat::StructuredEdits
        } else {
            PatchFormat::UnifiedDiff
        };

        match call_builder(
            env, phase, attempt_index, &route, hints, &retrieval, requested_format, timeout,
        )
        .await
        {
            BuilderCall::Proposal(p, tokens) => {
                record_tokens(env, store, phase, tokens);
                proposal = Some(p);
            }
            BuilderCall::Failure(failure, tokens) => {
                record_tokens(env, store, phase, tokens);
                return conclude(
                    env, store, phase, attempt_index, &route.model_id, failure, hints,
                    recent_fingerprints,
                );
            }
            BuilderCall::Cancelled => return AttemptStep::Cancelled,
        }
    }
    let proposal = proposal.expect("proposal set above");

    // --- Risk & governance (skipped when resuming: already assessed) ---
    if assessment.is_none() {
        let outcome = governance::assess(
            &proposal,
            phase,
            &env.config.protection,
            env.workspace_root,
        );
        let _ = env.telemetry.emit(
            &phase.run_id,
            Some(phase.phase_id.as_str()),
            None,
            EventKind::GovernanceDecision,
            serde_json::json!({
                "proposal_id": proposal.proposal_id.as_str(),
                "risk": outcome.assessment.risk_level.to_string(),
                "ruling": format!("{:?}", outcome.ruling),
            }),
        );

        match outcome.ruling {
            Ruling::Reject(reason) => {
                let mut fix_hints = Vec::new();
                for op in &proposal.operations {
                    if !governance::path_in_scope(&op.path, &phase.scope.allowed_paths) {
                        fix_hints.push(LearningHint {
                            kind: HintKind::PathFix,
                            from: Some(op.path.clone()),
                            to: phase.scope.allowed_paths.first().cloned(),
                            detail: None,
                        });
                    }
                }
                let failure = AttemptFailure {
                    outcome: AttemptOutcome::ApplyFail,
                    reason: format!("governance rejected proposal: {}", reason),
                    hints: fix_hints,
                };
                return conclude(
                    env, store, phase, attempt_index, &route.model_id, failure, hints,
                    recent_fingerprints,
                );
            }
            Ruling::RequireApproval => {
                let approval_id = match gateway.open(
                    &phase.phase_id,
                    &proposal.proposal_id,
                    outcome.assessment.risk_level,
                ) {
                    Ok(id) => id,
                    Err(e) => return AttemptStep::Fatal(ApError::Internal(e)),
                };
                let _ = env.telemetry.emit(
                    &phase.run_id,
                    Some(phase.phase_id.as_str()),
                    None,
                    EventKind::Approval,
                    serde_json::json!({"approval_id": approval_id.as_str(), "decision": "PENDING"}),
                );
                // Park without consuming the attempt.
                return AttemptStep::Park {
                    approval_id: approval_id.clone(),
                    resume: Box::new(ResumeState {
                        attempt_index,
                        route,
                        proposal: Some(proposal),
                        assessment: Some(outcome.assessment),
                        approval_id,
                        hints: hints.clone(),
                        recent_fingerprints: recent_fingerprints.clone(),
                    }),
                };
            }
            Ruling::AutoApprove => {
                assessment = Some(outcome.assessment);
            }
        }
    }
    let assessment = assessment.expect("assessment set above");

    // --- Governed apply, under the exclusive workspace lease ---
    let layout = phase_layout(env, phase);
    let save_point_dir = layout.checkpoint_dir(&phase.phase_id);
    let apply_result = {
        let _lease = match crate::lock::acquire_workspace_lease(env.runtime.runtime_dir()) {
            Ok(guard) => guard,
            Err(e) => return AttemptStep::Fatal(ApError::Internal(e)),
        };
        apply::apply(
            &proposal,
            phase,
            &env.config.protection,
            env.workspace_root,
            &save_point_dir,
        )
    };

    let apply_result = match apply_result {
        Ok(result) => result,
        Err(e) => {
            let failure = classify_apply_error(e, phase);
            return conclude(
                env, store, phase, attempt_index, &route.model_id, failure, hints,
                recent_fingerprints,
            );
        }
    };

    // Locked deletes recovered locally: queue them and move on.
    if !apply_result.locked_deletes.is_empty() {
        let queue = PendingMovesQueue::new(env.runtime.pending_moves_file());
        for (path, detail) in &apply_result.locked_deletes {
            let abs = env.workspace_root.join(path);
            if let Err(e) = queue.enqueue(
                &abs.to_string_lossy(),
                "",
                MoveAction::Delete,
                "governed apply delete hit a sharing violation",
                detail,
                0,
                vec![format!("phase:{}", phase.phase_id)],
            ) {
                log_warn!("[{}] Failed to queue locked delete: {}", phase.phase_id, e);
            }
        }
    }

    // --- Auditor (dual audit policies only) ---
    let policy = env.config.routing.policy_for(phase.category);
    if policy.dual_audit {
        let changed: Vec<String> = apply_result
            .changed_files
            .iter()
            .chain(apply_result.added_files.iter())
            .chain(apply_result.deleted_files.iter())
            .cloned()
            .collect();
        match run_auditor(env, store, phase, attempt_index, &changed, timeout).await {
            AuditorCall::Approve => {}
            AuditorCall::Block(findings) => {
                if env.config.finalizer.rollback_on_block {
                    if let Err(e) = apply::rollback(&save_point_dir, env.workspace_root) {
                        return AttemptStep::Fatal(ApError::Internal(e));
                    }
                }
                let failure = AttemptFailure {
                    outcome: AttemptOutcome::QualityBlock,
                    reason: format!("auditor blocked: {}", findings.join("; ")),
                    hints: vec![],
                };
                return conclude(
                    env, store, phase, attempt_index, &route.model_id, failure, hints,
                    recent_fingerprints,
                );
            }
            AuditorCall::Cancelled => return AttemptStep::Cancelled,
        }
    }

    // --- Tests ---
    let baseline = match baseline::ensure_baseline(store, &phase.run_id, env.tests).await {
        Ok(b) => b,
        Err(e) => return AttemptStep::Fatal(ApError::Internal(e)),
    };
    let delta = tokio::select! {
        result = baseline::compute_delta(env.tests, &baseline) => match result {
            Ok(d) => d,
            Err(e) => return AttemptStep::Fatal(ApError::Internal(e)),
        },
        _ = env.cancel.cancelled() => return AttemptStep::Cancelled,
    };
    if !delta.flaky_excluded.is_empty() {
        log_info!(
            "[{}] Excluded {} flaky failure(s) after retry",
            phase.phase_id,
            delta.flaky_excluded.len()
        );
    }

    // --- Finalize ---
    let attempt_id = format!("{}.a{}", phase.phase_id, attempt_index);
    let decision = crate::finalizer::finalize(
        &crate::finalizer::FinalizerInputs {
            phase,
            attempt_id: &attempt_id,
            new_failures: &delta.new_failures,
            risk: &assessment,
            approved: approved_by_operator,
            coverage_delta: None,
            workspace_root: env.workspace_root,
            attempts_remaining: attempt_index < phase.max_attempts,
        },
        &env.config.finalizer,
    );

    write_proof(env, phase, &decision);
    let _ = env.telemetry.emit(
        &phase.run_id,
        Some(phase.phase_id.as_str()),
        Some(attempt_id.as_str()),
        EventKind::PhaseOutcome,
        serde_json::json!({"outcome": format!("{:?}", decision.outcome), "attempt": attempt_index}),
    );

    match decision.outcome {
        FinalizerOutcome::Complete => {
            record_attempt(
                store, phase, attempt_index, &route.model_id, AttemptOutcome::Ok, None,
            );
            let _ = store.update_phase(&phase.phase_id, |p| {
                p.attempts_used = attempt_index;
                p.last_failure_reason = None;
            });
            AttemptStep::Complete(decision)
        }
        FinalizerOutcome::Blocked | FinalizerOutcome::Failed => {
            if env.config.finalizer.rollback_on_block {
                if let Err(e) = apply::rollback(&save_point_dir, env.workspace_root) {
                    return AttemptStep::Fatal(ApError::Internal(e));
                }
            }
            let failure = AttemptFailure {
                outcome: outcome_for_gates(&decision),
                reason: decision.reasons.join("; "),
                hints: hints_for_gates(&decision),
            };
            conclude(
                env, store, phase, attempt_index, &route.model_id, failure, hints,
                recent_fingerprints,
            )
        }
    }
}

// --- Builder invocation with continuation recovery ---

enum BuilderCall {
    Proposal(PatchProposal, u64),
    Failure(AttemptFailure, u64),
    Cancelled,
}

#[allow(clippy::too_many_arguments)]
async fn call_builder<A: AgentRunner, T: TestRunner, M: MemoryRetriever>(
    env: &ExecutorEnv<'_, A, T, M>,
    phase: &PhaseRecord,
    attempt_index: u32,
    route: &RouteDecision,
    hints: &[LearningHint],
    retrieval: &[crate::memory::Snippet],
    requested_format: PatchFormat,
    timeout: Duration,
) -> BuilderCall {
    let reply_path = phase_layout(env, phase).builder_reply(&phase.phase_id, attempt_index);
    let mut unfinished: Vec<String> = Vec::new();
    let mut format = requested_format;
    let mut tokens_total = 0u64;

    // One continuation pass after a truncated reply; a second truncation
    // fails the attempt.
    for pass in 0..2 {
        let params = BuilderPromptParams {
            phase,
            attempt_index,
            token_budget: route.token_budget,
            reply_path: &reply_path,
            hints,
            retrieval,
            format,
            unfinished_deliverables: &unfinished,
        };
        let built_prompt = prompt::build_builder_prompt(&params);

        let reply = tokio::select! {
            result = env.agent.run_agent(&built_prompt, &route.model_id, &reply_path, timeout) => result,
            _ = env.cancel.cancelled() => return BuilderCall::Cancelled,
        };

        let reply = match reply {
            Ok(r) => r,
            Err(e) => {
                return BuilderCall::Failure(
                    AttemptFailure {
                        outcome: AttemptOutcome::BuilderFail,
                        reason: format!("builder call failed: {}", e),
                        hints: vec![],
                    },
                    tokens_total,
                );
            }
        };
        tokens_total += reply.tokens_in + reply.tokens_out;

        if reply.stop_reason == StopReason::MaxTokens {
            let declared: std::collections::BTreeSet<String> = reply
                .proposal
                .as_ref()
                .map(|p| p.declared_deliverables.iter().cloned().collect())
                .unwrap_or_default();
            unfinished = phase
                .deliverables
                .iter()
                .filter(|d| !declared.contains(*d))
                .cloned()
                .collect();
            format = PatchFormat::StructuredEdits;

            if pass == 0 {
                log_warn!(
                    "[{}] Builder reply truncated; continuation over {} deliverable(s)",
                    phase.phase_id,
                    unfinished.len()
                );
                continue;
            }
            return BuilderCall::Failure(
                AttemptFailure {
                    outcome: AttemptOutcome::Truncated,
                    reason: "builder reply truncated twice".to_string(),
                    hints: vec![LearningHint {
                        kind: HintKind::Truncation,
                        from: None,
                        to: None,
                        detail: Some(format!(
                            "{} deliverables unfinished at token budget {}",
                            unfinished.len(),
                            route.token_budget
                        )),
                    }],
                },
                tokens_total,
            );
        }

        match reply.proposal {
            Some(p) => return BuilderCall::Proposal(p, tokens_total),
            None => {
                return BuilderCall::Failure(
                    AttemptFailure {
                        outcome: AttemptOutcome::BuilderFail,
                        reason: "builder reply carried no proposal".to_string(),
                        hints: vec![],
                    },
                    tokens_total,
                );
            }
        }
    }

    unreachable!("builder loop returns within two passes")
}

enum AuditorCall {
    Approve,
    Block(Vec<String>),
    Cancelled,
}

async fn run_auditor<A: AgentRunner, T: TestRunner, M: MemoryRetriever>(
    env: &ExecutorEnv<'_, A, T, M>,
    store: &mut RunStore,
    phase: &PhaseRecord,
    attempt_index: u32,
    changed_files: &[String],
    timeout: Duration,
) -> AuditorCall {
    let router = ModelRouter::new(&env.config.routing, &env.config.budgets, env.quota);
    let route = match router.select(
        phase.category,
        phase.complexity,
        attempt_index,
        Role::Auditor,
    ) {
        Ok(r) => r,
        Err(e) => {
            // Quota exhaustion on the auditor tier blocks the same way.
            log_warn!("[{}] Auditor routing failed: {}", phase.phase_id, e);
            return AuditorCall::Block(vec![e.to_string()]);
        }
    };

    let reply_path = phase_layout(env, phase)
        .diagnostics_dir(&phase.phase_id)
        .join(format!("audit_{}.json", attempt_index));
    let audit_prompt = prompt::build_auditor_prompt(phase, changed_files, &reply_path);

    let reply = tokio::select! {
        result = env.agent.run_agent(&audit_prompt, &route.model_id, &reply_path, timeout) => result,
        _ = env.cancel.cancelled() => return AuditorCall::Cancelled,
    };

    match reply {
        Ok(reply) => {
            record_tokens(env, store, phase, reply.tokens_in + reply.tokens_out);
            let attempt_id = format!("{}.a{}.audit", phase.phase_id, attempt_index);
            let _ = store.append_attempt(AttemptRecord {
                attempt_id,
                phase_id: phase.phase_id.clone(),
                attempt_index,
                role: Role::Auditor,
                model_id: route.model_id.clone(),
                started_at: Utc::now(),
                finished_at: Some(Utc::now()),
                outcome: AttemptOutcome::Ok,
                tokens_in: reply.tokens_in,
                tokens_out: reply.tokens_out,
                error_digest: None,
            });
            match reply.audit {
                Some(report) if report.verdict == AuditVerdict::Block => {
                    AuditorCall::Block(report.findings)
                }
                Some(_) => AuditorCall::Approve,
                // An auditor that says nothing does not approve anything.
                None => AuditorCall::Block(vec!["auditor returned no verdict".to_string()]),
            }
        }
        Err(e) => AuditorCall::Block(vec![format!("auditor call failed: {}", e)]),
    }
}

// --- Attempt bookkeeping ---

fn classify_apply_error(e: ApplyError, phase: &PhaseRecord) -> AttemptFailure {
    match e {
        ApplyError::ProtectedPath(path) | ApplyError::OutsideScope(path) => AttemptFailure {
            outcome: AttemptOutcome::ApplyFail,
            reason: format!("apply refused: {}", path),
            hints: vec![LearningHint {
                kind: HintKind::PathFix,
                from: Some(path),
                to: phase.scope.allowed_paths.first().cloned(),
                detail: None,
            }],
        },
        ApplyError::SymbolLost { path, symbol } => AttemptFailure {
            outcome: AttemptOutcome::SymbolFail,
            reason: format!("symbol {} lost from {}", symbol, path),
            hints: vec![LearningHint {
                kind: HintKind::SymbolLost,
                from: Some(path),
                to: None,
                detail: Some(symbol),
            }],
        },
        ApplyError::MergeConflict { path, reason } => AttemptFailure {
            outcome: AttemptOutcome::ApplyFail,
            reason: format!("merge conflict in {}: {}", path, reason),
            hints: vec![],
        },
        ApplyError::IoLocked { path, action, detail } => AttemptFailure {
            outcome: AttemptOutcome::ApplyFail,
            reason: format!("{} of {} blocked by lock: {}", action, path, detail),
            hints: vec![],
        },
        ApplyError::Io(detail) => AttemptFailure {
            outcome: AttemptOutcome::ApplyFail,
            reason: detail,
            hints: vec![],
        },
    }
}

fn outcome_for_gates(decision: &FinalizerDecision) -> AttemptOutcome {
    if !decision.gate0_ci.passed {
        AttemptOutcome::TestRegression
    } else if !decision.gate1_quality.passed {
        AttemptOutcome::QualityBlock
    } else if !decision.gate2_deliverables.passed {
        AttemptOutcome::DeliverablesFail
    } else {
        AttemptOutcome::SymbolFail
    }
}

fn hints_for_gates(decision: &FinalizerDecision) -> Vec<LearningHint> {
    let mut hints = Vec::new();
    for reason in &decision.gate0_ci.reasons {
        hints.push(LearningHint {
            kind: HintKind::TestRegression,
            from: None,
            to: None,
            detail: Some(reason.clone()),
        });
    }
    for reason in &decision.gate2_deliverables.reasons {
        hints.push(LearningHint {
            kind: HintKind::DeliverableMissing,
            from: None,
            to: None,
            detail: Some(reason.clone()),
        });
    }
    for reason in &decision.gate3_symbols.reasons {
        hints.push(LearningHint {
            kind: HintKind::SymbolLost,
            from: None,
            to: None,
            detail: Some(reason.clone()),
        });
    }
    hints
}

fn record_tokens<A: AgentRunner, T: TestRunner, M: MemoryRetriever>(
    env: &ExecutorEnv<'_, A, T, M>,
    store: &mut RunStore,
    phase: &PhaseRecord,
    tokens: u64,
) {
    if tokens == 0 {
        return;
    }
    let _ = store.add_run_tokens(&phase.run_id, tokens);
    let _ = env.telemetry.emit(
        &phase.run_id,
        Some(phase.phase_id.as_str()),
        None,
        EventKind::TokenUsage,
        serde_json::json!({"tokens": tokens}),
    );
}

fn record_attempt(
    store: &mut RunStore,
    phase: &PhaseRecord,
    attempt_index: u32,
    model_id: &str,
    outcome: AttemptOutcome,
    error_digest: Option<String>,
) {
    let attempt = AttemptRecord {
        attempt_id: format!("{}.a{}", phase.phase_id, attempt_index),
        phase_id: phase.phase_id.clone(),
        attempt_index,
        role: Role::Builder,
        model_id: model_id.to_string(),
        started_at: Utc::now(),
        finished_at: Some(Utc::now()),
        outcome,
        tokens_in: 0,
        tokens_out: 0,
        error_digest,
    };
    if let Err(e) = store.append_attempt(attempt) {
        log_warn!("[{}] Failed to record attempt: {}", phase.phase_id, e);
    }
}

/// Shared post-failure bookkeeping: record the attempt, fold in hints,
/// track fingerprint repeats, and decide retry / re-plan / exhaustion.
#[allow(clippy::too_many_arguments)]
fn conclude_failed_attempt<A: AgentRunner, T: TestRunner, M: MemoryRetriever>(
    env: &ExecutorEnv<'_, A, T, M>,
    store: &mut RunStore,
    phase: &PhaseRecord,
    attempt_index: u32,
    model_id: &str,
    failure: AttemptFailure,
    hints: &mut Vec<LearningHint>,
    recent_fingerprints: &mut Vec<String>,
) -> ControlFlowStep {
    log_info!(
        "[{}][attempt {}/{}] {}: {}",
        phase.phase_id,
        attempt_index,
        phase.max_attempts,
        failure.outcome,
        failure.reason
    );

    record_attempt(
        store,
        phase,
        attempt_index,
        model_id,
        failure.outcome,
        Some(truncate_digest(&failure.reason)),
    );

    let fingerprint = failure_fingerprint(Some(1), &failure.reason);
    recent_fingerprints.push(fingerprint.clone());
    merge_hints(hints, failure.hints);

    let _ = store.update_phase(&phase.phase_id, |p| {
        p.attempts_used = attempt_index;
        p.last_failure_reason = Some(failure.reason.clone());
        p.last_fingerprint = Some(fingerprint.clone());
    });
    let attempt_id = format!("{}.a{}", phase.phase_id, attempt_index);
    let _ = env.telemetry.emit(
        &phase.run_id,
        Some(phase.phase_id.as_str()),
        Some(attempt_id.as_str()),
        EventKind::PhaseOutcome,
        serde_json::json!({"outcome": failure.outcome.to_string(), "attempt": attempt_index}),
    );

    let repeats = recent_fingerprints
        .iter()
        .rev()
        .take_while(|fp| **fp == fingerprint)
        .count();

    if attempt_index >= phase.max_attempts {
        ControlFlowStep::Exhausted {
            reason: failure.reason,
            fingerprint,
        }
    } else if repeats >= REPLAN_FINGERPRINT_REPEATS {
        ControlFlowStep::Replan(format!(
            "{} consecutive failures with fingerprint {}",
            repeats, fingerprint
        ))
    } else {
        ControlFlowStep::Retry
    }
}

#[allow(clippy::too_many_arguments)]
fn conclude<A: AgentRunner, T: TestRunner, M: MemoryRetriever>(
    env: &ExecutorEnv<'_, A, T, M>,
    store: &mut RunStore,
    phase: &PhaseRecord,
    attempt_index: u32,
    model_id: &str,
    failure: AttemptFailure,
    hints: &mut Vec<LearningHint>,
    recent_fingerprints: &mut Vec<String>,
) -> AttemptStep {
    match conclude_failed_attempt(
        env,
        store,
        phase,
        attempt_index,
        model_id,
        failure,
        hints,
        recent_fingerprints,
    ) {
        ControlFlowStep::Retry => AttemptStep::Retry,
        ControlFlowStep::Replan(reason) => AttemptStep::Replan(reason),
        ControlFlowStep::Exhausted { reason, fingerprint } => {
            AttemptStep::Exhausted { reason, fingerprint }
        }
    }
}

fn truncate_digest(reason: &str) -> String {
    reason.chars().take(160).collect()
}

/// Run-scoped artifact layout for a phase. Derived per call so one
/// executor environment serves phases of different runs (drain mode).
fn phase_layout<A: AgentRunner, T: TestRunner, M: MemoryRetriever>(
    env: &ExecutorEnv<'_, A, T, M>,
    phase: &PhaseRecord,
) -> ArtifactLayout {
    ArtifactLayout::new(env.workspace_root, &env.config.project.family, &phase.run_id)
}

fn write_proof<A: AgentRunner, T: TestRunner, M: MemoryRetriever>(
    env: &ExecutorEnv<'_, A, T, M>,
    phase: &PhaseRecord,
    decision: &FinalizerDecision,
) {
    let path = phase_layout(env, phase).proof(&phase.phase_id);
    if let Some(dir) = path.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    match serde_json::to_string_pretty(decision) {
        Ok(json) => {
            if let Err(e) = std::fs::write(&path, json) {
                log_warn!("[{}] Failed to write proof: {}", phase.phase_id, e);
            }
        }
        Err(e) => log_warn!("[{}] Failed to serialize proof: {}", phase.phase_id, e),
    }
}
