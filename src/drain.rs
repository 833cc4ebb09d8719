use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::approval::ApprovalGateway;
use crate::baseline::TestRunner;
use crate::builder::AgentRunner;
use crate::config::DrainConfig;
use crate::error::ApError;
use crate::executor::{execute_phase, ExecutorEnv, PhaseExecution};
use crate::memory::MemoryRetriever;
use crate::store::{FailedPhaseFilter, RunStore};
use crate::telemetry::yield_per_minute;
use crate::types::{PhaseRecord, PhaseState};
use crate::{log_info, log_warn};

// --- Session model ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DrainLimits {
    pub phase_timeout_seconds: u64,
    pub max_total_minutes: u64,
    pub max_timeouts_per_run: u32,
    pub max_attempts_per_phase: u32,
    pub max_fingerprint_repeats: u32,
    pub max_consecutive_zero_yield: u32,
}

impl DrainLimits {
    pub fn from_config(config: &DrainConfig) -> Self {
        DrainLimits {
            phase_timeout_seconds: config.phase_timeout_seconds,
            max_total_minutes: config.max_total_minutes,
            max_timeouts_per_run: config.max_timeouts_per_run,
            max_attempts_per_phase: config.max_attempts_per_phase,
            max_fingerprint_repeats: config.max_fingerprint_repeats,
            max_consecutive_zero_yield: config.max_consecutive_zero_yield,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DrainResult {
    pub run_id: String,
    pub phase_id: String,
    pub final_state: PhaseState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subprocess_returncode: Option<i32>,
    pub duration_s: f64,
    pub telemetry_events_collected: u64,
    pub telemetry_yield_per_minute: f64,
    pub fingerprint: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DrainSession {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub batch_size: u32,
    pub limits: DrainLimits,
    #[serde(default)]
    pub results: Vec<DrainResult>,
    #[serde(default)]
    pub fingerprint_counts: HashMap<String, u32>,
    #[serde(default)]
    pub stopped_runs: BTreeSet<String>,
    #[serde(default)]
    pub stopped_fingerprints: BTreeSet<String>,
    #[serde(default)]
    pub sampled_runs: BTreeSet<String>,
    #[serde(default)]
    pub timeouts_per_run: HashMap<String, u32>,
    #[serde(default)]
    pub consecutive_zero_yield: u32,
}

impl DrainSession {
    pub fn new(session_id: &str, batch_size: u32, limits: DrainLimits) -> Self {
        DrainSession {
            session_id: session_id.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            batch_size,
            limits,
            results: Vec::new(),
            fingerprint_counts: HashMap::new(),
            stopped_runs: BTreeSet::new(),
            stopped_fingerprints: BTreeSet::new(),
            sampled_runs: BTreeSet::new(),
            timeouts_per_run: HashMap::new(),
            consecutive_zero_yield: 0,
        }
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        serde_json::from_str(&contents)
            .map_err(|e| format!("Corrupt drain session {}: {}", path.display(), e))
    }

    pub fn save(&self, path: &Path) -> Result<(), String> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| format!("Failed to create {}: {}", dir.display(), e))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize drain session: {}", e))?;
        std::fs::write(path, json)
            .map_err(|e| format!("Failed to write {}: {}", path.display(), e))
    }
}

// --- Yield classification ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YieldClass {
    ReachedLlm,
    FailedPreflight,
    NoBoundary,
    Disabled,
    LostInFlush,
}

impl std::fmt::Display for YieldClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            YieldClass::ReachedLlm => "REACHED_LLM",
            YieldClass::FailedPreflight => "FAILED_PREFLIGHT",
            YieldClass::NoBoundary => "NO_BOUNDARY",
            YieldClass::Disabled => "DISABLED",
            YieldClass::LostInFlush => "LOST_IN_FLUSH",
        };
        write!(f, "{}", s)
    }
}

pub fn classify_yield(
    events_collected: u64,
    duration_s: f64,
    timed_out: bool,
    telemetry_enabled: bool,
) -> YieldClass {
    if !telemetry_enabled {
        YieldClass::Disabled
    } else if events_collected > 0 {
        YieldClass::ReachedLlm
    } else if duration_s < 5.0 {
        YieldClass::FailedPreflight
    } else if timed_out {
        YieldClass::NoBoundary
    } else {
        YieldClass::LostInFlush
    }
}

// --- Candidate selection (pure) ---

/// Selection priority, highest first (lowest number first): unknown
/// failures, then collection/import errors, missing deliverables, patch or
/// no-op errors, other failures, and timeouts last.
pub fn failure_priority(phase: &PhaseRecord) -> u8 {
    let reason = match &phase.last_failure_reason {
        Some(r) if !r.trim().is_empty() => r.to_lowercase(),
        _ => return 0,
    };
    if reason.contains("timed out") || reason.contains("timeout") {
        5
    } else if reason.contains("import") || reason.contains("collect") {
        1
    } else if reason.contains("deliverable") || reason.contains("missing") {
        2
    } else if reason.contains("no proposal")
        || reason.contains("merge conflict")
        || reason.contains("patch")
        || reason.contains("no-op")
    {
        3
    } else {
        4
    }
}

/// Order failed phases for draining, excluding stopped runs and stopped
/// fingerprints. Within a priority bucket, lower `phase_index` first.
pub fn select_candidates(failed: &[PhaseRecord], session: &DrainSession) -> Vec<PhaseRecord> {
    let mut candidates: Vec<PhaseRecord> = failed
        .iter()
        .filter(|p| !session.stopped_runs.contains(&p.run_id))
        .filter(|p| {
            p.last_fingerprint
                .as_deref()
                .map(|fp| !session.stopped_fingerprints.contains(fp))
                .unwrap_or(true)
        })
        .cloned()
        .collect();
    candidates.sort_by(|a, b| {
        (failure_priority(a), a.phase_index, &a.run_id)
            .cmp(&(failure_priority(b), b.phase_index, &b.run_id))
    });
    candidates
}

// --- Session accounting (pure) ---

/// Fold one result into the session, applying fingerprint and timeout stop
/// rules and the sample-first triage verdict.
pub fn apply_result(session: &mut DrainSession, result: DrainResult, timed_out: bool) {
    let run_id = result.run_id.clone();
    let fingerprint = result.fingerprint.clone();
    let succeeded = result.final_state == PhaseState::Complete;
    let zero_yield = result.telemetry_events_collected == 0;

    if !fingerprint.is_empty() && !succeeded {
        let count = session
            .fingerprint_counts
            .entry(fingerprint.clone())
            .or_insert(0);
        *count += 1;
        if *count >= session.limits.max_fingerprint_repeats {
            session.stopped_fingerprints.insert(fingerprint.clone());
        }
    }

    if timed_out {
        let timeouts = session.timeouts_per_run.entry(run_id.clone()).or_insert(0);
        *timeouts += 1;
        if *timeouts >= session.limits.max_timeouts_per_run {
            session.stopped_runs.insert(run_id.clone());
        }
    }

    if zero_yield && !succeeded {
        session.consecutive_zero_yield += 1;
    } else {
        session.consecutive_zero_yield = 0;
    }

    // Sample-first triage: the first phase drained for a run this session
    // is its sample. Promising = success, any telemetry yield, or a timeout
    // (which at least shows forward progress). A repeating fingerprint with
    // zero yield deprioritizes the whole run.
    if !session.sampled_runs.contains(&run_id) {
        session.sampled_runs.insert(run_id.clone());
        let promising = succeeded || result.telemetry_yield_per_minute > 0.0 || timed_out;
        if !promising {
            let repeats = session
                .fingerprint_counts
                .get(&fingerprint)
                .copied()
                .unwrap_or(0);
            if repeats >= 2 && zero_yield {
                log_info!(
                    "[drain] Sample for run {} not promising; deprioritizing run",
                    run_id
                );
                session.stopped_runs.insert(run_id);
            }
        }
    }

    session.results.push(result);
}

// --- Controller ---

#[derive(Debug, PartialEq, Eq)]
pub enum DrainHalt {
    BatchComplete,
    NoCandidates,
    TotalTimeExceeded,
    ZeroYieldStreak,
    Cancelled,
}

/// Replay failed phases under session-wide budgets.
///
/// Safety invariant: at most one phase of a run is QUEUED at any moment;
/// the controller requeues a single candidate, executes it to rest, and
/// only then selects again.
#[allow(clippy::too_many_arguments)]
pub async fn run_drain<A, T, M>(
    env: &ExecutorEnv<'_, A, T, M>,
    store: &mut RunStore,
    gateway: &mut ApprovalGateway,
    session: &mut DrainSession,
    session_path: &Path,
) -> Result<DrainHalt, ApError>
where
    A: AgentRunner,
    T: TestRunner,
    M: MemoryRetriever,
{
    let wall_start = Instant::now();
    let mut executed = 0u32;

    let halt = loop {
        if env.cancel.is_cancelled() || crate::builder::is_shutdown_requested() {
            break DrainHalt::Cancelled;
        }
        if executed >= session.batch_size {
            break DrainHalt::BatchComplete;
        }
        if wall_start.elapsed() >= Duration::from_secs(session.limits.max_total_minutes * 60) {
            break DrainHalt::TotalTimeExceeded;
        }
        if session.consecutive_zero_yield >= session.limits.max_consecutive_zero_yield {
            break DrainHalt::ZeroYieldStreak;
        }

        let failed = store.failed_phases(&FailedPhaseFilter::default());
        let candidates = select_candidates(&failed, session);
        let candidate = candidates.into_iter().find(|p| {
            // Refuse a second QUEUED phase in the same run.
            store.next_queued_phase(&p.run_id).is_none()
        });
        let Some(phase) = candidate else {
            break DrainHalt::NoCandidates;
        };

        log_info!(
            "[drain] Replaying {} / {} (priority {})",
            phase.run_id,
            phase.phase_id,
            failure_priority(&phase)
        );

        // Requeue with the drain attempt budget. Failed is terminal in the
        // normal lifecycle; requeueing is an explicit administrative reset.
        let drain_attempts = session.limits.max_attempts_per_phase;
        store.update_phase(&phase.phase_id, |p| {
            p.state = PhaseState::Queued;
            p.attempts_used = 0;
            p.max_attempts = drain_attempts;
        })?;
        store.transition_phase(&phase.phase_id, PhaseState::Executing)?;

        let events_before = env
            .telemetry
            .count_for_run(&phase.run_id)
            .unwrap_or(0) as u64;
        let phase_start = Instant::now();
        let timeout = Duration::from_secs(session.limits.phase_timeout_seconds);

        let outcome = tokio::time::timeout(
            timeout,
            execute_phase(env, store, gateway, &phase.phase_id, None),
        )
        .await;

        let duration_s = phase_start.elapsed().as_secs_f64();
        let events_after = env
            .telemetry
            .count_for_run(&phase.run_id)
            .unwrap_or(0) as u64;
        let events_collected = events_after.saturating_sub(events_before);
        let phase_yield = yield_per_minute(events_collected, duration_s);

        let mut timed_out = false;
        let (final_state, error_digest, returncode, fingerprint) = match outcome {
            Err(_) => {
                timed_out = true;
                let reason = format!(
                    "drain timed out after {}s",
                    session.limits.phase_timeout_seconds
                );
                let fp = crate::fingerprint::failure_fingerprint(None, &reason);
                store.update_phase(&phase.phase_id, |p| {
                    p.last_failure_reason = Some(reason.clone());
                    p.last_fingerprint = Some(fp.clone());
                })?;
                store.transition_phase(&phase.phase_id, PhaseState::Failed)?;
                (PhaseState::Failed, Some(reason), None, fp)
            }
            Ok(PhaseExecution::Complete(_)) => {
                store.transition_phase(&phase.phase_id, PhaseState::Complete)?;
                (PhaseState::Complete, None, Some(0), String::new())
            }
            Ok(PhaseExecution::Failed { reason, fingerprint }) => {
                store.update_phase(&phase.phase_id, |p| {
                    p.last_failure_reason = Some(reason.clone());
                    p.last_fingerprint = Some(fingerprint.clone());
                })?;
                store.transition_phase(&phase.phase_id, PhaseState::Failed)?;
                (PhaseState::Failed, Some(reason), Some(1), fingerprint)
            }
            Ok(PhaseExecution::ApprovalPending { .. }) => {
                // Draining never waits on operators; leave the phase parked
                // for a supervisor session.
                store.transition_phase(&phase.phase_id, PhaseState::ApprovalPending)?;
                (PhaseState::ApprovalPending, None, None, String::new())
            }
            Ok(PhaseExecution::ReplanRequested { reason }) => {
                store.update_phase(&phase.phase_id, |p| {
                    p.last_failure_reason = Some(reason.clone());
                })?;
                store.transition_phase(&phase.phase_id, PhaseState::Failed)?;
                let fp = crate::fingerprint::failure_fingerprint(Some(1), &reason);
                (PhaseState::Failed, Some(reason), Some(1), fp)
            }
            Ok(PhaseExecution::Cancelled) => break DrainHalt::Cancelled,
            Ok(PhaseExecution::Fatal(e)) => {
                session.finished_at = Some(Utc::now());
                let _ = session.save(session_path);
                return Err(e);
            }
        };

        let yield_class = classify_yield(events_collected, duration_s, timed_out, true);
        log_info!(
            "[drain] {} finished {:?} in {:.1}s (yield {:.2}/min, {})",
            phase.phase_id,
            final_state,
            duration_s,
            phase_yield,
            yield_class
        );

        let result = DrainResult {
            run_id: phase.run_id.clone(),
            phase_id: phase.phase_id.clone(),
            final_state,
            error_digest,
            subprocess_returncode: returncode,
            duration_s,
            telemetry_events_collected: events_collected,
            telemetry_yield_per_minute: phase_yield,
            fingerprint,
        };
        let _ = env.telemetry.emit(
            &phase.run_id,
            Some(phase.phase_id.as_str()),
            None,
            crate::telemetry::EventKind::DrainResult,
            serde_json::json!({
                "final_state": format!("{:?}", result.final_state),
                "duration_s": result.duration_s,
                "yield_class": yield_class.to_string(),
            }),
        );
        apply_result(session, result, timed_out);
        executed += 1;

        if let Err(e) = session.save(session_path) {
            log_warn!("[drain] Failed to persist session: {}", e);
        }
    };

    session.finished_at = Some(Utc::now());
    session
        .save(session_path)
        .map_err(ApError::Internal)?;
    log_info!(
        "[drain] Session {} halted: {:?} ({} phases)",
        session.session_id,
        halt,
        executed
    );
    Ok(halt)
}
