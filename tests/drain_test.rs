mod common;

use autopack::approval::ApprovalGateway;
use autopack::builder::MockAgentRunner;
use autopack::drain::{
    apply_result, classify_yield, failure_priority, run_drain, select_candidates, DrainHalt,
    DrainLimits, DrainResult, DrainSession, YieldClass,
};
use autopack::types::{PhaseState, RunState};

use common::{green_tests, make_docs_phase, make_run, Harness};

fn limits() -> DrainLimits {
    DrainLimits {
        phase_timeout_seconds: 900,
        max_total_minutes: 120,
        max_timeouts_per_run: 3,
        max_attempts_per_phase: 2,
        max_fingerprint_repeats: 3,
        max_consecutive_zero_yield: 10,
    }
}

fn failed_phase(
    phase_id: &str,
    run_id: &str,
    index: u32,
    reason: Option<&str>,
) -> autopack::types::PhaseRecord {
    let mut phase = make_docs_phase(phase_id, run_id, index);
    phase.state = PhaseState::Failed;
    phase.last_failure_reason = reason.map(str::to_string);
    phase
}

fn result(run_id: &str, phase_id: &str, state: PhaseState, fp: &str, events: u64) -> DrainResult {
    DrainResult {
        run_id: run_id.to_string(),
        phase_id: phase_id.to_string(),
        final_state: state,
        error_digest: None,
        subprocess_returncode: Some(1),
        duration_s: 60.0,
        telemetry_events_collected: events,
        telemetry_yield_per_minute: events as f64,
        fingerprint: fp.to_string(),
    }
}

#[test]
fn priority_orders_unknown_first_and_timeouts_last() {
    let unknown = failed_phase("p_u", "r", 0, None);
    let import = failed_phase("p_i", "r", 1, Some("ImportError during collect"));
    let missing = failed_phase("p_m", "r", 2, Some("deliverable docs/x.md missing"));
    let patch = failed_phase("p_p", "r", 3, Some("merge conflict in src/a.rs"));
    let other = failed_phase("p_o", "r", 4, Some("something strange happened"));
    let timeout = failed_phase("p_t", "r", 5, Some("agent timed out after 900 seconds"));

    assert_eq!(failure_priority(&unknown), 0);
    assert_eq!(failure_priority(&import), 1);
    assert_eq!(failure_priority(&missing), 2);
    assert_eq!(failure_priority(&patch), 3);
    assert_eq!(failure_priority(&other), 4);
    assert_eq!(failure_priority(&timeout), 5);

    let session = DrainSession::new("s1", 10, limits());
    let ordered = select_candidates(
        &[
            timeout.clone(),
            other.clone(),
            patch.clone(),
            missing.clone(),
            import.clone(),
            unknown.clone(),
        ],
        &session,
    );
    let ids: Vec<&str> = ordered.iter().map(|p| p.phase_id.as_str()).collect();
    assert_eq!(ids, vec!["p_u", "p_i", "p_m", "p_p", "p_o", "p_t"]);
}

#[test]
fn selection_prefers_lower_phase_index_within_bucket() {
    let a = failed_phase("p_late", "r", 7, Some("weird"));
    let b = failed_phase("p_early", "r", 2, Some("weird"));
    let session = DrainSession::new("s1", 10, limits());
    let ordered = select_candidates(&[a, b], &session);
    assert_eq!(ordered[0].phase_id, "p_early");
}

#[test]
fn selection_skips_stopped_runs_and_fingerprints() {
    let mut stopped_run = failed_phase("p1", "r_stopped", 0, Some("x"));
    stopped_run.last_fingerprint = Some("FP_A".to_string());
    let mut stopped_fp = failed_phase("p2", "r_ok", 0, Some("x"));
    stopped_fp.last_fingerprint = Some("FP_B".to_string());
    let clean = failed_phase("p3", "r_ok", 1, Some("x"));

    let mut session = DrainSession::new("s1", 10, limits());
    session.stopped_runs.insert("r_stopped".to_string());
    session.stopped_fingerprints.insert("FP_B".to_string());

    let ordered = select_candidates(&[stopped_run, stopped_fp, clean], &session);
    let ids: Vec<&str> = ordered.iter().map(|p| p.phase_id.as_str()).collect();
    assert_eq!(ids, vec!["p3"]);
}

#[test]
fn fingerprint_repeats_stop_the_fingerprint() {
    let mut session = DrainSession::new("s1", 10, limits());
    for i in 0..3 {
        apply_result(
            &mut session,
            result("r1", &format!("p{}", i), PhaseState::Failed, "FP", 1),
            false,
        );
    }
    assert_eq!(session.fingerprint_counts["FP"], 3);
    assert!(session.stopped_fingerprints.contains("FP"));
}

#[test]
fn timeouts_per_run_stop_the_run() {
    let mut session = DrainSession::new("s1", 10, limits());
    for i in 0..3 {
        apply_result(
            &mut session,
            result("r1", &format!("p{}", i), PhaseState::Failed, "", 1),
            true,
        );
    }
    assert!(session.stopped_runs.contains("r1"));
}

#[test]
fn unpromising_sample_deprioritizes_run() {
    let mut session = DrainSession::new("s1", 10, limits());
    // The fingerprint was already seen once this session.
    session.fingerprint_counts.insert("FP".to_string(), 1);

    // Sample: failed, zero yield, repeating fingerprint.
    apply_result(
        &mut session,
        result("r2", "p0", PhaseState::Failed, "FP", 0),
        false,
    );
    assert!(session.sampled_runs.contains("r2"));
    assert!(session.stopped_runs.contains("r2"));
}

#[test]
fn promising_sample_keeps_run_eligible() {
    let mut session = DrainSession::new("s1", 10, limits());
    apply_result(
        &mut session,
        result("r2", "p0", PhaseState::Complete, "", 5),
        false,
    );
    assert!(session.sampled_runs.contains("r2"));
    assert!(!session.stopped_runs.contains("r2"));
    assert_eq!(session.consecutive_zero_yield, 0);
}

#[test]
fn zero_yield_streak_accumulates_and_resets() {
    let mut session = DrainSession::new("s1", 10, limits());
    apply_result(&mut session, result("r", "p0", PhaseState::Failed, "A", 0), false);
    apply_result(&mut session, result("r", "p1", PhaseState::Failed, "B", 0), false);
    assert_eq!(session.consecutive_zero_yield, 2);
    apply_result(&mut session, result("r", "p2", PhaseState::Failed, "C", 4), false);
    assert_eq!(session.consecutive_zero_yield, 0);
}

#[test]
fn yield_classification() {
    assert_eq!(classify_yield(5, 60.0, false, true), YieldClass::ReachedLlm);
    assert_eq!(classify_yield(0, 1.0, false, true), YieldClass::FailedPreflight);
    assert_eq!(classify_yield(0, 600.0, true, true), YieldClass::NoBoundary);
    assert_eq!(classify_yield(0, 60.0, false, true), YieldClass::LostInFlush);
    assert_eq!(classify_yield(9, 60.0, false, false), YieldClass::Disabled);
}

#[tokio::test]
async fn drain_replays_failed_phases_until_fingerprint_stop() {
    let h = Harness::new();
    let mut store = h.store();
    let mut run = make_run("r2");
    run.state = RunState::DoneFailed;
    run.started_at = Some(chrono::Utc::now());
    run.finished_at = Some(chrono::Utc::now());
    store.insert_run(run).unwrap();
    for i in 0..3 {
        store
            .insert_phase(failed_phase(
                &format!("p{}", i),
                "r2",
                i,
                Some("ImportError: no module named autopack_ext"),
            ))
            .unwrap();
    }

    // Every drained attempt fails identically: 3 phases x 2 attempts.
    let replies: Vec<Result<_, String>> = (0..6)
        .map(|_| Err("ImportError: no module named autopack_ext".to_string()))
        .collect();
    let agent = MockAgentRunner::new(replies);
    let tests = green_tests(0);
    let env = h.env(&agent, &tests);
    let mut gw = ApprovalGateway::new(3600, false, None);

    let mut session = DrainSession::new("s1", 10, limits());
    let session_path = h.runtime.drain_session_file("s1");

    let halt = run_drain(&env, &mut store, &mut gw, &mut session, &session_path)
        .await
        .unwrap();

    // All three drained; the shared fingerprint is then stopped and no
    // candidates remain.
    assert_eq!(halt, DrainHalt::NoCandidates);
    assert_eq!(session.results.len(), 3);
    assert_eq!(session.stopped_fingerprints.len(), 1);
    let fp = session.stopped_fingerprints.iter().next().unwrap();
    assert!(fp.starts_with("FAILED|rc1|"));
    assert!(session.fingerprint_counts[fp] >= 3);

    // Session file persisted with results
    let reloaded = DrainSession::load(&session_path).unwrap();
    assert_eq!(reloaded.results.len(), 3);
    assert!(reloaded.finished_at.is_some());
}

#[tokio::test]
async fn drain_completes_phase_that_now_succeeds() {
    let h = Harness::new();
    let mut store = h.store();
    let mut run = make_run("r3");
    run.state = RunState::DoneFailed;
    store.insert_run(run).unwrap();
    store
        .insert_phase(failed_phase("p0", "r3", 0, Some("transient glitch")))
        .unwrap();

    let agent = MockAgentRunner::new(vec![Ok(common::reply_create(
        "prop-d",
        "docs/p0.md",
        "# Recovered\n",
    ))]);
    let tests = green_tests(1);
    let env = h.env(&agent, &tests);
    let mut gw = ApprovalGateway::new(3600, false, None);

    let mut session = DrainSession::new("s2", 1, limits());
    let session_path = h.runtime.drain_session_file("s2");

    let halt = run_drain(&env, &mut store, &mut gw, &mut session, &session_path)
        .await
        .unwrap();
    assert_eq!(halt, DrainHalt::BatchComplete);
    assert_eq!(session.results.len(), 1);
    assert_eq!(session.results[0].final_state, PhaseState::Complete);
    assert_eq!(store.get_phase("p0").unwrap().state, PhaseState::Complete);
}
