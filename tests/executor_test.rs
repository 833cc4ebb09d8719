mod common;

use autopack::approval::ApprovalGateway;
use autopack::baseline::MockTestRunner;
use autopack::builder::{AgentReply, MockAgentRunner};
use autopack::error::ApError;
use autopack::executor::{execute_phase, PhaseExecution};
use autopack::router::StaticQuota;
use autopack::telemetry::EventKind;
use autopack::types::{
    ApprovalDecision, AttemptOutcome, Category, PatchFormat, PatchOp, PatchOperation,
    PatchProposal, StopReason,
};

use common::{green_tests, make_docs_phase, make_run, reply_modify, Harness};

fn gateway() -> ApprovalGateway {
    ApprovalGateway::new(3600, false, None)
}

#[tokio::test]
async fn happy_path_docs_phase_completes() {
    let h = Harness::new();
    let mut store = h.store();
    store.insert_run(make_run("r1")).unwrap();
    store.insert_phase(make_docs_phase("p1", "r1", 0)).unwrap();

    let agent = MockAgentRunner::new(vec![Ok(common::reply_create(
        "prop1",
        "docs/p1.md",
        "# Guide\n\nContent.\n",
    ))]);
    let tests = green_tests(1);
    let env = h.env(&agent, &tests);
    let mut gw = gateway();

    let outcome = execute_phase(&env, &mut store, &mut gw, "p1", None).await;
    let PhaseExecution::Complete(decision) = outcome else {
        panic!("expected Complete, got {:?}", outcome);
    };
    assert!(decision.gate0_ci.passed);
    assert!(decision.gate2_deliverables.passed);

    // Deliverable landed in the workspace
    let written = std::fs::read_to_string(h.root().join("docs/p1.md")).unwrap();
    assert!(written.contains("Content"));

    // One Builder attempt with outcome OK
    let attempts = store.phase_attempts("p1");
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, AttemptOutcome::Ok);

    // Proof written under the run-local layout
    let proof = h.root().join("runs/default/r1/proofs/p1.json");
    assert!(proof.exists());

    // Telemetry carries the COMPLETE outcome and token usage
    let events = h.telemetry.read_all().unwrap();
    assert!(events
        .iter()
        .any(|e| e.kind == EventKind::PhaseOutcome
            && e.payload["outcome"] == serde_json::json!("Complete")));
    assert!(events.iter().any(|e| e.kind == EventKind::TokenUsage));
    assert_eq!(store.get_run("r1").unwrap().tokens_used, 300);
}

#[tokio::test]
async fn protected_path_proposal_rejected_without_approval() {
    let h = Harness::new();
    let mut store = h.store();
    store.insert_run(make_run("r1")).unwrap();
    let mut phase = make_docs_phase("p2", "r1", 0);
    phase.category = Category::Other;
    phase.scope.allowed_paths = vec!["src/".to_string()];
    phase.deliverables = vec!["src/fix.rs".to_string()];
    phase.max_attempts = 2;
    store.insert_phase(phase).unwrap();

    let bad_reply = || {
        Ok(AgentReply {
            stop_reason: StopReason::EndTurn,
            tokens_in: 10,
            tokens_out: 10,
            proposal: Some(PatchProposal {
                proposal_id: "prop-bad".to_string(),
                attempt_id: String::new(),
                format: PatchFormat::StructuredEdits,
                operations: vec![PatchOperation {
                    op: PatchOp::Modify,
                    path: ".git/config".to_string(),
                    content: Some("[core]\n".to_string()),
                    hunks: None,
                }],
                declared_deliverables: vec![],
            }),
            audit: None,
        })
    };
    let agent = MockAgentRunner::new(vec![bad_reply(), bad_reply()]);
    let tests = green_tests(0);
    let env = h.env(&agent, &tests);
    let mut gw = gateway();

    let outcome = execute_phase(&env, &mut store, &mut gw, "p2", None).await;
    let PhaseExecution::Failed { reason, .. } = outcome else {
        panic!("expected Failed, got {:?}", outcome);
    };
    assert!(reason.contains("rejected"));

    // No approval was ever opened, and the workspace was never touched
    assert!(gw.pending_for_phase("p2").is_empty());
    assert!(!h.root().join(".git/config").exists());

    let attempts = store.phase_attempts("p2");
    assert_eq!(attempts.len(), 2);
    assert!(attempts
        .iter()
        .all(|a| a.outcome == AttemptOutcome::ApplyFail));
}

#[tokio::test]
async fn approval_denied_consumes_attempt_and_hints_next_builder() {
    let h = Harness::new();
    let mut store = h.store();
    store.insert_run(make_run("r1")).unwrap();
    let mut phase = make_docs_phase("p3", "r1", 0);
    phase.category = Category::SecurityAuthChange;
    phase.scope.allowed_paths = vec!["src/auth/".to_string()];
    phase.deliverables = vec!["src/auth/login.rs".to_string()];
    phase.max_attempts = 2;
    store.insert_phase(phase).unwrap();

    let auth_reply =
        || Ok(common::reply_create("prop-auth", "src/auth/login.rs", "pub fn login() {}\n"));
    let agent = MockAgentRunner::new(vec![auth_reply(), auth_reply()]);
    let tests = green_tests(0);
    let env = h.env(&agent, &tests);
    let mut gw = gateway();

    // First attempt parks on approval (risk floors at HIGH for this category)
    let outcome = execute_phase(&env, &mut store, &mut gw, "p3", None).await;
    let PhaseExecution::ApprovalPending { approval_id, resume } = outcome else {
        panic!("expected ApprovalPending, got {:?}", outcome);
    };

    // Operator denies; the resumed call consumes the attempt and retries
    gw.decide(&approval_id, ApprovalDecision::Denied, "operator")
        .unwrap();
    let outcome = execute_phase(&env, &mut store, &mut gw, "p3", Some(*resume)).await;
    let PhaseExecution::ApprovalPending { approval_id, resume } = outcome else {
        panic!("expected second ApprovalPending, got {:?}", outcome);
    };

    // The retry Builder prompt carries the denial as a structured hint
    let prompts = agent.prompts.lock().unwrap().clone();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].contains("APPROVAL_DENIED"));

    // Second denial exhausts max_attempts
    gw.decide(&approval_id, ApprovalDecision::Denied, "operator")
        .unwrap();
    let outcome = execute_phase(&env, &mut store, &mut gw, "p3", Some(*resume)).await;
    assert!(matches!(outcome, PhaseExecution::Failed { .. }));

    let attempts = store.phase_attempts("p3");
    assert_eq!(attempts.len(), 2);
    assert!(attempts
        .iter()
        .all(|a| a.outcome == AttemptOutcome::ApprovalDenied));
}

#[tokio::test]
async fn approval_granted_resumes_and_completes() {
    let h = Harness::new();
    let mut store = h.store();
    store.insert_run(make_run("r1")).unwrap();
    let mut phase = make_docs_phase("p4", "r1", 0);
    phase.category = Category::SecurityAuthChange;
    phase.scope.allowed_paths = vec!["src/auth/".to_string()];
    phase.deliverables = vec!["src/auth/login.rs".to_string()];
    store.insert_phase(phase).unwrap();

    // Best-first categories run a dual audit after the apply.
    let agent = MockAgentRunner::new(vec![
        Ok(common::reply_create(
            "prop-auth",
            "src/auth/login.rs",
            "pub fn login() {}\n",
        )),
        Ok(common::reply_audit(true, &[])),
    ]);
    let tests = green_tests(1);
    let env = h.env(&agent, &tests);
    let mut gw = gateway();

    let outcome = execute_phase(&env, &mut store, &mut gw, "p4", None).await;
    let PhaseExecution::ApprovalPending { approval_id, resume } = outcome else {
        panic!("expected ApprovalPending, got {:?}", outcome);
    };

    gw.decide(&approval_id, ApprovalDecision::Approved, "operator")
        .unwrap();
    let outcome = execute_phase(&env, &mut store, &mut gw, "p4", Some(*resume)).await;
    assert!(matches!(outcome, PhaseExecution::Complete(_)));
    assert!(h.root().join("src/auth/login.rs").exists());
}

#[tokio::test]
async fn truncated_reply_triggers_continuation_recovery() {
    let h = Harness::new();
    let mut store = h.store();
    store.insert_run(make_run("r1")).unwrap();
    store.insert_phase(make_docs_phase("p5", "r1", 0)).unwrap();

    let truncated = AgentReply {
        stop_reason: StopReason::MaxTokens,
        tokens_in: 50,
        tokens_out: 50,
        proposal: None,
        audit: None,
    };
    let agent = MockAgentRunner::new(vec![
        Ok(truncated),
        Ok(common::reply_create("prop-cont", "docs/p5.md", "# Done\n")),
    ]);
    let tests = green_tests(1);
    let env = h.env(&agent, &tests);
    let mut gw = gateway();

    let outcome = execute_phase(&env, &mut store, &mut gw, "p5", None).await;
    assert!(matches!(outcome, PhaseExecution::Complete(_)));

    // The second call was a continuation restricted to unfinished work
    let prompts = agent.prompts.lock().unwrap().clone();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].contains("continuation"));
    // Continuation falls back to structured edits
    assert!(prompts[1].contains("structured_edits"));
}

#[tokio::test]
async fn missing_deliverable_blocks_then_exhausts() {
    let h = Harness::new();
    let mut store = h.store();
    store.insert_run(make_run("r1")).unwrap();
    let mut phase = make_docs_phase("p6", "r1", 0);
    // Builder writes a different file than the declared deliverable
    phase.deliverables = vec!["docs/expected.md".to_string()];
    phase.max_attempts = 2;
    store.insert_phase(phase).unwrap();

    let wrong = || Ok(common::reply_create("prop-w", "docs/other.md", "text\n"));
    let agent = MockAgentRunner::new(vec![wrong(), wrong()]);
    let tests = green_tests(2);
    let env = h.env(&agent, &tests);
    let mut gw = gateway();

    let outcome = execute_phase(&env, &mut store, &mut gw, "p6", None).await;
    let PhaseExecution::Failed { reason, .. } = outcome else {
        panic!("expected Failed, got {:?}", outcome);
    };
    assert!(reason.contains("gate2_deliverables"));

    let attempts = store.phase_attempts("p6");
    assert_eq!(attempts.len(), 2);
    assert!(attempts
        .iter()
        .all(|a| a.outcome == AttemptOutcome::DeliverablesFail));

    // Blocked attempts rolled back: the stray file is gone
    assert!(!h.root().join("docs/other.md").exists());
}

#[tokio::test]
async fn quota_exhaustion_is_fatal_not_downgraded() {
    let mut h = Harness::new();
    h.quota = StaticQuota::with_exhausted(["haiku", "sonnet", "opus"]);
    let mut store = h.store();
    store.insert_run(make_run("r1")).unwrap();
    store.insert_phase(make_docs_phase("p7", "r1", 0)).unwrap();

    let agent = MockAgentRunner::new(vec![]);
    let tests = green_tests(0);
    let env = h.env(&agent, &tests);
    let mut gw = gateway();

    let outcome = execute_phase(&env, &mut store, &mut gw, "p7", None).await;
    let PhaseExecution::Fatal(e) = outcome else {
        panic!("expected Fatal, got {:?}", outcome);
    };
    assert!(matches!(e, ApError::QuotaBlocked { .. }));
    assert_eq!(e.exit_code(), 3);

    // The Builder was never called with a substitute model
    assert!(agent.prompts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_regression_blocks_with_flaky_tolerance() {
    let h = Harness::new();
    let mut store = h.store();
    store.insert_run(make_run("r1")).unwrap();
    let mut phase = make_docs_phase("p8", "r1", 0);
    phase.max_attempts = 1;
    store.insert_phase(phase).unwrap();

    let fails: std::collections::BTreeSet<String> =
        ["t_new".to_string()].into_iter().collect();
    // Baseline clean; first post-apply run fails t_new; retry confirms it.
    let tests = MockTestRunner::new(vec![
        Ok(Default::default()),
        Ok(fails.clone()),
        Ok(fails),
    ]);
    let agent = MockAgentRunner::new(vec![Ok(common::reply_create(
        "prop-reg",
        "docs/p8.md",
        "# Text\n",
    ))]);
    let env = h.env(&agent, &tests);
    let mut gw = gateway();

    let outcome = execute_phase(&env, &mut store, &mut gw, "p8", None).await;
    let PhaseExecution::Failed { reason, .. } = outcome else {
        panic!("expected Failed, got {:?}", outcome);
    };
    assert!(reason.contains("t_new"));

    let attempts = store.phase_attempts("p8");
    assert_eq!(attempts[0].outcome, AttemptOutcome::TestRegression);
}

#[tokio::test]
async fn flaky_failure_does_not_block() {
    let h = Harness::new();
    let mut store = h.store();
    store.insert_run(make_run("r1")).unwrap();
    store.insert_phase(make_docs_phase("p9", "r1", 0)).unwrap();

    let flaky: std::collections::BTreeSet<String> =
        ["t_flaky".to_string()].into_iter().collect();
    // Baseline clean; post-apply run fails t_flaky; retry passes it.
    let tests = MockTestRunner::new(vec![
        Ok(Default::default()),
        Ok(flaky),
        Ok(Default::default()),
    ]);
    let agent = MockAgentRunner::new(vec![Ok(common::reply_create(
        "prop-f",
        "docs/p9.md",
        "# Text\n",
    ))]);
    let env = h.env(&agent, &tests);
    let mut gw = gateway();

    let outcome = execute_phase(&env, &mut store, &mut gw, "p9", None).await;
    assert!(matches!(outcome, PhaseExecution::Complete(_)));
}

#[tokio::test]
async fn repeated_fingerprint_requests_replan() {
    let h = Harness::new();
    let mut store = h.store();
    store.insert_run(make_run("r1")).unwrap();
    let mut phase = make_docs_phase("p10", "r1", 0);
    phase.max_attempts = 5;
    store.insert_phase(phase).unwrap();

    // Three identical builder failures in a row
    let agent = MockAgentRunner::new(vec![
        Err("agent crashed: ImportError".to_string()),
        Err("agent crashed: ImportError".to_string()),
        Err("agent crashed: ImportError".to_string()),
    ]);
    let tests = green_tests(0);
    let env = h.env(&agent, &tests);
    let mut gw = gateway();

    let outcome = execute_phase(&env, &mut store, &mut gw, "p10", None).await;
    let PhaseExecution::ReplanRequested { reason } = outcome else {
        panic!("expected ReplanRequested, got {:?}", outcome);
    };
    assert!(reason.contains("3 consecutive failures"));
    assert_eq!(store.phase_attempts("p10").len(), 3);
}

#[tokio::test]
async fn reply_modify_applies_over_existing_file() {
    let h = Harness::new();
    std::fs::create_dir_all(h.root().join("docs")).unwrap();
    std::fs::write(h.root().join("docs/p11.md"), "old\n").unwrap();

    let mut store = h.store();
    store.insert_run(make_run("r1")).unwrap();
    store.insert_phase(make_docs_phase("p11", "r1", 0)).unwrap();

    let agent = MockAgentRunner::new(vec![Ok(reply_modify("prop-m", "docs/p11.md", "new\n"))]);
    let tests = green_tests(1);
    let env = h.env(&agent, &tests);
    let mut gw = gateway();

    let outcome = execute_phase(&env, &mut store, &mut gw, "p11", None).await;
    assert!(matches!(outcome, PhaseExecution::Complete(_)));
    assert_eq!(
        std::fs::read_to_string(h.root().join("docs/p11.md")).unwrap(),
        "new\n"
    );
}
