use std::collections::BTreeSet;
use std::path::Path;

use crate::config::FinalizerConfig;
use crate::governance::path_in_scope;
use crate::types::{
    FinalizerDecision, FinalizerOutcome, GateResult, PhaseRecord, RiskAssessment,
};

/// Inputs to the completion decision for one attempt.
pub struct FinalizerInputs<'a> {
    pub phase: &'a PhaseRecord,
    pub attempt_id: &'a str,
    /// New test failures after the flaky retry (Gate 0).
    pub new_failures: &'a BTreeSet<String>,
    pub risk: &'a RiskAssessment,
    /// True when an operator (or narrow auto-approval) approved the change.
    pub approved: bool,
    /// Coverage delta vs. the project baseline; `None` when no baseline exists.
    pub coverage_delta: Option<f64>,
    pub workspace_root: &'a Path,
    /// Whether the phase has attempts left after this one.
    pub attempts_remaining: bool,
}

/// The authoritative completion gate. Four ordered gates; evaluation stops
/// at the first failure, and only a decision with outcome COMPLETE may move
/// a phase to COMPLETE; no other component transitions that state.
pub fn finalize(inputs: &FinalizerInputs, config: &FinalizerConfig) -> FinalizerDecision {
    let mut reasons = Vec::new();

    let gate0 = gate0_ci(inputs);
    let mut gate1 = GateResult::pass();
    let mut gate2 = GateResult::pass();
    let mut gate3 = GateResult::pass();

    if gate0.passed {
        gate1 = gate1_quality(inputs, config);
        if gate1.passed {
            gate2 = gate2_deliverables(inputs);
            if gate2.passed {
                gate3 = gate3_symbols(inputs);
            }
        }
    }

    for gate in [&gate0, &gate1, &gate2, &gate3] {
        reasons.extend(gate.reasons.iter().cloned());
    }

    let all_passed = gate0.passed && gate1.passed && gate2.passed && gate3.passed;
    let outcome = if all_passed {
        FinalizerOutcome::Complete
    } else if inputs.attempts_remaining {
        FinalizerOutcome::Blocked
    } else {
        FinalizerOutcome::Failed
    };

    FinalizerDecision {
        phase_id: inputs.phase.phase_id.clone(),
        attempt_id: inputs.attempt_id.to_string(),
        gate0_ci: gate0,
        gate1_quality: gate1,
        gate2_deliverables: gate2,
        gate3_symbols: gate3,
        outcome,
        reasons,
    }
}

/// Gate 0, CI delta: zero new failures after the flaky retry.
fn gate0_ci(inputs: &FinalizerInputs) -> GateResult {
    if inputs.new_failures.is_empty() {
        GateResult::pass()
    } else {
        GateResult {
            passed: false,
            reasons: inputs
                .new_failures
                .iter()
                .map(|t| format!("gate0_ci: new test failure {}", t))
                .collect(),
        }
    }
}

/// Gate 1, quality: risk within the unapproved ceiling unless approved;
/// coverage delta non-negative when a baseline exists.
fn gate1_quality(inputs: &FinalizerInputs, config: &FinalizerConfig) -> GateResult {
    let mut reasons = Vec::new();

    if inputs.risk.risk_level > config.max_unapproved_risk && !inputs.approved {
        reasons.push(format!(
            "gate1_quality: risk {} exceeds {} without approval",
            inputs.risk.risk_level, config.max_unapproved_risk
        ));
    }

    match inputs.coverage_delta {
        Some(delta) if delta < 0.0 => {
            reasons.push(format!(
                "gate1_quality: coverage delta {:.2} below baseline",
                delta
            ));
        }
        Some(_) => {}
        None if config.require_coverage_baseline => {
            reasons.push(
                "gate1_quality: coverage baseline required but unavailable".to_string(),
            );
        }
        // No baseline: treated as zero delta, non-blocking.
        None => {}
    }

    if reasons.is_empty() {
        GateResult::pass()
    } else {
        GateResult {
            passed: false,
            reasons,
        }
    }
}

/// Gate 2, deliverables: every declared deliverable exists, is non-empty,
/// and lies under the allowed paths.
fn gate2_deliverables(inputs: &FinalizerInputs) -> GateResult {
    let mut reasons = Vec::new();

    for deliverable in &inputs.phase.deliverables {
        if !path_in_scope(deliverable, &inputs.phase.scope.allowed_paths) {
            reasons.push(format!(
                "gate2_deliverables: {} outside allowed paths",
                deliverable
            ));
            continue;
        }
        let abs = inputs.workspace_root.join(deliverable);
        match std::fs::metadata(&abs) {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {}
            Ok(meta) if meta.is_file() => {
                reasons.push(format!("gate2_deliverables: {} is empty", deliverable));
            }
            Ok(_) => {
                reasons.push(format!(
                    "gate2_deliverables: {} is not a regular file",
                    deliverable
                ));
            }
            Err(_) => {
                reasons.push(format!("gate2_deliverables: {} missing", deliverable));
            }
        }
    }

    if reasons.is_empty() {
        GateResult::pass()
    } else {
        GateResult {
            passed: false,
            reasons,
        }
    }
}

/// Gate 3, symbols: declared symbols resolve in their deliverables; test
/// deliverables contain at least one test case.
fn gate3_symbols(inputs: &FinalizerInputs) -> GateResult {
    let mut reasons = Vec::new();

    for requirement in &inputs.phase.symbol_manifest {
        let content = std::fs::read_to_string(inputs.workspace_root.join(&requirement.path))
            .unwrap_or_default();
        for symbol in &requirement.symbols {
            if !crate::apply::symbol_present(&content, symbol) {
                reasons.push(format!(
                    "gate3_symbols: symbol {} missing from {}",
                    symbol, requirement.path
                ));
            }
        }
    }

    for deliverable in &inputs.phase.deliverables {
        if !is_test_path(deliverable) {
            continue;
        }
        let content = std::fs::read_to_string(inputs.workspace_root.join(deliverable))
            .unwrap_or_default();
        if !contains_test_case(&content) {
            reasons.push(format!(
                "gate3_symbols: test deliverable {} contains no test case",
                deliverable
            ));
        }
    }

    if reasons.is_empty() {
        GateResult::pass()
    } else {
        GateResult {
            passed: false,
            reasons,
        }
    }
}

fn is_test_path(path: &str) -> bool {
    path.starts_with("tests/")
        || path.contains("/tests/")
        || path.contains("test_")
        || path.ends_with("_test.rs")
        || path.ends_with(".test.ts")
        || path.ends_with(".test.js")
}

/// Language-agnostic probe for at least one test case definition.
fn contains_test_case(content: &str) -> bool {
    const MARKERS: [&str; 6] = [
        "#[test]",
        "#[tokio::test]",
        "fn test_",
        "def test_",
        "it(",
        "describe(",
    ];
    MARKERS.iter().any(|m| content.contains(m))
}
