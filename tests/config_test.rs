use autopack::config::{load_config_from, RoutingStrategy};
use autopack::types::{Category, Complexity, RiskLevel};

#[test]
fn full_config_file_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("autopack.toml");
    std::fs::write(
        &path,
        r#"
[project]
family = "alpha"
project_id = "proj-42"

[execution]
phase_timeout_seconds = 600
max_attempts_per_phase = 3
approval_timeout_seconds = 1800

[agent]
cli = "claude"

[routing.quota]
enforce = true

[routing.categories.security_auth_change]
strategy = "best_first"
builder_primary = "opus"
auditor_primary = "opus"
dual_audit = true

[routing.categories.core_backend_high]
strategy = "progressive"
builder_primary = "sonnet"
auditor_primary = "sonnet"

[routing.categories.core_backend_high.escalate_to]
builder = "opus"
auditor = "opus"
after_attempts = 2

[routing.categories.docs]
strategy = "cheap_first"
builder_primary = "haiku"
auditor_primary = "haiku"

[budgets]
low = [8000, 12000, 16000]
medium = [12000, 16000, 24000]
high = [16000, 24000, 32000]

[[protection.groups]]
name = "vcs"
patterns = [".git/**", ".git"]

[[protection.groups]]
name = "sot_docs"
patterns = ["PROJECT_HISTORY.md"]

[protection.retention]
short_term_days = 30
medium_term_days = 90
long_term_days = 180

[protection.overrides]
tidy_skips_protected = true
optimizer_may_scan = true

[finalizer]
require_coverage_baseline = false
max_unapproved_risk = "HIGH"
rollback_on_block = true

[drain]
batch_size = 10
phase_timeout_seconds = 900
max_fingerprint_repeats = 3

[memory]
enable_memory = false
sot_retrieval_max_chars = 4000

[tests]
command = ["bash", "run_tests.sh"]
timeout_seconds = 300
"#,
    )
    .unwrap();

    let config = load_config_from(Some(&path), dir.path()).unwrap();

    assert_eq!(config.project.family, "alpha");
    assert_eq!(config.execution.phase_timeout_seconds, 600);
    assert_eq!(config.execution.max_attempts_per_phase, 3);

    let security = config.routing.policy_for(Category::SecurityAuthChange);
    assert_eq!(security.strategy, RoutingStrategy::BestFirst);
    assert!(security.dual_audit);

    let backend = config.routing.policy_for(Category::CoreBackendHigh);
    assert_eq!(backend.strategy, RoutingStrategy::Progressive);
    assert_eq!(backend.escalate_to.as_ref().unwrap().after_attempts, 2);

    // The 'other' fallback is populated even though the file omits it
    let fallback = config.routing.policy_for(Category::Other);
    assert_eq!(fallback.strategy, RoutingStrategy::Progressive);

    assert_eq!(config.budgets.budget_for(Complexity::High, 2), 24_000);
    assert_eq!(config.finalizer.max_unapproved_risk, RiskLevel::High);
    assert!(config.protection.is_protected(".git/HEAD"));
    assert_eq!(config.tests.command, vec!["bash", "run_tests.sh"]);
    assert_eq!(config.memory.sot_retrieval_max_chars, 4000);
}

#[test]
fn rejects_unknown_routing_category() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("autopack.toml");
    std::fs::write(
        &path,
        r#"
[routing.categories.made_up_category]
strategy = "best_first"
builder_primary = "opus"
auditor_primary = "opus"
"#,
    )
    .unwrap();

    let err = load_config_from(Some(&path), dir.path()).unwrap_err();
    assert!(err.contains("unknown category"));
}

#[test]
fn rejects_decreasing_budget_ladder() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("autopack.toml");
    std::fs::write(
        &path,
        r#"
[budgets]
low = [16000, 8000]
"#,
    )
    .unwrap();

    let err = load_config_from(Some(&path), dir.path()).unwrap_err();
    assert!(err.contains("non-decreasing"));
}

#[test]
fn rejects_invalid_protection_glob() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("autopack.toml");
    std::fs::write(
        &path,
        r#"
[[protection.groups]]
name = "broken"
patterns = ["[invalid"]
"#,
    )
    .unwrap();

    let err = load_config_from(Some(&path), dir.path()).unwrap_err();
    assert!(err.contains("invalid glob"));
}
