use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;

use crate::store::RunStore;
use crate::types::TestBaseline;
use crate::{log_info, log_warn};

/// Runs the project's test suite and reports the set of failing test ids.
/// Enables mocking in executor tests.
pub trait TestRunner: Send + Sync {
    fn run_tests(
        &self,
    ) -> impl std::future::Future<Output = Result<BTreeSet<String>, String>> + Send;
}

/// Spawns the configured test command and parses one failing test id per
/// `FAIL <id>` line on stdout. A non-zero exit with parseable output is
/// still a valid result (failing tests fail the process in most runners).
pub struct CommandTestRunner {
    pub command: Vec<String>,
    pub workspace_root: PathBuf,
    pub timeout: Duration,
}

impl TestRunner for CommandTestRunner {
    async fn run_tests(&self) -> Result<BTreeSet<String>, String> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| "No test command configured".to_string())?;

        let output = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new(program)
                .args(args)
                .current_dir(&self.workspace_root)
                .stdin(std::process::Stdio::null())
                .output(),
        )
        .await
        .map_err(|_| format!("Test run timed out after {}s", self.timeout.as_secs()))?
        .map_err(|e| format!("Failed to spawn test command '{}': {}", program, e))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_failures(&stdout))
    }
}

/// Parse `FAIL <test_id>` lines from test-runner output.
pub fn parse_failures(stdout: &str) -> BTreeSet<String> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix("FAIL "))
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect()
}

/// For projects with no test command configured: every run reports a clean
/// suite, so Gate 0 never blocks.
pub struct NullTestRunner;

impl TestRunner for NullTestRunner {
    async fn run_tests(&self) -> Result<BTreeSet<String>, String> {
        Ok(BTreeSet::new())
    }
}

/// Scripted runner for tests: each call pops the next result.
pub struct MockTestRunner {
    results: tokio::sync::Mutex<Vec<Result<BTreeSet<String>, String>>>,
}

impl MockTestRunner {
    pub fn new(results: Vec<Result<BTreeSet<String>, String>>) -> Self {
        let mut reversed = results;
        reversed.reverse();
        MockTestRunner {
            results: tokio::sync::Mutex::new(reversed),
        }
    }
}

impl TestRunner for MockTestRunner {
    async fn run_tests(&self) -> Result<BTreeSet<String>, String> {
        let mut results = self.results.lock().await;
        results
            .pop()
            .unwrap_or_else(|| Err("MockTestRunner: no more results in sequence".to_string()))
    }
}

/// Outcome of a post-apply test evaluation, after the flaky retry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TestDelta {
    /// New failures relative to T0, confirmed by the retry.
    pub new_failures: BTreeSet<String>,
    /// New failures that passed on retry and were excluded.
    pub flaky_excluded: BTreeSet<String>,
}

/// Capture T0 on the first test execution of a run; later calls return the
/// stored baseline untouched.
pub async fn ensure_baseline(
    store: &mut RunStore,
    run_id: &str,
    runner: &impl TestRunner,
) -> Result<TestBaseline, String> {
    if let Some(existing) = store.baseline() {
        if existing.run_id == run_id {
            return Ok(existing.clone());
        }
    }

    log_info!("[{}] Capturing T0 test baseline", run_id);
    let t0_failures = runner.run_tests().await?;
    if !t0_failures.is_empty() {
        log_warn!(
            "[{}] Baseline has {} pre-existing failures; they will never block",
            run_id,
            t0_failures.len()
        );
    }
    let baseline = TestBaseline {
        run_id: run_id.to_string(),
        t0_failures,
        captured_at: Utc::now(),
    };
    store.set_baseline(baseline.clone())?;
    Ok(baseline)
}

/// Run the suite, compute the delta against T0, and retry new failures once.
/// Only failures that reproduce on the retry survive into the delta; the
/// finalizer's CI gate consumes exactly this deduped set.
pub async fn compute_delta(
    runner: &impl TestRunner,
    baseline: &TestBaseline,
) -> Result<TestDelta, String> {
    let current = runner.run_tests().await?;
    let new_failures: BTreeSet<String> = current
        .difference(&baseline.t0_failures)
        .cloned()
        .collect();

    if new_failures.is_empty() {
        return Ok(TestDelta::default());
    }

    // Flaky retry: one rerun; anything that passes the second time is excluded.
    let retry = runner.run_tests().await?;
    let confirmed: BTreeSet<String> = new_failures
        .intersection(&retry)
        .cloned()
        .collect();
    let flaky_excluded: BTreeSet<String> = new_failures
        .difference(&confirmed)
        .cloned()
        .collect();

    Ok(TestDelta {
        new_failures: confirmed,
        flaky_excluded,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_failures_extracts_ids() {
        let out = "ok t_one\nFAIL t_two\n  FAIL t_three\nFAILURE not_this\n";
        assert_eq!(parse_failures(out), set(&["t_two", "t_three"]));
    }

    #[tokio::test]
    async fn delta_ignores_preexisting_failures() {
        let baseline = TestBaseline {
            run_id: "r1".into(),
            t0_failures: set(&["t_old"]),
            captured_at: Utc::now(),
        };
        let runner = MockTestRunner::new(vec![Ok(set(&["t_old"]))]);
        let delta = compute_delta(&runner, &baseline).await.unwrap();
        assert!(delta.new_failures.is_empty());
        assert!(delta.flaky_excluded.is_empty());
    }

    #[tokio::test]
    async fn flaky_failure_excluded_after_retry_pass() {
        let baseline = TestBaseline {
            run_id: "r1".into(),
            t0_failures: set(&[]),
            captured_at: Utc::now(),
        };
        // First run: t_flaky fails. Retry: it passes.
        let runner = MockTestRunner::new(vec![Ok(set(&["t_flaky"])), Ok(set(&[]))]);
        let delta = compute_delta(&runner, &baseline).await.unwrap();
        assert!(delta.new_failures.is_empty());
        assert_eq!(delta.flaky_excluded, set(&["t_flaky"]));
    }

    #[tokio::test]
    async fn persistent_failure_survives_retry() {
        let baseline = TestBaseline {
            run_id: "r1".into(),
            t0_failures: set(&["t_old"]),
            captured_at: Utc::now(),
        };
        let runner = MockTestRunner::new(vec![
            Ok(set(&["t_old", "t_new"])),
            Ok(set(&["t_old", "t_new"])),
        ]);
        let delta = compute_delta(&runner, &baseline).await.unwrap();
        assert_eq!(delta.new_failures, set(&["t_new"]));
    }

    #[tokio::test]
    async fn baseline_captured_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RunStore::open(&dir.path().join("state.json")).unwrap();

        let runner = MockTestRunner::new(vec![Ok(set(&["t_old"])), Ok(set(&[]))]);
        let first = ensure_baseline(&mut store, "r1", &runner).await.unwrap();
        assert_eq!(first.t0_failures, set(&["t_old"]));

        // Second call must not consume another runner result.
        let second = ensure_baseline(&mut store, "r1", &runner).await.unwrap();
        assert_eq!(second.t0_failures, set(&["t_old"]));
    }
}
