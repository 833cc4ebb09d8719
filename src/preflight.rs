use std::path::Path;

use crate::config::{self, AutopackConfig};
use crate::governance::path_in_scope;
use crate::layout::RuntimeLayout;
use crate::pending::PendingMovesQueue;
use crate::store::RunStore;

/// A single preflight validation error with actionable context.
#[derive(Debug, Clone, PartialEq)]
pub struct PreflightError {
    /// What condition failed.
    pub condition: String,
    /// Where the error originates.
    pub location: String,
    /// How to fix it.
    pub suggested_fix: String,
}

impl std::fmt::Display for PreflightError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Preflight error: {}\n  Location: {}\n  Fix: {}",
            self.condition, self.location, self.suggested_fix
        )
    }
}

/// Classification used for the CLI exit code: configuration problems exit
/// 2, workspace-structure problems exit 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreflightSeverity {
    Config,
    Workspace,
}

/// Run all workspace verification checks.
///
/// Phases:
/// 1. Config structural validation
/// 2. Store readability and schema
/// 3. Phase scope sanity (deliverables in scope, protected/allowed disjoint)
/// 4. Pending moves queue schema
/// 5. Stale lock detection (PID files naming dead processes)
///
/// Returns `Ok(())` or all errors found, with the dominant severity.
pub fn run_preflight(
    config: &AutopackConfig,
    workspace_root: &Path,
) -> Result<(), (PreflightSeverity, Vec<PreflightError>)> {
    let mut errors = Vec::new();
    let mut severity = PreflightSeverity::Workspace;

    // Phase 1: config structure
    if let Err(config_errors) = config::validate(config) {
        severity = PreflightSeverity::Config;
        for e in config_errors {
            errors.push(PreflightError {
                condition: e,
                location: "autopack.toml".to_string(),
                suggested_fix: "Correct the configuration value".to_string(),
            });
        }
        // Config problems make the remaining checks unreliable.
        return Err((severity, errors));
    }

    let runtime = RuntimeLayout::new(workspace_root);

    // Phase 2: store readability
    let store = match RunStore::open(&runtime.state_file()) {
        Ok(store) => Some(store),
        Err(e) => {
            errors.push(PreflightError {
                condition: format!("State store unreadable: {}", e),
                location: runtime.state_file().display().to_string(),
                suggested_fix: "Restore state.json from the last checkpoint or remove it to start fresh"
                    .to_string(),
            });
            None
        }
    };

    // Phase 3: phase scope sanity
    if let Some(store) = &store {
        for run in store_runs(store) {
            for phase in store.phases_for_run(&run) {
                for deliverable in &phase.deliverables {
                    if !path_in_scope(deliverable, &phase.scope.allowed_paths) {
                        errors.push(PreflightError {
                            condition: format!(
                                "Deliverable {} lies outside allowed_paths",
                                deliverable
                            ),
                            location: format!("phase {}", phase.phase_id),
                            suggested_fix: "Extend allowed_paths or correct the deliverable path"
                                .to_string(),
                        });
                    }
                }
                for protected in &phase.scope.protected_paths {
                    if path_in_scope(protected, &phase.scope.allowed_paths) {
                        errors.push(PreflightError {
                            condition: format!(
                                "Protected path {} overlaps allowed_paths",
                                protected
                            ),
                            location: format!("phase {}", phase.phase_id),
                            suggested_fix:
                                "Protected and allowed paths must be disjoint; remove the overlap"
                                    .to_string(),
                        });
                    }
                }
                if phase.scope.allowed_paths.is_empty() && !phase.state.is_terminal() {
                    errors.push(PreflightError {
                        condition: "Phase has an empty allowed_paths scope".to_string(),
                        location: format!("phase {}", phase.phase_id),
                        suggested_fix: "Declare at least one allowed path".to_string(),
                    });
                }
            }
        }
    }

    // Phase 4: pending queue schema
    let queue = PendingMovesQueue::new(runtime.pending_moves_file());
    if let Err(e) = queue.load() {
        errors.push(PreflightError {
            condition: format!("Pending moves queue unreadable: {}", e),
            location: runtime.pending_moves_file().display().to_string(),
            suggested_fix: "Fix or remove tidy_pending_moves.json (retry state will be lost)"
                .to_string(),
        });
    }

    // Phase 5: stale lock detection
    errors.extend(detect_stale_locks(runtime.runtime_dir()));

    if errors.is_empty() {
        Ok(())
    } else {
        Err((severity, errors))
    }
}

fn store_runs(store: &RunStore) -> Vec<String> {
    store.run_ids()
}

fn detect_stale_locks(runtime_dir: &Path) -> Vec<PreflightError> {
    let mut errors = Vec::new();
    let Ok(entries) = std::fs::read_dir(runtime_dir) else {
        return errors;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.ends_with(".pid") {
            continue;
        }
        let Ok(contents) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        let Ok(pid) = contents.trim().parse::<i32>() else {
            continue;
        };
        let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok();
        if !alive {
            errors.push(PreflightError {
                condition: format!("Stale lock: PID file {} names dead process {}", name, pid),
                location: entry.path().display().to_string(),
                suggested_fix: format!(
                    "Remove {} and its .lock counterpart to recover",
                    entry.path().display()
                ),
            });
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_workspace_passes() {
        let dir = tempfile::tempdir().unwrap();
        let config = AutopackConfig::default();
        assert!(run_preflight(&config, dir.path()).is_ok());
    }

    #[test]
    fn config_errors_dominate() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AutopackConfig::default();
        config.execution.max_attempts_per_phase = 0;
        let (severity, errors) = run_preflight(&config, dir.path()).unwrap_err();
        assert_eq!(severity, PreflightSeverity::Config);
        assert!(!errors.is_empty());
    }

    #[test]
    fn stale_pid_file_reported() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = dir.path().join(".autopack");
        std::fs::create_dir_all(&runtime).unwrap();
        std::fs::write(runtime.join("run-r1.pid"), "99999999").unwrap();

        let config = AutopackConfig::default();
        let (severity, errors) = run_preflight(&config, dir.path()).unwrap_err();
        assert_eq!(severity, PreflightSeverity::Workspace);
        assert!(errors.iter().any(|e| e.condition.contains("Stale lock")));
    }
}
