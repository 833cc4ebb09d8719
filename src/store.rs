use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::error::ApError;
use crate::types::{
    AttemptRecord, PhaseRecord, PhaseState, RunRecord, RunState, TestBaseline,
};

pub const STORE_SCHEMA_VERSION: u32 = 1;

/// Bounded reread attempts when a CAS update observes a stale phase state.
const CAS_REREAD_LIMIT: u32 = 3;

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct StoreFile {
    pub schema_version: u32,
    #[serde(default)]
    pub runs: Vec<RunRecord>,
    #[serde(default)]
    pub phases: Vec<PhaseRecord>,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<TestBaseline>,
}

/// Durable state for runs, phases, and attempts.
///
/// Single-writer discipline is enforced by the caller holding the per-run
/// advisory lock (`lock::acquire_run_lock`); the store itself only provides
/// linearized mutation through `&mut self` plus CAS-style guarded updates
/// that reread the file to detect a foreign writer.
#[derive(Debug)]
pub struct RunStore {
    path: PathBuf,
    data: StoreFile,
}

/// Filter for `failed_phases`.
#[derive(Debug, Clone, Default)]
pub struct FailedPhaseFilter {
    pub run_id: Option<String>,
    pub category: Option<crate::types::Category>,
}

impl RunStore {
    /// Open the store at `path`, creating an empty one if the file does not
    /// exist. A schema version newer than this binary understands is a
    /// configuration error; there is no silent migration.
    pub fn open(path: &Path) -> Result<Self, ApError> {
        if !path.exists() {
            return Ok(RunStore {
                path: path.to_path_buf(),
                data: StoreFile {
                    schema_version: STORE_SCHEMA_VERSION,
                    ..StoreFile::default()
                },
            });
        }

        let data = Self::read_file(path)?;
        Ok(RunStore {
            path: path.to_path_buf(),
            data,
        })
    }

    fn read_file(path: &Path) -> Result<StoreFile, ApError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ApError::Internal(format!("Failed to read {}: {}", path.display(), e)))?;
        let data: StoreFile = serde_json::from_str(&contents)
            .map_err(|e| ApError::Config(format!("Corrupt store {}: {}", path.display(), e)))?;
        if data.schema_version > STORE_SCHEMA_VERSION {
            return Err(ApError::Config(format!(
                "Store schema version {} is newer than supported version {}",
                data.schema_version, STORE_SCHEMA_VERSION
            )));
        }
        Ok(data)
    }

    /// Persist atomically: write to a temp file in the same directory, sync,
    /// then rename over the target.
    pub fn save(&self) -> Result<(), String> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| format!("Store path {} has no parent", self.path.display()))?;
        std::fs::create_dir_all(dir)
            .map_err(|e| format!("Failed to create {}: {}", dir.display(), e))?;

        let json = serde_json::to_string_pretty(&self.data)
            .map_err(|e| format!("Failed to serialize store: {}", e))?;

        let mut tmp = NamedTempFile::new_in(dir)
            .map_err(|e| format!("Failed to create temp file in {}: {}", dir.display(), e))?;
        tmp.write_all(json.as_bytes())
            .map_err(|e| format!("Failed to write temp store file: {}", e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| format!("Failed to sync temp store file: {}", e))?;
        tmp.persist(&self.path)
            .map_err(|e| format!("Failed to rename temp file to {}: {}", self.path.display(), e))?;
        Ok(())
    }

    /// Stable hash of the storage identity, surfaced to operators to detect
    /// cross-environment drift between the control plane and the executor.
    pub fn health_fingerprint(&self) -> String {
        let identity = self
            .path
            .canonicalize()
            .unwrap_or_else(|_| self.path.clone());
        let mut hasher = Sha256::new();
        hasher.update(identity.to_string_lossy().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // --- Runs ---

    pub fn insert_run(&mut self, run: RunRecord) -> Result<(), String> {
        if self.data.runs.iter().any(|r| r.run_id == run.run_id) {
            return Err(format!("Run {} already exists", run.run_id));
        }
        self.data.runs.push(run);
        self.save()
    }

    /// Every run id known to the store, including runs only referenced by
    /// phase rows.
    pub fn run_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.data.runs.iter().map(|r| r.run_id.clone()).collect();
        ids.extend(self.data.phases.iter().map(|p| p.run_id.clone()));
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn get_run(&self, run_id: &str) -> Result<&RunRecord, ApError> {
        self.data
            .runs
            .iter()
            .find(|r| r.run_id == run_id)
            .ok_or_else(|| ApError::RunNotFound(run_id.to_string()))
    }

    pub fn update_run_state(&mut self, run_id: &str, to: RunState) -> Result<(), ApError> {
        let run = self
            .data
            .runs
            .iter_mut()
            .find(|r| r.run_id == run_id)
            .ok_or_else(|| ApError::RunNotFound(run_id.to_string()))?;
        if !run.state.is_valid_transition(&to) {
            return Err(ApError::InvalidTransition(format!(
                "run {}: {:?} -> {:?}",
                run_id, run.state, to
            )));
        }
        run.state = to;
        let now = chrono::Utc::now();
        match to {
            RunState::Executing => run.started_at = Some(now),
            s if s.is_terminal() => run.finished_at = Some(now),
            _ => {}
        }
        self.save().map_err(ApError::Internal)
    }

    pub fn add_run_tokens(&mut self, run_id: &str, tokens: u64) -> Result<(), ApError> {
        let run = self
            .data
            .runs
            .iter_mut()
            .find(|r| r.run_id == run_id)
            .ok_or_else(|| ApError::RunNotFound(run_id.to_string()))?;
        run.tokens_used = run.tokens_used.saturating_add(tokens);
        self.save().map_err(ApError::Internal)
    }

    // --- Phases ---

    pub fn insert_phase(&mut self, phase: PhaseRecord) -> Result<(), String> {
        if self.data.phases.iter().any(|p| p.phase_id == phase.phase_id) {
            return Err(format!("Phase {} already exists", phase.phase_id));
        }
        self.data.phases.push(phase);
        self.save()
    }

    pub fn get_phase(&self, phase_id: &str) -> Result<&PhaseRecord, ApError> {
        self.data
            .phases
            .iter()
            .find(|p| p.phase_id == phase_id)
            .ok_or_else(|| ApError::PhaseNotFound(phase_id.to_string()))
    }

    /// Phases of a run, ordered by `phase_index`.
    pub fn phases_for_run(&self, run_id: &str) -> Vec<PhaseRecord> {
        let mut phases: Vec<PhaseRecord> = self
            .data
            .phases
            .iter()
            .filter(|p| p.run_id == run_id)
            .cloned()
            .collect();
        phases.sort_by_key(|p| p.phase_index);
        phases
    }

    /// The lowest-index QUEUED phase of a run, if any.
    pub fn next_queued_phase(&self, run_id: &str) -> Option<PhaseRecord> {
        self.phases_for_run(run_id)
            .into_iter()
            .find(|p| p.state == PhaseState::Queued)
    }

    pub fn failed_phases(&self, filter: &FailedPhaseFilter) -> Vec<PhaseRecord> {
        let mut phases: Vec<PhaseRecord> = self
            .data
            .phases
            .iter()
            .filter(|p| p.state == PhaseState::Failed)
            .filter(|p| {
                filter
                    .run_id
                    .as_deref()
                    .map(|r| p.run_id == r)
                    .unwrap_or(true)
            })
            .filter(|p| {
                filter
                    .category
                    .map(|c| p.category == c)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        phases.sort_by(|a, b| (&a.run_id, a.phase_index).cmp(&(&b.run_id, b.phase_index)));
        phases
    }

    /// Guarded phase update: the mutation runs only if the on-disk state
    /// still matches `expected`. On mismatch the file is reread and the check
    /// repeated, up to a bound; persistent mismatch surfaces as
    /// `StalePhaseState` so the caller can rebuild its view.
    pub fn update_phase_cas(
        &mut self,
        phase_id: &str,
        expected: PhaseState,
        mutate: impl Fn(&mut PhaseRecord),
    ) -> Result<(), ApError> {
        for _ in 0..CAS_REREAD_LIMIT {
            if self.path.exists() {
                self.data = Self::read_file(&self.path)?;
            }
            let phase = self
                .data
                .phases
                .iter_mut()
                .find(|p| p.phase_id == phase_id)
                .ok_or_else(|| ApError::PhaseNotFound(phase_id.to_string()))?;
            if phase.state != expected {
                continue;
            }
            mutate(phase);
            return self.save().map_err(ApError::Internal);
        }
        Err(ApError::StalePhaseState(phase_id.to_string()))
    }

    /// Unconditional phase mutation under the single-writer lock.
    pub fn update_phase(
        &mut self,
        phase_id: &str,
        mutate: impl FnOnce(&mut PhaseRecord),
    ) -> Result<(), ApError> {
        let phase = self
            .data
            .phases
            .iter_mut()
            .find(|p| p.phase_id == phase_id)
            .ok_or_else(|| ApError::PhaseNotFound(phase_id.to_string()))?;
        mutate(phase);
        self.save().map_err(ApError::Internal)
    }

    /// Validated phase state transition.
    pub fn transition_phase(&mut self, phase_id: &str, to: PhaseState) -> Result<(), ApError> {
        let phase = self
            .data
            .phases
            .iter_mut()
            .find(|p| p.phase_id == phase_id)
            .ok_or_else(|| ApError::PhaseNotFound(phase_id.to_string()))?;
        if !phase.state.is_valid_transition(&to) {
            return Err(ApError::InvalidTransition(format!(
                "phase {}: {:?} -> {:?}",
                phase_id, phase.state, to
            )));
        }
        phase.state = to;
        self.save().map_err(ApError::Internal)
    }

    // --- Attempts (append-only) ---

    pub fn append_attempt(&mut self, attempt: AttemptRecord) -> Result<(), String> {
        if self
            .data
            .attempts
            .iter()
            .any(|a| a.attempt_id == attempt.attempt_id)
        {
            return Err(format!("Attempt {} already recorded", attempt.attempt_id));
        }
        self.data.attempts.push(attempt);
        self.save()
    }

    pub fn phase_attempts(&self, phase_id: &str) -> Vec<AttemptRecord> {
        let mut attempts: Vec<AttemptRecord> = self
            .data
            .attempts
            .iter()
            .filter(|a| a.phase_id == phase_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.attempt_index);
        attempts
    }

    // --- Test baseline (created exactly once per run) ---

    pub fn baseline(&self) -> Option<&TestBaseline> {
        self.data.baseline.as_ref()
    }

    pub fn set_baseline(&mut self, baseline: TestBaseline) -> Result<(), String> {
        if let Some(existing) = &self.data.baseline {
            if existing.run_id == baseline.run_id {
                return Err(format!(
                    "Baseline for run {} already captured",
                    baseline.run_id
                ));
            }
        }
        self.data.baseline = Some(baseline);
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::types::{Category, Complexity, PhaseScope};

    fn make_run(run_id: &str) -> RunRecord {
        RunRecord {
            run_id: run_id.to_string(),
            project_id: "proj".to_string(),
            state: RunState::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            token_budget: 100_000,
            tokens_used: 0,
        }
    }

    fn make_phase(phase_id: &str, run_id: &str, index: u32) -> PhaseRecord {
        PhaseRecord {
            phase_id: phase_id.to_string(),
            run_id: run_id.to_string(),
            phase_index: index,
            goal: "do the thing".to_string(),
            category: Category::Docs,
            complexity: Complexity::Low,
            deliverables: vec!["docs/x.md".to_string()],
            scope: PhaseScope {
                allowed_paths: vec!["docs/".to_string()],
                ..PhaseScope::default()
            },
            state: PhaseState::Queued,
            attempts_used: 0,
            max_attempts: 5,
            last_failure_reason: None,
            last_fingerprint: None,
            symbol_manifest: vec![],
        }
    }

    #[test]
    fn open_missing_creates_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(&dir.path().join("state.json")).unwrap();
        assert!(store.data.runs.is_empty());
    }

    #[test]
    fn save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut store = RunStore::open(&path).unwrap();
        store.insert_run(make_run("r1")).unwrap();
        store.insert_phase(make_phase("p1", "r1", 0)).unwrap();

        let reloaded = RunStore::open(&path).unwrap();
        assert_eq!(reloaded.get_run("r1").unwrap().run_id, "r1");
        assert_eq!(reloaded.phases_for_run("r1").len(), 1);
    }

    #[test]
    fn newer_schema_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{"schema_version": 99}"#).unwrap();
        let err = RunStore::open(&path).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn run_state_transitions_validated() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RunStore::open(&dir.path().join("state.json")).unwrap();
        store.insert_run(make_run("r1")).unwrap();

        store.update_run_state("r1", RunState::Executing).unwrap();
        assert!(store.get_run("r1").unwrap().started_at.is_some());

        let err = store.update_run_state("r1", RunState::Queued).unwrap_err();
        assert!(matches!(err, ApError::InvalidTransition(_)));

        store.update_run_state("r1", RunState::DoneSuccess).unwrap();
        assert!(store.get_run("r1").unwrap().finished_at.is_some());
    }

    #[test]
    fn next_queued_honors_phase_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RunStore::open(&dir.path().join("state.json")).unwrap();
        store.insert_run(make_run("r1")).unwrap();
        store.insert_phase(make_phase("p2", "r1", 2)).unwrap();
        store.insert_phase(make_phase("p0", "r1", 0)).unwrap();
        store.insert_phase(make_phase("p1", "r1", 1)).unwrap();

        assert_eq!(store.next_queued_phase("r1").unwrap().phase_id, "p0");

        store.transition_phase("p0", PhaseState::Executing).unwrap();
        store.transition_phase("p0", PhaseState::Complete).unwrap();
        assert_eq!(store.next_queued_phase("r1").unwrap().phase_id, "p1");
    }

    #[test]
    fn cas_update_applies_when_state_matches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut store = RunStore::open(&path).unwrap();
        store.insert_run(make_run("r1")).unwrap();
        store.insert_phase(make_phase("p1", "r1", 0)).unwrap();

        store
            .update_phase_cas("p1", PhaseState::Queued, |p| p.attempts_used = 1)
            .unwrap();
        assert_eq!(store.get_phase("p1").unwrap().attempts_used, 1);
    }

    #[test]
    fn cas_update_stale_state_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut store = RunStore::open(&path).unwrap();
        store.insert_run(make_run("r1")).unwrap();
        store.insert_phase(make_phase("p1", "r1", 0)).unwrap();

        let err = store
            .update_phase_cas("p1", PhaseState::Executing, |p| p.attempts_used = 9)
            .unwrap_err();
        assert!(matches!(err, ApError::StalePhaseState(_)));
        assert_eq!(store.get_phase("p1").unwrap().attempts_used, 0);
    }

    #[test]
    fn attempts_are_append_only_and_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RunStore::open(&dir.path().join("state.json")).unwrap();
        store.insert_run(make_run("r1")).unwrap();
        store.insert_phase(make_phase("p1", "r1", 0)).unwrap();

        let attempt = |i: u32| AttemptRecord {
            attempt_id: format!("p1.a{}", i),
            phase_id: "p1".to_string(),
            attempt_index: i,
            role: crate::types::Role::Builder,
            model_id: "sonnet".to_string(),
            started_at: Utc::now(),
            finished_at: None,
            outcome: crate::types::AttemptOutcome::BuilderFail,
            tokens_in: 10,
            tokens_out: 20,
            error_digest: None,
        };

        store.append_attempt(attempt(2)).unwrap();
        store.append_attempt(attempt(1)).unwrap();
        assert!(store.append_attempt(attempt(1)).is_err());

        let attempts = store.phase_attempts("p1");
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].attempt_index, 1);
    }

    #[test]
    fn baseline_captured_once_per_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RunStore::open(&dir.path().join("state.json")).unwrap();
        let baseline = TestBaseline {
            run_id: "r1".to_string(),
            t0_failures: ["t_old".to_string()].into_iter().collect(),
            captured_at: Utc::now(),
        };
        store.set_baseline(baseline.clone()).unwrap();
        assert!(store.set_baseline(baseline).is_err());
    }

    #[test]
    fn health_fingerprint_is_stable_per_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = RunStore::open(&path).unwrap();
        let a = store.health_fingerprint();
        let b = store.health_fingerprint();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }
}
