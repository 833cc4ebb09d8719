use std::path::{Path, PathBuf};

/// Resolves every run-local artifact path from `(run_id, phase_id, kind)`.
///
/// Nothing else in the engine computes artifact paths; writes outside the
/// run-local root are forbidden (the Tidy consolidator's allowlist is the
/// single exception, and it builds on these resolvers too).
#[derive(Clone, Debug)]
pub struct ArtifactLayout {
    run_root: PathBuf,
}

impl ArtifactLayout {
    /// `workspace_root/runs/<family>/<run_id>/`
    pub fn new(workspace_root: &Path, family: &str, run_id: &str) -> Self {
        ArtifactLayout {
            run_root: workspace_root.join("runs").join(family).join(run_id),
        }
    }

    pub fn run_root(&self) -> &Path {
        &self.run_root
    }

    pub fn phase_summary(&self, phase_id: &str) -> PathBuf {
        self.run_root
            .join("phases")
            .join(format!("{}.summary", phase_id))
    }

    pub fn proof(&self, phase_id: &str) -> PathBuf {
        self.run_root
            .join("proofs")
            .join(format!("{}.json", phase_id))
    }

    pub fn diagnostics_dir(&self, phase_id: &str) -> PathBuf {
        self.run_root.join("diagnostics").join(phase_id)
    }

    pub fn error_file(&self, error_id: &str) -> PathBuf {
        self.run_root
            .join("errors")
            .join(format!("{}.json", error_id))
    }

    pub fn checkpoint_dir(&self, phase_id: &str) -> PathBuf {
        self.run_root
            .join("checkpoints")
            .join(format!("save-before-{}", phase_id))
    }

    pub fn handoff_dir(&self) -> PathBuf {
        self.run_root.join("handoff")
    }

    pub fn approvals_audit(&self) -> PathBuf {
        self.handoff_dir().join("approvals.jsonl")
    }

    /// Result-file path for a Builder/Auditor subprocess reply.
    pub fn builder_reply(&self, phase_id: &str, attempt_index: u32) -> PathBuf {
        self.run_root
            .join("handoff")
            .join(format!("proposal_{}_{}.json", phase_id, attempt_index))
    }

    /// True when `path` lies under this run's root.
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.run_root)
    }
}

/// Resolves workspace-global engine paths (not run-scoped).
#[derive(Clone, Debug)]
pub struct RuntimeLayout {
    root: PathBuf,
}

impl RuntimeLayout {
    pub fn new(workspace_root: &Path) -> Self {
        RuntimeLayout {
            root: workspace_root.join(".autopack"),
        }
    }

    /// Directory holding locks, PID files, and engine state.
    pub fn runtime_dir(&self) -> &Path {
        &self.root
    }

    pub fn state_file(&self) -> PathBuf {
        self.root.join("state.json")
    }

    /// The append-only telemetry event log, shared across runs.
    pub fn telemetry_file(&self) -> PathBuf {
        self.root.join("telemetry.jsonl")
    }

    pub fn baseline_file(&self, run_id: &str) -> PathBuf {
        self.root.join(format!("baseline_{}.json", run_id))
    }

    pub fn pending_moves_file(&self) -> PathBuf {
        self.root.join("tidy_pending_moves.json")
    }

    pub fn drain_session_file(&self, session_id: &str) -> PathBuf {
        self.root
            .join("batch_drain_sessions")
            .join(format!("{}.json", session_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_local_paths_are_scoped() {
        let layout = ArtifactLayout::new(Path::new("/ws"), "alpha", "r1");
        assert_eq!(
            layout.phase_summary("p1"),
            PathBuf::from("/ws/runs/alpha/r1/phases/p1.summary")
        );
        assert_eq!(
            layout.proof("p1"),
            PathBuf::from("/ws/runs/alpha/r1/proofs/p1.json")
        );
        assert_eq!(
            layout.checkpoint_dir("p1"),
            PathBuf::from("/ws/runs/alpha/r1/checkpoints/save-before-p1")
        );
        assert_eq!(
            layout.diagnostics_dir("p1"),
            PathBuf::from("/ws/runs/alpha/r1/diagnostics/p1")
        );
        assert!(layout.contains(&layout.error_file("e1")));
        assert!(!layout.contains(Path::new("/ws/runs/alpha/other")));
    }

    #[test]
    fn runtime_paths() {
        let rt = RuntimeLayout::new(Path::new("/ws"));
        assert_eq!(rt.state_file(), PathBuf::from("/ws/.autopack/state.json"));
        assert_eq!(
            rt.pending_moves_file(),
            PathBuf::from("/ws/.autopack/tidy_pending_moves.json")
        );
        assert_eq!(
            rt.drain_session_file("s1"),
            PathBuf::from("/ws/.autopack/batch_drain_sessions/s1.json")
        );
    }
}
