#![allow(dead_code)]

use std::path::Path;

use chrono::Utc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use autopack::baseline::MockTestRunner;
use autopack::builder::{AgentReply, MockAgentRunner};
use autopack::config::AutopackConfig;
use autopack::executor::ExecutorEnv;
use autopack::layout::RuntimeLayout;
use autopack::memory::NullMemory;
use autopack::router::StaticQuota;
use autopack::store::RunStore;
use autopack::telemetry::TelemetrySink;
use autopack::types::{
    Category, Complexity, PatchFormat, PatchOp, PatchOperation, PatchProposal, PhaseRecord,
    PhaseScope, PhaseState, RunRecord, RunState, StopReason,
};

/// Owns every long-lived collaborator an `ExecutorEnv` borrows.
pub struct Harness {
    pub dir: TempDir,
    pub config: AutopackConfig,
    pub runtime: RuntimeLayout,
    pub telemetry: TelemetrySink,
    pub quota: StaticQuota,
    pub memory: NullMemory,
    pub cancel: CancellationToken,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(AutopackConfig::default())
    }

    pub fn with_config(config: AutopackConfig) -> Self {
        let dir = TempDir::new().expect("create tempdir");
        let runtime = RuntimeLayout::new(dir.path());
        let telemetry = TelemetrySink::new(runtime.telemetry_file());
        Harness {
            dir,
            config,
            runtime,
            telemetry,
            quota: StaticQuota::new(),
            memory: NullMemory,
            cancel: CancellationToken::new(),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn store(&self) -> RunStore {
        RunStore::open(&self.runtime.state_file()).expect("open store")
    }

    pub fn env<'a>(
        &'a self,
        agent: &'a MockAgentRunner,
        tests: &'a MockTestRunner,
    ) -> ExecutorEnv<'a, MockAgentRunner, MockTestRunner, NullMemory> {
        ExecutorEnv {
            config: &self.config,
            agent,
            tests,
            memory: &self.memory,
            quota: &self.quota,
            telemetry: &self.telemetry,
            runtime: &self.runtime,
            workspace_root: self.dir.path(),
            cancel: &self.cancel,
        }
    }
}

/// Creates a `RunRecord` with minimal defaults and a generous token budget.
pub fn make_run(run_id: &str) -> RunRecord {
    RunRecord {
        run_id: run_id.to_string(),
        project_id: "proj".to_string(),
        state: RunState::Queued,
        created_at: Utc::now(),
        started_at: None,
        finished_at: None,
        token_budget: 1_000_000,
        tokens_used: 0,
    }
}

/// Creates a docs-category phase scoped to `docs/` with one deliverable.
pub fn make_docs_phase(phase_id: &str, run_id: &str, index: u32) -> PhaseRecord {
    PhaseRecord {
        phase_id: phase_id.to_string(),
        run_id: run_id.to_string(),
        phase_index: index,
        goal: format!("Produce documentation for {}", phase_id),
        category: Category::Docs,
        complexity: Complexity::Low,
        deliverables: vec![format!("docs/{}.md", phase_id)],
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

/// A builder reply proposing a single file create.
pub fn reply_create(proposal_id: &str, path: &str, content: &str) -> AgentReply {
    AgentReply {
        stop_reason: StopReason::EndTurn,
        tokens_in: 100,
        tokens_out: 200,
        proposal: Some(PatchProposal {
            proposal_id: proposal_id.to_string(),
            attempt_id: String::new(),
            format: PatchFormat::StructuredEdits,
            operations: vec![PatchOperation {
                op: PatchOp::Create,
                path: path.to_string(),
                content: Some(content.to_string()),
                hunks: None,
            }],
            declared_deliverables: vec![path.to_string()],
        }),
        audit: None,
    }
}

/// A builder reply proposing a modify of an existing file.
pub fn reply_modify(proposal_id: &str, path: &str, content: &str) -> AgentReply {
    AgentReply {
        stop_reason: StopReason::EndTurn,
        tokens_in: 100,
        tokens_out: 200,
        proposal: Some(PatchProposal {
            proposal_id: proposal_id.to_string(),
            attempt_id: String::new(),
            format: PatchFormat::StructuredEdits,
            operations: vec![PatchOperation {
                op: PatchOp::Modify,
                path: path.to_string(),
                content: Some(content.to_string()),
                hunks: None,
            }],
            declared_deliverables: vec![path.to_string()],
        }),
        audit: None,
    }
}

/// An auditor reply with the given verdict.
pub fn reply_audit(approve: bool, findings: &[&str]) -> AgentReply {
    use autopack::builder::{AuditReport, AuditVerdict};
    AgentReply {
        stop_reason: StopReason::EndTurn,
        tokens_in: 50,
        tokens_out: 50,
        proposal: None,
        audit: Some(AuditReport {
            verdict: if approve {
                AuditVerdict::Approve
            } else {
                AuditVerdict::Block
            },
            findings: findings.iter().map(|s| s.to_string()).collect(),
        }),
    }
}

/// Clean-suite results for one baseline capture plus `attempts` delta runs.
pub fn green_tests(attempts: usize) -> MockTestRunner {
    MockTestRunner::new(vec![Ok(Default::default()); attempts + 1])
}
