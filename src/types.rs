use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Enums ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Queued,
    Executing,
    DoneSuccess,
    DoneFailed,
    DoneAborted,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::DoneSuccess | RunState::DoneFailed | RunState::DoneAborted
        )
    }

    /// Validates whether a transition from this state to `to` is allowed.
    ///
    /// Runs move forward only: Queued -> Executing -> one of the terminal
    /// states. Terminal states never transition.
    pub fn is_valid_transition(&self, to: &RunState) -> bool {
        use RunState::*;
        matches!(
            (self, to),
            (Queued, Executing)
                | (Executing, DoneSuccess)
                | (Executing, DoneFailed)
                | (Executing, DoneAborted)
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    #[default]
    Queued,
    Executing,
    ApprovalPending,
    ReplanRequested,
    Blocked,
    Complete,
    Failed,
}

impl PhaseState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PhaseState::Complete | PhaseState::Failed)
    }

    /// Validates whether a transition from this state to `to` is allowed.
    ///
    /// Rules:
    /// - Queued -> Executing
    /// - Executing <-> ApprovalPending (park and resume)
    /// - Executing -> Blocked (gate failure with attempts remaining) and back
    /// - Executing -> ReplanRequested -> Queued (supervisor resets attempts)
    /// - Executing | Blocked | ApprovalPending -> Failed
    /// - Complete only from Executing; terminal states never transition
    pub fn is_valid_transition(&self, to: &PhaseState) -> bool {
        use PhaseState::*;
        matches!(
            (self, to),
            (Queued, Executing)
                | (Executing, ApprovalPending)
                | (ApprovalPending, Executing)
                | (Executing, Blocked)
                | (Blocked, Executing)
                | (Executing, ReplanRequested)
                | (ReplanRequested, Queued)
                | (Executing, Complete)
                | (Executing, Failed)
                | (Blocked, Failed)
                | (ApprovalPending, Failed)
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    SecurityAuthChange,
    SchemaContractChange,
    ExternalFeatureReuse,
    CoreBackendHigh,
    Docs,
    Tests,
    #[default]
    Other,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Category::SecurityAuthChange => "security_auth_change",
            Category::SchemaContractChange => "schema_contract_change",
            Category::ExternalFeatureReuse => "external_feature_reuse",
            Category::CoreBackendHigh => "core_backend_high",
            Category::Docs => "docs",
            Category::Tests => "tests",
            Category::Other => "other",
        };
        write!(f, "{}", s)
    }
}

pub fn parse_category(s: &str) -> Result<Category, String> {
    match s.to_lowercase().as_str() {
        "security_auth_change" => Ok(Category::SecurityAuthChange),
        "schema_contract_change" => Ok(Category::SchemaContractChange),
        "external_feature_reuse" => Ok(Category::ExternalFeatureReuse),
        "core_backend_high" => Ok(Category::CoreBackendHigh),
        "docs" => Ok(Category::Docs),
        "tests" => Ok(Category::Tests),
        "other" => Ok(Category::Other),
        _ => Err(format!(
            "Invalid category '{}': expected security_auth_change, schema_contract_change, \
             external_feature_reuse, core_backend_high, docs, tests, or other",
            s
        )),
    }
}

impl Category {
    /// Categories whose changes start at elevated risk regardless of signals.
    pub fn is_safety_critical(&self) -> bool {
        matches!(
            self,
            Category::SecurityAuthChange
                | Category::SchemaContractChange
                | Category::ExternalFeatureReuse
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Complexity {
    #[default]
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Complexity::Low => write!(f, "LOW"),
            Complexity::Medium => write!(f, "MEDIUM"),
            Complexity::High => write!(f, "HIGH"),
        }
    }
}

pub fn parse_complexity(s: &str) -> Result<Complexity, String> {
    match s.to_lowercase().as_str() {
        "low" | "l" => Ok(Complexity::Low),
        "medium" | "m" => Ok(Complexity::Medium),
        "high" | "h" => Ok(Complexity::High),
        _ => Err(format!(
            "Invalid complexity '{}': expected LOW, MEDIUM, or HIGH",
            s
        )),
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Builder,
    Auditor,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Builder => write!(f, "builder"),
            Role::Auditor => write!(f, "auditor"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Ok,
    BuilderFail,
    ApplyFail,
    TestRegression,
    DeliverablesFail,
    SymbolFail,
    QualityBlock,
    Truncated,
    ApprovalDenied,
    ApprovalTimeout,
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AttemptOutcome::Ok => "OK",
            AttemptOutcome::BuilderFail => "BUILDER_FAIL",
            AttemptOutcome::ApplyFail => "APPLY_FAIL",
            AttemptOutcome::TestRegression => "TEST_REGRESSION",
            AttemptOutcome::DeliverablesFail => "DELIVERABLES_FAIL",
            AttemptOutcome::SymbolFail => "SYMBOL_FAIL",
            AttemptOutcome::QualityBlock => "QUALITY_BLOCK",
            AttemptOutcome::Truncated => "TRUNCATED",
            AttemptOutcome::ApprovalDenied => "APPROVAL_DENIED",
            AttemptOutcome::ApprovalTimeout => "APPROVAL_TIMEOUT",
        };
        write!(f, "{}", s)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PatchFormat {
    UnifiedDiff,
    StructuredEdits,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PatchOp {
    Create,
    Modify,
    Delete,
}

#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default, Hash,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "LOW"),
            RiskLevel::Medium => write!(f, "MEDIUM"),
            RiskLevel::High => write!(f, "HIGH"),
            RiskLevel::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionCategory {
    ClearFix,
    Threshold,
    Risky,
    Ambiguous,
}

/// Governance ruling on a patch proposal.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Ruling {
    AutoApprove,
    RequireApproval,
    /// Outright rejection; no approval path exists for this proposal.
    Reject(String),
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalDecision {
    #[default]
    Pending,
    Approved,
    Denied,
    TimedOut,
}

impl ApprovalDecision {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalDecision::Pending)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalizerOutcome {
    Complete,
    Blocked,
    Failed,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HintKind {
    PathFix,
    DeliverableMissing,
    Truncation,
    SymbolLost,
    TestRegression,
    ApprovalDenied,
}

/// Provider stop reason reported alongside a Builder/Auditor reply.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    EndTurn,
    MaxTokens,
    Error,
}

// --- Structs ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RunRecord {
    pub run_id: String,
    pub project_id: String,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub token_budget: u64,
    #[serde(default)]
    pub tokens_used: u64,
}

/// The declared filesystem scope of a phase.
///
/// Invariants (checked by preflight and governance, not by construction):
/// - deliverables lie under `allowed_paths`
/// - `protected_paths` and `allowed_paths` are disjoint
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct PhaseScope {
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub readonly_context: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub protected_paths: Vec<String>,
}

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PhaseRecord {
    pub phase_id: String,
    pub run_id: String,
    /// Stable ordering key; phases of a run execute in strictly increasing order.
    pub phase_index: u32,
    pub goal: String,
    pub category: Category,
    pub complexity: Complexity,
    /// Workspace-relative paths the phase must produce or modify.
    #[serde(default)]
    pub deliverables: Vec<String>,
    #[serde(default)]
    pub scope: PhaseScope,
    #[serde(default)]
    pub state: PhaseState,
    #[serde(default)]
    pub attempts_used: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fingerprint: Option<String>,
    /// Symbol-preservation manifest: declared symbols per deliverable that
    /// must still resolve after every apply. Empty when not used.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub symbol_manifest: Vec<SymbolRequirement>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SymbolRequirement {
    pub path: String,
    pub symbols: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AttemptRecord {
    pub attempt_id: String,
    pub phase_id: String,
    /// 1-based, monotone within a phase.
    pub attempt_index: u32,
    pub role: Role,
    pub model_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: AttemptOutcome,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_digest: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PatchOperation {
    pub op: PatchOp,
    /// Workspace-relative path.
    pub path: String,
    /// Full replacement content (structured_edits create/modify).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Unified-diff hunk text (unified_diff modify).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hunks: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PatchProposal {
    pub proposal_id: String,
    pub attempt_id: String,
    pub format: PatchFormat,
    pub operations: Vec<PatchOperation>,
    #[serde(default)]
    pub declared_deliverables: Vec<String>,
}

impl PatchProposal {
    /// Distinct top-level path components touched by the proposal.
    pub fn top_level_areas(&self) -> std::collections::BTreeSet<String> {
        self.operations
            .iter()
            .filter_map(|op| {
                op.path
                    .split('/')
                    .next()
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            })
            .collect()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct RiskSignals {
    #[serde(default)]
    pub protected_hits: u32,
    #[serde(default)]
    pub large_deletion_lines: u64,
    #[serde(default)]
    pub cross_module: bool,
    #[serde(default)]
    pub destructive: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RiskAssessment {
    pub proposal_id: String,
    pub risk_level: RiskLevel,
    pub decision_category: DecisionCategory,
    pub signals: RiskSignals,
    pub requires_approval: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ApprovalRequest {
    pub approval_id: String,
    pub phase_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub proposal_id: String,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub decision: ApprovalDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TestBaseline {
    pub run_id: String,
    /// Test IDs failing at T0. Pre-existing failures never block a phase.
    pub t0_failures: std::collections::BTreeSet<String>,
    pub captured_at: DateTime<Utc>,
}

/// Per-gate evaluation detail recorded in a finalizer decision.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GateResult {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
}

impl GateResult {
    pub fn pass() -> Self {
        GateResult {
            passed: true,
            reasons: vec![],
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        GateResult {
            passed: false,
            reasons: vec![reason.into()],
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FinalizerDecision {
    pub phase_id: String,
    pub attempt_id: String,
    pub gate0_ci: GateResult,
    pub gate1_quality: GateResult,
    pub gate2_deliverables: GateResult,
    pub gate3_symbols: GateResult,
    pub outcome: FinalizerOutcome,
    /// Ordered reasons from the first failing gate onward.
    #[serde(default)]
    pub reasons: Vec<String>,
}

/// A structured correction carried into the next Builder attempt.
/// Never free text; bounded and newest-first at the collection site.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct LearningHint {
    pub kind: HintKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

pub const MAX_LEARNING_HINTS: usize = 32;

/// Prepend `new_hints` to `hints`, dedupe preserving first occurrence, and
/// truncate to the hint budget. Newest entries stay at the front.
pub fn merge_hints(hints: &mut Vec<LearningHint>, new_hints: Vec<LearningHint>) {
    let mut merged: Vec<LearningHint> = Vec::with_capacity(hints.len() + new_hints.len());
    let mut seen = std::collections::HashSet::new();
    for hint in new_hints.into_iter().chain(hints.drain(..)) {
        if seen.insert(hint.clone()) {
            merged.push(hint);
        }
    }
    merged.truncate(MAX_LEARNING_HINTS);
    *hints = merged;
}
