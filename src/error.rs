use crate::types::RiskLevel;

/// Engine error taxonomy.
///
/// Classification drives propagation:
/// - Fatal: abort the run with DONE_FAILED and record an incident
/// - Retryable: transient, bounded retry with jitter at the call site
/// - Everything else surfaces as a typed attempt outcome, not an error
#[derive(Debug, thiserror::Error)]
pub enum ApError {
    // Fatal -- abort the run
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Policy violation on {path}: {reason}")]
    PolicyViolation { path: String, reason: String },

    #[error("Storage identity drift: executor sees {executor}, control plane reports {api}")]
    StorageDrift { executor: String, api: String },

    #[error("Second writer detected for run {0}")]
    ConflictingWriter(String),

    // Deliberate refusal, surfaced to the operator with exit code 3
    #[error("Quota exhausted for model {model} (strategy {strategy}); refusing to downgrade")]
    QuotaBlocked { model: String, strategy: String },

    // Retryable
    #[error("Phase state changed under CAS update for {0}")]
    StalePhaseState(String),

    #[error("Transient provider error: {0}")]
    ProviderTransient(String),

    #[error("File locked: {0}")]
    IoLocked(String),

    // Skip -- log and let the caller's loop move on
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Phase not found: {0}")]
    PhaseNotFound(String),

    #[error("Approval not found: {0}")]
    ApprovalNotFound(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Approval denied (risk {risk}): {reason}")]
    ApprovalDenied { risk: RiskLevel, reason: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApError {
    /// Returns true if the error is transient and the operation should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApError::StalePhaseState(_) | ApError::ProviderTransient(_) | ApError::IoLocked(_)
        )
    }

    /// Returns true if the error is unrecoverable and the supervisor should
    /// abort the run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ApError::Config(_)
                | ApError::PolicyViolation { .. }
                | ApError::StorageDrift { .. }
                | ApError::ConflictingWriter(_)
        )
    }

    /// Process exit code for CLI surfacing.
    ///
    /// 0 clean, 1 invariant violation, 2 configuration error, 3 quota block,
    /// 4 workspace-structure violation.
    pub fn exit_code(&self) -> i32 {
        match self {
            ApError::Config(_) => 2,
            ApError::QuotaBlocked { .. } => 3,
            _ => 1,
        }
    }
}

/// Bridge: allows `?` to convert `ApError` into `String` in plumbing that
/// uses `Result<T, String>`.
impl From<ApError> for String {
    fn from(err: ApError) -> String {
        err.to_string()
    }
}
