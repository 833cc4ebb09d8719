use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ApError;
use crate::types::{ApprovalDecision, ApprovalRequest, RiskLevel};

/// Cap for the executor's approval polling backoff.
const POLL_BACKOFF_CAP: Duration = Duration::from_secs(30);
const POLL_BACKOFF_BASE_MS: u64 = 500;

/// Holds pending approvals, resolves decisions, times out stale requests,
/// and appends every terminal decision to an immutable audit log.
///
/// The gateway serializes decisions per approval id by construction: all
/// mutation goes through `&mut self` owned by the supervisor task.
pub struct ApprovalGateway {
    requests: HashMap<String, ApprovalRequest>,
    timeout: chrono::Duration,
    /// Test-only: every opened request resolves immediately as APPROVED.
    auto_approve: bool,
    audit_path: Option<PathBuf>,
    next_id: u64,
}

#[derive(Serialize)]
struct AuditRecord<'a> {
    approval_id: &'a str,
    phase_id: &'a str,
    decision: ApprovalDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    actor: Option<&'a str>,
    ts: DateTime<Utc>,
}

impl ApprovalGateway {
    pub fn new(timeout_seconds: u64, auto_approve: bool, audit_path: Option<PathBuf>) -> Self {
        ApprovalGateway {
            requests: HashMap::new(),
            timeout: chrono::Duration::seconds(timeout_seconds as i64),
            auto_approve,
            audit_path,
            next_id: 1,
        }
    }

    /// Open an approval for a proposal. Returns the approval id.
    pub fn open(
        &mut self,
        phase_id: &str,
        proposal_id: &str,
        risk: RiskLevel,
    ) -> Result<String, String> {
        let now = Utc::now();
        let approval_id = format!("apr-{}-{}", phase_id, self.next_id);
        self.next_id += 1;

        let mut request = ApprovalRequest {
            approval_id: approval_id.clone(),
            phase_id: phase_id.to_string(),
            created_at: now,
            expires_at: now + self.timeout,
            proposal_id: proposal_id.to_string(),
            risk_level: risk,
            decision: ApprovalDecision::Pending,
            decided_by: None,
            decided_at: None,
        };

        if self.auto_approve {
            request.decision = ApprovalDecision::Approved;
            request.decided_by = Some("auto".to_string());
            request.decided_at = Some(now);
            self.append_audit(&request)?;
        }

        self.requests.insert(approval_id.clone(), request);
        Ok(approval_id)
    }

    /// Current decision, applying the expiry clock. A pending request past
    /// its deadline becomes TIMED_OUT (terminal, audited).
    pub fn poll(&mut self, approval_id: &str) -> Result<ApprovalDecision, ApError> {
        self.poll_at(approval_id, Utc::now())
    }

    pub fn poll_at(
        &mut self,
        approval_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ApprovalDecision, ApError> {
        let request = self
            .requests
            .get_mut(approval_id)
            .ok_or_else(|| ApError::ApprovalNotFound(approval_id.to_string()))?;

        if request.decision == ApprovalDecision::Pending && now >= request.expires_at {
            request.decision = ApprovalDecision::TimedOut;
            request.decided_at = Some(now);
            let request = request.clone();
            self.append_audit(&request).map_err(ApError::Internal)?;
            return Ok(ApprovalDecision::TimedOut);
        }

        Ok(request.decision)
    }

    /// Record an operator decision. Terminal decisions are immutable; a
    /// second decision (or deciding "pending") is an invalid transition.
    pub fn decide(
        &mut self,
        approval_id: &str,
        decision: ApprovalDecision,
        actor: &str,
    ) -> Result<(), ApError> {
        if !decision.is_terminal() {
            return Err(ApError::InvalidTransition(format!(
                "approval {}: cannot decide {:?}",
                approval_id, decision
            )));
        }

        let request = self
            .requests
            .get_mut(approval_id)
            .ok_or_else(|| ApError::ApprovalNotFound(approval_id.to_string()))?;

        if request.decision.is_terminal() {
            return Err(ApError::InvalidTransition(format!(
                "approval {} already decided: {:?}",
                approval_id, request.decision
            )));
        }

        request.decision = decision;
        request.decided_by = Some(actor.to_string());
        request.decided_at = Some(Utc::now());
        let request = request.clone();
        self.append_audit(&request).map_err(ApError::Internal)
    }

    pub fn get(&self, approval_id: &str) -> Option<&ApprovalRequest> {
        self.requests.get(approval_id)
    }

    /// Pending approvals for a phase; the executor checks this in preflight.
    pub fn pending_for_phase(&self, phase_id: &str) -> Vec<&ApprovalRequest> {
        self.requests
            .values()
            .filter(|r| r.phase_id == phase_id && r.decision == ApprovalDecision::Pending)
            .collect()
    }

    fn append_audit(&self, request: &ApprovalRequest) -> Result<(), String> {
        let Some(path) = &self.audit_path else {
            return Ok(());
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| format!("Failed to create {}: {}", dir.display(), e))?;
        }
        let record = AuditRecord {
            approval_id: &request.approval_id,
            phase_id: &request.phase_id,
            decision: request.decision,
            actor: request.decided_by.as_deref(),
            ts: request.decided_at.unwrap_or_else(Utc::now),
        };
        let line = serde_json::to_string(&record)
            .map_err(|e| format!("Failed to serialize audit record: {}", e))?;
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map_err(|e| format!("Failed to open audit log {}: {}", path.display(), e))?;
        writeln!(file, "{}", line)
            .map_err(|e| format!("Failed to append audit record: {}", e))
    }
}

/// Exponential approval-poll backoff with deterministic jitter, capped at
/// 30 seconds. `seed` varies the jitter per phase so concurrent runs do not
/// poll in lockstep.
pub fn poll_backoff(poll_count: u32, seed: u64) -> Duration {
    let exp = poll_count.min(16);
    let base_ms = POLL_BACKOFF_BASE_MS.saturating_mul(1u64 << exp);
    let capped = base_ms.min(POLL_BACKOFF_CAP.as_millis() as u64);
    // +/- 25% jitter derived from (seed, poll_count)
    let jitter_span = capped / 4;
    if jitter_span == 0 {
        return Duration::from_millis(capped);
    }
    let mix = seed
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(poll_count as u64);
    let offset = mix % (jitter_span * 2 + 1);
    Duration::from_millis(capped - jitter_span + offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> ApprovalGateway {
        ApprovalGateway::new(3600, false, None)
    }

    #[test]
    fn open_then_decide_then_immutable() {
        let mut gw = gateway();
        let id = gw.open("p1", "prop1", RiskLevel::High).unwrap();
        assert_eq!(gw.poll(&id).unwrap(), ApprovalDecision::Pending);

        gw.decide(&id, ApprovalDecision::Approved, "operator").unwrap();
        assert_eq!(gw.poll(&id).unwrap(), ApprovalDecision::Approved);

        let err = gw.decide(&id, ApprovalDecision::Denied, "operator").unwrap_err();
        assert!(matches!(err, ApError::InvalidTransition(_)));
    }

    #[test]
    fn cannot_decide_pending() {
        let mut gw = gateway();
        let id = gw.open("p1", "prop1", RiskLevel::High).unwrap();
        assert!(gw.decide(&id, ApprovalDecision::Pending, "x").is_err());
    }

    #[test]
    fn pending_request_times_out() {
        let mut gw = gateway();
        let id = gw.open("p1", "prop1", RiskLevel::High).unwrap();
        let later = Utc::now() + chrono::Duration::seconds(3601);
        assert_eq!(gw.poll_at(&id, later).unwrap(), ApprovalDecision::TimedOut);
        // Timeout is terminal
        assert!(gw
            .decide(&id, ApprovalDecision::Approved, "late")
            .is_err());
    }

    #[test]
    fn auto_approve_resolves_immediately() {
        let mut gw = ApprovalGateway::new(3600, true, None);
        let id = gw.open("p1", "prop1", RiskLevel::Low).unwrap();
        assert_eq!(gw.poll(&id).unwrap(), ApprovalDecision::Approved);
    }

    #[test]
    fn pending_for_phase_filters() {
        let mut gw = gateway();
        let a = gw.open("p1", "prop1", RiskLevel::High).unwrap();
        let _b = gw.open("p2", "prop2", RiskLevel::High).unwrap();
        gw.decide(&a, ApprovalDecision::Denied, "op").unwrap();

        assert!(gw.pending_for_phase("p1").is_empty());
        assert_eq!(gw.pending_for_phase("p2").len(), 1);
    }

    #[test]
    fn audit_trail_appends() {
        let dir = tempfile::tempdir().unwrap();
        let audit = dir.path().join("handoff/approvals.jsonl");
        let mut gw = ApprovalGateway::new(3600, false, Some(audit.clone()));
        let id = gw.open("p1", "prop1", RiskLevel::High).unwrap();
        gw.decide(&id, ApprovalDecision::Approved, "operator").unwrap();

        let contents = std::fs::read_to_string(&audit).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("APPROVED"));
        assert!(lines[0].contains("operator"));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let early = poll_backoff(0, 7);
        let late = poll_backoff(20, 7);
        assert!(early < Duration::from_secs(1));
        assert!(late <= Duration::from_secs(38));
        assert!(late >= Duration::from_millis(22_500));
    }
}
