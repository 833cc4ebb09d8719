use std::path::Path;

use similar::TextDiff;

use crate::config::ProtectionPolicy;
use crate::types::{
    DecisionCategory, PatchOp, PatchProposal, PhaseRecord, RiskAssessment, RiskLevel, RiskSignals,
    Ruling,
};

/// Per-file deletion size that raises risk to at least HIGH.
const DELETION_FILE_LIMIT: u64 = 200;
/// Total deletion size across the proposal that raises risk to at least HIGH.
const DELETION_TOTAL_LIMIT: u64 = 1_000;
/// Distinct top-level areas that count as a cross-module change.
const CROSS_MODULE_AREAS: usize = 3;
/// Largest total changed-line count eligible for narrow auto-approval.
const AUTO_APPROVE_MAX_LINES: u64 = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct GovernanceOutcome {
    pub assessment: RiskAssessment,
    pub ruling: Ruling,
}

/// Match a workspace-relative path against a single glob pattern.
/// Invalid patterns never match (they are rejected at config load).
pub fn glob_match(pattern: &str, path: &str) -> bool {
    glob::Pattern::new(pattern)
        .map(|p| p.matches(path))
        .unwrap_or(false)
}

/// Whether `path` lies inside the allowed set. Entries act as directory
/// prefixes (`docs/`), exact files, or globs. New files under an allowed
/// directory are in scope.
pub fn path_in_scope(path: &str, allowed: &[String]) -> bool {
    allowed.iter().any(|entry| {
        if entry.ends_with('/') {
            path.starts_with(entry.as_str())
        } else {
            path == entry
                || path.starts_with(&format!("{}/", entry))
                || glob_match(entry, path)
        }
    })
}

/// Assess a proposal against the phase scope and the protection policy,
/// producing a risk record and a governance ruling.
///
/// Default-deny: anything not clearly inside scope and clearly small stays
/// behind an approval.
pub fn assess(
    proposal: &PatchProposal,
    phase: &PhaseRecord,
    protection: &ProtectionPolicy,
    workspace_root: &Path,
) -> GovernanceOutcome {
    let mut out_of_scope: Vec<String> = Vec::new();
    let mut signals = RiskSignals::default();
    let mut per_file_deletion_breach = false;
    let mut total_changed_lines: u64 = 0;
    let mut never_auto = false;

    for op in &proposal.operations {
        let path = op.path.as_str();

        let protected = protection.is_protected(path)
            || phase
                .scope
                .protected_paths
                .iter()
                .any(|p| glob_match(p, path) || path == p);
        if protected {
            signals.protected_hits += 1;
        }

        if !path_in_scope(path, &phase.scope.allowed_paths) {
            out_of_scope.push(path.to_string());
        }

        if protection.is_never_auto_approve(path) {
            never_auto = true;
        }

        let (added, deleted) = count_changed_lines(op, workspace_root);
        total_changed_lines += added + deleted;
        signals.large_deletion_lines += deleted;
        if deleted > DELETION_FILE_LIMIT {
            per_file_deletion_breach = true;
        }

        if op.op == PatchOp::Delete {
            signals.destructive = true;
        }
    }

    signals.cross_module = proposal.top_level_areas().len() >= CROSS_MODULE_AREAS;

    // Risk: floor by category, then raise per signal.
    let mut risk = if phase.category.is_safety_critical() {
        RiskLevel::High
    } else {
        RiskLevel::Low
    };
    if signals.cross_module {
        risk = risk.max(RiskLevel::Medium);
    }
    if per_file_deletion_breach || signals.large_deletion_lines > DELETION_TOTAL_LIMIT {
        risk = risk.max(RiskLevel::High);
    }
    if signals.protected_hits > 0 {
        risk = RiskLevel::Critical;
    }

    let decision_category = decision_category_for(risk, &signals);

    // Ruling. Scope violations and protected writes have no approval path.
    let ruling = if !out_of_scope.is_empty() {
        Ruling::Reject(format!(
            "paths outside allowed scope: {}",
            out_of_scope.join(", ")
        ))
    } else if signals.protected_hits > 0 {
        Ruling::Reject("writes to protected paths".to_string())
    } else if risk == RiskLevel::Low
        && total_changed_lines <= AUTO_APPROVE_MAX_LINES
        && !signals.destructive
        && !never_auto
    {
        Ruling::AutoApprove
    } else {
        Ruling::RequireApproval
    };

    let requires_approval = !matches!(ruling, Ruling::AutoApprove);

    GovernanceOutcome {
        assessment: RiskAssessment {
            proposal_id: proposal.proposal_id.clone(),
            risk_level: risk,
            decision_category,
            signals,
            requires_approval,
        },
        ruling,
    }
}

/// Conservative mapping from risk to the decision category knob. A
/// protected hit or destructive signal always reads as AMBIGUOUS.
pub fn decision_category_for(risk: RiskLevel, signals: &RiskSignals) -> DecisionCategory {
    if signals.protected_hits > 0 || signals.destructive {
        return DecisionCategory::Ambiguous;
    }
    match risk {
        RiskLevel::Low => DecisionCategory::ClearFix,
        RiskLevel::Medium => DecisionCategory::Threshold,
        RiskLevel::High => DecisionCategory::Risky,
        RiskLevel::Critical => DecisionCategory::Ambiguous,
    }
}

/// Count (added, deleted) lines for one operation against the current
/// workspace contents.
fn count_changed_lines(op: &crate::types::PatchOperation, workspace_root: &Path) -> (u64, u64) {
    let on_disk = std::fs::read_to_string(workspace_root.join(&op.path)).unwrap_or_default();

    match op.op {
        PatchOp::Create => {
            let added = op.content.as_deref().map(count_lines).unwrap_or(0);
            (added, 0)
        }
        PatchOp::Delete => (0, count_lines(&on_disk)),
        PatchOp::Modify => {
            if let Some(new_content) = op.content.as_deref() {
                let diff = TextDiff::from_lines(on_disk.as_str(), new_content);
                let mut added = 0u64;
                let mut deleted = 0u64;
                for change in diff.iter_all_changes() {
                    match change.tag() {
                        similar::ChangeTag::Insert => added += 1,
                        similar::ChangeTag::Delete => deleted += 1,
                        similar::ChangeTag::Equal => {}
                    }
                }
                (added, deleted)
            } else if let Some(hunks) = op.hunks.as_deref() {
                let mut added = 0u64;
                let mut deleted = 0u64;
                for line in hunks.lines() {
                    if line.starts_with("+++") || line.starts_with("---") {
                        continue;
                    }
                    if line.starts_with('+') {
                        added += 1;
                    } else if line.starts_with('-') {
                        deleted += 1;
                    }
                }
                (added, deleted)
            } else {
                (0, 0)
            }
        }
    }
}

fn count_lines(s: &str) -> u64 {
    if s.is_empty() {
        0
    } else {
        s.lines().count() as u64
    }
}
