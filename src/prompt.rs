use std::path::Path;

use crate::memory::Snippet;
use crate::types::{HintKind, LearningHint, PatchFormat, PhaseRecord};

/// Parameters for building a Builder prompt.
pub struct BuilderPromptParams<'a> {
    pub phase: &'a PhaseRecord,
    pub attempt_index: u32,
    pub token_budget: u64,
    pub reply_path: &'a Path,
    pub hints: &'a [LearningHint],
    pub retrieval: &'a [Snippet],
    /// Forced output format (structured edits for very wide scopes).
    pub format: PatchFormat,
    /// Continuation recovery: restrict the call to these unfinished
    /// deliverables. Empty on a normal attempt.
    pub unfinished_deliverables: &'a [String],
}

/// Build the full Builder prompt.
///
/// Structure: [Preamble] + [Scope] + [Deliverables] + [Corrections] +
/// [Context] + [Output Contract]. Sections with nothing to say are omitted.
pub fn build_builder_prompt(params: &BuilderPromptParams) -> String {
    let mut sections = vec![build_preamble(params.phase, params.attempt_index)];

    sections.push(build_scope_section(params.phase));
    sections.push(build_deliverables_section(params));

    if !params.hints.is_empty() {
        sections.push(build_hints_section(params.hints));
    }

    if !params.retrieval.is_empty() {
        sections.push(build_retrieval_section(params.retrieval));
    }

    sections.push(build_output_suffix(params));

    sections.join("\n\n")
}

fn build_preamble(phase: &PhaseRecord, attempt_index: u32) -> String {
    format!(
        "# Autonomous Builder\n\n\
        You are running autonomously inside a governed build pipeline. \
        No human is available for questions; use your judgment.\n\n\
        ## Phase\n\n\
        - **ID:** {}\n\
        - **Goal:** {}\n\
        - **Category:** {}\n\
        - **Complexity:** {}\n\
        - **Attempt:** {} of {}",
        phase.phase_id,
        phase.goal,
        phase.category,
        phase.complexity,
        attempt_index,
        phase.max_attempts
    )
}

fn build_scope_section(phase: &PhaseRecord) -> String {
    let list = |paths: &[String]| {
        if paths.is_empty() {
            "- (none)".to_string()
        } else {
            paths
                .iter()
                .map(|p| format!("- `{}`", p))
                .collect::<Vec<_>>()
                .join("\n")
        }
    };

    format!(
        "## Scope\n\n\
        You may only create, modify, or delete files under the allowed paths. \
        Proposals touching anything else are rejected without appeal.\n\n\
        **Allowed:**\n{}\n\n\
        **Read-only context:**\n{}\n\n\
        **Protected (never touch):**\n{}",
        list(&phase.scope.allowed_paths),
        list(&phase.scope.readonly_context),
        list(&phase.scope.protected_paths),
    )
}

fn build_deliverables_section(params: &BuilderPromptParams) -> String {
    let targets = if params.unfinished_deliverables.is_empty() {
        &params.phase.deliverables
    } else {
        // Continuation recovery after truncation
        params.unfinished_deliverables
    };

    let heading = if params.unfinished_deliverables.is_empty() {
        "## Deliverables"
    } else {
        "## Remaining Deliverables (continuation)"
    };

    let list = targets
        .iter()
        .map(|d| format!("- `{}`", d))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "{}\n\nEvery listed file must exist and be non-empty when you are done:\n{}",
        heading, list
    )
}

fn build_hints_section(hints: &[LearningHint]) -> String {
    let lines: Vec<String> = hints
        .iter()
        .map(|h| {
            let kind = match h.kind {
                HintKind::PathFix => "PATH_FIX",
                HintKind::DeliverableMissing => "DELIVERABLE_MISSING",
                HintKind::Truncation => "TRUNCATION",
                HintKind::SymbolLost => "SYMBOL_LOST",
                HintKind::TestRegression => "TEST_REGRESSION",
                HintKind::ApprovalDenied => "APPROVAL_DENIED",
            };
            let mut parts = vec![format!("- [{}]", kind)];
            if let Some(from) = &h.from {
                parts.push(format!("from `{}`", from));
            }
            if let Some(to) = &h.to {
                parts.push(format!("to `{}`", to));
            }
            if let Some(detail) = &h.detail {
                parts.push(detail.clone());
            }
            parts.join(" ")
        })
        .collect();

    format!(
        "## Corrections From Prior Attempts\n\n\
        Newest first. Do not repeat these mistakes:\n{}",
        lines.join("\n")
    )
}

fn build_retrieval_section(snippets: &[Snippet]) -> String {
    let blocks: Vec<String> = snippets
        .iter()
        .map(|s| format!("### {}\n\n{}", s.source, s.content))
        .collect();
    format!(
        "## Retrieved Context\n\n\
        Advisory material from project memory; verify before relying on it.\n\n{}",
        blocks.join("\n\n")
    )
}

fn build_output_suffix(params: &BuilderPromptParams) -> String {
    let format_name = match params.format {
        PatchFormat::UnifiedDiff => "unified_diff",
        PatchFormat::StructuredEdits => "structured_edits",
    };
    format!(
        "## Output Contract\n\n\
        Stay within a budget of {} output tokens. When finished, write a \
        single JSON object to `{}` with this shape:\n\n\
        ```json\n\
        {{\n\
          \"stop_reason\": \"end_turn\",\n\
          \"tokens_in\": 0,\n\
          \"tokens_out\": 0,\n\
          \"proposal\": {{\n\
            \"proposal_id\": \"<unique>\",\n\
            \"attempt_id\": \"<echo the attempt id>\",\n\
            \"format\": \"{}\",\n\
            \"operations\": [\n\
              {{\"op\": \"create|modify|delete\", \"path\": \"<workspace-relative>\", \"content\": \"...\"}}\n\
            ],\n\
            \"declared_deliverables\": [\"<paths you completed>\"]\n\
          }}\n\
        }}\n\
        ```\n\n\
        Report `stop_reason: \"max_tokens\"` if you could not finish within budget.",
        params.token_budget,
        params.reply_path.display(),
        format_name
    )
}

/// Build the Auditor prompt over a post-apply change set.
pub fn build_auditor_prompt(
    phase: &PhaseRecord,
    changed_files: &[String],
    reply_path: &Path,
) -> String {
    let list = changed_files
        .iter()
        .map(|p| format!("- `{}`", p))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "# Autonomous Auditor\n\n\
        You are validating a change produced by another agent. Be adversarial: \
        look for correctness bugs, security regressions, and scope creep.\n\n\
        ## Phase\n\n\
        - **Goal:** {}\n\
        - **Category:** {}\n\n\
        ## Changed Files\n\n{}\n\n\
        ## Output Contract\n\n\
        Write a single JSON object to `{}`:\n\n\
        ```json\n\
        {{\n\
          \"stop_reason\": \"end_turn\",\n\
          \"audit\": {{\"verdict\": \"approve|block\", \"findings\": [\"...\"]}}\n\
        }}\n\
        ```\n\n\
        Use `block` only for findings severe enough to reject the change.",
        phase.goal, phase.category, list, reply_path.display()
    )
}
