use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::ProtectionPolicy;
use crate::governance::{glob_match, path_in_scope};
use crate::types::{PatchOp, PatchProposal, PhaseRecord};

/// Typed apply failures. The executor maps these onto attempt outcomes;
/// `IoLocked` additionally enqueues a pending move.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ApplyError {
    #[error("Operation targets protected path {0}")]
    ProtectedPath(String),

    #[error("Operation outside allowed scope: {0}")]
    OutsideScope(String),

    #[error("Declared symbol '{symbol}' no longer resolves in {path}")]
    SymbolLost { path: String, symbol: String },

    #[error("File locked during {action} of {path}: {detail}")]
    IoLocked {
        path: String,
        action: String,
        detail: String,
    },

    #[error("Merge conflict in {path}: {reason}")]
    MergeConflict { path: String, reason: String },

    #[error("I/O failure: {0}")]
    Io(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ApplyResult {
    pub changed_files: BTreeSet<String>,
    pub added_files: BTreeSet<String>,
    pub deleted_files: BTreeSet<String>,
    /// Deletes that hit a sharing violation. Recovered locally: the caller
    /// enqueues each into the pending moves queue; the attempt proceeds.
    pub locked_deletes: Vec<(String, String)>,
    pub bytes_written: u64,
    pub save_point_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct SavePointManifest {
    save_point_id: String,
    entries: Vec<SavePointEntry>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct SavePointEntry {
    path: String,
    /// False when the file did not exist before the apply (rollback deletes it).
    existed: bool,
}

/// Apply a proposal to the workspace under scope and symbol constraints.
///
/// All preconditions are checked before the first byte is written (fail
/// closed). A save point holding pre-images of every targeted file is
/// created first and recorded under `save_point_dir`; any post-apply gate
/// can restore it via [`rollback`]. Symbol preservation is verified after
/// the writes and triggers an automatic rollback on loss.
pub fn apply(
    proposal: &PatchProposal,
    phase: &PhaseRecord,
    protection: &ProtectionPolicy,
    workspace_root: &Path,
    save_point_dir: &Path,
) -> Result<ApplyResult, ApplyError> {
    // --- Preconditions, no mutation yet ---
    for op in &proposal.operations {
        let path = op.path.as_str();

        if protection.is_protected(path)
            || phase
                .scope
                .protected_paths
                .iter()
                .any(|p| glob_match(p, path) || path == p)
        {
            return Err(ApplyError::ProtectedPath(path.to_string()));
        }

        if !path_in_scope(path, &phase.scope.allowed_paths) {
            return Err(ApplyError::OutsideScope(path.to_string()));
        }

        let abs = workspace_root.join(path);
        match op.op {
            PatchOp::Create => {
                if abs.exists() {
                    return Err(ApplyError::MergeConflict {
                        path: path.to_string(),
                        reason: "create target already exists".to_string(),
                    });
                }
                if op.content.is_none() {
                    return Err(ApplyError::MergeConflict {
                        path: path.to_string(),
                        reason: "create without content".to_string(),
                    });
                }
            }
            PatchOp::Modify => {
                if !abs.is_file() {
                    return Err(ApplyError::MergeConflict {
                        path: path.to_string(),
                        reason: "modify target does not exist".to_string(),
                    });
                }
            }
            PatchOp::Delete => {
                if !abs.exists() {
                    return Err(ApplyError::MergeConflict {
                        path: path.to_string(),
                        reason: "delete target does not exist".to_string(),
                    });
                }
            }
        }
    }

    // Dry-run modifies so a conflicting hunk never leaves a half-applied tree.
    let mut staged: Vec<(String, PatchOp, Option<String>)> = Vec::new();
    for op in &proposal.operations {
        match op.op {
            PatchOp::Create => {
                staged.push((op.path.clone(), PatchOp::Create, op.content.clone()));
            }
            PatchOp::Modify => {
                let current = std::fs::read_to_string(workspace_root.join(&op.path))
                    .map_err(|e| ApplyError::Io(format!("read {}: {}", op.path, e)))?;
                let new_content = if let Some(content) = &op.content {
                    content.clone()
                } else if let Some(hunks) = &op.hunks {
                    apply_hunks(&current, hunks).map_err(|reason| ApplyError::MergeConflict {
                        path: op.path.clone(),
                        reason,
                    })?
                } else {
                    return Err(ApplyError::MergeConflict {
                        path: op.path.clone(),
                        reason: "modify without content or hunks".to_string(),
                    });
                };
                staged.push((op.path.clone(), PatchOp::Modify, Some(new_content)));
            }
            PatchOp::Delete => {
                staged.push((op.path.clone(), PatchOp::Delete, None));
            }
        }
    }

    // --- Save point before any mutation ---
    let save_point_id = save_point_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "save-point".to_string());
    create_save_point(workspace_root, save_point_dir, &save_point_id, proposal)
        .map_err(ApplyError::Io)?;

    // --- Mutate ---
    let mut result = ApplyResult {
        save_point_id,
        ..ApplyResult::default()
    };

    for (path, op, content) in staged {
        let abs = workspace_root.join(&path);
        match op {
            PatchOp::Create | PatchOp::Modify => {
                if let Some(parent) = abs.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| ApplyError::Io(format!("mkdir {}: {}", parent.display(), e)))?;
                }
                let content = content.expect("staged create/modify carries content");
                std::fs::write(&abs, &content).map_err(|e| {
                    if is_locked_error(&e) {
                        ApplyError::IoLocked {
                            path: path.clone(),
                            action: "write".to_string(),
                            detail: e.to_string(),
                        }
                    } else {
                        ApplyError::Io(format!("write {}: {}", path, e))
                    }
                })?;
                result.bytes_written += content.len() as u64;
                if op == PatchOp::Create {
                    result.added_files.insert(path);
                } else {
                    result.changed_files.insert(path);
                }
            }
            PatchOp::Delete => {
                let removal = if abs.is_dir() {
                    std::fs::remove_dir_all(&abs)
                } else {
                    std::fs::remove_file(&abs)
                };
                match removal {
                    Ok(()) => {
                        result.deleted_files.insert(path);
                    }
                    Err(e) if is_locked_error(&e) => {
                        result.locked_deletes.push((path, e.to_string()));
                    }
                    Err(e) => return Err(ApplyError::Io(format!("delete {}: {}", path, e))),
                }
            }
        }
    }

    // --- Symbol preservation, after the writes ---
    for requirement in &phase.symbol_manifest {
        let abs = workspace_root.join(&requirement.path);
        let content = std::fs::read_to_string(&abs).unwrap_or_default();
        for symbol in &requirement.symbols {
            if !symbol_present(&content, symbol) {
                rollback(save_point_dir, workspace_root).map_err(ApplyError::Io)?;
                return Err(ApplyError::SymbolLost {
                    path: requirement.path.clone(),
                    symbol: symbol.clone(),
                });
            }
        }
    }

    Ok(result)
}

/// Restore the workspace to the state captured by a save point: pre-images
/// are rewritten, files created by the apply are removed.
pub fn rollback(save_point_dir: &Path, workspace_root: &Path) -> Result<(), String> {
    let manifest_path = save_point_dir.join("manifest.json");
    let manifest: SavePointManifest = serde_json::from_str(
        &std::fs::read_to_string(&manifest_path)
            .map_err(|e| format!("read {}: {}", manifest_path.display(), e))?,
    )
    .map_err(|e| format!("parse {}: {}", manifest_path.display(), e))?;

    for entry in &manifest.entries {
        let target = workspace_root.join(&entry.path);
        if entry.existed {
            let image = save_point_dir.join("files").join(&entry.path);
            let bytes = std::fs::read(&image)
                .map_err(|e| format!("read pre-image {}: {}", image.display(), e))?;
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| format!("mkdir {}: {}", parent.display(), e))?;
            }
            std::fs::write(&target, bytes)
                .map_err(|e| format!("restore {}: {}", entry.path, e))?;
        } else if target.exists() {
            std::fs::remove_file(&target)
                .map_err(|e| format!("remove {}: {}", entry.path, e))?;
        }
    }

    Ok(())
}

fn create_save_point(
    workspace_root: &Path,
    save_point_dir: &Path,
    save_point_id: &str,
    proposal: &PatchProposal,
) -> Result<(), String> {
    let files_dir = save_point_dir.join("files");
    std::fs::create_dir_all(&files_dir)
        .map_err(|e| format!("mkdir {}: {}", files_dir.display(), e))?;

    let mut entries = Vec::new();
    for op in &proposal.operations {
        let abs = workspace_root.join(&op.path);
        let existed = abs.is_file();
        if existed {
            let image = files_dir.join(&op.path);
            if let Some(parent) = image.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| format!("mkdir {}: {}", parent.display(), e))?;
            }
            std::fs::copy(&abs, &image)
                .map_err(|e| format!("snapshot {}: {}", op.path, e))?;
        }
        entries.push(SavePointEntry {
            path: op.path.clone(),
            existed,
        });
    }

    let manifest = SavePointManifest {
        save_point_id: save_point_id.to_string(),
        entries,
    };
    let json = serde_json::to_string_pretty(&manifest)
        .map_err(|e| format!("serialize save point manifest: {}", e))?;
    std::fs::write(save_point_dir.join("manifest.json"), json)
        .map_err(|e| format!("write save point manifest: {}", e))?;
    Ok(())
}

/// Whether a declared symbol still resolves in the file: the name must
/// appear as a whole word. Covers `fn`, `struct`, `class`, `def`, and
/// method declarations without committing to one language's grammar.
pub fn symbol_present(content: &str, symbol: &str) -> bool {
    match regex::Regex::new(&format!(r"\b{}\b", regex::escape(symbol))) {
        Ok(re) => re.is_match(content),
        Err(_) => content.contains(symbol),
    }
}

fn is_locked_error(e: &std::io::Error) -> bool {
    // EBUSY / ETXTBSY on Unix, sharing violations (32/33) on Windows
    matches!(e.raw_os_error(), Some(16) | Some(26) | Some(32) | Some(33))
        || e.kind() == std::io::ErrorKind::WouldBlock
}

// --- Unified diff hunk application ---

/// Apply unified-diff hunk text to `current`, verifying context lines.
/// Returns the new content, or a conflict reason.
pub fn apply_hunks(current: &str, hunks: &str) -> Result<String, String> {
    let old_lines: Vec<&str> = current.lines().collect();
    let mut new_lines: Vec<String> = Vec::new();
    // Next old line (0-based) not yet consumed.
    let mut cursor = 0usize;

    let mut lines = hunks.lines().peekable();
    while let Some(line) = lines.next() {
        if line.starts_with("---") || line.starts_with("+++") {
            continue;
        }
        if !line.starts_with("@@") {
            if line.trim().is_empty() {
                continue;
            }
            return Err(format!("unexpected line outside hunk header: '{}'", line));
        }

        let old_start = parse_hunk_old_start(line)?;
        let hunk_at = old_start.saturating_sub(1);
        if hunk_at < cursor {
            return Err("hunks overlap or are out of order".to_string());
        }
        if hunk_at > old_lines.len() {
            return Err(format!(
                "hunk start {} beyond end of file ({} lines)",
                old_start,
                old_lines.len()
            ));
        }

        // Copy unchanged region before the hunk.
        new_lines.extend(old_lines[cursor..hunk_at].iter().map(|s| s.to_string()));
        cursor = hunk_at;

        while let Some(body) = lines.peek() {
            if body.starts_with("@@") {
                break;
            }
            let body = lines.next().expect("peeked");
            if let Some(ctx) = body.strip_prefix(' ') {
                match old_lines.get(cursor) {
                    Some(actual) if *actual == ctx => {
                        new_lines.push(ctx.to_string());
                        cursor += 1;
                    }
                    Some(actual) => {
                        return Err(format!(
                            "context mismatch at line {}: expected '{}', found '{}'",
                            cursor + 1,
                            ctx,
                            actual
                        ));
                    }
                    None => return Err("context extends past end of file".to_string()),
                }
            } else if let Some(removed) = body.strip_prefix('-') {
                match old_lines.get(cursor) {
                    Some(actual) if *actual == removed => cursor += 1,
                    Some(actual) => {
                        return Err(format!(
                            "deletion mismatch at line {}: expected '{}', found '{}'",
                            cursor + 1,
                            removed,
                            actual
                        ));
                    }
                    None => return Err("deletion extends past end of file".to_string()),
                }
            } else if let Some(added) = body.strip_prefix('+') {
                new_lines.push(added.to_string());
            } else if body.is_empty() {
                // Tolerate blank context lines some generators emit.
                match old_lines.get(cursor) {
                    Some(actual) if actual.is_empty() => {
                        new_lines.push(String::new());
                        cursor += 1;
                    }
                    _ => return Err("blank context mismatch".to_string()),
                }
            } else if body.starts_with('\\') {
                // "\ No newline at end of file"
                continue;
            } else {
                return Err(format!("malformed hunk line: '{}'", body));
            }
        }
    }

    // Copy the remainder.
    new_lines.extend(old_lines[cursor..].iter().map(|s| s.to_string()));

    let mut out = new_lines.join("\n");
    if current.ends_with('\n') || current.is_empty() {
        out.push('\n');
    }
    Ok(out)
}

fn parse_hunk_old_start(header: &str) -> Result<usize, String> {
    // "@@ -a,b +c,d @@"
    let inner = header
        .trim_start_matches('@')
        .trim_end_matches('@')
        .trim();
    let old_part = inner
        .split_whitespace()
        .find(|p| p.starts_with('-'))
        .ok_or_else(|| format!("malformed hunk header: '{}'", header))?;
    let start = old_part
        .trim_start_matches('-')
        .split(',')
        .next()
        .unwrap_or("")
        .parse::<usize>()
        .map_err(|_| format!("malformed hunk header: '{}'", header))?;
    Ok(start)
}
