use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::ProtectionPolicy;
use crate::pending::{MoveAction, PendingMovesQueue};
use crate::{log_debug, log_info, log_warn};

/// The one database file allowed to live at the workspace root.
pub const ACTIVE_DB_NAME: &str = "autopack.db";

/// Where consolidation entries append. Append-only: entries are never
/// rewritten, and the content hash + source path make re-runs idempotent.
pub const CONSOLIDATION_LEDGER: &str = "sot/CONSOLIDATION_LEDGER.jsonl";

/// Routing classifier for loose files at the workspace root.
/// First match wins; files matching nothing go to `archive/misc/`.
const FILE_ROUTES: &[(&str, &str)] = &[
    ("*.log", "archive/logs"),
    ("*.jsonl", "archive/telemetry"),
    ("*_REPORT.md", "archive/reports"),
    ("*_SUMMARY.md", "archive/reports"),
    ("*.bak", "archive/backups"),
    ("*.tmp", "archive/tmp"),
];

/// Declarative routing for root directory names.
const DIR_ROUTES: &[(&str, &str)] = &[
    ("diagnostics", "archive/diagnostics"),
    ("tmp", "archive/tmp"),
    ("old_runs", "archive/runs"),
    ("scratch", "archive/scratch"),
];

/// Database file classification buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbClass {
    Active,
    TelemetrySeed,
    Legacy,
    Backup,
    DebugSnapshot,
    TestArtifact,
    Misc,
}

impl DbClass {
    pub fn archive_bucket(&self) -> &'static str {
        match self {
            DbClass::Active => "",
            DbClass::TelemetrySeed => "archive/databases/telemetry_seed",
            DbClass::Legacy => "archive/databases/legacy",
            DbClass::Backup => "archive/databases/backup",
            DbClass::DebugSnapshot => "archive/databases/debug_snapshots",
            DbClass::TestArtifact => "archive/databases/test_artifacts",
            DbClass::Misc => "archive/databases/misc",
        }
    }
}

/// Classify a database file by name. Exactly one active file may live at
/// the root; everything else is archived by bucket.
pub fn classify_db(file_name: &str) -> DbClass {
    let lower = file_name.to_lowercase();
    if lower == ACTIVE_DB_NAME {
        DbClass::Active
    } else if lower.starts_with("seed") || lower.contains("telemetry_seed") {
        DbClass::TelemetrySeed
    } else if lower.contains("legacy") || lower.contains("_old") {
        DbClass::Legacy
    } else if lower.contains("backup") || lower.contains(".bak") {
        DbClass::Backup
    } else if lower.starts_with("debug") || lower.contains("snapshot") {
        DbClass::DebugSnapshot
    } else if lower.starts_with("test") || lower.contains("_test") {
        DbClass::TestArtifact
    } else {
        DbClass::Misc
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub source_path: String,
    pub content_hash: String,
    pub dest: String,
    pub ts: chrono::DateTime<Utc>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct TidyReport {
    pub moved: Vec<(String, String)>,
    pub skipped_protected: u32,
    pub skipped_duplicate: u32,
    pub queued_locked: u32,
    pub routed_to_misc: u32,
    /// Planned-only in dry-run mode.
    pub dry_run: bool,
}

/// Route loose workspace-root artifacts into archive buckets and record
/// each move in the consolidation ledger.
///
/// Guarantees:
/// - protected paths are never touched (policy override is absolute)
/// - moves are paired with a content hash; a (source, hash) pair already in
///   the ledger is skipped, so repeated runs add nothing
/// - locked files go to the pending moves queue instead of failing the run
/// - unknown files are archived, never deleted
pub fn tidy(
    workspace_root: &Path,
    protection: &ProtectionPolicy,
    queue: &PendingMovesQueue,
    execute: bool,
) -> Result<TidyReport, String> {
    let mut report = TidyReport {
        dry_run: !execute,
        ..TidyReport::default()
    };
    let ledger = load_ledger(workspace_root)?;

    let entries = std::fs::read_dir(workspace_root)
        .map_err(|e| format!("Failed to read {}: {}", workspace_root.display(), e))?;

    for entry in entries {
        let entry = entry.map_err(|e| format!("Failed to read directory entry: {}", e))?;
        let name = entry.file_name().to_string_lossy().to_string();

        // Engine-owned locations, dotfiles, and project manifests are out
        // of tidy's jurisdiction.
        if name.starts_with('.')
            || matches!(
                name.as_str(),
                "runs"
                    | "archive"
                    | "sot"
                    | "src"
                    | "tests"
                    | "docs"
                    | "Cargo.toml"
                    | "Cargo.lock"
                    | "README.md"
                    | "LICENSE"
            )
        {
            continue;
        }
        if protection.is_protected(&name) {
            log_debug!("[tidy] {} is protected; skipping", name);
            report.skipped_protected += 1;
            continue;
        }

        let is_dir = entry
            .file_type()
            .map(|t| t.is_dir())
            .unwrap_or(false);

        let dest_dir = if is_dir {
            match DIR_ROUTES.iter().find(|(n, _)| *n == name) {
                Some((_, dest)) => dest.to_string(),
                // Unlisted directories stay in place; only conflicting
                // names from the routing table get the misc treatment.
                None => continue,
            }
        } else if name.ends_with(".db") {
            match classify_db(&name) {
                DbClass::Active => continue,
                class => class.archive_bucket().to_string(),
            }
        } else {
            match route_file(&name) {
                Some(dest) => dest.to_string(),
                None => {
                    report.routed_to_misc += 1;
                    "archive/misc".to_string()
                }
            }
        };

        let src = entry.path();
        let dest = workspace_root.join(&dest_dir).join(&name);

        let hash = if is_dir {
            // Directories are identified by name; content hashing applies
            // to files only.
            String::new()
        } else {
            hash_file(&src)?
        };

        let source_rel = name.clone();
        if !hash.is_empty() && ledger_contains(&ledger, &source_rel, &hash) {
            log_debug!("[tidy] {} already consolidated; skipping", name);
            report.skipped_duplicate += 1;
            continue;
        }

        if !execute {
            report
                .moved
                .push((source_rel, dest.to_string_lossy().to_string()));
            continue;
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("mkdir {}: {}", parent.display(), e))?;
        }

        match std::fs::rename(&src, &dest) {
            Ok(()) => {
                append_ledger(
                    workspace_root,
                    &LedgerEntry {
                        source_path: source_rel.clone(),
                        content_hash: hash,
                        dest: dest.to_string_lossy().to_string(),
                        ts: Utc::now(),
                    },
                )?;
                log_info!("[tidy] {} -> {}", source_rel, dest.display());
                report
                    .moved
                    .push((source_rel, dest.to_string_lossy().to_string()));
            }
            Err(e) if is_locked(&e) => {
                log_warn!("[tidy] {} is locked; queueing retry", name);
                queue.enqueue(
                    &src.to_string_lossy(),
                    &dest.to_string_lossy(),
                    MoveAction::Move,
                    "tidy consolidation move hit a sharing violation",
                    &e.to_string(),
                    std::fs::metadata(&src).map(|m| m.len()).unwrap_or(0),
                    vec!["tidy".to_string()],
                )?;
                report.queued_locked += 1;
            }
            Err(e) => {
                return Err(format!(
                    "Failed to move {} to {}: {}",
                    src.display(),
                    dest.display(),
                    e
                ));
            }
        }
    }

    Ok(report)
}

fn route_file(name: &str) -> Option<&'static str> {
    FILE_ROUTES
        .iter()
        .find(|(pattern, _)| crate::governance::glob_match(pattern, name))
        .map(|(_, dest)| *dest)
}

fn is_locked(e: &std::io::Error) -> bool {
    matches!(e.raw_os_error(), Some(16) | Some(26) | Some(32) | Some(33))
        || e.kind() == std::io::ErrorKind::WouldBlock
}

pub fn hash_file(path: &Path) -> Result<String, String> {
    let bytes =
        std::fs::read(path).map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

fn ledger_path(workspace_root: &Path) -> PathBuf {
    workspace_root.join(CONSOLIDATION_LEDGER)
}

pub fn load_ledger(workspace_root: &Path) -> Result<Vec<LedgerEntry>, String> {
    let path = ledger_path(workspace_root);
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(format!("Failed to read {}: {}", path.display(), e)),
    };
    Ok(contents
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

fn ledger_contains(ledger: &[LedgerEntry], source_path: &str, hash: &str) -> bool {
    ledger
        .iter()
        .any(|e| e.source_path == source_path && e.content_hash == hash)
}

fn append_ledger(workspace_root: &Path, entry: &LedgerEntry) -> Result<(), String> {
    use std::io::Write;

    let path = ledger_path(workspace_root);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .map_err(|e| format!("Failed to create {}: {}", dir.display(), e))?;
    }
    let line = serde_json::to_string(entry)
        .map_err(|e| format!("Failed to serialize ledger entry: {}", e))?;
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(&path)
        .map_err(|e| format!("Failed to open {}: {}", path.display(), e))?;
    writeln!(file, "{}", line).map_err(|e| format!("Failed to append ledger entry: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_classification_buckets() {
        assert_eq!(classify_db("autopack.db"), DbClass::Active);
        assert_eq!(classify_db("seed_data.db"), DbClass::TelemetrySeed);
        assert_eq!(classify_db("autopack_old.db"), DbClass::Legacy);
        assert_eq!(classify_db("backup_2026.db"), DbClass::Backup);
        assert_eq!(classify_db("debug_capture.db"), DbClass::DebugSnapshot);
        assert_eq!(classify_db("test_fixture.db"), DbClass::TestArtifact);
        assert_eq!(classify_db("whatever.db"), DbClass::Misc);
    }

    #[test]
    fn file_routing_by_pattern() {
        assert_eq!(route_file("session.log"), Some("archive/logs"));
        assert_eq!(route_file("events.jsonl"), Some("archive/telemetry"));
        assert_eq!(route_file("PHASE_REPORT.md"), Some("archive/reports"));
        assert_eq!(route_file("random.bin"), None);
    }
}
