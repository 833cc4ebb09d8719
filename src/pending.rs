use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::{log_info, log_warn};

pub const QUEUE_SCHEMA_VERSION: u32 = 1;

/// Retry backoff base (5 minutes), doubling per attempt, capped at 24h.
const BACKOFF_BASE_MINUTES: i64 = 5;
const BACKOFF_CAP_HOURS: i64 = 24;
/// An item is abandoned after this many attempts or this much queue age,
/// whichever comes first.
pub const MAX_MOVE_ATTEMPTS: u32 = 10;
const MAX_QUEUE_AGE_DAYS: i64 = 30;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MoveAction {
    Move,
    Delete,
}

impl std::fmt::Display for MoveAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MoveAction::Move => write!(f, "move"),
            MoveAction::Delete => write!(f, "delete"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MoveStatus {
    Pending,
    Succeeded,
    Abandoned,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PendingMove {
    /// Content-stable: sha256 of `src|dest|action`. Re-enqueueing the same
    /// operation is a no-op across sessions.
    pub id: String,
    pub src: String,
    pub dest: String,
    pub action: MoveAction,
    pub status: MoveStatus,
    pub reason: String,
    pub attempt_count: u32,
    pub first_enqueued_at: DateTime<Utc>,
    pub next_eligible_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub bytes_estimate: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PendingMoveFile {
    pub schema_version: u32,
    pub queue_id: String,
    #[serde(default)]
    pub items: Vec<PendingMove>,
}

impl Default for PendingMoveFile {
    fn default() -> Self {
        PendingMoveFile {
            schema_version: QUEUE_SCHEMA_VERSION,
            queue_id: "tidy-pending-moves".to_string(),
            items: Vec::new(),
        }
    }
}

pub fn move_id(src: &str, dest: &str, action: MoveAction) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}|{}|{}", src, dest, action).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Backoff schedule: `base * 2^(attempt_count - 1)`, capped at 24 hours.
pub fn backoff_for_attempt(attempt_count: u32) -> Duration {
    let exp = attempt_count.saturating_sub(1).min(12);
    let minutes = BACKOFF_BASE_MINUTES.saturating_mul(1i64 << exp);
    Duration::minutes(minutes).min(Duration::hours(BACKOFF_CAP_HOURS))
}

/// The durable retry queue for filesystem moves that failed with a sharing
/// violation. The JSON file is the single source of truth for retry state;
/// it is never rebuilt from filesystem inspection.
pub struct PendingMovesQueue {
    path: PathBuf,
}

impl PendingMovesQueue {
    pub fn new(path: PathBuf) -> Self {
        PendingMovesQueue { path }
    }

    pub fn load(&self) -> Result<PendingMoveFile, String> {
        if !self.path.exists() {
            return Ok(PendingMoveFile::default());
        }
        let contents = std::fs::read_to_string(&self.path)
            .map_err(|e| format!("Failed to read {}: {}", self.path.display(), e))?;
        let file: PendingMoveFile = serde_json::from_str(&contents)
            .map_err(|e| format!("Corrupt pending moves file {}: {}", self.path.display(), e))?;
        if file.schema_version > QUEUE_SCHEMA_VERSION {
            return Err(format!(
                "Pending moves schema version {} is newer than supported {}",
                file.schema_version, QUEUE_SCHEMA_VERSION
            ));
        }
        Ok(file)
    }

    fn save(&self, file: &PendingMoveFile) -> Result<(), String> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| format!("Queue path {} has no parent", self.path.display()))?;
        std::fs::create_dir_all(dir)
            .map_err(|e| format!("Failed to create {}: {}", dir.display(), e))?;

        let json = serde_json::to_string_pretty(file)
            .map_err(|e| format!("Failed to serialize pending moves: {}", e))?;
        let mut tmp = NamedTempFile::new_in(dir)
            .map_err(|e| format!("Failed to create temp file in {}: {}", dir.display(), e))?;
        tmp.write_all(json.as_bytes())
            .map_err(|e| format!("Failed to write pending moves temp file: {}", e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| format!("Failed to sync pending moves temp file: {}", e))?;
        tmp.persist(&self.path)
            .map_err(|e| format!("Failed to rename into {}: {}", self.path.display(), e))?;
        Ok(())
    }

    /// Acquire the queue's file lock for a read-modify-write cycle.
    fn lock(&self) -> Result<crate::lock::LockGuard, String> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| format!("Queue path {} has no parent", self.path.display()))?;
        crate::lock::try_acquire(dir, "pending-moves")
    }

    /// Enqueue a failed move. The stable id deduplicates: enqueueing the
    /// same `(src, dest, action)` twice leaves one item, refreshing its
    /// `last_error`.
    ///
    /// A fresh item starts at `attempt_count = 1` (the failed original
    /// attempt) and becomes eligible after the first backoff window.
    pub fn enqueue(
        &self,
        src: &str,
        dest: &str,
        action: MoveAction,
        reason: &str,
        error: &str,
        bytes_estimate: u64,
        tags: Vec<String>,
    ) -> Result<String, String> {
        let _guard = self.lock()?;
        let mut file = self.load()?;
        let id = move_id(src, dest, action);
        let now = Utc::now();

        if let Some(existing) = file.items.iter_mut().find(|i| i.id == id) {
            existing.last_error = Some(error.to_string());
            self.save(&file)?;
            return Ok(id);
        }

        file.items.push(PendingMove {
            id: id.clone(),
            src: src.to_string(),
            dest: dest.to_string(),
            action,
            status: MoveStatus::Pending,
            reason: reason.to_string(),
            attempt_count: 1,
            first_enqueued_at: now,
            next_eligible_at: now + backoff_for_attempt(1),
            last_error: Some(error.to_string()),
            bytes_estimate,
            tags,
        });
        self.save(&file)?;
        Ok(id)
    }

    /// Items due for a retry at `now`.
    pub fn load_due(&self, now: DateTime<Utc>) -> Result<Vec<PendingMove>, String> {
        Ok(self
            .load()?
            .items
            .into_iter()
            .filter(|i| i.status == MoveStatus::Pending && i.next_eligible_at <= now)
            .collect())
    }

    /// Record the outcome of one retry. Failure advances the backoff and,
    /// past the attempt or age bound, abandons the item.
    pub fn mark_outcome(
        &self,
        item_id: &str,
        outcome: Result<(), String>,
        now: DateTime<Utc>,
    ) -> Result<MoveStatus, String> {
        let _guard = self.lock()?;
        let mut file = self.load()?;
        let item = file
            .items
            .iter_mut()
            .find(|i| i.id == item_id)
            .ok_or_else(|| format!("Pending move {} not found", item_id))?;

        let status = match outcome {
            Ok(()) => {
                item.status = MoveStatus::Succeeded;
                item.last_error = None;
                MoveStatus::Succeeded
            }
            Err(error) => {
                item.attempt_count += 1;
                item.last_error = Some(error);
                let too_many = item.attempt_count >= MAX_MOVE_ATTEMPTS;
                let too_old = now - item.first_enqueued_at > Duration::days(MAX_QUEUE_AGE_DAYS);
                if too_many || too_old {
                    item.status = MoveStatus::Abandoned;
                    MoveStatus::Abandoned
                } else {
                    item.next_eligible_at = now + backoff_for_attempt(item.attempt_count);
                    MoveStatus::Pending
                }
            }
        };

        self.save(&file)?;
        Ok(status)
    }

    /// Startup drain: attempt every due item once and record outcomes.
    /// Returns `(succeeded, still_pending, abandoned)` counts.
    pub fn drain(&self, now: DateTime<Utc>) -> Result<(u32, u32, u32), String> {
        let due = self.load_due(now)?;
        let mut succeeded = 0u32;
        let mut pending = 0u32;
        let mut abandoned = 0u32;

        for item in due {
            log_info!(
                "[pending-moves] Retrying {} {} (attempt {})",
                item.action,
                item.src,
                item.attempt_count + 1
            );
            let result = perform_move(&item);
            if let Err(e) = &result {
                log_warn!("[pending-moves] {} {} failed: {}", item.action, item.src, e);
            }
            match self.mark_outcome(&item.id, result, now)? {
                MoveStatus::Succeeded => succeeded += 1,
                MoveStatus::Pending => pending += 1,
                MoveStatus::Abandoned => abandoned += 1,
            }
        }

        Ok((succeeded, pending, abandoned))
    }
}

fn perform_move(item: &PendingMove) -> Result<(), String> {
    let src = Path::new(&item.src);
    match item.action {
        MoveAction::Delete => {
            if !src.exists() {
                // Already gone; the goal state holds.
                return Ok(());
            }
            if src.is_dir() {
                std::fs::remove_dir_all(src)
            } else {
                std::fs::remove_file(src)
            }
            .map_err(|e| format!("delete {}: {}", item.src, e))
        }
        MoveAction::Move => {
            if !src.exists() {
                return Ok(());
            }
            let dest = Path::new(&item.dest);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| format!("mkdir {}: {}", parent.display(), e))?;
            }
            std::fs::rename(src, dest).map_err(|e| format!("move {}: {}", item.src, e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(dir: &Path) -> PendingMovesQueue {
        PendingMovesQueue::new(dir.join("tidy_pending_moves.json"))
    }

    #[test]
    fn enqueue_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());

        let a = q
            .enqueue("seed.db", "", MoveAction::Delete, "locked", "EBUSY", 0, vec![])
            .unwrap();
        let b = q
            .enqueue("seed.db", "", MoveAction::Delete, "locked", "EBUSY again", 0, vec![])
            .unwrap();
        assert_eq!(a, b);

        let file = q.load().unwrap();
        assert_eq!(file.items.len(), 1);
        assert_eq!(file.items[0].attempt_count, 1);
        assert_eq!(file.items[0].last_error.as_deref(), Some("EBUSY again"));
    }

    #[test]
    fn fresh_item_eligible_after_first_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());
        q.enqueue("seed.db", "", MoveAction::Delete, "locked", "EBUSY", 0, vec![])
            .unwrap();

        let file = q.load().unwrap();
        let item = &file.items[0];
        let wait = item.next_eligible_at - item.first_enqueued_at;
        assert_eq!(wait, Duration::minutes(5));

        assert!(q.load_due(Utc::now()).unwrap().is_empty());
        assert_eq!(
            q.load_due(Utc::now() + Duration::minutes(6)).unwrap().len(),
            1
        );
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_for_attempt(1), Duration::minutes(5));
        assert_eq!(backoff_for_attempt(2), Duration::minutes(10));
        assert_eq!(backoff_for_attempt(3), Duration::minutes(20));
        assert_eq!(backoff_for_attempt(9), Duration::minutes(1280));
        assert_eq!(backoff_for_attempt(10), Duration::hours(24));
        assert_eq!(backoff_for_attempt(30), Duration::hours(24));
    }

    #[test]
    fn failure_advances_and_eventually_abandons() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());
        let id = q
            .enqueue("seed.db", "", MoveAction::Delete, "locked", "EBUSY", 0, vec![])
            .unwrap();

        let now = Utc::now();
        for attempt in 2..MAX_MOVE_ATTEMPTS {
            let status = q
                .mark_outcome(&id, Err("still locked".to_string()), now)
                .unwrap();
            assert_eq!(status, MoveStatus::Pending, "attempt {}", attempt);
        }
        // Tenth attempt crosses the bound.
        let status = q
            .mark_outcome(&id, Err("still locked".to_string()), now)
            .unwrap();
        assert_eq!(status, MoveStatus::Abandoned);

        let file = q.load().unwrap();
        assert_eq!(file.items[0].status, MoveStatus::Abandoned);
        assert_eq!(file.items[0].attempt_count, MAX_MOVE_ATTEMPTS);
    }

    #[test]
    fn age_bound_abandons_early() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());
        let id = q
            .enqueue("seed.db", "", MoveAction::Delete, "locked", "EBUSY", 0, vec![])
            .unwrap();

        let status = q
            .mark_outcome(
                &id,
                Err("still locked".to_string()),
                Utc::now() + Duration::days(31),
            )
            .unwrap();
        assert_eq!(status, MoveStatus::Abandoned);
    }

    #[test]
    fn drain_retries_due_delete() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());
        let victim = dir.path().join("seed.db");
        std::fs::write(&victim, "data").unwrap();

        q.enqueue(
            victim.to_str().unwrap(),
            "",
            MoveAction::Delete,
            "locked at tidy time",
            "EBUSY",
            4,
            vec!["db".to_string()],
        )
        .unwrap();

        // Not yet due
        let (s, p, a) = q.drain(Utc::now()).unwrap();
        assert_eq!((s, p, a), (0, 0, 0));
        assert!(victim.exists());

        // Due after the backoff window (simulates the post-reboot retry)
        let (s, p, a) = q.drain(Utc::now() + Duration::minutes(6)).unwrap();
        assert_eq!((s, p, a), (1, 0, 0));
        assert!(!victim.exists());

        let file = q.load().unwrap();
        assert_eq!(file.items[0].status, MoveStatus::Succeeded);
    }

    #[test]
    fn schema_version_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());
        q.enqueue("a", "b", MoveAction::Move, "r", "e", 0, vec![])
            .unwrap();
        let file = q.load().unwrap();
        assert_eq!(file.schema_version, QUEUE_SCHEMA_VERSION);
    }
}
