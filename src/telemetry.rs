use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    TokenUsage,
    PhaseOutcome,
    Approval,
    GovernanceDecision,
    RoutingDecision,
    DrainResult,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TelemetryEvent {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<String>,
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub payload: serde_json::Value,
}

/// Append-only JSONL event store. Rows are never rewritten; consumers are
/// dashboards and the drain controller's yield calculator.
pub struct TelemetrySink {
    path: PathBuf,
}

impl TelemetrySink {
    pub fn new(path: PathBuf) -> Self {
        TelemetrySink { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn record(&self, event: &TelemetryEvent) -> Result<(), String> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| format!("Failed to create {}: {}", dir.display(), e))?;
        }
        let line = serde_json::to_string(event)
            .map_err(|e| format!("Failed to serialize telemetry event: {}", e))?;
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|e| format!("Failed to open {}: {}", self.path.display(), e))?;
        writeln!(file, "{}", line).map_err(|e| format!("Failed to append telemetry: {}", e))
    }

    /// Convenience constructor-and-append.
    pub fn emit(
        &self,
        run_id: &str,
        phase_id: Option<&str>,
        attempt_id: Option<&str>,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Result<(), String> {
        self.record(&TelemetryEvent {
            run_id: run_id.to_string(),
            phase_id: phase_id.map(str::to_string),
            attempt_id: attempt_id.map(str::to_string),
            ts: Utc::now(),
            kind,
            payload,
        })
    }

    /// Read back all events. Lines that fail to parse are skipped; the log
    /// may be mid-append from another process.
    pub fn read_all(&self) -> Result<Vec<TelemetryEvent>, String> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(format!("Failed to read {}: {}", self.path.display(), e)),
        };
        Ok(contents
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    pub fn count_for_run(&self, run_id: &str) -> Result<usize, String> {
        Ok(self
            .read_all()?
            .iter()
            .filter(|e| e.run_id == run_id)
            .count())
    }
}

/// Telemetry yield: events collected per minute of wall-clock time.
pub fn yield_per_minute(events_collected: u64, duration_s: f64) -> f64 {
    if duration_s <= 0.0 {
        return 0.0;
    }
    events_collected as f64 / (duration_s / 60.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sink = TelemetrySink::new(dir.path().join("telemetry.jsonl"));

        sink.emit(
            "r1",
            Some("p1"),
            None,
            EventKind::PhaseOutcome,
            serde_json::json!({"outcome": "COMPLETE"}),
        )
        .unwrap();
        sink.emit("r1", None, None, EventKind::TokenUsage, serde_json::json!({"t": 10}))
            .unwrap();
        sink.emit("r2", None, None, EventKind::DrainResult, serde_json::json!({}))
            .unwrap();

        let events = sink.read_all().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, EventKind::PhaseOutcome);
        assert_eq!(sink.count_for_run("r1").unwrap(), 2);
    }

    #[test]
    fn unparseable_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry.jsonl");
        std::fs::write(&path, "not json\n").unwrap();
        let sink = TelemetrySink::new(path);
        sink.emit("r1", None, None, EventKind::Approval, serde_json::json!({}))
            .unwrap();
        assert_eq!(sink.read_all().unwrap().len(), 1);
    }

    #[test]
    fn yield_math() {
        assert_eq!(yield_per_minute(30, 60.0), 30.0);
        assert_eq!(yield_per_minute(0, 60.0), 0.0);
        assert_eq!(yield_per_minute(10, 0.0), 0.0);
        assert!((yield_per_minute(10, 120.0) - 5.0).abs() < f64::EPSILON);
    }
}
