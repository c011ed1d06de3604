//! CR-015: Append-only JSONL pipeline event log, one file per stack.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Pipeline event for the JSONL event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    DeployStarted {
        stack: String,
        run_id: String,
        instances: u32,
    },
    StageCompleted {
        stack: String,
        run_id: String,
        stage: String,
        instance: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hash: Option<String>,
    },
    StageFailed {
        stack: String,
        run_id: String,
        stage: String,
        instance: String,
        error: String,
    },
    DeployCompleted {
        stack: String,
        run_id: String,
        failed: u32,
        total_seconds: f64,
    },
    DestroyStarted {
        stack: String,
        run_id: String,
        instances: u32,
    },
    DestroyCompleted {
        stack: String,
        run_id: String,
        removed: u32,
        failed: u32,
        total_seconds: f64,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: PipelineEvent,
}

/// Generate an ISO 8601 timestamp.
pub fn now_iso8601() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let dur = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format_iso8601(dur.as_secs())
}

/// Format seconds since the epoch as `YYYY-MM-DDTHH:MM:SSZ`.
fn format_iso8601(secs: u64) -> String {
    let days = secs / 86400;
    let time_secs = secs % 86400;
    let hours = time_secs / 3600;
    let minutes = (time_secs % 3600) / 60;
    let seconds = time_secs % 60;

    let mut y = 1970i64;
    let mut remaining = days as i64;
    loop {
        let year_days = if is_leap(y) { 366 } else { 365 };
        if remaining < year_days {
            break;
        }
        remaining -= year_days;
        y += 1;
    }
    let leap = is_leap(y);
    let month_days = [
        31,
        if leap { 29 } else { 28 },
        31,
        30,
        31,
        30,
        31,
        31,
        30,
        31,
        30,
        31,
    ];
    let mut m = 0;
    for (i, &md) in month_days.iter().enumerate() {
        if remaining < md as i64 {
            m = i + 1;
            break;
        }
        remaining -= md as i64;
    }
    let d = remaining + 1;

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        y, m, d, hours, minutes, seconds
    )
}

fn is_leap(y: i64) -> bool {
    (y % 4 == 0 && y % 100 != 0) || y % 400 == 0
}

/// Generate a run ID.
pub fn generate_run_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("r-{:012x}", nanos & 0xFFFF_FFFF_FFFF)
}

/// Event log path for a stack.
pub fn event_log_path(directory: &Path, stack: &str) -> PathBuf {
    directory.join("events").join(format!("{}.jsonl", stack))
}

/// Append an event to the stack's event log.
pub fn append_event(directory: &Path, stack: &str, event: PipelineEvent) -> Result<(), String> {
    let path = event_log_path(directory, stack);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| format!("cannot create event dir: {}", e))?;
    }

    let te = TimestampedEvent {
        ts: now_iso8601(),
        event,
    };
    let json = serde_json::to_string(&te).map_err(|e| format!("JSON serialize error: {}", e))?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| format!("cannot open event log {}: {}", path.display(), e))?;

    writeln!(file, "{}", json).map_err(|e| format!("write error: {}", e))?;

    Ok(())
}

/// Read back every event of a stack, oldest first. Malformed lines are skipped.
pub fn read_events(directory: &Path, stack: &str) -> Vec<TimestampedEvent> {
    let Ok(content) = std::fs::read_to_string(event_log_path(directory, stack)) else {
        return Vec::new();
    };
    content
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

/// Append, logging instead of failing; the journal never fails a pipeline.
pub(crate) fn record(directory: &Path, stack: &str, event: PipelineEvent) {
    if let Err(e) = append_event(directory, stack, event) {
        tracing::warn!(stack, error = %e, "cannot append pipeline event");
    }
}
