//! Structured event log for processor runs.
//!
//! Writes append-only JSONL to `<state>/events.jsonl` and a small
//! `runner-status.json` snapshot for external tools to poll. Both are
//! best-effort: a failed write is logged and never stops processing.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;

use marshal_core::clock::now_rfc3339;
use marshal_core::{QueueDocument, RequestStatus};

// ── Event types ──

/// A processor event. Serialized as tagged JSON (`"type": "request_merged"`, etc.).
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    ProcessorStart {
        pid: u32,
    },
    ProcessorStop {
        merged: usize,
        failed: usize,
        manual_required: usize,
    },
    RequestStart {
        request_id: String,
        branch: String,
        target: String,
    },
    Precheck {
        request_id: String,
        verdict: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        paths: Vec<String>,
    },
    LockTimeout {
        request_id: String,
        target: String,
    },
    RetryScheduled {
        request_id: String,
        retry_count: u32,
        cause: String,
    },
    RequestMerged {
        request_id: String,
        merge_commit: String,
        retry_count: u32,
        duration_ms: u64,
    },
    RequestFailed {
        request_id: String,
        reason: String,
    },
    ManualRequired {
        request_id: String,
        reason: String,
    },
    Recovered {
        request_id: String,
        outcome: String,
    },
    DeadlockCandidate {
        detail: String,
    },
    IntegrityViolation {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        message: String,
    },
    LockReleased {
        target: String,
    },
}

/// Wrapper that adds sequence number and timestamp to each event.
#[derive(Debug, Serialize)]
pub struct FullEvent {
    pub seq: u64,
    pub ts: String,
    #[serde(flatten)]
    pub event: Event,
}

// ── EventLogger ──

/// Append-only JSONL event writer, shared by all target tasks.
pub struct EventLogger {
    jsonl_path: PathBuf,
    seq: Mutex<u64>,
}

impl EventLogger {
    /// Sequence numbers continue from the last line already in the file.
    pub fn new(jsonl_path: PathBuf) -> Self {
        let next = next_seq(&jsonl_path);
        Self {
            jsonl_path,
            seq: Mutex::new(next),
        }
    }

    /// Record an event. Best-effort.
    pub fn record(&self, event: Event) {
        let mut seq = match self.seq.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        let full = FullEvent {
            seq: *seq,
            ts: now_rfc3339(),
            event,
        };
        *seq += 1;

        match serde_json::to_string(&full) {
            Ok(line) => {
                // Held across the append so concurrent lines never interleave.
                if let Err(e) = marshal_store::append_line(&self.jsonl_path, &line) {
                    tracing::warn!(path = %self.jsonl_path.display(), error = %e, "event log write failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "event serialization failed"),
        }
    }
}

fn next_seq(path: &Path) -> u64 {
    let Ok(content) = std::fs::read_to_string(path) else {
        return 0;
    };
    content
        .lines()
        .rev()
        .filter(|l| !l.trim().is_empty())
        .find_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
        .and_then(|v| v["seq"].as_u64())
        .map_or(0, |seq| seq + 1)
}

// ── RunnerStatus ──

#[derive(Debug, Serialize)]
pub struct InFlight {
    pub target: String,
    pub request_id: String,
}

/// Lightweight status file for external tools to poll.
#[derive(Debug, Serialize)]
pub struct RunnerStatus {
    pub pid: u32,
    pub status: String,
    pub in_flight: Vec<InFlight>,
    pub queued: usize,
    pub merging: usize,
    pub merged: usize,
    pub failed: usize,
    pub manual_required: usize,
    pub updated_at: String,
}

impl RunnerStatus {
    pub fn from_queue(status: &str, doc: &QueueDocument, in_flight: Vec<InFlight>) -> Self {
        let count = |s: RequestStatus| doc.requests.iter().filter(|r| r.status == s).count();
        Self {
            pid: std::process::id(),
            status: status.to_string(),
            in_flight,
            queued: count(RequestStatus::Queued),
            merging: count(RequestStatus::Merging),
            merged: count(RequestStatus::Merged),
            failed: count(RequestStatus::Failed),
            manual_required: count(RequestStatus::ManualRequired),
            updated_at: now_rfc3339(),
        }
    }
}

pub fn write_runner_status(path: &Path, status: &RunnerStatus) {
    if let Ok(data) = serde_json::to_string_pretty(status) {
        if let Err(e) = marshal_store::write_atomic(path, data.as_bytes()) {
            tracing::warn!(path = %path.display(), error = %e, "runner status write failed");
        }
    }
}
