//! Merge request model.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::clock;

// ── Status ──

/// Lifecycle of a merge request. Forward-only; see [`crate::machine`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Queued,
    Merging,
    Merged,
    Failed,
    /// Retry budget exhausted. Expected outcome, needs a human.
    ManualRequired,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 5] = [
        RequestStatus::Queued,
        RequestStatus::Merging,
        RequestStatus::Merged,
        RequestStatus::Failed,
        RequestStatus::ManualRequired,
    ];

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Merged | RequestStatus::Failed | RequestStatus::ManualRequired
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Queued => "QUEUED",
            RequestStatus::Merging => "MERGING",
            RequestStatus::Merged => "MERGED",
            RequestStatus::Failed => "FAILED",
            RequestStatus::ManualRequired => "MANUAL_REQUIRED",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().to_ascii_uppercase().replace('-', "_");
        RequestStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == norm)
            .ok_or_else(|| {
                format!(
                    "unknown status \"{s}\" (expected one of: queued, merging, merged, failed, manual_required)"
                )
            })
    }
}

// ── Conflict check ──

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictVerdict {
    Clean,
    Conflict,
    #[default]
    Unknown,
}

/// Last prechecker classification for a request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ConflictCheck {
    pub verdict: ConflictVerdict,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_tip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<String>,
}

impl ConflictCheck {
    pub fn clean(target_tip: impl Into<String>) -> Self {
        Self {
            verdict: ConflictVerdict::Clean,
            target_tip: Some(target_tip.into()),
            checked_at: Some(clock::now_rfc3339()),
            ..Default::default()
        }
    }

    pub fn conflict(target_tip: impl Into<String>, paths: Vec<String>) -> Self {
        Self {
            verdict: ConflictVerdict::Conflict,
            paths,
            target_tip: Some(target_tip.into()),
            checked_at: Some(clock::now_rfc3339()),
            detail: None,
        }
    }

    pub fn unknown(detail: impl Into<String>) -> Self {
        Self {
            verdict: ConflictVerdict::Unknown,
            detail: Some(detail.into()),
            checked_at: Some(clock::now_rfc3339()),
            ..Default::default()
        }
    }
}

// ── Metrics ──

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RequestMetrics {
    /// `started_at − submitted_at`, fixed once the request starts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_time_sec: Option<u64>,
    /// `completed_at − started_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_duration_sec: Option<u64>,
}

// ── Request ──

/// One unit of queued work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergeRequest {
    pub id: String,
    pub branch: String,
    pub target: String,
    pub submitter: String,
    pub status: RequestStatus,
    pub submitted_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub conflict_check: ConflictCheck,
    /// Why the request ended FAILED or MANUAL_REQUIRED.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_commit: Option<String>,
    #[serde(default)]
    pub metrics: RequestMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requeued_from: Option<String>,
    /// Times startup reconciliation returned this request to the queue.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub recoveries: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// Generate a request id: `mr_<ulid>` (millisecond timestamp + random).
pub fn new_request_id() -> String {
    format!("mr_{}", ulid::Ulid::new().to_string().to_lowercase())
}

impl MergeRequest {
    pub fn new(branch: &str, target: &str, submitter: &str) -> Self {
        Self {
            id: new_request_id(),
            branch: branch.to_string(),
            target: target.to_string(),
            submitter: submitter.to_string(),
            status: RequestStatus::Queued,
            submitted_at: clock::now_rfc3339(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            conflict_check: ConflictCheck::default(),
            reason: None,
            source_sha: None,
            merge_commit: None,
            metrics: RequestMetrics::default(),
            requeued_from: None,
            recoveries: 0,
        }
    }

    /// Seconds spent waiting: fixed once started, otherwise still growing.
    pub fn wait_time_sec(&self) -> u64 {
        if let Some(w) = self.metrics.wait_time_sec {
            return w;
        }
        match &self.started_at {
            Some(started) => clock::seconds_between(&self.submitted_at, started),
            None => clock::seconds_since(&self.submitted_at),
        }
        .unwrap_or(0)
    }

    /// Seconds since the request entered MERGING, if it is MERGING.
    pub fn merging_for_sec(&self) -> Option<u64> {
        if self.status != RequestStatus::Merging {
            return None;
        }
        self.started_at.as_deref().and_then(clock::seconds_since)
    }
}

/// Reject ref names git would refuse or that could be parsed as options.
pub fn check_ref_name(kind: &str, name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err(format!("{kind} name is empty"));
    }
    if name.starts_with('-') {
        return Err(format!("{kind} name \"{name}\" starts with '-'"));
    }
    if name.contains("..")
        || name.ends_with('/')
        || name.ends_with(".lock")
        || name.starts_with('/')
        || name.contains("@{")
    {
        return Err(format!("{kind} name \"{name}\" is not a valid git ref name"));
    }
    if name
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || "~^:?*[\\".contains(c))
    {
        return Err(format!("{kind} name \"{name}\" contains forbidden characters"));
    }
    Ok(())
}
