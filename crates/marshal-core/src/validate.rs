//! Integrity checks over a queue document.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::clock;
use crate::queue::QueueDocument;
use crate::request::{MergeRequest, RequestStatus};

/// One problem found in the queue. `request_id` is `None` for
/// queue-level problems.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IntegrityIssue {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub message: String,
}

impl IntegrityIssue {
    fn request(r: &MergeRequest, message: impl Into<String>) -> Self {
        Self {
            request_id: Some(r.id.clone()),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for IntegrityIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.request_id {
            Some(id) => write!(f, "{id}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Check every request invariant. An empty result means the document is
/// consistent.
pub fn validate(doc: &QueueDocument, max_retries: u32) -> Vec<IntegrityIssue> {
    let mut issues = Vec::new();

    let mut seen = HashSet::new();
    for r in &doc.requests {
        if !seen.insert(r.id.as_str()) {
            issues.push(IntegrityIssue::request(r, "duplicate request id"));
        }
    }

    let mut merging: HashMap<&str, Vec<&str>> = HashMap::new();
    for r in doc.merging() {
        merging.entry(r.target.as_str()).or_default().push(r.id.as_str());
    }
    let mut targets: Vec<_> = merging.into_iter().filter(|(_, ids)| ids.len() > 1).collect();
    targets.sort();
    for (target, ids) in targets {
        issues.push(IntegrityIssue {
            request_id: None,
            message: format!(
                "{} requests MERGING on target {target}: {}",
                ids.len(),
                ids.join(", ")
            ),
        });
    }

    for r in &doc.requests {
        check_request(r, max_retries, &mut issues);
    }
    issues
}

fn check_request(r: &MergeRequest, max_retries: u32, issues: &mut Vec<IntegrityIssue>) {
    let submitted = clock::parse_rfc3339(&r.submitted_at);
    if submitted.is_none() {
        issues.push(IntegrityIssue::request(
            r,
            format!("unparseable submitted_at {:?}", r.submitted_at),
        ));
    }
    let started = parse_opt(r, "started_at", r.started_at.as_deref(), issues);
    let completed = parse_opt(r, "completed_at", r.completed_at.as_deref(), issues);

    if let (Some(s), Some(t)) = (submitted, started) {
        if t < s {
            issues.push(IntegrityIssue::request(r, "started_at is before submitted_at"));
        }
    }
    if let (Some(s), Some(c)) = (started, completed) {
        if c < s {
            issues.push(IntegrityIssue::request(r, "completed_at is before started_at"));
        }
    }
    if let (Some(s), Some(c)) = (submitted, completed) {
        if c < s {
            issues.push(IntegrityIssue::request(r, "completed_at is before submitted_at"));
        }
    }

    match r.status {
        RequestStatus::Queued => {
            if r.started_at.is_some() || r.completed_at.is_some() {
                issues.push(IntegrityIssue::request(r, "QUEUED request has started_at or completed_at"));
            }
        }
        RequestStatus::Merging => {
            if r.started_at.is_none() {
                issues.push(IntegrityIssue::request(r, "MERGING request has no started_at"));
            }
            if r.completed_at.is_some() {
                issues.push(IntegrityIssue::request(r, "MERGING request has completed_at"));
            }
        }
        status => {
            if r.completed_at.is_none() {
                issues.push(IntegrityIssue::request(r, format!("{status} request has no completed_at")));
            }
            // A queued request can be cancelled without ever starting.
            if status != RequestStatus::Failed && r.started_at.is_none() {
                issues.push(IntegrityIssue::request(r, format!("{status} request has no started_at")));
            }
            if status != RequestStatus::Merged
                && r.reason.as_deref().map_or(true, |s| s.trim().is_empty())
            {
                issues.push(IntegrityIssue::request(r, format!("{status} request has no reason")));
            }
        }
    }

    if r.retry_count > max_retries {
        issues.push(IntegrityIssue::request(
            r,
            format!("retry_count {} exceeds max_retries {max_retries}", r.retry_count),
        ));
    }
}

fn parse_opt(
    r: &MergeRequest,
    field: &str,
    value: Option<&str>,
    issues: &mut Vec<IntegrityIssue>,
) -> Option<time::OffsetDateTime> {
    let value = value?;
    let parsed = clock::parse_rfc3339(value);
    if parsed.is_none() {
        issues.push(IntegrityIssue::request(r, format!("unparseable {field} {value:?}")));
    }
    parsed
}
