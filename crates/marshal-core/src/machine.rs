use crate::clock;
use crate::error::QueueError;
use crate::request::{ConflictCheck, MergeRequest, RequestMetrics, RequestStatus};

// ── Valid transitions ──

const VALID_TRANSITIONS: &[(RequestStatus, &[RequestStatus])] = &[
    (
        RequestStatus::Queued,
        &[RequestStatus::Merging, RequestStatus::Failed], // failed: cancel / missing branch
    ),
    (
        RequestStatus::Merging,
        &[
            RequestStatus::Merged,
            RequestStatus::Failed,
            RequestStatus::ManualRequired,
        ],
    ),
    // Merged, Failed and ManualRequired are terminal
];

pub fn is_valid_transition(from: RequestStatus, to: RequestStatus) -> bool {
    VALID_TRANSITIONS
        .iter()
        .any(|(f, targets)| *f == from && targets.contains(&to))
}

// ── Side effects ──

/// Optional field updates applied together with a transition (or on their
/// own through [`QueueStore::update`](crate::QueueStore::update)).
#[derive(Debug, Clone, Default)]
pub struct RequestUpdate {
    pub retry_count: Option<u32>,
    pub conflict_check: Option<ConflictCheck>,
    pub reason: Option<String>,
    pub source_sha: Option<String>,
    pub merge_commit: Option<String>,
}

impl RequestUpdate {
    pub fn reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn conflict_check(check: ConflictCheck) -> Self {
        Self {
            conflict_check: Some(check),
            ..Default::default()
        }
    }

    pub fn retry_count(n: u32) -> Self {
        Self {
            retry_count: Some(n),
            ..Default::default()
        }
    }

    /// Reject updates that would break a request invariant. Nothing is
    /// written if this fails.
    pub fn check(&self, req: &MergeRequest, max_retries: u32) -> Result<(), QueueError> {
        if let Some(n) = self.retry_count {
            if n < req.retry_count {
                return Err(QueueError::Integrity {
                    id: req.id.clone(),
                    message: format!("retry_count may not decrease ({} -> {n})", req.retry_count),
                });
            }
            if n > max_retries {
                return Err(QueueError::Integrity {
                    id: req.id.clone(),
                    message: format!("retry_count {n} exceeds max_retries {max_retries}"),
                });
            }
        }
        Ok(())
    }

    pub fn apply(self, req: &mut MergeRequest) {
        if let Some(v) = self.retry_count {
            req.retry_count = v;
        }
        if let Some(v) = self.conflict_check {
            req.conflict_check = v;
        }
        if let Some(v) = self.reason {
            req.reason = Some(v);
        }
        if let Some(v) = self.source_sha {
            req.source_sha = Some(v);
        }
        if let Some(v) = self.merge_commit {
            req.merge_commit = Some(v);
        }
    }
}

// ── CAS-guarded transition ──

/// Move `req` from `from` to `to`, stamping timestamps and metrics.
/// Returns Ok(true) on success, Ok(false) on CAS miss (current != from).
pub fn transition(
    req: &mut MergeRequest,
    from: RequestStatus,
    to: RequestStatus,
    update: RequestUpdate,
    max_retries: u32,
) -> Result<bool, QueueError> {
    if req.status != from {
        return Ok(false); // CAS miss
    }
    if !is_valid_transition(from, to) {
        tracing::error!(id = %req.id, %from, %to, "rejected invalid transition");
        return Err(QueueError::InvalidTransition {
            id: req.id.clone(),
            from,
            to,
        });
    }
    update.check(req, max_retries)?;

    let now = clock::now_rfc3339();
    req.status = to;
    if to == RequestStatus::Merging {
        req.metrics.wait_time_sec = clock::seconds_between(&req.submitted_at, &now);
        req.started_at = Some(now.clone());
    }
    if to.is_terminal() {
        req.metrics.merge_duration_sec = req
            .started_at
            .as_deref()
            .and_then(|s| clock::seconds_between(s, &now));
        if req.metrics.wait_time_sec.is_none() {
            req.metrics.wait_time_sec = clock::seconds_between(&req.submitted_at, &now);
        }
        req.completed_at = Some(now);
    }
    update.apply(req);
    Ok(true)
}

/// Return an interrupted MERGING request to QUEUED. Only startup
/// reconciliation may do this; it is not part of the normal forward graph.
pub fn recover_interrupted(req: &mut MergeRequest) -> bool {
    if req.status != RequestStatus::Merging {
        return false;
    }
    req.status = RequestStatus::Queued;
    req.started_at = None;
    req.conflict_check = ConflictCheck::default();
    req.metrics = RequestMetrics::default();
    req.recoveries += 1;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> MergeRequest {
        MergeRequest::new("feature", "main", "tester")
    }

    #[test]
    fn valid_transitions() {
        use RequestStatus::*;
        assert!(is_valid_transition(Queued, Merging));
        assert!(is_valid_transition(Queued, Failed));
        assert!(is_valid_transition(Merging, Merged));
        assert!(is_valid_transition(Merging, Failed));
        assert!(is_valid_transition(Merging, ManualRequired));
    }

    #[test]
    fn backward_and_terminal_transitions_rejected() {
        use RequestStatus::*;
        assert!(!is_valid_transition(Merging, Queued));
        assert!(!is_valid_transition(Queued, Merged));
        assert!(!is_valid_transition(Queued, ManualRequired));
        for terminal in [Merged, Failed, ManualRequired] {
            for to in RequestStatus::ALL {
                assert!(!is_valid_transition(terminal, to), "{terminal} -> {to}");
            }
        }
    }

    #[test]
    fn cas_miss_returns_false() {
        let mut r = req();
        let ok = transition(
            &mut r,
            RequestStatus::Merging,
            RequestStatus::Merged,
            RequestUpdate::default(),
            3,
        )
        .unwrap();
        assert!(!ok);
        assert_eq!(r.status, RequestStatus::Queued);
    }

    #[test]
    fn invalid_transition_is_error_and_leaves_request_untouched() {
        let mut r = req();
        let err = transition(
            &mut r,
            RequestStatus::Queued,
            RequestStatus::Merged,
            RequestUpdate::default(),
            3,
        )
        .unwrap_err();
        assert!(err.is_integrity_violation());
        assert_eq!(r.status, RequestStatus::Queued);
        assert!(r.completed_at.is_none());
    }

    #[test]
    fn timestamps_are_stamped() {
        let mut r = req();
        transition(
            &mut r,
            RequestStatus::Queued,
            RequestStatus::Merging,
            RequestUpdate::default(),
            3,
        )
        .unwrap();
        assert!(r.started_at.is_some());
        assert!(r.metrics.wait_time_sec.is_some());
        assert!(r.completed_at.is_none());

        transition(
            &mut r,
            RequestStatus::Merging,
            RequestStatus::Merged,
            RequestUpdate {
                merge_commit: Some("abc".into()),
                ..Default::default()
            },
            3,
        )
        .unwrap();
        assert!(r.completed_at.is_some());
        assert!(r.metrics.merge_duration_sec.is_some());
        assert_eq!(r.merge_commit.as_deref(), Some("abc"));
    }

    #[test]
    fn retry_count_cannot_decrease_or_exceed_bound() {
        let mut r = req();
        r.retry_count = 2;
        assert!(RequestUpdate::retry_count(1).check(&r, 3).is_err());
        assert!(RequestUpdate::retry_count(4).check(&r, 3).is_err());
        assert!(RequestUpdate::retry_count(3).check(&r, 3).is_ok());
    }

    #[test]
    fn recover_interrupted_resets_merging() {
        let mut r = req();
        transition(
            &mut r,
            RequestStatus::Queued,
            RequestStatus::Merging,
            RequestUpdate::default(),
            3,
        )
        .unwrap();
        assert!(recover_interrupted(&mut r));
        assert_eq!(r.status, RequestStatus::Queued);
        assert!(r.started_at.is_none());
        assert_eq!(r.recoveries, 1);
        assert!(!recover_interrupted(&mut r));
    }
}
