//! Persisted FIFO queue of merge requests.
//!
//! The whole queue is one JSON document (`queue.json`). Every mutation takes
//! the `queue.lock` advisory lock, re-reads the document, applies a validated
//! change and replaces the file atomically before returning. Readers never
//! lock: they always see either the previous or the next complete document.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use marshal_store::MarshalPaths;

use crate::error::QueueError;
use crate::lock::LockManager;
use crate::machine::{self, RequestUpdate};
use crate::request::{check_ref_name, new_request_id, MergeRequest, RequestStatus};

pub const QUEUE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueDocument {
    pub version: u32,
    /// Bumped on every write.
    #[serde(default)]
    pub revision: u64,
    /// Insertion order is submission order.
    #[serde(default)]
    pub requests: Vec<MergeRequest>,
}

impl Default for QueueDocument {
    fn default() -> Self {
        Self {
            version: QUEUE_FORMAT_VERSION,
            revision: 0,
            requests: Vec::new(),
        }
    }
}

impl QueueDocument {
    pub fn get(&self, id: &str) -> Option<&MergeRequest> {
        self.requests.iter().find(|r| r.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut MergeRequest, QueueError> {
        self.requests
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    /// Oldest QUEUED request for `target`.
    pub fn head(&self, target: &str) -> Option<&MergeRequest> {
        self.requests
            .iter()
            .find(|r| r.target == target && r.status == RequestStatus::Queued)
    }

    /// Distinct targets with at least one QUEUED request, in order of their
    /// oldest queued request.
    pub fn targets_with_queued(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.requests
            .iter()
            .filter(|r| r.status == RequestStatus::Queued)
            .filter(|r| seen.insert(r.target.as_str()))
            .map(|r| r.target.clone())
            .collect()
    }

    pub fn merging(&self) -> impl Iterator<Item = &MergeRequest> {
        self.requests
            .iter()
            .filter(|r| r.status == RequestStatus::Merging)
    }

    pub fn filter<'a>(&'a self, filter: &'a QueueFilter) -> impl Iterator<Item = &'a MergeRequest> {
        self.requests.iter().filter(move |r| filter.matches(r))
    }
}

/// Read-side filter for status queries.
#[derive(Debug, Clone, Default)]
pub struct QueueFilter {
    pub target: Option<String>,
    pub submitter: Option<String>,
    pub status: Option<RequestStatus>,
}

impl QueueFilter {
    pub fn matches(&self, r: &MergeRequest) -> bool {
        self.target.as_deref().map_or(true, |t| r.target == t)
            && self.submitter.as_deref().map_or(true, |s| r.submitter == s)
            && self.status.map_or(true, |s| r.status == s)
    }
}

/// Data-access type owning `queue.json`. All status changes go through
/// [`QueueStore::transition`] or one of the operator operations built on it.
#[derive(Debug, Clone)]
pub struct QueueStore {
    paths: MarshalPaths,
    max_retries: u32,
}

impl QueueStore {
    pub fn open(paths: MarshalPaths, max_retries: u32) -> Result<Self, QueueError> {
        paths.ensure_layout()?;
        Ok(Self { paths, max_retries })
    }

    pub fn paths(&self) -> &MarshalPaths {
        &self.paths
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Read the current document without locking. A missing file is an
    /// empty queue; anything unparseable is `Corrupt`.
    pub fn load(&self) -> Result<QueueDocument, QueueError> {
        read_document(&self.paths.queue_json)
    }

    /// Read-only copy of the queue.
    pub fn snapshot(&self) -> Result<QueueDocument, QueueError> {
        self.load()
    }

    pub fn get(&self, id: &str) -> Result<MergeRequest, QueueError> {
        self.load()?
            .get(id)
            .cloned()
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    pub fn list(&self, filter: &QueueFilter) -> Result<Vec<MergeRequest>, QueueError> {
        Ok(self.load()?.filter(filter).cloned().collect())
    }

    /// Append a new QUEUED request. Returns only after the document holding
    /// it is durably on disk.
    pub fn enqueue(
        &self,
        branch: &str,
        target: &str,
        submitter: &str,
    ) -> Result<MergeRequest, QueueError> {
        check_ref_name("branch", branch).map_err(QueueError::InvalidInput)?;
        check_ref_name("target", target).map_err(QueueError::InvalidInput)?;
        if submitter.trim().is_empty() {
            return Err(QueueError::InvalidInput("submitter is empty".into()));
        }
        let req = self.mutate(|doc| {
            let mut req = MergeRequest::new(branch, target, submitter);
            while doc.get(&req.id).is_some() {
                req.id = new_request_id();
            }
            doc.requests.push(req.clone());
            Ok(req)
        })?;
        tracing::info!(request_id = %req.id, branch, target, submitter, "enqueued");
        Ok(req)
    }

    /// Oldest QUEUED request for `target`, or `None` if the target's lock is
    /// currently held. Does not change any status.
    pub fn dequeue_next(
        &self,
        target: &str,
        locks: &LockManager,
    ) -> Result<Option<MergeRequest>, QueueError> {
        if locks.is_locked(target)? {
            tracing::debug!(target, "target locked, skipping");
            return Ok(None);
        }
        Ok(self.load()?.head(target).cloned())
    }

    /// Compare-and-swap status change. Ok(false) when the request is no longer
    /// in `from` (someone else moved it); `InvalidTransition` when `from -> to`
    /// is not a forward edge.
    pub fn transition(
        &self,
        id: &str,
        from: RequestStatus,
        to: RequestStatus,
        update: RequestUpdate,
    ) -> Result<bool, QueueError> {
        let max = self.max_retries;
        let changed = self.mutate_if(|doc| {
            let req = doc.get_mut(id)?;
            machine::transition(req, from, to, update, max)
        })?;
        if changed {
            tracing::debug!(request_id = id, %from, %to, "transition");
        } else {
            tracing::debug!(request_id = id, %from, %to, "transition skipped, status changed");
        }
        Ok(changed)
    }

    /// Field update without a status change, guarded by the expected status.
    pub fn update(
        &self,
        id: &str,
        expected: RequestStatus,
        update: RequestUpdate,
    ) -> Result<bool, QueueError> {
        let max = self.max_retries;
        self.mutate_if(|doc| {
            let req = doc.get_mut(id)?;
            if req.status != expected {
                return Ok(false);
            }
            update.check(req, max)?;
            update.apply(req);
            Ok(true)
        })
    }

    /// Operator cancel: QUEUED or MERGING -> FAILED. An in-flight merge
    /// notices on its next fresh read or CAS and stops before pushing.
    pub fn cancel(&self, id: &str, reason: &str) -> Result<MergeRequest, QueueError> {
        let max = self.max_retries;
        let req = self.mutate(|doc| {
            let req = doc.get_mut(id)?;
            let from = req.status;
            if from.is_terminal() {
                return Err(QueueError::InvalidInput(format!(
                    "{id} is already {from}; nothing to cancel"
                )));
            }
            let reason = if reason.trim().is_empty() {
                "cancelled by operator".to_string()
            } else {
                format!("cancelled: {reason}")
            };
            machine::transition(req, from, RequestStatus::Failed, RequestUpdate::reason(reason), max)?;
            Ok(req.clone())
        })?;
        tracing::warn!(request_id = id, reason = ?req.reason, "cancelled");
        Ok(req)
    }

    /// Operator re-enqueue of a FAILED or MANUAL_REQUIRED request. The old
    /// request is untouched; a new QUEUED one referencing it is appended.
    pub fn requeue(&self, id: &str, submitter: &str) -> Result<MergeRequest, QueueError> {
        let req = self.mutate(|doc| {
            let old = doc
                .get(id)
                .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
            if !matches!(
                old.status,
                RequestStatus::Failed | RequestStatus::ManualRequired
            ) {
                return Err(QueueError::InvalidInput(format!(
                    "{id} is {}; only FAILED or MANUAL_REQUIRED requests can be requeued",
                    old.status
                )));
            }
            let mut req = MergeRequest::new(&old.branch, &old.target, submitter);
            while doc.get(&req.id).is_some() {
                req.id = new_request_id();
            }
            req.requeued_from = Some(id.to_string());
            doc.requests.push(req.clone());
            Ok(req)
        })?;
        tracing::info!(request_id = %req.id, requeued_from = id, "requeued");
        Ok(req)
    }

    /// Return an interrupted MERGING request to QUEUED. Used only by startup
    /// reconciliation.
    pub fn recover_interrupted(&self, id: &str) -> Result<bool, QueueError> {
        let changed = self.mutate_if(|doc| Ok(machine::recover_interrupted(doc.get_mut(id)?)))?;
        if changed {
            tracing::warn!(request_id = id, "interrupted merge returned to queue");
        }
        Ok(changed)
    }

    /// Locked read-modify-write. `f` failing leaves the file untouched.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut QueueDocument) -> Result<T, QueueError>,
    ) -> Result<T, QueueError> {
        let _guard = marshal_store::lock_file(&self.paths.queue_lock)?;
        let mut doc = self.load()?;
        let out = f(&mut doc)?;
        self.save(&mut doc)?;
        Ok(out)
    }

    /// Like `mutate`, but skips the write when `f` reports no change.
    fn mutate_if(
        &self,
        f: impl FnOnce(&mut QueueDocument) -> Result<bool, QueueError>,
    ) -> Result<bool, QueueError> {
        let _guard = marshal_store::lock_file(&self.paths.queue_lock)?;
        let mut doc = self.load()?;
        if !f(&mut doc)? {
            return Ok(false);
        }
        self.save(&mut doc)?;
        Ok(true)
    }

    fn save(&self, doc: &mut QueueDocument) -> Result<(), QueueError> {
        doc.revision += 1;
        let data = serde_json::to_vec_pretty(doc).map_err(|e| QueueError::Corrupt {
            path: self.paths.queue_json.clone(),
            message: format!("serializing: {e}"),
        })?;
        marshal_store::write_atomic(&self.paths.queue_json, &data)?;
        Ok(())
    }
}

fn read_document(path: &Path) -> Result<QueueDocument, QueueError> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(QueueDocument::default())
        }
        Err(source) => {
            return Err(QueueError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let corrupt = |message: String| QueueError::Corrupt {
        path: path.to_path_buf(),
        message,
    };
    let doc: QueueDocument = serde_json::from_str(&content).map_err(|e| corrupt(e.to_string()))?;
    if doc.version != QUEUE_FORMAT_VERSION {
        return Err(corrupt(format!(
            "unsupported version {} (expected {QUEUE_FORMAT_VERSION})",
            doc.version
        )));
    }
    let mut ids = HashSet::new();
    for r in &doc.requests {
        if !ids.insert(r.id.as_str()) {
            return Err(corrupt(format!("duplicate request id {}", r.id)));
        }
    }
    Ok(doc)
}
