//! Startup reconciliation, deadlock detection and operator force-release.

use std::fmt;

use anyhow::{bail, Result};
use serde::Serialize;

use marshal_core::{HolderInfo, MergeRequest, RequestStatus, RequestUpdate};

use crate::coordinator::Coordinator;
use crate::event_log::Event;
use crate::executor::{in_progress_operations, REQUEST_TRAILER};
use crate::precheck;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub merged: usize,
    pub requeued: usize,
}

/// Resolve every MERGING request left by a previous run: MERGED if its
/// merge is visible on the target, otherwise back to QUEUED. Running it
/// twice without git activity changes nothing the second time.
pub async fn reconcile(coord: &Coordinator) -> Result<ReconcileReport> {
    let interrupted: Vec<MergeRequest> = coord.store.snapshot()?.merging().cloned().collect();
    let mut report = ReconcileReport::default();
    if interrupted.is_empty() {
        return Ok(report);
    }
    if let Err(e) = coord.fetch("reconcile").await {
        tracing::warn!(error = format!("{e:#}"), "fetch before reconcile failed");
    }

    for req in interrupted {
        match resolve_interrupted(coord, &req).await? {
            Some(Resolution::Merged) => report.merged += 1,
            Some(Resolution::Requeued) => report.requeued += 1,
            None => {}
        }
    }
    Ok(report)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    Merged,
    Requeued,
}

/// Settle one MERGING request: MERGED if its merge is on the target,
/// otherwise back to QUEUED. `None` if it was no longer MERGING.
pub(crate) async fn resolve_interrupted(
    coord: &Coordinator,
    req: &MergeRequest,
) -> Result<Option<Resolution>> {
    let found = match find_merge(coord, req).await {
        Ok(found) => found,
        Err(e) => {
            tracing::warn!(request_id = %req.id, error = format!("{e:#}"), "could not inspect target, requeueing");
            None
        }
    };
    let Some((merge_commit, source_sha)) = found else {
        if !coord.store.recover_interrupted(&req.id)? {
            return Ok(None);
        }
        coord.events.record(Event::Recovered {
            request_id: req.id.clone(),
            outcome: "requeued".into(),
        });
        return Ok(Some(Resolution::Requeued));
    };

    let update = RequestUpdate {
        merge_commit: Some(merge_commit.clone()),
        source_sha,
        ..Default::default()
    };
    if !coord
        .store
        .transition(&req.id, RequestStatus::Merging, RequestStatus::Merged, update)?
    {
        return Ok(None);
    }
    tracing::info!(request_id = %req.id, %merge_commit, "interrupted merge found on target");
    coord.events.record(Event::Recovered {
        request_id: req.id.clone(),
        outcome: "merged".into(),
    });
    Ok(Some(Resolution::Merged))
}

/// The merge commit for `req` on the target tip, if the merge landed.
async fn find_merge(
    coord: &Coordinator,
    req: &MergeRequest,
) -> Result<Option<(String, Option<String>)>> {
    let git = &coord.git;
    let Some(tip) = git
        .rev_parse(&precheck::target_ref(coord.remote(), &req.target))
        .await?
    else {
        return Ok(None);
    };

    let grep = format!("{REQUEST_TRAILER}: {}", req.id);
    let log = git
        .run(&["log", "--format=%H", "-F", "--grep", &grep, &tip])
        .await?;
    if let Some(commit) = log.lines().next().filter(|l| !l.is_empty()) {
        return Ok(Some((commit.to_string(), req.source_sha.clone())));
    }

    let source = match &req.source_sha {
        Some(sha) => Some(sha.clone()),
        None => match precheck::resolve_refs(git, coord.remote(), req).await {
            Ok(refs) => Some(refs.source),
            Err(_) => None,
        },
    };
    if let Some(source) = source {
        if git.rev_parse(&source).await?.is_some() && git.is_ancestor(&source, &tip).await? {
            return Ok(Some((tip, Some(source))));
        }
    }
    Ok(None)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeadlockCandidate {
    StuckRequest {
        request_id: String,
        target: String,
        merging_for_sec: u64,
    },
    StaleLock {
        name: String,
        holder: Option<String>,
        pid: Option<u32>,
        heartbeat_age_sec: Option<u64>,
        /// A live handle still holds the OS lock.
        os_lock_held: bool,
    },
}

impl fmt::Display for DeadlockCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadlockCandidate::StuckRequest {
                request_id,
                target,
                merging_for_sec,
            } => write!(
                f,
                "{request_id} has been MERGING on `{target}` for {merging_for_sec}s"
            ),
            DeadlockCandidate::StaleLock {
                name,
                holder,
                pid,
                heartbeat_age_sec,
                os_lock_held,
            } => {
                write!(f, "lock `{name}`")?;
                if let Some(holder) = holder {
                    write!(f, " held by {holder}")?;
                }
                if let Some(pid) = pid {
                    write!(f, " (pid {pid})")?;
                }
                match heartbeat_age_sec {
                    Some(age) => write!(f, " has not heartbeated for {age}s")?,
                    None => write!(f, " has unreadable holder metadata")?,
                }
                if !os_lock_held {
                    write!(f, "; no live process holds it")?;
                }
                Ok(())
            }
        }
    }
}

/// Flag long-running merges and stale locks. Alerts only; never releases
/// or rewrites anything.
pub async fn detect_deadlocks(coord: &Coordinator) -> Result<Vec<DeadlockCandidate>> {
    let threshold = coord.config.deadlock_threshold().as_secs();
    let stale_age = coord.config.stale_lock_age();
    let mut candidates = Vec::new();

    let doc = coord.store.snapshot()?;
    for req in doc.merging() {
        if let Some(age) = req.merging_for_sec() {
            if age > threshold {
                candidates.push(DeadlockCandidate::StuckRequest {
                    request_id: req.id.clone(),
                    target: req.target.clone(),
                    merging_for_sec: age,
                });
            }
        }
    }

    for state in coord.locks.list()? {
        if !coord.locks.is_stale(&state.name, stale_age) {
            continue;
        }
        let holder = state.holder.as_ref();
        candidates.push(DeadlockCandidate::StaleLock {
            name: state.name.clone(),
            holder: holder.map(|h| h.holder.clone()),
            pid: holder.map(|h| h.pid),
            heartbeat_age_sec: holder.and_then(HolderInfo::heartbeat_age_sec),
            os_lock_held: state.locked,
        });
    }

    for candidate in &candidates {
        tracing::warn!(%candidate, "deadlock candidate");
        coord.events.record(Event::DeadlockCandidate {
            detail: candidate.to_string(),
        });
        coord
            .alert(&format!("Possible deadlock: {candidate}"))
            .await;
    }
    Ok(candidates)
}

/// Operator-only: clear the holder metadata of `target`'s lock. Refuses
/// while a live process holds the OS lock or the target worktree is in the
/// middle of a git operation. Returns the metadata that was removed.
pub async fn force_release(coord: &Coordinator, target: &str) -> Result<Option<HolderInfo>> {
    if coord.locks.is_locked(target)? {
        let pid = coord.locks.holder(target).map(|h| h.pid);
        bail!(
            "lock `{target}` is held by a live process{}; stop it first",
            pid.map(|p| format!(" (pid {p})")).unwrap_or_default()
        );
    }

    let worktree = coord.paths.worktree_dir(target);
    if worktree.join(".git").exists() {
        let git_dir = coord.git.in_dir(&worktree).git_dir().await?;
        let ops = in_progress_operations(&git_dir);
        if !ops.is_empty() {
            bail!(
                "worktree {} has an in-progress {}; inspect it before releasing",
                worktree.display(),
                ops.join(", ")
            );
        }
    }

    let previous = coord.locks.clear_holder(target)?;
    tracing::warn!(target, holder = ?previous.as_ref().map(|h| &h.holder), "lock force-released");
    coord.events.record(Event::LockReleased {
        target: target.to_string(),
    });
    Ok(previous)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{execute, MergeOutcome};
    use crate::processor::{run, RunOptions};
    use crate::testutil::TestRepo;
    use marshal_core::clock::format_rfc3339;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn start(coord: &Coordinator, branch: &str) -> MergeRequest {
        let req = coord.store.enqueue(branch, "main", "tester").unwrap();
        assert!(coord
            .store
            .transition(&req.id, RequestStatus::Queued, RequestStatus::Merging, RequestUpdate::default())
            .unwrap());
        coord.store.get(&req.id).unwrap()
    }

    fn hours_ago(h: i64) -> String {
        format_rfc3339(time::OffsetDateTime::now_utc() - time::Duration::hours(h))
    }

    #[tokio::test]
    async fn crash_before_push_requeues_then_merges() {
        let repo = TestRepo::new().await;
        repo.pushed_branch("feature", "n.txt", "n\n").await;
        let (coord, _) = repo.coordinator(repo.config());
        let req = start(&coord, "feature");

        let report = reconcile(&coord).await.unwrap();
        assert_eq!(report, ReconcileReport { merged: 0, requeued: 1 });
        let back = coord.store.get(&req.id).unwrap();
        assert_eq!(back.status, RequestStatus::Queued);
        assert!(back.started_at.is_none());
        assert_eq!(back.recoveries, 1);

        let opts = RunOptions {
            once: true,
            poll_interval: Some(Duration::from_millis(10)),
        };
        run(coord.clone(), opts, CancellationToken::new()).await.unwrap();
        assert_eq!(coord.store.get(&req.id).unwrap().status, RequestStatus::Merged);
    }

    #[tokio::test]
    async fn crash_after_push_resolves_to_merged() {
        let repo = TestRepo::new().await;
        repo.pushed_branch("feature", "n.txt", "n\n").await;
        let (coord, _) = repo.coordinator(repo.config());
        let req = start(&coord, "feature");
        // Push happened, but the terminal transition never did.
        let MergeOutcome::Merged { merge_commit, .. } = execute(&coord, &req).await.unwrap() else {
            panic!("merge expected");
        };
        assert_eq!(coord.store.get(&req.id).unwrap().status, RequestStatus::Merging);

        let report = reconcile(&coord).await.unwrap();
        assert_eq!(report, ReconcileReport { merged: 1, requeued: 0 });
        let done = coord.store.get(&req.id).unwrap();
        assert_eq!(done.status, RequestStatus::Merged);
        assert_eq!(done.merge_commit.as_deref(), Some(merge_commit.as_str()));
    }

    #[tokio::test]
    async fn source_already_on_target_counts_as_merged() {
        let repo = TestRepo::new().await;
        repo.pushed_branch("feature", "n.txt", "n\n").await;
        // Someone fast-forwarded main to the branch by hand.
        repo.git()
            .run(&["push", "-q", "origin", "feature:main"])
            .await
            .unwrap();
        let (coord, _) = repo.coordinator(repo.config());
        let req = start(&coord, "feature");

        let report = reconcile(&coord).await.unwrap();
        assert_eq!(report.merged, 1);
        assert_eq!(coord.store.get(&req.id).unwrap().status, RequestStatus::Merged);
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let repo = TestRepo::new().await;
        repo.pushed_branch("a", "a.txt", "a\n").await;
        let (coord, _) = repo.coordinator(repo.config());
        start(&coord, "a");

        reconcile(&coord).await.unwrap();
        let first = coord.store.snapshot().unwrap();
        let again = reconcile(&coord).await.unwrap();
        assert_eq!(again, ReconcileReport::default());
        assert_eq!(coord.store.snapshot().unwrap(), first);
        assert_eq!(first.merging().count(), 0);
    }

    #[tokio::test]
    async fn stale_lock_without_holder_process_is_flagged_untouched() {
        let repo = TestRepo::new().await;
        let (coord, notifier) = repo.coordinator(repo.config());
        // Leave a lock file behind, then forge holder metadata from a dead run.
        drop(
            coord
                .locks
                .try_acquire("main", HolderInfo::new("main", "mr_dead"))
                .unwrap()
                .unwrap(),
        );
        let mut ghost = HolderInfo::new("main", "mr_dead");
        ghost.pid = 999_999;
        ghost.heartbeat_at = hours_ago(2);
        let holder_path = coord.paths.holder_path("main");
        std::fs::write(&holder_path, serde_json::to_vec(&ghost).unwrap()).unwrap();
        let before = std::fs::read(&holder_path).unwrap();

        let found = detect_deadlocks(&coord).await.unwrap();
        assert_eq!(found.len(), 1);
        match &found[0] {
            DeadlockCandidate::StaleLock {
                name,
                holder,
                os_lock_held,
                heartbeat_age_sec,
                ..
            } => {
                assert_eq!(name, "main");
                assert_eq!(holder.as_deref(), Some("mr_dead"));
                assert!(!os_lock_held);
                assert!(heartbeat_age_sec.unwrap() >= 7000);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(std::fs::read(&holder_path).unwrap(), before);
        assert!(!coord.locks.is_locked("main").unwrap());
        assert!(notifier.messages()[0].contains("Possible deadlock"));
        let events = std::fs::read_to_string(&coord.paths.events_jsonl).unwrap();
        assert!(events.contains("deadlock_candidate"));
    }

    #[tokio::test]
    async fn long_merging_request_is_flagged() {
        let repo = TestRepo::new().await;
        let mut config = repo.config();
        config.deadlock_threshold_sec = Some(60);
        let (coord, _) = repo.coordinator(config);
        let req = start(&coord, "feature");

        let mut doc = coord.store.snapshot().unwrap();
        let started = hours_ago(1);
        for r in doc.requests.iter_mut() {
            r.submitted_at = hours_ago(2);
            r.started_at = Some(started.clone());
        }
        marshal_store::write_atomic(
            &coord.paths.queue_json,
            &serde_json::to_vec_pretty(&doc).unwrap(),
        )
        .unwrap();

        let found = detect_deadlocks(&coord).await.unwrap();
        assert!(matches!(
            &found[..],
            [DeadlockCandidate::StuckRequest { request_id, merging_for_sec, .. }]
                if *request_id == req.id && *merging_for_sec >= 3500
        ));
        // Still MERGING: detection never changes state.
        assert_eq!(coord.store.get(&req.id).unwrap().status, RequestStatus::Merging);
    }

    #[tokio::test]
    async fn fresh_lock_is_not_flagged() {
        let repo = TestRepo::new().await;
        let (coord, _) = repo.coordinator(repo.config());
        let _held = coord
            .locks
            .try_acquire("main", HolderInfo::new("main", "mr_live"))
            .unwrap()
            .unwrap();
        assert!(detect_deadlocks(&coord).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn force_release_refuses_live_lock() {
        let repo = TestRepo::new().await;
        let (coord, _) = repo.coordinator(repo.config());
        let _held = coord
            .locks
            .try_acquire("main", HolderInfo::new("main", "mr_live"))
            .unwrap()
            .unwrap();
        let err = force_release(&coord, "main").await.unwrap_err();
        assert!(err.to_string().contains("live process"));
        assert!(coord.locks.holder("main").is_some());
    }

    #[tokio::test]
    async fn force_release_refuses_in_progress_worktree() {
        let repo = TestRepo::new().await;
        let (coord, _) = repo.coordinator(repo.config());
        let dir = coord.paths.worktree_dir("main");
        coord
            .git
            .run(&["worktree", "add", "-q", "--detach", dir.to_str().unwrap(), "main"])
            .await
            .unwrap();
        let git_dir = coord.git.in_dir(&dir).git_dir().await.unwrap();
        std::fs::create_dir(git_dir.join("rebase-merge")).unwrap();
        std::fs::write(
            coord.paths.holder_path("main"),
            serde_json::to_vec(&HolderInfo::new("main", "mr_dead")).unwrap(),
        )
        .unwrap();

        let err = force_release(&coord, "main").await.unwrap_err();
        assert!(err.to_string().contains("rebase"));
        assert!(coord.locks.holder("main").is_some());
    }

    #[tokio::test]
    async fn force_release_clears_dead_holder() {
        let repo = TestRepo::new().await;
        let (coord, _) = repo.coordinator(repo.config());
        std::fs::write(
            coord.paths.holder_path("main"),
            serde_json::to_vec(&HolderInfo::new("main", "mr_dead")).unwrap(),
        )
        .unwrap();

        let previous = force_release(&coord, "main").await.unwrap();
        assert_eq!(previous.map(|h| h.holder).as_deref(), Some("mr_dead"));
        assert!(coord.locks.holder("main").is_none());
    }
}
