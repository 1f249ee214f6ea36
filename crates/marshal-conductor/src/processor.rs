//! Queue processor: the long-lived poll loop.
//!
//! One task per target with queued work; targets run concurrently, each
//! strictly FIFO. The processor is the only component that decides whether
//! a request ends FAILED, MANUAL_REQUIRED or goes round again.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use marshal_core::{LockError, MergeRequest, QueueError, RequestStatus, RequestUpdate};

use crate::coordinator::Coordinator;
use crate::event_log::{write_runner_status, Event, InFlight, RunnerStatus};
use crate::executor::{self, MergeOutcome};
use crate::git::{mask_secrets, truncate_detail};
use crate::precheck;
use crate::recovery::{self, Resolution};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Exit once no queued work can make progress.
    pub once: bool,
    /// Overrides `poll_interval_ms`.
    pub poll_interval: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub merged: usize,
    pub failed: usize,
    pub manual_required: usize,
    /// Requests left QUEUED for a later sweep (lock timeout, cancel race).
    pub deferred: usize,
}

/// A request failing this many times in a row ends a `--once` run.
const MAX_TASK_ERRORS: u32 = 3;
const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(60);
/// Attempts at writing a terminal status while the target lock is held.
const PERSIST_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
enum TaskOutcome {
    Merged,
    Failed,
    ManualRequired,
    Deferred,
    Cancelled,
    /// A stranded MERGING request went back to QUEUED.
    Requeued,
    /// Integrity problem on this request; stop touching it.
    Blocked(String),
    /// Storage or git error; the request keeps its status and the target
    /// backs off.
    Errored(String),
}

struct Running {
    request_id: String,
    handle: JoinHandle<TaskOutcome>,
}

/// Bookkeeping carried from one sweep to the next.
#[derive(Default)]
struct LoopState {
    summary: RunSummary,
    /// Request ids left alone for the rest of the run.
    blocked: HashSet<String>,
    /// Consecutive errors per request id.
    errors: HashMap<String, u32>,
    /// Earliest next attempt for targets backing off after an error.
    backoff: HashMap<String, Instant>,
    /// Ends a `--once` run once in-flight work has drained.
    fatal: Option<anyhow::Error>,
}

impl LoopState {
    fn backing_off(&self, target: &str, now: Instant) -> bool {
        self.backoff.get(target).is_some_and(|until| *until > now)
    }

    fn record(&mut self, target: &str, request_id: &str, outcome: TaskOutcome, once: bool, poll: Duration) {
        if !matches!(outcome, TaskOutcome::Errored(_)) {
            self.errors.remove(request_id);
            self.backoff.remove(target);
        }
        match outcome {
            TaskOutcome::Merged => self.summary.merged += 1,
            TaskOutcome::Failed => self.summary.failed += 1,
            TaskOutcome::ManualRequired => self.summary.manual_required += 1,
            TaskOutcome::Deferred => self.summary.deferred += 1,
            TaskOutcome::Cancelled | TaskOutcome::Requeued => {}
            TaskOutcome::Blocked(id) => {
                self.blocked.insert(id);
            }
            TaskOutcome::Errored(message) => {
                let count = self.errors.entry(request_id.to_string()).or_insert(0);
                *count += 1;
                let delay = error_backoff(poll, *count);
                tracing::warn!(request_id, target, errors = *count, ?delay, "backing off after error");
                self.backoff.insert(target.to_string(), Instant::now() + delay);
                if once && *count >= MAX_TASK_ERRORS && self.fatal.is_none() {
                    self.fatal = Some(anyhow!(
                        "giving up on {request_id} after {count} errors: {message}"
                    ));
                }
            }
        }
    }
}

fn error_backoff(poll: Duration, errors: u32) -> Duration {
    poll.saturating_mul(1 << errors.min(10)).min(MAX_ERROR_BACKOFF)
}

/// Run the processor until cancelled (or, with `once`, until the queue has
/// nothing left it can make progress on).
pub async fn run(
    coord: Arc<Coordinator>,
    opts: RunOptions,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    let Some(_instance) = marshal_store::try_lock_file(&coord.paths.processor_lock)? else {
        bail!(
            "another processor is already running for {}",
            coord.paths.state_dir.display()
        );
    };
    let poll = opts
        .poll_interval
        .unwrap_or_else(|| coord.config.poll_interval());

    coord.events.record(Event::ProcessorStart {
        pid: std::process::id(),
    });
    tracing::info!(state_dir = %coord.paths.state_dir.display(), once = opts.once, "processor started");

    let report = recovery::reconcile(&coord).await?;
    if report.merged + report.requeued > 0 {
        tracing::info!(merged = report.merged, requeued = report.requeued, "reconciled interrupted merges");
    }
    let mut state = LoopState {
        blocked: startup_validation(&coord).await?,
        ..Default::default()
    };
    let mut running: HashMap<String, Running> = HashMap::new();
    let wake = Arc::new(Notify::new());
    let mut last_deadlock_check = Instant::now();
    let mut corrupt_alerted = false;

    loop {
        reap(&coord, &mut running, &mut state, opts.once, poll, false).await;
        if state.fatal.is_some() {
            break;
        }
        if cancel.is_cancelled() {
            tracing::info!("shutdown requested, waiting for in-flight merges");
            break;
        }

        let doc = match coord.store.snapshot() {
            Ok(doc) => {
                corrupt_alerted = false;
                doc
            }
            Err(e @ QueueError::Corrupt { .. }) => {
                if opts.once {
                    return Err(e.into());
                }
                // The whole queue is blocked until an operator repairs it.
                if !corrupt_alerted {
                    tracing::error!(error = %e, "queue document unreadable, processing halted");
                    coord.events.record(Event::IntegrityViolation {
                        request_id: None,
                        message: e.to_string(),
                    });
                    coord.alert(&format!("Queue halted: {e}")).await;
                    corrupt_alerted = true;
                }
                if wait(&cancel, &wake, poll).await {
                    break;
                }
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        if last_deadlock_check.elapsed() >= coord.config.deadlock_check_interval() {
            if let Err(e) = recovery::detect_deadlocks(&coord).await {
                tracing::warn!(error = %e, "deadlock check failed");
            }
            last_deadlock_check = Instant::now();
        }

        let now = Instant::now();
        let mut spawned = 0;
        // Targets with work this run can still act on.
        let mut pending: HashSet<String> = HashSet::new();
        // Targets holding a MERGING request no task owns. Nothing new starts
        // there until that request is settled.
        let mut stranded: HashSet<String> = HashSet::new();

        let orphans: Vec<MergeRequest> = doc
            .merging()
            .filter(|r| !running.contains_key(&r.target))
            .cloned()
            .collect();
        for req in orphans {
            if !stranded.insert(req.target.clone()) || state.blocked.contains(&req.id) {
                continue;
            }
            pending.insert(req.target.clone());
            if state.backing_off(&req.target, now) || coord.locks.is_locked(&req.target)? {
                continue;
            }
            tracing::warn!(request_id = %req.id, target = %req.target, "merge left without an outcome, reconciling");
            let target = req.target.clone();
            let handle = tokio::spawn(recover_request(
                Arc::clone(&coord),
                req.clone(),
                Arc::clone(&wake),
            ));
            running.insert(
                target,
                Running {
                    request_id: req.id,
                    handle,
                },
            );
            spawned += 1;
        }

        for target in doc.targets_with_queued() {
            if running.contains_key(&target) || stranded.contains(&target) {
                continue;
            }
            pending.insert(target.clone());
            if state.backing_off(&target, now) {
                continue;
            }
            let Some(req) = coord.store.dequeue_next(&target, &coord.locks)? else {
                continue;
            };
            if state.blocked.contains(&req.id) {
                tracing::debug!(request_id = %req.id, %target, "head of queue is blocked");
                continue;
            }
            let handle = tokio::spawn(process_request(
                Arc::clone(&coord),
                req.clone(),
                Arc::clone(&wake),
            ));
            running.insert(
                target,
                Running {
                    request_id: req.id,
                    handle,
                },
            );
            spawned += 1;
        }
        state
            .backoff
            .retain(|target, _| pending.contains(target) || running.contains_key(target));

        let in_flight = running
            .iter()
            .map(|(target, r)| InFlight {
                target: target.clone(),
                request_id: r.request_id.clone(),
            })
            .collect();
        write_runner_status(
            &coord.paths.runner_status_json,
            &RunnerStatus::from_queue("running", &doc, in_flight),
        );

        if opts.once && spawned == 0 && running.is_empty() && state.backoff.is_empty() {
            break;
        }
        if wait(&cancel, &wake, poll).await {
            tracing::info!("shutdown requested, waiting for in-flight merges");
            break;
        }
    }

    reap(&coord, &mut running, &mut state, opts.once, poll, true).await;

    if let Ok(doc) = coord.store.snapshot() {
        write_runner_status(
            &coord.paths.runner_status_json,
            &RunnerStatus::from_queue("stopped", &doc, Vec::new()),
        );
    }
    let summary = state.summary;
    coord.events.record(Event::ProcessorStop {
        merged: summary.merged,
        failed: summary.failed,
        manual_required: summary.manual_required,
    });
    tracing::info!(
        merged = summary.merged,
        failed = summary.failed,
        manual_required = summary.manual_required,
        "processor stopped"
    );
    match state.fatal {
        Some(e) => Err(e),
        None => Ok(summary),
    }
}

/// Sleep one poll interval or until a task finishes. True if cancelled.
async fn wait(cancel: &CancellationToken, wake: &Notify, poll: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = wake.notified() => false,
        _ = tokio::time::sleep(poll) => false,
    }
}

/// Collect finished target tasks (all of them when `drain`).
async fn reap(
    coord: &Coordinator,
    running: &mut HashMap<String, Running>,
    state: &mut LoopState,
    once: bool,
    poll: Duration,
    drain: bool,
) {
    let done: Vec<String> = running
        .iter()
        .filter(|(_, r)| drain || r.handle.is_finished())
        .map(|(target, _)| target.clone())
        .collect();
    for target in done {
        let Some(r) = running.remove(&target) else {
            continue;
        };
        match r.handle.await {
            Ok(outcome) => state.record(&target, &r.request_id, outcome, once, poll),
            Err(e) => {
                tracing::error!(request_id = %r.request_id, %target, error = %e, "merge task aborted");
                coord
                    .alert(&format!(
                        "Merge task for {} on `{target}` aborted: {e}. Run `marshal reconcile`.",
                        r.request_id
                    ))
                    .await;
                state.blocked.insert(r.request_id);
            }
        }
    }
}

/// Validate the queue at startup; returns request ids to leave alone.
async fn startup_validation(coord: &Coordinator) -> Result<HashSet<String>> {
    let doc = coord.store.snapshot()?;
    let mut blocked = HashSet::new();
    for issue in marshal_core::validate(&doc, coord.config.max_retries) {
        tracing::error!(request_id = ?issue.request_id, message = %issue.message, "integrity violation");
        coord.events.record(Event::IntegrityViolation {
            request_id: issue.request_id.clone(),
            message: issue.message.clone(),
        });
        coord.alert(&format!("Integrity violation: {issue}")).await;
        if let Some(id) = issue.request_id {
            blocked.insert(id);
        }
    }
    Ok(blocked)
}

/// Precheck, lock, execute and persist one request.
async fn process_request(
    coord: Arc<Coordinator>,
    req: MergeRequest,
    wake: Arc<Notify>,
) -> TaskOutcome {
    let outcome = match process_locked(&coord, &req).await {
        Ok(outcome) => outcome,
        Err(e) => task_error(&coord, &req.id, e).await,
    };
    wake.notify_one();
    outcome
}

/// Settle a MERGING request whose task ended before writing its outcome.
async fn recover_request(
    coord: Arc<Coordinator>,
    req: MergeRequest,
    wake: Arc<Notify>,
) -> TaskOutcome {
    let outcome = match recover_locked(&coord, &req).await {
        Ok(outcome) => outcome,
        Err(e) => task_error(&coord, &req.id, e).await,
    };
    wake.notify_one();
    outcome
}

async fn recover_locked(coord: &Coordinator, req: &MergeRequest) -> Result<TaskOutcome> {
    let lock = match coord
        .acquire_lock(&req.target, &req.id, coord.config.lock_timeout())
        .await
    {
        Ok(lock) => lock,
        Err(LockError::Timeout { .. }) => return Ok(TaskOutcome::Deferred),
        Err(e) => return Err(e.into()),
    };
    if let Err(e) = coord.fetch(&req.id).await {
        tracing::warn!(request_id = %req.id, error = format!("{e:#}"), "fetch failed");
    }
    let outcome = match recovery::resolve_interrupted(coord, req).await? {
        Some(Resolution::Merged) => TaskOutcome::Merged,
        Some(Resolution::Requeued) => TaskOutcome::Requeued,
        None => TaskOutcome::Cancelled,
    };
    lock.release();
    Ok(outcome)
}

async fn task_error(coord: &Coordinator, id: &str, e: anyhow::Error) -> TaskOutcome {
    match e.downcast::<QueueError>() {
        Ok(qe) if qe.is_integrity_violation() => block(coord, id, &qe.to_string()).await,
        Ok(qe) => {
            tracing::error!(request_id = id, error = %qe, "queue store error");
            TaskOutcome::Errored(qe.to_string())
        }
        Err(e) => {
            let message = format!("{e:#}");
            tracing::error!(request_id = id, error = %message, "request processing error");
            TaskOutcome::Errored(message)
        }
    }
}

async fn block(coord: &Coordinator, id: &str, message: &str) -> TaskOutcome {
    tracing::error!(request_id = id, message, "integrity violation, request blocked");
    coord.events.record(Event::IntegrityViolation {
        request_id: Some(id.to_string()),
        message: message.to_string(),
    });
    coord
        .alert(&format!("Request {id} blocked: {message}"))
        .await;
    TaskOutcome::Blocked(id.to_string())
}

async fn process_locked(coord: &Coordinator, req: &MergeRequest) -> Result<TaskOutcome> {
    // Advisory precheck outside the lock; repeated under it by the executor.
    if let Err(e) = coord.fetch(&req.id).await {
        tracing::warn!(request_id = %req.id, error = format!("{e:#}"), "fetch failed");
    }
    let check = match precheck::resolve_refs(&coord.git, coord.remote(), req).await {
        Ok(refs) => match precheck::check(&coord.git, &refs.tip, &refs.source).await {
            Ok(verdict) => verdict.to_check(&refs.tip),
            Err(e) => marshal_core::ConflictCheck::unknown(e.to_string()),
        },
        Err(e) if e.is_missing_ref() => {
            let reason = e.to_string();
            if coord.store.transition(
                &req.id,
                RequestStatus::Queued,
                RequestStatus::Failed,
                RequestUpdate::reason(reason.clone()),
            )? {
                return Ok(report_failed(coord, req, &reason).await);
            }
            return Ok(TaskOutcome::Cancelled);
        }
        Err(e) => marshal_core::ConflictCheck::unknown(e.to_string()),
    };
    if !coord.store.update(
        &req.id,
        RequestStatus::Queued,
        RequestUpdate::conflict_check(check),
    )? {
        return Ok(TaskOutcome::Cancelled);
    }

    let lock = match coord
        .acquire_lock(&req.target, &req.id, coord.config.lock_timeout())
        .await
    {
        Ok(lock) => lock,
        Err(LockError::Timeout { waited, .. }) => {
            tracing::warn!(request_id = %req.id, target = %req.target, ?waited, "lock timeout, will retry");
            coord.events.record(Event::LockTimeout {
                request_id: req.id.clone(),
                target: req.target.clone(),
            });
            return Ok(TaskOutcome::Deferred);
        }
        Err(e) => return Err(e.into()),
    };

    if !coord.store.transition(
        &req.id,
        RequestStatus::Queued,
        RequestStatus::Merging,
        RequestUpdate::default(),
    )? {
        return Ok(TaskOutcome::Cancelled);
    }
    let current = coord.store.get(&req.id)?;
    tracing::info!(request_id = %req.id, branch = %req.branch, target = %req.target, "merging");
    coord.events.record(Event::RequestStart {
        request_id: req.id.clone(),
        branch: req.branch.clone(),
        target: req.target.clone(),
    });

    let heartbeat = spawn_heartbeat(&lock, coord.config.heartbeat_interval());
    let started = Instant::now();
    let result = executor::execute(coord, &current).await;
    let outcome = persist_outcome(coord, &current, result, started).await;
    heartbeat.abort();
    lock.release();
    coord.events.record(Event::LockReleased {
        target: req.target.clone(),
    });
    outcome
}

fn spawn_heartbeat(lock: &marshal_core::LockHandle, interval: Duration) -> JoinHandle<()> {
    let writer = lock.heartbeat_writer();
    let name = lock.name().to_string();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            match writer.beat() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => tracing::warn!(lock = %name, error = %e, "heartbeat write failed"),
            }
        }
    })
}

/// Terminal transition for the executor's outcome. A CAS miss means an
/// operator changed the request meanwhile; their status wins.
async fn persist_outcome(
    coord: &Coordinator,
    req: &MergeRequest,
    result: Result<MergeOutcome>,
    started: Instant,
) -> Result<TaskOutcome> {
    let (to, update) = match result {
        // Whether the merge landed is unknown; reconciliation decides.
        Err(e) if e.downcast_ref::<QueueError>().is_some() => return Err(e),
        Ok(MergeOutcome::Cancelled) => {
            tracing::info!(request_id = %req.id, "request changed by operator, stopped");
            return Ok(TaskOutcome::Cancelled);
        }
        Ok(MergeOutcome::Merged {
            merge_commit,
            source_sha,
            noop,
        }) => (
            RequestStatus::Merged,
            RequestUpdate {
                merge_commit: Some(merge_commit),
                source_sha: Some(source_sha),
                reason: noop.then(|| "already contained in target".to_string()),
                ..Default::default()
            },
        ),
        Ok(MergeOutcome::ManualRequired { reason }) => {
            (RequestStatus::ManualRequired, RequestUpdate::reason(reason))
        }
        Ok(MergeOutcome::Failed { reason }) => (RequestStatus::Failed, RequestUpdate::reason(reason)),
        Err(e) => (
            RequestStatus::Failed,
            RequestUpdate::reason(truncate_detail(&mask_secrets(&format!("{e:#}")))),
        ),
    };
    let reason = update.reason.clone().unwrap_or_default();

    // The merge may already be public; keep the target lock until this lands.
    let mut attempt = 1;
    let changed = loop {
        match coord
            .store
            .transition(&req.id, RequestStatus::Merging, to, update.clone())
        {
            Ok(changed) => break changed,
            Err(e) if !e.is_integrity_violation() && attempt < PERSIST_ATTEMPTS => {
                let delay = coord.config.retry_backoff() * (1 << attempt);
                tracing::warn!(request_id = %req.id, %to, attempt, error = %e, ?delay, "writing outcome failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    };
    if !changed {
        tracing::warn!(request_id = %req.id, %to, "status changed during merge, outcome dropped");
        return Ok(TaskOutcome::Cancelled);
    }

    Ok(match to {
        RequestStatus::Merged => {
            let done = coord.store.get(&req.id)?;
            tracing::info!(
                request_id = %req.id,
                target = %req.target,
                retry_count = done.retry_count,
                merge_commit = ?done.merge_commit,
                "merged"
            );
            coord.events.record(Event::RequestMerged {
                request_id: req.id.clone(),
                merge_commit: done.merge_commit.unwrap_or_default(),
                retry_count: done.retry_count,
                duration_ms: started.elapsed().as_millis() as u64,
            });
            TaskOutcome::Merged
        }
        RequestStatus::ManualRequired => {
            tracing::warn!(request_id = %req.id, %reason, "manual intervention required");
            coord.events.record(Event::ManualRequired {
                request_id: req.id.clone(),
                reason: reason.clone(),
            });
            coord
                .alert(&format!(
                    "{} ({} -> {}) needs manual attention: {reason}",
                    req.id, req.branch, req.target
                ))
                .await;
            TaskOutcome::ManualRequired
        }
        _ => report_failed(coord, req, &reason).await,
    })
}

async fn report_failed(coord: &Coordinator, req: &MergeRequest, reason: &str) -> TaskOutcome {
    tracing::error!(request_id = %req.id, branch = %req.branch, target = %req.target, reason, "merge failed");
    coord.events.record(Event::RequestFailed {
        request_id: req.id.clone(),
        reason: reason.to_string(),
    });
    coord
        .alert(&format!(
            "{} ({} -> {}) failed: {reason}",
            req.id, req.branch, req.target
        ))
        .await;
    TaskOutcome::Failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestRepo;
    use marshal_core::{HolderInfo, QueueFilter};
    use marshal_store::MarshalPaths;

    fn once() -> RunOptions {
        RunOptions {
            once: true,
            poll_interval: Some(Duration::from_millis(10)),
        }
    }

    fn statuses(coord: &Coordinator) -> Vec<(String, RequestStatus, u32)> {
        coord
            .store
            .list(&QueueFilter::default())
            .unwrap()
            .into_iter()
            .map(|r| (r.branch, r.status, r.retry_count))
            .collect()
    }

    #[tokio::test]
    async fn ten_independent_branches_all_merge() {
        let repo = TestRepo::new().await;
        for i in 0..10 {
            repo.pushed_branch(&format!("feature-{i}"), &format!("file-{i}.txt"), &format!("{i}\n"))
                .await;
        }
        let (coord, _) = repo.coordinator(repo.config());
        for i in 0..10 {
            coord
                .store
                .enqueue(&format!("feature-{i}"), "main", "tester")
                .unwrap();
        }

        let summary = run(coord.clone(), once(), CancellationToken::new()).await.unwrap();
        assert_eq!(summary.merged, 10);
        for (_, status, retries) in statuses(&coord) {
            assert_eq!(status, RequestStatus::Merged);
            assert_eq!(retries, 0);
        }
        for i in 0..10 {
            assert_eq!(
                repo.origin_file(&format!("file-{i}.txt")).await,
                Some(format!("{i}\n"))
            );
        }
        // FIFO: merge commits on origin appear in submission order.
        let subjects = repo
            .origin_git()
            .run(&["log", "--first-parent", "--reverse", "--format=%s", "main"])
            .await
            .unwrap();
        let order: Vec<&str> = subjects
            .lines()
            .filter_map(|s| s.strip_prefix("Merge branch '"))
            .filter_map(|s| s.split('\'').next())
            .collect();
        let expected: Vec<String> = (0..10).map(|i| format!("feature-{i}")).collect();
        assert_eq!(order, expected);
    }

    #[tokio::test]
    async fn same_line_edits_first_wins_second_retries() {
        let repo = TestRepo::new().await;
        repo.pushed_branch("x", "f.txt", "X\nline2\nline3\n").await;
        repo.pushed_branch("y", "f.txt", "Y\nline2\nline3\n").await;
        let (coord, notifier) = repo.coordinator(repo.config());
        let x = coord.store.enqueue("x", "main", "tester").unwrap();
        let y = coord.store.enqueue("y", "main", "tester").unwrap();

        run(coord.clone(), once(), CancellationToken::new()).await.unwrap();

        let x = coord.store.get(&x.id).unwrap();
        assert_eq!(x.status, RequestStatus::Merged);
        assert_eq!(x.retry_count, 0);
        let y = coord.store.get(&y.id).unwrap();
        match y.status {
            RequestStatus::Merged => assert!(y.retry_count >= 1),
            RequestStatus::ManualRequired => {
                assert_eq!(y.retry_count, coord.config.max_retries);
                assert!(y.reason.as_deref().unwrap_or_default().contains("f.txt"));
                assert!(notifier.messages().iter().any(|m| m.contains(&y.id)));
            }
            other => panic!("unexpected status {other}"),
        }
        assert!(y.completed_at.is_some());
    }

    #[tokio::test]
    async fn missing_branch_fails_and_others_continue() {
        let repo = TestRepo::new().await;
        repo.pushed_branch("good", "g.txt", "g\n").await;
        let (coord, notifier) = repo.coordinator(repo.config());
        let bad = coord.store.enqueue("deleted-branch", "main", "tester").unwrap();
        let good = coord.store.enqueue("good", "main", "tester").unwrap();

        let summary = run(coord.clone(), once(), CancellationToken::new()).await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.merged, 1);

        let bad = coord.store.get(&bad.id).unwrap();
        assert_eq!(bad.status, RequestStatus::Failed);
        assert!(bad.reason.unwrap().contains("deleted-branch"));
        assert_eq!(coord.store.get(&good.id).unwrap().status, RequestStatus::Merged);
        assert!(notifier.messages().iter().any(|m| m.contains("failed")));
    }

    #[tokio::test]
    async fn locked_target_is_skipped_in_once_mode() {
        let repo = TestRepo::new().await;
        repo.pushed_branch("feature", "n.txt", "n\n").await;
        let (coord, _) = repo.coordinator(repo.config());
        let req = coord.store.enqueue("feature", "main", "tester").unwrap();
        let held = coord
            .locks
            .try_acquire("main", HolderInfo::new("main", "someone-else"))
            .unwrap()
            .unwrap();

        let summary = run(coord.clone(), once(), CancellationToken::new()).await.unwrap();
        assert_eq!(summary, RunSummary::default());
        assert_eq!(coord.store.get(&req.id).unwrap().status, RequestStatus::Queued);

        drop(held);
        run(coord.clone(), once(), CancellationToken::new()).await.unwrap();
        assert_eq!(coord.store.get(&req.id).unwrap().status, RequestStatus::Merged);
    }

    #[tokio::test]
    async fn targets_run_independently() {
        let repo = TestRepo::new().await;
        let git = repo.git();
        git.run(&["push", "-q", "origin", "main:release"]).await.unwrap();
        repo.pushed_branch("a", "a.txt", "a\n").await;
        repo.pushed_branch("b", "b.txt", "b\n").await;
        let (coord, _) = repo.coordinator(repo.config());
        coord.store.enqueue("a", "main", "tester").unwrap();
        coord.store.enqueue("b", "release", "tester").unwrap();

        let summary = run(coord.clone(), once(), CancellationToken::new()).await.unwrap();
        assert_eq!(summary.merged, 2);
        let release_file = repo
            .origin_git()
            .output(&["show", "release:b.txt"])
            .await
            .unwrap();
        assert_eq!(release_file.stdout, "b\n");
        assert!(repo.origin_file("b.txt").await.is_none());
    }

    #[tokio::test]
    async fn second_processor_is_refused() {
        let repo = TestRepo::new().await;
        let (coord, _) = repo.coordinator(repo.config());
        let _held = marshal_store::try_lock_file(&coord.paths.processor_lock)
            .unwrap()
            .unwrap();
        let err = run(coord, once(), CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("already running"));
    }

    #[tokio::test]
    async fn cancelled_token_stops_loop() {
        let repo = TestRepo::new().await;
        let (coord, _) = repo.coordinator(repo.config());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let opts = RunOptions {
            once: false,
            poll_interval: Some(Duration::from_millis(10)),
        };
        let summary = run(coord.clone(), opts, cancel).await.unwrap();
        assert_eq!(summary, RunSummary::default());

        let status: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&coord.paths.runner_status_json).unwrap(),
        )
        .unwrap();
        assert_eq!(status["status"], "stopped");
        let events = std::fs::read_to_string(&coord.paths.events_jsonl).unwrap();
        assert!(events.contains("processor_start"));
        assert!(events.contains("processor_stop"));
    }

    #[tokio::test]
    async fn corrupt_queue_halts_once_mode() {
        let repo = TestRepo::new().await;
        let (coord, _) = repo.coordinator(repo.config());
        std::fs::write(&coord.paths.queue_json, "{not json").unwrap();
        let err = run(coord, once(), CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("corrupt"));
    }

    /// Snapshots the queue until `stop` fires. Returns every target seen with
    /// two MERGING requests at once, and whether any MERGING was seen at all.
    fn sample_merging(coord: Arc<Coordinator>, stop: CancellationToken) -> JoinHandle<(Vec<String>, bool)> {
        tokio::spawn(async move {
            let mut doubled = Vec::new();
            let mut saw_merging = false;
            while !stop.is_cancelled() {
                if let Ok(doc) = coord.store.snapshot() {
                    let mut targets = HashSet::new();
                    for r in doc.merging() {
                        saw_merging = true;
                        if !targets.insert(r.target.clone()) {
                            doubled.push(r.target.clone());
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            (doubled, saw_merging)
        })
    }

    async fn push_target(repo: &TestRepo, target: &str) {
        repo.git()
            .run(&["push", "-q", "origin", &format!("main:{target}")])
            .await
            .unwrap();
    }

    async fn wait_until_settled(coord: &Coordinator) {
        let deadline = Instant::now() + Duration::from_secs(60);
        loop {
            let doc = coord.store.snapshot().unwrap();
            if doc.requests.iter().all(|r| r.status.is_terminal()) {
                return;
            }
            assert!(Instant::now() < deadline, "queue did not settle: {:?}", statuses(coord));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn one_merging_request_per_target_under_load() {
        let repo = TestRepo::new().await;
        push_target(&repo, "release").await;
        push_target(&repo, "hotfix").await;
        let (coord, _) = repo.coordinator(repo.config());
        for target in ["main", "release", "hotfix"] {
            for i in 0..3 {
                let branch = format!("{target}-{i}");
                repo.pushed_branch(&branch, &format!("{branch}.txt"), "x\n").await;
                coord.store.enqueue(&branch, target, "tester").unwrap();
            }
        }

        let stop = CancellationToken::new();
        let sampler = sample_merging(coord.clone(), stop.clone());
        let summary = run(coord.clone(), once(), CancellationToken::new()).await.unwrap();
        stop.cancel();
        let (doubled, _) = sampler.await.unwrap();

        assert_eq!(summary.merged, 9);
        assert!(doubled.is_empty(), "targets with two MERGING requests: {doubled:?}");
    }

    #[tokio::test]
    async fn lost_outcome_write_holds_target_until_reconciled() {
        let repo = TestRepo::new().await;
        push_target(&repo, "release").await;
        repo.pushed_branch("a", "a.txt", "a\n").await;
        repo.pushed_branch("b", "b.txt", "b\n").await;
        repo.pushed_branch("r", "r.txt", "r\n").await;

        // The first verification swaps the queue lock file for a directory
        // for 1.5s, so the outcome write after that push fails every retry.
        let mut config = repo.config();
        let marker = repo.dir.path().join("queue-lock-broken");
        let queue_lock = MarshalPaths::new(repo.state.clone()).queue_lock;
        config.verify_cmd = Some(format!(
            "if [ ! -e '{m}' ]; then touch '{m}'; mv '{l}' '{l}.bak' && mkdir '{l}'; (sleep 1.5; rmdir '{l}'; mv '{l}.bak' '{l}') >/dev/null 2>&1 & fi",
            m = marker.display(),
            l = queue_lock.display()
        ));
        let (coord, _) = repo.coordinator(config);
        let a = coord.store.enqueue("a", "main", "tester").unwrap();
        let b = coord.store.enqueue("b", "main", "tester").unwrap();
        let r = coord.store.enqueue("r", "release", "tester").unwrap();

        let stop = CancellationToken::new();
        let sampler = sample_merging(coord.clone(), stop.clone());
        let cancel = CancellationToken::new();
        let opts = RunOptions {
            once: false,
            poll_interval: Some(Duration::from_millis(20)),
        };
        let processor = tokio::spawn(run(coord.clone(), opts, cancel.clone()));

        wait_until_settled(&coord).await;
        cancel.cancel();
        let summary = processor.await.unwrap().unwrap();
        stop.cancel();
        let (doubled, saw_merging) = sampler.await.unwrap();

        assert!(saw_merging);
        assert!(doubled.is_empty(), "targets with two MERGING requests: {doubled:?}");
        assert_eq!(summary.merged, 3);
        for id in [&a.id, &b.id, &r.id] {
            assert_eq!(coord.store.get(id).unwrap().status, RequestStatus::Merged);
        }
        let events = std::fs::read_to_string(&coord.paths.events_jsonl).unwrap();
        assert!(events.contains(r#""type":"recovered""#));

        // `b` started only after `a` was settled, so main keeps FIFO order.
        let subjects = repo
            .origin_git()
            .run(&["log", "--first-parent", "--reverse", "--format=%s", "main"])
            .await
            .unwrap();
        let merged: Vec<&str> = subjects.lines().filter(|s| s.starts_with("Merge branch")).collect();
        assert_eq!(
            merged,
            vec!["Merge branch 'a' into main", "Merge branch 'b' into main"]
        );
        assert!(coord.locks.holder("main").is_none());
    }

    #[tokio::test]
    async fn unwritable_queue_ends_once_mode_with_error() {
        let repo = TestRepo::new().await;
        repo.pushed_branch("feature", "n.txt", "n\n").await;
        let (coord, _) = repo.coordinator(repo.config());
        let req = coord.store.enqueue("feature", "main", "tester").unwrap();
        std::fs::remove_file(&coord.paths.queue_lock).unwrap();
        std::fs::create_dir(&coord.paths.queue_lock).unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(30),
            run(coord.clone(), once(), CancellationToken::new()),
        )
        .await
        .expect("once mode must terminate");
        let err = result.unwrap_err().to_string();
        assert!(err.contains("giving up"), "{err}");
        assert!(err.contains(&req.id), "{err}");
        assert_eq!(coord.store.get(&req.id).unwrap().status, RequestStatus::Queued);
        assert!(!coord.locks.is_locked("main").unwrap());
    }

    #[test]
    fn error_backoff_grows_and_caps() {
        let poll = Duration::from_millis(100);
        assert_eq!(error_backoff(poll, 1), Duration::from_millis(200));
        assert_eq!(error_backoff(poll, 3), Duration::from_millis(800));
        assert_eq!(error_backoff(poll, 30), MAX_ERROR_BACKOFF);
    }

    #[tokio::test]
    async fn merged_request_records_metrics_and_events() {
        let repo = TestRepo::new().await;
        repo.pushed_branch("feature", "n.txt", "n\n").await;
        let (coord, _) = repo.coordinator(repo.config());
        let req = coord.store.enqueue("feature", "main", "tester").unwrap();
        run(coord.clone(), once(), CancellationToken::new()).await.unwrap();

        let done = coord.store.get(&req.id).unwrap();
        assert!(done.metrics.wait_time_sec.is_some());
        assert!(done.metrics.merge_duration_sec.is_some());
        assert!(done.started_at.is_some() && done.completed_at.is_some());
        assert!(marshal_core::validate(&coord.store.snapshot().unwrap(), 3).is_empty());

        let events = std::fs::read_to_string(&coord.paths.events_jsonl).unwrap();
        for kind in ["request_start", "precheck", "request_merged", "lock_released"] {
            assert!(events.contains(kind), "missing {kind}");
        }
        // Holder metadata is gone once the lock is released.
        assert!(coord.locks.holder("main").is_none());
    }
}
