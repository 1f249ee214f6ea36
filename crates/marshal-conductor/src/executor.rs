//! Merge executor.
//!
//! Runs with the target lock held and the request in MERGING. All git work
//! happens on a detached HEAD in `worktrees/<target>`; the only ref it ever
//! moves is the target branch itself (push, or `update-ref` CAS in local
//! mode).

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::process::Command;

use marshal_core::{MergeRequest, RequestStatus, RequestUpdate};

use crate::coordinator::Coordinator;
use crate::event_log::Event;
use crate::git::{is_push_race, mask_secrets, truncate_detail, Git, GitError};
use crate::precheck::{self, Verdict};

/// Trailer tying a merge commit on the target back to its request.
pub const REQUEST_TRAILER: &str = "Marshal-Request";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged {
        merge_commit: String,
        source_sha: String,
        /// Source was already contained in the target.
        noop: bool,
    },
    ManualRequired {
        reason: String,
    },
    Failed {
        reason: String,
    },
    /// The request left MERGING underneath us (operator cancel).
    Cancelled,
}

enum Publish {
    Done(String),
    Conflict(String),
    Race(String),
    VerifyFailed(String),
    Cancelled,
}

/// Drive one request to an outcome. Errors are unexpected failures; the
/// caller records them as FAILED.
pub async fn execute(coord: &Coordinator, req: &MergeRequest) -> Result<MergeOutcome> {
    let max = coord.config.max_retries;
    let mut retry_count = req.retry_count;
    let mut rebased: Option<String> = None;
    let mut worktree: Option<Git> = None;

    loop {
        if !still_merging(coord, &req.id)? {
            return Ok(MergeOutcome::Cancelled);
        }
        coord.fetch(&req.id).await?;
        let refs = match precheck::resolve_refs(&coord.git, coord.remote(), req).await {
            Ok(refs) => refs,
            Err(e) if e.is_missing_ref() => {
                return Ok(MergeOutcome::Failed {
                    reason: e.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let source = rebased.clone().unwrap_or(refs.source);

        // Check-then-act is repeated under the lock.
        let verdict = precheck::check(&coord.git, &refs.tip, &source).await?;
        let recorded = coord.store.update(
            &req.id,
            RequestStatus::Merging,
            RequestUpdate {
                conflict_check: Some(verdict.to_check(&refs.tip)),
                source_sha: Some(source.clone()),
                ..Default::default()
            },
        )?;
        if !recorded {
            return Ok(MergeOutcome::Cancelled);
        }
        record_precheck(coord, &req.id, &verdict);

        let cause = match verdict {
            Verdict::AlreadyMerged => {
                tracing::info!(request_id = %req.id, "source already contained in target");
                return Ok(MergeOutcome::Merged {
                    merge_commit: refs.tip,
                    source_sha: source,
                    noop: true,
                });
            }
            Verdict::Conflict { paths, .. } => format!("conflict in {}", paths.join(", ")),
            Verdict::Clean | Verdict::Unknown(_) => {
                let wt = match &worktree {
                    Some(wt) => wt.clone(),
                    None => {
                        let wt = prepare_worktree(coord, &req.target, &req.id, &refs.tip).await?;
                        worktree = Some(wt.clone());
                        wt
                    }
                };
                match merge_and_publish(coord, &wt, req, &refs.tip, &source).await? {
                    Publish::Done(merge_commit) => {
                        return Ok(MergeOutcome::Merged {
                            merge_commit,
                            source_sha: source,
                            noop: false,
                        })
                    }
                    Publish::VerifyFailed(detail) => {
                        return Ok(MergeOutcome::ManualRequired {
                            reason: format!("verification failed: {detail}"),
                        })
                    }
                    Publish::Cancelled => return Ok(MergeOutcome::Cancelled),
                    Publish::Conflict(detail) => format!("merge conflict: {detail}"),
                    Publish::Race(detail) => format!("push rejected, target moved: {detail}"),
                }
            }
        };

        if retry_count >= max {
            return Ok(MergeOutcome::ManualRequired {
                reason: format!("{cause} (gave up after {retry_count} rebase retries)"),
            });
        }
        retry_count += 1;
        if !coord.store.update(
            &req.id,
            RequestStatus::Merging,
            RequestUpdate::retry_count(retry_count),
        )? {
            return Ok(MergeOutcome::Cancelled);
        }
        tracing::info!(request_id = %req.id, retry_count, %cause, "rebase retry");
        coord.events.record(Event::RetryScheduled {
            request_id: req.id.clone(),
            retry_count,
            cause: cause.clone(),
        });
        tokio::time::sleep(coord.config.retry_backoff() * retry_count).await;

        coord.fetch(&req.id).await?;
        let target_ref = precheck::target_ref(coord.remote(), &req.target);
        let Some(tip) = coord.git.rev_parse(&target_ref).await? else {
            return Ok(MergeOutcome::Failed {
                reason: format!("target branch `{}` disappeared", req.target),
            });
        };
        let wt = match &worktree {
            Some(wt) => wt.clone(),
            None => {
                let wt = prepare_worktree(coord, &req.target, &req.id, &tip).await?;
                worktree = Some(wt.clone());
                wt
            }
        };
        match rebase(&wt, &source, &tip).await? {
            Some(new_source) => {
                tracing::debug!(request_id = %req.id, %new_source, "rebased onto target tip");
                rebased = Some(new_source);
            }
            None => {
                tracing::info!(request_id = %req.id, "rebase hit conflicts");
            }
        }
    }
}

fn still_merging(coord: &Coordinator, id: &str) -> Result<bool> {
    Ok(coord.store.get(id)?.status == RequestStatus::Merging)
}

fn record_precheck(coord: &Coordinator, id: &str, verdict: &Verdict) {
    let (name, paths) = match verdict {
        Verdict::AlreadyMerged => ("already_merged", Vec::new()),
        Verdict::Clean => ("clean", Vec::new()),
        Verdict::Conflict { paths, .. } => ("conflict", paths.clone()),
        Verdict::Unknown(_) => ("unknown", Vec::new()),
    };
    tracing::debug!(request_id = id, verdict = name, "precheck");
    coord.events.record(Event::Precheck {
        request_id: id.to_string(),
        verdict: name.to_string(),
        paths,
    });
}

fn merge_message(req: &MergeRequest) -> String {
    format!(
        "Merge branch '{}' into {}\n\n{REQUEST_TRAILER}: {}\nSubmitted-By: {}",
        req.branch, req.target, req.id, req.submitter
    )
}

async fn merge_and_publish(
    coord: &Coordinator,
    wt: &Git,
    req: &MergeRequest,
    tip: &str,
    source: &str,
) -> Result<Publish> {
    reset_worktree(wt).await?;
    wt.run(&["checkout", "-q", "--force", "--detach", tip]).await?;

    let merger = wt
        .clone()
        .with_author(&coord.config.committer_name, &coord.config.committer_email);
    let message = merge_message(req);
    let out = merger
        .output(&["merge", "--no-ff", "--no-edit", "-m", &message, source])
        .await?;
    if !out.success() {
        let unmerged = wt
            .output(&["diff", "--name-only", "--diff-filter=U"])
            .await?
            .stdout;
        let abort = wt.output(&["merge", "--abort"]).await?;
        if !abort.success() {
            tracing::warn!(detail = %abort.detail(), "merge --abort failed");
        }
        let paths: Vec<&str> = unmerged.lines().filter(|l| !l.is_empty()).collect();
        if !paths.is_empty() {
            return Ok(Publish::Conflict(paths.join(", ")));
        }
        return Err(GitError::Failed {
            args: format!("merge --no-ff {source}"),
            code: out.code,
            stderr: out.detail(),
        }
        .into());
    }
    let merge_commit = wt.run(&["rev-parse", "HEAD"]).await?;

    if let Some(cmd) = &coord.config.verify_cmd {
        let started = Instant::now();
        if let Err(detail) = verify(cmd, wt.cwd(), coord.config.verify_timeout()).await {
            tracing::warn!(request_id = %req.id, %detail, "verification failed");
            return Ok(Publish::VerifyFailed(detail));
        }
        tracing::debug!(request_id = %req.id, elapsed_ms = started.elapsed().as_millis() as u64, "verification passed");
    }

    // Last chance to notice a cancel before anything becomes visible.
    if !still_merging(coord, &req.id)? {
        return Ok(Publish::Cancelled);
    }
    publish(coord, wt, &req.target, tip, &merge_commit).await
}

/// Move the target to `commit`, expecting it to still be at `tip`.
async fn publish(
    coord: &Coordinator,
    wt: &Git,
    target: &str,
    tip: &str,
    commit: &str,
) -> Result<Publish> {
    let dest = format!("refs/heads/{target}");
    match coord.remote() {
        Some(remote) => {
            let refspec = format!("{commit}:{dest}");
            let out = wt.output(&["push", remote, &refspec]).await?;
            if out.success() {
                return Ok(Publish::Done(commit.to_string()));
            }
            if is_push_race(&out.stderr) {
                return Ok(Publish::Race(out.detail()));
            }
            Err(GitError::Failed {
                args: format!("push {remote} {refspec}"),
                code: out.code,
                stderr: out.detail(),
            }
            .into())
        }
        None => {
            let out = wt
                .output(&["update-ref", "-m", "marshal merge", &dest, commit, tip])
                .await?;
            if out.success() {
                return Ok(Publish::Done(commit.to_string()));
            }
            // CAS miss: someone else moved the branch.
            if wt.rev_parse(&dest).await?.as_deref() != Some(tip) {
                return Ok(Publish::Race(out.detail()));
            }
            Err(GitError::Failed {
                args: format!("update-ref {dest}"),
                code: out.code,
                stderr: out.detail(),
            }
            .into())
        }
    }
}

/// Rebase `source` onto `tip` on a detached HEAD. `None` when the rebase
/// conflicted (and was aborted).
async fn rebase(wt: &Git, source: &str, tip: &str) -> Result<Option<String>> {
    reset_worktree(wt).await?;
    wt.run(&["checkout", "-q", "--force", "--detach", source]).await?;
    let out = wt.output(&["rebase", "-q", tip]).await?;
    if out.success() {
        return Ok(Some(wt.run(&["rev-parse", "HEAD"]).await?));
    }
    let abort = wt.output(&["rebase", "--abort"]).await?;
    if !abort.success() {
        tracing::warn!(detail = %abort.detail(), "rebase --abort failed");
    }
    Ok(None)
}

/// Per-target scratch worktree, created on first use.
async fn prepare_worktree(coord: &Coordinator, target: &str, holder: &str, tip: &str) -> Result<Git> {
    let dir = coord.paths.worktree_dir(target);
    let wt = coord.git.in_dir(&dir);
    if dir.join(".git").exists() && wt.output(&["rev-parse", "--git-dir"]).await?.success() {
        return Ok(wt);
    }

    let _repo = coord.repo_lock(holder).await?;
    if dir.exists() {
        std::fs::remove_dir_all(&dir)
            .with_context(|| format!("removing broken worktree {}", dir.display()))?;
    }
    coord.git.run(&["worktree", "prune"]).await?;
    let dir_str = dir
        .to_str()
        .with_context(|| format!("non UTF-8 worktree path {}", dir.display()))?;
    coord
        .git
        .run(&["worktree", "add", "-q", "--force", "--detach", dir_str, tip])
        .await?;
    tracing::info!(target, path = %dir.display(), "created merge worktree");
    Ok(wt)
}

/// Git operations left half-done in a worktree's git directory.
pub fn in_progress_operations(git_dir: &Path) -> Vec<&'static str> {
    [
        ("rebase-merge", "rebase"),
        ("rebase-apply", "rebase"),
        ("MERGE_HEAD", "merge"),
        ("CHERRY_PICK_HEAD", "cherry-pick"),
        ("index.lock", "index lock"),
    ]
    .into_iter()
    .filter(|(marker, _)| git_dir.join(marker).exists())
    .map(|(_, op)| op)
    .collect()
}

/// Abort leftovers from an interrupted run and discard local changes.
async fn reset_worktree(wt: &Git) -> Result<()> {
    let git_dir = wt.git_dir().await?;
    let ops = in_progress_operations(&git_dir);
    if ops.contains(&"rebase") {
        let _ = wt.output(&["rebase", "--abort"]).await?;
    }
    if ops.contains(&"merge") {
        let _ = wt.output(&["merge", "--abort"]).await?;
    }
    wt.run(&["reset", "-q", "--hard"]).await?;
    wt.run(&["clean", "-q", "-fdx"]).await?;
    Ok(())
}

/// Run the verification command in the merge worktree.
async fn verify(cmd: &str, cwd: &Path, timeout: Duration) -> std::result::Result<(), String> {
    #[cfg(not(windows))]
    let (shell, flag) = ("sh", "-c");
    #[cfg(windows)]
    let (shell, flag) = ("cmd", "/C");

    let result = Command::new(shell)
        .args([flag, cmd])
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(timeout, result).await {
        Ok(Ok(output)) if output.status.success() => Ok(()),
        Ok(Ok(output)) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!(
                "exit {}: {}",
                output.status.code().unwrap_or(-1),
                truncate_detail(mask_secrets(&stderr).trim())
            ))
        }
        Ok(Err(e)) => Err(format!("spawn error: {e}")),
        Err(_) => Err(format!(
            "command timed out after {}s: {cmd}",
            timeout.as_secs()
        )),
    }
}
