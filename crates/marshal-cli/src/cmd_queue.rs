use anyhow::Result;

use marshal_core::{ConflictVerdict, MergeRequest, QueueFilter, RequestStatus};

use crate::context::{default_submitter, Workspace};

/// `marshal enqueue <branch>`
pub fn enqueue(
    ws: &Workspace,
    branch: &str,
    target: Option<&str>,
    submitter: Option<&str>,
    json: bool,
) -> Result<()> {
    let config = ws.config()?;
    let store = ws.store()?;
    let target = target.unwrap_or(&config.default_target);
    let submitter = submitter
        .map(str::to_string)
        .unwrap_or_else(default_submitter);
    let req = store.enqueue(branch, target, &submitter)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&req)?);
    } else {
        let position = store
            .snapshot()?
            .requests
            .iter()
            .filter(|r| r.target == req.target && r.status == RequestStatus::Queued)
            .position(|r| r.id == req.id)
            .map(|p| p + 1)
            .unwrap_or(1);
        println!(
            "Enqueued {} ({} -> {}), position {position}",
            req.id, req.branch, req.target
        );
    }
    Ok(())
}

/// `marshal status`
pub fn status(ws: &Workspace, filter: &QueueFilter, json: bool) -> Result<()> {
    let requests = ws.store()?.list(filter)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&requests)?);
        return Ok(());
    }
    if requests.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }
    for req in &requests {
        println!("{}", status_line(req));
    }
    Ok(())
}

fn status_icon(status: RequestStatus) -> &'static str {
    match status {
        RequestStatus::Queued => "\u{25CB}",         // ○
        RequestStatus::Merging => "\u{25B6}",        // ▶
        RequestStatus::Merged => "\u{2713}",         // ✓
        RequestStatus::Failed => "\u{2717}",         // ✗
        RequestStatus::ManualRequired => "\u{26A0}", // ⚠
    }
}

fn status_line(req: &MergeRequest) -> String {
    let detail = match req.status {
        RequestStatus::Queued => {
            let mut d = format!("waiting {}", format_age(req.wait_time_sec()));
            if req.conflict_check.verdict == ConflictVerdict::Conflict {
                d.push_str(", precheck: conflict");
            }
            d
        }
        RequestStatus::Merging => match req.merging_for_sec() {
            Some(s) => format!("merging {}, retries {}", format_age(s), req.retry_count),
            None => format!("retries {}", req.retry_count),
        },
        RequestStatus::Merged => match req.merge_commit.as_deref() {
            Some(c) => format!("{}, retries {}", short_sha(c), req.retry_count),
            None => format!("retries {}", req.retry_count),
        },
        RequestStatus::Failed | RequestStatus::ManualRequired => {
            req.reason.clone().unwrap_or_else(|| "no reason recorded".into())
        }
    };
    format!(
        "{} {:<30} {:<16} {} -> {}  [{}]  {detail}",
        status_icon(req.status),
        req.id,
        req.status.as_str(),
        req.branch,
        req.target,
        req.submitter,
    )
}

/// `marshal show <id>`
pub fn show(ws: &Workspace, id: &str, json: bool) -> Result<()> {
    let req = ws.store()?.get(id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&req)?);
        return Ok(());
    }
    println!("{} {} ({})", status_icon(req.status), req.id, req.status);
    println!("  Branch:     {} -> {}", req.branch, req.target);
    println!("  Submitter:  {}", req.submitter);
    println!("  Submitted:  {}", req.submitted_at);
    if let Some(t) = &req.started_at {
        println!("  Started:    {t}");
    }
    if let Some(t) = &req.completed_at {
        println!("  Completed:  {t}");
    }
    println!("  Retries:    {}", req.retry_count);
    if req.recoveries > 0 {
        println!("  Recovered:  {} time(s) after an interrupted run", req.recoveries);
    }
    let check = &req.conflict_check;
    match check.verdict {
        ConflictVerdict::Clean => println!("  Precheck:   clean"),
        ConflictVerdict::Conflict => println!("  Precheck:   conflict in {}", check.paths.join(", ")),
        ConflictVerdict::Unknown => match &check.detail {
            Some(d) => println!("  Precheck:   unknown ({d})"),
            None => println!("  Precheck:   not run"),
        },
    }
    if let Some(sha) = &req.source_sha {
        println!("  Source:     {sha}");
    }
    if let Some(c) = &req.merge_commit {
        println!("  Merge:      {c}");
    }
    if let Some(r) = &req.reason {
        println!("  Reason:     {r}");
    }
    if let Some(from) = &req.requeued_from {
        println!("  Requeued from {from}");
    }
    if let Some(w) = req.metrics.wait_time_sec {
        println!("  Waited:     {}", format_age(w));
    }
    if let Some(d) = req.metrics.merge_duration_sec {
        println!("  Merge took: {}", format_age(d));
    }
    Ok(())
}

/// `marshal cancel <id>`
pub fn cancel(ws: &Workspace, id: &str, reason: Option<&str>) -> Result<()> {
    let req = ws.store()?.cancel(id, reason.unwrap_or_default())?;
    println!(
        "Cancelled {} ({} -> {}): {}",
        req.id,
        req.branch,
        req.target,
        req.reason.unwrap_or_default()
    );
    Ok(())
}

/// `marshal requeue <id>`
pub fn requeue(ws: &Workspace, id: &str, submitter: Option<&str>) -> Result<()> {
    let submitter = submitter
        .map(str::to_string)
        .unwrap_or_else(default_submitter);
    let req = ws.store()?.requeue(id, &submitter)?;
    println!("Requeued {id} as {} ({} -> {})", req.id, req.branch, req.target);
    Ok(())
}

fn short_sha(sha: &str) -> &str {
    sha.get(..10).unwrap_or(sha)
}

pub(crate) fn format_age(secs: u64) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        let h = secs / 3600;
        let m = (secs % 3600) / 60;
        if m == 0 {
            format!("{h}h")
        } else {
            format!("{h}h{m}m")
        }
    }
}
