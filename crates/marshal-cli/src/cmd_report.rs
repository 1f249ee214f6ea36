use std::collections::BTreeMap;

use anyhow::{bail, Result};
use serde::Serialize;

use marshal_core::{QueueDocument, RequestStatus};

use crate::cmd_queue::format_age;
use crate::context::Workspace;

#[derive(Debug, Default, Serialize, PartialEq)]
struct Stats {
    total: usize,
    by_status: BTreeMap<&'static str, usize>,
    by_target: BTreeMap<String, BTreeMap<&'static str, usize>>,
    mean_wait_sec: Option<f64>,
    max_wait_sec: Option<u64>,
    mean_merge_sec: Option<f64>,
    max_merge_sec: Option<u64>,
    total_retries: u64,
}

fn mean(values: &[u64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<u64>() as f64 / values.len() as f64)
}

fn compute(doc: &QueueDocument) -> Stats {
    let mut stats = Stats {
        total: doc.requests.len(),
        ..Default::default()
    };
    for status in RequestStatus::ALL {
        stats.by_status.insert(status.as_str(), 0);
    }
    let mut waits = Vec::new();
    let mut merges = Vec::new();
    for req in &doc.requests {
        *stats.by_status.entry(req.status.as_str()).or_default() += 1;
        *stats
            .by_target
            .entry(req.target.clone())
            .or_default()
            .entry(req.status.as_str())
            .or_default() += 1;
        stats.total_retries += u64::from(req.retry_count);
        if let Some(w) = req.metrics.wait_time_sec {
            waits.push(w);
        }
        if let Some(d) = req.metrics.merge_duration_sec {
            merges.push(d);
        }
    }
    stats.mean_wait_sec = mean(&waits);
    stats.max_wait_sec = waits.iter().copied().max();
    stats.mean_merge_sec = mean(&merges);
    stats.max_merge_sec = merges.iter().copied().max();
    stats
}

/// `marshal stats`
pub fn stats(ws: &Workspace, json: bool) -> Result<()> {
    let stats = compute(&ws.store()?.snapshot()?);
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    println!("Requests: {}", stats.total);
    for (status, n) in &stats.by_status {
        println!("  {status:<16} {n}");
    }
    if !stats.by_target.is_empty() {
        println!("\nBy target:");
        for (target, counts) in &stats.by_target {
            let parts: Vec<String> = counts.iter().map(|(s, n)| format!("{s}={n}")).collect();
            println!("  {target}: {}", parts.join(" "));
        }
    }
    if let (Some(mean), Some(max)) = (stats.mean_wait_sec, stats.max_wait_sec) {
        println!("\nWait:  mean {}, max {}", format_age(mean.round() as u64), format_age(max));
    }
    if let (Some(mean), Some(max)) = (stats.mean_merge_sec, stats.max_merge_sec) {
        println!("Merge: mean {}, max {}", format_age(mean.round() as u64), format_age(max));
    }
    println!("Rebase retries: {}", stats.total_retries);
    Ok(())
}

/// `marshal validate`
pub fn validate(ws: &Workspace) -> Result<()> {
    let store = ws.store()?;
    let doc = store.snapshot()?;
    let issues = marshal_core::validate(&doc, store.max_retries());
    if issues.is_empty() {
        println!(
            "Queue OK ({} requests, revision {}).",
            doc.requests.len(),
            doc.revision
        );
        return Ok(());
    }
    for issue in &issues {
        println!("\u{2717} {issue}");
    }
    bail!("{} integrity issue(s) found", issues.len())
}
