//! Conflict prechecker.
//!
//! Simulates the merge with `git merge-tree --write-tree`, which computes the
//! merged tree in the object database without touching any working tree,
//! index or ref.

use marshal_core::{ConflictCheck, MergeRequest};
use thiserror::Error;

use crate::git::{Git, GitError};

#[derive(Debug, Error)]
pub enum PrecheckError {
    #[error("target branch `{0}` not found")]
    MissingTarget(String),

    #[error("source branch `{0}` not found")]
    MissingSource(String),

    #[error(transparent)]
    Git(#[from] GitError),
}

impl PrecheckError {
    /// Missing refs fail the request outright; there is nothing to retry.
    pub fn is_missing_ref(&self) -> bool {
        matches!(
            self,
            PrecheckError::MissingTarget(_) | PrecheckError::MissingSource(_)
        )
    }
}

/// Resolved commits for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refs {
    pub tip: String,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Source is already contained in the target.
    AlreadyMerged,
    Clean,
    Conflict {
        paths: Vec<String>,
        messages: Vec<String>,
    },
    /// merge-tree could not classify the merge (e.g. unsupported git).
    Unknown(String),
}

impl Verdict {
    pub fn to_check(&self, tip: &str) -> ConflictCheck {
        match self {
            Verdict::AlreadyMerged | Verdict::Clean => ConflictCheck::clean(tip),
            Verdict::Conflict { paths, .. } => ConflictCheck::conflict(tip, paths.clone()),
            Verdict::Unknown(detail) => {
                let mut check = ConflictCheck::unknown(detail.clone());
                check.target_tip = Some(tip.to_string());
                check
            }
        }
    }
}

/// The ref holding the latest target tip.
pub fn target_ref(remote: Option<&str>, target: &str) -> String {
    match remote {
        Some(remote) => format!("refs/remotes/{remote}/{target}"),
        None => format!("refs/heads/{target}"),
    }
}

/// Resolve target tip and source commit. The source is looked up on the
/// remote first, then as a local branch.
pub async fn resolve_refs(
    git: &Git,
    remote: Option<&str>,
    req: &MergeRequest,
) -> Result<Refs, PrecheckError> {
    let tip = git
        .rev_parse(&target_ref(remote, &req.target))
        .await?
        .ok_or_else(|| PrecheckError::MissingTarget(req.target.clone()))?;

    let mut candidates = Vec::new();
    if let Some(remote) = remote {
        candidates.push(format!("refs/remotes/{remote}/{}", req.branch));
    }
    candidates.push(format!("refs/heads/{}", req.branch));
    for candidate in candidates {
        if let Some(source) = git.rev_parse(&candidate).await? {
            return Ok(Refs { tip, source });
        }
    }
    Err(PrecheckError::MissingSource(req.branch.clone()))
}

/// Classify merging `source` into `tip`. Never mutates the repository
/// beyond writing unreachable objects.
pub async fn check(git: &Git, tip: &str, source: &str) -> Result<Verdict, GitError> {
    if git.is_ancestor(source, tip).await? {
        return Ok(Verdict::AlreadyMerged);
    }
    let out = git
        .output(&[
            "merge-tree",
            "--write-tree",
            "--name-only",
            "--messages",
            tip,
            source,
        ])
        .await?;
    match out.code {
        0 => Ok(Verdict::Clean),
        1 => {
            let parsed = parse_merge_tree_output(&out.stdout);
            if parsed.conflicted_paths.is_empty() && parsed.messages.is_empty() {
                return Ok(Verdict::Unknown(out.detail()));
            }
            Ok(Verdict::Conflict {
                paths: parsed.conflicted_paths,
                messages: parsed.messages,
            })
        }
        _ => Ok(Verdict::Unknown(out.detail())),
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct MergeTreeOutput {
    tree: Option<String>,
    conflicted_paths: Vec<String>,
    messages: Vec<String>,
}

fn is_hex_id(value: &str) -> bool {
    value.len() >= 40 && value.chars().all(|c| c.is_ascii_hexdigit())
}

/// Output layout: tree id, then one conflicted path per line, a blank
/// line, then informational messages.
fn parse_merge_tree_output(raw: &str) -> MergeTreeOutput {
    let mut out = MergeTreeOutput::default();
    let mut lines = raw.lines();
    if let Some(first) = lines.next() {
        if is_hex_id(first.trim()) {
            out.tree = Some(first.trim().to_string());
        }
    }
    let mut in_messages = false;
    for line in lines {
        if line.trim().is_empty() {
            in_messages = true;
            continue;
        }
        if in_messages {
            out.messages.push(line.trim().to_string());
        } else if !out.conflicted_paths.iter().any(|p| p == line) {
            out.conflicted_paths.push(line.to_string());
        }
    }
    // Older output without a path section: recover paths from messages.
    if out.conflicted_paths.is_empty() {
        for msg in &out.messages {
            if let Some(path) = conflict_path(msg) {
                if !out.conflicted_paths.contains(&path) {
                    out.conflicted_paths.push(path);
                }
            }
        }
    }
    out
}

/// Path named by a `CONFLICT (<kind>): ...` message.
fn conflict_path(line: &str) -> Option<String> {
    let rest = line.strip_prefix("CONFLICT (")?;
    let (_, message) = rest.split_once("): ")?;
    message
        .strip_prefix("Merge conflict in ")
        .map(|p| p.trim().to_string())
        .or_else(|| {
            message
                .split_once(" deleted in ")
                .map(|(p, _)| p.trim().to_string())
        })
        .filter(|p| !p.is_empty())
}
