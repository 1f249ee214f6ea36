//! Async `git` subprocess runner.
//!
//! Every call is bounded by a timeout and killed on drop. Output is parsed in
//! the C locale so conflict and push-rejection messages are stable.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tokio::process::Command;

const MAX_DETAIL: usize = 2000;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git {args} timed out after {}s", timeout.as_secs())]
    Timeout { args: String, timeout: Duration },

    #[error("failed to run git {args}: {source}")]
    Spawn {
        args: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {args} failed (exit {code}): {stderr}")]
    Failed {
        args: String,
        code: i32,
        stderr: String,
    },
}

#[derive(Debug, Clone)]
pub struct GitOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Masked, truncated stderr (falling back to stdout) for reasons and logs.
    pub fn detail(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        truncate_detail(&mask_secrets(text.trim()))
    }
}

/// A git invocation context: working directory, timeout and extra env.
#[derive(Debug, Clone)]
pub struct Git {
    cwd: PathBuf,
    timeout: Duration,
    envs: Vec<(String, String)>,
}

impl Git {
    pub fn new(cwd: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            cwd: cwd.into(),
            timeout,
            envs: Vec::new(),
        }
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Same settings, different working directory.
    pub fn in_dir(&self, cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            ..self.clone()
        }
    }

    /// Commits created through this runner are committed as `name <email>`.
    pub fn with_committer(mut self, name: &str, email: &str) -> Self {
        self.envs.push(("GIT_COMMITTER_NAME".into(), name.into()));
        self.envs.push(("GIT_COMMITTER_EMAIL".into(), email.into()));
        self
    }

    /// Also author new commits as `name <email>` (merge commits only).
    pub fn with_author(mut self, name: &str, email: &str) -> Self {
        self.envs.push(("GIT_AUTHOR_NAME".into(), name.into()));
        self.envs.push(("GIT_AUTHOR_EMAIL".into(), email.into()));
        self
    }

    /// Run git and return its output whatever the exit code.
    pub async fn output(&self, args: &[&str]) -> Result<GitOutput, GitError> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("LC_ALL", "C")
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::trace!(cwd = %self.cwd.display(), args = %args.join(" "), "git");
        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(GitError::Spawn {
                    args: args.join(" "),
                    source,
                })
            }
            Err(_) => {
                return Err(GitError::Timeout {
                    args: args.join(" "),
                    timeout: self.timeout,
                })
            }
        };
        Ok(GitOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run git, failing on non-zero exit. Returns trimmed stdout.
    pub async fn run(&self, args: &[&str]) -> Result<String, GitError> {
        let out = self.output(args).await?;
        if !out.success() {
            return Err(GitError::Failed {
                args: args.join(" "),
                code: out.code,
                stderr: out.detail(),
            });
        }
        Ok(out.stdout.trim().to_string())
    }

    /// Resolve `rev` to a commit sha; `None` if it does not exist.
    pub async fn rev_parse(&self, rev: &str) -> Result<Option<String>, GitError> {
        let spec = format!("{rev}^{{commit}}");
        let out = self
            .output(&["rev-parse", "--verify", "--quiet", &spec])
            .await?;
        match out.code {
            0 => Ok(Some(out.stdout.trim().to_string())),
            1 => Ok(None),
            code => Err(GitError::Failed {
                args: format!("rev-parse --verify {spec}"),
                code,
                stderr: out.detail(),
            }),
        }
    }

    /// `merge-base --is-ancestor`: exit 0 yes, exit 1 no, anything else fails.
    pub async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, GitError> {
        let out = self
            .output(&["merge-base", "--is-ancestor", ancestor, descendant])
            .await?;
        match out.code {
            0 => Ok(true),
            1 => Ok(false),
            code => Err(GitError::Failed {
                args: format!("merge-base --is-ancestor {ancestor} {descendant}"),
                code,
                stderr: out.detail(),
            }),
        }
    }

    /// Absolute path of the shared `.git` directory (same for every worktree).
    pub async fn common_dir(&self) -> Result<PathBuf, GitError> {
        let dir = self
            .run(&["rev-parse", "--path-format=absolute", "--git-common-dir"])
            .await?;
        Ok(PathBuf::from(dir))
    }

    /// Absolute path of this worktree's private git directory.
    pub async fn git_dir(&self) -> Result<PathBuf, GitError> {
        let dir = self
            .run(&["rev-parse", "--path-format=absolute", "--git-dir"])
            .await?;
        Ok(PathBuf::from(dir))
    }
}

/// Whether a push failure means the remote moved underneath us.
pub fn is_push_race(stderr: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\[rejected\]|non-fast-forward|fetch first|stale info|cannot lock ref").ok()
    })
    .as_ref()
    .is_some_and(|re| re.is_match(stderr))
}

/// Mask credentials before output is stored in the queue or logs.
pub fn mask_secrets(text: &str) -> String {
    let patterns = [
        // credentials embedded in remote URLs
        (r"(https?://)[^/\s:@]+(:[^/\s@]*)?@", "${1}[MASKED]@"),
        (r"gh[pousr]_[A-Za-z0-9]{20,}", "[MASKED]"),
        (r"sk-[a-zA-Z0-9]{20,}", "[MASKED]"),
        (r"Bearer\s+[a-zA-Z0-9._\-]+", "Bearer [MASKED]"),
        (
            r"(?i)(password|secret|token|key|api_key|apikey)=[^\s&]+",
            "$1=[MASKED]",
        ),
    ];

    let mut result = text.to_string();
    for (pattern, replacement) in patterns {
        if let Ok(re) = Regex::new(pattern) {
            result = re.replace_all(&result, replacement).into_owned();
        }
    }
    result
}

/// Cut `text` to at most `MAX_DETAIL` bytes on a char boundary.
pub fn truncate_detail(text: &str) -> String {
    if text.len() <= MAX_DETAIL {
        return text.to_string();
    }
    let mut end = MAX_DETAIL;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
