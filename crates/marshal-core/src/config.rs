//! Coordinator configuration (`config.json` in the state directory).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorConfig {
    /// Remote to fetch from and push to. `null` runs against local branches
    /// only, updating `refs/heads/<target>` directly.
    #[serde(default = "default_remote")]
    pub remote: Option<String>,
    #[serde(default = "default_target")]
    pub default_target: String,
    /// Automatic rebase-retry cycles before MANUAL_REQUIRED.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_lock_timeout_sec")]
    pub lock_timeout_sec: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_expected_merge_sec")]
    pub expected_merge_sec: u64,
    /// Defaults to 10x `expected_merge_sec`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_lock_sec: Option<u64>,
    /// Defaults to 10x `expected_merge_sec`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadlock_threshold_sec: Option<u64>,
    #[serde(default = "default_deadlock_check_interval_sec")]
    pub deadlock_check_interval_sec: u64,
    #[serde(default = "default_heartbeat_interval_sec")]
    pub heartbeat_interval_sec: u64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_git_timeout_sec")]
    pub git_timeout_sec: u64,
    /// Shell command run in the merge worktree before pushing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_cmd: Option<String>,
    #[serde(default = "default_verify_timeout_sec")]
    pub verify_timeout_sec: u64,
    #[serde(default = "default_committer_name")]
    pub committer_name: String,
    #[serde(default = "default_committer_email")]
    pub committer_email: String,
}

fn default_remote() -> Option<String> {
    Some("origin".into())
}
fn default_target() -> String {
    "main".into()
}
fn default_max_retries() -> u32 {
    3
}
fn default_lock_timeout_sec() -> u64 {
    30
}
fn default_poll_interval_ms() -> u64 {
    2000
}
fn default_expected_merge_sec() -> u64 {
    60
}
fn default_deadlock_check_interval_sec() -> u64 {
    60
}
fn default_heartbeat_interval_sec() -> u64 {
    5
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_git_timeout_sec() -> u64 {
    300
}
fn default_verify_timeout_sec() -> u64 {
    600
}
fn default_committer_name() -> String {
    "Marshal".into()
}
fn default_committer_email() -> String {
    "marshal@localhost".into()
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            remote: default_remote(),
            default_target: default_target(),
            max_retries: default_max_retries(),
            lock_timeout_sec: default_lock_timeout_sec(),
            poll_interval_ms: default_poll_interval_ms(),
            expected_merge_sec: default_expected_merge_sec(),
            stale_lock_sec: None,
            deadlock_threshold_sec: None,
            deadlock_check_interval_sec: default_deadlock_check_interval_sec(),
            heartbeat_interval_sec: default_heartbeat_interval_sec(),
            retry_backoff_ms: default_retry_backoff_ms(),
            git_timeout_sec: default_git_timeout_sec(),
            verify_cmd: None,
            verify_timeout_sec: default_verify_timeout_sec(),
            committer_name: default_committer_name(),
            committer_email: default_committer_email(),
        }
    }
}

impl CoordinatorConfig {
    /// Load from `path`; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let map = read_map(path)?;
        Self::from_map(path, map)
    }

    fn from_map(
        path: &Path,
        map: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_value(serde_json::Value::Object(map)).map_err(
            |source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
        )?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_target.trim().is_empty() {
            return Err(ConfigError::Invalid("default_target is empty".into()));
        }
        if matches!(&self.remote, Some(r) if r.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "remote is empty (use null for local-only mode)".into(),
            ));
        }
        for (key, v) in [
            ("lock_timeout_sec", self.lock_timeout_sec),
            ("poll_interval_ms", self.poll_interval_ms),
            ("expected_merge_sec", self.expected_merge_sec),
            ("heartbeat_interval_sec", self.heartbeat_interval_sec),
            ("git_timeout_sec", self.git_timeout_sec),
            ("verify_timeout_sec", self.verify_timeout_sec),
        ] {
            if v == 0 {
                return Err(ConfigError::Invalid(format!("{key} must be > 0")));
            }
        }
        if self.stale_lock_age() <= self.heartbeat_interval() {
            return Err(ConfigError::Invalid(
                "stale_lock_sec must exceed heartbeat_interval_sec".into(),
            ));
        }
        Ok(())
    }

    /// Value of one key as JSON, including defaults.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        match key {
            "stale_lock_sec" => Some(self.stale_lock_age().as_secs().into()),
            "deadlock_threshold_sec" => Some(self.deadlock_threshold().as_secs().into()),
            "verify_cmd" => Some(self.verify_cmd.clone().into()),
            _ => serde_json::to_value(self).ok()?.get(key).cloned(),
        }
    }

    pub const KEYS: &'static [&'static str] = &[
        "remote",
        "default_target",
        "max_retries",
        "lock_timeout_sec",
        "poll_interval_ms",
        "expected_merge_sec",
        "stale_lock_sec",
        "deadlock_threshold_sec",
        "deadlock_check_interval_sec",
        "heartbeat_interval_sec",
        "retry_backoff_ms",
        "git_timeout_sec",
        "verify_cmd",
        "verify_timeout_sec",
        "committer_name",
        "committer_email",
    ];

    pub fn remote(&self) -> Option<&str> {
        self.remote.as_deref()
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_sec)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stale_lock_age(&self) -> Duration {
        Duration::from_secs(
            self.stale_lock_sec
                .unwrap_or(self.expected_merge_sec.saturating_mul(10)),
        )
    }

    pub fn deadlock_threshold(&self) -> Duration {
        Duration::from_secs(
            self.deadlock_threshold_sec
                .unwrap_or(self.expected_merge_sec.saturating_mul(10)),
        )
    }

    pub fn deadlock_check_interval(&self) -> Duration {
        Duration::from_secs(self.deadlock_check_interval_sec)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_sec)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_sec)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_sec)
    }
}

/// Set one key in `config.json`. The result must still deserialize and
/// validate as a [`CoordinatorConfig`], otherwise nothing is written.
pub fn set_key(path: &Path, key: &str, value: &str) -> Result<CoordinatorConfig, ConfigError> {
    let mut map = read_map(path)?;
    map.insert(key.to_string(), parse_value(value));
    let config = CoordinatorConfig::from_map(path, map.clone())?;
    let json = serde_json::to_vec_pretty(&map).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    marshal_store::write_atomic(path, &json)?;
    Ok(config)
}

fn read_map(path: &Path) -> Result<serde_json::Map<String, serde_json::Value>, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(serde_json::Map::new()),
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let value: serde_json::Value =
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err(ConfigError::Invalid(format!(
            "{} must contain a JSON object",
            path.display()
        ))),
    }
}

/// Parse a CLI string into JSON (null/bool/number/string).
fn parse_value(s: &str) -> serde_json::Value {
    match s {
        "null" => serde_json::Value::Null,
        "true" => serde_json::Value::Bool(true),
        "false" => serde_json::Value::Bool(false),
        _ => match s.parse::<u64>() {
            Ok(n) => serde_json::Value::Number(n.into()),
            Err(_) => serde_json::Value::String(s.to_string()),
        },
    }
}
