use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};

use marshal_conductor::{default_state_dir, Coordinator, StderrNotifier};
use marshal_core::{CoordinatorConfig, QueueStore};
use marshal_store::MarshalPaths;

/// Where this invocation operates: the repository and its state directory.
pub struct Workspace {
    pub repo_root: PathBuf,
    pub paths: MarshalPaths,
}

impl Workspace {
    /// `--state-dir`, else `MARSHAL_DIR`, else `<git-common-dir>/marshal`.
    pub async fn resolve(repo_root: &Path, state_dir: Option<PathBuf>) -> Result<Self> {
        let state_dir = match state_dir.or_else(|| std::env::var_os("MARSHAL_DIR").map(PathBuf::from)) {
            Some(dir) if dir.is_relative() => repo_root.join(dir),
            Some(dir) => dir,
            None => default_state_dir(repo_root).await?,
        };
        Ok(Self {
            repo_root: repo_root.to_path_buf(),
            paths: MarshalPaths::new(state_dir),
        })
    }

    pub fn config(&self) -> Result<CoordinatorConfig> {
        let config = CoordinatorConfig::load(&self.paths.config_json)?;
        config.validate()?;
        Ok(config)
    }

    /// Queue access without git; enough for every read-only command.
    pub fn store(&self) -> Result<QueueStore> {
        let config = self.config()?;
        QueueStore::open(self.paths.clone(), config.max_retries)
            .with_context(|| format!("opening queue in {}", self.paths.state_dir.display()))
    }

    pub fn coordinator(&self) -> Result<Arc<Coordinator>> {
        let coord = Coordinator::open(
            &self.repo_root,
            &self.paths.state_dir,
            self.config()?,
            Arc::new(StderrNotifier),
        )?;
        Ok(Arc::new(coord))
    }
}

/// `MARSHAL_SUBMITTER`, else `<user>@<host>`.
pub fn default_submitter() -> String {
    submitter_from(|key| std::env::var(key).ok())
}

fn submitter_from(env: impl Fn(&str) -> Option<String>) -> String {
    let non_empty = |key: &str| env(key).filter(|v| !v.trim().is_empty());
    if let Some(s) = non_empty("MARSHAL_SUBMITTER") {
        return s;
    }
    let user = non_empty("USER")
        .or_else(|| non_empty("USERNAME"))
        .unwrap_or_else(|| "unknown".into());
    let host = non_empty("HOSTNAME")
        .or_else(|| non_empty("COMPUTERNAME"))
        .unwrap_or_else(|| format!("pid{}", std::process::id()));
    format!("{user}@{host}")
}
