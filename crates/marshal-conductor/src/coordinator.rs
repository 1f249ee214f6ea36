//! Shared context for one coordinator instance.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use marshal_core::{CoordinatorConfig, HolderInfo, LockError, LockHandle, LockManager, QueueStore};
use marshal_store::MarshalPaths;

use crate::event_log::EventLogger;
use crate::git::Git;
use crate::notify::Notifier;

/// Lock serializing repository-wide git operations (fetch, worktree admin).
/// A colon cannot appear in a ref name, so this never collides with a target.
pub const REPO_LOCK: &str = ":repo";

pub struct Coordinator {
    pub repo_root: PathBuf,
    pub paths: MarshalPaths,
    pub config: CoordinatorConfig,
    pub store: QueueStore,
    pub locks: LockManager,
    /// Runner rooted at the repository, committing as the configured identity.
    pub git: Git,
    pub events: EventLogger,
    pub notifier: Arc<dyn Notifier>,
}

impl Coordinator {
    pub fn open(
        repo_root: &Path,
        state_dir: &Path,
        config: CoordinatorConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        config.validate()?;
        let paths = MarshalPaths::new(state_dir);
        let store = QueueStore::open(paths.clone(), config.max_retries)
            .with_context(|| format!("opening queue in {}", state_dir.display()))?;
        let git = Git::new(repo_root, config.git_timeout())
            .with_committer(&config.committer_name, &config.committer_email);
        Ok(Self {
            repo_root: repo_root.to_path_buf(),
            locks: LockManager::new(paths.clone()),
            events: EventLogger::new(paths.events_jsonl.clone()),
            paths,
            config,
            store,
            git,
            notifier,
        })
    }

    pub fn remote(&self) -> Option<&str> {
        self.config.remote()
    }

    /// Acquire a named lock without blocking the async runtime.
    pub async fn acquire_lock(
        &self,
        name: &str,
        holder: &str,
        timeout: Duration,
    ) -> Result<LockHandle, LockError> {
        let locks = self.locks.clone();
        let info = HolderInfo::new(name, holder);
        let name = name.to_string();
        match tokio::task::spawn_blocking(move || locks.acquire(&name, info, timeout)).await {
            Ok(result) => result,
            Err(e) => Err(LockError::Storage(anyhow::anyhow!("lock task failed: {e}"))),
        }
    }

    /// Repository-wide lock for fetch and worktree administration.
    pub async fn repo_lock(&self, holder: &str) -> Result<LockHandle> {
        self.acquire_lock(REPO_LOCK, holder, self.config.git_timeout())
            .await
            .context("acquiring repository lock")
    }

    /// `fetch --prune <remote>`; no-op in local mode.
    pub async fn fetch(&self, holder: &str) -> Result<()> {
        let Some(remote) = self.remote() else {
            return Ok(());
        };
        let _repo = self.repo_lock(holder).await?;
        self.git
            .run(&["fetch", "--prune", "--quiet", remote])
            .await
            .with_context(|| format!("fetching {remote}"))?;
        Ok(())
    }

    pub async fn alert(&self, message: &str) {
        self.notifier.notify(message).await;
    }
}

/// `<git-common-dir>/marshal`, shared by every worktree of the repository.
pub async fn default_state_dir(repo_root: &Path) -> Result<PathBuf> {
    let git = Git::new(repo_root, Duration::from_secs(30));
    let common = git
        .common_dir()
        .await
        .with_context(|| format!("{} is not inside a git repository", repo_root.display()))?;
    Ok(common.join("marshal"))
}
