//! Scratch repositories for tests: a bare `origin` plus a working clone.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use marshal_core::CoordinatorConfig;

use crate::coordinator::Coordinator;
use crate::git::Git;
use crate::notify::CollectNotifier;

pub struct TestRepo {
    pub dir: tempfile::TempDir,
    pub origin: PathBuf,
    pub work: PathBuf,
    pub state: PathBuf,
}

impl TestRepo {
    /// `origin` (bare) with `main` containing `f.txt` and `README`, cloned
    /// into `work`.
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let origin = dir.path().join("origin.git");
        let work = dir.path().join("work");
        let state = dir.path().join("state");
        std::fs::create_dir_all(&work).unwrap();

        let root = Git::new(dir.path(), Duration::from_secs(60));
        root.run(&["init", "-q", "--bare", "-b", "main", path_str(&origin)])
            .await
            .unwrap();

        let git = Git::new(&work, Duration::from_secs(60));
        git.run(&["init", "-q", "-b", "main"]).await.unwrap();
        git.run(&["config", "user.email", "dev@example.com"]).await.unwrap();
        git.run(&["config", "user.name", "Dev"]).await.unwrap();
        git.run(&["config", "commit.gpgsign", "false"]).await.unwrap();
        git.run(&["remote", "add", "origin", path_str(&origin)])
            .await
            .unwrap();
        std::fs::write(work.join("f.txt"), "line1\nline2\nline3\n").unwrap();
        std::fs::write(work.join("README"), "readme\n").unwrap();
        git.run(&["add", "."]).await.unwrap();
        git.run(&["commit", "-q", "-m", "initial"]).await.unwrap();
        git.run(&["push", "-q", "-u", "origin", "main"]).await.unwrap();

        Self {
            dir,
            origin,
            work,
            state,
        }
    }

    pub fn git(&self) -> Git {
        Git::new(&self.work, Duration::from_secs(60))
    }

    /// Local branch off `main` with one commit writing `file`.
    pub async fn branch_with_file(&self, branch: &str, file: &str, content: &str) {
        let git = self.git();
        git.run(&["checkout", "-q", "-b", branch, "main"]).await.unwrap();
        let path = self.work.join(file);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
        git.run(&["add", "."]).await.unwrap();
        git.run(&["commit", "-q", "-m", &format!("{branch}: write {file}")])
            .await
            .unwrap();
        git.run(&["checkout", "-q", "main"]).await.unwrap();
    }

    /// Like `branch_with_file`, then pushed to origin.
    pub async fn pushed_branch(&self, branch: &str, file: &str, content: &str) {
        self.branch_with_file(branch, file, content).await;
        self.git()
            .run(&["push", "-q", "origin", branch])
            .await
            .unwrap();
    }

    /// Commit directly to origin's `main` from a separate clone, as another
    /// developer would.
    pub async fn advance_origin(&self, file: &str, content: &str, message: &str) {
        static CLONES: AtomicUsize = AtomicUsize::new(0);
        let n = CLONES.fetch_add(1, Ordering::SeqCst);
        let other = self.dir.path().join(format!("other-{n}"));
        let root = Git::new(self.dir.path(), Duration::from_secs(60));
        root.run(&["clone", "-q", path_str(&self.origin), path_str(&other)])
            .await
            .unwrap();
        let git = Git::new(&other, Duration::from_secs(60));
        git.run(&["config", "user.email", "other@example.com"]).await.unwrap();
        git.run(&["config", "user.name", "Other"]).await.unwrap();
        std::fs::write(other.join(file), content).unwrap();
        git.run(&["add", "."]).await.unwrap();
        git.run(&["commit", "-q", "-m", message]).await.unwrap();
        git.run(&["push", "-q", "origin", "HEAD:main"]).await.unwrap();
    }

    pub fn origin_git(&self) -> Git {
        Git::new(&self.origin, Duration::from_secs(60))
    }

    /// Content of `path` on origin's `main`.
    pub async fn origin_file(&self, path: &str) -> Option<String> {
        let out = self
            .origin_git()
            .output(&["show", &format!("main:{path}")])
            .await
            .unwrap();
        out.success().then_some(out.stdout)
    }

    pub fn config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            poll_interval_ms: 20,
            lock_timeout_sec: 5,
            retry_backoff_ms: 10,
            heartbeat_interval_sec: 1,
            git_timeout_sec: 60,
            ..Default::default()
        }
    }

    pub fn coordinator(&self, config: CoordinatorConfig) -> (Arc<Coordinator>, Arc<CollectNotifier>) {
        let notifier = Arc::new(CollectNotifier::new());
        let coord = Coordinator::open(&self.work, &self.state, config, notifier.clone()).unwrap();
        (Arc::new(coord), notifier)
    }
}

fn path_str(p: &Path) -> &str {
    p.to_str().unwrap()
}
