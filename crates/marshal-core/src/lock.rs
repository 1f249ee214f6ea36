//! Named branch locks.
//!
//! Each name maps to `locks/<name>.lock`, held with an exclusive fs2 advisory
//! lock for the lifetime of a [`LockHandle`]. The kernel drops the lock when
//! the holding process dies, so the OS lock itself is never stale. Staleness
//! is judged from the sidecar `locks/<name>.holder.json`, whose
//! `heartbeat_at` the holder refreshes while it works.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use marshal_store::{LockGuard, MarshalPaths};

use crate::clock;
use crate::error::LockError;

const ACQUIRE_POLL: Duration = Duration::from_millis(25);

/// Holder metadata written next to the lock file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HolderInfo {
    pub name: String,
    pub pid: u32,
    /// Who holds it, typically a request id.
    pub holder: String,
    pub acquired_at: String,
    pub heartbeat_at: String,
}

impl HolderInfo {
    pub fn new(name: &str, holder: &str) -> Self {
        let now = clock::now_rfc3339();
        Self {
            name: name.to_string(),
            pid: std::process::id(),
            holder: holder.to_string(),
            acquired_at: now.clone(),
            heartbeat_at: now,
        }
    }

    pub fn heartbeat_age_sec(&self) -> Option<u64> {
        clock::seconds_since(&self.heartbeat_at)
    }
}

/// Observed state of one lock, for operator listings.
#[derive(Debug, Clone, Serialize)]
pub struct LockState {
    pub name: String,
    /// OS lock currently held by a live handle.
    pub locked: bool,
    pub holder: Option<HolderInfo>,
}

#[derive(Debug, Clone)]
pub struct LockManager {
    paths: MarshalPaths,
}

impl LockManager {
    pub fn new(paths: MarshalPaths) -> Self {
        Self { paths }
    }

    /// Take the lock if it is free right now.
    pub fn try_acquire(
        &self,
        name: &str,
        holder: HolderInfo,
    ) -> Result<Option<LockHandle>, LockError> {
        let Some(guard) = marshal_store::try_lock_file(&self.paths.lock_path(name))? else {
            return Ok(None);
        };
        let holder_path = self.paths.holder_path(name);
        if let Some(prev) = read_holder(&holder_path) {
            tracing::warn!(
                lock = name,
                prev_pid = prev.pid,
                prev_holder = %prev.holder,
                "reclaiming lock left behind by a dead holder"
            );
        }
        write_holder(&holder_path, &holder)?;
        tracing::debug!(lock = name, holder = %holder.holder, "lock acquired");
        Ok(Some(LockHandle {
            name: name.to_string(),
            holder_path,
            state: Arc::new(Mutex::new(Some(holder))),
            _guard: guard,
        }))
    }

    /// Block up to `timeout` for the lock. Not re-entrant: acquiring a name
    /// this process already holds waits for the full timeout.
    pub fn acquire(
        &self,
        name: &str,
        holder: HolderInfo,
        timeout: Duration,
    ) -> Result<LockHandle, LockError> {
        let start = Instant::now();
        loop {
            if let Some(handle) = self.try_acquire(name, holder.clone())? {
                return Ok(handle);
            }
            let waited = start.elapsed();
            if waited >= timeout {
                return Err(LockError::Timeout {
                    name: name.to_string(),
                    waited,
                });
            }
            std::thread::sleep(ACQUIRE_POLL.min(timeout - waited));
        }
    }

    /// Probe whether a live handle holds the lock.
    pub fn is_locked(&self, name: &str) -> Result<bool, LockError> {
        Ok(marshal_store::try_lock_file(&self.paths.lock_path(name))?.is_none())
    }

    pub fn holder(&self, name: &str) -> Option<HolderInfo> {
        read_holder(&self.paths.holder_path(name))
    }

    /// True if holder metadata exists and its heartbeat is older than
    /// `max_age` (or cannot be read at all). No metadata means nobody
    /// claims the lock, which is not stale.
    pub fn is_stale(&self, name: &str, max_age: Duration) -> bool {
        let path = self.paths.holder_path(name);
        if !path.exists() {
            return false;
        }
        match read_holder(&path).and_then(|h| h.heartbeat_age_sec()) {
            Some(age) => age > max_age.as_secs(),
            None => true,
        }
    }

    pub fn list(&self) -> Result<Vec<LockState>, LockError> {
        let names = self
            .paths
            .lock_names()
            .map_err(|e| LockError::Storage(e.into()))?;
        names
            .into_iter()
            .map(|name| {
                Ok(LockState {
                    locked: self.is_locked(&name)?,
                    holder: self.holder(&name),
                    name,
                })
            })
            .collect()
    }

    /// Remove holder metadata left by a dead holder. Refuses with
    /// `LockError::Held` while a live handle holds the OS lock.
    pub fn clear_holder(&self, name: &str) -> Result<Option<HolderInfo>, LockError> {
        let Some(_guard) = marshal_store::try_lock_file(&self.paths.lock_path(name))? else {
            return Err(LockError::Held {
                name: name.to_string(),
                holder_pid: self.holder(name).map(|h| h.pid),
            });
        };
        let path = self.paths.holder_path(name);
        let prev = read_holder(&path);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(LockError::Storage(e.into())),
        }
        Ok(prev)
    }
}

/// A held lock. Released (holder metadata removed, OS lock dropped) when
/// the handle is dropped, on every exit path.
pub struct LockHandle {
    name: String,
    holder_path: PathBuf,
    /// `None` once released; shared with heartbeat writers.
    state: Arc<Mutex<Option<HolderInfo>>>,
    _guard: LockGuard,
}

impl LockHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A cloneable writer for a background heartbeat task. Writes stop once
    /// the handle is dropped.
    pub fn heartbeat_writer(&self) -> HeartbeatWriter {
        HeartbeatWriter {
            holder_path: self.holder_path.clone(),
            state: Arc::clone(&self.state),
        }
    }

    /// Explicit release; equivalent to dropping the handle.
    pub fn release(self) {}
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        *state = None;
        if let Err(e) = std::fs::remove_file(&self.holder_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(lock = %self.name, error = %e, "failed to remove holder metadata");
            }
        }
        tracing::debug!(lock = %self.name, "lock released");
    }
}

#[derive(Clone)]
pub struct HeartbeatWriter {
    holder_path: PathBuf,
    state: Arc<Mutex<Option<HolderInfo>>>,
}

impl HeartbeatWriter {
    /// Write a fresh heartbeat. Ok(false) once the lock has been released.
    pub fn beat(&self) -> Result<bool, LockError> {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(info) = state.as_mut() else {
            return Ok(false);
        };
        info.heartbeat_at = clock::now_rfc3339();
        write_holder(&self.holder_path, info)?;
        Ok(true)
    }
}

fn read_holder(path: &std::path::Path) -> Option<HolderInfo> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

fn write_holder(path: &std::path::Path, info: &HolderInfo) -> Result<(), LockError> {
    let data = serde_json::to_vec_pretty(info).map_err(|e| LockError::Storage(e.into()))?;
    marshal_store::write_atomic(path, &data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, LockManager) {
        let dir = tempfile::tempdir().unwrap();
        let paths = MarshalPaths::new(dir.path());
        paths.ensure_layout().unwrap();
        (dir, LockManager::new(paths))
    }

    #[test]
    fn acquire_and_release() {
        let (_dir, m) = manager();
        let h = m
            .acquire("main", HolderInfo::new("main", "mr_1"), Duration::from_secs(1))
            .unwrap();
        assert!(m.is_locked("main").unwrap());
        assert_eq!(m.holder("main").unwrap().holder, "mr_1");
        h.release();
        assert!(!m.is_locked("main").unwrap());
        assert!(m.holder("main").is_none());
    }

    #[test]
    fn second_acquire_times_out() {
        let (_dir, m) = manager();
        let _h = m
            .acquire("main", HolderInfo::new("main", "a"), Duration::from_secs(1))
            .unwrap();
        let err = m
            .acquire("main", HolderInfo::new("main", "b"), Duration::from_millis(100))
            .err()
            .unwrap();
        assert!(matches!(err, LockError::Timeout { .. }));
        // The first holder's metadata is untouched.
        assert_eq!(m.holder("main").unwrap().holder, "a");
    }

    #[test]
    fn distinct_names_are_independent() {
        let (_dir, m) = manager();
        let _a = m.try_acquire("main", HolderInfo::new("main", "a")).unwrap().unwrap();
        let b = m
            .try_acquire("release/1.0", HolderInfo::new("release/1.0", "b"))
            .unwrap();
        assert!(b.is_some());
    }

    #[test]
    fn acquire_waits_for_release() {
        let (_dir, m) = manager();
        let h = m.try_acquire("main", HolderInfo::new("main", "a")).unwrap().unwrap();
        let m2 = m.clone();
        let waiter = std::thread::spawn(move || {
            m2.acquire("main", HolderInfo::new("main", "b"), Duration::from_secs(5))
                .map(|h| h.name().to_string())
        });
        std::thread::sleep(Duration::from_millis(100));
        drop(h);
        assert_eq!(waiter.join().unwrap().unwrap(), "main");
    }

    #[test]
    fn heartbeat_refreshes_until_release() {
        let (_dir, m) = manager();
        let h = m.try_acquire("main", HolderInfo::new("main", "a")).unwrap().unwrap();
        let writer = h.heartbeat_writer();
        assert!(writer.beat().unwrap());
        drop(h);
        assert!(!writer.beat().unwrap());
        assert!(m.holder("main").is_none());
    }

    #[test]
    fn stale_detection_without_live_holder() {
        let (_dir, m) = manager();
        assert!(!m.is_stale("main", Duration::from_secs(60)));

        let mut info = HolderInfo::new("main", "mr_dead");
        info.pid = 999_999;
        info.heartbeat_at = "2020-01-01T00:00:00Z".into();
        write_holder(&m.paths.holder_path("main"), &info).unwrap();

        assert!(m.is_stale("main", Duration::from_secs(60)));
        assert!(!m.is_stale("main", Duration::from_secs(u32::MAX as u64 * 10)));
        // Detection alone changes nothing.
        assert_eq!(m.holder("main").unwrap(), info);
        assert!(!m.is_locked("main").unwrap());
    }

    #[test]
    fn unreadable_holder_is_stale() {
        let (_dir, m) = manager();
        std::fs::write(m.paths.holder_path("main"), "garbage").unwrap();
        assert!(m.is_stale("main", Duration::from_secs(3600)));
    }

    #[test]
    fn clear_holder_refuses_live_lock() {
        let (_dir, m) = manager();
        let h = m.try_acquire("main", HolderInfo::new("main", "a")).unwrap().unwrap();
        assert!(matches!(m.clear_holder("main"), Err(LockError::Held { .. })));
        drop(h);

        let mut info = HolderInfo::new("main", "mr_dead");
        info.heartbeat_at = "2020-01-01T00:00:00Z".into();
        write_holder(&m.paths.holder_path("main"), &info).unwrap();
        let cleared = m.clear_holder("main").unwrap().unwrap();
        assert_eq!(cleared.holder, "mr_dead");
        assert!(!m.is_stale("main", Duration::from_secs(1)));
    }

    #[test]
    fn list_reports_every_lock_seen() {
        let (_dir, m) = manager();
        let _h = m.try_acquire("main", HolderInfo::new("main", "a")).unwrap().unwrap();
        drop(m.try_acquire("feature/x", HolderInfo::new("feature/x", "b")).unwrap());
        let mut states = m.list().unwrap();
        states.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].name, "feature/x");
        assert!(!states[0].locked);
        assert_eq!(states[1].name, "main");
        assert!(states[1].locked);
        assert_eq!(states[1].holder.as_ref().unwrap().holder, "a");
    }
}
