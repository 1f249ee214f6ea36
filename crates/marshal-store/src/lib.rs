pub mod paths;

pub use paths::{encode_name, MarshalPaths};

use fs2::FileExt;
use std::fs;
use std::io::Write;
use std::path::Path;

/// Durable atomic write: temp file in the same dir, fsync, rename, fsync dir.
///
/// Readers either see the previous content or the new content, never a
/// partial file, and the new content survives a crash once this returns.
pub fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("no parent dir for {}", path.display()))?;
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    sync_dir(parent);
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(d) = fs::File::open(dir) {
        let _ = d.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

/// Append a single line to a file, creating parent dirs if needed.
pub fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{line}")
}

/// File-based exclusive lock guard. The OS lock is released on drop
/// (and by the kernel if the process dies).
pub struct LockGuard {
    _file: fs::File,
}

fn open_lock_file(path: &Path) -> anyhow::Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| anyhow::anyhow!("cannot open lock file {}: {}", path.display(), e))?;
    Ok(file)
}

/// Acquire an exclusive file lock, blocking until available.
pub fn lock_file(path: &Path) -> anyhow::Result<LockGuard> {
    let file = open_lock_file(path)?;
    file.lock_exclusive()?;
    Ok(LockGuard { _file: file })
}

/// Try to acquire an exclusive file lock without blocking.
/// Returns `Ok(None)` if another handle currently holds it.
pub fn try_lock_file(path: &Path) -> anyhow::Result<Option<LockGuard>> {
    let file = open_lock_file(path)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(LockGuard { _file: file })),
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
        Err(e) => Err(anyhow::anyhow!(
            "cannot lock {}: {}",
            path.display(),
            e
        )),
    }
}
