use std::path::{Path, PathBuf};

/// All well-known paths under a coordinator state directory.
#[derive(Debug, Clone)]
pub struct MarshalPaths {
    pub state_dir: PathBuf,
    pub config_json: PathBuf,
    pub queue_json: PathBuf,
    pub queue_lock: PathBuf,
    pub processor_lock: PathBuf,
    pub locks_dir: PathBuf,
    pub worktrees_dir: PathBuf,
    pub events_jsonl: PathBuf,
    pub runner_status_json: PathBuf,
}

impl MarshalPaths {
    /// Derive all paths from a state directory. Pure computation, no I/O.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        Self {
            config_json: state_dir.join("config.json"),
            queue_json: state_dir.join("queue.json"),
            queue_lock: state_dir.join("queue.lock"),
            processor_lock: state_dir.join("processor.lock"),
            locks_dir: state_dir.join("locks"),
            worktrees_dir: state_dir.join("worktrees"),
            events_jsonl: state_dir.join("events.jsonl"),
            runner_status_json: state_dir.join("runner-status.json"),
            state_dir,
        }
    }

    /// Create all required directories. Idempotent.
    pub fn ensure_layout(&self) -> anyhow::Result<()> {
        for dir in [&self.state_dir, &self.locks_dir, &self.worktrees_dir] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// `locks/<name>.lock`
    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.locks_dir.join(format!("{}.lock", encode_name(name)))
    }

    /// `locks/<name>.holder.json`
    pub fn holder_path(&self, name: &str) -> PathBuf {
        self.locks_dir
            .join(format!("{}.holder.json", encode_name(name)))
    }

    /// `worktrees/<target>/`
    pub fn worktree_dir(&self, target: &str) -> PathBuf {
        self.worktrees_dir.join(encode_name(target))
    }

    /// Recover the original names of every lock file in the namespace.
    pub fn lock_names(&self) -> std::io::Result<Vec<String>> {
        list_with_suffix(&self.locks_dir, ".lock")
    }
}

fn list_with_suffix(dir: &Path, suffix: &str) -> std::io::Result<Vec<String>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if let Some(stem) = file_name.strip_suffix(suffix) {
            if let Some(name) = decode_name(stem) {
                names.push(name);
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Encode a ref or lock name into a single file-safe path component.
///
/// `[A-Za-z0-9_-]` and non-leading `.` pass through; everything else
/// becomes `%XX`.
pub fn encode_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, b) in name.bytes().enumerate() {
        let keep = b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || (b == b'.' && i > 0);
        if keep {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// Inverse of [`encode_name`]. Returns `None` for malformed input.
pub fn decode_name(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
