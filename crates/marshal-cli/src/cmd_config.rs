use anyhow::{bail, Result};
use clap::Subcommand;

use marshal_core::config::set_key;
use marshal_core::CoordinatorConfig;

use crate::context::Workspace;

// ── CLI Schema ──

#[derive(Subcommand)]
pub enum ConfigCmd {
    /// Show every setting, including defaults
    Show {
        #[arg(long)]
        json: bool,
    },
    /// Get one setting
    Get {
        /// Config key (e.g. max_retries)
        key: String,
    },
    /// Set one setting (validated before writing)
    Set {
        /// Config key
        key: String,
        /// Value: true/false/number/string, or `null` to reset optional keys
        value: String,
    },
}

// ── Dispatch ──

pub fn run(cmd: ConfigCmd, ws: &Workspace) -> Result<()> {
    match cmd {
        ConfigCmd::Show { json } => show(ws, json),
        ConfigCmd::Get { key } => get(ws, &key),
        ConfigCmd::Set { key, value } => set(ws, &key, &value),
    }
}

// ── Command Implementations ──

fn show(ws: &Workspace, json: bool) -> Result<()> {
    let config = ws.config()?;
    if json {
        let map: serde_json::Map<String, serde_json::Value> = CoordinatorConfig::KEYS
            .iter()
            .filter_map(|k| config.get(k).map(|v| (k.to_string(), v)))
            .collect();
        println!("{}", serde_json::to_string_pretty(&map)?);
        return Ok(());
    }
    println!("# {}", ws.paths.config_json.display());
    for key in CoordinatorConfig::KEYS {
        if let Some(value) = config.get(key) {
            println!("{key} = {value}");
        }
    }
    Ok(())
}

fn get(ws: &Workspace, key: &str) -> Result<()> {
    check_key(key)?;
    match ws.config()?.get(key) {
        Some(value) => println!("{value}"),
        None => println!("(not set)"),
    }
    Ok(())
}

fn set(ws: &Workspace, key: &str, value: &str) -> Result<()> {
    check_key(key)?;
    ws.paths.ensure_layout()?;
    let config = set_key(&ws.paths.config_json, key, value)?;
    let shown = config.get(key).unwrap_or(serde_json::Value::Null);
    println!("{key} = {shown}");
    Ok(())
}

fn check_key(key: &str) -> Result<()> {
    if !CoordinatorConfig::KEYS.contains(&key) {
        bail!(
            "unknown config key `{key}`; known keys: {}",
            CoordinatorConfig::KEYS.join(", ")
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use marshal_store::MarshalPaths;

    fn workspace(dir: &std::path::Path) -> Workspace {
        Workspace {
            repo_root: dir.to_path_buf(),
            paths: MarshalPaths::new(dir.join("state")),
        }
    }

    #[test]
    fn set_then_read_back() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = workspace(tmp.path());
        set(&ws, "max_retries", "5").unwrap();
        set(&ws, "remote", "null").unwrap();
        let config = ws.config().unwrap();
        assert_eq!(config.max_retries, 5);
        assert!(config.remote().is_none());
    }

    #[test]
    fn unknown_key_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = workspace(tmp.path());
        let err = set(&ws, "max_retry", "5").unwrap_err();
        assert!(err.to_string().contains("unknown config key"));
        assert!(!ws.paths.config_json.exists());
    }

    #[test]
    fn invalid_value_leaves_file_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = workspace(tmp.path());
        set(&ws, "lock_timeout_sec", "10").unwrap();
        let before = std::fs::read_to_string(&ws.paths.config_json).unwrap();
        assert!(set(&ws, "lock_timeout_sec", "0").is_err());
        assert_eq!(std::fs::read_to_string(&ws.paths.config_json).unwrap(), before);
    }
}
