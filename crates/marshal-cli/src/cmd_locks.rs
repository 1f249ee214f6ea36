use std::io::{BufRead, IsTerminal, Write};

use anyhow::{bail, Result};

use marshal_conductor::{detect_deadlocks, force_release};

use crate::context::Workspace;

/// `marshal deadlocks`
pub async fn deadlocks(ws: &Workspace, json: bool) -> Result<()> {
    let coord = ws.coordinator()?;
    let found = detect_deadlocks(&coord).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&found)?);
        return Ok(());
    }
    if found.is_empty() {
        println!("No deadlock candidates.");
        return Ok(());
    }
    for candidate in &found {
        println!("\u{26A0} {candidate}");
    }
    println!("\nInspect the holder before `marshal unlock <target>`.");
    Ok(())
}

/// `marshal unlock <target>`
pub async fn unlock(ws: &Workspace, target: &str, yes: bool) -> Result<()> {
    let coord = ws.coordinator()?;
    if !yes {
        let stdin = std::io::stdin();
        if !stdin.is_terminal() {
            bail!("refusing to force-release `{target}` without --yes");
        }
        let holder = coord
            .locks
            .holder(target)
            .map(|h| format!(" (holder {}, pid {}, last heartbeat {})", h.holder, h.pid, h.heartbeat_at))
            .unwrap_or_default();
        print!("Force-release lock `{target}`{holder}? [y/N] ");
        std::io::stdout().flush()?;
        let mut answer = String::new();
        stdin.lock().read_line(&mut answer)?;
        if !confirmed(&answer) {
            println!("Aborted.");
            return Ok(());
        }
    }
    match force_release(&coord, target).await? {
        Some(prev) => println!("Released `{target}` (was held by {}, pid {})", prev.holder, prev.pid),
        None => println!("`{target}` had no holder metadata; nothing to release."),
    }
    Ok(())
}

fn confirmed(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirmation_answers() {
        assert!(confirmed("y\n"));
        assert!(confirmed(" YES "));
        assert!(!confirmed("\n"));
        assert!(!confirmed("no"));
    }
}
