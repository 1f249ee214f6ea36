use std::time::Duration;

use anyhow::{bail, Result};
use tokio_util::sync::CancellationToken;

use marshal_conductor::{reconcile as reconcile_queue, run as run_processor, RunOptions};

use crate::context::Workspace;

/// `marshal run [--once] [--poll-ms N]`
pub async fn run(ws: &Workspace, once: bool, poll_ms: Option<u64>) -> Result<()> {
    let coord = ws.coordinator()?;
    let cancel = CancellationToken::new();
    ctrlc_cancel(cancel.clone());

    let opts = RunOptions {
        once,
        poll_interval: poll_ms.map(Duration::from_millis),
    };
    if !once {
        println!(
            "Processing queue in {} (Ctrl+C to stop)",
            coord.paths.state_dir.display()
        );
    }
    let summary = run_processor(coord, opts, cancel).await?;
    println!(
        "Merged {}, failed {}, manual {}{}",
        summary.merged,
        summary.failed,
        summary.manual_required,
        if summary.deferred > 0 {
            format!(", deferred {}", summary.deferred)
        } else {
            String::new()
        }
    );
    Ok(())
}

/// `marshal reconcile`
pub async fn reconcile(ws: &Workspace) -> Result<()> {
    let coord = ws.coordinator()?;
    // Reconciling under a live processor would rewind its in-flight merges.
    let Some(_instance) = marshal_store::try_lock_file(&coord.paths.processor_lock)? else {
        bail!("a processor is running; it reconciles on startup");
    };
    let report = reconcile_queue(&coord).await?;
    if report.merged + report.requeued == 0 {
        println!("Nothing to reconcile.");
    } else {
        println!(
            "Reconciled: {} marked merged, {} returned to the queue",
            report.merged, report.requeued
        );
    }
    Ok(())
}

fn ctrlc_cancel(cancel: CancellationToken) {
    let _ = ctrlc::set_handler(move || {
        if cancel.is_cancelled() {
            eprintln!("Forced exit; run `marshal reconcile` before the next run.");
            std::process::exit(130);
        }
        eprintln!("Stopping after in-flight merges finish (Ctrl+C again to force)...");
        cancel.cancel();
    });
}
