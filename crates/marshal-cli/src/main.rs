mod cmd_config;
mod cmd_locks;
mod cmd_queue;
mod cmd_report;
mod cmd_run;
mod context;
mod telemetry;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use marshal_core::{QueueFilter, RequestStatus};

use crate::context::Workspace;

#[derive(Parser)]
#[command(name = "marshal", version, about = "Merge queue coordinator for shared git branches")]
struct Cli {
    /// State directory (default: $MARSHAL_DIR, else <git-common-dir>/marshal)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Queue a branch for merging into a target branch
    Enqueue {
        /// Source branch
        branch: String,
        /// Target branch (default: config `default_target`)
        #[arg(long)]
        target: Option<String>,
        /// Submitter (default: $MARSHAL_SUBMITTER, else user@host)
        #[arg(long)]
        submitter: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// List merge requests
    Status {
        #[arg(long)]
        target: Option<String>,
        #[arg(long)]
        submitter: Option<String>,
        /// QUEUED, MERGING, MERGED, FAILED or MANUAL_REQUIRED
        #[arg(long)]
        status: Option<RequestStatus>,
        #[arg(long)]
        json: bool,
    },
    /// Show one merge request
    Show {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Process the queue
    Run {
        /// Exit once no queued work can make progress
        #[arg(long)]
        once: bool,
        /// Poll interval in milliseconds (overrides config)
        #[arg(long)]
        poll_ms: Option<u64>,
    },
    /// Resolve requests left MERGING by an interrupted run
    Reconcile,
    /// List long-running merges and stale locks
    Deadlocks {
        #[arg(long)]
        json: bool,
    },
    /// Force-release a target lock left by a dead process
    Unlock {
        target: String,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Cancel a queued or merging request (marks it FAILED)
    Cancel {
        id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Queue a FAILED or MANUAL_REQUIRED request again
    Requeue {
        id: String,
        #[arg(long)]
        submitter: Option<String>,
    },
    /// Check the queue document for integrity problems
    Validate,
    /// Counts and timings
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// Coordinator configuration
    Config {
        #[command(subcommand)]
        cmd: cmd_config::ConfigCmd,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = match cli.cmd {
        Command::Run { .. } | Command::Reconcile => "info",
        _ => "warn",
    };
    telemetry::init(level, cli.log_json);

    let repo_root = std::env::current_dir()?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let ws = Workspace::resolve(&repo_root, cli.state_dir).await?;
        dispatch(cli.cmd, &ws).await
    })
}

async fn dispatch(cmd: Command, ws: &Workspace) -> anyhow::Result<()> {
    match cmd {
        Command::Enqueue {
            branch,
            target,
            submitter,
            json,
        } => cmd_queue::enqueue(ws, &branch, target.as_deref(), submitter.as_deref(), json),
        Command::Status {
            target,
            submitter,
            status,
            json,
        } => cmd_queue::status(
            ws,
            &QueueFilter {
                target,
                submitter,
                status,
            },
            json,
        ),
        Command::Show { id, json } => cmd_queue::show(ws, &id, json),
        Command::Run { once, poll_ms } => cmd_run::run(ws, once, poll_ms).await,
        Command::Reconcile => cmd_run::reconcile(ws).await,
        Command::Deadlocks { json } => cmd_locks::deadlocks(ws, json).await,
        Command::Unlock { target, yes } => cmd_locks::unlock(ws, &target, yes).await,
        Command::Cancel { id, reason } => cmd_queue::cancel(ws, &id, reason.as_deref()),
        Command::Requeue { id, submitter } => cmd_queue::requeue(ws, &id, submitter.as_deref()),
        Command::Validate => cmd_report::validate(ws),
        Command::Stats { json } => cmd_report::stats(ws, json),
        Command::Config { cmd } => cmd_config::run(cmd, ws),
    }
}
