pub mod coordinator;
pub mod event_log;
pub mod executor;
pub mod git;
pub mod notify;
pub mod precheck;
pub mod processor;
pub mod recovery;

#[cfg(test)]
mod testutil;

pub use coordinator::{default_state_dir, Coordinator};
pub use executor::MergeOutcome;
pub use notify::{CollectNotifier, Notifier, StderrNotifier};
pub use processor::{run, RunOptions, RunSummary};
pub use recovery::{detect_deadlocks, force_release, reconcile, DeadlockCandidate, ReconcileReport};
