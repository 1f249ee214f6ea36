pub mod clock;
pub mod config;
pub mod error;
pub mod lock;
pub mod machine;
pub mod queue;
pub mod request;
pub mod validate;

pub use config::CoordinatorConfig;
pub use error::{ConfigError, LockError, QueueError};
pub use lock::{HolderInfo, LockHandle, LockManager, LockState};
pub use machine::{is_valid_transition, RequestUpdate};
pub use queue::{QueueDocument, QueueFilter, QueueStore};
pub use request::{ConflictCheck, ConflictVerdict, MergeRequest, RequestMetrics, RequestStatus};
pub use validate::{validate, IntegrityIssue};
