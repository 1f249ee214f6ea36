//! Log subscriber setup.
//!
//! Filter comes from `MARSHAL_LOG`, then `RUST_LOG`, then the command's
//! default level. Output always goes to stderr so `--json` stdout stays
//! machine-readable.

use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::EnvFilter;

pub fn init(default_level: &str, json: bool) {
    let filter = EnvFilter::try_from_env("MARSHAL_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };
    if let Err(e) = result {
        eprintln!("warning: log subscriber already set: {e}");
    }
}
