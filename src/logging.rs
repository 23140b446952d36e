//! Console logging.
//!
//! Everything goes to stderr so stdout stays free for command output.
//! `RUST_LOG` takes precedence over the verbosity passed by the CLI.

use std::io;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Default directive for a `-v` count: 0 → info, 1 → debug, 2+ → trace.
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "planning_tile_harvester=debug,tile_harvester=debug,info",
        _ => "trace",
    }
}

/// Installs the global subscriber. Calling it twice is a no-op.
pub fn init_logging(verbosity: u8) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(verbosity > 0);

    // A subscriber may already be installed, e.g. by a test harness.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .try_init();
}
