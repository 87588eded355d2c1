//! Log output setup for the binary.
//!
//! Library code only emits `tracing` events; installing a subscriber is left
//! to whoever owns the process.

use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str = "info";

/// Install a global subscriber writing to stderr.
///
/// Filtering follows `RUST_LOG`, falling back to `info`. With `json` set each
/// event is written as one JSON object per line.
pub fn init(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
