//! Log output for the scheduler and its backends.
//!
//! Transaction lifecycle (open, commit, abort) is logged at `debug`, queueing
//! and join decisions at `trace`, swallowed faults and requests that queue
//! from inside a transaction at `warn`. `RUST_LOG=scopedb_core=trace` shows
//! every scheduling decision.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install a compact subscriber filtered by `RUST_LOG`, falling back to `info`.
pub fn init() {
    init_with_filter("info");
}

/// Like [`init`] with `default_filter` used when `RUST_LOG` is unset.
///
/// Later calls leave the first subscriber in place, so every test may call it.
pub fn init_with_filter(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .try_init();
}

/// Markers leading each log line, by subsystem.
pub mod prefix {
    /// Transactions and requests
    pub const DB: &str = "⊔";
    /// Queue driver started
    pub const OPEN: &str = "✿";
    /// Queue closing or stopped
    pub const CLOSE: &str = "❀";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_repeatable() {
        init_with_filter("warn");
        init();
    }
}
