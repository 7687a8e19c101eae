//! Tracing bootstrap shared by tests and binaries.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a stderr `fmt` subscriber filtered by `RUST_LOG`.
///
/// `default_directive` (e.g. `"hive_harness=debug"`) applies when `RUST_LOG`
/// is unset or unparsable. Returns `false` if a global subscriber was
/// already installed, so every test may call this.
pub fn init_logging(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true),
        )
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_logging("hive_harness=debug");
        assert!(!init_logging("hive_harness=debug"));
    }
}
