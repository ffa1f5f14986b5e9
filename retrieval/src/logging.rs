//! Tracing subscriber setup.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Environment variable read for log directives.
pub const LOG_ENV: &str = "RUST_LOG";

/// Install a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive` (for example `sift_retrieval=info`).
///
/// Returns `false` if a global subscriber was already installed, so it is
/// safe to call more than once.
pub fn init(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init("sift_retrieval=debug");
        assert!(!init("sift_retrieval=debug"));
    }
}
