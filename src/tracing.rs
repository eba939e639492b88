//! Diagnostic log setup, shared by both binaries.

use tracing_subscriber::EnvFilter;

/// Initialise the subscriber. `RUST_LOG` wins when set; otherwise the
/// repeatable `-v` flag picks the level:
/// - 0: error
/// - 1: warn
/// - 2: info
/// - 3: debug
/// - 4+: trace
pub fn init(verbose: u8) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or(match verbose {
        0 => EnvFilter::new("error"),
        1 => EnvFilter::new("warn"),
        2 => EnvFilter::new("info"),
        3 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    });

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}
