//! Tracing setup

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to `default_filter`.
///
/// Returns `false` when a global subscriber was already installed (tests
/// calling this repeatedly, or an embedding application that set its own).
pub fn init_tracing(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .is_ok()
}

/// Filter for the given verbosity count (`-v`, `-vv`)
pub fn default_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "tradeswarm_orchestration=info,tradeswarm_storage=warn",
        1 => "tradeswarm_orchestration=debug,tradeswarm_storage=info",
        _ => "tradeswarm_orchestration=trace,tradeswarm_storage=debug",
    }
}
