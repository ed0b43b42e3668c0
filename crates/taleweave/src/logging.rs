//! Tracing setup for binaries embedding the engine.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "info,taleweave=debug";

/// Installs a `fmt` subscriber filtered by `RUST_LOG`.
///
/// Returns `false` if a global subscriber was already installed, which is
/// harmless (tests call this repeatedly).
pub fn init_tracing() -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
