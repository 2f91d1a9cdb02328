//! Tracing setup for binaries and tests that drive plans.

use crate::error::PlanError;
use tracing_subscriber::EnvFilter;

/// Install a global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence; `default_level` (e.g. the configured
/// `log_level`) applies when it is not set. Fails if a subscriber is already
/// installed.
pub fn init_tracing(default_level: &str) -> Result<(), PlanError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| PlanError::Config(format!("failed to install tracing subscriber: {e}")))
}
