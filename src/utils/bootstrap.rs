//! Bootstrap utilities for causeway hosts.
//!
//! Shared initialization code for processes embedding the dispatch engine
//! or the reply correlator.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

/// Initialize tracing with the CAUSEWAY_LOG environment variable.
///
/// Defaults to "info" level if CAUSEWAY_LOG is not set. Calling this twice
/// is harmless; the second registration is ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
