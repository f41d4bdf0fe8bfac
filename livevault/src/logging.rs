//! Logging bootstrap: fmt output with an environment-driven filter.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Filter variable, e.g. `LOG_FILTER=info,livevault=debug`.
const FILTER_ENV: &str = "LOG_FILTER";

pub fn init() {
    let filter = EnvFilter::try_from_env(FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
