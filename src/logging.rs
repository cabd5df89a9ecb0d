//! Tracing setup.
//!
//! The library itself only emits `tracing` events. Applications and tests that
//! want to see them call [`init_tracing`] once at startup.

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Default filter when `RUST_LOG` is not set.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `level`. Logs go to stderr, as JSON lines
/// when `json` is set. Fails if a global subscriber is already installed.
pub fn init_tracing(level: &str, json: bool) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    }
}
