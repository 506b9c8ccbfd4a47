//! Tracing setup shared by the binary, the demos and tests.
//!
//! Installs an env-filtered `fmt` subscriber plus an [`ErrorLayer`] so span
//! traces survive into diagnostic reports. The filter honors `RUST_LOG` and
//! falls back to `info` for this crate.

use tracing_error::ErrorLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. Fails if one is already set.
pub fn try_init() -> Result<(), TryInitError> {
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("warn,stableflow=info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .try_init()
}

/// Install the global subscriber, ignoring a subscriber set earlier (tests
/// and demos call this unconditionally).
pub fn init() {
    let _ = try_init();
}
