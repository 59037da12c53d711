//! Logging bootstrap
//!
//! Structured logging for the orchestrator: node progress, skip markers,
//! subprocess launches and cleanup failures are all `tracing` events.
//! Initialization is optional — test frameworks that install their own
//! subscriber keep it, and double-initialization is a no-op.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install a formatting subscriber.
///
/// `filter` takes `EnvFilter` directives (e.g. `"info,kindling=debug"`);
/// when absent, `RUST_LOG` is consulted with an `info` default. Safe to call
/// when a subscriber is already installed.
pub fn init_logging(filter: Option<&str>) {
    let env_filter = match filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_file(false)
        .with_line_number(false);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging(Some("info"));
        // a second call must not panic even though a subscriber exists
        init_logging(Some("debug,kindling=trace"));
        init_logging(None);
    }
}
