//! Logging setup.

use tracing_subscriber::EnvFilter;

use crate::config::LogSection;

/// Install a console `tracing` subscriber.
///
/// `RUST_LOG` wins over the configured level. Safe to call more than once;
/// only the first call installs a subscriber.
pub fn init(log: &LogSection) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
