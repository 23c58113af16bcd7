//! Command-line front ends for credbridge
//!
//! - `credbridge`: runs the bridge on the host and manages logins
//! - `docker-credential-credbridge`: the in-VM credential helper that talks
//!   to the bridge

pub mod commands;
pub mod helper;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log to stderr at `default_level`; `RUST_LOG` overrides it
pub fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init();
}
