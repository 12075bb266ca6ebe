//! Tracing subscriber setup from an endpoint configuration.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use crate::config::EndpointConfig;
use crate::error::{PoolError, PoolResult};

/// Install the global subscriber.
///
/// The console layer honours `RUST_LOG` and falls back to the configured
/// console level. When `log_file` is given, a second plain-text layer
/// appends to it at the configured file level. Fails if a global
/// subscriber is already installed.
pub fn init_tracing(config: &EndpointConfig, log_file: Option<&Path>) -> PoolResult<()> {
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.console_level.to_string()));
    let console = tracing_subscriber::fmt::layer().with_filter(console_filter);

    let file = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(config.file_level.as_filter()),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .map_err(|err| PoolError::Config(format!("tracing already initialised: {err}")))
}
