//! Tracing subscriber setup for the `mppt` binary.
//!
//! Console output always; a second plain-text layer when a log file is
//! configured. `RUST_LOG` takes precedence over the configured level.

use crate::config::LoggingConfig;
use crate::error::{AppResult, MppError};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn env_filter(level: &str) -> AppResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| MppError::Configuration(format!("Invalid log level '{}': {}", level, e))),
    }
}

/// Install the global subscriber. Call once, before any instrument is touched.
pub fn init(config: &LoggingConfig) -> AppResult<()> {
    let mut layers: Vec<BoxedLayer> = Vec::new();

    let console = fmt::layer().with_target(false);
    if config.json {
        layers.push(console.json().with_filter(env_filter(&config.level)?).boxed());
    } else {
        layers.push(console.with_filter(env_filter(&config.level)?).boxed());
    }

    if let Some(path) = &config.file {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        layers.push(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .with_filter(env_filter(&config.level)?)
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .map_err(|e| MppError::Configuration(format!("Failed to initialise logging: {}", e)))
}
