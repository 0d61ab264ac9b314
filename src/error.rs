//! Custom error types for the application.
//!
//! `MppError` is the single error type shared by the safety envelope, the
//! sourcemeter controllers, the resource scope and the tracker. It is built
//! with `thiserror` so that every layer can propagate failures with `?`.
//!
//! ## Error Hierarchy
//!
//! - **`Configuration`** / **`ConfigLoad`**: invalid user-supplied settings. These are
//!   raised while building `Settings`, before any hardware is contacted.
//! - **`Communication`** / **`MalformedResponse`**: the instrument link (or the shutter
//!   line) rejected a write, timed out, or answered with something unparseable. These are
//!   session-fatal and always unwind through the resource scope.
//! - **`OutputLimitExceeded`**: a command would drive the device past its protection
//!   limits. The write is refused locally and never reaches the instrument.
//! - **`CancellationRequested`**: operator interrupt. Handled like a normal completion.
//! - **`Io`**: local file I/O, e.g. opening the log file.
//!
//! Instrument links speak `anyhow::Result` internally; `#[from] anyhow::Error`
//! turns any link failure into a `Communication` error at the controller boundary.

use crate::safety::Channel;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, MppError>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum MppError {
    /// Semantic validation of user settings failed.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The layered configuration could not be extracted.
    #[error("Configuration error: {0}")]
    ConfigLoad(#[from] Box<figment::Error>),

    /// The instrument or shutter transport failed.
    #[error("Communication error: {0:#}")]
    Communication(#[from] anyhow::Error),

    /// The instrument answered, but the answer could not be interpreted.
    #[error("Malformed instrument response '{response}': {reason}")]
    MalformedResponse {
        /// Raw response text.
        response: String,
        /// Why parsing failed.
        reason: String,
    },

    /// A command was refused because it falls outside the protection envelope.
    #[error("Output limit exceeded: {channel} {value} outside [0, {limit}]")]
    OutputLimitExceeded {
        /// Sourced quantity.
        channel: Channel,
        /// Requested value.
        value: f64,
        /// Active protection limit for the channel.
        limit: f64,
    },

    /// The operator asked the measurement to stop.
    #[error("Cancellation requested by operator")]
    CancellationRequested,

    /// Local I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MppError {
    /// Whether this error means the hardware link can no longer be trusted.
    pub fn is_communication(&self) -> bool {
        matches!(
            self,
            MppError::Communication(_) | MppError::MalformedResponse { .. }
        )
    }

    /// Whether this error was produced by user-supplied settings.
    pub fn is_configuration(&self) -> bool {
        matches!(self, MppError::Configuration(_) | MppError::ConfigLoad(_))
    }

    pub(crate) fn malformed(response: &str, reason: impl Into<String>) -> Self {
        MppError::MalformedResponse {
            response: response.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<figment::Error> for MppError {
    fn from(err: figment::Error) -> Self {
        MppError::ConfigLoad(Box::new(err))
    }
}
