//! Structured tracing helpers.

use amp_config::TelemetrySettings;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, fmt};

/// Failures while installing the global subscriber.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The configured directive is not a valid `EnvFilter`.
    #[error("invalid log filter `{directive}`: {reason}")]
    InvalidFilter {
        /// Directive as configured.
        directive: String,
        /// Parser message.
        reason: String,
    },
    /// Another global subscriber is already installed.
    #[error("tracing subscriber already installed: {reason}")]
    AlreadyInitialized {
        /// Underlying error text.
        reason: String,
    },
}

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `settings.filter`.
///
/// # Errors
///
/// Returns [`TelemetryError`] when the filter does not parse or a subscriber
/// is already installed.
pub fn init_tracing(settings: &TelemetrySettings) -> Result<(), TelemetryError> {
    let filter = build_filter(settings)?;
    let registry = tracing_subscriber::registry().with(filter);
    let installed = if settings.json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };
    installed.map_err(|err| TelemetryError::AlreadyInitialized {
        reason: err.to_string(),
    })
}

fn build_filter(settings: &TelemetrySettings) -> Result<EnvFilter, TelemetryError> {
    EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new(&settings.filter).map_err(|err| TelemetryError::InvalidFilter {
            directive: settings.filter.clone(),
            reason: err.to_string(),
        })
    })
}
