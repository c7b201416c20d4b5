use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading runtime settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Settings file could not be read.
    #[error("failed to read settings from {path}: {source}")]
    Io {
        /// File that was requested.
        path: PathBuf,
        /// Underlying I/O failure.
        source: std::io::Error,
    },
    /// Document is not valid TOML or does not match the schema.
    #[error("failed to parse settings: {source}")]
    Parse {
        /// Underlying parser error.
        #[from]
        source: toml::de::Error,
    },
    /// An environment override could not be parsed.
    #[error("invalid value `{value}` for {var}: {reason}")]
    InvalidOverride {
        /// Environment variable name.
        var: &'static str,
        /// Raw value.
        value: String,
        /// Parser message.
        reason: String,
    },
    /// A field violates its constraints.
    #[error("invalid setting {field}: {reason}")]
    Invalid {
        /// Dotted field path.
        field: &'static str,
        /// Constraint that failed.
        reason: &'static str,
    },
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
