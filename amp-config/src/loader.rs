//! Settings loading and environment overrides.

use std::path::Path;
use std::str::FromStr;

use tracing::{debug, info};

use crate::schema::RuntimeSettings;
use crate::{ConfigError, ConfigResult};

impl RuntimeSettings {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed documents or unknown keys,
    /// and [`ConfigError::Invalid`] when validation fails.
    pub fn from_toml_str(document: &str) -> ConfigResult<Self> {
        let settings: Self = toml::from_str(document)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reads, parses, and validates the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] when the file cannot be read, otherwise as
    /// [`RuntimeSettings::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = Self::from_toml_str(&document)?;
        info!(path = %path.display(), "loaded runtime settings");
        Ok(settings)
    }

    /// Applies `AMP_*` overrides read through `lookup`.
    ///
    /// Recognised variables: `AMP_MAX_MESSAGE_BYTES`, `AMP_CLOCK_SKEW_SECS`,
    /// `AMP_MAX_CONCURRENCY`, `AMP_DEFAULT_TIMEOUT_MS`, `AMP_LOG`,
    /// `AMP_REQUIRE_AUTH`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOverride`] for unparsable values and
    /// [`ConfigError::Invalid`] when the result fails validation.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = parsed(&lookup, "AMP_MAX_MESSAGE_BYTES")? {
            self.protocol.max_message_bytes = value;
        }
        if let Some(value) = parsed(&lookup, "AMP_CLOCK_SKEW_SECS")? {
            self.protocol.clock_skew_secs = value;
        }
        if let Some(value) = parsed(&lookup, "AMP_MAX_CONCURRENCY")? {
            self.dispatch.max_concurrency = value;
        }
        if let Some(value) = parsed(&lookup, "AMP_DEFAULT_TIMEOUT_MS")? {
            self.dispatch.default_timeout_ms = value;
        }
        if let Some(value) = lookup("AMP_LOG") {
            debug!(filter = %value, "log filter overridden from environment");
            self.telemetry.filter = value;
        }
        if let Some(raw) = lookup("AMP_REQUIRE_AUTH") {
            self.security.require_authentication = parse_flag("AMP_REQUIRE_AUTH", &raw)?;
        }
        self.validate()
    }

    /// Applies overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Same as [`RuntimeSettings::apply_env_overrides`].
    pub fn apply_process_env(&mut self) -> ConfigResult<()> {
        self.apply_env_overrides(|name| std::env::var(name).ok())
    }

    /// Checks cross-field invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> ConfigResult<()> {
        let checks: [(bool, &'static str, &'static str); 9] = [
            (self.protocol.max_message_bytes > 0, "protocol.max_message_bytes", "must be greater than zero"),
            (self.protocol.supported_major > 0, "protocol.supported_major", "must be greater than zero"),
            (self.security.replay_capacity > 0, "security.replay_capacity", "must be greater than zero"),
            (self.dispatch.max_concurrency > 0, "dispatch.max_concurrency", "must be greater than zero"),
            (self.dispatch.default_timeout_ms > 0, "dispatch.default_timeout_ms", "must be greater than zero"),
            (self.retry.max_attempts > 0, "retry.max_attempts", "must be at least 1"),
            (self.retry.multiplier >= 1.0, "retry.multiplier", "must be at least 1.0"),
            (
                self.retry.base_delay_ms <= self.retry.max_delay_ms,
                "retry.base_delay_ms",
                "cannot exceed retry.max_delay_ms",
            ),
            (self.context.sweep_interval_secs > 0, "context.sweep_interval_secs", "must be greater than zero"),
        ];
        for (ok, field, reason) in checks {
            if !ok {
                return Err(ConfigError::Invalid { field, reason });
            }
        }
        if self.context.default_ttl_secs == Some(0) {
            return Err(ConfigError::Invalid {
                field: "context.default_ttl_secs",
                reason: "must be greater than zero",
            });
        }
        Ok(())
    }
}

fn parsed<F, T>(lookup: &F, var: &'static str) -> ConfigResult<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(var)
        .map(|raw| {
            raw.trim().parse().map_err(|err: T::Err| ConfigError::InvalidOverride {
                var,
                value: raw.clone(),
                reason: err.to_string(),
            })
        })
        .transpose()
}

fn parse_flag(var: &'static str, raw: &str) -> ConfigResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidOverride {
            var,
            value: raw.to_owned(),
            reason: "expected a boolean".to_owned(),
        }),
    }
}
