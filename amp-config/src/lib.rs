//! Layered settings for the AMP runtime: TOML documents with `AMP_*`
//! environment overrides.

#![warn(missing_docs, clippy::pedantic)]

mod error;
mod loader;
mod schema;

pub use error::{ConfigError, ConfigResult};
pub use schema::{
    ContextSettings, DispatchSettings, HmacKeySettings, IdentitySettings, JwtSettings,
    ProtocolSettings, RetrySettings, RuntimeSettings, SecuritySettings, SignatureKeySettings,
    SigningSettings, TelemetrySettings,
};
