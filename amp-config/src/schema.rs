//! Strongly typed settings schema.
//!
//! Every field is defaulted so an empty document is a valid configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root of the runtime settings document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeSettings {
    /// Wire protocol limits.
    pub protocol: ProtocolSettings,
    /// Authentication, integrity, and replay settings.
    pub security: SecuritySettings,
    /// Dispatcher settings.
    pub dispatch: DispatchSettings,
    /// Outbound retry policy.
    pub retry: RetrySettings,
    /// Context store settings.
    pub context: ContextSettings,
    /// Logging settings.
    pub telemetry: TelemetrySettings,
}

/// `[protocol]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProtocolSettings {
    /// Largest accepted wire message, in bytes.
    pub max_message_bytes: usize,
    /// Accepted distance between message timestamps and local time.
    pub clock_skew_secs: u64,
    /// Protocol major version spoken by this runtime.
    pub supported_major: u32,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            max_message_bytes: 1024 * 1024,
            clock_skew_secs: 300,
            supported_major: 1,
        }
    }
}

impl ProtocolSettings {
    /// Clock skew as a [`Duration`].
    #[must_use]
    pub const fn clock_skew(&self) -> Duration {
        Duration::from_secs(self.clock_skew_secs)
    }
}

/// Identity bound to an API key or HMAC key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentitySettings {
    /// Agent id.
    pub agent: String,
    /// Display name; defaults to the agent id.
    #[serde(default)]
    pub name: Option<String>,
    /// Agent version; defaults to `0.0.0`.
    #[serde(default)]
    pub version: Option<String>,
}

/// `[security.jwt]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JwtSettings {
    /// HS256 shared secret.
    pub secret: String,
    /// Required `iss` claim.
    pub issuer: String,
    /// Required `aud` claim, if any.
    #[serde(default)]
    pub audience: Option<String>,
    /// Leeway applied to `exp`/`nbf`.
    #[serde(default = "default_leeway")]
    pub leeway_secs: u64,
}

const fn default_leeway() -> u64 {
    30
}

/// `[security.hmac_keys.<key_id>]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HmacKeySettings {
    /// Shared secret.
    pub secret: String,
    /// Agent authenticated by this key.
    pub agent: String,
}

/// Key material for message signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignatureKeySettings {
    /// `hmac-sha256` or `ed25519`.
    pub algorithm: String,
    /// HMAC secret text, or hex-encoded ed25519 key (public key for
    /// verification, 32-byte seed for signing).
    pub key: String,
}

/// `[security.signing]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SigningSettings {
    /// Key id advertised in `headers.signature.key_id`.
    pub key_id: String,
    /// `hmac-sha256` or `ed25519`.
    pub algorithm: String,
    /// HMAC secret text, or hex-encoded 32-byte ed25519 seed.
    pub key: String,
}

/// `[security]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecuritySettings {
    /// Reject messages without credentials.
    pub require_authentication: bool,
    /// Reject unsigned messages.
    pub require_signature: bool,
    /// Replay cache capacity, in (source, nonce) entries.
    pub replay_capacity: usize,
    /// API key to identity.
    pub api_keys: BTreeMap<String, IdentitySettings>,
    /// JWT verification.
    pub jwt: Option<JwtSettings>,
    /// HMAC credential keys by key id.
    pub hmac_keys: BTreeMap<String, HmacKeySettings>,
    /// Signature verification keys by key id (or source agent id).
    pub signature_keys: BTreeMap<String, SignatureKeySettings>,
    /// Outbound signing key.
    pub signing: Option<SigningSettings>,
    /// Hex-encoded AES-256-GCM keys by key id.
    pub encryption_keys: BTreeMap<String, String>,
    /// Capability id to the agents allowed to invoke it.
    pub allow: BTreeMap<String, Vec<String>>,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            require_authentication: false,
            require_signature: false,
            replay_capacity: 100_000,
            api_keys: BTreeMap::new(),
            jwt: None,
            hmac_keys: BTreeMap::new(),
            signature_keys: BTreeMap::new(),
            signing: None,
            encryption_keys: BTreeMap::new(),
            allow: BTreeMap::new(),
        }
    }
}

/// `[dispatch]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchSettings {
    /// Deadline applied when neither the request nor the capability sets one.
    pub default_timeout_ms: u64,
    /// Maximum concurrently executing handlers.
    pub max_concurrency: usize,
    /// Create a context on first use of an unknown session id.
    pub auto_create_sessions: bool,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            max_concurrency: 32,
            auto_create_sessions: false,
        }
    }
}

impl DispatchSettings {
    /// Default deadline as a [`Duration`].
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// `[retry]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Upper bound on a single delay.
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_attempts: 3,
            max_delay_ms: 30_000,
        }
    }
}

/// `[context]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContextSettings {
    /// Lifetime of contexts created without an explicit ttl.
    pub default_ttl_secs: Option<u64>,
    /// Interval of the expiry sweep.
    pub sweep_interval_secs: u64,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            default_ttl_secs: None,
            sweep_interval_secs: 60,
        }
    }
}

/// `[telemetry]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetrySettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            filter: "info".to_owned(),
            json: false,
        }
    }
}
