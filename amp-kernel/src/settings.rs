//! Maps [`RuntimeSettings`] onto the runtime builder.

use std::sync::Arc;
use std::time::Duration;

use amp_codec::CodecConfig;
use amp_config::{IdentitySettings, JwtSettings, RuntimeSettings, SecuritySettings};
use amp_context::{ContextConfig, ContextStore};
use amp_primitives::{AgentId, AgentIdentity, CapabilityId};
use amp_security::{
    AccessRule, AesGcmCipher, ApiKeyVerifier, Authenticator, HmacKey, HmacVerifier, JwtConfig,
    JwtVerifier, MessageSigner, RuleBasedPolicy, SecurityConfig, SecurityEnvelope, SignatureVerifier,
    SigningSecret, VerificationKey,
};
use tracing::debug;

use crate::retry::RetryPolicy;
use crate::runtime::AgentRuntimeBuilder;
use crate::scheduler::SchedulerConfig;
use crate::RuntimeResult;

const DEFAULT_IDENTITY_VERSION: &str = "0.0.0";

impl AgentRuntimeBuilder {
    /// Applies every section of `settings`.
    ///
    /// The replay window follows `protocol.clock_skew_secs`. A context store
    /// or security envelope set earlier on the builder is replaced.
    ///
    /// # Errors
    ///
    /// Returns the first invalid value: unparsable ids, malformed keys, a
    /// zero concurrency limit, or a bad retry policy.
    pub fn with_settings(mut self, settings: &RuntimeSettings) -> RuntimeResult<Self> {
        let protocol = &settings.protocol;
        self.codec = CodecConfig {
            max_message_bytes: protocol.max_message_bytes,
            clock_skew: protocol.clock_skew(),
            supported_major: protocol.supported_major,
        };
        self.security = Some(security_envelope(&settings.security, protocol.clock_skew())?);

        let dispatch = &settings.dispatch;
        self.scheduler = SchedulerConfig::with_limit(dispatch.max_concurrency)?;
        self.default_timeout = dispatch.default_timeout();
        self.auto_create_sessions = dispatch.auto_create_sessions;

        self.retry = RetryPolicy::from_settings(&settings.retry)?;

        let context = &settings.context;
        self.contexts = Some(Arc::new(ContextStore::new(ContextConfig {
            default_ttl: context.default_ttl_secs.map(Duration::from_secs),
        })?));
        self.sweep_interval = Duration::from_secs(context.sweep_interval_secs);

        debug!(agent = %self.identity.id(), "runtime settings applied");
        Ok(self)
    }
}

/// Builds a [`SecurityEnvelope`] from `[security]`.
///
/// # Errors
///
/// Returns [`crate::RuntimeError::Model`] for invalid agent ids, or
/// [`crate::RuntimeError::Security`] for malformed keys.
pub fn security_envelope(
    settings: &SecuritySettings,
    replay_window: Duration,
) -> RuntimeResult<SecurityEnvelope> {
    let mut authenticator = Authenticator::default();

    if !settings.api_keys.is_empty() {
        let mut api_keys = ApiKeyVerifier::default();
        for (key, identity) in &settings.api_keys {
            api_keys.insert(key, identity_from(identity)?);
        }
        authenticator = authenticator.with_api_keys(api_keys);
    }

    if let Some(jwt) = &settings.jwt {
        authenticator = authenticator.with_jwt(JwtVerifier::new(&jwt_config(jwt)));
    }

    if !settings.hmac_keys.is_empty() {
        let mut hmac = HmacVerifier::default();
        for (key_id, key) in &settings.hmac_keys {
            hmac.insert(
                key_id.clone(),
                HmacKey {
                    secret: key.secret.as_bytes().to_vec(),
                    identity: plain_identity(&key.agent)?,
                },
            );
        }
        authenticator = authenticator.with_hmac(hmac);
    }

    let mut verifier = SignatureVerifier::default();
    for (key_id, key) in &settings.signature_keys {
        verifier.insert(
            key_id.clone(),
            VerificationKey::from_encoded(&key.algorithm, &key.key)?,
        );
    }

    let policy = RuleBasedPolicy::allow_all();
    for (capability, agents) in &settings.allow {
        let agents = agents
            .iter()
            .map(AgentId::new)
            .collect::<Result<Vec<_>, _>>()?;
        for rule in AccessRule::allow_list(CapabilityId::new(capability.as_str())?, agents)? {
            policy.add_rule(rule);
        }
    }

    let mut builder = SecurityEnvelope::builder(SecurityConfig {
        require_authentication: settings.require_authentication,
        require_signature: settings.require_signature,
        replay_capacity: settings.replay_capacity,
        replay_window,
    })
    .authenticator(authenticator)
    .signature_verifier(verifier)
    .policy(Arc::new(policy));

    if let Some(signing) = &settings.signing {
        let secret = SigningSecret::from_encoded(&signing.algorithm, &signing.key)?;
        builder = builder.signer(MessageSigner::new(signing.key_id.clone(), secret));
    }

    if !settings.encryption_keys.is_empty() {
        let mut cipher = AesGcmCipher::default();
        for (key_id, key) in &settings.encryption_keys {
            cipher.insert_hex_key(key_id.clone(), key)?;
        }
        builder = builder.cipher(cipher);
    }

    Ok(builder.build()?)
}

fn jwt_config(settings: &JwtSettings) -> JwtConfig {
    JwtConfig {
        secret: settings.secret.as_bytes().to_vec(),
        issuer: settings.issuer.clone(),
        audience: settings.audience.clone(),
        leeway_secs: settings.leeway_secs,
    }
}

fn identity_from(settings: &IdentitySettings) -> RuntimeResult<AgentIdentity> {
    let id = AgentId::new(settings.agent.as_str())?;
    let name = settings.name.clone().unwrap_or_else(|| settings.agent.clone());
    let version = settings
        .version
        .clone()
        .unwrap_or_else(|| DEFAULT_IDENTITY_VERSION.to_owned());
    Ok(AgentIdentity::builder(id)
        .name(name)?
        .version(version)?
        .build()?)
}

fn plain_identity(agent: &str) -> RuntimeResult<AgentIdentity> {
    identity_from(&IdentitySettings {
        agent: agent.to_owned(),
        name: None,
        version: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AgentRuntime, RuntimeError};
    use amp_config::{HmacKeySettings, SigningSettings};
    use amp_primitives::ErrorCode;

    fn identity() -> AgentIdentity {
        plain_identity("agent-a").unwrap()
    }

    const TOML: &str = r#"
        [protocol]
        max_message_bytes = 65536
        clock_skew_secs = 120

        [security]
        require_authentication = true

        [security.api_keys.k-1]
        agent = "agent-b"

        [security.hmac_keys.h-1]
        secret = "shared"
        agent = "agent-c"

        [security.encryption_keys]
        primary = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f"

        [security.allow]
        translate = ["agent-b"]

        [dispatch]
        max_concurrency = 4
        default_timeout_ms = 2000
        auto_create_sessions = true

        [retry]
        max_attempts = 5
    "#;

    #[test]
    fn settings_flow_into_runtime() {
        let settings = RuntimeSettings::from_toml_str(TOML).unwrap();
        let runtime = AgentRuntime::builder(identity())
            .with_settings(&settings)
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(runtime.codec().config().max_message_bytes, 65_536);
        assert_eq!(runtime.codec().config().clock_skew, Duration::from_secs(120));
        assert_eq!(runtime.security().config().replay_window, Duration::from_secs(120));
        assert!(runtime.security().config().require_authentication);
        assert_eq!(runtime.scheduler().config().max_concurrency().get(), 4);
        assert_eq!(runtime.retry_policy().max_attempts(), 5);
        assert!(runtime.security().payload_cipher().is_some());
    }

    #[tokio::test]
    async fn allow_list_becomes_policy() {
        let settings = RuntimeSettings::from_toml_str(TOML).unwrap();
        let envelope = security_envelope(&settings.security, Duration::from_secs(60)).unwrap();
        let translate = CapabilityId::new("translate").unwrap();
        let b = AgentId::new("agent-b").unwrap();
        let c = AgentId::new("agent-c").unwrap();

        envelope.authorize(Some(&b), &translate).await.unwrap();
        let err = envelope.authorize(Some(&c), &translate).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::AuthenticationFailed);
        envelope
            .authorize(Some(&c), &CapabilityId::new("echo").unwrap())
            .await
            .unwrap();
    }

    #[test]
    fn bad_key_material_is_rejected() {
        let mut settings = SecuritySettings::default();
        settings
            .encryption_keys
            .insert("short".into(), "abcd".into());
        assert!(matches!(
            security_envelope(&settings, Duration::from_secs(60)),
            Err(RuntimeError::Security(_))
        ));

        let mut settings = SecuritySettings::default();
        settings.hmac_keys.insert(
            "h-1".into(),
            HmacKeySettings {
                secret: "s".into(),
                agent: "has space".into(),
            },
        );
        assert!(matches!(
            security_envelope(&settings, Duration::from_secs(60)),
            Err(RuntimeError::Model(_))
        ));

        let mut settings = SecuritySettings::default();
        settings.signing = Some(SigningSettings {
            key_id: "sig-1".into(),
            algorithm: "rot13".into(),
            key: "k".into(),
        });
        assert!(security_envelope(&settings, Duration::from_secs(60)).is_err());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut settings = RuntimeSettings::default();
        settings.dispatch.max_concurrency = 0;
        assert!(matches!(
            AgentRuntime::builder(identity()).with_settings(&settings),
            Err(RuntimeError::Scheduler(_))
        ));
    }
}
