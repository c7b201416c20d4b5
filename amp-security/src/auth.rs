//! Credential verification, one verifier per mechanism.
//!
//! [`Authenticator`] dispatches on the `type` discriminator of
//! [`Credentials`]; each mechanism resolves to an [`AgentIdentity`].

use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

use amp_codec::signing_string;
use amp_primitives::{AgentId, AgentIdentity, Credentials, Message};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use rustls::server::{AllowAnyAuthenticatedClient, ClientCertVerifier};
use rustls::{Certificate, RootCertStore};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::{SecurityError, SecurityResult};

type HmacSha256 = Hmac<Sha256>;

/// Looks up API keys by digest with constant-time comparison.
#[derive(Default)]
pub struct ApiKeyVerifier {
    keys: Vec<([u8; 32], AgentIdentity)>,
}

impl fmt::Debug for ApiKeyVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyVerifier")
            .field("keys", &self.keys.len())
            .finish()
    }
}

impl ApiKeyVerifier {
    /// Registers an API key for `identity`.
    pub fn insert(&mut self, key: &str, identity: AgentIdentity) {
        self.keys.push((digest(key.as_bytes()), identity));
    }

    /// Resolves the identity behind `key`.
    ///
    /// Every stored key is compared so timing does not reveal which one matched.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::AuthenticationFailed`] for unknown keys.
    pub fn verify(&self, key: &str) -> SecurityResult<AgentIdentity> {
        let presented = digest(key.as_bytes());
        let mut found = None;
        for (stored, identity) in &self.keys {
            if bool::from(stored.ct_eq(&presented)) && found.is_none() {
                found = Some(identity);
            }
        }
        found
            .cloned()
            .ok_or_else(|| SecurityError::auth("unknown api key"))
    }
}

fn digest(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

/// Settings for HS256 token verification.
#[derive(Clone, Debug)]
pub struct JwtConfig {
    /// Shared HMAC secret.
    pub secret: Vec<u8>,
    /// Required `iss` claim.
    pub issuer: String,
    /// Required `aud` claim, if any.
    pub audience: Option<String>,
    /// Clock leeway for `exp`/`nbf`, in seconds.
    pub leeway_secs: u64,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    framework: Option<String>,
}

/// Verifies JSON web tokens and maps their claims onto an identity.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtVerifier")
            .field("issuer", &self.validation.iss)
            .finish_non_exhaustive()
    }
}

impl JwtVerifier {
    /// Builds a verifier that checks signature, expiry, and issuer.
    #[must_use]
    pub fn new(config: &JwtConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        validation.leeway = config.leeway_secs;
        match &config.audience {
            Some(audience) => validation.set_audience(&[audience.as_str()]),
            None => validation.validate_aud = false,
        }
        Self {
            key: DecodingKey::from_secret(&config.secret),
            validation,
        }
    }

    /// Verifies `token` and returns the identity in its claims.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::AuthenticationFailed`] when the token is
    /// malformed, expired, mis-signed, or names an invalid subject.
    pub fn verify(&self, token: &str) -> SecurityResult<AgentIdentity> {
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|err| SecurityError::auth(format!("jwt rejected: {err}")))?;
        let claims = data.claims;
        let id = AgentId::new(claims.sub.clone())
            .map_err(|err| SecurityError::auth(format!("jwt subject invalid: {err}")))?;
        identity_from_parts(
            id,
            claims.name.unwrap_or(claims.sub),
            claims.version,
            claims.framework,
        )
    }
}

fn identity_from_parts(
    id: AgentId,
    name: String,
    version: Option<String>,
    framework: Option<String>,
) -> SecurityResult<AgentIdentity> {
    let mut builder = AgentIdentity::builder(id)
        .name(name)
        .and_then(|b| b.version(version.unwrap_or_else(|| "unknown".to_owned())))
        .map_err(|err| SecurityError::auth(err.to_string()))?;
    if let Some(framework) = framework {
        builder = builder.framework(framework);
    }
    builder
        .build()
        .map_err(|err| SecurityError::auth(err.to_string()))
}

/// Leaf-key algorithms accepted for the mTLS proof of possession.
static PROOF_ALGORITHMS: &[&webpki::SignatureAlgorithm] = &[
    &webpki::ED25519,
    &webpki::ECDSA_P256_SHA256,
    &webpki::ECDSA_P384_SHA384,
    &webpki::RSA_PKCS1_2048_8192_SHA256,
    &webpki::RSA_PSS_2048_8192_SHA256_LEGACY_KEY,
];

/// Verifies client certificate chains against trusted roots.
///
/// A chain alone is public, so the sender must also sign the message signing
/// string with the leaf certificate's private key. The peer identity is looked
/// up by the SHA-256 fingerprint of the leaf certificate.
pub struct MtlsVerifier {
    verifier: AllowAnyAuthenticatedClient,
    identities: HashMap<String, AgentIdentity>,
}

impl fmt::Debug for MtlsVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MtlsVerifier")
            .field("identities", &self.identities.len())
            .finish_non_exhaustive()
    }
}

impl MtlsVerifier {
    /// Builds a verifier from DER-encoded root certificates.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::InvalidConfig`] when no usable root is supplied.
    pub fn new(roots_der: &[Vec<u8>], identities: HashMap<String, AgentIdentity>) -> SecurityResult<Self> {
        let mut roots = RootCertStore::empty();
        for der in roots_der {
            roots
                .add(&Certificate(der.clone()))
                .map_err(|err| SecurityError::config(format!("bad trust root: {err}")))?;
        }
        if roots.is_empty() {
            return Err(SecurityError::config("mtls requires at least one trust root"));
        }
        let identities = identities
            .into_iter()
            .map(|(fingerprint, identity)| (fingerprint.to_ascii_lowercase(), identity))
            .collect();
        Ok(Self {
            verifier: AllowAnyAuthenticatedClient::new(roots),
            identities,
        })
    }

    /// Verifies a base64 DER chain (leaf first) plus the leaf key's `proof`
    /// over `message`, and returns the mapped identity.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::AuthenticationFailed`] for empty, undecodable,
    /// or untrusted chains, for a proof the leaf key did not make, and for
    /// leaves with no mapped identity.
    pub fn verify(&self, chain: &[String], proof: &str, message: &Message) -> SecurityResult<AgentIdentity> {
        let mut certs = chain
            .iter()
            .map(|encoded| {
                STANDARD
                    .decode(encoded)
                    .map(Certificate)
                    .map_err(|err| SecurityError::auth(format!("certificate not base64: {err}")))
            })
            .collect::<SecurityResult<Vec<_>>>()?;
        if certs.is_empty() {
            return Err(SecurityError::auth("empty certificate chain"));
        }
        let leaf = certs.remove(0);

        self.verifier
            .verify_client_cert(&leaf, &certs, SystemTime::now())
            .map_err(|err| SecurityError::auth(format!("certificate rejected: {err}")))?;
        verify_possession(&leaf.0, proof, message)?;

        let fingerprint = hex::encode(digest(&leaf.0));
        self.identities
            .get(&fingerprint)
            .cloned()
            .ok_or_else(|| SecurityError::auth(format!("no identity for certificate {fingerprint}")))
    }
}

fn verify_possession(leaf_der: &[u8], proof: &str, message: &Message) -> SecurityResult<()> {
    let proof = STANDARD
        .decode(proof)
        .map_err(|err| SecurityError::auth(format!("mtls proof not base64: {err}")))?;
    let leaf = webpki::EndEntityCert::try_from(leaf_der)
        .map_err(|err| SecurityError::auth(format!("unreadable leaf certificate: {err:?}")))?;
    let signed = signing_string(message);
    if PROOF_ALGORITHMS
        .iter()
        .any(|algorithm| leaf.verify_signature(algorithm, signed.as_bytes(), &proof).is_ok())
    {
        Ok(())
    } else {
        Err(SecurityError::auth("mtls proof not made by the certificate key"))
    }
}

/// Builds `mtls` credentials for `message` from a DER chain (leaf first).
///
/// `sign` receives the message signing string and must return a signature
/// made with the leaf certificate's private key.
#[must_use]
pub fn mtls_credentials(
    chain_der: &[Vec<u8>],
    message: &Message,
    sign: impl FnOnce(&[u8]) -> Vec<u8>,
) -> Credentials {
    Credentials::Mtls {
        certificate_chain: chain_der.iter().map(|der| STANDARD.encode(der)).collect(),
        proof: STANDARD.encode(sign(signing_string(message).as_bytes())),
    }
}

/// Shared secret used by the `hmac` mechanism.
#[derive(Clone)]
pub struct HmacKey {
    /// Secret bytes.
    pub secret: Vec<u8>,
    /// Identity the key authenticates as.
    pub identity: AgentIdentity,
}

impl fmt::Debug for HmacKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HmacKey")
            .field("identity", &self.identity.id())
            .finish_non_exhaustive()
    }
}

/// Recomputes HMAC-SHA256 over the canonical signing string.
#[derive(Debug, Default)]
pub struct HmacVerifier {
    keys: HashMap<String, HmacKey>,
}

impl HmacVerifier {
    /// Registers a key.
    pub fn insert(&mut self, key_id: impl Into<String>, key: HmacKey) {
        self.keys.insert(key_id.into(), key);
    }

    /// Verifies a MAC over `message`.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::AuthenticationFailed`] for unknown keys or bad MACs.
    pub fn verify(&self, key_id: &str, signature: &str, message: &Message) -> SecurityResult<AgentIdentity> {
        let key = self
            .keys
            .get(key_id)
            .ok_or_else(|| SecurityError::auth(format!("unknown hmac key `{key_id}`")))?;
        let expected = STANDARD
            .decode(signature)
            .map_err(|err| SecurityError::auth(format!("hmac not base64: {err}")))?;
        let mut mac = HmacSha256::new_from_slice(&key.secret)
            .map_err(|err| SecurityError::config(err.to_string()))?;
        mac.update(signing_string(message).as_bytes());
        mac.verify_slice(&expected)
            .map_err(|_| SecurityError::auth("hmac mismatch"))?;
        Ok(key.identity.clone())
    }
}

/// Computes the base64 HMAC credential for `message` under `secret`.
///
/// # Errors
///
/// Returns [`SecurityError::InvalidConfig`] if the secret is unusable.
pub fn hmac_credential(secret: &[u8], message: &Message) -> SecurityResult<String> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|err| SecurityError::config(err.to_string()))?;
    mac.update(signing_string(message).as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Authenticates credentials by mechanism.
///
/// A mechanism without a configured verifier rejects every credential of
/// that type.
#[derive(Debug, Default)]
pub struct Authenticator {
    api_keys: Option<ApiKeyVerifier>,
    jwt: Option<JwtVerifier>,
    mtls: Option<MtlsVerifier>,
    hmac: Option<HmacVerifier>,
}

impl Authenticator {
    /// Enables API key authentication.
    #[must_use]
    pub fn with_api_keys(mut self, verifier: ApiKeyVerifier) -> Self {
        self.api_keys = Some(verifier);
        self
    }

    /// Enables JWT authentication.
    #[must_use]
    pub fn with_jwt(mut self, verifier: JwtVerifier) -> Self {
        self.jwt = Some(verifier);
        self
    }

    /// Enables mutual TLS authentication.
    #[must_use]
    pub fn with_mtls(mut self, verifier: MtlsVerifier) -> Self {
        self.mtls = Some(verifier);
        self
    }

    /// Enables HMAC authentication.
    #[must_use]
    pub fn with_hmac(mut self, verifier: HmacVerifier) -> Self {
        self.hmac = Some(verifier);
        self
    }

    /// Resolves `credentials` presented with `message` to an identity.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::AuthenticationFailed`] when the mechanism is
    /// disabled or the credentials do not verify.
    pub fn authenticate(&self, credentials: &Credentials, message: &Message) -> SecurityResult<AgentIdentity> {
        let mechanism = credentials.mechanism();
        let disabled = || SecurityError::auth(format!("{mechanism} authentication not enabled"));
        let identity = match credentials {
            Credentials::ApiKey(key) => self.api_keys.as_ref().ok_or_else(disabled)?.verify(key),
            Credentials::Jwt(token) => self.jwt.as_ref().ok_or_else(disabled)?.verify(token),
            Credentials::Mtls {
                certificate_chain,
                proof,
            } => self
                .mtls
                .as_ref()
                .ok_or_else(disabled)?
                .verify(certificate_chain, proof, message),
            Credentials::Hmac { key_id, signature } => self
                .hmac
                .as_ref()
                .ok_or_else(disabled)?
                .verify(key_id, signature, message),
        }?;
        debug!(mechanism, agent = %identity.id(), "authenticated");
        Ok(identity)
    }
}

/// Interprets an HTTP bearer token: three dot-separated segments is a JWT,
/// anything else an API key.
#[must_use]
pub fn bearer_credentials(token: &str) -> Credentials {
    let token = token.trim();
    if token.split('.').count() == 3 {
        Credentials::Jwt(token.to_owned())
    } else {
        Credentials::ApiKey(token.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amp_primitives::{Endpoint, MessageType};
    use jsonwebtoken::{EncodingKey, Header, encode};
    use rcgen::{
        BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
        ExtendedKeyUsagePurpose, IsCa,
    };
    use ring::signature::Ed25519KeyPair;
    use serde_json::json;

    fn identity(id: &str) -> AgentIdentity {
        AgentIdentity::builder(AgentId::new(id).unwrap())
            .name(id)
            .unwrap()
            .version("1.0.0")
            .unwrap()
            .build()
            .unwrap()
    }

    fn message() -> Message {
        Message::new(
            MessageType::Event,
            Endpoint::agent(AgentId::new("agent-a").unwrap()),
            Endpoint::default(),
            json!({"event": "x"}),
        )
    }

    fn jwt_config() -> JwtConfig {
        JwtConfig {
            secret: b"jwt-secret".to_vec(),
            issuer: "mesh-ca".into(),
            audience: None,
            leeway_secs: 0,
        }
    }

    fn token(iss: &str, exp_offset: i64) -> String {
        let now = chrono::Utc::now().timestamp();
        encode(
            &Header::default(),
            &json!({"sub": "agent-a", "name": "Analyzer", "iss": iss, "iat": now, "exp": now + exp_offset}),
            &EncodingKey::from_secret(b"jwt-secret"),
        )
        .unwrap()
    }

    #[test]
    fn api_key_lookup() {
        let mut keys = ApiKeyVerifier::default();
        keys.insert("key-a", identity("agent-a"));
        keys.insert("key-b", identity("agent-b"));
        assert_eq!(keys.verify("key-b").unwrap().id().as_str(), "agent-b");
        assert!(keys.verify("key-c").is_err());
    }

    #[test]
    fn jwt_checks_issuer_and_expiry() {
        let verifier = JwtVerifier::new(&jwt_config());
        let identity = verifier.verify(&token("mesh-ca", 600)).unwrap();
        assert_eq!(identity.id().as_str(), "agent-a");
        assert_eq!(identity.name(), "Analyzer");

        assert!(verifier.verify(&token("someone-else", 600)).is_err());
        assert!(verifier.verify(&token("mesh-ca", -600)).is_err());
    }

    #[test]
    fn hmac_recomputes_over_signing_string() {
        let mut verifier = HmacVerifier::default();
        verifier.insert(
            "k1",
            HmacKey {
                secret: b"shared".to_vec(),
                identity: identity("agent-a"),
            },
        );
        let mut message = message();
        let mac = hmac_credential(b"shared", &message).unwrap();
        assert!(verifier.verify("k1", &mac, &message).is_ok());

        message.payload = json!({"event": "tampered"});
        assert!(verifier.verify("k1", &mac, &message).is_err());
    }

    #[test]
    fn mtls_requires_usable_root() {
        let err = MtlsVerifier::new(&[], HashMap::new()).unwrap_err();
        assert!(matches!(err, SecurityError::InvalidConfig { .. }));

        let err = MtlsVerifier::new(&[vec![0x30, 0x03, 0x01]], HashMap::new()).unwrap_err();
        assert!(matches!(err, SecurityError::InvalidConfig { .. }));
    }

    struct Pki {
        root_der: Vec<u8>,
        leaf_der: Vec<u8>,
        leaf_key: Ed25519KeyPair,
    }

    fn ed25519_params(common_name: &str) -> CertificateParams {
        let mut params = CertificateParams::new(vec![format!("{common_name}.mesh.local")]);
        params.alg = &rcgen::PKCS_ED25519;
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, common_name);
        params
    }

    fn pki(leaf_name: &str) -> Pki {
        let mut ca_params = ed25519_params("mesh-ca");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca = Certificate::from_params(ca_params).unwrap();

        let mut leaf_params = ed25519_params(leaf_name);
        leaf_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let leaf = Certificate::from_params(leaf_params).unwrap();

        Pki {
            root_der: ca.serialize_der().unwrap(),
            leaf_der: leaf.serialize_der_with_signer(&ca).unwrap(),
            leaf_key: Ed25519KeyPair::from_pkcs8(&leaf.serialize_private_key_der()).unwrap(),
        }
    }

    fn stray_key() -> Ed25519KeyPair {
        let rng = ring::rand::SystemRandom::new();
        let document = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        Ed25519KeyPair::from_pkcs8(document.as_ref()).unwrap()
    }

    fn fingerprint(der: &[u8]) -> String {
        hex::encode(Sha256::digest(der))
    }

    fn mtls_verifier(pki: &Pki) -> MtlsVerifier {
        let identities = HashMap::from([(fingerprint(&pki.leaf_der), identity("agent-a"))]);
        MtlsVerifier::new(&[pki.root_der.clone()], identities).unwrap()
    }

    fn verify_mtls(verifier: &MtlsVerifier, credentials: &Credentials, message: &Message) -> SecurityResult<AgentIdentity> {
        let Credentials::Mtls {
            certificate_chain,
            proof,
        } = credentials
        else {
            panic!("not mtls credentials");
        };
        verifier.verify(certificate_chain, proof, message)
    }

    #[test]
    fn mtls_chain_with_proof_resolves_identity() {
        let pki = pki("agent-a");
        let verifier = mtls_verifier(&pki);
        let message = message();
        let credentials = mtls_credentials(&[pki.leaf_der.clone()], &message, |signed| {
            pki.leaf_key.sign(signed).as_ref().to_vec()
        });

        let identity = verify_mtls(&verifier, &credentials, &message).unwrap();
        assert_eq!(identity.id().as_str(), "agent-a");

        let authenticator = Authenticator::default().with_mtls(verifier);
        assert!(authenticator.authenticate(&credentials, &message).is_ok());
    }

    #[test]
    fn mtls_copied_chain_without_the_key_rejected() {
        let pki = pki("agent-a");
        let verifier = mtls_verifier(&pki);
        let captured = message();
        let captured_credentials = mtls_credentials(&[pki.leaf_der.clone()], &captured, |signed| {
            pki.leaf_key.sign(signed).as_ref().to_vec()
        });

        let forged = message();
        assert!(verify_mtls(&verifier, &captured_credentials, &forged).is_err());

        let other_key = stray_key();
        let self_signed = mtls_credentials(&[pki.leaf_der.clone()], &forged, |signed| {
            other_key.sign(signed).as_ref().to_vec()
        });
        let err = verify_mtls(&verifier, &self_signed, &forged).unwrap_err();
        assert!(matches!(err, SecurityError::AuthenticationFailed { .. }));

        let empty_proof = Credentials::Mtls {
            certificate_chain: vec![STANDARD.encode(&pki.leaf_der)],
            proof: String::new(),
        };
        assert!(verify_mtls(&verifier, &empty_proof, &forged).is_err());
    }

    #[test]
    fn mtls_untrusted_or_unmapped_chain_rejected() {
        let trusted = pki("agent-a");
        let verifier = mtls_verifier(&trusted);
        let message = message();

        let rogue = pki("agent-a");
        let credentials = mtls_credentials(&[rogue.leaf_der.clone()], &message, |signed| {
            rogue.leaf_key.sign(signed).as_ref().to_vec()
        });
        let err = verify_mtls(&verifier, &credentials, &message).unwrap_err();
        assert!(matches!(err, SecurityError::AuthenticationFailed { .. }));

        let unmapped = MtlsVerifier::new(&[trusted.root_der.clone()], HashMap::new()).unwrap();
        let credentials = mtls_credentials(&[trusted.leaf_der.clone()], &message, |signed| {
            trusted.leaf_key.sign(signed).as_ref().to_vec()
        });
        assert!(verify_mtls(&unmapped, &credentials, &message).is_err());
    }

    #[test]
    fn disabled_mechanism_rejected() {
        let auth = Authenticator::default();
        let err = auth
            .authenticate(&Credentials::ApiKey("x".into()), &message())
            .unwrap_err();
        assert!(matches!(err, SecurityError::AuthenticationFailed { .. }));
    }

    #[test]
    fn bearer_discrimination() {
        assert!(matches!(bearer_credentials("a.b.c"), Credentials::Jwt(_)));
        assert!(matches!(bearer_credentials("plain-key"), Credentials::ApiKey(_)));
    }
}
