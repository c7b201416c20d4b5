//! Security envelope for Agent Mesh Protocol agents.
//!
//! Inbound messages are authenticated, their signatures verified, and their
//! nonces checked against a bounded replay cache, in that order. Outbound
//! messages are signed over the plaintext payload and then optionally
//! encrypted.

#![warn(missing_docs, clippy::pedantic)]

pub mod auth;
pub mod cipher;
mod envelope;
mod error;
pub mod policy;
pub mod replay;
pub mod signature;

pub use auth::{
    ApiKeyVerifier, Authenticator, HmacKey, HmacVerifier, JwtConfig, JwtVerifier, MtlsVerifier,
    bearer_credentials, hmac_credential, mtls_credentials,
};
pub use cipher::AesGcmCipher;
pub use envelope::{Admission, SecurityConfig, SecurityEnvelope, SecurityEnvelopeBuilder};
pub use error::{SecurityError, SecurityResult};
pub use policy::{AccessDecision, AccessPolicy, AccessRequest, AccessRule, RuleBasedPolicy, RuleMatcher};
pub use replay::ReplayCache;
pub use signature::{MessageSigner, SignatureVerifier, SigningSecret, VerificationKey};
