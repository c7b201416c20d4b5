//! Wire codec for Agent Mesh Protocol messages.
//!
//! Decoding runs the size bound, JSON parse, protocol marker, required-field,
//! typed deserialisation, clock-skew, decryption, and payload-shape checks in
//! that order, stopping at the first failure. Encoding produces canonical,
//! key-sorted JSON so identical logical messages always sign identically.

#![warn(missing_docs, clippy::pedantic)]

mod canonical;
mod codec;
mod error;
mod validate;

pub use canonical::{canonical_json, signing_string};
pub use codec::{CipherError, Codec, CodecConfig, PayloadCipher, Peeked, encode};
pub use error::{CodecError, CodecResult};
