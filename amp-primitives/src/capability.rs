//! Capability descriptors shared across the agent runtime.

use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};
use std::num::NonZeroU32;
use std::str::FromStr;

use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

const MAX_ID_LEN: usize = 64;
const MAX_DESCRIPTION_LEN: usize = 1024;

/// Identifier for a capability that an agent may expose.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CapabilityId(String);

impl CapabilityId {
    /// Creates a new capability identifier after validating its format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCapabilityId`] if the supplied identifier is empty,
    /// too long, or contains unsupported characters.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_identifier(&id)?;
        Ok(Self(id))
    }

    /// Returns the capability identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CapabilityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CapabilityId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<CapabilityId> for String {
    fn from(value: CapabilityId) -> Self {
        value.0
    }
}

impl FromStr for CapabilityId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

fn validate_identifier(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidCapabilityId {
            id: String::new(),
            reason: "identifier cannot be empty".into(),
        });
    }

    if id.len() > MAX_ID_LEN {
        return Err(Error::InvalidCapabilityId {
            id: id.into(),
            reason: format!("identifier length must be <= {MAX_ID_LEN}"),
        });
    }

    if !id
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '-' | '_' | '.'))
    {
        return Err(Error::InvalidCapabilityId {
            id: id.into(),
            reason: "identifier must contain lowercase alphanumeric, dash, underscore, or dot"
                .into(),
        });
    }

    Ok(())
}

/// Parses a semantic version string, mapping failures into [`Error::InvalidVersion`].
///
/// # Errors
///
/// Returns [`Error::InvalidVersion`] when the input is not a valid semantic version.
pub fn parse_version(input: &str) -> Result<Version> {
    Version::parse(input.trim()).map_err(|source| Error::InvalidVersion {
        input: input.to_owned(),
        source,
    })
}

/// Token bucket limit applied per (caller, capability).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Bucket size: requests admitted within one window.
    pub requests: NonZeroU32,
    /// Window over which the bucket fully replenishes, in milliseconds.
    pub window_ms: u64,
}

/// Execution constraints declared by a capability.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct CapabilityConstraints {
    /// Maximum serialized size of the request parameters, in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_input_length: Option<usize>,
    /// Languages accepted in `parameters.language`; empty means unrestricted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supported_languages: Vec<String>,
    /// Upper bound on handler execution time, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    /// Optional per-caller rate limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,
}

/// Describes a versioned capability exposed by an agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    id: CapabilityId,
    version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default)]
    input_schema: Value,
    #[serde(default)]
    output_schema: Value,
    #[serde(default)]
    constraints: CapabilityConstraints,
}

impl Capability {
    /// Starts building a capability descriptor.
    #[must_use]
    pub fn builder(id: CapabilityId) -> CapabilityBuilder {
        CapabilityBuilder {
            id,
            version: None,
            description: None,
            input_schema: Value::Null,
            output_schema: Value::Null,
            constraints: CapabilityConstraints::default(),
        }
    }

    /// Returns the unique capability identifier.
    #[must_use]
    pub fn id(&self) -> &CapabilityId {
        &self.id
    }

    /// Semantic version of the capability contract.
    #[must_use]
    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Optional capability description.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// JSON schema describing accepted parameters. `null` accepts anything.
    #[must_use]
    pub fn input_schema(&self) -> &Value {
        &self.input_schema
    }

    /// JSON schema describing produced results. `null` accepts anything.
    #[must_use]
    pub fn output_schema(&self) -> &Value {
        &self.output_schema
    }

    /// Declared execution constraints.
    #[must_use]
    pub fn constraints(&self) -> &CapabilityConstraints {
        &self.constraints
    }
}

/// Builder for [`Capability`].
#[derive(Debug)]
pub struct CapabilityBuilder {
    id: CapabilityId,
    version: Option<Version>,
    description: Option<String>,
    input_schema: Value,
    output_schema: Value,
    constraints: CapabilityConstraints,
}

impl CapabilityBuilder {
    /// Sets the semantic version of the capability.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidVersion`] if the version string is not valid semver.
    pub fn version(mut self, version: &str) -> Result<Self> {
        self.version = Some(parse_version(version)?);
        Ok(self)
    }

    /// Sets an optional description.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCapability`] if the description exceeds the
    /// maximum supported length.
    pub fn description(mut self, description: impl Into<String>) -> Result<Self> {
        let description = description.into();
        if description.len() > MAX_DESCRIPTION_LEN {
            return Err(Error::InvalidCapability {
                reason: format!("description length must be <= {MAX_DESCRIPTION_LEN}"),
            });
        }
        self.description = Some(description);
        Ok(self)
    }

    /// Sets the input schema.
    #[must_use]
    pub fn input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    /// Sets the output schema.
    #[must_use]
    pub fn output_schema(mut self, schema: Value) -> Self {
        self.output_schema = schema;
        self
    }

    /// Replaces the execution constraints.
    #[must_use]
    pub fn constraints(mut self, constraints: CapabilityConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// Finalises the capability descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCapability`] if the version is missing, a schema
    /// is neither `null` nor an object, or the constraints are inconsistent.
    pub fn build(self) -> Result<Capability> {
        let version = self.version.ok_or_else(|| Error::InvalidCapability {
            reason: "version must be provided".into(),
        })?;

        for (label, schema) in [("input", &self.input_schema), ("output", &self.output_schema)] {
            if !(schema.is_null() || schema.is_object()) {
                return Err(Error::InvalidCapability {
                    reason: format!("{label} schema must be an object"),
                });
            }
        }

        if let Some(limit) = self.constraints.rate_limit {
            if limit.window_ms == 0 {
                return Err(Error::InvalidCapability {
                    reason: "rate limit window must be greater than zero".into(),
                });
            }
        }

        if self.constraints.response_time_ms == Some(0) {
            return Err(Error::InvalidCapability {
                reason: "response time must be greater than zero".into(),
            });
        }

        let languages: BTreeSet<String> = self
            .constraints
            .supported_languages
            .iter()
            .map(|lang| lang.trim().to_ascii_lowercase())
            .filter(|lang| !lang.is_empty())
            .collect();

        Ok(Capability {
            id: self.id,
            version,
            description: self.description,
            input_schema: self.input_schema,
            output_schema: self.output_schema,
            constraints: CapabilityConstraints {
                supported_languages: languages.into_iter().collect(),
                ..self.constraints
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn build_capability_success() {
        let id = CapabilityId::new("text-analysis").expect("id");
        let capability = Capability::builder(id)
            .version("1.2.0")
            .and_then(|b| b.description("Sentiment and entity extraction"))
            .map(|b| b.input_schema(json!({"type": "object"})))
            .map(|b| {
                b.constraints(CapabilityConstraints {
                    supported_languages: vec!["EN".into(), "fr".into(), "en".into()],
                    ..CapabilityConstraints::default()
                })
            })
            .and_then(CapabilityBuilder::build)
            .expect("build");

        assert_eq!(capability.version(), &Version::new(1, 2, 0));
        assert_eq!(capability.constraints().supported_languages, ["en", "fr"]);
    }

    #[test]
    fn capability_requires_version() {
        let id = CapabilityId::new("no.version").expect("id");
        let err = Capability::builder(id).build().expect_err("should fail");
        assert!(matches!(err, Error::InvalidCapability { .. }));
    }

    #[test]
    fn rejects_non_object_schema() {
        let id = CapabilityId::new("bad.schema").expect("id");
        let err = Capability::builder(id)
            .version("1.0.0")
            .unwrap()
            .input_schema(json!("string"))
            .build()
            .expect_err("should fail");
        assert!(matches!(err, Error::InvalidCapability { .. }));
    }

    #[test]
    fn rejects_uppercase_id() {
        assert!(CapabilityId::new("Text").is_err());
    }
}
