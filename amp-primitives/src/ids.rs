//! Agent, message, and context identifier types.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;

const MAX_AGENT_ID_LEN: usize = 128;
const ANONYMOUS: &str = "anonymous";

/// Unique identifier for an agent participating in the AMP mesh.
///
/// Agent ids are free-form but restricted to printable ASCII without
/// whitespace so they can be embedded in signing strings and log fields.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentId(String);

impl AgentId {
    /// Creates an agent identifier after validating its format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAgentId`] when the identifier is empty, too long,
    /// or contains whitespace/control characters.
    pub fn new(id: impl Into<String>) -> Result<Self, Error> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::InvalidAgentId {
                id,
                reason: "identifier cannot be empty".into(),
            });
        }
        if id.len() > MAX_AGENT_ID_LEN {
            return Err(Error::InvalidAgentId {
                id,
                reason: format!("identifier length must be <= {MAX_AGENT_ID_LEN}"),
            });
        }
        if !id.chars().all(|c| c.is_ascii_graphic()) {
            return Err(Error::InvalidAgentId {
                id,
                reason: "identifier must be printable ASCII without whitespace".into(),
            });
        }
        Ok(Self(id))
    }

    /// Generates a random agent identifier.
    #[must_use]
    pub fn random() -> Self {
        Self(format!("agent-{}", Uuid::new_v4()))
    }

    /// Reserved identifier standing in for unauthenticated callers.
    #[must_use]
    pub fn anonymous() -> Self {
        Self(ANONYMOUS.to_owned())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for AgentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AgentId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AgentId> for String {
    fn from(value: AgentId) -> Self {
        value.0
    }
}

impl FromStr for AgentId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Generates a fresh message identifier.
#[must_use]
pub fn new_message_id() -> String {
    format!("msg-{}", Uuid::new_v4())
}

/// Generates a fresh context identifier.
#[must_use]
pub fn new_context_id() -> String {
    format!("ctx-{}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_agent_id() {
        let id = AgentId::random();
        let parsed = id.to_string().parse::<AgentId>().expect("parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn rejects_whitespace() {
        assert!(AgentId::new("agent a").is_err());
        assert!(AgentId::new("").is_err());
    }

    #[test]
    fn deserialization_validates() {
        let err = serde_json::from_str::<AgentId>("\"bad id\"");
        assert!(err.is_err());
        let ok: AgentId = serde_json::from_str("\"agent-a\"").unwrap();
        assert_eq!(ok.as_str(), "agent-a");
    }
}
