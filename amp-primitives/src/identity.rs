//! Agent identity advertised to peers and resolved by authentication.

use serde::{Deserialize, Serialize};

use crate::{AgentId, PROTOCOL_VERSION};

/// Immutable description of who an agent is.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AgentIdentity {
    id: AgentId,
    name: String,
    version: String,
    framework: String,
    protocol_version: String,
}

impl AgentIdentity {
    /// Starts building an [`AgentIdentity`].
    #[must_use]
    pub fn builder(id: AgentId) -> AgentIdentityBuilder {
        AgentIdentityBuilder {
            id,
            name: None,
            version: None,
            framework: None,
            protocol_version: None,
        }
    }

    /// Returns the agent identifier.
    #[must_use]
    pub fn id(&self) -> &AgentId {
        &self.id
    }

    /// Returns the agent display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the version string identifying the agent build.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Returns the framework tag (e.g. `native`, `langchain`).
    #[must_use]
    pub fn framework(&self) -> &str {
        &self.framework
    }

    /// Returns the wire protocol marker the agent speaks.
    #[must_use]
    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }
}

/// Builder for [`AgentIdentity`].
#[derive(Debug)]
pub struct AgentIdentityBuilder {
    id: AgentId,
    name: Option<String>,
    version: Option<String>,
    framework: Option<String>,
    protocol_version: Option<String>,
}

impl AgentIdentityBuilder {
    /// Sets the human-readable name for the agent.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidIdentity`] when the name is empty.
    pub fn name(mut self, name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(crate::Error::InvalidIdentity {
                reason: "identity name cannot be empty".into(),
            });
        }
        self.name = Some(name);
        Ok(self)
    }

    /// Sets the agent build version.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidIdentity`] when the version string is empty.
    pub fn version(mut self, version: impl Into<String>) -> crate::Result<Self> {
        let version = version.into();
        if version.trim().is_empty() {
            return Err(crate::Error::InvalidIdentity {
                reason: "identity version cannot be empty".into(),
            });
        }
        self.version = Some(version);
        Ok(self)
    }

    /// Sets the framework tag. Defaults to `native`.
    #[must_use]
    pub fn framework(mut self, framework: impl Into<String>) -> Self {
        self.framework = Some(framework.into());
        self
    }

    /// Overrides the protocol marker. Defaults to [`PROTOCOL_VERSION`].
    #[must_use]
    pub fn protocol_version(mut self, protocol_version: impl Into<String>) -> Self {
        self.protocol_version = Some(protocol_version.into());
        self
    }

    /// consumes builder and returns the identity.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidIdentity`] if mandatory fields are missing.
    pub fn build(self) -> crate::Result<AgentIdentity> {
        let name = self.name.ok_or_else(|| crate::Error::InvalidIdentity {
            reason: "identity name must be provided".into(),
        })?;
        let version = self
            .version
            .ok_or_else(|| crate::Error::InvalidIdentity {
                reason: "identity version must be provided".into(),
            })?;

        Ok(AgentIdentity {
            id: self.id,
            name,
            version,
            framework: self.framework.unwrap_or_else(|| "native".to_owned()),
            protocol_version: self
                .protocol_version
                .unwrap_or_else(|| PROTOCOL_VERSION.to_owned()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_identity() {
        let identity = AgentIdentity::builder(AgentId::new("agent-a").unwrap())
            .name("analyzer")
            .unwrap()
            .version("1.2.3")
            .unwrap()
            .framework("crewai")
            .build()
            .unwrap();

        assert_eq!(identity.name(), "analyzer");
        assert_eq!(identity.version(), "1.2.3");
        assert_eq!(identity.framework(), "crewai");
        assert_eq!(identity.protocol_version(), PROTOCOL_VERSION);
    }

    #[test]
    fn name_is_required() {
        let result = AgentIdentity::builder(AgentId::random()).build();
        assert!(result.is_err());
    }
}
