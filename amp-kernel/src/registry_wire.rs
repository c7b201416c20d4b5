//! Payloads exchanged with the mesh registry agent.
//!
//! Registration calls go to the `registration` capability with an `action`
//! discriminator; lookups go to the `discovery` capability.

use std::collections::BTreeMap;

use amp_primitives::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Capability id of the registration service.
pub const REGISTRATION_CAPABILITY: &str = "registration";
/// Capability id of the discovery service.
pub const DISCOVERY_CAPABILITY: &str = "discovery";

/// One advertised capability version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRecord {
    /// Capability id.
    pub id: String,
    /// Semantic version.
    pub version: String,
}

/// Registration payload emitted by agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Registering agent.
    pub agent_id: AgentId,
    /// Human readable agent name.
    pub name: String,
    /// Agent version.
    pub version: String,
    /// Capabilities advertised by the agent.
    pub capabilities: Vec<CapabilityRecord>,
    /// Address at which the agent's binding is reachable, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Free-form metadata such as framework or tags.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// Identifies the agent for heartbeat and deregistration calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRef {
    /// Agent id.
    pub agent_id: AgentId,
}

/// Parameters of the `registration` capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RegistrationAction {
    /// Adds or refreshes the agent record.
    Register(RegisterRequest),
    /// Marks the agent alive.
    Heartbeat(AgentRef),
    /// Removes the agent record.
    Deregister(AgentRef),
}

/// Result of `register` and `deregister`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// Whether the registry applied the change.
    pub success: bool,
    /// Agent acknowledged by the registry.
    pub agent_id: AgentId,
    /// Informational message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Result of `heartbeat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// Whether the heartbeat was recorded.
    pub success: bool,
    /// The registry lost the record; the agent must register again.
    #[serde(default)]
    pub needs_register: bool,
    /// Agent the heartbeat was recorded for.
    pub agent_id: AgentId,
    /// Registry time of the heartbeat.
    pub timestamp: DateTime<Utc>,
}

/// Parameters of the `discovery` capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverRequest {
    /// Capability id to look for.
    pub capability: String,
    /// Optional version constraint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Agent reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Agent id.
    pub agent_id: AgentId,
    /// Human readable name.
    pub name: String,
    /// Agent version.
    pub version: String,
    /// Advertised capabilities.
    pub capabilities: Vec<CapabilityRecord>,
    /// Binding address, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Health as seen by the registry.
    pub status: AgentStatus,
    /// Last heartbeat observed by the registry.
    pub last_heartbeat: DateTime<Utc>,
    /// First registration time.
    pub registered_at: DateTime<Utc>,
}

/// Result of `discovery`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverResponse {
    /// Capability that was queried.
    pub capability: String,
    /// Matching agents.
    pub agents: Vec<AgentRecord>,
}

/// Agent health reported by the registry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Heartbeats are current.
    Online,
    /// Heartbeats stopped.
    Offline,
    /// Online but reporting degraded health.
    Degraded,
}
