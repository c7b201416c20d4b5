//! Serializable context records and creation options.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use amp_primitives::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lineage pointers; plain ids into the store arena.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lineage {
    /// Context this one was forked from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_context_id: Option<String>,
    /// First ancestor of the fork chain; a root context points at itself.
    pub root_context_id: String,
}

/// Agents allowed to read or write a context. Empty lists are open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControl {
    /// Agents allowed to read.
    #[serde(default)]
    pub read: BTreeSet<AgentId>,
    /// Agents allowed to write.
    #[serde(default)]
    pub write: BTreeSet<AgentId>,
}

impl AccessControl {
    /// Whether `agent` may read.
    #[must_use]
    pub fn can_read(&self, agent: Option<&AgentId>) -> bool {
        Self::allows(&self.read, agent)
    }

    /// Whether `agent` may write.
    #[must_use]
    pub fn can_write(&self, agent: Option<&AgentId>) -> bool {
        Self::allows(&self.write, agent)
    }

    fn allows(list: &BTreeSet<AgentId>, agent: Option<&AgentId>) -> bool {
        list.is_empty() || agent.is_some_and(|agent| list.contains(agent))
    }
}

/// Full state of a context, as persisted by backing stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    /// Context id.
    pub id: String,
    /// Session bound to the context, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry time; the context never expires when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Memory visible to every participant.
    #[serde(default)]
    pub shared_memory: Map<String, Value>,
    /// Private memory partitioned by agent.
    #[serde(default)]
    pub agent_memory: BTreeMap<AgentId, Map<String, Value>>,
    /// Fork lineage.
    pub lineage: Lineage,
    /// Access lists.
    #[serde(default)]
    pub access_control: AccessControl,
}

impl ContextSnapshot {
    /// Whether the snapshot has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

/// Options for creating a context.
#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    /// Session to bind the new context to.
    pub session_id: Option<String>,
    /// Lifetime; the store default applies when absent.
    pub ttl: Option<Duration>,
    /// Access lists.
    pub access_control: AccessControl,
    /// Initial shared memory.
    pub shared_memory: Map<String, Value>,
}

impl ContextOptions {
    /// Options binding the context to `session_id`.
    #[must_use]
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    /// Sets the lifetime.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the access lists.
    #[must_use]
    pub fn with_access_control(mut self, access_control: AccessControl) -> Self {
        self.access_control = access_control;
        self
    }
}
