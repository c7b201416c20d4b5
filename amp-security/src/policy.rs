//! Capability access policy evaluated after authentication.

use std::collections::BTreeSet;
use std::sync::{PoisonError, RwLock};

use amp_primitives::{AgentId, CapabilityId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{SecurityError, SecurityResult};

/// Who wants to invoke what.
#[derive(Clone, Debug)]
pub struct AccessRequest<'a> {
    /// Authenticated caller, `None` when authentication is not required and
    /// no credentials were presented.
    pub agent: Option<&'a AgentId>,
    /// Capability being invoked.
    pub capability: &'a CapabilityId,
}

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AccessDecision {
    /// Invocation may proceed.
    Allow,
    /// Invocation is refused.
    Deny {
        /// Explanation recorded in logs.
        reason: String,
    },
}

impl AccessDecision {
    /// Returns a deny decision with an explanatory reason.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self::Deny {
            reason: reason.into(),
        }
    }

    /// Returns true when the decision allows the invocation.
    #[must_use]
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Trait implemented by access policies.
#[async_trait]
pub trait AccessPolicy: Send + Sync {
    /// Evaluates the supplied request.
    async fn evaluate(&self, request: &AccessRequest<'_>) -> AccessDecision;
}

/// Matches a request by capability and caller.
#[derive(Debug, Clone, Default)]
pub struct RuleMatcher {
    capability: Option<CapabilityId>,
    agents: BTreeSet<AgentId>,
}

impl RuleMatcher {
    /// Creates a matcher that accepts every request.
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    /// Creates a matcher targeting one capability.
    #[must_use]
    pub fn for_capability(capability: CapabilityId) -> Self {
        Self {
            capability: Some(capability),
            agents: BTreeSet::new(),
        }
    }

    /// Narrows the matcher to the listed callers.
    #[must_use]
    pub fn with_agents<I>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = AgentId>,
    {
        self.agents.extend(agents);
        self
    }

    fn matches(&self, request: &AccessRequest<'_>) -> bool {
        self.capability
            .as_ref()
            .is_none_or(|expected| expected == request.capability)
            && (self.agents.is_empty()
                || request.agent.is_some_and(|agent| self.agents.contains(agent)))
    }
}

/// Rule consisting of a matcher and a resulting decision.
#[derive(Debug, Clone)]
pub struct AccessRule {
    name: String,
    matcher: RuleMatcher,
    decision: AccessDecision,
}

impl AccessRule {
    /// Creates a new rule.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::InvalidConfig`] when the rule name is empty.
    pub fn new(
        name: impl Into<String>,
        matcher: RuleMatcher,
        decision: AccessDecision,
    ) -> SecurityResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(SecurityError::config("rule name cannot be empty"));
        }
        Ok(Self {
            name,
            matcher,
            decision,
        })
    }

    /// Rule allowing only `agents` to call `capability`, denying everyone else.
    ///
    /// # Errors
    ///
    /// Never fails for a non-empty capability id; mirrors [`AccessRule::new`].
    pub fn allow_list<I>(capability: CapabilityId, agents: I) -> SecurityResult<[Self; 2]>
    where
        I: IntoIterator<Item = AgentId>,
    {
        let allow = Self::new(
            format!("allow:{capability}"),
            RuleMatcher::for_capability(capability.clone()).with_agents(agents),
            AccessDecision::Allow,
        )?;
        let deny = Self::new(
            format!("deny:{capability}"),
            RuleMatcher::for_capability(capability.clone()),
            AccessDecision::deny(format!("caller not on allow list for {capability}")),
        )?;
        Ok([allow, deny])
    }

    /// Returns the rule name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// First-match rule list with a default decision.
#[derive(Debug)]
pub struct RuleBasedPolicy {
    rules: RwLock<Vec<AccessRule>>,
    default_decision: AccessDecision,
}

impl Default for RuleBasedPolicy {
    fn default() -> Self {
        Self::allow_all()
    }
}

impl RuleBasedPolicy {
    /// Constructs a policy with the provided default decision.
    #[must_use]
    pub fn new(default_decision: AccessDecision) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            default_decision,
        }
    }

    /// Policy that allows everything until rules are added.
    #[must_use]
    pub fn allow_all() -> Self {
        Self::new(AccessDecision::Allow)
    }

    /// Appends a rule; rules are evaluated in insertion order.
    pub fn add_rule(&self, rule: AccessRule) {
        self.rules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(rule);
    }
}

#[async_trait]
impl AccessPolicy for RuleBasedPolicy {
    async fn evaluate(&self, request: &AccessRequest<'_>) -> AccessDecision {
        let guard = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        for rule in guard.iter() {
            if rule.matcher.matches(request) {
                debug!(rule = rule.name(), capability = %request.capability, "access rule matched");
                return rule.decision.clone();
            }
        }
        self.default_decision.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cap(id: &str) -> CapabilityId {
        CapabilityId::new(id).unwrap()
    }

    fn agent(id: &str) -> AgentId {
        AgentId::new(id).unwrap()
    }

    #[tokio::test]
    async fn allow_list_admits_only_listed_agents() {
        let policy = RuleBasedPolicy::allow_all();
        for rule in AccessRule::allow_list(cap("billing"), [agent("agent-a")]).unwrap() {
            policy.add_rule(rule);
        }

        let billing = cap("billing");
        let a = agent("agent-a");
        let b = agent("agent-b");

        let decision = policy
            .evaluate(&AccessRequest { agent: Some(&a), capability: &billing })
            .await;
        assert!(decision.is_allow());

        let decision = policy
            .evaluate(&AccessRequest { agent: Some(&b), capability: &billing })
            .await;
        assert!(!decision.is_allow());

        let decision = policy
            .evaluate(&AccessRequest { agent: None, capability: &billing })
            .await;
        assert!(!decision.is_allow());

        let other = cap("echo");
        let decision = policy
            .evaluate(&AccessRequest { agent: Some(&b), capability: &other })
            .await;
        assert!(decision.is_allow());
    }

    #[tokio::test]
    async fn default_decision_applies_when_no_rules_match() {
        let policy = RuleBasedPolicy::new(AccessDecision::deny("closed"));
        let echo = cap("echo");
        let decision = policy
            .evaluate(&AccessRequest { agent: None, capability: &echo })
            .await;
        assert_eq!(decision, AccessDecision::deny("closed"));
    }

    #[test]
    fn rule_name_required() {
        assert!(AccessRule::new(" ", RuleMatcher::any(), AccessDecision::Allow).is_err());
    }
}
